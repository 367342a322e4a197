use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use candle_core::Device;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use multi_lora::adapter::{AdapterRegistry, SafetensorsAdapterSource};
use multi_lora::config::ServeConfig;
use multi_lora::core::PagedKvPool;
use multi_lora::engine::DryRunForward;
use multi_lora::scheduler::{BatchScheduler, TenantPromptSource, TranscriptSink};
use multi_lora::tokenizer::{load_tokenizer, TextCodec};
use multi_lora::Result;

#[derive(Parser, Debug)]
#[command(name = "multi-lora")]
#[command(about = "Serve many LoRA adapters over one base model with continuous batching")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Tokenizer path or HuggingFace model ID (defaults to the configured base model)
    #[arg(short, long)]
    tokenizer: Option<String>,

    /// Vocabulary size of the dry-run backend
    #[arg(long, default_value = "32000")]
    vocab_size: usize,

    /// Seed for sampling and the dry-run backend
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many steps
    #[arg(long)]
    max_steps: Option<usize>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "multi-lora failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let mut config = ServeConfig::from_file(&args.config)?;
    if args.seed.is_some() {
        config.scheduler.seed = args.seed;
    }

    let tokenizer_source = args.tokenizer.as_deref().unwrap_or(&config.base_model);
    let codec: Arc<dyn TextCodec> = Arc::new(load_tokenizer(tokenizer_source)?);

    let weight_paths: BTreeMap<String, PathBuf> = config
        .adapters
        .iter()
        .map(|(name, spec)| (name.clone(), spec.weight_path.clone()))
        .collect();
    let adapter_ids: Vec<String> = weight_paths.keys().cloned().collect();
    let adapters = AdapterRegistry::load_all(
        &SafetensorsAdapterSource::new(weight_paths, Device::Cpu),
        &adapter_ids,
    )?;

    let source =
        TenantPromptSource::from_specs(&config.adapters, codec.clone(), config.sampling.clone());
    let mut sink = TranscriptSink::new(config.scheduler.end_marker.clone());
    let mut model = DryRunForward::new(args.vocab_size, args.seed.unwrap_or(0));

    info!(
        base_model = %config.base_model,
        adapters = adapters.len(),
        pages = config.cache.num_pages,
        page_len = config.cache.page_len,
        "starting multi-lora"
    );

    let mut scheduler = BatchScheduler::new(
        config.scheduler.clone(),
        PagedKvPool::from_config(&config.cache)?,
        adapters,
        source,
        codec,
    );

    let stats = match args.max_steps {
        Some(max_steps) => {
            while !scheduler.is_finished() && scheduler.stats().steps < max_steps {
                scheduler.step(&mut model, &mut sink)?;
            }
            scheduler.abort_all()?;
            scheduler.stats()
        }
        None => scheduler.run(&mut model, &mut sink)?,
    };

    for (key, transcript) in sink.transcripts() {
        println!("===== {key} =====");
        println!("{transcript}");
    }
    info!(
        steps = stats.steps,
        tokens = stats.tokens_generated,
        sessions = stats.sessions_finished,
        preempted = stats.sessions_preempted,
        "done"
    );
    Ok(())
}
