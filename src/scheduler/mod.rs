//! Multi-adapter batch scheduling.
//!
//! This module handles:
//! - Batch formation grouped by phase and adapter
//! - Session key lifecycle and recycling
//! - Work sources and output sinks

pub mod batch;
pub mod plan;
pub mod sink;
pub mod source;

pub use batch::{BatchScheduler, KeyState, RunStats, StepReport, StopSignal};
pub use plan::{form_batch, AdapterRun, BatchPlan, SessionDescriptor};
pub use sink::{CollectingSink, OutputSink, SinkEvent, TranscriptSink};
pub use source::{Role, SessionKey, SessionSource, TenantPromptSource, WorkItem};
