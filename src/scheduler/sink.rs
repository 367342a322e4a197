//! Output sinks.
//!
//! The scheduler pushes text deltas and end-of-session markers to an
//! [`OutputSink`], in emission order per key.

use std::collections::BTreeMap;

use crate::core::session::FinishReason;

/// Receives generated text per session key.
pub trait OutputSink<K> {
    /// Newly finalized text for `key`.
    fn emit(&mut self, key: &K, delta: &str);

    /// The session under `key` ended.
    fn emit_end(&mut self, key: &K, reason: FinishReason);
}

/// One recorded sink call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Text(String),
    End(FinishReason),
}

/// Records every event per key.
#[derive(Debug, Clone)]
pub struct CollectingSink<K> {
    events: BTreeMap<K, Vec<SinkEvent>>,
}

impl<K: Ord> Default for CollectingSink<K> {
    fn default() -> Self {
        Self {
            events: BTreeMap::new(),
        }
    }
}

impl<K: Ord> CollectingSink<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded for `key`.
    pub fn events(&self, key: &K) -> &[SinkEvent] {
        self.events.get(key).map_or(&[], Vec::as_slice)
    }

    /// Concatenated text for `key`.
    pub fn text(&self, key: &K) -> String {
        self.events(key)
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Text(text) => Some(text.as_str()),
                SinkEvent::End(_) => None,
            })
            .collect()
    }

    /// Finish reasons recorded for `key`, in order.
    pub fn ends(&self, key: &K) -> Vec<FinishReason> {
        self.events(key)
            .iter()
            .filter_map(|event| match event {
                SinkEvent::End(reason) => Some(*reason),
                SinkEvent::Text(_) => None,
            })
            .collect()
    }
}

impl<K: Ord + Clone> OutputSink<K> for CollectingSink<K> {
    fn emit(&mut self, key: &K, delta: &str) {
        self.events
            .entry(key.clone())
            .or_default()
            .push(SinkEvent::Text(delta.to_string()));
    }

    fn emit_end(&mut self, key: &K, reason: FinishReason) {
        self.events
            .entry(key.clone())
            .or_default()
            .push(SinkEvent::End(reason));
    }
}

/// Accumulates one running transcript per key, separating sessions with a marker.
#[derive(Debug, Clone)]
pub struct TranscriptSink<K> {
    end_marker: String,
    transcripts: BTreeMap<K, String>,
}

impl<K: Ord + Clone> TranscriptSink<K> {
    pub fn new(end_marker: impl Into<String>) -> Self {
        Self {
            end_marker: end_marker.into(),
            transcripts: BTreeMap::new(),
        }
    }

    pub fn transcript(&self, key: &K) -> Option<&str> {
        self.transcripts.get(key).map(String::as_str)
    }

    /// All transcripts in key order.
    pub fn transcripts(&self) -> impl Iterator<Item = (&K, &str)> {
        self.transcripts.iter().map(|(k, v)| (k, v.as_str()))
    }
}

impl<K: Ord + Clone> OutputSink<K> for TranscriptSink<K> {
    fn emit(&mut self, key: &K, delta: &str) {
        self.transcripts.entry(key.clone()).or_default().push_str(delta);
    }

    fn emit_end(&mut self, key: &K, _reason: FinishReason) {
        let marker = self.end_marker.clone();
        self.transcripts.entry(key.clone()).or_default().push_str(&marker);
    }
}
