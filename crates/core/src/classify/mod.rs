//! Host-side normalization and deduplication of inbound reports.

pub mod decode;
pub mod dedup;
pub mod normalize;

use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;

use crate::channel;
use crate::types::PreviewError;
use dedup::Deduplicator;

/// Turns raw channel messages into deduplicated `PreviewError`s.
#[derive(Debug)]
pub struct Classifier {
    dedup: Deduplicator,
    received: u64,
    discarded: u64,
    duplicates: u64,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifierStats {
    pub received: u64,
    pub discarded: u64,
    pub duplicates: u64,
}

impl Classifier {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            dedup: Deduplicator::new(dedup_window),
            received: 0,
            discarded: 0,
            duplicates: 0,
        }
    }

    /// Validate, decode and dedup one inbound message. Never fails: malformed
    /// or duplicate input yields `None`.
    pub fn ingest(&mut self, message: &Value, now: Instant) -> Option<PreviewError> {
        self.received += 1;
        let Some(payload) = channel::open(message) else {
            self.discarded += 1;
            tracing::debug!("inbound message without a valid envelope, discarded");
            return None;
        };
        let Some(error) = decode::decode(payload, Utc::now()) else {
            self.discarded += 1;
            tracing::debug!("unclassifiable report, discarded");
            return None;
        };
        if !self.dedup.admit(&error.fingerprint(), now) {
            self.duplicates += 1;
            tracing::debug!(kind = %error.kind, message = %error.message, "duplicate report suppressed");
            return None;
        }
        Some(error)
    }

    pub fn stats(&self) -> ClassifierStats {
        ClassifierStats {
            received: self.received,
            discarded: self.discarded,
            duplicates: self.duplicates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::seal;
    use serde_json::json;

    fn report(kind: &str, message: &str) -> Value {
        seal(json!({ "kind": kind, "message": message, "severity": "error" }))
    }

    #[test]
    fn identical_reports_in_window_forward_once() {
        let mut c = Classifier::new(Duration::from_secs(3));
        let t0 = Instant::now();
        assert!(c.ingest(&report("script", "boom"), t0).is_some());
        assert!(c.ingest(&report("script", "[preview] boom"), t0 + Duration::from_millis(500)).is_none());
        assert_eq!(c.stats().duplicates, 1);
    }

    #[test]
    fn malformed_envelopes_never_reach_decoding() {
        let mut c = Classifier::new(Duration::from_secs(3));
        let t0 = Instant::now();
        assert!(c.ingest(&json!({ "payload": { "kind": "script", "message": "x" } }), t0).is_none());
        assert!(c.ingest(&json!({ "type": "other", "payload": { "kind": "script", "message": "x" } }), t0).is_none());
        assert!(c.ingest(&json!(null), t0).is_none());
        assert_eq!(c.stats(), ClassifierStats { received: 3, discarded: 3, duplicates: 0 });
    }
}
