use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::types::Fingerprint;

/// Collapses repeated reports of the same fault within a time window.
///
/// The window is anchored at the first admitted report; dropped duplicates
/// do not extend it.
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    seen: HashMap<Fingerprint, Instant>,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Returns true if the report should be forwarded.
    pub fn admit(&mut self, fingerprint: &Fingerprint, now: Instant) -> bool {
        let window = self.window;
        self.seen
            .retain(|_, at| now.saturating_duration_since(*at) < window);
        if self.seen.contains_key(fingerprint) {
            return false;
        }
        self.seen.insert(fingerprint.clone(), now);
        true
    }

    pub fn tracked(&self) -> usize {
        self.seen.len()
    }
}
