use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::types::Fingerprint;

/// Tracks faults that came back after a repair was declared succeeded.
#[derive(Debug)]
pub struct RecurrenceTracker {
    threshold: u32,
    window: Duration,
    repaired: HashMap<Fingerprint, Watch>,
}

#[derive(Debug, Clone, Copy)]
struct Watch {
    repaired_at: Instant,
    recurrences: u32,
}

impl RecurrenceTracker {
    /// `threshold == 0` disables tracking.
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            repaired: HashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.threshold > 0
    }

    /// Start watching a fault whose repair just applied cleanly. A fault
    /// already under watch keeps its count and window start.
    pub fn note_repaired(&mut self, fingerprint: Fingerprint, now: Instant) {
        if !self.enabled() {
            return;
        }
        self.prune(now);
        self.repaired.entry(fingerprint).or_insert(Watch {
            repaired_at: now,
            recurrences: 0,
        });
    }

    /// Count one recurrence. Returns the recurrence count once it reaches
    /// the threshold.
    pub fn observe(&mut self, fingerprint: &Fingerprint, now: Instant) -> Option<u32> {
        if !self.enabled() {
            return None;
        }
        self.prune(now);
        let watch = self.repaired.get_mut(fingerprint)?;
        watch.recurrences += 1;
        (watch.recurrences >= self.threshold).then_some(watch.recurrences)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn clear(&mut self) {
        self.repaired.clear();
    }

    pub fn watched(&self) -> usize {
        self.repaired.len()
    }

    fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.repaired
            .retain(|_, w| now.saturating_duration_since(w.repaired_at) <= window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;

    fn fp(msg: &str) -> Fingerprint {
        Fingerprint {
            kind: ErrorKind::Script,
            message: msg.into(),
        }
    }

    #[test]
    fn unrepaired_faults_are_not_recurrences() {
        let mut r = RecurrenceTracker::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        assert_eq!(r.observe(&fp("a"), t0), None);
        assert_eq!(r.observe(&fp("a"), t0), None);
    }

    #[test]
    fn threshold_reached_within_window() {
        let mut r = RecurrenceTracker::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        r.note_repaired(fp("a"), t0);
        assert_eq!(r.observe(&fp("a"), t0 + Duration::from_secs(5)), None);
        assert_eq!(r.observe(&fp("b"), t0 + Duration::from_secs(6)), None);
        assert_eq!(r.observe(&fp("a"), t0 + Duration::from_secs(10)), Some(2));
    }

    #[test]
    fn repeated_repairs_keep_counting() {
        let mut r = RecurrenceTracker::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        r.note_repaired(fp("a"), t0);
        assert_eq!(r.observe(&fp("a"), t0 + Duration::from_secs(1)), None);
        r.note_repaired(fp("a"), t0 + Duration::from_secs(2));
        assert_eq!(r.observe(&fp("a"), t0 + Duration::from_secs(3)), Some(2));
    }

    #[test]
    fn watch_expires_after_window() {
        let mut r = RecurrenceTracker::new(1, Duration::from_secs(60));
        let t0 = Instant::now();
        r.note_repaired(fp("a"), t0);
        assert_eq!(r.observe(&fp("a"), t0 + Duration::from_secs(61)), None);
        assert_eq!(r.watched(), 0);
    }

    #[test]
    fn zero_threshold_disables() {
        let mut r = RecurrenceTracker::new(0, Duration::from_secs(60));
        let t0 = Instant::now();
        r.note_repaired(fp("a"), t0);
        assert_eq!(r.watched(), 0);
        assert_eq!(r.observe(&fp("a"), t0), None);
    }
}
