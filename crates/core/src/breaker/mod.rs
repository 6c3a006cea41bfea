//! Per-session circuit breaker guarding the repair loop.
//!
//! Closed: repairs allowed. Tripped: repairs blocked until an explicit reset
//! or, when configured, a cooldown measured from the last attempt.

mod recurrence;

pub use recurrence::RecurrenceTracker;

use std::time::Instant;

use chrono::Utc;

use crate::config::BreakerConfig;
use crate::types::{CircuitBreakerState, Fingerprint};

/// Proof that an attempt was counted. Must be handed back exactly once via
/// [`CircuitBreaker::record_outcome`].
#[must_use = "every attempt must report exactly one outcome"]
#[derive(Debug)]
pub struct AttemptTicket {
    id: u64,
}

impl AttemptTicket {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Terminal outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
}

#[derive(Debug)]
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    state: CircuitBreakerState,
    last_attempt: Option<Instant>,
    next_ticket: u64,
    outstanding: Option<u64>,
    recurrence: RecurrenceTracker,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        let recurrence = RecurrenceTracker::new(cfg.recurrence_threshold, cfg.recurrence_window);
        Self {
            cfg,
            state: CircuitBreakerState::default(),
            last_attempt: None,
            next_ticket: 1,
            outstanding: None,
            recurrence,
        }
    }

    /// Whether a new attempt may start. Applies the cooldown reset first.
    pub fn check(&mut self, now: Instant) -> bool {
        if self.state.tripped
            && let Some(cooldown) = self.cfg.cooldown
            && self
                .last_attempt
                .is_none_or(|t| now.saturating_duration_since(t) >= cooldown)
        {
            tracing::info!(
                cooldown_secs = cooldown.as_secs(),
                "circuit breaker cooldown elapsed, closing"
            );
            self.close();
        }
        !self.state.tripped
    }

    /// Count a new attempt. The returned ticket carries the obligation to
    /// report its outcome.
    pub fn record_attempt(&mut self, now: Instant) -> AttemptTicket {
        debug_assert!(
            self.outstanding.is_none(),
            "attempt started while another is unreported"
        );
        let id = self.next_ticket;
        self.next_ticket += 1;
        self.outstanding = Some(id);
        self.state.total_attempts += 1;
        self.state.last_attempt_at = Some(Utc::now());
        self.last_attempt = Some(now);
        AttemptTicket { id }
    }

    /// Report the terminal outcome of an attempt. Returns the trip reason if
    /// this outcome tripped the breaker.
    pub fn record_outcome(&mut self, ticket: AttemptTicket, outcome: Outcome) -> Option<String> {
        if self.outstanding == Some(ticket.id) {
            self.outstanding = None;
        } else {
            tracing::warn!(ticket = ticket.id, "outcome for an attempt the breaker is not tracking");
        }

        match outcome {
            Outcome::Success => {
                self.state.total_successes += 1;
                self.state.consecutive_failures = 0;
                None
            }
            Outcome::Failure(cause) => {
                self.state.total_failures += 1;
                self.state.consecutive_failures += 1;
                let n = self.state.consecutive_failures;
                if n >= self.cfg.failure_threshold {
                    self.trip(format!("{n} consecutive repair failures; last: {cause}"))
                } else {
                    None
                }
            }
        }
    }

    /// Start watching a fault whose repair applied cleanly.
    pub fn note_repaired(&mut self, fingerprint: Fingerprint, now: Instant) {
        self.recurrence.note_repaired(fingerprint, now);
    }

    /// Record that a fault was seen again. Trips the breaker when the same
    /// fault keeps returning after successful-looking repairs.
    pub fn observe_recurrence(&mut self, fingerprint: &Fingerprint, now: Instant) -> Option<String> {
        let count = self.recurrence.observe(fingerprint, now)?;
        let window = self.recurrence.window().as_secs();
        self.trip(format!(
            "fault recurred {count} times within {window}s of a successful repair: {fingerprint}"
        ))
    }

    /// Operator reset: tripped → closed. Lifetime totals are kept.
    pub fn reset(&mut self) {
        if self.state.tripped {
            tracing::info!("circuit breaker reset by operator");
        }
        self.close();
        self.recurrence.clear();
    }

    pub fn is_tripped(&self) -> bool {
        self.state.tripped
    }

    pub fn state(&self) -> &CircuitBreakerState {
        &self.state
    }

    pub fn stats(&self) -> CircuitBreakerState {
        self.state.clone()
    }

    /// Trips at most once per closed period.
    fn trip(&mut self, reason: String) -> Option<String> {
        if self.state.tripped {
            return None;
        }
        tracing::warn!(reason = %reason, "circuit breaker tripped");
        self.state.tripped = true;
        self.state.tripped_reason = Some(reason.clone());
        Some(reason)
    }

    fn close(&mut self) {
        self.state.tripped = false;
        self.state.tripped_reason = None;
        self.state.consecutive_failures = 0;
    }
}
