use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use super::RepairFailure;
use crate::types::{CircuitBreakerState, FilePatch, RuntimeRepairRequest};

/// Observer of the repair loop. All methods default to no-ops.
pub trait RepairListener: Send + Sync {
    fn on_start(&self, _request: &RuntimeRepairRequest) {}

    fn on_success(&self, _request: &RuntimeRepairRequest, _patches: &[FilePatch]) {}

    fn on_error(&self, _request: &RuntimeRepairRequest, _reason: &RepairFailure) {}

    fn on_circuit_breaker_tripped(&self, _reason: &str, _stats: &CircuitBreakerState) {}
}

/// Repair notifications as owned values.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RepairEvent {
    Started {
        request: RuntimeRepairRequest,
    },
    Succeeded {
        request: RuntimeRepairRequest,
        patches: Vec<FilePatch>,
    },
    Failed {
        request: RuntimeRepairRequest,
        reason: String,
    },
    Tripped {
        reason: String,
        stats: CircuitBreakerState,
    },
}

impl RepairEvent {
    pub fn attempt_id(&self) -> Option<u64> {
        match self {
            RepairEvent::Started { request }
            | RepairEvent::Succeeded { request, .. }
            | RepairEvent::Failed { request, .. } => Some(request.attempt_id),
            RepairEvent::Tripped { .. } => None,
        }
    }
}

/// Forwards every notification as a [`RepairEvent`] on an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<RepairEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RepairEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: RepairEvent) {
        // Receiver gone means nobody is watching anymore.
        let _ = self.tx.send(event);
    }
}

impl RepairListener for ChannelListener {
    fn on_start(&self, request: &RuntimeRepairRequest) {
        self.send(RepairEvent::Started {
            request: request.clone(),
        });
    }

    fn on_success(&self, request: &RuntimeRepairRequest, patches: &[FilePatch]) {
        self.send(RepairEvent::Succeeded {
            request: request.clone(),
            patches: patches.to_vec(),
        });
    }

    fn on_error(&self, request: &RuntimeRepairRequest, reason: &RepairFailure) {
        self.send(RepairEvent::Failed {
            request: request.clone(),
            reason: reason.to_string(),
        });
    }

    fn on_circuit_breaker_tripped(&self, reason: &str, stats: &CircuitBreakerState) {
        self.send(RepairEvent::Tripped {
            reason: reason.to_string(),
            stats: stats.clone(),
        });
    }
}

/// Logs every notification through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl RepairListener for TracingListener {
    fn on_start(&self, request: &RuntimeRepairRequest) {
        tracing::info!(
            attempt = request.attempt_id,
            kind = %request.error.kind,
            message = %request.error.message,
            "repair started"
        );
    }

    fn on_success(&self, request: &RuntimeRepairRequest, patches: &[FilePatch]) {
        tracing::info!(attempt = request.attempt_id, files = patches.len(), "repair applied");
    }

    fn on_error(&self, request: &RuntimeRepairRequest, reason: &RepairFailure) {
        tracing::warn!(attempt = request.attempt_id, reason = %reason, "repair failed");
    }

    fn on_circuit_breaker_tripped(&self, reason: &str, stats: &CircuitBreakerState) {
        tracing::warn!(
            reason,
            consecutive_failures = stats.consecutive_failures,
            total_attempts = stats.total_attempts,
            "repairs blocked"
        );
    }
}

/// Registered listeners, notified in registration order.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Vec<Arc<dyn RepairListener>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, listener: impl RepairListener + 'static) -> Self {
        self.inner.push(Arc::new(listener));
        self
    }

    pub fn push(&mut self, listener: Arc<dyn RepairListener>) {
        self.inner.push(listener);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("count", &self.inner.len()).finish()
    }
}

impl RepairListener for Listeners {
    fn on_start(&self, request: &RuntimeRepairRequest) {
        self.inner.iter().for_each(|l| l.on_start(request));
    }

    fn on_success(&self, request: &RuntimeRepairRequest, patches: &[FilePatch]) {
        self.inner.iter().for_each(|l| l.on_success(request, patches));
    }

    fn on_error(&self, request: &RuntimeRepairRequest, reason: &RepairFailure) {
        self.inner.iter().for_each(|l| l.on_error(request, reason));
    }

    fn on_circuit_breaker_tripped(&self, reason: &str, stats: &CircuitBreakerState) {
        self.inner
            .iter()
            .for_each(|l| l.on_circuit_breaker_tripped(reason, stats));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repair::GenerationError;
    use crate::types::{ErrorKind, PreviewError, RepairContext, RepairStatus};
    use chrono::Utc;

    fn request() -> RuntimeRepairRequest {
        RuntimeRepairRequest {
            attempt_id: 7,
            error: PreviewError::new(ErrorKind::Script, "boom"),
            context: RepairContext::default(),
            status: RepairStatus::Failed,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            failure: None,
            patched_paths: vec![],
        }
    }

    #[test]
    fn channel_listener_forwards_in_order() {
        let (listener, mut rx) = ChannelListener::new();
        let listeners = Listeners::new().with(listener).with(TracingListener);
        let req = request();
        listeners.on_start(&req);
        listeners.on_error(&req, &RepairFailure::Generation(GenerationError::Abandoned));
        listeners.on_circuit_breaker_tripped("3 consecutive repair failures", &CircuitBreakerState::default());

        assert!(matches!(rx.try_recv(), Ok(RepairEvent::Started { .. })));
        match rx.try_recv() {
            Ok(RepairEvent::Failed { request, reason }) => {
                assert_eq!(request.attempt_id, 7);
                assert!(reason.contains("abandoned"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let tripped = rx.try_recv().unwrap();
        assert_eq!(tripped.attempt_id(), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = RepairEvent::Tripped {
            reason: "r".into(),
            stats: CircuitBreakerState::default(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "tripped");
    }

    #[test]
    fn closed_receiver_is_harmless() {
        let (listener, rx) = ChannelListener::new();
        drop(rx);
        listener.on_start(&request());
    }
}
