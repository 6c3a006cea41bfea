use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("channel full")]
    Full,
    #[error("channel closed")]
    Closed,
}

/// Outbound side of the event channel as seen from the sandbox.
/// `post` never blocks; delivery is best-effort.
pub trait ReportTransport: Send + Sync {
    fn post(&self, message: Value) -> Result<(), TransportError>;
}

/// Inbound channel sender — handed to the sandbox.
pub type InboundSender = mpsc::Sender<Value>;
/// Inbound channel receiver — consumed by the host session.
pub type InboundReceiver = mpsc::Receiver<Value>;

/// Create an inbound channel with the given buffer size.
pub fn channel(buffer: usize) -> (InboundSender, InboundReceiver) {
    mpsc::channel(buffer.max(1))
}

impl ReportTransport for mpsc::Sender<Value> {
    fn post(&self, message: Value) -> Result<(), TransportError> {
        self.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}
