//! Sandbox → host message transport.
//!
//! One-directional and at-most-once. The host treats every inbound message as
//! untrusted and validates the envelope tag before reading any payload field.

pub mod envelope;
pub mod transport;

pub use envelope::{ENVELOPE_TYPE, open, seal};
pub use transport::{InboundReceiver, InboundSender, ReportTransport, TransportError, channel};
