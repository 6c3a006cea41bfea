//! Runtime error capture and self-repair for sandboxed previews.
//!
//! The sandbox side ([`sandbox`]) instruments an untrusted execution context
//! and posts envelope reports over [`channel`]. The host side classifies them
//! ([`classify`]), guards repairs with a [`breaker`], and drives patch
//! generation through [`repair`], all inside one [`session`] per preview.

pub mod breaker;
pub mod channel;
pub mod classify;
pub mod config;
pub mod repair;
pub mod sandbox;
pub mod session;
pub mod types;

pub use config::MenderCfg;
pub use session::{PreviewSession, SessionHandle};
