//! Provider layer for the code-generation capability consumed by the repair loop.

pub mod http;
pub mod provider;
