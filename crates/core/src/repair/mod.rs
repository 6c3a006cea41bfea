//! Repair orchestration: patch generation, application and bookkeeping.

pub mod db;
pub mod fileset;
pub mod generator;
pub mod listener;
pub mod orchestrator;
pub mod prompt;

pub use fileset::{ApplyError, FileSet};
pub use generator::{GenerationError, LlmPatchGenerator, PatchGenerator, parse_patches};
pub use listener::{ChannelListener, Listeners, RepairEvent, RepairListener, TracingListener};
pub use orchestrator::{Begin, GenerationJob, RepairOrchestrator};

/// Why an attempt ended in `failed`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepairFailure {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("patch rejected: {0}")]
    Apply(#[from] ApplyError),
    #[error("write-back failed: {0}")]
    WriteBack(String),
}
