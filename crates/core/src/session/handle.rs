use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::channel::{InboundSender, ReportTransport};
use crate::classify::ClassifierStats;
use crate::repair::FileSet;
use crate::types::{CircuitBreakerState, RuntimeRepairRequest};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("preview session has shut down")]
    Closed,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub breaker: CircuitBreakerState,
    pub classifier: ClassifierStats,
    pub in_flight: Option<u64>,
    pub pending: usize,
    pub superseded: u64,
    pub sandbox_alive: bool,
}

pub(super) enum Command {
    Stats(oneshot::Sender<CircuitBreakerState>),
    Status(oneshot::Sender<SessionStatus>),
    Reset(oneshot::Sender<()>),
    History(oneshot::Sender<Vec<RuntimeRepairRequest>>),
    Files(oneshot::Sender<FileSet>),
    SetLastOperation(Option<String>),
    SetActiveFile {
        path: String,
        reply: oneshot::Sender<bool>,
    },
    EditFile {
        path: String,
        content: String,
        reply: oneshot::Sender<u64>,
    },
}

/// Operator side of a running preview session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inbound: InboundSender,
    commands: mpsc::Sender<Command>,
    token: CancellationToken,
}

impl SessionHandle {
    pub(super) fn new(
        inbound: InboundSender,
        commands: mpsc::Sender<Command>,
        token: CancellationToken,
    ) -> Self {
        Self {
            inbound,
            commands,
            token,
        }
    }

    /// Transport to hand to the sandbox's instrumentation.
    pub fn transport(&self) -> Arc<dyn ReportTransport> {
        Arc::new(self.inbound.clone())
    }

    pub async fn stats(&self) -> Result<CircuitBreakerState, SessionError> {
        self.request(Command::Stats).await
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        self.request(Command::Status).await
    }

    /// Force the breaker closed. Lifetime totals are kept.
    pub async fn reset(&self) -> Result<(), SessionError> {
        self.request(Command::Reset).await
    }

    pub async fn history(&self) -> Result<Vec<RuntimeRepairRequest>, SessionError> {
        self.request(Command::History).await
    }

    /// Copy of the session's current file set.
    pub async fn files(&self) -> Result<FileSet, SessionError> {
        self.request(Command::Files).await
    }

    pub async fn set_last_operation(&self, operation: Option<String>) -> Result<(), SessionError> {
        self.commands
            .send(Command::SetLastOperation(operation))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Mark the file open in the editor; it is named in later repair
    /// contexts. Returns false if the path is not in the file set.
    pub async fn set_active_file(&self, path: impl Into<String>) -> Result<bool, SessionError> {
        let path = path.into();
        self.request(|reply| Command::SetActiveFile { path, reply })
            .await
    }

    /// Write a file from outside the repair loop. Returns its new revision.
    pub async fn edit_file(
        &self,
        path: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<u64, SessionError> {
        let path = path.into();
        let content = content.into();
        self.request(|reply| Command::EditFile { path, content, reply })
            .await
    }

    /// Whether the sandbox has announced its instrumentation.
    pub async fn sandbox_alive(&self) -> Result<bool, SessionError> {
        Ok(self.status().await?.sandbox_alive)
    }

    /// Stop the session. An in-flight attempt is abandoned as a failure.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}
