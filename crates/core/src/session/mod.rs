//! One preview session: a task that owns the classifier and the repair
//! orchestrator for a single sandbox, torn down with its cancellation token.

mod handle;
mod shutdown;

pub use handle::{SessionError, SessionHandle, SessionStatus};
pub use shutdown::ShutdownGuard;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{self, InboundReceiver};
use crate::classify::Classifier;
use crate::config::MenderCfg;
use crate::repair::{Begin, GenerationError, RepairOrchestrator};
use crate::types::{ErrorKind, FilePatch, PreviewError, Severity};
use handle::Command;

/// Operator commands buffered ahead of the session task.
const COMMAND_BUFFER: usize = 32;

type Generation = Pin<Box<dyn Future<Output = (u64, Result<Vec<FilePatch>, GenerationError>)> + Send>>;

pub struct PreviewSession {
    classifier: Classifier,
    orchestrator: RepairOrchestrator,
    inbound: InboundReceiver,
    inbound_open: bool,
    commands: mpsc::Receiver<Command>,
    token: CancellationToken,
    generation: Option<Generation>,
    pending: VecDeque<PreviewError>,
    pending_cap: usize,
    repair_warnings: bool,
    superseded: u64,
    sandbox_alive: bool,
}

impl PreviewSession {
    /// Start a session task. Cancelling `parent` (or calling
    /// [`SessionHandle::shutdown`]) ends it.
    pub fn spawn(
        cfg: &MenderCfg,
        orchestrator: RepairOrchestrator,
        parent: &CancellationToken,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (inbound_tx, inbound_rx) = channel::channel(cfg.channel_buffer);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let token = parent.child_token();

        let session = Self {
            classifier: Classifier::new(cfg.dedup_window()),
            orchestrator,
            inbound: inbound_rx,
            inbound_open: true,
            commands: cmd_rx,
            token: token.clone(),
            generation: None,
            pending: VecDeque::new(),
            pending_cap: cfg.pending_queue_cap,
            repair_warnings: cfg.repair_warnings,
            superseded: 0,
            sandbox_alive: false,
        };
        let task = tokio::spawn(session.run());
        (SessionHandle::new(inbound_tx, cmd_tx, token), task)
    }

    async fn run(mut self) {
        let session_id = self.orchestrator.session_id();
        tracing::info!(session = %session_id, "preview session started");

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                (attempt_id, result) = poll_generation(&mut self.generation) => {
                    self.generation = None;
                    self.orchestrator.complete(attempt_id, result, Instant::now());
                    self.drain_pending();
                }
                msg = self.inbound.recv(), if self.inbound_open => match msg {
                    Some(msg) => self.ingest(msg),
                    None => {
                        tracing::debug!(session = %session_id, "sandbox channel closed");
                        self.inbound_open = false;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.command(cmd),
                    None => break,
                },
            }
        }

        if self.generation.take().is_some()
            && let Some(request) = self.orchestrator.abandon(Instant::now())
        {
            tracing::info!(attempt = request.attempt_id, "in-flight repair abandoned at shutdown");
        }
        self.orchestrator.flush().await;
        let stats = self.orchestrator.stats();
        tracing::info!(
            session = %session_id,
            total_attempts = stats.total_attempts,
            total_failures = stats.total_failures,
            "preview session stopped"
        );
    }

    fn ingest(&mut self, msg: Value) {
        let now = Instant::now();
        let Some(error) = self.classifier.ingest(&msg, now) else {
            return;
        };

        if error.kind == ErrorKind::System {
            if !self.sandbox_alive {
                tracing::info!(message = %error.message, url = ?error.origin.url, "sandbox instrumentation online");
            }
            self.sandbox_alive = true;
            return;
        }
        if !self.repairable(&error) {
            tracing::debug!(kind = %error.kind, severity = error.severity.as_str(), "not repairable, skipped");
            return;
        }

        self.orchestrator.observe_recurrence(&error, now);

        if let Some(current) = self.orchestrator.in_flight_fingerprint() {
            if current == error.fingerprint() {
                self.superseded += 1;
                tracing::debug!(fingerprint = %current, "same fault as in-flight repair, dropped");
            } else {
                self.enqueue(error);
            }
            return;
        }
        self.start(error, now);
    }

    fn repairable(&self, error: &PreviewError) -> bool {
        match error.severity {
            Severity::Error => true,
            Severity::Warning => self.repair_warnings,
            Severity::Info => false,
        }
    }

    fn enqueue(&mut self, error: PreviewError) {
        let fingerprint = error.fingerprint();
        if self.pending.iter().any(|e| e.fingerprint() == fingerprint) {
            self.superseded += 1;
            return;
        }
        if self.pending_cap == 0 {
            self.superseded += 1;
            tracing::debug!(fingerprint = %fingerprint, "repair in flight, dropped");
            return;
        }
        if self.pending.len() >= self.pending_cap
            && let Some(dropped) = self.pending.pop_front()
        {
            self.superseded += 1;
            tracing::debug!(fingerprint = %dropped.fingerprint(), "pending queue full, oldest dropped");
        }
        self.pending.push_back(error);
    }

    fn start(&mut self, error: PreviewError, now: Instant) {
        match self.orchestrator.begin(error, now) {
            Begin::Started(job) => {
                let attempt_id = job.attempt_id();
                self.generation = Some(Box::pin(async move { (attempt_id, job.run().await) }));
            }
            Begin::Tripped(_) => {}
            Begin::Busy => {
                tracing::warn!("orchestrator busy without a tracked generation");
            }
        }
    }

    fn drain_pending(&mut self) {
        while self.generation.is_none()
            && let Some(error) = self.pending.pop_front()
        {
            self.start(error, Instant::now());
        }
    }

    fn command(&mut self, cmd: Command) {
        match cmd {
            Command::Stats(reply) => {
                let _ = reply.send(self.orchestrator.stats());
            }
            Command::Status(reply) => {
                let _ = reply.send(SessionStatus {
                    breaker: self.orchestrator.stats(),
                    classifier: self.classifier.stats(),
                    in_flight: self.orchestrator.in_flight_attempt(),
                    pending: self.pending.len(),
                    superseded: self.superseded,
                    sandbox_alive: self.sandbox_alive,
                });
            }
            Command::Reset(reply) => {
                self.orchestrator.reset_circuit_breaker();
                self.drain_pending();
                let _ = reply.send(());
            }
            Command::History(reply) => {
                let _ = reply.send(self.orchestrator.history());
            }
            Command::Files(reply) => {
                let _ = reply.send(self.orchestrator.files().clone());
            }
            Command::SetLastOperation(op) => self.orchestrator.set_last_operation(op),
            Command::SetActiveFile { path, reply } => {
                let _ = reply.send(self.orchestrator.set_active_file(&path));
            }
            Command::EditFile { path, content, reply } => {
                let _ = reply.send(self.orchestrator.edit_file(path, content));
            }
        }
    }
}

/// Resolves when the in-flight generation finishes; pends forever when idle.
async fn poll_generation(
    generation: &mut Option<Generation>,
) -> (u64, Result<Vec<FilePatch>, GenerationError>) {
    match generation {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}
