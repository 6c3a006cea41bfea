use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::db;
use super::fileset::FileSet;
use super::generator::{GenerationError, PatchGenerator};
use super::listener::{Listeners, RepairListener};
use super::RepairFailure;
use crate::breaker::{AttemptTicket, CircuitBreaker, Outcome};
use crate::config::MenderCfg;
use crate::types::{
    CircuitBreakerState, FilePatch, Fingerprint, PreviewError, RepairContext, RepairStatus,
    RuntimeRepairRequest,
};

/// Earlier failure reasons for the same fault placed in the context.
const PRIOR_FAILURES: usize = 3;

/// Budget for reading failure history, separate from the generation timeout.
const HISTORY_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// How long shutdown waits for outstanding attempt writes.
const PERSIST_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of asking the orchestrator to start a repair.
#[derive(Debug)]
pub enum Begin {
    /// Attempt registered; run the job and hand its result to `complete`.
    Started(GenerationJob),
    /// Breaker is tripped; listeners were told and no request was created.
    Tripped(String),
    /// Another attempt is still in flight.
    Busy,
}

/// The suspendable part of one attempt. Owns everything it needs, so it can
/// run while the orchestrator keeps serving other calls.
pub struct GenerationJob {
    attempt_id: u64,
    generator: Arc<dyn PatchGenerator>,
    error: PreviewError,
    context: RepairContext,
    timeout: Duration,
    pool: Option<PgPool>,
}

impl std::fmt::Debug for GenerationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationJob")
            .field("attempt_id", &self.attempt_id)
            .field("generator", &self.generator.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GenerationJob {
    pub fn attempt_id(&self) -> u64 {
        self.attempt_id
    }

    /// Merge stored failure history, then call the generator bounded by the
    /// attempt timeout.
    pub async fn run(mut self) -> Result<Vec<FilePatch>, GenerationError> {
        self.load_failure_history().await;
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.generator.generate(&self.error, &self.context)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout(timeout)),
        }
    }

    async fn load_failure_history(&mut self) {
        let Some(pool) = &self.pool else {
            return;
        };
        let lookup = db::fetch_failure_summaries(
            pool,
            self.error.kind.as_str(),
            &self.error.message,
            PRIOR_FAILURES as i64,
        );
        match tokio::time::timeout(HISTORY_LOOKUP_TIMEOUT, lookup).await {
            Ok(Ok(summaries)) => {
                for s in summaries {
                    if !self.context.prior_failures.contains(&s) {
                        self.context.prior_failures.push(s);
                    }
                }
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to load failure history"),
            Err(_) => tracing::warn!(
                timeout_ms = HISTORY_LOOKUP_TIMEOUT.as_millis() as u64,
                "failure history lookup timed out"
            ),
        }
    }
}

struct InFlight {
    request: RuntimeRepairRequest,
    ticket: AttemptTicket,
}

/// Drives repair attempts for one preview session.
///
/// Owns the breaker, the file set and the bounded history. At most one
/// attempt is in flight; the only suspension point is [`GenerationJob::run`].
pub struct RepairOrchestrator {
    session_id: Uuid,
    breaker: CircuitBreaker,
    files: FileSet,
    generator: Arc<dyn PatchGenerator>,
    listeners: Listeners,
    history: VecDeque<RuntimeRepairRequest>,
    history_cap: usize,
    timeout: Duration,
    next_attempt: u64,
    last_operation: Option<String>,
    in_flight: Option<InFlight>,
    pool: Option<PgPool>,
    writes: TaskTracker,
    write_back: Option<PathBuf>,
}

impl RepairOrchestrator {
    pub fn new(
        cfg: &MenderCfg,
        files: FileSet,
        generator: Arc<dyn PatchGenerator>,
        listeners: Listeners,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            breaker: CircuitBreaker::new(cfg.breaker()),
            files,
            generator,
            listeners,
            history: VecDeque::new(),
            history_cap: cfg.repair_history_cap.max(1),
            timeout: cfg.repair_timeout(),
            next_attempt: 1,
            last_operation: None,
            in_flight: None,
            pool: None,
            writes: TaskTracker::new(),
            write_back: None,
        }
    }

    /// Persist terminal attempts and read failure history from `pool`.
    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Write applied patches to disk under `root`.
    pub fn with_write_back(mut self, root: PathBuf) -> Self {
        self.write_back = Some(root);
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Count a sighting of `error` against recently repaired faults. Returns
    /// the trip reason if the sighting tripped the breaker.
    pub fn observe_recurrence(&mut self, error: &PreviewError, now: Instant) -> Option<String> {
        let reason = self.breaker.observe_recurrence(&error.fingerprint(), now)?;
        self.listeners
            .on_circuit_breaker_tripped(&reason, self.breaker.state());
        Some(reason)
    }

    /// Register a new attempt for `error`, or refuse.
    pub fn begin(&mut self, error: PreviewError, now: Instant) -> Begin {
        if self.in_flight.is_some() {
            return Begin::Busy;
        }
        if !self.breaker.check(now) {
            let reason = self
                .breaker
                .state()
                .tripped_reason
                .clone()
                .unwrap_or_else(|| "circuit breaker tripped".into());
            tracing::debug!(kind = %error.kind, "repair short-circuited by breaker");
            self.listeners
                .on_circuit_breaker_tripped(&reason, self.breaker.state());
            return Begin::Tripped(reason);
        }

        let ticket = self.breaker.record_attempt(now);
        let attempt_id = self.next_attempt;
        self.next_attempt += 1;

        let mut context = self.files.snapshot();
        context.last_operation = self.last_operation.clone();
        context.prior_failures = self.prior_failures(&error.fingerprint());

        let request = RuntimeRepairRequest {
            attempt_id,
            error: error.clone(),
            context: context.clone(),
            status: RepairStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            failure: None,
            patched_paths: Vec::new(),
        };
        self.listeners.on_start(&request);
        self.in_flight = Some(InFlight { request, ticket });

        Begin::Started(GenerationJob {
            attempt_id,
            generator: Arc::clone(&self.generator),
            error,
            context,
            timeout: self.timeout,
            pool: self.pool.clone(),
        })
    }

    /// Settle the in-flight attempt with the generator's result. Returns the
    /// terminal record, or `None` if `attempt_id` is not in flight.
    pub fn complete(
        &mut self,
        attempt_id: u64,
        result: Result<Vec<FilePatch>, GenerationError>,
        now: Instant,
    ) -> Option<RuntimeRepairRequest> {
        let InFlight { mut request, ticket } = match self.in_flight.take() {
            Some(f) if f.request.attempt_id == attempt_id => f,
            other => {
                tracing::warn!(attempt = attempt_id, "completion for an attempt that is not in flight");
                self.in_flight = other;
                return None;
            }
        };

        let applied = result.map_err(RepairFailure::from).and_then(|patches| {
            let written = self.files.apply(&patches, &request.context.revisions)?;
            self.write_to_disk(&written, &request.context)?;
            Ok((patches, written))
        });

        request.finished_at = Some(Utc::now());
        let tripped = match applied {
            Ok((patches, written)) => {
                request.status = RepairStatus::Succeeded;
                request.patched_paths = written;
                let tripped = self.breaker.record_outcome(ticket, Outcome::Success);
                self.breaker.note_repaired(request.error.fingerprint(), now);
                self.listeners.on_success(&request, &patches);
                tripped
            }
            Err(reason) => {
                request.status = RepairStatus::Failed;
                request.failure = Some(reason.to_string());
                let tripped = self
                    .breaker
                    .record_outcome(ticket, Outcome::Failure(reason.to_string()));
                self.listeners.on_error(&request, &reason);
                tripped
            }
        };
        if let Some(reason) = tripped {
            self.listeners
                .on_circuit_breaker_tripped(&reason, self.breaker.state());
        }

        self.record(request.clone());
        Some(request)
    }

    /// Give up on the in-flight attempt. Still counts as a failure.
    pub fn abandon(&mut self, now: Instant) -> Option<RuntimeRepairRequest> {
        let attempt_id = self.in_flight.as_ref()?.request.attempt_id;
        self.complete(attempt_id, Err(GenerationError::Abandoned), now)
    }

    /// Full attempt: recurrence check, begin, generate, complete.
    pub async fn handle(&mut self, error: PreviewError) -> Option<RuntimeRepairRequest> {
        self.observe_recurrence(&error, Instant::now());
        match self.begin(error, Instant::now()) {
            Begin::Started(job) => {
                let attempt_id = job.attempt_id();
                let result = job.run().await;
                self.complete(attempt_id, result, Instant::now())
            }
            Begin::Tripped(_) | Begin::Busy => None,
        }
    }

    pub fn stats(&self) -> CircuitBreakerState {
        self.breaker.stats()
    }

    pub fn reset_circuit_breaker(&mut self) {
        self.breaker.reset();
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn in_flight_attempt(&self) -> Option<u64> {
        self.in_flight.as_ref().map(|f| f.request.attempt_id)
    }

    pub fn in_flight_fingerprint(&self) -> Option<Fingerprint> {
        self.in_flight.as_ref().map(|f| f.request.error.fingerprint())
    }

    /// Terminal attempts, oldest first.
    pub fn history(&self) -> Vec<RuntimeRepairRequest> {
        self.history.iter().cloned().collect()
    }

    pub fn files(&self) -> &FileSet {
        &self.files
    }

    /// Write a file from outside the repair loop. Any in-flight patch for the
    /// same file will be refused as a concurrent edit.
    pub fn edit_file(&mut self, path: impl Into<String>, content: impl Into<String>) -> u64 {
        self.files.insert(path, content)
    }

    pub fn set_last_operation(&mut self, operation: Option<String>) {
        self.last_operation = operation;
    }

    /// Mark the file the user is looking at. Returns false for unknown paths.
    pub fn set_active_file(&mut self, path: &str) -> bool {
        self.files.set_active(path)
    }

    /// Attempt writes still running against the pool.
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Wait for outstanding attempt writes. Later attempts are still persisted
    /// but no longer waited on.
    pub async fn flush(&self) {
        self.writes.close();
        if tokio::time::timeout(PERSIST_DRAIN_TIMEOUT, self.writes.wait())
            .await
            .is_err()
        {
            tracing::warn!(pending = self.writes.len(), "attempt writes still pending at shutdown");
        }
    }

    fn prior_failures(&self, fingerprint: &Fingerprint) -> Vec<String> {
        self.history
            .iter()
            .rev()
            .filter(|r| r.status == RepairStatus::Failed && r.error.fingerprint() == *fingerprint)
            .filter_map(|r| r.failure.clone())
            .take(PRIOR_FAILURES)
            .collect()
    }

    fn record(&mut self, request: RuntimeRepairRequest) {
        if let Some(pool) = &self.pool
            && let Ok(rt) = tokio::runtime::Handle::try_current()
        {
            let pool = pool.clone();
            let session_id = self.session_id;
            let request = request.clone();
            self.writes.spawn_on(
                async move {
                    if let Err(e) = db::write_attempt(&pool, session_id, &request).await {
                        tracing::warn!(attempt = request.attempt_id, error = %e, "failed to persist repair attempt");
                    }
                },
                &rt,
            );
        }
        if self.history.len() == self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(request);
    }

    /// Write freshly applied files under the write-back root. On failure the
    /// in-memory files go back to their `base` contents and disk is restored
    /// best-effort, so memory never runs ahead of what the preview serves.
    fn write_to_disk(&mut self, paths: &[String], base: &RepairContext) -> Result<(), RepairFailure> {
        let Some(root) = &self.write_back else {
            return Ok(());
        };
        let Err(e) = self.files.write_dir(root, paths) else {
            return Ok(());
        };
        tracing::warn!(root = %root.display(), error = %e, "failed to write patched files, rolling back");
        for path in paths {
            if let Some(original) = base.files.get(path) {
                self.files.insert(path.clone(), original.clone());
            }
        }
        if let Err(restore) = self.files.write_dir(root, paths) {
            tracing::warn!(root = %root.display(), error = %restore, "could not restore files on disk");
        }
        Err(RepairFailure::WriteBack(format!("{}: {e}", root.display())))
    }
}

impl std::fmt::Debug for RepairOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairOrchestrator")
            .field("session_id", &self.session_id)
            .field("breaker", self.breaker.state())
            .field("files", &self.files.len())
            .field("history", &self.history.len())
            .field("in_flight", &self.in_flight.as_ref().map(|f| f.request.attempt_id))
            .finish()
    }
}
