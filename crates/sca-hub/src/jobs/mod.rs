//! # Job Lifecycle Coordinator
//!
//! Owns the run/cancel race. A cancel may arrive before, during or after the
//! run it targets, and each submission must end in at most one terminal
//! notification (`result_ready`, `failed` or `stopped`).
//!
//! ```text
//! NOT_DONE --run--> RUNNING --success--> COMPLETED
//! RUNNING  --failure--> FAILED (or deleted, per FailurePolicy)
//! RUNNING  --cancel--> record deleted, `stopped`
//! NOT_DONE --cancel--> record deleted, `stopped`; a later run is a no-op
//! ```
//!
//! One gate (a `std::sync::Mutex` around the [`InFlightRegistry`]) serialises
//! every decision: admission, the cancel bookkeeping, and the final
//! transition of a run. It is never held across an `.await`. Notifications
//! and the short SQLite transitions happen inside it, so a cancel and a
//! finishing run always observe each other consistently.

pub mod dispatch;

pub use dispatch::JobDispatcher;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sca_core::{
    Admission, FaultResultView, FilterDescriptor, FilterError, InFlightRegistry, Job, JobId, JobStatus, Page,
    PageRequest, ResultTree,
};
use sca_store::{ResultPager, SqliteStore, StoreError};

use crate::notify::NotificationSink;
use crate::solver::{DatasetResolver, ResolveError, Solver, SolverError};

type Registry = InFlightRegistry<CancellationToken, Instant>;

// =============================================================================
// Requests and outcomes
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Pre-reserved id. The job starts as `NOT_DONE` instead of `RUNNING`.
    #[serde(default)]
    pub job_id: Option<JobId>,
    pub dataset_ref: String,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// What the dispatch queue carries to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSignal {
    pub job_id: JobId,
    pub dataset_ref: String,
    pub variant: Option<String>,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Result persisted, `result_ready` sent.
    Completed,
    /// `failed` sent.
    Failed,
    /// A cancel fired while the solver ran. The cancel path notified.
    Interrupted,
    /// A cancel was recorded before the run registered. Solver not called.
    Cancelled,
    /// Another delivery of the same run is in flight.
    Duplicate,
    /// The record no longer exists.
    Gone,
    /// The record is already terminal.
    AlreadyFinished,
    /// The solver finished but the record was deleted meanwhile.
    Vanished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job had not started; it never will.
    Prevented,
    /// The running solver was told to stop.
    Interrupted,
    /// The job completed or failed first. Nothing changed.
    AlreadyFinished,
    /// A cancel for this job is already being processed.
    AlreadyRequested,
    /// No record and nothing in flight.
    Unknown,
}

/// What happens to a job record when its solver fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Keep the record as `FAILED`.
    #[default]
    Retain,
    /// Delete the record, as cancellation does.
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorPolicy {
    pub failure_policy: FailurePolicy,
    /// Cancel intents for jobs that never start are forgotten after this.
    pub cancel_intent_ttl: Duration,
}

impl Default for CoordinatorPolicy {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Retain,
            cancel_intent_ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error(transparent)]
    Dataset(#[from] ResolveError),
    #[error("invalid filter: {0}")]
    InvalidFilter(#[from] FilterError),
    #[error("job {0} already exists")]
    Duplicate(JobId),
    #[error("dispatch queue is closed")]
    QueueClosed,
    #[error("store: {0}")]
    Store(StoreError),
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::JobNotFound(id),
            StoreError::Duplicate(id) => Self::Duplicate(id),
            StoreError::InvalidFilter(err) => Self::InvalidFilter(err),
            other => Self::Store(other),
        }
    }
}

// =============================================================================
// In-flight guard
// =============================================================================

/// Clears a run's registry entries on every exit path, including panics and
/// early returns. Armed once the run is admitted.
struct InFlightGuard<'a> {
    gate: &'a Mutex<Registry>,
    job_id: JobId,
    armed: bool,
}

impl<'a> InFlightGuard<'a> {
    fn new(gate: &'a Mutex<Registry>, job_id: JobId) -> Self {
        Self {
            gate,
            job_id,
            armed: false,
        }
    }

    /// Release while the caller already holds the gate.
    fn release(&mut self, registry: &mut Registry) {
        registry.release(&self.job_id);
        self.armed = false;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut registry = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
            registry.release(&self.job_id);
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct JobCoordinator {
    store: SqliteStore,
    resolver: Arc<dyn DatasetResolver>,
    solver: Arc<dyn Solver>,
    sink: Arc<dyn NotificationSink>,
    queue: mpsc::Sender<RunSignal>,
    policy: CoordinatorPolicy,
    gate: Mutex<Registry>,
}

impl JobCoordinator {
    pub fn new(
        store: SqliteStore,
        resolver: Arc<dyn DatasetResolver>,
        solver: Arc<dyn Solver>,
        sink: Arc<dyn NotificationSink>,
        queue: mpsc::Sender<RunSignal>,
        policy: CoordinatorPolicy,
    ) -> Self {
        Self {
            store,
            resolver,
            solver,
            sink,
            queue,
            policy,
            gate: Mutex::new(Registry::new()),
        }
    }

    fn gate(&self) -> MutexGuard<'_, Registry> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of running jobs and of outstanding cancel intents.
    pub fn in_flight(&self) -> (usize, usize) {
        let registry = self.gate();
        (registry.in_flight_len(), registry.intent_len())
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Persist the job, announce it and queue its run signal. Returns as soon
    /// as the signal is queued.
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobId, CoordinatorError> {
        let (job_id, status) = match request.job_id {
            Some(id) => (id, JobStatus::NotDone),
            None => (JobId::new(), JobStatus::Running),
        };
        let job = Job::new(
            job_id,
            status,
            request.dataset_ref.clone(),
            request.variant.clone(),
            request.parameters.clone(),
        );
        self.store.insert_job(&job)?;
        self.sink.run_dispatched(job_id);

        let signal = RunSignal {
            job_id,
            dataset_ref: request.dataset_ref,
            variant: request.variant,
            parameters: request.parameters,
        };
        if self.queue.send(signal).await.is_err() {
            tracing::error!(job_id = %job_id, "dispatch queue closed, dropping job");
            self.abandon(job_id, "dispatch queue closed");
            return Err(CoordinatorError::QueueClosed);
        }

        tracing::info!(job_id = %job_id, dataset = %job.dataset_ref, "job submitted");
        Ok(job_id)
    }

    // -------------------------------------------------------------------------
    // Run
    // -------------------------------------------------------------------------

    /// Consumer entry point for one run signal.
    pub async fn on_run_signal(&self, signal: RunSignal) -> Result<RunOutcome, CoordinatorError> {
        let RunSignal {
            job_id,
            dataset_ref,
            variant,
            parameters,
        } = signal;

        let dataset = self
            .resolver
            .resolve(&dataset_ref, variant.as_deref())
            .await?;

        let token = CancellationToken::new();
        let mut guard = InFlightGuard::new(&self.gate, job_id);
        if let Some(outcome) = self.admit(&mut guard, token.clone())? {
            return Ok(outcome);
        }
        tracing::info!(job_id = %job_id, dataset = %dataset_ref, "solver started");

        let solved = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SolverError::Interrupted),
            result = self.solver.solve(&dataset, &parameters, token.clone()) => result,
        };

        Ok(match solved {
            Ok(tree) => self.finish_success(&mut guard, tree),
            Err(err) => self.finish_failure(&mut guard, err),
        })
    }

    /// Decide under the gate whether this run may call the solver. `None`
    /// means admitted: the token is registered and the guard armed.
    fn admit(
        &self,
        guard: &mut InFlightGuard<'_>,
        token: CancellationToken,
    ) -> Result<Option<RunOutcome>, CoordinatorError> {
        let job_id = guard.job_id;
        let mut registry = self.gate();

        match registry.admit(job_id, token) {
            Admission::AlreadyInFlight => {
                tracing::debug!(job_id = %job_id, "duplicate run signal ignored");
                return Ok(Some(RunOutcome::Duplicate));
            }
            Admission::CancelRequested => {
                tracing::debug!(job_id = %job_id, "run suppressed by earlier cancel");
                return Ok(Some(RunOutcome::Cancelled));
            }
            Admission::Admitted => guard.armed = true,
        }

        let outcome = match self.store.status(&job_id)? {
            None => {
                tracing::debug!(job_id = %job_id, "run signal for missing record ignored");
                Some(RunOutcome::Gone)
            }
            Some(status) if status.is_terminal() => {
                tracing::debug!(job_id = %job_id, %status, "run signal for finished job ignored");
                Some(RunOutcome::AlreadyFinished)
            }
            Some(JobStatus::NotDone) => {
                self.store.set_job_status(&job_id, JobStatus::Running)?;
                None
            }
            Some(_) => None,
        };
        if outcome.is_some() {
            guard.release(&mut registry);
        }
        Ok(outcome)
    }

    fn finish_success(&self, guard: &mut InFlightGuard<'_>, tree: Option<ResultTree>) -> RunOutcome {
        let job_id = guard.job_id;
        let mut registry = self.gate();

        if registry.has_cancel_intent(&job_id) {
            guard.release(&mut registry);
            tracing::debug!(job_id = %job_id, "result discarded after cancel");
            return RunOutcome::Interrupted;
        }

        let outcome = match self.store.complete(&job_id, tree.as_ref()) {
            Ok(true) => {
                self.sink.result_ready(job_id);
                tracing::info!(job_id = %job_id, "job completed");
                RunOutcome::Completed
            }
            Ok(false) => {
                tracing::warn!(job_id = %job_id, "job record vanished while solving, result dropped");
                RunOutcome::Vanished
            }
            Err(err) => {
                tracing::error!(job_id = %job_id, error = %err, "failed to persist result");
                self.sink
                    .failed(job_id, &format!("failed to persist result: {err}"));
                self.apply_failure_policy(job_id);
                RunOutcome::Failed
            }
        };
        guard.release(&mut registry);
        outcome
    }

    fn finish_failure(&self, guard: &mut InFlightGuard<'_>, err: SolverError) -> RunOutcome {
        let job_id = guard.job_id;
        let mut registry = self.gate();

        if registry.has_cancel_intent(&job_id) {
            guard.release(&mut registry);
            tracing::info!(job_id = %job_id, "solver interrupted");
            return RunOutcome::Interrupted;
        }

        // Without a recorded cancel, an interruption is a failure like any other.
        let message = err.to_string();
        self.sink.failed(job_id, &message);
        self.apply_failure_policy(job_id);
        guard.release(&mut registry);
        RunOutcome::Failed
    }

    /// Caller holds the gate.
    fn apply_failure_policy(&self, job_id: JobId) {
        let applied = match self.policy.failure_policy {
            FailurePolicy::Retain => self.store.set_job_status(&job_id, JobStatus::Failed),
            FailurePolicy::Delete => self.store.delete(&job_id),
        };
        if let Err(err) = applied {
            tracing::error!(job_id = %job_id, error = %err, "failed to record job failure");
        }
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// End a job whose run signal will never be handled. If a cancel got
    /// there first it already notified: its intent is consumed and nothing
    /// else happens. Otherwise an unfinished record is removed and `failed`
    /// sent; a finished one is left alone.
    /// Returns whether a notification went out.
    pub fn abandon(&self, job_id: JobId, reason: &str) -> bool {
        let mut registry = self.gate();

        if registry.is_in_flight(&job_id) {
            return false;
        }
        if registry.has_cancel_intent(&job_id) {
            registry.release(&job_id);
            tracing::debug!(job_id = %job_id, "abandoned job was already cancelled");
            return false;
        }
        let removed = match self.store.status(&job_id) {
            Ok(Some(status)) if !status.is_terminal() => self.store.delete(&job_id),
            Ok(_) => Ok(false),
            Err(err) => Err(err),
        };
        match removed {
            Ok(true) => {
                self.sink.failed(job_id, reason);
                tracing::warn!(job_id = %job_id, reason, "job abandoned");
                true
            }
            Ok(false) => false,
            Err(err) => {
                tracing::error!(job_id = %job_id, error = %err, "failed to remove abandoned job");
                false
            }
        }
    }

    /// Fire the token of every running job. With no cancel intent recorded,
    /// each run ends through the failure path and sends `failed` once.
    pub fn interrupt_running(&self) -> usize {
        let registry = self.gate();
        let mut fired = 0;
        for token in registry.handles() {
            token.cancel();
            fired += 1;
        }
        fired
    }

    // -------------------------------------------------------------------------
    // Cancel
    // -------------------------------------------------------------------------

    /// Cancel a job wherever it is in its lifecycle.
    pub fn on_cancel_signal(&self, job_id: JobId) -> Result<CancelOutcome, CoordinatorError> {
        let mut registry = self.gate();

        if let Some(cutoff) = Instant::now().checked_sub(self.policy.cancel_intent_ttl) {
            let pruned = registry.prune_intents(&cutoff);
            if pruned > 0 {
                tracing::debug!(pruned, "expired cancel intents dropped");
            }
        }

        if registry.has_cancel_intent(&job_id) {
            return Ok(CancelOutcome::AlreadyRequested);
        }
        match self.store.status(&job_id)? {
            Some(status) if status.is_terminal() => {
                tracing::debug!(job_id = %job_id, %status, "cancel after finish ignored");
                return Ok(CancelOutcome::AlreadyFinished);
            }
            None if !registry.is_in_flight(&job_id) => return Ok(CancelOutcome::Unknown),
            _ => {}
        }

        let outcome = match registry.record_cancel(job_id, Instant::now()) {
            Some(token) => {
                token.cancel();
                CancelOutcome::Interrupted
            }
            None => CancelOutcome::Prevented,
        };
        if let Err(err) = self.store.delete(&job_id) {
            tracing::error!(job_id = %job_id, error = %err, "failed to delete cancelled job");
        }
        self.sink.stopped(job_id);
        tracing::info!(job_id = %job_id, ?outcome, "job cancelled");
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    pub fn status(&self, job_id: JobId) -> Result<JobStatus, CoordinatorError> {
        self.store
            .status(&job_id)?
            .ok_or(CoordinatorError::JobNotFound(job_id))
    }

    pub fn job(&self, job_id: JobId) -> Result<Job, CoordinatorError> {
        self.store
            .job(&job_id)?
            .ok_or(CoordinatorError::JobNotFound(job_id))
    }

    /// Bulk overwrite, used to invalidate results. Returns the records touched.
    pub fn set_status(&self, job_ids: &[JobId], status: JobStatus) -> Result<usize, CoordinatorError> {
        let touched = self.store.set_status(job_ids, status)?;
        tracing::info!(requested = job_ids.len(), touched, %status, "job status overwritten");
        Ok(touched)
    }

    pub fn delete(&self, job_id: JobId) -> Result<(), CoordinatorError> {
        if self.store.delete(&job_id)? {
            tracing::info!(job_id = %job_id, "job deleted");
            Ok(())
        } else {
            Err(CoordinatorError::JobNotFound(job_id))
        }
    }

    pub fn delete_all(&self) -> Result<usize, CoordinatorError> {
        let removed = self.store.delete_all()?;
        tracing::info!(removed, "all jobs deleted");
        Ok(removed)
    }

    pub fn results(
        &self,
        job_id: JobId,
        filters: &[FilterDescriptor],
        request: &PageRequest,
    ) -> Result<Page<FaultResultView>, CoordinatorError> {
        Ok(self.store.page(&job_id, filters, request)?)
    }
}
