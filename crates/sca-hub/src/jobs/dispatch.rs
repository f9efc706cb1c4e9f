//! Queue consumer and worker pool.
//!
//! Run signals arrive on a bounded channel. Each one gets its own task, which
//! holds a worker permit for as long as the job runs, so at most `workers`
//! solvers are active at once.
//!
//! On shutdown nothing is dropped silently: running solvers are interrupted
//! and end through the failure path, queued and waiting signals are
//! abandoned with a `failed` notification, and every task is joined before
//! [`JobDispatcher::run`] returns.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::{JobCoordinator, RunSignal};

const SHUTDOWN_REASON: &str = "service shutting down";

pub struct JobDispatcher {
    coordinator: Arc<JobCoordinator>,
    signals: mpsc::Receiver<RunSignal>,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl JobDispatcher {
    pub fn new(
        coordinator: Arc<JobCoordinator>,
        signals: mpsc::Receiver<RunSignal>,
        workers: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            signals,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        tracing::info!(
            workers = self.workers.available_permits(),
            "dispatcher started"
        );
        let mut tasks = JoinSet::new();
        loop {
            let signal = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                signal = self.signals.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };

            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            let coordinator = self.coordinator.clone();
            let workers = self.workers.clone();
            let shutdown = self.shutdown.clone();
            tasks.spawn(async move {
                let job_id = signal.job_id;
                let permit = workers.acquire_owned().await;
                if permit.is_err() || shutdown.is_cancelled() {
                    coordinator.abandon(job_id, SHUTDOWN_REASON);
                    return;
                }
                match coordinator.on_run_signal(signal).await {
                    Ok(outcome) => tracing::debug!(job_id = %job_id, ?outcome, "run signal handled"),
                    Err(err) => tracing::warn!(job_id = %job_id, error = %err, "run signal rejected"),
                }
            });
        }

        // Tasks still waiting for a permit abandon their job.
        self.workers.close();
        let interrupted = self.coordinator.interrupt_running();

        // Senders parked on a full queue see it closed and abandon their own job.
        self.signals.close();
        let mut abandoned = 0;
        while let Some(signal) = self.signals.recv().await {
            if self.coordinator.abandon(signal.job_id, SHUTDOWN_REASON) {
                abandoned += 1;
            }
        }

        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        tracing::info!(interrupted, abandoned, "dispatcher stopped");
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        tracing::error!(error = %err, "job task ended abnormally");
    }
}
