//! Scripted collaborators for coordinator and dispatcher tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use sca_core::{FaultResult, FeederResult, JobId, ResultTree};

use crate::notify::{JobEvent, NotificationSink};
use crate::solver::{Bus, Dataset, DatasetResolver, ResolveError, Solver, SolverError};

#[derive(Debug, Clone)]
pub enum Script {
    Succeed(Option<ResultTree>),
    Fail(String),
    /// Never returns and never looks at the token.
    Hang,
}

pub struct ScriptedSolver {
    script: Script,
    gated: bool,
    calls: AtomicUsize,
    started: mpsc::UnboundedSender<()>,
    release: Arc<Notify>,
}

/// Test-side handles: one `started` message per solver call, and `release`
/// to let a gated call return.
pub struct SolverProbe {
    pub started: mpsc::UnboundedReceiver<()>,
    pub release: Arc<Notify>,
}

impl SolverProbe {
    pub async fn wait_started(&mut self) {
        self.started.recv().await.expect("solver dropped");
    }
}

impl ScriptedSolver {
    pub fn new(script: Script, gated: bool) -> (Arc<Self>, SolverProbe) {
        let (started, started_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let solver = Arc::new(Self {
            script,
            gated,
            calls: AtomicUsize::new(0),
            started,
            release: release.clone(),
        });
        (
            solver,
            SolverProbe {
                started: started_rx,
                release,
            },
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Solver for ScriptedSolver {
    async fn solve(
        &self,
        _dataset: &Dataset,
        _parameters: &serde_json::Value,
        _token: CancellationToken,
    ) -> Result<Option<ResultTree>, SolverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.started.send(());
        if self.gated {
            self.release.notified().await;
        }
        match &self.script {
            Script::Succeed(tree) => Ok(tree.clone()),
            Script::Fail(message) => Err(SolverError::Failed(message.clone())),
            Script::Hang => std::future::pending().await,
        }
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<JobEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn terminal_events(&self, job_id: JobId) -> Vec<JobEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.job_id() == job_id && e.is_terminal())
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn publish(&self, event: JobEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Resolves every reference to the same dataset, or to nothing.
pub struct StaticResolver {
    dataset: Option<Dataset>,
}

impl StaticResolver {
    pub fn with(dataset: Dataset) -> Self {
        Self {
            dataset: Some(dataset),
        }
    }

    pub fn missing() -> Self {
        Self { dataset: None }
    }
}

#[async_trait::async_trait]
impl DatasetResolver for StaticResolver {
    async fn resolve(
        &self,
        dataset_ref: &str,
        _variant: Option<&str>,
    ) -> Result<Dataset, ResolveError> {
        self.dataset
            .clone()
            .ok_or_else(|| ResolveError::NotFound(dataset_ref.to_string()))
    }
}

pub fn small_dataset() -> Dataset {
    Dataset {
        name: "grid_a".into(),
        variant: None,
        buses: vec![Bus {
            id: "BUS_1".into(),
            nominal_kv: 20.0,
            feeders: vec!["LINE_1".into()],
        }],
    }
}

pub fn small_tree() -> ResultTree {
    ResultTree {
        faults: vec![FaultResult {
            fault_id: "BUS_1".into(),
            fault_type: "THREE_PHASE".into(),
            current: 9_000.0,
            power: 311.77,
            violations: Vec::new(),
            feeders: vec![FeederResult {
                connectable_id: "LINE_1".into(),
                current: 1_200.0,
                voltage: 4.0,
            }],
        }],
    }
}
