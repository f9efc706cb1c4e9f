//! # Solver Collaborators
//!
//! The coordinator needs two things from the outside world: a
//! [`DatasetResolver`] that turns a dataset reference into a network, and a
//! [`Solver`] that runs the short-circuit computation on it. Both are traits
//! so tests can script them.

pub mod directory;
pub mod synthetic;

pub use directory::DirectoryResolver;
pub use synthetic::SyntheticSolver;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use sca_core::ResultTree;

/// A resolved network: the buses a fault can be placed on and the feeders
/// monitored at each bus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub buses: Vec<Bus>,
}

impl Dataset {
    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bus {
    pub id: String,
    /// Nominal voltage, kV.
    pub nominal_kv: f64,
    #[serde(default)]
    pub feeders: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("dataset '{0}' not found")]
    NotFound(String),
    #[error("invalid dataset reference '{0}'")]
    InvalidReference(String),
    #[error("dataset '{name}' is unreadable: {reason}")]
    Unreadable { name: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolverError {
    #[error("{0}")]
    Failed(String),
    #[error("interrupted")]
    Interrupted,
}

#[async_trait::async_trait]
pub trait DatasetResolver: Send + Sync {
    async fn resolve(&self, dataset_ref: &str, variant: Option<&str>)
        -> Result<Dataset, ResolveError>;
}

/// Runs one computation. Implementations should watch `token` and return
/// [`SolverError::Interrupted`] promptly once it fires; the coordinator also
/// stops polling the future at that point.
#[async_trait::async_trait]
pub trait Solver: Send + Sync {
    async fn solve(
        &self,
        dataset: &Dataset,
        parameters: &serde_json::Value,
        token: CancellationToken,
    ) -> Result<Option<ResultTree>, SolverError>;
}
