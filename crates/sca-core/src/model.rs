//! # Jobs and Result Trees
//!
//! A [`Job`] is one submitted computation. Its inputs are captured at
//! submission and never change; only the status (and the pointer to the
//! persisted result) moves.
//!
//! A [`ResultTree`] is what the solver hands back. It is written once and
//! read back through the pager as [`FaultResultView`]s, which carry the
//! identities the store assigned.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Job identity
// =============================================================================

/// Opaque job identifier. Assigned at submission (or pre-reserved by the
/// caller) and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

// =============================================================================
// Status machine
// =============================================================================

/// Job status.
///
/// ```text
/// NOT_DONE --run--> RUNNING --success--> COMPLETED
///                   RUNNING --failure--> FAILED
/// ```
///
/// There is no cancelled status: a cancelled job's record is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    NotDone,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotDone => "NOT_DONE",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NOT_DONE" => Some(Self::NotDone),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal states absorb every later run or cancel signal.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Job
// =============================================================================

/// One submitted computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// Dataset (network) the job runs against.
    pub dataset_ref: String,
    /// Dataset variant; `None` selects the base variant.
    pub variant: Option<String>,
    /// Solver parameters, opaque to the coordinator.
    pub parameters: serde_json::Value,
    /// Persisted result tree, present only when `status == Completed`.
    pub result_ref: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: JobId,
        status: JobStatus,
        dataset_ref: impl Into<String>,
        variant: Option<String>,
        parameters: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            status,
            dataset_ref: dataset_ref.into(),
            variant,
            parameters,
            result_ref: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Result tree (solver output)
// =============================================================================

/// Hierarchical output of one completed job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTree {
    pub faults: Vec<FaultResult>,
}

impl ResultTree {
    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }
}

/// Parent record: the outcome of one fault scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultResult {
    /// Faulted element (usually a bus).
    pub fault_id: String,
    pub fault_type: String,
    /// Short-circuit current, A.
    pub current: f64,
    /// Short-circuit power, MVA.
    pub power: f64,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub feeders: Vec<FeederResult>,
}

/// A limit breached during one fault scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub subject_id: String,
    pub limit_type: String,
    pub limit: f64,
    pub value: f64,
}

/// Child record: contribution of one monitored feeder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeederResult {
    pub connectable_id: String,
    /// Feeder current, A. The default display order sorts on this, descending.
    pub current: f64,
    /// Residual voltage at the feeder, kV.
    pub voltage: f64,
}

// =============================================================================
// Hydrated views (what the pager returns)
// =============================================================================

/// A fault record as read back from the store, with its stable identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultResultView {
    pub id: i64,
    pub fault_id: String,
    pub fault_type: String,
    pub current: f64,
    pub power: f64,
    pub violations: Vec<Violation>,
    pub feeders: Vec<FeederResultView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeederResultView {
    pub id: i64,
    pub connectable_id: String,
    pub current: f64,
    pub voltage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::NotDone.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_parse_matches_wire_names() {
        for status in [
            JobStatus::NotDone,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert_eq!(JobStatus::parse("cancelled"), None);
    }

    #[test]
    fn test_job_id_parses_its_display_form() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_fault_result_collections_default_to_empty() {
        let fault: FaultResult = serde_json::from_value(serde_json::json!({
            "fault_id": "BUS_1",
            "fault_type": "THREE_PHASE",
            "current": 12000.0,
            "power": 250.0
        }))
        .unwrap();
        assert!(fault.violations.is_empty());
        assert!(fault.feeders.is_empty());
    }
}
