//! Deterministic stand-in for a real short-circuit engine.
//!
//! Places one fault on every bus of the dataset and draws currents from a
//! `StdRng` seeded with `parameters.seed`, so the same job always produces the
//! same tree. Recognised parameters:
//!
//! | key | default | meaning |
//! |---|---|---|
//! | `seed` | `0` | RNG seed |
//! | `delay_ms` | `0` | cooperative sleep before solving |
//! | `fail` | `false` | fail instead of producing a result |
//! | `fault_type` | `THREE_PHASE` | recorded on every fault |
//! | `current_limit` | none | report a violation above this current (A) |

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use sca_core::{FaultResult, FeederResult, ResultTree, Violation};

use super::{Dataset, Solver, SolverError};

#[derive(Debug, Deserialize)]
struct SyntheticParams {
    #[serde(default)]
    seed: u64,
    #[serde(default)]
    delay_ms: u64,
    #[serde(default)]
    fail: bool,
    #[serde(default = "default_fault_type")]
    fault_type: String,
    #[serde(default)]
    current_limit: Option<f64>,
}

fn default_fault_type() -> String {
    "THREE_PHASE".into()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyntheticSolver;

impl SyntheticSolver {
    fn generate(dataset: &Dataset, params: &SyntheticParams) -> ResultTree {
        let mut rng = StdRng::seed_from_u64(params.seed);
        let faults = dataset
            .buses
            .iter()
            .map(|bus| {
                let current = round2(rng.gen_range(2_000.0..40_000.0));
                // S = sqrt(3) * U * I; kV times A gives kVA, stored as MVA.
                let power = round2(3f64.sqrt() * bus.nominal_kv * current / 1_000.0);
                let feeders = bus
                    .feeders
                    .iter()
                    .map(|feeder| FeederResult {
                        connectable_id: feeder.clone(),
                        current: round2(current * rng.gen_range(0.02..0.6)),
                        voltage: round2(bus.nominal_kv * rng.gen_range(0.0..0.9)),
                    })
                    .collect();
                let violations = params
                    .current_limit
                    .filter(|limit| current > *limit)
                    .map(|limit| Violation {
                        subject_id: bus.id.clone(),
                        limit_type: "HIGH_SHORT_CIRCUIT_CURRENT".into(),
                        limit,
                        value: current,
                    })
                    .into_iter()
                    .collect();
                FaultResult {
                    fault_id: bus.id.clone(),
                    fault_type: params.fault_type.clone(),
                    current,
                    power,
                    violations,
                    feeders,
                }
            })
            .collect();
        ResultTree { faults }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[async_trait::async_trait]
impl Solver for SyntheticSolver {
    async fn solve(
        &self,
        dataset: &Dataset,
        parameters: &serde_json::Value,
        token: CancellationToken,
    ) -> Result<Option<ResultTree>, SolverError> {
        let params: SyntheticParams = if parameters.is_null() {
            serde_json::from_value(serde_json::json!({}))
        } else {
            serde_json::from_value(parameters.clone())
        }
        .map_err(|err| SolverError::Failed(format!("invalid parameters: {err}")))?;

        if params.delay_ms > 0 {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SolverError::Interrupted),
                _ = tokio::time::sleep(Duration::from_millis(params.delay_ms)) => {}
            }
        }
        if token.is_cancelled() {
            return Err(SolverError::Interrupted);
        }
        if params.fail {
            return Err(SolverError::Failed(format!(
                "solver failed on dataset '{}'",
                dataset.name
            )));
        }
        if dataset.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::generate(dataset, &params)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::Bus;
    use serde_json::json;

    fn dataset() -> Dataset {
        Dataset {
            name: "grid_a".into(),
            variant: None,
            buses: vec![
                Bus {
                    id: "BUS_1".into(),
                    nominal_kv: 20.0,
                    feeders: vec!["LINE_1".into(), "TR_1".into()],
                },
                Bus {
                    id: "BUS_2".into(),
                    nominal_kv: 110.0,
                    feeders: vec!["LINE_2".into()],
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_same_seed_same_tree() {
        let params = json!({ "seed": 42 });
        let first = SyntheticSolver
            .solve(&dataset(), &params, CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        let second = SyntheticSolver
            .solve(&dataset(), &params, CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.faults.len(), 2);
        assert_eq!(first.faults[0].feeders.len(), 2);
        assert_eq!(first.faults[1].fault_type, "THREE_PHASE");
    }

    #[tokio::test]
    async fn test_empty_dataset_yields_no_tree() {
        let result = SyntheticSolver
            .solve(&Dataset::default(), &json!(null), CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_requested_failure() {
        let err = SyntheticSolver
            .solve(&dataset(), &json!({ "fail": true }), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SolverError::Failed(_)));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_delay() {
        let token = CancellationToken::new();
        token.cancel();
        let err = SyntheticSolver
            .solve(&dataset(), &json!({ "delay_ms": 60_000 }), token)
            .await
            .unwrap_err();
        assert_eq!(err, SolverError::Interrupted);
    }

    #[tokio::test]
    async fn test_violation_above_limit() {
        let tree = SyntheticSolver
            .solve(
                &dataset(),
                &json!({ "seed": 3, "current_limit": 0.0 }),
                CancellationToken::new(),
            )
            .await
            .unwrap()
            .unwrap();
        for fault in &tree.faults {
            assert_eq!(fault.violations.len(), 1);
            assert_eq!(fault.violations[0].value, fault.current);
        }
    }

    #[tokio::test]
    async fn test_bad_parameters_fail() {
        let err = SyntheticSolver
            .solve(&dataset(), &json!({ "seed": "x" }), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SolverError::Failed(msg) if msg.contains("invalid parameters")));
    }
}
