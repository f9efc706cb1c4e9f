//! # Paged result reads
//!
//! Two-phase fetch over a job's result tree, inside one read transaction:
//!
//! 1. Identity phase: `SELECT DISTINCT` fault ids matching the compiled
//!    predicate, in the resolved order (always ending in `f.id ASC`), with
//!    `LIMIT`/`OFFSET`. A `COUNT(DISTINCT f.id)` with the same predicate gives
//!    the total.
//! 2. Hydration phase: faults, violations and the displayed feeders for
//!    exactly those ids, then put back into identity order.
//!
//! Paging on ids keeps page boundaries stable when a feeder filter joins one
//! fault to several matching feeder rows.

use std::collections::HashMap;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Transaction};

use sca_core::page::{resolve_sort, sort_feeders};
use sca_core::{
    FaultResultView, FeederResultView, FilterDescriptor, JobId, Page, PageRequest, Violation,
};

use crate::predicate::{ResultSpecification, FAULT_ALIAS, JOINED_FEEDER_ALIAS};
use crate::{SqliteStore, StoreError};

/// Paged, filtered access to a job's result tree.
pub trait ResultPager {
    fn page(
        &self,
        job_id: &JobId,
        filters: &[FilterDescriptor],
        request: &PageRequest,
    ) -> Result<Page<FaultResultView>, StoreError>;
}

impl ResultPager for SqliteStore {
    fn page(
        &self,
        job_id: &JobId,
        filters: &[FilterDescriptor],
        request: &PageRequest,
    ) -> Result<Page<FaultResultView>, StoreError> {
        self.results_page(job_id, filters, request)
    }
}

impl SqliteStore {
    /// One page of fault records for `job_id`.
    ///
    /// Filters and sort keys are classified before the store is touched, so
    /// an invalid filter is reported even for an unknown job. A job without a
    /// persisted tree yields an empty page.
    pub fn results_page(
        &self,
        job_id: &JobId,
        filters: &[FilterDescriptor],
        request: &PageRequest,
    ) -> Result<Page<FaultResultView>, StoreError> {
        let spec = ResultSpecification::compile(filters)?;
        let sort = resolve_sort(&request.sort)?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let result_id = match tx.query_row(
            "SELECT result_id FROM jobs WHERE id = ?1",
            [job_id.to_string()],
            |row| row.get::<_, Option<i64>>(0),
        ) {
            Ok(Some(result_id)) => result_id,
            Ok(None) => return Ok(Page::empty(0, request)),
            Err(rusqlite::Error::QueryReturnedNoRows) => return Err(StoreError::NotFound(*job_id)),
            Err(err) => return Err(err.into()),
        };

        let predicate = spec.where_clause(result_id)?;
        let from = if spec.joins_feeders() {
            format!(
                "fault_results {FAULT_ALIAS} JOIN feeder_results {JOINED_FEEDER_ALIAS} \
                 ON {JOINED_FEEDER_ALIAS}.fault_result_id = {FAULT_ALIAS}.id"
            )
        } else {
            format!("fault_results {FAULT_ALIAS}")
        };

        let total: i64 = tx.query_row(
            &format!(
                "SELECT COUNT(DISTINCT {FAULT_ALIAS}.id) FROM {from} WHERE {}",
                predicate.sql
            ),
            params_from_iter(predicate.params.iter()),
            |row| row.get(0),
        )?;
        let total = u64::try_from(total).unwrap_or(0);

        let mut columns = vec![format!("{FAULT_ALIAS}.id")];
        let mut order = Vec::with_capacity(sort.parent.len());
        for (field, direction) in &sort.parent {
            let column = format!("{FAULT_ALIAS}.{}", field.column);
            if !columns.contains(&column) {
                columns.push(column.clone());
            }
            order.push(format!("{column} {}", direction.sql()));
        }

        let identity_sql = format!(
            "SELECT DISTINCT {} FROM {from} WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
            columns.join(", "),
            predicate.sql,
            order.join(", ")
        );
        let mut identity_params = predicate.params.clone();
        identity_params.push(Value::Integer(i64::from(request.limit())));
        identity_params.push(Value::Integer(
            i64::try_from(request.offset()).unwrap_or(i64::MAX),
        ));

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(&identity_sql)?;
            let rows = stmt.query_map(params_from_iter(identity_params.iter()), |row| row.get(0))?;
            let ids = rows.collect::<Result<Vec<i64>, _>>()?;
            ids
        };

        if ids.is_empty() {
            return Ok(Page::empty(total, request));
        }

        let mut content = hydrate(&tx, &spec, &ids)?;
        for fault in &mut content {
            sort_feeders(&mut fault.feeders, sort.child);
        }
        tx.commit()?;

        tracing::debug!(
            job_id = %job_id,
            page = request.page,
            returned = content.len(),
            total,
            "served result page"
        );
        Ok(Page::new(content, total, request))
    }
}

fn hydrate(
    tx: &Transaction<'_>,
    spec: &ResultSpecification,
    ids: &[i64],
) -> Result<Vec<FaultResultView>, StoreError> {
    let placeholders = vec!["?"; ids.len()].join(", ");
    let id_params: Vec<Value> = ids.iter().map(|id| Value::Integer(*id)).collect();

    let mut faults: HashMap<i64, FaultResultView> = HashMap::with_capacity(ids.len());
    {
        let mut stmt = tx.prepare(&format!(
            "SELECT id, fault_id, fault_type, current, power FROM fault_results WHERE id IN ({placeholders})"
        ))?;
        let mut rows = stmt.query(params_from_iter(id_params.iter()))?;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            faults.insert(
                id,
                FaultResultView {
                    id,
                    fault_id: row.get(1)?,
                    fault_type: row.get(2)?,
                    current: row.get(3)?,
                    power: row.get(4)?,
                    violations: Vec::new(),
                    feeders: Vec::new(),
                },
            );
        }
    }

    {
        let mut stmt = tx.prepare(&format!(
            "SELECT fault_result_id, subject_id, limit_type, limit_value, value \
             FROM violations WHERE fault_result_id IN ({placeholders}) ORDER BY id"
        ))?;
        let mut rows = stmt.query(params_from_iter(id_params.iter()))?;
        while let Some(row) = rows.next()? {
            let owner: i64 = row.get(0)?;
            if let Some(fault) = faults.get_mut(&owner) {
                fault.violations.push(Violation {
                    subject_id: row.get(1)?,
                    limit_type: row.get(2)?,
                    limit: row.get(3)?,
                    value: row.get(4)?,
                });
            }
        }
    }

    {
        let mut sql = format!(
            "SELECT d.id, d.fault_result_id, d.connectable_id, d.current, d.voltage \
             FROM feeder_results d WHERE d.fault_result_id IN ({placeholders})"
        );
        let mut params = id_params.clone();
        if let Some(display) = spec.display_clause()? {
            sql.push_str(" AND ");
            sql.push_str(&display.sql);
            params.extend(display.params);
        }
        let mut stmt = tx.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        while let Some(row) = rows.next()? {
            let owner: i64 = row.get(1)?;
            if let Some(fault) = faults.get_mut(&owner) {
                fault.feeders.push(FeederResultView {
                    id: row.get(0)?,
                    connectable_id: row.get(2)?,
                    current: row.get(3)?,
                    voltage: row.get(4)?,
                });
            }
        }
    }

    ids.iter()
        .map(|id| {
            faults
                .remove(id)
                .ok_or_else(|| StoreError::Corrupt(format!("fault result {id} vanished mid-read")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use sca_core::{
        FaultResult, FeederResult, FilterOperator, FilterScope, Job, JobStatus, ResultTree,
        SortOrder,
    };
    use serde_json::json;

    fn fault(name: &str, current: f64, feeders: &[(&str, f64)]) -> FaultResult {
        FaultResult {
            fault_id: name.into(),
            fault_type: "THREE_PHASE".into(),
            current,
            power: current / 50.0,
            violations: Vec::new(),
            feeders: feeders
                .iter()
                .map(|(id, current)| FeederResult {
                    connectable_id: (*id).into(),
                    current: *current,
                    voltage: 10.0,
                })
                .collect(),
        }
    }

    fn completed_job(store: &SqliteStore, tree: &ResultTree) -> JobId {
        let job = Job::new(JobId::new(), JobStatus::Running, "grid_a", None, json!({}));
        store.insert_job(&job).unwrap();
        store.complete(&job.id, Some(tree)).unwrap();
        job.id
    }

    fn feeder_currents(fault: &FaultResultView) -> Vec<f64> {
        fault.feeders.iter().map(|f| f.current).collect()
    }

    #[test]
    fn test_pages_by_identity_with_feeders_descending() {
        let store = SqliteStore::open_in_memory().unwrap();
        let feeders = [("TR_1", 5.0), ("TR_2", 9.0), ("TR_3", 1.0)];
        let tree = ResultTree {
            faults: vec![
                fault("BUS_A", 100.0, &feeders),
                fault("BUS_B", 200.0, &feeders),
                fault("BUS_C", 300.0, &feeders),
            ],
        };
        let job = completed_job(&store, &tree);

        let first = store.results_page(&job, &[], &PageRequest::new(0, 2)).unwrap();
        assert_eq!(first.total_elements, 3);
        assert_eq!(first.total_pages, 2);
        let names: Vec<&str> = first.content.iter().map(|f| f.fault_id.as_str()).collect();
        assert_eq!(names, vec!["BUS_A", "BUS_B"]);
        assert!(first.content[0].id < first.content[1].id);
        for fault in &first.content {
            assert_eq!(feeder_currents(fault), vec![9.0, 5.0, 1.0]);
        }

        let second = store.results_page(&job, &[], &PageRequest::new(1, 2)).unwrap();
        assert_eq!(second.content.len(), 1);
        assert_eq!(second.content[0].fault_id, "BUS_C");
        assert!(second.is_last());
    }

    #[test]
    fn test_feeder_filter_qualifies_parent_and_keeps_all_feeders() {
        let store = SqliteStore::open_in_memory().unwrap();
        let tree = ResultTree {
            faults: vec![
                fault("BUS_A", 100.0, &[("TR_1", 1.0)]),
                fault("BUS_B", 200.0, &[("LINE_7", 3.0), ("TR_2", 4.0), ("LINE_8", 2.0)]),
                fault("BUS_C", 300.0, &[("GEN_1", 2.0)]),
            ],
        };
        let job = completed_job(&store, &tree);
        let filter = FilterDescriptor::text("feeders.id", FilterOperator::Contains, "LINE");

        let page = store
            .results_page(&job, &[filter.clone()], &PageRequest::default())
            .unwrap();
        assert_eq!(page.total_elements, 1);
        assert_eq!(page.content.len(), 1);
        assert_eq!(page.content[0].fault_id, "BUS_B");
        assert_eq!(feeder_currents(&page.content[0]), vec![4.0, 3.0, 2.0]);

        let display = filter.with_scope(FilterScope::ChildDisplay);
        let page = store
            .results_page(&job, &[display], &PageRequest::default())
            .unwrap();
        assert_eq!(page.total_elements, 3);
        let shown: Vec<usize> = page.content.iter().map(|f| f.feeders.len()).collect();
        assert_eq!(shown, vec![0, 2, 0]);
        assert_eq!(feeder_currents(&page.content[1]), vec![3.0, 2.0]);
    }

    #[test]
    fn test_multiple_matching_feeders_do_not_duplicate_parent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let tree = ResultTree {
            faults: vec![
                fault("BUS_A", 1.0, &[("LINE_1", 1.0), ("LINE_2", 2.0), ("LINE_3", 3.0)]),
                fault("BUS_B", 1.0, &[("LINE_4", 1.0)]),
            ],
        };
        let job = completed_job(&store, &tree);
        let filter = FilterDescriptor::text("feeders.id", FilterOperator::StartsWith, "LINE");

        let first = store
            .results_page(&job, &[filter.clone()], &PageRequest::new(0, 1))
            .unwrap();
        let second = store
            .results_page(&job, &[filter], &PageRequest::new(1, 1))
            .unwrap();
        assert_eq!(first.total_elements, 2);
        assert_eq!(first.content[0].fault_id, "BUS_A");
        assert_eq!(second.content[0].fault_id, "BUS_B");
    }

    #[test]
    fn test_consecutive_pages_cover_ties_exactly_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut rng = StdRng::seed_from_u64(17);
        let faults = (0..37)
            .map(|i| {
                // Few distinct values, so most sort keys tie.
                let current = f64::from(rng.gen_range(0..4_u8)) * 100.0;
                fault(&format!("BUS_{i:02}"), current, &[("LINE_1", 1.0)])
            })
            .collect();
        let job = completed_job(&store, &ResultTree { faults });

        for size in [1, 4, 5, 36, 37, 50] {
            let mut seen = Vec::new();
            let mut page_no = 0;
            loop {
                let request =
                    PageRequest::new(page_no, size).sorted_by(SortOrder::desc("summary.current"));
                let page = store.results_page(&job, &[], &request).unwrap();
                seen.extend(page.content.iter().map(|f| (f.current, f.id)));
                if page.is_last() {
                    break;
                }
                page_no += 1;
            }
            assert_eq!(seen.len(), 37, "page size {size}");
            for pair in seen.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                assert!(a.0 > b.0 || (a.0 == b.0 && a.1 < b.1), "page size {size}");
            }
        }
    }

    #[test]
    fn test_repeated_reads_are_identical() {
        let store = SqliteStore::open_in_memory().unwrap();
        let tree = ResultTree {
            faults: vec![
                fault("BUS_A", 10.0, &[("LINE_1", 1.0), ("TR_1", 1.0)]),
                fault("BUS_B", 10.0, &[("LINE_2", 3.0)]),
            ],
        };
        let job = completed_job(&store, &tree);
        let filters = [
            FilterDescriptor::number("summary.current", FilterOperator::GreaterThanOrEqual, 5.0),
            FilterDescriptor::text("feeders.id", FilterOperator::Contains, "LINE"),
        ];
        let request = PageRequest::new(0, 10).sorted_by(SortOrder::asc("feeders.id"));

        let first = store.results_page(&job, &filters, &request).unwrap();
        let second = store.results_page(&job, &filters, &request).unwrap();
        assert_eq!(first, second);
        let names: Vec<&str> = first.content[0]
            .feeders
            .iter()
            .map(|f| f.connectable_id.as_str())
            .collect();
        assert_eq!(names, vec!["LINE_1", "TR_1"]);
    }

    #[test]
    fn test_invalid_filter_reported_before_job_lookup() {
        let store = SqliteStore::open_in_memory().unwrap();
        let bad = FilterDescriptor::text("feeders.name", FilterOperator::Equals, "x");
        assert!(matches!(
            store.results_page(&JobId::new(), &[bad], &PageRequest::default()),
            Err(StoreError::InvalidFilter(_))
        ));

        let bad_sort = PageRequest::default()
            .sorted_by(SortOrder::asc("feeders.id"))
            .sorted_by(SortOrder::asc("feeders.current"));
        assert!(matches!(
            store.results_page(&JobId::new(), &[], &bad_sort),
            Err(StoreError::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_unknown_job_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .results_page(&JobId::new(), &[], &PageRequest::default())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_job_without_tree_yields_empty_page() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = Job::new(JobId::new(), JobStatus::Running, "grid_a", None, json!({}));
        store.insert_job(&job).unwrap();

        let page = store.results_page(&job.id, &[], &PageRequest::default()).unwrap();
        assert!(page.content.is_empty());
        assert_eq!(page.total_elements, 0);
    }

    #[test]
    fn test_page_past_the_end_keeps_total() {
        let store = SqliteStore::open_in_memory().unwrap();
        let tree = ResultTree {
            faults: vec![fault("BUS_A", 1.0, &[]), fault("BUS_B", 2.0, &[])],
        };
        let job = completed_job(&store, &tree);

        let page = store.results_page(&job, &[], &PageRequest::new(5, 2)).unwrap();
        assert!(page.content.is_empty());
        assert_eq!(page.total_elements, 2);
    }

    #[test]
    fn test_null_equals_matches_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let tree = ResultTree {
            faults: vec![fault("BUS_A", 1.0, &[])],
        };
        let job = completed_job(&store, &tree);
        let mut filter = FilterDescriptor::text("fault.id", FilterOperator::Equals, "");
        filter.value = serde_json::Value::Null;

        let page = store
            .results_page(&job, &[filter], &PageRequest::default())
            .unwrap();
        assert_eq!(page.total_elements, 0);
    }

    #[test]
    fn test_violations_are_hydrated_in_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut with_violations = fault("BUS_A", 12_000.0, &[]);
        with_violations.violations = vec![
            Violation {
                subject_id: "BUS_A".into(),
                limit_type: "HIGH_SHORT_CIRCUIT_CURRENT".into(),
                limit: 10_000.0,
                value: 12_000.0,
            },
            Violation {
                subject_id: "BUS_A".into(),
                limit_type: "LOW_SHORT_CIRCUIT_CURRENT".into(),
                limit: 100.0,
                value: 12_000.0,
            },
        ];
        let job = completed_job(
            &store,
            &ResultTree {
                faults: vec![with_violations.clone()],
            },
        );

        let page = store.results_page(&job, &[], &PageRequest::default()).unwrap();
        assert_eq!(page.content[0].violations, with_violations.violations);
    }
}
