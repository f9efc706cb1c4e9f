//! Job records and their transitions.
//!
//! Every method is one transaction. `result_id` is set only by [`SqliteStore::complete`]
//! and cleared whenever the tree is dropped, so it never points at a tree for
//! a job that is not `COMPLETED`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use sca_core::{Job, JobId, JobStatus, ResultTree};

use crate::{SqliteStore, StoreError};

impl SqliteStore {
    /// Persist a new job. Fails with [`StoreError::Duplicate`] if the id is taken.
    pub fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if job_exists(&tx, &job.id)? {
            return Err(StoreError::Duplicate(job.id));
        }
        tx.execute(
            r#"
            INSERT INTO jobs(id, status, dataset_ref, variant, parameters, result_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7)
            "#,
            params![
                job.id.to_string(),
                job.status.as_str(),
                job.dataset_ref,
                job.variant,
                serde_json::to_string(&job.parameters)?,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                r#"
                SELECT status, dataset_ref, variant, parameters, result_id, created_at, updated_at
                FROM jobs WHERE id = ?1
                "#,
                [id.to_string()],
                |row| {
                    Ok(JobRow {
                        status: row.get(0)?,
                        dataset_ref: row.get(1)?,
                        variant: row.get(2)?,
                        parameters: row.get(3)?,
                        result_ref: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        row.map(|row| row.into_job(*id)).transpose()
    }

    pub fn status(&self, id: &JobId) -> Result<Option<JobStatus>, StoreError> {
        let conn = self.conn();
        let raw: Option<String> = conn
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| parse_status(&raw)).transpose()
    }

    pub fn exists(&self, id: &JobId) -> Result<bool, StoreError> {
        job_exists(&self.conn(), id)
    }

    pub fn result_ref(&self, id: &JobId) -> Result<Option<i64>, StoreError> {
        let conn = self.conn();
        let value: Option<Option<i64>> = conn
            .query_row(
                "SELECT result_id FROM jobs WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    /// Move one job to `status`. Returns `false` if the record is gone.
    /// Leaving `COMPLETED` drops the persisted tree.
    pub fn set_job_status(&self, id: &JobId, status: JobStatus) -> Result<bool, StoreError> {
        Ok(self.set_status(std::slice::from_ref(id), status)? == 1)
    }

    /// Overwrite the status of every listed job that still exists. Any status
    /// other than `COMPLETED` drops the job's result tree in the same
    /// transaction. Returns the number of distinct records touched.
    pub fn set_status(&self, ids: &[JobId], status: JobStatus) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut touched = 0;
        let unique: BTreeSet<&JobId> = ids.iter().collect();
        for id in unique {
            let key = id.to_string();
            if status != JobStatus::Completed {
                drop_tree(&tx, &key)?;
            }
            touched += tx.execute(
                "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![key, status.as_str(), now],
            )?;
        }
        tx.commit()?;
        Ok(touched)
    }

    /// Persist `tree` (if any) and mark the job `COMPLETED`, atomically.
    /// Returns `false` without writing anything if the record is gone.
    pub fn complete(&self, id: &JobId, tree: Option<&ResultTree>) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if !job_exists(&tx, id)? {
            return Ok(false);
        }

        let key = id.to_string();
        let now = Utc::now().to_rfc3339();
        drop_tree(&tx, &key)?;
        let result_id = match tree {
            Some(tree) => Some(insert_tree(&tx, &key, tree, &now)?),
            None => None,
        };
        tx.execute(
            "UPDATE jobs SET status = ?2, result_id = ?3, updated_at = ?4 WHERE id = ?1",
            params![key, JobStatus::Completed.as_str(), result_id, now],
        )?;
        tx.commit()?;

        tracing::debug!(
            job_id = %id,
            faults = tree.map_or(0, |t| t.faults.len()),
            "result tree persisted"
        );
        Ok(true)
    }

    /// Remove a job and its result tree. Returns `false` if nothing was there.
    pub fn delete(&self, id: &JobId) -> Result<bool, StoreError> {
        let conn = self.conn();
        let removed = conn.execute("DELETE FROM jobs WHERE id = ?1", [id.to_string()])?;
        Ok(removed > 0)
    }

    pub fn delete_all(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM results", [])?;
        let removed = tx.execute("DELETE FROM jobs", [])?;
        tx.commit()?;
        Ok(removed)
    }
}

pub(crate) fn job_exists(conn: &Connection, id: &JobId) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM jobs WHERE id = ?1",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn drop_tree(tx: &Transaction<'_>, key: &str) -> Result<(), StoreError> {
    tx.execute("DELETE FROM results WHERE job_id = ?1", [key])?;
    tx.execute("UPDATE jobs SET result_id = NULL WHERE id = ?1", [key])?;
    Ok(())
}

fn insert_tree(
    tx: &Transaction<'_>,
    key: &str,
    tree: &ResultTree,
    now: &str,
) -> Result<i64, StoreError> {
    tx.execute(
        "INSERT INTO results(job_id, created_at) VALUES (?1, ?2)",
        params![key, now],
    )?;
    let result_id = tx.last_insert_rowid();

    let mut fault_stmt = tx.prepare(
        "INSERT INTO fault_results(result_id, fault_id, fault_type, current, power) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    let mut violation_stmt = tx.prepare(
        "INSERT INTO violations(fault_result_id, subject_id, limit_type, limit_value, value) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    let mut feeder_stmt = tx.prepare(
        "INSERT INTO feeder_results(fault_result_id, connectable_id, current, voltage) VALUES (?1, ?2, ?3, ?4)",
    )?;

    for fault in &tree.faults {
        fault_stmt.execute(params![
            result_id,
            fault.fault_id,
            fault.fault_type,
            fault.current,
            fault.power
        ])?;
        let fault_row = tx.last_insert_rowid();
        for violation in &fault.violations {
            violation_stmt.execute(params![
                fault_row,
                violation.subject_id,
                violation.limit_type,
                violation.limit,
                violation.value
            ])?;
        }
        for feeder in &fault.feeders {
            feeder_stmt.execute(params![
                fault_row,
                feeder.connectable_id,
                feeder.current,
                feeder.voltage
            ])?;
        }
    }
    Ok(result_id)
}

struct JobRow {
    status: String,
    dataset_ref: String,
    variant: Option<String>,
    parameters: String,
    result_ref: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn into_job(self, id: JobId) -> Result<Job, StoreError> {
        Ok(Job {
            id,
            status: parse_status(&self.status)?,
            dataset_ref: self.dataset_ref,
            variant: self.variant,
            parameters: serde_json::from_str(&self.parameters)?,
            result_ref: self.result_ref,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    JobStatus::parse(raw).ok_or_else(|| StoreError::Corrupt(format!("job status '{raw}'")))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("timestamp '{raw}': {err}")))
}
