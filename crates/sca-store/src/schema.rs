use rusqlite::Connection;

use crate::StoreError;

pub(crate) const SCHEMA_VERSION: i64 = 1;

/// Job records plus the result tree they own.
///
/// `results.job_id` cascades, so deleting a job drops its tree. `jobs.result_id`
/// is a plain pointer cleared whenever the tree is dropped.
pub(crate) fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            dataset_ref TEXT NOT NULL,
            variant TEXT,
            parameters TEXT NOT NULL,
            result_id INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_results_job ON results(job_id);

        CREATE TABLE IF NOT EXISTS fault_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            result_id INTEGER NOT NULL REFERENCES results(id) ON DELETE CASCADE,
            fault_id TEXT NOT NULL,
            fault_type TEXT NOT NULL,
            current REAL NOT NULL,
            power REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_fault_results_result ON fault_results(result_id);

        CREATE TABLE IF NOT EXISTS violations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fault_result_id INTEGER NOT NULL REFERENCES fault_results(id) ON DELETE CASCADE,
            subject_id TEXT NOT NULL,
            limit_type TEXT NOT NULL,
            limit_value REAL NOT NULL,
            value REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_violations_fault ON violations(fault_result_id);

        CREATE TABLE IF NOT EXISTS feeder_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fault_result_id INTEGER NOT NULL REFERENCES fault_results(id) ON DELETE CASCADE,
            connectable_id TEXT NOT NULL,
            current REAL NOT NULL,
            voltage REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_feeder_results_fault ON feeder_results(fault_result_id);
        "#,
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}
