//! SQLite task store
//!
//! One database file is shared by the server process and every worker
//! process. No in-process lock is visible across those processes, so every
//! write that must be atomic goes through SQLite itself:
//!
//! - Admission runs in a `BEGIN IMMEDIATE` transaction spanning the
//!   Running-count read and the insert. A transaction that cannot get the
//!   write lock within the busy timeout is retried a bounded number of times.
//! - Terminal writes are a single `UPDATE ... WHERE status = 'RUNNING'`, so a
//!   record is closed at most once no matter who races for it.
//!
//! Expired records are removed lazily by reads (`get`, `list`); there is no
//! background timer inside the store.

use super::record::{millis_to_datetime, Admission, Outcome, TaskRecord, TaskStatus};
use crate::config::TaskStoreSettings;
use crate::{Error, Result};
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts of one admission before the store is reported unavailable
const ADMISSION_ATTEMPTS: u32 = 5;

/// Base delay between admission attempts (multiplied by the attempt number)
const ADMISSION_BACKOFF: Duration = Duration::from_millis(20);

const SELECT_COLUMNS: &str =
    "task_id, function_name, status, result, created_at, expires_at";

/// Durable record of tasks and sole authority for concurrency admission
#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
    retention: Duration,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("path", &self.path)
            .field("retention", &self.retention)
            .finish()
    }
}

impl TaskStore {
    /// Attach to the database described by `settings`, creating it if needed
    pub fn open(settings: &TaskStoreSettings) -> Result<Self> {
        if let Some(parent) = settings.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Storage(format!("Failed to create data directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(&settings.path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        conn.busy_timeout(settings.busy_timeout())
            .map_err(|e| Error::Storage(format!("Failed to set busy timeout: {}", e)))?;

        // WAL lets pollers read while a worker writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Storage(format!("Failed to set pragmas: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            retention: settings.retention(),
            path: Some(settings.path.clone()),
        };
        store.initialize_schema()?;

        Ok(store)
    }

    /// Attach and discard every record left by a previous server run
    pub fn open_fresh(settings: &TaskStoreSettings) -> Result<Self> {
        let store = Self::open(settings)?;
        {
            let conn = store.lock()?;
            conn.execute_batch("DROP TABLE IF EXISTS tasks;")
                .map_err(|e| Error::Storage(format!("Failed to reset tasks: {}", e)))?;
        }
        store.initialize_schema()?;
        info!("Task store reset at {}", settings.path.display());
        Ok(store)
    }

    /// Create an in-memory store (for testing; not visible to other processes)
    pub fn in_memory(retention: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            retention,
            path: None,
        };
        store.initialize_schema()?;

        Ok(store)
    }

    /// Database file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                function_name TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('RUNNING', 'DONE', 'FAILED', 'TIMEOUT')),
                result TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                finished_at INTEGER,
                expires_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_function_status
                ON tasks(function_name, status);
            CREATE INDEX IF NOT EXISTS idx_tasks_expires
                ON tasks(expires_at);
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Create a Running record if `function_name` has headroom.
    ///
    /// `max_concurrency == 0` means unlimited. The count and the insert
    /// happen in one write transaction, so two callers can never both take
    /// the last slot.
    pub fn admit_and_create(
        &self,
        task_id: &str,
        function_name: &str,
        max_concurrency: u32,
    ) -> Result<Admission> {
        let mut attempt = 1;
        loop {
            let result = {
                let mut conn = self.lock()?;
                try_admit(&mut conn, task_id, function_name, max_concurrency).map_err(Error::from)
            };

            match result {
                Ok(admission) => return Ok(admission),
                Err(e) if e.is_retryable() && attempt < ADMISSION_ATTEMPTS => {
                    debug!(
                        "Admission for {} busy (attempt {}/{}), retrying",
                        function_name, attempt, ADMISSION_ATTEMPTS
                    );
                    std::thread::sleep(ADMISSION_BACKOFF * attempt);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::Storage(format!(
                        "Failed to admit task {}: {}",
                        task_id, e
                    )))
                }
            }
        }
    }

    // ========================================================================
    // Terminal writes
    // ========================================================================

    /// Record the outcome reported by a worker.
    ///
    /// Returns `false` when the task is unknown or already terminal; the
    /// stored record is left untouched in that case.
    pub fn finish(&self, task_id: &str, outcome: Outcome) -> Result<bool> {
        let (status, payload) = match outcome {
            Outcome::Value(Ok(value)) => (TaskStatus::Done, encode_payload(task_id, &value)),
            Outcome::Value(Err(e)) => {
                warn!("Result of task {} is not JSON serializable: {}", task_id, e);
                (TaskStatus::Done, empty_payload())
            }
            Outcome::Error(message) => {
                (TaskStatus::Failed, encode_payload(task_id, &Value::String(message)))
            }
        };

        self.close_running(task_id, status, &payload)
    }

    /// Fail a still-running task (manual termination, shutdown)
    pub fn force_fail(&self, task_id: &str, reason: &str) -> Result<bool> {
        let payload = encode_payload(task_id, &Value::String(reason.to_string()));
        self.close_running(task_id, TaskStatus::Failed, &payload)
    }

    /// Mark a still-running task as timed out
    pub fn force_timeout(&self, task_id: &str) -> Result<bool> {
        let payload = encode_payload(task_id, &Value::String("timeout".to_string()));
        self.close_running(task_id, TaskStatus::Timeout, &payload)
    }

    /// Fail every still-running task of a function; returns how many changed
    pub fn force_fail_all(&self, function_name: &str, reason: &str) -> Result<usize> {
        let payload = encode_payload(function_name, &Value::String(reason.to_string()));
        let now = Utc::now().timestamp_millis();
        let expires_at = now + self.retention_millis();

        let conn = self.lock()?;
        let changed = conn
            .execute(
                r#"
                UPDATE tasks
                SET status = ?1, result = ?2, finished_at = ?3, expires_at = ?4
                WHERE function_name = ?5 AND status = 'RUNNING'
                "#,
                params![
                    TaskStatus::Failed.as_str(),
                    payload,
                    now,
                    expires_at,
                    function_name
                ],
            )
            .map_err(|e| {
                Error::Storage(format!("Failed to terminate {}: {}", function_name, e))
            })?;

        if changed > 0 {
            debug!("Force failed {} tasks of {}", changed, function_name);
        }
        Ok(changed)
    }

    fn close_running(&self, task_id: &str, status: TaskStatus, payload: &str) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + self.retention_millis();

        let conn = self.lock()?;
        let changed = conn
            .execute(
                r#"
                UPDATE tasks
                SET status = ?1, result = ?2, finished_at = ?3, expires_at = ?4
                WHERE task_id = ?5 AND status = 'RUNNING'
                "#,
                params![status.as_str(), payload, now, expires_at, task_id],
            )
            .map_err(|e| Error::Storage(format!("Failed to finish task {}: {}", task_id, e)))?;

        if changed == 0 {
            debug!(
                "Task {} is not running; {} write ignored",
                task_id,
                status.as_str()
            );
        }
        Ok(changed == 1)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Snapshot of a task, or `None` if unknown or expired
    pub fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.purge_expired()?;

        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM tasks WHERE task_id = ?1", SELECT_COLUMNS),
            params![task_id],
            record_from_row,
        )
        .optional()
        .map_err(|e| Error::Storage(format!("Failed to get task {}: {}", task_id, e)))
    }

    /// Number of Running records of a function
    pub fn count_running(&self, function_name: &str) -> Result<u32> {
        let conn = self.lock()?;
        count_running(&conn, function_name)
            .map_err(|e| Error::Storage(format!("Failed to count {}: {}", function_name, e)))
    }

    /// Every non-expired record of a function, oldest first
    pub fn list(&self, function_name: &str) -> Result<Vec<TaskRecord>> {
        self.purge_expired()?;
        self.query_records(
            &format!(
                "SELECT {} FROM tasks WHERE function_name = ?1 ORDER BY created_at",
                SELECT_COLUMNS
            ),
            function_name,
        )
    }

    /// Running records of a function, oldest first
    pub fn list_running(&self, function_name: &str) -> Result<Vec<TaskRecord>> {
        self.query_records(
            &format!(
                "SELECT {} FROM tasks WHERE function_name = ?1 AND status = 'RUNNING' ORDER BY created_at",
                SELECT_COLUMNS
            ),
            function_name,
        )
    }

    fn query_records(&self, sql: &str, function_name: &str) -> Result<Vec<TaskRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

        let records = stmt
            .query_map(params![function_name], record_from_row)
            .map_err(|e| Error::Storage(format!("Failed to list {}: {}", function_name, e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Storage(format!("Failed to read task row: {}", e)))?;

        Ok(records)
    }

    /// Delete every terminal record whose retention window has passed
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM tasks WHERE expires_at IS NOT NULL AND expires_at < ?1",
                params![now],
            )
            .map_err(|e| Error::Storage(format!("Failed to purge expired tasks: {}", e)))?;

        if removed > 0 {
            debug!("Purged {} expired tasks", removed);
        }
        Ok(removed)
    }

    fn retention_millis(&self) -> i64 {
        i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX / 2)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn try_admit(
    conn: &mut Connection,
    task_id: &str,
    function_name: &str,
    max_concurrency: u32,
) -> rusqlite::Result<Admission> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if max_concurrency > 0 {
        let running = count_running(&tx, function_name)?;
        if running >= max_concurrency {
            // Dropping the transaction rolls it back
            return Ok(Admission::Rejected {
                running,
                limit: max_concurrency,
            });
        }
    }

    let now = Utc::now().timestamp_millis();
    tx.execute(
        r#"
        INSERT INTO tasks (task_id, function_name, status, result, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            task_id,
            function_name,
            TaskStatus::Running.as_str(),
            empty_payload(),
            now
        ],
    )?;
    tx.commit()?;

    Ok(Admission::Admitted(TaskRecord {
        task_id: task_id.to_string(),
        function_name: function_name.to_string(),
        status: TaskStatus::Running,
        result: Value::Object(Default::default()),
        created_at: millis_to_datetime(now),
        expires_at: None,
    }))
}

fn count_running(conn: &Connection, function_name: &str) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE function_name = ?1 AND status = 'RUNNING'",
        params![function_name],
        |row| row.get(0),
    )
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let status: String = row.get(2)?;
    let status = TaskStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown task status {}", status).into(),
        )
    })?;

    let result: String = row.get(3)?;
    let result: Value = serde_json::from_str(&result)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    let created_at: i64 = row.get(4)?;
    let expires_at: Option<i64> = row.get(5)?;

    Ok(TaskRecord {
        task_id: row.get(0)?,
        function_name: row.get(1)?,
        status,
        result,
        created_at: millis_to_datetime(created_at),
        expires_at: expires_at.map(millis_to_datetime),
    })
}

fn empty_payload() -> String {
    "{}".to_string()
}

fn encode_payload(task_id: &str, value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        warn!("Result of task {} is not JSON serializable: {}", task_id, e);
        empty_payload()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Barrier;

    fn store() -> TaskStore {
        TaskStore::in_memory(Duration::from_secs(60)).unwrap()
    }

    fn admitted(store: &TaskStore, task_id: &str, function_name: &str, limit: u32) -> bool {
        store
            .admit_and_create(task_id, function_name, limit)
            .unwrap()
            .is_admitted()
    }

    #[test]
    fn test_admission_respects_limit() {
        let store = store();

        assert!(admitted(&store, "t1", "slow", 2));
        assert!(admitted(&store, "t2", "slow", 2));
        assert_eq!(
            store.admit_and_create("t3", "slow", 2).unwrap(),
            Admission::Rejected {
                running: 2,
                limit: 2
            }
        );
        // Rejection writes nothing
        assert!(store.get("t3").unwrap().is_none());

        // Other functions have their own budget
        assert!(admitted(&store, "o1", "other", 1));

        // A finished task frees exactly one slot
        assert!(store.finish("t1", Outcome::value(json!(1))).unwrap());
        assert!(admitted(&store, "t4", "slow", 2));
        assert!(!admitted(&store, "t5", "slow", 2));
        assert_eq!(store.count_running("slow").unwrap(), 2);
    }

    #[test]
    fn test_zero_limit_is_unbounded() {
        let store = store();
        for i in 0..50 {
            assert!(admitted(&store, &format!("t{}", i), "free", 0));
        }
        assert_eq!(store.count_running("free").unwrap(), 50);
    }

    #[test]
    fn test_duplicate_task_id_is_an_error() {
        let store = store();
        assert!(admitted(&store, "same", "f", 0));
        assert!(matches!(
            store.admit_and_create("same", "f", 0),
            Err(Error::Storage(_))
        ));
    }

    #[test]
    fn test_concurrent_admission_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let settings = TaskStoreSettings::new(dir.path().join("tasks.db"));
        TaskStore::open_fresh(&settings).unwrap();

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let settings = settings.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    // Separate connection per thread, as a separate process would have
                    let store = TaskStore::open(&settings).unwrap();
                    barrier.wait();
                    store
                        .admit_and_create(&format!("task-{}", i), "limited", 3)
                        .unwrap()
                        .is_admitted()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 3);
        let store = TaskStore::open(&settings).unwrap();
        assert_eq!(store.count_running("limited").unwrap(), 3);
    }

    #[test]
    fn test_finish_writes_once() {
        let store = store();
        assert!(admitted(&store, "t1", "add", 0));

        assert!(store.finish("t1", Outcome::value(json!(7))).unwrap());
        assert!(!store.finish("t1", Outcome::error("late")).unwrap());
        assert!(!store.force_fail("t1", "Manual Termination").unwrap());
        assert!(!store.force_timeout("t1").unwrap());

        let record = store.get("t1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Done);
        assert_eq!(record.result, json!(7));
        assert!(record.expires_at.is_some());
    }

    #[test]
    fn test_finish_unknown_task_is_noop() {
        let store = store();
        assert!(!store.finish("missing", Outcome::value(json!(1))).unwrap());
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_error_outcome_fails_with_message() {
        let store = store();
        assert!(admitted(&store, "t1", "fail", 0));
        store.finish("t1", Outcome::error("boom")).unwrap();

        let record = store.get("t1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.result, json!("boom"));
    }

    #[test]
    fn test_unserializable_result_degrades_to_empty_payload() {
        let store = store();
        assert!(admitted(&store, "t1", "weird", 0));

        let mut map = HashMap::new();
        map.insert((1, 2), "tuple keys are not JSON");
        let outcome = Outcome::Value(serde_json::to_value(map));

        assert!(store.finish("t1", outcome).unwrap());
        let record = store.get("t1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Done);
        assert_eq!(record.result, json!({}));
    }

    #[test]
    fn test_force_fail_all_only_touches_running() {
        let store = store();
        assert!(admitted(&store, "a", "f", 0));
        assert!(admitted(&store, "b", "f", 0));
        assert!(admitted(&store, "c", "g", 0));
        store.finish("a", Outcome::value(json!("kept"))).unwrap();

        assert_eq!(store.force_fail_all("f", "Manual Termination").unwrap(), 1);

        assert_eq!(store.get("a").unwrap().unwrap().result, json!("kept"));
        let b = store.get("b").unwrap().unwrap();
        assert_eq!(b.status, TaskStatus::Failed);
        assert_eq!(b.result, json!("Manual Termination"));
        assert_eq!(store.get("c").unwrap().unwrap().status, TaskStatus::Running);
        assert_eq!(store.force_fail_all("f", "again").unwrap(), 0);
    }

    #[test]
    fn test_force_timeout() {
        let store = store();
        assert!(admitted(&store, "t1", "slow", 1));
        assert!(store.force_timeout("t1").unwrap());

        let record = store.get("t1").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Timeout);
        assert_eq!(record.result, json!("timeout"));
        assert!(record.is_failed());
        assert_eq!(store.count_running("slow").unwrap(), 0);
    }

    #[test]
    fn test_retention_window() {
        let store = TaskStore::in_memory(Duration::from_millis(400)).unwrap();
        assert!(admitted(&store, "t1", "f", 0));

        // Running records never expire
        std::thread::sleep(Duration::from_millis(500));
        assert!(store.get("t1").unwrap().is_some());

        store.finish("t1", Outcome::value(json!(1))).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert!(store.get("t1").unwrap().is_some());

        std::thread::sleep(Duration::from_millis(400));
        assert!(store.get("t1").unwrap().is_none());
        assert!(store.list("f").unwrap().is_empty());
    }

    #[test]
    fn test_list_and_list_running() {
        let store = store();
        assert!(admitted(&store, "a", "f", 0));
        assert!(admitted(&store, "b", "f", 0));
        assert!(admitted(&store, "c", "g", 0));
        store.finish("a", Outcome::value(json!(null))).unwrap();

        let all: Vec<_> = store.list("f").unwrap().into_iter().map(|r| r.task_id).collect();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&"a".to_string()) && all.contains(&"b".to_string()));

        let running = store.list_running("f").unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_id, "b");
        assert!(store.list("unknown").unwrap().is_empty());
    }

    #[test]
    fn test_open_fresh_discards_previous_records() {
        let dir = tempfile::tempdir().unwrap();
        let settings = TaskStoreSettings::new(dir.path().join("nested").join("tasks.db"));

        let store = TaskStore::open(&settings).unwrap();
        assert!(admitted(&store, "old", "f", 0));
        drop(store);

        let reopened = TaskStore::open(&settings).unwrap();
        assert!(reopened.get("old").unwrap().is_some());

        let fresh = TaskStore::open_fresh(&settings).unwrap();
        assert!(fresh.get("old").unwrap().is_none());
        assert_eq!(fresh.path(), Some(settings.path.as_path()));
    }
}
