// src/store/sqlite.rs
//! SQLite-backed function and execution store
//!
//! Timestamps are stored as Unix milliseconds, JSON values as text.

use super::{ExecutionSink, FunctionStore, StatusUpdate};
use crate::runtime::function::FunctionSpec;
use crate::runtime::outcome::ExecutionState;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const ORPHAN_ERROR: &str = "execution abandoned: no terminal status was recorded";

/// Stored execution row
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub function_id: String,
    pub caller: String,
    pub status: ExecutionState,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub logs: Option<String>,
    pub duration_ms: Option<u64>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Function and execution tables behind one connection
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::Storage(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn).await?;
        info!("Execution store opened at {}", path.display());
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?).await
    }

    async fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            db: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS functions (
                id TEXT PRIMARY KEY,
                runtime TEXT NOT NULL,
                code TEXT NOT NULL,
                entry_point TEXT NOT NULL,
                memory_mb INTEGER NOT NULL,
                timeout_secs INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                function_id TEXT NOT NULL,
                caller TEXT NOT NULL,
                status TEXT NOT NULL,
                input TEXT,
                output TEXT,
                error TEXT,
                logs TEXT,
                duration_ms INTEGER,
                exit_code INTEGER,
                timeout_secs INTEGER,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
            "#,
        )?;
        Ok(())
    }

    /// Insert or replace a function definition
    pub async fn put_function(&self, function: &FunctionSpec) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO functions (id, runtime, code, entry_point, memory_mb, timeout_secs, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                runtime = excluded.runtime,
                code = excluded.code,
                entry_point = excluded.entry_point,
                memory_mb = excluded.memory_mb,
                timeout_secs = excluded.timeout_secs,
                updated_at = excluded.updated_at
            "#,
            params![
                function.id,
                function.runtime,
                function.code,
                function.entry_point,
                function.memory_mb as i64,
                function.timeout_secs as i64,
                Utc::now().timestamp_millis(),
            ],
        )?;
        debug!("Stored function {}", function.id);
        Ok(())
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                r#"
                SELECT id, function_id, caller, status, input, output, error, logs,
                       duration_ms, exit_code, created_at, started_at, completed_at
                FROM executions WHERE id = ?1
                "#,
                params![id],
                execution_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Fail executions a previous process left behind.
    ///
    /// A `running` row is orphaned once its start time plus the function
    /// timeout plus `grace` has passed; a `pending` row once `grace` has
    /// passed since it was accepted. Returns the number of rows failed.
    pub async fn sweep_orphans(&self, grace: Duration) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let grace_ms = grace.as_millis() as i64;
        let db = self.db.lock().await;
        let swept = db.execute(
            r#"
            UPDATE executions
            SET status = 'failed', error = ?1, exit_code = -1, completed_at = ?2
            WHERE (status = 'running'
                   AND started_at + COALESCE(timeout_secs, 0) * 1000 + ?3 < ?2)
               OR (status = 'pending' AND created_at + ?3 < ?2)
            "#,
            params![ORPHAN_ERROR, now, grace_ms],
        )?;
        if swept > 0 {
            warn!("Marked {} orphaned executions as failed", swept);
        }
        Ok(swept)
    }
}

fn millis_to_datetime(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let status: String = row.get(3)?;
    let status = ExecutionState::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown execution status '{}'", status).into(),
        )
    })?;
    let created_at: i64 = row.get(10)?;

    Ok(ExecutionRecord {
        id: row.get(0)?,
        function_id: row.get(1)?,
        caller: row.get(2)?,
        status,
        input: row.get(4)?,
        output: row.get(5)?,
        error: row.get(6)?,
        logs: row.get(7)?,
        duration_ms: row.get::<_, Option<i64>>(8)?.map(|d| d.max(0) as u64),
        exit_code: row.get(9)?,
        created_at: millis_to_datetime(Some(created_at)).unwrap_or_default(),
        started_at: millis_to_datetime(row.get(11)?),
        completed_at: millis_to_datetime(row.get(12)?),
    })
}

#[async_trait]
impl FunctionStore for SqliteStore {
    async fn get_function(&self, id: &str) -> Result<Option<FunctionSpec>> {
        let db = self.db.lock().await;
        let function = db
            .query_row(
                r#"
                SELECT id, runtime, code, entry_point, memory_mb, timeout_secs
                FROM functions WHERE id = ?1
                "#,
                params![id],
                |row| {
                    Ok(FunctionSpec {
                        id: row.get(0)?,
                        runtime: row.get(1)?,
                        code: row.get(2)?,
                        entry_point: row.get(3)?,
                        memory_mb: row.get::<_, i64>(4)?.max(0) as u64,
                        timeout_secs: row.get::<_, i64>(5)?.max(0) as u64,
                    })
                },
            )
            .optional()?;
        Ok(function)
    }
}

#[async_trait]
impl ExecutionSink for SqliteStore {
    async fn record(&self, update: StatusUpdate) -> Result<()> {
        let at = update.at.timestamp_millis();
        let db = self.db.lock().await;

        match (update.state, update.outcome) {
            (ExecutionState::Pending, _) => {
                db.execute(
                    r#"
                    INSERT INTO executions (id, function_id, caller, status, input, created_at)
                    VALUES (?1, ?2, ?3, 'pending', ?4, ?5)
                    "#,
                    params![
                        update.execution_id,
                        update.function_id,
                        update.caller,
                        update.input,
                        at
                    ],
                )?;
            }
            (ExecutionState::Running, _) => {
                db.execute(
                    r#"
                    UPDATE executions SET status = 'running', started_at = ?2, timeout_secs = ?3
                    WHERE id = ?1 AND status = 'pending'
                    "#,
                    params![
                        update.execution_id,
                        at,
                        update.timeout_secs.map(|t| t as i64)
                    ],
                )?;
            }
            (state, Some(outcome)) => {
                db.execute(
                    r#"
                    UPDATE executions
                    SET status = ?2, output = ?3, error = ?4, logs = ?5,
                        duration_ms = ?6, exit_code = ?7, completed_at = ?8
                    WHERE id = ?1 AND status IN ('pending', 'running')
                    "#,
                    params![
                        update.execution_id,
                        state.as_str(),
                        outcome.output,
                        outcome.error,
                        outcome.logs,
                        outcome.duration_ms as i64,
                        outcome.exit_code,
                        at
                    ],
                )?;
            }
            (state, None) => {
                return Err(EngineError::Storage(format!(
                    "terminal update '{}' for {} carries no outcome",
                    state, update.execution_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::function::ExecutionRequest;
    use crate::runtime::outcome::ExecutionOutcome;
    use serde_json::json;

    #[tokio::test]
    async fn test_function_upsert() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        assert!(store.get_function("fn-1").await.unwrap().is_none());

        let function = FunctionSpec::new("fn-1", "python", "def handler(e): return e");
        store.put_function(&function).await.unwrap();
        assert_eq!(store.get_function("fn-1").await.unwrap(), Some(function.clone()));

        let updated = function.with_timeout_secs(5);
        store.put_function(&updated).await.unwrap();
        let stored = store.get_function("fn-1").await.unwrap().unwrap();
        assert_eq!(stored.timeout_secs, 5);
    }

    #[tokio::test]
    async fn test_execution_lifecycle() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let request = ExecutionRequest::new("fn-1", "tester", json!({ "value": 1 }));

        store.record(StatusUpdate::pending(&request)).await.unwrap();
        let record = store.get_execution(&request.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionState::Pending);
        assert_eq!(record.input, Some(json!({ "value": 1 })));

        store
            .record(StatusUpdate::running(&request, Utc::now(), 30))
            .await
            .unwrap();
        let record = store.get_execution(&request.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionState::Running);
        assert!(record.started_at.is_some());

        let outcome = ExecutionOutcome::success(json!({ "ok": true }), "hi".into(), 0)
            .with_execution_id(&request.execution_id);
        store
            .record(StatusUpdate::terminal(&request, &outcome))
            .await
            .unwrap();
        let record = store.get_execution(&request.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionState::Success);
        assert_eq!(record.output, Some(json!({ "ok": true })));
        assert_eq!(record.logs.as_deref(), Some("hi"));
        assert_eq!(record.exit_code, Some(0));
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let request = ExecutionRequest::new("fn-1", "tester", json!({}));
        store.record(StatusUpdate::pending(&request)).await.unwrap();

        let failed = ExecutionOutcome::failed("boom", String::new(), 1);
        store
            .record(StatusUpdate::terminal(&request, &failed))
            .await
            .unwrap();
        let late = ExecutionOutcome::success(json!({}), String::new(), 0);
        store
            .record(StatusUpdate::terminal(&request, &late))
            .await
            .unwrap();

        let record = store.get_execution(&request.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionState::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_sweep_orphans() {
        let store = SqliteStore::open_in_memory().await.unwrap();

        let stale = ExecutionRequest::new("fn-1", "tester", json!({}));
        store.record(StatusUpdate::pending(&stale)).await.unwrap();
        let long_ago = Utc::now() - chrono::Duration::seconds(120);
        store
            .record(StatusUpdate::running(&stale, long_ago, 10))
            .await
            .unwrap();

        let fresh = ExecutionRequest::new("fn-1", "tester", json!({}));
        store.record(StatusUpdate::pending(&fresh)).await.unwrap();
        store
            .record(StatusUpdate::running(&fresh, Utc::now(), 10))
            .await
            .unwrap();

        let swept = store.sweep_orphans(Duration::from_secs(30)).await.unwrap();
        assert_eq!(swept, 1);

        let record = store.get_execution(&stale.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionState::Failed);
        assert_eq!(record.error.as_deref(), Some(ORPHAN_ERROR));
        let record = store.get_execution(&fresh.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionState::Running);
    }

    #[tokio::test]
    async fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("voltrun.db");
        let store = SqliteStore::open(&path).await.unwrap();
        store
            .put_function(&FunctionSpec::new("fn-1", "nodejs", "exports.handler = () => 1"))
            .await
            .unwrap();
        assert!(path.exists());
    }
}
