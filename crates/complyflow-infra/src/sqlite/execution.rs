//! SQLite execution repository implementation.
//!
//! Implements `ExecutionRepository` from `complyflow-core` using sqlx with
//! split read/write pools. JSON payloads (input, output, metadata, event
//! detail) are stored as text. Terminal writes are a single conditional
//! UPDATE on `status = 'RUNNING'`, which makes the first terminal write win.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use complyflow_core::repository::execution::ExecutionRepository;
use complyflow_types::error::RepositoryError;
use complyflow_types::execution::{
    ExecutionEvent, ExecutionEventKind, ExecutionFilter, ExecutionRecord, ExecutionStatus,
};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ExecutionRepository`.
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    execution_id: String,
    workflow_type: String,
    tenant_id: String,
    correlation_id: String,
    status: String,
    start_time: String,
    stop_time: Option<String>,
    input: String,
    output: Option<String>,
    error: Option<String>,
    cause: Option<String>,
    current_state: Option<String>,
    started_by: Option<String>,
    metadata: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            workflow_type: row.try_get("workflow_type")?,
            tenant_id: row.try_get("tenant_id")?,
            correlation_id: row.try_get("correlation_id")?,
            status: row.try_get("status")?,
            start_time: row.try_get("start_time")?,
            stop_time: row.try_get("stop_time")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            cause: row.try_get("cause")?,
            current_state: row.try_get("current_state")?,
            started_by: row.try_get("started_by")?,
            metadata: row.try_get("metadata")?,
        })
    }

    fn into_record(self) -> Result<ExecutionRecord, RepositoryError> {
        let status: ExecutionStatus = self.status.parse().map_err(RepositoryError::Query)?;
        Ok(ExecutionRecord {
            execution_id: parse_uuid(&self.execution_id)?,
            workflow_type: self.workflow_type,
            tenant_id: self.tenant_id,
            correlation_id: self.correlation_id,
            status,
            start_time: parse_datetime(&self.start_time)?,
            stop_time: self.stop_time.as_deref().map(parse_datetime).transpose()?,
            input: parse_json(&self.input, "input")?,
            output: self
                .output
                .as_deref()
                .map(|s| parse_json(s, "output"))
                .transpose()?,
            error: self.error,
            cause: self.cause,
            current_state: self.current_state,
            started_by: self.started_by,
            metadata: self
                .metadata
                .as_deref()
                .map(|s| parse_json(s, "metadata"))
                .transpose()?,
        })
    }
}

struct EventRow {
    execution_id: String,
    sequence: i64,
    timestamp: String,
    kind: String,
    state_name: Option<String>,
    scope: String,
    detail: Option<String>,
}

impl EventRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            sequence: row.try_get("sequence")?,
            timestamp: row.try_get("timestamp")?,
            kind: row.try_get("kind")?,
            state_name: row.try_get("state_name")?,
            scope: row.try_get("scope")?,
            detail: row.try_get("detail")?,
        })
    }

    fn into_event(self) -> Result<ExecutionEvent, RepositoryError> {
        let kind: ExecutionEventKind = self.kind.parse().map_err(RepositoryError::Query)?;
        Ok(ExecutionEvent {
            execution_id: parse_uuid(&self.execution_id)?,
            sequence: self.sequence.max(0) as u64,
            timestamp: parse_datetime(&self.timestamp)?,
            kind,
            state_name: self.state_name,
            scope: self.scope,
            detail: self
                .detail
                .as_deref()
                .map(|s| parse_json(s, "detail"))
                .transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_json(s: &str, field: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {field} JSON: {e}")))
}

fn to_json(value: &Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn opt_json(value: Option<&Value>) -> Result<Option<String>, RepositoryError> {
    value.map(to_json).transpose()
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteExecutionRepository {
    async fn insert(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO executions
               (execution_id, workflow_type, tenant_id, correlation_id, status, start_time,
                stop_time, input, output, error, cause, current_state, started_by, metadata)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.execution_id.to_string())
        .bind(&record.workflow_type)
        .bind(&record.tenant_id)
        .bind(&record.correlation_id)
        .bind(record.status.as_str())
        .bind(format_datetime(&record.start_time))
        .bind(record.stop_time.as_ref().map(format_datetime))
        .bind(to_json(&record.input)?)
        .bind(opt_json(record.output.as_ref())?)
        .bind(&record.error)
        .bind(&record.cause)
        .bind(&record.current_state)
        .bind(&record.started_by)
        .bind(opt_json(record.metadata.as_ref())?)
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                RepositoryError::Conflict(format!("execution {} already exists", record.execution_id)),
            ),
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn get(&self, execution_id: &Uuid) -> Result<Option<ExecutionRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn replace_if_running(&self, record: &ExecutionRecord) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE executions
               SET status = ?, stop_time = ?, output = ?, error = ?, cause = ?, current_state = ?
               WHERE execution_id = ? AND status = 'RUNNING'"#,
        )
        .bind(record.status.as_str())
        .bind(record.stop_time.as_ref().map(format_datetime))
        .bind(opt_json(record.output.as_ref())?)
        .bind(&record.error)
        .bind(&record.cause)
        .bind(&record.current_state)
        .bind(record.execution_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM executions WHERE execution_id = ?")
            .bind(record.execution_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        match exists {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn set_current_state(
        &self,
        execution_id: &Uuid,
        state_name: &str,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE executions SET current_state = ? WHERE execution_id = ? AND status = 'RUNNING'",
        )
        .bind(state_name)
        .bind(execution_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(
        &self,
        filter: &ExecutionFilter,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let status = filter.status.map(|s| s.as_str());
        let rows = sqlx::query(
            r#"SELECT * FROM executions
               WHERE (? IS NULL OR tenant_id = ?)
                 AND (? IS NULL OR workflow_type = ?)
                 AND (? IS NULL OR status = ?)
               ORDER BY start_time DESC
               LIMIT ?"#,
        )
        .bind(&filter.tenant_id)
        .bind(&filter.tenant_id)
        .bind(&filter.workflow_type)
        .bind(&filter.workflow_type)
        .bind(status)
        .bind(status)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }

    async fn append_event(&self, event: &ExecutionEvent) -> Result<u64, RepositoryError> {
        // The single writer connection serializes the MAX+1 read and insert.
        let row = sqlx::query(
            r#"INSERT INTO execution_events
               (execution_id, sequence, timestamp, kind, state_name, scope, detail)
               SELECT ?, COALESCE(MAX(sequence), 0) + 1, ?, ?, ?, ?, ?
               FROM execution_events WHERE execution_id = ?
               RETURNING sequence"#,
        )
        .bind(event.execution_id.to_string())
        .bind(format_datetime(&event.timestamp))
        .bind(event.kind.as_str())
        .bind(&event.state_name)
        .bind(&event.scope)
        .bind(opt_json(event.detail.as_ref())?)
        .bind(event.execution_id.to_string())
        .fetch_one(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let sequence: i64 = row
            .try_get("sequence")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(sequence.max(0) as u64)
    }

    async fn list_events(&self, execution_id: &Uuid) -> Result<Vec<ExecutionEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_events WHERE execution_id = ? ORDER BY sequence ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = EventRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            events.push(r.into_event()?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn sample_record(tenant: &str, workflow_type: &str, offset_secs: i64) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: Uuid::now_v7(),
            workflow_type: workflow_type.to_string(),
            tenant_id: tenant.to_string(),
            correlation_id: "corr-1".to_string(),
            status: ExecutionStatus::Running,
            start_time: Utc::now() + Duration::seconds(offset_secs),
            stop_time: None,
            input: json!({ "tenantId": tenant, "regions": ["eu-west-1"] }),
            output: None,
            error: None,
            cause: None,
            current_state: Some("InitializeScan".to_string()),
            started_by: Some("ops@example.com".to_string()),
            metadata: Some(json!({ "ticket": "SEC-101" })),
        }
    }

    fn event(execution_id: Uuid, kind: ExecutionEventKind, state: &str) -> ExecutionEvent {
        ExecutionEvent {
            execution_id,
            sequence: 0,
            timestamp: Utc::now(),
            kind,
            state_name: Some(state.to_string()),
            scope: String::new(),
            detail: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_round_trip() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let record = sample_record("tenant-a", "compliance-scan", 0);
        repo.insert(&record).await.unwrap();

        let loaded = repo.get(&record.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(repo.get(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_conflict() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let record = sample_record("tenant-a", "compliance-scan", 0);
        repo.insert(&record).await.unwrap();
        let err = repo.insert(&record).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)), "got: {err}");
    }

    #[tokio::test]
    async fn test_first_terminal_write_wins() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let record = sample_record("tenant-a", "compliance-scan", 0);
        repo.insert(&record).await.unwrap();

        let aborted = record.finished(
            ExecutionStatus::Aborted,
            None,
            Some("States.Aborted".to_string()),
            Some("stopped".to_string()),
        );
        assert!(repo.replace_if_running(&aborted).await.unwrap());

        let succeeded = record.finished(ExecutionStatus::Succeeded, Some(json!({"ok": true})), None, None);
        assert!(!repo.replace_if_running(&succeeded).await.unwrap());
        assert!(!repo.set_current_state(&record.execution_id, "Later").await.unwrap());

        let loaded = repo.get(&record.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Aborted);
        assert_eq!(loaded.error.as_deref(), Some("States.Aborted"));
        assert!(loaded.stop_time.unwrap() >= loaded.start_time);
        assert_eq!(loaded.current_state.as_deref(), Some("InitializeScan"));

        let missing = sample_record("tenant-a", "compliance-scan", 0);
        assert!(matches!(
            repo.replace_if_running(&missing).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let a_old = sample_record("A", "compliance-scan", -60);
        let a_new = sample_record("A", "remediation", 0);
        let b = sample_record("B", "compliance-scan", -30);
        for r in [&a_old, &a_new, &b] {
            repo.insert(r).await.unwrap();
        }
        let done = b.finished(ExecutionStatus::Succeeded, Some(json!({})), None, None);
        repo.replace_if_running(&done).await.unwrap();

        let tenant_a = repo.list(&ExecutionFilter::for_tenant("A"), 10).await.unwrap();
        let ids: Vec<Uuid> = tenant_a.iter().map(|r| r.execution_id).collect();
        assert_eq!(ids, vec![a_new.execution_id, a_old.execution_id]);

        let scans = ExecutionFilter {
            workflow_type: Some("compliance-scan".to_string()),
            ..Default::default()
        };
        assert_eq!(repo.list(&scans, 10).await.unwrap().len(), 2);

        let succeeded = ExecutionFilter {
            status: Some(ExecutionStatus::Succeeded),
            ..Default::default()
        };
        let listed = repo.list(&succeeded, usize::MAX).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].tenant_id, "B");

        assert_eq!(repo.list(&ExecutionFilter::default(), 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_events_are_sequenced_per_execution() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let first = sample_record("A", "compliance-scan", 0);
        let second = sample_record("A", "compliance-scan", 0);
        repo.insert(&first).await.unwrap();
        repo.insert(&second).await.unwrap();

        let id = first.execution_id;
        assert_eq!(repo.append_event(&event(id, ExecutionEventKind::StateEntered, "InitializeScan")).await.unwrap(), 1);
        assert_eq!(repo.append_event(&event(id, ExecutionEventKind::StateExited, "InitializeScan")).await.unwrap(), 2);
        assert_eq!(
            repo.append_event(&event(second.execution_id, ExecutionEventKind::StateEntered, "InitializeScan"))
                .await
                .unwrap(),
            1
        );

        let mut caught = event(id, ExecutionEventKind::ErrorCaught, "DiscoverResources");
        caught.scope = "DiscoverResources#1".to_string();
        caught.detail = Some(json!({ "Error": "States.Timeout" }));
        assert_eq!(repo.append_event(&caught).await.unwrap(), 3);

        let history = repo.list_events(&id).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].kind, ExecutionEventKind::ErrorCaught);
        assert_eq!(history[2].scope, "DiscoverResources#1");
        assert_eq!(history[2].detail, Some(json!({ "Error": "States.Timeout" })));
        assert!(repo.list_events(&Uuid::now_v7()).await.unwrap().is_empty());
    }
}
