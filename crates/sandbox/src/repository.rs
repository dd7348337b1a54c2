//! Persistence for project ↔ sandbox associations.
//!
//! The `UNIQUE(project_id)` constraint is the innermost layer of the
//! single-writer guarantee: even if every lock fails, two rows for one
//! project cannot exist.

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;

use crate::domain::ProjectSandbox;
use crate::error::{SandboxError, SandboxResult};
use crate::state::SandboxState;

#[async_trait]
pub trait SandboxRepository: Send + Sync {
    /// Insert a new association. Surfaces [`SandboxError::CreationConflict`]
    /// when the project already has a row.
    async fn insert(&self, sandbox: &ProjectSandbox) -> SandboxResult<()>;

    /// Update an existing association by primary key.
    async fn update(&self, sandbox: &ProjectSandbox) -> SandboxResult<()>;

    async fn find_by_project(&self, project_id: &str) -> SandboxResult<Option<ProjectSandbox>>;

    async fn find_by_sandbox_id(&self, sandbox_id: &str) -> SandboxResult<Option<ProjectSandbox>>;

    async fn delete(&self, id: &str) -> SandboxResult<()>;

    async fn list(&self) -> SandboxResult<Vec<ProjectSandbox>>;
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS project_sandboxes (
        id                TEXT PRIMARY KEY,
        project_id        TEXT NOT NULL,
        tenant_id         TEXT NOT NULL,
        sandbox_id        TEXT NOT NULL,
        status            TEXT NOT NULL,
        created_at        INTEGER NOT NULL,
        started_at        INTEGER,
        last_accessed_at  INTEGER NOT NULL,
        health_checked_at INTEGER,
        error_message     TEXT,
        metadata          TEXT NOT NULL DEFAULT '{}'
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_project_sandboxes_project
        ON project_sandboxes(project_id);
    CREATE INDEX IF NOT EXISTS idx_project_sandboxes_sandbox
        ON project_sandboxes(sandbox_id);
";

/// SQLite-backed implementation using a blocking connection behind a mutex.
#[derive(Clone)]
pub struct SqliteSandboxRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSandboxRepository {
    /// Open (or create) the database at `path`. Use `:memory:` for tests.
    pub async fn connect(path: PathBuf) -> SandboxResult<Self> {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, rusqlite::Error> {
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| SandboxError::Repository(format!("failed to spawn blocking task: {e}")))?
        .map_err(|e| SandboxError::Repository(format!("database connection failed: {e}")))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run_blocking<F, R>(&self, f: F) -> SandboxResult<R>
    where
        F: FnOnce(&mut Connection) -> Result<R, rusqlite::Error> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("sandbox repository mutex poisoned");
            f(&mut conn)
        })
        .await
        .map_err(|e| SandboxError::Repository(format!("task execution failed: {e}")))?
        .map_err(map_sql_error)
    }
}

fn map_sql_error(e: rusqlite::Error) -> SandboxError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            // The unique project_id index tripped: a concurrent writer won.
            return SandboxError::CreationConflict {
                project_id: String::new(),
            };
        }
    }
    SandboxError::Repository(e.to_string())
}

fn row_to_sandbox(row: &rusqlite::Row<'_>) -> Result<ProjectSandbox, rusqlite::Error> {
    let status: String = row.get("status")?;
    let metadata: String = row.get("metadata")?;
    Ok(ProjectSandbox {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        tenant_id: row.get("tenant_id")?,
        sandbox_id: row.get("sandbox_id")?,
        status: SandboxState::from_legacy(&status).unwrap_or(SandboxState::Error),
        created_at: from_unix(row.get("created_at")?),
        started_at: row.get::<_, Option<i64>>("started_at")?.map(from_unix),
        last_accessed_at: from_unix(row.get("last_accessed_at")?),
        health_checked_at: row.get::<_, Option<i64>>("health_checked_at")?.map(from_unix),
        error_message: row.get("error_message")?,
        metadata: serde_json::from_str(&metadata)
            .unwrap_or(serde_json::Value::Object(Default::default())),
    })
}

fn from_unix(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(secs).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[async_trait]
impl SandboxRepository for SqliteSandboxRepository {
    async fn insert(&self, sandbox: &ProjectSandbox) -> SandboxResult<()> {
        let sb = sandbox.clone();
        let project_id = sandbox.project_id.clone();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO project_sandboxes \
                 (id, project_id, tenant_id, sandbox_id, status, created_at, started_at, \
                  last_accessed_at, health_checked_at, error_message, metadata) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    sb.id,
                    sb.project_id,
                    sb.tenant_id,
                    sb.sandbox_id,
                    sb.status.as_str(),
                    sb.created_at.unix_timestamp(),
                    sb.started_at.map(|t| t.unix_timestamp()),
                    sb.last_accessed_at.unix_timestamp(),
                    sb.health_checked_at.map(|t| t.unix_timestamp()),
                    sb.error_message,
                    serde_json::to_string(&sb.metadata).unwrap_or_else(|_| "{}".to_string()),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| match e {
            // Attach the project id the mapping layer could not know.
            SandboxError::CreationConflict { .. } => SandboxError::conflict(project_id),
            other => other,
        })
    }

    async fn update(&self, sandbox: &ProjectSandbox) -> SandboxResult<()> {
        let sb = sandbox.clone();
        let updated = self
            .run_blocking(move |conn| {
                conn.execute(
                    "UPDATE project_sandboxes SET \
                     sandbox_id = ?, status = ?, started_at = ?, last_accessed_at = ?, \
                     health_checked_at = ?, error_message = ?, metadata = ? \
                     WHERE id = ?",
                    params![
                        sb.sandbox_id,
                        sb.status.as_str(),
                        sb.started_at.map(|t| t.unix_timestamp()),
                        sb.last_accessed_at.unix_timestamp(),
                        sb.health_checked_at.map(|t| t.unix_timestamp()),
                        sb.error_message,
                        serde_json::to_string(&sb.metadata).unwrap_or_else(|_| "{}".to_string()),
                        sb.id,
                    ],
                )
            })
            .await?;
        if updated == 0 {
            return Err(SandboxError::Repository(format!(
                "no association with id {} to update",
                sandbox.id
            )));
        }
        Ok(())
    }

    async fn find_by_project(&self, project_id: &str) -> SandboxResult<Option<ProjectSandbox>> {
        let project_id = project_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT * FROM project_sandboxes WHERE project_id = ?",
                params![project_id],
                row_to_sandbox,
            )
            .optional()
        })
        .await
    }

    async fn find_by_sandbox_id(&self, sandbox_id: &str) -> SandboxResult<Option<ProjectSandbox>> {
        let sandbox_id = sandbox_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT * FROM project_sandboxes WHERE sandbox_id = ?",
                params![sandbox_id],
                row_to_sandbox,
            )
            .optional()
        })
        .await
    }

    async fn delete(&self, id: &str) -> SandboxResult<()> {
        let id = id.to_string();
        self.run_blocking(move |conn| {
            conn.execute("DELETE FROM project_sandboxes WHERE id = ?", params![id])?;
            Ok(())
        })
        .await
    }

    async fn list(&self) -> SandboxResult<Vec<ProjectSandbox>> {
        self.run_blocking(move |conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM project_sandboxes ORDER BY created_at ASC")?;
            let rows = stmt.query_map([], row_to_sandbox)?;
            rows.collect()
        })
        .await
    }
}
