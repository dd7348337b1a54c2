//! SQLite implementation of the store traits.
//!
//! One blocking connection behind a mutex, driven from async code via
//! `spawn_blocking`. The connection mutex also serialises event appends,
//! which keeps per-conversation sequence allocation free of write skew: the
//! `MAX(sequence_number) + 1` read and the insert happen in one transaction
//! that nothing can interleave with.

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::events::{AgentEventKind, PersistedEvent};
use crate::hitl::types::{HitlKind, HitlOptions, PendingHitlRequest};
use crate::store::domain::{
    Conversation, ConversationStatus, ExecutionCheckpoint, ToolExecutionRecord,
};
use crate::store::error::{StoreError, StoreResult};
use crate::store::schema::SCHEMA;
use crate::store::store::{
    CheckpointStore, ConversationStore, EventLog, HitlRequestStore, NewEvent, ToolExecutionStore,
};

/// SQLite-backed store implementing every persistence trait.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`. Use `:memory:` for tests.
    pub async fn connect(path: PathBuf) -> StoreResult<Self> {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, rusqlite::Error> {
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Database(format!("failed to spawn blocking task: {e}")))?
        .map_err(|e| StoreError::Database(format!("database connection failed: {e}")))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run_blocking<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut Connection) -> Result<R, rusqlite::Error> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("store mutex poisoned");
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Database(format!("task execution failed: {e}")))?
        .map_err(StoreError::from)
    }
}

fn from_unix(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(secs).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<PersistedEvent, rusqlite::Error> {
    let event_type: String = row.get("event_type")?;
    let event_data: String = row.get("event_data")?;
    let data: serde_json::Value = serde_json::from_str(&event_data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let kind = AgentEventKind::from_stored(&event_type, &data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(PersistedEvent {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        message_id: row.get("message_id")?,
        sequence_number: row.get::<_, i64>("sequence_number")? as u64,
        kind,
        created_at: from_unix(row.get("created_at")?),
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<Conversation, rusqlite::Error> {
    let status: String = row.get("status")?;
    let agent_config: String = row.get("agent_config")?;
    Ok(Conversation {
        id: row.get("id")?,
        tenant_id: row.get("tenant_id")?,
        project_id: row.get("project_id")?,
        user_id: row.get("user_id")?,
        title: row.get("title")?,
        status: ConversationStatus::parse(&status).unwrap_or(ConversationStatus::Active),
        agent_config: serde_json::from_str(&agent_config)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        message_count: row.get::<_, i64>("message_count")? as u32,
        created_at: from_unix(row.get("created_at")?),
    })
}

#[async_trait]
impl EventLog for SqliteStore {
    async fn append(&self, event: NewEvent) -> StoreResult<PersistedEvent> {
        let event_type = event.kind.event_type().to_string();
        let event_data = event.kind.event_data(&event.message_id);
        let data_json = serde_json::to_string(&event_data)?;
        let kind = event.kind.clone();
        let id = Uuid::new_v4().to_string();
        let id_out = id.clone();
        let conversation_id = event.conversation_id.clone();
        let message_id = event.message_id.clone();
        let now = OffsetDateTime::now_utc();

        let seq = self
            .run_blocking(move |conn| {
                let tx = conn.transaction()?;
                // Allocate the next dense sequence number for the conversation
                // atomically with the insert.
                let seq: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(sequence_number), 0) + 1 \
                     FROM agent_execution_events WHERE conversation_id = ?",
                    params![event.conversation_id],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO agent_execution_events \
                     (id, conversation_id, message_id, sequence_number, event_type, event_data, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    params![
                        id,
                        event.conversation_id,
                        event.message_id,
                        seq,
                        event_type,
                        data_json,
                        now.unix_timestamp(),
                    ],
                )?;
                tx.commit()?;
                Ok(seq)
            })
            .await?;

        Ok(PersistedEvent {
            id: id_out,
            conversation_id,
            message_id,
            sequence_number: seq as u64,
            kind,
            created_at: now,
        })
    }

    async fn events_for_conversation(
        &self,
        conversation_id: &str,
        since_seq: Option<u64>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<PersistedEvent>> {
        let conversation_id = conversation_id.to_string();
        let since = since_seq.unwrap_or(0) as i64;
        let limit = limit.unwrap_or(usize::MAX).min(i64::MAX as usize) as i64;
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM agent_execution_events \
                 WHERE conversation_id = ? AND sequence_number > ? \
                 ORDER BY sequence_number ASC LIMIT ?",
            )?;
            let rows = stmt.query_map(params![conversation_id, since, limit], row_to_event)?;
            rows.collect()
        })
        .await
    }

    async fn events_for_message(&self, message_id: &str) -> StoreResult<Vec<PersistedEvent>> {
        let message_id = message_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM agent_execution_events \
                 WHERE message_id = ? ORDER BY sequence_number ASC",
            )?;
            let rows = stmt.query_map(params![message_id], row_to_event)?;
            rows.collect()
        })
        .await
    }

    async fn last_sequence(&self, conversation_id: &str) -> StoreResult<u64> {
        let conversation_id = conversation_id.to_string();
        let seq: i64 = self
            .run_blocking(move |conn| {
                conn.query_row(
                    "SELECT COALESCE(MAX(sequence_number), 0) \
                     FROM agent_execution_events WHERE conversation_id = ?",
                    params![conversation_id],
                    |row| row.get(0),
                )
            })
            .await?;
        Ok(seq as u64)
    }

    async fn recent_message_events(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<PersistedEvent>> {
        let conversation_id = conversation_id.to_string();
        let limit = limit.min(i64::MAX as usize) as i64;
        let mut events = self
            .run_blocking(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM agent_execution_events \
                     WHERE conversation_id = ? \
                       AND event_type IN ('user_message', 'assistant_message') \
                     ORDER BY sequence_number DESC LIMIT ?",
                )?;
                let rows = stmt.query_map(params![conversation_id, limit], row_to_event)?;
                rows.collect::<Result<Vec<_>, _>>()
            })
            .await?;
        events.reverse(); // oldest first for prompt assembly
        Ok(events)
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create(&self, conversation: &Conversation) -> StoreResult<()> {
        let conv = conversation.clone();
        let agent_config = serde_json::to_string(&conv.agent_config)?;
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO conversations \
                 (id, tenant_id, project_id, user_id, title, status, agent_config, message_count, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    conv.id,
                    conv.tenant_id,
                    conv.project_id,
                    conv.user_id,
                    conv.title,
                    conv.status.as_str(),
                    agent_config,
                    conv.message_count as i64,
                    conv.created_at.unix_timestamp(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn find(&self, conversation_id: &str) -> StoreResult<Option<Conversation>> {
        let conversation_id = conversation_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT * FROM conversations WHERE id = ?",
                params![conversation_id],
                row_to_conversation,
            )
            .optional()
        })
        .await
    }

    async fn list_for_project(
        &self,
        project_id: &str,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Conversation>> {
        let project_id = project_id.to_string();
        let user_id = user_id.to_string();
        let limit = limit.min(i64::MAX as usize) as i64;
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM conversations \
                 WHERE project_id = ? AND user_id = ? AND status != 'deleted' \
                 ORDER BY created_at DESC LIMIT ?",
            )?;
            let rows = stmt.query_map(params![project_id, user_id, limit], row_to_conversation)?;
            rows.collect()
        })
        .await
    }

    async fn update_title(&self, conversation_id: &str, title: &str) -> StoreResult<()> {
        let conversation_id = conversation_id.to_string();
        let title = title.to_string();
        let conversation_id_for_err = conversation_id.clone();
        let updated = self
            .run_blocking(move |conn| {
                conn.execute(
                    "UPDATE conversations SET title = ? WHERE id = ?",
                    params![title, conversation_id],
                )
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::ConversationNotFound(conversation_id_for_err.into()));
        }
        Ok(())
    }

    async fn set_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> StoreResult<()> {
        let conversation_id = conversation_id.to_string();
        let conversation_id_for_err = conversation_id.clone();
        let updated = self
            .run_blocking(move |conn| {
                conn.execute(
                    "UPDATE conversations SET status = ? WHERE id = ?",
                    params![status.as_str(), conversation_id],
                )
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::ConversationNotFound(conversation_id_for_err.into()));
        }
        Ok(())
    }

    async fn increment_message_count(&self, conversation_id: &str) -> StoreResult<()> {
        let conversation_id = conversation_id.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE conversations SET message_count = message_count + 1 WHERE id = ?",
                params![conversation_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_cascade(&self, conversation_id: &str) -> StoreResult<()> {
        let conversation_id = conversation_id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            // Deletion order is part of the contract: dependents first.
            tx.execute(
                "DELETE FROM tool_executions WHERE conversation_id = ?",
                params![conversation_id],
            )?;
            tx.execute(
                "DELETE FROM execution_checkpoints WHERE conversation_id = ?",
                params![conversation_id],
            )?;
            tx.execute(
                "DELETE FROM hitl_requests WHERE conversation_id = ?",
                params![conversation_id],
            )?;
            tx.execute(
                "DELETE FROM agent_execution_events WHERE conversation_id = ?",
                params![conversation_id],
            )?;
            tx.execute(
                "DELETE FROM conversations WHERE id = ?",
                params![conversation_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn save(&self, checkpoint: &ExecutionCheckpoint) -> StoreResult<()> {
        let cp = checkpoint.clone();
        let state = serde_json::to_string(&cp.state)?;
        let kind = serde_json::to_string(&cp.kind)?
            .trim_matches('"')
            .to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO execution_checkpoints \
                 (id, conversation_id, message_id, kind, state, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    cp.id,
                    cp.conversation_id,
                    cp.message_id,
                    kind,
                    state,
                    cp.created_at.unix_timestamp(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn latest_for_message(
        &self,
        message_id: &str,
    ) -> StoreResult<Option<ExecutionCheckpoint>> {
        let message_id = message_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT * FROM execution_checkpoints \
                 WHERE message_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![message_id],
                row_to_checkpoint,
            )
            .optional()
        })
        .await
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &str,
    ) -> StoreResult<Vec<ExecutionCheckpoint>> {
        let conversation_id = conversation_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM execution_checkpoints \
                 WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![conversation_id], row_to_checkpoint)?;
            rows.collect()
        })
        .await
    }
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> Result<ExecutionCheckpoint, rusqlite::Error> {
    let kind: String = row.get("kind")?;
    let state: String = row.get("state")?;
    Ok(ExecutionCheckpoint {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        message_id: row.get("message_id")?,
        kind: serde_json::from_str(&format!("\"{kind}\"")).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        state: serde_json::from_str(&state).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_at: from_unix(row.get("created_at")?),
    })
}

#[async_trait]
impl ToolExecutionStore for SqliteStore {
    async fn record(&self, record: &ToolExecutionRecord) -> StoreResult<()> {
        let rec = record.clone();
        let arguments = serde_json::to_string(&rec.arguments)?;
        let result = rec
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO tool_executions \
                 (id, conversation_id, message_id, tool_name, arguments, result, error, duration_ms, started_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    rec.id,
                    rec.conversation_id,
                    rec.message_id,
                    rec.tool_name,
                    arguments,
                    result,
                    rec.error,
                    rec.duration_ms as i64,
                    rec.started_at.unix_timestamp(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &str,
    ) -> StoreResult<Vec<ToolExecutionRecord>> {
        let conversation_id = conversation_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tool_executions \
                 WHERE conversation_id = ? ORDER BY started_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![conversation_id], |row| {
                let arguments: String = row.get("arguments")?;
                let result: Option<String> = row.get("result")?;
                Ok(ToolExecutionRecord {
                    id: row.get("id")?,
                    conversation_id: row.get("conversation_id")?,
                    message_id: row.get("message_id")?,
                    tool_name: row.get("tool_name")?,
                    arguments: serde_json::from_str(&arguments)
                        .unwrap_or(serde_json::Value::Null),
                    result: result.and_then(|r| serde_json::from_str(&r).ok()),
                    error: row.get("error")?,
                    duration_ms: row.get::<_, i64>("duration_ms")? as u64,
                    started_at: from_unix(row.get("started_at")?),
                })
            })?;
            rows.collect()
        })
        .await
    }
}

#[async_trait]
impl HitlRequestStore for SqliteStore {
    async fn insert(&self, request: &PendingHitlRequest) -> StoreResult<()> {
        let req = request.clone();
        let options = serde_json::to_string(&req.options)?;
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO hitl_requests \
                 (request_id, conversation_id, message_id, kind, prompt, options, default_choice, allow_custom, timeout_deadline) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    req.request_id,
                    req.conversation_id,
                    req.message_id,
                    req.kind.as_str(),
                    req.prompt,
                    options,
                    req.default_choice,
                    req.allow_custom as i64,
                    req.timeout_deadline.unix_timestamp(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, request_id: &str) -> StoreResult<Option<PendingHitlRequest>> {
        let request_id = request_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT * FROM hitl_requests WHERE request_id = ?",
                params![request_id],
                row_to_hitl_request,
            )
            .optional()
        })
        .await
    }

    async fn delete(&self, request_id: &str) -> StoreResult<()> {
        let request_id = request_id.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "DELETE FROM hitl_requests WHERE request_id = ?",
                params![request_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_open_for_conversation(
        &self,
        conversation_id: &str,
    ) -> StoreResult<Vec<PendingHitlRequest>> {
        let conversation_id = conversation_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM hitl_requests \
                 WHERE conversation_id = ? ORDER BY timeout_deadline ASC",
            )?;
            let rows = stmt.query_map(params![conversation_id], row_to_hitl_request)?;
            rows.collect()
        })
        .await
    }
}

fn row_to_hitl_request(row: &rusqlite::Row<'_>) -> Result<PendingHitlRequest, rusqlite::Error> {
    let kind: String = row.get("kind")?;
    let options: String = row.get("options")?;
    let kind = match kind.as_str() {
        "clarification" => HitlKind::Clarification,
        "decision" => HitlKind::Decision,
        _ => HitlKind::EnvVar,
    };
    let options: HitlOptions = serde_json::from_str(&options).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(PendingHitlRequest {
        request_id: row.get("request_id")?,
        conversation_id: row.get("conversation_id")?,
        message_id: row.get("message_id")?,
        kind,
        prompt: row.get("prompt")?,
        options,
        default_choice: row.get("default_choice")?,
        allow_custom: row.get::<_, i64>("allow_custom")? != 0,
        timeout_deadline: from_unix(row.get("timeout_deadline")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CheckpointKind;
    use crate::hitl::types::ClarificationOption;

    async fn store() -> SqliteStore {
        SqliteStore::connect(":memory:".into()).await.unwrap()
    }

    fn user_msg(content: &str) -> AgentEventKind {
        AgentEventKind::UserMessage {
            role: "user".into(),
            content: content.into(),
        }
    }

    // ── Event log: sequencing ──────────────────────────────────────────────

    #[tokio::test]
    async fn sequences_start_at_one_and_stay_dense() {
        let store = store().await;
        for i in 0..5 {
            let event = store
                .append(NewEvent::new("c1", "m1", user_msg(&format!("msg {i}"))))
                .await
                .unwrap();
            assert_eq!(event.sequence_number, i + 1);
        }
        assert_eq!(store.last_sequence("c1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_conversation_serialize() {
        let store = Arc::new(store().await);
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append(NewEvent::new("c1", "m1", user_msg(&format!("msg {i}"))))
                    .await
                    .unwrap()
                    .sequence_number
            }));
        }
        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort_unstable();
        let expected: Vec<u64> = (1..=20).collect();
        assert_eq!(seqs, expected, "no gaps, no duplicates");
    }

    #[tokio::test]
    async fn conversations_sequence_independently() {
        let store = store().await;
        store
            .append(NewEvent::new("c1", "m1", user_msg("a")))
            .await
            .unwrap();
        let event = store
            .append(NewEvent::new("c2", "m2", user_msg("b")))
            .await
            .unwrap();
        assert_eq!(event.sequence_number, 1);
    }

    #[tokio::test]
    async fn created_at_is_monotonic_with_sequence() {
        let store = store().await;
        for i in 0..3 {
            store
                .append(NewEvent::new("c1", "m1", user_msg(&format!("{i}"))))
                .await
                .unwrap();
        }
        let events = store
            .events_for_conversation("c1", None, None)
            .await
            .unwrap();
        for pair in events.windows(2) {
            assert!(pair[0].sequence_number < pair[1].sequence_number);
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    // ── Event log: queries ─────────────────────────────────────────────────

    #[tokio::test]
    async fn since_seq_cursor_excludes_earlier_events() {
        let store = store().await;
        for i in 0..5 {
            store
                .append(NewEvent::new("c1", "m1", user_msg(&format!("{i}"))))
                .await
                .unwrap();
        }
        let events = store
            .events_for_conversation("c1", Some(3), None)
            .await
            .unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[tokio::test]
    async fn events_for_message_returns_contiguous_turn_slice() {
        let store = store().await;
        store
            .append(NewEvent::new("c1", "m1", user_msg("first turn")))
            .await
            .unwrap();
        store
            .append(NewEvent::new(
                "c1",
                "m1",
                AgentEventKind::Complete { content: None },
            ))
            .await
            .unwrap();
        store
            .append(NewEvent::new("c1", "m2", user_msg("second turn")))
            .await
            .unwrap();

        let turn = store.events_for_message("m1").await.unwrap();
        assert_eq!(turn.len(), 2);
        assert!(turn.iter().all(|e| e.message_id == "m1"));
    }

    #[tokio::test]
    async fn recent_message_events_filters_and_orders_oldest_first() {
        let store = store().await;
        store
            .append(NewEvent::new("c1", "m1", user_msg("hello")))
            .await
            .unwrap();
        store
            .append(NewEvent::new(
                "c1",
                "m1",
                AgentEventKind::Thought {
                    content: "thinking".into(),
                    thought_level: crate::events::ThoughtLevel::Step,
                },
            ))
            .await
            .unwrap();
        store
            .append(NewEvent::new(
                "c1",
                "m1",
                AgentEventKind::AssistantMessage {
                    role: "assistant".into(),
                    content: "hi".into(),
                },
            ))
            .await
            .unwrap();

        let messages = store.recent_message_events("c1", 50).await.unwrap();
        assert_eq!(messages.len(), 2, "thoughts are not message events");
        assert_eq!(messages[0].kind.event_type(), "user_message");
        assert_eq!(messages[1].kind.event_type(), "assistant_message");
    }

    // ── Conversations ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn conversation_round_trip_and_title_update() {
        let store = store().await;
        let conv = Conversation::new("t1", "p1", "u1");
        store.create(&conv).await.unwrap();

        store.update_title(&conv.id, "Fix the build").await.unwrap();
        let found = store.find(&conv.id).await.unwrap().unwrap();
        assert_eq!(found.title.as_deref(), Some("Fix the build"));
        assert_eq!(found.project_id, "p1");
    }

    #[tokio::test]
    async fn message_count_increments() {
        let store = store().await;
        let conv = Conversation::new("t1", "p1", "u1");
        store.create(&conv).await.unwrap();

        store.increment_message_count(&conv.id).await.unwrap();
        store.increment_message_count(&conv.id).await.unwrap();
        assert_eq!(store.find(&conv.id).await.unwrap().unwrap().message_count, 2);
    }

    #[tokio::test]
    async fn deleted_conversations_drop_out_of_listings() {
        let store = store().await;
        let conv = Conversation::new("t1", "p1", "u1");
        store.create(&conv).await.unwrap();
        assert_eq!(store.list_for_project("p1", "u1", 10).await.unwrap().len(), 1);

        store
            .set_status(&conv.id, ConversationStatus::Deleted)
            .await
            .unwrap();
        assert!(store.list_for_project("p1", "u1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_cascade_removes_everything_owned() {
        let store = store().await;
        let conv = Conversation::new("t1", "p1", "u1");
        store.create(&conv).await.unwrap();

        store
            .append(NewEvent::new(&conv.id, "m1", user_msg("hi")))
            .await
            .unwrap();
        store
            .save(&ExecutionCheckpoint::new(
                &conv.id,
                "m1",
                CheckpointKind::Progress,
                serde_json::json!({"step": 1}),
            ))
            .await
            .unwrap();
        store
            .record(&ToolExecutionRecord {
                id: Uuid::new_v4().to_string(),
                conversation_id: conv.id.clone(),
                message_id: "m1".into(),
                tool_name: "bash".into(),
                arguments: serde_json::json!({"command": "ls"}),
                result: None,
                error: None,
                duration_ms: 3,
                started_at: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();

        store.delete_cascade(&conv.id).await.unwrap();

        assert!(store.find(&conv.id).await.unwrap().is_none());
        assert!(
            store
                .events_for_conversation(&conv.id, None, None)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(
            CheckpointStore::list_for_conversation(&store, &conv.id)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(
            ToolExecutionStore::list_for_conversation(&store, &conv.id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    // ── Checkpoints ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn latest_checkpoint_wins_over_earlier_ones() {
        let store = store().await;
        store
            .save(&ExecutionCheckpoint::new(
                "c1",
                "m1",
                CheckpointKind::Progress,
                serde_json::json!({"step": 1}),
            ))
            .await
            .unwrap();
        store
            .save(&ExecutionCheckpoint::new(
                "c1",
                "m1",
                CheckpointKind::Progress,
                serde_json::json!({"step": 2}),
            ))
            .await
            .unwrap();

        let latest = store.latest_for_message("m1").await.unwrap().unwrap();
        assert_eq!(latest.state["step"], 2);
    }

    #[tokio::test]
    async fn checkpoint_kind_round_trips() {
        let store = store().await;
        store
            .save(&ExecutionCheckpoint::new(
                "c1",
                "m9",
                CheckpointKind::Error,
                serde_json::json!({"error": "boom"}),
            ))
            .await
            .unwrap();
        let latest = store.latest_for_message("m9").await.unwrap().unwrap();
        assert_eq!(latest.kind, CheckpointKind::Error);
    }

    // ── HITL rows ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn pending_hitl_rows_survive_until_deleted() {
        let store = store().await;
        let request = PendingHitlRequest {
            request_id: "r1".into(),
            conversation_id: "c1".into(),
            message_id: "m1".into(),
            kind: HitlKind::Clarification,
            prompt: "A or B?".into(),
            options: HitlOptions::Clarification(vec![ClarificationOption {
                id: "a".into(),
                label: "A".into(),
                description: None,
                recommended: true,
            }]),
            default_choice: None,
            allow_custom: true,
            timeout_deadline: OffsetDateTime::now_utc() + time::Duration::minutes(5),
        };
        store.insert(&request).await.unwrap();

        let open = store.list_open_for_conversation("c1").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].prompt, "A or B?");
        assert!(open[0].allow_custom);

        HitlRequestStore::delete(&store, "r1").await.unwrap();
        assert!(store.get("r1").await.unwrap().is_none());
        assert!(
            store
                .list_open_for_conversation("c1")
                .await
                .unwrap()
                .is_empty()
        );
    }
}
