//! Single producer-facing API for all event emission.
//!
//! `EventSink` is the only path domain code uses to emit events. It
//! classifies each kind as durable or ephemeral, appends durable kinds to the
//! event log (awaited — the authoritative sequence number comes back from the
//! append), and then publishes to the stream broker for live tailing.
//!
//! Rules:
//! - Durable kinds: journal first, broker second. A payload never appears on
//!   the stream for an event that failed to persist.
//! - Ephemeral kinds (token deltas): broker only, decorated with the
//!   conversation's current tentative sequence.
//! - Domain code MUST NOT talk to the log or broker directly.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::broker::{StreamBroker, events_stream_key};
use crate::events::{
    AgentEventKind, Durability, PersistedEvent, StreamPayload, classify_durability,
};
use crate::store::{EventLog, NewEvent, StoreResult};

/// Shared emit path over the event log and the stream broker.
pub struct EventSink {
    log: Arc<dyn EventLog>,
    broker: Arc<dyn StreamBroker>,
    /// Per-conversation tentative sequence cursors, resynced to the
    /// authoritative persisted value after every append.
    cursors: Mutex<HashMap<String, u64>>,
}

impl EventSink {
    pub fn new(log: Arc<dyn EventLog>, broker: Arc<dyn StreamBroker>) -> Self {
        Self {
            log,
            broker,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Classify and emit. Returns the persisted event for durable kinds,
    /// `None` for ephemeral ones.
    pub async fn emit(
        &self,
        conversation_id: &str,
        message_id: &str,
        kind: AgentEventKind,
    ) -> StoreResult<Option<PersistedEvent>> {
        match classify_durability(&kind) {
            Durability::Durable => {
                let persisted = self.emit_durable(conversation_id, message_id, kind).await?;
                Ok(Some(persisted))
            }
            Durability::Ephemeral => {
                self.emit_ephemeral(conversation_id, message_id, kind).await;
                Ok(None)
            }
        }
    }

    /// Append to the log, resync the tentative cursor, then publish.
    pub async fn emit_durable(
        &self,
        conversation_id: &str,
        message_id: &str,
        kind: AgentEventKind,
    ) -> StoreResult<PersistedEvent> {
        let persisted = self
            .log
            .append(NewEvent::new(conversation_id, message_id, kind))
            .await?;

        self.resync_cursor(conversation_id, persisted.sequence_number);

        let payload = StreamPayload::new(
            &persisted.kind,
            &persisted.message_id,
            persisted.sequence_number,
        );
        self.publish(conversation_id, payload).await;

        Ok(persisted)
    }

    /// Publish to the broker only. The payload borrows the conversation's
    /// current tentative sequence so consumers can order it against the
    /// durable stream.
    pub async fn emit_ephemeral(
        &self,
        conversation_id: &str,
        message_id: &str,
        kind: AgentEventKind,
    ) {
        let seq = self.cursor(conversation_id);
        let payload = StreamPayload::new(&kind, message_id, seq);
        self.publish(conversation_id, payload).await;
    }

    /// Seed the tentative cursor from the persisted log, e.g. at turn start.
    pub async fn sync_from_log(&self, conversation_id: &str) -> StoreResult<u64> {
        let seq = self.log.last_sequence(conversation_id).await?;
        self.resync_cursor(conversation_id, seq);
        Ok(seq)
    }

    /// The conversation's current tentative sequence.
    pub fn cursor(&self, conversation_id: &str) -> u64 {
        *self.cursors.lock().get(conversation_id).unwrap_or(&0)
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    pub fn broker(&self) -> &Arc<dyn StreamBroker> {
        &self.broker
    }

    fn resync_cursor(&self, conversation_id: &str, seq: u64) {
        let mut cursors = self.cursors.lock();
        let entry = cursors.entry(conversation_id.to_string()).or_insert(0);
        if *entry < seq {
            *entry = seq;
        }
    }

    async fn publish(&self, conversation_id: &str, payload: StreamPayload) {
        let key = events_stream_key(conversation_id);
        // Durable events replay from the log, so a lost publish degrades live
        // tailing only; surface it in the logs and move on.
        if let Err(e) = self.broker.publish(&key, payload).await {
            warn!(conversation_id, error = %e, "stream publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::store::SqliteStore;
    use crate::store::error::StoreError;
    use async_trait::async_trait;

    async fn sink() -> (EventSink, Arc<MemoryBroker>) {
        let store = Arc::new(SqliteStore::connect(":memory:".into()).await.unwrap());
        let broker = Arc::new(MemoryBroker::new());
        (EventSink::new(store, broker.clone()), broker)
    }

    fn complete() -> AgentEventKind {
        AgentEventKind::Complete { content: None }
    }

    fn delta(text: &str) -> AgentEventKind {
        AgentEventKind::TextDelta { delta: text.into() }
    }

    // ── Durable emission ───────────────────────────────────────────────────

    #[tokio::test]
    async fn durable_emit_persists_and_publishes_with_same_seq() {
        let (sink, broker) = sink().await;
        let persisted = sink.emit_durable("c1", "m1", complete()).await.unwrap();
        assert_eq!(persisted.sequence_number, 1);

        let entries = broker
            .read(&events_stream_key("c1"), "0", 100, None)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.seq, persisted.sequence_number);
        assert_eq!(entries[0].1.event_type, "complete");
    }

    #[tokio::test]
    async fn durable_sequences_are_dense_per_conversation() {
        let (sink, _) = sink().await;
        let a = sink.emit_durable("c1", "m1", complete()).await.unwrap();
        let b = sink.emit_durable("c1", "m1", complete()).await.unwrap();
        let other = sink.emit_durable("c2", "m2", complete()).await.unwrap();

        assert_eq!(a.sequence_number, 1);
        assert_eq!(b.sequence_number, 2);
        assert_eq!(other.sequence_number, 1, "conversations are independent");
    }

    #[tokio::test]
    async fn emit_classifies_durable_and_returns_persisted() {
        let (sink, _) = sink().await;
        let result = sink.emit("c1", "m1", complete()).await.unwrap();
        assert!(result.is_some());
    }

    // ── Ephemeral emission ─────────────────────────────────────────────────

    #[tokio::test]
    async fn ephemeral_emit_never_lands_in_the_log() {
        let (sink, broker) = sink().await;
        sink.emit("c1", "m1", delta("tok")).await.unwrap();

        let logged = sink
            .log()
            .events_for_conversation("c1", None, None)
            .await
            .unwrap();
        assert!(logged.is_empty(), "deltas must never be persisted");

        let streamed = broker
            .read(&events_stream_key("c1"), "0", 100, None)
            .await
            .unwrap();
        assert_eq!(streamed.len(), 1);
        assert_eq!(streamed[0].1.event_type, "text_delta");
    }

    #[tokio::test]
    async fn ephemeral_payloads_borrow_the_durable_cursor() {
        let (sink, broker) = sink().await;
        sink.emit_durable("c1", "m1", complete()).await.unwrap(); // seq 1
        sink.emit_ephemeral("c1", "m1", delta("a")).await;
        sink.emit_durable("c1", "m1", complete()).await.unwrap(); // seq 2
        sink.emit_ephemeral("c1", "m1", delta("b")).await;

        let entries = broker
            .read(&events_stream_key("c1"), "0", 100, None)
            .await
            .unwrap();
        let seqs: Vec<(String, u64)> = entries
            .iter()
            .map(|(_, p)| (p.event_type.clone(), p.seq))
            .collect();
        assert_eq!(
            seqs,
            vec![
                ("complete".into(), 1),
                ("text_delta".into(), 1),
                ("complete".into(), 2),
                ("text_delta".into(), 2),
            ]
        );
    }

    // ── Cursor sync ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn sync_from_log_seeds_the_cursor() {
        let store = Arc::new(SqliteStore::connect(":memory:".into()).await.unwrap());
        let broker = Arc::new(MemoryBroker::new());

        // Events written by an earlier sink instance.
        let earlier = EventSink::new(store.clone(), broker.clone());
        earlier.emit_durable("c1", "m1", complete()).await.unwrap();
        earlier.emit_durable("c1", "m1", complete()).await.unwrap();

        let fresh = EventSink::new(store, broker);
        assert_eq!(fresh.cursor("c1"), 0);
        assert_eq!(fresh.sync_from_log("c1").await.unwrap(), 2);
        assert_eq!(fresh.cursor("c1"), 2);
    }

    // ── Failure isolation ──────────────────────────────────────────────────

    #[tokio::test]
    async fn failed_append_must_not_publish() {
        struct FailingLog;

        #[async_trait]
        impl EventLog for FailingLog {
            async fn append(&self, _event: NewEvent) -> StoreResult<PersistedEvent> {
                Err(StoreError::Database("disk on fire".into()))
            }
            async fn events_for_conversation(
                &self,
                _conversation_id: &str,
                _since_seq: Option<u64>,
                _limit: Option<usize>,
            ) -> StoreResult<Vec<PersistedEvent>> {
                Ok(vec![])
            }
            async fn events_for_message(
                &self,
                _message_id: &str,
            ) -> StoreResult<Vec<PersistedEvent>> {
                Ok(vec![])
            }
            async fn last_sequence(&self, _conversation_id: &str) -> StoreResult<u64> {
                Ok(0)
            }
            async fn recent_message_events(
                &self,
                _conversation_id: &str,
                _limit: usize,
            ) -> StoreResult<Vec<PersistedEvent>> {
                Ok(vec![])
            }
        }

        let broker = Arc::new(MemoryBroker::new());
        let sink = EventSink::new(Arc::new(FailingLog), broker.clone());

        let result = sink.emit_durable("c1", "m1", complete()).await;
        assert!(result.is_err(), "append failure must propagate");

        let entries = broker
            .read(&events_stream_key("c1"), "0", 100, None)
            .await
            .unwrap();
        assert!(
            entries.is_empty(),
            "nothing may reach the stream when the append fails"
        );
    }
}
