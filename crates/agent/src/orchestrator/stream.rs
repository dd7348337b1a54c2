//! The combined replay/tail consumer protocol.
//!
//! One call yields each event of a turn at least once and, for durable
//! events, at most once:
//!
//! 1. Replay the durable log in sequence order, tracking the highest
//!    sequence seen and whether the turn already closed.
//! 2. If the turn is closed, backfill the stream-only `text_delta` payloads
//!    from the broker (they never reach the log), sorted by sequence, and
//!    stop.
//! 3. Otherwise tail the broker from the beginning of its retention window —
//!    events are published after the log append, so everything missed
//!    between replay and subscribe is still on the stream — and drop any
//!    payload the replay already covered, using the sequence embedded in
//!    the payload. Stop on the turn's `complete`/`error`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use crate::broker::{StreamBroker, events_stream_key};
use crate::events::{SseEvent, StreamPayload, is_terminal_type};
use crate::store::EventLog;

const TAIL_BLOCK: Duration = Duration::from_secs(1);
const READ_BATCH: usize = 1000;

pub(super) async fn drive_chat_stream(
    log: Arc<dyn EventLog>,
    broker: Arc<dyn StreamBroker>,
    tx: mpsc::Sender<SseEvent>,
    conversation_id: String,
    message_id: Option<String>,
) {
    // 1. Durable replay.
    let events = match &message_id {
        Some(message_id) => log.events_for_message(message_id).await,
        None => log.events_for_conversation(&conversation_id, None, None).await,
    };
    let events = match events {
        Ok(events) => events,
        Err(e) => {
            warn!(conversation_id, error = %e, "event replay failed");
            Vec::new()
        }
    };

    let mut last_seq = 0u64;
    let mut saw_complete = false;
    for event in &events {
        if tx.send(SseEvent::from_persisted(event)).await.is_err() {
            return;
        }
        last_seq = last_seq.max(event.sequence_number);
        if is_terminal_type(event.kind.event_type()) {
            saw_complete = true;
        }
    }

    let key = events_stream_key(&conversation_id);

    // 2. Closed turn: the log had everything durable; only the stream-only
    //    deltas within its range remain to deliver.
    if saw_complete {
        if let Some(message_id) = &message_id {
            let mut deltas = collect_retained_deltas(&broker, &key, message_id, last_seq).await;
            deltas.sort_by_key(|payload| payload.seq);
            for payload in deltas {
                if tx.send(SseEvent::from_payload(&payload)).await.is_err() {
                    return;
                }
            }
        }
        return;
    }

    // 3. Live tail with replay dedup.
    let mut cursor = "0".to_string();
    loop {
        if tx.is_closed() {
            return;
        }
        let entries = match broker.read(&key, &cursor, READ_BATCH, Some(TAIL_BLOCK)).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(conversation_id, error = %e, "stream tail read failed");
                tokio::time::sleep(TAIL_BLOCK).await;
                continue;
            }
        };

        for (entry_id, payload) in entries {
            cursor = entry_id;

            if let Some(message_id) = &message_id {
                if payload.message_id() != Some(message_id.as_str()) {
                    continue;
                }
            }

            // Durable payloads the replay already yielded share their
            // authoritative sequence; deltas borrow the cursor of the last
            // durable event, so only strictly older ones are drops.
            if payload.event_type == "text_delta" {
                if payload.seq < last_seq {
                    continue;
                }
            } else if payload.seq <= last_seq {
                continue;
            }

            let terminal = payload.is_terminal();
            last_seq = last_seq.max(payload.seq);
            if tx.send(SseEvent::from_payload(&payload)).await.is_err() {
                return;
            }
            if terminal && message_id.is_some() {
                return;
            }
        }
    }
}

/// All retained `text_delta` payloads of a turn within the log's range.
async fn collect_retained_deltas(
    broker: &Arc<dyn StreamBroker>,
    key: &str,
    message_id: &str,
    last_seq: u64,
) -> Vec<StreamPayload> {
    let mut deltas = Vec::new();
    let mut cursor = "0".to_string();
    loop {
        let entries = match broker.read(key, &cursor, READ_BATCH, None).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "delta backfill read failed");
                break;
            }
        };
        if entries.is_empty() {
            break;
        }
        for (entry_id, payload) in entries {
            cursor = entry_id;
            if payload.event_type == "text_delta"
                && payload.message_id() == Some(message_id)
                && payload.seq <= last_seq
            {
                deltas.push(payload);
            }
        }
    }
    deltas
}
