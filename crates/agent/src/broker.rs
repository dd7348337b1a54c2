//! Stream broker port: an ordered, replayable stream per key.
//!
//! The broker carries live event tailing (`agent:events:{conversation}`) and
//! HITL reply transport (`hitl:responses:{conversation}`). Semantics mirror a
//! consumer-side stream read: `from_id = "0"` replays everything still
//! retained, `"$"` tails new entries only, anything else is an exclusive
//! cursor. Delivery is at-least-once; consumers dedup on the `seq` embedded
//! in the payload.
//!
//! The shipped implementation is in-process; the trait is the deployment
//! seam for a networked broker.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

use crate::events::StreamPayload;

/// Stream key for a conversation's live event feed.
pub fn events_stream_key(conversation_id: &str) -> String {
    format!("agent:events:{conversation_id}")
}

/// Stream key for a conversation's HITL responses.
pub fn hitl_responses_stream_key(conversation_id: &str) -> String {
    format!("hitl:responses:{conversation_id}")
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid stream cursor: {0}")]
    InvalidCursor(String),
    #[error("stream broker backend error: {0}")]
    Backend(String),
}

/// An entry id paired with its payload.
pub type StreamEntry = (String, StreamPayload);

/// Where a read starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFrom {
    /// Replay all retained entries.
    Beginning,
    /// Only entries published after the read begins.
    TailOnly,
    /// Entries strictly after the given id.
    After(u64),
}

impl ReadFrom {
    /// Parse the wire cursor syntax (`"0"`, `"$"`, or a numeric id).
    pub fn parse(from_id: &str) -> Result<Self, BrokerError> {
        match from_id {
            "0" => Ok(ReadFrom::Beginning),
            "$" => Ok(ReadFrom::TailOnly),
            other => other
                .parse::<u64>()
                .map(ReadFrom::After)
                .map_err(|_| BrokerError::InvalidCursor(other.to_string())),
        }
    }
}

#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Append a payload to the stream, returning its entry id.
    async fn publish(&self, stream_key: &str, payload: StreamPayload)
    -> Result<String, BrokerError>;

    /// Read up to `count` entries after the cursor. With `block`, an empty
    /// read waits up to that long for new entries before returning.
    async fn read(
        &self,
        stream_key: &str,
        from_id: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, BrokerError>;
}

struct StreamLog {
    entries: Vec<(u64, StreamPayload)>,
    next_id: u64,
    notify: Arc<Notify>,
}

impl StreamLog {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
            notify: Arc::new(Notify::new()),
        }
    }
}

/// In-process broker with a bounded retention window per stream.
pub struct MemoryBroker {
    streams: RwLock<HashMap<String, StreamLog>>,
    retention: usize,
}

const DEFAULT_RETENTION: usize = 10_000;

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            retention: retention.max(1),
        }
    }

    fn collect_after(
        &self,
        stream_key: &str,
        after: u64,
        count: usize,
    ) -> (Vec<StreamEntry>, Arc<Notify>) {
        let mut streams = self.streams.write();
        let log = streams
            .entry(stream_key.to_string())
            .or_insert_with(StreamLog::new);
        let entries = log
            .entries
            .iter()
            .filter(|(id, _)| *id > after)
            .take(count)
            .map(|(id, payload)| (id.to_string(), payload.clone()))
            .collect();
        (entries, log.notify.clone())
    }

    fn last_id(&self, stream_key: &str) -> u64 {
        self.streams
            .read()
            .get(stream_key)
            .map(|log| log.next_id - 1)
            .unwrap_or(0)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn publish(
        &self,
        stream_key: &str,
        payload: StreamPayload,
    ) -> Result<String, BrokerError> {
        let (id, notify) = {
            let mut streams = self.streams.write();
            let log = streams
                .entry(stream_key.to_string())
                .or_insert_with(StreamLog::new);
            let id = log.next_id;
            log.next_id += 1;
            log.entries.push((id, payload));
            // Bounded retention window: old entries age out.
            if log.entries.len() > self.retention {
                let excess = log.entries.len() - self.retention;
                log.entries.drain(..excess);
            }
            (id, log.notify.clone())
        };
        notify.notify_waiters();
        Ok(id.to_string())
    }

    async fn read(
        &self,
        stream_key: &str,
        from_id: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let after = match ReadFrom::parse(from_id)? {
            ReadFrom::Beginning => 0,
            ReadFrom::After(id) => id,
            ReadFrom::TailOnly => self.last_id(stream_key),
        };

        let (entries, notify) = self.collect_after(stream_key, after, count);
        if !entries.is_empty() {
            return Ok(entries);
        }

        let Some(block) = block else {
            return Ok(entries);
        };

        // Register for wakeup before re-checking so a publish between the
        // empty read and the wait cannot be missed.
        let notified = notify.notified();
        let (entries, _) = self.collect_after(stream_key, after, count);
        if !entries.is_empty() {
            return Ok(entries);
        }
        let _ = tokio::time::timeout(block, notified).await;

        let (entries, _) = self.collect_after(stream_key, after, count);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AgentEventKind;

    fn payload(seq: u64) -> StreamPayload {
        StreamPayload::new(
            &AgentEventKind::TextDelta {
                delta: format!("d{seq}"),
            },
            "m1",
            seq,
        )
    }

    // ── Cursor parsing ─────────────────────────────────────────────────────

    #[test]
    fn cursor_syntax_parses() {
        assert_eq!(ReadFrom::parse("0").unwrap(), ReadFrom::Beginning);
        assert_eq!(ReadFrom::parse("$").unwrap(), ReadFrom::TailOnly);
        assert_eq!(ReadFrom::parse("17").unwrap(), ReadFrom::After(17));
        assert!(ReadFrom::parse("latest").is_err());
    }

    // ── Publish / replay ───────────────────────────────────────────────────

    #[tokio::test]
    async fn publish_assigns_increasing_ids() {
        let broker = MemoryBroker::new();
        let a = broker.publish("s", payload(1)).await.unwrap();
        let b = broker.publish("s", payload(2)).await.unwrap();
        assert!(a.parse::<u64>().unwrap() < b.parse::<u64>().unwrap());
    }

    #[tokio::test]
    async fn read_from_zero_replays_everything_in_order() {
        let broker = MemoryBroker::new();
        for seq in 1..=5 {
            broker.publish("s", payload(seq)).await.unwrap();
        }
        let entries = broker.read("s", "0", 100, None).await.unwrap();
        assert_eq!(entries.len(), 5);
        let seqs: Vec<u64> = entries.iter().map(|(_, p)| p.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn read_after_cursor_skips_earlier_entries() {
        let broker = MemoryBroker::new();
        let mut ids = Vec::new();
        for seq in 1..=4 {
            ids.push(broker.publish("s", payload(seq)).await.unwrap());
        }
        let entries = broker.read("s", &ids[1], 100, None).await.unwrap();
        let seqs: Vec<u64> = entries.iter().map(|(_, p)| p.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn count_limits_batch_size() {
        let broker = MemoryBroker::new();
        for seq in 1..=10 {
            broker.publish("s", payload(seq)).await.unwrap();
        }
        let entries = broker.read("s", "0", 3, None).await.unwrap();
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn streams_are_isolated_by_key() {
        let broker = MemoryBroker::new();
        broker.publish("a", payload(1)).await.unwrap();
        broker.publish("b", payload(2)).await.unwrap();

        let a = broker.read("a", "0", 100, None).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].1.seq, 1);
    }

    // ── Tail semantics ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn dollar_cursor_skips_existing_entries() {
        let broker = Arc::new(MemoryBroker::new());
        broker.publish("s", payload(1)).await.unwrap();

        let reader = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .read("s", "$", 100, Some(Duration::from_secs(1)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.publish("s", payload(2)).await.unwrap();

        let entries = reader.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.seq, 2, "tail must only see the new entry");
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_publish() {
        let broker = Arc::new(MemoryBroker::new());
        let reader = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .read("s", "0", 100, Some(Duration::from_secs(2)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.publish("s", payload(1)).await.unwrap();

        let entries = reader.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn blocking_read_times_out_empty() {
        let broker = MemoryBroker::new();
        let entries = broker
            .read("s", "0", 100, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    // ── Retention ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn retention_window_drops_oldest_entries() {
        let broker = MemoryBroker::with_retention(3);
        for seq in 1..=5 {
            broker.publish("s", payload(seq)).await.unwrap();
        }
        let entries = broker.read("s", "0", 100, None).await.unwrap();
        let seqs: Vec<u64> = entries.iter().map(|(_, p)| p.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5], "oldest entries age out");
    }
}
