//! Pending-request registry and cross-process response transport.
//!
//! A HITL tool call blocks on a oneshot waiter keyed by `request_id`. The
//! answer arrives out-of-band: some process (typically the HTTP layer) writes
//! `{request_id, answer}` onto `hitl:responses:{conversation_id}`, and every
//! process running HITL-capable turns tails that stream. Whichever process
//! holds the waiter resolves it — exactly once — emits the `{kind}_answered`
//! event, and deletes the durable pending row. Processes without the waiter
//! ignore the response.
//!
//! The pending row exists so a reconnecting UI can enumerate open prompts;
//! it never outlives resolution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{StreamBroker, hitl_responses_stream_key};
use crate::error::{AgentError, AgentResult};
use crate::event_sink::EventSink;
use crate::events::{AgentEventKind, StreamPayload, now_rfc3339};
use crate::hitl::types::{
    AnswerSource, HitlAnswer, HitlKind, HitlOptions, PendingHitlRequest,
};
use crate::store::HitlRequestStore;

/// Everything needed to open a request.
#[derive(Debug, Clone)]
pub struct HitlRequestSpec {
    pub conversation_id: String,
    pub message_id: String,
    pub kind: HitlKind,
    pub prompt: String,
    pub options: HitlOptions,
    pub allow_custom: bool,
    pub default_choice: Option<String>,
    /// Overrides the registry default when set.
    pub timeout: Option<Duration>,
}

type Waiter = oneshot::Sender<HitlAnswer>;

struct Shared {
    store: Arc<dyn HitlRequestStore>,
    sink: Arc<EventSink>,
    broker: Arc<dyn StreamBroker>,
    /// request_id → (conversation_id, waiter). Insert/resolve/cancel hold the
    /// mutex briefly; nothing blocks under it.
    pending: Mutex<HashMap<String, (String, Waiter)>>,
}

impl Shared {
    async fn pending_count_for(&self, conversation_id: &str) -> usize {
        self.pending
            .lock()
            .await
            .values()
            .filter(|(conv, _)| conv == conversation_id)
            .count()
    }

    /// Resolve one response if this process owns the waiter.
    async fn resolve(&self, conversation_id: &str, request_id: &str, answer: serde_json::Value) {
        let waiter = {
            let mut pending = self.pending.lock().await;
            pending.remove(request_id)
        };
        let Some((_, tx)) = waiter else {
            debug!(request_id, "response for a waiter owned elsewhere, ignoring");
            return;
        };

        let row = match self.store.get(request_id).await {
            Ok(row) => row,
            Err(e) => {
                warn!(request_id, error = %e, "failed to load pending hitl row");
                None
            }
        };

        if let Some(row) = &row {
            let answered =
                answered_event(row.kind, request_id, &answer, AnswerSource::User);
            if let Err(e) = self
                .sink
                .emit_durable(conversation_id, &row.message_id, answered)
                .await
            {
                warn!(request_id, error = %e, "failed to emit answered event");
            }
        }
        if let Err(e) = self.store.delete(request_id).await {
            warn!(request_id, error = %e, "failed to delete pending hitl row");
        }

        // The receiver may be gone (timed-out requester); that is fine.
        let _ = tx.send(HitlAnswer::user(answer));
        info!(request_id, conversation_id, "resolved hitl request");
    }
}

/// Build the `{kind}_answered` event for a resolution.
fn answered_event(
    kind: HitlKind,
    request_id: &str,
    answer: &serde_json::Value,
    source: AnswerSource,
) -> AgentEventKind {
    match kind {
        HitlKind::Clarification => AgentEventKind::ClarificationAnswered {
            request_id: request_id.to_string(),
            answer: answer.clone(),
            source,
        },
        HitlKind::Decision => AgentEventKind::DecisionAnswered {
            request_id: request_id.to_string(),
            answer: answer.clone(),
            source,
        },
        HitlKind::EnvVar => AgentEventKind::EnvVarProvided {
            request_id: request_id.to_string(),
            // Values stay out of the event pipeline; names only.
            provided: answer
                .as_object()
                .map(|map| map.keys().cloned().collect())
                .unwrap_or_default(),
            source,
        },
    }
}

/// Build the `{kind}_asked` event for a new request.
fn asked_event(request_id: &str, spec: &HitlRequestSpec) -> AgentEventKind {
    match (&spec.kind, &spec.options) {
        (HitlKind::Clarification, HitlOptions::Clarification(options)) => {
            AgentEventKind::ClarificationAsked {
                request_id: request_id.to_string(),
                question: spec.prompt.clone(),
                options: options.clone(),
                allow_custom: spec.allow_custom,
            }
        }
        (HitlKind::Decision, HitlOptions::Decision(options)) => AgentEventKind::DecisionAsked {
            request_id: request_id.to_string(),
            question: spec.prompt.clone(),
            options: options.clone(),
            allow_custom: spec.allow_custom,
            default_choice: spec.default_choice.clone(),
        },
        (HitlKind::EnvVar, HitlOptions::EnvVar(variables)) => AgentEventKind::EnvVarRequested {
            request_id: request_id.to_string(),
            prompt: spec.prompt.clone(),
            variables: variables.clone(),
        },
        // Mismatched kind/options shape: fall back to a clarification with no
        // options rather than losing the prompt.
        _ => AgentEventKind::ClarificationAsked {
            request_id: request_id.to_string(),
            question: spec.prompt.clone(),
            options: Vec::new(),
            allow_custom: true,
        },
    }
}

/// In-process pending table plus the per-conversation response consumers.
pub struct HitlRegistry {
    shared: Arc<Shared>,
    consumers: Mutex<HashMap<String, JoinHandle<()>>>,
    default_timeout: Duration,
}

impl HitlRegistry {
    pub fn new(
        store: Arc<dyn HitlRequestStore>,
        sink: Arc<EventSink>,
        broker: Arc<dyn StreamBroker>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                sink,
                broker,
                pending: Mutex::new(HashMap::new()),
            }),
            consumers: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Open a request and block until it resolves.
    ///
    /// Resolution paths:
    /// - a user response arrives on the stream → `source = user`
    /// - the timeout lapses with a `default_choice` → `source = timeout`
    /// - the timeout lapses without one → `Err` (tool-local failure)
    /// - [`cancel`](Self::cancel) is called → `source = cancelled`
    pub async fn request(&self, spec: HitlRequestSpec) -> AgentResult<HitlAnswer> {
        let request_id = Uuid::new_v4().to_string();
        let timeout = spec.timeout.unwrap_or(self.default_timeout);

        let row = PendingHitlRequest {
            request_id: request_id.clone(),
            conversation_id: spec.conversation_id.clone(),
            message_id: spec.message_id.clone(),
            kind: spec.kind,
            prompt: spec.prompt.clone(),
            options: spec.options.clone(),
            default_choice: spec.default_choice.clone(),
            allow_custom: spec.allow_custom,
            timeout_deadline: time::OffsetDateTime::now_utc()
                + time::Duration::seconds(timeout.as_secs() as i64),
        };
        self.shared.store.insert(&row).await?;

        // Waiter first, asked event second: once the event is visible a
        // response may arrive immediately, and it must find its waiter.
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(request_id.clone(), (spec.conversation_id.clone(), tx));

        if let Err(e) = self
            .shared
            .sink
            .emit_durable(
                &spec.conversation_id,
                &spec.message_id,
                asked_event(&request_id, &spec),
            )
            .await
        {
            // Without the asked event no UI will ever answer; roll back.
            self.shared.pending.lock().await.remove(&request_id);
            let _ = self.shared.store.delete(&request_id).await;
            return Err(e.into());
        }

        self.ensure_consumer(&spec.conversation_id).await;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => {
                // Waiter dropped without a send: the registry cancelled it.
                Ok(HitlAnswer::cancelled())
            }
            Err(_elapsed) => {
                self.shared.pending.lock().await.remove(&request_id);
                if let Err(e) = self.shared.store.delete(&request_id).await {
                    warn!(request_id, error = %e, "failed to delete timed-out hitl row");
                }
                match &spec.default_choice {
                    Some(default) => {
                        let answer = serde_json::Value::String(default.clone());
                        let answered = answered_event(
                            spec.kind,
                            &request_id,
                            &answer,
                            AnswerSource::Timeout,
                        );
                        self.shared
                            .sink
                            .emit_durable(&spec.conversation_id, &spec.message_id, answered)
                            .await?;
                        info!(request_id, "hitl request timed out, using default choice");
                        Ok(HitlAnswer::timeout_default(answer))
                    }
                    None => Err(AgentError::Hitl(format!(
                        "request {request_id} timed out after {}s with no default",
                        timeout.as_secs()
                    ))),
                }
            }
        }
    }

    /// Publish a response onto the conversation's reply stream. The HTTP
    /// layer calls this when a user answers; whichever process owns the
    /// waiter picks it up.
    pub async fn submit_response(
        &self,
        conversation_id: &str,
        request_id: &str,
        answer: serde_json::Value,
    ) -> AgentResult<()> {
        let payload = StreamPayload {
            event_type: "hitl_response".to_string(),
            data: serde_json::json!({
                "request_id": request_id,
                "answer": answer,
            }),
            seq: 0,
            timestamp: now_rfc3339(),
        };
        self.shared
            .broker
            .publish(&hitl_responses_stream_key(conversation_id), payload)
            .await
            .map_err(|e| AgentError::Hitl(e.to_string()))?;
        Ok(())
    }

    /// Cancel a pending request: the waiter resolves with `cancelled`, the
    /// row is removed.
    pub async fn cancel(&self, request_id: &str) -> AgentResult<bool> {
        let waiter = {
            let mut pending = self.shared.pending.lock().await;
            pending.remove(request_id)
        };
        let Some((_conversation_id, tx)) = waiter else {
            return Ok(false);
        };
        if let Err(e) = self.shared.store.delete(request_id).await {
            warn!(request_id, error = %e, "failed to delete cancelled hitl row");
        }
        let _ = tx.send(HitlAnswer::cancelled());
        Ok(true)
    }

    /// Open prompts for a conversation, for reconnecting UIs.
    pub async fn list_open(&self, conversation_id: &str) -> AgentResult<Vec<PendingHitlRequest>> {
        Ok(self
            .shared
            .store
            .list_open_for_conversation(conversation_id)
            .await?)
    }

    /// Start the conversation's response consumer unless it is running.
    async fn ensure_consumer(&self, conversation_id: &str) {
        let mut consumers = self.consumers.lock().await;
        if let Some(handle) = consumers.get(conversation_id) {
            if !handle.is_finished() {
                return;
            }
        }
        let shared = self.shared.clone();
        let conversation_id_owned = conversation_id.to_string();
        let handle = tokio::spawn(async move {
            run_response_consumer(shared, conversation_id_owned).await;
        });
        consumers.insert(conversation_id.to_string(), handle);
    }
}

const CONSUMER_BLOCK: Duration = Duration::from_millis(500);

/// Tail `hitl:responses:{conversation}` and resolve matching waiters.
///
/// Reads from the beginning of the retained stream: stale responses simply
/// find no waiter and are ignored, which keeps delivery at-least-once safe.
async fn run_response_consumer(shared: Arc<Shared>, conversation_id: String) {
    let key = hitl_responses_stream_key(&conversation_id);
    let mut cursor = "0".to_string();
    debug!(conversation_id, "hitl response consumer started");

    loop {
        let entries = match shared.broker.read(&key, &cursor, 100, Some(CONSUMER_BLOCK)).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(conversation_id, error = %e, "hitl response read failed");
                tokio::time::sleep(CONSUMER_BLOCK).await;
                continue;
            }
        };

        for (entry_id, payload) in entries {
            cursor = entry_id;
            let Some(request_id) = payload.data.get("request_id").and_then(|v| v.as_str()) else {
                continue;
            };
            let answer = payload
                .data
                .get("answer")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            shared.resolve(&conversation_id, request_id, answer).await;
        }

        if shared.pending_count_for(&conversation_id).await == 0 {
            debug!(conversation_id, "no pending requests, consumer stopping");
            return;
        }
    }
}
