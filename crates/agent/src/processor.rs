//! The ReAct turn processor.
//!
//! One call to [`SessionProcessor::run_turn`] drives a single user turn (one
//! `message_id`): prompt → LLM → tool calls → observations → repeat, until
//! the model stops calling tools or a limit trips. Every observable step
//! flows through the shared event sink; resumable state is checkpointed at
//! step boundaries.
//!
//! Turn-ending conditions, each producing exactly one terminal event:
//! `complete` on a final reply, or `error` on max-steps, doom-loop,
//! exhausted LLM retries, cancellation, or an event-log append failure.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{LlmSettings, ProcessorConfig};
use crate::error::codes;
use crate::event_sink::EventSink;
use crate::events::{AgentEventKind, CheckpointKind, ThoughtLevel, TokenCounts};
use crate::llm::{
    ChatChunk, ChatMessage, ChatRequest, ChatResponse, LlmClient, LlmError, Usage,
    estimate_context_tokens, retry_transient,
};
use crate::store::{CheckpointStore, ExecutionCheckpoint};
use crate::tools::builtins::knowledge::SummaryTool;
use crate::tools::{ToolContext, ToolExecutor, call_fingerprint};

/// Input for one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub message_id: String,
    pub user_message: String,
    /// Prior conversation context, oldest first, excluding the new user turn.
    pub context: Vec<ChatMessage>,
}

/// What a turn produced; mirrors the workflow update result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub content: String,
    pub is_error: bool,
}

/// Serialized processor state written into progress checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessorState {
    step: u32,
    last_sequence: u64,
    messages: Vec<ChatMessage>,
    compacted: bool,
    usage: Usage,
}

pub struct SessionProcessor {
    llm: Arc<dyn LlmClient>,
    executor: Arc<ToolExecutor>,
    sink: Arc<EventSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: ProcessorConfig,
    llm_settings: LlmSettings,
}

impl SessionProcessor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        executor: Arc<ToolExecutor>,
        sink: Arc<EventSink>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: ProcessorConfig,
        llm_settings: LlmSettings,
    ) -> Self {
        Self {
            llm,
            executor,
            sink,
            checkpoints,
            config,
            llm_settings,
        }
    }

    /// Drive one turn to its terminal event.
    pub async fn run_turn(
        &self,
        ctx: &ToolContext,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> TurnResult {
        let conversation_id = &request.conversation_id;
        let message_id = &request.message_id;

        if let Err(e) = self.sink.sync_from_log(conversation_id).await {
            error!(conversation_id, error = %e, "cannot read event log, aborting turn");
            return self
                .fail_turn(ctx, &request, "event log unavailable", codes::APPEND_FAILED, 0)
                .await;
        }

        let mut state = self.initial_state(&request).await;
        let mut doom_window: Vec<u64> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                info!(conversation_id, message_id, "turn cancelled");
                return self
                    .fail_turn(ctx, &request, "turn cancelled", codes::CANCELLED, state.step)
                    .await;
            }
            if state.step >= self.config.max_steps {
                warn!(conversation_id, message_id, "max steps reached");
                return self
                    .fail_turn(
                        ctx,
                        &request,
                        &format!("maximum steps ({}) exceeded", self.config.max_steps),
                        codes::MAX_STEPS,
                        state.step,
                    )
                    .await;
            }
            state.step += 1;

            // One compaction per turn, triggered by the soft context cap.
            if !state.compacted
                && estimate_context_tokens(&state.messages) > self.config.context_soft_cap_tokens
            {
                self.compact(ctx, &mut state).await;
            }

            let response = match self.call_llm(&request, &state.messages).await {
                Ok(response) => response,
                Err(e) => {
                    error!(conversation_id, message_id, error = %e, "llm call failed");
                    return self
                        .fail_turn(
                            ctx,
                            &request,
                            &format!("llm request failed: {e}"),
                            codes::LLM_FAILED,
                            state.step,
                        )
                        .await;
                }
            };

            state.usage.prompt_tokens += response.usage.prompt_tokens;
            state.usage.completion_tokens += response.usage.completion_tokens;
            if self
                .emit(ctx, self.cost_update_event(&state.usage))
                .await
                .is_err()
            {
                return self.append_failure(ctx, &request, state.step).await;
            }

            if response.tool_calls.is_empty() {
                return self.finish_turn(ctx, &request, &state, &response).await;
            }

            // Reasoning that accompanies tool calls surfaces as a thought.
            if !response.content.trim().is_empty() {
                let thought = AgentEventKind::Thought {
                    content: response.content.clone(),
                    thought_level: ThoughtLevel::Step,
                };
                if self.emit(ctx, thought).await.is_err() {
                    return self.append_failure(ctx, &request, state.step).await;
                }
            }

            state.messages.push(ChatMessage::assistant_with_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            for call in &response.tool_calls {
                if cancel.is_cancelled() {
                    return self
                        .fail_turn(ctx, &request, "turn cancelled", codes::CANCELLED, state.step)
                        .await;
                }

                let fingerprint = call_fingerprint(&call.name, &call.arguments);
                doom_window.push(fingerprint);
                if doom_window.len() > self.config.doom_loop_window {
                    doom_window.remove(0);
                }
                let repeats = doom_window.iter().filter(|f| **f == fingerprint).count() as u32;
                if repeats > self.config.doom_loop_threshold {
                    warn!(
                        conversation_id,
                        message_id,
                        tool = %call.name,
                        "doom loop detected"
                    );
                    return self
                        .fail_turn(
                            ctx,
                            &request,
                            &format!("tool '{}' repeated {repeats} times with identical arguments", call.name),
                            codes::DOOM_LOOP,
                            state.step,
                        )
                        .await;
                }

                let outcome = match self.executor.run(ctx, call).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(conversation_id, error = %e, "event append failed during tool call");
                        return self.append_failure(ctx, &request, state.step).await;
                    }
                };
                state
                    .messages
                    .push(ChatMessage::tool_result(call.id.clone(), outcome.content));
            }

            state.last_sequence = self.sink.cursor(conversation_id);
            self.write_checkpoint(&request, &state, CheckpointKind::Progress)
                .await;
            let checkpoint_event = AgentEventKind::Checkpoint {
                kind: CheckpointKind::Progress,
                step: state.step,
            };
            if self.emit(ctx, checkpoint_event).await.is_err() {
                return self.append_failure(ctx, &request, state.step).await;
            }
        }
    }

    /// Fresh state, or a resume from the latest progress checkpoint when a
    /// prior run of this turn was interrupted mid-flight.
    async fn initial_state(&self, request: &TurnRequest) -> ProcessorState {
        match self.checkpoints.latest_for_message(&request.message_id).await {
            Ok(Some(checkpoint)) if checkpoint.kind == CheckpointKind::Progress => {
                match serde_json::from_value::<ProcessorState>(checkpoint.state.clone()) {
                    Ok(state) => {
                        info!(
                            message_id = %request.message_id,
                            step = state.step,
                            "resuming turn from checkpoint"
                        );
                        return state;
                    }
                    Err(e) => {
                        warn!(error = %e, "unreadable checkpoint state, starting fresh");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "checkpoint lookup failed, starting fresh"),
        }

        let mut messages = vec![ChatMessage::system(
            "You are an autonomous engineering agent working inside an isolated project \
             sandbox. Use the available tools to investigate and act; ask the user via the \
             clarification and decision tools when requirements are ambiguous.",
        )];
        messages.extend(request.context.iter().cloned());
        messages.push(ChatMessage::user(request.user_message.clone()));
        ProcessorState {
            step: 0,
            last_sequence: 0,
            messages,
            compacted: false,
            usage: Usage::default(),
        }
    }

    /// One streaming LLM call with bounded retries; deltas are published as
    /// they arrive.
    async fn call_llm(
        &self,
        request: &TurnRequest,
        messages: &[ChatMessage],
    ) -> Result<ChatResponse, LlmError> {
        let chat_request = ChatRequest {
            messages: messages.to_vec(),
            tools: self.executor.registry().definitions(),
            temperature: self.llm_settings.temperature,
            max_tokens: self.llm_settings.max_tokens,
        };
        let stream_timeout = Duration::from_secs(self.llm_settings.stream_timeout_seconds);
        let retry_base = Duration::from_secs(self.config.llm_retry_base_seconds);

        retry_transient(self.config.llm_retry_attempts, retry_base, |attempt| {
            let chat_request = chat_request.clone();
            async move {
                if attempt > 0 {
                    debug!(attempt, "retrying llm call");
                }
                let stream = self.llm.chat_stream(chat_request).await?;
                let consume = async {
                    let mut stream = stream;
                    let mut done = None;
                    while let Some(chunk) = stream.next().await {
                        match chunk? {
                            ChatChunk::Delta(delta) => {
                                self.sink
                                    .emit_ephemeral(
                                        &request.conversation_id,
                                        &request.message_id,
                                        AgentEventKind::TextDelta { delta },
                                    )
                                    .await;
                            }
                            ChatChunk::Done(response) => done = Some(response),
                        }
                    }
                    done.ok_or_else(|| {
                        LlmError::InvalidResponse("stream ended without completion".into())
                    })
                };
                match tokio::time::timeout(stream_timeout, consume).await {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout(stream_timeout)),
                }
            }
        })
        .await
    }

    /// Replace everything but the newest messages with an LLM summary.
    async fn compact(&self, ctx: &ToolContext, state: &mut ProcessorState) {
        let keep = self.config.context_keep_recent.max(1);
        if state.messages.len() <= keep + 1 {
            state.compacted = true;
            return;
        }
        let split = state.messages.len() - keep;
        let older = &state.messages[1..split]; // index 0 is the system prompt
        let transcript = older
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        match SummaryTool::summarise(ctx, &transcript, Some("open tasks and decisions")).await {
            Ok(summary) => {
                let mut compacted = vec![state.messages[0].clone()];
                compacted.push(ChatMessage::system(format!(
                    "Summary of the earlier conversation:\n{summary}"
                )));
                compacted.extend_from_slice(&state.messages[split..]);
                info!(
                    dropped = split - 1,
                    "compacted conversation context"
                );
                state.messages = compacted;
            }
            Err(e) => {
                warn!(error = %e, "context compaction failed, continuing uncompacted");
            }
        }
        state.compacted = true;
    }

    async fn finish_turn(
        &self,
        ctx: &ToolContext,
        request: &TurnRequest,
        state: &ProcessorState,
        response: &ChatResponse,
    ) -> TurnResult {
        let assistant = AgentEventKind::AssistantMessage {
            role: "assistant".into(),
            content: response.content.clone(),
        };
        if self.emit(ctx, assistant).await.is_err() {
            return self.append_failure(ctx, request, state.step).await;
        }
        let complete = AgentEventKind::Complete {
            content: Some(response.content.clone()),
        };
        if self.emit(ctx, complete).await.is_err() {
            return self.append_failure(ctx, request, state.step).await;
        }

        let mut final_state = state.clone();
        final_state.last_sequence = self.sink.cursor(&request.conversation_id);
        final_state
            .messages
            .push(ChatMessage::assistant(response.content.clone()));
        self.write_checkpoint(request, &final_state, CheckpointKind::Complete)
            .await;

        info!(
            conversation_id = %request.conversation_id,
            message_id = %request.message_id,
            steps = state.step,
            "turn complete"
        );
        TurnResult {
            content: response.content.clone(),
            is_error: false,
        }
    }

    /// Emit the turn's single `error` event and the error checkpoint.
    async fn fail_turn(
        &self,
        ctx: &ToolContext,
        request: &TurnRequest,
        message: &str,
        code: &str,
        step: u32,
    ) -> TurnResult {
        let event = AgentEventKind::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        };
        if let Err(e) = self.emit(ctx, event).await {
            // The log is down; record what we can out-of-band.
            error!(
                conversation_id = %request.conversation_id,
                message_id = %request.message_id,
                original_error = message,
                error = %e,
                "failed to persist error event"
            );
        }
        let state = serde_json::json!({"error": message, "code": code, "step": step});
        let checkpoint = ExecutionCheckpoint::new(
            &request.conversation_id,
            &request.message_id,
            CheckpointKind::Error,
            state,
        );
        if let Err(e) = self.checkpoints.save(&checkpoint).await {
            warn!(error = %e, "failed to save error checkpoint");
        }
        TurnResult {
            content: message.to_string(),
            is_error: true,
        }
    }

    /// Append failure path: one best-effort error event, then give up.
    async fn append_failure(
        &self,
        ctx: &ToolContext,
        request: &TurnRequest,
        step: u32,
    ) -> TurnResult {
        self.fail_turn(
            ctx,
            request,
            "event log append failed",
            codes::APPEND_FAILED,
            step,
        )
        .await
    }

    async fn write_checkpoint(
        &self,
        request: &TurnRequest,
        state: &ProcessorState,
        kind: CheckpointKind,
    ) {
        let payload = match serde_json::to_value(state) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "unserialisable processor state");
                return;
            }
        };
        let checkpoint = ExecutionCheckpoint::new(
            &request.conversation_id,
            &request.message_id,
            kind,
            payload,
        );
        if let Err(e) = self.checkpoints.save(&checkpoint).await {
            warn!(error = %e, "failed to save checkpoint");
        }
    }

    fn cost_update_event(&self, usage: &Usage) -> AgentEventKind {
        let cost = usage.prompt_tokens as f64 / 1000.0 * self.llm_settings.cost_per_1k_prompt_usd
            + usage.completion_tokens as f64 / 1000.0
                * self.llm_settings.cost_per_1k_completion_usd;
        AgentEventKind::CostUpdate {
            cost,
            tokens: TokenCounts {
                prompt: usage.prompt_tokens,
                completion: usage.completion_tokens,
                total: usage.total(),
            },
        }
    }

    async fn emit(
        &self,
        ctx: &ToolContext,
        kind: AgentEventKind,
    ) -> crate::store::StoreResult<()> {
        self.sink
            .emit(&ctx.conversation_id, &ctx.message_id, kind)
            .await
            .map(|_| ())
    }
}
