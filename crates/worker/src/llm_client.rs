//! OpenAI-compatible chat client.
//!
//! A deliberately thin implementation of the `LlmClient` port: one JSON
//! request per call, the reply surfaced as a single delta followed by the
//! final message. Providers with richer streaming slot in behind the same
//! trait.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Value, json};
use std::time::Duration;

use berth_agent::config::LlmSettings;
use berth_agent::llm::{
    ChatChunk, ChatRequest, ChatResponse, ChatRole, FinishReason, LlmClient, LlmError,
    ToolCallRequest, Usage,
};

pub struct OpenAiCompatClient {
    client: reqwest::Client,
    settings: LlmSettings,
}

impl OpenAiCompatClient {
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }

    fn endpoint(&self) -> String {
        let base = self
            .settings
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }
}

fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    }
}

/// Build the wire request body for an OpenAI-compatible endpoint.
pub fn build_request_body(settings: &LlmSettings, request: &ChatRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|message| {
            let mut body = json!({
                "role": role_str(message.role),
                "content": message.content,
            });
            if let Some(call_id) = &message.tool_call_id {
                body["tool_call_id"] = json!(call_id);
            }
            if !message.tool_calls.is_empty() {
                body["tool_calls"] = Value::Array(
                    message
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments.to_string(),
                                }
                            })
                        })
                        .collect(),
                );
            }
            body
        })
        .collect();

    let mut body = json!({
        "model": settings.model,
        "messages": messages,
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
    });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect(),
        );
    }
    body
}

/// Parse an OpenAI-compatible completion payload into a `ChatResponse`.
pub fn parse_response(payload: &Value) -> Result<ChatResponse, LlmError> {
    let choice = payload
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| LlmError::InvalidResponse("no choices in response".into()))?;
    let message = choice
        .get("message")
        .ok_or_else(|| LlmError::InvalidResponse("choice has no message".into()))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    let arguments = function.get("arguments").and_then(Value::as_str)?;
                    Some(ToolCallRequest {
                        id: call.get("id")?.as_str()?.to_string(),
                        name: function.get("name")?.as_str()?.to_string(),
                        arguments: serde_json::from_str(arguments)
                            .unwrap_or(Value::String(arguments.to_string())),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let usage = Usage {
        prompt_tokens: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0),
    };

    let finish_reason = match choice.get("finish_reason").and_then(Value::as_str) {
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    };

    Ok(ChatResponse {
        content,
        tool_calls,
        usage,
        finish_reason,
    })
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, Result<ChatChunk, LlmError>>, LlmError> {
        let body = build_request_body(&self.settings, &request);
        let timeout = Duration::from_secs(self.settings.request_timeout_seconds);

        let mut http_request = self
            .client
            .post(self.endpoint())
            .timeout(timeout)
            .json(&body);
        if let Some(api_key) = &self.settings.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        let response = http_request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(timeout)
            } else {
                LlmError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited(payload.to_string()));
        }
        if status.is_server_error() {
            return Err(LlmError::Network(format!("{status}: {payload}")));
        }
        if !status.is_success() {
            return Err(LlmError::Provider(format!("{status}: {payload}")));
        }

        let parsed = parse_response(&payload)?;
        let mut chunks = Vec::new();
        if !parsed.content.is_empty() {
            chunks.push(Ok(ChatChunk::Delta(parsed.content.clone())));
        }
        chunks.push(Ok(ChatChunk::Done(parsed)));
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_agent::llm::{ChatMessage, ToolDefinition};

    fn settings() -> LlmSettings {
        LlmSettings {
            model: "test-model".into(),
            ..Default::default()
        }
    }

    // ── Request shaping ────────────────────────────────────────────────────

    #[test]
    fn request_body_carries_model_messages_and_tools() {
        let request = ChatRequest {
            messages: vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
            tools: vec![ToolDefinition {
                name: "bash".into(),
                description: "run".into(),
                parameters: json!({"type": "object"}),
            }],
            temperature: 0.5,
            max_tokens: 128,
        };
        let body = build_request_body(&settings(), &request);

        assert_eq!(body["model"], "test-model");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["tools"][0]["function"]["name"], "bash");
    }

    #[test]
    fn tool_results_carry_their_call_id() {
        let request = ChatRequest {
            messages: vec![ChatMessage::tool_result("call-1", "output")],
            tools: Vec::new(),
            temperature: 0.0,
            max_tokens: 16,
        };
        let body = build_request_body(&settings(), &request);
        assert_eq!(body["messages"][0]["role"], "tool");
        assert_eq!(body["messages"][0]["tool_call_id"], "call-1");
    }

    // ── Response parsing ───────────────────────────────────────────────────

    #[test]
    fn plain_completion_parses() {
        let payload = json!({
            "choices": [{
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        });
        let parsed = parse_response(&payload).unwrap();
        assert_eq!(parsed.content, "hello");
        assert!(parsed.tool_calls.is_empty());
        assert_eq!(parsed.usage.prompt_tokens, 12);
        assert_eq!(parsed.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn tool_call_completion_parses_arguments_json() {
        let payload = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call-7",
                        "type": "function",
                        "function": {
                            "name": "web_search",
                            "arguments": "{\"query\": \"X\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1}
        });
        let parsed = parse_response(&payload).unwrap();
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "web_search");
        assert_eq!(parsed.tool_calls[0].arguments["query"], "X");
        assert_eq!(parsed.finish_reason, FinishReason::ToolCalls);
    }

    #[test]
    fn empty_choices_is_an_invalid_response() {
        let payload = json!({"choices": []});
        assert!(matches!(
            parse_response(&payload),
            Err(LlmError::InvalidResponse(_))
        ));
    }
}
