//! HITL tools: the agent's way of pausing for human input.
//!
//! Each tool opens a request through the registry and blocks until a user
//! response, a timeout, or cancellation resolves it. The registry owns the
//! `*_asked`/`*_answered` events; the tools only shape arguments and render
//! the resolution for the model.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

use crate::hitl::types::{
    AnswerSource, ClarificationOption, DecisionOption, EnvVarField, HitlKind, HitlOptions,
};
use crate::hitl::HitlRequestSpec;
use crate::llm::ToolDefinition;
use crate::tools::context::{Tool, ToolContext, ToolError};

fn parse_options<T: serde::de::DeserializeOwned>(args: &Value, key: &str) -> Result<Vec<T>, ToolError> {
    match args.get(key) {
        None => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| ToolError::InvalidArguments(format!("bad '{key}': {e}"))),
    }
}

fn render_answer(answer: &Value, source: AnswerSource) -> Value {
    match source {
        AnswerSource::User => json!({"answer": answer}),
        AnswerSource::Timeout => json!({"answer": answer, "note": "answered by timeout default"}),
        AnswerSource::Cancelled => json!({"answer": null, "note": "request was cancelled"}),
    }
}

/// Ask the user to clarify an ambiguous requirement.
pub struct AskClarificationTool;

#[async_trait]
impl Tool for AskClarificationTool {
    fn name(&self) -> &str {
        "ask_clarification"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "ask_clarification".into(),
            description: "Ask the user a clarifying question when requirements are ambiguous \
                          or multiple valid approaches exist. Blocks until the user answers."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "question": {
                        "type": "string",
                        "description": "The clarification question to ask"
                    },
                    "options": {
                        "type": "array",
                        "description": "Predefined choices",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "label": {"type": "string"},
                                "description": {"type": "string"},
                                "recommended": {"type": "boolean"}
                            },
                            "required": ["id", "label"]
                        }
                    },
                    "allow_custom": {
                        "type": "boolean",
                        "description": "Whether a free-text answer is accepted"
                    }
                },
                "required": ["question"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let question = args["question"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("'question' must be a string".into()))?;
        let options: Vec<ClarificationOption> = parse_options(&args, "options")?;
        let allow_custom = args.get("allow_custom").and_then(Value::as_bool).unwrap_or(true);

        let answer = ctx
            .hitl
            .request(HitlRequestSpec {
                conversation_id: ctx.conversation_id.clone(),
                message_id: ctx.message_id.clone(),
                kind: HitlKind::Clarification,
                prompt: question.to_string(),
                options: HitlOptions::Clarification(options),
                allow_custom,
                default_choice: None,
                timeout: Some(Duration::from_secs(ctx.config.hitl_timeout_seconds)),
            })
            .await?;

        Ok(render_answer(&answer.answer, answer.source))
    }
}

/// Ask the user to pick between consequential alternatives.
pub struct RequestDecisionTool;

#[async_trait]
impl Tool for RequestDecisionTool {
    fn name(&self) -> &str {
        "request_decision"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "request_decision".into(),
            description: "Ask the user to decide between alternatives with visible cost, time \
                          and risk estimates. Use for irreversible or expensive choices. A \
                          default_choice is applied if the user does not answer in time."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "question": {
                        "type": "string",
                        "description": "The decision to put in front of the user"
                    },
                    "options": {
                        "type": "array",
                        "description": "Alternatives to decide between",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "label": {"type": "string"},
                                "description": {"type": "string"},
                                "recommended": {"type": "boolean"},
                                "estimated_time": {
                                    "type": "string",
                                    "description": "Rough time estimate, e.g. '10m'"
                                },
                                "estimated_cost": {
                                    "type": "string",
                                    "description": "Rough cost estimate, e.g. '$5'"
                                },
                                "risks": {
                                    "type": "array",
                                    "items": {"type": "string"},
                                    "description": "List of potential risks with this option"
                                }
                            },
                            "required": ["id", "label"]
                        }
                    },
                    "allow_custom": {"type": "boolean"},
                    "default_choice": {
                        "type": "string",
                        "description": "Option id applied when the request times out"
                    }
                },
                "required": ["question", "options"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let question = args["question"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("'question' must be a string".into()))?;
        let options: Vec<DecisionOption> = parse_options(&args, "options")?;
        if options.is_empty() {
            return Err(ToolError::InvalidArguments(
                "a decision needs at least one option".into(),
            ));
        }
        let allow_custom = args.get("allow_custom").and_then(Value::as_bool).unwrap_or(false);
        let default_choice = args
            .get("default_choice")
            .and_then(Value::as_str)
            .map(str::to_string);

        let answer = ctx
            .hitl
            .request(HitlRequestSpec {
                conversation_id: ctx.conversation_id.clone(),
                message_id: ctx.message_id.clone(),
                kind: HitlKind::Decision,
                prompt: question.to_string(),
                options: HitlOptions::Decision(options),
                allow_custom,
                default_choice,
                timeout: Some(Duration::from_secs(ctx.config.hitl_timeout_seconds)),
            })
            .await?;

        Ok(render_answer(&answer.answer, answer.source))
    }
}

/// Ask the user for environment variables (credentials, endpoints).
pub struct RequestEnvVarTool;

#[async_trait]
impl Tool for RequestEnvVarTool {
    fn name(&self) -> &str {
        "request_env_var"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "request_env_var".into(),
            description: "Request environment variables from the user, e.g. API keys the task \
                          needs. Values are delivered out of band and never echoed into the \
                          conversation."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "prompt": {
                        "type": "string",
                        "description": "Why the variables are needed"
                    },
                    "variables": {
                        "type": "array",
                        "description": "Variables to request",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": {"type": "string"},
                                "description": {"type": "string"},
                                "input_type": {
                                    "type": "string",
                                    "enum": ["text", "password", "url"]
                                },
                                "required": {"type": "boolean"},
                                "validation_pattern": {"type": "string"}
                            },
                            "required": ["name"]
                        }
                    }
                },
                "required": ["prompt", "variables"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let prompt = args["prompt"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("'prompt' must be a string".into()))?;
        let variables: Vec<EnvVarField> = parse_options(&args, "variables")?;
        if variables.is_empty() {
            return Err(ToolError::InvalidArguments(
                "at least one variable must be requested".into(),
            ));
        }

        let answer = ctx
            .hitl
            .request(HitlRequestSpec {
                conversation_id: ctx.conversation_id.clone(),
                message_id: ctx.message_id.clone(),
                kind: HitlKind::EnvVar,
                prompt: prompt.to_string(),
                options: HitlOptions::EnvVar(variables),
                allow_custom: false,
                default_choice: None,
                timeout: Some(Duration::from_secs(ctx.config.hitl_timeout_seconds)),
            })
            .await?;

        // Report which names were provided; the values themselves go to the
        // sandbox environment, not the model.
        let provided: Vec<String> = answer
            .answer
            .as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        Ok(json!({"provided": provided}))
    }
}
