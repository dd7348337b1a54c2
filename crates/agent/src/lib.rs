//! Berth agent core: durable ReAct sessions, the per-conversation event
//! pipeline, human-in-the-loop plumbing, and tool execution.
//!
//! The crate is organised around four seams:
//!
//! - [`store`] + [`broker`]: the durable event log and the replayable stream,
//!   joined by [`event_sink`] into the single emit path every event takes
//! - [`hitl`]: pending human prompts and their cross-process resolution
//! - [`tools`] + [`processor`]: the tool protocol and the ReAct turn loop
//! - [`workflow`] + [`orchestrator`]: long-lived session instances and the
//!   request-facing chat entry point
//!
//! Sandbox lifecycle lives in the sibling `berth-sandbox` crate.

pub mod broker;
pub mod config;
pub mod error;
pub mod event_sink;
pub mod events;
pub mod graph;
pub mod hitl;
pub mod llm;
pub mod orchestrator;
pub mod processor;
pub mod store;
pub mod tools;
pub mod workflow;

#[cfg(test)]
pub mod test_utils;

pub use error::{AgentError, AgentResult};
pub use event_sink::EventSink;
pub use events::{AgentEventKind, PersistedEvent, SseEvent, StreamPayload};
pub use orchestrator::ChatService;
pub use processor::{SessionProcessor, TurnRequest, TurnResult};
pub use workflow::{SessionHost, session_workflow_id};
