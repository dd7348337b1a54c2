//! Relational persistence: conversations, the event journal, checkpoints,
//! tool-execution audit records, and pending HITL prompts.

pub mod domain;
pub mod error;
pub mod schema;
pub mod sqlite;
#[allow(clippy::module_inception)]
pub mod store;

pub use domain::{Conversation, ConversationStatus, ExecutionCheckpoint, ToolExecutionRecord};
pub use error::{StoreError, StoreResult};
pub use sqlite::SqliteStore;
pub use store::{
    CheckpointStore, ConversationStore, EventLog, HitlRequestStore, NewEvent, ToolExecutionStore,
};
