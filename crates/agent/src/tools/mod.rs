//! Tool protocol, registry, executor, and the built-in tool set.

pub mod builtins;
pub mod context;
pub mod executor;
pub mod registry;

pub use context::{ComputerControl, Tool, ToolContext, ToolError, validate_args};
pub use executor::{ToolExecutor, ToolRunOutcome, call_fingerprint};
pub use registry::ToolRegistry;
