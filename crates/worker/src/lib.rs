//! Worker library: configuration, platform assembly, and the local adapters
//! used by single-host deployments.

pub mod bootstrap;
pub mod config;
pub mod llm_client;
pub mod local_sandbox;

pub use bootstrap::{Platform, build};
pub use config::WorkerConfig;
