//! Project sandbox lifecycle management for berth agent sessions.
//!
//! Each project owns at most one execution container at any instant. This
//! crate provides the pieces that enforce that invariant:
//!
//! - [`state`]: the four-state lifecycle machine and its transition table
//! - [`domain`]: the durable project ↔ sandbox association entity
//! - [`adapter`]: the port over the container runtime (create, terminate,
//!   probe, invoke tools)
//! - [`repository`]: persistence for associations with a unique-per-project
//!   constraint
//! - [`lock`]: the distributed lock port used to serialise writers across
//!   processes
//! - [`service`]: the single-writer lifecycle coordinator combining all of
//!   the above
//! - [`reconciler`]: the startup sweep that adopts or terminates containers
//!   the service no longer tracks

pub mod adapter;
pub mod domain;
pub mod error;
pub mod lock;
pub mod reconciler;
pub mod repository;
pub mod service;
pub mod state;

pub use adapter::{
    SandboxAdapter, SandboxConfig, SandboxInstance, SandboxProfile, ToolOutcome,
};
pub use domain::ProjectSandbox;
pub use error::SandboxError;
pub use lock::{DistributedLock, LocalLockManager};
pub use reconciler::{OrphanPolicy, ReconcileReport, SandboxReconciler};
pub use repository::{SandboxRepository, SqliteSandboxRepository};
pub use service::{SandboxService, SandboxServiceConfig, SandboxStatusInfo};
pub use state::{InvalidStateTransition, SandboxState};
