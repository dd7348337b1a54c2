//! Port over the knowledge-graph store used for long-term memory.
//!
//! The graph backend is an external collaborator; the session layer only
//! searches it and renders hits into tool observations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph backend error: {0}")]
    Backend(String),
}

/// One memory hit returned from a graph search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub id: String,
    pub content: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Long-term memory lookups scoped to a tenant and project.
#[async_trait]
pub trait GraphService: Send + Sync {
    async fn search(
        &self,
        tenant_id: &str,
        project_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>, GraphError>;
}

/// A graph service that knows nothing; useful where memory is disabled.
pub struct NoopGraphService;

#[async_trait]
impl GraphService for NoopGraphService {
    async fn search(
        &self,
        _tenant_id: &str,
        _project_id: &str,
        _query: &str,
        _limit: usize,
    ) -> Result<Vec<MemoryHit>, GraphError> {
        Ok(Vec::new())
    }
}
