use async_trait::async_trait;
use pai_types::Result;

use crate::{
    CreateRunRequest, ListNodeOutputsRequest, ListRunsRequest, NodeDetail, NodeOutput,
    PaginatedResult, RunInfo,
};

// ---------------------------------------------------------------------------
// PipelineRunApi
// ---------------------------------------------------------------------------

/// Remote operations on pipeline runs.
///
/// Implementations perform no retries; transient failures surface as
/// retryable [`pai_types::PaiError`]s.
#[async_trait]
pub trait PipelineRunApi: Send + Sync {
    /// Create a run from a pipeline manifest and return its id.
    async fn create_run(&self, request: &CreateRunRequest) -> Result<String>;

    async fn get_run(&self, run_id: &str) -> Result<RunInfo>;

    async fn list_runs(&self, request: &ListRunsRequest) -> Result<PaginatedResult<RunInfo>>;

    /// Fetch a node with `depth` levels of children. `None` when the service
    /// has nothing for the node yet.
    async fn get_node(&self, run_id: &str, node_id: &str, depth: u32)
        -> Result<Option<NodeDetail>>;

    async fn list_node_outputs(
        &self,
        request: &ListNodeOutputsRequest,
    ) -> Result<PaginatedResult<NodeOutput>>;

    /// One page of log lines for a node, starting at line `offset`.
    async fn list_node_logs(
        &self,
        run_id: &str,
        node_id: &str,
        offset: u64,
        page_size: u32,
    ) -> Result<PaginatedResult<String>>;

    async fn start(&self, run_id: &str) -> Result<()>;

    async fn terminate(&self, run_id: &str) -> Result<()>;
}
