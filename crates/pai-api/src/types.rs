use chrono::{DateTime, Utc};
use pai_types::RunStatus;
use serde::{Deserialize, Serialize};

fn unknown_status() -> RunStatus {
    RunStatus::Unknown
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// A pipeline run as returned by `GetRun` / `ListRuns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunInfo {
    pub run_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    /// Root node of the run's workflow; allocated after the run starts.
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default = "unknown_status")]
    pub status: RunStatus,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub parent_user_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration: Option<u64>,
}

impl RunInfo {
    /// The root node id, treating an empty string as unassigned.
    pub fn root_node_id(&self) -> Option<&str> {
        self.node_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Filters for `ListRuns`.
#[derive(Debug, Clone)]
pub struct ListRunsRequest {
    pub name: Option<String>,
    pub run_id: Option<String>,
    pub pipeline_id: Option<String>,
    pub status: Option<RunStatus>,
    pub sort_by: Option<String>,
    pub order: Option<String>,
    pub workspace_id: Option<String>,
    pub page_size: u32,
    pub page_number: u32,
}

impl Default for ListRunsRequest {
    fn default() -> Self {
        Self {
            name: None,
            run_id: None,
            pipeline_id: None,
            status: None,
            sort_by: None,
            order: None,
            workspace_id: None,
            page_size: 20,
            page_number: 1,
        }
    }
}

/// Body of `CreateRun`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateRunRequest {
    pub name: String,
    /// Pipeline manifest (YAML).
    pub manifest: String,
    /// Run arguments (YAML), if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    /// When `true` the service starts the run right after creating it.
    pub no_confirm_required: bool,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A node of a run's workflow tree, as returned by `GetNode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeDetail {
    pub metadata: NodeMetadata,
    pub status_info: NodeStatus,
    #[serde(default)]
    pub spec: NodeSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeMetadata {
    pub name: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
}

impl NodeMetadata {
    /// True for sub-workflow nodes whose children must be fetched separately.
    pub fn is_dag(&self) -> bool {
        self.node_type.as_deref() == Some("Dag")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeStatus {
    #[serde(default = "unknown_status")]
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeSpec {
    /// Child nodes (one level deep per requested depth).
    #[serde(default)]
    pub pipelines: Vec<NodeDetail>,
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// An archived output produced by a run node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeOutput {
    pub name: String,
    #[serde(default)]
    pub producer: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    /// Artifact data type (`DataSet`, `Model`, ...).
    #[serde(default, rename = "Type")]
    pub output_type: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Filters for `ListNodeOutputs`.
#[derive(Debug, Clone)]
pub struct ListNodeOutputsRequest {
    pub run_id: String,
    pub node_id: String,
    pub name: Option<String>,
    pub depth: u32,
    pub output_type: Option<String>,
}

impl ListNodeOutputsRequest {
    pub fn new(run_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            node_id: node_id.into(),
            name: None,
            depth: 1,
            output_type: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// One page of a list API.
#[derive(Debug, Clone, PartialEq)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub total_count: u64,
}

impl<T> PaginatedResult<T> {
    pub fn new(items: Vec<T>) -> Self {
        let total_count = items.len() as u64;
        Self { items, total_count }
    }

    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total_count: 0,
        }
    }
}
