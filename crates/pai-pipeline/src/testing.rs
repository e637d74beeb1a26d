//! In-memory `PipelineRunApi` used by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use pai_api::{
    CreateRunRequest, ListNodeOutputsRequest, ListRunsRequest, NodeDetail, NodeMetadata,
    NodeOutput, NodeSpec, NodeStatus, PaginatedResult, PipelineRunApi, RunInfo,
};
use pai_types::{PaiError, Result, RunStatus};

/// Scripted responses. A queue with more than one entry is popped on each
/// call; the last entry repeats forever. Node queues only advance on tree
/// walks (`depth >= 2`); single-node status checks peek at the front.
///
/// `stalled_runs` maps a run id to the number of `get_run` calls answered
/// before the next one hangs forever. `late_logs` are appended to a node's
/// log the next time its status is checked.
#[derive(Default)]
pub(crate) struct MockApi {
    pub runs: Mutex<HashMap<String, VecDeque<RunInfo>>>,
    pub nodes: Mutex<HashMap<String, VecDeque<Option<NodeDetail>>>>,
    pub logs: Mutex<HashMap<String, Vec<String>>>,
    pub outputs: Mutex<Vec<NodeOutput>>,
    pub created: Mutex<Vec<CreateRunRequest>>,
    pub calls: Mutex<Vec<String>>,
    pub stalled_runs: Mutex<HashMap<String, usize>>,
    pub late_logs: Mutex<HashMap<String, Vec<String>>>,
}

fn next<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

impl MockApi {
    pub fn with_run(self, info: RunInfo) -> Self {
        self.push_run(info);
        self
    }

    pub fn push_run(&self, info: RunInfo) {
        self.runs
            .lock()
            .unwrap()
            .entry(info.run_id.clone())
            .or_default()
            .push_back(info);
    }

    pub fn push_node(&self, node_id: &str, node: Option<NodeDetail>) {
        self.nodes
            .lock()
            .unwrap()
            .entry(node_id.to_string())
            .or_default()
            .push_back(node);
    }

    pub fn replace_node(&self, node_id: &str, node: Option<NodeDetail>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(node_id.to_string(), VecDeque::from([node]));
    }

    pub fn set_logs(&self, node_id: &str, lines: &[&str]) {
        self.logs.lock().unwrap().insert(
            node_id.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
    }

    pub fn stall_run_after(&self, run_id: &str, answered: usize) {
        self.stalled_runs
            .lock()
            .unwrap()
            .insert(run_id.to_string(), answered);
    }

    pub fn add_late_logs(&self, node_id: &str, lines: &[&str]) {
        self.late_logs.lock().unwrap().insert(
            node_id.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
    }

    pub fn calls(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

pub(crate) fn run_info(run_id: &str, name: &str, status: RunStatus, node_id: Option<&str>) -> RunInfo {
    RunInfo {
        run_id: run_id.into(),
        name: name.into(),
        workspace_id: None,
        node_id: node_id.map(String::from),
        status,
        user_id: None,
        parent_user_id: None,
        source: None,
        started_at: None,
        finished_at: None,
        duration: None,
    }
}

/// A started node with the given children.
pub(crate) fn node(
    name: &str,
    node_id: &str,
    node_type: &str,
    status: RunStatus,
    children: Vec<NodeDetail>,
) -> NodeDetail {
    NodeDetail {
        metadata: NodeMetadata {
            name: name.into(),
            node_id: Some(node_id.into()),
            node_type: Some(node_type.into()),
        },
        status_info: NodeStatus {
            status,
            started_at: Some(chrono::Utc::now()),
            finished_at: None,
        },
        spec: NodeSpec { pipelines: children },
    }
}

#[async_trait]
impl PipelineRunApi for MockApi {
    async fn create_run(&self, request: &CreateRunRequest) -> Result<String> {
        self.record("create_run".into());
        self.created.lock().unwrap().push(request.clone());
        Ok("flow-created".into())
    }

    async fn get_run(&self, run_id: &str) -> Result<RunInfo> {
        self.record(format!("get_run:{run_id}"));
        let answered = self.stalled_runs.lock().unwrap().get(run_id).copied();
        if answered.is_some_and(|n| self.calls(&format!("get_run:{run_id}")) > n) {
            return std::future::pending().await;
        }
        let mut runs = self.runs.lock().unwrap();
        runs.get_mut(run_id)
            .and_then(next)
            .ok_or_else(|| PaiError::NotFound {
                resource: format!("run {run_id}"),
            })
    }

    async fn list_runs(&self, _request: &ListRunsRequest) -> Result<PaginatedResult<RunInfo>> {
        self.record("list_runs".into());
        let runs = self.runs.lock().unwrap();
        let mut items: Vec<RunInfo> = runs.values().filter_map(|q| q.back().cloned()).collect();
        items.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(PaginatedResult::new(items))
    }

    async fn get_node(&self, _run_id: &str, node_id: &str, depth: u32) -> Result<Option<NodeDetail>> {
        self.record(format!("get_node:{node_id}:{depth}"));
        if depth < 2 {
            let late = self.late_logs.lock().unwrap().remove(node_id);
            if let Some(late) = late {
                self.logs
                    .lock()
                    .unwrap()
                    .entry(node_id.to_string())
                    .or_default()
                    .extend(late);
            }
        }
        let mut nodes = self.nodes.lock().unwrap();
        let queue = match nodes.get_mut(node_id) {
            Some(queue) => queue,
            None => return Ok(None),
        };
        if depth >= 2 {
            Ok(next(queue).flatten())
        } else {
            Ok(queue.front().cloned().flatten())
        }
    }

    async fn list_node_outputs(
        &self,
        request: &ListNodeOutputsRequest,
    ) -> Result<PaginatedResult<NodeOutput>> {
        self.record(format!("list_node_outputs:{}", request.node_id));
        let outputs = self.outputs.lock().unwrap();
        let items = outputs
            .iter()
            .filter(|o| request.name.as_ref().map_or(true, |n| &o.name == n))
            .filter(|o| {
                request
                    .output_type
                    .as_ref()
                    .map_or(true, |t| o.output_type.as_ref() == Some(t))
            })
            .cloned()
            .collect();
        Ok(PaginatedResult::new(items))
    }

    async fn list_node_logs(
        &self,
        _run_id: &str,
        node_id: &str,
        offset: u64,
        page_size: u32,
    ) -> Result<PaginatedResult<String>> {
        self.record(format!("list_node_logs:{node_id}:{offset}"));
        let logs = self.logs.lock().unwrap();
        let items = logs
            .get(node_id)
            .map(|lines| {
                lines
                    .iter()
                    .skip(offset as usize)
                    .take(page_size as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(PaginatedResult::new(items))
    }

    async fn start(&self, run_id: &str) -> Result<()> {
        self.record(format!("start:{run_id}"));
        Ok(())
    }

    async fn terminate(&self, run_id: &str) -> Result<()> {
        self.record(format!("terminate:{run_id}"));
        Ok(())
    }
}
