//! Remote pipeline runs: inspection, control, and waiting for completion.
//!
//! Orchestration happens on the service. A [`PipelineRun`] only mirrors the
//! remote state by polling the node tree, and tails node logs while it waits.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pai_api::{ListNodeOutputsRequest, ListRunsRequest, NodeDetail, NodeOutput, PipelineRunApi, RunInfo};
use pai_types::{PaiError, Result, RunStatus};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::events::{EventEmitter, RunEvent};
use crate::log_tail::{RunLogger, TailOptions};

/// Depth requested from `GetNode` while walking the tree: a node plus its
/// direct children.
const TRAVEL_NODE_DEPTH: u32 = 2;

/// Status of one node in a run's workflow tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatusInfo {
    pub name: String,
    pub node_id: Option<String>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeStatusInfo {
    fn from_node(node: &NodeDetail) -> Self {
        Self {
            name: node.metadata.name.clone(),
            node_id: node.metadata.node_id.clone().filter(|id| !id.is_empty()),
            status: node.status_info.status,
            started_at: node.status_info.started_at,
            finished_at: node.status_info.finished_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    /// Interval between `GetRun` calls while the root node is unassigned.
    pub init_interval: Duration,
    pub max_depth: u32,
    pub show_logs: bool,
    pub tail: TailOptions,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            init_interval: Duration::from_secs(1),
            max_depth: 10,
            show_logs: true,
            tail: TailOptions::default(),
        }
    }
}

/// Maps a status that cannot be waited on to its error. `Ok(true)` means the
/// run already succeeded, `Ok(false)` that it is still going.
fn check_waitable(run_id: &str, status: RunStatus) -> Result<bool> {
    match status {
        RunStatus::Initialized => Err(PaiError::RunNotStarted {
            run_id: run_id.to_string(),
        }),
        RunStatus::Terminated | RunStatus::Suspended => Err(PaiError::RunStopped {
            run_id: run_id.to_string(),
            status,
        }),
        RunStatus::Failed => Err(PaiError::RunFailed {
            run_id: run_id.to_string(),
            detail: "run is in status Failed".into(),
        }),
        RunStatus::Skipped | RunStatus::Unknown => Err(PaiError::UnexpectedRunStatus {
            run_id: run_id.to_string(),
            status,
        }),
        RunStatus::Succeeded => Ok(true),
        _ => Ok(false),
    }
}

// ---------------------------------------------------------------------------
// PipelineRun
// ---------------------------------------------------------------------------

pub struct PipelineRun {
    api: Arc<dyn PipelineRunApi>,
    info: RunInfo,
    events: EventEmitter,
}

impl std::fmt::Debug for PipelineRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRun")
            .field("run_id", &self.info.run_id)
            .field("name", &self.info.name)
            .field("status", &self.info.status)
            .finish()
    }
}

impl PipelineRun {
    pub fn from_info(api: Arc<dyn PipelineRunApi>, info: RunInfo) -> Self {
        Self {
            api,
            info,
            events: EventEmitter::default(),
        }
    }

    pub async fn get(api: Arc<dyn PipelineRunApi>, run_id: &str) -> Result<Self> {
        let info = api.get_run(run_id).await?;
        Ok(Self::from_info(api, info))
    }

    pub async fn list(api: Arc<dyn PipelineRunApi>, request: &ListRunsRequest) -> Result<Vec<Self>> {
        let page = api.list_runs(request).await?;
        Ok(page
            .items
            .into_iter()
            .map(|info| Self::from_info(api.clone(), info))
            .collect())
    }

    /// Use a shared emitter, e.g. one the caller already subscribed to.
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn run_id(&self) -> &str {
        &self.info.run_id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &RunInfo {
        &self.info
    }

    /// Status as of the last fetch.
    pub fn status(&self) -> RunStatus {
        self.info.status
    }

    /// Path of the root node in [`travel_node_status_info`](Self::travel_node_status_info) results.
    pub fn root_path(&self) -> &str {
        if self.info.name.is_empty() {
            &self.info.run_id
        } else {
            &self.info.name
        }
    }

    /// Re-fetch the run and return its current status.
    pub async fn refresh(&mut self) -> Result<RunStatus> {
        self.info = self.api.get_run(&self.info.run_id).await?;
        Ok(self.info.status)
    }

    /// [`refresh`](Self::refresh), abandoned as soon as `cancel` fires.
    async fn refresh_or_cancel(&mut self, cancel: &CancellationToken) -> Result<RunStatus> {
        let run_id = self.info.run_id.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PaiError::Cancelled { run_id }),
            status = self.refresh() => status,
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.api.start(&self.info.run_id).await?;
        tracing::info!(run_id = %self.info.run_id, "Started run");
        Ok(())
    }

    pub async fn terminate(&self) -> Result<()> {
        self.api.terminate(&self.info.run_id).await?;
        tracing::info!(run_id = %self.info.run_id, "Terminated run");
        Ok(())
    }

    pub async fn node_detail(&self, node_id: &str, depth: u32) -> Result<Option<NodeDetail>> {
        self.api.get_node(&self.info.run_id, node_id, depth).await
    }

    /// Outputs archived under the root node, optionally filtered by name and
    /// type. Empty when the run has no root node yet.
    pub async fn outputs(&self, name: Option<&str>, output_type: Option<&str>) -> Result<Vec<NodeOutput>> {
        let node_id = match self.info.root_node_id() {
            Some(id) => id.to_string(),
            None => match self.api.get_run(&self.info.run_id).await?.root_node_id() {
                Some(id) => id.to_string(),
                None => return Ok(Vec::new()),
            },
        };
        let mut request = ListNodeOutputsRequest::new(self.info.run_id.clone(), node_id);
        request.name = name.map(String::from);
        request.output_type = output_type.map(String::from);
        Ok(self.api.list_node_outputs(&request).await?.items)
    }

    /// The single model output of the run, or the one named `name`.
    pub async fn select_model_output(&self, name: Option<&str>) -> Result<NodeOutput> {
        let mut models = self.outputs(name, Some("Model")).await?;
        match models.len() {
            0 => Err(PaiError::NotFound {
                resource: format!("Model output of run {}", self.info.run_id),
            }),
            1 => Ok(models.remove(0)),
            n => {
                let names: Vec<_> = models.iter().map(|m| m.name.as_str()).collect();
                Err(PaiError::AmbiguousOutput(format!(
                    "run {} has {n} model outputs ({}); select one by name",
                    self.info.run_id,
                    names.join(", ")
                )))
            }
        }
    }

    /// Poll until the service assigns the root node, returning its id.
    pub async fn wait_for_init(&mut self, interval: Duration, cancel: &CancellationToken) -> Result<String> {
        loop {
            self.refresh_or_cancel(cancel).await?;
            if let Some(id) = self.info.root_node_id() {
                return Ok(id.to_string());
            }
            if !self.info.status.is_running() {
                return Err(PaiError::MissingRootNode {
                    run_id: self.info.run_id.clone(),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => {
                    return Err(PaiError::Cancelled { run_id: self.info.run_id.clone() });
                }
            }
        }
    }

    /// Walk the workflow tree below `node_id`, keyed by dotted path. The
    /// node itself is keyed by the run name; children append their name.
    /// Nodes that have not started yet are left out, and sub-workflows are
    /// followed at most `max_depth` levels.
    pub async fn travel_node_status_info(
        &self,
        node_id: &str,
        max_depth: u32,
    ) -> Result<BTreeMap<String, NodeStatusInfo>> {
        let mut statuses = BTreeMap::new();
        let mut pending = vec![(node_id.to_string(), self.root_path().to_string(), 1u32)];

        while let Some((id, path, depth)) = pending.pop() {
            if depth > max_depth {
                continue;
            }
            let Some(detail) = self.api.get_node(&self.info.run_id, &id, TRAVEL_NODE_DEPTH).await? else {
                continue;
            };
            if detail.status_info.started_at.is_none() {
                continue;
            }
            statuses.insert(path.clone(), NodeStatusInfo::from_node(&detail));

            for child in &detail.spec.pipelines {
                if child.status_info.started_at.is_none() {
                    continue;
                }
                let child_path = format!("{path}.{}", child.metadata.name);
                let info = NodeStatusInfo::from_node(child);
                if child.metadata.is_dag() {
                    if let Some(ref child_id) = info.node_id {
                        pending.push((child_id.clone(), child_path.clone(), depth + 1));
                    }
                }
                statuses.insert(child_path, info);
            }
        }
        Ok(statuses)
    }

    /// Block until the run finishes, tailing node logs on the way.
    ///
    /// Returns immediately for a run that already succeeded. Fails for runs
    /// that were never started, were stopped, or failed, and as soon as any
    /// node fails. Cancelling `cancel` stops log tailing and returns
    /// [`PaiError::Cancelled`].
    pub async fn wait_for_completion(
        &mut self,
        options: WaitOptions,
        cancel: CancellationToken,
    ) -> Result<RunStatus> {
        let status = self.refresh_or_cancel(&cancel).await?;
        if check_waitable(&self.info.run_id, status)? {
            self.events.emit(RunEvent::RunSucceeded {
                run_id: self.info.run_id.clone(),
            });
            return Ok(status);
        }

        tracing::info!(run_id = %self.info.run_id, "Wait for run workflow init");
        let root = match self.info.root_node_id() {
            Some(id) => id.to_string(),
            None => self.wait_for_init(options.init_interval, &cancel).await?,
        };

        let mut logger = options.show_logs.then(|| {
            RunLogger::new(
                self.api.clone(),
                self.info.run_id.clone(),
                self.events.clone(),
                options.tail.clone(),
            )
        });

        let result = self.poll(&root, &options, &cancel, logger.as_mut()).await;
        if let Some(logger) = logger {
            if result.is_err() {
                logger.stop_tail();
            }
            let lines = logger.join().await;
            tracing::debug!(run_id = %self.info.run_id, lines, "Log tailing finished");
        }

        match result {
            Ok(status) => {
                tracing::info!(run_id = %self.info.run_id, %status, "Run finished");
                self.events.emit(RunEvent::RunSucceeded {
                    run_id: self.info.run_id.clone(),
                });
                Ok(status)
            }
            Err(e) => {
                if !matches!(e, PaiError::Cancelled { .. }) {
                    self.events.emit(RunEvent::RunFailed {
                        run_id: self.info.run_id.clone(),
                        error: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    async fn poll(
        &mut self,
        root: &str,
        options: &WaitOptions,
        cancel: &CancellationToken,
        mut logger: Option<&mut RunLogger>,
    ) -> Result<RunStatus> {
        let cancelled = || PaiError::Cancelled {
            run_id: self.info.run_id.clone(),
        };
        let mut previous: BTreeMap<String, NodeStatusInfo> = BTreeMap::new();
        let mut root_status = self.info.status;

        while root_status.is_running() {
            let current = tokio::select! {
                statuses = self.travel_node_status_info(root, options.max_depth) => statuses?,
                _ = cancel.cancelled() => return Err(cancelled()),
            };

            for (path, info) in &current {
                match previous.get(path) {
                    None => {
                        self.events.emit(RunEvent::NodeDiscovered {
                            path: path.clone(),
                            node_id: info.node_id.clone().unwrap_or_default(),
                            status: info.status,
                        });
                        if info.status != RunStatus::Skipped {
                            if let (Some(logger), Some(node_id)) = (logger.as_deref_mut(), info.node_id.as_deref()) {
                                logger.submit(node_id, path);
                            }
                        }
                    }
                    Some(prev) if prev.status != info.status => {
                        tracing::debug!(node = %path, from = %prev.status, to = %info.status, "Node status changed");
                        self.events.emit(RunEvent::NodeStatusChanged {
                            path: path.clone(),
                            from: prev.status,
                            to: info.status,
                        });
                    }
                    Some(_) => {}
                }
            }

            root_status = match current.get(self.root_path()) {
                Some(info) => info.status,
                None => tokio::select! {
                    run = self.api.get_run(&self.info.run_id) => run?.status,
                    _ = cancel.cancelled() => return Err(cancelled()),
                },
            };

            if root_status == RunStatus::Failed {
                return Err(PaiError::RunFailed {
                    run_id: self.info.run_id.clone(),
                    detail: format!("root node failed; nodes: {}", summarize(&current)),
                });
            }
            let failed: Vec<&str> = current
                .iter()
                .filter(|(_, info)| info.status == RunStatus::Failed)
                .map(|(path, _)| path.as_str())
                .collect();
            if !failed.is_empty() {
                return Err(PaiError::RunFailed {
                    run_id: self.info.run_id.clone(),
                    detail: format!("failed nodes: {}", failed.join(", ")),
                });
            }
            previous = current;

            if !root_status.is_running() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(options.poll_interval) => {}
                _ = cancel.cancelled() => return Err(cancelled()),
            }
        }

        self.info.status = root_status;
        check_waitable(&self.info.run_id, root_status)?;
        Ok(root_status)
    }
}

fn summarize(statuses: &BTreeMap<String, NodeStatusInfo>) -> String {
    statuses
        .iter()
        .map(|(path, info)| format!("{path}={}", info.status))
        .collect::<Vec<_>>()
        .join(", ")
}
