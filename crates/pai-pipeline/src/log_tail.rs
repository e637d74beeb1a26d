//! Tailing node logs of a remote run.
//!
//! [`log_stream`] turns the paginated `list_node_logs` call into a stream of
//! lines; [`RunLogger`] runs one bounded background task per node, each
//! repeating sweeps until its node stops running.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, Stream, TryStreamExt};
use pai_api::PipelineRunApi;
use pai_types::{PaiError, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{EventEmitter, RunEvent};

// ---------------------------------------------------------------------------
// LogCursor / log_stream
// ---------------------------------------------------------------------------

/// Read position in one node's log.
#[derive(Clone)]
pub struct LogCursor {
    api: Arc<dyn PipelineRunApi>,
    run_id: String,
    node_id: String,
    offset: u64,
    page_size: u32,
}

impl LogCursor {
    pub fn new(
        api: Arc<dyn PipelineRunApi>,
        run_id: impl Into<String>,
        node_id: impl Into<String>,
        page_size: u32,
    ) -> Self {
        Self {
            api,
            run_id: run_id.into(),
            node_id: node_id.into(),
            offset: 0,
            page_size: page_size.max(1),
        }
    }

    /// Lines consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Fetch the page at the current offset and advance past it.
    pub async fn next_page(&mut self) -> Result<Vec<String>> {
        let page = self
            .api
            .list_node_logs(&self.run_id, &self.node_id, self.offset, self.page_size)
            .await?;
        self.offset += page.items.len() as u64;
        Ok(page.items)
    }
}

/// One sweep over the log from the cursor's position: pages are fetched
/// until a short page comes back. The cursor keeps its position, so the next
/// sweep picks up new lines only.
pub fn log_stream(cursor: &mut LogCursor) -> impl Stream<Item = Result<String>> + Send + '_ {
    stream::try_unfold((cursor, false), |(cursor, done)| async move {
        if done {
            return Ok::<_, PaiError>(None);
        }
        let lines = cursor.next_page().await?;
        let done = lines.len() < cursor.page_size as usize;
        Ok(Some((lines, (cursor, done))))
    })
    .map_ok(|lines| stream::iter(lines.into_iter().map(Ok::<_, PaiError>)))
    .try_flatten()
}

// ---------------------------------------------------------------------------
// RunLogger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TailOptions {
    /// Maximum number of nodes tailed at once.
    pub concurrency: usize,
    pub page_size: u32,
    /// Pause before re-checking a running node that produced no new lines.
    pub idle_interval: Duration,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            page_size: 100,
            idle_interval: Duration::from_secs(2),
        }
    }
}

/// Tails the logs of every node submitted to it.
pub struct RunLogger {
    api: Arc<dyn PipelineRunApi>,
    run_id: String,
    events: EventEmitter,
    options: TailOptions,
    permits: Arc<Semaphore>,
    tailing: Arc<Mutex<HashSet<String>>>,
    stop: CancellationToken,
    handles: Vec<JoinHandle<u64>>,
}

impl RunLogger {
    pub fn new(
        api: Arc<dyn PipelineRunApi>,
        run_id: impl Into<String>,
        events: EventEmitter,
        options: TailOptions,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(options.concurrency.max(1))),
            api,
            run_id: run_id.into(),
            events,
            options,
            tailing: Arc::new(Mutex::new(HashSet::new())),
            stop: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Start tailing `node_id` in the background. Returns `false` if the node
    /// is already being tailed.
    pub fn submit(&mut self, node_id: &str, path: &str) -> bool {
        {
            let mut tailing = match self.tailing.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !tailing.insert(node_id.to_string()) {
                return false;
            }
        }
        tracing::info!(node = %path, node_id, "Add node logger");

        let task = TailTask {
            cursor: LogCursor::new(
                self.api.clone(),
                self.run_id.clone(),
                node_id,
                self.options.page_size,
            ),
            path: path.to_string(),
            events: self.events.clone(),
            idle_interval: self.options.idle_interval,
            stop: self.stop.clone(),
        };
        let permits = self.permits.clone();
        self.handles.push(tokio::spawn(async move {
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return 0,
                },
                _ = task.stop.cancelled() => return 0,
            };
            let path = task.path.clone();
            match task.run().await {
                Ok(lines) => lines,
                Err(e) => {
                    tracing::warn!(node = %path, error = %e, "Log tailing stopped");
                    0
                }
            }
        }));
        true
    }

    /// Signal every tail task to stop at its next check.
    pub fn stop_tail(&self) {
        self.stop.cancel();
    }

    pub fn is_tailing(&self, node_id: &str) -> bool {
        match self.tailing.lock() {
            Ok(guard) => guard.contains(node_id),
            Err(poisoned) => poisoned.into_inner().contains(node_id),
        }
    }

    /// Wait for every tail task and return the total number of lines read.
    pub async fn join(self) -> u64 {
        futures::future::join_all(self.handles)
            .await
            .into_iter()
            .map(|result| match result {
                Ok(lines) => lines,
                Err(e) => {
                    tracing::warn!(error = %e, "Log tail task panicked");
                    0
                }
            })
            .sum()
    }
}

struct TailTask {
    cursor: LogCursor,
    path: String,
    events: EventEmitter,
    idle_interval: Duration,
    stop: CancellationToken,
}

impl TailTask {
    async fn run(mut self) -> Result<u64> {
        let mut total = 0u64;
        while !self.stop.is_cancelled() {
            let count = self.sweep().await?;
            total += count;
            if count > 0 {
                continue;
            }
            if !self.node_running().await? {
                // Lines written between the last sweep and the status check.
                total += self.sweep().await?;
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.idle_interval) => {}
                _ = self.stop.cancelled() => break,
            }
        }
        Ok(total)
    }

    /// Read every line past the cursor, returning how many were read.
    async fn sweep(&mut self) -> Result<u64> {
        let node_id = self.cursor.node_id.clone();
        let mut count = 0u64;
        let mut lines = Box::pin(log_stream(&mut self.cursor));
        while let Some(line) = lines.try_next().await? {
            tracing::info!(target: "pai::run_log", node = %self.path, "{line}");
            self.events.emit(RunEvent::NodeLog {
                path: self.path.clone(),
                node_id: node_id.clone(),
                line,
            });
            count += 1;
        }
        Ok(count)
    }

    async fn node_running(&self) -> Result<bool> {
        let node = self
            .cursor
            .api
            .get_node(&self.cursor.run_id, &self.cursor.node_id, 1)
            .await?;
        Ok(node.is_some_and(|n| n.status_info.status.is_running()))
    }
}
