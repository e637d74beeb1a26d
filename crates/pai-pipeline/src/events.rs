//! Run event system for observability.
//!
//! Emits [`RunEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (the CLI, loggers, progress displays) can follow a run being
//! waited on without coupling to the polling loop.

use futures::Stream;
use pai_types::RunStatus;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Events emitted while waiting on a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunEvent {
    /// A node was seen for the first time. `path` is the dotted position in
    /// the workflow tree, e.g. `my-run.train`.
    NodeDiscovered {
        path: String,
        node_id: String,
        status: RunStatus,
    },
    NodeStatusChanged {
        path: String,
        from: RunStatus,
        to: RunStatus,
    },
    NodeLog {
        path: String,
        node_id: String,
        line: String,
    },
    RunSucceeded {
        run_id: String,
    },
    RunFailed {
        run_id: String,
        error: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream. Events missed by a lagging subscriber are
    /// skipped.
    pub fn stream(&self) -> impl Stream<Item = RunEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|event| event.ok())
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(1024)
    }
}
