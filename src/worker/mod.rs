//! The worker boundary.
//!
//! A worker is the opaque "brain" of an agent: a reasoning graph, a tool
//! loop, or a fixed-rule engine. The runtime never looks inside it; it
//! only consumes the typed item stream defined here and persists the
//! opaque state blobs the worker hands out.

#[cfg(feature = "server")]
mod adapter;

#[cfg(feature = "server")]
pub use adapter::WorkerHost;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{Result, WorkerError};
use crate::types::{Message, Part};

/// A single unit of worker output.
#[derive(Debug, Clone)]
pub enum WorkerItem {
    /// Intermediate reasoning the caller may want to see.
    Thinking(String),
    /// The worker is invoking a tool.
    ToolInvocation {
        /// Tool name.
        name: String,
        /// Tool input.
        input: serde_json::Value,
    },
    /// A tool returned.
    ToolResult {
        /// Tool name.
        name: String,
        /// Tool output.
        output: serde_json::Value,
    },
    /// A chunk of an artifact under construction.
    PartialArtifact {
        /// Identifier stable across all chunks of this artifact.
        artifact_id: String,
        /// The chunk's content.
        part: Part,
        /// True on the artifact's last chunk.
        is_last: bool,
    },
    /// The worker needs more input from the caller to proceed.
    NeedsInput {
        /// What to ask the caller.
        prompt: String,
    },
    /// The worker needs the caller to authenticate.
    NeedsAuth {
        /// The authentication scheme required.
        scheme: String,
    },
    /// The worker finished; these parts are its answer.
    Final(Vec<Part>),
    /// The worker failed.
    Error(WorkerError),
}

/// The stream of items a worker produces for one turn.
pub type WorkerStream = BoxStream<'static, WorkerItem>;

/// The capability set every pluggable worker implements.
///
/// A worker never creates tasks and never touches the store; it only
/// emits items against the task it was started for. At most one worker
/// turn runs per task at a time.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Starts work on a task. `resumed_state` carries the blob from a
    /// previous [`snapshot`](Worker::snapshot) when the node is
    /// rehydrating after a restart.
    async fn start(
        &self,
        task_id: &str,
        message: &Message,
        resumed_state: Option<Vec<u8>>,
    ) -> Result<WorkerStream>;

    /// Continues a task paused in input-required or auth-required with
    /// the caller's follow-up message.
    async fn resume(&self, task_id: &str, message: &Message) -> Result<WorkerStream>;

    /// Requests cooperative cancellation; the current stream should end
    /// promptly afterwards.
    async fn cancel(&self, task_id: &str);

    /// Captures the worker's conversational state for checkpointing.
    /// `None` means the worker is stateless for this task.
    async fn snapshot(&self, task_id: &str) -> Option<Vec<u8>>;
}
