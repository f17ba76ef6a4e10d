//! Node configuration.
//!
//! All recognized options with their defaults. Loading (files, env) is
//! the embedder's concern; every struct here derives `Deserialize` so a
//! host can feed it from whatever source it likes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for an agent node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Network binding.
    pub server: ServerConfig,
    /// Worker execution limits.
    pub worker: WorkerConfig,
    /// Per-task event queue sizing.
    pub queue: QueueConfig,
    /// Checkpoint backend selection and cadence.
    pub checkpoint: CheckpointConfig,
    /// Known peer agents, for orchestrating nodes.
    pub peers: Vec<PeerConfig>,
    /// Outbound call deadlines.
    pub timeouts: TimeoutConfig,
    /// Authentication requirements.
    pub auth: AuthConfig,
    /// Checkpoint retention windows.
    pub retention: RetentionConfig,
}

/// Network binding options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The host address to bind to.
    pub host: String,
    /// The port to listen on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// Returns the bind address.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Worker execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum tasks running workers concurrently.
    pub max_concurrent_tasks: usize,
    /// Grace period before a canceled worker is force-terminated.
    pub cancel_grace_ms: u64,
    /// Upper bound on a single worker turn; `None` means unbounded.
    pub turn_timeout_ms: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 100,
            cancel_grace_ms: 5_000,
            turn_timeout_ms: None,
        }
    }
}

impl WorkerConfig {
    /// The cancel grace period as a [`Duration`].
    #[must_use]
    pub const fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Event queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Ring capacity per task; also the replay window for resubscribes.
    pub capacity_per_task: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity_per_task: 1024,
        }
    }
}

/// Checkpoint backend selection and write cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Which backend stores checkpoints.
    pub backend: CheckpointBackendKind,
    /// Coalescing interval for snapshot writes driven by message and
    /// artifact events. Transitions always write immediately.
    pub interval_ms: u64,
    /// When true, a failing checkpoint write fails the task.
    pub mandatory: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackendKind::Memory,
            interval_ms: 1_000,
            mandatory: false,
        }
    }
}

impl CheckpointConfig {
    /// The coalescing interval as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Selects the checkpoint backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackendKind {
    /// The built-in in-memory backend.
    #[default]
    Memory,
    /// A backend supplied by the embedder.
    External,
}

/// A peer agent an orchestrating node may delegate to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Display name for logs and step attribution.
    pub name: String,
    /// The peer's base URL.
    pub base_url: String,
    /// Credential presented to the peer, when required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<PeerCredentials>,
    /// Skill tags to assume without fetching the peer's card.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skills_override: Option<Vec<String>>,
}

/// Credential material for calling a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "camelCase")]
pub enum PeerCredentials {
    /// Bearer token in the `Authorization` header.
    Bearer {
        /// The token value.
        token: String,
    },
    /// Static API key in a custom header.
    ApiKey {
        /// The header carrying the key.
        header: String,
        /// The key value.
        key: String,
    },
}

/// Outbound call deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// TCP connect deadline for peer calls.
    pub peer_connect_ms: u64,
    /// Total deadline for unary peer calls.
    pub peer_total_ms: u64,
    /// Idle deadline on a peer SSE stream; keepalives reset it.
    pub stream_idle_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            peer_connect_ms: 3_000,
            peer_total_ms: 30_000,
            stream_idle_ms: 60_000,
        }
    }
}

impl TimeoutConfig {
    /// The connect deadline as a [`Duration`].
    #[must_use]
    pub const fn peer_connect(&self) -> Duration {
        Duration::from_millis(self.peer_connect_ms)
    }

    /// The total call deadline as a [`Duration`].
    #[must_use]
    pub const fn peer_total(&self) -> Duration {
        Duration::from_millis(self.peer_total_ms)
    }

    /// The stream idle deadline as a [`Duration`].
    #[must_use]
    pub const fn stream_idle(&self) -> Duration {
        Duration::from_millis(self.stream_idle_ms)
    }
}

/// Authentication requirements for inbound requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer tokens accepted on non-public endpoints. Empty disables
    /// authentication entirely.
    pub bearer_tokens: Vec<String>,
}

impl AuthConfig {
    /// Returns true when inbound requests must authenticate.
    #[must_use]
    pub fn required(&self) -> bool {
        !self.bearer_tokens.is_empty()
    }

    /// Checks a presented bearer token.
    #[must_use]
    pub fn accepts(&self, token: &str) -> bool {
        self.bearer_tokens.iter().any(|t| t == token)
    }
}

/// Checkpoint retention windows per final disposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Days to keep checkpoints of active tasks.
    pub active_days: u32,
    /// Days to keep checkpoints of completed tasks.
    pub completed_days: u32,
    /// Days to keep checkpoints of failed tasks.
    pub failed_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            active_days: 7,
            completed_days: 30,
            failed_days: 3,
        }
    }
}

impl RetentionConfig {
    /// TTL applied to a checkpoint for a task in the given state.
    #[must_use]
    pub fn ttl_for(&self, state: crate::types::TaskState) -> Duration {
        use crate::types::TaskState;
        let days = match state {
            TaskState::Completed | TaskState::Canceled | TaskState::Rejected => {
                self.completed_days
            }
            TaskState::Failed => self.failed_days,
            _ => self.active_days,
        };
        Duration::from_secs(u64::from(days) * 24 * 60 * 60)
    }
}
