//! Error types for the coordination runtime.
//!
//! The taxonomy distinguishes client-caused protocol errors (reported as
//! JSON-RPC errors and never affecting task state), worker-caused errors
//! (which fail the task), peer-caused errors (handled by the orchestrator's
//! retry policy), and infrastructure errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// The main error type for the coordination runtime.
#[derive(Error, Debug)]
pub enum CoreError {
    /// JSON-RPC protocol errors (client-caused).
    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    /// HTTP transport errors.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing errors.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A worker failed; the owning task transitions to `failed`.
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// A call to a peer agent failed.
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    /// The checkpoint backend refused a read or write.
    ///
    /// Logged but non-fatal for live tasks unless durability is mandatory
    /// by configuration.
    #[error("Checkpoint unavailable: {0}")]
    CheckpointUnavailable(String),

    /// A subscriber fell behind the bounded event queue and was dropped.
    #[error("Stream lagged by {missed} events")]
    StreamLagged {
        /// Number of events the subscriber missed.
        missed: u64,
    },

    /// The event queue was closed (final event already published).
    #[error("Event queue closed")]
    QueueClosed,

    /// An internal invariant was violated and recovery is impossible.
    ///
    /// Callers of the affected task observe state `unknown`; further
    /// writes to it are refused.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Internal errors that fit no other category.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Converts this error into the JSON-RPC error reported to callers.
    ///
    /// Worker and infrastructure details are reduced to a human-readable
    /// message; stack traces and credentials never cross this boundary.
    #[must_use]
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        match self {
            Self::JsonRpc(e) => e.clone(),
            Self::Json(e) => JsonRpcError::new(RpcErrorCode::ParseError, e.to_string()),
            Self::Worker(e) => JsonRpcError::new(
                RpcErrorCode::InternalError,
                format!("worker failed: {}", e.kind),
            ),
            Self::Invariant(_) => JsonRpcError::new(
                RpcErrorCode::InternalError,
                "internal invariant violation".to_string(),
            ),
            other => JsonRpcError::new(RpcErrorCode::InternalError, other.to_string()),
        }
    }

    /// Returns true if this is a timeout of some kind.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout(),
            Self::Peer(p) => p.kind == PeerErrorKind::Timeout,
            Self::Worker(w) => w.kind == WorkerErrorKind::Timeout,
            _ => false,
        }
    }

    /// Extracts the JSON-RPC error code if this is a protocol error.
    #[must_use]
    pub fn jsonrpc_code(&self) -> Option<i32> {
        match self {
            Self::JsonRpc(e) => Some(e.code),
            Self::Peer(p) => p.rpc_code,
            _ => None,
        }
    }
}

/// JSON-RPC 2.0 error codes, including the protocol-specific range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum RpcErrorCode {
    /// Invalid JSON was received by the server.
    ParseError = -32700,
    /// The JSON sent is not a valid Request object.
    InvalidRequest = -32600,
    /// The method does not exist.
    MethodNotFound = -32601,
    /// Invalid method parameter(s).
    InvalidParams = -32602,
    /// Internal JSON-RPC error.
    InternalError = -32603,

    // Protocol-specific codes (-32000..-32099).
    /// The referenced task does not exist on this node.
    TaskNotFound = -32001,
    /// The referenced task is already terminal.
    TaskNotCancelable = -32002,
    /// The caller must authenticate.
    AuthenticationRequired = -32003,
    /// The request violates a protocol invariant (e.g. illegal transition).
    ProtocolViolation = -32004,
    /// The node does not support the requested capability.
    UnsupportedCapability = -32005,
}

impl RpcErrorCode {
    /// Returns the default message for this error code.
    #[must_use]
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::ParseError => "Invalid JSON payload",
            Self::InvalidRequest => "Request payload validation error",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid parameters",
            Self::InternalError => "Internal error",
            Self::TaskNotFound => "Task not found",
            Self::TaskNotCancelable => "Task cannot be canceled",
            Self::AuthenticationRequired => "Authentication required",
            Self::ProtocolViolation => "Protocol violation",
            Self::UnsupportedCapability => "Capability not supported",
        }
    }
}

impl From<i32> for RpcErrorCode {
    fn from(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32001 => Self::TaskNotFound,
            -32002 => Self::TaskNotCancelable,
            -32003 => Self::AuthenticationRequired,
            -32004 => Self::ProtocolViolation,
            -32005 => Self::UnsupportedCapability,
            _ => Self::InternalError,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
pub struct JsonRpcError {
    /// A number indicating the error type.
    pub code: i32,
    /// A short description of the error.
    pub message: String,
    /// Additional information about the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl JsonRpcError {
    /// Creates a new JSON-RPC error.
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code as i32,
            message: message.into(),
            data: None,
        }
    }

    /// Creates a new JSON-RPC error with additional data.
    pub fn with_data(
        code: RpcErrorCode,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            code: code as i32,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Creates a parse error.
    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(
            RpcErrorCode::ParseError,
            RpcErrorCode::ParseError.default_message(),
        )
    }

    /// Creates an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidRequest, message)
    }

    /// Creates a method not found error.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            RpcErrorCode::MethodNotFound,
            format!("Method '{method}' not found"),
        )
    }

    /// Creates an invalid params error.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidParams, message)
    }

    /// Creates an internal error.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InternalError, message)
    }

    /// Creates a task not found error.
    #[must_use]
    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(
            RpcErrorCode::TaskNotFound,
            format!("Task '{task_id}' not found"),
        )
    }

    /// Creates a task not cancelable error.
    #[must_use]
    pub fn task_not_cancelable(task_id: &str) -> Self {
        Self::new(
            RpcErrorCode::TaskNotCancelable,
            format!("Task '{task_id}' cannot be canceled"),
        )
    }

    /// Creates an authentication required error.
    #[must_use]
    pub fn authentication_required() -> Self {
        Self::new(
            RpcErrorCode::AuthenticationRequired,
            RpcErrorCode::AuthenticationRequired.default_message(),
        )
    }

    /// Creates a protocol violation error.
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::ProtocolViolation, message)
    }

    /// Creates an unsupported capability error.
    #[must_use]
    pub fn unsupported_capability(capability: &str) -> Self {
        Self::new(
            RpcErrorCode::UnsupportedCapability,
            format!("Capability '{capability}' is not supported"),
        )
    }

    /// Returns the error code as an enum variant.
    #[must_use]
    pub fn error_code(&self) -> RpcErrorCode {
        RpcErrorCode::from(self.code)
    }
}

/// Classifies a failure inside a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorKind {
    /// A tool invoked by the worker failed.
    ToolFailed,
    /// The worker could not produce a plan for the request.
    PlanningFailed,
    /// An unclassified internal worker failure.
    Internal,
    /// The worker exceeded its turn deadline.
    Timeout,
}

impl fmt::Display for WorkerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ToolFailed => "tool_failed",
            Self::PlanningFailed => "planning_failed",
            Self::Internal => "internal",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// An error raised by a worker; fails the owning task.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {detail}")]
pub struct WorkerError {
    /// The failure class.
    pub kind: WorkerErrorKind,
    /// Human-readable detail, safe to show to callers.
    pub detail: String,
}

impl WorkerError {
    /// Creates a new worker error.
    pub fn new(kind: WorkerErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Convenience constructor for internal failures.
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Internal, detail)
    }

    /// Convenience constructor for turn timeouts.
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Timeout, detail)
    }
}

/// Classifies a failure when calling a peer agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerErrorKind {
    /// The peer could not be reached at all.
    Unreachable,
    /// The call exceeded its deadline.
    Timeout,
    /// The peer rejected our credentials.
    Auth,
    /// The peer's response violated the protocol.
    Protocol,
    /// The peer does not know the referenced task.
    NotFound,
    /// The peer accepted the task and then failed it.
    RemoteFailed,
}

impl fmt::Display for PeerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unreachable => "unreachable",
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::Protocol => "protocol",
            Self::NotFound => "not_found",
            Self::RemoteFailed => "remote_failed",
        };
        f.write_str(s)
    }
}

/// An error surfaced by the peer client.
#[derive(Debug, Clone, Error)]
pub struct PeerError {
    /// The failure class.
    pub kind: PeerErrorKind,
    /// HTTP status, when the peer answered at the transport level.
    pub http_status: Option<u16>,
    /// JSON-RPC error code, when the peer answered at the protocol level.
    pub rpc_code: Option<i32>,
    /// Human-readable detail.
    pub detail: String,
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)?;
        if let Some(status) = self.http_status {
            write!(f, " (HTTP {status})")?;
        }
        if let Some(code) = self.rpc_code {
            write!(f, " (rpc {code})")?;
        }
        Ok(())
    }
}

impl PeerError {
    /// Creates a new peer error.
    pub fn new(kind: PeerErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            http_status: None,
            rpc_code: None,
            detail: detail.into(),
        }
    }

    /// Attaches the HTTP status observed on the failing call.
    #[must_use]
    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// Attaches the JSON-RPC error code returned by the peer.
    #[must_use]
    pub fn with_rpc_code(mut self, code: i32) -> Self {
        self.rpc_code = Some(code);
        self
    }

    /// Returns true if the step retry policy treats this as retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            PeerErrorKind::Unreachable | PeerErrorKind::Timeout
        )
    }

    /// Classifies a transport error from the HTTP client.
    #[must_use]
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            PeerErrorKind::Timeout
        } else if err.is_connect() {
            PeerErrorKind::Unreachable
        } else {
            PeerErrorKind::Protocol
        };
        let mut peer = Self::new(kind, err.to_string());
        if let Some(status) = err.status() {
            peer.http_status = Some(status.as_u16());
        }
        peer
    }

    /// Classifies a JSON-RPC error returned by the peer.
    #[must_use]
    pub fn from_rpc(err: &JsonRpcError) -> Self {
        let kind = match err.error_code() {
            RpcErrorCode::TaskNotFound => PeerErrorKind::NotFound,
            RpcErrorCode::AuthenticationRequired => PeerErrorKind::Auth,
            RpcErrorCode::InternalError => PeerErrorKind::RemoteFailed,
            _ => PeerErrorKind::Protocol,
        };
        Self::new(kind, err.message.clone()).with_rpc_code(err.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(RpcErrorCode::from(-32700), RpcErrorCode::ParseError);
        assert_eq!(RpcErrorCode::from(-32001), RpcErrorCode::TaskNotFound);
        assert_eq!(RpcErrorCode::from(-32004), RpcErrorCode::ProtocolViolation);
        assert_eq!(RpcErrorCode::from(-1), RpcErrorCode::InternalError);
    }

    #[test]
    fn test_json_rpc_error_serialization() {
        let error = JsonRpcError::task_not_found("task-123");
        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("-32001"));
        assert!(json.contains("task-123"));
    }

    #[test]
    fn test_worker_error_reports_kind_only() {
        let err = CoreError::from(WorkerError::new(
            WorkerErrorKind::ToolFailed,
            "connection refused to rates.example.com",
        ));
        let rpc = err.to_jsonrpc_error();
        // The detail stays out of the caller-visible message.
        assert!(rpc.message.contains("tool_failed"));
        assert!(!rpc.message.contains("rates.example.com"));
    }

    #[test]
    fn test_peer_error_retryable() {
        assert!(PeerError::new(PeerErrorKind::Timeout, "t").is_retryable());
        assert!(PeerError::new(PeerErrorKind::Unreachable, "u").is_retryable());
        assert!(!PeerError::new(PeerErrorKind::RemoteFailed, "r").is_retryable());
    }

    #[test]
    fn test_peer_error_from_rpc() {
        let rpc = JsonRpcError::task_not_found("t-1");
        let peer = PeerError::from_rpc(&rpc);
        assert_eq!(peer.kind, PeerErrorKind::NotFound);
        assert_eq!(peer.rpc_code, Some(-32001));
    }

    #[test]
    fn test_invariant_violation_is_opaque() {
        let err = CoreError::Invariant("status map out of sync".into());
        let rpc = err.to_jsonrpc_error();
        assert_eq!(rpc.code, RpcErrorCode::InternalError as i32);
        assert!(!rpc.message.contains("status map"));
    }
}
