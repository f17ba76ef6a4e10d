//! JSON-RPC 2.0 envelope and parameter types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{Message, TaskState};
use crate::error::JsonRpcError;

/// The JSON-RPC protocol version.
pub const JSONRPC_VERSION: &str = "2.0";

/// A unique identifier for a JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String identifier.
    String(String),
    /// Numeric identifier.
    Number(i64),
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        RequestId::String(uuid::Uuid::new_v4().to_string())
    }
}

/// A JSON-RPC 2.0 request object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest<P> {
    /// The protocol version (always "2.0").
    pub jsonrpc: String,
    /// A unique identifier for this request.
    pub id: RequestId,
    /// The method name to invoke.
    pub method: String,
    /// The parameters for the method invocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<P>,
}

impl<P> JsonRpcRequest<P> {
    /// Creates a new request with an auto-generated ID.
    pub fn new(method: impl Into<String>, params: P) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: RequestId::default(),
            method: method.into(),
            params: Some(params),
        }
    }

    /// Returns true if the envelope declares the supported version.
    #[must_use]
    pub fn is_supported_version(&self) -> bool {
        self.jsonrpc == JSONRPC_VERSION
    }
}

/// A successful JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcSuccessResponse<R> {
    /// The protocol version (always "2.0").
    pub jsonrpc: String,
    /// The identifier established by the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// The result of the method invocation.
    pub result: R,
}

impl<R> JsonRpcSuccessResponse<R> {
    /// Creates a new successful response.
    pub fn new(id: Option<RequestId>, result: R) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }
    }
}

/// A JSON-RPC 2.0 error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    /// The protocol version (always "2.0").
    pub jsonrpc: String,
    /// The identifier established by the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// The error object.
    pub error: JsonRpcError,
}

impl JsonRpcErrorResponse {
    /// Creates a new error response.
    #[must_use]
    pub fn new(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error,
        }
    }
}

/// Either side of a JSON-RPC response, as decoded by clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcResponse<R> {
    /// A successful response carrying a result.
    Success(JsonRpcSuccessResponse<R>),
    /// An error response.
    Error(JsonRpcErrorResponse),
}

/// Parameters for `message/send` and `message/stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageParams {
    /// The message being sent to the agent.
    pub message: Message,
    /// Optional per-call configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<SendConfiguration>,
    /// Optional metadata mapping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl SendMessageParams {
    /// Creates send parameters for a message.
    #[must_use]
    pub fn new(message: Message) -> Self {
        Self {
            message,
            configuration: None,
            metadata: None,
        }
    }

    /// Sets the per-call configuration.
    #[must_use]
    pub fn with_configuration(mut self, configuration: SendConfiguration) -> Self {
        self.configuration = Some(configuration);
        self
    }
}

/// Per-call options for `message/send`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendConfiguration {
    /// When true, the call blocks until the task is terminal.
    ///
    /// Honored only when the card advertises `synchronousCompletion`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking: Option<bool>,
    /// Limits the history returned in the response to the last N messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_length: Option<usize>,
    /// Push notification configuration to register with the task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_notification_config: Option<PushConfig>,
}

/// Parameters for `tasks/get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueryParams {
    /// The task to fetch.
    pub id: String,
    /// Limits the returned history to the last N messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_length: Option<usize>,
}

impl TaskQueryParams {
    /// Creates query parameters for a task.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            history_length: None,
        }
    }
}

/// Parameters identifying a single task (`tasks/cancel`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIdParams {
    /// The task identifier.
    pub id: String,
}

impl TaskIdParams {
    /// Creates task ID parameters.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Parameters for `tasks/resubscribe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResubscribeParams {
    /// The task whose stream to rejoin.
    pub id: String,
    /// The last event sequence number observed; events after it are
    /// replayed when still retained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<u64>,
}

impl ResubscribeParams {
    /// Creates resubscribe parameters.
    pub fn new(id: impl Into<String>, last_event_id: Option<u64>) -> Self {
        Self {
            id: id.into(),
            last_event_id,
        }
    }
}

/// Filtered, paginated listing parameters for `tasks/list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksParams {
    /// Restrict to tasks in this state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
    /// Restrict to tasks in this context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    /// Maximum number of tasks to return (default 50).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
    /// Opaque continuation token from a previous page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
}

/// One page of task listing results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksResult {
    /// The tasks on this page.
    pub tasks: Vec<super::Task>,
    /// Continuation token; absent on the last page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// A webhook configuration for push notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushConfig {
    /// The callback URL for notifications.
    pub url: String,
    /// A unique identifier for this configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// A token the receiver can use to validate notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl PushConfig {
    /// Creates a push configuration for a callback URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            id: None,
            token: None,
        }
    }
}

/// Associates a push configuration with a task
/// (`tasks/pushNotificationConfig/set`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskPushConfig {
    /// The task the configuration applies to.
    pub task_id: String,
    /// The push configuration.
    pub push_notification_config: PushConfig,
}

/// Parameters for `tasks/pushNotificationConfig/get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPushConfigParams {
    /// The task whose configuration to fetch.
    pub id: String,
    /// The specific configuration; the first one when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_notification_config_id: Option<String>,
}

/// Parameters for `tasks/pushNotificationConfig/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPushConfigParams {
    /// The task whose configurations to list.
    pub id: String,
}

/// Parameters for `tasks/pushNotificationConfig/delete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletePushConfigParams {
    /// The task whose configuration to delete.
    pub id: String,
    /// The configuration to remove.
    pub push_notification_config_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let request = JsonRpcRequest::new(
            "message/send",
            SendMessageParams::new(Message::user_text("hello")),
        );
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"message/send\""));

        let parsed: JsonRpcRequest<SendMessageParams> = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_supported_version());
        assert_eq!(parsed.method, "message/send");
    }

    #[test]
    fn test_response_untagged_decode() {
        let success = r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#;
        let parsed: JsonRpcResponse<serde_json::Value> = serde_json::from_str(success).unwrap();
        assert!(matches!(parsed, JsonRpcResponse::Success(_)));

        let error = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32001,"message":"Task not found"}}"#;
        let parsed: JsonRpcResponse<serde_json::Value> = serde_json::from_str(error).unwrap();
        match parsed {
            JsonRpcResponse::Error(e) => assert_eq!(e.error.code, -32001),
            JsonRpcResponse::Success(_) => panic!("expected error response"),
        }
    }

    #[test]
    fn test_resubscribe_params() {
        let params = ResubscribeParams::new("t-1", Some(17));
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"lastEventId\":17"));
    }

    #[test]
    fn test_request_id_forms() {
        let s: RequestId = "abc".into();
        let n: RequestId = 7i64.into();
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"abc\"");
        assert_eq!(serde_json::to_string(&n).unwrap(), "7");
    }
}
