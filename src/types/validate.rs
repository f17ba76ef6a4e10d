//! Structural and semantic validation of inbound payloads.
//!
//! These are pure functions: they inspect a decoded value and report the
//! first violation found. Checks that need store access (unknown or
//! terminal `task_id`) live in the dispatcher, which owns the store.

use super::{JsonRpcRequest, Message, Part, Role, JSONRPC_VERSION};
use crate::error::JsonRpcError;

/// JSON-RPC methods recognized by the dispatcher.
pub const RECOGNIZED_METHODS: &[&str] = &[
    "message/send",
    "message/stream",
    "tasks/get",
    "tasks/cancel",
    "tasks/list",
    "tasks/resubscribe",
    "tasks/pushNotificationConfig/set",
    "tasks/pushNotificationConfig/get",
    "tasks/pushNotificationConfig/list",
    "tasks/pushNotificationConfig/delete",
];

/// Methods that respond with an SSE stream instead of a JSON body.
pub const STREAMING_METHODS: &[&str] = &["message/stream", "tasks/resubscribe"];

/// Validates an inbound message from a caller.
///
/// Rejects empty part lists, non-user roles, missing message IDs, and
/// malformed file parts. Unknown part variants and conflicting file
/// sources are already rejected during JSON decoding.
pub fn validate_incoming_message(message: &Message) -> Result<(), JsonRpcError> {
    if message.message_id.is_empty() {
        return Err(JsonRpcError::invalid_params("message ID is required"));
    }
    if message.parts.is_empty() {
        return Err(JsonRpcError::invalid_params(
            "message must contain at least one part",
        ));
    }
    if message.role != Role::User {
        return Err(JsonRpcError::invalid_params(
            "inbound messages must carry role 'user'",
        ));
    }
    for part in &message.parts {
        validate_part(part)?;
    }
    Ok(())
}

/// Validates a single content part.
pub fn validate_part(part: &Part) -> Result<(), JsonRpcError> {
    match part {
        Part::Text(_) | Part::Data(_) => Ok(()),
        Part::File(file) => {
            if !file.has_valid_mime_type() {
                return Err(JsonRpcError::invalid_params(format!(
                    "invalid mime type '{}'",
                    file.mime_type.as_deref().unwrap_or_default()
                )));
            }
            Ok(())
        }
    }
}

/// Validates a decoded JSON-RPC envelope.
///
/// Verifies the protocol version, that the method is recognized, and
/// that params are present where the method requires them.
pub fn validate_rpc_envelope(
    request: &JsonRpcRequest<serde_json::Value>,
) -> Result<(), JsonRpcError> {
    if request.jsonrpc != JSONRPC_VERSION {
        return Err(JsonRpcError::invalid_request(format!(
            "unsupported jsonrpc version '{}'",
            request.jsonrpc
        )));
    }
    if !RECOGNIZED_METHODS.contains(&request.method.as_str()) {
        return Err(JsonRpcError::method_not_found(&request.method));
    }
    // tasks/list may omit params; everything else requires them.
    if request.params.is_none() && request.method != "tasks/list" {
        return Err(JsonRpcError::invalid_params("missing params"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcErrorCode;

    #[test]
    fn test_empty_parts_rejected() {
        let message = Message::user(vec![]);
        let err = validate_incoming_message(&message).unwrap_err();
        assert_eq!(err.error_code(), RpcErrorCode::InvalidParams);
    }

    #[test]
    fn test_agent_role_rejected_inbound() {
        let message = Message::agent_text("not allowed");
        assert!(validate_incoming_message(&message).is_err());
    }

    #[test]
    fn test_valid_message_accepted() {
        let message = Message::user_text("USD to EUR");
        assert!(validate_incoming_message(&message).is_ok());
    }

    #[test]
    fn test_bad_mime_type_rejected() {
        let message = Message::user(vec![Part::file_uri(
            "data.bin",
            "nonsense",
            "https://example.com/data.bin",
        )]);
        assert!(validate_incoming_message(&message).is_err());
    }

    #[test]
    fn test_file_with_both_sources_fails_decode() {
        let json = r#"{"kind":"file","name":"x","mimeType":"text/plain",
            "bytes":"AA==","uri":"https://example.com/x"}"#;
        assert!(serde_json::from_str::<Part>(json).is_err());
    }

    #[test]
    fn test_file_with_no_source_fails_decode() {
        let json = r#"{"kind":"file","name":"x","mimeType":"text/plain"}"#;
        assert!(serde_json::from_str::<Part>(json).is_err());
    }

    #[test]
    fn test_envelope_unknown_method() {
        let request: JsonRpcRequest<serde_json::Value> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"tasks/destroy"}"#).unwrap();
        let err = validate_rpc_envelope(&request).unwrap_err();
        assert_eq!(err.error_code(), RpcErrorCode::MethodNotFound);
    }

    #[test]
    fn test_envelope_wrong_version() {
        let request: JsonRpcRequest<serde_json::Value> =
            serde_json::from_str(r#"{"jsonrpc":"1.0","id":1,"method":"tasks/get","params":{}}"#)
                .unwrap();
        let err = validate_rpc_envelope(&request).unwrap_err();
        assert_eq!(err.error_code(), RpcErrorCode::InvalidRequest);
    }

    #[test]
    fn test_envelope_missing_params() {
        let request: JsonRpcRequest<serde_json::Value> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"tasks/get"}"#).unwrap();
        let err = validate_rpc_envelope(&request).unwrap_err();
        assert_eq!(err.error_code(), RpcErrorCode::InvalidParams);
    }

    #[test]
    fn test_list_without_params_allowed() {
        let request: JsonRpcRequest<serde_json::Value> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"tasks/list"}"#).unwrap();
        assert!(validate_rpc_envelope(&request).is_ok());
    }
}
