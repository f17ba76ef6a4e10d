//! Message types.
//!
//! Messages are the conversational units exchanged between callers and
//! agents; they appear in task histories and on event streams.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::Part;

/// Identifies the sender of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message from the user/caller.
    #[default]
    User,
    /// Message from the agent.
    Agent,
}

/// A single message in the conversation between a caller and an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// A unique identifier for the message.
    pub message_id: String,
    /// Identifies the sender of the message.
    pub role: Role,
    /// The ordered, non-empty content parts forming the message body.
    pub parts: Vec<Part>,
    /// The type discriminator (always "message" on the wire).
    #[serde(default = "default_message_kind")]
    pub kind: String,
    /// The ID of the task this message is part of.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// The context grouping this message belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    /// Prior task IDs in the same context that this message references.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_task_ids: Option<Vec<String>>,
    /// Optional metadata mapping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

fn default_message_kind() -> String {
    "message".to_string()
}

impl Message {
    /// Creates a new message with the given ID, role, and parts.
    pub fn new(message_id: impl Into<String>, role: Role, parts: Vec<Part>) -> Self {
        Self {
            message_id: message_id.into(),
            role,
            parts,
            kind: default_message_kind(),
            task_id: None,
            context_id: None,
            reference_task_ids: None,
            metadata: None,
        }
    }

    /// Creates a new user message with an auto-generated ID.
    #[must_use]
    pub fn user(parts: Vec<Part>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), Role::User, parts)
    }

    /// Creates a new agent message with an auto-generated ID.
    #[must_use]
    pub fn agent(parts: Vec<Part>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), Role::Agent, parts)
    }

    /// Creates a simple text message from the user.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![Part::text(text)])
    }

    /// Creates a simple text message from the agent.
    pub fn agent_text(text: impl Into<String>) -> Self {
        Self::agent(vec![Part::text(text)])
    }

    /// Sets the task ID for this message.
    #[must_use]
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Sets the context ID for this message.
    #[must_use]
    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Sets the referenced prior task IDs.
    #[must_use]
    pub fn with_reference_task_ids(mut self, ids: Vec<String>) -> Self {
        self.reference_task_ids = Some(ids);
        self
    }

    /// Sets the metadata for this message.
    #[must_use]
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Returns true if this message is from a user.
    #[must_use]
    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    /// Returns the concatenated text of all text parts, if any exist.
    #[must_use]
    pub fn text_content(&self) -> Option<String> {
        let texts: Vec<&str> = self.parts.iter().filter_map(Part::as_text).collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        }
    }
}
