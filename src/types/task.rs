//! Task types and the task state machine.
//!
//! A task is the unit of work: it owns a status, an append-only message
//! history, and a set of artifacts that may be streamed in chunks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use super::{Message, Part};

/// Helper for serde: skip serializing boolean fields when false.
#[must_use]
pub fn is_false(v: &bool) -> bool {
    !*v
}

/// Lifecycle states of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    /// Task has been accepted but not yet started.
    #[default]
    Submitted,
    /// Task is currently being processed by a worker.
    Working,
    /// Task is paused awaiting additional input from the caller.
    InputRequired,
    /// Task is paused awaiting caller authentication.
    AuthRequired,
    /// Task completed successfully.
    Completed,
    /// Task failed.
    Failed,
    /// Task was canceled by the caller.
    Canceled,
    /// Task was rejected before any work started.
    Rejected,
    /// Reported only when internal invariants are violated beyond recovery.
    Unknown,
}

impl TaskState {
    /// Returns true if this state indicates the task is still active.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::Working | Self::InputRequired | Self::AuthRequired
        )
    }

    /// Returns true if this state is terminal.
    ///
    /// Terminal states are permanent; no further mutation is allowed
    /// beyond the final status-update event.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Canceled | Self::Failed | Self::Rejected
        )
    }

    /// Returns true if the state machine permits moving to `next`.
    ///
    /// Self-transitions are not edges; the task manager treats them as
    /// protocol violations like any other missing edge.
    #[must_use]
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::{
            AuthRequired, Canceled, Completed, Failed, InputRequired, Rejected, Submitted, Working,
        };
        match self {
            Submitted => matches!(next, Working | Canceled | Rejected | Failed),
            Working => matches!(
                next,
                InputRequired | AuthRequired | Completed | Failed | Canceled
            ),
            InputRequired | AuthRequired => matches!(next, Working | Canceled | Failed),
            _ => false,
        }
    }
}

/// The status of a task at a specific point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatus {
    /// The current lifecycle state.
    pub state: TaskState,
    /// An optional message providing detail about this status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    /// When this status was recorded.
    pub timestamp: DateTime<Utc>,
}

impl TaskStatus {
    /// Creates a new task status with the given state.
    #[must_use]
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            message: None,
            timestamp: Utc::now(),
        }
    }

    /// Creates a new task status with a detail message.
    #[must_use]
    pub fn with_message(state: TaskState, message: Message) -> Self {
        Self {
            state,
            message: Some(message),
            timestamp: Utc::now(),
        }
    }

    /// Creates a submitted status.
    #[must_use]
    pub fn submitted() -> Self {
        Self::new(TaskState::Submitted)
    }

    /// Creates a working status.
    #[must_use]
    pub fn working() -> Self {
        Self::new(TaskState::Working)
    }

    /// Creates a completed status.
    #[must_use]
    pub fn completed() -> Self {
        Self::new(TaskState::Completed)
    }

    /// Creates a failed status with a human-readable cause.
    pub fn failed(cause: impl Into<String>) -> Self {
        Self::with_message(TaskState::Failed, Message::agent(vec![Part::text(cause)]))
    }

    /// Creates an input-required status with the worker's prompt.
    pub fn input_required(prompt: impl Into<String>) -> Self {
        Self::with_message(
            TaskState::InputRequired,
            Message::agent(vec![Part::text(prompt)]),
        )
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::submitted()
    }
}

/// A single stateful unit of work owned by an agent node.
///
/// The `kind` field is injected as `"task"` during serialization; it is
/// accepted and ignored on input.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier.
    pub id: String,
    /// Groups related tasks; immutable once assigned.
    pub context_id: String,
    /// The current status of the task.
    pub status: TaskStatus,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task was last mutated.
    pub updated_at: DateTime<Utc>,
    /// Every message ever appended, in append order.
    #[serde(default)]
    pub history: Vec<Message>,
    /// Artifacts produced so far, chunk-merged by artifact id.
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Optional metadata mapping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,

    /// Ignored during deserialization; injected as `"task"` on output.
    #[serde(default, skip_serializing)]
    #[allow(dead_code)]
    kind: Option<String>,
}

impl Serialize for Task {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct TaskWithKind<'a> {
            kind: &'static str,
            id: &'a str,
            context_id: &'a str,
            status: &'a TaskStatus,
            created_at: &'a DateTime<Utc>,
            updated_at: &'a DateTime<Utc>,
            history: &'a [Message],
            artifacts: &'a [Artifact],
            #[serde(skip_serializing_if = "Option::is_none")]
            metadata: &'a Option<HashMap<String, serde_json::Value>>,
        }
        TaskWithKind {
            kind: "task",
            id: &self.id,
            context_id: &self.context_id,
            status: &self.status,
            created_at: &self.created_at,
            updated_at: &self.updated_at,
            history: &self.history,
            artifacts: &self.artifacts,
            metadata: &self.metadata,
        }
        .serialize(serializer)
    }
}

impl Task {
    /// Creates a new submitted task with the given IDs.
    pub fn new(id: impl Into<String>, context_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            context_id: context_id.into(),
            status: TaskStatus::submitted(),
            created_at: now,
            updated_at: now,
            history: Vec::new(),
            artifacts: Vec::new(),
            metadata: None,
            kind: None,
        }
    }

    /// Creates a new task with auto-generated IDs.
    #[must_use]
    pub fn create() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            uuid::Uuid::new_v4().to_string(),
        )
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> TaskState {
        self.status.state
    }

    /// Returns true if the task is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.state.is_terminal()
    }

    /// Returns true if the task is paused waiting for caller input.
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        matches!(
            self.status.state,
            TaskState::InputRequired | TaskState::AuthRequired
        )
    }

    /// Appends a message to the history.
    pub fn push_message(&mut self, message: Message) {
        self.history.push(message);
        self.updated_at = Utc::now();
    }

    /// Replaces the status, stamping `updated_at`.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Returns the last user message in the history.
    #[must_use]
    pub fn last_user_message(&self) -> Option<&Message> {
        self.history.iter().rev().find(|m| m.is_user())
    }

    /// Finds an artifact by its ID.
    #[must_use]
    pub fn artifact_by_id(&self, artifact_id: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.artifact_id == artifact_id)
    }

    /// Merges an artifact update event into the task's artifact set.
    ///
    /// When `append` is set, parts extend the existing artifact with the
    /// same id; otherwise the artifact is inserted or replaced.
    pub fn apply_artifact_update(&mut self, event: &TaskArtifactUpdateEvent) {
        let artifact_id = &event.artifact.artifact_id;
        let existing = self
            .artifacts
            .iter()
            .position(|a| &a.artifact_id == artifact_id);

        if event.append {
            if let Some(idx) = existing {
                self.artifacts[idx]
                    .parts
                    .extend(event.artifact.parts.iter().cloned());
            } else {
                // Append to an unknown artifact starts it.
                self.artifacts.push(event.artifact.clone());
            }
        } else if let Some(idx) = existing {
            self.artifacts[idx] = event.artifact.clone();
        } else {
            self.artifacts.push(event.artifact.clone());
        }
        self.updated_at = Utc::now();
    }

    /// Keeps only the last `n` history messages, when a limit is given.
    pub fn truncate_history(&mut self, len: Option<usize>) {
        if let Some(max) = len {
            if self.history.len() > max {
                let start = self.history.len() - max;
                self.history = self.history.split_off(start);
            }
        }
    }

    /// Builds a status-update event from the current status.
    #[must_use]
    pub fn status_update_event(&self, is_final: bool) -> TaskStatusUpdateEvent {
        TaskStatusUpdateEvent::new(&self.id, &self.context_id, self.status.clone(), is_final)
    }
}

/// A resource generated by a task, possibly delivered in chunks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Identifier stable across all chunks of this artifact.
    pub artifact_id: String,
    /// The ordered content parts accumulated so far.
    pub parts: Vec<Part>,
    /// An optional name for the artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional metadata mapping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl Artifact {
    /// Creates a new artifact with the given ID and parts.
    pub fn new(artifact_id: impl Into<String>, parts: Vec<Part>) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            parts,
            name: None,
            metadata: None,
        }
    }

    /// Creates a text artifact.
    pub fn text(artifact_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(artifact_id, vec![Part::text(text)])
    }

    /// Sets the name for this artifact.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns the concatenated text of all text parts.
    #[must_use]
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Event notifying subscribers of a status change.
///
/// `final` is true exactly when the new state is terminal; no events
/// follow a final update on that task's stream.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusUpdateEvent {
    /// The task that changed.
    pub task_id: String,
    /// The task's context.
    pub context_id: String,
    /// The new status.
    pub status: TaskStatus,
    /// True when this is the last event on the stream.
    pub r#final: bool,
    /// Optional metadata mapping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,

    /// Ignored during deserialization; injected on output.
    #[serde(default, skip_serializing)]
    #[allow(dead_code)]
    kind: Option<String>,
}

impl Serialize for TaskStatusUpdateEvent {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Helper<'a> {
            kind: &'static str,
            task_id: &'a str,
            context_id: &'a str,
            status: &'a TaskStatus,
            r#final: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            metadata: &'a Option<HashMap<String, serde_json::Value>>,
        }
        Helper {
            kind: "status-update",
            task_id: &self.task_id,
            context_id: &self.context_id,
            status: &self.status,
            r#final: self.r#final,
            metadata: &self.metadata,
        }
        .serialize(serializer)
    }
}

impl TaskStatusUpdateEvent {
    /// Creates a new status update event.
    pub fn new(
        task_id: impl Into<String>,
        context_id: impl Into<String>,
        status: TaskStatus,
        r#final: bool,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            context_id: context_id.into(),
            status,
            r#final,
            metadata: None,
            kind: None,
        }
    }
}

/// Event carrying a new artifact or an additional chunk of one.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskArtifactUpdateEvent {
    /// The task this artifact belongs to.
    pub task_id: String,
    /// The task's context.
    pub context_id: String,
    /// The artifact (or chunk of one).
    pub artifact: Artifact,
    /// True when the parts extend a previously announced artifact.
    #[serde(default)]
    pub append: bool,
    /// True when this is the final chunk of the artifact.
    #[serde(default)]
    pub last_chunk: bool,
    /// Optional metadata mapping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,

    /// Ignored during deserialization; injected on output.
    #[serde(default, skip_serializing)]
    #[allow(dead_code)]
    kind: Option<String>,
}

impl Serialize for TaskArtifactUpdateEvent {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Helper<'a> {
            kind: &'static str,
            task_id: &'a str,
            context_id: &'a str,
            artifact: &'a Artifact,
            #[serde(skip_serializing_if = "crate::types::task::is_false")]
            append: bool,
            #[serde(skip_serializing_if = "crate::types::task::is_false")]
            last_chunk: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            metadata: &'a Option<HashMap<String, serde_json::Value>>,
        }
        Helper {
            kind: "artifact-update",
            task_id: &self.task_id,
            context_id: &self.context_id,
            artifact: &self.artifact,
            append: self.append,
            last_chunk: self.last_chunk,
            metadata: &self.metadata,
        }
        .serialize(serializer)
    }
}

impl TaskArtifactUpdateEvent {
    /// Creates a new artifact update event for a whole artifact.
    pub fn new(
        task_id: impl Into<String>,
        context_id: impl Into<String>,
        artifact: Artifact,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            context_id: context_id.into(),
            artifact,
            append: false,
            last_chunk: false,
            metadata: None,
            kind: None,
        }
    }

    /// Marks this event as a chunk appended to an existing artifact.
    #[must_use]
    pub fn appending(mut self, last_chunk: bool) -> Self {
        self.append = true;
        self.last_chunk = last_chunk;
        self
    }
}
