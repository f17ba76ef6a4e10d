//! Stream events.
//!
//! Every task owns an event stream; these are the variants observable on
//! it. Each variant serializes with its own `kind` discriminator, so the
//! enum itself stays untagged on the wire.

use serde::{Deserialize, Serialize};

use super::{Message, Task, TaskArtifactUpdateEvent, TaskStatusUpdateEvent};

/// An event emitted on a task's stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Event {
    /// A full task snapshot, emitted at stream start and on resubscribe.
    TaskSnapshot(Task),
    /// A status transition; `final` marks the end of the stream.
    StatusUpdate(TaskStatusUpdateEvent),
    /// A new artifact or an additional chunk of one.
    ArtifactUpdate(TaskArtifactUpdateEvent),
    /// A message produced by the agent mid-task.
    Message(Message),
}

impl Event {
    /// Returns the task ID this event belongs to, if it carries one.
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskSnapshot(t) => Some(&t.id),
            Self::StatusUpdate(e) => Some(&e.task_id),
            Self::ArtifactUpdate(e) => Some(&e.task_id),
            Self::Message(m) => m.task_id.as_deref(),
        }
    }

    /// Returns true if this is a final status update.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, Self::StatusUpdate(e) if e.r#final)
    }

    /// Returns the event kind string used as the SSE `event:` field.
    #[must_use]
    pub fn event_kind(&self) -> &'static str {
        match self {
            Self::TaskSnapshot(_) => "task",
            Self::StatusUpdate(_) => "status-update",
            Self::ArtifactUpdate(_) => "artifact-update",
            Self::Message(_) => "message",
        }
    }

    /// Creates a snapshot event.
    #[must_use]
    pub fn snapshot(task: Task) -> Self {
        Self::TaskSnapshot(task)
    }

    /// Creates a status update event.
    #[must_use]
    pub fn status(event: TaskStatusUpdateEvent) -> Self {
        Self::StatusUpdate(event)
    }

    /// Creates an artifact update event.
    #[must_use]
    pub fn artifact(event: TaskArtifactUpdateEvent) -> Self {
        Self::ArtifactUpdate(event)
    }

    /// Creates a message event.
    #[must_use]
    pub fn message(message: Message) -> Self {
        Self::Message(message)
    }
}

/// An event paired with its per-task sequence number.
///
/// Sequence numbers increase monotonically per task and become the SSE
/// `id:` field, enabling resubscription after `n`.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedEvent {
    /// Position of this event in the task's total order, starting at 1.
    pub seq: u64,
    /// The event payload.
    pub event: Event,
}

impl SequencedEvent {
    /// Creates a new sequenced event.
    #[must_use]
    pub fn new(seq: u64, event: Event) -> Self {
        Self { seq, event }
    }
}
