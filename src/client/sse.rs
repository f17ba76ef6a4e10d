//! Client-side SSE parsing.
//!
//! A small incremental parser over the standard framing: `id:` carries
//! the per-task sequence number, `event:` the kind, `data:` the JSON
//! payload, a blank line terminates the frame, and `:`-prefixed comments
//! (keepalives, lag notices) are skipped.

use crate::error::{CoreError, Result};
use crate::types::{Event, SequencedEvent};

/// Incremental SSE frame parser.
#[derive(Debug, Default)]
pub struct SseParser {
    event_name: Option<String>,
    data: String,
    id: Option<u64>,
    buffer: String,
}

impl SseParser {
    /// Creates an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line (without its terminator); returns a completed
    /// frame when the line was a frame-ending blank.
    pub fn push_line(&mut self, line: &str) -> Option<RawFrame> {
        let line = line.trim_end_matches('\r');

        if line.is_empty() {
            if self.data.is_empty() {
                self.event_name = None;
                return None;
            }
            return Some(RawFrame {
                event_name: self.event_name.take(),
                data: std::mem::take(&mut self.data),
                id: self.id.take(),
            });
        }

        if let Some(rest) = line.strip_prefix("id:") {
            self.id = rest.trim().parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix("event:") {
            self.event_name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(rest.trim_start());
        }
        // Comment lines (":keepalive") and unknown fields are skipped.
        None
    }

    /// Feeds a raw chunk of bytes, returning every frame completed by it.
    pub fn push_chunk(&mut self, chunk: &str) -> Vec<RawFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if let Some(frame) = self.push_line(line.trim_end_matches('\n')) {
                frames.push(frame);
            }
        }
        frames
    }
}

/// One decoded SSE frame, payload still raw.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// The `event:` field, when present.
    pub event_name: Option<String>,
    /// The concatenated `data:` payload.
    pub data: String,
    /// The `id:` field, when it parsed as a sequence number.
    pub id: Option<u64>,
}

impl RawFrame {
    /// Decodes the payload into a protocol event with its sequence
    /// number (0 for frames sent outside the sequence, like catch-up
    /// snapshots).
    pub fn into_event(self) -> Result<SequencedEvent> {
        let event: Event = serde_json::from_str(&self.data)
            .map_err(|e| CoreError::Internal(format!("undecodable stream event: {e}")))?;
        Ok(SequencedEvent::new(self.id.unwrap_or(0), event))
    }
}
