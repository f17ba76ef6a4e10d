//! Server-Sent Events delivery.
//!
//! Frames each queue event as
//!
//! ```text
//! id: <seq>
//! event: <kind>
//! data: <json>
//! ```
//!
//! with a keepalive comment at least every 15 seconds to defeat idle
//! intermediaries. A subscriber that lags the bounded queue receives a
//! `StreamLagged` comment and is disconnected; the task is unaffected.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event as SseFrame, KeepAlive, KeepAliveStream, Sse};
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::warn;

use super::queue::Subscription;
use crate::error::CoreError;
use crate::types::{Event, Task};

/// Interval between keepalive comments.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Comment sent to a subscriber dropped for falling behind.
pub const LAGGED_COMMENT: &str = "StreamLagged";

/// Comment sent when a resume point was no longer retained and the
/// stream restarted from a fresh snapshot.
pub const CATCH_UP_COMMENT: &str = "catch_up=false";

/// The SSE response type returned by streaming endpoints.
pub type EventSse = Sse<KeepAliveStream<BoxStream<'static, Result<SseFrame, Infallible>>>>;

fn frame(seq: Option<u64>, event: &Event) -> SseFrame {
    let data = serde_json::to_string(event).unwrap_or_else(|e| {
        warn!(error = %e, "Event serialization failed");
        String::from("{}")
    });
    let mut sse = SseFrame::default().event(event.event_kind()).data(data);
    if let Some(seq) = seq {
        sse = sse.id(seq.to_string());
    }
    sse
}

/// Builds the SSE response for a subscription.
///
/// A provided `snapshot` is sent first, without an id since it is not
/// part of the sequence: callers pass one when a stream joins a task
/// mid-flight, and when a resubscribe could not catch up to its resume
/// point — the latter flagged by a `catch_up=false` comment.
pub fn sse_response(subscription: Subscription, snapshot: Option<Task>) -> EventSse {
    let caught_up = subscription.caught_up;
    let events = subscription.into_stream();

    let stream: BoxStream<'static, Result<SseFrame, Infallible>> =
        Box::pin(async_stream::stream! {
            if !caught_up {
                yield Ok(SseFrame::default().comment(CATCH_UP_COMMENT));
            }
            if let Some(task) = snapshot {
                yield Ok(frame(None, &Event::snapshot(task)));
            }
            let mut events = events;
            while let Some(item) = events.next().await {
                match item {
                    Ok(sequenced) => {
                        yield Ok(frame(Some(sequenced.seq), &sequenced.event));
                    }
                    Err(CoreError::StreamLagged { missed }) => {
                        warn!(missed, "Disconnecting lagged SSE subscriber");
                        yield Ok(SseFrame::default()
                            .comment(format!("{LAGGED_COMMENT}: missed {missed} events")));
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "SSE stream error");
                        return;
                    }
                }
            }
        });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}
