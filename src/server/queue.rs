//! Per-task event queues.
//!
//! Each task owns a bounded ring of sequenced events plus a broadcast
//! channel for live fan-out. Publishing never blocks the task manager:
//! the ring evicts its oldest entry when full and slow subscribers are
//! disconnected by the broadcast channel's lag accounting, surfacing as
//! [`CoreError::StreamLagged`] on their stream only.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use futures::stream::BoxStream;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::types::{Event, SequencedEvent};

/// Default ring capacity per task.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Ring {
    retained: VecDeque<SequencedEvent>,
    capacity: usize,
    next_seq: u64,
    closed: bool,
}

impl Ring {
    fn latest_seq(&self) -> u64 {
        self.next_seq - 1
    }

    fn oldest_seq(&self) -> Option<u64> {
        self.retained.front().map(|e| e.seq)
    }
}

/// A bounded, replayable event queue for one task.
#[derive(Debug)]
pub struct EventQueue {
    ring: Mutex<Ring>,
    notify: broadcast::Sender<SequencedEvent>,
}

impl EventQueue {
    /// Creates a queue retaining up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (notify, _) = broadcast::channel(capacity);
        Self {
            ring: Mutex::new(Ring {
                retained: VecDeque::with_capacity(capacity),
                capacity,
                next_seq: 1,
                closed: false,
            }),
            notify,
        }
    }

    /// Publishes an event, assigning it the next sequence number.
    ///
    /// Returns the assigned sequence number. A final status-update closes
    /// the queue; publishing afterwards fails with [`CoreError::QueueClosed`].
    pub fn publish(&self, event: Event) -> Result<u64> {
        let sequenced = {
            let mut ring = self.ring.lock().expect("queue lock poisoned");
            if ring.closed {
                return Err(CoreError::QueueClosed);
            }
            let seq = ring.next_seq;
            ring.next_seq += 1;
            let sequenced = SequencedEvent::new(seq, event);
            if ring.retained.len() == ring.capacity {
                ring.retained.pop_front();
            }
            ring.retained.push_back(sequenced.clone());
            if sequenced.event.is_final() {
                ring.closed = true;
            }
            sequenced
        };
        // No receivers is fine; the ring still retains for resubscribes.
        let seq = sequenced.seq;
        let _ = self.notify.send(sequenced);
        Ok(seq)
    }

    /// Subscribes from the start of the retained window.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_after(None)
    }

    /// Subscribes to events with sequence numbers greater than `after`.
    ///
    /// When `after` has fallen out of the retained window, the
    /// subscription replays the whole window and reports
    /// `caught_up = false`, signalling the caller to prepend a fresh
    /// snapshot.
    #[must_use]
    pub fn subscribe_after(&self, after: Option<u64>) -> Subscription {
        // The receiver is created under the ring lock so no event can
        // slip between the replay snapshot and the live stream.
        let ring = self.ring.lock().expect("queue lock poisoned");
        let live = self.notify.subscribe();

        let caught_up = match (after, ring.oldest_seq()) {
            (Some(n), Some(oldest)) => n + 1 >= oldest,
            (Some(n), None) => n >= ring.latest_seq(),
            (None, _) => true,
        };
        let cursor = if caught_up { after.unwrap_or(0) } else { 0 };
        let replay: Vec<SequencedEvent> = ring
            .retained
            .iter()
            .filter(|e| e.seq > cursor)
            .cloned()
            .collect();
        let end_seq = ring.closed.then(|| ring.latest_seq());

        Subscription {
            caught_up,
            cursor,
            replay,
            live,
            end_seq,
        }
    }

    /// Returns true once a final event has been published.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.ring.lock().expect("queue lock poisoned").closed
    }

    /// Number of subscribers currently attached to the live channel.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.notify.receiver_count()
    }

    /// The most recently assigned sequence number (0 before any publish).
    #[must_use]
    pub fn latest_seq(&self) -> u64 {
        self.ring.lock().expect("queue lock poisoned").latest_seq()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// A subscriber's view of a task's event stream.
#[derive(Debug)]
pub struct Subscription {
    /// False when the requested resume point was already evicted; the
    /// caller should prepend a fresh task snapshot.
    pub caught_up: bool,
    cursor: u64,
    replay: Vec<SequencedEvent>,
    live: broadcast::Receiver<SequencedEvent>,
    end_seq: Option<u64>,
}

impl Subscription {
    /// Converts the subscription into an ordered event stream.
    ///
    /// Replayed events come first, then live events, deduplicated on the
    /// overlap. The stream ends after a final event, after draining a
    /// closed queue, or with a single `StreamLagged` error when this
    /// subscriber fell behind.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, Result<SequencedEvent>> {
        let Subscription {
            cursor,
            replay,
            mut live,
            end_seq,
            ..
        } = self;

        Box::pin(async_stream::stream! {
            let mut last = cursor;
            for event in replay {
                last = event.seq;
                let is_final = event.event.is_final();
                yield Ok(event);
                if is_final {
                    return;
                }
            }
            if let Some(end) = end_seq {
                if last >= end {
                    return;
                }
            }
            loop {
                match live.recv().await {
                    Ok(event) => {
                        if event.seq <= last {
                            continue;
                        }
                        last = event.seq;
                        let is_final = event.event.is_final();
                        yield Ok(event);
                        if is_final {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        yield Err(CoreError::StreamLagged { missed });
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }
}

/// Owns the event queues of all live tasks.
#[derive(Debug)]
pub struct QueueManager {
    queues: RwLock<HashMap<String, Arc<EventQueue>>>,
    capacity: usize,
}

impl QueueManager {
    /// Creates a manager with the given per-task capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Gets the queue for a task, creating it on first use.
    pub async fn get_or_create(&self, task_id: &str) -> Arc<EventQueue> {
        {
            let queues = self.queues.read().await;
            if let Some(queue) = queues.get(task_id) {
                return Arc::clone(queue);
            }
        }
        let mut queues = self.queues.write().await;
        Arc::clone(
            queues
                .entry(task_id.to_string())
                .or_insert_with(|| Arc::new(EventQueue::new(self.capacity))),
        )
    }

    /// Gets the queue for a task, if one exists.
    pub async fn get(&self, task_id: &str) -> Option<Arc<EventQueue>> {
        self.queues.read().await.get(task_id).cloned()
    }

    /// Drops the queue for a task.
    pub async fn remove(&self, task_id: &str) -> Option<Arc<EventQueue>> {
        let removed = self.queues.write().await.remove(task_id);
        if removed.is_some() {
            debug!(task_id = %task_id, "Event queue removed");
        }
        removed
    }

    /// Number of live queues.
    pub async fn len(&self) -> usize {
        self.queues.read().await.len()
    }

    /// Returns true when no queues are live.
    pub async fn is_empty(&self) -> bool {
        self.queues.read().await.is_empty()
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, Task, TaskStatus, TaskStatusUpdateEvent};
    use futures::StreamExt;

    fn status_event(task_id: &str, status: TaskStatus, fin: bool) -> Event {
        Event::status(TaskStatusUpdateEvent::new(task_id, "c", status, fin))
    }

    #[tokio::test]
    async fn test_publish_assigns_monotonic_seqs() {
        let queue = EventQueue::new(8);
        assert_eq!(queue.publish(Event::snapshot(Task::new("t", "c"))).unwrap(), 1);
        assert_eq!(
            queue
                .publish(status_event("t", TaskStatus::working(), false))
                .unwrap(),
            2
        );
        assert_eq!(queue.latest_seq(), 2);
    }

    #[tokio::test]
    async fn test_replay_then_live() {
        let queue = EventQueue::new(8);
        queue.publish(Event::snapshot(Task::new("t", "c"))).unwrap();
        queue
            .publish(status_event("t", TaskStatus::working(), false))
            .unwrap();

        let mut stream = queue.subscribe().into_stream();
        assert_eq!(stream.next().await.unwrap().unwrap().seq, 1);
        assert_eq!(stream.next().await.unwrap().unwrap().seq, 2);

        queue
            .publish(status_event("t", TaskStatus::completed(), true))
            .unwrap();
        let fin = stream.next().await.unwrap().unwrap();
        assert_eq!(fin.seq, 3);
        assert!(fin.event.is_final());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_after_skips_seen_events() {
        let queue = EventQueue::new(8);
        for _ in 0..4 {
            queue
                .publish(Event::message(Message::agent_text("m").with_task_id("t")))
                .unwrap();
        }

        let sub = queue.subscribe_after(Some(2));
        assert!(sub.caught_up);
        let mut stream = sub.into_stream();
        assert_eq!(stream.next().await.unwrap().unwrap().seq, 3);
        assert_eq!(stream.next().await.unwrap().unwrap().seq, 4);
    }

    #[tokio::test]
    async fn test_resume_point_evicted_reports_not_caught_up() {
        let queue = EventQueue::new(4);
        for _ in 0..10 {
            queue
                .publish(Event::message(Message::agent_text("m").with_task_id("t")))
                .unwrap();
        }
        // Seqs 1..=6 have been evicted; resuming after 2 cannot catch up.
        let sub = queue.subscribe_after(Some(2));
        assert!(!sub.caught_up);
        let mut stream = sub.into_stream();
        // The whole retained window replays instead.
        assert_eq!(stream.next().await.unwrap().unwrap().seq, 7);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_publish() {
        let queue = EventQueue::new(8);
        queue
            .publish(status_event("t", TaskStatus::completed(), true))
            .unwrap();
        assert!(queue.is_closed());
        assert!(matches!(
            queue.publish(Event::message(Message::agent_text("late"))),
            Err(CoreError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn test_subscribe_to_closed_queue_ends_after_replay() {
        let queue = EventQueue::new(8);
        queue.publish(Event::snapshot(Task::new("t", "c"))).unwrap();
        queue
            .publish(status_event("t", TaskStatus::completed(), true))
            .unwrap();

        let mut stream = queue.subscribe().into_stream();
        assert_eq!(stream.next().await.unwrap().unwrap().seq, 1);
        assert!(stream.next().await.unwrap().unwrap().event.is_final());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_resubscribe_past_final_event_ends_immediately() {
        let queue = EventQueue::new(8);
        queue
            .publish(status_event("t", TaskStatus::completed(), true))
            .unwrap();

        let mut stream = queue.subscribe_after(Some(1)).into_stream();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_publisher_never_blocks_on_slow_subscriber() {
        let queue = EventQueue::new(4);
        // Attach a subscriber that never reads.
        let _stalled = queue.subscribe();
        for _ in 0..100 {
            queue
                .publish(Event::message(Message::agent_text("m").with_task_id("t")))
                .unwrap();
        }
        assert_eq!(queue.latest_seq(), 100);
    }

    #[tokio::test]
    async fn test_two_subscribers_observe_same_order() {
        let queue = Arc::new(EventQueue::new(64));
        let mut a = queue.subscribe().into_stream();
        let mut b = queue.subscribe().into_stream();

        for _ in 0..5 {
            queue
                .publish(Event::message(Message::agent_text("m").with_task_id("t")))
                .unwrap();
        }
        queue
            .publish(status_event("t", TaskStatus::completed(), true))
            .unwrap();

        let seqs_a: Vec<u64> = (&mut a).map(|r| r.unwrap().seq).collect().await;
        let seqs_b: Vec<u64> = (&mut b).map(|r| r.unwrap().seq).collect().await;
        assert_eq!(seqs_a, seqs_b);
        assert_eq!(seqs_a, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_queue_manager_lifecycle() {
        let manager = QueueManager::new(8);
        let queue = manager.get_or_create("t-1").await;
        assert_eq!(manager.len().await, 1);

        let again = manager.get_or_create("t-1").await;
        assert!(Arc::ptr_eq(&queue, &again));

        manager.remove("t-1").await;
        assert!(manager.is_empty().await);
    }
}
