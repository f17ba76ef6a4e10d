//! Server-side runtime: task store, lifecycle manager, event queues,
//! SSE delivery, JSON-RPC dispatch, and HTTP wiring.

mod app;
mod dispatcher;
mod lifecycle;
mod push;
pub mod queue;
mod sse;
mod store;

pub use app::{AgentNode, WELL_KNOWN_CARD_PATH};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use lifecycle::TaskManager;
pub use push::PushConfigStore;
pub use queue::{EventQueue, QueueManager, Subscription, DEFAULT_QUEUE_CAPACITY};
pub use sse::{sse_response, EventSse, CATCH_UP_COMMENT, KEEPALIVE_INTERVAL, LAGGED_COMMENT};
pub use store::TaskStore;
