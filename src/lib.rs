//! # colloquy
//!
//! An inter-agent coordination runtime: agent nodes accept natural-
//! language or structured requests over JSON-RPC, run them as durable
//! tasks with a canonical lifecycle, stream progress to callers over
//! SSE, checkpoint both protocol and worker state, and — on
//! orchestrating nodes — decompose requests into steps fanned out to
//! peer agents speaking the same protocol.
//!
//! ## Architecture
//!
//! - **Types & validation**: canonical models for parts, messages,
//!   tasks, artifacts, stream events, and agent cards.
//! - **Server**: task store, single-writer lifecycle manager, bounded
//!   replayable event queues, SSE delivery, and the JSON-RPC dispatcher
//!   behind one HTTP endpoint.
//! - **Checkpointing**: a pluggable key-value backend storing task
//!   snapshots and opaque worker state, linked by a task ↔ thread map.
//! - **Worker seam**: any reasoning engine plugs in behind the
//!   [`worker::Worker`] trait; the host translates its item stream into
//!   protocol events.
//! - **Client**: outbound calls to peer nodes, card discovery, and SSE
//!   consumption with automatic resubscription.
//! - **Orchestrator**: a worker that plans, routes, fans out to peers,
//!   and aggregates in plan order.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod types;
pub mod worker;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "orchestrator")]
pub mod orchestrator;

pub use error::{CoreError, JsonRpcError, PeerError, PeerErrorKind, Result, RpcErrorCode};
pub use types::{
    AgentCapabilities, AgentCard, AgentSkill, Artifact, AuthScheme, Event, Message, Part, Role,
    SequencedEvent, Task, TaskArtifactUpdateEvent, TaskState, TaskStatus, TaskStatusUpdateEvent,
};

#[cfg(feature = "server")]
pub use server::{AgentNode, TaskManager, TaskStore};

#[cfg(feature = "client")]
pub use client::PeerClient;

#[cfg(feature = "orchestrator")]
pub use orchestrator::{Coordinator, KeywordPlanner, Planner};

/// Protocol version implemented by this crate.
pub const PROTOCOL_VERSION: &str = "0.2";
