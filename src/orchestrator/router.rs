//! Peer registry and step routing.
//!
//! Routing picks the peer advertising a step's skill tag. Ties break by
//! fewer in-flight dispatches, then lower observed error rate, then a
//! deterministic hash of the step id so identical inputs route
//! identically.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::plan::PeerSkills;
use crate::client::PeerClient;
use crate::config::PeerConfig;
use crate::error::Result;

/// A routable peer with its dispatch bookkeeping.
#[derive(Debug)]
pub struct PeerEntry {
    /// Configured display name.
    pub name: String,
    /// The peer's base URL.
    pub base_url: String,
    /// Skill tags the peer advertises.
    pub tags: Vec<String>,
    in_flight: AtomicUsize,
    attempts: AtomicU64,
    errors: AtomicU64,
}

impl PeerEntry {
    fn new(name: String, base_url: String, tags: Vec<String>) -> Self {
        Self {
            name,
            base_url,
            tags,
            in_flight: AtomicUsize::new(0),
            attempts: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Current number of dispatches in flight to this peer.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Fraction of dispatches that errored, in [0, 1].
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let attempts = self.attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return 0.0;
        }
        self.errors.load(Ordering::Relaxed) as f64 / attempts as f64
    }

    /// Records the start of a dispatch.
    pub fn begin_dispatch(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the end of a dispatch.
    pub fn end_dispatch(&self, ok: bool) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// The set of peers an orchestrating node may delegate to.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Vec<Arc<PeerEntry>>,
}

impl PeerRegistry {
    /// Builds the registry from configuration, fetching agent cards for
    /// peers without a `skills_override`.
    ///
    /// A peer whose card cannot be fetched and that has no override is
    /// registered with no tags; it becomes routable once rediscovered.
    pub async fn discover(configs: &[PeerConfig], client: &PeerClient) -> Result<Self> {
        let mut peers = Vec::with_capacity(configs.len());
        for peer in configs {
            let tags = match &peer.skills_override {
                Some(tags) => tags.clone(),
                None => match client.fetch_agent_card(&peer.base_url).await {
                    Ok(card) => card
                        .skills
                        .iter()
                        .flat_map(|s| s.tags.iter().cloned())
                        .collect(),
                    Err(e) => {
                        warn!(peer = %peer.name, error = %e, "Card discovery failed");
                        Vec::new()
                    }
                },
            };
            debug!(peer = %peer.name, ?tags, "Peer registered");
            peers.push(Arc::new(PeerEntry::new(
                peer.name.clone(),
                peer.base_url.clone(),
                tags,
            )));
        }
        Ok(Self { peers })
    }

    /// Builds a registry from static entries; used by tests and nodes
    /// with fully configured skill overrides.
    #[must_use]
    pub fn from_entries(entries: Vec<(String, String, Vec<String>)>) -> Self {
        Self {
            peers: entries
                .into_iter()
                .map(|(name, base_url, tags)| Arc::new(PeerEntry::new(name, base_url, tags)))
                .collect(),
        }
    }

    /// The peers' skills as the planner sees them.
    #[must_use]
    pub fn skills(&self) -> Vec<PeerSkills> {
        self.peers
            .iter()
            .map(|p| PeerSkills {
                name: p.name.clone(),
                tags: p.tags.clone(),
            })
            .collect()
    }

    /// Selects the peer for a step.
    ///
    /// Filters on the skill tag, then applies the tie-break chain:
    /// in-flight count, error rate, deterministic step-id hash.
    #[must_use]
    pub fn select(&self, target_skill: &str, step_id: &str) -> Option<Arc<PeerEntry>> {
        let mut candidates: Vec<&Arc<PeerEntry>> = self
            .peers
            .iter()
            .filter(|p| p.tags.iter().any(|t| t == target_skill))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        // A stable base order makes the hash tie-break reproducible.
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        let min_in_flight = candidates.iter().map(|p| p.in_flight()).min()?;
        candidates.retain(|p| p.in_flight() == min_in_flight);

        let min_rate = candidates
            .iter()
            .map(|p| p.error_rate())
            .fold(f64::INFINITY, f64::min);
        candidates.retain(|p| (p.error_rate() - min_rate).abs() < f64::EPSILON);

        let mut hasher = DefaultHasher::new();
        step_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % candidates.len();
        Some(Arc::clone(candidates[index]))
    }

    /// Number of registered peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true when no peers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
