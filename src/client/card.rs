//! Agent card discovery and caching.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::header;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{PeerError, PeerErrorKind, Result};
use crate::types::AgentCard;

/// Well-known path for agent card discovery.
pub const CARD_WELL_KNOWN_PATH: &str = ".well-known/agent.json";

/// How long a fetched card stays fresh without revalidation.
pub const CARD_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct CachedCard {
    card: AgentCard,
    etag: Option<String>,
    fetched_at: Instant,
}

/// Fetches and caches peer agent cards.
///
/// Cards are cached per base URL for [`CARD_CACHE_TTL`]; stale entries
/// revalidate with `If-None-Match` when the peer supplied an ETag.
#[derive(Debug)]
pub struct CardResolver {
    http: reqwest::Client,
    cache: RwLock<HashMap<String, CachedCard>>,
}

impl CardResolver {
    /// Creates a resolver over an HTTP client.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn card_url(base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), CARD_WELL_KNOWN_PATH)
    }

    /// Fetches the card for a peer, honoring the cache.
    pub async fn fetch(&self, base_url: &str) -> Result<AgentCard> {
        let cached = {
            let cache = self.cache.read().await;
            cache.get(base_url).cloned()
        };
        if let Some(ref entry) = cached {
            if entry.fetched_at.elapsed() < CARD_CACHE_TTL {
                return Ok(entry.card.clone());
            }
        }

        let mut request = self.http.get(Self::card_url(base_url));
        if let Some(etag) = cached.as_ref().and_then(|c| c.etag.clone()) {
            request = request.header(header::IF_NONE_MATCH, etag);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PeerError::from_transport(&e))?;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            if let Some(mut entry) = cached {
                debug!(base_url, "Agent card revalidated");
                entry.fetched_at = Instant::now();
                let card = entry.card.clone();
                self.cache
                    .write()
                    .await
                    .insert(base_url.to_string(), entry);
                return Ok(card);
            }
        }
        if !response.status().is_success() {
            return Err(PeerError::new(
                PeerErrorKind::Protocol,
                format!("card fetch returned HTTP {}", response.status()),
            )
            .with_http_status(response.status().as_u16())
            .into());
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let card: AgentCard = response
            .json()
            .await
            .map_err(|e| PeerError::new(PeerErrorKind::Protocol, format!("bad card JSON: {e}")))?;

        self.cache.write().await.insert(
            base_url.to_string(),
            CachedCard {
                card: card.clone(),
                etag,
                fetched_at: Instant::now(),
            },
        );
        Ok(card)
    }

    /// Drops the cached card for a peer.
    pub async fn invalidate(&self, base_url: &str) {
        self.cache.write().await.remove(base_url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_url_normalization() {
        assert_eq!(
            CardResolver::card_url("http://peer.local:4001/"),
            "http://peer.local:4001/.well-known/agent.json"
        );
        assert_eq!(
            CardResolver::card_url("http://peer.local:4001"),
            "http://peer.local:4001/.well-known/agent.json"
        );
    }
}
