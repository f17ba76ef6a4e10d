//! Outbound peer client.
//!
//! Speaks JSON-RPC to remote agent nodes: unary calls with connect and
//! total deadlines, agent-card discovery with caching, and SSE stream
//! consumption with automatic resubscription after transient drops.

mod card;
mod sse;

pub use card::{CardResolver, CARD_CACHE_TTL, CARD_WELL_KNOWN_PATH};
pub use sse::{RawFrame, SseParser};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header;
use tracing::{debug, warn};

use crate::config::{NodeConfig, PeerCredentials, TimeoutConfig};
use crate::error::{CoreError, PeerError, PeerErrorKind, Result};
use crate::types::{
    AgentCard, JsonRpcRequest, JsonRpcResponse, Message, ResubscribeParams, SendMessageParams,
    SequencedEvent, Task, TaskIdParams, TaskQueryParams,
};

/// Maximum pooled connections per peer host.
const POOL_MAX_PER_HOST: usize = 16;

/// Resubscription policy after a dropped stream.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Number of resubscribe attempts before giving up.
    pub attempts: u32,
    /// Delay before the first attempt; doubles per attempt.
    pub initial_backoff: Duration,
    /// Upper bound on the backoff delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given zero-based attempt.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.max_backoff)
    }
}

/// A stream of sequenced events from a peer task.
pub type PeerEventStream = BoxStream<'static, Result<SequencedEvent>>;

/// JSON-RPC client for remote agent nodes.
pub struct PeerClient {
    http: reqwest::Client,
    timeouts: TimeoutConfig,
    retry: RetryPolicy,
    resolver: CardResolver,
    credentials: HashMap<String, PeerCredentials>,
}

impl PeerClient {
    /// Creates a client with the given outbound deadlines.
    pub fn new(timeouts: TimeoutConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeouts.peer_connect())
            .pool_max_idle_per_host(POOL_MAX_PER_HOST)
            .build()
            .map_err(|e| CoreError::Config(format!("http client: {e}")))?;
        Ok(Self {
            resolver: CardResolver::new(http.clone()),
            http,
            timeouts,
            retry: RetryPolicy::default(),
            credentials: HashMap::new(),
        })
    }

    /// Creates a client seeded with the node's configured peers and
    /// their credentials.
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        let mut client = Self::new(config.timeouts.clone())?;
        for peer in &config.peers {
            if let Some(ref credentials) = peer.credentials {
                client
                    .credentials
                    .insert(peer.base_url.clone(), credentials.clone());
            }
        }
        Ok(client)
    }

    /// Overrides the resubscription policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Registers a credential for a peer base URL.
    pub fn add_credentials(&mut self, base_url: impl Into<String>, credentials: PeerCredentials) {
        self.credentials.insert(base_url.into(), credentials);
    }

    /// Fetches (and caches) a peer's agent card.
    pub async fn fetch_agent_card(&self, base_url: &str) -> Result<AgentCard> {
        self.resolver.fetch(base_url).await
    }

    fn authorize(&self, base_url: &str, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.credentials.get(base_url) {
            Some(PeerCredentials::Bearer { token }) => request.bearer_auth(token),
            Some(PeerCredentials::ApiKey { header, key }) => {
                request.header(header.as_str(), key.as_str())
            }
            None => request,
        }
    }

    async fn rpc<P, R>(&self, base_url: &str, method: &str, params: P) -> Result<R>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let request = JsonRpcRequest::new(method, params);
        let response = self
            .authorize(base_url, self.http.post(base_url))
            .timeout(self.timeouts.peer_total())
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| PeerError::from_transport(&e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(PeerError::new(PeerErrorKind::Auth, "peer rejected credentials")
                .with_http_status(status.as_u16())
                .into());
        }
        if !status.is_success() {
            return Err(PeerError::new(
                PeerErrorKind::Protocol,
                format!("peer returned HTTP {status}"),
            )
            .with_http_status(status.as_u16())
            .into());
        }

        let decoded: JsonRpcResponse<R> = response
            .json()
            .await
            .map_err(|e| PeerError::new(PeerErrorKind::Protocol, format!("bad response JSON: {e}")))?;
        match decoded {
            JsonRpcResponse::Success(success) => Ok(success.result),
            JsonRpcResponse::Error(error) => Err(PeerError::from_rpc(&error.error).into()),
        }
    }

    /// Sends a message, returning the peer's task snapshot.
    pub async fn send(&self, base_url: &str, message: Message) -> Result<Task> {
        self.rpc(base_url, "message/send", SendMessageParams::new(message))
            .await
    }

    /// Fetches a task from a peer.
    pub async fn get_task(&self, base_url: &str, task_id: &str) -> Result<Task> {
        self.rpc(base_url, "tasks/get", TaskQueryParams::new(task_id))
            .await
    }

    /// Cancels a peer task.
    pub async fn cancel(&self, base_url: &str, task_id: &str) -> Result<Task> {
        self.rpc(base_url, "tasks/cancel", TaskIdParams::new(task_id))
            .await
    }

    async fn open_sse(
        &self,
        base_url: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<reqwest::Response> {
        let request = JsonRpcRequest::new(method, params);
        let response = self
            .authorize(base_url, self.http.post(base_url))
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| PeerError::from_transport(&e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(PeerError::new(PeerErrorKind::Auth, "peer rejected credentials")
                .with_http_status(status.as_u16())
                .into());
        }
        if !status.is_success() {
            return Err(PeerError::new(
                PeerErrorKind::Protocol,
                format!("stream open returned HTTP {status}"),
            )
            .with_http_status(status.as_u16())
            .into());
        }
        Ok(response)
    }

    /// Opens a streaming call and consumes its events.
    ///
    /// On a drop before the final event, the stream resubscribes with
    /// the last seen sequence number, backing off exponentially up to
    /// the retry policy's attempt budget.
    pub async fn stream(&self, base_url: &str, message: Message) -> Result<PeerEventStream> {
        let params = serde_json::to_value(SendMessageParams::new(message))?;
        let first = self.open_sse(base_url, "message/stream", params).await?;
        Ok(self.consume(base_url.to_string(), first))
    }

    /// Rejoins a peer task's stream after `last_event_id`.
    pub async fn resubscribe(
        &self,
        base_url: &str,
        task_id: &str,
        last_event_id: Option<u64>,
    ) -> Result<PeerEventStream> {
        let params = serde_json::to_value(ResubscribeParams::new(task_id, last_event_id))?;
        let first = self.open_sse(base_url, "tasks/resubscribe", params).await?;
        Ok(self.consume(base_url.to_string(), first))
    }

    fn consume(&self, base_url: String, first: reqwest::Response) -> PeerEventStream {
        let session = StreamSession {
            http: self.http.clone(),
            credentials: self.credentials.get(&base_url).cloned(),
            retry: self.retry.clone(),
            idle: self.timeouts.stream_idle(),
            base_url,
        };
        session.run(first)
    }
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

/// State carried across reconnects of one logical stream.
struct StreamSession {
    http: reqwest::Client,
    credentials: Option<PeerCredentials>,
    retry: RetryPolicy,
    idle: Duration,
    base_url: String,
}

impl StreamSession {
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some(PeerCredentials::Bearer { token }) => request.bearer_auth(token),
            Some(PeerCredentials::ApiKey { header, key }) => {
                request.header(header.as_str(), key.as_str())
            }
            None => request,
        }
    }

    async fn reopen(
        &self,
        task_id: &str,
        last_seq: Option<u64>,
    ) -> std::result::Result<reqwest::Response, PeerError> {
        let request = JsonRpcRequest::new(
            "tasks/resubscribe",
            ResubscribeParams::new(task_id, last_seq),
        );
        let response = self
            .authorize(self.http.post(&self.base_url))
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| PeerError::from_transport(&e))?;
        if !response.status().is_success() {
            return Err(PeerError::new(
                PeerErrorKind::Protocol,
                format!("resubscribe returned HTTP {}", response.status()),
            )
            .with_http_status(response.status().as_u16()));
        }
        Ok(response)
    }

    fn run(self, first: reqwest::Response) -> PeerEventStream {
        Box::pin(async_stream::stream! {
            let mut response = first;
            let mut task_id: Option<String> = None;
            let mut last_seq: Option<u64> = None;

            'connection: loop {
                let mut parser = SseParser::new();
                let mut chunks = response.bytes_stream();

                loop {
                    let next = tokio::time::timeout(self.idle, chunks.next()).await;
                    let chunk = match next {
                        Ok(Some(Ok(bytes))) => bytes,
                        Ok(Some(Err(e))) => {
                            debug!(error = %e, "Peer stream transport error");
                            break;
                        }
                        Ok(None) => break,
                        Err(_) => {
                            debug!(base_url = %self.base_url, "Peer stream idle timeout");
                            break;
                        }
                    };
                    let text = String::from_utf8_lossy(&chunk).into_owned();
                    for frame in parser.push_chunk(&text) {
                        match frame.into_event() {
                            Ok(sequenced) => {
                                if sequenced.seq > 0 {
                                    last_seq = Some(sequenced.seq);
                                }
                                if task_id.is_none() {
                                    task_id =
                                        sequenced.event.task_id().map(str::to_string);
                                }
                                let is_final = sequenced.event.is_final();
                                yield Ok(sequenced);
                                if is_final {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "Dropping undecodable peer event");
                            }
                        }
                    }
                }

                // Dropped before the final event; try to rejoin.
                let Some(ref tid) = task_id else {
                    yield Err(PeerError::new(
                        PeerErrorKind::Unreachable,
                        "stream ended before any task event",
                    )
                    .into());
                    return;
                };
                let mut attempt = 0u32;
                loop {
                    if attempt >= self.retry.attempts {
                        yield Err(PeerError::new(
                            PeerErrorKind::Unreachable,
                            format!(
                                "stream lost after {} resubscribe attempts",
                                self.retry.attempts
                            ),
                        )
                        .into());
                        return;
                    }
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    match self.reopen(tid, last_seq).await {
                        Ok(next) => {
                            debug!(task_id = %tid, attempt, "Resubscribed to peer stream");
                            response = next;
                            continue 'connection;
                        }
                        Err(e) if e.is_retryable() => {
                            attempt += 1;
                        }
                        Err(e) => {
                            yield Err(e.into());
                            return;
                        }
                    }
                }
            }
        })
    }
}

/// Collects a peer stream to completion, returning every event.
///
/// Test and orchestration helper; stops at the final event or first
/// error.
pub async fn collect_stream(mut stream: PeerEventStream) -> Result<Vec<SequencedEvent>> {
    let mut events = Vec::new();
    while let Some(item) = stream.next().await {
        events.push(item?);
    }
    Ok(events)
}

/// Shared handle used by orchestrators dispatching to many peers.
pub type SharedPeerClient = Arc<PeerClient>;
