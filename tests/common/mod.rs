//! Shared fixtures: scenario workers and node spawning helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;

use colloquy::config::NodeConfig;
use colloquy::error::Result;
use colloquy::server::AgentNode;
use colloquy::types::{AgentCapabilities, AgentCard, AgentSkill, Message, Part};
use colloquy::worker::{Worker, WorkerItem, WorkerStream};

const KNOWN_CURRENCIES: &[&str] = &["USD", "EUR", "JPY", "GBP"];

/// Answers exchange-rate questions; asks for the source currency when
/// the request does not name one.
pub struct CurrencyWorker;

fn currency_answer(task_id: &str) -> WorkerStream {
    let artifact_id = format!("rate-{task_id}");
    Box::pin(async_stream::stream! {
        yield WorkerItem::Thinking("Looking up exchange rates".to_string());
        yield WorkerItem::ToolInvocation {
            name: "exchange_rate".to_string(),
            input: json!({"from": "USD", "to": "EUR"}),
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        yield WorkerItem::ToolResult {
            name: "exchange_rate".to_string(),
            output: json!({"rate": 0.92}),
        };
        yield WorkerItem::PartialArtifact {
            artifact_id: artifact_id.clone(),
            part: Part::text("1 USD = 0.92"),
            is_last: false,
        };
        yield WorkerItem::PartialArtifact {
            artifact_id,
            part: Part::text(" EUR"),
            is_last: true,
        };
        yield WorkerItem::Final(vec![Part::text("1 USD = 0.92 EUR")]);
    })
}

fn names_a_currency(text: &str) -> bool {
    KNOWN_CURRENCIES
        .iter()
        .filter(|c| text.contains(*c))
        .count()
        >= 2
        || text.contains("USD")
}

#[async_trait]
impl Worker for CurrencyWorker {
    async fn start(
        &self,
        task_id: &str,
        message: &Message,
        _resumed_state: Option<Vec<u8>>,
    ) -> Result<WorkerStream> {
        let text = message.text_content().unwrap_or_default();
        if names_a_currency(&text) {
            Ok(currency_answer(task_id))
        } else {
            Ok(Box::pin(async_stream::stream! {
                yield WorkerItem::NeedsInput {
                    prompt: "Which currency should I convert from?".to_string(),
                };
            }))
        }
    }

    async fn resume(&self, task_id: &str, message: &Message) -> Result<WorkerStream> {
        let text = message.text_content().unwrap_or_default();
        if names_a_currency(&text) {
            Ok(currency_answer(task_id))
        } else {
            Ok(Box::pin(async_stream::stream! {
                yield WorkerItem::NeedsInput {
                    prompt: "Still need a source currency".to_string(),
                };
            }))
        }
    }

    async fn cancel(&self, _task_id: &str) {}

    async fn snapshot(&self, _task_id: &str) -> Option<Vec<u8>> {
        Some(br#"{"phase":"quote"}"#.to_vec())
    }
}

/// Reports the time in Tokyo immediately.
pub struct ClockWorker;

#[async_trait]
impl Worker for ClockWorker {
    async fn start(
        &self,
        task_id: &str,
        _message: &Message,
        _resumed_state: Option<Vec<u8>>,
    ) -> Result<WorkerStream> {
        let artifact_id = format!("time-{task_id}");
        Ok(Box::pin(async_stream::stream! {
            yield WorkerItem::PartialArtifact {
                artifact_id,
                part: Part::text("The time in Tokyo is 09:14 JST"),
                is_last: true,
            };
            yield WorkerItem::Final(vec![Part::text("The time in Tokyo is 09:14 JST")]);
        }))
    }

    async fn resume(&self, task_id: &str, message: &Message) -> Result<WorkerStream> {
        self.start(task_id, message, None).await
    }

    async fn cancel(&self, _task_id: &str) {}

    async fn snapshot(&self, _task_id: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Works until canceled; used by cancellation tests.
pub struct SlowWorker {
    stop: watch::Sender<bool>,
}

impl SlowWorker {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self { stop }
    }
}

impl Default for SlowWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Worker for SlowWorker {
    async fn start(
        &self,
        _task_id: &str,
        _message: &Message,
        _resumed_state: Option<Vec<u8>>,
    ) -> Result<WorkerStream> {
        let mut stop = self.stop.subscribe();
        Ok(Box::pin(async_stream::stream! {
            yield WorkerItem::Thinking("this will take a while".to_string());
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(30)) => {
                    yield WorkerItem::Final(vec![Part::text("done at last")]);
                }
                _ = async {
                    loop {
                        if *stop.borrow() {
                            break;
                        }
                        if stop.changed().await.is_err() {
                            break;
                        }
                    }
                } => {}
            }
        }))
    }

    async fn resume(&self, task_id: &str, message: &Message) -> Result<WorkerStream> {
        self.start(task_id, message, None).await
    }

    async fn cancel(&self, _task_id: &str) {
        let _ = self.stop.send(true);
    }

    async fn snapshot(&self, _task_id: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Emits a burst of progress messages; used to exercise replay windows.
pub struct ChattyWorker {
    pub messages: usize,
}

#[async_trait]
impl Worker for ChattyWorker {
    async fn start(
        &self,
        _task_id: &str,
        _message: &Message,
        _resumed_state: Option<Vec<u8>>,
    ) -> Result<WorkerStream> {
        let count = self.messages;
        Ok(Box::pin(async_stream::stream! {
            for i in 0..count {
                yield WorkerItem::Thinking(format!("progress {i}"));
            }
            yield WorkerItem::Final(vec![Part::text("chatty done")]);
        }))
    }

    async fn resume(&self, task_id: &str, message: &Message) -> Result<WorkerStream> {
        self.start(task_id, message, None).await
    }

    async fn cancel(&self, _task_id: &str) {}

    async fn snapshot(&self, _task_id: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Builds a card advertising currency skills.
pub fn currency_card() -> AgentCard {
    AgentCard::builder("Currency Agent", "http://localhost:0")
        .description("Exchange rates and conversions")
        .skill(AgentSkill::new(
            "convert",
            "Currency conversion",
            "Converts amounts between currencies",
            vec!["currency".to_string(), "exchange".to_string()],
        ))
        .build()
}

/// Builds a card advertising time skills.
pub fn clock_card() -> AgentCard {
    AgentCard::builder("Clock Agent", "http://localhost:0")
        .description("World clock")
        .skill(AgentSkill::new(
            "time",
            "World time",
            "Reports the current time anywhere",
            vec!["time".to_string()],
        ))
        .build()
}

/// Builds a card for an orchestrating node.
pub fn orchestrator_card() -> AgentCard {
    AgentCard::builder("Concierge", "http://localhost:0")
        .description("Delegates requests to specialist agents")
        .capabilities(AgentCapabilities::default())
        .skill(AgentSkill::new(
            "concierge",
            "General assistance",
            "Answers compound requests by delegating",
            vec!["general".to_string()],
        ))
        .build()
}

/// Spawns a node on an ephemeral port, returning its base URL.
///
/// The returned [`AgentNode`] must stay alive for the duration of the
/// test; dropping it stops the checkpoint flusher.
pub async fn spawn_node(
    config: NodeConfig,
    worker: Arc<dyn Worker>,
    card: AgentCard,
) -> (String, AgentNode) {
    let node = AgentNode::new(config, worker, card);
    serve(node).await
}

/// Spawns a node that shares an existing checkpoint store.
pub async fn spawn_node_with_checkpoints(
    config: NodeConfig,
    worker: Arc<dyn Worker>,
    card: AgentCard,
    checkpoints: Arc<colloquy::checkpoint::CheckpointStore>,
) -> (String, AgentNode) {
    let node = AgentNode::with_checkpoint_store(config, worker, card, checkpoints);
    serve(node).await
}

async fn serve(node: AgentNode) -> (String, AgentNode) {
    let router = node.router();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (format!("http://{addr}"), node)
}

/// Issues a JSON-RPC call and returns the full response value.
pub async fn rpc(base_url: &str, method: &str, params: serde_json::Value) -> serde_json::Value {
    rpc_with_token(base_url, method, params, None).await
}

/// Issues a JSON-RPC call with an optional bearer token.
pub async fn rpc_with_token(
    base_url: &str,
    method: &str,
    params: serde_json::Value,
    token: Option<&str>,
) -> serde_json::Value {
    let client = reqwest::Client::new();
    let mut request = client.post(base_url).json(&json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    }));
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    request
        .send()
        .await
        .expect("rpc transport")
        .json()
        .await
        .expect("rpc json")
}

/// Convenience accessor for `result`, panicking on JSON-RPC errors.
pub async fn rpc_result(
    base_url: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let response = rpc(base_url, method, params).await;
    assert!(
        response.get("error").is_none(),
        "unexpected rpc error: {response}"
    );
    response["result"].clone()
}

/// Polls `tasks/get` until the task reaches the given state.
pub async fn wait_for_state(
    base_url: &str,
    task_id: &str,
    state: &str,
    within: Duration,
) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let task = rpc_result(base_url, "tasks/get", json!({"id": task_id})).await;
        if task["status"]["state"] == state {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {task_id} did not reach '{state}' in time; last: {task}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Concatenated text of every artifact part on a task JSON value.
pub fn artifact_text(task: &serde_json::Value) -> String {
    task["artifacts"]
        .as_array()
        .map(|artifacts| {
            artifacts
                .iter()
                .flat_map(|a| a["parts"].as_array().cloned().unwrap_or_default())
                .filter_map(|p| p["text"].as_str().map(str::to_string))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}
