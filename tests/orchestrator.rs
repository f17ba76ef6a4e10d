//! Orchestrator fan-out, aggregation order, input bubbling, and the
//! cancel cascade.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use colloquy::client::PeerClient;
use colloquy::config::{NodeConfig, PeerConfig, TimeoutConfig};
use colloquy::orchestrator::{Coordinator, KeywordPlanner, PeerRegistry};
use colloquy::server::AgentNode;
use colloquy::types::{Event, Message, TaskState};
use colloquy::worker::Worker;
use common::*;

async fn spawn_orchestrator(
    peers: Vec<(String, String, Vec<String>)>,
) -> (String, AgentNode) {
    let registry = Arc::new(PeerRegistry::from_entries(peers));
    let planner = Arc::new(KeywordPlanner::new());
    let client = Arc::new(PeerClient::new(TimeoutConfig::default()).unwrap());
    let coordinator: Arc<dyn Worker> = Arc::new(Coordinator::new(planner, registry, client));

    let mut config = NodeConfig::default();
    config.worker.cancel_grace_ms = 1_000;
    spawn_node(config, coordinator, orchestrator_card()).await
}

fn ask(text: &str) -> serde_json::Value {
    json!({
        "message": {
            "messageId": uuid::Uuid::new_v4().to_string(),
            "role": "user",
            "parts": [{"kind": "text", "text": text}],
        }
    })
}

#[tokio::test]
async fn fan_out_aggregates_in_plan_order() {
    let (currency_base, _currency) = spawn_node(
        NodeConfig::default(),
        Arc::new(CurrencyWorker),
        currency_card(),
    )
    .await;
    let (clock_base, _clock) =
        spawn_node(NodeConfig::default(), Arc::new(ClockWorker), clock_card()).await;

    let (base, _node) = spawn_orchestrator(vec![
        (
            "currency".into(),
            currency_base,
            vec!["currency".into(), "exchange".into()],
        ),
        ("clock".into(), clock_base, vec!["time".into()]),
    ])
    .await;

    let client = PeerClient::new(TimeoutConfig::default()).unwrap();
    let stream = client
        .stream(
            &base,
            Message::user_text("What's the USD/EUR currency rate and the time in Tokyo?"),
        )
        .await
        .unwrap();
    let events = colloquy::client::collect_stream(stream).await.unwrap();

    // Peer progress was forwarded upward, prefixed by step id.
    let forwarded: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.event {
            Event::Message(m) => m.text_content(),
            _ => None,
        })
        .filter(|t| t.starts_with("[step-"))
        .collect();
    assert!(!forwarded.is_empty(), "no forwarded peer events");

    // The stream ends completed.
    let last = events.last().unwrap();
    assert!(last.event.is_final());

    // The synthesis contains both answers, in plan order: the currency
    // step precedes the time step even though the clock peer answers
    // instantly and the currency peer does not.
    let task_id = events[0].event.task_id().unwrap().to_string();
    let task = rpc_result(&base, "tasks/get", json!({"id": task_id})).await;
    let text = artifact_text(&task);
    let usd = text.find("1 USD = 0.92 EUR").expect("currency answer");
    let tokyo = text.find("Tokyo").expect("time answer");
    assert!(usd < tokyo, "aggregation must follow plan order: {text}");
}

#[tokio::test]
async fn registry_discovers_skills_from_peer_cards() {
    let (clock_base, _clock) =
        spawn_node(NodeConfig::default(), Arc::new(ClockWorker), clock_card()).await;

    let client = PeerClient::new(TimeoutConfig::default()).unwrap();
    let configs = vec![PeerConfig {
        name: "clock".into(),
        base_url: clock_base,
        credentials: None,
        skills_override: None,
    }];
    let registry = PeerRegistry::discover(&configs, &client).await.unwrap();

    assert_eq!(registry.len(), 1);
    let selected = registry.select("time", "step-1").expect("tag from card");
    assert_eq!(selected.name, "clock");
    assert!(registry.select("currency", "step-1").is_none());
}

#[tokio::test]
async fn required_step_failure_fails_the_outer_task() {
    // Reserve a port, then close it so the peer is unreachable.
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    };

    let (base, _node) =
        spawn_orchestrator(vec![("ghost".into(), dead, vec!["time".into()])]).await;

    let task = rpc_result(&base, "message/send", ask("what time is it?")).await;
    let task_id = task["id"].as_str().unwrap().to_string();

    let failed = wait_for_state(&base, &task_id, "failed", Duration::from_secs(5)).await;
    let cause = failed["status"]["message"]["parts"][0]["text"]
        .as_str()
        .unwrap();
    assert!(cause.contains("worker error"));
}

#[tokio::test]
async fn unroutable_request_fails_planning() {
    let (clock_base, _clock) =
        spawn_node(NodeConfig::default(), Arc::new(ClockWorker), clock_card()).await;
    let (base, _node) =
        spawn_orchestrator(vec![("clock".into(), clock_base, vec!["time".into()])]).await;

    let task = rpc_result(&base, "message/send", ask("order me a pizza")).await;
    let task_id = task["id"].as_str().unwrap().to_string();
    wait_for_state(&base, &task_id, "failed", Duration::from_secs(2)).await;
}

#[tokio::test]
async fn peer_input_required_bubbles_up_and_resumes() {
    let (currency_base, _currency) = spawn_node(
        NodeConfig::default(),
        Arc::new(CurrencyWorker),
        currency_card(),
    )
    .await;
    let (base, _node) = spawn_orchestrator(vec![(
        "currency".into(),
        currency_base,
        vec!["currency".into()],
    )])
    .await;

    // Ambiguous request matching the currency skill.
    let client = PeerClient::new(TimeoutConfig::default()).unwrap();
    let mut stream = client
        .stream(&base, Message::user_text("currency: convert 100 to EUR"))
        .await
        .unwrap();

    let mut task_id = None;
    let mut prompt = None;
    while let Some(item) = stream.next().await {
        let sequenced = item.unwrap();
        if task_id.is_none() {
            task_id = sequenced.event.task_id().map(str::to_string);
        }
        if let Event::StatusUpdate(ref update) = sequenced.event {
            if update.status.state == TaskState::InputRequired {
                prompt = update
                    .status
                    .message
                    .as_ref()
                    .and_then(Message::text_content);
                break;
            }
        }
    }
    drop(stream);
    let task_id = task_id.unwrap();
    // The prompt names the waiting peer and step.
    let prompt = prompt.expect("input prompt");
    assert!(prompt.contains("step-1"), "prompt was: {prompt}");
    assert!(prompt.contains("currency"));

    // Answering the outer task forwards to the peer and finishes.
    let follow_up = json!({
        "message": {
            "messageId": uuid::Uuid::new_v4().to_string(),
            "role": "user",
            "parts": [{"kind": "text", "text": "USD"}],
            "taskId": task_id,
        }
    });
    rpc_result(&base, "message/send", follow_up).await;

    let done = wait_for_state(&base, &task_id, "completed", Duration::from_secs(3)).await;
    assert!(artifact_text(&done).contains("1 USD = 0.92 EUR"));
}

#[tokio::test]
async fn cancel_cascades_to_peer_tasks() {
    let mut peer_config = NodeConfig::default();
    peer_config.worker.cancel_grace_ms = 500;
    let (slow_base, _slow) = spawn_node(
        peer_config,
        Arc::new(SlowWorker::new()),
        clock_card(),
    )
    .await;

    let (base, _node) =
        spawn_orchestrator(vec![("slow".into(), slow_base.clone(), vec!["time".into()])]).await;

    let client = PeerClient::new(TimeoutConfig::default()).unwrap();
    let mut stream = client
        .stream(&base, Message::user_text("what's the time?"))
        .await
        .unwrap();

    // Wait until the peer dispatch is visibly underway.
    let mut task_id = None;
    while let Some(item) = stream.next().await {
        let sequenced = item.unwrap();
        if task_id.is_none() {
            task_id = sequenced.event.task_id().map(str::to_string);
        }
        if matches!(&sequenced.event, Event::Message(m)
            if m.text_content().is_some_and(|t| t.starts_with("[step-")))
        {
            break;
        }
    }
    let task_id = task_id.unwrap();

    let canceled = rpc_result(&base, "tasks/cancel", json!({"id": task_id})).await;
    assert_eq!(canceled["status"]["state"], "canceled");

    // The peer's task was canceled too, within the grace window.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let page = rpc_result(&slow_base, "tasks/list", json!({"state": "canceled"})).await;
        if !page["tasks"].as_array().unwrap().is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "peer task was not canceled"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Nothing further arrives on the outer stream after the final event.
    let tail = colloquy::client::collect_stream(stream).await.unwrap();
    if let Some(last) = tail.last() {
        assert!(last.event.is_final());
    }
}
