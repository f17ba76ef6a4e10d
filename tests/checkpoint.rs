//! Checkpointing and node recovery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use colloquy::checkpoint::CheckpointStore;
use colloquy::config::NodeConfig;
use colloquy::types::{Message, Task, TaskState, TaskStatus};
use common::*;

#[tokio::test]
async fn snapshots_written_on_transitions() {
    let checkpoints = Arc::new(CheckpointStore::in_memory());
    let (base, node) = spawn_node_with_checkpoints(
        NodeConfig::default(),
        Arc::new(CurrencyWorker),
        currency_card(),
        Arc::clone(&checkpoints),
    )
    .await;

    let task = rpc_result(
        &base,
        "message/send",
        json!({
            "message": {
                "messageId": uuid::Uuid::new_v4().to_string(),
                "role": "user",
                "parts": [{"kind": "text", "text": "USD to EUR"}],
            }
        }),
    )
    .await;
    let task_id = task["id"].as_str().unwrap().to_string();
    wait_for_state(&base, &task_id, "completed", Duration::from_secs(2)).await;

    let snapshot = node
        .checkpoints()
        .get_task_snapshot(&task_id)
        .await
        .unwrap()
        .expect("terminal snapshot persisted");
    assert_eq!(snapshot.state(), TaskState::Completed);
}

#[tokio::test]
async fn worker_state_checkpointed_before_pause() {
    let checkpoints = Arc::new(CheckpointStore::in_memory());
    let (base, node) = spawn_node_with_checkpoints(
        NodeConfig::default(),
        Arc::new(CurrencyWorker),
        currency_card(),
        Arc::clone(&checkpoints),
    )
    .await;

    let task = rpc_result(
        &base,
        "message/send",
        json!({
            "message": {
                "messageId": uuid::Uuid::new_v4().to_string(),
                "role": "user",
                "parts": [{"kind": "text", "text": "Convert 100 to EUR"}],
            }
        }),
    )
    .await;
    let task_id = task["id"].as_str().unwrap().to_string();
    wait_for_state(&base, &task_id, "input-required", Duration::from_secs(2)).await;

    // The task is bound to a worker thread whose state was persisted.
    let thread_id = node
        .checkpoints()
        .thread_for_task(&task_id)
        .await
        .unwrap()
        .expect("thread bound");
    let checkpoint = node
        .checkpoints()
        .get_worker_state(&thread_id)
        .await
        .unwrap()
        .expect("worker state persisted");
    assert_eq!(checkpoint.task_id, task_id);
    assert!(!checkpoint.worker_state.is_empty());
    // The binding is injective both ways.
    assert_eq!(
        node.checkpoints()
            .task_for_thread(&thread_id)
            .await
            .unwrap()
            .as_deref(),
        Some(task_id.as_str())
    );
}

#[tokio::test]
async fn recovery_resumes_working_tasks() {
    let checkpoints = Arc::new(CheckpointStore::in_memory());

    // Simulate a node that died mid-task: a working snapshot with the
    // user's request in history.
    let mut interrupted = Task::new("t-interrupted", "ctx-r");
    interrupted.push_message(Message::user_text("USD to EUR").with_task_id("t-interrupted"));
    interrupted.set_status(TaskStatus::working());
    checkpoints.put_task_snapshot(&interrupted).await.unwrap();

    let (base, node) = spawn_node_with_checkpoints(
        NodeConfig::default(),
        Arc::new(CurrencyWorker),
        currency_card(),
        checkpoints,
    )
    .await;
    let resumed = node.recover().await.unwrap();
    assert_eq!(resumed, 1);

    let done = wait_for_state(&base, "t-interrupted", "completed", Duration::from_secs(2)).await;
    assert_eq!(artifact_text(&done), "1 USD = 0.92 EUR");
}

#[tokio::test]
async fn recovery_leaves_paused_tasks_waiting() {
    let checkpoints = Arc::new(CheckpointStore::in_memory());

    let mut paused = Task::new("t-paused", "ctx-r");
    paused.push_message(Message::user_text("Convert 100 to EUR").with_task_id("t-paused"));
    paused.set_status(TaskStatus::working());
    paused.set_status(TaskStatus::input_required("Which currency?"));
    checkpoints.put_task_snapshot(&paused).await.unwrap();

    let (base, node) = spawn_node_with_checkpoints(
        NodeConfig::default(),
        Arc::new(CurrencyWorker),
        currency_card(),
        checkpoints,
    )
    .await;
    let resumed = node.recover().await.unwrap();
    assert_eq!(resumed, 0);

    // Still parked, awaiting the caller.
    let task = rpc_result(&base, "tasks/get", json!({"id": "t-paused"})).await;
    assert_eq!(task["status"]["state"], "input-required");

    // The follow-up completes it.
    let follow_up = json!({
        "message": {
            "messageId": uuid::Uuid::new_v4().to_string(),
            "role": "user",
            "parts": [{"kind": "text", "text": "USD"}],
            "taskId": "t-paused",
        }
    });
    rpc_result(&base, "message/send", follow_up).await;
    wait_for_state(&base, "t-paused", "completed", Duration::from_secs(2)).await;
}

#[tokio::test]
async fn unrecoverable_worker_fails_the_task() {
    let checkpoints = Arc::new(CheckpointStore::in_memory());

    // A working task with no user message to restart from.
    let mut hollow = Task::new("t-hollow", "ctx-r");
    hollow.set_status(TaskStatus::working());
    checkpoints.put_task_snapshot(&hollow).await.unwrap();

    let (base, node) = spawn_node_with_checkpoints(
        NodeConfig::default(),
        Arc::new(CurrencyWorker),
        currency_card(),
        checkpoints,
    )
    .await;
    node.recover().await.unwrap();

    let task = rpc_result(&base, "tasks/get", json!({"id": "t-hollow"})).await;
    assert_eq!(task["status"]["state"], "failed");
    let cause = task["status"]["message"]["parts"][0]["text"].as_str().unwrap();
    assert!(cause.contains("unrecoverable"));
}

#[tokio::test]
async fn terminal_tasks_not_rehydrated() {
    let checkpoints = Arc::new(CheckpointStore::in_memory());

    let mut done = Task::new("t-done", "ctx-r");
    done.set_status(TaskStatus::working());
    done.set_status(TaskStatus::completed());
    checkpoints.put_task_snapshot(&done).await.unwrap();

    let (base, node) = spawn_node_with_checkpoints(
        NodeConfig::default(),
        Arc::new(CurrencyWorker),
        currency_card(),
        checkpoints,
    )
    .await;
    node.recover().await.unwrap();

    // The terminal task is not in the live store.
    let response = rpc(&base, "tasks/get", json!({"id": "t-done"})).await;
    assert_eq!(response["error"]["code"], -32001);
}
