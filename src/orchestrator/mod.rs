//! The orchestrator coordinator.
//!
//! An orchestrating node's worker: it decomposes a request into a plan,
//! routes each step to a peer agent, fans dispatches out over the peer
//! client, forwards peer progress upward onto the outer task, and
//! synthesizes the step outputs in plan order, so the result never
//! depends on which peer finished first.

mod plan;
mod router;

pub use plan::{KeywordPlanner, PeerSkills, Plan, Planner, Step, StepOutput};
pub use router::{PeerEntry, PeerRegistry};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::client::PeerClient;
use crate::error::{CoreError, Result, WorkerError, WorkerErrorKind};
use crate::types::{Event, Message, Part, TaskState};
use crate::worker::{Worker, WorkerItem, WorkerStream};

/// Default fan-out parallelism.
pub const DEFAULT_STEP_CONCURRENCY: usize = 4;

/// The coordinator, pluggable wherever a [`Worker`] is expected.
pub struct Coordinator {
    engine: Arc<Engine>,
}

impl Coordinator {
    /// Creates a coordinator over its brain, peers, and client.
    pub fn new(
        planner: Arc<dyn Planner>,
        registry: Arc<PeerRegistry>,
        client: Arc<PeerClient>,
    ) -> Self {
        Self::with_concurrency(planner, registry, client, DEFAULT_STEP_CONCURRENCY)
    }

    /// Creates a coordinator with an explicit fan-out limit.
    pub fn with_concurrency(
        planner: Arc<dyn Planner>,
        registry: Arc<PeerRegistry>,
        client: Arc<PeerClient>,
        concurrency: usize,
    ) -> Self {
        Self {
            engine: Arc::new(Engine {
                planner,
                registry,
                client,
                concurrency: concurrency.max(1),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }
}

#[async_trait]
impl Worker for Coordinator {
    async fn start(
        &self,
        task_id: &str,
        message: &Message,
        resumed_state: Option<Vec<u8>>,
    ) -> Result<WorkerStream> {
        let (tx, rx) = mpsc::channel(64);
        let engine = Arc::clone(&self.engine);
        let task_id = task_id.to_string();
        let message = message.clone();
        tokio::spawn(async move {
            engine.run_start(task_id, message, resumed_state, tx).await;
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn resume(&self, task_id: &str, message: &Message) -> Result<WorkerStream> {
        let (tx, rx) = mpsc::channel(64);
        let engine = Arc::clone(&self.engine);
        let task_id = task_id.to_string();
        let message = message.clone();
        tokio::spawn(async move {
            engine.run_resume(task_id, message, tx).await;
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn cancel(&self, task_id: &str) {
        self.engine.cancel(task_id).await;
    }

    async fn snapshot(&self, task_id: &str) -> Option<Vec<u8>> {
        self.engine.snapshot(task_id).await
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").finish_non_exhaustive()
    }
}

/// Where a paused session left off.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WaitingStep {
    step_id: String,
    peer_name: String,
    base_url: String,
    peer_task_id: String,
    last_seq: Option<u64>,
}

/// Serializable session progress; also the worker-state checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionCore {
    plan: Plan,
    outputs: HashMap<String, StepOutput>,
    completed: HashSet<String>,
    waiting: Option<WaitingStep>,
}

struct Session {
    request: Message,
    context_id: Option<String>,
    core: Mutex<SessionCore>,
    live_peers: Mutex<Vec<(String, String)>>,
    canceled: AtomicBool,
}

struct Engine {
    planner: Arc<dyn Planner>,
    registry: Arc<PeerRegistry>,
    client: Arc<PeerClient>,
    concurrency: usize,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

enum StepResult {
    Done(StepOutput),
    NeedsInput { prompt: String, waiting: WaitingStep },
    Failed { step: Step, error: String },
}

impl Engine {
    async fn session(&self, task_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(task_id).cloned()
    }

    async fn run_start(
        self: Arc<Self>,
        task_id: String,
        message: Message,
        resumed_state: Option<Vec<u8>>,
        tx: mpsc::Sender<WorkerItem>,
    ) {
        let core = match resumed_state
            .as_deref()
            .map(serde_json::from_slice::<SessionCore>)
        {
            Some(Ok(core)) => Some(core),
            Some(Err(e)) => {
                warn!(task_id = %task_id, error = %e, "Discarding undecodable session state");
                None
            }
            None => None,
        };

        let session = Arc::new(Session {
            context_id: message.context_id.clone(),
            request: message.clone(),
            core: Mutex::new(core.unwrap_or_default()),
            live_peers: Mutex::new(Vec::new()),
            canceled: AtomicBool::new(false),
        });
        self.sessions
            .lock()
            .await
            .insert(task_id.clone(), Arc::clone(&session));

        if session.core.lock().await.plan.steps.is_empty() {
            let plan = match self.plan(&message).await {
                Ok(plan) => plan,
                Err(e) => {
                    let _ = tx
                        .send(WorkerItem::Error(WorkerError::new(
                            WorkerErrorKind::PlanningFailed,
                            e.to_string(),
                        )))
                        .await;
                    self.sessions.lock().await.remove(&task_id);
                    return;
                }
            };
            info!(task_id = %task_id, steps = plan.steps.len(), "Plan ready");
            let _ = tx
                .send(WorkerItem::Thinking(format!(
                    "Delegating {} step(s) to peer agents",
                    plan.steps.len()
                )))
                .await;
            session.core.lock().await.plan = plan;
        }

        self.execute_and_finish(task_id, session, tx).await;
    }

    async fn run_resume(
        self: Arc<Self>,
        task_id: String,
        message: Message,
        tx: mpsc::Sender<WorkerItem>,
    ) {
        let Some(session) = self.session(&task_id).await else {
            let _ = tx
                .send(WorkerItem::Error(WorkerError::internal(
                    "no orchestration in progress for this task",
                )))
                .await;
            return;
        };
        let waiting = session.core.lock().await.waiting.take();
        let Some(waiting) = waiting else {
            let _ = tx
                .send(WorkerItem::Error(WorkerError::internal(
                    "task was not awaiting input",
                )))
                .await;
            return;
        };

        // Forward the follow-up to the peer that asked for it, against
        // the peer's original task id.
        let mut forward = message;
        forward.task_id = Some(waiting.peer_task_id.clone());
        let _ = tx
            .send(WorkerItem::Thinking(format!(
                "[{}] forwarding input to {}",
                waiting.step_id, waiting.peer_name
            )))
            .await;
        if let Err(e) = self.client.send(&waiting.base_url, forward).await {
            let _ = tx
                .send(WorkerItem::Error(WorkerError::new(
                    WorkerErrorKind::ToolFailed,
                    format!("peer refused forwarded input: {e}"),
                )))
                .await;
            self.sessions.lock().await.remove(&task_id);
            return;
        }

        // Rejoin the peer stream where we left it and finish the step.
        let step = {
            let core = session.core.lock().await;
            core.plan.step(&waiting.step_id).cloned()
        };
        let Some(step) = step else {
            let _ = tx
                .send(WorkerItem::Error(WorkerError::internal(
                    "waiting step vanished from plan",
                )))
                .await;
            return;
        };
        let result = match self
            .client
            .resubscribe(&waiting.base_url, &waiting.peer_task_id, waiting.last_seq)
            .await
        {
            Ok(stream) => {
                self.consume_step_stream(&session, &step, &waiting.peer_name, &waiting.base_url, stream, &tx)
                    .await
            }
            Err(e) => StepResult::Failed {
                step: step.clone(),
                error: e.to_string(),
            },
        };
        match self.record_result(&session, result, &tx).await {
            Flow::Break => {
                self.sessions.lock().await.remove(&task_id);
                return;
            }
            // The peer asked for input again; park and wait for the
            // next resume.
            Flow::Pause => return,
            Flow::Continue => {}
        }

        self.execute_and_finish(task_id, session, tx).await;
    }

    async fn plan(&self, message: &Message) -> Result<Plan> {
        let plan = self
            .planner
            .plan(message, &self.registry.skills())
            .await?;
        plan.validate()?;
        if plan.steps.is_empty() {
            return Err(WorkerError::new(
                WorkerErrorKind::PlanningFailed,
                "planner produced an empty plan",
            )
            .into());
        }
        Ok(plan)
    }

    /// Runs dependency waves until the plan is exhausted, then
    /// synthesizes. Pauses (without a terminal item) when a peer needs
    /// input; stops silently when canceled.
    async fn execute_and_finish(
        &self,
        task_id: String,
        session: Arc<Session>,
        tx: mpsc::Sender<WorkerItem>,
    ) {
        loop {
            if session.canceled.load(Ordering::SeqCst) {
                self.sessions.lock().await.remove(&task_id);
                return;
            }

            let ready: Vec<Step> = {
                let core = session.core.lock().await;
                let pending: Vec<&Step> = core
                    .plan
                    .steps
                    .iter()
                    .filter(|s| !core.completed.contains(&s.step_id))
                    .collect();
                if pending.is_empty() {
                    break;
                }
                let ready: Vec<Step> = pending
                    .iter()
                    .filter(|s| s.depends_on.iter().all(|d| core.completed.contains(d)))
                    .map(|s| (*s).clone())
                    .collect();
                if ready.is_empty() {
                    let _ = tx
                        .send(WorkerItem::Error(WorkerError::new(
                            WorkerErrorKind::PlanningFailed,
                            "plan has a dependency cycle",
                        )))
                        .await;
                    self.sessions.lock().await.remove(&task_id);
                    return;
                }
                ready
            };

            let mut wave: FuturesUnordered<_> = FuturesUnordered::new();
            let mut queue = ready.into_iter();
            for step in queue.by_ref().take(self.concurrency) {
                wave.push(self.execute_step(Arc::clone(&session), step, tx.clone()));
            }
            let mut results = Vec::new();
            while let Some(result) = wave.next().await {
                results.push(result);
                if let Some(step) = queue.next() {
                    wave.push(self.execute_step(Arc::clone(&session), step, tx.clone()));
                }
            }
            drop(wave);

            if session.canceled.load(Ordering::SeqCst) {
                self.sessions.lock().await.remove(&task_id);
                return;
            }
            let mut paused = false;
            for result in results {
                match self.record_result(&session, result, &tx).await {
                    Flow::Continue => {}
                    Flow::Pause => paused = true,
                    Flow::Break => {
                        self.sessions.lock().await.remove(&task_id);
                        return;
                    }
                }
            }
            if paused {
                // The outer task parks in input-required; resume() picks
                // the plan back up.
                return;
            }
        }

        if session.canceled.load(Ordering::SeqCst) {
            self.sessions.lock().await.remove(&task_id);
            return;
        }

        // Aggregate strictly in plan order.
        let outputs: Vec<StepOutput> = {
            let core = session.core.lock().await;
            core.plan
                .steps
                .iter()
                .filter_map(|s| core.outputs.get(&s.step_id).cloned())
                .collect()
        };
        match self.planner.synthesize(&session.request, &outputs).await {
            Ok(parts) => {
                // The synthesis is also the task's artifact.
                let artifact_id = uuid::Uuid::new_v4().to_string();
                let total = parts.len();
                for (i, part) in parts.iter().enumerate() {
                    let _ = tx
                        .send(WorkerItem::PartialArtifact {
                            artifact_id: artifact_id.clone(),
                            part: part.clone(),
                            is_last: i + 1 == total,
                        })
                        .await;
                }
                let _ = tx.send(WorkerItem::Final(parts)).await;
            }
            Err(e) => {
                let _ = tx
                    .send(WorkerItem::Error(WorkerError::new(
                        WorkerErrorKind::PlanningFailed,
                        format!("synthesis failed: {e}"),
                    )))
                    .await;
            }
        }
        self.sessions.lock().await.remove(&task_id);
    }

    /// Applies one step result to the session.
    async fn record_result(
        &self,
        session: &Arc<Session>,
        result: StepResult,
        tx: &mpsc::Sender<WorkerItem>,
    ) -> Flow {
        match result {
            StepResult::Done(output) => {
                let mut core = session.core.lock().await;
                core.completed.insert(output.step_id.clone());
                core.outputs.insert(output.step_id.clone(), output);
                Flow::Continue
            }
            StepResult::NeedsInput { prompt, waiting } => {
                let mut core = session.core.lock().await;
                core.waiting = Some(waiting.clone());
                drop(core);
                let _ = tx
                    .send(WorkerItem::NeedsInput {
                        prompt: format!(
                            "Peer '{}' (step {}) needs input: {prompt}",
                            waiting.peer_name, waiting.step_id
                        ),
                    })
                    .await;
                Flow::Pause
            }
            StepResult::Failed { step, error } => {
                if step.required {
                    warn!(step_id = %step.step_id, error = %error, "Required step failed");
                    let _ = tx
                        .send(WorkerItem::Error(WorkerError::new(
                            WorkerErrorKind::ToolFailed,
                            format!("step '{}' failed: {error}", step.step_id),
                        )))
                        .await;
                    return Flow::Break;
                }
                debug!(step_id = %step.step_id, error = %error, "Optional step omitted");
                let mut core = session.core.lock().await;
                core.completed.insert(step.step_id.clone());
                core.outputs.insert(
                    step.step_id.clone(),
                    StepOutput {
                        step_id: step.step_id.clone(),
                        parts: Vec::new(),
                        omitted: Some(error),
                    },
                );
                Flow::Continue
            }
        }
    }

    /// Dispatches one step, with the per-step retry policy: one retry
    /// on timeout/unreachable, none when the peer itself failed.
    async fn execute_step(
        &self,
        session: Arc<Session>,
        step: Step,
        tx: mpsc::Sender<WorkerItem>,
    ) -> StepResult {
        let mut attempt = 0u32;
        loop {
            if session.canceled.load(Ordering::SeqCst) {
                return StepResult::Failed {
                    step,
                    error: "canceled".to_string(),
                };
            }
            let Some(peer) = self.registry.select(&step.target_skill, &step.step_id) else {
                return StepResult::Failed {
                    error: format!("no peer advertises skill '{}'", step.target_skill),
                    step,
                };
            };

            let mut message = Message::user_text(step.input.clone());
            if let Some(ref context_id) = session.context_id {
                message = message.with_context_id(context_id.clone());
            }

            peer.begin_dispatch();
            let outcome = match self.client.stream(&peer.base_url, message).await {
                Ok(stream) => {
                    Ok(self
                        .consume_step_stream(&session, &step, &peer.name, &peer.base_url, stream, &tx)
                        .await)
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(result) => {
                    let transient_failure = matches!(
                        &result,
                        StepResult::Failed { error, .. } if retryable(error)
                    );
                    peer.end_dispatch(!matches!(result, StepResult::Failed { .. }));
                    if transient_failure && attempt == 0 {
                        attempt += 1;
                        debug!(step_id = %step.step_id, "Retrying step after transient failure");
                        continue;
                    }
                    return result;
                }
                Err(e) => {
                    peer.end_dispatch(false);
                    let transient = matches!(&e, CoreError::Peer(p) if p.is_retryable());
                    if transient && attempt == 0 {
                        attempt += 1;
                        continue;
                    }
                    return StepResult::Failed {
                        step,
                        error: e.to_string(),
                    };
                }
            }
        }
    }

    /// Consumes a peer stream for one step, forwarding progress upward
    /// and accumulating the step's output.
    async fn consume_step_stream(
        &self,
        session: &Arc<Session>,
        step: &Step,
        peer_name: &str,
        base_url: &str,
        mut stream: crate::client::PeerEventStream,
        tx: &mpsc::Sender<WorkerItem>,
    ) -> StepResult {
        let mut peer_task_id: Option<String> = None;
        let mut last_seq: Option<u64> = None;
        let mut last_message_parts: Vec<Part> = Vec::new();
        let mut artifact_parts: Vec<Part> = Vec::new();

        while let Some(item) = stream.next().await {
            if session.canceled.load(Ordering::SeqCst) {
                return StepResult::Failed {
                    step: step.clone(),
                    error: "canceled".to_string(),
                };
            }
            let sequenced = match item {
                Ok(s) => s,
                Err(e) => {
                    return StepResult::Failed {
                        step: step.clone(),
                        error: e.to_string(),
                    };
                }
            };
            if sequenced.seq > 0 {
                last_seq = Some(sequenced.seq);
            }
            if peer_task_id.is_none() {
                if let Some(tid) = sequenced.event.task_id() {
                    peer_task_id = Some(tid.to_string());
                    session
                        .live_peers
                        .lock()
                        .await
                        .push((base_url.to_string(), tid.to_string()));
                }
            }

            match &sequenced.event {
                Event::Message(message) => {
                    if let Some(text) = message.text_content() {
                        let _ = tx
                            .send(WorkerItem::Thinking(format!("[{}] {text}", step.step_id)))
                            .await;
                    }
                    last_message_parts = message.parts.clone();
                }
                Event::ArtifactUpdate(update) => {
                    artifact_parts.extend(update.artifact.parts.iter().cloned());
                }
                Event::StatusUpdate(update) => {
                    let state = update.status.state;
                    match state {
                        TaskState::InputRequired | TaskState::AuthRequired => {
                            let prompt = update
                                .status
                                .message
                                .as_ref()
                                .and_then(Message::text_content)
                                .unwrap_or_else(|| "additional input required".to_string());
                            let Some(peer_task_id) = peer_task_id.clone() else {
                                return StepResult::Failed {
                                    step: step.clone(),
                                    error: "peer paused before announcing its task".into(),
                                };
                            };
                            return StepResult::NeedsInput {
                                prompt,
                                waiting: WaitingStep {
                                    step_id: step.step_id.clone(),
                                    peer_name: peer_name.to_string(),
                                    base_url: base_url.to_string(),
                                    peer_task_id,
                                    last_seq,
                                },
                            };
                        }
                        TaskState::Completed => {
                            // The peer's final message is the step output;
                            // artifacts only stand in when there was none.
                            let parts = if last_message_parts.is_empty() {
                                artifact_parts
                            } else {
                                last_message_parts
                            };
                            return StepResult::Done(StepOutput {
                                step_id: step.step_id.clone(),
                                parts,
                                omitted: None,
                            });
                        }
                        TaskState::Failed | TaskState::Rejected | TaskState::Canceled => {
                            return StepResult::Failed {
                                step: step.clone(),
                                error: format!("peer task ended {state:?}"),
                            };
                        }
                        _ => {
                            let _ = tx
                                .send(WorkerItem::Thinking(format!(
                                    "[{}] {peer_name}: {state:?}",
                                    step.step_id
                                )))
                                .await;
                        }
                    }
                }
                Event::TaskSnapshot(_) => {}
            }
        }

        StepResult::Failed {
            step: step.clone(),
            error: "peer stream ended without a final status".to_string(),
        }
    }

    /// Cancels the outer task: flags the session and cancels every
    /// in-flight peer task.
    async fn cancel(&self, task_id: &str) {
        let Some(session) = self.session(task_id).await else {
            return;
        };
        session.canceled.store(true, Ordering::SeqCst);
        let peers: Vec<(String, String)> = session.live_peers.lock().await.clone();
        for (base_url, peer_task_id) in peers {
            let client = Arc::clone(&self.client);
            tokio::spawn(async move {
                if let Err(e) = client.cancel(&base_url, &peer_task_id).await {
                    debug!(peer_task_id = %peer_task_id, error = %e, "Peer cancel failed");
                }
            });
        }
        info!(task_id = %task_id, "Orchestration canceled");
    }

    /// Serializes the session's progress for checkpointing.
    async fn snapshot(&self, task_id: &str) -> Option<Vec<u8>> {
        let session = self.session(task_id).await?;
        let core = session.core.lock().await;
        serde_json::to_vec(&*core).ok()
    }
}

enum Flow {
    Continue,
    Pause,
    Break,
}

/// Transient failures worth one retry: the peer was unreachable or the
/// call timed out, as opposed to the peer actively failing the task.
fn retryable(error: &str) -> bool {
    error.contains("unreachable") || error.contains("timeout") || error.contains("timed out")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(retryable("unreachable: connection refused"));
        assert!(retryable("timeout: deadline exceeded"));
        assert!(!retryable("remote_failed: peer task ended Failed"));
    }

    #[test]
    fn test_session_core_roundtrip() {
        let mut core = SessionCore::default();
        core.plan.steps.push(Step {
            step_id: "s1".into(),
            description: "d".into(),
            depends_on: vec![],
            target_skill: "currency".into(),
            input: "USD to EUR".into(),
            required: true,
        });
        core.completed.insert("s1".into());
        core.outputs.insert(
            "s1".into(),
            StepOutput {
                step_id: "s1".into(),
                parts: vec![Part::text("1 USD = 0.92 EUR")],
                omitted: None,
            },
        );

        let bytes = serde_json::to_vec(&core).unwrap();
        let restored: SessionCore = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(restored.plan, core.plan);
        assert!(restored.completed.contains("s1"));
    }
}
