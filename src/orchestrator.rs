//! Main orchestrator - fans a query out to the retrieval agents and fuses
//! whatever comes back.
//!
//! Workflow per query: initiate (task + conversation) → dispatch one TASK
//! envelope per agent concurrently → collect replies until all resolve, the
//! conversation deadline passes, or the task is cancelled → fuse → optional
//! synthesis → finalize.
//!
//! Cancellation is advisory. Agents are never interrupted; the collector
//! stops waiting and anything that arrives afterwards is dropped unread.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentHandle, AgentKind, RetrievalAgent, RetrievalBackend};
use crate::channel::TaskSubscription;
use crate::config::{DocketConfig, OrchestratorSection};
use crate::conversation::{Conversation, ConversationHandle};
use crate::envelope::{
    AgentId, AgentResult, ConversationId, Envelope, ErrorReason, EventPayload, MessageType,
    TaskId, TaskPayload,
};
use crate::error::{DocketError, Result, SynthesisError};
use crate::fusion::{fuse, FusedItem, FusionConfig};
use crate::router::Router;
use crate::tracker::{AgentOutcome, Artifact, OutcomeStatus, Task, TaskState, TaskTracker};

const PROGRESS_DISPATCHED: u8 = 10;
const PROGRESS_COLLECTED: u8 = 80;
const PROGRESS_FUSED: u8 = 90;

type StrategyParams = serde_json::Map<String, serde_json::Value>;

/// External text generator producing prose with inline citations
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, query: &str, items: &[FusedItem]) -> std::result::Result<String, SynthesisError>;
}

/// A user query and its strategy parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    /// Sent to every agent
    #[serde(default)]
    pub strategy_params: StrategyParams,
    /// Per-agent overrides, merged over `strategy_params`
    #[serde(default)]
    pub agent_params: BTreeMap<AgentKind, StrategyParams>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.strategy_params.insert(key.into(), value.into());
        self
    }

    pub fn with_agent_param(
        mut self,
        kind: AgentKind,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.agent_params
            .entry(kind)
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    /// Parameters for one agent: shared ones overlaid with its overrides
    pub fn params_for(&self, kind: AgentKind) -> StrategyParams {
        let mut params = self.strategy_params.clone();
        if let Some(overrides) = self.agent_params.get(&kind) {
            for (key, value) in overrides {
                params.insert(key.clone(), value.clone());
            }
        }
        params
    }
}

/// Drives queries end to end
pub struct Orchestrator {
    router: Arc<Router>,
    tracker: Arc<TaskTracker>,
    /// Live conversations
    conversations: RwLock<HashMap<ConversationId, ConversationHandle>>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    settings: OrchestratorSection,
    fusion: FusionConfig,
    sender: AgentId,
}

impl Orchestrator {
    /// Create an orchestrator over an existing router and tracker
    pub fn new(router: Arc<Router>, tracker: Arc<TaskTracker>, config: &DocketConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            router,
            tracker,
            conversations: RwLock::new(HashMap::new()),
            synthesizer: None,
            settings: config.orchestrator.clone(),
            fusion: config.fusion.clone(),
            sender: AgentId::new(config.orchestrator.sender.clone()),
        })
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    /// Register a retrieval agent of `kind` with the configured budget
    pub fn register_agent(&self, kind: AgentKind, backend: Arc<dyn RetrievalBackend>) -> AgentHandle {
        let handle = AgentHandle::new(
            RetrievalAgent::new(kind, backend).with_budget(self.settings.agent_budget()),
        );
        handle.register(&self.router);
        handle
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    /// Current status of a task
    pub fn status(&self, task_id: &TaskId) -> Result<Task> {
        Ok(self.tracker.get(task_id)?)
    }

    /// Request cancellation. In-flight agents keep running; their results
    /// are discarded.
    pub fn cancel(&self, task_id: &TaskId) -> Result<Task> {
        let task = self.tracker.cancel(task_id)?;
        info!(task_id = %task_id, "Task cancelled");
        Ok(task)
    }

    /// Conversations still in flight
    pub fn active_conversations(&self) -> Vec<ConversationId> {
        self.conversations.read().keys().copied().collect()
    }

    /// Submit and wait for the terminal status
    pub async fn run(&self, query: Query) -> Result<Task> {
        validate_query(&query)?;
        let task_id = self.tracker.create();
        self.execute(task_id, query).await
    }

    /// Submit and return immediately; the workflow runs in the background
    pub fn submit(self: &Arc<Self>, query: Query) -> Result<TaskId> {
        validate_query(&query)?;
        let task_id = self.tracker.create();
        self.spawn_workflow(task_id, query);
        Ok(task_id)
    }

    /// Like [`submit`](Self::submit) but subscribed before the workflow
    /// starts, so no update is missed
    pub fn submit_and_subscribe(self: &Arc<Self>, query: Query) -> Result<(TaskId, TaskSubscription)> {
        validate_query(&query)?;
        let task_id = self.tracker.create();
        let subscription = self.tracker.subscribe(&task_id)?;
        self.spawn_workflow(task_id, query);
        Ok((task_id, subscription))
    }

    fn spawn_workflow(self: &Arc<Self>, task_id: TaskId, query: Query) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.execute(task_id, query).await {
                error!(task_id = %task_id, error = %e, "Workflow ended with an error");
            }
        });
    }

    #[instrument(skip(self, query))]
    async fn execute(&self, task_id: TaskId, query: Query) -> Result<Task> {
        let conversation = ConversationHandle::new(Conversation::new(
            task_id,
            query.text.clone(),
            self.settings.query_ttl(),
        ));
        self.conversations
            .write()
            .insert(conversation.id(), conversation.clone());

        let outcome = self.drive(&conversation, &query).await;

        self.conversations.write().remove(&conversation.id());
        outcome?;
        Ok(self.tracker.get(&task_id)?)
    }

    async fn drive(&self, conversation: &ConversationHandle, query: &Query) -> Result<()> {
        let task_id = conversation.task_id;
        let mut state_rx = self.tracker.watch(&task_id)?;

        if let Err(e) = self.tracker.start(&task_id) {
            debug!(error = %e, "Task not started");
            return Ok(());
        }

        let collected = self.dispatch_and_collect(conversation, query, &mut state_rx).await;
        let Some(results) = collected else {
            info!(conversation_id = %conversation.id(), "Cancelled during fan-in, late results discarded");
            return Ok(());
        };

        let outcomes = conversation.outcomes();
        if !outcomes.iter().any(AgentOutcome::responded) {
            let reason = failure_reason(&outcomes);
            warn!(reason = %reason, "All agents failed");
            let artifacts = vec![Artifact::AgentOutcomes { outcomes }];
            if let Err(e) = self.tracker.fail(&task_id, reason, artifacts) {
                debug!(error = %e, "Task already terminal");
            }
            return Ok(());
        }

        let fused = fuse(&results, &self.fusion);
        debug!(items = fused.len(), "Results fused");
        self.advance(conversation, PROGRESS_FUSED).await;

        let answer = match self.synthesize(conversation, &fused, &mut state_rx).await {
            Synthesis::Answer(text) => Some(text),
            Synthesis::Skipped => None,
            Synthesis::Cancelled => {
                info!(conversation_id = %conversation.id(), "Cancelled during synthesis");
                return Ok(());
            }
        };

        let mut artifacts = vec![Artifact::FusedResults { items: fused }];
        if let Some(text) = answer {
            artifacts.push(Artifact::Answer { text });
        }
        artifacts.push(Artifact::AgentOutcomes { outcomes });

        if let Err(e) = self.tracker.complete(&task_id, artifacts) {
            debug!(error = %e, "Result discarded, task already terminal");
        }
        Ok(())
    }

    /// Fan out to every configured agent and gather replies.
    ///
    /// Returns `None` if the task was cancelled while waiting.
    async fn dispatch_and_collect(
        &self,
        conversation: &ConversationHandle,
        query: &Query,
        state_rx: &mut watch::Receiver<TaskState>,
    ) -> Option<BTreeMap<AgentId, Vec<AgentResult>>> {
        let task_id = conversation.task_id;
        let (tx, mut rx) = mpsc::unbounded_channel::<(AgentId, Option<Envelope>)>();

        let mut kinds = self.settings.agents.clone();
        kinds.sort();
        kinds.dedup();

        for kind in &kinds {
            let agent_id = kind.agent_id();
            let payload = TaskPayload {
                query: query.text.clone(),
                strategy_params: query.params_for(*kind),
            };
            let envelope = Envelope::builder(MessageType::Task, self.sender.clone())
                .conversation(conversation.id())
                .recipient(agent_id.clone())
                .typed_payload(&payload)
                .and_then(|b| {
                    b.metadata("skill", kind.skill())
                        .metadata("task_id", task_id.to_string())
                        .ttl(conversation.ttl)
                        .build()
                });

            conversation.record_dispatch(agent_id.clone());
            match envelope {
                Ok(envelope) => {
                    let router = Arc::clone(&self.router);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let reply = router.route(envelope).await;
                        // Receiver is gone once the collector gave up; the reply is dropped.
                        let _ = tx.send((agent_id, reply));
                    });
                }
                Err(e) => {
                    error!(agent_id = %agent_id, error = %e, "Could not build task envelope");
                    conversation.record_outcome(AgentOutcome::new(
                        agent_id,
                        OutcomeStatus::Failed {
                            reason: ErrorReason::InternalError,
                            detail: e.to_string(),
                        },
                    ));
                }
            }
        }
        drop(tx);

        let dispatched = conversation.dispatched();
        self.emit(
            conversation,
            EventPayload::Dispatched {
                task_id,
                agents: dispatched.clone(),
            },
        )
        .await;
        self.advance(conversation, PROGRESS_DISPATCHED).await;

        let total = dispatched.len().max(1);
        let mut results = BTreeMap::new();

        loop {
            if conversation.unresolved().is_empty() {
                break;
            }

            let received = tokio::select! {
                biased;
                _ = wait_cancelled(state_rx) => return None,
                received = tokio::time::timeout_at(conversation.deadline(), rx.recv()) => received,
            };

            let (agent_id, reply) = match received {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(_) => {
                    warn!(unresolved = ?conversation.unresolved(), "Fan-in deadline reached");
                    break;
                }
            };

            if *state_rx.borrow() == TaskState::Cancelled {
                debug!(agent_id = %agent_id, "Reply arrived after cancellation, discarded");
                return None;
            }

            let (status, items) = classify(reply);
            let outcome = AgentOutcome::new(agent_id.clone(), status);
            if !conversation.record_outcome(outcome.clone()) {
                continue;
            }
            if let Some(items) = items {
                results.insert(agent_id, items);
            }

            let done = total - conversation.unresolved().len();
            let progress = PROGRESS_DISPATCHED as usize
                + (PROGRESS_COLLECTED - PROGRESS_DISPATCHED) as usize * done / total;
            self.emit(conversation, EventPayload::AgentCompleted { task_id, outcome })
                .await;
            self.advance(conversation, progress as u8).await;
        }

        for agent_id in conversation.unresolved() {
            let outcome = AgentOutcome::new(agent_id, OutcomeStatus::TimedOut);
            conversation.record_outcome(outcome.clone());
            self.emit(conversation, EventPayload::AgentCompleted { task_id, outcome })
                .await;
        }
        self.advance(conversation, PROGRESS_COLLECTED).await;

        Some(results)
    }

    /// Optional prose. Failures and overruns of the synthesis budget
    /// downgrade to "no answer"; cancellation stops the wait.
    async fn synthesize(
        &self,
        conversation: &ConversationHandle,
        fused: &[FusedItem],
        state_rx: &mut watch::Receiver<TaskState>,
    ) -> Synthesis {
        let Some(synthesizer) = self.synthesizer.as_ref() else {
            return Synthesis::Skipped;
        };
        if fused.is_empty() {
            return Synthesis::Skipped;
        }

        let budget = self.settings.synthesis_budget();
        let call = tokio::time::timeout(budget, synthesizer.synthesize(&conversation.query, fused));
        let result = tokio::select! {
            biased;
            _ = wait_cancelled(state_rx) => return Synthesis::Cancelled,
            result = call => result,
        };

        let detail = match result {
            Ok(Ok(text)) => return Synthesis::Answer(text),
            Ok(Err(e)) => {
                warn!(error = %e, "Synthesis failed, returning fused list only");
                e.to_string()
            }
            Err(_) => {
                warn!(budget_ms = budget.as_millis() as u64, "Synthesis timed out, returning fused list only");
                format!("synthesis exceeded {}ms", budget.as_millis())
            }
        };
        self.emit(
            conversation,
            EventPayload::SynthesisFailed {
                task_id: conversation.task_id,
                detail,
            },
        )
        .await;
        Synthesis::Skipped
    }

    /// Raise task progress and announce it to subscribers when it moved
    async fn advance(&self, conversation: &ConversationHandle, progress: u8) {
        let task_id = conversation.task_id;
        let before = match self.tracker.get(&task_id) {
            Ok(task) => task.progress,
            Err(e) => {
                debug!(error = %e, "Progress not recorded");
                return;
            }
        };
        match self.tracker.set_progress(&task_id, progress) {
            Ok(task) if task.progress > before => {
                self.emit(
                    conversation,
                    EventPayload::Progress {
                        task_id,
                        progress: task.progress,
                    },
                )
                .await;
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Progress not recorded"),
        }
    }

    /// Publish an EVENT to subscribers and the audit trail
    async fn emit(&self, conversation: &ConversationHandle, payload: EventPayload) {
        let event = match Envelope::event(conversation.id(), self.sender.clone(), &payload, conversation.ttl) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Could not build event envelope");
                return;
            }
        };
        let _ = self.tracker.publish(&conversation.task_id, event.clone());
        self.router.route(event).await;
    }
}

enum Synthesis {
    Answer(String),
    Skipped,
    Cancelled,
}

fn validate_query(query: &Query) -> Result<()> {
    if query.text.trim().is_empty() {
        return Err(DocketError::InvalidQuery("query text is empty".into()));
    }
    Ok(())
}

async fn wait_cancelled(state_rx: &mut watch::Receiver<TaskState>) {
    let observed = state_rx
        .wait_for(|state| *state == TaskState::Cancelled)
        .await
        .is_ok();
    if !observed {
        // Tracker entry gone; never resolve so the deadline decides.
        std::future::pending::<()>().await;
    }
}

/// Turn a router reply into an outcome and, for RESULT envelopes, the items
fn classify(reply: Option<Envelope>) -> (OutcomeStatus, Option<Vec<AgentResult>>) {
    let Some(reply) = reply else {
        return (
            OutcomeStatus::Failed {
                reason: ErrorReason::InternalError,
                detail: "router returned no reply".into(),
            },
            None,
        );
    };

    match reply.message_type() {
        MessageType::Result => match reply.result_payload() {
            Ok(payload) if payload.items.is_empty() => (OutcomeStatus::NoResults, Some(vec![])),
            Ok(payload) => (
                OutcomeStatus::Succeeded {
                    items: payload.items.len(),
                },
                Some(payload.items),
            ),
            Err(e) => (
                OutcomeStatus::Failed {
                    reason: ErrorReason::InternalError,
                    detail: e.to_string(),
                },
                None,
            ),
        },
        MessageType::Error => match reply.error_payload() {
            Ok(payload) if payload.reason == ErrorReason::TimedOut => (OutcomeStatus::TimedOut, None),
            Ok(payload) => (
                OutcomeStatus::Failed {
                    reason: payload.reason,
                    detail: payload.detail,
                },
                None,
            ),
            Err(e) => (
                OutcomeStatus::Failed {
                    reason: ErrorReason::InternalError,
                    detail: e.to_string(),
                },
                None,
            ),
        },
        other => (
            OutcomeStatus::Failed {
                reason: ErrorReason::InternalError,
                detail: format!("unexpected {other} reply"),
            },
            None,
        ),
    }
}

fn failure_reason(outcomes: &[AgentOutcome]) -> String {
    let parts: Vec<String> = outcomes
        .iter()
        .map(|o| format!("{}={}", o.agent_id, o.status))
        .collect();
    format!("no agent produced results: {}", parts.join(", "))
}
