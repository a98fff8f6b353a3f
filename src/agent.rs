//! Retrieval agents - one per search strategy.
//!
//! How an agent actually queries the knowledge store is behind
//! [`RetrievalBackend`]; this module only turns a TASK envelope into a
//! RESULT (possibly empty) or a failure, within the agent's time budget.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::envelope::{AgentId, AgentResult, Envelope, MessageType};
use crate::error::HandlerError;
use crate::router::{Handler, Router};

/// Default time an agent may spend on one query
pub const DEFAULT_AGENT_BUDGET: Duration = Duration::from_secs(20);

/// The closed set of retrieval strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Entity-neighbourhood search around matched nodes
    Local,
    /// Community-summary search over the whole corpus
    Global,
    /// Local search refined by community context
    Drift,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::Local, AgentKind::Global, AgentKind::Drift];

    /// Identifier the agent is registered under
    pub fn agent_id(&self) -> AgentId {
        AgentId::new(self.as_str())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Local => "local",
            AgentKind::Global => "global",
            AgentKind::Drift => "drift",
        }
    }

    /// Skill name propagated in envelope metadata
    pub fn skill(&self) -> &'static str {
        match self {
            AgentKind::Local => "local_search",
            AgentKind::Global => "global_search",
            AgentKind::Drift => "drift_search",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One item as returned by a backend, best first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedItem {
    pub citation: String,
    pub content: String,
    pub score: f64,
}

impl RetrievedItem {
    pub fn new(citation: impl Into<String>, content: impl Into<String>, score: f64) -> Self {
        Self {
            citation: citation.into(),
            content: content.into(),
            score,
        }
    }
}

/// Failures a backend may report. An empty result is not a failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RetrievalError {
    /// Knowledge store or LLM unreachable
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Anything unexpected
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RetrievalError> for HandlerError {
    fn from(err: RetrievalError) -> Self {
        match err {
            RetrievalError::UpstreamUnavailable(detail) => HandlerError::upstream_unavailable(detail),
            RetrievalError::Internal(detail) => HandlerError::internal(detail),
        }
    }
}

/// External retrieval logic behind an agent
#[async_trait]
pub trait RetrievalBackend: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Vec<RetrievedItem>, RetrievalError>;
}

/// Running counters for one agent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentStats {
    pub tasks: u64,
    pub empty: u64,
    pub failures: u64,
    pub timeouts: u64,
}

/// A retrieval strategy exposed behind the TASK/RESULT contract
pub struct RetrievalAgent {
    /// Unique identifier
    pub id: AgentId,
    /// Strategy
    pub kind: AgentKind,
    backend: Arc<dyn RetrievalBackend>,
    budget: Duration,
    stats: RwLock<AgentStats>,
}

impl RetrievalAgent {
    /// Create an agent registered under the kind's default id
    pub fn new(kind: AgentKind, backend: Arc<dyn RetrievalBackend>) -> Self {
        info!(agent_id = %kind.agent_id(), kind = %kind, "Creating retrieval agent");

        Self {
            id: kind.agent_id(),
            kind,
            backend,
            budget: DEFAULT_AGENT_BUDGET,
            stats: RwLock::new(AgentStats::default()),
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn stats(&self) -> AgentStats {
        self.stats.read().clone()
    }

    /// Run one TASK envelope through the backend
    #[instrument(skip(self, task), fields(agent_id = %self.id, conversation_id = %task.conversation_id()))]
    pub async fn execute(&self, task: &Envelope) -> Result<Envelope, HandlerError> {
        self.stats.write().tasks += 1;

        let payload = task
            .task_payload()
            .map_err(|e| self.record_failure(HandlerError::internal(e.to_string())))?;

        let retrieved = match tokio::time::timeout(
            self.budget,
            self.backend.retrieve(&payload.query, &payload.strategy_params),
        )
        .await
        {
            Ok(Ok(items)) => items,
            Ok(Err(e)) => {
                warn!(error = %e, "Retrieval failed");
                return Err(self.record_failure(e.into()));
            }
            Err(_) => {
                warn!(budget_ms = self.budget.as_millis() as u64, "Retrieval exceeded budget");
                self.stats.write().timeouts += 1;
                return Err(HandlerError::timed_out(format!(
                    "{} exceeded its {}ms budget",
                    self.id,
                    self.budget.as_millis()
                )));
            }
        };

        if retrieved.is_empty() {
            self.stats.write().empty += 1;
        }

        let items: Vec<AgentResult> = retrieved
            .into_iter()
            .enumerate()
            .map(|(i, item)| AgentResult {
                agent_id: self.id.clone(),
                rank: i + 1,
                score: item.score,
                citation: item.citation,
                content: item.content,
            })
            .collect();

        debug!(items = items.len(), "Retrieval finished");
        Ok(task.result_reply(items))
    }

    fn record_failure(&self, err: HandlerError) -> HandlerError {
        self.stats.write().failures += 1;
        err
    }
}

#[async_trait]
impl Handler for RetrievalAgent {
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>, HandlerError> {
        if envelope.message_type() != MessageType::Task {
            return Err(HandlerError::internal(format!(
                "{} only accepts TASK envelopes, got {}",
                self.id,
                envelope.message_type()
            )));
        }
        self.execute(&envelope).await.map(Some)
    }
}

/// Shared handle to an agent
#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<RetrievalAgent>,
}

impl AgentHandle {
    pub fn new(agent: RetrievalAgent) -> Self {
        Self {
            inner: Arc::new(agent),
        }
    }

    pub fn id(&self) -> AgentId {
        self.inner.id.clone()
    }

    pub fn kind(&self) -> AgentKind {
        self.inner.kind
    }

    /// Register this agent with a router under its id
    pub fn register(&self, router: &Router) {
        router.register(self.id(), self.inner.clone());
    }
}

impl std::ops::Deref for AgentHandle {
    type Target = RetrievalAgent;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ConversationId, ErrorReason, TaskPayload};

    enum Behaviour {
        Items(Vec<RetrievedItem>),
        Fail(RetrievalError),
        Hang,
    }

    struct FakeBackend(Behaviour);

    #[async_trait]
    impl RetrievalBackend for FakeBackend {
        async fn retrieve(
            &self,
            _query: &str,
            _params: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<Vec<RetrievedItem>, RetrievalError> {
            match &self.0 {
                Behaviour::Items(items) => Ok(items.clone()),
                Behaviour::Fail(err) => Err(err.clone()),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(vec![])
                }
            }
        }
    }

    fn create_test_agent(kind: AgentKind, behaviour: Behaviour) -> RetrievalAgent {
        RetrievalAgent::new(kind, Arc::new(FakeBackend(behaviour)))
    }

    fn task_for(kind: AgentKind) -> Envelope {
        Envelope::builder(MessageType::Task, "orchestrator")
            .conversation(ConversationId::new())
            .recipient(kind.agent_id())
            .typed_payload(&TaskPayload::new("quiet title action"))
            .unwrap()
            .metadata("skill", kind.skill())
            .ttl(Duration::from_secs(30))
            .build()
            .unwrap()
    }

    #[test]
    fn test_agent_creation() {
        let agent = create_test_agent(AgentKind::Global, Behaviour::Items(vec![]));
        assert_eq!(agent.id, AgentId::new("global"));
        assert_eq!(agent.budget(), DEFAULT_AGENT_BUDGET);
        assert_eq!(agent.stats(), AgentStats::default());
    }

    #[tokio::test]
    async fn test_results_are_ranked_by_position() {
        let agent = create_test_agent(
            AgentKind::Local,
            Behaviour::Items(vec![
                RetrievedItem::new("cite-a", "first", 0.2),
                RetrievedItem::new("cite-b", "second", 0.9),
            ]),
        );
        let task = task_for(AgentKind::Local);
        let reply = agent.execute(&task).await.unwrap();

        assert_eq!(reply.metadata(), task.metadata());
        let items = reply.result_payload().unwrap().items;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].rank, 1);
        assert_eq!(items[0].citation, "cite-a");
        assert_eq!(items[1].rank, 2);
        assert_eq!(items[1].score, 0.9);
        assert!(items.iter().all(|i| i.agent_id == AgentId::new("local")));
    }

    #[tokio::test]
    async fn test_empty_result_is_not_an_error() {
        let agent = create_test_agent(AgentKind::Drift, Behaviour::Items(vec![]));
        let reply = agent.execute(&task_for(AgentKind::Drift)).await.unwrap();
        assert_eq!(reply.message_type(), MessageType::Result);
        assert!(reply.result_payload().unwrap().items.is_empty());
        assert_eq!(agent.stats().empty, 1);
    }

    #[tokio::test]
    async fn test_upstream_failure() {
        let agent = create_test_agent(
            AgentKind::Global,
            Behaviour::Fail(RetrievalError::UpstreamUnavailable("neo4j down".into())),
        );
        let err = agent.execute(&task_for(AgentKind::Global)).await.unwrap_err();
        assert_eq!(err.reason, ErrorReason::UpstreamUnavailable);
        assert_eq!(agent.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_budget_exceeded_times_out() {
        let agent = create_test_agent(AgentKind::Local, Behaviour::Hang)
            .with_budget(Duration::from_millis(50));
        let err = agent.execute(&task_for(AgentKind::Local)).await.unwrap_err();
        assert_eq!(err.reason, ErrorReason::TimedOut);
        assert_eq!(agent.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_rejects_non_task_envelopes() {
        let agent = create_test_agent(AgentKind::Local, Behaviour::Items(vec![]));
        let result = task_for(AgentKind::Local).result_reply(vec![]);
        let err = agent.handle(result).await.unwrap_err();
        assert_eq!(err.reason, ErrorReason::InternalError);
    }

    #[tokio::test]
    async fn test_handle_registers_with_router() {
        let router = Router::without_audit();
        let handle = AgentHandle::new(create_test_agent(
            AgentKind::Drift,
            Behaviour::Items(vec![RetrievedItem::new("c", "x", 1.0)]),
        ));
        handle.register(&router);

        let reply = router.route(task_for(AgentKind::Drift)).await.unwrap();
        assert_eq!(reply.result_payload().unwrap().items.len(), 1);
        assert_eq!(handle.stats().tasks, 1);
    }
}
