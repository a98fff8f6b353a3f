//! Conversation state for one user query

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::envelope::{AgentId, ConversationId, TaskId};
use crate::tracker::AgentOutcome;

/// Groups the envelopes of one query and bounds its lifetime
pub struct Conversation {
    /// Conversation ID
    pub id: ConversationId,
    /// Task this conversation serves
    pub task_id: TaskId,
    /// Original user query
    pub query: String,
    pub created_at: DateTime<Utc>,
    /// Shared ttl of every TASK envelope in this conversation
    pub ttl: Duration,
    deadline: Instant,
    /// Agents a TASK was dispatched to, in dispatch order
    dispatched: RwLock<Vec<AgentId>>,
    /// First outcome recorded per agent
    outcomes: RwLock<BTreeMap<AgentId, AgentOutcome>>,
}

impl Conversation {
    /// Create a new conversation
    pub fn new(task_id: TaskId, query: impl Into<String>, ttl: Duration) -> Self {
        let id = ConversationId::new();

        info!(conversation_id = %id, task_id = %task_id, "Creating new conversation");

        Self {
            id,
            task_id,
            query: query.into(),
            created_at: Utc::now(),
            ttl,
            deadline: Instant::now() + ttl,
            dispatched: RwLock::new(Vec::new()),
            outcomes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Instant after which no result is awaited anymore
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_past_deadline(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn record_dispatch(&self, agent_id: AgentId) {
        debug!(conversation_id = %self.id, agent_id = %agent_id, "Task dispatched");
        self.dispatched.write().push(agent_id);
    }

    pub fn dispatched(&self) -> Vec<AgentId> {
        self.dispatched.read().clone()
    }

    /// Record how an agent resolved. Returns `false` if the agent already
    /// had an outcome; the first one wins.
    pub fn record_outcome(&self, outcome: AgentOutcome) -> bool {
        let mut outcomes = self.outcomes.write();
        if outcomes.contains_key(&outcome.agent_id) {
            return false;
        }
        outcomes.insert(outcome.agent_id.clone(), outcome);
        true
    }

    /// Dispatched agents that have no outcome yet
    pub fn unresolved(&self) -> Vec<AgentId> {
        let outcomes = self.outcomes.read();
        self.dispatched
            .read()
            .iter()
            .filter(|id| !outcomes.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Outcomes ordered by agent id
    pub fn outcomes(&self) -> Vec<AgentOutcome> {
        self.outcomes.read().values().cloned().collect()
    }
}

/// Handle to a conversation for external interaction
#[derive(Clone)]
pub struct ConversationHandle {
    inner: Arc<Conversation>,
}

impl ConversationHandle {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            inner: Arc::new(conversation),
        }
    }

    pub fn id(&self) -> ConversationId {
        self.inner.id
    }
}

impl std::ops::Deref for ConversationHandle {
    type Target = Conversation;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
