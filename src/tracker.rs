//! Task tracker - owns every task and its lifecycle.
//!
//! ```text
//! pending ──► working ──► completed
//!    │           ├──────► failed
//!    └───────────┴──────► cancelled
//! ```
//!
//! Terminal states are final. The orchestrator mutates tasks only through
//! the operations here, so a late transition on a cancelled task is rejected
//! instead of silently overwriting it.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::channel::{TaskSubscription, TaskUpdate, UpdateChannel, DEFAULT_UPDATE_BUFFER};
use crate::config::TrackerSection;
use crate::envelope::{AgentId, Envelope, ErrorReason, TaskId};
use crate::error::TrackerError;
use crate::fusion::FusedItem;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Working,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Working)
                | (TaskState::Pending, TaskState::Cancelled)
                | (TaskState::Working, TaskState::Completed)
                | (TaskState::Working, TaskState::Failed)
                | (TaskState::Working, TaskState::Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Working => "working",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// How a single agent's dispatch resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// RESULT with at least one item
    Succeeded { items: usize },
    /// RESULT with zero items
    NoResults,
    /// ERROR envelope
    Failed { reason: ErrorReason, detail: String },
    /// Did not resolve before the fan-in deadline
    TimedOut,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Succeeded { items } => write!(f, "succeeded({items})"),
            OutcomeStatus::NoResults => f.write_str("no_results"),
            OutcomeStatus::Failed { reason, .. } => write!(f, "{reason}"),
            OutcomeStatus::TimedOut => f.write_str("timed_out"),
        }
    }
}

/// Per-agent line item recorded on every finished task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub agent_id: AgentId,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

impl AgentOutcome {
    pub fn new(agent_id: AgentId, status: OutcomeStatus) -> Self {
        Self { agent_id, status }
    }

    /// Agent answered with a RESULT envelope (possibly empty)
    pub fn responded(&self) -> bool {
        matches!(
            self.status,
            OutcomeStatus::Succeeded { .. } | OutcomeStatus::NoResults
        )
    }
}

/// Typed result attached to a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Artifact {
    /// Rank-fused list
    FusedResults { items: Vec<FusedItem> },
    /// Synthesized prose with inline citations
    Answer { text: String },
    /// Outcome of every dispatched agent
    AgentOutcomes { outcomes: Vec<AgentOutcome> },
}

/// Caller-visible unit of orchestrated work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskState,
    /// 0..=100
    pub progress: u8,
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: TaskId) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskState::Pending,
            progress: 0,
            artifacts: Vec::new(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn fused_results(&self) -> Option<&[FusedItem]> {
        self.artifacts.iter().find_map(|a| match a {
            Artifact::FusedResults { items } => Some(items.as_slice()),
            _ => None,
        })
    }

    pub fn answer(&self) -> Option<&str> {
        self.artifacts.iter().find_map(|a| match a {
            Artifact::Answer { text } => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn agent_outcomes(&self) -> Option<&[AgentOutcome]> {
        self.artifacts.iter().find_map(|a| match a {
            Artifact::AgentOutcomes { outcomes } => Some(outcomes.as_slice()),
            _ => None,
        })
    }
}

struct TaskEntry {
    task: Task,
    updates: UpdateChannel,
    state_tx: watch::Sender<TaskState>,
}

/// Maps task ids to their lifecycle state
pub struct TaskTracker {
    tasks: RwLock<HashMap<TaskId, TaskEntry>>,
    update_buffer: usize,
    /// Finished tasks older than this are dropped on the next `create`
    retention: Option<Duration>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::with_update_buffer(DEFAULT_UPDATE_BUFFER)
    }

    pub fn from_config(section: &TrackerSection) -> Self {
        let tracker = Self::with_update_buffer(section.update_buffer);
        match section.retention() {
            Some(retention) => tracker.with_retention(retention),
            None => tracker,
        }
    }

    pub fn with_update_buffer(update_buffer: usize) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            update_buffer,
            retention: None,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Create a task in `pending`
    pub fn create(&self) -> TaskId {
        let id = TaskId::new();
        let (state_tx, _) = watch::channel(TaskState::Pending);
        let entry = TaskEntry {
            task: Task::new(id),
            updates: UpdateChannel::new(self.update_buffer),
            state_tx,
        };

        let mut tasks = self.tasks.write();
        if let Some(retention) = self.retention {
            purge(&mut tasks, retention);
        }
        tasks.insert(id, entry);
        debug!(task_id = %id, "Task created");
        id
    }

    /// Drop a finished task. Live tasks cannot be removed.
    pub fn remove(&self, id: &TaskId) -> Result<Task, TrackerError> {
        let mut tasks = self.tasks.write();
        let entry = tasks.get(id).ok_or(TrackerError::TaskNotFound(*id))?;
        if !entry.task.status.is_terminal() {
            return Err(TrackerError::TaskStillRunning(*id));
        }
        let task = tasks.remove(id).map(|e| e.task).ok_or(TrackerError::TaskNotFound(*id))?;
        debug!(task_id = %id, "Task removed");
        Ok(task)
    }

    /// Drop every finished task last updated more than `older_than` ago.
    /// Returns how many were removed.
    pub fn purge_finished(&self, older_than: Duration) -> usize {
        purge(&mut self.tasks.write(), older_than)
    }

    /// Snapshot of a task
    pub fn get(&self, id: &TaskId) -> Result<Task, TrackerError> {
        self.tasks
            .read()
            .get(id)
            .map(|e| e.task.clone())
            .ok_or(TrackerError::TaskNotFound(*id))
    }

    /// All tasks, oldest first
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().values().map(|e| e.task.clone()).collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// `pending -> working`
    pub fn start(&self, id: &TaskId) -> Result<Task, TrackerError> {
        self.transition(id, TaskState::Working, |_| {})
    }

    /// `working -> completed`, progress forced to 100
    pub fn complete(&self, id: &TaskId, artifacts: Vec<Artifact>) -> Result<Task, TrackerError> {
        self.transition(id, TaskState::Completed, |task| {
            task.progress = 100;
            task.artifacts = artifacts;
        })
    }

    /// `working -> failed`
    pub fn fail(
        &self,
        id: &TaskId,
        reason: impl Into<String>,
        artifacts: Vec<Artifact>,
    ) -> Result<Task, TrackerError> {
        let reason = reason.into();
        self.transition(id, TaskState::Failed, |task| {
            task.failure_reason = Some(reason);
            task.artifacts = artifacts;
        })
    }

    /// `pending | working -> cancelled`
    pub fn cancel(&self, id: &TaskId) -> Result<Task, TrackerError> {
        self.transition(id, TaskState::Cancelled, |_| {})
    }

    /// Raise progress. Values are clamped to 100 and never move backwards;
    /// terminal tasks are left untouched.
    pub fn set_progress(&self, id: &TaskId, progress: u8) -> Result<Task, TrackerError> {
        let mut tasks = self.tasks.write();
        let entry = tasks.get_mut(id).ok_or(TrackerError::TaskNotFound(*id))?;
        if !entry.task.status.is_terminal() {
            let progress = progress.min(100);
            if progress > entry.task.progress {
                entry.task.progress = progress;
                entry.task.updated_at = Utc::now();
            }
        }
        Ok(entry.task.clone())
    }

    /// Forward an EVENT envelope to subscribers; dropped once the task is terminal
    pub fn publish(&self, id: &TaskId, event: Envelope) -> Result<(), TrackerError> {
        let tasks = self.tasks.read();
        let entry = tasks.get(id).ok_or(TrackerError::TaskNotFound(*id))?;
        if !entry.task.status.is_terminal() {
            entry.updates.send(TaskUpdate::Event(event));
        }
        Ok(())
    }

    /// Stream of updates ending with the terminal status
    pub fn subscribe(&self, id: &TaskId) -> Result<TaskSubscription, TrackerError> {
        let tasks = self.tasks.read();
        let entry = tasks.get(id).ok_or(TrackerError::TaskNotFound(*id))?;
        let subscription = entry.updates.subscribe();
        if entry.task.status.is_terminal() {
            Ok(subscription.finished_with(entry.task.clone()))
        } else {
            Ok(subscription)
        }
    }

    /// Receiver that observes every state change of a task
    pub fn watch(&self, id: &TaskId) -> Result<watch::Receiver<TaskState>, TrackerError> {
        self.tasks
            .read()
            .get(id)
            .map(|e| e.state_tx.subscribe())
            .ok_or(TrackerError::TaskNotFound(*id))
    }

    /// Wait until the task is terminal and return its final status
    pub async fn wait(&self, id: &TaskId) -> Result<Task, TrackerError> {
        let mut rx = self.watch(id)?;
        // Sender lives as long as the entry; an error here means it was dropped.
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        self.get(id)
    }

    fn transition(
        &self,
        id: &TaskId,
        to: TaskState,
        mutate: impl FnOnce(&mut Task),
    ) -> Result<Task, TrackerError> {
        let mut tasks = self.tasks.write();
        let entry = tasks.get_mut(id).ok_or(TrackerError::TaskNotFound(*id))?;
        let from = entry.task.status;
        if !from.can_transition_to(to) {
            return Err(TrackerError::InvalidTransition {
                task_id: *id,
                from,
                to,
            });
        }

        entry.task.status = to;
        entry.task.updated_at = Utc::now();
        mutate(&mut entry.task);

        let snapshot = entry.task.clone();
        entry.state_tx.send_replace(to);
        if to.is_terminal() {
            entry.updates.send(TaskUpdate::Terminal(snapshot.clone()));
            info!(task_id = %id, status = %to, "Task finished");
        } else {
            debug!(task_id = %id, from = %from, to = %to, "Task transitioned");
        }

        Ok(snapshot)
    }
}

fn purge(tasks: &mut HashMap<TaskId, TaskEntry>, older_than: Duration) -> usize {
    let Ok(age) = chrono::Duration::from_std(older_than) else {
        return 0;
    };
    let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
        return 0;
    };

    let before = tasks.len();
    tasks.retain(|_, e| !(e.task.status.is_terminal() && e.task.updated_at <= cutoff));
    let removed = before - tasks.len();
    if removed > 0 {
        debug!(removed, "Finished tasks purged");
    }
    removed
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    // === State Machine Tests ===

    #[test]
    fn test_create_is_pending() {
        let tracker = TaskTracker::new();
        let id = tracker.create();
        let task = tracker.get(&id).unwrap();
        assert_eq!(task.status, TaskState::Pending);
        assert_eq!(task.progress, 0);
        assert!(task.artifacts.is_empty());
    }

    #[test]
    fn test_happy_path() {
        let tracker = TaskTracker::new();
        let id = tracker.create();
        assert_ok!(tracker.start(&id));
        let task = tracker
            .complete(&id, vec![Artifact::Answer { text: "ok".into() }])
            .unwrap();
        assert_eq!(task.status, TaskState::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.answer(), Some("ok"));
    }

    #[test]
    fn test_complete_requires_working() {
        let tracker = TaskTracker::new();
        let id = tracker.create();
        let err = tracker.complete(&id, vec![]).unwrap_err();
        assert_eq!(
            err,
            TrackerError::InvalidTransition {
                task_id: id,
                from: TaskState::Pending,
                to: TaskState::Completed,
            }
        );
    }

    #[test]
    fn test_terminal_states_are_final() {
        let tracker = TaskTracker::new();
        let id = tracker.create();
        tracker.start(&id).unwrap();
        tracker.cancel(&id).unwrap();

        assert_err!(tracker.complete(&id, vec![]));
        assert_err!(tracker.fail(&id, "late", vec![]));
        assert_err!(tracker.start(&id));
        assert_err!(tracker.cancel(&id));
        assert_eq!(tracker.get(&id).unwrap().status, TaskState::Cancelled);
    }

    #[test]
    fn test_cancel_from_pending() {
        let tracker = TaskTracker::new();
        let id = tracker.create();
        assert_ok!(tracker.cancel(&id));
    }

    #[test]
    fn test_fail_records_reason() {
        let tracker = TaskTracker::new();
        let id = tracker.create();
        tracker.start(&id).unwrap();
        let task = tracker.fail(&id, "nothing worked", vec![]).unwrap();
        assert_eq!(task.status, TaskState::Failed);
        assert_eq!(task.failure_reason.as_deref(), Some("nothing worked"));
    }

    #[test]
    fn test_unknown_task() {
        let tracker = TaskTracker::new();
        let id = TaskId::new();
        assert_eq!(tracker.get(&id).unwrap_err(), TrackerError::TaskNotFound(id));
    }

    // === Progress Tests ===

    #[test]
    fn test_progress_is_clamped_and_monotonic() {
        let tracker = TaskTracker::new();
        let id = tracker.create();
        tracker.start(&id).unwrap();

        assert_eq!(tracker.set_progress(&id, 40).unwrap().progress, 40);
        assert_eq!(tracker.set_progress(&id, 20).unwrap().progress, 40);
        assert_eq!(tracker.set_progress(&id, 250).unwrap().progress, 100);
    }

    #[test]
    fn test_progress_ignored_after_terminal() {
        let tracker = TaskTracker::new();
        let id = tracker.create();
        tracker.cancel(&id).unwrap();
        assert_eq!(tracker.set_progress(&id, 50).unwrap().progress, 0);
    }

    // === Retention Tests ===

    #[test]
    fn test_remove_only_finished_tasks() {
        let tracker = TaskTracker::new();
        let live = tracker.create();
        let done = tracker.create();
        tracker.cancel(&done).unwrap();

        assert!(matches!(
            tracker.remove(&live),
            Err(TrackerError::TaskStillRunning(_))
        ));
        assert_eq!(tracker.remove(&done).unwrap().status, TaskState::Cancelled);
        assert!(matches!(tracker.get(&done), Err(TrackerError::TaskNotFound(_))));
        assert_ok!(tracker.get(&live));
    }

    #[test]
    fn test_purge_drops_finished_keeps_live() {
        let tracker = TaskTracker::new();
        let pending = tracker.create();
        let working = tracker.create();
        tracker.start(&working).unwrap();
        let completed = tracker.create();
        tracker.start(&completed).unwrap();
        tracker.complete(&completed, vec![]).unwrap();
        let failed = tracker.create();
        tracker.start(&failed).unwrap();
        tracker.fail(&failed, "boom", vec![]).unwrap();

        assert_eq!(tracker.purge_finished(Duration::from_secs(3600)), 0);
        assert_eq!(tracker.len(), 4);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tracker.purge_finished(Duration::from_millis(1)), 2);
        assert_eq!(tracker.len(), 2);
        assert_ok!(tracker.get(&pending));
        assert_ok!(tracker.get(&working));
        assert_err!(tracker.get(&completed));
        assert_err!(tracker.get(&failed));
    }

    #[test]
    fn test_retention_sweeps_on_create() {
        let tracker = TaskTracker::new().with_retention(Duration::ZERO);
        let old = tracker.create();
        tracker.cancel(&old).unwrap();
        let live = tracker.create();

        assert_err!(tracker.get(&old));
        assert_ok!(tracker.get(&live));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_list_orders_by_creation() {
        let tracker = TaskTracker::new();
        let first = tracker.create();
        std::thread::sleep(Duration::from_millis(2));
        let second = tracker.create();

        let ids: Vec<TaskId> = tracker.list().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(tracker.len(), 2);
    }

    // === Waiting & Streaming Tests ===

    #[tokio::test]
    async fn test_wait_resolves_on_terminal() {
        let tracker = Arc::new(TaskTracker::new());
        let id = tracker.create();

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait(&id).await })
        };

        tracker.start(&id).unwrap();
        tracker.fail(&id, "boom", vec![]).unwrap();

        let task = waiter.await.unwrap().unwrap();
        assert_eq!(task.status, TaskState::Failed);
    }

    #[tokio::test]
    async fn test_subscribe_after_terminal() {
        let tracker = TaskTracker::new();
        let id = tracker.create();
        tracker.cancel(&id).unwrap();

        let task = tracker.subscribe(&id).unwrap().terminal().await.unwrap();
        assert_eq!(task.status, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_subscription_receives_terminal_last() {
        let tracker = TaskTracker::new();
        let id = tracker.create();
        let mut sub = tracker.subscribe(&id).unwrap();

        tracker.start(&id).unwrap();
        tracker.complete(&id, vec![]).unwrap();

        match sub.next().await {
            Some(TaskUpdate::Terminal(task)) => assert_eq!(task.status, TaskState::Completed),
            other => panic!("unexpected update: {other:?}"),
        }
        assert!(sub.next().await.is_none());
    }

    #[test]
    fn test_outcome_wire_shape() {
        let outcome = AgentOutcome::new(
            AgentId::new("drift"),
            OutcomeStatus::Failed {
                reason: ErrorReason::UpstreamUnavailable,
                detail: "neo4j down".into(),
            },
        );
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["agent_id"], "drift");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["reason"], "upstream_unavailable");
        assert!(!outcome.responded());
    }
}
