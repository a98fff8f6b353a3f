//! Update channels for streaming task progress to subscribers

use tokio::sync::broadcast;
use tracing::warn;

use crate::envelope::Envelope;
use crate::tracker::Task;

/// Default number of buffered updates per task
pub const DEFAULT_UPDATE_BUFFER: usize = 64;

/// One item delivered to a task subscriber
#[derive(Debug, Clone)]
pub enum TaskUpdate {
    /// Intermediate EVENT envelope (dispatch, agent completion, progress)
    Event(Envelope),
    /// Final status; always the last update of a subscription
    Terminal(Task),
}

impl TaskUpdate {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskUpdate::Terminal(_))
    }
}

/// Sending side owned by the tracker, one per task
#[derive(Debug, Clone)]
pub struct UpdateChannel {
    tx: broadcast::Sender<TaskUpdate>,
}

impl UpdateChannel {
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size.max(1));
        Self { tx }
    }

    /// Deliver to current subscribers. Having none is not an error.
    pub fn send(&self, update: TaskUpdate) {
        let _ = self.tx.send(update);
    }

    /// Subscribe to updates sent from now on
    pub fn subscribe(&self) -> TaskSubscription {
        TaskSubscription {
            rx: self.tx.subscribe(),
            pending_terminal: None,
            finished: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for UpdateChannel {
    fn default() -> Self {
        Self::new(DEFAULT_UPDATE_BUFFER)
    }
}

/// Client-side stream of updates for one task
pub struct TaskSubscription {
    rx: broadcast::Receiver<TaskUpdate>,
    pending_terminal: Option<Task>,
    finished: bool,
}

impl TaskSubscription {
    /// Subscription for a task that already reached a terminal state
    pub(crate) fn finished_with(mut self, task: Task) -> Self {
        self.pending_terminal = Some(task);
        self
    }

    /// Next update, or `None` once the terminal status has been delivered
    pub async fn next(&mut self) -> Option<TaskUpdate> {
        if self.finished {
            return None;
        }
        if let Some(task) = self.pending_terminal.take() {
            self.finished = true;
            return Some(TaskUpdate::Terminal(task));
        }

        loop {
            match self.rx.recv().await {
                Ok(update) => {
                    if update.is_terminal() {
                        self.finished = true;
                    }
                    return Some(update);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Task subscriber lagged, updates dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Drain the subscription and return the terminal status, if any
    pub async fn terminal(mut self) -> Option<Task> {
        while let Some(update) = self.next().await {
            if let TaskUpdate::Terminal(task) = update {
                return Some(task);
            }
        }
        None
    }
}
