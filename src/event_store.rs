//! Audit trail of every envelope exchanged.
//!
//! The store itself is an external collaborator; the core only needs
//! `append`. Writes go through [`AuditSink`], which hands envelopes to a
//! background task so a slow or failing store can never hold up routing.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::envelope::{ConversationId, Envelope};
use crate::error::EventStoreError;

/// Append-only envelope log
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, envelope: &Envelope) -> Result<(), EventStoreError>;
}

/// Process-local store, mainly for tests and single-node deployments
#[derive(Default)]
pub struct InMemoryEventStore {
    envelopes: RwLock<Vec<Envelope>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Envelopes of one conversation in append order
    pub fn history(&self, conversation_id: &ConversationId) -> Vec<Envelope> {
        self.envelopes
            .read()
            .iter()
            .filter(|e| e.conversation_id() == *conversation_id)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Envelope> {
        self.envelopes.read().clone()
    }

    pub fn len(&self) -> usize {
        self.envelopes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.read().is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, envelope: &Envelope) -> Result<(), EventStoreError> {
        self.envelopes.write().push(envelope.clone());
        Ok(())
    }
}

/// Best-effort, non-blocking writer in front of an [`EventStore`]
#[derive(Clone, Default)]
pub struct AuditSink {
    tx: Option<mpsc::UnboundedSender<Envelope>>,
}

impl AuditSink {
    /// Sink that drops everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Start the background writer. Must be called inside a tokio runtime.
    ///
    /// The writer stops once every clone of the sink is dropped.
    pub fn spawn(store: Arc<dyn EventStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(e) = store.append(&envelope).await {
                    warn!(
                        message_id = %envelope.message_id(),
                        conversation_id = %envelope.conversation_id(),
                        error = %e,
                        "Audit append failed, envelope dropped"
                    );
                }
            }
            debug!("Audit writer stopped");
        });
        (Self { tx: Some(tx) }, handle)
    }

    /// Queue an envelope for the store; never blocks, never fails
    pub fn record(&self, envelope: &Envelope) {
        if let Some(tx) = &self.tx {
            if tx.send(envelope.clone()).is_err() {
                debug!(message_id = %envelope.message_id(), "Audit writer gone, envelope dropped");
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}
