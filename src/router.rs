//! Router - registry of agent handlers and envelope dispatch.
//!
//! Routing order for every envelope:
//!
//! 1. expired envelopes are answered with `expired` before anything else runs
//! 2. the envelope is queued on the audit sink
//! 3. unknown recipients are answered with `unregistered_recipient`
//! 4. the handler runs on its own task; failures and panics become ERROR replies,
//!    and a reply always carries the request's conversation id and metadata
//! 5. the handler's reply (or `None` for events) is returned

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument, warn};

use crate::envelope::{AgentId, ConversationId, Envelope, ErrorReason, MessageType};
use crate::error::HandlerError;
use crate::event_store::AuditSink;

/// Something that can answer envelopes addressed to an agent id
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one envelope. `Ok(None)` means there is nothing to reply.
    async fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>, HandlerError>;
}

type InFlightKey = (ConversationId, AgentId);

/// Removes an in-flight TASK marker when routing finishes or is dropped
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<InFlightKey>>,
    key: Option<InFlightKey>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.in_flight.lock().remove(&key);
        }
    }
}

/// Dispatches envelopes to registered handlers
pub struct Router {
    handlers: RwLock<HashMap<AgentId, Arc<dyn Handler>>>,
    /// At most one TASK per (conversation, recipient) at a time
    in_flight: Mutex<HashSet<InFlightKey>>,
    audit: AuditSink,
}

impl Router {
    pub fn new(audit: AuditSink) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            audit,
        }
    }

    /// Router without an audit trail
    pub fn without_audit() -> Self {
        Self::new(AuditSink::disabled())
    }

    /// Register a handler, replacing any previous one for the same id
    pub fn register(&self, agent_id: impl Into<AgentId>, handler: Arc<dyn Handler>) {
        let agent_id = agent_id.into();
        if self.handlers.write().insert(agent_id.clone(), handler).is_some() {
            debug!(agent_id = %agent_id, "Handler replaced");
        } else {
            debug!(agent_id = %agent_id, "Handler registered");
        }
    }

    pub fn unregister(&self, agent_id: &AgentId) -> bool {
        self.handlers.write().remove(agent_id).is_some()
    }

    pub fn is_registered(&self, agent_id: &AgentId) -> bool {
        self.handlers.read().contains_key(agent_id)
    }

    /// Registered ids, sorted
    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.handlers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Deliver an envelope to its recipient and return the reply.
    ///
    /// Never fails: protocol and handler problems come back as ERROR envelopes
    /// carrying the original conversation id and metadata.
    #[instrument(skip(self, envelope), fields(
        message_id = %envelope.message_id(),
        conversation_id = %envelope.conversation_id(),
        message_type = %envelope.message_type(),
    ))]
    pub async fn route(&self, envelope: Envelope) -> Option<Envelope> {
        if envelope.is_expired(Utc::now()) {
            warn!(expires_at = %envelope.expires_at(), "Envelope expired before delivery");
            return Some(envelope.error_reply(
                ErrorReason::Expired,
                format!("envelope expired at {}", envelope.expires_at()),
            ));
        }

        self.audit.record(&envelope);

        let Some(recipient) = envelope.recipient().cloned() else {
            if envelope.message_type() == MessageType::Event {
                debug!("Broadcast event recorded");
                return None;
            }
            return Some(self.reply(
                &envelope,
                envelope.error_reply(ErrorReason::UnregisteredRecipient, "envelope has no recipient"),
            ));
        };

        let handler = self.handlers.read().get(&recipient).cloned();
        let Some(handler) = handler else {
            warn!(recipient = %recipient, "No handler registered");
            return Some(self.reply(
                &envelope,
                envelope.error_reply(
                    ErrorReason::UnregisteredRecipient,
                    format!("no handler registered for '{recipient}'"),
                ),
            ));
        };

        let _guard = if envelope.message_type() == MessageType::Task {
            let key = (envelope.conversation_id(), recipient.clone());
            if !self.in_flight.lock().insert(key.clone()) {
                warn!(recipient = %recipient, "Duplicate in-flight task rejected");
                return Some(self.reply(
                    &envelope,
                    envelope.error_reply(
                        ErrorReason::InternalError,
                        format!("duplicate in-flight task for '{recipient}'"),
                    ),
                ));
            }
            Some(InFlightGuard {
                in_flight: &self.in_flight,
                key: Some(key),
            })
        } else {
            None
        };

        let request = envelope.clone();
        let outcome = tokio::spawn(async move { handler.handle(request).await }).await;

        let response = match outcome {
            Ok(Ok(Some(response))) => {
                if response.conversation_id() != envelope.conversation_id() {
                    warn!(recipient = %recipient, "Handler replied on a different conversation");
                    envelope.error_reply(
                        ErrorReason::InternalError,
                        format!("'{recipient}' replied outside the conversation"),
                    )
                } else if response.metadata() != envelope.metadata() {
                    warn!(recipient = %recipient, "Handler reply altered metadata, restoring request metadata");
                    response.with_metadata(envelope.metadata().clone())
                } else {
                    response
                }
            }
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                debug!(recipient = %recipient, error = %e, "Handler failed");
                envelope.error_reply(e.reason, e.detail)
            }
            Err(join_err) => {
                warn!(recipient = %recipient, error = %join_err, "Handler panicked");
                envelope.error_reply(
                    ErrorReason::InternalError,
                    format!("handler for '{recipient}' aborted"),
                )
            }
        };

        Some(self.reply(&envelope, response))
    }

    fn reply(&self, request: &Envelope, response: Envelope) -> Envelope {
        debug_assert_eq!(request.conversation_id(), response.conversation_id());
        self.audit.record(&response);
        response
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::without_audit()
    }
}
