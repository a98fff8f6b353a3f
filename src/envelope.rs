//! Envelope protocol - the immutable unit of communication between the
//! orchestrator, the router and the retrieval agents.
//!
//! Every envelope belongs to a conversation. Replies (`RESULT` / `ERROR`)
//! reuse the conversation id and metadata of the `TASK` that triggered them,
//! which is how the orchestrator correlates concurrent responses.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EnvelopeError;
use crate::tracker::AgentOutcome;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Unique per envelope
    MessageId
);
uuid_id!(
    /// Groups every envelope of one user interaction
    ConversationId
);
uuid_id!(
    /// Caller-visible unit of orchestrated work
    TaskId
);

/// Logical identifier of a participant (an agent, the orchestrator, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Kind of message carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// A unit of work sent to an agent
    Task,
    /// A successful response
    Result,
    /// A failure response
    Error,
    /// Informational / progress
    Event,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Task => "TASK",
            MessageType::Result => "RESULT",
            MessageType::Error => "ERROR",
            MessageType::Event => "EVENT",
        };
        f.write_str(s)
    }
}

/// Free-form key/value context propagated from a TASK into its reply
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// The immutable message unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct Envelope {
    message_id: MessageId,
    conversation_id: ConversationId,
    message_type: MessageType,
    sender: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    recipient: Option<AgentId>,
    timestamp: DateTime<Utc>,
    ttl: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    in_reply_to: Option<MessageId>,
    payload: serde_json::Value,
    #[serde(default)]
    metadata: Metadata,
}

/// Wire form of [`Envelope`], checked before it becomes one
#[derive(Deserialize)]
struct RawEnvelope {
    message_id: MessageId,
    conversation_id: ConversationId,
    message_type: MessageType,
    sender: AgentId,
    #[serde(default)]
    recipient: Option<AgentId>,
    timestamp: DateTime<Utc>,
    ttl: Duration,
    #[serde(default)]
    in_reply_to: Option<MessageId>,
    payload: serde_json::Value,
    #[serde(default)]
    metadata: Metadata,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        check_fields(raw.ttl, &raw.sender)?;
        Ok(Envelope {
            message_id: raw.message_id,
            conversation_id: raw.conversation_id,
            message_type: raw.message_type,
            sender: raw.sender,
            recipient: raw.recipient,
            timestamp: raw.timestamp,
            ttl: raw.ttl,
            in_reply_to: raw.in_reply_to,
            payload: raw.payload,
            metadata: raw.metadata,
        })
    }
}

fn check_fields(ttl: Duration, sender: &AgentId) -> Result<(), EnvelopeError> {
    if ttl.is_zero() {
        return Err(EnvelopeError::NonPositiveTtl);
    }
    if sender.as_str().is_empty() {
        return Err(EnvelopeError::MissingSender);
    }
    Ok(())
}

impl Envelope {
    /// Start building an envelope
    pub fn builder(message_type: MessageType, sender: impl Into<AgentId>) -> EnvelopeBuilder {
        EnvelopeBuilder::new(message_type, sender)
    }

    /// Build a TASK envelope addressed to `recipient`
    pub fn task(
        conversation_id: ConversationId,
        sender: impl Into<AgentId>,
        recipient: impl Into<AgentId>,
        payload: &TaskPayload,
        ttl: Duration,
    ) -> Result<Self, EnvelopeError> {
        Self::builder(MessageType::Task, sender)
            .conversation(conversation_id)
            .recipient(recipient)
            .typed_payload(payload)?
            .ttl(ttl)
            .build()
    }

    /// Build a broadcast EVENT envelope
    pub fn event(
        conversation_id: ConversationId,
        sender: impl Into<AgentId>,
        payload: &EventPayload,
        ttl: Duration,
    ) -> Result<Self, EnvelopeError> {
        Self::builder(MessageType::Event, sender)
            .conversation(conversation_id)
            .typed_payload(payload)?
            .ttl(ttl)
            .build()
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn sender(&self) -> &AgentId {
        &self.sender
    }

    pub fn recipient(&self) -> Option<&AgentId> {
        self.recipient.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Message id of the TASK this envelope answers, if any
    pub fn in_reply_to(&self) -> Option<MessageId> {
        self.in_reply_to
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Instant after which the envelope may no longer be delivered
    pub fn expires_at(&self) -> DateTime<Utc> {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => self
                .timestamp
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Err(_) => DateTime::<Utc>::MAX_UTC,
        }
    }

    /// `now > timestamp + ttl`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    /// Build the correlated response to this envelope.
    ///
    /// The reply keeps the conversation id, ttl and metadata, swaps sender
    /// and recipient and points back at this message.
    pub fn reply(&self, message_type: MessageType, payload: serde_json::Value) -> Envelope {
        let sender = self
            .recipient
            .clone()
            .unwrap_or_else(|| AgentId::new("router"));
        Envelope {
            message_id: MessageId::new(),
            conversation_id: self.conversation_id,
            message_type,
            sender,
            recipient: Some(self.sender.clone()),
            timestamp: Utc::now(),
            ttl: self.ttl,
            in_reply_to: Some(self.message_id),
            payload,
            metadata: self.metadata.clone(),
        }
    }

    /// Same envelope with its metadata replaced
    pub(crate) fn with_metadata(mut self, metadata: Metadata) -> Envelope {
        self.metadata = metadata;
        self
    }

    /// RESULT reply carrying ranked items
    pub fn result_reply(&self, items: Vec<AgentResult>) -> Envelope {
        let payload = ResultPayload { items };
        self.reply(MessageType::Result, json_or_null(&payload))
    }

    /// ERROR reply with a reason and human readable detail
    pub fn error_reply(&self, reason: ErrorReason, detail: impl Into<String>) -> Envelope {
        let payload = ErrorPayload {
            reason,
            detail: detail.into(),
        };
        self.reply(MessageType::Error, json_or_null(&payload))
    }

    pub fn task_payload(&self) -> Result<TaskPayload, EnvelopeError> {
        self.decode(MessageType::Task, "TASK")
    }

    pub fn result_payload(&self) -> Result<ResultPayload, EnvelopeError> {
        self.decode(MessageType::Result, "RESULT")
    }

    pub fn error_payload(&self) -> Result<ErrorPayload, EnvelopeError> {
        self.decode(MessageType::Error, "ERROR")
    }

    pub fn event_payload(&self) -> Result<EventPayload, EnvelopeError> {
        self.decode(MessageType::Event, "EVENT")
    }

    fn decode<T: DeserializeOwned>(
        &self,
        expected_type: MessageType,
        expected: &'static str,
    ) -> Result<T, EnvelopeError> {
        if self.message_type != expected_type {
            return Err(EnvelopeError::InvalidPayload {
                expected,
                detail: format!("envelope is {}", self.message_type),
            });
        }
        serde_json::from_value(self.payload.clone()).map_err(|e| EnvelopeError::InvalidPayload {
            expected,
            detail: e.to_string(),
        })
    }
}

// Payload types in this module always serialize; Null only guards the impossible case.
fn json_or_null<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Builder for [`Envelope`]
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    message_type: MessageType,
    sender: AgentId,
    conversation_id: Option<ConversationId>,
    recipient: Option<AgentId>,
    timestamp: Option<DateTime<Utc>>,
    ttl: Duration,
    in_reply_to: Option<MessageId>,
    payload: serde_json::Value,
    metadata: Metadata,
}

impl EnvelopeBuilder {
    pub fn new(message_type: MessageType, sender: impl Into<AgentId>) -> Self {
        Self {
            message_type,
            sender: sender.into(),
            conversation_id: None,
            recipient: None,
            timestamp: None,
            ttl: Duration::ZERO,
            in_reply_to: None,
            payload: serde_json::Value::Null,
            metadata: Metadata::new(),
        }
    }

    pub fn conversation(mut self, id: ConversationId) -> Self {
        self.conversation_id = Some(id);
        self
    }

    pub fn recipient(mut self, recipient: impl Into<AgentId>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Override the creation time (defaults to now)
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn in_reply_to(mut self, id: MessageId) -> Self {
        self.in_reply_to = Some(id);
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn typed_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, EnvelopeError> {
        self.payload = serde_json::to_value(payload).map_err(|e| EnvelopeError::InvalidPayload {
            expected: "serializable",
            detail: e.to_string(),
        })?;
        Ok(self)
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validate and freeze the envelope
    pub fn build(self) -> Result<Envelope, EnvelopeError> {
        let conversation_id = self
            .conversation_id
            .ok_or(EnvelopeError::MissingConversation)?;
        check_fields(self.ttl, &self.sender)?;

        Ok(Envelope {
            message_id: MessageId::new(),
            conversation_id,
            message_type: self.message_type,
            sender: self.sender,
            recipient: self.recipient,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            ttl: self.ttl,
            in_reply_to: self.in_reply_to,
            payload: self.payload,
            metadata: self.metadata,
        })
    }
}

/// TASK payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub query: String,
    #[serde(default)]
    pub strategy_params: serde_json::Map<String, serde_json::Value>,
}

impl TaskPayload {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            strategy_params: serde_json::Map::new(),
        }
    }
}

/// One ranked item inside a RESULT payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: AgentId,
    /// 1-based position in the agent's own output
    pub rank: usize,
    /// Agent-local relevance; not comparable across agents
    pub score: f64,
    pub citation: String,
    pub content: String,
}

/// RESULT payload
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultPayload {
    pub items: Vec<AgentResult>,
}

/// Why an ERROR envelope was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    /// TTL elapsed before delivery
    Expired,
    /// No handler registered for the recipient
    UnregisteredRecipient,
    /// External store or LLM could not be reached
    UpstreamUnavailable,
    /// Reserved marker: empty results travel as RESULT, never as ERROR
    NoResultsIsNotAnError,
    /// Unexpected failure
    InternalError,
    /// Did not resolve within its budget
    TimedOut,
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorReason::Expired => "expired",
            ErrorReason::UnregisteredRecipient => "unregistered_recipient",
            ErrorReason::UpstreamUnavailable => "upstream_unavailable",
            ErrorReason::NoResultsIsNotAnError => "no_results_is_not_an_error",
            ErrorReason::InternalError => "internal_error",
            ErrorReason::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// ERROR payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub reason: ErrorReason,
    pub detail: String,
}

/// EVENT payload - progress notifications streamed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// Task envelopes handed to the router
    Dispatched { task_id: TaskId, agents: Vec<AgentId> },
    /// One agent resolved (or was given up on)
    AgentCompleted { task_id: TaskId, outcome: AgentOutcome },
    /// Progress moved
    Progress { task_id: TaskId, progress: u8 },
    /// Synthesis failed; fused list returned without prose
    SynthesisFailed { task_id: TaskId, detail: String },
}
