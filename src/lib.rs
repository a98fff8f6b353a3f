//! # Docket
//!
//! Agent-to-agent orchestration core for multi-strategy retrieval.
//!
//! A user query becomes a task. The orchestrator sends one TASK envelope to
//! each retrieval agent through the router, collects whatever answers arrive
//! before the deadline, and fuses the rankings with Reciprocal Rank Fusion.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            ORCHESTRATOR                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌──────────┐  │
//! │  │ Task Tracker │  │ Conversation │  │ Rank Fusion  │  │Synthesis │  │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └──────────┘  │
//! └──────────────────────────────┬───────────────────────────────────────┘
//!                                │ TASK / RESULT / ERROR / EVENT
//!                        ┌───────▼───────┐        ┌─────────────┐
//!                        │    ROUTER     │───────►│ Event Store │
//!                        └───────┬───────┘  audit └─────────────┘
//!          ┌─────────────────────┼─────────────────────┐
//!          ▼                     ▼                     ▼
//!   ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!   │    Local    │       │   Global    │       │    Drift    │
//!   └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Envelope**: immutable message with a conversation id and a ttl
//! - **Router**: registry of handlers; expired or unroutable envelopes come
//!   back as ERROR envelopes
//! - **Agent**: a retrieval strategy behind the TASK/RESULT contract
//! - **Task**: caller-visible lifecycle `pending → working → completed | failed | cancelled`

pub mod agent;
pub mod channel;
pub mod config;
pub mod conversation;
pub mod envelope;
pub mod error;
pub mod event_store;
pub mod fusion;
pub mod observability;
pub mod orchestrator;
pub mod router;
pub mod tracker;

pub use agent::{AgentHandle, AgentKind, RetrievalAgent, RetrievalBackend, RetrievalError, RetrievedItem};
pub use channel::{TaskSubscription, TaskUpdate};
pub use config::DocketConfig;
pub use conversation::{Conversation, ConversationHandle};
pub use envelope::{
    AgentId, AgentResult, ConversationId, Envelope, ErrorReason, EventPayload, MessageId,
    MessageType, TaskId, TaskPayload,
};
pub use error::{DocketError, HandlerError, Result};
pub use event_store::{AuditSink, EventStore, InMemoryEventStore};
pub use fusion::{fuse, FusedItem, FusionConfig};
pub use orchestrator::{Orchestrator, Query, Synthesizer};
pub use router::{Handler, Router};
pub use tracker::{AgentOutcome, Artifact, OutcomeStatus, Task, TaskState, TaskTracker};
