//! Memory module for Yu Zhong
//!
//! Bounded per-(scope, user) conversation logs with a sentiment accumulator,
//! their durable storage, and the prompt builder that reads them.

mod backend;
mod context;
mod entry;
mod sentiment;
mod store;

pub use backend::{EphemeralBackend, FileBackend, MemoryBackend};
pub use context::{ContextBuilder, RequestPayload, Supplement, ToneDirective};
pub use entry::{
    ConversationEntry, ConversationKey, MemoryBudget, Sentiment, SentimentDelta, Turn, TurnRole,
    DEFAULT_MEMORY_BYTES, DM_SCOPE,
};
pub use sentiment::SentimentClassifier;
pub use store::{FlushReport, MemoryStore, PersistMode, ResetOutcome};
