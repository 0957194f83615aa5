//! Yu Zhong - stateful chat agent
//!
//! A conversational agent that sits behind a chat transport and:
//! - Keeps bounded, persistent per-user memory with a sentiment accumulator
//! - Builds in-character prompts from that memory
//! - Caches scraped patch notes with ordered source fallback
//! - Shields the transport from generation provider failures

pub mod activation;
pub mod clock;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod memory;
pub mod reference;

pub use activation::ActivationRegistry;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::YuzhongConfig;
pub use engine::{AdminCommand, Engine, InboundMessage};
pub use gateway::{GenerationGateway, GenerationOutcome};
pub use memory::{ConversationEntry, ConversationKey, ContextBuilder, MemoryStore};
pub use reference::{ReferenceCache, UNAVAILABLE_SENTINEL};

/// Result type for Yu Zhong operations
pub type Result<T> = std::result::Result<T, YuzhongError>;

/// Errors that can occur in Yu Zhong
#[derive(Debug, thiserror::Error)]
pub enum YuzhongError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}
