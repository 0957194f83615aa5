//! Conversation entries: the per-key log and its sentiment counters.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Scope used for direct messages, which have no server
pub const DM_SCOPE: &str = "DM";

/// Byte budget used by the byte-measured deployment variant
pub const DEFAULT_MEMORY_BYTES: usize = 500_000;

/// Identifies one memory entry: (scope, user)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey {
    pub scope: String,
    pub user: String,
}

impl ConversationKey {
    pub fn new(scope: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            user: user.into(),
        }
    }

    /// Key for a direct-message conversation
    pub fn direct(user: impl Into<String>) -> Self {
        Self::new(DM_SCOPE, user)
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.scope, self.user)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    #[serde(alias = "agent")]
    Assistant,
}

/// One half of an exchange. Turns are always stored in (user, assistant) pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// Monotonic counters nudging the tone directive.
///
/// `neutral` is carried for record compatibility and never gates behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentiment {
    #[serde(default)]
    pub positive: u64,
    #[serde(default)]
    pub negative: u64,
    #[serde(default)]
    pub neutral: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentimentDelta {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub fn new(positive: u64, negative: u64) -> Self {
        Self {
            positive,
            negative,
            neutral: 0,
        }
    }

    /// Increment the counter named by `delta`; neutral deltas are no-ops.
    pub fn record(&mut self, delta: SentimentDelta) {
        match delta {
            SentimentDelta::Positive => self.positive = self.positive.saturating_add(1),
            SentimentDelta::Negative => self.negative = self.negative.saturating_add(1),
            SentimentDelta::Neutral => {}
        }
    }
}

/// How the size ceiling of `turns` is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryBudget {
    /// Whitespace-separated words across all turn contents
    Words(usize),
    /// Serialized JSON bytes of the turn list
    Bytes(usize),
}

impl MemoryBudget {
    pub fn limit(&self) -> usize {
        match self {
            Self::Words(n) | Self::Bytes(n) => *n,
        }
    }

    pub fn measure(&self, turns: &[Turn]) -> usize {
        match self {
            Self::Words(_) => turns
                .iter()
                .map(|t| t.content.split_whitespace().count())
                .sum(),
            Self::Bytes(_) => serde_json::to_vec(turns).map(|b| b.len()).unwrap_or(0),
        }
    }

    pub fn exceeded_by(&self, turns: &[Turn]) -> bool {
        self.measure(turns) > self.limit()
    }
}

/// Stored memory for one key.
///
/// Serialized as `{ "log": [...], "tone": {...} }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredRecord")]
pub struct ConversationEntry {
    /// Oldest first
    #[serde(rename = "log")]
    pub turns: Vec<Turn>,

    #[serde(rename = "tone")]
    pub sentiment: Sentiment,
}

impl ConversationEntry {
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty() && self.sentiment == Sentiment::default()
    }

    /// Number of complete (user, assistant) pairs
    pub fn pairs(&self) -> usize {
        self.turns.len() / 2
    }

    /// Record one exchange, bump sentiment, then prune to the budget.
    pub fn record_exchange(
        &mut self,
        stimulus: impl Into<String>,
        response: impl Into<String>,
        delta: SentimentDelta,
        budget: MemoryBudget,
    ) {
        self.turns.push(Turn::user(stimulus));
        self.turns.push(Turn::assistant(response));
        self.sentiment.record(delta);
        self.prune(budget);
    }

    /// Evict the oldest pairs until the log fits `budget` or a single pair
    /// remains. Returns the number of turns removed.
    ///
    /// An odd-length log is malformed: its oldest element is dropped first so
    /// pairs line up again.
    pub fn prune(&mut self, budget: MemoryBudget) -> usize {
        let mut removed = 0;

        if self.turns.len() % 2 == 1 {
            warn!(
                "Conversation log has odd length {}, dropping oldest turn",
                self.turns.len()
            );
            self.turns.remove(0);
            removed += 1;
        }

        while self.turns.len() > 2 && budget.exceeded_by(&self.turns) {
            self.turns.drain(..2);
            removed += 2;
        }

        removed
    }
}

/// On-disk shape, tolerant of missing fields and legacy free-text lines.
#[derive(Debug, Default, Deserialize)]
struct StoredRecord {
    #[serde(default)]
    log: Vec<StoredLogItem>,
    #[serde(default)]
    tone: Sentiment,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredLogItem {
    Turn(Turn),
    Line(String),
}

impl From<StoredRecord> for ConversationEntry {
    fn from(record: StoredRecord) -> Self {
        let mut turns = Vec::with_capacity(record.log.len());
        for item in record.log {
            match item {
                StoredLogItem::Turn(turn) => turns.push(turn),
                StoredLogItem::Line(line) => {
                    let (stimulus, response) = split_legacy_line(&line);
                    turns.push(Turn::user(stimulus));
                    turns.push(Turn::assistant(response));
                }
            }
        }
        Self {
            turns,
            sentiment: record.tone,
        }
    }
}

/// Split `"name: X | Yu Zhong: Y"` into its stimulus and response halves.
fn split_legacy_line(line: &str) -> (String, String) {
    match line.split_once(" | ") {
        Some((stimulus, response)) => (stimulus.trim().to_string(), response.trim().to_string()),
        None => (line.trim().to_string(), String::new()),
    }
}
