//! Context builder: personality + tone + history + stimulus -> request payload
//!
//! Building never mutates the entry. Memory changes only after a round-trip,
//! in the store.

use super::{ConversationEntry, Sentiment, TurnRole};
use crate::gateway::{ChatMessage, Role};

/// Name the agent answers as in flattened prompts
const AGENT_NAME: &str = "Yu Zhong";

/// Tone directive chosen from the sentiment counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneDirective {
    Favorable,
    Cold,
    Neutral,
}

impl ToneDirective {
    /// Strict three-way comparison; ties are neutral at any magnitude.
    pub fn from_sentiment(sentiment: &Sentiment) -> Self {
        use std::cmp::Ordering;
        match sentiment.positive.cmp(&sentiment.negative) {
            Ordering::Greater => Self::Favorable,
            Ordering::Less => Self::Cold,
            Ordering::Equal => Self::Neutral,
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            Self::Favorable => "You like this person. Be good to them, they are your friend.",
            Self::Cold => "This person has been rude. Be cold, dismissive, brief, but forgiving.",
            Self::Neutral => {
                "Neutral. This person is neutral, speak normal tone, not rude nor friendly."
            }
        }
    }
}

/// Labeled block appended after the stimulus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Supplement {
    pub label: String,
    pub content: String,
}

impl Supplement {
    pub fn new(label: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            content: content.into(),
        }
    }

    pub fn patch_notes(content: impl Into<String>) -> Self {
        Self::new("Latest MLBB Patch Notes", content)
    }

    fn render(&self) -> String {
        format!("[Context: {}]\n{}", self.label, self.content)
    }
}

/// A generation request ready for the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct RequestPayload {
    pub messages: Vec<ChatMessage>,
    /// Exactly what gets recorded as the user half of the turn
    pub stimulus: String,
    pub tone: ToneDirective,
}

impl RequestPayload {
    /// Flatten into one prompt for providers that take a single string.
    pub fn to_prompt_text(&self) -> String {
        let mut prompt = String::new();
        for message in &self.messages {
            match message.role {
                Role::System => {
                    prompt.push_str(&message.content);
                    prompt.push_str("\n\n");
                }
                Role::User => {
                    prompt.push_str(&message.content);
                    prompt.push('\n');
                }
                Role::Assistant => {
                    prompt.push_str(&format!("{}: {}\n", AGENT_NAME, message.content));
                }
            }
        }
        prompt.push_str(AGENT_NAME);
        prompt.push(':');
        prompt
    }
}

/// Builds generation requests around one personality frame
pub struct ContextBuilder<'a> {
    personality: &'a str,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(personality: &'a str) -> Self {
        Self { personality }
    }

    /// Chat request: the stimulus is `"{display_name}: {input}"`.
    pub fn build(
        &self,
        entry: &ConversationEntry,
        display_name: &str,
        input: &str,
        supplement: Option<&Supplement>,
    ) -> RequestPayload {
        let tone = ToneDirective::from_sentiment(&entry.sentiment);
        let system = format!("{}\n{}", self.personality, tone.text());
        let stimulus = format!("{}: {}", display_name, input);

        self.assemble(system, entry, stimulus, tone, supplement)
    }

    /// Search request: a search frame in the system message and a query
    /// stimulus that names the asker.
    pub fn build_search(
        &self,
        entry: &ConversationEntry,
        display_name: &str,
        query: &str,
        supplement: Option<&Supplement>,
    ) -> RequestPayload {
        let tone = ToneDirective::from_sentiment(&entry.sentiment);
        let system = format!(
            "{}\n\nYou are being asked to search for information about: '{}'. \
Provide helpful, accurate information while maintaining your Yu Zhong personality. \
Do not confuse other users with '{}'.\n{}",
            self.personality,
            query,
            display_name,
            tone.text()
        );
        let stimulus = format!(
            "{name}: Search for information about: {query}\n\n\
[User Info: Address the user as '{name}' in your response]",
            name = display_name,
            query = query
        );

        self.assemble(system, entry, stimulus, tone, supplement)
    }

    fn assemble(
        &self,
        system: String,
        entry: &ConversationEntry,
        stimulus: String,
        tone: ToneDirective,
        supplement: Option<&Supplement>,
    ) -> RequestPayload {
        let mut messages = Vec::with_capacity(entry.turns.len() + 2);
        messages.push(ChatMessage::system(system));

        for turn in &entry.turns {
            messages.push(match turn.role {
                TurnRole::User => ChatMessage::user(turn.content.clone()),
                TurnRole::Assistant => ChatMessage::assistant(turn.content.clone()),
            });
        }

        // Supplement goes after the stimulus so the ask stays nearest the end
        let content = match supplement {
            Some(s) if !s.content.trim().is_empty() => format!("{}\n\n{}", stimulus, s.render()),
            _ => stimulus.clone(),
        };
        messages.push(ChatMessage::user(content));

        RequestPayload {
            messages,
            stimulus,
            tone,
        }
    }
}
