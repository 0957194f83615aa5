//! Keyword sentiment classification of user stimuli

use super::SentimentDelta;
use regex::Regex;

const POSITIVE_WORDS: &[&str] = &[
    "thank", "great", "awesome", "good", "love", "thanks", "nice", "cool", "helpful",
];

const NEGATIVE_WORDS: &[&str] = &[
    "hate", "bad", "stupid", "annoying", "idiot", "sucks", "dislike", "useless",
];

/// Classifies a stimulus by substring keyword match.
///
/// Positive keywords win when both kinds appear.
pub struct SentimentClassifier {
    positive: Regex,
    negative: Regex,
}

impl SentimentClassifier {
    pub fn new() -> Self {
        Self {
            positive: Self::compile(POSITIVE_WORDS),
            negative: Self::compile(NEGATIVE_WORDS),
        }
    }

    fn compile(words: &[&str]) -> Regex {
        let alternation = words
            .iter()
            .map(|w| regex::escape(w))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!("(?i)(?:{alternation})")).unwrap()
    }

    pub fn classify(&self, text: &str) -> SentimentDelta {
        if self.positive.is_match(text) {
            SentimentDelta::Positive
        } else if self.negative.is_match(text) {
            SentimentDelta::Negative
        } else {
            SentimentDelta::Neutral
        }
    }
}

impl Default for SentimentClassifier {
    fn default() -> Self {
        Self::new()
    }
}
