//! Content sources for the reference cache and the HTML extractor behind
//! [`HttpPageSource`].

use crate::{Result, YuzhongError};
use async_trait::async_trait;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use tracing::debug;

/// Selectors tried in order; the first one yielding relevant blocks wins.
const CONTENT_SELECTORS: &[&str] = &[
    "div.news-content",
    "article.news-item",
    "div.news-detail-content",
    "div.article-content",
    "div.post-content",
    "p",
    "h2",
    "h3",
];

const MAX_BLOCKS: usize = 3;
const MIN_BLOCK_CHARS: usize = 50;
const MAX_BLOCK_CHARS: usize = 500;

const MAX_SENTENCES: usize = 5;
const MIN_SENTENCE_CHARS: usize = 30;
const MAX_SENTENCE_CHARS: usize = 200;

/// One place reference text can come from
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Usable text, or an error when nothing relevant was found
    async fn fetch(&self) -> Result<String>;
}

/// Scrapes one web page for keyword-relevant text
pub struct HttpPageSource {
    url: String,
    keywords: Vec<String>,
    client: Client,
}

impl HttpPageSource {
    pub fn new(url: impl Into<String>, keywords: &[String], timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(
                "Mozilla/5.0 (compatible; yuzhong/",
                env!("CARGO_PKG_VERSION"),
                ")"
            ))
            .build()?;
        Ok(Self {
            url: url.into(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            client,
        })
    }
}

#[async_trait]
impl ContentSource for HttpPageSource {
    fn name(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<String> {
        let response = self.client.get(&self.url).send().await?.error_for_status()?;
        let html = response.text().await?;
        debug!("Fetched {} bytes from {}", html.len(), self.url);

        extract_relevant(&html, &self.url, &self.keywords)
            .ok_or_else(|| YuzhongError::Upstream(format!("no relevant content at {}", self.url)))
    }
}

/// Pull relevant text out of a page.
///
/// Blocks matched by [`CONTENT_SELECTORS`] come first; failing that, keyword
/// sentences from the whole document. `keywords` must be lowercase.
pub fn extract_relevant(html: &str, origin: &str, keywords: &[String]) -> Option<String> {
    let document = Html::parse_document(html);
    let relevant = |text: &str| {
        let lower = text.to_lowercase();
        keywords.iter().any(|k| lower.contains(k.as_str()))
    };

    for sel_str in CONTENT_SELECTORS {
        let Ok(selector) = Selector::parse(sel_str) else {
            continue;
        };

        let mut blocks = Vec::new();
        for element in document.select(&selector) {
            let text = stripped_text(&element);
            if text.chars().count() > MIN_BLOCK_CHARS && relevant(&text) {
                blocks.push(clip(&text, MAX_BLOCK_CHARS));
                if blocks.len() >= MAX_BLOCKS {
                    break;
                }
            }
        }

        if !blocks.is_empty() {
            return Some(format!("Latest from {}:\n{}", origin, blocks.join("\n\n")));
        }
    }

    let all_text: String = document.root_element().text().collect();
    let sentences: Vec<String> = all_text
        .split('.')
        .map(str::trim)
        .filter(|s| s.chars().count() > MIN_SENTENCE_CHARS && relevant(s))
        .take(MAX_SENTENCES)
        .map(|s| clip(s, MAX_SENTENCE_CHARS))
        .collect();

    if sentences.is_empty() {
        None
    } else {
        Some(format!("Recent patch information:\n{}", sentences.join("\n• ")))
    }
}

/// Text of every descendant node, each trimmed, concatenated
fn stripped_text(element: &ElementRef) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect()
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keywords() -> Vec<String> {
        crate::config::DEFAULT_PATCH_KEYWORDS
            .iter()
            .map(|k| k.to_string())
            .collect()
    }

    #[test]
    fn test_selector_blocks_in_order() {
        let html = r#"<html><body>
            <div class="news-content">Patch 1.8.92 brings a hero balance adjustment to several junglers.</div>
            <div class="news-content">Short patch.</div>
            <div class="news-content">Community event with skins and prizes for everyone who logs in.</div>
            <p>This paragraph mentions a nerf but should not be reached at all here.</p>
        </body></html>"#;

        let text = extract_relevant(html, "https://m.example/news", &keywords()).unwrap();
        assert_eq!(
            text,
            "Latest from https://m.example/news:\nPatch 1.8.92 brings a hero balance adjustment to several junglers."
        );
    }

    #[test]
    fn test_blocks_capped_and_clipped() {
        let long = format!("Hero buff {}", "x".repeat(600));
        let html = format!("<p>{long}</p><p>{long}</p><p>{long}</p><p>{long}</p>");

        let text = extract_relevant(&html, "src", &keywords()).unwrap();
        let body = text.strip_prefix("Latest from src:\n").unwrap();
        let blocks: Vec<&str> = body.split("\n\n").collect();
        assert_eq!(blocks.len(), 3);
        assert!(blocks.iter().all(|b| b.chars().count() == 500));
    }

    #[test]
    fn test_sentence_fallback() {
        let html = "<div>Nothing here. The latest update reworks the hero Yu Zhong completely. Bye.</div>";
        let text = extract_relevant(html, "src", &keywords()).unwrap();
        assert_eq!(
            text,
            "Recent patch information:\nThe latest update reworks the hero Yu Zhong completely"
        );
    }

    #[test]
    fn test_irrelevant_page_yields_nothing() {
        let html = "<p>Welcome to our store. We sell shoes, socks and hats for all seasons.</p>";
        assert_eq!(extract_relevant(html, "src", &keywords()), None);
    }
}
