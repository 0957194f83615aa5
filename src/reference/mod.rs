//! Reference Cache: TTL-bounded reference text per topic.
//!
//! On a miss, sources are tried in their registered order and the first
//! usable result wins; content from different sources is never merged. Every
//! result is cached for the full TTL, including the unavailable sentinel.
//! Concurrent refreshes of one topic may both fetch; the last store wins.

mod source;

pub use source::{extract_relevant, ContentSource, HttpPageSource};

use crate::clock::Clock;
use crate::config::ReferenceSettings;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Topic under which patch notes are cached
pub const PATCH_TOPIC: &str = "patch";

/// Served when every source fails
pub const UNAVAILABLE_SENTINEL: &str =
    "Unable to fetch current patch notes. The Land of Dawn's secrets remain hidden for now.";

/// Turns raw extracted text into a compact summary
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, raw: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
struct CachedPayload {
    payload: String,
    fetched_at: DateTime<Utc>,
}

pub struct ReferenceCache {
    topics: HashMap<String, Vec<Arc<dyn ContentSource>>>,
    cells: RwLock<HashMap<String, CachedPayload>>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    source_timeout: Duration,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl ReferenceCache {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration, source_timeout: Duration) -> Self {
        Self {
            topics: HashMap::new(),
            cells: RwLock::new(HashMap::new()),
            clock,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)),
            source_timeout,
            summarizer: None,
        }
    }

    /// Cache with the patch topic wired to HTTP page sources from `settings`.
    pub fn from_settings(settings: &ReferenceSettings, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut cache = Self::new(clock, settings.ttl, settings.source_timeout);
        let mut sources: Vec<Arc<dyn ContentSource>> = Vec::with_capacity(settings.sources.len());
        for url in &settings.sources {
            sources.push(Arc::new(HttpPageSource::new(
                url.as_str(),
                &settings.keywords,
                settings.source_timeout,
            )?));
        }
        cache.register_topic(PATCH_TOPIC, sources);
        Ok(cache)
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Register (or replace) the ordered sources for `topic`.
    pub fn register_topic(
        &mut self,
        topic: impl Into<String>,
        sources: Vec<Arc<dyn ContentSource>>,
    ) {
        self.topics.insert(topic.into(), sources);
    }

    /// Current text for `topic`. Never fails and never blocks past the
    /// per-source timeouts.
    pub async fn get(&self, topic: &str) -> String {
        if let Some(payload) = self.cached(topic).await {
            debug!("Reference cache hit for {}", topic);
            return payload;
        }
        debug!("Reference cache miss for {}", topic);
        self.refresh(topic).await
    }

    /// Re-fetch `topic` regardless of age and cache the result.
    pub async fn refresh(&self, topic: &str) -> String {
        let Some(sources) = self.topics.get(topic) else {
            warn!("No sources registered for reference topic '{}'", topic);
            return UNAVAILABLE_SENTINEL.to_string();
        };

        let payload = match self.fetch_first(sources).await {
            Some(raw) => self.summarize_or_raw(raw).await,
            None => {
                warn!("All sources failed for reference topic '{}'", topic);
                UNAVAILABLE_SENTINEL.to_string()
            }
        };

        // TTL runs from when the result is stored, not from when fetching began
        let fetched_at = self.clock.now();
        self.cells.write().await.insert(
            topic.to_string(),
            CachedPayload {
                payload: payload.clone(),
                fetched_at,
            },
        );
        payload
    }

    async fn cached(&self, topic: &str) -> Option<String> {
        let cells = self.cells.read().await;
        let cell = cells.get(topic)?;
        if self.clock.now() - cell.fetched_at < self.ttl {
            Some(cell.payload.clone())
        } else {
            None
        }
    }

    async fn fetch_first(&self, sources: &[Arc<dyn ContentSource>]) -> Option<String> {
        for source in sources {
            match tokio::time::timeout(self.source_timeout, source.fetch()).await {
                Ok(Ok(text)) if !text.trim().is_empty() => {
                    info!("Reference content fetched from {}", source.name());
                    return Some(text);
                }
                Ok(Ok(_)) => warn!("Source {} returned no content", source.name()),
                Ok(Err(e)) => warn!("Failed to fetch or parse from {}: {}", source.name(), e),
                Err(_) => warn!(
                    "Source {} timed out after {:?}",
                    source.name(),
                    self.source_timeout
                ),
            }
        }
        None
    }

    async fn summarize_or_raw(&self, raw: String) -> String {
        let Some(summarizer) = &self.summarizer else {
            return raw;
        };
        match summarizer.summarize(&raw).await {
            Ok(summary) if !summary.trim().is_empty() => summary,
            Ok(_) => {
                warn!("Summarization returned nothing. Using scraped text fallback.");
                raw
            }
            Err(e) => {
                warn!("Summarization failed: {}. Using scraped text fallback.", e);
                raw
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::YuzhongError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        name: String,
        result: std::result::Result<String, String>,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn ok(name: &str, text: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                result: Ok(text.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                result: Err("connection refused".to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContentSource for FakeSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone().map_err(YuzhongError::Upstream)
        }
    }

    struct HangingSource;

    #[async_trait]
    impl ContentSource for HangingSource {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn fetch(&self) -> Result<String> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    struct FixedSummarizer(std::result::Result<&'static str, &'static str>);

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, _raw: &str) -> Result<String> {
            self.0
                .map(str::to_string)
                .map_err(|e| YuzhongError::Upstream(e.to_string()))
        }
    }

    fn cache_with(clock: &ManualClock, sources: Vec<Arc<dyn ContentSource>>) -> ReferenceCache {
        let mut cache = ReferenceCache::new(
            Arc::new(clock.clone()),
            Duration::from_secs(3600),
            Duration::from_secs(10),
        );
        cache.register_topic(PATCH_TOPIC, sources);
        cache
    }

    #[tokio::test]
    async fn test_ttl_hit_then_expiry() {
        let clock = ManualClock::default();
        let source = FakeSource::ok("a", "Ling nerfed");
        let cache = cache_with(&clock, vec![source.clone()]);

        assert_eq!(cache.get(PATCH_TOPIC).await, "Ling nerfed");
        clock.advance(chrono::Duration::minutes(30));
        assert_eq!(cache.get(PATCH_TOPIC).await, "Ling nerfed");
        assert_eq!(source.calls(), 1);

        clock.advance(chrono::Duration::minutes(31));
        cache.get(PATCH_TOPIC).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_fallback_ordering() {
        let clock = ManualClock::default();
        let a = FakeSource::failing("a");
        let b = FakeSource::ok("b", "from b");
        let c = FakeSource::ok("c", "from c");
        let cache = cache_with(&clock, vec![a.clone(), b.clone(), c.clone()]);

        assert_eq!(cache.get(PATCH_TOPIC).await, "from b");
        assert_eq!(cache.get(PATCH_TOPIC).await, "from b");
        assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_all_fail_caches_sentinel() {
        let clock = ManualClock::default();
        let sources: Vec<Arc<FakeSource>> =
            (0..3).map(|i| FakeSource::failing(&i.to_string())).collect();
        let cache = cache_with(
            &clock,
            sources.iter().map(|s| s.clone() as Arc<dyn ContentSource>).collect(),
        );

        assert_eq!(cache.get(PATCH_TOPIC).await, UNAVAILABLE_SENTINEL);
        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(cache.get(PATCH_TOPIC).await, UNAVAILABLE_SENTINEL);
        assert!(sources.iter().all(|s| s.calls() == 1));
    }

    #[tokio::test]
    async fn test_blank_content_counts_as_failure() {
        let clock = ManualClock::default();
        let blank = FakeSource::ok("blank", "   ");
        let good = FakeSource::ok("good", "Hero buffs");
        let cache = cache_with(&clock, vec![blank, good]);
        assert_eq!(cache.get(PATCH_TOPIC).await, "Hero buffs");
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_timeout_advances() {
        let clock = ManualClock::default();
        let good = FakeSource::ok("good", "after timeout");
        let cache = cache_with(&clock, vec![Arc::new(HangingSource), good.clone()]);

        assert_eq!(cache.get(PATCH_TOPIC).await, "after timeout");
        assert_eq!(good.calls(), 1);
    }

    #[tokio::test]
    async fn test_summary_and_raw_fallback() {
        let clock = ManualClock::default();
        let cache = cache_with(&clock, vec![FakeSource::ok("a", "raw notes")])
            .with_summarizer(Arc::new(FixedSummarizer(Ok("Pathetic changes."))));
        assert_eq!(cache.get(PATCH_TOPIC).await, "Pathetic changes.");

        let cache = cache_with(&clock, vec![FakeSource::ok("a", "raw notes")])
            .with_summarizer(Arc::new(FixedSummarizer(Err("rate limit"))));
        assert_eq!(cache.get(PATCH_TOPIC).await, "raw notes");
    }

    /// Summarizer that takes 40 minutes of clock time
    struct SlowSummarizer(ManualClock);

    #[async_trait]
    impl Summarizer for SlowSummarizer {
        async fn summarize(&self, raw: &str) -> Result<String> {
            self.0.advance(chrono::Duration::minutes(40));
            Ok(format!("summary of {raw}"))
        }
    }

    #[tokio::test]
    async fn test_ttl_starts_when_result_is_stored() {
        let clock = ManualClock::default();
        let source = FakeSource::ok("a", "notes");
        let cache = cache_with(&clock, vec![source.clone()])
            .with_summarizer(Arc::new(SlowSummarizer(clock.clone())));

        assert_eq!(cache.get(PATCH_TOPIC).await, "summary of notes");
        clock.advance(chrono::Duration::minutes(30));
        assert_eq!(cache.get(PATCH_TOPIC).await, "summary of notes");
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_ignores_ttl() {
        let clock = ManualClock::default();
        let source = FakeSource::ok("a", "notes");
        let cache = cache_with(&clock, vec![source.clone()]);

        cache.get(PATCH_TOPIC).await;
        cache.refresh(PATCH_TOPIC).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_topic_is_sentinel() {
        let cache = cache_with(&ManualClock::default(), Vec::new());
        assert_eq!(cache.get("tier-list").await, UNAVAILABLE_SENTINEL);
    }
}
