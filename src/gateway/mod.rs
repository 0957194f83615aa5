//! Generation Gateway
//!
//! Isolates the engine from the provider's failure modes. Every call yields a
//! [`GenerationOutcome`]; nothing propagates. The provider handle is resolved
//! by [`GenerationGateway::ensure_initialized`]: a configuration failure is
//! kept for the life of the process, a transient one is retried next call.

mod openai;
mod provider;

pub use openai::OpenAiCompatProvider;
pub use provider::{ChatMessage, ChatRequest, GenerationProvider, ProviderReply, Role};

use crate::config::ProviderSettings;
use crate::memory::RequestPayload;
use crate::reference::Summarizer;
use crate::{Result, YuzhongError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

const TRUNCATION_MARKER: &str = "...";

/// Raw reference text is clipped to this many chars before summarizing
const MAX_SUMMARY_INPUT_CHARS: usize = 8000;

/// Sampling parameters for one call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerationParams {
    pub fn new(max_tokens: u32, temperature: f32) -> Self {
        Self {
            max_tokens,
            temperature,
        }
    }
}

/// Which set of fallback messages applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    Chat,
    Search,
}

/// Result of one provider round-trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Non-empty text, already cut to the reply ceiling
    Success(String),
    Empty,
    RateLimited,
    Failed(String),
}

impl GenerationOutcome {
    /// Text to send back for this outcome. Failures map to fixed in-character
    /// messages so the user always gets a reply.
    pub fn reply_text(&self, mode: ReplyMode) -> &str {
        match (self, mode) {
            (Self::Success(text), _) => text.as_str(),
            (Self::Empty, ReplyMode::Chat) => "My power wanes... I cannot respond at this moment.",
            (Self::Empty, ReplyMode::Search) => {
                "My power wanes... I cannot fulfill this search at the moment."
            }
            (Self::RateLimited, ReplyMode::Chat) => {
                "Even a dragon's power is not infinite. My voice is temporarily restricted."
            }
            (Self::RateLimited, ReplyMode::Search) => {
                "Even a dragon's power is not infinite. My knowledge is temporarily restricted."
            }
            (Self::Failed(_), ReplyMode::Chat) => {
                "A temporal distortion in the flow of power prevents my response."
            }
            (Self::Failed(_), ReplyMode::Search) => {
                "A temporal distortion in the flow of power prevents my search."
            }
        }
    }

    /// Whether the turn goes into memory. Empty replies are not recorded.
    pub fn should_record(&self) -> bool {
        !matches!(self, Self::Empty)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Resolved provider handle
struct Capability {
    provider: Arc<dyn GenerationProvider>,
    model: String,
}

enum InitFailure {
    /// Missing credentials or an unknown model; stored
    Config(String),
    /// Network trouble while listing models; retried
    Transient(String),
}

enum ProviderSource {
    Http(ProviderSettings),
    Injected(Arc<dyn GenerationProvider>),
}

pub struct GenerationGateway {
    source: ProviderSource,
    wanted_model: Option<String>,
    call_timeout: Duration,
    max_reply_chars: usize,
    capability: OnceCell<std::result::Result<Capability, String>>,
}

impl GenerationGateway {
    /// Gateway over the OpenAI-compatible HTTP provider described by `settings`.
    pub fn new(settings: ProviderSettings, max_reply_chars: usize) -> Self {
        Self {
            wanted_model: settings.model.clone(),
            call_timeout: settings.timeout,
            max_reply_chars,
            source: ProviderSource::Http(settings),
            capability: OnceCell::new(),
        }
    }

    /// Gateway over an already-built provider.
    pub fn with_provider(
        provider: Arc<dyn GenerationProvider>,
        model: impl Into<String>,
        max_reply_chars: usize,
    ) -> Self {
        Self {
            source: ProviderSource::Injected(provider),
            wanted_model: Some(model.into()),
            call_timeout: ProviderSettings::default().timeout,
            max_reply_chars,
            capability: OnceCell::new(),
        }
    }

    /// Build the provider and resolve the model name. Success and
    /// configuration failures are stored; a transient failure leaves the
    /// gateway uninitialized so the next call tries again.
    pub async fn ensure_initialized(&self) -> Result<&str> {
        let state = self
            .capability
            .get_or_try_init(|| async {
                match self.initialize().await {
                    Ok(capability) => Ok(Ok(capability)),
                    Err(InitFailure::Config(reason)) => {
                        error!("{}. AI features disabled.", reason);
                        Ok(Err(reason))
                    }
                    Err(InitFailure::Transient(reason)) => {
                        warn!("{}. Will retry on the next request.", reason);
                        Err(YuzhongError::Upstream(reason))
                    }
                }
            })
            .await?;

        match state {
            Ok(capability) => Ok(capability.model.as_str()),
            Err(reason) => Err(YuzhongError::Config(reason.clone())),
        }
    }

    pub async fn is_available(&self) -> bool {
        self.ensure_initialized().await.is_ok()
    }

    async fn initialize(&self) -> std::result::Result<Capability, InitFailure> {
        let wanted = self
            .wanted_model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| InitFailure::Config("Provider model name missing".to_string()))?
            .to_string();

        let provider: Arc<dyn GenerationProvider> = match &self.source {
            ProviderSource::Http(settings) => Arc::new(
                OpenAiCompatProvider::from_settings(settings)
                    .map_err(|e| InitFailure::Config(e.to_string()))?,
            ),
            ProviderSource::Injected(provider) => provider.clone(),
        };

        let listing = tokio::time::timeout(self.call_timeout, provider.list_models()).await;
        let models = match listing {
            Ok(Ok(models)) => models,
            Ok(Err(YuzhongError::Config(reason))) => return Err(InitFailure::Config(reason)),
            Ok(Err(e)) => {
                return Err(InitFailure::Transient(format!(
                    "Failed to list provider models: {}",
                    e
                )))
            }
            Err(_) => {
                return Err(InitFailure::Transient(
                    "Timed out listing provider models".to_string(),
                ))
            }
        };
        info!("Available models: {:?}", models);

        let model = resolve_model(&models, &wanted)
            .ok_or_else(|| InitFailure::Config(format!("Model '{}' not found", wanted)))?;
        info!("Model resolved: {}", model);

        Ok(Capability { provider, model })
    }

    /// One round-trip for a built payload.
    pub async fn generate(
        &self,
        payload: &RequestPayload,
        params: GenerationParams,
    ) -> GenerationOutcome {
        self.complete_messages(payload.messages.clone(), params).await
    }

    /// One round-trip for raw messages. Exactly one attempt, bounded by the
    /// call timeout.
    pub async fn complete_messages(
        &self,
        messages: Vec<ChatMessage>,
        params: GenerationParams,
    ) -> GenerationOutcome {
        let capability = match self.capability_handle().await {
            Ok(capability) => capability,
            Err(reason) => return GenerationOutcome::Failed(reason),
        };

        let request = ChatRequest {
            model: capability.model.clone(),
            messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        };

        let call = capability.provider.complete(&request);
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(reply)) => match reply.content.as_deref().map(str::trim) {
                Some(text) if !text.is_empty() => {
                    debug!("Generation succeeded ({} chars)", text.chars().count());
                    GenerationOutcome::Success(truncate_reply(text, self.max_reply_chars))
                }
                _ => {
                    warn!("Provider returned no content");
                    GenerationOutcome::Empty
                }
            },
            Ok(Err(YuzhongError::RateLimited(message))) => {
                warn!("Provider rate limited: {}", message);
                GenerationOutcome::RateLimited
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                if openai::is_rate_limit_message(&message) {
                    warn!("Provider rate limited: {}", message);
                    GenerationOutcome::RateLimited
                } else {
                    error!("Error calling provider: {}", message);
                    GenerationOutcome::Failed(message)
                }
            }
            Err(_) => {
                error!("Provider call timed out after {:?}", self.call_timeout);
                GenerationOutcome::Failed("timeout".to_string())
            }
        }
    }

    async fn capability_handle(&self) -> std::result::Result<&Capability, String> {
        self.ensure_initialized().await.map_err(|e| e.to_string())?;
        match self.capability.get() {
            Some(Ok(capability)) => Ok(capability),
            _ => Err("generation unavailable".to_string()),
        }
    }
}

/// Exact match wins; otherwise the first model whose id contains `wanted`.
fn resolve_model(models: &[String], wanted: &str) -> Option<String> {
    models
        .iter()
        .find(|m| m.as_str() == wanted)
        .or_else(|| models.iter().find(|m| m.contains(wanted)))
        .cloned()
}

/// Cut `text` to `max_chars`, ending with the truncation marker when cut.
/// A ceiling too small for the marker cuts without it.
pub fn truncate_reply(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= TRUNCATION_MARKER.len() {
        return text.chars().take(max_chars).collect();
    }
    let keep = max_chars.saturating_sub(TRUNCATION_MARKER.len());
    let mut truncated: String = text.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

/// Summarizes reference text through the gateway, in character.
pub struct GatewaySummarizer {
    gateway: Arc<GenerationGateway>,
    personality: String,
    params: GenerationParams,
}

impl GatewaySummarizer {
    pub fn new(
        gateway: Arc<GenerationGateway>,
        personality: impl Into<String>,
        params: GenerationParams,
    ) -> Self {
        Self {
            gateway,
            personality: personality.into(),
            params,
        }
    }
}

#[async_trait]
impl Summarizer for GatewaySummarizer {
    async fn summarize(&self, raw: &str) -> Result<String> {
        let clipped: String = raw.chars().take(MAX_SUMMARY_INPUT_CHARS).collect();
        let prompt = format!(
            "Summarize the following Mobile Legends: Bang Bang patch notes concisely and in a tone suitable for Yu Zhong \
(authoritative, a bit dismissive, focusing on key changes like buffs/nerfs). Keep it under 300 words. \
Focus on important hero or item changes. If there are no clear changes, state that.\n\nRaw text:\n{}",
            clipped
        );
        let messages = vec![
            ChatMessage::system(self.personality.clone()),
            ChatMessage::user(prompt),
        ];

        match self.gateway.complete_messages(messages, self.params).await {
            GenerationOutcome::Success(summary) => Ok(summary),
            GenerationOutcome::Empty => Err(YuzhongError::Upstream("empty summary".to_string())),
            GenerationOutcome::RateLimited => {
                Err(YuzhongError::RateLimited("summary rate limited".to_string()))
            }
            GenerationOutcome::Failed(reason) => Err(YuzhongError::Upstream(reason)),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted provider shared by unit tests across modules.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) struct ScriptedProvider {
        pub models: Vec<String>,
        replies: Mutex<VecDeque<Result<ProviderReply>>>,
        pub requests: Mutex<Vec<ChatRequest>>,
        pub list_calls: AtomicUsize,
        list_failures: AtomicUsize,
    }

    impl ScriptedProvider {
        pub(crate) fn new(models: &[&str]) -> Self {
            Self {
                models: models.iter().map(|m| m.to_string()).collect(),
                replies: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                list_calls: AtomicUsize::new(0),
                list_failures: AtomicUsize::new(0),
            }
        }

        /// Fail the next `n` model listings with a network error
        pub(crate) fn fail_listings(&self, n: usize) {
            self.list_failures.store(n, Ordering::SeqCst);
        }

        pub(crate) fn push(&self, reply: Result<ProviderReply>) {
            self.replies.lock().unwrap().push_back(reply);
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub(crate) fn last_request(&self) -> Option<ChatRequest> {
            self.requests.lock().unwrap().last().cloned()
        }

        pub(crate) fn list_count(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationProvider for ScriptedProvider {
        async fn complete(&self, request: &ChatRequest) -> Result<ProviderReply> {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ProviderReply::empty()))
        }

        async fn list_models(&self) -> Result<Vec<String>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .list_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(YuzhongError::Upstream("network: connection reset".to_string()));
            }
            Ok(self.models.clone())
        }
    }
}
