//! Engine: the interface a chat transport calls into.
//!
//! One inbound message yields at most one provider attempt. Memory is only
//! touched after the attempt finishes, according to its outcome.

use crate::activation::ActivationRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::YuzhongConfig;
use crate::gateway::{
    truncate_reply, ChatMessage, GatewaySummarizer, GenerationGateway, GenerationOutcome,
    ReplyMode,
};
use crate::memory::{
    ContextBuilder, ConversationKey, FileBackend, FlushReport, MemoryStore, ResetOutcome,
    SentimentClassifier, SentimentDelta, Supplement, DM_SCOPE,
};
use crate::reference::{ReferenceCache, PATCH_TOPIC, UNAVAILABLE_SENTINEL};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const ATTACHMENT_REFUSAL: &str = "Hmph! Such trivial images hold no sway over my ancient power. \
My grasp extends beyond mere visual conjurations.";
const POWERS_DORMANT: &str = "My arcane powers are dormant... (AI service unavailable.)";
const SEARCH_INACTIVE: &str = "My power is not active in this channel. Use `/arise` to awaken me.";
const NOT_ADMINISTRATOR: &str = "Only those who hold true authority may command a dragon.";

const IMAGINE_PREFIX: &str = "!imagine ";
const IMAGE_COOLDOWN_SECS: i64 = 10;
const MANA_RECOVERING: &str = "Your mana needs time to recover.";
const IMAGE_UNAVAILABLE: &str = "I failed to summon the image (lacks mana).";

/// One inbound chat event, as handed over by the transport
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    /// Server/community id; `None` for direct messages
    pub scope_id: Option<String>,
    pub channel_id: String,
    pub user_id: String,
    pub display_name: String,
    pub text: String,
    pub is_administrator: bool,
    pub mentions_agent: bool,
    pub has_attachments: bool,
}

impl InboundMessage {
    pub fn scope(&self) -> &str {
        self.scope_id.as_deref().unwrap_or(DM_SCOPE)
    }

    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(self.scope(), self.user_id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    /// Enable the channel
    Activate,
    /// Disable the channel
    Deactivate,
    /// Forget the calling user in this scope
    Reset,
    /// Forget everyone in this scope
    ResetScope,
}

pub struct Engine {
    config: YuzhongConfig,
    memory: Arc<MemoryStore>,
    activation: ActivationRegistry,
    reference: ReferenceCache,
    gateway: Arc<GenerationGateway>,
    classifier: SentimentClassifier,
    clock: Arc<dyn Clock>,
    /// User id -> last `!imagine` attempt
    image_cooldowns: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Engine {
    pub fn new(
        config: YuzhongConfig,
        memory: Arc<MemoryStore>,
        activation: ActivationRegistry,
        reference: ReferenceCache,
        gateway: Arc<GenerationGateway>,
    ) -> Self {
        Self {
            config,
            memory,
            activation,
            reference,
            gateway,
            classifier: SentimentClassifier::new(),
            clock: Arc::new(SystemClock),
            image_cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Time source for the image cooldown.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Wire the on-disk store, activation file, HTTP provider and patch-note
    /// sources described by `config`.
    pub async fn from_config(config: YuzhongConfig) -> Result<Self> {
        let backend = FileBackend::new(&config.memory_dir).await?;
        info!("Memory directory: {}", backend.dir().display());
        let memory = Arc::new(MemoryStore::new(
            Arc::new(backend),
            config.memory_budget,
            config.persist_mode,
        ));

        let activation = ActivationRegistry::load(&config.activation_file).await;

        let gateway = Arc::new(GenerationGateway::new(
            config.provider.clone(),
            config.reply.max_chars,
        ));

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let mut reference = ReferenceCache::from_settings(&config.reference, clock.clone())?;
        if config.generation_configured() {
            reference = reference.with_summarizer(Arc::new(GatewaySummarizer::new(
                gateway.clone(),
                config.personality.clone(),
                config.reply.summary,
            )));
        }

        Ok(Self::new(config, memory, activation, reference, gateway).with_clock(clock))
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn activation(&self) -> &ActivationRegistry {
        &self.activation
    }

    pub fn reference(&self) -> &ReferenceCache {
        &self.reference
    }

    pub fn gateway(&self) -> &Arc<GenerationGateway> {
        &self.gateway
    }

    /// Handle one chat message. `None` means stay silent.
    pub async fn on_inbound_message(&self, msg: &InboundMessage) -> Option<String> {
        if !self.activation.is_active(&msg.channel_id).await && !msg.mentions_agent {
            return None;
        }

        if let Some(prompt) = msg.text.strip_prefix(IMAGINE_PREFIX) {
            return Some(self.imagine(&msg.user_id, prompt.trim()).await);
        }

        if msg.has_attachments {
            info!("Refused attachment from {} in {}", msg.display_name, msg.channel_id);
            return Some(ATTACHMENT_REFUSAL.to_string());
        }

        let text = msg.text.trim();
        if text.is_empty() {
            return None;
        }

        if !self.gateway.is_available().await {
            warn!("Generation unavailable for channel {}", msg.channel_id);
            return Some(POWERS_DORMANT.to_string());
        }

        let key = msg.key();
        let entry = self.memory.load(&key).await;
        let supplement = if self.config.reference.attach_to_chat {
            self.patch_supplement().await
        } else {
            None
        };

        let payload = ContextBuilder::new(&self.config.personality).build(
            &entry,
            &msg.display_name,
            text,
            supplement.as_ref(),
        );
        let outcome = self.gateway.generate(&payload, self.config.reply.chat).await;
        let reply = outcome.reply_text(ReplyMode::Chat).to_string();

        if outcome.should_record() {
            let delta = if outcome.is_success() {
                self.classifier.classify(text)
            } else {
                SentimentDelta::Neutral
            };
            self.memory.append(&key, &payload.stimulus, &reply, delta).await;
        }

        Some(reply)
    }

    /// Search-mode request: the query framed with patch notes attached.
    pub async fn search(&self, msg: &InboundMessage, query: &str) -> String {
        if msg.scope_id.is_some() && !self.activation.is_active(&msg.channel_id).await {
            return SEARCH_INACTIVE.to_string();
        }

        if !self.gateway.is_available().await {
            return POWERS_DORMANT.to_string();
        }

        let key = msg.key();
        let entry = self.memory.load(&key).await;
        let supplement = self.patch_supplement().await;

        let payload = ContextBuilder::new(&self.config.personality).build_search(
            &entry,
            &msg.display_name,
            query,
            supplement.as_ref(),
        );
        let outcome = self.gateway.generate(&payload, self.config.reply.search).await;
        let reply = outcome.reply_text(ReplyMode::Search).to_string();

        if outcome.should_record() {
            let delta = if outcome.is_success() {
                self.classifier.classify(query)
            } else {
                SentimentDelta::Neutral
            };
            self.memory.append(&key, &payload.stimulus, &reply, delta).await;
        }

        reply
    }

    /// In-character greeting for a newcomer. `None` when generation is
    /// unavailable or the attempt fails; nothing is recorded in memory.
    pub async fn greet(&self, display_name: &str) -> Option<String> {
        if !self.gateway.is_available().await {
            return None;
        }

        let messages = vec![
            ChatMessage::system(self.config.personality.clone()),
            ChatMessage::user(format!(
                "Greet the mortal named {} who has entered your domain. \
Keep it short, mysterious, and charismatic.",
                display_name
            )),
        ];
        match self.gateway.complete_messages(messages, self.config.reply.chat).await {
            GenerationOutcome::Success(greeting) => Some(greeting),
            outcome => {
                info!("Greeting error for {}: {:?}", display_name, outcome);
                None
            }
        }
    }

    /// Image requests. There is no image provider, so an accepted request
    /// always reports failure; repeats within the cooldown are turned away.
    async fn imagine(&self, user_id: &str, prompt: &str) -> String {
        let now = self.clock.now();
        let mut cooldowns = self.image_cooldowns.lock().await;
        if let Some(last) = cooldowns.get(user_id) {
            if now - *last < chrono::Duration::seconds(IMAGE_COOLDOWN_SECS) {
                return MANA_RECOVERING.to_string();
            }
        }
        cooldowns.insert(user_id.to_string(), now);
        info!("Image request from {} not fulfilled: {}", user_id, prompt);
        IMAGE_UNAVAILABLE.to_string()
    }

    /// Latest patch notes, formatted for a chat message.
    pub async fn patch_summary(&self) -> String {
        let notes = self.reference.get(PATCH_TOPIC).await;
        let notes = truncate_reply(&notes, self.config.reply.max_chars);
        format!("\u{1F4DC} **Latest Patch Notes Summary:**\n```{}```", notes)
    }

    /// Administrative commands. Every kind requires the administrator flag.
    pub async fn on_admin_command(
        &self,
        command: AdminCommand,
        channel_id: &str,
        scope_id: Option<&str>,
        user_id: &str,
        is_administrator: bool,
    ) -> String {
        if !is_administrator {
            warn!("Refused {:?} from non-administrator {}", command, user_id);
            return NOT_ADMINISTRATOR.to_string();
        }

        match command {
            AdminCommand::Activate => {
                self.activation.activate(channel_id).await;
                info!("Activated in channel {}", channel_id);
                "Yu Zhong reigns over this channel...".to_string()
            }
            AdminCommand::Deactivate => {
                self.activation.deactivate(channel_id).await;
                info!("Deactivated in channel {}", channel_id);
                "Yu Zhong no longer reigns over this channel.".to_string()
            }
            AdminCommand::Reset => {
                let key = ConversationKey::new(scope_id.unwrap_or(DM_SCOPE), user_id);
                let reply = match self.memory.reset(&key).await {
                    ResetOutcome::Removed => "Your memory has been purged from my mind.",
                    ResetOutcome::NothingToReset => "I hold no memory of you to purge.",
                };
                reply.to_string()
            }
            AdminCommand::ResetScope => {
                let Some(scope) = scope_id else {
                    return "This command can only be used in a server.".to_string();
                };
                if self.memory.reset_scope(scope).await > 0 {
                    "Yu Zhong's memory has been purged for this server.".to_string()
                } else {
                    "No memory found to reset for this server.".to_string()
                }
            }
        }
    }

    /// Best-effort flush of dirty memory before exit.
    pub async fn shutdown(&self) -> FlushReport {
        let report = self.memory.flush_dirty().await;
        if report.failed > 0 {
            warn!("{} memory records could not be written on shutdown", report.failed);
        } else {
            info!("Memory flushed ({} records)", report.written);
        }
        report
    }

    async fn patch_supplement(&self) -> Option<Supplement> {
        let notes = self.reference.get(PATCH_TOPIC).await;
        if notes == UNAVAILABLE_SENTINEL || notes.trim().is_empty() {
            None
        } else {
            Some(Supplement::patch_notes(notes))
        }
    }
}
