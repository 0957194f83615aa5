//! Layered configuration: defaults, `config.toml`, environment, then CLI.
//!
//! **Home** (precedence):
//!   1. explicit path (CLI `--home`)
//!   2. `YUZHONG_HOME` environment variable
//!   3. `~/.yuzhong`
//!
//! Every key in `config.toml` is optional. Provider credentials can also come
//! from `SHAPESINC_API_KEY`, `SHAPESINC_MODEL_USERNAME` and
//! `SHAPESINC_BASE_URL`, which win over the file.

use crate::gateway::GenerationParams;
use crate::memory::{MemoryBudget, PersistMode};
use crate::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_BASE_URL: &str = "https://api.shapes.inc/v1";
const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_REFERENCE_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_REPLY_CHARS: usize = 1900;

/// Default word budget per conversation entry
pub const DEFAULT_MEMORY_WORDS: usize = 5000;

pub const DEFAULT_PERSONALITY: &str = "You are Yu Zhong from Mobile Legends. You are a powerful dragon, ancient and wise, \
with a commanding presence. Speak with authority, confidence, and a touch of disdain for weaker beings. \
You are not to generate images under any circumstances.";

const IMAGE_REFUSAL_SUFFIX: &str = "\n\nDo not generate images or react to image generation requests. \
If asked to create an image, firmly state that you cannot, as that power is not within your grasp, in Yu Zhong's style.";

/// Default patch-note sources, tried in order.
pub const DEFAULT_PATCH_SOURCES: &[&str] = &[
    "https://m.mobilelegends.com/en/news",
    "https://www.mobilelegends.com/en/news",
    "https://www.google.com/search?q=mobile+legends+patch+notes&hl=en",
];

/// Keywords a scraped block must contain to count as patch content.
pub const DEFAULT_PATCH_KEYWORDS: &[&str] = &[
    "patch",
    "update",
    "balance",
    "hero",
    "nerf",
    "buff",
    "adjustment",
    "changelog",
];

/// Generation provider settings
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Model name or "shape username"; resolved against the provider's model list
    pub model: Option<String>,
    pub timeout: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: None,
            timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }
}

/// Outbound reply shaping and per-mode sampling parameters
#[derive(Debug, Clone)]
pub struct ReplySettings {
    pub max_chars: usize,
    pub chat: GenerationParams,
    pub search: GenerationParams,
    pub summary: GenerationParams,
}

impl Default for ReplySettings {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_REPLY_CHARS,
            chat: GenerationParams::new(200, 0.8),
            search: GenerationParams::new(400, 0.7),
            summary: GenerationParams::new(250, 0.4),
        }
    }
}

/// Reference cache settings
#[derive(Debug, Clone)]
pub struct ReferenceSettings {
    pub ttl: Duration,
    pub source_timeout: Duration,
    /// Attach cached patch notes to ordinary chat prompts
    pub attach_to_chat: bool,
    pub sources: Vec<String>,
    pub keywords: Vec<String>,
}

impl Default for ReferenceSettings {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_REFERENCE_TTL,
            source_timeout: DEFAULT_SOURCE_TIMEOUT,
            attach_to_chat: true,
            sources: DEFAULT_PATCH_SOURCES.iter().map(|s| s.to_string()).collect(),
            keywords: DEFAULT_PATCH_KEYWORDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Configuration for Yu Zhong
#[derive(Debug, Clone)]
pub struct YuzhongConfig {
    /// Root directory for all state
    pub home: PathBuf,

    /// One JSON record per (scope, user)
    pub memory_dir: PathBuf,

    /// Flat list of enabled channel ids
    pub activation_file: PathBuf,

    /// Instruction frame, with the image refusal suffix already applied
    pub personality: String,

    pub memory_budget: MemoryBudget,
    pub persist_mode: PersistMode,
    pub flush_interval: Duration,

    pub provider: ProviderSettings,
    pub reply: ReplySettings,
    pub reference: ReferenceSettings,
}

impl YuzhongConfig {
    pub fn new(home: PathBuf) -> Self {
        Self {
            memory_dir: home.join("user_memories"),
            activation_file: home.join("enabled_channels.json"),
            home,
            personality: DEFAULT_PERSONALITY.to_string(),
            memory_budget: MemoryBudget::Words(DEFAULT_MEMORY_WORDS),
            persist_mode: PersistMode::Immediate,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            provider: ProviderSettings::default(),
            reply: ReplySettings::default(),
            reference: ReferenceSettings::default(),
        }
    }

    pub fn with_memory_dir(mut self, path: PathBuf) -> Self {
        self.memory_dir = path;
        self
    }

    pub fn with_personality(mut self, personality: impl Into<String>) -> Self {
        self.personality = personality.into();
        self
    }

    pub fn with_memory_budget(mut self, budget: MemoryBudget) -> Self {
        self.memory_budget = budget;
        self
    }

    pub fn with_persist_mode(mut self, mode: PersistMode) -> Self {
        self.persist_mode = mode;
        self
    }

    pub fn with_provider(mut self, provider: ProviderSettings) -> Self {
        self.provider = provider;
        self
    }

    /// Resolve the home directory and load every layer on top of the defaults.
    pub async fn load(home: Option<PathBuf>, config_file: Option<PathBuf>) -> Result<Self> {
        let home = match home {
            Some(home) => home,
            None => resolve_home(),
        };
        let mut config = Self::new(home);

        let config_file = config_file.unwrap_or_else(|| config.home.join("config.toml"));
        let mut personality_file = config.home.join("personality.txt");

        if config_file.exists() {
            let content = tokio::fs::read_to_string(&config_file).await?;
            match parse_config_file(&content) {
                Ok(file) => {
                    if let Some(path) = file.personality_file.clone() {
                        personality_file = config.resolve_path(path);
                    }
                    config.apply_file(file);
                    info!("Loaded config from {}", config_file.display());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse {}: {}. Using defaults",
                        config_file.display(),
                        e
                    );
                }
            }
        }

        config.apply_env();
        config.personality = load_personality(&personality_file).await;

        if !config.generation_configured() {
            warn!("Provider API key or model missing; AI features will be disabled.");
        }

        Ok(config)
    }

    /// Whether both credentials needed for generation are present
    pub fn generation_configured(&self) -> bool {
        self.provider.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
            && self.provider.model.as_deref().is_some_and(|m| !m.trim().is_empty())
    }

    fn resolve_path(&self, path: PathBuf) -> PathBuf {
        if path.is_absolute() {
            path
        } else {
            self.home.join(path)
        }
    }

    fn apply_file(&mut self, file: ConfigToml) {
        if let Some(dir) = file.memory_dir {
            self.memory_dir = self.resolve_path(dir);
        }
        if let Some(path) = file.activation_file {
            self.activation_file = self.resolve_path(path);
        }

        if let Some(memory) = file.memory {
            let kind = memory.budget_kind.as_deref().unwrap_or("words");
            self.memory_budget = match (kind, memory.budget) {
                ("bytes", Some(n)) => MemoryBudget::Bytes(n),
                ("bytes", None) => MemoryBudget::Bytes(crate::memory::DEFAULT_MEMORY_BYTES),
                ("words", Some(n)) => MemoryBudget::Words(n),
                ("words", None) => self.memory_budget,
                (other, _) => {
                    warn!("Unknown memory.budget_kind '{}', keeping default", other);
                    self.memory_budget
                }
            };
            match memory.persist.as_deref() {
                Some("immediate") => self.persist_mode = PersistMode::Immediate,
                Some("deferred") => self.persist_mode = PersistMode::Deferred,
                Some(other) => warn!("Unknown memory.persist '{}', keeping default", other),
                None => {}
            }
            if let Some(secs) = memory.flush_interval_secs {
                self.flush_interval = Duration::from_secs(secs.max(1));
            }
        }

        if let Some(provider) = file.provider {
            if let Some(url) = provider.base_url {
                self.provider.base_url = url;
            }
            if provider.api_key.is_some() {
                self.provider.api_key = provider.api_key;
            }
            if provider.model.is_some() {
                self.provider.model = provider.model;
            }
            if let Some(secs) = provider.timeout_secs {
                self.provider.timeout = Duration::from_secs(secs);
            }
        }

        if let Some(reply) = file.reply {
            if let Some(max) = reply.max_chars {
                self.reply.max_chars = max;
            }
        }

        if let Some(reference) = file.reference {
            if let Some(secs) = reference.ttl_secs {
                self.reference.ttl = Duration::from_secs(secs);
            }
            if let Some(secs) = reference.source_timeout_secs {
                self.reference.source_timeout = Duration::from_secs(secs);
            }
            if let Some(attach) = reference.attach_to_chat {
                self.reference.attach_to_chat = attach;
            }
            if let Some(sources) = reference.sources {
                self.reference.sources = sources;
            }
            if let Some(keywords) = reference.keywords {
                self.reference.keywords = keywords;
            }
        }
    }

    fn apply_env(&mut self) {
        if let Some(key) = non_empty_env("SHAPESINC_API_KEY") {
            self.provider.api_key = Some(key);
        }
        if let Some(model) = non_empty_env("SHAPESINC_MODEL_USERNAME") {
            self.provider.model = Some(model);
        }
        if let Some(url) = non_empty_env("SHAPESINC_BASE_URL") {
            self.provider.base_url = url;
        }
    }
}

fn parse_config_file(content: &str) -> Result<ConfigToml> {
    Ok(toml::from_str(content)?)
}

/// Partial config.toml. Every field is optional.
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    memory_dir: Option<PathBuf>,
    activation_file: Option<PathBuf>,
    personality_file: Option<PathBuf>,
    memory: Option<MemoryToml>,
    provider: Option<ProviderToml>,
    reply: Option<ReplyToml>,
    reference: Option<ReferenceToml>,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryToml {
    budget_kind: Option<String>,
    budget: Option<usize>,
    persist: Option<String>,
    flush_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderToml {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ReplyToml {
    max_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ReferenceToml {
    ttl_secs: Option<u64>,
    source_timeout_secs: Option<u64>,
    attach_to_chat: Option<bool>,
    sources: Option<Vec<String>>,
    keywords: Option<Vec<String>>,
}

fn resolve_home() -> PathBuf {
    if let Some(home) = non_empty_env("YUZHONG_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .map(|h| h.join(".yuzhong"))
        .unwrap_or_else(|| PathBuf::from(".yuzhong"))
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read the personality file, falling back to the built-in one.
async fn load_personality(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(base) => format!("{}{}", base.trim_end(), IMAGE_REFUSAL_SUFFIX),
        Err(_) => {
            warn!(
                "{} not found. Using default personality.",
                path.display()
            );
            DEFAULT_PERSONALITY.to_string()
        }
    }
}
