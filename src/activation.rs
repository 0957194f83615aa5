//! Activation registry: which channels accept engine traffic.
//!
//! Persisted as a flat JSON list of enabled channel ids. The older
//! `{"id": true}` map form is accepted on load and rewritten as a list on the
//! next save.

use crate::Result;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredActivation {
    List(Vec<String>),
    Map(std::collections::HashMap<String, bool>),
}

impl StoredActivation {
    fn into_enabled(self) -> BTreeSet<String> {
        match self {
            Self::List(ids) => ids.into_iter().collect(),
            Self::Map(map) => map
                .into_iter()
                .filter_map(|(id, enabled)| enabled.then_some(id))
                .collect(),
        }
    }
}

pub struct ActivationRegistry {
    path: Option<PathBuf>,
    enabled: RwLock<BTreeSet<String>>,
}

impl ActivationRegistry {
    /// Load from `path`. A missing or unreadable file starts empty.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let enabled = match read_enabled(&path).await {
            Ok(enabled) => enabled,
            Err(e) => {
                error!("Error loading {}: {}", path.display(), e);
                BTreeSet::new()
            }
        };
        info!("{} channels active", enabled.len());

        Self {
            path: Some(path),
            enabled: RwLock::new(enabled),
        }
    }

    /// Registry that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            enabled: RwLock::new(BTreeSet::new()),
        }
    }

    pub async fn is_active(&self, channel_id: &str) -> bool {
        self.enabled.read().await.contains(channel_id)
    }

    pub async fn activate(&self, channel_id: &str) {
        self.enabled.write().await.insert(channel_id.to_string());
        self.save().await;
    }

    pub async fn deactivate(&self, channel_id: &str) {
        self.enabled.write().await.remove(channel_id);
        self.save().await;
    }

    pub async fn active_channels(&self) -> Vec<String> {
        self.enabled.read().await.iter().cloned().collect()
    }

    /// Failures are logged; the in-memory state stays as is.
    async fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let ids = self.active_channels().await;
        if let Err(e) = write_enabled(path, &ids).await {
            error!("Failed to save enabled channels: {}", e);
        }
    }
}

async fn read_enabled(path: &Path) -> Result<BTreeSet<String>> {
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let content = tokio::fs::read_to_string(path).await?;
    if content.trim().is_empty() {
        warn!("{} is empty", path.display());
        return Ok(BTreeSet::new());
    }
    let stored: StoredActivation = serde_json::from_str(&content)?;
    Ok(stored.into_enabled())
}

async fn write_enabled(path: &Path, ids: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(ids)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}
