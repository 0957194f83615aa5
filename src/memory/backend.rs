//! Durable storage for conversation records.
//!
//! Directory layout for [`FileBackend`]:
//!   {memory_dir}/user_{scope}_{user}.json
//!
//! Ids are written as-is when they only hold ASCII letters, digits and `-`.
//! Any other byte is escaped as `%xx`, so `_` stays free as the separator and
//! distinct ids never share a file.

use super::ConversationKey;
use crate::{Result, YuzhongError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// One record per key. Implementations never need cross-key locking.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Raw record bytes, `None` when absent
    async fn read(&self, key: &ConversationKey) -> Result<Option<Vec<u8>>>;

    async fn write(&self, key: &ConversationKey, data: &[u8]) -> Result<()>;

    /// Delete a record. Returns whether one existed.
    async fn remove(&self, key: &ConversationKey) -> Result<bool>;

    /// Every stored key whose scope is `scope`
    async fn keys_in_scope(&self, scope: &str) -> Result<Vec<ConversationKey>>;
}

/// JSON files on local disk
pub struct FileBackend {
    dir: PathBuf,
    tmp_seq: AtomicU64,
}

impl FileBackend {
    /// Create a backend rooted at `dir`. Creates the directory if needed.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &ConversationKey) -> PathBuf {
        self.dir.join(format!(
            "user_{}_{}.json",
            encode_id(&key.scope),
            encode_id(&key.user)
        ))
    }
}

fn encode_id(id: &str) -> String {
    let mut encoded = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push('%');
            encoded.push_str(&hex::encode([byte]));
        }
    }
    encoded
}

fn decode_id(encoded: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(encoded.len());
    let mut rest = encoded.as_bytes();
    while let Some((&byte, tail)) = rest.split_first() {
        if byte == b'%' {
            let pair = tail.get(..2)?;
            bytes.extend(hex::decode(pair).ok()?);
            rest = &tail[2..];
        } else {
            bytes.push(byte);
            rest = tail;
        }
    }
    String::from_utf8(bytes).ok()
}

#[async_trait]
impl MemoryBackend for FileBackend {
    async fn read(&self, key: &ConversationKey) -> Result<Option<Vec<u8>>> {
        match fs::read(self.record_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &ConversationKey, data: &[u8]) -> Result<()> {
        let path = self.record_path(key);
        // Unique per write: concurrent writers must not share a temp file
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("json.{seq}.tmp"));

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);

        fs::rename(&tmp, &path).await?;
        debug!("Wrote memory record {}", path.display());
        Ok(())
    }

    async fn remove(&self, key: &ConversationKey) -> Result<bool> {
        match fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys_in_scope(&self, scope: &str) -> Result<Vec<ConversationKey>> {
        let prefix = format!("user_{}_", encode_id(scope));
        let pattern = format!(
            "{}/{}*.json",
            glob::Pattern::escape(&self.dir.to_string_lossy()),
            prefix
        );

        let paths = glob::glob(&pattern)
            .map_err(|e| YuzhongError::Persistence(format!("invalid pattern: {e}")))?;

        let mut keys = Vec::new();
        for path in paths.flatten() {
            let user = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(prefix.as_str()))
                .and_then(|n| n.strip_suffix(".json"));
            match user.and_then(decode_id) {
                Some(user) => keys.push(ConversationKey::new(scope, user)),
                None => debug!("Ignoring unrecognized record {}", path.display()),
            }
        }
        Ok(keys)
    }
}

/// Process-local records, for tests and throwaway sessions.
#[derive(Default)]
pub struct EphemeralBackend {
    records: Mutex<HashMap<ConversationKey, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl EphemeralBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until switched back
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Store raw bytes directly, bypassing serialization
    pub fn insert_raw(&self, key: ConversationKey, data: impl Into<Vec<u8>>) {
        self.lock().insert(key, data.into());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConversationKey, Vec<u8>>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MemoryBackend for EphemeralBackend {
    async fn read(&self, key: &ConversationKey) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn write(&self, key: &ConversationKey, data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(YuzhongError::Persistence(format!("write refused for {key}")));
        }
        self.lock().insert(key.clone(), data.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &ConversationKey) -> Result<bool> {
        Ok(self.lock().remove(key).is_some())
    }

    async fn keys_in_scope(&self, scope: &str) -> Result<Vec<ConversationKey>> {
        Ok(self
            .lock()
            .keys()
            .filter(|k| k.scope == scope)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_backend_roundtrip_and_remove() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::new(temp_dir.path().join("mem")).await.unwrap();
        let key = ConversationKey::new("123", "456");

        assert!(backend.read(&key).await.unwrap().is_none());
        backend.write(&key, b"{}").await.unwrap();
        assert!(backend.dir().join("user_123_456.json").exists());
        assert_eq!(backend.read(&key).await.unwrap().as_deref(), Some(&b"{}"[..]));

        assert!(backend.remove(&key).await.unwrap());
        assert!(!backend.remove(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_backend_scope_listing() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::new(temp_dir.path()).await.unwrap();
        backend.write(&ConversationKey::new("1", "a"), b"{}").await.unwrap();
        backend.write(&ConversationKey::new("1", "b"), b"{}").await.unwrap();
        backend.write(&ConversationKey::new("12", "c"), b"{}").await.unwrap();

        let mut keys = backend.keys_in_scope("1").await.unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec![ConversationKey::new("1", "a"), ConversationKey::new("1", "b")]
        );
    }

    #[test]
    fn test_id_encoding_is_reversible() {
        assert_eq!(encode_id("123456"), "123456");
        assert_eq!(encode_id("a_b/c"), "a%5fb%2fc");
        for id in ["a_b", "a-b", "a/b", "a%b", "dragon\u{9f8d}"] {
            assert_eq!(decode_id(&encode_id(id)).as_deref(), Some(id));
        }
        assert_eq!(decode_id("bad%4"), None);
    }

    #[tokio::test]
    async fn test_similar_ids_get_separate_records() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::new(temp_dir.path()).await.unwrap();
        backend.write(&ConversationKey::new("1", "a_b"), b"1").await.unwrap();
        backend.write(&ConversationKey::new("1", "a-b"), b"2").await.unwrap();
        backend.write(&ConversationKey::new("1", "a/b"), b"3").await.unwrap();

        let read = backend.read(&ConversationKey::new("1", "a-b")).await.unwrap();
        assert_eq!(read.as_deref(), Some(&b"2"[..]));

        let mut keys = backend.keys_in_scope("1").await.unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                ConversationKey::new("1", "a-b"),
                ConversationKey::new("1", "a/b"),
                ConversationKey::new("1", "a_b"),
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_one_key() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::new(temp_dir.path()).await.unwrap();
        let key = ConversationKey::new("1", "a");

        let (first, second) =
            tokio::join!(backend.write(&key, b"one"), backend.write(&key, b"two"));
        assert!(first.is_ok());
        assert!(second.is_ok());
        let stored = backend.read(&key).await.unwrap().unwrap();
        assert!(stored == b"one" || stored == b"two");
    }

    #[tokio::test]
    async fn test_ephemeral_backend_failing_writes() {
        let backend = EphemeralBackend::new();
        let key = ConversationKey::direct("u");
        backend.set_fail_writes(true);
        assert!(backend.write(&key, b"x").await.is_err());
        backend.set_fail_writes(false);
        backend.write(&key, b"x").await.unwrap();
        assert_eq!(backend.len(), 1);
    }
}
