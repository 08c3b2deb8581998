use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::models::RecognitionResult;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Blocking key/value store with per-entry expiry.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Removes every key starting with `prefix`, returning how many went.
    fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Drops expired entries eagerly. Stores that expire lazily may skip this.
    fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }

    fn name(&self) -> &'static str;
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Writes between sweeps of expired entries in [`MemoryStore`].
pub const MEMORY_SWEEP_INTERVAL: usize = 256;

#[derive(Default)]
struct MemoryEntries {
    map: HashMap<String, MemoryEntry>,
    writes: usize,
}

/// Process-local store, mostly for single-node deployments and tests.
/// Expired entries are dropped on read and swept every `sweep_interval`
/// writes, so keys that are never read again do not pile up.
pub struct MemoryStore {
    entries: Mutex<MemoryEntries>,
    sweep_interval: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_sweep_interval(MEMORY_SWEEP_INTERVAL)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_interval(sweep_interval: usize) -> Self {
        Self {
            entries: Mutex::new(MemoryEntries::default()),
            sweep_interval: sweep_interval.max(1),
        }
    }

    /// Entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries().map_or(0, |entries| entries.map.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, MemoryEntries>> {
        self.entries
            .lock()
            .map_err(|_| Error::Cache("memory store lock poisoned".into()))
    }
}

fn sweep(map: &mut HashMap<String, MemoryEntry>) -> usize {
    let now = Instant::now();
    let before = map.len();
    map.retain(|_, entry| entry.is_live(now));
    before - map.len()
}

impl CacheBackend for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries()?;
        let now = Instant::now();
        match entries.map.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let entry = MemoryEntry {
            value: value.to_string(),
            expires_at: Instant::now().checked_add(ttl),
        };
        let mut entries = self.entries()?;
        entries.writes = entries.writes.wrapping_add(1);
        if entries.writes % self.sweep_interval == 0 {
            let removed = sweep(&mut entries.map);
            if removed > 0 {
                log::debug!("Swept {removed} expired memory cache entries");
            }
        }
        entries.map.insert(key.to_string(), entry);
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut entries = self.entries()?;
        let before = entries.map.len();
        entries.map.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.map.len())
    }

    fn purge_expired(&self) -> Result<usize> {
        Ok(sweep(&mut self.entries()?.map))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Recognition results keyed by fingerprint under a namespace.
///
/// Reads and writes never fail the caller: backend errors are logged and
/// turn into a miss or a skipped write.
#[derive(Clone)]
pub struct ResultCache {
    backend: Option<Arc<dyn CacheBackend>>,
    namespace: String,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn CacheBackend>, namespace: impl Into<String>, ttl: Duration) -> Self {
        Self {
            backend: Some(backend),
            namespace: namespace.into(),
            ttl,
        }
    }

    /// A cache that never stores anything.
    pub fn disabled(namespace: impl Into<String>) -> Self {
        Self {
            backend: None,
            namespace: namespace.into(),
            ttl: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn key_for(&self, fingerprint: &Fingerprint) -> String {
        format!("{}{}", self.namespace, fingerprint)
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<RecognitionResult> {
        let backend = self.backend.clone()?;
        let key = self.key_for(fingerprint);
        let lookup_key = key.clone();
        let raw = match tokio::task::spawn_blocking(move || backend.get(&lookup_key)).await {
            Ok(Ok(raw)) => raw?,
            Ok(Err(err)) => {
                log::warn!("Cache read failed for {key}; treating as miss: {err}");
                return None;
            }
            Err(err) => {
                log::warn!("Cache read task failed for {key}: {err}");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(result) => Some(result),
            Err(err) => {
                log::warn!("Discarding unreadable cache entry {key}: {err}");
                None
            }
        }
    }

    pub async fn put(&self, fingerprint: &Fingerprint, result: &RecognitionResult, ttl: Duration) {
        let Some(backend) = self.backend.clone() else {
            return;
        };
        let key = self.key_for(fingerprint);
        let value = match serde_json::to_string(result) {
            Ok(value) => value,
            Err(err) => {
                log::warn!("Skipping cache write for {key}; serialization failed: {err}");
                return;
            }
        };
        let write_key = key.clone();
        match tokio::task::spawn_blocking(move || backend.set(&write_key, &value, ttl)).await {
            Ok(Ok(())) => log::debug!("Cached recognition result under {key}"),
            Ok(Err(err)) => log::warn!("Cache write failed for {key}; continuing: {err}"),
            Err(err) => log::warn!("Cache write task failed for {key}: {err}"),
        }
    }

    /// Deletes every entry whose key starts with `prefix`.
    pub async fn clear_all(&self, prefix: &str) -> Result<usize> {
        let Some(backend) = self.backend.clone() else {
            return Ok(0);
        };
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || backend.delete_prefix(&prefix))
            .await
            .map_err(|err| Error::Cache(format!("cache clear task failed: {err}")))?
    }

    pub async fn clear_namespace(&self) -> Result<usize> {
        self.clear_all(&self.namespace).await
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        let Some(backend) = self.backend.clone() else {
            return Ok(0);
        };
        tokio::task::spawn_blocking(move || backend.purge_expired())
            .await
            .map_err(|err| Error::Cache(format!("cache purge task failed: {err}")))?
    }
}
