use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mobox_error::MoboxError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::Instant;

const KEY_PREFIX: &str = "mobox:stream:";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt entry for {key}: {message}")]
    Corrupt { key: String, message: String },
}

impl From<StoreError> for MoboxError {
    fn from(err: StoreError) -> Self {
        MoboxError::RegistryUnavailable {
            message: err.to_string(),
        }
    }
}

/// Minimal key-value capability with per-key expiry.
#[async_trait]
pub trait TtlStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-process store. Expired keys are dropped lazily on access.
#[derive(Debug)]
pub struct MemoryTtlStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    available: AtomicBool,
}

impl Default for MemoryTtlStore {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryTtlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }
}

#[async_trait]
impl TtlStore for MemoryTtlStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        self.check()?;
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEntry {
    pub session_id: String,
    pub stream_id: String,
    pub created_at: String,
}

/// Maps a session to its one live stream. New registrations for a session are
/// serialized so the previous entry is gone before the next becomes visible.
#[derive(Clone)]
pub struct StreamRegistry {
    store: Arc<dyn TtlStore>,
    ttl: Duration,
    locks: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl StreamRegistry {
    pub fn new(store: Arc<dyn TtlStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryTtlStore::new()), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key(session_id: &str) -> String {
        format!("{KEY_PREFIX}{session_id}")
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.lock_table()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the session's lock from the table once only the table and the
    /// caller hold it.
    fn release_session_lock(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.lock_table();
        let unused = locks
            .get(session_id)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2);
        if unused {
            locks.remove(session_id);
        }
    }

    /// Removes any entry for the session. Idempotent.
    pub async fn clear(&self, session_id: &str) -> Result<(), StoreError> {
        self.store.delete(&Self::key(session_id)).await
    }

    /// Installs a fresh entry. Callers go through [`register`](Self::register)
    /// unless they already cleared the session.
    pub async fn set(&self, session_id: &str, stream_id: &str) -> Result<(), StoreError> {
        let created_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let entry = StreamEntry {
            session_id: session_id.to_string(),
            stream_id: stream_id.to_string(),
            created_at,
        };
        let value = serde_json::to_string(&entry).map_err(|err| StoreError::Corrupt {
            key: Self::key(session_id),
            message: err.to_string(),
        })?;
        self.store.set(&Self::key(session_id), value, self.ttl).await
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<StreamEntry>, StoreError> {
        let key = Self::key(session_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| StoreError::Corrupt {
                key,
                message: err.to_string(),
            })
    }

    /// Clears then sets under the per-session lock.
    pub async fn register(&self, session_id: &str, stream_id: &str) -> Result<(), StoreError> {
        let lock = self.session_lock(session_id);
        let result = {
            let _guard = lock.lock().await;
            match self.clear(session_id).await {
                Ok(()) => self.set(session_id, stream_id).await,
                Err(err) => Err(err),
            }
        };
        self.release_session_lock(session_id, lock);
        result?;
        tracing::debug!(session_id, stream_id, "registered stream");
        Ok(())
    }

    /// Removes the entry only if it still points at `stream_id`. Returns
    /// whether anything was removed.
    pub async fn clear_if_current(
        &self,
        session_id: &str,
        stream_id: &str,
    ) -> Result<bool, StoreError> {
        let lock = self.session_lock(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.clear_matching(session_id, stream_id).await
        };
        self.release_session_lock(session_id, lock);
        result
    }

    async fn clear_matching(&self, session_id: &str, stream_id: &str) -> Result<bool, StoreError> {
        match self.get(session_id).await {
            Ok(Some(entry)) if entry.stream_id == stream_id => {
                self.clear(session_id).await?;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(StoreError::Corrupt { key, message }) => {
                tracing::warn!(key = %key, error = %message, "dropping corrupt stream entry");
                self.clear(session_id).await?;
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let registry = StreamRegistry::in_memory(Duration::from_secs(30));
        registry.register("s1", "stream-a").await.expect("register");
        let entry = registry.get("s1").await.expect("get").expect("entry");
        assert_eq!(entry.stream_id, "stream-a");
        assert!(OffsetDateTime::parse(&entry.created_at, &Rfc3339).is_ok());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(registry.get("s1").await.expect("get"), None);
    }

    #[tokio::test]
    async fn superseded_stream_keeps_successor_entry() {
        let registry = StreamRegistry::in_memory(Duration::from_secs(60));
        registry.register("s1", "old").await.expect("register");
        registry.register("s1", "new").await.expect("register");
        assert!(!registry.clear_if_current("s1", "old").await.expect("clear"));
        assert_eq!(
            registry.get("s1").await.expect("get").map(|e| e.stream_id),
            Some("new".to_string())
        );
        assert!(registry.clear_if_current("s1", "new").await.expect("clear"));
        registry.clear("s1").await.expect("idempotent clear");
    }

    #[tokio::test]
    async fn session_locks_are_released_after_use() {
        let registry = StreamRegistry::in_memory(Duration::from_secs(60));
        for n in 0..5 {
            let session = format!("s{n}");
            registry.register(&session, "stream").await.expect("register");
            assert!(registry
                .clear_if_current(&session, "stream")
                .await
                .expect("clear"));
        }
        assert!(registry.lock_table().is_empty());
    }

    #[tokio::test]
    async fn held_session_lock_is_not_released() {
        let registry = StreamRegistry::in_memory(Duration::from_secs(60));
        let held = registry.session_lock("s1");
        registry.register("s1", "stream").await.expect("register");
        assert!(registry.lock_table().contains_key("s1"));

        registry.release_session_lock("s1", held);
        assert!(registry.lock_table().is_empty());
    }
}
