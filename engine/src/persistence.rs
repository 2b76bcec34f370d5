//! Durable storage for pending writes and the server cache.
//!
//! The engine talks to storage through [`PersistenceAdapter`] and never
//! learns where bytes end up. [`MemoryPersistence`] keeps everything in a
//! [`PersistedState`] that serializes to JSON, so a host can write it to
//! disk however it likes.

use crate::{
    error::Result, overlay::ServerCache, Error, Path, WriteId, WriteKind, WritePayload,
    WriteRecord,
};
use serde::{Deserialize, Serialize};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::warn;

/// Version of the persisted format.
pub const PERSISTENCE_FORMAT_VERSION: u32 = 1;

pub const MIN_CACHE_SIZE_BYTES: u64 = 1024 * 1024;
pub const MAX_CACHE_SIZE_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_CACHE_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Capacity bound for the persisted server cache.
///
/// Settable until the first database operation, fixed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSizeConfig {
    bytes: u64,
    frozen: bool,
}

impl Default for CacheSizeConfig {
    fn default() -> Self {
        Self {
            bytes: DEFAULT_CACHE_SIZE_BYTES,
            frozen: false,
        }
    }
}

impl CacheSizeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn set(&mut self, bytes: u64) -> Result<()> {
        if self.frozen {
            return Err(Error::Configuration(
                "cache size cannot change after the database is in use".into(),
            ));
        }
        if bytes < MIN_CACHE_SIZE_BYTES {
            return Err(Error::Configuration(format!(
                "cache size {bytes} is below the minimum of {MIN_CACHE_SIZE_BYTES} bytes"
            )));
        }
        if bytes > MAX_CACHE_SIZE_BYTES {
            return Err(Error::Configuration(format!(
                "cache size {bytes} is above the maximum of {MAX_CACHE_SIZE_BYTES} bytes"
            )));
        }
        self.bytes = bytes;
        Ok(())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

/// A pending plain write as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedWrite {
    pub id: WriteId,
    pub path: Path,
    pub kind: WriteKind,
    pub payload: WritePayload,
}

impl PersistedWrite {
    pub fn from_record(record: &WriteRecord) -> Self {
        Self {
            id: record.id,
            path: record.path.clone(),
            kind: record.kind,
            payload: record.payload.clone(),
        }
    }
}

/// Storage backend for the engine.
pub trait PersistenceAdapter: Send {
    fn save_user_write(&mut self, write: &PersistedWrite) -> Result<()>;

    fn remove_user_write(&mut self, id: WriteId) -> Result<()>;

    fn remove_all_user_writes(&mut self) -> Result<()>;

    /// Replace the stored server cache.
    fn update_server_cache(&mut self, cache: &ServerCache) -> Result<()>;

    /// Stored writes, in any order.
    fn load_user_writes(&self) -> Result<Vec<PersistedWrite>>;

    fn load_server_cache(&self) -> Result<ServerCache>;
}

/// Everything a [`MemoryPersistence`] holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub format_version: u32,
    pub server_cache: ServerCache,
    /// Ascending by id
    pub writes: Vec<PersistedWrite>,
}

impl PersistedState {
    pub fn new() -> Self {
        Self {
            format_version: PERSISTENCE_FORMAT_VERSION,
            ..Self::default()
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidPersistedState(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let state: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidPersistedState(e.to_string()))?;

        if state.format_version > PERSISTENCE_FORMAT_VERSION {
            return Err(Error::InvalidPersistedState(format!(
                "unsupported format version: {} (max supported: {})",
                state.format_version, PERSISTENCE_FORMAT_VERSION
            )));
        }

        Ok(state)
    }
}

/// In-memory persistence. Clones share the same state, so a host can keep a
/// handle to inspect or export what the engine stored.
#[derive(Debug, Clone)]
pub struct MemoryPersistence {
    state: Arc<Mutex<PersistedState>>,
    cache_size: CacheSizeConfig,
}

impl MemoryPersistence {
    pub fn new(cache_size: CacheSizeConfig) -> Self {
        Self::from_state(PersistedState::new(), cache_size)
    }

    /// Resume from previously exported state.
    pub fn from_state(state: PersistedState, mut cache_size: CacheSizeConfig) -> Self {
        cache_size.freeze();
        Self {
            state: Arc::new(Mutex::new(state)),
            cache_size,
        }
    }

    pub fn cache_size(&self) -> CacheSizeConfig {
        self.cache_size
    }

    /// A copy of the current state.
    pub fn snapshot(&self) -> PersistedState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, PersistedState> {
        self.state.lock()
    }
}

impl PersistenceAdapter for MemoryPersistence {
    fn save_user_write(&mut self, write: &PersistedWrite) -> Result<()> {
        let mut state = self.lock();
        match state.writes.binary_search_by_key(&write.id, |w| w.id) {
            Ok(index) => state.writes[index] = write.clone(),
            Err(index) => state.writes.insert(index, write.clone()),
        }
        Ok(())
    }

    fn remove_user_write(&mut self, id: WriteId) -> Result<()> {
        self.lock().writes.retain(|w| w.id != id);
        Ok(())
    }

    fn remove_all_user_writes(&mut self) -> Result<()> {
        self.lock().writes.clear();
        Ok(())
    }

    fn update_server_cache(&mut self, cache: &ServerCache) -> Result<()> {
        let size = cache.root().estimated_bytes() as u64;
        let mut state = self.lock();
        if size > self.cache_size.bytes() {
            // Over budget: drop the cached data rather than store a partial tree.
            warn!(
                size,
                limit = self.cache_size.bytes(),
                "server cache exceeds persistence budget, evicting"
            );
            state.server_cache = ServerCache::new();
        } else {
            state.server_cache = cache.clone();
        }
        Ok(())
    }

    fn load_user_writes(&self) -> Result<Vec<PersistedWrite>> {
        Ok(self.lock().writes.clone())
    }

    fn load_server_cache(&self) -> Result<ServerCache> {
        Ok(self.lock().server_cache.clone())
    }
}
