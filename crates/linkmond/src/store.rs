//! Persistent operator-state storage.
//!
//! The daemon keeps a single JSON blob (`LinkMonitorState`) under a
//! well-known key. The blob is rewritten on every operator change, before
//! any advertisement goes out, so announced state is never more permissive
//! than persisted state after a crash.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::{LinkMonitorError, Result};
use crate::types::LinkMonitorState;

/// Narrow handle to the persistent configuration store.
///
/// The store outlives the link monitor; implementations are used only from
/// the event-loop task.
#[async_trait]
pub trait ConfigStore: Send {
    /// Loads the persisted state, None when nothing was ever stored.
    async fn load(&mut self) -> Result<Option<LinkMonitorState>>;

    /// Persists the state, replacing any previous blob.
    async fn save(&mut self, state: &LinkMonitorState) -> Result<()>;
}

/// File-backed store: JSON blob replaced atomically via temp-file rename.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    /// Creates a store at the given path; parent directories are created on
    /// the first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load(&mut self) -> Result<Option<LinkMonitorState>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LinkMonitorError::Store(format!(
                    "cannot read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };
        match serde_json::from_str::<LinkMonitorState>(&content) {
            Ok(state) => {
                debug!(path = %self.path.display(), "Loaded persisted state");
                Ok(Some(state))
            }
            Err(e) => {
                // A corrupt blob is treated as absent so the daemon can
                // start; the next save replaces it.
                warn!(path = %self.path.display(), error = %e, "Discarding corrupt state blob");
                Ok(None)
            }
        }
    }

    async fn save(&mut self, state: &LinkMonitorState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LinkMonitorError::Store(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let blob = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, blob).map_err(|e| {
            LinkMonitorError::Store(format!("cannot write {}: {}", tmp.display(), e))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            LinkMonitorError::Store(format!("cannot replace {}: {}", self.path.display(), e))
        })?;
        debug!(path = %self.path.display(), "Persisted state");
        Ok(())
    }
}

/// In-memory store for tests; can be told to fail the next save.
#[derive(Debug, Default)]
pub struct MemConfigStore {
    state: Option<LinkMonitorState>,
    /// Number of completed saves
    pub save_count: usize,
    /// When set, the next save fails and clears the flag
    pub fail_next_save: bool,
}

impl MemConfigStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-seeded with state.
    pub fn with_state(state: LinkMonitorState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// The currently stored state, if any.
    pub fn stored(&self) -> Option<&LinkMonitorState> {
        self.state.as_ref()
    }
}

impl MemConfigStore {
    fn do_save(&mut self, state: &LinkMonitorState) -> Result<()> {
        if self.fail_next_save {
            self.fail_next_save = false;
            return Err(LinkMonitorError::Store("injected save failure".to_string()));
        }
        self.state = Some(state.clone());
        self.save_count += 1;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemConfigStore {
    async fn load(&mut self) -> Result<Option<LinkMonitorState>> {
        Ok(self.state.clone())
    }

    async fn save(&mut self, state: &LinkMonitorState) -> Result<()> {
        self.do_save(state)
    }
}

/// Cloneable view over a [`MemConfigStore`], letting a test keep eyes on a
/// store whose other handle was moved into the monitor.
#[derive(Debug, Default, Clone)]
pub struct SharedConfigStore {
    inner: std::sync::Arc<std::sync::Mutex<MemConfigStore>>,
}

impl SharedConfigStore {
    /// Creates an empty shared store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a shared store pre-seeded with state.
    pub fn with_state(state: LinkMonitorState) -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::Mutex::new(MemConfigStore::with_state(state))),
        }
    }

    /// Runs a closure against the underlying store.
    pub fn with<R>(&self, f: impl FnOnce(&mut MemConfigStore) -> R) -> R {
        f(&mut self.inner.lock().expect("config store mutex poisoned"))
    }
}

#[async_trait]
impl ConfigStore for SharedConfigStore {
    async fn load(&mut self) -> Result<Option<LinkMonitorState>> {
        Ok(self.with(|store| store.state.clone()))
    }

    async fn save(&mut self, state: &LinkMonitorState) -> Result<()> {
        self.with(|store| store.do_save(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileConfigStore::new(dir.path().join("state.json"));

        assert!(store.load().await.unwrap().is_none());

        let mut state = LinkMonitorState {
            node_overloaded: true,
            version: LinkMonitorState::VERSION,
            ..Default::default()
        };
        state.overloaded_links.insert("et1".to_string());
        store.save(&state).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_file_store_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileConfigStore::new(dir.path().join("nested/deep/state.json"));
        store.save(&LinkMonitorState::default()).await.unwrap();
        assert!(store.load().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_store_discards_corrupt_blob() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        let mut store = FileConfigStore::new(path);
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mem_store_fail_next_save() {
        let mut store = MemConfigStore::new();
        store.fail_next_save = true;
        assert!(store.save(&LinkMonitorState::default()).await.is_err());
        assert!(store.stored().is_none());

        // flag clears after one failure
        store.save(&LinkMonitorState::default()).await.unwrap();
        assert_eq!(store.save_count, 1);
    }
}
