//! Outer database facade: enumerates `collections/<name>/` directories
//! under a root path and lazily instantiates [`Collection`] handles. This
//! is the minimal consumer-facing entry point; it does not implement
//! checkpoint/snapshot framing, encryption, import/export, a CLI shell, or
//! a query DSL.

use crate::clock::{Clock, SystemClock};
use crate::collection::Collection;
use crate::config::EngineConfig;
use crate::errors::DbError;
use crate::ids::{RandomUuidGenerator, UuidGenerator};
use crate::storage::{FsStorage, StoragePort};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct Database {
    storage: Arc<dyn StoragePort>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn UuidGenerator>,
    collections: Mutex<HashMap<String, Arc<Collection>>>,
}

impl Database {
    /// Opens a database rooted at `path` on the local filesystem, with
    /// default engine tunables.
    #[must_use]
    pub fn open(path: impl Into<std::path::PathBuf>) -> Self {
        Self::with_config(Arc::new(FsStorage::new(path.into())), EngineConfig::default())
    }

    /// Opens a database over an arbitrary storage port and configuration,
    /// e.g. for tests substituting a deterministic clock/id generator.
    #[must_use]
    pub fn with_config(storage: Arc<dyn StoragePort>, config: EngineConfig) -> Self {
        Self {
            storage,
            config,
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomUuidGenerator),
            collections: Mutex::new(HashMap::new()),
        }
    }

    /// Returns (creating if necessary, lazily) a handle to `name`.
    pub async fn collection(&self, name: &str) -> Arc<Collection> {
        let mut collections = self.collections.lock().await;
        if let Some(existing) = collections.get(name) {
            return Arc::clone(existing);
        }
        let col = Arc::new(Collection::new(name, self.config, Arc::clone(&self.storage), Arc::clone(&self.clock), Arc::clone(&self.ids)));
        collections.insert(name.to_string(), Arc::clone(&col));
        col
    }

    /// Drops a collection's storage and removes it from the cache.
    ///
    /// # Errors
    /// Returns an error if the underlying storage delete fails.
    pub async fn drop_collection(&self, name: &str) -> Result<(), DbError> {
        let col = self.collection(name).await;
        col.drop().await?;
        self.collections.lock().await.remove(name);
        Ok(())
    }

    /// Lists collection names by listing `collections/` subdirectories.
    ///
    /// # Errors
    /// Returns an error if the storage listing fails.
    pub async fn list_collections(&self) -> Result<Vec<String>, DbError> {
        let mut names = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.storage.list_dirs("collections", 256, cursor.as_deref()).await?;
            let done = page.next.is_none();
            names.extend(page.names);
            cursor = page.next;
            if done {
                break;
            }
        }
        Ok(names)
    }
}
