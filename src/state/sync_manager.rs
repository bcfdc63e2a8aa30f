//! Sync engine manager state
//!
//! Manages one GAB engine per directory (domain). Engines are synchronous and
//! run on the blocking pool; each sits behind its own mutex so at most one
//! chunk of a directory is applied at a time while different directories
//! proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::adapters::sqlite::{self, DbPool, SqliteDirectoryStore, SqliteMessageQueue};
use crate::config::GabConfig;
use crate::store::{DirectoryStore, EntityHandle};
use crate::sync::engine::{validate_entry_id, GabEngine, ProcessSummary};
use crate::sync::processing::{ChangeDisposition, ProcessingTracker};
use crate::types::error::{GabError, Result};

/// A registered directory and what is needed to answer questions about it
/// while its engine is busy
struct Registration {
    engine: Arc<Mutex<GabEngine>>,
    store: Arc<dyn DirectoryStore>,
    tracker: ProcessingTracker,
}

/// Sync engine manager state - manages engines for multiple directories
pub struct SyncManager {
    pool: DbPool,
    config: GabConfig,
    directories: RwLock<HashMap<String, Registration>>,
}

impl SyncManager {
    pub fn new(pool: DbPool, config: GabConfig) -> Self {
        Self {
            pool,
            config,
            directories: RwLock::new(HashMap::new()),
        }
    }

    /// Open the database named by the configuration
    pub fn open(config: GabConfig) -> Result<Self> {
        info!("Sync database: {:?}", config.db_path);
        let pool = sqlite::create_pool(&config.db_path)?;
        Ok(Self::new(pool, config))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn config(&self) -> &GabConfig {
        &self.config
    }

    /// Chunk queue of a directory, for the channel that delivers chunks
    pub fn queue(&self, domain: &str) -> SqliteMessageQueue {
        SqliteMessageQueue::new(self.pool.clone(), domain)
    }

    /// Get or create the engine of a directory backed by the manager's database
    pub async fn register_directory(&self, domain: &str) -> Arc<Mutex<GabEngine>> {
        let store: Arc<dyn DirectoryStore> =
            Arc::new(SqliteDirectoryStore::new(self.pool.clone(), domain));
        let queue = Arc::new(self.queue(domain));
        self.register_with(domain, store, queue).await
    }

    /// Get or create the engine of a directory with caller-provided collaborators
    pub async fn register_with(
        &self,
        domain: &str,
        store: Arc<dyn DirectoryStore>,
        queue: Arc<dyn crate::store::MessageQueue>,
    ) -> Arc<Mutex<GabEngine>> {
        let mut directories = self.directories.write().await;
        if let Some(registration) = directories.get(domain) {
            return registration.engine.clone();
        }

        info!("Registering directory: {}", domain);
        let engine = GabEngine::new(domain, self.config.clone(), store.clone(), queue);
        let tracker = engine.tracker();
        let engine = Arc::new(Mutex::new(engine));

        directories.insert(
            domain.to_string(),
            Registration {
                engine: engine.clone(),
                store,
                tracker,
            },
        );
        engine
    }

    /// Get the engine of a directory (if registered)
    pub async fn engine(&self, domain: &str) -> Option<Arc<Mutex<GabEngine>>> {
        let directories = self.directories.read().await;
        directories.get(domain).map(|r| r.engine.clone())
    }

    /// Get all registered directories
    pub async fn directories(&self) -> Vec<String> {
        let directories = self.directories.read().await;
        let mut domains: Vec<String> = directories.keys().cloned().collect();
        domains.sort();
        domains
    }

    async fn require(&self, domain: &str) -> Result<Arc<Mutex<GabEngine>>> {
        self.engine(domain)
            .await
            .ok_or_else(|| GabError::NotFound(format!("Directory not registered: {}", domain)))
    }

    /// Process one queue message of a directory, or its whole queue
    pub async fn process(&self, domain: &str, entry_id: Option<String>) -> Result<ProcessSummary> {
        if let Some(entry_id) = &entry_id {
            validate_entry_id(entry_id)?;
        }
        let engine = self.require(domain).await?;
        run_blocking(engine, move |engine| engine.process(entry_id.as_deref())).await
    }

    /// Rebuild one directory from its queue
    pub async fn full_resync(&self, domain: &str) -> Result<ProcessSummary> {
        let engine = self.require(domain).await?;
        run_blocking(engine, |engine| engine.full_resync()).await
    }

    /// Rebuild every registered directory
    pub async fn full_resync_all(&self) -> Vec<(String, ProcessSummary)> {
        let mut results = Vec::new();
        for domain in self.directories().await {
            match self.full_resync(&domain).await {
                Ok(summary) => results.push((domain, summary)),
                Err(e) => error!("Full resync of {} failed: {}", domain, e),
            }
        }
        results
    }

    /// Unregister a directory and delete its entities and chunk state
    ///
    /// Works for directories that are only present in the database, too.
    /// Returns the number of entities removed.
    pub async fn remove_directory(&self, domain: &str) -> Result<usize> {
        let registration = self.directories.write().await.remove(domain);

        match registration {
            Some(registration) => {
                info!("Removing registered directory: {}", domain);
                run_blocking(registration.engine, |engine| engine.remove()).await?
            }
            None => {
                let removed = sqlite::remove_directory(&self.pool, domain)?;
                info!("Removed stored directory {} ({} entities)", domain, removed);
                Ok(removed)
            }
        }
    }

    /// Remove the data of directories that are stored but no longer registered
    pub async fn check_unused(&self) -> Result<Vec<String>> {
        if !self.config.check_unused {
            return Ok(Vec::new());
        }

        let registered = self.directories().await;
        let mut removed = Vec::new();
        for domain in sqlite::known_directories(&self.pool)? {
            if registered.contains(&domain) {
                continue;
            }
            debug!("Directory {} is not used anymore", domain);
            self.remove_directory(&domain).await?;
            removed.push(domain);
        }
        Ok(removed)
    }

    /// Classify a change event raised for an entity of a directory
    pub async fn on_entity_change(&self, domain: &str, handle: &EntityHandle) -> ChangeDisposition {
        let directories = self.directories.read().await;
        let registration = match directories.get(domain) {
            Some(registration) => registration,
            None => return ChangeDisposition::Allow,
        };

        if registration.tracker.is_processing() {
            return ChangeDisposition::Ignore;
        }
        if !registration.store.is_live(handle) {
            // Not one of ours
            return ChangeDisposition::Allow;
        }
        registration
            .tracker
            .classify(self.config.suppress_modifications)
    }
}

/// Run `f` on the engine from the blocking pool
async fn run_blocking<T, F>(engine: Arc<Mutex<GabEngine>>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut GabEngine) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut engine = engine.blocking_lock();
        f(&mut engine)
    })
    .await
    .map_err(|e| GabError::Other(format!("Engine task failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_memory_pool;
    use crate::store::{EntityKind, MessageQueue, PropertyValue, PROP_DIRECTORY_ID};

    fn manager() -> SyncManager {
        SyncManager::new(create_memory_pool().unwrap(), GabConfig::default())
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let manager = manager();
        let first = manager.register_directory("example.com").await;
        let second = manager.register_directory("example.com").await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.directories().await, vec!["example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_process_unknown_directory_fails() {
        let manager = manager();
        let result = manager.process("nowhere.example", None).await;
        assert!(matches!(result, Err(GabError::NotFound(_))));

        manager.register_directory("example.com").await;
        let result = manager.process("example.com", Some(String::new())).await;
        assert!(matches!(result, Err(GabError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_process_applies_delivered_chunks() {
        let manager = manager();
        manager.register_directory("example.com").await;
        let entry = manager
            .queue("example.com")
            .deliver("account-1/0", r#"{"alice": {"type": "contact"}}"#, "v1")
            .unwrap();

        let summary = manager.process("example.com", None).await.unwrap();
        assert_eq!(summary.applied, 1);

        let summary = manager.process("example.com", Some(entry)).await.unwrap();
        assert_eq!(summary.up_to_date, 1);
    }

    #[tokio::test]
    async fn test_check_unused_removes_orphans() {
        let manager = manager();
        manager.register_directory("kept.example").await;

        let orphan = SqliteDirectoryStore::new(manager.pool().clone(), "gone.example");
        let mut contact = orphan.create(EntityKind::Contact).unwrap();
        contact.set(PROP_DIRECTORY_ID, "alice");
        orphan.save(&contact).unwrap();

        let removed = manager.check_unused().await.unwrap();
        assert_eq!(removed, vec!["gone.example".to_string()]);
        assert_eq!(orphan.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_directory_unregisters() {
        let manager = manager();
        manager.register_directory("example.com").await;
        manager
            .queue("example.com")
            .deliver("account-1/0", r#"{"alice": {"type": "contact"}}"#, "v1")
            .unwrap();
        manager.process("example.com", None).await.unwrap();

        assert_eq!(manager.remove_directory("example.com").await.unwrap(), 1);
        assert!(manager.engine("example.com").await.is_none());
        // The queue itself belongs to the delivering channel
        assert_eq!(manager.queue("example.com").entry_ids().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_entity_changes_are_classified() {
        let manager = manager();
        manager.register_directory("example.com").await;
        manager
            .queue("example.com")
            .deliver("account-1/0", r#"{"alice": {"type": "contact"}}"#, "v1")
            .unwrap();
        manager.process("example.com", None).await.unwrap();

        let store = SqliteDirectoryStore::new(manager.pool().clone(), "example.com");
        let alice = store
            .search_one(PROP_DIRECTORY_ID, &PropertyValue::from("alice"))
            .unwrap()
            .unwrap();
        let stranger = EntityHandle::new("not-mirrored");

        assert_eq!(
            manager.on_entity_change("example.com", &alice).await,
            ChangeDisposition::Reject
        );
        assert_eq!(
            manager.on_entity_change("example.com", &stranger).await,
            ChangeDisposition::Allow
        );
        assert_eq!(
            manager.on_entity_change("other.example", &alice).await,
            ChangeDisposition::Allow
        );

        let engine = manager.engine("example.com").await.unwrap();
        let _guard = engine.lock().await.tracker().begin();
        assert_eq!(
            manager.on_entity_change("example.com", &alice).await,
            ChangeDisposition::Ignore
        );
    }
}
