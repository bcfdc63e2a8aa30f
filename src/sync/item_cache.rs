use std::collections::HashMap;
use tracing::debug;

use crate::store::{DirectoryStore, EntityHandle, PropertyValue, PROP_DIRECTORY_ID};
use crate::types::error::Result;

/// Cache of directory id → local entity handle lookups
///
/// Misses are cached too, so a forward reference is only searched for once
/// per pass. Cached handles are probed for liveness before being returned; a
/// single stale handle invalidates the whole cache, as the store was changed
/// behind our back.
#[derive(Debug)]
pub struct ItemCache {
    enabled: bool,
    entries: HashMap<String, Option<EntityHandle>>,
}

impl ItemCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: HashMap::new(),
        }
    }

    /// Resolve a directory id to the handle of its local entity
    pub fn find(&mut self, store: &dyn DirectoryStore, id: &str) -> Result<Option<EntityHandle>> {
        if self.enabled {
            match self.entries.get(id) {
                Some(None) => return Ok(None),
                Some(Some(handle)) => {
                    if store.is_live(handle) {
                        return Ok(Some(handle.clone()));
                    }
                    debug!("Cached handle for {} is stale, invalidating item cache", id);
                    self.entries.clear();
                }
                None => {}
            }
        }

        let found = store.search_one(PROP_DIRECTORY_ID, &PropertyValue::from(id))?;
        if self.enabled {
            self.entries.insert(id.to_string(), found.clone());
        }
        Ok(found)
    }

    /// Record a freshly created entity
    pub fn insert(&mut self, id: &str, handle: EntityHandle) {
        if self.enabled {
            self.entries.insert(id.to_string(), Some(handle));
        }
    }

    pub fn remove(&mut self, id: &str) {
        self.entries.remove(id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_memory_pool, SqliteDirectoryStore};
    use crate::store::EntityKind;

    fn stored_contact(store: &SqliteDirectoryStore, id: &str) -> EntityHandle {
        let mut entity = store.create(EntityKind::Contact).unwrap();
        entity.set(PROP_DIRECTORY_ID, id);
        store.save(&entity).unwrap();
        entity.handle
    }

    #[test]
    fn test_find_caches_hits_and_misses() {
        let store = SqliteDirectoryStore::new(create_memory_pool().unwrap(), "example.com");
        let handle = stored_contact(&store, "alice");
        let mut cache = ItemCache::new(true);

        assert_eq!(cache.find(&store, "alice").unwrap(), Some(handle.clone()));
        assert_eq!(cache.find(&store, "nobody").unwrap(), None);
        assert_eq!(cache.len(), 2);

        // A cached miss stays a miss until evicted
        let bob = stored_contact(&store, "bob");
        assert_eq!(cache.find(&store, "bob").unwrap(), Some(bob));
        let late = stored_contact(&store, "nobody");
        assert_eq!(cache.find(&store, "nobody").unwrap(), None);
        cache.remove("nobody");
        assert_eq!(cache.find(&store, "nobody").unwrap(), Some(late));
    }

    #[test]
    fn test_stale_handle_invalidates_cache() {
        let store = SqliteDirectoryStore::new(create_memory_pool().unwrap(), "example.com");
        let alice = stored_contact(&store, "alice");
        stored_contact(&store, "bob");
        let mut cache = ItemCache::new(true);

        cache.find(&store, "alice").unwrap();
        cache.find(&store, "bob").unwrap();
        assert_eq!(cache.len(), 2);

        store.delete(&alice).unwrap();
        assert_eq!(cache.find(&store, "alice").unwrap(), None);
        // Everything but the fresh lookup was dropped
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_disabled_cache_always_searches() {
        let store = SqliteDirectoryStore::new(create_memory_pool().unwrap(), "example.com");
        let mut cache = ItemCache::new(false);

        assert_eq!(cache.find(&store, "alice").unwrap(), None);
        let handle = stored_contact(&store, "alice");
        cache.insert("alice", handle.clone());
        assert!(cache.is_empty());
        assert_eq!(cache.find(&store, "alice").unwrap(), Some(handle));
    }
}
