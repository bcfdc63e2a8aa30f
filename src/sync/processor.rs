use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::chunk_index::ChunkIndex;
use super::item_cache::ItemCache;
use super::materializer::{EntityMaterializer, Outcome};
use super::processing::ProcessingTracker;
use super::record::{parse_payload, DirectoryEntryRecord, EntryType};
use crate::config::GabConfig;
use crate::store::{ChunkMessage, DirectoryStore, PropertyValue, PROP_OWNER_CHUNK};
use crate::types::error::Result;

/// Counts of what applying one chunk did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Entities of an earlier version of the chunk removed first
    pub deleted: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ApplyReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

/// Applies the payload of one chunk message to the directory store
pub struct ChunkProcessor<'a> {
    store: &'a dyn DirectoryStore,
    cache: &'a mut ItemCache,
    config: &'a GabConfig,
    tracker: &'a ProcessingTracker,
}

impl<'a> ChunkProcessor<'a> {
    pub fn new(
        store: &'a dyn DirectoryStore,
        cache: &'a mut ItemCache,
        config: &'a GabConfig,
        tracker: &'a ProcessingTracker,
    ) -> Self {
        Self {
            store,
            cache,
            config,
            tracker,
        }
    }

    /// Apply the message as chunk `index`
    ///
    /// A body that is not a JSON object fails the whole chunk before anything
    /// is touched. Failures of single entries are logged and counted.
    pub fn apply(&mut self, index: ChunkIndex, message: &ChunkMessage) -> Result<ApplyReport> {
        let entries = parse_payload(&message.body)?;
        let mut report = ApplyReport::default();

        if self.config.delete_existing_on_reprocess {
            report.deleted = self.delete_chunk_entities(index)?;
        }

        for (id, entry) in &entries {
            let _guard = self.tracker.begin();
            self.cache.remove(id);

            let record = match DirectoryEntryRecord::from_json(id, entry) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping entry {} of {}: {}", id, index, e);
                    report.skipped += 1;
                    continue;
                }
            };

            let mut materializer = EntityMaterializer::new(self.store, self.cache, self.config);
            let result = match record.entry_type {
                EntryType::Contact | EntryType::Equipment | EntryType::Room => {
                    materializer.materialize_contact(&record, index)
                }
                EntryType::Group => materializer.materialize_group(&record, index),
            };

            match result {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!("Failed to process entry {} of {}: {}", id, index, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Applied {}: {} created, {} updated, {} skipped, {} failed, {} removed first",
            index, report.created, report.updated, report.skipped, report.failed, report.deleted
        );
        Ok(report)
    }

    /// Delete everything an earlier version of this chunk wrote
    fn delete_chunk_entities(&mut self, index: ChunkIndex) -> Result<usize> {
        let owned = self
            .store
            .search(PROP_OWNER_CHUNK, &PropertyValue::Text(index.to_string()))?;

        for handle in &owned {
            if let Some(entity) = self.store.load(handle)? {
                if let Some(id) = entity.directory_id() {
                    self.cache.remove(id);
                }
            }
            self.store.delete(handle)?;
        }

        if !owned.is_empty() {
            debug!("Removed {} entities of earlier {}", owned.len(), index);
        }
        Ok(owned.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_memory_pool, SqliteDirectoryStore};
    use crate::store::PROP_DIRECTORY_ID;
    use crate::types::error::GabError;
    use chrono::Utc;

    fn message(body: &str) -> ChunkMessage {
        ChunkMessage {
            entry_id: "entry".to_string(),
            subject: "account-4/1".to_string(),
            body: body.to_string(),
            location: "v1".to_string(),
            revision: 1,
            modified_at: Utc::now(),
        }
    }

    fn ids(store: &SqliteDirectoryStore) -> Vec<String> {
        let mut ids: Vec<String> = store
            .search(PROP_OWNER_CHUNK, &PropertyValue::from("account-4/1"))
            .unwrap()
            .iter()
            .filter_map(|h| store.load(h).unwrap())
            .filter_map(|e| e.directory_id().map(str::to_string))
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_reapply_replaces_chunk_entities() {
        let store = SqliteDirectoryStore::new(create_memory_pool().unwrap(), "example.com");
        let config = GabConfig::default();
        let tracker = ProcessingTracker::new();
        let mut cache = ItemCache::new(true);
        let index = ChunkIndex::new(4, 1);

        let first = message(
            r#"{"x": {"type": "contact"}, "y": {"type": "contact"}, "z": {"type": "group"}}"#,
        );
        let report = ChunkProcessor::new(&store, &mut cache, &config, &tracker)
            .apply(index, &first)
            .unwrap();
        assert_eq!(report.created, 3);
        assert_eq!(ids(&store), vec!["x", "y", "z"]);

        let second = message(r#"{"x": {"type": "contact", "displayName": "X"}}"#);
        let report = ChunkProcessor::new(&store, &mut cache, &config, &tracker)
            .apply(index, &second)
            .unwrap();
        assert_eq!(report.deleted, 3);
        assert_eq!(report.created, 1);
        assert_eq!(ids(&store), vec!["x"]);
        assert!(!tracker.is_processing());
    }

    #[test]
    fn test_accumulate_mode_keeps_entities() {
        let store = SqliteDirectoryStore::new(create_memory_pool().unwrap(), "example.com");
        let config = GabConfig {
            delete_existing_on_reprocess: false,
            ..GabConfig::default()
        };
        let tracker = ProcessingTracker::new();
        let mut cache = ItemCache::new(true);
        let index = ChunkIndex::new(4, 1);

        ChunkProcessor::new(&store, &mut cache, &config, &tracker)
            .apply(index, &message(r#"{"x": {"type": "contact"}, "y": {"type": "contact"}}"#))
            .unwrap();
        let report = ChunkProcessor::new(&store, &mut cache, &config, &tracker)
            .apply(index, &message(r#"{"x": {"type": "contact"}}"#))
            .unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(ids(&store), vec!["x", "y"]);
    }

    #[test]
    fn test_bad_entries_do_not_stop_the_chunk() {
        let store = SqliteDirectoryStore::new(create_memory_pool().unwrap(), "example.com");
        let config = GabConfig::default();
        let tracker = ProcessingTracker::new();
        let mut cache = ItemCache::new(true);

        let report = ChunkProcessor::new(&store, &mut cache, &config, &tracker)
            .apply(
                ChunkIndex::new(4, 1),
                &message(r#"{"a": {"type": "printer"}, "b": 5, "c": {"type": "contact"}}"#),
            )
            .unwrap();

        assert_eq!(report.skipped, 2);
        assert_eq!(report.created, 1);
        assert!(store
            .search_one(PROP_DIRECTORY_ID, &PropertyValue::from("c"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_invalid_body_touches_nothing() {
        let store = SqliteDirectoryStore::new(create_memory_pool().unwrap(), "example.com");
        let config = GabConfig::default();
        let tracker = ProcessingTracker::new();
        let mut cache = ItemCache::new(true);
        let index = ChunkIndex::new(4, 1);

        ChunkProcessor::new(&store, &mut cache, &config, &tracker)
            .apply(index, &message(r#"{"x": {"type": "contact"}}"#))
            .unwrap();
        let result = ChunkProcessor::new(&store, &mut cache, &config, &tracker)
            .apply(index, &message("{not json"));

        assert!(matches!(result, Err(GabError::Parse(_))));
        assert_eq!(ids(&store), vec!["x"]);
    }
}
