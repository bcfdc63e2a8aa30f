//! Chunked directory synchronization engine
//!
//! One engine mirrors one directory. It decides for every queue message
//! whether it belongs to the current chunk sequence and whether its content
//! changed since it was last applied, and only then hands it to the
//! [`ChunkProcessor`].
//!
//! The engine is synchronous; the manager runs it on the blocking pool and
//! holds it behind a mutex so at most one chunk of a directory is applied at
//! a time.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn};

use super::chunk_index::ChunkIndex;
use super::item_cache::ItemCache;
use super::processing::{ChangeDisposition, ProcessingTracker};
use super::processor::{ApplyReport, ChunkProcessor};
use super::state_store::ChunkStateStore;
use crate::config::GabConfig;
use crate::store::{ChunkMessage, DirectoryStore, MessageQueue};
use crate::types::error::{GabError, Result};

/// Queue message property recording when a chunk was applied
pub const PROP_APPLIED_AT: &str = "gabAppliedAt";

/// Sequence tracking state of a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceState {
    /// No chunk found in the queue yet
    Unknown,
    Stable(u32),
    /// The chunk count changed and the directory was cleared. Stays until a
    /// full pass over the queue has applied the new sequence.
    Rechunking { from: Option<u32>, to: u32 },
}

/// Whether and how a queue message should be processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    NotAChunk,
    /// Belongs to a sequence other than the current one
    Stale,
    /// Already applied with the same version token
    UpToDate,
    Apply(ChunkIndex),
}

/// Result of looking at one queue message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageOutcome {
    /// Message processing is switched off
    Disabled,
    /// The message is gone from the queue
    Missing,
    Ignored(Decision),
    Applied(ApplyReport),
}

/// Summary of a processing pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSummary {
    pub applied: usize,
    pub up_to_date: usize,
    pub stale: usize,
    pub ignored: usize,
    pub failed: usize,
}

impl ProcessSummary {
    fn record(&mut self, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Applied(_) => self.applied += 1,
            MessageOutcome::Ignored(Decision::UpToDate) => self.up_to_date += 1,
            MessageOutcome::Ignored(Decision::Stale) => self.stale += 1,
            MessageOutcome::Ignored(_) | MessageOutcome::Disabled | MessageOutcome::Missing => {
                self.ignored += 1
            }
        }
    }
}

/// Synchronization engine for one directory
pub struct GabEngine {
    directory: String,
    config: GabConfig,
    store: Arc<dyn DirectoryStore>,
    queue: Arc<dyn MessageQueue>,
    state: ChunkStateStore,
    cache: ItemCache,
    tracker: ProcessingTracker,
    sequence: SequenceState,
}

impl GabEngine {
    pub fn new(
        directory: &str,
        config: GabConfig,
        store: Arc<dyn DirectoryStore>,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        info!("Creating GAB engine for directory: {}", directory);
        let state = ChunkStateStore::new(store.clone(), config.max_chunks);
        let sequence = match state.number_of_chunks() {
            Ok(Some(count)) => SequenceState::Stable(count),
            Ok(None) => SequenceState::Unknown,
            Err(e) => {
                warn!("Failed to read chunk sequence of {}: {}", directory, e);
                SequenceState::Unknown
            }
        };
        Self {
            directory: directory.to_string(),
            cache: ItemCache::new(config.item_cache_enabled),
            state,
            config,
            store,
            queue,
            tracker: ProcessingTracker::new(),
            sequence,
        }
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn config(&self) -> &GabConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn DirectoryStore> {
        self.store.clone()
    }

    /// Shared tracker of in-flight engine writes
    pub fn tracker(&self) -> ProcessingTracker {
        self.tracker.clone()
    }

    pub fn sequence_state(&self) -> SequenceState {
        self.sequence
    }

    /// Persisted number of chunks of the current sequence
    pub fn current_sequence(&self) -> Result<Option<u32>> {
        self.state.number_of_chunks()
    }

    /// Classify a change event on one of this directory's entities
    pub fn classify_change(&self) -> ChangeDisposition {
        self.tracker.classify(self.config.suppress_modifications)
    }

    /// Chunk index of a subject, `None` for subjects that are not chunks or
    /// name more chunks than `max_chunks`
    pub fn chunk_index(&self, subject: &str) -> Option<ChunkIndex> {
        let index = ChunkIndex::parse(subject)?;
        if index.number_of_chunks > self.config.max_chunks {
            warn!("Ignoring {}: more than {} chunks", index, self.config.max_chunks);
            return None;
        }
        Some(index)
    }

    /// Chunk index of the most recently modified chunk message
    ///
    /// Only the newest few messages are looked at, which is enough to find
    /// one chunk of the newest sequence.
    pub fn find_newest_chunk_index(&self) -> Result<Option<ChunkIndex>> {
        let newest = self.queue.newest(self.config.newest_max_check)?;
        Ok(newest
            .iter()
            .find_map(|message| self.chunk_index(&message.subject)))
    }

    /// Re-derive the current sequence from the queue
    ///
    /// A change of the chunk count clears the directory and starts a fresh
    /// sequence with no chunk applied. Errors are logged and drop the
    /// persisted state, so the next pass determines the sequence again.
    pub fn determine_sequence(&mut self) -> Option<u32> {
        match self.try_determine_sequence() {
            Ok(count) => count,
            Err(e) => {
                error!("Failed to determine chunk sequence of {}: {}", self.directory, e);
                if let Err(e) = self.state.clear() {
                    error!("Failed to clear chunk state of {}: {}", self.directory, e);
                }
                self.sequence = SequenceState::Unknown;
                None
            }
        }
    }

    fn try_determine_sequence(&mut self) -> Result<Option<u32>> {
        let newest = match self.find_newest_chunk_index()? {
            Some(index) => index,
            None => {
                debug!("No chunk found in queue of {}", self.directory);
                self.state.clear()?;
                self.sequence = SequenceState::Unknown;
                return Ok(None);
            }
        };

        let count = newest.number_of_chunks;
        let current = self.state.number_of_chunks()?;
        if current == Some(count) {
            let rebuilding =
                matches!(self.sequence, SequenceState::Rechunking { to, .. } if to == count);
            if !rebuilding {
                self.sequence = SequenceState::Stable(count);
            }
            return Ok(Some(count));
        }

        info!(
            "Chunk sequence of {} changed from {:?} to {}, rebuilding",
            self.directory, current, count
        );
        self.sequence = SequenceState::Rechunking {
            from: current,
            to: count,
        };
        self.clear_contacts()?;
        self.state.reset(count)?;
        Ok(Some(count))
    }

    /// Decide what to do with a queue message
    pub fn decide(&mut self, message: &ChunkMessage) -> Result<Decision> {
        let index = match self.chunk_index(&message.subject) {
            Some(index) => index,
            None => return Ok(Decision::NotAChunk),
        };

        if self.state.number_of_chunks()? != Some(index.number_of_chunks)
            && self.determine_sequence() != Some(index.number_of_chunks)
        {
            return Ok(Decision::Stale);
        }

        let applied = self.state.version_token(index)?;
        if applied.as_deref() == Some(message.location.as_str()) {
            return Ok(Decision::UpToDate);
        }
        Ok(Decision::Apply(index))
    }

    /// Process a single queue message
    pub fn process_message(&mut self, entry_id: &str) -> Result<MessageOutcome> {
        if !self.config.process_messages {
            return Ok(MessageOutcome::Disabled);
        }

        let message = match self.queue.get(entry_id)? {
            Some(message) => message,
            None => {
                debug!("Queue message {} no longer exists", entry_id);
                return Ok(MessageOutcome::Missing);
            }
        };

        let result = self.process_loaded(&message);
        self.cache.clear();
        result
    }

    fn process_loaded(&mut self, message: &ChunkMessage) -> Result<MessageOutcome> {
        let _guard = self.tracker.begin();

        let index = match self.decide(message)? {
            Decision::Apply(index) => index,
            decision => {
                debug!("Not applying {} ({}): {:?}", message.subject, message.entry_id, decision);
                return Ok(MessageOutcome::Ignored(decision));
            }
        };

        let report = ChunkProcessor::new(
            self.store.as_ref(),
            &mut self.cache,
            &self.config,
            &self.tracker,
        )
        .apply(index, message)?;

        self.state.set_version_token(index, &message.location)?;
        self.queue
            .set_property(&message.entry_id, PROP_APPLIED_AT, &Utc::now().to_rfc3339())?;
        Ok(MessageOutcome::Applied(report))
    }

    /// Determine the sequence and process every message in the queue
    pub fn process_all(&mut self) -> Result<ProcessSummary> {
        let mut summary = ProcessSummary::default();
        self.state.invalidate();

        if !self.config.process_messages {
            return Ok(summary);
        }
        if self.determine_sequence().is_none() {
            return Ok(summary);
        }

        for entry_id in self.queue.entry_ids()? {
            match self.process_message(&entry_id) {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    error!("Failed to process queue message {}: {}", entry_id, e);
                    summary.failed += 1;
                }
            }
        }

        if let SequenceState::Rechunking { to, .. } = self.sequence {
            info!("Rebuilt {} with {} chunks", self.directory, to);
            self.sequence = SequenceState::Stable(to);
        }
        Ok(summary)
    }

    /// Process one message, or the whole queue when `entry_id` is `None`.
    /// Errors are logged, never returned.
    pub fn process(&mut self, entry_id: Option<&str>) -> ProcessSummary {
        let span = info_span!("gab", directory = %self.directory);
        let _enter = span.enter();

        match entry_id {
            Some(entry_id) => {
                self.state.invalidate();
                let mut summary = ProcessSummary::default();
                match self.process_message(entry_id) {
                    Ok(outcome) => summary.record(&outcome),
                    Err(e) => {
                        error!("Failed to process queue message {}: {}", entry_id, e);
                        summary.failed += 1;
                    }
                }
                summary
            }
            None => self.process_all().unwrap_or_else(|e| {
                error!("Failed to process queue of {}: {}", self.directory, e);
                ProcessSummary {
                    failed: 1,
                    ..ProcessSummary::default()
                }
            }),
        }
    }

    /// Drop all mirrored entities and chunk state, then reprocess the queue
    pub fn full_resync(&mut self) -> ProcessSummary {
        let span = info_span!("gab", directory = %self.directory);
        let _enter = span.enter();
        info!("Full resync of {}", self.directory);

        if let Err(e) = self.reset() {
            error!("Failed to reset {} for full resync: {}", self.directory, e);
            return ProcessSummary {
                failed: 1,
                ..ProcessSummary::default()
            };
        }

        self.process_all().unwrap_or_else(|e| {
            error!("Full resync of {} failed: {}", self.directory, e);
            ProcessSummary {
                failed: 1,
                ..ProcessSummary::default()
            }
        })
    }

    fn reset(&mut self) -> Result<()> {
        self.clear_contacts()?;
        self.state.clear()?;
        self.cache.clear();
        self.sequence = SequenceState::Unknown;
        Ok(())
    }

    /// Delete all mirrored entities of the directory, if clearing is enabled.
    /// Returns the number of entities removed.
    pub fn clear_contacts(&mut self) -> Result<usize> {
        self.cache.clear();
        if !self.config.clear_contacts {
            warn!("Not clearing contacts of {}: disabled", self.directory);
            return Ok(0);
        }

        let _guard = self.tracker.begin();
        let removed = self.store.clear()?;
        info!("Cleared {} entities of {}", removed, self.directory);
        Ok(removed)
    }

    /// Remove every trace of the directory from the store
    pub fn remove(&mut self) -> Result<usize> {
        let _guard = self.tracker.begin();
        let removed = self.store.clear()?;
        self.state.clear()?;
        self.cache.clear();
        self.sequence = SequenceState::Unknown;
        info!("Removed directory {} ({} entities)", self.directory, removed);
        Ok(removed)
    }
}

impl std::fmt::Debug for GabEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GabEngine")
            .field("directory", &self.directory)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Reject entry ids the queue cannot possibly hold
pub fn validate_entry_id(entry_id: &str) -> Result<()> {
    if entry_id.trim().is_empty() {
        return Err(GabError::InvalidInput("Empty queue entry id".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_memory_pool, SqliteDirectoryStore, SqliteMessageQueue};
    use crate::store::{PropertyValue, PROP_DIRECTORY_ID};

    struct Fixture {
        store: Arc<SqliteDirectoryStore>,
        queue: Arc<SqliteMessageQueue>,
        engine: GabEngine,
    }

    fn fixture_with(config: GabConfig) -> Fixture {
        let pool = create_memory_pool().unwrap();
        let store = Arc::new(SqliteDirectoryStore::new(pool.clone(), "example.com"));
        let queue = Arc::new(SqliteMessageQueue::new(pool, "example.com"));
        let engine = GabEngine::new("example.com", config, store.clone(), queue.clone());
        Fixture {
            store,
            queue,
            engine,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(GabConfig::default())
    }

    fn has(store: &SqliteDirectoryStore, id: &str) -> bool {
        store
            .search_one(PROP_DIRECTORY_ID, &PropertyValue::from(id))
            .unwrap()
            .is_some()
    }

    #[test]
    fn test_non_chunk_messages_are_ignored() {
        let mut f = fixture();
        let entry = f.queue.deliver("hello", "{}", "v1").unwrap();

        let outcome = f.engine.process_message(&entry).unwrap();
        assert_eq!(outcome, MessageOutcome::Ignored(Decision::NotAChunk));
        assert_eq!(f.engine.determine_sequence(), None);
        assert_eq!(f.engine.sequence_state(), SequenceState::Unknown);
    }

    #[test]
    fn test_same_message_applies_once() {
        let mut f = fixture();
        let entry = f
            .queue
            .deliver("account-1/0", r#"{"alice": {"type": "contact"}}"#, "v1")
            .unwrap();

        let summary = f.engine.process(None);
        assert_eq!(summary.applied, 1);
        assert!(has(&f.store, "alice"));
        assert!(f.queue.property(&entry, PROP_APPLIED_AT).unwrap().is_some());

        let summary = f.engine.process(Some(entry.as_str()));
        assert_eq!(summary.up_to_date, 1);
        assert_eq!(f.store.count().unwrap(), 1);
    }

    #[test]
    fn test_changed_location_reapplies() {
        let mut f = fixture();
        f.queue
            .deliver("account-1/0", r#"{"alice": {"type": "contact"}}"#, "v1")
            .unwrap();
        f.engine.process(None);

        let entry = f
            .queue
            .deliver("account-1/0", r#"{"bob": {"type": "contact"}}"#, "v2")
            .unwrap();
        assert_eq!(f.engine.process(Some(entry.as_str())).applied, 1);
        assert!(!has(&f.store, "alice"));
        assert!(has(&f.store, "bob"));
    }

    #[test]
    fn test_rechunk_clears_directory() {
        let mut f = fixture();
        f.queue
            .deliver("account-3/0", r#"{"old": {"type": "contact"}}"#, "v1")
            .unwrap();
        f.engine.process(None);
        assert_eq!(f.engine.current_sequence().unwrap(), Some(3));

        let entry = f
            .queue
            .deliver("account-5/0", r#"{"new": {"type": "contact"}}"#, "v1")
            .unwrap();
        let outcome = f.engine.process_message(&entry).unwrap();
        assert!(matches!(outcome, MessageOutcome::Applied(_)));

        assert_eq!(f.engine.current_sequence().unwrap(), Some(5));
        assert_eq!(
            f.engine.sequence_state(),
            SequenceState::Rechunking {
                from: Some(3),
                to: 5
            }
        );
        assert!(!has(&f.store, "old"));
        assert!(has(&f.store, "new"));

        // The next full pass completes the rebuild
        f.engine.process(None);
        assert_eq!(f.engine.sequence_state(), SequenceState::Stable(5));
    }

    #[test]
    fn test_new_engine_starts_from_stored_sequence() {
        let mut f = fixture();
        f.queue
            .deliver("account-2/0", r#"{"alice": {"type": "contact"}}"#, "v1")
            .unwrap();
        f.engine.process(None);

        let engine = GabEngine::new(
            "example.com",
            GabConfig::default(),
            f.store.clone(),
            f.queue.clone(),
        );
        assert_eq!(engine.sequence_state(), SequenceState::Stable(2));
    }

    #[test]
    fn test_huge_chunk_count_is_not_a_chunk() {
        let mut f = fixture();
        f.queue
            .deliver("account-2/0", r#"{"alice": {"type": "contact"}}"#, "v1")
            .unwrap();
        f.engine.process(None);

        let entry = f.queue.deliver("account-4294967295/0", "{}", "v2").unwrap();
        let summary = f.engine.process(None);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.up_to_date, 1);
        assert_eq!(summary.ignored, 1);

        let outcome = f.engine.process_message(&entry).unwrap();
        assert_eq!(outcome, MessageOutcome::Ignored(Decision::NotAChunk));
        assert_eq!(f.engine.current_sequence().unwrap(), Some(2));
        assert!(has(&f.store, "alice"));
    }

    #[test]
    fn test_chunk_count_limit_is_configurable() {
        let f = fixture_with(GabConfig {
            max_chunks: 4,
            ..GabConfig::default()
        });
        assert_eq!(f.engine.chunk_index("account-4/3"), Some(ChunkIndex::new(4, 3)));
        assert_eq!(f.engine.chunk_index("account-5/0"), None);
    }

    #[test]
    fn test_invalid_body_is_retried() {
        let mut f = fixture();
        let entry = f.queue.deliver("account-1/0", "{oops", "v1").unwrap();

        assert!(f.engine.process_message(&entry).is_err());
        assert_eq!(f.engine.process(None).failed, 1);
        assert!(f.queue.property(&entry, PROP_APPLIED_AT).unwrap().is_none());

        f.queue
            .deliver("account-1/0", r#"{"alice": {"type": "contact"}}"#, "v2")
            .unwrap();
        assert_eq!(f.engine.process(None).applied, 1);
    }

    #[test]
    fn test_processing_switch() {
        let mut f = fixture_with(GabConfig {
            process_messages: false,
            ..GabConfig::default()
        });
        let entry = f
            .queue
            .deliver("account-1/0", r#"{"alice": {"type": "contact"}}"#, "v1")
            .unwrap();

        assert_eq!(f.engine.process_message(&entry).unwrap(), MessageOutcome::Disabled);
        f.engine.process(None);
        assert_eq!(f.store.count().unwrap(), 0);
    }

    #[test]
    fn test_full_resync_rebuilds() {
        let mut f = fixture();
        f.queue
            .deliver("account-1/0", r#"{"alice": {"type": "contact"}}"#, "v1")
            .unwrap();
        f.engine.process(None);
        let before = f
            .store
            .search_one(PROP_DIRECTORY_ID, &PropertyValue::from("alice"))
            .unwrap();

        let summary = f.engine.full_resync();
        assert_eq!(summary.applied, 1);
        let after = f
            .store
            .search_one(PROP_DIRECTORY_ID, &PropertyValue::from("alice"))
            .unwrap();
        assert!(after.is_some());
        assert_ne!(before, after);
    }

    #[test]
    fn test_remove_drops_everything() {
        let mut f = fixture();
        f.queue
            .deliver("account-1/0", r#"{"alice": {"type": "contact"}}"#, "v1")
            .unwrap();
        f.engine.process(None);

        assert_eq!(f.engine.remove().unwrap(), 1);
        assert_eq!(f.store.count().unwrap(), 0);
        assert_eq!(f.engine.current_sequence().unwrap(), None);
    }

    #[test]
    fn test_own_writes_are_not_user_edits() {
        let f = fixture();
        assert_eq!(f.engine.classify_change(), ChangeDisposition::Reject);

        let _guard = f.engine.tracker().begin();
        assert_eq!(f.engine.classify_change(), ChangeDisposition::Ignore);
    }

    #[test]
    fn test_validate_entry_id() {
        assert!(validate_entry_id("abc").is_ok());
        assert!(validate_entry_id("  ").is_err());
    }
}
