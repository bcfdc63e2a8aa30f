//! Chunked directory synchronization
//!
//! The directory arrives as a sequence of chunk messages (`account-<n>/<c>`),
//! each carrying a JSON slice of the directory. The modules here track the
//! sequence, remember which version of every chunk was applied and turn chunk
//! entries into local contacts and groups.

pub mod chunk_index;
pub mod engine;
pub mod item_cache;
pub mod materializer;
pub mod membership;
pub mod processing;
pub mod processor;
pub mod record;
pub mod state_store;

pub use chunk_index::ChunkIndex;
pub use engine::{Decision, GabEngine, MessageOutcome, ProcessSummary, SequenceState};
pub use processing::{ChangeDisposition, ProcessingGuard, ProcessingTracker};
pub use processor::ApplyReport;
pub use record::{DirectoryEntryRecord, EntryType, Value};
