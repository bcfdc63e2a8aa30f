pub mod directory;
pub mod pool;
pub mod queue;
pub mod schema;

// Re-export so callers can write `use crate::adapters::sqlite::DbPool`
pub use directory::{known_directories, remove_directory, SqliteDirectoryStore};
pub use pool::{create_memory_pool, create_pool, DbPool};
pub use queue::SqliteMessageQueue;
