use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

use super::schema;
use crate::types::error::GabError;

// Shorthand so callers don't have to write Pool<SqliteConnectionManager> everywhere.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Open (or create) the database file and make sure the schema exists
pub fn create_pool(db_path: &Path) -> Result<DbPool, GabError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Foreign keys are a per-connection setting
    let manager = SqliteConnectionManager::file(db_path)
        .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));

    let pool = Pool::builder().max_size(8).build(manager)?;

    let conn = pool.get()?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -8000;
         PRAGMA temp_store = MEMORY;",
    )?;
    schema::initialize_schema(&conn)?;

    Ok(pool)
}

/// Create an in-memory database (for testing)
///
/// Every in-memory connection is its own database, so the pool holds exactly
/// one connection. Callers must not hold a connection while asking for another.
pub fn create_memory_pool() -> Result<DbPool, GabError> {
    let manager = SqliteConnectionManager::memory()
        .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));

    // Recycling the connection would drop the database with it
    let pool = Pool::builder()
        .max_size(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .build(manager)?;

    let conn = pool.get()?;
    schema::initialize_schema(&conn)?;

    Ok(pool)
}
