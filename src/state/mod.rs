//! Application state management
//!
//! State types are host-agnostic and focus on thread-safe management of the
//! per-directory engines.

mod sync_manager;

pub use sync_manager::SyncManager;
