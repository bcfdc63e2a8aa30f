//! Global address book synchronization
//!
//! Mirrors a remote organizational directory into a local store. The
//! directory arrives as independently delivered chunk messages in a queue;
//! [`sync::GabEngine`] applies them idempotently, survives re-chunking and
//! resolves group memberships that reference entries of chunks not yet seen.
//!
//! A host typically:
//!
//! 1. loads the configuration ([`config::load_config`]) and installs logging
//!    ([`services::logger::init`]),
//! 2. opens a [`state::SyncManager`] and registers one directory per domain,
//! 3. spawns a [`services::QueueMonitor`] and [`services::worker::run`] on the
//!    monitor's channel, pushing `MessageChanged` notifications whenever the
//!    delivering channel stores a chunk.

pub mod adapters;
pub mod config;
pub mod services;
pub mod state;
pub mod store;
pub mod sync;
pub mod types;

pub use types::error::{GabError, Result};
