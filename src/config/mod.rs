use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::info;

use crate::types::error::GabError;

/// Global configuration instance
static CONFIG: OnceCell<RwLock<GabConfig>> = OnceCell::new();

/// Synchronization configuration
///
/// Every switch defaults to the production behaviour; the booleans exist so a
/// misbehaving stage can be turned off without rebuilding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GabConfig {
    /// Database file holding the mirrored directories and the chunk queue
    pub db_path: PathBuf,

    /// Process chunk messages at all
    pub process_messages: bool,

    /// Delete the entities a chunk created before re-applying that chunk
    pub delete_existing_on_reprocess: bool,

    /// Create contacts (and room/equipment resources) from chunk entries
    pub create_contacts: bool,

    /// Create groups from chunk entries
    pub create_groups: bool,

    /// Parse `members` / `memberOf` lists
    pub group_members: bool,

    /// Actually add resolved members to groups
    pub group_members_add: bool,

    /// Allow groups to be members of other groups
    pub nested_groups: bool,

    /// Upper bound for the cycle check walk over nested groups
    pub max_nesting_depth: usize,

    /// Represent groups that have an SMTP address as contacts
    pub smtp_groups_as_contacts: bool,

    /// Copy `primaryFaxNumber` into the business fax field
    pub sync_fax_numbers: bool,

    /// Delete all entities on re-chunk / full resync. When disabled only the
    /// chunk state is dropped.
    pub clear_contacts: bool,

    /// Reject external modifications of mirrored entities
    pub suppress_modifications: bool,

    /// Cache directory-id lookups during a pass
    pub item_cache_enabled: bool,

    /// Number of newest queue messages scanned to find the current sequence
    pub newest_max_check: usize,

    /// Largest chunk count accepted from a subject. Chunks of larger
    /// sequences are not chunks.
    pub max_chunks: u32,

    /// Remove stored directories that no registered account uses
    pub check_unused: bool,

    /// Queue monitoring
    pub monitor: MonitorConfig,
}

/// Polling configuration for the chunk queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Poll interval in seconds
    pub poll_interval_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 60,
        }
    }
}

impl Default for GabConfig {
    fn default() -> Self {
        // In dev mode, keep the database next to the project for easier debugging
        let db_path = if cfg!(debug_assertions) {
            PathBuf::from("../.sqlite/gab_sync.db")
        } else {
            dirs::data_local_dir()
                .map(|dir| dir.join("gab-sync").join("gab_sync.db"))
                .unwrap_or_else(|| PathBuf::from("gab_sync.db"))
        };

        Self {
            db_path,
            process_messages: true,
            delete_existing_on_reprocess: true,
            create_contacts: true,
            create_groups: true,
            group_members: true,
            group_members_add: true,
            nested_groups: true,
            max_nesting_depth: 32,
            smtp_groups_as_contacts: false,
            sync_fax_numbers: true,
            clear_contacts: true,
            suppress_modifications: true,
            item_cache_enabled: true,
            newest_max_check: 5,
            max_chunks: 10_000,
            check_unused: true,
            monitor: MonitorConfig::default(),
        }
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // XDG config path
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("gab-sync").join("config.toml"));
    }

    // Home directory fallback
    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".config").join("gab-sync").join("config.toml"));
        paths.push(home_dir.join(".gab-sync.toml"));
    }

    paths
}

/// Load configuration from the first default path that exists
pub fn load_config() -> Result<GabConfig, GabError> {
    for path in default_config_paths() {
        if path.exists() {
            info!("Found config at: {:?}", path);
            return load_config_from_path(&path);
        }
    }

    info!("No config file found, using defaults");
    Ok(GabConfig::default())
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<GabConfig, GabError> {
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| GabError::Config(format!("Failed to read config: {}", e)))?;

    parse_config(&content)
}

/// Parse a TOML configuration document
pub fn parse_config(content: &str) -> Result<GabConfig, GabError> {
    let config: GabConfig = toml::from_str(content)
        .map_err(|e| GabError::Config(format!("Failed to parse config: {}", e)))?;

    if config.newest_max_check == 0 {
        return Err(GabError::Config(
            "newest_max_check must be at least 1".to_string(),
        ));
    }
    if config.max_chunks == 0 {
        return Err(GabError::Config("max_chunks must be at least 1".to_string()));
    }

    Ok(config)
}

/// Initialize the global configuration from default paths
pub fn init_config() -> Result<(), GabError> {
    let config = load_config()?;
    set_config(config)
}

/// Set the global configuration
pub fn set_config(config: GabConfig) -> Result<(), GabError> {
    match CONFIG.get() {
        Some(lock) => {
            let mut guard = lock
                .write()
                .map_err(|e| GabError::Config(format!("Failed to lock config: {}", e)))?;
            *guard = config;
        }
        None => {
            CONFIG.set(RwLock::new(config)).ok();
        }
    }
    Ok(())
}

/// Get a copy of the global configuration, defaults if never initialized
pub fn get_config() -> Result<GabConfig, GabError> {
    match CONFIG.get() {
        Some(lock) => lock
            .read()
            .map(|guard| guard.clone())
            .map_err(|e| GabError::Config(format!("Failed to lock config: {}", e))),
        None => Ok(GabConfig::default()),
    }
}

/// Check if configuration is initialized
pub fn is_initialized() -> bool {
    CONFIG.get().is_some()
}
