//! Collaborator interfaces consumed by the synchronization engine
//!
//! The engine never talks to SQLite directly. It reads chunk messages through
//! [`MessageQueue`] and writes contacts and groups through [`DirectoryStore`].
//! Both are implemented in `adapters::sqlite`; tests and hosts may provide
//! their own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::types::error::Result;

/// Property holding the directory id of a mirrored entity
pub const PROP_DIRECTORY_ID: &str = "directoryId";
/// Property holding the canonical chunk index of the chunk that wrote the entity
pub const PROP_OWNER_CHUNK: &str = "ownerChunk";

/// Opaque handle of a local entity, owned by whoever holds it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityHandle(String);

impl EntityHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a local entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Contact,
    Group,
}

impl EntityKind {
    /// Get the kind string for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contact => "contact",
            Self::Group => "group",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "contact" => Some(Self::Contact),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// Value of a named entity property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyValue {
    Int(i64),
    Text(String),
}

impl PropertyValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Text(_) => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

/// A contact or group in the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntity {
    pub handle: EntityHandle,
    pub kind: EntityKind,
    pub properties: BTreeMap<String, PropertyValue>,
    /// Member handles, in insertion order (groups only)
    pub members: Vec<EntityHandle>,
    pub body: Option<String>,
    pub picture: Option<Vec<u8>>,
}

impl LocalEntity {
    pub fn new(handle: EntityHandle, kind: EntityKind) -> Self {
        Self {
            handle,
            kind,
            properties: BTreeMap::new(),
            members: Vec::new(),
            body: None,
            picture: None,
        }
    }

    pub fn is_group(&self) -> bool {
        self.kind == EntityKind::Group
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(PropertyValue::as_text)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.properties.get(name).and_then(PropertyValue::as_int)
    }

    pub fn set(&mut self, name: &str, value: impl Into<PropertyValue>) {
        self.properties.insert(name.to_string(), value.into());
    }

    pub fn directory_id(&self) -> Option<&str> {
        self.text(PROP_DIRECTORY_ID)
    }

    /// Add a member handle. Returns false if it was already present.
    pub fn add_member(&mut self, member: &EntityHandle) -> bool {
        if self.members.contains(member) {
            return false;
        }
        self.members.push(member.clone());
        true
    }
}

/// A message from the chunk queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMessage {
    /// Queue-level identifier of the message
    pub entry_id: String,
    /// Encodes the chunk index (`account-<n>/<c>`)
    pub subject: String,
    /// JSON payload
    pub body: String,
    /// Opaque version token of the content
    pub location: String,
    /// Monotonic modification counter, higher is newer
    pub revision: i64,
    pub modified_at: DateTime<Utc>,
}

/// Queue of chunk messages for one directory
pub trait MessageQueue: Send + Sync {
    /// Entry ids of all messages in the queue, oldest first
    fn entry_ids(&self) -> Result<Vec<String>>;

    /// Up to `limit` messages, most recently modified first
    fn newest(&self, limit: usize) -> Result<Vec<ChunkMessage>>;

    fn get(&self, entry_id: &str) -> Result<Option<ChunkMessage>>;

    /// Read an application-defined property of a message
    fn property(&self, entry_id: &str, name: &str) -> Result<Option<String>>;

    /// Tag a message with an application-defined property
    fn set_property(&self, entry_id: &str, name: &str, value: &str) -> Result<()>;
}

/// Local store of mirrored entities for one directory
pub trait DirectoryStore: Send + Sync {
    /// Allocate a new, not yet saved, entity
    fn create(&self, kind: EntityKind) -> Result<LocalEntity>;

    fn load(&self, handle: &EntityHandle) -> Result<Option<LocalEntity>>;

    /// Insert or update the entity, including its properties and members
    fn save(&self, entity: &LocalEntity) -> Result<()>;

    fn delete(&self, handle: &EntityHandle) -> Result<()>;

    /// Cheap liveness probe for a handle held by a cache
    fn is_live(&self, handle: &EntityHandle) -> bool;

    /// Handles of all entities whose property `name` equals `value`
    fn search(&self, name: &str, value: &PropertyValue) -> Result<Vec<EntityHandle>>;

    fn search_one(&self, name: &str, value: &PropertyValue) -> Result<Option<EntityHandle>> {
        Ok(self.search(name, value)?.into_iter().next())
    }

    /// Attach the image file at `path` as the entity's picture
    fn attach_picture(&self, entity: &mut LocalEntity, path: &Path) -> Result<()>;

    /// Delete every entity of the directory. Returns the number removed.
    fn clear(&self) -> Result<usize>;

    fn count(&self) -> Result<usize>;

    /// Read a property of the hidden index entity
    fn index_property(&self, name: &str) -> Result<Option<PropertyValue>>;

    /// Write properties of the hidden index entity in one step, creating it if needed
    fn set_index_properties(&self, properties: &[(&str, PropertyValue)]) -> Result<()>;

    /// Delete the hidden index entity
    fn delete_index(&self) -> Result<()>;
}
