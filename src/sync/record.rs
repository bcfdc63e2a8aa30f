//! Typed directory entries parsed from chunk payloads
//!
//! A chunk body is a JSON object mapping directory ids to entry objects. Each
//! entry is converted once into a [`DirectoryEntryRecord`], so the rest of the
//! engine never probes raw JSON.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::collections::BTreeMap;
use tracing::warn;

use crate::types::error::{GabError, Result};

/// Field holding the base64 encoded contact photo
pub const FIELD_PHOTO: &str = "thumbnailPhoto";
pub const FIELD_MEMBERS: &str = "members";
pub const FIELD_MEMBER_OF: &str = "memberOf";

/// Kind of directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Contact,
    Group,
    Equipment,
    Room,
}

impl EntryType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "contact" => Some(Self::Contact),
            "group" => Some(Self::Group),
            "equipment" => Some(Self::Equipment),
            "room" => Some(Self::Room),
            _ => None,
        }
    }
}

/// Value of an entry field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Text(String),
    List(Vec<String>),
    Binary(Vec<u8>),
}

/// One entry of a chunk payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntryRecord {
    pub id: String,
    pub entry_type: EntryType,
    pub fields: BTreeMap<String, Value>,
}

impl DirectoryEntryRecord {
    /// Build a record from one JSON entry object
    pub fn from_json(id: &str, entry: &serde_json::Value) -> Result<Self> {
        let object = entry
            .as_object()
            .ok_or_else(|| GabError::Parse(format!("Entry {} is not an object", id)))?;

        let entry_type = match object.get("type") {
            Some(serde_json::Value::String(s)) => EntryType::from_str(s)
                .ok_or_else(|| GabError::Parse(format!("Unknown entry type: {}", s)))?,
            Some(other) => {
                return Err(GabError::Parse(format!("Unknown entry type: {}", other)));
            }
            None => return Err(GabError::Parse(format!("Entry {} has no type", id))),
        };

        let mut fields = BTreeMap::new();
        for (name, value) in object {
            if name == "type" {
                continue;
            }
            if let Some(value) = convert_field(id, name, value) {
                fields.insert(name.clone(), value);
            }
        }

        Ok(Self {
            id: id.to_string(),
            entry_type,
            fields,
        })
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(Value::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn list(&self, name: &str) -> Option<&[String]> {
        match self.fields.get(name) {
            Some(Value::List(items)) => Some(items),
            _ => None,
        }
    }

    pub fn binary(&self, name: &str) -> Option<&[u8]> {
        match self.fields.get(name) {
            Some(Value::Binary(data)) => Some(data),
            _ => None,
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn members(&self) -> &[String] {
        self.list(FIELD_MEMBERS).unwrap_or(&[])
    }

    pub fn member_of(&self) -> &[String] {
        self.list(FIELD_MEMBER_OF).unwrap_or(&[])
    }
}

fn convert_field(id: &str, name: &str, value: &serde_json::Value) -> Option<Value> {
    use serde_json::Value as Json;

    if name == FIELD_PHOTO {
        let encoded = match value {
            Json::String(s) => s,
            Json::Null => return None,
            _ => {
                warn!("Ignoring non-string photo of {}", id);
                return None;
            }
        };
        return match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
            Ok(data) if !data.is_empty() => Some(Value::Binary(data)),
            Ok(_) => None,
            Err(e) => {
                warn!("Ignoring undecodable photo of {}: {}", id, e);
                None
            }
        };
    }

    match value {
        Json::Null => None,
        Json::String(s) => Some(Value::Text(s.clone())),
        Json::Number(n) => Some(Value::Text(n.to_string())),
        Json::Bool(b) => Some(Value::Text(b.to_string())),
        Json::Array(items) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Json::String(s) => list.push(s.clone()),
                    other => warn!("Invalid {} element of {}: {}", name, id, other),
                }
            }
            Some(Value::List(list))
        }
        Json::Object(_) => {
            warn!("Ignoring nested object field {} of {}", name, id);
            None
        }
    }
}

/// Parse a chunk body into its id → entry map
///
/// Only the top-level shape is validated here; entries are converted one by
/// one by the processor so that a bad entry does not reject its siblings.
pub fn parse_payload(body: &str) -> Result<Map<String, serde_json::Value>> {
    match serde_json::from_str::<serde_json::Value>(body)? {
        serde_json::Value::Object(entries) => Ok(entries),
        other => Err(GabError::Parse(format!(
            "Chunk body is not an object but {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
