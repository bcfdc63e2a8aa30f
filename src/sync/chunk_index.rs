use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::error::GabError;

const SUBJECT_PREFIX: &str = "account-";

/// Position of a chunk within the current chunking of a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkIndex {
    pub number_of_chunks: u32,
    pub chunk: u32,
}

impl ChunkIndex {
    pub fn new(number_of_chunks: u32, chunk: u32) -> Self {
        Self {
            number_of_chunks,
            chunk,
        }
    }

    /// Parse a queue message subject of the form `account-<numberOfChunks>/<chunk>`.
    ///
    /// Anything else is not a chunk and yields `None`.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix(SUBJECT_PREFIX)?;
        let (count, chunk) = rest.split_once('/')?;
        Some(Self {
            number_of_chunks: parse_digits(count)?,
            chunk: parse_digits(chunk)?,
        })
    }

    /// Whether the chunk number addresses a slot of its own sequence
    pub fn is_within_sequence(&self) -> bool {
        self.chunk < self.number_of_chunks
    }
}

// u32::from_str also accepts a leading '+', the subject format does not
fn parse_digits(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl fmt::Display for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", SUBJECT_PREFIX, self.number_of_chunks, self.chunk)
    }
}

impl FromStr for ChunkIndex {
    type Err = GabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| GabError::Parse(format!("Not a chunk subject: {}", s)))
    }
}
