use std::sync::Arc;
use tracing::{debug, error};

use super::chunk_index::ChunkIndex;
use crate::store::{DirectoryStore, PropertyValue};
use crate::types::error::{GabError, Result};

/// Index property holding the number of chunks of the current sequence
pub const PROP_CURRENT_SEQUENCE: &str = "currentSequence";
/// Index property holding the `;`-joined version tokens of applied chunks
pub const PROP_LAST_PROCESSED: &str = "lastProcessed";

const SEPARATOR: char = ';';
const ESCAPE: char = '\\';

/// Persisted chunk count and per-chunk version tokens of one directory
///
/// Both live on the hidden index entity of the directory store. The token
/// vector is read lazily once per pass and written through on every update.
/// Sequences longer than `max_chunks` are never stored.
pub struct ChunkStateStore {
    store: Arc<dyn DirectoryStore>,
    max_chunks: u32,
    tokens: Option<Vec<Option<String>>>,
}

impl ChunkStateStore {
    pub fn new(store: Arc<dyn DirectoryStore>, max_chunks: u32) -> Self {
        Self {
            store,
            max_chunks,
            tokens: None,
        }
    }

    /// Persisted number of chunks, if a sequence is known
    pub fn number_of_chunks(&self) -> Result<Option<u32>> {
        let value = self.store.index_property(PROP_CURRENT_SEQUENCE)?;
        Ok(value
            .and_then(|v| v.as_int())
            .and_then(|n| u32::try_from(n).ok()))
    }

    /// Version token last applied for the chunk, `None` if never applied
    pub fn version_token(&mut self, index: ChunkIndex) -> Result<Option<String>> {
        let tokens = self.load_tokens()?;
        if !tokens.is_empty() && tokens.len() != index.number_of_chunks as usize {
            error!(
                "Stored token count {} does not match sequence of {}",
                tokens.len(),
                index
            );
        }
        Ok(tokens.get(index.chunk as usize).cloned().flatten())
    }

    /// Record that the chunk was applied with the given version token
    pub fn set_version_token(&mut self, index: ChunkIndex, token: &str) -> Result<()> {
        if !index.is_within_sequence() {
            error!("Chunk {} lies outside its own sequence, not recording it", index);
            return Ok(());
        }
        if index.number_of_chunks > self.max_chunks {
            error!(
                "Chunk {} exceeds the limit of {} chunks, not recording it",
                index, self.max_chunks
            );
            return Ok(());
        }

        let mut tokens = self.load_tokens()?.clone();
        if tokens.len() != index.number_of_chunks as usize {
            // A single unset token serializes to nothing
            if !tokens.is_empty() {
                error!(
                    "Repairing stored token count {} for sequence of {}",
                    tokens.len(),
                    index
                );
            }
            tokens.resize(index.number_of_chunks as usize, None);
        }
        tokens[index.chunk as usize] = Some(token.to_string()).filter(|t| !t.is_empty());

        self.store.set_index_properties(&[(
            PROP_LAST_PROCESSED,
            PropertyValue::Text(join_tokens(&tokens)),
        )])?;
        debug!("Recorded version token of {}", index);
        self.tokens = Some(tokens);
        Ok(())
    }

    /// Start a new sequence of `count` chunks with no chunk applied
    pub fn reset(&mut self, count: u32) -> Result<()> {
        if count > self.max_chunks {
            return Err(GabError::InvalidInput(format!(
                "Sequence of {} chunks exceeds the limit of {}",
                count, self.max_chunks
            )));
        }
        let tokens = vec![None; count as usize];
        self.store.set_index_properties(&[
            (PROP_CURRENT_SEQUENCE, PropertyValue::Int(i64::from(count))),
            (PROP_LAST_PROCESSED, PropertyValue::Text(join_tokens(&tokens))),
        ])?;
        self.tokens = Some(tokens);
        Ok(())
    }

    /// Forget the sequence entirely
    pub fn clear(&mut self) -> Result<()> {
        self.tokens = None;
        self.store.delete_index()
    }

    /// Drop the in-memory token vector so the next read hits the store
    pub fn invalidate(&mut self) {
        self.tokens = None;
    }

    fn load_tokens(&mut self) -> Result<&Vec<Option<String>>> {
        if self.tokens.is_none() {
            let stored = self.store.index_property(PROP_LAST_PROCESSED)?;
            let tokens = match stored.as_ref().and_then(|v| v.as_text()) {
                Some(joined) => split_tokens(joined),
                None => Vec::new(),
            };
            self.tokens = Some(tokens);
        }
        Ok(self.tokens.get_or_insert_with(Vec::new))
    }
}

/// Join tokens with `;`, escaping `\` and `;` inside tokens
pub fn join_tokens(tokens: &[Option<String>]) -> String {
    let mut joined = String::new();
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            joined.push(SEPARATOR);
        }
        if let Some(token) = token {
            for c in token.chars() {
                if c == SEPARATOR || c == ESCAPE {
                    joined.push(ESCAPE);
                }
                joined.push(c);
            }
        }
    }
    joined
}

/// Inverse of [`join_tokens`]. Empty segments are unset tokens.
pub fn split_tokens(joined: &str) -> Vec<Option<String>> {
    if joined.is_empty() {
        return Vec::new();
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = joined.chars();
    while let Some(c) = chars.next() {
        match c {
            ESCAPE => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            SEPARATOR => tokens.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    tokens.push(current);

    tokens
        .into_iter()
        .map(|t| if t.is_empty() { None } else { Some(t) })
        .collect()
}
