use crate::cascade::contract::{FileChunk, MAX_CHUNK_LINES};
use std::collections::BTreeMap;

/// Upper bound on chunk indices; a model stuck emitting `has_more` forever
/// must not spin the loop indefinitely.
pub const CHUNK_INDEX_GUARD: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("chunk assembly failed for `{path}`: {reason}")]
pub struct AssemblyError {
    pub path: String,
    pub reason: String,
}

impl AssemblyError {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// Collects the chunks of one file and stitches them back together.
/// Invariants: `chunk_count >= 1`, indices within range, at most 500 lines
/// per chunk, `has_more` consistent with position, one consistent
/// `chunk_count` across chunks, no duplicates, no gaps at completion.
#[derive(Debug)]
pub struct ChunkAssembler {
    path: String,
    chunk_count: Option<u64>,
    received: BTreeMap<u64, String>,
}

impl ChunkAssembler {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            chunk_count: None,
            received: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Accept one parsed chunk. Returns the index the next request must ask
    /// for, or `None` when the file is complete.
    pub fn accept(&mut self, chunk: &FileChunk) -> Result<Option<u64>, AssemblyError> {
        if chunk.path != self.path {
            return Err(AssemblyError::new(
                &self.path,
                format!("chunk carries path `{}`", chunk.path),
            ));
        }
        let c = chunk.chunking;
        if c.chunk_count < 1 {
            return Err(AssemblyError::new(&self.path, "chunk_count must be >= 1"));
        }
        if c.chunk_index >= c.chunk_count {
            return Err(AssemblyError::new(
                &self.path,
                format!(
                    "chunk_index {} out of range for chunk_count {}",
                    c.chunk_index, c.chunk_count
                ),
            ));
        }
        if c.chunk_index > CHUNK_INDEX_GUARD {
            return Err(AssemblyError::new(&self.path, "chunk index guard exceeded"));
        }
        let line_count = chunk.content.lines().count() as u64;
        if line_count > MAX_CHUNK_LINES {
            return Err(AssemblyError::new(
                &self.path,
                format!(
                    "chunk {} carries {line_count} lines, limit is {MAX_CHUNK_LINES}",
                    c.chunk_index
                ),
            ));
        }
        match self.chunk_count {
            Some(expected) if expected != c.chunk_count => {
                return Err(AssemblyError::new(
                    &self.path,
                    format!("contradictory chunk_count: {expected} then {}", c.chunk_count),
                ));
            }
            None => self.chunk_count = Some(c.chunk_count),
            _ => {}
        }

        let expected_more = c.chunk_index + 1 < c.chunk_count;
        if c.has_more != expected_more {
            return Err(AssemblyError::new(
                &self.path,
                format!(
                    "has_more={} contradicts chunk {}/{}",
                    c.has_more,
                    c.chunk_index + 1,
                    c.chunk_count
                ),
            ));
        }

        if self.received.contains_key(&c.chunk_index) {
            return Err(AssemblyError::new(
                &self.path,
                format!("duplicate chunk_index {}", c.chunk_index),
            ));
        }
        self.received.insert(c.chunk_index, chunk.content.clone());

        if !c.has_more {
            return Ok(None);
        }
        let Some(next) = c.next_chunk_index else {
            return Err(AssemblyError::new(
                &self.path,
                "has_more without next_chunk_index",
            ));
        };
        if next != c.chunk_index + 1 {
            return Err(AssemblyError::new(
                &self.path,
                format!(
                    "next_chunk_index {} does not follow chunk_index {}",
                    next, c.chunk_index
                ),
            ));
        }
        Ok(Some(next))
    }

    pub fn is_complete(&self) -> bool {
        match self.chunk_count {
            Some(count) => self.received.len() as u64 == count,
            None => false,
        }
    }

    /// Byte-for-byte concatenation in index order.
    pub fn into_content(self) -> Result<String, AssemblyError> {
        let count = self
            .chunk_count
            .ok_or_else(|| AssemblyError::new(&self.path, "no chunks received"))?;
        for index in 0..count {
            if !self.received.contains_key(&index) {
                return Err(AssemblyError::new(
                    &self.path,
                    format!("missing chunk_index {index} of {count}"),
                ));
            }
        }
        Ok(self.received.into_values().collect())
    }
}
