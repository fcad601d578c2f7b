use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for a single [`crate::Chunk`], derived by [`crate::fingerprint::chunk_id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub String);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ChunkId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChunkId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Name of a [`crate::Collection`]. Collections are looked up by this name across
/// the vector store, lexical index, and dedup registry, so it is kept newtype'd to
/// avoid accidentally passing a source path or a chunk id where a collection is expected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionName(pub String);

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CollectionName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CollectionName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
