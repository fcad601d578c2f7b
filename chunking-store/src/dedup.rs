//! In-memory dedup index backed by [`crate::sqlite_repo::SqliteRepo`]'s
//! `dedup_registry` table (§4.7). Content hashes are looked up in memory on the hot
//! ingest path and committed durably so a process restart rehydrates the same state
//! rather than re-admitting everything as new.

use std::collections::HashMap;

use chrono::Utc;
use chunk_model::{ChunkId, CollectionName};
use parking_lot::RwLock;

use crate::{sqlite_repo::SqliteRepo, StoreError};

/// Outcome of classifying one incoming chunk's content hash against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    /// No chunk with this hash exists yet in the collection; admit it.
    New,
    /// A chunk with this hash already exists; the caller should skip indexing and
    /// may choose to merge metadata instead.
    Duplicate(ChunkId),
}

/// Per-collection content-hash registry, rehydrated from SQLite on construction.
pub struct Deduper {
    collection: CollectionName,
    index: RwLock<HashMap<String, ChunkId>>,
}

impl Deduper {
    /// Load the full `content_hash -> chunk_id` map for `collection` from the
    /// durable store. Cheap at typical collection sizes; revisit with a bounded LRU
    /// if a collection's hash count grows past memory budget (no such collection
    /// observed yet).
    pub fn rehydrate(repo: &SqliteRepo, collection: CollectionName) -> Result<Self, StoreError> {
        let pairs = repo.dedup_rehydrate(&collection)?;
        let index = pairs.into_iter().collect::<HashMap<_, _>>();
        Ok(Self { collection, index: RwLock::new(index) })
    }

    pub fn classify(&self, content_hash: &str) -> DedupOutcome {
        match self.index.read().get(content_hash) {
            Some(id) => DedupOutcome::Duplicate(id.clone()),
            None => DedupOutcome::New,
        }
    }

    /// Record a newly admitted chunk's hash, both in memory and durably. Call this
    /// after the chunk has actually been written to the primary store and indexes,
    /// not before, so a crash mid-ingest never leaves a hash registered for a chunk
    /// that doesn't exist.
    pub fn commit(&self, repo: &SqliteRepo, content_hash: &str, chunk_id: ChunkId) -> Result<(), StoreError> {
        repo.dedup_commit(&self.collection, content_hash, &chunk_id, Utc::now())?;
        self.index.write().insert(content_hash.to_string(), chunk_id);
        Ok(())
    }

    /// Remove a hash from the registry, e.g. when its chunk is deleted and should be
    /// re-admittable as new content in the future.
    pub fn forget(&self, repo: &SqliteRepo, content_hash: &str) -> Result<(), StoreError> {
        repo.dedup_forget(&self.collection, content_hash)?;
        self.index.write().remove(content_hash);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
