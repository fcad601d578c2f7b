//! SQLite-backed primary chunk store: the enumerable system of record behind the
//! vector/lexical index adapters, and the durable home of the dedup registry and
//! per-collection metadata (§4.7, §4.8, Open Question decision #2 in DESIGN.md).

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use chunk_model::{Chunk, ChunkId, CollectionInfo, CollectionName};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::{ChunkStoreRead, FilterClause, FilterOp, StoreError};

pub struct SqliteRepo {
    conn: Mutex<Connection>,
}

impl SqliteRepo {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT NOT NULL,
                collection TEXT NOT NULL,
                source TEXT NOT NULL,
                doc_title TEXT NOT NULL,
                section_title TEXT NOT NULL,
                section_level INTEGER NOT NULL,
                section_index INTEGER NOT NULL,
                page INTEGER,
                chunk_index_within_section INTEGER NOT NULL,
                text TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                meta_json TEXT NOT NULL,
                schema_version INTEGER NOT NULL,
                PRIMARY KEY (collection, chunk_id)
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(collection, source);
            CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunks(collection, content_hash);

            CREATE TABLE IF NOT EXISTS dedup_registry (
                collection TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                chunk_id TEXT NOT NULL,
                first_seen_at TEXT NOT NULL,
                PRIMARY KEY (collection, content_hash)
            );

            CREATE TABLE IF NOT EXISTS dedup_stats (
                collection TEXT PRIMARY KEY,
                total_seen_ever INTEGER NOT NULL DEFAULT 0,
                duplicates INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                migrated_from TEXT
            );

            CREATE TABLE IF NOT EXISTS embeddings (
                collection TEXT NOT NULL,
                chunk_id TEXT NOT NULL,
                dim INTEGER NOT NULL,
                vector_blob BLOB NOT NULL,
                PRIMARY KEY (collection, chunk_id)
            );
            ",
        )?;
        Ok(())
    }

    pub fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (chunk_id, collection, source, doc_title, section_title,
                    section_level, section_index, page, chunk_index_within_section, text,
                    token_count, content_hash, created_at, meta_json, schema_version)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
                 ON CONFLICT(collection, chunk_id) DO UPDATE SET
                    source=excluded.source, doc_title=excluded.doc_title,
                    section_title=excluded.section_title, section_level=excluded.section_level,
                    section_index=excluded.section_index, page=excluded.page,
                    chunk_index_within_section=excluded.chunk_index_within_section,
                    text=excluded.text, token_count=excluded.token_count,
                    content_hash=excluded.content_hash, created_at=excluded.created_at,
                    meta_json=excluded.meta_json, schema_version=excluded.schema_version",
            )?;
            for c in chunks {
                let meta_json = serde_json::to_string(&c.meta)?;
                stmt.execute(params![
                    c.chunk_id.0,
                    c.collection.0,
                    c.source,
                    c.doc_title,
                    c.section_title,
                    c.section_level,
                    c.section_index,
                    c.page,
                    c.chunk_index_within_section,
                    c.text,
                    c.token_count as i64,
                    c.content_hash,
                    c.created_at.to_rfc3339(),
                    meta_json,
                    c.schema_version,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_by_ids(&self, collection: &CollectionName, ids: &[ChunkId]) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let mut deleted = 0;
        let mut stmt = conn.prepare("DELETE FROM chunks WHERE collection = ?1 AND chunk_id = ?2")?;
        for id in ids {
            deleted += stmt.execute(params![collection.0, id.0])?;
        }
        Ok(deleted)
    }

    pub fn get_chunk(&self, collection: &CollectionName, id: &ChunkId) -> Result<Option<Chunk>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM chunks WHERE collection = ?1 AND chunk_id = ?2")?;
        let row = stmt
            .query_row(params![collection.0, id.0], row_to_chunk)
            .optional()?;
        Ok(row)
    }

    pub fn list_ids_by_source(&self, collection: &CollectionName, source: &str) -> Result<Vec<ChunkId>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT chunk_id FROM chunks WHERE collection = ?1 AND source = ?2")?;
        let rows = stmt
            .query_map(params![collection.0, source], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(ChunkId).collect())
    }

    pub fn list_all_chunks(&self, collection: &CollectionName) -> Result<Vec<Chunk>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM chunks WHERE collection = ?1")?;
        let rows = stmt.query_map(params![collection.0], row_to_chunk)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn dedup_lookup(&self, collection: &CollectionName, content_hash: &str) -> Result<Option<ChunkId>, StoreError> {
        let conn = self.conn.lock();
        let id: Option<String> = conn
            .query_row(
                "SELECT chunk_id FROM dedup_registry WHERE collection = ?1 AND content_hash = ?2",
                params![collection.0, content_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(ChunkId))
    }

    pub fn dedup_commit(&self, collection: &CollectionName, content_hash: &str, chunk_id: &ChunkId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO dedup_registry (collection, content_hash, chunk_id, first_seen_at)
             VALUES (?1,?2,?3,?4)
             ON CONFLICT(collection, content_hash) DO UPDATE SET chunk_id=excluded.chunk_id",
            params![collection.0, content_hash, chunk_id.0, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn dedup_forget(&self, collection: &CollectionName, content_hash: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM dedup_registry WHERE collection = ?1 AND content_hash = ?2",
            params![collection.0, content_hash],
        )?;
        Ok(())
    }

    /// Rehydrate the full `content_hash -> chunk_id` map for a collection, used to
    /// rebuild an in-memory dedup index on cold start (§4.7).
    pub fn dedup_rehydrate(&self, collection: &CollectionName) -> Result<Vec<(String, ChunkId)>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT content_hash, chunk_id FROM dedup_registry WHERE collection = ?1")?;
        let rows = stmt
            .query_map(params![collection.0], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|(h, id)| (h, ChunkId(id))).collect())
    }

    pub fn record_dedup_stats(&self, collection: &CollectionName, seen_delta: u64, duplicate_delta: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO dedup_stats (collection, total_seen_ever, duplicates) VALUES (?1, ?2, ?3)
             ON CONFLICT(collection) DO UPDATE SET
                total_seen_ever = total_seen_ever + excluded.total_seen_ever,
                duplicates = duplicates + excluded.duplicates",
            params![collection.0, seen_delta as i64, duplicate_delta as i64],
        )?;
        Ok(())
    }

    /// Returns `(total_seen_ever, duplicates)` for the duplicate-rate ratio (Open
    /// Question decision #3).
    pub fn dedup_stats(&self, collection: &CollectionName) -> Result<(u64, u64), StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT total_seen_ever, duplicates FROM dedup_stats WHERE collection = ?1",
                params![collection.0],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
            )
            .optional()?;
        Ok(row.unwrap_or((0, 0)))
    }

    pub fn upsert_collection_info(&self, info: &CollectionInfo) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO collections (name, model_id, dimension, created_at, chunk_count, migrated_from)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(name) DO UPDATE SET
                model_id=excluded.model_id, dimension=excluded.dimension,
                chunk_count=excluded.chunk_count, migrated_from=excluded.migrated_from",
            params![
                info.name.0,
                info.model_id,
                info.dimension as i64,
                info.created_at.to_rfc3339(),
                info.chunk_count as i64,
                info.migrated_from.as_ref().map(|c| c.0.clone()),
            ],
        )?;
        Ok(())
    }

    pub fn collection_info(&self, name: &CollectionName) -> Result<Option<CollectionInfo>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT name, model_id, dimension, created_at, chunk_count, migrated_from FROM collections WHERE name = ?1",
                params![name.0],
                |row| {
                    let created_at: String = row.get(3)?;
                    let migrated_from: Option<String> = row.get(5)?;
                    Ok(CollectionInfo {
                        name: CollectionName(row.get::<_, String>(0)?),
                        model_id: row.get(1)?,
                        dimension: row.get::<_, i64>(2)? as usize,
                        created_at: parse_rfc3339(&created_at),
                        chunk_count: row.get::<_, i64>(4)? as u64,
                        migrated_from: migrated_from.map(CollectionName),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn counts(&self, collection: &CollectionName) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE collection = ?1",
            params![collection.0],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Durable home for embedding vectors (§6's "Vector Store native format"):
    /// `hnsw_rs` has no on-disk format of its own, so the primary store is where
    /// embeddings survive a restart; [`Indexer`](crate::orchestrator::Indexer)
    /// replays these rows back into the in-memory HNSW sidecar on cold start.
    pub fn upsert_embeddings(&self, collection: &CollectionName, items: &[(ChunkId, Vec<f32>)]) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "INSERT INTO embeddings (collection, chunk_id, dim, vector_blob) VALUES (?1,?2,?3,?4)
             ON CONFLICT(collection, chunk_id) DO UPDATE SET dim=excluded.dim, vector_blob=excluded.vector_blob",
        )?;
        for (id, vector) in items {
            stmt.execute(params![collection.0, id.0, vector.len() as i64, vector_to_blob(vector)])?;
        }
        Ok(())
    }

    pub fn delete_embeddings(&self, collection: &CollectionName, ids: &[ChunkId]) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("DELETE FROM embeddings WHERE collection = ?1 AND chunk_id = ?2")?;
        for id in ids {
            stmt.execute(params![collection.0, id.0])?;
        }
        Ok(())
    }

    /// Rehydrate every persisted embedding for `collection`, used to rebuild the
    /// vector index adapter on cold start (§4.7, §6).
    pub fn list_all_embeddings(&self, collection: &CollectionName) -> Result<Vec<(ChunkId, Vec<f32>)>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT chunk_id, vector_blob FROM embeddings WHERE collection = ?1")?;
        let rows = stmt
            .query_map(params![collection.0], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|(id, blob)| (ChunkId(id), blob_to_vector(&blob))).collect())
    }

    /// Every collection the primary store has ever seen, used to drive index
    /// rehydration across all of them at startup rather than only the ones a
    /// caller happens to touch first. Union of `chunks` and `collections` so a
    /// collection with rows but no recorded [`CollectionInfo`] (e.g. ingested
    /// through [`crate::orchestrator::Indexer`] directly, bypassing the service
    /// layer's bookkeeping) is still picked up.
    pub fn list_collection_names(&self) -> Result<Vec<CollectionName>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT collection FROM chunks UNION SELECT name FROM collections")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(CollectionName).collect())
    }
}

/// `Vec<f32>` <-> little-endian byte blob. Plain and inspectable over pulling in a
/// serialization crate for four bytes per element.
fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])).collect()
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    let created_at: String = row.get("created_at")?;
    let meta_json: String = row.get("meta_json")?;
    let meta = serde_json::from_str(&meta_json).unwrap_or_default();
    Ok(Chunk {
        schema_version: row.get("schema_version")?,
        chunk_id: ChunkId(row.get("chunk_id")?),
        collection: CollectionName(row.get("collection")?),
        source: row.get("source")?,
        doc_title: row.get("doc_title")?,
        section_title: row.get("section_title")?,
        section_level: row.get("section_level")?,
        section_index: row.get("section_index")?,
        page: row.get("page")?,
        chunk_index_within_section: row.get("chunk_index_within_section")?,
        text: row.get("text")?,
        token_count: row.get::<_, i64>("token_count")? as usize,
        content_hash: row.get("content_hash")?,
        created_at: parse_rfc3339(&created_at),
        meta,
    })
}

impl ChunkStoreRead for SqliteRepo {
    fn get_chunks(&self, collection: &CollectionName, ids: &[ChunkId]) -> Result<Vec<Chunk>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(c) = self.get_chunk(collection, id)? {
                out.push(c);
            }
        }
        Ok(out)
    }

    fn list_ids_by_filter(&self, collection: &CollectionName, filters: &[FilterClause], limit: usize) -> Result<Vec<ChunkId>, StoreError> {
        let conn = self.conn.lock();
        let mut sql = String::from("SELECT chunk_id FROM chunks WHERE collection = ?");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(collection.0.clone())];

        for clause in filters {
            match &clause.op {
                FilterOp::SourceEq(s) => {
                    sql.push_str(" AND source = ?");
                    args.push(Box::new(s.clone()));
                }
                FilterOp::SourceIn(list) => {
                    if list.is_empty() {
                        sql.push_str(" AND 0");
                    } else {
                        let placeholders = vec!["?"; list.len()].join(",");
                        sql.push_str(&format!(" AND source IN ({placeholders})"));
                        for s in list {
                            args.push(Box::new(s.clone()));
                        }
                    }
                }
                FilterOp::SourcePrefix(p) => {
                    sql.push_str(" AND source LIKE ?");
                    args.push(Box::new(format!("{}%", p.replace('%', "\\%"))));
                }
                FilterOp::MetaEq(key, value) => {
                    sql.push_str(" AND json_extract(meta_json, ?) = ?");
                    args.push(Box::new(format!("$.{key}")));
                    args.push(Box::new(value.clone()));
                }
                FilterOp::CreatedAtRange { start, end } => {
                    if let Some(start) = start {
                        sql.push_str(" AND created_at >= ?");
                        args.push(Box::new(start.to_rfc3339()));
                    }
                    if let Some(end) = end {
                        sql.push_str(" AND created_at <= ?");
                        args.push(Box::new(end.to_rfc3339()));
                    }
                }
            }
        }
        sql.push_str(" LIMIT ?");
        args.push(Box::new(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let params_slice: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(params_slice.as_slice(), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(ChunkId).collect())
    }
}
