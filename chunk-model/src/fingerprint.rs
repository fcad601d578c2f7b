//! Deterministic content and query hashing.
//!
//! Mirrors the original `DeduplicationService.compute_content_hash`: normalize the
//! text, fold in a sorted, volatile-field-free metadata subset, and hash with
//! SHA-256. The same inputs must produce the same outputs across processes and
//! versions of this crate, or the dedup registry silently drifts.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::ids::CollectionName;

/// Lowercase, collapse whitespace, strip punctuation. Used only to compute
/// `content_hash` — never for the text actually shown to a retriever or the model.
pub fn normalize(text: &str) -> String {
    let lower = text.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut last_was_space = false;
    for ch in lower.chars() {
        if ch.is_whitespace() {
            if !last_was_space && !out.is_empty() {
                out.push(' ');
            }
            last_was_space = true;
            continue;
        }
        if ch.is_alphanumeric() {
            out.push(ch);
            last_was_space = false;
        }
        // punctuation is dropped entirely, not replaced with a space
    }
    out.trim().to_string()
}

/// Canonicalize a metadata subset into a stable string: sorted `key=value` pairs
/// joined by `;`. Volatile fields (`created_at`, embedding vectors, scores) must be
/// excluded by the caller before this is invoked.
pub fn canonical_metadata(metadata_subset: &BTreeMap<String, String>) -> String {
    metadata_subset
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(";")
}

/// `SHA-256(normalize(text) ‖ "\u{1f}" ‖ canonical(metadata_subset))`, hex-encoded.
///
/// The separator is a non-printable unit separator so that no combination of
/// normalized text and metadata can forge a collision by shifting the boundary.
pub fn content_hash(text: &str, metadata_subset: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(text).as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical_metadata(metadata_subset).as_bytes());
    hex::encode(hasher.finalize())
}

/// `H(collection, source, section_index, chunk_index_within_section)`, hex-encoded
/// SHA-256. Two chunkings of the same source that agree on section/ordering produce
/// the same id, which is what makes `upsert` idempotent.
pub fn chunk_id(
    collection: &CollectionName,
    source: &str,
    section_index: u32,
    chunk_index_within_section: u32,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(collection.0.as_bytes());
    hasher.update([0x1f]);
    hasher.update(source.as_bytes());
    hasher.update([0x1f]);
    hasher.update(section_index.to_be_bytes());
    hasher.update([0x1f]);
    hasher.update(chunk_index_within_section.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// `SHA-256(query ‖ collection ‖ canonical(filters))`, hex-encoded. Used as the key
/// into the rerank cache and as a correlation id for per-query spans.
pub fn query_fingerprint(
    query: &str,
    collection: &CollectionName,
    filters: &BTreeMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update([0x1f]);
    hasher.update(collection.0.as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical_metadata(filters).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_punctuation() {
        assert_eq!(normalize("Hello,   World!!"), "hello world");
        assert_eq!(normalize("  Foo\n\tBar  "), "foo bar");
    }

    #[test]
    fn content_hash_is_stable_across_equivalent_inputs() {
        let meta: BTreeMap<String, String> = BTreeMap::new();
        let a = content_hash("Hello, World!", &meta);
        let b = content_hash("hello world", &meta);
        assert_eq!(a, b, "punctuation and case must not affect the hash");
    }

    #[test]
    fn content_hash_distinguishes_metadata() {
        let mut m1 = BTreeMap::new();
        m1.insert("source".to_string(), "a.md".to_string());
        let mut m2 = BTreeMap::new();
        m2.insert("source".to_string(), "b.md".to_string());
        assert_ne!(content_hash("same text", &m1), content_hash("same text", &m2));
    }

    #[test]
    fn chunk_id_is_deterministic() {
        let c = CollectionName::from("c1");
        let a = chunk_id(&c, "docA.md", 0, 1);
        let b = chunk_id(&c, "docA.md", 0, 1);
        assert_eq!(a, b);
        let different = chunk_id(&c, "docA.md", 0, 2);
        assert_ne!(a, different);
    }

    #[test]
    fn query_fingerprint_is_order_independent_of_filter_insertion() {
        let c = CollectionName::from("c1");
        let mut f1 = BTreeMap::new();
        f1.insert("lang".to_string(), "en".to_string());
        f1.insert("tag".to_string(), "faq".to_string());
        let mut f2 = BTreeMap::new();
        f2.insert("tag".to_string(), "faq".to_string());
        f2.insert("lang".to_string(), "en".to_string());
        assert_eq!(query_fingerprint("what is x", &c, &f1), query_fingerprint("what is x", &c, &f2));
    }
}
