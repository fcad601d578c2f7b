//! File ingestion entry point (§4.6): turns a PDF, Markdown, or plaintext file into a
//! list of [`chunk_model::Chunk`]s carrying section/page metadata and a stable,
//! content-addressed `chunk_id`.
//!
//! Format detection is by extension: `.pdf` goes through [`reader_pdf`], everything
//! else through [`reader_txt`] (which itself tells Markdown from plaintext). Both
//! readers converge on the [`unified_blocks::UnifiedBlock`] representation that
//! [`text_segmenter`] groups into sections and splits into token-bounded chunks.

pub mod reader_pdf;
pub mod reader_txt;
pub mod text_segmenter;
pub mod unified_blocks;

use std::path::Path;

use chrono::Utc;

use chunk_model::fingerprint;
use chunk_model::{Chunk, CollectionName};
use text_segmenter::ChunkParams;
use unified_blocks::UnifiedBlock;

#[derive(Debug, thiserror::Error)]
pub enum ChunkerError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to read PDF: {0}")]
    Pdf(#[from] reader_pdf::PdfReadError),
}

/// Read `path` into its [`UnifiedBlock`]s, dispatching on extension.
fn read_blocks(path: &Path) -> Result<Vec<UnifiedBlock>, ChunkerError> {
    let is_pdf = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false);
    if is_pdf {
        Ok(reader_pdf::read_pdf_to_blocks(path)?)
    } else {
        Ok(reader_txt::read_text_to_blocks(path)?)
    }
}

/// Turn `path` into a flat, ordered list of chunks for `collection`, identified by
/// `source` (the caller-chosen logical name used for later `delete_by_source`/
/// `reindex_source` calls — typically the file path or URL, not necessarily `path`
/// itself).
///
/// Empty chunks (whitespace-only after segmentation) are dropped; a document with no
/// detectable sections collapses to a single "Introduction" section (§4.6 edge case).
pub fn chunk_file(
    path: &Path,
    collection: &CollectionName,
    source: &str,
    params: ChunkParams,
) -> Result<Vec<Chunk>, ChunkerError> {
    let blocks = read_blocks(path)?;
    Ok(chunk_blocks(&blocks, collection, source, params))
}

/// Same as [`chunk_file`] but operating on already-extracted blocks, useful for
/// testing the segmentation/chunk-id logic without touching the filesystem or for
/// formats whose reader lives outside this crate.
pub fn chunk_blocks(
    blocks: &[UnifiedBlock],
    collection: &CollectionName,
    source: &str,
    params: ChunkParams,
) -> Vec<Chunk> {
    let doc_title = text_segmenter::extract_doc_title(blocks);
    let sections = text_segmenter::split_into_sections(blocks);
    let created_at = Utc::now();

    let mut out = Vec::new();
    for (section_index, section) in sections.into_iter().enumerate() {
        let section_index = section_index as u32;
        let segments = text_segmenter::chunk_section_body(&section.blocks, &params);
        for (chunk_index, (text, page_start, page_end)) in segments.into_iter().enumerate() {
            let chunk_index = chunk_index as u32;
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }

            let chunk_id = fingerprint::chunk_id(collection, source, section_index, chunk_index);
            let metadata_subset =
                std::collections::BTreeMap::from([("source".to_string(), source.to_string())]);
            let content_hash = fingerprint::content_hash(trimmed, &metadata_subset);
            let token_count = trimmed.split_whitespace().count();
            // Stands in for the single `page` field; a chunk spanning multiple pages
            // is tagged with the page it starts on.
            let page = page_start.or(page_end);

            out.push(Chunk {
                schema_version: chunk_model::SCHEMA_MAJOR,
                chunk_id: chunk_id.into(),
                collection: collection.clone(),
                source: source.to_string(),
                doc_title: doc_title.clone(),
                section_title: section.title.clone(),
                section_level: section.level,
                section_index,
                page,
                chunk_index_within_section: chunk_index,
                text: trimmed.to_string(),
                token_count,
                content_hash,
                created_at,
                meta: std::collections::BTreeMap::new(),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use unified_blocks::UnifiedBlock;

    fn collection() -> CollectionName {
        CollectionName::from("docs")
    }

    #[test]
    fn chunk_ids_are_unique_and_stable_within_a_document() {
        let blocks = vec![
            UnifiedBlock::heading("Intro", 0, 1),
            UnifiedBlock::paragraph("first paragraph of the intro section.", 1),
            UnifiedBlock::heading("Details", 2, 1),
            UnifiedBlock::paragraph("first paragraph of the details section.", 3),
        ];
        let chunks_a = chunk_blocks(&blocks, &collection(), "doc.md", ChunkParams::default());
        let chunks_b = chunk_blocks(&blocks, &collection(), "doc.md", ChunkParams::default());

        assert_eq!(chunks_a.len(), 2);
        let mut ids: Vec<&str> = chunks_a.iter().map(|c| c.chunk_id.0.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), chunks_a.len(), "chunk_ids must be unique within a document");

        let ids_a: Vec<&str> = chunks_a.iter().map(|c| c.chunk_id.0.as_str()).collect();
        let ids_b: Vec<&str> = chunks_b.iter().map(|c| c.chunk_id.0.as_str()).collect();
        assert_eq!(ids_a, ids_b, "re-chunking identical input must reproduce chunk_ids");
    }

    #[test]
    fn headingless_document_collapses_to_introduction_section() {
        let blocks = vec![UnifiedBlock::paragraph("just body text, no headings anywhere.", 0)];
        let chunks = chunk_blocks(&blocks, &collection(), "plain.txt", ChunkParams::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].section_title, "Introduction");
        assert_eq!(chunks[0].section_index, 0);
        assert_eq!(chunks[0].chunk_index_within_section, 0);
    }

    #[test]
    fn empty_sections_produce_no_chunks() {
        let blocks = vec![UnifiedBlock::heading("Empty", 0, 1)];
        let chunks = chunk_blocks(&blocks, &collection(), "doc.md", ChunkParams::default());
        assert!(chunks.is_empty());
    }

    #[test]
    fn page_metadata_is_carried_from_pdf_style_blocks() {
        let blocks = vec![UnifiedBlock::paragraph("some page content here.", 0).with_page(3)];
        let chunks = chunk_blocks(&blocks, &collection(), "doc.pdf", ChunkParams::default());
        assert_eq!(chunks[0].page, Some(3));
    }

    #[test]
    fn content_hash_is_stable_for_identical_text_and_source() {
        let blocks = vec![UnifiedBlock::paragraph("identical content.", 0)];
        let a = chunk_blocks(&blocks, &collection(), "a.txt", ChunkParams::default());
        let b = chunk_blocks(&blocks, &collection(), "a.txt", ChunkParams::default());
        assert_eq!(a[0].content_hash, b[0].content_hash);
    }

    #[test]
    fn reader_dispatch_picks_pdf_reader_by_extension() {
        let path = Path::new("nonexistent.pdf");
        let err = chunk_file(path, &collection(), "nonexistent.pdf", ChunkParams::default())
            .expect_err("missing file must error");
        assert!(matches!(err, ChunkerError::Pdf(_)));
    }

    #[test]
    fn reader_dispatch_picks_text_reader_for_non_pdf_extensions() {
        let path = Path::new("nonexistent.md");
        let err = chunk_file(path, &collection(), "nonexistent.md", ChunkParams::default())
            .expect_err("missing file must error");
        assert!(matches!(err, ChunkerError::Io(_)));
    }
}
