//! Section detection and token-based chunking (§4.6).
//!
//! Blocks are first grouped into sections at heading boundaries (Markdown headings
//! tagged by the reader, plus heuristics for numbered/all-caps/title-case-colon
//! headings that plain-text and PDF readers can't tag themselves). Each section's
//! body is then split into chunks of `chunk_size` tokens with `chunk_overlap` tokens
//! of trailing context carried into the next chunk, preferring to cut at a paragraph
//! boundary, then a sentence end, then a word boundary.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::unified_blocks::{BlockKind, UnifiedBlock};

#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self { chunk_size: 400, chunk_overlap: 50 }
    }
}

pub struct Section {
    pub title: String,
    pub level: u8,
    pub blocks: Vec<UnifiedBlock>,
}

static NUMBERED_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+(\.\d+){0,3}\.?\s+\S").unwrap());
static TITLE_CASE_COLON: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Z][a-zA-Z0-9]*(\s+[A-Z][a-zA-Z0-9]*){0,6}):\s*$").unwrap());

/// Promote heuristically-detected headings (numbered, ALL CAPS, `Title Case:`) in
/// paragraph blocks that readers other than Markdown can't tag themselves.
fn promote_heuristic_headings(blocks: &mut [UnifiedBlock]) {
    for block in blocks.iter_mut() {
        if block.kind != BlockKind::Paragraph {
            continue;
        }
        let text = block.text.trim();
        if text.is_empty() || text.len() > 120 || text.contains('\n') {
            continue;
        }
        let is_numbered = NUMBERED_HEADING.is_match(text);
        let is_all_caps = text.chars().any(|c| c.is_alphabetic())
            && text.chars().all(|c| !c.is_lowercase())
            && text.split_whitespace().count() <= 10;
        let is_title_colon = TITLE_CASE_COLON.is_match(text);

        if is_numbered || is_all_caps || is_title_colon {
            let level = if is_numbered {
                (text.matches('.').count() as u8 + 1).min(6)
            } else {
                2
            };
            block.kind = BlockKind::Heading;
            block.heading_level = Some(level);
        }
    }
}

/// Extract a document title: the first heading's text, else the first short
/// non-empty line.
pub fn extract_doc_title(blocks: &[UnifiedBlock]) -> String {
    if let Some(h) = blocks.iter().find(|b| b.kind == BlockKind::Heading) {
        return h.text.clone();
    }
    blocks
        .iter()
        .find(|b| !b.text.trim().is_empty())
        .map(|b| {
            let first_line = b.text.lines().next().unwrap_or(&b.text);
            first_line.chars().take(120).collect::<String>()
        })
        .unwrap_or_else(|| "Untitled".to_string())
}

/// Group blocks into sections at heading boundaries. A document with no headings at
/// all becomes one "Introduction" section (§4.6 edge case).
pub fn split_into_sections(blocks: &[UnifiedBlock]) -> Vec<Section> {
    let mut blocks = blocks.to_vec();
    promote_heuristic_headings(&mut blocks);

    let mut sections = Vec::new();
    let mut current_title = "Introduction".to_string();
    let mut current_level = 1u8;
    let mut current_blocks = Vec::new();

    for block in blocks {
        if block.kind == BlockKind::Heading {
            if !current_blocks.is_empty() {
                sections.push(Section { title: current_title, level: current_level, blocks: current_blocks });
                current_blocks = Vec::new();
            }
            current_title = block.text.clone();
            current_level = block.heading_level.unwrap_or(1);
            continue;
        }
        current_blocks.push(block);
    }
    if !current_blocks.is_empty() || sections.is_empty() {
        sections.push(Section { title: current_title, level: current_level, blocks: current_blocks });
    }
    sections
}

struct Word<'a> {
    text: &'a str,
    page_start: Option<u32>,
    page_end: Option<u32>,
    /// Set on the last word of a block (paragraph boundary) or a sentence.
    boundary_strength: u8,
}

fn collect_words(blocks: &[UnifiedBlock]) -> Vec<Word<'_>> {
    let mut words = Vec::new();
    for block in blocks {
        let block_words: Vec<&str> = block.text.split_whitespace().collect();
        for (i, w) in block_words.iter().enumerate() {
            let is_last_in_block = i + 1 == block_words.len();
            let ends_sentence = w.ends_with(['.', '!', '?']);
            let boundary_strength = if is_last_in_block {
                2
            } else if ends_sentence {
                1
            } else {
                0
            };
            words.push(Word { text: w, page_start: block.page_start, page_end: block.page_end, boundary_strength });
        }
    }
    words
}

/// Split one section's body into chunks of `chunk_size` tokens (approximated here as
/// whitespace-delimited words), each carrying `chunk_overlap` trailing tokens from
/// the previous chunk. Returns `(text, page_start, page_end)` per chunk.
pub fn chunk_section_body(blocks: &[UnifiedBlock], params: &ChunkParams) -> Vec<(String, Option<u32>, Option<u32>)> {
    let words = collect_words(blocks);
    if words.is_empty() {
        return Vec::new();
    }

    let chunk_size = params.chunk_size.max(1);
    let overlap = params.chunk_overlap.min(chunk_size.saturating_sub(1));

    let mut out = Vec::new();
    let mut start = 0usize;
    while start < words.len() {
        let ideal_end = (start + chunk_size).min(words.len());
        // Prefer a paragraph boundary, then a sentence boundary, within the last 20%
        // of the window, searching backward from ideal_end.
        let search_floor = start + (chunk_size * 4 / 5).max(1);
        let mut cut = ideal_end;
        if ideal_end < words.len() {
            let mut best: Option<(usize, u8)> = None;
            for idx in (search_floor.min(ideal_end)..ideal_end).rev() {
                let strength = words[idx].boundary_strength;
                if strength > 0 && best.map(|(_, b)| strength > b).unwrap_or(true) {
                    best = Some((idx + 1, strength));
                    if strength == 2 {
                        break;
                    }
                }
            }
            if let Some((idx, _)) = best {
                cut = idx;
            }
        }
        if cut <= start {
            cut = ideal_end.max(start + 1);
        }

        let slice = &words[start..cut];
        let text = slice.iter().map(|w| w.text).collect::<Vec<_>>().join(" ");
        if !text.trim().is_empty() {
            let page_start = slice.iter().filter_map(|w| w.page_start).min();
            let page_end = slice.iter().filter_map(|w| w.page_end).max();
            out.push((text, page_start, page_end));
        }

        if cut >= words.len() {
            break;
        }
        start = cut.saturating_sub(overlap).max(cut.min(start + 1));
        if start >= cut {
            start = cut;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn para(text: &str, order: u32) -> UnifiedBlock {
        UnifiedBlock::paragraph(text, order)
    }

    #[test]
    fn no_headings_becomes_single_introduction_section() {
        let blocks = vec![para("just some body text with no headings at all.", 0)];
        let sections = split_into_sections(&blocks);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].title, "Introduction");
    }

    #[test]
    fn markdown_headings_split_sections() {
        let blocks = vec![
            UnifiedBlock::heading("Intro", 0, 1),
            para("first section body.", 1),
            UnifiedBlock::heading("Details", 2, 1),
            para("second section body.", 3),
        ];
        let sections = split_into_sections(&blocks);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "Intro");
        assert_eq!(sections[1].title, "Details");
    }

    #[test]
    fn all_caps_short_line_is_promoted_to_heading() {
        let blocks = vec![para("OVERVIEW", 0), para("body text follows the heading.", 1)];
        let sections = split_into_sections(&blocks);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].title, "OVERVIEW");
    }

    #[test]
    fn chunking_respects_overlap_between_adjacent_chunks() {
        let text = (0..100).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let blocks = vec![para(&text, 0)];
        let params = ChunkParams { chunk_size: 30, chunk_overlap: 5 };
        let segments = chunk_section_body(&blocks, &params);
        assert!(segments.len() >= 3);
        let first_words: Vec<&str> = segments[0].0.split_whitespace().collect();
        let second_words: Vec<&str> = segments[1].0.split_whitespace().collect();
        // the tail of chunk 1 and the head of chunk 2 should share at least one token
        assert!(first_words.iter().rev().take(10).any(|w| second_words.iter().take(10).any(|w2| w == w2)));
    }

    #[test]
    fn empty_blocks_produce_no_chunks() {
        let blocks = vec![para("", 0)];
        let segments = chunk_section_body(&blocks, &ChunkParams::default());
        assert!(segments.is_empty());
    }
}
