//! Plaintext and Markdown reader. Markdown heading lines (`#`..`######`) become
//! [`BlockKind::Heading`] blocks with their nesting level; everything else is split
//! into paragraphs on blank lines, mirroring how the chunker tells section
//! boundaries apart from running text.

use std::fs;
use std::path::Path;

use crate::unified_blocks::UnifiedBlock;

pub fn read_text_to_blocks(path: &Path) -> std::io::Result<Vec<UnifiedBlock>> {
    let bytes = fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes).replace('\r', "");
    let is_markdown = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_lowercase().as_str(), "md" | "markdown"))
        .unwrap_or(false);

    Ok(if is_markdown { parse_markdown(&text) } else { parse_plaintext(&text) })
}

fn parse_markdown(text: &str) -> Vec<UnifiedBlock> {
    let mut out = Vec::new();
    let mut order = 0u32;
    let mut paragraph = String::new();

    let flush = |paragraph: &mut String, out: &mut Vec<UnifiedBlock>, order: &mut u32| {
        let trimmed = paragraph.trim();
        if !trimmed.is_empty() {
            out.push(UnifiedBlock::paragraph(trimmed.to_string(), *order));
            *order += 1;
        }
        paragraph.clear();
    };

    for line in text.lines() {
        let trimmed = line.trim_start();
        let level = trimmed.chars().take_while(|&c| c == '#').count();
        let followed_by_space_or_eol = trimmed.len() == level || trimmed.as_bytes().get(level) == Some(&b' ');
        if (1..=6).contains(&level) && followed_by_space_or_eol {
            flush(&mut paragraph, &mut out, &mut order);
            let heading_text = trimmed[level..].trim();
            out.push(UnifiedBlock::heading(heading_text.to_string(), order, level as u8));
            order += 1;
            continue;
        }
        if line.trim().is_empty() {
            flush(&mut paragraph, &mut out, &mut order);
            continue;
        }
        if !paragraph.is_empty() {
            paragraph.push(' ');
        }
        paragraph.push_str(line.trim());
    }
    flush(&mut paragraph, &mut out, &mut order);

    if out.is_empty() {
        out.push(UnifiedBlock::paragraph(String::new(), 0));
    }
    out
}

fn parse_plaintext(text: &str) -> Vec<UnifiedBlock> {
    let mut out = Vec::new();
    let mut order = 0u32;
    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if !trimmed.is_empty() {
            out.push(UnifiedBlock::paragraph(trimmed.replace('\n', " "), order));
            order += 1;
        }
    }
    if out.is_empty() {
        out.push(UnifiedBlock::paragraph(String::new(), 0));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unified_blocks::BlockKind;

    #[test]
    fn markdown_headings_are_detected_with_level() {
        let blocks = parse_markdown("# Title\n\nSome intro text.\n\n## Section\n\nBody.");
        assert_eq!(blocks[0].kind, BlockKind::Heading);
        assert_eq!(blocks[0].heading_level, Some(1));
        assert_eq!(blocks[2].heading_level, Some(2));
    }

    #[test]
    fn plaintext_splits_on_blank_lines() {
        let blocks = parse_plaintext("first paragraph\nstill first\n\nsecond paragraph");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].text, "first paragraph still first");
    }
}
