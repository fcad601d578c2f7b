//! PDF reader. One block per page, tagged with its page number so the chunker can
//! carry `page_start`/`page_end` through to the resulting [`chunk_model::Chunk`]s.

use std::path::Path;

use lopdf::Document;

use crate::unified_blocks::UnifiedBlock;

#[derive(Debug, thiserror::Error)]
pub enum PdfReadError {
    #[error("failed to load PDF: {0}")]
    Load(#[from] lopdf::Error),
}

pub fn read_pdf_to_blocks(path: &Path) -> Result<Vec<UnifiedBlock>, PdfReadError> {
    let doc = Document::load(path)?;
    let mut pages: Vec<(u32, lopdf::ObjectId)> = doc.get_pages().into_iter().collect();
    pages.sort_by_key(|(num, _)| *num);

    let mut out = Vec::with_capacity(pages.len());
    let mut order = 0u32;
    for (page_num, _) in pages {
        let text = doc.extract_text(&[page_num]).unwrap_or_default();
        let cleaned = text.trim();
        if cleaned.is_empty() {
            continue;
        }
        out.push(UnifiedBlock::paragraph(cleaned.to_string(), order).with_page(page_num));
        order += 1;
    }
    Ok(out)
}
