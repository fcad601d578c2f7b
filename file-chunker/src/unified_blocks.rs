//! Common intermediate representation every format reader converts into, so the
//! token-based chunker (`text_segmenter`) never needs to know whether a block came
//! from a PDF page or a Markdown file.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Heading,
    Paragraph,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedBlock {
    pub kind: BlockKind,
    pub text: String,
    pub order: u32,
    /// 1-based heading depth; `None` for non-heading blocks.
    pub heading_level: Option<u8>,
    pub page_start: Option<u32>,
    pub page_end: Option<u32>,
}

impl UnifiedBlock {
    pub fn paragraph(text: impl Into<String>, order: u32) -> Self {
        Self { kind: BlockKind::Paragraph, text: text.into(), order, heading_level: None, page_start: None, page_end: None }
    }

    pub fn heading(text: impl Into<String>, order: u32, level: u8) -> Self {
        Self { kind: BlockKind::Heading, text: text.into(), order, heading_level: Some(level), page_start: None, page_end: None }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page_start = Some(page);
        self.page_end = Some(page);
        self
    }
}
