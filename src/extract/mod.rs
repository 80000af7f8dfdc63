
mod html;
mod office;

use std::ops::Range;

use tracing::debug;

use crate::{RagError, Result};

/// Document formats the extractor can dispatch on, determined by content
/// sniffing rather than the declared media type alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Docx,
    Xlsx,
    Xls,
    Html,
    PlainText,
}

impl MediaType {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match *self {
            MediaType::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            MediaType::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            MediaType::Xls => "application/vnd.ms-excel",
            MediaType::Html => "text/html",
            MediaType::PlainText => "text/plain",
        }
    }
}

/// Structural role of a span of extracted text. The chunker prefers breaking
/// between blocks, and between stronger blocks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Heading(u8),
    Paragraph,
    TableRow,
}

/// A structural hint: a byte span of the extracted text with its role.
/// Spans are non-overlapping and ordered; separators between blocks belong
/// to the gap, not to any block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBlock {
    pub kind: BlockKind,
    pub span: Range<usize>,
}

/// Plain text extracted from a document plus its structural hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedText {
    pub text: String,
    pub blocks: Vec<TextBlock>,
}

impl ExtractedText {
    #[inline]
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Incrementally builds an `ExtractedText`, inserting paragraph separators
/// between blocks and recording spans as it goes.
pub(crate) struct TextBuilder {
    text: String,
    blocks: Vec<TextBlock>,
}

impl TextBuilder {
    pub(crate) fn new() -> Self {
        Self {
            text: String::new(),
            blocks: Vec::new(),
        }
    }

    pub(crate) fn push_block(&mut self, kind: BlockKind, content: &str) {
        let content = content.trim();
        if content.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push_str("\n\n");
        }
        let start = self.text.len();
        self.text.push_str(content);
        self.blocks.push(TextBlock {
            kind,
            span: start..self.text.len(),
        });
    }

    pub(crate) fn finish(self) -> ExtractedText {
        ExtractedText {
            text: self.text,
            blocks: self.blocks,
        }
    }
}

/// Extract plain text and structural hints from raw document bytes.
///
/// The declared media type is advisory only: the actual format is sniffed
/// from the content, so a mislabeled upload still dispatches to the right
/// adapter. Inputs above `max_bytes` are rejected before any parsing.
#[inline]
pub fn extract(
    bytes: &[u8],
    declared_media_type: Option<&str>,
    max_bytes: usize,
) -> Result<(MediaType, ExtractedText)> {
    if bytes.len() > max_bytes {
        return Err(RagError::DocumentTooLarge {
            size: bytes.len(),
            limit: max_bytes,
        });
    }

    let media_type = sniff_media_type(bytes, declared_media_type)?;
    debug!(
        "Sniffed media type {:?} (declared: {:?}, {} bytes)",
        media_type,
        declared_media_type,
        bytes.len()
    );

    let extracted = match media_type {
        MediaType::Docx => office::extract_docx(bytes)?,
        MediaType::Xlsx | MediaType::Xls => office::extract_spreadsheet(bytes, media_type)?,
        MediaType::Html => {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| RagError::CorruptDocument(format!("HTML is not valid UTF-8: {e}")))?;
            html::extract_html(text)
        }
        MediaType::PlainText => {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| RagError::CorruptDocument(format!("text is not valid UTF-8: {e}")))?;
            extract_plain_text(text)
        }
    };

    debug!(
        "Extracted {} chars in {} blocks",
        extracted.text.len(),
        extracted.blocks.len()
    );

    Ok((media_type, extracted))
}

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE2_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Determine the actual format from magic bytes and content, using the
/// declared type only to break the HTML-versus-plain-text tie.
#[inline]
pub fn sniff_media_type(bytes: &[u8], declared: Option<&str>) -> Result<MediaType> {
    if bytes.starts_with(ZIP_MAGIC) {
        return office::sniff_zip_container(bytes);
    }

    if bytes.starts_with(OLE2_MAGIC) {
        return Ok(MediaType::Xls);
    }

    let Ok(text) = std::str::from_utf8(bytes) else {
        return Err(RagError::UnsupportedFormat(format!(
            "binary content does not match any known format (declared: {})",
            declared.unwrap_or("none")
        )));
    };

    if looks_like_html(text) {
        return Ok(MediaType::Html);
    }

    if let Some(declared) = declared {
        let declared = declared
            .split(';')
            .next()
            .unwrap_or(declared)
            .trim()
            .to_ascii_lowercase();
        if declared == "text/html" || declared == "application/xhtml+xml" {
            return Ok(MediaType::Html);
        }
    }

    Ok(MediaType::PlainText)
}

fn looks_like_html(text: &str) -> bool {
    let head = text.trim_start();
    let lowered = head
        .get(..head.len().min(512))
        .unwrap_or(head)
        .to_ascii_lowercase();
    lowered.starts_with("<!doctype html") || lowered.starts_with("<html")
}

/// Plain text passes through byte-for-byte apart from line-ending
/// normalization; blank-line runs become paragraph boundaries.
fn extract_plain_text(text: &str) -> ExtractedText {
    let normalized = text.replace("\r\n", "\n");
    let mut blocks = Vec::new();

    let mut offset = 0;
    for part in normalized.split("\n\n") {
        let trimmed_start = part.len() - part.trim_start().len();
        let trimmed = part.trim();
        if !trimmed.is_empty() {
            let start = offset + trimmed_start;
            blocks.push(TextBlock {
                kind: BlockKind::Paragraph,
                span: start..start + trimmed.len(),
            });
        }
        offset += part.len() + 2;
    }

    ExtractedText {
        text: normalized,
        blocks,
    }
}
