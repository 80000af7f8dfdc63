
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::extract::{ExtractedText, TextBlock};
use crate::{RagError, Result};

/// Sizing knobs for the chunker. All sizes are in characters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Preferred chunk size; a chunk may exceed it by up to `overlap`
    /// characters where the overlap re-consumes the previous chunk's tail.
    pub target_size: usize,
    /// Chunks below this size are never emitted, except as the final chunk
    /// of a document.
    pub min_size: usize,
    /// Characters of trailing context repeated at the start of the next
    /// chunk.
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            target_size: 2000,
            min_size: 200,
            overlap: 200,
        }
    }
}

/// One segment of a document's extracted text, in reading order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub sequence_index: usize,
    pub text: String,
    pub char_length: usize,
    /// Byte range of this chunk within the extracted text.
    pub span: Range<usize>,
}

/// Split extracted text into overlapping, size-bounded chunks.
///
/// Boundaries prefer the strongest available break: block starts (headings,
/// paragraphs, table rows) first, then sentence ends, then whitespace, then
/// a hard cut. Deterministic: identical input and config always produce the
/// identical sequence.
pub fn chunk(extracted: &ExtractedText, config: &ChunkingConfig) -> Result<Vec<TextChunk>> {
    validate(config)?;

    let text = extracted.text.as_str();
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    // Units are contiguous byte ranges covering the whole text, each at most
    // `target_size` characters. Chunk boundaries only ever fall on unit
    // boundaries, so block structure survives assembly.
    let units = split_units(text, &extracted.blocks, config.target_size);

    let mut chunks: Vec<TextChunk> = Vec::new();
    let mut start = 0;
    let mut idx = 0;

    while idx < units.len() {
        let mut end = start;
        let mut chars = 0usize;
        let mut first = true;

        while idx < units.len() {
            let unit_end = units[idx].end;
            let piece_chars = text[end..unit_end].chars().count();
            if !first && chars >= config.min_size && chars + piece_chars > config.target_size {
                break;
            }
            end = unit_end;
            chars += piece_chars;
            idx += 1;
            first = false;
        }

        chunks.push(TextChunk {
            sequence_index: chunks.len(),
            text: text[start..end].to_string(),
            char_length: chars,
            span: start..end,
        });

        if idx < units.len() {
            // Back up by `overlap` characters from the emitted end, which is
            // the same as advancing `chars - overlap` from the emitted start.
            // The floor of one character guarantees forward progress.
            let advance = chars.saturating_sub(config.overlap).max(1);
            start = advance_chars(text, start, advance);
        }
    }

    Ok(chunks)
}

fn validate(config: &ChunkingConfig) -> Result<()> {
    if config.target_size == 0 {
        return Err(RagError::InvalidChunkConfig(
            "target_size must be at least 1".to_string(),
        ));
    }
    if config.overlap >= config.target_size {
        return Err(RagError::InvalidChunkConfig(format!(
            "overlap ({}) must be smaller than target_size ({})",
            config.overlap, config.target_size
        )));
    }
    if config.min_size > config.target_size {
        return Err(RagError::InvalidChunkConfig(format!(
            "min_size ({}) must not exceed target_size ({})",
            config.min_size, config.target_size
        )));
    }
    Ok(())
}

/// Slice the text into ordered ranges: one per structural block (block
/// separators attach to the preceding range), with oversized blocks split
/// further at sentence, whitespace, or hard-cut positions.
fn split_units(text: &str, blocks: &[TextBlock], target: usize) -> Vec<Range<usize>> {
    let mut starts = vec![0];
    for block in blocks {
        if block.span.start > 0 {
            starts.push(block.span.start);
        }
    }
    starts.dedup();

    let mut units = Vec::new();
    for (i, &unit_start) in starts.iter().enumerate() {
        let unit_end = starts.get(i + 1).copied().unwrap_or(text.len());
        if unit_start >= unit_end {
            continue;
        }
        if text[unit_start..unit_end].chars().count() > target {
            split_oversized(text, unit_start..unit_end, target, &mut units);
        } else {
            units.push(unit_start..unit_end);
        }
    }
    units
}

fn split_oversized(text: &str, range: Range<usize>, target: usize, out: &mut Vec<Range<usize>>) {
    let mut cursor = range.start;
    while cursor < range.end {
        let window_end = advance_chars(text, cursor, target).min(range.end);
        if window_end == range.end {
            out.push(cursor..range.end);
            break;
        }
        let cut = best_cut(&text[cursor..window_end])
            .map_or(window_end, |relative| cursor + relative);
        out.push(cursor..cut);
        cursor = cut;
    }
}

/// Best break position within an over-long window: after the last sentence
/// end if one exists, otherwise after the last whitespace. `None` means a
/// hard cut at the window edge is the only option.
fn best_cut(window: &str) -> Option<usize> {
    let mut sentence_cut = None;
    let mut whitespace_cut = None;

    for (i, c) in window.char_indices() {
        let after = i + c.len_utf8();
        if after == window.len() {
            break;
        }
        match c {
            '\n' => sentence_cut = Some(after),
            '.' | '!' | '?' => {
                if window[after..].starts_with(char::is_whitespace) {
                    sentence_cut = Some(after);
                }
            }
            c if c.is_whitespace() => whitespace_cut = Some(after),
            _ => {}
        }
    }

    sentence_cut.or(whitespace_cut)
}

/// Byte offset of the position `n` characters past `start`, clamped to the
/// end of the text.
fn advance_chars(text: &str, start: usize, n: usize) -> usize {
    text[start..]
        .char_indices()
        .nth(n)
        .map_or(text.len(), |(i, _)| start + i)
}
