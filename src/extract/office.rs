use std::io::{Cursor, Read};

use calamine::{Data, Reader as CalamineReader, Xls, Xlsx};
use quick_xml::Reader;
use quick_xml::events::Event;

use super::{BlockKind, ExtractedText, MediaType, TextBuilder};
use crate::{RagError, Result};

/// Identify which Office container a ZIP archive holds by inspecting its
/// entry names. Anything else in ZIP clothing is rejected.
pub(super) fn sniff_zip_container(bytes: &[u8]) -> Result<MediaType> {
    let archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| RagError::CorruptDocument(format!("unreadable ZIP container: {e}")))?;

    let mut names = archive.file_names();
    if names.any(|name| name == "word/document.xml") {
        return Ok(MediaType::Docx);
    }

    let mut names = archive.file_names();
    if names.any(|name| name == "xl/workbook.xml") {
        return Ok(MediaType::Xlsx);
    }

    Err(RagError::UnsupportedFormat(
        "ZIP archive is not a recognized Office document".to_string(),
    ))
}

/// Extract paragraphs and headings from the main document part of a DOCX
/// archive. Style-based headings (`Heading1`..`Heading6`) become heading
/// blocks; everything else is a paragraph.
pub(super) fn extract_docx(bytes: &[u8]) -> Result<ExtractedText> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| RagError::CorruptDocument(format!("unreadable DOCX archive: {e}")))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| RagError::CorruptDocument(format!("DOCX missing word/document.xml: {e}")))?
        .read_to_string(&mut xml)
        .map_err(|e| RagError::CorruptDocument(format!("unreadable DOCX document part: {e}")))?;

    let mut reader = Reader::from_str(&xml);
    reader.config_mut().trim_text(false);

    let mut builder = TextBuilder::new();
    let mut paragraph = String::new();
    let mut heading_level: Option<u8> = None;
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => {
                    paragraph.clear();
                    heading_level = None;
                }
                b"t" => in_text = true,
                b"br" => paragraph.push('\n'),
                b"tab" => paragraph.push('\t'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"pStyle" => heading_level = heading_level_from_style(&e),
                b"br" => paragraph.push('\n'),
                b"tab" => paragraph.push('\t'),
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_text {
                    let text = e.unescape().map_err(|e| {
                        RagError::CorruptDocument(format!("malformed DOCX text run: {e}"))
                    })?;
                    paragraph.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let kind = heading_level.map_or(BlockKind::Paragraph, BlockKind::Heading);
                    builder.push_block(kind, &paragraph);
                    paragraph.clear();
                    heading_level = None;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(RagError::CorruptDocument(format!(
                    "malformed DOCX XML at byte {}: {e}",
                    reader.buffer_position()
                )));
            }
        }
    }

    Ok(builder.finish())
}

fn heading_level_from_style(e: &quick_xml::events::BytesStart<'_>) -> Option<u8> {
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == b"val" {
            let value = String::from_utf8_lossy(&attr.value);
            if let Some(digits) = value.strip_prefix("Heading") {
                if let Ok(level @ 1..=6) = digits.parse::<u8>() {
                    return Some(level);
                }
            }
        }
    }
    None
}

/// Extract worksheet contents as a heading per sheet followed by one
/// tab-separated block per non-empty row.
pub(super) fn extract_spreadsheet(bytes: &[u8], media_type: MediaType) -> Result<ExtractedText> {
    match media_type {
        MediaType::Xlsx => {
            let workbook = Xlsx::new(Cursor::new(bytes))
                .map_err(|e| RagError::CorruptDocument(format!("unreadable XLSX workbook: {e}")))?;
            extract_workbook(workbook)
        }
        MediaType::Xls => {
            let workbook = Xls::new(Cursor::new(bytes))
                .map_err(|e| RagError::CorruptDocument(format!("unreadable XLS workbook: {e}")))?;
            extract_workbook(workbook)
        }
        _ => Err(RagError::UnsupportedFormat(format!(
            "{} is not a spreadsheet format",
            media_type.as_str()
        ))),
    }
}

fn extract_workbook<R: CalamineReader<RS>, RS: Read + std::io::Seek>(
    mut workbook: R,
) -> Result<ExtractedText>
where
    R::Error: std::fmt::Display,
{
    let mut builder = TextBuilder::new();

    for sheet_name in workbook.sheet_names().to_owned() {
        let range = workbook.worksheet_range(&sheet_name).map_err(|e| {
            RagError::CorruptDocument(format!("unreadable worksheet '{sheet_name}': {e}"))
        })?;

        builder.push_block(BlockKind::Heading(1), &sheet_name);

        for row in range.rows() {
            let cells: Vec<String> = row.iter().map(cell_text).collect();
            if cells.iter().all(String::is_empty) {
                continue;
            }
            builder.push_block(BlockKind::TableRow, &cells.join("\t"));
        }
    }

    Ok(builder.finish())
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => {
            // Whole numbers render without a trailing fraction so cell
            // text stays stable across XLS and XLSX storage.
            if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
    }
}
