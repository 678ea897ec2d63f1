use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use zip::ZipArchive;

use crate::models::{Document, DocumentType, ProcessingStatus};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no text extractor for {0} files")]
    Unsupported(DocumentType),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unreadable {kind} file: {message}")]
    Malformed { kind: DocumentType, message: String },
    #[error("document contains no text")]
    Empty,
}

fn malformed(kind: DocumentType, err: impl std::fmt::Display) -> ExtractError {
    ExtractError::Malformed {
        kind,
        message: err.to_string(),
    }
}

/// Turns a stored file into raw text. Implementations are synchronous and are
/// run on the blocking pool by callers.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path, kind: DocumentType) -> Result<String, ExtractError>;
}

/// Reads plain text, Word (docx), PowerPoint (pptx) and PDF files. The legacy
/// binary Office formats are reported as unsupported.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileExtractor;

impl TextExtractor for FileExtractor {
    fn extract(&self, path: &Path, kind: DocumentType) -> Result<String, ExtractError> {
        let text = match kind {
            DocumentType::Txt => String::from_utf8_lossy(&read(path)?).into_owned(),
            DocumentType::Docx => docx_text(&read(path)?)?,
            DocumentType::Pptx => pptx_text(&read(path)?)?,
            DocumentType::Pdf => pdf_text(path)?,
            DocumentType::Doc | DocumentType::Ppt => return Err(ExtractError::Unsupported(kind)),
        };

        if text.trim().is_empty() {
            return Err(ExtractError::Empty);
        }
        Ok(text)
    }
}

fn read(path: &Path) -> Result<Vec<u8>, ExtractError> {
    std::fs::read(path).map_err(|source| ExtractError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn zip_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> zip::result::ZipResult<String> {
    let mut entry = archive.by_name(name)?;
    let mut xml = String::new();
    entry.read_to_string(&mut xml)?;
    Ok(xml)
}

fn docx_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let kind = DocumentType::Docx;
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| malformed(kind, e))?;
    let xml = zip_entry(&mut archive, "word/document.xml").map_err(|e| malformed(kind, e))?;
    ooxml_text(&xml).map_err(|e| malformed(kind, e))
}

/// Slide text in presentation order (`slide2.xml` before `slide10.xml`).
fn pptx_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let kind = DocumentType::Pptx;
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| malformed(kind, e))?;

    let mut slides: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let number = name
                .strip_prefix("ppt/slides/slide")?
                .strip_suffix(".xml")?
                .parse()
                .ok()?;
            Some((number, name.to_string()))
        })
        .collect();
    slides.sort();

    let mut text = String::new();
    for (_, name) in slides {
        let xml = zip_entry(&mut archive, &name).map_err(|e| malformed(kind, e))?;
        text.push_str(&ooxml_text(&xml).map_err(|e| malformed(kind, e))?);
        text.push('\n');
    }
    Ok(text)
}

/// Collects the `t` runs of a WordprocessingML or DrawingML part, one line
/// per `p` paragraph.
fn ooxml_text(xml: &str) -> Result<String, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut text = String::new();
    let mut in_run = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) if e.local_name().as_ref() == b"t" => in_run = true,
            Event::End(ref e) => match e.local_name().as_ref() {
                b"t" => in_run = false,
                b"p" => text.push('\n'),
                _ => {}
            },
            Event::Empty(ref e) => match e.local_name().as_ref() {
                b"tab" => text.push('\t'),
                b"br" => text.push('\n'),
                _ => {}
            },
            Event::Text(ref e) if in_run => text.push_str(&e.unescape()?),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(text)
}

fn pdf_text(path: &Path) -> Result<String, ExtractError> {
    let kind = DocumentType::Pdf;
    let doc = lopdf::Document::load(path).map_err(|e| malformed(kind, e))?;
    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    doc.extract_text(&pages).map_err(|e| malformed(kind, e))
}

/// Trims each line and drops blank ones.
pub fn clean_text(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extracts and cleans the text of `doc`, leaving it either `Completed` with
/// content or `Failed` with the reason. Never returns an error itself.
pub async fn process_document(
    extractor: Arc<dyn TextExtractor>,
    doc: &mut Document,
    now: DateTime<Utc>,
) {
    doc.processing_status = ProcessingStatus::Processing;

    let path = PathBuf::from(&doc.file_path);
    let kind = doc.document_type;
    let outcome = tokio::task::spawn_blocking(move || extractor.extract(&path, kind)).await;

    match outcome {
        Ok(Ok(raw)) => {
            doc.processed_content = Some(clean_text(&raw));
            doc.raw_content = Some(raw);
            doc.processing_status = ProcessingStatus::Completed;
            doc.processing_error = None;
            doc.processed_at = Some(now);
            log::info!("document {} processed", doc.id);
        }
        Ok(Err(err)) => {
            log::warn!("document {} extraction failed: {}", doc.id, err);
            doc.processing_status = ProcessingStatus::Failed;
            doc.processing_error = Some(err.to_string());
        }
        Err(join_err) => {
            log::error!("document {} extraction task died: {}", doc.id, join_err);
            doc.processing_status = ProcessingStatus::Failed;
            doc.processing_error = Some("text extraction crashed".to_string());
        }
    }
}
