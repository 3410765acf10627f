//! Extraction and output collaborators
//!
//! The pool only knows these two traits. [`PlainTextExtractor`] and
//! [`DirectorySpewer`] are minimal implementations so the pipeline can run
//! end to end; real deployments plug in their own parsers and writers.

use crate::document::{ExtractionStatus, WorkItem};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Bytes read to sniff the content type
const HEADER_SIZE: usize = 8192;

/// Result of extracting one file
#[derive(Debug, Clone, Default, Serialize)]
pub struct Extraction {
    /// Extracted text
    pub text: String,
    /// Detected MIME type
    pub content_type: Option<String>,
    /// Extra key/value metadata
    pub metadata: BTreeMap<String, String>,
}

/// Extraction failures, each mapping to one failure status
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("File not found")]
    NotFound,

    #[error("File unreadable: {0}")]
    Unreadable(String),

    #[error("File could not be decrypted: {0}")]
    NotDecrypted(String),

    #[error("File could not be parsed: {0}")]
    NotParsed(String),

    #[error("Extraction failed: {0}")]
    Other(String),
}

impl ExtractError {
    /// Status recorded for this failure
    pub fn status(&self) -> ExtractionStatus {
        match self {
            ExtractError::NotFound => ExtractionStatus::FailureNotFound,
            ExtractError::Unreadable(_) => ExtractionStatus::FailureUnreadable,
            ExtractError::NotDecrypted(_) => ExtractionStatus::FailureNotDecrypted,
            ExtractError::NotParsed(_) => ExtractionStatus::FailureNotParsed,
            ExtractError::Other(_) => ExtractionStatus::FailureUnknown,
        }
    }
}

impl From<std::io::Error> for ExtractError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => ExtractError::NotFound,
            _ => ExtractError::Unreadable(err.to_string()),
        }
    }
}

/// Output failures
#[derive(Error, Debug)]
pub enum SpewError {
    /// Output already exists and was not overwritten
    #[error("Output conflict: {0}")]
    Conflict(String),

    #[error("Output failed: {0}")]
    Failed(String),
}

impl SpewError {
    /// Status recorded for this failure
    pub fn status(&self) -> ExtractionStatus {
        match self {
            SpewError::Conflict(_) => ExtractionStatus::NotSaved,
            SpewError::Failed(_) => ExtractionStatus::FailureUnknown,
        }
    }
}

/// Turns a file into an [`Extraction`]. Called on a blocking thread.
pub trait Extractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<Extraction, ExtractError>;
}

/// Writes an [`Extraction`] somewhere. Called on a blocking thread.
pub trait Spewer: Send + Sync {
    fn write(&self, item: &WorkItem, extraction: &Extraction) -> Result<(), SpewError>;
}

/// MIME type from header bytes, if recognized
pub fn detect_content_type(header: &[u8]) -> Option<String> {
    infer::get(header).map(|kind| kind.mime_type().to_string())
}

/// Whether the header bytes belong to a known binary format
fn is_binary(header: &[u8]) -> bool {
    infer::is_image(header)
        || infer::is_video(header)
        || infer::is_audio(header)
        || infer::is_archive(header)
        || infer::is_app(header)
}

/// Reads UTF-8 text files as-is
///
/// Files recognized as binary by their magic bytes, and files that are not
/// valid UTF-8, fail with [`ExtractError::NotParsed`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

impl Extractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> Result<Extraction, ExtractError> {
        let mut file = fs::File::open(path)?;
        let size = file.metadata()?.len();

        let mut bytes = Vec::with_capacity(size as usize);
        file.read_to_end(&mut bytes)?;

        let header = &bytes[..bytes.len().min(HEADER_SIZE)];
        if is_binary(header) {
            let kind = detect_content_type(header).unwrap_or_default();
            return Err(ExtractError::NotParsed(format!("binary content ({})", kind)));
        }

        let text = String::from_utf8(bytes)
            .map_err(|e| ExtractError::NotParsed(format!("not UTF-8 text: {}", e)))?;

        let mut metadata = BTreeMap::new();
        metadata.insert("size".to_string(), size.to_string());

        Ok(Extraction {
            text,
            content_type: Some("text/plain".to_string()),
            metadata,
        })
    }
}

#[derive(Serialize)]
struct OutputRecord<'a> {
    path: &'a Path,
    id: Option<&'a str>,
    #[serde(flatten)]
    extraction: &'a Extraction,
}

/// Writes one JSON file per item into an output directory
///
/// The output name is derived from the item path. Existing outputs are left
/// alone and reported as [`SpewError::Conflict`] unless `overwrite` is set.
#[derive(Debug, Clone)]
pub struct DirectorySpewer {
    dir: PathBuf,
    overwrite: bool,
}

impl DirectorySpewer {
    /// Write outputs under `dir`, refusing to overwrite existing files
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            overwrite: false,
        }
    }

    /// Replace existing outputs
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Where the output for `item` goes
    pub fn output_path(&self, item: &WorkItem) -> PathBuf {
        let flat: String = item
            .path
            .to_string_lossy()
            .trim_start_matches('/')
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
            .collect();
        self.dir.join(format!("{}.json", flat))
    }
}

impl Spewer for DirectorySpewer {
    fn write(&self, item: &WorkItem, extraction: &Extraction) -> Result<(), SpewError> {
        let target = self.output_path(item);
        if !self.overwrite && target.exists() {
            return Err(SpewError::Conflict(target.display().to_string()));
        }

        let record = OutputRecord {
            path: &item.path,
            id: item.id.as_deref(),
            extraction,
        };
        let json = serde_json::to_vec_pretty(&record).map_err(|e| SpewError::Failed(e.to_string()))?;

        fs::create_dir_all(&self.dir).map_err(|e| SpewError::Failed(e.to_string()))?;
        fs::write(&target, json).map_err(|e| SpewError::Failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_extracts_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "hello").unwrap();

        let extraction = PlainTextExtractor.extract(&path).unwrap();
        assert_eq!(extraction.text, "hello");
        assert_eq!(extraction.metadata.get("size").map(String::as_str), Some("5"));
    }

    #[test]
    fn test_failure_statuses() {
        let dir = TempDir::new().unwrap();

        let missing = PlainTextExtractor.extract(&dir.path().join("gone.txt")).unwrap_err();
        assert_eq!(missing.status(), ExtractionStatus::FailureNotFound);

        let png = dir.path().join("image.txt");
        fs::write(&png, [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]).unwrap();
        let binary = PlainTextExtractor.extract(&png).unwrap_err();
        assert_eq!(binary.status(), ExtractionStatus::FailureNotParsed);

        let latin1 = dir.path().join("latin1.txt");
        fs::write(&latin1, [b'c', b'a', b'f', 0xE9]).unwrap();
        let invalid = PlainTextExtractor.extract(&latin1).unwrap_err();
        assert_eq!(invalid.status(), ExtractionStatus::FailureNotParsed);
    }

    #[test]
    fn test_detect_content_type() {
        let png = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        assert_eq!(detect_content_type(&png).as_deref(), Some("image/png"));
        assert_eq!(detect_content_type(b"plain words"), None);
    }

    #[test]
    fn test_spewer_refuses_to_overwrite() {
        let out = TempDir::new().unwrap();
        let spewer = DirectorySpewer::new(out.path());
        let item = WorkItem::with_id("/data/docs/a.txt", "doc-1");
        let extraction = Extraction {
            text: "hello".into(),
            ..Extraction::default()
        };

        spewer.write(&item, &extraction).unwrap();
        let written = fs::read_to_string(spewer.output_path(&item)).unwrap();
        assert!(written.contains("\"doc-1\""));
        assert!(written.contains("\"hello\""));

        let err = spewer.write(&item, &extraction).unwrap_err();
        assert_eq!(err.status(), ExtractionStatus::NotSaved);

        let spewer = spewer.overwrite(true);
        spewer.write(&item, &extraction).unwrap();
    }

    #[test]
    fn test_output_path_is_flat() {
        let spewer = DirectorySpewer::new("/out");
        let item = WorkItem::new("/data/docs/a.txt");
        assert_eq!(spewer.output_path(&item), PathBuf::from("/out/data_docs_a.txt.json"));
    }
}
