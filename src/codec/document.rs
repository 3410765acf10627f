//! Codecs for work items and their reports

use super::{optional_text, required_text, Codec, FieldMap, FieldValue, MapCodec, QueueCodec};
use crate::document::{ExtractionStatus, Report, WorkItem};
use crate::error::CodecError;
use std::path::PathBuf;

const PATH_FIELD: &str = "path";
const ID_FIELD: &str = "doc_id";
const STATUS_FIELD: &str = "extraction_status";
const ERROR_FIELD: &str = "error";

fn path_value(path: &std::path::Path) -> FieldValue {
    // Non UTF-8 paths are stored lossily
    FieldValue::Text(path.to_string_lossy().into_owned())
}

/// Queue codec for [`WorkItem`]s
///
/// Key: `path`. Value: `doc_id`. Status strings `WAITING` / `PROCESSED`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentCodec;

impl Codec<WorkItem> for DocumentCodec {
    fn key_fields(&self) -> &[&'static str] {
        &[PATH_FIELD]
    }

    fn value_fields(&self) -> &[&'static str] {
        &[ID_FIELD]
    }

    fn encode_key(&self, item: &WorkItem) -> FieldMap {
        FieldMap::from([(PATH_FIELD.to_string(), path_value(&item.path))])
    }

    fn encode_value(&self, item: &WorkItem) -> FieldMap {
        FieldMap::from([(ID_FIELD.to_string(), FieldValue::from(item.id.clone()))])
    }

    fn decode(&self, row: &FieldMap) -> Result<WorkItem, CodecError> {
        let path = required_text(row, PATH_FIELD)?;
        let id = optional_text(row, ID_FIELD)?;
        Ok(WorkItem {
            path: PathBuf::from(path),
            id: id.map(str::to_string),
        })
    }
}

impl QueueCodec<WorkItem> for DocumentCodec {
    fn waiting(&self) -> &'static str {
        "WAITING"
    }

    fn processed(&self) -> &'static str {
        "PROCESSED"
    }
}

/// Map codec for the status map: path → [`Report`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportCodec;

impl MapCodec<PathBuf, Report> for ReportCodec {
    fn key_fields(&self) -> &[&'static str] {
        &[PATH_FIELD]
    }

    fn value_fields(&self) -> &[&'static str] {
        &[STATUS_FIELD, ERROR_FIELD]
    }

    fn encode_key(&self, key: &PathBuf) -> FieldMap {
        FieldMap::from([(PATH_FIELD.to_string(), path_value(key))])
    }

    fn encode_value(&self, value: &Report) -> FieldMap {
        FieldMap::from([
            (STATUS_FIELD.to_string(), FieldValue::from(value.status.as_str())),
            (ERROR_FIELD.to_string(), FieldValue::from(value.error.clone())),
        ])
    }

    fn decode_key(&self, row: &FieldMap) -> Result<PathBuf, CodecError> {
        required_text(row, PATH_FIELD).map(PathBuf::from)
    }

    fn decode_value(&self, row: &FieldMap) -> Result<Report, CodecError> {
        let status: ExtractionStatus = required_text(row, STATUS_FIELD)?.parse()?;
        let error = optional_text(row, ERROR_FIELD)?.map(str::to_string);
        Ok(Report { status, error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_codec() {
        let codec = DocumentCodec;
        let item = WorkItem::with_id("/data/report.pdf", "abc");

        let row = codec.encode(&item);
        assert_eq!(row.get("path").and_then(FieldValue::as_text), Some("/data/report.pdf"));
        assert_eq!(row.get("doc_id").and_then(FieldValue::as_text), Some("abc"));

        let decoded = codec.decode(&row).unwrap();
        assert_eq!(decoded.id.as_deref(), Some("abc"));
        assert_eq!(decoded, item);
    }

    #[test]
    fn test_document_codec_rejects_missing_path() {
        let row = FieldMap::from([("doc_id".to_string(), FieldValue::Null)]);
        assert!(DocumentCodec.decode(&row).is_err());
    }

    #[test]
    fn test_report_codec_unknown_status_is_an_error() {
        let row = FieldMap::from([
            ("extraction_status".to_string(), FieldValue::from("MAYBE")),
            ("error".to_string(), FieldValue::Null),
        ]);
        assert_eq!(
            ReportCodec.decode_value(&row),
            Err(CodecError::UnknownStatus("MAYBE".into()))
        );
    }

    #[test]
    fn test_report_codec_failure() {
        let report = Report::failure(ExtractionStatus::FailureUnreadable, "EACCES");
        let row = ReportCodec.encode_value(&report);
        assert_eq!(ReportCodec.decode_value(&row).unwrap(), report);
    }
}
