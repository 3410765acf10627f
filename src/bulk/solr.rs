//! Solr core over HTTP (blocking)
//!
//! Uses `select` for paged reads, the real-time `get` handler for lookups
//! and the JSON `update` handler for writes. Must not be used from inside an
//! async runtime; run it on a blocking thread.

use super::document::{BulkQuery, Document};
use super::store::{DocumentSink, DocumentSource, StreamCallback};
use crate::error::{BulkError, BulkResult};
use reqwest::blocking::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::trace;

/// Internal Solr field dropped on read so copies do not trip version checks
const VERSION_FIELD: &str = "_version_";

/// Default HTTP timeout
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// One Solr core, addressed by its base URL
/// (`http://host:8983/solr/<core>`)
pub struct SolrStore {
    client: Client,
    base: String,
}

impl SolrStore {
    /// Client for the core at `url` (for example `http://solr:8983/solr/docs`)
    pub fn new(url: &str) -> BulkResult<Self> {
        Self::with_timeout(url, DEFAULT_HTTP_TIMEOUT)
    }

    /// Same as [`SolrStore::new`] with a per-request timeout
    pub fn with_timeout(url: &str, timeout: Duration) -> BulkResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("extract-pipeline/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base: url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.base
    }

    fn endpoint(&self, handler: &str) -> String {
        format!("{}/{}", self.base, handler)
    }

    fn read(&self, response: reqwest::blocking::Response) -> BulkResult<Value> {
        let status = response.status();
        let body: Value = response.json()?;
        check_status(status.as_u16(), &body)?;
        Ok(body)
    }
}

/// Fail on a non-2xx HTTP status or a non-zero `responseHeader.status`
fn check_status(http: u16, body: &Value) -> BulkResult<()> {
    let solr = body
        .pointer("/responseHeader/status")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if (200..300).contains(&http) && solr == 0 {
        return Ok(());
    }
    let message = body
        .pointer("/error/msg")
        .and_then(Value::as_str)
        .unwrap_or("no error message");
    Err(BulkError::Store(format!("HTTP {} (status {}): {}", http, solr, message)))
}

/// Turn a stored Solr document into a [`Document`]
fn parse_document(value: Value) -> BulkResult<Document> {
    let mut doc = Document::from_json(value)?;
    doc.fields.remove(VERSION_FIELD);
    Ok(doc)
}

/// Build `select` parameters for one page
fn select_params(query: &BulkQuery, offset: usize, rows: usize) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("q", query.query.clone()),
        ("start", offset.to_string()),
        ("rows", rows.to_string()),
        ("wt", "json".to_string()),
    ];
    if let Some(sort) = &query.sort {
        params.push(("sort", sort.clone()));
    }
    if !query.fields.is_empty() {
        params.push(("fl", query.fields.join(",")));
    }
    params
}

impl DocumentSource for SolrStore {
    fn name(&self) -> &str {
        &self.base
    }

    fn stream_page(
        &self,
        query: &BulkQuery,
        offset: usize,
        rows: usize,
        callback: &mut dyn StreamCallback,
    ) -> BulkResult<usize> {
        let response = self
            .client
            .get(self.endpoint("select"))
            .query(&select_params(query, offset, rows))
            .send()?;
        let mut body = self.read(response)?;

        let found = body.pointer("/response/numFound").and_then(Value::as_u64);
        let docs = match body.pointer_mut("/response/docs").map(Value::take) {
            Some(Value::Array(docs)) => docs,
            _ => return Err(BulkError::InvalidResponse("missing response.docs".into())),
        };
        trace!(offset, rows, returned = docs.len(), "Solr page");

        let fetched = docs.len();
        for doc in docs {
            callback.document(parse_document(doc)?)?;
        }
        callback.page(fetched, found);
        Ok(fetched)
    }
}

impl DocumentSink for SolrStore {
    fn get(&self, id: &str) -> BulkResult<Option<Document>> {
        let response = self
            .client
            .get(self.endpoint("get"))
            .query(&[("id", id), ("wt", "json")])
            .send()?;
        let mut body = self.read(response)?;
        match body.get_mut("doc").map(Value::take) {
            Some(Value::Null) | None => Ok(None),
            Some(doc) => parse_document(doc).map(Some),
        }
    }

    fn put(&self, doc: &Document) -> BulkResult<()> {
        let response = self
            .client
            .post(self.endpoint("update"))
            .query(&[("wt", "json")])
            .json(&vec![doc.to_json()])
            .send()?;
        self.read(response).map(|_| ())
    }

    fn commit(&self) -> BulkResult<()> {
        let response = self
            .client
            .post(self.endpoint("update"))
            .query(&[("commit", "true"), ("wt", "json")])
            .json(&serde_json::json!({}))
            .send()?;
        self.read(response).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_select_params() {
        let mut query = BulkQuery::new("type:pdf");
        query.fields = vec!["id".into(), "title".into()];
        let params = select_params(&query, 200, 100);
        assert!(params.contains(&("q", "type:pdf".to_string())));
        assert!(params.contains(&("start", "200".to_string())));
        assert!(params.contains(&("rows", "100".to_string())));
        assert!(params.contains(&("sort", "id asc".to_string())));
        assert!(params.contains(&("fl", "id,title".to_string())));
    }

    #[test]
    fn test_check_status() {
        assert!(check_status(200, &json!({"responseHeader": {"status": 0}})).is_ok());
        let err = check_status(400, &json!({"error": {"msg": "undefined field"}})).unwrap_err();
        assert!(err.to_string().contains("undefined field"));
        assert!(check_status(200, &json!({"responseHeader": {"status": 500}})).is_err());
    }

    #[test]
    fn test_version_field_dropped() {
        let doc = parse_document(json!({"id": "a", "_version_": 17, "title": "t"})).unwrap();
        assert!(doc.get(VERSION_FIELD).is_none());
        assert_eq!(doc.get("title"), Some(&json!("t")));
    }
}
