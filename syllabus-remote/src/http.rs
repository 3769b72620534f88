//! Strapi-style REST backend.
//!
//! Records live in one collection at `{base_url}/api/{collection}` with the
//! attributes `content_id`, `path`, `body`, and `version`. Strapi has no
//! native optimistic concurrency, so `version` is compared before every
//! write and bumped by the writer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use syllabus_core::canonical;
use syllabus_core::config::StrapiConfig;
use syllabus_core::types::{ContentId, ContentPayload, ExternalId, RemoteRecord, Version};

use crate::client::{Cursor, Page, RemoteClient};
use crate::error::RemoteError;

const USER_AGENT: &str = concat!("syllabus/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: Vec<Entry>,
    #[serde(default)]
    meta: Meta,
}

#[derive(Debug, Deserialize)]
struct SingleResponse {
    data: Entry,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    page: u32,
    page_count: u32,
}

#[derive(Debug, Deserialize)]
struct Entry {
    id: u64,
    attributes: Attributes,
}

#[derive(Debug, Deserialize)]
struct Attributes {
    #[serde(default)]
    content_id: Option<String>,
    path: String,
    #[serde(default)]
    body: String,
    #[serde(default = "first_version")]
    version: u64,
    #[serde(rename = "updatedAt")]
    updated_at: DateTime<Utc>,
}

fn first_version() -> u64 {
    1
}

impl Entry {
    fn into_record(self) -> Result<RemoteRecord, RemoteError> {
        let id = self.id;
        let Attributes {
            content_id,
            path,
            body,
            version,
            updated_at,
        } = self.attributes;
        let schema = |e: syllabus_core::ContentError| {
            RemoteError::Permanent(format!("entry {id} failed validation: {e}"))
        };
        canonical::validate_path(&path).map_err(schema)?;
        let body = canonical::normalize_body(&body);
        let content_id = match content_id {
            Some(id) if !id.trim().is_empty() => ContentId(id),
            _ => canonical::derive_id(&path, &body).map_err(schema)?,
        };
        let content_hash = canonical::content_hash(&path, &body).map_err(schema)?;
        Ok(RemoteRecord {
            external_id: ExternalId(id.to_string()),
            content_id,
            path,
            content_hash,
            remote_modified_at: updated_at,
            version: Version(version),
            body: Some(body),
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct StrapiRemote {
    agent: ureq::Agent,
    endpoint: String,
    token: Option<String>,
    page_size: u32,
}

impl StrapiRemote {
    pub fn new(config: &StrapiConfig, token: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build();
        let endpoint = format!(
            "{}/api/{}",
            config.base_url.trim_end_matches('/'),
            config.collection
        );
        Self {
            agent,
            endpoint,
            token,
            page_size: config.page_size.max(1),
        }
    }

    /// Build from config, reading the token from the configured variable.
    pub fn from_env(config: &StrapiConfig) -> Self {
        let token = std::env::var(&config.token_env).ok().filter(|t| !t.is_empty());
        if token.is_none() {
            tracing::warn!(var = %config.token_env, "no CMS token set; requests are unauthenticated");
        }
        Self::new(config, token)
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let req = self
            .agent
            .request(method, url)
            .set("Accept", "application/json");
        match &self.token {
            Some(token) => req.set("Authorization", &format!("Bearer {token}")),
            None => req,
        }
    }

    fn item_url(&self, external_id: &ExternalId) -> String {
        format!("{}/{}", self.endpoint, external_id)
    }

    fn find_by_content_id(&self, key: &ContentId) -> Result<Option<RemoteRecord>, RemoteError> {
        let resp = self
            .request("GET", &self.endpoint)
            .query("filters[content_id][$eq]", key.as_str())
            .query("pagination[pageSize]", "1")
            .call()
            .map_err(classify)?;
        let list: ListResponse = read_json(resp)?;
        list.data.into_iter().next().map(Entry::into_record).transpose()
    }
}

impl RemoteClient for StrapiRemote {
    fn backend(&self) -> &'static str {
        "strapi"
    }

    fn list_since(&self, cursor: Option<&Cursor>) -> Result<Page, RemoteError> {
        let page = match cursor {
            Some(c) => c
                .0
                .parse::<u32>()
                .map_err(|_| RemoteError::Permanent(format!("invalid page cursor '{c}'")))?,
            None => 1,
        };
        tracing::debug!(endpoint = %self.endpoint, page, "listing remote page");
        let resp = self
            .request("GET", &self.endpoint)
            .query("pagination[page]", &page.to_string())
            .query("pagination[pageSize]", &self.page_size.to_string())
            .query("sort", "id:asc")
            .call()
            .map_err(classify)?;
        let list: ListResponse = read_json(resp)?;
        let next = match list.meta.pagination {
            Some(p) if p.page < p.page_count => Some(Cursor((p.page + 1).to_string())),
            _ => None,
        };
        let records = list
            .data
            .into_iter()
            .map(Entry::into_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page { records, next })
    }

    fn fetch(&self, external_id: &ExternalId) -> Result<RemoteRecord, RemoteError> {
        match self.request("GET", &self.item_url(external_id)).call() {
            Ok(resp) => read_json::<SingleResponse>(resp)?.data.into_record(),
            Err(ureq::Error::Status(404, _)) => Err(RemoteError::NotFound(external_id.clone())),
            Err(e) => Err(classify(e)),
        }
    }

    fn create(
        &self,
        key: &ContentId,
        payload: &ContentPayload,
    ) -> Result<RemoteRecord, RemoteError> {
        if let Some(existing) = self.find_by_content_id(key)? {
            tracing::debug!(id = %key, external_id = %existing.external_id, "create replayed");
            return Ok(existing);
        }
        let resp = self
            .request("POST", &self.endpoint)
            .set("Idempotency-Key", key.as_str())
            .send_json(json!({
                "data": {
                    "content_id": key.as_str(),
                    "path": payload.path,
                    "body": payload.body,
                    "version": 1,
                }
            }))
            .map_err(classify)?;
        read_json::<SingleResponse>(resp)?.data.into_record()
    }

    fn update(
        &self,
        external_id: &ExternalId,
        payload: &ContentPayload,
        expected: Version,
    ) -> Result<Version, RemoteError> {
        let current = self.fetch(external_id)?;
        if current.version != expected {
            return Err(stale(external_id, expected, Ok(current)));
        }
        let next = expected.next();
        let result = self
            .request("PUT", &self.item_url(external_id))
            .set("If-Match", &expected.0.to_string())
            .send_json(json!({
                "data": {
                    "path": payload.path,
                    "body": payload.body,
                    "version": next.0,
                }
            }));
        match result {
            Ok(_) => Ok(next),
            Err(ureq::Error::Status(404, _)) => Err(RemoteError::NotFound(external_id.clone())),
            Err(ureq::Error::Status(409 | 412, _)) => {
                Err(stale(external_id, expected, self.fetch(external_id)))
            }
            Err(e) => Err(classify(e)),
        }
    }

    fn delete(&self, external_id: &ExternalId) -> Result<(), RemoteError> {
        match self.request("DELETE", &self.item_url(external_id)).call() {
            Ok(_) | Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_json<T: serde::de::DeserializeOwned>(resp: ureq::Response) -> Result<T, RemoteError> {
    resp.into_json()
        .map_err(|e| RemoteError::Permanent(format!("unexpected response body: {e}")))
}

/// Version conflict against the version the store reports now. A failed
/// refetch is surfaced instead.
fn stale(
    external_id: &ExternalId,
    expected: Version,
    current: Result<RemoteRecord, RemoteError>,
) -> RemoteError {
    match current {
        Ok(record) => RemoteError::VersionConflict {
            external_id: external_id.clone(),
            expected,
            actual: record.version,
        },
        Err(e) => e,
    }
}

/// Map a ureq failure onto the retry taxonomy.
fn classify(err: ureq::Error) -> RemoteError {
    match err {
        ureq::Error::Status(code, _) => classify_status(code),
        ureq::Error::Transport(t) => RemoteError::Transient(format!("transport error: {t}")),
    }
}

fn classify_status(code: u16) -> RemoteError {
    match code {
        408 | 425 | 429 | 500..=599 => RemoteError::Transient(format!("HTTP {code}")),
        401 | 403 => RemoteError::Permanent(format!("authentication rejected (HTTP {code})")),
        400 | 422 => RemoteError::Permanent(format!("payload rejected by schema (HTTP {code})")),
        _ => RemoteError::Permanent(format!("HTTP {code}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(429, true)]
    #[case(503, true)]
    #[case(408, true)]
    #[case(401, false)]
    #[case(422, false)]
    #[case(418, false)]
    fn status_classification(#[case] code: u16, #[case] retryable: bool) {
        assert_eq!(classify_status(code).is_retryable(), retryable);
    }

    #[test]
    fn list_response_maps_to_records() {
        let raw = r##"{
            "data": [
                {"id": 7, "attributes": {"content_id": "lesson-1", "path": "curriculum/l1.md",
                  "body": "# L1\r\n", "version": 3, "updatedAt": "2024-03-01T10:00:00.000Z"}},
                {"id": 8, "attributes": {"path": "curriculum/l2.md",
                  "body": "# L2\n", "updatedAt": "2024-03-02T10:00:00.000Z"}}
            ],
            "meta": {"pagination": {"page": 1, "pageSize": 2, "pageCount": 2, "total": 3}}
        }"##;
        let list: ListResponse = serde_json::from_str(raw).expect("parse");
        let p = list.meta.pagination.as_ref().expect("pagination");
        assert_eq!((p.page, p.page_count), (1, 2));

        let records: Vec<RemoteRecord> = list
            .data
            .into_iter()
            .map(Entry::into_record)
            .collect::<Result<_, _>>()
            .expect("records");
        assert_eq!(records[0].external_id.as_str(), "7");
        assert_eq!(records[0].content_id.as_str(), "lesson-1");
        assert_eq!(records[0].version, Version(3));
        assert_eq!(records[0].body.as_deref(), Some("# L1\n"));
        assert_eq!(records[1].content_id.as_str(), "curriculum/l2");
        assert_eq!(records[1].version, Version(1));
    }

    #[test]
    fn conflict_reports_the_refetched_version() {
        let raw = r#"{"data": {"id": 7, "attributes": {"content_id": "intro", "path": "intro.md",
            "body": "x\n", "version": 5, "updatedAt": "2024-03-01T10:00:00.000Z"}}}"#;
        let single: SingleResponse = serde_json::from_str(raw).expect("parse");
        let ext = ExternalId::from("7");

        let err = stale(&ext, Version(3), single.data.into_record());
        assert!(matches!(
            err,
            RemoteError::VersionConflict { expected: Version(3), actual: Version(5), .. }
        ));

        let gone = stale(&ext, Version(3), Err(RemoteError::NotFound(ext.clone())));
        assert!(matches!(gone, RemoteError::NotFound(_)));
    }

    #[test]
    fn unsafe_remote_path_is_a_schema_error() {
        let entry = Entry {
            id: 1,
            attributes: Attributes {
                content_id: None,
                path: "../etc/passwd".to_string(),
                body: String::new(),
                version: 1,
                updated_at: Utc::now(),
            },
        };
        assert!(matches!(entry.into_record(), Err(RemoteError::Permanent(_))));
    }

    #[test]
    fn unreachable_server_is_transient() {
        let config = StrapiConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            collection: "lessons".to_string(),
            token_env: "SYLLABUS_TEST_UNSET_TOKEN".to_string(),
            page_size: 10,
            timeout_secs: 2,
        };
        let remote = StrapiRemote::new(&config, None);
        let err = remote.list_since(None).unwrap_err();
        assert!(err.is_retryable(), "got: {err}");
    }
}
