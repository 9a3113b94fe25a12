//! Source-control transport
//!
//! [`SourceApi`] is the seam between the fetcher and the upstream HTTP API:
//! one call fetches one page of one resource kind. [`GithubApi`] implements
//! it against the GitHub REST v3 API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, LINK};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::GithubConfig;
use crate::models::{RawRecord, ResourceKind};

/// Transport-level failures for a single page request
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Upstream server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Upstream quota exhausted")]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    #[error("Upstream rejected request {status}: {message}")]
    Client { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout
                | TransportError::Network(_)
                | TransportError::Server { .. }
                | TransportError::RateLimited { .. }
        )
    }
}

/// Upstream quota as reported on the last response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaInfo {
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
}

/// One page request
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest<'a> {
    pub owner: &'a str,
    pub name: &'a str,
    pub kind: ResourceKind,
    /// Opaque continuation from the previous page; `None` for the first page
    pub cursor: Option<&'a str>,
    /// Incremental watermark, ignored by kinds that do not support it
    pub since: Option<DateTime<Utc>>,
}

/// One page of raw records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// `None` when upstream reports no further pages
    pub next_cursor: Option<String>,
    pub quota: QuotaInfo,
}

#[async_trait]
pub trait SourceApi: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, TransportError>;
}

/// GitHub REST v3 client
pub struct GithubApi {
    http_client: reqwest::Client,
    api_base: String,
    per_page: u32,
}

impl GithubApi {
    pub fn new(config: &GithubConfig, token: Option<String>) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static("2022-11-28"),
        );
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| TransportError::Client {
                    status: 0,
                    message: "token contains invalid header characters".to_string(),
                })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(repolens_common::config::get_user_agent);

        let http_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            per_page: config.per_page,
        })
    }

    /// First-page URL for a resource kind
    fn first_page_url(&self, request: &PageRequest<'_>) -> String {
        let base = format!("{}/repos/{}/{}", self.api_base, request.owner, request.name);
        let mut url = match request.kind {
            ResourceKind::Commits => format!("{}/commits?per_page={}", base, self.per_page),
            ResourceKind::Issues => {
                format!("{}/issues?state=all&per_page={}", base, self.per_page)
            }
            ResourceKind::PullRequests => {
                format!("{}/pulls?state=all&per_page={}", base, self.per_page)
            }
            ResourceKind::Contributors => {
                format!("{}/contributors?per_page={}", base, self.per_page)
            }
            ResourceKind::Releases => format!("{}/releases?per_page={}", base, self.per_page),
            ResourceKind::Languages => return format!("{}/languages", base),
        };

        if let Some(since) = request.since.filter(|_| request.kind.supports_since()) {
            url.push_str("&since=");
            url.push_str(&since.format("%Y-%m-%dT%H:%M:%SZ").to_string());
        }
        url
    }
}

#[async_trait]
impl SourceApi for GithubApi {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, TransportError> {
        let url = match request.cursor {
            Some(cursor) => cursor.to_string(),
            None => self.first_page_url(request),
        };

        debug!(kind = %request.kind, url = %url, "Requesting page");

        let response = self.http_client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        let quota = parse_quota(response.headers());
        let next_cursor = response
            .headers()
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_next_link);

        if status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::FORBIDDEN && quota.remaining == Some(0))
        {
            return Err(TransportError::RateLimited {
                reset_at: quota.reset_at,
            });
        }

        // Empty repositories answer 409 on the commits listing
        if status == StatusCode::CONFLICT && request.kind == ResourceKind::Commits {
            return Ok(Page {
                records: Vec::new(),
                next_cursor: None,
                quota,
            });
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                TransportError::Server {
                    status: status.as_u16(),
                    message,
                }
            } else {
                TransportError::Client {
                    status: status.as_u16(),
                    message,
                }
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;

        Ok(Page {
            records: records_from_body(request.kind, body)?,
            next_cursor,
            quota,
        })
    }
}

/// Split a response body into raw records
///
/// Pull requests also appear in the issues listing; those are dropped so
/// each item is counted under exactly one kind.
pub fn records_from_body(kind: ResourceKind, body: Value) -> Result<Vec<RawRecord>, TransportError> {
    if kind.is_single_document() {
        if !body.is_object() {
            return Err(TransportError::Decode(format!(
                "expected object for {}",
                kind
            )));
        }
        return Ok(vec![RawRecord {
            kind,
            source_timestamp: None,
            payload: body,
        }]);
    }

    let Value::Array(items) = body else {
        return Err(TransportError::Decode(format!("expected array for {}", kind)));
    };

    Ok(items
        .into_iter()
        .filter(|item| !(kind == ResourceKind::Issues && item.get("pull_request").is_some()))
        .map(|payload| RawRecord {
            kind,
            source_timestamp: source_timestamp(kind, &payload),
            payload,
        })
        .collect())
}

fn source_timestamp(kind: ResourceKind, payload: &Value) -> Option<DateTime<Utc>> {
    let raw = match kind {
        ResourceKind::Commits => payload.pointer("/commit/author/date"),
        ResourceKind::Issues | ResourceKind::PullRequests => payload
            .get("updated_at")
            .filter(|v| !v.is_null())
            .or_else(|| payload.get("created_at")),
        ResourceKind::Releases => payload.get("published_at"),
        ResourceKind::Contributors | ResourceKind::Languages => None,
    }?;

    raw.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Extract the `rel="next"` target from a `Link` header
pub fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|p| {
            let p = p.trim();
            p == "rel=\"next\"" || p == "rel=next"
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

/// Read `x-ratelimit-remaining` / `x-ratelimit-reset`
pub fn parse_quota(headers: &HeaderMap) -> QuotaInfo {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    QuotaInfo {
        remaining: header("x-ratelimit-remaining").and_then(|v| v.trim().parse().ok()),
        reset_at: header("x-ratelimit-reset")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_next_link() {
        let header = r#"<https://api.github.com/repositories/1/issues?page=2>; rel="next", <https://api.github.com/repositories/1/issues?page=5>; rel="last""#;
        assert_eq!(
            parse_next_link(header).as_deref(),
            Some("https://api.github.com/repositories/1/issues?page=2")
        );
    }

    #[test]
    fn test_parse_next_link_on_last_page() {
        let header = r#"<https://api.github.com/repositories/1/issues?page=1>; rel="prev", <https://api.github.com/repositories/1/issues?page=1>; rel="first""#;
        assert_eq!(parse_next_link(header), None);
        assert_eq!(parse_next_link(""), None);
    }

    #[test]
    fn test_parse_quota() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1700000000"));

        let quota = parse_quota(&headers);
        assert_eq!(quota.remaining, Some(0));
        assert_eq!(quota.reset_at.map(|t| t.timestamp()), Some(1_700_000_000));

        assert_eq!(parse_quota(&HeaderMap::new()), QuotaInfo::default());
    }

    #[test]
    fn test_issue_listing_drops_pull_requests() {
        let body = json!([
            {"number": 1, "title": "bug", "created_at": "2024-01-01T00:00:00Z"},
            {"number": 2, "title": "pr", "pull_request": {"url": "x"}},
        ]);

        let records = records_from_body(ResourceKind::Issues, body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload["number"], 1);
        assert!(records[0].source_timestamp.is_some());
    }

    #[test]
    fn test_commit_timestamp_from_nested_author() {
        let body = json!([{"sha": "abc", "commit": {"author": {"date": "2024-03-05T10:00:00Z"}}}]);
        let records = records_from_body(ResourceKind::Commits, body).unwrap();
        assert_eq!(
            records[0].source_timestamp.map(|t| t.to_rfc3339()),
            Some("2024-03-05T10:00:00+00:00".to_string())
        );
    }

    #[test]
    fn test_languages_single_document() {
        let records =
            records_from_body(ResourceKind::Languages, json!({"Rust": 1000, "Shell": 20})).unwrap();
        assert_eq!(records.len(), 1);

        let err = records_from_body(ResourceKind::Languages, json!([])).unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
    }

    #[test]
    fn test_first_page_url() {
        let api = GithubApi::new(&GithubConfig::default(), None).unwrap();
        let since = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);

        let request = PageRequest {
            owner: "acme",
            name: "widgets",
            kind: ResourceKind::Commits,
            cursor: None,
            since: Some(since),
        };
        assert_eq!(
            api.first_page_url(&request),
            "https://api.github.com/repos/acme/widgets/commits?per_page=100&since=2024-01-02T03:04:05Z"
        );

        // Contributors have no incremental mode
        let request = PageRequest {
            kind: ResourceKind::Contributors,
            ..request
        };
        assert_eq!(
            api.first_page_url(&request),
            "https://api.github.com/repos/acme/widgets/contributors?per_page=100"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Server {
            status: 502,
            message: String::new()
        }
        .is_transient());
        assert!(!TransportError::Client {
            status: 404,
            message: String::new()
        }
        .is_transient());
        assert!(!TransportError::Decode("x".into()).is_transient());
    }
}
