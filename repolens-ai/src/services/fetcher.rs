//! Paginated, retrying, rate-limited fetcher
//!
//! Every page request passes through the shared [`RateLimiter`] first.
//! Transient transport errors are retried with jittered exponential backoff;
//! once the retry budget is spent the kind fails with
//! [`FetchError::FetchFailed`], which degrades that kind only.
//!
//! Results are a lazy stream. Each [`FetchedPage`] carries the cursor that
//! restarts the sequence right after it.

use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::stream::{Stream, TryStreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::github_api::{Page, PageRequest, SourceApi, TransportError};
use super::rate_limiter::{RateLimitError, RateLimiter};
use crate::config::FetchConfig;
use crate::models::{RawRecord, ResourceKind};
use crate::utils::BackoffPolicy;

/// Fetch errors, scoped to one resource kind
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    #[error("Fetching {kind} failed after {attempts} attempts: {last_error}")]
    FetchFailed {
        kind: ResourceKind,
        attempts: u32,
        last_error: String,
    },

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error("Fetch cancelled")]
    Cancelled,
}

/// Where a fetch starts
///
/// `since` selects incremental sync for kinds that support it; `page`
/// resumes a previous sequence. Both absent means a full fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchCursor {
    pub since: Option<DateTime<Utc>>,
    pub page: Option<String>,
}

impl FetchCursor {
    pub fn since(since: Option<DateTime<Utc>>) -> Self {
        Self { since, page: None }
    }
}

/// One fetched page and the cursor that continues after it
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub records: Vec<RawRecord>,
    /// `None` once the sequence is complete
    pub resume: Option<FetchCursor>,
}

/// Shared fetcher; clone the `Arc`s, not the struct
pub struct Fetcher {
    api: Arc<dyn SourceApi>,
    limiter: Arc<RateLimiter>,
    backoff: BackoffPolicy,
    max_pages: u32,
}

impl Fetcher {
    pub fn new(api: Arc<dyn SourceApi>, limiter: Arc<RateLimiter>, config: &FetchConfig) -> Self {
        Self {
            api,
            limiter,
            backoff: BackoffPolicy::from_config(config),
            max_pages: config.max_pages.max(1),
        }
    }

    pub fn with_policy(
        api: Arc<dyn SourceApi>,
        limiter: Arc<RateLimiter>,
        backoff: BackoffPolicy,
        max_pages: u32,
    ) -> Self {
        Self {
            api,
            limiter,
            backoff,
            max_pages: max_pages.max(1),
        }
    }

    /// Lazy page sequence for one `(repository, kind)`
    ///
    /// Ends when upstream reports no next page or after `max_pages` pages.
    /// The cancel token is checked at every page boundary.
    pub fn pages<'a>(
        &'a self,
        owner: &'a str,
        name: &'a str,
        kind: ResourceKind,
        cursor: FetchCursor,
        cancel: &'a CancellationToken,
    ) -> impl Stream<Item = Result<FetchedPage, FetchError>> + Send + 'a {
        try_stream! {
            let since = cursor.since;
            let mut page_cursor = cursor.page;
            let mut pages_read = 0u32;

            loop {
                if cancel.is_cancelled() {
                    Err(FetchError::Cancelled)?;
                }

                let request = PageRequest {
                    owner,
                    name,
                    kind,
                    cursor: page_cursor.as_deref(),
                    since,
                };
                let page = self.fetch_page_with_retry(&request, cancel).await?;
                pages_read += 1;

                let capped = pages_read >= self.max_pages;
                if capped && page.next_cursor.is_some() {
                    info!(
                        repository = %format!("{}/{}", owner, name),
                        kind = %kind,
                        max_pages = self.max_pages,
                        "Page cap reached, stopping pagination"
                    );
                }

                let next = if capped { None } else { page.next_cursor };
                let resume = next.clone().map(|page| FetchCursor { since, page: Some(page) });
                yield FetchedPage { records: page.records, resume };

                match next {
                    Some(next) => page_cursor = Some(next),
                    None => break,
                }
            }
        }
    }

    /// Lazy record sequence for one `(repository, kind)`
    pub fn fetch<'a>(
        &'a self,
        owner: &'a str,
        name: &'a str,
        kind: ResourceKind,
        cursor: FetchCursor,
        cancel: &'a CancellationToken,
    ) -> impl Stream<Item = Result<RawRecord, FetchError>> + Send + 'a {
        try_stream! {
            let pages = self.pages(owner, name, kind, cursor, cancel);
            futures::pin_mut!(pages);
            while let Some(page) = pages.try_next().await? {
                for record in page.records {
                    yield record;
                }
            }
        }
    }

    /// Drain [`fetch`](Self::fetch) into memory
    pub async fn fetch_all(
        &self,
        owner: &str,
        name: &str,
        kind: ResourceKind,
        cursor: FetchCursor,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let records: Vec<RawRecord> = self
            .fetch(owner, name, kind, cursor, cancel)
            .try_collect()
            .await?;

        debug!(
            repository = %format!("{}/{}", owner, name),
            kind = %kind,
            records = records.len(),
            "Fetch complete"
        );
        Ok(records)
    }

    async fn fetch_page_with_retry(
        &self,
        request: &PageRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Page, FetchError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.limiter.acquire(1).await?;

            let err = match self.api.fetch_page(request).await {
                Ok(page) => {
                    self.limiter
                        .observe_quota(page.quota.remaining, page.quota.reset_at);
                    return Ok(page);
                }
                Err(err) => err,
            };

            if let TransportError::RateLimited { reset_at } = &err {
                self.limiter.observe_quota(Some(0), *reset_at);
            }

            if !err.is_transient() || !self.backoff.should_retry(attempt) {
                warn!(
                    kind = %request.kind,
                    attempts = attempt,
                    error = %err,
                    "Fetch failed"
                );
                return Err(FetchError::FetchFailed {
                    kind: request.kind,
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let delay = self.backoff.delay(attempt);
            warn!(
                kind = %request.kind,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient fetch error, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted [`SourceApi`] used by fetcher, orchestrator and API tests

    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Serves fixed pages per kind; kinds listed in `failing` always fail
    #[derive(Default)]
    pub struct ScriptedApi {
        pages: HashMap<ResourceKind, Vec<Vec<RawRecord>>>,
        failing: HashMap<ResourceKind, TransportError>,
        delay: std::time::Duration,
        pub calls: AtomicU32,
        pub requested_cursors: Mutex<Vec<Option<String>>>,
        pub requested_since: Mutex<Vec<Option<DateTime<Utc>>>>,
    }

    impl ScriptedApi {
        pub fn with_pages(mut self, kind: ResourceKind, pages: Vec<Vec<RawRecord>>) -> Self {
            self.pages.insert(kind, pages);
            self
        }

        pub fn failing(mut self, kind: ResourceKind, error: TransportError) -> Self {
            self.failing.insert(kind, error);
            self
        }

        /// Sleep before answering each page
        pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl SourceApi for ScriptedApi {
        async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested_cursors
                .lock()
                .unwrap()
                .push(request.cursor.map(str::to_string));
            self.requested_since.lock().unwrap().push(request.since);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            if let Some(err) = self.failing.get(&request.kind) {
                return Err(err.clone());
            }

            let pages = self.pages.get(&request.kind).cloned().unwrap_or_default();
            let index: usize = request.cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let records = pages.get(index).cloned().unwrap_or_default();
            let next_cursor = (index + 1 < pages.len()).then(|| (index + 1).to_string());

            Ok(Page {
                records,
                next_cursor,
                quota: Default::default(),
            })
        }
    }

    pub fn record(kind: ResourceKind, payload: serde_json::Value) -> RawRecord {
        RawRecord {
            kind,
            source_timestamp: None,
            payload,
        }
    }

    pub fn fast_limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::with_clock(
            1_000_000,
            10_000,
            std::time::Duration::from_secs(5),
            governor::clock::DefaultClock::default(),
        ))
    }
}
