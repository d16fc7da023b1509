//! Client for the Insightly v3.1 REST API.
//!
//! Authenticates with HTTP Basic auth, API key as the username and an empty
//! password. List endpoints are paged with `skip`/`top`; the total is read
//! from the `X-Total-Count` header of a `count_total=true` request.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::ApiError;

/// One Insightly entity as returned by the API
pub type Record = Map<String, Value>;

const TOTAL_COUNT_HEADER: &str = "X-Total-Count";

/// Maximum number of retries for rate-limited (429) or timed-out requests.
const MAX_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for retries.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Number of pages needed to cover `total` records at `top` per page
pub fn page_count(total: usize, top: usize) -> usize {
    if top == 0 {
        return 0;
    }
    total.div_ceil(top)
}

/// Join the non-empty `fields` of `record` with a space
pub fn display_name(record: &Record, fields: &[String]) -> String {
    fields
        .iter()
        .filter_map(|field| match record.get(field)? {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct InsightlyClient {
    client: Client,
    base_url: String,
    api_key: String,
    page_size: usize,
    max_concurrent_pages: usize,
    initial_backoff: Duration,
}

impl InsightlyClient {
    pub fn new(client: Client, base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            page_size: 500,
            max_concurrent_pages: 10,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    pub fn with_paging(mut self, page_size: usize, max_concurrent_pages: usize) -> Self {
        self.page_size = page_size.max(1);
        self.max_concurrent_pages = max_concurrent_pages.max(1);
        self
    }

    /// Override the first rate-limit backoff delay
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    fn endpoint_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// GET with exponential backoff on 429, timeouts and refused connections.
    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Response, ApiError> {
        let url = self.endpoint_url(path);
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let sent = self
                .client
                .get(&url)
                .basic_auth(&self.api_key, None::<&str>)
                .query(query)
                .send()
                .await;

            let last_error = match sent {
                Ok(response) if response.status() != StatusCode::TOO_MANY_REQUESTS => {
                    return ApiError::check(response).await;
                }
                Ok(_) => ApiError::RateLimited,
                Err(e) if e.is_timeout() || e.is_connect() => ApiError::Network(e),
                Err(e) => return Err(e.into()),
            };

            retries += 1;
            if retries > MAX_RETRIES {
                return Err(last_error);
            }
            warn!(
                url = %url,
                retry = retries,
                backoff_ms = backoff.as_millis() as u64,
                error = %last_error,
                "Request failed, backing off"
            );
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    /// Total number of records for an entity
    pub async fn count(&self, entity: &str) -> Result<usize, ApiError> {
        let response = self
            .get(
                entity,
                &[("top", "1".to_string()), ("count_total", "true".to_string())],
            )
            .await?;

        let header = response
            .headers()
            .get(TOTAL_COUNT_HEADER)
            .ok_or_else(|| {
                ApiError::InvalidResponse(format!("{} response has no {} header", entity, TOTAL_COUNT_HEADER))
            })?;

        header
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| {
                ApiError::InvalidResponse(format!("Invalid {} header: {:?}", TOTAL_COUNT_HEADER, header))
            })
    }

    /// Fetch one page starting at `skip`
    pub async fn fetch_page(&self, entity: &str, skip: usize) -> Result<Vec<Record>, ApiError> {
        let response = self
            .get(
                entity,
                &[
                    ("skip", skip.to_string()),
                    ("top", self.page_size.to_string()),
                    ("brief", "false".to_string()),
                ],
            )
            .await?;

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse {} page at skip {}: {}", entity, skip, e))
        })
    }

    /// Fetch a single record by id
    pub async fn fetch_one(&self, entity: &str, id: &str) -> Result<Record, ApiError> {
        let response = self.get(&format!("{}/{}", entity, id), &[]).await?;
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse {} {}: {}", entity, id, e)))
    }

    /// Resolve display names for `ids`, at most `concurrency` requests at a time.
    ///
    /// A record that cannot be fetched maps to an empty name; the export is
    /// still delivered without it.
    pub async fn lookup_names(
        &self,
        entity: &str,
        ids: HashSet<String>,
        name_fields: &[String],
        concurrency: usize,
    ) -> HashMap<String, String> {
        stream::iter(ids)
            .map(|id| async move {
                let name = match self.fetch_one(entity, &id).await {
                    Ok(record) => display_name(&record, name_fields),
                    Err(e) => {
                        warn!(entity, id = %id, error = %e, "Lookup failed");
                        String::new()
                    }
                };
                (id, name)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }

    /// Fetch every record of an entity, pages in parallel.
    ///
    /// Records come back in page order. Any page failure fails the whole
    /// entity so a partial export is never delivered.
    pub async fn fetch_all(&self, entity: &str) -> Result<Vec<Record>, ApiError> {
        let started = std::time::Instant::now();
        let total = self.count(entity).await?;
        let pages = page_count(total, self.page_size);
        debug!(entity, total, pages, "Fetching pages");

        let chunks: Vec<Vec<Record>> = stream::iter(0..pages)
            .map(|page| self.fetch_page(entity, page * self.page_size))
            .buffered(self.max_concurrent_pages)
            .try_collect()
            .await?;

        let records: Vec<Record> = chunks.into_iter().flatten().collect();
        if records.len() != total {
            warn!(entity, expected = total, received = records.len(), "Record count changed during fetch");
        }
        info!(
            entity,
            count = records.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched records"
        );
        Ok(records)
    }
}
