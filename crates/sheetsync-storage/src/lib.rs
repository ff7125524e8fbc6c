//! Snapshot cache + upstream resource fetching for sheetsync.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sheetsync_core::{CellValue, RawSnapshot, ResourceId, Row, SnapshotError};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Short-TTL key/value store with lazy eviction.
///
/// Expiry is only checked on `get`; expired entries stay resident until they
/// are read again or the cache is cleared.
#[derive(Debug)]
pub struct SnapshotCache<V> {
    items: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> SnapshotCache<V> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.items.lock().insert(key.into(), entry);
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut items = self.items.lock();
        let expired = match items.get(key) {
            None => return None,
            Some(entry) => Instant::now() > entry.expires_at,
        };
        if expired {
            items.remove(key);
            return None;
        }
        items.get(key).map(|entry| entry.value.clone())
    }

    pub fn delete(&self, key: &str) {
        self.items.lock().remove(key);
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Number of resident entries, expired ones included.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for SnapshotCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("resource {0} has no readable content")]
    EmptyResource(ResourceId),
    #[error("malformed upstream response: {0}")]
    Malformed(String),
    #[error("invalid snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// The only component that talks to the external system.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn read(&self, resource_id: &ResourceId) -> Result<RawSnapshot, UpstreamError>;
}

/// Produces a current snapshot for a resource.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, resource_id: &ResourceId) -> Result<Arc<RawSnapshot>, UpstreamError>;
}

/// Fetcher that memoizes upstream reads for a short TTL under `snapshot:<id>`.
pub struct CachingFetcher<U> {
    upstream: U,
    cache: SnapshotCache<Arc<RawSnapshot>>,
    ttl: Duration,
}

impl<U: UpstreamSource> CachingFetcher<U> {
    pub fn new(upstream: U, ttl: Duration) -> Self {
        Self {
            upstream,
            cache: SnapshotCache::new(),
            ttl,
        }
    }

    pub fn cache(&self) -> &SnapshotCache<Arc<RawSnapshot>> {
        &self.cache
    }
}

#[async_trait]
impl<U: UpstreamSource> ResourceFetcher for CachingFetcher<U> {
    async fn fetch(&self, resource_id: &ResourceId) -> Result<Arc<RawSnapshot>, UpstreamError> {
        let key = resource_id.snapshot_cache_key();
        if let Some(hit) = self.cache.get(&key) {
            debug!(resource_id = %resource_id, "snapshot cache hit");
            return Ok(hit);
        }

        let snapshot = Arc::new(
            self.upstream
                .read(resource_id)
                .instrument(info_span!("upstream_read", resource_id = %resource_id))
                .await?,
        );
        self.cache.set(key, snapshot.clone(), self.ttl);
        Ok(snapshot)
    }
}

#[derive(Debug, Clone)]
pub enum UpstreamCredentials {
    ApiKey(String),
    BearerToken(String),
    Anonymous,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub api_base: String,
    pub credentials: UpstreamCredentials,
    pub user_agent: Option<String>,
    pub timeout: Option<Duration>,
    pub snapshot_ttl: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: "https://sheets.googleapis.com".to_string(),
            credentials: UpstreamCredentials::Anonymous,
            user_agent: Some("sheetsync/0.1".to_string()),
            timeout: None,
            snapshot_ttl: DEFAULT_SNAPSHOT_TTL,
        }
    }
}

impl UpstreamConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let credentials = if let Ok(token) = std::env::var("SHEETSYNC_GOOGLE_ACCESS_TOKEN") {
            UpstreamCredentials::BearerToken(token)
        } else if let Ok(key) = std::env::var("SHEETSYNC_GOOGLE_API_KEY") {
            UpstreamCredentials::ApiKey(key)
        } else {
            UpstreamCredentials::Anonymous
        };
        Self {
            api_base: std::env::var("SHEETSYNC_SHEETS_API_BASE").unwrap_or(defaults.api_base),
            credentials,
            user_agent: std::env::var("SHEETSYNC_USER_AGENT")
                .ok()
                .or(defaults.user_agent),
            timeout: std::env::var("SHEETSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
            snapshot_ttl: std::env::var("SHEETSYNC_SNAPSHOT_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.snapshot_ttl),
        }
    }
}

/// Lazily resolved upstream handle for one spreadsheet; lives for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SheetHandle {
    title: String,
    sheet_title: String,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    properties: TitleProperties,
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: TitleProperties,
}

#[derive(Debug, Deserialize)]
struct TitleProperties {
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

/// Reads the first sheet of a Google spreadsheet through the Sheets v4 REST API.
#[derive(Debug)]
pub struct SheetsApiUpstream {
    client: reqwest::Client,
    base: Url,
    credentials: UpstreamCredentials,
    handles: tokio::sync::Mutex<HashMap<ResourceId, Arc<SheetHandle>>>,
}

impl SheetsApiUpstream {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        let base = Url::parse(&config.api_base)
            .with_context(|| format!("parsing sheets api base {}", config.api_base))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("sheets api base {} cannot carry a path", config.api_base);
        }

        Ok(Self {
            client,
            base,
            credentials: config.credentials.clone(),
            handles: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, UpstreamError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| UpstreamError::Malformed(format!("base url {} cannot carry a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn spreadsheet_url(&self, resource_id: &ResourceId) -> Result<Url, UpstreamError> {
        self.url(&["v4", "spreadsheets", resource_id.as_str()])
    }

    fn values_url(&self, resource_id: &ResourceId, sheet_title: &str) -> Result<Url, UpstreamError> {
        let range = format!("'{}'", sheet_title.replace('\'', "''"));
        self.url(&["v4", "spreadsheets", resource_id.as_str(), "values", &range])
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<T, UpstreamError> {
        let display_url = url.to_string();
        let mut request = self.client.get(url).query(query);
        request = match &self.credentials {
            UpstreamCredentials::ApiKey(key) => request.query(&[("key", key.as_str())]),
            UpstreamCredentials::BearerToken(token) => request.bearer_auth(token),
            UpstreamCredentials::Anonymous => request,
        };

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::HttpStatus {
                status: status.as_u16(),
                url: display_url,
            });
        }
        Ok(resp.json::<T>().await?)
    }

    async fn handle_for(&self, resource_id: &ResourceId) -> Result<Arc<SheetHandle>, UpstreamError> {
        if let Some(handle) = self.handles.lock().await.get(resource_id) {
            return Ok(handle.clone());
        }

        let meta: SpreadsheetMeta = self
            .get_json(
                self.spreadsheet_url(resource_id)?,
                &[("fields", "properties.title,sheets.properties.title")],
            )
            .await?;
        let sheet_title = meta
            .sheets
            .into_iter()
            .next()
            .map(|s| s.properties.title)
            .ok_or_else(|| UpstreamError::EmptyResource(resource_id.clone()))?;
        let handle = Arc::new(SheetHandle {
            title: meta.properties.title,
            sheet_title,
        });

        let mut handles = self.handles.lock().await;
        Ok(handles
            .entry(resource_id.clone())
            .or_insert(handle)
            .clone())
    }
}

#[async_trait]
impl UpstreamSource for SheetsApiUpstream {
    async fn read(&self, resource_id: &ResourceId) -> Result<RawSnapshot, UpstreamError> {
        let handle = self.handle_for(resource_id).await?;
        let range: ValueRange = self
            .get_json(self.values_url(resource_id, &handle.sheet_title)?, &[])
            .await?;
        debug!(resource_id = %resource_id, rows = range.values.len(), "read sheet values");
        snapshot_from_values(resource_id, &handle.title, &handle.sheet_title, range.values)
    }
}

fn cell_from_json(value: JsonValue) -> CellValue {
    match value {
        JsonValue::Null => CellValue::Null,
        JsonValue::Bool(b) => CellValue::Bool(b),
        JsonValue::Number(n) => CellValue::Number(n),
        JsonValue::String(s) => CellValue::Text(s),
        other => CellValue::Text(other.to_string()),
    }
}

fn header_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Build a snapshot from a values grid whose first row is the header row.
///
/// Columns with a blank header are skipped along with their cells. Cells past
/// the end of a short row are omitted from that row's mapping; cells beyond
/// the header width are ignored.
pub fn snapshot_from_values(
    resource_id: &ResourceId,
    title: &str,
    sheet_title: &str,
    values: Vec<Vec<JsonValue>>,
) -> Result<RawSnapshot, UpstreamError> {
    let mut grid = values.into_iter();
    let header_cells: Vec<String> = grid
        .next()
        .map(|row| row.iter().map(header_text).collect())
        .unwrap_or_default();
    let headers: Vec<String> = header_cells.iter().filter(|h| !h.is_empty()).cloned().collect();
    if headers.is_empty() {
        return Err(UpstreamError::EmptyResource(resource_id.clone()));
    }

    let rows = grid
        .map(|cells| {
            header_cells
                .iter()
                .zip(cells)
                .filter(|(header, _)| !header.is_empty())
                .map(|(header, cell)| (header.clone(), cell_from_json(cell)))
                .collect::<Row>()
        })
        .collect();

    Ok(RawSnapshot::new(title, sheet_title, headers, rows)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire_lazily() {
        let cache = SnapshotCache::new();
        cache.set("snapshot:S1", 7u32, Duration::from_secs(5));
        assert_eq!(cache.get("snapshot:S1"), Some(7));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.len(), 1, "expired entry stays until read");
        assert_eq!(cache.get("snapshot:S1"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn cache_delete_and_clear() {
        let cache = SnapshotCache::new();
        cache.set("a", "x".to_string(), Duration::from_secs(60));
        cache.set("b", "y".to_string(), Duration::from_secs(60));
        cache.delete("a");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b").as_deref(), Some("y"));
        cache.clear();
        assert!(cache.is_empty());
    }

    struct CountingUpstream {
        reads: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl UpstreamSource for CountingUpstream {
        async fn read(&self, resource_id: &ResourceId) -> Result<RawSnapshot, UpstreamError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(UpstreamError::EmptyResource(resource_id.clone()));
            }
            Ok(RawSnapshot::new("t", "s", vec!["A".into()], vec![]).expect("snapshot"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fetcher_collapses_reads_within_ttl() {
        let fetcher = CachingFetcher::new(
            CountingUpstream {
                reads: AtomicUsize::new(0),
                fail: false,
            },
            Duration::from_secs(5),
        );
        let id = ResourceId::from("S1");

        fetcher.fetch(&id).await.expect("first");
        fetcher.fetch(&id).await.expect("second");
        assert_eq!(fetcher.upstream.reads.load(Ordering::SeqCst), 1);
        assert!(fetcher.cache().get("snapshot:S1").is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        fetcher.fetch(&id).await.expect("third");
        assert_eq!(fetcher.upstream.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_failures_are_not_cached() {
        let fetcher = CachingFetcher::new(
            CountingUpstream {
                reads: AtomicUsize::new(0),
                fail: true,
            },
            Duration::from_secs(5),
        );
        let id = ResourceId::from("S1");
        assert!(fetcher.fetch(&id).await.is_err());
        assert!(fetcher.fetch(&id).await.is_err());
        assert_eq!(fetcher.upstream.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn values_grid_maps_rows_by_header() {
        let id = ResourceId::from("S1");
        let snapshot = snapshot_from_values(
            &id,
            "Budget",
            "Sheet1",
            vec![
                vec![json!("Name"), json!("Amount"), json!("Paid")],
                vec![json!("rent"), json!("1200"), json!(true)],
                vec![json!("food")],
            ],
        )
        .expect("snapshot");

        assert_eq!(snapshot.headers(), ["Name", "Amount", "Paid"]);
        assert_eq!(snapshot.rows().len(), 2);
        assert_eq!(snapshot.rows()[0]["Paid"], CellValue::Bool(true));
        assert_eq!(snapshot.rows()[1].len(), 1);
        assert!(!snapshot.rows()[1].contains_key("Amount"));
    }

    #[test]
    fn empty_grid_is_unreadable() {
        let id = ResourceId::from("S1");
        let err = snapshot_from_values(&id, "t", "s", vec![]).unwrap_err();
        assert!(matches!(err, UpstreamError::EmptyResource(_)));

        let err = snapshot_from_values(&id, "t", "s", vec![vec![json!("A"), json!("A")]]).unwrap_err();
        assert!(matches!(err, UpstreamError::Snapshot(SnapshotError::DuplicateHeader(_))));
    }

    #[test]
    fn blank_header_columns_are_skipped() {
        let id = ResourceId::from("S1");
        let snapshot = snapshot_from_values(
            &id,
            "Budget",
            "Sheet1",
            vec![
                vec![json!("Name"), json!(""), json!("Amount")],
                vec![json!("rent"), json!("x"), json!("1200")],
            ],
        )
        .expect("snapshot");

        assert_eq!(snapshot.headers(), ["Name", "Amount"]);
        assert_eq!(snapshot.rows()[0].len(), 2);
        assert_eq!(snapshot.rows()[0]["Amount"], CellValue::from("1200"));

        let err = snapshot_from_values(&id, "t", "s", vec![vec![json!(" "), json!(null)]]).unwrap_err();
        assert!(matches!(err, UpstreamError::EmptyResource(_)));
    }

    #[test]
    fn values_url_quotes_sheet_title() {
        let upstream = SheetsApiUpstream::new(&UpstreamConfig::default()).expect("client");
        let url = upstream
            .values_url(&ResourceId::from("abc123"), "Q1 Plan")
            .expect("url");
        assert_eq!(
            url.as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/abc123/values/'Q1%20Plan'"
        );
    }
}
