mod error;
pub mod probe;
pub mod uploader;

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use tether_proto::{LocationSample, StoredSample};
use tracing::debug;

pub use error::UploadError;
pub use uploader::{RetryPolicy, SampleUploader, Uploader};

const LOCATIONS_TABLE: &str = "locations";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Project base URL, e.g. `https://xyz.example.co` (no trailing path).
    pub base_url: String,
    pub api_key: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl StoreConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP client for the remote `locations` resource. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StoreClient {
    http: reqwest::Client,
    locations_url: String,
}

impl StoreClient {
    pub fn new(cfg: &StoreConfig) -> Result<Self, UploadError> {
        let key = HeaderValue::from_str(&cfg.api_key)
            .map_err(|_| UploadError::Config("api key is not a valid header value".into()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", cfg.api_key))
            .map_err(|_| UploadError::Config("api key is not a valid header value".into()))?;

        let mut headers = HeaderMap::new();
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(cfg.connect_timeout)
            .timeout(cfg.request_timeout)
            .build()?;

        Ok(Self {
            http,
            locations_url: format!(
                "{}/rest/v1/{}",
                cfg.base_url.trim_end_matches('/'),
                LOCATIONS_TABLE
            ),
        })
    }

    /// Inserts one sample, expecting the store to echo the inserted row.
    pub async fn insert(&self, sample: &LocationSample) -> Result<StoredSample, UploadError> {
        let resp = self
            .http
            .post(&self.locations_url)
            .header("Prefer", "return=representation")
            .json(sample)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            let rows: Vec<StoredSample> = match resp.json().await {
                Ok(rows) => rows,
                Err(_) => return Err(UploadError::EmptyResponse),
            };
            return rows.into_iter().next().ok_or(UploadError::EmptyResponse);
        }

        if UploadError::is_terminal_status(status.as_u16()) {
            let detail = resp.text().await.unwrap_or_default();
            return Err(UploadError::Terminal { status: status.as_u16(), detail });
        }
        Err(UploadError::RetryableStatus { status: status.as_u16() })
    }

    /// Most recent row for one child, by server-assigned creation time.
    pub async fn latest(&self, child_id: &str) -> Result<Option<StoredSample>, UploadError> {
        debug!("store: fetching latest row for {}", child_id);
        let resp = self
            .http
            .get(&self.locations_url)
            .query(&[
                ("child_id", format!("eq.{child_id}").as_str()),
                ("order", "created_at.desc"),
                ("limit", "1"),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            if UploadError::is_terminal_status(status.as_u16()) {
                let detail = resp.text().await.unwrap_or_default();
                return Err(UploadError::Terminal { status: status.as_u16(), detail });
            }
            return Err(UploadError::RetryableStatus { status: status.as_u16() });
        }

        let rows: Vec<StoredSample> = resp.json().await?;
        Ok(rows.into_iter().next())
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn locations_url(&self) -> &str {
        &self.locations_url
    }
}
