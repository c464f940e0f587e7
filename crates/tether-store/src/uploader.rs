use std::time::Duration;

use async_trait::async_trait;
use tether_proto::{LocationSample, StoredSample};
use tracing::{debug, warn};

use crate::{StoreClient, UploadError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

// Fixed delay rather than backoff: attempts are already bounded by the
// request timeout and real samples arrive tens of seconds apart.
impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, retry_delay: Duration::from_secs(2) }
    }
}

/// The seam the supervisor delivers samples through.
#[async_trait]
pub trait SampleUploader: Send + Sync + 'static {
    async fn upload(&self, sample: LocationSample) -> Result<StoredSample, UploadError>;
}

/// Bounded-retry delivery of one sample at a time. No local buffering: a
/// sample is either delivered or surfaced as failed.
#[derive(Debug, Clone)]
pub struct Uploader {
    client: StoreClient,
    policy: RetryPolicy,
}

impl Uploader {
    pub fn new(client: StoreClient, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }
}

#[async_trait]
impl SampleUploader for Uploader {
    async fn upload(&self, sample: LocationSample) -> Result<StoredSample, UploadError> {
        let max = self.policy.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=max {
            debug!(
                "store: uploading sample for {} (attempt {}/{})",
                sample.child_id, attempt, max
            );
            match self.client.insert(&sample).await {
                Ok(row) => {
                    debug!("store: sample delivered on attempt {}", attempt);
                    return Ok(row);
                }
                Err(err) if !err.is_retryable() => {
                    warn!("store: non-retryable upload failure: {}", err);
                    return Err(err);
                }
                Err(err) => {
                    warn!("store: upload attempt {}/{} failed: {}", attempt, max, err);
                    last_err = Some(err);
                }
            }
            if attempt < max {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        Err(last_err.unwrap_or(UploadError::Exhausted { attempts: max }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreConfig;
    use std::time::Instant;
    use tether_proto::PositionFix;
    use time::macros::datetime;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "anon-key";

    fn sample() -> LocationSample {
        LocationSample::from_fix(
            "c1",
            &PositionFix {
                lat: 37.0,
                lon: -122.0,
                accuracy: Some(5.0),
                speed: None,
                bearing: None,
                ts: datetime!(2024-01-01 00:00:00 UTC),
            },
        )
        .unwrap()
    }

    fn echoed_row() -> serde_json::Value {
        serde_json::json!([{
            "id": "1",
            "child_id": "c1",
            "latitude": 37.0,
            "longitude": -122.0,
            "location_timestamp": "2024-01-01T00:00:00.000Z",
            "accuracy": 5.0,
            "created_at": "2024-01-01T00:00:01+00:00"
        }])
    }

    async fn uploader_for(server: &MockServer, policy: RetryPolicy) -> Uploader {
        let client = StoreClient::new(&StoreConfig::new(server.uri(), KEY)).unwrap();
        Uploader::new(client, policy)
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy { max_attempts: 3, retry_delay: Duration::from_millis(25) }
    }

    #[tokio::test]
    async fn single_attempt_success_echoes_coordinates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/locations"))
            .and(header("apikey", KEY))
            .and(header("authorization", format!("Bearer {KEY}")))
            .and(header("prefer", "return=representation"))
            .and(body_partial_json(serde_json::json!({
                "child_id": "c1",
                "location_timestamp": "2024-01-01T00:00:00.000Z"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(echoed_row()))
            .expect(1)
            .mount(&server)
            .await;

        let uploader = uploader_for(&server, quick_policy()).await;
        let row = uploader.upload(sample()).await.unwrap();
        assert_eq!(row.sample.latitude, 37.0);
        assert_eq!(row.sample.longitude, -122.0);
        assert_eq!(row.id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn terminal_status_makes_exactly_one_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/locations"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let uploader = uploader_for(&server, quick_policy()).await;
        match uploader.upload(sample()).await {
            Err(UploadError::Terminal { status: 401, detail }) => assert_eq!(detail, "bad key"),
            other => panic!("expected terminal error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retries_through_transient_failures_with_fixed_delays() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/locations"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/locations"))
            .respond_with(ResponseTemplate::new(201).set_body_json(echoed_row()))
            .expect(1)
            .mount(&server)
            .await;

        let policy = quick_policy();
        let uploader = uploader_for(&server, policy.clone()).await;
        let started = Instant::now();
        let row = uploader.upload(sample()).await.unwrap();
        assert_eq!(row.sample.child_id, "c1");
        assert!(started.elapsed() >= policy.retry_delay * 2);
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_last_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/locations"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let uploader = uploader_for(&server, quick_policy()).await;
        match uploader.upload(sample()).await {
            Err(UploadError::RetryableStatus { status: 503 }) => {}
            other => panic!("expected last retryable error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_status_with_empty_body_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/locations"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let uploader = uploader_for(&server, quick_policy()).await;
        match uploader.upload(sample()).await {
            Err(UploadError::EmptyResponse) => {}
            other => panic!("expected empty-response error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn latest_filters_by_child_and_decodes_row() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/locations"))
            .and(query_param("child_id", "eq.c1"))
            .and(query_param("order", "created_at.desc"))
            .and(query_param("limit", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(echoed_row()))
            .expect(1)
            .mount(&server)
            .await;

        let client = StoreClient::new(&StoreConfig::new(server.uri(), KEY)).unwrap();
        let row = client.latest("c1").await.unwrap().unwrap();
        assert_eq!(row.sample.latitude, 37.0);
    }

    #[tokio::test]
    async fn latest_with_no_rows_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/locations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let client = StoreClient::new(&StoreConfig::new(server.uri(), KEY)).unwrap();
        assert!(client.latest("c1").await.unwrap().is_none());
    }
}
