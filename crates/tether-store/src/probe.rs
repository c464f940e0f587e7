use thiserror::Error;
use tracing::debug;

use crate::StoreClient;

/// Connectivity-probe failures, distinguishable for display.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("cannot resolve store hostname")]
    NameResolution,
    #[error("connection refused by store endpoint")]
    ConnectionRefused,
    #[error("store request timed out")]
    Timeout,
    #[error("store responded with status {0}")]
    Http(u16),
    #[error("probe failed: {0}")]
    Other(String),
}

/// Lightweight reachability check: an authenticated single-row read against
/// the `locations` resource.
pub async fn probe(client: &StoreClient) -> Result<(), ProbeError> {
    let resp = client
        .http()
        .get(client.locations_url())
        .query(&[("limit", "1")])
        .send()
        .await
        .map_err(classify)?;

    let status = resp.status();
    if status.is_success() {
        debug!("store: probe ok ({})", status);
        Ok(())
    } else {
        Err(ProbeError::Http(status.as_u16()))
    }
}

fn classify(err: reqwest::Error) -> ProbeError {
    if err.is_timeout() {
        return ProbeError::Timeout;
    }
    classify_chain(&err).unwrap_or_else(|| ProbeError::Other(err.to_string()))
}

// Digs through the cause chain for the io-level failure. hyper surfaces DNS
// failures only as a formatted "dns error" message, not a typed cause.
fn classify_chain(err: &(dyn std::error::Error + 'static)) -> Option<ProbeError> {
    let mut cause = err.source();
    while let Some(c) = cause {
        if let Some(io) = c.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    return Some(ProbeError::ConnectionRefused)
                }
                std::io::ErrorKind::TimedOut => return Some(ProbeError::Timeout),
                _ => {}
            }
        }
        let text = c.to_string();
        if text.contains("dns error") || text.contains("failed to lookup") {
            return Some(ProbeError::NameResolution);
        }
        cause = c.source();
    }
    None
}
