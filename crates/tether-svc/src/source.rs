use std::time::Duration;

use async_trait::async_trait;
use tether_proto::PositionFix;
use thiserror::Error;

/// Interval policy handed to the positioning subsystem when subscribing.
/// These are inputs, not hard constants; the defaults match the deployed
/// cadence (fixes every ~45 s, never faster than 30 s or later than 90 s).
#[derive(Debug, Clone)]
pub struct SamplingPolicy {
    pub fastest: Duration,
    pub target: Duration,
    pub max_delay: Duration,
    /// Wait before re-subscribing when the subsystem reports fixes
    /// temporarily unavailable.
    pub resubscribe_delay: Duration,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            fastest: Duration::from_secs(30),
            target: Duration::from_secs(45),
            max_delay: Duration::from_secs(90),
            resubscribe_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum FixSourceError {
    #[error("position fixes temporarily unavailable")]
    Unavailable,
    #[error("positioning subsystem failure: {0}")]
    Subsystem(String),
}

/// An established sampling subscription. Dropping the feed tears the
/// subscription down.
#[async_trait]
pub trait FixFeed: Send {
    async fn next_fix(&mut self) -> Result<PositionFix, FixSourceError>;
}

/// The positioning subsystem, seen from the supervisor.
#[async_trait]
pub trait FixSource: Send + Sync + 'static {
    async fn subscribe(
        &self,
        policy: &SamplingPolicy,
    ) -> Result<Box<dyn FixFeed>, FixSourceError>;
}
