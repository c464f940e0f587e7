use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_proto::LocationSample;
use tracing::warn;

/// Backpressure policy for samples whose pipeline invocation failed with a
/// retryable error: a bounded queue with a capped number of redispatches,
/// dropping the oldest entry under sustained failure.
#[derive(Debug, Clone)]
pub struct RedeliveryPolicy {
    pub capacity: usize,
    pub drain_interval: Duration,
    pub max_redispatch: u32,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            capacity: 8,
            drain_interval: Duration::from_secs(30),
            max_redispatch: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub sample: LocationSample,
    /// How many redispatches this sample has already consumed.
    pub redispatches: u32,
}

#[derive(Clone)]
pub(crate) struct Redelivery {
    queue: Arc<Mutex<VecDeque<Entry>>>,
    policy: RedeliveryPolicy,
}

impl Redelivery {
    pub(crate) fn new(policy: RedeliveryPolicy) -> Self {
        Self { queue: Arc::new(Mutex::new(VecDeque::new())), policy }
    }

    pub(crate) fn push(&self, sample: LocationSample, redispatches: u32) {
        if redispatches >= self.policy.max_redispatch {
            warn!(
                "svc: giving up on sample from {} after {} redispatches",
                sample.child_id, redispatches
            );
            return;
        }
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.policy.capacity {
            queue.pop_front();
            warn!("svc: redelivery queue full; dropping oldest sample");
        }
        queue.push_back(Entry { sample, redispatches });
    }

    pub(crate) fn drain_pending(&self) -> Vec<Entry> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_proto::PositionFix;
    use time::macros::datetime;

    fn sample(lat: f64) -> LocationSample {
        LocationSample::from_fix(
            "c1",
            &PositionFix {
                lat,
                lon: 0.0,
                accuracy: None,
                speed: None,
                bearing: None,
                ts: datetime!(2024-01-01 00:00:00 UTC),
            },
        )
        .unwrap()
    }

    fn policy() -> RedeliveryPolicy {
        RedeliveryPolicy {
            capacity: 3,
            drain_interval: Duration::from_millis(10),
            max_redispatch: 2,
        }
    }

    #[test]
    fn drops_oldest_when_full() {
        let queue = Redelivery::new(policy());
        for lat in [1.0, 2.0, 3.0, 4.0] {
            queue.push(sample(lat), 0);
        }
        let drained = queue.drain_pending();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].sample.latitude, 2.0);
        assert_eq!(drained[2].sample.latitude, 4.0);
    }

    #[test]
    fn refuses_samples_past_the_redispatch_cap() {
        let queue = Redelivery::new(policy());
        queue.push(sample(1.0), 2);
        assert_eq!(queue.len(), 0);
        queue.push(sample(1.0), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_empties_the_queue() {
        let queue = Redelivery::new(policy());
        queue.push(sample(1.0), 0);
        assert_eq!(queue.drain_pending().len(), 1);
        assert!(queue.drain_pending().is_empty());
    }
}
