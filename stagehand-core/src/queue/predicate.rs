use std::{fmt, sync::Arc, time::Instant};

use parking_lot::Mutex;

use crate::{config::PredicateConfig, error::Error};

/// Admission control evaluated on every enqueue attempt, after the capacity
/// check.
///
/// `queued` counts visible elements plus outstanding reservations. An
/// implementation must only update its own state when it returns `true`.
pub trait EnqueuePredicate: Send + Sync + fmt::Debug {
    fn accept(&self, incoming: usize, queued: usize) -> bool;

    /// Gives back what an accepted reservation of `count` elements took,
    /// once that reservation is aborted.
    fn refund(&self, _count: usize) {}
}

/// Denies once the queue holds `threshold` elements.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdPredicate {
    threshold: usize,
}

impl ThresholdPredicate {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }
}

impl EnqueuePredicate for ThresholdPredicate {
    fn accept(&self, incoming: usize, queued: usize) -> bool {
        queued + incoming <= self.threshold
    }
}

/// Token bucket admission: `target_rate` elements per second with bursts of
/// at most `depth`.
#[derive(Debug)]
pub struct RateLimitingPredicate {
    target_rate: f64,
    depth: usize,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimitingPredicate {
    /// Returns `None` unless `target_rate` is positive and finite and `depth`
    /// is at least 1.
    pub fn new(target_rate: f64, depth: usize) -> Option<Self> {
        if !(target_rate.is_finite() && target_rate > 0.0) || depth == 0 {
            return None;
        }
        Some(Self {
            target_rate,
            depth,
            bucket: Mutex::new(Bucket {
                tokens: depth as f64,
                refilled_at: Instant::now(),
            }),
        })
    }

    fn accept_at(&self, incoming: usize, now: Instant) -> bool {
        let mut bucket = self.bucket.lock();
        let elapsed = now.saturating_duration_since(bucket.refilled_at);
        let available =
            (bucket.tokens + elapsed.as_secs_f64() * self.target_rate).min(self.depth as f64);
        if available < incoming as f64 {
            return false;
        }
        bucket.tokens = available - incoming as f64;
        bucket.refilled_at = now;
        true
    }
}

impl EnqueuePredicate for RateLimitingPredicate {
    fn accept(&self, incoming: usize, _queued: usize) -> bool {
        self.accept_at(incoming, Instant::now())
    }

    fn refund(&self, count: usize) {
        let mut bucket = self.bucket.lock();
        bucket.tokens = (bucket.tokens + count as f64).min(self.depth as f64);
    }
}

pub(crate) fn build(
    stage: &str,
    config: &PredicateConfig,
) -> Result<Arc<dyn EnqueuePredicate>, Error> {
    match *config {
        PredicateConfig::Threshold { threshold } => Ok(Arc::new(ThresholdPredicate::new(threshold))),
        PredicateConfig::RateLimiting { target_rate, depth } => {
            RateLimitingPredicate::new(target_rate, depth)
                .map(|p| Arc::new(p) as Arc<dyn EnqueuePredicate>)
                .ok_or_else(|| Error::InvalidPredicate {
                    stage: stage.to_string(),
                    reason: format!(
                        "rate limiting needs a positive target rate and a depth of at least 1, \
                         got {target_rate} and {depth}"
                    ),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn threshold_denies_at_threshold() {
        let p = ThresholdPredicate::new(2);
        assert!(p.accept(1, 0));
        assert!(p.accept(1, 1));
        assert!(!p.accept(1, 2));
        assert!(p.accept(2, 0));
        assert!(!p.accept(2, 1));
    }

    #[test]
    fn rate_limiter_spends_tokens_only_on_accept() {
        let p = RateLimitingPredicate::new(1.0, 2).unwrap();
        let start = Instant::now();
        assert!(p.accept_at(1, start));
        assert!(p.accept_at(1, start));
        assert!(!p.accept_at(1, start));
        // a denied attempt must not drain the bucket
        assert!(!p.accept_at(3, start + Duration::from_secs(5)));
        assert!(p.accept_at(2, start + Duration::from_secs(5)));
        assert!(!p.accept_at(1, start + Duration::from_millis(5500)));
        assert!(p.accept_at(1, start + Duration::from_secs(6)));
    }

    #[test]
    fn refund_is_capped_at_depth() {
        let p = RateLimitingPredicate::new(0.001, 2).unwrap();
        let start = Instant::now();
        assert!(p.accept_at(2, start));
        p.refund(1);
        assert!(p.accept_at(1, start));
        assert!(!p.accept_at(1, start));
        p.refund(5);
        assert!(p.accept_at(2, start));
        assert!(!p.accept_at(1, start));
    }

    #[test]
    fn rate_limiter_rejects_degenerate_parameters() {
        assert!(RateLimitingPredicate::new(0.0, 4).is_none());
        assert!(RateLimitingPredicate::new(-1.0, 4).is_none());
        assert!(RateLimitingPredicate::new(f64::NAN, 4).is_none());
        assert!(RateLimitingPredicate::new(10.0, 0).is_none());
        assert!(build("s", &PredicateConfig::Threshold { threshold: 3 }).is_ok());
        assert!(matches!(
            build(
                "s",
                &PredicateConfig::RateLimiting {
                    target_rate: 5.0,
                    depth: 0
                }
            ),
            Err(Error::InvalidPredicate { .. })
        ));
    }
}
