/// Per-actor token bucket for operation submission
use dashmap::DashMap;
use std::time::Instant;

use crate::{ActorId, CollabError, Result};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    buckets: DashMap<ActorId, Bucket>,
}

impl RateLimiter {
    /// `rate` tokens per second, at most `burst` saved up
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate: rate.max(f64::MIN_POSITIVE),
            burst: f64::from(burst.max(1)),
            buckets: DashMap::new(),
        }
    }

    pub fn check(&self, actor: ActorId, cost: u32) -> Result<()> {
        self.check_at(actor, cost, Instant::now())
    }

    /// Take `cost` tokens or fail with the wait until they are available
    pub fn check_at(&self, actor: ActorId, cost: u32, now: Instant) -> Result<()> {
        let cost = f64::from(cost).min(self.burst);
        let mut bucket = self.buckets.entry(actor).or_insert(Bucket {
            tokens: self.burst,
            refilled_at: now,
        });

        let elapsed = now.saturating_duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.refilled_at = now;

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            return Ok(());
        }
        let missing = cost - bucket.tokens;
        let retry_after_ms = ((missing / self.rate) * 1000.0).ceil() as u64;
        Err(CollabError::RateLimited {
            actor,
            retry_after_ms: retry_after_ms.max(1),
        })
    }

    fn is_full(&self, bucket: &Bucket, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens + elapsed * self.rate >= self.burst
    }

    /// Drop an actor's bucket once it has refilled, so departed actors do
    /// not pin memory and leaving cannot reset a drained bucket
    pub fn forget(&self, actor: ActorId) -> bool {
        self.forget_at(actor, Instant::now())
    }

    pub fn forget_at(&self, actor: ActorId, now: Instant) -> bool {
        self.buckets
            .remove_if(&actor, |_, bucket| self.is_full(bucket, now))
            .is_some()
    }

    /// Drop every bucket that has refilled; a full bucket behaves like none
    pub fn prune_refilled(&self) -> usize {
        self.prune_refilled_at(Instant::now())
    }

    pub fn prune_refilled_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !self.is_full(bucket, now));
        before.saturating_sub(self.buckets.len())
    }

    pub fn tracked_actors(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_then_refill() {
        let limiter = RateLimiter::new(10.0, 5);
        let actor = ActorId::new();
        let start = Instant::now();

        limiter.check_at(actor, 5, start).unwrap();
        match limiter.check_at(actor, 1, start) {
            Err(CollabError::RateLimited { retry_after_ms, .. }) => {
                assert_eq!(retry_after_ms, 100)
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        limiter
            .check_at(actor, 1, start + Duration::from_millis(100))
            .unwrap();
    }

    #[test]
    fn test_forget_waits_for_refill() {
        let limiter = RateLimiter::new(10.0, 5);
        let actor = ActorId::new();
        let start = Instant::now();

        limiter.check_at(actor, 5, start).unwrap();
        assert!(!limiter.forget_at(actor, start));
        assert_eq!(limiter.tracked_actors(), 1);

        assert!(limiter.forget_at(actor, start + Duration::from_millis(500)));
        assert_eq!(limiter.tracked_actors(), 0);
    }

    #[test]
    fn test_prune_keeps_drained_buckets() {
        let limiter = RateLimiter::new(10.0, 5);
        let (idle, busy) = (ActorId::new(), ActorId::new());
        let start = Instant::now();

        limiter.check_at(idle, 1, start).unwrap();
        limiter.check_at(busy, 5, start + Duration::from_millis(300)).unwrap();
        assert_eq!(limiter.prune_refilled_at(start + Duration::from_millis(400)), 1);
        assert_eq!(limiter.tracked_actors(), 1);
        assert!(limiter.check_at(busy, 5, start + Duration::from_millis(400)).is_err());
    }

    #[test]
    fn test_actors_are_independent() {
        let limiter = RateLimiter::new(1.0, 1);
        let start = Instant::now();
        limiter.check_at(ActorId::new(), 1, start).unwrap();
        limiter.check_at(ActorId::new(), 1, start).unwrap();
    }
}
