//! Continuous-refill token buckets for per-upstream admission control.
//!
//! A bucket's capacity is its configured per-minute allowance and credit
//! accrues at `allowance / 60` per second, so a fresh bucket permits one
//! minute's worth of burst. There is no background refill task: credit is
//! computed from elapsed time on every access.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{RelayError, Result};

// Floor for deficit sleeps so rounding in the credit math cannot busy-loop.
const MIN_WAIT: Duration = Duration::from_millis(5);

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    available: f64,
    updated: Instant,
}

impl TokenBucket {
    pub fn new(per_minute: f64) -> Self {
        Self {
            capacity: per_minute,
            refill_per_sec: per_minute / 60.0,
            state: Mutex::new(BucketState {
                available: per_minute,
                updated: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.updated).as_secs_f64();
        state.available = (state.available + elapsed * self.refill_per_sec).min(self.capacity);
        state.updated = now;
    }

    /// Deduct `n` tokens if they are available right now. Non-blocking.
    pub fn try_take(&self, n: f64) -> bool {
        let mut state = self.lock_state();
        self.refill(&mut state);
        if state.available >= n {
            state.available -= n;
            true
        } else {
            false
        }
    }

    /// Current credit, refreshed but not deducted.
    pub fn level(&self) -> f64 {
        let mut state = self.lock_state();
        self.refill(&mut state);
        state.available
    }

    /// Block until `n` tokens accumulate and deduct them atomically.
    ///
    /// `n` is deliberately not capped at the bucket capacity: a demand above
    /// one minute's allowance keeps waiting and is ended by `cancel` or the
    /// caller's deadline.
    pub async fn wait_take(&self, n: f64, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            let wait = {
                let mut state = self.lock_state();
                self.refill(&mut state);
                if state.available >= n {
                    state.available -= n;
                    return Ok(());
                }
                let deficit = n - state.available;
                Duration::from_secs_f64(deficit / self.refill_per_sec).max(MIN_WAIT)
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// The request bucket and token bucket owned by one upstream.
#[derive(Debug)]
pub struct LimiterPair {
    pub requests: TokenBucket,
    pub tokens: TokenBucket,
}

impl LimiterPair {
    pub fn new(requests_per_minute: u32, tokens_per_minute: u32) -> Self {
        Self {
            requests: TokenBucket::new(f64::from(requests_per_minute)),
            tokens: TokenBucket::new(f64::from(tokens_per_minute)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_is_bounded_by_capacity() {
        let bucket = TokenBucket::new(60.0);
        for _ in 0..60 {
            assert!(bucket.try_take(1.0));
        }
        assert!(!bucket.try_take(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn credit_accrues_at_per_second_rate() {
        let bucket = TokenBucket::new(60.0);
        assert!(bucket.try_take(60.0));
        assert!(bucket.level() < 1.0);

        tokio::time::advance(Duration::from_secs(30)).await;
        let level = bucket.level();
        assert!((level - 30.0).abs() < 0.5, "level was {level}");
    }

    #[tokio::test(start_paused = true)]
    async fn credit_never_exceeds_capacity() {
        let bucket = TokenBucket::new(100.0);
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(bucket.level() <= 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_take_sleeps_for_the_deficit() {
        let bucket = TokenBucket::new(60.0);
        assert!(bucket.try_take(60.0));

        let started = Instant::now();
        bucket
            .wait_take(30.0, &CancellationToken::new())
            .await
            .expect("wait_take");
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(29), "waited {waited:?}");
        assert!(waited <= Duration::from_secs(31), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_take_observes_cancellation() {
        let bucket = TokenBucket::new(60.0);
        assert!(bucket.try_take(60.0));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = bucket.wait_take(1.0, &cancel).await.expect_err("cancelled");
        assert!(matches!(err, RelayError::Cancelled));
    }

    #[tokio::test]
    async fn level_does_not_deduct() {
        let bucket = TokenBucket::new(10.0);
        assert!(bucket.level() >= 10.0 - f64::EPSILON);
        assert!(bucket.level() >= 10.0 - f64::EPSILON);
        assert!(bucket.try_take(10.0));
    }
}
