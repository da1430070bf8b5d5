//! A token bucket which suspends callers until bytes of bandwidth accrue.

use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use thiserror::Error;
use tokio::time::{self, Instant};
use tracing::trace;

use crate::limits::{LimitError, RateLimit};

/// A token bucket.
///
/// Tokens accrue continuously at the configured rate, capped at the burst
/// ceiling, and are computed lazily from elapsed time rather than by a
/// background timer. The bucket starts full. All methods take `&self`;
/// share one across tasks with an `Arc`.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    limit: RateLimit,
    /// Banked tokens. Fractional so that slow rates accrue smoothly.
    available: f64,
    last_refill: Instant,
}

/// The deadline expired before enough tokens accrued.
///
/// Nothing was deducted: a timed-out wait leaves the bucket untouched.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("timed out waiting for {want} bytes of bandwidth")]
pub struct ConsumeError {
    want: u64,
}

impl ConsumeError {
    /// The (burst-capped) number of tokens the consumer was waiting for.
    pub fn want(&self) -> u64 {
        self.want
    }
}

impl TokenBucket {
    /// Create a bucket that starts with its whole burst banked.
    ///
    /// # Errors
    ///
    /// [`LimitError::OutOfRange`] if the rate or the burst is zero.
    pub fn new(limit: RateLimit) -> Result<Self, LimitError> {
        limit.validate()?;
        Ok(Self::from_validated(limit))
    }

    pub(crate) fn from_validated(limit: RateLimit) -> Self {
        Self {
            state: Mutex::new(BucketState {
                limit,
                available: limit.burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to take `n` tokens without waiting.
    ///
    /// `n` is capped to the current burst. On success the granted amount has
    /// been deducted and is returned. On failure nothing is deducted, and the
    /// `Err` holds how long the deficit takes to accrue at the current rate.
    pub fn try_consume(&self, n: u64) -> Result<u64, Duration> {
        if n == 0 {
            return Ok(0);
        }
        let mut state = self.lock();
        state.refill(Instant::now());

        let want = n.min(state.limit.burst);
        let want_f = want as f64;
        // Tolerance for rounding in the deficit arithmetic below.
        if state.available + 1e-9 >= want_f {
            state.available = (state.available - want_f).max(0.0);
            Ok(want)
        } else {
            let deficit = want_f - state.available;
            Err(Duration::from_secs_f64(
                deficit / state.limit.bytes_per_sec as f64,
            ))
        }
    }

    /// Take `n` tokens (capped to the burst), waiting for them to accrue.
    ///
    /// Returns the granted amount. The deduction happens atomically once the
    /// tokens are available, so dropping the future mid-wait deducts nothing.
    pub async fn consume(&self, n: u64) -> u64 {
        loop {
            match self.try_consume(n) {
                Ok(granted) => return granted,
                Err(wait) => time::sleep(wait).await,
            }
        }
    }

    /// As [`consume`](Self::consume), but give up once `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`ConsumeError`] when the timeout expires first. The bucket is left
    /// exactly as if the call had never been made.
    pub async fn consume_timeout(&self, n: u64, timeout: Duration) -> Result<u64, ConsumeError> {
        time::timeout(timeout, self.consume(n))
            .await
            .map_err(|_elapsed| ConsumeError {
                want: n.min(self.burst()),
            })
    }

    /// Replace the rate and burst.
    ///
    /// Accrual up to now is settled under the old rate first. Banked tokens
    /// are capped to the new burst, not rescaled and not reset: shrinking the
    /// burst can immediately reduce what the next consume may take, while
    /// widening it grants nothing beyond what had already accrued.
    ///
    /// A limit with a zero field is ignored.
    pub fn reconfigure(&self, limit: RateLimit) {
        if limit.validate().is_err() {
            return;
        }
        let mut state = self.lock();
        state.refill(Instant::now());
        state.limit = limit;
        state.available = state.available.min(limit.burst as f64);
        trace!(
            rate = limit.bytes_per_sec,
            burst = limit.burst,
            "bucket reconfigured"
        );
    }

    /// Current sustained rate, in bytes per second.
    pub fn rate(&self) -> u64 {
        self.lock().limit.bytes_per_sec
    }

    /// Current burst ceiling.
    pub fn burst(&self) -> u64 {
        self.lock().limit.burst
    }

    /// Current limit.
    pub fn limit(&self) -> RateLimit {
        self.lock().limit
    }

    /// Whole tokens currently banked.
    // `available` stays within [0, burst], so the cast is exact.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn available(&self) -> u64 {
        let mut state = self.lock();
        state.refill(Instant::now());
        state.available as u64
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().expect("lock should not be poisoned")
    }
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        self.last_refill = now;
        let accrued = elapsed.as_secs_f64() * self.limit.bytes_per_sec as f64;
        self.available = (self.available + accrued).min(self.limit.burst as f64);
    }
}
