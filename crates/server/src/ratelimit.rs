//! Bandwidth limiting with a token bucket.
//!
//! One cell of the bucket is one KiB. Chunk bodies and download frames are
//! admitted through [`BandwidthLimiter::acquire`] before they are written, so a
//! single shared limiter caps the aggregate rate of every caller.

use governor::{
    Quota, RateLimiter, clock::DefaultClock, middleware::NoOpMiddleware, state::InMemoryState,
    state::NotKeyed,
};
use std::num::NonZeroU32;
use stowage_core::config::mbps_to_bytes_per_sec;

/// Type alias for the unkeyed limiter shared by all workers.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

const CELL_BYTES: u64 = 1024;

/// Byte-rate limiter shared by download workers and chunk intake.
pub struct BandwidthLimiter {
    limiter: DirectLimiter,
    burst: NonZeroU32,
    bytes_per_sec: u64,
}

impl BandwidthLimiter {
    /// Limiter for `mbps` megabits per second, or `None` when unlimited (`<= 0`).
    pub fn from_mbps(mbps: f64) -> Option<Self> {
        mbps_to_bytes_per_sec(mbps).and_then(Self::new)
    }

    /// Limiter for a byte rate. Returns `None` for zero.
    pub fn new(bytes_per_sec: u64) -> Option<Self> {
        let cells = bytes_per_sec.div_ceil(CELL_BYTES).min(u64::from(u32::MAX));
        let per_second = NonZeroU32::new(u32::try_from(cells).ok()?)?;
        Some(Self {
            limiter: RateLimiter::direct(Quota::per_second(per_second).allow_burst(per_second)),
            burst: per_second,
            bytes_per_sec,
        })
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Wait until `bytes` may pass.
    ///
    /// Requests larger than one second of budget are admitted in burst-sized steps.
    pub async fn acquire(&self, bytes: usize) {
        let mut remaining = (bytes as u64).div_ceil(CELL_BYTES);
        while remaining > 0 {
            let step = remaining.min(u64::from(self.burst.get())) as u32;
            let Some(cells) = NonZeroU32::new(step) else {
                break;
            };
            if self.limiter.until_n_ready(cells).await.is_err() {
                // Unreachable: steps never exceed the burst.
                tracing::warn!(cells = step, "bandwidth request exceeds bucket capacity");
                break;
            }
            remaining -= u64::from(step);
        }
    }
}

impl std::fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthLimiter")
            .field("bytes_per_sec", &self.bytes_per_sec)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn zero_rate_means_unlimited() {
        assert!(BandwidthLimiter::from_mbps(0.0).is_none());
        assert!(BandwidthLimiter::new(0).is_none());
    }

    #[test]
    fn mbps_are_megabits() {
        let limiter = BandwidthLimiter::from_mbps(8.0).unwrap();
        assert_eq!(limiter.bytes_per_sec(), 1_000_000);
    }

    #[tokio::test]
    async fn first_burst_passes_immediately() {
        let limiter = BandwidthLimiter::new(1024 * 1024).unwrap();
        let started = Instant::now();
        limiter.acquire(512 * 1024).await;
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn oversized_requests_are_throttled() {
        // 64 KiB/s; 96 KiB needs the 64 KiB burst plus half a second.
        let limiter = BandwidthLimiter::new(64 * 1024).unwrap();
        let started = Instant::now();
        limiter.acquire(96 * 1024).await;
        assert!(started.elapsed() >= Duration::from_millis(400));
    }
}
