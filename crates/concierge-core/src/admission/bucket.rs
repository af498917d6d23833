use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use crate::{Context, Result};

/// Refill rate and capacity of a token bucket.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketConfig {
    pub rate_per_sec: f64,
    pub burst: u32,
}

impl BucketConfig {
    pub const fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec,
            burst,
        }
    }

    /// A bucket that never makes anyone wait.
    pub const fn unlimited() -> Self {
        Self {
            rate_per_sec: f64::INFINITY,
            burst: 0,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate_per_sec.is_infinite()
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

/// Classic token bucket: starts full, refills continuously up to `burst`.
#[derive(Debug)]
pub struct TokenBucket {
    cfg: BucketConfig,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(cfg: BucketConfig) -> Self {
        // A zero burst would never admit anything; treat it as one.
        let capacity = cfg.burst.max(1) as f64;
        Self {
            cfg,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_update: Instant::now(),
            }),
        }
    }

    /// Take one token now, or report how long until one is available.
    pub fn try_acquire(&self) -> std::result::Result<(), Duration> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> std::result::Result<(), Duration> {
        if self.cfg.is_unlimited() {
            return Ok(());
        }

        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.saturating_duration_since(st.last_update).as_secs_f64();
        st.tokens = (st.tokens + elapsed * self.cfg.rate_per_sec).min(self.capacity);
        if now > st.last_update {
            st.last_update = now;
        }

        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            return Ok(());
        }

        let rate = self.cfg.rate_per_sec.max(1e-9);
        let secs = (1.0 - st.tokens) / rate;
        Err(Duration::from_secs_f64(secs.clamp(0.0, 86_400.0)))
    }

    /// Tokens currently available (after refill up to `now`).
    pub fn available_at(&self, now: Instant) -> f64 {
        if self.cfg.is_unlimited() {
            return f64::INFINITY;
        }
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.saturating_duration_since(st.last_update).as_secs_f64();
        (st.tokens + elapsed * self.cfg.rate_per_sec).min(self.capacity)
    }

    /// A full bucket is indistinguishable from a freshly created one.
    pub fn is_full_at(&self, now: Instant) -> bool {
        self.available_at(now) >= self.capacity
    }

    /// Wait for a token, giving up when `ctx` ends.
    ///
    /// No lock is held while sleeping and nothing is consumed on failure.
    pub async fn acquire(&self, ctx: &Context) -> Result<()> {
        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => ctx.sleep(wait).await?,
            }
        }
    }
}
