//! Fixed-window counter shared between processes through a `CounterStore`.
//!
//! The add-then-increment pair is not atomic, so several processes racing
//! at a window edge can overshoot the ceiling by at most (racers - 1). The
//! external API's own enforcement remains the final backstop.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
    store::{CounterStore, CreateOutcome},
    Context, Result,
};

/// Wall-clock source for window arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindowConfig {
    /// Calls allowed per key per window.
    pub limit: u64,
    pub window: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            limit: 30,
            window: Duration::from_secs(1),
        }
    }
}

/// The window containing `now`: its store key and the time left in it.
pub(crate) fn window_slot(
    now: SystemTime,
    window: Duration,
    conversation: Option<i64>,
) -> (String, Duration) {
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let window_ns = window.as_nanos().max(1);
    let now_ns = since_epoch.as_nanos();
    let offset = now_ns % window_ns;
    let start_secs = (now_ns - offset) / 1_000_000_000;
    let remaining = Duration::from_nanos((window_ns - offset).min(u64::MAX as u128) as u64);

    let key = format!("rate:{}:{}", conversation.unwrap_or(0), start_secs);
    (key, remaining)
}

pub struct DistributedWindow {
    store: Arc<dyn CounterStore>,
    cfg: WindowConfig,
    clock: Arc<dyn Clock>,
    throttled: AtomicU64,
}

impl DistributedWindow {
    pub fn new(store: Arc<dyn CounterStore>, cfg: WindowConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            cfg,
            clock,
            throttled: AtomicU64::new(0),
        }
    }

    /// How many times a caller had to wait for the next window.
    pub fn throttled_total(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }

    /// Count one call against the current window, waiting for later windows
    /// while the ceiling is exceeded.
    ///
    /// An increment that lands over the ceiling is not rolled back.
    pub async fn register(&self, ctx: &Context, conversation: Option<i64>) -> Result<()> {
        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            let (key, remaining) = window_slot(self.clock.now(), self.cfg.window, conversation);

            let created = ctx
                .run(self.store.create_if_absent(&key, 1, self.cfg.window))
                .await?;
            let count = match created {
                CreateOutcome::Created => 1,
                CreateOutcome::AlreadyExists => {
                    match ctx.run(self.store.increment(&key, 1)).await? {
                        Some(v) => v,
                        // Expired between add and incr: start over in a fresh window.
                        None => continue,
                    }
                }
            };

            if count <= self.cfg.limit {
                return Ok(());
            }

            self.throttled.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                delay_ms = remaining.as_millis() as u64,
                conversation = ?conversation,
                count,
                limit = self.cfg.limit,
                "rate limit window exhausted, delaying"
            );
            ctx.sleep(remaining).await?;
        }
    }
}
