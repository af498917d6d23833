//! Admission control for outbound Telegram API calls.
//!
//! Three gates, always taken in this order so the cheap local checks fail
//! fast before any network round trip:
//! 1. a global token bucket shared by every caller,
//! 2. a per-chat token bucket (lazily created),
//! 3. optionally, a fixed-window counter in a store shared by every process
//!    using the same bot token.

use std::{collections::HashMap, sync::Arc};

use tokio::{sync::Mutex, time::Instant};

use crate::{domain::ChatId, store::CounterStore, Context, Error, Result};

mod bucket;
mod window;

pub use bucket::{BucketConfig, TokenBucket};
pub use window::{Clock, DistributedWindow, SystemClock, WindowConfig};

/// What to do when the shared counter store cannot be reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StoreFailurePolicy {
    /// Return the store error to the caller.
    #[default]
    Propagate,
    /// Log a warning and admit the call anyway.
    FailOpen,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdmissionConfig {
    pub global: BucketConfig,
    pub per_key: BucketConfig,
    pub window: WindowConfig,
    pub store_failure: StoreFailurePolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global: BucketConfig::new(10.0, 10),
            per_key: BucketConfig::new(30.0, 30),
            window: WindowConfig::default(),
            store_failure: StoreFailurePolicy::Propagate,
        }
    }
}

/// Map size at which idle per-chat buckets start being evicted.
const IDLE_SWEEP_THRESHOLD: usize = 1024;

/// Gate in front of every outbound call subject to the shared quota.
pub struct AdmissionController {
    global: TokenBucket,
    per_key_cfg: BucketConfig,
    per_key: Mutex<HashMap<i64, Arc<TokenBucket>>>,
    window: Option<DistributedWindow>,
    store_failure: StoreFailurePolicy,
}

impl AdmissionController {
    /// Local buckets only; no cross-process coordination.
    pub fn new(cfg: AdmissionConfig) -> Self {
        Self {
            global: TokenBucket::new(cfg.global),
            per_key_cfg: cfg.per_key,
            per_key: Mutex::new(HashMap::new()),
            window: None,
            store_failure: cfg.store_failure,
        }
    }

    pub fn with_store(cfg: AdmissionConfig, store: Arc<dyn CounterStore>) -> Self {
        Self::with_store_and_clock(cfg, store, Arc::new(SystemClock))
    }

    pub fn with_store_and_clock(
        cfg: AdmissionConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut ctl = Self::new(cfg);
        ctl.window = Some(DistributedWindow::new(store, cfg.window, clock));
        ctl
    }

    /// Number of admissions that had to wait for a later shared window.
    pub fn throttled_total(&self) -> u64 {
        self.window
            .as_ref()
            .map(DistributedWindow::throttled_total)
            .unwrap_or(0)
    }

    /// Chats that currently own a bucket.
    pub async fn tracked_chats(&self) -> usize {
        self.per_key.lock().await.len()
    }

    /// Per-chat bucket, created on first use.
    ///
    /// Once the map is large, a new chat first evicts buckets that are full
    /// and not borrowed by any caller: such a bucket behaves exactly like a
    /// fresh one, so dropping it loses no state.
    async fn bucket_for(&self, chat_id: i64) -> Arc<TokenBucket> {
        let mut map = self.per_key.lock().await;
        if !map.contains_key(&chat_id) && map.len() >= IDLE_SWEEP_THRESHOLD {
            let now = Instant::now();
            let before = map.len();
            map.retain(|_, b| Arc::strong_count(b) > 1 || !b.is_full_at(now));
            tracing::debug!(
                evicted = before - map.len(),
                remaining = map.len(),
                "evicted idle chat buckets"
            );
        }
        map.entry(chat_id)
            .or_insert_with(|| Arc::new(TokenBucket::new(self.per_key_cfg)))
            .clone()
    }

    /// Block until an outbound call is allowed, or fail when `ctx` ends.
    ///
    /// Calls without a chat (e.g. callback answers) only pass the global
    /// bucket and count against the shared window under key 0.
    pub async fn admit(&self, ctx: &Context, chat: Option<ChatId>) -> Result<()> {
        self.global.acquire(ctx).await?;

        if let Some(chat) = chat {
            let bucket = self.bucket_for(chat.0).await;
            bucket.acquire(ctx).await?;
        }

        let Some(window) = &self.window else {
            return Ok(());
        };

        match window.register(ctx, chat.map(|c| c.0)).await {
            Err(Error::Store(msg)) if self.store_failure == StoreFailurePolicy::FailOpen => {
                tracing::warn!(error = %msg, chat = ?chat, "counter store unavailable, admitting anyway");
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CreateOutcome, MemoryCounterStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    use tokio::time::Instant;

    /// Wall clock that follows tokio's (pausable) clock from a second boundary.
    struct PausedClock {
        base: SystemTime,
        start: Instant,
    }

    impl PausedClock {
        fn new() -> Self {
            Self {
                base: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
                start: Instant::now(),
            }
        }
    }

    impl Clock for PausedClock {
        fn now(&self) -> SystemTime {
            self.base + self.start.elapsed()
        }
    }

    struct FixedClock(SystemTime);

    impl FixedClock {
        /// A full second left in the current window.
        fn on_second_boundary() -> Self {
            Self(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> SystemTime {
            self.0
        }
    }

    #[derive(Default)]
    struct FailingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn create_if_absent(
            &self,
            _key: &str,
            _value: u64,
            _ttl: Duration,
        ) -> Result<CreateOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Store("connection refused".to_string()))
        }

        async fn increment(&self, _key: &str, _delta: u64) -> Result<Option<u64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Store("connection refused".to_string()))
        }
    }

    /// Applies each request, but holds back the first reply for `delay`.
    struct SlowFirstReply {
        inner: MemoryCounterStore,
        delay: Duration,
        delayed: AtomicUsize,
    }

    impl SlowFirstReply {
        fn new(delay: Duration) -> Self {
            Self {
                inner: MemoryCounterStore::new(),
                delay,
                delayed: AtomicUsize::new(0),
            }
        }

        async fn maybe_stall(&self) {
            if self.delayed.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(self.delay).await;
            }
        }
    }

    #[async_trait]
    impl CounterStore for SlowFirstReply {
        async fn create_if_absent(
            &self,
            key: &str,
            value: u64,
            ttl: Duration,
        ) -> Result<CreateOutcome> {
            let out = self.inner.create_if_absent(key, value, ttl).await;
            self.maybe_stall().await;
            out
        }

        async fn increment(&self, key: &str, delta: u64) -> Result<Option<u64>> {
            let out = self.inner.increment(key, delta).await;
            self.maybe_stall().await;
            out
        }
    }

    fn window_only(limit: u64) -> AdmissionConfig {
        AdmissionConfig {
            global: BucketConfig::unlimited(),
            per_key: BucketConfig::unlimited(),
            window: WindowConfig {
                limit,
                window: Duration::from_secs(1),
            },
            store_failure: StoreFailurePolicy::Propagate,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn global_burst_is_the_instant_ceiling() {
        let ctl = AdmissionController::new(AdmissionConfig {
            global: BucketConfig::new(10.0, 10),
            per_key: BucketConfig::unlimited(),
            ..AdmissionConfig::default()
        });
        let ctx = Context::background();
        let start = Instant::now();

        for i in 0..10 {
            ctl.admit(&ctx, Some(ChatId(i))).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        ctl.admit(&ctx, None).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn per_chat_burst_exhaustion_hits_deadline() {
        let ctl = AdmissionController::new(AdmissionConfig {
            global: BucketConfig::unlimited(),
            per_key: BucketConfig::new(1.0, 30),
            ..AdmissionConfig::default()
        });
        let ctx = Context::background();
        let chat = Some(ChatId(555));

        for _ in 0..30 {
            ctl.admit(&ctx, chat).await.unwrap();
        }

        let short = ctx.with_timeout(Duration::from_millis(50));
        let start = Instant::now();
        let err = ctl.admit(&short, chat).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert!(start.elapsed() >= Duration::from_millis(50));

        // Other chats keep their own budget.
        let start = Instant::now();
        ctl.admit(&ctx, Some(ChatId(556))).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(ctl.tracked_chats().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn full_shared_window_waits_out_the_deadline() {
        let store = Arc::new(MemoryCounterStore::new());
        let clock = Arc::new(FixedClock::on_second_boundary());
        let ctl = AdmissionController::with_store_and_clock(window_only(30), store, clock);
        let ctx = Context::background();
        let chat = Some(ChatId(1001));

        for _ in 0..30 {
            ctl.admit(&ctx, chat).await.unwrap();
        }

        let short = ctx.with_timeout(Duration::from_millis(50));
        let start = Instant::now();
        let err = ctl.admit(&short, chat).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(ctl.throttled_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_shared_window_admits_after_rollover() {
        let store = Arc::new(MemoryCounterStore::new());
        let clock = Arc::new(PausedClock::new());
        let ctl = AdmissionController::with_store_and_clock(window_only(30), store, clock.clone());
        let ctx = Context::background();
        let chat = Some(ChatId(7));

        tokio::time::advance(Duration::from_millis(250)).await;
        for _ in 0..30 {
            ctl.admit(&ctx, chat).await.unwrap();
        }
        let window_before = clock.now().duration_since(UNIX_EPOCH).unwrap().as_secs();

        let start = Instant::now();
        ctl.admit(&ctx, chat).await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(750));
        let window_after = clock.now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert!(window_after > window_before);
        assert_eq!(ctl.throttled_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn windows_are_counted_per_chat() {
        let store = Arc::new(MemoryCounterStore::new());
        let clock = Arc::new(PausedClock::new());
        let ctl = AdmissionController::with_store_and_clock(window_only(2), store, clock);
        let ctx = Context::background();

        for chat in [ChatId(1), ChatId(1), ChatId(2), ChatId(2)] {
            ctl.admit(&ctx, Some(chat)).await.unwrap();
        }
        ctl.admit(&ctx, None).await.unwrap();
        assert_eq!(ctl.throttled_total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_during_store_round_trip_keeps_later_counts_exact() {
        let store = Arc::new(SlowFirstReply::new(Duration::from_millis(200)));
        let clock = Arc::new(FixedClock::on_second_boundary());
        let ctl = AdmissionController::with_store_and_clock(window_only(3), store, clock);
        let ctx = Context::background();
        let chat = Some(ChatId(42));

        let short = ctx.with_timeout(Duration::from_millis(50));
        let err = ctl.admit(&short, chat).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));

        // The abandoned call still counted once; two more fit under the ceiling.
        ctl.admit(&ctx, chat).await.unwrap();
        ctl.admit(&ctx, chat).await.unwrap();
        assert_eq!(ctl.throttled_total(), 0);

        let short = ctx.with_timeout(Duration::from_millis(50));
        let err = ctl.admit(&short, chat).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert_eq!(ctl.throttled_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_chat_buckets_are_evicted_once_the_map_is_large() {
        let ctl = AdmissionController::new(AdmissionConfig {
            global: BucketConfig::unlimited(),
            per_key: BucketConfig::new(10.0, 5),
            ..AdmissionConfig::default()
        });
        let ctx = Context::background();

        for chat in 0..IDLE_SWEEP_THRESHOLD as i64 {
            ctl.admit(&ctx, Some(ChatId(chat))).await.unwrap();
        }
        assert_eq!(ctl.tracked_chats().await, IDLE_SWEEP_THRESHOLD);

        // Chat 0 drains its bucket; everyone else refills to full.
        for _ in 0..4 {
            ctl.admit(&ctx, Some(ChatId(0))).await.unwrap();
        }
        tokio::time::advance(Duration::from_millis(200)).await;
        for _ in 0..2 {
            ctl.admit(&ctx, Some(ChatId(0))).await.unwrap();
        }

        ctl.admit(&ctx, Some(ChatId(-1))).await.unwrap();
        assert_eq!(ctl.tracked_chats().await, 2);

        // The surviving bucket kept its debt.
        let short = ctx.with_timeout(Duration::from_millis(50));
        let err = ctl.admit(&short, Some(ChatId(0))).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
    }

    #[tokio::test]
    async fn cancelled_context_touches_nothing() {
        let store = Arc::new(FailingStore::default());
        let ctl = AdmissionController::with_store(window_only(30), store.clone());
        let ctx = Context::background();
        ctx.cancel();

        let err = ctl.admit(&ctx, Some(ChatId(3))).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn store_errors_propagate_by_default() {
        let store = Arc::new(FailingStore::default());
        let ctl = AdmissionController::with_store(window_only(30), store.clone());

        let err = ctl
            .admit(&Context::background(), Some(ChatId(3)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        // No retry on store failure.
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fail_open_admits_when_store_is_down() {
        let store = Arc::new(FailingStore::default());
        let cfg = AdmissionConfig {
            store_failure: StoreFailurePolicy::FailOpen,
            ..window_only(30)
        };
        let ctl = AdmissionController::with_store(cfg, store);
        ctl.admit(&Context::background(), Some(ChatId(3)))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn steady_rate_never_waits() {
        let ctl = AdmissionController::new(AdmissionConfig::default());
        let ctx = Context::background();
        let chat = Some(ChatId(9));

        for _ in 0..200 {
            let before = Instant::now();
            ctl.admit(&ctx, chat).await.unwrap();
            assert_eq!(before.elapsed(), Duration::ZERO);
            tokio::time::advance(Duration::from_millis(100)).await;
        }
    }
}
