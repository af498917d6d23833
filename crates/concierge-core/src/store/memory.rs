use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

use super::{ttl_secs, CounterStore, CreateOutcome};
use crate::Result;

#[derive(Debug)]
struct Entry {
    value: u64,
    expires_at: Instant,
}

/// In-process counter store with per-entry expiry.
///
/// Enforces the window ceiling within a single bot process; several
/// processes sharing one token need `ValkeyCounterStore`.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let map = self.entries.lock().await;
        map.values().filter(|e| e.expires_at > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn create_if_absent(
        &self,
        key: &str,
        value: u64,
        ttl: Duration,
    ) -> Result<CreateOutcome> {
        let now = Instant::now();
        let mut map = self.entries.lock().await;
        map.retain(|_, e| e.expires_at > now);

        if map.contains_key(key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        map.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + Duration::from_secs(ttl_secs(ttl)),
            },
        );
        Ok(CreateOutcome::Created)
    }

    async fn increment(&self, key: &str, delta: u64) -> Result<Option<u64>> {
        let now = Instant::now();
        let mut map = self.entries.lock().await;
        match map.get_mut(key) {
            Some(e) if e.expires_at > now => {
                e.value = e.value.saturating_add(delta);
                Ok(Some(e.value))
            }
            Some(_) => {
                map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
