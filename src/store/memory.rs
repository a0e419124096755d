//! In-process window store.
//!
//! Mirrors the Redis scripts with a single lock around the whole
//! purge/count/insert step. Useful for development and tests; it does not
//! coordinate anything across processes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use super::{ttl_millis, Admission, Usage, WindowStore};
use crate::error::Result;

#[derive(Debug, Default)]
struct WindowSet {
    /// (score in unix ms, member)
    entries: BTreeSet<(i64, String)>,
    /// Unix ms after which the whole set is gone
    expires_at_ms: i64,
}

impl WindowSet {
    fn purge(&mut self, window_start_ms: i64) {
        self.entries = self.entries.split_off(&(window_start_ms, String::new()));
    }
}

/// Window store living in local memory.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    sets: Mutex<HashMap<String, WindowSet>>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held.
    pub fn key_count(&self) -> usize {
        self.sets.lock().len()
    }

    fn drop_if_expired(sets: &mut HashMap<String, WindowSet>, key: &str, now_ms: i64) {
        if sets.get(key).is_some_and(|set| set.expires_at_ms <= now_ms) {
            sets.remove(key);
        }
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn admit(
        &self,
        key: &str,
        limit: u64,
        window_start_ms: i64,
        now_ms: i64,
        member: &str,
        ttl: Duration,
    ) -> Result<Admission> {
        let mut sets = self.sets.lock();
        Self::drop_if_expired(&mut sets, key, now_ms);

        let set = sets.entry(key.to_string()).or_default();
        set.purge(window_start_ms);

        let count = set.entries.len() as u64;
        if count < limit {
            set.entries.insert((now_ms, member.to_string()));
            set.expires_at_ms = now_ms.saturating_add(ttl_millis(ttl));
            return Ok(Admission {
                allowed: true,
                count: count + 1,
            });
        }

        if set.entries.is_empty() {
            sets.remove(key);
        }
        Ok(Admission {
            allowed: false,
            count,
        })
    }

    async fn usage(&self, key: &str, window_start_ms: i64, now_ms: i64) -> Result<Usage> {
        let mut sets = self.sets.lock();
        Self::drop_if_expired(&mut sets, key, now_ms);

        let Some(set) = sets.get_mut(key) else {
            return Ok(Usage::default());
        };
        set.purge(window_start_ms);

        let usage = Usage {
            count: set.entries.len() as u64,
            oldest_ms: set.entries.first().map(|(score, _)| *score),
        };
        if set.entries.is_empty() {
            sets.remove(key);
        }
        Ok(usage)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.sets.lock().remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
