//! In-process counter store.
//!
//! Suitable for single-node deployments and tests. Counters live in a
//! `DashMap`; expired entries are treated as absent, evicted when their own
//! key is touched, and swept in bulk as new counters are created.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::CounterStore;
use crate::error::{RatewardenError, Result};

/// Number of counter creations between full sweeps of expired entries.
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// A counter store held in local memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    created: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) counters.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired counter, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            trace!(removed = removed, "Purged expired counters");
        }
        removed
    }

    /// Drop all counters.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Count a new counter and sweep once every [`SWEEP_EVERY`] creations,
    /// so identifiers that never return do not pin memory.
    fn note_created(&self) {
        let created = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        if created % SWEEP_EVERY == 0 {
            self.purge_expired();
        }
    }

    /// Fetch a live entry, evicting it if it has expired.
    fn live(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        let entry = *self.entries.get(key)?;
        if entry.is_expired(now) {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry)
    }
}

/// Deadline `seconds` from `now`, or an error if the clock cannot represent it.
fn deadline(now: Instant, seconds: u64) -> Result<Instant> {
    now.checked_add(Duration::from_secs(seconds)).ok_or_else(|| {
        RatewardenError::StoreUnavailable(format!(
            "expiry of {} seconds is out of range",
            seconds
        ))
    })
}

/// Round a remaining duration up to whole seconds.
fn ceil_secs(remaining: Duration) -> u64 {
    remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str) -> Result<u64> {
        let now = Instant::now();
        let (value, created) = match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = Entry {
                        value: 1,
                        expires_at: None,
                    };
                } else {
                    entry.value += 1;
                }
                (entry.value, false)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    value: 1,
                    expires_at: None,
                });
                (1, true)
            }
        };
        // The shard lock is released above; sweeping takes every shard.
        if created {
            self.note_created();
        }
        Ok(value)
    }

    async fn decrement(&self, key: &str) -> Result<u64> {
        let now = Instant::now();
        let value = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.value = entry.value.saturating_sub(1);
                entry.value
            }
            _ => 0,
        };
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.live(key).map(|e| e.value))
    }

    async fn set_expiry_if_unset(&self, key: &str, seconds: u64) -> Result<()> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.expires_at.is_none() {
                entry.expires_at = Some(deadline(now, seconds)?);
            }
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        let now = Instant::now();
        Ok(self
            .live(key)
            .and_then(|e| e.expires_at)
            .map(|at| ceil_secs(at.saturating_duration_since(now))))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, entry)| !entry.is_expired(now))
            .unwrap_or(false))
    }

    async fn get_and_arm(&self, key: &str, seconds: u64) -> Result<Option<u64>> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                if entry.expires_at.is_none() {
                    entry.expires_at = Some(deadline(now, seconds)?);
                }
                Ok(Some(entry.value))
            }
            _ => Ok(None),
        }
    }
}
