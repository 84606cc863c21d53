// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use super::KeyValueCache;
use crate::domain::error::AppError;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Process-local cache; expired entries are evicted lazily on access and by
/// the periodic `run_purge` sweep.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Slot>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn purge_now(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let slot = self.entries.get(key)?;
        if slot.is_live(now) {
            return Some(slot.value.clone());
        }
        drop(slot);
        self.entries.remove_if(key, |_, s| !s.is_live(now));
        None
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.entries.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), AppError> {
        self.entries.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs.max(1))),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        Ok(self.live_value(key).is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, AppError> {
        let now = Instant::now();
        let slot = Slot {
            value: value.to_string(),
            expires_at: Some(now + Duration::from_millis(ttl_ms.max(1))),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut held) if !held.get().is_live(now) => {
                held.insert(slot);
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(free) => {
                free.insert(slot);
                Ok(true)
            }
        }
    }

    async fn delete_if_eq(&self, key: &str, value: &str) -> Result<bool, AppError> {
        Ok(self.entries.remove_if(key, |_, slot| slot.value == value).is_some())
    }

    async fn purge_expired(&self) -> usize {
        self.purge_now()
    }
}
