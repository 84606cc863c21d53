// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use super::{
    InjectionBundle, LatestPayload, LatestProtoEntry, MitmMapper, is_gmo_key, moved_cells,
};
use crate::common::time_utils::{current_unix, current_unix_ms};
use crate::domain::geo::Location;
use crate::infrastructure::cache::SharedCache;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const ORIGIN_LOCK_TTL_MS: u64 = 2_000;
const ORIGIN_LOCK_WAIT: Duration = Duration::from_secs(3);
const ORIGIN_LOCK_RETRY: Duration = Duration::from_millis(5);

/// Mapper shared between processes through the key-value cache. Read-modify-
/// write updates of one origin hold a local lock and a `SET NX PX` lock key,
/// so hosts sharing the backend never interleave them.
pub struct RedisMitmMapper {
    cache: SharedCache,
    locks: DashMap<String, Arc<Mutex<()>>>,
    instance: String,
    next_token: AtomicU64,
}

fn latest_key(origin: &str, key: &str) -> String {
    format!("latest_data:{origin}:{key}")
}

pub(crate) fn origin_lock_key(origin: &str) -> String {
    format!("lock:mitm:{origin}")
}

impl RedisMitmMapper {
    pub fn new(cache: SharedCache) -> Self {
        Self {
            cache,
            locks: DashMap::new(),
            instance: format!("{}-{}", std::process::id(), current_unix_ms()),
            next_token: AtomicU64::new(0),
        }
    }

    fn lock_for(&self, origin: &str) -> Arc<Mutex<()>> {
        self.locks.entry(origin.to_string()).or_default().clone()
    }

    /// Takes the shared lock key of `origin`. `None` when the backend fails
    /// or another holder keeps it past the wait budget.
    async fn acquire_shared(&self, origin: &str) -> Option<String> {
        let key = origin_lock_key(origin);
        let token = format!(
            "{}-{}",
            self.instance,
            self.next_token.fetch_add(1, Ordering::Relaxed)
        );
        let started = Instant::now();
        loop {
            match self.cache.set_nx_px(&key, &token, ORIGIN_LOCK_TTL_MS).await {
                Ok(true) => return Some(token),
                Ok(false) if started.elapsed() < ORIGIN_LOCK_WAIT => {
                    tokio::time::sleep(ORIGIN_LOCK_RETRY).await;
                }
                Ok(false) => {
                    tracing::warn!(target: "mitm_mapper", origin, "Origin lock busy, dropping update");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(target: "mitm_mapper", origin, error = %e, "Origin lock failed");
                    return None;
                }
            }
        }
    }

    async fn release_shared(&self, origin: &str, token: &str) {
        if let Err(e) = self.cache.delete_if_eq(&origin_lock_key(origin), token).await {
            tracing::debug!(target: "mitm_mapper", origin, error = %e, "Origin lock release failed");
        }
    }

    /// Last-writer-wins store of one entry plus its GMO side effects. The
    /// caller holds the origin lock.
    async fn store_latest(&self, origin: &str, key: &str, entry: LatestProtoEntry) -> bool {
        let slot = latest_key(origin, key);
        if let Some(stored) = self.read::<LatestProtoEntry>(&slot).await
            && !entry.supersedes(&stored)
        {
            tracing::debug!(
                target: "mitm_mapper",
                origin,
                key,
                stored = stored.device_ts,
                device_ts = entry.device_ts,
                "Dropping stale payload"
            );
            return false;
        }

        if is_gmo_key(key) {
            let cells_key = format!("last_cell_ids:{origin}");
            let stored: HashSet<u64> = self.read(&cells_key).await.unwrap_or_default();
            if let Some(cells) = moved_cells(&stored, &entry.payload) {
                self.write(&cells_key, &cells).await;
                let moved_key = format!("last_possibly_moved:{origin}");
                let moved: i64 = self.read(&moved_key).await.unwrap_or_default();
                self.write(&moved_key, &moved.max(entry.device_ts)).await;
            }
            self.write(&format!("is_injected:{origin}"), &true).await;
        }
        if let Some(loc) = entry.location.filter(Location::is_valid) {
            self.write(&format!("last_known_location:{origin}"), &loc)
                .await;
        }
        self.write(&slot, &entry).await;
        true
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(target: "mitm_mapper", key, error = %e, "Undecodable state entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(target: "mitm_mapper", key, error = %e, "State read failed");
                None
            }
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(target: "mitm_mapper", key, error = %e, "State encode failed");
                return;
            }
        };
        if let Err(e) = self.cache.set(key, &raw).await {
            tracing::debug!(target: "mitm_mapper", key, error = %e, "State write dropped");
        }
    }
}

#[async_trait]
impl MitmMapper for RedisMitmMapper {
    async fn update_latest(
        &self,
        origin: &str,
        key: &str,
        payload: LatestPayload,
        arrival_ts: i64,
        device_ts: i64,
        location: Option<Location>,
    ) -> bool {
        let lock = self.lock_for(origin);
        let _guard = lock.lock().await;
        let Some(token) = self.acquire_shared(origin).await else {
            return false;
        };
        let entry = LatestProtoEntry {
            location,
            arrival_ts,
            device_ts,
            payload,
        };
        let stored = self.store_latest(origin, key, entry).await;
        self.release_shared(origin, &token).await;
        stored
    }

    async fn request_latest(
        &self,
        origin: &str,
        key: &str,
        after_ts: Option<i64>,
    ) -> Option<LatestProtoEntry> {
        let entry: LatestProtoEntry = self.read(&latest_key(origin, key)).await?;
        match after_ts {
            Some(ts) if entry.device_ts <= ts => None,
            _ => Some(entry),
        }
    }

    async fn get_last_possibly_moved(&self, origin: &str) -> i64 {
        self.read(&format!("last_possibly_moved:{origin}"))
            .await
            .unwrap_or_default()
    }

    async fn get_last_known_location(&self, origin: &str) -> Option<Location> {
        self.read(&format!("last_known_location:{origin}")).await
    }

    async fn get_level(&self, origin: &str) -> i32 {
        self.read(&format!("level:{origin}")).await.unwrap_or_default()
    }

    async fn set_level(&self, origin: &str, level: i32) {
        self.write(&format!("level:{origin}"), &level).await;
    }

    async fn get_stops_visited(&self, origin: &str) -> i32 {
        self.read(&format!("pokestops_visited:{origin}"))
            .await
            .unwrap_or_default()
    }

    async fn set_stops_visited(&self, origin: &str, stops: i32) {
        self.write(&format!("pokestops_visited:{origin}"), &stops)
            .await;
    }

    async fn get_injection_status(&self, origin: &str) -> bool {
        self.read(&format!("is_injected:{origin}"))
            .await
            .unwrap_or_default()
    }

    async fn set_injection_status(&self, origin: &str, injected: bool) {
        self.write(&format!("is_injected:{origin}"), &injected).await;
    }

    async fn get_quests_held(&self, origin: &str) -> Option<Vec<i32>> {
        self.read::<Option<Vec<i32>>>(&format!("quests_held:{origin}"))
            .await
            .flatten()
    }

    async fn set_quests_held(&self, origin: &str, quests: Option<Vec<i32>>) {
        self.write(&format!("quests_held:{origin}"), &quests).await;
    }

    async fn add_encountered(&self, origin: &str, ids: &[u64], expiry: i64) {
        let lock = self.lock_for(origin);
        let _guard = lock.lock().await;
        let Some(token) = self.acquire_shared(origin).await else {
            return;
        };
        let key = format!("encountered:{origin}");
        let mut seen: HashMap<u64, i64> = self.read(&key).await.unwrap_or_default();
        for id in ids {
            seen.insert(*id, expiry);
        }
        self.write(&key, &seen).await;
        self.release_shared(origin, &token).await;
    }

    async fn get_encountered(&self, origin: &str) -> HashMap<u64, i64> {
        let lock = self.lock_for(origin);
        let _guard = lock.lock().await;
        let key = format!("encountered:{origin}");
        let mut seen: HashMap<u64, i64> = self.read(&key).await.unwrap_or_default();
        let before = seen.len();
        let now = current_unix();
        seen.retain(|_, expiry| *expiry > now);
        if seen.len() != before
            && let Some(token) = self.acquire_shared(origin).await
        {
            // Re-read under the shared lock so concurrent additions survive.
            let mut current: HashMap<u64, i64> = self.read(&key).await.unwrap_or_default();
            current.retain(|_, expiry| *expiry > now);
            self.write(&key, &current).await;
            self.release_shared(origin, &token).await;
        }
        seen
    }

    async fn set_injection_bundle(&self, origin: &str, bundle: InjectionBundle) {
        self.write(&format!("injection_bundle:{origin}"), &bundle)
            .await;
    }

    async fn get_injection_bundle(&self, origin: &str) -> InjectionBundle {
        self.read(&format!("injection_bundle:{origin}"))
            .await
            .unwrap_or_default()
    }
}
