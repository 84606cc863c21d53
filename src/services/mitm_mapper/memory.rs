// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use super::{
    InjectionBundle, LatestPayload, LatestProtoEntry, MitmMapper, is_gmo_key, moved_cells,
};
use crate::common::time_utils::current_unix;
use crate::domain::geo::Location;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct DeviceState {
    latest: HashMap<String, LatestProtoEntry>,
    last_cells: HashSet<u64>,
    last_possibly_moved: i64,
    location: Option<Location>,
    level: i32,
    stops_visited: i32,
    injected: bool,
    quests_held: Option<Vec<i32>>,
    encountered: HashMap<u64, i64>,
    bundle: InjectionBundle,
}

/// Single-process mapper; one lock per origin keeps updates linearizable.
#[derive(Default)]
pub struct InProcessMitmMapper {
    devices: DashMap<String, Arc<Mutex<DeviceState>>>,
}

impl InProcessMitmMapper {
    pub fn new() -> Self {
        Self::default()
    }

    fn device(&self, origin: &str) -> Arc<Mutex<DeviceState>> {
        self.devices
            .entry(origin.to_string())
            .or_default()
            .clone()
    }

    fn existing(&self, origin: &str) -> Option<Arc<Mutex<DeviceState>>> {
        self.devices.get(origin).map(|d| d.clone())
    }
}

#[async_trait]
impl MitmMapper for InProcessMitmMapper {
    async fn update_latest(
        &self,
        origin: &str,
        key: &str,
        payload: LatestPayload,
        arrival_ts: i64,
        device_ts: i64,
        location: Option<Location>,
    ) -> bool {
        let device = self.device(origin);
        let mut state = device.lock().await;

        let entry = LatestProtoEntry {
            location,
            arrival_ts,
            device_ts,
            payload,
        };
        if let Some(stored) = state.latest.get(key)
            && !entry.supersedes(stored)
        {
            tracing::debug!(
                target: "mitm_mapper",
                origin,
                key,
                stored = stored.device_ts,
                device_ts,
                "Dropping stale payload"
            );
            return false;
        }

        if is_gmo_key(key) {
            if let Some(cells) = moved_cells(&state.last_cells, &entry.payload) {
                state.last_cells = cells;
                state.last_possibly_moved = state.last_possibly_moved.max(device_ts);
            }
            state.injected = true;
        }
        if let Some(loc) = location.filter(Location::is_valid) {
            state.location = Some(loc);
        }
        state.latest.insert(key.to_string(), entry);
        true
    }

    async fn request_latest(
        &self,
        origin: &str,
        key: &str,
        after_ts: Option<i64>,
    ) -> Option<LatestProtoEntry> {
        let device = self.existing(origin)?;
        let state = device.lock().await;
        let entry = state.latest.get(key)?;
        match after_ts {
            Some(ts) if entry.device_ts <= ts => None,
            _ => Some(entry.clone()),
        }
    }

    async fn get_last_possibly_moved(&self, origin: &str) -> i64 {
        match self.existing(origin) {
            Some(d) => d.lock().await.last_possibly_moved,
            None => 0,
        }
    }

    async fn get_last_known_location(&self, origin: &str) -> Option<Location> {
        self.existing(origin)?.lock().await.location
    }

    async fn get_level(&self, origin: &str) -> i32 {
        match self.existing(origin) {
            Some(d) => d.lock().await.level,
            None => 0,
        }
    }

    async fn set_level(&self, origin: &str, level: i32) {
        self.device(origin).lock().await.level = level;
    }

    async fn get_stops_visited(&self, origin: &str) -> i32 {
        match self.existing(origin) {
            Some(d) => d.lock().await.stops_visited,
            None => 0,
        }
    }

    async fn set_stops_visited(&self, origin: &str, stops: i32) {
        self.device(origin).lock().await.stops_visited = stops;
    }

    async fn get_injection_status(&self, origin: &str) -> bool {
        match self.existing(origin) {
            Some(d) => d.lock().await.injected,
            None => false,
        }
    }

    async fn set_injection_status(&self, origin: &str, injected: bool) {
        self.device(origin).lock().await.injected = injected;
    }

    async fn get_quests_held(&self, origin: &str) -> Option<Vec<i32>> {
        self.existing(origin)?.lock().await.quests_held.clone()
    }

    async fn set_quests_held(&self, origin: &str, quests: Option<Vec<i32>>) {
        self.device(origin).lock().await.quests_held = quests;
    }

    async fn add_encountered(&self, origin: &str, ids: &[u64], expiry: i64) {
        let device = self.device(origin);
        let mut state = device.lock().await;
        for id in ids {
            state.encountered.insert(*id, expiry);
        }
    }

    async fn get_encountered(&self, origin: &str) -> HashMap<u64, i64> {
        let Some(device) = self.existing(origin) else {
            return HashMap::new();
        };
        let now = current_unix();
        let mut state = device.lock().await;
        state.encountered.retain(|_, expiry| *expiry > now);
        state.encountered.clone()
    }

    async fn set_injection_bundle(&self, origin: &str, bundle: InjectionBundle) {
        self.device(origin).lock().await.bundle = bundle;
    }

    async fn get_injection_bundle(&self, origin: &str) -> InjectionBundle {
        match self.existing(origin) {
            Some(d) => d.lock().await.bundle.clone(),
            None => InjectionBundle::default(),
        }
    }
}
