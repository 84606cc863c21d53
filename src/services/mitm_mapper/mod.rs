// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Volatile per-device state: the freshest payload per protocol key, the
//! device's last position and GMO cells, injection status, account level
//! and the set of mons the device already encountered.

mod memory;
mod redis;

pub use memory::InProcessMitmMapper;
pub use self::redis::RedisMitmMapper;

use crate::domain::geo::Location;
use crate::domain::proto::ProtoIdentifier;
use crate::domain::types::ScanMode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Payload kept per `(origin, key)`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum LatestPayload {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    Json(Value),
}

impl LatestPayload {
    pub fn from_json(value: Value) -> Self {
        if value.is_null() {
            LatestPayload::Empty
        } else {
            LatestPayload::Json(value)
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            LatestPayload::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Decodes the JSON payload into a typed message.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.as_json()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatestProtoEntry {
    pub location: Option<Location>,
    pub arrival_ts: i64,
    pub device_ts: i64,
    pub payload: LatestPayload,
}

impl LatestProtoEntry {
    /// Ordering used by `update_latest`: device time first, arrival breaks ties.
    pub fn supersedes(&self, stored: &LatestProtoEntry) -> bool {
        (self.device_ts, self.arrival_ts) >= (stored.device_ts, stored.arrival_ts)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedSettings {
    pub scanmode: Option<ScanMode>,
}

/// Capture filter handed to the device on every ingress response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionBundle {
    pub ids_iv: Vec<u64>,
    pub injected_settings: InjectedSettings,
    pub ids_encountered: Vec<u64>,
    pub unquest_stops: Vec<String>,
}

/// Per-origin state store. Reads are best effort; writes never fail the
/// caller.
#[async_trait]
pub trait MitmMapper: Send + Sync {
    /// Stores `payload` unless an entry with a newer `device_ts` exists.
    /// Returns whether the entry was stored.
    async fn update_latest(
        &self,
        origin: &str,
        key: &str,
        payload: LatestPayload,
        arrival_ts: i64,
        device_ts: i64,
        location: Option<Location>,
    ) -> bool;

    /// Latest entry under `key`, only if newer than `after_ts`.
    async fn request_latest(
        &self,
        origin: &str,
        key: &str,
        after_ts: Option<i64>,
    ) -> Option<LatestProtoEntry>;

    async fn get_last_possibly_moved(&self, origin: &str) -> i64;
    async fn get_last_known_location(&self, origin: &str) -> Option<Location>;

    async fn get_level(&self, origin: &str) -> i32;
    async fn set_level(&self, origin: &str, level: i32);
    async fn get_stops_visited(&self, origin: &str) -> i32;
    async fn set_stops_visited(&self, origin: &str, stops: i32);
    async fn get_injection_status(&self, origin: &str) -> bool;
    async fn set_injection_status(&self, origin: &str, injected: bool);
    async fn get_quests_held(&self, origin: &str) -> Option<Vec<i32>>;
    async fn set_quests_held(&self, origin: &str, quests: Option<Vec<i32>>);

    /// Remembers encounters until `expiry` (unix seconds).
    async fn add_encountered(&self, origin: &str, ids: &[u64], expiry: i64);
    /// Non-expired encounters; expired ones are dropped on the way.
    async fn get_encountered(&self, origin: &str) -> HashMap<u64, i64>;

    async fn set_injection_bundle(&self, origin: &str, bundle: InjectionBundle);
    async fn get_injection_bundle(&self, origin: &str) -> InjectionBundle;
}

pub type SharedMitmMapper = Arc<dyn MitmMapper>;

/// Cell ids of a GMO payload.
pub fn cell_ids_of(payload: &LatestPayload) -> Option<HashSet<u64>> {
    let value = payload.as_json()?;
    let cells = ["map_cells", "map_cell", "cells"]
        .iter()
        .find_map(|k| value.get(*k))
        .and_then(Value::as_array)?;
    Some(
        cells
            .iter()
            .filter_map(|c| c.get("s2_cell_id"))
            .filter_map(|id| match id {
                Value::Number(n) => n.as_u64().or_else(|| n.as_i64().map(|v| v as u64)),
                Value::String(s) => s
                    .parse::<u64>()
                    .ok()
                    .or_else(|| s.parse::<i64>().ok().map(|v| v as u64)),
                _ => None,
            })
            .collect(),
    )
}

pub fn is_gmo_key(key: &str) -> bool {
    key == ProtoIdentifier::Gmo.key()
}

/// Bumps `last_possibly_moved` when the new cell set shares nothing with
/// the stored one. Returns the new cell set when it replaced the old.
pub(crate) fn moved_cells(
    stored: &HashSet<u64>,
    payload: &LatestPayload,
) -> Option<HashSet<u64>> {
    let fresh = cell_ids_of(payload)?;
    if fresh.is_empty() || !fresh.is_disjoint(stored) {
        return None;
    }
    Some(fresh)
}
