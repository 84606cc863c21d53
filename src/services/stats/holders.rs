// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use crate::domain::constants::LOCATION_RAW_PERIOD_SECS;
use crate::domain::geo::Location;
use crate::domain::types::{PositionType, SeenType, TransportType, WorkerMode};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectCounts {
    pub mon: i64,
    pub mon_iv: i64,
    pub raid: i64,
    pub quest: i64,
}

impl DetectCounts {
    pub fn is_empty(&self) -> bool {
        self.mon == 0 && self.mon_iv == 0 && self.raid == 0 && self.quest == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WildMonRaw {
    pub count: i64,
    pub is_shiny: bool,
    pub first_scanned: i64,
    pub last_scanned: i64,
}

/// Outcome of one location visit as reported by a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationOutcome {
    pub location: Location,
    pub success: bool,
    pub data_ts: i64,
    pub position_type: PositionType,
    pub mode: WorkerMode,
    pub walker: String,
    pub transport: TransportType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LocationRawKey {
    lat_e6: i64,
    lng_e6: i64,
    mode: i32,
    pub(crate) period: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LocationRaw {
    pub(crate) outcome: LocationOutcome,
    pub(crate) count: i64,
}

pub(crate) fn mode_code(mode: WorkerMode) -> i32 {
    match mode {
        WorkerMode::MonMitm => 0,
        WorkerMode::IvMitm => 1,
        WorkerMode::RaidsMitm => 2,
        WorkerMode::Pokestops => 3,
        WorkerMode::InitMitm => 4,
        WorkerMode::Idle => 5,
    }
}

/// Buffered counters of one device between two flushes.
#[derive(Debug, Clone, Default)]
pub struct PlayerStats {
    pub detect: DetectCounts,
    pub wild_mon_raw: HashMap<u64, WildMonRaw>,
    pub location_ok: i64,
    pub location_nok: i64,
    pub(crate) location_raw: HashMap<LocationRawKey, LocationRaw>,
}

impl PlayerStats {
    pub fn add_wild_mon(&mut self, encounter_id: u64, at: i64) {
        self.detect.mon += 1;
        self.wild_mon_raw
            .entry(encounter_id)
            .and_modify(|raw| {
                raw.count += 1;
                raw.last_scanned = raw.last_scanned.max(at);
            })
            .or_insert(WildMonRaw {
                count: 1,
                is_shiny: false,
                first_scanned: at,
                last_scanned: at,
            });
    }

    pub fn add_mon_iv(&mut self, encounter_id: u64, is_shiny: bool, at: i64) {
        self.detect.mon_iv += 1;
        let raw = self.wild_mon_raw.entry(encounter_id).or_insert(WildMonRaw {
            count: 0,
            is_shiny,
            first_scanned: at,
            last_scanned: at,
        });
        raw.is_shiny |= is_shiny;
        raw.last_scanned = raw.last_scanned.max(at);
    }

    pub fn add_location(&mut self, outcome: LocationOutcome) {
        if outcome.success {
            self.location_ok += 1;
        } else {
            self.location_nok += 1;
        }
        let ts = outcome.data_ts;
        let key = LocationRawKey {
            lat_e6: (outcome.location.lat * 1e6).round() as i64,
            lng_e6: (outcome.location.lng * 1e6).round() as i64,
            mode: mode_code(outcome.mode),
            period: ts - ts.rem_euclid(LOCATION_RAW_PERIOD_SECS),
        };
        self.location_raw
            .entry(key)
            .and_modify(|raw| {
                raw.count += 1;
                raw.outcome = outcome.clone();
            })
            .or_insert(LocationRaw { outcome, count: 1 });
    }

    /// Merges counters of an earlier batch into this one.
    pub fn absorb(&mut self, earlier: PlayerStats) {
        self.detect.mon += earlier.detect.mon;
        self.detect.mon_iv += earlier.detect.mon_iv;
        self.detect.raid += earlier.detect.raid;
        self.detect.quest += earlier.detect.quest;
        for (eid, raw) in earlier.wild_mon_raw {
            self.wild_mon_raw
                .entry(eid)
                .and_modify(|current| {
                    current.count += raw.count;
                    current.is_shiny |= raw.is_shiny;
                    current.first_scanned = current.first_scanned.min(raw.first_scanned);
                    current.last_scanned = current.last_scanned.max(raw.last_scanned);
                })
                .or_insert(raw);
        }
        self.location_ok += earlier.location_ok;
        self.location_nok += earlier.location_nok;
        for (key, raw) in earlier.location_raw {
            self.location_raw
                .entry(key)
                .and_modify(|current| current.count += raw.count)
                .or_insert(raw);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.detect.is_empty()
            && self.wild_mon_raw.is_empty()
            && self.location_ok == 0
            && self.location_nok == 0
    }
}

/// Earliest sighting per kind for each encounter.
#[derive(Debug, Clone, Default)]
pub struct SeenTypeHolder {
    entries: HashMap<u64, HashMap<SeenType, i64>>,
}

impl SeenTypeHolder {
    pub fn add(&mut self, encounter_id: u64, seen_type: SeenType, at: i64) {
        let kinds = self.entries.entry(encounter_id).or_default();
        kinds
            .entry(seen_type)
            .and_modify(|ts| *ts = (*ts).min(at))
            .or_insert(at);
    }

    pub fn get(&self, encounter_id: u64, seen_type: SeenType) -> Option<i64> {
        self.entries.get(&encounter_id)?.get(&seen_type).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn drain(&mut self) -> Vec<(u64, SeenType, i64)> {
        let entries = std::mem::take(&mut self.entries);
        entries
            .into_iter()
            .flat_map(|(eid, kinds)| kinds.into_iter().map(move |(k, ts)| (eid, k, ts)))
            .collect()
    }
}
