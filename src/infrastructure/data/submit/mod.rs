// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Idempotent merge of decoded payloads into the durable store.
//!
//! Every write is guarded by a short-TTL dedup key in the shared cache and
//! uses the arrival time of the payload, not the wall clock, for its
//! timestamps, so replaying a payload leaves the tables unchanged.

mod forts;
mod mons;
mod world;

use crate::app::config::GlobalSettings;
use crate::domain::constants::{
    DITTO_GENDER, DITTO_MON_ID, DITTO_MOVES, POTENTIAL_DITTOS,
};
use crate::domain::error::AppError;
use crate::domain::proto::{GetMapObjects, PokemonData};
use crate::infrastructure::cache::SharedCache;
use crate::infrastructure::data::db::Database;
use chrono::{DateTime, Timelike, Utc};

pub use mons::MonIvOutcome;

#[derive(Debug, Clone)]
pub struct SubmitSettings {
    pub instance_name: String,
    pub lure_duration_minutes: i64,
    pub default_unknown_timeleft_secs: i64,
    pub default_nearby_timeleft_minutes: i64,
    pub scan_lured_mons: bool,
    pub scan_nearby_mons: bool,
    pub disable_nearby_cell: bool,
}

impl From<&GlobalSettings> for SubmitSettings {
    fn from(settings: &GlobalSettings) -> Self {
        Self {
            instance_name: settings.instance_name.clone(),
            lure_duration_minutes: settings.lure_duration_minutes,
            default_unknown_timeleft_secs: settings.default_unknown_timeleft_secs,
            default_nearby_timeleft_minutes: settings.default_nearby_timeleft_minutes,
            scan_lured_mons: settings.scan_lured_mons,
            scan_nearby_mons: settings.scan_nearby_mons,
            disable_nearby_cell: settings.disable_nearby_cell,
        }
    }
}

/// Ids seen in one GMO, handed to the stats collector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GmoOutcome {
    pub wild: Vec<u64>,
    pub nearby_cell: Vec<u64>,
    pub nearby_stop: Vec<u64>,
    pub lure_wild: Vec<u64>,
    pub raids: usize,
}

#[derive(Clone)]
pub struct ProtoSubmit {
    db: Database,
    cache: SharedCache,
    settings: SubmitSettings,
}

impl ProtoSubmit {
    pub fn new(db: Database, cache: SharedCache, settings: SubmitSettings) -> Self {
        Self {
            db,
            cache,
            settings,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// Full GMO merge in dependency order: weather first so gyms pick up the
    /// boost, spawnpoints before mons so despawn times are known.
    pub async fn gmo(
        &self,
        origin: &str,
        gmo: &GetMapObjects,
        received_ts: i64,
    ) -> Result<GmoOutcome, AppError> {
        let mut outcome = GmoOutcome::default();
        if gmo.is_empty() {
            tracing::debug!(target: "submit", origin = %origin, "Empty GMO, nothing to merge");
            return Ok(outcome);
        }

        self.weather(gmo, received_ts).await?;
        self.stops(gmo, received_ts).await?;
        self.gyms(gmo, received_ts).await?;
        outcome.raids = self.raids(gmo, received_ts).await?;
        self.spawnpoints(gmo, received_ts).await?;
        outcome.wild = self.mons(gmo, received_ts).await?;
        self.cells(gmo, received_ts).await?;
        if self.settings.scan_nearby_mons {
            let (cell, stop) = self.mons_nearby(gmo, received_ts).await?;
            outcome.nearby_cell = cell;
            outcome.nearby_stop = stop;
        }
        if self.settings.scan_lured_mons {
            outcome.lure_wild = self.mon_lure_noiv(gmo, received_ts).await?;
        }

        tracing::debug!(
            target: "submit",
            origin = %origin,
            wild = outcome.wild.len(),
            nearby = outcome.nearby_cell.len() + outcome.nearby_stop.len(),
            lure = outcome.lure_wild.len(),
            raids = outcome.raids,
            "GMO merged"
        );
        Ok(outcome)
    }

    /// Write-through dedup: true when the key was already present.
    async fn seen(&self, key: &str) -> bool {
        match self.cache.exists(key).await {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!(target: "submit", key, error = %e, "dedup lookup failed");
                false
            }
        }
    }

    async fn remember(&self, key: &str, ttl_secs: i64) {
        self.remember_value(key, "1", ttl_secs).await;
    }

    async fn remember_value(&self, key: &str, value: &str, ttl_secs: i64) {
        if ttl_secs <= 0 {
            return;
        }
        if let Err(e) = self.cache.set_ex(key, value, ttl_secs as u64).await {
            tracing::debug!(target: "submit", key, error = %e, "dedup write failed");
        }
    }

    /// Whether a cell's forts match the fingerprint stored on the last merge.
    async fn cell_unchanged(&self, key: &str, fingerprint: &str) -> bool {
        matches!(self.cache.get(key).await, Ok(Some(stored)) if stored == fingerprint)
    }
}

// =============================================================================
// GAME MECHANICS
// =============================================================================

/// Quarter-hour index `p ∈ {4,5,6,7}` of the minute.
pub fn spawndef_position(minute: u32) -> u32 {
    4 + (minute.min(59) / 15)
}

/// Marks quarter-hour `p` as seen: `(old & !(1 << (p-4))) | (1 << p)`.
pub fn set_spawn_seen_quarter(spawndef: i64, position: u32) -> i64 {
    let p = position.clamp(4, 7);
    (spawndef & !(1 << (p - 4))) | (1 << p)
}

pub fn spawndef_position_at(unix_ts: i64) -> u32 {
    let minute = DateTime::<Utc>::from_timestamp(unix_ts, 0)
        .map(|d| d.minute())
        .unwrap_or_default();
    spawndef_position(minute)
}

/// Next occurrence of the spawn's `MM:SS` despawn mark at or after
/// `received_ts`; unknown spawns fall back to `received_ts + fallback`,
/// floored to the minute so rescans keep the same value.
pub fn despawn_timestamp(calc_endminsec: Option<&str>, received_ts: i64, fallback_secs: i64) -> i64 {
    let parsed = calc_endminsec.and_then(|raw| {
        let (m, s) = raw.trim().split_once(':')?;
        let m: i64 = m.parse().ok()?;
        let s: i64 = s.parse().ok()?;
        ((0..60).contains(&m) && (0..60).contains(&s)).then_some(m * 60 + s)
    });
    match parsed {
        Some(mark) => {
            let hour_start = received_ts - received_ts.rem_euclid(3600);
            let candidate = hour_start + mark;
            if candidate >= received_ts {
                candidate
            } else {
                candidate + 3600
            }
        }
        None => (received_ts + fallback_secs) / 60 * 60,
    }
}

/// Stats pattern of a ditto disguised as another species.
pub fn is_mon_ditto(data: &PokemonData) -> bool {
    if !POTENTIAL_DITTOS.contains(&data.id) {
        return false;
    }
    let boost = data.pokemon_display.weather_boosted_condition;
    let low_iv = data.individual_attack < 4
        || data.individual_defense < 4
        || data.individual_stamina < 4
        || data.cp_multiplier < 0.3;
    if boost > 0 {
        low_iv
    } else {
        data.cp_multiplier > 0.733
    }
}

/// Species, gender, moves and form to store, with ditto overrides applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonIdentity {
    pub mon_id: i32,
    pub gender: i32,
    pub move_1: i32,
    pub move_2: i32,
    pub form: i32,
    pub is_ditto: bool,
}

impl MonIdentity {
    pub fn resolve(data: &PokemonData) -> Self {
        if is_mon_ditto(data) {
            Self {
                mon_id: DITTO_MON_ID,
                gender: DITTO_GENDER,
                move_1: DITTO_MOVES.0,
                move_2: DITTO_MOVES.1,
                form: 0,
                is_ditto: true,
            }
        } else {
            Self {
                mon_id: data.id,
                gender: data.pokemon_display.gender,
                move_1: data.move1,
                move_2: data.move2,
                form: data.pokemon_display.form,
                is_ditto: false,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::proto::PokemonDisplay;
    use crate::infrastructure::cache::MemoryCache;
    use std::sync::Arc;

    pub(crate) fn test_settings() -> SubmitSettings {
        SubmitSettings {
            instance_name: "test".to_string(),
            lure_duration_minutes: 30,
            default_unknown_timeleft_secs: 180,
            default_nearby_timeleft_minutes: 15,
            scan_lured_mons: true,
            scan_nearby_mons: true,
            disable_nearby_cell: false,
        }
    }

    pub(crate) async fn submitter() -> ProtoSubmit {
        let db = Database::new("sqlite::memory:").await.expect("db");
        ProtoSubmit::new(db, Arc::new(MemoryCache::new()), test_settings())
    }

    #[test]
    fn spawndef_bit_math() {
        assert_eq!(spawndef_position(0), 4);
        assert_eq!(spawndef_position(17), 5);
        assert_eq!(spawndef_position(44), 6);
        assert_eq!(spawndef_position(59), 7);

        for p in 4..=7u32 {
            let old = 0b1010_1111_i64;
            let expected = (old & !(1 << (p - 4))) | (1 << p);
            assert_eq!(set_spawn_seen_quarter(old, p), expected);
        }
        // Minute 17 on the default: bit 1 is already clear, bit 5 already set.
        assert_eq!(set_spawn_seen_quarter(240, spawndef_position(17)), 240);
        assert_eq!(set_spawn_seen_quarter(0b0000_0001, 4), 0b0001_0000);
    }

    #[test]
    fn despawn_uses_known_mark_or_fallback() {
        // 10:20:00 UTC
        let received = 1_700_000_400 - 1_700_000_400 % 3600 + 20 * 60;
        let hour_start = received - 20 * 60;
        assert_eq!(despawn_timestamp(Some("35:10"), received, 180), hour_start + 35 * 60 + 10);
        assert_eq!(despawn_timestamp(Some("05:00"), received, 180), hour_start + 3600 + 300);
        assert_eq!(despawn_timestamp(None, received + 7, 180), received + 180);
        assert_eq!(despawn_timestamp(Some("garbage"), received, 180), received + 180);
    }

    #[test]
    fn ditto_detection() {
        let mut data = PokemonData {
            id: 163,
            individual_attack: 2,
            individual_defense: 10,
            individual_stamina: 10,
            cp_multiplier: 0.5,
            pokemon_display: PokemonDisplay {
                weather_boosted_condition: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(is_mon_ditto(&data));
        data.individual_attack = 10;
        assert!(!is_mon_ditto(&data));

        data.pokemon_display.weather_boosted_condition = 0;
        data.cp_multiplier = 0.75;
        assert!(is_mon_ditto(&data));

        data.id = 16;
        assert!(!is_mon_ditto(&data));
        data.id = 25;
        assert!(!is_mon_ditto(&data));
        let identity = MonIdentity::resolve(&data);
        assert_eq!(identity.mon_id, 25);
        assert!(!identity.is_ditto);
    }
}
