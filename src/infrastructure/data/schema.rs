// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use crate::domain::geo::Location;
use chrono::NaiveDateTime;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct StopRecord {
    pub pokestop_id: String,
    pub enabled: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub last_modified: NaiveDateTime,
    pub lure_expiration: Option<NaiveDateTime>,
    pub last_updated: Option<NaiveDateTime>,
    pub name: Option<String>,
    pub image: Option<String>,
    pub is_ar_scan_eligible: bool,
}

impl StopRecord {
    pub fn location(&self) -> Location {
        Location::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct GymRecord {
    pub gym_id: String,
    pub team_id: i64,
    pub guard_pokemon_id: i64,
    pub slots_available: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub weather_boosted_condition: i64,
    pub last_modified: NaiveDateTime,
    pub last_scanned: NaiveDateTime,
}

#[derive(Debug, Clone, FromRow)]
pub struct RaidRecord {
    pub gym_id: String,
    pub level: i64,
    pub spawn: NaiveDateTime,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub pokemon_id: Option<i64>,
    pub cp: i64,
    pub move_1: i64,
    pub move_2: i64,
    pub last_scanned: NaiveDateTime,
    pub form: i64,
    pub is_exclusive: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct PokemonRecord {
    pub encounter_id: i64,
    pub spawnpoint_id: i64,
    pub pokemon_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub disappear_time: NaiveDateTime,
    pub individual_attack: Option<i64>,
    pub individual_defense: Option<i64>,
    pub individual_stamina: Option<i64>,
    pub move_1: Option<i64>,
    pub move_2: Option<i64>,
    pub cp: Option<i64>,
    pub cp_multiplier: Option<f64>,
    pub weight: Option<f64>,
    pub height: Option<f64>,
    pub gender: i64,
    pub catch_prob_1: Option<f64>,
    pub catch_prob_2: Option<f64>,
    pub catch_prob_3: Option<f64>,
    pub weather_boosted_condition: i64,
    pub last_modified: NaiveDateTime,
    pub costume: i64,
    pub form: i64,
    pub size: Option<i64>,
    pub fort_id: Option<String>,
    pub cell_id: Option<i64>,
    pub seen_type: String,
}

impl PokemonRecord {
    pub fn encounter_id_u64(&self) -> u64 {
        self.encounter_id as u64
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PokemonDisplayRecord {
    pub encounter_id: i64,
    pub pokemon_id: i64,
    pub form: i64,
    pub gender: i64,
    pub costume: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct SpawnRecord {
    pub spawnpoint: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub spawndef: i64,
    pub earliest_unseen: i64,
    pub last_scanned: Option<NaiveDateTime>,
    pub first_detection: NaiveDateTime,
    pub last_non_scanned: Option<NaiveDateTime>,
    pub calc_endminsec: Option<String>,
    pub eventid: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct QuestRecord {
    #[sqlx(rename = "GUID")]
    pub guid: String,
    pub layer: i64,
    pub quest_type: i64,
    pub quest_timestamp: i64,
    pub quest_stardust: i64,
    pub quest_pokemon_id: i64,
    pub quest_reward_type: i64,
    pub quest_item_id: i64,
    pub quest_item_amount: i64,
    pub quest_target: i64,
    pub quest_condition: Option<String>,
    pub quest_reward: Option<String>,
    pub quest_template: Option<String>,
    pub quest_task: Option<String>,
    pub quest_title: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SeenTypeRecord {
    pub encounter_id: i64,
    pub encounter: Option<NaiveDateTime>,
    pub wild: Option<NaiveDateTime>,
    pub nearby_stop: Option<NaiveDateTime>,
    pub nearby_cell: Option<NaiveDateTime>,
    pub lure_wild: Option<NaiveDateTime>,
    pub lure_encounter: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DeviceStatusRecord {
    pub device_id: String,
    pub instance: String,
    pub level: i64,
    pub last_softban_action: Option<NaiveDateTime>,
    pub last_softban_action_lat: Option<f64>,
    pub last_softban_action_lng: Option<f64>,
    pub last_updated: NaiveDateTime,
}

impl DeviceStatusRecord {
    pub fn softban_location(&self) -> Option<Location> {
        match (self.last_softban_action_lat, self.last_softban_action_lng) {
            (Some(lat), Some(lng)) => Some(Location::new(lat, lng)),
            _ => None,
        }
    }
}

/// Event window a spawn belongs to. Id 1 is the default (no event).
#[derive(Debug, Clone, FromRow)]
pub struct EventRecord {
    pub id: i64,
    pub event_name: String,
    pub event_start: NaiveDateTime,
    pub event_end: NaiveDateTime,
    pub event_lure_duration: i64,
}
