// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Typed views of the decoded protocol messages devices forward.
//!
//! Devices send the decoded message as JSON using the protocol's field
//! names. Every struct is `#[serde(default)]` so absent fields decode to the
//! protocol default, the same way an unset protobuf field reads.

use crate::domain::geo::Location;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Method ids of the messages the pipeline consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtoIdentifier {
    Inventory,
    FortSearch,
    Encounter,
    FortDetails,
    Gmo,
    DiskEncounter,
    GymInfo,
    GetRoutes,
}

impl ProtoIdentifier {
    pub const ALL: [ProtoIdentifier; 8] = [
        ProtoIdentifier::Inventory,
        ProtoIdentifier::FortSearch,
        ProtoIdentifier::Encounter,
        ProtoIdentifier::FortDetails,
        ProtoIdentifier::Gmo,
        ProtoIdentifier::DiskEncounter,
        ProtoIdentifier::GymInfo,
        ProtoIdentifier::GetRoutes,
    ];

    pub const fn method_id(self) -> i32 {
        match self {
            ProtoIdentifier::Inventory => 4,
            ProtoIdentifier::FortSearch => 101,
            ProtoIdentifier::Encounter => 102,
            ProtoIdentifier::FortDetails => 104,
            ProtoIdentifier::Gmo => 106,
            ProtoIdentifier::DiskEncounter => 145,
            ProtoIdentifier::GymInfo => 156,
            ProtoIdentifier::GetRoutes => 1405,
        }
    }

    pub fn from_method(method: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.method_id() == method)
    }

    /// Key under which the latest payload of this kind is kept per device.
    pub fn key(self) -> String {
        self.method_id().to_string()
    }
}

// =============================================================================
// LENIENT SCALARS
// =============================================================================

/// 64-bit unsigned ids arrive as unsigned, signed (two's complement) or
/// string values depending on the forwarder.
pub fn wire_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct WireU64;

    impl<'de> Visitor<'de> for WireU64 {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an unsigned, signed or string encoded 64-bit id")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            Ok(v as u64)
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<u64, E> {
            if v.fract() != 0.0 {
                return Err(E::custom(format!("fractional id {v}")));
            }
            if v < 0.0 {
                Ok((v as i64) as u64)
            } else {
                Ok(v as u64)
            }
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                return Ok(0);
            }
            trimmed
                .parse::<u64>()
                .or_else(|_| trimmed.parse::<i64>().map(|s| s as u64))
                .map_err(|_| E::custom(format!("invalid id {trimmed}")))
        }

        fn visit_unit<E: de::Error>(self) -> Result<u64, E> {
            Ok(0)
        }
    }

    deserializer.deserialize_any(WireU64)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum FortType {
    #[default]
    Gym,
    Stop,
}

/// Numeric (`0` gym, `1` stop) and named enum encodings are both in use.
impl<'de> Deserialize<'de> for FortType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FortTypeVisitor;

        impl<'de> Visitor<'de> for FortTypeVisitor {
            type Value = FortType;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a fort type as integer or name")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<FortType, E> {
                match v {
                    0 => Ok(FortType::Gym),
                    1 => Ok(FortType::Stop),
                    other => Err(E::custom(format!("unknown fort type {other}"))),
                }
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<FortType, E> {
                if v < 0 {
                    return Err(E::custom(format!("unknown fort type {v}")));
                }
                self.visit_u64(v as u64)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<FortType, E> {
                match v.trim().to_ascii_uppercase().as_str() {
                    "GYM" | "0" => Ok(FortType::Gym),
                    "CHECKPOINT" | "POKESTOP" | "STOP" | "1" => Ok(FortType::Stop),
                    other => Err(E::custom(format!("unknown fort type {other}"))),
                }
            }
        }

        deserializer.deserialize_any(FortTypeVisitor)
    }
}

// =============================================================================
// GET MAP OBJECTS
// =============================================================================

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GetMapObjects {
    pub status: i32,
    #[serde(alias = "map_cell", alias = "cells")]
    pub map_cells: Vec<MapCell>,
    pub client_weather: Vec<ClientWeather>,
    pub time_of_day: i32,
}

impl GetMapObjects {
    pub fn is_empty(&self) -> bool {
        self.map_cells.is_empty()
    }

    pub fn cell_ids(&self) -> Vec<u64> {
        self.map_cells.iter().map(|c| c.s2_cell_id).collect()
    }

    pub fn wild_pokemon(&self) -> impl Iterator<Item = &WildPokemon> {
        self.map_cells.iter().flat_map(|c| c.wild_pokemon.iter())
    }

    pub fn forts(&self) -> impl Iterator<Item = &Fort> {
        self.map_cells.iter().flat_map(|c| c.forts.iter())
    }

    pub fn has_forts(&self) -> bool {
        self.map_cells.iter().any(|c| !c.forts.is_empty())
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MapCell {
    #[serde(deserialize_with = "wire_u64")]
    pub s2_cell_id: u64,
    pub as_of_time_ms: i64,
    #[serde(alias = "fort")]
    pub forts: Vec<Fort>,
    pub wild_pokemon: Vec<WildPokemon>,
    pub nearby_pokemon: Vec<NearbyPokemon>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Fort {
    #[serde(alias = "id")]
    pub fort_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub fort_type: FortType,
    pub enabled: bool,
    pub closed: bool,
    pub visited: bool,
    pub cooldown_complete_ms: i64,
    pub last_modified_ms: i64,
    pub guard_pokemon_id: i32,
    pub team: i32,
    pub gym_display: GymDisplay,
    pub is_in_battle: bool,
    pub is_ex_raid_eligible: bool,
    pub is_ar_scan_eligible: bool,
    pub image_url: String,
    pub raid_info: Option<RaidInfo>,
    pub active_fort_modifier: Vec<i32>,
    pub active_pokemon: Option<MapPokemon>,
    pub pokestop_display: Option<IncidentDisplay>,
    pub pokestop_displays: Vec<IncidentDisplay>,
}

impl Fort {
    pub fn location(&self) -> Location {
        Location::new(self.latitude, self.longitude)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GymDisplay {
    pub slots_available: i32,
    pub total_gym_cp: i32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RaidInfo {
    pub raid_seed: i64,
    pub raid_spawn_ms: i64,
    pub raid_battle_ms: i64,
    pub raid_end_ms: i64,
    pub raid_level: i32,
    pub raid_pokemon: Option<PokemonData>,
    pub is_exclusive: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PokemonDisplay {
    pub costume: i32,
    pub gender: i32,
    pub shiny: bool,
    pub form: i32,
    pub weather_boosted_condition: i32,
    pub current_temp_evolution: i32,
    #[serde(deserialize_with = "wire_u64")]
    pub display_id: u64,
}

/// `PokemonProto`; raid bosses, encounters and lure encounters share it.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PokemonData {
    #[serde(alias = "pokemon_id")]
    pub id: i32,
    pub cp: i32,
    pub move1: i32,
    pub move2: i32,
    pub individual_attack: i32,
    pub individual_defense: i32,
    pub individual_stamina: i32,
    pub cp_multiplier: f64,
    pub weight_kg: f64,
    pub height_m: f64,
    pub size: i32,
    pub pokemon_display: PokemonDisplay,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WildPokemon {
    #[serde(deserialize_with = "wire_u64")]
    pub encounter_id: u64,
    pub last_modified_ms: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub spawn_point_id: String,
    pub pokemon: PokemonData,
    pub time_till_hidden_ms: i64,
}

impl WildPokemon {
    pub fn location(&self) -> Location {
        Location::new(self.latitude, self.longitude)
    }

    /// Spawn point ids are hex encoded S2 cell tokens.
    pub fn spawnpoint(&self) -> Option<i64> {
        let raw = self.spawn_point_id.trim();
        if raw.is_empty() {
            return None;
        }
        u64::from_str_radix(raw, 16).ok().map(|v| v as i64)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NearbyPokemon {
    pub pokedex_number: i32,
    pub distance_meters: f64,
    #[serde(deserialize_with = "wire_u64")]
    pub encounter_id: u64,
    pub fort_id: String,
    pub pokemon_display: PokemonDisplay,
}

/// Lure mon attached to a stop.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MapPokemon {
    #[serde(deserialize_with = "wire_u64")]
    pub encounter_id: u64,
    pub pokedex_type_id: i32,
    pub expiration_time_ms: i64,
    pub pokemon_display: PokemonDisplay,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IncidentDisplay {
    pub incident_id: String,
    pub incident_start_ms: i64,
    pub incident_expiration_ms: i64,
    pub hide_incident: bool,
    pub incident_display_type: i32,
    pub incident_display_order_priority: i32,
    pub custom_display: CustomDisplay,
    pub is_cross_stop_incident: bool,
    pub character_display: Option<CharacterDisplay>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CustomDisplay {
    pub style_config_address: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CharacterDisplay {
    pub character: i32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientWeather {
    #[serde(deserialize_with = "wire_u64")]
    pub s2_cell_id: u64,
    pub display_weather: Option<DisplayWeather>,
    pub gameplay_weather: GameplayWeather,
    pub alerts: Vec<WeatherAlert>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DisplayWeather {
    pub cloud_level: i32,
    pub rain_level: i32,
    pub wind_level: i32,
    pub snow_level: i32,
    pub fog_level: i32,
    pub wind_direction: i32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GameplayWeather {
    pub gameplay_condition: i32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WeatherAlert {
    pub severity: i32,
    pub warn_weather: bool,
}

// =============================================================================
// ENCOUNTERS
// =============================================================================

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureProbability {
    pub pokeball_type: Vec<i32>,
    pub capture_probability: Vec<f64>,
}

impl CaptureProbability {
    pub fn triple(&self) -> Option<(f64, f64, f64)> {
        match self.capture_probability.as_slice() {
            [a, b, c, ..] => Some((*a, *b, *c)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EncounterOut {
    pub status: i32,
    pub pokemon: Option<WildPokemon>,
    pub capture_probability: CaptureProbability,
}

/// Lure encounter: no spawn point, the encounter id rides in `display_id`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DiskEncounterOut {
    pub result: i32,
    pub pokemon: Option<PokemonData>,
    pub capture_probability: CaptureProbability,
}

// =============================================================================
// FORTS
// =============================================================================

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FortSearchOut {
    pub result: i32,
    pub fort_id: String,
    pub items: Vec<ItemAward>,
    pub challenge_quest: Option<ChallengeQuest>,
}

impl FortSearchOut {
    pub fn quest_type(&self) -> i32 {
        self.challenge_quest
            .as_ref()
            .map(|c| c.quest.quest_type)
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ItemAward {
    pub item: i32,
    pub count: i32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ChallengeQuest {
    pub quest: Quest,
    pub quest_display: QuestDisplay,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct QuestDisplay {
    pub title: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Quest {
    pub quest_type: i32,
    pub template_id: String,
    pub goal: QuestGoal,
    pub quest_rewards: Vec<QuestReward>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct QuestGoal {
    pub target: i32,
    pub condition: Vec<Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct QuestReward {
    #[serde(rename = "type")]
    pub reward_type: i32,
    pub exp: i32,
    pub stardust: i32,
    pub item: ItemReward,
    pub pokemon_encounter: PokemonEncounterReward,
    pub candy: PokemonAmount,
    pub xl_candy: PokemonAmount,
    pub mega_resource: PokemonAmount,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ItemReward {
    pub item: i32,
    pub amount: i32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PokemonEncounterReward {
    pub pokemon_id: i32,
    pub pokemon_display: PokemonDisplay,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PokemonAmount {
    pub pokemon_id: i32,
    pub amount: i32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FortDetailsOut {
    #[serde(alias = "fort_id")]
    pub id: String,
    pub team: i32,
    pub name: String,
    pub image_url: Vec<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(alias = "type")]
    pub fort_type: FortType,
    pub description: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GymGetInfoOut {
    pub result: i32,
    pub name: String,
    pub url: String,
    pub description: String,
    pub gym_status_and_defenders: Option<GymStatusAndDefenders>,
}

impl GymGetInfoOut {
    pub fn gym_id(&self) -> Option<&str> {
        self.gym_status_and_defenders
            .as_ref()
            .and_then(|s| s.pokemon_fort_proto.as_ref())
            .map(|f| f.fort_id.as_str())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GymStatusAndDefenders {
    pub pokemon_fort_proto: Option<Fort>,
}

// =============================================================================
// INVENTORY
// =============================================================================

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GetHoloholoInventoryOut {
    pub success: bool,
    pub inventory_delta: Option<InventoryDelta>,
}

impl GetHoloholoInventoryOut {
    /// First player stats entry with a plausible level.
    pub fn player_stats(&self) -> Option<&PlayerStats> {
        self.inventory_delta
            .as_ref()?
            .inventory_item
            .iter()
            .filter_map(|item| item.inventory_item_data.player_stats.as_ref())
            .find(|stats| stats.level > 0)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct InventoryDelta {
    pub original_timestamp_ms: i64,
    pub new_timestamp_ms: i64,
    pub inventory_item: Vec<InventoryItem>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct InventoryItem {
    pub inventory_item_data: InventoryItemData,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct InventoryItemData {
    pub player_stats: Option<PlayerStats>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PlayerStats {
    pub level: i32,
    pub experience: i64,
    pub km_walked: f64,
    pub pokemons_encountered: i32,
    pub poke_stop_visits: i32,
}

// =============================================================================
// ROUTES
// =============================================================================

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GetRoutesOut {
    pub status: i32,
    pub route_map_cell: Vec<RouteMapCell>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RouteMapCell {
    #[serde(deserialize_with = "wire_u64")]
    pub s2_cell_id: u64,
    pub route: Vec<SharedRoute>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SharedRoute {
    pub id: String,
    pub waypoints: Vec<Value>,
    #[serde(rename = "type")]
    pub route_type: i32,
    pub path_type: i32,
    pub name: String,
    pub version: i64,
    pub description: String,
    pub reversible: bool,
    pub submission_time: i64,
    pub route_distance_meters: i64,
    pub route_duration_seconds: i64,
    pub pins: Vec<Value>,
    pub tags: Vec<String>,
    pub image: RouteImage,
    pub route_submission_status: RouteSubmissionStatus,
    pub start_poi: RoutePoi,
    pub end_poi: RoutePoi,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RouteImage {
    pub image_url: String,
    pub border_color_hex: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RouteSubmissionStatus {
    pub status: i32,
    pub submission_status_update_time_ms: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutePoi {
    pub anchor: RouteWaypoint,
    pub image_url: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RouteWaypoint {
    pub fort_id: String,
    pub lat_degrees: f64,
    pub lng_degrees: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn method_ids_round_trip() {
        for proto in ProtoIdentifier::ALL {
            assert_eq!(ProtoIdentifier::from_method(proto.method_id()), Some(proto));
        }
        assert_eq!(ProtoIdentifier::from_method(9999), None);
        assert_eq!(ProtoIdentifier::Gmo.key(), "106");
    }

    #[test]
    fn negative_encounter_ids_wrap_to_unsigned() {
        let mon: WildPokemon = serde_json::from_value(json!({
            "encounter_id": -1,
            "spawn_point_id": "47a851dfecc",
        }))
        .expect("decode");
        assert_eq!(mon.encounter_id, u64::MAX);
        assert_eq!(mon.spawnpoint(), Some(0x47a851dfecc));

        let as_string: WildPokemon =
            serde_json::from_value(json!({"encounter_id": "18446744073709551615"}))
                .expect("decode");
        assert_eq!(as_string.encounter_id, u64::MAX);
    }

    #[test]
    fn fort_type_accepts_both_encodings() {
        let a: Fort = serde_json::from_value(json!({"fort_type": 1})).expect("decode");
        let b: Fort = serde_json::from_value(json!({"fort_type": "CHECKPOINT"})).expect("decode");
        let c: Fort = serde_json::from_value(json!({"fort_type": "GYM"})).expect("decode");
        assert_eq!(a.fort_type, FortType::Stop);
        assert_eq!(b.fort_type, FortType::Stop);
        assert_eq!(c.fort_type, FortType::Gym);
    }

    #[test]
    fn gmo_defaults_and_helpers() {
        let gmo: GetMapObjects = serde_json::from_value(json!({
            "map_cell": [
                {"s2_cell_id": 5, "wild_pokemon": [{"encounter_id": 42}]},
                {"s2_cell_id": 6, "fort": [{"fort_id": "a", "fort_type": 1}]},
            ]
        }))
        .expect("decode");
        assert_eq!(gmo.cell_ids(), vec![5, 6]);
        assert_eq!(gmo.wild_pokemon().count(), 1);
        assert!(gmo.has_forts());
        assert!(GetMapObjects::default().is_empty());
    }

    #[test]
    fn inventory_finds_player_stats() {
        let inv: GetHoloholoInventoryOut = serde_json::from_value(json!({
            "inventory_delta": {"inventory_item": [
                {"inventory_item_data": {}},
                {"inventory_item_data": {"player_stats": {"level": 31, "poke_stop_visits": 900}}}
            ]}
        }))
        .expect("decode");
        let stats = inv.player_stats().expect("stats");
        assert_eq!(stats.level, 31);
        assert_eq!(stats.poke_stop_visits, 900);
    }
}
