// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use crate::domain::error::AppError;
use crate::domain::geo::{Geofence, Location};
use crate::domain::types::{QuestLayer, WorkerMode};
use crate::services::walker::WalkerProgram;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Items kept when the quest inventory is cleared.
pub const DEFAULT_SAFE_ITEMS: [i32; 13] =
    [1301, 1401, 1402, 1403, 1106, 901, 902, 903, 501, 502, 503, 504, 301];

fn default_max_radius() -> f64 {
    70.0
}
fn default_true() -> bool {
    true
}
fn default_one() -> u32 {
    1
}
fn default_layer() -> QuestLayer {
    QuestLayer::Ar
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AreaSettings {
    /// km/h; 0 teleports.
    #[serde(default)]
    pub speed: f64,
    /// Teleport instead of walking beyond this distance (m); 0 disables.
    #[serde(default)]
    pub max_distance: f64,
    #[serde(default = "default_max_radius")]
    pub max_radius: f64,
    #[serde(default)]
    pub init: bool,
    #[serde(default = "default_one")]
    pub init_mode_rounds: u32,
    #[serde(default)]
    pub level_mode: bool,
    #[serde(default = "default_true")]
    pub ignore_spinned_stops: bool,
    #[serde(default = "default_layer")]
    pub layer: QuestLayer,
    /// Species wanted for IV scans.
    #[serde(default)]
    pub mon_ids_iv: Vec<i32>,
    #[serde(default)]
    pub encounter_all: bool,
}

impl Default for AreaSettings {
    fn default() -> Self {
        Self {
            speed: 0.0,
            max_distance: 0.0,
            max_radius: default_max_radius(),
            init: false,
            init_mode_rounds: default_one(),
            level_mode: false,
            ignore_spinned_stops: true,
            layer: default_layer(),
            mon_ids_iv: Vec::new(),
            encounter_all: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AreaConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub mode: WorkerMode,
    #[serde(default)]
    pub geofence: Geofence,
    #[serde(default)]
    pub coords: Vec<Location>,
    /// Visited ahead of the regular route at the start of every round.
    #[serde(default)]
    pub prio_coords: Vec<Location>,
    #[serde(default)]
    pub settings: AreaSettings,
}

impl AreaConfig {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default)]
    pub post_teleport_delay: f64,
    #[serde(default)]
    pub post_walk_delay: f64,
    #[serde(default)]
    pub walk_after_teleport_distance: f64,
    #[serde(default)]
    pub cooldown_sleep: bool,
    /// Reboot instead of restarting the client once restarts are exhausted.
    #[serde(default = "default_true")]
    pub reboot: bool,
    #[serde(default)]
    pub restart_thresh: Option<u32>,
    #[serde(default)]
    pub reboot_thresh: Option<u32>,
    #[serde(default)]
    pub injection_thresh_reboot: Option<u32>,
    #[serde(default)]
    pub screendetection: bool,
    #[serde(default)]
    pub account_rotation: bool,
    #[serde(default)]
    pub rotation_waittime: f64,
    #[serde(default)]
    pub rotate_on_lvl_30: bool,
    #[serde(default)]
    pub accounts: u32,
    #[serde(default)]
    pub enhanced_mode_quest_safe_items: Vec<i32>,
    /// Seconds to wait for a correlated payload; mode default when unset.
    #[serde(default)]
    pub mitm_wait_timeout: Option<u64>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            post_teleport_delay: 0.0,
            post_walk_delay: 0.0,
            walk_after_teleport_distance: 0.0,
            cooldown_sleep: false,
            reboot: true,
            restart_thresh: None,
            reboot_thresh: None,
            injection_thresh_reboot: None,
            screendetection: false,
            account_rotation: false,
            rotation_waittime: 0.0,
            rotate_on_lvl_30: false,
            accounts: 1,
            enhanced_mode_quest_safe_items: Vec::new(),
            mitm_wait_timeout: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub origin: String,
    pub walker: String,
    #[serde(default)]
    pub settings: DeviceSettings,
}

/// Content of the mappings file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingsFile {
    #[serde(default)]
    pub areas: Vec<AreaConfig>,
    #[serde(default)]
    pub walkers: Vec<WalkerProgram>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub auths: HashMap<String, String>,
}

impl MappingsFile {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let file: MappingsFile = serde_json::from_str(raw)
            .map_err(|e| AppError::Config(format!("mappings file is invalid: {e}")))?;
        file.validate()?;
        Ok(file)
    }

    /// Every walker step must point at a known area and every device at a
    /// known walker.
    pub fn validate(&self) -> Result<(), AppError> {
        let mut areas = HashSet::new();
        for area in &self.areas {
            if !areas.insert(area.id.as_str()) {
                return Err(AppError::Validation {
                    field: "areas".to_string(),
                    message: format!("duplicate area id {}", area.id),
                });
            }
        }
        let walkers: HashSet<&str> = self.walkers.iter().map(|w| w.name.as_str()).collect();
        for walker in &self.walkers {
            if let Some(step) = walker.steps.iter().find(|s| !areas.contains(s.area_id.as_str())) {
                return Err(AppError::Validation {
                    field: "walkers".to_string(),
                    message: format!("walker {} references unknown area {}", walker.name, step.area_id),
                });
            }
        }
        let mut origins = HashSet::new();
        for device in &self.devices {
            if !origins.insert(device.origin.as_str()) {
                return Err(AppError::Validation {
                    field: "devices".to_string(),
                    message: format!("duplicate device {}", device.origin),
                });
            }
            if !walkers.contains(device.walker.as_str()) {
                return Err(AppError::Validation {
                    field: "devices".to_string(),
                    message: format!("device {} uses unknown walker {}", device.origin, device.walker),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"{
        "areas": [
            {"id": "north", "mode": "mon_mitm",
             "coords": [{"lat": 52.52, "lng": 13.405}, {"lat": 52.53, "lng": 13.41}],
             "settings": {"speed": 0}},
            {"id": "stops", "name": "Stops", "mode": "pokestops",
             "coords": [{"lat": 40.0, "lng": -105.0}],
             "settings": {"layer": "non_ar", "level_mode": true}}
        ],
        "walkers": [
            {"name": "day", "steps": [
                {"area_id": "north", "kind": "coords"},
                {"area_id": "stops", "kind": "round", "value": "1", "max_walkers": 1}
            ]}
        ],
        "devices": [
            {"origin": "dev1", "walker": "day", "settings": {"enhanced_mode_quest_safe_items": [1301]}},
            {"origin": "dev2", "walker": "day"}
        ],
        "auths": {"user": "secret"}
    }"#;

    #[test]
    fn sample_parses_with_defaults() {
        let file = MappingsFile::parse(SAMPLE).expect("parse");
        assert_eq!(file.areas.len(), 2);
        assert_eq!(file.areas[0].display_name(), "north");
        assert_eq!(file.areas[0].settings.max_radius, 70.0);
        assert_eq!(file.areas[1].settings.layer, QuestLayer::NonAr);
        assert!(file.devices[1].settings.reboot);
        assert_eq!(file.auths.get("user").map(String::as_str), Some("secret"));
    }

    #[test]
    fn unknown_references_are_rejected() {
        let raw = SAMPLE.replace(r#""walker": "day"}"#, r#""walker": "night"}"#);
        assert!(matches!(
            MappingsFile::parse(&raw),
            Err(AppError::Validation { field, .. }) if field == "devices"
        ));
        let raw = SAMPLE.replace(r#"{"area_id": "north", "kind": "coords"}"#, r#"{"area_id": "south", "kind": "coords"}"#);
        assert!(MappingsFile::parse(&raw).is_err());
        assert!(matches!(MappingsFile::parse("{"), Err(AppError::Config(_))));
    }
}
