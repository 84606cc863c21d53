// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use super::{DataProcessor, ProcessorItem};
use crate::common::time_utils::current_unix;
use crate::domain::constants::ENCOUNTERED_TTL_SECS;
use crate::domain::error::AppError;
use crate::domain::proto::{
    DiskEncounterOut, EncounterOut, FortDetailsOut, FortSearchOut, GetHoloholoInventoryOut,
    GetMapObjects, GetRoutesOut, GymGetInfoOut, ProtoIdentifier,
};
use crate::domain::types::{QuestLayer, SeenType, determine_current_quest_layer};
use crate::services::mitm_mapper::LatestPayload;
use serde::de::DeserializeOwned;

fn decode<T: DeserializeOwned>(payload: &LatestPayload, method: ProtoIdentifier) -> Result<T, AppError> {
    let value = payload
        .as_json()
        .ok_or_else(|| AppError::Decode(format!("{method:?}: payload is not JSON")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| AppError::Decode(format!("{method:?}: {e}")))
}

impl DataProcessor {
    /// Routes one payload by method id. The per-device latest store is only
    /// updated on the first attempt so retries cannot regress it.
    pub async fn process(&self, item: &ProcessorItem) -> Result<(), AppError> {
        let origin = item.origin.as_str();
        let raw = &item.payload;

        if item.attempts == 0 {
            self.mapper
                .update_latest(
                    origin,
                    &raw.method.to_string(),
                    raw.payload.clone(),
                    item.arrival_ts,
                    raw.device_ts,
                    raw.location,
                )
                .await;
        }

        let Some(method) = ProtoIdentifier::from_method(raw.method) else {
            tracing::debug!(target: "processor", origin, method = raw.method, "Ignoring unhandled method");
            return Ok(());
        };
        if matches!(raw.payload, LatestPayload::Empty) {
            return Ok(());
        }

        match method {
            ProtoIdentifier::Gmo => {
                let gmo: GetMapObjects = decode(&raw.payload, method)?;
                self.on_gmo(origin, &gmo, item.arrival_ts).await
            }
            ProtoIdentifier::Encounter => {
                let encounter: EncounterOut = decode(&raw.payload, method)?;
                self.on_encounter(origin, &encounter, item.arrival_ts).await
            }
            ProtoIdentifier::DiskEncounter => {
                let encounter: DiskEncounterOut = decode(&raw.payload, method)?;
                self.on_lure_encounter(origin, &encounter, item.arrival_ts).await
            }
            ProtoIdentifier::FortSearch => {
                let search: FortSearchOut = decode(&raw.payload, method)?;
                self.on_fort_search(item, &search).await
            }
            ProtoIdentifier::FortDetails => {
                let details: FortDetailsOut = decode(&raw.payload, method)?;
                self.submit.stop_details(&details, item.arrival_ts).await?;
                Ok(())
            }
            ProtoIdentifier::GymInfo => {
                let info: GymGetInfoOut = decode(&raw.payload, method)?;
                self.submit.gym_info(&info).await?;
                Ok(())
            }
            ProtoIdentifier::GetRoutes => {
                let routes: GetRoutesOut = decode(&raw.payload, method)?;
                self.submit.routes(&routes, item.arrival_ts).await?;
                Ok(())
            }
            ProtoIdentifier::Inventory => {
                let inventory: GetHoloholoInventoryOut = decode(&raw.payload, method)?;
                self.on_inventory(origin, &inventory).await
            }
        }
    }

    async fn on_gmo(&self, origin: &str, gmo: &GetMapObjects, ts: i64) -> Result<(), AppError> {
        let outcome = self.submit.gmo(origin, gmo, ts).await?;
        self.stats.stats_collect_wild_mon(origin, &outcome.wild, ts).await;
        self.stats.stats_collect_seen_type(&outcome.wild, SeenType::Wild, ts).await;
        self.stats
            .stats_collect_seen_type(&outcome.nearby_cell, SeenType::NearbyCell, ts)
            .await;
        self.stats
            .stats_collect_seen_type(&outcome.nearby_stop, SeenType::NearbyStop, ts)
            .await;
        self.stats
            .stats_collect_seen_type(&outcome.lure_wild, SeenType::LureWild, ts)
            .await;
        self.stats.stats_collect_raid(origin, outcome.raids).await;
        Ok(())
    }

    async fn level_allows_iv(&self, origin: &str) -> bool {
        let level = self.mapper.get_level(origin).await;
        if level < self.settings.min_level_iv {
            tracing::debug!(
                target: "processor",
                origin,
                level,
                min = self.settings.min_level_iv,
                "Ignoring encounter below the IV level"
            );
            return false;
        }
        true
    }

    async fn on_encounter(&self, origin: &str, encounter: &EncounterOut, ts: i64) -> Result<(), AppError> {
        if !self.level_allows_iv(origin).await {
            return Ok(());
        }
        if let Some(outcome) = self.submit.mon_iv(origin, encounter, ts).await? {
            self.stats
                .stats_collect_mon_iv(origin, outcome.encounter_id, outcome.is_shiny, ts)
                .await;
            self.stats
                .stats_collect_seen_type(&[outcome.encounter_id], SeenType::Encounter, ts)
                .await;
            self.mapper
                .add_encountered(origin, &[outcome.encounter_id], current_unix() + ENCOUNTERED_TTL_SECS)
                .await;
        }
        Ok(())
    }

    async fn on_lure_encounter(
        &self,
        origin: &str,
        encounter: &DiskEncounterOut,
        ts: i64,
    ) -> Result<(), AppError> {
        if !self.level_allows_iv(origin).await {
            return Ok(());
        }
        if let Some(outcome) = self.submit.mon_lure_iv(origin, encounter, ts).await? {
            self.stats
                .stats_collect_mon_iv(origin, outcome.encounter_id, outcome.is_shiny, ts)
                .await;
            self.stats
                .stats_collect_seen_type(&[outcome.encounter_id], SeenType::LureEncounter, ts)
                .await;
        }
        Ok(())
    }

    /// Layer the quest belongs to: the mapping's choice for the area, else
    /// whatever the held quests imply.
    async fn quest_layer(&self, origin: &str) -> QuestLayer {
        match self.mapping.get_quest_layer_to_scan(origin).await {
            Ok(Some(raw)) => {
                if let Some(layer) = QuestLayer::from_i32(raw) {
                    return layer;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(target: "processor", origin, error = %e, "Quest layer lookup failed");
            }
        }
        let held = self.mapper.get_quests_held(origin).await;
        determine_current_quest_layer(held.as_deref()).unwrap_or(QuestLayer::Ar)
    }

    async fn on_fort_search(&self, item: &ProcessorItem, search: &FortSearchOut) -> Result<(), AppError> {
        let origin = item.origin.as_str();
        if search.result == 1 {
            let location = match item.payload.location {
                Some(location) => Some(location),
                None => self.mapper.get_last_known_location(origin).await,
            };
            if let Some(location) = location {
                self.submit
                    .record_softban_action(origin, &location, item.arrival_ts)
                    .await?;
            }
        }

        let layer = self.quest_layer(origin).await;
        if self.submit.quest(origin, search, layer, item.arrival_ts).await? {
            self.stats.stats_collect_quest(origin).await;
        }
        Ok(())
    }

    async fn on_inventory(&self, origin: &str, inventory: &GetHoloholoInventoryOut) -> Result<(), AppError> {
        let Some(stats) = inventory.player_stats() else {
            return Ok(());
        };
        self.mapper.set_level(origin, stats.level).await;
        self.mapper.set_stops_visited(origin, stats.poke_stop_visits).await;
        self.submit.update_player_level(origin, inventory).await?;
        Ok(())
    }
}
