// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use super::{ProtoSubmit, set_spawn_seen_quarter, spawndef_position_at};
use crate::common::time_utils::{naive_from_unix, naive_from_unix_ms};
use crate::domain::constants::{
    CACHE_TTL_INVENTORY, CACHE_TTL_ROUTE, CACHE_TTL_S2_CELL, CACHE_TTL_WEATHER, DEFAULT_EVENT_ID,
    DEFAULT_SPAWNDEF, EARLIEST_UNSEEN_UNKNOWN, MAX_TIME_TILL_HIDDEN_MS, S2_GMO_CELL_LEVEL,
};
use crate::domain::error::AppError;
use crate::domain::geo::Location;
use crate::domain::proto::{
    FortSearchOut, GetHoloholoInventoryOut, GetMapObjects, GetRoutesOut, QuestReward,
};
use crate::domain::s2::CellId;
use crate::domain::types::QuestLayer;
use crate::infrastructure::data::schema::StopRecord;
use chrono::Duration;
use std::collections::HashSet;

/// Reward columns derived from the first quest reward.
#[derive(Debug, Default, PartialEq, Eq)]
struct RewardColumns {
    reward_type: i32,
    stardust: i32,
    pokemon_id: i32,
    form: i32,
    costume: i32,
    item_id: i32,
    item_amount: i32,
}

impl RewardColumns {
    fn from_reward(reward: &QuestReward) -> Self {
        let mut cols = Self {
            reward_type: reward.reward_type,
            stardust: reward.stardust,
            pokemon_id: reward.pokemon_encounter.pokemon_id,
            form: reward.pokemon_encounter.pokemon_display.form,
            costume: reward.pokemon_encounter.pokemon_display.costume,
            item_id: reward.item.item,
            item_amount: reward.item.amount,
        };
        match reward.reward_type {
            1 => cols.stardust = reward.exp,
            4 => {
                cols.pokemon_id = reward.candy.pokemon_id;
                cols.item_amount = reward.candy.amount;
            }
            9 => {
                cols.pokemon_id = reward.xl_candy.pokemon_id;
                cols.item_amount = reward.xl_candy.amount;
            }
            12 => {
                cols.pokemon_id = reward.mega_resource.pokemon_id;
                cols.item_amount = reward.mega_resource.amount;
            }
            _ => {}
        }
        cols
    }
}

/// Plain task text; localized wording is rendered by consumers.
fn quest_task_text(quest_type: i32, target: i32) -> String {
    if target == 1 {
        format!("Complete 1 task of type {quest_type}")
    } else {
        format!("Complete {target} tasks of type {quest_type}")
    }
}

/// Spawn points are level-20 cells encoded as the 44 leading hex digits.
fn spawnpoint_location(spawnpoint: i64) -> Location {
    CellId::from_i64(spawnpoint << 20).center()
}

impl ProtoSubmit {
    pub(super) async fn spawnpoints(
        &self,
        gmo: &GetMapObjects,
        received_ts: i64,
    ) -> Result<usize, AppError> {
        let mut unique = HashSet::new();
        let sightings: Vec<(i64, i64)> = gmo
            .wild_pokemon()
            .filter_map(|m| m.spawnpoint().map(|sp| (sp, m.time_till_hidden_ms)))
            .filter(|(sp, _)| unique.insert(*sp))
            .collect();
        if sightings.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = sightings.iter().map(|(sp, _)| *sp).collect();
        let mut known = self.db.spawns_by_id(&ids).await?;
        let (event_id, _) = self.db.current_event().await?;
        let position = spawndef_position_at(received_ts);
        let now = naive_from_unix(received_ts);

        let mut tx = self.db.pool().begin().await?;
        for (spawnpoint, tth) in &sightings {
            let existing = known.remove(spawnpoint);
            let location = spawnpoint_location(*spawnpoint);
            let timed = (0..=MAX_TIME_TILL_HIDDEN_MS).contains(tth);

            let (
                old_def,
                mut eventid,
                first_detection,
                mut earliest,
                mut last_scanned,
                mut last_non_scanned,
                mut endminsec,
            ) = match &existing {
                Some(s) => (
                    s.spawndef,
                    s.eventid,
                    s.first_detection,
                    s.earliest_unseen,
                    s.last_scanned,
                    s.last_non_scanned,
                    s.calc_endminsec.clone(),
                ),
                None => (
                    DEFAULT_SPAWNDEF,
                    event_id,
                    now,
                    EARLIEST_UNSEEN_UNKNOWN,
                    None,
                    None,
                    None,
                ),
            };

            let same_event = eventid == event_id;
            let both_events = eventid != DEFAULT_EVENT_ID && event_id != DEFAULT_EVENT_ID;
            let spawndef = if existing.is_none() || same_event || both_events {
                if both_events {
                    eventid = event_id;
                }
                set_spawn_seen_quarter(old_def, position)
            } else {
                old_def
            };

            if timed {
                earliest = earliest.min(*tth);
                let despawn = now + Duration::milliseconds(*tth);
                endminsec = Some(despawn.format("%M:%S").to_string());
                last_scanned = Some(now);
            } else {
                last_non_scanned = Some(now);
            }

            sqlx::query(
                r#"
                INSERT INTO trs_spawn (
                    spawnpoint, latitude, longitude, spawndef, earliest_unseen, last_scanned,
                    first_detection, last_non_scanned, calc_endminsec, eventid
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(spawnpoint) DO UPDATE SET
                    spawndef = excluded.spawndef,
                    earliest_unseen = excluded.earliest_unseen,
                    last_scanned = excluded.last_scanned,
                    last_non_scanned = excluded.last_non_scanned,
                    calc_endminsec = excluded.calc_endminsec,
                    eventid = excluded.eventid
                "#,
            )
            .bind(spawnpoint)
            .bind(location.lat)
            .bind(location.lng)
            .bind(spawndef)
            .bind(earliest)
            .bind(last_scanned)
            .bind(first_detection)
            .bind(last_non_scanned)
            .bind(endminsec)
            .bind(eventid)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(sightings.len())
    }

    pub(super) async fn weather(&self, gmo: &GetMapObjects, received_ts: i64) -> Result<usize, AppError> {
        let now = naive_from_unix(received_ts);
        let mut keys = Vec::new();
        let mut tx = self.db.pool().begin().await?;
        for cw in &gmo.client_weather {
            let Some(display) = cw.display_weather.as_ref() else {
                continue;
            };
            let gameplay = cw.gameplay_weather.gameplay_condition;
            let key = format!(
                "weather{}{}{}{}{}{}{}",
                cw.s2_cell_id,
                display.rain_level,
                display.wind_level,
                display.snow_level,
                display.fog_level,
                display.wind_direction,
                gameplay
            );
            if self.seen(&key).await {
                continue;
            }
            let cell = CellId(cw.s2_cell_id);
            let center = cell.center();
            let (severity, warn) = cw
                .alerts
                .first()
                .map(|a| (a.severity, a.warn_weather))
                .unwrap_or((0, false));
            sqlx::query(
                r#"
                INSERT INTO weather (
                    s2_cell_id, latitude, longitude, cloud_level, rain_level, wind_level,
                    snow_level, fog_level, wind_direction, gameplay_weather, severity,
                    warn_weather, world_time, last_updated
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(s2_cell_id) DO UPDATE SET
                    cloud_level = excluded.cloud_level,
                    rain_level = excluded.rain_level,
                    wind_level = excluded.wind_level,
                    snow_level = excluded.snow_level,
                    fog_level = excluded.fog_level,
                    wind_direction = excluded.wind_direction,
                    gameplay_weather = excluded.gameplay_weather,
                    severity = excluded.severity,
                    warn_weather = excluded.warn_weather,
                    world_time = excluded.world_time,
                    last_updated = excluded.last_updated
                "#,
            )
            .bind(cell.as_i64())
            .bind(center.lat)
            .bind(center.lng)
            .bind(display.cloud_level)
            .bind(display.rain_level)
            .bind(display.wind_level)
            .bind(display.snow_level)
            .bind(display.fog_level)
            .bind(display.wind_direction)
            .bind(gameplay)
            .bind(severity)
            .bind(warn)
            .bind(gmo.time_of_day)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            keys.push(key);
        }
        tx.commit().await?;

        let count = keys.len();
        for key in keys {
            self.remember(&key, CACHE_TTL_WEATHER as i64).await;
        }
        Ok(count)
    }

    pub(super) async fn cells(&self, gmo: &GetMapObjects, received_ts: i64) -> Result<usize, AppError> {
        let mut keys = Vec::new();
        let mut tx = self.db.pool().begin().await?;
        for id in gmo.cell_ids() {
            let key = format!("s2cell{id}");
            if self.seen(&key).await {
                continue;
            }
            let cell = CellId(id);
            let center = cell.center();
            sqlx::query(
                r#"
                INSERT INTO trs_s2cells (id, level, center_latitude, center_longitude, updated)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET updated = excluded.updated
                "#,
            )
            .bind(cell.as_i64())
            .bind(S2_GMO_CELL_LEVEL as i64)
            .bind(center.lat)
            .bind(center.lng)
            .bind(received_ts)
            .execute(&mut *tx)
            .await?;
            keys.push(key);
        }
        tx.commit().await?;

        let count = keys.len();
        for key in keys {
            self.remember(&key, CACHE_TTL_S2_CELL as i64).await;
        }
        Ok(count)
    }

    pub async fn routes(&self, routes: &GetRoutesOut, received_ts: i64) -> Result<usize, AppError> {
        if routes.status != 1 {
            return Ok(0);
        }
        let now = naive_from_unix(received_ts);
        let mut keys = Vec::new();
        let mut tx = self.db.pool().begin().await?;
        for route in routes.route_map_cell.iter().flat_map(|c| c.route.iter()) {
            if route.id.is_empty() {
                continue;
            }
            let key = format!("route{}", route.id);
            if self.seen(&key).await {
                continue;
            }
            let status = &route.route_submission_status;
            let update_time = (status.submission_status_update_time_ms > 0)
                .then(|| naive_from_unix_ms(status.submission_status_update_time_ms));
            sqlx::query(
                r#"
                INSERT INTO route (
                    route_id, waypoints, type, path_type, name, version, description, reversible,
                    submission_time, route_distance_meters, route_duration_seconds, pins, tags,
                    image, image_border_color_hex, route_submission_status,
                    route_submission_update_time, start_poi_fort_id, start_poi_latitude,
                    start_poi_longitude, start_poi_image_url, end_poi_fort_id, end_poi_latitude,
                    end_poi_longitude, end_poi_image_url, last_updated
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(route_id) DO UPDATE SET
                    waypoints = excluded.waypoints,
                    type = excluded.type,
                    path_type = excluded.path_type,
                    name = excluded.name,
                    version = excluded.version,
                    description = excluded.description,
                    reversible = excluded.reversible,
                    submission_time = excluded.submission_time,
                    route_distance_meters = excluded.route_distance_meters,
                    route_duration_seconds = excluded.route_duration_seconds,
                    pins = excluded.pins,
                    tags = excluded.tags,
                    image = excluded.image,
                    image_border_color_hex = excluded.image_border_color_hex,
                    route_submission_status = excluded.route_submission_status,
                    route_submission_update_time = excluded.route_submission_update_time,
                    start_poi_fort_id = excluded.start_poi_fort_id,
                    start_poi_latitude = excluded.start_poi_latitude,
                    start_poi_longitude = excluded.start_poi_longitude,
                    start_poi_image_url = excluded.start_poi_image_url,
                    end_poi_fort_id = excluded.end_poi_fort_id,
                    end_poi_latitude = excluded.end_poi_latitude,
                    end_poi_longitude = excluded.end_poi_longitude,
                    end_poi_image_url = excluded.end_poi_image_url,
                    last_updated = excluded.last_updated
                "#,
            )
            .bind(&route.id)
            .bind(serde_json::to_string(&route.waypoints)?)
            .bind(route.route_type)
            .bind(route.path_type)
            .bind(&route.name)
            .bind(route.version)
            .bind(&route.description)
            .bind(route.reversible)
            .bind(naive_from_unix_ms(route.submission_time))
            .bind(route.route_distance_meters)
            .bind(route.route_duration_seconds)
            .bind(serde_json::to_string(&route.pins)?)
            .bind(serde_json::to_string(&route.tags)?)
            .bind(&route.image.image_url)
            .bind(&route.image.border_color_hex)
            .bind(status.status)
            .bind(update_time)
            .bind(&route.start_poi.anchor.fort_id)
            .bind(route.start_poi.anchor.lat_degrees)
            .bind(route.start_poi.anchor.lng_degrees)
            .bind(&route.start_poi.image_url)
            .bind(&route.end_poi.anchor.fort_id)
            .bind(route.end_poi.anchor.lat_degrees)
            .bind(route.end_poi.anchor.lng_degrees)
            .bind(&route.end_poi.image_url)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            keys.push(key);
        }
        tx.commit().await?;

        let count = keys.len();
        for key in keys {
            self.remember(&key, CACHE_TTL_ROUTE as i64).await;
        }
        Ok(count)
    }

    /// Stores the quest a spin handed out. False when the payload carries
    /// no quest.
    pub async fn quest(
        &self,
        origin: &str,
        search: &FortSearchOut,
        layer: QuestLayer,
        received_ts: i64,
    ) -> Result<bool, AppError> {
        if search.fort_id.is_empty() {
            return Ok(false);
        }
        let Some(challenge) = search.challenge_quest.as_ref() else {
            return Ok(false);
        };
        let quest = &challenge.quest;
        let Some(reward) = quest.quest_rewards.first() else {
            return Ok(false);
        };
        let cols = RewardColumns::from_reward(reward);

        sqlx::query(
            r#"
            INSERT INTO trs_quest (
                GUID, layer, quest_type, quest_timestamp, quest_stardust, quest_pokemon_id,
                quest_pokemon_form_id, quest_pokemon_costume_id, quest_reward_type,
                quest_item_id, quest_item_amount, quest_target, quest_condition, quest_reward,
                quest_template, quest_task, quest_title
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(GUID, layer) DO UPDATE SET
                quest_type = excluded.quest_type,
                quest_timestamp = excluded.quest_timestamp,
                quest_stardust = excluded.quest_stardust,
                quest_pokemon_id = excluded.quest_pokemon_id,
                quest_pokemon_form_id = excluded.quest_pokemon_form_id,
                quest_pokemon_costume_id = excluded.quest_pokemon_costume_id,
                quest_reward_type = excluded.quest_reward_type,
                quest_item_id = excluded.quest_item_id,
                quest_item_amount = excluded.quest_item_amount,
                quest_target = excluded.quest_target,
                quest_condition = excluded.quest_condition,
                quest_reward = excluded.quest_reward,
                quest_template = excluded.quest_template,
                quest_task = excluded.quest_task,
                quest_title = excluded.quest_title
            "#,
        )
        .bind(&search.fort_id)
        .bind(layer.as_i32())
        .bind(quest.quest_type)
        .bind(received_ts)
        .bind(cols.stardust)
        .bind(cols.pokemon_id)
        .bind(cols.form)
        .bind(cols.costume)
        .bind(cols.reward_type)
        .bind(cols.item_id)
        .bind(cols.item_amount)
        .bind(quest.goal.target)
        .bind(serde_json::to_string(&quest.goal.condition)?)
        .bind(serde_json::to_string(&quest.quest_rewards)?)
        .bind(&quest.template_id)
        .bind(quest_task_text(quest.quest_type, quest.goal.target))
        .bind(&challenge.quest_display.title)
        .execute(self.db.pool())
        .await?;

        tracing::info!(
            target: "submit",
            origin = %origin,
            stop = %search.fort_id,
            layer = layer.as_i32(),
            quest_type = quest.quest_type,
            reward_type = cols.reward_type,
            "Quest stored"
        );
        Ok(true)
    }

    /// Player level from an inventory payload, at most once a minute per
    /// device. Returns the level when it was written.
    pub async fn update_player_level(
        &self,
        origin: &str,
        inventory: &GetHoloholoInventoryOut,
    ) -> Result<Option<i32>, AppError> {
        let Some(stats) = inventory.player_stats() else {
            return Ok(None);
        };
        let key = format!("inv_data_{origin}_processed");
        if self.seen(&key).await {
            return Ok(None);
        }
        self.db
            .upsert_device_level(origin, &self.settings.instance_name, stats.level)
            .await?;
        self.remember(&key, CACHE_TTL_INVENTORY as i64).await;
        tracing::debug!(target: "submit", origin = %origin, level = stats.level, "Player level updated");
        Ok(Some(stats.level))
    }

    pub async fn record_softban_action(
        &self,
        origin: &str,
        location: &Location,
        at_unix: i64,
    ) -> Result<(), AppError> {
        self.db
            .record_softban_action(origin, &self.settings.instance_name, location, at_unix)
            .await
    }

    pub async fn stops_near_location(
        &self,
        location: &Location,
        radius_m: f64,
    ) -> Result<Vec<StopRecord>, AppError> {
        self.db.stops_within(location, radius_m).await
    }

    pub async fn delete_stop(&self, stop_id: &str) -> Result<bool, AppError> {
        self.db.delete_stop(stop_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::submitter;
    use super::*;
    use crate::infrastructure::data::schema::SpawnRecord;
    use serde_json::json;

    // 2025-06-15 15:06:40 UTC, minute 6 -> quarter p = 4.
    const RECEIVED: i64 = 1_750_000_000;

    fn gmo(tth_ms: i64) -> GetMapObjects {
        serde_json::from_value(json!({
            "map_cells": [{
                "s2_cell_id": 5,
                "wild_pokemon": [{
                    "encounter_id": 1,
                    "spawn_point_id": "47a851dfecc",
                    "time_till_hidden_ms": tth_ms,
                    "pokemon": {"id": 1}
                }]
            }]
        }))
        .expect("gmo")
    }

    async fn spawn(submit: &ProtoSubmit) -> SpawnRecord {
        sqlx::query_as::<_, SpawnRecord>("SELECT * FROM trs_spawn")
            .fetch_one(submit.db().pool())
            .await
            .expect("spawn")
    }

    #[tokio::test]
    async fn unknown_despawn_creates_placeholder_spawn() {
        let submit = submitter().await;
        submit.spawnpoints(&gmo(-1), RECEIVED).await.expect("spawn");
        let row = spawn(&submit).await;
        assert_eq!(row.earliest_unseen, EARLIEST_UNSEEN_UNKNOWN);
        assert_eq!(row.spawndef, set_spawn_seen_quarter(DEFAULT_SPAWNDEF, 4));
        assert_eq!(row.eventid, DEFAULT_EVENT_ID);
        assert!(row.last_scanned.is_none());
        assert_eq!(row.last_non_scanned, Some(naive_from_unix(RECEIVED)));
        assert_eq!(row.calc_endminsec, None);

        let expected = spawnpoint_location(0x47a851dfecc);
        assert!((row.latitude - expected.lat).abs() < 1e-9);
    }

    #[tokio::test]
    async fn timed_sighting_sets_despawn_mark_and_keeps_minimum() {
        let submit = submitter().await;
        submit.spawnpoints(&gmo(60_000), RECEIVED).await.expect("first");
        let row = spawn(&submit).await;
        assert_eq!(row.earliest_unseen, 60_000);
        assert_eq!(row.calc_endminsec.as_deref(), Some("07:40"));

        submit.spawnpoints(&gmo(80_000), RECEIVED + 1).await.expect("second");
        assert_eq!(spawn(&submit).await.earliest_unseen, 60_000);
        submit.spawnpoints(&gmo(30_000), RECEIVED + 2).await.expect("third");
        assert_eq!(spawn(&submit).await.earliest_unseen, 30_000);
    }

    #[tokio::test]
    async fn quest_reward_columns_follow_reward_type() {
        let submit = submitter().await;
        let search: FortSearchOut = serde_json::from_value(json!({
            "result": 1,
            "fort_id": "stop-1",
            "items": [{"item": 1, "count": 1}],
            "challenge_quest": {
                "quest": {
                    "quest_type": 4,
                    "template_id": "t1",
                    "goal": {"target": 3, "condition": [{"type": 1}]},
                    "quest_rewards": [{"type": 4, "candy": {"pokemon_id": 25, "amount": 3}}]
                },
                "quest_display": {"title": "catch"}
            }
        }))
        .expect("search");
        assert!(submit.quest("dev1", &search, QuestLayer::NonAr, RECEIVED).await.expect("quest"));

        let stored = submit
            .db()
            .quest_for("stop-1", QuestLayer::NonAr)
            .await
            .expect("load")
            .expect("row");
        assert_eq!(stored.quest_reward_type, 4);
        assert_eq!(stored.quest_pokemon_id, 25);
        assert_eq!(stored.quest_item_amount, 3);
        assert_eq!(stored.quest_target, 3);
        assert_eq!(stored.quest_timestamp, RECEIVED);
        assert!(submit.db().quest_for("stop-1", QuestLayer::Ar).await.expect("ar").is_none());

        let stardust = RewardColumns::from_reward(&QuestReward {
            reward_type: 1,
            exp: 500,
            ..Default::default()
        });
        assert_eq!(stardust.stardust, 500);
    }

    #[tokio::test]
    async fn spin_without_quest_is_not_stored() {
        let submit = submitter().await;
        let search = FortSearchOut {
            result: 1,
            fort_id: "stop-1".into(),
            ..Default::default()
        };
        assert!(!submit.quest("dev1", &search, QuestLayer::Ar, RECEIVED).await.expect("quest"));
    }

    #[tokio::test]
    async fn inventory_level_is_rate_limited() {
        let submit = submitter().await;
        let inv: GetHoloholoInventoryOut = serde_json::from_value(json!({
            "inventory_delta": {"inventory_item": [
                {"inventory_item_data": {"player_stats": {"level": 33}}}
            ]}
        }))
        .expect("inventory");
        assert_eq!(submit.update_player_level("dev1", &inv).await.expect("level"), Some(33));
        assert_eq!(submit.update_player_level("dev1", &inv).await.expect("level"), None);
        let status = submit.db().device_status("dev1").await.expect("load").expect("row");
        assert_eq!(status.level, 33);
    }

    #[tokio::test]
    async fn routes_require_ok_status() {
        let submit = submitter().await;
        let mut payload: GetRoutesOut = serde_json::from_value(json!({
            "status": 2,
            "route_map_cell": [{"s2_cell_id": 1, "route": [{
                "id": "r1", "name": "Park loop", "submission_time": 1_700_000_000_000i64,
                "tags": ["nature"],
                "start_poi": {"anchor": {"fort_id": "a", "lat_degrees": 1.0, "lng_degrees": 2.0}},
                "end_poi": {"anchor": {"fort_id": "b", "lat_degrees": 1.1, "lng_degrees": 2.1}}
            }]}]
        }))
        .expect("routes");
        assert_eq!(submit.routes(&payload, RECEIVED).await.expect("routes"), 0);
        payload.status = 1;
        assert_eq!(submit.routes(&payload, RECEIVED).await.expect("routes"), 1);
        let tags: String = sqlx::query_scalar("SELECT tags FROM route WHERE route_id = 'r1'")
            .fetch_one(submit.db().pool())
            .await
            .expect("tags");
        assert_eq!(tags, r#"["nature"]"#);
    }

    #[tokio::test]
    async fn empty_gmo_writes_nothing() {
        let submit = submitter().await;
        let outcome = submit
            .gmo("dev1", &GetMapObjects::default(), RECEIVED)
            .await
            .expect("gmo");
        assert_eq!(outcome, super::super::GmoOutcome::default());
        let cells: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trs_s2cells")
            .fetch_one(submit.db().pool())
            .await
            .expect("count");
        assert_eq!(cells, 0);
    }

    #[tokio::test]
    async fn weather_lands_on_cell_center() {
        let submit = submitter().await;
        let cell = CellId::from_location_at(&Location::new(52.5, 13.4), 10);
        let gmo: GetMapObjects = serde_json::from_value(json!({
            "map_cells": [{"s2_cell_id": 5}],
            "time_of_day": 2,
            "client_weather": [
                {"s2_cell_id": cell.0, "display_weather": {"rain_level": 2},
                 "gameplay_weather": {"gameplay_condition": 2},
                 "alerts": [{"severity": 1, "warn_weather": true}]},
                {"s2_cell_id": 99}
            ]
        }))
        .expect("gmo");
        assert_eq!(submit.weather(&gmo, RECEIVED).await.expect("weather"), 1);
        let (gameplay, severity, world_time): (i64, i64, i64) = sqlx::query_as(
            "SELECT gameplay_weather, severity, world_time FROM weather WHERE s2_cell_id = ?",
        )
        .bind(cell.as_i64())
        .fetch_one(submit.db().pool())
        .await
        .expect("weather");
        assert_eq!((gameplay, severity, world_time), (2, 1, 2));
    }
}
