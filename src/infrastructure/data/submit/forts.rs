// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use super::ProtoSubmit;
use crate::common::time_utils::{naive_from_unix, naive_from_unix_ms};
use crate::domain::constants::{
    CACHE_TTL_CELL_FORTS, CACHE_TTL_GYM, CACHE_TTL_RAID, CACHE_TTL_STOP, CACHE_TTL_STOP_DETAILS,
    S2_WEATHER_CELL_LEVEL,
};
use crate::domain::error::AppError;
use crate::domain::proto::{
    Fort, FortDetailsOut, FortType, GetMapObjects, GymGetInfoOut, IncidentDisplay,
};
use crate::domain::s2::CellId;
use chrono::{Duration, NaiveDateTime};
use sqlx::SqliteConnection;

async fn insert_incident(
    conn: &mut SqliteConnection,
    stop_id: &str,
    incident: &IncidentDisplay,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO pokestop_incident (
            pokestop_id, incident_id, incident_start, incident_expiration, hide_incident,
            incident_display_type, incident_display_order_priority, custom_display,
            is_cross_stop_incident, character_display
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(pokestop_id, incident_id) DO UPDATE SET
            incident_start = excluded.incident_start,
            incident_expiration = excluded.incident_expiration,
            hide_incident = excluded.hide_incident,
            incident_display_type = excluded.incident_display_type,
            incident_display_order_priority = excluded.incident_display_order_priority,
            custom_display = excluded.custom_display,
            is_cross_stop_incident = excluded.is_cross_stop_incident,
            character_display = excluded.character_display
        "#,
    )
    .bind(stop_id)
    .bind(&incident.incident_id)
    .bind(naive_from_unix_ms(incident.incident_start_ms))
    .bind(naive_from_unix_ms(incident.incident_expiration_ms))
    .bind(incident.hide_incident)
    .bind(incident.incident_display_type)
    .bind(incident.incident_display_order_priority)
    .bind(&incident.custom_display.style_config_address)
    .bind(incident.is_cross_stop_incident)
    .bind(incident.character_display.as_ref().map(|c| c.character))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn fort_fingerprint(forts: &[&Fort], revision: impl Fn(&Fort) -> String) -> String {
    forts
        .iter()
        .map(|f| format!("{}:{}", f.fort_id, revision(f)))
        .collect::<Vec<_>>()
        .join(",")
}

async fn upsert_gym(
    conn: &mut SqliteConnection,
    fort: &Fort,
    weather: i32,
    now: NaiveDateTime,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO gym (
            gym_id, team_id, guard_pokemon_id, slots_available, enabled, latitude,
            longitude, total_cp, is_in_battle, weather_boosted_condition, last_modified,
            last_scanned, is_ex_raid_eligible, is_ar_scan_eligible
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(gym_id) DO UPDATE SET
            team_id = excluded.team_id,
            guard_pokemon_id = excluded.guard_pokemon_id,
            slots_available = excluded.slots_available,
            enabled = excluded.enabled,
            latitude = excluded.latitude,
            longitude = excluded.longitude,
            total_cp = excluded.total_cp,
            is_in_battle = excluded.is_in_battle,
            weather_boosted_condition = excluded.weather_boosted_condition,
            last_modified = excluded.last_modified,
            last_scanned = excluded.last_scanned,
            is_ex_raid_eligible = excluded.is_ex_raid_eligible,
            is_ar_scan_eligible = excluded.is_ar_scan_eligible
        "#,
    )
    .bind(&fort.fort_id)
    .bind(fort.team)
    .bind(fort.guard_pokemon_id)
    .bind(fort.gym_display.slots_available)
    .bind(fort.enabled)
    .bind(fort.latitude)
    .bind(fort.longitude)
    .bind(fort.gym_display.total_gym_cp)
    .bind(fort.is_in_battle)
    .bind(weather)
    .bind(naive_from_unix_ms(fort.last_modified_ms))
    .bind(now)
    .bind(fort.is_ex_raid_eligible)
    .bind(fort.is_ar_scan_eligible)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO gymdetails (gym_id, name, url, last_scanned)
        VALUES (?, 'unknown', ?, ?)
        ON CONFLICT(gym_id) DO UPDATE SET
            url = CASE WHEN excluded.url != '' THEN excluded.url ELSE gymdetails.url END,
            last_scanned = excluded.last_scanned
        "#,
    )
    .bind(&fort.fort_id)
    .bind(&fort.image_url)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn cell_weather(conn: &mut SqliteConnection, fort: &Fort) -> Result<i32, AppError> {
    let cell = CellId::from_location_at(&fort.location(), S2_WEATHER_CELL_LEVEL);
    let weather: Option<i32> =
        sqlx::query_scalar("SELECT gameplay_weather FROM weather WHERE s2_cell_id = ?")
            .bind(cell.as_i64())
            .fetch_optional(&mut *conn)
            .await?;
    Ok(weather.unwrap_or_default())
}

impl ProtoSubmit {
    pub(super) async fn stops(&self, gmo: &GetMapObjects, received_ts: i64) -> Result<usize, AppError> {
        let mut pending = Vec::new();
        let mut cells = Vec::new();
        for cell in &gmo.map_cells {
            let stops: Vec<&Fort> = cell
                .forts
                .iter()
                .filter(|f| f.fort_type == FortType::Stop && !f.fort_id.is_empty())
                .collect();
            if stops.is_empty() {
                continue;
            }
            let cell_key = format!("stops_{}", cell.s2_cell_id);
            let fingerprint = fort_fingerprint(&stops, |f| f.last_modified_ms.to_string());
            if self.cell_unchanged(&cell_key, &fingerprint).await {
                continue;
            }
            for fort in stops {
                let key = format!("stop{}{}", fort.fort_id, fort.last_modified_ms);
                if !self.seen(&key).await {
                    pending.push((fort, key));
                }
            }
            cells.push((cell_key, fingerprint));
        }
        if pending.is_empty() {
            return Ok(0);
        }

        let (_, event_lure) = self.db.current_event().await?;
        let lure_minutes = if event_lure > 0 {
            event_lure
        } else {
            self.settings.lure_duration_minutes
        };
        let now = naive_from_unix(received_ts);

        let mut tx = self.db.pool().begin().await?;
        for (fort, _) in &pending {
            let last_modified = naive_from_unix_ms(fort.last_modified_ms);
            let (lure_expiration, modifier): (Option<NaiveDateTime>, Option<i32>) =
                match fort.active_fort_modifier.first() {
                    Some(m) => (Some(last_modified + Duration::minutes(lure_minutes)), Some(*m)),
                    None => (None, None),
                };
            sqlx::query(
                r#"
                INSERT INTO pokestop (
                    pokestop_id, enabled, latitude, longitude, last_modified, lure_expiration,
                    active_fort_modifier, last_updated, is_ar_scan_eligible
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(pokestop_id) DO UPDATE SET
                    enabled = excluded.enabled,
                    latitude = excluded.latitude,
                    longitude = excluded.longitude,
                    last_modified = excluded.last_modified,
                    lure_expiration = excluded.lure_expiration,
                    active_fort_modifier = excluded.active_fort_modifier,
                    last_updated = excluded.last_updated,
                    is_ar_scan_eligible = excluded.is_ar_scan_eligible
                "#,
            )
            .bind(&fort.fort_id)
            .bind(fort.enabled)
            .bind(fort.latitude)
            .bind(fort.longitude)
            .bind(last_modified)
            .bind(lure_expiration)
            .bind(modifier.map(|m| m.to_string()))
            .bind(now)
            .bind(fort.is_ar_scan_eligible)
            .execute(&mut *tx)
            .await?;

            let incidents = fort
                .pokestop_display
                .iter()
                .chain(fort.pokestop_displays.iter())
                .filter(|i| !i.incident_id.is_empty());
            for incident in incidents {
                insert_incident(&mut tx, &fort.fort_id, incident).await?;
            }
        }
        tx.commit().await?;

        let count = pending.len();
        for (_, key) in pending {
            self.remember(&key, CACHE_TTL_STOP as i64).await;
        }
        for (cell_key, fingerprint) in cells {
            self.remember_value(&cell_key, &fingerprint, CACHE_TTL_CELL_FORTS as i64)
                .await;
        }
        Ok(count)
    }

    /// Name and image of a stop from its detail view. Gyms are handled by
    /// the gym info path.
    pub async fn stop_details(
        &self,
        details: &FortDetailsOut,
        received_ts: i64,
    ) -> Result<bool, AppError> {
        if details.fort_type != FortType::Stop || details.id.is_empty() {
            return Ok(false);
        }
        let key = format!("stopdetail{}0", details.id);
        if self.seen(&key).await {
            return Ok(false);
        }
        let now = naive_from_unix(received_ts);
        if let Some(existing) = self.db.stop_by_id(&details.id).await?
            && existing.last_updated.is_some_and(|updated| updated > now)
        {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO pokestop (
                pokestop_id, enabled, latitude, longitude, last_modified, last_updated, name, image
            ) VALUES (?, 1, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(pokestop_id) DO UPDATE SET
                name = excluded.name,
                image = excluded.image,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(&details.id)
        .bind(details.latitude)
        .bind(details.longitude)
        .bind(naive_from_unix(0))
        .bind(now)
        .bind(&details.name)
        .bind(details.image_url.first())
        .execute(self.db.pool())
        .await?;

        self.remember(&key, CACHE_TTL_STOP_DETAILS as i64).await;
        Ok(true)
    }

    pub(super) async fn gyms(&self, gmo: &GetMapObjects, received_ts: i64) -> Result<usize, AppError> {
        let now = naive_from_unix(received_ts);
        let mut keys = Vec::new();
        let mut cells = Vec::new();

        let mut tx = self.db.pool().begin().await?;
        for cell in &gmo.map_cells {
            let mut gyms = Vec::new();
            for fort in cell
                .forts
                .iter()
                .filter(|f| f.fort_type == FortType::Gym && !f.fort_id.is_empty())
            {
                gyms.push((fort, cell_weather(&mut tx, fort).await?));
            }
            if gyms.is_empty() {
                continue;
            }
            let cell_key = format!("gyms_{}", cell.s2_cell_id);
            let fingerprint = gyms
                .iter()
                .map(|(f, w)| format!("{}:{}:{}", f.fort_id, f.last_modified_ms, w))
                .collect::<Vec<_>>()
                .join(",");
            if self.cell_unchanged(&cell_key, &fingerprint).await {
                continue;
            }
            cells.push((cell_key, fingerprint));

            for (fort, weather) in gyms {
                let key = format!("gym{}{}{}", fort.fort_id, fort.last_modified_ms, weather);
                if self.seen(&key).await {
                    continue;
                }
                upsert_gym(&mut tx, fort, weather, now).await?;
                keys.push(key);
            }
        }
        tx.commit().await?;

        let count = keys.len();
        for key in keys {
            self.remember(&key, CACHE_TTL_GYM as i64).await;
        }
        for (cell_key, fingerprint) in cells {
            self.remember_value(&cell_key, &fingerprint, CACHE_TTL_CELL_FORTS as i64)
                .await;
        }
        Ok(count)
    }

    /// Gym detail view; fills in name, description and image of a known gym.
    pub async fn gym_info(&self, info: &GymGetInfoOut) -> Result<bool, AppError> {
        if info.result != 1 {
            return Ok(false);
        }
        let Some(gym_id) = info.gym_id() else {
            return Ok(false);
        };
        let updated = sqlx::query(
            r#"
            UPDATE gymdetails SET
                name = COALESCE(NULLIF(?, ''), name),
                description = COALESCE(NULLIF(?, ''), description),
                url = COALESCE(NULLIF(?, ''), url)
            WHERE gym_id = ?
            "#,
        )
        .bind(&info.name)
        .bind(&info.description)
        .bind(&info.url)
        .bind(gym_id)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Raid eggs and bosses. Returns how many carried a boss.
    pub(super) async fn raids(&self, gmo: &GetMapObjects, received_ts: i64) -> Result<usize, AppError> {
        let now = naive_from_unix(received_ts);
        let mut keys = Vec::new();
        let mut bosses = 0;

        let mut tx = self.db.pool().begin().await?;
        for fort in gmo.forts().filter(|f| f.fort_type == FortType::Gym) {
            let Some(raid) = fort.raid_info.as_ref() else {
                continue;
            };
            if raid.raid_pokemon.is_some() {
                bosses += 1;
            }
            let boss = raid.raid_pokemon.as_ref().filter(|p| p.id > 0);
            let pokemon_id = boss.map(|p| p.id);
            let end_sec = raid.raid_end_ms / 1000;
            let key = format!(
                "raid{}{}{}",
                fort.fort_id,
                pokemon_id.unwrap_or_default(),
                end_sec
            );
            if self.seen(&key).await {
                continue;
            }

            let stored: Option<NaiveDateTime> =
                sqlx::query_scalar("SELECT last_scanned FROM raid WHERE gym_id = ?")
                    .bind(&fort.fort_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if stored.is_some_and(|last| last > now) {
                continue;
            }

            let (cp, move_1, move_2, form, gender, costume, evolution) = match boss {
                Some(p) => (
                    p.cp,
                    p.move1,
                    p.move2,
                    p.pokemon_display.form,
                    p.pokemon_display.gender,
                    p.pokemon_display.costume,
                    p.pokemon_display.current_temp_evolution,
                ),
                None => (0, 1, 2, 0, 0, 0, 0),
            };
            sqlx::query(
                r#"
                INSERT INTO raid (
                    gym_id, level, spawn, start, "end", pokemon_id, cp, move_1, move_2,
                    last_scanned, form, gender, costume, evolution, is_exclusive
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(gym_id) DO UPDATE SET
                    level = excluded.level,
                    spawn = excluded.spawn,
                    start = excluded.start,
                    "end" = excluded."end",
                    pokemon_id = excluded.pokemon_id,
                    cp = excluded.cp,
                    move_1 = excluded.move_1,
                    move_2 = excluded.move_2,
                    last_scanned = excluded.last_scanned,
                    form = excluded.form,
                    gender = excluded.gender,
                    costume = excluded.costume,
                    evolution = excluded.evolution,
                    is_exclusive = excluded.is_exclusive
                "#,
            )
            .bind(&fort.fort_id)
            .bind(raid.raid_level)
            .bind(naive_from_unix_ms(raid.raid_spawn_ms))
            .bind(naive_from_unix_ms(raid.raid_battle_ms))
            .bind(naive_from_unix_ms(raid.raid_end_ms))
            .bind(pokemon_id)
            .bind(cp)
            .bind(move_1)
            .bind(move_2)
            .bind(now)
            .bind(form)
            .bind(gender)
            .bind(costume)
            .bind(evolution)
            .bind(raid.is_exclusive)
            .execute(&mut *tx)
            .await?;
            keys.push(key);
        }
        tx.commit().await?;

        for key in keys {
            self.remember(&key, CACHE_TTL_RAID as i64).await;
        }
        Ok(bosses)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::submitter;
    use super::*;
    use crate::infrastructure::data::schema::RaidRecord;
    use serde_json::json;

    const RECEIVED: i64 = 1_750_000_000;

    fn gym_gmo(raid: serde_json::Value) -> GetMapObjects {
        serde_json::from_value(json!({
            "map_cells": [{
                "s2_cell_id": 1,
                "forts": [{
                    "fort_id": "gym-1",
                    "fort_type": 0,
                    "latitude": 52.5,
                    "longitude": 13.4,
                    "enabled": true,
                    "team": 2,
                    "last_modified_ms": 1_749_999_000_000i64,
                    "image_url": "http://img/gym.png",
                    "raid_info": raid
                }]
            }]
        }))
        .expect("gmo")
    }

    async fn load_raid(submit: &ProtoSubmit) -> Vec<RaidRecord> {
        sqlx::query_as::<_, RaidRecord>("SELECT * FROM raid")
            .fetch_all(submit.db().pool())
            .await
            .expect("raids")
    }

    #[tokio::test]
    async fn hatched_raid_replaces_egg() {
        let submit = submitter().await;
        let egg = json!({
            "raid_spawn_ms": 1_749_999_000_000i64,
            "raid_battle_ms": 1_750_000_100_000i64,
            "raid_end_ms": 1_750_002_800_000i64,
            "raid_level": 5
        });
        assert_eq!(submit.raids(&gym_gmo(egg.clone()), RECEIVED).await.expect("egg"), 0);
        let rows = load_raid(&submit).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pokemon_id, None);
        assert_eq!((rows[0].move_1, rows[0].move_2), (1, 2));

        let mut hatched = egg;
        hatched["raid_pokemon"] = json!({"id": 150, "cp": 40000, "move1": 5, "move2": 6});
        let count = submit
            .raids(&gym_gmo(hatched), RECEIVED + 200)
            .await
            .expect("hatched");
        assert_eq!(count, 1);
        let rows = load_raid(&submit).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pokemon_id, Some(150));
        assert_eq!(rows[0].cp, 40000);
        assert_eq!(rows[0].last_scanned, naive_from_unix(RECEIVED + 200));
    }

    #[tokio::test]
    async fn older_raid_payload_does_not_overwrite() {
        let submit = submitter().await;
        let raid = json!({"raid_end_ms": 1_750_002_800_000i64, "raid_level": 3,
                          "raid_pokemon": {"id": 10}});
        submit.raids(&gym_gmo(raid), RECEIVED).await.expect("first");
        let stale = json!({"raid_end_ms": 1_750_002_800_000i64, "raid_level": 3,
                           "raid_pokemon": {"id": 11}});
        submit.raids(&gym_gmo(stale), RECEIVED - 600).await.expect("stale");
        assert_eq!(load_raid(&submit).await[0].pokemon_id, Some(10));
    }

    #[tokio::test]
    async fn gym_creates_details_and_info_fills_them() {
        let submit = submitter().await;
        assert_eq!(submit.gyms(&gym_gmo(json!(null)), RECEIVED).await.expect("gyms"), 1);

        let info: GymGetInfoOut = serde_json::from_value(json!({
            "result": 1,
            "name": "Fountain",
            "description": "",
            "gym_status_and_defenders": {"pokemon_fort_proto": {"fort_id": "gym-1"}}
        }))
        .expect("info");
        assert!(submit.gym_info(&info).await.expect("info"));

        let (name, url): (String, String) =
            sqlx::query_as("SELECT name, url FROM gymdetails WHERE gym_id = 'gym-1'")
                .fetch_one(submit.db().pool())
                .await
                .expect("details");
        assert_eq!(name, "Fountain");
        assert_eq!(url, "http://img/gym.png");
    }

    #[tokio::test]
    async fn lured_stop_gets_expiration_and_incident() {
        let submit = submitter().await;
        let gmo: GetMapObjects = serde_json::from_value(json!({
            "map_cells": [{
                "s2_cell_id": 1,
                "forts": [{
                    "fort_id": "stop-1",
                    "fort_type": 1,
                    "latitude": 52.5,
                    "longitude": 13.4,
                    "enabled": true,
                    "last_modified_ms": 1_749_999_000_000i64,
                    "active_fort_modifier": [501],
                    "pokestop_displays": [
                        {"incident_id": "inc-1", "incident_expiration_ms": 1_750_003_600_000i64},
                        {"incident_id": ""}
                    ]
                }]
            }]
        }))
        .expect("gmo");
        assert_eq!(submit.stops(&gmo, RECEIVED).await.expect("stops"), 1);

        let stop = submit.db().stop_by_id("stop-1").await.expect("load").expect("row");
        assert_eq!(
            stop.lure_expiration,
            Some(naive_from_unix(1_749_999_000) + Duration::minutes(30))
        );
        let incidents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pokestop_incident")
            .fetch_one(submit.db().pool())
            .await
            .expect("count");
        assert_eq!(incidents, 1);

        // Replay hits the dedup key.
        assert_eq!(submit.stops(&gmo, RECEIVED).await.expect("replay"), 0);
    }

    #[tokio::test]
    async fn stop_details_ignore_gyms() {
        let submit = submitter().await;
        let gym: FortDetailsOut =
            serde_json::from_value(json!({"id": "g", "type": 0})).expect("gym");
        assert!(!submit.stop_details(&gym, RECEIVED).await.expect("gym"));

        let stop: FortDetailsOut = serde_json::from_value(json!({
            "id": "s", "type": 1, "name": "Statue", "image_url": ["a.png", "b.png"],
            "latitude": 1.0, "longitude": 2.0
        }))
        .expect("stop");
        assert!(submit.stop_details(&stop, RECEIVED).await.expect("stop"));
        let row = submit.db().stop_by_id("s").await.expect("load").expect("row");
        assert_eq!(row.name.as_deref(), Some("Statue"));
        assert_eq!(row.image.as_deref(), Some("a.png"));
        assert!(row.enabled);
    }
}
