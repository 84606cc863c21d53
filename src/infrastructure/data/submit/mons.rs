// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use super::{MonIdentity, ProtoSubmit, despawn_timestamp};
use crate::common::time_utils::{current_unix, naive_from_unix, naive_from_unix_ms};
use crate::domain::constants::{
    CACHE_TTL_MON_LURE_IV, CACHE_TTL_MON_LURE_NOIV, CACHE_TTL_MON_MIN, DITTO_GENDER, DITTO_MON_ID,
    LURE_IV_DESPAWN_SECS, MAX_TIME_TILL_HIDDEN_MS,
};
use crate::domain::error::AppError;
use crate::domain::geo::Location;
use crate::domain::proto::{DiskEncounterOut, EncounterOut, FortType, GetMapObjects, WildPokemon};
use crate::domain::s2::CellId;
use crate::domain::types::SeenType;
use sqlx::SqliteConnection;

/// Result of an encounter merge, fed to the stats collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonIvOutcome {
    pub encounter_id: u64,
    pub pokemon_id: i32,
    pub is_shiny: bool,
}

fn wild_key(encounter_id: u64, mon_id: i32) -> String {
    format!("mon{encounter_id}-{mon_id}")
}

fn iv_key(encounter_id: u64, weather: i32, mon_id: i32) -> String {
    format!("moniv{encounter_id}-{weather}-{mon_id}")
}

async fn stored_seen_type(
    conn: &mut SqliteConnection,
    encounter_id: i64,
) -> Result<Option<SeenType>, AppError> {
    let raw: Option<String> =
        sqlx::query_scalar("SELECT seen_type FROM pokemon WHERE encounter_id = ?")
            .bind(encounter_id)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(raw.as_deref().and_then(SeenType::parse))
}

async fn fort_location(conn: &mut SqliteConnection, fort_id: &str) -> Result<Location, AppError> {
    let row: Option<(f64, f64)> = sqlx::query_as(
        r#"
        SELECT latitude, longitude FROM pokestop WHERE pokestop_id = ?
        UNION ALL
        SELECT latitude, longitude FROM gym WHERE gym_id = ?
        LIMIT 1
        "#,
    )
    .bind(fort_id)
    .bind(fort_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row
        .map(|(lat, lng)| Location::new(lat, lng))
        .unwrap_or_default())
}

fn mon_ttl(despawn: i64) -> i64 {
    (despawn - current_unix()).max(CACHE_TTL_MON_MIN as i64)
}

impl ProtoSubmit {
    /// Despawn time of a wild sighting: the reported time-till-hidden when
    /// it is trustworthy, otherwise the spawn's known despawn mark.
    async fn wild_despawn(&self, mon: &WildPokemon, received_ts: i64) -> Result<i64, AppError> {
        let tth = mon.time_till_hidden_ms;
        if tth > 0 && tth <= MAX_TIME_TILL_HIDDEN_MS {
            return Ok(received_ts + tth / 1000);
        }
        let endminsec = match mon.spawnpoint() {
            Some(sp) => self
                .db
                .spawns_by_id(&[sp])
                .await?
                .remove(&sp)
                .and_then(|s| s.calc_endminsec),
            None => None,
        };
        Ok(despawn_timestamp(
            endminsec.as_deref(),
            received_ts,
            self.settings.default_unknown_timeleft_secs,
        ))
    }

    pub(super) async fn mons(
        &self,
        gmo: &GetMapObjects,
        received_ts: i64,
    ) -> Result<Vec<u64>, AppError> {
        let mut pending = Vec::new();
        for mon in gmo.wild_pokemon() {
            if mon.encounter_id == 0 {
                continue;
            }
            let key = wild_key(mon.encounter_id, mon.pokemon.id);
            if self.seen(&key).await {
                continue;
            }
            let despawn = self.wild_despawn(mon, received_ts).await?;
            pending.push((mon, key, despawn));
        }
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let now = naive_from_unix(received_ts);
        let mut tx = self.db.pool().begin().await?;
        for (mon, _, despawn) in &pending {
            let encounter_id = mon.encounter_id as i64;
            let display = &mon.pokemon.pokemon_display;
            let (gender, costume, form) = if mon.pokemon.id == DITTO_MON_ID {
                (DITTO_GENDER, 0, 0)
            } else {
                (display.gender, display.costume, display.form)
            };
            let seen = SeenType::merge(stored_seen_type(&mut tx, encounter_id).await?, SeenType::Wild);
            sqlx::query(
                r#"
                INSERT INTO pokemon (
                    encounter_id, spawnpoint_id, pokemon_id, latitude, longitude,
                    disappear_time, gender, weather_boosted_condition, last_modified,
                    costume, form, seen_type
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(encounter_id) DO UPDATE SET
                    pokemon_id = excluded.pokemon_id,
                    gender = excluded.gender,
                    costume = excluded.costume,
                    form = excluded.form,
                    disappear_time = excluded.disappear_time,
                    weather_boosted_condition = excluded.weather_boosted_condition,
                    last_modified = excluded.last_modified,
                    seen_type = excluded.seen_type
                "#,
            )
            .bind(encounter_id)
            .bind(mon.spawnpoint().unwrap_or_default())
            .bind(mon.pokemon.id)
            .bind(mon.latitude)
            .bind(mon.longitude)
            .bind(naive_from_unix(*despawn))
            .bind(gender)
            .bind(display.weather_boosted_condition)
            .bind(now)
            .bind(costume)
            .bind(form)
            .bind(seen.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let mut ids = Vec::with_capacity(pending.len());
        for (mon, key, despawn) in pending {
            let ttl = despawn - current_unix();
            if ttl > 0 {
                self.remember(&key, ttl).await;
            }
            ids.push(mon.encounter_id);
        }
        Ok(ids)
    }

    /// Nearby sightings; returns `(cell ids, stop ids)`.
    pub(super) async fn mons_nearby(
        &self,
        gmo: &GetMapObjects,
        received_ts: i64,
    ) -> Result<(Vec<u64>, Vec<u64>), AppError> {
        let nearby_minutes = self.settings.default_nearby_timeleft_minutes;
        let disappear = naive_from_unix(received_ts + nearby_minutes * 60);
        let now = naive_from_unix(received_ts);
        let mut cell_ids = Vec::new();
        let mut stop_ids = Vec::new();
        let mut keys = Vec::new();

        let mut tx = self.db.pool().begin().await?;
        for cell in &gmo.map_cells {
            for mon in &cell.nearby_pokemon {
                if mon.encounter_id == 0 {
                    continue;
                }
                let weather = mon.pokemon_display.weather_boosted_condition;
                let key = format!("monnear{}-{}", mon.encounter_id, mon.pokedex_number);
                if self.seen(&key).await
                    || self.seen(&wild_key(mon.encounter_id, mon.pokedex_number)).await
                    || self
                        .seen(&iv_key(mon.encounter_id, weather, mon.pokedex_number))
                        .await
                {
                    continue;
                }

                let encounter_id = mon.encounter_id as i64;
                let at_cell = mon.fort_id.is_empty() && !self.settings.disable_nearby_cell;
                let (location, fort_id, cell_id, kind) = if at_cell {
                    let cell_id = CellId(cell.s2_cell_id);
                    (cell_id.center(), None, Some(cell_id.as_i64()), SeenType::NearbyCell)
                } else {
                    let loc = fort_location(&mut tx, &mon.fort_id).await?;
                    (loc, Some(mon.fort_id.as_str()), None, SeenType::NearbyStop)
                };
                let seen = SeenType::merge(stored_seen_type(&mut tx, encounter_id).await?, kind);

                sqlx::query(
                    r#"
                    INSERT INTO pokemon (
                        encounter_id, spawnpoint_id, pokemon_id, latitude, longitude,
                        disappear_time, gender, weather_boosted_condition, last_modified,
                        costume, form, fort_id, cell_id, seen_type
                    ) VALUES (?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(encounter_id) DO UPDATE SET
                        last_modified = excluded.last_modified,
                        seen_type = excluded.seen_type
                    "#,
                )
                .bind(encounter_id)
                .bind(mon.pokedex_number)
                .bind(location.lat)
                .bind(location.lng)
                .bind(disappear)
                .bind(mon.pokemon_display.gender)
                .bind(weather)
                .bind(now)
                .bind(mon.pokemon_display.costume)
                .bind(mon.pokemon_display.form)
                .bind(fort_id)
                .bind(cell_id)
                .bind(seen.as_str())
                .execute(&mut *tx)
                .await?;

                keys.push(key);
                if at_cell {
                    cell_ids.push(mon.encounter_id);
                } else {
                    stop_ids.push(mon.encounter_id);
                }
            }
        }
        tx.commit().await?;

        for key in keys {
            self.remember(&key, nearby_minutes * 60).await;
        }
        Ok((cell_ids, stop_ids))
    }

    /// Lure mons announced on stops, without stats.
    pub(super) async fn mon_lure_noiv(
        &self,
        gmo: &GetMapObjects,
        received_ts: i64,
    ) -> Result<Vec<u64>, AppError> {
        let now = naive_from_unix(received_ts);
        let mut ids = Vec::new();
        let mut tx = self.db.pool().begin().await?;
        for fort in gmo.forts().filter(|f| f.fort_type == FortType::Stop) {
            let Some(lure) = fort.active_pokemon.as_ref() else {
                continue;
            };
            if lure.pokedex_type_id <= 0 || lure.encounter_id == 0 {
                continue;
            }
            let key = format!("monlurenoiv{}", lure.encounter_id);
            if self.seen(&key).await {
                continue;
            }
            let encounter_id = lure.encounter_id as i64;
            let seen = SeenType::merge(
                stored_seen_type(&mut tx, encounter_id).await?,
                SeenType::LureWild,
            );
            sqlx::query(
                r#"
                INSERT INTO pokemon (
                    encounter_id, spawnpoint_id, pokemon_id, latitude, longitude,
                    disappear_time, gender, weather_boosted_condition, last_modified,
                    costume, form, fort_id, seen_type
                ) VALUES (?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(encounter_id) DO UPDATE SET
                    last_modified = excluded.last_modified,
                    seen_type = excluded.seen_type
                "#,
            )
            .bind(encounter_id)
            .bind(lure.pokedex_type_id)
            .bind(fort.latitude)
            .bind(fort.longitude)
            .bind(naive_from_unix_ms(lure.expiration_time_ms))
            .bind(lure.pokemon_display.gender)
            .bind(lure.pokemon_display.weather_boosted_condition)
            .bind(now)
            .bind(lure.pokemon_display.costume)
            .bind(lure.pokemon_display.form)
            .bind(&fort.fort_id)
            .bind(seen.as_str())
            .execute(&mut *tx)
            .await?;
            ids.push((lure.encounter_id, key));
        }
        tx.commit().await?;

        let mut out = Vec::with_capacity(ids.len());
        for (id, key) in ids {
            self.remember(&key, CACHE_TTL_MON_LURE_NOIV as i64).await;
            out.push(id);
        }
        Ok(out)
    }

    /// Whether stats for this wild mon were merged recently.
    pub async fn iv_recently_scanned(&self, wild: &WildPokemon) -> bool {
        let weather = wild.pokemon.pokemon_display.weather_boosted_condition;
        self.seen(&iv_key(wild.encounter_id, weather, wild.pokemon.id))
            .await
    }

    /// Encounter with full stats. `None` when the payload carries no usable
    /// mon or the same encounter was merged recently.
    pub async fn mon_iv(
        &self,
        origin: &str,
        encounter: &EncounterOut,
        received_ts: i64,
    ) -> Result<Option<MonIvOutcome>, AppError> {
        let Some(wild) = encounter.pokemon.as_ref() else {
            return Ok(None);
        };
        if wild.encounter_id == 0 || wild.spawn_point_id.trim().is_empty() {
            return Ok(None);
        }
        let data = &wild.pokemon;
        let display = &data.pokemon_display;
        let key = iv_key(wild.encounter_id, display.weather_boosted_condition, data.id);
        if self.seen(&key).await {
            return Ok(None);
        }

        let despawn = self.wild_despawn(wild, received_ts).await?;
        let identity = MonIdentity::resolve(data);
        let probs = encounter.capture_probability.triple();
        let encounter_id = wild.encounter_id as i64;

        let mut tx = self.db.pool().begin().await?;
        let seen = SeenType::merge(
            stored_seen_type(&mut tx, encounter_id).await?,
            SeenType::Encounter,
        );
        sqlx::query(
            r#"
            INSERT INTO pokemon (
                encounter_id, spawnpoint_id, pokemon_id, latitude, longitude, disappear_time,
                individual_attack, individual_defense, individual_stamina, move_1, move_2,
                cp, cp_multiplier, weight, height, gender, catch_prob_1, catch_prob_2,
                catch_prob_3, weather_boosted_condition, last_modified, costume, form, size,
                seen_type
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(encounter_id) DO UPDATE SET
                pokemon_id = excluded.pokemon_id,
                disappear_time = excluded.disappear_time,
                individual_attack = excluded.individual_attack,
                individual_defense = excluded.individual_defense,
                individual_stamina = excluded.individual_stamina,
                move_1 = excluded.move_1,
                move_2 = excluded.move_2,
                cp = excluded.cp,
                cp_multiplier = excluded.cp_multiplier,
                weight = excluded.weight,
                height = excluded.height,
                gender = excluded.gender,
                catch_prob_1 = excluded.catch_prob_1,
                catch_prob_2 = excluded.catch_prob_2,
                catch_prob_3 = excluded.catch_prob_3,
                weather_boosted_condition = excluded.weather_boosted_condition,
                last_modified = excluded.last_modified,
                costume = excluded.costume,
                form = excluded.form,
                size = excluded.size,
                seen_type = excluded.seen_type
            "#,
        )
        .bind(encounter_id)
        .bind(wild.spawnpoint().unwrap_or_default())
        .bind(identity.mon_id)
        .bind(wild.latitude)
        .bind(wild.longitude)
        .bind(naive_from_unix(despawn))
        .bind(data.individual_attack)
        .bind(data.individual_defense)
        .bind(data.individual_stamina)
        .bind(identity.move_1)
        .bind(identity.move_2)
        .bind(data.cp)
        .bind(data.cp_multiplier)
        .bind(data.weight_kg)
        .bind(data.height_m)
        .bind(identity.gender)
        .bind(probs.map(|p| p.0))
        .bind(probs.map(|p| p.1))
        .bind(probs.map(|p| p.2))
        .bind(display.weather_boosted_condition)
        .bind(naive_from_unix(received_ts))
        .bind(display.costume)
        .bind(identity.form)
        .bind(data.size)
        .bind(seen.as_str())
        .execute(&mut *tx)
        .await?;

        if identity.mon_id == DITTO_MON_ID {
            sqlx::query(
                r#"
                INSERT INTO pokemon_display (encounter_id, pokemon_id, form, gender, costume)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(encounter_id) DO NOTHING
                "#,
            )
            .bind(encounter_id)
            .bind(data.id)
            .bind(display.form)
            .bind(display.gender)
            .bind(display.costume)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        self.remember(&key, mon_ttl(despawn)).await;

        tracing::debug!(
            target: "submit",
            origin = %origin,
            encounter_id = wild.encounter_id,
            pokemon_id = identity.mon_id,
            ditto = identity.is_ditto,
            "Encounter merged"
        );
        Ok(Some(MonIvOutcome {
            encounter_id: wild.encounter_id,
            pokemon_id: identity.mon_id,
            is_shiny: display.shiny,
        }))
    }

    /// Lure encounter. The lure sighting usually arrived first via the GMO;
    /// a fresh row has no position and a short lifetime.
    pub async fn mon_lure_iv(
        &self,
        origin: &str,
        encounter: &DiskEncounterOut,
        received_ts: i64,
    ) -> Result<Option<MonIvOutcome>, AppError> {
        let Some(data) = encounter.pokemon.as_ref() else {
            return Ok(None);
        };
        let display = &data.pokemon_display;
        let encounter_id_u64 = display.display_id;
        if encounter_id_u64 == 0 {
            return Ok(None);
        }
        let key = format!("monlureiv{encounter_id_u64}");
        if self.seen(&key).await {
            return Ok(None);
        }

        let identity = MonIdentity::resolve(data);
        let probs = encounter.capture_probability.triple();
        let encounter_id = encounter_id_u64 as i64;

        let mut tx = self.db.pool().begin().await?;
        let seen = SeenType::merge(
            stored_seen_type(&mut tx, encounter_id).await?,
            SeenType::LureEncounter,
        );
        sqlx::query(
            r#"
            INSERT INTO pokemon (
                encounter_id, spawnpoint_id, pokemon_id, latitude, longitude, disappear_time,
                individual_attack, individual_defense, individual_stamina, move_1, move_2,
                cp, cp_multiplier, weight, height, gender, catch_prob_1, catch_prob_2,
                catch_prob_3, weather_boosted_condition, last_modified, costume, form, size,
                seen_type
            ) VALUES (?, 0, ?, 0, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(encounter_id) DO UPDATE SET
                pokemon_id = excluded.pokemon_id,
                individual_attack = excluded.individual_attack,
                individual_defense = excluded.individual_defense,
                individual_stamina = excluded.individual_stamina,
                move_1 = excluded.move_1,
                move_2 = excluded.move_2,
                cp = excluded.cp,
                cp_multiplier = excluded.cp_multiplier,
                weight = excluded.weight,
                height = excluded.height,
                gender = excluded.gender,
                catch_prob_1 = excluded.catch_prob_1,
                catch_prob_2 = excluded.catch_prob_2,
                catch_prob_3 = excluded.catch_prob_3,
                weather_boosted_condition = excluded.weather_boosted_condition,
                last_modified = excluded.last_modified,
                costume = excluded.costume,
                form = excluded.form,
                size = excluded.size,
                seen_type = excluded.seen_type
            "#,
        )
        .bind(encounter_id)
        .bind(identity.mon_id)
        .bind(naive_from_unix(received_ts + LURE_IV_DESPAWN_SECS))
        .bind(data.individual_attack)
        .bind(data.individual_defense)
        .bind(data.individual_stamina)
        .bind(identity.move_1)
        .bind(identity.move_2)
        .bind(data.cp)
        .bind(data.cp_multiplier)
        .bind(data.weight_kg)
        .bind(data.height_m)
        .bind(identity.gender)
        .bind(probs.map(|p| p.0))
        .bind(probs.map(|p| p.1))
        .bind(probs.map(|p| p.2))
        .bind(display.weather_boosted_condition)
        .bind(naive_from_unix(received_ts))
        .bind(display.costume)
        .bind(identity.form)
        .bind(data.size)
        .bind(seen.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        self.remember(&key, CACHE_TTL_MON_LURE_IV as i64).await;

        tracing::debug!(
            target: "submit",
            origin = %origin,
            encounter_id = encounter_id_u64,
            pokemon_id = identity.mon_id,
            "Lure encounter merged"
        );
        Ok(Some(MonIvOutcome {
            encounter_id: encounter_id_u64,
            pokemon_id: identity.mon_id,
            is_shiny: display.shiny,
        }))
    }
}
