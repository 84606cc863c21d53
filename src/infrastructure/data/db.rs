// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use crate::common::time_utils::{naive_from_unix, now_naive};
use crate::domain::constants::DEFAULT_EVENT_ID;
use crate::domain::error::AppError;
use crate::domain::geo::{Geofence, Location, distance_m};
use crate::domain::types::QuestLayer;
use crate::infrastructure::data::schema::{
    DeviceStatusRecord, EventRecord, PokemonRecord, QuestRecord, SpawnRecord, StopRecord,
};
use chrono::{Duration, NaiveDateTime, NaiveTime};
use sqlx::{
    Pool, Row, Sqlite,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

/// Degrees of latitude per meter, used to pre-filter radius queries.
const DEG_PER_M: f64 = 1.0 / 111_320.0;

/// An empty fence spans the whole world.
fn fence_box(fence: &Geofence) -> (f64, f64, f64, f64) {
    fence
        .bounding_box()
        .unwrap_or((-90.0, -180.0, 90.0, 180.0))
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, AppError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| AppError::Initialization(format!("DB Connect failed: {}", e)))?
            .create_if_missing(true);

        // Every connection to `sqlite::memory:` is a separate database.
        let in_memory = database_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new();
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(5)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| AppError::Initialization(format!("DB Connect failed: {}", e)))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::Initialization(format!("DB Migration failed: {}", e)))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Running event, falling back to the default event.
    pub async fn current_event(&self) -> Result<(i64, i64), AppError> {
        let now = now_naive();
        let event = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT * FROM trs_event
            WHERE event_start <= ? AND event_end >= ? AND id != ?
            ORDER BY event_start DESC LIMIT 1
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(DEFAULT_EVENT_ID)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event
            .map(|e| (e.id, e.event_lure_duration))
            .unwrap_or((DEFAULT_EVENT_ID, -1)))
    }

    // =========================================================================
    // SPAWNPOINTS
    // =========================================================================

    pub async fn spawns_by_id(&self, ids: &[i64]) -> Result<HashMap<i64, SpawnRecord>, AppError> {
        let mut found = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!("SELECT * FROM trs_spawn WHERE spawnpoint IN ({placeholders})");
            let mut query = sqlx::query_as::<_, SpawnRecord>(&sql);
            for id in chunk {
                query = query.bind(*id);
            }
            for row in query.fetch_all(&self.pool).await? {
                found.insert(row.spawnpoint, row);
            }
        }
        Ok(found)
    }

    // =========================================================================
    // STOPS
    // =========================================================================

    pub async fn stops_within(
        &self,
        center: &Location,
        radius_m: f64,
    ) -> Result<Vec<StopRecord>, AppError> {
        let dlat = radius_m * DEG_PER_M;
        let dlng = dlat / center.lat.to_radians().cos().abs().max(0.01);
        let rows = sqlx::query_as::<_, StopRecord>(
            r#"
            SELECT * FROM pokestop
            WHERE latitude BETWEEN ? AND ? AND longitude BETWEEN ? AND ?
            "#,
        )
        .bind(center.lat - dlat)
        .bind(center.lat + dlat)
        .bind(center.lng - dlng)
        .bind(center.lng + dlng)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter(|s| distance_m(center, &s.location()) <= radius_m)
            .collect())
    }

    pub async fn stops_in_fence(&self, fence: &Geofence) -> Result<Vec<StopRecord>, AppError> {
        let (min_lat, min_lng, max_lat, max_lng) = fence_box(fence);
        let rows = sqlx::query_as::<_, StopRecord>(
            r#"
            SELECT * FROM pokestop
            WHERE enabled = 1 AND latitude BETWEEN ? AND ? AND longitude BETWEEN ? AND ?
            ORDER BY latitude, longitude
            "#,
        )
        .bind(min_lat)
        .bind(max_lat)
        .bind(min_lng)
        .bind(max_lng)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter(|s| fence.contains(&s.location()))
            .collect())
    }

    pub async fn stop_by_id(&self, stop_id: &str) -> Result<Option<StopRecord>, AppError> {
        Ok(
            sqlx::query_as::<_, StopRecord>("SELECT * FROM pokestop WHERE pokestop_id = ?")
                .bind(stop_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn delete_stop(&self, stop_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM pokestop WHERE pokestop_id = ?")
            .bind(stop_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM trs_quest WHERE GUID = ?")
            .bind(stop_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stops and gyms share ids; a fort that turned into a gym loses its stop row.
    pub async fn delete_stop_at(&self, location: &Location) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM pokestop WHERE latitude = ? AND longitude = ?")
            .bind(location.lat)
            .bind(location.lng)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn update_stop_location(
        &self,
        stop_id: &str,
        location: &Location,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE pokestop SET latitude = ?, longitude = ?, last_updated = ? WHERE pokestop_id = ?",
        )
        .bind(location.lat)
        .bind(location.lng)
        .bind(now_naive())
        .bind(stop_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // QUESTS
    // =========================================================================

    fn start_of_day() -> i64 {
        let today = now_naive().date().and_time(NaiveTime::MIN);
        today.and_utc().timestamp()
    }

    /// Whether today's quest for `(stop, layer)` is already stored.
    pub async fn quest_exists(&self, stop_id: &str, layer: QuestLayer) -> Result<bool, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM trs_quest WHERE GUID = ? AND layer = ? AND quest_timestamp >= ?",
        )
        .bind(stop_id)
        .bind(layer.as_i32())
        .bind(Self::start_of_day())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn quest_for(
        &self,
        stop_id: &str,
        layer: QuestLayer,
    ) -> Result<Option<QuestRecord>, AppError> {
        Ok(sqlx::query_as::<_, QuestRecord>(
            "SELECT * FROM trs_quest WHERE GUID = ? AND layer = ?",
        )
        .bind(stop_id)
        .bind(layer.as_i32())
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Stops inside `fence` holding today's quest on `layer`.
    pub async fn stops_with_quests(
        &self,
        fence: &Geofence,
        layer: QuestLayer,
    ) -> Result<HashSet<String>, AppError> {
        let (min_lat, min_lng, max_lat, max_lng) = fence_box(fence);
        let rows = sqlx::query(
            r#"
            SELECT p.pokestop_id, p.latitude, p.longitude
            FROM pokestop p
            INNER JOIN trs_quest q ON q.GUID = p.pokestop_id
            WHERE q.layer = ? AND q.quest_timestamp >= ?
              AND p.latitude BETWEEN ? AND ? AND p.longitude BETWEEN ? AND ?
            "#,
        )
        .bind(layer.as_i32())
        .bind(Self::start_of_day())
        .bind(min_lat)
        .bind(max_lat)
        .bind(min_lng)
        .bind(max_lng)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter(|row| {
                fence.contains(&Location::new(row.get("latitude"), row.get("longitude")))
            })
            .map(|row| row.get::<String, _>("pokestop_id"))
            .collect())
    }

    // =========================================================================
    // MONS
    // =========================================================================

    pub async fn pokemon_by_id(&self, encounter_id: u64) -> Result<Option<PokemonRecord>, AppError> {
        Ok(
            sqlx::query_as::<_, PokemonRecord>("SELECT * FROM pokemon WHERE encounter_id = ?")
                .bind(encounter_id as i64)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Active mons without IVs whose species is wanted, inside `fence`.
    pub async fn encounter_ids_left(
        &self,
        fence: &Geofence,
        wanted: &[i32],
    ) -> Result<Vec<u64>, AppError> {
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let (min_lat, min_lng, max_lat, max_lng) = fence_box(fence);
        let placeholders = vec!["?"; wanted.len()].join(",");
        let sql = format!(
            r#"
            SELECT encounter_id, latitude, longitude FROM pokemon
            WHERE individual_attack IS NULL AND disappear_time > ?
              AND latitude BETWEEN ? AND ? AND longitude BETWEEN ? AND ?
              AND pokemon_id IN ({placeholders})
            ORDER BY disappear_time ASC
            "#
        );
        let mut query = sqlx::query(&sql)
            .bind(now_naive())
            .bind(min_lat)
            .bind(max_lat)
            .bind(min_lng)
            .bind(max_lng);
        for id in wanted {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .filter(|row| {
                fence.contains(&Location::new(row.get("latitude"), row.get("longitude")))
            })
            .map(|row| row.get::<i64, _>("encounter_id") as u64)
            .collect())
    }

    /// Mons already IV-scanned inside `fence`, with their despawn unix time.
    pub async fn encountered_in_fence(
        &self,
        fence: &Geofence,
    ) -> Result<HashMap<u64, i64>, AppError> {
        let (min_lat, min_lng, max_lat, max_lng) = fence_box(fence);
        let rows = sqlx::query(
            r#"
            SELECT encounter_id, latitude, longitude, disappear_time FROM pokemon
            WHERE individual_attack IS NOT NULL AND disappear_time > ?
              AND latitude BETWEEN ? AND ? AND longitude BETWEEN ? AND ?
            "#,
        )
        .bind(now_naive())
        .bind(min_lat)
        .bind(max_lat)
        .bind(min_lng)
        .bind(max_lng)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter(|row| {
                fence.contains(&Location::new(row.get("latitude"), row.get("longitude")))
            })
            .map(|row| {
                let disappear: NaiveDateTime = row.get("disappear_time");
                (
                    row.get::<i64, _>("encounter_id") as u64,
                    disappear.and_utc().timestamp(),
                )
            })
            .collect())
    }

    // =========================================================================
    // DEVICE STATUS
    // =========================================================================

    pub async fn device_status(&self, origin: &str) -> Result<Option<DeviceStatusRecord>, AppError> {
        Ok(
            sqlx::query_as::<_, DeviceStatusRecord>("SELECT * FROM trs_status WHERE device_id = ?")
                .bind(origin)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn upsert_device_level(
        &self,
        origin: &str,
        instance: &str,
        level: i32,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO trs_status (device_id, instance, level, last_updated)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
                instance=excluded.instance,
                level=excluded.level,
                last_updated=excluded.last_updated
            "#,
        )
        .bind(origin)
        .bind(instance)
        .bind(level)
        .bind(now_naive())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_softban_action(
        &self,
        origin: &str,
        instance: &str,
        location: &Location,
        at_unix: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO trs_status (device_id, instance, last_softban_action,
                last_softban_action_lat, last_softban_action_lng, last_updated)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
                last_softban_action=excluded.last_softban_action,
                last_softban_action_lat=excluded.last_softban_action_lat,
                last_softban_action_lng=excluded.last_softban_action_lng,
                last_updated=excluded.last_updated
            "#,
        )
        .bind(origin)
        .bind(instance)
        .bind(naive_from_unix(at_unix))
        .bind(location.lat)
        .bind(location.lng)
        .bind(now_naive())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // RETENTION
    // =========================================================================

    pub async fn delete_stats_older_than(&self, cutoff_unix: i64) -> Result<u64, AppError> {
        let cutoff = naive_from_unix(cutoff_unix);
        let mut removed = 0;
        for sql in [
            "DELETE FROM trs_stats_detect WHERE timestamp_scan < ?",
            "DELETE FROM trs_stats_location WHERE timestamp_scan < ?",
            "DELETE FROM trs_stats_location_raw WHERE data_timestamp < ?",
        ] {
            removed += sqlx::query(sql)
                .bind(cutoff_unix)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        removed += sqlx::query(
            "DELETE FROM trs_stats_detect_wild_mon_raw WHERE is_shiny = 0 AND last_scanned < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(removed)
    }

    pub async fn delete_shiny_raw_older_than(&self, cutoff_unix: i64) -> Result<u64, AppError> {
        Ok(sqlx::query(
            "DELETE FROM trs_stats_detect_wild_mon_raw WHERE is_shiny = 1 AND last_scanned < ?",
        )
        .bind(naive_from_unix(cutoff_unix))
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    pub async fn delete_expired_pokemon(&self, grace: Duration) -> Result<u64, AppError> {
        Ok(sqlx::query("DELETE FROM pokemon WHERE disappear_time < ?")
            .bind(now_naive() - grace)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }
}
