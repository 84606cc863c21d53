// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Buffered detection and location statistics, committed in one
//! transaction per flush with a savepoint around every row.

mod holders;

pub use holders::{DetectCounts, LocationOutcome, PlayerStats, SeenTypeHolder, WildMonRaw};

use crate::app::config::GlobalSettings;
use crate::common::time_utils::{current_unix, naive_from_unix};
use crate::domain::error::AppError;
use crate::domain::types::SeenType;
use crate::infrastructure::data::db::Database;
use holders::{LocationRaw, mode_code};
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Acquire, Sqlite, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct StatsSettings {
    pub flush_interval: Duration,
    pub retention_days: i64,
    pub raw_delete_shiny_days: i64,
}

impl From<&GlobalSettings> for StatsSettings {
    fn from(settings: &GlobalSettings) -> Self {
        Self {
            flush_interval: settings.stats_flush_interval(),
            retention_days: settings.stats_retention_days,
            raw_delete_shiny_days: settings.raw_delete_shiny_days,
        }
    }
}

/// Rows written and rows rolled back by one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
}

pub struct StatsHandler {
    db: Database,
    settings: StatsSettings,
    holders: Mutex<HashMap<String, PlayerStats>>,
    seen_types: Mutex<SeenTypeHolder>,
}

pub type SharedStats = Arc<StatsHandler>;

impl StatsHandler {
    pub fn new(db: Database, settings: StatsSettings) -> Self {
        Self {
            db,
            settings,
            holders: Mutex::new(HashMap::new()),
            seen_types: Mutex::new(SeenTypeHolder::default()),
        }
    }

    pub async fn stats_collect_wild_mon(&self, origin: &str, encounter_ids: &[u64], at: i64) {
        if encounter_ids.is_empty() {
            return;
        }
        let mut holders = self.holders.lock().await;
        let stats = holders.entry(origin.to_string()).or_default();
        for eid in encounter_ids {
            stats.add_wild_mon(*eid, at);
        }
    }

    pub async fn stats_collect_mon_iv(&self, origin: &str, encounter_id: u64, is_shiny: bool, at: i64) {
        let mut holders = self.holders.lock().await;
        holders
            .entry(origin.to_string())
            .or_default()
            .add_mon_iv(encounter_id, is_shiny, at);
    }

    pub async fn stats_collect_quest(&self, origin: &str) {
        let mut holders = self.holders.lock().await;
        holders.entry(origin.to_string()).or_default().detect.quest += 1;
    }

    pub async fn stats_collect_raid(&self, origin: &str, count: usize) {
        if count == 0 {
            return;
        }
        let mut holders = self.holders.lock().await;
        holders.entry(origin.to_string()).or_default().detect.raid += count as i64;
    }

    pub async fn stats_collect_location_data(&self, origin: &str, outcome: LocationOutcome) {
        let mut holders = self.holders.lock().await;
        holders
            .entry(origin.to_string())
            .or_default()
            .add_location(outcome);
    }

    pub async fn stats_collect_seen_type(&self, encounter_ids: &[u64], seen_type: SeenType, at: i64) {
        if encounter_ids.is_empty() {
            return;
        }
        let mut holder = self.seen_types.lock().await;
        for eid in encounter_ids {
            holder.add(*eid, seen_type, at);
        }
    }

    /// Snapshot of one device's pending counters.
    pub async fn pending(&self, origin: &str) -> Option<PlayerStats> {
        self.holders.lock().await.get(origin).cloned()
    }

    /// Commits every buffered holder. A row that fails only rolls back its
    /// own savepoint.
    pub async fn flush(&self) -> Result<FlushReport, AppError> {
        let holders = std::mem::take(&mut *self.holders.lock().await);
        let seen = self.seen_types.lock().await.drain();
        if holders.is_empty() && seen.is_empty() {
            return Ok(FlushReport::default());
        }

        match self.write_batch(&holders, &seen).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.restore(holders, seen).await;
                Err(e)
            }
        }
    }

    /// Puts an uncommitted batch back in front of whatever was collected
    /// while it was being written.
    async fn restore(&self, batch: HashMap<String, PlayerStats>, seen: Vec<(u64, SeenType, i64)>) {
        {
            let mut holders = self.holders.lock().await;
            for (origin, stats) in batch {
                holders.entry(origin).or_default().absorb(stats);
            }
        }
        let mut holder = self.seen_types.lock().await;
        for (eid, seen_type, at) in seen {
            holder.add(eid, seen_type, at);
        }
    }

    async fn write_batch(
        &self,
        holders: &HashMap<String, PlayerStats>,
        seen: &[(u64, SeenType, i64)],
    ) -> Result<FlushReport, AppError> {
        let now = current_unix();
        let mut report = FlushReport::default();
        let mut tx = self.db.pool().begin().await?;

        for (origin, stats) in holders {
            if !stats.detect.is_empty() {
                let d = stats.detect;
                let query = sqlx::query(
                    "INSERT INTO trs_stats_detect (worker, timestamp_scan, mon, mon_iv, raid, quest) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(origin)
                .bind(now)
                .bind(d.mon)
                .bind(d.mon_iv)
                .bind(d.raid)
                .bind(d.quest);
                savepoint(&mut tx, &mut report, origin, query).await?;
            }

            for (eid, raw) in &stats.wild_mon_raw {
                let query = sqlx::query(
                    r#"
                    INSERT INTO trs_stats_detect_wild_mon_raw
                        (worker, encounter_id, count, is_shiny, first_scanned, last_scanned)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(worker, encounter_id) DO UPDATE SET
                        count = count + excluded.count,
                        is_shiny = MAX(is_shiny, excluded.is_shiny),
                        last_scanned = MAX(last_scanned, excluded.last_scanned)
                    "#,
                )
                .bind(origin)
                .bind(*eid as i64)
                .bind(raw.count)
                .bind(raw.is_shiny)
                .bind(naive_from_unix(raw.first_scanned))
                .bind(naive_from_unix(raw.last_scanned));
                savepoint(&mut tx, &mut report, origin, query).await?;
            }

            if stats.location_ok + stats.location_nok > 0 {
                let query = sqlx::query(
                    "INSERT INTO trs_stats_location (worker, timestamp_scan, location_ok, location_nok) VALUES (?, ?, ?, ?)",
                )
                .bind(origin)
                .bind(now)
                .bind(stats.location_ok)
                .bind(stats.location_nok);
                savepoint(&mut tx, &mut report, origin, query).await?;
            }

            for (key, LocationRaw { outcome, count }) in &stats.location_raw {
                let query = sqlx::query(
                    r#"
                    INSERT INTO trs_stats_location_raw
                        (worker, lat, lng, location_type, data_timestamp, type, walker,
                         success, period, transporttype, count)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(worker, lat, lng, type, period) DO UPDATE SET
                        count = count + excluded.count,
                        success = excluded.success,
                        data_timestamp = excluded.data_timestamp,
                        location_type = excluded.location_type,
                        transporttype = excluded.transporttype
                    "#,
                )
                .bind(origin)
                .bind(outcome.location.lat)
                .bind(outcome.location.lng)
                .bind(outcome.position_type as i32)
                .bind(outcome.data_ts)
                .bind(mode_code(outcome.mode))
                .bind(&outcome.walker)
                .bind(outcome.success)
                .bind(key.period)
                .bind(outcome.transport as i32)
                .bind(*count);
                savepoint(&mut tx, &mut report, origin, query).await?;
            }
        }

        for &(eid, seen_type, at) in seen {
            // Column names come from the closed SeenType set.
            let column = seen_type.as_str();
            let sql = format!(
                r#"
                INSERT INTO trs_stats_detect_seen_type (encounter_id, {column})
                VALUES (?, ?)
                ON CONFLICT(encounter_id) DO UPDATE SET
                    {column} = CASE
                        WHEN {column} IS NULL OR excluded.{column} < {column}
                        THEN excluded.{column}
                        ELSE {column}
                    END
                "#
            );
            let query = sqlx::query(&sql)
                .bind(eid as i64)
                .bind(naive_from_unix(at));
            savepoint(&mut tx, &mut report, "seen_type", query).await?;
        }

        tx.commit().await?;
        tracing::debug!(
            target: "stats",
            devices = holders.len(),
            written = report.written,
            failed = report.failed,
            "Stats flushed"
        );
        Ok(report)
    }

    /// Deletes stats rows past retention.
    pub async fn cleanup(&self) -> Result<u64, AppError> {
        let now = current_unix();
        let mut removed = self
            .db
            .delete_stats_older_than(now - self.settings.retention_days.max(1) * 86_400)
            .await?;
        if self.settings.raw_delete_shiny_days > 0 {
            removed += self
                .db
                .delete_shiny_raw_older_than(now - self.settings.raw_delete_shiny_days * 86_400)
                .await?;
        }
        if removed > 0 {
            tracing::info!(target: "stats", removed, "Removed stats past retention");
        }
        Ok(removed)
    }

    /// Flush loop; a last flush runs on shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = self.settings.flush_interval;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(interval) => {}
            }
            if let Err(e) = self.flush().await {
                tracing::warn!(target: "stats", error = %e, "Stats flush failed");
            }
            if let Err(e) = self.cleanup().await {
                tracing::warn!(target: "stats", error = %e, "Stats cleanup failed");
            }
        }
        if let Err(e) = self.flush().await {
            tracing::warn!(target: "stats", error = %e, "Final stats flush failed");
        }
    }
}

/// Runs one row write inside a nested transaction (SQLite savepoint).
async fn savepoint<'q>(
    tx: &mut Transaction<'_, Sqlite>,
    report: &mut FlushReport,
    scope: &str,
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
) -> Result<(), AppError> {
    let mut nested = tx.begin().await?;
    match query.execute(&mut *nested).await {
        Ok(_) => {
            nested.commit().await?;
            report.written += 1;
        }
        Err(e) => {
            nested.rollback().await?;
            report.failed += 1;
            tracing::warn!(target: "stats", scope, error = %e, "Stats row rolled back");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geo::Location;
    use crate::domain::types::{PositionType, TransportType, WorkerMode};
    use sqlx::Row;

    async fn handler() -> StatsHandler {
        let db = Database::new("sqlite::memory:").await.expect("db");
        StatsHandler::new(
            db,
            StatsSettings {
                flush_interval: Duration::from_secs(300),
                retention_days: 7,
                raw_delete_shiny_days: 0,
            },
        )
    }

    fn outcome(lat: f64, success: bool) -> LocationOutcome {
        LocationOutcome {
            location: Location::new(lat, 13.405),
            success,
            data_ts: current_unix(),
            position_type: PositionType::Normal,
            mode: WorkerMode::MonMitm,
            walker: "day".to_string(),
            transport: TransportType::Teleport,
        }
    }

    #[tokio::test]
    async fn flush_writes_detection_and_location_rows() {
        let stats = handler().await;
        let now = current_unix();
        stats.stats_collect_wild_mon("dev1", &[42, 43], now).await;
        stats.stats_collect_wild_mon("dev1", &[42], now + 5).await;
        stats.stats_collect_mon_iv("dev1", 42, false, now + 6).await;
        stats.stats_collect_raid("dev1", 2).await;
        stats.stats_collect_quest("dev1").await;
        stats.stats_collect_location_data("dev1", outcome(52.52, true)).await;
        assert_eq!(stats.pending("dev1").await.expect("pending").detect.mon, 3);

        let report = stats.flush().await.expect("flush");
        assert_eq!(report.failed, 0);
        assert!(stats.pending("dev1").await.is_none());

        let row = sqlx::query("SELECT mon, mon_iv, raid, quest FROM trs_stats_detect WHERE worker = 'dev1'")
            .fetch_one(stats.db.pool())
            .await
            .expect("detect row");
        assert_eq!(row.get::<i64, _>("mon"), 3);
        assert_eq!(row.get::<i64, _>("mon_iv"), 1);
        assert_eq!(row.get::<i64, _>("raid"), 2);
        assert_eq!(row.get::<i64, _>("quest"), 1);

        let count: i64 = sqlx::query_scalar(
            "SELECT count FROM trs_stats_detect_wild_mon_raw WHERE encounter_id = 42",
        )
        .fetch_one(stats.db.pool())
        .await
        .expect("raw row");
        assert_eq!(count, 2);

        // A second flush adds onto the existing raw row.
        stats.stats_collect_wild_mon("dev1", &[42], now + 60).await;
        stats.flush().await.expect("flush");
        let count: i64 = sqlx::query_scalar(
            "SELECT count FROM trs_stats_detect_wild_mon_raw WHERE encounter_id = 42",
        )
        .fetch_one(stats.db.pool())
        .await
        .expect("raw row");
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn seen_type_rows_keep_earliest_timestamp() {
        let stats = handler().await;
        stats.stats_collect_seen_type(&[42], SeenType::Wild, 2_000).await;
        stats.flush().await.expect("flush");
        stats.stats_collect_seen_type(&[42], SeenType::Wild, 3_000).await;
        stats.stats_collect_seen_type(&[42], SeenType::Encounter, 2_500).await;
        stats.flush().await.expect("flush");
        stats.stats_collect_seen_type(&[42], SeenType::Wild, 1_000).await;
        stats.flush().await.expect("flush");

        let row = sqlx::query("SELECT wild, encounter, nearby_cell FROM trs_stats_detect_seen_type WHERE encounter_id = 42")
            .fetch_one(stats.db.pool())
            .await
            .expect("row");
        let wild: chrono::NaiveDateTime = row.get("wild");
        let encounter: chrono::NaiveDateTime = row.get("encounter");
        let nearby: Option<chrono::NaiveDateTime> = row.get("nearby_cell");
        assert_eq!(wild, naive_from_unix(1_000));
        assert_eq!(encounter, naive_from_unix(2_500));
        assert!(nearby.is_none());
    }

    #[tokio::test]
    async fn batch_survives_an_unavailable_database() {
        let stats = handler().await;
        let now = current_unix();
        stats.stats_collect_wild_mon("dev1", &[42], now).await;
        stats.stats_collect_seen_type(&[42], SeenType::Wild, now).await;
        stats.stats_collect_location_data("dev1", outcome(52.52, true)).await;
        stats.db.pool().close().await;

        assert!(stats.flush().await.is_err());
        stats.stats_collect_wild_mon("dev1", &[42], now + 10).await;

        let pending = stats.pending("dev1").await.expect("restored");
        assert_eq!(pending.detect.mon, 2);
        assert_eq!(pending.wild_mon_raw[&42].count, 2);
        assert_eq!(pending.wild_mon_raw[&42].first_scanned, now);
        assert_eq!(pending.location_ok, 1);
        assert_eq!(stats.seen_types.lock().await.get(42, SeenType::Wild), Some(now));
    }

    #[tokio::test]
    async fn failing_row_only_rolls_back_itself() {
        let stats = handler().await;
        // NaN binds as NULL and violates NOT NULL on the raw location row.
        stats.stats_collect_location_data("dev1", outcome(f64::NAN, false)).await;
        stats.stats_collect_location_data("dev1", outcome(52.52, true)).await;

        let report = stats.flush().await.expect("flush");
        assert_eq!(report.failed, 1);

        let raw: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trs_stats_location_raw")
            .fetch_one(stats.db.pool())
            .await
            .expect("count");
        assert_eq!(raw, 1);
        let summary: i64 = sqlx::query_scalar("SELECT location_nok FROM trs_stats_location")
            .fetch_one(stats.db.pool())
            .await
            .expect("summary");
        assert_eq!(summary, 1);
    }

    #[tokio::test]
    async fn cleanup_honors_retention() {
        let stats = handler().await;
        let old = current_unix() - 10 * 86_400;
        sqlx::query("INSERT INTO trs_stats_detect (worker, timestamp_scan, mon) VALUES ('dev1', ?, 1)")
            .bind(old)
            .execute(stats.db.pool())
            .await
            .expect("insert");
        stats.stats_collect_quest("dev1").await;
        stats.flush().await.expect("flush");

        assert_eq!(stats.cleanup().await.expect("cleanup"), 1);
        let left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trs_stats_detect")
            .fetch_one(stats.db.pool())
            .await
            .expect("count");
        assert_eq!(left, 1);
    }
}
