// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Stop handling for quest areas: finding the stop on the map, reacting to
//! the spin result and keeping the stored stops in line with the map.

use super::{ScanStrategy, StrategyContext};
use crate::common::time_utils::{current_unix, now_naive};
use crate::domain::constants::{
    RADIUS_FOR_CELLS_CONSIDERED_FOR_STOP_SCAN, S2_GMO_CELL_LEVEL, STOP_DELETE_AGE_SECS, STOP_DELETE_RADIUS,
    STOP_SPIN_DISTANCE,
};
use crate::domain::error::AppError;
use crate::domain::geo::Location;
use crate::domain::proto::{Fort, FortType, GetMapObjects, ProtoIdentifier};
use crate::domain::s2::{CellId, cells_around};
use crate::domain::types::{
    FortSearchResult, PositionStopType, QuestLayer, ReceivedType, determine_current_quest_layer,
};
use crate::infrastructure::data::schema::StopRecord;
use std::collections::HashMap;

const STOP_RECHECKS: u32 = 3;
const STOP_SPIN_ATTEMPTS: u32 = 3;

/// What the map shows at a quest location.
#[derive(Clone, Debug, PartialEq)]
pub struct StopScan {
    pub kind: PositionStopType,
    pub fort_id: Option<String>,
    pub location: Option<Location>,
}

impl StopScan {
    fn bare(kind: PositionStopType) -> Self {
        Self {
            kind,
            fort_id: None,
            location: None,
        }
    }
}

/// How a quest location ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// The device holds quests of the other layer.
    NotReady,
    /// Nothing to spin here; the location left the route.
    Removed,
    /// A stop exists but cannot be spun right now.
    Unavailable,
    /// The location was queued again at the end of the route.
    Redo,
    Done,
    /// Init rounds only collect map data.
    Skipped,
}

fn stop_state(fort: &Fort, level_mode: bool, ignore_spinned: bool) -> PositionStopType {
    if fort.fort_type == FortType::Gym {
        PositionStopType::Gym
    } else if fort.visited && level_mode && ignore_spinned {
        PositionStopType::VisitedStopInLevelModeToIgnore
    } else if !fort.enabled {
        PositionStopType::StopDisabled
    } else if fort.closed {
        PositionStopType::StopClosed
    } else if fort.cooldown_complete_ms > 0 {
        PositionStopType::StopCooldown
    } else {
        PositionStopType::SpinnableStop
    }
}

/// Classifies the closest fort in spinning range of `here`.
pub fn classify_stop(gmo: Option<&GetMapObjects>, here: &Location, level_mode: bool, ignore_spinned: bool) -> StopScan {
    let Some(gmo) = gmo else {
        return StopScan::bare(PositionStopType::GmoNotAvailable);
    };
    if gmo.is_empty() {
        return StopScan::bare(PositionStopType::GmoEmpty);
    }

    let cells = cells_around(here, RADIUS_FOR_CELLS_CONSIDERED_FOR_STOP_SCAN, S2_GMO_CELL_LEVEL);
    let closest = gmo
        .map_cells
        .iter()
        .filter(|cell| cells.contains(&CellId(cell.s2_cell_id)))
        .flat_map(|cell| cell.forts.iter())
        .filter(|fort| !fort.location().is_zero())
        .map(|fort| (fort.location().distance_to(here), fort))
        .filter(|(distance, _)| *distance <= STOP_SPIN_DISTANCE)
        .min_by(|a, b| a.0.total_cmp(&b.0));

    match closest {
        Some((_, fort)) => StopScan {
            kind: stop_state(fort, level_mode, ignore_spinned),
            fort_id: Some(fort.fort_id.clone()),
            location: Some(fort.location()),
        },
        None => StopScan::bare(PositionStopType::NoFort),
    }
}

impl StrategyContext {
    /// Whether the device currently collects quests of `layer`.
    pub(crate) async fn refresh_quest_readiness(&mut self, layer: QuestLayer) {
        let held = self.mapper.get_quests_held(&self.origin).await;
        let current = determine_current_quest_layer(held.as_deref());
        self.state.ready_for_scan = current == Some(layer);
        if !self.state.ready_for_scan {
            tracing::info!(
                target: "strategy",
                origin = %self.origin,
                ?layer,
                ?current,
                "Device holds quests of another layer"
            );
        }
    }

    /// Handles the stop at the current location after the map data arrived.
    pub(crate) async fn post_move_quest(&mut self, layer: QuestLayer, event_ts: i64) -> Result<StopOutcome, AppError> {
        if self.route.get_init() {
            return Ok(StopOutcome::Skipped);
        }
        let here = self.state.current_location;
        if !self.state.ready_for_scan {
            self.refresh_quest_readiness(layer).await;
            if !self.state.ready_for_scan {
                self.route.redo_stop_at_end(&self.origin, here).await;
                return Ok(StopOutcome::NotReady);
            }
        }

        let scan = self.ensure_stop_present(layer, event_ts).await?;
        let outcome = match scan.kind {
            PositionStopType::SpinnableStop => match &scan.fort_id {
                Some(stop_id) => self.handle_stop(layer, stop_id, event_ts).await?,
                None => StopOutcome::Unavailable,
            },
            PositionStopType::StopClosed | PositionStopType::StopCooldown | PositionStopType::StopDisabled => {
                tracing::info!(target: "strategy", origin = %self.origin, kind = ?scan.kind, "Stop cannot be spun right now");
                StopOutcome::Unavailable
            }
            kind => {
                tracing::info!(target: "strategy", origin = %self.origin, ?kind, "No stop to spin, dropping location");
                self.route.add_coords_to_be_removed(&self.origin, here).await;
                StopOutcome::Removed
            }
        };

        self.state.last_action_time = Some(current_unix());
        self.refresh_quest_readiness(layer).await;
        Ok(outcome)
    }

    async fn inspect_stop(&mut self, gmo: Option<&GetMapObjects>) -> Result<StopScan, AppError> {
        let scan = classify_stop(
            gmo,
            &self.state.current_location,
            self.area.level_mode,
            self.area.ignore_spinned_stops,
        );
        if scan.kind == PositionStopType::Gym
            && let Some(at) = scan.location
        {
            let removed = self.submit.db().delete_stop_at(&at).await?;
            tracing::warn!(target: "strategy", origin = %self.origin, removed, "Expected a stop, found a gym");
        }
        Ok(scan)
    }

    /// Classifies the stop, waiting for fresh map data while nothing usable
    /// showed up.
    async fn ensure_stop_present(&mut self, layer: QuestLayer, event_ts: i64) -> Result<StopScan, AppError> {
        let latest = self
            .mapper
            .request_latest(&self.origin, &ProtoIdentifier::Gmo.key(), Some(event_ts - 1))
            .await;
        let mut gmo_ts = latest.as_ref().map_or(event_ts, |entry| entry.device_ts);
        let mut gmo: Option<GetMapObjects> = latest.and_then(|entry| entry.payload.decode());
        let mut scan = self.counted_inspection(gmo.as_ref()).await?;

        let mut rechecks = 0;
        while scan.kind.needs_recheck() && rechecks < STOP_RECHECKS {
            rechecks += 1;
            tracing::debug!(target: "strategy", origin = %self.origin, kind = ?scan.kind, rechecks, "Checking the stop again");
            let received = self
                .wait_for_data_from_now(ScanStrategy::Quest { layer }, gmo_ts + 1, ProtoIdentifier::Gmo, self.gmo_timeout())
                .await?;
            let Some(fresh) = received.filter(|r| r.kind == ReceivedType::Gmo) else {
                continue;
            };
            gmo_ts = fresh.data_ts;
            if fresh.gmo.is_some() {
                gmo = fresh.gmo;
                scan = self.counted_inspection(gmo.as_ref()).await?;
            }
        }

        if scan.kind == PositionStopType::NoFort
            && let Some(gmo) = &gmo
        {
            self.reconcile_stops(gmo).await?;
        }
        Ok(scan)
    }

    /// Every inspected map without stop data is a strike towards a client
    /// restart; any usable one clears the streak.
    async fn counted_inspection(&mut self, gmo: Option<&GetMapObjects>) -> Result<StopScan, AppError> {
        let scan = self.inspect_stop(gmo).await?;
        if scan.kind.needs_recheck() {
            self.spinnable_data_failure().await?;
        } else {
            self.state.spinnable_data_failcount = 0;
        }
        Ok(scan)
    }

    /// Moves stored stops the map shows elsewhere and deletes stale ones
    /// the map no longer shows around the current location.
    async fn reconcile_stops(&self, gmo: &GetMapObjects) -> Result<(), AppError> {
        let here = self.state.current_location;
        let mut stored: HashMap<String, StopRecord> = self
            .submit
            .stops_near_location(&here, STOP_DELETE_RADIUS)
            .await?
            .into_iter()
            .map(|stop| (stop.pokestop_id.clone(), stop))
            .collect();

        for fort in gmo.forts() {
            let Some(stop) = stored.remove(&fort.fort_id) else {
                continue;
            };
            let seen = fort.location();
            if seen.is_valid() && seen != stop.location() {
                tracing::info!(target: "strategy", origin = %self.origin, stop_id = %fort.fort_id, "Stop moved, updating location");
                self.submit.db().update_stop_location(&fort.fort_id, &seen).await?;
            }
        }

        let cutoff = now_naive() - chrono::Duration::seconds(STOP_DELETE_AGE_SECS);
        for stop in stored.into_values() {
            let at = stop.location();
            if stop.last_updated.is_some_and(|ts| ts > cutoff) || at.distance_to(&here) >= STOP_DELETE_RADIUS {
                continue;
            }
            tracing::warn!(
                target: "strategy",
                origin = %self.origin,
                stop_id = %stop.pokestop_id,
                "Stop is gone from the map, deleting it"
            );
            self.submit.delete_stop(&stop.pokestop_id).await?;
            self.route.add_coords_to_be_removed(&self.origin, at).await;
        }
        Ok(())
    }

    async fn quest_exists(&self, stop_id: &str, layer: QuestLayer) -> Result<bool, AppError> {
        let exists = self.submit.db().quest_exists(stop_id, layer).await?;
        if exists {
            tracing::info!(target: "strategy", origin = %self.origin, stop_id, "Quest is done without us noticing");
        }
        Ok(exists)
    }

    async fn count_visited(&self) {
        let visited = self.mapper.get_stops_visited(&self.origin).await + 1;
        self.mapper.set_stops_visited(&self.origin, visited).await;
    }

    /// Waits for the spin result of the stop the device walked up to.
    async fn handle_stop(&mut self, layer: QuestLayer, stop_id: &str, event_ts: i64) -> Result<StopOutcome, AppError> {
        let here = self.state.current_location;
        let level_mode = self.area.level_mode;
        let mut since = event_ts;

        for attempt in 1..=STOP_SPIN_ATTEMPTS {
            let received = self
                .wait_for_data_from_now(
                    ScanStrategy::Quest { layer },
                    since,
                    ProtoIdentifier::FortSearch,
                    self.settings.fort_search_timeout,
                )
                .await?;
            since = current_unix();

            let result = match received.map(|r| r.kind) {
                Some(ReceivedType::FortSearchResult(result)) => result,
                other => {
                    if self.quest_exists(stop_id, layer).await? {
                        return Ok(StopOutcome::Done);
                    }
                    tracing::info!(target: "strategy", origin = %self.origin, stop_id, attempt, received = ?other, "No spin result yet");
                    continue;
                }
            };

            match result {
                FortSearchResult::Quest | FortSearchResult::Cooldown | FortSearchResult::Full if level_mode => {
                    self.count_visited().await;
                    if result == FortSearchResult::Quest {
                        self.state.last_quest_received = Some(current_unix());
                    }
                    return Ok(StopOutcome::Done);
                }
                FortSearchResult::Quest => {
                    tracing::info!(target: "strategy", origin = %self.origin, stop_id, "Received new quest");
                    self.state.last_quest_received = Some(current_unix());
                    return Ok(StopOutcome::Done);
                }
                FortSearchResult::Inventory => {
                    tracing::warn!(target: "strategy", origin = %self.origin, stop_id, "Inventory is full");
                    break;
                }
                FortSearchResult::Cooldown => {
                    if self.quest_exists(stop_id, layer).await? {
                        return Ok(StopOutcome::Done);
                    }
                    tracing::info!(target: "strategy", origin = %self.origin, stop_id, "Stop is on cooldown");
                    break;
                }
                FortSearchResult::Full => {
                    tracing::warn!(target: "strategy", origin = %self.origin, stop_id, "Spun without a quest, quest log may be full");
                    return Ok(StopOutcome::Done);
                }
                FortSearchResult::Limit => {
                    tracing::warn!(target: "strategy", origin = %self.origin, stop_id, "Daily spin limit reached");
                    return Ok(StopOutcome::Done);
                }
                FortSearchResult::Time | FortSearchResult::OutOfRange => {
                    tracing::warn!(target: "strategy", origin = %self.origin, stop_id, attempt, ?result, "Spin rejected, softban suspected");
                    self.state.last_action_time = Some(current_unix());
                    self.pause(self.settings.poll_interval).await?;
                }
            }
        }

        self.route.redo_stop_at_end(&self.origin, here).await;
        Ok(StopOutcome::Redo)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{area, harness, report};
    use super::*;
    use crate::domain::types::WorkerMode;
    use crate::services::mapping::RouteManager;
    use crate::services::mitm_mapper::MitmMapper;
    use chrono::NaiveDateTime;
    use serde_json::{Value, json};

    const HERE: Location = Location::new(40.0, -105.0);

    fn cell_of(at: &Location) -> u64 {
        CellId::from_location_at(at, S2_GMO_CELL_LEVEL).0
    }

    fn gmo_json(forts: Value) -> Value {
        json!({"map_cells": [{"s2_cell_id": cell_of(&HERE), "forts": forts}]})
    }

    fn gmo(forts: Value) -> GetMapObjects {
        serde_json::from_value(gmo_json(forts)).expect("gmo")
    }

    fn stop(id: &str, lat: f64, lng: f64) -> Value {
        json!({"fort_id": id, "latitude": lat, "longitude": lng, "fort_type": 1, "enabled": true})
    }

    async fn insert_stop(h: &super::super::tests::Harness, id: &str, at: Location, updated: NaiveDateTime) {
        sqlx::query(
            "INSERT INTO pokestop (pokestop_id, latitude, longitude, last_modified, last_updated) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(at.lat)
        .bind(at.lng)
        .bind(updated)
        .bind(updated)
        .execute(h.ctx.submit.db().pool())
        .await
        .expect("insert stop");
    }

    async fn insert_quest(h: &super::super::tests::Harness, id: &str, layer: QuestLayer) {
        sqlx::query("INSERT INTO trs_quest (GUID, layer, quest_type, quest_timestamp) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(layer.as_i32())
            .bind(7)
            .bind(current_unix())
            .execute(h.ctx.submit.db().pool())
            .await
            .expect("insert quest");
    }

    #[test]
    fn stops_are_classified_by_state() {
        assert_eq!(classify_stop(None, &HERE, false, false).kind, PositionStopType::GmoNotAvailable);
        let empty = GetMapObjects::default();
        assert_eq!(classify_stop(Some(&empty), &HERE, false, false).kind, PositionStopType::GmoEmpty);

        let spinnable = classify_stop(Some(&gmo(json!([stop("s", 40.00005, -105.00003)]))), &HERE, false, false);
        assert_eq!(spinnable.kind, PositionStopType::SpinnableStop);
        assert_eq!(spinnable.fort_id.as_deref(), Some("s"));

        let gym = json!([{"fort_id": "g", "latitude": 40.0, "longitude": -105.0, "fort_type": 0, "enabled": true}]);
        assert_eq!(classify_stop(Some(&gmo(gym)), &HERE, false, false).kind, PositionStopType::Gym);

        let mut cooling = stop("s", 40.0, -105.0);
        cooling["cooldown_complete_ms"] = json!(1_700_000_000_000_i64);
        assert_eq!(classify_stop(Some(&gmo(json!([cooling]))), &HERE, false, false).kind, PositionStopType::StopCooldown);

        let mut closed = stop("s", 40.0, -105.0);
        closed["closed"] = json!(true);
        assert_eq!(classify_stop(Some(&gmo(json!([closed]))), &HERE, false, false).kind, PositionStopType::StopClosed);

        let mut disabled = stop("s", 40.0, -105.0);
        disabled["enabled"] = json!(false);
        assert_eq!(classify_stop(Some(&gmo(json!([disabled]))), &HERE, false, false).kind, PositionStopType::StopDisabled);

        let mut visited = stop("s", 40.0, -105.0);
        visited["visited"] = json!(true);
        let visited = gmo(json!([visited]));
        assert_eq!(
            classify_stop(Some(&visited), &HERE, true, true).kind,
            PositionStopType::VisitedStopInLevelModeToIgnore
        );
        assert_eq!(classify_stop(Some(&visited), &HERE, false, true).kind, PositionStopType::SpinnableStop);

        // ~150 m north: same cell, out of spinning range.
        let far = gmo(json!([stop("far", 40.00135, -105.0)]));
        assert_eq!(classify_stop(Some(&far), &HERE, false, false).kind, PositionStopType::NoFort);
    }

    #[tokio::test]
    async fn quest_done_without_spin_result_is_not_redone() {
        let mut cfg = area(WorkerMode::Pokestops, vec![HERE]);
        cfg.settings.layer = QuestLayer::NonAr;
        let mut h = harness(cfg).await;
        h.ctx.state.current_location = HERE;
        h.mapper.set_quests_held("dev1", Some(vec![QuestLayer::Ar.as_i32()])).await;
        insert_quest(&h, "s", QuestLayer::NonAr).await;

        let event_ts = current_unix();
        report(h.mapper.as_ref(), ProtoIdentifier::Gmo, gmo_json(json!([stop("s", 40.0, -105.0)])), HERE).await;
        let outcome = h.ctx.post_move_quest(QuestLayer::NonAr, event_ts).await.expect("quest");
        assert_eq!(outcome, StopOutcome::Done);
        assert!(h.ctx.state.last_action_time.is_some());
    }

    #[tokio::test]
    async fn cooldown_without_stored_quest_is_redone() {
        let mut h = harness(area(WorkerMode::Pokestops, vec![HERE])).await;
        h.ctx.state.current_location = HERE;
        h.ctx.state.ready_for_scan = true;

        let event_ts = current_unix();
        report(h.mapper.as_ref(), ProtoIdentifier::Gmo, gmo_json(json!([stop("s", 40.0, -105.0)])), HERE).await;
        report(h.mapper.as_ref(), ProtoIdentifier::FortSearch, json!({"result": 3, "fort_id": "s"}), HERE).await;
        let outcome = h.ctx.post_move_quest(QuestLayer::Ar, event_ts).await.expect("quest");
        assert_eq!(outcome, StopOutcome::Redo);
    }

    #[tokio::test]
    async fn level_mode_counts_spun_stops() {
        let mut cfg = area(WorkerMode::Pokestops, vec![HERE]);
        cfg.settings.level_mode = true;
        let mut h = harness(cfg).await;
        h.ctx.state.current_location = HERE;
        h.ctx.state.ready_for_scan = true;

        let event_ts = current_unix();
        report(h.mapper.as_ref(), ProtoIdentifier::Gmo, gmo_json(json!([stop("s", 40.0, -105.0)])), HERE).await;
        report(
            h.mapper.as_ref(),
            ProtoIdentifier::FortSearch,
            json!({"result": 1, "fort_id": "s", "items": [{"item": 1, "count": 1}]}),
            HERE,
        )
        .await;
        let outcome = h.ctx.post_move_quest(QuestLayer::Ar, event_ts).await.expect("quest");
        assert_eq!(outcome, StopOutcome::Done);
        assert_eq!(h.mapper.get_stops_visited("dev1").await, 1);
    }

    #[tokio::test]
    async fn other_layer_defers_the_location() {
        let mut h = harness(area(WorkerMode::Pokestops, vec![HERE])).await;
        h.ctx.state.current_location = HERE;
        h.mapper.set_quests_held("dev1", Some(vec![QuestLayer::Ar.as_i32()])).await;

        let outcome = h.ctx.post_move_quest(QuestLayer::Ar, current_unix()).await.expect("quest");
        assert_eq!(outcome, StopOutcome::NotReady);
        assert!(!h.ctx.state.ready_for_scan);
    }

    #[tokio::test]
    async fn stop_data_strikes_count_per_inspection_and_reset_on_success() {
        let mut h = harness(area(WorkerMode::Pokestops, vec![HERE])).await;
        h.ctx.state.current_location = HERE;
        let empty = gmo(json!([]));
        let spinnable = gmo(json!([stop("s", 40.00005, -105.00003)]));

        h.ctx.counted_inspection(Some(&empty)).await.expect("first");
        h.ctx.counted_inspection(Some(&empty)).await.expect("second");
        assert_eq!(h.ctx.state.spinnable_data_failcount, 2);
        h.ctx.counted_inspection(Some(&spinnable)).await.expect("success");
        assert_eq!(h.ctx.state.spinnable_data_failcount, 0);

        h.ctx.counted_inspection(None).await.expect("first again");
        h.ctx.counted_inspection(Some(&empty)).await.expect("second again");
        assert!(h.device.log().is_empty());

        let mapper = h.mapper.clone();
        let injector = tokio::spawn(async move {
            loop {
                mapper.set_injection_status("dev1", true).await;
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        });
        h.ctx.counted_inspection(Some(&empty)).await.expect("third");
        injector.abort();
        assert_eq!(h.ctx.state.spinnable_data_failcount, 0);
        assert_eq!(h.device.log(), vec!["stop_app", "start_app"]);
    }

    #[tokio::test]
    async fn vanished_stop_is_deleted_and_dropped_from_the_route() {
        let elsewhere = Location::new(41.0, -105.0);
        let mut h = harness(area(WorkerMode::Pokestops, vec![HERE, elsewhere])).await;
        h.ctx.state.current_location = HERE;
        h.ctx.state.ready_for_scan = true;
        let gone = Location::new(40.00005, -105.00003);
        let five_days_ago = now_naive() - chrono::Duration::days(5);
        insert_stop(&h, "gone", gone, five_days_ago).await;
        insert_stop(&h, "fresh", Location::new(40.0002, -105.0), now_naive()).await;

        let event_ts = current_unix();
        report(h.mapper.as_ref(), ProtoIdentifier::Gmo, gmo_json(json!([stop("far", 40.00135, -105.0)])), HERE).await;
        let outcome = h.ctx.post_move_quest(QuestLayer::Ar, event_ts).await.expect("quest");
        assert_eq!(outcome, StopOutcome::Removed);

        let db = h.ctx.submit.db();
        assert!(db.stop_by_id("gone").await.expect("query").is_none());
        assert!(db.stop_by_id("fresh").await.expect("query").is_some());
        assert_eq!(h.ctx.state.spinnable_data_failcount, 1);

        // The worker's spot left the route.
        h.route.add_coords_to_be_removed("dev1", elsewhere).await;
        assert_eq!(h.route.next_location("dev1").await.expect("next"), None);
    }

    #[tokio::test]
    async fn moved_stop_gets_its_new_location() {
        let mut h = harness(area(WorkerMode::Pokestops, vec![HERE])).await;
        h.ctx.state.current_location = HERE;
        insert_stop(&h, "moved", Location::new(40.0001, -105.0), now_naive()).await;

        let gmo = gmo(json!([stop("moved", 40.0002, -105.0)]));
        h.ctx.reconcile_stops(&gmo).await.expect("reconcile");
        let stored = h.ctx.submit.db().stop_by_id("moved").await.expect("query").expect("stop");
        assert_eq!(stored.location(), Location::new(40.0002, -105.0));
    }
}
