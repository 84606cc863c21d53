// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Correlating device payloads with the location a strategy moved to.

use super::{ScanStrategy, StrategyContext};
use crate::common::time_utils::current_unix;
use crate::domain::constants::{
    DISTANCE_CONSIDER_ENCOUNTERS, MINIMUM_DISTANCE_ALLOWANCE_FOR_GMO, RADIUS_FOR_CELLS_CONSIDERED_FOR_STOP_SCAN,
    S2_GMO_CELL_LEVEL,
};
use crate::domain::error::AppError;
use crate::domain::geo::Location;
use crate::domain::proto::{FortDetailsOut, FortSearchOut, FortType, GetMapObjects, ProtoIdentifier};
use crate::domain::s2::{CellId, cells_around};
use crate::domain::types::{FortSearchResult, ReceivedType, TransportType};
use crate::services::mitm_mapper::LatestProtoEntry;
use crate::services::stats::LocationOutcome;
use std::time::Duration;
use tokio::time::Instant;

/// A payload that satisfied the wait.
#[derive(Clone, Debug)]
pub struct Received {
    pub kind: ReceivedType,
    pub gmo: Option<GetMapObjects>,
    pub data_ts: i64,
}

impl Received {
    fn of(kind: ReceivedType, entry: &LatestProtoEntry) -> Self {
        Self {
            kind,
            gmo: None,
            data_ts: entry.device_ts,
        }
    }
}

/// Radius around the current location a reported position must fall in.
pub fn allowed_radius(max_radius: f64, max_valid_distance: f64) -> f64 {
    max_radius
        .min(max_valid_distance)
        .max(MINIMUM_DISTANCE_ALLOWANCE_FOR_GMO)
}

pub(crate) fn wild_within(gmo: &GetMapObjects, center: &Location, radius: f64) -> bool {
    gmo.wild_pokemon()
        .any(|mon| mon.location().distance_to(center) <= radius)
}

/// Whether a cell around `center` that could hold the stop holds any fort.
pub(crate) fn forts_near(gmo: &GetMapObjects, center: &Location) -> bool {
    let cells = cells_around(center, RADIUS_FOR_CELLS_CONSIDERED_FOR_STOP_SCAN, S2_GMO_CELL_LEVEL);
    gmo.map_cells
        .iter()
        .any(|cell| !cell.forts.is_empty() && cells.contains(&CellId(cell.s2_cell_id)))
}

fn gmo_satisfies(strategy: ScanStrategy, gmo: &GetMapObjects, here: &Location) -> bool {
    match strategy {
        ScanStrategy::Init => gmo.has_forts() || wild_within(gmo, here, DISTANCE_CONSIDER_ENCOUNTERS),
        ScanStrategy::WildMon | ScanStrategy::MonIv => wild_within(gmo, here, DISTANCE_CONSIDER_ENCOUNTERS),
        ScanStrategy::Raids => gmo.has_forts(),
        ScanStrategy::Quest { .. } => forts_near(gmo, here),
    }
}

impl StrategyContext {
    /// Polls the mapper until `proto` arrived for the current location, or
    /// `timeout` (counted from `event_ts`) ran out.
    pub(crate) async fn wait_for_data(
        &self,
        strategy: ScanStrategy,
        event_ts: i64,
        proto: ProtoIdentifier,
        timeout: Duration,
    ) -> Result<Option<Received>, AppError> {
        let elapsed = Duration::from_secs((current_unix() - event_ts).max(0) as u64);
        let deadline = Instant::now() + timeout.saturating_sub(elapsed);
        loop {
            self.ensure_running()?;
            if let Some(received) = self.check_latest(strategy, event_ts, proto).await {
                tracing::debug!(
                    target: "strategy",
                    origin = %self.origin,
                    kind = ?received.kind,
                    data_ts = received.data_ts,
                    "Data received"
                );
                return Ok(Some(received));
            }
            if Instant::now() >= deadline {
                break;
            }
            self.pause(self.settings.poll_interval).await?;
        }
        tracing::warn!(
            target: "strategy",
            origin = %self.origin,
            ?proto,
            event_ts,
            "Timeout waiting for data"
        );
        Ok(None)
    }

    /// Accepts data captured after `since`, giving the device the full
    /// `timeout` from now.
    pub(crate) async fn wait_for_data_from_now(
        &self,
        strategy: ScanStrategy,
        since: i64,
        proto: ProtoIdentifier,
        timeout: Duration,
    ) -> Result<Option<Received>, AppError> {
        let elapsed = Duration::from_secs((current_unix() - since).max(0) as u64);
        self.wait_for_data(strategy, since, proto, timeout + elapsed).await
    }

    /// Map data wait with the failure accounting and location stats around it.
    pub(crate) async fn await_location_data(
        &mut self,
        strategy: ScanStrategy,
        event_ts: i64,
        proto: ProtoIdentifier,
    ) -> Result<Option<Received>, AppError> {
        let received = self
            .wait_for_data(strategy, event_ts, proto, self.gmo_timeout())
            .await?;
        match &received {
            Some(data) => {
                self.reset_failure_counters();
                self.state.last_data_ts = Some(data.data_ts);
                self.record_location(true, data.data_ts).await;
                let ts = data.data_ts;
                self.status.update(&self.origin, |s| s.last_proto_ts = Some(ts));
            }
            None => {
                self.record_location(false, current_unix()).await;
                self.handle_proto_timeout().await?;
            }
        }
        Ok(received)
    }

    async fn record_location(&self, success: bool, data_ts: i64) {
        let outcome = LocationOutcome {
            location: self.state.current_location,
            success,
            data_ts,
            position_type: self.route.get_position_type(&self.origin).await,
            mode: self.route.mode(),
            walker: self.walker.clone(),
            transport: self.state.last_transport.unwrap_or(TransportType::Teleport),
        };
        self.stats.stats_collect_location_data(&self.origin, outcome).await;
    }

    /// Newest entry under `proto` captured after `event_ts` close enough to
    /// the current location.
    async fn fresh(&self, proto: ProtoIdentifier, event_ts: i64, last_known: Location) -> Option<LatestProtoEntry> {
        let entry = self
            .mapper
            .request_latest(&self.origin, &proto.key(), Some(event_ts - 1))
            .await?;
        let reported = entry.location.filter(Location::is_valid).unwrap_or(last_known);
        let distance = reported.distance_to(&self.state.current_location);
        let allowed = allowed_radius(self.area.max_radius, self.settings.max_valid_distance);
        if distance > allowed {
            tracing::debug!(
                target: "strategy",
                origin = %self.origin,
                ?proto,
                distance,
                allowed,
                "Data too far from the current location"
            );
            return None;
        }
        Some(entry)
    }

    async fn check_latest(&self, strategy: ScanStrategy, event_ts: i64, proto: ProtoIdentifier) -> Option<Received> {
        let last_known = self
            .mapper
            .get_last_known_location(&self.origin)
            .await
            .filter(Location::is_valid)?;

        if proto != ProtoIdentifier::GymInfo
            && let Some(entry) = self.fresh(ProtoIdentifier::GymInfo, event_ts, last_known).await
        {
            return Some(Received::of(ReceivedType::Gym, &entry));
        }
        if proto != ProtoIdentifier::Encounter
            && let Some(entry) = self.fresh(ProtoIdentifier::Encounter, event_ts, last_known).await
        {
            return Some(Received::of(ReceivedType::Mon, &entry));
        }

        let entry = self.fresh(proto, event_ts, last_known).await?;
        match proto {
            ProtoIdentifier::Gmo => {
                let gmo: GetMapObjects = entry.payload.decode()?;
                if !gmo_satisfies(strategy, &gmo, &self.state.current_location) {
                    return None;
                }
                Some(Received {
                    kind: ReceivedType::Gmo,
                    gmo: Some(gmo),
                    data_ts: entry.device_ts,
                })
            }
            ProtoIdentifier::Encounter => Some(Received::of(ReceivedType::Mon, &entry)),
            ProtoIdentifier::FortSearch => {
                let search: FortSearchOut = entry.payload.decode()?;
                let result = FortSearchResult::classify(&search)?;
                Some(Received::of(ReceivedType::FortSearchResult(result), &entry))
            }
            ProtoIdentifier::FortDetails => {
                let details: FortDetailsOut = entry.payload.decode()?;
                let kind = match details.fort_type {
                    FortType::Gym => ReceivedType::Gym,
                    FortType::Stop => ReceivedType::Stop,
                };
                Some(Received::of(kind, &entry))
            }
            ProtoIdentifier::GymInfo => Some(Received::of(ReceivedType::Gym, &entry)),
            _ => Some(Received::of(ReceivedType::Undefined, &entry)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{area, harness, report};
    use super::*;
    use crate::domain::types::{QuestLayer, WorkerMode};
    use crate::services::mitm_mapper::{LatestPayload, MitmMapper};
    use serde_json::json;

    const HERE: Location = Location::new(52.52, 13.405);

    fn gmo_with_mon(lat: f64, lng: f64) -> serde_json::Value {
        json!({"map_cells": [{"s2_cell_id": 1, "wild_pokemon": [
            {"encounter_id": 42, "latitude": lat, "longitude": lng, "pokemon": {"id": 16}}
        ]}]})
    }

    #[test]
    fn radius_is_clamped() {
        assert_eq!(allowed_radius(70.0, 50.0), 50.0);
        assert_eq!(allowed_radius(30.0, 50.0), 30.0);
        assert_eq!(allowed_radius(1.0, 50.0), MINIMUM_DISTANCE_ALLOWANCE_FOR_GMO);
    }

    #[test]
    fn quest_predicate_needs_forts_in_nearby_cells() {
        let cell = CellId::from_location_at(&HERE, S2_GMO_CELL_LEVEL).0;
        let gmo: GetMapObjects = serde_json::from_value(json!({"map_cells": [
            {"s2_cell_id": cell, "forts": [{"fort_id": "s", "latitude": 52.52, "longitude": 13.405, "fort_type": 1}]}
        ]}))
        .expect("gmo");
        assert!(gmo_satisfies(ScanStrategy::Quest { layer: QuestLayer::Ar }, &gmo, &HERE));
        assert!(gmo_satisfies(ScanStrategy::Raids, &gmo, &HERE));
        assert!(!gmo_satisfies(ScanStrategy::WildMon, &gmo, &HERE));
        let far = Location::new(53.0, 14.0);
        assert!(!gmo_satisfies(ScanStrategy::Quest { layer: QuestLayer::Ar }, &gmo, &far));
    }

    #[tokio::test]
    async fn gmo_with_close_mon_is_accepted() {
        let mut h = harness(area(WorkerMode::MonMitm, vec![HERE])).await;
        h.ctx.state.current_location = HERE;
        let event_ts = current_unix();
        report(h.mapper.as_ref(), ProtoIdentifier::Gmo, gmo_with_mon(52.52, 13.405), HERE).await;

        let received = h
            .ctx
            .await_location_data(ScanStrategy::WildMon, event_ts, ProtoIdentifier::Gmo)
            .await
            .expect("wait")
            .expect("received");
        assert_eq!(received.kind, ReceivedType::Gmo);
        assert_eq!(received.gmo.map(|g| g.map_cells.len()), Some(1));
        let pending = h.ctx.stats.pending("dev1").await.expect("stats");
        assert_eq!(pending.location_ok, 1);
    }

    #[tokio::test]
    async fn data_captured_at_the_event_second_counts_as_fresh() {
        let mut h = harness(area(WorkerMode::MonMitm, vec![HERE])).await;
        h.ctx.state.current_location = HERE;
        let payload = LatestPayload::from_json(gmo_with_mon(52.52, 13.405));
        h.mapper
            .update_latest("dev1", &ProtoIdentifier::Gmo.key(), payload, 1_000, 1_000, Some(HERE))
            .await;

        let same_second = h.ctx.fresh(ProtoIdentifier::Gmo, 1_000, HERE).await.expect("fresh");
        assert_eq!(same_second.device_ts, 1_000);
        assert!(h.ctx.fresh(ProtoIdentifier::Gmo, 1_001, HERE).await.is_none());
        assert!(h.ctx.fresh(ProtoIdentifier::Gmo, 999, HERE).await.is_some());
    }

    #[tokio::test]
    async fn reports_from_elsewhere_time_out() {
        let mut h = harness(area(WorkerMode::MonMitm, vec![HERE])).await;
        h.ctx.state.current_location = HERE;
        let event_ts = current_unix();
        let elsewhere = Location::new(52.53, 13.405);
        report(h.mapper.as_ref(), ProtoIdentifier::Gmo, gmo_with_mon(52.53, 13.405), elsewhere).await;

        let received = h
            .ctx
            .await_location_data(ScanStrategy::WildMon, event_ts, ProtoIdentifier::Gmo)
            .await
            .expect("wait");
        assert!(received.is_none());
        assert_eq!(h.ctx.state.restart_count, 1);
        let pending = h.ctx.stats.pending("dev1").await.expect("stats");
        assert_eq!(pending.location_nok, 1);
    }

    #[tokio::test]
    async fn stale_data_is_ignored_and_encounters_return_early() {
        let mut h = harness(area(WorkerMode::MonMitm, vec![HERE])).await;
        h.ctx.state.current_location = HERE;
        report(h.mapper.as_ref(), ProtoIdentifier::Gmo, gmo_with_mon(52.52, 13.405), HERE).await;
        let later = current_unix() + 5;
        let stale = h
            .ctx
            .wait_for_data(ScanStrategy::WildMon, later, ProtoIdentifier::Gmo, Duration::from_millis(50))
            .await
            .expect("wait");
        assert!(stale.is_none());

        let event_ts = current_unix();
        report(h.mapper.as_ref(), ProtoIdentifier::Encounter, json!({"pokemon": {"encounter_id": 42}}), HERE).await;
        let early = h
            .ctx
            .wait_for_data(ScanStrategy::WildMon, event_ts, ProtoIdentifier::Gmo, Duration::from_millis(50))
            .await
            .expect("wait")
            .expect("received");
        assert_eq!(early.kind, ReceivedType::Mon);
    }

    #[tokio::test]
    async fn fort_search_results_are_classified() {
        let h = harness(area(WorkerMode::Pokestops, vec![HERE])).await;
        let mut ctx = h.ctx;
        ctx.state.current_location = HERE;
        let event_ts = current_unix();
        report(h.mapper.as_ref(), ProtoIdentifier::FortSearch, json!({"result": 3, "fort_id": "s"}), HERE).await;
        let received = ctx
            .wait_for_data(
                ScanStrategy::Quest { layer: QuestLayer::Ar },
                event_ts,
                ProtoIdentifier::FortSearch,
                Duration::from_millis(50),
            )
            .await
            .expect("wait")
            .expect("received");
        assert_eq!(received.kind, ReceivedType::FortSearchResult(FortSearchResult::Cooldown));
    }
}
