// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use super::{Received, ScanStrategy, StrategyContext};
use crate::domain::constants::DISTANCE_CONSIDER_IV_ENCOUNTERS;
use crate::domain::error::AppError;
use crate::domain::proto::{GetMapObjects, ProtoIdentifier};
use crate::domain::types::ReceivedType;
use std::collections::HashSet;

impl StrategyContext {
    /// First mon of the GMO the device is expected to encounter at this spot.
    async fn encounter_target(&self, strategy: ScanStrategy, gmo: &GetMapObjects) -> Result<Option<u64>, AppError> {
        let here = self.state.current_location;
        let encountered = self.mapper.get_encountered(&self.origin).await;
        let ids_left: HashSet<u64> = match strategy {
            ScanStrategy::MonIv => self.route.get_encounter_ids_left().await?.into_iter().collect(),
            _ => HashSet::new(),
        };

        for mon in gmo.wild_pokemon() {
            if mon.location().distance_to(&here) > DISTANCE_CONSIDER_IV_ENCOUNTERS
                || encountered.contains_key(&mon.encounter_id)
            {
                continue;
            }
            let wanted = match strategy {
                ScanStrategy::WildMon => {
                    self.area.encounter_all || self.area.mon_ids_iv.contains(&mon.pokemon.id)
                }
                ScanStrategy::MonIv => ids_left.contains(&mon.encounter_id),
                _ => false,
            };
            if wanted && !self.submit.iv_recently_scanned(mon).await {
                return Ok(Some(mon.encounter_id));
            }
        }
        Ok(None)
    }

    /// Waits for the encounter of a wanted mon the GMO showed nearby.
    /// `None` when nothing needed encountering.
    pub(crate) async fn post_move_mons(
        &mut self,
        strategy: ScanStrategy,
        received: &Received,
    ) -> Result<Option<Received>, AppError> {
        let Some(gmo) = received.gmo.as_ref().filter(|_| received.kind == ReceivedType::Gmo) else {
            return Ok(None);
        };
        let Some(encounter_id) = self.encounter_target(strategy, gmo).await? else {
            return Ok(None);
        };

        tracing::debug!(target: "strategy", origin = %self.origin, encounter_id, "Waiting for encounter");
        let encounter = self
            .wait_for_data_from_now(
                strategy,
                received.data_ts,
                ProtoIdentifier::Encounter,
                self.settings.encounter_timeout,
            )
            .await?;
        if encounter.is_none() {
            tracing::info!(target: "strategy", origin = %self.origin, encounter_id, "No encounter arrived");
        }
        Ok(encounter)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{area, harness, report};
    use super::*;
    use crate::common::time_utils::current_unix;
    use crate::domain::geo::Location;
    use crate::domain::types::WorkerMode;
    use crate::services::mitm_mapper::MitmMapper;
    use serde_json::json;

    const HERE: Location = Location::new(52.52, 13.405);

    fn gmo_received(species: i32) -> Received {
        let gmo: GetMapObjects = serde_json::from_value(json!({"map_cells": [{"s2_cell_id": 1, "wild_pokemon": [
            {"encounter_id": 42, "latitude": 52.52, "longitude": 13.405, "pokemon": {"id": species}}
        ]}]}))
        .expect("gmo");
        Received {
            kind: ReceivedType::Gmo,
            gmo: Some(gmo),
            data_ts: current_unix(),
        }
    }

    #[tokio::test]
    async fn wanted_mon_waits_for_its_encounter() {
        let mut cfg = area(WorkerMode::MonMitm, vec![HERE]);
        cfg.settings.mon_ids_iv = vec![16];
        let mut h = harness(cfg).await;
        h.ctx.state.current_location = HERE;
        let received = gmo_received(16);
        report(h.mapper.as_ref(), ProtoIdentifier::Encounter, json!({"pokemon": {"encounter_id": 42}}), HERE).await;

        let encounter = h
            .ctx
            .post_move_mons(ScanStrategy::WildMon, &received)
            .await
            .expect("post");
        assert_eq!(encounter.map(|r| r.kind), Some(ReceivedType::Mon));
    }

    #[tokio::test]
    async fn unwanted_or_known_mons_are_skipped() {
        let mut cfg = area(WorkerMode::MonMitm, vec![HERE]);
        cfg.settings.mon_ids_iv = vec![16];
        let mut h = harness(cfg).await;
        h.ctx.state.current_location = HERE;

        let other = h.ctx.post_move_mons(ScanStrategy::WildMon, &gmo_received(19)).await;
        assert!(other.expect("post").is_none());

        h.mapper.add_encountered("dev1", &[42], current_unix() + 60).await;
        let known = h.ctx.post_move_mons(ScanStrategy::WildMon, &gmo_received(16)).await;
        assert!(known.expect("post").is_none());

        // Nothing left to scan in the area for IV mode.
        let iv = h.ctx.post_move_mons(ScanStrategy::MonIv, &gmo_received(16)).await;
        assert!(iv.expect("post").is_none());
    }
}
