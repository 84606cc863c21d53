// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use super::{ScanStrategy, StrategyContext, WorkerLifecycle};
use crate::common::time_utils::{current_unix, unix_from_naive};
use crate::domain::constants::{
    SOFTBAN_COOLDOWN_MAX, SOFTBAN_COOLDOWN_TABLE, TELEPORT_COOLDOWN_STEPS, WALK_TIMESTAMP_BUFFER_SECS,
};
use crate::domain::error::AppError;
use crate::domain::geo::{Location, destination};
use crate::domain::types::TransportType;
use crate::services::mapping::AreaSettings;
use std::time::Duration;

/// m/s of the short detour walked after a teleport.
const WALK_AFTER_TELEPORT_SPEED: f64 = 11.0;

pub fn choose_transport(area: &AreaSettings, last: &Location, distance: f64) -> TransportType {
    if area.speed <= 0.0 || last.is_zero() || (area.max_distance > 0.0 && distance > area.max_distance) {
        TransportType::Teleport
    } else {
        TransportType::Walk
    }
}

/// Extra sleep after teleporting `distance` meters, if any.
pub fn teleport_cooldown(distance: f64) -> Option<i64> {
    TELEPORT_COOLDOWN_STEPS
        .iter()
        .find(|(bound, _)| distance > *bound)
        .map(|(_, secs)| *secs)
}

/// Seconds the game wants between stop interactions `distance` meters apart.
pub fn softban_cooldown(distance: f64) -> i64 {
    SOFTBAN_COOLDOWN_TABLE
        .iter()
        .find(|(bound, _)| distance <= *bound)
        .map(|(_, secs)| *secs)
        .unwrap_or(SOFTBAN_COOLDOWN_MAX)
}

/// Earliest device timestamp accepted for data captured at the end of a
/// walk from `started` to `arrived`.
pub fn walk_event_ts(started: i64, arrived: i64) -> i64 {
    let buffered = arrived - WALK_TIMESTAMP_BUFFER_SECS;
    if buffered < started {
        return started;
    }
    let halfway = (arrived + started) / 2;
    if halfway < buffered { buffered } else { halfway }
}

/// Sleep after a quest-mode move: the mode delay, raised to whatever the
/// softban cooldown still demands.
///
/// The stored softban action wins when present. Otherwise the cooldown is
/// the mode delay minus the time since the last local action, nothing on a
/// fresh start, or the table value for the distance just moved.
pub fn quest_move_delay(
    delay: f64,
    now: i64,
    softban: Option<(i64, Location)>,
    current: &Location,
    last_action: Option<i64>,
    distance_moved: f64,
    first_move: bool,
) -> f64 {
    let avoid = if let Some((at, location)) = softban {
        (at + softban_cooldown(location.distance_to(current)) - now).max(0) as f64
    } else if let Some(last) = last_action {
        delay - (now - last) as f64
    } else if first_move {
        0.0
    } else {
        softban_cooldown(distance_moved) as f64
    };
    delay.max(avoid)
}

impl StrategyContext {
    /// Places the device where it stopped last, or in the middle of the fence.
    pub(crate) async fn move_to_start(&mut self) -> Result<(), AppError> {
        let fence = self.route.geofence();
        let last_known = self
            .mapper
            .get_last_known_location(&self.origin)
            .await
            .filter(|loc| loc.is_valid() && fence.contains(loc));
        let Some(start) = last_known.or_else(|| fence.centroid()) else {
            return Ok(());
        };
        tracing::info!(
            target: "strategy",
            origin = %self.origin,
            lat = start.lat,
            lng = start.lng,
            "Moving to start position"
        );
        self.communicator.set_location(&self.origin, start, 0.0).await
    }

    /// Moves to `state.current_location` and sleeps as the area demands.
    /// Returns the timestamp data must be newer than to count for this spot.
    pub(crate) async fn move_to_location(&mut self, strategy: ScanStrategy) -> Result<i64, AppError> {
        self.ensure_running()?;
        let origin = self.origin.clone();
        let current = self.state.current_location;
        let last = self.state.last_location;
        let first_move = last.is_zero();
        let distance = if first_move { 0.0 } else { last.distance_to(&current) };
        let transport = choose_transport(&self.area, &last, distance);
        tracing::debug!(
            target: "strategy",
            origin = %origin,
            ?transport,
            distance,
            lat = current.lat,
            lng = current.lng,
            "Moving"
        );

        let (mut event_ts, mut delay) = match transport {
            TransportType::Teleport => {
                self.communicator.set_location(&origin, current, 0.0).await?;
                let event_ts = current_unix();
                let mut delay = self.device.post_teleport_delay;
                if !strategy.is_quest()
                    && self.device.cooldown_sleep
                    && let Some(cooldown) = teleport_cooldown(distance)
                {
                    delay = cooldown as f64;
                }
                let detour = self.device.walk_after_teleport_distance;
                if detour > 0.0 && detour < distance {
                    let walked = self.walk_after_teleport(current, detour).await?;
                    delay = (delay - walked).max(0.0);
                }
                (event_ts, delay)
            }
            TransportType::Walk => {
                let speed = self.area.speed / 3.6;
                self.route
                    .set_worker_sleeping(&origin, (distance / speed).ceil() as u64)
                    .await;
                let started = current_unix();
                self.communicator.walk_from_to(&origin, last, current, speed).await?;
                (walk_event_ts(started, current_unix()), self.device.post_walk_delay)
            }
        };

        if strategy.is_quest() {
            let softban = self.softban_record().await;
            delay = quest_move_delay(
                delay,
                current_unix(),
                softban,
                &current,
                self.state.last_action_time,
                distance,
                first_move,
            );
        }
        delay = self.rotate_instead_of_sleeping(delay).await?;

        self.state.last_transport = Some(transport);
        self.state.last_location = current;
        self.status.update(&origin, |s| s.transport = Some(transport));

        if delay > 0.0 {
            self.enter(WorkerLifecycle::Sleep);
            let secs = delay.ceil() as u64;
            self.route.set_worker_sleeping(&origin, secs).await;
            self.status
                .update(&origin, |s| s.sleeping_until = Some(current_unix() + secs as i64));
            tracing::info!(target: "strategy", origin = %origin, delay, "Sleeping after move");
            self.sleep_checked(Duration::from_secs_f64(delay)).await?;
            self.status.update(&origin, |s| s.sleeping_until = None);
        }
        if strategy.is_quest() {
            event_ts = current_unix() - delay.min(WALK_TIMESTAMP_BUFFER_SECS as f64) as i64;
        }
        Ok(event_ts)
    }

    async fn walk_after_teleport(&self, at: Location, distance: f64) -> Result<f64, AppError> {
        let aside = destination(&at, 0.0, distance);
        tracing::debug!(target: "strategy", origin = %self.origin, distance, "Walking after teleport");
        self.communicator
            .walk_from_to(&self.origin, at, aside, WALK_AFTER_TELEPORT_SPEED)
            .await?;
        self.communicator
            .walk_from_to(&self.origin, aside, at, WALK_AFTER_TELEPORT_SPEED)
            .await?;
        Ok(2.0 * distance / WALK_AFTER_TELEPORT_SPEED)
    }

    async fn softban_record(&self) -> Option<(i64, Location)> {
        match self.submit.db().device_status(&self.origin).await {
            Ok(Some(status)) => {
                let at = status.last_softban_action?;
                Some((unix_from_naive(&at), status.softban_location()?))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(target: "strategy", origin = %self.origin, error = %e, "Softban lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{area, harness};
    use super::*;
    use crate::domain::types::{QuestLayer, WorkerMode};
    use crate::services::mapping::RouteManager;

    #[test]
    fn transport_choice() {
        let mut settings = AreaSettings::default();
        let last = Location::new(1.0, 1.0);
        assert_eq!(choose_transport(&settings, &last, 10.0), TransportType::Teleport);
        settings.speed = 20.0;
        assert_eq!(choose_transport(&settings, &last, 10.0), TransportType::Walk);
        assert_eq!(choose_transport(&settings, &Location::default(), 10.0), TransportType::Teleport);
        settings.max_distance = 500.0;
        assert_eq!(choose_transport(&settings, &last, 400.0), TransportType::Walk);
        assert_eq!(choose_transport(&settings, &last, 600.0), TransportType::Teleport);
    }

    #[test]
    fn cooldown_tables() {
        assert_eq!(teleport_cooldown(2_000.0), None);
        assert_eq!(teleport_cooldown(3_000.0), Some(8));
        assert_eq!(teleport_cooldown(6_000.0), Some(10));
        assert_eq!(teleport_cooldown(12_000.0), Some(15));

        assert_eq!(softban_cooldown(500.0), 10);
        assert_eq!(softban_cooldown(1_000.0), 10);
        assert_eq!(softban_cooldown(4_000.0), 90);
        assert_eq!(softban_cooldown(2_000_000.0), SOFTBAN_COOLDOWN_MAX);
    }

    #[test]
    fn walk_timestamps_respect_the_buffer() {
        // Short walk: the start counts.
        assert_eq!(walk_event_ts(100, 105), 100);
        // Long walk: ten seconds before arrival.
        assert_eq!(walk_event_ts(100, 200), 190);
        // In between: halfway.
        assert_eq!(walk_event_ts(100, 112), 106);
    }

    #[test]
    fn quest_delay_takes_the_softban_into_account() {
        let here = Location::new(40.0, -105.0);
        let far = Location::new(40.03, -105.0);
        // Stored action ~3.3 km away, 30 s ago: 90 s cooldown, 60 s left.
        assert_eq!(quest_move_delay(2.0, 1_000, Some((970, far)), &here, None, 0.0, false), 60.0);
        // Cooldown long over.
        assert_eq!(quest_move_delay(2.0, 1_000, Some((100, far)), &here, None, 0.0, false), 2.0);
        assert_eq!(quest_move_delay(5.0, 1_000, None, &here, Some(998), 0.0, false), 5.0);
        assert_eq!(quest_move_delay(0.0, 1_000, None, &here, None, 3_000.0, true), 0.0);
        assert_eq!(quest_move_delay(0.0, 1_000, None, &here, None, 3_000.0, false), 90.0);
    }

    #[tokio::test]
    async fn first_move_teleports_and_then_walks() {
        let a = Location::new(52.52, 13.405);
        let b = Location::new(52.5201, 13.405);
        let mut cfg = area(WorkerMode::MonMitm, vec![a, b]);
        cfg.settings.speed = 3600.0;
        let mut h = harness(cfg).await;

        h.ctx.state.current_location = a;
        h.ctx.move_to_location(ScanStrategy::WildMon).await.expect("teleport");
        assert_eq!(h.ctx.state.last_transport, Some(TransportType::Teleport));

        h.ctx.state.current_location = b;
        h.ctx.move_to_location(ScanStrategy::WildMon).await.expect("walk");
        assert_eq!(h.ctx.state.last_transport, Some(TransportType::Walk));
        assert_eq!(h.ctx.state.last_location, b);
        assert_eq!(h.device.log(), vec!["set_location 52.52000,13.40500", "walk 52.52010,13.40500"]);
    }

    #[tokio::test]
    async fn quest_move_sleeps_out_the_stored_softban() {
        let here = Location::new(40.0, -105.0);
        let mut h = harness(area(WorkerMode::Pokestops, vec![here])).await;
        h.ctx.state.current_location = here;
        h.ctx.state.last_location = Location::new(40.0, -105.0001);
        // Action right here one second ago: ten second cooldown, nine left.
        h.ctx
            .submit
            .record_softban_action("dev1", &here, current_unix() - 1)
            .await
            .expect("softban");
        let shutdown = h.ctx.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown.cancel();
        });

        let started = current_unix();
        let moved = h
            .ctx
            .move_to_location(ScanStrategy::Quest { layer: QuestLayer::Ar })
            .await;
        assert!(matches!(moved, Err(AppError::StopWorker { .. })));
        let until = h.ctx.status.get("dev1").and_then(|s| s.sleeping_until).expect("sleeping");
        assert!(until - started >= 8, "slept only {}s", until - started);
        assert!(h.route.is_worker_sleeping("dev1").await);
    }
}
