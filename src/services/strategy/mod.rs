// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Per-device scan strategies.
//!
//! A [`ScanWorker`] owns one device while it is assigned to an area. It boots
//! the client, then repeatedly takes the next route location, moves there,
//! waits for the payload the device captured at that spot and post-processes
//! it the way its [`ScanStrategy`] requires.

mod failure;
mod injection;
mod mons;
mod movement;
mod quest;
mod wait;

pub use movement::{choose_transport, quest_move_delay, softban_cooldown, teleport_cooldown, walk_event_ts};
pub use quest::{StopOutcome, StopScan, classify_stop};
pub use wait::{Received, allowed_radius};

use crate::app::config::GlobalSettings;
use crate::domain::constants::{
    ENCOUNTER_WAIT_TIMEOUT_SECS, FORT_SEARCH_WAIT_TIMEOUT_SECS, GMO_WAIT_TIMEOUT_SECS, INJECTION_POLL_ROUNDS,
};
use crate::domain::error::AppError;
use crate::domain::geo::Location;
use crate::domain::proto::ProtoIdentifier;
use crate::domain::types::{QuestLayer, ScanMode, TransportType, WorkerMode};
use crate::infrastructure::data::submit::ProtoSubmit;
use crate::services::device::SharedCommunicator;
use crate::services::mapping::{AreaSettings, DeviceSettings, SharedRouteManager};
use crate::services::mitm_mapper::SharedMitmMapper;
use crate::services::stats::SharedStats;
use crate::services::status::SharedStatusBoard;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How a device scans the area it is assigned to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanStrategy {
    Init,
    WildMon,
    MonIv,
    Raids,
    Quest { layer: QuestLayer },
}

impl ScanStrategy {
    /// `None` for idle areas.
    pub fn for_area(mode: WorkerMode, settings: &AreaSettings) -> Option<Self> {
        match mode {
            WorkerMode::InitMitm => Some(ScanStrategy::Init),
            WorkerMode::MonMitm | WorkerMode::RaidsMitm if settings.init => Some(ScanStrategy::Init),
            WorkerMode::MonMitm => Some(ScanStrategy::WildMon),
            WorkerMode::RaidsMitm => Some(ScanStrategy::Raids),
            WorkerMode::IvMitm => Some(ScanStrategy::MonIv),
            WorkerMode::Pokestops => Some(ScanStrategy::Quest { layer: settings.layer }),
            WorkerMode::Idle => None,
        }
    }

    pub fn scan_mode(self) -> ScanMode {
        match self {
            ScanStrategy::Init | ScanStrategy::WildMon => ScanMode::Mons,
            ScanStrategy::MonIv => ScanMode::Ivs,
            ScanStrategy::Raids => ScanMode::Raids,
            ScanStrategy::Quest { .. } => ScanMode::Quests,
        }
    }

    pub fn is_quest(self) -> bool {
        matches!(self, ScanStrategy::Quest { .. })
    }
}

impl fmt::Display for ScanStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanStrategy::Init => f.write_str("init"),
            ScanStrategy::WildMon => f.write_str("wild_mon"),
            ScanStrategy::MonIv => f.write_str("mon_iv"),
            ScanStrategy::Raids => f.write_str("raids"),
            ScanStrategy::Quest { layer } => write!(f, "quest({layer:?})"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLifecycle {
    Boot,
    HealthCheck,
    AcquireLocation,
    Move,
    Sleep,
    AwaitData,
    PostProcess,
    Stop,
}

/// Timings and thresholds shared by every strategy of the instance.
#[derive(Clone, Debug)]
pub struct StrategySettings {
    pub poll_interval: Duration,
    pub max_valid_distance: f64,
    pub restart_threshold: u32,
    pub reboot_threshold: u32,
    pub injection_thresh_reboot: u32,
    pub injection_poll_rounds: u32,
    pub injection_poll_interval: Duration,
    pub min_level_iv: i32,
    pub gmo_timeout: Duration,
    pub encounter_timeout: Duration,
    pub fort_search_timeout: Duration,
    /// Granularity of long sleeps; the area is re-checked between ticks.
    pub sleep_tick: Duration,
}

impl From<&GlobalSettings> for StrategySettings {
    fn from(settings: &GlobalSettings) -> Self {
        Self {
            poll_interval: settings.wait_poll_interval(),
            max_valid_distance: settings.max_valid_distance_m,
            restart_threshold: settings.restart_threshold,
            reboot_threshold: settings.reboot_threshold,
            injection_thresh_reboot: settings.injection_thresh_reboot,
            injection_poll_rounds: INJECTION_POLL_ROUNDS,
            injection_poll_interval: Duration::from_secs(1),
            min_level_iv: settings.min_level_iv,
            gmo_timeout: Duration::from_secs(GMO_WAIT_TIMEOUT_SECS),
            encounter_timeout: Duration::from_secs(ENCOUNTER_WAIT_TIMEOUT_SECS),
            fort_search_timeout: Duration::from_secs(FORT_SEARCH_WAIT_TIMEOUT_SECS),
            sleep_tick: Duration::from_secs(1),
        }
    }
}

/// Mutable bookkeeping of one device between locations.
#[derive(Clone, Debug, Default)]
pub struct WorkerState {
    pub current_location: Location,
    pub last_location: Location,
    pub last_transport: Option<TransportType>,
    pub restart_count: u32,
    pub reboot_count: u32,
    pub spinnable_data_failcount: u32,
    /// Unix seconds of the last stop interaction that counts towards softbans.
    pub last_action_time: Option<i64>,
    pub last_data_ts: Option<i64>,
    pub last_quest_received: Option<i64>,
    /// Quest mode: whether the held quests leave room for the area's layer.
    pub ready_for_scan: bool,
}

/// Shared handles of the instance a strategy drives its device with.
#[derive(Clone)]
pub struct ScanServices {
    pub communicator: SharedCommunicator,
    pub mapper: SharedMitmMapper,
    pub submit: ProtoSubmit,
    pub stats: SharedStats,
    pub status: SharedStatusBoard,
    pub settings: StrategySettings,
}

pub struct StrategyContext {
    pub origin: String,
    pub walker: String,
    pub communicator: SharedCommunicator,
    pub route: SharedRouteManager,
    pub mapper: SharedMitmMapper,
    pub submit: ProtoSubmit,
    pub stats: SharedStats,
    pub status: SharedStatusBoard,
    pub settings: StrategySettings,
    pub area: AreaSettings,
    pub device: DeviceSettings,
    pub state: WorkerState,
    pub shutdown: CancellationToken,
}

impl StrategyContext {
    pub fn new(
        origin: &str,
        walker: &str,
        services: &ScanServices,
        route: SharedRouteManager,
        device: DeviceSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            origin: origin.to_string(),
            walker: walker.to_string(),
            communicator: services.communicator.clone(),
            area: route.get_settings().clone(),
            route,
            mapper: services.mapper.clone(),
            submit: services.submit.clone(),
            stats: services.stats.clone(),
            status: services.status.clone(),
            settings: services.settings.clone(),
            device,
            state: WorkerState::default(),
            shutdown,
        }
    }

    pub(crate) fn enter(&self, phase: WorkerLifecycle) {
        tracing::trace!(target: "strategy", origin = %self.origin, ?phase, "Entering phase");
        self.status.update(&self.origin, |s| s.phase = Some(phase));
    }

    /// Fails with `StopWorker` once shutdown began or the area was unloaded.
    pub(crate) fn ensure_running(&self) -> Result<(), AppError> {
        if self.shutdown.is_cancelled() {
            return Err(AppError::stop_worker(&self.origin, "shutdown"));
        }
        if !self.route.routemanager_present() {
            return Err(AppError::stop_worker(&self.origin, "area unloaded"));
        }
        Ok(())
    }

    /// Sleeps unless shutdown wins the race.
    pub(crate) async fn pause(&self, duration: Duration) -> Result<(), AppError> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(AppError::stop_worker(&self.origin, "shutdown")),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Long sleep in ticks, re-checking the area in between.
    pub(crate) async fn sleep_checked(&self, duration: Duration) -> Result<(), AppError> {
        let mut left = duration;
        while !left.is_zero() {
            self.ensure_running()?;
            let tick = left.min(self.settings.sleep_tick);
            self.pause(tick).await?;
            left = left.saturating_sub(tick);
        }
        Ok(())
    }

    pub(crate) fn gmo_timeout(&self) -> Duration {
        self.device
            .mitm_wait_timeout
            .map(Duration::from_secs)
            .unwrap_or(self.settings.gmo_timeout)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Scanned { success: bool },
    /// The route manager has nothing left for this device.
    RouteExhausted,
}

/// Drives one device through boot and per-location scan steps.
pub struct ScanWorker {
    strategy: ScanStrategy,
    ctx: StrategyContext,
}

impl ScanWorker {
    pub fn new(strategy: ScanStrategy, ctx: StrategyContext) -> Self {
        Self { strategy, ctx }
    }

    pub fn strategy(&self) -> ScanStrategy {
        self.strategy
    }

    pub fn context(&self) -> &StrategyContext {
        &self.ctx
    }

    pub fn state(&self) -> &WorkerState {
        &self.ctx.state
    }

    /// Boot sequence run once per area assignment.
    pub async fn pre_loop(&mut self) -> Result<(), AppError> {
        let origin = self.ctx.origin.clone();
        self.ctx.enter(WorkerLifecycle::Boot);
        tracing::info!(
            target: "strategy",
            origin = %origin,
            area = %self.ctx.route.area_id(),
            strategy = %self.strategy,
            "Starting worker"
        );
        self.ctx.mapper.set_injection_status(&origin, false).await;
        let area = self.ctx.route.area_id().to_string();
        let mode = self.ctx.route.mode();
        self.ctx.status.update(&origin, |s| {
            s.area = Some(area);
            s.mode = Some(mode);
            s.idle = false;
        });

        self.ctx.move_to_start().await?;
        self.ctx.ensure_app_running().await?;
        self.ctx.wait_for_injection().await?;
        if let ScanStrategy::Quest { layer } = self.strategy {
            self.ctx.refresh_quest_readiness(layer).await;
        }
        Ok(())
    }

    /// One location: acquire, move, sleep, await data, post-process.
    pub async fn scan_next(&mut self) -> Result<StepOutcome, AppError> {
        self.ctx.enter(WorkerLifecycle::HealthCheck);
        self.ctx.ensure_running()?;

        self.ctx.enter(WorkerLifecycle::AcquireLocation);
        let Some(next) = self.ctx.route.next_location(&self.ctx.origin).await? else {
            tracing::info!(target: "strategy", origin = %self.ctx.origin, "Route exhausted");
            return Ok(StepOutcome::RouteExhausted);
        };
        self.ctx.state.current_location = next;
        self.ctx.status.update(&self.ctx.origin, |s| s.current_location = Some(next));
        self.ctx.publish_injection(self.strategy).await?;

        self.ctx.enter(WorkerLifecycle::Move);
        let event_ts = self.ctx.move_to_location(self.strategy).await?;

        self.ctx.enter(WorkerLifecycle::AwaitData);
        let received = self
            .ctx
            .await_location_data(self.strategy, event_ts, ProtoIdentifier::Gmo)
            .await?;

        self.ctx.enter(WorkerLifecycle::PostProcess);
        let Some(received) = received else {
            return Ok(StepOutcome::Scanned { success: false });
        };
        match self.strategy {
            ScanStrategy::WildMon | ScanStrategy::MonIv => {
                self.ctx.post_move_mons(self.strategy, &received).await?;
            }
            ScanStrategy::Quest { layer } => {
                self.ctx.post_move_quest(layer, event_ts).await?;
            }
            ScanStrategy::Init | ScanStrategy::Raids => {}
        }
        self.ctx.maybe_rotate_leveled_account().await?;
        Ok(StepOutcome::Scanned { success: true })
    }

    pub async fn on_stop(&mut self) {
        self.ctx.enter(WorkerLifecycle::Stop);
        self.ctx.status.update(&self.ctx.origin, |s| {
            s.idle = true;
            s.sleeping_until = None;
        });
        tracing::info!(
            target: "strategy",
            origin = %self.ctx.origin,
            area = %self.ctx.route.area_id(),
            "Worker stopped"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::app::config::tests::base_settings;
    use crate::common::time_utils::current_unix;
    use crate::infrastructure::data::submit::tests::submitter;
    use crate::services::device::DeviceCommunicator;
    use crate::services::mapping::{AreaConfig, StaticRouteManager};
    use crate::services::mitm_mapper::{InProcessMitmMapper, LatestPayload, MitmMapper};
    use crate::services::stats::{StatsHandler, StatsSettings};
    use crate::services::status::StatusBoard;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::{Arc, Mutex};

    /// Records commands and answers topmost checks from a flag.
    #[derive(Default)]
    pub(crate) struct FakeDevice {
        pub(crate) commands: Mutex<Vec<String>>,
        pub(crate) not_topmost: std::sync::atomic::AtomicBool,
    }

    impl FakeDevice {
        pub(crate) fn log(&self) -> Vec<String> {
            self.commands.lock().map(|c| c.clone()).unwrap_or_default()
        }

        fn push(&self, command: String) {
            if let Ok(mut c) = self.commands.lock() {
                c.push(command);
            }
        }
    }

    #[async_trait]
    impl DeviceCommunicator for FakeDevice {
        async fn set_location(&self, _: &str, location: Location, _: f64) -> Result<(), AppError> {
            self.push(format!("set_location {:.5},{:.5}", location.lat, location.lng));
            Ok(())
        }
        async fn walk_from_to(&self, _: &str, _: Location, to: Location, _: f64) -> Result<(), AppError> {
            self.push(format!("walk {:.5},{:.5}", to.lat, to.lng));
            Ok(())
        }
        async fn click(&self, _: &str, _: i32, _: i32) -> Result<(), AppError> {
            Ok(())
        }
        async fn swipe(&self, _: &str, _: i32, _: i32, _: i32, _: i32) -> Result<(), AppError> {
            Ok(())
        }
        async fn screenshot(&self, _: &str) -> Result<(), AppError> {
            Ok(())
        }
        async fn is_app_topmost(&self, _: &str) -> Result<bool, AppError> {
            Ok(!self.not_topmost.load(std::sync::atomic::Ordering::SeqCst))
        }
        async fn install_apk(&self, _: &str, _: &str) -> Result<(), AppError> {
            Ok(())
        }
        async fn start_app(&self, _: &str) -> Result<(), AppError> {
            self.push("start_app".to_string());
            Ok(())
        }
        async fn stop_app(&self, _: &str) -> Result<(), AppError> {
            self.push("stop_app".to_string());
            Ok(())
        }
        async fn reboot(&self, _: &str) -> Result<(), AppError> {
            self.push("reboot".to_string());
            Ok(())
        }
        async fn switch_account(&self, _: &str) -> Result<(), AppError> {
            self.push("switch_account".to_string());
            Ok(())
        }
    }

    pub(crate) fn fast_settings() -> StrategySettings {
        let mut settings = StrategySettings::from(&base_settings());
        settings.poll_interval = Duration::from_millis(10);
        settings.injection_poll_rounds = 3;
        settings.injection_poll_interval = Duration::from_millis(10);
        settings.gmo_timeout = Duration::from_millis(300);
        settings.encounter_timeout = Duration::from_millis(200);
        settings.fort_search_timeout = Duration::from_millis(200);
        settings.sleep_tick = Duration::from_millis(10);
        settings
    }

    pub(crate) struct Harness {
        pub(crate) device: Arc<FakeDevice>,
        pub(crate) mapper: Arc<InProcessMitmMapper>,
        pub(crate) route: Arc<StaticRouteManager>,
        pub(crate) ctx: StrategyContext,
    }

    pub(crate) async fn harness(area: AreaConfig) -> Harness {
        let device = Arc::new(FakeDevice::default());
        let mapper = Arc::new(InProcessMitmMapper::new());
        let submit = submitter().await;
        let stats = Arc::new(StatsHandler::new(
            submit.db().clone(),
            StatsSettings::from(&base_settings()),
        ));
        let route = Arc::new(StaticRouteManager::new(area, Some(submit.db().clone())));
        let services = ScanServices {
            communicator: device.clone(),
            mapper: mapper.clone(),
            submit,
            stats,
            status: Arc::new(StatusBoard::new()),
            settings: fast_settings(),
        };
        let ctx = StrategyContext::new(
            "dev1",
            "day",
            &services,
            route.clone(),
            DeviceSettings::default(),
            CancellationToken::new(),
        );
        Harness { device, mapper, route, ctx }
    }

    pub(crate) fn area(mode: WorkerMode, coords: Vec<Location>) -> AreaConfig {
        AreaConfig {
            id: "north".to_string(),
            name: String::new(),
            mode,
            geofence: Default::default(),
            coords,
            prio_coords: Vec::new(),
            settings: AreaSettings::default(),
        }
    }

    /// Stores `payload` as if the device just reported it from `at`.
    pub(crate) async fn report(mapper: &dyn MitmMapper, proto: ProtoIdentifier, payload: Value, at: Location) {
        let now = current_unix();
        mapper
            .update_latest("dev1", &proto.key(), LatestPayload::from_json(payload), now, now, Some(at))
            .await;
    }

    #[test]
    fn strategy_follows_area_mode() {
        let mut settings = AreaSettings::default();
        assert_eq!(ScanStrategy::for_area(WorkerMode::MonMitm, &settings), Some(ScanStrategy::WildMon));
        assert_eq!(ScanStrategy::for_area(WorkerMode::Idle, &settings), None);
        settings.layer = QuestLayer::NonAr;
        assert_eq!(
            ScanStrategy::for_area(WorkerMode::Pokestops, &settings),
            Some(ScanStrategy::Quest { layer: QuestLayer::NonAr })
        );
        settings.init = true;
        assert_eq!(ScanStrategy::for_area(WorkerMode::RaidsMitm, &settings), Some(ScanStrategy::Init));
        assert_eq!(ScanStrategy::MonIv.scan_mode(), ScanMode::Ivs);
    }

    #[tokio::test]
    async fn boot_then_wild_mon_step_succeeds() {
        let here = Location::new(52.52, 13.405);
        let h = harness(area(WorkerMode::MonMitm, vec![here])).await;
        h.mapper.set_injection_status("dev1", true).await;
        let mapper = h.mapper.clone();
        let mut worker = ScanWorker::new(ScanStrategy::WildMon, h.ctx);

        // Boot clears the injection flag; the device re-reports it.
        let injector = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            mapper.set_injection_status("dev1", true).await;
            tokio::time::sleep(Duration::from_millis(30)).await;
            report(
                mapper.as_ref(),
                ProtoIdentifier::Gmo,
                serde_json::json!({"map_cells": [{"s2_cell_id": 1, "wild_pokemon": [
                    {"encounter_id": 42, "latitude": 52.52, "longitude": 13.405, "pokemon": {"id": 1}}
                ]}]}),
                here,
            )
            .await;
        });
        worker.pre_loop().await.expect("boot");
        let outcome = worker.scan_next().await.expect("step");
        injector.await.expect("injector");

        assert_eq!(outcome, StepOutcome::Scanned { success: true });
        assert_eq!(worker.state().restart_count, 0);
        assert_eq!(worker.state().last_location, here);
        let bundle = worker.context().mapper.get_injection_bundle("dev1").await;
        assert_eq!(bundle.injected_settings.scanmode, Some(ScanMode::Mons));
    }
}
