// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Per-area route managers. Planning is out of scope: the bundled manager
//! cycles the configured coordinates (or, for quest areas without any, the
//! stops of the fence still missing a quest).

use super::model::{AreaConfig, AreaSettings};
use crate::common::time_utils::current_unix;
use crate::domain::error::AppError;
use crate::domain::geo::{Geofence, Location};
use crate::domain::types::{PositionType, WorkerMode};
use crate::infrastructure::data::db::Database;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

#[async_trait]
pub trait RouteManager: Send + Sync {
    fn area_id(&self) -> &str;
    fn mode(&self) -> WorkerMode;
    fn get_settings(&self) -> &AreaSettings;
    fn geofence(&self) -> &Geofence;

    fn get_max_radius(&self) -> f64 {
        self.get_settings().max_radius
    }

    fn get_init(&self) -> bool {
        self.get_settings().init || self.mode() == WorkerMode::InitMitm
    }

    fn is_levelmode(&self) -> bool {
        self.get_settings().level_mode
    }

    /// False once the area has been unloaded.
    fn routemanager_present(&self) -> bool;

    /// `None` when the route is exhausted for this origin.
    async fn next_location(&self, origin: &str) -> Result<Option<Location>, AppError>;
    async fn add_coords_to_be_removed(&self, origin: &str, location: Location);
    async fn redo_stop_at_end(&self, origin: &str, location: Location);
    async fn get_position_type(&self, origin: &str) -> PositionType;
    async fn set_worker_sleeping(&self, origin: &str, seconds: u64);
    async fn is_worker_sleeping(&self, origin: &str) -> bool;
    async fn rounds(&self, origin: &str) -> u32;

    /// Attach a device. `false` when `max_walkers` devices are already on it.
    async fn register_worker(&self, origin: &str, max_walkers: Option<usize>) -> bool;
    async fn unregister_worker(&self, origin: &str);
    async fn registered_workers(&self) -> usize;

    async fn routemanager_get_stops_with_quests(&self) -> Result<HashSet<String>, AppError>;
    async fn get_encounter_ids_left(&self) -> Result<Vec<u64>, AppError>;
}

pub type SharedRouteManager = Arc<dyn RouteManager>;

fn coord_key(loc: &Location) -> (i64, i64) {
    ((loc.lat * 1e6).round() as i64, (loc.lng * 1e6).round() as i64)
}

#[derive(Debug, Default)]
struct OriginRoute {
    position: usize,
    rounds: u32,
    prio: VecDeque<Location>,
    position_type: Option<PositionType>,
    sleeping_until: i64,
    started: bool,
}

#[derive(Debug, Default)]
struct RouteState {
    route: Vec<Location>,
    loaded: bool,
    redo: VecDeque<Location>,
    removed: HashSet<(i64, i64)>,
    origins: HashMap<String, OriginRoute>,
    workers: HashSet<String>,
}

impl RouteState {
    /// Prio coordinates first, then the route, then deferred locations.
    fn advance(&mut self, origin: &str, prio: &[Location]) -> Option<Location> {
        let entry = self.origins.entry(origin.to_string()).or_default();
        if !entry.started {
            entry.started = true;
            entry.prio = prio.iter().copied().collect();
        }
        if let Some(loc) = entry.prio.pop_front() {
            entry.position_type = Some(PositionType::Prio);
            return Some(loc);
        }
        entry.position_type = Some(PositionType::Normal);
        while entry.position < self.route.len() {
            let loc = self.route[entry.position];
            entry.position += 1;
            if !self.removed.contains(&coord_key(&loc)) {
                return Some(loc);
            }
        }
        self.redo.pop_front()
    }

    fn finish_round(&mut self, origin: &str, prio: &[Location]) -> u32 {
        let entry = self.origins.entry(origin.to_string()).or_default();
        entry.rounds += 1;
        entry.position = 0;
        entry.prio = prio.iter().copied().collect();
        entry.rounds
    }
}

pub struct StaticRouteManager {
    area: AreaConfig,
    db: Option<Database>,
    present: AtomicBool,
    state: Mutex<RouteState>,
}

impl StaticRouteManager {
    pub fn new(area: AreaConfig, db: Option<Database>) -> Self {
        Self {
            area,
            db,
            present: AtomicBool::new(true),
            state: Mutex::new(RouteState::default()),
        }
    }

    pub fn area(&self) -> &AreaConfig {
        &self.area
    }

    pub fn unload(&self) {
        self.present.store(false, Ordering::Release);
    }

    fn builds_from_stops(&self) -> bool {
        self.area.mode == WorkerMode::Pokestops && self.area.coords.is_empty()
    }

    /// Coordinates of one round. Quest areas without configured coordinates
    /// visit the stops of the fence that do not hold a quest yet.
    async fn load_route(&self) -> Result<Vec<Location>, AppError> {
        if !self.builds_from_stops() {
            return Ok(self.area.coords.clone());
        }
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };
        let done = db
            .stops_with_quests(&self.area.geofence, self.area.settings.layer)
            .await?;
        let stops = db.stops_in_fence(&self.area.geofence).await?;
        Ok(stops
            .into_iter()
            .filter(|s| !done.contains(&s.pokestop_id))
            .map(|s| s.location())
            .collect())
    }

    async fn ensure_loaded(&self) -> Result<(), AppError> {
        if self.state.lock().await.loaded {
            return Ok(());
        }
        let route = self.load_route().await?;
        let mut state = self.state.lock().await;
        if !state.loaded {
            state.route = route;
            state.loaded = true;
        }
        Ok(())
    }

    fn round_exhausts(&self, rounds: u32) -> bool {
        self.get_init() && rounds >= self.area.settings.init_mode_rounds.max(1)
    }
}

#[async_trait]
impl RouteManager for StaticRouteManager {
    fn area_id(&self) -> &str {
        &self.area.id
    }

    fn mode(&self) -> WorkerMode {
        self.area.mode
    }

    fn get_settings(&self) -> &AreaSettings {
        &self.area.settings
    }

    fn geofence(&self) -> &Geofence {
        &self.area.geofence
    }

    fn routemanager_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    async fn next_location(&self, origin: &str) -> Result<Option<Location>, AppError> {
        self.ensure_loaded().await?;
        let prio = &self.area.prio_coords;
        let mut state = self.state.lock().await;
        if let Some(loc) = state.advance(origin, prio) {
            return Ok(Some(loc));
        }

        let rounds = state.finish_round(origin, prio);
        tracing::info!(
            target: "mapping",
            origin,
            area = %self.area.id,
            rounds,
            "Route round completed"
        );
        if self.round_exhausts(rounds) {
            return Ok(None);
        }
        if self.builds_from_stops() {
            drop(state);
            let route = self.load_route().await?;
            state = self.state.lock().await;
            state.route = route;
        }
        Ok(state.advance(origin, prio))
    }
    async fn add_coords_to_be_removed(&self, origin: &str, location: Location) {
        tracing::info!(
            target: "mapping",
            origin,
            area = %self.area.id,
            lat = location.lat,
            lng = location.lng,
            "Removing location from route"
        );
        let mut state = self.state.lock().await;
        state.removed.insert(coord_key(&location));
        state.redo.retain(|l| coord_key(l) != coord_key(&location));
    }

    async fn redo_stop_at_end(&self, origin: &str, location: Location) {
        tracing::debug!(target: "mapping", origin, area = %self.area.id, "Location queued for redo");
        let mut state = self.state.lock().await;
        if !state.removed.contains(&coord_key(&location)) {
            state.redo.push_back(location);
        }
    }

    async fn get_position_type(&self, origin: &str) -> PositionType {
        let state = self.state.lock().await;
        state
            .origins
            .get(origin)
            .and_then(|o| o.position_type)
            .unwrap_or(PositionType::Normal)
    }

    async fn set_worker_sleeping(&self, origin: &str, seconds: u64) {
        let mut state = self.state.lock().await;
        let entry = state.origins.entry(origin.to_string()).or_default();
        entry.sleeping_until = current_unix() + seconds as i64;
    }

    async fn is_worker_sleeping(&self, origin: &str) -> bool {
        let state = self.state.lock().await;
        state
            .origins
            .get(origin)
            .is_some_and(|o| o.sleeping_until > current_unix())
    }

    async fn rounds(&self, origin: &str) -> u32 {
        let state = self.state.lock().await;
        state.origins.get(origin).map(|o| o.rounds).unwrap_or(0)
    }

    async fn register_worker(&self, origin: &str, max_walkers: Option<usize>) -> bool {
        let mut state = self.state.lock().await;
        if state.workers.contains(origin) {
            return true;
        }
        if max_walkers.is_some_and(|max| state.workers.len() >= max) {
            tracing::info!(
                target: "mapping",
                origin,
                area = %self.area.id,
                workers = state.workers.len(),
                "Area is full"
            );
            return false;
        }
        state.workers.insert(origin.to_string());
        true
    }

    async fn unregister_worker(&self, origin: &str) {
        let mut state = self.state.lock().await;
        state.workers.remove(origin);
        state.origins.remove(origin);
    }

    async fn registered_workers(&self) -> usize {
        self.state.lock().await.workers.len()
    }

    async fn routemanager_get_stops_with_quests(&self) -> Result<HashSet<String>, AppError> {
        match &self.db {
            Some(db) => {
                db.stops_with_quests(&self.area.geofence, self.area.settings.layer)
                    .await
            }
            None => Ok(HashSet::new()),
        }
    }

    async fn get_encounter_ids_left(&self) -> Result<Vec<u64>, AppError> {
        match &self.db {
            Some(db) if !self.area.settings.mon_ids_iv.is_empty() => {
                db.encounter_ids_left(&self.area.geofence, &self.area.settings.mon_ids_iv)
                    .await
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::time_utils::now_naive;
    use crate::domain::types::QuestLayer;

    fn area(mode: WorkerMode, coords: Vec<Location>) -> AreaConfig {
        AreaConfig {
            id: "north".to_string(),
            name: String::new(),
            mode,
            geofence: Geofence::default(),
            coords,
            prio_coords: Vec::new(),
            settings: AreaSettings::default(),
        }
    }

    #[tokio::test]
    async fn prio_route_and_redo_are_served_in_order() {
        let mut cfg = area(
            WorkerMode::MonMitm,
            vec![Location::new(1.0, 1.0), Location::new(2.0, 2.0)],
        );
        cfg.prio_coords = vec![Location::new(9.0, 9.0)];
        let rm = StaticRouteManager::new(cfg, None);

        assert_eq!(rm.next_location("dev1").await.unwrap(), Some(Location::new(9.0, 9.0)));
        assert_eq!(rm.get_position_type("dev1").await, PositionType::Prio);
        assert_eq!(rm.next_location("dev1").await.unwrap(), Some(Location::new(1.0, 1.0)));
        assert_eq!(rm.get_position_type("dev1").await, PositionType::Normal);
        rm.redo_stop_at_end("dev1", Location::new(1.0, 1.0)).await;
        assert_eq!(rm.next_location("dev1").await.unwrap(), Some(Location::new(2.0, 2.0)));
        assert_eq!(rm.next_location("dev1").await.unwrap(), Some(Location::new(1.0, 1.0)));
        assert_eq!(rm.rounds("dev1").await, 0);

        // Round two starts with the prio coordinates again.
        assert_eq!(rm.next_location("dev1").await.unwrap(), Some(Location::new(9.0, 9.0)));
        assert_eq!(rm.rounds("dev1").await, 1);
    }

    #[tokio::test]
    async fn removed_coords_are_skipped_and_init_exhausts() {
        let mut cfg = area(
            WorkerMode::InitMitm,
            vec![Location::new(1.0, 1.0), Location::new(2.0, 2.0)],
        );
        cfg.settings.init_mode_rounds = 1;
        let rm = StaticRouteManager::new(cfg, None);
        rm.add_coords_to_be_removed("dev1", Location::new(1.0, 1.0)).await;

        assert_eq!(rm.next_location("dev1").await.unwrap(), Some(Location::new(2.0, 2.0)));
        assert_eq!(rm.next_location("dev1").await.unwrap(), None);
        assert!(rm.get_init());
    }

    #[tokio::test]
    async fn walker_limit_is_enforced() {
        let rm = StaticRouteManager::new(area(WorkerMode::MonMitm, Vec::new()), None);
        assert!(rm.register_worker("dev1", Some(1)).await);
        assert!(rm.register_worker("dev1", Some(1)).await);
        assert!(!rm.register_worker("dev2", Some(1)).await);
        rm.unregister_worker("dev1").await;
        assert!(rm.register_worker("dev2", Some(1)).await);
        assert_eq!(rm.registered_workers().await, 1);

        rm.set_worker_sleeping("dev2", 60).await;
        assert!(rm.is_worker_sleeping("dev2").await);
        assert!(!rm.is_worker_sleeping("dev1").await);
    }

    #[tokio::test]
    async fn quest_route_skips_stops_with_quests() {
        let db = Database::new("sqlite::memory:").await.expect("db");
        for (id, lat) in [("s1", 40.0), ("s2", 40.001)] {
            sqlx::query(
                "INSERT INTO pokestop (pokestop_id, latitude, longitude, last_modified, last_updated) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(lat)
            .bind(-105.0)
            .bind(now_naive())
            .bind(now_naive())
            .execute(db.pool())
            .await
            .expect("insert stop");
        }
        sqlx::query(
            "INSERT INTO trs_quest (GUID, layer, quest_type, quest_timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind("s1")
        .bind(QuestLayer::Ar.as_i32())
        .bind(7)
        .bind(current_unix())
        .execute(db.pool())
        .await
        .expect("insert quest");

        let rm = StaticRouteManager::new(area(WorkerMode::Pokestops, Vec::new()), Some(db));
        assert_eq!(rm.next_location("dev1").await.unwrap(), Some(Location::new(40.001, -105.0)));
        let done = rm.routemanager_get_stops_with_quests().await.unwrap();
        assert!(done.contains("s1"));
        assert!(rm.get_encounter_ids_left().await.unwrap().is_empty());
    }
}
