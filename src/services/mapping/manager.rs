// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use super::model::{AreaConfig, DEFAULT_SAFE_ITEMS, DeviceConfig, MappingsFile};
use super::route::{SharedRouteManager, StaticRouteManager};
use super::MappingService;
use crate::domain::error::AppError;
use crate::domain::types::WorkerMode;
use crate::infrastructure::data::db::Database;
use crate::services::walker::WalkerProgram;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Local mapping: devices, walkers and areas from the mappings file, one
/// route manager per area, and the area each device currently works.
pub struct MappingManager {
    file: MappingsFile,
    routes: HashMap<String, Arc<StaticRouteManager>>,
    assignments: DashMap<String, String>,
}

impl MappingManager {
    pub fn new(file: MappingsFile, db: Option<Database>) -> Self {
        let routes = file
            .areas
            .iter()
            .map(|area| {
                (
                    area.id.clone(),
                    Arc::new(StaticRouteManager::new(area.clone(), db.clone())),
                )
            })
            .collect();
        tracing::info!(
            target: "mapping",
            areas = file.areas.len(),
            walkers = file.walkers.len(),
            devices = file.devices.len(),
            "Mappings loaded"
        );
        Self {
            file,
            routes,
            assignments: DashMap::new(),
        }
    }

    pub async fn load(path: impl AsRef<Path>, db: Option<Database>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::Config(format!("cannot read mappings {}: {e}", path.display()))
        })?;
        Ok(Self::new(MappingsFile::parse(&raw)?, db))
    }

    pub fn devices(&self) -> &[DeviceConfig] {
        &self.file.devices
    }

    pub fn device(&self, origin: &str) -> Option<&DeviceConfig> {
        self.file.devices.iter().find(|d| d.origin == origin)
    }

    pub fn walker_for(&self, origin: &str) -> Option<&WalkerProgram> {
        let device = self.device(origin)?;
        self.file.walkers.iter().find(|w| w.name == device.walker)
    }

    pub fn area(&self, area_id: &str) -> Option<&AreaConfig> {
        self.routes.get(area_id).map(|rm| rm.area())
    }

    pub fn route_manager(&self, area_id: &str) -> Option<SharedRouteManager> {
        self.routes
            .get(area_id)
            .map(|rm| rm.clone() as SharedRouteManager)
    }

    pub fn assign(&self, origin: &str, area_id: &str) {
        self.assignments
            .insert(origin.to_string(), area_id.to_string());
    }

    pub fn release(&self, origin: &str) {
        self.assignments.remove(origin);
    }

    pub fn assigned_area(&self, origin: &str) -> Option<&AreaConfig> {
        let area_id = self.assignments.get(origin)?.value().clone();
        self.area(&area_id)
    }

    /// Stops accepting devices on every area.
    pub fn unload(&self) {
        for rm in self.routes.values() {
            rm.unload();
        }
    }
}

#[async_trait]
impl MappingService for MappingManager {
    async fn get_all_loaded_origins(&self) -> Result<HashSet<String>, AppError> {
        Ok(self.file.devices.iter().map(|d| d.origin.clone()).collect())
    }

    async fn get_safe_items(&self, origin: &str) -> Result<Vec<i32>, AppError> {
        Ok(self
            .device(origin)
            .map(|d| d.settings.enhanced_mode_quest_safe_items.clone())
            .filter(|items| !items.is_empty())
            .unwrap_or_else(|| DEFAULT_SAFE_ITEMS.to_vec()))
    }

    async fn get_auths(&self) -> Result<Option<HashMap<String, String>>, AppError> {
        if self.file.auths.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.file.auths.clone()))
    }

    async fn is_levelmode(&self, origin: &str) -> Result<bool, AppError> {
        Ok(self
            .assigned_area(origin)
            .is_some_and(|a| a.settings.level_mode))
    }

    async fn get_quest_layer_to_scan(&self, origin: &str) -> Result<Option<i32>, AppError> {
        Ok(self
            .assigned_area(origin)
            .filter(|a| a.mode == WorkerMode::Pokestops)
            .map(|a| a.settings.layer.as_i32()))
    }
}
