// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

mod manager;
pub mod model;
pub mod route;
pub mod rpc;

pub use manager::MappingManager;
pub use model::{AreaConfig, AreaSettings, DeviceConfig, DeviceSettings, MappingsFile};
pub use route::{RouteManager, SharedRouteManager, StaticRouteManager};
pub use rpc::{ClientTls, MappingRpcClient, spawn_mapping_rpc};

use crate::domain::error::AppError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Mapping queries consumed by ingress and the strategies.
#[async_trait]
pub trait MappingService: Send + Sync {
    async fn get_all_loaded_origins(&self) -> Result<HashSet<String>, AppError>;
    async fn get_safe_items(&self, origin: &str) -> Result<Vec<i32>, AppError>;
    /// `None` when no credentials are configured.
    async fn get_auths(&self) -> Result<Option<HashMap<String, String>>, AppError>;
    async fn is_levelmode(&self, origin: &str) -> Result<bool, AppError>;
    async fn get_quest_layer_to_scan(&self, origin: &str) -> Result<Option<i32>, AppError>;
}

pub type SharedMappingService = Arc<dyn MappingService>;
