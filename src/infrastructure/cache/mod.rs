// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Short-TTL key-value cache used for write dedup and shared device state.

pub mod memory;
pub mod redis;

use crate::domain::error::AppError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use memory::MemoryCache;
pub use self::redis::RedisCache;

#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError>;

    /// Atomic set with expiry (`SETEX`).
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), AppError>;

    async fn exists(&self, key: &str) -> Result<bool, AppError>;

    async fn delete(&self, key: &str) -> Result<(), AppError>;

    /// `SET key value NX PX ttl`. True when the key was created.
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, AppError>;

    /// Deletes `key` only while it still holds `value`.
    async fn delete_if_eq(&self, key: &str, value: &str) -> Result<bool, AppError>;

    /// Drops expired entries; backends that expire keys themselves do nothing.
    async fn purge_expired(&self) -> usize {
        0
    }
}

pub type SharedCache = Arc<dyn KeyValueCache>;

/// Redis when a url is configured, otherwise a process-local map.
pub async fn connect(redis_url: Option<&str>) -> Result<SharedCache, AppError> {
    match redis_url {
        Some(url) => {
            let cache = RedisCache::connect(url).await?;
            tracing::info!(target: "cache", "Using redis cache");
            Ok(Arc::new(cache))
        }
        None => {
            tracing::info!(target: "cache", "Using in-process cache");
            Ok(Arc::new(MemoryCache::new()))
        }
    }
}

/// Sweeps expired entries every `interval` until shutdown.
pub async fn run_purge(cache: SharedCache, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = cache.purge_expired().await;
                if removed > 0 {
                    tracing::debug!(target: "cache", removed, "Purged expired entries");
                }
            }
        }
    }
}
