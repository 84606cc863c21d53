// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use crate::domain::constants;
use crate::domain::error::AppError;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use url::Url;

#[derive(Debug, Deserialize, Clone)]
pub struct GlobalSettings {
    // General
    #[serde(default = "default_false")]
    pub debug: bool,
    #[serde(default = "default_false")]
    pub log_json: bool,
    pub log_level: Option<String>,
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    #[serde(default = "default_language")]
    pub language: String,

    // Storage
    pub database_url: Option<String>,
    /// Shared C1 state and dedup cache; in-process when unset.
    pub redis_url: Option<String>,

    // Listeners
    #[serde(default = "default_ingress_bind")]
    pub ingress_bind: String,
    #[serde(default = "default_mapping_rpc_bind")]
    pub mapping_rpc_bind: String,
    /// Remote mapping service; the local mappings file is used when unset.
    pub mapping_rpc_url: Option<String>,
    #[serde(default = "default_status_port")]
    pub status_port: u16,
    #[serde(default = "default_mappings_path")]
    pub mappings_path: String,

    // Processor pool
    #[serde(default = "default_processor_workers")]
    pub processor_workers: usize,
    #[serde(default = "default_processor_queue_capacity")]
    pub processor_queue_capacity: usize,
    /// Items older than this are dropped unprocessed; 0 disables the check.
    #[serde(default)]
    pub processor_ignore_threshold_secs: u64,
    #[serde(default = "default_processor_max_requeue")]
    pub processor_max_requeue: u32,

    // Game data handling
    #[serde(default = "default_lure_duration_minutes")]
    pub lure_duration_minutes: i64,
    #[serde(default = "default_unknown_timeleft_secs")]
    pub default_unknown_timeleft_secs: i64,
    #[serde(default = "default_nearby_timeleft_minutes")]
    pub default_nearby_timeleft_minutes: i64,
    #[serde(default = "default_false")]
    pub scan_lured_mons: bool,
    #[serde(default = "default_false")]
    pub scan_nearby_mons: bool,
    #[serde(default = "default_false")]
    pub disable_nearby_cell: bool,
    #[serde(default = "default_max_valid_distance_m")]
    pub max_valid_distance_m: f64,
    #[serde(default = "default_min_level_iv")]
    pub min_level_iv: i32,

    // Device failure accounting
    #[serde(default = "default_restart_threshold")]
    pub restart_threshold: u32,
    #[serde(default = "default_reboot_threshold")]
    pub reboot_threshold: u32,
    #[serde(default = "default_injection_thresh_reboot")]
    pub injection_thresh_reboot: u32,
    #[serde(default = "default_wait_poll_interval_ms")]
    pub wait_poll_interval_ms: u64,

    // Stats
    #[serde(default = "default_stats_flush_secs")]
    pub stats_flush_secs: u64,
    #[serde(default = "default_stats_retention_days")]
    pub stats_retention_days: i64,
    /// Raw rows of shiny mons are removed after this many days; 0 keeps them.
    #[serde(default)]
    pub raw_delete_shiny_days: i64,

    // Mutual TLS for RPC clients
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub tls_ca_path: Option<String>,
}

fn default_false() -> bool {
    false
}
fn default_instance_name() -> String {
    "fleet".to_string()
}
fn default_language() -> String {
    "en".to_string()
}
fn default_ingress_bind() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_mapping_rpc_bind() -> String {
    "0.0.0.0:8010".to_string()
}
fn default_status_port() -> u16 {
    9100
}
fn default_mappings_path() -> String {
    "mappings.json".to_string()
}
fn default_processor_workers() -> usize {
    4
}
fn default_processor_queue_capacity() -> usize {
    10_000
}
fn default_processor_max_requeue() -> u32 {
    5
}
fn default_lure_duration_minutes() -> i64 {
    constants::DEFAULT_LURE_DURATION_MINUTES
}
fn default_unknown_timeleft_secs() -> i64 {
    180
}
fn default_nearby_timeleft_minutes() -> i64 {
    15
}
fn default_max_valid_distance_m() -> f64 {
    50.0
}
fn default_min_level_iv() -> i32 {
    constants::MIN_LEVEL_IV
}
fn default_restart_threshold() -> u32 {
    5
}
fn default_reboot_threshold() -> u32 {
    3
}
fn default_injection_thresh_reboot() -> u32 {
    constants::INJECTION_POLL_ROUNDS
}
fn default_wait_poll_interval_ms() -> u64 {
    50
}
fn default_stats_flush_secs() -> u64 {
    300
}
fn default_stats_retention_days() -> i64 {
    7
}

impl GlobalSettings {
    pub fn load_with_path(path: Option<&str>) -> Result<Self, AppError> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(selected_path) = path {
            builder = builder.add_source(File::from(Path::new(selected_path)).required(true));
        } else {
            builder = builder.add_source(File::with_name("config").required(false));
        }
        // Deterministic precedence: CLI (in main) > env/.env > config file.
        builder = builder.add_source(Environment::default());

        let settings: GlobalSettings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load() -> Result<Self, AppError> {
        Self::load_with_path(None)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.processor_workers == 0 {
            return Err(AppError::Config("processor_workers must be > 0".to_string()));
        }
        if self.processor_queue_capacity == 0 {
            return Err(AppError::Config(
                "processor_queue_capacity must be > 0".to_string(),
            ));
        }
        if self.restart_threshold == 0 || self.reboot_threshold == 0 {
            return Err(AppError::Config(
                "restart_threshold and reboot_threshold must be > 0".to_string(),
            ));
        }
        if self.stats_flush_secs == 0 {
            return Err(AppError::Config("stats_flush_secs must be > 0".to_string()));
        }
        let db = self.database_url();
        if !db.starts_with("sqlite:") {
            return Err(AppError::Config(format!(
                "database_url must be a sqlite url, got {db}"
            )));
        }
        for (name, value) in [
            ("redis_url", self.redis_url.as_deref()),
            ("mapping_rpc_url", self.mapping_rpc_url.as_deref()),
        ] {
            if let Some(raw) = value.map(str::trim).filter(|s| !s.is_empty()) {
                Url::parse(raw)
                    .map_err(|e| AppError::Config(format!("{name} is not a valid url: {e}")))?;
            }
        }
        for (name, value) in [
            ("ingress_bind", self.ingress_bind.as_str()),
            ("mapping_rpc_bind", self.mapping_rpc_bind.as_str()),
        ] {
            value
                .parse::<SocketAddr>()
                .map_err(|e| AppError::Config(format!("{name} {value} is invalid: {e}")))?;
        }
        let tls = [
            self.tls_cert_path.is_some(),
            self.tls_key_path.is_some(),
        ];
        if tls[0] != tls[1] {
            return Err(AppError::Config(
                "tls_cert_path and tls_key_path must be set together".to_string(),
            ));
        }
        Ok(())
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.database_url.clone())
            .unwrap_or_else(|| "sqlite://fleet.db".to_string())
    }

    pub fn redis_url_value(&self) -> Option<String> {
        self.redis_url
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn mapping_rpc_url_value(&self) -> Option<String> {
        self.mapping_rpc_url
            .as_ref()
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
    }

    /// Explicit level wins; otherwise `debug` selects between debug and info.
    pub fn log_level_value(&self) -> String {
        self.log_level
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| if self.debug { "debug" } else { "info" }.to_string())
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms.max(10))
    }

    pub fn stats_flush_interval(&self) -> Duration {
        Duration::from_secs(self.stats_flush_secs.max(1))
    }

    pub fn has_client_identity(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }
}
