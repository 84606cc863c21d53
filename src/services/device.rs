// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Control channel towards the devices. Commands are queued per origin and
//! collected by the device on its next poll of the control endpoint.

use crate::common::time_utils::current_unix;
use crate::domain::error::AppError;
use crate::domain::geo::Location;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// A device that has not polled for this long counts as disconnected.
pub const DEVICE_STALE_SECS: i64 = 60;
/// Upper bound on queued commands per device; the oldest are dropped.
pub const MAILBOX_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DeviceCommand {
    SetLocation { location: Location, altitude: f64 },
    WalkFromTo { from: Location, to: Location, speed_m_s: f64 },
    Click { x: i32, y: i32 },
    Swipe { x1: i32, y1: i32, x2: i32, y2: i32 },
    Screenshot,
    InstallApk { path: String },
    StartApp,
    StopApp,
    Reboot,
    SwitchAccount,
}

#[async_trait]
pub trait DeviceCommunicator: Send + Sync {
    async fn set_location(&self, origin: &str, location: Location, altitude: f64) -> Result<(), AppError>;
    /// Resolves once the device should have arrived.
    async fn walk_from_to(
        &self,
        origin: &str,
        from: Location,
        to: Location,
        speed_m_s: f64,
    ) -> Result<(), AppError>;
    async fn click(&self, origin: &str, x: i32, y: i32) -> Result<(), AppError>;
    async fn swipe(&self, origin: &str, x1: i32, y1: i32, x2: i32, y2: i32) -> Result<(), AppError>;
    async fn screenshot(&self, origin: &str) -> Result<(), AppError>;
    async fn is_app_topmost(&self, origin: &str) -> Result<bool, AppError>;
    async fn install_apk(&self, origin: &str, path: &str) -> Result<(), AppError>;
    async fn start_app(&self, origin: &str) -> Result<(), AppError>;
    async fn stop_app(&self, origin: &str) -> Result<(), AppError>;
    async fn reboot(&self, origin: &str) -> Result<(), AppError>;
    async fn switch_account(&self, origin: &str) -> Result<(), AppError>;
}

pub type SharedCommunicator = Arc<dyn DeviceCommunicator>;

/// What a device reports when it polls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct DeviceReport {
    #[serde(default)]
    pub topmost: Option<bool>,
}

#[derive(Debug, Default)]
struct DeviceLink {
    commands: VecDeque<DeviceCommand>,
    last_seen: i64,
    topmost: bool,
}

#[derive(Default)]
pub struct CommandMailbox {
    links: DashMap<String, DeviceLink>,
}

pub type SharedMailbox = Arc<CommandMailbox>;

impl CommandMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(&self, origin: &str, command: DeviceCommand) {
        let mut link = self.links.entry(origin.to_string()).or_default();
        if link.commands.len() >= MAILBOX_CAPACITY {
            link.commands.pop_front();
            tracing::warn!(target: "device", origin, "Command mailbox full, dropping oldest command");
        }
        tracing::debug!(target: "device", origin, ?command, "Queued device command");
        link.commands.push_back(command);
    }

    /// Hands every pending command to the polling device.
    pub fn drain(&self, origin: &str, report: DeviceReport) -> Vec<DeviceCommand> {
        let mut link = self.links.entry(origin.to_string()).or_default();
        link.last_seen = current_unix();
        if let Some(topmost) = report.topmost {
            link.topmost = topmost;
        }
        link.commands.drain(..).collect()
    }

    pub fn pending(&self, origin: &str) -> usize {
        self.links.get(origin).map(|l| l.commands.len()).unwrap_or(0)
    }

    pub fn last_seen(&self, origin: &str) -> Option<i64> {
        self.links
            .get(origin)
            .map(|l| l.last_seen)
            .filter(|ts| *ts > 0)
    }

    pub fn is_connected(&self, origin: &str) -> bool {
        self.last_seen(origin)
            .is_some_and(|ts| current_unix() - ts <= DEVICE_STALE_SECS)
    }
}

#[async_trait]
impl DeviceCommunicator for CommandMailbox {
    async fn set_location(&self, origin: &str, location: Location, altitude: f64) -> Result<(), AppError> {
        self.enqueue(origin, DeviceCommand::SetLocation { location, altitude });
        Ok(())
    }

    async fn walk_from_to(
        &self,
        origin: &str,
        from: Location,
        to: Location,
        speed_m_s: f64,
    ) -> Result<(), AppError> {
        if speed_m_s <= 0.0 {
            return Err(AppError::device(origin, "walk speed must be positive"));
        }
        self.enqueue(origin, DeviceCommand::WalkFromTo { from, to, speed_m_s });
        let secs = from.distance_to(&to) / speed_m_s;
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        Ok(())
    }

    async fn click(&self, origin: &str, x: i32, y: i32) -> Result<(), AppError> {
        self.enqueue(origin, DeviceCommand::Click { x, y });
        Ok(())
    }

    async fn swipe(&self, origin: &str, x1: i32, y1: i32, x2: i32, y2: i32) -> Result<(), AppError> {
        self.enqueue(origin, DeviceCommand::Swipe { x1, y1, x2, y2 });
        Ok(())
    }

    async fn screenshot(&self, origin: &str) -> Result<(), AppError> {
        self.enqueue(origin, DeviceCommand::Screenshot);
        Ok(())
    }

    async fn is_app_topmost(&self, origin: &str) -> Result<bool, AppError> {
        if !self.is_connected(origin) {
            return Err(AppError::device(origin, "device is not polling"));
        }
        Ok(self.links.get(origin).is_some_and(|l| l.topmost))
    }

    async fn install_apk(&self, origin: &str, path: &str) -> Result<(), AppError> {
        self.enqueue(origin, DeviceCommand::InstallApk { path: path.to_string() });
        Ok(())
    }

    async fn start_app(&self, origin: &str) -> Result<(), AppError> {
        self.enqueue(origin, DeviceCommand::StartApp);
        Ok(())
    }

    async fn stop_app(&self, origin: &str) -> Result<(), AppError> {
        if let Some(mut link) = self.links.get_mut(origin) {
            link.topmost = false;
        }
        self.enqueue(origin, DeviceCommand::StopApp);
        Ok(())
    }

    async fn reboot(&self, origin: &str) -> Result<(), AppError> {
        if let Some(mut link) = self.links.get_mut(origin) {
            link.topmost = false;
        }
        self.enqueue(origin, DeviceCommand::Reboot);
        Ok(())
    }

    async fn switch_account(&self, origin: &str) -> Result<(), AppError> {
        self.enqueue(origin, DeviceCommand::SwitchAccount);
        Ok(())
    }
}
