// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Restart/reboot accounting and account rotation.

use super::StrategyContext;
use crate::domain::constants::SPINNABLE_FAILCOUNT_RESTART;
use crate::domain::error::AppError;

impl StrategyContext {
    fn restart_threshold(&self) -> u32 {
        let threshold = self.device.restart_thresh.unwrap_or(self.settings.restart_threshold);
        if self.route.get_init() { threshold * 2 } else { threshold }
    }

    fn reboot_threshold(&self) -> u32 {
        let threshold = self.device.reboot_thresh.unwrap_or(self.settings.reboot_threshold);
        if self.route.get_init() { threshold * 2 } else { threshold }
    }

    fn publish_counters(&self) {
        let (restarts, reboots) = (self.state.restart_count, self.state.reboot_count);
        self.status.update(&self.origin, |s| {
            s.restart_count = restarts;
            s.reboot_count = reboots;
        });
    }

    pub(crate) fn reset_failure_counters(&mut self) {
        if self.state.restart_count == 0 && self.state.reboot_count == 0 {
            return;
        }
        self.state.restart_count = 0;
        self.state.reboot_count = 0;
        self.publish_counters();
    }

    /// Starts the client unless it is already in the foreground.
    pub(crate) async fn ensure_app_running(&mut self) -> Result<(), AppError> {
        match self.communicator.is_app_topmost(&self.origin).await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                tracing::warn!(target: "strategy", origin = %self.origin, "Client is not in the foreground, starting it");
            }
            Err(e) => {
                tracing::warn!(target: "strategy", origin = %self.origin, error = %e, "Foreground check failed, starting client");
            }
        }
        self.communicator.start_app(&self.origin).await?;
        self.state.restart_count += 1;
        self.publish_counters();
        Ok(())
    }

    /// Waits until the device reports its capture hook as active. Reboots
    /// and stops the worker once every round passed without it.
    pub(crate) async fn wait_for_injection(&mut self) -> Result<(), AppError> {
        let rounds = self
            .device
            .injection_thresh_reboot
            .unwrap_or(self.settings.injection_thresh_reboot)
            .max(1);
        for round in 1..=rounds {
            for _ in 0..self.settings.injection_poll_rounds {
                if self.mapper.get_injection_status(&self.origin).await {
                    tracing::debug!(target: "strategy", origin = %self.origin, "Injection confirmed");
                    return Ok(());
                }
                self.pause(self.settings.injection_poll_interval).await?;
            }
            tracing::info!(target: "strategy", origin = %self.origin, round, rounds, "Still waiting for injection");
        }
        tracing::error!(target: "strategy", origin = %self.origin, "Device never injected, rebooting");
        Err(self.reboot_and_stop("injection timeout").await)
    }

    async fn reboot_and_stop(&mut self, reason: &str) -> AppError {
        self.mapper.set_injection_status(&self.origin, false).await;
        let sent = if self.device.reboot {
            self.communicator.reboot(&self.origin).await
        } else {
            self.communicator.stop_app(&self.origin).await
        };
        if let Err(e) = sent {
            tracing::warn!(target: "strategy", origin = %self.origin, error = %e, "Reboot command failed");
        }
        self.state.restart_count = 0;
        self.state.reboot_count = 0;
        self.publish_counters();
        AppError::stop_worker(&self.origin, reason)
    }

    /// A wait for map data ran out.
    pub(crate) async fn handle_proto_timeout(&mut self) -> Result<(), AppError> {
        self.state.restart_count += 1;
        let threshold = self.restart_threshold();
        tracing::warn!(
            target: "strategy",
            origin = %self.origin,
            restart_count = self.state.restart_count,
            threshold,
            "Timeout waiting for data"
        );
        self.publish_counters();
        if self.state.restart_count > threshold {
            self.state.restart_count = 0;
            self.escalate_restart().await?;
        }
        Ok(())
    }

    /// Restarts the client, or reboots the device once restarts stopped helping.
    pub(crate) async fn escalate_restart(&mut self) -> Result<(), AppError> {
        self.state.reboot_count += 1;
        let threshold = self.reboot_threshold();
        self.publish_counters();
        if self.state.reboot_count > threshold && self.device.reboot {
            tracing::error!(
                target: "strategy",
                origin = %self.origin,
                reboot_count = self.state.reboot_count,
                "Restarting did not help, rebooting device"
            );
            return Err(self.reboot_and_stop("too many restarts").await);
        }

        tracing::warn!(target: "strategy", origin = %self.origin, reboot_count = self.state.reboot_count, "Restarting client");
        self.communicator.stop_app(&self.origin).await?;
        self.mapper.set_injection_status(&self.origin, false).await;
        self.communicator.start_app(&self.origin).await?;
        self.wait_for_injection().await
    }

    /// No usable stop data at a quest location.
    pub(crate) async fn spinnable_data_failure(&mut self) -> Result<(), AppError> {
        self.state.spinnable_data_failcount += 1;
        if self.state.spinnable_data_failcount < SPINNABLE_FAILCOUNT_RESTART {
            return Ok(());
        }
        tracing::warn!(target: "strategy", origin = %self.origin, "Repeatedly found no stop data, restarting client");
        self.state.spinnable_data_failcount = 0;
        self.escalate_restart().await
    }

    fn rotation_enabled(&self) -> bool {
        self.device.screendetection && self.device.account_rotation && self.device.accounts > 1
    }

    /// Switches accounts instead of sleeping out a long cooldown.
    pub(crate) async fn rotate_instead_of_sleeping(&mut self, delay: f64) -> Result<f64, AppError> {
        let wait = self.device.rotation_waittime;
        if !self.rotation_enabled() || self.area.level_mode || wait <= 0.0 || delay < wait {
            return Ok(delay);
        }
        tracing::info!(target: "strategy", origin = %self.origin, delay, "Rotating account instead of sleeping");
        self.switch_account().await?;
        Ok(0.0)
    }

    pub(crate) async fn maybe_rotate_leveled_account(&mut self) -> Result<(), AppError> {
        if !self.rotation_enabled() || !self.device.rotate_on_lvl_30 || !self.area.level_mode {
            return Ok(());
        }
        let level = self.mapper.get_level(&self.origin).await;
        if level < self.settings.min_level_iv {
            return Ok(());
        }
        tracing::info!(target: "strategy", origin = %self.origin, level, "Account reached target level, rotating");
        self.switch_account().await
    }

    async fn switch_account(&mut self) -> Result<(), AppError> {
        self.communicator.switch_account(&self.origin).await?;
        self.mapper.set_injection_status(&self.origin, false).await;
        self.mapper.set_level(&self.origin, 0).await;
        self.state.last_action_time = None;
        self.ensure_app_running().await?;
        self.wait_for_injection().await
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{area, harness};
    use crate::domain::error::AppError;
    use crate::domain::geo::Location;
    use crate::domain::types::WorkerMode;
    use crate::services::mitm_mapper::{InProcessMitmMapper, MitmMapper};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    /// Keeps reporting an active hook, like a healthy device would.
    fn keep_injected(mapper: Arc<InProcessMitmMapper>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                mapper.set_injection_status("dev1", true).await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    #[tokio::test]
    async fn timeouts_restart_then_reboot() {
        let mut h = harness(area(WorkerMode::MonMitm, vec![Location::new(1.0, 1.0)])).await;
        h.ctx.device.restart_thresh = Some(1);
        h.ctx.device.reboot_thresh = Some(1);
        let injector = keep_injected(h.mapper.clone());

        h.ctx.handle_proto_timeout().await.expect("first");
        assert_eq!(h.ctx.state.restart_count, 1);
        h.ctx.handle_proto_timeout().await.expect("restart");
        assert_eq!((h.ctx.state.restart_count, h.ctx.state.reboot_count), (0, 1));
        assert_eq!(h.device.log(), vec!["stop_app", "start_app"]);

        h.ctx.handle_proto_timeout().await.expect("third");
        let err = h.ctx.handle_proto_timeout().await;
        injector.abort();
        assert!(matches!(err, Err(AppError::StopWorker { reason, .. }) if reason == "too many restarts"));
        assert_eq!(h.device.log().last().map(String::as_str), Some("reboot"));
    }

    #[tokio::test]
    async fn init_areas_double_the_thresholds() {
        let mut h = harness(area(WorkerMode::InitMitm, vec![Location::new(1.0, 1.0)])).await;
        h.ctx.device.restart_thresh = Some(1);
        for _ in 0..2 {
            h.ctx.handle_proto_timeout().await.expect("timeout");
        }
        assert_eq!(h.ctx.state.restart_count, 2);
        assert!(h.device.log().is_empty());
    }

    #[tokio::test]
    async fn missing_injection_reboots_and_stops() {
        let mut h = harness(area(WorkerMode::MonMitm, Vec::new())).await;
        h.ctx.device.injection_thresh_reboot = Some(2);
        let err = h.ctx.wait_for_injection().await;
        assert!(matches!(err, Err(AppError::StopWorker { reason, .. }) if reason == "injection timeout"));
        assert_eq!(h.device.log(), vec!["reboot"]);
    }

    #[tokio::test]
    async fn missing_stop_data_restarts_on_the_third_strike() {
        let mut h = harness(area(WorkerMode::Pokestops, Vec::new())).await;
        let injector = keep_injected(h.mapper.clone());
        h.ctx.spinnable_data_failure().await.expect("first");
        h.ctx.spinnable_data_failure().await.expect("second");
        assert!(h.device.log().is_empty());
        h.ctx.spinnable_data_failure().await.expect("third");
        injector.abort();
        assert_eq!(h.ctx.state.spinnable_data_failcount, 0);
        assert_eq!(h.device.log(), vec!["stop_app", "start_app"]);
    }

    #[tokio::test]
    async fn long_cooldowns_rotate_accounts() {
        let mut h = harness(area(WorkerMode::Pokestops, Vec::new())).await;
        h.ctx.device.screendetection = true;
        h.ctx.device.account_rotation = true;
        h.ctx.device.accounts = 2;
        h.ctx.device.rotation_waittime = 60.0;
        h.mapper.set_level("dev1", 31).await;
        let injector = keep_injected(h.mapper.clone());

        assert_eq!(h.ctx.rotate_instead_of_sleeping(30.0).await.expect("short"), 30.0);
        assert_eq!(h.ctx.rotate_instead_of_sleeping(90.0).await.expect("long"), 0.0);
        injector.abort();
        assert_eq!(h.device.log(), vec!["switch_account"]);
        assert_eq!(h.mapper.get_level("dev1").await, 0);
    }
}
