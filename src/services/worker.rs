// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Per-device supervisor. Walks the device through its walker program and
//! runs the scan strategy of each step's area until the step exits.

use crate::common::time_utils::{current_unix, now_naive};
use crate::domain::constants::DEFAULT_EVENT_ID;
use crate::domain::error::AppError;
use crate::domain::types::WorkerMode;
use crate::services::mapping::{DeviceSettings, MappingManager, RouteManager, SharedRouteManager};
use crate::services::strategy::{ScanServices, ScanStrategy, ScanWorker, StepOutcome, StrategyContext};
use crate::services::walker::{WalkerContext, WalkerDecision, WalkerKind, WalkerStep};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug)]
pub struct SupervisorSettings {
    /// How often an idle step re-checks its window.
    pub idle_tick: Duration,
    /// Wait before re-entering a step whose worker stopped on a device error.
    pub restart_backoff: Duration,
    /// Wait when no step of the walker may run.
    pub no_step_wait: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            idle_tick: Duration::from_secs(30),
            restart_backoff: Duration::from_secs(60),
            no_step_wait: Duration::from_secs(60),
        }
    }
}

pub struct DeviceSupervisor {
    origin: String,
    mapping: Arc<MappingManager>,
    services: ScanServices,
    settings: SupervisorSettings,
    shutdown: CancellationToken,
}

fn is_fatal(err: &AppError) -> bool {
    matches!(
        err,
        AppError::Config(_) | AppError::Fatal(_) | AppError::Validation { .. } | AppError::Initialization(_)
    )
}

impl DeviceSupervisor {
    pub fn new(
        origin: &str,
        mapping: Arc<MappingManager>,
        services: ScanServices,
        settings: SupervisorSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            origin: origin.to_string(),
            mapping,
            services,
            settings,
            shutdown,
        }
    }

    /// `false` once shutdown interrupted the wait.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn current_event(&self) -> i64 {
        match self.services.submit.db().current_event().await {
            Ok((event, _)) => event,
            Err(e) => {
                tracing::warn!(target: "walker", origin = %self.origin, error = %e, "Event lookup failed");
                DEFAULT_EVENT_ID
            }
        }
    }

    /// Runs until shutdown. Only configuration errors end it early.
    pub async fn run(self) -> Result<(), AppError> {
        let origin = self.origin.clone();
        let Some(program) = self.mapping.walker_for(&origin).cloned() else {
            return Err(AppError::Config(format!("device {origin} has no walker")));
        };
        let device = self
            .mapping
            .device(&origin)
            .map(|d| d.settings.clone())
            .unwrap_or_default();
        tracing::info!(target: "walker", origin = %origin, walker = %program.name, steps = program.steps.len(), "Device supervisor started");

        let mut index = 0;
        while !self.shutdown.is_cancelled() {
            let event = self.current_event().await;
            let Some(selected) = program.select_step(index, event, now_naive()) else {
                tracing::warn!(target: "walker", origin = %origin, "No walker step can run right now");
                if !self.pause(self.settings.no_step_wait).await {
                    break;
                }
                continue;
            };
            let Some(step) = program.step(selected) else {
                break;
            };

            match self.run_step(step, &device).await {
                Ok(()) => index = selected + 1,
                Err(AppError::StopWorker { .. }) if self.shutdown.is_cancelled() => break,
                Err(e) if is_fatal(&e) => {
                    tracing::error!(target: "walker", origin = %origin, area = %step.area_id, error = %e, "Walker step failed");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        target: "walker",
                        origin = %origin,
                        area = %step.area_id,
                        error = %e,
                        backoff_secs = self.settings.restart_backoff.as_secs_f64(),
                        "Worker stopped, re-entering step after backoff"
                    );
                    index = selected;
                    if !self.pause(self.settings.restart_backoff).await {
                        break;
                    }
                }
            }
        }
        self.services.status.update(&origin, |s| s.idle = true);
        tracing::info!(target: "walker", origin = %origin, "Device supervisor stopped");
        Ok(())
    }

    /// Attaches the device to the step's area for as long as the step runs.
    async fn run_step(&self, step: &WalkerStep, device: &DeviceSettings) -> Result<(), AppError> {
        let Some(route) = self.mapping.route_manager(&step.area_id) else {
            return Err(AppError::Config(format!("walker step references unknown area {}", step.area_id)));
        };
        if !route.register_worker(&self.origin, step.max_walkers).await {
            tracing::info!(
                target: "walker",
                origin = %self.origin,
                area = %step.area_id,
                max_walkers = ?step.max_walkers,
                "Area has enough walkers, skipping step"
            );
            self.pause(self.settings.no_step_wait).await;
            return Ok(());
        }
        self.mapping.assign(&self.origin, &step.area_id);
        tracing::info!(target: "walker", origin = %self.origin, area = %step.area_id, kind = step.kind.as_str(), "Entering walker step");

        let result = self.work_area(step, route.clone(), device).await;

        route.unregister_worker(&self.origin).await;
        self.mapping.release(&self.origin);
        result
    }

    async fn work_area(
        &self,
        step: &WalkerStep,
        route: SharedRouteManager,
        device: &DeviceSettings,
    ) -> Result<(), AppError> {
        let started = current_unix();
        let strategy = ScanStrategy::for_area(route.mode(), route.get_settings());
        let strategy = match strategy {
            Some(strategy) if step.kind != WalkerKind::Idle => strategy,
            _ => return self.idle(step, route.as_ref(), started).await,
        };

        let ctx = StrategyContext::new(
            &self.origin,
            step.kind.as_str(),
            &self.services,
            route.clone(),
            device.clone(),
            self.shutdown.child_token(),
        );
        let mut worker = ScanWorker::new(strategy, ctx);
        let result = self.drive(&mut worker, step, route.as_ref(), started).await;
        worker.on_stop().await;
        result
    }

    async fn walker_context(&self, route: &dyn RouteManager, started: i64, route_exhausted: bool) -> WalkerContext {
        WalkerContext {
            step_started_at: started,
            now_unix: current_unix(),
            rounds: route.rounds(&self.origin).await,
            route_exhausted,
            current_event: self.current_event().await,
        }
    }

    async fn drive(
        &self,
        worker: &mut ScanWorker,
        step: &WalkerStep,
        route: &dyn RouteManager,
        started: i64,
    ) -> Result<(), AppError> {
        worker.pre_loop().await?;
        loop {
            let outcome = worker.scan_next().await?;
            let exhausted = outcome == StepOutcome::RouteExhausted;
            let ctx = self.walker_context(route, started, exhausted).await;
            if exhausted || step.should_continue(&ctx, now_naive()) != WalkerDecision::Continue {
                tracing::info!(target: "walker", origin = %self.origin, area = %step.area_id, exhausted, "Leaving walker step");
                return Ok(());
            }
        }
    }

    /// Keeps the client stopped while the idle window lasts.
    async fn idle(&self, step: &WalkerStep, route: &dyn RouteManager, started: i64) -> Result<(), AppError> {
        let communicator = &self.services.communicator;
        tracing::info!(target: "walker", origin = %self.origin, area = %step.area_id, "Idling device");
        self.services.status.update(&self.origin, |s| {
            s.idle = true;
            s.mode = Some(WorkerMode::Idle);
        });
        communicator.stop_app(&self.origin).await?;

        loop {
            if !self.pause(self.settings.idle_tick).await {
                return Err(AppError::stop_worker(&self.origin, "shutdown"));
            }
            let ctx = self.walker_context(route, started, false).await;
            let decision = match step.kind {
                WalkerKind::Idle => step.should_continue(&ctx, now_naive()),
                // Idle area under a regular step: wait out the step itself.
                _ => match step.should_continue(&ctx, now_naive()) {
                    WalkerDecision::Continue => WalkerDecision::Idle,
                    other => other,
                },
            };
            if decision != WalkerDecision::Idle {
                break;
            }
        }

        tracing::info!(target: "walker", origin = %self.origin, area = %step.area_id, "Idle window over, starting client");
        communicator.start_app(&self.origin).await?;
        self.services.status.update(&self.origin, |s| s.idle = false);
        Ok(())
    }
}
