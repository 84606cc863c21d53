// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use super::{ScanStrategy, StrategyContext};
use crate::domain::error::AppError;
use crate::services::mitm_mapper::{InjectedSettings, InjectionBundle};

impl StrategyContext {
    /// Capture filter the device receives with its next ingress response.
    pub(crate) async fn injection_bundle(&self, strategy: ScanStrategy) -> Result<InjectionBundle, AppError> {
        let ids_iv = match strategy {
            ScanStrategy::WildMon => self.area.mon_ids_iv.iter().map(|id| *id as u64).collect(),
            ScanStrategy::MonIv => self.route.get_encounter_ids_left().await?,
            _ => Vec::new(),
        };

        let mut ids_encountered: Vec<u64> = self
            .mapper
            .get_encountered(&self.origin)
            .await
            .into_keys()
            .collect();
        ids_encountered.sort_unstable();

        let unquest_stops = if strategy.is_quest() {
            let mut stops: Vec<String> = self
                .route
                .routemanager_get_stops_with_quests()
                .await?
                .into_iter()
                .collect();
            stops.sort();
            stops
        } else {
            Vec::new()
        };

        Ok(InjectionBundle {
            ids_iv,
            injected_settings: InjectedSettings {
                scanmode: Some(strategy.scan_mode()),
            },
            ids_encountered,
            unquest_stops,
        })
    }

    pub(crate) async fn publish_injection(&self, strategy: ScanStrategy) -> Result<(), AppError> {
        let bundle = self.injection_bundle(strategy).await?;
        tracing::trace!(
            target: "strategy",
            origin = %self.origin,
            ids_iv = bundle.ids_iv.len(),
            encountered = bundle.ids_encountered.len(),
            unquest_stops = bundle.unquest_stops.len(),
            "Publishing injection settings"
        );
        self.mapper.set_injection_bundle(&self.origin, bundle).await;
        Ok(())
    }
}
