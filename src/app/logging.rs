// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use std::str::FromStr;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const NOISY_MODULES: &str = "sqlx=warn,h2=info,hyper=info,hyper_util=info,reqwest=info,redis=info,tower_http=info";

/// Bare levels get the noisy-module overrides appended; directive strings
/// (containing ',' or '=') are used verbatim.
pub fn filter_spec(log_level: &str) -> String {
    let normalized = log_level.trim();
    if normalized.is_empty() {
        return format!("info,{NOISY_MODULES}");
    }
    if normalized.contains(',') || normalized.contains('=') {
        normalized.to_string()
    } else {
        format!("{normalized},{NOISY_MODULES}")
    }
}

/// Installs the global subscriber. Returns false when one was already set,
/// which happens when tests in the same binary initialize twice.
pub fn setup_logging(log_level: &str, json_format: bool) -> bool {
    let spec = filter_spec(log_level);
    let filter = EnvFilter::from_str(&spec).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = if json_format {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(false),
            )
            .try_init()
            .is_ok()
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };
    if !installed {
        return false;
    }

    let mut parts = spec.split(',').map(str::trim).filter(|p| !p.is_empty());
    let base = parts.next().unwrap_or("info");
    let overrides = parts.collect::<Vec<_>>().join(", ");
    tracing::info!(
        base,
        overrides = %overrides,
        format = if json_format { "json" } else { "compact" },
        "Logging initialized"
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_level_gets_module_overrides() {
        let spec = filter_spec("debug");
        assert!(spec.starts_with("debug,"));
        assert!(spec.contains("sqlx=warn"));
        assert_eq!(filter_spec("  "), format!("info,{NOISY_MODULES}"));
    }

    #[test]
    fn directive_strings_are_kept() {
        assert_eq!(filter_spec("warn,fleet_orchestrator=trace"), "warn,fleet_orchestrator=trace");
    }
}
