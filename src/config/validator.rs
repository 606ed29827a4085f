/*
 * Copyright 2023 Michael Krolikowski
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Pure simulation of steady-state restart cadence, used to warn operators
//! about configurations that make quarantine unreachable (backoff growing
//! faster than the rate-limit window can fill).

use serde::Serialize;

use super::Configuration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigWarning {
    pub code: String,
    pub message: String,
}

fn backoff_delay(cfg: &Configuration, attempt: u32) -> f64 {
    if !cfg.backoff.enabled {
        return 0.0;
    }
    let raw = cfg.backoff.initial_seconds as f64 * cfg.backoff.multiplier.powi(attempt as i32);
    match cfg.backoff.max_seconds {
        Some(max) => raw.min(max as f64),
        None => raw,
    }
}

/// Simulates `max_restarts` consecutive failures of a single container and
/// checks whether the elapsed wall-clock time before the
/// (`max_restarts`+1)-th attempt would exceed the rate-limit window — if it
/// does, the container will retry forever rather than ever being
/// quarantined.
pub fn validate_restart_policy(cfg: &Configuration) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    let mut elapsed = 0.0_f64;
    for attempt in 0..cfg.restart.max_restarts {
        elapsed += backoff_delay(cfg, attempt);
        elapsed += cfg.restart.cooldown_seconds as f64;
        elapsed += cfg.monitor.interval_seconds as f64;
    }

    if elapsed > cfg.restart.max_restarts_window_seconds as f64 {
        warnings.push(ConfigWarning {
            code: "will_not_quarantine_within_window".to_string(),
            message: format!(
                "with this backoff/cooldown/tick cadence, {} restarts take ~{:.0}s, \
                 longer than the {}s rate-limit window — a permanently failing \
                 container will be retried indefinitely instead of quarantined",
                cfg.restart.max_restarts, elapsed, cfg.restart.max_restarts_window_seconds
            ),
        });
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;

    #[test]
    fn warns_when_backoff_outpaces_window() {
        let mut cfg = Configuration::default();
        cfg.restart.max_restarts = 5;
        cfg.restart.max_restarts_window_seconds = 600;
        cfg.backoff = BackoffConfig {
            enabled: true,
            initial_seconds: 10,
            multiplier: 2.0,
            max_seconds: None,
        };
        let warnings = validate_restart_policy(&cfg);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, "will_not_quarantine_within_window");
    }

    #[test]
    fn no_warning_for_tight_cadence() {
        let mut cfg = Configuration::default();
        cfg.restart.max_restarts = 3;
        cfg.restart.max_restarts_window_seconds = 600;
        cfg.restart.cooldown_seconds = 60;
        cfg.monitor.interval_seconds = 30;
        cfg.backoff = BackoffConfig {
            enabled: false,
            initial_seconds: 0,
            multiplier: 1.0,
            max_seconds: None,
        };
        let warnings = validate_restart_policy(&cfg);
        assert!(warnings.is_empty());
    }
}
