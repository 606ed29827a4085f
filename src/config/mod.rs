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

pub mod validator;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartMode {
    OnFailure,
    Health,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub interval_seconds: u64,
    pub label_key: String,
    pub label_value: String,
    pub include_all: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            interval_seconds: 30,
            label_key: "autoheal".to_string(),
            label_value: "true".to_string(),
            include_all: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartConfig {
    pub mode: RestartMode,
    pub respect_manual_stop: bool,
    pub cooldown_seconds: u64,
    pub max_restarts: u32,
    pub max_restarts_window_seconds: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        RestartConfig {
            mode: RestartMode::Both,
            respect_manual_stop: true,
            cooldown_seconds: 60,
            max_restarts: 3,
            max_restarts_window_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub enabled: bool,
    pub initial_seconds: u64,
    pub multiplier: f64,
    pub max_seconds: Option<u64>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            enabled: true,
            initial_seconds: 5,
            multiplier: 2.0,
            max_seconds: Some(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: LogLevel,
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        ObservabilityConfig {
            log_level: LogLevel::Info,
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiConfig {
    pub refresh_interval_seconds: u64,
    pub max_log_entries: usize,
}

impl Default for UiConfig {
    fn default() -> Self {
        UiConfig {
            refresh_interval_seconds: 5,
            max_log_entries: 500,
        }
    }
}

/// The whole-document-replaceable configuration. Selection sets and custom
/// probes live alongside this in `config.json` (see `store::model`) but are
/// not part of this struct, since they are mutated independently of a
/// config replace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub monitor: MonitorConfig,
    pub restart: RestartConfig,
    pub backoff: BackoffConfig,
    pub observability: ObservabilityConfig,
    pub ui: UiConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            monitor: MonitorConfig::default(),
            restart: RestartConfig::default(),
            backoff: BackoffConfig::default(),
            observability: ObservabilityConfig::default(),
            ui: UiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("monitor.interval_seconds must be greater than 0")]
    ZeroInterval,
    #[error("restart.max_restarts must be greater than 0")]
    ZeroMaxRestarts,
    #[error("backoff.multiplier must be >= 1.0")]
    InvalidMultiplier,
}

impl Configuration {
    pub fn validate_structural(&self) -> Result<(), ConfigValidationError> {
        if self.monitor.interval_seconds == 0 {
            return Err(ConfigValidationError::ZeroInterval);
        }
        if self.restart.max_restarts == 0 {
            return Err(ConfigValidationError::ZeroMaxRestarts);
        }
        if self.backoff.enabled && self.backoff.multiplier < 1.0 {
            return Err(ConfigValidationError::InvalidMultiplier);
        }
        Ok(())
    }
}
