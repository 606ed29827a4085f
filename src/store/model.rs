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

//! Shapes of the JSON documents persisted under the data directory, plus
//! the in-memory records they round-trip through.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Configuration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Http,
    Tcp,
    Exec,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpProbeSpec {
    pub url: String,
    pub expected_status: u16,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpProbeSpec {
    pub host: String,
    pub port: u16,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecProbeSpec {
    pub argv: Vec<String>,
    pub expected_exit_code: i64,
    pub timeout_seconds: u64,
}

/// At most one of these is present, matching the probe's `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CustomProbe {
    pub kind: ProbeKind,
    pub retries: u32,
    pub interval_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpProbeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpProbeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecProbeSpec>,
}

impl Default for ProbeKind {
    fn default() -> Self {
        ProbeKind::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Restart,
    Quarantine,
    Unquarantine,
    AutoMonitor,
    HealthCheckFailed,
    MaintenanceOn,
    MaintenanceOff,
    ManualRestart,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Success,
    Failure,
    Skipped,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub stable_id: String,
    pub ephemeral_id: String,
    pub kind: EventKind,
    pub status: EventStatus,
    pub restart_count: u64,
    pub message: String,
}

/// Keyed by stable id. The timestamp list is authoritative for rate
/// limiting; `total` is a monotonically non-decreasing display counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestartRecord {
    pub total: u64,
    pub timestamps: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceState {
    pub enabled: bool,
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainersSection {
    pub selected: HashSet<String>,
    pub excluded: HashSet<String>,
    /// Legacy compat: totals keyed by stable id, merged with
    /// `restart_counts.json` on load.
    pub restart_counts: HashMap<String, u64>,
}

/// The shape of `config.json`: configuration plus selection sets plus
/// custom probes, all whole-document replaceable together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigDocument {
    #[serde(flatten)]
    pub configuration: Configuration,
    pub containers: ContainersSection,
    pub custom_health_checks: HashMap<String, CustomProbe>,
}
