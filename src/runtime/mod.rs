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

//! Typed surface the core consumes from the container runtime. No part of
//! the core outside this module and `runtime::docker` ever names `bollard`.

pub mod docker;
pub mod probe;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    Created,
    Removing,
}

impl ContainerStatus {
    pub fn is_stopped(self) -> bool {
        matches!(self, ContainerStatus::Exited | ContainerStatus::Dead)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    None,
    Starting,
    Healthy,
    Unhealthy,
}

/// A point-in-time view of a container, recomputed on every inspection and
/// never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub long_id: String,
    pub short_id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub compose_project: Option<String>,
    pub compose_service: Option<String>,
    pub status: ContainerStatus,
    pub exit_code: Option<i64>,
    pub health: HealthStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub restart_policy_name: Option<String>,
    pub max_retry_count: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    NotFound,
    RuntimeUnreachable,
    Timeout,
    Other,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::NotFound => "not_found",
            FailureReason::RuntimeUnreachable => "runtime_unreachable",
            FailureReason::Timeout => "timeout",
            FailureReason::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("not found")]
    NotFound,
    #[error("runtime unreachable: {0}")]
    RuntimeUnreachable(String),
    #[error("timed out")]
    Timeout,
    #[error("runtime error: {0}")]
    Other(String),
}

impl AdapterError {
    pub fn reason(&self) -> FailureReason {
        match self {
            AdapterError::NotFound => FailureReason::NotFound,
            AdapterError::RuntimeUnreachable(_) => FailureReason::RuntimeUnreachable,
            AdapterError::Timeout => FailureReason::Timeout,
            AdapterError::Other(_) => FailureReason::Other,
        }
    }
}

/// The two event fields the core cares about: a container starting, with
/// the labels it started with.
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    pub event_type: String,
    pub action: String,
    pub container_id: String,
    pub labels_snapshot: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl RuntimeEvent {
    pub fn is_container_start(&self) -> bool {
        self.event_type == "container" && self.action == "start"
    }
}

pub type EventStream = BoxStream<'static, Result<RuntimeEvent, AdapterError>>;

/// Isolates the core from the container runtime. Every operation returns a
/// success value or a categorized [`AdapterError`]; nothing here ever
/// panics or propagates an opaque error into the core's control flow.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    async fn list(&self, include_stopped: bool) -> Result<Vec<Snapshot>, AdapterError>;
    async fn inspect(&self, id_or_name: &str) -> Result<Snapshot, AdapterError>;
    async fn restart(&self, long_id: &str, timeout: Duration) -> Result<(), AdapterError>;
    async fn probe_exec(
        &self,
        long_id: &str,
        argv: &[String],
        expected_exit_code: i64,
        timeout: Duration,
    ) -> Result<(), AdapterError>;
    fn events(&self) -> EventStream;
}
