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

//! The only module allowed to name `bollard` types outside of `runtime::mod`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::query_parameters::{
    EventsOptionsBuilder, InspectContainerOptions, ListContainersOptionsBuilder,
    RestartContainerOptionsBuilder,
};
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use tokio::time::timeout;

use super::{
    AdapterError, ContainerStatus, EventStream, HealthStatus, RuntimeAdapter, RuntimeEvent,
    Snapshot,
};

const COMPOSE_PROJECT_LABEL: &str = crate::ids::COMPOSE_PROJECT_LABEL;
const COMPOSE_SERVICE_LABEL: &str = crate::ids::COMPOSE_SERVICE_LABEL;

pub struct DockerAdapter {
    docker: Docker,
}

impl DockerAdapter {
    pub fn new(docker: Docker) -> Self {
        DockerAdapter { docker }
    }

    pub fn connect_local_defaults() -> Result<Self, AdapterError> {
        Docker::connect_with_local_defaults()
            .map(Self::new)
            .map_err(|e| AdapterError::RuntimeUnreachable(e.to_string()))
    }

    pub fn connect_unix(path: &str) -> Result<Self, AdapterError> {
        Docker::connect_with_unix(path, 3, bollard::API_DEFAULT_VERSION)
            .map(Self::new)
            .map_err(|e| AdapterError::RuntimeUnreachable(e.to_string()))
    }

    pub fn connect_http(url: &str) -> Result<Self, AdapterError> {
        Docker::connect_with_http(url, 3, bollard::API_DEFAULT_VERSION)
            .map(Self::new)
            .map_err(|e| AdapterError::RuntimeUnreachable(e.to_string()))
    }
}

fn map_error(err: bollard::errors::Error) -> AdapterError {
    match &err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. }
            if *status_code == 404 =>
        {
            AdapterError::NotFound
        }
        bollard::errors::Error::HyperResponseError(_)
        | bollard::errors::Error::DockerStreamError { .. } => {
            AdapterError::RuntimeUnreachable(err.to_string())
        }
        _ => AdapterError::Other(err.to_string()),
    }
}

fn parse_status(state: Option<&bollard::models::ContainerState>) -> ContainerStatus {
    match state.and_then(|s| s.status) {
        Some(bollard::models::ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
        Some(bollard::models::ContainerStateStatusEnum::RESTARTING) => {
            ContainerStatus::Restarting
        }
        Some(bollard::models::ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
        Some(bollard::models::ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited,
        Some(bollard::models::ContainerStateStatusEnum::DEAD) => ContainerStatus::Dead,
        Some(bollard::models::ContainerStateStatusEnum::REMOVING) => ContainerStatus::Removing,
        _ => ContainerStatus::Created,
    }
}

fn parse_health(state: Option<&bollard::models::ContainerState>) -> HealthStatus {
    match state
        .and_then(|s| s.health.as_ref())
        .and_then(|h| h.status)
    {
        Some(bollard::models::HealthStatusEnum::STARTING) => HealthStatus::Starting,
        Some(bollard::models::HealthStatusEnum::HEALTHY) => HealthStatus::Healthy,
        Some(bollard::models::HealthStatusEnum::UNHEALTHY) => HealthStatus::Unhealthy,
        _ => HealthStatus::None,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() || raw.starts_with("0001-01-01") {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn snapshot_from_inspect(inspect: bollard::models::ContainerInspectResponse) -> Snapshot {
    let state = inspect.state.as_ref();
    let labels: HashMap<String, String> = inspect
        .config
        .as_ref()
        .and_then(|c| c.labels.clone())
        .unwrap_or_default();
    let name = inspect.name.unwrap_or_default();
    let long_id = inspect.id.unwrap_or_default();
    Snapshot {
        short_id: long_id.chars().take(12).collect(),
        name,
        compose_project: labels.get(COMPOSE_PROJECT_LABEL).cloned(),
        compose_service: labels.get(COMPOSE_SERVICE_LABEL).cloned(),
        labels,
        status: parse_status(state),
        exit_code: state.and_then(|s| s.exit_code),
        health: parse_health(state),
        started_at: state
            .and_then(|s| s.started_at.as_deref())
            .and_then(parse_timestamp),
        finished_at: state
            .and_then(|s| s.finished_at.as_deref())
            .and_then(parse_timestamp),
        restart_policy_name: inspect
            .host_config
            .as_ref()
            .and_then(|h| h.restart_policy.as_ref())
            .and_then(|p| p.name)
            .map(|n| format!("{n:?}")),
        max_retry_count: inspect
            .host_config
            .as_ref()
            .and_then(|h| h.restart_policy.as_ref())
            .and_then(|p| p.maximum_retry_count)
            .map(i64::from),
        long_id,
    }
}

fn snapshot_from_summary(summary: bollard::models::ContainerSummary) -> Option<Snapshot> {
    let long_id = summary.id?;
    let labels = summary.labels.clone().unwrap_or_default();
    let name = summary
        .names
        .as_ref()
        .and_then(|n| n.first())
        .cloned()
        .unwrap_or_default();
    Some(Snapshot {
        short_id: long_id.chars().take(12).collect(),
        name,
        compose_project: labels.get(COMPOSE_PROJECT_LABEL).cloned(),
        compose_service: labels.get(COMPOSE_SERVICE_LABEL).cloned(),
        labels,
        status: summary
            .state
            .as_deref()
            .map(status_from_summary_state)
            .unwrap_or(ContainerStatus::Created),
        exit_code: None,
        health: HealthStatus::None,
        started_at: None,
        finished_at: None,
        restart_policy_name: None,
        max_retry_count: None,
        long_id,
    })
}

fn status_from_summary_state(state: &str) -> ContainerStatus {
    match state {
        "running" => ContainerStatus::Running,
        "restarting" => ContainerStatus::Restarting,
        "paused" => ContainerStatus::Paused,
        "exited" => ContainerStatus::Exited,
        "dead" => ContainerStatus::Dead,
        "removing" => ContainerStatus::Removing,
        _ => ContainerStatus::Created,
    }
}

#[async_trait]
impl RuntimeAdapter for DockerAdapter {
    async fn list(&self, include_stopped: bool) -> Result<Vec<Snapshot>, AdapterError> {
        let options = ListContainersOptionsBuilder::new()
            .all(include_stopped)
            .build();
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_error)?;

        let mut snapshots = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id.clone() else {
                continue;
            };
            // The list endpoint doesn't carry health/exit-code detail; a
            // full inspect gives the evaluator what it needs.
            match self.inspect(&id).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(AdapterError::NotFound) => continue,
                Err(e) => log::debug!("inspect during list failed for {id}: {e}"),
            }
        }
        Ok(snapshots)
    }

    async fn inspect(&self, id_or_name: &str) -> Result<Snapshot, AdapterError> {
        let inspect = self
            .docker
            .inspect_container(id_or_name, None::<InspectContainerOptions>)
            .await
            .map_err(map_error)?;
        Ok(snapshot_from_inspect(inspect))
    }

    async fn restart(&self, long_id: &str, timeout_dur: Duration) -> Result<(), AdapterError> {
        let options = RestartContainerOptionsBuilder::new()
            .t(timeout_dur.as_secs() as i32)
            .build();
        timeout(
            timeout_dur + Duration::from_secs(5),
            self.docker.restart_container(long_id, Some(options)),
        )
        .await
        .map_err(|_| AdapterError::Timeout)?
        .map_err(map_error)
    }

    async fn probe_exec(
        &self,
        long_id: &str,
        argv: &[String],
        expected_exit_code: i64,
        timeout_dur: Duration,
    ) -> Result<(), AdapterError> {
        let exec = timeout(
            timeout_dur,
            self.docker.create_exec(
                long_id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            ),
        )
        .await
        .map_err(|_| AdapterError::Timeout)?
        .map_err(map_error)?;

        let start = timeout(
            timeout_dur,
            self.docker
                .start_exec(&exec.id, None::<StartExecOptions>),
        )
        .await
        .map_err(|_| AdapterError::Timeout)?
        .map_err(map_error)?;

        if let StartExecResults::Attached { mut output, .. } = start {
            while output.next().await.is_some() {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(map_error)?;
        match inspect.exit_code {
            Some(code) if code == expected_exit_code => Ok(()),
            Some(code) => Err(AdapterError::Other(format!(
                "exec exited {code}, expected {expected_exit_code}"
            ))),
            None => Err(AdapterError::Other("exec did not complete".to_string())),
        }
    }

    fn events(&self) -> EventStream {
        let options = EventsOptionsBuilder::new()
            .filters(&HashMap::from([("type", vec!["container"])]))
            .build();
        let docker = self.docker.clone();
        Box::pin(docker.events(Some(options)).map(|item| {
            item.map(|msg| RuntimeEvent {
                event_type: msg
                    .typ
                    .map(|t| format!("{t:?}").to_lowercase())
                    .unwrap_or_default(),
                action: msg.action.unwrap_or_default(),
                container_id: msg
                    .actor
                    .as_ref()
                    .and_then(|a| a.id.clone())
                    .unwrap_or_default(),
                labels_snapshot: msg
                    .actor
                    .and_then(|a| a.attributes)
                    .unwrap_or_default(),
                timestamp: msg
                    .time
                    .and_then(|t| Utc.timestamp_opt(t, 0).single())
                    .unwrap_or_else(Utc::now),
            })
            .map_err(map_error)
        }))
    }
}
