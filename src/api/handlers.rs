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

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::validator::ConfigWarning;
use crate::config::{BackoffConfig, Configuration, MonitorConfig, ObservabilityConfig, RestartConfig, UiConfig};
use crate::ids::resolve_stable_id;
use crate::store::model::{CustomProbe, EventKind, EventRecord, EventStatus};
use crate::store::{self};

use super::AppState;

#[derive(Debug, Serialize)]
pub struct ContainerSummaryDto {
    pub stable_id: String,
    pub name: String,
    pub status: String,
    pub health: String,
    pub monitored: bool,
    pub selected: bool,
    pub excluded: bool,
    pub quarantined: bool,
}

#[derive(Debug, Serialize)]
pub struct ContainerDetailDto {
    #[serde(flatten)]
    pub summary: ContainerSummaryDto,
    pub total_restart_count: u64,
    pub recent_restart_count: u32,
    pub last_restart_time: Option<chrono::DateTime<Utc>>,
    pub custom_probe: Option<CustomProbe>,
}

fn status_label(s: crate::runtime::ContainerStatus) -> &'static str {
    use crate::runtime::ContainerStatus::*;
    match s {
        Running => "running",
        Restarting => "restarting",
        Paused => "paused",
        Exited => "exited",
        Dead => "dead",
        Created => "created",
        Removing => "removing",
    }
}

fn health_label(h: crate::runtime::HealthStatus) -> &'static str {
    use crate::runtime::HealthStatus::*;
    match h {
        None => "none",
        Starting => "starting",
        Healthy => "healthy",
        Unhealthy => "unhealthy",
    }
}

/// Resolves a path-supplied id that may be either a stable id already known
/// to the store, or an ephemeral runtime id/name, to its stable form. Falls
/// back to treating the input as already-stable when the runtime has no
/// such container (e.g. it already disappeared).
async fn resolve_id(state: &AppState, id: &str) -> String {
    match state.adapter.inspect(id).await {
        Ok(snapshot) => resolve_stable_id(&snapshot),
        Err(_) => id.to_string(),
    }
}

pub async fn list_containers(State(state): State<Arc<AppState>>) -> Json<Vec<ContainerSummaryDto>> {
    let config = state.store.configuration();
    let quarantine = state.store.quarantine_set();
    let (selected, excluded) = state.store.selection_sets();

    let snapshots = state.adapter.list(true).await.unwrap_or_default();
    let dtos = snapshots
        .into_iter()
        .map(|snapshot| {
            let stable_id = resolve_stable_id(&snapshot);
            let monitored = !excluded.contains(&stable_id)
                && (config.monitor.include_all
                    || selected.contains(&stable_id)
                    || snapshot
                        .labels
                        .get(&config.monitor.label_key)
                        .map(|v| v == &config.monitor.label_value)
                        .unwrap_or(false));
            ContainerSummaryDto {
                selected: selected.contains(&stable_id),
                excluded: excluded.contains(&stable_id),
                quarantined: quarantine.contains(&stable_id),
                monitored,
                status: status_label(snapshot.status).to_string(),
                health: health_label(snapshot.health).to_string(),
                name: snapshot.name,
                stable_id,
            }
        })
        .collect();
    Json(dtos)
}

pub async fn inspect_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ContainerDetailDto>, StatusCode> {
    let snapshot = state.adapter.inspect(&id).await.map_err(|_| StatusCode::NOT_FOUND)?;
    let stable_id = resolve_stable_id(&snapshot);
    let config = state.store.configuration();
    let quarantine = state.store.quarantine_set();
    let (selected, excluded) = state.store.selection_sets();

    let monitored = !excluded.contains(&stable_id)
        && (config.monitor.include_all
            || selected.contains(&stable_id)
            || snapshot
                .labels
                .get(&config.monitor.label_key)
                .map(|v| v == &config.monitor.label_value)
                .unwrap_or(false));

    let window = Duration::from_secs(config.restart.max_restarts_window_seconds);
    let recent_restart_count = state.store.recent_restart_count(&stable_id, window, Utc::now());

    let detail = ContainerDetailDto {
        total_restart_count: state.store.total_restart_count(&stable_id),
        recent_restart_count,
        last_restart_time: state.store.last_restart_time(&stable_id),
        custom_probe: state.store.custom_probe(&stable_id),
        summary: ContainerSummaryDto {
            selected: selected.contains(&stable_id),
            excluded: excluded.contains(&stable_id),
            quarantined: quarantine.contains(&stable_id),
            monitored,
            status: status_label(snapshot.status).to_string(),
            health: health_label(snapshot.health).to_string(),
            name: snapshot.name,
            stable_id,
        },
    };
    Ok(Json(detail))
}

#[derive(Debug, Serialize)]
pub struct ManualRestartResponse {
    pub total_restart_count: u64,
}

pub async fn manual_restart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ManualRestartResponse>, StatusCode> {
    let stable_id = resolve_id(&state, &id).await;
    state
        .scheduler
        .manual_restart(&stable_id)
        .await
        .map(|total| Json(ManualRestartResponse { total_restart_count: total }))
        .map_err(|e| match e.reason() {
            crate::runtime::FailureReason::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_GATEWAY,
        })
}

pub async fn unquarantine(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> StatusCode {
    let stable_id = resolve_id(&state, &id).await;
    state.store.unquarantine(&stable_id);
    let record = store::event(
        stable_id,
        id,
        EventKind::Unquarantine,
        EventStatus::Info,
        0,
        "unquarantined via control surface".to_string(),
    );
    state.notifier.notify(&record);
    state.store.append_event(record);
    StatusCode::NO_CONTENT
}

pub async fn get_probe(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CustomProbe>, StatusCode> {
    let stable_id = resolve_id(&state, &id).await;
    state.store.custom_probe(&stable_id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

pub async fn set_probe(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(probe): Json<CustomProbe>,
) -> StatusCode {
    let stable_id = resolve_id(&state, &id).await;
    state.store.set_custom_probe(&stable_id, probe);
    StatusCode::NO_CONTENT
}

pub async fn delete_probe(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> StatusCode {
    let stable_id = resolve_id(&state, &id).await;
    state.store.remove_custom_probe(&stable_id);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionAction {
    Select,
    Exclude,
    Clear,
}

#[derive(Debug, Deserialize)]
pub struct SelectionRequest {
    pub ids: Vec<String>,
    pub action: SelectionAction,
}

pub async fn update_selection(State(state): State<Arc<AppState>>, Json(req): Json<SelectionRequest>) -> StatusCode {
    for id in &req.ids {
        let stable_id = resolve_id(&state, id).await;
        match req.action {
            SelectionAction::Select => state.store.select(&stable_id),
            SelectionAction::Exclude => state.store.exclude(&stable_id),
            SelectionAction::Clear => {
                state.store.deselect(&stable_id);
                state.store.unexclude(&stable_id);
            }
        }
    }
    StatusCode::NO_CONTENT
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    #[serde(flatten)]
    pub configuration: Configuration,
    pub warnings: Vec<ConfigWarning>,
}

fn with_warnings(configuration: Configuration) -> ConfigResponse {
    let warnings = crate::config::validator::validate_restart_policy(&configuration);
    ConfigResponse { configuration, warnings }
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    Json(with_warnings(state.store.configuration()))
}

pub async fn replace_config(
    State(state): State<Arc<AppState>>,
    Json(config): Json<Configuration>,
) -> Result<Json<ConfigResponse>, StatusCode> {
    state
        .store
        .set_configuration(config)
        .map(|()| Json(with_warnings(state.store.configuration())))
        .map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)
}

pub async fn update_config_group(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
    body: axum::body::Bytes,
) -> Response {
    let result = match group.as_str() {
        "monitor" => serde_json::from_slice::<MonitorConfig>(&body)
            .map_err(|e| e.to_string())
            .and_then(|patch| state.store.update_monitor(|m| *m = patch).map_err(|e| e.to_string())),
        "restart" => serde_json::from_slice::<RestartConfig>(&body)
            .map_err(|e| e.to_string())
            .and_then(|patch| state.store.update_restart(|r| *r = patch).map_err(|e| e.to_string())),
        "backoff" => serde_json::from_slice::<BackoffConfig>(&body)
            .map_err(|e| e.to_string())
            .and_then(|patch| state.store.update_backoff(|b| *b = patch).map_err(|e| e.to_string())),
        "observability" => serde_json::from_slice::<ObservabilityConfig>(&body)
            .map_err(|e| e.to_string())
            .and_then(|patch| {
                state.store.update_observability(|o| *o = patch).map_err(|e| e.to_string())
            }),
        "ui" => serde_json::from_slice::<UiConfig>(&body)
            .map_err(|e| e.to_string())
            .and_then(|patch| state.store.update_ui(|u| *u = patch).map_err(|e| e.to_string())),
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    match result {
        Ok(()) => Json(with_warnings(state.store.configuration())).into_response(),
        Err(message) => (StatusCode::UNPROCESSABLE_ENTITY, message).into_response(),
    }
}

pub async fn export_config(State(state): State<Arc<AppState>>) -> Json<Configuration> {
    Json(state.store.configuration())
}

pub async fn import_config(
    State(state): State<Arc<AppState>>,
    Json(config): Json<Configuration>,
) -> StatusCode {
    match state.store.set_configuration(config) {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

#[derive(Debug, Serialize)]
pub struct MaintenanceStatusDto {
    pub enabled: bool,
    pub start_time: Option<chrono::DateTime<Utc>>,
    pub elapsed_seconds: Option<i64>,
}

pub async fn maintenance_status(State(state): State<Arc<AppState>>) -> Json<MaintenanceStatusDto> {
    let state_doc = state.store.maintenance_state();
    let elapsed_seconds = state_doc.start_time.map(|start| (Utc::now() - start).num_seconds());
    Json(MaintenanceStatusDto {
        enabled: state_doc.enabled,
        start_time: state_doc.start_time,
        elapsed_seconds,
    })
}

#[derive(Debug, Deserialize)]
pub struct SetMaintenanceRequest {
    pub enabled: bool,
}

pub async fn set_maintenance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetMaintenanceRequest>,
) -> StatusCode {
    let now = Utc::now();
    state.store.set_maintenance(req.enabled, now);
    let record = store::event(
        "*".to_string(),
        "*".to_string(),
        if req.enabled { EventKind::MaintenanceOn } else { EventKind::MaintenanceOff },
        EventStatus::Info,
        0,
        format!("maintenance mode {}", if req.enabled { "enabled" } else { "disabled" }),
    );
    state.notifier.notify(&record);
    state.store.append_event(record);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<EventRecord>> {
    Json(state.store.event_log(query.limit))
}

pub async fn clear_events(State(state): State<Arc<AppState>>) -> StatusCode {
    state.store.clear_events();
    let record = store::event(
        "*".to_string(),
        "*".to_string(),
        EventKind::Clear,
        EventStatus::Info,
        0,
        "event log cleared via control surface".to_string(),
    );
    state.notifier.notify(&record);
    state.store.append_event(record);
    StatusCode::NO_CONTENT
}
