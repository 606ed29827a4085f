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

//! The HTTP control surface. A thin `axum` layer over the operations
//! already exposed by [`crate::store::StateStore`] and
//! [`crate::scheduler::HealingScheduler`] — no policy lives here.

mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::routing::{delete, get, post, put};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::notify::NotificationSink;
use crate::runtime::RuntimeAdapter;
use crate::scheduler::HealingScheduler;
use crate::store::StateStore;

pub struct AppState {
    pub store: Arc<StateStore>,
    pub adapter: Arc<dyn RuntimeAdapter>,
    pub scheduler: Arc<HealingScheduler>,
    pub notifier: Arc<dyn NotificationSink>,
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/containers", get(handlers::list_containers))
        .route("/containers/{id}", get(handlers::inspect_container))
        .route("/containers/{id}/restart", post(handlers::manual_restart))
        .route("/containers/{id}/unquarantine", post(handlers::unquarantine))
        .route(
            "/containers/{id}/probe",
            get(handlers::get_probe).put(handlers::set_probe).delete(handlers::delete_probe),
        )
        .route("/selection", post(handlers::update_selection))
        .route("/config", get(handlers::get_config).put(handlers::replace_config))
        .route("/config/{group}", put(handlers::update_config_group))
        .route("/config/export", get(handlers::export_config))
        .route("/config/import", post(handlers::import_config))
        .route(
            "/maintenance",
            get(handlers::maintenance_status).post(handlers::set_maintenance),
        )
        .route("/events", get(handlers::list_events))
        .route("/events", delete(handlers::clear_events))
        .with_state(state)
}

pub async fn run(state: Arc<AppState>, bind_address: SocketAddr, cancellation: CancellationToken) -> Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(&bind_address).await?;
    log::info!("control surface listening on {bind_address}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancellation.cancelled().await })
        .await?;
    Ok(())
}
