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

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum_extra::TypedHeader;
use axum_extra::headers::ContentType;
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Meter, MeterProvider};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;

pub const COLLECT_PERIOD_MS: u64 = 10000;

/// Counters the scheduler and listener update as they act; kept as plain
/// fields rather than looked up by name so a typo in a metric name is a
/// compile error, not a silent no-op. Cheap to clone: each field is an
/// `opentelemetry` instrument handle backed by the shared registry.
#[derive(Clone)]
pub struct HealingMetrics {
    pub restarts: Counter<u64>,
    pub restart_failures: Counter<u64>,
    pub quarantines: Counter<u64>,
    pub auto_monitors: Counter<u64>,
    pub adapter_errors: Counter<u64>,
}

impl HealingMetrics {
    fn new(meter: &Meter) -> Self {
        HealingMetrics {
            restarts: meter
                .u64_counter("autoheal_restarts_total")
                .with_description("Successful scheduler-initiated and manual restarts")
                .build(),
            restart_failures: meter
                .u64_counter("autoheal_restart_failures_total")
                .with_description("Restart calls the runtime rejected or timed out")
                .build(),
            quarantines: meter
                .u64_counter("autoheal_quarantines_total")
                .with_description("Containers quarantined for exceeding the restart rate limit")
                .build(),
            auto_monitors: meter
                .u64_counter("autoheal_auto_monitors_total")
                .with_description("Containers admitted into the selection set by label match")
                .build(),
            adapter_errors: meter
                .u64_counter("autoheal_adapter_errors_total")
                .with_description("Runtime adapter calls that returned a categorized failure")
                .build(),
        }
    }

    pub fn record_restart(&self, stable_id: &str) {
        self.restarts.add(1, &[KeyValue::new("container", stable_id.to_string())]);
    }

    pub fn record_restart_failure(&self, stable_id: &str) {
        self.restart_failures
            .add(1, &[KeyValue::new("container", stable_id.to_string())]);
    }

    pub fn record_quarantine(&self, stable_id: &str) {
        self.quarantines
            .add(1, &[KeyValue::new("container", stable_id.to_string())]);
    }

    pub fn record_auto_monitor(&self, stable_id: &str) {
        self.auto_monitors
            .add(1, &[KeyValue::new("container", stable_id.to_string())]);
    }

    pub fn record_adapter_error(&self, reason: &str) {
        self.adapter_errors.add(1, &[KeyValue::new("reason", reason.to_string())]);
    }
}

pub struct Metrics {
    registry: Registry,
    provider: SdkMeterProvider,
    pub healing: HealingMetrics,
}

impl IntoResponse for &Metrics {
    fn into_response(self) -> Response {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut result = Vec::new();
        let result = match encoder.encode(&metric_families, &mut result) {
            Ok(()) => Ok((TypedHeader(ContentType::text_utf8()), result)),
            Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
        };
        result.into_response()
    }
}

impl Metrics {
    async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Response {
        metrics.into_response()
    }

    pub fn new() -> Result<Metrics> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;
        let provider = SdkMeterProvider::builder()
            .with_reader(exporter)
            .with_resource(
                Resource::builder()
                    .with_service_name(env!("CARGO_PKG_NAME"))
                    .build(),
            )
            .build();
        let meter = provider.meter(env!("CARGO_PKG_NAME"));
        let healing = HealingMetrics::new(&meter);
        Ok(Metrics {
            registry,
            provider,
            healing,
        })
    }

    pub async fn run(self: Arc<Self>, bind_address: SocketAddr) -> Result<()> {
        let app = Router::new()
            .route("/metrics", get(Metrics::metrics_handler))
            .with_state(self);
        let listener = TcpListener::bind(&bind_address).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }

    pub fn meter_provider(&self) -> Meter {
        self.provider.meter(env!("CARGO_PKG_NAME"))
    }

    pub fn healing_metrics(&self) -> HealingMetrics {
        self.healing.clone()
    }
}
