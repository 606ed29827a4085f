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

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use autoheal_engine::api::{self, AppState};
use autoheal_engine::cli::Cli;
use autoheal_engine::listener::EventListener;
use autoheal_engine::logging;
use autoheal_engine::metrics::Metrics;
use autoheal_engine::notify::LogSink;
use autoheal_engine::runtime::RuntimeAdapter;
use autoheal_engine::scheduler::HealingScheduler;
use autoheal_engine::store::StateStore;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    logging::init(log::LevelFilter::Info)?;
    let cli = Cli::parse();

    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("creating data directory {}", cli.data_dir.display()))?;
    let store = Arc::new(StateStore::load(&cli.data_dir));

    let log_level = store.configuration().observability.log_level.as_level_filter();
    if let Err(e) = logging::init(log_level) {
        log::debug!("logger already initialized at boot-time level: {e}");
    }

    let docker = cli.connection.connect().context("connecting to container runtime")?;
    let adapter: Arc<dyn RuntimeAdapter> = Arc::new(docker);

    let metrics = Arc::new(Metrics::new().context("initializing metrics exporter")?);
    let notifier = Arc::new(LogSink);
    let cancellation = CancellationToken::new();

    let scheduler = HealingScheduler::new(
        Arc::clone(&adapter),
        Arc::clone(&store),
        notifier.clone(),
        Arc::new(metrics.healing_metrics()),
        cancellation.clone(),
    );

    let listener = EventListener::new(
        Arc::clone(&adapter),
        Arc::clone(&store),
        notifier.clone(),
        Arc::new(metrics.healing_metrics()),
        cancellation.clone(),
    );

    let app_state = Arc::new(AppState {
        store: Arc::clone(&store),
        adapter: Arc::clone(&adapter),
        scheduler: Arc::clone(&scheduler),
        notifier: notifier.clone(),
    });

    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run());
    let listener_task = tokio::spawn(listener.run());
    let metrics_task = tokio::spawn(Arc::clone(&metrics).run(cli.prometheus_address));
    let api_cancellation = cancellation.clone();
    let api_task = tokio::spawn(api::run(app_state, cli.bind_address, api_cancellation));

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("shutdown signal received");
        cancellation.cancel();
    };

    tokio::select! {
        _ = shutdown => {}
        res = scheduler_task => { log_task_result("scheduler", res.map(Ok)); cancellation.cancel(); }
        res = listener_task => { log_task_result("listener", res.map(Ok)); cancellation.cancel(); }
        res = metrics_task => { log_task_result("metrics server", res); cancellation.cancel(); }
        res = api_task => { log_task_result("control surface", res); cancellation.cancel(); }
    }

    Ok(())
}

fn log_task_result<T>(name: &str, res: std::result::Result<Result<T>, tokio::task::JoinError>) {
    match res {
        Ok(Ok(_)) => log::info!("{name} stopped"),
        Ok(Err(e)) => log::error!("{name} exited with error: {e}"),
        Err(e) => log::error!("{name} task panicked: {e}"),
    }
}
