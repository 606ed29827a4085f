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

//! The active loop: every tick, list containers, ask the evaluator, apply
//! backoff, invoke restart, and record the outcome. One tick's worth of
//! per-container workers run detached so a single container's backoff
//! sleep never delays the others or the next tick.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::Configuration;
use crate::evaluator::{self, Decision, EvaluationInput};
use crate::ids::resolve_stable_id;
use crate::metrics::HealingMetrics;
use crate::notify::NotificationSink;
use crate::runtime::probe::{probe_http, probe_tcp};
use crate::runtime::{AdapterError, RuntimeAdapter, Snapshot};
use crate::store::model::{CustomProbe, EventKind, EventStatus, ProbeKind};
use crate::store::{self, StateStore};

const RESTART_TIMEOUT: Duration = Duration::from_secs(30);
const RECOVERY_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Default)]
struct PerContainerState {
    backoff_deadline: Option<DateTime<Utc>>,
    consecutive_restarts: u32,
    probe_consecutive_failures: u32,
    last_probe_at: Option<DateTime<Utc>>,
    in_flight: bool,
}

pub struct HealingScheduler {
    adapter: Arc<dyn RuntimeAdapter>,
    store: Arc<StateStore>,
    notifier: Arc<dyn NotificationSink>,
    metrics: Arc<HealingMetrics>,
    concurrency: Arc<Semaphore>,
    state: Arc<RwLock<HashMap<String, PerContainerState>>>,
    cancellation: CancellationToken,
}

impl HealingScheduler {
    pub fn new(
        adapter: Arc<dyn RuntimeAdapter>,
        store: Arc<StateStore>,
        notifier: Arc<dyn NotificationSink>,
        metrics: Arc<HealingMetrics>,
        cancellation: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(HealingScheduler {
            adapter,
            store,
            notifier,
            metrics,
            concurrency: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
            state: Arc::new(RwLock::new(HashMap::new())),
            cancellation,
        })
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            if self.cancellation.is_cancelled() {
                break;
            }
            let tick_start = Instant::now();
            self.tick().await;

            let interval = Duration::from_secs(self.store.configuration().monitor.interval_seconds);
            let elapsed = tick_start.elapsed();
            if elapsed < interval {
                tokio::select! {
                    _ = tokio::time::sleep(interval - elapsed) => {}
                    _ = self.cancellation.cancelled() => break,
                }
            }
        }
        log::info!("healing scheduler stopped");
    }

    /// Runs a single tick outside of `run`'s sleep loop. Exposed so tests
    /// can drive the scheduler deterministically instead of waiting on
    /// real wall-clock ticks.
    pub async fn tick(self: &Arc<Self>) {
        let maintenance = self.store.maintenance_state();
        if maintenance.enabled {
            log::debug!("maintenance mode enabled; skipping healing tick");
            return;
        }

        let snapshots = match self.adapter.list(true).await {
            Ok(s) => s,
            Err(e) => {
                self.metrics.record_adapter_error("list");
                log::warn!("failed to list containers this tick: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(RECOVERY_INTERVAL) => {}
                    _ = self.cancellation.cancelled() => {}
                }
                return;
            }
        };

        let live_ids: HashSet<String> = snapshots.iter().map(resolve_stable_id).collect();
        self.store.garbage_collect(&live_ids);
        self.state.write().retain(|id, _| live_ids.contains(id));

        let config = self.store.configuration();
        for snapshot in snapshots {
            let this = Arc::clone(self);
            let config = config.clone();
            let permit = Arc::clone(&this.concurrency);
            tokio::spawn(async move {
                let _permit = match permit.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                this.handle_container(snapshot, config).await;
            });
        }
    }

    fn is_monitored(
        &self,
        stable_id: &str,
        ephemeral_ids: &[String],
        snapshot: &Snapshot,
        config: &Configuration,
    ) -> bool {
        if self.store.is_excluded(stable_id, ephemeral_ids) {
            return false;
        }
        if config.monitor.include_all {
            return true;
        }
        if self.store.is_selected(stable_id, ephemeral_ids) {
            return true;
        }
        snapshot
            .labels
            .get(&config.monitor.label_key)
            .map(|v| v == &config.monitor.label_value)
            .unwrap_or(false)
    }

    fn backoff_delay(config: &Configuration, consecutive: u32) -> Duration {
        if !config.backoff.enabled {
            return Duration::ZERO;
        }
        let raw = config.backoff.initial_seconds as f64 * config.backoff.multiplier.powi(consecutive as i32);
        let capped = match config.backoff.max_seconds {
            Some(max) => raw.min(max as f64),
            None => raw,
        };
        Duration::from_secs_f64(capped.max(0.0))
    }

    async fn run_custom_probe(&self, stable_id: &str, snapshot: &Snapshot, probe: &CustomProbe) -> u32 {
        let now = Utc::now();
        let due = {
            let guard = self.state.read();
            match guard.get(stable_id).and_then(|s| s.last_probe_at) {
                Some(last) => {
                    now - last >= chrono::Duration::seconds(probe.interval_seconds.max(1) as i64)
                }
                None => true,
            }
        };
        if !due {
            return self
                .state
                .read()
                .get(stable_id)
                .map(|s| s.probe_consecutive_failures)
                .unwrap_or(0);
        }

        let timeout = |secs: u64| Duration::from_secs(secs.max(1));
        let result = match probe.kind {
            ProbeKind::Http => {
                let Some(spec) = &probe.http else {
                    return 0;
                };
                probe_http(&spec.url, spec.expected_status, timeout(spec.timeout_seconds)).await
            }
            ProbeKind::Tcp => {
                let Some(spec) = &probe.tcp else {
                    return 0;
                };
                probe_tcp(&spec.host, spec.port, timeout(spec.timeout_seconds)).await
            }
            ProbeKind::Exec => {
                let Some(spec) = &probe.exec else {
                    return 0;
                };
                self.adapter
                    .probe_exec(
                        &snapshot.long_id,
                        &spec.argv,
                        spec.expected_exit_code,
                        timeout(spec.timeout_seconds),
                    )
                    .await
            }
            ProbeKind::None => return 0,
        };

        let mut guard = self.state.write();
        let entry = guard.entry(stable_id.to_string()).or_default();
        entry.last_probe_at = Some(now);
        entry.probe_consecutive_failures = match result {
            Ok(()) => 0,
            Err(e) => {
                log::debug!("custom probe failed for {stable_id}: {e}");
                entry.probe_consecutive_failures + 1
            }
        };
        entry.probe_consecutive_failures
    }

    async fn handle_container(self: Arc<Self>, snapshot: Snapshot, config: Configuration) {
        let stable_id = resolve_stable_id(&snapshot);
        let ephemeral_ids = [snapshot.short_id.clone(), snapshot.long_id.clone()];

        if !self.is_monitored(&stable_id, &ephemeral_ids, &snapshot, &config) {
            return;
        }

        {
            let guard = self.state.read();
            if let Some(s) = guard.get(&stable_id) {
                if s.in_flight {
                    return;
                }
                if let Some(deadline) = s.backoff_deadline {
                    if Utc::now() < deadline {
                        return;
                    }
                }
            }
        }

        let custom_probe = self.store.custom_probe(&stable_id);
        let probe_failures = if let Some(probe) = &custom_probe {
            if probe.kind != ProbeKind::None {
                self.run_custom_probe(&stable_id, &snapshot, probe).await
            } else {
                0
            }
        } else {
            0
        };

        let quarantined = self.store.is_quarantined(&stable_id, &ephemeral_ids);
        let window = Duration::from_secs(config.restart.max_restarts_window_seconds);
        let now = Utc::now();
        let recent_restart_count = self.store.recent_restart_count(&stable_id, window, now);
        let last_restart_time = self.store.last_restart_time(&stable_id);

        let input = EvaluationInput {
            snapshot: &snapshot,
            config: &config,
            quarantined,
            last_restart_time,
            recent_restart_count,
            custom_probe: custom_probe.as_ref(),
            custom_probe_consecutive_failures: probe_failures,
        };
        let decision = evaluator::evaluate(&input, now);

        match decision {
            Decision::Skip { reason } => {
                if reason == "healthy" {
                    let mut guard = self.state.write();
                    if let Some(s) = guard.get_mut(&stable_id) {
                        s.consecutive_restarts = 0;
                    }
                } else if reason.starts_with("cooldown") || reason == "quarantined" {
                    log::debug!("{stable_id}: skip ({reason})");
                }
            }
            Decision::Quarantine { reason } => {
                self.store.quarantine(&stable_id);
                self.metrics.record_quarantine(&stable_id);
                let total = self.store.total_restart_count(&stable_id);
                let record = store::event(
                    stable_id.clone(),
                    snapshot.long_id.clone(),
                    EventKind::Quarantine,
                    EventStatus::Info,
                    total,
                    reason,
                );
                self.notifier.notify(&record);
                self.store.append_event(record);
            }
            Decision::Restart { reason } => {
                self.do_restart(stable_id, snapshot, &config, reason).await;
            }
        }
    }

    async fn do_restart(
        self: &Arc<Self>,
        stable_id: String,
        snapshot: Snapshot,
        config: &Configuration,
        reason: String,
    ) {
        let consecutive = {
            let mut guard = self.state.write();
            let entry = guard.entry(stable_id.clone()).or_default();
            entry.in_flight = true;
            let n = entry.consecutive_restarts;
            entry.consecutive_restarts = n.saturating_add(1);
            n
        };

        let delay = Self::backoff_delay(config, consecutive);
        let deadline = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        {
            let mut guard = self.state.write();
            if let Some(entry) = guard.get_mut(&stable_id) {
                entry.backoff_deadline = Some(deadline);
            }
        }

        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancellation.cancelled() => {
                    self.clear_in_flight(&stable_id);
                    return;
                }
            }
        }

        let at = Utc::now();
        let total = self.store.record_restart(&stable_id, at);

        let result = self.adapter.restart(&snapshot.long_id, RESTART_TIMEOUT).await;
        match result {
            Ok(()) => {
                let mut guard = self.state.write();
                if let Some(entry) = guard.get_mut(&stable_id) {
                    entry.backoff_deadline = None;
                }
                drop(guard);
                self.metrics.record_restart(&stable_id);
                let record = store::event(
                    stable_id.clone(),
                    snapshot.long_id.clone(),
                    EventKind::Restart,
                    EventStatus::Success,
                    total,
                    reason,
                );
                self.notifier.notify(&record);
                self.store.append_event(record);
            }
            Err(e) => {
                self.metrics.record_restart_failure(&stable_id);
                let record = store::event(
                    stable_id.clone(),
                    snapshot.long_id.clone(),
                    EventKind::Restart,
                    EventStatus::Failure,
                    total,
                    format!("{reason}: restart call failed ({e})"),
                );
                self.notifier.notify(&record);
                self.store.append_event(record);
            }
        }

        self.clear_in_flight(&stable_id);
    }

    fn clear_in_flight(&self, stable_id: &str) {
        let mut guard = self.state.write();
        if let Some(entry) = guard.get_mut(stable_id) {
            entry.in_flight = false;
        }
    }

    /// Bypasses maintenance, cooldown, and backoff: used by the control
    /// surface's manual-restart operation. Still records a restart
    /// timestamp, so it counts against the rate limit like any other.
    pub async fn manual_restart(&self, stable_id: &str) -> Result<u64, AdapterError> {
        let snapshot = self.adapter.inspect(stable_id).await?;
        let at = Utc::now();
        let total = self.store.record_restart(stable_id, at);
        let result = self.adapter.restart(&snapshot.long_id, RESTART_TIMEOUT).await;
        if result.is_ok() {
            self.metrics.record_restart(stable_id);
        } else {
            self.metrics.record_restart_failure(stable_id);
        }
        let record = store::event(
            stable_id.to_string(),
            snapshot.long_id.clone(),
            EventKind::ManualRestart,
            if result.is_ok() {
                EventStatus::Success
            } else {
                EventStatus::Failure
            },
            total,
            "manual restart via control surface".to_string(),
        );
        self.notifier.notify(&record);
        self.store.append_event(record);
        result.map(|_| total)
    }
}
