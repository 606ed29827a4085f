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

//! Converts runtime container-start events into selection-set updates.
//! The runtime's event stream is consumed on its own task and handed to
//! the core via a bounded channel so a slow core never blocks ingestion,
//! and a full channel simply drops events (the next scheduler tick
//! reconciles anything missed).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ids::resolve_stable_id;
use crate::metrics::HealingMetrics;
use crate::notify::NotificationSink;
use crate::runtime::RuntimeAdapter;
use crate::store::model::{EventKind, EventStatus};
use crate::store::{self, StateStore};

const QUEUE_CAPACITY: usize = 256;
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

pub struct EventListener {
    adapter: Arc<dyn RuntimeAdapter>,
    store: Arc<StateStore>,
    notifier: Arc<dyn NotificationSink>,
    metrics: Arc<HealingMetrics>,
    cancellation: CancellationToken,
    /// Stable ids already reported as "matched label but excluded" this
    /// process lifetime, so a restart-looping excluded container emits the
    /// info event once rather than on every start event.
    excluded_notified: Mutex<HashSet<String>>,
}

impl EventListener {
    pub fn new(
        adapter: Arc<dyn RuntimeAdapter>,
        store: Arc<StateStore>,
        notifier: Arc<dyn NotificationSink>,
        metrics: Arc<HealingMetrics>,
        cancellation: CancellationToken,
    ) -> Self {
        EventListener {
            adapter,
            store,
            notifier,
            metrics,
            cancellation,
            excluded_notified: Mutex::new(HashSet::new()),
        }
    }

    pub async fn run(self) {
        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);

        let producer_adapter = Arc::clone(&self.adapter);
        let producer_cancellation = self.cancellation.clone();
        tokio::spawn(async move {
            Self::produce(producer_adapter, tx, producer_cancellation).await;
        });

        loop {
            if self.cancellation.is_cancelled() {
                break;
            }
            match tokio::time::timeout(DEQUEUE_TIMEOUT, rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event).await,
                Ok(None) => break,
                Err(_) => continue,
            }
        }
    }

    async fn produce(
        adapter: Arc<dyn RuntimeAdapter>,
        tx: mpsc::Sender<crate::runtime::RuntimeEvent>,
        cancellation: CancellationToken,
    ) {
        let mut backoff = Duration::from_secs(1);
        loop {
            if cancellation.is_cancelled() {
                return;
            }
            let mut stream = adapter.events();
            let mut saw_item = false;
            loop {
                tokio::select! {
                    next = stream.next() => {
                        match next {
                            Some(Ok(event)) => {
                                saw_item = true;
                                backoff = Duration::from_secs(1);
                                if event.is_container_start() {
                                    // Non-critical: a full queue means the
                                    // next scheduler tick will reconcile.
                                    let _ = tx.try_send(event);
                                }
                            }
                            Some(Err(e)) => {
                                log::warn!("runtime event stream error: {e}");
                                break;
                            }
                            None => {
                                log::warn!("runtime event stream ended");
                                break;
                            }
                        }
                    }
                    _ = cancellation.cancelled() => return,
                }
            }
            if !saw_item {
                backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancellation.cancelled() => return,
            }
        }
    }

    async fn handle_event(&self, event: crate::runtime::RuntimeEvent) {
        let snapshot = match self.adapter.inspect(&event.container_id).await {
            Ok(s) => s,
            Err(e) => {
                log::debug!("could not inspect started container {}: {e}", event.container_id);
                return;
            }
        };
        let stable_id = resolve_stable_id(&snapshot);
        let ephemeral_ids = [snapshot.short_id.clone(), snapshot.long_id.clone()];
        let config = self.store.configuration();

        let matches_label = snapshot
            .labels
            .get(&config.monitor.label_key)
            .map(|v| v == &config.monitor.label_value)
            .unwrap_or(false);
        if !matches_label {
            return;
        }

        if self.store.is_excluded(&stable_id, &ephemeral_ids) {
            // Emitted once per stable id per process lifetime so a
            // restart-looping excluded container doesn't spam the log.
            let first_time = self.excluded_notified.lock().unwrap().insert(stable_id.clone());
            if first_time {
                let record = store::event(
                    stable_id,
                    snapshot.long_id,
                    EventKind::AutoMonitor,
                    EventStatus::Info,
                    self.store.total_restart_count(&event.container_id),
                    "matched auto-monitor label but is explicitly excluded".to_string(),
                );
                self.notifier.notify(&record);
                self.store.append_event(record);
            }
            return;
        }

        if self.store.is_selected(&stable_id, &ephemeral_ids) {
            return;
        }

        self.store.select(&stable_id);
        self.metrics.record_auto_monitor(&stable_id);
        let record = store::event(
            stable_id.clone(),
            snapshot.long_id,
            EventKind::AutoMonitor,
            EventStatus::Success,
            self.store.total_restart_count(&stable_id),
            format!(
                "auto-monitored via label {}={}",
                config.monitor.label_key, config.monitor.label_value
            ),
        );
        self.notifier.notify(&record);
        self.store.append_event(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::notify::NoopSink;
    use crate::runtime::{AdapterError, ContainerStatus, EventStream, HealthStatus, RuntimeEvent, Snapshot};
    use async_trait::async_trait;
    use chrono::Utc;
    use futures::stream;
    use std::collections::HashMap;

    struct SingleContainerAdapter(Snapshot);

    #[async_trait]
    impl RuntimeAdapter for SingleContainerAdapter {
        async fn list(&self, _include_stopped: bool) -> Result<Vec<Snapshot>, AdapterError> {
            Ok(vec![self.0.clone()])
        }
        async fn inspect(&self, _id_or_name: &str) -> Result<Snapshot, AdapterError> {
            Ok(self.0.clone())
        }
        async fn restart(&self, _long_id: &str, _timeout: Duration) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn probe_exec(
            &self,
            _long_id: &str,
            _argv: &[String],
            _expected_exit_code: i64,
            _timeout: Duration,
        ) -> Result<(), AdapterError> {
            Ok(())
        }
        fn events(&self) -> EventStream {
            Box::pin(stream::empty())
        }
    }

    fn labeled_snapshot(key: &str, value: &str) -> Snapshot {
        let mut labels = HashMap::new();
        labels.insert(key.to_string(), value.to_string());
        Snapshot {
            long_id: "ctr1".to_string(),
            short_id: "ctr1".to_string(),
            name: "/app".to_string(),
            labels,
            compose_project: None,
            compose_service: None,
            status: ContainerStatus::Running,
            exit_code: None,
            health: HealthStatus::None,
            started_at: None,
            finished_at: None,
            restart_policy_name: None,
            max_retry_count: None,
        }
    }

    fn start_event() -> RuntimeEvent {
        RuntimeEvent {
            event_type: "container".to_string(),
            action: "start".to_string(),
            container_id: "ctr1".to_string(),
            labels_snapshot: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    fn listener_with(adapter: SingleContainerAdapter, store: Arc<StateStore>) -> EventListener {
        EventListener::new(
            Arc::new(adapter),
            store,
            Arc::new(NoopSink),
            Arc::new(Metrics::new().unwrap().healing_metrics()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn selects_container_matching_label() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::load(dir.path()));
        let adapter = SingleContainerAdapter(labeled_snapshot("autoheal", "true"));
        let listener = listener_with(adapter, Arc::clone(&store));

        listener.handle_event(start_event()).await;

        assert!(store.is_selected("app", &[]));
    }

    #[tokio::test]
    async fn ignores_container_without_matching_label() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::load(dir.path()));
        let adapter = SingleContainerAdapter(labeled_snapshot("other", "true"));
        let listener = listener_with(adapter, Arc::clone(&store));

        listener.handle_event(start_event()).await;

        assert!(!store.is_selected("app", &[]));
    }

    #[tokio::test]
    async fn does_not_select_an_explicitly_excluded_container() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::load(dir.path()));
        store.exclude("app");
        let adapter = SingleContainerAdapter(labeled_snapshot("autoheal", "true"));
        let listener = listener_with(adapter, Arc::clone(&store));

        listener.handle_event(start_event()).await;

        assert!(!store.is_selected("app", &[]));
        assert!(store.is_excluded("app", &[]));
    }

    #[tokio::test]
    async fn excluded_container_info_event_is_emitted_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::load(dir.path()));
        store.exclude("app");
        let adapter = SingleContainerAdapter(labeled_snapshot("autoheal", "true"));
        let listener = listener_with(adapter, Arc::clone(&store));

        listener.handle_event(start_event()).await;
        listener.handle_event(start_event()).await;
        listener.handle_event(start_event()).await;

        let info_events = store
            .event_log(None)
            .into_iter()
            .filter(|e| e.kind == EventKind::AutoMonitor && e.status == EventStatus::Info)
            .count();
        assert_eq!(info_events, 1, "excluded-container notice must only be emitted once");
    }

    #[tokio::test]
    async fn legacy_ephemeral_id_selection_is_migrated_to_stable_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::load(dir.path()));
        // Simulate an older persisted selection keyed by the runtime id.
        store.select("ctr1");
        let ephemeral_ids = vec!["ctr1".to_string()];

        assert!(store.is_selected("app", &ephemeral_ids));
        assert!(store.is_selected("app", &[]));
        assert!(!store.is_selected("ctr1", &[]));
    }
}
