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

//! The single process-wide lock guarding every persistent fact: selection
//! sets, quarantine membership, restart records, custom probes, the event
//! log, and maintenance state. Readers proceed concurrently; every
//! mutation is serialized and, on the happy path, durably written before
//! the lock is released.

pub mod model;
pub mod persistence;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::{Configuration, ConfigValidationError};
use model::{
    ConfigDocument, ContainersSection, CustomProbe, EventKind, EventRecord, EventStatus,
    MaintenanceState, RestartRecord,
};

const CONFIG_FILE: &str = "config.json";
const EVENTS_FILE: &str = "events.json";
const RESTART_COUNTS_FILE: &str = "restart_counts.json";
const QUARANTINE_FILE: &str = "quarantine.json";
const MAINTENANCE_FILE: &str = "maintenance.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid configuration: {0}")]
    Validation(#[from] ConfigValidationError),
    #[error("io error persisting state: {0}")]
    Io(String),
}

struct Inner {
    config: Configuration,
    selected: HashSet<String>,
    excluded: HashSet<String>,
    custom_probes: HashMap<String, CustomProbe>,
    restart_records: HashMap<String, RestartRecord>,
    quarantine: HashSet<String>,
    events: VecDeque<EventRecord>,
    maintenance: MaintenanceState,
}

pub struct StateStore {
    data_dir: PathBuf,
    inner: RwLock<Inner>,
}

impl StateStore {
    pub fn load(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let doc: ConfigDocument =
            persistence::read_json_or_default(&data_dir.join(CONFIG_FILE));
        let quarantine: Vec<String> =
            persistence::read_json_or_default(&data_dir.join(QUARANTINE_FILE));
        let maintenance: MaintenanceState =
            persistence::read_json_or_default(&data_dir.join(MAINTENANCE_FILE));
        let legacy_timestamps: HashMap<String, Vec<DateTime<Utc>>> =
            persistence::read_json_or_default(&data_dir.join(RESTART_COUNTS_FILE));

        let mut restart_records: HashMap<String, RestartRecord> = HashMap::new();
        for (id, timestamps) in legacy_timestamps {
            restart_records.entry(id).or_default().timestamps = timestamps;
        }
        for (id, total) in &doc.containers.restart_counts {
            let record = restart_records.entry(id.clone()).or_default();
            // The integer total must never regress: take the larger of the
            // two legacy sources and the derived timestamp-list length.
            record.total = record.total.max(*total).max(record.timestamps.len() as u64);
        }
        for record in restart_records.values_mut() {
            record.total = record.total.max(record.timestamps.len() as u64);
        }

        let events: VecDeque<EventRecord> =
            persistence::read_json_or_default::<Vec<EventRecord>>(&data_dir.join(EVENTS_FILE))
                .into();

        let inner = Inner {
            config: doc.configuration,
            selected: doc.containers.selected,
            excluded: doc.containers.excluded,
            custom_probes: doc.custom_health_checks,
            restart_records,
            quarantine: quarantine.into_iter().collect(),
            events,
            maintenance,
        };

        StateStore {
            data_dir,
            inner: RwLock::new(inner),
        }
    }

    fn persist_config(&self, inner: &Inner) -> Result<(), StoreError> {
        let doc = ConfigDocument {
            configuration: inner.config.clone(),
            containers: ContainersSection {
                selected: inner.selected.clone(),
                excluded: inner.excluded.clone(),
                restart_counts: inner
                    .restart_records
                    .iter()
                    .map(|(id, r)| (id.clone(), r.total))
                    .collect(),
            },
            custom_health_checks: inner.custom_probes.clone(),
        };
        persistence::write_json_atomic(&self.data_dir.join(CONFIG_FILE), &doc)
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn persist_events(&self, inner: &Inner) -> Result<(), StoreError> {
        let events: Vec<&EventRecord> = inner.events.iter().collect();
        persistence::write_json_atomic(&self.data_dir.join(EVENTS_FILE), &events)
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn persist_restart_counts(&self, inner: &Inner) -> Result<(), StoreError> {
        let map: HashMap<&String, &Vec<DateTime<Utc>>> = inner
            .restart_records
            .iter()
            .map(|(id, r)| (id, &r.timestamps))
            .collect();
        persistence::write_json_atomic(&self.data_dir.join(RESTART_COUNTS_FILE), &map)
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn persist_quarantine(&self, inner: &Inner) -> Result<(), StoreError> {
        let ids: Vec<&String> = inner.quarantine.iter().collect();
        persistence::write_json_atomic(&self.data_dir.join(QUARANTINE_FILE), &ids)
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn persist_maintenance(&self, inner: &Inner) -> Result<(), StoreError> {
        persistence::write_json_atomic(&self.data_dir.join(MAINTENANCE_FILE), &inner.maintenance)
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    /// Logs and swallows an `io_error`: in-memory state already reflects
    /// the mutation, so the store stays live even if the disk write
    /// failed. The affected record is rewritten on the next mutation.
    fn persist_or_warn(&self, result: Result<(), StoreError>, what: &str) {
        if let Err(e) = result {
            log::warn!("failed to persist {what}: {e}");
        }
    }

    // ---- configuration ----

    pub fn configuration(&self) -> Configuration {
        self.inner.read().unwrap().config.clone()
    }

    pub fn set_configuration(&self, config: Configuration) -> Result<(), StoreError> {
        config.validate_structural()?;
        let mut inner = self.inner.write().unwrap();
        inner.config = config;
        self.persist_or_warn(self.persist_config(&inner), CONFIG_FILE);
        Ok(())
    }

    pub fn update_monitor(
        &self,
        f: impl FnOnce(&mut crate::config::MonitorConfig),
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let mut candidate = inner.config.clone();
        f(&mut candidate.monitor);
        candidate.validate_structural()?;
        inner.config = candidate;
        self.persist_or_warn(self.persist_config(&inner), CONFIG_FILE);
        Ok(())
    }

    pub fn update_restart(
        &self,
        f: impl FnOnce(&mut crate::config::RestartConfig),
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let mut candidate = inner.config.clone();
        f(&mut candidate.restart);
        candidate.validate_structural()?;
        inner.config = candidate;
        self.persist_or_warn(self.persist_config(&inner), CONFIG_FILE);
        Ok(())
    }

    pub fn update_backoff(
        &self,
        f: impl FnOnce(&mut crate::config::BackoffConfig),
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let mut candidate = inner.config.clone();
        f(&mut candidate.backoff);
        candidate.validate_structural()?;
        inner.config = candidate;
        self.persist_or_warn(self.persist_config(&inner), CONFIG_FILE);
        Ok(())
    }

    pub fn update_observability(
        &self,
        f: impl FnOnce(&mut crate::config::ObservabilityConfig),
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let mut candidate = inner.config.clone();
        f(&mut candidate.observability);
        candidate.validate_structural()?;
        inner.config = candidate;
        self.persist_or_warn(self.persist_config(&inner), CONFIG_FILE);
        Ok(())
    }

    pub fn update_ui(&self, f: impl FnOnce(&mut crate::config::UiConfig)) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let mut candidate = inner.config.clone();
        f(&mut candidate.ui);
        candidate.validate_structural()?;
        inner.config = candidate;
        self.persist_or_warn(self.persist_config(&inner), CONFIG_FILE);
        self.truncate_events_locked(&mut inner);
        Ok(())
    }

    // ---- selection ----

    pub fn selection_sets(&self) -> (HashSet<String>, HashSet<String>) {
        let inner = self.inner.read().unwrap();
        (inner.selected.clone(), inner.excluded.clone())
    }

    /// Checks selection membership by stable id, also accepting a legacy
    /// hit under one of `ephemeral_ids` (a container's short/long runtime
    /// id) left over from older persisted entries; such a hit is rewritten
    /// under the stable id on this first touch, per §3's legacy-key
    /// migration invariant.
    pub fn is_selected(&self, stable_id: &str, ephemeral_ids: &[String]) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.selected.contains(stable_id) {
            return true;
        }
        match ephemeral_ids.iter().find(|id| inner.selected.contains(id.as_str())).cloned() {
            Some(legacy) => {
                inner.selected.remove(&legacy);
                inner.selected.insert(stable_id.to_string());
                self.persist_or_warn(self.persist_config(&inner), CONFIG_FILE);
                true
            }
            None => false,
        }
    }

    pub fn is_excluded(&self, stable_id: &str, ephemeral_ids: &[String]) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.excluded.contains(stable_id) {
            return true;
        }
        match ephemeral_ids.iter().find(|id| inner.excluded.contains(id.as_str())).cloned() {
            Some(legacy) => {
                inner.excluded.remove(&legacy);
                inner.excluded.insert(stable_id.to_string());
                self.persist_or_warn(self.persist_config(&inner), CONFIG_FILE);
                true
            }
            None => false,
        }
    }

    /// Adding to one set always removes from the other: the two sets are
    /// never allowed to both contain the same id.
    pub fn select(&self, stable_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.excluded.remove(stable_id);
        inner.selected.insert(stable_id.to_string());
        self.persist_or_warn(self.persist_config(&inner), CONFIG_FILE);
    }

    pub fn deselect(&self, stable_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.selected.remove(stable_id);
        self.persist_or_warn(self.persist_config(&inner), CONFIG_FILE);
    }

    pub fn exclude(&self, stable_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.selected.remove(stable_id);
        inner.excluded.insert(stable_id.to_string());
        self.persist_or_warn(self.persist_config(&inner), CONFIG_FILE);
    }

    pub fn unexclude(&self, stable_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.excluded.remove(stable_id);
        self.persist_or_warn(self.persist_config(&inner), CONFIG_FILE);
    }

    // ---- custom probes ----

    pub fn custom_probe(&self, stable_id: &str) -> Option<CustomProbe> {
        self.inner.read().unwrap().custom_probes.get(stable_id).cloned()
    }

    pub fn set_custom_probe(&self, stable_id: &str, probe: CustomProbe) {
        let mut inner = self.inner.write().unwrap();
        inner.custom_probes.insert(stable_id.to_string(), probe);
        self.persist_or_warn(self.persist_config(&inner), CONFIG_FILE);
    }

    pub fn remove_custom_probe(&self, stable_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.custom_probes.remove(stable_id);
        self.persist_or_warn(self.persist_config(&inner), CONFIG_FILE);
    }

    // ---- restart records ----

    pub fn total_restart_count(&self, stable_id: &str) -> u64 {
        self.inner
            .read()
            .unwrap()
            .restart_records
            .get(stable_id)
            .map(|r| r.total)
            .unwrap_or(0)
    }

    /// Prunes timestamps older than `window` and returns the count that
    /// remain, i.e. the windowed count used by the rate limiter.
    pub fn recent_restart_count(&self, stable_id: &str, window: Duration, now: DateTime<Utc>) -> u32 {
        let mut inner = self.inner.write().unwrap();
        let Some(record) = inner.restart_records.get_mut(stable_id) else {
            return 0;
        };
        let cutoff = now - chrono::Duration::from_std(window).unwrap_or_default();
        record.timestamps.retain(|t| *t >= cutoff);
        record.timestamps.len() as u32
    }

    pub fn last_restart_time(&self, stable_id: &str) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .unwrap()
            .restart_records
            .get(stable_id)
            .and_then(|r| r.timestamps.iter().max().copied())
    }

    /// Records an acknowledged restart attempt. The timestamp counts
    /// against the rate limit even if the runtime call ultimately failed,
    /// per the "attempt counts" error-handling rule.
    pub fn record_restart(&self, stable_id: &str, at: DateTime<Utc>) -> u64 {
        let mut inner = self.inner.write().unwrap();
        let record = inner.restart_records.entry(stable_id.to_string()).or_default();
        record.timestamps.push(at);
        record.timestamps.sort_unstable();
        record.total += 1;
        let total = record.total;
        self.persist_or_warn(self.persist_restart_counts(&inner), RESTART_COUNTS_FILE);
        self.persist_or_warn(self.persist_config(&inner), CONFIG_FILE);
        total
    }

    // ---- quarantine ----

    pub fn quarantine_set(&self) -> HashSet<String> {
        self.inner.read().unwrap().quarantine.clone()
    }

    /// Checks quarantine membership by stable id, also accepting a legacy
    /// hit under one of `ephemeral_ids`; such a hit is rewritten under the
    /// stable id on this first touch, same as `is_selected`/`is_excluded`.
    pub fn is_quarantined(&self, stable_id: &str, ephemeral_ids: &[String]) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.quarantine.contains(stable_id) {
            return true;
        }
        match ephemeral_ids.iter().find(|id| inner.quarantine.contains(id.as_str())).cloned() {
            Some(legacy) => {
                inner.quarantine.remove(&legacy);
                inner.quarantine.insert(stable_id.to_string());
                self.persist_or_warn(self.persist_quarantine(&inner), QUARANTINE_FILE);
                true
            }
            None => false,
        }
    }

    pub fn quarantine(&self, stable_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.quarantine.insert(stable_id.to_string());
        self.persist_or_warn(self.persist_quarantine(&inner), QUARANTINE_FILE);
    }

    pub fn unquarantine(&self, stable_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.quarantine.remove(stable_id);
        self.persist_or_warn(self.persist_quarantine(&inner), QUARANTINE_FILE);
    }

    // ---- events ----

    fn truncate_events_locked(&self, inner: &mut Inner) {
        let max = inner.config.ui.max_log_entries;
        while inner.events.len() > max {
            inner.events.pop_front();
        }
    }

    pub fn append_event(&self, event: EventRecord) {
        let mut inner = self.inner.write().unwrap();
        inner.events.push_back(event);
        self.truncate_events_locked(&mut inner);
        self.persist_or_warn(self.persist_events(&inner), EVENTS_FILE);
    }

    pub fn event_log(&self, limit: Option<usize>) -> Vec<EventRecord> {
        let inner = self.inner.read().unwrap();
        match limit {
            Some(n) => inner.events.iter().rev().take(n).rev().cloned().collect(),
            None => inner.events.iter().cloned().collect(),
        }
    }

    pub fn clear_events(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.events.clear();
        self.persist_or_warn(self.persist_events(&inner), EVENTS_FILE);
    }

    // ---- maintenance ----

    pub fn maintenance_state(&self) -> MaintenanceState {
        self.inner.read().unwrap().maintenance.clone()
    }

    pub fn set_maintenance(&self, enabled: bool, now: DateTime<Utc>) {
        let mut inner = self.inner.write().unwrap();
        inner.maintenance.enabled = enabled;
        inner.maintenance.start_time = if enabled { Some(now) } else { None };
        self.persist_or_warn(self.persist_maintenance(&inner), MAINTENANCE_FILE);
    }

    // ---- housekeeping ----

    /// Drops `selected`/`excluded`/custom-probe rows whose stable id is not
    /// in `live_ids`. Restart records are never pruned here (historical
    /// counts survive transient disappearance), and quarantine membership
    /// is never pruned here either: §3 makes quarantine sticky across
    /// recreation, which takes priority over the general "prune stale
    /// entries" wording — see DESIGN.md.
    pub fn garbage_collect(&self, live_ids: &HashSet<String>) {
        let mut inner = self.inner.write().unwrap();
        let before = (inner.selected.len(), inner.excluded.len(), inner.custom_probes.len());
        inner.selected.retain(|id| live_ids.contains(id));
        inner.excluded.retain(|id| live_ids.contains(id));
        inner.custom_probes.retain(|id, _| live_ids.contains(id));
        let after = (inner.selected.len(), inner.excluded.len(), inner.custom_probes.len());
        if before != after {
            self.persist_or_warn(self.persist_config(&inner), CONFIG_FILE);
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

pub fn event(
    stable_id: impl Into<String>,
    ephemeral_id: impl Into<String>,
    kind: EventKind,
    status: EventStatus,
    restart_count: u64,
    message: impl Into<String>,
) -> EventRecord {
    EventRecord {
        timestamp: Utc::now(),
        stable_id: stable_id.into(),
        ephemeral_id: ephemeral_id.into(),
        kind,
        status,
        restart_count,
        message: message.into(),
    }
}
