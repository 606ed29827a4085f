use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use autoheal_engine::runtime::{AdapterError, EventStream, RuntimeAdapter, Snapshot};
use futures::stream;

/// An in-memory stand-in for the container runtime. Containers are keyed by
/// their ephemeral (`long_id`) id; `restart` just bumps a counter so tests
/// can assert how many times a given container was actually restarted.
pub struct FakeAdapter {
    containers: Mutex<HashMap<String, Snapshot>>,
    restart_counts: Mutex<HashMap<String, u32>>,
    fail_restarts: Mutex<bool>,
}

impl FakeAdapter {
    pub fn new(snapshots: Vec<Snapshot>) -> Self {
        let containers = snapshots.into_iter().map(|s| (s.long_id.clone(), s)).collect();
        FakeAdapter {
            containers: Mutex::new(containers),
            restart_counts: Mutex::new(HashMap::new()),
            fail_restarts: Mutex::new(false),
        }
    }

    pub fn set_fail_restarts(&self, fail: bool) {
        *self.fail_restarts.lock().unwrap() = fail;
    }

    pub fn restart_count(&self, long_id: &str) -> u32 {
        *self.restart_counts.lock().unwrap().get(long_id).unwrap_or(&0)
    }

    /// Replaces a container's snapshot in place, e.g. to simulate it
    /// transitioning from healthy to unhealthy between ticks.
    pub fn update(&self, snapshot: Snapshot) {
        self.containers.lock().unwrap().insert(snapshot.long_id.clone(), snapshot);
    }

    /// Removes a container and re-inserts it under a new ephemeral id with
    /// the same labels/name, simulating a compose-style recreation.
    pub fn recreate(&self, old_long_id: &str, new_long_id: &str) {
        let mut guard = self.containers.lock().unwrap();
        if let Some(mut snapshot) = guard.remove(old_long_id) {
            snapshot.long_id = new_long_id.to_string();
            snapshot.short_id = new_long_id.chars().take(12).collect();
            guard.insert(new_long_id.to_string(), snapshot);
        }
    }
}

#[async_trait]
impl RuntimeAdapter for FakeAdapter {
    async fn list(&self, _include_stopped: bool) -> Result<Vec<Snapshot>, AdapterError> {
        Ok(self.containers.lock().unwrap().values().cloned().collect())
    }

    async fn inspect(&self, id_or_name: &str) -> Result<Snapshot, AdapterError> {
        self.containers
            .lock()
            .unwrap()
            .values()
            .find(|s| s.long_id == id_or_name || s.name == id_or_name)
            .cloned()
            .ok_or(AdapterError::NotFound)
    }

    async fn restart(&self, long_id: &str, _timeout: Duration) -> Result<(), AdapterError> {
        if !self.containers.lock().unwrap().contains_key(long_id) {
            return Err(AdapterError::NotFound);
        }
        *self.restart_counts.lock().unwrap().entry(long_id.to_string()).or_insert(0) += 1;
        if *self.fail_restarts.lock().unwrap() {
            return Err(AdapterError::Other("simulated restart failure".to_string()));
        }
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

pub fn snapshot(
    long_id: &str,
    name: &str,
    status: autoheal_engine::runtime::ContainerStatus,
    health: autoheal_engine::runtime::HealthStatus,
    exit_code: Option<i64>,
    labels: HashMap<String, String>,
) -> Snapshot {
    Snapshot {
        long_id: long_id.to_string(),
        short_id: long_id.chars().take(12).collect(),
        name: name.to_string(),
        labels,
        compose_project: None,
        compose_service: None,
        status,
        exit_code,
        health,
        started_at: None,
        finished_at: None,
        restart_policy_name: None,
        max_retry_count: None,
    }
}
