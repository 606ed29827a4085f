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

//! Derivation of the stable identifier used as the primary key for all
//! per-container state, independent of the runtime-assigned ephemeral id.

use crate::runtime::Snapshot;

pub const MONITORING_ID_LABEL: &str = "monitoring.id";
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// Derives the stable id for a snapshot. First match wins:
/// explicit `monitoring.id` label, compose project+service pair,
/// container name, then the long-form ephemeral id as a last resort.
pub fn resolve_stable_id(snapshot: &Snapshot) -> String {
    if let Some(id) = snapshot
        .labels
        .get(MONITORING_ID_LABEL)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
    {
        return id.to_string();
    }

    if let (Some(project), Some(service)) = (
        snapshot
            .labels
            .get(COMPOSE_PROJECT_LABEL)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty()),
        snapshot
            .labels
            .get(COMPOSE_SERVICE_LABEL)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty()),
    ) {
        return format!("{project}_{service}");
    }

    let name = snapshot.name.trim_start_matches('/');
    if !name.is_empty() {
        return name.to_string();
    }

    snapshot.long_id.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerStatus, HealthStatus};
    use std::collections::HashMap;

    fn snapshot(labels: HashMap<String, String>, name: &str, long_id: &str) -> Snapshot {
        Snapshot {
            long_id: long_id.to_string(),
            short_id: long_id.chars().take(12).collect(),
            name: name.to_string(),
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

    #[test]
    fn prefers_monitoring_id_label() {
        let mut labels = HashMap::new();
        labels.insert(MONITORING_ID_LABEL.to_string(), "explicit-id".to_string());
        labels.insert(COMPOSE_PROJECT_LABEL.to_string(), "proj".to_string());
        labels.insert(COMPOSE_SERVICE_LABEL.to_string(), "svc".to_string());
        let snap = snapshot(labels, "/container_name", "abcdef0123456789");
        assert_eq!(resolve_stable_id(&snap), "explicit-id");
    }

    #[test]
    fn falls_back_to_compose_project_and_service() {
        let mut labels = HashMap::new();
        labels.insert(COMPOSE_PROJECT_LABEL.to_string(), "proj".to_string());
        labels.insert(COMPOSE_SERVICE_LABEL.to_string(), "svc".to_string());
        let snap = snapshot(labels, "/container_name", "abcdef0123456789");
        assert_eq!(resolve_stable_id(&snap), "proj_svc");
    }

    #[test]
    fn falls_back_to_name_with_separator_stripped() {
        let snap = snapshot(HashMap::new(), "/my-app", "abcdef0123456789");
        assert_eq!(resolve_stable_id(&snap), "my-app");
    }

    #[test]
    fn falls_back_to_long_id_when_nothing_else_present() {
        let snap = snapshot(HashMap::new(), "", "abcdef0123456789");
        assert_eq!(resolve_stable_id(&snap), "abcdef0123456789");
    }

    #[test]
    fn ignores_blank_label_values() {
        let mut labels = HashMap::new();
        labels.insert(MONITORING_ID_LABEL.to_string(), "   ".to_string());
        let snap = snapshot(labels, "/fallback-name", "abcdef0123456789");
        assert_eq!(resolve_stable_id(&snap), "fallback-name");
    }
}
