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

//! Pure decision logic: no I/O, no locking. Given a snapshot and the
//! per-id state the caller already gathered, decides whether to skip,
//! restart, or quarantine.

use chrono::{DateTime, Utc};

use crate::config::{Configuration, RestartMode};
use crate::runtime::{ContainerStatus, HealthStatus, Snapshot};
use crate::store::model::CustomProbe;

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Skip { reason: String },
    Restart { reason: String },
    Quarantine { reason: String },
}

pub struct EvaluationInput<'a> {
    pub snapshot: &'a Snapshot,
    pub config: &'a Configuration,
    pub quarantined: bool,
    pub last_restart_time: Option<DateTime<Utc>>,
    pub recent_restart_count: u32,
    pub custom_probe: Option<&'a CustomProbe>,
    /// Consecutive failures observed so far for the custom probe, supplied
    /// by the scheduler after it actually ran the probe this tick.
    pub custom_probe_consecutive_failures: u32,
}

fn health_gated(mode: &RestartMode) -> bool {
    matches!(mode, RestartMode::Health | RestartMode::Both)
}

fn exit_code_gated(mode: &RestartMode) -> bool {
    matches!(mode, RestartMode::OnFailure | RestartMode::Both)
}

pub fn evaluate(input: &EvaluationInput, now: DateTime<Utc>) -> Decision {
    if input.quarantined {
        return Decision::Skip {
            reason: "quarantined".to_string(),
        };
    }

    let probe_pending = input.custom_probe.is_some() && input.custom_probe_consecutive_failures > 0;

    let snapshot = input.snapshot;
    let non_terminal = matches!(
        snapshot.status,
        ContainerStatus::Running
            | ContainerStatus::Restarting
            | ContainerStatus::Paused
            | ContainerStatus::Created
            | ContainerStatus::Removing
    );

    if non_terminal && snapshot.health != HealthStatus::Unhealthy && !probe_pending {
        return Decision::Skip {
            reason: "healthy".to_string(),
        };
    }

    let candidate_reason: Option<String> = if snapshot.status.is_stopped() {
        let exit_code = snapshot.exit_code.unwrap_or(-1);
        if exit_code == 0 && input.config.restart.respect_manual_stop {
            return Decision::Skip {
                reason: "manual stop (exit 0)".to_string(),
            };
        }
        if exit_code_gated(&input.config.restart.mode) {
            if exit_code == 0 {
                Some("stopped (exit 0)".to_string())
            } else {
                Some(format!("exited with code {exit_code}"))
            }
        } else {
            None
        }
    } else if snapshot.status == ContainerStatus::Running
        && snapshot.health == HealthStatus::Unhealthy
        && health_gated(&input.config.restart.mode)
    {
        Some("health=unhealthy".to_string())
    } else {
        None
    };

    let candidate_reason = candidate_reason.or_else(|| {
        if let Some(probe) = input.custom_probe {
            if input.custom_probe_consecutive_failures >= probe.retries.max(1) {
                return Some("custom probe failed".to_string());
            }
        }
        None
    });

    let Some(reason) = candidate_reason else {
        return Decision::Skip {
            reason: "no action".to_string(),
        };
    };

    if input.recent_restart_count >= input.config.restart.max_restarts {
        return Decision::Quarantine {
            reason: format!(
                "max_restarts ({}) reached within {}s window",
                input.config.restart.max_restarts, input.config.restart.max_restarts_window_seconds
            ),
        };
    }

    if let Some(last) = input.last_restart_time {
        let cooldown = chrono::Duration::seconds(input.config.restart.cooldown_seconds as i64);
        let next_allowed = last + cooldown;
        if now < next_allowed {
            return Decision::Skip {
                reason: format!("cooldown until {next_allowed}"),
            };
        }
    }

    Decision::Restart { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use std::collections::HashMap;

    fn snapshot(status: ContainerStatus, health: HealthStatus, exit_code: Option<i64>) -> Snapshot {
        Snapshot {
            long_id: "abc123".to_string(),
            short_id: "abc123".to_string(),
            name: "app".to_string(),
            labels: HashMap::new(),
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

    fn base_input(snapshot: &Snapshot, config: &Configuration) -> EvaluationInput<'_> {
        EvaluationInput {
            snapshot,
            config,
            quarantined: false,
            last_restart_time: None,
            recent_restart_count: 0,
            custom_probe: None,
            custom_probe_consecutive_failures: 0,
        }
    }

    #[test]
    fn quarantined_containers_always_skip() {
        let snap = snapshot(ContainerStatus::Exited, HealthStatus::None, Some(1));
        let cfg = Configuration::default();
        let mut input = base_input(&snap, &cfg);
        input.quarantined = true;
        assert_eq!(
            evaluate(&input, Utc::now()),
            Decision::Skip {
                reason: "quarantined".to_string()
            }
        );
    }

    #[test]
    fn running_healthy_skips() {
        let snap = snapshot(ContainerStatus::Running, HealthStatus::Healthy, None);
        let cfg = Configuration::default();
        let input = base_input(&snap, &cfg);
        assert_eq!(
            evaluate(&input, Utc::now()),
            Decision::Skip {
                reason: "healthy".to_string()
            }
        );
    }

    #[test]
    fn exited_nonzero_is_a_restart_candidate() {
        let snap = snapshot(ContainerStatus::Exited, HealthStatus::None, Some(1));
        let cfg = Configuration::default();
        let input = base_input(&snap, &cfg);
        assert_eq!(
            evaluate(&input, Utc::now()),
            Decision::Restart {
                reason: "exited with code 1".to_string()
            }
        );
    }

    #[test]
    fn manual_stop_is_respected_when_configured() {
        let snap = snapshot(ContainerStatus::Exited, HealthStatus::None, Some(0));
        let mut cfg = Configuration::default();
        cfg.restart.respect_manual_stop = true;
        let input = base_input(&snap, &cfg);
        assert_eq!(
            evaluate(&input, Utc::now()),
            Decision::Skip {
                reason: "manual stop (exit 0)".to_string()
            }
        );
    }

    #[test]
    fn manual_stop_not_respected_restarts() {
        let snap = snapshot(ContainerStatus::Exited, HealthStatus::None, Some(0));
        let mut cfg = Configuration::default();
        cfg.restart.respect_manual_stop = false;
        let input = base_input(&snap, &cfg);
        assert_eq!(
            evaluate(&input, Utc::now()),
            Decision::Restart {
                reason: "stopped (exit 0)".to_string()
            }
        );
    }

    #[test]
    fn running_unhealthy_restarts_when_mode_allows() {
        let snap = snapshot(ContainerStatus::Running, HealthStatus::Unhealthy, None);
        let cfg = Configuration::default();
        let input = base_input(&snap, &cfg);
        assert_eq!(
            evaluate(&input, Utc::now()),
            Decision::Restart {
                reason: "health=unhealthy".to_string()
            }
        );
    }

    #[test]
    fn running_unhealthy_skipped_when_mode_is_on_failure_only() {
        let snap = snapshot(ContainerStatus::Running, HealthStatus::Unhealthy, None);
        let mut cfg = Configuration::default();
        cfg.restart.mode = RestartMode::OnFailure;
        let input = base_input(&snap, &cfg);
        assert_eq!(
            evaluate(&input, Utc::now()),
            Decision::Skip {
                reason: "no action".to_string()
            }
        );
    }

    #[test]
    fn exceeding_max_restarts_quarantines_instead_of_restarting() {
        let snap = snapshot(ContainerStatus::Exited, HealthStatus::None, Some(1));
        let mut cfg = Configuration::default();
        cfg.restart.max_restarts = 3;
        let mut input = base_input(&snap, &cfg);
        input.recent_restart_count = 3;
        match evaluate(&input, Utc::now()) {
            Decision::Quarantine { reason } => assert!(reason.contains("max_restarts")),
            other => panic!("expected quarantine, got {other:?}"),
        }
    }

    #[test]
    fn within_cooldown_skips() {
        let snap = snapshot(ContainerStatus::Exited, HealthStatus::None, Some(1));
        let mut cfg = Configuration::default();
        cfg.restart.cooldown_seconds = 60;
        let mut input = base_input(&snap, &cfg);
        input.last_restart_time = Some(Utc::now());
        match evaluate(&input, Utc::now()) {
            Decision::Skip { reason } => assert!(reason.starts_with("cooldown until")),
            other => panic!("expected cooldown skip, got {other:?}"),
        }
    }

    #[test]
    fn past_cooldown_restarts() {
        let snap = snapshot(ContainerStatus::Exited, HealthStatus::None, Some(1));
        let mut cfg = Configuration::default();
        cfg.restart.cooldown_seconds = 60;
        let mut input = base_input(&snap, &cfg);
        input.last_restart_time = Some(Utc::now() - chrono::Duration::seconds(120));
        assert_eq!(
            evaluate(&input, Utc::now()),
            Decision::Restart {
                reason: "exited with code 1".to_string()
            }
        );
    }

    #[test]
    fn custom_probe_pending_failure_blocks_healthy_fast_skip() {
        let snap = snapshot(ContainerStatus::Running, HealthStatus::Healthy, None);
        let cfg = Configuration::default();
        let probe = CustomProbe {
            retries: 3,
            ..Default::default()
        };
        let mut input = base_input(&snap, &cfg);
        input.custom_probe = Some(&probe);
        input.custom_probe_consecutive_failures = 1;
        assert_eq!(
            evaluate(&input, Utc::now()),
            Decision::Skip {
                reason: "no action".to_string()
            }
        );
    }

    #[test]
    fn custom_probe_failing_enough_times_restarts() {
        let snap = snapshot(ContainerStatus::Running, HealthStatus::Healthy, None);
        let cfg = Configuration::default();
        let probe = CustomProbe {
            retries: 3,
            ..Default::default()
        };
        let mut input = base_input(&snap, &cfg);
        input.custom_probe = Some(&probe);
        input.custom_probe_consecutive_failures = 3;
        assert_eq!(
            evaluate(&input, Utc::now()),
            Decision::Restart {
                reason: "custom probe failed".to_string()
            }
        );
    }
}
