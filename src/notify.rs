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

//! The fan-out point for event records. Concrete delivery backends
//! (webhook, email, Slack, ...) are out of scope for the core; this gives
//! them a single trait to implement against.

use crate::store::model::EventRecord;

pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &EventRecord);
}

/// The default sink: drop everything. Useful when no dispatcher is wired
/// up and the control surface is the only consumer of the event log.
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify(&self, _event: &EventRecord) {}
}

/// Logs every event at a level derived from its status. Handy during
/// development, or as a fallback when a real dispatcher isn't configured.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, event: &EventRecord) {
        use crate::store::model::EventStatus;
        match event.status {
            EventStatus::Failure => {
                log::warn!(
                    "[{:?}] {} ({}): {}",
                    event.kind,
                    event.stable_id,
                    event.ephemeral_id,
                    event.message
                );
            }
            _ => {
                log::info!(
                    "[{:?}] {} ({}): {}",
                    event.kind,
                    event.stable_id,
                    event.ephemeral_id,
                    event.message
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::{EventKind, EventStatus};
    use chrono::Utc;

    #[test]
    fn noop_sink_does_not_panic() {
        let sink = NoopSink;
        sink.notify(&EventRecord {
            timestamp: Utc::now(),
            stable_id: "app".to_string(),
            ephemeral_id: "abc".to_string(),
            kind: EventKind::Restart,
            status: EventStatus::Success,
            restart_count: 1,
            message: "ok".to_string(),
        });
    }
}
