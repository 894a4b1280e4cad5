use std::time::Duration;

use crate::error::EndReason;
use crate::task::TaskName;

/// Session-level counters and durations. Methods default to no-ops.
pub trait SessionTelemetry: Send + Sync {
    fn on_session_start(&self, call_sid: &str) {
        let _ = call_sid;
    }

    fn on_session_end(&self, call_sid: &str, reason: &EndReason, duration: Duration) {
        let _ = (call_sid, reason, duration);
    }

    fn on_task(&self, name: TaskName, duration: Duration, ok: bool) {
        let _ = (name, duration, ok);
    }
}

#[derive(Debug, Default)]
pub struct NoopSessionTelemetry;

impl SessionTelemetry for NoopSessionTelemetry {}
