use std::time::Duration;

use jambonz_protocol::MessageType;

/// Observation seam for transport timings. All methods default to no-ops so
/// implementations only override what they record.
pub trait RequestorTelemetry: Send + Sync {
    /// A webhook request completed (HTTP round-trip or WS send+ack).
    fn on_webhook(&self, kind: MessageType, duration: Duration, ok: bool) {
        let _ = (kind, duration, ok);
    }

    /// A WebSocket connect attempt finished.
    fn on_connect(&self, duration: Duration, ok: bool) {
        let _ = (duration, ok);
    }

    /// An ack arrived for an in-flight message.
    fn on_ack(&self, duration: Duration) {
        let _ = duration;
    }
}

#[derive(Debug, Default)]
pub struct NoopTelemetry;

impl RequestorTelemetry for NoopTelemetry {}
