use tracing::warn;

/// User-visible operational problems. Emitted at most once per occurrence
/// and never allowed to block the call path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    WebhookConnectionFailure,
    WebhookStatusFailure,
    InvalidAppPayload,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::WebhookConnectionFailure => "WEBHOOK_CONNECTION_FAILURE",
            AlertKind::WebhookStatusFailure => "WEBHOOK_STATUS_FAILURE",
            AlertKind::InvalidAppPayload => "INVALID_APP_PAYLOAD",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub kind: AlertKind,
    pub account_sid: String,
    pub call_sid: Option<String>,
    pub detail: String,
}

/// Sink for alerts. Implementations must return quickly; anything slow
/// (writes to an alert store, paging) belongs on a task the implementation
/// spawns itself.
pub trait Alerter: Send + Sync {
    fn alert(&self, alert: Alert);
}

/// Default sink: structured warning via `tracing`.
#[derive(Debug, Default)]
pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn alert(&self, alert: Alert) {
        warn!(
            kind = alert.kind.as_str(),
            account_sid = %alert.account_sid,
            call_sid = alert.call_sid.as_deref(),
            "{}",
            alert.detail
        );
    }
}
