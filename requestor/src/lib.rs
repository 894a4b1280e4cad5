//! Webhook transports for the feature server: a pooled HTTP(S) client and a
//! persistent, ack-tracked WebSocket channel, with seamless handover between
//! them when a hook's URL scheme implies the other transport.

mod alerts;
mod base;
mod config;
mod error;
mod events;
mod http;
mod pool;
mod retry;
mod signer;
mod telemetry;
mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use jambonz_protocol::Hook;
use jambonz_protocol::MessageType;
use serde_json::Value;

pub use alerts::Alert;
pub use alerts::AlertKind;
pub use alerts::Alerter;
pub use alerts::LogAlerter;
pub use base::BaseRequestor;
pub use base::ResolvedHook;
pub use config::HttpConfig;
pub use config::ProxyConfig;
pub use config::WsConfig;
pub use error::RequestorError;
pub use events::CommandEvent;
pub use events::EventReceiver;
pub use events::EventSender;
pub use events::RequestorEvent;
pub use events::event_channel;
pub use http::HttpRequestor;
pub use pool::HttpClientPool;
pub use retry::RetryDirective;
pub use retry::RetryToken;
pub use retry::backoff_ms;
pub use retry::clamp_attempts;
pub use retry::parse_tokens;
pub use retry::should_retry;
pub use signer::SIGNATURE_HEADER;
pub use signer::signature;
pub use telemetry::NoopTelemetry;
pub use telemetry::RequestorTelemetry;
pub use ws::SUBPROTOCOL;
pub use ws::WsRequestor;

/// A webhook transport bound to one call session. `request` resolves the
/// hook, delivers the payload, and returns the parsed JSON response body
/// (`None` when the application answered with an empty body).
///
/// Implementations surface [`RequestorEvent`]s (handover, inbound commands,
/// connection loss) on the channel supplied at construction.
#[async_trait]
pub trait Requestor: Send + Sync {
    async fn request(
        &self,
        kind: MessageType,
        hook: Option<&Hook>,
        params: Value,
        b3: Option<&str>,
    ) -> Result<Option<Value>, RequestorError>;

    /// Graceful shutdown. Idempotent; subsequent `request` calls are
    /// discarded without error.
    async fn close(&self);

    fn account_sid(&self) -> &str;
}

/// Shared collaborators injected into every requestor: the HTTP client
/// registry, the alert sink, and the telemetry sink. Tests swap these per
/// session.
#[derive(Clone)]
pub struct RequestorContext {
    pub pool: HttpClientPool,
    pub alerter: Arc<dyn Alerter>,
    pub telemetry: Arc<dyn RequestorTelemetry>,
}

impl RequestorContext {
    pub fn new(http_config: HttpConfig) -> Self {
        Self {
            pool: HttpClientPool::new(http_config),
            alerter: Arc::new(LogAlerter),
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = alerter;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn RequestorTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }
}

impl Default for RequestorContext {
    fn default() -> Self {
        Self::new(HttpConfig::from_env())
    }
}
