use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use jambonz_protocol::Hook;
use jambonz_protocol::HookMethod;
use jambonz_protocol::MessageType;
use jambonz_protocol::snake_case_keys;
use serde_json::Value;
use tracing::debug;
use tracing::trace;

use crate::Requestor;
use crate::RequestorContext;
use crate::alerts::Alert;
use crate::alerts::AlertKind;
use crate::base::BaseRequestor;
use crate::base::ResolvedHook;
use crate::error::RequestorError;
use crate::events::EventSender;
use crate::events::RequestorEvent;
use crate::retry::RetryToken;
use crate::retry::backoff_ms;
use crate::retry::should_retry;
use crate::signer::SIGNATURE_HEADER;
use crate::ws::WsRequestor;

/// Webhook client for `http(s)` hooks. Cheap to clone; all clones share the
/// same state.
#[derive(Clone)]
pub struct HttpRequestor {
    inner: Arc<HttpInner>,
}

struct HttpInner {
    base: BaseRequestor,
    ctx: RequestorContext,
    tx_event: EventSender,
    closed: AtomicBool,
}

impl HttpRequestor {
    pub fn new(base: BaseRequestor, ctx: RequestorContext, tx_event: EventSender) -> Self {
        Self {
            inner: Arc::new(HttpInner {
                base,
                ctx,
                tx_event,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The resolved hook names a WebSocket URL: construct the WS twin with
    /// the same credentials, let it open the channel with `session:new`
    /// carrying these params, and hand it to the owner. Handover
    /// short-circuits any retry handling for this request.
    async fn hand_over(
        &self,
        kind: MessageType,
        hook: &Hook,
        params: Value,
        b3: Option<&str>,
    ) -> Result<Option<Value>, RequestorError> {
        debug!(url = %hook.url, "webhook target is a websocket, handing over");
        let ws = WsRequestor::new(
            self.inner.base.clone(),
            self.inner.ctx.clone(),
            self.inner.tx_event.clone(),
        );
        let result = ws
            .request(MessageType::SessionNew, Some(hook), params, b3)
            .await;
        if result.is_ok() {
            let _ = self
                .inner
                .tx_event
                .send(RequestorEvent::Handover(Arc::new(ws.clone())));
            if kind == MessageType::SessionRedirect {
                self.close().await;
            }
        }
        result
    }

    async fn send_with_retry(
        &self,
        kind: MessageType,
        resolved: &ResolvedHook,
        params: Value,
        b3: Option<&str>,
    ) -> Result<Option<Value>, RequestorError> {
        let tokens = resolved
            .retry
            .tokens
            .clone()
            .unwrap_or_else(|| vec![RetryToken::ConnectTimeout]);
        let attempts = resolved.retry.attempts.unwrap_or(1);

        let body = snake_case_keys(&params);
        let mut delay_ms = 0u64;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let start = Instant::now();
            let result = self.send_once(resolved, &body, b3).await;
            self.inner
                .ctx
                .telemetry
                .on_webhook(kind, start.elapsed(), result.is_ok());

            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt < attempts && should_retry(&err, &tokens) {
                        delay_ms = backoff_ms(delay_ms);
                        debug!(url = %resolved.url, attempt, delay_ms, "webhook failed, retrying: {err}");
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        continue;
                    }
                    self.alert_failure(&err);
                    return Err(err);
                }
            }
        }
    }

    async fn send_once(
        &self,
        resolved: &ResolvedHook,
        body: &Value,
        b3: Option<&str>,
    ) -> Result<Option<Value>, RequestorError> {
        let client = self.inner.ctx.pool.client_for(&resolved.url)?;

        let mut request = match resolved.method {
            HookMethod::Get => client
                .get(resolved.url.clone())
                .query(&query_pairs(body)),
            HookMethod::Post => {
                let encoded = serde_json::to_string(body)
                    .map_err(|err| RequestorError::Protocol(format!("encode body: {err}")))?;
                let mut builder = client
                    .post(resolved.url.clone())
                    .header(CONTENT_TYPE, "application/json");
                if let Some(signature) = self.inner.base.signature_for(&encoded)? {
                    builder = builder.header(SIGNATURE_HEADER, signature);
                }
                builder.body(encoded)
            }
        };

        if let Some((username, password)) = resolved.basic_auth.as_ref() {
            request = request.basic_auth(username, Some(password));
        }
        if let Some(b3) = b3 {
            request = request.header("b3", b3);
        }

        trace!(url = %resolved.url, "webhook request: {body}");
        let response = request.send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RequestorError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("application/json"));
        let text = response.text().await.map_err(map_reqwest_error)?;
        if !is_json || text.is_empty() {
            return Ok(None);
        }

        let value = serde_json::from_str(&text)
            .map_err(|err| RequestorError::Protocol(format!("response body: {err}")))?;
        trace!(url = %resolved.url, "webhook response: {value}");
        Ok(Some(value))
    }

    fn alert_failure(&self, err: &RequestorError) {
        let (kind, detail) = match err {
            RequestorError::HttpStatus { status } => (
                AlertKind::WebhookStatusFailure,
                format!("webhook returned status {status}"),
            ),
            RequestorError::Transport(detail) => {
                (AlertKind::WebhookConnectionFailure, detail.clone())
            }
            _ => return,
        };
        self.inner.ctx.alerter.alert(Alert {
            kind,
            account_sid: self.inner.base.account_sid().to_string(),
            call_sid: None,
            detail,
        });
    }
}

#[async_trait]
impl Requestor for HttpRequestor {
    async fn request(
        &self,
        kind: MessageType,
        hook: Option<&Hook>,
        params: Value,
        b3: Option<&str>,
    ) -> Result<Option<Value>, RequestorError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let Some(hook) = hook else {
            return Err(RequestorError::InvalidUrl(
                "http requestor requires a hook".to_string(),
            ));
        };
        let resolved = self.inner.base.resolve(hook)?;
        if resolved.is_websocket() {
            return self.hand_over(kind, hook, params, b3).await;
        }
        // Channel-level diagnostics only exist on the WebSocket transport.
        if kind == MessageType::JambonzError {
            return Ok(None);
        }
        self.send_with_retry(kind, &resolved, params, b3).await
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    fn account_sid(&self) -> &str {
        self.inner.base.account_sid()
    }
}

fn map_reqwest_error(err: reqwest::Error) -> RequestorError {
    if err.is_timeout() {
        RequestorError::Transport("request timed out".to_string())
    } else {
        RequestorError::Transport(err.to_string())
    }
}

/// GET hooks carry scalar top-level params as query pairs; nested values
/// stay POST-only.
fn query_pairs(body: &Value) -> Vec<(String, String)> {
    let Some(map) = body.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((key.clone(), rendered))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn query_pairs_keep_scalars_only() {
        let body = json!({
            "call_sid": "c1",
            "attempt": 2,
            "answered": true,
            "sip": {"headers": {}}
        });
        let mut pairs = query_pairs(&body);
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("answered".to_string(), "true".to_string()),
                ("attempt".to_string(), "2".to_string()),
                ("call_sid".to_string(), "c1".to_string()),
            ]
        );
    }
}
