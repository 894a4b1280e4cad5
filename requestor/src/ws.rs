use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::SinkExt;
use futures::StreamExt;
use http::HeaderValue;
use http::header::AUTHORIZATION;
use http::header::SEC_WEBSOCKET_PROTOCOL;
use http::header::USER_AGENT;
use jambonz_protocol::AppCommand;
use jambonz_protocol::Hook;
use jambonz_protocol::InboundMessage;
use jambonz_protocol::MessageType;
use jambonz_protocol::OutboundMessage;
use jambonz_protocol::snake_case_keys;
use serde_json::Value;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;
use tracing::info;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::Requestor;
use crate::RequestorContext;
use crate::alerts::Alert;
use crate::alerts::AlertKind;
use crate::base::BaseRequestor;
use crate::error::RequestorError;
use crate::events::CommandEvent;
use crate::events::EventSender;
use crate::events::RequestorEvent;
use crate::http::HttpRequestor;
use crate::retry::RetryToken;
use crate::retry::backoff_ms;
use crate::retry::should_retry;

/// Subprotocol advertised on every connect.
pub const SUBPROTOCOL: &str = "ws.jambonz.org";

type SendResolver = oneshot::Sender<Result<Option<Value>, RequestorError>>;

/// Persistent, ack-tracked WebSocket channel to a customer application.
/// Cheap to clone; all clones share the same connection and state.
#[derive(Clone)]
pub struct WsRequestor {
    inner: Arc<WsInner>,
}

struct WsInner {
    base: BaseRequestor,
    ctx: RequestorContext,
    tx_event: EventSender,
    state: Mutex<WsState>,
}

struct WsState {
    /// Resolved connect target; fixed by the first hook seen.
    target: Option<crate::base::ResolvedHook>,
    /// Original absolute hook URL, echoed in hook-bearing frames.
    hook_url: Option<String>,
    socket: Option<Conn>,
    generation: u64,
    /// Successful opens over the requestor's lifetime.
    connections: u32,
    reconnect_attempts: u32,
    connecting: bool,
    in_flight: HashMap<String, InFlight>,
    /// Pending `session:new` re-keyed across a reconnect: an ack to either
    /// id resolves both entries.
    init_link: Option<InitLink>,
    init_msgid: Option<String>,
    session_new_data: Option<Value>,
    queued: VecDeque<QueuedSend>,
    backoff_ms: u64,
    closed_gracefully: bool,
    malicious: bool,
}

struct Conn {
    tx_out: mpsc::UnboundedSender<Message>,
    generation: u64,
}

struct InFlight {
    tx: SendResolver,
    sent_at: Instant,
}

struct InitLink {
    original: String,
    reconnect: String,
}

struct QueuedSend {
    frame: OutboundMessage,
    tx: SendResolver,
}

enum TextDisposition {
    Continue,
    Malicious { reply: Option<Message> },
}

impl WsRequestor {
    pub fn new(base: BaseRequestor, ctx: RequestorContext, tx_event: EventSender) -> Self {
        Self {
            inner: Arc::new(WsInner {
                base,
                ctx,
                tx_event,
                state: Mutex::new(WsState {
                    target: None,
                    hook_url: None,
                    socket: None,
                    generation: 0,
                    connections: 0,
                    reconnect_attempts: 0,
                    connecting: false,
                    in_flight: HashMap::new(),
                    init_link: None,
                    init_msgid: None,
                    session_new_data: None,
                    queued: VecDeque::new(),
                    backoff_ms: 0,
                    closed_gracefully: false,
                    malicious: false,
                }),
            }),
        }
    }

    /// Number of successful connection opens so far.
    pub async fn connections(&self) -> u32 {
        self.inner.state.lock().await.connections
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.socket.is_some()
    }

    /// The hook resolved to `http(s)`: hand the request to an HTTP twin and
    /// tell the owner to swap.
    async fn hand_over(
        &self,
        kind: MessageType,
        hook: &Hook,
        params: Value,
        b3: Option<&str>,
    ) -> Result<Option<Value>, RequestorError> {
        debug!(url = %hook.url, "hook target is http, handing over");
        let http = HttpRequestor::new(
            self.inner.base.clone(),
            self.inner.ctx.clone(),
            self.inner.tx_event.clone(),
        );
        let result = http.request(kind, Some(hook), params, b3).await;
        if result.is_ok() {
            let _ = self
                .inner
                .tx_event
                .send(RequestorEvent::Handover(Arc::new(http.clone())));
        }
        result
    }

    fn dispatch_frame(
        inner: &Arc<WsInner>,
        state: &mut WsState,
        frame: OutboundMessage,
        tx: SendResolver,
    ) {
        let Some(conn) = state.socket.as_ref() else {
            let _ = tx.send(Err(RequestorError::Transport(
                "websocket closed".to_string(),
            )));
            return;
        };
        let encoded = match serde_json::to_string(&frame) {
            Ok(encoded) => encoded,
            Err(err) => {
                let _ = tx.send(Err(RequestorError::Protocol(format!(
                    "encode frame: {err}"
                ))));
                return;
            }
        };
        if conn.tx_out.send(Message::Text(encoded.into())).is_err() {
            let _ = tx.send(Err(RequestorError::Transport(
                "websocket closed".to_string(),
            )));
            return;
        }
        if frame.kind.wants_ack() {
            state.in_flight.insert(
                frame.msgid.clone(),
                InFlight {
                    tx,
                    sent_at: Instant::now(),
                },
            );
            Self::spawn_ack_timer(inner, frame.msgid);
        } else {
            let _ = tx.send(Ok(None));
        }
    }

    fn queue_frame(
        inner: &Arc<WsInner>,
        state: &mut WsState,
        frame: OutboundMessage,
        tx: SendResolver,
    ) -> Result<(), RequestorError> {
        if state.queued.len() >= inner.base.ws_config().queue_high_water {
            return Err(RequestorError::QueueOverflow);
        }
        state.queued.push_back(QueuedSend { frame, tx });
        Ok(())
    }

    fn flush_queued(inner: &Arc<WsInner>, state: &mut WsState) {
        let queued: Vec<QueuedSend> = state.queued.drain(..).collect();
        for entry in queued {
            Self::dispatch_frame(inner, state, entry.frame, entry.tx);
        }
    }

    fn fail_all(state: &mut WsState, err: &RequestorError) {
        for (_, entry) in state.in_flight.drain() {
            let _ = entry.tx.send(Err(err.clone()));
        }
        for entry in state.queued.drain(..) {
            let _ = entry.tx.send(Err(err.clone()));
        }
        state.init_link = None;
        state.init_msgid = None;
    }

    /// Messages already written to a dead socket can never be acked. The
    /// pending `session:new`, if any, survives: the reconnect handshake
    /// re-keys it.
    fn fail_unlinked_in_flight(state: &mut WsState) {
        let keep = state.init_msgid.clone();
        let stale: Vec<String> = state
            .in_flight
            .keys()
            .filter(|id| Some(id.as_str()) != keep.as_deref())
            .cloned()
            .collect();
        for id in stale {
            if let Some(entry) = state.in_flight.remove(&id) {
                let _ = entry.tx.send(Err(RequestorError::Transport(
                    "websocket connection lost".to_string(),
                )));
            }
        }
    }

    fn linked_ids(state: &WsState, msgid: &str) -> Vec<String> {
        if let Some(link) = state.init_link.as_ref()
            && (link.original == msgid || link.reconnect == msgid)
        {
            return vec![link.original.clone(), link.reconnect.clone()];
        }
        vec![msgid.to_string()]
    }

    fn spawn_ack_timer(inner: &Arc<WsInner>, msgid: String) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.base.ws_config().response_timeout).await;
            let mut state = inner.state.lock().await;
            let ids = Self::linked_ids(&state, &msgid);
            let mut expired = false;
            for id in &ids {
                if let Some(entry) = state.in_flight.remove(id) {
                    let _ = entry.tx.send(Err(RequestorError::ResponseTimeout));
                    expired = true;
                }
            }
            if expired {
                Self::clear_init_if_matched(&mut state, &ids);
            }
        });
    }

    fn clear_init_if_matched(state: &mut WsState, ids: &[String]) {
        if let Some(init) = state.init_msgid.as_deref()
            && ids.iter().any(|id| id == init)
        {
            state.init_msgid = None;
            state.init_link = None;
        }
        if let Some(link) = state.init_link.as_ref()
            && ids.iter().any(|id| *id == link.reconnect)
        {
            state.init_link = None;
        }
    }

    async fn on_ack(inner: &Arc<WsInner>, msgid: &str, data: Option<Value>) {
        let mut state = inner.state.lock().await;
        let ids = Self::linked_ids(&state, msgid);
        let mut resolved = false;
        for id in &ids {
            if let Some(entry) = state.in_flight.remove(id) {
                inner.ctx.telemetry.on_ack(entry.sent_at.elapsed());
                let _ = entry.tx.send(Ok(data.clone()));
                resolved = true;
            }
        }
        if resolved {
            Self::clear_init_if_matched(&mut state, &ids);
        } else {
            debug!(msgid, "ack for unknown msgid");
        }
    }

    async fn handle_text(inner: &Arc<WsInner>, text: &str) -> TextDisposition {
        match serde_json::from_str::<InboundMessage>(text) {
            Ok(InboundMessage::Ack { msgid, data }) => {
                Self::on_ack(inner, &msgid, data).await;
                TextDisposition::Continue
            }
            Ok(InboundMessage::Command {
                command,
                msgid,
                call_sid,
                queue_command,
                tool_call_id,
                data,
            }) => {
                let event = CommandEvent {
                    command: AppCommand::parse(&command),
                    msgid,
                    call_sid,
                    queue_command,
                    tool_call_id,
                    data: data.unwrap_or(Value::Null),
                };
                let _ = inner.tx_event.send(RequestorEvent::Command(event));
                TextDisposition::Continue
            }
            Err(err) => {
                Self::mark_malicious(inner, &format!("unparseable frame: {err}")).await;
                let reply = OutboundMessage {
                    kind: MessageType::JambonzError,
                    msgid: Uuid::new_v4().to_string(),
                    call_sid: None,
                    hook: None,
                    data: json!({"error": format!("invalid payload: {err}")}),
                    b3: None,
                };
                let reply = serde_json::to_string(&reply)
                    .ok()
                    .map(|encoded| Message::Text(encoded.into()));
                TextDisposition::Malicious { reply }
            }
        }
    }

    async fn mark_malicious(inner: &Arc<WsInner>, detail: &str) {
        {
            let mut state = inner.state.lock().await;
            if state.malicious {
                return;
            }
            state.malicious = true;
            Self::fail_all(&mut state, &RequestorError::Protocol(detail.to_string()));
        }
        warn!("marking application websocket malicious: {detail}");
        inner.ctx.alerter.alert(Alert {
            kind: AlertKind::InvalidAppPayload,
            account_sid: inner.base.account_sid().to_string(),
            call_sid: None,
            detail: detail.to_string(),
        });
    }

    async fn open_socket(
        inner: &Arc<WsInner>,
        url: &Url,
        auth: Option<&(String, String)>,
    ) -> Result<(), RequestorError> {
        let cfg = inner.base.ws_config().clone();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| RequestorError::InvalidUrl(format!("{url}: {err}")))?;
        let headers = request.headers_mut();
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        if let Some((username, password)) = auth {
            let token = BASE64.encode(format!("{username}:{password}"));
            if let Ok(value) = HeaderValue::from_str(&format!("Basic {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        if let Some(user_agent) = inner.base.http_config().user_agent.as_deref()
            && let Ok(value) = HeaderValue::from_str(user_agent)
        {
            headers.insert(USER_AGENT, value);
        }

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(cfg.max_payload);
        ws_config.max_frame_size = Some(cfg.max_payload);

        let start = Instant::now();
        let connect = tokio_tungstenite::connect_async_with_config(
            request,
            Some(ws_config),
            false, // leave Nagle alone, tungstenite's recommended default
        );
        let (stream, _response) = match timeout(cfg.handshake_timeout, connect).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                inner.ctx.telemetry.on_connect(start.elapsed(), false);
                return Err(map_connect_error(err));
            }
            Err(_) => {
                inner.ctx.telemetry.on_connect(start.elapsed(), false);
                return Err(RequestorError::Handshake { status: None });
            }
        };
        inner.ctx.telemetry.on_connect(start.elapsed(), true);
        info!(%url, "websocket connected");

        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let generation = {
            let mut state = inner.state.lock().await;
            if state.closed_gracefully || state.malicious {
                return Err(RequestorError::Closed);
            }
            state.generation += 1;
            state.connections += 1;
            state.socket = Some(Conn {
                tx_out,
                generation: state.generation,
            });
            state.generation
        };
        let pump_inner = Arc::clone(inner);
        tokio::spawn(async move {
            Self::pump(pump_inner, stream, rx_out, generation).await;
        });
        Ok(())
    }

    /// First connect, driven by the hook's retry directive (default
    /// `rc=5`, `rp=ct`). Queued messages, the `session:new` itself plus
    /// anything submitted while connecting, flush in submission order.
    async fn initial_connect(inner: Arc<WsInner>) {
        let target = {
            let state = inner.state.lock().await;
            state.target.clone()
        };
        let Some(target) = target else {
            Self::fail_connect(&inner, RequestorError::InvalidUrl("no websocket target".to_string()))
                .await;
            return;
        };
        let tokens = target
            .retry
            .tokens
            .clone()
            .unwrap_or_else(|| vec![RetryToken::ConnectTimeout]);
        let attempts = target.retry.attempts.unwrap_or(5);

        let mut delay_ms = 0u64;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match Self::open_socket(&inner, &target.url, target.basic_auth.as_ref()).await {
                Ok(()) => {
                    let mut state = inner.state.lock().await;
                    state.connecting = false;
                    state.backoff_ms = 0;
                    Self::flush_queued(&inner, &mut state);
                    return;
                }
                Err(err) => {
                    if attempt < attempts && should_retry(&err, &tokens) {
                        delay_ms = backoff_ms(delay_ms);
                        debug!(url = %target.url, attempt, delay_ms, "websocket connect failed, retrying: {err}");
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        continue;
                    }
                    Self::fail_connect(&inner, err).await;
                    return;
                }
            }
        }
    }

    async fn fail_connect(inner: &Arc<WsInner>, err: RequestorError) {
        warn!("websocket connect failed: {err}");
        inner.ctx.alerter.alert(Alert {
            kind: AlertKind::WebhookConnectionFailure,
            account_sid: inner.base.account_sid().to_string(),
            call_sid: None,
            detail: err.to_string(),
        });
        let mut state = inner.state.lock().await;
        state.connecting = false;
        Self::fail_all(&mut state, &err);
    }

    async fn pump(
        inner: Arc<WsInner>,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        mut rx_out: mpsc::UnboundedReceiver<Message>,
        generation: u64,
    ) {
        let mut stream = stream;
        let mut ping = inner
            .base
            .ws_config()
            .ping_interval
            .map(|every| tokio::time::interval_at(tokio::time::Instant::now() + every, every));

        let mut close_code: Option<u16> = None;
        loop {
            tokio::select! {
                frame = rx_out.recv() => {
                    let Some(frame) = frame else { break };
                    let is_close = matches!(frame, Message::Close(_));
                    if stream.send(frame).await.is_err() {
                        break;
                    }
                    if is_close {
                        break;
                    }
                }
                message = stream.next() => {
                    match message {
                        None => break,
                        Some(Ok(Message::Ping(payload))) => {
                            if stream.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Text(text))) => {
                            match Self::handle_text(&inner, text.as_str()).await {
                                TextDisposition::Continue => {}
                                TextDisposition::Malicious { reply } => {
                                    if let Some(reply) = reply {
                                        let _ = stream.send(reply).await;
                                    }
                                    let _ = stream
                                        .send(close_frame(CloseCode::Policy))
                                        .await;
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            Self::mark_malicious(&inner, "binary frame from application").await;
                            let _ = stream.send(close_frame(CloseCode::Unsupported)).await;
                            break;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            close_code = frame.map(|f| u16::from(f.code));
                            break;
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(err)) => {
                            warn!("websocket read error: {err}");
                            if matches!(err, WsError::Capacity(_)) {
                                Self::mark_malicious(
                                    &inner,
                                    &format!("oversize frame: {err}"),
                                )
                                .await;
                            }
                            break;
                        }
                    }
                }
                _ = async {
                    match ping.as_mut() {
                        Some(interval) => { interval.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if stream.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        Self::on_socket_closed(&inner, generation, close_code).await;
    }

    async fn on_socket_closed(inner: &Arc<WsInner>, generation: u64, close_code: Option<u16>) {
        let reconnect_delay = {
            let mut state = inner.state.lock().await;
            if state.socket.as_ref().map(|conn| conn.generation) != Some(generation) {
                return;
            }
            state.socket = None;

            if state.malicious || state.closed_gracefully {
                Self::fail_all(&mut state, &RequestorError::Closed);
                None
            } else if close_code == Some(1000) {
                Self::fail_all(
                    &mut state,
                    &RequestorError::Transport("websocket closed by application".to_string()),
                );
                let _ = inner.tx_event.send(RequestorEvent::ConnectionDropped);
                None
            } else {
                let _ = inner.tx_event.send(RequestorEvent::ConnectionDropped);
                if state.reconnect_attempts >= inner.base.ws_config().max_reconnects {
                    Self::fail_all(
                        &mut state,
                        &RequestorError::Transport(
                            "websocket reconnect budget exhausted".to_string(),
                        ),
                    );
                    None
                } else {
                    state.reconnect_attempts += 1;
                    state.connecting = true;
                    Self::fail_unlinked_in_flight(&mut state);
                    state.backoff_ms = backoff_ms(state.backoff_ms);
                    Some(Duration::from_millis(state.backoff_ms))
                }
            }
        };
        if let Some(delay) = reconnect_delay {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                Self::reconnect(inner, delay).await;
            });
        }
    }

    fn reconnect(
        inner: Arc<WsInner>,
        delay: Duration,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            let target = {
                let state = inner.state.lock().await;
                if state.closed_gracefully || state.malicious {
                    return;
                }
                state.target.clone()
            };
            let Some(target) = target else { return };
            match Self::open_socket(&inner, &target.url, target.basic_auth.as_ref()).await {
                Ok(()) => Self::resume_after_reconnect(&inner).await,
                Err(err) => {
                    debug!("websocket reconnect failed: {err}");
                    Self::retry_or_give_up(&inner).await;
                }
            }
        })
    }

    async fn retry_or_give_up(inner: &Arc<WsInner>) {
        let delay = {
            let mut state = inner.state.lock().await;
            if state.reconnect_attempts >= inner.base.ws_config().max_reconnects {
                state.connecting = false;
                Self::fail_all(
                    &mut state,
                    &RequestorError::Transport("websocket reconnect budget exhausted".to_string()),
                );
                None
            } else {
                state.reconnect_attempts += 1;
                state.backoff_ms = backoff_ms(state.backoff_ms);
                Some(Duration::from_millis(state.backoff_ms))
            }
        };
        match delay {
            Some(delay) => {
                let inner = Arc::clone(inner);
                tokio::spawn(async move {
                    Self::reconnect(inner, delay).await;
                });
            }
            None => {
                inner.ctx.alerter.alert(Alert {
                    kind: AlertKind::WebhookConnectionFailure,
                    account_sid: inner.base.account_sid().to_string(),
                    call_sid: None,
                    detail: "websocket reconnect budget exhausted".to_string(),
                });
            }
        }
    }

    /// After a reopen the server speaks first: `session:reconnect` carrying
    /// the cached `session:new` payload. Until its ack arrives, outbound
    /// messages keep queueing.
    async fn resume_after_reconnect(inner: &Arc<WsInner>) {
        let msgid = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = inner.state.lock().await;
            let data = state.session_new_data.clone().unwrap_or(Value::Null);
            let frame = OutboundMessage {
                kind: MessageType::SessionReconnect,
                msgid: msgid.clone(),
                call_sid: data
                    .get("call_sid")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                hook: state.hook_url.clone(),
                data,
                b3: None,
            };
            if let Some(init) = state.init_msgid.clone() {
                state.init_link = Some(InitLink {
                    original: init,
                    reconnect: msgid.clone(),
                });
            }
            Self::dispatch_frame(inner, &mut state, frame, tx);
        }

        let result = rx
            .await
            .unwrap_or(Err(RequestorError::Transport("connection dropped".to_string())));
        match result {
            Ok(_) => {
                let mut state = inner.state.lock().await;
                state.connecting = false;
                state.backoff_ms = 0;
                Self::flush_queued(inner, &mut state);
            }
            Err(err) => {
                debug!("session:reconnect not acked: {err}");
                {
                    let mut state = inner.state.lock().await;
                    // dropping the writer ends the pump; its close callback
                    // sees a stale generation and stays quiet
                    state.socket = None;
                }
                Self::retry_or_give_up(inner).await;
            }
        }
    }
}

#[async_trait]
impl Requestor for WsRequestor {
    async fn request(
        &self,
        kind: MessageType,
        hook: Option<&Hook>,
        params: Value,
        b3: Option<&str>,
    ) -> Result<Option<Value>, RequestorError> {
        let resolved = match hook {
            Some(hook) => Some(self.inner.base.resolve(hook)?),
            None => None,
        };
        if let (Some(hook), Some(resolved)) = (hook, resolved.as_ref())
            && !resolved.is_websocket()
        {
            if self.inner.state.lock().await.closed_gracefully {
                return Ok(None);
            }
            return self.hand_over(kind, hook, params, b3).await;
        }

        let data = snake_case_keys(&params);
        let call_sid = data
            .get("call_sid")
            .and_then(Value::as_str)
            .map(str::to_string);
        let request_url = resolved.as_ref().map(|r| r.url.to_string());
        let msgid = Uuid::new_v4().to_string();
        let (tx_done, rx_done) = oneshot::channel();

        let connect_now = {
            let mut state = self.inner.state.lock().await;
            if state.closed_gracefully || state.malicious {
                return Ok(None);
            }
            if let Some(resolved) = resolved
                && state.target.is_none()
            {
                state.hook_url = Some(resolved.url.to_string());
                state.target = Some(resolved);
            }

            let frame = OutboundMessage {
                kind,
                msgid: msgid.clone(),
                call_sid,
                hook: if kind.carries_hook() {
                    request_url.or_else(|| state.hook_url.clone())
                } else {
                    None
                },
                data: data.clone(),
                b3: b3.map(str::to_string),
            };

            if kind == MessageType::SessionNew {
                state.session_new_data = Some(data);
                state.init_msgid = Some(msgid.clone());
            }

            if state.socket.is_some() && !state.connecting {
                Self::dispatch_frame(&self.inner, &mut state, frame, tx_done);
                false
            } else if state.connecting {
                Self::queue_frame(&self.inner, &mut state, frame, tx_done)?;
                false
            } else if kind == MessageType::SessionNew {
                Self::queue_frame(&self.inner, &mut state, frame, tx_done)?;
                state.connecting = true;
                true
            } else {
                return Err(RequestorError::Closed);
            }
        };

        if connect_now {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                Self::initial_connect(inner).await;
            });
        }

        rx_done
            .await
            .unwrap_or(Err(RequestorError::Transport("connection dropped".to_string())))
    }

    async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        if state.closed_gracefully {
            return;
        }
        state.closed_gracefully = true;
        if let Some(conn) = state.socket.take() {
            let _ = conn.tx_out.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })));
        }
        Self::fail_all(&mut state, &RequestorError::Closed);
    }

    fn account_sid(&self) -> &str {
        self.inner.base.account_sid()
    }
}

fn close_frame(code: CloseCode) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: "".into(),
    }))
}

fn map_connect_error(err: WsError) -> RequestorError {
    match err {
        WsError::Http(response) => RequestorError::Handshake {
            status: Some(response.status().as_u16()),
        },
        WsError::Io(err) => RequestorError::Transport(err.to_string()),
        other => RequestorError::Transport(other.to_string()),
    }
}
