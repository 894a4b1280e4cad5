use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use jambonz_core::CallDirection;
use jambonz_core::CallLeg;
use jambonz_core::CallSession;
use jambonz_core::CallStatus;
use jambonz_core::CallerInfo;
use jambonz_core::Dialer;
use jambonz_core::Dtmf;
use jambonz_core::EndReason;
use jambonz_core::MediaEndpoint;
use jambonz_core::MediaError;
use jambonz_core::MediaServer;
use jambonz_core::NoopSessionTelemetry;
use jambonz_core::OutboundCall;
use jambonz_core::SessionServices;
use jambonz_core::SignalingError;
use jambonz_core::Synthesizer;
use jambonz_core::TaskError;
use jambonz_core::task::TaskName;
use jambonz_core::task::registry;
use jambonz_protocol::AppCommand;
use jambonz_protocol::Hook;
use jambonz_protocol::MessageType;
use jambonz_protocol::parse_application;
use jambonz_requestor::CommandEvent;
use jambonz_requestor::EventSender;
use jambonz_requestor::Requestor;
use jambonz_requestor::RequestorError;
use jambonz_requestor::RequestorEvent;
use jambonz_requestor::event_channel;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;

struct MockEndpoint {
    uuid: String,
    api_calls: StdMutex<Vec<(String, Vec<String>)>>,
    plays: StdMutex<Vec<String>>,
    destroyed: AtomicUsize,
    dtmf_tx: broadcast::Sender<Dtmf>,
    custom_tx: StdMutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl MockEndpoint {
    fn new() -> Arc<Self> {
        let (dtmf_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            uuid: "ep-1".to_string(),
            api_calls: StdMutex::new(Vec::new()),
            plays: StdMutex::new(Vec::new()),
            destroyed: AtomicUsize::new(0),
            dtmf_tx,
            custom_tx: StdMutex::new(HashMap::new()),
        })
    }

    fn plays(&self) -> Vec<String> {
        self.plays.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaEndpoint for MockEndpoint {
    async fn api(&self, verb: &str, args: &[String]) -> Result<Value, MediaError> {
        self.api_calls
            .lock()
            .unwrap()
            .push((verb.to_string(), args.to_vec()));
        Ok(Value::Null)
    }

    async fn play(&self, path: &str) -> Result<(), MediaError> {
        self.plays.lock().unwrap().push(path.to_string());
        Ok(())
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), MediaError> {
        Ok(())
    }

    fn custom_events(&self, name: &str) -> broadcast::Receiver<Value> {
        self.custom_tx
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(16).0)
            .subscribe()
    }

    fn dtmf(&self) -> broadcast::Receiver<Dtmf> {
        self.dtmf_tx.subscribe()
    }

    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn connected(&self) -> bool {
        true
    }

    async fn destroy(&self) -> Result<(), MediaError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockMedia {
    endpoint: Arc<MockEndpoint>,
    allocations: AtomicUsize,
}

#[async_trait]
impl MediaServer for MockMedia {
    async fn allocate(&self) -> Result<Arc<dyn MediaEndpoint>, MediaError> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(self.endpoint.clone())
    }
}

struct MockLeg {
    status: StdMutex<CallStatus>,
    status_tx: broadcast::Sender<CallStatus>,
    declined: StdMutex<Option<(u16, Option<String>)>>,
}

impl MockLeg {
    fn answered() -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            status: StdMutex::new(CallStatus::InProgress),
            status_tx,
            declined: StdMutex::new(None),
        })
    }

    fn set_status(&self, status: CallStatus) {
        *self.status.lock().unwrap() = status;
        let _ = self.status_tx.send(status);
    }
}

#[async_trait]
impl CallLeg for MockLeg {
    async fn answer(&self) -> Result<(), SignalingError> {
        self.set_status(CallStatus::InProgress);
        Ok(())
    }

    async fn decline(&self, status: u16, reason: Option<&str>) -> Result<(), SignalingError> {
        *self.declined.lock().unwrap() = Some((status, reason.map(str::to_string)));
        self.set_status(CallStatus::Failed);
        Ok(())
    }

    async fn hangup(&self) -> Result<(), SignalingError> {
        self.set_status(CallStatus::Completed);
        Ok(())
    }

    fn status(&self) -> CallStatus {
        *self.status.lock().unwrap()
    }

    fn status_stream(&self) -> broadcast::Receiver<CallStatus> {
        self.status_tx.subscribe()
    }
}

struct MockSynthesizer {
    calls: AtomicUsize,
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str, _voice: Option<&str>) -> Result<PathBuf, MediaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut file = tempfile::Builder::new()
            .prefix("tts-")
            .suffix(".wav")
            .tempfile()
            .map_err(|err| MediaError::Unavailable(err.to_string()))?;
        file.write_all(text.as_bytes())
            .map_err(|err| MediaError::Unavailable(err.to_string()))?;
        // the session owns cleanup; the file must outlive this handle
        let (_, path) = file
            .keep()
            .map_err(|err| MediaError::Unavailable(err.to_string()))?;
        Ok(path)
    }
}

struct MockDialer;

#[async_trait]
impl Dialer for MockDialer {
    async fn place_call(
        &self,
        _from: &str,
        _to: &str,
        _timeout: Duration,
    ) -> Result<OutboundCall, SignalingError> {
        Err(SignalingError::Failure("no trunk".to_string()))
    }
}

enum Script {
    Respond(Option<Value>),
    DelayedRespond(Duration, Option<Value>),
}

#[derive(Default)]
struct ScriptedRequestor {
    requests: StdMutex<Vec<(MessageType, Value)>>,
    verb_hook_script: StdMutex<Vec<Script>>,
    closed: AtomicUsize,
}

impl ScriptedRequestor {
    fn new(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            verb_hook_script: StdMutex::new(script),
            ..Self::default()
        })
    }

    fn requests_of(&self, kind: MessageType) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

#[async_trait]
impl Requestor for ScriptedRequestor {
    async fn request(
        &self,
        kind: MessageType,
        _hook: Option<&Hook>,
        params: Value,
        _b3: Option<&str>,
    ) -> Result<Option<Value>, RequestorError> {
        self.requests.lock().unwrap().push((kind, params));
        if kind != MessageType::VerbHook {
            return Ok(None);
        }
        let step = self.verb_hook_script.lock().unwrap().pop();
        match step {
            Some(Script::Respond(value)) => Ok(value),
            Some(Script::DelayedRespond(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            None => Ok(None),
        }
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn account_sid(&self) -> &str {
        "acct-1"
    }
}

struct Fixture {
    session: Arc<CallSession>,
    endpoint: Arc<MockEndpoint>,
    media: Arc<MockMedia>,
    leg: Arc<MockLeg>,
    synthesizer: Arc<MockSynthesizer>,
    requestor: Arc<ScriptedRequestor>,
    tx_event: EventSender,
}

fn caller_info() -> CallerInfo {
    CallerInfo {
        call_sid: "c1".to_string(),
        account_sid: "acct-1".to_string(),
        application_sid: Some("app-1".to_string()),
        from: "+15551112222".to_string(),
        to: "+15553334444".to_string(),
        direction: CallDirection::Inbound,
        caller_name: None,
    }
}

fn fixture(app: Value, script: Vec<Script>) -> (Fixture, jambonz_requestor::EventReceiver) {
    let endpoint = MockEndpoint::new();
    let media = Arc::new(MockMedia {
        endpoint: endpoint.clone(),
        allocations: AtomicUsize::new(0),
    });
    let leg = MockLeg::answered();
    let synthesizer = Arc::new(MockSynthesizer {
        calls: AtomicUsize::new(0),
    });
    let requestor = ScriptedRequestor::new(script);
    let (tx_event, rx_event) = event_channel();

    let verbs = parse_application(&app).unwrap();
    let tasks = registry::make_tasks(&verbs).unwrap();

    let services = SessionServices {
        media: media.clone(),
        synthesizer: synthesizer.clone(),
        dialer: Arc::new(MockDialer),
        telemetry: Arc::new(NoopSessionTelemetry),
    };
    let session = Arc::new(CallSession::new(
        caller_info(),
        leg.clone(),
        requestor.clone(),
        tasks,
        services,
    ));

    (
        Fixture {
            session,
            endpoint,
            media,
            leg,
            synthesizer,
            requestor,
            tx_event,
        },
        rx_event,
    )
}

fn command(cmd: AppCommand, data: Value, queued: bool) -> RequestorEvent {
    RequestorEvent::Command(CommandEvent {
        command: cmd,
        msgid: None,
        call_sid: Some("c1".to_string()),
        queue_command: queued,
        tool_call_id: None,
        data,
    })
}

#[tokio::test]
async fn runs_tasks_serially_and_tears_down() -> anyhow::Result<()> {
    let app = json!([
        {"say": {"text": "hello"}},
        {"play": {"url": "https://cdn.example/a.wav"}}
    ]);
    let (fx, rx_event) = fixture(app, vec![]);

    let reason = timeout(Duration::from_secs(5), fx.session.clone().exec(rx_event)).await??;
    assert_eq!(reason, EndReason::AppCompleted);

    let plays = fx.endpoint.plays();
    assert_eq!(plays.len(), 2);
    assert!(plays[0].contains("tts-"), "say plays the synthesized file");
    assert_eq!(plays[1], "https://cdn.example/a.wav");

    // the endpoint is allocated once, released once; the tmp file is gone
    assert_eq!(fx.media.allocations.load(Ordering::SeqCst), 1);
    assert_eq!(fx.endpoint.destroyed.load(Ordering::SeqCst), 1);
    assert!(!std::path::Path::new(&plays[0]).exists());

    // call:status at start and teardown; the requestor is closed
    let statuses = fx.requestor.requests_of(MessageType::CallStatus);
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0]["callStatus"], "in-progress");
    assert_eq!(statuses[1]["callStatus"], "completed");
    assert_eq!(fx.requestor.closed.load(Ordering::SeqCst), 1);
    assert_eq!(fx.leg.status(), CallStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn action_hook_array_replaces_application() {
    // the play verb's action hook returns a new application
    let app = json!([
        {"play": {"url": "https://cdn.example/a.wav", "actionHook": "/next"}},
        {"pause": {"length": 30}}
    ]);
    let script = vec![Script::Respond(Some(json!([{"say": {"text": "bye"}}])))];
    let (fx, rx_event) = fixture(app, script);

    let reason = timeout(Duration::from_secs(5), fx.session.clone().exec(rx_event))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, EndReason::AppCompleted);

    // the queued 30s pause was replaced by the say verb
    let plays = fx.endpoint.plays();
    assert_eq!(plays.len(), 2);
    assert_eq!(plays[0], "https://cdn.example/a.wav");
    assert!(plays[1].contains("tts-"));
    assert_eq!(fx.synthesizer.calls.load(Ordering::SeqCst), 1);

    let hooks = fx.requestor.requests_of(MessageType::VerbHook);
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0]["reason"], "playCompleted");
    assert_eq!(hooks[0]["callSid"], "c1");
}

#[tokio::test]
async fn hangup_command_terminates_session() {
    let app = json!([{"pause": {"length": 30}}]);
    let (fx, rx_event) = fixture(app, vec![]);

    let session = fx.session.clone();
    let handle = tokio::spawn(session.exec(rx_event));
    tokio::time::sleep(Duration::from_millis(100)).await;
    fx.tx_event
        .send(command(AppCommand::Hangup, Value::Null, false))
        .unwrap();

    let reason = timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, EndReason::TerminatedByApp);
    assert_eq!(fx.leg.status(), CallStatus::Completed);
    assert_eq!(fx.requestor.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn redirect_command_replaces_running_application() {
    let app = json!([{"pause": {"length": 30}}]);
    let (fx, rx_event) = fixture(app, vec![]);

    let session = fx.session.clone();
    let handle = tokio::spawn(session.exec(rx_event));
    tokio::time::sleep(Duration::from_millis(100)).await;
    fx.tx_event
        .send(command(
            AppCommand::Redirect,
            json!([{"play": {"url": "https://cdn.example/b.wav"}}]),
            false,
        ))
        .unwrap();

    let reason = timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, EndReason::AppCompleted);
    assert_eq!(fx.endpoint.plays(), vec!["https://cdn.example/b.wav"]);
    assert_eq!(fx.session.application_epoch().await, 1);
}

#[tokio::test]
async fn queued_redirect_appends_instead_of_replacing() {
    let app = json!([{"pause": {"length": 1}}]);
    let (fx, rx_event) = fixture(app, vec![]);

    let session = fx.session.clone();
    let handle = tokio::spawn(session.exec(rx_event));
    tokio::time::sleep(Duration::from_millis(100)).await;
    fx.tx_event
        .send(command(
            AppCommand::Redirect,
            json!([{"play": {"url": "https://cdn.example/appended.wav"}}]),
            true,
        ))
        .unwrap();

    let reason = timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, EndReason::AppCompleted);
    // the pause ran to completion, then the appended play
    assert_eq!(fx.endpoint.plays(), vec!["https://cdn.example/appended.wav"]);
    assert_eq!(fx.session.application_epoch().await, 0);
}

#[tokio::test]
async fn stale_epoch_hook_responses_are_discarded() {
    // play's action hook answers slowly with a say application; before it
    // lands, a redirect command replaces the application and bumps the epoch
    let app = json!([{"play": {"url": "https://cdn.example/a.wav", "actionHook": "/next"}}]);
    let script = vec![Script::DelayedRespond(
        Duration::from_millis(400),
        Some(json!([{"say": {"text": "stale"}}])),
    )];
    let (fx, rx_event) = fixture(app, script);

    let session = fx.session.clone();
    let handle = tokio::spawn(session.exec(rx_event));
    tokio::time::sleep(Duration::from_millis(150)).await;
    fx.tx_event
        .send(command(
            AppCommand::Redirect,
            json!([{"pause": {"length": 1}}]),
            false,
        ))
        .unwrap();

    let reason = timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, EndReason::AppCompleted);
    // the stale say application never ran
    assert_eq!(fx.synthesizer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unanswered_precondition_skips_task_on_answered_call() {
    let app = json!([
        {"sip:decline": {"status": 486}},
        {"play": {"url": "https://cdn.example/a.wav"}}
    ]);
    let (fx, rx_event) = fixture(app, vec![]);

    let reason = timeout(Duration::from_secs(5), fx.session.clone().exec(rx_event))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, EndReason::AppCompleted);
    assert_eq!(*fx.leg.declined.lock().unwrap(), None);
    assert_eq!(fx.endpoint.plays(), vec!["https://cdn.example/a.wav"]);
}

#[tokio::test]
async fn hangup_verb_ends_session_after_remaining_tasks_are_dropped() {
    let app = json!([
        {"hangup": {}},
        {"play": {"url": "https://cdn.example/never.wav"}}
    ]);
    let (fx, rx_event) = fixture(app, vec![]);

    let reason = timeout(Duration::from_secs(5), fx.session.clone().exec(rx_event))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, EndReason::TerminatedByApp);
    assert!(fx.endpoint.plays().is_empty());
}

#[tokio::test]
async fn config_enables_verb_status_notifications() {
    let app = json!([
        {"config": {"notifyEvents": true}},
        {"pause": {"length": 1}}
    ]);
    let (fx, rx_event) = fixture(app, vec![]);

    let reason = timeout(Duration::from_secs(5), fx.session.clone().exec(rx_event))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, EndReason::AppCompleted);

    let statuses = fx.requestor.requests_of(MessageType::VerbStatus);
    let pause_events: Vec<&Value> = statuses
        .iter()
        .filter(|status| status["verb"] == "pause")
        .collect();
    assert_eq!(pause_events.len(), 2);
    assert_eq!(pause_events[0]["event"], "begin");
    assert_eq!(pause_events[1]["event"], "end");
}

#[tokio::test]
async fn caller_hangup_kills_current_task() {
    let app = json!([{"pause": {"length": 30}}]);
    let (fx, rx_event) = fixture(app, vec![]);

    let session = fx.session.clone();
    let handle = tokio::spawn(session.exec(rx_event));
    tokio::time::sleep(Duration::from_millis(100)).await;
    fx.leg.set_status(CallStatus::Completed);

    let reason = timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, EndReason::CallerHungup);
    assert_eq!(fx.endpoint.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unhandled_command_replies_with_error() {
    let app = json!([{"pause": {"length": 1}}]);
    let (fx, rx_event) = fixture(app, vec![]);

    let session = fx.session.clone();
    let handle = tokio::spawn(session.exec(rx_event));
    tokio::time::sleep(Duration::from_millis(100)).await;
    fx.tx_event
        .send(command(
            AppCommand::TtsFlush,
            Value::Null,
            false,
        ))
        .unwrap();

    timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let errors = fx.requestor.requests_of(MessageType::JambonzError);
    assert_eq!(errors.len(), 1);
    assert!(errors[0]["error"].as_str().unwrap().contains("tts:flush"));
}

#[tokio::test]
async fn failing_task_ends_session_with_error_after_teardown() {
    // the mock dialer has no trunk and the verb has no action hook to
    // install an alternate application, so the dial error escapes exec
    let app = json!([
        {"dial": {"target": "+15556667777"}},
        {"play": {"url": "https://cdn.example/never.wav"}}
    ]);
    let (fx, rx_event) = fixture(app, vec![]);

    let err = timeout(Duration::from_secs(5), fx.session.clone().exec(rx_event))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.verb, TaskName::Dial);
    assert_matches!(err.source, TaskError::Signaling(_));

    // remaining tasks are dropped and teardown still runs every step
    assert!(fx.endpoint.plays().is_empty());
    assert_eq!(fx.endpoint.destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(fx.requestor.closed.load(Ordering::SeqCst), 1);
    let statuses = fx.requestor.requests_of(MessageType::CallStatus);
    assert!(
        statuses
            .last()
            .is_some_and(|status| status["endReason"].as_str().is_some_and(|r| r.contains("dial")))
    );
}
