use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use assert_matches::assert_matches;
use jambonz_protocol::Hook;
use jambonz_protocol::MessageType;
use jambonz_requestor::Alert;
use jambonz_requestor::Alerter;
use jambonz_requestor::BaseRequestor;
use jambonz_requestor::HttpConfig;
use jambonz_requestor::HttpRequestor;
use jambonz_requestor::Requestor;
use jambonz_requestor::RequestorContext;
use jambonz_requestor::RequestorError;
use jambonz_requestor::event_channel;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

#[derive(Default)]
struct RecordingAlerter {
    alerts: Mutex<Vec<Alert>>,
}

impl Alerter for RecordingAlerter {
    fn alert(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

fn requestor_for(server: &MockServer, secret: Option<&str>) -> HttpRequestor {
    let base = BaseRequestor::new("acct-1", &server.uri(), secret.map(str::to_string))
        .unwrap()
        .with_http_config(HttpConfig::default());
    let (tx_event, _rx_event) = event_channel();
    HttpRequestor::new(base, RequestorContext::new(HttpConfig::default()), tx_event)
}

#[tokio::test]
async fn returns_parsed_json_application() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"say": {"text": "hi"}}])),
        )
        .mount(&server)
        .await;

    let requestor = requestor_for(&server, None);
    let response = requestor
        .request(
            MessageType::VerbHook,
            Some(&Hook::new(format!("{}/hook", server.uri()))),
            json!({"callSid": "c1"}),
            None,
        )
        .await?;

    assert_eq!(response, Some(json!([{"say": {"text": "hi"}}])));

    let requests = server
        .received_requests()
        .await
        .context("request recording enabled")?;
    assert_eq!(requests.len(), 1);
    let body: Value = serde_json::from_slice(&requests[0].body)?;
    assert_eq!(body, json!({"call_sid": "c1"}));
    Ok(())
}

#[tokio::test]
async fn accepted_statuses_yield_empty_responses() {
    for status in [202u16, 204] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        let requestor = requestor_for(&server, None);
        let response = requestor
            .request(
                MessageType::CallStatus,
                Some(&Hook::new(format!("{}/status", server.uri()))),
                json!({"callStatus": "completed"}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(response, None, "status {status} should be empty success");
    }
}

#[tokio::test]
async fn redirects_are_not_followed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(301).insert_header("location", "https://elsewhere.example/"),
        )
        .mount(&server)
        .await;

    let requestor = requestor_for(&server, None);
    let err = requestor
        .request(
            MessageType::VerbHook,
            Some(&Hook::new(format!("{}/hook", server.uri()))),
            json!({}),
            None,
        )
        .await
        .unwrap_err();
    assert_matches!(err, RequestorError::HttpStatus { status: 301 });
}

#[tokio::test]
async fn retry_policy_from_fragment_is_honored() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let requestor = requestor_for(&server, None);
    let started = std::time::Instant::now();
    let response = requestor
        .request(
            MessageType::VerbHook,
            Some(&Hook::new(format!("{}/hook#rp=5xx,ct&rc=3", server.uri()))),
            json!({}),
            None,
        )
        .await
        .unwrap();

    assert_eq!(response, None);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    // backoff schedule: 500 ms after the first failure, 1000 ms after the second
    assert!(started.elapsed() >= std::time::Duration::from_millis(1_500));
}

#[tokio::test]
async fn status_failures_do_not_retry_without_matching_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let requestor = requestor_for(&server, None);
    let err = requestor
        .request(
            MessageType::VerbHook,
            Some(&Hook::new(format!("{}/hook#rc=3", server.uri()))),
            json!({}),
            None,
        )
        .await
        .unwrap_err();

    assert_matches!(err, RequestorError::HttpStatus { status: 500 });
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn signs_body_and_sends_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let requestor = requestor_for(&server, Some("wh_secret"));
    let hook = Hook::new(format!("{}/hook", server.uri())).with_basic_auth("user", "pass");
    requestor
        .request(MessageType::VerbHook, Some(&hook), json!({"callSid": "c1"}), Some("b3-trace"))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let headers = &requests[0].headers;
    let signature = headers.get("JB-Signature").unwrap().to_str().unwrap();
    assert!(signature.starts_with("t="));
    assert!(signature.contains(",v1="));
    let auth = headers.get("authorization").unwrap().to_str().unwrap();
    assert!(auth.starts_with("Basic "));
    assert_eq!(headers.get("b3").unwrap(), "b3-trace");
}

#[tokio::test]
async fn jambonz_error_messages_are_suppressed_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let requestor = requestor_for(&server, None);
    let response = requestor
        .request(
            MessageType::JambonzError,
            Some(&Hook::new(format!("{}/hook", server.uri()))),
            json!({"error": "bad verb"}),
            None,
        )
        .await
        .unwrap();

    assert_eq!(response, None);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn closed_requestor_discards_requests() {
    let server = MockServer::start().await;
    let requestor = requestor_for(&server, None);
    requestor.close().await;

    let response = requestor
        .request(
            MessageType::VerbHook,
            Some(&Hook::new(format!("{}/hook", server.uri()))),
            json!({}),
            None,
        )
        .await
        .unwrap();
    assert_eq!(response, None);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn status_failure_raises_alert() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let alerter = Arc::new(RecordingAlerter::default());
    let base = BaseRequestor::new("acct-1", &server.uri(), None).unwrap();
    let (tx_event, _rx_event) = event_channel();
    let ctx = RequestorContext::new(HttpConfig::default()).with_alerter(alerter.clone());
    let requestor = HttpRequestor::new(base, ctx, tx_event);

    let _ = requestor
        .request(
            MessageType::VerbHook,
            Some(&Hook::new(format!("{}/hook", server.uri()))),
            json!({}),
            None,
        )
        .await;

    let alerts = alerter.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(
        alerts[0].kind,
        jambonz_requestor::AlertKind::WebhookStatusFailure
    );
}

#[tokio::test]
async fn exception_keys_survive_snake_casing() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let requestor = requestor_for(&server, None);
    requestor
        .request(
            MessageType::VerbHook,
            Some(&Hook::new(format!("{}/hook", server.uri()))),
            json!({
                "callSid": "c1",
                "customerData": {"myKey": 1},
                "sip": {"headerName": "X"},
                "env_vars": {"MY_VAR": "v"},
                "args": {"toolArg": true}
            }),
            None,
        )
        .await?;

    let requests = server
        .received_requests()
        .await
        .context("request recording enabled")?;
    let body: Value = serde_json::from_slice(&requests[0].body)?;
    assert_eq!(body["call_sid"], json!("c1"));
    assert_eq!(body["customerData"], json!({"myKey": 1}));
    assert_eq!(body["sip"], json!({"headerName": "X"}));
    assert_eq!(body["env_vars"], json!({"MY_VAR": "v"}));
    assert_eq!(body["args"], json!({"toolArg": true}));
    Ok(())
}
