//! The task model: one task per verb, executed strictly serially by the
//! session. Tasks borrow the session through [`TaskContext`] for the
//! duration of `exec` only.

pub mod config;
pub mod dial;
pub mod gather;
pub mod hangup;
pub mod pause;
pub mod play;
pub mod redirect;
pub mod registry;
pub mod say;
pub mod sip_decline;
pub mod transcribe;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use jambonz_protocol::AppCommand;
use jambonz_protocol::Hook;
use jambonz_protocol::MessageType;
use jambonz_protocol::parse_application;
use jambonz_requestor::CommandEvent;
use jambonz_requestor::Requestor;
use jambonz_requestor::RequestorError;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::WaitForCancellationFuture;
use tracing::debug;

use crate::error::TaskError;
use crate::media::MediaEndpoint;
use crate::session::CallSession;
use crate::sip::CallLeg;
use crate::sip::CallerInfo;
use crate::sip::Dialer;
use crate::tts::Synthesizer;

/// Closed set of verbs the interpreter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskName {
    Say,
    Play,
    Gather,
    Transcribe,
    Pause,
    Hangup,
    SipDecline,
    Config,
    Redirect,
    Dial,
}

impl TaskName {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskName::Say => "say",
            TaskName::Play => "play",
            TaskName::Gather => "gather",
            TaskName::Transcribe => "transcribe",
            TaskName::Pause => "pause",
            TaskName::Hangup => "hangup",
            TaskName::SipDecline => "sip:decline",
            TaskName::Config => "config",
            TaskName::Redirect => "redirect",
            TaskName::Dial => "dial",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "say" => Some(TaskName::Say),
            "play" => Some(TaskName::Play),
            "gather" => Some(TaskName::Gather),
            "transcribe" => Some(TaskName::Transcribe),
            "pause" => Some(TaskName::Pause),
            "hangup" => Some(TaskName::Hangup),
            "sip:decline" => Some(TaskName::SipDecline),
            "config" => Some(TaskName::Config),
            "redirect" => Some(TaskName::Redirect),
            "dial" => Some(TaskName::Dial),
            _ => None,
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the session must guarantee before a task's `exec` runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Precondition {
    #[default]
    None,
    /// Dialog established; the session answers on demand.
    StableCall,
    /// A media endpoint is allocated, creating one if needed.
    Endpoint,
    /// No final response sent yet; the task implies one.
    UnansweredCall,
}

/// One verb's lifecycle. `exec` runs to completion or until `kill` makes it
/// resolve; the session awaits exactly that future before advancing.
#[async_trait]
pub trait Task: std::fmt::Debug + Send + Sync {
    fn name(&self) -> TaskName;

    fn preconditions(&self) -> Precondition {
        Precondition::None
    }

    async fn exec(self: Arc<Self>, ctx: Arc<TaskContext>) -> Result<(), TaskError>;

    /// Idempotent. Must stop any media work the task started and cause
    /// `exec` to resolve within the session's grace period.
    async fn kill(&self, ctx: &TaskContext);

    /// Whether this task consumes the given application command.
    fn handles_command(&self, command: &AppCommand) -> bool {
        let _ = command;
        false
    }

    async fn deliver_command(&self, event: CommandEvent) {
        let _ = event;
    }
}

/// Kill plumbing shared by every verb: a cancellation token plus an
/// idempotency latch.
#[derive(Debug, Default)]
pub struct TaskControl {
    cancel: CancellationToken,
    killed: AtomicBool,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kill(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// The session's face toward a running task: call identity, the endpoint
/// satisfying the task's precondition, and hook plumbing with the
/// application epoch captured at task start.
pub struct TaskContext {
    session: Arc<CallSession>,
    endpoint: Option<Arc<dyn MediaEndpoint>>,
    epoch: u64,
}

impl TaskContext {
    pub(crate) fn new(
        session: Arc<CallSession>,
        endpoint: Option<Arc<dyn MediaEndpoint>>,
        epoch: u64,
    ) -> Self {
        Self {
            session,
            endpoint,
            epoch,
        }
    }

    pub fn caller_info(&self) -> &CallerInfo {
        self.session.caller_info()
    }

    pub fn call_sid(&self) -> &str {
        &self.session.caller_info().call_sid
    }

    pub fn endpoint(&self) -> Result<&Arc<dyn MediaEndpoint>, TaskError> {
        self.endpoint
            .as_ref()
            .ok_or_else(|| TaskError::Precondition("no media endpoint".to_string()))
    }

    pub fn leg(&self) -> &Arc<dyn CallLeg> {
        self.session.leg()
    }

    pub fn synthesizer(&self) -> &Arc<dyn Synthesizer> {
        &self.session.services().synthesizer
    }

    pub fn dialer(&self) -> &Arc<dyn Dialer> {
        &self.session.services().dialer
    }

    pub async fn track_tmp_file(&self, path: PathBuf) {
        self.session.track_tmp_file(path).await;
    }

    pub async fn set_notify_events(&self, enabled: bool) {
        self.session.set_notify_events(enabled).await;
    }

    /// Terminate the session once this task returns.
    pub async fn terminate_session(&self, reason: crate::error::EndReason) {
        self.session.terminate(reason).await;
    }

    /// Invoke a webhook with the standard call identifiers merged in.
    pub async fn request_hook(
        &self,
        kind: MessageType,
        hook: &Hook,
        params: Value,
    ) -> Result<Option<Value>, RequestorError> {
        let requestor = self.session.requestor().await;
        let mut merged = self.session.caller_info().hook_params();
        if let (Some(out), Some(extra)) = (merged.as_object_mut(), params.as_object()) {
            for (key, value) in extra {
                out.insert(key.clone(), value.clone());
            }
        }
        requestor
            .request(kind, Some(hook), merged, self.session.b3().as_deref())
            .await
    }

    /// Event/action hook reporting: a response that is an array of verb
    /// nodes replaces the remainder of the application, unless this task's
    /// epoch is stale by the time the response arrives. Returns whether a
    /// replacement happened.
    pub async fn perform_hook(&self, hook: &Hook, results: Value) -> Result<bool, TaskError> {
        let response = self
            .request_hook(MessageType::VerbHook, hook, results)
            .await?;
        match response {
            Some(value) if value.is_array() => {
                let verbs = parse_application(&value)
                    .map_err(|err| TaskError::Invalid(err.to_string()))?;
                self.session
                    .replace_application_guarded(self.epoch, verbs)
                    .await
            }
            _ => Ok(false),
        }
    }

    /// Action-hook reporting at task completion. A missing hook is a no-op;
    /// a failing hook is recorded, not raised.
    pub async fn perform_action(&self, hook: Option<&Hook>, result: Value) {
        let Some(hook) = hook else {
            return;
        };
        match self.perform_hook(hook, result).await {
            Ok(replaced) => {
                if replaced {
                    debug!("action hook replaced the application");
                }
            }
            Err(err) => {
                debug!("action hook failed: {err}");
            }
        }
    }
}
