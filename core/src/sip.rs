use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use tokio::sync::broadcast;

use crate::error::SignalingError;
use crate::media::MediaEndpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
        }
    }
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Trying,
    Ringing,
    EarlyMedia,
    InProgress,
    Completed,
    Failed,
    Busy,
    NoAnswer,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Trying => "trying",
            CallStatus::Ringing => "ringing",
            CallStatus::EarlyMedia => "early-media",
            CallStatus::InProgress => "in-progress",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::Busy => "busy",
            CallStatus::NoAnswer => "no-answer",
        }
    }

    /// Terminal statuses end the dialog.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            CallStatus::Completed | CallStatus::Failed | CallStatus::Busy | CallStatus::NoAnswer
        )
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an accepted call, fixed for the session's lifetime.
#[derive(Debug, Clone)]
pub struct CallerInfo {
    pub call_sid: String,
    pub account_sid: String,
    pub application_sid: Option<String>,
    pub from: String,
    pub to: String,
    pub direction: CallDirection,
    pub caller_name: Option<String>,
}

impl CallerInfo {
    /// Standard call identifiers attached to every hook payload.
    pub fn hook_params(&self) -> Value {
        json!({
            "callSid": self.call_sid,
            "accountSid": self.account_sid,
            "applicationSid": self.application_sid,
            "from": self.from,
            "to": self.to,
            "direction": self.direction.as_str(),
            "callerName": self.caller_name,
        })
    }
}

/// The accepted SIP dialog, owned by the signalling layer. The session only
/// steers it through this seam.
#[async_trait]
pub trait CallLeg: Send + Sync {
    async fn answer(&self) -> Result<(), SignalingError>;

    /// Send the final non-2xx response on an unanswered call.
    async fn decline(&self, status: u16, reason: Option<&str>) -> Result<(), SignalingError>;

    async fn hangup(&self) -> Result<(), SignalingError>;

    fn status(&self) -> CallStatus;

    /// Dialog status changes, including the remote hangup.
    fn status_stream(&self) -> broadcast::Receiver<CallStatus>;

    fn answered(&self) -> bool {
        self.status() == CallStatus::InProgress
    }
}

/// A placed outbound leg plus its media handle, ready for bridging.
pub struct OutboundCall {
    pub leg: Arc<dyn CallLeg>,
    pub endpoint: Arc<dyn MediaEndpoint>,
}

/// Outdial seam used by the `dial` verb.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn place_call(
        &self,
        from: &str,
        to: &str,
        timeout: Duration,
    ) -> Result<OutboundCall, SignalingError>;
}
