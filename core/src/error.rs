use std::fmt;

use jambonz_requestor::RequestorError;

use crate::task::TaskName;

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("media endpoint unavailable: {0}")]
    Unavailable(String),
    #[error("media command failed: {0}")]
    Command(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("call already answered")]
    AlreadyAnswered,
    #[error("signaling failure: {0}")]
    Failure(String),
}

/// Verb-level failures. A failing hook or media call is recorded by the
/// task; whether it ends the session is the session's decision.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("invalid verb data: {0}")]
    Invalid(String),
    #[error("precondition not met: {0}")]
    Precondition(String),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("hook failed: {0}")]
    Hook(#[from] RequestorError),
}

/// A task failure the verb let escape its `exec` instead of recording it.
/// Fatal: the session stops advancing, runs teardown, and reports this to
/// its caller.
#[derive(Debug, thiserror::Error)]
#[error("verb {verb} failed: {source}")]
pub struct SessionError {
    pub verb: TaskName,
    #[source]
    pub source: TaskError,
}

/// Why a session ended. Signalling hangup and local termination both unwind
/// the task loop and run teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The application ran out of verbs.
    AppCompleted,
    CallerHungup,
    /// `hangup` verb or `hangup` command.
    TerminatedByApp,
    Error(String),
}

impl EndReason {
    pub fn as_str(&self) -> &str {
        match self {
            EndReason::AppCompleted => "app completed",
            EndReason::CallerHungup => "caller hungup",
            EndReason::TerminatedByApp => "terminated by app",
            EndReason::Error(detail) => detail,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
