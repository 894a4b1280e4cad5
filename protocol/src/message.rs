use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Frame types the feature server sends to a customer application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "session:new")]
    SessionNew,
    #[serde(rename = "session:reconnect")]
    SessionReconnect,
    #[serde(rename = "session:redirect")]
    SessionRedirect,
    #[serde(rename = "call:status")]
    CallStatus,
    #[serde(rename = "verb:status")]
    VerbStatus,
    #[serde(rename = "verb:hook")]
    VerbHook,
    #[serde(rename = "dial:confirm")]
    DialConfirm,
    #[serde(rename = "jambonz:error")]
    JambonzError,
    #[serde(rename = "llm:event")]
    LlmEvent,
    #[serde(rename = "llm:tool-call")]
    LlmToolCall,
    #[serde(rename = "tts:streaming-event")]
    TtsStreamingEvent,
    #[serde(rename = "tts:tokens-result")]
    TtsTokensResult,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::SessionNew => "session:new",
            MessageType::SessionReconnect => "session:reconnect",
            MessageType::SessionRedirect => "session:redirect",
            MessageType::CallStatus => "call:status",
            MessageType::VerbStatus => "verb:status",
            MessageType::VerbHook => "verb:hook",
            MessageType::DialConfirm => "dial:confirm",
            MessageType::JambonzError => "jambonz:error",
            MessageType::LlmEvent => "llm:event",
            MessageType::LlmToolCall => "llm:tool-call",
            MessageType::TtsStreamingEvent => "tts:streaming-event",
            MessageType::TtsTokensResult => "tts:tokens-result",
        }
    }

    /// Whether a send of this type must be answered with an `ack` frame.
    pub fn wants_ack(self) -> bool {
        !matches!(
            self,
            MessageType::CallStatus
                | MessageType::VerbStatus
                | MessageType::JambonzError
                | MessageType::LlmEvent
                | MessageType::LlmToolCall
                | MessageType::TtsStreamingEvent
                | MessageType::TtsTokensResult
        )
    }

    /// The hook field is included only on the frame types that represent a
    /// webhook invocation; everything else omits it.
    pub fn carries_hook(self) -> bool {
        matches!(
            self,
            MessageType::SessionNew
                | MessageType::SessionReconnect
                | MessageType::SessionRedirect
                | MessageType::VerbHook
                | MessageType::DialConfirm
                | MessageType::LlmToolCall
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame sent from the feature server to the application over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub msgid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b3: Option<String>,
}

/// A frame received from the application over WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    Ack {
        msgid: String,
        #[serde(default)]
        data: Option<Value>,
    },
    Command {
        command: String,
        #[serde(default)]
        msgid: Option<String>,
        #[serde(default)]
        call_sid: Option<String>,
        #[serde(default, rename = "queueCommand")]
        queue_command: bool,
        #[serde(default)]
        tool_call_id: Option<String>,
        #[serde(default)]
        data: Option<Value>,
    },
}

/// Commands an application may push asynchronously over the WebSocket
/// channel. Unrecognized command names are carried through so the session
/// can report them back to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    Redirect,
    Hangup,
    Mute,
    Unmute,
    Pause,
    Resume,
    LlmToolOutput,
    TtsFlush,
    TtsClear,
    Unknown(String),
}

impl AppCommand {
    pub fn parse(command: &str) -> Self {
        match command {
            "redirect" => AppCommand::Redirect,
            "hangup" => AppCommand::Hangup,
            "mute" => AppCommand::Mute,
            "unmute" => AppCommand::Unmute,
            "pause" => AppCommand::Pause,
            "resume" => AppCommand::Resume,
            "llm:tool-output" => AppCommand::LlmToolOutput,
            "tts:flush" => AppCommand::TtsFlush,
            "tts:clear" => AppCommand::TtsClear,
            other => AppCommand::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AppCommand::Redirect => "redirect",
            AppCommand::Hangup => "hangup",
            AppCommand::Mute => "mute",
            AppCommand::Unmute => "unmute",
            AppCommand::Pause => "pause",
            AppCommand::Resume => "resume",
            AppCommand::LlmToolOutput => "llm:tool-output",
            AppCommand::TtsFlush => "tts:flush",
            AppCommand::TtsClear => "tts:clear",
            AppCommand::Unknown(name) => name,
        }
    }
}

impl fmt::Display for AppCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
