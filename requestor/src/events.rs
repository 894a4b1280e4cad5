use std::fmt;
use std::sync::Arc;

use jambonz_protocol::AppCommand;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::Requestor;

/// An asynchronous command pushed by the application over the WebSocket
/// channel.
#[derive(Debug, Clone)]
pub struct CommandEvent {
    pub command: AppCommand,
    pub msgid: Option<String>,
    pub call_sid: Option<String>,
    pub queue_command: bool,
    pub tool_call_id: Option<String>,
    pub data: Value,
}

/// Events a requestor surfaces to its owning session. Delivered on an
/// unbounded channel drained by the session's main loop.
pub enum RequestorEvent {
    /// The target hook implied a different transport; the session should
    /// swap to the provided requestor.
    Handover(Arc<dyn Requestor>),
    Command(CommandEvent),
    /// The WebSocket was lost non-gracefully. Advisory; reconnects are
    /// handled inside the requestor.
    ConnectionDropped,
}

impl fmt::Debug for RequestorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestorEvent::Handover(_) => f.write_str("Handover(..)"),
            RequestorEvent::Command(event) => f.debug_tuple("Command").field(event).finish(),
            RequestorEvent::ConnectionDropped => f.write_str("ConnectionDropped"),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<RequestorEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<RequestorEvent>;

/// Build the channel connecting a session to its requestors.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
