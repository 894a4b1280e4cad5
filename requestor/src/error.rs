use crate::retry::RetryToken;

/// Failures surfaced by the webhook transports. Each variant maps onto at
/// most one retry-policy token; see [`RequestorError::retry_class`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestorError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("webhook returned status {status}")]
    HttpStatus { status: u16 },
    #[error("timed out waiting for application ack")]
    ResponseTimeout,
    #[error("websocket handshake rejected (status {status:?})")]
    Handshake { status: Option<u16> },
    #[error("malformed application frame: {0}")]
    Protocol(String),
    #[error("outbound queue overflow")]
    QueueOverflow,
    #[error("invalid hook url: {0}")]
    InvalidUrl(String),
    #[error("requestor is closed")]
    Closed,
}

impl RequestorError {
    /// The retry-policy token that may retry this error, if any.
    pub fn retry_class(&self) -> Option<RetryToken> {
        match self {
            RequestorError::Transport(_) | RequestorError::Handshake { .. } => {
                Some(RetryToken::ConnectTimeout)
            }
            RequestorError::ResponseTimeout => Some(RetryToken::ResponseTimeout),
            RequestorError::HttpStatus { status } if (400..500).contains(status) => {
                Some(RetryToken::Status4xx)
            }
            RequestorError::HttpStatus { status } if (500..600).contains(status) => {
                Some(RetryToken::Status5xx)
            }
            _ => None,
        }
    }
}
