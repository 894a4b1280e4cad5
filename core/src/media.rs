use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::MediaError;

/// A DTMF key press reported by the media server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtmf {
    pub digit: char,
    pub duration_ms: u32,
}

/// One call leg's media handle. Event surfaces are broadcast channels so a
/// task can subscribe for the duration of its `exec` and simply drop the
/// receiver when done.
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    /// Run a media-server API command (`uuid_break`, `uuid_bridge`, ...).
    async fn api(&self, verb: &str, args: &[String]) -> Result<Value, MediaError>;

    /// Play an audio file to completion.
    async fn play(&self, path: &str) -> Result<(), MediaError>;

    /// Set a channel variable.
    async fn set(&self, key: &str, value: &str) -> Result<(), MediaError>;

    /// Subscribe to a named custom event stream (e.g. `transcription`).
    fn custom_events(&self, name: &str) -> broadcast::Receiver<Value>;

    fn dtmf(&self) -> broadcast::Receiver<Dtmf>;

    fn uuid(&self) -> &str;

    fn connected(&self) -> bool;

    /// Release the endpoint. The session guarantees exactly one call.
    async fn destroy(&self) -> Result<(), MediaError>;
}

#[async_trait]
pub trait MediaServer: Send + Sync {
    async fn allocate(&self) -> Result<Arc<dyn MediaEndpoint>, MediaError>;
}
