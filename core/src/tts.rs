use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::MediaError;

/// Text-to-speech seam. Synthesis writes a temp audio file; the session
/// tracks and removes it at teardown.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<PathBuf, MediaError>;
}
