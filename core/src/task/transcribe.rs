use std::sync::Arc;

use async_trait::async_trait;
use jambonz_protocol::Hook;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::error::TaskError;
use crate::task::Precondition;
use crate::task::Task;
use crate::task::TaskContext;
use crate::task::TaskControl;
use crate::task::TaskName;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranscribeData {
    transcription_hook: Hook,
    #[serde(default)]
    recognizer: Option<Value>,
}

/// Stream transcriptions of the caller's audio to the transcription hook
/// until killed. Each hook response may redirect the application.
#[derive(Debug)]
pub struct TranscribeTask {
    data: TranscribeData,
    ctl: TaskControl,
}

impl TranscribeTask {
    pub fn from_data(data: &Value) -> Result<Self, TaskError> {
        let data: TranscribeData = serde_json::from_value(data.clone())
            .map_err(|err| TaskError::Invalid(format!("transcribe: {err}")))?;
        Ok(Self {
            data,
            ctl: TaskControl::new(),
        })
    }
}

#[async_trait]
impl Task for TranscribeTask {
    fn name(&self) -> TaskName {
        TaskName::Transcribe
    }

    fn preconditions(&self) -> Precondition {
        Precondition::Endpoint
    }

    async fn exec(self: Arc<Self>, ctx: Arc<TaskContext>) -> Result<(), TaskError> {
        let endpoint = Arc::clone(ctx.endpoint()?);
        let mut transcriptions = endpoint.custom_events("transcription");

        let mut args = vec![endpoint.uuid().to_string(), "start".to_string()];
        if let Some(recognizer) = self.data.recognizer.as_ref() {
            args.push(recognizer.to_string());
        }
        endpoint.api("uuid_transcribe", &args).await?;

        loop {
            tokio::select! {
                _ = self.ctl.cancelled() => break,
                event = transcriptions.recv() => {
                    match event {
                        Ok(event) => {
                            if let Err(err) = ctx
                                .perform_hook(&self.data.transcription_hook, json!({"speech": event}))
                                .await
                            {
                                debug!("transcription hook failed: {err}");
                            }
                        }
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }

        let stop = vec![endpoint.uuid().to_string(), "stop".to_string()];
        let _ = endpoint.api("uuid_transcribe", &stop).await;
        Ok(())
    }

    async fn kill(&self, _ctx: &TaskContext) {
        self.ctl.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requires_transcription_hook() {
        assert!(TranscribeTask::from_data(&json!({})).is_err());
        assert!(TranscribeTask::from_data(&json!({"transcriptionHook": "/transcripts"})).is_ok());
    }
}
