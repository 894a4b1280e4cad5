use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::TaskError;
use crate::task::Precondition;
use crate::task::Task;
use crate::task::TaskContext;
use crate::task::TaskControl;
use crate::task::TaskName;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SayData {
    text: String,
    #[serde(rename = "loop", default = "default_loop")]
    count: u32,
    #[serde(default)]
    synthesizer: Option<SynthesizerOptions>,
}

#[derive(Debug, Deserialize)]
struct SynthesizerOptions {
    #[serde(default)]
    voice: Option<String>,
}

fn default_loop() -> u32 {
    1
}

/// Synthesize text and play it to the caller, optionally looped.
#[derive(Debug)]
pub struct SayTask {
    data: SayData,
    ctl: TaskControl,
}

impl SayTask {
    pub fn from_data(data: &Value) -> Result<Self, TaskError> {
        let data: SayData = serde_json::from_value(data.clone())
            .map_err(|err| TaskError::Invalid(format!("say: {err}")))?;
        Ok(Self {
            data,
            ctl: TaskControl::new(),
        })
    }
}

#[async_trait]
impl Task for SayTask {
    fn name(&self) -> TaskName {
        TaskName::Say
    }

    fn preconditions(&self) -> Precondition {
        Precondition::Endpoint
    }

    async fn exec(self: Arc<Self>, ctx: Arc<TaskContext>) -> Result<(), TaskError> {
        let endpoint = Arc::clone(ctx.endpoint()?);
        let voice = self
            .data
            .synthesizer
            .as_ref()
            .and_then(|options| options.voice.as_deref());
        let path = ctx.synthesizer().synthesize(&self.data.text, voice).await?;
        ctx.track_tmp_file(path.clone()).await;
        let file = path.to_string_lossy().into_owned();

        for _ in 0..self.data.count {
            if self.ctl.killed() {
                break;
            }
            tokio::select! {
                result = endpoint.play(&file) => {
                    result?;
                }
                _ = self.ctl.cancelled() => {
                    let _ = endpoint
                        .api("uuid_break", &[endpoint.uuid().to_string()])
                        .await;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn kill(&self, _ctx: &TaskContext) {
        self.ctl.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_minimal_data() {
        let task = SayTask::from_data(&json!({"text": "hi"})).unwrap();
        assert_eq!(task.data.text, "hi");
        assert_eq!(task.data.count, 1);
    }

    #[test]
    fn parses_loop_and_voice() {
        let task = SayTask::from_data(&json!({
            "text": "hi",
            "loop": 3,
            "synthesizer": {"voice": "en-US-Standard-C"}
        }))
        .unwrap();
        assert_eq!(task.data.count, 3);
        assert_eq!(
            task.data.synthesizer.unwrap().voice.as_deref(),
            Some("en-US-Standard-C")
        );
    }

    #[test]
    fn rejects_missing_text() {
        assert!(SayTask::from_data(&json!({})).is_err());
    }
}
