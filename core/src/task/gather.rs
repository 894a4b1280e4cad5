use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jambonz_protocol::Hook;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use crate::error::TaskError;
use crate::task::Precondition;
use crate::task::Task;
use crate::task::TaskContext;
use crate::task::TaskControl;
use crate::task::TaskName;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatherData {
    #[serde(default = "default_input")]
    input: Vec<String>,
    #[serde(default)]
    num_digits: Option<usize>,
    #[serde(default)]
    finish_on_key: Option<String>,
    /// Seconds of silence before giving up.
    #[serde(default = "default_timeout")]
    timeout: u64,
    action_hook: Hook,
}

fn default_input() -> Vec<String> {
    vec!["digits".to_string()]
}

fn default_timeout() -> u64 {
    8
}

/// Collect DTMF digits and/or a speech transcription, then report the
/// result through the action hook, which may redirect the application.
#[derive(Debug)]
pub struct GatherTask {
    data: GatherData,
    ctl: TaskControl,
}

impl GatherTask {
    pub fn from_data(data: &Value) -> Result<Self, TaskError> {
        let data: GatherData = serde_json::from_value(data.clone())
            .map_err(|err| TaskError::Invalid(format!("gather: {err}")))?;
        Ok(Self {
            data,
            ctl: TaskControl::new(),
        })
    }

    fn wants(&self, kind: &str) -> bool {
        self.data.input.iter().any(|input| input == kind)
    }
}

#[async_trait]
impl Task for GatherTask {
    fn name(&self) -> TaskName {
        TaskName::Gather
    }

    fn preconditions(&self) -> Precondition {
        Precondition::Endpoint
    }

    async fn exec(self: Arc<Self>, ctx: Arc<TaskContext>) -> Result<(), TaskError> {
        let endpoint = Arc::clone(ctx.endpoint()?);
        let wants_digits = self.wants("digits");
        let wants_speech = self.wants("speech");
        let mut dtmf_rx = endpoint.dtmf();
        let mut transcription_rx = endpoint.custom_events("transcription");
        let mut dtmf_open = wants_digits;
        let mut speech_open = wants_speech;

        let deadline = tokio::time::sleep(Duration::from_secs(self.data.timeout));
        tokio::pin!(deadline);

        let mut digits = String::new();
        let mut speech: Option<Value> = None;

        let reason = loop {
            tokio::select! {
                _ = &mut deadline => break "timeout",
                _ = self.ctl.cancelled() => break "killed",
                digit = dtmf_rx.recv(), if dtmf_open => {
                    match digit {
                        Ok(dtmf) => {
                            let key = dtmf.digit.to_string();
                            if self.data.finish_on_key.as_deref() == Some(key.as_str()) {
                                break "dtmfDetected";
                            }
                            digits.push(dtmf.digit);
                            if let Some(max) = self.data.num_digits
                                && digits.len() >= max
                            {
                                break "dtmfDetected";
                            }
                        }
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => dtmf_open = false,
                    }
                }
                event = transcription_rx.recv(), if speech_open => {
                    match event {
                        Ok(event) => {
                            speech = Some(event);
                            break "speechDetected";
                        }
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => speech_open = false,
                    }
                }
            }
        };

        if reason == "killed" {
            return Ok(());
        }

        let mut result = json!({"reason": reason});
        if let Some(map) = result.as_object_mut() {
            if !digits.is_empty() {
                map.insert("digits".to_string(), json!(digits));
            }
            if let Some(speech) = speech {
                map.insert("speech".to_string(), speech);
            }
        }
        ctx.perform_action(Some(&self.data.action_hook), result).await;
        Ok(())
    }

    async fn kill(&self, _ctx: &TaskContext) {
        self.ctl.kill();
    }
}
