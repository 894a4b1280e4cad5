use std::sync::Arc;

use async_trait::async_trait;
use jambonz_protocol::Hook;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;

use crate::error::TaskError;
use crate::task::Precondition;
use crate::task::Task;
use crate::task::TaskContext;
use crate::task::TaskControl;
use crate::task::TaskName;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlaySource {
    One(String),
    Many(Vec<String>),
}

impl PlaySource {
    fn urls(&self) -> Vec<&str> {
        match self {
            PlaySource::One(url) => vec![url.as_str()],
            PlaySource::Many(urls) => urls.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayData {
    url: PlaySource,
    #[serde(rename = "loop", default = "default_loop")]
    count: u32,
    #[serde(default)]
    action_hook: Option<Hook>,
}

fn default_loop() -> u32 {
    1
}

/// Play one or more audio files to the caller.
#[derive(Debug)]
pub struct PlayTask {
    data: PlayData,
    ctl: TaskControl,
}

impl PlayTask {
    pub fn from_data(data: &Value) -> Result<Self, TaskError> {
        let data: PlayData = serde_json::from_value(data.clone())
            .map_err(|err| TaskError::Invalid(format!("play: {err}")))?;
        Ok(Self {
            data,
            ctl: TaskControl::new(),
        })
    }
}

#[async_trait]
impl Task for PlayTask {
    fn name(&self) -> TaskName {
        TaskName::Play
    }

    fn preconditions(&self) -> Precondition {
        Precondition::Endpoint
    }

    async fn exec(self: Arc<Self>, ctx: Arc<TaskContext>) -> Result<(), TaskError> {
        let endpoint = Arc::clone(ctx.endpoint()?);

        'looping: for _ in 0..self.data.count {
            for url in self.data.url.urls() {
                if self.ctl.killed() {
                    break 'looping;
                }
                tokio::select! {
                    result = endpoint.play(url) => {
                        result?;
                    }
                    _ = self.ctl.cancelled() => {
                        let _ = endpoint
                            .api("uuid_break", &[endpoint.uuid().to_string()])
                            .await;
                        break 'looping;
                    }
                }
            }
        }

        let reason = if self.ctl.killed() {
            "playKilled"
        } else {
            "playCompleted"
        };
        ctx.perform_action(self.data.action_hook.as_ref(), json!({"reason": reason}))
            .await;
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
    fn parses_single_and_multiple_urls() {
        let task = PlayTask::from_data(&json!({"url": "https://cdn.example/a.wav"})).unwrap();
        assert_eq!(task.data.url.urls(), vec!["https://cdn.example/a.wav"]);

        let task = PlayTask::from_data(&json!({
            "url": ["https://cdn.example/a.wav", "https://cdn.example/b.wav"],
            "loop": 2
        }))
        .unwrap();
        assert_eq!(task.data.url.urls().len(), 2);
        assert_eq!(task.data.count, 2);
    }
}
