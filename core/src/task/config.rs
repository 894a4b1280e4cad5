use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::TaskError;
use crate::task::Task;
use crate::task::TaskContext;
use crate::task::TaskName;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigData {
    #[serde(default)]
    notify_events: Option<bool>,
}

/// Adjust session-level behavior mid-application.
#[derive(Debug)]
pub struct ConfigTask {
    data: ConfigData,
}

impl ConfigTask {
    pub fn from_data(data: &Value) -> Result<Self, TaskError> {
        let data: ConfigData = serde_json::from_value(data.clone())
            .map_err(|err| TaskError::Invalid(format!("config: {err}")))?;
        Ok(Self { data })
    }
}

#[async_trait]
impl Task for ConfigTask {
    fn name(&self) -> TaskName {
        TaskName::Config
    }

    async fn exec(self: Arc<Self>, ctx: Arc<TaskContext>) -> Result<(), TaskError> {
        if let Some(enabled) = self.data.notify_events {
            ctx.set_notify_events(enabled).await;
        }
        Ok(())
    }

    async fn kill(&self, _ctx: &TaskContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_notify_events() {
        let task = ConfigTask::from_data(&json!({"notifyEvents": true})).unwrap();
        assert_eq!(task.data.notify_events, Some(true));
        let task = ConfigTask::from_data(&json!({})).unwrap();
        assert_eq!(task.data.notify_events, None);
    }
}
