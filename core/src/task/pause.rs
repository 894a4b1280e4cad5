use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::TaskError;
use crate::task::Task;
use crate::task::TaskContext;
use crate::task::TaskControl;
use crate::task::TaskName;

#[derive(Debug, Deserialize)]
struct PauseData {
    #[serde(default = "default_length")]
    length: u64,
}

fn default_length() -> u64 {
    1
}

/// Wait silently for `length` seconds.
#[derive(Debug)]
pub struct PauseTask {
    data: PauseData,
    ctl: TaskControl,
}

impl PauseTask {
    pub fn from_data(data: &Value) -> Result<Self, TaskError> {
        let data: PauseData = serde_json::from_value(data.clone())
            .map_err(|err| TaskError::Invalid(format!("pause: {err}")))?;
        Ok(Self {
            data,
            ctl: TaskControl::new(),
        })
    }
}

#[async_trait]
impl Task for PauseTask {
    fn name(&self) -> TaskName {
        TaskName::Pause
    }

    async fn exec(self: Arc<Self>, _ctx: Arc<TaskContext>) -> Result<(), TaskError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(self.data.length)) => {}
            _ = self.ctl.cancelled() => {}
        }
        Ok(())
    }

    async fn kill(&self, _ctx: &TaskContext) {
        self.ctl.kill();
    }
}
