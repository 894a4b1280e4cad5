use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::EndReason;
use crate::error::TaskError;
use crate::task::Precondition;
use crate::task::Task;
use crate::task::TaskContext;
use crate::task::TaskName;

#[derive(Debug, Deserialize)]
struct HangupData {
    #[serde(default)]
    headers: Option<Value>,
}

/// Terminal verb: end the call. The session's teardown sends the BYE.
#[derive(Debug)]
pub struct HangupTask {
    _data: HangupData,
}

impl HangupTask {
    pub fn from_data(data: &Value) -> Result<Self, TaskError> {
        let data: HangupData = serde_json::from_value(data.clone())
            .map_err(|err| TaskError::Invalid(format!("hangup: {err}")))?;
        Ok(Self { _data: data })
    }
}

#[async_trait]
impl Task for HangupTask {
    fn name(&self) -> TaskName {
        TaskName::Hangup
    }

    fn preconditions(&self) -> Precondition {
        Precondition::StableCall
    }

    async fn exec(self: Arc<Self>, ctx: Arc<TaskContext>) -> Result<(), TaskError> {
        ctx.terminate_session(EndReason::TerminatedByApp).await;
        Ok(())
    }

    async fn kill(&self, _ctx: &TaskContext) {}
}
