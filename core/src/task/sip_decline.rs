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
struct SipDeclineData {
    status: u16,
    #[serde(default)]
    reason: Option<String>,
}

/// Reject an unanswered call with a final SIP status.
#[derive(Debug)]
pub struct SipDeclineTask {
    data: SipDeclineData,
}

impl SipDeclineTask {
    pub fn from_data(data: &Value) -> Result<Self, TaskError> {
        let data: SipDeclineData = serde_json::from_value(data.clone())
            .map_err(|err| TaskError::Invalid(format!("sip:decline: {err}")))?;
        Ok(Self { data })
    }
}

#[async_trait]
impl Task for SipDeclineTask {
    fn name(&self) -> TaskName {
        TaskName::SipDecline
    }

    fn preconditions(&self) -> Precondition {
        Precondition::UnansweredCall
    }

    async fn exec(self: Arc<Self>, ctx: Arc<TaskContext>) -> Result<(), TaskError> {
        ctx.leg()
            .decline(self.data.status, self.data.reason.as_deref())
            .await?;
        ctx.terminate_session(EndReason::AppCompleted).await;
        Ok(())
    }

    async fn kill(&self, _ctx: &TaskContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requires_a_status() {
        assert!(SipDeclineTask::from_data(&json!({})).is_err());
        assert!(SipDeclineTask::from_data(&json!({"status": 486, "reason": "Busy Here"})).is_ok());
    }
}
