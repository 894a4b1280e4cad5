use std::sync::Arc;
use std::time::Duration;

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
struct DialData {
    target: String,
    #[serde(default)]
    caller_id: Option<String>,
    /// Seconds to wait for an answer.
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default)]
    action_hook: Option<Hook>,
}

fn default_timeout() -> u64 {
    30
}

/// Place an outbound leg and bridge it to the caller. The task runs until
/// the far end hangs up or the task is killed. A failed dial whose action
/// hook does not install an alternate application fails the task.
#[derive(Debug)]
pub struct DialTask {
    data: DialData,
    ctl: TaskControl,
}

impl DialTask {
    pub fn from_data(data: &Value) -> Result<Self, TaskError> {
        let data: DialData = serde_json::from_value(data.clone())
            .map_err(|err| TaskError::Invalid(format!("dial: {err}")))?;
        Ok(Self {
            data,
            ctl: TaskControl::new(),
        })
    }
}

#[async_trait]
impl Task for DialTask {
    fn name(&self) -> TaskName {
        TaskName::Dial
    }

    fn preconditions(&self) -> Precondition {
        Precondition::Endpoint
    }

    async fn exec(self: Arc<Self>, ctx: Arc<TaskContext>) -> Result<(), TaskError> {
        let endpoint = Arc::clone(ctx.endpoint()?);
        let from = self
            .data
            .caller_id
            .clone()
            .unwrap_or_else(|| ctx.caller_info().from.clone());

        let placed = tokio::select! {
            result = ctx.dialer().place_call(
                &from,
                &self.data.target,
                Duration::from_secs(self.data.timeout),
            ) => result,
            _ = self.ctl.cancelled() => return Ok(()),
        };

        let outbound = match placed {
            Ok(outbound) => outbound,
            Err(err) => {
                let result = json!({"dialCallStatus": "failed", "reason": err.to_string()});
                if let Some(hook) = self.data.action_hook.as_ref() {
                    match ctx.perform_hook(hook, result).await {
                        // an alternate application took over; nothing failed
                        Ok(true) => return Ok(()),
                        Ok(false) => {}
                        Err(hook_err) => debug!("dial action hook failed: {hook_err}"),
                    }
                }
                return Err(TaskError::Signaling(err));
            }
        };

        let bridge_args = vec![
            endpoint.uuid().to_string(),
            outbound.endpoint.uuid().to_string(),
        ];
        endpoint.api("uuid_bridge", &bridge_args).await?;

        let mut peer_status = outbound.leg.status_stream();
        loop {
            tokio::select! {
                _ = self.ctl.cancelled() => {
                    let _ = outbound.leg.hangup().await;
                    break;
                }
                status = peer_status.recv() => {
                    match status {
                        Ok(status) if status.is_final() => break,
                        Ok(_) => {}
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }

        ctx.perform_action(
            self.data.action_hook.as_ref(),
            json!({"dialCallStatus": outbound.leg.status().as_str()}),
        )
        .await;
        Ok(())
    }

    async fn kill(&self, _ctx: &TaskContext) {
        self.ctl.kill();
    }
}
