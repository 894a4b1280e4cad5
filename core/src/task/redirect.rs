use std::sync::Arc;

use async_trait::async_trait;
use jambonz_protocol::Hook;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tracing::debug;

use crate::error::TaskError;
use crate::task::Task;
use crate::task::TaskContext;
use crate::task::TaskControl;
use crate::task::TaskName;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RedirectData {
    Url(String),
    Object {
        #[serde(rename = "actionHook")]
        action_hook: Hook,
    },
}

impl RedirectData {
    fn hook(&self) -> Hook {
        match self {
            RedirectData::Url(url) => Hook::new(url.clone()),
            RedirectData::Object { action_hook } => action_hook.clone(),
        }
    }
}

/// Fetch a new application from the hook and replace the remainder of the
/// current one, the verb-level twin of the `redirect` command.
#[derive(Debug)]
pub struct RedirectTask {
    data: RedirectData,
    ctl: TaskControl,
}

impl RedirectTask {
    pub fn from_data(data: &Value) -> Result<Self, TaskError> {
        let data: RedirectData = serde_json::from_value(data.clone())
            .map_err(|err| TaskError::Invalid(format!("redirect: {err}")))?;
        Ok(Self {
            data,
            ctl: TaskControl::new(),
        })
    }
}

#[async_trait]
impl Task for RedirectTask {
    fn name(&self) -> TaskName {
        TaskName::Redirect
    }

    async fn exec(self: Arc<Self>, ctx: Arc<TaskContext>) -> Result<(), TaskError> {
        if self.ctl.killed() {
            return Ok(());
        }
        let hook = self.data.hook();
        let replaced = ctx.perform_hook(&hook, json!({})).await?;
        if !replaced {
            debug!(url = %hook.url, "redirect hook returned no application");
        }
        Ok(())
    }

    async fn kill(&self, _ctx: &TaskContext) {
        self.ctl.kill();
    }
}
