//! Map verb names to task constructors. Adding a verb means adding a
//! [`TaskName`] variant and an arm here.

use std::sync::Arc;

use jambonz_protocol::VerbNode;

use crate::error::TaskError;
use crate::task::Task;
use crate::task::TaskName;
use crate::task::config::ConfigTask;
use crate::task::dial::DialTask;
use crate::task::gather::GatherTask;
use crate::task::hangup::HangupTask;
use crate::task::pause::PauseTask;
use crate::task::play::PlayTask;
use crate::task::redirect::RedirectTask;
use crate::task::say::SayTask;
use crate::task::sip_decline::SipDeclineTask;
use crate::task::transcribe::TranscribeTask;

pub fn make_task(node: &VerbNode) -> Result<Arc<dyn Task>, TaskError> {
    let name = TaskName::parse(&node.name)
        .ok_or_else(|| TaskError::Invalid(format!("unknown verb: {}", node.name)))?;
    let task: Arc<dyn Task> = match name {
        TaskName::Say => Arc::new(SayTask::from_data(&node.data)?),
        TaskName::Play => Arc::new(PlayTask::from_data(&node.data)?),
        TaskName::Gather => Arc::new(GatherTask::from_data(&node.data)?),
        TaskName::Transcribe => Arc::new(TranscribeTask::from_data(&node.data)?),
        TaskName::Pause => Arc::new(PauseTask::from_data(&node.data)?),
        TaskName::Hangup => Arc::new(HangupTask::from_data(&node.data)?),
        TaskName::SipDecline => Arc::new(SipDeclineTask::from_data(&node.data)?),
        TaskName::Config => Arc::new(ConfigTask::from_data(&node.data)?),
        TaskName::Redirect => Arc::new(RedirectTask::from_data(&node.data)?),
        TaskName::Dial => Arc::new(DialTask::from_data(&node.data)?),
    };
    Ok(task)
}

pub fn make_tasks(nodes: &[VerbNode]) -> Result<Vec<Arc<dyn Task>>, TaskError> {
    nodes.iter().map(make_task).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jambonz_protocol::parse_application;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn builds_tasks_from_an_application() {
        let app = json!([
            {"say": {"text": "hi"}},
            {"pause": {"length": 2}},
            {"hangup": {}}
        ]);
        let verbs = parse_application(&app).unwrap();
        let tasks = make_tasks(&verbs).unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].name(), TaskName::Say);
        assert_eq!(tasks[1].name(), TaskName::Pause);
        assert_eq!(tasks[2].name(), TaskName::Hangup);
    }

    #[test]
    fn unknown_verbs_are_named_in_the_error() {
        let verbs = parse_application(&json!([{"warble": {}}])).unwrap();
        let err = make_tasks(&verbs).unwrap_err();
        assert!(err.to_string().contains("warble"));
    }

    #[test]
    fn invalid_verb_data_fails_construction() {
        let verbs = parse_application(&json!([{"say": {}}])).unwrap();
        assert!(make_tasks(&verbs).is_err());
    }
}
