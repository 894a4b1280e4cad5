//! Per-call driver: owns the media endpoint and the current requestor, runs
//! the task list strictly serially, applies redirects and commands at
//! cooperative boundaries, and tears everything down exactly once.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use std::time::Instant;

use jambonz_protocol::AppCommand;
use jambonz_protocol::Hook;
use jambonz_protocol::MessageType;
use jambonz_protocol::VerbNode;
use jambonz_protocol::parse_application;
use jambonz_requestor::CommandEvent;
use jambonz_requestor::EventReceiver;
use jambonz_requestor::Requestor;
use jambonz_requestor::RequestorEvent;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::Instrument;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::error::EndReason;
use crate::error::SessionError;
use crate::error::TaskError;
use crate::media::MediaEndpoint;
use crate::media::MediaServer;
use crate::sip::CallLeg;
use crate::sip::CallStatus;
use crate::sip::CallerInfo;
use crate::sip::Dialer;
use crate::task::Precondition;
use crate::task::Task;
use crate::task::TaskContext;
use crate::task::TaskName;
use crate::task::registry;
use crate::telemetry::SessionTelemetry;
use crate::tts::Synthesizer;

/// How long a killed task gets to resolve on its own before its future is
/// aborted outright.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// External collaborators a session needs. Tests inject mocks per session.
#[derive(Clone)]
pub struct SessionServices {
    pub media: Arc<dyn MediaServer>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub dialer: Arc<dyn Dialer>,
    pub telemetry: Arc<dyn SessionTelemetry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Replacing,
    Ending,
    Ended,
}

pub struct CallSession {
    caller_info: CallerInfo,
    leg: Arc<dyn CallLeg>,
    services: SessionServices,
    status_hook: Option<Hook>,
    b3: Option<String>,
    started: Instant,
    shared: Mutex<SessionShared>,
}

struct SessionShared {
    state: SessionState,
    tasks: VecDeque<Arc<dyn Task>>,
    current: Option<CurrentTask>,
    requestor: Arc<dyn Requestor>,
    endpoint: Option<Arc<dyn MediaEndpoint>>,
    epoch: u64,
    deferred: VecDeque<CommandEvent>,
    tmp_files: Vec<PathBuf>,
    notify_events: bool,
    end_reason: Option<EndReason>,
}

#[derive(Clone)]
struct CurrentTask {
    task: Arc<dyn Task>,
    ctx: Arc<TaskContext>,
    abort: AbortHandle,
}

impl CallSession {
    pub fn new(
        caller_info: CallerInfo,
        leg: Arc<dyn CallLeg>,
        requestor: Arc<dyn Requestor>,
        tasks: Vec<Arc<dyn Task>>,
        services: SessionServices,
    ) -> Self {
        Self {
            caller_info,
            leg,
            services,
            status_hook: None,
            b3: None,
            started: Instant::now(),
            shared: Mutex::new(SessionShared {
                state: SessionState::Idle,
                tasks: tasks.into(),
                current: None,
                requestor,
                endpoint: None,
                epoch: 0,
                deferred: VecDeque::new(),
                tmp_files: Vec::new(),
                notify_events: false,
                end_reason: None,
            }),
        }
    }

    pub fn with_status_hook(mut self, hook: Hook) -> Self {
        self.status_hook = Some(hook);
        self
    }

    pub fn with_b3(mut self, b3: String) -> Self {
        self.b3 = Some(b3);
        self
    }

    pub fn caller_info(&self) -> &CallerInfo {
        &self.caller_info
    }

    pub fn leg(&self) -> &Arc<dyn CallLeg> {
        &self.leg
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    pub(crate) fn b3(&self) -> &Option<String> {
        &self.b3
    }

    pub async fn state(&self) -> SessionState {
        self.shared.lock().await.state
    }

    pub async fn application_epoch(&self) -> u64 {
        self.shared.lock().await.epoch
    }

    pub(crate) async fn requestor(&self) -> Arc<dyn Requestor> {
        self.shared.lock().await.requestor.clone()
    }

    pub(crate) async fn track_tmp_file(&self, path: PathBuf) {
        self.shared.lock().await.tmp_files.push(path);
    }

    pub(crate) async fn set_notify_events(&self, enabled: bool) {
        self.shared.lock().await.notify_events = enabled;
    }

    /// Flag the session to stop after the current task returns.
    pub(crate) async fn terminate(&self, reason: EndReason) {
        let mut shared = self.shared.lock().await;
        if shared.end_reason.is_none() {
            shared.end_reason = Some(reason);
        }
        shared.state = SessionState::Ending;
    }

    /// Replace the remainder of the application: kill the current task,
    /// drop the queued ones, install the new list, bump the epoch.
    pub async fn replace_application(
        self: &Arc<Self>,
        verbs: Vec<VerbNode>,
    ) -> Result<(), TaskError> {
        let tasks = registry::make_tasks(&verbs)?;
        let current = {
            let mut shared = self.shared.lock().await;
            Self::install_replacement(&mut shared, tasks)
        };
        self.finish_kill(current).await;
        Ok(())
    }

    /// Epoch-guarded variant used by hook responses: a response computed
    /// against an older application is discarded on arrival.
    pub(crate) async fn replace_application_guarded(
        self: &Arc<Self>,
        epoch: u64,
        verbs: Vec<VerbNode>,
    ) -> Result<bool, TaskError> {
        let tasks = registry::make_tasks(&verbs)?;
        let current = {
            let mut shared = self.shared.lock().await;
            if shared.epoch != epoch {
                debug!(
                    epoch,
                    current_epoch = shared.epoch,
                    "discarding application replacement from stale epoch"
                );
                return Ok(false);
            }
            Self::install_replacement(&mut shared, tasks)
        };
        self.finish_kill(current).await;
        Ok(true)
    }

    fn install_replacement(
        shared: &mut SessionShared,
        tasks: Vec<Arc<dyn Task>>,
    ) -> Option<CurrentTask> {
        shared.tasks.clear();
        shared.tasks.extend(tasks);
        shared.epoch += 1;
        if shared.state == SessionState::Running {
            shared.state = SessionState::Replacing;
        }
        shared.current.clone()
    }

    async fn finish_kill(&self, current: Option<CurrentTask>) {
        let Some(current) = current else {
            return;
        };
        current.task.kill(&current.ctx).await;
        let abort = current.abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            abort.abort();
        });
    }

    async fn kill_current(&self) {
        let current = { self.shared.lock().await.current.clone() };
        self.finish_kill(current).await;
    }

    /// Run the application to completion. The single loop that owns task
    /// sequencing: exactly one task executes at a time, and inbound events
    /// are processed while it is suspended. A task error that escapes its
    /// `exec` is fatal: the loop stops, teardown runs, and the error is
    /// returned.
    pub async fn exec(
        self: Arc<Self>,
        mut events: EventReceiver,
    ) -> Result<EndReason, SessionError> {
        let call_sid = self.caller_info.call_sid.clone();
        info!(%call_sid, "session starting");
        self.services.telemetry.on_session_start(&call_sid);
        {
            let mut shared = self.shared.lock().await;
            shared.state = SessionState::Running;
        }
        self.send_call_status(CallStatus::InProgress, None).await;

        let mut leg_status = self.leg.status_stream();
        let mut events_open = true;
        let mut leg_open = true;
        let mut failure: Option<SessionError> = None;

        loop {
            // cooperative boundary: apply whatever arrived mid-task
            while let Ok(event) = events.try_recv() {
                self.handle_event(event).await;
            }
            let deferred: Vec<CommandEvent> = {
                let mut shared = self.shared.lock().await;
                shared.deferred.drain(..).collect()
            };
            for mut command in deferred {
                command.queue_command = false;
                self.handle_command(command).await;
            }

            if self.leg.status().is_final() {
                let mut shared = self.shared.lock().await;
                if shared.end_reason.is_none() {
                    shared.end_reason = Some(EndReason::CallerHungup);
                }
                break;
            }

            let next = {
                let mut shared = self.shared.lock().await;
                match shared.state {
                    SessionState::Ending | SessionState::Ended => None,
                    _ => {
                        if shared.state == SessionState::Replacing {
                            shared.state = SessionState::Running;
                        }
                        shared.tasks.pop_front()
                    }
                }
            };
            let Some(task) = next else {
                break;
            };

            let endpoint = match self.ensure_preconditions(task.preconditions()).await {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    warn!(verb = %task.name(), "skipping task: {err}");
                    continue;
                }
            };

            if let Some(err) = self
                .run_task(
                    task,
                    endpoint,
                    &mut events,
                    &mut events_open,
                    &mut leg_status,
                    &mut leg_open,
                )
                .await
            {
                let mut shared = self.shared.lock().await;
                if shared.end_reason.is_none() {
                    shared.end_reason = Some(EndReason::Error(err.to_string()));
                }
                shared.state = SessionState::Ending;
                drop(shared);
                failure = Some(err);
                break;
            }
        }

        let reason = {
            let mut shared = self.shared.lock().await;
            shared.state = SessionState::Ending;
            shared.end_reason.take().unwrap_or(EndReason::AppCompleted)
        };
        self.teardown(&reason).await;
        info!(%call_sid, %reason, "session ended");
        match failure {
            Some(err) => Err(err),
            None => Ok(reason),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_task(
        self: &Arc<Self>,
        task: Arc<dyn Task>,
        endpoint: Option<Arc<dyn MediaEndpoint>>,
        events: &mut EventReceiver,
        events_open: &mut bool,
        leg_status: &mut broadcast::Receiver<CallStatus>,
        leg_open: &mut bool,
    ) -> Option<SessionError> {
        let name = task.name();
        let verb_id = Uuid::new_v4().to_string();
        let epoch = { self.shared.lock().await.epoch };
        let ctx = Arc::new(TaskContext::new(Arc::clone(self), endpoint, epoch));

        self.notify_verb_status(name, &verb_id, "begin").await;
        let started = Instant::now();
        debug!(verb = %name, "task starting");

        let outcome: Arc<StdMutex<Option<Result<(), TaskError>>>> = Arc::new(StdMutex::new(None));
        let mut handle = {
            let task = Arc::clone(&task);
            let ctx = Arc::clone(&ctx);
            let outcome = Arc::clone(&outcome);
            let span = tracing::info_span!("task", call_sid = %self.caller_info.call_sid, verb = %name);
            tokio::spawn(
                async move {
                    let result = task.exec(ctx).await;
                    if let Ok(mut slot) = outcome.lock() {
                        *slot = Some(result);
                    }
                }
                .instrument(span),
            )
        };

        {
            let mut shared = self.shared.lock().await;
            shared.current = Some(CurrentTask {
                task: Arc::clone(&task),
                ctx: Arc::clone(&ctx),
                abort: handle.abort_handle(),
            });
        }

        loop {
            tokio::select! {
                joined = &mut handle => {
                    if let Err(err) = joined
                        && err.is_panic()
                    {
                        error!(verb = %name, "task panicked");
                    }
                    break;
                }
                event = events.recv(), if *events_open => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => *events_open = false,
                    }
                }
                status = leg_status.recv(), if *leg_open => {
                    match status {
                        Ok(status) if status.is_final() => {
                            {
                                let mut shared = self.shared.lock().await;
                                if shared.end_reason.is_none() {
                                    shared.end_reason = Some(EndReason::CallerHungup);
                                }
                                shared.state = SessionState::Ending;
                            }
                            self.kill_current().await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => *leg_open = false,
                    }
                }
            }
        }

        let result = outcome.lock().ok().and_then(|mut slot| slot.take());
        let ok = matches!(&result, Some(Ok(())));
        let failure = match result {
            Some(Ok(())) => {
                debug!(verb = %name, "task completed");
                None
            }
            Some(Err(err)) => {
                warn!(verb = %name, "task failed: {err}");
                Some(SessionError {
                    verb: name,
                    source: err,
                })
            }
            None => {
                debug!(verb = %name, "task aborted before reporting an outcome");
                None
            }
        };
        self.services.telemetry.on_task(name, started.elapsed(), ok);

        {
            let mut shared = self.shared.lock().await;
            shared.current = None;
        }
        self.notify_verb_status(name, &verb_id, "end").await;
        failure
    }

    async fn ensure_preconditions(
        &self,
        precondition: Precondition,
    ) -> Result<Option<Arc<dyn MediaEndpoint>>, TaskError> {
        match precondition {
            Precondition::None => Ok(self.shared.lock().await.endpoint.clone()),
            Precondition::Endpoint => {
                if let Some(endpoint) = self.shared.lock().await.endpoint.clone() {
                    return Ok(Some(endpoint));
                }
                let endpoint = self.services.media.allocate().await?;
                let mut shared = self.shared.lock().await;
                shared.endpoint = Some(Arc::clone(&endpoint));
                Ok(Some(endpoint))
            }
            Precondition::StableCall => {
                if !self.leg.answered() {
                    self.leg.answer().await.map_err(|err| {
                        TaskError::Precondition(format!("cannot answer call: {err}"))
                    })?;
                }
                Ok(self.shared.lock().await.endpoint.clone())
            }
            Precondition::UnansweredCall => {
                if self.leg.answered() {
                    return Err(TaskError::Precondition(
                        "call already answered".to_string(),
                    ));
                }
                Ok(None)
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: RequestorEvent) {
        match event {
            RequestorEvent::Handover(requestor) => {
                info!("requestor handover");
                let mut shared = self.shared.lock().await;
                shared.requestor = requestor;
            }
            RequestorEvent::Command(command) => self.handle_command(command).await,
            RequestorEvent::ConnectionDropped => debug!("application channel dropped"),
        }
    }

    /// Dispatch an application command. `hangup`, `mute` and `unmute` run
    /// immediately; a command tagged `queueCommand` waits for the current
    /// verb to complete; everything else also runs at the next cooperative
    /// boundary (the source behavior for an absent flag).
    async fn handle_command(self: &Arc<Self>, command: CommandEvent) {
        match command.command.clone() {
            AppCommand::Hangup => {
                {
                    let mut shared = self.shared.lock().await;
                    if shared.end_reason.is_none() {
                        shared.end_reason = Some(EndReason::TerminatedByApp);
                    }
                    shared.state = SessionState::Ending;
                }
                self.kill_current().await;
            }
            AppCommand::Redirect => {
                let verbs = match parse_application(&command.data) {
                    Ok(verbs) => verbs,
                    Err(err) => {
                        warn!("redirect command with invalid application: {err}");
                        self.reply_error(&format!("invalid redirect payload: {err}"))
                            .await;
                        return;
                    }
                };
                let tasks = match registry::make_tasks(&verbs) {
                    Ok(tasks) => tasks,
                    Err(err) => {
                        warn!("redirect command with unknown verb: {err}");
                        self.reply_error(&err.to_string()).await;
                        return;
                    }
                };
                if command.queue_command {
                    let mut shared = self.shared.lock().await;
                    shared.tasks.extend(tasks);
                } else {
                    let current = {
                        let mut shared = self.shared.lock().await;
                        Self::install_replacement(&mut shared, tasks)
                    };
                    self.finish_kill(current).await;
                }
            }
            AppCommand::Mute | AppCommand::Unmute => {
                let mute = command.command == AppCommand::Mute;
                if let Some(task) = self.current_task_handling(&command.command).await {
                    task.deliver_command(command).await;
                } else {
                    self.set_session_audio(if mute { "mute" } else { "unmute" })
                        .await;
                }
            }
            AppCommand::Pause | AppCommand::Resume => {
                if command.queue_command {
                    self.shared.lock().await.deferred.push_back(command);
                    return;
                }
                let pause = command.command == AppCommand::Pause;
                if let Some(task) = self.current_task_handling(&command.command).await {
                    task.deliver_command(command).await;
                } else {
                    self.pause_session_audio(pause).await;
                }
            }
            _ => {
                if command.queue_command {
                    self.shared.lock().await.deferred.push_back(command);
                    return;
                }
                if let Some(task) = self.current_task_handling(&command.command).await {
                    task.deliver_command(command).await;
                } else {
                    debug!(command = %command.command, "no task handles command");
                    self.reply_error(&format!(
                        "unhandled command: {}",
                        command.command
                    ))
                    .await;
                }
            }
        }
    }

    async fn current_task_handling(&self, command: &AppCommand) -> Option<Arc<dyn Task>> {
        let shared = self.shared.lock().await;
        shared
            .current
            .as_ref()
            .filter(|current| current.task.handles_command(command))
            .map(|current| Arc::clone(&current.task))
    }

    async fn set_session_audio(&self, action: &str) {
        let endpoint = { self.shared.lock().await.endpoint.clone() };
        let Some(endpoint) = endpoint else {
            return;
        };
        let args = vec![endpoint.uuid().to_string(), action.to_string()];
        if let Err(err) = endpoint.api("uuid_audio", &args).await {
            warn!("session audio {action} failed: {err}");
        }
    }

    async fn pause_session_audio(&self, pause: bool) {
        let endpoint = { self.shared.lock().await.endpoint.clone() };
        let Some(endpoint) = endpoint else {
            return;
        };
        let action = if pause { "pause" } else { "resume" };
        let args = vec![endpoint.uuid().to_string(), action.to_string()];
        if let Err(err) = endpoint.api("uuid_fileman", &args).await {
            warn!("session audio {action} failed: {err}");
        }
    }

    async fn reply_error(&self, detail: &str) {
        let requestor = self.requestor().await;
        let _ = requestor
            .request(
                MessageType::JambonzError,
                None,
                json!({"error": detail, "callSid": self.caller_info.call_sid}),
                self.b3.as_deref(),
            )
            .await;
    }

    async fn send_call_status(&self, status: CallStatus, reason: Option<&EndReason>) {
        let requestor = self.requestor().await;
        let mut params = self.caller_info.hook_params();
        if let Some(map) = params.as_object_mut() {
            map.insert("callStatus".to_string(), json!(status.as_str()));
            map.insert(
                "duration".to_string(),
                json!(self.started.elapsed().as_secs()),
            );
            if let Some(reason) = reason {
                map.insert("endReason".to_string(), json!(reason.as_str()));
            }
        }
        if let Err(err) = requestor
            .request(
                MessageType::CallStatus,
                self.status_hook.as_ref(),
                params,
                self.b3.as_deref(),
            )
            .await
        {
            debug!("call:status delivery failed: {err}");
        }
    }

    async fn notify_verb_status(&self, name: TaskName, verb_id: &str, event: &str) {
        let enabled = { self.shared.lock().await.notify_events };
        if !enabled {
            return;
        }
        let requestor = self.requestor().await;
        let params = json!({
            "callSid": self.caller_info.call_sid,
            "verb": name.as_str(),
            "id": verb_id,
            "event": event,
        });
        let _ = requestor
            .request(MessageType::VerbStatus, None, params, self.b3.as_deref())
            .await;
    }

    /// Teardown attempts every release step even when earlier ones fail;
    /// nothing propagates past session end.
    async fn teardown(self: &Arc<Self>, reason: &EndReason) {
        self.kill_current().await;

        let endpoint = { self.shared.lock().await.endpoint.take() };
        if let Some(endpoint) = endpoint {
            if let Err(err) = endpoint.destroy().await {
                warn!("endpoint release failed: {err}");
            }
        }

        if !self.leg.status().is_final() {
            if let Err(err) = self.leg.hangup().await {
                debug!("hangup on teardown failed: {err}");
            }
        }

        let tmp_files = {
            let mut shared = self.shared.lock().await;
            std::mem::take(&mut shared.tmp_files)
        };
        for path in tmp_files {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), "tmp file removal failed: {err}");
            }
        }

        self.send_call_status(CallStatus::Completed, Some(reason))
            .await;
        let requestor = self.requestor().await;
        requestor.close().await;

        {
            let mut shared = self.shared.lock().await;
            shared.state = SessionState::Ended;
        }
        self.services.telemetry.on_session_end(
            &self.caller_info.call_sid,
            reason,
            self.started.elapsed(),
        );
    }
}
