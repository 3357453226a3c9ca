//! Association task: executes the requests of one outstation, one at a time.

use std::collections::VecDeque;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::codec::LinkFrame;
use crate::decode::{log_request, log_response, DecodeLevel, Direction};
use crate::error::{CommandError, FileError, TaskError, TimeSyncError};
use crate::master::config::{AssociationConfig, TimeSyncMode};
use crate::master::handler::{
    AssociationState, ChannelState, HeaderInfo, Listener, ReadHandler, ReadType,
};
use crate::master::task::{
    command_objects, AssociationMessage, AutoTask, AutoTasks, FreezeType, Poll, ReadRequest,
    RestartType, UserTask,
};
use crate::parser::parse_response;
use crate::types::{
    AttrId, Attribute, Classes, CommandHeaders, CommandMode, CommandStatus, EventClasses,
    FileCommandStatus, FileInfo, FileMode, FileOpen, FileStatus, FileTransport, FunctionCode, Iin,
    Iin1, Iin2, IndexRange,
    LinkFunction, ObjectHeader, PointType, Request, Response, Sequence, StaticVariation,
    IIN_RESTART_INDEX,
};

/// Run `$attempt` until it succeeds, fails permanently or the task retry
/// strategy is exhausted.
macro_rules! with_retry {
    ($self:ident, $name:expr, $attempt:expr $(,)?) => {{
        let mut backoff = $self.config.task_retry.backoff();
        loop {
            match $attempt {
                Ok(value) => break Ok(value),
                Err(err) if err.is_retryable() => match backoff.on_failure() {
                    Some(delay) => {
                        warn!(
                            "Association {}: {} failed ({}), retry in {:?}",
                            $self.address, $name, err, delay
                        );
                        if let Err(stop) = $self.pause(delay).await {
                            break Err(stop.into());
                        }
                    }
                    None => break Err(err),
                },
                Err(err) => break Err(err),
            }
        }
    }};
}

/// Frames and state shared with the channel task.
pub(crate) struct Link {
    pub(crate) tx: mpsc::UnboundedSender<LinkFrame>,
    pub(crate) inbox: mpsc::UnboundedReceiver<LinkFrame>,
    pub(crate) status: watch::Receiver<ChannelState>,
    pub(crate) decode_level: watch::Receiver<DecodeLevel>,
}

enum Expect {
    Response(Sequence),
    LinkStatus,
    Nothing,
}

enum Received {
    Nothing,
    Response(Response),
    LinkStatus,
}

enum Wake {
    Message(Option<AssociationMessage>),
    Frame(Option<LinkFrame>),
    Status(bool),
    Timer,
}

pub(crate) struct Association {
    address: u16,
    master_address: u16,
    config: AssociationConfig,
    handler: Box<dyn ReadHandler>,
    listener: Box<dyn Listener<AssociationState>>,
    clock: Arc<dyn Clock>,
    link: Link,
    messages: mpsc::Receiver<AssociationMessage>,
    enabled: bool,
    state: Option<AssociationState>,
    seq: Sequence,
    last_unsolicited: Option<Sequence>,
    queue: VecDeque<UserTask>,
    polls: Vec<Poll>,
    next_poll_id: u64,
    auto: AutoTasks,
    startup_pending: bool,
    file_request_id: u16,
    interrupt: Option<TaskError>,
    removed: bool,
}

impl Association {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        address: u16,
        master_address: u16,
        config: AssociationConfig,
        handler: Box<dyn ReadHandler>,
        listener: Box<dyn Listener<AssociationState>>,
        clock: Arc<dyn Clock>,
        link: Link,
        messages: mpsc::Receiver<AssociationMessage>,
    ) -> Self {
        Self {
            address,
            master_address,
            config,
            handler,
            listener,
            clock,
            link,
            messages,
            enabled: true,
            state: None,
            seq: Sequence::default(),
            last_unsolicited: None,
            queue: VecDeque::new(),
            polls: Vec::new(),
            next_poll_id: 0,
            auto: AutoTasks::default(),
            startup_pending: true,
            file_request_id: 0,
            interrupt: None,
            removed: false,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("Association {} started", self.address);
        loop {
            let status = *self.link.status.borrow();
            if self.removed || status == ChannelState::Shutdown {
                break;
            }
            let connected = status == ChannelState::Connected;
            if !connected {
                self.on_link_down(status);
            }
            self.update_state(connected);

            if self.enabled && connected {
                if self.startup_pending {
                    self.run_startup().await;
                    continue;
                }
                if self.run_next().await {
                    continue;
                }
            }
            self.idle().await;
        }

        self.fail_queue(TaskError::Shutdown);
        info!("Association {} stopped", self.address);
    }

    fn update_state(&mut self, connected: bool) {
        let state = match (self.enabled, connected, self.startup_pending) {
            (false, _, _) => AssociationState::Disabled,
            (true, false, _) => AssociationState::WaitingForConnection,
            (true, true, true) => AssociationState::Startup,
            (true, true, false) => AssociationState::Ready,
        };
        if self.state != Some(state) {
            debug!("Association {} state {:?}", self.address, state);
            self.state = Some(state);
            self.listener.update(state);
        }
    }

    fn link_error(&self) -> Option<TaskError> {
        match *self.link.status.borrow() {
            ChannelState::Connected => None,
            ChannelState::Disabled | ChannelState::Shutdown => Some(TaskError::Shutdown),
            ChannelState::Connecting | ChannelState::WaitRetry => Some(TaskError::NoConnection),
        }
    }

    fn on_link_down(&mut self, status: ChannelState) {
        let err = match status {
            ChannelState::Disabled | ChannelState::Shutdown => TaskError::Shutdown,
            _ => TaskError::NoConnection,
        };
        self.fail_queue(err);
        self.startup_pending = true;
        self.last_unsolicited = None;
        self.auto = AutoTasks::default();
    }

    fn fail_queue(&mut self, err: TaskError) {
        if !self.queue.is_empty() {
            debug!(
                "Association {}: failing {} queued request(s): {}",
                self.address,
                self.queue.len(),
                err
            );
        }
        for task in self.queue.drain(..) {
            task.fail(err.clone());
        }
    }

    fn on_message(&mut self, message: Option<AssociationMessage>) {
        let Some(message) = message else {
            debug!("Association {}: every handle dropped", self.address);
            self.remove();
            return;
        };
        match message {
            AssociationMessage::Task(task) => {
                if !self.enabled {
                    task.fail(TaskError::AssociationDisabled);
                } else if let Some(err) = self.link_error() {
                    task.fail(err);
                } else if self.queue.len() >= self.config.max_queued_user_requests {
                    warn!("Association {}: request queue full", self.address);
                    task.fail(TaskError::TooManyRequests);
                } else {
                    self.queue.push_back(task);
                }
            }
            AssociationMessage::AddPoll {
                request,
                period,
                reply,
            } => {
                let id = self.next_poll_id;
                self.next_poll_id += 1;
                self.polls.push(Poll {
                    id,
                    request,
                    period,
                    next: Instant::now() + period,
                    demanded: false,
                });
                let _ = reply.send(id);
            }
            AssociationMessage::DemandPoll(id) => {
                if let Some(poll) = self.polls.iter_mut().find(|p| p.id == id) {
                    poll.demanded = true;
                }
            }
            AssociationMessage::RemovePoll(id) => self.polls.retain(|p| p.id != id),
            AssociationMessage::Enable => {
                if !self.enabled {
                    info!("Association {} enabled", self.address);
                    self.enabled = true;
                    self.startup_pending = true;
                }
            }
            AssociationMessage::Disable => {
                if self.enabled {
                    info!("Association {} disabled", self.address);
                    self.enabled = false;
                    self.auto = AutoTasks::default();
                    self.fail_queue(TaskError::Shutdown);
                    self.interrupt = Some(TaskError::Shutdown);
                }
            }
            AssociationMessage::Remove => self.remove(),
        }
    }

    fn remove(&mut self) {
        self.removed = true;
        self.fail_queue(TaskError::Shutdown);
        self.interrupt = Some(TaskError::Shutdown);
    }

    async fn idle(&mut self) {
        let deadline = if self.enabled && self.link_error().is_none() {
            self.polls.iter().map(|p| p.next).min()
        } else {
            None
        };

        let wake = tokio::select! {
            message = self.messages.recv() => Wake::Message(message),
            frame = self.link.inbox.recv() => Wake::Frame(frame),
            changed = self.link.status.changed() => Wake::Status(changed.is_ok()),
            _ = wait(deadline) => Wake::Timer,
        };

        match wake {
            Wake::Message(message) => self.on_message(message),
            Wake::Frame(Some(frame)) => {
                if let Received::Response(response) = self.on_frame(frame) {
                    debug!(
                        "Association {}: ignoring response (seq {}) with no request",
                        self.address, response.control.seq
                    );
                }
            }
            Wake::Frame(None) | Wake::Status(false) => self.removed = true,
            Wake::Status(true) | Wake::Timer => {}
        }
        self.interrupt = None;
    }

    /// Run one queued item. Returns false if nothing was ready.
    async fn run_next(&mut self) -> bool {
        if let Some(task) = self.auto.next() {
            self.run_auto(task).await;
            return true;
        }

        let now = Instant::now();
        if let Some(index) = self.polls.iter().position(|p| p.demanded) {
            self.run_poll(index).await;
            return true;
        }
        if let Some(task) = self.queue.pop_front() {
            self.run_user(task).await;
            return true;
        }
        let due = self
            .polls
            .iter()
            .enumerate()
            .filter(|(_, p)| p.next <= now)
            .min_by_key(|(_, p)| p.next)
            .map(|(i, _)| i);
        if let Some(index) = due {
            self.run_poll(index).await;
            return true;
        }
        false
    }

    async fn run_startup(&mut self) {
        let disable = self.config.disable_unsolicited_classes;
        if !disable.is_empty() {
            let result = with_retry!(
                self,
                "disable unsolicited",
                self.configure_unsolicited(false, disable).await,
            );
            if !self.startup_step(result, "disable unsolicited") {
                return;
            }
        }

        let integrity = ReadRequest::class_scan(self.config.startup_integrity_classes);
        if !integrity.is_empty() {
            let result = with_retry!(
                self,
                "integrity poll",
                self.read(&integrity, ReadType::StartupIntegrity).await,
            );
            if !self.startup_step(result, "integrity poll") {
                return;
            }
            self.auto.integrity = false;
        }

        let enable = self.config.enable_unsolicited_classes;
        if !enable.is_empty() {
            let result = with_retry!(
                self,
                "enable unsolicited",
                self.configure_unsolicited(true, enable).await,
            );
            if !self.startup_step(result, "enable unsolicited") {
                return;
            }
        }

        info!("Association {}: startup complete", self.address);
        self.startup_pending = false;
    }

    /// Returns false if startup must stop.
    fn startup_step(&mut self, result: Result<(), TaskError>, name: &str) -> bool {
        match result {
            Ok(()) => true,
            Err(err) if is_interrupt(&err) => {
                debug!("Association {}: startup interrupted: {}", self.address, err);
                false
            }
            Err(err) => {
                warn!("Association {}: startup {} failed: {}", self.address, name, err);
                true
            }
        }
    }

    async fn run_auto(&mut self, task: AutoTask) {
        let result = match task {
            AutoTask::ClearRestart => {
                with_retry!(self, "clear restart", self.clear_restart().await)
            }
            AutoTask::TimeSync(mode) => {
                with_retry!(self, "time sync", self.time_sync(mode).await).map_err(|e| match e {
                    TimeSyncError::Task(err) => err,
                    other => TaskError::bad_response(other.to_string()),
                })
            }
            AutoTask::Integrity => {
                let request = ReadRequest::integrity();
                with_retry!(
                    self,
                    "integrity poll",
                    self.read(&request, ReadType::StartupIntegrity).await,
                )
            }
            AutoTask::EventScan(classes) => {
                let request = ReadRequest::class_scan(Classes::events(classes));
                with_retry!(self, "event scan", self.read(&request, ReadType::PeriodicPoll).await)
            }
        };
        // flags raised by the task's own responses are dropped as well
        self.auto.clear(task);
        if let Err(err) = result {
            warn!("Association {}: automatic {:?} failed: {}", self.address, task, err);
        }
    }

    async fn run_poll(&mut self, index: usize) {
        let request = self.polls[index].request.clone();
        let id = self.polls[index].id;
        if let Err(err) = self.read(&request, ReadType::PeriodicPoll).await {
            warn!("Association {}: poll {} failed: {}", self.address, id, err);
        }
        let now = Instant::now();
        // the poll may have been removed while it ran
        if let Some(poll) = self.polls.iter_mut().find(|p| p.id == id) {
            poll.completed(now);
        }
    }

    async fn run_user(&mut self, task: UserTask) {
        debug!("Association {}: starting {}", self.address, task.name());
        match task {
            UserTask::Read { request, reply } => {
                let result = with_retry!(
                    self,
                    "read",
                    self.read(&request, ReadType::SinglePoll).await,
                );
                let _ = reply.send(result);
            }
            UserTask::Command {
                mode,
                headers,
                reply,
            } => {
                let result = with_retry!(self, "command", self.command(mode, &headers).await);
                let _ = reply.send(result);
            }
            UserTask::TimeSync { mode, reply } => {
                let result = with_retry!(self, "time sync", self.time_sync(mode).await);
                let _ = reply.send(result);
            }
            UserTask::Restart { kind, reply } => {
                let result = with_retry!(self, "restart", self.restart(kind).await);
                let _ = reply.send(result);
            }
            UserTask::Freeze { kind, range, reply } => {
                let result = with_retry!(self, "freeze", self.freeze(kind, range).await);
                let _ = reply.send(result);
            }
            UserTask::Unsolicited {
                enable,
                classes,
                reply,
            } => {
                let result = with_retry!(
                    self,
                    "unsolicited config",
                    self.configure_unsolicited(enable, classes).await,
                );
                let _ = reply.send(result);
            }
            UserTask::OpenFile {
                name,
                mode,
                size,
                max_block_size,
                reply,
            } => {
                let result = with_retry!(
                    self,
                    "open file",
                    self.open_file(&name, mode, size, max_block_size).await,
                );
                let _ = reply.send(result);
            }
            UserTask::ReadFile { handle, reply } => {
                let result = with_retry!(self, "read file", self.read_file(handle).await);
                let _ = reply.send(result);
            }
            UserTask::WriteFile {
                handle,
                data,
                block_size,
                reply,
            } => {
                let result = with_retry!(
                    self,
                    "write file",
                    self.write_file(handle, &data, block_size).await,
                );
                let _ = reply.send(result);
            }
            UserTask::CloseFile { handle, reply } => {
                let result = with_retry!(self, "close file", self.close_file(handle).await);
                let _ = reply.send(result);
            }
            UserTask::ReadAttributes { id, reply } => {
                let result = with_retry!(self, "read attributes", self.read_attributes(id).await);
                let _ = reply.send(result);
            }
            UserTask::WriteAttribute { attribute, reply } => {
                let result = with_retry!(
                    self,
                    "write attribute",
                    self.write_attribute(&attribute).await,
                );
                let _ = reply.send(result);
            }
            UserTask::LinkStatus { reply } => {
                let result = with_retry!(self, "link status", self.link_status().await);
                let _ = reply.send(result);
            }
        }
    }

    // ---- transmission ----

    fn transmit(&mut self, frame: LinkFrame) -> Result<(), TaskError> {
        if let Some(err) = self.link_error() {
            return Err(err);
        }
        self.link.tx.send(frame).map_err(|_| TaskError::Shutdown)
    }

    fn decode_level(&self) -> DecodeLevel {
        *self.link.decode_level.borrow()
    }

    /// Send a request and wait for the first response fragment.
    async fn request(
        &mut self,
        function: FunctionCode,
        objects: Vec<ObjectHeader>,
    ) -> Result<Response, TaskError> {
        let seq = self.seq.increment();
        let request = Request::new(seq, function, objects);
        log_request(self.decode_level(), Direction::Tx, &request);
        let frame = LinkFrame::user_data(self.address, self.master_address, request.encode());
        self.transmit(frame)?;

        let deadline = Instant::now() + self.config.response_timeout;
        match self.wait_for(Expect::Response(seq), deadline).await? {
            Some(response) => Ok(response),
            None => Err(TaskError::ResponseTimeout),
        }
    }

    /// Wait for the next fragment of a multi-fragment response.
    async fn next_fragment(&mut self, previous: &Response) -> Result<Response, TaskError> {
        let deadline = Instant::now() + self.config.response_timeout;
        let seq = previous.control.seq.next();
        match self.wait_for(Expect::Response(seq), deadline).await? {
            Some(response) => Ok(response),
            None => Err(TaskError::ResponseTimeout),
        }
    }

    /// Wait without a request in flight, still serving unsolicited
    /// responses and handle messages.
    async fn pause(&mut self, delay: Duration) -> Result<(), TaskError> {
        self.wait_for(Expect::Nothing, Instant::now() + delay)
            .await
            .map(|_| ())
    }

    async fn wait_for(&mut self, expect: Expect, deadline: Instant) -> Result<Option<Response>, TaskError> {
        loop {
            let wake = tokio::select! {
                frame = self.link.inbox.recv() => Wake::Frame(frame),
                message = self.messages.recv() => Wake::Message(message),
                changed = self.link.status.changed() => Wake::Status(changed.is_ok()),
                _ = sleep_until(deadline) => Wake::Timer,
            };

            match wake {
                Wake::Frame(Some(frame)) => match (self.on_frame(frame), &expect) {
                    (Received::Response(response), Expect::Response(seq))
                        if response.control.seq == *seq =>
                    {
                        return Ok(Some(response));
                    }
                    (Received::Response(response), _) => warn!(
                        "Association {}: unexpected response (seq {})",
                        self.address, response.control.seq
                    ),
                    (Received::LinkStatus, Expect::LinkStatus) => return Ok(None),
                    _ => {}
                },
                Wake::Frame(None) | Wake::Status(false) => {
                    self.removed = true;
                    return Err(TaskError::Shutdown);
                }
                Wake::Message(message) => {
                    self.on_message(message);
                    if let Some(err) = self.interrupt.take() {
                        return Err(err);
                    }
                }
                Wake::Status(true) => {
                    if let Some(err) = self.link_error() {
                        return Err(err);
                    }
                }
                Wake::Timer => {
                    return match expect {
                        Expect::Nothing => Ok(None),
                        _ => Err(TaskError::ResponseTimeout),
                    };
                }
            }
        }
    }

    fn on_frame(&mut self, frame: LinkFrame) -> Received {
        match frame.function {
            LinkFunction::LinkStatus => return Received::LinkStatus,
            LinkFunction::RequestLinkStatus => return Received::Nothing,
            LinkFunction::UserData => {}
        }
        if !self.enabled {
            return Received::Nothing;
        }

        let response = match parse_response(&frame.payload) {
            Ok(response) => response,
            Err(err) => {
                warn!("Association {}: malformed response: {}", self.address, err);
                return Received::Nothing;
            }
        };
        log_response(self.decode_level(), Direction::Rx, &response);

        if response.control.uns {
            self.on_unsolicited(response);
            return Received::Nothing;
        }
        if response.control.con {
            self.confirm(response.control.seq, false);
        }
        self.on_iin(response.iin);
        Received::Response(response)
    }

    fn confirm(&mut self, seq: Sequence, unsolicited: bool) {
        let confirm = Request::confirm(seq, unsolicited);
        log_request(self.decode_level(), Direction::Tx, &confirm);
        let frame = LinkFrame::user_data(self.address, self.master_address, confirm.encode());
        if let Err(err) = self.transmit(frame) {
            debug!("Association {}: confirm not sent: {}", self.address, err);
        }
    }

    fn on_unsolicited(&mut self, response: Response) {
        let seq = response.control.seq;
        if response.control.con {
            self.confirm(seq, true);
        }
        if self.last_unsolicited == Some(seq) {
            debug!("Association {}: repeated unsolicited (seq {})", self.address, seq);
            return;
        }
        self.last_unsolicited = Some(seq);
        self.on_iin(response.iin);
        self.deliver(ReadType::Unsolicited, &response);
    }

    fn on_iin(&mut self, iin: Iin) {
        if iin.iin1.contains(Iin1::DEVICE_RESTART) {
            self.auto.clear_restart = true;
        }
        if iin.iin1.contains(Iin1::NEED_TIME) {
            if let Some(mode) = self.config.auto_time_sync {
                self.auto.time_sync = Some(mode);
            }
        }
        if self.config.integrity_on_overflow
            && iin.iin2.contains(Iin2::EVENT_BUFFER_OVERFLOW)
        {
            self.auto.integrity = true;
        }

        let scan = self.config.event_scan_on_events_available;
        let available = EventClasses::new(
            iin.iin1.contains(Iin1::CLASS_1_EVENTS),
            iin.iin1.contains(Iin1::CLASS_2_EVENTS),
            iin.iin1.contains(Iin1::CLASS_3_EVENTS),
        );
        let wanted = EventClasses::new(
            scan.class1 && available.class1,
            scan.class2 && available.class2,
            scan.class3 && available.class3,
        );
        self.auto.event_scan = self.auto.event_scan | wanted;
    }

    fn deliver(&mut self, read_type: ReadType, response: &Response) {
        self.handler.begin_fragment(read_type, response.iin);
        for header in &response.objects {
            match header {
                ObjectHeader::Static {
                    point_type,
                    variation,
                    values,
                } => self.handler.handle_points(
                    HeaderInfo {
                        point_type: *point_type,
                        variation: *variation as u8,
                        is_event: false,
                    },
                    values,
                ),
                ObjectHeader::Events {
                    point_type,
                    variation,
                    values,
                } => self.handler.handle_points(
                    HeaderInfo {
                        point_type: *point_type,
                        variation: *variation as u8,
                        is_event: true,
                    },
                    values,
                ),
                ObjectHeader::Attribute(attribute) => {
                    self.handler.handle_attribute(read_type, attribute)
                }
                _ => {}
            }
        }
        self.handler.end_fragment(read_type, response.iin);
    }

    // ---- tasks ----

    async fn read(&mut self, request: &ReadRequest, read_type: ReadType) -> Result<(), TaskError> {
        let mut response = self
            .request(FunctionCode::Read, request.headers().to_vec())
            .await?;
        loop {
            self.deliver(read_type, &response);
            check_iin(&response)?;
            if response.control.fin {
                return Ok(());
            }
            response = self.next_fragment(&response).await?;
        }
    }

    async fn configure_unsolicited(&mut self, enable: bool, classes: EventClasses) -> Result<(), TaskError> {
        if classes.is_empty() {
            return Ok(());
        }
        let function = if enable {
            FunctionCode::EnableUnsolicited
        } else {
            FunctionCode::DisableUnsolicited
        };
        let objects = classes
            .iter()
            .map(|class| ObjectHeader::EventClass { class, count: None })
            .collect();
        let response = self.request(function, objects).await?;
        check_iin(&response)
    }

    async fn clear_restart(&mut self) -> Result<(), TaskError> {
        let objects = vec![ObjectHeader::Iin {
            index: IIN_RESTART_INDEX,
            value: false,
        }];
        let response = self.request(FunctionCode::Write, objects).await?;
        check_iin(&response)
    }

    async fn command(&mut self, mode: CommandMode, headers: &CommandHeaders) -> Result<(), CommandError> {
        let objects = command_objects(headers);
        match mode {
            CommandMode::DirectOperate => {
                let response = self
                    .request(FunctionCode::DirectOperate, objects.clone())
                    .await
                    .map_err(operate_error)?;
                verify_echo(&objects, &response, CommandError::OperateFailed)
            }
            CommandMode::SelectBeforeOperate => {
                let selected_at = Instant::now();
                let response = self.request(FunctionCode::Select, objects.clone()).await?;
                verify_echo(&objects, &response, CommandError::SelectFailed)?;
                if selected_at.elapsed() > self.config.select_timeout {
                    warn!("Association {}: select response arrived too late", self.address);
                    return Err(CommandError::SelectTimeout);
                }
                let response = self
                    .request(FunctionCode::Operate, objects.clone())
                    .await
                    .map_err(operate_error)?;
                verify_echo(&objects, &response, CommandError::OperateFailed)
            }
        }
    }

    async fn time_sync(&mut self, mode: TimeSyncMode) -> Result<(), TimeSyncError> {
        let response = match mode {
            TimeSyncMode::NonLan => {
                let sent = Instant::now();
                let response = self.request(FunctionCode::DelayMeasure, Vec::new()).await?;
                check_iin(&response)?;
                let round_trip = sent.elapsed();

                let delay_ms = response
                    .objects
                    .iter()
                    .find_map(|h| match h {
                        ObjectHeader::TimeDelayFine(ms) => Some(*ms),
                        _ => None,
                    })
                    .ok_or_else(|| TaskError::bad_response("missing time delay"))?;
                let delay = Duration::from_millis(u64::from(delay_ms));
                if delay > round_trip {
                    return Err(TimeSyncError::BadOutstationTimeDelay(delay_ms));
                }
                let one_way = (round_trip - delay) / 2;

                let now = self.clock.now();
                if !now.is_valid() {
                    return Err(TimeSyncError::ClockUnavailable);
                }
                let time = now
                    .timestamp
                    .checked_add(one_way)
                    .ok_or(TimeSyncError::Overflow)?;
                debug!(
                    "Association {}: round trip {:?}, outstation delay {:?}",
                    self.address, round_trip, delay
                );
                self.request(FunctionCode::Write, vec![ObjectHeader::Time(time)])
                    .await?
            }
            TimeSyncMode::Lan => {
                let recorded = self.clock.now();
                if !recorded.is_valid() {
                    return Err(TimeSyncError::ClockUnavailable);
                }
                let response = self
                    .request(FunctionCode::RecordCurrentTime, Vec::new())
                    .await?;
                check_iin(&response)?;
                let objects = vec![ObjectHeader::LastRecordedTime(recorded.timestamp)];
                self.request(FunctionCode::Write, objects).await?
            }
        };
        check_iin(&response)?;
        if response.iin.iin1.contains(Iin1::NEED_TIME) {
            return Err(TimeSyncError::StillNeedsTime);
        }
        Ok(())
    }

    async fn restart(&mut self, kind: RestartType) -> Result<Duration, TaskError> {
        let function = match kind {
            RestartType::Cold => FunctionCode::ColdRestart,
            RestartType::Warm => FunctionCode::WarmRestart,
        };
        let response = self.request(function, Vec::new()).await?;
        check_iin(&response)?;
        response
            .objects
            .iter()
            .find_map(|h| match h {
                ObjectHeader::TimeDelayCoarse(s) => Some(Duration::from_secs(u64::from(*s))),
                ObjectHeader::TimeDelayFine(ms) => Some(Duration::from_millis(u64::from(*ms))),
                _ => None,
            })
            .ok_or_else(|| TaskError::bad_response("missing restart delay"))
    }

    async fn freeze(&mut self, kind: FreezeType, range: IndexRange) -> Result<(), TaskError> {
        let function = match kind {
            FreezeType::Immediate => FunctionCode::ImmediateFreeze,
            FreezeType::FreezeAndClear => FunctionCode::FreezeClear,
        };
        let objects = vec![ObjectHeader::StaticRange {
            point_type: PointType::Counter,
            variation: StaticVariation::Any,
            range,
        }];
        let response = self.request(function, objects).await?;
        check_iin(&response)
    }

    async fn open_file(
        &mut self,
        name: &str,
        mode: FileMode,
        size: u32,
        max_block_size: u16,
    ) -> Result<FileInfo, FileError> {
        self.file_request_id = self.file_request_id.wrapping_add(1);
        let open = FileOpen {
            request_id: self.file_request_id,
            mode,
            max_block_size,
            size,
            name: name.to_string(),
        };
        let response = self
            .request(FunctionCode::OpenFile, vec![ObjectHeader::FileOpen(open)])
            .await?;
        let status = file_command_status(&response)?;
        if status.status != FileStatus::Success {
            return Err(FileError::Status(status.status));
        }
        Ok(FileInfo {
            handle: status.handle,
            size: status.size,
            max_block_size: status.max_block_size,
        })
    }

    async fn read_file(&mut self, handle: u32) -> Result<Bytes, FileError> {
        let mut data = BytesMut::new();
        let mut block = 0;
        loop {
            let request = ObjectHeader::FileTransport(FileTransport {
                handle,
                block,
                last: false,
                data: Bytes::new(),
            });
            let response = self.request(FunctionCode::Read, vec![request]).await?;
            check_iin(&response)?;
            match response.objects.first() {
                Some(ObjectHeader::FileTransport(transport)) => {
                    if transport.block != block {
                        return Err(FileError::BadBlockNum {
                            expected: block,
                            received: transport.block,
                        });
                    }
                    data.extend_from_slice(&transport.data);
                    if transport.last {
                        return Ok(data.freeze());
                    }
                }
                Some(ObjectHeader::FileTransportStatus(status)) => {
                    return Err(FileError::Status(status.status));
                }
                _ => return Err(TaskError::bad_response("missing file block").into()),
            }
            block += 1;
        }
    }

    async fn write_file(&mut self, handle: u32, data: &Bytes, block_size: u16) -> Result<(), FileError> {
        let block_size = usize::from(block_size.max(1));
        let count = data.len().div_ceil(block_size).max(1);
        for block in 0..count {
            let start = block * block_size;
            let end = (start + block_size).min(data.len());
            let transport = FileTransport {
                handle,
                block: block as u32,
                last: block + 1 == count,
                data: data.slice(start..end),
            };
            let response = self
                .request(FunctionCode::Write, vec![ObjectHeader::FileTransport(transport)])
                .await?;
            check_iin(&response)?;
            let status = response
                .objects
                .iter()
                .find_map(|h| match h {
                    ObjectHeader::FileTransportStatus(status) => Some(*status),
                    _ => None,
                })
                .ok_or_else(|| TaskError::bad_response("missing file transport status"))?;
            if status.status != FileStatus::Success {
                return Err(FileError::Status(status.status));
            }
            if status.block != block as u32 {
                return Err(FileError::BadBlockNum {
                    expected: block as u32,
                    received: status.block,
                });
            }
        }
        Ok(())
    }

    async fn close_file(&mut self, handle: u32) -> Result<(), FileError> {
        let close = FileCommandStatus {
            handle,
            size: 0,
            max_block_size: 0,
            request_id: self.file_request_id,
            status: FileStatus::Success,
        };
        let response = self
            .request(FunctionCode::CloseFile, vec![ObjectHeader::FileCommandStatus(close)])
            .await?;
        let status = file_command_status(&response)?;
        if status.status != FileStatus::Success {
            return Err(FileError::Status(status.status));
        }
        Ok(())
    }

    async fn read_attributes(&mut self, id: AttrId) -> Result<(), TaskError> {
        let response = self
            .request(FunctionCode::Read, vec![ObjectHeader::AttributeRequest(id)])
            .await?;
        self.deliver(ReadType::SinglePoll, &response);
        check_iin(&response)
    }

    async fn write_attribute(&mut self, attribute: &Attribute) -> Result<(), TaskError> {
        let objects = vec![ObjectHeader::Attribute(attribute.clone())];
        let response = self.request(FunctionCode::Write, objects).await?;
        check_iin(&response)
    }

    async fn link_status(&mut self) -> Result<(), TaskError> {
        self.transmit(LinkFrame::request_link_status(self.address, self.master_address))?;
        let deadline = Instant::now() + self.config.response_timeout;
        self.wait_for(Expect::LinkStatus, deadline).await.map(|_| ())
    }
}

fn is_interrupt(err: &TaskError) -> bool {
    matches!(
        err,
        TaskError::Shutdown | TaskError::NoConnection | TaskError::AssociationDisabled
    )
}

/// Reject a response whose IIN2 reports a request error.
fn check_iin(response: &Response) -> Result<(), TaskError> {
    if response.iin.iin2.has_request_error() {
        return Err(TaskError::Rejected(response.iin.iin2));
    }
    Ok(())
}

fn file_command_status(response: &Response) -> Result<FileCommandStatus, FileError> {
    check_iin(response)?;
    response
        .objects
        .iter()
        .find_map(|h| match h {
            ObjectHeader::FileCommandStatus(status) => Some(*status),
            _ => None,
        })
        .ok_or_else(|| TaskError::bad_response("missing file command status").into())
}

/// A lost or garbled reply to an operate request must not trigger a retry.
fn operate_error(err: TaskError) -> CommandError {
    match err {
        TaskError::ResponseTimeout | TaskError::BadResponse(_) => {
            CommandError::OperateUnconfirmed(err)
        }
        other => other.into(),
    }
}

/// Check that a command response echoes the request, then report the first
/// non-success status through `failed`.
fn verify_echo(
    sent: &[ObjectHeader],
    response: &Response,
    failed: fn(CommandStatus) -> CommandError,
) -> Result<(), CommandError> {
    check_iin(response)?;
    if response.objects.len() != sent.len() {
        return Err(CommandError::Mismatch);
    }

    let mut first_failure = None;
    for (request, echo) in sent.iter().zip(&response.objects) {
        let statuses: Vec<CommandStatus> = match (request, echo) {
            (ObjectHeader::Crob(a), ObjectHeader::Crob(b))
                if a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| x.index == y.index && x.command == y.command) =>
            {
                b.iter().map(|i| i.status).collect()
            }
            (ObjectHeader::AnalogOutput(a), ObjectHeader::AnalogOutput(b))
                if a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| x.index == y.index && x.command == y.command) =>
            {
                b.iter().map(|i| i.status).collect()
            }
            _ => return Err(CommandError::Mismatch),
        };
        if first_failure.is_none() {
            first_failure = statuses.into_iter().find(|s| !s.is_success());
        }
    }

    match first_failure {
        Some(status) => Err(failed(status)),
        None => Ok(()),
    }
}

async fn wait(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
