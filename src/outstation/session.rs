//! Outstation session state machine.
//!
//! The session is transport agnostic: frames go in through
//! [`Session::handle_frame`], timers through [`Session::on_timeout`], and every
//! frame to transmit is collected in an outbox drained by the run loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{LinkFrame, MAX_PAYLOAD_LENGTH};
use crate::decode::{log_request, log_response, DecodeLevel, Direction};
use crate::error::ParseError;
use crate::outstation::config::{ConfirmWaitPolicy, OutstationConfig};
use crate::outstation::database::{Database, EventRecord, Owner, Store};
use crate::outstation::traits::{ApplicationIin, FreezeResult, OutstationHandlers, RestartDelay};
use crate::parser::{parse_request, parse_request_header};
use crate::types::{
    measurement_size, AttrId, CommandStatus, Control, EventClass, EventClasses,
    EventVariation, FileCommandStatus, FileStatus, FileTransport, FileTransportStatus,
    FunctionCode, Iin, Iin1, Iin2, IndexRange, LinkFunction, ObjectHeader, OperateType,
    PointType, Request, Response, Sequence, StaticVariation, ALL_ATTRIBUTES, IIN_RESTART_INDEX,
};

/// Room for objects in a response fragment.
const RESPONSE_CAPACITY: usize = MAX_PAYLOAD_LENGTH - 4;

/// Worst case header bytes in front of a run of values.
const HEADER_OVERHEAD: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SolicitedState {
    Idle,
    ConfirmWait { seq: Sequence, deadline: Instant },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum UnsolicitedState {
    Idle,
    ConfirmWait {
        seq: Sequence,
        fragment: Bytes,
        deadline: Instant,
        retries: usize,
        null: bool,
    },
    Backoff {
        until: Instant,
    },
}

/// Last request and the response it produced, for duplicate detection.
#[derive(Debug, Clone)]
struct LastExchange {
    seq: Sequence,
    request: Bytes,
    response: Bytes,
}

/// Objects and timing of an accepted SELECT.
#[derive(Debug, Clone)]
struct Selection {
    seq: Sequence,
    objects: Bytes,
    at: Instant,
}

/// Remaining room in the response under construction.
struct Budget(usize);

impl Budget {
    fn take(&mut self, size: usize) -> bool {
        if size > self.0 {
            return false;
        }
        self.0 -= size;
        true
    }
}

pub(crate) struct Session {
    config: OutstationConfig,
    database: Arc<Database>,
    handlers: OutstationHandlers,
    decode_level: DecodeLevel,
    restart: bool,
    broadcast: bool,
    unsolicited_classes: EventClasses,
    null_confirmed: bool,
    unsolicited_seq: Sequence,
    solicited: SolicitedState,
    unsolicited: UnsolicitedState,
    last: Option<LastExchange>,
    selection: Option<Selection>,
    recorded_time: Option<Instant>,
    pending: Option<(Bytes, bool, Instant)>,
    open_files: BTreeMap<u32, u16>,
    outbox: Vec<LinkFrame>,
}

impl Session {
    pub(crate) fn new(config: OutstationConfig, database: Arc<Database>, handlers: OutstationHandlers) -> Self {
        Self {
            decode_level: config.decode_level,
            config,
            database,
            handlers,
            restart: true,
            broadcast: false,
            unsolicited_classes: EventClasses::NONE,
            null_confirmed: false,
            unsolicited_seq: Sequence::default(),
            solicited: SolicitedState::Idle,
            unsolicited: UnsolicitedState::Idle,
            last: None,
            selection: None,
            recorded_time: None,
            pending: None,
            open_files: BTreeMap::new(),
            outbox: Vec::new(),
        }
    }

    pub(crate) fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub(crate) fn set_decode_level(&mut self, level: DecodeLevel) {
        self.decode_level = level;
    }

    /// Frames waiting to be transmitted.
    pub(crate) fn drain(&mut self) -> Vec<LinkFrame> {
        std::mem::take(&mut self.outbox)
    }

    /// Reset all per-connection state. Events written but not confirmed are
    /// reported again on the next connection.
    pub(crate) fn reset(&mut self) {
        let mut store = self.database.lock();
        store.events.clear_selection(Owner::Solicited);
        store.events.clear_selection(Owner::Unsolicited);
        drop(store);

        self.solicited = SolicitedState::Idle;
        self.unsolicited = UnsolicitedState::Idle;
        self.null_confirmed = false;
        self.unsolicited_classes = EventClasses::NONE;
        self.last = None;
        self.selection = None;
        self.pending = None;
        self.outbox.clear();
    }

    /// Earliest instant at which [`Session::on_timeout`] must run.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let solicited = match self.solicited {
            SolicitedState::ConfirmWait { deadline, .. } => Some(deadline),
            SolicitedState::Idle => None,
        };
        let unsolicited = match &self.unsolicited {
            UnsolicitedState::ConfirmWait { deadline, .. } => Some(*deadline),
            UnsolicitedState::Backoff { until } => Some(*until),
            UnsolicitedState::Idle => None,
        };
        match (solicited, unsolicited) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn on_timeout(&mut self, now: Instant) {
        if let SolicitedState::ConfirmWait { seq, deadline } = self.solicited {
            if now >= deadline {
                warn!("Solicited confirm timeout (seq {})", seq);
                self.database
                    .lock()
                    .events
                    .clear_selection(Owner::Solicited);
                self.solicited = SolicitedState::Idle;
                self.process_pending(now);
            }
        }

        match &mut self.unsolicited {
            UnsolicitedState::ConfirmWait {
                seq,
                fragment,
                deadline,
                retries,
                null,
            } if now >= *deadline => {
                let exhausted = self
                    .config
                    .max_unsolicited_retries
                    .is_some_and(|max| *retries >= max);
                if exhausted {
                    warn!(
                        "Unsolicited confirm timeout (seq {}), retries exhausted",
                        seq
                    );
                    if !*null {
                        self.database
                            .lock()
                            .events
                            .clear_selection(Owner::Unsolicited);
                    }
                    self.unsolicited_seq = seq.next();
                    self.unsolicited = UnsolicitedState::Backoff {
                        until: now + self.config.unsolicited_retry_delay,
                    };
                } else {
                    *retries += 1;
                    *deadline = now + self.config.unsolicited_confirm_timeout;
                    debug!("Retrying unsolicited response (seq {}, retry {})", seq, retries);
                    let fragment = fragment.clone();
                    self.push(fragment);
                }
            }
            UnsolicitedState::Backoff { until } if now >= *until => {
                self.unsolicited = UnsolicitedState::Idle;
            }
            _ => {}
        }
    }

    /// Start an unsolicited response if one is due.
    pub(crate) fn poll_unsolicited(&mut self, now: Instant) {
        if !self.config.allow_unsolicited
            || self.unsolicited != UnsolicitedState::Idle
            || self.solicited != SolicitedState::Idle
        {
            return;
        }

        if !self.null_confirmed {
            let iin = self.iin(Iin2::default());
            let response = Response::unsolicited(self.unsolicited_seq, iin, Vec::new());
            self.send_unsolicited(response, true, now);
            return;
        }

        let enabled = self.unsolicited_classes;
        if enabled.is_empty() {
            return;
        }

        let app = self.handlers.application.application_iin();
        let mut store = self.database.lock();
        let ready = store.events.unwritten_classes();
        if !EventClass::ALL
            .iter()
            .any(|c| enabled.contains(*c) && ready.contains(*c))
        {
            return;
        }

        let mut budget = Budget(RESPONSE_CAPACITY);
        let records = select_events(
            &mut store,
            Owner::Unsolicited,
            |r| enabled.contains(r.class),
            None,
            &mut budget,
        );
        let objects = event_headers(&records, EventVariation::Any);
        let iin = self.assemble_iin(&store, app, Iin2::default());
        drop(store);

        let response = Response::unsolicited(self.unsolicited_seq, iin, objects);
        self.send_unsolicited(response, false, now);
    }

    fn send_unsolicited(&mut self, response: Response, null: bool, now: Instant) {
        log_response(self.decode_level, Direction::Tx, &response);
        let fragment = response.encode();
        self.broadcast = false;
        self.unsolicited = UnsolicitedState::ConfirmWait {
            seq: response.control.seq,
            fragment: fragment.clone(),
            deadline: now + self.config.unsolicited_confirm_timeout,
            retries: 0,
            null,
        };
        self.push(fragment);
    }

    pub(crate) fn handle_frame(&mut self, frame: LinkFrame, now: Instant) {
        let broadcast = frame.is_broadcast();
        if frame.destination != self.config.outstation_address && !broadcast {
            debug!("Ignoring frame for address {}", frame.destination);
            return;
        }
        if frame.source != self.config.master_address {
            warn!("Ignoring frame from unknown master {}", frame.source);
            return;
        }

        match frame.function {
            LinkFunction::RequestLinkStatus => {
                if !broadcast {
                    self.outbox.push(LinkFrame::link_status(
                        frame.source,
                        self.config.outstation_address,
                    ));
                }
            }
            LinkFunction::LinkStatus => {}
            LinkFunction::UserData => self.handle_fragment(frame.payload, broadcast, now),
        }
    }

    fn handle_fragment(&mut self, payload: Bytes, broadcast: bool, now: Instant) {
        let request = match parse_request(&payload) {
            Ok(request) => request,
            Err(err) => return self.reject(&payload, err, broadcast),
        };
        log_request(self.decode_level, Direction::Rx, &request);

        if request.function == FunctionCode::Confirm {
            return self.handle_confirm(request.control, now);
        }

        if !broadcast {
            if let Some(last) = &self.last {
                if last.seq == request.control.seq && last.request == payload {
                    debug!("Duplicate request (seq {}), repeating response", last.seq);
                    let response = last.response.clone();
                    if let SolicitedState::ConfirmWait { deadline, .. } = &mut self.solicited {
                        *deadline = now + self.config.solicited_confirm_timeout;
                    }
                    return self.push(response);
                }
            }
        }

        if let SolicitedState::ConfirmWait { seq, .. } = self.solicited {
            match self.config.confirm_wait_policy {
                ConfirmWaitPolicy::Abandon => {
                    debug!("New request abandons confirm wait (seq {})", seq);
                    self.database
                        .lock()
                        .events
                        .clear_selection(Owner::Solicited);
                    self.solicited = SolicitedState::Idle;
                }
                ConfirmWaitPolicy::Queue => {
                    debug!("Queueing request during confirm wait (seq {})", seq);
                    self.pending = Some((payload, broadcast, now));
                    return;
                }
            }
        }

        self.process(request, payload, broadcast, now, now);
    }

    fn process_pending(&mut self, now: Instant) {
        let Some((payload, broadcast, received)) = self.pending.take() else {
            return;
        };
        if let Ok(request) = parse_request(&payload) {
            self.process(request, payload, broadcast, received, now);
        }
    }

    fn reject(&mut self, payload: &[u8], err: ParseError, broadcast: bool) {
        warn!("Malformed request: {}", err);
        let Ok((control, function)) = parse_request_header(payload) else {
            return;
        };
        let no_response = FunctionCode::from_u8(function)
            .map(|f| f.is_no_response() || f == FunctionCode::Confirm)
            .unwrap_or(false);
        if broadcast || no_response {
            return;
        }
        let iin = self.iin(err.iin2());
        let response = Response::solicited(control.seq, false, iin, Vec::new());
        self.respond(response);
    }

    fn handle_confirm(&mut self, control: Control, now: Instant) {
        if control.uns {
            if let UnsolicitedState::ConfirmWait { seq, null, .. } = &self.unsolicited {
                if *seq != control.seq {
                    warn!("Unexpected unsolicited confirm (seq {})", control.seq);
                    return;
                }
                if *null {
                    info!("Null unsolicited response confirmed");
                    self.null_confirmed = true;
                } else {
                    let removed = self
                        .database
                        .lock()
                        .events
                        .confirm(Owner::Unsolicited);
                    debug!("Unsolicited confirm removed {} event(s)", removed);
                }
                self.unsolicited_seq = seq.next();
                self.unsolicited = UnsolicitedState::Idle;
            }
            return;
        }

        match self.solicited {
            SolicitedState::ConfirmWait { seq, .. } if seq == control.seq => {
                let removed = self.database.lock().events.confirm(Owner::Solicited);
                debug!("Solicited confirm removed {} event(s)", removed);
                self.solicited = SolicitedState::Idle;
                self.process_pending(now);
            }
            _ => warn!("Unexpected solicited confirm (seq {})", control.seq),
        }
    }

    /// `received` is when the request arrived, `now` when it is processed.
    /// They differ for a request queued behind a confirm wait.
    fn process(
        &mut self,
        request: Request,
        payload: Bytes,
        broadcast: bool,
        received: Instant,
        now: Instant,
    ) {
        let seq = request.control.seq;
        let mut con = false;
        let (mut objects, iin2) = match request.function {
            FunctionCode::Read => {
                let (objects, iin2, events) = self.read(&request.objects);
                con = events;
                (objects, iin2)
            }
            FunctionCode::Write => self.write(&request.objects),
            FunctionCode::Select => self.select(&request, payload.slice(2..), received),
            FunctionCode::Operate => self.operate(&request, &payload.slice(2..), received),
            FunctionCode::DirectOperate => {
                self.execute_controls(&request.objects, Stage::Operate(OperateType::DirectOperate))
            }
            FunctionCode::DirectOperateNoResponse => self.execute_controls(
                &request.objects,
                Stage::Operate(OperateType::DirectOperateNoAck),
            ),
            FunctionCode::ImmediateFreeze | FunctionCode::ImmediateFreezeNoResponse => {
                (Vec::new(), self.freeze(&request.objects, false))
            }
            FunctionCode::FreezeClear | FunctionCode::FreezeClearNoResponse => {
                (Vec::new(), self.freeze(&request.objects, true))
            }
            FunctionCode::ColdRestart => self.restart(true),
            FunctionCode::WarmRestart => self.restart(false),
            FunctionCode::EnableUnsolicited => {
                (Vec::new(), self.configure_unsolicited(&request.objects, true))
            }
            FunctionCode::DisableUnsolicited => {
                (Vec::new(), self.configure_unsolicited(&request.objects, false))
            }
            FunctionCode::DelayMeasure => {
                let elapsed = Instant::now().saturating_duration_since(received);
                let millis = elapsed.as_millis().min(u16::MAX as u128) as u16;
                (vec![ObjectHeader::TimeDelayFine(millis)], Iin2::default())
            }
            FunctionCode::RecordCurrentTime => {
                self.recorded_time = Some(received);
                (Vec::new(), Iin2::default())
            }
            FunctionCode::OpenFile => self.open_file(&request.objects),
            FunctionCode::CloseFile => self.close_file(&request.objects),
            FunctionCode::Confirm | FunctionCode::Response | FunctionCode::UnsolicitedResponse => {
                (Vec::new(), Iin2::NO_FUNC_CODE_SUPPORT)
            }
        };

        if con && (broadcast || iin2.has_request_error()) {
            // Events are only handed over in a response the master can confirm
            self.database
                .lock()
                .events
                .clear_selection(Owner::Solicited);
            objects.retain(|h| !matches!(h, ObjectHeader::Events { .. }));
            con = false;
        }

        if broadcast {
            debug!("Broadcast {} processed without response", request.function);
            self.broadcast = true;
            return;
        }
        if request.function.is_no_response() {
            return;
        }

        let iin = self.iin(iin2);
        let response = Response::solicited(seq, con, iin, objects);
        let encoded = self.respond(response);
        self.last = Some(LastExchange {
            seq,
            request: payload,
            response: encoded,
        });
        if con {
            self.solicited = SolicitedState::ConfirmWait {
                seq,
                deadline: now + self.config.solicited_confirm_timeout,
            };
        }
    }

    fn respond(&mut self, response: Response) -> Bytes {
        log_response(self.decode_level, Direction::Tx, &response);
        self.broadcast = false;
        let encoded = response.encode();
        self.push(encoded.clone());
        encoded
    }

    fn push(&mut self, fragment: Bytes) {
        self.outbox.push(LinkFrame::user_data(
            self.config.master_address,
            self.config.outstation_address,
            fragment,
        ));
    }

    /// The application is asked before the database is locked so it may
    /// read the database itself.
    fn iin(&self, iin2: Iin2) -> Iin {
        let app = self.handlers.application.application_iin();
        let store = self.database.lock();
        self.assemble_iin(&store, app, iin2)
    }

    fn assemble_iin(&self, store: &Store, app: ApplicationIin, iin2: Iin2) -> Iin {
        let classes = store.events.unwritten_classes();

        let mut iin1 = Iin1::default();
        iin1.set(Iin1::BROADCAST, self.broadcast);
        iin1.set(Iin1::CLASS_1_EVENTS, classes.class1);
        iin1.set(Iin1::CLASS_2_EVENTS, classes.class2);
        iin1.set(Iin1::CLASS_3_EVENTS, classes.class3);
        iin1.set(Iin1::NEED_TIME, app.need_time);
        iin1.set(Iin1::LOCAL_CONTROL, app.local_control);
        iin1.set(Iin1::DEVICE_TROUBLE, app.device_trouble);
        iin1.set(Iin1::DEVICE_RESTART, self.restart);

        let mut iin2 = iin2;
        iin2.set(Iin2::EVENT_BUFFER_OVERFLOW, store.events.is_overflown());
        iin2.set(Iin2::CONFIG_CORRUPT, app.config_corrupt);
        Iin::new(iin1, iin2)
    }

    fn read(&mut self, headers: &[ObjectHeader]) -> (Vec<ObjectHeader>, Iin2, bool) {
        let mut objects = Vec::new();
        let mut iin2 = Iin2::default();
        let mut events = false;
        let mut budget = Budget(RESPONSE_CAPACITY);

        for header in headers {
            let mut store = self.database.lock();
            match header {
                ObjectHeader::Class0 => {
                    let types: Vec<_> = store.class_zero_types().collect();
                    for point_type in types {
                        read_static(
                            &store,
                            point_type,
                            StaticVariation::Any,
                            IndexRange::All,
                            &mut budget,
                            &mut objects,
                        );
                    }
                }
                ObjectHeader::StaticRange {
                    point_type,
                    variation,
                    range,
                } => {
                    let missing = read_static(
                        &store,
                        *point_type,
                        *variation,
                        *range,
                        &mut budget,
                        &mut objects,
                    );
                    if missing {
                        iin2 |= Iin2::PARAMETER_ERROR;
                    }
                }
                ObjectHeader::EventClass { class, count } => {
                    let class = *class;
                    let records = select_events(
                        &mut store,
                        Owner::Solicited,
                        |r| r.class == class,
                        *count,
                        &mut budget,
                    );
                    events |= !records.is_empty();
                    objects.extend(event_headers(&records, EventVariation::Any));
                }
                ObjectHeader::EventRange {
                    point_type,
                    variation,
                    count,
                } => {
                    let point_type = *point_type;
                    let records = select_events(
                        &mut store,
                        Owner::Solicited,
                        |r| r.point_type == point_type,
                        *count,
                        &mut budget,
                    );
                    events |= !records.is_empty();
                    objects.extend(event_headers(&records, *variation));
                }
                ObjectHeader::AttributeRequest(id) => {
                    let found = read_attributes(&store, *id);
                    if found.is_empty() {
                        iin2 |= Iin2::OBJECT_UNKNOWN;
                    }
                    objects.extend(found.into_iter().map(ObjectHeader::Attribute));
                }
                ObjectHeader::FileTransport(block) => {
                    drop(store);
                    objects.push(self.read_file_block(block));
                }
                other => {
                    debug!("READ of {} not supported", other);
                    iin2 |= Iin2::OBJECT_UNKNOWN;
                }
            }
        }
        (objects, iin2, events)
    }

    fn read_file_block(&mut self, block: &FileTransport) -> ObjectHeader {
        let failed = |status| {
            ObjectHeader::FileTransportStatus(FileTransportStatus {
                handle: block.handle,
                block: block.block,
                last: false,
                status,
            })
        };
        let Some(max_size) = self.open_files.get(&block.handle).copied() else {
            return failed(FileStatus::InvalidHandle);
        };
        match self
            .handlers
            .file
            .read_block(block.handle, block.block, max_size)
        {
            Ok((mut data, last)) => {
                data.truncate(max_size as usize);
                ObjectHeader::FileTransport(FileTransport {
                    handle: block.handle,
                    block: block.block,
                    last,
                    data,
                })
            }
            Err(status) => failed(status),
        }
    }

    fn write(&mut self, headers: &[ObjectHeader]) -> (Vec<ObjectHeader>, Iin2) {
        let mut objects = Vec::new();
        let mut iin2 = Iin2::default();
        for header in headers {
            match header {
                ObjectHeader::Time(ts) => self.handlers.application.write_absolute_time(*ts),
                ObjectHeader::LastRecordedTime(ts) => match self.recorded_time.take() {
                    Some(recorded) => {
                        let elapsed = Instant::now().saturating_duration_since(recorded);
                        match ts.checked_add(elapsed) {
                            Some(now) => self.handlers.application.write_absolute_time(now),
                            None => iin2 |= Iin2::PARAMETER_ERROR,
                        }
                    }
                    None => {
                        warn!("WRITE of last recorded time without RECORD_CURRENT_TIME");
                        iin2 |= Iin2::PARAMETER_ERROR;
                    }
                },
                ObjectHeader::Iin { index, value } => {
                    if *index == IIN_RESTART_INDEX && !*value {
                        info!("DEVICE_RESTART cleared by master");
                        self.restart = false;
                    } else {
                        iin2 |= Iin2::PARAMETER_ERROR;
                    }
                }
                ObjectHeader::Attribute(attr) => {
                    if !self.database.lock().write_attribute(attr) {
                        warn!("Rejected write of attribute {}", attr.id);
                        iin2 |= Iin2::PARAMETER_ERROR;
                    }
                }
                ObjectHeader::FileTransport(block) => {
                    let status = if self.open_files.contains_key(&block.handle) {
                        self.handlers.file.write_block(
                            block.handle,
                            block.block,
                            block.last,
                            &block.data,
                        )
                    } else {
                        FileStatus::InvalidHandle
                    };
                    objects.push(ObjectHeader::FileTransportStatus(FileTransportStatus {
                        handle: block.handle,
                        block: block.block,
                        last: block.last,
                        status,
                    }));
                }
                other => {
                    debug!("WRITE of {} not supported", other);
                    iin2 |= Iin2::OBJECT_UNKNOWN;
                }
            }
        }
        (objects, iin2)
    }

    fn select(
        &mut self,
        request: &Request,
        objects: Bytes,
        received: Instant,
    ) -> (Vec<ObjectHeader>, Iin2) {
        let (echo, iin2) = self.execute_controls(&request.objects, Stage::Select);
        let accepted = iin2.is_empty() && !echo.is_empty() && echo.iter().all(all_succeeded);
        self.selection = accepted.then(|| Selection {
            seq: request.control.seq,
            objects,
            at: received,
        });
        (echo, iin2)
    }

    fn operate(
        &mut self,
        request: &Request,
        objects: &Bytes,
        received: Instant,
    ) -> (Vec<ObjectHeader>, Iin2) {
        let refused = match self.selection.take() {
            Some(s) if s.seq.next() == request.control.seq && s.objects == *objects => {
                let elapsed = received.saturating_duration_since(s.at);
                (elapsed > self.config.select_timeout).then(|| {
                    warn!("OPERATE {:?} after SELECT, select timed out", elapsed);
                    CommandStatus::Timeout
                })
            }
            _ => Some(CommandStatus::NoSelect),
        };
        match refused {
            Some(status) => (echo_controls(&request.objects, status), Iin2::default()),
            None => self.execute_controls(
                &request.objects,
                Stage::Operate(OperateType::SelectBeforeOperate),
            ),
        }
    }

    fn execute_controls(&mut self, headers: &[ObjectHeader], stage: Stage) -> (Vec<ObjectHeader>, Iin2) {
        let count: usize = headers
            .iter()
            .map(|h| match h {
                ObjectHeader::Crob(items) => items.len(),
                ObjectHeader::AnalogOutput(items) => items.len(),
                _ => 0,
            })
            .sum();
        if self
            .config
            .max_controls_per_request
            .is_some_and(|max| count > max as usize)
        {
            warn!("Request carries {} controls, rejecting all", count);
            return (
                echo_controls(headers, CommandStatus::TooManyObjects),
                Iin2::default(),
            );
        }

        let database = self.database.as_ref();
        let handler = self.handlers.control.as_mut();
        let mut objects = Vec::with_capacity(headers.len());
        let mut iin2 = Iin2::default();

        handler.begin_fragment();
        for header in headers {
            match header {
                ObjectHeader::Crob(items) => {
                    let mut echoed = Vec::with_capacity(items.len());
                    for item in items {
                        let status = match stage {
                            Stage::Select => handler.select_crob(&item.command, item.index, database),
                            Stage::Operate(op) => {
                                handler.operate_crob(&item.command, item.index, op, database)
                            }
                        };
                        echoed.push(item.with_status(status));
                    }
                    objects.push(ObjectHeader::Crob(echoed));
                }
                ObjectHeader::AnalogOutput(items) => {
                    let mut echoed = Vec::with_capacity(items.len());
                    for item in items {
                        let status = match stage {
                            Stage::Select => {
                                handler.select_analog_output(&item.command, item.index, database)
                            }
                            Stage::Operate(op) => handler.operate_analog_output(
                                &item.command,
                                item.index,
                                op,
                                database,
                            ),
                        };
                        echoed.push(item.with_status(status));
                    }
                    objects.push(ObjectHeader::AnalogOutput(echoed));
                }
                other => {
                    debug!("Control request with {} not supported", other);
                    iin2 |= Iin2::OBJECT_UNKNOWN;
                }
            }
        }
        handler.end_fragment(database);
        (objects, iin2)
    }

    fn freeze(&mut self, headers: &[ObjectHeader], clear: bool) -> Iin2 {
        let mut iin2 = Iin2::default();
        for header in headers {
            let range = match header {
                ObjectHeader::StaticRange {
                    point_type: PointType::Counter,
                    range,
                    ..
                } => *range,
                other => {
                    debug!("Freeze of {} not supported", other);
                    iin2 |= Iin2::OBJECT_UNKNOWN;
                    continue;
                }
            };
            match self
                .handlers
                .application
                .freeze_counters(range, clear, &self.database)
            {
                FreezeResult::Success => {}
                FreezeResult::ParameterError => iin2 |= Iin2::PARAMETER_ERROR,
                FreezeResult::NotSupported => iin2 |= Iin2::NO_FUNC_CODE_SUPPORT,
            }
        }
        iin2
    }

    fn restart(&mut self, cold: bool) -> (Vec<ObjectHeader>, Iin2) {
        let delay = if cold {
            self.handlers.application.cold_restart()
        } else {
            self.handlers.application.warm_restart()
        };
        match delay {
            Some(RestartDelay::Seconds(s)) => (vec![ObjectHeader::TimeDelayCoarse(s)], Iin2::default()),
            Some(RestartDelay::Milliseconds(ms)) => {
                (vec![ObjectHeader::TimeDelayFine(ms)], Iin2::default())
            }
            None => (Vec::new(), Iin2::NO_FUNC_CODE_SUPPORT),
        }
    }

    fn configure_unsolicited(&mut self, headers: &[ObjectHeader], enable: bool) -> Iin2 {
        if enable && !self.config.allow_unsolicited {
            return Iin2::NO_FUNC_CODE_SUPPORT;
        }
        let mut iin2 = Iin2::default();
        for header in headers {
            match header {
                ObjectHeader::EventClass { class, .. } => {
                    self.unsolicited_classes.set(*class, enable);
                }
                _ => iin2 |= Iin2::OBJECT_UNKNOWN,
            }
        }
        debug!("Unsolicited classes now {:?}", self.unsolicited_classes);
        iin2
    }

    fn open_file(&mut self, headers: &[ObjectHeader]) -> (Vec<ObjectHeader>, Iin2) {
        let [ObjectHeader::FileOpen(open)] = headers else {
            return (Vec::new(), Iin2::PARAMETER_ERROR);
        };
        let status = match self.handlers.file.open(open) {
            Ok(info) => {
                let block_size = negotiate_block_size(info.max_block_size, open.max_block_size);
                self.open_files.insert(info.handle, block_size);
                info!("Opened file {} as handle {}", open.name, info.handle);
                FileCommandStatus {
                    handle: info.handle,
                    size: info.size,
                    max_block_size: block_size,
                    request_id: open.request_id,
                    status: FileStatus::Success,
                }
            }
            Err(status) => FileCommandStatus {
                handle: 0,
                size: 0,
                max_block_size: 0,
                request_id: open.request_id,
                status,
            },
        };
        (vec![ObjectHeader::FileCommandStatus(status)], Iin2::default())
    }

    fn close_file(&mut self, headers: &[ObjectHeader]) -> (Vec<ObjectHeader>, Iin2) {
        let [ObjectHeader::FileCommandStatus(command)] = headers else {
            return (Vec::new(), Iin2::PARAMETER_ERROR);
        };
        let status = if self.open_files.remove(&command.handle).is_some() {
            self.handlers.file.close(command.handle)
        } else {
            FileStatus::InvalidHandle
        };
        let reply = FileCommandStatus {
            status,
            ..*command
        };
        (vec![ObjectHeader::FileCommandStatus(reply)], Iin2::default())
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Select,
    Operate(OperateType),
}

fn all_succeeded(header: &ObjectHeader) -> bool {
    match header {
        ObjectHeader::Crob(items) => items.iter().all(|i| i.status.is_success()),
        ObjectHeader::AnalogOutput(items) => items.iter().all(|i| i.status.is_success()),
        _ => false,
    }
}

fn echo_controls(headers: &[ObjectHeader], status: CommandStatus) -> Vec<ObjectHeader> {
    headers
        .iter()
        .filter_map(|header| match header {
            ObjectHeader::Crob(items) => Some(ObjectHeader::Crob(
                items.iter().map(|i| i.with_status(status)).collect(),
            )),
            ObjectHeader::AnalogOutput(items) => Some(ObjectHeader::AnalogOutput(
                items.iter().map(|i| i.with_status(status)).collect(),
            )),
            _ => None,
        })
        .collect()
}

fn negotiate_block_size(outstation: u16, master: u16) -> u16 {
    // handle, block number and free-format header
    const MAX_BLOCK: u16 = (RESPONSE_CAPACITY - 16) as u16;
    let size = match master {
        0 => outstation,
        m => outstation.min(m),
    };
    size.clamp(1, MAX_BLOCK)
}

/// Append static values of one type. Returns true if the range named an
/// index that does not exist.
fn read_static(
    store: &Store,
    point_type: PointType,
    requested: StaticVariation,
    range: IndexRange,
    budget: &mut Budget,
    objects: &mut Vec<ObjectHeader>,
) -> bool {
    let (points, missing) = store.range(point_type, range);

    let mut run: Option<(StaticVariation, Vec<_>)> = None;
    for (index, point) in points {
        let variation = match (requested, point.config.static_variation) {
            (StaticVariation::Any, StaticVariation::Any) => StaticVariation::WithFlags,
            (StaticVariation::Any, configured) => configured,
            (requested, _) => requested,
        };
        let with_flags = variation != StaticVariation::WithoutFlags;
        let new_run = run.as_ref().map_or(true, |(v, _)| *v != variation);
        let size = 2
            + measurement_size(point_type, &point.current, with_flags, false)
            + if new_run { HEADER_OVERHEAD } else { 0 };
        if !budget.take(size) {
            warn!("Response full, {} values truncated at index {}", point_type, index);
            break;
        }
        if new_run {
            if let Some((variation, values)) = run.take() {
                objects.push(ObjectHeader::Static {
                    point_type,
                    variation,
                    values,
                });
            }
            run = Some((variation, Vec::new()));
        }
        if let Some((_, values)) = run.as_mut() {
            values.push((index, point.current.clone()));
        }
    }
    if let Some((variation, values)) = run {
        objects.push(ObjectHeader::Static {
            point_type,
            variation,
            values,
        });
    }
    missing
}

/// Select events for a response, limited by `count` and by the room left.
fn select_events<F>(
    store: &mut Store,
    owner: Owner,
    filter: F,
    count: Option<u8>,
    budget: &mut Budget,
) -> Vec<EventRecord>
where
    F: Fn(&EventRecord) -> bool,
{
    let mut remaining = count.map(usize::from);
    store.events.select(owner, filter, |record| {
        if remaining == Some(0) {
            return false;
        }
        let size = HEADER_OVERHEAD
            + 2
            + measurement_size(record.point_type, &record.measurement, true, true);
        if !budget.take(size) {
            return false;
        }
        if let Some(n) = remaining.as_mut() {
            *n -= 1;
        }
        true
    })
}

/// Group events into headers, one per run of equal type and variation.
fn event_headers(records: &[EventRecord], requested: EventVariation) -> Vec<ObjectHeader> {
    let mut headers: Vec<ObjectHeader> = Vec::new();
    for record in records {
        let variation = match (requested, record.variation) {
            (EventVariation::Any, EventVariation::Any) => EventVariation::WithTime,
            (EventVariation::Any, configured) => configured,
            (requested, _) => requested,
        };
        let value = (record.index, record.measurement.clone());
        match headers.last_mut() {
            Some(ObjectHeader::Events {
                point_type,
                variation: v,
                values,
            }) if *point_type == record.point_type && *v == variation => values.push(value),
            _ => headers.push(ObjectHeader::Events {
                point_type: record.point_type,
                variation,
                values: vec![value],
            }),
        }
    }
    headers
}

fn read_attributes(store: &Store, id: AttrId) -> Vec<crate::types::Attribute> {
    if id.variation == ALL_ATTRIBUTES {
        return store.attribute_set(id.set);
    }
    store
        .attribute(id)
        .map(|entry| crate::types::Attribute::new(id, entry.value.clone()))
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::outstation::database::{DatabaseConfig, PointConfig, UpdateOptions};
    use crate::outstation::traits::{ControlHandler, OutstationApplication};
    use crate::parser::parse_response;
    use crate::types::{CommandItem, Crob, Measurement, Timestamp, Value};

    const OUTSTATION: u16 = 1024;
    const MASTER: u16 = 1;

    #[derive(Clone, Default)]
    struct Recorder {
        times: Arc<Mutex<Vec<Timestamp>>>,
        operates: Arc<Mutex<Vec<(u16, OperateType)>>>,
    }

    impl OutstationApplication for Recorder {
        fn write_absolute_time(&mut self, time: Timestamp) {
            self.times.lock().push(time);
        }
    }

    impl ControlHandler for Recorder {
        fn select_crob(&mut self, _crob: &Crob, index: u16, _database: &Database) -> CommandStatus {
            if index < 10 {
                CommandStatus::Success
            } else {
                CommandStatus::NotSupported
            }
        }

        fn operate_crob(
            &mut self,
            _crob: &Crob,
            index: u16,
            op_type: OperateType,
            _database: &Database,
        ) -> CommandStatus {
            self.operates.lock().push((index, op_type));
            CommandStatus::Success
        }
    }

    fn session_with(config: OutstationConfig) -> (Session, Recorder) {
        let recorder = Recorder::default();
        let database = Arc::new(Database::new(DatabaseConfig::default()));
        database.transaction(|tx| {
            tx.add(PointType::BinaryInput, 0, PointConfig::new()).unwrap();
            tx.add(PointType::AnalogInput, 0, PointConfig::new()).unwrap();
        });
        let handlers = OutstationHandlers::default()
            .application(recorder.clone())
            .control(recorder.clone());
        (Session::new(config, database, handlers), recorder)
    }

    fn session() -> (Session, Recorder) {
        session_with(OutstationConfig::new(OUTSTATION, MASTER))
    }

    fn frame(request: &Request) -> LinkFrame {
        LinkFrame::user_data(OUTSTATION, MASTER, request.encode())
    }

    fn send(session: &mut Session, request: Request) -> Vec<Response> {
        session.handle_frame(frame(&request), Instant::now());
        responses(session)
    }

    fn responses(session: &mut Session) -> Vec<Response> {
        session
            .drain()
            .into_iter()
            .map(|f| parse_response(&f.payload).unwrap())
            .collect()
    }

    fn read(seq: u8, objects: Vec<ObjectHeader>) -> Request {
        Request::new(Sequence::new(seq), FunctionCode::Read, objects)
    }

    fn class1() -> ObjectHeader {
        ObjectHeader::EventClass {
            class: EventClass::Class1,
            count: None,
        }
    }

    fn crob(index: u16) -> ObjectHeader {
        ObjectHeader::Crob(vec![CommandItem::new(index, Crob::latch_on())])
    }

    fn crob_status(response: &Response) -> CommandStatus {
        match response.objects.as_slice() {
            [ObjectHeader::Crob(items)] => items[0].status,
            other => panic!("unexpected objects {:?}", other),
        }
    }

    fn add_binary_event(session: &Session, value: bool) {
        session.database().transaction(|tx| {
            tx.update(0, Measurement::new(Value::Binary(value)), UpdateOptions::detect())
                .unwrap();
        });
    }

    #[test]
    fn test_class0_read_reports_static_values() {
        let (mut session, _) = session();
        let responses = send(&mut session, read(0, vec![ObjectHeader::Class0]));

        assert_eq!(responses.len(), 1);
        let response = &responses[0];
        assert!(!response.control.con);
        assert!(response.iin.iin1.contains(Iin1::DEVICE_RESTART));
        let types: Vec<_> = response
            .objects
            .iter()
            .map(|h| match h {
                ObjectHeader::Static { point_type, .. } => *point_type,
                other => panic!("unexpected header {:?}", other),
            })
            .collect();
        assert_eq!(types, vec![PointType::BinaryInput, PointType::AnalogInput]);
    }

    #[test]
    fn test_missing_index_sets_parameter_error() {
        let (mut session, _) = session();
        let request = read(
            0,
            vec![ObjectHeader::StaticRange {
                point_type: PointType::BinaryInput,
                variation: StaticVariation::Any,
                range: IndexRange::Range { start: 0, stop: 3 },
            }],
        );
        let responses = send(&mut session, request);
        assert!(responses[0].iin.iin2.contains(Iin2::PARAMETER_ERROR));
        assert_eq!(responses[0].objects.len(), 1);
    }

    #[test]
    fn test_event_read_requests_confirm_and_confirm_removes_events() {
        let (mut session, _) = session();
        add_binary_event(&session, true);

        let responses = send(&mut session, read(3, vec![class1()]));
        let response = &responses[0];
        assert!(response.control.con);
        assert!(matches!(response.objects[0], ObjectHeader::Events { .. }));
        // written events no longer count as available
        assert!(!response.iin.iin1.contains(Iin1::CLASS_1_EVENTS));

        send(&mut session, Request::confirm(Sequence::new(3), false));
        assert_eq!(session.database().event_count(EventClass::Class1), 0);
        assert!(session.next_deadline().is_none());
    }

    #[test]
    fn test_duplicate_request_repeats_cached_response() {
        let (mut session, _) = session();
        add_binary_event(&session, true);

        let request = read(5, vec![class1()]);
        session.handle_frame(frame(&request), Instant::now());
        let first = session.drain();
        session.handle_frame(frame(&request), Instant::now());
        let second = session.drain();

        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
        assert_eq!(session.database().event_count(EventClass::Class1), 1);
    }

    #[test]
    fn test_new_request_abandons_confirm_wait() {
        let (mut session, _) = session();
        add_binary_event(&session, true);

        send(&mut session, read(0, vec![class1()]));
        let responses = send(&mut session, read(1, vec![class1()]));
        assert!(responses[0].control.con);
        assert_eq!(responses[0].objects.len(), 1);
    }

    #[test]
    fn test_queue_policy_defers_request_until_confirm() {
        let config = OutstationConfig::new(OUTSTATION, MASTER)
            .confirm_wait_policy(ConfirmWaitPolicy::Queue);
        let (mut session, _) = session_with(config);
        add_binary_event(&session, true);

        send(&mut session, read(0, vec![class1()]));
        assert!(send(&mut session, read(1, vec![ObjectHeader::Class0])).is_empty());

        let responses = send(&mut session, Request::confirm(Sequence::new(0), false));
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].control.seq, Sequence::new(1));
    }

    #[test]
    fn test_solicited_confirm_timeout_returns_events() {
        let (mut session, _) = session();
        add_binary_event(&session, true);

        send(&mut session, read(0, vec![class1()]));
        let deadline = session.next_deadline().unwrap();
        session.on_timeout(deadline);
        assert!(session.next_deadline().is_none());

        let responses = send(&mut session, read(1, vec![ObjectHeader::Class0]));
        assert!(responses[0].iin.iin1.contains(Iin1::CLASS_1_EVENTS));
    }

    #[test]
    fn test_solicited_confirm_deadline_follows_receive_time() {
        let (mut session, _) = session();
        add_binary_event(&session, true);

        let received = Instant::now() + Duration::from_secs(30);
        session.handle_frame(frame(&read(0, vec![class1()])), received);
        assert_eq!(
            session.next_deadline(),
            Some(received + session.config.solicited_confirm_timeout)
        );
    }

    #[test]
    fn test_queued_request_confirm_deadline_starts_at_release() {
        let config = OutstationConfig::new(OUTSTATION, MASTER)
            .confirm_wait_policy(ConfirmWaitPolicy::Queue);
        let (mut session, _) = session_with(config);
        add_binary_event(&session, true);

        let start = Instant::now();
        session.handle_frame(frame(&read(0, vec![class1()])), start);
        add_binary_event(&session, false);
        session.handle_frame(frame(&read(1, vec![class1()])), start);

        let released = start + Duration::from_secs(2);
        session.handle_frame(frame(&Request::confirm(Sequence::new(0), false)), released);
        let responses = responses(&mut session);
        assert_eq!(responses.len(), 2);
        assert!(responses[1].control.con);
        assert_eq!(
            session.next_deadline(),
            Some(released + session.config.solicited_confirm_timeout)
        );
    }

    struct DatabaseBackedIin {
        database: Arc<Database>,
    }

    impl OutstationApplication for DatabaseBackedIin {
        fn application_iin(&self) -> ApplicationIin {
            let need_time = self
                .database
                .static_view(PointType::BinaryInput, 0)
                .map_or(false, |m| m.value == Value::Binary(true));
            ApplicationIin {
                need_time,
                ..ApplicationIin::default()
            }
        }
    }

    #[test]
    fn test_application_iin_may_read_database() {
        let database = Arc::new(Database::new(DatabaseConfig::default()));
        database.transaction(|tx| {
            tx.add(PointType::BinaryInput, 0, PointConfig::new()).unwrap();
            tx.update(0, Measurement::new(Value::Binary(true)), UpdateOptions::no_event())
                .unwrap();
        });
        let handlers = OutstationHandlers::default().application(DatabaseBackedIin {
            database: database.clone(),
        });
        let mut session = Session::new(OutstationConfig::new(OUTSTATION, MASTER), database, handlers);

        let read_responses = send(&mut session, read(0, vec![ObjectHeader::Class0]));
        assert!(read_responses[0].iin.iin1.contains(Iin1::NEED_TIME));

        let payload = Bytes::from_static(&[0xC1, 0x70]);
        session.handle_frame(LinkFrame::user_data(OUTSTATION, MASTER, payload), Instant::now());
        let responses = responses(&mut session);
        assert!(responses[0].iin.iin1.contains(Iin1::NEED_TIME));
    }

    #[test]
    fn test_select_before_operate() {
        let (mut session, recorder) = session();

        let select = Request::new(Sequence::new(0), FunctionCode::Select, vec![crob(1)]);
        let responses = send(&mut session, select);
        assert_eq!(crob_status(&responses[0]), CommandStatus::Success);
        assert!(recorder.operates.lock().is_empty());

        let operate = Request::new(Sequence::new(1), FunctionCode::Operate, vec![crob(1)]);
        let responses = send(&mut session, operate);
        assert_eq!(crob_status(&responses[0]), CommandStatus::Success);
        assert_eq!(
            *recorder.operates.lock(),
            vec![(1, OperateType::SelectBeforeOperate)]
        );
    }

    #[test]
    fn test_operate_without_matching_select() {
        let (mut session, recorder) = session();

        let operate = Request::new(Sequence::new(1), FunctionCode::Operate, vec![crob(1)]);
        let responses = send(&mut session, operate);
        assert_eq!(crob_status(&responses[0]), CommandStatus::NoSelect);

        let select = Request::new(Sequence::new(2), FunctionCode::Select, vec![crob(1)]);
        send(&mut session, select);
        let operate = Request::new(Sequence::new(3), FunctionCode::Operate, vec![crob(2)]);
        let responses = send(&mut session, operate);
        assert_eq!(crob_status(&responses[0]), CommandStatus::NoSelect);
        assert!(recorder.operates.lock().is_empty());
    }

    #[test]
    fn test_operate_after_select_timeout() {
        let (mut session, recorder) = session();
        let start = Instant::now();

        let select = Request::new(Sequence::new(0), FunctionCode::Select, vec![crob(1)]);
        session.handle_frame(frame(&select), start);
        session.drain();

        let operate = Request::new(Sequence::new(1), FunctionCode::Operate, vec![crob(1)]);
        session.handle_frame(frame(&operate), start + Duration::from_secs(6));
        let responses = responses(&mut session);
        assert_eq!(crob_status(&responses[0]), CommandStatus::Timeout);
        assert!(recorder.operates.lock().is_empty());
    }

    #[test]
    fn test_failed_select_is_not_remembered() {
        let (mut session, recorder) = session();

        let select = Request::new(Sequence::new(0), FunctionCode::Select, vec![crob(20)]);
        let responses = send(&mut session, select);
        assert_eq!(crob_status(&responses[0]), CommandStatus::NotSupported);

        let operate = Request::new(Sequence::new(1), FunctionCode::Operate, vec![crob(20)]);
        let responses = send(&mut session, operate);
        assert_eq!(crob_status(&responses[0]), CommandStatus::NoSelect);
        assert!(recorder.operates.lock().is_empty());
    }

    #[test]
    fn test_too_many_controls() {
        let config = OutstationConfig::new(OUTSTATION, MASTER).max_controls_per_request(Some(1));
        let (mut session, recorder) = session_with(config);

        let items = vec![
            CommandItem::new(1, Crob::latch_on()),
            CommandItem::new(2, Crob::latch_on()),
        ];
        let request = Request::new(
            Sequence::new(0),
            FunctionCode::DirectOperate,
            vec![ObjectHeader::Crob(items)],
        );
        let responses = send(&mut session, request);
        match responses[0].objects.as_slice() {
            [ObjectHeader::Crob(items)] => assert!(items
                .iter()
                .all(|i| i.status == CommandStatus::TooManyObjects)),
            other => panic!("unexpected objects {:?}", other),
        }
        assert!(recorder.operates.lock().is_empty());
    }

    #[test]
    fn test_direct_operate_no_ack_sends_nothing() {
        let (mut session, recorder) = session();
        let request = Request::new(
            Sequence::new(0),
            FunctionCode::DirectOperateNoResponse,
            vec![crob(4)],
        );
        assert!(send(&mut session, request).is_empty());
        assert_eq!(
            *recorder.operates.lock(),
            vec![(4, OperateType::DirectOperateNoAck)]
        );
    }

    #[test]
    fn test_write_clears_restart_bit() {
        let (mut session, _) = session();
        let request = Request::new(
            Sequence::new(0),
            FunctionCode::Write,
            vec![ObjectHeader::Iin {
                index: IIN_RESTART_INDEX,
                value: false,
            }],
        );
        let responses = send(&mut session, request);
        assert!(!responses[0].iin.iin1.contains(Iin1::DEVICE_RESTART));
        assert!(responses[0].iin.iin2.is_empty());
    }

    #[test]
    fn test_unknown_function_sets_iin2() {
        let (mut session, _) = session();
        let payload = Bytes::from_static(&[0xC4, 0x70]);
        session.handle_frame(LinkFrame::user_data(OUTSTATION, MASTER, payload), Instant::now());

        let responses = responses(&mut session);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].control.seq, Sequence::new(4));
        assert!(responses[0].iin.iin2.contains(Iin2::NO_FUNC_CODE_SUPPORT));
    }

    #[test]
    fn test_partial_trailing_header_sets_parameter_error() {
        let (mut session, _) = session();
        let payload = Bytes::from_static(&[0xC5, 0x01, 60, 1, 0x06, 60]);
        session.handle_frame(LinkFrame::user_data(OUTSTATION, MASTER, payload), Instant::now());

        let responses = responses(&mut session);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].control.seq, Sequence::new(5));
        assert!(responses[0].iin.iin2.contains(Iin2::PARAMETER_ERROR));
        assert!(responses[0].objects.is_empty());
    }

    #[test]
    fn test_broadcast_processed_without_response() {
        let (mut session, recorder) = session();
        let request = Request::new(Sequence::new(0), FunctionCode::DirectOperate, vec![crob(1)]);
        let broadcast = LinkFrame::user_data(0xFFFF, MASTER, request.encode());
        session.handle_frame(broadcast, Instant::now());

        assert!(session.drain().is_empty());
        assert_eq!(recorder.operates.lock().len(), 1);

        let responses = send(&mut session, read(1, vec![ObjectHeader::Class0]));
        assert!(responses[0].iin.iin1.contains(Iin1::BROADCAST));
        let responses = send(&mut session, read(2, vec![ObjectHeader::Class0]));
        assert!(!responses[0].iin.iin1.contains(Iin1::BROADCAST));
    }

    #[test]
    fn test_link_status_and_address_filtering() {
        let (mut session, _) = session();

        session.handle_frame(LinkFrame::request_link_status(OUTSTATION, MASTER), Instant::now());
        let frames = session.drain();
        assert_eq!(frames, vec![LinkFrame::link_status(MASTER, OUTSTATION)]);

        let request = read(0, vec![ObjectHeader::Class0]);
        session.handle_frame(LinkFrame::user_data(77, MASTER, request.encode()), Instant::now());
        session.handle_frame(LinkFrame::user_data(OUTSTATION, 9, request.encode()), Instant::now());
        assert!(session.drain().is_empty());
    }

    #[test]
    fn test_record_current_time_then_write_last_recorded_time() {
        let (mut session, recorder) = session();
        let start = Instant::now();

        let record = Request::new(Sequence::new(0), FunctionCode::RecordCurrentTime, Vec::new());
        session.handle_frame(frame(&record), start);
        session.drain();

        let write = Request::new(
            Sequence::new(1),
            FunctionCode::Write,
            vec![ObjectHeader::LastRecordedTime(Timestamp::new(5_000))],
        );
        let responses = send(&mut session, write);
        assert!(responses[0].iin.iin2.is_empty());

        let times = recorder.times.lock();
        assert_eq!(times.len(), 1);
        assert!(times[0].raw() >= 5_000);
    }

    #[test]
    fn test_last_recorded_time_without_record_is_rejected() {
        let (mut session, recorder) = session();
        let write = Request::new(
            Sequence::new(0),
            FunctionCode::Write,
            vec![ObjectHeader::LastRecordedTime(Timestamp::new(5_000))],
        );
        let responses = send(&mut session, write);
        assert!(responses[0].iin.iin2.contains(Iin2::PARAMETER_ERROR));
        assert!(recorder.times.lock().is_empty());
    }

    #[test]
    fn test_restart_not_supported_by_default() {
        let (mut session, _) = session();
        let request = Request::new(Sequence::new(0), FunctionCode::ColdRestart, Vec::new());
        let responses = send(&mut session, request);
        assert!(responses[0].iin.iin2.contains(Iin2::NO_FUNC_CODE_SUPPORT));
    }

    #[test]
    fn test_null_unsolicited_then_event_report() {
        let (mut session, _) = session();
        let now = Instant::now();

        session.poll_unsolicited(now);
        let null = responses(&mut session);
        assert_eq!(null.len(), 1);
        assert!(null[0].is_unsolicited());
        assert!(null[0].objects.is_empty());
        let null_seq = null[0].control.seq;

        send(&mut session, Request::confirm(null_seq, true));
        let enable = Request::new(
            Sequence::new(0),
            FunctionCode::EnableUnsolicited,
            vec![class1()],
        );
        send(&mut session, enable);

        add_binary_event(&session, true);
        session.poll_unsolicited(now);
        let report = responses(&mut session);
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].control.seq, null_seq.next());
        assert!(matches!(report[0].objects[0], ObjectHeader::Events { .. }));

        send(&mut session, Request::confirm(report[0].control.seq, true));
        assert_eq!(session.database().event_count(EventClass::Class1), 0);
    }

    #[test]
    fn test_unsolicited_retries_then_backs_off() {
        let config = OutstationConfig::new(OUTSTATION, MASTER)
            .max_unsolicited_retries(Some(1))
            .unsolicited_retry_delay(Duration::from_secs(30));
        let (mut session, _) = session_with(config);
        let now = Instant::now();

        session.poll_unsolicited(now);
        let first = session.drain();

        let deadline = session.next_deadline().unwrap();
        session.on_timeout(deadline);
        let retry = session.drain();
        assert_eq!(first, retry);

        let deadline = session.next_deadline().unwrap();
        session.on_timeout(deadline);
        assert!(session.drain().is_empty());
        assert_eq!(
            session.next_deadline(),
            Some(deadline + Duration::from_secs(30))
        );

        session.poll_unsolicited(deadline);
        assert!(session.drain().is_empty());

        session.on_timeout(deadline + Duration::from_secs(30));
        session.poll_unsolicited(deadline + Duration::from_secs(30));
        let next = responses(&mut session);
        assert_eq!(next.len(), 1);
        assert_eq!(
            next[0].control.seq,
            parse_response(&first[0].payload).unwrap().control.seq.next()
        );
    }

    #[test]
    fn test_enable_unsolicited_rejected_when_not_allowed() {
        let config = OutstationConfig::new(OUTSTATION, MASTER).allow_unsolicited(false);
        let (mut session, _) = session_with(config);
        let enable = Request::new(
            Sequence::new(0),
            FunctionCode::EnableUnsolicited,
            vec![class1()],
        );
        let responses = send(&mut session, enable);
        assert!(responses[0].iin.iin2.contains(Iin2::NO_FUNC_CODE_SUPPORT));

        session.poll_unsolicited(Instant::now());
        assert!(session.drain().is_empty());
    }
}
