//! Master and outstation running against each other over in-memory transports.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use voltage_dnp3::master::{
    spawn_master, AssociationConfig, AssociationHandle, AssociationHandlers, AssociationState,
    HeaderInfo, MasterChannel, MasterChannelConfig, ReadHandler, ReadRequest, ReadType,
    TimeSyncMode,
};
use voltage_dnp3::outstation::database::{PointConfig, UpdateOptions};
use voltage_dnp3::outstation::{
    spawn_outstation, ControlHandler, Database, FileHandler, OutstationConfig, OutstationHandle,
    OutstationHandlers,
};
use voltage_dnp3::{
    parse_request, CommandError, CommandHeaders, CommandMode, CommandStatus, Crob, EventClass,
    FileError, FileInfo, FileMode, FileOpen, FileStatus, FixedClock, FunctionCode, Iin, LinkFrame,
    Measurement, MemoryTransport, NullListener, ObjectHeader, OperateType, PointType, Request,
    Response, RetryStrategy, Sequence, TaskError, Time, Timestamp, Transport, Value,
};

const OUTSTATION: u16 = 1024;
const MASTER: u16 = 1;
const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct Batch {
    read_type: ReadType,
    info: HeaderInfo,
    values: Vec<(u16, Measurement)>,
}

struct Collect(mpsc::UnboundedSender<Batch>);

impl ReadHandler for Collect {
    fn handle_points(&mut self, info: HeaderInfo, values: &[(u16, Measurement)]) {
        let _ = self.0.send(Batch {
            read_type: ReadType::SinglePoll,
            info,
            values: values.to_vec(),
        });
    }
}

/// Tags every batch with the read type of its fragment.
struct Tagged {
    sink: mpsc::UnboundedSender<Batch>,
    current: ReadType,
}

impl ReadHandler for Tagged {
    fn begin_fragment(&mut self, read_type: ReadType, _iin: Iin) {
        self.current = read_type;
    }

    fn handle_points(&mut self, info: HeaderInfo, values: &[(u16, Measurement)]) {
        let _ = self.sink.send(Batch {
            read_type: self.current,
            info,
            values: values.to_vec(),
        });
    }
}

struct AcceptAll;

impl ControlHandler for AcceptAll {
    fn select_crob(&mut self, _crob: &Crob, _index: u16, _database: &Database) -> CommandStatus {
        CommandStatus::Success
    }

    fn operate_crob(
        &mut self,
        crob: &Crob,
        index: u16,
        _op_type: OperateType,
        database: &Database,
    ) -> CommandStatus {
        let on = *crob == Crob::latch_on();
        let _ = database.transaction(|tx| {
            tx.update(
                index,
                Measurement::new(Value::BinaryOutputStatus(on)),
                UpdateOptions::detect(),
            )
        });
        CommandStatus::Success
    }
}

#[derive(Default)]
struct FileState {
    files: HashMap<String, Vec<u8>>,
    open: HashMap<u32, String>,
    next_handle: u32,
    read_blocks: Vec<u32>,
    written_blocks: Vec<(u32, bool)>,
}

/// In-memory file system that records the blocks it serves.
#[derive(Clone, Default)]
struct MemoryFiles(Arc<Mutex<FileState>>);

impl FileHandler for MemoryFiles {
    fn open(&mut self, request: &FileOpen) -> Result<FileInfo, FileStatus> {
        let mut state = self.0.lock();
        let size = match request.mode {
            FileMode::Read => state
                .files
                .get(&request.name)
                .map(|data| data.len() as u32)
                .ok_or(FileStatus::NotFound)?,
            FileMode::Write => {
                state.files.insert(request.name.clone(), Vec::new());
                0
            }
            FileMode::Append => return Err(FileStatus::InvalidMode),
        };
        state.next_handle += 1;
        let handle = state.next_handle;
        state.open.insert(handle, request.name.clone());
        Ok(FileInfo {
            handle,
            size,
            max_block_size: request.max_block_size,
        })
    }

    fn read_block(&mut self, handle: u32, block: u32, max_size: u16) -> Result<(Bytes, bool), FileStatus> {
        let mut state = self.0.lock();
        state.read_blocks.push(block);
        let name = state.open.get(&handle).ok_or(FileStatus::InvalidHandle)?;
        let data = &state.files[name];
        let start = (block as usize * max_size as usize).min(data.len());
        let end = (start + max_size as usize).min(data.len());
        Ok((Bytes::copy_from_slice(&data[start..end]), end == data.len()))
    }

    fn write_block(&mut self, handle: u32, block: u32, last: bool, data: &[u8]) -> FileStatus {
        let mut state = self.0.lock();
        state.written_blocks.push((block, last));
        let Some(name) = state.open.get(&handle).cloned() else {
            return FileStatus::InvalidHandle;
        };
        state.files.entry(name).or_default().extend_from_slice(data);
        FileStatus::Success
    }

    fn close(&mut self, handle: u32) -> FileStatus {
        match self.0.lock().open.remove(&handle) {
            Some(_) => FileStatus::Success,
            None => FileStatus::InvalidHandle,
        }
    }
}

struct System {
    outstation: OutstationHandle,
    channel: MasterChannel,
    association: AssociationHandle,
    batches: mpsc::UnboundedReceiver<Batch>,
    states: mpsc::UnboundedReceiver<AssociationState>,
}

async fn system(config: AssociationConfig, handlers: OutstationHandlers) -> System {
    let outstation = spawn_outstation(OutstationConfig::new(OUTSTATION, MASTER), handlers).unwrap();
    outstation
        .transaction(|tx| {
            for index in 0..3 {
                tx.add(PointType::BinaryInput, index, PointConfig::new())?;
                tx.add(PointType::BinaryOutputStatus, index, PointConfig::new())?;
            }
            tx.add(PointType::AnalogInput, 0, PointConfig::new().deadband(1.0))
        })
        .unwrap();

    let (local, remote) = MemoryTransport::pair();
    outstation.attach(local).await.unwrap();

    let (batch_tx, batches) = mpsc::unbounded_channel();
    let (state_tx, states) = mpsc::unbounded_channel();
    let channel = spawn_master(MasterChannelConfig::new(MASTER), remote, NullListener);
    let association = channel
        .add_association(
            OUTSTATION,
            config,
            AssociationHandlers::default()
                .read(Tagged {
                    sink: batch_tx,
                    current: ReadType::SinglePoll,
                })
                .listener(move |state: AssociationState| {
                    let _ = state_tx.send(state);
                }),
        )
        .await
        .unwrap();
    channel.enable().await.unwrap();

    System {
        outstation,
        channel,
        association,
        batches,
        states,
    }
}

async fn wait_ready(states: &mut mpsc::UnboundedReceiver<AssociationState>) {
    timeout(WAIT, async {
        while let Some(state) = states.recv().await {
            if state == AssociationState::Ready {
                return;
            }
        }
        panic!("state listener closed");
    })
    .await
    .unwrap();
}

async fn next_batch(batches: &mut mpsc::UnboundedReceiver<Batch>, f: impl Fn(&Batch) -> bool) -> Batch {
    timeout(WAIT, async {
        loop {
            let batch = batches.recv().await.unwrap();
            if f(&batch) {
                return batch;
            }
        }
    })
    .await
    .unwrap()
}

/// Ready association wired to a bare transport end that the test drives by
/// hand.
async fn raw_association(
    config: AssociationConfig,
    handlers: AssociationHandlers,
) -> (MasterChannel, AssociationHandle, MemoryTransport) {
    let (local, remote) = MemoryTransport::pair();
    let (state_tx, mut states) = mpsc::unbounded_channel();
    let handlers = handlers.listener(move |state: AssociationState| {
        let _ = state_tx.send(state);
    });
    let channel = spawn_master(MasterChannelConfig::new(MASTER), local, NullListener);
    let association = channel
        .add_association(OUTSTATION, config, handlers)
        .await
        .unwrap();
    channel.enable().await.unwrap();
    wait_ready(&mut states).await;
    (channel, association, remote)
}

async fn recv_request(remote: &mut MemoryTransport) -> Request {
    let frame = timeout(WAIT, remote.recv_frame()).await.unwrap().unwrap();
    assert_eq!(frame.destination, OUTSTATION);
    parse_request(&frame.payload).unwrap()
}

async fn reply(remote: &mut MemoryTransport, request: &Request, objects: Vec<ObjectHeader>) {
    let response = Response::solicited(request.control.seq, false, Iin::default(), objects);
    remote
        .send_frame(LinkFrame::user_data(MASTER, OUTSTATION, response.encode()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_startup_integrity_poll_reports_static_values() {
    let mut sys = system(AssociationConfig::default(), OutstationHandlers::default()).await;

    let batch = next_batch(&mut sys.batches, |b| {
        b.read_type == ReadType::StartupIntegrity
            && !b.info.is_event
            && b.info.point_type == PointType::BinaryInput
    })
    .await;
    assert_eq!(batch.values.len(), 3);
    assert_eq!(batch.values[0].0, 0);

    wait_ready(&mut sys.states).await;
    sys.channel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unsolicited_events_reach_read_handler() {
    let mut sys = system(AssociationConfig::default(), OutstationHandlers::default()).await;
    wait_ready(&mut sys.states).await;

    sys.outstation
        .transaction(|tx| {
            tx.update(
                1,
                Measurement::new(Value::Binary(true)),
                UpdateOptions::detect(),
            )
        })
        .unwrap();

    let batch = next_batch(&mut sys.batches, |b| {
        b.read_type == ReadType::Unsolicited && b.info.is_event
    })
    .await;
    assert_eq!(batch.info.point_type, PointType::BinaryInput);
    assert_eq!(batch.values[0].0, 1);
    assert_eq!(batch.values[0].1.value, Value::Binary(true));
}

#[tokio::test]
async fn test_select_before_operate_end_to_end() {
    let handlers = OutstationHandlers::default().control(AcceptAll);
    let mut sys = system(AssociationConfig::quiet(), handlers).await;
    wait_ready(&mut sys.states).await;

    let headers = CommandHeaders::new().add_crob(2, Crob::latch_on());
    sys.association
        .operate(CommandMode::SelectBeforeOperate, headers)
        .await
        .unwrap();

    let status = sys
        .outstation
        .database()
        .static_view(PointType::BinaryOutputStatus, 2)
        .unwrap();
    assert_eq!(status.value, Value::BinaryOutputStatus(true));
}

#[tokio::test]
async fn test_direct_operate_rejected_by_default_handler() {
    let mut sys = system(AssociationConfig::quiet(), OutstationHandlers::default()).await;
    wait_ready(&mut sys.states).await;

    let headers = CommandHeaders::new().add_crob(0, Crob::pulse_on(100));
    let result = sys
        .association
        .operate(CommandMode::DirectOperate, headers)
        .await;
    assert_eq!(
        result,
        Err(CommandError::OperateFailed(CommandStatus::NotSupported))
    );
}

#[tokio::test]
async fn test_link_status_check_and_single_read() {
    let mut sys = system(AssociationConfig::quiet(), OutstationHandlers::default()).await;
    wait_ready(&mut sys.states).await;

    sys.association.check_link_status().await.unwrap();

    sys.outstation
        .transaction(|tx| {
            tx.update(
                0,
                Measurement::new(Value::Analog(42.5)),
                UpdateOptions::detect(),
            )
        })
        .unwrap();
    sys.association
        .read(ReadRequest::static_range(PointType::AnalogInput, 0, 0))
        .await
        .unwrap();
    let batch = next_batch(&mut sys.batches, |b| {
        b.read_type == ReadType::SinglePoll && b.info.point_type == PointType::AnalogInput
    })
    .await;
    assert_eq!(batch.values[0].1.value, Value::Analog(42.5));
}

#[tokio::test]
async fn test_demanded_poll_runs_before_its_period() {
    let mut sys = system(AssociationConfig::quiet(), OutstationHandlers::default()).await;
    wait_ready(&mut sys.states).await;

    let poll = sys
        .association
        .add_poll(
            ReadRequest::all_objects(PointType::BinaryInput),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
    poll.demand().await.unwrap();

    let batch = next_batch(&mut sys.batches, |b| b.read_type == ReadType::PeriodicPoll).await;
    assert_eq!(batch.info.point_type, PointType::BinaryInput);
    poll.remove().await.unwrap();
}

#[tokio::test]
async fn test_zero_poll_period_rejected() {
    let (_channel, association, _remote) =
        raw_association(AssociationConfig::quiet(), AssociationHandlers::default()).await;
    let result = association
        .add_poll(ReadRequest::integrity(), Duration::ZERO)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_duplicate_request_gets_cached_response() {
    let outstation = spawn_outstation(
        OutstationConfig::new(OUTSTATION, MASTER),
        OutstationHandlers::default(),
    )
    .unwrap();
    outstation
        .transaction(|tx| tx.add(PointType::AnalogInput, 0, PointConfig::new()))
        .unwrap();
    let (local, mut remote) = MemoryTransport::pair();
    outstation.attach(local).await.unwrap();

    // null unsolicited response after attach
    let null = remote.recv_frame().await.unwrap();
    let unsolicited = voltage_dnp3::parse_response(&null.payload).unwrap();
    assert!(unsolicited.is_unsolicited());
    assert!(unsolicited.objects.is_empty());

    let request = Request::new(
        Sequence::new(5),
        FunctionCode::Read,
        vec![ObjectHeader::Class0],
    );
    let frame = LinkFrame::user_data(OUTSTATION, MASTER, request.encode());

    remote.send_frame(frame.clone()).await.unwrap();
    let first = remote.recv_frame().await.unwrap();

    outstation
        .transaction(|tx| {
            tx.update(
                0,
                Measurement::new(Value::Analog(7.0)),
                UpdateOptions::no_event(),
            )
        })
        .unwrap();

    remote.send_frame(frame).await.unwrap();
    let second = remote.recv_frame().await.unwrap();
    assert_eq!(first.payload, second.payload);
}

#[tokio::test(start_paused = true)]
async fn test_read_on_disabled_association_fails_without_traffic() {
    let (_channel, association, mut remote) =
        raw_association(AssociationConfig::quiet(), AssociationHandlers::default()).await;

    association.disable().await.unwrap();
    let result = association.read(ReadRequest::integrity()).await;
    assert_eq!(result, Err(TaskError::AssociationDisabled));

    let traffic = timeout(Duration::from_secs(1), remote.recv_frame()).await;
    assert!(traffic.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_disable_fails_every_queued_request() {
    let (_channel, association, mut remote) =
        raw_association(AssociationConfig::quiet(), AssociationHandlers::default()).await;

    let mut pending = Vec::new();
    for _ in 0..3 {
        let association = association.clone();
        pending.push(tokio::spawn(async move {
            association.read(ReadRequest::integrity()).await
        }));
    }

    // the first read is in flight and never answered
    let first = recv_request(&mut remote).await;
    assert_eq!(first.function, FunctionCode::Read);
    tokio::time::sleep(Duration::from_millis(10)).await;

    association.disable().await.unwrap();
    for task in pending {
        assert_eq!(task.await.unwrap(), Err(TaskError::Shutdown));
    }

    let traffic = timeout(Duration::from_secs(1), remote.recv_frame()).await;
    assert!(traffic.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_failed_select_never_sends_operate() {
    let (_channel, association, mut remote) =
        raw_association(AssociationConfig::quiet(), AssociationHandlers::default()).await;

    let task = tokio::spawn(async move {
        let headers = CommandHeaders::new().add_crob(4, Crob::latch_off());
        association
            .operate(CommandMode::SelectBeforeOperate, headers)
            .await
    });

    let select = recv_request(&mut remote).await;
    assert_eq!(select.function, FunctionCode::Select);
    let echo = match &select.objects[0] {
        ObjectHeader::Crob(items) => ObjectHeader::Crob(
            items
                .iter()
                .map(|item| item.with_status(CommandStatus::Blocked))
                .collect(),
        ),
        other => panic!("unexpected header {:?}", other),
    };
    reply(&mut remote, &select, vec![echo]).await;

    assert_eq!(
        task.await.unwrap(),
        Err(CommandError::SelectFailed(CommandStatus::Blocked))
    );
    let traffic = timeout(Duration::from_secs(1), remote.recv_frame()).await;
    assert!(traffic.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_non_lan_time_sync_writes_compensated_time_once() {
    let base = Timestamp::new(1_700_000_000_000);
    let clock = Arc::new(FixedClock::new(Time::synchronized(base)));
    let handlers = AssociationHandlers::default().clock(clock);
    let (_channel, association, mut remote) =
        raw_association(AssociationConfig::quiet(), handlers).await;

    let task = tokio::spawn(async move { association.synchronize_time(TimeSyncMode::NonLan).await });

    let measure = recv_request(&mut remote).await;
    assert_eq!(measure.function, FunctionCode::DelayMeasure);
    tokio::time::sleep(Duration::from_millis(100)).await;
    reply(&mut remote, &measure, vec![ObjectHeader::TimeDelayFine(20)]).await;

    let write = recv_request(&mut remote).await;
    assert_eq!(write.function, FunctionCode::Write);
    let written = match write.objects.as_slice() {
        [ObjectHeader::Time(time)] => *time,
        other => panic!("unexpected objects {:?}", other),
    };
    // (round trip - outstation delay) / 2 = (100 - 20) / 2
    let offset = written.raw() - base.raw();
    assert!((35..=45).contains(&offset), "offset {}", offset);
    reply(&mut remote, &write, Vec::new()).await;

    assert_eq!(task.await.unwrap(), Ok(()));
    let traffic = timeout(Duration::from_secs(1), remote.recv_frame()).await;
    assert!(traffic.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_response_timeout_without_retry_fails() {
    let config = AssociationConfig::quiet()
        .response_timeout(Duration::from_secs(1))
        .task_retry(voltage_dnp3::RetryStrategy::none());
    let (_channel, association, mut remote) =
        raw_association(config, AssociationHandlers::default()).await;

    let task = tokio::spawn(async move { association.cold_restart().await });
    let request = recv_request(&mut remote).await;
    assert_eq!(request.function, FunctionCode::ColdRestart);

    assert_eq!(task.await.unwrap(), Err(TaskError::ResponseTimeout));
}

#[tokio::test]
async fn test_collect_handler_sees_single_poll() {
    let (batch_tx, mut batches) = mpsc::unbounded_channel();
    let (_channel, association, mut remote) = raw_association(
        AssociationConfig::quiet(),
        AssociationHandlers::default().read(Collect(batch_tx)),
    )
    .await;

    let task = tokio::spawn(async move {
        association
            .read(ReadRequest::static_range(PointType::Counter, 0, 1))
            .await
    });
    let read = recv_request(&mut remote).await;
    let values = vec![
        (0, Measurement::new(Value::Counter(10))),
        (1, Measurement::new(Value::Counter(11))),
    ];
    reply(
        &mut remote,
        &read,
        vec![ObjectHeader::Static {
            point_type: PointType::Counter,
            variation: voltage_dnp3::StaticVariation::WithFlags,
            values: values.clone(),
        }],
    )
    .await;

    assert_eq!(task.await.unwrap(), Ok(()));
    let batch = batches.recv().await.unwrap();
    assert_eq!(batch.info.point_type, PointType::Counter);
    assert_eq!(batch.values, values);
}

#[tokio::test]
async fn test_file_write_then_read_back() {
    let files = MemoryFiles::default();
    let handlers = OutstationHandlers::default().file(files.clone());
    let mut sys = system(AssociationConfig::quiet(), handlers).await;
    wait_ready(&mut sys.states).await;

    let info = sys
        .association
        .open_file("/data/log.txt", FileMode::Write, 10, 4)
        .await
        .unwrap();
    assert_eq!(info.max_block_size, 4);
    sys.association
        .write_file(info.handle, b"0123456789".to_vec(), info.max_block_size)
        .await
        .unwrap();
    sys.association.close_file(info.handle).await.unwrap();
    assert_eq!(
        files.0.lock().written_blocks,
        vec![(0, false), (1, false), (2, true)]
    );

    let info = sys
        .association
        .open_file("/data/log.txt", FileMode::Read, 0, 4)
        .await
        .unwrap();
    assert_eq!(info.size, 10);
    let data = sys.association.read_file(info.handle).await.unwrap();
    assert_eq!(&data[..], b"0123456789");
    assert_eq!(files.0.lock().read_blocks, vec![0, 1, 2]);
    sys.association.close_file(info.handle).await.unwrap();
}

#[tokio::test]
async fn test_file_failures_map_to_file_status() {
    let handlers = OutstationHandlers::default().file(MemoryFiles::default());
    let mut sys = system(AssociationConfig::quiet(), handlers).await;
    wait_ready(&mut sys.states).await;

    let result = sys
        .association
        .open_file("/missing", FileMode::Read, 0, 64)
        .await;
    assert_eq!(result, Err(FileError::Status(FileStatus::NotFound)));

    let result = sys.association.read_file(99).await;
    assert_eq!(result, Err(FileError::Status(FileStatus::InvalidHandle)));

    let result = sys.association.close_file(99).await;
    assert_eq!(result, Err(FileError::Status(FileStatus::InvalidHandle)));
}

#[tokio::test]
async fn test_file_transfer_unsupported_by_default() {
    let mut sys = system(AssociationConfig::quiet(), OutstationHandlers::default()).await;
    wait_ready(&mut sys.states).await;

    let result = sys
        .association
        .open_file("/data/log.txt", FileMode::Read, 0, 64)
        .await;
    assert_eq!(result, Err(FileError::Status(FileStatus::NotSupported)));
}

#[tokio::test(start_paused = true)]
async fn test_lan_time_sync_writes_recorded_time() {
    let base = Timestamp::new(1_700_000_000_000);
    let clock = Arc::new(FixedClock::new(Time::synchronized(base)));
    let handlers = AssociationHandlers::default().clock(clock.clone());
    let (_channel, association, mut remote) =
        raw_association(AssociationConfig::quiet(), handlers).await;

    let task = tokio::spawn(async move { association.synchronize_time(TimeSyncMode::Lan).await });

    let record = recv_request(&mut remote).await;
    assert_eq!(record.function, FunctionCode::RecordCurrentTime);
    assert!(record.objects.is_empty());
    clock.advance(500);
    reply(&mut remote, &record, Vec::new()).await;

    let write = recv_request(&mut remote).await;
    assert_eq!(write.function, FunctionCode::Write);
    assert_eq!(write.objects, vec![ObjectHeader::LastRecordedTime(base)]);
    reply(&mut remote, &write, Vec::new()).await;

    assert_eq!(task.await.unwrap(), Ok(()));
    let traffic = timeout(Duration::from_secs(1), remote.recv_frame()).await;
    assert!(traffic.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_fails_running_and_queued_requests() {
    let config = AssociationConfig::quiet().response_timeout(Duration::from_secs(60));
    let (_channel, association, mut remote) =
        raw_association(config, AssociationHandlers::default()).await;

    let mut pending = Vec::new();
    for _ in 0..3 {
        let association = association.clone();
        pending.push(tokio::spawn(async move {
            association.read(ReadRequest::integrity()).await
        }));
    }
    let first = recv_request(&mut remote).await;
    assert_eq!(first.function, FunctionCode::Read);
    tokio::time::sleep(Duration::from_millis(10)).await;

    drop(remote);
    for task in pending {
        let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(result, Err(TaskError::NoConnection));
    }
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_request_is_retried_after_backoff() {
    let config = AssociationConfig::quiet()
        .response_timeout(Duration::from_secs(1))
        .task_retry(
            RetryStrategy::default()
                .initial_delay(Duration::from_secs(2))
                .max_attempts(Some(3)),
        );
    let (_channel, association, mut remote) =
        raw_association(config, AssociationHandlers::default()).await;

    let task = tokio::spawn(async move { association.read(ReadRequest::integrity()).await });

    let first = recv_request(&mut remote).await;
    let sent = Instant::now();
    let second = recv_request(&mut remote).await;
    // response timeout plus the first backoff delay
    assert!(sent.elapsed() >= Duration::from_secs(3));
    assert_eq!(second.function, FunctionCode::Read);
    assert_eq!(second.objects, first.objects);
    assert_ne!(second.control.seq, first.control.seq);

    reply(&mut remote, &second, Vec::new()).await;
    assert_eq!(task.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_reports_timeout() {
    let config = AssociationConfig::quiet()
        .response_timeout(Duration::from_secs(1))
        .task_retry(
            RetryStrategy::default()
                .initial_delay(Duration::from_secs(2))
                .max_attempts(Some(2)),
        );
    let (_channel, association, mut remote) =
        raw_association(config, AssociationHandlers::default()).await;

    let task = tokio::spawn(async move { association.warm_restart().await });

    for _ in 0..2 {
        let request = recv_request(&mut remote).await;
        assert_eq!(request.function, FunctionCode::WarmRestart);
    }
    assert_eq!(task.await.unwrap(), Err(TaskError::ResponseTimeout));

    let traffic = timeout(Duration::from_secs(10), remote.recv_frame()).await;
    assert!(traffic.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_direct_operate_is_not_repeated() {
    let config = AssociationConfig::quiet()
        .response_timeout(Duration::from_secs(1))
        .task_retry(RetryStrategy::default().max_attempts(Some(3)));
    let (_channel, association, mut remote) =
        raw_association(config, AssociationHandlers::default()).await;

    let task = tokio::spawn(async move {
        let headers = CommandHeaders::new().add_crob(1, Crob::latch_on());
        association.operate(CommandMode::DirectOperate, headers).await
    });

    let operate = recv_request(&mut remote).await;
    assert_eq!(operate.function, FunctionCode::DirectOperate);
    assert_eq!(
        task.await.unwrap(),
        Err(CommandError::OperateUnconfirmed(TaskError::ResponseTimeout))
    );

    let traffic = timeout(Duration::from_secs(10), remote.recv_frame()).await;
    assert!(traffic.is_err());
}

#[tokio::test]
async fn test_counter_deadband_compares_with_stored_value() {
    let mut sys = system(AssociationConfig::quiet(), OutstationHandlers::default()).await;
    wait_ready(&mut sys.states).await;

    let created = sys
        .outstation
        .transaction(|tx| {
            tx.add(PointType::Counter, 0, PointConfig::new().deadband(5.0))?;
            [100, 103, 106, 112]
                .into_iter()
                .map(|count| {
                    tx.update(
                        0,
                        Measurement::new(Value::Counter(count)),
                        UpdateOptions::detect(),
                    )
                })
                .collect::<voltage_dnp3::Result<Vec<bool>>>()
        })
        .unwrap();
    // the first update clears RESTART, then only the 106 -> 112 step
    // exceeds the deadband
    assert_eq!(created, vec![true, false, false, true]);
    let stored = sys
        .outstation
        .database()
        .static_view(PointType::Counter, 0)
        .unwrap();
    assert_eq!(stored.value, Value::Counter(112));

    sys.association
        .read(ReadRequest::event_class(EventClass::Class1, None))
        .await
        .unwrap();
    let batch = next_batch(&mut sys.batches, |b| {
        b.info.is_event && b.info.point_type == PointType::Counter
    })
    .await;
    let counts: Vec<_> = batch.values.iter().map(|(_, m)| m.value.clone()).collect();
    assert_eq!(counts, vec![Value::Counter(100), Value::Counter(112)]);
}
