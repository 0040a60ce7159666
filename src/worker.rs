// worker module: the per-connection state machine. One OS thread per worker;
// control events arrive on a mailbox and are polled at every suspension point
// (between command/response pairs, between data chunks).
mod connect;
mod download;
mod explore;
mod simple;
mod upload;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::EngineError;
use crate::cache::{CacheEvent, UploadListingCache};
use crate::disk::DiskIo;
use crate::error::ProblemKind;
use crate::ftp::control::ControlConnection;
use crate::ftp::data::{DataConnState, DataTimeouts, PendingData};
use crate::ftp::listing::ParseListing;
use crate::ftp::reply::Reply;
use crate::item::{Item, ItemId, ItemKind, ItemState};
use crate::opened_files::OpenedFiles;
use crate::operation::Operation;
use crate::operations_list::OperationsList;

/// High-level worker state for the host's connections listview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    LookingForWork,
    Sleeping,
    Preparing,
    Connecting,
    WaitingForReconnect,
    /// Stuck until the user supplies new login parameters.
    ConnectionError,
    Working,
    Stopped,
}

/// Finer-grained phase inside the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSubState {
    None,
    ResolvingAddress,
    WaitingForGreeting,
    RunningLoginScript,
    RunningInitCommands,
    QueryingSystem,
    PreparingItem,
    WaitingForDisk,
    WaitingForListing,
    OpeningDataConnection,
    TransferringData,
    DeletingSource,
    FinishingItem,
}

/// Command-pipeline state; commands are strictly serial per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Idle,
    WaitForCmdReply,
    WaitForLoginPrompt,
    WaitForCmdError,
}

/// Control events delivered through the worker mailbox. Socket and disk
/// completions of the original event set are synchronous call returns in this
/// design; the mailbox carries what can arrive from outside at any time.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Activate,
    ShouldStop,
    ShouldPause,
    ShouldResume,
    WakeUp,
    /// The user supplied fresh credentials after an auth failure.
    NewLoginParams {
        user: Option<String>,
        password: Option<String>,
        account: Option<String>,
    },
}

/// Status copy the host reads without touching the worker thread.
#[derive(Debug, Clone)]
pub struct WorkerStatusSnapshot {
    pub id: u32,
    pub state: WorkerState,
    pub sub_state: WorkerSubState,
    pub command_state: CommandState,
    pub data_conn_state: DataConnState,
    pub current_item: Option<ItemId>,
    pub current_item_name: Option<String>,
    pub bytes_transferred: u64,
    pub speed_bps: f64,
    pub idle_secs: u64,
    pub last_error: Option<String>,
    pub connect_attempts: u32,
    pub paused: bool,
}

pub(crate) struct WorkerShared {
    state: WorkerState,
    sub_state: WorkerSubState,
    command_state: CommandState,
    data_conn_state: DataConnState,
    current_item: Option<ItemId>,
    current_item_name: Option<String>,
    bytes_transferred: u64,
    speed: crate::speed::TransferSpeedMeter,
    last_activity: Instant,
    last_error: Option<String>,
    connect_attempts: u32,
    paused: bool,
}

impl WorkerShared {
    fn new() -> Self {
        WorkerShared {
            state: WorkerState::LookingForWork,
            sub_state: WorkerSubState::None,
            command_state: CommandState::Idle,
            data_conn_state: DataConnState::DoesNotExist,
            current_item: None,
            current_item_name: None,
            bytes_transferred: 0,
            speed: crate::speed::TransferSpeedMeter::default(),
            last_activity: Instant::now(),
            last_error: None,
            connect_attempts: 0,
            paused: false,
        }
    }
}

/// Host-side handle to one worker thread.
pub struct WorkerHandle {
    pub id: u32,
    tx: Sender<WorkerEvent>,
    shared: Arc<Mutex<WorkerShared>>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn send(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn status(&self) -> WorkerStatusSnapshot {
        let mut shared = self.shared.lock().expect("worker shared lock");
        let speed = shared.speed.bytes_per_sec();
        WorkerStatusSnapshot {
            id: self.id,
            state: shared.state,
            sub_state: shared.sub_state,
            command_state: shared.command_state,
            data_conn_state: shared.data_conn_state,
            current_item: shared.current_item,
            current_item_name: shared.current_item_name.clone(),
            bytes_transferred: shared.bytes_transferred,
            speed_bps: speed,
            idle_secs: shared.last_activity.elapsed().as_secs(),
            last_error: shared.last_error.clone(),
            connect_attempts: shared.connect_attempts,
            paused: shared.paused,
        }
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

/// Everything a worker needs at spawn; grouped to keep the arg count sane.
pub struct WorkerSpawnCtx {
    pub id: u32,
    pub op: Arc<Operation>,
    pub disk: Arc<DiskIo>,
    pub cache: Arc<UploadListingCache>,
    pub opened: Arc<OpenedFiles>,
    pub parser: Arc<dyn ParseListing>,
    /// For the worker-may-be-closed pulse at thread exit.
    pub ops_list: Option<Arc<OperationsList>>,
}

pub fn spawn_worker(ctx: WorkerSpawnCtx) -> WorkerHandle {
    let (tx, rx) = unbounded::<WorkerEvent>();
    let shared = Arc::new(Mutex::new(WorkerShared::new()));
    let shared_thread = shared.clone();
    let id = ctx.id;
    let join = std::thread::Builder::new()
        .name(format!("ftpilot-worker-{}", id))
        .spawn(move || {
            let (cache_tx, cache_rx) = unbounded::<CacheEvent>();
            let mut worker = Worker {
                id: ctx.id,
                op: ctx.op,
                disk: ctx.disk,
                cache: ctx.cache,
                opened: ctx.opened,
                parser: ctx.parser,
                events: rx,
                cache_tx,
                cache_rx,
                conn: None,
                shared: shared_thread,
                should_stop: false,
                should_pause: false,
                login_override: None,
                connect_attempts: 0,
            };
            worker.run();
            if let Some(list) = ctx.ops_list {
                list.pulse_worker_closed();
            }
        })
        .expect("spawn worker thread");
    WorkerHandle { id, tx, shared, join: Some(join) }
}

/// What a suspension-point check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Stop requested; unwind, returning the current item to the queue.
    Stop,
}

struct Worker {
    id: u32,
    op: Arc<Operation>,
    disk: Arc<DiskIo>,
    cache: Arc<UploadListingCache>,
    opened: Arc<OpenedFiles>,
    parser: Arc<dyn ParseListing>,
    events: Receiver<WorkerEvent>,
    cache_tx: Sender<CacheEvent>,
    cache_rx: Receiver<CacheEvent>,
    conn: Option<ControlConnection>,
    shared: Arc<Mutex<WorkerShared>>,
    should_stop: bool,
    should_pause: bool,
    /// Credentials supplied via NewLoginParams, overriding the operation's.
    login_override: Option<(Option<String>, Option<String>, Option<String>)>,
    connect_attempts: u32,
}

impl Worker {
    fn run(&mut self) {
        tracing::debug!("[worker {}] started for {}", self.id, self.op.params.kind.label());
        loop {
            if self.poll_control() == Flow::Stop {
                break;
            }
            self.set_state(WorkerState::LookingForWork, WorkerSubState::None);
            let Some(item) = self.op.queue.get_next_waiting() else {
                if !self.sleep_until_work() {
                    break;
                }
                continue;
            };
            self.begin_item(&item);
            let finished = self.process_item(item);
            self.end_item();
            if !finished {
                break;
            }
        }
        self.shutdown_connection();
        self.set_state(WorkerState::Stopped, WorkerSubState::None);
        tracing::debug!("[worker {}] stopped", self.id);
    }

    /// Returns false when the worker should stop instead of working the item.
    fn process_item(&mut self, item: Item) -> bool {
        // Connection first (explore of local upload trees works offline, but
        // every sequence ends in server commands anyway).
        if self.conn.is_none() {
            match self.ensure_connection() {
                connect::ConnectOutcome::Connected => {}
                connect::ConnectOutcome::Stopping => {
                    self.op.queue.return_to_waiting(item.uid);
                    return false;
                }
                connect::ConnectOutcome::GaveUp => {
                    self.op.queue.return_to_waiting(item.uid);
                    // Someone else (or a later retry) may succeed; this
                    // worker parks in the error state until stopped or fed
                    // new login parameters.
                    if self.wait_in_connection_error() {
                        return true;
                    }
                    return false;
                }
            }
        }
        self.set_state(WorkerState::Working, WorkerSubState::PreparingItem);
        let result = self.dispatch(&item);
        match result {
            ItemOutcome::Finished => true,
            ItemOutcome::Stopping => {
                self.maybe_return_item(item.uid);
                false
            }
            ItemOutcome::ConnectionLost => {
                // The item goes back to the queue; any worker (including this
                // one after reconnect) may pick it up.
                tracing::debug!("[worker {}] connection lost, returning item {}", self.id, item.uid);
                self.maybe_return_item(item.uid);
                self.conn = None;
                true
            }
        }
    }

    fn dispatch(&mut self, item: &Item) -> ItemOutcome {
        match &item.kind {
            ItemKind::DeleteFile { .. } | ItemKind::DeleteLink { .. } => {
                self.run_delete_file(item)
            }
            ItemKind::DeleteDir { .. } => self.run_delete_dir(item),
            ItemKind::DeleteExploreDir { .. } => self.run_delete_explore(item),
            ItemKind::ChAttrsFile { .. } | ItemKind::ChAttrsDir { .. } => self.run_chattrs(item),
            ItemKind::ChAttrsExploreDir { .. } | ItemKind::ChAttrsExploreDirLink { .. } => {
                self.run_chattrs_explore(item)
            }
            ItemKind::ChAttrsResolveLink { .. } => self.run_chattrs_resolve_link(item),
            ItemKind::CopyExploreDir(_)
            | ItemKind::MoveExploreDir(_)
            | ItemKind::MoveExploreDirLink(_) => self.run_download_explore(item),
            ItemKind::CopyResolveLink(_) | ItemKind::MoveResolveLink(_) => {
                self.run_resolve_link(item)
            }
            ItemKind::CopyFileOrFileLink(_) | ItemKind::MoveFileOrFileLink(_) => {
                self.run_download_file(item)
            }
            ItemKind::MoveDeleteDir { .. } | ItemKind::MoveDeleteDirLink { .. } => {
                self.run_move_delete_dir(item)
            }
            ItemKind::UploadCopyExploreDir(_) | ItemKind::UploadMoveExploreDir(_) => {
                self.run_upload_explore(item)
            }
            ItemKind::UploadCopyFile(_) | ItemKind::UploadMoveFile(_) => {
                self.run_upload_file(item)
            }
            ItemKind::UploadMoveDeleteDir { .. } => self.run_upload_move_delete_dir(item),
        }
    }

    // --- mailbox and suspension points -----------------------------------

    /// Drain pending control events; block while paused. The stop flag is
    /// monotone: once seen, every later check reports Stop.
    fn poll_control(&mut self) -> Flow {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.handle_event(event),
                Err(_) => break,
            }
        }
        while self.should_pause && !self.should_stop {
            self.set_paused(true);
            match self.events.recv_timeout(Duration::from_millis(500)) {
                Ok(event) => self.handle_event(event),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    self.should_stop = true;
                }
            }
        }
        self.set_paused(false);
        if self.should_stop { Flow::Stop } else { Flow::Continue }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Activate | WorkerEvent::WakeUp => {}
            WorkerEvent::ShouldStop => self.should_stop = true,
            WorkerEvent::ShouldPause => self.should_pause = true,
            WorkerEvent::ShouldResume => self.should_pause = false,
            WorkerEvent::NewLoginParams { user, password, account } => {
                self.login_override = Some((user, password, account));
            }
        }
    }

    /// Park in `Sleeping` until the queue pokes us or an event arrives.
    /// Returns false when the worker should stop.
    fn sleep_until_work(&mut self) -> bool {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded::<()>(1);
        self.op.queue.register_waiter(wake_tx);
        self.set_state(WorkerState::Sleeping, WorkerSubState::None);
        let events = self.events.clone();
        let cache_rx = self.cache_rx.clone();
        loop {
            crossbeam_channel::select! {
                recv(events) -> event => {
                    match event {
                        Ok(ev) => self.handle_event(ev),
                        Err(_) => self.should_stop = true,
                    }
                    if self.should_stop {
                        return false;
                    }
                    if !self.should_pause {
                        return true;
                    }
                }
                recv(wake_rx) -> _ => {
                    if !self.should_pause {
                        return true;
                    }
                }
                recv(cache_rx) -> _ => {
                    // Stray listing event from an abandoned wait; ignore.
                }
                default(Duration::from_secs(1)) => {
                    // Re-check the queue now and then even without a poke; a
                    // waiter registration can race a parallel add.
                    if !self.should_pause {
                        return true;
                    }
                }
            }
        }
    }

    /// Park in `ConnectionError` until stop or new login parameters.
    /// Returns true when the worker may try again.
    fn wait_in_connection_error(&mut self) -> bool {
        self.set_state(WorkerState::ConnectionError, WorkerSubState::None);
        loop {
            match self.events.recv() {
                Ok(event) => {
                    let had_params = matches!(event, WorkerEvent::NewLoginParams { .. });
                    self.handle_event(event);
                    if self.should_stop {
                        return false;
                    }
                    if had_params {
                        self.connect_attempts = 0;
                        return true;
                    }
                }
                Err(_) => return false,
            }
        }
    }

    /// Interruptible sleep used for reconnect delays and auto-retry timers.
    /// Returns Stop when a stop request arrived while sleeping.
    fn sleep_interruptible(&mut self, duration: Duration) -> Flow {
        let deadline = Instant::now() + duration;
        loop {
            if self.poll_control() == Flow::Stop {
                return Flow::Stop;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Flow::Continue;
            }
            match self.events.recv_timeout(remaining.min(Duration::from_millis(200))) {
                Ok(event) => self.handle_event(event),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    self.should_stop = true;
                }
            }
        }
    }

    // --- item bookkeeping -------------------------------------------------

    fn begin_item(&mut self, item: &Item) {
        let mut shared = self.shared.lock().expect("worker shared lock");
        shared.current_item = Some(item.uid);
        shared.current_item_name = Some(item.name.clone());
        shared.last_activity = Instant::now();
    }

    fn end_item(&mut self) {
        let mut shared = self.shared.lock().expect("worker shared lock");
        shared.current_item = None;
        shared.current_item_name = None;
        shared.data_conn_state = DataConnState::DoesNotExist;
    }

    /// Return the item to `waiting` unless it already reached a terminal
    /// state in this pass.
    fn maybe_return_item(&self, uid: ItemId) {
        let processing = self
            .op
            .queue
            .with_item(uid, |it| it.state == ItemState::Processing)
            .unwrap_or(false);
        if processing {
            self.op.queue.return_to_waiting(uid);
        }
    }

    fn done_item(&self, uid: ItemId) {
        self.op.queue.update_item_state(uid, ItemState::Done, ProblemKind::Ok, None, None);
        self.op.report_item_changed(uid);
    }

    fn fail_item(
        &self,
        uid: ItemId,
        problem: ProblemKind,
        os_error: Option<i32>,
        descr: Option<String>,
    ) {
        self.note_error(problem.describe(os_error, descr.as_deref()));
        self.op.queue.update_item_state(uid, ItemState::Failed, problem, os_error, descr);
        self.op.report_item_changed(uid);
    }

    fn ui_item(
        &self,
        uid: ItemId,
        problem: ProblemKind,
        os_error: Option<i32>,
        descr: Option<String>,
    ) {
        self.note_error(problem.describe(os_error, descr.as_deref()));
        self.op.queue.update_item_state(uid, ItemState::UserInputNeeded, problem, os_error, descr);
        self.op.report_item_changed(uid);
    }

    fn skip_item_as(&self, uid: ItemId, problem: ProblemKind) {
        self.op.queue.update_item_state(uid, ItemState::Skipped, problem, None, None);
        self.op.report_item_changed(uid);
    }

    // --- status -----------------------------------------------------------

    fn set_state(&self, state: WorkerState, sub: WorkerSubState) {
        let mut shared = self.shared.lock().expect("worker shared lock");
        shared.state = state;
        shared.sub_state = sub;
        shared.last_activity = Instant::now();
        drop(shared);
        self.op.report_worker_changed(self.id, false);
    }

    fn set_sub_state(&self, sub: WorkerSubState) {
        let mut shared = self.shared.lock().expect("worker shared lock");
        shared.sub_state = sub;
        shared.last_activity = Instant::now();
    }

    fn set_command_state(&self, state: CommandState) {
        self.shared.lock().expect("worker shared lock").command_state = state;
    }

    fn set_data_conn_state(&self, state: DataConnState) {
        self.shared.lock().expect("worker shared lock").data_conn_state = state;
    }

    fn set_paused(&self, paused: bool) {
        let mut shared = self.shared.lock().expect("worker shared lock");
        if shared.paused != paused {
            shared.paused = paused;
            drop(shared);
            self.op.report_worker_changed(self.id, false);
        }
    }

    fn note_error(&self, text: String) {
        self.shared.lock().expect("worker shared lock").last_error = Some(text);
    }

    fn add_transfer_bytes(&self, n: u64) {
        let mut shared = self.shared.lock().expect("worker shared lock");
        shared.bytes_transferred += n;
        shared.speed.add_bytes(n);
        shared.last_activity = Instant::now();
        drop(shared);
        self.op.add_done_bytes(n);
        self.op.report_worker_changed(self.id, true);
    }

    // --- command helpers --------------------------------------------------

    /// Send one command and wait for its final reply, honoring suspension
    /// points before the send. Errors are transport-level only.
    fn command(&mut self, line: &str) -> Result<Reply, CmdError> {
        if self.poll_control() == Flow::Stop {
            return Err(CmdError::Stopping);
        }
        let conn = self.conn.as_mut().ok_or(CmdError::ConnectionLost)?;
        self.shared.lock().expect("worker shared lock").command_state =
            CommandState::WaitForCmdReply;
        let result = conn.command(line);
        self.set_command_state(CommandState::Idle);
        match result {
            Ok(reply) => Ok(reply),
            Err(err) => Err(self.classify_transport(err)),
        }
    }

    /// Same, but a transient 4xx reply is re-issued after the configured
    /// delay, up to `max_retries` attempts. The delay backs off linearly so
    /// stray late replies from aborted transfers settle before the resend.
    fn command_with_auto_retry(&mut self, line: &str) -> Result<Reply, CmdError> {
        let mut reply = self.command(line)?;
        let max_retries = self.op.params.max_retries;
        let base = Duration::from_millis(self.op.params.retry_delay_ms.max(1));
        for attempt in 1..=max_retries as u32 {
            if !reply.is_transient_error() {
                break;
            }
            tracing::debug!(
                "[worker {}] transient {} on '{}', delayed auto-retry {}/{}",
                self.id,
                reply.code,
                line,
                attempt,
                max_retries
            );
            if self.sleep_interruptible(base.saturating_mul(attempt)) == Flow::Stop {
                return Err(CmdError::Stopping);
            }
            reply = self.command(line)?;
        }
        Ok(reply)
    }

    /// Any transport failure invalidates the connection; whether the item is
    /// worth re-dispatching is the error's own claim (timeouts and closed
    /// sockets are, malformed replies still cost us the connection).
    fn classify_transport(&mut self, err: anyhow::Error) -> CmdError {
        let retriable = err
            .downcast_ref::<EngineError>()
            .map(EngineError::is_retriable_during_transfer)
            .unwrap_or(false);
        tracing::debug!("[worker {}] transport error (retriable={}): {}", self.id, retriable, err);
        self.conn = None;
        CmdError::ConnectionLost
    }

    /// CWD to the given path, distinguishing "path only" failures.
    fn change_working_dir(&mut self, path: &str, path_only: bool) -> Result<(), CwdFailure> {
        let reply = match self.command(&format!("CWD {}", path)) {
            Ok(r) => r,
            Err(e) => return Err(CwdFailure::Transport(e)),
        };
        if let Some(conn) = self.conn.as_mut() {
            if reply.is_success() {
                conn.note_working_dir(path);
            } else {
                conn.invalidate_working_dir();
            }
        }
        if reply.is_success() {
            Ok(())
        } else {
            let problem = if path_only {
                ProblemKind::UnableToChangeToPathOnly
            } else {
                ProblemKind::UnableToChangeDir
            };
            Err(CwdFailure::Refused(problem, reply.text))
        }
    }

    /// CWD with caching; most per-item sequences start here.
    fn ensure_working_dir(&mut self, path: &str) -> Result<(), CwdFailure> {
        let cached = self.conn.as_ref().and_then(|c| c.working_dir().map(str::to_string));
        if cached.as_deref() == Some(path) {
            return Ok(());
        }
        self.change_working_dir(path, true)
    }

    /// Write a command without waiting for its reply (transfer commands whose
    /// final reply arrives only after the data connection drained).
    fn send_raw(&mut self, line: &str) -> Result<(), CmdError> {
        if self.poll_control() == Flow::Stop {
            return Err(CmdError::Stopping);
        }
        let conn = self.conn.as_mut().ok_or(CmdError::ConnectionLost)?;
        match conn.send(line) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.classify_transport(err)),
        }
    }

    /// Read replies until a non-preliminary one arrives.
    fn read_final_reply(&mut self) -> Result<Reply, CmdError> {
        loop {
            let conn = self.conn.as_mut().ok_or(CmdError::ConnectionLost)?;
            match conn.read_reply() {
                Ok(reply) if reply.is_preliminary() => continue,
                Ok(reply) => return Ok(reply),
                Err(err) => return Err(self.classify_transport(err)),
            }
        }
    }

    /// TYPE A / TYPE I with the per-connection cache.
    fn ensure_transfer_type(
        &mut self,
        ty: crate::ftp::control::TransferType,
    ) -> Result<(), CmdError> {
        if self.conn.as_ref().and_then(|c| c.transfer_type()) == Some(ty) {
            return Ok(());
        }
        let reply = self.command(ty.command())?;
        if reply.is_success()
            && let Some(conn) = self.conn.as_mut()
        {
            conn.note_transfer_type(ty);
        }
        Ok(())
    }

    // --- data connections -------------------------------------------------

    /// PASV or PORT according to the operation parameters. Returns the
    /// pending connection; the transfer command goes out afterwards.
    fn open_data_connection(&mut self) -> Result<PendingData, DataSetupError> {
        self.set_sub_state(WorkerSubState::OpeningDataConnection);
        self.set_data_conn_state(DataConnState::OnlyAllocated);
        if self.op.params.server.use_passive_mode {
            let reply = self.command("PASV").map_err(DataSetupError::Cmd)?;
            if !reply.is_success() {
                return Err(DataSetupError::Refused(reply.text));
            }
            let pending =
                PendingData::passive(&reply.text).map_err(|e| DataSetupError::Setup(e.to_string()))?;
            self.set_data_conn_state(DataConnState::WaitingForConnection);
            Ok(pending)
        } else {
            let local_ip = self
                .conn
                .as_ref()
                .and_then(|c| c.local_addr().ok())
                .map(|a| a.ip())
                .ok_or(DataSetupError::Cmd(CmdError::ConnectionLost))?;
            let pending = match PendingData::active(local_ip) {
                Ok(p) => p,
                Err(e) => return Err(DataSetupError::Listen(e.to_string())),
            };
            let addr = pending
                .listen_addr()
                .ok_or_else(|| DataSetupError::Listen("no listen address".into()))?;
            let arg = crate::ftp::data::format_port_argument(&addr)
                .map_err(|e| DataSetupError::Listen(e.to_string()))?;
            let reply = self.command(&format!("PORT {}", arg)).map_err(DataSetupError::Cmd)?;
            if !reply.is_success() {
                return Err(DataSetupError::Refused(reply.text));
            }
            self.set_data_conn_state(DataConnState::WaitingForConnection);
            Ok(pending)
        }
    }

    fn data_timeouts(&self) -> DataTimeouts {
        DataTimeouts::default()
    }

    fn shutdown_connection(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.quit();
        }
    }
}

/// Outcome of one item execution pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    /// Item reached a terminal or parked state; pick up the next one.
    Finished,
    Stopping,
    /// Transport died mid-item; reconnect and let the queue re-dispatch.
    ConnectionLost,
}

/// Transport-or-control failure of a single command.
#[derive(Debug)]
enum CmdError {
    Stopping,
    ConnectionLost,
}

impl CmdError {
    fn outcome(&self) -> ItemOutcome {
        match self {
            CmdError::Stopping => ItemOutcome::Stopping,
            CmdError::ConnectionLost => ItemOutcome::ConnectionLost,
        }
    }
}

/// CWD failure split into transport trouble and server refusal.
enum CwdFailure {
    Transport(CmdError),
    Refused(ProblemKind, String),
}

enum DataSetupError {
    Cmd(CmdError),
    /// The server refused PASV/PORT.
    Refused(String),
    Listen(String),
    Setup(String),
}
