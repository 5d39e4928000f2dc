// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::{deadline_exceeded_error, unavailable_error, CanonicalError};
use log::{debug, info, warn};

use crate::command_class::{FrameStatus, Reply, ReplyFramer};
use crate::mount_commands::ALIGNMENT_WORKAROUND;
use crate::mount_state::SharedMountState;

pub const DEFAULT_MOUNT_PORT: u16 = 3492;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

// How long the worker blocks on the socket or the queue before re-checking
// for stop requests and reconnects.
const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
enum ReplySlot {
    Pending,
    Filled(Reply),
    Failed,
}

/// A (possibly pipelined) command on its way to the mount, plus the slot the
/// runner fills with the framed reply. The slot is set at most once.
#[derive(Debug)]
pub struct CommandRecord {
    command: String,
    slot: Mutex<ReplySlot>,
    slot_filled: Condvar,
}

impl CommandRecord {
    pub fn new(command: &str) -> Arc<Self> {
        Arc::new(CommandRecord {
            command: command.to_string(),
            slot: Mutex::new(ReplySlot::Pending),
            slot_filled: Condvar::new(),
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// The reply, if the runner has finished with this record successfully.
    pub fn reply(&self) -> Option<Reply> {
        match &*self.slot.lock().unwrap() {
            ReplySlot::Filled(r) => Some(r.clone()),
            _ => None,
        }
    }

    /// True once the runner is done with this record, successfully or not.
    pub fn is_done(&self) -> bool {
        !matches!(*self.slot.lock().unwrap(), ReplySlot::Pending)
    }

    /// Blocks until the runner is done with this record or `timeout` passes.
    /// None means the command failed or did not complete in time.
    pub fn wait(&self, timeout: Duration) -> Option<Reply> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().unwrap();
        loop {
            match &*slot {
                ReplySlot::Filled(r) => return Some(r.clone()),
                ReplySlot::Failed => return None,
                ReplySlot::Pending => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self.slot_filled.wait_timeout(slot, deadline - now).unwrap().0;
        }
    }

    fn fill(&self, reply: Reply) {
        let mut slot = self.slot.lock().unwrap();
        if matches!(*slot, ReplySlot::Pending) {
            *slot = ReplySlot::Filled(reply);
            self.slot_filled.notify_all();
        }
    }

    fn fail(&self) {
        let mut slot = self.slot.lock().unwrap();
        if matches!(*slot, ReplySlot::Pending) {
            *slot = ReplySlot::Failed;
            self.slot_filled.notify_all();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Terminal,
}

/// Sole owner of the command socket to the mount. Commands are sent in FIFO
/// order, one record at a time: while a record that expects a reply is in
/// flight, nothing else is written.
pub struct CommandRunner {
    // Our state, shared between CommandRunner methods and the worker thread.
    state: Arc<Mutex<RunnerState>>,

    // Signalled when a record is queued or a stop is requested.
    queue_signal: Arc<Condvar>,
}

// State shared between worker thread and the CommandRunner methods.
struct RunnerState {
    queue: VecDeque<Arc<CommandRecord>>,

    connection: ConnectionState,

    // Set by stop(); the worker thread exits when it sees this.
    stop_request: bool,

    worker_thread: Option<thread::JoinHandle<()>>,
}

impl Drop for CommandRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Resolves `address` and connects with CONNECT_TIMEOUT.
pub fn connect(address: &str) -> Result<TcpStream, CanonicalError> {
    let addrs = address.to_socket_addrs().map_err(|e| {
        unavailable_error(format!("Cannot resolve {}: {}", address, e).as_str())
    })?;
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(unavailable_error(format!("Cannot connect to {}: {:?}",
                                  address, last_error).as_str()))
}

/// Writes `command` and reads until the framed reply is complete or
/// `timeout` passes. Used by connections other than the runner's own.
pub fn request(stream: &mut TcpStream, command: &str, timeout: Duration)
               -> Result<Reply, CanonicalError> {
    let mut framer = ReplyFramer::new(command);
    stream.write_all(command.as_bytes()).map_err(|e| {
        unavailable_error(format!("Write of {:?} failed: {}", command, e).as_str())
    })?;
    if framer.expects_nothing() {
        return Ok(Reply::default());
    }
    let deadline = Instant::now() + timeout;
    let mut buffer = [0_u8; 2048];
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(deadline_exceeded_error(format!(
                "No complete reply to {:?}; seen {:?}", command, framer.seen()).as_str()));
        }
        let _ = stream.set_read_timeout(Some((deadline - now).min(TICK)));
        match stream.read(&mut buffer) {
            Ok(0) => {
                return Err(unavailable_error("Mount closed the connection"));
            }
            Ok(n) => {
                if let FrameStatus::Complete(reply) = framer.push(&buffer[..n])? {
                    return Ok(reply);
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock ||
                e.kind() == ErrorKind::TimedOut ||
                e.kind() == ErrorKind::Interrupted => {
                continue;
            }
            Err(e) => {
                return Err(unavailable_error(
                    format!("Read from mount failed: {}", e).as_str()));
            }
        }
    }
}

impl CommandRunner {
    /// Starts the worker. No connection is attempted until `mount_state`
    /// reports a known firmware version.
    pub fn new(address: String, mount_state: SharedMountState) -> Self {
        let runner = CommandRunner {
            state: Arc::new(Mutex::new(RunnerState {
                queue: VecDeque::new(),
                connection: ConnectionState::Disconnected,
                stop_request: false,
                worker_thread: None,
            })),
            queue_signal: Arc::new(Condvar::new()),
        };
        let cloned_state = runner.state.clone();
        let cloned_signal = runner.queue_signal.clone();
        runner.state.lock().unwrap().worker_thread = Some(thread::spawn(move || {
            CommandRunner::worker(address, mount_state, cloned_state, cloned_signal);
        }));
        runner
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().unwrap().connection
    }

    /// Queues `record`; the caller may wait on it.
    pub fn enqueue(&self, record: Arc<CommandRecord>) {
        let mut locked_state = self.state.lock().unwrap();
        if locked_state.stop_request || locked_state.connection == ConnectionState::Terminal {
            record.fail();
            return;
        }
        locked_state.queue.push_back(record);
        self.queue_signal.notify_all();
    }

    /// Fire-and-forget form of enqueue().
    pub fn enqueue_blind(&self, command: &str) {
        self.enqueue(CommandRecord::new(command));
    }

    /// Queues `command` and waits up to `timeout` for its reply.
    pub fn send(&self, command: &str, timeout: Duration) -> Option<Reply> {
        let record = CommandRecord::new(command);
        self.enqueue(record.clone());
        record.wait(timeout)
    }

    /// Some firmware ignores the first command after a reset until an empty
    /// alignment session has been opened and closed. Returns true only if the
    /// mount answered "V" then "E".
    pub fn workaround_align(&self, timeout: Duration) -> bool {
        match self.send(ALIGNMENT_WORKAROUND, timeout) {
            Some(reply) => {
                let ok = reply.chunks == ["V", "E"];
                if !ok {
                    warn!("Alignment workaround got {:?}", reply.raw);
                }
                ok
            }
            None => false,
        }
    }

    /// Shuts down the worker thread. Queued records are failed.
    pub fn stop(&self) {
        let worker_thread;
        {
            let mut locked_state = self.state.lock().unwrap();
            locked_state.stop_request = true;
            self.queue_signal.notify_all();
            worker_thread = locked_state.worker_thread.take();
        }
        if let Some(handle) = worker_thread {
            let _ = handle.join();
        }
    }

    fn set_connection(state: &Arc<Mutex<RunnerState>>, connection: ConnectionState) {
        state.lock().unwrap().connection = connection;
    }

    // Waits for a queued record, at most TICK. Returns None on stop or if the
    // queue stayed empty.
    fn next_record(state: &Arc<Mutex<RunnerState>>, queue_signal: &Condvar)
                   -> Option<Arc<CommandRecord>> {
        let mut locked_state = state.lock().unwrap();
        if locked_state.queue.is_empty() && !locked_state.stop_request {
            locked_state = queue_signal.wait_timeout(locked_state, TICK).unwrap().0;
        }
        if locked_state.stop_request {
            return None;
        }
        locked_state.queue.pop_front()
    }

    fn worker(address: String, mount_state: SharedMountState,
              state: Arc<Mutex<RunnerState>>, queue_signal: Arc<Condvar>) {
        let mut stream: Option<TcpStream> = None;
        // The record awaiting its reply. While this is Some, nothing else is
        // written to the socket.
        let mut in_flight: Option<(Arc<CommandRecord>, ReplyFramer)> = None;
        let mut buffer = [0_u8; 2048];
        loop {
            if state.lock().unwrap().stop_request {
                info!("Stopping command runner");
                break;
            }
            let Some(connected) = stream.as_mut() else {
                if !mount_state.firmware_known() {
                    // The pollers have not identified the firmware yet.
                    let locked_state = state.lock().unwrap();
                    if !locked_state.stop_request {
                        let _ = queue_signal.wait_timeout(locked_state, TICK).unwrap();
                    }
                    continue;
                }
                Self::set_connection(&state, ConnectionState::Connecting);
                match connect(&address) {
                    Ok(s) => {
                        let _ = s.set_read_timeout(Some(TICK));
                        info!("Command runner connected to {}", address);
                        Self::set_connection(&state, ConnectionState::Connected);
                        stream = Some(s);
                    }
                    Err(e) => {
                        debug!("{}", e.message);
                        Self::set_connection(&state, ConnectionState::Disconnected);
                        thread::sleep(TICK);
                    }
                }
                continue;
            };

            let mut lost_connection = false;
            match in_flight.as_mut() {
                None => {
                    let Some(record) = Self::next_record(&state, &queue_signal) else {
                        continue;
                    };
                    let framer = ReplyFramer::new(record.command());
                    debug!("Sending {}", record.command());
                    if let Err(e) = connected.write_all(record.command().as_bytes()) {
                        warn!("Write of {:?} failed: {}", record.command(), e);
                        record.fail();
                        lost_connection = true;
                    } else if framer.expects_nothing() {
                        record.fill(Reply::default());
                    } else {
                        in_flight = Some((record, framer));
                    }
                }
                Some((record, framer)) => {
                    match connected.read(&mut buffer) {
                        Ok(0) => {
                            warn!("Mount closed the command connection");
                            lost_connection = true;
                        }
                        Ok(n) => {
                            match framer.push(&buffer[..n]) {
                                Ok(FrameStatus::Incomplete) => {}
                                Ok(FrameStatus::Complete(reply)) => {
                                    debug!("Reply to {}: {}", record.command(), reply.raw);
                                    record.fill(reply);
                                    in_flight = None;
                                }
                                Err(e) => {
                                    warn!("Malformed reply to {:?}: {}",
                                          record.command(), e.message);
                                    record.fail();
                                    in_flight = None;
                                }
                            }
                        }
                        Err(ref e) if e.kind() == ErrorKind::WouldBlock ||
                            e.kind() == ErrorKind::TimedOut ||
                            e.kind() == ErrorKind::Interrupted => {}
                        Err(e) => {
                            warn!("Read from mount failed: {}", e);
                            lost_connection = true;
                        }
                    }
                }
            }
            if lost_connection {
                if let Some((record, _)) = in_flight.take() {
                    record.fail();
                }
                stream = None;
                Self::set_connection(&state, ConnectionState::Disconnected);
            }
        }  // loop.

        if let Some((record, _)) = in_flight.take() {
            record.fail();
        }
        let mut locked_state = state.lock().unwrap();
        for record in locked_state.queue.drain(..) {
            record.fail();
        }
        locked_state.connection = ConnectionState::Terminal;
    }
}
