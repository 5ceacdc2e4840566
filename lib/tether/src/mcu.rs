//! The MCU half of the bridge, modelled as a command executor over a pin
//! backend. Firmware integrations implement [`PinBackend`] against real
//! hardware; tests and the loopback harness use [`SimPins`]. The bridge owns
//! the MCU-side link, the console rings, and the client-side pending tables
//! for requests the sketch issues towards the MPU.

use crate::buffer::{ByteRing, FlowEdge};
use crate::codec::Frame;
use crate::link::{Link, LinkEvent, Role};
use crate::pending::PendingTable;
use crate::router::{Handler, Outcome, Router};
use byteorder::{BigEndian, ByteOrder};
use ferrite::crypto::SecretKey;
use ferrite::logging;
use ferrite::spec::{CommandFamily, CommandId, StatusCode, MAX_PAYLOAD_SIZE};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Delay between a SET_BAUDRATE response and the switch taking effect, so
/// the acknowledgement can traverse the old baudrate.
pub const BAUD_SWITCH_DELAY: Duration = Duration::from_millis(50);

/// Pin modes carried by SET_PIN_MODE.
pub const PIN_MODE_INPUT: u8 = 0;
pub const PIN_MODE_OUTPUT: u8 = 1;
pub const PIN_MODE_INPUT_PULLUP: u8 = 2;

/// Chunk flags carried in the first byte of FILE_READ_RESP.
pub const FILE_CHUNK_LAST: u8 = 0x01;
pub const FILE_CHUNK_MISSING: u8 = 0x02;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PinError;

/// The hardware capability set the bridge executes GPIO commands against.
pub trait PinBackend {
    fn set_pin_mode(&mut self, pin: u8, mode: u8) -> Result<(), PinError>;
    fn digital_write(&mut self, pin: u8, level: u8) -> Result<(), PinError>;
    fn digital_read(&mut self, pin: u8) -> Result<u16, PinError>;
    fn analog_write(&mut self, pin: u8, value: u16) -> Result<(), PinError>;
    fn analog_read(&mut self, pin: u8) -> Result<u16, PinError>;
}

/// In-memory pin backend. Digital reads return the last written level;
/// analog reads return a value the test primes via `prime_analog`.
pub struct SimPins {
    modes: hashbrown::HashMap<u8, u8>,
    levels: hashbrown::HashMap<u8, u16>,
    analog: hashbrown::HashMap<u8, u16>,
    pub digital_writes: u64,
    pub analog_writes: u64,
}

impl SimPins {
    pub fn new() -> SimPins {
        SimPins {
            modes: hashbrown::HashMap::new(),
            levels: hashbrown::HashMap::new(),
            analog: hashbrown::HashMap::new(),
            digital_writes: 0,
            analog_writes: 0,
        }
    }

    pub fn prime_analog(&mut self, pin: u8, value: u16) {
        self.analog.insert(pin, value);
    }

    pub fn prime_digital(&mut self, pin: u8, level: u16) {
        self.levels.insert(pin, level);
    }

    pub fn level(&self, pin: u8) -> Option<u16> {
        self.levels.get(&pin).copied()
    }

    pub fn mode(&self, pin: u8) -> Option<u8> {
        self.modes.get(&pin).copied()
    }
}

impl PinBackend for SimPins {
    fn set_pin_mode(&mut self, pin: u8, mode: u8) -> Result<(), PinError> {
        if mode > PIN_MODE_INPUT_PULLUP {
            return Err(PinError);
        }
        self.modes.insert(pin, mode);
        Ok(())
    }

    fn digital_write(&mut self, pin: u8, level: u8) -> Result<(), PinError> {
        self.levels.insert(pin, u16::from(level));
        self.digital_writes += 1;
        Ok(())
    }

    fn digital_read(&mut self, pin: u8) -> Result<u16, PinError> {
        Ok(self.levels.get(&pin).copied().unwrap_or(0))
    }

    fn analog_write(&mut self, pin: u8, value: u16) -> Result<(), PinError> {
        self.analog.insert(pin, value);
        self.analog_writes += 1;
        Ok(())
    }

    fn analog_read(&mut self, pin: u8) -> Result<u16, PinError> {
        Ok(self.analog.get(&pin).copied().unwrap_or(0))
    }
}

/// Results delivered to the sketch for its outstanding client requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    DatastoreValue { key: String, value: Vec<u8> },
    MailboxMessage(Option<Vec<u8>>),
    MailboxDepth(u16),
    FileChunk { path: String, flags: u8, data: Vec<u8> },
    ProcessFinished { exit_code: u8, output: Vec<u8> },
    ProcessStarted { pid: u16 },
    ProcessStatus { pid: u16, running: bool, exit_code: u8, output: Vec<u8> },
    ProcessKilled { pid: u16, ok: bool },
}

/// Static description of this MCU build.
#[derive(Debug, Clone)]
pub struct McuConfig {
    pub version: String,
    pub capabilities: u32,
    pub free_memory: u32,
    pub console_capacity: usize,
    pub pending_limit: usize,
    pub initial_baud: u32,
}

impl Default for McuConfig {
    fn default() -> McuConfig {
        McuConfig {
            version: "1.0.0".to_string(),
            capabilities: ferrite::spec::CAP_GPIO
                | ferrite::spec::CAP_ANALOG_READ
                | ferrite::spec::CAP_ANALOG_WRITE
                | ferrite::spec::CAP_CONSOLE
                | ferrite::spec::CAP_DATASTORE
                | ferrite::spec::CAP_MAILBOX
                | ferrite::spec::CAP_FILE
                | ferrite::spec::CAP_PROCESS,
            free_memory: 1024,
            console_capacity: 256,
            pending_limit: 4,
            initial_baud: 115200,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct McuCounters {
    pub console_dropped_bytes: u64,
    pub console_tx_dropped_bytes: u64,
    pub pin_errors: u64,
}

/// Everything the command handlers mutate. Split from the bridge so the
/// router can borrow it wholesale while the link stays with the bridge.
pub struct McuState<P: PinBackend> {
    pins: P,
    version: String,
    capabilities: u32,
    free_memory: u32,

    console_rx: ByteRing,
    console_paused: bool,
    flow_queue: VecDeque<CommandId>,

    current_baud: u32,
    pending_baud: Option<(u32, Instant)>,
    now: Instant,

    datastore_gets: PendingTable<String>,
    mailbox_reads: PendingTable<()>,
    mailbox_availables: PendingTable<()>,
    file_reads: PendingTable<String>,
    process_runs: PendingTable<()>,
    process_starts: PendingTable<()>,
    process_polls: PendingTable<u16>,
    process_kills: PendingTable<u16>,

    inbox: VecDeque<ClientEvent>,
    counters: McuCounters,
}

/// The MCU-side bridge: link + router + state, driven by `receive` for
/// inbound wire bytes and `poll` for the time-based work.
pub struct McuBridge<P: PinBackend> {
    link: Link,
    router: Router<McuState<P>>,
    state: McuState<P>,
    console_tx: ByteRing,
    log: logging::Logger,
}

impl<P: PinBackend + 'static> McuBridge<P> {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: McuConfig,
        pins: P,
        secret: Option<SecretKey>,
        log: L,
    ) -> McuBridge<P> {
        let bridge_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        let mut router = Router::new();
        router.register(CommandFamily::System, SystemService);
        router.register(CommandFamily::Gpio, GpioService);
        router.register(CommandFamily::Console, ConsoleService);
        router.register(CommandFamily::Datastore, DatastoreClient);
        router.register(CommandFamily::Mailbox, MailboxClient);
        router.register(CommandFamily::File, FileClient);
        router.register(CommandFamily::Process, ProcessClient);

        let state = McuState {
            pins,
            version: config.version,
            capabilities: config.capabilities,
            free_memory: config.free_memory,
            console_rx: ByteRing::new(config.console_capacity),
            console_paused: false,
            flow_queue: VecDeque::new(),
            current_baud: config.initial_baud,
            pending_baud: None,
            now: Instant::now(),
            datastore_gets: PendingTable::new(config.pending_limit),
            mailbox_reads: PendingTable::new(config.pending_limit),
            mailbox_availables: PendingTable::new(config.pending_limit),
            file_reads: PendingTable::new(config.pending_limit),
            process_runs: PendingTable::new(config.pending_limit),
            process_starts: PendingTable::new(config.pending_limit),
            process_polls: PendingTable::new(config.pending_limit),
            process_kills: PendingTable::new(config.pending_limit),
            inbox: VecDeque::new(),
            counters: McuCounters::default(),
        };

        McuBridge {
            link: Link::new(Role::Mcu, secret, Some(&bridge_log)),
            router,
            state,
            console_tx: ByteRing::new(config.console_capacity),
            log: bridge_log,
        }
    }

    #[inline]
    pub fn link(&self) -> &Link {
        &self.link
    }

    #[inline]
    pub fn pins(&self) -> &P {
        &self.state.pins
    }

    #[inline]
    pub fn pins_mut(&mut self) -> &mut P {
        &mut self.state.pins
    }

    #[inline]
    pub fn counters(&self) -> &McuCounters {
        &self.state.counters
    }

    #[inline]
    pub fn current_baud(&self) -> u32 {
        self.state.current_baud
    }

    /// Next result for the sketch, in arrival order.
    pub fn next_event(&mut self) -> Option<ClientEvent> {
        self.state.inbox.pop_front()
    }

    /// Consume inbound wire bytes, producing outbound wire bytes.
    pub fn receive(&mut self, bytes: &[u8], now: Instant) -> Vec<u8> {
        self.state.now = now;

        let output = self.link.handle_bytes(bytes, now);
        let mut wire: Vec<u8> = output.packets.into_iter().flatten().collect();

        for event in output.events {
            match event {
                LinkEvent::Command(frame) => {
                    wire.extend(self.dispatch(&frame, now));
                }
                LinkEvent::Established => {
                    logging::debug!(self.log, "link established");
                }
                LinkEvent::SafeState | LinkEvent::Fault(_) => {
                    self.drop_client_state();
                }
                _ => (),
            }
        }

        wire.extend(self.pump(now));
        wire
    }

    /// Time-based work: link timeouts, scheduled baud switch, console TX
    /// chunking and deferred flow-control sends.
    pub fn poll(&mut self, now: Instant) -> Vec<u8> {
        self.state.now = now;

        let mut wire: Vec<u8> = self
            .link
            .tick(now)
            .packets
            .into_iter()
            .flatten()
            .collect();

        wire.extend(self.pump(now));
        wire
    }

    fn dispatch(&mut self, frame: &Frame, now: Instant) -> Vec<u8> {
        let outcome = self.router.dispatch(frame, &mut self.state);
        let mut wire = Vec::new();

        match outcome {
            Outcome::Done => (),
            Outcome::Reply(replies) => {
                for (command, payload) in replies {
                    match self.link.send_command(command, &payload, now) {
                        Ok(output) => {
                            wire.extend(output.packets.into_iter().flatten());
                        }
                        Err(error) => {
                            logging::warn!(self.log, "response could not be sent";
                                           "command" => command.name(),
                                           "error" => error.reason());
                        }
                    }
                }
            }
            Outcome::Fail(code, payload) => {
                wire.extend(self.link.send_status(code, &payload).packets.into_iter().flatten());
            }
        }

        wire
    }

    fn pump(&mut self, now: Instant) -> Vec<u8> {
        let mut wire = Vec::new();

        // Scheduled baudrate switch.
        if let Some((baud, at)) = self.state.pending_baud {
            if now >= at {
                logging::info!(self.log, "switching baudrate"; "baud" => baud);
                self.state.current_baud = baud;
                self.state.pending_baud = None;
            }
        }

        // Deferred flow-control frames.
        while let Some(&command) = self.state.flow_queue.front() {
            match self.link.send_command(command, &[], now) {
                Ok(output) => {
                    self.state.flow_queue.pop_front();
                    wire.extend(output.packets.into_iter().flatten());
                }
                Err(_) => break,
            }
        }

        // Console TX: one chunk at a time, only while the peer accepts.
        if !self.state.console_paused
            && !self.console_tx.is_empty()
            && self.link.state() == crate::link::LinkState::Idle
        {
            let (chunk, _) = self.console_tx.drain(MAX_PAYLOAD_SIZE);
            match self.link.send_command(CommandId::ConsoleWrite, &chunk, now) {
                Ok(output) => wire.extend(output.packets.into_iter().flatten()),
                Err(error) => {
                    self.state.counters.console_tx_dropped_bytes += chunk.len() as u64;
                    logging::warn!(self.log, "console chunk dropped";
                                   "error" => error.reason());
                }
            }
        }

        wire
    }

    fn drop_client_state(&mut self) {
        self.state.datastore_gets.drain_all();
        self.state.mailbox_reads.drain_all();
        self.state.mailbox_availables.drain_all();
        self.state.file_reads.drain_all();
        self.state.process_runs.drain_all();
        self.state.process_starts.drain_all();
        self.state.process_polls.drain_all();
        self.state.process_kills.drain_all();
        self.state.flow_queue.clear();
    }
}

// Sketch-facing APIs: console and the client requests toward the MPU.
impl<P: PinBackend + 'static> McuBridge<P> {
    /// Queue console output; chunked onto the wire by `poll`.
    pub fn console_write(&mut self, data: &[u8]) {
        let outcome = self.console_tx.push(data);
        self.state.counters.console_tx_dropped_bytes += outcome.dropped as u64;
    }

    /// Read buffered console input, emitting an XON when the ring recovers.
    pub fn console_read(&mut self, max: usize, now: Instant) -> (Vec<u8>, Vec<u8>) {
        let (data, edge) = self.state.console_rx.drain(max);

        let mut wire = Vec::new();
        if edge == Some(FlowEdge::Low) {
            self.state.flow_queue.push_back(CommandId::ConsoleXon);
            wire.extend(self.pump(now));
        }

        (data, wire)
    }

    pub fn datastore_put(&mut self, key: &str, value: &[u8], now: Instant) -> Vec<u8> {
        let mut payload = Vec::with_capacity(1 + key.len() + value.len());
        payload.push(key.len() as u8);
        payload.extend_from_slice(key.as_bytes());
        payload.extend_from_slice(value);
        self.request(CommandId::DatastorePut, payload, now)
    }

    pub fn datastore_get(&mut self, key: &str, now: Instant) -> Vec<u8> {
        if self.state.datastore_gets.push(key.to_string()).is_err() {
            logging::warn!(self.log, "datastore get table full"; "key" => key);
            return Vec::new();
        }
        self.request(CommandId::DatastoreGet, key.as_bytes().to_vec(), now)
    }

    pub fn mailbox_push(&mut self, message: &[u8], now: Instant) -> Vec<u8> {
        self.request(CommandId::MailboxPush, message.to_vec(), now)
    }

    pub fn mailbox_read(&mut self, now: Instant) -> Vec<u8> {
        if self.state.mailbox_reads.push(()).is_err() {
            return Vec::new();
        }
        self.request(CommandId::MailboxRead, Vec::new(), now)
    }

    pub fn mailbox_available(&mut self, now: Instant) -> Vec<u8> {
        if self.state.mailbox_availables.push(()).is_err() {
            return Vec::new();
        }
        self.request(CommandId::MailboxAvailable, Vec::new(), now)
    }

    pub fn file_read(&mut self, path: &str, now: Instant) -> Vec<u8> {
        if self.state.file_reads.push(path.to_string()).is_err() {
            return Vec::new();
        }
        self.request(CommandId::FileRead, path.as_bytes().to_vec(), now)
    }

    pub fn file_write(&mut self, path: &str, data: &[u8], now: Instant) -> Vec<u8> {
        let mut payload = Vec::with_capacity(1 + path.len() + data.len());
        payload.push(path.len() as u8);
        payload.extend_from_slice(path.as_bytes());
        payload.extend_from_slice(data);
        self.request(CommandId::FileWrite, payload, now)
    }

    pub fn file_remove(&mut self, path: &str, now: Instant) -> Vec<u8> {
        self.request(CommandId::FileRemove, path.as_bytes().to_vec(), now)
    }

    pub fn process_run(&mut self, command_line: &str, now: Instant) -> Vec<u8> {
        if self.state.process_runs.push(()).is_err() {
            return Vec::new();
        }
        self.request(CommandId::ProcessRun, command_line.as_bytes().to_vec(), now)
    }

    pub fn process_run_async(&mut self, command_line: &str, now: Instant) -> Vec<u8> {
        if self.state.process_starts.push(()).is_err() {
            return Vec::new();
        }
        self.request(CommandId::ProcessRunAsync, command_line.as_bytes().to_vec(), now)
    }

    pub fn process_poll(&mut self, pid: u16, now: Instant) -> Vec<u8> {
        if self.state.process_polls.push(pid).is_err() {
            return Vec::new();
        }
        let mut payload = vec![0u8; 2];
        BigEndian::write_u16(&mut payload, pid);
        self.request(CommandId::ProcessPoll, payload, now)
    }

    pub fn process_kill(&mut self, pid: u16, now: Instant) -> Vec<u8> {
        if self.state.process_kills.push(pid).is_err() {
            return Vec::new();
        }
        let mut payload = vec![0u8; 2];
        BigEndian::write_u16(&mut payload, pid);
        self.request(CommandId::ProcessKill, payload, now)
    }

    fn request(&mut self, command: CommandId, payload: Vec<u8>, now: Instant) -> Vec<u8> {
        match self.link.send_command(command, &payload, now) {
            Ok(output) => output.packets.into_iter().flatten().collect(),
            Err(error) => {
                logging::warn!(self.log, "client request not sent";
                               "command" => command.name(),
                               "error" => error.reason());
                Vec::new()
            }
        }
    }
}

struct SystemService;

impl<P: PinBackend> Handler<McuState<P>> for SystemService {
    fn handle(&mut self, command: CommandId, frame: &Frame, state: &mut McuState<P>) -> Outcome {
        match command {
            CommandId::GetVersion => {
                Outcome::reply(CommandId::GetVersionResp, state.version.as_bytes().to_vec())
            }
            CommandId::GetCapabilities => {
                let mut payload = vec![0u8; 4];
                BigEndian::write_u32(&mut payload, state.capabilities);
                Outcome::reply(CommandId::GetCapabilitiesResp, payload)
            }
            CommandId::GetFreeMemory => {
                let mut payload = vec![0u8; 4];
                BigEndian::write_u32(&mut payload, state.free_memory);
                Outcome::reply(CommandId::GetFreeMemoryResp, payload)
            }
            CommandId::SetBaudrate => {
                if frame.payload.len() != 4 {
                    return Outcome::error();
                }
                let baud = BigEndian::read_u32(&frame.payload);
                if baud < 1200 || baud > 1_000_000 {
                    return Outcome::error();
                }

                // Respond first; the switch waits out the old baudrate.
                state.pending_baud = Some((baud, state.now + BAUD_SWITCH_DELAY));
                Outcome::reply(CommandId::SetBaudrateResp, frame.payload.clone())
            }
            _ => Outcome::Fail(StatusCode::NotImplemented, Vec::new()),
        }
    }
}

struct GpioService;

impl<P: PinBackend> Handler<McuState<P>> for GpioService {
    fn handle(&mut self, command: CommandId, frame: &Frame, state: &mut McuState<P>) -> Outcome {
        let payload = &frame.payload;

        let result = match command {
            CommandId::SetPinMode => {
                if payload.len() != 2 {
                    return Outcome::error();
                }
                state.pins.set_pin_mode(payload[0], payload[1]).map(|_| Outcome::Done)
            }
            CommandId::DigitalWrite => {
                if payload.len() != 2 {
                    return Outcome::error();
                }
                state.pins.digital_write(payload[0], payload[1]).map(|_| Outcome::Done)
            }
            CommandId::DigitalRead => {
                if payload.len() != 1 {
                    return Outcome::error();
                }
                state.pins.digital_read(payload[0]).map(|value| {
                    let mut resp = vec![payload[0], 0, 0];
                    BigEndian::write_u16(&mut resp[1..3], value);
                    Outcome::reply(CommandId::DigitalReadResp, resp)
                })
            }
            CommandId::AnalogWrite => {
                if payload.len() != 3 {
                    return Outcome::error();
                }
                state
                    .pins
                    .analog_write(payload[0], BigEndian::read_u16(&payload[1..3]))
                    .map(|_| Outcome::Done)
            }
            CommandId::AnalogRead => {
                if payload.len() != 1 {
                    return Outcome::error();
                }
                state.pins.analog_read(payload[0]).map(|value| {
                    let mut resp = vec![payload[0], 0, 0];
                    BigEndian::write_u16(&mut resp[1..3], value);
                    Outcome::reply(CommandId::AnalogReadResp, resp)
                })
            }
            _ => return Outcome::Fail(StatusCode::NotImplemented, Vec::new()),
        };

        match result {
            Ok(outcome) => outcome,
            Err(PinError) => {
                state.counters.pin_errors += 1;
                Outcome::error()
            }
        }
    }
}

struct ConsoleService;

impl<P: PinBackend> Handler<McuState<P>> for ConsoleService {
    fn handle(&mut self, command: CommandId, frame: &Frame, state: &mut McuState<P>) -> Outcome {
        match command {
            CommandId::ConsoleWrite => {
                let outcome = state.console_rx.push(&frame.payload);
                state.counters.console_dropped_bytes += outcome.dropped as u64;

                if outcome.edge == Some(FlowEdge::High) {
                    state.flow_queue.push_back(CommandId::ConsoleXoff);
                }
                Outcome::Done
            }
            CommandId::ConsoleXoff => {
                state.console_paused = true;
                Outcome::Done
            }
            CommandId::ConsoleXon => {
                state.console_paused = false;
                Outcome::Done
            }
            _ => Outcome::Fail(StatusCode::NotImplemented, Vec::new()),
        }
    }
}

struct DatastoreClient;

impl<P: PinBackend> Handler<McuState<P>> for DatastoreClient {
    fn handle(&mut self, command: CommandId, frame: &Frame, state: &mut McuState<P>) -> Outcome {
        match command {
            CommandId::DatastoreGetResp => {
                let key = match state.datastore_gets.take() {
                    Some(key) => key,
                    None => return Outcome::Done, // stray response, nothing waits
                };
                state.inbox.push_back(ClientEvent::DatastoreValue {
                    key,
                    value: frame.payload.clone(),
                });
                Outcome::Done
            }
            _ => Outcome::Fail(StatusCode::NotImplemented, Vec::new()),
        }
    }
}

struct MailboxClient;

impl<P: PinBackend> Handler<McuState<P>> for MailboxClient {
    fn handle(&mut self, command: CommandId, frame: &Frame, state: &mut McuState<P>) -> Outcome {
        match command {
            CommandId::MailboxReadResp => {
                if state.mailbox_reads.take().is_none() {
                    return Outcome::Done;
                }
                let message = match frame.payload.split_first() {
                    Some((&1, rest)) => Some(rest.to_vec()),
                    _ => None,
                };
                state.inbox.push_back(ClientEvent::MailboxMessage(message));
                Outcome::Done
            }
            CommandId::MailboxAvailableResp => {
                if state.mailbox_availables.take().is_none() {
                    return Outcome::Done;
                }
                if frame.payload.len() != 2 {
                    return Outcome::error();
                }
                state
                    .inbox
                    .push_back(ClientEvent::MailboxDepth(BigEndian::read_u16(&frame.payload)));
                Outcome::Done
            }
            _ => Outcome::Fail(StatusCode::NotImplemented, Vec::new()),
        }
    }
}

struct FileClient;

impl<P: PinBackend> Handler<McuState<P>> for FileClient {
    fn handle(&mut self, command: CommandId, frame: &Frame, state: &mut McuState<P>) -> Outcome {
        match command {
            CommandId::FileReadResp => {
                let (flags, data) = match frame.payload.split_first() {
                    Some((&flags, rest)) => (flags, rest.to_vec()),
                    None => return Outcome::error(),
                };

                // The path leaves the table with the final chunk.
                let path = if flags & (FILE_CHUNK_LAST | FILE_CHUNK_MISSING) != 0 {
                    match state.file_reads.take() {
                        Some(path) => path,
                        None => return Outcome::Done,
                    }
                } else {
                    match state.file_reads.front() {
                        Some(path) => path.clone(),
                        None => return Outcome::Done,
                    }
                };

                state.inbox.push_back(ClientEvent::FileChunk { path, flags, data });
                Outcome::Done
            }
            _ => Outcome::Fail(StatusCode::NotImplemented, Vec::new()),
        }
    }
}

struct ProcessClient;

impl<P: PinBackend> Handler<McuState<P>> for ProcessClient {
    fn handle(&mut self, command: CommandId, frame: &Frame, state: &mut McuState<P>) -> Outcome {
        let payload = &frame.payload;

        match command {
            CommandId::ProcessRunResp => {
                if state.process_runs.take().is_none() {
                    return Outcome::Done;
                }
                match payload.split_first() {
                    Some((&exit_code, output)) => {
                        state.inbox.push_back(ClientEvent::ProcessFinished {
                            exit_code,
                            output: output.to_vec(),
                        });
                        Outcome::Done
                    }
                    None => Outcome::error(),
                }
            }
            CommandId::ProcessRunAsyncResp => {
                if state.process_starts.take().is_none() {
                    return Outcome::Done;
                }
                if payload.len() != 2 {
                    return Outcome::error();
                }
                state.inbox.push_back(ClientEvent::ProcessStarted {
                    pid: BigEndian::read_u16(payload),
                });
                Outcome::Done
            }
            CommandId::ProcessPollResp => {
                if state.process_polls.take().is_none() {
                    return Outcome::Done;
                }
                if payload.len() < 4 {
                    return Outcome::error();
                }
                state.inbox.push_back(ClientEvent::ProcessStatus {
                    pid: BigEndian::read_u16(&payload[0..2]),
                    running: payload[2] != 0,
                    exit_code: payload[3],
                    output: payload[4..].to_vec(),
                });
                Outcome::Done
            }
            CommandId::ProcessKillResp => {
                if state.process_kills.take().is_none() {
                    return Outcome::Done;
                }
                if payload.len() != 3 {
                    return Outcome::error();
                }
                state.inbox.push_back(ClientEvent::ProcessKilled {
                    pid: BigEndian::read_u16(&payload[0..2]),
                    ok: payload[2] != 0,
                });
                Outcome::Done
            }
            _ => Outcome::Fail(StatusCode::NotImplemented, Vec::new()),
        }
    }
}
