use crate::config::BridgeConfig;
use crate::pubsub::{
    Correlation, InboundRequest, Publication, ERR_DATASTORE_MISS, ERR_LINK_RESET,
    ERR_PENDING_PIN_OVERFLOW, ERR_REQUEST_TIMEOUT, ERR_RUN_PAYLOAD_TOO_LARGE, ERR_TOPIC_FORBIDDEN,
    ERR_UNKNOWN_PID, PROP_DATASTORE_KEY, PROP_ERROR, PROP_FILE_PATH, PROP_PIN, PROP_PROCESS_PID,
    PROP_STATUS,
};
use crate::services::console::ConsoleRelay;
use crate::services::datastore::Datastore;
use crate::services::files::{FileError, FileStore};
use crate::services::mailbox::Mailbox;
use crate::services::process::{
    ProcessError, ProcessOrigin, ProcessTable, ABANDONED_GRACE_MS,
};
use crate::state::{to_hex, RuntimeState};
use crate::topics::{Authorizer, TopicRequest};
use byteorder::{BigEndian, ByteOrder};
use ferrite::crypto::SecretKey;
use ferrite::logging;
use ferrite::spec::{CommandFamily, CommandId, StatusCode, MAX_PAYLOAD_SIZE};
use ferrite::time::timestamp_millis;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tether::buffer::FlowEdge;
use tether::codec::Frame;
use tether::link::{Link, LinkEvent, LinkState, LinkTiming, Role};
use tether::mcu::{FILE_CHUNK_LAST, FILE_CHUNK_MISSING};
use tether::pending::PendingTable;
use tether::router::{Handler, Outcome, Router};

pub type StateHandle = Rc<RefCell<RuntimeState>>;

/// Side work the engine cannot do itself; the daemon's tasks execute these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SpawnProcess { pid: u16, command_line: String },
    KillProcess { pid: u16 },
    /// Reconfigure the serial device after the response has drained.
    SetBaudrate { baud: u32 },
}

/// Everything one engine step produced: bytes for the serial TX task,
/// publications for the MQTT task, actions for the runner.
#[derive(Debug, Default)]
pub struct EngineOutput {
    pub serial: Vec<u8>,
    pub publications: Vec<Publication>,
    pub actions: Vec<Action>,
}

impl EngineOutput {
    pub fn is_empty(&self) -> bool {
        self.serial.is_empty() && self.publications.is_empty() && self.actions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PinPending {
    analog: bool,
    pin: u8,
    correlation: Correlation,
    deadline: Instant,
}

/// The routed context: every MPU-side service plus the per-dispatch output
/// buffers the handlers append to.
struct Core {
    datastore: Datastore,
    mailbox: Mailbox,
    files: FileStore,
    processes: ProcessTable,
    console: ConsoleRelay,
    pending_pins: PendingTable<PinPending>,
    authorizer: Authorizer,
    state: StateHandle,
    daemon_version: String,

    publications: Vec<Publication>,
    actions: Vec<Action>,
    flow_requests: Vec<CommandId>,
}

/// The protocol half of the daemon: a pure state machine the async tasks
/// drive. Serial bytes, MQTT requests and timer ticks go in; wire bytes,
/// publications and actions come out.
pub struct Engine {
    link: Link,
    router: Router<Core>,
    core: Core,
    payload_rejections: u64,
    log: logging::Logger,
}

impl Engine {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: &BridgeConfig,
        state: StateHandle,
        log: L,
    ) -> Engine {
        let engine_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        let secret = config
            .serial
            .shared_secret
            .as_ref()
            .map(|secret| SecretKey::from_str(secret));

        let mut link = Link::new(Role::Mpu, secret, Some(&engine_log));
        link.set_timing(LinkTiming {
            ack_timeout: Duration::from_millis(u64::from(config.serial.ack_timeout_ms)),
            retry_limit: config.serial.retry_limit,
            response_timeout: Duration::from_millis(u64::from(config.serial.response_timeout_ms)),
        });

        let mut router = Router::new();
        router.register(CommandFamily::Datastore, DatastoreService);
        router.register(CommandFamily::Mailbox, MailboxService);
        router.register(CommandFamily::File, FileService);
        router.register(CommandFamily::Process, ProcessService);
        router.register(CommandFamily::Console, ConsoleService);
        router.register(CommandFamily::Gpio, GpioTracker);
        router.register(CommandFamily::System, SystemService);

        {
            let mut state = state.borrow_mut();
            state.mqtt_queue_limit = config.mqtt.queue_limit as u64;
            state.console_queue_limit = config.limits.console_queue_limit_bytes as u64;
            state.pending_pin_request_limit = config.limits.pending_pin_request_limit as u64;
            state.process_slots_limit = config.limits.process_slots as u64;
        }

        let core = Core {
            datastore: Datastore::new(),
            mailbox: Mailbox::new(
                config.limits.mailbox_queue_limit,
                config.limits.mailbox_queue_bytes_limit,
            ),
            files: FileStore::new(
                config.files.system_root.clone(),
                config.limits.file_write_max_bytes,
                config.limits.file_storage_quota_bytes,
                Some(&engine_log),
            ),
            processes: ProcessTable::new(config.limits.process_slots),
            console: ConsoleRelay::new(config.limits.console_queue_limit_bytes),
            pending_pins: PendingTable::new(config.limits.pending_pin_request_limit),
            authorizer: Authorizer::new(config.authorize.clone(), config.allowed_commands()),
            state,
            daemon_version: env!("CARGO_PKG_VERSION").to_string(),
            publications: Vec::new(),
            actions: Vec::new(),
            flow_requests: Vec::new(),
        };

        Engine {
            link,
            router,
            core,
            payload_rejections: 0,
            log: engine_log,
        }
    }

    #[inline]
    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    /// Fault the link after a failed crypto self-test.
    pub fn fault_crypto(&mut self) {
        self.link.fault_crypto();
        self.sync_state();
    }

    /// Kick off the handshake towards the MCU.
    pub fn start(&mut self, now: Instant) -> EngineOutput {
        let mut out = EngineOutput::default();
        let link_out = self.link.start_handshake(now);
        self.absorb(link_out, &mut out, now);
        self.finish(out, now)
    }

    /// Bytes arrived from the serial device.
    pub fn handle_serial(&mut self, bytes: &[u8], now: Instant) -> EngineOutput {
        let mut out = EngineOutput::default();
        let link_out = self.link.handle_bytes(bytes, now);
        self.absorb(link_out, &mut out, now);
        self.finish(out, now)
    }

    /// An authorised-or-not MQTT request arrived.
    pub fn handle_request(&mut self, request: InboundRequest, now: Instant) -> EngineOutput {
        let mut out = EngineOutput::default();

        if let Some(action) = request.request.action() {
            if !self.core.authorizer.permits(action) {
                logging::debug!(self.log, "topic action denied"; "action" => action.name());
                self.core.state.borrow_mut().topic_rejections += 1;
                out.publications.push(Publication::request_error(
                    ERR_TOPIC_FORBIDDEN,
                    request.correlation,
                ));
                return self.finish(out, now);
            }
        }

        self.execute_request(request, &mut out, now);
        self.finish(out, now)
    }

    /// Timer tick: ARQ timeouts, console pumping, mailbox publishing,
    /// pending-request expiry and the abandoned-process sweep.
    pub fn tick(&mut self, now: Instant) -> EngineOutput {
        let mut out = EngineOutput::default();

        let link_out = self.link.tick(now);
        self.absorb(link_out, &mut out, now);

        // Expire pin requests whose response never came.
        let expired = self
            .core
            .pending_pins
            .remove_where(|pending| now >= pending.deadline);
        for pending in expired {
            logging::debug!(self.log, "pin request timed out"; "pin" => pending.pin);
            out.publications.push(
                Publication::request_error(ERR_REQUEST_TIMEOUT, pending.correlation)
                    .with_property(PROP_PIN, pending.pin.to_string()),
            );
        }

        // Free exited process slots nobody drains.
        let reaped = self
            .core
            .processes
            .reap_abandoned(timestamp_millis(), ABANDONED_GRACE_MS);
        for pid in reaped {
            logging::debug!(self.log, "abandoned process slot reaped"; "pid" => pid);
        }

        self.finish(out, now)
    }

    /// The process runner streamed output from a child.
    pub fn process_output(&mut self, pid: u16, bytes: &[u8], now: Instant) -> EngineOutput {
        self.core.processes.push_output(pid, bytes);
        self.finish(EngineOutput::default(), now)
    }

    /// The process runner observed a child exit.
    pub fn process_exited(&mut self, pid: u16, exit_code: u8, now: Instant) -> EngineOutput {
        let mut out = EngineOutput::default();

        self.core.processes.mark_exited(pid, exit_code);

        // Sync origins get their completion pushed; async ones wait for the
        // next poll.
        let origin = self.core.processes.get(pid).map(|slot| slot.origin.clone());
        match origin {
            Some(ProcessOrigin::McuSync) => {
                if let Ok(chunk) = self.core.processes.poll(pid, MAX_PAYLOAD_SIZE - 1) {
                    let mut payload = vec![chunk.exit_code];
                    payload.extend_from_slice(&chunk.chunk);
                    self.send_frame(CommandId::ProcessRunResp, &payload, &mut out, now);
                }
            }
            Some(ProcessOrigin::MqttSync(correlation)) => {
                if let Ok(chunk) = self.core.processes.poll(pid, usize::max_value()) {
                    out.publications.push(
                        Publication::new(format!("sh/value/{}", pid), chunk.chunk)
                            .with_property(PROP_PROCESS_PID, pid.to_string())
                            .with_property(PROP_STATUS, format!("exit-{}", chunk.exit_code))
                            .with_correlation(correlation),
                    );
                }
            }
            _ => (),
        }

        self.finish(out, now)
    }

    /// Immediate republish of the summary snapshot.
    pub fn publish_summary(&mut self, now: Instant) -> EngineOutput {
        let mut out = EngineOutput::default();
        out.publications.push(self.summary_publication());
        self.finish(out, now)
    }

    /// Immediate republish of the handshake snapshot.
    pub fn publish_handshake(&mut self, now: Instant) -> EngineOutput {
        let mut out = EngineOutput::default();
        out.publications.push(self.handshake_publication());
        self.finish(out, now)
    }

    fn summary_publication(&mut self) -> Publication {
        let snapshot = self.core.state.borrow_mut().snapshot_json();

        Publication::new(
            "system/bridge/summary/value",
            serde_json::to_vec(&snapshot).unwrap_or_default(),
        )
        .with_property(PROP_STATUS, "ok")
        .retained()
    }

    fn handshake_publication(&mut self) -> Publication {
        let (state_name, successes, tag) = {
            let state = self.core.state.borrow();
            (
                state.link_state.clone(),
                state.handshake_successes,
                state.session_tag_hex.clone(),
            )
        };

        let payload = serde_json::json!({
            "link_state": state_name,
            "handshake_successes": successes,
            "session_tag": tag,
        });

        Publication::new(
            "system/bridge/handshake/value",
            serde_json::to_vec(&payload).unwrap_or_default(),
        )
        .with_property(PROP_STATUS, "ok")
        .retained()
    }

    fn execute_request(&mut self, request: InboundRequest, out: &mut EngineOutput, now: Instant) {
        let InboundRequest {
            request,
            payload,
            correlation,
        } = request;

        match request {
            TopicRequest::PinMode { pin } => {
                let mode = match parse_pin_mode(&payload) {
                    Some(mode) => mode,
                    None => {
                        out.publications
                            .push(Publication::request_error("bad-pin-mode", correlation));
                        return;
                    }
                };
                self.send_frame(CommandId::SetPinMode, &[pin, mode], out, now);
            }
            TopicRequest::DigitalSet { pin } => {
                let level = if matches!(payload.as_slice(), b"1" | b"on" | b"high") { 1 } else { 0 };
                if self.send_frame(CommandId::DigitalWrite, &[pin, level], out, now) {
                    self.core.state.borrow_mut().digital_writes += 1;
                }
            }
            TopicRequest::DigitalGet { pin } => {
                self.queue_pin_read(false, pin, correlation, out, now);
            }
            TopicRequest::AnalogSet { pin } => {
                let value: u16 = match std::str::from_utf8(&payload)
                    .ok()
                    .and_then(|raw| raw.trim().parse().ok())
                {
                    Some(value) => value,
                    None => {
                        out.publications
                            .push(Publication::request_error("bad-analog-value", correlation));
                        return;
                    }
                };
                let mut frame_payload = [pin, 0, 0];
                BigEndian::write_u16(&mut frame_payload[1..3], value);
                if self.send_frame(CommandId::AnalogWrite, &frame_payload, out, now) {
                    self.core.state.borrow_mut().analog_writes += 1;
                }
            }
            TopicRequest::AnalogGet { pin } => {
                self.queue_pin_read(true, pin, correlation, out, now);
            }
            TopicRequest::DatastorePut { key } => {
                self.core.datastore.put(&key, &payload);
                out.publications.push(
                    Publication::new(format!("datastore/get/{}/value", key), payload)
                        .with_property(PROP_DATASTORE_KEY, key.clone())
                        .with_correlation(correlation)
                        .retained(),
                );
            }
            TopicRequest::DatastoreGet { key } => {
                // Resolved purely from the local map; the wire is never
                // involved.
                match self.core.datastore.get(&key) {
                    Some(value) => {
                        out.publications.push(
                            Publication::new(format!("datastore/get/{}/value", key), value.to_vec())
                                .with_property(PROP_DATASTORE_KEY, key.clone())
                                .with_correlation(correlation),
                        );
                    }
                    None => {
                        out.publications.push(
                            Publication::new(format!("datastore/get/{}/value", key), Vec::new())
                                .with_property(PROP_DATASTORE_KEY, key.clone())
                                .with_property(PROP_ERROR, ERR_DATASTORE_MISS)
                                .with_correlation(correlation),
                        );
                    }
                }
            }
            TopicRequest::MailboxIn => match self.core.mailbox.push_to_mcu(payload) {
                Ok(depth) => {
                    out.publications.push(Publication::new(
                        "mailbox/available",
                        depth.to_string().into_bytes(),
                    ));
                }
                Err(error) => {
                    out.publications
                        .push(Publication::request_error(error.reason(), correlation));
                }
            },
            TopicRequest::MailboxAvailable => {
                let depth = self.core.mailbox.available_for_mcu();
                out.publications.push(
                    Publication::new("mailbox/available", depth.to_string().into_bytes())
                        .with_correlation(correlation),
                );
            }
            TopicRequest::FileRead { path } => match self.core.files.read(&path) {
                Ok(data) => {
                    out.publications.push(
                        Publication::new(format!("file/value/{}", path), data)
                            .with_property(PROP_FILE_PATH, path.clone())
                            .with_correlation(correlation),
                    );
                }
                Err(error) => {
                    out.publications.push(
                        Publication::new(format!("file/value/{}", path), Vec::new())
                            .with_property(PROP_FILE_PATH, path.clone())
                            .with_property(PROP_ERROR, error.reason())
                            .with_correlation(correlation),
                    );
                }
            },
            TopicRequest::FileWrite { path } => match self.core.files.write(&path, &payload) {
                Ok(()) => {
                    out.publications.push(
                        Publication::new("system/status", Vec::new())
                            .with_property(PROP_FILE_PATH, path.clone())
                            .with_property(PROP_STATUS, "ok")
                            .with_correlation(correlation),
                    );
                }
                Err(error) => {
                    out.publications.push(
                        Publication::request_error(error.reason(), correlation)
                            .with_property(PROP_FILE_PATH, path.clone()),
                    );
                }
            },
            TopicRequest::FileRemove { path } => match self.core.files.remove(&path) {
                Ok(()) => {
                    out.publications.push(
                        Publication::new("system/status", Vec::new())
                            .with_property(PROP_FILE_PATH, path.clone())
                            .with_property(PROP_STATUS, "ok")
                            .with_correlation(correlation),
                    );
                }
                Err(error) => {
                    out.publications.push(
                        Publication::request_error(error.reason(), correlation)
                            .with_property(PROP_FILE_PATH, path.clone()),
                    );
                }
            },
            TopicRequest::ShellRun => {
                self.spawn_shell(payload, correlation, false, out);
            }
            TopicRequest::ShellRunAsync => {
                self.spawn_shell(payload, correlation, true, out);
            }
            TopicRequest::ShellPoll { pid } => {
                match self.core.processes.poll(pid, 65536) {
                    Ok(chunk) => {
                        let status = if chunk.running {
                            "running".to_string()
                        } else {
                            format!("exit-{}", chunk.exit_code)
                        };
                        out.publications.push(
                            Publication::new(format!("sh/value/{}", pid), chunk.chunk)
                                .with_property(PROP_PROCESS_PID, pid.to_string())
                                .with_property(PROP_STATUS, status)
                                .with_correlation(correlation),
                        );
                    }
                    Err(ProcessError::UnknownPid) => {
                        out.publications.push(
                            Publication::request_error(ERR_UNKNOWN_PID, correlation)
                                .with_property(PROP_PROCESS_PID, pid.to_string()),
                        );
                    }
                    Err(_) => (),
                }
            }
            TopicRequest::ShellKill { pid } => match self.core.processes.request_kill(pid) {
                Ok(()) => {
                    out.actions.push(Action::KillProcess { pid });
                    out.publications.push(
                        Publication::new("system/status", Vec::new())
                            .with_property(PROP_PROCESS_PID, pid.to_string())
                            .with_property(PROP_STATUS, "ok")
                            .with_correlation(correlation),
                    );
                }
                Err(_) => {
                    out.publications.push(
                        Publication::request_error(ERR_UNKNOWN_PID, correlation)
                            .with_property(PROP_PROCESS_PID, pid.to_string()),
                    );
                }
            },
            TopicRequest::ConsoleIn => {
                self.core.console.accept_input(&payload);
            }
            TopicRequest::SummaryGet => {
                let publication = self.summary_publication();
                out.publications.push(publication);
            }
            TopicRequest::HandshakeGet => {
                let publication = self.handshake_publication();
                out.publications.push(publication);
            }
        }
    }

    fn queue_pin_read(
        &mut self,
        analog: bool,
        pin: u8,
        correlation: Correlation,
        out: &mut EngineOutput,
        now: Instant,
    ) {
        let pending = PinPending {
            analog,
            pin,
            correlation: correlation.clone(),
            deadline: now + self.link.timing().response_timeout,
        };

        if self.core.pending_pins.push(pending).is_err() {
            logging::debug!(self.log, "pending pin table full"; "pin" => pin);
            out.publications.push(
                Publication::request_error(ERR_PENDING_PIN_OVERFLOW, correlation)
                    .with_property(PROP_PIN, pin.to_string()),
            );
            return;
        }

        let command = if analog {
            CommandId::AnalogRead
        } else {
            CommandId::DigitalRead
        };

        if self.send_frame(command, &[pin], out, now) {
            let mut state = self.core.state.borrow_mut();
            if analog {
                state.analog_reads += 1;
            } else {
                state.digital_reads += 1;
            }
        }
    }

    fn spawn_shell(
        &mut self,
        payload: Vec<u8>,
        correlation: Correlation,
        run_async: bool,
        out: &mut EngineOutput,
    ) {
        let command_line = match String::from_utf8(payload) {
            Ok(command_line) => command_line,
            Err(_) => {
                out.publications
                    .push(Publication::request_error("bad-command-line", correlation));
                return;
            }
        };

        if command_line.len() > MAX_PAYLOAD_SIZE {
            self.payload_rejections += 1;
            out.publications.push(Publication::request_error(
                ERR_RUN_PAYLOAD_TOO_LARGE,
                correlation,
            ));
            return;
        }

        if !self.core.authorizer.command_allowed(&command_line) {
            self.core.state.borrow_mut().topic_rejections += 1;
            out.publications
                .push(Publication::request_error(ERR_TOPIC_FORBIDDEN, correlation));
            return;
        }

        let origin = if run_async {
            ProcessOrigin::MqttAsync(correlation.clone())
        } else {
            ProcessOrigin::MqttSync(correlation.clone())
        };

        match self.core.processes.allocate(&command_line, origin) {
            Ok(pid) => {
                out.actions.push(Action::SpawnProcess {
                    pid,
                    command_line,
                });
                if run_async {
                    out.publications.push(
                        Publication::new(format!("sh/value/{}", pid), Vec::new())
                            .with_property(PROP_PROCESS_PID, pid.to_string())
                            .with_property(PROP_STATUS, "started")
                            .with_correlation(correlation),
                    );
                }
            }
            Err(error) => {
                out.publications
                    .push(Publication::request_error(error.reason(), correlation));
            }
        }
    }

    /// Send one command over the link, reporting failures on the status
    /// topic. Returns true when the command entered the link (sent or
    /// queued).
    fn send_frame(
        &mut self,
        command: CommandId,
        payload: &[u8],
        out: &mut EngineOutput,
        now: Instant,
    ) -> bool {
        match self.link.send_command(command, payload, now) {
            Ok(link_out) => {
                self.absorb(link_out, out, now);
                true
            }
            Err(error) => {
                logging::warn!(self.log, "command not sent";
                               "command" => command.name(),
                               "error" => error.reason());
                out.publications.push(Publication::request_error(
                    error.reason(),
                    Correlation::default(),
                ));
                false
            }
        }
    }

    /// Fold link output into engine output, dispatching delivered command
    /// frames into the service router.
    fn absorb(&mut self, link_out: tether::link::LinkOutput, out: &mut EngineOutput, now: Instant) {
        for packet in link_out.packets {
            out.serial.extend(packet);
        }

        for event in link_out.events {
            match event {
                LinkEvent::Established => {
                    logging::info!(self.log, "link established with MCU");
                    self.sync_state();
                    // Learn the firmware version straight away.
                    let version_req = self.link.send_command(CommandId::GetVersion, &[], now);
                    if let Ok(link_out) = version_req {
                        for packet in link_out.packets {
                            out.serial.extend(packet);
                        }
                    }
                    out.publications.push(self.handshake_publication());
                }
                LinkEvent::Command(frame) => {
                    self.dispatch(&frame, out, now);
                }
                LinkEvent::SafeState | LinkEvent::Fault(_) => {
                    self.drop_request_state(out);
                }
                LinkEvent::AckConfirmed(_) | LinkEvent::Status { .. } => (),
            }
        }

        // Handlers may have asked for flow-control frames.
        let flow: Vec<CommandId> = self.core.flow_requests.drain(..).collect();
        for command in flow {
            if let Ok(link_out) = self.link.send_command(command, &[], now) {
                for packet in link_out.packets {
                    out.serial.extend(packet);
                }
            }
        }
    }

    fn dispatch(&mut self, frame: &Frame, out: &mut EngineOutput, now: Instant) {
        let outcome = self.router.dispatch(frame, &mut self.core);

        match outcome {
            Outcome::Done => (),
            Outcome::Reply(replies) => {
                for (command, payload) in replies {
                    self.send_frame(command, &payload, out, now);
                }
            }
            Outcome::Fail(code, payload) => {
                let link_out = self.link.send_status(code, &payload);
                for packet in link_out.packets {
                    out.serial.extend(packet);
                }
            }
        }

        out.publications.append(&mut self.core.publications);
        out.actions.append(&mut self.core.actions);
    }

    /// Pump deferred work that depends on link readiness: console chunks
    /// towards the MCU and buffered MCU output towards MQTT.
    fn pump(&mut self, out: &mut EngineOutput, now: Instant) {
        if self.link.state() == LinkState::Idle {
            if let Some(chunk) = self.core.console.next_chunk(MAX_PAYLOAD_SIZE) {
                self.send_frame(CommandId::ConsoleWrite, &chunk, out, now);
            }
        }

        loop {
            let (data, edge) = self.core.console.drain_output(4096);
            if let Some(FlowEdge::Low) = edge {
                self.core.flow_requests.push(CommandId::ConsoleXon);
            }
            if data.is_empty() {
                break;
            }
            out.publications
                .push(Publication::new("console/out", data));
        }

        while let Some(message) = self.core.mailbox.drain_outbound() {
            out.publications
                .push(Publication::new("mailbox/out", message));
        }

        let flow: Vec<CommandId> = self.core.flow_requests.drain(..).collect();
        for command in flow {
            if let Ok(link_out) = self.link.send_command(command, &[], now) {
                for packet in link_out.packets {
                    out.serial.extend(packet);
                }
            }
        }
    }

    fn drop_request_state(&mut self, out: &mut EngineOutput) {
        for pending in self.core.pending_pins.drain_all() {
            out.publications.push(
                Publication::request_error(ERR_LINK_RESET, pending.correlation)
                    .with_property(PROP_PIN, pending.pin.to_string()),
            );
        }

        for pid in self.core.processes.drain_mcu_slots() {
            out.actions.push(Action::KillProcess { pid });
        }

        self.core.console.clear();
    }

    fn finish(&mut self, mut out: EngineOutput, now: Instant) -> EngineOutput {
        self.pump(&mut out, now);
        self.sync_state();
        out
    }

    /// Mirror link and service gauges into the shared runtime state.
    fn sync_state(&mut self) {
        let counters = self.link.counters().clone();
        let mut state = self.core.state.borrow_mut();

        state.link_state = self.link.state().name().to_string();
        state.handshake_successes = counters.handshake_successes;
        state.handshake_failures = counters.handshake_failures;
        state.duplicate_handshakes = counters.duplicate_handshakes;
        state.link_resets = counters.link_resets;
        state.serial_crc_errors = counters.crc_errors;
        state.serial_malformed_errors = counters.malformed_errors;
        state.serial_overflow_errors = counters.overflow_errors;

        state.session_tag_hex = self
            .link
            .session_tag()
            .map(|tag| to_hex(tag))
            .unwrap_or_default();

        state.console_queue_size = self.core.console.queued_bytes() as u64;
        state.console_dropped_chunks = self.core.console.dropped_chunks();
        state.console_rx_bytes = self.core.console.rx_bytes();
        state.console_tx_bytes = self.core.console.tx_bytes();

        state.mailbox_queue_size = self.core.mailbox.available_for_mcu() as u64;
        state.mailbox_out_queue_size = self.core.mailbox.outbound_depth() as u64;
        state.mailbox_truncated_bytes = self.core.mailbox.truncated_bytes();

        state.file_storage_bytes_used = self.core.files.bytes_used();
        state.file_write_limit_rejections = self.core.files.write_limit_rejections();
        state.file_storage_limit_rejections = self.core.files.storage_limit_rejections();

        state.pending_pin_requests = self.core.pending_pins.len() as u64;
        state.pending_pin_overflows = self.core.pending_pins.overflows();

        state.process_slots_used = self.core.processes.slots_used() as u64;
        state.process_rejections = self.core.processes.rejections() + self.payload_rejections;
    }
}

fn parse_pin_mode(payload: &[u8]) -> Option<u8> {
    match payload {
        b"0" | b"input" | b"in" => Some(0),
        b"1" | b"output" | b"out" => Some(1),
        b"2" | b"input_pullup" => Some(2),
        _ => None,
    }
}

struct DatastoreService;

impl Handler<Core> for DatastoreService {
    fn handle(&mut self, command: CommandId, frame: &Frame, core: &mut Core) -> Outcome {
        match command {
            CommandId::DatastorePut => {
                let (key, value) = match split_keyed_payload(&frame.payload) {
                    Some(parts) => parts,
                    None => return Outcome::error(),
                };
                core.datastore.put(&key, value);
                core.publications.push(
                    Publication::new(format!("datastore/get/{}/value", key), value.to_vec())
                        .with_property(PROP_DATASTORE_KEY, key)
                        .retained(),
                );
                Outcome::Done
            }
            CommandId::DatastoreGet => {
                let key = match String::from_utf8(frame.payload.clone()) {
                    Ok(key) => key,
                    Err(_) => return Outcome::error(),
                };
                let mut value = core.datastore.get(&key).map(|v| v.to_vec()).unwrap_or_default();
                value.truncate(MAX_PAYLOAD_SIZE);
                Outcome::reply(CommandId::DatastoreGetResp, value)
            }
            _ => Outcome::Fail(StatusCode::NotImplemented, Vec::new()),
        }
    }
}

struct MailboxService;

impl Handler<Core> for MailboxService {
    fn handle(&mut self, command: CommandId, frame: &Frame, core: &mut Core) -> Outcome {
        match command {
            CommandId::MailboxPush => {
                match core.mailbox.push_from_mcu(frame.payload.clone()) {
                    Ok(_) => Outcome::Done,
                    Err(error) => {
                        Outcome::Fail(StatusCode::Error, error.reason().as_bytes().to_vec())
                    }
                }
            }
            CommandId::MailboxRead => {
                let payload = match core.mailbox.read_for_mcu() {
                    Some(message) => {
                        let mut payload = Vec::with_capacity(message.len() + 1);
                        payload.push(1);
                        payload.extend_from_slice(&message);
                        payload.truncate(MAX_PAYLOAD_SIZE);
                        payload
                    }
                    None => vec![0],
                };
                core.publications.push(Publication::new(
                    "mailbox/available",
                    core.mailbox.available_for_mcu().to_string().into_bytes(),
                ));
                Outcome::reply(CommandId::MailboxReadResp, payload)
            }
            CommandId::MailboxAvailable => {
                let mut payload = vec![0u8; 2];
                BigEndian::write_u16(&mut payload, core.mailbox.available_for_mcu() as u16);
                Outcome::reply(CommandId::MailboxAvailableResp, payload)
            }
            _ => Outcome::Fail(StatusCode::NotImplemented, Vec::new()),
        }
    }
}

struct FileService;

impl Handler<Core> for FileService {
    fn handle(&mut self, command: CommandId, frame: &Frame, core: &mut Core) -> Outcome {
        match command {
            CommandId::FileRead => {
                let path = match String::from_utf8(frame.payload.clone()) {
                    Ok(path) => path,
                    Err(_) => return Outcome::error(),
                };

                match core.files.read(&path) {
                    Ok(data) => {
                        // Chunk the file into successive response frames; the
                        // last carries the terminal flag.
                        let chunk_size = MAX_PAYLOAD_SIZE - 1;
                        let mut replies = Vec::new();

                        if data.is_empty() {
                            replies.push((CommandId::FileReadResp, vec![FILE_CHUNK_LAST]));
                        } else {
                            let chunks: Vec<&[u8]> = data.chunks(chunk_size).collect();
                            let last = chunks.len() - 1;
                            for (index, chunk) in chunks.iter().enumerate() {
                                let flag = if index == last { FILE_CHUNK_LAST } else { 0 };
                                let mut payload = Vec::with_capacity(chunk.len() + 1);
                                payload.push(flag);
                                payload.extend_from_slice(chunk);
                                replies.push((CommandId::FileReadResp, payload));
                            }
                        }

                        Outcome::Reply(replies)
                    }
                    Err(FileError::NotFound) => Outcome::reply(
                        CommandId::FileReadResp,
                        vec![FILE_CHUNK_MISSING | FILE_CHUNK_LAST],
                    ),
                    Err(error) => {
                        Outcome::Fail(StatusCode::Error, error.reason().as_bytes().to_vec())
                    }
                }
            }
            CommandId::FileWrite => {
                let (path, data) = match split_keyed_payload(&frame.payload) {
                    Some(parts) => parts,
                    None => return Outcome::error(),
                };
                match core.files.write(&path, data) {
                    Ok(()) => Outcome::Done,
                    Err(error) => {
                        Outcome::Fail(StatusCode::Error, error.reason().as_bytes().to_vec())
                    }
                }
            }
            CommandId::FileRemove => {
                let path = match String::from_utf8(frame.payload.clone()) {
                    Ok(path) => path,
                    Err(_) => return Outcome::error(),
                };
                match core.files.remove(&path) {
                    Ok(()) => Outcome::Done,
                    Err(error) => {
                        Outcome::Fail(StatusCode::Error, error.reason().as_bytes().to_vec())
                    }
                }
            }
            _ => Outcome::Fail(StatusCode::NotImplemented, Vec::new()),
        }
    }
}

struct ProcessService;

impl Handler<Core> for ProcessService {
    fn handle(&mut self, command: CommandId, frame: &Frame, core: &mut Core) -> Outcome {
        match command {
            CommandId::ProcessRun | CommandId::ProcessRunAsync => {
                let command_line = match String::from_utf8(frame.payload.clone()) {
                    Ok(command_line) => command_line,
                    Err(_) => return Outcome::error(),
                };

                if !core.authorizer.command_allowed(&command_line) {
                    core.state.borrow_mut().topic_rejections += 1;
                    return Outcome::Fail(StatusCode::Error, b"command-not-allowed".to_vec());
                }

                let origin = if command == CommandId::ProcessRun {
                    ProcessOrigin::McuSync
                } else {
                    ProcessOrigin::McuAsync
                };

                match core.processes.allocate(&command_line, origin) {
                    Ok(pid) => {
                        core.actions.push(Action::SpawnProcess { pid, command_line });
                        if command == CommandId::ProcessRunAsync {
                            let mut payload = vec![0u8; 2];
                            BigEndian::write_u16(&mut payload, pid);
                            Outcome::reply(CommandId::ProcessRunAsyncResp, payload)
                        } else {
                            // The response frame follows on exit.
                            Outcome::Done
                        }
                    }
                    Err(error) => {
                        Outcome::Fail(StatusCode::Error, error.reason().as_bytes().to_vec())
                    }
                }
            }
            CommandId::ProcessPoll => {
                if frame.payload.len() != 2 {
                    return Outcome::error();
                }
                let pid = BigEndian::read_u16(&frame.payload);

                match core.processes.poll(pid, MAX_PAYLOAD_SIZE - 4) {
                    Ok(chunk) => {
                        let mut payload = Vec::with_capacity(4 + chunk.chunk.len());
                        payload.extend_from_slice(&frame.payload);
                        payload.push(chunk.running as u8);
                        payload.push(chunk.exit_code);
                        payload.extend_from_slice(&chunk.chunk);
                        Outcome::reply(CommandId::ProcessPollResp, payload)
                    }
                    Err(error) => {
                        Outcome::Fail(StatusCode::Error, error.reason().as_bytes().to_vec())
                    }
                }
            }
            CommandId::ProcessKill => {
                if frame.payload.len() != 2 {
                    return Outcome::error();
                }
                let pid = BigEndian::read_u16(&frame.payload);
                let ok = core.processes.request_kill(pid).is_ok();
                if ok {
                    core.actions.push(Action::KillProcess { pid });
                }

                let mut payload = Vec::with_capacity(3);
                payload.extend_from_slice(&frame.payload);
                payload.push(ok as u8);
                Outcome::reply(CommandId::ProcessKillResp, payload)
            }
            _ => Outcome::Fail(StatusCode::NotImplemented, Vec::new()),
        }
    }
}

struct ConsoleService;

impl Handler<Core> for ConsoleService {
    fn handle(&mut self, command: CommandId, frame: &Frame, core: &mut Core) -> Outcome {
        match command {
            CommandId::ConsoleWrite => {
                if let Some(FlowEdge::High) = core.console.accept_output(&frame.payload) {
                    core.flow_requests.push(CommandId::ConsoleXoff);
                }
                Outcome::Done
            }
            CommandId::ConsoleXoff => {
                core.console.set_mcu_paused(true);
                Outcome::Done
            }
            CommandId::ConsoleXon => {
                core.console.set_mcu_paused(false);
                Outcome::Done
            }
            _ => Outcome::Fail(StatusCode::NotImplemented, Vec::new()),
        }
    }
}

struct GpioTracker;

impl Handler<Core> for GpioTracker {
    fn handle(&mut self, command: CommandId, frame: &Frame, core: &mut Core) -> Outcome {
        let analog = match command {
            CommandId::DigitalReadResp => false,
            CommandId::AnalogReadResp => true,
            // The MCU must not originate GPIO requests towards the MPU.
            _ => return Outcome::Fail(StatusCode::NotImplemented, Vec::new()),
        };

        if frame.payload.len() != 3 {
            return Outcome::error();
        }

        let pin = frame.payload[0];
        let value = BigEndian::read_u16(&frame.payload[1..3]);

        // Responses arrive in request order; take the first entry of the
        // matching kind.
        let mut taken = false;
        let matched = core.pending_pins.remove_where(|pending| {
            if !taken && pending.analog == analog {
                taken = true;
                true
            } else {
                false
            }
        });

        let correlation = matched
            .into_iter()
            .next()
            .map(|pending| pending.correlation)
            .unwrap_or_default();

        let family = if analog { "a" } else { "d" };
        core.publications.push(
            Publication::new(
                format!("{}/{}/value", family, pin),
                value.to_string().into_bytes(),
            )
            .with_property(PROP_PIN, pin.to_string())
            .with_correlation(correlation),
        );

        Outcome::Done
    }
}

struct SystemService;

impl Handler<Core> for SystemService {
    fn handle(&mut self, command: CommandId, frame: &Frame, core: &mut Core) -> Outcome {
        match command {
            CommandId::GetVersionResp => {
                let version = String::from_utf8_lossy(&frame.payload).to_string();
                core.state.borrow_mut().last_mcu_version = version.clone();
                core.publications.push(
                    Publication::new("system/version/value", version.into_bytes())
                        .with_property(PROP_STATUS, "ok")
                        .retained(),
                );
                Outcome::Done
            }
            CommandId::GetCapabilitiesResp | CommandId::GetFreeMemoryResp => Outcome::Done,
            CommandId::GetVersion => {
                Outcome::reply(CommandId::GetVersionResp, core.daemon_version.as_bytes().to_vec())
            }
            CommandId::SetBaudrate => {
                if frame.payload.len() != 4 {
                    return Outcome::error();
                }
                let baud = BigEndian::read_u32(&frame.payload);
                if baud < 1200 || baud > 1_000_000 {
                    return Outcome::error();
                }
                core.actions.push(Action::SetBaudrate { baud });
                Outcome::reply(CommandId::SetBaudrateResp, frame.payload.clone())
            }
            CommandId::SetBaudrateResp => Outcome::Done,
            _ => Outcome::Fail(StatusCode::NotImplemented, Vec::new()),
        }
    }
}

/// Splits `len(u8) | key | rest` payloads.
fn split_keyed_payload(payload: &[u8]) -> Option<(String, &[u8])> {
    let (&key_len, rest) = payload.split_first()?;
    let key_len = key_len as usize;
    if rest.len() < key_len {
        return None;
    }

    let key = String::from_utf8(rest[..key_len].to_vec()).ok()?;
    Some((key, &rest[key_len..]))
}
