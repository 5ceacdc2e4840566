use crate::codec::{encode_command, encode_status, Frame, FrameKind, FrameParser};
use crate::shared::{FaultKind, FrameError, SendError};
use byteorder::{BigEndian, ByteOrder};
use ferrite::crypto::{self, SecretKey};
use ferrite::logging;
use ferrite::spec::{
    CommandId, StatusCode, DEFAULT_ACK_TIMEOUT_MS, DEFAULT_RESPONSE_TIMEOUT_MS,
    DEFAULT_RETRY_LIMIT, HANDSHAKE_NONCE_SIZE, HANDSHAKE_TAG_SIZE, HKDF_LABEL_SESSION,
    HKDF_LABEL_SYNC_RESP, MAX_ACK_TIMEOUT_MS, MAX_RESPONSE_TIMEOUT_MS, MAX_RETRY_LIMIT,
    MIN_ACK_TIMEOUT_MS, MIN_RESPONSE_TIMEOUT_MS, TX_QUEUE_LIMIT,
};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkState {
    Unsynchronized,
    Idle,
    AwaitingAck,
    Fault,
}

impl LinkState {
    pub fn name(self) -> &'static str {
        match self {
            LinkState::Unsynchronized => "UNSYNCHRONIZED",
            LinkState::Idle => "IDLE",
            LinkState::AwaitingAck => "AWAITING_ACK",
            LinkState::Fault => "FAULT",
        }
    }
}

/// Which end of the wire this link instance drives. The MPU initiates the
/// handshake; the MCU answers it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Mpu,
    Mcu,
}

/// Link timing parameters, adoptable at runtime through a LINK_RESET timing
/// payload: `ack_timeout_ms (u16 BE) | retry_limit (u8) | response_timeout_ms
/// (u32 BE)`. Out-of-range payloads are ignored and the previous values kept.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LinkTiming {
    pub ack_timeout: Duration,
    pub retry_limit: u8,
    pub response_timeout: Duration,
}

impl Default for LinkTiming {
    fn default() -> LinkTiming {
        LinkTiming {
            ack_timeout: Duration::from_millis(u64::from(DEFAULT_ACK_TIMEOUT_MS)),
            retry_limit: DEFAULT_RETRY_LIMIT,
            response_timeout: Duration::from_millis(u64::from(DEFAULT_RESPONSE_TIMEOUT_MS)),
        }
    }
}

impl LinkTiming {
    pub const PAYLOAD_SIZE: usize = 7;

    pub fn from_payload(payload: &[u8]) -> Option<LinkTiming> {
        if payload.len() != Self::PAYLOAD_SIZE {
            return None;
        }

        let ack_timeout_ms = BigEndian::read_u16(&payload[0..2]);
        let retry_limit = payload[2];
        let response_timeout_ms = BigEndian::read_u32(&payload[3..7]);

        if ack_timeout_ms < MIN_ACK_TIMEOUT_MS || ack_timeout_ms > MAX_ACK_TIMEOUT_MS {
            return None;
        }
        if retry_limit == 0 || retry_limit > MAX_RETRY_LIMIT {
            return None;
        }
        if response_timeout_ms < MIN_RESPONSE_TIMEOUT_MS
            || response_timeout_ms > MAX_RESPONSE_TIMEOUT_MS
        {
            return None;
        }

        Some(LinkTiming {
            ack_timeout: Duration::from_millis(u64::from(ack_timeout_ms)),
            retry_limit,
            response_timeout: Duration::from_millis(u64::from(response_timeout_ms)),
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = vec![0u8; Self::PAYLOAD_SIZE];
        BigEndian::write_u16(&mut payload[0..2], self.ack_timeout.as_millis() as u16);
        payload[2] = self.retry_limit;
        BigEndian::write_u32(&mut payload[3..7], self.response_timeout.as_millis() as u32);
        payload
    }

    /// Upper bound of the dedup window: a byte-identical frame arriving more
    /// than one ack timeout but at most `retry_limit + 1` timeouts after the
    /// original is a retransmission, not new traffic.
    #[inline]
    fn dedup_upper(&self) -> Duration {
        self.ack_timeout * (u32::from(self.retry_limit) + 1)
    }
}

/// What the link hands to the layer above after consuming input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Handshake completed; the link is in `Idle`.
    Established,
    /// A deduplicated, acknowledged command frame for the service router.
    Command(Frame),
    /// A status frame that is not part of the ARQ conversation.
    Status { code: StatusCode, payload: Vec<u8> },
    /// The peer acknowledged our pending command.
    AckConfirmed(CommandId),
    /// Pending state was dropped: retry exhaustion or a LINK_RESET.
    SafeState,
    /// Terminal or handshake fault.
    Fault(FaultKind),
}

/// Wire-level counters owned by the link. The daemon mirrors these into its
/// runtime state snapshot.
#[derive(Debug, Default, Clone)]
pub struct LinkCounters {
    pub handshake_successes: u64,
    pub handshake_failures: u64,
    pub duplicate_handshakes: u64,
    pub link_resets: u64,
    pub crc_errors: u64,
    pub malformed_errors: u64,
    pub overflow_errors: u64,
    pub rejected_frames: u64,
    pub duplicate_frames: u64,
    pub retransmits: u64,
    pub acks_received: u64,
}

impl LinkCounters {
    #[inline]
    pub fn decode_errors(&self) -> u64 {
        self.crc_errors + self.malformed_errors + self.overflow_errors
    }
}

/// Packets to write to the wire plus events for the service layer, in order.
#[derive(Debug, Default)]
pub struct LinkOutput {
    pub packets: Vec<Vec<u8>>,
    pub events: Vec<LinkEvent>,
}

impl LinkOutput {
    #[inline]
    pub fn new() -> LinkOutput {
        LinkOutput::default()
    }

    #[inline]
    fn packet(&mut self, packet: Vec<u8>) {
        self.packets.push(packet);
    }

    #[inline]
    fn event(&mut self, event: LinkEvent) {
        self.events.push(event);
    }

    pub fn merge(&mut self, mut other: LinkOutput) {
        self.packets.append(&mut other.packets);
        self.events.append(&mut other.events);
    }
}

struct PendingTx {
    packet: Vec<u8>,
    command: CommandId,
    sent_at: Instant,
    retries: u8,
}

/// The stop-and-wait ARQ link with a mutual-authentication handshake. The
/// struct is a pure state machine: callers feed wire bytes and clock ticks
/// in, and write the returned packets out.
pub struct Link {
    role: Role,
    state: LinkState,
    terminal: bool,
    secret: Option<SecretKey>,
    timing: LinkTiming,
    parser: FrameParser,

    pending: Option<PendingTx>,
    tx_queue: VecDeque<(CommandId, Vec<u8>)>,

    // Dedup window state: CRC and arrival time of the last accepted command.
    last_rx: Option<(u32, Instant)>,
    // CRC of the last verified LINK_SYNC, for re-acknowledging replays.
    last_sync_crc: Option<u32>,

    // Outstanding handshake nonce (initiator side).
    nonce: Option<[u8; HANDSHAKE_NONCE_SIZE]>,
    last_sync_at: Option<Instant>,
    session_tag: Option<[u8; HANDSHAKE_TAG_SIZE]>,

    counters: LinkCounters,
    log: logging::Logger,
}

impl Link {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        role: Role,
        secret: Option<SecretKey>,
        log: L,
    ) -> Link {
        let link_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        Link {
            role,
            state: LinkState::Unsynchronized,
            terminal: false,
            secret,
            timing: LinkTiming::default(),
            parser: FrameParser::new(),
            pending: None,
            tx_queue: VecDeque::new(),
            last_rx: None,
            last_sync_crc: None,
            nonce: None,
            last_sync_at: None,
            session_tag: None,
            counters: LinkCounters::default(),
            log: link_log,
        }
    }

    #[inline]
    pub fn state(&self) -> LinkState {
        self.state
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn timing(&self) -> LinkTiming {
        self.timing
    }

    pub fn set_timing(&mut self, timing: LinkTiming) {
        self.timing = timing;
    }

    #[inline]
    pub fn counters(&self) -> &LinkCounters {
        &self.counters
    }

    /// The session tag both sides derive after a verified handshake.
    #[inline]
    pub fn session_tag(&self) -> Option<&[u8; HANDSHAKE_TAG_SIZE]> {
        self.session_tag.as_ref()
    }

    /// Marks the link permanently faulted after a crypto self-test failure.
    pub fn fault_crypto(&mut self) -> LinkOutput {
        let mut out = LinkOutput::new();

        logging::error!(self.log, "crypto self test failed, link faulted");
        self.drop_pending_state();
        self.state = LinkState::Fault;
        self.terminal = true;
        out.event(LinkEvent::Fault(FaultKind::CryptoSelfTest));

        out
    }

    /// Emits a LINK_SYNC carrying a fresh nonce and, with a secret
    /// configured, the truncated `HMAC(secret, nonce)` tag.
    pub fn start_handshake(&mut self, now: Instant) -> LinkOutput {
        let mut out = LinkOutput::new();

        if self.terminal {
            return out;
        }

        let mut nonce = [0u8; HANDSHAKE_NONCE_SIZE];
        crypto::random_bytes(&mut nonce);

        let mut payload = nonce.to_vec();
        if let Some(ref secret) = self.secret {
            payload.extend_from_slice(&sync_tag(secret, &nonce));
        }

        self.nonce = Some(nonce);
        self.last_sync_at = Some(now);

        logging::debug!(self.log, "starting handshake"; "state" => self.state.name());

        out.packet(encode_command(CommandId::LinkSync, &payload).expect("sync payload within bounds"));
        out
    }

    /// Emits a LINK_RESET with the current timing payload and drops all
    /// pending state. The receiver acknowledges, but the reset is not
    /// ARQ-tracked: after a reset only handshake traffic makes sense.
    pub fn reset(&mut self, now: Instant) -> LinkOutput {
        let mut out = LinkOutput::new();

        if self.terminal {
            return out;
        }

        out.packet(
            encode_command(CommandId::LinkReset, &self.timing.to_payload())
                .expect("timing payload within bounds"),
        );

        self.enter_safe_state(&mut out);

        if self.role == Role::Mpu {
            out.merge(self.start_handshake(now));
        }

        out
    }

    /// Feed received wire bytes. Decode errors are counted and answered with
    /// the matching status frame; complete frames run the state machine.
    pub fn handle_bytes(&mut self, bytes: &[u8], now: Instant) -> LinkOutput {
        let mut out = LinkOutput::new();

        for &byte in bytes {
            let step = match self.parser.feed(byte) {
                Some(step) => step,
                None => continue,
            };

            match step {
                Ok(frame) => self.handle_frame(frame, now, &mut out),
                Err(error) => self.handle_decode_error(error, &mut out),
            }
        }

        out
    }

    /// Queue a command for transmission, entering the ARQ when the command
    /// requires acknowledgement.
    pub fn send_command(
        &mut self,
        command: CommandId,
        payload: &[u8],
        now: Instant,
    ) -> Result<LinkOutput, SendError> {
        if self.state != LinkState::Idle && self.state != LinkState::AwaitingAck {
            return Err(SendError::NotReady);
        }

        if !command.requires_ack() {
            let packet = encode_command(command, payload).map_err(|_| SendError::PayloadTooLarge)?;
            let mut out = LinkOutput::new();
            out.packet(packet);
            return Ok(out);
        }

        match self.state {
            LinkState::Idle => {
                let packet =
                    encode_command(command, payload).map_err(|_| SendError::PayloadTooLarge)?;

                logging::trace!(self.log, "sending command, awaiting ack";
                                "command" => command.name());

                self.pending = Some(PendingTx {
                    packet: packet.clone(),
                    command,
                    sent_at: now,
                    retries: 0,
                });
                self.state = LinkState::AwaitingAck;

                let mut out = LinkOutput::new();
                out.packet(packet);
                Ok(out)
            }
            LinkState::AwaitingAck => {
                if payload.len() > ferrite::spec::MAX_PAYLOAD_SIZE {
                    return Err(SendError::PayloadTooLarge);
                }
                if self.tx_queue.len() >= TX_QUEUE_LIMIT {
                    return Err(SendError::QueueFull);
                }
                self.tx_queue.push_back((command, payload.to_vec()));
                Ok(LinkOutput::new())
            }
            _ => unreachable!(),
        }
    }

    /// Emit a status frame. Statuses bypass the ARQ in every state.
    pub fn send_status(&mut self, code: StatusCode, payload: &[u8]) -> LinkOutput {
        let mut out = LinkOutput::new();
        match encode_status(code, payload) {
            Ok(packet) => out.packet(packet),
            Err(_) => {
                logging::warn!(self.log, "status payload exceeded frame bound";
                               "status" => code.name());
            }
        }
        out
    }

    /// Drive timeouts: ACK retransmission, retry exhaustion, and (on the MPU)
    /// handshake re-initiation while unsynchronized.
    pub fn tick(&mut self, now: Instant) -> LinkOutput {
        let mut out = LinkOutput::new();

        if self.terminal {
            return out;
        }

        if self.state == LinkState::AwaitingAck {
            let expired = self
                .pending
                .as_ref()
                .map(|pending| now.duration_since(pending.sent_at) >= self.timing.ack_timeout)
                .unwrap_or(false);

            if expired {
                let retries = self.pending.as_ref().map(|p| p.retries).unwrap_or(0);

                if retries < self.timing.retry_limit {
                    if let Some(ref mut pending) = self.pending {
                        pending.retries += 1;
                        pending.sent_at = now;
                        self.counters.retransmits += 1;

                        logging::debug!(self.log, "ack timeout, retransmitting";
                                        "command" => pending.command.name(),
                                        "retries" => pending.retries);

                        out.packet(pending.packet.clone());
                    }
                } else {
                    logging::warn!(self.log, "retry limit exhausted, entering safe state";
                                   "retries" => retries);
                    self.enter_safe_state(&mut out);
                }
            }
        }

        if self.role == Role::Mpu && self.state == LinkState::Unsynchronized {
            let due = match self.last_sync_at {
                Some(at) => now.duration_since(at) >= self.timing.response_timeout,
                None => true,
            };
            if due {
                out.merge(self.start_handshake(now));
            }
        }

        out
    }

    fn handle_decode_error(&mut self, error: FrameError, out: &mut LinkOutput) {
        match error {
            FrameError::CrcMismatch => self.counters.crc_errors += 1,
            FrameError::Malformed => self.counters.malformed_errors += 1,
            FrameError::Overflow => self.counters.overflow_errors += 1,
        }

        logging::debug!(self.log, "frame decode error"; "error" => ?error);

        out.merge(self.send_status(error.status(), &[]));
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant, out: &mut LinkOutput) {
        match frame.kind() {
            FrameKind::Status(code) => self.handle_status(code, frame.payload, now, out),
            FrameKind::Command(CommandId::LinkSync) => self.handle_sync(frame, out),
            FrameKind::Command(CommandId::LinkSyncResp) => self.handle_sync_resp(frame, out),
            FrameKind::Command(CommandId::LinkReset) => self.handle_reset(frame, out),
            FrameKind::Command(command) => self.handle_command(command, frame, now, out),
            FrameKind::Unknown(id) => {
                if self.state == LinkState::Idle || self.state == LinkState::AwaitingAck {
                    let mut payload = [0u8; 2];
                    BigEndian::write_u16(&mut payload, id);
                    out.merge(self.send_status(StatusCode::CmdUnknown, &payload));
                } else {
                    self.counters.rejected_frames += 1;
                }
            }
        }
    }

    fn handle_status(
        &mut self,
        code: StatusCode,
        payload: Vec<u8>,
        now: Instant,
        out: &mut LinkOutput,
    ) {
        match code {
            StatusCode::Ack => {
                let matches = match (&self.pending, payload.len()) {
                    (Some(pending), 2) => BigEndian::read_u16(&payload) == pending.command as u16,
                    _ => false,
                };

                if !matches {
                    logging::debug!(self.log, "stray ack ignored");
                    return;
                }

                let pending = self.pending.take().expect("checked above");
                self.counters.acks_received += 1;
                self.state = LinkState::Idle;

                logging::trace!(self.log, "ack confirmed"; "command" => pending.command.name());
                out.event(LinkEvent::AckConfirmed(pending.command));

                // Drain exactly one queued follow-up into the ARQ slot.
                if let Some((command, queued_payload)) = self.tx_queue.pop_front() {
                    match self.send_command(command, &queued_payload, now) {
                        Ok(sent) => out.merge(sent),
                        Err(error) => {
                            logging::warn!(self.log, "queued command became unsendable";
                                           "command" => command.name(),
                                           "error" => ?error);
                        }
                    }
                }
            }
            StatusCode::Malformed => {
                // The peer could not parse our last transmission; resend it
                // without waiting for the ack timeout.
                let matches = match (&self.pending, payload.len()) {
                    (Some(pending), 2) => BigEndian::read_u16(&payload) == pending.command as u16,
                    (Some(_), 0) => true,
                    _ => false,
                };

                if !matches {
                    out.event(LinkEvent::Status { code, payload });
                    return;
                }

                let retries = self.pending.as_ref().map(|p| p.retries).unwrap_or(0);
                if retries < self.timing.retry_limit {
                    if let Some(ref mut pending) = self.pending {
                        pending.retries += 1;
                        pending.sent_at = now;
                        self.counters.retransmits += 1;
                        out.packet(pending.packet.clone());
                    }
                } else {
                    self.enter_safe_state(out);
                }
            }
            _ => out.event(LinkEvent::Status { code, payload }),
        }
    }

    fn handle_sync(&mut self, frame: Frame, out: &mut LinkOutput) {
        if self.terminal {
            return;
        }

        // Replayed handshake: re-acknowledge without counting a new success.
        if self.state != LinkState::Unsynchronized && self.last_sync_crc == Some(frame.crc) {
            self.counters.duplicate_handshakes += 1;
            if let Some(packet) = self.sync_response(&frame.payload) {
                out.packet(packet);
            }
            return;
        }

        let nonce = match parse_handshake(&frame.payload) {
            Some((nonce, tag)) => {
                if let Some(ref secret) = self.secret {
                    let expected = sync_tag(secret, &nonce);
                    let verified = match tag {
                        Some(tag) => crypto::ct_eq(&tag, &expected),
                        None => false,
                    };

                    if !verified {
                        self.fail_handshake(out);
                        return;
                    }
                }
                nonce
            }
            None => {
                self.fail_handshake(out);
                return;
            }
        };

        if let Some(packet) = self.sync_response(&frame.payload) {
            out.packet(packet);
        }

        self.drop_pending_state();
        self.state = LinkState::Idle;
        self.last_sync_crc = Some(frame.crc);
        self.session_tag = self.secret.as_ref().map(|secret| session_tag(secret, &nonce));
        self.counters.handshake_successes += 1;

        logging::info!(self.log, "handshake verified, link idle");
        out.event(LinkEvent::Established);
    }

    fn handle_sync_resp(&mut self, frame: Frame, out: &mut LinkOutput) {
        if self.terminal {
            return;
        }

        let our_nonce = match self.nonce {
            Some(nonce) => nonce,
            None => {
                logging::debug!(self.log, "unsolicited sync response dropped");
                self.counters.rejected_frames += 1;
                return;
            }
        };

        let verified = match parse_handshake(&frame.payload) {
            Some((echoed, tag)) => {
                if echoed != our_nonce {
                    false
                } else if let Some(ref secret) = self.secret {
                    let expected = resp_tag(secret, &our_nonce);
                    match tag {
                        Some(tag) => crypto::ct_eq(&tag, &expected),
                        None => false,
                    }
                } else {
                    true
                }
            }
            None => false,
        };

        if !verified {
            self.fail_handshake(out);
            return;
        }

        self.nonce = None;
        self.drop_pending_state();
        self.state = LinkState::Idle;
        self.session_tag = self
            .secret
            .as_ref()
            .map(|secret| session_tag(secret, &our_nonce));
        self.counters.handshake_successes += 1;

        logging::info!(self.log, "handshake response verified, link idle");
        out.event(LinkEvent::Established);
    }

    fn handle_reset(&mut self, frame: Frame, out: &mut LinkOutput) {
        if self.terminal {
            return;
        }

        if !frame.payload.is_empty() {
            match LinkTiming::from_payload(&frame.payload) {
                Some(timing) => {
                    logging::debug!(self.log, "adopting peer timing";
                                    "ack_timeout_ms" => timing.ack_timeout.as_millis() as u64,
                                    "retry_limit" => timing.retry_limit);
                    self.timing = timing;
                }
                None => {
                    logging::warn!(self.log, "out-of-range timing payload ignored");
                }
            }
        }

        self.counters.link_resets += 1;

        let mut ack_payload = [0u8; 2];
        BigEndian::write_u16(&mut ack_payload, CommandId::LinkReset as u16);
        out.merge(self.send_status(StatusCode::Ack, &ack_payload));

        self.enter_safe_state(out);
    }

    fn handle_command(
        &mut self,
        command: CommandId,
        frame: Frame,
        now: Instant,
        out: &mut LinkOutput,
    ) {
        if self.state != LinkState::Idle && self.state != LinkState::AwaitingAck {
            logging::debug!(self.log, "command rejected outside established link";
                            "command" => command.name(),
                            "state" => self.state.name());
            self.counters.rejected_frames += 1;
            return;
        }

        // Dedup window: a byte-identical frame spaced like a retransmission
        // is re-acknowledged, but its side effect is not replayed.
        if let Some((crc, at)) = self.last_rx {
            if crc == frame.crc {
                let elapsed = now.duration_since(at);
                if elapsed > self.timing.ack_timeout && elapsed <= self.timing.dedup_upper() {
                    self.counters.duplicate_frames += 1;
                    if command.requires_ack() {
                        let mut payload = [0u8; 2];
                        BigEndian::write_u16(&mut payload, command as u16);
                        out.merge(self.send_status(StatusCode::Ack, &payload));
                    }
                    logging::debug!(self.log, "duplicate frame re-acknowledged";
                                    "command" => command.name());
                    return;
                }
            }
        }

        self.last_rx = Some((frame.crc, now));

        if command.requires_ack() {
            let mut payload = [0u8; 2];
            BigEndian::write_u16(&mut payload, command as u16);
            out.merge(self.send_status(StatusCode::Ack, &payload));
        }

        out.event(LinkEvent::Command(frame));
    }

    fn fail_handshake(&mut self, out: &mut LinkOutput) {
        self.counters.handshake_failures += 1;
        self.drop_pending_state();
        self.state = LinkState::Fault;

        logging::warn!(self.log, "handshake verification failed, link faulted");
        out.event(LinkEvent::Fault(FaultKind::HandshakeTag));
    }

    fn enter_safe_state(&mut self, out: &mut LinkOutput) {
        self.drop_pending_state();

        if self.state != LinkState::Unsynchronized {
            self.state = LinkState::Unsynchronized;
            out.event(LinkEvent::SafeState);
        }
    }

    fn drop_pending_state(&mut self) {
        self.pending = None;
        self.tx_queue.clear();
        self.last_rx = None;
        if let Some(mut tag) = self.session_tag.take() {
            crypto::wipe(&mut tag);
        }
    }
}

fn parse_handshake(payload: &[u8]) -> Option<([u8; HANDSHAKE_NONCE_SIZE], Option<Vec<u8>>)> {
    if payload.len() != HANDSHAKE_NONCE_SIZE
        && payload.len() != HANDSHAKE_NONCE_SIZE + HANDSHAKE_TAG_SIZE
    {
        return None;
    }

    let mut nonce = [0u8; HANDSHAKE_NONCE_SIZE];
    nonce.copy_from_slice(&payload[..HANDSHAKE_NONCE_SIZE]);

    let tag = if payload.len() > HANDSHAKE_NONCE_SIZE {
        Some(payload[HANDSHAKE_NONCE_SIZE..].to_vec())
    } else {
        None
    };

    Some((nonce, tag))
}

/// `HMAC(secret, nonce)` truncated to the tag length; carried by LINK_SYNC.
fn sync_tag(secret: &SecretKey, nonce: &[u8]) -> [u8; HANDSHAKE_TAG_SIZE] {
    let mut full = [0u8; crypto::HMAC_SHA256_SIZE];
    crypto::hmac_sha256(&mut full, secret, nonce);

    let mut tag = [0u8; HANDSHAKE_TAG_SIZE];
    tag.copy_from_slice(&full[..HANDSHAKE_TAG_SIZE]);
    crypto::wipe(&mut full);
    tag
}

/// HKDF-derived responder tag, distinct from the initiator tag so a replayed
/// LINK_SYNC cannot stand in for a LINK_SYNC_RESP.
fn resp_tag(secret: &SecretKey, nonce: &[u8]) -> [u8; HANDSHAKE_TAG_SIZE] {
    let mut tag = [0u8; HANDSHAKE_TAG_SIZE];
    crypto::hkdf_sha256(&mut tag, secret, nonce, HKDF_LABEL_SYNC_RESP);
    tag
}

/// HKDF-derived session tag recorded by both sides after the handshake.
fn session_tag(secret: &SecretKey, nonce: &[u8]) -> [u8; HANDSHAKE_TAG_SIZE] {
    let mut tag = [0u8; HANDSHAKE_TAG_SIZE];
    crypto::hkdf_sha256(&mut tag, secret, nonce, HKDF_LABEL_SESSION);
    tag
}

impl Link {
    /// Builds the LINK_SYNC_RESP packet answering the supplied sync payload.
    fn sync_response(&self, sync_payload: &[u8]) -> Option<Vec<u8>> {
        let (nonce, _) = parse_handshake(sync_payload)?;

        let mut payload = nonce.to_vec();
        if let Some(ref secret) = self.secret {
            payload.extend_from_slice(&resp_tag(secret, &nonce));
        }

        Some(encode_command(CommandId::LinkSyncResp, &payload).expect("resp payload within bounds"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::parse_single;

    const SECRET: &str = "a-test-shared-secret";

    fn pair() -> (Link, Link) {
        let mpu = Link::new(Role::Mpu, Some(SecretKey::from_str(SECRET)), None);
        let mcu = Link::new(Role::Mcu, Some(SecretKey::from_str(SECRET)), None);
        (mpu, mcu)
    }

    fn shuttle(from: LinkOutput, to: &mut Link, now: Instant) -> LinkOutput {
        let mut out = LinkOutput::new();
        for packet in from.packets {
            out.merge(to.handle_bytes(&packet, now));
        }
        out
    }

    fn establish(mpu: &mut Link, mcu: &mut Link, now: Instant) {
        let sync = mpu.start_handshake(now);
        let resp = shuttle(sync, mcu, now);
        assert_eq!(mcu.state(), LinkState::Idle);
        let done = shuttle(resp, mpu, now);
        assert_eq!(mpu.state(), LinkState::Idle);
        assert!(done.events.contains(&LinkEvent::Established));
    }

    #[test]
    fn test_handshake_establishes_both_sides() {
        let (mut mpu, mut mcu) = pair();
        let now = Instant::now();

        establish(&mut mpu, &mut mcu, now);

        assert_eq!(mpu.counters().handshake_successes, 1);
        assert_eq!(mcu.counters().handshake_successes, 1);
        assert_eq!(mpu.session_tag().unwrap(), mcu.session_tag().unwrap());
    }

    #[test]
    fn test_handshake_without_secret() {
        let mut mpu = Link::new(Role::Mpu, None, None);
        let mut mcu = Link::new(Role::Mcu, None, None);
        let now = Instant::now();

        establish(&mut mpu, &mut mcu, now);
        assert!(mpu.session_tag().is_none());
    }

    #[test]
    fn test_handshake_tag_mutation_faults_verifier() {
        let (mut mpu, mut mcu) = pair();
        let now = Instant::now();

        let sync = mpu.start_handshake(now);
        let mut frame = parse_single(&sync.packets[0]).unwrap().unwrap();

        // Flip one bit of the tag and re-encode.
        let tag_offset = HANDSHAKE_NONCE_SIZE;
        frame.payload[tag_offset] ^= 0x01;
        let mutated = encode_command(CommandId::LinkSync, &frame.payload).unwrap();

        let out = mcu.handle_bytes(&mutated, now);

        assert_eq!(mcu.state(), LinkState::Fault);
        assert!(out.events.contains(&LinkEvent::Fault(FaultKind::HandshakeTag)));
        assert_eq!(mcu.counters().handshake_failures, 1);

        // Non-handshake frames are rejected while faulted.
        let cmd = encode_command(CommandId::GetVersion, &[]).unwrap();
        let out = mcu.handle_bytes(&cmd, now);
        assert!(out.events.is_empty());
        assert_eq!(mcu.counters().rejected_frames, 1);

        // A valid LINK_SYNC recovers the link.
        let sync = mpu.start_handshake(now);
        shuttle(sync, &mut mcu, now);
        assert_eq!(mcu.state(), LinkState::Idle);
    }

    #[test]
    fn test_missing_tag_fails_when_secret_configured() {
        let (_, mut mcu) = pair();
        let now = Instant::now();

        let mut nonce = [7u8; HANDSHAKE_NONCE_SIZE];
        crypto::random_bytes(&mut nonce);
        let bare = encode_command(CommandId::LinkSync, &nonce).unwrap();

        mcu.handle_bytes(&bare, now);
        assert_eq!(mcu.state(), LinkState::Fault);
    }

    #[test]
    fn test_handshake_replay_reacknowledged_once() {
        let (mut mpu, mut mcu) = pair();
        let now = Instant::now();

        let sync = mpu.start_handshake(now);
        let sync_packet = sync.packets[0].clone();
        let resp = shuttle(sync, &mut mcu, now);
        shuttle(resp, &mut mpu, now);

        // Replay the identical LINK_SYNC: a second response goes out, the
        // success counter does not move.
        let replay = mcu.handle_bytes(&sync_packet, now);
        assert_eq!(replay.packets.len(), 1);
        assert!(replay.events.is_empty());
        assert_eq!(mcu.counters().handshake_successes, 1);
        assert_eq!(mcu.counters().duplicate_handshakes, 1);
    }

    #[test]
    fn test_commands_rejected_before_handshake() {
        let (_, mut mcu) = pair();
        let now = Instant::now();

        let cmd = encode_command(CommandId::DigitalWrite, &[13, 1]).unwrap();
        let out = mcu.handle_bytes(&cmd, now);

        assert!(out.events.is_empty());
        assert!(out.packets.is_empty());
        assert_eq!(mcu.counters().rejected_frames, 1);
    }

    #[test]
    fn test_stop_and_wait_holds_second_command() {
        let (mut mpu, mut mcu) = pair();
        let now = Instant::now();
        establish(&mut mpu, &mut mcu, now);

        let first = mpu.send_command(CommandId::DigitalWrite, &[13, 1], now).unwrap();
        assert_eq!(first.packets.len(), 1);
        assert_eq!(mpu.state(), LinkState::AwaitingAck);

        // The follow-up is queued, not emitted.
        let second = mpu.send_command(CommandId::DigitalWrite, &[12, 0], now).unwrap();
        assert!(second.packets.is_empty());

        // The ACK releases exactly the queued command.
        let acks = shuttle(first, &mut mcu, now);
        let drained = shuttle(acks, &mut mpu, now);

        assert!(drained
            .events
            .contains(&LinkEvent::AckConfirmed(CommandId::DigitalWrite)));
        assert_eq!(drained.packets.len(), 1);
        assert_eq!(mpu.state(), LinkState::AwaitingAck);
    }

    #[test]
    fn test_tx_queue_bounded() {
        let (mut mpu, mut mcu) = pair();
        let now = Instant::now();
        establish(&mut mpu, &mut mcu, now);

        mpu.send_command(CommandId::DigitalWrite, &[1, 1], now).unwrap();
        for pin in 0..TX_QUEUE_LIMIT as u8 {
            mpu.send_command(CommandId::DigitalWrite, &[pin, 0], now).unwrap();
        }

        assert_eq!(
            mpu.send_command(CommandId::DigitalWrite, &[9, 0], now).unwrap_err(),
            SendError::QueueFull
        );
    }

    #[test]
    fn test_retransmit_then_safe_state() {
        let (mut mpu, mut mcu) = pair();
        let now = Instant::now();
        establish(&mut mpu, &mut mcu, now);

        mpu.send_command(CommandId::DigitalWrite, &[13, 1], now).unwrap();
        let timing = mpu.timing();

        let mut at = now;
        for retry in 1..=timing.retry_limit {
            at += timing.ack_timeout;
            let out = mpu.tick(at);
            assert_eq!(out.packets.len(), 1, "retry {} should retransmit", retry);
            assert_eq!(mpu.state(), LinkState::AwaitingAck);
        }

        // One more timeout exhausts the budget and drops to the safe state.
        at += timing.ack_timeout;
        let out = mpu.tick(at);
        assert!(out.events.contains(&LinkEvent::SafeState));
        assert_eq!(mpu.state(), LinkState::Unsynchronized);
        assert_eq!(mpu.counters().retransmits, u64::from(timing.retry_limit));
    }

    #[test]
    fn test_no_command_emitted_until_ack_or_reset() {
        let (mut mpu, mut mcu) = pair();
        let now = Instant::now();
        establish(&mut mpu, &mut mcu, now);

        mpu.send_command(CommandId::DigitalWrite, &[13, 1], now).unwrap();
        let queued = mpu.send_command(CommandId::SetPinMode, &[13, 1], now).unwrap();

        // Nothing leaves the link while the ack is outstanding.
        assert!(queued.packets.is_empty());
        let idle_tick = mpu.tick(now + Duration::from_millis(1));
        assert!(idle_tick.packets.is_empty());
    }

    #[test]
    fn test_dedup_reacks_without_second_event() {
        let (mut mpu, mut mcu) = pair();
        let now = Instant::now();
        establish(&mut mpu, &mut mcu, now);

        let send = mpu.send_command(CommandId::DigitalWrite, &[13, 1], now).unwrap();
        let packet = send.packets[0].clone();

        let first = mcu.handle_bytes(&packet, now);
        assert_eq!(
            first
                .events
                .iter()
                .filter(|event| matches!(event, LinkEvent::Command(_)))
                .count(),
            1
        );
        assert_eq!(first.packets.len(), 1); // the ACK

        // Replay one ack-timeout later, as a retransmission would arrive.
        let later = now + mcu.timing().ack_timeout + Duration::from_millis(1);
        let second = mcu.handle_bytes(&packet, later);

        assert!(second.events.is_empty());
        assert_eq!(second.packets.len(), 1); // re-ACK only
        assert_eq!(mcu.counters().duplicate_frames, 1);
    }

    #[test]
    fn test_dedup_window_expires() {
        let (mut mpu, mut mcu) = pair();
        let now = Instant::now();
        establish(&mut mpu, &mut mcu, now);

        let send = mpu.send_command(CommandId::DigitalWrite, &[13, 1], now).unwrap();
        let packet = send.packets[0].clone();

        mcu.handle_bytes(&packet, now);

        // Beyond the window the same bytes are a fresh command again.
        let timing = mcu.timing();
        let past_window = now + timing.ack_timeout * (u32::from(timing.retry_limit) + 2);
        let replay = mcu.handle_bytes(&packet, past_window);

        assert_eq!(
            replay
                .events
                .iter()
                .filter(|event| matches!(event, LinkEvent::Command(_)))
                .count(),
            1
        );
    }

    #[test]
    fn test_peer_malformed_triggers_immediate_retransmit() {
        let (mut mpu, mut mcu) = pair();
        let now = Instant::now();
        establish(&mut mpu, &mut mcu, now);

        mpu.send_command(CommandId::DigitalWrite, &[13, 1], now).unwrap();

        let mut payload = [0u8; 2];
        BigEndian::write_u16(&mut payload, CommandId::DigitalWrite as u16);
        let nak = encode_status(StatusCode::Malformed, &payload).unwrap();

        let out = mpu.handle_bytes(&nak, now);
        assert_eq!(out.packets.len(), 1);
        assert_eq!(mpu.counters().retransmits, 1);
        assert_eq!(mpu.state(), LinkState::AwaitingAck);
    }

    #[test]
    fn test_link_reset_drops_pending_and_acks() {
        let (mut mpu, mut mcu) = pair();
        let now = Instant::now();
        establish(&mut mpu, &mut mcu, now);

        mcu.send_command(CommandId::ConsoleWrite, b"hold", now).unwrap();
        assert_eq!(mcu.state(), LinkState::AwaitingAck);

        let reset = encode_command(CommandId::LinkReset, &[]).unwrap();
        let out = mcu.handle_bytes(&reset, now);

        assert_eq!(mcu.state(), LinkState::Unsynchronized);
        assert!(out.events.contains(&LinkEvent::SafeState));
        assert_eq!(out.packets.len(), 1); // the ACK
        assert_eq!(mcu.counters().link_resets, 1);
    }

    #[test]
    fn test_reset_timing_payload_adopted_and_validated() {
        let (_, mut mcu) = pair();
        let now = Instant::now();

        let timing = LinkTiming {
            ack_timeout: Duration::from_millis(100),
            retry_limit: 5,
            response_timeout: Duration::from_millis(2000),
        };
        let reset = encode_command(CommandId::LinkReset, &timing.to_payload()).unwrap();
        mcu.handle_bytes(&reset, now);
        assert_eq!(mcu.timing(), timing);

        // Out-of-range values are ignored and the adopted timing kept.
        let mut bogus = timing.to_payload();
        BigEndian::write_u16(&mut bogus[0..2], 1); // below the minimum
        let reset = encode_command(CommandId::LinkReset, &bogus).unwrap();
        mcu.handle_bytes(&reset, now);
        assert_eq!(mcu.timing(), timing);
    }

    #[test]
    fn test_crc_error_counted_and_answered() {
        let (mut mpu, mut mcu) = pair();
        let now = Instant::now();
        establish(&mut mpu, &mut mcu, now);

        let send = mpu.send_command(CommandId::ConsoleWrite, b"Hi", now).unwrap();
        let mut packet = send.packets[0].clone();

        // Flip a payload bit; COBS survives, the CRC does not.
        packet[7] ^= 0x01;
        let out = mcu.handle_bytes(&packet, now);

        assert_eq!(mcu.counters().crc_errors, 1);
        assert!(out.events.is_empty());
        assert_eq!(out.packets.len(), 1);

        let status = parse_single(&out.packets[0]).unwrap().unwrap();
        assert_eq!(status.kind(), FrameKind::Status(StatusCode::CrcMismatch));
    }

    #[test]
    fn test_crypto_fault_is_terminal() {
        let (mut mpu, mut mcu) = pair();
        let now = Instant::now();

        mcu.fault_crypto();
        assert_eq!(mcu.state(), LinkState::Fault);

        // Even a valid handshake cannot recover a crypto fault.
        let sync = mpu.start_handshake(now);
        let out = shuttle(sync, &mut mcu, now);
        assert!(out.packets.is_empty());
        assert_eq!(mcu.state(), LinkState::Fault);
    }

    #[test]
    fn test_unknown_command_answered_when_idle() {
        let (mut mpu, mut mcu) = pair();
        let now = Instant::now();
        establish(&mut mpu, &mut mcu, now);

        let unknown = crate::codec::encode_frame(0x0666, &[]).unwrap();
        let out = mcu.handle_bytes(&unknown, now);

        let status = parse_single(&out.packets[0]).unwrap().unwrap();
        assert_eq!(status.kind(), FrameKind::Status(StatusCode::CmdUnknown));
        assert_eq!(BigEndian::read_u16(&status.payload), 0x0666);
    }

    #[test]
    fn test_mpu_auto_resync_paced_by_response_timeout() {
        let (mut mpu, _) = pair();
        let now = Instant::now();

        let first = mpu.tick(now);
        assert_eq!(first.packets.len(), 1);

        // Too early: no duplicate sync.
        let early = mpu.tick(now + Duration::from_millis(10));
        assert!(early.packets.is_empty());

        let due = mpu.tick(now + mpu.timing().response_timeout);
        assert_eq!(due.packets.len(), 1);
    }
}
