//! End-to-end scenarios: the daemon engine on one side, the MCU bridge model
//! on the other, glued by an in-memory wire.

use bridged::config::BridgeConfig;
use bridged::engine::{Action, Engine, EngineOutput};
use bridged::pubsub::{Correlation, InboundRequest, Publication};
use bridged::state::RuntimeState;
use bridged::topics;
use byteorder::{BigEndian, ByteOrder};
use ferrite::crypto::{self, SecretKey};
use ferrite::spec::{CommandId, StatusCode, PROTOCOL_VERSION};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tether::codec::{encode_command, FrameKind, FrameParser};
use tether::link::LinkState;
use tether::mcu::{McuBridge, McuConfig, SimPins};

const SECRET: &str = "integration-test-secret";

struct Harness {
    engine: Engine,
    mcu: McuBridge<SimPins>,
    state: Rc<RefCell<RuntimeState>>,
    now: Instant,
    _dir: tempfile::TempDir,
}

fn test_config(dir: &std::path::Path, open_authorize: bool, pin_limit: usize) -> BridgeConfig {
    let authorize = if open_authorize {
        r#"
            [authorize]
            allow_file_read = true
            allow_file_write = true
            allow_file_remove = true
            allow_datastore_get = true
            allow_datastore_put = true
            allow_mailbox_read = true
            allow_mailbox_write = true
            allow_shell_run = true
            allow_shell_run_async = true
            allow_shell_poll = true
            allow_shell_kill = true
            allow_console_input = true
            allow_digital_read = true
            allow_digital_write = true
            allow_digital_mode = true
            allow_analog_read = true
            allow_analog_write = true
            allowed_commands = "*"
        "#
    } else {
        ""
    };

    let raw = format!(
        r#"
            [serial]
            port = "/dev/ttyTEST"
            shared_secret = "{secret}"

            [mqtt]
            host = "localhost"
            spool_dir = "{dir}/spool"

            [limits]
            pending_pin_request_limit = {pin_limit}
            console_queue_limit_bytes = 64

            [files]
            system_root = "{dir}/files"

            [status]
            snapshot_path = "{dir}/status.json"
            allow_non_tmp_paths = true
            {authorize}
        "#,
        secret = SECRET,
        dir = dir.display(),
        pin_limit = pin_limit,
        authorize = authorize,
    );

    BridgeConfig::from_toml_str(&raw).unwrap()
}

impl Harness {
    fn new() -> Harness {
        Harness::with_options(true, 2)
    }

    fn with_options(open_authorize: bool, pin_limit: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), open_authorize, pin_limit);

        let state = Rc::new(RefCell::new(RuntimeState::new()));
        let engine = Engine::new(&config, state.clone(), None);

        let mcu = McuBridge::new(
            McuConfig {
                version: "9.9.9".to_string(),
                ..McuConfig::default()
            },
            SimPins::new(),
            Some(SecretKey::from_str(SECRET)),
            None,
        );

        Harness {
            engine,
            mcu,
            state,
            now: Instant::now(),
            _dir: dir,
        }
    }

    /// Ping-pong engine serial output against the MCU until the wire is
    /// quiet, accumulating publications and actions.
    fn shuttle(&mut self, mut output: EngineOutput) -> (Vec<Publication>, Vec<Action>) {
        let mut publications = Vec::new();
        let mut actions = Vec::new();

        for _ in 0..16 {
            publications.append(&mut output.publications);
            actions.append(&mut output.actions);

            if output.serial.is_empty() {
                break;
            }

            let mcu_bytes = self.mcu.receive(&output.serial, self.now);
            if mcu_bytes.is_empty() {
                break;
            }
            output = self.engine.handle_serial(&mcu_bytes, self.now);
        }

        publications.append(&mut output.publications);
        actions.append(&mut output.actions);
        (publications, actions)
    }

    fn establish(&mut self) {
        let start = self.engine.start(self.now);
        self.shuttle(start);
        assert_eq!(self.engine.link_state(), LinkState::Idle);
        assert_eq!(self.mcu.link().state(), LinkState::Idle);
    }

    fn request(&mut self, topic: &str, payload: &[u8]) -> (Vec<Publication>, Vec<Action>) {
        self.request_with(topic, payload, Correlation::default())
    }

    fn request_with(
        &mut self,
        topic: &str,
        payload: &[u8],
        correlation: Correlation,
    ) -> (Vec<Publication>, Vec<Action>) {
        let request = InboundRequest {
            request: topics::parse(topic).unwrap_or_else(|| panic!("unparsable topic {}", topic)),
            payload: payload.to_vec(),
            correlation,
        };
        let output = self.engine.handle_request(request, self.now);
        self.shuttle(output)
    }
}

fn frames_of(wire: &[u8]) -> Vec<tether::codec::Frame> {
    let mut parser = FrameParser::new();
    let mut frames = Vec::new();
    for &byte in wire {
        if let Some(Ok(frame)) = parser.feed(byte) {
            frames.push(frame);
        }
    }
    frames
}

fn property<'a>(publication: &'a Publication, key: &str) -> Option<&'a str> {
    publication
        .properties
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[test]
fn e1_gpio_write_round_trip() {
    let mut harness = Harness::new();
    harness.establish();

    let before = harness.state.borrow().digital_writes;
    harness.request("d/13/set", b"1");

    assert_eq!(harness.mcu.pins().level(13), Some(1));
    assert_eq!(harness.mcu.pins().digital_writes, 1);
    assert_eq!(harness.state.borrow().digital_writes, before + 1);

    // The ACK round-trip freed the link for the next command.
    assert_eq!(harness.engine.link_state(), LinkState::Idle);
}

#[test]
fn e2_gpio_read_publishes_value_with_correlation() {
    let mut harness = Harness::new();
    harness.establish();
    harness.mcu.pins_mut().prime_digital(7, 1);

    let correlation = Correlation {
        response_topic: Some("client/reply".to_string()),
        correlation_data: Some(vec![0xca, 0xfe]),
    };
    let (publications, _) = harness.request_with("d/7/get", b"", correlation.clone());

    let value = publications
        .iter()
        .find(|publication| publication.topic == "d/7/value")
        .expect("value publication");

    assert_eq!(value.payload, b"1");
    assert_eq!(property(value, "bridge-pin"), Some("7"));
    assert_eq!(value.correlation, correlation);
}

#[test]
fn e3_handshake_replay_counted_once() {
    let mut harness = Harness::new();

    // Craft a LINK_SYNC the way the MCU would.
    let mut nonce = [0u8; 16];
    crypto::random_bytes(&mut nonce);
    let secret = SecretKey::from_str(SECRET);
    let mut tag = [0u8; 32];
    crypto::hmac_sha256(&mut tag, &secret, &nonce);

    let mut payload = nonce.to_vec();
    payload.extend_from_slice(&tag[..16]);
    let sync = encode_command(CommandId::LinkSync, &payload).unwrap();

    let first = harness.engine.handle_serial(&sync, harness.now);
    let first_resp = frames_of(&first.serial);
    assert!(first_resp
        .iter()
        .any(|frame| frame.kind() == FrameKind::Command(CommandId::LinkSyncResp)));
    assert_eq!(harness.engine.link_state(), LinkState::Idle);
    assert_eq!(harness.state.borrow().handshake_successes, 1);

    // Byte-identical replay: answered again, counted as a duplicate.
    let second = harness.engine.handle_serial(&sync, harness.now);
    let second_resp = frames_of(&second.serial);
    assert!(second_resp
        .iter()
        .any(|frame| frame.kind() == FrameKind::Command(CommandId::LinkSyncResp)));
    assert_eq!(harness.state.borrow().handshake_successes, 1);
    assert_eq!(harness.state.borrow().duplicate_handshakes, 1);
}

#[test]
fn e4_crc_corruption_rejected_without_side_effect() {
    let mut harness = Harness::new();
    harness.establish();

    // A valid CONSOLE_WRITE "Hi" frame with the low bit of the first CRC
    // byte flipped.
    let mut raw = Vec::new();
    raw.push(PROTOCOL_VERSION);
    raw.extend_from_slice(&2u16.to_be_bytes());
    raw.extend_from_slice(&(CommandId::ConsoleWrite as u16).to_be_bytes());
    raw.extend_from_slice(b"Hi");
    let crc = tether::codec::FRAME_CRC.checksum(&raw) ^ 0x0100_0000;
    raw.extend_from_slice(&crc.to_be_bytes());

    let mut packet = vec![0u8; corncobs_max(raw.len())];
    let encoded = corncobs_encode(&raw, &mut packet);
    packet.truncate(encoded);

    let output = harness.engine.handle_serial(&packet, harness.now);

    let status = frames_of(&output.serial);
    assert!(status
        .iter()
        .any(|frame| frame.kind() == FrameKind::Status(StatusCode::CrcMismatch)));
    assert_eq!(harness.state.borrow().serial_crc_errors, 1);
    assert_eq!(harness.state.borrow().console_rx_bytes, 0);
}

// The test encodes packets the same way the codec does, without reaching
// into its internals.
fn corncobs_max(len: usize) -> usize {
    len + len / 254 + 2
}

fn corncobs_encode(raw: &[u8], out: &mut [u8]) -> usize {
    // COBS with a trailing delimiter, enough for test-sized frames.
    let mut result = Vec::new();
    for block in raw.split(|&byte| byte == 0) {
        result.push(block.len() as u8 + 1);
        result.extend_from_slice(block);
    }
    result.push(0);
    out[..result.len()].copy_from_slice(&result);
    result.len()
}

#[test]
fn e5_pending_pin_overflow() {
    let mut harness = Harness::with_options(true, 2);
    harness.establish();

    // Three distinct reads with no response in between: the serial bytes
    // must carry exactly two DIGITAL_READ frames.
    let mut read_frames = 0;
    let mut overflow_seen = false;

    for pin in [2u8, 3, 4].iter() {
        let topic = format!("d/{}/get", pin);
        let request = InboundRequest {
            request: topics::parse(&topic).unwrap(),
            payload: Vec::new(),
            correlation: Correlation::default(),
        };
        let output = harness.engine.handle_request(request, harness.now);

        read_frames += frames_of(&output.serial)
            .iter()
            .filter(|frame| frame.kind() == FrameKind::Command(CommandId::DigitalRead))
            .count();

        overflow_seen |= output.publications.iter().any(|publication| {
            property(publication, "bridge-error") == Some("pending-pin-overflow")
        });
    }

    assert_eq!(read_frames, 2);
    assert!(overflow_seen);
    assert_eq!(harness.state.borrow().pending_pin_overflows, 1);
    assert_eq!(harness.state.borrow().pending_pin_requests, 2);
}

#[test]
fn e6_baudrate_change_keeps_link_alive() {
    let mut harness = Harness::new();
    harness.establish();

    // 57600 big-endian, sent by the MCU.
    let request = encode_command(CommandId::SetBaudrate, &[0x00, 0x00, 0xE1, 0x00]).unwrap();
    let output = harness.engine.handle_serial(&request, harness.now);

    let frames = frames_of(&output.serial);
    let resp = frames
        .iter()
        .find(|frame| frame.kind() == FrameKind::Command(CommandId::SetBaudrateResp))
        .expect("baudrate response");
    assert_eq!(BigEndian::read_u32(&resp.payload), 57600);

    assert!(output
        .actions
        .iter()
        .any(|action| *action == Action::SetBaudrate { baud: 57600 }));

    // After the switch window a version query still round-trips.
    harness.now += Duration::from_millis(60);
    let query = encode_command(CommandId::GetVersion, &[]).unwrap();
    let output = harness.engine.handle_serial(&query, harness.now);
    let frames = frames_of(&output.serial);
    assert!(frames
        .iter()
        .any(|frame| frame.kind() == FrameKind::Command(CommandId::GetVersionResp)));
}

#[test]
fn deny_by_default_rejects_all_sensitive_topics() {
    let mut harness = Harness::with_options(false, 2);
    harness.establish();

    let topics = [
        ("d/13/set", &b"1"[..]),
        ("d/7/get", b""),
        ("d/2/mode", b"output"),
        ("a/5/set", b"128"),
        ("a/5/get", b""),
        ("datastore/put/key", b"v"),
        ("datastore/get/key/request", b""),
        ("mailbox/in", b"msg"),
        ("mailbox/available", b""),
        ("file/read/etc/motd", b""),
        ("file/write/x", b"data"),
        ("file/remove/x", b""),
        ("sh/run", b"ls"),
        ("sh/run_async", b"ls"),
        ("sh/poll/1", b""),
        ("sh/kill/1", b""),
        ("console/in", b"text"),
    ];

    for (index, (topic, payload)) in topics.iter().enumerate() {
        let (publications, actions) = harness.request(topic, payload);

        assert!(actions.is_empty(), "{} must not act", topic);
        let rejected = publications.iter().any(|publication| {
            property(publication, "bridge-error") == Some("topic-action-forbidden")
        });
        assert!(rejected, "{} must be rejected", topic);
        assert_eq!(harness.state.borrow().topic_rejections, index as u64 + 1);
    }

    // Nothing reached the MCU.
    assert_eq!(harness.mcu.pins().digital_writes, 0);
}

#[test]
fn datastore_round_trip_stays_local() {
    let mut harness = Harness::new();
    harness.establish();

    let (_, _) = harness.request("datastore/put/answer", b"42");

    let (publications, _) = harness.request("datastore/get/answer/request", b"");
    let value = publications
        .iter()
        .find(|publication| publication.topic == "datastore/get/answer/value")
        .expect("value publication");
    assert_eq!(value.payload, b"42");

    // A miss reports datastore-miss with an empty payload.
    let (publications, _) = harness.request("datastore/get/missing/request", b"");
    let miss = publications
        .iter()
        .find(|publication| publication.topic == "datastore/get/missing/value")
        .expect("miss publication");
    assert!(miss.payload.is_empty());
    assert_eq!(property(miss, "bridge-error"), Some("datastore-miss"));
}

#[test]
fn mcu_datastore_get_never_touches_mqtt() {
    let mut harness = Harness::new();
    harness.establish();

    harness.request("datastore/put/shared", b"value-for-mcu");

    // The MCU asks over the wire and gets the stored value back.
    let request = harness.mcu.datastore_get("shared", harness.now);
    let output = harness.engine.handle_serial(&request, harness.now);
    let frames = frames_of(&output.serial);
    let resp = frames
        .iter()
        .find(|frame| frame.kind() == FrameKind::Command(CommandId::DatastoreGetResp))
        .expect("wire response");
    assert_eq!(resp.payload, b"value-for-mcu");
}

#[test]
fn mailbox_read_drains_in_order_and_republishes_depth() {
    let mut harness = Harness::new();
    harness.establish();

    harness.request("mailbox/in", b"first");
    harness.request("mailbox/in", b"second");
    assert_eq!(harness.state.borrow().mailbox_queue_size, 2);

    let read = harness.mcu.mailbox_read(harness.now);
    let output = harness.engine.handle_serial(&read, harness.now);

    let frames = frames_of(&output.serial);
    let resp = frames
        .iter()
        .find(|frame| frame.kind() == FrameKind::Command(CommandId::MailboxReadResp))
        .expect("read response");
    assert_eq!(resp.payload, b"\x01first");

    let depth = output
        .publications
        .iter()
        .find(|publication| publication.topic == "mailbox/available")
        .expect("depth publication");
    assert_eq!(depth.payload, b"1");
}

#[test]
fn mcu_console_output_reaches_publications() {
    let mut harness = Harness::new();
    harness.establish();

    harness.mcu.console_write(b"hello mqtt");
    let wire = harness.mcu.poll(harness.now);
    let output = harness.engine.handle_serial(&wire, harness.now);

    let console = output
        .publications
        .iter()
        .find(|publication| publication.topic == "console/out")
        .expect("console publication");
    assert_eq!(console.payload, b"hello mqtt");
}

#[test]
fn file_write_quota_and_read_back() {
    let mut harness = Harness::new();
    harness.establish();

    let (publications, _) = harness.request("file/write/notes/a.txt", b"hello file");
    assert!(publications
        .iter()
        .any(|publication| property(publication, "bridge-status") == Some("ok")));
    assert_eq!(harness.state.borrow().file_storage_bytes_used, 10);

    let (publications, _) = harness.request("file/read/notes/a.txt", b"");
    let value = publications
        .iter()
        .find(|publication| publication.topic == "file/value/notes/a.txt")
        .expect("file value");
    assert_eq!(value.payload, b"hello file");

    // Missing files surface a per-request error, not a fault.
    let (publications, _) = harness.request("file/read/notes/missing.txt", b"");
    let missing = publications
        .iter()
        .find(|publication| publication.topic == "file/value/notes/missing.txt")
        .expect("missing value");
    assert_eq!(property(missing, "bridge-error"), Some("file-not-found"));
}

#[test]
fn shell_run_payload_cap_enforced() {
    let mut harness = Harness::new();
    harness.establish();

    let long = vec![b'x'; 300];
    let (publications, actions) = harness.request("sh/run", &long);

    assert!(actions.is_empty());
    assert!(publications.iter().any(|publication| {
        property(publication, "bridge-error") == Some("process_run_payload_too_large")
    }));
    assert_eq!(harness.state.borrow().process_rejections, 1);
}

#[test]
fn shell_run_spawns_and_completion_publishes() {
    let mut harness = Harness::new();
    harness.establish();

    let (_, actions) = harness.request("sh/run", b"echo done");
    let (pid, command_line) = match actions.as_slice() {
        [Action::SpawnProcess { pid, command_line }] => (*pid, command_line.clone()),
        other => panic!("expected a spawn action, got {:?}", other),
    };
    assert_eq!(command_line, "echo done");

    // The runner reports output and exit; completion publishes once.
    harness.engine.process_output(pid, b"done\n", harness.now);
    let output = harness.engine.process_exited(pid, 0, harness.now);

    let result = output
        .publications
        .iter()
        .find(|publication| publication.topic == format!("sh/value/{}", pid))
        .expect("completion publication");
    assert_eq!(result.payload, b"done\n");
    assert_eq!(property(result, "bridge-status"), Some("exit-0"));
    assert_eq!(harness.state.borrow().process_slots_used, 0);
}

#[test]
fn shell_poll_unknown_pid_reports_error() {
    let mut harness = Harness::new();
    harness.establish();

    let (publications, _) = harness.request("sh/poll/99", b"");
    assert!(publications
        .iter()
        .any(|publication| property(publication, "bridge-error") == Some("unknown-pid")));
}

#[test]
fn link_reset_drops_pending_pin_requests() {
    let mut harness = Harness::new();
    harness.establish();

    // Queue a read, then reset the link before any response.
    let request = InboundRequest {
        request: topics::parse("d/7/get").unwrap(),
        payload: Vec::new(),
        correlation: Correlation::default(),
    };
    harness.engine.handle_request(request, harness.now);
    assert_eq!(harness.state.borrow().pending_pin_requests, 1);

    let reset = encode_command(CommandId::LinkReset, &[]).unwrap();
    let output = harness.engine.handle_serial(&reset, harness.now);

    assert_eq!(harness.state.borrow().pending_pin_requests, 0);
    assert!(output
        .publications
        .iter()
        .any(|publication| property(publication, "bridge-error") == Some("link-reset")));
}

#[test]
fn summary_get_triggers_snapshot_publication() {
    let mut harness = Harness::new();
    harness.establish();

    let (publications, _) = harness.request("system/bridge/summary/get", b"");
    let summary = publications
        .iter()
        .find(|publication| publication.topic == "system/bridge/summary/value")
        .expect("summary publication");

    let parsed: serde_json::Value = serde_json::from_slice(&summary.payload).unwrap();
    assert_eq!(parsed["link"]["link_state"], "IDLE");
    assert_eq!(parsed["link"]["handshake_successes"], 1);
}
