//! The protocol generator: reads `proto/bridge-protocol.toml` and emits the
//! Rust binding for the daemon side and the C header for the firmware side.
//! Regeneration is deterministic; the `--check` mode (and the guard test)
//! compare the emitted text against the committed artefacts.

use serde_derive::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct ProtocolSpec {
    pub protocol: ProtocolSection,
    pub handshake: HandshakeSection,
    pub timing: TimingSection,
    pub commands: Vec<CommandDef>,
    pub statuses: Vec<StatusDef>,
}

#[derive(Debug, Deserialize)]
pub struct ProtocolSection {
    pub version: u8,
    pub max_payload_size: usize,
    pub status_range_start: u16,
}

#[derive(Debug, Deserialize)]
pub struct HandshakeSection {
    pub nonce_size: usize,
    pub tag_size: usize,
    pub sync_resp_label: String,
    pub session_label: String,
}

#[derive(Debug, Deserialize)]
pub struct TimingSection {
    pub ack_timeout_default_ms: u16,
    pub ack_timeout_min_ms: u16,
    pub ack_timeout_max_ms: u16,
    pub retry_limit_default: u8,
    pub retry_limit_max: u8,
    pub response_timeout_default_ms: u32,
    pub response_timeout_min_ms: u32,
    pub response_timeout_max_ms: u32,
    pub tx_queue_limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct CommandDef {
    pub name: String,
    pub id: u16,
    pub family: String,
    #[serde(default)]
    pub requires_ack: bool,
    #[serde(default = "default_true")]
    pub idempotent: bool,
    #[serde(default)]
    pub response: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusDef {
    pub name: String,
    pub id: u16,
}

fn default_true() -> bool {
    true
}

#[derive(Debug)]
pub enum SpecError {
    Read(String),
    Invalid(String),
}

impl std::fmt::Display for SpecError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SpecError::Read(detail) => write!(f, "spec unreadable: {}", detail),
            SpecError::Invalid(detail) => write!(f, "spec invalid: {}", detail),
        }
    }
}

pub fn load<P: AsRef<Path>>(path: P) -> Result<ProtocolSpec, SpecError> {
    let spec: ProtocolSpec = serdeconv::from_toml_file(path.as_ref())
        .map_err(|error| SpecError::Read(error.to_string()))?;
    validate(&spec)?;
    Ok(spec)
}

/// The invariants the generator refuses to emit without: disjoint ranges,
/// unique ids and names, resolvable response references.
fn validate(spec: &ProtocolSpec) -> Result<(), SpecError> {
    let mut seen_ids = std::collections::HashSet::new();
    let mut seen_names = std::collections::HashSet::new();

    for command in &spec.commands {
        if command.id >= spec.protocol.status_range_start {
            return Err(SpecError::Invalid(format!(
                "command {} overlaps the status range",
                command.name
            )));
        }
        if command.id & 0x8000 != 0 {
            return Err(SpecError::Invalid(format!(
                "command {} collides with the compression flag",
                command.name
            )));
        }
        if !seen_ids.insert(command.id) {
            return Err(SpecError::Invalid(format!("duplicate id {:#06X}", command.id)));
        }
        if !seen_names.insert(command.name.clone()) {
            return Err(SpecError::Invalid(format!("duplicate name {}", command.name)));
        }
        if let Some(ref response) = command.response {
            if !spec.commands.iter().any(|other| &other.name == response) {
                return Err(SpecError::Invalid(format!(
                    "{} references unknown response {}",
                    command.name, response
                )));
            }
        }
    }

    for status in &spec.statuses {
        if status.id < spec.protocol.status_range_start || status.id & 0x8000 != 0 {
            return Err(SpecError::Invalid(format!(
                "status {} outside the status range",
                status.name
            )));
        }
        if !seen_ids.insert(status.id) {
            return Err(SpecError::Invalid(format!("duplicate id {:#06X}", status.id)));
        }
    }

    Ok(())
}

/// `LINK_RESET` -> `LinkReset`.
pub fn camel(name: &str) -> String {
    name.split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect()
}

/// `STATUS_CMD_UNKNOWN` -> `CmdUnknown`.
pub fn status_camel(name: &str) -> String {
    camel(name.trim_start_matches("STATUS_"))
}

/// Families in first-appearance order.
fn families(spec: &ProtocolSpec) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for command in &spec.commands {
        if !out.contains(&command.family) {
            out.push(command.family.clone());
        }
    }
    out
}

/// Emits `lib/ferrite/src/spec.rs`.
pub fn emit_rust(spec: &ProtocolSpec) -> String {
    let mut out = String::with_capacity(16 * 1024);

    out.push_str("// @generated by `protogen` from `proto/bridge-protocol.toml`. Do not edit by\n");
    out.push_str("// hand; run `cargo run -p util --bin protogen` after changing the protocol\n");
    out.push_str("// spec and commit the regenerated artefacts.\n");
    out.push_str("\n");
    out.push_str("/// Wire protocol version carried in every frame header.\n");
    out.push_str(&format!(
        "pub const PROTOCOL_VERSION: u8 = {};\n",
        spec.protocol.version
    ));
    out.push_str("\n");
    out.push_str("/// Upper bound on a frame payload, shared by both peers.\n");
    out.push_str(&format!(
        "pub const MAX_PAYLOAD_SIZE: usize = {};\n",
        spec.protocol.max_payload_size
    ));
    out.push_str("\n");
    out.push_str("/// Frame header: version (u8) + payload length (u16 BE) + id (u16 BE).\n");
    out.push_str("pub const FRAME_HEADER_SIZE: usize = 5;\n");
    out.push_str("\n");
    out.push_str("/// Trailing CRC32 (IEEE 802.3) transmitted big-endian.\n");
    out.push_str("pub const FRAME_CRC_SIZE: usize = 4;\n");
    out.push_str("\n");
    out.push_str("/// Largest raw (pre-COBS) frame.\n");
    out.push_str(
        "pub const MAX_RAW_FRAME_SIZE: usize = FRAME_HEADER_SIZE + MAX_PAYLOAD_SIZE + FRAME_CRC_SIZE;\n",
    );
    out.push_str("\n");
    out.push_str("/// First numeric id of the status range. Ids below carry commands.\n");
    out.push_str(&format!(
        "pub const STATUS_RANGE_START: u16 = 0x{:04X};\n",
        spec.protocol.status_range_start
    ));
    out.push_str("\n");
    out.push_str("/// Reserved command-id bit for the RLE compression extension. Must be zero.\n");
    out.push_str("pub const COMPRESSION_FLAG: u16 = 0x8000;\n");
    out.push_str("\n");
    out.push_str("/// Handshake nonce length in bytes.\n");
    out.push_str(&format!(
        "pub const HANDSHAKE_NONCE_SIZE: usize = {};\n",
        spec.handshake.nonce_size
    ));
    out.push_str("\n");
    out.push_str("/// Truncated HMAC tag length in bytes.\n");
    out.push_str(&format!(
        "pub const HANDSHAKE_TAG_SIZE: usize = {};\n",
        spec.handshake.tag_size
    ));
    out.push_str("\n");
    out.push_str("/// HKDF context label for the LINK_SYNC_RESP tag.\n");
    out.push_str(&format!(
        "pub const HKDF_LABEL_SYNC_RESP: &[u8] = b\"{}\";\n",
        spec.handshake.sync_resp_label
    ));
    out.push_str("\n");
    out.push_str("/// HKDF context label for the derived session tag.\n");
    out.push_str(&format!(
        "pub const HKDF_LABEL_SESSION: &[u8] = b\"{}\";\n",
        spec.handshake.session_label
    ));
    out.push_str("\n");
    out.push_str("/// Follow-up commands buffered while a transmission awaits its ACK.\n");
    out.push_str(&format!(
        "pub const TX_QUEUE_LIMIT: usize = {};\n",
        spec.timing.tx_queue_limit
    ));
    out.push_str("\n");
    out.push_str(&format!(
        "pub const DEFAULT_ACK_TIMEOUT_MS: u16 = {};\n",
        spec.timing.ack_timeout_default_ms
    ));
    out.push_str(&format!(
        "pub const MIN_ACK_TIMEOUT_MS: u16 = {};\n",
        spec.timing.ack_timeout_min_ms
    ));
    out.push_str(&format!(
        "pub const MAX_ACK_TIMEOUT_MS: u16 = {};\n",
        spec.timing.ack_timeout_max_ms
    ));
    out.push_str("\n");
    out.push_str(&format!(
        "pub const DEFAULT_RETRY_LIMIT: u8 = {};\n",
        spec.timing.retry_limit_default
    ));
    out.push_str(&format!(
        "pub const MAX_RETRY_LIMIT: u8 = {};\n",
        spec.timing.retry_limit_max
    ));
    out.push_str("\n");
    out.push_str(&format!(
        "pub const DEFAULT_RESPONSE_TIMEOUT_MS: u32 = {};\n",
        spec.timing.response_timeout_default_ms
    ));
    out.push_str(&format!(
        "pub const MIN_RESPONSE_TIMEOUT_MS: u32 = {};\n",
        spec.timing.response_timeout_min_ms
    ));
    out.push_str(&format!(
        "pub const MAX_RESPONSE_TIMEOUT_MS: u32 = {};\n",
        spec.timing.response_timeout_max_ms
    ));
    out.push_str("\n");
    out.push_str("/// Capability bitmask bits reported by GET_CAPABILITIES (u32 BE).\n");
    out.push_str("pub const CAP_GPIO: u32 = 1 << 0;\n");
    out.push_str("pub const CAP_ANALOG_READ: u32 = 1 << 1;\n");
    out.push_str("pub const CAP_ANALOG_WRITE: u32 = 1 << 2;\n");
    out.push_str("pub const CAP_CONSOLE: u32 = 1 << 3;\n");
    out.push_str("pub const CAP_DATASTORE: u32 = 1 << 4;\n");
    out.push_str("pub const CAP_MAILBOX: u32 = 1 << 5;\n");
    out.push_str("pub const CAP_FILE: u32 = 1 << 6;\n");
    out.push_str("pub const CAP_PROCESS: u32 = 1 << 7;\n");
    out.push_str("\n");
    out.push_str("/// Service family a command dispatches to.\n");
    out.push_str("#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]\n");
    out.push_str("pub enum CommandFamily {\n");
    for family in families(spec) {
        out.push_str(&format!("    {},\n", family));
    }
    out.push_str("}\n");
    out.push_str("\n");
    out.push_str("#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]\n");
    out.push_str("#[repr(u16)]\n");
    out.push_str("pub enum CommandId {\n");
    for command in &spec.commands {
        out.push_str(&format!("    {} = 0x{:04X},\n", camel(&command.name), command.id));
    }
    out.push_str("}\n");
    out.push_str("\n");
    out.push_str("#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]\n");
    out.push_str("#[repr(u16)]\n");
    out.push_str("pub enum StatusCode {\n");
    for status in &spec.statuses {
        out.push_str(&format!(
            "    {} = 0x{:04X},\n",
            status_camel(&status.name),
            status.id
        ));
    }
    out.push_str("}\n");
    out.push_str("\n");
    out.push_str("impl CommandId {\n");
    out.push_str("    pub fn from_wire(raw: u16) -> Option<CommandId> {\n");
    out.push_str("        match raw {\n");
    for command in &spec.commands {
        out.push_str(&format!(
            "            0x{:04X} => Some(CommandId::{}),\n",
            command.id,
            camel(&command.name)
        ));
    }
    out.push_str("            _ => None,\n");
    out.push_str("        }\n");
    out.push_str("    }\n");
    out.push_str("\n");
    out.push_str("    pub fn name(self) -> &'static str {\n");
    out.push_str("        match self {\n");
    for command in &spec.commands {
        out.push_str(&format!(
            "            CommandId::{} => \"{}\",\n",
            camel(&command.name),
            command.name
        ));
    }
    out.push_str("        }\n");
    out.push_str("    }\n");
    out.push_str("\n");
    out.push_str("    pub fn family(self) -> CommandFamily {\n");
    out.push_str("        match self {\n");
    for command in &spec.commands {
        out.push_str(&format!(
            "            CommandId::{} => CommandFamily::{},\n",
            camel(&command.name),
            command.family
        ));
    }
    out.push_str("        }\n");
    out.push_str("    }\n");
    out.push_str("\n");
    out.push_str("    /// Commands in the requires-ack set retain their packet until the peer\n");
    out.push_str("    /// acknowledges or retries are exhausted.\n");
    out.push_str("    pub fn requires_ack(self) -> bool {\n");
    out.push_str("        match self {\n");
    for command in spec.commands.iter().filter(|command| command.requires_ack) {
        out.push_str(&format!(
            "            CommandId::{} => true,\n",
            camel(&command.name)
        ));
    }
    out.push_str("            _ => false,\n");
    out.push_str("        }\n");
    out.push_str("    }\n");
    out.push_str("\n");
    out.push_str("    /// Whether re-executing the side effect of a duplicate frame is harmless.\n");
    out.push_str("    pub fn is_idempotent(self) -> bool {\n");
    out.push_str("        match self {\n");
    for command in spec.commands.iter().filter(|command| !command.idempotent) {
        out.push_str(&format!(
            "            CommandId::{} => false,\n",
            camel(&command.name)
        ));
    }
    out.push_str("            _ => true,\n");
    out.push_str("        }\n");
    out.push_str("    }\n");
    out.push_str("\n");
    out.push_str("    /// The response command the peer answers with, when one exists.\n");
    out.push_str("    pub fn response(self) -> Option<CommandId> {\n");
    out.push_str("        match self {\n");
    for command in &spec.commands {
        if let Some(ref response) = command.response {
            out.push_str(&format!(
                "            CommandId::{} => Some(CommandId::{}),\n",
                camel(&command.name),
                camel(response)
            ));
        }
    }
    out.push_str("            _ => None,\n");
    out.push_str("        }\n");
    out.push_str("    }\n");
    out.push_str("}\n");
    out.push_str("\n");
    out.push_str("impl StatusCode {\n");
    out.push_str("    pub fn from_wire(raw: u16) -> Option<StatusCode> {\n");
    out.push_str("        match raw {\n");
    for status in &spec.statuses {
        out.push_str(&format!(
            "            0x{:04X} => Some(StatusCode::{}),\n",
            status.id,
            status_camel(&status.name)
        ));
    }
    out.push_str("            _ => None,\n");
    out.push_str("        }\n");
    out.push_str("    }\n");
    out.push_str("\n");
    out.push_str("    pub fn name(self) -> &'static str {\n");
    out.push_str("        match self {\n");
    for status in &spec.statuses {
        out.push_str(&format!(
            "            StatusCode::{} => \"{}\",\n",
            status_camel(&status.name),
            status.name
        ));
    }
    out.push_str("        }\n");
    out.push_str("    }\n");
    out.push_str("}\n");
    out.push_str("\n");
    out.push_str("/// True when the numeric id falls in the status range.\n");
    out.push_str("pub fn is_status_id(raw: u16) -> bool {\n");
    out.push_str("    raw >= STATUS_RANGE_START && raw & COMPRESSION_FLAG == 0\n");
    out.push_str("}\n");
    out.push_str("\n");
    out.push_str(RUST_TESTS);

    out
}

const RUST_TESTS: &str = r#"#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_disjoint() {
        for raw in [0x0001u16, 0x0021, 0x0077].iter() {
            assert!(!is_status_id(*raw));
            assert!(CommandId::from_wire(*raw).is_some());
        }
        for raw in [0x7F00u16, 0x7F08].iter() {
            assert!(is_status_id(*raw));
            assert!(StatusCode::from_wire(*raw).is_some());
        }
    }

    #[test]
    fn test_compression_flag_outside_both_ranges() {
        assert!(!is_status_id(0x8021));
        assert!(CommandId::from_wire(0x8021).is_none());
    }

    #[test]
    fn test_requires_ack_excludes_responses() {
        assert!(CommandId::DigitalWrite.requires_ack());
        assert!(!CommandId::DigitalRead.requires_ack());
        assert!(!CommandId::DigitalReadResp.requires_ack());
        assert!(CommandId::ConsoleXoff.requires_ack());
    }

    #[test]
    fn test_response_pairs_round() {
        let resp = CommandId::ProcessPoll.response().unwrap();
        assert_eq!(resp, CommandId::ProcessPollResp);
        assert!(resp.response().is_none());
    }
}
"#;

/// Emits `firmware/bridge_protocol.h`.
pub fn emit_c_header(spec: &ProtocolSpec) -> String {
    let mut out = String::with_capacity(8 * 1024);

    out.push_str("/* @generated by `protogen` from `proto/bridge-protocol.toml`. Do not edit. */\n");
    out.push_str("\n");
    out.push_str("#ifndef BRIDGE_PROTOCOL_H\n");
    out.push_str("#define BRIDGE_PROTOCOL_H\n");
    out.push_str("\n");
    out.push_str(&format!(
        "#define BRIDGE_PROTOCOL_VERSION {}\n",
        spec.protocol.version
    ));
    out.push_str(&format!(
        "#define BRIDGE_MAX_PAYLOAD_SIZE {}\n",
        spec.protocol.max_payload_size
    ));
    out.push_str("#define BRIDGE_FRAME_HEADER_SIZE 5\n");
    out.push_str("#define BRIDGE_FRAME_CRC_SIZE 4\n");
    out.push_str(&format!(
        "#define BRIDGE_MAX_RAW_FRAME_SIZE {}\n",
        spec.protocol.max_payload_size + 9
    ));
    out.push_str(&format!(
        "#define BRIDGE_STATUS_RANGE_START 0x{:04X}\n",
        spec.protocol.status_range_start
    ));
    out.push_str("#define BRIDGE_COMPRESSION_FLAG 0x8000\n");
    out.push_str(&format!(
        "#define BRIDGE_HANDSHAKE_NONCE_SIZE {}\n",
        spec.handshake.nonce_size
    ));
    out.push_str(&format!(
        "#define BRIDGE_HANDSHAKE_TAG_SIZE {}\n",
        spec.handshake.tag_size
    ));
    out.push_str(&format!(
        "#define BRIDGE_TX_QUEUE_LIMIT {}\n",
        spec.timing.tx_queue_limit
    ));
    out.push_str(&format!(
        "#define BRIDGE_DEFAULT_ACK_TIMEOUT_MS {}\n",
        spec.timing.ack_timeout_default_ms
    ));
    out.push_str(&format!(
        "#define BRIDGE_DEFAULT_RETRY_LIMIT {}\n",
        spec.timing.retry_limit_default
    ));
    out.push_str(&format!(
        "#define BRIDGE_DEFAULT_RESPONSE_TIMEOUT_MS {}\n",
        spec.timing.response_timeout_default_ms
    ));
    out.push_str("\n");
    for command in &spec.commands {
        out.push_str(&format!("#define CMD_{} 0x{:04X}\n", command.name, command.id));
    }
    out.push_str("\n");
    for status in &spec.statuses {
        out.push_str(&format!("#define {} 0x{:04X}\n", status.name, status.id));
    }
    out.push_str("\n");
    out.push_str("#define CMD_REQUIRES_ACK(id) ( \\\n");
    let ack_commands: Vec<&CommandDef> = spec
        .commands
        .iter()
        .filter(|command| command.requires_ack)
        .collect();
    for (index, command) in ack_commands.iter().enumerate() {
        let tail = if index + 1 == ack_commands.len() { ")" } else { " || \\" };
        out.push_str(&format!("    (id) == CMD_{}{}\n", command.name, tail));
    }
    out.push_str("\n");
    out.push_str("#endif /* BRIDGE_PROTOCOL_H */\n");

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .expect("util sits in the workspace root")
            .to_path_buf()
    }

    fn load_spec() -> ProtocolSpec {
        load(workspace_root().join("proto/bridge-protocol.toml")).unwrap()
    }

    #[test]
    fn test_camel_case() {
        assert_eq!(camel("LINK_RESET"), "LinkReset");
        assert_eq!(camel("DIGITAL_READ_RESP"), "DigitalReadResp");
        assert_eq!(status_camel("STATUS_CMD_UNKNOWN"), "CmdUnknown");
        assert_eq!(status_camel("STATUS_OK"), "Ok");
    }

    #[test]
    fn test_spec_loads_and_validates() {
        let spec = load_spec();
        assert_eq!(spec.protocol.version, 1);
        assert!(spec.commands.len() > 30);
        assert_eq!(spec.statuses.len(), 9);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let spec = load_spec();
        assert_eq!(emit_rust(&spec), emit_rust(&spec));
        assert_eq!(emit_c_header(&spec), emit_c_header(&spec));
    }

    /// The guard: committed artefacts must match regeneration exactly.
    #[test]
    fn test_rust_binding_in_sync() {
        let spec = load_spec();
        let committed = fs::read_to_string(workspace_root().join("lib/ferrite/src/spec.rs"))
            .expect("binding present");
        assert_eq!(
            emit_rust(&spec),
            committed,
            "lib/ferrite/src/spec.rs is stale; re-run protogen"
        );
    }

    #[test]
    fn test_c_header_in_sync() {
        let spec = load_spec();
        let committed = fs::read_to_string(workspace_root().join("firmware/bridge_protocol.h"))
            .expect("header present");
        assert_eq!(
            emit_c_header(&spec),
            committed,
            "firmware/bridge_protocol.h is stale; re-run protogen"
        );
    }

    #[test]
    fn test_binding_agrees_with_ferrite() {
        let spec = load_spec();

        for command in &spec.commands {
            let id = ferrite::spec::CommandId::from_wire(command.id)
                .unwrap_or_else(|| panic!("{} missing from binding", command.name));
            assert_eq!(id.name(), command.name);
            assert_eq!(id.requires_ack(), command.requires_ack);
            assert_eq!(id.is_idempotent(), command.idempotent);
        }

        for status in &spec.statuses {
            let code = ferrite::spec::StatusCode::from_wire(status.id)
                .unwrap_or_else(|| panic!("{} missing from binding", status.name));
            assert_eq!(code.name(), status.name);
        }
    }

    #[test]
    fn test_validation_rejects_overlap() {
        let mut spec = load_spec();
        spec.commands[0].id = 0x7F00;
        assert!(validate(&spec).is_err());
    }
}
