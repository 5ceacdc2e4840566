// @generated by `protogen` from `proto/bridge-protocol.toml`. Do not edit by
// hand; run `cargo run -p util --bin protogen` after changing the protocol
// spec and commit the regenerated artefacts.

/// Wire protocol version carried in every frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on a frame payload, shared by both peers.
pub const MAX_PAYLOAD_SIZE: usize = 128;

/// Frame header: version (u8) + payload length (u16 BE) + id (u16 BE).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Trailing CRC32 (IEEE 802.3) transmitted big-endian.
pub const FRAME_CRC_SIZE: usize = 4;

/// Largest raw (pre-COBS) frame.
pub const MAX_RAW_FRAME_SIZE: usize = FRAME_HEADER_SIZE + MAX_PAYLOAD_SIZE + FRAME_CRC_SIZE;

/// First numeric id of the status range. Ids below carry commands.
pub const STATUS_RANGE_START: u16 = 0x7F00;

/// Reserved command-id bit for the RLE compression extension. Must be zero.
pub const COMPRESSION_FLAG: u16 = 0x8000;

/// Handshake nonce length in bytes.
pub const HANDSHAKE_NONCE_SIZE: usize = 16;

/// Truncated HMAC tag length in bytes.
pub const HANDSHAKE_TAG_SIZE: usize = 16;

/// HKDF context label for the LINK_SYNC_RESP tag.
pub const HKDF_LABEL_SYNC_RESP: &[u8] = b"link-sync-resp";

/// HKDF context label for the derived session tag.
pub const HKDF_LABEL_SESSION: &[u8] = b"bridge-session";

/// Follow-up commands buffered while a transmission awaits its ACK.
pub const TX_QUEUE_LIMIT: usize = 4;

pub const DEFAULT_ACK_TIMEOUT_MS: u16 = 250;
pub const MIN_ACK_TIMEOUT_MS: u16 = 50;
pub const MAX_ACK_TIMEOUT_MS: u16 = 5000;

pub const DEFAULT_RETRY_LIMIT: u8 = 3;
pub const MAX_RETRY_LIMIT: u8 = 10;

pub const DEFAULT_RESPONSE_TIMEOUT_MS: u32 = 5000;
pub const MIN_RESPONSE_TIMEOUT_MS: u32 = 100;
pub const MAX_RESPONSE_TIMEOUT_MS: u32 = 60000;

/// Capability bitmask bits reported by GET_CAPABILITIES (u32 BE).
pub const CAP_GPIO: u32 = 1 << 0;
pub const CAP_ANALOG_READ: u32 = 1 << 1;
pub const CAP_ANALOG_WRITE: u32 = 1 << 2;
pub const CAP_CONSOLE: u32 = 1 << 3;
pub const CAP_DATASTORE: u32 = 1 << 4;
pub const CAP_MAILBOX: u32 = 1 << 5;
pub const CAP_FILE: u32 = 1 << 6;
pub const CAP_PROCESS: u32 = 1 << 7;

/// Service family a command dispatches to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CommandFamily {
    Link,
    System,
    Gpio,
    Console,
    Datastore,
    Mailbox,
    File,
    Process,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum CommandId {
    LinkReset = 0x0001,
    LinkSync = 0x0002,
    LinkSyncResp = 0x0003,
    GetVersion = 0x0010,
    GetVersionResp = 0x0011,
    GetCapabilities = 0x0012,
    GetCapabilitiesResp = 0x0013,
    GetFreeMemory = 0x0014,
    GetFreeMemoryResp = 0x0015,
    SetBaudrate = 0x0016,
    SetBaudrateResp = 0x0017,
    SetPinMode = 0x0020,
    DigitalWrite = 0x0021,
    DigitalRead = 0x0022,
    DigitalReadResp = 0x0023,
    AnalogWrite = 0x0024,
    AnalogRead = 0x0025,
    AnalogReadResp = 0x0026,
    ConsoleWrite = 0x0030,
    ConsoleXon = 0x0031,
    ConsoleXoff = 0x0032,
    DatastorePut = 0x0040,
    DatastoreGet = 0x0041,
    DatastoreGetResp = 0x0042,
    MailboxPush = 0x0050,
    MailboxRead = 0x0051,
    MailboxReadResp = 0x0052,
    MailboxAvailable = 0x0053,
    MailboxAvailableResp = 0x0054,
    FileRead = 0x0060,
    FileReadResp = 0x0061,
    FileWrite = 0x0062,
    FileRemove = 0x0063,
    ProcessRun = 0x0070,
    ProcessRunResp = 0x0071,
    ProcessRunAsync = 0x0072,
    ProcessRunAsyncResp = 0x0073,
    ProcessPoll = 0x0074,
    ProcessPollResp = 0x0075,
    ProcessKill = 0x0076,
    ProcessKillResp = 0x0077,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 0x7F00,
    Error = 0x7F01,
    CmdUnknown = 0x7F02,
    Ack = 0x7F03,
    Malformed = 0x7F04,
    CrcMismatch = 0x7F05,
    Overflow = 0x7F06,
    Timeout = 0x7F07,
    NotImplemented = 0x7F08,
}

impl CommandId {
    pub fn from_wire(raw: u16) -> Option<CommandId> {
        match raw {
            0x0001 => Some(CommandId::LinkReset),
            0x0002 => Some(CommandId::LinkSync),
            0x0003 => Some(CommandId::LinkSyncResp),
            0x0010 => Some(CommandId::GetVersion),
            0x0011 => Some(CommandId::GetVersionResp),
            0x0012 => Some(CommandId::GetCapabilities),
            0x0013 => Some(CommandId::GetCapabilitiesResp),
            0x0014 => Some(CommandId::GetFreeMemory),
            0x0015 => Some(CommandId::GetFreeMemoryResp),
            0x0016 => Some(CommandId::SetBaudrate),
            0x0017 => Some(CommandId::SetBaudrateResp),
            0x0020 => Some(CommandId::SetPinMode),
            0x0021 => Some(CommandId::DigitalWrite),
            0x0022 => Some(CommandId::DigitalRead),
            0x0023 => Some(CommandId::DigitalReadResp),
            0x0024 => Some(CommandId::AnalogWrite),
            0x0025 => Some(CommandId::AnalogRead),
            0x0026 => Some(CommandId::AnalogReadResp),
            0x0030 => Some(CommandId::ConsoleWrite),
            0x0031 => Some(CommandId::ConsoleXon),
            0x0032 => Some(CommandId::ConsoleXoff),
            0x0040 => Some(CommandId::DatastorePut),
            0x0041 => Some(CommandId::DatastoreGet),
            0x0042 => Some(CommandId::DatastoreGetResp),
            0x0050 => Some(CommandId::MailboxPush),
            0x0051 => Some(CommandId::MailboxRead),
            0x0052 => Some(CommandId::MailboxReadResp),
            0x0053 => Some(CommandId::MailboxAvailable),
            0x0054 => Some(CommandId::MailboxAvailableResp),
            0x0060 => Some(CommandId::FileRead),
            0x0061 => Some(CommandId::FileReadResp),
            0x0062 => Some(CommandId::FileWrite),
            0x0063 => Some(CommandId::FileRemove),
            0x0070 => Some(CommandId::ProcessRun),
            0x0071 => Some(CommandId::ProcessRunResp),
            0x0072 => Some(CommandId::ProcessRunAsync),
            0x0073 => Some(CommandId::ProcessRunAsyncResp),
            0x0074 => Some(CommandId::ProcessPoll),
            0x0075 => Some(CommandId::ProcessPollResp),
            0x0076 => Some(CommandId::ProcessKill),
            0x0077 => Some(CommandId::ProcessKillResp),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandId::LinkReset => "LINK_RESET",
            CommandId::LinkSync => "LINK_SYNC",
            CommandId::LinkSyncResp => "LINK_SYNC_RESP",
            CommandId::GetVersion => "GET_VERSION",
            CommandId::GetVersionResp => "GET_VERSION_RESP",
            CommandId::GetCapabilities => "GET_CAPABILITIES",
            CommandId::GetCapabilitiesResp => "GET_CAPABILITIES_RESP",
            CommandId::GetFreeMemory => "GET_FREE_MEMORY",
            CommandId::GetFreeMemoryResp => "GET_FREE_MEMORY_RESP",
            CommandId::SetBaudrate => "SET_BAUDRATE",
            CommandId::SetBaudrateResp => "SET_BAUDRATE_RESP",
            CommandId::SetPinMode => "SET_PIN_MODE",
            CommandId::DigitalWrite => "DIGITAL_WRITE",
            CommandId::DigitalRead => "DIGITAL_READ",
            CommandId::DigitalReadResp => "DIGITAL_READ_RESP",
            CommandId::AnalogWrite => "ANALOG_WRITE",
            CommandId::AnalogRead => "ANALOG_READ",
            CommandId::AnalogReadResp => "ANALOG_READ_RESP",
            CommandId::ConsoleWrite => "CONSOLE_WRITE",
            CommandId::ConsoleXon => "CONSOLE_XON",
            CommandId::ConsoleXoff => "CONSOLE_XOFF",
            CommandId::DatastorePut => "DATASTORE_PUT",
            CommandId::DatastoreGet => "DATASTORE_GET",
            CommandId::DatastoreGetResp => "DATASTORE_GET_RESP",
            CommandId::MailboxPush => "MAILBOX_PUSH",
            CommandId::MailboxRead => "MAILBOX_READ",
            CommandId::MailboxReadResp => "MAILBOX_READ_RESP",
            CommandId::MailboxAvailable => "MAILBOX_AVAILABLE",
            CommandId::MailboxAvailableResp => "MAILBOX_AVAILABLE_RESP",
            CommandId::FileRead => "FILE_READ",
            CommandId::FileReadResp => "FILE_READ_RESP",
            CommandId::FileWrite => "FILE_WRITE",
            CommandId::FileRemove => "FILE_REMOVE",
            CommandId::ProcessRun => "PROCESS_RUN",
            CommandId::ProcessRunResp => "PROCESS_RUN_RESP",
            CommandId::ProcessRunAsync => "PROCESS_RUN_ASYNC",
            CommandId::ProcessRunAsyncResp => "PROCESS_RUN_ASYNC_RESP",
            CommandId::ProcessPoll => "PROCESS_POLL",
            CommandId::ProcessPollResp => "PROCESS_POLL_RESP",
            CommandId::ProcessKill => "PROCESS_KILL",
            CommandId::ProcessKillResp => "PROCESS_KILL_RESP",
        }
    }

    pub fn family(self) -> CommandFamily {
        match self {
            CommandId::LinkReset => CommandFamily::Link,
            CommandId::LinkSync => CommandFamily::Link,
            CommandId::LinkSyncResp => CommandFamily::Link,
            CommandId::GetVersion => CommandFamily::System,
            CommandId::GetVersionResp => CommandFamily::System,
            CommandId::GetCapabilities => CommandFamily::System,
            CommandId::GetCapabilitiesResp => CommandFamily::System,
            CommandId::GetFreeMemory => CommandFamily::System,
            CommandId::GetFreeMemoryResp => CommandFamily::System,
            CommandId::SetBaudrate => CommandFamily::System,
            CommandId::SetBaudrateResp => CommandFamily::System,
            CommandId::SetPinMode => CommandFamily::Gpio,
            CommandId::DigitalWrite => CommandFamily::Gpio,
            CommandId::DigitalRead => CommandFamily::Gpio,
            CommandId::DigitalReadResp => CommandFamily::Gpio,
            CommandId::AnalogWrite => CommandFamily::Gpio,
            CommandId::AnalogRead => CommandFamily::Gpio,
            CommandId::AnalogReadResp => CommandFamily::Gpio,
            CommandId::ConsoleWrite => CommandFamily::Console,
            CommandId::ConsoleXon => CommandFamily::Console,
            CommandId::ConsoleXoff => CommandFamily::Console,
            CommandId::DatastorePut => CommandFamily::Datastore,
            CommandId::DatastoreGet => CommandFamily::Datastore,
            CommandId::DatastoreGetResp => CommandFamily::Datastore,
            CommandId::MailboxPush => CommandFamily::Mailbox,
            CommandId::MailboxRead => CommandFamily::Mailbox,
            CommandId::MailboxReadResp => CommandFamily::Mailbox,
            CommandId::MailboxAvailable => CommandFamily::Mailbox,
            CommandId::MailboxAvailableResp => CommandFamily::Mailbox,
            CommandId::FileRead => CommandFamily::File,
            CommandId::FileReadResp => CommandFamily::File,
            CommandId::FileWrite => CommandFamily::File,
            CommandId::FileRemove => CommandFamily::File,
            CommandId::ProcessRun => CommandFamily::Process,
            CommandId::ProcessRunResp => CommandFamily::Process,
            CommandId::ProcessRunAsync => CommandFamily::Process,
            CommandId::ProcessRunAsyncResp => CommandFamily::Process,
            CommandId::ProcessPoll => CommandFamily::Process,
            CommandId::ProcessPollResp => CommandFamily::Process,
            CommandId::ProcessKill => CommandFamily::Process,
            CommandId::ProcessKillResp => CommandFamily::Process,
        }
    }

    /// Commands in the requires-ack set retain their packet until the peer
    /// acknowledges or retries are exhausted.
    pub fn requires_ack(self) -> bool {
        match self {
            CommandId::LinkReset => true,
            CommandId::SetPinMode => true,
            CommandId::DigitalWrite => true,
            CommandId::AnalogWrite => true,
            CommandId::ConsoleWrite => true,
            CommandId::ConsoleXon => true,
            CommandId::ConsoleXoff => true,
            CommandId::DatastorePut => true,
            CommandId::MailboxPush => true,
            CommandId::FileWrite => true,
            CommandId::FileRemove => true,
            _ => false,
        }
    }

    /// Whether re-executing the side effect of a duplicate frame is harmless.
    pub fn is_idempotent(self) -> bool {
        match self {
            CommandId::ConsoleWrite => false,
            CommandId::MailboxPush => false,
            CommandId::FileWrite => false,
            _ => true,
        }
    }

    /// The response command the peer answers with, when one exists.
    pub fn response(self) -> Option<CommandId> {
        match self {
            CommandId::GetVersion => Some(CommandId::GetVersionResp),
            CommandId::GetCapabilities => Some(CommandId::GetCapabilitiesResp),
            CommandId::GetFreeMemory => Some(CommandId::GetFreeMemoryResp),
            CommandId::SetBaudrate => Some(CommandId::SetBaudrateResp),
            CommandId::DigitalRead => Some(CommandId::DigitalReadResp),
            CommandId::AnalogRead => Some(CommandId::AnalogReadResp),
            CommandId::DatastoreGet => Some(CommandId::DatastoreGetResp),
            CommandId::MailboxRead => Some(CommandId::MailboxReadResp),
            CommandId::MailboxAvailable => Some(CommandId::MailboxAvailableResp),
            CommandId::FileRead => Some(CommandId::FileReadResp),
            CommandId::ProcessRun => Some(CommandId::ProcessRunResp),
            CommandId::ProcessRunAsync => Some(CommandId::ProcessRunAsyncResp),
            CommandId::ProcessPoll => Some(CommandId::ProcessPollResp),
            CommandId::ProcessKill => Some(CommandId::ProcessKillResp),
            _ => None,
        }
    }
}

impl StatusCode {
    pub fn from_wire(raw: u16) -> Option<StatusCode> {
        match raw {
            0x7F00 => Some(StatusCode::Ok),
            0x7F01 => Some(StatusCode::Error),
            0x7F02 => Some(StatusCode::CmdUnknown),
            0x7F03 => Some(StatusCode::Ack),
            0x7F04 => Some(StatusCode::Malformed),
            0x7F05 => Some(StatusCode::CrcMismatch),
            0x7F06 => Some(StatusCode::Overflow),
            0x7F07 => Some(StatusCode::Timeout),
            0x7F08 => Some(StatusCode::NotImplemented),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StatusCode::Ok => "STATUS_OK",
            StatusCode::Error => "STATUS_ERROR",
            StatusCode::CmdUnknown => "STATUS_CMD_UNKNOWN",
            StatusCode::Ack => "STATUS_ACK",
            StatusCode::Malformed => "STATUS_MALFORMED",
            StatusCode::CrcMismatch => "STATUS_CRC_MISMATCH",
            StatusCode::Overflow => "STATUS_OVERFLOW",
            StatusCode::Timeout => "STATUS_TIMEOUT",
            StatusCode::NotImplemented => "STATUS_NOT_IMPLEMENTED",
        }
    }
}

/// True when the numeric id falls in the status range.
pub fn is_status_id(raw: u16) -> bool {
    raw >= STATUS_RANGE_START && raw & COMPRESSION_FLAG == 0
}
