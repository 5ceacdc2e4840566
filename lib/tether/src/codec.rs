use crate::shared::FrameError;
use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISO_HDLC};
use ferrite::spec::{
    is_status_id, CommandId, StatusCode, FRAME_CRC_SIZE, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE,
    MAX_RAW_FRAME_SIZE, PROTOCOL_VERSION,
};

/// CRC32 (IEEE 802.3) over header + payload, transmitted big-endian.
pub const FRAME_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Largest COBS-encoded packet, terminator included.
pub const MAX_ENCODED_FRAME_SIZE: usize = corncobs::max_encoded_len(MAX_RAW_FRAME_SIZE);

/// A decoded frame. The id is kept raw so unknown commands can still be
/// routed to the unknown-command handler; `kind` classifies it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub id: u16,
    pub payload: Vec<u8>,
    /// CRC of the frame as received; feeds the dedup window.
    pub crc: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameKind {
    Command(CommandId),
    Status(StatusCode),
    Unknown(u16),
}

impl Frame {
    #[inline]
    pub fn kind(&self) -> FrameKind {
        if is_status_id(self.id) {
            match StatusCode::from_wire(self.id) {
                Some(code) => FrameKind::Status(code),
                None => FrameKind::Unknown(self.id),
            }
        } else {
            match CommandId::from_wire(self.id) {
                Some(cmd) => FrameKind::Command(cmd),
                None => FrameKind::Unknown(self.id),
            }
        }
    }
}

/// Serialises and COBS-encodes one frame, including the trailing delimiter.
pub fn encode_frame(id: u16, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::Overflow);
    }

    let raw_len = FRAME_HEADER_SIZE + payload.len() + FRAME_CRC_SIZE;
    let mut raw = Vec::with_capacity(raw_len);

    raw.push(PROTOCOL_VERSION);
    raw.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    raw.extend_from_slice(&id.to_be_bytes());
    raw.extend_from_slice(payload);

    let crc = FRAME_CRC.checksum(&raw);
    raw.extend_from_slice(&crc.to_be_bytes());

    let mut packet = vec![0u8; corncobs::max_encoded_len(raw.len())];
    let encoded = corncobs::encode_buf(&raw, &mut packet);
    packet.truncate(encoded);

    Ok(packet)
}

#[inline]
pub fn encode_command(cmd: CommandId, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    encode_frame(cmd as u16, payload)
}

#[inline]
pub fn encode_status(code: StatusCode, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    encode_frame(code as u16, payload)
}

/// Incremental packet parser. Bytes are accumulated until the zero delimiter;
/// oversized accumulations are discarded and reported once, after which the
/// parser resynchronises on the next delimiter.
pub struct FrameParser {
    accum: Vec<u8>,
    overflowed: bool,
}

impl FrameParser {
    #[inline]
    pub fn new() -> FrameParser {
        FrameParser {
            accum: Vec::with_capacity(MAX_ENCODED_FRAME_SIZE),
            overflowed: false,
        }
    }

    /// Feed a single wire byte. Returns a frame or error when a delimiter
    /// completes a packet, `None` otherwise.
    pub fn feed(&mut self, byte: u8) -> Option<Result<Frame, FrameError>> {
        if byte != 0 {
            if self.overflowed {
                return None;
            }
            if self.accum.len() >= MAX_ENCODED_FRAME_SIZE {
                self.accum.clear();
                self.overflowed = true;
                return None;
            }
            self.accum.push(byte);
            return None;
        }

        if self.overflowed {
            self.overflowed = false;
            return Some(Err(FrameError::Overflow));
        }

        // Idle delimiters between packets are legal resync padding.
        if self.accum.is_empty() {
            return None;
        }

        let result = decode_packet(&self.accum);
        self.accum.clear();
        Some(result)
    }
}

fn decode_packet(encoded: &[u8]) -> Result<Frame, FrameError> {
    let mut raw = [0u8; MAX_ENCODED_FRAME_SIZE];

    let len = corncobs::decode_buf(encoded, &mut raw).map_err(|_| FrameError::Malformed)?;

    if len > MAX_RAW_FRAME_SIZE {
        return Err(FrameError::Overflow);
    }
    if len < FRAME_HEADER_SIZE + FRAME_CRC_SIZE {
        return Err(FrameError::Malformed);
    }

    let raw = &raw[..len];

    if raw[0] != PROTOCOL_VERSION {
        return Err(FrameError::Malformed);
    }

    let declared = BigEndian::read_u16(&raw[1..3]) as usize;
    let id = BigEndian::read_u16(&raw[3..5]);

    if declared != len - FRAME_HEADER_SIZE - FRAME_CRC_SIZE {
        return Err(FrameError::Malformed);
    }

    let crc_offset = len - FRAME_CRC_SIZE;
    let crc = BigEndian::read_u32(&raw[crc_offset..]);

    if FRAME_CRC.checksum(&raw[..crc_offset]) != crc {
        return Err(FrameError::CrcMismatch);
    }

    Ok(Frame {
        id,
        payload: raw[FRAME_HEADER_SIZE..crc_offset].to_vec(),
        crc,
    })
}

/// Convenience for tests and loopback wiring: parse a buffer that holds
/// exactly one packet.
pub fn parse_single(packet: &[u8]) -> Option<Result<Frame, FrameError>> {
    let mut parser = FrameParser::new();
    let mut result = None;

    for &byte in packet {
        if let Some(outcome) = parser.feed(byte) {
            result = Some(outcome);
        }
    }

    result
}
