use ferrite::spec::StatusCode;

/// Decoding failures of the framing codec. Each maps onto the status code
/// reported back to the peer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameError {
    /// Bad version, header shorter than required, or a declared length that
    /// does not match the buffer.
    Malformed,
    /// The CRC32 trailer does not match the header + payload.
    CrcMismatch,
    /// The decoded frame exceeds the raw frame bound.
    Overflow,
}

impl FrameError {
    #[inline]
    pub fn status(self) -> StatusCode {
        match self {
            FrameError::Malformed => StatusCode::Malformed,
            FrameError::CrcMismatch => StatusCode::CrcMismatch,
            FrameError::Overflow => StatusCode::Overflow,
        }
    }
}

/// Terminal link faults.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultKind {
    /// The handshake tag failed constant-time verification.
    HandshakeTag,
    /// The crypto known-answer tests failed; the link must not carry traffic.
    CryptoSelfTest,
}

/// Failures of `Link::send_command`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendError {
    /// The link has not completed its handshake (or is faulted).
    NotReady,
    /// The payload exceeds the frame payload bound.
    PayloadTooLarge,
    /// The follow-up queue behind the pending transmission is full.
    QueueFull,
}

impl SendError {
    pub fn reason(self) -> &'static str {
        match self {
            SendError::NotReady => "link-not-ready",
            SendError::PayloadTooLarge => "payload-too-large",
            SendError::QueueFull => "link-queue-full",
        }
    }
}
