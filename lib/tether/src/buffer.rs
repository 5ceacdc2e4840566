use std::collections::VecDeque;

/// Watermark crossing produced by a ring operation. `High` asks the owner to
/// emit an XOFF towards the peer, `Low` an XON. Each edge fires exactly once
/// per crossing.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FlowEdge {
    High,
    Low,
}

/// Result of writing into a `ByteRing`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PushOutcome {
    pub written: usize,
    pub dropped: usize,
    pub edge: Option<FlowEdge>,
}

/// A bounded byte FIFO with flow-control watermarks at 3/4 and 1/4 of
/// capacity. Writes beyond capacity truncate; the caller accounts the drops.
pub struct ByteRing {
    data: VecDeque<u8>,
    capacity: usize,
    paused: bool,
}

impl ByteRing {
    #[inline]
    pub fn new(capacity: usize) -> ByteRing {
        if capacity < 4 {
            panic!("Ring capacity must be at least 4, got {}", capacity);
        }

        ByteRing {
            data: VecDeque::with_capacity(capacity),
            capacity,
            paused: false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.capacity - self.data.len()
    }

    #[inline]
    pub fn high_watermark(&self) -> usize {
        self.capacity * 3 / 4
    }

    #[inline]
    pub fn low_watermark(&self) -> usize {
        self.capacity / 4
    }

    /// True while the ring sits above its high watermark and the peer has
    /// been asked to hold off.
    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Append as many bytes as fit. Returns what was written, what was
    /// dropped, and the flow edge if the high watermark was crossed.
    pub fn push(&mut self, bytes: &[u8]) -> PushOutcome {
        let free = self.free_capacity();
        let written = std::cmp::min(free, bytes.len());

        self.data.extend(bytes[..written].iter().copied());

        let edge = if !self.paused && self.data.len() >= self.high_watermark() {
            self.paused = true;
            Some(FlowEdge::High)
        } else {
            None
        };

        PushOutcome {
            written,
            dropped: bytes.len() - written,
            edge,
        }
    }

    /// Remove up to `max` bytes from the front. Returns the bytes and the
    /// flow edge if the low watermark was crossed on the way down.
    pub fn drain(&mut self, max: usize) -> (Vec<u8>, Option<FlowEdge>) {
        let take = std::cmp::min(max, self.data.len());
        let bytes: Vec<u8> = self.data.drain(..take).collect();

        let edge = if self.paused && self.data.len() <= self.low_watermark() {
            self.paused = false;
            Some(FlowEdge::Low)
        } else {
            None
        };

        (bytes, edge)
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.paused = false;
    }
}

/// Rejection reasons of `MessageQueue::push`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum QueueError {
    /// The message-count limit is reached.
    CountLimit,
    /// Accepting the message would exceed the byte limit.
    ByteLimit,
}

impl QueueError {
    pub fn reason(self) -> &'static str {
        match self {
            QueueError::CountLimit => "mailbox-count-limit",
            QueueError::ByteLimit => "mailbox-byte-limit",
        }
    }
}

/// A message FIFO with independent message-count and byte limits. Rejected
/// messages are never partially accepted.
pub struct MessageQueue {
    messages: VecDeque<Vec<u8>>,
    bytes: usize,
    message_limit: usize,
    byte_limit: usize,
}

impl MessageQueue {
    #[inline]
    pub fn new(message_limit: usize, byte_limit: usize) -> MessageQueue {
        MessageQueue {
            messages: VecDeque::new(),
            bytes: 0,
            message_limit,
            byte_limit,
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.messages.len()
    }

    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Append one message, or reject it whole.
    pub fn push(&mut self, message: Vec<u8>) -> Result<usize, QueueError> {
        if self.messages.len() >= self.message_limit {
            return Err(QueueError::CountLimit);
        }
        if self.bytes + message.len() > self.byte_limit {
            return Err(QueueError::ByteLimit);
        }

        self.bytes += message.len();
        self.messages.push_back(message);

        Ok(self.messages.len())
    }

    /// Consume the oldest message.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let message = self.messages.pop_front()?;
        self.bytes -= message.len();
        Some(message)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_roundtrip() {
        let mut ring = ByteRing::new(16);

        let outcome = ring.push(b"hello");
        assert_eq!(outcome.written, 5);
        assert_eq!(outcome.dropped, 0);
        assert_eq!(outcome.edge, None);

        let (bytes, edge) = ring.drain(16);
        assert_eq!(bytes, b"hello");
        assert_eq!(edge, None);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_ring_truncates_and_counts_drops() {
        let mut ring = ByteRing::new(8);

        let outcome = ring.push(&[1u8; 12]);
        assert_eq!(outcome.written, 8);
        assert_eq!(outcome.dropped, 4);
        assert_eq!(ring.len(), 8);
    }

    #[test]
    fn test_watermark_hysteresis_single_edges() {
        let mut ring = ByteRing::new(16); // high = 12, low = 4

        // Fill to just below the high watermark: no edge.
        assert_eq!(ring.push(&[0u8; 11]).edge, None);

        // Crossing emits exactly one High edge.
        assert_eq!(ring.push(&[0u8; 1]).edge, Some(FlowEdge::High));
        assert_eq!(ring.push(&[0u8; 2]).edge, None);
        assert!(ring.is_paused());

        // Draining down to but not past the low watermark: no edge yet.
        let (_, edge) = ring.drain(9); // 14 -> 5
        assert_eq!(edge, None);

        // Crossing the low watermark emits exactly one Low edge.
        let (_, edge) = ring.drain(1); // 5 -> 4
        assert_eq!(edge, Some(FlowEdge::Low));
        let (_, edge) = ring.drain(4);
        assert_eq!(edge, None);
        assert!(!ring.is_paused());
    }

    #[test]
    fn test_watermark_refire_after_recovery() {
        let mut ring = ByteRing::new(16);

        assert_eq!(ring.push(&[0u8; 12]).edge, Some(FlowEdge::High));
        let (_, edge) = ring.drain(12);
        assert_eq!(edge, Some(FlowEdge::Low));

        // A second climb fires a second High.
        assert_eq!(ring.push(&[0u8; 12]).edge, Some(FlowEdge::High));
    }

    #[test]
    fn test_queue_limits() {
        let mut queue = MessageQueue::new(2, 10);

        assert_eq!(queue.push(b"first".to_vec()), Ok(1));
        assert_eq!(queue.push(b"nope-too-long".to_vec()), Err(QueueError::ByteLimit));
        assert_eq!(queue.push(b"ok".to_vec()), Ok(2));
        assert_eq!(queue.push(b"x".to_vec()), Err(QueueError::CountLimit));

        assert_eq!(queue.pop().unwrap(), b"first");
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.bytes(), 2);
    }

    #[test]
    fn test_queue_pop_empty() {
        let mut queue = MessageQueue::new(1, 1);
        assert!(queue.pop().is_none());
    }
}
