use tether::buffer::{ByteRing, FlowEdge};

/// The daemon's half of the console stream. MQTT input buffers in `to_mcu`
/// until the link can carry it (and the MCU has not sent XOFF); MCU output
/// buffers in `from_mcu` until the publisher drains it.
pub struct ConsoleRelay {
    to_mcu: ByteRing,
    from_mcu: ByteRing,
    mcu_paused: bool,
    dropped_chunks: u64,
    rx_bytes: u64,
    tx_bytes: u64,
}

impl ConsoleRelay {
    pub fn new(capacity: usize) -> ConsoleRelay {
        ConsoleRelay {
            to_mcu: ByteRing::new(capacity),
            from_mcu: ByteRing::new(capacity),
            mcu_paused: false,
            dropped_chunks: 0,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }

    /// Buffer MQTT console input for the MCU. Overflow truncates and counts
    /// one dropped chunk.
    pub fn accept_input(&mut self, data: &[u8]) {
        let outcome = self.to_mcu.push(data);
        if outcome.dropped > 0 {
            self.dropped_chunks += 1;
        }
    }

    /// Buffer MCU console output for publication. Returns the flow edge so
    /// the engine can emit XOFF/XON towards the MCU when publishing backs
    /// up.
    pub fn accept_output(&mut self, data: &[u8]) -> Option<FlowEdge> {
        self.rx_bytes += data.len() as u64;
        let outcome = self.from_mcu.push(data);
        if outcome.dropped > 0 {
            self.dropped_chunks += 1;
        }
        outcome.edge
    }

    /// Next chunk for the wire, bounded by the frame payload size. Empty
    /// while the MCU has flow-controlled us.
    pub fn next_chunk(&mut self, max: usize) -> Option<Vec<u8>> {
        if self.mcu_paused || self.to_mcu.is_empty() {
            return None;
        }

        let (chunk, _) = self.to_mcu.drain(max);
        self.tx_bytes += chunk.len() as u64;
        Some(chunk)
    }

    /// Drain buffered MCU output for publishing. Returns the data plus the
    /// low-watermark edge when the ring recovers.
    pub fn drain_output(&mut self, max: usize) -> (Vec<u8>, Option<FlowEdge>) {
        self.from_mcu.drain(max)
    }

    pub fn set_mcu_paused(&mut self, paused: bool) {
        self.mcu_paused = paused;
    }

    #[inline]
    pub fn is_mcu_paused(&self) -> bool {
        self.mcu_paused
    }

    #[inline]
    pub fn queued_bytes(&self) -> usize {
        self.to_mcu.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.to_mcu.capacity()
    }

    #[inline]
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks
    }

    #[inline]
    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes
    }

    #[inline]
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes
    }

    pub fn clear(&mut self) {
        self.to_mcu.clear();
        self.from_mcu.clear();
        self.mcu_paused = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_chunked_to_wire() {
        let mut relay = ConsoleRelay::new(64);

        relay.accept_input(b"0123456789");
        assert_eq!(relay.next_chunk(4).unwrap(), b"0123");
        assert_eq!(relay.next_chunk(64).unwrap(), b"456789");
        assert!(relay.next_chunk(64).is_none());
        assert_eq!(relay.tx_bytes(), 10);
    }

    #[test]
    fn test_xoff_pauses_wire_chunks() {
        let mut relay = ConsoleRelay::new(64);

        relay.accept_input(b"held");
        relay.set_mcu_paused(true);
        assert!(relay.next_chunk(64).is_none());

        relay.set_mcu_paused(false);
        assert_eq!(relay.next_chunk(64).unwrap(), b"held");
    }

    #[test]
    fn test_overflow_counts_chunks_not_bytes() {
        let mut relay = ConsoleRelay::new(8);

        relay.accept_input(&[0u8; 20]);
        assert_eq!(relay.dropped_chunks(), 1);
        assert_eq!(relay.queued_bytes(), 8);
    }

    #[test]
    fn test_output_flow_edges() {
        let mut relay = ConsoleRelay::new(16);

        // Filling past the high watermark asks for an XOFF.
        let edge = relay.accept_output(&[1u8; 12]);
        assert_eq!(edge, Some(FlowEdge::High));

        // Draining below the low watermark asks for an XON.
        let (data, edge) = relay.drain_output(12);
        assert_eq!(data.len(), 12);
        assert_eq!(edge, Some(FlowEdge::Low));
    }
}
