use tether::buffer::{MessageQueue, QueueError};

/// The two mailbox FIFOs. `to_mcu` holds MQTT messages until the MCU reads
/// them with MAILBOX_READ; `from_mcu` buffers MCU pushes on their way to the
/// publish queue. Rejected messages are counted whole as truncated bytes.
pub struct Mailbox {
    to_mcu: MessageQueue,
    from_mcu: MessageQueue,
    truncated_bytes: u64,
}

impl Mailbox {
    pub fn new(message_limit: usize, byte_limit: usize) -> Mailbox {
        Mailbox {
            to_mcu: MessageQueue::new(message_limit, byte_limit),
            from_mcu: MessageQueue::new(message_limit, byte_limit),
            truncated_bytes: 0,
        }
    }

    /// MQTT → MCU direction. Returns the new depth, or the rejection reason.
    pub fn push_to_mcu(&mut self, message: Vec<u8>) -> Result<usize, QueueError> {
        let size = message.len();
        self.to_mcu.push(message).map_err(|error| {
            self.truncated_bytes += size as u64;
            error
        })
    }

    /// MCU → MQTT direction.
    pub fn push_from_mcu(&mut self, message: Vec<u8>) -> Result<usize, QueueError> {
        let size = message.len();
        self.from_mcu.push(message).map_err(|error| {
            self.truncated_bytes += size as u64;
            error
        })
    }

    /// MAILBOX_READ consumes one MCU-bound message.
    pub fn read_for_mcu(&mut self) -> Option<Vec<u8>> {
        self.to_mcu.pop()
    }

    /// The publisher drains MCU-originated messages.
    pub fn drain_outbound(&mut self) -> Option<Vec<u8>> {
        self.from_mcu.pop()
    }

    /// MAILBOX_AVAILABLE: depth of the MCU-bound queue.
    pub fn available_for_mcu(&self) -> usize {
        self.to_mcu.depth()
    }

    pub fn outbound_depth(&self) -> usize {
        self.from_mcu.depth()
    }

    pub fn truncated_bytes(&self) -> u64 {
        self.truncated_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directions_are_independent() {
        let mut mailbox = Mailbox::new(4, 64);

        mailbox.push_to_mcu(b"inbound".to_vec()).unwrap();
        mailbox.push_from_mcu(b"outbound".to_vec()).unwrap();

        assert_eq!(mailbox.available_for_mcu(), 1);
        assert_eq!(mailbox.outbound_depth(), 1);

        assert_eq!(mailbox.read_for_mcu().unwrap(), b"inbound");
        assert_eq!(mailbox.drain_outbound().unwrap(), b"outbound");
        assert_eq!(mailbox.available_for_mcu(), 0);
    }

    #[test]
    fn test_rejection_counts_bytes() {
        let mut mailbox = Mailbox::new(1, 64);

        mailbox.push_to_mcu(b"first".to_vec()).unwrap();
        assert!(mailbox.push_to_mcu(b"second!".to_vec()).is_err());

        assert_eq!(mailbox.truncated_bytes(), 7);
        assert_eq!(mailbox.available_for_mcu(), 1);
    }

    #[test]
    fn test_read_empty_returns_none() {
        let mut mailbox = Mailbox::new(4, 64);
        assert!(mailbox.read_for_mcu().is_none());
    }
}
