//! Message buffers.

use squall_types::MessageHeader;

/// A block of memory holding one multicast message: the 32-byte header
/// followed by the payload.
///
/// Buffers are owned by a per-subgroup free list in the engine, loaned to
/// the sender between reserve and commit, retained in the in-flight table
/// until the message is delivered and persisted, then returned to the list.
#[derive(Debug)]
pub struct MessageBuffer {
    data: Vec<u8>,
    /// Bytes in use: header plus payload.
    len: usize,
}

impl MessageBuffer {
    /// Allocates a buffer able to hold `capacity` bytes of header+payload.
    pub fn allocate(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity.max(MessageHeader::SIZE)],
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Readies the buffer for a message with `payload_len` payload bytes and
    /// writes the header. Returns the payload region for the caller to fill.
    ///
    /// # Panics
    ///
    /// Panics if the message does not fit; the engine checks payload sizes
    /// against the configured maxima before reserving.
    pub fn begin_message(&mut self, header: &MessageHeader, payload_len: usize) -> &mut [u8] {
        let total = MessageHeader::SIZE + payload_len;
        assert!(total <= self.data.len(), "message exceeds buffer capacity");
        self.len = total;
        header.encode_into(&mut self.data);
        &mut self.data[MessageHeader::SIZE..total]
    }

    /// The whole on-wire message: header then payload.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn header(&self) -> Option<MessageHeader> {
        MessageHeader::decode(&self.data[..self.len.min(self.data.len())])
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[MessageHeader::SIZE..self.len]
    }

    /// Rebuilds a buffer from received on-wire bytes.
    pub fn from_wire(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            len: bytes.len(),
        }
    }

    /// Clears the buffer for return to the free list.
    pub fn reset(&mut self) {
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use squall_types::{MessageId, Timestamp};

    #[test]
    fn begin_message_lays_out_header_then_payload() {
        let mut buf = MessageBuffer::allocate(128);
        let header = MessageHeader::new(MessageId::new(3), Timestamp::new(77), 0, false);
        buf.begin_message(&header, 5).copy_from_slice(b"hello");

        assert_eq!(buf.len(), MessageHeader::SIZE + 5);
        assert_eq!(buf.header().unwrap().index(), MessageId::new(3));
        assert_eq!(buf.payload(), b"hello");
    }

    #[test]
    fn wire_round_trip() {
        let mut buf = MessageBuffer::allocate(64);
        let header = MessageHeader::new(MessageId::new(0), Timestamp::new(1), 2, true);
        buf.begin_message(&header, 3).copy_from_slice(b"abc");

        let rebuilt = MessageBuffer::from_wire(buf.bytes());
        assert_eq!(rebuilt.payload(), b"abc");
        assert_eq!(rebuilt.header().unwrap().num_nulls, 2);
    }

    #[test]
    fn null_message_has_empty_payload() {
        let mut buf = MessageBuffer::allocate(64);
        let header = MessageHeader::new(MessageId::new(9), Timestamp::new(1), 1, false);
        buf.begin_message(&header, 0);
        assert!(buf.payload().is_empty());
        assert_eq!(buf.len(), MessageHeader::SIZE);
    }
}
