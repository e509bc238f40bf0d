//! The fixed multicast message header.
//!
//! Every multicast message buffer begins with this 32-byte header, encoded
//! little-endian by hand so that peers agree on the layout byte-for-byte
//! regardless of architecture. The payload follows immediately.

use crate::{MessageId, Timestamp};

/// On-wire header preceding every multicast payload.
///
/// Layout (32 bytes, packed, little-endian):
///
/// ```text
/// offset  size  field
/// 0       4     header_size
/// 4       4     index (i32)
/// 8       8     timestamp_ns
/// 16      4     num_nulls
/// 20      1     cooked_send
/// 21      3     reserved
/// 24      8     reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    /// Size of this header; always [`Self::SIZE`]. Kept on the wire so a
    /// future revision can grow the header without breaking old readers.
    pub header_size: u32,
    /// The message's per-sender index.
    pub index: i32,
    /// Send timestamp, wall-clock nanoseconds.
    pub timestamp_ns: u64,
    /// Running count of automatic null messages injected by this sender.
    pub num_nulls: u32,
    /// Nonzero when the payload is a marshalled RPC rather than raw bytes.
    pub cooked_send: u8,
}

impl MessageHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 32;

    pub fn new(index: MessageId, timestamp: Timestamp, num_nulls: u32, cooked: bool) -> Self {
        Self {
            header_size: Self::SIZE as u32,
            index: index.as_i64() as i32,
            timestamp_ns: timestamp.as_nanos(),
            num_nulls,
            cooked_send: u8::from(cooked),
        }
    }

    /// Writes the header into the first [`Self::SIZE`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`Self::SIZE`].
    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= Self::SIZE, "buffer too small for header");
        buf[0..4].copy_from_slice(&self.header_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.index.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        buf[16..20].copy_from_slice(&self.num_nulls.to_le_bytes());
        buf[20] = self.cooked_send;
        buf[21..24].fill(0);
        buf[24..32].fill(0);
    }

    /// Reads a header from the first [`Self::SIZE`] bytes of `buf`, or
    /// `None` if `buf` is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            header_size: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            index: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            timestamp_ns: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            num_nulls: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            cooked_send: buf[20],
        })
    }

    pub fn index(&self) -> MessageId {
        MessageId::new(i64::from(self.index))
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp::new(self.timestamp_ns)
    }

    pub fn is_cooked(&self) -> bool {
        self.cooked_send != 0
    }
}
