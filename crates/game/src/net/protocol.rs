use bitflags::bitflags;

pub const MAX_PACKAGE_SIZE: usize = 1200;
pub const MAX_FRAGMENTS: usize = 16;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x5354_4C58;
pub const DEFAULT_PORT: u16 = 27015;
pub const DEFAULT_TICK_RATE: u32 = 60;

/// Number of packages covered by the ack mask carried in every header.
pub const ACK_WINDOW: usize = 64;

pub const PACKAGE_HEADER_SIZE: usize = 13;
pub const FRAGMENT_HEADER_SIZE: usize = 2;
/// Payload bytes each fragment carries.
pub const FRAGMENT_PAYLOAD_SIZE: usize = MAX_PACKAGE_SIZE - PACKAGE_HEADER_SIZE - FRAGMENT_HEADER_SIZE;
/// Largest body a package can carry once fragmented.
pub const MAX_PACKAGE_BODY: usize = MAX_FRAGMENTS * FRAGMENT_PAYLOAD_SIZE;

const FRAGMENT_FLAG: u8 = 0x80;

bitflags! {
    /// Message blocks present in a package body, in body order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NetworkMessage: u8 {
        const CLIENT_INFO = 1 << 0;
        const MAP_INFO = 1 << 1;
        const SNAPSHOT = 1 << 2;
        const EVENTS = 1 << 3;
        const COMMANDS = 1 << 4;
        const CLIENT_CONFIG = 1 << 5;
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("read past end of package ({needed} bits needed, {remaining} remaining)")]
    ReadPastEnd { needed: usize, remaining: usize },
    #[error("package header is malformed")]
    InvalidHeader,
    #[error("unknown {category} schema {id}")]
    UnknownSchema { category: &'static str, id: u16 },
    #[error("malformed schema: {0}")]
    InvalidSchema(String),
    #[error("baseline snapshot {0} is no longer available")]
    MissingBaseline(u32),
    #[error("package of {size} bytes needs too many fragments")]
    PackageTooLarge { size: usize },
    #[error("snapshot references entity type {0} without a schema")]
    MissingEntitySchema(u16),
    #[error("snapshot updates entity {0} missing from its baseline")]
    UnknownEntity(u16),
    #[error("snapshot {0} does not fit the snapshot arena")]
    SnapshotOverflow(u32),
}

/// Signed distance from `b` to `a` in the 16 bit package sequence space.
#[inline]
pub fn sequence_diff(a: u16, b: u16) -> i32 {
    a.wrapping_sub(b) as i16 as i32
}

#[inline]
pub fn sequence_greater_than(a: u16, b: u16) -> bool {
    sequence_diff(a, b) > 0
}

/// Signed distance between two snapshot sequences or ticks.
#[inline]
pub fn tick_diff(a: u32, b: u32) -> i64 {
    a.wrapping_sub(b) as i32 as i64
}

#[inline]
pub fn tick_greater_than(a: u32, b: u32) -> bool {
    tick_diff(a, b) > 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub index: u8,
    pub count: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageHeader {
    pub sequence: u16,
    pub ack_sequence: u16,
    pub ack_mask: u64,
    pub content: NetworkMessage,
    pub fragment: Option<Fragment>,
}

impl PackageHeader {
    pub fn new(sequence: u16, ack_sequence: u16, ack_mask: u64, content: NetworkMessage) -> Self {
        Self {
            sequence,
            ack_sequence,
            ack_mask,
            content,
            fragment: None,
        }
    }

    pub fn encoded_len(&self) -> usize {
        PACKAGE_HEADER_SIZE + self.fragment.map_or(0, |_| FRAGMENT_HEADER_SIZE)
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.ack_sequence.to_le_bytes());
        out.extend_from_slice(&self.ack_mask.to_le_bytes());

        let mut flags = self.content.bits();
        if self.fragment.is_some() {
            flags |= FRAGMENT_FLAG;
        }
        out.push(flags);

        if let Some(fragment) = self.fragment {
            out.push(fragment.index);
            out.push(fragment.count);
        }
    }

    /// Parses a header, returning it together with the header length.
    pub fn read(data: &[u8]) -> Result<(Self, usize), ProtocolError> {
        if data.len() < PACKAGE_HEADER_SIZE {
            return Err(ProtocolError::InvalidHeader);
        }

        let sequence = u16::from_le_bytes([data[0], data[1]]);
        let ack_sequence = u16::from_le_bytes([data[2], data[3]]);
        let mut mask = [0u8; 8];
        mask.copy_from_slice(&data[4..12]);
        let ack_mask = u64::from_le_bytes(mask);

        let flags = data[12];
        let content =
            NetworkMessage::from_bits(flags & !FRAGMENT_FLAG).ok_or(ProtocolError::InvalidHeader)?;

        let mut header = Self::new(sequence, ack_sequence, ack_mask, content);
        let mut len = PACKAGE_HEADER_SIZE;

        if flags & FRAGMENT_FLAG != 0 {
            if data.len() < PACKAGE_HEADER_SIZE + FRAGMENT_HEADER_SIZE {
                return Err(ProtocolError::InvalidHeader);
            }
            let index = data[PACKAGE_HEADER_SIZE];
            let count = data[PACKAGE_HEADER_SIZE + 1];
            if count < 2 || index >= count || count as usize > MAX_FRAGMENTS {
                return Err(ProtocolError::InvalidHeader);
            }
            header.fragment = Some(Fragment { index, count });
            len += FRAGMENT_HEADER_SIZE;
        }

        Ok((header, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(2, 1, true)]
    #[case(1, 2, false)]
    #[case(0, u16::MAX, true)]
    #[case(u16::MAX, 0, false)]
    #[case(5, 65530, true)]
    #[case(32767, 0, true)]
    #[case(1, 1, false)]
    fn test_sequence_comparison(#[case] a: u16, #[case] b: u16, #[case] expected: bool) {
        assert_eq!(sequence_greater_than(a, b), expected);
    }

    #[test]
    fn test_sequence_diff_wraps() {
        assert_eq!(sequence_diff(2, 65534), 4);
        assert_eq!(sequence_diff(65534, 2), -4);
        assert_eq!(tick_diff(3, u32::MAX), 4);
        assert!(tick_greater_than(0, u32::MAX));
    }

    #[test]
    fn test_header_roundtrip_with_fragment() {
        let mut header = PackageHeader::new(
            65535,
            12,
            0xDEAD_BEEF_0000_0001,
            NetworkMessage::SNAPSHOT | NetworkMessage::EVENTS,
        );
        header.fragment = Some(Fragment { index: 1, count: 3 });

        let mut out = Vec::new();
        header.write(&mut out);
        assert_eq!(out.len(), header.encoded_len());

        let (parsed, len) = PackageHeader::read(&out).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(len, PACKAGE_HEADER_SIZE + FRAGMENT_HEADER_SIZE);
    }

    #[test]
    fn test_header_rejects_garbage() {
        assert_eq!(
            PackageHeader::read(&[1, 2, 3]),
            Err(ProtocolError::InvalidHeader)
        );

        let mut out = Vec::new();
        PackageHeader::new(1, 0, 0, NetworkMessage::empty()).write(&mut out);
        out[12] = 0x40;
        assert_eq!(PackageHeader::read(&out), Err(ProtocolError::InvalidHeader));
    }
}
