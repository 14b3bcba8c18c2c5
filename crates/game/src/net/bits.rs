use super::protocol::ProtocolError;

/// Little-endian bit packer used for package bodies.
#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    scratch: u64,
    scratch_bits: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(bytes),
            scratch: 0,
            scratch_bits: 0,
        }
    }

    pub fn write_bits(&mut self, value: u32, bits: u32) {
        assert!(bits <= 32, "cannot write {bits} bits at once");
        if bits == 0 {
            return;
        }

        let masked = (value as u64) & ((1u64 << bits) - 1);
        self.scratch |= masked << self.scratch_bits;
        self.scratch_bits += bits;

        while self.scratch_bits >= 8 {
            self.bytes.push(self.scratch as u8);
            self.scratch >>= 8;
            self.scratch_bits -= 8;
        }
    }

    #[inline]
    pub fn write_bool(&mut self, value: bool) {
        self.write_bits(value as u32, 1);
    }

    /// Writes an unsigned value with a 2 bit size class prefix (4, 8, 16 or 32 bits).
    pub fn write_packed_u32(&mut self, value: u32) {
        let (class, bits) = match value {
            0..=0xF => (0, 4),
            0x10..=0xFF => (1, 8),
            0x100..=0xFFFF => (2, 16),
            _ => (3, 32),
        };
        self.write_bits(class, 2);
        self.write_bits(value, bits);
    }

    pub fn write_packed_i32(&mut self, value: i32) {
        self.write_packed_u32(zigzag_encode(value));
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        for &byte in data {
            self.write_bits(byte as u32, 8);
        }
    }

    /// Appends everything written to `other`, bit for bit.
    pub fn append(&mut self, other: &BitWriter) {
        for &byte in &other.bytes {
            self.write_bits(byte as u32, 8);
        }
        self.write_bits(other.scratch as u32, other.scratch_bits);
    }

    pub fn bit_len(&self) -> usize {
        self.bytes.len() * 8 + self.scratch_bits as usize
    }

    pub fn byte_len(&self) -> usize {
        self.bit_len().div_ceil(8)
    }

    /// Whether appending `other` keeps the buffer within `max_bytes`.
    pub fn fits_with(&self, other: &BitWriter, max_bytes: usize) -> bool {
        (self.bit_len() + other.bit_len()).div_ceil(8) <= max_bytes
    }

    /// Flushes the partial byte and returns the packed buffer.
    pub fn finish(mut self) -> Vec<u8> {
        if self.scratch_bits > 0 {
            self.bytes.push(self.scratch as u8);
        }
        self.bytes
    }
}

#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.position
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn read_bits(&mut self, bits: u32) -> Result<u32, ProtocolError> {
        assert!(bits <= 32, "cannot read {bits} bits at once");
        let bits = bits as usize;
        if bits > self.remaining_bits() {
            return Err(ProtocolError::ReadPastEnd {
                needed: bits,
                remaining: self.remaining_bits(),
            });
        }

        let mut value = 0u64;
        let mut read = 0;
        while read < bits {
            let byte = self.data[self.position / 8];
            let offset = self.position % 8;
            let take = (8 - offset).min(bits - read);
            let chunk = (byte >> offset) as u64 & ((1u64 << take) - 1);
            value |= chunk << read;
            read += take;
            self.position += take;
        }

        Ok(value as u32)
    }

    #[inline]
    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_bits(1)? == 1)
    }

    pub fn read_packed_u32(&mut self) -> Result<u32, ProtocolError> {
        let bits = match self.read_bits(2)? {
            0 => 4,
            1 => 8,
            2 => 16,
            _ => 32,
        };
        self.read_bits(bits)
    }

    pub fn read_packed_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(zigzag_decode(self.read_packed_u32()?))
    }

    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<(), ProtocolError> {
        for byte in out.iter_mut() {
            *byte = self.read_bits(8)? as u8;
        }
        Ok(())
    }
}

#[inline]
pub fn zigzag_encode(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

#[inline]
pub fn zigzag_decode(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// Interprets the low `bits` bits of `value` as a two's complement number.
#[inline]
pub fn sign_extend(value: u32, bits: u32) -> u32 {
    if bits == 0 || bits >= 32 {
        return value;
    }
    let shift = 32 - bits;
    (((value << shift) as i32) >> shift) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_widths_survive_byte_boundaries() {
        let mut writer = BitWriter::new();
        writer.write_bits(0b101, 3);
        writer.write_bool(true);
        writer.write_bits(0xABCD, 16);
        writer.write_bits(u32::MAX, 32);
        writer.write_packed_u32(300);
        writer.write_packed_i32(-7);
        writer.write_bytes(b"hi");
        let bits = writer.bit_len();
        let data = writer.finish();
        assert_eq!(data.len(), bits.div_ceil(8));

        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bits(3).unwrap(), 0b101);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_bits(16).unwrap(), 0xABCD);
        assert_eq!(reader.read_bits(32).unwrap(), u32::MAX);
        assert_eq!(reader.read_packed_u32().unwrap(), 300);
        assert_eq!(reader.read_packed_i32().unwrap(), -7);
        let mut text = [0u8; 2];
        reader.read_bytes(&mut text).unwrap();
        assert_eq!(&text, b"hi");
    }

    #[test]
    fn test_packed_values_pick_smallest_class() {
        let mut writer = BitWriter::new();
        writer.write_packed_u32(9);
        assert_eq!(writer.bit_len(), 6);
        writer.write_packed_u32(70_000);
        assert_eq!(writer.bit_len(), 6 + 34);
    }

    #[test]
    fn test_reading_past_end_fails() {
        let data = [0xFFu8];
        let mut reader = BitReader::new(&data);
        assert!(reader.read_bits(6).is_ok());
        assert_eq!(
            reader.read_bits(3),
            Err(ProtocolError::ReadPastEnd {
                needed: 3,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_zigzag_and_sign_extension() {
        for value in [0, 1, -1, 63, -64, i32::MAX, i32::MIN] {
            assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
        assert_eq!(sign_extend(0b1111, 4) as i32, -1);
        assert_eq!(sign_extend(0b0111, 4) as i32, 7);
    }
}
