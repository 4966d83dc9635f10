//! Packet payload reader
//!
//! Byte- and bit-granular decoding over a single packet payload. Bit fields
//! are consumed least-significant-bit first within each byte and may span
//! byte boundaries. Any byte-aligned read discards whatever is left of a
//! partially consumed byte first.

use thiserror::Error;

/// Reader errors. Any of these aborts decoding of the current packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("Unexpected end of payload: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },

    #[error("Wide string is not valid UTF-16")]
    InvalidUtf16,

    #[error("Invalid bit count: {0} (expected 1..=64)")]
    InvalidBitCount(u32),
}

pub type ReadResult<T> = Result<T, ReadError>;

/// Cursor over a packet payload
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    /// Next unread byte
    position: usize,
    /// Bits already taken from `current`; 0 means byte-aligned
    bit_position: u32,
    current: u8,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            bit_position: 0,
            current: 0,
        }
    }

    /// Byte offset of the next byte-aligned read
    pub fn position(&self) -> usize {
        self.position
    }

    /// Whole bytes not yet touched by any read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// Drop the rest of a partially consumed byte
    pub fn align(&mut self) {
        self.bit_position = 0;
    }

    fn take(&mut self, count: usize) -> ReadResult<&'a [u8]> {
        self.align();

        if self.remaining() < count {
            return Err(ReadError::UnexpectedEnd {
                needed: count,
                remaining: self.remaining(),
            });
        }

        let slice = &self.data[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> ReadResult<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> ReadResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> ReadResult<u16> {
        self.take_array().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> ReadResult<u32> {
        self.take_array().map(u32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> ReadResult<u64> {
        self.take_array().map(u64::from_le_bytes)
    }

    pub fn read_f32(&mut self) -> ReadResult<f32> {
        self.take_array().map(f32::from_le_bytes)
    }

    /// Raw span of exactly `count` bytes
    pub fn read_bytes(&mut self, count: usize) -> ReadResult<&'a [u8]> {
        self.take(count)
    }

    /// Bytes up to (not including) the next NUL. The terminator is consumed.
    /// Running off the end before a NUL is an `UnexpectedEnd`.
    pub fn read_cstring(&mut self) -> ReadResult<&'a [u8]> {
        self.align();

        let rest = &self.data[self.position..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ReadError::UnexpectedEnd {
                needed: rest.len() + 1,
                remaining: rest.len(),
            })?;

        self.position += end + 1;
        Ok(&rest[..end])
    }

    /// A u32 count of UTF-16 code units followed by the units, little-endian
    pub fn read_wide_string(&mut self) -> ReadResult<String> {
        let units = self.read_u32()? as usize;
        let byte_len = units.checked_mul(2).ok_or(ReadError::UnexpectedEnd {
            needed: usize::MAX,
            remaining: self.remaining(),
        })?;

        let bytes = self.take(byte_len)?;
        let code_units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        String::from_utf16(&code_units).map_err(|_| ReadError::InvalidUtf16)
    }

    /// Next `count` bits as an unsigned integer, LSB first
    pub fn read_bits(&mut self, count: u32) -> ReadResult<u64> {
        if !(1..=64).contains(&count) {
            return Err(ReadError::InvalidBitCount(count));
        }

        let mut value = 0u64;
        let mut filled = 0u32;

        while filled < count {
            if self.bit_position == 0 {
                if self.position >= self.data.len() {
                    return Err(ReadError::UnexpectedEnd {
                        needed: 1,
                        remaining: 0,
                    });
                }
                self.current = self.data[self.position];
                self.position += 1;
            }

            let available = 8 - self.bit_position;
            let taken = available.min(count - filled);
            let mask = (1u16 << taken) - 1;
            let bits = (u16::from(self.current) >> self.bit_position) & mask;

            value |= u64::from(bits) << filled;
            filled += taken;
            self.bit_position = (self.bit_position + taken) % 8;
        }

        Ok(value)
    }

    pub fn read_bit(&mut self) -> ReadResult<bool> {
        Ok(self.read_bits(1)? == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_integers() {
        let data = [
            0xAB, // u8
            0x34, 0x12, // u16
            0x78, 0x56, 0x34, 0x12, // u32
            0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // u64
        ];
        let mut reader = PacketReader::new(&data);

        assert_eq!(reader.read_u8().unwrap(), 0xAB);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_u32().unwrap(), 0x1234_5678);
        assert_eq!(reader.read_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_unexpected_end() {
        let mut reader = PacketReader::new(&[1, 2, 3]);
        assert_eq!(
            reader.read_u32(),
            Err(ReadError::UnexpectedEnd { needed: 4, remaining: 3 })
        );

        let mut reader = PacketReader::new(&[]);
        assert!(reader.read_u8().is_err());
        assert!(reader.read_bits(1).is_err());
        assert_eq!(reader.read_bytes(0).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn test_bits_lsb_first() {
        let mut reader = PacketReader::new(&[0xD6]);
        assert_eq!(reader.read_bits(5).unwrap(), 22);
        assert_eq!(reader.read_bits(3).unwrap(), 6);
        assert!(reader.read_bits(1).is_err());
    }

    #[test]
    fn test_bits_span_bytes() {
        // 12 bits 0xABC then 4 bits 0x5
        let mut reader = PacketReader::new(&[0xBC, 0x5A]);
        assert_eq!(reader.read_bits(12).unwrap(), 0xABC);
        assert_eq!(reader.read_bits(4).unwrap(), 0x5);
    }

    #[test]
    fn test_full_width_bits() {
        let data = u64::MAX.to_le_bytes();
        let mut reader = PacketReader::new(&data);
        assert_eq!(reader.read_bits(64).unwrap(), u64::MAX);
    }

    #[test]
    fn test_invalid_bit_count() {
        let mut reader = PacketReader::new(&[0xFF; 16]);
        assert_eq!(reader.read_bits(0), Err(ReadError::InvalidBitCount(0)));
        assert_eq!(reader.read_bits(65), Err(ReadError::InvalidBitCount(65)));
    }

    #[test]
    fn test_aligned_read_discards_leftover_bits() {
        let mut reader = PacketReader::new(&[0b0000_0101, 0x2A]);
        assert_eq!(reader.read_bits(3).unwrap(), 0b101);
        // The remaining 5 bits of the first byte are dropped
        assert_eq!(reader.read_u8().unwrap(), 0x2A);
    }

    #[test]
    fn test_cstring() {
        let mut reader = PacketReader::new(b"realm\0rest");
        assert_eq!(reader.read_cstring().unwrap(), b"realm");
        assert_eq!(reader.read_bytes(4).unwrap(), b"rest");

        let mut reader = PacketReader::new(b"\0");
        assert_eq!(reader.read_cstring().unwrap(), b"");

        let mut reader = PacketReader::new(b"no terminator");
        assert_eq!(
            reader.read_cstring(),
            Err(ReadError::UnexpectedEnd {
                needed: 14,
                remaining: 13
            })
        );
        assert_eq!(reader.remaining(), 13);
    }

    #[test]
    fn test_wide_string() {
        let mut data = vec![2, 0, 0, 0];
        data.extend_from_slice(&[b'h', 0, b'i', 0]);
        let mut reader = PacketReader::new(&data);
        assert_eq!(reader.read_wide_string().unwrap(), "hi");
    }

    #[test]
    fn test_wide_string_lone_surrogate() {
        let data = [1, 0, 0, 0, 0x00, 0xD8];
        let mut reader = PacketReader::new(&data);
        assert_eq!(reader.read_wide_string(), Err(ReadError::InvalidUtf16));
    }

    #[test]
    fn test_wide_string_truncated() {
        let data = [0xFF, 0xFF, 0xFF, 0xFF, b'a', 0];
        let mut reader = PacketReader::new(&data);
        assert!(matches!(
            reader.read_wide_string(),
            Err(ReadError::UnexpectedEnd { .. })
        ));
    }
}
