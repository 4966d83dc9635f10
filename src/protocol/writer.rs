//! Packet payload writer
//!
//! Mirror of [`PacketReader`](super::PacketReader). Bits accumulate in a
//! pending byte that is pushed to the buffer once eight bits are filled.
//! Byte-aligned writes and [`PacketWriter::into_bytes`] flush a partially
//! filled byte first, zero-padding its high bits.

use bytes::{BufMut, Bytes, BytesMut};

/// Append-only payload builder. Never fails.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
    /// Bits already placed in `pending`
    bit_position: u32,
    pending: u8,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Length of the payload if it were finalized now
    pub fn len(&self) -> usize {
        self.buf.len() + usize::from(self.bit_position > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Emit a partially filled byte, padding the unused bits with zero
    pub fn flush_bits(&mut self) {
        if self.bit_position > 0 {
            self.buf.put_u8(self.pending);
            self.pending = 0;
            self.bit_position = 0;
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.flush_bits();
        self.buf.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.flush_bits();
        self.buf.put_u16_le(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.flush_bits();
        self.buf.put_u32_le(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.flush_bits();
        self.buf.put_u64_le(value);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.flush_bits();
        self.buf.put_f32_le(value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.flush_bits();
        self.buf.put_slice(bytes);
    }

    /// Bytes followed by a NUL terminator. `bytes` must not contain a NUL,
    /// otherwise the reader stops at the first one.
    pub fn write_cstring(&mut self, bytes: &[u8]) {
        debug_assert!(!bytes.contains(&0), "cstring contains interior NUL");
        self.write_bytes(bytes);
        self.buf.put_u8(0);
    }

    /// u32 count of UTF-16 code units, then the units little-endian.
    /// Anything past `u32::MAX` units is dropped so the count always matches
    /// what follows it.
    pub fn write_wide_string(&mut self, value: &str) {
        let units: Vec<u16> = value.encode_utf16().collect();
        let count = unit_count(units.len());
        debug_assert_eq!(count as usize, units.len(), "wide string too long");

        self.write_u32(count);
        for unit in units.into_iter().take(count as usize) {
            self.buf.put_u16_le(unit);
        }
    }

    /// Low `count` bits of `value`, LSB first. A count of 0 writes nothing;
    /// counts above 64 are capped at 64.
    pub fn write_bits(&mut self, value: u64, count: u32) {
        debug_assert!(count <= 64, "bit count {} out of range", count);
        let count = count.min(64);

        let mut written = 0u32;
        while written < count {
            let free = 8 - self.bit_position;
            let taken = free.min(count - written);
            let mask = (1u16 << taken) - 1;
            let bits = ((value >> written) as u16) & mask;

            self.pending |= (bits << self.bit_position) as u8;
            self.bit_position += taken;
            written += taken;

            if self.bit_position == 8 {
                self.buf.put_u8(self.pending);
                self.pending = 0;
                self.bit_position = 0;
            }
        }
    }

    pub fn write_bit(&mut self, value: bool) {
        self.write_bits(u64::from(value), 1);
    }

    /// Finalize the payload, flushing any pending bits
    pub fn into_bytes(mut self) -> Bytes {
        self.flush_bits();
        self.buf.freeze()
    }
}

fn unit_count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::super::PacketReader;
    use super::*;

    #[test]
    fn test_bit_packing_example() {
        let mut writer = PacketWriter::new();
        writer.write_bits(22, 5);
        writer.write_bits(6, 3);
        writer.flush_bits();
        assert_eq!(&writer.into_bytes()[..], &[0xD6]);
    }

    #[test]
    fn test_partial_byte_is_zero_padded() {
        let mut writer = PacketWriter::new();
        writer.write_bits(0b101, 3);
        assert_eq!(writer.len(), 1);
        assert_eq!(&writer.into_bytes()[..], &[0b0000_0101]);
    }

    #[test]
    fn test_bits_mask_excess_high_bits() {
        let mut writer = PacketWriter::new();
        writer.write_bits(0xFF, 4);
        writer.write_bits(0, 4);
        assert_eq!(&writer.into_bytes()[..], &[0x0F]);
    }

    #[test]
    fn test_aligned_write_flushes_bits() {
        let mut writer = PacketWriter::new();
        writer.write_bit(true);
        writer.write_u16(0xBEEF);
        writer.write_bits(3, 2);
        assert_eq!(&writer.into_bytes()[..], &[0x01, 0xEF, 0xBE, 0x03]);
    }

    #[test]
    fn test_primitive_roundtrip_boundaries() {
        let mut writer = PacketWriter::new();
        writer.write_u8(0);
        writer.write_u8(u8::MAX);
        writer.write_u16(0);
        writer.write_u16(u16::MAX);
        writer.write_u32(0);
        writer.write_u32(u32::MAX);
        writer.write_u64(0);
        writer.write_u64(u64::MAX);
        writer.write_bytes(&[]);
        writer.write_bytes(&[1, 2, 3]);
        writer.write_cstring(b"");
        writer.write_cstring(b"gatehouse");
        writer.write_wide_string("");
        writer.write_wide_string("Nexus \u{1F30C} ünïcödé");
        writer.write_f32(-1.5);

        let bytes = writer.into_bytes();
        let mut reader = PacketReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 0);
        assert_eq!(reader.read_u8().unwrap(), u8::MAX);
        assert_eq!(reader.read_u16().unwrap(), 0);
        assert_eq!(reader.read_u16().unwrap(), u16::MAX);
        assert_eq!(reader.read_u32().unwrap(), 0);
        assert_eq!(reader.read_u32().unwrap(), u32::MAX);
        assert_eq!(reader.read_u64().unwrap(), 0);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX);
        assert_eq!(reader.read_bytes(0).unwrap(), &[] as &[u8]);
        assert_eq!(reader.read_bytes(3).unwrap(), &[1, 2, 3]);
        assert_eq!(reader.read_cstring().unwrap(), b"");
        assert_eq!(reader.read_cstring().unwrap(), b"gatehouse");
        assert_eq!(reader.read_wide_string().unwrap(), "");
        assert_eq!(reader.read_wide_string().unwrap(), "Nexus \u{1F30C} ünïcödé");
        assert_eq!(reader.read_f32().unwrap(), -1.5);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_wide_string_counts_code_units() {
        let mut writer = PacketWriter::new();
        writer.write_wide_string("\u{1F30C}");
        let bytes = writer.into_bytes();
        // One astral character is two UTF-16 code units
        assert_eq!(&bytes[..4], &[2, 0, 0, 0]);
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn test_zero_width_bits_write_nothing() {
        let mut writer = PacketWriter::new();
        writer.write_bits(0b11, 2);
        writer.write_bits(u64::MAX, 0);
        writer.write_bits(0b1, 1);
        assert_eq!(&writer.into_bytes()[..], &[0b0000_0111]);

        let mut writer = PacketWriter::new();
        writer.write_bits(1, 0);
        assert!(writer.into_bytes().is_empty());
    }

    #[test]
    fn test_wide_string_count_saturates() {
        assert_eq!(unit_count(3), 3);
        assert_eq!(unit_count(u32::MAX as usize), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(unit_count(u32::MAX as usize + 1), u32::MAX);
    }

    #[test]
    fn test_mixed_widths_roundtrip() {
        let fields: [(u64, u32); 6] = [(1, 1), (0x1F, 5), (0, 3), (0xABCDE, 20), (u64::MAX, 64), (2, 2)];

        let mut writer = PacketWriter::new();
        for &(value, width) in &fields {
            writer.write_bits(value, width);
        }
        let bytes = writer.into_bytes();
        // 1 + 5 + 3 + 20 + 64 + 2 = 95 bits -> 12 bytes
        assert_eq!(bytes.len(), 12);

        let mut reader = PacketReader::new(&bytes);
        for &(value, width) in &fields {
            assert_eq!(reader.read_bits(width).unwrap(), value);
        }
    }
}
