//! Property-based tests for the payload cursors and packet framing

#![allow(clippy::unwrap_used)]

use bytes::BytesMut;
use gatehouse::protocol::{
    extract_packets, frame_packet, PacketReader, PacketWriter, RawPacket, HEADER_SIZE,
};
use proptest::prelude::*;

fn mask(value: u64, width: u32) -> u64 {
    if width == 64 {
        value
    } else {
        value & ((1u64 << width) - 1)
    }
}

/// Mixed field: either a bit field or a byte-aligned u32
#[derive(Debug, Clone)]
enum Field {
    Bits(u64, u32),
    Word(u32),
}

fn field() -> impl Strategy<Value = Field> {
    prop_oneof![
        3 => (any::<u64>(), 1u32..=64).prop_map(|(value, width)| Field::Bits(mask(value, width), width)),
        1 => any::<u32>().prop_map(Field::Word),
    ]
}

fn packet() -> impl Strategy<Value = (u16, Vec<u8>)> {
    (any::<u16>(), prop::collection::vec(any::<u8>(), 0..300))
}

// Property: any sequence of (value, width) bit fields reads back unchanged
proptest! {
    #[test]
    fn prop_bit_fields_roundtrip(
        fields in prop::collection::vec((any::<u64>(), 1u32..=64), 1..64)
    ) {
        let mut writer = PacketWriter::new();
        for &(value, width) in &fields {
            writer.write_bits(value, width);
        }
        let payload = writer.into_bytes();

        let total_bits: u32 = fields.iter().map(|&(_, width)| width).sum();
        prop_assert_eq!(payload.len(), total_bits.div_ceil(8) as usize);

        let mut reader = PacketReader::new(&payload);
        for &(value, width) in &fields {
            prop_assert_eq!(reader.read_bits(width).unwrap(), mask(value, width));
        }
    }
}

// Property: byte-aligned fields interleaved with bit fields stay in sync on
// both sides of the wire
proptest! {
    #[test]
    fn prop_mixed_alignment_roundtrip(fields in prop::collection::vec(field(), 1..40)) {
        let mut writer = PacketWriter::new();
        for field in &fields {
            match *field {
                Field::Bits(value, width) => writer.write_bits(value, width),
                Field::Word(value) => writer.write_u32(value),
            }
        }
        let payload = writer.into_bytes();

        let mut reader = PacketReader::new(&payload);
        for field in &fields {
            match *field {
                Field::Bits(value, width) => prop_assert_eq!(reader.read_bits(width).unwrap(), value),
                Field::Word(value) => prop_assert_eq!(reader.read_u32().unwrap(), value),
            }
        }
        prop_assert_eq!(reader.remaining(), 0);
    }
}

// Property: wide strings survive the UTF-16 round trip, surrogates included
proptest! {
    #[test]
    fn prop_wide_string_roundtrip(text in "\\PC{0,40}") {
        let mut writer = PacketWriter::new();
        writer.write_wide_string(&text);
        writer.write_u8(0xEE);
        let payload = writer.into_bytes();

        let units = text.encode_utf16().count();
        prop_assert_eq!(payload.len(), 4 + 2 * units + 1);

        let mut reader = PacketReader::new(&payload);
        prop_assert_eq!(reader.read_wide_string().unwrap(), text);
        prop_assert_eq!(reader.read_u8().unwrap(), 0xEE);
    }
}

// Property: however the stream is chunked, extraction yields the same packets
// in the same order and leaves nothing behind
proptest! {
    #[test]
    fn prop_fragmentation_idempotent(
        packets in prop::collection::vec(packet(), 1..12),
        cuts in prop::collection::vec(1usize..64, 1..200),
    ) {
        let mut stream = Vec::new();
        for (opcode, payload) in &packets {
            stream.extend_from_slice(&frame_packet(*opcode, payload).unwrap());
        }

        let mut buf = BytesMut::new();
        let mut extracted: Vec<RawPacket> = Vec::new();
        let mut offset = 0;
        let mut cut = cuts.iter().cycle();

        while offset < stream.len() {
            let end = (offset + cut.next().copied().unwrap_or(1)).min(stream.len());
            buf.extend_from_slice(&stream[offset..end]);
            extracted.extend(extract_packets(&mut buf));
            offset = end;
        }

        prop_assert!(buf.is_empty());
        prop_assert_eq!(extracted.len(), packets.len());
        for (got, (opcode, payload)) in extracted.iter().zip(&packets) {
            prop_assert_eq!(got.opcode, *opcode);
            prop_assert_eq!(&got.payload[..], &payload[..]);
        }
    }
}

// Property: a complete packet followed by a truncated one yields exactly the
// first packet, with the truncated bytes left as the remainder
proptest! {
    #[test]
    fn prop_partial_tail(
        (opcode, payload) in packet(),
        (tail_opcode, tail_payload) in packet(),
        keep in 0usize..1000,
    ) {
        let complete = frame_packet(opcode, &payload).unwrap();
        let truncated = frame_packet(tail_opcode, &tail_payload).unwrap();
        let keep = keep % truncated.len();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&complete);
        buf.extend_from_slice(&truncated[..keep]);

        let extracted = extract_packets(&mut buf);
        prop_assert_eq!(extracted, vec![RawPacket::new(opcode, payload)]);
        prop_assert_eq!(&buf[..], &truncated[..keep]);
        prop_assert!(keep < HEADER_SIZE + tail_payload.len());
    }
}
