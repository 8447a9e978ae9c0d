// bits.rs - MSB-first bit-packed reader/writer over byte buffers.

use bitvec::prelude::*;

use thiserror::Error;

/// Smallest field width accepted by a single read or write.
pub const MIN_FIELD_BITS: usize = 1;

/// Largest field width accepted by a single read or write.
pub const MAX_FIELD_BITS: usize = 32;

/// Error produced by the bit codec.
///
/// Both variants indicate caller bugs rather than runtime conditions and are
/// expected to propagate.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Field width outside the supported `1..=32` range.
    #[error("bit count {0} outside supported range 1..=32")]
    InvalidBitCount(usize),

    /// The reader has fewer bits remaining than the read requires.
    #[error("out of bits: requested {requested}, remaining {remaining}")]
    OutOfBits {
        requested: usize,
        remaining: usize,
    },
}

fn check_width(count: usize) -> Result<(), CodecError> {
    if !(MIN_FIELD_BITS..=MAX_FIELD_BITS).contains(&count) {
        return Err(CodecError::InvalidBitCount(count));
    }
    Ok(())
}

/// Growable bit-level writer.
///
/// Bits within a byte fill from bit 7 (MSB) toward bit 0; multi-byte values
/// land in big-endian network order, so `write_bits(0x1234, 16)` produces
/// `[0x12, 0x34]`.
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    bits: BitVec<u8, Msb0>,
}

impl BitWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a writer with capacity for `bytes` whole bytes.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            bits: BitVec::with_capacity(bytes * 8),
        }
    }

    /// Appends the low `count` bits of `value`, most significant bit first.
    pub fn write_bits(&mut self, value: u32, count: usize) -> Result<(), CodecError> {
        check_width(count)?;
        let masked = if count == 32 {
            value
        } else {
            value & ((1u32 << count) - 1)
        };
        let start = self.bits.len();
        self.bits.resize(start + count, false);
        self.bits[start..].store_be::<u32>(masked);
        Ok(())
    }

    /// Appends a single bit.
    pub fn write_bool(&mut self, value: bool) -> Result<(), CodecError> {
        self.write_bits(u32::from(value), 1)
    }

    /// Appends an 8-bit value.
    pub fn write_u8(&mut self, value: u8) -> Result<(), CodecError> {
        self.write_bits(u32::from(value), 8)
    }

    /// Appends a 16-bit value in network order.
    pub fn write_u16(&mut self, value: u16) -> Result<(), CodecError> {
        self.write_bits(u32::from(value), 16)
    }

    /// Appends a 32-bit value in network order.
    pub fn write_u32(&mut self, value: u32) -> Result<(), CodecError> {
        self.write_bits(value, 32)
    }

    /// Appends a signed 32-bit value in network order.
    pub fn write_i32(&mut self, value: i32) -> Result<(), CodecError> {
        self.write_bits(value as u32, 32)
    }

    /// Appends a floating-point value as signed 16.16 fixed point.
    pub fn write_fixed(&mut self, value: f64) -> Result<(), CodecError> {
        self.write_i32(crate::fixed::to_fixed(value))
    }

    /// Number of bits written so far.
    pub fn bit_len(&self) -> usize {
        self.bits.len()
    }

    /// Consumes the writer, padding the final partial byte with zero bits.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bits.into_vec()
    }
}

/// Bit-level reader over a borrowed byte buffer, symmetric to [`BitWriter`].
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    bits: &'a BitSlice<u8, Msb0>,
    pos: usize,
}

impl<'a> BitReader<'a> {
    /// Creates a reader over `bytes`.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bits: bytes.view_bits::<Msb0>(),
            pos: 0,
        }
    }

    /// Number of unread bits.
    pub fn remaining_bits(&self) -> usize {
        self.bits.len() - self.pos
    }

    /// Reads `count` bits, most significant bit first, zero-extended to u32.
    pub fn read_bits(&mut self, count: usize) -> Result<u32, CodecError> {
        check_width(count)?;
        let remaining = self.remaining_bits();
        if count > remaining {
            return Err(CodecError::OutOfBits {
                requested: count,
                remaining,
            });
        }
        let value = self.bits[self.pos..self.pos + count].load_be::<u32>();
        self.pos += count;
        Ok(value)
    }

    /// Reads a single bit.
    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_bits(1)? != 0)
    }

    /// Reads an 8-bit value.
    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bits(8)? as u8)
    }

    /// Reads a 16-bit value in network order.
    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(self.read_bits(16)? as u16)
    }

    /// Reads a 32-bit value in network order.
    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        self.read_bits(32)
    }

    /// Reads a signed 32-bit value in network order.
    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.read_bits(32)? as i32)
    }

    /// Reads a signed 16.16 fixed-point value as floating point.
    pub fn read_fixed(&mut self) -> Result<f64, CodecError> {
        Ok(crate::fixed::from_fixed(self.read_i32()?))
    }

    /// Advances past `count` bits without decoding them.
    pub fn skip(&mut self, count: usize) -> Result<(), CodecError> {
        let remaining = self.remaining_bits();
        if count > remaining {
            return Err(CodecError::OutOfBits {
                requested: count,
                remaining,
            });
        }
        self.pos += count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bits_fill_from_msb() {
        let mut writer = BitWriter::new();
        writer.write_bits(1, 1).unwrap();
        assert_eq!(writer.into_bytes(), vec![0x80]);
    }

    #[test]
    fn u16_is_big_endian() {
        let mut writer = BitWriter::new();
        writer.write_u16(0x1234).unwrap();
        assert_eq!(writer.into_bytes(), vec![0x12, 0x34]);
    }

    #[test]
    fn unaligned_fields_pack_contiguously() {
        // 3 + 1 + 8 + 4 bits = two bytes, mirroring the sample body prefix.
        let mut writer = BitWriter::new();
        writer.write_bits(0b101, 3).unwrap();
        writer.write_bool(true).unwrap();
        writer.write_u8(0xAB).unwrap();
        writer.write_bits(0, 4).unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(bytes, vec![0b1011_1010, 0b1011_0000]);

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_bits(3).unwrap(), 0b101);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_u8().unwrap(), 0xAB);
        assert_eq!(reader.read_bits(4).unwrap(), 0);
        assert_eq!(reader.remaining_bits(), 0);
    }

    #[test]
    fn value_wider_than_field_is_masked() {
        let mut writer = BitWriter::new();
        writer.write_bits(0x1FF, 4).unwrap();
        assert_eq!(writer.into_bytes(), vec![0xF0]);
    }

    #[test]
    fn rejects_zero_and_oversized_widths() {
        let mut writer = BitWriter::new();
        assert_eq!(
            writer.write_bits(0, 0).unwrap_err(),
            CodecError::InvalidBitCount(0)
        );
        assert_eq!(
            writer.write_bits(0, 33).unwrap_err(),
            CodecError::InvalidBitCount(33)
        );

        let mut reader = BitReader::new(&[0u8; 4]);
        assert_eq!(
            reader.read_bits(0).unwrap_err(),
            CodecError::InvalidBitCount(0)
        );
    }

    #[test]
    fn reader_underflow_reports_remaining() {
        let mut reader = BitReader::new(&[0xFF]);
        reader.read_bits(5).unwrap();
        let err = reader.read_bits(8).unwrap_err();
        assert_eq!(
            err,
            CodecError::OutOfBits {
                requested: 8,
                remaining: 3,
            }
        );
    }

    #[test]
    fn skip_advances_without_decoding() {
        let mut reader = BitReader::new(&[0x0F, 0xF0]);
        reader.skip(4).unwrap();
        assert_eq!(reader.read_u8().unwrap(), 0xFF);
        assert_eq!(reader.remaining_bits(), 4);
        assert!(reader.skip(5).is_err());
    }

    #[test]
    fn signed_values_survive_the_trip() {
        let mut writer = BitWriter::new();
        writer.write_i32(-1).unwrap();
        writer.write_i32(i32::MIN).unwrap();
        let bytes = writer.into_bytes();
        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_i32().unwrap(), -1);
        assert_eq!(reader.read_i32().unwrap(), i32::MIN);
    }

    fn arb_fields() -> impl Strategy<Value = Vec<(u32, usize)>> {
        prop::collection::vec(
            (1usize..=32).prop_flat_map(|width| {
                let max = if width == 32 {
                    u32::MAX
                } else {
                    (1u32 << width) - 1
                };
                (0..=max).prop_map(move |value| (value, width))
            }),
            0..64,
        )
    }

    proptest! {
        #[test]
        fn write_read_round_trip(fields in arb_fields()) {
            let mut writer = BitWriter::new();
            for (value, width) in &fields {
                writer.write_bits(*value, *width).unwrap();
            }
            let total_bits = writer.bit_len();
            let bytes = writer.into_bytes();
            prop_assert_eq!(bytes.len(), total_bits.div_ceil(8));

            let mut reader = BitReader::new(&bytes);
            for (value, width) in &fields {
                prop_assert_eq!(reader.read_bits(*width).unwrap(), *value);
            }
            // Only zero padding may remain.
            prop_assert!(reader.remaining_bits() < 8);
        }
    }
}
