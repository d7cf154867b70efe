//! Variable-length integer encodings with fixed threshold schedules. Unlike general-purpose
//!  varints these have at most three size steps, so the encoded length of a value is cheap
//!  to predict when sizing a datagram.
//!
//! Each schedule stores a value in its first unit if it fits, otherwise sets the unit's top
//!  bit as a continuation marker and spills the remaining bits into the next unit(s).
//!  Multi-byte units are little-endian.

use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

pub trait VarLenCoding {
    /// the largest value this schedule can represent
    const MAX_VALUE: u32;

    fn encoded_len(value: u32) -> usize;

    fn encode(value: u32, buf: &mut impl BufMut);

    fn decode(buf: &mut impl Buf) -> anyhow::Result<u32>;
}

/// 1 byte for values up to 7 bits, 2 bytes up to 15 bits
pub struct Vle8_16;

/// 2 bytes for values up to 15 bits, 4 bytes up to 31 bits
pub struct Vle16_32;

/// 1 byte for values up to 7 bits, 2 bytes up to 14 bits, 4 bytes up to 30 bits
pub struct Vle8_16_32;

impl VarLenCoding for Vle8_16 {
    const MAX_VALUE: u32 = (1 << 15) - 1;

    fn encoded_len(value: u32) -> usize {
        if value < (1 << 7) { 1 } else { 2 }
    }

    fn encode(value: u32, buf: &mut impl BufMut) {
        debug_assert!(value <= Self::MAX_VALUE);
        if value < (1 << 7) {
            buf.put_u8(value as u8);
        }
        else {
            buf.put_u8((value as u8 & 0x7f) | 0x80);
            buf.put_u8((value >> 7) as u8);
        }
    }

    fn decode(buf: &mut impl Buf) -> anyhow::Result<u32> {
        let first = buf.try_get_u8()?;
        if first & 0x80 == 0 {
            return Ok(first as u32);
        }
        let second = buf.try_get_u8()?;
        Ok((first as u32 & 0x7f) | ((second as u32) << 7))
    }
}

impl VarLenCoding for Vle16_32 {
    const MAX_VALUE: u32 = (1 << 31) - 1;

    fn encoded_len(value: u32) -> usize {
        if value < (1 << 15) { 2 } else { 4 }
    }

    fn encode(value: u32, buf: &mut impl BufMut) {
        debug_assert!(value <= Self::MAX_VALUE);
        if value < (1 << 15) {
            buf.put_u16_le(value as u16);
        }
        else {
            buf.put_u16_le((value as u16 & 0x7fff) | 0x8000);
            buf.put_u16_le((value >> 15) as u16);
        }
    }

    fn decode(buf: &mut impl Buf) -> anyhow::Result<u32> {
        let first = buf.try_get_u16_le()?;
        if first & 0x8000 == 0 {
            return Ok(first as u32);
        }
        let second = buf.try_get_u16_le()?;
        Ok((first as u32 & 0x7fff) | ((second as u32) << 15))
    }
}

impl VarLenCoding for Vle8_16_32 {
    const MAX_VALUE: u32 = (1 << 30) - 1;

    fn encoded_len(value: u32) -> usize {
        if value < (1 << 7) {
            1
        }
        else if value < (1 << 14) {
            2
        }
        else {
            4
        }
    }

    fn encode(value: u32, buf: &mut impl BufMut) {
        debug_assert!(value <= Self::MAX_VALUE);
        if value < (1 << 7) {
            buf.put_u8(value as u8);
        }
        else if value < (1 << 14) {
            buf.put_u8((value as u8 & 0x7f) | 0x80);
            buf.put_u8((value >> 7) as u8);
        }
        else {
            buf.put_u8((value as u8 & 0x7f) | 0x80);
            buf.put_u8(((value >> 7) as u8 & 0x7f) | 0x80);
            buf.put_u16_le((value >> 14) as u16);
        }
    }

    fn decode(buf: &mut impl Buf) -> anyhow::Result<u32> {
        let first = buf.try_get_u8()?;
        if first & 0x80 == 0 {
            return Ok(first as u32);
        }
        let second = buf.try_get_u8()?;
        if second & 0x80 == 0 {
            return Ok((first as u32 & 0x7f) | ((second as u32) << 7));
        }
        let third = buf.try_get_u16_le()?;
        Ok((first as u32 & 0x7f) | ((second as u32 & 0x7f) << 7) | ((third as u32) << 14))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn roundtrip<C: VarLenCoding>(value: u32) -> (usize, Vec<u8>) {
        let mut buf = BytesMut::new();
        C::encode(value, &mut buf);
        assert_eq!(buf.len(), C::encoded_len(value));

        let mut read: &[u8] = &buf;
        let decoded = C::decode(&mut read).unwrap();
        assert!(read.is_empty());
        assert_eq!(decoded, value);

        (buf.len(), buf.to_vec())
    }

    #[rstest]
    #[case::zero(0, 1)]
    #[case::small(127, 1)]
    #[case::two_bytes(128, 2)]
    #[case::max(Vle8_16::MAX_VALUE, 2)]
    fn test_vle8_16(#[case] value: u32, #[case] expected_len: usize) {
        let (len, _) = roundtrip::<Vle8_16>(value);
        assert_eq!(len, expected_len);
    }

    #[rstest]
    #[case::zero(0, 2)]
    #[case::small(0x7fff, 2)]
    #[case::four_bytes(0x8000, 4)]
    #[case::max(Vle16_32::MAX_VALUE, 4)]
    fn test_vle16_32(#[case] value: u32, #[case] expected_len: usize) {
        let (len, _) = roundtrip::<Vle16_32>(value);
        assert_eq!(len, expected_len);
    }

    #[rstest]
    #[case::zero(0, 1)]
    #[case::small(127, 1)]
    #[case::two_bytes(128, 2)]
    #[case::two_bytes_max((1 << 14) - 1, 2)]
    #[case::four_bytes(1 << 14, 4)]
    #[case::max(Vle8_16_32::MAX_VALUE, 4)]
    fn test_vle8_16_32(#[case] value: u32, #[case] expected_len: usize) {
        let (len, _) = roundtrip::<Vle8_16_32>(value);
        assert_eq!(len, expected_len);
    }

    #[test]
    fn test_exact_byte_patterns() {
        let (_, bytes) = roundtrip::<Vle8_16>(200);
        assert_eq!(bytes, vec![0x80 | (200 & 0x7f) as u8, 200 >> 7]);

        let (_, bytes) = roundtrip::<Vle16_32>(0x1_2345);
        assert_eq!(bytes, vec![0x45, 0xa3, 0x02, 0x00]);

        let (_, bytes) = roundtrip::<Vle8_16_32>(0x1_2345);
        assert_eq!(bytes, vec![0xc5, 0xc6, 0x04, 0x00]);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::continuation_without_rest(vec![0x85])]
    fn test_vle8_16_truncated(#[case] bytes: Vec<u8>) {
        let mut buf: &[u8] = &bytes;
        assert!(Vle8_16::decode(&mut buf).is_err());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::half_first_unit(vec![0x85])]
    #[case::continuation_without_rest(vec![0x85, 0x80])]
    fn test_vle16_32_truncated(#[case] bytes: Vec<u8>) {
        let mut buf: &[u8] = &bytes;
        assert!(Vle16_32::decode(&mut buf).is_err());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::one_continuation(vec![0x85])]
    #[case::two_continuations(vec![0x85, 0x85, 0x01])]
    fn test_vle8_16_32_truncated(#[case] bytes: Vec<u8>) {
        let mut buf: &[u8] = &bytes;
        assert!(Vle8_16_32::decode(&mut buf).is_err());
    }
}
