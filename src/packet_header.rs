use crate::packet_id::PacketId;
use crate::vle::{VarLenCoding, Vle16_32, Vle8_16};
use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

/// The header starting every datagram: a flag byte carrying the low 6 bits of the packet id,
///  the high 16 bits of the packet id, and two optional fields gated by the flag bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_id: PacketId,
    /// present iff the datagram contains reliable messages; their reliable numbers are
    ///  encoded as deltas from this base
    pub base_reliable_number: Option<u32>,
    /// present iff the datagram contains in-order messages: the modular distance to the
    ///  previous datagram that carried in-order messages, 0 if there was none
    pub order_delta: Option<u16>,
}

impl PacketHeader {
    /// flag byte + high 16 bits of the packet id
    pub const FIXED_LEN: usize = 3;

    const FLAG_IN_ORDER: u8 = 1 << 7;
    const FLAG_RELIABLE: u8 = 1 << 6;
    const PACKET_ID_LOW_BITS: u32 = 6;
    const PACKET_ID_LOW_MASK: u8 = (1 << Self::PACKET_ID_LOW_BITS) - 1;

    pub fn serialized_len(&self) -> usize {
        let base_len = match self.base_reliable_number {
            Some(base) => Vle16_32::encoded_len(base),
            None => 0,
        };
        let delta_len = match self.order_delta {
            Some(delta) => Vle8_16::encoded_len(delta as u32),
            None => 0,
        };
        Self::FIXED_LEN + base_len + delta_len
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let raw_id = self.packet_id.to_raw();

        let mut flags = (raw_id as u8) & Self::PACKET_ID_LOW_MASK;
        if self.base_reliable_number.is_some() {
            flags |= Self::FLAG_RELIABLE;
        }
        if self.order_delta.is_some() {
            flags |= Self::FLAG_IN_ORDER;
        }

        buf.put_u8(flags);
        buf.put_u16_le((raw_id >> Self::PACKET_ID_LOW_BITS) as u16);

        if let Some(base) = self.base_reliable_number {
            Vle16_32::encode(base, buf);
        }
        if let Some(delta) = self.order_delta {
            Vle8_16::encode(delta as u32, buf);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::FIXED_LEN {
            bail!("packet header needs at least {} bytes, got {}", Self::FIXED_LEN, buf.remaining());
        }

        let flags = buf.try_get_u8()?;
        let high = buf.try_get_u16_le()?;
        let packet_id = PacketId::from_raw(((high as u32) << Self::PACKET_ID_LOW_BITS) | (flags & Self::PACKET_ID_LOW_MASK) as u32);

        let base_reliable_number = if flags & Self::FLAG_RELIABLE != 0 {
            Some(Vle16_32::decode(buf)?)
        }
        else {
            None
        };

        let order_delta = if flags & Self::FLAG_IN_ORDER != 0 {
            Some(Vle8_16::decode(buf)? as u16)
        }
        else {
            None
        };

        Ok(PacketHeader {
            packet_id,
            base_reliable_number,
            order_delta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::minimal(PacketHeader { packet_id: PacketId::ZERO, base_reliable_number: None, order_delta: None }, 3)]
    #[case::large_id(PacketHeader { packet_id: PacketId::from_raw(0x3f_ffff), base_reliable_number: None, order_delta: None }, 3)]
    #[case::reliable_small_base(PacketHeader { packet_id: PacketId::from_raw(77), base_reliable_number: Some(5), order_delta: None }, 5)]
    #[case::reliable_large_base(PacketHeader { packet_id: PacketId::from_raw(77), base_reliable_number: Some(0x7fff_ffff), order_delta: None }, 7)]
    #[case::in_order(PacketHeader { packet_id: PacketId::from_raw(77), base_reliable_number: None, order_delta: Some(1) }, 4)]
    #[case::all_fields(PacketHeader { packet_id: PacketId::from_raw(0x15_5555), base_reliable_number: Some(100_000), order_delta: Some(300) }, 9)]
    fn test_roundtrip(#[case] header: PacketHeader, #[case] expected_len: usize) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), expected_len);
        assert_eq!(header.serialized_len(), expected_len);

        let mut read: &[u8] = &buf;
        let deser = PacketHeader::deser(&mut read).unwrap();
        assert!(read.is_empty());
        assert_eq!(deser, header);
    }

    #[test]
    fn test_wire_layout() {
        let header = PacketHeader {
            // low 6 bits: 0b10_1010, high 16 bits: 0x1234
            packet_id: PacketId::from_raw((0x1234 << 6) | 0b10_1010),
            base_reliable_number: Some(5),
            order_delta: None,
        };
        let mut buf = BytesMut::new();
        header.ser(&mut buf);

        assert_eq!(buf.as_ref(), &[0b0100_0000 | 0b10_1010, 0x34, 0x12, 0x05, 0x00]);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::two_bytes(vec![0, 0])]
    #[case::reliable_flag_without_base(vec![0x40, 0, 0])]
    #[case::in_order_flag_without_delta(vec![0x80, 0, 0])]
    fn test_deser_truncated(#[case] bytes: Vec<u8>) {
        let mut read: &[u8] = &bytes;
        assert!(PacketHeader::deser(&mut read).is_err());
    }
}
