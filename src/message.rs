use crate::fragmentation::TransferKey;
use crate::vle::{VarLenCoding, Vle8_16_32};
use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Message ids consumed by the transport itself. Application message ids must not collide
///  with these; they are dispatched internally and never reach the registered handler.
pub mod msg_id {
    pub const PING_REQUEST: u32 = 1;
    pub const PING_REPLY: u32 = 2;
    pub const FLOW_CONTROL_REQUEST: u32 = 3;
    pub const PACKET_ACK: u32 = 4;
    pub const DISCONNECT: u32 = 0x3fff_ffff;
    pub const DISCONNECT_ACK: u32 = 0x3fff_fffe;

    pub fn is_internal(id: u32) -> bool {
        matches!(
            id,
            PING_REQUEST | PING_REPLY | FLOW_CONTROL_REQUEST | PACKET_ACK | DISCONNECT | DISCONNECT_ACK
        )
    }
}

pub const MAX_PRIORITY: u32 = u32::MAX;

/// reliable message numbers live in a wrapping 31-bit space
pub const RELIABLE_NUMBER_MASK: u32 = 0x7fff_ffff;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FragmentInfo {
    pub transfer: TransferKey,
    pub index: u32,
    pub total_fragments: u32,
}

/// One queued application or control message. Identity is (message id, optional content id,
///  reliable message number if reliable).
///
/// Ownership moves with protocol state: accept queue -> outbound priority queue -> (if packed
///  into a reliable datagram) that datagram's ack track -> back to the outbound queue on
///  timeout, or back to the pool on ack. A message is never referenced from two of these
///  places at once.
#[derive(Debug)]
pub struct NetworkMessage {
    pub id: u32,
    pub content_id: u32,
    pub priority: u32,
    pub reliable: bool,
    pub in_order: bool,
    pub obsolete: bool,
    /// monotonically increasing over all outbound messages; the FIFO tie-break for equal
    ///  priorities and the ordering key for content-id obsolescence
    pub message_number: u64,
    pub reliable_message_number: u32,
    pub fragment: Option<FragmentInfo>,
    pub send_count: u32,
    pub payload: Vec<u8>,
}

impl NetworkMessage {
    fn new() -> NetworkMessage {
        NetworkMessage {
            id: 0,
            content_id: 0,
            priority: 0,
            reliable: false,
            in_order: false,
            obsolete: false,
            message_number: 0,
            reliable_message_number: 0,
            fragment: None,
            send_count: 0,
            payload: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.id = 0;
        self.content_id = 0;
        self.priority = 0;
        self.reliable = false;
        self.in_order = false;
        self.obsolete = false;
        self.message_number = 0;
        self.reliable_message_number = 0;
        self.fragment = None;
        self.send_count = 0;
        self.payload.clear();
    }

    /// true for messages that carry the message id on the wire (unfragmented messages and
    ///  the first fragment of a transfer)
    pub fn carries_message_id(&self) -> bool {
        match &self.fragment {
            None => true,
            Some(f) => f.index == 0,
        }
    }

    /// Upper bound for the bytes this message occupies inside a datagram: message header,
    ///  VLE-encoded fields and payload. The reliable number delta is accounted with its
    ///  2-byte maximum since the datagram's base number is not known at sizing time.
    pub fn packed_size(&self) -> usize {
        let id_len = if self.carries_message_id() {
            Vle8_16_32::encoded_len(self.id)
        }
        else {
            0
        };
        let reliable_len = if self.reliable { 2 } else { 0 };
        let fragment_len = match &self.fragment {
            None => 0,
            Some(f) if f.index == 0 => Vle8_16_32::encoded_len(f.total_fragments) + 1,
            Some(f) => 1 + Vle8_16_32::encoded_len(f.index),
        };

        MessageHeader::SERIALIZED_LEN + id_len + reliable_len + fragment_len + self.payload.len()
    }
}

/// The 2-byte header preceding each message within a datagram. The content length covers the
///  VLE-encoded message id (where present) plus the payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub first_fragment: bool,
    pub fragmented: bool,
    pub in_order: bool,
    pub reliable: bool,
    pub content_len: u16,
}

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u16>();
    pub const MAX_CONTENT_LEN: u16 = (1 << 11) - 1;

    const FLAG_FIRST_FRAGMENT: u16 = 1 << 15;
    const FLAG_FRAGMENTED: u16 = 1 << 14;
    const FLAG_IN_ORDER: u16 = 1 << 13;
    const FLAG_RELIABLE: u16 = 1 << 12;

    pub fn for_message(msg: &NetworkMessage, content_len: u16) -> MessageHeader {
        MessageHeader {
            first_fragment: msg.fragment.map(|f| f.index == 0).unwrap_or(false),
            fragmented: msg.fragment.is_some(),
            in_order: msg.in_order,
            reliable: msg.reliable,
            content_len,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.content_len <= Self::MAX_CONTENT_LEN);

        let mut value = self.content_len;
        if self.first_fragment {
            value |= Self::FLAG_FIRST_FRAGMENT;
        }
        if self.fragmented {
            value |= Self::FLAG_FRAGMENTED;
        }
        if self.in_order {
            value |= Self::FLAG_IN_ORDER;
        }
        if self.reliable {
            value |= Self::FLAG_RELIABLE;
        }
        buf.put_u16_le(value);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        let value = buf.try_get_u16_le()?;

        let first_fragment = value & Self::FLAG_FIRST_FRAGMENT != 0;
        let header = MessageHeader {
            first_fragment,
            // a first fragment implies the fragmented flag even if the sender left it clear
            fragmented: value & Self::FLAG_FRAGMENTED != 0 || first_fragment,
            in_order: value & Self::FLAG_IN_ORDER != 0,
            reliable: value & Self::FLAG_RELIABLE != 0,
            content_len: value & Self::MAX_CONTENT_LEN,
        };
        if header.content_len == 0 {
            bail!("message with zero content length");
        }
        Ok(header)
    }
}

/// Preallocated message descriptors. Returning a message keeps its payload allocation
///  around, so steady-state traffic runs without heap churn.
pub struct MessagePool {
    capacity: usize,
    pool: Mutex<Vec<NetworkMessage>>,
}

impl MessagePool {
    pub fn new(capacity: usize) -> MessagePool {
        MessagePool {
            capacity,
            pool: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn get(&self) -> NetworkMessage {
        if let Some(mut msg) = self.pool.lock().unwrap().pop() {
            trace!("reusing message descriptor from pool");
            msg.reset();
            return msg;
        }

        debug!("message pool empty: allocating new descriptor");
        NetworkMessage::new()
    }

    pub fn ret(&self, msg: NetworkMessage) {
        let mut pool = self.pool.lock().unwrap();
        if pool.len() < self.capacity {
            pool.push(msg);
        }
        else {
            debug!("message pool full: discarding returned descriptor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn message(reliable: bool, fragment: Option<FragmentInfo>, payload_len: usize) -> NetworkMessage {
        let mut msg = NetworkMessage::new();
        msg.id = 42;
        msg.reliable = reliable;
        msg.fragment = fragment;
        msg.payload = vec![0; payload_len];
        msg
    }

    #[rstest]
    #[case::plain(message(false, None, 10), 2 + 1 + 10)]
    #[case::reliable(message(true, None, 10), 2 + 1 + 2 + 10)]
    #[case::first_fragment(message(true, Some(FragmentInfo { transfer: 0, index: 0, total_fragments: 5 }), 10), 2 + 1 + 2 + 1 + 1 + 10)]
    #[case::later_fragment(message(true, Some(FragmentInfo { transfer: 0, index: 3, total_fragments: 5 }), 10), 2 + 2 + 1 + 1 + 10)]
    #[case::large_id({ let mut m = message(false, None, 4); m.id = 100_000; m }, 2 + 4 + 4)]
    fn test_packed_size(#[case] msg: NetworkMessage, #[case] expected: usize) {
        assert_eq!(msg.packed_size(), expected);
    }

    #[rstest]
    #[case::plain(MessageHeader { first_fragment: false, fragmented: false, in_order: false, reliable: false, content_len: 7 })]
    #[case::reliable(MessageHeader { first_fragment: false, fragmented: false, in_order: false, reliable: true, content_len: 1 })]
    #[case::in_order(MessageHeader { first_fragment: false, fragmented: false, in_order: true, reliable: false, content_len: 100 })]
    #[case::fragment(MessageHeader { first_fragment: false, fragmented: true, in_order: false, reliable: true, content_len: 470 })]
    #[case::first_fragment(MessageHeader { first_fragment: true, fragmented: true, in_order: false, reliable: true, content_len: 470 })]
    #[case::max_content(MessageHeader { first_fragment: false, fragmented: false, in_order: false, reliable: false, content_len: MessageHeader::MAX_CONTENT_LEN })]
    fn test_header_roundtrip(#[case] header: MessageHeader) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), MessageHeader::SERIALIZED_LEN);

        let mut read: &[u8] = &buf;
        let deser = MessageHeader::deser(&mut read).unwrap();
        assert!(read.is_empty());
        assert_eq!(deser, header);
    }

    #[test]
    fn test_header_first_fragment_implies_fragmented() {
        let mut buf = BytesMut::new();
        buf.put_u16_le((1 << 15) | 10);

        let mut read: &[u8] = &buf;
        let header = MessageHeader::deser(&mut read).unwrap();
        assert!(header.first_fragment);
        assert!(header.fragmented);
    }

    #[test]
    fn test_header_rejects_zero_content_length() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(1 << 12);

        let mut read: &[u8] = &buf;
        assert!(MessageHeader::deser(&mut read).is_err());
    }

    #[test]
    fn test_pool_reuses_and_resets() {
        let pool = MessagePool::new(2);

        let mut msg = pool.get();
        msg.id = 99;
        msg.reliable = true;
        msg.payload.extend_from_slice(&[1, 2, 3]);
        pool.ret(msg);

        let msg = pool.get();
        assert_eq!(msg.id, 0);
        assert!(!msg.reliable);
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn test_pool_discards_beyond_capacity() {
        let pool = MessagePool::new(1);
        pool.ret(NetworkMessage::new());
        pool.ret(NetworkMessage::new());
        assert_eq!(pool.pool.lock().unwrap().len(), 1);
    }
}
