//! Reliable, ordered, fragmentation-capable message transport on top of plain UDP datagrams.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data as
//!   opposed to streams of bytes) between two peers
//! * Reliability is opt-in *per message*: acknowledgement and retransmission are paid for only
//!   where the application asks for them, unreliable messages are fire-and-forget
//! * Several small messages are packed into a single datagram; messages larger than the
//!   datagram budget are fragmented and reassembled transparently
//! * Newer messages can supersede older queued ones: a non-zero *content id* groups messages
//!   into a logical slot, and only the newest member of a slot is worth transmitting
//!   (think "position update for entity 17")
//! * Send rate adapts to observed packet loss with additive increase / multiplicative
//!   decrease; retransmission timeouts are derived from a smoothed RTT estimate (RFC 2988)
//! * A single background worker task multiplexes socket I/O and protocol bookkeeping for
//!   any number of connections; application threads only touch bounded hand-off queues
//!
//! Explicitly *not* goals: competitive congestion control, encryption, NAT traversal,
//! multicast, ordering across distinct connections.
//!
//! ## Wire format
//!
//! All multi-byte integers are little-endian. A datagram starts with a packet header:
//!
//! ```ascii
//! 0:  flags (8 bits):
//!     * bit 7: in-order messages present (an order delta field follows the header)
//!     * bit 6: reliable messages present (the receiver must ack this packet id)
//!     * bits 5-0: low 6 bits of the packet id
//! 1:  high 16 bits of the packet id (u16)
//! *:  base reliable message number (VLE16_32) - only if bit 6 is set; per-message
//!      reliable numbers are encoded as deltas from this base
//! *:  order delta (VLE8_16) - only if bit 7 is set; the modular distance to the previous
//!      datagram that carried in-order messages, 0 if there was none
//! ```
//!
//! Packet ids are wrapping 22-bit counters; "newer than" is modular comparison with a
//! half-range threshold.
//!
//! Each message inside a datagram carries a 2-byte header:
//!
//! ```ascii
//! 0:  u16: bit 15: first fragment / bit 14: fragmented / bit 13: in-order /
//!      bit 12: reliable / bits 11-0: content length (message id + payload, max 2047)
//! *:  reliable message number delta from the packet's base (VLE8_16) - if reliable
//! *:  total number of fragments (VLE8_16_32, >= 2) - if first fragment
//! *:  fragment transfer id (u8) - if fragmented
//! *:  fragment index (VLE8_16_32) - if fragmented and not the first fragment
//! *:  message id (VLE8_16_32) - if unfragmented or first fragment
//! *:  payload bytes
//! ```
//!
//! ## Control messages
//!
//! A handful of message ids are consumed by the transport itself and never reach the
//! application: `PingRequest` / `PingReply` (keepalive and RTT probing), `PacketAck` (a
//! 7-byte base packet id plus a 32-bit bitfield acking the following 32 ids),
//! `Disconnect` / `DisconnectAck` (teardown handshake), and `FlowControlRequest`
//! (reserved).

pub mod ack_track;
pub mod buffer_pool;
pub mod config;
pub mod connection;
pub mod flow_control;
pub mod fragmentation;
pub mod message;
pub mod message_dispatcher;
pub mod packet_header;
pub mod packet_id;
pub mod queues;
pub mod received_ids;
pub mod rtt;
pub mod socket;
pub mod stats;
pub mod timer;
pub mod vle;
pub mod worker;
