use crate::message::NetworkMessage;
use crate::packet_id::PacketId;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use tokio::time::Instant;

/// an ack message acknowledges a base packet id plus up to this many following ids via its
///  bitfield
pub const ACK_WINDOW_WIDTH: u32 = 32;

/// In-flight record for one reliable datagram: the reliable messages it carried stay owned
///  by this track until the peer acks the packet id (messages are freed) or the timeout
///  passes (messages move back into the outbound queue).
pub struct OutboundAckTrack {
    pub packet_id: PacketId,
    pub sent_at: Instant,
    pub timeout_at: Instant,
    pub send_count: u32,
    /// datagram send rate at the time of sending, the reference value for multiplicative
    ///  decrease if this packet turns out lost
    pub datagram_send_rate: f32,
    pub messages: Vec<NetworkMessage>,
}

/// The outbound ack tracks, ordered by ascending (modular) packet id. The packer emits
///  packet ids strictly in increasing order from a single task, so insertion order *is* id
///  order, and the timeout scan can stop at the first non-expired entry.
pub struct AckTrackQueue {
    tracks: VecDeque<OutboundAckTrack>,
}

impl AckTrackQueue {
    pub fn new() -> AckTrackQueue {
        AckTrackQueue {
            tracks: VecDeque::new(),
        }
    }

    pub fn push(&mut self, track: OutboundAckTrack) {
        debug_assert!(
            self.tracks
                .back()
                .map(|prev| track.packet_id.is_newer_than(prev.packet_id))
                .unwrap_or(true),
            "ack tracks must be inserted in increasing packet id order"
        );
        self.tracks.push_back(track);
    }

    pub fn front(&self) -> Option<&OutboundAckTrack> {
        self.tracks.front()
    }

    pub fn pop_front(&mut self) -> Option<OutboundAckTrack> {
        self.tracks.pop_front()
    }

    /// Removes the track for the given packet id, if present. Interpolation search biased by
    ///  the id distance, comparing modular offsets from the queue head so the search stays
    ///  correct across the packet id wrap.
    pub fn remove(&mut self, packet_id: PacketId) -> Option<OutboundAckTrack> {
        let idx = self.find(packet_id)?;
        self.tracks.remove(idx)
    }

    fn find(&self, packet_id: PacketId) -> Option<usize> {
        let anchor = self.tracks.front()?.packet_id;
        if anchor == packet_id {
            return Some(0);
        }

        let mut tail_idx = self.tracks.len() - 1;
        let mut tail_rel = self.tracks[tail_idx].packet_id.minus(anchor);
        if tail_rel == 0 {
            // single-element queue, and the head did not match
            return None;
        }
        let target = packet_id.minus(anchor);
        if target == tail_rel {
            return Some(tail_idx);
        }
        if target > tail_rel || target >= PacketId::RANGE / 2 {
            return None;
        }

        let mut head_idx = 0;
        let mut head_rel = 0u32;
        while tail_idx - head_idx > 1 {
            let guess = head_idx
                + ((tail_idx - head_idx) as u64 * (target - head_rel) as u64
                    / (tail_rel - head_rel) as u64) as usize;
            let guess = guess.clamp(head_idx + 1, tail_idx - 1);

            let rel = self.tracks[guess].packet_id.minus(anchor);
            if rel == target {
                return Some(guess);
            }
            if rel < target {
                head_idx = guess;
                head_rel = rel;
            }
            else {
                tail_idx = guess;
                tail_rel = rel;
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn drain(&mut self) -> Vec<OutboundAckTrack> {
        self.tracks.drain(..).collect()
    }

    #[cfg(test)]
    pub fn packet_ids(&self) -> Vec<PacketId> {
        self.tracks.iter().map(|t| t.packet_id).collect()
    }
}

impl Default for AckTrackQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Packet ids of inbound reliable datagrams that still need to be acknowledged, in arrival
///  order. An entry exists from datagram receipt until it is covered by an outgoing ack
///  message.
pub struct PendingAcks {
    order: VecDeque<PacketId>,
    received_at: FxHashMap<PacketId, Instant>,
}

impl PendingAcks {
    pub fn new() -> PendingAcks {
        PendingAcks {
            order: VecDeque::new(),
            received_at: FxHashMap::default(),
        }
    }

    pub fn record(&mut self, packet_id: PacketId, now: Instant) {
        if self.received_at.insert(packet_id, now).is_none() {
            self.order.push_back(packet_id);
        }
        // re-receiving a duplicate refreshes the timestamp; the original ack may have been
        //  lost and a fresh one is due anyway
    }

    pub fn len(&self) -> usize {
        self.received_at.len()
    }

    pub fn is_empty(&self) -> bool {
        self.received_at.is_empty()
    }

    /// arrival time of the oldest pending ack
    pub fn oldest_received_at(&mut self) -> Option<Instant> {
        self.skip_stale_front();
        self.order
            .front()
            .and_then(|id| self.received_at.get(id))
            .copied()
    }

    /// Takes the oldest pending ack as the window base and collects every pending id within
    ///  `base + 1 ..= base + 32` into the bitfield, removing all of them from the pending
    ///  set. Bit k of the mask acknowledges `base + k + 1`.
    pub fn take_window(&mut self) -> Option<(PacketId, u32)> {
        self.skip_stale_front();
        let base = self.order.pop_front()?;
        self.received_at.remove(&base);

        let mut mask = 0u32;
        for k in 0..ACK_WINDOW_WIDTH {
            let id = base.plus(k + 1);
            if self.received_at.remove(&id).is_some() {
                mask |= 1 << k;
            }
        }
        Some((base, mask))
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.received_at.clear();
    }

    /// drop leading order entries whose ids were already taken via a previous window
    fn skip_stale_front(&mut self) {
        while let Some(id) = self.order.front() {
            if self.received_at.contains_key(id) {
                return;
            }
            self.order.pop_front();
        }
    }
}

impl Default for PendingAcks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn track(raw_id: u32) -> OutboundAckTrack {
        let now = Instant::now();
        OutboundAckTrack {
            packet_id: PacketId::from_raw(raw_id),
            sent_at: now,
            timeout_at: now,
            send_count: 1,
            datagram_send_rate: 50.0,
            messages: Vec::new(),
        }
    }

    #[rstest]
    #[case::head(vec![10, 11, 12, 15], 10, Some(vec![11, 12, 15]))]
    #[case::middle(vec![10, 11, 12, 15], 12, Some(vec![10, 11, 15]))]
    #[case::tail(vec![10, 11, 12, 15], 15, Some(vec![10, 11, 12]))]
    #[case::missing_in_gap(vec![10, 11, 12, 15], 13, None)]
    #[case::below_range(vec![10, 11, 12, 15], 9, None)]
    #[case::above_range(vec![10, 11, 12, 15], 16, None)]
    #[case::single_hit(vec![10], 10, Some(vec![]))]
    #[case::single_miss(vec![10], 11, None)]
    #[case::empty(vec![], 10, None)]
    fn test_remove(#[case] ids: Vec<u32>, #[case] remove: u32, #[case] expected_remaining: Option<Vec<u32>>) {
        let mut queue = AckTrackQueue::new();
        for id in ids.iter() {
            queue.push(track(*id));
        }

        let removed = queue.remove(PacketId::from_raw(remove));
        match expected_remaining {
            Some(remaining) => {
                assert_eq!(removed.unwrap().packet_id, PacketId::from_raw(remove));
                assert_eq!(
                    queue.packet_ids(),
                    remaining.into_iter().map(PacketId::from_raw).collect::<Vec<_>>()
                );
            }
            None => {
                assert!(removed.is_none());
                assert_eq!(queue.len(), ids.len());
            }
        }
    }

    #[test]
    fn test_remove_across_id_wrap() {
        let mut queue = AckTrackQueue::new();
        let near_wrap = PacketId::RANGE - 2;
        for id in [near_wrap, near_wrap + 1, 0, 1, 2] {
            queue.push(track(id & (PacketId::RANGE - 1)));
        }

        assert_eq!(queue.remove(PacketId::from_raw(0)).unwrap().packet_id, PacketId::ZERO);
        assert_eq!(queue.remove(PacketId::from_raw(near_wrap)).unwrap().packet_id, PacketId::from_raw(near_wrap));
        assert_eq!(
            queue.packet_ids(),
            vec![
                PacketId::from_raw(near_wrap + 1),
                PacketId::from_raw(1),
                PacketId::from_raw(2)
            ]
        );
    }

    #[test]
    fn test_front_and_pop_preserve_order() {
        let mut queue = AckTrackQueue::new();
        for id in [5, 6, 9] {
            queue.push(track(id));
        }

        assert_eq!(queue.front().unwrap().packet_id, PacketId::from_raw(5));
        assert_eq!(queue.pop_front().unwrap().packet_id, PacketId::from_raw(5));
        assert_eq!(queue.front().unwrap().packet_id, PacketId::from_raw(6));
    }

    #[test]
    fn test_pending_acks_record_is_idempotent() {
        let mut pending = PendingAcks::new();
        let now = Instant::now();
        pending.record(PacketId::from_raw(7), now);
        pending.record(PacketId::from_raw(7), now);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_take_window_scenario() {
        // receiver saw 100 and 102..=135, 101 was dropped on the wire
        let mut pending = PendingAcks::new();
        let now = Instant::now();
        pending.record(PacketId::from_raw(100), now);
        for id in 102..=135 {
            pending.record(PacketId::from_raw(id), now);
        }

        // first ack: base 100, bits 1..=31 for 102..=132
        let (base, mask) = pending.take_window().unwrap();
        assert_eq!(base, PacketId::from_raw(100));
        assert_eq!(mask, 0xffff_fffe);

        // second ack: base 133, bits 0 and 1 for 134 and 135
        let (base, mask) = pending.take_window().unwrap();
        assert_eq!(base, PacketId::from_raw(133));
        assert_eq!(mask, 0b11);

        assert!(pending.take_window().is_none());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_take_window_across_wrap() {
        let mut pending = PendingAcks::new();
        let now = Instant::now();
        let near_wrap = PacketId::from_raw(PacketId::RANGE - 1);
        pending.record(near_wrap, now);
        pending.record(PacketId::ZERO, now);
        pending.record(PacketId::from_raw(1), now);

        let (base, mask) = pending.take_window().unwrap();
        assert_eq!(base, near_wrap);
        assert_eq!(mask, 0b11);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_oldest_received_at() {
        let mut pending = PendingAcks::new();
        let t0 = Instant::now();
        assert!(pending.oldest_received_at().is_none());

        pending.record(PacketId::from_raw(3), t0);
        pending.record(PacketId::from_raw(4), t0 + std::time::Duration::from_millis(10));
        assert_eq!(pending.oldest_received_at(), Some(t0));

        pending.take_window().unwrap();
        assert!(pending.oldest_received_at().is_none());
    }
}
