use crate::message::RELIABLE_NUMBER_MASK;
use crate::packet_id::PacketId;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;

/// Bounded set of recently observed inbound packet ids: a datagram whose id is already in
///  the window is a duplicate and gets discarded. Eviction is oldest-inserted-first once the
///  capacity is reached.
pub struct ReceivedIdWindow {
    capacity: usize,
    order: VecDeque<PacketId>,
    set: FxHashSet<PacketId>,
}

impl ReceivedIdWindow {
    pub fn new(capacity: usize) -> ReceivedIdWindow {
        assert!(capacity > 0);
        ReceivedIdWindow {
            capacity,
            order: VecDeque::with_capacity(capacity),
            set: FxHashSet::default(),
        }
    }

    pub fn contains(&self, packet_id: PacketId) -> bool {
        self.set.contains(&packet_id)
    }

    pub fn add(&mut self, packet_id: PacketId) {
        if !self.set.insert(packet_id) {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.order.push_back(packet_id);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Duplicate filter for inbound reliable message numbers. Conceptually unbounded, but pruned
///  by a modular lower bound: numbers further than the tolerated gap behind the newest seen
///  number can never be offered again by a well-behaved peer, so they are dropped wholesale
///  once the set grows past its soft limit.
pub struct ReliableDuplicateFilter {
    seen: FxHashSet<u32>,
    newest: Option<u32>,
    prune_threshold: usize,
    max_gap: u32,
}

impl ReliableDuplicateFilter {
    pub fn new(prune_threshold: usize, max_gap: u32) -> ReliableDuplicateFilter {
        ReliableDuplicateFilter {
            seen: FxHashSet::default(),
            newest: None,
            prune_threshold,
            max_gap,
        }
    }

    /// returns true iff the number was seen before; records it either way
    pub fn check_and_record(&mut self, number: u32) -> bool {
        let number = number & RELIABLE_NUMBER_MASK;
        if !self.seen.insert(number) {
            return true;
        }

        match self.newest {
            None => self.newest = Some(number),
            Some(newest) => {
                if Self::distance(number, newest) < (1 << 30) {
                    self.newest = Some(number);
                }
            }
        }

        if self.seen.len() > self.prune_threshold {
            self.prune();
        }
        false
    }

    fn prune(&mut self) {
        let newest = match self.newest {
            Some(newest) => newest,
            None => return,
        };
        let max_gap = self.max_gap;
        self.seen.retain(|&n| Self::distance(newest, n) <= max_gap);
    }

    /// modular distance from `b` up to `a` in the 31-bit number space
    fn distance(a: u32, b: u32) -> u32 {
        a.wrapping_sub(b) & RELIABLE_NUMBER_MASK
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_detects_duplicates() {
        let mut window = ReceivedIdWindow::new(16);
        assert!(!window.contains(PacketId::from_raw(5)));

        window.add(PacketId::from_raw(5));
        assert!(window.contains(PacketId::from_raw(5)));
        assert!(!window.contains(PacketId::from_raw(6)));
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = ReceivedIdWindow::new(3);
        for raw in 0..3 {
            window.add(PacketId::from_raw(raw));
        }
        assert_eq!(window.len(), 3);

        window.add(PacketId::from_raw(3));
        assert_eq!(window.len(), 3);
        assert!(!window.contains(PacketId::ZERO));
        assert!(window.contains(PacketId::from_raw(1)));
        assert!(window.contains(PacketId::from_raw(3)));
    }

    #[test]
    fn test_window_re_add_is_noop() {
        let mut window = ReceivedIdWindow::new(2);
        window.add(PacketId::from_raw(1));
        window.add(PacketId::from_raw(1));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_filter_detects_duplicates() {
        let mut filter = ReliableDuplicateFilter::new(1024, 512);
        assert!(!filter.check_and_record(7));
        assert!(filter.check_and_record(7));
        assert!(!filter.check_and_record(8));
    }

    #[test]
    fn test_filter_prunes_by_lower_bound() {
        let mut filter = ReliableDuplicateFilter::new(10, 5);
        for n in 0..12 {
            assert!(!filter.check_and_record(n));
        }

        // pruning kicked in: only numbers within the gap behind the newest survive
        assert!(filter.len() <= 7);
        assert!(filter.check_and_record(11));
        assert!(filter.check_and_record(7));
        // 0 was pruned, so it reads as fresh again - acceptable for ids this far behind
        assert!(!filter.check_and_record(0));
    }

    #[test]
    fn test_filter_is_wrap_aware() {
        let mut filter = ReliableDuplicateFilter::new(1024, 512);
        assert!(!filter.check_and_record(RELIABLE_NUMBER_MASK));
        assert!(!filter.check_and_record(0));
        assert!(filter.check_and_record(RELIABLE_NUMBER_MASK));
        assert!(filter.check_and_record(0));
    }
}
