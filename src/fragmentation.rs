use rustc_hash::FxHashMap;
use tracing::{debug, warn};

/// Process-local handle for a fragmented send; stable across the transfer's lifetime. The
///  wire-visible transfer id (a u8 from a small pool) is only allocated when the first
///  fragment is about to be packed, so queued transfers do not hog the id space.
pub type TransferKey = u32;

/// number of concurrently in-flight fragmented sends the wire format can distinguish
const NUM_WIRE_TRANSFER_IDS: usize = 256;

struct SendTransfer {
    wire_id: Option<u8>,
    remaining_fragments: u32,
}

/// Send-side registry of fragmented transfers. A transfer exists from the moment a message
///  is split until the last of its fragments is acked; freeing the last fragment releases
///  the wire id for reuse.
///
/// Locked independently of the connection state: it is touched by the packer (worker) and by
///  `send_message` when splitting (application thread).
pub struct FragmentedSendManager {
    transfers: FxHashMap<TransferKey, SendTransfer>,
    used_wire_ids: [bool; NUM_WIRE_TRANSFER_IDS],
    next_key: TransferKey,
}

impl FragmentedSendManager {
    pub fn new() -> FragmentedSendManager {
        FragmentedSendManager {
            transfers: FxHashMap::default(),
            used_wire_ids: [false; NUM_WIRE_TRANSFER_IDS],
            next_key: 0,
        }
    }

    pub fn new_transfer(&mut self, total_fragments: u32) -> TransferKey {
        assert!(total_fragments >= 2);

        let key = self.next_key;
        self.next_key = self.next_key.wrapping_add(1);
        self.transfers.insert(
            key,
            SendTransfer {
                wire_id: None,
                remaining_fragments: total_fragments,
            },
        );
        key
    }

    /// The wire id of a transfer, allocating one if this is the first fragment to be packed.
    ///  `None` while all 256 wire ids are taken by other in-flight transfers; the caller
    ///  re-queues the fragment and retries later.
    pub fn wire_id_for_packing(&mut self, key: TransferKey) -> Option<u8> {
        let transfer = self.transfers.get_mut(&key)?;
        if let Some(id) = transfer.wire_id {
            return Some(id);
        }

        let free = self.used_wire_ids.iter().position(|used| !used)?;
        self.used_wire_ids[free] = true;
        transfer.wire_id = Some(free as u8);
        debug!("allocated wire transfer id {} for fragmented send", free);
        Some(free as u8)
    }

    /// Called when a fragment of the transfer is acked; returns true when that was the last
    ///  fragment and the transfer is gone.
    pub fn on_fragment_acked(&mut self, key: TransferKey) -> bool {
        let transfer = match self.transfers.get_mut(&key) {
            Some(t) => t,
            None => {
                warn!("fragment ack for unknown transfer {}", key);
                return false;
            }
        };

        transfer.remaining_fragments = transfer.remaining_fragments.saturating_sub(1);
        if transfer.remaining_fragments > 0 {
            return false;
        }

        if let Some(wire_id) = transfer.wire_id {
            self.used_wire_ids[wire_id as usize] = false;
        }
        self.transfers.remove(&key);
        debug!("fragmented send {} completed", key);
        true
    }

    pub fn num_transfers(&self) -> usize {
        self.transfers.len()
    }

    pub fn clear(&mut self) {
        self.transfers.clear();
        self.used_wire_ids = [false; NUM_WIRE_TRANSFER_IDS];
    }
}

impl Default for FragmentedSendManager {
    fn default() -> Self {
        Self::new()
    }
}

struct ReceiveTransfer {
    total_fragments: u32,
    num_received: u32,
    slots: Vec<Option<Vec<u8>>>,
}

/// Receive-side assembly of fragmented messages, keyed by the peer's wire transfer id.
pub struct FragmentedReceiveManager {
    transfers: FxHashMap<u8, ReceiveTransfer>,
}

impl FragmentedReceiveManager {
    pub fn new() -> FragmentedReceiveManager {
        FragmentedReceiveManager {
            transfers: FxHashMap::default(),
        }
    }

    /// first fragment arrived: set up the transfer and store slot 0
    pub fn start_transfer(&mut self, wire_id: u8, total_fragments: u32, data: &[u8]) {
        if self.transfers.contains_key(&wire_id) {
            // the peer reused the id before we saw the old transfer complete - start over
            warn!("fragment transfer {} restarted by peer before completion", wire_id);
        }

        let mut slots = vec![None; total_fragments as usize];
        slots[0] = Some(data.to_vec());
        self.transfers.insert(
            wire_id,
            ReceiveTransfer {
                total_fragments,
                num_received: 1,
                slots,
            },
        );
    }

    /// a follow-up fragment arrived; returns true when the transfer is now complete
    pub fn add_fragment(&mut self, wire_id: u8, fragment_index: u32, data: &[u8]) -> bool {
        let transfer = match self.transfers.get_mut(&wire_id) {
            Some(t) => t,
            None => {
                debug!("fragment for unknown transfer {} - dropping", wire_id);
                return false;
            }
        };

        if fragment_index >= transfer.total_fragments {
            warn!(
                "fragment index {} out of range for transfer {} with {} fragments - dropping",
                fragment_index, wire_id, transfer.total_fragments
            );
            return false;
        }

        let slot = &mut transfer.slots[fragment_index as usize];
        if slot.is_some() {
            debug!("fragment {} of transfer {} received twice - dropping", fragment_index, wire_id);
            return false;
        }

        *slot = Some(data.to_vec());
        transfer.num_received += 1;
        transfer.num_received == transfer.total_fragments
    }

    /// concatenates the fragments of a completed transfer and frees it
    pub fn assemble(&mut self, wire_id: u8) -> Option<Vec<u8>> {
        let transfer = self.transfers.remove(&wire_id)?;
        if transfer.num_received != transfer.total_fragments {
            warn!("assembling incomplete transfer {} - dropping", wire_id);
            return None;
        }

        let mut assembled = Vec::new();
        for slot in transfer.slots {
            assembled.extend_from_slice(&slot.expect("complete transfer has all slots filled"));
        }
        Some(assembled)
    }

    pub fn num_transfers(&self) -> usize {
        self.transfers.len()
    }

    pub fn clear(&mut self) {
        self.transfers.clear();
    }
}

impl Default for FragmentedReceiveManager {
    fn default() -> Self {
        Self::new()
    }
}
