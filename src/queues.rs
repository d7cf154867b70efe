//! The three message queues of a connection: the priority queue the packer drains, and the
//!  two bounded lock-protected hand-off queues between application threads and the worker.

use crate::message::NetworkMessage;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

struct Prioritized(NetworkMessage);

impl PartialEq for Prioritized {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Prioritized {}

impl PartialOrd for Prioritized {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Prioritized {
    fn cmp(&self, other: &Self) -> Ordering {
        // higher priority wins; equal priorities dequeue in FIFO order of acceptance
        self.0
            .priority
            .cmp(&other.0.priority)
            .then(other.0.message_number.cmp(&self.0.message_number))
    }
}

/// The worker-owned queue of messages waiting to be packed into datagrams.
pub struct OutboundQueue {
    heap: BinaryHeap<Prioritized>,
}

impl OutboundQueue {
    pub fn new() -> OutboundQueue {
        OutboundQueue {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, msg: NetworkMessage) {
        self.heap.push(Prioritized(msg));
    }

    pub fn pop(&mut self) -> Option<NetworkMessage> {
        self.heap.pop().map(|p| p.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn drain(&mut self) -> Vec<NetworkMessage> {
        self.heap.drain().map(|p| p.0).collect()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded multi-producer hand-off from application threads to the worker. A full queue
///  pushes back: the message is returned to the caller to fail or drop.
pub struct AcceptQueue {
    capacity: usize,
    queue: Mutex<VecDeque<NetworkMessage>>,
}

impl AcceptQueue {
    pub fn new(capacity: usize) -> AcceptQueue {
        AcceptQueue {
            capacity,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn try_push(&self, msg: NetworkMessage) -> Result<(), NetworkMessage> {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            return Err(msg);
        }
        queue.push_back(msg);
        Ok(())
    }

    pub fn pop(&self) -> Option<NetworkMessage> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain(&self) -> Vec<NetworkMessage> {
        self.queue.lock().unwrap().drain(..).collect()
    }
}

/// A message as delivered to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: u32,
    pub payload: Vec<u8>,
}

/// Bounded hand-off from the worker to the application, with a notification for blocked
///  `receive_message` callers.
pub struct DeliveryQueue {
    capacity: usize,
    queue: Mutex<VecDeque<InboundMessage>>,
    notify: Notify,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> DeliveryQueue {
        DeliveryQueue {
            capacity,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn try_push(&self, msg: InboundMessage) -> bool {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                return false;
            }
            queue.push_back(msg);
        }
        self.notify.notify_one();
        true
    }

    pub fn pop(&self) -> Option<InboundMessage> {
        self.queue.lock().unwrap().pop_front()
    }

    /// waits up to `max_wait` for a message to become available
    pub async fn pop_wait(&self, max_wait: Duration) -> Option<InboundMessage> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(msg) = self.pop() {
                return Some(msg);
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if timeout(remaining, self.notify.notified()).await.is_err() {
                return self.pop();
            }
        }
    }

    pub fn capacity_left(&self) -> usize {
        self.capacity - self.queue.lock().unwrap().len()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.queue.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    fn message(priority: u32, message_number: u64) -> NetworkMessage {
        let mut msg = NetworkMessage {
            id: 1,
            content_id: 0,
            priority,
            reliable: false,
            in_order: false,
            obsolete: false,
            message_number,
            reliable_message_number: 0,
            fragment: None,
            send_count: 0,
            payload: Vec::new(),
        };
        msg.payload.push(message_number as u8);
        msg
    }

    #[rstest]
    #[case::priority_wins(vec![(0, 1), (5, 2), (2, 3)], vec![2, 3, 1])]
    #[case::fifo_tie_break(vec![(1, 10), (1, 11), (1, 12)], vec![10, 11, 12])]
    #[case::mixed(vec![(1, 1), (2, 2), (2, 3), (1, 4)], vec![2, 3, 1, 4])]
    fn test_outbound_queue_order(#[case] input: Vec<(u32, u64)>, #[case] expected_numbers: Vec<u64>) {
        let mut queue = OutboundQueue::new();
        for (priority, number) in input {
            queue.push(message(priority, number));
        }

        let mut actual = Vec::new();
        while let Some(msg) = queue.pop() {
            actual.push(msg.message_number);
        }
        assert_eq!(actual, expected_numbers);
    }

    #[test]
    fn test_accept_queue_bounded() {
        let queue = AcceptQueue::new(2);
        assert!(queue.try_push(message(0, 1)).is_ok());
        assert!(queue.try_push(message(0, 2)).is_ok());

        let rejected = queue.try_push(message(0, 3)).unwrap_err();
        assert_eq!(rejected.message_number, 3);

        assert_eq!(queue.pop().unwrap().message_number, 1);
        assert!(queue.try_push(message(0, 4)).is_ok());
        assert_eq!(queue.pop().unwrap().message_number, 2);
        assert_eq!(queue.pop().unwrap().message_number, 4);
        assert!(queue.pop().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_queue_pop_wait() {
        let queue = DeliveryQueue::new(4);

        assert_eq!(queue.pop_wait(Duration::from_millis(10)).await, None);

        assert!(queue.try_push(InboundMessage { id: 7, payload: vec![1] }));
        let msg = queue.pop_wait(Duration::from_millis(10)).await.unwrap();
        assert_eq!(msg.id, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_queue_wakes_waiting_consumer() {
        let queue = std::sync::Arc::new(DeliveryQueue::new(4));

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop_wait(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.try_push(InboundMessage { id: 9, payload: vec![] }));

        let received = consumer.await.unwrap().unwrap();
        assert_eq!(received.id, 9);
    }

    #[test]
    fn test_delivery_queue_capacity() {
        let queue = DeliveryQueue::new(2);
        assert_eq!(queue.capacity_left(), 2);
        assert!(queue.try_push(InboundMessage { id: 1, payload: vec![] }));
        assert!(queue.try_push(InboundMessage { id: 2, payload: vec![] }));
        assert!(!queue.try_push(InboundMessage { id: 3, payload: vec![] }));
        assert_eq!(queue.capacity_left(), 0);
    }
}
