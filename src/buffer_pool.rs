use std::sync::Mutex;
use tracing::{debug, trace};

/// largest datagram the receive path is prepared to take in
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Reusable scatter buffers for datagram send and receive. Buffers in excess of the pool
///  size are dropped when returned instead of being retained.
pub struct DatagramBufferPool {
    buf_size: usize,
    max_pool_size: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl DatagramBufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> DatagramBufferPool {
        DatagramBufferPool {
            buf_size,
            max_pool_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    /// an empty buffer with the pool's full capacity pre-allocated
    pub fn get(&self) -> Vec<u8> {
        if let Some(buffer) = self.buffers.lock().unwrap().pop() {
            trace!("returning buffer from pool");
            return buffer;
        }

        debug!("no buffer in pool: creating new buffer");
        Vec::with_capacity(self.buf_size)
    }

    pub fn ret(&self, mut buffer: Vec<u8>) {
        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_pool_size {
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returned_buffers_come_back_cleared() {
        let pool = DatagramBufferPool::new(16, 4);

        let mut buf = pool.get();
        buf.extend_from_slice(&[1, 2, 3]);
        pool.ret(buf);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 16);
    }

    #[test]
    fn test_pool_size_is_bounded() {
        let pool = DatagramBufferPool::new(16, 1);
        pool.ret(Vec::new());
        pool.ret(Vec::new());
        assert_eq!(pool.buffers.lock().unwrap().len(), 1);
    }
}
