//! Process-wide pool of scratch buffers for response decoding.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

/// Buffers kept for reuse
const MAX_POOLED: usize = 16;

/// Larger buffers are freed instead of pooled
const MAX_RETAINED_CAPACITY: usize = 4 * 1024 * 1024;

const INITIAL_CAPACITY: usize = 4096;

static POOL: Mutex<Vec<Vec<u8>>> = parking_lot::const_mutex(Vec::new());

/// Scratch buffer checked out of the pool.
///
/// Always empty on checkout. Dropping it clears the contents and hands the
/// allocation back.
#[derive(Debug)]
pub(crate) struct PooledBuffer {
    buf: Vec<u8>,
}

impl PooledBuffer {
    pub(crate) fn checkout() -> Self {
        let buf = POOL
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(INITIAL_CAPACITY));
        Self { buf }
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buf.clear();
        let mut pool = POOL.lock();
        if pool.len() < MAX_POOLED {
            pool.push(buf);
        }
    }
}
