use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;

/// Default capacity for buffers handed out by the pool.
const DEFAULT_CAPACITY: usize = 4096;
/// Buffers larger than this are dropped instead of returned to the free list.
const MAX_POOLED_CAPACITY: usize = 64 * 1024;

/// Append-only, drainable byte buffer used on every read and write path.
///
/// Writes append at the tail; `bytes()` exposes the readable window and
/// `drain(n)` advances the read cursor past consumed data.
#[derive(Debug, Default)]
pub struct IoBuffer {
    data: BytesMut,
}

impl IoBuffer {
    pub fn new() -> Self {
        Self {
            data: BytesMut::with_capacity(DEFAULT_CAPACITY),
        }
    }

    /// Wrap existing bytes in a buffer.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            data: BytesMut::from(data),
        }
    }

    /// Append bytes at the tail of the buffer.
    pub fn write(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// The readable window. Starts at the current read cursor.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Advance the read cursor by `n` bytes. `n` is clamped to the readable
    /// length, so over-draining is not an error.
    pub fn drain(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.advance(n);
    }

    /// Remove and return the first `n` readable bytes.
    pub fn split_to(&mut self, n: usize) -> Bytes {
        let n = n.min(self.data.len());
        self.data.split_to(n).freeze()
    }

    /// Remove and return the whole readable window.
    pub fn take(&mut self) -> Bytes {
        self.data.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn reset(&mut self) {
        self.data.clear();
    }
}

impl Clone for IoBuffer {
    /// The clone owns its payload and may outlive the source.
    fn clone(&self) -> Self {
        Self {
            data: BytesMut::from(&self.data[..]),
        }
    }
}

/// Free-list pool of buffers. Contexts that are pool-aware acquire buffers
/// here and release them on scope exit; everything else just allocates.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<IoBuffer>>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acquire(&self) -> IoBuffer {
        self.free.lock().pop().unwrap_or_else(IoBuffer::new)
    }

    /// Return a buffer to the free list. Oversized buffers are dropped so a
    /// single large request cannot pin memory forever.
    pub fn release(&self, mut buf: IoBuffer) {
        if buf.data.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buf.reset();
        self.free.lock().push(buf);
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}
