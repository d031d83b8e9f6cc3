//! Recycling of released tile buffers, keyed by byte length.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Keeps up to `limit` released buffers per byte length.
///
/// Recycled buffers come back with whatever bytes they held; callers
/// overwrite them.
#[derive(Debug)]
pub(crate) struct BufferPool {
    limit: usize,
    buffers: Mutex<HashMap<usize, Vec<Box<[u8]>>>>,
}

impl BufferPool {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// A recycled buffer of `len` bytes, or a freshly zeroed one.
    pub(crate) fn take(&self, len: usize) -> Box<[u8]> {
        if self.limit > 0 {
            if let Some(buffer) = self.buffers.lock().get_mut(&len).and_then(Vec::pop) {
                return buffer;
            }
        }
        vec![0u8; len].into_boxed_slice()
    }

    /// Keeps `buffer` for reuse unless its size class is full.
    pub(crate) fn put(&self, buffer: Box<[u8]>) {
        if self.limit == 0 {
            return;
        }
        let mut buffers = self.buffers.lock();
        let free = buffers.entry(buffer.len()).or_default();
        if free.len() < self.limit {
            free.push(buffer);
        }
    }

    /// Buffers currently held for reuse
    pub(crate) fn pooled(&self) -> usize {
        self.buffers.lock().values().map(Vec::len).sum()
    }
}
