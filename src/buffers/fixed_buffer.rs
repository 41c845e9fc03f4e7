use std::fmt::{Debug, Formatter};

use bytes::buf::UninitSlice;

/// A fixed-length, pre-allocated byte buffer. The backing storage is allocated
///  once and reused for the lifetime of a connection, so framing and datagram
///  I/O never allocate per message.
///
/// It implements `BufMut` to fit into the `bytes` ecosystem; consumed bytes are
///  released from the front with [FixedBuf::consume].
#[derive(Eq)]
pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}

impl FixedBuf {
    /// create a new buffer with the given capacity
    pub fn new(capacity: usize) -> FixedBuf {
        FixedBuf {
            // buffers are reused aggressively, so we trade the one-off cost of
            //  initialization for simplicity
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// make the entire underlying buffer available through as_mut() etc.,
    ///  typically right before receiving a datagram into it
    pub fn maximize_len(&mut self) {
        self.len = self.capacity();
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }

    /// drop `count` bytes from the front, moving the remainder to offset 0
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len);
        self.buf.copy_within(count..self.len, 0);
        self.len -= count;
    }

    /// This is a convenience function for test code. It derives the buffer's
    ///  capacity and content from the given slice.
    #[cfg(test)]
    pub fn from_slice(capacity: usize, data: &[u8]) -> FixedBuf {
        let mut result = FixedBuf::new(capacity);
        bytes::BufMut::put_slice(&mut result, data);
        result
    }
}

impl PartialEq for FixedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsMut<[u8]> for FixedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FixedBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}
