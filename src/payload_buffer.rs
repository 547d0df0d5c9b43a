//! Fixed-capacity staging buffer for outbound chunks.
//!
//! Each direction service owns one of these and reuses it for every chunk it
//!  sends: encode into [`storage_mut`](PayloadBuf::storage_mut), record the
//!  encoded length via [`set_len`](PayloadBuf::set_len), hand
//!  [`as_ref`](PayloadBuf::as_ref) to the outbound stream. The capacity is the
//!  hard bound on any message this side produces.

use std::fmt::{Debug, Formatter};

pub struct PayloadBuf {
    buf: Vec<u8>,
    len: usize,
}

impl PayloadBuf {
    pub fn new(capacity: usize) -> PayloadBuf {
        PayloadBuf {
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

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// The entire backing storage, independent of the current length. Encoders
    ///  write into this and report back how much of it they used.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Marks the first `len` bytes of the storage as the staged message.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }
}

impl AsRef<[u8]> for PayloadBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Debug for PayloadBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}
