//! Owned reply buffer for a connection whose echo could not be written in
//! one go.
//!
//! A `PendingReply` is created from the unwritten tail of a read chunk and
//! drained across writability events. The cursor only moves forward, so
//! `written() + remaining() == len()` at all times.

use bytes::{Buf, Bytes};

/// Residual bytes of one echo reply.
#[derive(Debug)]
pub struct PendingReply {
    data: Bytes,
    len: usize,
}

impl PendingReply {
    /// Copy `residual` into a newly owned buffer.
    ///
    /// Returns `None` if the allocation fails, leaving the caller to close
    /// the connection rather than abort the process.
    pub fn copy_from(residual: &[u8]) -> Option<Self> {
        let mut owned = Vec::new();
        owned.try_reserve_exact(residual.len()).ok()?;
        owned.extend_from_slice(residual);

        Some(Self {
            len: owned.len(),
            data: Bytes::from(owned),
        })
    }

    /// Bytes not yet written.
    pub fn chunk(&self) -> &[u8] {
        self.data.chunk()
    }

    /// Mark `n` more bytes as written.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.data.remaining(), "advanced past end of reply");
        self.data.advance(n.min(self.data.remaining()));
    }

    #[cfg(test)]
    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    /// Bytes already written (the cursor).
    #[cfg(test)]
    pub fn written(&self) -> usize {
        self.len - self.data.remaining()
    }

    /// Original residual length.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_drained(&self) -> bool {
        !self.data.has_remaining()
    }
}
