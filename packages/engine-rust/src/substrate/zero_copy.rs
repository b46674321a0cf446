//! Shared, reference-counted payload buffers.
//!
//! A [`ZeroCopyBuffer`] is a read-only view over a contiguous byte range.
//! Cloning the buffer (or building a message payload from it) shares the
//! underlying storage; the bytes are freed when the last owner drops.

use std::sync::Arc;

use bytes::Bytes;

/// A refcounted, read-only byte range.
///
/// Constructed by the performance substrate either by taking ownership of
/// caller bytes ([`ZeroCopyBuffer::from_owned`]) or by copying them once
/// ([`ZeroCopyBuffer::copied`]). Message payloads built from the buffer
/// share its storage through [`Bytes`]; the storage lives until the last
/// owner (buffer handle or payload) drops.
#[derive(Debug, Clone)]
pub struct ZeroCopyBuffer {
    inner: Arc<Bytes>,
}

impl ZeroCopyBuffer {
    /// Wraps caller-owned bytes without copying.
    #[must_use]
    pub fn from_owned(data: impl Into<Bytes>) -> Self {
        Self {
            inner: Arc::new(data.into()),
        }
    }

    /// Copies the given bytes into a fresh shared buffer.
    #[must_use]
    pub fn copied(data: &[u8]) -> Self {
        Self {
            inner: Arc::new(Bytes::copy_from_slice(data)),
        }
    }

    /// Length of the byte range.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the range is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The bytes themselves.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// A payload handle sharing this buffer's storage.
    #[must_use]
    pub fn payload(&self) -> Bytes {
        (*self.inner).clone()
    }

    /// Number of live buffer handles (not counting payloads split off with
    /// [`payload`], which keep the storage alive through `Bytes` itself).
    ///
    /// [`payload`]: ZeroCopyBuffer::payload
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}
