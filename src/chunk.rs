use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::Bytes;

use crate::error::BufferError;

/// An opaque serialized result page.
///
/// The buffer never inspects the payload; the only observable properties are
/// the logical row count and the retained memory footprint used for byte
/// accounting. The wire encoding of the payload is owned by the transport
/// layer.
#[derive(Debug, Clone)]
pub struct SerializedChunk {
    data: Bytes,
    position_count: u32,
    retained_size_in_bytes: u64,
}

impl SerializedChunk {
    /// Wraps a serialized payload.
    ///
    /// `retained_size_in_bytes` is the approximate in-memory footprint of the
    /// chunk, typically larger than `data.len()` because of allocator and
    /// header overhead. It is supplied by the serializer and used verbatim
    /// for accounting.
    pub fn new(data: Bytes, position_count: u32, retained_size_in_bytes: u64) -> Self {
        Self {
            data,
            position_count,
            retained_size_in_bytes,
        }
    }

    /// Returns the serialized payload.
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Returns the number of logical rows in the chunk.
    #[inline]
    pub fn position_count(&self) -> u32 {
        self.position_count
    }

    /// Returns the retained memory footprint used for accounting.
    #[inline]
    pub fn retained_size_in_bytes(&self) -> u64 {
        self.retained_size_in_bytes
    }
}

struct ChunkRefInner {
    chunk: Arc<SerializedChunk>,
    references: AtomicI32,
    on_release: Box<dyn Fn() + Send + Sync>,
}

/// Shared-ownership handle over one serialized chunk.
///
/// The same chunk may sit in several client buffers at once (broadcast
/// fan-out); each buffer takes an explicit reference via [`add_reference`]
/// and gives it back with [`release`]. The release callback supplied at
/// construction runs exactly once, when the count reaches zero, and is how
/// the memory-accounting subsystem learns the payload is gone.
///
/// Cloning the handle is cheap and does NOT change the explicit count; only
/// `add_reference` does. Callers must never invoke the callback path (that
/// is, `release`) while holding a buffer lock.
///
/// [`add_reference`]: ChunkRef::add_reference
/// [`release`]: ChunkRef::release
#[derive(Clone)]
pub struct ChunkRef {
    inner: Arc<ChunkRefInner>,
}

impl ChunkRef {
    /// Wraps a chunk with an initial reference count and a release callback.
    ///
    /// Returns [`BufferError::InvalidRefCount`] when `initial_refs < 1`.
    pub fn new<F>(
        chunk: SerializedChunk,
        initial_refs: i32,
        on_release: F,
    ) -> Result<Self, BufferError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if initial_refs < 1 {
            return Err(BufferError::InvalidRefCount(initial_refs));
        }
        Ok(Self {
            inner: Arc::new(ChunkRefInner {
                chunk: Arc::new(chunk),
                references: AtomicI32::new(initial_refs),
                on_release: Box::new(on_release),
            }),
        })
    }

    /// Atomically takes one more reference on the chunk.
    ///
    /// The count must still be positive: taking a reference on a fully
    /// released chunk would resurrect a payload the accounting subsystem has
    /// already reclaimed.
    pub fn add_reference(&self) -> Result<(), BufferError> {
        let old = self.inner.references.fetch_add(1, Ordering::AcqRel);
        if old <= 0 {
            debug_assert!(false, "chunk has already been released");
            return Err(BufferError::ChunkResurrected);
        }
        Ok(())
    }

    /// Atomically gives back one reference, running the release callback if
    /// this was the last one.
    pub fn release(&self) -> Result<(), BufferError> {
        let remaining = self.inner.references.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining < 0 {
            debug_assert!(false, "chunk reference count is negative");
            return Err(BufferError::RefCountUnderflow);
        }
        if remaining == 0 {
            (self.inner.on_release)();
        }
        Ok(())
    }

    /// Returns a shared handle to the wrapped chunk.
    ///
    /// The returned `Arc` keeps the payload alive independently of the
    /// explicit count, so results already handed to a client stay valid
    /// after the buffer drops its reference.
    #[inline]
    pub fn chunk(&self) -> Arc<SerializedChunk> {
        Arc::clone(&self.inner.chunk)
    }

    /// Returns the number of logical rows in the chunk.
    #[inline]
    pub fn position_count(&self) -> u32 {
        self.inner.chunk.position_count()
    }

    /// Returns the retained memory footprint used for accounting.
    #[inline]
    pub fn retained_size_in_bytes(&self) -> u64 {
        self.inner.chunk.retained_size_in_bytes()
    }
}

impl fmt::Debug for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkRef")
            .field("references", &self.inner.references.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn chunk(retained: u64) -> SerializedChunk {
        SerializedChunk::new(Bytes::new(), 1, retained)
    }

    #[test]
    fn rejects_non_positive_initial_count() {
        let err = ChunkRef::new(chunk(8), 0, || {}).unwrap_err();
        assert!(matches!(err, BufferError::InvalidRefCount(0)));
    }

    #[test]
    fn callback_runs_exactly_once_on_last_release() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let page = ChunkRef::new(chunk(8), 2, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        page.release().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        page.release().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_share_the_explicit_count() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let page = ChunkRef::new(chunk(8), 1, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let alias = page.clone();
        alias.add_reference().unwrap();
        page.release().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        alias.release().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn resurrection_is_reported() {
        let page = ChunkRef::new(chunk(8), 1, || {}).unwrap();
        page.release().unwrap();
        assert!(matches!(
            page.add_reference(),
            Err(BufferError::ChunkResurrected)
        ));
    }
}
