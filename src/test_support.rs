//! Shared helpers for exercising buffers in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;

use crate::chunk::{ChunkRef, SerializedChunk};

/// Counts how many times a chunk's release callback has run.
///
/// One tracker may back several chunks; `released` then counts total
/// callback invocations across all of them.
#[derive(Debug, Default)]
pub struct ReleaseTracker {
    released: AtomicUsize,
}

impl ReleaseTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total release-callback invocations observed so far.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// Builds an opaque chunk with the given accounting properties.
pub fn test_chunk(retained_size_in_bytes: u64, position_count: u32) -> SerializedChunk {
    SerializedChunk::new(Bytes::new(), position_count, retained_size_in_bytes)
}

/// Builds a chunk reference with one initial (producer) reference whose
/// release callback bumps `tracker`.
pub fn tracked_chunk(
    tracker: &Arc<ReleaseTracker>,
    retained_size_in_bytes: u64,
    position_count: u32,
) -> ChunkRef {
    tracked_chunk_with_refs(tracker, retained_size_in_bytes, position_count, 1)
}

/// Like [`tracked_chunk`] with an explicit initial reference count.
pub fn tracked_chunk_with_refs(
    tracker: &Arc<ReleaseTracker>,
    retained_size_in_bytes: u64,
    position_count: u32,
    initial_refs: i32,
) -> ChunkRef {
    let tracker = Arc::clone(tracker);
    ChunkRef::new(
        test_chunk(retained_size_in_bytes, position_count),
        initial_refs,
        move || {
            tracker.released.fetch_add(1, Ordering::SeqCst);
        },
    )
    .expect("initial reference count is positive")
}
