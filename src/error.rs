use std::fmt::Display;

/// A specialized error type for output buffer operations.
///
/// Invariant-violation variants (`ChunkResurrected`, `RefCountUnderflow`,
/// `Internal`) indicate programming errors: debug builds assert before they
/// are returned, release builds surface them to the caller and tombstone the
/// affected buffer. Everything a retrying client can legitimately trigger is
/// a no-op or an empty result, never an error.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// A chunk reference was constructed with a non-positive count.
    #[error("invalid reference count: expected at least 1, found {0}")]
    InvalidRefCount(i32),
    /// A reference was added to a chunk that had already been fully released.
    #[error("chunk has already been released")]
    ChunkResurrected,
    /// A chunk reference count dropped below zero.
    #[error("chunk reference count is negative")]
    RefCountUnderflow,
    /// An acknowledgement asked to drop more pages than are queued.
    #[error("invalid sequence id: acknowledging {requested} pages but only {queued} queued")]
    InvalidAcknowledge { requested: u64, queued: usize },
    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BufferError {
    /// Create an internal error from a displayable value.
    pub fn internal<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Internal(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_helper() {
        let err = BufferError::internal("accounting drift");
        assert!(matches!(err, BufferError::Internal(msg) if msg == "accounting drift"));
    }

    #[test]
    fn invalid_acknowledge_display_names_both_sides() {
        let err = BufferError::InvalidAcknowledge {
            requested: 7,
            queued: 2,
        };
        let rendered = err.to_string();
        assert!(rendered.contains('7') && rendered.contains('2'));
    }
}
