use std::sync::Arc;

use serde::Serialize;

use crate::chunk::SerializedChunk;
use crate::config::OutputBufferId;

/// Pages delivered to the client for one read, together with the tokens the
/// client needs to acknowledge them.
///
/// `token` is the sequence id of the first page in `pages`; `next_token` is
/// the id the client must quote on its next read, which implicitly
/// acknowledges everything below it. `finished` tells the client the stream
/// has ended and it may destroy the buffer.
///
/// Pages alias the buffer's chunks, so a result stays valid after the buffer
/// releases its own references on acknowledgement.
#[derive(Debug, Clone)]
pub struct BufferResult {
    task_instance_id: Arc<str>,
    token: u64,
    next_token: u64,
    finished: bool,
    pages: Vec<Arc<SerializedChunk>>,
}

impl BufferResult {
    /// Builds a result for `pages.len()` pages starting at `token`.
    pub fn new(
        task_instance_id: Arc<str>,
        token: u64,
        next_token: u64,
        finished: bool,
        pages: Vec<Arc<SerializedChunk>>,
    ) -> Self {
        debug_assert_eq!(next_token - token, pages.len() as u64);
        Self {
            task_instance_id,
            token,
            next_token,
            finished,
            pages,
        }
    }

    /// Builds an empty result carrying only a token and the finished flag.
    pub fn empty(task_instance_id: Arc<str>, token: u64, finished: bool) -> Self {
        Self {
            task_instance_id,
            token,
            next_token: token,
            finished,
            pages: Vec::new(),
        }
    }

    /// Identifies the task incarnation that produced this result, so clients
    /// can detect answers from a restarted task.
    #[inline]
    pub fn task_instance_id(&self) -> &str {
        &self.task_instance_id
    }

    /// Sequence id of the first returned page.
    #[inline]
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Sequence id the client must quote on its next read.
    #[inline]
    pub fn next_token(&self) -> u64 {
        self.next_token
    }

    /// True once the stream has a natural end and no pages remain.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The returned pages, oldest first.
    #[inline]
    pub fn pages(&self) -> &[Arc<SerializedChunk>] {
        &self.pages
    }

    /// Number of returned pages.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// Byte-level accounting for one buffer, taken lock free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageBufferInfo {
    buffer_id: OutputBufferId,
    buffered_bytes: u64,
}

impl PageBufferInfo {
    pub fn new(buffer_id: OutputBufferId, buffered_bytes: u64) -> Self {
        Self {
            buffer_id,
            buffered_bytes,
        }
    }

    #[inline]
    pub fn buffer_id(&self) -> OutputBufferId {
        self.buffer_id
    }

    #[inline]
    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes
    }
}

/// Snapshot of one buffer's externally visible state.
///
/// Taken without the buffer lock, so `buffered_bytes` may trail the page
/// queue by one in-flight update; consumers tolerate the transient skew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferInfo {
    buffer_id: OutputBufferId,
    destroyed: bool,
    page_buffer_info: PageBufferInfo,
}

impl BufferInfo {
    pub fn new(
        buffer_id: OutputBufferId,
        destroyed: bool,
        page_buffer_info: PageBufferInfo,
    ) -> Self {
        Self {
            buffer_id,
            destroyed,
            page_buffer_info,
        }
    }

    #[inline]
    pub fn buffer_id(&self) -> OutputBufferId {
        self.buffer_id
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    #[inline]
    pub fn page_buffer_info(&self) -> &PageBufferInfo {
        &self.page_buffer_info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_result_carries_token_and_flag() {
        let result = BufferResult::empty(Arc::from("task-a.0"), 5, true);
        assert_eq!(result.token(), 5);
        assert_eq!(result.next_token(), 5);
        assert!(result.is_finished());
        assert!(result.pages().is_empty());
    }

    #[test]
    fn page_count_matches_token_span() {
        let pages = vec![
            Arc::new(SerializedChunk::new(bytes::Bytes::new(), 3, 64)),
            Arc::new(SerializedChunk::new(bytes::Bytes::new(), 4, 128)),
        ];
        let result = BufferResult::new(Arc::from("task-a.0"), 2, 4, false, pages);
        assert_eq!(result.page_count(), 2);
        assert_eq!(result.next_token() - result.token(), 2);
    }
}
