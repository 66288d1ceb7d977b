use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::result::BufferResult;

/// A client read that could not be satisfied immediately.
///
/// Holds the request parameters plus the write side of a one-shot result
/// slot. Completion consumes the value, so a read can be answered at most
/// once; the buffer enforces at most one outstanding `PendingRead` per
/// client. Dropping an unanswered read resolves its future with the empty
/// fallback for the read's sequence id; that only happens when the buffer
/// itself is torn down, never as the answer to a buffer operation.
pub(crate) struct PendingRead {
    task_instance_id: Arc<str>,
    sequence_id: u64,
    max_bytes: u64,
    tx: oneshot::Sender<BufferResult>,
}

impl PendingRead {
    /// Creates an unanswered read and the future the client will await.
    pub(crate) fn new(
        task_instance_id: Arc<str>,
        sequence_id: u64,
        max_bytes: u64,
    ) -> (Self, BufferReadFuture) {
        let (tx, rx) = oneshot::channel();
        let future = BufferReadFuture {
            task_instance_id: Arc::clone(&task_instance_id),
            sequence_id,
            inner: Some(ReadInner::Waiting(rx)),
        };
        let read = Self {
            task_instance_id,
            sequence_id,
            max_bytes,
            tx,
        };
        (read, future)
    }

    #[inline]
    pub(crate) fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    #[inline]
    pub(crate) fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Answers the read with a computed result.
    ///
    /// The client may have dropped the future already; a dead receiver is
    /// fine, the result is simply discarded.
    pub(crate) fn complete_with(self, result: BufferResult) {
        let _ = self.tx.send(result);
    }

    /// Answers the read with an empty, unfinished result carrying the read's
    /// own sequence id. Used when the client abandons the read by issuing a
    /// new one, and when the buffer is destroyed underneath it.
    pub(crate) fn complete_with_empty(self) {
        let empty = BufferResult::empty(Arc::clone(&self.task_instance_id), self.sequence_id, false);
        let _ = self.tx.send(empty);
    }
}

enum ReadInner {
    Ready(BufferResult),
    Waiting(oneshot::Receiver<BufferResult>),
}

/// Future returned by [`ClientBuffer::get_pages`].
///
/// Resolves immediately when the buffer had data (or a terminal answer) at
/// call time, otherwise when a producer, `set_no_more_pages`, or a destroy
/// completes the installed [`PendingRead`]. Never resolves to an error: if
/// the write side vanishes without an answer, the future yields an empty,
/// unfinished result for the requested sequence id.
///
/// [`ClientBuffer::get_pages`]: crate::client::ClientBuffer::get_pages
pub struct BufferReadFuture {
    task_instance_id: Arc<str>,
    sequence_id: u64,
    inner: Option<ReadInner>,
}

impl std::fmt::Debug for BufferReadFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferReadFuture")
            .field("task_instance_id", &self.task_instance_id)
            .field("sequence_id", &self.sequence_id)
            .finish()
    }
}

impl BufferReadFuture {
    /// Wraps an already computed result.
    pub(crate) fn ready(task_instance_id: Arc<str>, result: BufferResult) -> Self {
        let sequence_id = result.token();
        Self {
            task_instance_id,
            sequence_id,
            inner: Some(ReadInner::Ready(result)),
        }
    }
}

impl Future for BufferReadFuture {
    type Output = BufferResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.inner.take() {
            Some(ReadInner::Ready(result)) => Poll::Ready(result),
            Some(ReadInner::Waiting(mut rx)) => match Pin::new(&mut rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(BufferResult::empty(
                    Arc::clone(&this.task_instance_id),
                    this.sequence_id,
                    false,
                )),
                Poll::Pending => {
                    this.inner = Some(ReadInner::Waiting(rx));
                    Poll::Pending
                }
            },
            None => panic!("BufferReadFuture polled after completion"),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    fn task_id() -> Arc<str> {
        Arc::from("task-a.0")
    }

    #[test]
    fn ready_future_resolves_without_a_waker() {
        let result = BufferResult::empty(task_id(), 3, true);
        let future = BufferReadFuture::ready(task_id(), result);
        let resolved = future.now_or_never().expect("ready future");
        assert_eq!(resolved.token(), 3);
        assert!(resolved.is_finished());
    }

    #[test]
    fn completion_resolves_waiting_future() {
        let (read, future) = PendingRead::new(task_id(), 2, 1024);
        read.complete_with(BufferResult::empty(task_id(), 2, true));
        let resolved = future.now_or_never().expect("completed future");
        assert_eq!(resolved.token(), 2);
        assert!(resolved.is_finished());
    }

    #[test]
    fn dropped_read_falls_back_to_empty() {
        let (read, future) = PendingRead::new(task_id(), 7, 1024);
        drop(read);
        let resolved = future.now_or_never().expect("fallback result");
        assert_eq!(resolved.token(), 7);
        assert_eq!(resolved.next_token(), 7);
        assert!(!resolved.is_finished());
        assert!(resolved.pages().is_empty());
    }

    #[test]
    fn waiting_future_stays_pending() {
        let (_read, mut future) = PendingRead::new(task_id(), 0, 1024);
        assert!((&mut future).now_or_never().is_none());
    }
}
