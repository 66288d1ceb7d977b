use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::chunk::ChunkRef;
use crate::config::OutputBufferId;
use crate::error::BufferError;
use crate::read::{BufferReadFuture, PendingRead};
use crate::result::{BufferInfo, BufferResult, PageBufferInfo};

/// Per-client output buffer bridging producer and consumer pacing.
///
/// Producers enqueue chunk references; a single remote client polls with
/// [`get_pages`], quoting the sequence id of the next page it expects. The
/// quoted id acknowledges everything below it, which is when pages leave the
/// queue. A read by itself removes nothing, so a retried request observes
/// the same pages again (at-least-once delivery).
///
/// One lock serializes all mutations. `buffered_bytes`, the acknowledged
/// sequence id, and the destroyed flag are mirrored in atomics, written while
/// the lock is held, so [`info`] and [`is_destroyed`] never contend with the
/// state machine. Release callbacks and future completions always run after
/// the lock is dropped; they may re-enter memory-pool code that locks other
/// buffers.
///
/// [`get_pages`]: ClientBuffer::get_pages
/// [`info`]: ClientBuffer::info
/// [`is_destroyed`]: ClientBuffer::is_destroyed
pub struct ClientBuffer {
    task_instance_id: Arc<str>,
    buffer_id: OutputBufferId,
    buffered_bytes: AtomicU64,
    current_sequence_id: AtomicU64,
    // set when the client sends a DELETE: it has observed the end of the
    // buffer, or the server reclaimed it under memory pressure
    destroyed: AtomicBool,
    prefer_local: AtomicBool,
    state: Mutex<BufferState>,
}

#[derive(Default)]
struct BufferState {
    /// Queued pages, oldest first. The page at index `i` has sequence id
    /// `current_sequence_id + i`.
    pages: VecDeque<ChunkRef>,
    no_more_pages: bool,
    is_force_destroy: bool,
    pending_read: Option<PendingRead>,
}

impl ClientBuffer {
    pub fn new(task_instance_id: impl Into<Arc<str>>, buffer_id: OutputBufferId) -> Self {
        Self {
            task_instance_id: task_instance_id.into(),
            buffer_id,
            buffered_bytes: AtomicU64::new(0),
            current_sequence_id: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            prefer_local: AtomicBool::new(false),
            state: Mutex::new(BufferState::default()),
        }
    }

    #[inline]
    pub fn buffer_id(&self) -> OutputBufferId {
        self.buffer_id
    }

    #[inline]
    pub fn task_instance_id(&self) -> &str {
        &self.task_instance_id
    }

    /// Snapshot of the buffer's externally visible state.
    ///
    /// Lock free, so state machine updates can never stall an observability
    /// poll. `buffered_bytes` may trail an in-flight queue mutation by one
    /// atomic write; it is never negative.
    pub fn info(&self) -> BufferInfo {
        let destroyed = self.destroyed.load(Ordering::Acquire);
        let buffered_bytes = self.buffered_bytes.load(Ordering::Acquire);
        BufferInfo::new(
            self.buffer_id,
            destroyed,
            PageBufferInfo::new(self.buffer_id, buffered_bytes),
        )
    }

    /// Lock-free read of the destroyed flag.
    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Hint consumed by the enclosing manager when routing reads; no effect
    /// on buffer semantics.
    #[inline]
    pub fn prefer_local(&self) -> bool {
        self.prefer_local.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_prefer_local(&self, prefer_local: bool) {
        self.prefer_local.store(prefer_local, Ordering::Relaxed);
    }

    /// Appends chunk references to the queue, waking any waiting read.
    ///
    /// The buffer takes its own reference on each chunk, so the caller keeps
    /// whatever references it already holds. After [`set_no_more_pages`] or
    /// [`force_destroy`] the chunks are silently dropped without taking a
    /// reference: producers racing a limit-query completion are not punished.
    ///
    /// Returns `Internal` only when a chunk turns out to have been fully
    /// released already (a producer bug); the buffer tombstones itself so the
    /// client observes termination.
    ///
    /// [`set_no_more_pages`]: ClientBuffer::set_no_more_pages
    /// [`force_destroy`]: ClientBuffer::force_destroy
    pub fn enqueue_pages<I>(&self, refs: I) -> Result<(), BufferError>
    where
        I: IntoIterator<Item = ChunkRef>,
    {
        let pages: Vec<ChunkRef> = refs.into_iter().collect();
        if pages.is_empty() {
            return Ok(());
        }
        let pending;
        {
            let mut state = self.state.lock();
            if state.no_more_pages || state.is_force_destroy {
                return Ok(());
            }

            let mut referenced = 0usize;
            let mut resurrection = None;
            for page in &pages {
                match page.add_reference() {
                    Ok(()) => referenced += 1,
                    Err(err) => {
                        resurrection = Some(err);
                        break;
                    }
                }
            }
            if let Some(err) = resurrection {
                let removed = self.tombstone_locked(&mut state);
                let stale_read = state.pending_read.take();
                drop(state);
                error!(
                    task = %self.task_instance_id,
                    buffer = %self.buffer_id,
                    "released chunk enqueued; tombstoning buffer"
                );
                release_chunks(removed);
                release_chunks(pages.into_iter().take(referenced));
                if let Some(read) = stale_read {
                    read.complete_with_empty();
                }
                return Err(BufferError::internal(err));
            }

            let mut bytes_added = 0u64;
            let mut rows_added = 0u64;
            for page in pages {
                bytes_added += page.retained_size_in_bytes();
                rows_added += u64::from(page.position_count());
                state.pages.push_back(page);
            }
            self.buffered_bytes.fetch_add(bytes_added, Ordering::AcqRel);
            debug!(
                task = %self.task_instance_id,
                buffer = %self.buffer_id,
                rows = rows_added,
                bytes = bytes_added,
                "enqueued pages"
            );

            pending = state.pending_read.take();
        }

        // data arrived, answer the waiting read
        if let Some(read) = pending {
            self.process_pending_read(read);
        }
        Ok(())
    }

    /// Reads pages starting at `sequence_id`, up to roughly `max_bytes`.
    ///
    /// Quoting `sequence_id` acknowledges and removes every page below it.
    /// The returned future is ready immediately when the buffer has data, a
    /// terminal answer, or the request is out of order; otherwise the read is
    /// parked until a producer or a lifecycle terminator completes it. A
    /// still-parked earlier read is answered empty: each client has one
    /// outstanding read, so a new request means the old one was abandoned.
    ///
    /// `max_bytes` is a soft ceiling: a result always carries at least one
    /// page when any is queued, even if that page alone exceeds the budget.
    pub fn get_pages(
        &self,
        sequence_id: u64,
        max_bytes: u64,
    ) -> Result<BufferReadFuture, BufferError> {
        // acknowledge first, outside the lock, so release callbacks never run
        // while the buffer is locked
        self.acknowledge_pages(sequence_id)?;

        let abandoned;
        let outcome = {
            let mut state = self.state.lock();
            abandoned = state.pending_read.take();

            if !state.pages.is_empty()
                || state.no_more_pages
                || sequence_id != self.current_sequence_id.load(Ordering::Acquire)
            {
                match self.process_read_locked(&state, sequence_id, max_bytes) {
                    Ok(result) => {
                        Ok(BufferReadFuture::ready(Arc::clone(&self.task_instance_id), result))
                    }
                    Err(err) => {
                        let removed = self.tombstone_locked(&mut state);
                        let stale_read = state.pending_read.take();
                        drop(state);
                        release_chunks(removed);
                        if let Some(read) = stale_read {
                            read.complete_with_empty();
                        }
                        if let Some(read) = abandoned {
                            read.complete_with_empty();
                        }
                        return Err(err);
                    }
                }
            } else {
                let (read, future) = PendingRead::new(
                    Arc::clone(&self.task_instance_id),
                    sequence_id,
                    max_bytes,
                );
                state.pending_read = Some(read);
                Ok(future)
            }
        };

        if let Some(read) = abandoned {
            read.complete_with_empty();
        }
        outcome
    }

    /// Marks the natural end of the stream. Idempotent.
    ///
    /// A waiting read is answered immediately: with the remaining pages if
    /// any arrived concurrently, otherwise with an empty finished result.
    pub fn set_no_more_pages(&self) {
        let pending = {
            let mut state = self.state.lock();
            if state.no_more_pages {
                return;
            }
            state.no_more_pages = true;
            state.pending_read.take()
        };

        if let Some(read) = pending {
            self.process_pending_read(read);
        }
    }

    /// Client-observed end of life, normally driven by a transport DELETE.
    ///
    /// Drops all queued pages, marks the buffer destroyed, and answers any
    /// waiting read empty. Idempotent.
    pub fn destroy(&self) {
        let (removed, pending) = {
            let mut state = self.state.lock();
            let removed = self.tombstone_locked(&mut state);
            (removed, state.pending_read.take())
        };

        debug!(task = %self.task_instance_id, buffer = %self.buffer_id, "buffer destroyed");
        release_chunks(removed);
        if let Some(read) = pending {
            read.complete_with_empty();
        }
    }

    /// Server-initiated reclaim under memory pressure.
    ///
    /// Like [`destroy`] but records the teardown as operator-requested and
    /// leaves a parked read untouched: the buffer does not complete it, the
    /// caller chain owns client notification. The read stays installed and
    /// is answered later by a new read or the client's own DELETE, or falls
    /// back to an empty result if the buffer itself is dropped.
    ///
    /// [`destroy`]: ClientBuffer::destroy
    pub fn force_destroy(&self) {
        let removed = {
            let mut state = self.state.lock();
            state.is_force_destroy = true;
            self.tombstone_locked(&mut state)
        };

        debug!(task = %self.task_instance_id, buffer = %self.buffer_id, "buffer force destroyed");
        release_chunks(removed);
    }

    /// Clears the queue and flips the terminal flags. Pages are handed back
    /// for release outside the lock; the pending-read slot is left to the
    /// caller, because `force_destroy` must not disturb it.
    fn tombstone_locked(&self, state: &mut BufferState) -> Vec<ChunkRef> {
        let removed: Vec<ChunkRef> = state.pages.drain(..).collect();
        state.no_more_pages = true;
        self.buffered_bytes.store(0, Ordering::Release);
        self.destroyed.store(true, Ordering::Release);
        removed
    }

    /// Computes the answer for a parked read and completes it, lock dropped
    /// in between.
    fn process_pending_read(&self, read: PendingRead) {
        let result = {
            let state = self.state.lock();
            self.process_read_locked(&state, read.sequence_id(), read.max_bytes())
        };
        match result {
            Ok(result) => read.complete_with(result),
            Err(err) => {
                // bugs never surface through the future; the buffer is
                // poisoned and the client is answered empty
                error!(
                    task = %self.task_instance_id,
                    buffer = %self.buffer_id,
                    error = %err,
                    "failed to answer pending read"
                );
                let (removed, stale_read) = {
                    let mut state = self.state.lock();
                    let removed = self.tombstone_locked(&mut state);
                    (removed, state.pending_read.take())
                };
                release_chunks(removed);
                if let Some(stale) = stale_read {
                    stale.complete_with_empty();
                }
                read.complete_with_empty();
            }
        }
    }

    /// Read-side selection. Must be called with the buffer lock held.
    ///
    /// Requests below the acknowledged position are retries the client has
    /// already moved past; they get an empty unfinished result echoing their
    /// own token and are ignored on arrival. A drained buffer (empty queue
    /// with no more pages coming, which includes every destroyed buffer)
    /// answers finished so the client issues the DELETE. Requests ahead of
    /// the acknowledged position cannot happen on a live buffer because every
    /// read acknowledges first; that case is a bug.
    fn process_read_locked(
        &self,
        state: &BufferState,
        sequence_id: u64,
        max_bytes: u64,
    ) -> Result<BufferResult, BufferError> {
        let current_sequence_id = self.current_sequence_id.load(Ordering::Acquire);

        if sequence_id < current_sequence_id {
            return Ok(BufferResult::empty(
                Arc::clone(&self.task_instance_id),
                sequence_id,
                false,
            ));
        }

        if state.pages.is_empty() && state.no_more_pages {
            return Ok(BufferResult::empty(
                Arc::clone(&self.task_instance_id),
                current_sequence_id,
                true,
            ));
        }

        if sequence_id > current_sequence_id {
            debug_assert!(
                false,
                "read sequence id {sequence_id} is ahead of acknowledged position {current_sequence_id}"
            );
            return Err(BufferError::internal(format!(
                "read sequence id {sequence_id} is ahead of acknowledged position {current_sequence_id}"
            )));
        }

        let mut pages = Vec::new();
        let mut bytes = 0u64;
        for page in &state.pages {
            bytes = bytes.saturating_add(page.retained_size_in_bytes());
            // stop before the page that would blow the budget, but always
            // deliver at least one so oversize pages still move
            if !pages.is_empty() && bytes > max_bytes {
                break;
            }
            pages.push(page.chunk());
        }
        let next_token = sequence_id + pages.len() as u64;
        Ok(BufferResult::new(
            Arc::clone(&self.task_instance_id),
            sequence_id,
            next_token,
            false,
            pages,
        ))
    }

    /// Drops pages below `sequence_id`, releasing their references outside
    /// the lock.
    fn acknowledge_pages(&self, sequence_id: u64) -> Result<(), BufferError> {
        let removed = {
            let mut state = self.state.lock();
            if self.destroyed.load(Ordering::Acquire) {
                return Ok(());
            }

            let old_sequence_id = self.current_sequence_id.load(Ordering::Acquire);
            if sequence_id < old_sequence_id {
                // duplicate acknowledgement from a retried request
                return Ok(());
            }

            let pages_to_remove = sequence_id - old_sequence_id;
            if pages_to_remove > state.pages.len() as u64 {
                return Err(BufferError::InvalidAcknowledge {
                    requested: pages_to_remove,
                    queued: state.pages.len(),
                });
            }

            let removed: Vec<ChunkRef> =
                state.pages.drain(..pages_to_remove as usize).collect();
            let mut bytes_removed = 0u64;
            for page in &removed {
                bytes_removed += page.retained_size_in_bytes();
            }

            self.current_sequence_id
                .store(sequence_id, Ordering::Release);
            let before = self.buffered_bytes.fetch_sub(bytes_removed, Ordering::AcqRel);
            if before < bytes_removed {
                debug_assert!(false, "buffered byte accounting went negative");
                let drained = self.tombstone_locked(&mut state);
                let stale_read = state.pending_read.take();
                drop(state);
                error!(
                    task = %self.task_instance_id,
                    buffer = %self.buffer_id,
                    "buffered byte accounting went negative; tombstoning buffer"
                );
                release_chunks(removed);
                release_chunks(drained);
                if let Some(read) = stale_read {
                    read.complete_with_empty();
                }
                return Err(BufferError::internal(
                    "buffered byte accounting went negative",
                ));
            }
            removed
        };

        release_chunks(removed);
        Ok(())
    }
}

impl fmt::Debug for ClientBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuffer")
            .field("buffer_id", &self.buffer_id)
            .field(
                "sequence_id",
                &self.current_sequence_id.load(Ordering::Acquire),
            )
            .field("destroyed", &self.destroyed.load(Ordering::Acquire))
            .finish()
    }
}

/// Gives back one reference per chunk. Must be called without the buffer
/// lock held; the callbacks may lock other buffers.
fn release_chunks<I>(refs: I)
where
    I: IntoIterator<Item = ChunkRef>,
{
    for page in refs {
        if let Err(err) = page.release() {
            error!(error = %err, "failed to release chunk reference");
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;
    use crate::test_support::{ReleaseTracker, tracked_chunk};

    fn buffer() -> ClientBuffer {
        ClientBuffer::new("task-a.0", OutputBufferId::new(0))
    }

    #[test]
    fn fresh_buffer_reports_clean_info() {
        let buffer = buffer();
        let info = buffer.info();
        assert_eq!(info.buffer_id(), OutputBufferId::new(0));
        assert!(!info.is_destroyed());
        assert_eq!(info.page_buffer_info().buffered_bytes(), 0);
    }

    #[test]
    fn stale_read_echoes_its_own_token() {
        let buffer = buffer();
        let tracker = ReleaseTracker::new();
        buffer
            .enqueue_pages(vec![
                tracked_chunk(&tracker, 100, 10),
                tracked_chunk(&tracker, 100, 10),
            ])
            .unwrap();

        // acknowledges both pages, then parks waiting for more
        let mut parked = buffer.get_pages(2, 1024).unwrap();
        assert!((&mut parked).now_or_never().is_none());

        // sequence id 0 is behind the acknowledged position now
        let stale = buffer.get_pages(0, 1024).unwrap().now_or_never().unwrap();
        assert_eq!(stale.token(), 0);
        assert_eq!(stale.next_token(), 0);
        assert!(!stale.is_finished());
        assert!(stale.pages().is_empty());

        // the stale request also abandoned the parked read
        let abandoned = parked.now_or_never().unwrap();
        assert_eq!(abandoned.token(), 2);
        assert!(!abandoned.is_finished());
    }

    #[test]
    fn ack_ahead_of_queue_is_rejected() {
        let buffer = buffer();
        let tracker = ReleaseTracker::new();
        buffer
            .enqueue_pages(vec![tracked_chunk(&tracker, 100, 10)])
            .unwrap();

        let err = buffer.get_pages(5, 1024).unwrap_err();
        assert!(matches!(
            err,
            BufferError::InvalidAcknowledge {
                requested: 5,
                queued: 1
            }
        ));
    }

    #[test]
    fn debug_shows_identity_and_progress() {
        let buffer = buffer();
        let rendered = format!("{buffer:?}");
        assert!(rendered.contains("buffer_id"));
        assert!(rendered.contains("destroyed: false"));
    }
}
