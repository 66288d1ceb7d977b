//! Per-client output buffer for a distributed MPP execution engine.
//!
//! A producing task serializes result pages and hands them to one buffer per
//! consuming client; each remote client polls its buffer over an
//! asynchronous, retried transport. The buffer bridges the impedance
//! mismatch between producer and consumer pacing:
//!
//! - **Sequence numbering**: pages get monotonic, gap-free ids. A client
//!   acknowledges consumed work implicitly by quoting the next id it wants,
//!   which makes retries of in-flight requests safe (at-least-once delivery).
//! - **Reference counting**: the same serialized chunk may sit in several
//!   buffers (broadcast fan-out); a release callback fires exactly once when
//!   the last reference drops, driving the memory-accounting subsystem.
//! - **Asynchronous reads**: [`ClientBuffer::get_pages`] returns a ready
//!   future when data is available and otherwise parks the read until data or
//!   end-of-stream arrives.
//! - **Termination protocol**: `set_no_more_pages` marks the natural end,
//!   `destroy` is the client-acknowledged teardown, `force_destroy` the
//!   server-side reclaim.
//!
//! ## Key Components
//!
//! - [`ClientBuffer`]: the state machine owning the page queue
//! - [`ChunkRef`]: shared-ownership handle with a last-drop release callback
//! - [`BufferResult`]: pages plus tokens handed to the client
//! - [`BufferReadFuture`]: the one-shot future behind a parked read
//!
//! ## Thread Safety
//!
//! All public APIs are thread-safe. A single per-buffer lock serializes
//! mutations; byte accounting and the destroyed flag are mirrored in atomics
//! so observability snapshots never take the lock. Release callbacks and
//! future completions run strictly outside the lock.
//!
//! ## Example
//!
//! ```rust
//! use futures::FutureExt;
//! use mpp_output_buffer::{BufferError, ChunkRef, ClientBuffer, OutputBufferId, SerializedChunk};
//!
//! # fn main() -> Result<(), BufferError> {
//! let buffer = ClientBuffer::new("task-a.0", OutputBufferId::new(0));
//!
//! // producer: one initial reference, the buffer takes its own
//! let chunk = SerializedChunk::new(bytes::Bytes::from_static(b"rows"), 2, 64);
//! let page = ChunkRef::new(chunk, 1, || { /* return bytes to the pool */ })?;
//! buffer.enqueue_pages(vec![page.clone()])?;
//! page.release()?;
//!
//! // consumer: read, then acknowledge by quoting the next token
//! let result = buffer.get_pages(0, 1024)?.now_or_never().expect("data is ready");
//! assert_eq!(result.next_token(), 1);
//!
//! buffer.set_no_more_pages();
//! let done = buffer.get_pages(1, 1024)?.now_or_never().expect("terminal answer");
//! assert!(done.is_finished());
//! buffer.destroy();
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod client;
pub mod config;
pub mod error;
pub mod read;
pub mod result;
pub mod test_support;

pub use chunk::{ChunkRef, SerializedChunk};
pub use client::ClientBuffer;
pub use config::OutputBufferId;
pub use error::BufferError;
pub use read::BufferReadFuture;
pub use result::{BufferInfo, BufferResult, PageBufferInfo};
