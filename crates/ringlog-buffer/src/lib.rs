//! ringlog-buffer: lock-free log transport ring buffers.
//!
//! The transport core of the ringlog engine: producers hand variable-size
//! byte chunks to per-thread SPSC ring buffers (or a shared MPSC fallback)
//! with at-most-one-copy semantics, and a single consumer drains them with
//! bounded latency. Buffers can live inside a memory-mapped file so that
//! committed-but-undrained records survive process termination and are
//! recovered on the next run.
//!
//! # Building blocks
//!
//! - [`SpscRing`]: single-producer byte ring on 8-byte blocks
//! - [`MpscRing`]: many-producer ring on cache-line blocks with per-chunk
//!   status words
//! - [`BlockList`]: lock-free intrusive free list of node buffers
//! - [`BufferGroup`]: one log's nodes + shared buffer + recovery file
//!
//! # Example
//!
//! ```
//! use ringlog_buffer::{BufferGroup, GroupConfig};
//!
//! let group = BufferGroup::create(&GroupConfig::default()).unwrap();
//!
//! // Producer side: reserve, fill, commit.
//! let mut chunk = group.alloc_write_chunk(5).unwrap();
//! chunk.fill(b"hello");
//! chunk.commit();
//!
//! // Consumer side: drain everything once.
//! let drained = group.consume(|data| {
//!     assert_eq!(data, b"hello");
//! });
//! assert_eq!(drained, 1);
//! ```

mod backoff;
mod block_list;
mod cursor;
mod error;
mod group;
mod invariants;
mod layout;
mod mmap;
mod mpsc;
mod region;
mod spsc;

pub use backoff::Backoff;
pub use block_list::{BlockList, NodeHead, NodeType, NIL_INDEX};
pub use error::{AllocError, ReadError, RecoveryError, RecoveryOutcome, SetupError};
pub use group::{BufferGroup, GroupConfig, GroupWriteChunk};
pub use layout::{
    BufferRole, BufferStamp, BUFFER_HEAD_SIZE, BUFFER_MISC_OFFSET, BUFFER_STAMP_SIZE,
    CACHE_LINE_SIZE, GROUP_HEAD_SIZE, MAGIC, MPSC_BLOCK_SIZE, SPSC_BLOCK_SIZE,
};
pub use mmap::MapFile;
pub use mpsc::{MpscReadChunk, MpscRing, MpscWriteChunk};
pub use region::Region;
pub use spsc::{BatchRead, ReadChunk, SpscRing, WriteChunk};

use std::sync::atomic::{AtomicU64, Ordering};

/// Last-resort diagnostics sink: plain text on stderr, never the log
/// pipeline itself. Used for recovery warnings and flush failures.
pub(crate) fn device_warn(message: &str) {
    use std::io::Write;
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "[ringlog-buffer] warning: {message}");
}

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TAG: u64 = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

/// A small, non-zero numeric tag for the calling thread, stable for the
/// thread's lifetime. Stamped into node heads and record headers.
pub fn thread_tag() -> u64 {
    THREAD_TAG.try_with(|tag| *tag).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_tags_are_unique_per_thread() {
        let here = thread_tag();
        assert_ne!(here, 0);
        assert_eq!(here, thread_tag());

        let other = std::thread::spawn(thread_tag).join().unwrap();
        assert_ne!(here, other);
    }
}
