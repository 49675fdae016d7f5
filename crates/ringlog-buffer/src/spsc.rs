//! Single-producer single-consumer ring buffer.
//!
//! Byte-granular, block-aligned (8-byte blocks) circular buffer with chunk
//! allocation, commit, read, return and crash recovery. One thread writes,
//! one thread reads; neither ever blocks on the other.
//!
//! # Memory ordering & synchronization strategy
//!
//! **Producer (write path):**
//! 1. Read `wt_writing` shadow (plain load, producer-owned)
//! 2. Read `wt_reading` shadow; if space looks insufficient, refresh it
//!    with an Acquire load of the live `reading_cursor`
//! 3. Write the chunk header and let the caller fill the payload
//! 4. On commit, store `writing_cursor` with Release (publishes header and
//!    payload bytes to the consumer)
//!
//! **Consumer (read path):**
//! 1. Read `rt_reading` shadow (plain load, consumer-owned)
//! 2. Read `rt_writing` shadow; if it looks empty, refresh it with an
//!    Acquire load of the live `writing_cursor`
//! 3. Read chunk header and payload (ordered by the Acquire above)
//! 4. On return, store `reading_cursor` with Release (releases the blocks
//!    back to the producer)
//!
//! The four shadow cells live on the producer's and consumer's own cache
//! lines and have exactly one writer each, which is what makes the plain
//! `UnsafeCell` accesses sound. Debug builds verify the single-writer /
//! single-reader discipline by recording thread tags.
//!
//! # Chunk format
//!
//! A chunk starts on a block boundary with a 4-byte little-endian payload
//! size; the payload follows immediately and is always contiguous. A zero
//! size marks a padding chunk: the producer stamps one when a chunk would
//! straddle the wrap boundary, and the reader skips it by jumping to the
//! wrap. The block span of a data chunk is derived from its size.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::cursor;
use crate::error::{AllocError, ReadError, RecoveryError, RecoveryOutcome, SetupError};
use crate::invariants::{
    debug_assert_chunk_geometry, debug_assert_cursor_window, debug_assert_reader_behind_writer,
};
use crate::layout::{
    self, BufferHead, BUFFER_HEAD_SIZE, CACHE_LINE_SIZE, HEAD_STATE_READY, MAGIC,
    SPSC_BLOCK_SIZE, SPSC_CHUNK_HEADER_SIZE,
};
use crate::region::Region;

/// Blocks spanned by a data chunk of `size` payload bytes.
#[inline]
pub fn blocks_needed(size: u32) -> u32 {
    (SPSC_CHUNK_HEADER_SIZE as u32 + size + (SPSC_BLOCK_SIZE as u32 - 1)) / SPSC_BLOCK_SIZE as u32
}

#[cfg(debug_assertions)]
struct DebugState {
    check_thread: std::sync::atomic::AtomicBool,
    write_thread: std::sync::atomic::AtomicU64,
    read_thread: std::sync::atomic::AtomicU64,
    total_write_bytes: std::sync::atomic::AtomicU64,
    total_read_bytes: std::sync::atomic::AtomicU64,
}

#[cfg(debug_assertions)]
impl DebugState {
    fn new() -> Self {
        Self {
            check_thread: std::sync::atomic::AtomicBool::new(true),
            write_thread: std::sync::atomic::AtomicU64::new(0),
            read_thread: std::sync::atomic::AtomicU64::new(0),
            total_write_bytes: std::sync::atomic::AtomicU64::new(0),
            total_read_bytes: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn check(slot: &std::sync::atomic::AtomicU64, enabled: bool, role: &str) {
        if !enabled {
            return;
        }
        let me = crate::thread_tag();
        let seen = slot
            .compare_exchange(0, me, Ordering::Relaxed, Ordering::Relaxed)
            .unwrap_or_else(|current| current);
        debug_assert!(
            seen == 0 || seen == me,
            "{role} side used from two threads: {seen} and {me}"
        );
    }
}

/// Single-producer single-consumer ring buffer over a borrowed region.
///
/// The ring does not own its memory; it holds the [`Region`] through an
/// `Arc` so a group can carve many buffers from one mapping.
pub struct SpscRing {
    _region: Arc<Region>,
    head: *mut BufferHead,
    blocks: *mut u8,
    count: u32,
    outcome: RecoveryOutcome,
    #[cfg(debug_assertions)]
    debug: DebugState,
}

// Safety: one thread allocates/commits, one thread reads/returns; the
// cursors synchronize them with Release/Acquire. The debug state verifies
// the discipline in debug builds.
unsafe impl Send for SpscRing {}
unsafe impl Sync for SpscRing {}

/// An allocated, not yet committed write chunk.
///
/// Fill [`data`](WriteChunk::data) and call [`commit`](WriteChunk::commit);
/// dropping without committing rolls the allocation back (valid only while
/// a single chunk is outstanding, which the SPSC discipline implies).
pub struct WriteChunk<'a> {
    ring: &'a SpscRing,
    data: *mut u8,
    len: u32,
    start: u32,
    end: u32,
    was_empty: bool,
}

impl<'a> WriteChunk<'a> {
    /// The payload region, exactly the requested size.
    #[inline]
    pub fn data(&mut self) -> &mut [u8] {
        // SAFETY: the span was reserved for this producer at allocation and
        // is not visible to the consumer until commit.
        unsafe { std::slice::from_raw_parts_mut(self.data, self.len as usize) }
    }

    /// Copies `bytes` into the chunk (must match the allocated size).
    #[inline]
    pub fn fill(&mut self, bytes: &[u8]) {
        self.data().copy_from_slice(bytes);
    }

    /// Publishes the chunk to the consumer with a Release store.
    ///
    /// Returns `true` if the buffer looked empty to the producer right
    /// before this chunk, i.e. the consumer may be asleep and worth waking.
    pub fn commit(self) -> bool {
        let was_empty = self.was_empty;
        // SAFETY: head outlives self via the ring's region Arc.
        unsafe {
            #[cfg(debug_assertions)]
            self.ring
                .debug
                .total_write_bytes
                .fetch_add(u64::from(self.len), Ordering::Relaxed);
            (*self.ring.head)
                .writing_cursor
                .store(self.end, Ordering::Release);
        }
        std::mem::forget(self);
        was_empty
    }
}

impl Drop for WriteChunk<'_> {
    fn drop(&mut self) {
        // Uncommitted allocation: roll the writer shadow back.
        self.ring.set_wt_writing(self.start);
    }
}

/// A chunk handed out by [`SpscRing::read_chunk`]. Pass it back through
/// [`SpscRing::return_read_chunk`] or [`SpscRing::discard_read_chunk`].
pub struct ReadChunk<'a> {
    data: *const u8,
    len: u32,
    pub(crate) end: u32,
    _marker: std::marker::PhantomData<&'a SpscRing>,
}

impl<'a> ReadChunk<'a> {
    /// The chunk payload.
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        // SAFETY: the span stays reserved until the chunk is returned, and
        // the slice points into the region which outlives 'a.
        unsafe { std::slice::from_raw_parts(self.data, self.len as usize) }
    }
}

/// Snapshot iterator over everything committed at [`SpscRing::batch_read`]
/// time. Call [`SpscRing::return_batch_read_chunks`] to release the blocks;
/// dropping the handle instead consumes nothing.
pub struct BatchRead<'a> {
    ring: &'a SpscRing,
    start: u32,
    current: u32,
    end: u32,
}

impl<'a> BatchRead<'a> {
    /// Returns `true` while the snapshot still holds unread chunks.
    #[inline]
    pub fn has_next(&self) -> bool {
        self.current != self.end
    }

    /// The next chunk payload in commit order, skipping padding.
    pub fn next(&mut self) -> Option<&'a [u8]> {
        while self.current != self.end {
            let size = self.ring.read_header(self.current);
            if size == 0 {
                let skip = cursor::blocks_to_wrap(self.current, self.ring.count);
                debug_assert!(skip <= cursor::distance(self.end, self.current));
                self.current = self.current.wrapping_add(skip);
                self.ring.set_rt_reading(self.current);
                continue;
            }
            let span = blocks_needed(size);
            debug_assert_chunk_geometry!(span, size, SPSC_BLOCK_SIZE, SPSC_CHUNK_HEADER_SIZE);
            debug_assert!(span <= cursor::distance(self.end, self.current));
            let data = self.ring.data_ptr(self.current);
            self.current = self.current.wrapping_add(span);
            self.ring.set_rt_reading(self.current);
            // SAFETY: the snapshot window [start, end) was published by the
            // producer before the Acquire load that froze `end`.
            return Some(unsafe { std::slice::from_raw_parts(data, size as usize) });
        }
        None
    }
}

impl Drop for BatchRead<'_> {
    fn drop(&mut self) {
        // Dropped without return: rewind the shadow so nothing counts as
        // consumed.
        self.ring.set_rt_reading(self.start);
    }
}

impl SpscRing {
    /// Places a ring over `len` bytes of `region` starting at `offset`
    /// (which must be cache-line aligned).
    ///
    /// With `try_recover`, pre-existing state in the region is validated
    /// and adopted; on any mismatch the ring is freshly initialized and
    /// [`recovery_outcome`](Self::recovery_outcome) reports the reason.
    pub fn new(
        region: Arc<Region>,
        offset: usize,
        len: usize,
        try_recover: bool,
    ) -> Result<Self, SetupError> {
        assert!(offset % layout::CACHE_LINE_SIZE == 0, "unaligned buffer offset");
        assert!(offset + len <= region.len(), "buffer exceeds region");
        let Some(count) = layout::blocks_in_region(len, SPSC_BLOCK_SIZE) else {
            return Err(SetupError::RegionTooSmall {
                needed: layout::min_region_size(1, SPSC_BLOCK_SIZE),
                got: len,
            });
        };

        // SAFETY: offset is in bounds and cache-line aligned, so the head
        // cast is aligned; the block array follows inside the region.
        let (head, blocks) = unsafe {
            let base = region.as_ptr().add(offset);
            (base.cast::<BufferHead>(), base.add(BUFFER_HEAD_SIZE))
        };

        let ring = Self {
            _region: region,
            head,
            blocks,
            count,
            outcome: RecoveryOutcome::Fresh,
            #[cfg(debug_assertions)]
            debug: DebugState::new(),
        };

        let outcome = if try_recover {
            match ring.try_recover() {
                Ok(()) => RecoveryOutcome::Recovered,
                Err(reason) => {
                    crate::device_warn(&format!(
                        "spsc buffer recovery rejected ({reason}); starting fresh"
                    ));
                    ring.init_fresh();
                    RecoveryOutcome::Rejected(reason)
                }
            }
        } else {
            ring.init_fresh();
            RecoveryOutcome::Fresh
        };

        Ok(Self { outcome, ..ring })
    }

    /// Smallest region size guaranteeing `expected_bytes` of block storage.
    pub fn min_region_size(expected_bytes: u32) -> usize {
        layout::min_region_size(expected_bytes, SPSC_BLOCK_SIZE)
    }

    /// How this ring came up: fresh, recovered, or recovery rejected.
    #[inline]
    pub fn recovery_outcome(&self) -> RecoveryOutcome {
        self.outcome
    }

    /// Total block count (a power of two).
    #[inline]
    pub fn total_blocks(&self) -> u32 {
        self.count
    }

    /// Block size in bytes.
    #[inline]
    pub fn block_size(&self) -> u32 {
        SPSC_BLOCK_SIZE as u32
    }

    /// Largest payload a single chunk can carry in this buffer.
    #[inline]
    pub fn max_chunk_size(&self) -> u32 {
        self.count * SPSC_BLOCK_SIZE as u32 - SPSC_CHUNK_HEADER_SIZE as u32
    }

    /// Live blocks currently held between the cursors (racy snapshot).
    pub fn live_blocks(&self) -> u32 {
        // SAFETY: head is valid for the ring's lifetime.
        let (w, r) = unsafe {
            (
                (*self.head).writing_cursor.load(Ordering::Relaxed),
                (*self.head).reading_cursor.load(Ordering::Relaxed),
            )
        };
        cursor::distance(w, r)
    }

    /// Free blocks currently available to the producer (racy snapshot).
    pub fn free_blocks(&self) -> u32 {
        self.count - self.live_blocks()
    }

    /// `true` once the head finished initialization. Goes false only when
    /// the head is wiped underneath the buffer (e.g. an externally
    /// damaged mapping); allocation refuses to run in that state.
    #[inline]
    pub fn is_inited(&self) -> bool {
        // SAFETY: head is valid for the ring's lifetime.
        unsafe { (*self.head).state.load(Ordering::Relaxed) == HEAD_STATE_READY }
    }

    /// Copies `bytes` into the head's misc area (group stamping; setup and
    /// recovery paths only, which are single-threaded).
    pub(crate) fn write_misc(&self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= CACHE_LINE_SIZE);
        // SAFETY: the misc line belongs to the owning group, which only
        // touches it while the buffer is quiescent.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (*self.head).misc.get().cast::<u8>(),
                bytes.len(),
            );
        }
    }

    /// Copies the head's misc area into `out`.
    pub(crate) fn read_misc(&self, out: &mut [u8]) {
        debug_assert!(out.len() <= CACHE_LINE_SIZE);
        // SAFETY: as in write_misc.
        unsafe {
            std::ptr::copy_nonoverlapping(
                (*self.head).misc.get().cast::<u8>(),
                out.as_mut_ptr(),
                out.len(),
            );
        }
    }

    /// Forgets the recorded producer/consumer thread tags. Called when a
    /// node buffer is handed to a different producer thread.
    pub(crate) fn debug_reset_threads(&self) {
        #[cfg(debug_assertions)]
        {
            self.debug.write_thread.store(0, Ordering::Relaxed);
            self.debug.read_thread.store(0, Ordering::Relaxed);
        }
    }

    /// Debug-only thread ownership checks (ignored in release builds).
    pub fn set_thread_check_enable(&self, enable: bool) {
        #[cfg(debug_assertions)]
        {
            self.debug.check_thread.store(enable, Ordering::Relaxed);
            if !enable {
                self.debug.write_thread.store(0, Ordering::Relaxed);
                self.debug.read_thread.store(0, Ordering::Relaxed);
            }
        }
        #[cfg(not(debug_assertions))]
        let _ = enable;
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Reserves a chunk of exactly `size` payload bytes.
    ///
    /// The returned chunk is invisible to the consumer until
    /// [`WriteChunk::commit`]. If the chunk would straddle the wrap
    /// boundary a padding marker is stamped over the tail blocks and the
    /// chunk starts at block 0; both spans must fit for the call to
    /// succeed.
    pub fn alloc_write_chunk(&self, size: u32) -> Result<WriteChunk<'_>, AllocError> {
        #[cfg(debug_assertions)]
        DebugState::check(
            &self.debug.write_thread,
            self.debug.check_thread.load(Ordering::Relaxed),
            "producer",
        );

        if !self.is_inited() {
            return Err(AllocError::NotInited);
        }
        if size == 0 || size > self.max_chunk_size() {
            return Err(AllocError::SizeInvalid);
        }

        let needed = blocks_needed(size);
        let w = self.wt_writing();
        let to_wrap = cursor::blocks_to_wrap(w, self.count);
        let straddles = needed > to_wrap;
        let required = if straddles { to_wrap + needed } else { needed };

        // Fast path: check the cached reader cursor.
        let mut r = self.wt_reading();
        if cursor::free_blocks(self.count, w, r) < required {
            // Slow path: refresh the cache from the live cursor.
            // SAFETY: head is valid; Acquire pairs with the consumer's
            // Release store in return_read_chunk.
            r = unsafe { (*self.head).reading_cursor.load(Ordering::Acquire) };
            self.set_wt_reading(r);
            if cursor::free_blocks(self.count, w, r) < required {
                return Err(AllocError::NotEnoughSpace);
            }
        }

        let was_empty = w == r;
        let header_cursor = if straddles {
            // The tail cannot hold the header + payload contiguously:
            // mark it as padding and restart at block 0.
            self.write_header(w, 0);
            w.wrapping_add(to_wrap)
        } else {
            w
        };
        let end = header_cursor.wrapping_add(needed);
        self.write_header(header_cursor, size);
        self.set_wt_writing(end);
        debug_assert_cursor_window!(end, r, self.count);

        Ok(WriteChunk {
            ring: self,
            data: self.data_ptr(header_cursor).cast_mut(),
            len: size,
            start: w,
            end,
            was_empty,
        })
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    /// Returns the oldest unconsumed chunk, skipping padding transparently.
    ///
    /// The cursor does not move until the chunk is passed to
    /// [`return_read_chunk`](Self::return_read_chunk); calling `read_chunk`
    /// again first returns the same chunk.
    pub fn read_chunk(&self) -> Result<ReadChunk<'_>, ReadError> {
        #[cfg(debug_assertions)]
        DebugState::check(
            &self.debug.read_thread,
            self.debug.check_thread.load(Ordering::Relaxed),
            "consumer",
        );

        let mut r = self.rt_reading();
        loop {
            let mut w = self.rt_writing();
            if cursor::distance(w, r) == 0 {
                // SAFETY: head is valid; Acquire pairs with the producer's
                // Release store in WriteChunk::commit.
                w = unsafe { (*self.head).writing_cursor.load(Ordering::Acquire) };
                self.set_rt_writing(w);
                if cursor::distance(w, r) == 0 {
                    return Err(ReadError::Empty);
                }
            }

            let size = self.read_header(r);
            if size == 0 {
                // Padding chunk: everything to the wrap boundary is dead.
                let skip = cursor::blocks_to_wrap(r, self.count);
                debug_assert!(skip <= cursor::distance(w, r));
                r = r.wrapping_add(skip);
                self.set_rt_reading(r);
                // SAFETY: head is valid; releases the padding blocks.
                unsafe { (*self.head).reading_cursor.store(r, Ordering::Release) };
                continue;
            }

            let span = blocks_needed(size);
            debug_assert_chunk_geometry!(span, size, SPSC_BLOCK_SIZE, SPSC_CHUNK_HEADER_SIZE);
            debug_assert!(span <= cursor::distance(w, r));
            #[cfg(debug_assertions)]
            self.debug
                .total_read_bytes
                .fetch_add(u64::from(size), Ordering::Relaxed);
            return Ok(ReadChunk {
                data: self.data_ptr(r),
                len: size,
                end: r.wrapping_add(span),
                _marker: std::marker::PhantomData,
            });
        }
    }

    /// Diagnostic hook: reports empty without touching any cursor, even if
    /// the buffer holds data.
    pub fn read_an_empty_chunk(&self) -> Result<ReadChunk<'_>, ReadError> {
        Err(ReadError::Empty)
    }

    /// Marks a read chunk consumed, releasing its blocks to the producer.
    pub fn return_read_chunk(&self, chunk: ReadChunk<'_>) {
        let end = chunk.end;
        debug_assert_reader_behind_writer!(end, self.rt_writing(), self.rt_reading());
        self.set_rt_reading(end);
        // SAFETY: head is valid; Release pairs with the producer's Acquire
        // refresh in alloc_write_chunk.
        unsafe { (*self.head).reading_cursor.store(end, Ordering::Release) };
    }

    /// Drops a read chunk without consuming it; the next
    /// [`read_chunk`](Self::read_chunk) returns the same data again.
    pub fn discard_read_chunk(&self, chunk: ReadChunk<'_>) {
        drop(chunk);
    }

    /// Freezes the writing cursor once and returns an iterator over every
    /// chunk committed up to that point.
    pub fn batch_read(&self) -> BatchRead<'_> {
        #[cfg(debug_assertions)]
        DebugState::check(
            &self.debug.read_thread,
            self.debug.check_thread.load(Ordering::Relaxed),
            "consumer",
        );

        let r = self.rt_reading();
        // SAFETY: head is valid; Acquire freezes the snapshot end.
        let w = unsafe { (*self.head).writing_cursor.load(Ordering::Acquire) };
        self.set_rt_writing(w);
        BatchRead {
            ring: self,
            start: r,
            current: r,
            end: w,
        }
    }

    /// Releases every chunk the batch handle stepped over.
    pub fn return_batch_read_chunks(&self, batch: BatchRead<'_>) {
        debug_assert!(std::ptr::eq(batch.ring, self));
        let end = batch.current;
        self.set_rt_reading(end);
        // SAFETY: head is valid; Release pairs with the producer's Acquire.
        unsafe { (*self.head).reading_cursor.store(end, Ordering::Release) };
        std::mem::forget(batch);
    }

    /// Walks all live chunks without consuming anything.
    pub fn data_traverse(&self, mut callback: impl FnMut(&[u8])) {
        let r = self.rt_reading();
        // SAFETY: head is valid.
        let w = unsafe { (*self.head).writing_cursor.load(Ordering::Acquire) };
        let mut pos = r;
        while pos != w {
            let size = self.read_header(pos);
            if size == 0 {
                pos = pos.wrapping_add(cursor::blocks_to_wrap(pos, self.count));
                continue;
            }
            // SAFETY: [r, w) was published before the Acquire load above.
            callback(unsafe {
                std::slice::from_raw_parts(self.data_ptr(pos), size as usize)
            });
            pos = pos.wrapping_add(blocks_needed(size));
        }
    }

    // ---------------------------------------------------------------------
    // INITIALIZATION & RECOVERY
    // ---------------------------------------------------------------------

    fn init_fresh(&self) {
        // SAFETY: the head span belongs to this ring alone during setup.
        unsafe {
            std::ptr::write_bytes(self.head.cast::<u8>(), 0, BUFFER_HEAD_SIZE);
            let head = &mut *self.head;
            head.magic = MAGIC;
            head.aligned_blocks_count = self.count;
            head.checksum = layout::head_checksum(&MAGIC, self.count);
            // Ready marker goes last: a crash before this line leaves the
            // head visibly unusable.
            head.state.store(HEAD_STATE_READY, Ordering::Release);
        }
    }

    fn try_recover(&self) -> Result<(), RecoveryError> {
        // SAFETY: the head span is exclusively ours during setup.
        let head = unsafe { &*self.head };
        if head.magic != MAGIC {
            return Err(RecoveryError::BadMagic);
        }
        if head.aligned_blocks_count != self.count {
            return Err(RecoveryError::BlockCountMismatch);
        }
        if head.checksum != layout::head_checksum(&MAGIC, self.count) {
            return Err(RecoveryError::BadChecksum);
        }
        if head.state.load(Ordering::Relaxed) != HEAD_STATE_READY {
            return Err(RecoveryError::HeadNotReady);
        }

        let r = head.reading_cursor.load(Ordering::Relaxed);
        let w = head.writing_cursor.load(Ordering::Relaxed);
        if cursor::distance(w, r) > self.count {
            return Err(RecoveryError::CursorsOutOfRange);
        }

        // Walk the live window: every chunk must be well-formed and the
        // walk must land exactly on the writing cursor.
        let mut pos = r;
        while pos != w {
            let size = self.read_header(pos);
            let span = if size == 0 {
                cursor::blocks_to_wrap(pos, self.count)
            } else {
                if size > self.max_chunk_size() {
                    return Err(RecoveryError::TornChunks);
                }
                blocks_needed(size)
            };
            if span > cursor::distance(w, pos) {
                return Err(RecoveryError::TornChunks);
            }
            pos = pos.wrapping_add(span);
        }

        // Adopt: reset the shadows to the recovered cursors.
        self.set_rt_reading(r);
        self.set_rt_writing(w);
        self.set_wt_reading(r);
        self.set_wt_writing(w);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // RAW ACCESS HELPERS
    // ---------------------------------------------------------------------

    #[inline]
    fn block_ptr(&self, cursor_value: u32) -> *mut u8 {
        let idx = cursor::index(cursor_value, self.count) as usize;
        // SAFETY: idx < count, so the offset stays inside the block array.
        unsafe { self.blocks.add(idx * SPSC_BLOCK_SIZE) }
    }

    #[inline]
    fn data_ptr(&self, cursor_value: u32) -> *const u8 {
        // SAFETY: the payload begins right after the 4-byte header and, by
        // the padding discipline, never crosses the wrap boundary.
        unsafe { self.block_ptr(cursor_value).add(SPSC_CHUNK_HEADER_SIZE) }
    }

    #[inline]
    fn write_header(&self, cursor_value: u32, data_size: u32) {
        // SAFETY: block starts are 8-byte aligned, so the u32 store is
        // aligned; the span is owned by the producer until commit.
        unsafe {
            self.block_ptr(cursor_value)
                .cast::<u32>()
                .write(data_size.to_le());
        }
    }

    #[inline]
    fn read_header(&self, cursor_value: u32) -> u32 {
        // SAFETY: aligned u32 load inside the block array; ordering is
        // provided by the cursor Acquire/Release protocol.
        u32::from_le(unsafe { self.block_ptr(cursor_value).cast::<u32>().read() })
    }

    // Shadow accessors. Each cell has exactly one writing thread; see the
    // module-level ordering notes.

    #[inline]
    fn rt_reading(&self) -> u32 {
        // SAFETY: consumer-owned cell.
        unsafe { *(*self.head).rt.reading.get() }
    }

    #[inline]
    fn set_rt_reading(&self, v: u32) {
        // SAFETY: consumer-owned cell.
        unsafe { *(*self.head).rt.reading.get() = v }
    }

    #[inline]
    fn rt_writing(&self) -> u32 {
        // SAFETY: consumer-owned cell.
        unsafe { *(*self.head).rt.writing.get() }
    }

    #[inline]
    fn set_rt_writing(&self, v: u32) {
        // SAFETY: consumer-owned cell.
        unsafe { *(*self.head).rt.writing.get() = v }
    }

    #[inline]
    fn wt_reading(&self) -> u32 {
        // SAFETY: producer-owned cell.
        unsafe { *(*self.head).wt.reading.get() }
    }

    #[inline]
    fn set_wt_reading(&self, v: u32) {
        // SAFETY: producer-owned cell.
        unsafe { *(*self.head).wt.reading.get() = v }
    }

    #[inline]
    fn wt_writing(&self) -> u32 {
        // SAFETY: producer-owned cell.
        unsafe { *(*self.head).wt.writing.get() }
    }

    #[inline]
    fn set_wt_writing(&self, v: u32) {
        // SAFETY: producer-owned cell.
        unsafe { *(*self.head).wt.writing.get() = v }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with_blocks(count: u32) -> SpscRing {
        let len = BUFFER_HEAD_SIZE + count as usize * SPSC_BLOCK_SIZE;
        let region = Arc::new(Region::heap(len));
        SpscRing::new(region, 0, len, false).unwrap()
    }

    #[test]
    fn test_block_spans_for_small_sizes() {
        // 16 blocks of 8 bytes; payloads 1/2/4 fit beside the 4-byte
        // header in one block, 8 needs two, 16 needs three.
        let ring = ring_with_blocks(16);
        let sizes = [1u32, 2, 4, 8, 16];
        let expected_spans = [1u32, 1, 1, 2, 3];

        for (size, expected) in sizes.iter().zip(expected_spans) {
            assert_eq!(blocks_needed(*size), expected);
            let mut chunk = ring.alloc_write_chunk(*size).unwrap();
            chunk.data().fill(*size as u8);
            chunk.commit();
        }
        assert_eq!(ring.free_blocks(), 16 - 8);

        // Consume the first two chunks: the reading cursor advances two
        // blocks, freeing them.
        for expected_size in [1usize, 2] {
            let chunk = ring.read_chunk().unwrap();
            assert_eq!(chunk.data().len(), expected_size);
            ring.return_read_chunk(chunk);
        }
        assert_eq!(ring.free_blocks(), 10);
    }

    #[test]
    fn test_alloc_size_bounds() {
        let ring = ring_with_blocks(16);
        assert_eq!(ring.max_chunk_size(), 16 * 8 - 4);

        assert!(matches!(
            ring.alloc_write_chunk(0),
            Err(AllocError::SizeInvalid)
        ));
        assert!(matches!(
            ring.alloc_write_chunk(ring.max_chunk_size() + 1),
            Err(AllocError::SizeInvalid)
        ));

        // The largest valid chunk fills the buffer exactly once.
        let mut chunk = ring.alloc_write_chunk(ring.max_chunk_size()).unwrap();
        assert_eq!(chunk.data().len(), 124);
        chunk.commit();
        assert_eq!(ring.free_blocks(), 0);
        assert!(matches!(
            ring.alloc_write_chunk(1),
            Err(AllocError::NotEnoughSpace)
        ));

        // Draining frees the space again.
        let read = ring.read_chunk().unwrap();
        ring.return_read_chunk(read);
        assert!(ring.alloc_write_chunk(1).is_ok());
    }

    #[test]
    fn test_fill_to_one_block_short() {
        let ring = ring_with_blocks(16);
        // 15 of 16 blocks: one 116-byte chunk spans 15 blocks.
        let mut chunk = ring.alloc_write_chunk(116).unwrap();
        chunk.data().fill(0xEE);
        chunk.commit();
        assert_eq!(ring.free_blocks(), 1);

        let one = ring.alloc_write_chunk(1).unwrap();
        one.commit();
        assert!(matches!(
            ring.alloc_write_chunk(1),
            Err(AllocError::NotEnoughSpace)
        ));
    }

    #[test]
    fn test_round_trip_preserves_bytes() {
        let ring = ring_with_blocks(64);
        let payload: Vec<u8> = (0u8..=255).cycle().take(100).collect();

        let mut chunk = ring.alloc_write_chunk(payload.len() as u32).unwrap();
        chunk.fill(&payload);
        chunk.commit();

        let read = ring.read_chunk().unwrap();
        assert_eq!(read.data(), payload.as_slice());
        ring.return_read_chunk(read);
        assert!(matches!(ring.read_chunk(), Err(ReadError::Empty)));
    }

    #[test]
    fn test_discard_returns_same_chunk() {
        let ring = ring_with_blocks(16);
        let mut chunk = ring.alloc_write_chunk(8).unwrap();
        chunk.fill(&[1, 2, 3, 4, 5, 6, 7, 8]);
        chunk.commit();

        let first = ring.read_chunk().unwrap();
        let bytes: Vec<u8> = first.data().to_vec();
        ring.discard_read_chunk(first);

        let second = ring.read_chunk().unwrap();
        assert_eq!(second.data(), bytes.as_slice());
        ring.return_read_chunk(second);
    }

    #[test]
    fn test_padding_skipped_across_wrap() {
        let ring = ring_with_blocks(16);

        // Occupy 14 blocks, free them, then allocate a chunk that cannot
        // fit in the 2-block tail: the tail becomes padding and the chunk
        // lands at block 0.
        let c = ring.alloc_write_chunk(108).unwrap(); // 14 blocks
        c.commit();
        let read = ring.read_chunk().unwrap();
        ring.return_read_chunk(read);

        let payload = [0x5Au8; 40]; // needs 6 blocks: straddles
        let mut chunk = ring.alloc_write_chunk(40).unwrap();
        chunk.fill(&payload);
        chunk.commit();

        // padding (2 blocks) + chunk (6 blocks)
        assert_eq!(ring.free_blocks(), 16 - 8);

        let read = ring.read_chunk().unwrap();
        assert_eq!(read.data(), payload.as_slice());
        ring.return_read_chunk(read);
        assert_eq!(ring.free_blocks(), 16);
    }

    #[test]
    fn test_uncommitted_chunk_rolls_back() {
        let ring = ring_with_blocks(16);
        {
            let mut chunk = ring.alloc_write_chunk(32).unwrap();
            chunk.data().fill(9);
            // dropped without commit
        }
        assert!(matches!(ring.read_chunk(), Err(ReadError::Empty)));

        // The space is reusable.
        let chunk = ring.alloc_write_chunk(ring.max_chunk_size()).unwrap();
        chunk.commit();
        assert_eq!(ring.free_blocks(), 0);
    }

    #[test]
    fn test_batch_read_drains_snapshot() {
        let ring = ring_with_blocks(64);
        for i in 0u8..5 {
            let mut chunk = ring.alloc_write_chunk(4).unwrap();
            chunk.fill(&[i; 4]);
            chunk.commit();
        }

        let mut batch = ring.batch_read();
        let mut seen = Vec::new();
        while let Some(data) = batch.next() {
            seen.push(data[0]);
        }
        ring.return_batch_read_chunks(batch);

        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(matches!(ring.read_chunk(), Err(ReadError::Empty)));
        assert_eq!(ring.free_blocks(), 64);
    }

    #[test]
    fn test_dropped_batch_consumes_nothing() {
        let ring = ring_with_blocks(64);
        for _ in 0..3 {
            ring.alloc_write_chunk(4).unwrap().commit();
        }
        {
            let mut batch = ring.batch_read();
            let _ = batch.next();
            // dropped without return_batch_read_chunks
        }
        let mut batch = ring.batch_read();
        let mut n = 0;
        while batch.next().is_some() {
            n += 1;
        }
        ring.return_batch_read_chunks(batch);
        assert_eq!(n, 3);
    }

    #[test]
    fn test_data_traverse_does_not_consume() {
        let ring = ring_with_blocks(64);
        for i in 0u8..4 {
            let mut chunk = ring.alloc_write_chunk(2).unwrap();
            chunk.fill(&[i, i]);
            chunk.commit();
        }
        let mut seen = 0;
        ring.data_traverse(|_| seen += 1);
        assert_eq!(seen, 4);
        // still all readable
        let mut batch = ring.batch_read();
        let mut n = 0;
        while batch.next().is_some() {
            n += 1;
        }
        ring.return_batch_read_chunks(batch);
        assert_eq!(n, 4);
    }

    #[test]
    fn test_wiped_head_reports_not_inited() {
        let ring = ring_with_blocks(16);
        assert!(ring.is_inited());

        // Wipe the ready marker underneath the ring, as a damaged mapping
        // would: allocation must refuse instead of trusting the cursors.
        unsafe {
            (*ring.head)
                .state
                .store(layout::HEAD_STATE_UNINIT, Ordering::Relaxed);
        }
        assert!(!ring.is_inited());
        assert!(matches!(
            ring.alloc_write_chunk(8),
            Err(AllocError::NotInited)
        ));

        // Restoring the marker restores service.
        unsafe {
            (*ring.head).state.store(HEAD_STATE_READY, Ordering::Relaxed);
        }
        let chunk = ring.alloc_write_chunk(8).unwrap();
        chunk.commit();
    }

    #[test]
    fn test_cursor_wrap_many_laps() {
        let ring = ring_with_blocks(8);
        // Push far more data than the capacity so cursors lap many times.
        for i in 0..10_000u32 {
            let mut chunk = ring.alloc_write_chunk(4).unwrap();
            chunk.fill(&i.to_le_bytes());
            chunk.commit();
            let read = ring.read_chunk().unwrap();
            assert_eq!(read.data(), i.to_le_bytes());
            ring.return_read_chunk(read);
        }
        assert_eq!(ring.free_blocks(), 8);
    }
}
