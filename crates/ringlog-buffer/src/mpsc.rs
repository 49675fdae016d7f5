//! Many-producer single-consumer ring buffer.
//!
//! Built on fixed-size cache-line blocks with a per-chunk atomic status
//! word, so producers can commit out of order while the single reader
//! consumes strictly in block order.
//!
//! # Reservation & commit protocol
//!
//! 1. A producer computes the block span and CAS-advances the live
//!    `writing_cursor` to reserve it. Monotonic `u32` sequence values make
//!    the CAS ABA-safe.
//! 2. It immediately stores the chunk's header word (`block_num` + status
//!    `unused`) so the span can be walked, writes `data_size` and the
//!    payload, then release-stores the word again with status `used`.
//! 3. The reader scans forward from `reading_cursor`, acquire-loading each
//!    header word: `unused` stops the scan (a producer is still writing),
//!    `invalid` skips `block_num` blocks, `used` delivers the chunk.
//! 4. On return the reader clears the header word back to zero before
//!    release-storing the new `reading_cursor`. The clear is what makes
//!    lapped blocks read as `unused` instead of replaying a stale `used`
//!    word from the previous lap.
//!
//! A chunk that would straddle the wrap boundary is preceded by a padding
//! chunk (`invalid`, `data_size = 0`, spanning the remaining tail blocks),
//! after which the producer retries from block 0. An allocation abandoned
//! before commit is published as `invalid` too, since a CAS-reserved span
//! cannot be handed back.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::backoff::Backoff;
use crate::cursor;
use crate::error::{AllocError, ReadError, RecoveryError, RecoveryOutcome, SetupError};
use crate::invariants::{debug_assert_chunk_geometry, debug_assert_cursor_window};
use crate::layout::{
    self, BufferHead, BUFFER_HEAD_SIZE, CACHE_LINE_SIZE, HEAD_STATE_READY, MAGIC,
    MPSC_BLOCK_SIZE, MPSC_CHUNK_HEADER_SIZE, MPSC_MAX_BLOCK_NUM, STATUS_INVALID, STATUS_UNUSED,
    STATUS_USED,
};
use crate::region::Region;

/// Blocks spanned by a data chunk of `size` payload bytes.
#[inline]
pub fn blocks_needed(size: u32) -> u32 {
    (MPSC_CHUNK_HEADER_SIZE as u32 + size + (MPSC_BLOCK_SIZE as u32 - 1)) / MPSC_BLOCK_SIZE as u32
}

/// Many-producer single-consumer ring buffer over a borrowed region.
pub struct MpscRing {
    _region: Arc<Region>,
    head: *mut BufferHead,
    blocks: *mut u8,
    count: u32,
    outcome: RecoveryOutcome,
    #[cfg(debug_assertions)]
    read_thread: std::sync::atomic::AtomicU64,
}

// Safety: producers synchronize among themselves through the CAS on the
// writing cursor and with the reader through the per-chunk status words;
// the single reader owns the reading cursor and shadows.
unsafe impl Send for MpscRing {}
unsafe impl Sync for MpscRing {}

/// A reserved, not yet committed MPSC chunk.
///
/// Dropping without [`commit`](MpscWriteChunk::commit) publishes the span
/// as `invalid` so the reader skips it; a CAS-reserved span cannot be
/// un-reserved.
pub struct MpscWriteChunk<'a> {
    ring: &'a MpscRing,
    start: u32,
    block_num: u32,
    len: u32,
    was_empty: bool,
}

impl<'a> MpscWriteChunk<'a> {
    /// The payload region, exactly the requested size.
    #[inline]
    pub fn data(&mut self) -> &mut [u8] {
        // SAFETY: the span was CAS-reserved by this producer and is not
        // readable until the status word flips to `used`.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ring.data_ptr(self.start).cast_mut(),
                self.len as usize,
            )
        }
    }

    /// Copies `bytes` into the chunk (must match the allocated size).
    #[inline]
    pub fn fill(&mut self, bytes: &[u8]) {
        self.data().copy_from_slice(bytes);
    }

    /// Publishes the chunk with a `unused → used` release store.
    ///
    /// Returns `true` if the buffer looked empty at reservation time.
    pub fn commit(self) -> bool {
        let was_empty = self.was_empty;
        self.ring.status_word(self.start).store(
            layout::pack_status_word(STATUS_USED, self.block_num),
            Ordering::Release,
        );
        std::mem::forget(self);
        was_empty
    }
}

impl Drop for MpscWriteChunk<'_> {
    fn drop(&mut self) {
        // Abandoned reservation: the reader must skip it.
        self.ring.status_word(self.start).store(
            layout::pack_status_word(STATUS_INVALID, self.block_num),
            Ordering::Release,
        );
    }
}

/// A chunk handed out by [`MpscRing::read_chunk`].
pub struct MpscReadChunk<'a> {
    data: *const u8,
    len: u32,
    pub(crate) start: u32,
    pub(crate) end: u32,
    _marker: std::marker::PhantomData<&'a MpscRing>,
}

impl<'a> MpscReadChunk<'a> {
    /// The chunk payload.
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        // SAFETY: the span stays reserved until the chunk is returned.
        unsafe { std::slice::from_raw_parts(self.data, self.len as usize) }
    }
}

impl MpscRing {
    /// Places a ring over `len` bytes of `region` starting at `offset`.
    ///
    /// See [`crate::SpscRing::new`] for the recovery contract; the MPSC
    /// variant additionally repairs chunks a producer never finished by
    /// flipping them to `invalid` instead of rejecting the whole region.
    pub fn new(
        region: Arc<Region>,
        offset: usize,
        len: usize,
        try_recover: bool,
    ) -> Result<Self, SetupError> {
        assert!(offset % layout::CACHE_LINE_SIZE == 0, "unaligned buffer offset");
        assert!(offset + len <= region.len(), "buffer exceeds region");
        let Some(count) = layout::blocks_in_region(len, MPSC_BLOCK_SIZE) else {
            return Err(SetupError::RegionTooSmall {
                needed: layout::min_region_size(1, MPSC_BLOCK_SIZE),
                got: len,
            });
        };
        // Keep every possible span (including a full-buffer pad) encodable
        // in the 24-bit block_num field.
        let count = count.min((MPSC_MAX_BLOCK_NUM + 1) >> 1);

        // SAFETY: offset is in bounds and cache-line aligned.
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
            read_thread: std::sync::atomic::AtomicU64::new(0),
        };

        let outcome = if try_recover {
            match ring.try_recover() {
                Ok(()) => RecoveryOutcome::Recovered,
                Err(reason) => {
                    crate::device_warn(&format!(
                        "mpsc buffer recovery rejected ({reason}); starting fresh"
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
        layout::min_region_size(expected_bytes, MPSC_BLOCK_SIZE)
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

    /// Largest payload a single chunk can carry in this buffer.
    #[inline]
    pub fn max_chunk_size(&self) -> u32 {
        self.count * MPSC_BLOCK_SIZE as u32 - MPSC_CHUNK_HEADER_SIZE as u32
    }

    /// Free blocks currently available (racy snapshot).
    pub fn free_blocks(&self) -> u32 {
        // SAFETY: head is valid for the ring's lifetime.
        let (w, r) = unsafe {
            (
                (*self.head).writing_cursor.load(Ordering::Relaxed),
                (*self.head).reading_cursor.load(Ordering::Relaxed),
            )
        };
        self.count - cursor::distance(w, r)
    }

    /// `true` once the head finished initialization; see
    /// [`crate::SpscRing::is_inited`].
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

    // ---------------------------------------------------------------------
    // PRODUCER API (any number of threads)
    // ---------------------------------------------------------------------

    /// Reserves a chunk of exactly `size` payload bytes.
    pub fn alloc_write_chunk(&self, size: u32) -> Result<MpscWriteChunk<'_>, AllocError> {
        if !self.is_inited() {
            return Err(AllocError::NotInited);
        }
        if size == 0 || size > self.max_chunk_size() {
            return Err(AllocError::SizeInvalid);
        }
        let needed = blocks_needed(size);

        let mut backoff = Backoff::new();
        loop {
            // SAFETY: head is valid for the ring's lifetime.
            let head = unsafe { &*self.head };
            let w = head.writing_cursor.load(Ordering::Relaxed);
            let r = head.reading_cursor.load(Ordering::Acquire);
            let to_wrap = cursor::blocks_to_wrap(w, self.count);
            let straddles = needed > to_wrap;
            let required = if straddles { to_wrap + needed } else { needed };
            if cursor::free_blocks(self.count, w, r) < required {
                return Err(AllocError::NotEnoughSpace);
            }

            if straddles {
                // Reserve the tail and stamp a padding chunk, then retry
                // the allocation from block 0.
                match head.writing_cursor.compare_exchange_weak(
                    w,
                    w.wrapping_add(to_wrap),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.status_word(w).store(
                            layout::pack_status_word(STATUS_INVALID, to_wrap),
                            Ordering::Release,
                        );
                        self.write_data_size(w, 0);
                    }
                    Err(_) => backoff.snooze(),
                }
                continue;
            }

            if head
                .writing_cursor
                .compare_exchange_weak(
                    w,
                    w.wrapping_add(needed),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                debug_assert_cursor_window!(w.wrapping_add(needed), r, self.count);
                // Make the span walkable before the payload lands; the
                // reader treats `unused` as "still being written".
                self.status_word(w).store(
                    layout::pack_status_word(STATUS_UNUSED, needed),
                    Ordering::Relaxed,
                );
                self.write_data_size(w, size);
                return Ok(MpscWriteChunk {
                    ring: self,
                    start: w,
                    block_num: needed,
                    len: size,
                    was_empty: w == r,
                });
            }
            backoff.snooze();
        }
    }

    // ---------------------------------------------------------------------
    // CONSUMER API (single thread)
    // ---------------------------------------------------------------------

    /// Returns the oldest committed chunk, skipping `invalid` spans.
    ///
    /// Stops (reports empty) at the first `unused` chunk even when later
    /// producers have already committed: the reader never crosses a chunk
    /// that is still being written.
    pub fn read_chunk(&self) -> Result<MpscReadChunk<'_>, ReadError> {
        #[cfg(debug_assertions)]
        self.debug_check_read_thread();

        let mut r = self.rt_reading();
        loop {
            let mut w = self.rt_writing();
            if cursor::distance(w, r) == 0 {
                // SAFETY: head is valid; Acquire pairs with producers' CAS.
                w = unsafe { (*self.head).writing_cursor.load(Ordering::Acquire) };
                self.set_rt_writing(w);
                if cursor::distance(w, r) == 0 {
                    return Err(ReadError::Empty);
                }
            }

            let word = self.status_word(r).load(Ordering::Acquire);
            let (status, block_num) = layout::unpack_status_word(word);
            match status {
                STATUS_USED => {
                    let size = self.read_data_size(r);
                    debug_assert_chunk_geometry!(
                        block_num,
                        size,
                        MPSC_BLOCK_SIZE,
                        MPSC_CHUNK_HEADER_SIZE
                    );
                    debug_assert!(block_num <= cursor::distance(w, r));
                    return Ok(MpscReadChunk {
                        data: self.data_ptr(r),
                        len: size,
                        start: r,
                        end: r.wrapping_add(block_num),
                        _marker: std::marker::PhantomData,
                    });
                }
                STATUS_INVALID => {
                    if block_num == 0 || block_num > cursor::distance(w, r) {
                        // Corrupt span; nothing safe to skip.
                        debug_assert!(false, "invalid chunk with bad span {block_num}");
                        return Err(ReadError::Empty);
                    }
                    self.clear_status_word(r);
                    r = r.wrapping_add(block_num);
                    self.set_rt_reading(r);
                    // SAFETY: head is valid; releases the skipped blocks.
                    unsafe { (*self.head).reading_cursor.store(r, Ordering::Release) };
                }
                _ => return Err(ReadError::Empty), // unused: producer still writing
            }
        }
    }

    /// Diagnostic hook: reports empty without touching any cursor.
    pub fn read_an_empty_chunk(&self) -> Result<MpscReadChunk<'_>, ReadError> {
        Err(ReadError::Empty)
    }

    /// Marks a read chunk consumed, releasing its blocks to producers.
    pub fn return_read_chunk(&self, chunk: MpscReadChunk<'_>) {
        // Clear first so a lapped producer span reads as unused, then
        // release the blocks.
        self.clear_status_word(chunk.start);
        self.set_rt_reading(chunk.end);
        // SAFETY: head is valid; Release pairs with producers' Acquire.
        unsafe { (*self.head).reading_cursor.store(chunk.end, Ordering::Release) };
    }

    /// Drops a read chunk without consuming it.
    pub fn discard_read_chunk(&self, chunk: MpscReadChunk<'_>) {
        drop(chunk);
    }

    /// Walks all committed chunks without consuming, stopping at the first
    /// in-flight one.
    pub fn data_traverse(&self, mut callback: impl FnMut(&[u8])) {
        let r = self.rt_reading();
        // SAFETY: head is valid.
        let w = unsafe { (*self.head).writing_cursor.load(Ordering::Acquire) };
        let mut pos = r;
        while pos != w {
            let word = self.status_word(pos).load(Ordering::Acquire);
            let (status, block_num) = layout::unpack_status_word(word);
            match status {
                STATUS_USED => {
                    let size = self.read_data_size(pos);
                    // SAFETY: published by the Release store that set `used`.
                    callback(unsafe {
                        std::slice::from_raw_parts(self.data_ptr(pos), size as usize)
                    });
                    pos = pos.wrapping_add(block_num);
                }
                STATUS_INVALID if block_num > 0 && block_num <= cursor::distance(w, pos) => {
                    pos = pos.wrapping_add(block_num);
                }
                _ => break,
            }
        }
    }

    // ---------------------------------------------------------------------
    // INITIALIZATION & RECOVERY
    // ---------------------------------------------------------------------

    fn init_fresh(&self) {
        // SAFETY: the region belongs to this ring alone during setup; the
        // block array must start zeroed so every status word reads unused.
        unsafe {
            std::ptr::write_bytes(self.head.cast::<u8>(), 0, BUFFER_HEAD_SIZE);
            std::ptr::write_bytes(self.blocks, 0, self.count as usize * MPSC_BLOCK_SIZE);
            let head = &mut *self.head;
            head.magic = MAGIC;
            head.aligned_blocks_count = self.count;
            head.checksum = layout::head_checksum(&MAGIC, self.count);
            // Ready marker goes last; see the SPSC counterpart.
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

        // Repair scan: chunks a dead producer never committed become
        // invalid so the new reader skips exactly their span. A span that
        // cannot be walked (zero or overrunning block_num) invalidates the
        // remainder of the window wholesale.
        let mut pos = r;
        while pos != w {
            let remaining = cursor::distance(w, pos);
            let word = self.status_word(pos).load(Ordering::Relaxed);
            let (status, block_num) = layout::unpack_status_word(word);
            if block_num == 0 || block_num > remaining {
                self.status_word(pos).store(
                    layout::pack_status_word(STATUS_INVALID, remaining),
                    Ordering::Relaxed,
                );
                self.write_data_size(pos, 0);
                break;
            }
            if status == STATUS_UNUSED {
                self.status_word(pos).store(
                    layout::pack_status_word(STATUS_INVALID, block_num),
                    Ordering::Relaxed,
                );
            } else if status == STATUS_USED
                && self.read_data_size(pos) as usize
                    > block_num as usize * MPSC_BLOCK_SIZE - MPSC_CHUNK_HEADER_SIZE
            {
                self.status_word(pos).store(
                    layout::pack_status_word(STATUS_INVALID, block_num),
                    Ordering::Relaxed,
                );
            }
            pos = pos.wrapping_add(block_num);
        }

        self.set_rt_reading(r);
        self.set_rt_writing(w);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // RAW ACCESS HELPERS
    // ---------------------------------------------------------------------

    #[inline]
    fn block_ptr(&self, cursor_value: u32) -> *mut u8 {
        let idx = cursor::index(cursor_value, self.count) as usize;
        // SAFETY: idx < count keeps the offset inside the block array.
        unsafe { self.blocks.add(idx * MPSC_BLOCK_SIZE) }
    }

    #[inline]
    fn status_word(&self, cursor_value: u32) -> &AtomicU32 {
        // SAFETY: block starts are cache-line aligned, so the atomic view
        // of the first word is aligned and valid for the ring's lifetime.
        unsafe { &*self.block_ptr(cursor_value).cast::<AtomicU32>() }
    }

    #[inline]
    fn clear_status_word(&self, cursor_value: u32) {
        self.status_word(cursor_value).store(0, Ordering::Relaxed);
    }

    #[inline]
    fn data_ptr(&self, cursor_value: u32) -> *const u8 {
        // SAFETY: payload begins after the 8-byte header inside the span.
        unsafe { self.block_ptr(cursor_value).add(MPSC_CHUNK_HEADER_SIZE) }
    }

    #[inline]
    fn write_data_size(&self, cursor_value: u32, size: u32) {
        // SAFETY: aligned u32 store at block offset 4, inside the span the
        // caller owns.
        unsafe {
            self.block_ptr(cursor_value)
                .add(4)
                .cast::<u32>()
                .write(size.to_le());
        }
    }

    #[inline]
    fn read_data_size(&self, cursor_value: u32) -> u32 {
        // SAFETY: aligned u32 load at block offset 4; ordered by the
        // status-word Acquire.
        u32::from_le(unsafe { self.block_ptr(cursor_value).add(4).cast::<u32>().read() })
    }

    #[inline]
    fn rt_reading(&self) -> u32 {
        // SAFETY: reader-owned cell.
        unsafe { *(*self.head).rt.reading.get() }
    }

    #[inline]
    fn set_rt_reading(&self, v: u32) {
        // SAFETY: reader-owned cell.
        unsafe { *(*self.head).rt.reading.get() = v }
    }

    #[inline]
    fn rt_writing(&self) -> u32 {
        // SAFETY: reader-owned cell.
        unsafe { *(*self.head).rt.writing.get() }
    }

    #[inline]
    fn set_rt_writing(&self, v: u32) {
        // SAFETY: reader-owned cell.
        unsafe { *(*self.head).rt.writing.get() = v }
    }

    #[cfg(debug_assertions)]
    fn debug_check_read_thread(&self) {
        let me = crate::thread_tag();
        let seen = self
            .read_thread
            .compare_exchange(0, me, Ordering::Relaxed, Ordering::Relaxed)
            .unwrap_or_else(|current| current);
        debug_assert!(
            seen == 0 || seen == me,
            "mpsc reader used from two threads: {seen} and {me}"
        );
    }
}
