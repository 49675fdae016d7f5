//! Persisted buffer layouts.
//!
//! Every buffer region (heap or memory-mapped) starts with a [`BufferHead`]
//! followed by the block array. The head layout is bit-exact and
//! little-endian so that a region written by one process run can be adopted
//! by the next. All structures here are `#[repr(C)]` with explicit padding;
//! no field is ever accessed through an unaligned cast.
//!
//! Region layout:
//!
//! ```text
//! +--------------------+ 0
//! | BufferHead         |   6 cache lines
//! +--------------------+ HEAD_SIZE
//! | block array        |   power-of-two blocks, block-size aligned
//! +--------------------+
//! ```
//!
//! A group file concatenates one [`GroupHead`], N node regions (node head +
//! SPSC buffer region) and one shared MPSC region, each cache-line aligned.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU8};

/// Cache line granule. Blocks of the MPSC buffer and every persisted head
/// are aligned to this.
pub const CACHE_LINE_SIZE: usize = 64;

/// SPSC alignment quantum.
pub const SPSC_BLOCK_SIZE: usize = 8;
/// SPSC chunk header: one little-endian `u32` payload size. The payload
/// begins 4 bytes into the first block.
pub const SPSC_CHUNK_HEADER_SIZE: usize = 4;

/// MPSC alignment quantum (one cache line).
pub const MPSC_BLOCK_SIZE: usize = CACHE_LINE_SIZE;
/// MPSC chunk header: one atomic status word (`block_num` low 24 bits,
/// status high 8 bits) plus a `u32` payload size.
pub const MPSC_CHUNK_HEADER_SIZE: usize = 8;
/// Largest block span a single MPSC chunk can describe (24-bit field).
pub const MPSC_MAX_BLOCK_NUM: u32 = 0x00FF_FFFF;

/// Magic stamped at offset 0 of every persisted head.
pub const MAGIC: [u8; 8] = *b"BQRBv3\0\0";

/// Smallest block count either ring accepts.
pub const MIN_BLOCK_COUNT: u32 = 4;

/// MPSC chunk status: no committed data begins at this block.
pub const STATUS_UNUSED: u32 = 0;
/// MPSC chunk status: chunk is committed and readable.
pub const STATUS_USED: u32 = 1;
/// MPSC chunk status: padding or abandoned span, skip `block_num` blocks.
pub const STATUS_INVALID: u32 = 2;

/// Head state marker: construction has not completed (or the head was
/// wiped underneath the buffer). Allocation refuses to run on such a head.
pub const HEAD_STATE_UNINIT: u8 = 0;
/// Head state marker: the head is fully initialized and usable.
pub const HEAD_STATE_READY: u8 = 1;

/// Packs an MPSC header word from a status and a block span.
#[inline]
pub fn pack_status_word(status: u32, block_num: u32) -> u32 {
    debug_assert!(block_num <= MPSC_MAX_BLOCK_NUM);
    (status << 24) | block_num
}

/// Splits an MPSC header word into `(status, block_num)`.
#[inline]
pub fn unpack_status_word(word: u32) -> (u32, u32) {
    (word >> 24, word & MPSC_MAX_BLOCK_NUM)
}

/// A pair of thread-private cursor shadows on one cache line.
///
/// `reading`/`writing` cache the last observed value of the corresponding
/// live cursor so the hot path avoids cross-core atomic traffic. Exactly
/// one thread reads and writes each shadow pair; that discipline is what
/// makes the plain (non-atomic) cells sound.
#[repr(C)]
pub struct CursorShadows {
    pub reading: UnsafeCell<u32>,
    pub writing: UnsafeCell<u32>,
    _pad: [u8; CACHE_LINE_SIZE - 8],
}

/// Persisted head of a single ring buffer region. Six cache lines:
///
/// | line | contents                                         |
/// |------|--------------------------------------------------|
/// | 0    | magic, `aligned_blocks_count`, state, checksum   |
/// | 1    | reader-side shadows (`rt`)                       |
/// | 2    | writer-side shadows (`wt`)                       |
/// | 3    | live `reading_cursor`                            |
/// | 4    | live `writing_cursor`                            |
/// | 5    | misc area stamped by the owning group            |
///
/// The checksum covers line 0's identity fields (magic and block count) and
/// is a crc32 value carried in a 64-bit little-endian slot.
#[repr(C, align(64))]
pub struct BufferHead {
    // line 0
    pub magic: [u8; 8],
    pub aligned_blocks_count: u32,
    /// [`HEAD_STATE_READY`] once construction completed; stored last so a
    /// crash mid-initialization leaves the head visibly unusable.
    pub state: AtomicU8,
    _pad_state: [u8; 3],
    pub checksum: u64,
    _pad0: [u8; CACHE_LINE_SIZE - 24],
    // line 1
    pub rt: CursorShadows,
    // line 2
    pub wt: CursorShadows,
    // line 3
    pub reading_cursor: AtomicU32,
    _pad3: [u8; CACHE_LINE_SIZE - 4],
    // line 4
    pub writing_cursor: AtomicU32,
    _pad4: [u8; CACHE_LINE_SIZE - 4],
    // line 5
    pub misc: UnsafeCell<[u8; CACHE_LINE_SIZE]>,
}

/// Size of [`BufferHead`] in bytes.
pub const BUFFER_HEAD_SIZE: usize = 6 * CACHE_LINE_SIZE;

/// Byte offset of the misc line inside a [`BufferHead`].
pub const BUFFER_MISC_OFFSET: usize = 5 * CACHE_LINE_SIZE;

const _: () = assert!(std::mem::size_of::<BufferHead>() == BUFFER_HEAD_SIZE);
const _: () = assert!(std::mem::size_of::<CursorShadows>() == CACHE_LINE_SIZE);
const _: () = assert!(std::mem::align_of::<BufferHead>() == CACHE_LINE_SIZE);

/// Checksum over a head's identity fields.
pub fn head_checksum(magic: &[u8; 8], aligned_blocks_count: u32) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(magic);
    hasher.update(&aligned_blocks_count.to_le_bytes());
    u64::from(hasher.finalize())
}

/// Persisted head of a group file. Two cache lines; the second is reserved.
#[repr(C, align(64))]
pub struct GroupHead {
    pub magic: [u8; 8],
    pub node_count: u16,
    _pad: [u8; 6],
    pub node_region_size: u64,
    pub shared_region_size: u64,
    pub checksum: u64,
    _pad0: [u8; CACHE_LINE_SIZE - 40],
    _reserved: [u8; CACHE_LINE_SIZE],
}

/// Size of [`GroupHead`] in bytes.
pub const GROUP_HEAD_SIZE: usize = 2 * CACHE_LINE_SIZE;

const _: () = assert!(std::mem::size_of::<GroupHead>() == GROUP_HEAD_SIZE);

/// Which buffer of a group a stamped head belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferRole {
    Node = 0,
    Shared = 1,
}

impl BufferRole {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Node),
            1 => Some(Self::Shared),
            _ => None,
        }
    }
}

/// Per-buffer identity a group stamps into its buffers' head misc areas.
///
/// Recovery cross-checks every stamp against the buffer's position and the
/// group's layout checksum, so a file whose sub-regions were shuffled,
/// truncated, or swapped in from another group is rejected as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStamp {
    pub role: BufferRole,
    /// Node index, or [`crate::NIL_INDEX`] for the shared buffer.
    pub node_index: u16,
    /// The owning group's layout checksum (same value as the group head).
    pub layout_checksum: u64,
}

/// Encoded size of a [`BufferStamp`] inside the misc line.
pub const BUFFER_STAMP_SIZE: usize = 16;

impl BufferStamp {
    pub fn encode(&self) -> [u8; BUFFER_STAMP_SIZE] {
        let mut bytes = [0u8; BUFFER_STAMP_SIZE];
        bytes[0] = self.role as u8;
        bytes[2..4].copy_from_slice(&self.node_index.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.layout_checksum.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < BUFFER_STAMP_SIZE {
            return None;
        }
        Some(Self {
            role: BufferRole::from_u8(bytes[0])?,
            node_index: u16::from_le_bytes(bytes[2..4].try_into().ok()?),
            layout_checksum: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
        })
    }
}

/// Checksum over a group head's layout fields.
pub fn group_checksum(node_count: u16, node_region_size: u64, shared_region_size: u64) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&MAGIC);
    hasher.update(&node_count.to_le_bytes());
    hasher.update(&node_region_size.to_le_bytes());
    hasher.update(&shared_region_size.to_le_bytes());
    u64::from(hasher.finalize())
}

/// Power-of-two block count guaranteeing at least `expected_bytes` of block
/// storage with blocks of `block_size` bytes.
pub fn blocks_for(expected_bytes: u32, block_size: usize) -> u32 {
    let blocks = (expected_bytes as usize).div_ceil(block_size) as u32;
    blocks.next_power_of_two().max(MIN_BLOCK_COUNT)
}

/// Largest power-of-two block count whose array fits in `region_len` bytes
/// after the head. Returns `None` if the region cannot hold the minimum.
pub fn blocks_in_region(region_len: usize, block_size: usize) -> Option<u32> {
    let usable = region_len.checked_sub(BUFFER_HEAD_SIZE)?;
    let blocks = (usable / block_size) as u32;
    if blocks < MIN_BLOCK_COUNT {
        return None;
    }
    // previous power of two
    let count = if blocks.is_power_of_two() {
        blocks
    } else {
        blocks.next_power_of_two() >> 1
    };
    Some(count)
}

/// Smallest region size whose derived block count covers `expected_bytes`.
pub fn min_region_size(expected_bytes: u32, block_size: usize) -> usize {
    BUFFER_HEAD_SIZE + blocks_for(expected_bytes, block_size) as usize * block_size
}
