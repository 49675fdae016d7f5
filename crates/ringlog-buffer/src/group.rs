//! Per-log buffer group.
//!
//! A group composes N single-producer buffers (one per producer thread,
//! each embedded in a block node) with one shared MPSC fallback buffer,
//! all carved out of a single region that can be backed by a memory-mapped
//! file for crash recovery.
//!
//! Region layout:
//!
//! ```text
//! +-------------------+ 0
//! | GroupHead         |  layout stamp + checksum
//! +-------------------+ GROUP_HEAD_SIZE
//! | node 0: NodeHead  |  64 bytes
//! |         SPSC      |  BufferHead + blocks
//! +-------------------+ GROUP_HEAD_SIZE + stride
//! | node 1 ...        |
//! +-------------------+ GROUP_HEAD_SIZE + node_count * stride
//! | shared MPSC       |  BufferHead + blocks
//! +-------------------+
//! ```
//!
//! # Assignment policy
//!
//! A producer thread's first write pops a node from the `free` list,
//! records its thread tag in the node head and links the node into
//! `in_use`; a thread-local registry caches the assignment so later writes
//! reuse the same buffer without touching the lists. When `free` is empty
//! the producer falls back to the shared MPSC buffer.
//!
//! When a producer thread exits, its registry guard flags every owned node
//! for recycling. The consumer sweep (run by the log's drain loop) moves
//! flagged nodes from `in_use` to `recycle`, keeps draining them there,
//! and once empty clears their ownership and returns them to `free`.

use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::block_list::{BlockList, NodeHead, NodeType, NIL_INDEX};
use crate::error::{AllocError, RecoveryError, RecoveryOutcome, SetupError};
use crate::layout::{
    self, BufferRole, BufferStamp, BUFFER_MISC_OFFSET, BUFFER_STAMP_SIZE, CACHE_LINE_SIZE,
    GROUP_HEAD_SIZE, GroupHead, MAGIC,
};
use crate::mmap::MapFile;
use crate::mpsc::{MpscRing, MpscWriteChunk};
use crate::region::Region;
use crate::spsc::{SpscRing, WriteChunk};

/// Geometry and backing of a buffer group.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// How many per-thread SPSC node buffers to create.
    pub node_count: u16,
    /// Desired payload bytes per node buffer (rounded up to a power-of-two
    /// block count).
    pub node_buffer_size: u32,
    /// Desired payload bytes for the shared MPSC fallback buffer.
    pub shared_buffer_size: u32,
    /// Backing file for crash recovery; `None` keeps the group in memory.
    pub map_path: Option<PathBuf>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            node_count: 8,
            node_buffer_size: 64 * 1024,
            shared_buffer_size: 64 * 1024,
            map_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GroupLayout {
    spsc_len: usize,
    stride: usize,
    mpsc_len: usize,
    total: usize,
}

impl GroupLayout {
    fn compute(config: &GroupConfig) -> Self {
        let spsc_len = SpscRing::min_region_size(config.node_buffer_size);
        let stride = (CACHE_LINE_SIZE + spsc_len).div_ceil(CACHE_LINE_SIZE) * CACHE_LINE_SIZE;
        let mpsc_len = MpscRing::min_region_size(config.shared_buffer_size);
        let total = GROUP_HEAD_SIZE + usize::from(config.node_count) * stride + mpsc_len;
        Self {
            spsc_len,
            stride,
            mpsc_len,
            total,
        }
    }
}

static NEXT_GROUP_TAG: AtomicU64 = AtomicU64::new(1);

pub(crate) struct GroupInner {
    region: Arc<Region>,
    map_backed: bool,
    group_tag: u64,
    node_count: u16,
    rings: Vec<SpscRing>,
    shared: MpscRing,
    free: BlockList,
    in_use: BlockList,
    recycle: BlockList,
    outcome: RecoveryOutcome,
}

// Safety: all cross-thread state in the group funnels through the block
// lists and the ring buffers' own protocols.
unsafe impl Send for GroupInner {}
unsafe impl Sync for GroupInner {}

/// The container owning one log's buffers, lists and recovery file.
#[derive(Clone)]
pub struct BufferGroup {
    inner: Arc<GroupInner>,
}

/// A write chunk from either a private node buffer or the shared fallback.
pub enum GroupWriteChunk<'a> {
    Private(WriteChunk<'a>),
    Shared(MpscWriteChunk<'a>),
}

impl<'a> GroupWriteChunk<'a> {
    /// The payload region.
    #[inline]
    pub fn data(&mut self) -> &mut [u8] {
        match self {
            Self::Private(chunk) => chunk.data(),
            Self::Shared(chunk) => chunk.data(),
        }
    }

    /// Copies `bytes` into the chunk (must match the allocated size).
    #[inline]
    pub fn fill(&mut self, bytes: &[u8]) {
        self.data().copy_from_slice(bytes);
    }

    /// Publishes the chunk. Returns `true` if the target buffer looked
    /// empty right before, i.e. the consumer may be worth waking.
    pub fn commit(self) -> bool {
        match self {
            Self::Private(chunk) => chunk.commit(),
            Self::Shared(chunk) => chunk.commit(),
        }
    }
}

// Thread-local registry of node assignments. The drop guard runs at thread
// exit and flags every node the thread still owns, handing them to the
// consumer sweep for recycling.

#[derive(Default)]
struct ThreadNodeRegistry {
    entries: Vec<ThreadNodeEntry>,
}

struct ThreadNodeEntry {
    group_tag: u64,
    group: Weak<GroupInner>,
    node: u16,
}

impl Drop for ThreadNodeRegistry {
    fn drop(&mut self) {
        for entry in self.entries.drain(..) {
            if let Some(group) = entry.group.upgrade() {
                group.node_head(entry.node).request_recycle();
            }
        }
    }
}

thread_local! {
    static THREAD_NODES: RefCell<ThreadNodeRegistry> = RefCell::new(ThreadNodeRegistry::default());
}

impl BufferGroup {
    /// Creates the group, recovering from `map_path` when the file already
    /// holds a matching layout.
    pub fn create(config: &GroupConfig) -> Result<Self, SetupError> {
        let node_count = config.node_count;
        if usize::from(node_count) >= usize::from(crate::block_list::NIL_INDEX) {
            return Err(SetupError::TooManyNodes {
                max: usize::from(crate::block_list::NIL_INDEX) - 1,
            });
        }
        let geometry = GroupLayout::compute(config);

        let (region, preexisting, map_backed) = match &config.map_path {
            Some(path) => {
                let map = MapFile::open(path, geometry.total)?;
                let mapped = map.region.is_mapped();
                (Arc::new(map.region), map.preexisting && mapped, mapped)
            }
            None => (Arc::new(Region::heap(geometry.total)), false, false),
        };

        // SAFETY: the region starts cache-line aligned and is at least
        // geometry.total bytes.
        let group_head = region.as_ptr().cast::<GroupHead>();

        let layout_checksum =
            layout::group_checksum(node_count, geometry.stride as u64, geometry.mpsc_len as u64);
        let head_matches =
            preexisting && Self::group_head_matches(group_head, node_count, &geometry);
        // The layout stamp alone does not prove the sub-regions are the
        // ones this layout describes; every buffer's own stamp must agree
        // with its position too.
        let stamps_match = head_matches
            && Self::stamps_match(region.as_ptr(), node_count, &geometry, layout_checksum);
        let recovering = head_matches && stamps_match;
        let outcome = if preexisting && !head_matches {
            crate::device_warn("buffer group layout changed; discarding previous recovery file");
            RecoveryOutcome::Rejected(RecoveryError::LayoutMismatch)
        } else if head_matches && !stamps_match {
            crate::device_warn(
                "buffer group stamps inconsistent with layout; discarding previous recovery file",
            );
            RecoveryOutcome::Rejected(RecoveryError::StampMismatch)
        } else if recovering {
            RecoveryOutcome::Recovered
        } else {
            RecoveryOutcome::Fresh
        };
        if !recovering {
            Self::stamp_group_head(group_head, node_count, &geometry);
        }

        // Sub-buffers. Each recovers individually; a rejected node buffer
        // comes up fresh without affecting its siblings.
        let mut rings = Vec::with_capacity(usize::from(node_count));
        for i in 0..usize::from(node_count) {
            let offset = GROUP_HEAD_SIZE + i * geometry.stride + CACHE_LINE_SIZE;
            rings.push(SpscRing::new(
                Arc::clone(&region),
                offset,
                geometry.spsc_len,
                recovering,
            )?);
        }
        let shared_offset = GROUP_HEAD_SIZE + usize::from(node_count) * geometry.stride;
        let shared = MpscRing::new(
            Arc::clone(&region),
            shared_offset,
            geometry.mpsc_len,
            recovering,
        )?;

        // Stamp every buffer's identity into its head misc area. Done
        // unconditionally: it re-establishes the stamp of any sub-buffer
        // that came up fresh (including after an individual recovery
        // rejection), and rewrites identical bytes otherwise.
        for (i, ring) in rings.iter().enumerate() {
            let stamp = BufferStamp {
                role: BufferRole::Node,
                node_index: i as u16,
                layout_checksum,
            };
            ring.write_misc(&stamp.encode());
        }
        shared.write_misc(
            &BufferStamp {
                role: BufferRole::Shared,
                node_index: NIL_INDEX,
                layout_checksum,
            }
            .encode(),
        );

        // SAFETY: node heads start at GROUP_HEAD_SIZE, one per stride.
        let nodes_base = unsafe { region.as_ptr().add(GROUP_HEAD_SIZE) };
        let free = BlockList::new(NodeType::Free, nodes_base, geometry.stride, node_count);
        let in_use = BlockList::new(NodeType::InUse, nodes_base, geometry.stride, node_count);
        let recycle = BlockList::new(NodeType::Recycle, nodes_base, geometry.stride, node_count);

        // Rebuild the lists. Runtime links are never trusted across runs;
        // only the persisted node type decides where a node starts out.
        for i in (0..node_count).rev() {
            if recovering {
                let node = free.node(i);
                let prior = node.node_type();
                let drained = rings[usize::from(i)].live_blocks() == 0;
                if prior == Some(NodeType::Free) && drained {
                    node.clear_owner();
                    free.push_front_unsafe(i);
                } else {
                    // Orphaned: the recorded owner thread belongs to the
                    // previous run. Drain first, then reuse.
                    node.request_recycle();
                    recycle.push_front_unsafe(i);
                }
            } else {
                // SAFETY: fresh region, no concurrent access during setup;
                // node heads sit at the start of each stride.
                unsafe {
                    let node_ptr = nodes_base
                        .add(usize::from(i) * geometry.stride)
                        .cast::<NodeHead>();
                    NodeHead::init_fresh(node_ptr);
                }
                free.push_front_unsafe(i);
            }
        }

        Ok(Self {
            inner: Arc::new(GroupInner {
                region,
                map_backed,
                group_tag: NEXT_GROUP_TAG.fetch_add(1, Ordering::Relaxed),
                node_count,
                rings,
                shared,
                free,
                in_use,
                recycle,
                outcome,
            }),
        })
    }

    /// Verifies the per-buffer stamps of a pre-existing region against the
    /// positions this layout would place each buffer at. Raw reads; runs
    /// before any ring is constructed over the region.
    fn stamps_match(
        base: *const u8,
        node_count: u16,
        geometry: &GroupLayout,
        layout_checksum: u64,
    ) -> bool {
        let read_stamp = |offset: usize| -> Option<BufferStamp> {
            // SAFETY: offset stays inside the region (checked geometry).
            let bytes =
                unsafe { std::slice::from_raw_parts(base.add(offset), BUFFER_STAMP_SIZE) };
            BufferStamp::decode(bytes)
        };

        for i in 0..usize::from(node_count) {
            let offset =
                GROUP_HEAD_SIZE + i * geometry.stride + CACHE_LINE_SIZE + BUFFER_MISC_OFFSET;
            let expected = BufferStamp {
                role: BufferRole::Node,
                node_index: i as u16,
                layout_checksum,
            };
            if read_stamp(offset) != Some(expected) {
                return false;
            }
        }

        let shared_offset =
            GROUP_HEAD_SIZE + usize::from(node_count) * geometry.stride + BUFFER_MISC_OFFSET;
        let expected = BufferStamp {
            role: BufferRole::Shared,
            node_index: NIL_INDEX,
            layout_checksum,
        };
        read_stamp(shared_offset) == Some(expected)
    }

    fn group_head_matches(head: *const GroupHead, node_count: u16, geometry: &GroupLayout) -> bool {
        // SAFETY: the head span is exclusively ours during setup.
        let head = unsafe { &*head };
        head.magic == MAGIC
            && head.node_count == node_count
            && head.node_region_size == geometry.stride as u64
            && head.shared_region_size == geometry.mpsc_len as u64
            && head.checksum
                == layout::group_checksum(node_count, geometry.stride as u64, geometry.mpsc_len as u64)
    }

    fn stamp_group_head(head: *mut GroupHead, node_count: u16, geometry: &GroupLayout) {
        // SAFETY: the head span is exclusively ours during setup.
        unsafe {
            std::ptr::write_bytes(head.cast::<u8>(), 0, GROUP_HEAD_SIZE);
            let head = &mut *head;
            head.magic = MAGIC;
            head.node_count = node_count;
            head.node_region_size = geometry.stride as u64;
            head.shared_region_size = geometry.mpsc_len as u64;
            head.checksum = layout::group_checksum(
                node_count,
                geometry.stride as u64,
                geometry.mpsc_len as u64,
            );
        }
    }

    /// How the group came up.
    pub fn recovery_outcome(&self) -> RecoveryOutcome {
        self.inner.outcome
    }

    /// `true` if backed by a memory-mapped recovery file.
    pub fn is_map_backed(&self) -> bool {
        self.inner.map_backed
    }

    /// Number of per-thread node buffers.
    pub fn node_count(&self) -> u16 {
        self.inner.node_count
    }

    /// Nodes currently on the free list (racy, for diagnostics/tests).
    pub fn free_nodes(&self) -> usize {
        self.inner.free.traverse_count()
    }

    /// Nodes currently on the recycle list (racy, for diagnostics/tests).
    pub fn recycle_nodes(&self) -> usize {
        self.inner.recycle.traverse_count()
    }

    /// Largest payload the shared fallback buffer accepts.
    pub fn max_chunk_size(&self) -> u32 {
        self.inner.shared.max_chunk_size()
    }

    // ---------------------------------------------------------------------
    // PRODUCER SIDE
    // ---------------------------------------------------------------------

    /// Reserves a chunk in the calling thread's node buffer, falling back
    /// to the shared MPSC buffer when no node is available or the node
    /// cannot take the chunk.
    pub fn alloc_write_chunk(&self, size: u32) -> Result<GroupWriteChunk<'_>, AllocError> {
        if let Some(node) = self.acquire_thread_node() {
            match self.inner.rings[usize::from(node)].alloc_write_chunk(size) {
                Ok(chunk) => return Ok(GroupWriteChunk::Private(chunk)),
                // Full or oversized for the node buffer: the shared buffer
                // may still take it.
                Err(AllocError::NotEnoughSpace | AllocError::SizeInvalid) => {}
                Err(err) => return Err(err),
            }
        }
        self.inner
            .shared
            .alloc_write_chunk(size)
            .map(GroupWriteChunk::Shared)
    }

    /// The node assigned to the calling thread, assigning one on first use.
    fn acquire_thread_node(&self) -> Option<u16> {
        let inner = &self.inner;
        THREAD_NODES
            .try_with(|cell| {
                let mut registry = cell.borrow_mut();
                if let Some(entry) = registry
                    .entries
                    .iter()
                    .find(|entry| entry.group_tag == inner.group_tag)
                {
                    return Some(entry.node);
                }
                let node = inner.free.pop()?;
                let head = inner.node_head(node);
                head.clear_owner();
                head.set_owner_thread(crate::thread_tag());
                inner.rings[usize::from(node)].debug_reset_threads();
                inner.in_use.push(node);
                registry.entries.push(ThreadNodeEntry {
                    group_tag: inner.group_tag,
                    group: Arc::downgrade(inner),
                    node,
                });
                Some(node)
            })
            .ok()
            .flatten()
    }

    // ---------------------------------------------------------------------
    // CONSUMER SIDE (single thread per group)
    // ---------------------------------------------------------------------

    /// Drains every buffer once, round-robin over the node buffers (in-use
    /// then recycle) and the shared buffer last, and runs the recycle
    /// sweep. Returns the number of chunks delivered.
    pub fn consume(&self, mut handler: impl FnMut(&[u8])) -> usize {
        let inner = &self.inner;
        let mut total = 0;

        total += inner.drain_list(&inner.in_use, &mut handler);
        total += inner.drain_list(&inner.recycle, &mut handler);
        inner.sweep_recycle();

        loop {
            match inner.shared.read_chunk() {
                Ok(chunk) => {
                    handler(chunk.data());
                    inner.shared.return_read_chunk(chunk);
                    total += 1;
                }
                Err(_) => break,
            }
        }
        total
    }

    /// Flushes the mapped region to disk. A no-op without a backing file.
    pub fn flush_map(&self) {
        if self.inner.map_backed {
            self.inner.region.flush();
        }
    }
}

impl GroupInner {
    fn node_head(&self, index: u16) -> &NodeHead {
        self.free.node(index)
    }

    /// Drains each node buffer reachable from `list`, moving flagged
    /// in-use nodes onto the recycle list as it goes.
    fn drain_list(&self, list: &BlockList, handler: &mut impl FnMut(&[u8])) -> usize {
        let mut total = 0;
        let mut cursor = list.first();
        while let Some(index) = cursor {
            // Capture the successor before any removal below.
            cursor = list.next_of(index);

            let ring = &self.rings[usize::from(index)];
            let mut batch = ring.batch_read();
            while let Some(data) = batch.next() {
                handler(data);
                total += 1;
            }
            ring.return_batch_read_chunks(batch);

            if list.list_type() == NodeType::InUse
                && self.node_head(index).recycle_requested()
                && self.in_use.remove_single_consumer(index)
            {
                self.recycle.push(index);
            }
        }
        total
    }

    /// Returns drained recycle nodes to the free list.
    fn sweep_recycle(&self) {
        let mut cursor = self.recycle.first();
        while let Some(index) = cursor {
            cursor = self.recycle.next_of(index);
            let ring = &self.rings[usize::from(index)];
            if ring.live_blocks() == 0 && self.recycle.remove_single_consumer(index) {
                self.node_head(index).clear_owner();
                ring.debug_reset_threads();
                self.free.push(index);
            }
        }
    }
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        if self.map_backed {
            self.region.flush();
        }
    }
}
