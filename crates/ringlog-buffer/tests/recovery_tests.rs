//! Crash-recovery tests: buffers written by one "run" (ring instance over
//! a mapped file) must drain correctly in the next.

#![cfg(unix)]

use std::sync::Arc;

use ringlog_buffer::{
    BufferGroup, GroupConfig, MapFile, MpscRing, ReadError, RecoveryOutcome, SpscRing,
    BUFFER_HEAD_SIZE, MPSC_BLOCK_SIZE,
};

fn open_spsc(path: &std::path::Path, len: usize) -> (SpscRing, bool) {
    let map = MapFile::open(path, len).unwrap();
    let preexisting = map.preexisting;
    let region = Arc::new(map.region);
    (
        SpscRing::new(region, 0, len, preexisting).unwrap(),
        preexisting,
    )
}

#[test]
fn test_spsc_survives_reopen_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("spsc.rbuf");
    let len = SpscRing::min_region_size(1024);

    {
        let (ring, preexisting) = open_spsc(&path, len);
        assert!(!preexisting);
        for i in 0u32..10 {
            let mut chunk = ring.alloc_write_chunk(8).unwrap();
            chunk.fill(&u64::from(i).to_le_bytes());
            chunk.commit();
        }
        // Consume the first three records before "crashing".
        for _ in 0..3 {
            let chunk = ring.read_chunk().unwrap();
            ring.return_read_chunk(chunk);
        }
    }

    let (ring, preexisting) = open_spsc(&path, len);
    assert!(preexisting);
    assert!(ring.recovery_outcome().is_recovered());
    for expected in 3u64..10 {
        let chunk = ring.read_chunk().unwrap();
        assert_eq!(chunk.data(), expected.to_le_bytes());
        ring.return_read_chunk(chunk);
    }
    assert!(matches!(ring.read_chunk(), Err(ReadError::Empty)));
}

#[test]
fn test_spsc_rejects_foreign_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.rbuf");
    let len = SpscRing::min_region_size(256);
    std::fs::write(&path, vec![0x5Au8; len]).unwrap();

    let (ring, preexisting) = open_spsc(&path, len);
    assert!(preexisting);
    assert!(matches!(
        ring.recovery_outcome(),
        RecoveryOutcome::Rejected(_)
    ));
    // Rejected recovery falls back to an empty, usable buffer.
    assert!(matches!(ring.read_chunk(), Err(ReadError::Empty)));
    let chunk = ring.alloc_write_chunk(16).unwrap();
    chunk.commit();
}

#[test]
fn test_spsc_cursors_near_u32_wrap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wrap.rbuf");
    let len = SpscRing::min_region_size(128); // 16 blocks

    {
        let (ring, _) = open_spsc(&path, len);
        drop(ring);
    }

    // Patch both live cursors to just below the 32-bit boundary (equal, so
    // the recovered window is empty). The head checksum covers only the
    // identity fields, so the file stays acceptable.
    {
        use std::io::{Seek, SeekFrom, Write};
        let near_wrap = (u32::MAX - 2).to_le_bytes();
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap();
        file.seek(SeekFrom::Start(3 * 64)).unwrap(); // reading_cursor line
        file.write_all(&near_wrap).unwrap();
        file.seek(SeekFrom::Start(4 * 64)).unwrap(); // writing_cursor line
        file.write_all(&near_wrap).unwrap();
    }

    let (ring, preexisting) = open_spsc(&path, len);
    assert!(preexisting);
    assert!(ring.recovery_outcome().is_recovered());
    assert_eq!(ring.free_blocks(), 16);

    // Drive enough one-block chunks through to carry both cursors across
    // the 2^32 boundary; distances stay wrap-safe throughout.
    for i in 0u32..64 {
        let mut chunk = ring.alloc_write_chunk(4).unwrap();
        chunk.fill(&i.to_le_bytes());
        chunk.commit();
        assert!(ring.free_blocks() <= 16);
        let read = ring.read_chunk().unwrap();
        assert_eq!(read.data(), i.to_le_bytes());
        ring.return_read_chunk(read);
    }
    assert_eq!(ring.free_blocks(), 16);
}

fn open_mpsc(path: &std::path::Path, len: usize) -> MpscRing {
    let map = MapFile::open(path, len).unwrap();
    let preexisting = map.preexisting;
    let region = Arc::new(map.region);
    MpscRing::new(region, 0, len, preexisting).unwrap()
}

#[test]
fn test_mpsc_uncommitted_chunk_skipped_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mpsc.rbuf");
    let len = MpscRing::min_region_size(4096);

    {
        let ring = open_mpsc(&path, len);
        let mut committed = ring.alloc_write_chunk(16).unwrap();
        committed.fill(&[1u8; 16]);
        committed.commit();

        // Reserved but never committed: simulates a producer dying between
        // reservation and the status flip. Leaking the handle keeps the
        // span in the `unused` state a crash would leave behind.
        let abandoned = ring.alloc_write_chunk(16).unwrap();
        std::mem::forget(abandoned);

        let mut after = ring.alloc_write_chunk(16).unwrap();
        after.fill(&[3u8; 16]);
        after.commit();
    }

    let ring = open_mpsc(&path, len);
    assert!(ring.recovery_outcome().is_recovered());

    // The dead producer's span reads as invalid and is skipped exactly;
    // both committed neighbours survive in order.
    let first = ring.read_chunk().unwrap();
    assert_eq!(first.data(), &[1u8; 16]);
    ring.return_read_chunk(first);
    let second = ring.read_chunk().unwrap();
    assert_eq!(second.data(), &[3u8; 16]);
    ring.return_read_chunk(second);
    assert!(matches!(ring.read_chunk(), Err(ReadError::Empty)));
}

#[test]
fn test_mpsc_zeroed_header_invalidates_rest_of_window() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torn.rbuf");
    let len = MpscRing::min_region_size(4096);

    let second_chunk_offset;
    {
        let ring = open_mpsc(&path, len);
        for fill in [1u8, 2, 3] {
            let mut chunk = ring.alloc_write_chunk(16).unwrap();
            chunk.fill(&[fill; 16]);
            chunk.commit();
        }
        // 16-byte payloads span one cache-line block each.
        second_chunk_offset = BUFFER_HEAD_SIZE + MPSC_BLOCK_SIZE;
    }

    // Tear the second chunk's header word down to zero, as if the write
    // never reached the file.
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap();
        file.seek(SeekFrom::Start(second_chunk_offset as u64)).unwrap();
        file.write_all(&[0u8; 8]).unwrap();
    }

    let ring = open_mpsc(&path, len);
    assert!(ring.recovery_outcome().is_recovered());

    // A span that cannot be walked poisons everything after it: only the
    // first record survives.
    let first = ring.read_chunk().unwrap();
    assert_eq!(first.data(), &[1u8; 16]);
    ring.return_read_chunk(first);
    assert!(matches!(ring.read_chunk(), Err(ReadError::Empty)));

    // The buffer is healthy for new traffic.
    let mut chunk = ring.alloc_write_chunk(8).unwrap();
    chunk.fill(&[9u8; 8]);
    chunk.commit();
    let read = ring.read_chunk().unwrap();
    assert_eq!(read.data(), &[9u8; 8]);
    ring.return_read_chunk(read);
}

fn group_config(path: std::path::PathBuf) -> GroupConfig {
    GroupConfig {
        node_count: 4,
        node_buffer_size: 64 * 1024,
        shared_buffer_size: 64 * 1024,
        map_path: Some(path),
    }
}

#[test]
fn test_group_recovers_undrained_records_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("group.rbuf");

    {
        let group = BufferGroup::create(&group_config(path.clone())).unwrap();
        assert_eq!(group.recovery_outcome(), RecoveryOutcome::Fresh);
        for i in 0u32..1000 {
            let mut chunk = group.alloc_write_chunk(16).unwrap();
            let mut bytes = [0u8; 16];
            bytes[..4].copy_from_slice(&i.to_le_bytes());
            chunk.fill(&bytes);
            chunk.commit();
        }
        // No drain: everything is still in flight when the group drops.
    }

    let group = BufferGroup::create(&group_config(path)).unwrap();
    assert_eq!(group.recovery_outcome(), RecoveryOutcome::Recovered);

    let mut recovered = Vec::new();
    loop {
        let drained = group.consume(|data| {
            recovered.push(u32::from_le_bytes(data[..4].try_into().unwrap()));
        });
        if drained == 0 {
            break;
        }
    }
    assert_eq!(recovered.len(), 1000);
    assert!(recovered.windows(2).all(|pair| pair[0] < pair[1]));

    // The orphaned node drains to empty and becomes reusable.
    group.consume(|_| {});
    assert_eq!(group.free_nodes(), 4);
}

#[test]
fn test_group_corrupted_stamp_discards_file() {
    use ringlog_buffer::{BUFFER_MISC_OFFSET, BUFFER_STAMP_SIZE, CACHE_LINE_SIZE, GROUP_HEAD_SIZE};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("group.rbuf");

    {
        let group = BufferGroup::create(&group_config(path.clone())).unwrap();
        let mut chunk = group.alloc_write_chunk(8).unwrap();
        chunk.fill(&[7u8; 8]);
        chunk.commit();
    }

    // Overwrite node 0's identity stamp (node head is one cache line,
    // the stamp sits in the last line of the buffer head that follows).
    {
        use std::io::{Seek, SeekFrom, Write};
        let offset = GROUP_HEAD_SIZE + CACHE_LINE_SIZE + BUFFER_MISC_OFFSET;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap();
        file.seek(SeekFrom::Start(offset as u64)).unwrap();
        file.write_all(&[0xFFu8; BUFFER_STAMP_SIZE]).unwrap();
    }

    // Same geometry, but the sub-regions no longer prove they are the
    // buffers this layout describes: the whole group starts fresh.
    let group = BufferGroup::create(&group_config(path)).unwrap();
    assert_eq!(
        group.recovery_outcome(),
        RecoveryOutcome::Rejected(ringlog_buffer::RecoveryError::StampMismatch)
    );
    assert_eq!(group.consume(|_| {}), 0);
}

#[test]
fn test_group_layout_change_discards_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("group.rbuf");

    {
        let group = BufferGroup::create(&group_config(path.clone())).unwrap();
        let mut chunk = group.alloc_write_chunk(8).unwrap();
        chunk.fill(&[7u8; 8]);
        chunk.commit();
    }

    // Same file, different geometry: recovery must be rejected and the
    // group must come up empty.
    let mut config = group_config(path);
    config.node_count = 2;
    let group = BufferGroup::create(&config).unwrap();
    assert!(matches!(
        group.recovery_outcome(),
        RecoveryOutcome::Rejected(_)
    ));
    assert_eq!(group.consume(|_| {}), 0);
}
