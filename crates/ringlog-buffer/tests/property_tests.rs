//! Property-based tests for the ring buffer invariants.
//!
//! Each property drives a buffer with a generated operation sequence and
//! checks the documented invariants: the cursor window never exceeds the
//! block count, payload bytes survive the transport unmodified, and every
//! committed chunk is delivered exactly once in order.

use std::collections::VecDeque;
use std::sync::Arc;

use proptest::prelude::*;
use ringlog_buffer::{AllocError, MpscRing, Region, SpscRing};

fn spsc_with_capacity(expected_bytes: u32) -> SpscRing {
    let len = SpscRing::min_region_size(expected_bytes);
    SpscRing::new(Arc::new(Region::heap(len)), 0, len, false).unwrap()
}

fn mpsc_with_capacity(expected_bytes: u32) -> MpscRing {
    let len = MpscRing::min_region_size(expected_bytes);
    MpscRing::new(Arc::new(Region::heap(len)), 0, len, false).unwrap()
}

proptest! {
    /// Random interleaving of writes and reads never corrupts data or the
    /// cursor window.
    #[test]
    fn prop_spsc_interleaved_round_trip(
        ops in prop::collection::vec((prop::bool::ANY, 1u32..200), 1..400),
    ) {
        let ring = spsc_with_capacity(1024);
        let mut expected: VecDeque<Vec<u8>> = VecDeque::new();
        let mut next_byte = 0u8;

        for (is_write, size) in ops {
            if is_write {
                match ring.alloc_write_chunk(size) {
                    Ok(mut chunk) => {
                        let payload: Vec<u8> =
                            (0..size).map(|i| next_byte.wrapping_add(i as u8)).collect();
                        chunk.fill(&payload);
                        chunk.commit();
                        expected.push_back(payload);
                        next_byte = next_byte.wrapping_add(1);
                    }
                    Err(AllocError::NotEnoughSpace) => {}
                    Err(AllocError::SizeInvalid) => {
                        prop_assert!(size > ring.max_chunk_size());
                    }
                    Err(err) => prop_assert!(false, "unexpected error: {err}"),
                }
            } else if let Ok(chunk) = ring.read_chunk() {
                let want = expected.pop_front();
                prop_assert!(want.is_some(), "read a chunk that was never written");
                let want = want.unwrap();
                prop_assert_eq!(chunk.data(), want.as_slice());
                ring.return_read_chunk(chunk);
            } else {
                prop_assert!(expected.is_empty());
            }

            // The live window is always within the block count.
            prop_assert!(ring.live_blocks() <= ring.total_blocks());
        }

        // Drain the remainder: everything committed arrives in order.
        while let Ok(chunk) = ring.read_chunk() {
            let want = expected.pop_front().expect("spurious trailing chunk");
            prop_assert_eq!(chunk.data(), want.as_slice());
            ring.return_read_chunk(chunk);
        }
        prop_assert!(expected.is_empty());
        prop_assert_eq!(ring.live_blocks(), 0);
    }

    /// A full write-then-drain cycle of random sizes is lossless, across
    /// many wrap-arounds.
    #[test]
    fn prop_spsc_wrapping_batches(
        batches in prop::collection::vec(
            prop::collection::vec(1u32..120, 1..20),
            1..20,
        ),
    ) {
        let ring = spsc_with_capacity(256);
        let mut counter = 0u32;

        for batch in batches {
            let mut written = Vec::new();
            for size in batch {
                match ring.alloc_write_chunk(size) {
                    Ok(mut chunk) => {
                        let payload: Vec<u8> = counter
                            .to_le_bytes()
                            .iter()
                            .copied()
                            .cycle()
                            .take(size as usize)
                            .collect();
                        chunk.fill(&payload);
                        chunk.commit();
                        written.push(payload);
                        counter += 1;
                    }
                    Err(AllocError::NotEnoughSpace | AllocError::SizeInvalid) => {}
                    Err(err) => prop_assert!(false, "unexpected error: {err}"),
                }
            }

            let mut batch_read = ring.batch_read();
            for want in &written {
                let got = batch_read.next();
                prop_assert!(got.is_some(), "missing chunk in batch read");
                prop_assert_eq!(got.unwrap(), want.as_slice());
            }
            prop_assert!(batch_read.next().is_none());
            ring.return_batch_read_chunks(batch_read);
        }
    }

    /// Single-threaded MPSC behaves exactly like a queue of byte payloads.
    #[test]
    fn prop_mpsc_sequential_round_trip(
        sizes in prop::collection::vec(1u32..500, 1..100),
    ) {
        let ring = mpsc_with_capacity(64 * 1024);
        let mut expected = VecDeque::new();

        for (tag, size) in sizes.into_iter().enumerate() {
            match ring.alloc_write_chunk(size) {
                Ok(mut chunk) => {
                    let payload: Vec<u8> = (0..size)
                        .map(|i| (tag as u8).wrapping_add(i as u8))
                        .collect();
                    chunk.fill(&payload);
                    chunk.commit();
                    expected.push_back(payload);
                }
                Err(AllocError::NotEnoughSpace) => {
                    // Drain one record to make progress, then move on.
                    if let Ok(chunk) = ring.read_chunk() {
                        let want = expected.pop_front().unwrap();
                        prop_assert_eq!(chunk.data(), want.as_slice());
                        ring.return_read_chunk(chunk);
                    }
                }
                Err(err) => prop_assert!(false, "unexpected error: {err}"),
            }
        }

        while let Ok(chunk) = ring.read_chunk() {
            let want = expected.pop_front().expect("spurious trailing chunk");
            prop_assert_eq!(chunk.data(), want.as_slice());
            ring.return_read_chunk(chunk);
        }
        prop_assert!(expected.is_empty());
    }

    /// Allocation error classification: oversized requests are rejected as
    /// invalid regardless of occupancy; fitting requests only ever fail
    /// with NotEnoughSpace.
    #[test]
    fn prop_spsc_alloc_error_classes(size in 0u32..4096) {
        let ring = spsc_with_capacity(256);
        let result = ring.alloc_write_chunk(size);
        match result {
            Ok(chunk) => {
                prop_assert!(size >= 1 && size <= ring.max_chunk_size());
                chunk.commit();
            }
            Err(AllocError::SizeInvalid) => {
                prop_assert!(size == 0 || size > ring.max_chunk_size());
            }
            Err(AllocError::NotEnoughSpace) => {
                // Empty buffer: a fitting size can never lack space.
                prop_assert!(false, "empty buffer reported NotEnoughSpace");
            }
            Err(err) => prop_assert!(false, "unexpected error: {err}"),
        }
    }
}
