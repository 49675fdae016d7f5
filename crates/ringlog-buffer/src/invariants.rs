//! Debug assertion macros for ring buffer invariants.
//!
//! Only active in debug builds (`#[cfg(debug_assertions)]`), so there is
//! zero overhead in release builds. Used by both ring buffer variants and
//! the block list.

/// Assert the live window never exceeds the block count.
///
/// `0 <= (writing - reading) <= count`, wrap-safe.
macro_rules! debug_assert_cursor_window {
    ($writing:expr, $reading:expr, $count:expr) => {
        debug_assert!(
            $writing.wrapping_sub($reading) <= $count,
            "cursor window violated: writing {} reading {} count {}",
            $writing,
            $reading,
            $count
        )
    };
}

/// Assert the reader does not advance past the writer.
macro_rules! debug_assert_reader_behind_writer {
    ($new_reading:expr, $writing:expr, $old_reading:expr) => {
        debug_assert!(
            $new_reading.wrapping_sub($old_reading) <= $writing.wrapping_sub($old_reading),
            "reading cursor {} advanced past writing cursor {}",
            $new_reading,
            $writing
        )
    };
}

/// Assert a delivered chunk's geometry is sane: at least one block, and a
/// payload that fits inside its block span.
macro_rules! debug_assert_chunk_geometry {
    ($block_num:expr, $data_size:expr, $block_size:expr, $header_size:expr) => {
        debug_assert!($block_num >= 1, "chunk spans zero blocks");
        debug_assert!(
            ($data_size as usize) <= ($block_num as usize) * $block_size - $header_size,
            "chunk payload {} overflows {} blocks",
            $data_size,
            $block_num
        )
    };
}

/// Assert a node index addresses a real node.
macro_rules! debug_assert_node_index {
    ($index:expr, $max:expr) => {
        debug_assert!($index < $max, "invalid block node index {}", $index)
    };
}

pub(crate) use debug_assert_chunk_geometry;
pub(crate) use debug_assert_cursor_window;
pub(crate) use debug_assert_node_index;
pub(crate) use debug_assert_reader_behind_writer;
