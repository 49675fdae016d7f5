//! Error types for buffer operations.

use thiserror::Error;

/// Why a write-chunk allocation failed. The producer is expected to drop
/// the record; none of these are fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Requested size is zero or exceeds what the buffer could ever hold.
    #[error("requested chunk size is invalid for this buffer")]
    SizeInvalid,
    /// The buffer is currently full; space frees up as the consumer drains.
    #[error("not enough space in buffer")]
    NotEnoughSpace,
    /// The buffer has not been constructed yet.
    #[error("buffer is not initialized")]
    NotInited,
}

impl AllocError {
    /// Returns `true` if retrying after the consumer drains can succeed.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotEnoughSpace)
    }
}

/// Why a read returned no chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    /// No committed chunk is available.
    #[error("log buffer is empty")]
    Empty,
}

/// Why an existing backing file was rejected during recovery.
///
/// Recovery rejection is never fatal: the buffer falls back to a fresh
/// initialization and reports the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("backing file magic mismatch")]
    BadMagic,
    #[error("stored block count does not match region size")]
    BlockCountMismatch,
    #[error("head checksum mismatch")]
    BadChecksum,
    #[error("head initialization never completed")]
    HeadNotReady,
    #[error("per-buffer stamp does not match the group layout")]
    StampMismatch,
    #[error("stored cursors outside the valid window")]
    CursorsOutOfRange,
    #[error("chunk walk did not land on the writing cursor")]
    TornChunks,
    #[error("stored group layout does not match the requested layout")]
    LayoutMismatch,
}

/// Outcome of constructing a buffer over a pre-existing region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The region was freshly initialized (no prior state).
    Fresh,
    /// Prior state was validated and adopted.
    Recovered,
    /// Prior state was present but rejected; the region was re-initialized.
    Rejected(RecoveryError),
}

impl RecoveryOutcome {
    #[inline]
    pub fn is_recovered(&self) -> bool {
        matches!(self, Self::Recovered)
    }
}

/// Errors surfaced while setting up a buffer or group.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The provided region is too small for even a minimal buffer.
    #[error("region too small: need at least {needed} bytes, got {got}")]
    RegionTooSmall { needed: usize, got: usize },
    /// Requested node count exceeds what 16-bit node indices can address.
    #[error("too many block nodes requested (max: {max})")]
    TooManyNodes { max: usize },
    /// Creating or mapping the backing file failed.
    #[error("backing file error: {0}")]
    Io(#[from] std::io::Error),
}
