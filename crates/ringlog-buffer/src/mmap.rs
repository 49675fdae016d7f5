//! Memory-mapped backing files.
//!
//! A [`MapFile`] provides a page-aligned, grow-on-demand byte region backed
//! by a shared file mapping, so a buffer's live state survives process
//! termination. On platforms without mmap support the open falls back to a
//! plain heap region and recovery is disabled.

use std::path::Path;

use crate::error::SetupError;
use crate::region::Region;

/// Result of opening a backing file.
pub struct MapFile {
    /// The mapped (or fallback heap) region.
    pub region: Region,
    /// `true` if the file already held data before this open; only then is
    /// a recovery attempt meaningful.
    pub preexisting: bool,
}

impl MapFile {
    /// Opens or creates `path` and maps at least `len` bytes of it.
    ///
    /// The file is grown with `ftruncate` to the page-rounded length when
    /// smaller; an existing larger file is left as is and mapped over its
    /// leading `len` bytes.
    #[cfg(unix)]
    pub fn open(path: &Path, len: usize) -> Result<Self, SetupError> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| SetupError::Io(std::io::Error::from(std::io::ErrorKind::InvalidInput)))?;

        // SAFETY: c_path is a valid NUL-terminated string.
        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_CLOEXEC,
                0o644 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(SetupError::Io(std::io::Error::last_os_error()));
        }

        let result = Self::map_fd(fd, len);
        // The mapping stays valid after the descriptor is closed.
        // SAFETY: fd was opened above and is not used past this point.
        unsafe { libc::close(fd) };
        result
    }

    #[cfg(unix)]
    fn map_fd(fd: libc::c_int, len: usize) -> Result<Self, SetupError> {
        use std::ptr::NonNull;

        // SAFETY: querying a system constant.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page = if page > 0 { page as usize } else { 4096 };
        let raw_len = len.div_ceil(page) * page;

        // SAFETY: fd is a valid open descriptor.
        let current = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
        if current < 0 {
            return Err(SetupError::Io(std::io::Error::last_os_error()));
        }
        let preexisting = current > 0;

        if (current as usize) < raw_len {
            // SAFETY: growing the file; sparse zero fill is exactly the
            // fresh-buffer initial state.
            if unsafe { libc::ftruncate(fd, raw_len as libc::off_t) } != 0 {
                return Err(SetupError::Io(std::io::Error::last_os_error()));
            }
        }

        // SAFETY: fd is valid, raw_len is page-rounded and non-zero,
        // MAP_SHARED writes propagate to the file.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                raw_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(SetupError::Io(std::io::Error::last_os_error()));
        }
        let ptr = NonNull::new(raw.cast::<u8>())
            .ok_or_else(|| SetupError::Io(std::io::Error::from(std::io::ErrorKind::Other)))?;

        Ok(Self {
            region: Region::from_mapping(ptr, len, raw_len),
            preexisting,
        })
    }

    /// Fallback for platforms without mmap: a plain heap region with no
    /// persistence, so callers behave as if the file never existed.
    #[cfg(not(unix))]
    pub fn open(_path: &Path, len: usize) -> Result<Self, SetupError> {
        Ok(Self {
            region: Region::heap(len),
            preexisting: false,
        })
    }
}
