//! I/O handles and request contexts

use crate::file_object::FileObject;
use bitflags::bitflags;
use cacheio_common::{Error, IoFlags, Result};
use cacheio_storage::IoBuffer;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

bitflags! {
    /// Flags fixed when a handle is opened
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Every write lands at the current end of file
        const APPEND = 1 << 0;
        const NO_ACCESS_TIME = 1 << 1;
    }
}

/// An open handle on a file object. Holds one registry reference.
#[derive(Debug)]
pub struct IoHandle {
    object: Arc<FileObject>,
    position: AtomicU64,
    open_flags: OpenFlags,
}

impl IoHandle {
    pub(crate) const fn new(object: Arc<FileObject>, open_flags: OpenFlags) -> Self {
        Self {
            object,
            position: AtomicU64::new(0),
            open_flags,
        }
    }

    #[must_use]
    pub const fn object(&self) -> &Arc<FileObject> {
        &self.object
    }

    /// Current position used by I/O without an explicit offset
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Release);
    }

    #[must_use]
    pub const fn open_flags(&self) -> OpenFlags {
        self.open_flags
    }
}

/// One read or write request
///
/// On return `bytes_completed` holds the number of bytes moved, which may be
/// non-zero even when the call fails.
#[derive(Debug)]
pub struct IoContext {
    pub buffer: IoBuffer,
    /// Explicit file offset; `None` uses and advances the handle position
    pub offset: Option<u64>,
    pub size: usize,
    pub write: bool,
    pub flags: IoFlags,
    pub timeout: Option<Duration>,
    pub bytes_completed: usize,
}

impl IoContext {
    /// Read `size` bytes into `buffer`
    #[must_use]
    pub const fn read(buffer: IoBuffer, offset: Option<u64>, size: usize) -> Self {
        Self {
            buffer,
            offset,
            size,
            write: false,
            flags: IoFlags::empty(),
            timeout: None,
            bytes_completed: 0,
        }
    }

    /// Write the first `size` bytes of `buffer`
    #[must_use]
    pub const fn write(buffer: IoBuffer, offset: Option<u64>, size: usize) -> Self {
        Self {
            buffer,
            offset,
            size,
            write: true,
            flags: IoFlags::empty(),
            timeout: None,
            bytes_completed: 0,
        }
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: IoFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The bytes read, as a vector
    #[must_use]
    pub fn completed_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.bytes_completed];
        if self.buffer.copy_to_slice(0, &mut out).is_err() {
            out.clear();
        }
        out
    }
}

/// Point in time after which a request gives up
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub(crate) fn after(timeout: Option<Duration>) -> Self {
        Self(timeout.and_then(|t| Instant::now().checked_add(t)))
    }

    pub(crate) fn check(self) -> Result<()> {
        match self.0 {
            Some(at) if Instant::now() >= at => Err(Error::Timeout),
            _ => Ok(()),
        }
    }

    /// Time left, passed down to device requests
    pub(crate) fn remaining(self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }
}
