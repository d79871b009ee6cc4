//! Device transport
//!
//! The engine talks to devices and file systems through [`DeviceTransport`]:
//! positioned reads and writes reporting a byte count alongside their status,
//! and file operations (close, delete, truncate, write properties).
//!
//! [`MemoryDevice`] keeps every file in memory and counts each request, with
//! fault injection for exercising failure paths.

use cacheio_common::{DeviceId, Error, FileId, FileProperties, IoFlags, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Parameters of one read or write request
#[derive(Debug, Clone, Copy)]
pub struct IoRequest<'a> {
    /// Properties of the target file, including its current size
    pub properties: &'a FileProperties,
    /// Byte offset into the file
    pub offset: u64,
    pub flags: IoFlags,
    /// `None` waits indefinitely
    pub timeout: Option<Duration>,
}

/// Outcome of a read or write: bytes moved are reported even on failure
#[derive(Debug)]
pub struct Completion {
    pub bytes_completed: usize,
    pub status: Result<()>,
}

impl Completion {
    #[must_use]
    pub const fn ok(bytes_completed: usize) -> Self {
        Self {
            bytes_completed,
            status: Ok(()),
        }
    }

    #[must_use]
    pub const fn failed(bytes_completed: usize, error: Error) -> Self {
        Self {
            bytes_completed,
            status: Err(error),
        }
    }
}

/// File-level operations sent to the owning device
#[derive(Debug, Clone, Copy)]
pub enum FileOperation<'a> {
    /// The last user of the file is gone
    Close,
    /// The file has no links left; release its storage
    Delete,
    /// Set the stored size of the file
    Truncate { new_size: u64 },
    /// Persist the file's properties
    WriteProperties(&'a FileProperties),
}

impl FileOperation<'_> {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Close => "close",
            Self::Delete => "delete",
            Self::Truncate { .. } => "truncate",
            Self::WriteProperties(_) => "write_properties",
        }
    }
}

/// Transport to the device or file system owning a file
pub trait DeviceTransport: Send + Sync {
    fn device_id(&self) -> DeviceId;

    /// Read into `buffer` at `request.offset`.
    ///
    /// The transfer is clamped to the file size in `request.properties`. A
    /// read starting at or past that size completes zero bytes with
    /// [`Error::EndOfFile`].
    fn read(&self, request: &IoRequest<'_>, buffer: &mut [u8]) -> Completion;

    /// Write `buffer` at `request.offset`.
    fn write(&self, request: &IoRequest<'_>, buffer: &[u8]) -> Completion;

    /// Perform a file operation on the file named by `properties`.
    fn file_operation(
        &self,
        properties: &FileProperties,
        operation: FileOperation<'_>,
        flags: IoFlags,
    ) -> Result<()>;
}

/// Injected failure for a [`MemoryDevice`] file operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail with [`Error::DeviceNotConnected`]
    NotConnected,
    /// Fail with a generic device error
    Failure,
}

impl Fault {
    fn to_error(self, operation: &str) -> Error {
        match self {
            Self::NotConnected => Error::DeviceNotConnected,
            Self::Failure => Error::device(format!("injected {operation} failure")),
        }
    }
}

/// Request counters of a [`MemoryDevice`]
#[derive(Debug, Default)]
pub struct DeviceCounters {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub synchronized_writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub closes: AtomicU64,
    pub deletes: AtomicU64,
    pub truncates: AtomicU64,
    pub property_writes: AtomicU64,
}

#[derive(Default)]
struct Faults {
    close: Option<Fault>,
    delete: Option<Fault>,
    properties: Option<Fault>,
    truncate: Option<Fault>,
    read: Option<Fault>,
    /// Cap on bytes accepted per write; a capped write fails after the cap
    write_limit: Option<usize>,
}

/// In-memory device holding one byte store per file
pub struct MemoryDevice {
    id: DeviceId,
    files: RwLock<HashMap<FileId, Vec<u8>>>,
    properties: Mutex<HashMap<FileId, FileProperties>>,
    faults: Mutex<Faults>,
    counters: DeviceCounters,
}

impl MemoryDevice {
    #[must_use]
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            files: RwLock::new(HashMap::new()),
            properties: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            counters: DeviceCounters::default(),
        }
    }

    /// Store `data` as the contents of `file_id`.
    pub fn insert_file(&self, file_id: FileId, data: Vec<u8>) {
        self.files.write().insert(file_id, data);
    }

    /// Stored bytes of `file_id`, if it exists
    #[must_use]
    pub fn contents(&self, file_id: FileId) -> Option<Vec<u8>> {
        self.files.read().get(&file_id).cloned()
    }

    /// Last properties persisted for `file_id`
    #[must_use]
    pub fn stored_properties(&self, file_id: FileId) -> Option<FileProperties> {
        self.properties.lock().get(&file_id).cloned()
    }

    #[must_use]
    pub const fn counters(&self) -> &DeviceCounters {
        &self.counters
    }

    #[must_use]
    pub fn reads(&self) -> u64 {
        self.counters.reads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn writes(&self) -> u64 {
        self.counters.writes.load(Ordering::Relaxed)
    }

    pub fn set_close_fault(&self, fault: Option<Fault>) {
        self.faults.lock().close = fault;
    }

    pub fn set_delete_fault(&self, fault: Option<Fault>) {
        self.faults.lock().delete = fault;
    }

    pub fn set_properties_fault(&self, fault: Option<Fault>) {
        self.faults.lock().properties = fault;
    }

    pub fn set_truncate_fault(&self, fault: Option<Fault>) {
        self.faults.lock().truncate = fault;
    }

    pub fn set_read_fault(&self, fault: Option<Fault>) {
        self.faults.lock().read = fault;
    }

    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.faults.lock().write_limit = limit;
    }
}

impl DeviceTransport for MemoryDevice {
    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn read(&self, request: &IoRequest<'_>, buffer: &mut [u8]) -> Completion {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        if let Some(fault) = self.faults.lock().read {
            return Completion::failed(0, fault.to_error("read"));
        }

        let size = request.properties.size;
        if request.offset >= size {
            return Completion::failed(0, Error::EndOfFile);
        }

        let available = usize::try_from(size - request.offset).unwrap_or(usize::MAX);
        let count = buffer.len().min(available);
        let files = self.files.read();
        let stored = files
            .get(&request.properties.file_id)
            .map_or(&[][..], Vec::as_slice);

        // Bytes inside the file size but past the stored data are a hole
        let start = usize::try_from(request.offset).unwrap_or(usize::MAX);
        let copied = stored.len().saturating_sub(start).min(count);
        if copied > 0 {
            buffer[..copied].copy_from_slice(&stored[start..start + copied]);
        }
        buffer[copied..count].fill(0);

        self.counters
            .bytes_read
            .fetch_add(count as u64, Ordering::Relaxed);
        Completion::ok(count)
    }

    fn write(&self, request: &IoRequest<'_>, buffer: &[u8]) -> Completion {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        if request.flags.contains(IoFlags::DATA_SYNCHRONIZED) {
            self.counters
                .synchronized_writes
                .fetch_add(1, Ordering::Relaxed);
        }

        let limit = self.faults.lock().write_limit;
        let count = limit.map_or(buffer.len(), |l| l.min(buffer.len()));
        let Ok(start) = usize::try_from(request.offset) else {
            return Completion::failed(0, Error::invalid("offset exceeds address space"));
        };

        let mut files = self.files.write();
        let stored = files.entry(request.properties.file_id).or_default();
        if stored.len() < start + count {
            stored.resize(start + count, 0);
        }
        stored[start..start + count].copy_from_slice(&buffer[..count]);

        self.counters
            .bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
        if count < buffer.len() {
            return Completion::failed(count, Error::device("short write"));
        }

        Completion::ok(count)
    }

    fn file_operation(
        &self,
        properties: &FileProperties,
        operation: FileOperation<'_>,
        _flags: IoFlags,
    ) -> Result<()> {
        let faults = self.faults.lock();
        match operation {
            FileOperation::Close => {
                self.counters.closes.fetch_add(1, Ordering::Relaxed);
                if let Some(fault) = faults.close {
                    return Err(fault.to_error(operation.name()));
                }
            }
            FileOperation::Delete => {
                self.counters.deletes.fetch_add(1, Ordering::Relaxed);
                if let Some(fault) = faults.delete {
                    return Err(fault.to_error(operation.name()));
                }
                self.files.write().remove(&properties.file_id);
                self.properties.lock().remove(&properties.file_id);
            }
            FileOperation::Truncate { new_size } => {
                self.counters.truncates.fetch_add(1, Ordering::Relaxed);
                if let Some(fault) = faults.truncate {
                    return Err(fault.to_error(operation.name()));
                }
                let new_len = usize::try_from(new_size)
                    .map_err(|_| Error::invalid("size exceeds address space"))?;
                let mut files = self.files.write();
                let stored = files.entry(properties.file_id).or_default();
                stored.resize(new_len, 0);
            }
            FileOperation::WriteProperties(props) => {
                self.counters.property_writes.fetch_add(1, Ordering::Relaxed);
                if let Some(fault) = faults.properties {
                    return Err(fault.to_error(operation.name()));
                }
                self.properties
                    .lock()
                    .insert(properties.file_id, props.clone());
            }
        }

        Ok(())
    }
}
