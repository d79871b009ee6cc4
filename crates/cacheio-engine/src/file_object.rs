//! File objects
//!
//! A [`FileObject`] is the shared in-memory representation of one file or
//! device, keyed by its [`FileIdentity`]. It owns the persisted properties,
//! the live cached size, the object-level I/O lock and the per-type special
//! I/O payload. Objects are created and torn down by the
//! [`FileObjectRegistry`](crate::registry::FileObjectRegistry); everything
//! here is the per-object state it manipulates.

use bitflags::bitflags;
use cacheio_common::{FileIdentity, FileProperties, IoObjectType, Result, Error};
use cacheio_storage::DeviceTransport;
use chrono::Utc;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

bitflags! {
    /// Object state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileObjectFlags: u32 {
        /// The device has an open handle that must be closed at teardown
        const OPEN = 1 << 0;
        /// The last teardown attempt failed
        const CLOSE_FAILED = 1 << 1;
        /// Properties changed since they were last written to the device
        const DIRTY_PROPERTIES = 1 << 2;
        /// Cached pages changed since the last flush
        const DIRTY_DATA = 1 << 3;
        /// Bypass the page cache for this object
        const NON_CACHED = 1 << 4;
        /// Readiness state is owned by someone else
        const EXTERNAL_IO_STATE = 1 << 5;
    }
}

/// Lifecycle state of a file object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectState {
    Live = 0,
    /// Teardown in progress; new lookups wait and retry
    Closing = 1,
    Destroyed = 2,
}

impl ObjectState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Live,
            1 => Self::Closing,
            _ => Self::Destroyed,
        }
    }
}

/// Which registry list currently holds the object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ListMembership {
    None = 0,
    Dirty = 1,
    Orphan = 2,
}

impl ListMembership {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Dirty,
            2 => Self::Orphan,
            _ => Self::None,
        }
    }
}

/// Which timestamp an I/O touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeKind {
    Access,
    Modify,
}

/// Opaque per-type payload of a special object
pub type SpecialPayload = Arc<dyn Any + Send + Sync>;

/// Special I/O state, one variant per special object type
#[derive(Clone)]
pub enum SpecialIo {
    Pipe(SpecialPayload),
    Socket(SpecialPayload),
    Terminal(SpecialPayload),
    SharedMemory(SpecialPayload),
}

impl SpecialIo {
    /// Check whether this payload belongs to an object of `object_type`
    #[must_use]
    pub const fn matches(&self, object_type: IoObjectType) -> bool {
        matches!(
            (self, object_type),
            (Self::Pipe(_), IoObjectType::Pipe)
                | (Self::Socket(_), IoObjectType::Socket)
                | (
                    Self::Terminal(_),
                    IoObjectType::TerminalMaster | IoObjectType::TerminalSlave
                )
                | (Self::SharedMemory(_), IoObjectType::SharedMemoryObject)
        )
    }

    #[must_use]
    pub fn payload(&self) -> &SpecialPayload {
        match self {
            Self::Pipe(p) | Self::Socket(p) | Self::Terminal(p) | Self::SharedMemory(p) => p,
        }
    }
}

impl fmt::Debug for SpecialIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pipe(_) => "Pipe",
            Self::Socket(_) => "Socket",
            Self::Terminal(_) => "Terminal",
            Self::SharedMemory(_) => "SharedMemory",
        };
        f.write_str(name)
    }
}

/// Manual-reset event that lookups block on until the object is usable
#[derive(Debug)]
pub struct ReadyEvent {
    ready: Mutex<bool>,
    changed: Condvar,
}

impl ReadyEvent {
    const fn new(ready: bool) -> Self {
        Self {
            ready: Mutex::new(ready),
            changed: Condvar::new(),
        }
    }

    pub fn set(&self) {
        *self.ready.lock() = true;
        self.changed.notify_all();
    }

    pub fn reset(&self) {
        *self.ready.lock() = false;
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.ready.lock()
    }

    /// Block until the event is set
    pub fn wait(&self) {
        let mut ready = self.ready.lock();
        while !*ready {
            self.changed.wait(&mut ready);
        }
    }
}

/// A memory mapping over a range of the object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    pub offset: u64,
    pub len: u64,
}

bitflags! {
    /// Poll events signaled on an object's I/O state
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u32 {
        const IN = 1 << 0;
        const OUT = 1 << 1;
        const ERROR = 1 << 2;
        const DISCONNECTED = 1 << 3;
    }
}

/// Readiness state polled by waiters on the object
#[derive(Debug, Default)]
pub struct IoState {
    events: Mutex<PollEvents>,
}

impl IoState {
    pub fn signal(&self, events: PollEvents) {
        self.events.lock().insert(events);
    }

    pub fn clear(&self, events: PollEvents) {
        self.events.lock().remove(events);
    }

    #[must_use]
    pub fn events(&self) -> PollEvents {
        *self.events.lock()
    }
}

impl Default for PollEvents {
    fn default() -> Self {
        Self::empty()
    }
}

/// Guard returned by [`FileObject::lock_io`]
pub enum IoLockGuard<'a> {
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}

/// Shared in-memory representation of one file or device
pub struct FileObject {
    identity: FileIdentity,
    object_type: IoObjectType,
    device: Arc<dyn DeviceTransport>,
    pub(crate) reference_count: AtomicU32,
    path_entry_count: AtomicU32,
    state: AtomicU8,
    flags: AtomicU32,
    /// Modified only under the registry lock
    list: AtomicU8,
    /// Present only for cacheable types
    io_lock: Option<RwLock<()>>,
    ready: ReadyEvent,
    properties: Mutex<FileProperties>,
    cached_size: AtomicU64,
    special_io: Mutex<Option<SpecialIo>>,
    io_state: Option<IoState>,
    mappings: Mutex<Vec<MappedRegion>>,
}

impl FileObject {
    /// Build a new object holding two references: the caller's and the
    /// registry tree's.
    pub(crate) fn new(
        properties: FileProperties,
        device: Arc<dyn DeviceTransport>,
        flags: FileObjectFlags,
    ) -> Self {
        let object_type = properties.object_type;
        Self {
            identity: properties.identity(),
            object_type,
            device,
            reference_count: AtomicU32::new(2),
            path_entry_count: AtomicU32::new(0),
            state: AtomicU8::new(ObjectState::Live as u8),
            flags: AtomicU32::new(flags.bits()),
            list: AtomicU8::new(ListMembership::None as u8),
            io_lock: object_type.is_cacheable().then(|| RwLock::new(())),
            ready: ReadyEvent::new(!object_type.is_special()),
            cached_size: AtomicU64::new(properties.size),
            properties: Mutex::new(properties),
            special_io: Mutex::new(None),
            io_state: (!flags.contains(FileObjectFlags::EXTERNAL_IO_STATE))
                .then(IoState::default),
            mappings: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub const fn identity(&self) -> FileIdentity {
        self.identity
    }

    #[must_use]
    pub const fn object_type(&self) -> IoObjectType {
        self.object_type
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn DeviceTransport> {
        &self.device
    }

    /// Logical reference count
    #[must_use]
    pub fn reference_count(&self) -> u32 {
        self.reference_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn path_entry_count(&self) -> u32 {
        self.path_entry_count.load(Ordering::Acquire)
    }

    pub(crate) fn add_path_entry(&self) -> u32 {
        self.path_entry_count.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn remove_path_entry(&self) -> u32 {
        self.path_entry_count.fetch_sub(1, Ordering::AcqRel)
    }

    #[must_use]
    pub fn state(&self) -> ObjectState {
        ObjectState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ObjectState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[must_use]
    pub fn flags(&self) -> FileObjectFlags {
        FileObjectFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn insert_flags(&self, flags: FileObjectFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn remove_flags(&self, flags: FileObjectFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Clear `flag` and report whether it was set.
    pub fn take_flag(&self, flag: FileObjectFlags) -> bool {
        let old = self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        FileObjectFlags::from_bits_retain(old).intersects(flag)
    }

    pub(crate) fn membership(&self) -> ListMembership {
        ListMembership::from_u8(self.list.load(Ordering::Acquire))
    }

    pub(crate) fn set_membership(&self, list: ListMembership) {
        self.list.store(list as u8, Ordering::Release);
    }

    /// Take the object-level I/O lock, if the type has one.
    pub fn lock_io(&self, exclusive: bool) -> Option<IoLockGuard<'_>> {
        self.io_lock.as_ref().map(|lock| {
            if exclusive {
                IoLockGuard::Exclusive(lock.write())
            } else {
                IoLockGuard::Shared(lock.read())
            }
        })
    }

    pub(crate) const fn io_lock(&self) -> Option<&RwLock<()>> {
        self.io_lock.as_ref()
    }

    pub(crate) const fn ready_event(&self) -> &ReadyEvent {
        &self.ready
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.is_set()
    }

    /// Make a special object visible to lookups waiting on it.
    pub fn signal_ready(&self) {
        self.ready.set();
    }

    /// Snapshot of the persisted properties
    #[must_use]
    pub fn properties(&self) -> FileProperties {
        self.properties.lock().clone()
    }

    /// Mutate the properties under the property lock
    pub fn with_properties<R>(&self, f: impl FnOnce(&mut FileProperties) -> R) -> R {
        f(&mut self.properties.lock())
    }

    /// Live size of the object
    #[must_use]
    pub fn size(&self) -> u64 {
        self.cached_size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.properties.lock().block_size
    }

    #[must_use]
    pub fn hard_link_count(&self) -> u32 {
        self.properties.lock().hard_link_count
    }

    /// Raise the size to `new_size` if it is larger; never shrinks.
    ///
    /// Returns true if the size grew. The object is flagged as having dirty
    /// properties but is not queued for writeback.
    pub(crate) fn grow_size(&self, new_size: u64) -> bool {
        let mut current = self.cached_size.load(Ordering::Acquire);
        while new_size > current {
            match self.cached_size.compare_exchange_weak(
                current,
                new_size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if new_size <= current {
            return false;
        }

        let mut props = self.properties.lock();
        if new_size > props.size {
            props.size = new_size;
            props.block_count = props.blocks_for(new_size);
        }
        drop(props);
        self.insert_flags(FileObjectFlags::DIRTY_PROPERTIES);
        true
    }

    /// Set both the live and the persisted size. Caller holds the I/O lock
    /// exclusively.
    pub(crate) fn set_size(&self, new_size: u64) {
        let mut props = self.properties.lock();
        props.size = new_size;
        props.block_count = props.blocks_for(new_size);
        self.cached_size.store(new_size, Ordering::Release);
        drop(props);
        self.insert_flags(FileObjectFlags::DIRTY_PROPERTIES);
    }

    pub(crate) fn touch_time(&self, kind: TimeKind) {
        let now = Utc::now();
        let mut props = self.properties.lock();
        match kind {
            TimeKind::Access => props.access_time = now,
            TimeKind::Modify => {
                props.modified_time = now;
                props.status_change_time = now;
            }
        }
        drop(props);
        self.insert_flags(FileObjectFlags::DIRTY_PROPERTIES);
    }

    /// Attach the special I/O payload. The payload variant must match the
    /// object type and may only be set once.
    pub fn set_special_io(&self, special: SpecialIo) -> Result<()> {
        if !special.matches(self.object_type) {
            return Err(Error::invalid(format!(
                "{special:?} payload does not fit a {:?} object",
                self.object_type
            )));
        }

        let mut slot = self.special_io.lock();
        if slot.is_some() {
            return Err(Error::invalid("special I/O state already attached"));
        }
        *slot = Some(special);
        Ok(())
    }

    #[must_use]
    pub fn special_io(&self) -> Option<SpecialIo> {
        self.special_io.lock().clone()
    }

    #[must_use]
    pub const fn io_state(&self) -> Option<&IoState> {
        self.io_state.as_ref()
    }

    /// Record a memory mapping of `[offset, offset + len)`.
    pub fn map_region(&self, offset: u64, len: u64) -> Result<()> {
        if len == 0 || offset.checked_add(len).is_none() {
            return Err(Error::invalid(format!("bad mapping {offset}+{len}")));
        }
        if self.state() == ObjectState::Destroyed {
            return Err(Error::invalid("object already destroyed"));
        }

        self.mappings.lock().push(MappedRegion { offset, len });
        Ok(())
    }

    /// Remove the mapping starting at `offset`; returns true if one existed.
    pub fn unmap_region(&self, offset: u64) -> bool {
        let mut mappings = self.mappings.lock();
        let before = mappings.len();
        mappings.retain(|m| m.offset != offset);
        mappings.len() != before
    }

    /// Drop or shorten mappings that reach past `size`.
    pub(crate) fn unmap_beyond(&self, size: u64) -> usize {
        let mut mappings = self.mappings.lock();
        let before = mappings.len();
        mappings.retain(|m| m.offset < size);
        for region in mappings.iter_mut() {
            region.len = region.len.min(size - region.offset);
        }
        before - mappings.len()
    }

    #[must_use]
    pub fn mappings(&self) -> Vec<MappedRegion> {
        self.mappings.lock().clone()
    }

    /// Release the object's resources. Returns false if it was already
    /// destroyed.
    pub(crate) fn destroy(&self) -> bool {
        let previous = self.state.swap(ObjectState::Destroyed as u8, Ordering::AcqRel);
        if ObjectState::from_u8(previous) == ObjectState::Destroyed {
            return false;
        }

        self.special_io.lock().take();
        self.mappings.lock().clear();
        if let Some(io_state) = &self.io_state {
            io_state.signal(PollEvents::DISCONNECTED);
        }
        true
    }
}

impl fmt::Debug for FileObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileObject")
            .field("identity", &self.identity)
            .field("type", &self.object_type)
            .field("refs", &self.reference_count())
            .field("state", &self.state())
            .field("flags", &self.flags())
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}
