//! File object registry
//!
//! The registry maps [`FileIdentity`] to the one live [`FileObject`] for that
//! file and owns the global dirty and orphan lists. A single mutex protects
//! the tree and both lists; device operations (close, delete) always run with
//! it released.
//!
//! # Reference counting
//!
//! Every object carries a logical reference count next to its `Arc`:
//!
//! ```text
//!   new object           count = 2  (caller + tree)
//!   on the dirty list    +1 held by the list
//!   2 -> 1               last user gone: tear down (close, delete), leave tree
//!   1 -> 0               destroy exactly once
//! ```
//!
//! A teardown that fails leaves the object in the tree, flagged
//! [`FileObjectFlags::CLOSE_FAILED`]. If nobody else holds it, it is parked
//! on the orphan list until [`FileObjectRegistry::cleanup_file_objects`]
//! retries.

use crate::file_object::{FileObject, FileObjectFlags, ListMembership, ObjectState, TimeKind};
use cacheio_common::{
    DeviceId, Error, FileIdentity, FileProperties, IoFlags, IoObjectType, Result,
};
use cacheio_storage::{DeviceTransport, FileOperation};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLockWriteGuard};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Result of one lookup-or-create attempt
enum LookupOutcome {
    Found(Arc<FileObject>),
    Created(Arc<FileObject>),
    /// The object found was being torn down; look again
    Retry,
}

#[derive(Default)]
struct RegistryLists {
    tree: BTreeMap<FileIdentity, Arc<FileObject>>,
    /// Flushed front to back
    dirty: VecDeque<Arc<FileObject>>,
    orphans: Vec<Arc<FileObject>>,
}

/// Wake-up channel for the writeback worker
#[derive(Debug, Clone)]
pub struct FlushSignal {
    tx: Sender<()>,
    rx: Receiver<()>,
    notifications: Arc<AtomicU64>,
}

impl FlushSignal {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Self {
            tx,
            rx,
            notifications: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wake the writeback worker. Coalesces with a pending wake-up.
    pub fn notify(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => trace!("flush signal has no listener"),
        }
    }

    #[must_use]
    pub fn receiver(&self) -> Receiver<()> {
        self.rx.clone()
    }

    /// Total number of notifications sent
    #[must_use]
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct RegistryCounters {
    created: AtomicU64,
    destroyed: AtomicU64,
    teardown_failures: AtomicU64,
    lookup_retries: AtomicU64,
}

/// Point-in-time registry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Objects currently in the tree
    pub live_objects: usize,
    pub dirty_objects: usize,
    pub orphaned_objects: usize,
    pub created: u64,
    pub destroyed: u64,
    pub teardown_failures: u64,
    pub lookup_retries: u64,
}

/// Exclusive I/O locks on a set of objects, taken in identity order
pub struct MultiObjectLockGuard<'a> {
    guards: Vec<RwLockWriteGuard<'a, ()>>,
}

impl MultiObjectLockGuard<'_> {
    /// Number of distinct locks held
    #[must_use]
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

impl Drop for MultiObjectLockGuard<'_> {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

/// Registry of live file objects
pub struct FileObjectRegistry {
    lists: Mutex<RegistryLists>,
    flush_signal: FlushSignal,
    counters: RegistryCounters,
}

impl Default for FileObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FileObjectRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(RegistryLists::default()),
            flush_signal: FlushSignal::new(),
            counters: RegistryCounters::default(),
        }
    }

    #[must_use]
    pub const fn flush_signal(&self) -> &FlushSignal {
        &self.flush_signal
    }

    /// Find the object for `properties`' identity or create it.
    ///
    /// Returns the object with one reference held for the caller, and
    /// whether it was created by this call. A created object of a special
    /// type stays unready until its creator calls
    /// [`FileObject::signal_ready`]; everyone else finding it blocks until
    /// then.
    pub fn create_or_lookup(
        &self,
        properties: &FileProperties,
        device: Arc<dyn DeviceTransport>,
        flags: FileObjectFlags,
    ) -> Result<(Arc<FileObject>, bool)> {
        if properties.device_id != device.device_id() {
            return Err(Error::invalid(format!(
                "file {} does not belong to device {}",
                properties.identity(),
                device.device_id()
            )));
        }

        let mut spare = None;
        loop {
            match self.lookup_or_insert(properties, &device, flags, &mut spare) {
                LookupOutcome::Found(object) => return Ok((object, false)),
                LookupOutcome::Created(object) => return Ok((object, true)),
                LookupOutcome::Retry => {
                    self.counters.lookup_retries.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn lookup_or_insert(
        &self,
        properties: &FileProperties,
        device: &Arc<dyn DeviceTransport>,
        flags: FileObjectFlags,
        spare: &mut Option<Arc<FileObject>>,
    ) -> LookupOutcome {
        let identity = properties.identity();
        let found = Self::lookup_locked(&mut self.lists.lock(), identity);
        if let Some(object) = found {
            return self.wait_until_ready(object);
        }

        // Build outside the lock, then check again before publishing.
        let candidate = spare.take().unwrap_or_else(|| {
            Arc::new(FileObject::new(properties.clone(), device.clone(), flags))
        });

        let mut lists = self.lists.lock();
        if let Some(object) = Self::lookup_locked(&mut lists, identity) {
            drop(lists);
            *spare = Some(candidate);
            return self.wait_until_ready(object);
        }

        lists.tree.insert(identity, candidate.clone());
        drop(lists);
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(%identity, object_type = ?properties.object_type, "created file object");
        LookupOutcome::Created(candidate)
    }

    /// Tree lookup that adds a reference. Caller holds the registry lock.
    fn lookup_locked(lists: &mut RegistryLists, identity: FileIdentity) -> Option<Arc<FileObject>> {
        let object = lists.tree.get(&identity)?.clone();
        let old = object.reference_count.fetch_add(1, Ordering::AcqRel);
        if old == 1 && object.membership() == ListMembership::Orphan {
            lists.orphans.retain(|o| !Arc::ptr_eq(o, &object));
            object.set_membership(ListMembership::None);
        }
        Some(object)
    }

    fn wait_until_ready(&self, object: Arc<FileObject>) -> LookupOutcome {
        object.ready_event().wait();
        if object.state() == ObjectState::Closing {
            if let Err(e) = self.release_reference(&object, false) {
                warn!(identity = %object.identity(), error = %e, "failed to release closing object");
            }
            return LookupOutcome::Retry;
        }

        LookupOutcome::Found(object)
    }

    /// Look up an existing object without creating one
    pub fn lookup(&self, identity: FileIdentity) -> Option<Arc<FileObject>> {
        loop {
            let object = Self::lookup_locked(&mut self.lists.lock(), identity)?;
            match self.wait_until_ready(object) {
                LookupOutcome::Found(object) | LookupOutcome::Created(object) => {
                    return Some(object);
                }
                LookupOutcome::Retry => {}
            }
        }
    }

    /// Take another reference on an object the caller already holds.
    pub fn add_reference(&self, object: &FileObject) {
        let old = object.reference_count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(old != 0, "reference added to a destroyed object");
    }

    /// Drop one reference.
    ///
    /// Dropping the last user reference tears the object down: the device
    /// handle is closed and, if no hard links remain, the file is deleted.
    /// With `fail_if_last` set the reference is kept instead and
    /// [`Error::Cancelled`] returned. Teardown failures are not reported
    /// here; the object is parked and retried later.
    pub fn release_reference(&self, object: &Arc<FileObject>, fail_if_last: bool) -> Result<()> {
        let lists = self.lists.lock();
        let old = object.reference_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old != 0, "file object reference count underflow");

        match old {
            2 => {
                if object.state() == ObjectState::Closing {
                    return Ok(());
                }

                if fail_if_last {
                    object.reference_count.fetch_add(1, Ordering::AcqRel);
                    return Err(Error::Cancelled);
                }

                object.ready_event().reset();
                object.set_state(ObjectState::Closing);
                object.remove_flags(FileObjectFlags::CLOSE_FAILED);
                drop(lists);

                if let Err(e) = Self::disengage(object) {
                    object.insert_flags(FileObjectFlags::CLOSE_FAILED);
                    self.counters.teardown_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(identity = %object.identity(), error = %e, "file object teardown failed");
                    self.park_failed(object);
                    return Ok(());
                }

                let identity = object.identity();
                {
                    let mut lists = self.lists.lock();
                    if lists
                        .tree
                        .get(&identity)
                        .is_some_and(|current| Arc::ptr_eq(current, object))
                    {
                        lists.tree.remove(&identity);
                    }
                }

                object.ready_event().set();
                self.release_reference(object, false)
            }
            1 => {
                drop(lists);
                if object.destroy() {
                    self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
                    debug!(identity = %object.identity(), "destroyed file object");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Close the device handle and delete unlinked files.
    fn disengage(object: &FileObject) -> Result<()> {
        let props = object.properties();
        let device = object.device();

        if object.flags().contains(FileObjectFlags::OPEN) {
            match device.file_operation(&props, FileOperation::Close, IoFlags::empty()) {
                Ok(()) => {}
                Err(e) if e.is_teardown_success() => {
                    debug!(identity = %object.identity(), "device gone during close");
                }
                Err(e) => return Err(e),
            }
            object.remove_flags(FileObjectFlags::OPEN);
        }

        if props.hard_link_count == 0 {
            match device.file_operation(&props, FileOperation::Delete, IoFlags::empty()) {
                Ok(()) => {}
                Err(e) if e.is_teardown_success() => {
                    debug!(identity = %object.identity(), "device gone during delete");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn park_failed(&self, object: &Arc<FileObject>) {
        let mut lists = self.lists.lock();
        if object.reference_count() == 1 && object.membership() == ListMembership::None {
            lists.orphans.push(object.clone());
            object.set_membership(ListMembership::Orphan);
        }
        object.set_state(ObjectState::Live);
        drop(lists);
        object.ready_event().set();
    }

    /// Retry teardown of every orphaned object; returns how many were
    /// retried.
    pub fn cleanup_file_objects(&self) -> usize {
        let orphans = {
            let mut lists = self.lists.lock();
            let orphans = std::mem::take(&mut lists.orphans);
            for object in &orphans {
                object.set_membership(ListMembership::None);
            }
            orphans
        };

        let count = orphans.len();
        for object in orphans {
            self.add_reference(&object);
            if let Err(e) = self.release_reference(&object, false) {
                warn!(identity = %object.identity(), error = %e, "orphan cleanup failed");
            }
        }

        if count > 0 {
            debug!(count, "retried orphaned file objects");
        }
        count
    }

    /// Queue the object for data writeback.
    pub fn mark_dirty(&self, object: &Arc<FileObject>) {
        object.insert_flags(FileObjectFlags::DIRTY_DATA);
        self.enqueue_dirty(object);
    }

    /// Queue the object for property writeback. Unlinked objects are never
    /// queued; their properties die with them.
    pub fn mark_properties_dirty(&self, object: &Arc<FileObject>) {
        object.insert_flags(FileObjectFlags::DIRTY_PROPERTIES);
        if object.hard_link_count() != 0 {
            self.enqueue_dirty(object);
        }
    }

    fn enqueue_dirty(&self, object: &Arc<FileObject>) {
        let mut lists = self.lists.lock();
        if object.membership() == ListMembership::None {
            self.add_reference(object);
            Self::push_dirty(&mut lists, object.clone());
        }
        drop(lists);
        self.flush_signal.notify();
    }

    /// Block devices go to the back so that files above them flush first.
    fn push_dirty(lists: &mut RegistryLists, object: Arc<FileObject>) {
        object.set_membership(ListMembership::Dirty);
        if object.object_type() == IoObjectType::BlockDevice {
            lists.dirty.push_back(object);
        } else {
            lists.dirty.push_front(object);
        }
    }

    /// Remove the dirty objects of `device` (all devices for `None`) from
    /// the dirty list, in flush order. Each carries the list's reference.
    pub(crate) fn take_dirty(&self, device: Option<DeviceId>) -> Vec<Arc<FileObject>> {
        let mut lists = self.lists.lock();
        let (taken, kept): (Vec<_>, Vec<_>) = lists
            .dirty
            .drain(..)
            .partition(|o| device.is_none_or(|d| o.identity().device_id == d));
        lists.dirty = kept.into();
        for object in &taken {
            object.set_membership(ListMembership::None);
        }
        taken
    }

    /// Put an object taken by [`Self::take_dirty`] back on the dirty list,
    /// transferring its reference. If something re-queued it meanwhile the
    /// surplus reference is dropped.
    pub(crate) fn requeue_dirty(&self, object: Arc<FileObject>) {
        let mut lists = self.lists.lock();
        if object.membership() == ListMembership::None {
            Self::push_dirty(&mut lists, object);
            return;
        }
        drop(lists);

        if let Err(e) = self.release_reference(&object, false) {
            warn!(identity = %object.identity(), error = %e, "failed to drop dirty list reference");
        }
    }

    /// Referenced snapshot of the live objects of one device
    pub(crate) fn objects_for_device(&self, device: DeviceId) -> Vec<Arc<FileObject>> {
        // Identities order by file first, so a device is not a contiguous range.
        let lists = self.lists.lock();
        lists
            .tree
            .iter()
            .filter(|(identity, o)| {
                identity.device_id == device
                    && o.state() == ObjectState::Live
                    && o.reference_count() > 0
            })
            .map(|(_, o)| {
                self.add_reference(o);
                o.clone()
            })
            .collect()
    }

    /// Lock several objects exclusively.
    ///
    /// Locks are taken in identity order with duplicates collapsed, so two
    /// callers locking overlapping sets cannot deadlock. Objects without an
    /// I/O lock are skipped. Dropping the guard releases in reverse order.
    #[must_use]
    pub fn acquire_io_locks_exclusive<'a>(
        &self,
        objects: &'a [Arc<FileObject>],
    ) -> MultiObjectLockGuard<'a> {
        let mut sorted: Vec<&'a FileObject> = objects.iter().map(AsRef::as_ref).collect();
        sorted.sort_by_key(|o| o.identity());
        sorted.dedup_by_key(|o| o.identity());

        let guards = sorted
            .into_iter()
            .filter_map(FileObject::io_lock)
            .map(|lock| lock.write())
            .collect();
        MultiObjectLockGuard { guards }
    }

    /// Release locks taken by [`Self::acquire_io_locks_exclusive`].
    pub fn release_io_locks(guard: MultiObjectLockGuard<'_>) {
        drop(guard);
    }

    /// A path entry now names the object.
    pub fn add_path_entry_reference(&self, object: &FileObject) {
        object.add_path_entry();
    }

    /// A path entry naming the object went away. When the last one goes and
    /// the file has no links left, its cached data is queued so the flush
    /// can discard it.
    pub fn release_path_entry_reference(&self, object: &Arc<FileObject>) {
        let old = object.remove_path_entry();
        debug_assert!(old != 0, "path entry count underflow");
        if old == 1 && object.hard_link_count() == 0 && object.object_type().is_cacheable() {
            self.mark_dirty(object);
        }
    }

    pub fn increment_hard_link_count(&self, object: &Arc<FileObject>) {
        object.with_properties(|p| {
            p.hard_link_count += 1;
            p.status_change_time = chrono::Utc::now();
        });
        self.mark_properties_dirty(object);
    }

    pub fn decrement_hard_link_count(&self, object: &Arc<FileObject>) -> Result<()> {
        object.with_properties(|p| {
            if p.hard_link_count == 0 {
                return Err(Error::invalid("hard link count already zero"));
            }
            p.hard_link_count -= 1;
            p.status_change_time = chrono::Utc::now();
            Ok(())
        })?;
        self.mark_properties_dirty(object);
        Ok(())
    }

    /// Stamp the access or modification time and queue the properties.
    pub fn update_file_object_time(&self, object: &Arc<FileObject>, kind: TimeKind) {
        object.touch_time(kind);
        self.mark_properties_dirty(object);
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let lists = self.lists.lock();
        RegistryStats {
            live_objects: lists.tree.len(),
            dirty_objects: lists.dirty.len(),
            orphaned_objects: lists.orphans.len(),
            created: self.counters.created.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            teardown_failures: self.counters.teardown_failures.load(Ordering::Relaxed),
            lookup_retries: self.counters.lookup_retries.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_object::SpecialIo;
    use cacheio_common::FileId;
    use cacheio_storage::{Completion, Fault, FileOperation, IoRequest, MemoryDevice};
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    fn setup() -> (FileObjectRegistry, Arc<MemoryDevice>) {
        (
            FileObjectRegistry::new(),
            Arc::new(MemoryDevice::new(DeviceId::new(1))),
        )
    }

    fn props(file: u64, object_type: IoObjectType) -> FileProperties {
        FileProperties::new(DeviceId::new(1), FileId::new(file), object_type, 0, 4096)
    }

    fn open(
        registry: &FileObjectRegistry,
        device: &Arc<MemoryDevice>,
        file: u64,
    ) -> (Arc<FileObject>, bool) {
        registry
            .create_or_lookup(
                &props(file, IoObjectType::RegularFile),
                device.clone(),
                FileObjectFlags::OPEN,
            )
            .unwrap()
    }

    #[test]
    fn test_create_then_lookup_shares_object() {
        let (registry, device) = setup();
        let (first, created) = open(&registry, &device, 1);
        assert!(created);
        assert_eq!(first.reference_count(), 2);

        let (second, created) = open(&registry, &device, 1);
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.reference_count(), 3);
        assert_eq!(registry.stats().live_objects, 1);
    }

    #[test]
    fn test_device_mismatch_rejected() {
        let (registry, _) = setup();
        let other = Arc::new(MemoryDevice::new(DeviceId::new(2)));
        let result = registry.create_or_lookup(
            &props(1, IoObjectType::RegularFile),
            other,
            FileObjectFlags::empty(),
        );
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_last_release_tears_down_once() {
        let (registry, device) = setup();
        let (file, _) = open(&registry, &device, 1);
        let (again, _) = open(&registry, &device, 1);

        registry.release_reference(&again, false).unwrap();
        assert_eq!(device.counters().closes.load(Ordering::Relaxed), 0);

        registry.release_reference(&file, false).unwrap();
        assert_eq!(file.reference_count(), 0);
        assert_eq!(file.state(), ObjectState::Destroyed);
        assert_eq!(device.counters().closes.load(Ordering::Relaxed), 1);
        assert_eq!(device.counters().deletes.load(Ordering::Relaxed), 0);

        let stats = registry.stats();
        assert_eq!(stats.live_objects, 0);
        assert_eq!(stats.destroyed, 1);
    }

    #[test]
    fn test_unlinked_file_deleted_at_teardown() {
        let (registry, device) = setup();
        let (file, _) = open(&registry, &device, 1);
        registry.decrement_hard_link_count(&file).unwrap();
        assert!(registry.decrement_hard_link_count(&file).is_err());

        registry.release_reference(&file, false).unwrap();
        assert_eq!(device.counters().deletes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_fail_if_last_keeps_reference() {
        let (registry, device) = setup();
        let (file, _) = open(&registry, &device, 1);

        let result = registry.release_reference(&file, true);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(file.reference_count(), 2);
        assert_eq!(file.state(), ObjectState::Live);

        registry.release_reference(&file, false).unwrap();
        assert_eq!(file.state(), ObjectState::Destroyed);
    }

    #[test]
    fn test_failed_close_parks_orphan_then_cleanup_recovers() {
        let (registry, device) = setup();
        let (file, _) = open(&registry, &device, 1);
        device.set_close_fault(Some(Fault::Failure));

        registry.release_reference(&file, false).unwrap();
        assert_eq!(file.reference_count(), 1);
        assert_eq!(file.state(), ObjectState::Live);
        assert!(file.flags().contains(FileObjectFlags::CLOSE_FAILED));
        assert_eq!(registry.stats().orphaned_objects, 1);
        assert_eq!(registry.stats().live_objects, 1);

        // Still failing: parked again
        assert_eq!(registry.cleanup_file_objects(), 1);
        assert_eq!(registry.stats().orphaned_objects, 1);

        device.set_close_fault(None);
        assert_eq!(registry.cleanup_file_objects(), 1);
        assert_eq!(file.state(), ObjectState::Destroyed);
        assert_eq!(registry.stats().orphaned_objects, 0);
        assert_eq!(registry.stats().live_objects, 0);
        assert_eq!(registry.stats().teardown_failures, 2);
    }

    #[test]
    fn test_lookup_revives_orphan() {
        let (registry, device) = setup();
        let (file, _) = open(&registry, &device, 1);
        device.set_close_fault(Some(Fault::Failure));
        registry.release_reference(&file, false).unwrap();
        assert_eq!(registry.stats().orphaned_objects, 1);

        let (again, created) = open(&registry, &device, 1);
        assert!(!created);
        assert!(Arc::ptr_eq(&file, &again));
        assert_eq!(again.reference_count(), 2);
        assert_eq!(registry.stats().orphaned_objects, 0);
    }

    #[test]
    fn test_disconnected_device_counts_as_closed() {
        let (registry, device) = setup();
        let (file, _) = open(&registry, &device, 1);
        device.set_close_fault(Some(Fault::NotConnected));

        registry.release_reference(&file, false).unwrap();
        assert_eq!(file.state(), ObjectState::Destroyed);
        assert_eq!(registry.stats().orphaned_objects, 0);
    }

    #[test]
    fn test_special_object_waits_for_creator() {
        let (registry, device) = setup();
        let registry = Arc::new(registry);
        let pipe_props = props(7, IoObjectType::Pipe);
        let (pipe, created) = registry
            .create_or_lookup(&pipe_props, device.clone(), FileObjectFlags::empty())
            .unwrap();
        assert!(created);
        assert!(!pipe.is_ready());

        let found = Arc::new(AtomicBool::new(false));
        let waiter = {
            let registry = registry.clone();
            let device = device.clone();
            let found = found.clone();
            thread::spawn(move || {
                let (object, created) = registry
                    .create_or_lookup(&pipe_props, device, FileObjectFlags::empty())
                    .unwrap();
                found.store(true, Ordering::SeqCst);
                (object, created)
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!found.load(Ordering::SeqCst));

        pipe.set_special_io(SpecialIo::Pipe(Arc::new(()))).unwrap();
        pipe.signal_ready();

        let (object, created) = waiter.join().unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&object, &pipe));
        assert!(object.special_io().is_some());
    }

    /// Holds every Close until the test lets it through.
    struct GatedCloseDevice {
        inner: MemoryDevice,
        entered: crossbeam_channel::Sender<()>,
        release: crossbeam_channel::Receiver<()>,
    }

    impl DeviceTransport for GatedCloseDevice {
        fn device_id(&self) -> DeviceId {
            self.inner.device_id()
        }

        fn read(&self, request: &IoRequest<'_>, buffer: &mut [u8]) -> Completion {
            self.inner.read(request, buffer)
        }

        fn write(&self, request: &IoRequest<'_>, buffer: &[u8]) -> Completion {
            self.inner.write(request, buffer)
        }

        fn file_operation(
            &self,
            properties: &FileProperties,
            operation: FileOperation<'_>,
            flags: IoFlags,
        ) -> Result<()> {
            if matches!(operation, FileOperation::Close) {
                let _ = self.entered.send(());
                let _ = self.release.recv();
            }
            self.inner.file_operation(properties, operation, flags)
        }
    }

    #[test]
    fn test_lookup_during_teardown_retries_with_new_object() {
        let registry = Arc::new(FileObjectRegistry::new());
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let device: Arc<dyn DeviceTransport> = Arc::new(GatedCloseDevice {
            inner: MemoryDevice::new(DeviceId::new(1)),
            entered: entered_tx,
            release: release_rx,
        });
        let file_props = props(5, IoObjectType::RegularFile);

        let (old, created) = registry
            .create_or_lookup(&file_props, device.clone(), FileObjectFlags::OPEN)
            .unwrap();
        assert!(created);

        let closer = {
            let registry = registry.clone();
            let old = old.clone();
            thread::spawn(move || registry.release_reference(&old, false))
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(old.state(), ObjectState::Closing);

        let opener = {
            let registry = registry.clone();
            let device = device.clone();
            let file_props = file_props.clone();
            thread::spawn(move || {
                registry
                    .create_or_lookup(&file_props, device, FileObjectFlags::OPEN)
                    .unwrap()
            })
        };

        // The opener holds a reference on the closing object and waits.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while old.reference_count() < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(old.reference_count(), 2);

        release_tx.send(()).unwrap();
        closer.join().unwrap().unwrap();
        let (fresh, created) = opener.join().unwrap();

        assert!(created);
        assert!(!Arc::ptr_eq(&fresh, &old));
        assert_eq!(old.state(), ObjectState::Destroyed);
        assert_eq!(fresh.state(), ObjectState::Live);
        assert_eq!(fresh.reference_count(), 2);

        let stats = registry.stats();
        assert!(stats.lookup_retries >= 1);
        assert_eq!(stats.destroyed, 1);
        assert_eq!(stats.live_objects, 1);
        assert!(Arc::ptr_eq(&registry.lookup(file_props.identity()).unwrap(), &fresh));
    }

    #[test]
    fn test_concurrent_open_creates_one_object() {
        let (registry, device) = setup();
        let registry = Arc::new(registry);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let device = device.clone();
                thread::spawn(move || {
                    registry
                        .create_or_lookup(
                            &props(3, IoObjectType::RegularFile),
                            device,
                            FileObjectFlags::empty(),
                        )
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        let first = &results[0].0;
        assert!(results.iter().all(|(o, _)| Arc::ptr_eq(o, first)));
        assert_eq!(first.reference_count(), 9);
    }

    #[test]
    fn test_open_close_churn_keeps_counts_balanced() {
        let (registry, device) = setup();
        let registry = Arc::new(registry);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let device = device.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let (object, _) = registry
                            .create_or_lookup(
                                &props(5, IoObjectType::RegularFile),
                                device.clone(),
                                FileObjectFlags::empty(),
                            )
                            .unwrap();
                        assert_ne!(object.state(), ObjectState::Destroyed);
                        registry.release_reference(&object, false).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = registry.stats();
        assert_eq!(stats.live_objects, 0);
        assert_eq!(stats.created, stats.destroyed);
    }

    #[test]
    fn test_mark_dirty_enqueues_once() {
        let (registry, device) = setup();
        let (file, _) = open(&registry, &device, 1);
        let before = registry.flush_signal().notifications();

        registry.mark_dirty(&file);
        registry.mark_dirty(&file);
        assert_eq!(registry.stats().dirty_objects, 1);
        assert_eq!(file.reference_count(), 3);
        assert_eq!(registry.flush_signal().notifications(), before + 2);
        assert!(registry.flush_signal().receiver().try_recv().is_ok());
    }

    #[test]
    fn test_block_devices_flush_last() {
        let (registry, device) = setup();
        let (disk, _) = registry
            .create_or_lookup(
                &props(100, IoObjectType::BlockDevice),
                device.clone(),
                FileObjectFlags::empty(),
            )
            .unwrap();
        let (a, _) = open(&registry, &device, 1);
        registry.mark_dirty(&disk);
        registry.mark_dirty(&a);
        let (b, _) = open(&registry, &device, 2);
        registry.mark_dirty(&b);

        let order: Vec<_> = registry
            .take_dirty(None)
            .iter()
            .map(|o| o.identity().file_id.as_u64())
            .collect();
        assert_eq!(order.last(), Some(&100));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_take_dirty_filters_by_device() {
        let registry = FileObjectRegistry::new();
        let one = Arc::new(MemoryDevice::new(DeviceId::new(1)));
        let two = Arc::new(MemoryDevice::new(DeviceId::new(2)));
        let (a, _) = open(&registry, &one, 1);
        let (b, _) = registry
            .create_or_lookup(
                &FileProperties::new(
                    DeviceId::new(2),
                    FileId::new(1),
                    IoObjectType::RegularFile,
                    0,
                    4096,
                ),
                two,
                FileObjectFlags::empty(),
            )
            .unwrap();
        registry.mark_dirty(&a);
        registry.mark_dirty(&b);

        let taken = registry.take_dirty(Some(DeviceId::new(2)));
        assert_eq!(taken.len(), 1);
        assert!(Arc::ptr_eq(&taken[0], &b));
        assert_eq!(registry.stats().dirty_objects, 1);

        registry.requeue_dirty(taken.into_iter().next().unwrap());
        assert_eq!(registry.stats().dirty_objects, 2);
    }

    #[test]
    fn test_unlinked_properties_not_queued() {
        let (registry, device) = setup();
        let (file, _) = open(&registry, &device, 1);
        file.with_properties(|p| p.hard_link_count = 0);

        registry.update_file_object_time(&file, TimeKind::Modify);
        assert!(file.flags().contains(FileObjectFlags::DIRTY_PROPERTIES));
        assert_eq!(registry.stats().dirty_objects, 0);
    }

    #[test]
    fn test_last_path_entry_of_unlinked_file_marks_dirty() {
        let (registry, device) = setup();
        let (file, _) = open(&registry, &device, 1);
        registry.add_path_entry_reference(&file);
        registry.add_path_entry_reference(&file);
        file.with_properties(|p| p.hard_link_count = 0);

        registry.release_path_entry_reference(&file);
        assert_eq!(registry.stats().dirty_objects, 0);
        registry.release_path_entry_reference(&file);
        assert_eq!(registry.stats().dirty_objects, 1);
        assert_eq!(file.path_entry_count(), 0);
    }

    #[test]
    fn test_multi_lock_orders_and_dedups() {
        let (registry, device) = setup();
        let (a, _) = open(&registry, &device, 2);
        let (b, _) = open(&registry, &device, 1);
        let (pipe, _) = registry
            .create_or_lookup(
                &props(3, IoObjectType::Pipe),
                device.clone(),
                FileObjectFlags::empty(),
            )
            .unwrap();

        let objects = vec![a.clone(), b.clone(), a.clone(), pipe];
        let guard = registry.acquire_io_locks_exclusive(&objects);
        assert_eq!(guard.len(), 2);
        assert!(a.io_lock().unwrap().is_locked_exclusive());
        FileObjectRegistry::release_io_locks(guard);
        assert!(!a.io_lock().unwrap().is_locked());
        assert!(!b.io_lock().unwrap().is_locked());
    }

    #[test]
    fn test_multi_lock_opposite_orders_do_not_deadlock() {
        let (registry, device) = setup();
        let registry = Arc::new(registry);
        let (a, _) = open(&registry, &device, 1);
        let (b, _) = open(&registry, &device, 2);

        let handles: Vec<_> = [vec![a.clone(), b.clone()], vec![b, a]]
            .into_iter()
            .map(|set| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let guard = registry.acquire_io_locks_exclusive(&set);
                        assert_eq!(guard.len(), 2);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
