//! Dirty object flushing
//!
//! Objects queued on the registry's dirty list are taken off in one batch,
//! flushed data first and properties second, and released. A failure puts the
//! failed object and everything not yet processed back on the list.

use crate::cached_io::CachedIoEngine;
use crate::file_object::{FileObject, FileObjectFlags};
use crate::registry::FileObjectRegistry;
use cacheio_common::{DeviceId, IoFlags, Result};
use cacheio_storage::{EvictionFlags, FileOperation, PageCache};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct FlushCoordinator {
    registry: Arc<FileObjectRegistry>,
    engine: Arc<CachedIoEngine>,
    cache: Arc<dyn PageCache>,
}

impl FlushCoordinator {
    pub fn new(
        registry: Arc<FileObjectRegistry>,
        engine: Arc<CachedIoEngine>,
        cache: Arc<dyn PageCache>,
    ) -> Self {
        Self {
            registry,
            engine,
            cache,
        }
    }

    /// Flush the cached data in `[offset, offset + size)` of one object, then
    /// its properties. `None` flushes to the end of the object.
    ///
    /// An object no longer reachable through any link or path entry has its
    /// pages dropped instead of written.
    pub fn flush_file_object(
        &self,
        object: &Arc<FileObject>,
        offset: u64,
        size: Option<u64>,
        flags: IoFlags,
    ) -> Result<()> {
        if object.object_type().is_cacheable() {
            let guard = object.lock_io(false);
            if object.hard_link_count() == 0 && object.path_entry_count() == 0 {
                let dropped = self
                    .cache
                    .evict(object.identity(), 0, EvictionFlags::REMOVE);
                object.remove_flags(FileObjectFlags::DIRTY_DATA | FileObjectFlags::DIRTY_PROPERTIES);
                debug!(identity = %object.identity(), dropped, "discarded pages of unlinked file");
                return Ok(());
            }

            self.engine.flush_cached_pages(object, offset, size, flags)?;
            drop(guard);
        }

        self.flush_properties(object, flags)
    }

    /// Write the object's properties to the device if they changed.
    pub fn flush_properties(&self, object: &Arc<FileObject>, flags: IoFlags) -> Result<()> {
        if !object.take_flag(FileObjectFlags::DIRTY_PROPERTIES) {
            return Ok(());
        }
        if object.hard_link_count() == 0 {
            return Ok(());
        }

        let props = object.properties();
        match object
            .device()
            .file_operation(&props, FileOperation::WriteProperties(&props), flags)
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_teardown_success() => {
                debug!(identity = %object.identity(), "device gone; properties dropped");
                Ok(())
            }
            Err(e) => {
                self.registry.mark_properties_dirty(object);
                Err(e)
            }
        }
    }

    /// Flush every dirty object of `device`, or of all devices for `None`.
    ///
    /// A synchronized flush of the whole cache first writes everything
    /// without synchronization, then repeats with it for whatever was
    /// dirtied meanwhile.
    pub fn flush_file_objects(&self, device: Option<DeviceId>, flags: IoFlags) -> Result<()> {
        if device.is_none() && flags.contains(IoFlags::DATA_SYNCHRONIZED) {
            self.flush_pass(None, flags.difference(IoFlags::DATA_SYNCHRONIZED))?;
        }

        self.flush_pass(device, flags)
    }

    fn flush_pass(&self, device: Option<DeviceId>, flags: IoFlags) -> Result<()> {
        let objects = self.registry.take_dirty(device);
        if objects.is_empty() {
            return Ok(());
        }

        debug!(count = objects.len(), ?device, ?flags, "flush pass");
        let mut pending = objects.into_iter();
        while let Some(object) = pending.next() {
            object.remove_flags(FileObjectFlags::DIRTY_DATA);
            if let Err(e) = self.flush_file_object(&object, 0, None, flags) {
                warn!(identity = %object.identity(), error = %e, "flush failed, requeueing");
                if object.object_type().is_cacheable() {
                    object.insert_flags(FileObjectFlags::DIRTY_DATA);
                }
                self.registry.requeue_dirty(object);
                for rest in pending {
                    self.registry.requeue_dirty(rest);
                }
                self.registry.flush_signal().notify();
                return Err(e);
            }

            if let Err(e) = self.registry.release_reference(&object, false) {
                warn!(identity = %object.identity(), error = %e, "failed to drop dirty list reference");
            }
        }

        Ok(())
    }

    /// Drop the cached pages of every live object on `device`, holding all
    /// their locks exclusively. Returns the pages evicted.
    pub fn evict_file_objects(&self, device: DeviceId, flags: EvictionFlags) -> usize {
        let objects = self.registry.objects_for_device(device);
        let guard = self.registry.acquire_io_locks_exclusive(&objects);
        let evicted = objects
            .iter()
            .map(|object| self.cache.evict(object.identity(), 0, flags))
            .sum();
        FileObjectRegistry::release_io_locks(guard);

        for object in &objects {
            if let Err(e) = self.registry.release_reference(object, false) {
                warn!(identity = %object.identity(), error = %e, "failed to drop eviction reference");
            }
        }

        debug!(%device, objects = objects.len(), evicted, "evicted device pages");
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{IoContext, IoHandle, OpenFlags};
    use crate::size::SizeManager;
    use cacheio_common::{EngineConfig, FileId, FileProperties, IoObjectType, PageCacheConfig};
    use cacheio_storage::{DeviceTransport, Fault, IoBuffer, MemoryDevice, MemoryPageCache};
    use std::sync::atomic::Ordering;

    const PAGE: usize = 4096;

    struct Fixture {
        registry: Arc<FileObjectRegistry>,
        cache: Arc<MemoryPageCache>,
        engine: Arc<CachedIoEngine>,
        flush: FlushCoordinator,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(FileObjectRegistry::new());
            let cache = Arc::new(MemoryPageCache::new(PageCacheConfig::default()));
            let sizes = Arc::new(SizeManager::new(registry.clone(), cache.clone()));
            let engine = Arc::new(CachedIoEngine::new(
                registry.clone(),
                cache.clone(),
                sizes,
                EngineConfig::default(),
            ));
            let flush = FlushCoordinator::new(registry.clone(), engine.clone(), cache.clone());
            Self {
                registry,
                cache,
                engine,
                flush,
            }
        }

        fn open(&self, device: &Arc<MemoryDevice>, file: u64, object_type: IoObjectType) -> IoHandle {
            device.insert_file(FileId::new(file), Vec::new());
            let props = FileProperties::new(device.device_id(), FileId::new(file), object_type, 0, 4096);
            let (object, _) = self
                .registry
                .create_or_lookup(&props, device.clone(), FileObjectFlags::OPEN)
                .unwrap();
            IoHandle::new(object, OpenFlags::empty())
        }

        fn write(&self, handle: &IoHandle, offset: u64, data: &[u8], flags: IoFlags) {
            let mut ctx = IoContext::write(IoBuffer::from_vec(data.to_vec()), Some(offset), data.len())
                .with_flags(flags);
            self.engine.perform_cacheable_io(handle, &mut ctx).unwrap();
        }
    }

    fn device(id: u64) -> Arc<MemoryDevice> {
        Arc::new(MemoryDevice::new(DeviceId::new(id)))
    }

    #[test]
    fn test_flush_writes_data_and_properties() {
        let fx = Fixture::new();
        let dev = device(1);
        let handle = fx.open(&dev, 1, IoObjectType::RegularFile);
        fx.write(&handle, 0, &[5u8; 3 * PAGE], IoFlags::empty());
        assert_eq!(fx.registry.stats().dirty_objects, 1);
        assert_eq!(handle.object().reference_count(), 3);

        fx.flush.flush_file_objects(None, IoFlags::empty()).unwrap();
        assert_eq!(dev.contents(FileId::new(1)).unwrap(), vec![5u8; 3 * PAGE]);
        assert_eq!(dev.stored_properties(FileId::new(1)).unwrap().size, 3 * PAGE as u64);
        assert_eq!(fx.registry.stats().dirty_objects, 0);
        assert_eq!(fx.cache.dirty_page_count(), 0);
        assert_eq!(handle.object().reference_count(), 2);
        assert!(!handle.object().flags().intersects(
            FileObjectFlags::DIRTY_DATA | FileObjectFlags::DIRTY_PROPERTIES
        ));
    }

    #[test]
    fn test_synchronized_write_needs_no_flush() {
        let fx = Fixture::new();
        let dev = device(1);
        let handle = fx.open(&dev, 1, IoObjectType::RegularFile);
        fx.write(&handle, 100, &[9u8; 2 * PAGE], IoFlags::DATA_SYNCHRONIZED);
        let writes = dev.writes();

        fx.flush.flush_file_objects(None, IoFlags::empty()).unwrap();
        assert_eq!(dev.writes(), writes);
        fx.flush
            .flush_file_object(handle.object(), 0, None, IoFlags::DATA_SYNCHRONIZED)
            .unwrap();
        assert_eq!(dev.writes(), writes);
    }

    #[test]
    fn test_flush_twice_writes_once() {
        let fx = Fixture::new();
        let dev = device(1);
        let handle = fx.open(&dev, 1, IoObjectType::RegularFile);
        fx.write(&handle, 0, b"hello", IoFlags::empty());
        fx.registry.mark_dirty(handle.object());
        fx.registry.mark_dirty(handle.object());
        assert_eq!(handle.object().reference_count(), 3);

        fx.flush.flush_file_objects(None, IoFlags::empty()).unwrap();
        let writes = dev.writes();
        assert_eq!(writes, 1);
        fx.flush.flush_file_objects(None, IoFlags::empty()).unwrap();
        assert_eq!(dev.writes(), writes);
        assert_eq!(&dev.contents(FileId::new(1)).unwrap()[..5], b"hello");
    }

    #[test]
    fn test_property_failure_requeues_rest() {
        let fx = Fixture::new();
        let dev = device(1);
        let first = fx.open(&dev, 1, IoObjectType::RegularFile);
        let second = fx.open(&dev, 2, IoObjectType::RegularFile);
        fx.write(&first, 0, b"one", IoFlags::empty());
        fx.write(&second, 0, b"two", IoFlags::empty());
        dev.set_properties_fault(Some(Fault::Failure));
        let notified = fx.registry.flush_signal().notifications();

        assert!(fx.flush.flush_file_objects(None, IoFlags::empty()).is_err());
        assert_eq!(fx.registry.stats().dirty_objects, 2);
        assert!(fx.registry.flush_signal().notifications() > notified);
        assert_eq!(first.object().reference_count(), 3);
        assert_eq!(second.object().reference_count(), 3);

        dev.set_properties_fault(None);
        fx.flush.flush_file_objects(None, IoFlags::empty()).unwrap();
        assert_eq!(fx.registry.stats().dirty_objects, 0);
        assert!(dev.stored_properties(FileId::new(1)).is_some());
        assert!(dev.stored_properties(FileId::new(2)).is_some());
        assert_eq!(first.object().reference_count(), 2);
        assert_eq!(second.object().reference_count(), 2);
    }

    #[test]
    fn test_disconnected_device_drops_properties() {
        let fx = Fixture::new();
        let dev = device(1);
        let handle = fx.open(&dev, 1, IoObjectType::RegularFile);
        fx.registry.mark_properties_dirty(handle.object());
        dev.set_properties_fault(Some(Fault::NotConnected));

        fx.flush.flush_file_objects(None, IoFlags::empty()).unwrap();
        assert_eq!(fx.registry.stats().dirty_objects, 0);
        assert!(!handle.object().flags().contains(FileObjectFlags::DIRTY_PROPERTIES));
    }

    #[test]
    fn test_unlinked_file_pages_are_discarded() {
        let fx = Fixture::new();
        let dev = device(1);
        let handle = fx.open(&dev, 1, IoObjectType::RegularFile);
        fx.registry.add_path_entry_reference(handle.object());
        fx.write(&handle, 0, &[1u8; PAGE], IoFlags::empty());
        fx.registry.decrement_hard_link_count(handle.object()).unwrap();
        fx.registry.release_path_entry_reference(handle.object());

        fx.flush.flush_file_objects(None, IoFlags::empty()).unwrap();
        assert_eq!(dev.writes(), 0);
        assert_eq!(dev.counters().property_writes.load(Ordering::Relaxed), 0);
        assert_eq!(fx.cache.pages_for(handle.object().identity()), 0);
        assert_eq!(fx.cache.dirty_page_count(), 0);
    }

    #[test]
    fn test_flush_by_device() {
        let fx = Fixture::new();
        let (dev1, dev2) = (device(1), device(2));
        let a = fx.open(&dev1, 1, IoObjectType::RegularFile);
        let b = fx.open(&dev2, 1, IoObjectType::RegularFile);
        fx.write(&a, 0, b"aaaa", IoFlags::empty());
        fx.write(&b, 0, b"bbbb", IoFlags::empty());

        fx.flush
            .flush_file_objects(Some(DeviceId::new(2)), IoFlags::empty())
            .unwrap();
        assert_eq!(dev1.writes(), 0);
        assert_eq!(dev2.writes(), 1);
        assert_eq!(fx.registry.stats().dirty_objects, 1);
        assert!(fx.cache.dirty_page_count() > 0);
    }

    #[test]
    fn test_synchronized_flush_of_everything() {
        let fx = Fixture::new();
        let dev = device(1);
        let file = fx.open(&dev, 1, IoObjectType::RegularFile);
        fx.write(&file, 0, &[3u8; 2 * PAGE], IoFlags::empty());

        fx.flush
            .flush_file_objects(None, IoFlags::DATA_SYNCHRONIZED)
            .unwrap();
        assert_eq!(dev.contents(FileId::new(1)).unwrap(), vec![3u8; 2 * PAGE]);
        assert_eq!(fx.registry.stats().dirty_objects, 0);
        assert_eq!(fx.cache.dirty_page_count(), 0);
    }

    #[test]
    fn test_evict_by_device() {
        let fx = Fixture::new();
        let (dev1, dev2) = (device(1), device(2));
        let a = fx.open(&dev1, 1, IoObjectType::RegularFile);
        let b = fx.open(&dev1, 2, IoObjectType::RegularFile);
        let c = fx.open(&dev2, 1, IoObjectType::RegularFile);
        for handle in [&a, &b, &c] {
            fx.write(handle, 0, &[4u8; PAGE], IoFlags::DATA_SYNCHRONIZED);
        }

        let evicted = fx.flush.evict_file_objects(DeviceId::new(1), EvictionFlags::empty());
        assert_eq!(evicted, 2);
        assert_eq!(fx.cache.pages_for(a.object().identity()), 0);
        assert_eq!(fx.cache.pages_for(b.object().identity()), 0);
        assert_eq!(fx.cache.pages_for(c.object().identity()), 1);
        assert_eq!(a.object().reference_count(), b.object().reference_count());
    }
}
