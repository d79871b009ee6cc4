//! Subsystem wiring
//!
//! [`IoSubsystem`] owns one registry, engine, flush coordinator and size
//! manager over a shared page cache, plus the optional writeback worker.

use crate::cached_io::{CachedIoEngine, EngineStats};
use crate::file_object::FileObjectFlags;
use crate::flush::FlushCoordinator;
use crate::handle::{IoContext, IoHandle, OpenFlags};
use crate::registry::{FileObjectRegistry, RegistryStats};
use crate::size::SizeManager;
use crate::writeback::WritebackWorker;
use cacheio_common::{Config, DeviceId, Error, FileProperties, IoFlags, Result};
use cacheio_storage::{CacheStatsSnapshot, DeviceTransport, EvictionFlags, MemoryPageCache, PageCache};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Combined statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubsystemStats {
    pub registry: RegistryStats,
    pub engine: EngineStats,
    pub cache: CacheStatsSnapshot,
    pub dirty_pages: usize,
}

pub struct IoSubsystem {
    config: Config,
    registry: Arc<FileObjectRegistry>,
    cache: Arc<dyn PageCache>,
    sizes: Arc<SizeManager>,
    engine: Arc<CachedIoEngine>,
    flush: Arc<FlushCoordinator>,
    writeback: Option<WritebackWorker>,
}

impl IoSubsystem {
    /// Build the subsystem over `cache`.
    ///
    /// The cache's page size must match the configured one. The writeback
    /// worker starts if the configuration enables it.
    pub fn new(config: Config, cache: Arc<dyn PageCache>) -> Result<Self> {
        config.validate()?;
        if cache.page_size() != config.cache.page_size {
            return Err(Error::Configuration(format!(
                "page cache uses {}-byte pages, configuration says {}",
                cache.page_size(),
                config.cache.page_size
            )));
        }

        let registry = Arc::new(FileObjectRegistry::new());
        let sizes = Arc::new(SizeManager::new(registry.clone(), cache.clone()));
        let engine = Arc::new(CachedIoEngine::new(
            registry.clone(),
            cache.clone(),
            sizes.clone(),
            config.engine.clone(),
        ));
        let flush = Arc::new(FlushCoordinator::new(
            registry.clone(),
            engine.clone(),
            cache.clone(),
        ));

        let writeback = if config.writeback.enabled {
            Some(WritebackWorker::start(
                flush.clone(),
                registry.clone(),
                cache.clone(),
                config.writeback.clone(),
            )?)
        } else {
            None
        };

        info!(
            page_size = config.cache.page_size,
            writeback = writeback.is_some(),
            "io subsystem started"
        );

        Ok(Self {
            config,
            registry,
            cache,
            sizes,
            engine,
            flush,
            writeback,
        })
    }

    /// Build the subsystem over a fresh [`MemoryPageCache`].
    pub fn with_memory_cache(config: Config) -> Result<Self> {
        let cache = Arc::new(MemoryPageCache::new(config.cache.clone()));
        Self::new(config, cache)
    }

    /// Open the file described by `properties` on `device`. Every open of the
    /// same file shares one file object; each handle has its own position.
    pub fn open(
        &self,
        properties: &FileProperties,
        device: Arc<dyn DeviceTransport>,
        open_flags: OpenFlags,
    ) -> Result<IoHandle> {
        let (object, created) =
            self.registry
                .create_or_lookup(properties, device, FileObjectFlags::OPEN)?;
        debug!(identity = %object.identity(), created, "opened file");
        Ok(IoHandle::new(object, open_flags))
    }

    /// Close a handle, dropping its reference. The last close tears the
    /// file object down.
    pub fn close(&self, handle: IoHandle) -> Result<()> {
        self.registry.release_reference(handle.object(), false)
    }

    pub fn perform_io(&self, handle: &IoHandle, ctx: &mut IoContext) -> Result<()> {
        self.engine.perform_cacheable_io(handle, ctx)
    }

    pub fn modify_file_size(&self, handle: &IoHandle, new_size: u64) -> Result<()> {
        self.sizes.modify_file_size(handle.object(), new_size)
    }

    /// Flush one file's data and properties.
    pub fn flush(&self, handle: &IoHandle, flags: IoFlags) -> Result<()> {
        self.flush
            .flush_file_object(handle.object(), 0, None, flags)
    }

    pub fn flush_device(&self, device: DeviceId, flags: IoFlags) -> Result<()> {
        self.flush.flush_file_objects(Some(device), flags)
    }

    pub fn flush_all(&self, flags: IoFlags) -> Result<()> {
        self.flush.flush_file_objects(None, flags)
    }

    pub fn evict_device(&self, device: DeviceId, flags: EvictionFlags) -> usize {
        self.flush.evict_file_objects(device, flags)
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<FileObjectRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn engine(&self) -> &Arc<CachedIoEngine> {
        &self.engine
    }

    #[must_use]
    pub const fn flush_coordinator(&self) -> &Arc<FlushCoordinator> {
        &self.flush
    }

    #[must_use]
    pub const fn size_manager(&self) -> &Arc<SizeManager> {
        &self.sizes
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<dyn PageCache> {
        &self.cache
    }

    #[must_use]
    pub fn stats(&self) -> SubsystemStats {
        SubsystemStats {
            registry: self.registry.stats(),
            engine: self.engine.stats(),
            cache: self.cache.stats(),
            dirty_pages: self.cache.dirty_page_count(),
        }
    }

    /// Stop the writeback worker and flush what is left.
    pub fn shutdown(&self) {
        if let Some(worker) = &self.writeback {
            worker.shutdown();
        }

        if let Err(e) = self.flush_all(IoFlags::empty()) {
            warn!(error = %e, "final flush failed");
        }
        let orphans = self.registry.cleanup_file_objects();
        info!(orphans, "io subsystem stopped");
    }
}

impl Drop for IoSubsystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
