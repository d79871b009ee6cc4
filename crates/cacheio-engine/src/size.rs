//! File size management
//!
//! Writes only ever grow a file, lock-free. Explicit size changes take the
//! object's I/O lock exclusively, reach the device first and then trim the
//! cached pages and mappings past the new end.

use crate::file_object::{FileObject, TimeKind};
use crate::registry::FileObjectRegistry;
use cacheio_common::{Error, FileIdentity, IoFlags, Result, align_down, align_up};
use cacheio_storage::{EvictionFlags, FileOperation, PageCache};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct SizeManager {
    registry: Arc<FileObjectRegistry>,
    cache: Arc<dyn PageCache>,
}

impl SizeManager {
    pub fn new(registry: Arc<FileObjectRegistry>, cache: Arc<dyn PageCache>) -> Self {
        Self { registry, cache }
    }

    /// Grow the object to `new_size` after a write. Smaller sizes are
    /// ignored. Returns true if the size changed.
    pub fn update_file_size(&self, object: &Arc<FileObject>, new_size: u64) -> bool {
        let grown = object.grow_size(new_size);
        if grown {
            self.registry.mark_properties_dirty(object);
        }
        grown
    }

    /// Set the size of `object` to exactly `new_size`.
    ///
    /// The device is truncated or extended first; on failure the object is
    /// left as it was. Shrinking drops mappings and cache pages past the new
    /// end and zeroes the cached tail of the last page.
    pub fn modify_file_size(&self, object: &Arc<FileObject>, new_size: u64) -> Result<()> {
        if !object.object_type().is_cacheable() {
            return Err(Error::NotSupported(format!(
                "cannot resize a {:?} object",
                object.object_type()
            )));
        }

        let guard = object.lock_io(true);
        let old_size = object.size();
        if new_size == old_size {
            return Ok(());
        }

        object.set_size(new_size);
        let props = object.properties();
        let status = object.device().file_operation(
            &props,
            FileOperation::Truncate { new_size },
            IoFlags::empty(),
        );
        if let Err(e) = status {
            object.set_size(old_size);
            warn!(identity = %object.identity(), new_size, error = %e, "device truncate failed");
            return Err(e);
        }

        if new_size < old_size {
            let unmapped = object.unmap_beyond(new_size);
            let evicted = self.trim_cached_tail(object.identity(), new_size);
            debug!(
                identity = %object.identity(),
                old_size,
                new_size,
                unmapped,
                evicted,
                "shrunk file"
            );
        }
        drop(guard);

        self.registry
            .update_file_object_time(object, TimeKind::Modify);
        Ok(())
    }

    fn trim_cached_tail(&self, identity: FileIdentity, new_size: u64) -> usize {
        let page = self.cache.page_size() as u64;
        let tail = new_size % page;
        if tail != 0 {
            // Stale bytes past the end would come back if the file regrows.
            if let Some(entry) = self.cache.lookup(identity, align_down(new_size, page)) {
                let start = usize::try_from(tail).unwrap_or(0);
                entry.zero(start, self.cache.page_size() - start);
            }
        }

        self.cache
            .evict(identity, align_up(new_size, page), EvictionFlags::TRUNCATE)
    }
}
