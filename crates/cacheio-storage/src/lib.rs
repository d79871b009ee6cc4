//! cacheio Storage - collaborators of the cached I/O engine
//!
//! This crate provides the pieces the engine consumes rather than owns:
//! - I/O buffers built from plain memory and cache pages
//! - The page cache entry store (trait plus an in-memory implementation)
//! - Device transports (trait, in-memory device, directory-backed device)
//! - Positioned host file I/O

pub mod device;
pub mod file_device;
pub mod io_buffer;
pub mod page_cache;
pub mod raw_io;

// Re-exports
pub use device::{Completion, DeviceCounters, DeviceTransport, Fault, FileOperation, IoRequest, MemoryDevice};
pub use file_device::FileDevice;
pub use io_buffer::IoBuffer;
pub use page_cache::{
    CacheEntry, CacheStats, CacheStatsSnapshot, EvictionFlags, MemoryPageCache, PageCache,
    PageFrame,
};
pub use raw_io::RawFile;
