//! cacheio Engine - File objects and cached I/O
//!
//! This crate implements the I/O layer between open handles and devices:
//! - The file object registry (one object per device/file pair, reference
//!   counted, with dirty and orphan lists)
//! - Cached reads and writes through the page cache
//! - Direct device I/O for objects that bypass the cache
//! - Flushing of dirty data and properties, and size changes
//! - A background writeback worker
//!
//! ```text
//!   IoHandle --> CachedIoEngine --> PageCache
//!                     |                 |
//!                     |           FlushCoordinator <-- WritebackWorker
//!                     v                 |
//!              NonCachedIoPath --> DeviceTransport
//! ```

pub mod cached_io;
pub mod file_object;
pub mod flush;
pub mod handle;
pub mod non_cached;
pub mod registry;
pub mod size;
pub mod subsystem;
pub mod writeback;

// Re-exports
pub use cached_io::{CachedIoEngine, EngineStats};
pub use file_object::{
    FileObject, FileObjectFlags, IoLockGuard, IoState, MappedRegion, ObjectState, PollEvents,
    ReadyEvent, SpecialIo, SpecialPayload, TimeKind,
};
pub use flush::FlushCoordinator;
pub use handle::{IoContext, IoHandle, OpenFlags};
pub use non_cached::NonCachedIoPath;
pub use registry::{FileObjectRegistry, FlushSignal, MultiObjectLockGuard, RegistryStats};
pub use size::SizeManager;
pub use subsystem::{IoSubsystem, SubsystemStats};
pub use writeback::WritebackWorker;
