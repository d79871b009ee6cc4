//! Core type definitions for cacheio
//!
//! This module defines object identities, object types, I/O flags and the
//! property record carried by every file object.

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of the device (or volume) that owns a file
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct DeviceId(u64);

impl DeviceId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

/// Identifier of a file, unique within its device
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct FileId(u64);

impl FileId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

/// The (device, file) pair naming exactly one file object.
///
/// Ordering compares the file ID first and the device ID second. Field order
/// matters here: the derived `Ord` follows it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub file_id: FileId,
    pub device_id: DeviceId,
}

impl FileIdentity {
    #[must_use]
    pub const fn new(device_id: DeviceId, file_id: FileId) -> Self {
        Self { file_id, device_id }
    }
}

impl fmt::Debug for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileIdentity({}:{})", self.device_id, self.file_id)
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_id, self.file_id)
    }
}

/// Kind of object behind a file object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoObjectType {
    RegularFile,
    Directory,
    BlockDevice,
    CharacterDevice,
    Pipe,
    Socket,
    TerminalMaster,
    TerminalSlave,
    SharedMemoryObject,
    SymbolicLink,
    ObjectDirectory,
}

impl IoObjectType {
    /// File-like types whose data lives in the page cache above a device
    #[must_use]
    pub const fn is_cacheable_file(self) -> bool {
        matches!(
            self,
            Self::RegularFile | Self::SymbolicLink | Self::SharedMemoryObject
        )
    }

    /// Types whose I/O goes through the page cache
    #[must_use]
    pub const fn is_cacheable(self) -> bool {
        matches!(self, Self::BlockDevice) || self.is_cacheable_file()
    }

    /// Types whose cache pages may share physical pages with another layer
    #[must_use]
    pub const fn is_linkable(self) -> bool {
        self.is_cacheable()
    }

    /// Types that carry a special I/O payload and are readied by their creator
    #[must_use]
    pub const fn is_special(self) -> bool {
        matches!(
            self,
            Self::Pipe
                | Self::Socket
                | Self::TerminalMaster
                | Self::TerminalSlave
                | Self::SharedMemoryObject
        )
    }
}

bitflags! {
    /// Per-call I/O flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct IoFlags: u32 {
        /// Data must reach the device before the call completes
        const DATA_SYNCHRONIZED = 1 << 0;
        /// Metadata must reach the device before the call completes
        const METADATA_SYNCHRONIZED = 1 << 1;
        /// Do not update the access time
        const NO_ACCESS_TIME = 1 << 2;
        /// I/O issued by a file system on behalf of its own data
        const FS_DATA = 1 << 3;
        /// I/O issued by a file system on behalf of its own metadata
        const FS_METADATA = 1 << 4;
        const NON_BLOCKING = 1 << 5;
    }
}

impl IoFlags {
    /// Both synchronization flags
    pub const SYNCHRONIZED: Self = Self::DATA_SYNCHRONIZED.union(Self::METADATA_SYNCHRONIZED);
}

/// Persisted properties of a file or device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProperties {
    pub device_id: DeviceId,
    pub file_id: FileId,
    pub object_type: IoObjectType,
    /// Size in bytes
    pub size: u64,
    /// Block size of the backing device in bytes
    pub block_size: u32,
    /// Number of blocks the file occupies
    pub block_count: u64,
    pub hard_link_count: u32,
    pub access_time: DateTime<Utc>,
    pub modified_time: DateTime<Utc>,
    pub status_change_time: DateTime<Utc>,
}

impl FileProperties {
    /// Create properties for a new object, stamped with the current time.
    #[must_use]
    pub fn new(
        device_id: DeviceId,
        file_id: FileId,
        object_type: IoObjectType,
        size: u64,
        block_size: u32,
    ) -> Self {
        let now = Utc::now();
        let mut props = Self {
            device_id,
            file_id,
            object_type,
            size,
            block_size,
            block_count: 0,
            hard_link_count: 1,
            access_time: now,
            modified_time: now,
            status_change_time: now,
        };

        props.block_count = props.blocks_for(size);
        props
    }

    #[must_use]
    pub const fn identity(&self) -> FileIdentity {
        FileIdentity::new(self.device_id, self.file_id)
    }

    /// Number of blocks needed to hold `size` bytes
    #[must_use]
    pub const fn blocks_for(&self, size: u64) -> u64 {
        if self.block_size == 0 {
            return 0;
        }

        size.div_ceil(self.block_size as u64)
    }
}

/// Round `value` down to a multiple of `align` (a non-zero value).
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value - value % align
}

/// Round `value` up to a multiple of `align` (a non-zero value), saturating.
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    match value % align {
        0 => value,
        rem => value.saturating_add(align - rem),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_ordering() {
        let a = FileIdentity::new(DeviceId::new(9), FileId::new(1));
        let b = FileIdentity::new(DeviceId::new(1), FileId::new(2));
        let c = FileIdentity::new(DeviceId::new(2), FileId::new(2));

        // File ID dominates, device ID breaks ties
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.to_string(), "9:1");
    }

    #[test]
    fn test_object_type_classes() {
        assert!(IoObjectType::RegularFile.is_cacheable());
        assert!(IoObjectType::BlockDevice.is_cacheable());
        assert!(!IoObjectType::BlockDevice.is_cacheable_file());
        assert!(IoObjectType::SharedMemoryObject.is_cacheable_file());
        assert!(!IoObjectType::Pipe.is_cacheable());
        assert!(!IoObjectType::CharacterDevice.is_cacheable());
        assert!(IoObjectType::Socket.is_special());
        assert!(!IoObjectType::RegularFile.is_special());
    }

    #[test]
    fn test_properties_block_count() {
        let props = FileProperties::new(
            DeviceId::new(1),
            FileId::new(7),
            IoObjectType::RegularFile,
            10_000,
            512,
        );

        assert_eq!(props.block_count, 20);
        assert_eq!(props.hard_link_count, 1);
        assert_eq!(props.identity(), FileIdentity::new(DeviceId::new(1), FileId::new(7)));
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_up(8192, 4096), 8192);
        assert_eq!(align_up(u64::MAX, 4096), u64::MAX);
    }

    #[test]
    fn test_io_flags() {
        let flags = IoFlags::SYNCHRONIZED;
        assert!(flags.contains(IoFlags::DATA_SYNCHRONIZED));
        assert!(flags.contains(IoFlags::METADATA_SYNCHRONIZED));
        assert!(!flags.contains(IoFlags::FS_DATA));
    }
}
