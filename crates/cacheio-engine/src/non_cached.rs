//! Non-cached I/O path
//!
//! Moves bytes between an [`IoBuffer`] and the device, bypassing the page
//! cache. Device transfers are aligned to the object's I/O unit: the block
//! size for block devices, the page size for cached files, one byte for
//! everything else. Unaligned edges are handled by read-modify-write of the
//! enclosing block.

use crate::file_object::FileObject;
use cacheio_common::{Error, IoFlags, IoObjectType, align_down, align_up};
use cacheio_storage::{Completion, IoBuffer, IoRequest};
use std::time::Duration;
use tracing::trace;

/// Buffer-to-device transfer engine
#[derive(Debug, Clone, Copy)]
pub struct NonCachedIoPath {
    page_size: usize,
}

impl NonCachedIoPath {
    #[must_use]
    pub const fn new(page_size: usize) -> Self {
        Self { page_size }
    }

    /// Transfer unit of `object`
    #[must_use]
    pub fn alignment(&self, object: &FileObject) -> u64 {
        match object.object_type() {
            IoObjectType::BlockDevice => u64::from(object.block_size().max(1)),
            t if t.is_cacheable() => self.page_size as u64,
            _ => 1,
        }
    }

    fn request<'a>(
        properties: &'a cacheio_common::FileProperties,
        offset: u64,
        flags: IoFlags,
        timeout: Option<Duration>,
    ) -> IoRequest<'a> {
        IoRequest {
            properties,
            offset,
            flags,
            timeout,
        }
    }

    /// Read into a plain slice with a single device request.
    ///
    /// `offset` must already be aligned by the caller; the device clamps at
    /// the end of the object.
    pub fn read_aligned(
        &self,
        object: &FileObject,
        data: &mut [u8],
        offset: u64,
        flags: IoFlags,
        timeout: Option<Duration>,
    ) -> Completion {
        let props = object.properties();
        let done = object
            .device()
            .read(&Self::request(&props, offset, flags, timeout), data);
        assert!(
            done.bytes_completed <= data.len(),
            "device completed more bytes than requested"
        );
        done
    }

    /// Read `size` bytes at file `offset` into `buffer` at `buffer_offset`.
    #[allow(clippy::too_many_arguments)]
    pub fn read(
        &self,
        object: &FileObject,
        buffer: &mut IoBuffer,
        buffer_offset: usize,
        offset: u64,
        size: usize,
        flags: IoFlags,
        timeout: Option<Duration>,
    ) -> Completion {
        if size == 0 {
            return Completion::ok(0);
        }

        let align = self.alignment(object);
        let aligned_offset = align_down(offset, align);
        let head = usize::try_from(offset - aligned_offset).unwrap_or(0);
        let Ok(aligned_size) = usize::try_from(align_up((head + size) as u64, align)) else {
            return Completion::failed(0, Error::invalid("read size exceeds address space"));
        };

        // Aligned on both ends: read straight into the caller's memory.
        if head == 0 && aligned_size == size {
            if let Some(direct) = buffer.contiguous_mut(buffer_offset, size) {
                return self.read_aligned(object, direct, offset, flags, timeout);
            }
        }

        let mut bounce = vec![0u8; aligned_size];
        let done = self.read_aligned(object, &mut bounce, aligned_offset, flags, timeout);
        let copied = done.bytes_completed.saturating_sub(head).min(size);
        if copied > 0 {
            if let Err(e) = buffer.copy_from_slice(buffer_offset, &bounce[head..head + copied]) {
                return Completion::failed(0, e);
            }
        }

        match done.status {
            Err(e) if copied == 0 || !matches!(e, Error::EndOfFile) => Completion::failed(copied, e),
            Ok(()) if copied == 0 => Completion::failed(0, Error::EndOfFile),
            _ => Completion::ok(copied),
        }
    }

    /// Write `size` bytes from `buffer` at `buffer_offset` to file `offset`.
    ///
    /// A leading partial block is read, patched and written back. Whole
    /// blocks go out in one request. A trailing partial block rides along
    /// with the whole blocks when the write reaches end of file and the
    /// buffer extends far enough; otherwise it is patched like the head.
    /// The object size grows to cover every byte the device accepted.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        object: &FileObject,
        buffer: &IoBuffer,
        buffer_offset: usize,
        offset: u64,
        size: usize,
        flags: IoFlags,
        timeout: Option<Duration>,
    ) -> Completion {
        let align = self.alignment(object);
        let mut completed = 0usize;
        let mut position = offset;

        if position % align != 0 && size > 0 {
            let room = usize::try_from(align - position % align).unwrap_or(usize::MAX);
            let chunk = room.min(size);
            let done =
                self.write_partial_block(object, buffer, buffer_offset, position, chunk, flags, timeout);
            completed += done.bytes_completed;
            position += done.bytes_completed as u64;
            if done.status.is_err() {
                return Completion {
                    bytes_completed: completed,
                    status: done.status,
                };
            }
        }

        let remaining = size - completed;
        let align_bytes = usize::try_from(align).unwrap_or(usize::MAX);
        let mut block_bytes = remaining - remaining % align_bytes;
        if remaining > block_bytes {
            let room = buffer.len().saturating_sub(buffer_offset + completed);
            if position + remaining as u64 >= object.size() && room >= block_bytes + align_bytes {
                block_bytes += align_bytes;
            }
        }

        if block_bytes > 0 {
            let start = buffer_offset + completed;
            let owned;
            let data = match buffer.contiguous(start, block_bytes) {
                Some(slice) => slice,
                None => {
                    let mut copy = vec![0u8; block_bytes];
                    if let Err(e) = buffer.copy_to_slice(start, &mut copy) {
                        return Completion::failed(completed, e);
                    }
                    owned = copy;
                    &owned
                }
            };

            let props = object.properties();
            let done = object
                .device()
                .write(&Self::request(&props, position, flags, timeout), data);
            assert!(
                done.bytes_completed <= block_bytes,
                "device completed more bytes than requested"
            );

            // Bytes past the caller's range were padding.
            let accepted = done.bytes_completed.min(remaining);
            if accepted > 0 {
                object.grow_size(position + accepted as u64);
                completed += accepted;
                position += accepted as u64;
            }
            trace!(identity = %object.identity(), offset = position, bytes = accepted, "block write");
            if done.status.is_err() {
                return Completion {
                    bytes_completed: completed,
                    status: done.status,
                };
            }
        }

        let remaining = size - completed;
        if remaining > 0 {
            let done = self.write_partial_block(
                object,
                buffer,
                buffer_offset + completed,
                position,
                remaining,
                flags,
                timeout,
            );
            completed += done.bytes_completed;
            if done.status.is_err() {
                return Completion {
                    bytes_completed: completed,
                    status: done.status,
                };
            }
        }

        Completion::ok(completed)
    }

    /// Patch `size` bytes inside the block containing `offset`.
    #[allow(clippy::too_many_arguments)]
    fn write_partial_block(
        &self,
        object: &FileObject,
        buffer: &IoBuffer,
        buffer_offset: usize,
        offset: u64,
        size: usize,
        flags: IoFlags,
        timeout: Option<Duration>,
    ) -> Completion {
        let align = self.alignment(object);
        let block_offset = align_down(offset, align);
        let byte_offset = usize::try_from(offset - block_offset).unwrap_or(0);
        let Ok(block_len) = usize::try_from(align) else {
            return Completion::failed(0, Error::invalid("block size exceeds address space"));
        };

        let mut block = vec![0u8; block_len];
        let read = self.read_aligned(object, &mut block, block_offset, flags, timeout);
        match read.status {
            Ok(()) | Err(Error::EndOfFile) => {}
            Err(e) => return Completion::failed(0, e),
        }

        let end = byte_offset + size;
        if let Err(e) = buffer.copy_to_slice(buffer_offset, &mut block[byte_offset..end]) {
            return Completion::failed(0, e);
        }

        let props = object.properties();
        let done = object.device().write(
            &Self::request(&props, block_offset, flags, timeout),
            &block[..end],
        );
        assert!(
            done.bytes_completed <= end,
            "device completed more bytes than requested"
        );

        let completed = done.bytes_completed.saturating_sub(byte_offset).min(size);
        if completed > 0 {
            object.grow_size(offset + completed as u64);
        }

        Completion {
            bytes_completed: completed,
            status: done.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_object::FileObjectFlags;
    use cacheio_common::{DeviceId, FileId, FileProperties};
    use cacheio_storage::MemoryDevice;
    use std::sync::Arc;

    fn object(
        device: &Arc<MemoryDevice>,
        object_type: IoObjectType,
        size: u64,
        block_size: u32,
    ) -> FileObject {
        let props = FileProperties::new(DeviceId::new(1), FileId::new(1), object_type, size, block_size);
        FileObject::new(props, device.clone(), FileObjectFlags::empty())
    }

    #[test]
    fn test_alignment_by_type() {
        let device = Arc::new(MemoryDevice::new(DeviceId::new(1)));
        let path = NonCachedIoPath::new(4096);
        assert_eq!(path.alignment(&object(&device, IoObjectType::BlockDevice, 0, 512)), 512);
        assert_eq!(path.alignment(&object(&device, IoObjectType::RegularFile, 0, 512)), 4096);
        assert_eq!(path.alignment(&object(&device, IoObjectType::CharacterDevice, 0, 512)), 1);
    }

    #[test]
    fn test_unaligned_read() {
        let device = Arc::new(MemoryDevice::new(DeviceId::new(1)));
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        device.insert_file(FileId::new(1), data.clone());
        let disk = object(&device, IoObjectType::BlockDevice, 2000, 512);
        let path = NonCachedIoPath::new(4096);

        let mut buffer = IoBuffer::zeroed(700);
        let done = path.read(&disk, &mut buffer, 0, 300, 700, IoFlags::empty(), None);
        assert!(done.status.is_ok());
        assert_eq!(done.bytes_completed, 700);
        assert_eq!(buffer.to_vec(), data[300..1000]);
        assert_eq!(device.reads(), 1);
    }

    #[test]
    fn test_read_at_end_of_file() {
        let device = Arc::new(MemoryDevice::new(DeviceId::new(1)));
        device.insert_file(FileId::new(1), vec![5u8; 1000]);
        let disk = object(&device, IoObjectType::BlockDevice, 1000, 512);
        let path = NonCachedIoPath::new(4096);

        let mut buffer = IoBuffer::zeroed(512);
        let done = path.read(&disk, &mut buffer, 0, 900, 512, IoFlags::empty(), None);
        assert!(done.status.is_ok());
        assert_eq!(done.bytes_completed, 100);

        let done = path.read(&disk, &mut buffer, 0, 1000, 10, IoFlags::empty(), None);
        assert!(matches!(done.status, Err(Error::EndOfFile)));
        assert_eq!(done.bytes_completed, 0);
    }

    #[test]
    fn test_unaligned_write_preserves_neighbors() {
        let device = Arc::new(MemoryDevice::new(DeviceId::new(1)));
        device.insert_file(FileId::new(1), vec![0xaa; 2048]);
        let disk = object(&device, IoObjectType::BlockDevice, 2048, 512);
        let path = NonCachedIoPath::new(4096);

        let buffer = IoBuffer::from_vec(vec![0x11; 1000]);
        let done = path.write(&disk, &buffer, 0, 100, 1000, IoFlags::empty(), None);
        assert!(done.status.is_ok());
        assert_eq!(done.bytes_completed, 1000);

        let stored = device.contents(FileId::new(1)).unwrap();
        assert!(stored[..100].iter().all(|&b| b == 0xaa));
        assert!(stored[100..1100].iter().all(|&b| b == 0x11));
        assert!(stored[1100..].iter().all(|&b| b == 0xaa));
        assert_eq!(disk.size(), 2048);
    }

    #[test]
    fn test_tail_rides_with_blocks_at_end_of_file() {
        let device = Arc::new(MemoryDevice::new(DeviceId::new(1)));
        let file = object(&device, IoObjectType::BlockDevice, 0, 512);
        let path = NonCachedIoPath::new(4096);

        // Buffer covers a whole extra block, so one request suffices.
        let mut data = vec![7u8; 1024];
        data[700..].fill(0);
        let buffer = IoBuffer::from_vec(data);
        let done = path.write(&file, &buffer, 0, 0, 700, IoFlags::empty(), None);
        assert!(done.status.is_ok());
        assert_eq!(done.bytes_completed, 700);
        assert_eq!(device.writes(), 1);
        assert_eq!(file.size(), 700);
    }

    #[test]
    fn test_tail_patched_when_buffer_is_short() {
        let device = Arc::new(MemoryDevice::new(DeviceId::new(1)));
        let file = object(&device, IoObjectType::BlockDevice, 0, 512);
        let path = NonCachedIoPath::new(4096);

        let buffer = IoBuffer::from_vec(vec![7u8; 700]);
        let done = path.write(&file, &buffer, 0, 0, 700, IoFlags::empty(), None);
        assert!(done.status.is_ok());
        assert_eq!(done.bytes_completed, 700);
        assert_eq!(device.writes(), 2);
        assert_eq!(file.size(), 700);
        assert_eq!(device.contents(FileId::new(1)).unwrap(), vec![7u8; 700]);
    }

    #[test]
    fn test_short_write_reports_progress() {
        let device = Arc::new(MemoryDevice::new(DeviceId::new(1)));
        device.set_write_limit(Some(1024));
        let file = object(&device, IoObjectType::BlockDevice, 0, 512);
        let path = NonCachedIoPath::new(4096);

        let buffer = IoBuffer::from_vec(vec![1u8; 2048]);
        let done = path.write(&file, &buffer, 0, 0, 2048, IoFlags::empty(), None);
        assert!(done.status.is_err());
        assert_eq!(done.bytes_completed, 1024);
        assert_eq!(file.size(), 1024);
    }
}
