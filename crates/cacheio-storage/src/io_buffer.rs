//! I/O buffers
//!
//! An [`IoBuffer`] is an ordered list of fragments. A fragment is either plain
//! memory or a whole page borrowed from the page cache, which lets a read hand
//! cache pages to the caller without copying and lets a write recognize a
//! source that already lives in the cache.

use crate::page_cache::CacheEntry;
use cacheio_common::{Error, Result};
use std::sync::Arc;

enum Fragment {
    Memory(Vec<u8>),
    Page { entry: Arc<CacheEntry>, len: usize },
}

impl Fragment {
    fn len(&self) -> usize {
        match self {
            Self::Memory(data) => data.len(),
            Self::Page { len, .. } => *len,
        }
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        match self {
            Self::Memory(data) => dst.copy_from_slice(&data[offset..offset + dst.len()]),
            Self::Page { entry, .. } => entry.read(offset, dst),
        }
    }

    fn write(&mut self, offset: usize, src: &[u8]) {
        match self {
            Self::Memory(data) => data[offset..offset + src.len()].copy_from_slice(src),
            Self::Page { entry, .. } => entry.write(offset, src),
        }
    }

    fn zero(&mut self, offset: usize, len: usize) {
        match self {
            Self::Memory(data) => data[offset..offset + len].fill(0),
            Self::Page { entry, .. } => entry.zero(offset, len),
        }
    }
}

/// Buffer handed to and from the I/O paths
pub struct IoBuffer {
    fragments: Vec<Fragment>,
    len: usize,
    page_aligned: bool,
    extendable: bool,
}

impl IoBuffer {
    /// Wrap caller memory
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            fragments: vec![Fragment::Memory(data)],
            len,
            page_aligned: false,
            extendable: false,
        }
    }

    /// Zero-filled caller memory of `len` bytes
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    /// Zero-filled memory allocated as whole, page-aligned pages.
    ///
    /// `len` is rounded up to a multiple of `page_size`.
    #[must_use]
    pub fn page_aligned(len: usize, page_size: usize) -> Self {
        let pages = len.div_ceil(page_size);
        Self {
            fragments: (0..pages)
                .map(|_| Fragment::Memory(vec![0u8; page_size]))
                .collect(),
            len: pages * page_size,
            page_aligned: true,
            extendable: false,
        }
    }

    /// An empty buffer that grows by appending pages
    #[must_use]
    pub const fn extendable() -> Self {
        Self {
            fragments: Vec::new(),
            len: 0,
            page_aligned: true,
            extendable: true,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Every fragment starts on a page boundary of the buffer
    #[must_use]
    pub const fn is_page_aligned(&self) -> bool {
        self.page_aligned
    }

    #[must_use]
    pub const fn is_extendable(&self) -> bool {
        self.extendable
    }

    /// Append a whole cache page to an extendable buffer.
    pub fn append_page(&mut self, entry: Arc<CacheEntry>, page_size: usize) -> Result<()> {
        if !self.extendable {
            return Err(Error::invalid("cannot append a page to a fixed buffer"));
        }

        self.fragments.push(Fragment::Page {
            entry,
            len: page_size,
        });
        self.len += page_size;
        Ok(())
    }

    /// Append plain memory to an extendable buffer.
    pub fn append_memory(&mut self, data: Vec<u8>) -> Result<()> {
        if !self.extendable {
            return Err(Error::invalid("cannot append memory to a fixed buffer"));
        }

        self.page_aligned = false;
        self.len += data.len();
        self.fragments.push(Fragment::Memory(data));
        Ok(())
    }

    /// The cache page that starts exactly at `offset`, if any.
    #[must_use]
    pub fn page_entry_at(&self, offset: usize) -> Option<&Arc<CacheEntry>> {
        let mut start = 0;
        for fragment in &self.fragments {
            if start == offset {
                return match fragment {
                    Fragment::Page { entry, .. } => Some(entry),
                    Fragment::Memory(_) => None,
                };
            }

            start += fragment.len();
            if start > offset {
                return None;
            }
        }

        None
    }

    fn locate(&self, offset: usize, len: usize) -> Option<(usize, usize)> {
        let mut start = 0;
        for (index, fragment) in self.fragments.iter().enumerate() {
            let end = start + fragment.len();
            if offset >= start && offset + len <= end {
                return Some((index, offset - start));
            }
            if end > offset {
                return None;
            }
            start = end;
        }
        None
    }

    /// Borrow `[offset, offset + len)` directly if it lies inside one plain
    /// memory fragment.
    #[must_use]
    pub fn contiguous(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let (index, inner) = self.locate(offset, len)?;
        match &self.fragments[index] {
            Fragment::Memory(data) => Some(&data[inner..inner + len]),
            Fragment::Page { .. } => None,
        }
    }

    /// Mutable form of [`Self::contiguous`].
    pub fn contiguous_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        let (index, inner) = self.locate(offset, len)?;
        match &mut self.fragments[index] {
            Fragment::Memory(data) => Some(&mut data[inner..inner + len]),
            Fragment::Page { .. } => None,
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::invalid(format!(
                "range {offset}+{len} exceeds buffer of {} bytes",
                self.len
            ))),
        }
    }

    /// Walk the fragments overlapping `[offset, offset + len)`, passing each
    /// fragment, the offset within it, the offset within the range and the
    /// length of the overlap.
    fn for_each_span(
        &mut self,
        offset: usize,
        len: usize,
        mut f: impl FnMut(&mut Fragment, usize, usize, usize),
    ) {
        let end = offset + len;
        let mut start = 0;
        for fragment in &mut self.fragments {
            let frag_len = fragment.len();
            let frag_end = start + frag_len;
            if frag_end > offset && start < end {
                let from = offset.max(start);
                let to = end.min(frag_end);
                f(fragment, from - start, from - offset, to - from);
            }

            if frag_end >= end {
                break;
            }

            start = frag_end;
        }
    }

    /// Copy bytes from the buffer at `offset` into `dst`.
    pub fn copy_to_slice(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        let end = offset + dst.len();
        let mut start = 0;
        for fragment in &self.fragments {
            let frag_end = start + fragment.len();
            if frag_end > offset && start < end {
                let from = offset.max(start);
                let to = end.min(frag_end);
                fragment.read(from - start, &mut dst[from - offset..to - offset]);
            }

            if frag_end >= end {
                break;
            }

            start = frag_end;
        }

        Ok(())
    }

    /// Copy `src` into the buffer at `offset`.
    pub fn copy_from_slice(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len())?;
        self.for_each_span(offset, src.len(), |fragment, inner, pos, len| {
            fragment.write(inner, &src[pos..pos + len]);
        });
        Ok(())
    }

    /// Zero `len` bytes at `offset`.
    pub fn zero(&mut self, offset: usize, len: usize) -> Result<()> {
        self.check_range(offset, len)?;
        self.for_each_span(offset, len, |fragment, inner, _, len| {
            fragment.zero(inner, len);
        });
        Ok(())
    }

    /// Copy `len` bytes from `src` at `src_offset` into this buffer at
    /// `dst_offset`.
    pub fn copy_from_buffer(
        &mut self,
        dst_offset: usize,
        src: &Self,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        self.check_range(dst_offset, len)?;
        let mut scratch = vec![0u8; len];
        src.copy_to_slice(src_offset, &mut scratch)?;
        self.copy_from_slice(dst_offset, &scratch)
    }

    /// Copy the whole buffer into a vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        let mut start = 0;
        for fragment in &self.fragments {
            let len = fragment.len();
            fragment.read(0, &mut out[start..start + len]);
            start += len;
        }
        out
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("len", &self.len)
            .field("fragments", &self.fragments.len())
            .field("page_aligned", &self.page_aligned)
            .field("extendable", &self.extendable)
            .finish()
    }
}

impl From<Vec<u8>> for IoBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_cache::{MemoryPageCache, PageCache, PageFrame};
    use cacheio_common::{DeviceId, FileId, FileIdentity, IoObjectType, PageCacheConfig};

    #[test]
    fn test_copy_across_fragments() {
        let mut buf = IoBuffer::page_aligned(10, 4);
        assert_eq!(buf.len(), 12);
        assert!(buf.is_page_aligned());

        buf.copy_from_slice(2, b"abcdefgh").unwrap();
        let mut out = [0u8; 8];
        buf.copy_to_slice(2, &mut out).unwrap();
        assert_eq!(&out, b"abcdefgh");
        assert_eq!(buf.to_vec(), b"\0\0abcdefgh\0\0");

        buf.zero(3, 4).unwrap();
        assert_eq!(buf.to_vec(), b"\0\0a\0\0\0\0fgh\0\0");
    }

    #[test]
    fn test_range_checks() {
        let mut buf = IoBuffer::zeroed(8);
        assert!(buf.copy_from_slice(6, b"abc").is_err());
        assert!(buf.zero(usize::MAX, 2).is_err());
        let mut out = [0u8; 9];
        assert!(buf.copy_to_slice(0, &mut out).is_err());
    }

    #[test]
    fn test_extendable_pages() {
        let cache = MemoryPageCache::new(PageCacheConfig::default());
        let id = FileIdentity::new(DeviceId::new(1), FileId::new(1));
        let (entry, _) = cache.create_and_insert(
            id,
            IoObjectType::RegularFile,
            0,
            PageFrame::from_slice(b"cached", 4096),
        );

        let mut buf = IoBuffer::extendable();
        buf.append_page(entry.clone(), 4096).unwrap();
        buf.append_memory(vec![7u8; 16]).unwrap();

        assert_eq!(buf.len(), 4096 + 16);
        assert!(Arc::ptr_eq(buf.page_entry_at(0).unwrap(), &entry));
        assert!(buf.page_entry_at(4096).is_none());
        assert!(buf.page_entry_at(100).is_none());

        // Writes through the buffer land in the cache page
        buf.copy_from_slice(0, b"CACHED").unwrap();
        let mut out = [0u8; 6];
        entry.read(0, &mut out);
        assert_eq!(&out, b"CACHED");

        let mut fixed = IoBuffer::zeroed(4);
        assert!(fixed.append_page(entry, 4096).is_err());
    }

    #[test]
    fn test_contiguous_slices() {
        let mut buf = IoBuffer::page_aligned(8, 4);
        assert_eq!(buf.contiguous(4, 4).map(<[u8]>::len), Some(4));
        assert!(buf.contiguous(2, 4).is_none());
        buf.contiguous_mut(0, 2).unwrap().copy_from_slice(b"hi");
        assert_eq!(&buf.to_vec()[..2], b"hi");

        let whole = IoBuffer::zeroed(16);
        assert!(whole.contiguous(3, 13).is_some());
        assert!(whole.contiguous(3, 14).is_none());
    }

    #[test]
    fn test_copy_between_buffers() {
        let src = IoBuffer::from_vec(b"0123456789".to_vec());
        let mut dst = IoBuffer::page_aligned(8, 4);
        dst.copy_from_buffer(1, &src, 3, 6).unwrap();
        assert_eq!(dst.to_vec(), b"\x00345678\x00");
    }
}
