//! Cached I/O engine
//!
//! Page-granular reads and writes through the page cache:
//!
//! ```text
//!   perform_cacheable_io
//!        |
//!        +-- non-cacheable / NON_CACHED ----------> NonCachedIoPath
//!        |
//!        +-- read:  walk pages, coalesce misses --> one device read per gap
//!        |          hits and filled pages are appended to an extendable
//!        |          buffer (zero copy) or copied into the caller's pages
//!        |
//!        +-- write: cache-backed source? --------> mark dirty / flush only
//!                   per page: hit  -> link or copy into the entry
//!                             miss -> read-modify (partial) or new page
//!                   synchronized -> collected pages flushed in one write
//! ```
//!
//! Every page touched is looked up or inserted under the object's I/O lock:
//! shared for reads, exclusive for writes.

use crate::file_object::{FileObject, FileObjectFlags, TimeKind};
use crate::handle::{Deadline, IoContext, IoHandle, OpenFlags};
use crate::non_cached::NonCachedIoPath;
use crate::registry::FileObjectRegistry;
use crate::size::SizeManager;
use cacheio_common::{
    EngineConfig, Error, IoFlags, IoObjectType, Result, align_down, align_up,
};
use cacheio_storage::{CacheEntry, EvictionFlags, IoBuffer, PageCache, PageFrame};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// One page's share of a cached write
#[derive(Debug, Clone, Copy)]
struct PageWrite {
    /// File offset of the page
    page_offset: u64,
    page_byte_offset: usize,
    /// Bytes written into this page
    chunk: usize,
    /// Offset of the chunk in the source buffer
    buffer_offset: usize,
    /// Bytes of the request left, including this chunk
    remaining: usize,
}

impl PageWrite {
    const fn is_whole_page(&self, page_size: usize) -> bool {
        self.page_byte_offset == 0 && self.chunk == page_size
    }
}

/// Whether a write miss must read the page before modifying it.
///
/// True when bytes of the page outside the written chunk may hold file data:
/// the chunk starts mid-page below end of file, or it starts at the page
/// boundary but stops short of both the page end and end of file.
#[must_use]
pub(crate) const fn is_partial_page_write(
    page_byte_offset: usize,
    file_size: u64,
    page_offset: u64,
    remaining: usize,
    page_size: usize,
) -> bool {
    if page_byte_offset != 0 {
        file_size > page_offset
    } else {
        remaining < page_size && page_offset + (remaining as u64) < file_size
    }
}

#[derive(Debug, Default)]
struct EngineCounters {
    read_hits: AtomicU64,
    read_misses: AtomicU64,
    miss_fetches: AtomicU64,
    write_hits: AtomicU64,
    write_misses: AtomicU64,
    partial_page_reads: AtomicU64,
    linked_pages: AtomicU64,
    cache_backed_writes: AtomicU64,
    synchronized_writes: AtomicU64,
    flushed_pages: AtomicU64,
}

/// Point-in-time engine statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub read_hits: u64,
    pub read_misses: u64,
    /// Device reads issued to fill misses
    pub miss_fetches: u64,
    pub write_hits: u64,
    pub write_misses: u64,
    pub partial_page_reads: u64,
    pub linked_pages: u64,
    pub cache_backed_writes: u64,
    pub synchronized_writes: u64,
    pub flushed_pages: u64,
}

/// Page-cache-backed read/write engine
pub struct CachedIoEngine {
    registry: Arc<FileObjectRegistry>,
    cache: Arc<dyn PageCache>,
    sizes: Arc<SizeManager>,
    non_cached: NonCachedIoPath,
    config: EngineConfig,
    page_size: usize,
    counters: EngineCounters,
}

impl CachedIoEngine {
    pub fn new(
        registry: Arc<FileObjectRegistry>,
        cache: Arc<dyn PageCache>,
        sizes: Arc<SizeManager>,
        config: EngineConfig,
    ) -> Self {
        let page_size = cache.page_size();
        Self {
            registry,
            cache,
            sizes,
            non_cached: NonCachedIoPath::new(page_size),
            config,
            page_size,
            counters: EngineCounters::default(),
        }
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub const fn non_cached(&self) -> &NonCachedIoPath {
        &self.non_cached
    }

    /// Perform one read or write on `handle`.
    ///
    /// `ctx.bytes_completed` reports progress even on failure. Without an
    /// explicit offset the handle position is used and advanced; append
    /// handles always write at end of file.
    pub fn perform_cacheable_io(&self, handle: &IoHandle, ctx: &mut IoContext) -> Result<()> {
        ctx.bytes_completed = 0;
        // Reads into an extendable buffer append to it.
        let grows = !ctx.write && ctx.buffer.is_extendable();
        if ctx.size > ctx.buffer.len() && !grows {
            return Err(Error::invalid(format!(
                "request of {} bytes exceeds buffer of {}",
                ctx.size,
                ctx.buffer.len()
            )));
        }

        let object = handle.object().clone();
        let deadline = Deadline::after(ctx.timeout.or_else(|| self.config.default_timeout()));
        let explicit = ctx.offset.is_some();

        let guard = object.lock_io(ctx.write);
        let offset = if ctx.write && handle.open_flags().contains(OpenFlags::APPEND) {
            object.size()
        } else {
            ctx.offset.unwrap_or_else(|| handle.position())
        };

        let cached = object.object_type().is_cacheable()
            && !object.flags().contains(FileObjectFlags::NON_CACHED);
        let result = match (cached, ctx.write) {
            (true, false) => self.perform_cached_read(&object, ctx, offset, deadline),
            (true, true) => self.perform_cached_write(&object, ctx, offset, deadline),
            (false, false) => self.perform_non_cached_read(&object, ctx, offset, deadline),
            (false, true) => self.perform_non_cached_write(&object, ctx, offset, deadline),
        };
        drop(guard);

        if ctx.bytes_completed > 0 {
            if ctx.write {
                self.registry
                    .update_file_object_time(&object, TimeKind::Modify);
            } else if !ctx.flags.contains(IoFlags::NO_ACCESS_TIME)
                && !handle.open_flags().contains(OpenFlags::NO_ACCESS_TIME)
            {
                self.registry
                    .update_file_object_time(&object, TimeKind::Access);
            }
        }

        if !explicit {
            handle.set_position(offset + ctx.bytes_completed as u64);
        }

        trace!(
            identity = %object.identity(),
            offset,
            size = ctx.size,
            write = ctx.write,
            completed = ctx.bytes_completed,
            "cacheable io"
        );
        result
    }

    fn perform_non_cached_read(
        &self,
        object: &FileObject,
        ctx: &mut IoContext,
        offset: u64,
        deadline: Deadline,
    ) -> Result<()> {
        if ctx.buffer.is_extendable() {
            let mut scratch = IoBuffer::zeroed(ctx.size);
            let done = self.non_cached.read(
                object,
                &mut scratch,
                0,
                offset,
                ctx.size,
                ctx.flags,
                deadline.remaining(),
            );
            let mut data = scratch.to_vec();
            data.truncate(done.bytes_completed);
            ctx.buffer.append_memory(data)?;
            ctx.bytes_completed = done.bytes_completed;
            return done.status;
        }

        let done = self.non_cached.read(
            object,
            &mut ctx.buffer,
            0,
            offset,
            ctx.size,
            ctx.flags,
            deadline.remaining(),
        );
        ctx.bytes_completed = done.bytes_completed;
        done.status
    }

    fn perform_non_cached_write(
        &self,
        object: &FileObject,
        ctx: &mut IoContext,
        offset: u64,
        deadline: Deadline,
    ) -> Result<()> {
        let done = self.non_cached.write(
            object,
            &ctx.buffer,
            0,
            offset,
            ctx.size,
            ctx.flags,
            deadline.remaining(),
        );
        ctx.bytes_completed = done.bytes_completed;
        done.status
    }

    fn perform_cached_read(
        &self,
        object: &FileObject,
        ctx: &mut IoContext,
        offset: u64,
        deadline: Deadline,
    ) -> Result<()> {
        let page = self.page_size as u64;
        let end = offset
            .checked_add(ctx.size as u64)
            .ok_or_else(|| Error::invalid("read range overflows"))?;
        if ctx.size == 0 {
            return Ok(());
        }

        let file_size = object.size();
        if offset >= file_size {
            return Err(Error::EndOfFile);
        }

        let size = usize::try_from(end.min(file_size) - offset)
            .map_err(|_| Error::invalid("read size exceeds address space"))?;
        let aligned_offset = align_down(offset, page);
        let head = usize::try_from(offset - aligned_offset).unwrap_or(0);
        let window = head + size;
        let window = window.div_ceil(self.page_size) * self.page_size;

        // Page-aligned caller memory is filled in place.
        let direct = head == 0
            && ctx.size % self.page_size == 0
            && ctx.buffer.is_page_aligned()
            && !ctx.buffer.is_extendable();
        if direct {
            let mut filled = 0;
            let result = self.fill_window(
                object,
                &mut ctx.buffer,
                aligned_offset,
                window,
                ctx.flags,
                deadline,
                &mut filled,
            );
            ctx.bytes_completed = filled.min(size);
            return result;
        }

        let mut pages = IoBuffer::extendable();
        let mut filled = 0;
        self.fill_window(
            object,
            &mut pages,
            aligned_offset,
            window,
            ctx.flags,
            deadline,
            &mut filled,
        )?;

        if ctx.buffer.is_extendable() {
            if head == 0 && ctx.buffer.is_empty() {
                // Hand the cache pages over as they are.
                ctx.buffer = pages;
            } else {
                let mut data = vec![0u8; size];
                pages.copy_to_slice(head, &mut data)?;
                ctx.buffer.append_memory(data)?;
            }
        } else {
            ctx.buffer.copy_from_buffer(0, &pages, head, size)?;
        }
        ctx.bytes_completed = size;
        Ok(())
    }

    /// Fill `[window_offset, window_offset + window_len)` of the object into
    /// `dest`, page by page. Runs of missing pages are fetched with one
    /// device read each. `filled` tracks how many bytes of `dest` are valid.
    #[allow(clippy::too_many_arguments)]
    fn fill_window(
        &self,
        object: &FileObject,
        dest: &mut IoBuffer,
        window_offset: u64,
        window_len: usize,
        flags: IoFlags,
        deadline: Deadline,
        filled: &mut usize,
    ) -> Result<()> {
        let identity = object.identity();
        let page = self.page_size as u64;
        let end = window_offset + window_len as u64;
        let mut miss_start: Option<u64> = None;
        let mut position = window_offset;

        while position < end {
            deadline.check()?;
            if let Some(entry) = self.cache.lookup(identity, position) {
                if let Some(start) = miss_start.take() {
                    self.fill_gap(object, dest, window_offset, start, position, flags, deadline)?;
                }
                self.place_page(dest, as_index(position - window_offset), &entry)?;
                *filled = as_index(position - window_offset) + self.page_size;
                self.counters.read_hits.fetch_add(1, Ordering::Relaxed);
            } else {
                miss_start.get_or_insert(position);
                self.counters.read_misses.fetch_add(1, Ordering::Relaxed);
            }
            position += page;
        }

        if let Some(start) = miss_start {
            self.fill_gap(object, dest, window_offset, start, end, flags, deadline)?;
        }
        *filled = window_len;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_gap(
        &self,
        object: &FileObject,
        dest: &mut IoBuffer,
        window_offset: u64,
        start: u64,
        end: u64,
        flags: IoFlags,
        deadline: Deadline,
    ) -> Result<()> {
        self.handle_read_miss(
            object,
            start,
            as_index(end - start),
            dest,
            as_index(start - window_offset),
            flags,
            deadline,
        )
    }

    /// Put a cache page into `dest` at `dest_offset`: appended by reference
    /// to an extendable buffer, copied into anything else.
    fn place_page(&self, dest: &mut IoBuffer, dest_offset: usize, entry: &Arc<CacheEntry>) -> Result<()> {
        if dest.is_extendable() {
            debug_assert_eq!(dest.len(), dest_offset);
            return dest.append_page(entry.clone(), self.page_size);
        }

        let len = self.page_size.min(dest.len().saturating_sub(dest_offset));
        if let Some(slice) = dest.contiguous_mut(dest_offset, len) {
            entry.read(0, slice);
            return Ok(());
        }

        let mut data = vec![0u8; len];
        entry.read(0, &mut data);
        dest.copy_from_slice(dest_offset, &data)
    }

    /// Fetch the missing pages `[offset, offset + size)` with one device
    /// read, cache every page read and place the requested ones into `dest`.
    ///
    /// The read is widened to whole device blocks and, for block devices
    /// with memory to spare, to the read-ahead window. Bytes past what the
    /// device returned are zero. Pages that appeared in the cache meanwhile
    /// are kept as they are.
    #[allow(clippy::too_many_arguments)]
    fn handle_read_miss(
        &self,
        object: &FileObject,
        offset: u64,
        size: usize,
        dest: &mut IoBuffer,
        dest_offset: usize,
        flags: IoFlags,
        deadline: Deadline,
    ) -> Result<()> {
        let page = self.page_size as u64;
        let block = u64::from(object.block_size().max(1));
        let aligned_offset = align_down(offset, block);
        if aligned_offset % page != 0 {
            return Err(Error::invalid(format!(
                "block size {block} does not tile the page size {page}"
            )));
        }

        let needed = align_up(offset - aligned_offset + size as u64, page);
        let mut fetch_len = align_up(align_up(offset - aligned_offset + size as u64, block), page);
        if object.object_type() == IoObjectType::BlockDevice {
            if !self.cache.is_memory_low() {
                let read_ahead = (self.config.read_ahead_size as u64).max(page);
                fetch_len = align_up(fetch_len, read_ahead);
            }

            let device_end = align_up(object.size(), page);
            if aligned_offset.saturating_add(fetch_len) > device_end {
                fetch_len = device_end.saturating_sub(aligned_offset).max(needed);
            }
        }

        let mut data = vec![0u8; as_index(fetch_len)];
        let done =
            self.non_cached
                .read_aligned(object, &mut data, aligned_offset, flags, deadline.remaining());
        // Reads never start past the cached size. End of file from the
        // device inside it means the transport's stored length trails the
        // file, and that range reads as zeros.
        match done.status {
            Ok(()) | Err(Error::EndOfFile) => {}
            Err(e) => return Err(e),
        }
        data[done.bytes_completed..].fill(0);
        self.counters.miss_fetches.fetch_add(1, Ordering::Relaxed);

        let identity = object.identity();
        let request_end = offset + size as u64;
        for (index, chunk) in data.chunks(self.page_size).enumerate() {
            let page_offset = aligned_offset + (index * self.page_size) as u64;
            let (entry, _) = self.cache.create_and_insert(
                identity,
                object.object_type(),
                page_offset,
                PageFrame::from_slice(chunk, self.page_size),
            );
            if page_offset >= offset && page_offset < request_end {
                self.place_page(dest, dest_offset + as_index(page_offset - offset), &entry)?;
            }
        }

        debug!(
            %identity,
            offset = aligned_offset,
            len = fetch_len,
            read = done.bytes_completed,
            "filled read miss"
        );
        Ok(())
    }

    fn perform_cached_write(
        &self,
        object: &Arc<FileObject>,
        ctx: &mut IoContext,
        offset: u64,
        deadline: Deadline,
    ) -> Result<()> {
        let page = self.page_size as u64;
        let mut size = ctx.size;
        offset
            .checked_add(size as u64)
            .ok_or_else(|| Error::invalid("write range overflows"))?;
        if size == 0 {
            return Ok(());
        }

        if object.object_type() == IoObjectType::BlockDevice {
            let device_size = object.size();
            if offset >= device_size {
                return Err(Error::OutOfBounds {
                    offset,
                    size: device_size,
                });
            }
            size = size.min(usize::try_from(device_size - offset).unwrap_or(usize::MAX));
        }

        let mut flags = ctx.flags;
        if self.cache.is_too_dirty() {
            flags |= IoFlags::DATA_SYNCHRONIZED;
        }
        let synchronized = flags.contains(IoFlags::DATA_SYNCHRONIZED);

        if offset % page == 0 && self.is_cache_backed(object, &ctx.buffer, offset, size) {
            return self.write_cache_backed(object, ctx, offset, size, flags, deadline);
        }

        let head = as_index(offset % page);
        let mut accepted = 0;
        let mut sync_pages = synchronized.then(IoBuffer::extendable);
        let mut status = self.write_pages(
            object,
            &ctx.buffer,
            offset,
            size,
            flags,
            deadline,
            &mut accepted,
            sync_pages.as_mut(),
        );

        let mut completed = accepted;
        if let Some(pages) = sync_pages.filter(|p| !p.is_empty()) {
            let page_start = align_down(offset, page);
            let len = self.flush_span(object, page_start, offset + accepted as u64, pages.len());
            let (flushed, flush_status) = self.write_cache_pages(
                object,
                &pages,
                page_start,
                len,
                flags,
                deadline.remaining(),
            );
            completed = completed.min(flushed.saturating_sub(head));
            if status.is_ok() {
                status = flush_status;
            }
            self.counters
                .synchronized_writes
                .fetch_add(1, Ordering::Relaxed);
        }

        ctx.bytes_completed = completed;
        if completed > 0 {
            self.sizes
                .update_file_size(object, offset + completed as u64);
        }
        if !synchronized && accepted > 0 {
            self.registry.mark_dirty(object);
        }
        if status.is_err() {
            self.evict_beyond_size(object);
        }
        status
    }

    /// Copy the request into cache pages one page at a time. With
    /// `sync_pages` the touched pages are collected for the caller to flush.
    #[allow(clippy::too_many_arguments)]
    fn write_pages(
        &self,
        object: &FileObject,
        source: &IoBuffer,
        offset: u64,
        size: usize,
        flags: IoFlags,
        deadline: Deadline,
        accepted: &mut usize,
        mut sync_pages: Option<&mut IoBuffer>,
    ) -> Result<()> {
        let page = self.page_size as u64;
        let identity = object.identity();
        let file_size = object.size();
        let mut position = offset;

        while *accepted < size {
            deadline.check()?;
            let page_offset = align_down(position, page);
            let page_byte_offset = as_index(position - page_offset);
            let remaining = size - *accepted;
            let piece = PageWrite {
                page_offset,
                page_byte_offset,
                chunk: (self.page_size - page_byte_offset).min(remaining),
                buffer_offset: *accepted,
                remaining,
            };

            let entry = if let Some(entry) = self.cache.lookup(identity, page_offset) {
                self.write_hit(object, source, &entry, &piece, flags)?;
                entry
            } else {
                self.write_miss(object, source, &piece, file_size, flags, deadline)?
            };

            if let Some(pages) = sync_pages.as_deref_mut() {
                pages.append_page(entry, self.page_size)?;
            }
            *accepted += piece.chunk;
            position += piece.chunk as u64;
        }

        Ok(())
    }

    fn copy_into_page(source: &IoBuffer, piece: &PageWrite, entry: &CacheEntry) -> Result<()> {
        let mut data = vec![0u8; piece.chunk];
        source.copy_to_slice(piece.buffer_offset, &mut data)?;
        entry.write(piece.page_byte_offset, &data);
        Ok(())
    }

    /// Update a resident page. A whole page written by a file system from
    /// its own cache page is shared with it instead of copied.
    fn write_hit(
        &self,
        object: &FileObject,
        source: &IoBuffer,
        entry: &Arc<CacheEntry>,
        piece: &PageWrite,
        flags: IoFlags,
    ) -> Result<()> {
        let linked = flags.contains(IoFlags::FS_DATA)
            && piece.is_whole_page(self.page_size)
            && source
                .page_entry_at(piece.buffer_offset)
                .is_some_and(|src| !Arc::ptr_eq(src, entry) && self.cache.link(src, entry));

        if linked {
            self.counters.linked_pages.fetch_add(1, Ordering::Relaxed);
        } else {
            Self::copy_into_page(source, piece, entry)?;
        }

        self.cache.mark_dirty(entry);
        self.counters.write_hits.fetch_add(1, Ordering::Relaxed);
        trace!(identity = %object.identity(), offset = piece.page_offset, linked, "write hit");
        Ok(())
    }

    /// Bring a missing page into the cache with the new bytes applied.
    fn write_miss(
        &self,
        object: &FileObject,
        source: &IoBuffer,
        piece: &PageWrite,
        file_size: u64,
        flags: IoFlags,
        deadline: Deadline,
    ) -> Result<Arc<CacheEntry>> {
        self.counters.write_misses.fetch_add(1, Ordering::Relaxed);

        if is_partial_page_write(
            piece.page_byte_offset,
            file_size,
            piece.page_offset,
            piece.remaining,
            self.page_size,
        ) {
            let mut fetched = IoBuffer::extendable();
            self.handle_read_miss(
                object,
                piece.page_offset,
                self.page_size,
                &mut fetched,
                0,
                flags,
                deadline,
            )?;
            let entry = fetched
                .page_entry_at(0)
                .cloned()
                .ok_or_else(|| Error::internal("read miss produced no page"))?;
            Self::copy_into_page(source, piece, &entry)?;
            self.cache.mark_dirty(&entry);
            self.counters
                .partial_page_reads
                .fetch_add(1, Ordering::Relaxed);
            return Ok(entry);
        }

        let source_page = if piece.is_whole_page(self.page_size) {
            source
                .page_entry_at(piece.buffer_offset)
                .filter(|src| self.cache.can_link(src, object.object_type()))
                .cloned()
        } else {
            None
        };

        let frame = if let Some(src) = &source_page {
            src.frame()
        } else {
            // Bytes around the chunk are past end of file: zero.
            let frame = PageFrame::zeroed(self.page_size);
            let mut data = vec![0u8; piece.chunk];
            source.copy_to_slice(piece.buffer_offset, &mut data)?;
            frame.write(piece.page_byte_offset, &data);
            frame
        };

        let (entry, inserted) = self.cache.create_and_insert(
            object.identity(),
            object.object_type(),
            piece.page_offset,
            frame,
        );
        if !inserted {
            self.write_hit(object, source, &entry, piece, flags)?;
            return Ok(entry);
        }

        if source_page.is_some() {
            self.counters.linked_pages.fetch_add(1, Ordering::Relaxed);
        }
        self.cache.mark_dirty(&entry);
        Ok(entry)
    }

    /// The source buffer is made of this object's own cache pages for the
    /// target range.
    fn is_cache_backed(&self, object: &FileObject, buffer: &IoBuffer, offset: u64, size: usize) -> bool {
        let identity = object.identity();
        (0..size.div_ceil(self.page_size)).all(|index| {
            let buffer_offset = index * self.page_size;
            buffer.page_entry_at(buffer_offset).is_some_and(|entry| {
                entry.owner() == identity
                    && entry.offset() == offset + buffer_offset as u64
                    && self
                        .cache
                        .lookup(identity, entry.offset())
                        .is_some_and(|resident| Arc::ptr_eq(&resident, entry))
            })
        })
    }

    /// The data is already in place; only dirty state and size change.
    fn write_cache_backed(
        &self,
        object: &Arc<FileObject>,
        ctx: &mut IoContext,
        offset: u64,
        size: usize,
        flags: IoFlags,
        deadline: Deadline,
    ) -> Result<()> {
        self.counters
            .cache_backed_writes
            .fetch_add(1, Ordering::Relaxed);

        let (completed, status) = if flags.contains(IoFlags::DATA_SYNCHRONIZED) {
            let len = self.flush_span(object, offset, offset + size as u64, ctx.buffer.len());
            let (flushed, status) =
                self.write_cache_pages(object, &ctx.buffer, offset, len, flags, deadline.remaining());
            self.counters
                .synchronized_writes
                .fetch_add(1, Ordering::Relaxed);
            (flushed.min(size), status)
        } else {
            for index in 0..size.div_ceil(self.page_size) {
                if let Some(entry) = ctx.buffer.page_entry_at(index * self.page_size) {
                    self.cache.mark_dirty(entry);
                }
            }
            self.registry.mark_dirty(object);
            (size, Ok(()))
        };

        ctx.bytes_completed = completed;
        if completed > 0 {
            self.sizes
                .update_file_size(object, offset + completed as u64);
        }
        status
    }

    /// Bytes to write from `page_start` so that every page touched up to
    /// `data_end` reaches the device whole. Pages are marked clean as a unit,
    /// so older dirty bytes past `data_end` in the last page go out too. The
    /// span stops at end of file and at the `available` bytes of the buffer.
    fn flush_span(&self, object: &FileObject, page_start: u64, data_end: u64, available: usize) -> usize {
        let page = self.page_size as u64;
        let end = align_up(data_end, page).min(object.size().max(data_end));
        as_index(end - page_start).min(available)
    }

    /// Write `len` bytes of the cache pages in `pages` to the device at
    /// `offset` with one non-cached write.
    ///
    /// Pages are marked clean before the write so a concurrent modification
    /// re-dirties them; pages the device did not take are marked dirty
    /// again. Returns the bytes written.
    fn write_cache_pages(
        &self,
        object: &Arc<FileObject>,
        pages: &IoBuffer,
        offset: u64,
        len: usize,
        flags: IoFlags,
        timeout: Option<Duration>,
    ) -> (usize, Result<()>) {
        let entries: Vec<Arc<CacheEntry>> = (0..len.div_ceil(self.page_size))
            .filter_map(|index| pages.page_entry_at(index * self.page_size).cloned())
            .collect();
        for entry in &entries {
            self.cache.mark_clean(entry);
        }

        let done = self
            .non_cached
            .write(object, pages, 0, offset, len, flags, timeout);

        let written_pages = if done.bytes_completed >= len {
            entries.len()
        } else {
            done.bytes_completed / self.page_size
        };
        if written_pages < entries.len() {
            for entry in &entries[written_pages..] {
                self.cache.mark_dirty(entry);
            }
            self.registry.mark_dirty(object);
        }

        self.counters
            .flushed_pages
            .fetch_add(written_pages as u64, Ordering::Relaxed);
        (done.bytes_completed, done.status)
    }

    /// Write the dirty pages of `object` in `[offset, offset + size)` to the
    /// device, one request per contiguous run. Returns the pages written.
    ///
    /// The caller holds the object's I/O lock.
    pub fn flush_cached_pages(
        &self,
        object: &Arc<FileObject>,
        offset: u64,
        size: Option<u64>,
        flags: IoFlags,
    ) -> Result<usize> {
        let entries = self.cache.dirty_entries(object.identity(), offset, size);
        if entries.is_empty() {
            return Ok(0);
        }

        let page = self.page_size as u64;
        let file_size = object.size();
        let mut runs: Vec<Vec<Arc<CacheEntry>>> = Vec::new();
        for entry in entries {
            if entry.offset() >= file_size {
                // Nothing past end of file to write.
                self.cache.mark_clean(&entry);
                continue;
            }

            match runs.last_mut() {
                Some(run) if run.last().is_some_and(|last| last.offset() + page == entry.offset()) => {
                    run.push(entry);
                }
                _ => runs.push(vec![entry]),
            }
        }

        let mut flushed = 0;
        for run in runs {
            let start = run[0].offset();
            let run_len = run.len();
            let len = (run_len as u64 * page).min(file_size - start);
            let mut pages = IoBuffer::extendable();
            for entry in run {
                pages.append_page(entry, self.page_size)?;
            }

            let (_, status) = self.write_cache_pages(object, &pages, start, as_index(len), flags, None);
            status?;
            flushed += run_len;
        }

        debug!(identity = %object.identity(), pages = flushed, "flushed cached pages");
        Ok(flushed)
    }

    fn evict_beyond_size(&self, object: &FileObject) {
        let start = align_up(object.size(), self.page_size as u64);
        let evicted = self
            .cache
            .evict(object.identity(), start, EvictionFlags::TRUNCATE);
        if evicted > 0 {
            debug!(identity = %object.identity(), evicted, "dropped pages past end of file");
        }
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            read_hits: c.read_hits.load(Ordering::Relaxed),
            read_misses: c.read_misses.load(Ordering::Relaxed),
            miss_fetches: c.miss_fetches.load(Ordering::Relaxed),
            write_hits: c.write_hits.load(Ordering::Relaxed),
            write_misses: c.write_misses.load(Ordering::Relaxed),
            partial_page_reads: c.partial_page_reads.load(Ordering::Relaxed),
            linked_pages: c.linked_pages.load(Ordering::Relaxed),
            cache_backed_writes: c.cache_backed_writes.load(Ordering::Relaxed),
            synchronized_writes: c.synchronized_writes.load(Ordering::Relaxed),
            flushed_pages: c.flushed_pages.load(Ordering::Relaxed),
        }
    }
}

/// Offsets inside one request always fit in memory.
#[allow(clippy::cast_possible_truncation)]
const fn as_index(value: u64) -> usize {
    value as usize
}
