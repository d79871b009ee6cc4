//! Page cache store
//!
//! The cached I/O engine consumes the page cache through the [`PageCache`]
//! trait: entry lookup, insertion, dirty/clean accounting, eviction and page
//! linking. [`MemoryPageCache`] is the in-memory store used by default, an
//! ordered map keyed by `(FileIdentity, offset)` with LRU trimming of clean
//! pages.
//!
//! Physical pages are [`PageFrame`]s. Two cache entries are *linked* when they
//! share one frame, so data cached above a block device and the device's own
//! cache page for the same bytes occupy a single page.

use bitflags::bitflags;
use cacheio_common::{FileIdentity, IoObjectType, PageCacheConfig};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

/// One physical page of memory
pub struct PageFrame {
    bytes: RwLock<Box<[u8]>>,
}

impl PageFrame {
    /// Allocate a zero-filled page
    #[must_use]
    pub fn zeroed(size: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: RwLock::new(vec![0u8; size].into_boxed_slice()),
        })
    }

    /// Allocate a page holding `data`, zero-padded to `size`
    #[must_use]
    pub fn from_slice(data: &[u8], size: usize) -> Arc<Self> {
        let mut bytes = vec![0u8; size];
        let len = data.len().min(size);
        bytes[..len].copy_from_slice(&data[..len]);
        Arc::new(Self {
            bytes: RwLock::new(bytes.into_boxed_slice()),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the page.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        let bytes = self.bytes.read();
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
    }

    /// Copy `src` into the page starting at `offset`.
    pub fn write(&self, offset: usize, src: &[u8]) {
        let mut bytes = self.bytes.write();
        bytes[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Zero `len` bytes starting at `offset`.
    pub fn zero(&self, offset: usize, len: usize) {
        let mut bytes = self.bytes.write();
        bytes[offset..offset + len].fill(0);
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.read().to_vec()
    }
}

impl std::fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFrame").field("len", &self.len()).finish()
    }
}

/// A cached page of one file or device at a page-aligned offset
pub struct CacheEntry {
    owner: FileIdentity,
    owner_type: IoObjectType,
    offset: u64,
    frame: RwLock<Arc<PageFrame>>,
    dirty: AtomicBool,
    last_access: AtomicU64,
}

impl CacheEntry {
    fn new(
        owner: FileIdentity,
        owner_type: IoObjectType,
        offset: u64,
        frame: Arc<PageFrame>,
        clock: u64,
    ) -> Self {
        Self {
            owner,
            owner_type,
            offset,
            frame: RwLock::new(frame),
            dirty: AtomicBool::new(false),
            last_access: AtomicU64::new(clock),
        }
    }

    #[must_use]
    pub const fn owner(&self) -> FileIdentity {
        self.owner
    }

    #[must_use]
    pub const fn owner_type(&self) -> IoObjectType {
        self.owner_type
    }

    /// File offset of the first byte of this page
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// The physical page currently backing this entry
    #[must_use]
    pub fn frame(&self) -> Arc<PageFrame> {
        self.frame.read().clone()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Check whether two entries share one physical page
    #[must_use]
    pub fn is_linked_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.frame.read(), &other.frame.read())
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        self.frame.read().read(offset, dst);
    }

    pub fn write(&self, offset: usize, src: &[u8]) {
        self.frame.read().write(offset, src);
    }

    pub fn zero(&self, offset: usize, len: usize) {
        self.frame.read().zero(offset, len);
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.frame.read().to_vec()
    }

    fn touch(&self, clock: u64) {
        self.last_access.store(clock, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("owner", &self.owner)
            .field("offset", &self.offset)
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}

bitflags! {
    /// Eviction behavior
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EvictionFlags: u32 {
        /// The data beyond the offset no longer exists; drop dirty pages too
        const TRUNCATE = 1 << 0;
        /// The owning object is going away; drop dirty pages too
        const REMOVE = 1 << 1;
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub inserts: AtomicU64,
    pub evictions: AtomicU64,
    pub links: AtomicU64,
}

impl CacheStats {
    /// Take a consistent-enough copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            links: self.links.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub links: u64,
}

impl CacheStatsSnapshot {
    /// Calculate hit ratio (0.0 to 1.0)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Page cache entry store consumed by the cached I/O engine
pub trait PageCache: Send + Sync {
    /// Page size in bytes
    fn page_size(&self) -> usize;

    /// Find the entry caching `owner` at the page-aligned `offset`.
    fn lookup(&self, owner: FileIdentity, offset: u64) -> Option<Arc<CacheEntry>>;

    /// Insert a clean entry backed by `frame`.
    ///
    /// If another entry already caches that page it is returned instead,
    /// paired with `false`.
    fn create_and_insert(
        &self,
        owner: FileIdentity,
        owner_type: IoObjectType,
        offset: u64,
        frame: Arc<PageFrame>,
    ) -> (Arc<CacheEntry>, bool);

    /// Mark an entry dirty. Returns true on a clean to dirty transition.
    fn mark_dirty(&self, entry: &Arc<CacheEntry>) -> bool;

    /// Mark an entry clean. Returns true on a dirty to clean transition.
    fn mark_clean(&self, entry: &CacheEntry) -> bool;

    /// Evict the pages of `owner` at or beyond `offset`; returns the count.
    fn evict(&self, owner: FileIdentity, offset: u64, flags: EvictionFlags) -> usize;

    /// Dirty pages of `owner` in `[offset, offset + size)`, ordered by offset.
    /// `None` means to the end of the object.
    fn dirty_entries(&self, owner: FileIdentity, offset: u64, size: Option<u64>)
    -> Vec<Arc<CacheEntry>>;

    /// Check whether `source` may share its page with a page of `target_type`.
    fn can_link(&self, source: &CacheEntry, target_type: IoObjectType) -> bool {
        let source_type = source.owner_type();
        source_type.is_linkable() && target_type.is_linkable() && source_type != target_type
    }

    /// Make `target` share the physical page of `source`.
    fn link(&self, source: &CacheEntry, target: &CacheEntry) -> bool;

    /// Too many dirty pages; new writes should go straight to the device.
    fn is_too_dirty(&self) -> bool;

    /// Memory is tight; speculative reads should be skipped.
    fn is_memory_low(&self) -> bool;

    fn dirty_page_count(&self) -> usize;

    /// Release clean pages over the configured capacity; returns the count.
    fn trim(&self) -> usize;

    fn stats(&self) -> CacheStatsSnapshot;
}

type PageKey = (FileIdentity, u64);

/// In-memory page cache with LRU trimming of clean pages
pub struct MemoryPageCache {
    config: PageCacheConfig,
    entries: Mutex<BTreeMap<PageKey, Arc<CacheEntry>>>,
    dirty_pages: AtomicUsize,
    clock: AtomicU64,
    stats: CacheStats,
}

impl MemoryPageCache {
    #[must_use]
    pub fn new(config: PageCacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(BTreeMap::new()),
            dirty_pages: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of resident pages
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of resident pages belonging to `owner`
    #[must_use]
    pub fn pages_for(&self, owner: FileIdentity) -> usize {
        self.entries
            .lock()
            .range((owner, 0)..=(owner, u64::MAX))
            .count()
    }
}

impl PageCache for MemoryPageCache {
    fn page_size(&self) -> usize {
        self.config.page_size
    }

    fn lookup(&self, owner: FileIdentity, offset: u64) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.lock().get(&(owner, offset)).cloned();
        match entry {
            Some(entry) => {
                entry.touch(self.tick());
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn create_and_insert(
        &self,
        owner: FileIdentity,
        owner_type: IoObjectType,
        offset: u64,
        frame: Arc<PageFrame>,
    ) -> (Arc<CacheEntry>, bool) {
        debug_assert_eq!(offset % self.config.page_size as u64, 0);
        let clock = self.tick();
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&(owner, offset)) {
            existing.touch(clock);
            return (existing.clone(), false);
        }

        let entry = Arc::new(CacheEntry::new(owner, owner_type, offset, frame, clock));
        entries.insert((owner, offset), entry.clone());
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        (entry, true)
    }

    fn mark_dirty(&self, entry: &Arc<CacheEntry>) -> bool {
        let mut entries = self.entries.lock();
        let key = (entry.owner, entry.offset);

        // A concurrent trim may have dropped a clean page between lookup and
        // modification. Put it back so the new data is not lost.
        let resident = match entries.get(&key) {
            Some(current) => Arc::ptr_eq(current, entry),
            None => {
                entries.insert(key, entry.clone());
                true
            }
        };

        if entry.dirty.swap(true, Ordering::AcqRel) {
            return false;
        }

        if resident {
            self.dirty_pages.fetch_add(1, Ordering::Relaxed);
        }

        true
    }

    fn mark_clean(&self, entry: &CacheEntry) -> bool {
        let entries = self.entries.lock();
        if !entry.dirty.swap(false, Ordering::AcqRel) {
            return false;
        }

        let resident = entries
            .get(&(entry.owner, entry.offset))
            .is_some_and(|current| std::ptr::eq(current.as_ref(), entry));
        if resident {
            self.dirty_pages.fetch_sub(1, Ordering::Relaxed);
        }

        true
    }

    fn evict(&self, owner: FileIdentity, offset: u64, flags: EvictionFlags) -> usize {
        let drop_dirty = flags.intersects(EvictionFlags::TRUNCATE | EvictionFlags::REMOVE);
        let mut entries = self.entries.lock();
        let keys: Vec<PageKey> = entries
            .range((owner, offset)..=(owner, u64::MAX))
            .filter(|(_, e)| drop_dirty || !e.is_dirty())
            .map(|(k, _)| *k)
            .collect();

        for key in &keys {
            if let Some(entry) = entries.remove(key) {
                if entry.dirty.swap(false, Ordering::AcqRel) {
                    self.dirty_pages.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }

        if !keys.is_empty() {
            self.stats
                .evictions
                .fetch_add(keys.len() as u64, Ordering::Relaxed);
            debug!(%owner, offset, count = keys.len(), "evicted pages");
        }

        keys.len()
    }

    fn dirty_entries(
        &self,
        owner: FileIdentity,
        offset: u64,
        size: Option<u64>,
    ) -> Vec<Arc<CacheEntry>> {
        let end = size.map_or(u64::MAX, |s| offset.saturating_add(s));
        let start = offset - offset % self.config.page_size as u64;
        if start >= end {
            return Vec::new();
        }

        self.entries
            .lock()
            .range((owner, start)..(owner, end))
            .filter(|(_, e)| e.is_dirty())
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn link(&self, source: &CacheEntry, target: &CacheEntry) -> bool {
        if !self.can_link(source, target.owner_type()) {
            return false;
        }

        if source.is_linked_with(target) {
            return true;
        }

        let frame = source.frame();
        *target.frame.write() = frame;
        self.stats.links.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn is_too_dirty(&self) -> bool {
        self.dirty_pages.load(Ordering::Relaxed) >= self.config.max_dirty_pages
    }

    fn is_memory_low(&self) -> bool {
        self.entries.lock().len() >= self.config.low_memory_pages
    }

    fn dirty_page_count(&self) -> usize {
        self.dirty_pages.load(Ordering::Relaxed)
    }

    fn trim(&self) -> usize {
        let mut entries = self.entries.lock();
        if entries.len() <= self.config.max_pages {
            return 0;
        }

        let excess = entries.len() - self.config.max_pages;
        let mut clean: Vec<(u64, PageKey)> = entries
            .iter()
            .filter(|(_, e)| !e.is_dirty())
            .map(|(k, e)| (e.last_access.load(Ordering::Relaxed), *k))
            .collect();
        clean.sort_unstable();

        let mut evicted = 0;
        for (_, key) in clean.into_iter().take(excess) {
            entries.remove(&key);
            evicted += 1;
        }

        if evicted > 0 {
            self.stats
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, "trimmed page cache");
        }
        evicted
    }

    fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}
