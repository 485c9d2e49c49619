use crate::cache::LruCache;
use crate::errors::DbError;
use crate::storage::file::FileStorage;
use crate::storage::page::{PAGE_HEADER_SIZE, PAGE_SIZE, Page, PageHeader, PageType};
use crate::types::PageId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Default number of pages retained by the page cache.
pub const DEFAULT_PAGE_CACHE: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct PageStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub allocations: u64,
    pub frees: u64,
    pub pages_in_file: i64,
    pub free_pages: usize,
}

/// Page allocation and caching over a [`FileStorage`].
///
/// Allocation prefers the free list; otherwise the file is extended by one
/// page. Reads go through a capacity-bounded LRU cache; writes go straight
/// through to storage and refresh the cache.
pub struct PageManager {
    storage: Arc<FileStorage>,
    cache: LruCache<PageId, Page>,
    free_list: Mutex<VecDeque<PageId>>,
    next_page_id: AtomicI64,
    hits: AtomicU64,
    misses: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
}

impl PageManager {
    /// Open a manager over `storage`, scanning existing pages to rebuild
    /// the free list and the next-allocation watermark.
    ///
    /// # Errors
    /// Propagates storage errors; a page header that cannot be decoded is
    /// logged and treated as in-use.
    pub fn new(storage: Arc<FileStorage>, max_cache_size: usize) -> Result<Self, DbError> {
        let file_len = storage.len()?;
        let page_count = i64::try_from(file_len / PAGE_SIZE as u64).unwrap_or(0);
        let mut free = VecDeque::new();
        for id in 0..page_count {
            let offset = id as u64 * PAGE_SIZE as u64;
            let header_bytes = storage.read_exact_at(offset, PAGE_HEADER_SIZE)?;
            match PageHeader::decode(&header_bytes) {
                Ok(header) if header.page_type == PageType::Free => free.push_back(id),
                Ok(_) => {}
                Err(e) => log::warn!("page {id}: unreadable header during open scan: {e}"),
            }
        }
        log::debug!("page manager opened: {page_count} pages, {} free", free.len());
        Ok(Self {
            storage,
            cache: LruCache::new(max_cache_size.max(1))?,
            free_list: Mutex::new(free),
            next_page_id: AtomicI64::new(page_count),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        })
    }

    /// Allocate a page: pop the free list if possible, else extend the
    /// file. The first allocation in an empty file yields page id 0.
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn allocate_page(&self, page_type: PageType) -> Result<Page, DbError> {
        let id = match self.free_list.lock().pop_front() {
            Some(id) => id,
            None => self.next_page_id.fetch_add(1, Ordering::SeqCst),
        };
        let mut page = Page::new(id, page_type);
        self.write_page(&mut page)?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(page)
    }

    /// Fetch a page, consulting the cache first.
    ///
    /// # Errors
    /// `NotFound` for an id outside the file, `Corruption` for a bad
    /// checksum or unreadable header.
    pub fn get_page(&self, id: PageId) -> Result<Page, DbError> {
        self.check_in_range(id)?;
        if let Some(page) = self.cache.try_get(&id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(page);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let offset = id as u64 * PAGE_SIZE as u64;
        let bytes = self.storage.read_exact_at(offset, PAGE_SIZE)?;
        let page = Page::decode(&bytes)?;
        let _ = self.cache.put(id, page.clone());
        Ok(page)
    }

    /// Serialize `page` at its slot and refresh the cache. Does not sync;
    /// durability comes from `flush` or the WAL.
    ///
    /// # Errors
    /// `InvalidArgument` for a negative page id; propagates storage errors.
    pub fn write_page(&self, page: &mut Page) -> Result<(), DbError> {
        if page.header.page_id < 0 {
            return Err(DbError::InvalidArgument(format!(
                "negative page id {}",
                page.header.page_id
            )));
        }
        let offset = page.header.page_id as u64 * PAGE_SIZE as u64;
        let image = page.encode();
        self.storage.write_at(offset, &image)?;
        let _ = self.cache.put(page.header.page_id, page.clone());
        Ok(())
    }

    /// Return `id` to the free list and zero its slot on disk.
    ///
    /// # Errors
    /// `NotFound` for an id outside the file; propagates storage errors.
    pub fn free_page(&self, id: PageId) -> Result<(), DbError> {
        self.check_in_range(id)?;
        let _ = self.cache.remove(&id);
        let offset = id as u64 * PAGE_SIZE as u64;
        // An all-zero image is a Free page with no payload.
        self.storage.write_at(offset, &[0u8; PAGE_SIZE])?;
        self.free_list.lock().push_back(id);
        self.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// True iff `id` is inside the file and its on-disk type is not Free.
    ///
    /// # Errors
    /// Propagates storage errors; an undecodable header reads as absent.
    pub fn page_exists(&self, id: PageId) -> Result<bool, DbError> {
        if id < 0 || id >= self.next_page_id.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let offset = id as u64 * PAGE_SIZE as u64;
        let header_bytes = self.storage.read_exact_at(offset, PAGE_HEADER_SIZE)?;
        match PageHeader::decode(&header_bytes) {
            Ok(header) => Ok(header.page_type != PageType::Free),
            Err(_) => Ok(false),
        }
    }

    /// Write every cached page back, then flush and sync storage.
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn flush(&self) -> Result<(), DbError> {
        for (_, mut page) in self.cache.items() {
            let offset = page.header.page_id as u64 * PAGE_SIZE as u64;
            self.storage.write_at(offset, &page.encode())?;
        }
        self.storage.flush()?;
        self.storage.sync()?;
        Ok(())
    }

    /// Raise the allocation watermark so `id` is addressable. Used by
    /// recovery when redo references pages that were never lazily applied.
    pub fn reserve_through(&self, id: PageId) {
        let mut current = self.next_page_id.load(Ordering::SeqCst);
        while id >= current {
            match self.next_page_id.compare_exchange(
                current,
                id + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Rebuild the free list and watermark from the file. Called after
    /// recovery rewrites pages underneath the manager.
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn rescan(&self) -> Result<(), DbError> {
        let file_len = self.storage.len()?;
        let page_count = i64::try_from(file_len / PAGE_SIZE as u64).unwrap_or(0);
        let mut free = VecDeque::new();
        for id in 0..page_count {
            let offset = id as u64 * PAGE_SIZE as u64;
            let header_bytes = self.storage.read_exact_at(offset, PAGE_HEADER_SIZE)?;
            if let Ok(header) = PageHeader::decode(&header_bytes)
                && header.page_type == PageType::Free
            {
                free.push_back(id);
            }
        }
        self.cache.clear();
        *self.free_list.lock() = free;
        let watermark = self.next_page_id.load(Ordering::SeqCst).max(page_count);
        self.next_page_id.store(watermark, Ordering::SeqCst);
        Ok(())
    }

    /// Ids currently allocated (highest watermark; includes freed slots).
    pub fn page_count(&self) -> i64 {
        self.next_page_id.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PageStats {
        PageStats {
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            pages_in_file: self.page_count(),
            free_pages: self.free_list.lock().len(),
        }
    }

    fn check_in_range(&self, id: PageId) -> Result<(), DbError> {
        if id < 0 || id >= self.next_page_id.load(Ordering::SeqCst) {
            return Err(DbError::NotFound(format!("page {id}")));
        }
        Ok(())
    }
}
