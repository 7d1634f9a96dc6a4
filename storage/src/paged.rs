use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use bytes::BytesMut;
use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, trace, warn};
use crate::config::PagedConfig;
use crate::descriptor_pool::DescriptorPool;
use crate::error::{StorageError, StorageResult};
use crate::file_header::{FileHeader, FILE_HEADER_SERIALIZED_LEN};
use crate::page::{Page, PageRef, PageStatus, PAGE_HEADER_SIZE};

/// A value read from a page and its overflow chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub status: PageStatus,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A file of fixed-size pages after a file header.
///
/// Pages are read through an LRU cache. Modified pages are kept in a dirty set until the next
///  [Paged::flush], so a dirty page is never evicted before it is written. Unused pages form a
///  singly linked free list through their `next_page` links, with head and tail in the file
///  header; allocation takes pages from the free list before growing the file.
///
/// Values that do not fit into a single page continue in a chain of overflow pages.
pub struct Paged {
    path: PathBuf,
    config: PagedConfig,
    header: Mutex<FileHeader>,
    cache: Mutex<LruCache<u64, PageRef>>,
    dirty: Mutex<FxHashMap<u64, PageRef>>,
    descriptors: DescriptorPool,
    closed: AtomicBool,
}

impl Paged {
    pub fn exists(path: &Path) -> bool {
        path.is_file()
    }

    /// Create a new file with `primary_page_count` pages, all of them on the free list. Fails
    ///  if the file exists.
    pub fn create(path: &Path, config: PagedConfig) -> StorageResult<Paged> {
        config.validate()
            .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;

        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| StorageError::io(format!("creating {:?}", path), e))?;

        let primary_count = config.primary_page_count;
        let header = FileHeader {
            page_header_size: PAGE_HEADER_SIZE as u16,
            page_size: config.page_size as u32,
            file_header_size: config.file_header_size as u32,
            max_key_size: config.max_key_size as u32,
            primary_count,
            total_count: primary_count,
            first_free: if primary_count > 0 { Some(0) } else { None },
            last_free: primary_count.checked_sub(1),
            record_count: 0,
            root_page: None,
        };

        let paged = Paged::new(path, config, header);
        for page_num in 0..primary_count {
            let mut page = Page::new(page_num, PageStatus::Unused);
            page.header.next_page = if page_num + 1 < primary_count { Some(page_num + 1) } else { None };
            paged.insert_dirty(page);
        }
        paged.flush()?;

        debug!("created paged file {:?} with {} primary pages", path, primary_count);
        Ok(paged)
    }

    /// Open an existing file. Page size and header layout are validated against the
    ///  configuration; the file's own max key size and header size take precedence.
    pub fn open(path: &Path, config: PagedConfig) -> StorageResult<Paged> {
        config.validate()
            .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;

        let descriptors = DescriptorPool::new(path, 1);
        let mut buf = vec![0u8; FILE_HEADER_SERIALIZED_LEN];
        descriptors.checkout()?.read_at(0, &mut buf)?;
        descriptors.close();

        let header = FileHeader::deser(&mut buf.as_slice())?;
        if header.page_header_size as usize != PAGE_HEADER_SIZE {
            return Err(StorageError::corrupt(format!("{:?} has page header size {}, expected {}", path, header.page_header_size, PAGE_HEADER_SIZE)));
        }
        if header.page_size as usize != config.page_size {
            return Err(StorageError::InvalidArgument(format!("{:?} has page size {}, configured is {}", path, header.page_size, config.page_size)));
        }

        let config = PagedConfig {
            file_header_size: header.file_header_size as usize,
            max_key_size: header.max_key_size as usize,
            ..config
        };

        debug!("opened paged file {:?}: {} pages, {} records", path, header.total_count, header.record_count);
        Ok(Paged::new(path, config, header))
    }

    pub fn open_or_create(path: &Path, config: PagedConfig) -> StorageResult<Paged> {
        if Paged::exists(path) {
            Paged::open(path, config)
        }
        else {
            Paged::create(path, config)
        }
    }

    fn new(path: &Path, config: PagedConfig, header: FileHeader) -> Paged {
        let cache_capacity = NonZeroUsize::new(config.page_cache_capacity)
            .unwrap_or(NonZeroUsize::MIN);
        Paged {
            path: path.to_path_buf(),
            descriptors: DescriptorPool::new(path, config.descriptor_pool_size),
            config,
            header: Mutex::new(header),
            cache: Mutex::new(LruCache::new(cache_capacity)),
            dirty: Mutex::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &PagedConfig {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    pub fn max_key_size(&self) -> usize {
        self.config.max_key_size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn page_offset(&self, page_num: u64) -> u64 {
        self.config.file_header_size as u64 + page_num * self.config.page_size as u64
    }

    pub fn total_page_count(&self) -> u64 {
        self.header.lock().total_count
    }

    pub fn record_count(&self) -> u64 {
        self.header.lock().record_count
    }

    pub fn set_record_count(&self, record_count: u64) {
        self.header.lock().record_count = record_count;
    }

    pub fn root_page(&self) -> Option<u64> {
        self.header.lock().root_page
    }

    pub fn set_root_page(&self, root_page: Option<u64>) {
        self.header.lock().root_page = root_page;
    }

    /// number of pages on the free list
    pub fn free_page_count(&self) -> StorageResult<u64> {
        let (mut next, total_count) = {
            let header = self.header.lock();
            (header.first_free, header.total_count)
        };

        let mut count = 0;
        while let Some(page_num) = next {
            count += 1;
            if count > total_count {
                return Err(StorageError::corrupt("free list contains a cycle"));
            }
            next = self.get_page(page_num)?.lock().header.next_page;
        }
        Ok(count)
    }

    pub fn get_page(&self, page_num: u64) -> StorageResult<PageRef> {
        self.check_open()?;

        if let Some(page) = self.dirty.lock().get(&page_num) {
            return Ok(page.clone());
        }
        if let Some(page) = self.cache.lock().get(&page_num) {
            return Ok(page.clone());
        }

        let total_count = self.total_page_count();
        if page_num >= total_count {
            return Err(StorageError::corrupt(format!("reference to page {} beyond the end of the file ({} pages)", page_num, total_count)));
        }

        let mut buf = vec![0u8; self.config.page_size];
        self.descriptors.checkout()?
            .read_at(self.page_offset(page_num), &mut buf)?;
        let page = Arc::new(Mutex::new(Page::deser(page_num, &buf)?));
        trace!("read page {} from disk", page_num);

        // a concurrent reader may have loaded the page in the meantime
        let mut cache = self.cache.lock();
        if let Some(existing) = cache.get(&page_num) {
            return Ok(existing.clone());
        }
        cache.put(page_num, page.clone());
        Ok(page)
    }

    /// Register a modified page for the next flush
    pub fn mark_dirty(&self, page_num: u64, page: &PageRef) {
        self.dirty.lock().insert(page_num, page.clone());
    }

    fn insert_dirty(&self, page: Page) -> PageRef {
        let page_num = page.page_num;
        let page = Arc::new(Mutex::new(page));
        self.cache.lock().put(page_num, page.clone());
        self.mark_dirty(page_num, &page);
        page
    }

    /// Take a page from the free list, or append a page to the file if the free list is empty.
    ///  The page is reset to the given status and key.
    pub fn allocate_page(&self, status: PageStatus, key: &[u8]) -> StorageResult<u64> {
        self.check_open()?;

        let first_free = self.header.lock().first_free;
        let page_num = match first_free {
            Some(page_num) => {
                let page_ref = self.get_page(page_num)?;
                let next_free = {
                    let mut page = page_ref.lock();
                    if !page.header.status.is_free() {
                        return Err(StorageError::corrupt(format!("page {} on the free list has status {:?}", page_num, page.header.status)));
                    }
                    let next_free = page.header.next_page;
                    page.clear(status);
                    page.header.next_page = None;
                    page.set_key(key);
                    next_free
                };
                self.mark_dirty(page_num, &page_ref);

                let mut header = self.header.lock();
                header.first_free = next_free;
                if next_free.is_none() {
                    header.last_free = None;
                }
                trace!("recycled page {}", page_num);
                page_num
            }
            None => {
                let page_num = {
                    let mut header = self.header.lock();
                    header.total_count += 1;
                    header.total_count - 1
                };
                let mut page = Page::new(page_num, status);
                page.set_key(key);
                self.insert_dirty(page);
                trace!("appended page {}", page_num);
                page_num
            }
        };
        Ok(page_num)
    }

    /// Put a page and everything chained to it through its `next_page` links on the free list
    pub fn unlink_pages(&self, first: u64) -> StorageResult<()> {
        self.check_open()?;

        let total_count = self.total_page_count();
        let mut visited = FxHashSet::default();
        let mut last = first;
        let mut next = Some(first);
        while let Some(page_num) = next {
            if !visited.insert(page_num) || visited.len() as u64 > total_count {
                return Err(StorageError::corrupt(format!("page chain starting at {} contains a cycle", first)));
            }
            let page_ref = self.get_page(page_num)?;
            {
                let mut page = page_ref.lock();
                if page.header.status.is_free() {
                    return Err(StorageError::corrupt(format!("page {} is freed twice", page_num)));
                }
                next = page.header.next_page;
                page.clear(PageStatus::Deleted);
            }
            self.mark_dirty(page_num, &page_ref);
            last = page_num;
        }

        let last_free = self.header.lock().last_free;
        if let Some(tail) = last_free {
            let tail_ref = self.get_page(tail)?;
            tail_ref.lock().header.next_page = Some(first);
            self.mark_dirty(tail, &tail_ref);
        }

        let mut header = self.header.lock();
        if last_free.is_none() {
            header.first_free = Some(first);
        }
        header.last_free = Some(last);
        trace!("freed {} pages starting at {}", visited.len(), first);
        Ok(())
    }

    /// Store a value in a page, continuing in overflow pages as needed. Overflow pages of a
    ///  previous value are reused, and the surplus of a longer previous value is freed.
    pub fn write_value(&self, page_num: u64, value: &[u8]) -> StorageResult<()> {
        self.check_open()?;
        let record_len = u32::try_from(value.len())
            .map_err(|_| StorageError::InvalidArgument(format!("value of {} bytes is too big", value.len())))?;

        let first_ref = self.get_page(page_num)?;
        let (mut rest, mut old_next) = {
            let mut first = first_ref.lock();
            let (head, rest) = value.split_at(first.data_capacity(self.config.page_size).min(value.len()));
            first.data = head.to_vec();
            first.header.record_len = record_len;
            (rest, first.header.next_page)
        };
        self.mark_dirty(page_num, &first_ref);

        let overflow_capacity = self.config.page_size - PAGE_HEADER_SIZE;
        let mut prev = first_ref;
        let mut prev_num = page_num;
        while !rest.is_empty() {
            let (chunk, remainder) = rest.split_at(overflow_capacity.min(rest.len()));
            rest = remainder;

            let cur_num = match old_next {
                Some(n) => {
                    let status = self.get_page(n)?.lock().header.status;
                    if status != PageStatus::Overflow {
                        return Err(StorageError::corrupt(format!("page {} in the overflow chain of page {} has status {:?}", n, page_num, status)));
                    }
                    n
                }
                None => self.allocate_page(PageStatus::Overflow, &[])?,
            };

            prev.lock().header.next_page = Some(cur_num);
            self.mark_dirty(prev_num, &prev);

            let cur = self.get_page(cur_num)?;
            {
                let mut page = cur.lock();
                old_next = page.header.next_page;
                page.data = chunk.to_vec();
                page.header.record_len = record_len;
            }
            self.mark_dirty(cur_num, &cur);
            prev = cur;
            prev_num = cur_num;
        }

        prev.lock().header.next_page = None;
        self.mark_dirty(prev_num, &prev);

        if let Some(stale) = old_next {
            debug!("value in page {} shrank, freeing overflow pages from {}", page_num, stale);
            self.unlink_pages(stale)?;
        }
        Ok(())
    }

    /// Read a value with its page's status and key, following the overflow chain
    pub fn read_value(&self, page_num: u64) -> StorageResult<StoredValue> {
        let (status, key, mut value, record_len, mut next) = {
            let page_ref = self.get_page(page_num)?;
            let page = page_ref.lock();
            (page.header.status, page.key.clone(), page.data.clone(), page.header.record_len as usize, page.header.next_page)
        };
        if status.is_free() || status == PageStatus::Overflow {
            return Err(StorageError::corrupt(format!("page {} with status {:?} does not start a value", page_num, status)));
        }

        let total_count = self.total_page_count();
        let mut num_visited = 1;
        while value.len() < record_len {
            let Some(n) = next else {
                return Err(StorageError::corrupt(format!("overflow chain of page {} ends after {} of {} bytes", page_num, value.len(), record_len)));
            };
            num_visited += 1;
            if num_visited > total_count {
                return Err(StorageError::corrupt(format!("overflow chain of page {} contains a cycle", page_num)));
            }

            let page_ref = self.get_page(n)?;
            let page = page_ref.lock();
            if page.header.status != PageStatus::Overflow {
                return Err(StorageError::corrupt(format!("page {} in the overflow chain of page {} has status {:?}", n, page_num, page.header.status)));
            }
            value.extend_from_slice(&page.data);
            next = page.header.next_page;
        }
        if value.len() != record_len {
            return Err(StorageError::corrupt(format!("value in page {} has {} bytes, expected {}", page_num, value.len(), record_len)));
        }

        Ok(StoredValue { status, key, value })
    }

    /// Write all dirty pages and the file header. Every dirty page is attempted; pages that
    ///  could not be written stay dirty, and the failures are reported once at the end.
    pub fn flush(&self) -> StorageResult<()> {
        self.check_open()?;

        let mut pages = self.dirty.lock()
            .drain()
            .collect::<Vec<_>>();
        pages.sort_by_key(|(page_num, _)| *page_num);

        let mut descriptor = self.descriptors.checkout()?;
        let mut buf = BytesMut::with_capacity(self.config.page_size);
        let mut failed = Vec::new();
        let mut first_error = None;

        for (page_num, page_ref) in pages {
            buf.clear();
            let result = page_ref.lock()
                .ser(self.config.page_size, &mut buf)
                .and_then(|_| descriptor.write_at(self.page_offset(page_num), &buf));

            if let Err(e) = result {
                warn!("failed to write page {}: {}", page_num, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
                failed.push((page_num, page_ref));
            }
        }

        let num_failed = failed.len();
        if num_failed > 0 {
            // keep them for the next attempt unless they were modified again in the meantime
            let mut dirty = self.dirty.lock();
            for (page_num, page_ref) in failed {
                dirty.entry(page_num).or_insert(page_ref);
            }
        }

        buf.clear();
        self.header.lock().ser(&mut buf);
        descriptor.write_at(0, &buf)?;
        descriptor.sync()?;

        match first_error {
            None => {
                trace!("flushed {:?}", self.path);
                Ok(())
            }
            Some(e) => {
                error!("flushing {:?} failed for {} pages", self.path, num_failed);
                let source = match e {
                    StorageError::Io { source, .. } => source,
                    other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
                };
                Err(StorageError::FlushFailed { failed: num_failed, source })
            }
        }
    }

    /// Flush and release all file handles. Closing a closed file has no effect.
    pub fn close(&self) -> StorageResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let result = self.flush();
        self.closed.store(true, Ordering::Release);
        self.descriptors.close();
        self.cache.lock().clear();
        self.dirty.lock().clear();
        debug!("closed {:?}", self.path);
        result
    }

    /// Close without flushing, and delete the file
    pub fn drop_file(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        self.descriptors.close();
        self.cache.lock().clear();
        self.dirty.lock().clear();

        std::fs::remove_file(&self.path)
            .map_err(|e| StorageError::io(format!("deleting {:?}", self.path), e))?;
        debug!("deleted {:?}", self.path);
        Ok(())
    }
}

impl Drop for Paged {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close() {
                warn!("error closing {:?} on drop: {}", self.path, e);
            }
        }
    }
}
