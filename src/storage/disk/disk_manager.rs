use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Result as IoResult, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info};
use parking_lot::Mutex;

use crate::common::config::{PageId, DB_PAGE_SIZE, HEADER_PAGE_ID};

/// The `DiskManager` trait defines the basic operations for interacting with
/// the page store. Implementers must provide page-granular reads and writes
/// plus page id allocation.
///
/// Page id 0 ([`HEADER_PAGE_ID`]) is reserved for index root records and is
/// never handed out by `allocate_page`.
pub trait DiskManager: Send + Sync {
    fn write_page(&self, page_id: PageId, page_data: &[u8; DB_PAGE_SIZE]) -> IoResult<()>;
    fn read_page(&self, page_id: PageId, page_data: &mut [u8; DB_PAGE_SIZE]) -> IoResult<()>;
    fn allocate_page(&self) -> PageId;
    fn deallocate_page(&self, page_id: PageId);
}

/// The `FileDiskManager` is responsible for page I/O against a single
/// database file, with pages stored at offset `page_id * DB_PAGE_SIZE`.
pub struct FileDiskManager {
    file_name: String,
    db_io: Mutex<File>,
    next_page_id: AtomicU64,
    free_pages: Mutex<HashSet<PageId>>,
    num_writes: AtomicU64,
    num_reads: AtomicU64,
}

impl FileDiskManager {
    /// Creates a new `FileDiskManager` backed by the given database file.
    ///
    /// # Arguments
    ///
    /// * `db_file` - The path to the database file.
    pub fn new(db_file: impl AsRef<Path>) -> IoResult<Self> {
        let db_io = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_file.as_ref())?;

        // Resume allocation past any pages already present in the file.
        let len = db_io.metadata()?.len();
        let existing_pages = len / DB_PAGE_SIZE as u64;
        let next_page_id = existing_pages.max(HEADER_PAGE_ID + 1);

        Ok(Self {
            file_name: db_file.as_ref().to_string_lossy().into_owned(),
            db_io: Mutex::new(db_io),
            next_page_id: AtomicU64::new(next_page_id),
            free_pages: Mutex::new(HashSet::new()),
            num_writes: AtomicU64::new(0),
            num_reads: AtomicU64::new(0),
        })
    }

    pub fn get_file_name(&self) -> &str {
        &self.file_name
    }

    /// Number of page writes issued since creation.
    pub fn get_num_writes(&self) -> u64 {
        self.num_writes.load(Ordering::SeqCst)
    }

    /// Number of page reads issued since creation.
    pub fn get_num_reads(&self) -> u64 {
        self.num_reads.load(Ordering::SeqCst)
    }

    /// Flushes any buffered data to disk before shutdown.
    pub fn shut_down(&self) -> IoResult<()> {
        let db_io = self.db_io.lock();
        db_io.sync_all()?;
        info!("Shutdown complete");
        Ok(())
    }
}

impl DiskManager for FileDiskManager {
    fn write_page(&self, page_id: PageId, page_data: &[u8; DB_PAGE_SIZE]) -> IoResult<()> {
        let offset = page_id * DB_PAGE_SIZE as u64;
        let mut db_io = self.db_io.lock();
        db_io.seek(SeekFrom::Start(offset))?;
        db_io.write_all(page_data)?;
        db_io.flush()?;
        self.num_writes.fetch_add(1, Ordering::SeqCst);
        debug!("Wrote page {} at offset {}", page_id, offset);
        Ok(())
    }

    fn read_page(&self, page_id: PageId, page_data: &mut [u8; DB_PAGE_SIZE]) -> IoResult<()> {
        let offset = page_id * DB_PAGE_SIZE as u64;
        let mut db_io = self.db_io.lock();
        let file_len = db_io.metadata()?.len();
        if offset >= file_len {
            // Never-written page reads back as zeroes.
            page_data.fill(0);
            return Ok(());
        }
        db_io.seek(SeekFrom::Start(offset))?;
        let mut read_so_far = 0;
        while read_so_far < DB_PAGE_SIZE {
            let n = db_io.read(&mut page_data[read_so_far..])?;
            if n == 0 {
                page_data[read_so_far..].fill(0);
                break;
            }
            read_so_far += n;
        }
        self.num_reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn allocate_page(&self) -> PageId {
        let mut free = self.free_pages.lock();
        if let Some(&page_id) = free.iter().next() {
            free.remove(&page_id);
            return page_id;
        }
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    fn deallocate_page(&self, page_id: PageId) {
        debug_assert_ne!(page_id, HEADER_PAGE_ID, "cannot deallocate the header page");
        self.free_pages.lock().insert(page_id);
    }
}

/// In-memory page store used by unit and concurrency tests.
pub struct MemoryDiskManager {
    pages: Mutex<HashMap<PageId, Box<[u8; DB_PAGE_SIZE]>>>,
    next_page_id: AtomicU64,
    free_pages: Mutex<HashSet<PageId>>,
}

impl MemoryDiskManager {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            next_page_id: AtomicU64::new(HEADER_PAGE_ID + 1),
            free_pages: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for MemoryDiskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskManager for MemoryDiskManager {
    fn write_page(&self, page_id: PageId, page_data: &[u8; DB_PAGE_SIZE]) -> IoResult<()> {
        let mut pages = self.pages.lock();
        pages.insert(page_id, Box::new(*page_data));
        Ok(())
    }

    fn read_page(&self, page_id: PageId, page_data: &mut [u8; DB_PAGE_SIZE]) -> IoResult<()> {
        let pages = self.pages.lock();
        match pages.get(&page_id) {
            Some(stored) => page_data.copy_from_slice(&stored[..]),
            None => page_data.fill(0),
        }
        Ok(())
    }

    fn allocate_page(&self) -> PageId {
        let mut free = self.free_pages.lock();
        if let Some(&page_id) = free.iter().next() {
            free.remove(&page_id);
            return page_id;
        }
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    fn deallocate_page(&self, page_id: PageId) {
        debug_assert_ne!(page_id, HEADER_PAGE_ID, "cannot deallocate the header page");
        self.pages.lock().remove(&page_id);
        self.free_pages.lock().insert(page_id);
    }
}
