use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::common::{PageId, Result, PAGE_SIZE};

/// DiskManager reads and writes fixed-size pages of a single database file
/// and hands out page ids from a monotonically increasing counter. Reopening
/// an existing file resumes the counter from the file size.
pub struct DiskManager {
    file: Mutex<File>,
    /// Pages allocated so far; also the id of the next allocation
    num_pages: AtomicU32,
    num_reads: AtomicU32,
    num_writes: AtomicU32,
}

impl DiskManager {
    /// Opens (or creates) the database file at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;

        let num_pages = (file.metadata()?.len() / PAGE_SIZE as u64) as u32;

        Ok(Self {
            file: Mutex::new(file),
            num_pages: AtomicU32::new(num_pages),
            num_reads: AtomicU32::new(0),
            num_writes: AtomicU32::new(0),
        })
    }

    /// Reads one page into `buf`. Reading past the end of the file
    /// zero-fills the remainder.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        assert_eq!(buf.len(), PAGE_SIZE, "buffer must be one page");

        let offset = page_id.as_u32() as u64 * PAGE_SIZE as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        let mut read = 0;
        while read < PAGE_SIZE {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf[read..].fill(0);

        self.num_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes one page from `buf`, durable on return.
    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        assert_eq!(buf.len(), PAGE_SIZE, "buffer must be one page");

        let offset = page_id.as_u32() as u64 * PAGE_SIZE as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        file.flush()?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Allocates the next page id and extends the file with a zeroed page so
    /// the counter can be recovered from the file size on reopen.
    pub fn allocate_page(&self) -> Result<PageId> {
        let page_id = PageId::new(self.num_pages.fetch_add(1, Ordering::SeqCst));
        self.write_page(page_id, &[0u8; PAGE_SIZE])?;
        Ok(page_id)
    }

    /// Returns a page id to the manager. Reclamation is deferred; the id is
    /// simply never handed out again within this file's lifetime.
    pub fn deallocate_page(&self, _page_id: PageId) {}

    pub fn num_pages(&self) -> u32 {
        self.num_pages.load(Ordering::Relaxed)
    }

    pub fn num_reads(&self) -> u32 {
        self.num_reads.load(Ordering::Relaxed)
    }

    pub fn num_writes(&self) -> u32 {
        self.num_writes.load(Ordering::Relaxed)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.file.get_mut().sync_all();
    }
}
