use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::trace;
use parking_lot::Mutex;

use crate::pages::traits::Serialize;
use crate::pages::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};

pub const DISK_STORAGE: &str = "data/pagestore/";

const DB_FILE: &str = "pages.db";
const LOG_FILE: &str = "wal.log";

#[cfg(test)]
pub fn test_path() -> String {
    use uuid::Uuid;

    let id = Uuid::new_v4();
    format!("data/test/test_{}/", id)
}

/// Fixed-size page I/O over a single data file plus an append-only log file.
/// Cloneable so the buffer pool and the log manager can share the handles.
#[derive(Debug, Clone)]
pub struct DiskManager {
    db_file: Arc<Mutex<File>>,
    log_file: Arc<Mutex<File>>,
    next_page_id: Arc<AtomicI32>,
}

impl DiskManager {
    pub fn new(path: &str) -> Result<Self> {
        let path = Path::new(path);
        std::fs::create_dir_all(path).context("creating storage directory")?;

        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(DB_FILE))
            .context("opening page file")?;

        let log_file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path.join(LOG_FILE))
            .context("opening log file")?;

        // page 0 is reserved for the header page, fresh ids start after the
        // highest page already on disk
        let pages_on_disk = (db_file.metadata()?.len() as usize).div_ceil(PAGE_SIZE);
        let next_page_id = pages_on_disk.max(1) as PageId;

        Ok(Self {
            db_file: Arc::new(Mutex::new(db_file)),
            log_file: Arc::new(Mutex::new(log_file)),
            next_page_id: Arc::new(AtomicI32::new(next_page_id)),
        })
    }

    /// Reads a page image. Bytes past the end of the file are zero-filled so
    /// never-written pages come back as empty pages.
    pub fn read_page(&self, page_id: PageId) -> Result<Page> {
        if page_id == INVALID_PAGE_ID {
            return Err(anyhow!("Asked to read a page with invalid ID"));
        }

        let mut buffer = [0u8; PAGE_SIZE];
        let offset = page_id as u64 * PAGE_SIZE as u64;

        let mut file = self.db_file.lock();
        let file_len = file.metadata()?.len();
        if offset < file_len {
            file.seek(SeekFrom::Start(offset))?;
            let mut filled = 0;
            while filled < PAGE_SIZE {
                let n = file.read(&mut buffer[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buffer[filled..].fill(0);
        }
        drop(file);

        let mut page = Page::from_bytes(&buffer);
        page.set_page_id(page_id);
        Ok(page)
    }

    pub fn write_page(&self, page: &Page) -> Result<()> {
        if page.get_page_id() == INVALID_PAGE_ID {
            return Err(anyhow!("Asked to write a page with invalid ID"));
        }

        let offset = page.get_page_id() as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(page.to_bytes())
            .context("writing page to disk")?;
        file.flush()?;
        Ok(())
    }

    pub fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Bookkeeping hook only, freed ids are not reused.
    pub fn deallocate_page(&self, page_id: PageId) {
        trace!("deallocated page {page_id}");
    }

    pub fn append_log(&self, bytes: &[u8]) -> Result<()> {
        let mut file = self.log_file.lock();
        file.write_all(bytes).context("appending to log file")?;
        file.sync_data().context("syncing log file")?;
        Ok(())
    }

    #[cfg(test)]
    pub fn log_len(&self) -> u64 {
        self.log_file.lock().metadata().unwrap().len()
    }
}
