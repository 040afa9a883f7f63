//! # Scratch Buffer Pool
//!
//! Write transactions never touch the data file. The first time a
//! transaction dirties a page, the modified copy is staged in a *scratch
//! slot* — a run of pages inside a scratch file — and only the background
//! applicator later moves committed content into the data file. This
//! decouples writer latency from data-file I/O and is what makes
//! copy-on-write snapshots cheap.
//!
//! ## Slots
//!
//! A slot is `(scratch file id, page within the file, run length)` and maps
//! logically to a target data-file page (the mapping lives in the committed
//! page table, not here). Allocation is free-list first, then bump
//! allocation in the newest file, then a new scratch file.
//!
//! ## Reclamation
//!
//! A slot must not be reused while anyone can still read it:
//!
//! - an uncommitted writer's slots are returned directly on rollback;
//! - a superseded or flushed slot is *deferred* with the transaction id
//!   after which it is dead, and [`ScratchBufferPool::reclaim`] frees
//!   deferred slots once the reader watermark passes that id.
//!
//! ## Files
//!
//! File-backed environments keep scratch files as `scratch.NNNN.buffers`
//! inside the environment's `temp` directory, which is what the storage
//! report scans for the temp-buffers section. In-memory environments use
//! heap buffers.

use std::path::PathBuf;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use serde::Serialize;

use crate::storage::Backing;
use crate::txn::TxnId;

pub const SCRATCH_BUFFER_EXTENSION: &str = "buffers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScratchSlot {
    pub file: u32,
    pub page: u64,
    pub pages: u32,
}

struct ScratchFile {
    backing: Backing,
    next_free: u64,
    pages: u64,
}

struct PoolInner {
    files: Vec<ScratchFile>,
    free: Vec<ScratchSlot>,
    deferred: Vec<(TxnId, ScratchSlot)>,
}

pub struct ScratchBufferPool {
    page_size: usize,
    file_pages: u64,
    dir: Option<PathBuf>,
    inner: Mutex<PoolInner>,
}

/// Point-in-time pool statistics for the storage report.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScratchBufferPoolInfo {
    pub number_of_scratch_files: usize,
    pub allocated_pages: u64,
    pub free_pages: u64,
    pub pages_awaiting_reclamation: u64,
}

impl ScratchBufferPool {
    /// `dir`: where scratch files live; `None` keeps everything on the heap.
    pub fn new(page_size: usize, file_pages: u64, dir: Option<PathBuf>) -> Self {
        Self {
            page_size,
            file_pages,
            dir,
            inner: Mutex::new(PoolInner {
                files: Vec::new(),
                free: Vec::new(),
                deferred: Vec::new(),
            }),
        }
    }

    /// Allocate a slot covering `pages` contiguous scratch pages.
    pub fn allocate(&self, pages: u32) -> Result<ScratchSlot> {
        ensure!(pages > 0, "cannot allocate an empty scratch slot");
        let mut inner = self.inner.lock();

        // Free list first: first fit, remainder goes back.
        if let Some(idx) = inner.free.iter().position(|s| s.pages >= pages) {
            let entry = inner.free.swap_remove(idx);
            if entry.pages > pages {
                inner.free.push(ScratchSlot {
                    file: entry.file,
                    page: entry.page + pages as u64,
                    pages: entry.pages - pages,
                });
            }
            return Ok(ScratchSlot {
                file: entry.file,
                page: entry.page,
                pages,
            });
        }

        // Bump allocation in the newest file.
        if let Some(file) = inner.files.last_mut() {
            if file.next_free + pages as u64 <= file.pages {
                let page = file.next_free;
                file.next_free += pages as u64;
                return Ok(ScratchSlot {
                    file: (inner.files.len() - 1) as u32,
                    page,
                    pages,
                });
            }
        }

        // A run larger than a whole scratch file gets a dedicated,
        // appropriately sized file.
        let file_pages = self.file_pages.max(pages as u64);
        let id = inner.files.len() as u32;
        let mut file = self.create_file(id, file_pages)?;
        file.next_free = pages as u64;
        inner.files.push(file);
        Ok(ScratchSlot {
            file: id,
            page: 0,
            pages,
        })
    }

    fn create_file(&self, id: u32, pages: u64) -> Result<ScratchFile> {
        let bytes = pages * self.page_size as u64;
        let backing = match &self.dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .wrap_err_with(|| format!("failed to create temp dir '{}'", dir.display()))?;
                let name = format!("scratch.{:04}.{}", id, SCRATCH_BUFFER_EXTENSION);
                Backing::create_file(&dir.join(name), bytes)?
            }
            None => Backing::memory(bytes),
        };
        Ok(ScratchFile {
            backing,
            next_free: 0,
            pages,
        })
    }

    pub fn write(&self, slot: ScratchSlot, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() == slot.pages as usize * self.page_size,
            "scratch write of {} bytes into a {}-page slot",
            data.len(),
            slot.pages
        );
        let mut inner = self.inner.lock();
        let file = inner
            .files
            .get_mut(slot.file as usize)
            .ok_or_else(|| eyre::eyre!("scratch file {} does not exist", slot.file))?;
        file.backing
            .write_at(slot.page * self.page_size as u64, data)
    }

    pub fn read(&self, slot: ScratchSlot) -> Result<Vec<u8>> {
        let mut out = vec![0u8; slot.pages as usize * self.page_size];
        self.read_into(slot, &mut out)?;
        Ok(out)
    }

    pub fn read_into(&self, slot: ScratchSlot, out: &mut [u8]) -> Result<()> {
        ensure!(
            out.len() <= slot.pages as usize * self.page_size,
            "scratch read of {} bytes from a {}-page slot",
            out.len(),
            slot.pages
        );
        let inner = self.inner.lock();
        let file = inner
            .files
            .get(slot.file as usize)
            .ok_or_else(|| eyre::eyre!("scratch file {} does not exist", slot.file))?;
        file.backing
            .read_into(slot.page * self.page_size as u64, out)
    }

    /// Immediately return a slot to the free list. Only valid for slots no
    /// transaction can still observe (rollback of the owning writer).
    pub fn free(&self, slot: ScratchSlot) {
        self.inner.lock().free.push(slot);
    }

    /// Queue a slot for reclamation once the reader watermark passes
    /// `dead_after`.
    pub fn defer_free(&self, slot: ScratchSlot, dead_after: TxnId) {
        self.inner.lock().deferred.push((dead_after, slot));
    }

    /// Free every deferred slot whose last dependent snapshot is below
    /// `watermark`. Returns the number of slots reclaimed.
    pub fn reclaim(&self, watermark: TxnId) -> usize {
        let mut inner = self.inner.lock();
        let deferred = std::mem::take(&mut inner.deferred);
        let mut reclaimed = 0;
        for (dead_after, slot) in deferred {
            if dead_after < watermark {
                inner.free.push(slot);
                reclaimed += 1;
            } else {
                inner.deferred.push((dead_after, slot));
            }
        }
        reclaimed
    }

    pub fn info(&self) -> ScratchBufferPoolInfo {
        let inner = self.inner.lock();
        ScratchBufferPoolInfo {
            number_of_scratch_files: inner.files.len(),
            allocated_pages: inner.files.iter().map(|f| f.pages).sum(),
            free_pages: inner.free.iter().map(|s| s.pages as u64).sum(),
            pages_awaiting_reclamation: inner.deferred.iter().map(|(_, s)| s.pages as u64).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 4096;

    fn pool() -> ScratchBufferPool {
        ScratchBufferPool::new(PAGE_SIZE, 32, None)
    }

    #[test]
    fn allocate_write_read_round_trip() {
        let pool = pool();
        let slot = pool.allocate(1).unwrap();

        let mut data = vec![0u8; PAGE_SIZE];
        data[17] = 0x5A;
        pool.write(slot, &data).unwrap();

        assert_eq!(pool.read(slot).unwrap(), data);
    }

    #[test]
    fn multi_page_slot_is_contiguous() {
        let pool = pool();
        let slot = pool.allocate(3).unwrap();
        assert_eq!(slot.pages, 3);

        let data: Vec<u8> = (0..3 * PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        pool.write(slot, &data).unwrap();
        assert_eq!(pool.read(slot).unwrap(), data);
    }

    #[test]
    fn freed_slot_is_reused() {
        let pool = pool();
        let a = pool.allocate(2).unwrap();
        pool.free(a);
        let b = pool.allocate(2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn free_list_split_returns_remainder() {
        let pool = pool();
        let a = pool.allocate(4).unwrap();
        pool.free(a);

        let b = pool.allocate(1).unwrap();
        assert_eq!((b.file, b.page, b.pages), (a.file, a.page, 1));

        let c = pool.allocate(3).unwrap();
        assert_eq!((c.file, c.page, c.pages), (a.file, a.page + 1, 3));
    }

    #[test]
    fn deferred_slots_wait_for_watermark() {
        let pool = pool();
        let slot = pool.allocate(1).unwrap();
        pool.defer_free(slot, 10);

        assert_eq!(pool.reclaim(10), 0);
        assert_eq!(pool.info().pages_awaiting_reclamation, 1);

        assert_eq!(pool.reclaim(11), 1);
        assert_eq!(pool.info().free_pages, 1);
        assert_eq!(pool.info().pages_awaiting_reclamation, 0);
    }

    #[test]
    fn oversized_run_gets_dedicated_file() {
        let pool = pool();
        let slot = pool.allocate(100).unwrap();
        assert_eq!(slot.pages, 100);
        assert!(pool.info().allocated_pages >= 100);
    }

    #[test]
    fn file_backed_pool_creates_buffers_files() {
        let dir = tempdir().unwrap();
        let pool = ScratchBufferPool::new(PAGE_SIZE, 32, Some(dir.path().to_path_buf()));
        let slot = pool.allocate(1).unwrap();

        let data = vec![0xEEu8; PAGE_SIZE];
        pool.write(slot, &data).unwrap();
        assert_eq!(pool.read(slot).unwrap(), data);

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(names.iter().any(|n| n.ends_with(".buffers")));
    }

    #[test]
    fn second_file_opens_when_first_is_full() {
        let pool = ScratchBufferPool::new(PAGE_SIZE, 16, None);
        let a = pool.allocate(16).unwrap();
        let b = pool.allocate(1).unwrap();
        assert_ne!(a.file, b.file);
        assert_eq!(pool.info().number_of_scratch_files, 2);
    }
}
