//! # Pager and PagerState
//!
//! The pager owns the raw backing storage of the data file and translates
//! page numbers into bounds-checked byte ranges. Two backings exist behind
//! one contract:
//!
//! - **Mmap**: a memory-mapped file (`memmap2`). Growth flushes, extends the
//!   file, and remaps.
//! - **Memory**: a plain heap buffer for ephemeral databases and tests.
//!   Growth allocates a larger buffer and copies, `sync` is a no-op.
//!
//! ## PagerState Generations
//!
//! Every growth publishes a new immutable [`PagerState`] — an `Arc`'d
//! snapshot of `{ generation, allocated bytes, page count }`. Transactions
//! pin the state current at their start (and any states published while they
//! run), so a reader that began before a growth keeps a coherent view of its
//! allocation boundary: growth only ever appends, the first `allocated`
//! bytes are preserved byte for byte, and the old state stays alive until
//! its last holder drops it. "Releasing" a state is simply dropping the
//! `Arc`; there is no manual reference counting.
//!
//! ## Access Discipline
//!
//! All page access goes through copy-in/copy-out slice operations guarded by
//! a `RwLock` over the backing: concurrent readers proceed in parallel,
//! growth takes the write half for the duration of the remap. No raw
//! pointers escape this module.
//!
//! ## Growth Contract
//!
//! `allocate_more_pages(new_len)`:
//! - `new_len < allocated` fails with `StorageError::InvalidArgument`,
//!   state untouched — the pager never shrinks.
//! - `new_len == allocated` is a no-op.
//! - otherwise the backing grows and a new `PagerState` is published.
//!
//! `ensure_continuous(page, count)` rounds growth up to the configured
//! increment so repeated small allocations do not thrash the mapping.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};

use crate::errors::StorageError;

/// An immutable allocation-generation snapshot. See the module docs.
#[derive(Debug, PartialEq, Eq)]
pub struct PagerState {
    pub generation: u64,
    pub allocated: u64,
    pub page_count: u64,
}

pub(crate) enum Backing {
    Memory(Vec<u8>),
    Mmap(MmapBacking),
}

pub(crate) struct MmapBacking {
    file: File,
    map: Option<MmapMut>,
    path: PathBuf,
    len: u64,
}

impl Backing {
    pub(crate) fn memory(len: u64) -> Self {
        Backing::Memory(vec![0u8; len as usize])
    }

    pub(crate) fn create_file(path: &Path, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create file '{}'", path.display()))?;
        file.set_len(len)
            .map_err(|e| disk_error(e, path))
            .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), len))?;

        let map = map_file(&file, len, path)?;
        Ok(Backing::Mmap(MmapBacking {
            file,
            map,
            path: path.to_path_buf(),
            len,
        }))
    }

    pub(crate) fn open_file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open file '{}'", path.display()))?;
        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        let map = map_file(&file, len, path)?;
        Ok(Backing::Mmap(MmapBacking {
            file,
            map,
            path: path.to_path_buf(),
            len,
        }))
    }

    pub(crate) fn len(&self) -> u64 {
        match self {
            Backing::Memory(buf) => buf.len() as u64,
            Backing::Mmap(m) => m.len,
        }
    }

    pub(crate) fn read_into(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let end = offset + out.len() as u64;
        ensure!(
            end <= self.len(),
            "read of {} bytes at offset {} past backing length {}",
            out.len(),
            offset,
            self.len()
        );
        match self {
            Backing::Memory(buf) => {
                out.copy_from_slice(&buf[offset as usize..end as usize]);
            }
            Backing::Mmap(m) => {
                let map = m.map.as_ref().ok_or_else(|| {
                    eyre::eyre!("read from unmapped empty file '{}'", m.path.display())
                })?;
                out.copy_from_slice(&map[offset as usize..end as usize]);
            }
        }
        Ok(())
    }

    pub(crate) fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        ensure!(
            end <= self.len(),
            "write of {} bytes at offset {} past backing length {}",
            data.len(),
            offset,
            self.len()
        );
        match self {
            Backing::Memory(buf) => {
                buf[offset as usize..end as usize].copy_from_slice(data);
            }
            Backing::Mmap(m) => {
                let map = m.map.as_mut().ok_or_else(|| {
                    eyre::eyre!("write to unmapped empty file '{}'", m.path.display())
                })?;
                map[offset as usize..end as usize].copy_from_slice(data);
            }
        }
        Ok(())
    }

    /// Grow to `new_len` bytes, preserving existing content. `new_len` must
    /// be strictly greater than the current length.
    pub(crate) fn grow_to(&mut self, new_len: u64) -> Result<()> {
        match self {
            Backing::Memory(buf) => {
                buf.resize(new_len as usize, 0);
            }
            Backing::Mmap(m) => {
                if let Some(map) = m.map.as_ref() {
                    map.flush().wrap_err("failed to flush mmap before grow")?;
                }
                m.file
                    .set_len(new_len)
                    .map_err(|e| disk_error(e, &m.path))
                    .wrap_err_with(|| {
                        format!("failed to extend '{}' to {} bytes", m.path.display(), new_len)
                    })?;
                m.map = map_file(&m.file, new_len, &m.path)?;
                m.len = new_len;
            }
        }
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        match self {
            Backing::Memory(_) => Ok(()),
            Backing::Mmap(m) => match m.map.as_ref() {
                Some(map) => map
                    .flush()
                    .wrap_err_with(|| format!("failed to sync '{}'", m.path.display())),
                None => Ok(()),
            },
        }
    }
}

fn map_file(file: &File, len: u64, path: &Path) -> Result<Option<MmapMut>> {
    if len == 0 {
        return Ok(None);
    }
    // SAFETY: the file is opened read+write by this process and the map is
    // dropped before any remap replaces it. All access is bounds-checked
    // slice indexing through Backing.
    let map = unsafe {
        MmapMut::map_mut(file)
            .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
    };
    Ok(Some(map))
}

fn disk_error(e: std::io::Error, path: &Path) -> eyre::Report {
    // ENOSPC during grow is resource exhaustion, not a usage error.
    if e.raw_os_error() == Some(28) {
        eyre::Report::new(StorageError::DiskFull(path.display().to_string()))
    } else {
        eyre::Report::new(e)
    }
}

pub struct Pager {
    page_size: usize,
    growth_increment: u64,
    backing: RwLock<Backing>,
    current: Mutex<Arc<PagerState>>,
}

impl Pager {
    pub fn in_memory(page_size: usize, growth_increment_pages: u64) -> Self {
        Self::with_backing(Backing::memory(0), page_size, growth_increment_pages)
    }

    pub fn create_file(path: &Path, page_size: usize, growth_increment_pages: u64) -> Result<Self> {
        let backing = Backing::create_file(path, 0)?;
        Ok(Self::with_backing(backing, page_size, growth_increment_pages))
    }

    pub fn open_file(path: &Path, page_size: usize, growth_increment_pages: u64) -> Result<Self> {
        let backing = Backing::open_file(path)?;
        ensure!(
            backing.len() % page_size as u64 == 0,
            "data file '{}' length {} is not a multiple of page size {}",
            path.display(),
            backing.len(),
            page_size
        );
        Ok(Self::with_backing(backing, page_size, growth_increment_pages))
    }

    fn with_backing(backing: Backing, page_size: usize, growth_increment_pages: u64) -> Self {
        let allocated = backing.len();
        Self {
            page_size,
            growth_increment: growth_increment_pages * page_size as u64,
            backing: RwLock::new(backing),
            current: Mutex::new(Arc::new(PagerState {
                generation: 1,
                allocated,
                page_count: allocated / page_size as u64,
            })),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The current state. Callers that need a stable view across their own
    /// lifetime (transactions) hold on to the returned `Arc`.
    pub fn state(&self) -> Arc<PagerState> {
        self.current.lock().clone()
    }

    pub fn number_of_allocated_pages(&self) -> u64 {
        self.state().page_count
    }

    pub fn allocated_size(&self) -> u64 {
        self.state().allocated
    }

    /// Grow the backing store to `new_len` bytes and publish a new
    /// [`PagerState`]. Shrinking is a caller error; an unchanged size is a
    /// no-op returning the current state.
    pub fn allocate_more_pages(&self, new_len: u64) -> Result<Arc<PagerState>> {
        let mut backing = self.backing.write();
        let mut current = self.current.lock();

        if new_len < current.allocated {
            return Err(eyre::Report::new(StorageError::InvalidArgument(format!(
                "cannot set the length to {} which is less than the current length {}",
                new_len, current.allocated
            ))));
        }
        if new_len == current.allocated {
            return Ok(current.clone());
        }

        backing.grow_to(new_len)?;

        let next = Arc::new(PagerState {
            generation: current.generation + 1,
            allocated: new_len,
            page_count: new_len / self.page_size as u64,
        });
        *current = next.clone();
        Ok(next)
    }

    /// Make sure the run `[page, page + count)` is allocated, growing by at
    /// least the configured increment. Returns the new state when growth
    /// happened.
    pub fn ensure_continuous(&self, page: u64, count: u64) -> Result<Option<Arc<PagerState>>> {
        let needed = (page + count) * self.page_size as u64;
        let state = self.state();
        if needed <= state.allocated {
            return Ok(None);
        }
        let target = needed.max(state.allocated + self.growth_increment);
        Ok(Some(self.allocate_more_pages(target)?))
    }

    pub fn read_page_into(&self, page: u64, out: &mut [u8]) -> Result<()> {
        ensure!(
            out.len() == self.page_size,
            "page buffer is {} bytes, expected {}",
            out.len(),
            self.page_size
        );
        self.read_into(page, out)
    }

    /// Read a contiguous run of `count` pages starting at `page`.
    pub fn read_pages(&self, page: u64, count: u64) -> Result<Vec<u8>> {
        let mut out = vec![0u8; (count * self.page_size as u64) as usize];
        self.read_into(page, &mut out)?;
        Ok(out)
    }

    fn read_into(&self, page: u64, out: &mut [u8]) -> Result<()> {
        let state = self.state();
        let pages = (out.len() as u64).div_ceil(self.page_size as u64);
        ensure!(
            page + pages <= state.page_count,
            "page run [{}, {}) out of bounds (allocated pages: {})",
            page,
            page + pages,
            state.page_count
        );
        self.backing
            .read()
            .read_into(page * self.page_size as u64, out)
    }

    /// Copy `data` (one page or a whole overflow run) onto the page range
    /// starting at `page`, growing the backing first if needed.
    pub fn write_pages(&self, page: u64, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() % self.page_size == 0,
            "write of {} bytes is not page aligned",
            data.len()
        );
        let count = (data.len() / self.page_size) as u64;
        self.ensure_continuous(page, count)?;
        self.backing
            .write()
            .write_at(page * self.page_size as u64, data)
    }

    pub fn sync(&self) -> Result<()> {
        self.backing.read().sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 4096;

    fn mem_pager() -> Pager {
        Pager::in_memory(PAGE_SIZE, 8)
    }

    #[test]
    fn starts_empty_with_generation_one() {
        let pager = mem_pager();
        let state = pager.state();
        assert_eq!(state.generation, 1);
        assert_eq!(state.allocated, 0);
        assert_eq!(state.page_count, 0);
    }

    #[test]
    fn grow_publishes_new_state_and_keeps_old_alive() {
        let pager = mem_pager();
        let old = pager.state();

        let grown = pager
            .allocate_more_pages(64 * PAGE_SIZE as u64)
            .unwrap();

        assert_eq!(grown.generation, old.generation + 1);
        assert_eq!(grown.page_count, 64);
        // The old snapshot is untouched for anyone still holding it.
        assert_eq!(old.page_count, 0);
        assert_eq!(pager.number_of_allocated_pages(), 64);
    }

    #[test]
    fn shrink_fails_with_invalid_argument_and_leaves_state() {
        let pager = mem_pager();
        pager.allocate_more_pages(16 * PAGE_SIZE as u64).unwrap();
        let before = pager.state();

        let err = pager
            .allocate_more_pages(8 * PAGE_SIZE as u64)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::InvalidArgument(_))
        ));

        let after = pager.state();
        assert_eq!(before.generation, after.generation);
        assert_eq!(before.allocated, after.allocated);
    }

    #[test]
    fn same_size_is_noop() {
        let pager = mem_pager();
        pager.allocate_more_pages(16 * PAGE_SIZE as u64).unwrap();
        let before = pager.state();
        let state = pager.allocate_more_pages(16 * PAGE_SIZE as u64).unwrap();
        assert_eq!(state.generation, before.generation);
    }

    #[test]
    fn grow_preserves_existing_bytes() {
        let pager = mem_pager();
        pager.allocate_more_pages(4 * PAGE_SIZE as u64).unwrap();

        let mut page = vec![0u8; PAGE_SIZE];
        page[0] = 0xCA;
        page[PAGE_SIZE - 1] = 0xFE;
        pager.write_pages(2, &page).unwrap();

        pager.allocate_more_pages(128 * PAGE_SIZE as u64).unwrap();

        let back = pager.read_pages(2, 1).unwrap();
        assert_eq!(back[0], 0xCA);
        assert_eq!(back[PAGE_SIZE - 1], 0xFE);
    }

    #[test]
    fn overflow_run_round_trip() {
        // 0 -> 64 pages, a 3-page value at page 10, read back exactly.
        let pager = mem_pager();
        pager.allocate_more_pages(64 * PAGE_SIZE as u64).unwrap();
        assert_eq!(pager.number_of_allocated_pages(), 64);

        let mut run = vec![0u8; 3 * PAGE_SIZE];
        for (i, b) in run.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        pager.write_pages(10, &run).unwrap();

        let back = pager.read_pages(10, 3).unwrap();
        assert_eq!(back, run);
        assert_eq!(pager.number_of_allocated_pages(), 64);
    }

    #[test]
    fn ensure_continuous_grows_by_increment() {
        let pager = mem_pager();
        let state = pager.ensure_continuous(0, 1).unwrap().unwrap();
        // one page needed, but growth is rounded up to the increment
        assert_eq!(state.page_count, 8);
        assert!(pager.ensure_continuous(0, 4).unwrap().is_none());
    }

    #[test]
    fn out_of_bounds_read_fails() {
        let pager = mem_pager();
        pager.allocate_more_pages(4 * PAGE_SIZE as u64).unwrap();
        assert!(pager.read_pages(4, 1).is_err());
        assert!(pager.read_pages(3, 2).is_err());
        assert!(pager.read_pages(3, 1).is_ok());
    }

    #[test]
    fn file_backed_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.pv");

        {
            let pager = Pager::create_file(&path, PAGE_SIZE, 8).unwrap();
            pager.allocate_more_pages(4 * PAGE_SIZE as u64).unwrap();
            let mut page = vec![0u8; PAGE_SIZE];
            page[100] = 0xAB;
            pager.write_pages(1, &page).unwrap();
            pager.sync().unwrap();
        }

        let pager = Pager::open_file(&path, PAGE_SIZE, 8).unwrap();
        assert_eq!(pager.number_of_allocated_pages(), 4);
        let page = pager.read_pages(1, 1).unwrap();
        assert_eq!(page[100], 0xAB);
    }

    #[test]
    fn memory_sync_is_noop() {
        let pager = mem_pager();
        pager.sync().unwrap();
    }
}
