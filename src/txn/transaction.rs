//! # Low-Level Transactions
//!
//! A [`LowLevelTransaction`] is the page-granular unit of isolation. Read
//! transactions pin the committed state and read through it; the single
//! write transaction additionally keeps a private dirty set of page copies
//! and publishes them all at once on commit.
//!
//! ## Page Resolution
//!
//! Every page read resolves in a fixed order:
//!
//! 1. the transaction's own dirty set (writers only),
//! 2. the pinned snapshot's page table (scratch content committed by
//!    earlier transactions but not yet applied to the data file),
//! 3. the data file.
//!
//! ## Commit
//!
//! Commit writes the dirty pages to scratch slots, appends a single journal
//! record, syncs it when configured, then swaps in a successor
//! [`CommittedState`]. The transaction is durable the moment the journal
//! sync returns; the data file catches up asynchronously.
//!
//! ## Runs
//!
//! Multi-page content (overflow values, stream chunks) occupies a run of
//! consecutive pages allocated together. Runs are addressed by their first
//! page and are read, modified and freed as a unit.

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::MutexGuard;

use crate::env::StorageEnvironment;
use crate::errors::StorageError;
use crate::journal::PageDiff;
use crate::scratch::ScratchSlot;
use crate::tree::TreeStateHeader;
use crate::txn::{CommittedState, PageVersion, TxnId, TxnOutcome};

struct DirtyPage {
    /// Whole run content, a multiple of the page size.
    data: Vec<u8>,
}

struct WriteState<'env> {
    _writer: MutexGuard<'env, ()>,
    /// Keyed by the first page of each run.
    dirty: HashMap<u64, DirtyPage>,
    freed: Vec<u64>,
    next_page_number: u64,
    free_pages: Vec<u64>,
    root_objects: TreeStateHeader,
    callbacks: Vec<Box<dyn FnOnce(TxnOutcome) + Send>>,
}

pub struct LowLevelTransaction<'env> {
    env: &'env StorageEnvironment,
    id: TxnId,
    snapshot: Arc<CommittedState>,
    slot_idx: Option<usize>,
    write: Option<WriteState<'env>>,
}

impl<'env> LowLevelTransaction<'env> {
    pub(crate) fn new_read(env: &'env StorageEnvironment) -> Result<Self> {
        let snapshot = env.committed.read().clone();
        let slot_idx = env.tracker.register(snapshot.txn_id)?;
        Ok(Self {
            env,
            id: snapshot.txn_id,
            snapshot,
            slot_idx: Some(slot_idx),
            write: None,
        })
    }

    pub(crate) fn new_write(env: &'env StorageEnvironment) -> Result<Self> {
        // The writer lock comes first so the snapshot is guaranteed to
        // include the previous writer's commit.
        let writer = env.writer_lock.lock();
        let snapshot = env.committed.read().clone();
        let slot_idx = match env.tracker.register(snapshot.txn_id) {
            Ok(idx) => idx,
            Err(err) => return Err(err),
        };
        let id = env.tracker.allocate_id();
        let write = WriteState {
            _writer: writer,
            dirty: HashMap::new(),
            freed: Vec::new(),
            next_page_number: snapshot.next_page_number,
            free_pages: snapshot.free_pages.clone(),
            root_objects: snapshot.header.root_objects,
            callbacks: Vec::new(),
        };
        Ok(Self {
            env,
            id,
            snapshot,
            slot_idx: Some(slot_idx),
            write: Some(write),
        })
    }

    /// This transaction's id: the commit id for writers, the pinned
    /// snapshot's id for readers.
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn is_write(&self) -> bool {
        self.write.is_some()
    }

    pub fn page_size(&self) -> usize {
        self.env.options.page_size
    }

    pub(crate) fn options(&self) -> &crate::config::StorageOptions {
        &self.env.options
    }

    pub fn committed(&self) -> &Arc<CommittedState> {
        &self.snapshot
    }

    /// Root-objects tree state as this transaction sees it.
    pub fn root_objects_state(&self) -> TreeStateHeader {
        match &self.write {
            Some(write) => write.root_objects,
            None => self.snapshot.header.root_objects,
        }
    }

    pub fn set_root_objects_state(&mut self, state: TreeStateHeader) -> Result<()> {
        self.write_state()?.root_objects = state;
        Ok(())
    }

    /// First page number never allocated, as this transaction sees it.
    pub fn next_page_number(&self) -> u64 {
        match &self.write {
            Some(write) => write.next_page_number,
            None => self.snapshot.next_page_number,
        }
    }

    /// Pages available for reuse, counting ones freed by this transaction.
    pub fn free_page_count(&self) -> u64 {
        match &self.write {
            Some(write) => (write.free_pages.len() + write.freed.len()) as u64,
            None => self.snapshot.free_pages.len() as u64,
        }
    }

    /// Run `callback` with the transaction's final outcome, after commit
    /// has published or rollback has discarded its work.
    pub fn on_outcome(
        &mut self,
        callback: impl FnOnce(TxnOutcome) + Send + 'static,
    ) -> Result<()> {
        self.write_state()?.callbacks.push(Box::new(callback));
        Ok(())
    }

    fn write_state(&mut self) -> Result<&mut WriteState<'env>> {
        match &mut self.write {
            Some(write) => Ok(write),
            None => Err(eyre::Report::new(StorageError::InvalidArgument(
                "operation requires a write transaction".into(),
            ))),
        }
    }

    pub fn read_page(&self, page: u64) -> Result<Vec<u8>> {
        self.read_pages(page, 1)
    }

    /// Read a run of `count` consecutive pages starting at `page`.
    pub fn read_pages(&self, page: u64, count: u32) -> Result<Vec<u8>> {
        ensure!(count > 0, "cannot read an empty page run");
        ensure!(
            page + count as u64 <= self.next_page_number(),
            "page run {}..{} is beyond the allocated {} pages",
            page,
            page + count as u64,
            self.next_page_number()
        );
        let page_size = self.page_size();
        let wanted = count as usize * page_size;

        if let Some(write) = &self.write {
            if let Some(dirty) = write.dirty.get(&page) {
                ensure!(
                    dirty.data.len() >= wanted,
                    "dirty run at page {} holds {} pages, {} requested",
                    page,
                    dirty.data.len() / page_size,
                    count
                );
                return Ok(dirty.data[..wanted].to_vec());
            }
        }

        if let Some(version) = self.snapshot.version(page) {
            ensure!(
                version.slot.pages >= count,
                "committed run at page {} holds {} pages, {} requested",
                page,
                version.slot.pages,
                count
            );
            let mut out = vec![0u8; wanted];
            self.env.scratch.read_into(version.slot, &mut out)?;
            return Ok(out);
        }

        self.env.pager.read_pages(page, count as u64)
    }

    /// Get a mutable copy of a run, staging it in the dirty set on first
    /// touch. Later reads of the run within this transaction see the
    /// modified content.
    pub fn modify_pages(&mut self, page: u64, count: u32) -> Result<&mut [u8]> {
        ensure!(count > 0, "cannot modify an empty page run");
        let needs_copy = match &self.write {
            Some(write) => !write.dirty.contains_key(&page),
            None => bail!(StorageError::InvalidArgument(
                "modify_pages requires a write transaction".into(),
            )),
        };
        if needs_copy {
            let current = self.read_pages(page, count)?;
            if let Some(write) = self.write.as_mut() {
                write.dirty.insert(page, DirtyPage { data: current });
            }
        }
        let page_size = self.page_size();
        let wanted = count as usize * page_size;
        let write = self.write_state()?;
        let dirty = write
            .dirty
            .get_mut(&page)
            .ok_or_else(|| eyre::eyre!("page {} vanished from the dirty set", page))?;
        ensure!(
            dirty.data.len() == wanted,
            "run at page {} holds {} pages, modify asked for {}",
            page,
            dirty.data.len() / page_size,
            count
        );
        Ok(&mut dirty.data)
    }

    pub fn modify_page(&mut self, page: u64) -> Result<&mut [u8]> {
        self.modify_pages(page, 1)
    }

    /// Allocate a run of `count` fresh pages, returned zeroed and already
    /// in the dirty set. Single pages come from the free list when
    /// possible; runs always extend the high water mark so they stay
    /// contiguous.
    pub fn allocate_pages(&mut self, count: u32) -> Result<u64> {
        ensure!(count > 0, "cannot allocate an empty page run");
        let page_size = self.page_size();
        let write = self.write_state()?;
        let page = if count == 1 {
            match write.free_pages.pop() {
                Some(page) => page,
                None => {
                    let page = write.next_page_number;
                    write.next_page_number += 1;
                    page
                }
            }
        } else {
            let page = write.next_page_number;
            write.next_page_number += count as u64;
            page
        };
        write.dirty.insert(
            page,
            DirtyPage {
                data: vec![0u8; count as usize * page_size],
            },
        );
        Ok(page)
    }

    pub fn allocate_page(&mut self) -> Result<u64> {
        self.allocate_pages(1)
    }

    /// Release a run back to the environment. The pages become allocatable
    /// by transactions that start after this one commits.
    pub fn free_run(&mut self, page: u64, count: u32) -> Result<()> {
        ensure!(count > 0, "cannot free an empty page run");
        let write = self.write_state()?;
        write.dirty.remove(&page);
        for p in page..page + count as u64 {
            write.freed.push(p);
        }
        Ok(())
    }

    pub fn free_page(&mut self, page: u64) -> Result<()> {
        self.free_run(page, 1)
    }

    /// Publish this transaction's work. Returns the committed id once the
    /// journal record is written (and synced, when the environment is
    /// configured for synchronous commits).
    pub fn commit(mut self) -> Result<TxnId> {
        let Some(mut write) = self.write.take() else {
            bail!(StorageError::InvalidArgument(
                "commit on a read transaction".into(),
            ));
        };

        if write.dirty.is_empty() && write.freed.is_empty() {
            for callback in write.callbacks.drain(..) {
                callback(TxnOutcome::Committed);
            }
            return Ok(self.id);
        }

        let page_size = self.page_size();
        let id = self.id;

        // The successor free list: what this transaction left unused plus
        // what it freed.
        let mut free_pages = write.free_pages.clone();
        free_pages.extend_from_slice(&write.freed);
        free_pages.sort_unstable();
        free_pages.dedup();

        let mut header = self.snapshot.header;
        header.last_committed_txn = id;
        header.next_page_number = write.next_page_number;
        header.root_objects = write.root_objects;
        header.set_free_list(&free_pages);
        let mut header_page = vec![0u8; page_size];
        header.write_to(&mut header_page);
        write.dirty.insert(0, DirtyPage { data: header_page });

        let mut runs: Vec<(u64, &DirtyPage)> =
            write.dirty.iter().map(|(page, dirty)| (*page, dirty)).collect();
        runs.sort_unstable_by_key(|(page, _)| *page);

        // Stage every run in scratch. On any failure the slots go straight
        // back because nothing has been published yet.
        let mut staged: Vec<(u64, ScratchSlot)> = Vec::with_capacity(runs.len());
        let mut stage = || -> Result<()> {
            for (page, dirty) in &runs {
                let pages = (dirty.data.len() / page_size) as u32;
                let slot = self.env.scratch.allocate(pages)?;
                staged.push((*page, slot));
                self.env.scratch.write(slot, &dirty.data)?;
            }
            Ok(())
        };
        if let Err(err) = stage() {
            for (_, slot) in staged {
                self.env.scratch.free(slot);
            }
            self.finish(write, TxnOutcome::RolledBack);
            return Err(err);
        }

        let diffs: Vec<PageDiff<'_>> = runs
            .iter()
            .map(|(page, dirty)| PageDiff {
                page_number: *page,
                data: &dirty.data,
            })
            .collect();
        let sync = self.env.options.sync_on_commit;
        let journal_result = self
            .env
            .journal
            .lock()
            .append(id, &diffs, page_size, sync);
        if let Err(err) = journal_result {
            for (_, slot) in staged {
                self.env.scratch.free(slot);
            }
            self.finish(write, TxnOutcome::RolledBack);
            return Err(err);
        }

        {
            let mut committed = self.env.committed.write();
            let mut page_table = committed.page_table.clone();
            for (page, slot) in staged {
                let version = PageVersion { slot, txn_id: id };
                if let Some(old) = page_table.insert(page, version) {
                    self.env.scratch.defer_free(old.slot, id);
                }
            }
            for page in &write.freed {
                if let Some(old) = page_table.remove(page) {
                    self.env.scratch.defer_free(old.slot, id);
                }
            }
            *committed = Arc::new(CommittedState {
                txn_id: id,
                header,
                page_table,
                next_page_number: write.next_page_number,
                free_pages,
                pager_state: self.env.pager.state(),
            });
        }

        if sync {
            self.env.tracker.mark_durable(id);
        }
        log::trace!("transaction {} committed {} page runs", id, runs.len());

        self.finish(write, TxnOutcome::Committed);
        Ok(id)
    }

    /// Discard this transaction's work. A no-op for read transactions
    /// beyond releasing the snapshot.
    pub fn rollback(mut self) {
        if let Some(write) = self.write.take() {
            self.finish(write, TxnOutcome::RolledBack);
        }
    }

    fn finish(&mut self, mut write: WriteState<'env>, outcome: TxnOutcome) {
        for callback in write.callbacks.drain(..) {
            callback(outcome);
        }
        // The writer lock in `write` drops here, after the outcome is
        // published.
    }
}

impl Drop for LowLevelTransaction<'_> {
    fn drop(&mut self) {
        if let Some(write) = self.write.take() {
            self.finish(write, TxnOutcome::RolledBack);
        }
        if let Some(slot_idx) = self.slot_idx.take() {
            self.env.tracker.release(slot_idx);
        }
    }
}
