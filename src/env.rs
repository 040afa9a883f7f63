//! # Storage Environment
//!
//! The environment ties the layers together: one data file behind the
//! pager, a scratch buffer pool for in-flight writes, a write-ahead
//! journal for durability, and the transaction tracker handing out
//! snapshots. Opening an environment replays any journals left by a crash
//! before the first transaction can start.
//!
//! ## Directory Layout
//!
//! A durable environment owns a directory:
//!
//! ```text
//! <path>/
//!   data                  the page file
//!   journal.00000000      write-ahead journal files
//!   recyclable-journal.*  dead journals awaiting reuse
//!   temp/scratch.*.buffers
//! ```
//!
//! In-memory environments keep all three in heap buffers and skip
//! recovery; they exist for tests and ephemeral workloads.
//!
//! ## Background Flush
//!
//! A dedicated thread periodically applies committed pages from scratch to
//! the data file and reclaims scratch slots and journals nothing can read
//! anymore. Dropping the environment stops the thread and runs one final
//! pass.

use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::StorageOptions;
use crate::journal::{self, flush::apply_committed, FlushStats, JournalState};
use crate::scratch::ScratchBufferPool;
use crate::storage::{FileHeader, PageKind, Pager};
use crate::tree::node;
use crate::txn::{CommittedState, LowLevelTransaction, TransactionTracker, TxnId};

pub const DATA_FILE_NAME: &str = "data";
pub const SCRATCH_DIR_NAME: &str = "temp";

/// The shared state behind a [`StorageEnvironment`]; reachable through
/// its `Deref` impl. Not constructible outside the crate.
pub struct EnvInner {
    pub(crate) options: StorageOptions,
    pub(crate) pager: Pager,
    pub(crate) scratch: ScratchBufferPool,
    pub(crate) tracker: TransactionTracker,
    pub(crate) committed: RwLock<Arc<CommittedState>>,
    pub(crate) writer_lock: Mutex<()>,
    pub(crate) journal: Mutex<JournalState>,
}

struct Shutdown {
    stopped: Mutex<bool>,
    cv: Condvar,
}

pub struct StorageEnvironment {
    inner: Arc<EnvInner>,
    shutdown: Arc<Shutdown>,
    flusher: Option<JoinHandle<()>>,
}

impl Deref for StorageEnvironment {
    type Target = EnvInner;

    fn deref(&self) -> &EnvInner {
        &self.inner
    }
}

/// Write the pages of a brand-new environment: the file header on page 0
/// and the root-objects tree's empty root leaf on page 1.
fn initialize_data_file(pager: &Pager, page_size: usize) -> Result<FileHeader> {
    let header = FileHeader::new(page_size as u32);
    let mut page0 = vec![0u8; page_size];
    header.write_to(&mut page0);
    let mut page1 = vec![0u8; page_size];
    node::init_page(&mut page1, PageKind::Leaf, 1);
    pager.write_pages(0, &page0)?;
    pager.write_pages(1, &page1)?;
    pager.sync()?;
    Ok(header)
}

impl StorageEnvironment {
    /// Open or create an environment described by `options`. For durable
    /// environments this replays crash-left journals before returning.
    pub fn open(options: StorageOptions) -> Result<Self> {
        options.validate()?;
        let page_size = options.page_size;

        let (pager, header, first_journal_number, recyclable) = match options.path.clone() {
            None => {
                let pager = Pager::in_memory(page_size, options.growth_increment);
                let header = initialize_data_file(&pager, page_size)?;
                (pager, header, 0, Vec::new())
            }
            Some(dir) => {
                std::fs::create_dir_all(&dir).wrap_err_with(|| {
                    format!("failed to create environment directory '{}'", dir.display())
                })?;
                let data_path = dir.join(DATA_FILE_NAME);
                let fresh = !data_path.exists();
                let pager = if fresh {
                    let pager =
                        Pager::create_file(&data_path, page_size, options.growth_increment)?;
                    initialize_data_file(&pager, page_size)?;
                    pager
                } else {
                    Pager::open_file(&data_path, page_size, options.growth_increment)?
                };

                let outcome = journal::recover(&dir, &pager, page_size)?;
                let header_page = pager.read_pages(0, 1)?;
                let header = FileHeader::read_from(&header_page, page_size as u32)?;
                (pager, header, outcome.next_journal_number, outcome.recyclable)
            }
        };

        let committed = CommittedState {
            txn_id: header.last_committed_txn,
            header,
            page_table: HashMap::new(),
            next_page_number: header.next_page_number,
            free_pages: header.free_pages().to_vec(),
            pager_state: pager.state(),
        };

        let journal = JournalState::new(
            options.path.clone(),
            options.journal_file_4kbs as u64,
            first_journal_number,
            recyclable,
        )?;

        let scratch = ScratchBufferPool::new(
            page_size,
            options.scratch_file_pages,
            options.path.as_ref().map(|dir| dir.join(SCRATCH_DIR_NAME)),
        );

        let inner = Arc::new(EnvInner {
            tracker: TransactionTracker::new(header.last_committed_txn),
            pager,
            scratch,
            committed: RwLock::new(Arc::new(committed)),
            writer_lock: Mutex::new(()),
            journal: Mutex::new(journal),
            options,
        });
        let shutdown = Arc::new(Shutdown {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        });

        let flusher = Self::spawn_flusher(&inner, &shutdown)?;
        Ok(Self {
            inner,
            shutdown,
            flusher: Some(flusher),
        })
    }

    fn spawn_flusher(inner: &Arc<EnvInner>, shutdown: &Arc<Shutdown>) -> Result<JoinHandle<()>> {
        let inner = Arc::clone(inner);
        let shutdown = Arc::clone(shutdown);
        let interval = inner.options.flush_interval;
        std::thread::Builder::new()
            .name("storage-flush".into())
            .spawn(move || loop {
                {
                    let mut stopped = shutdown.stopped.lock();
                    if *stopped {
                        break;
                    }
                    shutdown.cv.wait_for(&mut stopped, interval);
                    if *stopped {
                        break;
                    }
                }
                if let Err(err) = apply_committed(&inner) {
                    log::error!("background flush failed: {err:#}");
                }
                inner.scratch.reclaim(inner.tracker.watermark());
            })
            .wrap_err("failed to spawn the flush thread")
    }

    /// Open a read transaction pinned to the current committed state.
    pub fn read_txn(&self) -> Result<LowLevelTransaction<'_>> {
        LowLevelTransaction::new_read(self)
    }

    /// Open the write transaction. Blocks while another writer is open.
    pub fn write_txn(&self) -> Result<LowLevelTransaction<'_>> {
        LowLevelTransaction::new_write(self)
    }

    /// Block until `txn_id` is durable or `timeout` elapses. Useful with
    /// asynchronous commits, where `commit` returns before the journal
    /// sync.
    pub fn wait_for_durable(&self, txn_id: TxnId, timeout: Duration) -> Result<()> {
        self.tracker.wait_for_durable(txn_id, timeout)
    }

    pub fn last_durable_txn(&self) -> TxnId {
        self.tracker.last_durable()
    }

    /// Run one applicator pass immediately instead of waiting for the
    /// background cadence.
    pub fn flush(&self) -> Result<FlushStats> {
        let stats = apply_committed(&self.inner)?;
        self.scratch.reclaim(self.tracker.watermark());
        Ok(stats)
    }

    pub fn path(&self) -> Option<&Path> {
        self.options.path.as_deref()
    }
}

impl Drop for StorageEnvironment {
    fn drop(&mut self) {
        *self.shutdown.stopped.lock() = true;
        self.shutdown.cv.notify_all();
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
        // One final pass so a clean shutdown leaves as little unapplied
        // journal content as possible.
        if let Err(err) = apply_committed(&self.inner) {
            log::warn!("final flush on shutdown failed: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn in_memory_environment_starts_empty() {
        let env = StorageEnvironment::open(StorageOptions::in_memory()).unwrap();
        let txn = env.read_txn().unwrap();
        assert_eq!(txn.committed().txn_id, 0);
        assert_eq!(txn.next_page_number(), 2);
    }

    #[test]
    fn durable_environment_survives_reopen() {
        let dir = tempdir().unwrap();
        let marker;
        {
            let env = StorageEnvironment::open(StorageOptions::on_disk(dir.path())).unwrap();
            let mut txn = env.write_txn().unwrap();
            marker = txn.allocate_page().unwrap();
            txn.modify_page(marker).unwrap()[5] = 0x77;
            txn.commit().unwrap();
        }

        let env = StorageEnvironment::open(StorageOptions::on_disk(dir.path())).unwrap();
        let txn = env.read_txn().unwrap();
        assert_eq!(txn.read_page(marker).unwrap()[5], 0x77);
    }

    #[test]
    fn flush_moves_pages_into_the_data_file() {
        let env = StorageEnvironment::open(StorageOptions::in_memory()).unwrap();
        let mut txn = env.write_txn().unwrap();
        let page = txn.allocate_page().unwrap();
        txn.modify_page(page).unwrap()[0] = 0x42;
        txn.commit().unwrap();

        let stats = env.flush().unwrap();
        assert!(stats.runs_applied > 0);
        assert!(env.committed.read().page_table.is_empty());

        let reader = env.read_txn().unwrap();
        assert_eq!(reader.read_page(page).unwrap()[0], 0x42);
    }

    #[test]
    fn flush_respects_open_readers() {
        let env = StorageEnvironment::open(StorageOptions::in_memory()).unwrap();

        let mut txn = env.write_txn().unwrap();
        let page = txn.allocate_page().unwrap();
        txn.modify_page(page).unwrap()[0] = 1;
        txn.commit().unwrap();
        env.flush().unwrap();

        let reader = env.read_txn().unwrap();

        let mut txn = env.write_txn().unwrap();
        txn.modify_page(page).unwrap()[0] = 2;
        txn.commit().unwrap();

        // The reader predates the second commit, so its version must not be
        // overwritten in the data file.
        env.flush().unwrap();
        assert_eq!(reader.read_page(page).unwrap()[0], 1);
        drop(reader);

        env.flush().unwrap();
        let reader = env.read_txn().unwrap();
        assert_eq!(reader.read_page(page).unwrap()[0], 2);
    }

    #[test]
    fn wait_for_durable_after_sync_commit() {
        let env = StorageEnvironment::open(StorageOptions::in_memory()).unwrap();
        let mut txn = env.write_txn().unwrap();
        let page = txn.allocate_page().unwrap();
        txn.modify_page(page).unwrap()[0] = 1;
        let id = txn.commit().unwrap();
        env.wait_for_durable(id, Duration::from_millis(10)).unwrap();
    }
}
