//! # Write-Ahead Journal
//!
//! Commits become durable by appending one record per transaction to the
//! current journal file and syncing it, long before any page reaches the
//! data file. Startup replays the journals to rebuild every committed page
//! the data file is missing.
//!
//! - [`file`]: the on-disk record format and a single journal file
//! - [`recovery`]: startup replay of the journal directory
//! - [`flush`]: the background applicator moving committed pages from
//!   scratch into the data file and recycling exhausted journals
//!
//! A journal file is exhausted when the next record does not fit; the
//! writer seals it and rolls over to a new one. Once every transaction in a
//! sealed journal has been applied to the data file and synced, the file is
//! renamed to the `recyclable-journal.` prefix and its directory entry is
//! reused for a later journal instead of being deleted.

pub mod file;
pub mod flush;
pub mod recovery;

use std::path::PathBuf;

use eyre::{Result, WrapErr};

use crate::txn::TxnId;

pub use file::{
    journal_file_name, recyclable_journal_file_name, JournalFile, JournalRecord, PageDiff,
    JOURNAL_FILE_PREFIX, RECYCLABLE_JOURNAL_FILE_PREFIX,
};
pub use flush::FlushStats;
pub use recovery::{recover, RecoveryOutcome};

/// Mutable journal bookkeeping, locked independently of the writer so the
/// applicator can recycle sealed files without stalling commits.
pub(crate) struct JournalState {
    pub dir: Option<PathBuf>,
    pub capacity_blocks: u64,
    pub next_number: u64,
    pub current: JournalFile,
    /// Exhausted journals not yet fully applied to the data file.
    pub sealed: Vec<JournalFile>,
    /// Dead journal files whose directory entries await reuse.
    pub recyclable: Vec<PathBuf>,
    /// Highest transaction id appended across all files.
    pub last_appended: TxnId,
    /// Highest transaction id whose pages are in the synced data file.
    pub last_flushed_txn: TxnId,
    /// Number of the last journal retired by the applicator.
    pub last_flushed_journal: u64,
    /// Blocks appended since the last journal sync.
    pub unsynced_blocks: u64,
}

impl JournalState {
    pub fn new(
        dir: Option<PathBuf>,
        capacity_blocks: u64,
        first_number: u64,
        recyclable: Vec<PathBuf>,
    ) -> Result<Self> {
        let current = Self::create_file(dir.as_deref(), first_number, capacity_blocks, &mut Vec::new())?;
        Ok(Self {
            dir,
            capacity_blocks,
            next_number: first_number + 1,
            current,
            sealed: Vec::new(),
            recyclable,
            last_appended: 0,
            last_flushed_txn: 0,
            last_flushed_journal: 0,
            unsynced_blocks: 0,
        })
    }

    /// Append one transaction's record, rolling over to a fresh journal
    /// file first when the current one cannot fit it.
    pub fn append(
        &mut self,
        txn_id: TxnId,
        diffs: &[PageDiff<'_>],
        page_size: usize,
        sync: bool,
    ) -> Result<()> {
        if !self.current.can_fit(diffs) {
            self.rollover(file::record_blocks(diffs))?;
        }
        self.current.append(txn_id, diffs, page_size)?;
        if sync {
            self.current.sync()?;
            self.unsynced_blocks = 0;
        } else {
            self.unsynced_blocks += file::record_blocks(diffs);
        }
        self.last_appended = txn_id;
        Ok(())
    }

    pub fn sync_current(&mut self) -> Result<()> {
        self.current.sync()?;
        self.unsynced_blocks = 0;
        Ok(())
    }

    fn rollover(&mut self, needed_blocks: u64) -> Result<()> {
        let number = self.next_number;
        self.next_number += 1;
        let capacity = self.capacity_blocks.max(needed_blocks);
        let fresh = Self::create_file(self.dir.as_deref(), number, capacity, &mut self.recyclable)?;
        let exhausted = std::mem::replace(&mut self.current, fresh);
        log::debug!(
            "journal {} sealed at {}/{} blocks, rolling over to journal {}",
            exhausted.number(),
            exhausted.written_blocks(),
            exhausted.capacity_blocks(),
            number
        );
        self.sealed.push(exhausted);
        Ok(())
    }

    fn create_file(
        dir: Option<&std::path::Path>,
        number: u64,
        capacity_blocks: u64,
        recyclable: &mut Vec<PathBuf>,
    ) -> Result<JournalFile> {
        match dir {
            Some(dir) => {
                let path = dir.join(journal_file_name(number));
                // Reuse a recyclable file's directory entry when one is
                // around. Creation truncates, so stale content is gone.
                if let Some(old) = recyclable.pop() {
                    std::fs::rename(&old, &path).wrap_err_with(|| {
                        format!("failed to recycle journal '{}'", old.display())
                    })?;
                }
                JournalFile::create(Some(&path), number, capacity_blocks)
            }
            None => JournalFile::create(None, number, capacity_blocks),
        }
    }
}
