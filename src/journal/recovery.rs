//! # Crash Recovery
//!
//! On startup every journal file in the environment directory is replayed
//! into the data file in journal-number order, record by record, before any
//! transaction may open.
//!
//! Replay distinguishes two failure shapes:
//!
//! - A torn tail: the last record written before a crash is incomplete or
//!   fails its checksum, and nothing valid follows it. Replay stops there;
//!   the transaction was never acknowledged as durable.
//! - Mid-journal corruption: an invalid record with valid records after it,
//!   either later in the same file or in a later journal. That means
//!   acknowledged history is damaged, and startup fails with
//!   [`StorageError::Corruption`] rather than silently dropping commits.
//!
//! Replayed journals are renamed to the recyclable prefix so their
//! directory entries can be reused by new journals.

use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};

use crate::errors::StorageError;
use crate::journal::file::{
    recyclable_journal_file_name, JournalFile, JOURNAL_FILE_PREFIX,
    RECYCLABLE_JOURNAL_FILE_PREFIX,
};
use crate::storage::Pager;
use crate::txn::TxnId;

#[derive(Debug)]
pub struct RecoveryOutcome {
    /// Highest transaction id restored, 0 when the journals were empty.
    pub last_recovered_txn: TxnId,
    pub journals_replayed: usize,
    pub records_replayed: usize,
    /// Number the next journal file should use.
    pub next_journal_number: u64,
    /// Recyclable journal files available for reuse.
    pub recyclable: Vec<PathBuf>,
}

fn parse_numbered(name: &str, prefix: &str) -> Option<u64> {
    name.strip_prefix(prefix)?.parse().ok()
}

/// Replay all journals under `dir` into the data file.
pub fn recover(dir: &Path, pager: &Pager, page_size: usize) -> Result<RecoveryOutcome> {
    let mut journals: Vec<(u64, PathBuf)> = Vec::new();
    let mut recyclable: Vec<PathBuf> = Vec::new();
    let mut max_number = 0u64;

    for entry in std::fs::read_dir(dir)
        .wrap_err_with(|| format!("failed to list journal directory '{}'", dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(number) = parse_numbered(name, JOURNAL_FILE_PREFIX) {
            max_number = max_number.max(number);
            journals.push((number, entry.path()));
        } else if let Some(number) = parse_numbered(name, RECYCLABLE_JOURNAL_FILE_PREFIX) {
            max_number = max_number.max(number);
            recyclable.push(entry.path());
        }
    }
    journals.sort_unstable_by_key(|(number, _)| *number);

    let mut last_recovered_txn = 0;
    let mut records_replayed = 0usize;
    let journal_count = journals.len();

    for (idx, (number, path)) in journals.iter().enumerate() {
        let mut journal = JournalFile::open(path, *number)?;
        let result = journal.read_records(page_size)?;
        let is_last = idx == journal_count - 1;

        if result.reached_invalid && !is_last {
            return Err(eyre::Report::new(StorageError::Corruption(format!(
                "journal {} is damaged but later journals exist",
                number
            ))));
        }

        for record in &result.records {
            if record.txn_id <= last_recovered_txn {
                return Err(eyre::Report::new(StorageError::Corruption(format!(
                    "journal {} replays transaction {} after {}",
                    number, record.txn_id, last_recovered_txn
                ))));
            }
            for (page, data) in &record.diffs {
                pager.write_pages(*page, data)?;
            }
            last_recovered_txn = record.txn_id;
            records_replayed += 1;
        }

        if result.reached_invalid {
            log::warn!(
                "journal {} has a torn tail after transaction {}, discarding it",
                number,
                last_recovered_txn
            );
        }
    }

    if records_replayed > 0 {
        pager.sync()?;
        log::info!(
            "recovered {} transactions from {} journals, last id {}",
            records_replayed,
            journal_count,
            last_recovered_txn
        );
    }

    // Every replayed journal is now dead; keep the directory entries around
    // for reuse.
    for (number, path) in &journals {
        let recycled = dir.join(recyclable_journal_file_name(*number));
        std::fs::rename(path, &recycled)
            .wrap_err_with(|| format!("failed to retire journal '{}'", path.display()))?;
        recyclable.push(recycled);
    }

    Ok(RecoveryOutcome {
        last_recovered_txn,
        journals_replayed: journal_count,
        records_replayed,
        next_journal_number: if journal_count == 0 && recyclable.is_empty() {
            0
        } else {
            max_number + 1
        },
        recyclable,
    })
}
