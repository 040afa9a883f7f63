//! # Background Application
//!
//! Committed pages sit in scratch, protected by the journal, until the
//! applicator copies them into the data file. Application is gated by two
//! watermarks:
//!
//! - the reader watermark: applying a version overwrites the data-file
//!   content under it, so a version is applied only once every open
//!   snapshot is at least as new as it;
//! - the durability watermark: a version is applied only once its journal
//!   record is synced, otherwise a crash could leave the data file ahead of
//!   the journal.
//!
//! After the data file is synced, the applied entries are retired from the
//! committed page table, their scratch slots are queued for reclamation,
//! and sealed journals whose whole content is now in the data file are
//! renamed for recycling.

use std::sync::Arc;

use eyre::Result;

use crate::env::EnvInner;
use crate::journal::file::recyclable_journal_file_name;
use crate::txn::{CommittedState, PageVersion, TxnId};

#[derive(Debug, Default, Clone, Copy)]
pub struct FlushStats {
    pub runs_applied: usize,
    pub pages_applied: u64,
    pub journals_recycled: usize,
    pub applied_up_to: TxnId,
}

/// One applicator pass: move every applicable committed version into the
/// data file and retire what was moved.
pub(crate) fn apply_committed(env: &EnvInner) -> Result<FlushStats> {
    // With asynchronous commits the journal is synced here, on the
    // applicator's cadence, and durability advances in batches.
    if !env.options.sync_on_commit {
        let mut journal = env.journal.lock();
        journal.sync_current()?;
        env.tracker.mark_durable(journal.last_appended);
    }

    let limit = env.tracker.watermark().min(env.tracker.last_durable());
    let state = env.committed.read().clone();

    let mut applicable: Vec<(u64, PageVersion)> = state
        .page_table
        .iter()
        .filter(|(_, version)| version.txn_id <= limit)
        .map(|(page, version)| (*page, *version))
        .collect();
    applicable.sort_unstable_by_key(|(page, _)| *page);

    let mut stats = FlushStats {
        applied_up_to: limit,
        ..FlushStats::default()
    };

    if !applicable.is_empty() {
        for (page, version) in &applicable {
            let data = env.scratch.read(version.slot)?;
            env.pager.write_pages(*page, &data)?;
            stats.runs_applied += 1;
            stats.pages_applied += version.slot.pages as u64;
        }
        env.pager.sync()?;

        // Retire exactly the versions applied. A version superseded while
        // the pass ran stays in the table and the stale data-file write is
        // shadowed by it.
        let mut committed = env.committed.write();
        let mut page_table = committed.page_table.clone();
        let current_txn = committed.txn_id;
        for (page, version) in &applicable {
            let still_current = page_table
                .get(page)
                .is_some_and(|current| current.txn_id == version.txn_id);
            if still_current {
                page_table.remove(page);
                env.scratch.defer_free(version.slot, current_txn);
            }
        }
        let next = CommittedState {
            txn_id: current_txn,
            header: committed.header,
            page_table,
            next_page_number: committed.next_page_number,
            free_pages: committed.free_pages.clone(),
            pager_state: committed.pager_state.clone(),
        };
        *committed = Arc::new(next);
    }

    stats.journals_recycled = recycle_journals(env, limit)?;

    {
        // Everything at or below the limit is now in the synced data file.
        let mut journal = env.journal.lock();
        journal.last_flushed_txn = journal.last_flushed_txn.max(limit);
    }

    if stats.runs_applied > 0 || stats.journals_recycled > 0 {
        log::debug!(
            "applied {} runs ({} pages) up to transaction {}, recycled {} journals",
            stats.runs_applied,
            stats.pages_applied,
            stats.applied_up_to,
            stats.journals_recycled
        );
    }
    Ok(stats)
}

/// Retire sealed journals whose every transaction is at or below `limit`
/// and therefore fully present in the synced data file.
fn recycle_journals(env: &EnvInner, limit: TxnId) -> Result<usize> {
    let mut journal = env.journal.lock();
    let mut recycled = 0usize;
    let sealed_files = std::mem::take(&mut journal.sealed);
    let mut keep = Vec::with_capacity(sealed_files.len());
    for sealed in sealed_files {
        let dead = sealed.last_txn_id().is_some_and(|last| last <= limit);
        if !dead {
            keep.push(sealed);
            continue;
        }
        if let (Some(dir), Some(path)) = (journal.dir.as_deref(), sealed.path()) {
            let recycled_path = dir.join(recyclable_journal_file_name(sealed.number()));
            std::fs::rename(path, &recycled_path)?;
            journal.recyclable.push(recycled_path);
        }
        journal.last_flushed_journal = journal.last_flushed_journal.max(sealed.number());
        recycled += 1;
    }
    journal.sealed = keep;
    Ok(recycled)
}
