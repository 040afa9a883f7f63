//! # Transactions
//!
//! Snapshot-isolated transactions over the storage layer. One writer at a
//! time, any number of readers, and nobody blocks anybody for the duration
//! of their work.
//!
//! ## Committed State
//!
//! The environment's visible state is a single [`CommittedState`] behind an
//! `Arc`. A transaction pins the current `Arc` when it opens and reads
//! through it for its whole life; a committing writer builds a successor
//! state and swaps the pointer. Old states stay alive for as long as a
//! reader holds them.
//!
//! The interesting part of a committed state is the page table: for every
//! page whose latest committed content has not yet been applied to the data
//! file, it maps the page number to the scratch slot holding that content.
//! Page reads resolve in order: the writer's own dirty set, the snapshot's
//! page table, then the data file.

pub mod manager;
pub mod transaction;

use std::sync::Arc;

use hashbrown::HashMap;

use crate::scratch::ScratchSlot;
use crate::storage::{FileHeader, PagerState};

pub use manager::{TransactionTracker, TxnId, MAX_ACTIVE_TRANSACTIONS};
pub use transaction::LowLevelTransaction;

/// How a transaction ended, reported to its registered callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed,
    RolledBack,
}

/// Latest committed content of one page, staged in scratch until the
/// applicator moves it into the data file.
#[derive(Debug, Clone, Copy)]
pub struct PageVersion {
    pub slot: ScratchSlot,
    /// Transaction that committed this version.
    pub txn_id: TxnId,
}

/// An immutable snapshot of everything a transaction may observe.
pub struct CommittedState {
    pub txn_id: TxnId,
    pub header: FileHeader,
    /// Pages whose latest committed content lives in scratch. Keyed by the
    /// first page of the run; the slot records the run length.
    pub page_table: HashMap<u64, PageVersion>,
    pub next_page_number: u64,
    pub free_pages: Vec<u64>,
    /// Pager generation this snapshot was built against. Held so the data
    /// file never shrinks under a pinned reader.
    pub pager_state: Arc<PagerState>,
}

impl CommittedState {
    pub fn version(&self, page: u64) -> Option<&PageVersion> {
        self.page_table.get(&page)
    }
}
