//! # Page Preallocation
//!
//! Trees that grow and shrink in tight loops would otherwise bounce the
//! same pages through the free list one at a time. The allocator keeps a
//! pool of single pages in a fixed-size tree; when the pool runs dry it
//! grabs a whole batch at once, and released tree pages go back to the
//! pool instead of the transaction's free list.
//!
//! Pages are pooled one by one on purpose: a transaction's dirty set keys
//! multi-page runs by their first page, so handing out sub-ranges of one
//! big run would make later single-page reads miss it.
//!
//! The pool state rides in the root-objects tree under a reserved key, so
//! it commits and recovers with everything else.

use eyre::Result;

use crate::errors::StorageError;
use crate::tree::fixed::{FixedSizeTree, FixedTreeState, FIXED_TREE_STATE_SIZE};
use crate::tree::node::CellPayload;
use crate::tree::tree::Tree;
use crate::txn::LowLevelTransaction;
use zerocopy::FromBytes;

/// Pages claimed from the transaction in one go when the pool is empty.
pub const PREALLOCATION_BATCH: u32 = 8;

/// Root-objects key the pool state is stored under.
pub const ALLOCATOR_KEY: &[u8] = b"$new-pages";

/// A pool of preallocated single pages.
pub struct NewPageAllocator {
    pool: FixedSizeTree,
}

impl NewPageAllocator {
    /// Load the pool from the root-objects tree, or start an empty one.
    pub fn open(txn: &LowLevelTransaction<'_>) -> Result<Self> {
        let root = Tree::root_objects(txn);
        let pool = match root.payload_of(txn, ALLOCATOR_KEY)? {
            None => FixedSizeTree::create(0),
            Some(CellPayload::Inline(blob)) => {
                let corrupt =
                    || StorageError::Corruption("malformed page pool state".into());
                let state = FixedTreeState::read_from_bytes(
                    blob.get(..FIXED_TREE_STATE_SIZE).ok_or_else(corrupt)?,
                )
                .map_err(|_| corrupt())?;
                FixedSizeTree::from_parts(state, blob[FIXED_TREE_STATE_SIZE..].to_vec())
            }
            Some(_) => {
                return Err(eyre::Report::new(StorageError::Corruption(
                    "page pool key holds an unexpected payload".into(),
                )))
            }
        };
        Ok(Self { pool })
    }

    /// Take a page from the pool, refilling it with a fresh batch first
    /// when it is empty.
    pub fn allocate(&mut self, txn: &mut LowLevelTransaction<'_>) -> Result<u64> {
        if self.pool.record_count() == 0 {
            for _ in 0..PREALLOCATION_BATCH {
                let page = txn.allocate_page()?;
                self.pool.insert(txn, page, &[])?;
            }
        }
        let page = self
            .pool
            .entries(txn)?
            .first()
            .map(|(page, _)| *page)
            .ok_or_else(|| eyre::eyre!("page pool empty right after refill"))?;
        self.pool.delete(txn, page)?;
        self.save(txn)?;
        Ok(page)
    }

    /// Return a page to the pool for later reuse.
    pub fn free(&mut self, txn: &mut LowLevelTransaction<'_>, page: u64) -> Result<()> {
        self.pool.insert(txn, page, &[])?;
        self.save(txn)
    }

    /// Pages currently sitting in the pool.
    pub fn preallocated_count(&self) -> u64 {
        self.pool.record_count()
    }

    /// Pages the pool's own tracking tree occupies once it outgrows its
    /// embedded form.
    pub fn allocation_tree_pages(&self, txn: &LowLevelTransaction<'_>) -> Result<u64> {
        Ok(self.pool.pages(txn)?.len() as u64)
    }

    /// The pooled page numbers, for reporting.
    pub fn preallocated_pages(&self, txn: &LowLevelTransaction<'_>) -> Result<Vec<u64>> {
        Ok(self
            .pool
            .entries(txn)?
            .into_iter()
            .map(|(page, _)| page)
            .collect())
    }

    fn save(&self, txn: &mut LowLevelTransaction<'_>) -> Result<()> {
        let state = self.pool.state();
        let mut blob =
            Vec::with_capacity(FIXED_TREE_STATE_SIZE + self.pool.embedded_data().len());
        blob.extend_from_slice(zerocopy::IntoBytes::as_bytes(&state));
        blob.extend_from_slice(self.pool.embedded_data());
        let mut root = Tree::root_objects(txn);
        root.set_payload(txn, ALLOCATOR_KEY, CellPayload::Inline(blob))
    }
}
