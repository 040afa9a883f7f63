//! # Trees
//!
//! Ordered key/value storage on top of the transactional pager:
//!
//! - [`tree`]: variable-size B-tree with byte-string keys, overflow values,
//!   multi-value keys and stream values
//! - [`node`]: the slotted-page cell layout both tree kinds share
//! - [`fixed`]: fixed-size tree keyed by `u64` with constant-width values
//! - [`multi`]: multi-value storage behind a single tree key
//! - [`stream`]: chunked large-value streams
//! - [`allocator`]: batched page preallocation for tree page reuse
//!
//! Every tree persists a [`TreeStateHeader`] describing its root and page
//! counts. The root-objects tree's state lives in the data-file header;
//! every other tree's state is the value stored under its name in the
//! root-objects tree.

pub mod allocator;
pub mod fixed;
pub mod multi;
pub mod node;
pub mod stream;
pub mod tree;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub use allocator::NewPageAllocator;
pub use fixed::FixedSizeTree;
pub use multi::MultiValueIterator;
pub use node::{CellPayload, StreamInfo};
pub use stream::StreamReader;
pub use tree::{Tree, TreeIterator, ROOT_TREE_NAME};

/// Tree holds multi-value entries.
pub const TREE_FLAG_MULTI_VALUE: u32 = 1;

/// Persisted description of one tree: its root and page accounting.
///
/// Page counts are maintained incrementally by every structural operation
/// and feed the storage report without walking the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TreeStateHeader {
    pub root_page: u64,
    pub record_count: u64,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub depth: u32,
    pub flags: u32,
}

pub const TREE_STATE_HEADER_SIZE: usize = size_of::<TreeStateHeader>();

impl TreeStateHeader {
    /// State of a tree whose root leaf lives at `root_page`.
    pub fn empty(root_page: u64, flags: u32) -> Self {
        Self {
            root_page,
            record_count: 0,
            branch_pages: 0,
            leaf_pages: 1,
            overflow_pages: 0,
            depth: 1,
            flags,
        }
    }

    pub fn page_count(&self) -> u64 {
        self.branch_pages + self.leaf_pages + self.overflow_pages
    }

    pub fn is_multi_value(&self) -> bool {
        self.flags & TREE_FLAG_MULTI_VALUE != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_header_is_48_bytes() {
        assert_eq!(TREE_STATE_HEADER_SIZE, 48);
    }

    #[test]
    fn empty_state_counts_one_leaf() {
        let state = TreeStateHeader::empty(4, 0);
        assert_eq!(state.root_page, 4);
        assert_eq!(state.page_count(), 1);
        assert_eq!(state.depth, 1);
        assert!(!state.is_multi_value());
    }
}
