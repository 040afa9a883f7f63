//! # Fixed-Size Trees
//!
//! A fixed-size tree (FST) maps `u64` keys to values of one constant width
//! chosen at creation. The rigid shape buys a much denser layout than the
//! variable tree: entries are packed arrays, pages need no cell pointers,
//! and a small tree needs no pages at all.
//!
//! ## Representations
//!
//! - **Embedded**: the whole tree is one sorted entry blob stored inside
//!   whatever owns it (a tree cell or a root-objects value). Used while the
//!   encoded size stays at or below [`FIXED_EMBEDDED_CAP`].
//! - **Page-based**: `FixedLeaf` pages hold packed `key | value` entries,
//!   `FixedBranch` pages hold packed `key | child` entries where each key
//!   is the smallest key of its subtree. Leaves are chained through
//!   `right_sibling`.
//!
//! A growing embedded tree is promoted to a single leaf when it outgrows
//! the cap; a shrinking page tree of depth one is demoted back. The owner
//! persists the [`FixedTreeState`] plus the embedded blob after every
//! mutation.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errors::StorageError;
use crate::storage::{PageHeader, PageKind, PAGE_HEADER_SIZE};
use crate::txn::LowLevelTransaction;

/// Largest encoded size an embedded fixed-size tree may reach.
pub const FIXED_EMBEDDED_CAP: usize = 512;

const FIXED_STATE_EMBEDDED: u32 = 1;

/// Persisted state of a fixed-size tree (24 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FixedTreeState {
    pub root_page: u64,
    pub record_count: u64,
    pub value_size: u16,
    pub depth: u16,
    pub flags: u32,
}

pub const FIXED_TREE_STATE_SIZE: usize = size_of::<FixedTreeState>();

impl FixedTreeState {
    /// State of a fresh, empty, embedded tree.
    pub fn embedded(value_size: u16) -> Self {
        Self {
            root_page: 0,
            record_count: 0,
            value_size,
            depth: 0,
            flags: FIXED_STATE_EMBEDDED,
        }
    }

    pub fn is_embedded(&self) -> bool {
        self.flags & FIXED_STATE_EMBEDDED != 0
    }
}

fn leaf_entry_size(value_size: u16) -> usize {
    8 + value_size as usize
}

fn leaf_capacity(page_size: usize, value_size: u16) -> usize {
    (page_size - PAGE_HEADER_SIZE) / leaf_entry_size(value_size)
}

fn branch_capacity(page_size: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE) / 16
}

fn entry_key(buf: &[u8], entry_size: usize, idx: usize) -> u64 {
    let at = PAGE_HEADER_SIZE + idx * entry_size;
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap_or_default())
}

/// Binary search packed entries; `Ok` is an exact hit, `Err` the insertion
/// point.
fn search_entries(
    buf: &[u8],
    count: usize,
    entry_size: usize,
    key: u64,
) -> std::result::Result<usize, usize> {
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match entry_key(buf, entry_size, mid).cmp(&key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

struct PathEntry {
    page: u64,
    idx: usize,
}

/// A fixed-size tree plus its embedded blob. The owner persists
/// `state()` and `embedded_data()` after mutations.
pub struct FixedSizeTree {
    state: FixedTreeState,
    embedded: Vec<u8>,
}

impl FixedSizeTree {
    pub fn create(value_size: u16) -> Self {
        Self {
            state: FixedTreeState::embedded(value_size),
            embedded: Vec::new(),
        }
    }

    pub fn from_parts(state: FixedTreeState, embedded: Vec<u8>) -> Self {
        Self { state, embedded }
    }

    pub fn state(&self) -> FixedTreeState {
        self.state
    }

    pub fn embedded_data(&self) -> &[u8] {
        &self.embedded
    }

    pub fn record_count(&self) -> u64 {
        self.state.record_count
    }

    pub fn value_size(&self) -> u16 {
        self.state.value_size
    }

    fn entry_size(&self) -> usize {
        leaf_entry_size(self.state.value_size)
    }

    fn check_value(&self, value: &[u8]) -> Result<()> {
        ensure!(
            value.len() == self.state.value_size as usize,
            StorageError::InvalidArgument(format!(
                "fixed tree stores {}-byte values, got {}",
                self.state.value_size,
                value.len()
            ))
        );
        Ok(())
    }

    pub fn get(&self, txn: &LowLevelTransaction<'_>, key: u64) -> Result<Option<Vec<u8>>> {
        let entry_size = self.entry_size();
        if self.state.is_embedded() {
            let count = self.state.record_count as usize;
            return Ok(match search_embedded(&self.embedded, count, entry_size, key) {
                Ok(idx) => {
                    let at = idx * entry_size + 8;
                    Some(self.embedded[at..at + self.state.value_size as usize].to_vec())
                }
                Err(_) => None,
            });
        }

        let (leaf_page, _) = self.descend(txn, key)?;
        let buf = txn.read_page(leaf_page)?;
        let header = PageHeader::from_bytes(&buf)?;
        match search_entries(&buf, header.cell_count() as usize, entry_size, key) {
            Ok(idx) => {
                let at = PAGE_HEADER_SIZE + idx * entry_size + 8;
                Ok(Some(buf[at..at + self.state.value_size as usize].to_vec()))
            }
            Err(_) => Ok(None),
        }
    }

    pub fn contains(&self, txn: &LowLevelTransaction<'_>, key: u64) -> Result<bool> {
        Ok(self.get(txn, key)?.is_some())
    }

    /// Insert or overwrite. Returns `true` when the key was new.
    pub fn insert(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        key: u64,
        value: &[u8],
    ) -> Result<bool> {
        self.check_value(value)?;
        let entry_size = self.entry_size();

        if self.state.is_embedded() {
            let count = self.state.record_count as usize;
            let added = match search_embedded(&self.embedded, count, entry_size, key) {
                Ok(idx) => {
                    let at = idx * entry_size + 8;
                    self.embedded[at..at + value.len()].copy_from_slice(value);
                    false
                }
                Err(idx) => {
                    let mut entry = Vec::with_capacity(entry_size);
                    entry.extend_from_slice(&key.to_le_bytes());
                    entry.extend_from_slice(value);
                    let at = idx * entry_size;
                    self.embedded.splice(at..at, entry);
                    self.state.record_count += 1;
                    true
                }
            };
            if self.embedded.len() > FIXED_EMBEDDED_CAP {
                self.promote(txn)?;
            }
            return Ok(added);
        }

        let (leaf_page, path) = self.descend(txn, key)?;
        self.insert_in_leaf(txn, leaf_page, path, key, value)
    }

    /// Remove a key. Returns `false` when it was not present.
    pub fn delete(&mut self, txn: &mut LowLevelTransaction<'_>, key: u64) -> Result<bool> {
        let entry_size = self.entry_size();

        if self.state.is_embedded() {
            let count = self.state.record_count as usize;
            return Ok(match search_embedded(&self.embedded, count, entry_size, key) {
                Ok(idx) => {
                    let at = idx * entry_size;
                    self.embedded.drain(at..at + entry_size);
                    self.state.record_count -= 1;
                    true
                }
                Err(_) => false,
            });
        }

        let (leaf_page, path) = self.descend(txn, key)?;
        let buf = txn.modify_page(leaf_page)?;
        let header = PageHeader::from_bytes(buf)?;
        let count = header.cell_count() as usize;
        let Ok(idx) = search_entries(buf, count, entry_size, key) else {
            return Ok(false);
        };

        let start = PAGE_HEADER_SIZE + idx * entry_size;
        let end = PAGE_HEADER_SIZE + count * entry_size;
        buf.copy_within(start + entry_size..end, start);
        PageHeader::from_bytes_mut(buf)?.set_cell_count((count - 1) as u16);
        self.state.record_count -= 1;

        if count - 1 == 0 {
            self.remove_empty_page(txn, leaf_page, path)?;
        } else if idx == 0 && !path.is_empty() {
            let new_min = entry_key(txn.read_page(leaf_page)?.as_slice(), entry_size, 0);
            self.update_branch_key(txn, &path, new_min)?;
        }
        self.try_demote(txn)?;
        Ok(true)
    }

    /// All entries in key order.
    pub fn entries(&self, txn: &LowLevelTransaction<'_>) -> Result<Vec<(u64, Vec<u8>)>> {
        let entry_size = self.entry_size();
        let value_size = self.state.value_size as usize;
        let mut out = Vec::with_capacity(self.state.record_count as usize);

        if self.state.is_embedded() {
            for idx in 0..self.state.record_count as usize {
                let at = idx * entry_size;
                let key = u64::from_le_bytes(self.embedded[at..at + 8].try_into()?);
                out.push((key, self.embedded[at + 8..at + 8 + value_size].to_vec()));
            }
            return Ok(out);
        }

        let mut leaf_page = self.leftmost_leaf(txn)?;
        while leaf_page != 0 {
            let buf = txn.read_page(leaf_page)?;
            let header = PageHeader::from_bytes(&buf)?;
            for idx in 0..header.cell_count() as usize {
                let at = PAGE_HEADER_SIZE + idx * entry_size;
                let key = u64::from_le_bytes(buf[at..at + 8].try_into()?);
                out.push((key, buf[at + 8..at + 8 + value_size].to_vec()));
            }
            leaf_page = header.right_sibling();
        }
        Ok(out)
    }

    /// Every page the tree occupies, root first. Empty when embedded.
    pub fn pages(&self, txn: &LowLevelTransaction<'_>) -> Result<Vec<u64>> {
        if self.state.is_embedded() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut stack = vec![self.state.root_page];
        while let Some(page) = stack.pop() {
            out.push(page);
            let buf = txn.read_page(page)?;
            let header = PageHeader::from_bytes(&buf)?;
            if header.kind() == PageKind::FixedBranch {
                for idx in 0..header.cell_count() as usize {
                    let at = PAGE_HEADER_SIZE + idx * 16 + 8;
                    stack.push(u64::from_le_bytes(buf[at..at + 8].try_into()?));
                }
            }
        }
        Ok(out)
    }

    /// Release every page and reset to an empty embedded tree.
    pub fn clear(&mut self, txn: &mut LowLevelTransaction<'_>) -> Result<()> {
        for page in self.pages(txn)? {
            txn.free_page(page)?;
        }
        self.state = FixedTreeState::embedded(self.state.value_size);
        self.embedded.clear();
        Ok(())
    }

    fn descend(
        &self,
        txn: &LowLevelTransaction<'_>,
        key: u64,
    ) -> Result<(u64, SmallVec<[PathEntry; 4]>)> {
        ensure!(
            !self.state.is_embedded(),
            "descend on an embedded fixed tree"
        );
        let mut path = SmallVec::new();
        let mut page = self.state.root_page;
        loop {
            let buf = txn.read_page(page)?;
            let header = PageHeader::from_bytes(&buf)?;
            match header.kind() {
                PageKind::FixedLeaf => return Ok((page, path)),
                PageKind::FixedBranch => {
                    let count = header.cell_count() as usize;
                    let idx = match search_entries(&buf, count, 16, key) {
                        Ok(idx) => idx,
                        Err(0) => 0,
                        Err(idx) => idx - 1,
                    };
                    let at = PAGE_HEADER_SIZE + idx * 16 + 8;
                    let child = u64::from_le_bytes(buf[at..at + 8].try_into()?);
                    path.push(PathEntry { page, idx });
                    page = child;
                }
                other => bail!(StorageError::Corruption(format!(
                    "page {} has kind {:?} inside a fixed tree",
                    page, other
                ))),
            }
        }
    }

    fn leftmost_leaf(&self, txn: &LowLevelTransaction<'_>) -> Result<u64> {
        let mut page = self.state.root_page;
        loop {
            let buf = txn.read_page(page)?;
            let header = PageHeader::from_bytes(&buf)?;
            match header.kind() {
                PageKind::FixedLeaf => return Ok(page),
                PageKind::FixedBranch => {
                    let at = PAGE_HEADER_SIZE + 8;
                    page = u64::from_le_bytes(buf[at..at + 8].try_into()?);
                }
                other => bail!(StorageError::Corruption(format!(
                    "page {} has kind {:?} inside a fixed tree",
                    page, other
                ))),
            }
        }
    }

    /// Move an over-cap embedded blob onto a fresh leaf page.
    fn promote(&mut self, txn: &mut LowLevelTransaction<'_>) -> Result<()> {
        let page = txn.allocate_page()?;
        let value_size = self.state.value_size;
        let count = self.state.record_count;
        let blob = std::mem::take(&mut self.embedded);

        let buf = txn.modify_page(page)?;
        buf.fill(0);
        let mut header = PageHeader::new(PageKind::FixedLeaf, page, buf.len());
        header.set_value_size(value_size as u32);
        header.set_cell_count(count as u16);
        header.write_to(buf)?;
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + blob.len()].copy_from_slice(&blob);

        self.state.root_page = page;
        self.state.depth = 1;
        self.state.flags &= !FIXED_STATE_EMBEDDED;
        Ok(())
    }

    /// Fold a depth-one page tree back into the embedded form when it fits.
    fn try_demote(&mut self, txn: &mut LowLevelTransaction<'_>) -> Result<()> {
        if self.state.is_embedded() || self.state.depth != 1 {
            return Ok(());
        }
        let encoded = self.state.record_count as usize * self.entry_size();
        if encoded > FIXED_EMBEDDED_CAP {
            return Ok(());
        }
        let buf = txn.read_page(self.state.root_page)?;
        self.embedded = buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + encoded].to_vec();
        txn.free_page(self.state.root_page)?;
        self.state.root_page = 0;
        self.state.depth = 0;
        self.state.flags |= FIXED_STATE_EMBEDDED;
        Ok(())
    }

    fn insert_in_leaf(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        leaf_page: u64,
        path: SmallVec<[PathEntry; 4]>,
        key: u64,
        value: &[u8],
    ) -> Result<bool> {
        let entry_size = self.entry_size();
        let page_size = txn.page_size();
        let capacity = leaf_capacity(page_size, self.state.value_size);

        let buf = txn.modify_page(leaf_page)?;
        let header = PageHeader::from_bytes(buf)?;
        let count = header.cell_count() as usize;

        if let Ok(idx) = search_entries(buf, count, entry_size, key) {
            let at = PAGE_HEADER_SIZE + idx * entry_size + 8;
            buf[at..at + value.len()].copy_from_slice(value);
            return Ok(false);
        }

        if count < capacity {
            let Err(idx) = search_entries(buf, count, entry_size, key) else {
                unreachable!()
            };
            let start = PAGE_HEADER_SIZE + idx * entry_size;
            let end = PAGE_HEADER_SIZE + count * entry_size;
            buf.copy_within(start..end, start + entry_size);
            buf[start..start + 8].copy_from_slice(&key.to_le_bytes());
            buf[start + 8..start + 8 + value.len()].copy_from_slice(value);
            PageHeader::from_bytes_mut(buf)?.set_cell_count((count + 1) as u16);
            self.state.record_count += 1;
            if idx == 0 && !path.is_empty() {
                self.update_branch_key(txn, &path, key)?;
            }
            return Ok(true);
        }

        // Full leaf: split, then insert into whichever half covers the key.
        let right_page = self.split_leaf(txn, leaf_page, path.as_slice())?;
        let (target, path) = self.descend(txn, key)?;
        debug_assert!(target == leaf_page || target == right_page);
        self.insert_in_leaf(txn, target, path, key, value)
    }

    fn split_leaf(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        leaf_page: u64,
        path: &[PathEntry],
    ) -> Result<u64> {
        let entry_size = self.entry_size();
        let right_page = txn.allocate_page()?;

        let left = txn.read_page(leaf_page)?;
        let left_header = PageHeader::from_bytes(&left)?;
        let count = left_header.cell_count() as usize;
        let half = count / 2;
        let sep_key = entry_key(&left, entry_size, half);
        let moved = left
            [PAGE_HEADER_SIZE + half * entry_size..PAGE_HEADER_SIZE + count * entry_size]
            .to_vec();
        let old_sibling = left_header.right_sibling();

        let buf = txn.modify_page(right_page)?;
        buf.fill(0);
        let mut header = PageHeader::new(PageKind::FixedLeaf, right_page, buf.len());
        header.set_value_size(self.state.value_size as u32);
        header.set_cell_count((count - half) as u16);
        header.set_right_sibling(old_sibling);
        header.write_to(buf)?;
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + moved.len()].copy_from_slice(&moved);

        let buf = txn.modify_page(leaf_page)?;
        let header = PageHeader::from_bytes_mut(buf)?;
        header.set_cell_count(half as u16);
        header.set_right_sibling(right_page);

        self.insert_in_branch(txn, path, sep_key, right_page)?;
        Ok(right_page)
    }

    fn insert_in_branch(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        path: &[PathEntry],
        key: u64,
        child: u64,
    ) -> Result<()> {
        let Some(parent) = path.last() else {
            return self.grow_root(txn, key, child);
        };
        let page_size = txn.page_size();
        let capacity = branch_capacity(page_size);

        let buf = txn.modify_page(parent.page)?;
        let header = PageHeader::from_bytes(buf)?;
        let count = header.cell_count() as usize;

        if count < capacity {
            let idx = match search_entries(buf, count, 16, key) {
                Ok(idx) => idx,
                Err(idx) => idx,
            };
            let start = PAGE_HEADER_SIZE + idx * 16;
            let end = PAGE_HEADER_SIZE + count * 16;
            buf.copy_within(start..end, start + 16);
            buf[start..start + 8].copy_from_slice(&key.to_le_bytes());
            buf[start + 8..start + 16].copy_from_slice(&child.to_le_bytes());
            PageHeader::from_bytes_mut(buf)?.set_cell_count((count + 1) as u16);
            return Ok(());
        }

        // Full branch: split it and recurse into the grandparent.
        let right_page = txn.allocate_page()?;
        let left = txn.read_page(parent.page)?;
        let half = count / 2;
        let sep_key = entry_key(&left, 16, half);
        let moved =
            left[PAGE_HEADER_SIZE + half * 16..PAGE_HEADER_SIZE + count * 16].to_vec();

        let buf = txn.modify_page(right_page)?;
        buf.fill(0);
        let mut header = PageHeader::new(PageKind::FixedBranch, right_page, buf.len());
        header.set_cell_count((count - half) as u16);
        header.write_to(buf)?;
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + moved.len()].copy_from_slice(&moved);

        let buf = txn.modify_page(parent.page)?;
        PageHeader::from_bytes_mut(buf)?.set_cell_count(half as u16);

        self.insert_in_branch(txn, &path[..path.len() - 1], sep_key, right_page)?;

        // Re-descend to place the original entry in the correct half.
        let target = if key < sep_key { parent.page } else { right_page };
        let buf = txn.modify_page(target)?;
        let header = PageHeader::from_bytes(buf)?;
        let count = header.cell_count() as usize;
        let idx = match search_entries(buf, count, 16, key) {
            Ok(idx) => idx,
            Err(idx) => idx,
        };
        let start = PAGE_HEADER_SIZE + idx * 16;
        let end = PAGE_HEADER_SIZE + count * 16;
        buf.copy_within(start..end, start + 16);
        buf[start..start + 8].copy_from_slice(&key.to_le_bytes());
        buf[start + 8..start + 16].copy_from_slice(&child.to_le_bytes());
        PageHeader::from_bytes_mut(buf)?.set_cell_count((count + 1) as u16);
        Ok(())
    }

    fn grow_root(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        key: u64,
        child: u64,
    ) -> Result<()> {
        let old_root = self.state.root_page;
        let old_first = {
            let buf = txn.read_page(old_root)?;
            let header = PageHeader::from_bytes(&buf)?;
            let entry_size = if header.kind() == PageKind::FixedBranch {
                16
            } else {
                self.entry_size()
            };
            entry_key(&buf, entry_size, 0)
        };

        let new_root = txn.allocate_page()?;
        let buf = txn.modify_page(new_root)?;
        buf.fill(0);
        let mut header = PageHeader::new(PageKind::FixedBranch, new_root, buf.len());
        header.set_cell_count(2);
        header.write_to(buf)?;
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 8].copy_from_slice(&old_first.to_le_bytes());
        buf[PAGE_HEADER_SIZE + 8..PAGE_HEADER_SIZE + 16]
            .copy_from_slice(&old_root.to_le_bytes());
        buf[PAGE_HEADER_SIZE + 16..PAGE_HEADER_SIZE + 24].copy_from_slice(&key.to_le_bytes());
        buf[PAGE_HEADER_SIZE + 24..PAGE_HEADER_SIZE + 32]
            .copy_from_slice(&child.to_le_bytes());

        self.state.root_page = new_root;
        self.state.depth += 1;
        Ok(())
    }

    /// After an empty page is deleted, unlink it from its parent chain.
    fn remove_empty_page(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        page: u64,
        mut path: SmallVec<[PathEntry; 4]>,
    ) -> Result<()> {
        // Unchain the leaf from its left sibling if it has one.
        self.unchain_leaf(txn, page)?;
        txn.free_page(page)?;

        while let Some(parent) = path.pop() {
            let buf = txn.modify_page(parent.page)?;
            let header = PageHeader::from_bytes(buf)?;
            let count = header.cell_count() as usize;
            let start = PAGE_HEADER_SIZE + parent.idx * 16;
            let end = PAGE_HEADER_SIZE + count * 16;
            buf.copy_within(start + 16..end, start);
            PageHeader::from_bytes_mut(buf)?.set_cell_count((count - 1) as u16);

            if count - 1 > 0 {
                break;
            }
            txn.free_page(parent.page)?;
        }

        // Collapse single-child roots.
        loop {
            if self.state.depth <= 1 {
                break;
            }
            let buf = txn.read_page(self.state.root_page)?;
            let header = PageHeader::from_bytes(&buf)?;
            if header.kind() != PageKind::FixedBranch || header.cell_count() != 1 {
                break;
            }
            let at = PAGE_HEADER_SIZE + 8;
            let only_child = u64::from_le_bytes(buf[at..at + 8].try_into()?);
            txn.free_page(self.state.root_page)?;
            self.state.root_page = only_child;
            self.state.depth -= 1;
        }

        if self.state.record_count == 0 {
            // The last leaf is gone; start over embedded.
            self.state = FixedTreeState::embedded(self.state.value_size);
            self.embedded.clear();
        }
        Ok(())
    }

    fn unchain_leaf(&self, txn: &mut LowLevelTransaction<'_>, page: u64) -> Result<()> {
        let gone = txn.read_page(page)?;
        let next = PageHeader::from_bytes(&gone)?.right_sibling();

        let mut cursor = self.leftmost_leaf(txn)?;
        while cursor != 0 && cursor != page {
            let buf = txn.read_page(cursor)?;
            let sibling = PageHeader::from_bytes(&buf)?.right_sibling();
            if sibling == page {
                let buf = txn.modify_page(cursor)?;
                PageHeader::from_bytes_mut(buf)?.set_right_sibling(next);
                break;
            }
            cursor = sibling;
        }
        Ok(())
    }

    /// Propagate a changed minimum key of a child into its branch entry.
    fn update_branch_key(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        path: &[PathEntry],
        new_min: u64,
    ) -> Result<()> {
        for parent in path.iter().rev() {
            let buf = txn.modify_page(parent.page)?;
            let at = PAGE_HEADER_SIZE + parent.idx * 16;
            buf[at..at + 8].copy_from_slice(&new_min.to_le_bytes());
            if parent.idx != 0 {
                break;
            }
        }
        Ok(())
    }
}

/// Like [`search_entries`] but over an embedded blob without a page header.
fn search_embedded(
    blob: &[u8],
    count: usize,
    entry_size: usize,
    key: u64,
) -> std::result::Result<usize, usize> {
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let at = mid * entry_size;
        let mid_key = u64::from_le_bytes(blob[at..at + 8].try_into().unwrap_or_default());
        match mid_key.cmp(&key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}
