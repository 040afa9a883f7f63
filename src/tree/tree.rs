//! # Variable B-Tree
//!
//! The main ordered map: byte-string keys to values of any size. Small
//! values live inline in leaf cells; anything larger moves to a run of
//! overflow pages and the cell keeps a pointer. Multi-value keys and
//! streams reuse this tree through their own cell kinds (see
//! [`crate::tree::multi`] and [`crate::tree::stream`]).
//!
//! ## Persistence
//!
//! A tree object is `name + TreeStateHeader`, nothing else; all content is
//! pages reached from the state's root. Named trees persist their state as
//! a value in the root-objects tree under their name, the root-objects
//! tree persists its own state in the file header. Every mutating
//! operation saves the state before returning, so a commit at any point
//! captures a consistent tree.
//!
//! ## Shape Maintenance
//!
//! Inserts split full pages upward and grow a new root when the old one
//! splits. A delete that leaves a leaf below the quarter-page low-water
//! mark merges it with a neighbor under the same parent when the combined
//! cells fit one page; emptied pages are reclaimed and single-child roots
//! collapse.

use eyre::{ensure, Result};
use smallvec::SmallVec;
use zerocopy::{FromBytes, IntoBytes};

use crate::errors::StorageError;
use crate::storage::{pages_for, PageHeader, PageKind, PAGE_HEADER_SIZE};
use crate::tree::node::{self, CellPayload, Node, NodeMut};
use crate::tree::TreeStateHeader;
use crate::txn::LowLevelTransaction;

/// Reserved name of the root-objects tree.
pub const ROOT_TREE_NAME: &[u8] = b"$root-objects";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeKind {
    RootObjects,
    Named,
    /// Nested under a multi-value cell; state lives in the owning cell.
    Nested,
}

pub struct Tree {
    name: Vec<u8>,
    kind: TreeKind,
    state: TreeStateHeader,
}

struct PathStep {
    page: u64,
    idx: usize,
}

type Path = SmallVec<[PathStep; 4]>;

impl Tree {
    /// The root-objects tree of this transaction's snapshot.
    pub fn root_objects(txn: &LowLevelTransaction<'_>) -> Self {
        Self {
            name: ROOT_TREE_NAME.to_vec(),
            kind: TreeKind::RootObjects,
            state: txn.root_objects_state(),
        }
    }

    /// Create a named tree. Fails when the name is taken.
    pub fn create(txn: &mut LowLevelTransaction<'_>, name: &[u8]) -> Result<Self> {
        ensure!(
            !name.is_empty() && !name.starts_with(b"$"),
            StorageError::InvalidArgument(format!(
                "tree name '{}' is empty or reserved",
                String::from_utf8_lossy(name)
            ))
        );
        let mut root = Self::root_objects(txn);
        ensure!(
            root.get(txn, name)?.is_none(),
            StorageError::InvalidArgument(format!(
                "tree '{}' already exists",
                String::from_utf8_lossy(name)
            ))
        );

        let root_page = txn.allocate_page()?;
        node::init_page(txn.modify_page(root_page)?, PageKind::Leaf, root_page);
        let state = TreeStateHeader::empty(root_page, 0);
        root.insert(txn, name, state.as_bytes())?;
        Ok(Self {
            name: name.to_vec(),
            kind: TreeKind::Named,
            state,
        })
    }

    /// Open an existing named tree.
    pub fn open(txn: &LowLevelTransaction<'_>, name: &[u8]) -> Result<Option<Self>> {
        let root = Self::root_objects(txn);
        let Some(bytes) = root.get(txn, name)? else {
            return Ok(None);
        };
        let state = TreeStateHeader::read_from_bytes(&bytes).map_err(|_| {
            StorageError::Corruption(format!(
                "tree '{}' has a malformed state record",
                String::from_utf8_lossy(name)
            ))
        })?;
        Ok(Some(Self {
            name: name.to_vec(),
            kind: TreeKind::Named,
            state,
        }))
    }

    /// Open a named tree, creating it when missing.
    pub fn open_or_create(txn: &mut LowLevelTransaction<'_>, name: &[u8]) -> Result<Self> {
        match Self::open(txn, name)? {
            Some(tree) => Ok(tree),
            None => Self::create(txn, name),
        }
    }

    /// A tree handle from a raw state, used for nested multi-value trees.
    pub(crate) fn from_state(name: &[u8], state: TreeStateHeader) -> Self {
        Self {
            name: name.to_vec(),
            kind: TreeKind::Nested,
            state,
        }
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn state(&self) -> TreeStateHeader {
        self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut TreeStateHeader {
        &mut self.state
    }

    pub fn record_count(&self) -> u64 {
        self.state.record_count
    }

    /// Persist the current state. Mutating operations call this; nested
    /// trees are saved by their owning cell instead.
    pub(crate) fn save(&self, txn: &mut LowLevelTransaction<'_>) -> Result<()> {
        match self.kind {
            TreeKind::RootObjects => txn.set_root_objects_state(self.state),
            TreeKind::Named => {
                let mut root = Self::root_objects(txn);
                root.insert(txn, &self.name, self.state.as_bytes())
            }
            TreeKind::Nested => Ok(()),
        }
    }

    fn max_inline(page_size: usize) -> usize {
        page_size / 4
    }

    pub(crate) fn max_key(page_size: usize) -> usize {
        page_size / 8
    }

    pub(crate) fn check_key(&self, txn: &LowLevelTransaction<'_>, key: &[u8]) -> Result<()> {
        ensure!(
            !key.is_empty() && key.len() <= Self::max_key(txn.page_size()),
            StorageError::InvalidArgument(format!(
                "key of {} bytes is empty or over the {}-byte limit",
                key.len(),
                Self::max_key(txn.page_size())
            ))
        );
        Ok(())
    }

    fn descend(&self, txn: &LowLevelTransaction<'_>, key: &[u8]) -> Result<(u64, Path)> {
        let mut path = Path::new();
        let mut page = self.state.root_page;
        loop {
            let buf = txn.read_page(page)?;
            let node = Node::new(&buf)?;
            if node.is_leaf() {
                return Ok((page, path));
            }
            let idx = node.branch_child_index(key)?;
            let child = node.child(idx)?;
            path.push(PathStep { page, idx });
            page = child;
        }
    }

    /// Raw cell payload stored under `key`.
    pub(crate) fn payload_of(
        &self,
        txn: &LowLevelTransaction<'_>,
        key: &[u8],
    ) -> Result<Option<CellPayload>> {
        let (leaf, _) = self.descend(txn, key)?;
        let buf = txn.read_page(leaf)?;
        let node = Node::new(&buf)?;
        match node.search(key)? {
            Ok(idx) => Ok(Some(node.payload(idx)?)),
            Err(_) => Ok(None),
        }
    }

    /// Look up a plain value, following an overflow pointer if needed.
    /// Multi-value and stream keys are reached through their own APIs.
    pub fn get(&self, txn: &LowLevelTransaction<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.payload_of(txn, key)? {
            None => Ok(None),
            Some(CellPayload::Inline(data)) => Ok(Some(data)),
            Some(CellPayload::Overflow { page, size }) => {
                Ok(Some(self.read_overflow(txn, page, size)?))
            }
            Some(_) => Err(eyre::Report::new(StorageError::InvalidArgument(format!(
                "key '{}' does not hold a plain value",
                String::from_utf8_lossy(key)
            )))),
        }
    }

    pub fn contains(&self, txn: &LowLevelTransaction<'_>, key: &[u8]) -> Result<bool> {
        Ok(self.payload_of(txn, key)?.is_some())
    }

    /// Insert or overwrite `key`. Values over a quarter page move to
    /// overflow pages.
    pub fn insert(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        self.check_key(txn, key)?;
        let payload = if value.len() > Self::max_inline(txn.page_size()) {
            let (page, size) = self.write_overflow(txn, value)?;
            CellPayload::Overflow { page, size }
        } else {
            CellPayload::Inline(value.to_vec())
        };
        self.set_payload(txn, key, payload)
    }

    /// Install `payload` under `key`, releasing whatever the key held
    /// before. The workhorse behind insert, multi-value and stream updates.
    pub(crate) fn set_payload(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        key: &[u8],
        payload: CellPayload,
    ) -> Result<()> {
        self.set_payload_inner(txn, key, payload, true)
    }

    /// Like [`Tree::set_payload`] but keeps the old payload's pages alive.
    /// For callers that mutated those pages in place and carry the new
    /// state in `payload`.
    pub(crate) fn update_payload(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        key: &[u8],
        payload: CellPayload,
    ) -> Result<()> {
        self.set_payload_inner(txn, key, payload, false)
    }

    fn set_payload_inner(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        key: &[u8],
        payload: CellPayload,
        release: bool,
    ) -> Result<()> {
        loop {
            let (leaf, path) = self.descend(txn, key)?;
            let buf = txn.modify_page(leaf)?;
            let mut node = NodeMut::new(buf)?;
            match node.as_node().search(key)? {
                Ok(idx) => {
                    let old = node.as_node().payload(idx)?;
                    if node.replace(idx, &payload)? {
                        if release {
                            self.release_payload(txn, &old)?;
                        }
                        break;
                    }
                    // Too big to replace in place; remove and reinsert so
                    // the split path sees the new cell size.
                    node.remove(idx)?;
                    if node.insert(idx, key, &payload)? {
                        if release {
                            self.release_payload(txn, &old)?;
                        }
                        break;
                    }
                    // Undo and split below.
                    let restored = node.insert(idx, key, &old)?;
                    ensure!(restored, "removed cell no longer fits its page");
                }
                Err(idx) => {
                    if node.insert(idx, key, &payload)? {
                        self.state.record_count += 1;
                        break;
                    }
                }
            }
            self.split_page(txn, leaf, &path)?;
        }
        self.save(txn)
    }

    /// Remove `key` and everything it owns. Returns `false` when absent.
    pub fn delete(&mut self, txn: &mut LowLevelTransaction<'_>, key: &[u8]) -> Result<bool> {
        self.delete_inner(txn, key, true)
    }

    /// Remove `key` without touching the pages its payload pointed at.
    pub(crate) fn delete_keep_pages(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        key: &[u8],
    ) -> Result<bool> {
        self.delete_inner(txn, key, false)
    }

    fn delete_inner(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        key: &[u8],
        release: bool,
    ) -> Result<bool> {
        let low_water = txn.page_size() / 4;
        let (leaf, path) = self.descend(txn, key)?;
        let buf = txn.modify_page(leaf)?;
        let mut node = NodeMut::new(buf)?;
        let Ok(idx) = node.as_node().search(key)? else {
            return Ok(false);
        };
        let old = node.as_node().payload(idx)?;
        node.remove(idx)?;
        let emptied = node.as_node().cell_count() == 0;
        let sparse = node.as_node().used_size() < low_water;
        if release {
            self.release_payload(txn, &old)?;
        }
        // A multi-value cell accounts for one record per value.
        self.state.record_count -= old.record_count();

        if emptied {
            self.remove_empty_page(txn, leaf, path)?;
        } else if sparse {
            self.merge_sparse_leaf(txn, leaf, &path)?;
        }
        self.save(txn)?;
        Ok(true)
    }

    /// Release the pages a payload owns: overflow runs, the pages of a
    /// nested multi-value tree, or a stream's chunks and index.
    fn release_payload(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        payload: &CellPayload,
    ) -> Result<()> {
        match payload {
            CellPayload::Overflow { page, size } => self.free_overflow(txn, *page, *size),
            CellPayload::MultiTree(state) => free_structure(txn, state),
            CellPayload::Stream {
                index, index_data, ..
            } => {
                let freed = crate::tree::stream::free_stream_pages(txn, index, index_data)?;
                self.state.overflow_pages -= freed;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ---- overflow runs ----

    pub(crate) fn write_overflow(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        data: &[u8],
    ) -> Result<(u64, u32)> {
        ensure!(
            data.len() <= u32::MAX as usize,
            StorageError::InvalidArgument("value exceeds 4GB".into())
        );
        let page_size = txn.page_size();
        let pages = pages_for((data.len() + PAGE_HEADER_SIZE) as u64, page_size);
        let page = txn.allocate_pages(pages as u32)?;
        let buf = txn.modify_pages(page, pages as u32)?;
        node::init_overflow(buf, PageKind::Overflow, page, data.len() as u32)?;
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + data.len()].copy_from_slice(data);
        self.state.overflow_pages += pages;
        Ok((page, data.len() as u32))
    }

    pub(crate) fn read_overflow(
        &self,
        txn: &LowLevelTransaction<'_>,
        page: u64,
        size: u32,
    ) -> Result<Vec<u8>> {
        let pages = pages_for((size as usize + PAGE_HEADER_SIZE) as u64, txn.page_size());
        let buf = txn.read_pages(page, pages as u32)?;
        let header = PageHeader::from_bytes(&buf)?;
        ensure!(
            header.kind().is_overflow() && header.overflow_size() == size,
            StorageError::Corruption(format!("page {} is not the expected overflow run", page))
        );
        Ok(buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + size as usize].to_vec())
    }

    pub(crate) fn free_overflow(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        page: u64,
        size: u32,
    ) -> Result<()> {
        let pages = pages_for((size as usize + PAGE_HEADER_SIZE) as u64, txn.page_size());
        txn.free_run(page, pages as u32)?;
        self.state.overflow_pages -= pages;
        Ok(())
    }

    // ---- structure maintenance ----

    /// Split an over-full page and register the separator with its parent,
    /// growing a new root when the root itself split.
    fn split_page(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        page: u64,
        path: &[PathStep],
    ) -> Result<()> {
        let (sep, right) = self.split_node(txn, page)?;
        match path.split_last() {
            None => self.grow_root(txn, page, &sep, right),
            Some((parent, ancestors)) => {
                self.insert_separator(txn, ancestors, parent.page, &sep, right)
            }
        }
    }

    /// Split `page` in half by rebuilding both sides from its decoded
    /// cells. Returns the separator key and the new right page; linking
    /// into the parent is the caller's job.
    fn split_node(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        page: u64,
    ) -> Result<(Vec<u8>, u64)> {
        let (kind, cells, old_sibling) = {
            let buf = txn.read_page(page)?;
            let node = Node::new(&buf)?;
            let mut cells = Vec::with_capacity(node.cell_count());
            for idx in 0..node.cell_count() {
                cells.push((node.key(idx)?.to_vec(), node.payload(idx)?));
            }
            (node.kind(), cells, node.right_sibling())
        };
        ensure!(
            cells.len() >= 2,
            StorageError::InvalidArgument("a single cell exceeds the page capacity".into())
        );
        let half = cells.len() / 2;
        let sep = cells[half].0.clone();
        let right_page = txn.allocate_page()?;

        let rebuild =
            |buf: &mut [u8], page_number: u64, cells: &[(Vec<u8>, CellPayload)]| -> Result<()> {
                node::init_page(buf, kind, page_number);
                let mut node = NodeMut::new(buf)?;
                for (idx, (key, payload)) in cells.iter().enumerate() {
                    ensure!(
                        node.insert(idx, key, payload)?,
                        "split half does not fit a fresh page"
                    );
                }
                Ok(())
            };

        rebuild(txn.modify_page(right_page)?, right_page, &cells[half..])?;
        rebuild(txn.modify_page(page)?, page, &cells[..half])?;

        if kind == PageKind::Leaf {
            let mut left = NodeMut::new(txn.modify_page(page)?)?;
            left.set_right_sibling(right_page);
            let mut right = NodeMut::new(txn.modify_page(right_page)?)?;
            right.set_right_sibling(old_sibling);
            self.state.leaf_pages += 1;
        } else {
            self.state.branch_pages += 1;
        }
        Ok((sep, right_page))
    }

    fn insert_separator(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        ancestors: &[PathStep],
        branch: u64,
        sep: &[u8],
        child: u64,
    ) -> Result<()> {
        {
            let buf = txn.modify_page(branch)?;
            let mut node = NodeMut::new(buf)?;
            let idx = match node.as_node().search(sep)? {
                Ok(idx) | Err(idx) => idx,
            };
            if node.insert(idx, sep, &CellPayload::Child(child))? {
                return Ok(());
            }
        }

        // The branch is full too: split it, push its separator up, then
        // route the pending separator into whichever half covers it.
        let (branch_sep, branch_right) = self.split_node(txn, branch)?;
        match ancestors.split_last() {
            None => self.grow_root(txn, branch, &branch_sep, branch_right)?,
            Some((parent, rest)) => {
                self.insert_separator(txn, rest, parent.page, &branch_sep, branch_right)?
            }
        }

        let target = if sep < branch_sep.as_slice() {
            branch
        } else {
            branch_right
        };
        let buf = txn.modify_page(target)?;
        let mut node = NodeMut::new(buf)?;
        let idx = match node.as_node().search(sep)? {
            Ok(idx) | Err(idx) => idx,
        };
        ensure!(
            node.insert(idx, sep, &CellPayload::Child(child))?,
            "separator does not fit a freshly split branch"
        );
        Ok(())
    }

    fn grow_root(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        left: u64,
        sep: &[u8],
        right: u64,
    ) -> Result<()> {
        let new_root = txn.allocate_page()?;
        let buf = txn.modify_page(new_root)?;
        node::init_page(buf, PageKind::Branch, new_root);
        let mut node = NodeMut::new(buf)?;
        ensure!(
            node.insert(0, b"", &CellPayload::Child(left))?
                && node.insert(1, sep, &CellPayload::Child(right))?,
            "fresh root cannot fit two child cells"
        );
        self.state.root_page = new_root;
        self.state.depth += 1;
        self.state.branch_pages += 1;
        Ok(())
    }

    fn remove_empty_page(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        page: u64,
        mut path: Path,
    ) -> Result<()> {
        if path.is_empty() {
            // The tree is empty; keep its root leaf.
            return Ok(());
        }
        self.unchain_leaf(txn, page)?;
        txn.free_page(page)?;
        self.state.leaf_pages -= 1;

        while let Some(parent) = path.pop() {
            let buf = txn.modify_page(parent.page)?;
            let mut node = NodeMut::new(buf)?;
            node.remove(parent.idx)?;
            if node.as_node().cell_count() > 0 {
                break;
            }
            if path.is_empty() {
                break;
            }
            txn.free_page(parent.page)?;
            self.state.branch_pages -= 1;
        }

        self.collapse_root(txn)
    }

    /// Merge a leaf that fell below the low-water mark into its neighbor
    /// under the same parent, provided their combined cells fit one page.
    fn merge_sparse_leaf(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        leaf: u64,
        path: &[PathStep],
    ) -> Result<()> {
        let Some(parent) = path.last() else {
            // The leaf is the root; nothing to merge with.
            return Ok(());
        };
        let (left_page, right_page, right_idx) = {
            let buf = txn.read_page(parent.page)?;
            let node = Node::new(&buf)?;
            if parent.idx + 1 < node.cell_count() {
                (leaf, node.child(parent.idx + 1)?, parent.idx + 1)
            } else if parent.idx > 0 {
                (node.child(parent.idx - 1)?, leaf, parent.idx)
            } else {
                return Ok(());
            }
        };

        let (cells, next_sibling) = {
            let left_buf = txn.read_page(left_page)?;
            let left = Node::new(&left_buf)?;
            let right_buf = txn.read_page(right_page)?;
            let right = Node::new(&right_buf)?;
            if left.used_size() + right.used_size() - PAGE_HEADER_SIZE > txn.page_size() {
                return Ok(());
            }
            let mut cells = Vec::with_capacity(left.cell_count() + right.cell_count());
            for idx in 0..left.cell_count() {
                cells.push((left.key(idx)?.to_vec(), left.payload(idx)?));
            }
            for idx in 0..right.cell_count() {
                cells.push((right.key(idx)?.to_vec(), right.payload(idx)?));
            }
            (cells, right.right_sibling())
        };

        let buf = txn.modify_page(left_page)?;
        node::init_page(buf, PageKind::Leaf, left_page);
        let mut node = NodeMut::new(buf)?;
        for (idx, (key, payload)) in cells.iter().enumerate() {
            ensure!(
                node.insert(idx, key, payload)?,
                "merged cells do not fit one page"
            );
        }
        node.set_right_sibling(next_sibling);
        txn.free_page(right_page)?;
        self.state.leaf_pages -= 1;

        let buf = txn.modify_page(parent.page)?;
        NodeMut::new(buf)?.remove(right_idx)?;
        self.collapse_root(txn)
    }

    fn collapse_root(&mut self, txn: &mut LowLevelTransaction<'_>) -> Result<()> {
        loop {
            let buf = txn.read_page(self.state.root_page)?;
            let node = Node::new(&buf)?;
            if node.is_leaf() || node.cell_count() != 1 {
                return Ok(());
            }
            let child = node.child(0)?;
            txn.free_page(self.state.root_page)?;
            self.state.root_page = child;
            self.state.depth -= 1;
            self.state.branch_pages -= 1;
        }
    }

    fn unchain_leaf(&self, txn: &mut LowLevelTransaction<'_>, page: u64) -> Result<()> {
        let next = {
            let buf = txn.read_page(page)?;
            Node::new(&buf)?.right_sibling()
        };
        let mut cursor = self.leftmost_leaf(txn)?;
        while cursor != 0 && cursor != page {
            let sibling = {
                let buf = txn.read_page(cursor)?;
                Node::new(&buf)?.right_sibling()
            };
            if sibling == page {
                let buf = txn.modify_page(cursor)?;
                NodeMut::new(buf)?.set_right_sibling(next);
                break;
            }
            cursor = sibling;
        }
        Ok(())
    }

    fn leftmost_leaf(&self, txn: &LowLevelTransaction<'_>) -> Result<u64> {
        let mut page = self.state.root_page;
        loop {
            let buf = txn.read_page(page)?;
            let node = Node::new(&buf)?;
            if node.is_leaf() {
                return Ok(page);
            }
            page = node.child(0)?;
        }
    }

    /// Iterate the whole tree in key order.
    pub fn iter<'t, 'env>(
        &self,
        txn: &'t LowLevelTransaction<'env>,
    ) -> Result<TreeIterator<'t, 'env>> {
        let leaf = self.leftmost_leaf(txn)?;
        TreeIterator::start_at(txn, leaf, None)
    }

    /// Iterate keys at or after `from`.
    pub fn iter_from<'t, 'env>(
        &self,
        txn: &'t LowLevelTransaction<'env>,
        from: &[u8],
    ) -> Result<TreeIterator<'t, 'env>> {
        let (leaf, _) = self.descend(txn, from)?;
        TreeIterator::start_at(txn, leaf, Some(from))
    }

    /// Drop every entry and page of a named tree, including its state
    /// record. Consumes the handle.
    pub fn drop_tree(mut self, txn: &mut LowLevelTransaction<'_>) -> Result<()> {
        ensure!(
            self.kind == TreeKind::Named,
            StorageError::InvalidArgument("the root-objects tree cannot be dropped".into())
        );

        // Free value-owned pages first, then the structural pages.
        let keys: Vec<Vec<u8>> = {
            let iter = self.iter(txn)?;
            iter.map(|entry| entry.map(|(key, _)| key)).collect::<Result<_>>()?
        };
        for key in keys {
            self.delete(txn, &key)?;
        }

        txn.free_page(self.state.root_page)?;
        let mut root = Self::root_objects(txn);
        root.delete(txn, &self.name)?;
        Ok(())
    }
}

/// Free every branch and leaf page of a nested tree. Nested trees store
/// only inline values, so the structural pages are all there is.
pub(crate) fn free_structure(
    txn: &mut LowLevelTransaction<'_>,
    state: &TreeStateHeader,
) -> Result<()> {
    let mut stack = vec![state.root_page];
    while let Some(page) = stack.pop() {
        let children = {
            let buf = txn.read_page(page)?;
            let node = Node::new(&buf)?;
            if node.is_leaf() {
                Vec::new()
            } else {
                (0..node.cell_count())
                    .map(|idx| node.child(idx))
                    .collect::<Result<Vec<_>>>()?
            }
        };
        stack.extend(children);
        txn.free_page(page)?;
    }
    Ok(())
}

/// In-order iterator over leaf cells, following the sibling chain.
pub struct TreeIterator<'t, 'env> {
    txn: &'t LowLevelTransaction<'env>,
    buf: Option<Vec<u8>>,
    idx: usize,
    failed: bool,
}

impl<'t, 'env> TreeIterator<'t, 'env> {
    fn start_at(
        txn: &'t LowLevelTransaction<'env>,
        leaf: u64,
        from: Option<&[u8]>,
    ) -> Result<Self> {
        let buf = txn.read_page(leaf)?;
        let idx = match from {
            None => 0,
            Some(key) => match Node::new(&buf)?.search(key)? {
                Ok(idx) | Err(idx) => idx,
            },
        };
        Ok(Self {
            txn,
            buf: Some(buf),
            idx,
            failed: false,
        })
    }

    fn advance(&mut self) -> Result<Option<(Vec<u8>, CellPayload)>> {
        loop {
            let Some(buf) = &self.buf else {
                return Ok(None);
            };
            let node = Node::new(buf)?;
            if self.idx < node.cell_count() {
                let key = node.key(self.idx)?.to_vec();
                let payload = node.payload(self.idx)?;
                self.idx += 1;
                return Ok(Some((key, payload)));
            }
            let next = node.right_sibling();
            if next == 0 {
                self.buf = None;
                return Ok(None);
            }
            self.buf = Some(self.txn.read_page(next)?);
            self.idx = 0;
        }
    }
}

impl Iterator for TreeIterator<'_, '_> {
    type Item = Result<(Vec<u8>, CellPayload)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
