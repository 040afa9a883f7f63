//! # Multi-Value Keys
//!
//! A key can hold a sorted set of values instead of a single one. Small
//! sets are packed into the leaf cell as a length-prefixed list; once the
//! packed form outgrows [`MULTI_EMBEDDED_CAP`] the set is promoted to a
//! nested tree whose keys are the values, and demoted back when it shrinks
//! enough. A plain single value converts to a set on the first
//! `multi_add`, matching how callers grow an index entry over time.

use eyre::{ensure, Result};

use crate::errors::StorageError;
use crate::tree::node::CellPayload;
use crate::tree::tree::{free_structure, Tree, TreeIterator};
use crate::tree::{TreeStateHeader, TREE_FLAG_MULTI_VALUE};
use crate::txn::LowLevelTransaction;

/// Largest packed value list kept inside a leaf cell.
pub const MULTI_EMBEDDED_CAP: usize = 512;

fn packed_size(entries: &[Vec<u8>]) -> usize {
    2 + entries.iter().map(|e| 2 + e.len()).sum::<usize>()
}

fn encode_entries(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(packed_size(entries));
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for entry in entries {
        out.extend_from_slice(&(entry.len() as u16).to_le_bytes());
        out.extend_from_slice(entry);
    }
    out
}

fn decode_entries(blob: &[u8]) -> Result<Vec<Vec<u8>>> {
    let corrupt = || StorageError::Corruption("malformed packed value list".into());
    ensure!(blob.len() >= 2, corrupt());
    let count = u16::from_le_bytes([blob[0], blob[1]]) as usize;
    let mut entries = Vec::with_capacity(count);
    let mut at = 2;
    for _ in 0..count {
        let len_end = at + 2;
        let len =
            u16::from_le_bytes(blob.get(at..len_end).ok_or_else(corrupt)?.try_into()?) as usize;
        let end = len_end + len;
        entries.push(blob.get(len_end..end).ok_or_else(corrupt)?.to_vec());
        at = end;
    }
    ensure!(at == blob.len(), corrupt());
    Ok(entries)
}

impl Tree {
    fn check_multi_value(&self, txn: &LowLevelTransaction<'_>, value: &[u8]) -> Result<()> {
        ensure!(
            !value.is_empty() && value.len() <= Self::max_key(txn.page_size()),
            StorageError::InvalidArgument(format!(
                "multi-value entry of {} bytes is empty or over the {}-byte limit",
                value.len(),
                Self::max_key(txn.page_size())
            ))
        );
        Ok(())
    }

    /// Add `value` to the set stored under `key`. Adding a value that is
    /// already present is a no-op.
    pub fn multi_add(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        self.check_key(txn, key)?;
        self.check_multi_value(txn, value)?;

        match self.payload_of(txn, key)? {
            None => self.set_payload(txn, key, CellPayload::MultiEmbedded(encode_entries(&[value.to_vec()]))),
            Some(CellPayload::Inline(existing)) => {
                let mut entries = vec![existing];
                if entries[0] != value {
                    let at = if value < entries[0].as_slice() { 0 } else { 1 };
                    entries.insert(at, value.to_vec());
                    self.state_mut().record_count += 1;
                }
                self.store_entries(txn, key, entries)
            }
            Some(CellPayload::MultiEmbedded(blob)) => {
                let mut entries = decode_entries(&blob)?;
                match entries.binary_search_by(|e| e.as_slice().cmp(value)) {
                    Ok(_) => Ok(()),
                    Err(at) => {
                        entries.insert(at, value.to_vec());
                        self.state_mut().record_count += 1;
                        self.store_entries(txn, key, entries)
                    }
                }
            }
            Some(CellPayload::MultiTree(state)) => {
                let mut nested = Tree::from_state(key, state);
                let before = nested.record_count();
                nested.insert(txn, value, b"")?;
                if nested.record_count() > before {
                    self.state_mut().record_count += 1;
                }
                self.update_payload(txn, key, CellPayload::MultiTree(nested.state()))
            }
            Some(_) => Err(eyre::Report::new(StorageError::InvalidArgument(format!(
                "key '{}' holds a value that cannot become a set",
                String::from_utf8_lossy(key)
            )))),
        }
    }

    /// Remove `value` from the set under `key`. The key itself goes away
    /// with its last value. Returns `false` when the value was absent.
    pub fn multi_remove(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        match self.payload_of(txn, key)? {
            None => Ok(false),
            Some(CellPayload::Inline(existing)) => {
                if existing == value {
                    self.delete(txn, key)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Some(CellPayload::MultiEmbedded(blob)) => {
                let mut entries = decode_entries(&blob)?;
                let Ok(at) = entries.binary_search_by(|e| e.as_slice().cmp(value)) else {
                    return Ok(false);
                };
                entries.remove(at);
                if entries.is_empty() {
                    self.delete(txn, key)?;
                } else {
                    self.state_mut().record_count -= 1;
                    self.update_payload(txn, key, CellPayload::MultiEmbedded(encode_entries(&entries)))?;
                }
                Ok(true)
            }
            Some(CellPayload::MultiTree(state)) => {
                let mut nested = Tree::from_state(key, state);
                if !nested.delete(txn, value)? {
                    return Ok(false);
                }
                if nested.record_count() == 0 {
                    free_structure(txn, &nested.state())?;
                    self.delete_keep_pages(txn, key)?;
                } else {
                    self.state_mut().record_count -= 1;
                    if self.try_demote(txn, key, &nested)? {
                        // Shrunk back into the cell.
                    } else {
                        self.update_payload(txn, key, CellPayload::MultiTree(nested.state()))?;
                    }
                }
                Ok(true)
            }
            Some(_) => Err(eyre::Report::new(StorageError::InvalidArgument(format!(
                "key '{}' does not hold a value set",
                String::from_utf8_lossy(key)
            )))),
        }
    }

    /// Number of values under `key`. A plain value counts as one.
    pub fn multi_count(&self, txn: &LowLevelTransaction<'_>, key: &[u8]) -> Result<u64> {
        match self.payload_of(txn, key)? {
            None => Ok(0),
            Some(CellPayload::Inline(_)) => Ok(1),
            Some(CellPayload::MultiEmbedded(blob)) => Ok(decode_entries(&blob)?.len() as u64),
            Some(CellPayload::MultiTree(state)) => Ok(state.record_count),
            Some(_) => Err(eyre::Report::new(StorageError::InvalidArgument(format!(
                "key '{}' does not hold a value set",
                String::from_utf8_lossy(key)
            )))),
        }
    }

    /// Iterate the values under `key` in sorted order.
    pub fn multi_iter<'t, 'env>(
        &self,
        txn: &'t LowLevelTransaction<'env>,
        key: &[u8],
    ) -> Result<MultiValueIterator<'t, 'env>> {
        let inner = match self.payload_of(txn, key)? {
            None => MultiIterInner::Done,
            Some(CellPayload::Inline(value)) => MultiIterInner::Single(Some(value)),
            Some(CellPayload::MultiEmbedded(blob)) => {
                MultiIterInner::Packed(decode_entries(&blob)?.into_iter())
            }
            Some(CellPayload::MultiTree(state)) => {
                let nested = Tree::from_state(key, state);
                MultiIterInner::Nested(nested.iter(txn)?)
            }
            Some(_) => {
                return Err(eyre::Report::new(StorageError::InvalidArgument(format!(
                    "key '{}' does not hold a value set",
                    String::from_utf8_lossy(key)
                ))))
            }
        };
        Ok(MultiValueIterator { inner })
    }

    fn store_entries(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        key: &[u8],
        entries: Vec<Vec<u8>>,
    ) -> Result<()> {
        if packed_size(&entries) <= MULTI_EMBEDDED_CAP {
            return self.set_payload(txn, key, CellPayload::MultiEmbedded(encode_entries(&entries)));
        }

        // Promote: the packed list outgrew its cell, move it to a nested
        // tree keyed by the values themselves.
        let root_page = txn.allocate_page()?;
        crate::tree::node::init_page(
            txn.modify_page(root_page)?,
            crate::storage::PageKind::Leaf,
            root_page,
        );
        let state = TreeStateHeader::empty(root_page, TREE_FLAG_MULTI_VALUE);
        let mut nested = Tree::from_state(key, state);
        for entry in &entries {
            nested.insert(txn, entry, b"")?;
        }
        self.set_payload(txn, key, CellPayload::MultiTree(nested.state()))
    }

    /// Repack a shrunken nested set back into its cell when it fits.
    fn try_demote(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        key: &[u8],
        nested: &Tree,
    ) -> Result<bool> {
        // Cheap upper bound first; entry lengths need a walk.
        if 2 + nested.record_count() as usize * 2 > MULTI_EMBEDDED_CAP {
            return Ok(false);
        }
        let entries: Vec<Vec<u8>> = nested
            .iter(txn)?
            .map(|e| e.map(|(k, _)| k))
            .collect::<Result<_>>()?;
        if packed_size(&entries) > MULTI_EMBEDDED_CAP {
            return Ok(false);
        }
        free_structure(txn, &nested.state())?;
        self.update_payload(txn, key, CellPayload::MultiEmbedded(encode_entries(&entries)))?;
        Ok(true)
    }
}

enum MultiIterInner<'t, 'env> {
    Done,
    Single(Option<Vec<u8>>),
    Packed(std::vec::IntoIter<Vec<u8>>),
    Nested(TreeIterator<'t, 'env>),
}

/// Sorted iterator over the values of one multi-value key.
pub struct MultiValueIterator<'t, 'env> {
    inner: MultiIterInner<'t, 'env>,
}

impl Iterator for MultiValueIterator<'_, '_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            MultiIterInner::Done => None,
            MultiIterInner::Single(value) => value.take().map(Ok),
            MultiIterInner::Packed(values) => values.next().map(Ok),
            MultiIterInner::Nested(iter) => iter.next().map(|e| e.map(|(k, _)| k)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;
    use crate::env::StorageEnvironment;

    fn env() -> StorageEnvironment {
        StorageEnvironment::open(StorageOptions::in_memory()).unwrap()
    }

    fn values(tree: &Tree, txn: &LowLevelTransaction<'_>, key: &[u8]) -> Vec<Vec<u8>> {
        tree.multi_iter(txn, key)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap()
    }

    #[test]
    fn add_remove_and_count() {
        let env = env();
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"idx").unwrap();

        tree.multi_add(&mut txn, b"color", b"red").unwrap();
        tree.multi_add(&mut txn, b"color", b"blue").unwrap();
        tree.multi_add(&mut txn, b"color", b"red").unwrap();
        assert_eq!(tree.multi_count(&txn, b"color").unwrap(), 2);
        assert_eq!(values(&tree, &txn, b"color"), vec![b"blue".to_vec(), b"red".to_vec()]);

        assert!(tree.multi_remove(&mut txn, b"color", b"red").unwrap());
        assert!(!tree.multi_remove(&mut txn, b"color", b"red").unwrap());
        assert_eq!(tree.multi_count(&txn, b"color").unwrap(), 1);
    }

    #[test]
    fn last_value_removes_the_key() {
        let env = env();
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"idx").unwrap();

        tree.multi_add(&mut txn, b"k", b"only").unwrap();
        assert!(tree.multi_remove(&mut txn, b"k", b"only").unwrap());
        assert_eq!(tree.multi_count(&txn, b"k").unwrap(), 0);
        assert!(!tree.contains(&txn, b"k").unwrap());
        assert_eq!(tree.record_count(), 0);
    }

    #[test]
    fn plain_value_converts_on_first_add() {
        let env = env();
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"idx").unwrap();

        tree.insert(&mut txn, b"k", b"m").unwrap();
        tree.multi_add(&mut txn, b"k", b"a").unwrap();
        assert_eq!(tree.multi_count(&txn, b"k").unwrap(), 2);
        assert_eq!(values(&tree, &txn, b"k"), vec![b"a".to_vec(), b"m".to_vec()]);
        // The key is a set now, plain reads are refused.
        assert!(tree.get(&txn, b"k").is_err());
    }

    #[test]
    fn grows_to_a_nested_tree_and_shrinks_back() {
        let env = env();
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"idx").unwrap();

        let count = 200u32;
        for i in 0..count {
            let value = format!("value-{:04}", i);
            tree.multi_add(&mut txn, b"big", value.as_bytes()).unwrap();
        }
        assert_eq!(tree.multi_count(&txn, b"big").unwrap(), count as u64);
        assert!(matches!(
            tree.payload_of(&txn, b"big").unwrap(),
            Some(CellPayload::MultiTree(_))
        ));
        let listed = values(&tree, &txn, b"big");
        assert_eq!(listed.len(), count as usize);
        assert!(listed.windows(2).all(|w| w[0] < w[1]));

        for i in 10..count {
            let value = format!("value-{:04}", i);
            assert!(tree.multi_remove(&mut txn, b"big", value.as_bytes()).unwrap());
        }
        assert_eq!(tree.multi_count(&txn, b"big").unwrap(), 10);
        assert!(matches!(
            tree.payload_of(&txn, b"big").unwrap(),
            Some(CellPayload::MultiEmbedded(_))
        ));
        assert_eq!(values(&tree, &txn, b"big").len(), 10);
    }

    #[test]
    fn record_count_counts_each_value() {
        let env = env();
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"idx").unwrap();

        tree.insert(&mut txn, b"plain", b"v").unwrap();
        for i in 0..3u32 {
            let value = format!("v{}", i);
            tree.multi_add(&mut txn, b"set", value.as_bytes()).unwrap();
        }
        assert_eq!(tree.record_count(), 4);
        // Duplicates do not count twice.
        tree.multi_add(&mut txn, b"set", b"v0").unwrap();
        assert_eq!(tree.record_count(), 4);

        // Promotion to a nested tree keeps the per-value accounting.
        for i in 0..200u32 {
            let value = format!("value-{:04}", i);
            tree.multi_add(&mut txn, b"big", value.as_bytes()).unwrap();
        }
        assert_eq!(tree.record_count(), 204);

        assert!(tree.multi_remove(&mut txn, b"set", b"v0").unwrap());
        assert_eq!(tree.record_count(), 203);

        // Deleting the key drops all of its values at once.
        assert!(tree.delete(&mut txn, b"big").unwrap());
        assert_eq!(tree.record_count(), 3);
    }

    #[test]
    fn sets_survive_commits() {
        let env = env();
        {
            let mut txn = env.write_txn().unwrap();
            let mut tree = Tree::create(&mut txn, b"idx").unwrap();
            for i in 0..100u32 {
                let value = format!("v{:03}", i);
                tree.multi_add(&mut txn, b"k", value.as_bytes()).unwrap();
            }
            txn.commit().unwrap();
        }

        let txn = env.read_txn().unwrap();
        let tree = Tree::open(&txn, b"idx").unwrap().unwrap();
        assert_eq!(tree.multi_count(&txn, b"k").unwrap(), 100);
    }

    #[test]
    fn deleting_a_multi_key_reclaims_nested_pages() {
        let env = env();
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"idx").unwrap();

        for i in 0..300u32 {
            let value = format!("value-{:06}", i);
            tree.multi_add(&mut txn, b"k", value.as_bytes()).unwrap();
        }
        let free_before = txn.free_page_count();
        assert!(tree.delete(&mut txn, b"k").unwrap());
        assert!(txn.free_page_count() > free_before);
        assert_eq!(tree.multi_count(&txn, b"k").unwrap(), 0);
    }

    #[test]
    fn rejects_oversized_values() {
        let env = env();
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"idx").unwrap();
        let value = vec![b'v'; txn.page_size()];
        assert!(tree.multi_add(&mut txn, b"k", &value).is_err());
        assert!(tree.multi_add(&mut txn, b"k", b"").is_err());
    }
}
