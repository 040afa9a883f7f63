//! # Streams
//!
//! Values too large for a single overflow run are stored as a sequence of
//! chunks, each its own run of stream-chunk pages, indexed by a fixed-size
//! tree keyed on the chunk ordinal. The leaf cell carries the stream's
//! byte size, a version that bumps on every rewrite, the chunk index state
//! and an optional caller-supplied tag.
//!
//! Reads go through [`StreamReader`], which implements [`std::io::Read`]
//! and loads one chunk at a time, so a stream never has to fit in memory
//! at once.

use std::io::{self, Read};

use eyre::{ensure, Result};

use crate::errors::StorageError;
use crate::storage::{pages_for, PageHeader, PageKind, PAGE_HEADER_SIZE};
use crate::tree::fixed::{FixedSizeTree, FixedTreeState};
use crate::tree::node::{self, CellPayload, StreamInfo};
use crate::tree::tree::Tree;
use crate::txn::LowLevelTransaction;

/// One chunk-index entry: first page of the run plus the chunk length.
const CHUNK_ENTRY_SIZE: u16 = 12;

fn encode_chunk_entry(page: u64, len: u32) -> [u8; CHUNK_ENTRY_SIZE as usize] {
    let mut entry = [0u8; CHUNK_ENTRY_SIZE as usize];
    entry[..8].copy_from_slice(&page.to_le_bytes());
    entry[8..].copy_from_slice(&len.to_le_bytes());
    entry
}

fn decode_chunk_entry(value: &[u8]) -> Result<(u64, u32)> {
    let corrupt = || StorageError::Corruption("malformed chunk index entry".into());
    let page = u64::from_le_bytes(value.get(..8).ok_or_else(corrupt)?.try_into()?);
    let len = u32::from_le_bytes(value.get(8..12).ok_or_else(corrupt)?.try_into()?);
    Ok((page, len))
}

fn chunk_run_pages(len: u32, page_size: usize) -> u64 {
    pages_for((len as usize + PAGE_HEADER_SIZE) as u64, page_size)
}

fn read_chunk(txn: &LowLevelTransaction<'_>, page: u64, len: u32) -> Result<Vec<u8>> {
    let buf = txn.read_pages(page, chunk_run_pages(len, txn.page_size()) as u32)?;
    let header = PageHeader::from_bytes(&buf)?;
    ensure!(
        header.kind() == PageKind::StreamChunk && header.overflow_size() == len,
        StorageError::Corruption(format!("page {} is not the expected stream chunk", page))
    );
    Ok(buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len as usize].to_vec())
}

/// Free a stream's chunk runs and index pages. Returns the number of chunk
/// pages released.
pub(crate) fn free_stream_pages(
    txn: &mut LowLevelTransaction<'_>,
    index: &FixedTreeState,
    index_data: &[u8],
) -> Result<u64> {
    let fst = FixedSizeTree::from_parts(*index, index_data.to_vec());
    let entries = fst.entries(txn)?;
    let index_pages = fst.pages(txn)?;

    let mut freed = 0;
    for (_, value) in entries {
        let (page, len) = decode_chunk_entry(&value)?;
        let pages = chunk_run_pages(len, txn.page_size());
        txn.free_run(page, pages as u32)?;
        freed += pages;
    }
    for page in index_pages {
        txn.free_page(page)?;
    }
    Ok(freed)
}

impl Tree {
    /// Write `data` as a stream under `key`, replacing whatever the key
    /// held. The version starts at 1 and bumps on every rewrite.
    pub fn stream_write(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        key: &[u8],
        data: &[u8],
        tag: Option<&[u8]>,
    ) -> Result<()> {
        self.check_key(txn, key)?;
        let tag = tag.unwrap_or(b"");
        ensure!(
            tag.len() <= Self::max_key(txn.page_size()),
            StorageError::InvalidArgument(format!(
                "stream tag of {} bytes is over the {}-byte limit",
                tag.len(),
                Self::max_key(txn.page_size())
            ))
        );

        self.stream_write_inner(txn, key, data, tag, None)
    }

    /// Like [`Tree::stream_write`], but the write only goes through when the
    /// stream's current version equals `expected` (0 for "must not exist
    /// yet"). A mismatch fails with [`StorageError::Concurrency`] and leaves
    /// the stream untouched, letting callers race rewrites safely across
    /// transactions.
    pub fn stream_write_expecting(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        key: &[u8],
        data: &[u8],
        tag: Option<&[u8]>,
        expected: u64,
    ) -> Result<()> {
        self.check_key(txn, key)?;
        let tag = tag.unwrap_or(b"");
        ensure!(
            tag.len() <= Self::max_key(txn.page_size()),
            StorageError::InvalidArgument(format!(
                "stream tag of {} bytes is over the {}-byte limit",
                tag.len(),
                Self::max_key(txn.page_size())
            ))
        );
        self.stream_write_inner(txn, key, data, tag, Some(expected))
    }

    fn stream_write_inner(
        &mut self,
        txn: &mut LowLevelTransaction<'_>,
        key: &[u8],
        data: &[u8],
        tag: &[u8],
        expected: Option<u64>,
    ) -> Result<()> {
        let current = match self.payload_of(txn, key)? {
            Some(CellPayload::Stream { info, .. }) => info.version,
            _ => 0,
        };
        if let Some(expected) = expected {
            ensure!(
                current == expected,
                StorageError::Concurrency {
                    expected,
                    actual: current,
                }
            );
        }
        let version = current + 1;

        let page_size = txn.page_size();
        let chunk_capacity =
            txn.options().stream_chunk_pages as usize * page_size - PAGE_HEADER_SIZE;
        let mut index = FixedSizeTree::create(CHUNK_ENTRY_SIZE);
        for (ordinal, chunk) in data.chunks(chunk_capacity).enumerate() {
            let pages = chunk_run_pages(chunk.len() as u32, page_size);
            let page = txn.allocate_pages(pages as u32)?;
            let buf = txn.modify_pages(page, pages as u32)?;
            node::init_overflow(buf, PageKind::StreamChunk, page, chunk.len() as u32)?;
            buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
            index.insert(txn, ordinal as u64, &encode_chunk_entry(page, chunk.len() as u32))?;
            self.state_mut().overflow_pages += pages;
        }

        let info = StreamInfo {
            total_size: data.len() as u64,
            version,
            tag_size: tag.len() as u64,
        };
        // set_payload releases the previous stream's pages.
        self.set_payload(
            txn,
            key,
            CellPayload::Stream {
                info,
                index: index.state(),
                index_data: index.embedded_data().to_vec(),
                tag: tag.to_vec(),
            },
        )
    }

    /// Open a reader over the stream at `key`, or `None` when absent.
    pub fn stream_read<'t, 'env>(
        &self,
        txn: &'t LowLevelTransaction<'env>,
        key: &[u8],
    ) -> Result<Option<StreamReader<'t, 'env>>> {
        match self.payload_of(txn, key)? {
            None => Ok(None),
            Some(CellPayload::Stream {
                info,
                index,
                index_data,
                ..
            }) => {
                let fst = FixedSizeTree::from_parts(index, index_data);
                let chunks = fst
                    .entries(txn)?
                    .into_iter()
                    .map(|(_, value)| decode_chunk_entry(&value))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Some(StreamReader {
                    txn,
                    chunks,
                    total_size: info.total_size,
                    next_chunk: 0,
                    current: Vec::new(),
                    at: 0,
                }))
            }
            Some(_) => Err(eyre::Report::new(StorageError::InvalidArgument(format!(
                "key '{}' does not hold a stream",
                String::from_utf8_lossy(key)
            )))),
        }
    }

    /// Size and version metadata of the stream at `key`.
    pub fn stream_info(
        &self,
        txn: &LowLevelTransaction<'_>,
        key: &[u8],
    ) -> Result<Option<StreamInfo>> {
        match self.payload_of(txn, key)? {
            Some(CellPayload::Stream { info, .. }) => Ok(Some(info)),
            _ => Ok(None),
        }
    }

    /// The caller-supplied tag of the stream at `key`, when one was given.
    pub fn stream_tag(&self, txn: &LowLevelTransaction<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.payload_of(txn, key)? {
            Some(CellPayload::Stream { tag, .. }) if !tag.is_empty() => Ok(Some(tag)),
            _ => Ok(None),
        }
    }

    /// Remove the stream at `key` and reclaim its pages. Returns `false`
    /// when the key does not hold a stream.
    pub fn stream_delete(&mut self, txn: &mut LowLevelTransaction<'_>, key: &[u8]) -> Result<bool> {
        match self.payload_of(txn, key)? {
            Some(CellPayload::Stream { .. }) => self.delete(txn, key),
            _ => Ok(false),
        }
    }
}

/// Chunk-at-a-time reader over one stream.
pub struct StreamReader<'t, 'env> {
    txn: &'t LowLevelTransaction<'env>,
    chunks: Vec<(u64, u32)>,
    total_size: u64,
    next_chunk: usize,
    current: Vec<u8>,
    at: usize,
}

impl StreamReader<'_, '_> {
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    fn fill(&mut self) -> Result<bool> {
        while self.at == self.current.len() {
            let Some(&(page, len)) = self.chunks.get(self.next_chunk) else {
                return Ok(false);
            };
            self.next_chunk += 1;
            self.current = read_chunk(self.txn, page, len)?;
            self.at = 0;
        }
        Ok(true)
    }
}

impl Read for StreamReader<'_, '_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        match self.fill() {
            Ok(true) => {}
            Ok(false) => return Ok(0),
            Err(err) => return Err(io::Error::other(err)),
        }
        let take = out.len().min(self.current.len() - self.at);
        out[..take].copy_from_slice(&self.current[self.at..self.at + take]);
        self.at += take;
        Ok(take)
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

    fn read_all(tree: &Tree, txn: &LowLevelTransaction<'_>, key: &[u8]) -> Vec<u8> {
        let mut reader = tree.stream_read(txn, key).unwrap().unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn multi_chunk_round_trip() {
        let env = env();
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"files").unwrap();

        // Several times the chunk capacity, with a pattern that catches
        // chunk-boundary mistakes.
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        tree.stream_write(&mut txn, b"doc", &data, None).unwrap();

        let info = tree.stream_info(&txn, b"doc").unwrap().unwrap();
        assert_eq!(info.total_size, data.len() as u64);
        assert_eq!(info.version, 1);
        assert_eq!(read_all(&tree, &txn, b"doc"), data);
    }

    #[test]
    fn empty_stream() {
        let env = env();
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"files").unwrap();

        tree.stream_write(&mut txn, b"empty", b"", None).unwrap();
        let info = tree.stream_info(&txn, b"empty").unwrap().unwrap();
        assert_eq!(info.total_size, 0);
        assert_eq!(read_all(&tree, &txn, b"empty"), b"");
    }

    #[test]
    fn rewrite_bumps_version_and_frees_old_chunks() {
        let env = env();
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"files").unwrap();

        tree.stream_write(&mut txn, b"doc", &vec![1u8; 100_000], None).unwrap();
        let pages_after_first = tree.state().overflow_pages;
        tree.stream_write(&mut txn, b"doc", &vec![2u8; 100_000], None).unwrap();

        let info = tree.stream_info(&txn, b"doc").unwrap().unwrap();
        assert_eq!(info.version, 2);
        assert_eq!(tree.state().overflow_pages, pages_after_first);
        assert_eq!(read_all(&tree, &txn, b"doc"), vec![2u8; 100_000]);
    }

    #[test]
    fn tags_are_optional() {
        let env = env();
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"files").unwrap();

        tree.stream_write(&mut txn, b"tagged", b"payload", Some(b"etag-1")).unwrap();
        tree.stream_write(&mut txn, b"plain", b"payload", None).unwrap();
        assert_eq!(tree.stream_tag(&txn, b"tagged").unwrap(), Some(b"etag-1".to_vec()));
        assert_eq!(tree.stream_tag(&txn, b"plain").unwrap(), None);
        assert_eq!(tree.stream_tag(&txn, b"missing").unwrap(), None);
    }

    #[test]
    fn delete_reclaims_chunk_and_index_pages() {
        let env = env();
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"files").unwrap();

        // Enough chunks to push the chunk index past its embedded cap.
        let data = vec![9u8; 2_000_000];
        tree.stream_write(&mut txn, b"big", &data, None).unwrap();
        let free_before = txn.free_page_count();

        assert!(tree.stream_delete(&mut txn, b"big").unwrap());
        assert!(txn.free_page_count() > free_before);
        assert_eq!(tree.state().overflow_pages, 0);
        assert!(tree.stream_read(&txn, b"big").unwrap().is_none());
        assert!(!tree.stream_delete(&mut txn, b"big").unwrap());
    }

    #[test]
    fn streams_survive_commits() {
        let env = env();
        let data: Vec<u8> = (0..90_000u32).map(|i| (i % 251) as u8).collect();
        {
            let mut txn = env.write_txn().unwrap();
            let mut tree = Tree::create(&mut txn, b"files").unwrap();
            tree.stream_write(&mut txn, b"doc", &data, Some(b"v1")).unwrap();
            txn.commit().unwrap();
        }

        let txn = env.read_txn().unwrap();
        let tree = Tree::open(&txn, b"files").unwrap().unwrap();
        assert_eq!(read_all(&tree, &txn, b"doc"), data);
        assert_eq!(tree.stream_tag(&txn, b"doc").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn guarded_write_fails_on_version_mismatch() {
        let env = env();
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"files").unwrap();

        tree.stream_write_expecting(&mut txn, b"doc", b"first", None, 0)
            .unwrap();
        tree.stream_write_expecting(&mut txn, b"doc", b"second", None, 1)
            .unwrap();

        // A stale writer expecting version 1 loses, and the stream keeps
        // what the winner wrote.
        let err = tree
            .stream_write_expecting(&mut txn, b"doc", b"stale", None, 1)
            .unwrap_err();
        match err.downcast_ref::<StorageError>() {
            Some(StorageError::Concurrency { expected: 1, actual: 2 }) => {}
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(read_all(&tree, &txn, b"doc"), b"second");
        assert_eq!(tree.stream_info(&txn, b"doc").unwrap().unwrap().version, 2);
    }

    #[test]
    fn plain_reads_refuse_stream_keys() {
        let env = env();
        let mut txn = env.write_txn().unwrap();
        let mut tree = Tree::create(&mut txn, b"files").unwrap();
        tree.stream_write(&mut txn, b"doc", b"data", None).unwrap();
        assert!(tree.get(&txn, b"doc").is_err());
    }
}
