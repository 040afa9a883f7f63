//! # Data File Header
//!
//! Page 0 of the data file holds the environment header: format
//! identification, the last committed transaction, the allocation high
//! water mark, the root-objects tree state and a bounded free-page list.
//!
//! The header is rewritten as an ordinary dirty page by every committing
//! transaction, so it travels through the journal and the committed page
//! table like any other page and crash recovery restores it for free.

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::tree::TreeStateHeader;
use crate::txn::TxnId;

pub const FILE_HEADER_MAGIC: u64 = u64::from_le_bytes(*b"PVLTHDR1");
pub const FILE_FORMAT_VERSION: u32 = 1;

/// Free pages persisted in the header. Entries past the cap survive only in
/// memory and are dropped on restart.
pub const HEADER_FREE_LIST_CAP: usize = 64;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FileHeader {
    pub magic: u64,
    pub version: u32,
    pub page_size: u32,
    pub last_committed_txn: TxnId,
    /// First page number never yet allocated.
    pub next_page_number: u64,
    pub root_objects: TreeStateHeader,
    pub free_list_len: u32,
    pub reserved: u32,
    pub free_list: [u64; HEADER_FREE_LIST_CAP],
}

pub const FILE_HEADER_SIZE: usize = size_of::<FileHeader>();

impl FileHeader {
    /// Header of a freshly initialized file: page 0 is the header itself,
    /// page 1 the root-objects tree's root leaf.
    pub fn new(page_size: u32) -> Self {
        Self {
            magic: FILE_HEADER_MAGIC,
            version: FILE_FORMAT_VERSION,
            page_size,
            last_committed_txn: 0,
            next_page_number: 2,
            root_objects: TreeStateHeader::empty(1, 0),
            free_list_len: 0,
            reserved: 0,
            free_list: [0; HEADER_FREE_LIST_CAP],
        }
    }

    /// Store as many of `free_pages` as fit. Dropped entries leak file
    /// space across a restart but never correctness.
    pub fn set_free_list(&mut self, free_pages: &[u64]) {
        let n = free_pages.len().min(HEADER_FREE_LIST_CAP);
        if n < free_pages.len() {
            log::warn!(
                "free list of {} pages exceeds the persisted cap, dropping {}",
                free_pages.len(),
                free_pages.len() - n
            );
        }
        self.free_list = [0; HEADER_FREE_LIST_CAP];
        self.free_list[..n].copy_from_slice(&free_pages[..n]);
        self.free_list_len = n as u32;
    }

    pub fn free_pages(&self) -> &[u64] {
        &self.free_list[..self.free_list_len as usize]
    }

    pub fn write_to(&self, page: &mut [u8]) {
        page[..FILE_HEADER_SIZE].copy_from_slice(self.as_bytes());
        page[FILE_HEADER_SIZE..].fill(0);
    }

    pub fn read_from(page: &[u8], expected_page_size: u32) -> Result<Self> {
        ensure!(
            page.len() >= FILE_HEADER_SIZE,
            "page of {} bytes is too small for the file header",
            page.len()
        );
        let header = Self::read_from_bytes(&page[..FILE_HEADER_SIZE])
            .map_err(|_| eyre::eyre!("file header is misaligned"))?;
        ensure!(
            header.magic == FILE_HEADER_MAGIC,
            "not a storage environment file (bad magic {:#018x})",
            header.magic
        );
        ensure!(
            header.version == FILE_FORMAT_VERSION,
            "unsupported file format version {}",
            header.version
        );
        ensure!(
            header.page_size == expected_page_size,
            "file uses {}-byte pages but the environment is configured for {}",
            header.page_size,
            expected_page_size
        );
        ensure!(
            header.free_list_len as usize <= HEADER_FREE_LIST_CAP,
            "file header free list length {} exceeds capacity",
            header.free_list_len
        );
        Ok(header)
    }
}
