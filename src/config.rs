//! # Storage Configuration
//!
//! `StorageOptions` centralizes every tunable the engine consumes. Options
//! that depend on each other are documented together so a change in one is
//! checked against the others.
//!
//! ```text
//! page_size (8192 bytes default)
//!       │
//!       ├─> growth_increment: pager growth granularity, in pages
//!       │
//!       ├─> scratch_file_pages: pages per scratch file; must comfortably
//!       │     exceed the largest single-transaction write set
//!       │
//!       └─> journal_file_4kbs: journal files are pre-sized in 4KB blocks;
//!             one journal record must fit in a single file, so this must be
//!             at least pages_for(page_size) * max dirty pages + headers
//! ```
//!
//! | Option              | Default | Description                               |
//! |---------------------|---------|-------------------------------------------|
//! | page_size           | 8192    | Page size in bytes (power of two, >= 512) |
//! | growth_increment    | 32      | Minimum pager growth, in pages            |
//! | scratch_file_pages  | 256     | Pages per scratch file                    |
//! | journal_file_4kbs   | 512     | 4KB blocks per journal file (2 MB)        |
//! | sync_on_commit      | true    | Sync the journal before reporting commit  |
//! | flush_interval      | 250ms   | Background flush cadence                  |
//! | stream_chunk_pages  | 4       | Max pages per stream chunk                |

use std::path::PathBuf;
use std::time::Duration;

pub const MIN_PAGE_SIZE: usize = 512;
/// Page offsets are stored as u16 in page headers, so pages top out at 32K.
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

/// 4KB journal block, the journal's allocation and accounting unit.
pub const JOURNAL_BLOCK_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub path: Option<PathBuf>,
    pub page_size: usize,
    pub growth_increment: u64,
    pub scratch_file_pages: u64,
    pub journal_file_4kbs: u32,
    pub sync_on_commit: bool,
    pub flush_interval: Duration,
    pub stream_chunk_pages: u32,
}

impl StorageOptions {
    /// Options for an ephemeral, purely in-memory environment. Used by tests
    /// and temporary databases; nothing survives drop.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            page_size: 8192,
            growth_increment: 32,
            scratch_file_pages: 256,
            journal_file_4kbs: 512,
            sync_on_commit: true,
            flush_interval: Duration::from_millis(250),
            stream_chunk_pages: 4,
        }
    }

    /// Options for a durable environment rooted at `path`. The directory is
    /// created on open if missing; data file, journals and scratch files all
    /// live under it.
    pub fn on_disk(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::in_memory()
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_growth_increment(mut self, pages: u64) -> Self {
        self.growth_increment = pages;
        self
    }

    pub fn with_scratch_file_pages(mut self, pages: u64) -> Self {
        self.scratch_file_pages = pages;
        self
    }

    pub fn with_journal_file_4kbs(mut self, blocks: u32) -> Self {
        self.journal_file_4kbs = blocks;
        self
    }

    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.is_none()
    }

    pub fn validate(&self) -> eyre::Result<()> {
        eyre::ensure!(
            self.page_size.is_power_of_two()
                && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size),
            "page size {} must be a power of two between {} and {}",
            self.page_size,
            MIN_PAGE_SIZE,
            MAX_PAGE_SIZE
        );
        eyre::ensure!(self.growth_increment > 0, "growth increment must be > 0");
        eyre::ensure!(
            self.scratch_file_pages >= 16,
            "scratch files must hold at least 16 pages"
        );
        eyre::ensure!(
            self.journal_file_4kbs as usize * JOURNAL_BLOCK_SIZE >= 4 * self.page_size,
            "journal files must hold at least four pages worth of records"
        );
        Ok(())
    }
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        StorageOptions::in_memory().validate().unwrap();
        StorageOptions::on_disk("/tmp/x").validate().unwrap();
    }

    #[test]
    fn rejects_odd_page_size() {
        let opts = StorageOptions::in_memory().with_page_size(5000);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_tiny_journal() {
        let opts = StorageOptions::in_memory()
            .with_page_size(16384)
            .with_journal_file_4kbs(4);
        assert!(opts.validate().is_err());
    }
}
