//! # PageVault - Page-Oriented MVCC Storage Engine
//!
//! PageVault is an embedded storage engine built around memory-mapped
//! files, snapshot-isolated transactions and an append-only journal. One
//! writer and any number of readers run concurrently; readers pin the
//! committed state they started on and never block.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pagevault::{StorageEnvironment, StorageOptions, Tree};
//!
//! let env = StorageEnvironment::open(StorageOptions::on_disk("./vault"))?;
//!
//! let mut txn = env.write_txn()?;
//! let mut tree = Tree::open_or_create(&mut txn, b"settings")?;
//! tree.insert(&mut txn, b"theme", b"dark")?;
//! txn.commit()?;
//!
//! let txn = env.read_txn()?;
//! let tree = Tree::open(&txn, b"settings")?.unwrap();
//! assert_eq!(tree.get(&txn, b"theme")?, Some(b"dark".to_vec()));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   Trees (variable, fixed, multi, stream) │
//! ├──────────────────────────────────────────┤
//! │   Low-level transactions (MVCC)          │
//! ├──────────────────┬───────────────────────┤
//! │  Scratch buffers │  Append-only journal  │
//! ├──────────────────┴───────────────────────┤
//! │   Pager (memory-mapped data file)        │
//! └──────────────────────────────────────────┘
//! ```
//!
//! A commit stages its dirty pages in scratch buffers and appends one
//! journal record; it is durable as soon as the journal syncs. A
//! background flusher applies committed pages to the data file once no
//! open reader can still need the previous versions, then recycles the
//! journals it made obsolete. Crash recovery replays the journals in
//! order, tolerating a torn tail on the newest file.
//!
//! ## File Layout
//!
//! ```text
//! vault_dir/
//! ├── data                     # Pages, header on page 0
//! ├── journal.00000001         # Append-only commit log
//! ├── recyclable-journal.000…  # Applied journals awaiting reuse
//! └── temp/
//!     └── scratch.0000.buffers # Uncommitted / unapplied page versions
//! ```

pub mod config;
pub mod env;
pub mod errors;
pub mod journal;
pub mod report;
pub mod scratch;
pub mod storage;
pub mod tree;
pub mod txn;

pub use config::StorageOptions;
pub use env::StorageEnvironment;
pub use errors::StorageError;
pub use report::{DetailedStorageReport, StorageReport};
pub use tree::{
    FixedSizeTree, MultiValueIterator, NewPageAllocator, StreamInfo, StreamReader, Tree,
    TreeIterator,
};
pub use txn::{LowLevelTransaction, TxnId, TxnOutcome};
