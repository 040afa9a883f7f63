//! # Storage Layer
//!
//! The lowest layer of the engine: raw page storage behind the [`Pager`],
//! immutable [`PagerState`] allocation generations, and the shared page
//! header layout every structured page builds on.
//!
//! Higher layers never touch the backing store directly. Write transactions
//! stage modified pages in scratch buffers ([`crate::scratch`]), the journal
//! ([`crate::journal`]) makes commits durable, and only the background
//! applicator and startup recovery write through the pager into the data
//! file.

mod header;
mod page;
mod pager;

pub use header::{FileHeader, FILE_FORMAT_VERSION, FILE_HEADER_MAGIC, HEADER_FREE_LIST_CAP};
pub use page::{pages_for, validate_page, PageHeader, PageKind, PAGE_HEADER_SIZE};
pub use pager::{Pager, PagerState};

pub(crate) use pager::Backing;
