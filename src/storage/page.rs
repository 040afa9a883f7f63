//! # Page Header Layout
//!
//! Every page starts with a fixed 32-byte header. The header is declared as a
//! `zerocopy` struct so it can be read in place from a page buffer without
//! copying or hand-rolled offset arithmetic.
//!
//! ## Header Layout (32 bytes)
//!
//! ```text
//! Offset  Size  Field          Description
//! ------  ----  -------------  ------------------------------------------
//! 0       1     page_kind      Branch / Leaf / Overflow / FixedBranch /
//!                              FixedLeaf / StreamChunk
//! 1       1     flags          Page flags (reserved)
//! 2       2     cell_count     Number of cells / fixed entries
//! 4       2     free_start     Offset where free space begins
//! 6       2     free_end       Offset where free space ends
//! 8       4     overflow_size  Logical byte size of an overflow run
//!                              (first page of the run only)
//! 12      4     value_size     Fixed-size-tree entry value width
//! 16      8     page_number    Own page number (nested pages use a marker)
//! 24      8     right_sibling  Next leaf in key order; unused on branches.
//! ```
//!
//! ## Cell Area
//!
//! Slotted pages (branch/leaf) put a cell pointer array right after the
//! header, growing down, and cell content at the end of the page, growing up:
//!
//! ```text
//! +--------------------+
//! | Header (32 bytes)  |
//! +--------------------+
//! | Cell pointers      |   free_start points past the last pointer
//! +--------------------+
//! | Free space         |
//! +--------------------+
//! | Cell content       |   free_end points at the lowest cell byte
//! +--------------------+
//! ```
//!
//! Overflow runs store their logical size in the first page's header; the run
//! spans `pages_for(overflow_size + PAGE_HEADER_SIZE)` contiguous pages.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const PAGE_HEADER_SIZE: usize = 32;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Unknown = 0x00,
    Branch = 0x01,
    Leaf = 0x02,
    Overflow = 0x03,
    FixedBranch = 0x04,
    FixedLeaf = 0x05,
    StreamChunk = 0x06,
}

impl PageKind {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageKind::Branch,
            0x02 => PageKind::Leaf,
            0x03 => PageKind::Overflow,
            0x04 => PageKind::FixedBranch,
            0x05 => PageKind::FixedLeaf,
            0x06 => PageKind::StreamChunk,
            _ => PageKind::Unknown,
        }
    }

    pub fn is_overflow(self) -> bool {
        matches!(self, PageKind::Overflow | PageKind::StreamChunk)
    }

    pub fn is_fixed(self) -> bool {
        matches!(self, PageKind::FixedBranch | PageKind::FixedLeaf)
    }
}

// Multi-byte fields use the little-endian wrapper types so the struct is
// alignment-1 and can be referenced in place anywhere inside a page
// buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageHeader {
    page_kind: u8,
    flags: u8,
    cell_count: U16,
    free_start: U16,
    free_end: U16,
    overflow_size: U32,
    value_size: U32,
    page_number: U64,
    right_sibling: U64,
}

impl PageHeader {
    pub fn new(kind: PageKind, page_number: u64, page_size: usize) -> Self {
        Self {
            page_kind: kind as u8,
            flags: 0,
            cell_count: U16::ZERO,
            free_start: U16::new(PAGE_HEADER_SIZE as u16),
            free_end: U16::new(page_size as u16),
            overflow_size: U32::ZERO,
            value_size: U32::ZERO,
            page_number: U64::new(page_number),
            right_sibling: U64::ZERO,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        Self::ref_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        Self::mut_from_bytes(&mut data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        data[..size_of::<Self>()].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn kind(&self) -> PageKind {
        PageKind::from_byte(self.page_kind)
    }

    pub fn set_kind(&mut self, kind: PageKind) {
        self.page_kind = kind as u8;
    }

    pub fn cell_count(&self) -> u16 {
        self.cell_count.get()
    }

    pub fn set_cell_count(&mut self, count: u16) {
        self.cell_count.set(count);
    }

    pub fn free_start(&self) -> u16 {
        self.free_start.get()
    }

    pub fn set_free_start(&mut self, offset: u16) {
        self.free_start.set(offset);
    }

    pub fn free_end(&self) -> u16 {
        self.free_end.get()
    }

    pub fn set_free_end(&mut self, offset: u16) {
        self.free_end.set(offset);
    }

    pub fn free_space(&self) -> u16 {
        self.free_end.get().saturating_sub(self.free_start.get())
    }

    pub fn overflow_size(&self) -> u32 {
        self.overflow_size.get()
    }

    pub fn set_overflow_size(&mut self, size: u32) {
        self.overflow_size.set(size);
    }

    pub fn value_size(&self) -> u32 {
        self.value_size.get()
    }

    pub fn set_value_size(&mut self, size: u32) {
        self.value_size.set(size);
    }

    pub fn page_number(&self) -> u64 {
        self.page_number.get()
    }

    pub fn set_page_number(&mut self, page_number: u64) {
        self.page_number.set(page_number);
    }

    pub fn right_sibling(&self) -> u64 {
        self.right_sibling.get()
    }

    pub fn set_right_sibling(&mut self, page: u64) {
        self.right_sibling.set(page);
    }

    /// Bytes in use on a slotted page: header, cell pointer array and cell
    /// content. The basis of the report's page-density numbers.
    pub fn used_size(&self, page_size: usize) -> usize {
        self.free_start.get() as usize + (page_size - self.free_end.get() as usize)
    }
}

/// Number of pages an overflow value of `size` logical bytes occupies.
pub fn pages_for(size: u64, page_size: usize) -> u64 {
    size.div_ceil(page_size as u64)
}

/// Structural sanity check for a page buffer. A fully zeroed page is valid
/// (freshly allocated, never written).
pub fn validate_page(data: &[u8], page_size: usize) -> Result<()> {
    ensure!(
        data.len() == page_size,
        "invalid page size: {} != {}",
        data.len(),
        page_size
    );

    let header = PageHeader::from_bytes(data)?;

    let zeroed = header.page_kind == 0
        && header.cell_count() == 0
        && header.free_start() == 0
        && header.free_end() == 0;
    if zeroed {
        return Ok(());
    }

    ensure!(
        header.kind() != PageKind::Unknown,
        "invalid page kind: {:02x}",
        header.page_kind
    );

    if header.kind().is_overflow() {
        return Ok(());
    }

    ensure!(
        header.free_start() >= PAGE_HEADER_SIZE as u16,
        "free_start {} < PAGE_HEADER_SIZE {}",
        header.free_start(),
        PAGE_HEADER_SIZE
    );
    ensure!(
        header.free_end() as usize <= page_size,
        "free_end {} > page size {}",
        header.free_end(),
        page_size
    );
    ensure!(
        header.free_start() <= header.free_end(),
        "free_start {} > free_end {}",
        header.free_start(),
        header.free_end()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 8192;

    #[test]
    fn header_is_32_bytes() {
        assert_eq!(size_of::<PageHeader>(), PAGE_HEADER_SIZE);
    }

    #[test]
    fn new_header_initializes_free_range() {
        let header = PageHeader::new(PageKind::Leaf, 7, PAGE_SIZE);

        assert_eq!(header.kind(), PageKind::Leaf);
        assert_eq!(header.page_number(), 7);
        assert_eq!(header.cell_count(), 0);
        assert_eq!(header.free_start(), PAGE_HEADER_SIZE as u16);
        assert_eq!(header.free_end(), PAGE_SIZE as u16);
        assert_eq!(header.free_space() as usize, PAGE_SIZE - PAGE_HEADER_SIZE);
    }

    #[test]
    fn kind_round_trip() {
        for kind in [
            PageKind::Branch,
            PageKind::Leaf,
            PageKind::Overflow,
            PageKind::FixedBranch,
            PageKind::FixedLeaf,
            PageKind::StreamChunk,
        ] {
            assert_eq!(PageKind::from_byte(kind as u8), kind);
        }
        assert_eq!(PageKind::from_byte(0xEE), PageKind::Unknown);
    }

    #[test]
    fn mutate_in_place_through_bytes() {
        let mut data = [0u8; PAGE_SIZE];
        {
            let header = PageHeader::from_bytes_mut(&mut data).unwrap();
            header.set_kind(PageKind::Branch);
            header.set_cell_count(12);
            header.set_right_sibling(99);
        }
        let header = PageHeader::from_bytes(&data).unwrap();
        assert_eq!(header.kind(), PageKind::Branch);
        assert_eq!(header.cell_count(), 12);
        assert_eq!(header.right_sibling(), 99);
    }

    #[test]
    fn header_reads_at_any_alignment() {
        // Page buffers carry no alignment guarantee; an odd offset must
        // still give a usable header reference.
        let mut buf = vec![0u8; PAGE_SIZE + 1];
        {
            let header = PageHeader::from_bytes_mut(&mut buf[1..]).unwrap();
            header.set_kind(PageKind::Leaf);
            header.set_page_number(5);
        }
        let header = PageHeader::from_bytes(&buf[1..]).unwrap();
        assert_eq!(header.kind(), PageKind::Leaf);
        assert_eq!(header.page_number(), 5);
    }

    #[test]
    fn pages_for_rounds_up() {
        assert_eq!(pages_for(0, PAGE_SIZE), 0);
        assert_eq!(pages_for(1, PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE as u64, PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE as u64 + 1, PAGE_SIZE), 2);
        assert_eq!(pages_for(3 * PAGE_SIZE as u64, PAGE_SIZE), 3);
    }

    #[test]
    fn validate_accepts_zeroed_page() {
        let data = vec![0u8; PAGE_SIZE];
        validate_page(&data, PAGE_SIZE).unwrap();
    }

    #[test]
    fn validate_rejects_inverted_free_range() {
        let mut data = vec![0u8; PAGE_SIZE];
        {
            let header = PageHeader::from_bytes_mut(&mut data).unwrap();
            header.set_kind(PageKind::Leaf);
            header.set_free_start(4000);
            header.set_free_end(100);
        }
        let err = validate_page(&data, PAGE_SIZE).unwrap_err();
        assert!(err.to_string().contains("free_start"));
    }

    #[test]
    fn used_size_counts_both_ends() {
        let mut header = PageHeader::new(PageKind::Leaf, 1, PAGE_SIZE);
        header.set_free_start(100);
        header.set_free_end(8000);
        assert_eq!(header.used_size(PAGE_SIZE), 100 + (PAGE_SIZE - 8000));
    }
}
