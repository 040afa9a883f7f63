//! # Journal File Format
//!
//! Write-ahead journal files are pre-sized and addressed in 4KB blocks so a
//! record sync never rewrites a block that an earlier committed record
//! already occupies. One journal record holds the complete set of page
//! diffs for a single committed transaction:
//!
//! ```text
//! +----------------+------------------+---------+-----+----------------+---------+
//! | RecordHeader   | PageDiffHeader 0 | run 0   | ... | RecordTrailer  | zeros   |
//! +----------------+------------------+---------+-----+----------------+---------+
//! |<------------------ checksummed ------------------>|                          |
//! |<--------------------- header.blocks * 4096 bytes ------------------------->|
//! ```
//!
//! Each diff is a contiguous run of whole pages destined for
//! `page_number..page_number + pages_in_run` in the data file. The trailer
//! carries a CRC64 (ECMA-182) of everything before it; the record is padded
//! with zeros to the next block boundary.
//!
//! Journals are pre-sized and zero-filled, so a reader can tell the clean
//! end of the log (zeroed magic) apart from a torn or corrupt record
//! (non-zero garbage or a checksum mismatch). The caller decides whether a
//! torn record is a benign crash tail or mid-journal corruption.

use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::JOURNAL_BLOCK_SIZE;
use crate::storage::Backing;
use crate::txn::TxnId;

const JOURNAL_CRC: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

const JOURNAL_RECORD_MAGIC: u64 = u64::from_le_bytes(*b"PVJRNREC");
const JOURNAL_FORMAT_VERSION: u32 = 1;

pub const JOURNAL_FILE_PREFIX: &str = "journal.";
pub const RECYCLABLE_JOURNAL_FILE_PREFIX: &str = "recyclable-journal.";

pub fn journal_file_name(number: u64) -> String {
    format!("{}{:08}", JOURNAL_FILE_PREFIX, number)
}

pub fn recyclable_journal_file_name(number: u64) -> String {
    format!("{}{:08}", RECYCLABLE_JOURNAL_FILE_PREFIX, number)
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RecordHeader {
    magic: u64,
    txn_id: u64,
    version: u32,
    diff_count: u32,
    /// Total record size, header through padding, in 4KB blocks.
    blocks: u32,
    reserved: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct PageDiffHeader {
    page_number: u64,
    pages_in_run: u32,
    reserved: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RecordTrailer {
    checksum: u64,
}

const RECORD_HEADER_SIZE: usize = size_of::<RecordHeader>();
const PAGE_DIFF_HEADER_SIZE: usize = size_of::<PageDiffHeader>();
const RECORD_TRAILER_SIZE: usize = size_of::<RecordTrailer>();

/// One contiguous run of modified pages inside a journal record.
pub struct PageDiff<'a> {
    pub page_number: u64,
    /// Whole pages, length a multiple of the environment page size.
    pub data: &'a [u8],
}

/// A decoded journal record.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalRecord {
    pub txn_id: TxnId,
    pub diffs: Vec<(u64, Vec<u8>)>,
}

/// Outcome of scanning a journal file front to back.
#[derive(Debug)]
pub struct JournalReadResult {
    pub records: Vec<JournalRecord>,
    /// True when the scan stopped on non-zero garbage or a failed checksum
    /// rather than on clean zero padding or the end of the file.
    pub reached_invalid: bool,
}

/// Number of 4KB blocks a record for `diffs` occupies.
pub fn record_blocks(diffs: &[PageDiff<'_>]) -> u64 {
    let mut bytes = RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE;
    for diff in diffs {
        bytes += PAGE_DIFF_HEADER_SIZE + diff.data.len();
    }
    (bytes as u64).div_ceil(JOURNAL_BLOCK_SIZE as u64)
}

fn encode_record(txn_id: TxnId, diffs: &[PageDiff<'_>], page_size: usize) -> Result<Vec<u8>> {
    ensure!(!diffs.is_empty(), "journal record without page diffs");

    let blocks = record_blocks(diffs);
    let mut out = Vec::with_capacity(blocks as usize * JOURNAL_BLOCK_SIZE);
    let header = RecordHeader {
        magic: JOURNAL_RECORD_MAGIC,
        txn_id,
        version: JOURNAL_FORMAT_VERSION,
        diff_count: diffs.len() as u32,
        blocks: blocks as u32,
        reserved: 0,
    };
    out.extend_from_slice(header.as_bytes());

    for diff in diffs {
        ensure!(
            !diff.data.is_empty() && diff.data.len() % page_size == 0,
            "page diff for page {} is not a whole number of pages",
            diff.page_number
        );
        let diff_header = PageDiffHeader {
            page_number: diff.page_number,
            pages_in_run: (diff.data.len() / page_size) as u32,
            reserved: 0,
        };
        out.extend_from_slice(diff_header.as_bytes());
        out.extend_from_slice(diff.data);
    }

    let trailer = RecordTrailer {
        checksum: JOURNAL_CRC.checksum(&out),
    };
    out.extend_from_slice(trailer.as_bytes());
    out.resize(blocks as usize * JOURNAL_BLOCK_SIZE, 0);
    Ok(out)
}

/// A single pre-sized journal file.
pub struct JournalFile {
    number: u64,
    path: Option<PathBuf>,
    backing: Backing,
    capacity_blocks: u64,
    write_block: u64,
    last_txn_id: Option<TxnId>,
}

impl JournalFile {
    /// Create a fresh zero-filled journal of `capacity_blocks` 4KB blocks.
    pub fn create(path: Option<&Path>, number: u64, capacity_blocks: u64) -> Result<Self> {
        let bytes = capacity_blocks * JOURNAL_BLOCK_SIZE as u64;
        let backing = match path {
            Some(path) => Backing::create_file(path, bytes)?,
            None => Backing::memory(bytes),
        };
        Ok(Self {
            number,
            path: path.map(Path::to_path_buf),
            backing,
            capacity_blocks,
            write_block: 0,
            last_txn_id: None,
        })
    }

    /// Open an existing journal for recovery. The write position is left at
    /// the end of the last valid record found by [`JournalFile::read_records`].
    pub fn open(path: &Path, number: u64) -> Result<Self> {
        let backing = Backing::open_file(path)?;
        let capacity_blocks = backing.len() / JOURNAL_BLOCK_SIZE as u64;
        Ok(Self {
            number,
            path: Some(path.to_path_buf()),
            backing,
            capacity_blocks,
            write_block: 0,
            last_txn_id: None,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn capacity_blocks(&self) -> u64 {
        self.capacity_blocks
    }

    pub fn written_blocks(&self) -> u64 {
        self.write_block
    }

    /// Highest transaction id appended to or replayed from this file.
    pub fn last_txn_id(&self) -> Option<TxnId> {
        self.last_txn_id
    }

    pub fn can_fit(&self, diffs: &[PageDiff<'_>]) -> bool {
        self.write_block + record_blocks(diffs) <= self.capacity_blocks
    }

    /// Append one transaction's diffs. The caller must have checked
    /// [`JournalFile::can_fit`] and rolled over to a new file if needed.
    pub fn append(&mut self, txn_id: TxnId, diffs: &[PageDiff<'_>], page_size: usize) -> Result<()> {
        ensure!(
            self.can_fit(diffs),
            "journal {} cannot fit a {}-block record at block {}",
            self.number,
            record_blocks(diffs),
            self.write_block
        );
        let record = encode_record(txn_id, diffs, page_size)?;
        self.backing
            .write_at(self.write_block * JOURNAL_BLOCK_SIZE as u64, &record)?;
        self.write_block += (record.len() / JOURNAL_BLOCK_SIZE) as u64;
        self.last_txn_id = Some(txn_id);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.backing.sync()
    }

    /// Scan the file front to back, decoding every valid record. Stops at
    /// the first invalid position and reports whether that position held
    /// clean zero padding or damaged data.
    pub fn read_records(&mut self, page_size: usize) -> Result<JournalReadResult> {
        let mut records = Vec::new();
        let mut block = 0u64;
        let mut reached_invalid = false;

        while block < self.capacity_blocks {
            let mut header_buf = [0u8; RECORD_HEADER_SIZE];
            self.backing
                .read_into(block * JOURNAL_BLOCK_SIZE as u64, &mut header_buf)?;
            let header = RecordHeader::read_from_bytes(&header_buf)
                .map_err(|_| eyre::eyre!("journal record header is misaligned"))?;

            if header.magic != JOURNAL_RECORD_MAGIC {
                reached_invalid = header_buf.iter().any(|&b| b != 0);
                break;
            }
            if header.version != JOURNAL_FORMAT_VERSION
                || header.diff_count == 0
                || header.blocks == 0
                || block + header.blocks as u64 > self.capacity_blocks
            {
                reached_invalid = true;
                break;
            }

            let mut record_buf = vec![0u8; header.blocks as usize * JOURNAL_BLOCK_SIZE];
            self.backing
                .read_into(block * JOURNAL_BLOCK_SIZE as u64, &mut record_buf)?;

            match decode_record(&record_buf, page_size) {
                Some(record) => {
                    self.last_txn_id = Some(record.txn_id);
                    records.push(record);
                    block += header.blocks as u64;
                }
                None => {
                    reached_invalid = true;
                    break;
                }
            }
        }

        self.write_block = block;
        Ok(JournalReadResult {
            records,
            reached_invalid,
        })
    }
}

/// Decode one record from its full block-padded buffer. Returns `None` on
/// any structural or checksum failure.
fn decode_record(buf: &[u8], page_size: usize) -> Option<JournalRecord> {
    let header = RecordHeader::read_from_bytes(buf.get(..RECORD_HEADER_SIZE)?).ok()?;

    let mut payload_len = RECORD_HEADER_SIZE;
    let mut diffs = Vec::with_capacity(header.diff_count as usize);
    for _ in 0..header.diff_count {
        let diff_header = PageDiffHeader::read_from_bytes(
            buf.get(payload_len..payload_len + PAGE_DIFF_HEADER_SIZE)?,
        )
        .ok()?;
        payload_len += PAGE_DIFF_HEADER_SIZE;
        if diff_header.pages_in_run == 0 {
            return None;
        }
        let run_len = diff_header.pages_in_run as usize * page_size;
        let run = buf.get(payload_len..payload_len + run_len)?;
        payload_len += run_len;
        diffs.push((diff_header.page_number, run.to_vec()));
    }

    let trailer = RecordTrailer::read_from_bytes(
        buf.get(payload_len..payload_len + RECORD_TRAILER_SIZE)?,
    )
    .ok()?;
    if trailer.checksum != JOURNAL_CRC.checksum(&buf[..payload_len]) {
        return None;
    }

    Some(JournalRecord {
        txn_id: header.txn_id,
        diffs,
    })
}
