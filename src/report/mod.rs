//! # Storage Reports
//!
//! Point-in-time accounting of where the space went: the data file, every
//! journal, the scratch buffers and, in the detailed variant, each tree
//! with its page breakdown and fill density. Reports run on a read
//! transaction, so they see one consistent committed state and never block
//! the writer.
//!
//! Everything here serializes with serde, so a report can go straight to a
//! monitoring endpoint.

use eyre::Result;
use serde::Serialize;
use zerocopy::FromBytes;

use crate::env::StorageEnvironment;
use crate::scratch::ScratchBufferPoolInfo;
use crate::storage::{pages_for, PageHeader, PageKind, PAGE_HEADER_SIZE};
use crate::tree::allocator::NewPageAllocator;
use crate::tree::fixed::FixedSizeTree;
use crate::tree::node::Node;
use crate::tree::{CellPayload, Tree, TreeStateHeader, ROOT_TREE_NAME};
use crate::txn::LowLevelTransaction;

/// Density reported when detail collection was skipped.
pub const DENSITY_UNKNOWN: f64 = -1.0;

#[derive(Debug, Clone, Serialize)]
pub struct StorageReport {
    pub data_file: DataFileReport,
    pub journals: JournalsReport,
    pub temp_buffers: ScratchBufferPoolInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataFileReport {
    pub allocated_space_in_bytes: u64,
    pub space_in_use_in_bytes: u64,
    pub free_space_in_bytes: u64,
    pub used_percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalsReport {
    pub files: Vec<JournalFileReport>,
    pub last_flushed_transaction: u64,
    pub last_flushed_journal: u64,
    pub total_written_but_unsynced_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalFileReport {
    pub number: u64,
    /// Every transaction in this file is already in the synced data file;
    /// the file is only awaiting recycling.
    pub flushed: bool,
    pub allocated_space_in_bytes: u64,
    pub used_space_in_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailedStorageReport {
    pub data_file: DataFileReport,
    pub journals: JournalsReport,
    pub temp_buffers: ScratchBufferPoolInfo,
    pub trees: Vec<TreeReport>,
    /// Passed through from the table layer; this module only aggregates.
    pub tables: Vec<TableReport>,
    pub pre_allocated_buffers: PreAllocatedBuffersReport,
}

/// Accounting for one table, built by the table layer on top of this
/// engine and handed in as-is.
#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub name: String,
    pub allocated_space_in_bytes: u64,
    pub used_space_in_bytes: u64,
    pub number_of_entries: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreAllocatedBuffersReport {
    /// Pages sitting ready in the preallocation pool.
    pub preallocated_pages: u64,
    /// Pages the pool's own tracking tree occupies.
    pub allocation_tree_pages: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeReport {
    pub name: String,
    pub record_count: u64,
    pub depth: u32,
    pub page_count: u64,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    /// Fraction of the tree's pages actually holding data, or
    /// [`DENSITY_UNKNOWN`] when details were skipped.
    pub density: f64,
    /// Leaves per depth level, index 0 = depth 1. Empty when details were
    /// skipped.
    pub balance_histogram: Vec<u64>,
    pub multi_value_entries: u64,
    pub streams: Option<StreamsReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamsReport {
    /// Zero for the skipped-details placeholder.
    pub number_of_streams: u64,
    /// Exact when details were walked; otherwise the back-computed
    /// approximation, which can go negative when page accounting drifts.
    pub total_size_in_bytes: i64,
}

/// Space usage of the data file, journals and scratch buffers.
pub fn generate_report(env: &StorageEnvironment) -> Result<StorageReport> {
    let txn = env.read_txn()?;
    Ok(StorageReport {
        data_file: data_file_report(env, &txn),
        journals: journal_reports(env),
        temp_buffers: env.scratch.info(),
    })
}

/// Everything in [`generate_report`] plus per-tree accounting. With
/// `include_details` the trees are walked page by page for exact
/// densities; without it only the cheap counters from each tree state are
/// reported.
pub fn generate_detailed_report(
    env: &StorageEnvironment,
    include_details: bool,
    tables: Vec<TableReport>,
) -> Result<DetailedStorageReport> {
    let txn = env.read_txn()?;
    let mut trees = Vec::new();

    let root = Tree::root_objects(&txn);
    trees.push(tree_report(&txn, ROOT_TREE_NAME, root.state(), include_details)?);
    for entry in root.iter(&txn)? {
        let (name, payload) = entry?;
        if name.starts_with(b"$") {
            continue;
        }
        let CellPayload::Inline(blob) = payload else {
            continue;
        };
        let Ok(state) = TreeStateHeader::read_from_bytes(&blob) else {
            continue;
        };
        trees.push(tree_report(&txn, &name, state, include_details)?);
    }

    let allocator = NewPageAllocator::open(&txn)?;
    let pre_allocated_buffers = PreAllocatedBuffersReport {
        preallocated_pages: allocator.preallocated_count(),
        allocation_tree_pages: allocator.allocation_tree_pages(&txn)?,
    };

    let data_file = data_file_report(env, &txn);
    if !include_details {
        attach_stream_placeholder(&txn, &data_file, &tables, &pre_allocated_buffers, &mut trees);
    }

    Ok(DetailedStorageReport {
        data_file,
        journals: journal_reports(env),
        temp_buffers: env.scratch.info(),
        trees,
        tables,
        pre_allocated_buffers,
    })
}

/// The fast path skips walking streams; the space they occupy is instead
/// back-computed from the aggregates and attributed to one placeholder on
/// the last tree. An approximation by design, not an exact figure.
fn attach_stream_placeholder(
    txn: &LowLevelTransaction<'_>,
    data_file: &DataFileReport,
    tables: &[TableReport],
    pre_allocated: &PreAllocatedBuffersReport,
    trees: &mut [TreeReport],
) {
    let page_size = txn.page_size() as i64;
    let trees_allocated: i64 = trees
        .iter()
        .map(|tree| tree.page_count as i64 * page_size)
        .sum();
    let tables_allocated: i64 = tables
        .iter()
        .map(|table| table.allocated_space_in_bytes as i64)
        .sum();
    let pre_allocated_bytes =
        (pre_allocated.preallocated_pages + pre_allocated.allocation_tree_pages) as i64 * page_size;
    let approximate = data_file.space_in_use_in_bytes as i64
        - tables_allocated
        - pre_allocated_bytes
        - trees_allocated;
    let Some(last) = trees.last_mut() else {
        return;
    };
    last.streams = Some(StreamsReport {
        number_of_streams: 0,
        total_size_in_bytes: approximate,
    });
}

fn data_file_report(env: &StorageEnvironment, txn: &LowLevelTransaction<'_>) -> DataFileReport {
    let page_size = txn.page_size() as u64;
    let allocated = env.pager.state().allocated;
    let used_pages = txn.next_page_number() - txn.free_page_count();
    let in_use = used_pages * page_size;
    let free = allocated.saturating_sub(in_use);
    DataFileReport {
        allocated_space_in_bytes: allocated,
        space_in_use_in_bytes: in_use,
        free_space_in_bytes: free,
        used_percentage: if allocated == 0 {
            0.0
        } else {
            in_use as f64 / allocated as f64
        },
    }
}

fn journal_reports(env: &StorageEnvironment) -> JournalsReport {
    let journal = env.journal.lock();
    let block = crate::config::JOURNAL_BLOCK_SIZE as u64;
    let mut files: Vec<JournalFileReport> = journal
        .sealed
        .iter()
        .map(|file| JournalFileReport {
            number: file.number(),
            flushed: file
                .last_txn_id()
                .is_some_and(|last| last <= journal.last_flushed_txn),
            allocated_space_in_bytes: file.capacity_blocks() * block,
            used_space_in_bytes: file.written_blocks() * block,
        })
        .collect();
    files.push(JournalFileReport {
        number: journal.current.number(),
        flushed: false,
        allocated_space_in_bytes: journal.current.capacity_blocks() * block,
        used_space_in_bytes: journal.current.written_blocks() * block,
    });
    files.sort_by_key(|report| report.number);
    JournalsReport {
        files,
        last_flushed_transaction: journal.last_flushed_txn,
        last_flushed_journal: journal.last_flushed_journal,
        total_written_but_unsynced_bytes: journal.unsynced_blocks * block,
    }
}

fn tree_report(
    txn: &LowLevelTransaction<'_>,
    name: &[u8],
    state: TreeStateHeader,
    include_details: bool,
) -> Result<TreeReport> {
    let mut density = DENSITY_UNKNOWN;
    let mut balance_histogram = Vec::new();
    let mut multi_value_entries = 0;
    let mut streams = None;

    if include_details {
        let mut usage = PageUsage::default();
        let mut stream_count = 0u64;
        let mut stream_bytes = 0u64;
        walk_tree(txn, &state, &mut usage, &mut balance_histogram, &mut |payload| {
            match payload {
                CellPayload::MultiEmbedded(blob) if blob.len() >= 2 => {
                    multi_value_entries += u16::from_le_bytes([blob[0], blob[1]]) as u64;
                }
                CellPayload::MultiTree(nested) => multi_value_entries += nested.record_count,
                CellPayload::Stream { info, .. } => {
                    stream_count += 1;
                    stream_bytes += info.total_size;
                }
                _ => {}
            }
        })?;
        density = usage.density();
        if stream_count > 0 {
            streams = Some(StreamsReport {
                number_of_streams: stream_count,
                total_size_in_bytes: stream_bytes as i64,
            });
        }
    }

    Ok(TreeReport {
        name: String::from_utf8_lossy(name).into_owned(),
        record_count: state.record_count,
        depth: state.depth,
        page_count: state.page_count(),
        branch_pages: state.branch_pages,
        leaf_pages: state.leaf_pages,
        overflow_pages: state.overflow_pages,
        density,
        balance_histogram,
        multi_value_entries,
        streams,
    })
}

#[derive(Default)]
struct PageUsage {
    used_bytes: u64,
    total_bytes: u64,
}

impl PageUsage {
    fn add(&mut self, used: u64, total: u64) {
        self.used_bytes += used;
        self.total_bytes += total;
    }

    fn density(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// Walk every page a tree owns, tallying fill, leaves per depth, and
/// handing each leaf cell's payload to `on_payload`. Recurses into nested
/// multi-value trees and stream indexes.
fn walk_tree(
    txn: &LowLevelTransaction<'_>,
    state: &TreeStateHeader,
    usage: &mut PageUsage,
    leaf_depths: &mut Vec<u64>,
    on_payload: &mut dyn FnMut(&CellPayload),
) -> Result<()> {
    let page_size = txn.page_size();
    let mut stack = vec![(state.root_page, 1usize)];
    while let Some((page, depth)) = stack.pop() {
        let buf = txn.read_page(page)?;
        let node = Node::new(&buf)?;
        usage.add(node.used_size() as u64, page_size as u64);
        if !node.is_leaf() {
            for idx in 0..node.cell_count() {
                stack.push((node.child(idx)?, depth + 1));
            }
            continue;
        }
        if leaf_depths.len() < depth {
            leaf_depths.resize(depth, 0);
        }
        leaf_depths[depth - 1] += 1;
        for idx in 0..node.cell_count() {
            let payload = node.payload(idx)?;
            match &payload {
                CellPayload::Overflow { size, .. } => {
                    overflow_usage(txn, *size, usage);
                }
                CellPayload::MultiTree(nested) => {
                    // Nested-tree pages count toward density, not toward
                    // the owner's leaf histogram.
                    walk_tree(txn, nested, usage, &mut Vec::new(), &mut |_| {})?;
                }
                CellPayload::Stream {
                    index, index_data, ..
                } => {
                    let fst = FixedSizeTree::from_parts(*index, index_data.clone());
                    for (_, value) in fst.entries(txn)? {
                        let len = u32::from_le_bytes(value[8..12].try_into()?);
                        overflow_usage(txn, len, usage);
                    }
                    fixed_tree_usage(txn, &fst, usage)?;
                }
                _ => {}
            }
            on_payload(&payload);
        }
    }
    Ok(())
}

fn overflow_usage(txn: &LowLevelTransaction<'_>, size: u32, usage: &mut PageUsage) {
    let page_size = txn.page_size();
    let run = pages_for((size as usize + PAGE_HEADER_SIZE) as u64, page_size);
    usage.add(
        size as u64 + PAGE_HEADER_SIZE as u64,
        run * page_size as u64,
    );
}

fn fixed_tree_usage(
    txn: &LowLevelTransaction<'_>,
    fst: &FixedSizeTree,
    usage: &mut PageUsage,
) -> Result<()> {
    let page_size = txn.page_size() as u64;
    for page in fst.pages(txn)? {
        let buf = txn.read_page(page)?;
        let header = PageHeader::from_bytes(&buf)?;
        let entry = match header.kind() {
            PageKind::FixedLeaf => 8 + fst.value_size() as u64,
            _ => 16,
        };
        let used = PAGE_HEADER_SIZE as u64 + header.cell_count() as u64 * entry;
        usage.add(used, page_size);
    }
    Ok(())
}

impl StorageEnvironment {
    /// See [`generate_report`].
    pub fn report(&self) -> Result<StorageReport> {
        generate_report(self)
    }

    /// See [`generate_detailed_report`].
    pub fn detailed_report(&self, include_details: bool) -> Result<DetailedStorageReport> {
        generate_detailed_report(self, include_details, Vec::new())
    }

    /// [`Self::detailed_report`] with table accounting supplied by the
    /// table layer folded in.
    pub fn detailed_report_with_tables(
        &self,
        include_details: bool,
        tables: Vec<TableReport>,
    ) -> Result<DetailedStorageReport> {
        generate_detailed_report(self, include_details, tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;

    fn env() -> StorageEnvironment {
        StorageEnvironment::open(StorageOptions::in_memory()).unwrap()
    }

    #[test]
    fn empty_environment_report() {
        let env = env();
        let report = env.report().unwrap();
        assert!(report.data_file.allocated_space_in_bytes > 0);
        assert!(report.data_file.space_in_use_in_bytes > 0);
        assert_eq!(
            report.data_file.space_in_use_in_bytes + report.data_file.free_space_in_bytes,
            report.data_file.allocated_space_in_bytes
        );
        assert_eq!(report.journals.files.len(), 1);
        assert!(!report.journals.files[0].flushed);
        assert_eq!(report.journals.last_flushed_transaction, 0);
        assert_eq!(report.journals.total_written_but_unsynced_bytes, 0);
        assert_eq!(report.temp_buffers.pages_awaiting_reclamation, 0);
    }

    #[test]
    fn detailed_report_lists_trees() {
        let env = env();
        {
            let mut txn = env.write_txn().unwrap();
            let mut tree = Tree::create(&mut txn, b"orders").unwrap();
            for i in 0..500u32 {
                let key = format!("order-{:05}", i);
                tree.insert(&mut txn, key.as_bytes(), &vec![7u8; 100]).unwrap();
            }
            tree.multi_add(&mut txn, b"tags", b"red").unwrap();
            tree.multi_add(&mut txn, b"tags", b"blue").unwrap();
            tree.stream_write(&mut txn, b"manifest", &vec![1u8; 60_000], None)
                .unwrap();
            txn.commit().unwrap();
        }

        let report = env.detailed_report(true).unwrap();
        let orders = report
            .trees
            .iter()
            .find(|t| t.name == "orders")
            .expect("orders tree in report");
        assert_eq!(orders.record_count, 503);
        assert!(orders.page_count >= orders.leaf_pages);
        assert!(orders.density > 0.0 && orders.density <= 1.0);
        assert_eq!(orders.multi_value_entries, 2);
        let leaves: u64 = orders.balance_histogram.iter().sum();
        assert_eq!(leaves, orders.leaf_pages);
        let streams = orders.streams.as_ref().expect("stream accounting");
        assert_eq!(streams.number_of_streams, 1);
        assert_eq!(streams.total_size_in_bytes, 60_000);

        assert!(report.trees.iter().any(|t| t.name == "$root-objects"));
    }

    #[test]
    fn multi_value_counts_span_both_representations() {
        let env = env();
        {
            let mut txn = env.write_txn().unwrap();
            let mut tree = Tree::create(&mut txn, b"index").unwrap();
            tree.multi_add(&mut txn, b"small", b"one").unwrap();
            tree.multi_add(&mut txn, b"small", b"two").unwrap();
            // Enough bulk under one key to push it out of the embedded
            // blob and into a nested tree.
            for i in 0..98u32 {
                let value = format!("value-{:04}-{}", i, "x".repeat(40));
                tree.multi_add(&mut txn, b"large", value.as_bytes()).unwrap();
            }
            txn.commit().unwrap();
        }

        let report = env.detailed_report(true).unwrap();
        let index = report
            .trees
            .iter()
            .find(|t| t.name == "index")
            .expect("index tree in report");
        assert_eq!(index.multi_value_entries, 100);
    }

    #[test]
    fn skipping_details_reports_unknown_density() {
        let env = env();
        {
            let mut txn = env.write_txn().unwrap();
            let mut tree = Tree::create(&mut txn, b"t").unwrap();
            tree.insert(&mut txn, b"k", b"v").unwrap();
            txn.commit().unwrap();
        }

        let report = env.detailed_report(false).unwrap();
        let tree = report.trees.iter().find(|t| t.name == "t").unwrap();
        assert_eq!(tree.density, DENSITY_UNKNOWN);
        assert!(tree.balance_histogram.is_empty());

        // The skipped stream space lands on one placeholder, on the last
        // tree in the report.
        let last = report.trees.last().unwrap();
        let placeholder = last.streams.as_ref().expect("skipped-details placeholder");
        assert_eq!(placeholder.number_of_streams, 0);
    }

    #[test]
    fn table_reports_pass_through_and_shrink_the_placeholder() {
        let env = env();
        {
            let mut txn = env.write_txn().unwrap();
            let mut tree = Tree::create(&mut txn, b"t").unwrap();
            tree.insert(&mut txn, b"k", b"v").unwrap();
            txn.commit().unwrap();
        }

        let table = TableReport {
            name: "documents".into(),
            allocated_space_in_bytes: 4096,
            used_space_in_bytes: 2048,
            number_of_entries: 17,
        };

        let without = env.detailed_report(false).unwrap();
        let with = env
            .detailed_report_with_tables(false, vec![table])
            .unwrap();
        assert_eq!(with.tables.len(), 1);
        assert_eq!(with.tables[0].name, "documents");

        let size = |report: &DetailedStorageReport| {
            report
                .trees
                .last()
                .and_then(|t| t.streams.as_ref())
                .map(|s| s.total_size_in_bytes)
                .unwrap()
        };
        assert_eq!(size(&with), size(&without) - 4096);
    }

    #[test]
    fn reports_serialize_to_json() {
        let env = env();
        let report = env.detailed_report(true).unwrap();
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("data_file"));
        assert!(json.contains("temp_buffers"));
    }
}
