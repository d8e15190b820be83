//! The COW B+tree engine: search, insert, delete, split, merge, rebalance,
//! compaction, and DUPSORT sub-page/sub-tree promotion.

pub mod delete;
pub mod dupsort;
pub mod insert;
pub mod search;

use crate::error::{Error, Result};
use crate::flags::{dbi as dflags, page as pflags};
use crate::page::{self, header_of, node};

pub use search::{bytewise_cmp, CmpFn};

/// Everything the tree needs from its owning transaction: page reads,
/// COW'd writes, allocation, and freeing. Implemented by [`crate::txn::WriteTxn`].
pub trait PageSource {
    fn page_size(&self) -> usize;
    fn read(&self, pgno: u64) -> &[u8];
    /// Get a mutable buffer for `pgno`, copy-on-writing it into the dirty
    /// arena first if it isn't already dirty this transaction.
    fn write(&mut self, pgno: u64) -> &mut [u8];
    /// Allocate a fresh, zeroed page and return its id.
    fn alloc(&mut self) -> Result<u64>;
    /// Allocate `n` fresh, zeroed pages guaranteed to land at consecutive
    /// page numbers (`pgno, pgno+1, ..., pgno+n-1`). OVERFLOW chains rely on
    /// this adjacency to reconstruct/free themselves by arithmetic alone, so
    /// implementations must not service this from a free list of recycled,
    /// non-adjacent pages — only from a fresh run at the end of the file.
    fn alloc_contiguous(&mut self, n: usize) -> Result<u64>;
    /// Return `pgno` to the transaction's free list.
    fn free(&mut self, pgno: u64);
}

/// Per-DBI tree handle: just the root pointer and the comparator mode.
#[derive(Debug, Clone, Copy)]
pub struct Tree {
    pub root: Option<u64>,
    pub dupsort: bool,
    pub dupfixed: bool,
    pub integerkey: bool,
}

impl Tree {
    pub fn from_flags(root: Option<u64>, flags: u16) -> Self {
        Self {
            root,
            dupsort: flags & dflags::DUPSORT as u16 != 0,
            dupfixed: flags & dflags::DUPFIXED as u16 != 0,
            integerkey: flags & dflags::INTEGERKEY as u16 != 0,
        }
    }

    pub fn cmp(&self) -> CmpFn {
        if self.integerkey {
            search::integer_cmp
        } else {
            search::bytewise_cmp
        }
    }
}

/// The largest key this tree will store inline. Oversize keys are rejected
/// outright (libmdbx never overflows keys).
pub fn max_key_size(page_size: usize) -> usize {
    ((page_size - page::PAGE_HEADER_SIZE) / 2) - node::NODE_HEADER_SIZE - 8
}

/// Largest value stored inline on a leaf before it's spilled to an
/// `OVERFLOW` chain.
pub fn max_inline_value(page_size: usize) -> usize {
    page::max_inline_value_size(page_size)
}

/// Point lookup. Returns the raw node value bytes (resolving `BIGDATA`
/// overflow chains, but *not* unpacking DUPSORT sub-pages/sub-trees — see
/// [`dupsort`] for duplicate-aware reads).
pub fn get<'s>(src: &'s dyn PageSource, tree: &Tree, key: &[u8]) -> Result<node::NodeView<'s>> {
    let Some(root) = tree.root else {
        return Err(Error::NotFound);
    };
    let descent = search::descend(src, root, key, tree.cmp());
    let leaf = src.read(descent.leaf_pgno);
    match search::leaf_search(leaf, key, tree.cmp()) {
        search::LeafSearch::Found(idx) => Ok(node::read_node(src.read(descent.leaf_pgno), idx)),
        search::LeafSearch::NotFound(_) => Err(Error::NotFound),
    }
}

/// Read an overflow-chain value into an owned buffer.
pub fn read_overflow(src: &dyn PageSource, head_pgno: u64, total_len: usize, page_size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(total_len);
    let per_page = page_size - page::PAGE_HEADER_SIZE;
    let first = src.read(head_pgno);
    let run = header_of(first).overflow_pages() as u64;
    for i in 0..run {
        let page = src.read(head_pgno + i);
        let start = page::PAGE_HEADER_SIZE;
        let remaining = total_len - out.len();
        let take = remaining.min(per_page);
        out.extend_from_slice(&page[start..start + take]);
    }
    out
}

/// Store `value` across a freshly allocated contiguous run of OVERFLOW
/// pages; returns the head pgno. `read_overflow`/`free_if_overflow`
/// reconstruct and release the chain by adding `1..run` to the head, so the
/// run must actually be contiguous — see [`PageSource::alloc_contiguous`].
pub fn write_overflow(src: &mut dyn PageSource, value: &[u8]) -> Result<u64> {
    let page_size = src.page_size();
    let per_page = page_size - page::PAGE_HEADER_SIZE;
    let run = (value.len() + per_page - 1) / per_page.max(1);
    let run = run.max(1) as u32;

    let head = src.alloc_contiguous(run as usize)?;
    let mut offset = 0;
    for i in 0..run {
        let pgno = head + i as u64;
        let buf = src.write(pgno);
        page::init_page(buf, pgno, pflags::OVERFLOW);
        header_of_mut_pub(buf).set_overflow_pages(if i == 0 { run } else { 0 });
        let take = (value.len() - offset).min(per_page);
        buf[page::PAGE_HEADER_SIZE..page::PAGE_HEADER_SIZE + take]
            .copy_from_slice(&value[offset..offset + take]);
        offset += take;
    }
    Ok(head)
}

fn header_of_mut_pub(page: &mut [u8]) -> &mut page::PageHeader {
    page::header_of_mut(page)
}

/// `true` if a value needs an OVERFLOW chain to fit this page size.
pub fn needs_overflow(value_len: usize, page_size: usize) -> bool {
    value_len > max_inline_value(page_size)
}
