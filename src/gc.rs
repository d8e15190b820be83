//! Free-list (GC) subtree: the reserved DBI that records pages freed by
//! past transactions and hands them back out to future allocations once no
//! reader can still see them.
//!
//! Keys are `{txnid: u64 BE, chunk: u64 BE}` (16 bytes) so entries for the
//! same freeing transaction sort together and the whole tree is ordered by
//! txnid ascending; values are a flat run of little-endian `u64` page-ids.
//! Splitting a long free list across multiple chunk entries, rather than
//! letting one oversized value spill to an OVERFLOW chain, keeps GC
//! bookkeeping off the overflow path entirely.

use crate::btree::{self, delete, insert, search, PageSource, Tree};
use crate::error::Result;
use crate::flags::put as putflags;
use crate::page::node;

fn chunk_capacity(page_size: usize) -> usize {
    (btree::max_inline_value(page_size) / 8).max(1)
}

fn encode_pgnos(pgnos: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pgnos.len() * 8);
    for p in pgnos {
        out.extend_from_slice(&p.to_le_bytes());
    }
    out
}

fn decode_pgnos(buf: &[u8]) -> Vec<u64> {
    buf.chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap())).collect()
}

/// Per-write-transaction GC bookkeeping: the gcDBI tree handle, this
/// transaction's own freed-but-not-yet-recorded pages (the loanback pool),
/// and pages freed via ordinary `delete`/overwrite during the transaction.
pub struct GcState {
    tree: Tree,
    loanback: Vec<u64>,
    freed_this_txn: Vec<u64>,
}

impl GcState {
    pub fn new(tree: Tree) -> Self {
        Self {
            tree,
            loanback: Vec::new(),
            freed_this_txn: Vec::new(),
        }
    }

    pub fn tree(&self) -> Tree {
        self.tree
    }

    /// Record a page as no longer referenced by the transaction's working
    /// tree. Not yet durable or reusable by other transactions until
    /// [`Self::record`] runs at commit.
    pub fn free(&mut self, pgno: u64) {
        self.freed_this_txn.push(pgno);
    }

    /// Hand out `n` page-ids: first from the loanback pool (pages this same
    /// transaction already freed), then from eligible gcDBI entries (keyed
    /// under a txnid older than every active reader), then by growing
    /// `last_pgno`.
    pub fn allocate(&mut self, src: &mut dyn PageSource, oldest_reader: u64, n: usize, last_pgno: &mut u64) -> Result<Vec<u64>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if let Some(p) = self.loanback.pop() {
                out.push(p);
                continue;
            }
            match self.take_one_from_gc(src, oldest_reader)? {
                Some(p) => out.push(p),
                None => break,
            }
        }
        while out.len() < n {
            *last_pgno += 1;
            out.push(*last_pgno);
        }
        Ok(out)
    }

    fn take_one_from_gc(&mut self, src: &mut dyn PageSource, oldest_reader: u64) -> Result<Option<u64>> {
        let Some(root) = self.tree.root else {
            return Ok(None);
        };
        let leaf = search::leftmost_leaf(src, root);
        let page = src.read(leaf);
        if node::node_count(page) == 0 {
            return Ok(None);
        }
        let view = node::read_node(page, 0);
        let txnid = u64::from_be_bytes(view.key[..8].try_into().unwrap());
        if txnid >= oldest_reader {
            return Ok(None);
        }
        let key = view.key.to_vec();
        let mut pgnos = decode_pgnos(view.data);
        let popped = pgnos.pop();
        if pgnos.is_empty() {
            delete::delete(src, &mut self.tree, &key)?;
        } else {
            let data = encode_pgnos(&pgnos);
            insert::put_kv(src, &mut self.tree, &key, &data, 0, putflags::UPSERT)?;
        }
        if let Some(pgno) = popped {
            log::trace!("gc: reclaimed page {pgno} freed by txn {txnid} (oldest reader {oldest_reader})");
        }
        Ok(popped)
    }

    /// Write this transaction's freed pages into gcDBI under its own
    /// txnid. Moves them into the loanback pool first: any pages the
    /// gcDBI's own B+tree mutations need to allocate (leaf splits) are
    /// drawn from this same batch before touching anything older, which is
    /// what breaks the allocate-while-recording-frees recursion.
    pub fn record(&mut self, src: &mut dyn PageSource, txnid: u64) -> Result<()> {
        let freed = std::mem::take(&mut self.freed_this_txn);
        if freed.is_empty() {
            return Ok(());
        }
        self.loanback.extend(freed.iter().copied());

        let capacity = chunk_capacity(src.page_size());
        for (i, chunk) in freed.chunks(capacity).enumerate() {
            let mut key = [0u8; 16];
            key[..8].copy_from_slice(&txnid.to_be_bytes());
            key[8..].copy_from_slice(&(i as u64).to_be_bytes());
            let data = encode_pgnos(chunk);
            insert::put_kv(src, &mut self.tree, &key, &data, 0, putflags::UPSERT)?;
        }
        Ok(())
    }

    /// Pages left over in the loanback pool once a commit finishes: these
    /// were freed this transaction but never reused, and are genuinely
    /// free as of the transaction's own txnid (already recorded via
    /// `record`, so simply dropping the bookkeeping here is correct).
    pub fn finish(&mut self) {
        self.loanback.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let pgnos = vec![4u64, 9, 100, 65536];
        let buf = encode_pgnos(&pgnos);
        assert_eq!(decode_pgnos(&buf), pgnos);
    }

    #[test]
    fn chunk_capacity_is_at_least_one() {
        assert!(chunk_capacity(512) >= 1);
    }
}
