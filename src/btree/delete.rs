//! Delete path: node removal, overflow-chain release, and rebalance
//! (merge-with-sibling, rotation, or root collapse).

use crate::error::{Error, Result};
use crate::page::{self, header_of, node, page_kind, PageKind};

use super::insert::fix_left_spine;
use super::search::{self, LeafSearch};
use super::{PageSource, Tree};

/// A page below this fraction of its usable capacity is a rebalance
/// candidate.
const UNDERFULL_NUM: usize = 1;
const UNDERFULL_DEN: usize = 4;

pub fn delete(src: &mut dyn PageSource, tree: &mut Tree, key: &[u8]) -> Result<()> {
    let Some(root) = tree.root else {
        return Err(Error::NotFound);
    };
    let cmp = tree.cmp();
    let descent = search::descend(src, root, key, cmp);
    let leaf_pgno = descent.leaf_pgno;
    let idx = match search::leaf_search(src.read(leaf_pgno), key, cmp) {
        LeafSearch::Found(i) => i,
        LeafSearch::NotFound(_) => return Err(Error::NotFound),
    };

    free_if_overflow(src, leaf_pgno, idx);

    {
        let buf = src.write(leaf_pgno);
        node::delete_node(buf, idx);
    }

    if idx == 0 {
        let new_min = {
            let buf = src.read(leaf_pgno);
            (node::node_count(buf) > 0).then(|| node::read_node(buf, 0).key.to_vec())
        };
        if let Some(k) = new_min {
            fix_left_spine(src, &descent.stack, &k);
        }
    }

    rebalance(src, tree, &descent.stack, leaf_pgno)
}

fn free_if_overflow(src: &mut dyn PageSource, leaf_pgno: u64, idx: usize) {
    let (is_bigdata, head) = {
        let view = node::read_node(src.read(leaf_pgno), idx);
        if view.is_bigdata() && view.data.len() >= 8 {
            (true, u64::from_le_bytes(view.data[..8].try_into().unwrap()))
        } else {
            (false, 0)
        }
    };
    if !is_bigdata {
        return;
    }
    let run = header_of(src.read(head)).overflow_pages() as u64;
    for i in 0..run {
        src.free(head + i);
    }
}

fn collect_entries(buf: &[u8]) -> Vec<(Vec<u8>, Vec<u8>, u16)> {
    let n = node::node_count(buf);
    (0..n)
        .map(|i| {
            let v = node::read_node(buf, i);
            (v.key.to_vec(), v.data.to_vec(), v.flags)
        })
        .collect()
}

fn entry_size(key: &[u8], value: &[u8]) -> usize {
    let raw = node::NODE_HEADER_SIZE + key.len() + value.len();
    ((raw + 1) & !1) + 2
}

fn is_underfull(buf: &[u8], page_size: usize) -> bool {
    let used: usize = node::data_len(buf, page_size);
    used * UNDERFULL_DEN < (page_size - page::PAGE_HEADER_SIZE) * UNDERFULL_NUM
}

fn rebalance(src: &mut dyn PageSource, tree: &mut Tree, stack: &[(u64, usize)], pgno: u64) -> Result<()> {
    let page_size = src.page_size();

    if stack.is_empty() {
        let kind = page_kind(src.read(pgno));
        if kind == Some(PageKind::Branch) && node::node_count(src.read(pgno)) == 1 {
            let only_child = node::read_node(src.read(pgno), 0).child_pgno();
            src.free(pgno);
            tree.root = Some(only_child);
        } else if kind != Some(PageKind::Branch) && node::node_count(src.read(pgno)) == 0 {
            src.free(pgno);
            tree.root = None;
        }
        return Ok(());
    }

    if !is_underfull(src.read(pgno), page_size) {
        return Ok(());
    }

    let &(parent_pgno, child_idx) = stack.last().unwrap();
    let parent_stack = &stack[..stack.len() - 1];
    let sibling_count = node::node_count(src.read(parent_pgno));

    if child_idx + 1 < sibling_count {
        let right_pgno = node::read_node(src.read(parent_pgno), child_idx + 1).child_pgno();
        if try_merge(src, pgno, right_pgno, page_size) {
            remove_parent_entry(src, parent_pgno, child_idx + 1);
            rebalance(src, tree, parent_stack, parent_pgno)
        } else {
            rotate_from_right(src, parent_pgno, child_idx, pgno, right_pgno)
        }
    } else if child_idx > 0 {
        let left_pgno = node::read_node(src.read(parent_pgno), child_idx - 1).child_pgno();
        if try_merge(src, left_pgno, pgno, page_size) {
            remove_parent_entry(src, parent_pgno, child_idx);
            rebalance(src, tree, parent_stack, parent_pgno)
        } else {
            rotate_from_left(src, parent_pgno, child_idx, left_pgno, pgno)
        }
    } else {
        Ok(())
    }
}

/// Merge `right_pgno`'s entries onto `left_pgno` if they fit in one page.
/// On success, `left_pgno` holds the union and `right_pgno` is freed.
fn try_merge(src: &mut dyn PageSource, left_pgno: u64, right_pgno: u64, page_size: usize) -> bool {
    let (left_entries, right_entries) = {
        let l = src.read(left_pgno);
        let r = src.read(right_pgno);
        (collect_entries(l), collect_entries(r))
    };
    let total: usize = left_entries
        .iter()
        .chain(right_entries.iter())
        .map(|(k, v, _)| entry_size(k, v))
        .sum();
    if total > page_size - page::PAGE_HEADER_SIZE {
        return false;
    }

    let page_type = if page_kind(src.read(left_pgno)) == Some(PageKind::Leaf) {
        crate::flags::page::LEAF
    } else {
        crate::flags::page::BRANCH
    };
    let buf = src.write(left_pgno);
    page::init_page(buf, left_pgno, page_type);
    for (i, (k, v, f)) in left_entries.iter().chain(right_entries.iter()).enumerate() {
        node::insert_node(buf, i, k, v, *f).expect("merged halves always fit");
    }
    src.free(right_pgno);
    true
}

fn remove_parent_entry(src: &mut dyn PageSource, parent_pgno: u64, idx: usize) {
    let buf = src.write(parent_pgno);
    node::delete_node(buf, idx);
}

/// Move the right sibling's first entry onto the (underfull) left page and
/// fix up the parent's separator. The destination is underfull by
/// definition, so the moved entry (already bounded by `max_key_size`/
/// `max_inline_value`) always has room; a second failure after compaction
/// is propagated rather than silently dropping the entry.
fn rotate_from_right(src: &mut dyn PageSource, parent_pgno: u64, child_idx: usize, left_pgno: u64, right_pgno: u64) -> Result<()> {
    let (k, v, f) = {
        let r = src.read(right_pgno);
        let view = node::read_node(r, 0);
        (view.key.to_vec(), view.data.to_vec(), view.flags)
    };
    {
        let buf = src.write(right_pgno);
        node::delete_node(buf, 0);
    }
    {
        let buf = src.write(left_pgno);
        let n = node::node_count(buf);
        if node::insert_node(buf, n, &k, &v, f).is_err() {
            let page_size = buf.len();
            node::compact(buf, page_size);
            node::insert_node(buf, n, &k, &v, f)
                .map_err(|_| Error::BadValSize("rotated entry did not fit the destination page"))?;
        }
    }
    let new_right_min = {
        let r = src.read(right_pgno);
        node::read_node(r, 0).key.to_vec()
    };
    let buf = src.write(parent_pgno);
    node::delete_node(buf, child_idx + 1);
    if node::insert_node(buf, child_idx + 1, &new_right_min, &right_pgno.to_le_bytes(), 0).is_err() {
        let page_size = buf.len();
        node::compact(buf, page_size);
        node::insert_node(buf, child_idx + 1, &new_right_min, &right_pgno.to_le_bytes(), 0)
            .map_err(|_| Error::BadValSize("rotated separator did not fit the parent page"))?;
    }
    Ok(())
}

fn rotate_from_left(src: &mut dyn PageSource, parent_pgno: u64, child_idx: usize, left_pgno: u64, right_pgno: u64) -> Result<()> {
    let (k, v, f) = {
        let l = src.read(left_pgno);
        let n = node::node_count(l);
        let view = node::read_node(l, n - 1);
        (view.key.to_vec(), view.data.to_vec(), view.flags)
    };
    {
        let buf = src.write(left_pgno);
        let n = node::node_count(buf);
        node::delete_node(buf, n - 1);
    }
    {
        let buf = src.write(right_pgno);
        if node::insert_node(buf, 0, &k, &v, f).is_err() {
            let page_size = buf.len();
            node::compact(buf, page_size);
            node::insert_node(buf, 0, &k, &v, f)
                .map_err(|_| Error::BadValSize("rotated entry did not fit the destination page"))?;
        }
    }
    let buf = src.write(parent_pgno);
    node::delete_node(buf, child_idx);
    if node::insert_node(buf, child_idx, &k, &right_pgno.to_le_bytes(), 0).is_err() {
        let page_size = buf.len();
        node::compact(buf, page_size);
        node::insert_node(buf, child_idx, &k, &right_pgno.to_le_bytes(), 0)
            .map_err(|_| Error::BadValSize("rotated separator did not fit the parent page"))?;
    }
    Ok(())
}
