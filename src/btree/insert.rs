//! Insert path: leaf placement, in-page compaction retry, split, and
//! upward propagation of the new separator (including root growth).

use crate::error::{Error, Result};
use crate::flags::node as nflags;
use crate::flags::page as pflags;
use crate::flags::put as putflags;
use crate::page::{self, node, page_kind, PageKind};

use super::search::{self, LeafSearch};
use super::{PageSource, Tree};

/// Top-level put for a plain (non-DUPSORT) key, including the
/// overflow-spill decision. DUPSORT keys are handled in [`super::dupsort`],
/// which calls back into [`put_kv`] for the underlying mechanics.
pub fn put(src: &mut dyn PageSource, tree: &mut Tree, key: &[u8], value: &[u8], flags: u32) -> Result<()> {
    if key.len() > super::max_key_size(src.page_size()) {
        return Err(Error::BadValSize("key exceeds max_key_size"));
    }

    if super::needs_overflow(value.len(), src.page_size()) {
        let head = super::write_overflow(src, value)?;
        let mut payload = [0u8; 16];
        payload[..8].copy_from_slice(&head.to_le_bytes());
        payload[8..].copy_from_slice(&(value.len() as u64).to_le_bytes());
        put_kv(src, tree, key, &payload, nflags::BIGDATA, flags)
    } else {
        put_kv(src, tree, key, value, 0, flags)
    }
}

/// Insert or replace a single (key, value) pair with no DUPSORT awareness.
/// Used directly for plain DBIs and as the underlying mechanics for
/// DUPSORT's promoted sub-trees (there, "value" is the duplicate value
/// itself, playing the role of the key).
pub fn put_kv(
    src: &mut dyn PageSource,
    tree: &mut Tree,
    key: &[u8],
    value: &[u8],
    node_flags: u16,
    put_flags: u32,
) -> Result<()> {
    let cmp = tree.cmp();

    let Some(root) = tree.root else {
        let pgno = src.alloc()?;
        let buf = src.write(pgno);
        page::init_page(buf, pgno, pflags::LEAF);
        node::insert_node(buf, 0, key, value, node_flags)
            .map_err(|_| Error::BadValSize("value too large for an empty leaf"))?;
        tree.root = Some(pgno);
        return Ok(());
    };

    let descent = search::descend(src, root, key, cmp);
    let leaf_pgno = descent.leaf_pgno;
    let pos = {
        let leaf = src.read(leaf_pgno);
        search::leaf_search(leaf, key, cmp)
    };

    match pos {
        LeafSearch::Found(idx) => {
            if put_flags & putflags::NOOVERWRITE != 0 {
                return Err(Error::KeyExist);
            }
            if put_flags & putflags::APPEND != 0 || put_flags & putflags::APPENDDUP != 0 {
                let count = node::node_count(src.read(leaf_pgno));
                if idx + 1 != count {
                    return Err(Error::KeyMismatch);
                }
            }
            replace_node(src, tree, &descent.stack, leaf_pgno, idx, key, value, node_flags)
        }
        LeafSearch::NotFound(idx) => {
            if put_flags & putflags::APPEND != 0 || put_flags & putflags::APPENDDUP != 0 {
                let count = node::node_count(src.read(leaf_pgno));
                if idx != count {
                    return Err(Error::KeyMismatch);
                }
            }
            insert_at(src, tree, &descent.stack, leaf_pgno, idx, key, value, node_flags)
        }
    }
}

pub(crate) fn replace_node(
    src: &mut dyn PageSource,
    tree: &mut Tree,
    stack: &[(u64, usize)],
    leaf_pgno: u64,
    idx: usize,
    key: &[u8],
    value: &[u8],
    node_flags: u16,
) -> Result<()> {
    {
        let buf = src.write(leaf_pgno);
        node::delete_node(buf, idx);
        if node::insert_node(buf, idx, key, value, node_flags).is_ok() {
            return Ok(());
        }
        let page_size = src.page_size();
        node::compact(buf, page_size);
        if node::insert_node(buf, idx, key, value, node_flags).is_ok() {
            return Ok(());
        }
    }
    split_and_insert(src, tree, stack, leaf_pgno, idx, key, value, node_flags)
}

fn insert_at(
    src: &mut dyn PageSource,
    tree: &mut Tree,
    stack: &[(u64, usize)],
    leaf_pgno: u64,
    idx: usize,
    key: &[u8],
    value: &[u8],
    node_flags: u16,
) -> Result<()> {
    {
        let buf = src.write(leaf_pgno);
        if node::insert_node(buf, idx, key, value, node_flags).is_ok() {
            if idx == 0 {
                fix_left_spine(src, stack, key);
            }
            return Ok(());
        }
        let page_size = src.page_size();
        node::compact(buf, page_size);
        if node::insert_node(buf, idx, key, value, node_flags).is_ok() {
            if idx == 0 {
                fix_left_spine(src, stack, key);
            }
            return Ok(());
        }
    }
    split_and_insert(src, tree, stack, leaf_pgno, idx, key, value, node_flags)
}

/// Walk from the deepest branch level upward, fixing the first separator
/// key that actually needs to change (index 0 in a branch is a sentinel
/// with no real comparison value, so a change there must keep climbing).
pub(crate) fn fix_left_spine(src: &mut dyn PageSource, stack: &[(u64, usize)], new_min_key: &[u8]) {
    for &(pgno, idx) in stack.iter().rev() {
        if idx == 0 {
            continue;
        }
        let child_pgno = {
            let buf = src.read(pgno);
            node::read_node(buf, idx).child_pgno()
        };
        let buf = src.write(pgno);
        node::delete_node(buf, idx);
        // The new key is still properly bounded by its neighbors (it only
        // shrank toward the low end of this child's range), so the
        // original slot is guaranteed to fit unless the page was already
        // at capacity — vanishingly rare for an 8-byte branch payload.
        if node::insert_node(buf, idx, new_min_key, &child_pgno.to_le_bytes(), 0).is_err() {
            node::compact(buf, buf.len());
            let _ = node::insert_node(buf, idx, new_min_key, &child_pgno.to_le_bytes(), 0);
        }
        return;
    }
}

fn entry_size(key: &[u8], value: &[u8]) -> usize {
    let raw = node::NODE_HEADER_SIZE + key.len() + value.len();
    ((raw + 1) & !1) + 2 // + pointer-array slot
}

/// Pick a split point such that BOTH halves fit within `page_size`'s budget,
/// preferring the point closest to an even split. A single entry is always
/// small enough to stand alone on a page (`max_key_size` + `max_inline_value`
/// both fit half the budget), so for any overfull page there is always at
/// least one valid split point between two entries.
fn choose_split_index(entries: &[(Vec<u8>, Vec<u8>, u16)], page_size: usize) -> Result<usize> {
    let budget = page_size - page::PAGE_HEADER_SIZE;
    let sizes: Vec<usize> = entries.iter().map(|(k, v, _)| entry_size(k, v)).collect();
    let total: usize = sizes.iter().sum();
    let half = total / 2;

    let mut best: Option<usize> = None;
    let mut best_diff = usize::MAX;
    let mut running = 0usize;
    for (i, size) in sizes.iter().enumerate() {
        running += size;
        let split = i + 1;
        if split >= entries.len() {
            break;
        }
        let left = running;
        let right = total - running;
        if left <= budget && right <= budget {
            let diff = left.abs_diff(half);
            if diff < best_diff {
                best_diff = diff;
                best = Some(split);
            }
        }
    }
    best.ok_or(Error::BadValSize("entry too large to split across two pages"))
}

#[allow(clippy::too_many_arguments)]
fn split_and_insert(
    src: &mut dyn PageSource,
    tree: &mut Tree,
    stack: &[(u64, usize)],
    left_pgno: u64,
    idx: usize,
    key: &[u8],
    value: &[u8],
    node_flags: u16,
) -> Result<()> {
    let page_size = src.page_size();
    let is_leaf = page_kind(src.read(left_pgno)) == Some(PageKind::Leaf);
    let page_type = if is_leaf { pflags::LEAF } else { pflags::BRANCH };

    let mut entries: Vec<(Vec<u8>, Vec<u8>, u16)> = {
        let buf = src.read(left_pgno);
        let n = node::node_count(buf);
        let mut v = Vec::with_capacity(n + 1);
        for i in 0..n {
            let view = node::read_node(buf, i);
            v.push((view.key.to_vec(), view.data.to_vec(), view.flags));
        }
        v
    };
    entries.insert(idx, (key.to_vec(), value.to_vec(), node_flags));

    let split_idx = choose_split_index(&entries, page_size)?;
    let right_pgno = src.alloc()?;

    {
        let buf = src.write(left_pgno);
        page::init_page(buf, left_pgno, page_type);
        for (i, (k, v, f)) in entries[..split_idx].iter().enumerate() {
            node::insert_node(buf, i, k, v, *f).map_err(|_| Error::BadValSize("split half unexpectedly overflowed its page"))?;
        }
    }
    let right_first_key = entries[split_idx].0.clone();
    {
        let buf = src.write(right_pgno);
        page::init_page(buf, right_pgno, page_type);
        for (i, (k, v, f)) in entries[split_idx..].iter().enumerate() {
            node::insert_node(buf, i, k, v, *f).map_err(|_| Error::BadValSize("split half unexpectedly overflowed its page"))?;
        }
    }

    if idx == 0 && split_idx > 0 {
        fix_left_spine(src, stack, &entries[0].0);
    }

    propagate_split(src, tree, stack, right_pgno, &right_first_key)
}

fn propagate_split(
    src: &mut dyn PageSource,
    tree: &mut Tree,
    stack: &[(u64, usize)],
    right_pgno: u64,
    sep_key: &[u8],
) -> Result<()> {
    if let Some(&(parent_pgno, child_idx)) = stack.last() {
        let parent_stack = &stack[..stack.len() - 1];
        let insert_idx = child_idx + 1;
        {
            let buf = src.write(parent_pgno);
            if node::insert_node(buf, insert_idx, sep_key, &right_pgno.to_le_bytes(), 0).is_ok() {
                return Ok(());
            }
            let page_size = src.page_size();
            node::compact(buf, page_size);
            if node::insert_node(buf, insert_idx, sep_key, &right_pgno.to_le_bytes(), 0).is_ok() {
                return Ok(());
            }
        }
        split_and_insert(
            src,
            tree,
            parent_stack,
            parent_pgno,
            insert_idx,
            sep_key,
            &right_pgno.to_le_bytes(),
            0,
        )
    } else {
        let left_pgno = {
            // The old root (now the split's left half) keeps its own pgno;
            // we just need it for the new root's first child pointer.
            tree.root.expect("root split implies a prior root")
        };
        let new_root = src.alloc()?;
        let buf = src.write(new_root);
        page::init_page(buf, new_root, pflags::BRANCH);
        node::insert_node(buf, 0, &[], &left_pgno.to_le_bytes(), 0).expect("fresh root, first child");
        node::insert_node(buf, 1, sep_key, &right_pgno.to_le_bytes(), 0).expect("fresh root, second child");
        tree.root = Some(new_root);
        Ok(())
    }
}
