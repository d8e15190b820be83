//! DUPSORT machinery: a key's duplicate values live inline as an ordinary
//! node value (one duplicate), promote to an inline `SUBPAGE` mini-leaf (a
//! few duplicates), then promote again to a real sub-tree once the
//! sub-page would exceed its page-relative budget.
//!
//! The promoted sub-tree reuses the same generic node-based B+tree engine
//! as top-level DBIs (duplicate values play the role of keys, with empty
//! node data) rather than switching to `LEAF2` packing for `DUPFIXED`
//! sub-trees — see `DESIGN.md` for that tradeoff. `leaf2` remains a
//! complete, independently tested codec for callers that want packed
//! fixed-size storage directly.

use crate::error::{Error, Result};
use crate::flags::node as nflags;
use crate::flags::put as putflags;
use crate::page::{node, page_kind, subpage, PageKind};

use super::{delete, insert, search, PageSource, Tree};

/// A sub-page's capacity is a quarter of the main page size, per the
/// design's promotion-budget rule.
pub fn subpage_budget(page_size: usize) -> usize {
    (page_size / 4).max(subpage::SUBPAGE_HEADER_SIZE + 32)
}

pub enum DupView<'a> {
    Single(&'a [u8]),
    Subpage(&'a [u8]),
    SubTree { root: u64, count: u64 },
}

pub fn classify<'a>(view: &node::NodeView<'a>) -> DupView<'a> {
    if view.flags & nflags::SUBDATA != 0 {
        let root = u64::from_le_bytes(view.data[..8].try_into().unwrap());
        let count = u64::from_le_bytes(view.data[8..16].try_into().unwrap());
        DupView::SubTree { root, count }
    } else if view.flags & nflags::DUPDATA != 0 {
        DupView::Subpage(view.data)
    } else {
        DupView::Single(view.data)
    }
}

pub fn count(view: &node::NodeView) -> u64 {
    match classify(view) {
        DupView::Single(_) => 1,
        DupView::Subpage(buf) => subpage::count(buf) as u64,
        DupView::SubTree { count, .. } => count,
    }
}

fn subtree_of(data: &[u8]) -> (u64, u64) {
    (
        u64::from_le_bytes(data[..8].try_into().unwrap()),
        u64::from_le_bytes(data[8..16].try_into().unwrap()),
    )
}

fn encode_subtree(root: u64, count: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&root.to_le_bytes());
    out[8..].copy_from_slice(&count.to_le_bytes());
    out
}

pub fn put_dup(src: &mut dyn PageSource, tree: &mut Tree, key: &[u8], value: &[u8], put_flags: u32) -> Result<()> {
    debug_assert!(tree.dupsort);

    let Some(root) = tree.root else {
        return insert::put_kv(src, tree, key, value, 0, put_flags);
    };

    let cmp = tree.cmp();
    let descent = search::descend(src, root, key, cmp);
    let leaf_pgno = descent.leaf_pgno;
    let pos = {
        let leaf = src.read(leaf_pgno);
        search::leaf_search(leaf, key, cmp)
    };

    match pos {
        search::LeafSearch::NotFound(idx) => {
            if put_flags & putflags::APPEND != 0 || put_flags & putflags::APPENDDUP != 0 {
                let count = node::node_count(src.read(leaf_pgno));
                if idx != count {
                    return Err(Error::KeyMismatch);
                }
            }
            // First duplicate for this key is stored exactly like a plain
            // node, including the overflow-spill decision.
            if super::needs_overflow(value.len(), src.page_size()) {
                let head = super::write_overflow(src, value)?;
                let mut payload = [0u8; 16];
                payload[..8].copy_from_slice(&head.to_le_bytes());
                payload[8..].copy_from_slice(&(value.len() as u64).to_le_bytes());
                insert::put_kv(src, tree, key, &payload, nflags::BIGDATA, put_flags)
            } else {
                insert::put_kv(src, tree, key, value, 0, put_flags)
            }
        }
        search::LeafSearch::Found(idx) => {
            let (flags, data) = {
                let v = node::read_node(src.read(leaf_pgno), idx);
                (v.flags, v.data.to_vec())
            };
            if flags & nflags::SUBDATA != 0 {
                put_into_subtree(src, leaf_pgno, idx, &data, value, put_flags)
            } else if flags & nflags::DUPDATA != 0 {
                put_into_subpage(src, tree, &descent.stack, leaf_pgno, idx, key, &data, value, put_flags)
            } else {
                // A single, not-yet-promoted duplicate, possibly overflow-spilled.
                // Once it moves into a sub-page it's always inline, so any
                // existing overflow chain is released.
                let old_value = if flags & nflags::BIGDATA != 0 {
                    let head = u64::from_le_bytes(data[..8].try_into().unwrap());
                    let len = u64::from_le_bytes(data[8..16].try_into().unwrap()) as usize;
                    let resolved = super::read_overflow(src, head, len, src.page_size());
                    let run = crate::page::header_of(src.read(head)).overflow_pages() as u64;
                    for i in 0..run {
                        src.free(head + i);
                    }
                    resolved
                } else {
                    data
                };
                start_subpage(src, tree, &descent.stack, leaf_pgno, idx, key, &old_value, value, put_flags)
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn start_subpage(
    src: &mut dyn PageSource,
    tree: &mut Tree,
    stack: &[(u64, usize)],
    leaf_pgno: u64,
    idx: usize,
    key: &[u8],
    old_value: &[u8],
    new_value: &[u8],
    put_flags: u32,
) -> Result<()> {
    if old_value == new_value {
        return if put_flags & putflags::NODUPDATA != 0 {
            Err(Error::KeyExist)
        } else {
            Ok(())
        };
    }
    let page_size = src.page_size();
    let capacity = subpage_budget(page_size);
    let mut buf = vec![0u8; capacity];
    subpage::init(&mut buf, 0, capacity);
    let (a, b) = if old_value < new_value {
        (old_value, new_value)
    } else {
        (new_value, old_value)
    };
    subpage::insert(&mut buf, 0, a).expect("two small values fit a fresh sub-page");
    subpage::insert(&mut buf, 1, b).expect("two small values fit a fresh sub-page");
    insert::replace_node(src, tree, stack, leaf_pgno, idx, key, &buf, nflags::DUPDATA)
}

#[allow(clippy::too_many_arguments)]
fn put_into_subpage(
    src: &mut dyn PageSource,
    tree: &mut Tree,
    stack: &[(u64, usize)],
    leaf_pgno: u64,
    idx: usize,
    key: &[u8],
    subpage_bytes: &[u8],
    new_value: &[u8],
    put_flags: u32,
) -> Result<()> {
    let capacity = subpage_bytes.len();
    let mut buf = subpage_bytes.to_vec();

    if subpage::search(&buf, new_value).is_ok() {
        return if put_flags & putflags::NODUPDATA != 0 {
            Err(Error::KeyExist)
        } else {
            Ok(())
        };
    }
    let pos = subpage::search(&buf, new_value).unwrap_err();
    if subpage::insert(&mut buf, pos, new_value).is_ok() {
        return insert::replace_node(src, tree, stack, leaf_pgno, idx, key, &buf, nflags::DUPDATA);
    }

    subpage::compact(&mut buf, capacity);
    let pos = subpage::search(&buf, new_value).unwrap_err();
    if subpage::insert(&mut buf, pos, new_value).is_ok() {
        return insert::replace_node(src, tree, stack, leaf_pgno, idx, key, &buf, nflags::DUPDATA);
    }

    promote_to_subtree(src, tree, stack, leaf_pgno, idx, key, subpage_bytes, new_value)
}

#[allow(clippy::too_many_arguments)]
fn promote_to_subtree(
    src: &mut dyn PageSource,
    tree: &mut Tree,
    stack: &[(u64, usize)],
    leaf_pgno: u64,
    idx: usize,
    key: &[u8],
    subpage_bytes: &[u8],
    new_value: &[u8],
) -> Result<()> {
    let mut sub = Tree {
        root: None,
        dupsort: false,
        dupfixed: false,
        integerkey: false,
    };
    let mut values: Vec<Vec<u8>> = subpage::iter(subpage_bytes).map(|v| v.to_vec()).collect();
    let pos = values
        .binary_search_by(|v| v.as_slice().cmp(new_value))
        .unwrap_or_else(|e| e);
    values.insert(pos, new_value.to_vec());
    for v in &values {
        insert::put_kv(src, &mut sub, v, &[], 0, putflags::UPSERT)?;
    }
    let root = sub.root.expect("at least one value was inserted");
    let data = encode_subtree(root, values.len() as u64);
    insert::replace_node(src, tree, stack, leaf_pgno, idx, key, &data, nflags::SUBDATA)
}

fn put_into_subtree(
    src: &mut dyn PageSource,
    leaf_pgno: u64,
    idx: usize,
    subdata: &[u8],
    new_value: &[u8],
    put_flags: u32,
) -> Result<()> {
    let (root, count) = subtree_of(subdata);
    let mut sub = Tree {
        root: Some(root),
        dupsort: false,
        dupfixed: false,
        integerkey: false,
    };
    let cmp = sub.cmp();
    let descent = search::descend(src, root, new_value, cmp);
    let exists = matches!(
        search::leaf_search(src.read(descent.leaf_pgno), new_value, cmp),
        search::LeafSearch::Found(_)
    );
    if exists {
        return if put_flags & putflags::NODUPDATA != 0 {
            Err(Error::KeyExist)
        } else {
            Ok(())
        };
    }

    insert::put_kv(src, &mut sub, new_value, &[], 0, putflags::UPSERT)?;
    let new_root = sub.root.expect("subtree insert always leaves a root");
    let data = encode_subtree(new_root, count + 1);

    let buf = src.write(leaf_pgno);
    let key = node::read_node(buf, idx).key.to_vec();
    node::delete_node(buf, idx);
    node::insert_node(buf, idx, &key, &data, nflags::SUBDATA).expect("same-size SUBDATA replace always fits");
    Ok(())
}

/// Delete one duplicate value, or (if `value` is `None`) the whole key and
/// all of its duplicates.
pub fn del_dup(src: &mut dyn PageSource, tree: &mut Tree, key: &[u8], value: Option<&[u8]>) -> Result<()> {
    let Some(root) = tree.root else {
        return Err(Error::NotFound);
    };
    let cmp = tree.cmp();
    let descent = search::descend(src, root, key, cmp);
    let leaf_pgno = descent.leaf_pgno;
    let idx = match search::leaf_search(src.read(leaf_pgno), key, cmp) {
        search::LeafSearch::Found(i) => i,
        search::LeafSearch::NotFound(_) => return Err(Error::NotFound),
    };

    let (flags, data) = {
        let v = node::read_node(src.read(leaf_pgno), idx);
        (v.flags, v.data.to_vec())
    };

    let Some(val) = value else {
        if flags & nflags::SUBDATA != 0 {
            let (subroot, _) = subtree_of(&data);
            free_subtree(src, subroot);
        }
        return delete::delete(src, tree, key);
    };

    if flags & nflags::SUBDATA != 0 {
        let (subroot, count) = subtree_of(&data);
        let mut sub = Tree {
            root: Some(subroot),
            dupsort: false,
            dupfixed: false,
            integerkey: false,
        };
        delete::delete(src, &mut sub, val)?;
        match sub.root {
            None => delete::delete(src, tree, key),
            Some(new_root) => {
                let newdata = encode_subtree(new_root, count - 1);
                let buf = src.write(leaf_pgno);
                node::delete_node(buf, idx);
                node::insert_node(buf, idx, key, &newdata, nflags::SUBDATA)
                    .expect("same-size SUBDATA replace always fits");
                Ok(())
            }
        }
    } else if flags & nflags::DUPDATA != 0 {
        let mut buf = data.clone();
        match subpage::search(&buf, val) {
            Err(_) => Err(Error::NotFound),
            Ok(pos) => {
                subpage::remove(&mut buf, pos);
                if subpage::count(&buf) == 1 {
                    let last = subpage::get(&buf, 0).to_vec();
                    insert::replace_node(src, tree, &descent.stack, leaf_pgno, idx, key, &last, 0)
                } else {
                    insert::replace_node(src, tree, &descent.stack, leaf_pgno, idx, key, &buf, nflags::DUPDATA)
                }
            }
        }
    } else if data == val {
        delete::delete(src, tree, key)
    } else {
        Err(Error::NotFound)
    }
}

fn free_subtree(src: &mut dyn PageSource, root: u64) {
    let is_branch = page_kind(src.read(root)) == Some(PageKind::Branch);
    if is_branch {
        let children: Vec<u64> = {
            let buf = src.read(root);
            let n = node::node_count(buf);
            (0..n).map(|i| node::read_node(buf, i).child_pgno()).collect()
        };
        for c in children {
            free_subtree(src, c);
        }
    }
    src.free(root);
}

pub fn count_dup(src: &dyn PageSource, tree: &Tree, key: &[u8]) -> Result<u64> {
    let view = super::get(src, tree, key)?;
    Ok(count(&view))
}
