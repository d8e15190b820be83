//! Stack-based cursor: positioning, movement, DUPSORT-aware duplicate
//! navigation, and (on write transactions) put/del/count mutation.
//!
//! A cursor's position is kept as a logical `(key, duplicate value)` pair
//! rather than a pinned `(page, idx)` stack. Every operation re-descends
//! from the DBI root, which is the "simpler implementation" the design
//! allows in place of patching stale stack entries after a structural
//! mutation (split, merge, rebalance) elsewhere in the same transaction.

use crate::btree::{self, delete, dupsort, insert, search, PageSource, Tree};
use crate::error::{Error, Result};
use crate::flags::put as putflags;
use crate::page::{node, subpage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    First,
    Last,
    Set,
    SetRange,
    GetCurrent,
    Next,
    Prev,
    NextNoDup,
    PrevNoDup,
    NextDup,
    PrevDup,
    FirstDup,
    LastDup,
    GetBoth,
    GetBothRange,
}

/// One key's worth of duplicate values, abstracted over the three DUPSORT
/// storage states. Owns its bytes rather than borrowing from the node view
/// that produced it, since the `Single` case may need an overflow chain
/// resolved into a fresh buffer.
enum DupSource {
    Single(Vec<u8>),
    Subpage(Vec<u8>),
    SubTree(u64),
}

fn dup_source(src: &dyn PageSource, view: &node::NodeView) -> DupSource {
    if view.is_subdata() {
        let root = u64::from_le_bytes(view.data[..8].try_into().unwrap());
        DupSource::SubTree(root)
    } else if view.is_dupdata() {
        DupSource::Subpage(view.data.to_vec())
    } else if view.is_bigdata() {
        let head = u64::from_le_bytes(view.data[..8].try_into().unwrap());
        let len = u64::from_le_bytes(view.data[8..16].try_into().unwrap()) as usize;
        DupSource::Single(btree::read_overflow(src, head, len, src.page_size()))
    } else {
        DupSource::Single(view.data.to_vec())
    }
}

fn node_value_bytes(src: &dyn PageSource, view: &node::NodeView) -> Vec<u8> {
    if view.is_bigdata() {
        let head = u64::from_le_bytes(view.data[..8].try_into().unwrap());
        let len = u64::from_le_bytes(view.data[8..16].try_into().unwrap()) as usize;
        btree::read_overflow(src, head, len, src.page_size())
    } else {
        view.data.to_vec()
    }
}

fn dup_first(src: &dyn PageSource, source: &DupSource) -> Vec<u8> {
    match source {
        DupSource::Single(v) => v.clone(),
        DupSource::Subpage(buf) => subpage::get(buf, 0).to_vec(),
        DupSource::SubTree(root) => {
            let leaf = search::leftmost_leaf(src, *root);
            node::read_node(src.read(leaf), 0).key.to_vec()
        }
    }
}

fn dup_last(src: &dyn PageSource, source: &DupSource) -> Vec<u8> {
    match source {
        DupSource::Single(v) => v.clone(),
        DupSource::Subpage(buf) => subpage::get(buf, subpage::count(buf) - 1).to_vec(),
        DupSource::SubTree(root) => {
            let leaf = search::rightmost_leaf(src, *root);
            let page = src.read(leaf);
            let n = node::node_count(page);
            node::read_node(page, n - 1).key.to_vec()
        }
    }
}

fn dup_next(src: &dyn PageSource, source: &DupSource, current: &[u8]) -> Option<Vec<u8>> {
    match source {
        DupSource::Single(_) => None,
        DupSource::Subpage(buf) => match subpage::search(buf, current) {
            Ok(pos) if pos + 1 < subpage::count(buf) => Some(subpage::get(buf, pos + 1).to_vec()),
            _ => None,
        },
        DupSource::SubTree(root) => {
            let cmp = search::bytewise_cmp;
            let descent = search::descend(src, *root, current, cmp);
            let leaf = src.read(descent.leaf_pgno);
            match search::leaf_search(leaf, current, cmp) {
                search::LeafSearch::Found(idx) if idx + 1 < node::node_count(leaf) => {
                    Some(node::read_node(leaf, idx + 1).key.to_vec())
                }
                search::LeafSearch::Found(_) => {
                    search::next_leaf(src, &descent.stack).map(|p| node::read_node(src.read(p), 0).key.to_vec())
                }
                search::LeafSearch::NotFound(_) => None,
            }
        }
    }
}

fn dup_prev(src: &dyn PageSource, source: &DupSource, current: &[u8]) -> Option<Vec<u8>> {
    match source {
        DupSource::Single(_) => None,
        DupSource::Subpage(buf) => match subpage::search(buf, current) {
            Ok(pos) if pos > 0 => Some(subpage::get(buf, pos - 1).to_vec()),
            _ => None,
        },
        DupSource::SubTree(root) => {
            let cmp = search::bytewise_cmp;
            let descent = search::descend(src, *root, current, cmp);
            let leaf = src.read(descent.leaf_pgno);
            match search::leaf_search(leaf, current, cmp) {
                search::LeafSearch::Found(idx) if idx > 0 => Some(node::read_node(leaf, idx - 1).key.to_vec()),
                search::LeafSearch::Found(_) => search::prev_leaf(src, &descent.stack).map(|p| {
                    let page = src.read(p);
                    let n = node::node_count(page);
                    node::read_node(page, n - 1).key.to_vec()
                }),
                search::LeafSearch::NotFound(_) => None,
            }
        }
    }
}

fn dup_contains(src: &dyn PageSource, source: &DupSource, value: &[u8]) -> bool {
    match source {
        DupSource::Single(v) => v.as_slice() == value,
        DupSource::Subpage(buf) => subpage::search(buf, value).is_ok(),
        DupSource::SubTree(root) => {
            let cmp = search::bytewise_cmp;
            let descent = search::descend(src, *root, value, cmp);
            matches!(search::leaf_search(src.read(descent.leaf_pgno), value, cmp), search::LeafSearch::Found(_))
        }
    }
}

fn dup_ceiling(src: &dyn PageSource, source: &DupSource, value: &[u8]) -> Option<Vec<u8>> {
    match source {
        DupSource::Single(v) => {
            if v.as_slice() >= value {
                Some(v.clone())
            } else {
                None
            }
        }
        DupSource::Subpage(buf) => match subpage::search(buf, value) {
            Ok(pos) => Some(subpage::get(buf, pos).to_vec()),
            Err(pos) if pos < subpage::count(buf) => Some(subpage::get(buf, pos).to_vec()),
            Err(_) => None,
        },
        DupSource::SubTree(root) => {
            let cmp = search::bytewise_cmp;
            let descent = search::descend(src, *root, value, cmp);
            let leaf = src.read(descent.leaf_pgno);
            match search::leaf_search(leaf, value, cmp) {
                search::LeafSearch::Found(idx) => Some(node::read_node(leaf, idx).key.to_vec()),
                search::LeafSearch::NotFound(idx) if idx < node::node_count(leaf) => {
                    Some(node::read_node(leaf, idx).key.to_vec())
                }
                search::LeafSearch::NotFound(_) => {
                    search::next_leaf(src, &descent.stack).map(|p| node::read_node(src.read(p), 0).key.to_vec())
                }
            }
        }
    }
}

/// Key-level successor: the smallest key strictly greater than `key`.
fn key_next(src: &dyn PageSource, tree: &Tree, key: &[u8]) -> Option<Vec<u8>> {
    let root = tree.root?;
    let cmp = tree.cmp();
    let descent = search::descend(src, root, key, cmp);
    let leaf = src.read(descent.leaf_pgno);
    let next_idx = match search::leaf_search(leaf, key, cmp) {
        search::LeafSearch::Found(idx) => idx + 1,
        search::LeafSearch::NotFound(idx) => idx,
    };
    if next_idx < node::node_count(leaf) {
        Some(node::read_node(leaf, next_idx).key.to_vec())
    } else {
        search::next_leaf(src, &descent.stack).map(|p| node::read_node(src.read(p), 0).key.to_vec())
    }
}

/// Key-level predecessor: the largest key strictly less than `key`.
fn key_prev(src: &dyn PageSource, tree: &Tree, key: &[u8]) -> Option<Vec<u8>> {
    let root = tree.root?;
    let cmp = tree.cmp();
    let descent = search::descend(src, root, key, cmp);
    let leaf = src.read(descent.leaf_pgno);
    match search::leaf_search(leaf, key, cmp) {
        search::LeafSearch::Found(idx) if idx > 0 => Some(node::read_node(leaf, idx - 1).key.to_vec()),
        search::LeafSearch::NotFound(idx) if idx > 0 => Some(node::read_node(leaf, idx - 1).key.to_vec()),
        _ => search::prev_leaf(src, &descent.stack).map(|p| {
            let page = src.read(p);
            let n = node::node_count(page);
            node::read_node(page, n - 1).key.to_vec()
        }),
    }
}

/// A cursor into one DBI. The tree it navigates (root pointer, DUPSORT
/// mode) is owned by the caller's DBI table and passed in per call, since
/// a write-side mutation may change the root and the caller is the one
/// responsible for keeping that up to date across calls.
#[derive(Default)]
pub struct Cursor {
    key: Option<Vec<u8>>,
    dup_value: Option<Vec<u8>>,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    fn materialize(&self, src: &dyn PageSource, tree: &Tree) -> Result<(Vec<u8>, Vec<u8>)> {
        let key = self.key.clone().ok_or(Error::NotFound)?;
        let view = btree::get(src, tree, &key)?;
        if !tree.dupsort {
            return Ok((key, node_value_bytes(src, &view)));
        }
        let source = dup_source(src, &view);
        let value = match &self.dup_value {
            Some(v) => v.clone(),
            None => dup_first(src, &source),
        };
        Ok((key, value))
    }

    pub fn get(
        &mut self,
        src: &dyn PageSource,
        tree: &Tree,
        key_in: Option<&[u8]>,
        value_in: Option<&[u8]>,
        op: Op,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        match op {
            Op::First => self.first(src, tree),
            Op::Last => self.last(src, tree),
            Op::Set => self.set(src, tree, key_in.ok_or(Error::BadValSize("Set requires a key"))?),
            Op::SetRange => self.set_range(src, tree, key_in.ok_or(Error::BadValSize("SetRange requires a key"))?),
            Op::GetCurrent => self.materialize(src, tree),
            Op::Next => self.next(src, tree),
            Op::Prev => self.prev(src, tree),
            Op::NextNoDup => self.next_no_dup(src, tree),
            Op::PrevNoDup => self.prev_no_dup(src, tree),
            Op::NextDup => self.next_dup(src, tree),
            Op::PrevDup => self.prev_dup(src, tree),
            Op::FirstDup => self.first_dup(src, tree),
            Op::LastDup => self.last_dup(src, tree),
            Op::GetBoth => self.get_both(
                src,
                tree,
                key_in.ok_or(Error::BadValSize("GetBoth requires a key"))?,
                value_in.ok_or(Error::BadValSize("GetBoth requires a value"))?,
            ),
            Op::GetBothRange => self.get_both_range(
                src,
                tree,
                key_in.ok_or(Error::BadValSize("GetBothRange requires a key"))?,
                value_in.ok_or(Error::BadValSize("GetBothRange requires a value"))?,
            ),
        }
    }

    fn first(&mut self, src: &dyn PageSource, tree: &Tree) -> Result<(Vec<u8>, Vec<u8>)> {
        let root = tree.root.ok_or(Error::NotFound)?;
        let leaf = search::leftmost_leaf(src, root);
        let page = src.read(leaf);
        if node::node_count(page) == 0 {
            return Err(Error::NotFound);
        }
        self.key = Some(node::read_node(page, 0).key.to_vec());
        self.dup_value = None;
        self.materialize(src, tree)
    }

    fn last(&mut self, src: &dyn PageSource, tree: &Tree) -> Result<(Vec<u8>, Vec<u8>)> {
        let root = tree.root.ok_or(Error::NotFound)?;
        let leaf = search::rightmost_leaf(src, root);
        let page = src.read(leaf);
        let n = node::node_count(page);
        if n == 0 {
            return Err(Error::NotFound);
        }
        let view = node::read_node(page, n - 1);
        self.key = Some(view.key.to_vec());
        self.dup_value = if tree.dupsort {
            let source = dup_source(src, &view);
            Some(dup_last(src, &source))
        } else {
            None
        };
        self.materialize(src, tree)
    }

    fn set(&mut self, src: &dyn PageSource, tree: &Tree, key: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        btree::get(src, tree, key)?;
        self.key = Some(key.to_vec());
        self.dup_value = None;
        self.materialize(src, tree)
    }

    fn set_range(&mut self, src: &dyn PageSource, tree: &Tree, key: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let root = tree.root.ok_or(Error::NotFound)?;
        let cmp = tree.cmp();
        let descent = search::descend(src, root, key, cmp);
        let leaf = src.read(descent.leaf_pgno);
        let idx = match search::leaf_search(leaf, key, cmp) {
            search::LeafSearch::Found(i) => i,
            search::LeafSearch::NotFound(i) => i,
        };
        let found_key = if idx < node::node_count(leaf) {
            Some(node::read_node(leaf, idx).key.to_vec())
        } else {
            search::next_leaf(src, &descent.stack).map(|p| node::read_node(src.read(p), 0).key.to_vec())
        };
        match found_key {
            Some(k) => {
                self.key = Some(k);
                self.dup_value = None;
                self.materialize(src, tree)
            }
            None => Err(Error::NotFound),
        }
    }

    fn next(&mut self, src: &dyn PageSource, tree: &Tree) -> Result<(Vec<u8>, Vec<u8>)> {
        let key = self.key.clone().ok_or(Error::NotFound)?;
        if tree.dupsort {
            if let Ok(view) = btree::get(src, tree, &key) {
                let source = dup_source(src, &view);
                let current = self.dup_value.clone().unwrap_or_else(|| dup_first(src, &source));
                if let Some(next_val) = dup_next(src, &source, &current) {
                    self.dup_value = Some(next_val);
                    return self.materialize(src, tree);
                }
            }
        }
        self.next_no_dup(src, tree)
    }

    fn prev(&mut self, src: &dyn PageSource, tree: &Tree) -> Result<(Vec<u8>, Vec<u8>)> {
        let key = self.key.clone().ok_or(Error::NotFound)?;
        if tree.dupsort {
            if let Ok(view) = btree::get(src, tree, &key) {
                let source = dup_source(src, &view);
                let current = self.dup_value.clone().unwrap_or_else(|| dup_first(src, &source));
                if let Some(prev_val) = dup_prev(src, &source, &current) {
                    self.dup_value = Some(prev_val);
                    return self.materialize(src, tree);
                }
            }
        }
        self.prev_no_dup(src, tree)
    }

    fn next_no_dup(&mut self, src: &dyn PageSource, tree: &Tree) -> Result<(Vec<u8>, Vec<u8>)> {
        let key = self.key.clone().ok_or(Error::NotFound)?;
        match key_next(src, tree, &key) {
            Some(k) => {
                self.key = Some(k);
                self.dup_value = None;
                self.materialize(src, tree)
            }
            None => Err(Error::NotFound),
        }
    }

    fn prev_no_dup(&mut self, src: &dyn PageSource, tree: &Tree) -> Result<(Vec<u8>, Vec<u8>)> {
        let key = self.key.clone().ok_or(Error::NotFound)?;
        match key_prev(src, tree, &key) {
            Some(k) => {
                self.dup_value = if tree.dupsort {
                    let view = btree::get(src, tree, &k)?;
                    Some(dup_last(src, &dup_source(src, &view)))
                } else {
                    None
                };
                self.key = Some(k);
                self.materialize(src, tree)
            }
            None => Err(Error::NotFound),
        }
    }

    fn next_dup(&mut self, src: &dyn PageSource, tree: &Tree) -> Result<(Vec<u8>, Vec<u8>)> {
        if !tree.dupsort {
            return Err(Error::Incompatible);
        }
        let key = self.key.clone().ok_or(Error::NotFound)?;
        let view = btree::get(src, tree, &key)?;
        let source = dup_source(src, &view);
        let current = self.dup_value.clone().unwrap_or_else(|| dup_first(src, &source));
        match dup_next(src, &source, &current) {
            Some(v) => {
                self.dup_value = Some(v);
                self.materialize(src, tree)
            }
            None => Err(Error::NotFound),
        }
    }

    fn prev_dup(&mut self, src: &dyn PageSource, tree: &Tree) -> Result<(Vec<u8>, Vec<u8>)> {
        if !tree.dupsort {
            return Err(Error::Incompatible);
        }
        let key = self.key.clone().ok_or(Error::NotFound)?;
        let view = btree::get(src, tree, &key)?;
        let source = dup_source(src, &view);
        let current = self.dup_value.clone().unwrap_or_else(|| dup_first(src, &source));
        match dup_prev(src, &source, &current) {
            Some(v) => {
                self.dup_value = Some(v);
                self.materialize(src, tree)
            }
            None => Err(Error::NotFound),
        }
    }

    /// A plain DBI behaves as if every key had exactly one duplicate, so
    /// `FirstDup`/`LastDup` degrade to returning the current position
    /// unchanged instead of rejecting as `Incompatible`.
    fn first_dup(&mut self, src: &dyn PageSource, tree: &Tree) -> Result<(Vec<u8>, Vec<u8>)> {
        let key = self.key.clone().ok_or(Error::NotFound)?;
        if tree.dupsort {
            let view = btree::get(src, tree, &key)?;
            self.dup_value = Some(dup_first(src, &dup_source(src, &view)));
        }
        self.materialize(src, tree)
    }

    fn last_dup(&mut self, src: &dyn PageSource, tree: &Tree) -> Result<(Vec<u8>, Vec<u8>)> {
        let key = self.key.clone().ok_or(Error::NotFound)?;
        if tree.dupsort {
            let view = btree::get(src, tree, &key)?;
            self.dup_value = Some(dup_last(src, &dup_source(src, &view)));
        }
        self.materialize(src, tree)
    }

    fn get_both(&mut self, src: &dyn PageSource, tree: &Tree, key: &[u8], value: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        if !tree.dupsort {
            return Err(Error::Incompatible);
        }
        let view = btree::get(src, tree, key)?;
        let source = dup_source(src, &view);
        if dup_contains(src, &source, value) {
            self.key = Some(key.to_vec());
            self.dup_value = Some(value.to_vec());
            self.materialize(src, tree)
        } else {
            Err(Error::NotFound)
        }
    }

    fn get_both_range(
        &mut self,
        src: &dyn PageSource,
        tree: &Tree,
        key: &[u8],
        value: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        if !tree.dupsort {
            return Err(Error::Incompatible);
        }
        let view = btree::get(src, tree, key)?;
        let source = dup_source(src, &view);
        match dup_ceiling(src, &source, value) {
            Some(v) => {
                self.key = Some(key.to_vec());
                self.dup_value = Some(v);
                self.materialize(src, tree)
            }
            None => Err(Error::NotFound),
        }
    }

    /// Insert or replace at the cursor's key (DUPSORT-aware), repositioning
    /// the cursor onto the written (key, value) pair.
    pub fn put(&mut self, src: &mut dyn PageSource, tree: &mut Tree, key: &[u8], value: &[u8], flags: u32) -> Result<()> {
        if tree.dupsort {
            dupsort::put_dup(src, tree, key, value, flags)?;
        } else {
            insert::put(src, tree, key, value, flags)?;
        }
        self.key = Some(key.to_vec());
        self.dup_value = if tree.dupsort { Some(value.to_vec()) } else { None };
        Ok(())
    }

    /// Delete at the cursor's current position. For DUPSORT DBIs, `flags &
    /// NODUPDATA` removes every duplicate for the key (matching cursor_del's
    /// historical reuse of that flag); otherwise only the current duplicate
    /// is removed and the cursor lands on its successor, if any.
    pub fn del(&mut self, src: &mut dyn PageSource, tree: &mut Tree, flags: u32) -> Result<()> {
        let key = self.key.clone().ok_or(Error::NotFound)?;
        if !tree.dupsort {
            delete::delete(src, tree, &key)?;
            self.key = None;
            self.dup_value = None;
            return Ok(());
        }

        if flags & putflags::NODUPDATA != 0 {
            dupsort::del_dup(src, tree, &key, None)?;
            self.key = None;
            self.dup_value = None;
            return Ok(());
        }

        let current = {
            let view = btree::get(src, tree, &key)?;
            let source = dup_source(src, &view);
            self.dup_value.clone().unwrap_or_else(|| dup_first(src, &source))
        };
        dupsort::del_dup(src, tree, &key, Some(&current))?;

        match btree::get(src, tree, &key) {
            Ok(view) => {
                let source = dup_source(src, &view);
                self.dup_value = dup_ceiling(src, &source, &current).or_else(|| Some(dup_first(src, &source)));
            }
            Err(_) => {
                self.key = None;
                self.dup_value = None;
            }
        }
        Ok(())
    }

    /// Duplicate count at the cursor's current key (`1` for plain DBIs).
    pub fn count(&self, src: &dyn PageSource, tree: &Tree) -> Result<u64> {
        let key = self.key.clone().ok_or(Error::NotFound)?;
        if !tree.dupsort {
            btree::get(src, tree, &key)?;
            return Ok(1);
        }
        dupsort::count_dup(src, tree, &key)
    }
}
