//! Read and write transactions.
//!
//! `ReadTxn` is a long-lived, cheap snapshot: it pins a `txnid` in the
//! reader table and sees exactly the meta page that was active when it
//! began, for as long as it lives. `WriteTxn` is the single mutable view of
//! the database; only one can exist at a time (enforced by the
//! environment's writer mutex) and it implements [`btree::PageSource`] by
//! wiring together the dirty page arena, the mmap, and GC bookkeeping.

use std::collections::HashMap;

use crate::btree::{self, PageSource, Tree};
use crate::dirty::DirtyArena;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::flags::{dbi as dflags, env as eflags, put as putflags};
use crate::gc::GcState;
use crate::page::meta::{DbiRecord, MetaPage, NO_ROOT};
use crate::page::node;

/// A read-only snapshot. Never blocks a writer and is never blocked by one;
/// it simply keeps seeing the meta page that was current at `begin`.
pub struct ReadTxn<'env> {
    env: &'env Environment,
    meta: MetaPage,
    reader_slot: usize,
    mmap_ptr: *const u8,
    mmap_len: usize,
    page_size: usize,
    _not_send: std::marker::PhantomData<std::cell::Cell<()>>,
}

impl<'env> ReadTxn<'env> {
    pub(crate) fn begin(env: &'env Environment) -> Result<Self> {
        let meta = env.current_meta();
        let reader_slot = env.register_reader(meta.txnid)?;
        log::trace!("begin read txn pinned at txnid {} (slot {reader_slot})", meta.txnid);
        let (mmap_ptr, mmap_len) = env.mmap_raw_parts();
        Ok(Self {
            env,
            meta,
            reader_slot,
            mmap_ptr,
            mmap_len,
            page_size: meta.pagesize as usize,
            _not_send: std::marker::PhantomData,
        })
    }

    pub fn txnid(&self) -> u64 {
        self.meta.txnid
    }

    fn page_slice(&self, pgno: u64) -> &[u8] {
        let off = pgno as usize * self.page_size;
        assert!(off + self.page_size <= self.mmap_len, "page {pgno} out of range");
        // Safety: the reader's registered txnid keeps every page reachable
        // from `self.meta` alive in gcDBI (no writer will recycle it), and
        // `mmap_ptr`/`mmap_len` were captured once at `begin` from a mapping
        // only the writer can move (via `grow`), which a registered reader
        // blocks by holding the mmap's read lock for the duration of a call.
        unsafe { std::slice::from_raw_parts(self.mmap_ptr.add(off), self.page_size) }
    }

    fn main_tree(&self) -> Tree {
        let root = (self.meta.main_dbi.root_pgno != NO_ROOT).then_some(self.meta.main_dbi.root_pgno);
        Tree::from_flags(root, self.meta.main_dbi.flags)
    }

    /// Open a named DBI for reading. `flags` is ignored beyond validating
    /// the handle is actually DUPSORT-compatible for DUPSORT-only callers;
    /// a read transaction can never create a DBI.
    pub fn open_dbi(&self, name: &str) -> Result<Tree> {
        let main = self.main_tree();
        let view = btree::get(self, &main, name.as_bytes())?;
        let record: DbiRecord = *bytemuck::from_bytes(view.data);
        let root = (!record.is_empty_tree()).then_some(record.root_pgno);
        Ok(Tree::from_flags(root, record.flags))
    }

    pub fn get(&self, tree: &Tree, key: &[u8]) -> Result<Vec<u8>> {
        let view = btree::get(self, tree, key)?;
        Ok(resolve_value(self, &view))
    }

    pub fn cursor(&self) -> crate::cursor::Cursor {
        crate::cursor::Cursor::new()
    }
}

impl PageSource for ReadTxn<'_> {
    fn page_size(&self) -> usize {
        self.page_size
    }
    fn read(&self, pgno: u64) -> &[u8] {
        self.page_slice(pgno)
    }
    fn write(&mut self, _pgno: u64) -> &mut [u8] {
        unreachable!("ReadTxn never mutates pages")
    }
    fn alloc(&mut self) -> Result<u64> {
        unreachable!("ReadTxn never allocates pages")
    }
    fn alloc_contiguous(&mut self, _n: usize) -> Result<u64> {
        unreachable!("ReadTxn never allocates pages")
    }
    fn free(&mut self, _pgno: u64) {
        unreachable!("ReadTxn never frees pages")
    }
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        log::trace!("release read txn pinned at txnid {} (slot {})", self.meta.txnid, self.reader_slot);
        self.env.release_reader(self.reader_slot);
    }
}

/// The single writable transaction. Holds the writer mutex (via the
/// environment) for its entire lifetime, and a read lock on the mmap
/// manager just long enough to snapshot its raw pointer/length; it is
/// re-snapshotted after any [`Self::ensure_mapped`]-triggered grow.
pub struct WriteTxn<'env> {
    env: &'env Environment,
    next_txnid: u64,
    page_size: usize,
    mmap_ptr: *const u8,
    mmap_len: usize,
    dirty: DirtyArena,
    gc: GcState,
    last_pgno: u64,
    oldest_reader: u64,
    main_dbi: DbiRecord,
    main_tree: Tree,
    gc_dbi: DbiRecord,
    /// DBIs opened or created this transaction, keyed by name. Flushed back
    /// into MainDBI at commit.
    open_dbis: HashMap<String, Tree>,
    flags: u32,
    finished: bool,
    _not_send: std::marker::PhantomData<std::cell::Cell<()>>,
}

impl<'env> WriteTxn<'env> {
    pub(crate) fn begin(env: &'env Environment) -> Result<Self> {
        if env.flags() & eflags::READONLY != 0 {
            return Err(Error::Other("environment was opened READONLY"));
        }
        env.lock_writer();
        let meta = env.current_meta();
        let (mmap_ptr, mmap_len) = env.mmap_raw_parts();
        let gc_root = (meta.gc_dbi.root_pgno != NO_ROOT).then_some(meta.gc_dbi.root_pgno);
        let main_root = (meta.main_dbi.root_pgno != NO_ROOT).then_some(meta.main_dbi.root_pgno);
        // With no active readers, everything up to (and including) the
        // previous commit is safe to reclaim: default to one past it.
        let oldest_reader = env.oldest_reader_txnid(meta.txnid + 1);
        log::trace!("begin write txn {} (oldest reader {})", meta.txnid + 1, oldest_reader);
        Ok(Self {
            env,
            next_txnid: meta.txnid + 1,
            page_size: meta.pagesize as usize,
            mmap_ptr,
            mmap_len,
            dirty: DirtyArena::new(meta.pagesize as usize),
            gc: GcState::new(Tree::from_flags(gc_root, 0)),
            last_pgno: meta.last_pgno,
            oldest_reader,
            main_dbi: meta.main_dbi,
            main_tree: Tree::from_flags(main_root, meta.main_dbi.flags),
            gc_dbi: meta.gc_dbi,
            open_dbis: HashMap::new(),
            flags: env.flags(),
            finished: false,
            _not_send: std::marker::PhantomData,
        })
    }

    pub fn txnid(&self) -> u64 {
        self.next_txnid
    }

    fn page_slice(&self, pgno: u64) -> &[u8] {
        let off = pgno as usize * self.page_size;
        assert!(off + self.page_size <= self.mmap_len, "page {pgno} out of range");
        unsafe { std::slice::from_raw_parts(self.mmap_ptr.add(off), self.page_size) }
    }

    fn ensure_mapped(&mut self, pgno: u64) -> Result<()> {
        let need_pages = pgno + 1;
        if (need_pages as usize) * self.page_size <= self.mmap_len {
            return Ok(());
        }
        let (ptr, len) = self.env.grow_mmap(need_pages)?;
        self.mmap_ptr = ptr;
        self.mmap_len = len;
        Ok(())
    }

    /// Open (and, with `CREATE`, create) a named DBI for this transaction.
    /// Creation is a plain `MainDBI` put: it only becomes visible to other
    /// transactions once this one commits and publishes a new meta page, so
    /// no separate staging is needed.
    pub fn open_dbi(&mut self, name: &str, flags: u32) -> Result<Tree> {
        if let Some(tree) = self.open_dbis.get(name) {
            return Ok(*tree);
        }
        match btree::get(self, &self.main_tree.clone(), name.as_bytes()) {
            Ok(view) => {
                let record: DbiRecord = *bytemuck::from_bytes(view.data);
                let root = (!record.is_empty_tree()).then_some(record.root_pgno);
                let tree = Tree::from_flags(root, record.flags);
                self.open_dbis.insert(name.to_string(), tree);
                Ok(tree)
            }
            Err(Error::NotFound) if flags & dflags::CREATE != 0 => {
                let dbi_flags = (flags & (dflags::DUPSORT | dflags::DUPFIXED | dflags::INTEGERKEY)) as u16;
                let record = DbiRecord::empty(dbi_flags);
                let mut main = self.main_tree;
                btree::insert::put(self, &mut main, name.as_bytes(), bytemuck::bytes_of(&record), 0)?;
                self.main_tree = main;
                let tree = Tree::from_flags(None, dbi_flags);
                self.open_dbis.insert(name.to_string(), tree);
                Ok(tree)
            }
            Err(e) => Err(e),
        }
    }

    /// Persist `tree`'s current root back into the transaction's view of
    /// the named DBI, so later `get`s in the same transaction (and the
    /// MainDBI flush at commit) see the change. Must be called after any
    /// mutation that might have changed `tree.root` (insert/delete/cursor
    /// put/del on that DBI).
    pub fn update_dbi(&mut self, name: &str, tree: Tree) {
        self.open_dbis.insert(name.to_string(), tree);
    }

    pub fn main_tree(&self) -> Tree {
        self.main_tree
    }

    /// Abort the transaction: drop all dirty shadows and release the
    /// writer lock. No on-disk state changes.
    pub fn abort(mut self) {
        log::debug!("abort write txn {} ({} dirty pages discarded)", self.next_txnid, self.dirty.len());
        self.finished = true;
        self.dirty.clear();
    }

    /// Run the five-step commit protocol: flush dirty DBI records into
    /// MainDBI, run GC housekeeping, write dirty pages out, publish the
    /// inactive meta slot, and release the writer lock.
    pub fn commit(mut self) -> Result<()> {
        // 1. Flush every DBI touched this transaction back into MainDBI.
        let names: Vec<String> = self.open_dbis.keys().cloned().collect();
        for name in names {
            let tree = self.open_dbis[&name];
            let mut record = DbiRecord::empty(dbi_flags_of(&tree));
            record.root_pgno = tree.root.unwrap_or(NO_ROOT);
            record.mod_txnid = self.next_txnid;
            let mut main = self.main_tree;
            btree::insert::put(&mut self, &mut main, name.as_bytes(), bytemuck::bytes_of(&record), 0)?;
            self.main_tree = main;
        }

        // 2. GC housekeeping: record this transaction's frees (loanback
        // breaks the recursive-allocation cycle inside `record`).
        let next_txnid = self.next_txnid;
        let mut gc = std::mem::replace(&mut self.gc, GcState::new(empty_tree()));
        gc.record(&mut self, next_txnid)?;
        gc.finish();
        self.gc = gc;

        // 3. Write every dirty page out to its mmap offset.
        let dirty_pgnos: Vec<u64> = self.dirty.dirty_pgnos().collect();
        for pgno in &dirty_pgnos {
            let buf = self.dirty.get(*pgno).expect("dirty_pgnos is exact").to_vec();
            self.env.write_page(*pgno, &buf)?;
        }
        if self.flags & eflags::NOSYNC == 0 {
            self.env.flush_data()?;
        }
        log::debug!("txn {}: wrote {} dirty pages", self.next_txnid, dirty_pgnos.len());

        // 4. Publish the inactive meta slot: new roots, last_pgno, txnid.
        let mut meta = MetaPage::new(self.page_size as u32, self.env.meta_geometry());
        meta.main_dbi = DbiRecord {
            root_pgno: self.main_tree.root.unwrap_or(NO_ROOT),
            flags: self.main_dbi.flags,
            mod_txnid: self.next_txnid,
            ..self.main_dbi
        };
        meta.gc_dbi = DbiRecord {
            root_pgno: self.gc.tree().root.unwrap_or(NO_ROOT),
            flags: self.gc_dbi.flags,
            mod_txnid: self.next_txnid,
            ..self.gc_dbi
        };
        meta.last_pgno = self.last_pgno;
        meta.txnid = self.next_txnid;
        self.env.publish_meta(meta, self.flags & eflags::NOMETASYNC == 0)?;
        log::debug!("commit txn {} (last_pgno {})", self.next_txnid, self.last_pgno);

        self.finished = true;
        self.dirty.clear();
        Ok(())
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.dirty.clear();
        }
        self.env.unlock_writer();
    }
}

impl PageSource for WriteTxn<'_> {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, pgno: u64) -> &[u8] {
        if let Some(buf) = self.dirty.get(pgno) {
            return buf;
        }
        self.page_slice(pgno)
    }

    fn write(&mut self, pgno: u64) -> &mut [u8] {
        if self.dirty.is_dirty(pgno) {
            return self.dirty.get_mut(pgno).expect("just checked dirty");
        }
        let source = self.page_slice(pgno).to_vec();
        self.dirty.shadow(pgno, &source)
    }

    fn alloc(&mut self) -> Result<u64> {
        let oldest_reader = self.oldest_reader;
        let mut last_pgno = self.last_pgno;
        // `gc.allocate` may itself need to write/alloc pages for the gcDBI
        // tree, i.e. re-enter this same `PageSource` impl. Move `gc` out
        // first so `self` is free to be borrowed as the page source.
        let mut gc = std::mem::replace(&mut self.gc, GcState::new(empty_tree()));
        let pgnos = gc.allocate(self, oldest_reader, 1, &mut last_pgno)?;
        self.gc = gc;
        self.last_pgno = last_pgno;
        let pgno = pgnos[0];
        self.ensure_mapped(pgno)?;
        self.dirty.shadow_fresh(pgno);
        Ok(pgno)
    }

    /// Allocate a contiguous run by always growing past `last_pgno`,
    /// bypassing the free list entirely: GC-reclaimed pages are scattered
    /// across the file and would break the adjacency an OVERFLOW chain
    /// relies on.
    fn alloc_contiguous(&mut self, n: usize) -> Result<u64> {
        let head = self.last_pgno + 1;
        self.ensure_mapped(head + n as u64 - 1)?;
        for i in 0..n as u64 {
            self.dirty.shadow_fresh(head + i);
        }
        self.last_pgno += n as u64;
        Ok(head)
    }

    fn free(&mut self, pgno: u64) {
        self.dirty.discard(pgno);
        self.gc.free(pgno);
    }
}

impl WriteTxn<'_> {
    pub fn get(&self, tree: &Tree, key: &[u8]) -> Result<Vec<u8>> {
        let view = btree::get(self, tree, key)?;
        Ok(resolve_value(self, &view))
    }

    /// Insert or replace `key`/`value` in the named DBI, dispatching to the
    /// DUPSORT path if the DBI was opened with it, and writing the possibly
    /// new root back into this transaction's DBI table.
    pub fn put(&mut self, name: &str, key: &[u8], value: &[u8], flags: u32) -> Result<()> {
        let mut tree = *self.open_dbis.get(name).ok_or(Error::BadDbi)?;
        if tree.dupsort {
            btree::dupsort::put_dup(self, &mut tree, key, value, flags)?;
        } else {
            btree::insert::put(self, &mut tree, key, value, flags)?;
        }
        self.open_dbis.insert(name.to_string(), tree);
        Ok(())
    }

    /// Delete `key` from the named DBI. For DUPSORT DBIs, `value` narrows
    /// the delete to a single duplicate; `None` removes the whole key.
    pub fn del(&mut self, name: &str, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let mut tree = *self.open_dbis.get(name).ok_or(Error::BadDbi)?;
        if tree.dupsort {
            btree::dupsort::del_dup(self, &mut tree, key, value)?;
        } else {
            btree::delete::delete(self, &mut tree, key)?;
        }
        self.open_dbis.insert(name.to_string(), tree);
        Ok(())
    }

    /// `RESERVE`: insert `len` placeholder bytes under `key` and hand back a
    /// writable slice into the node's dirty page for the caller to fill
    /// directly, avoiding a separate caller-side buffer and copy. Not
    /// supported for DUPSORT DBIs (there is no single node to reserve into)
    /// or for values that would need an `OVERFLOW` chain (that chain's
    /// pages aren't contiguous with the node itself).
    pub fn reserve(&mut self, name: &str, key: &[u8], len: usize, flags: u32) -> Result<&mut [u8]> {
        if len > btree::max_inline_value(self.page_size) {
            return Err(Error::BadValSize("RESERVE does not support values that require an overflow chain"));
        }
        let mut tree = *self.open_dbis.get(name).ok_or(Error::BadDbi)?;
        if tree.dupsort {
            return Err(Error::Incompatible);
        }
        let placeholder = vec![0u8; len];
        btree::insert::put_kv(self, &mut tree, key, &placeholder, 0, flags & !putflags::RESERVE)?;
        self.open_dbis.insert(name.to_string(), tree);

        let cmp = tree.cmp();
        let root = tree.root.expect("put_kv always leaves a root behind");
        let descent = btree::search::descend(self, root, key, cmp);
        let leaf_pgno = descent.leaf_pgno;
        let idx = match btree::search::leaf_search(self.read(leaf_pgno), key, cmp) {
            btree::search::LeafSearch::Found(i) => i,
            btree::search::LeafSearch::NotFound(_) => unreachable!("value was just inserted"),
        };
        Ok(node::node_data_mut(self.write(leaf_pgno), idx))
    }

    /// `MULTIPLE`: insert several fixed-size duplicate values for `key` from
    /// one contiguous buffer, `elem_size` bytes at a time. Requires a
    /// DUPSORT DBI; each record is put independently through the same
    /// DUPSORT path a single `put` would use; on a `DUPFIXED` DBI they share
    /// the promoted sub-tree's single-size assumption.
    pub fn put_multiple(&mut self, name: &str, key: &[u8], elem_size: usize, values: &[u8], flags: u32) -> Result<()> {
        if elem_size == 0 || values.len() % elem_size != 0 {
            return Err(Error::BadValSize("MULTIPLE buffer length is not a multiple of elem_size"));
        }
        let mut tree = *self.open_dbis.get(name).ok_or(Error::BadDbi)?;
        if !tree.dupsort {
            return Err(Error::Incompatible);
        }
        let put_flags = flags & !putflags::MULTIPLE;
        for chunk in values.chunks_exact(elem_size) {
            btree::dupsort::put_dup(self, &mut tree, key, chunk, put_flags)?;
        }
        self.open_dbis.insert(name.to_string(), tree);
        Ok(())
    }
}

/// Resolve a node's value bytes, following a `BIGDATA` overflow chain if
/// needed. Shared by `ReadTxn::get` and `WriteTxn::get`-style lookups.
fn resolve_value(src: &dyn PageSource, view: &crate::page::node::NodeView) -> Vec<u8> {
    if view.is_bigdata() {
        let head = u64::from_le_bytes(view.data[..8].try_into().unwrap());
        let len = u64::from_le_bytes(view.data[8..16].try_into().unwrap()) as usize;
        btree::read_overflow(src, head, len, src.page_size())
    } else {
        view.data.to_vec()
    }
}

fn empty_tree() -> Tree {
    Tree {
        root: None,
        dupsort: false,
        dupfixed: false,
        integerkey: false,
    }
}

fn dbi_flags_of(tree: &Tree) -> u16 {
    let mut f = 0u16;
    if tree.dupsort {
        f |= dflags::DUPSORT as u16;
    }
    if tree.dupfixed {
        f |= dflags::DUPFIXED as u16;
    }
    if tree.integerkey {
        f |= dflags::INTEGERKEY as u16;
    }
    f
}
