//! The environment: the open file, its memory map, the reader table, and
//! the single-writer lock.
//!
//! A process opens one `Environment` per data file. Any number of
//! [`crate::txn::ReadTxn`]s can run concurrently against it; at most one
//! [`crate::txn::WriteTxn`] can be open at a time, enforced in-process by a
//! `Mutex` and across processes by an `fs4` advisory lock on the data file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::flags::env as eflags;
use crate::mmap::{Geometry as MmapGeometry, MmapManager};
use crate::page;
use crate::page::meta::{self, MetaPage, META_PAGE_IDS};
use crate::txn::{ReadTxn, WriteTxn};

const DEFAULT_PAGE_SIZE: usize = 4096;
const DEFAULT_MAX_READERS: usize = 126;

/// Geometry and tuning knobs set before [`EnvBuilder::open`].
#[derive(Debug, Clone, Copy)]
pub struct EnvBuilder {
    page_size: usize,
    min_pages: u64,
    max_pages: u64,
    growth_step: u64,
    shrink_threshold: u64,
    max_readers: usize,
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            min_pages: 256,
            max_pages: 1 << 20,
            growth_step: 256,
            shrink_threshold: 0,
            max_readers: DEFAULT_MAX_READERS,
        }
    }
}

impl EnvBuilder {
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// The initial mapped size, in pages. Growing past this later may move
    /// the mapping (see `MmapManager::grow`), which only the writer's own
    /// bookkeeping is guaranteed to observe; sizing generously up front
    /// avoids that mid-transaction move for workloads of a known rough size.
    pub fn min_pages(mut self, min_pages: u64) -> Self {
        self.min_pages = min_pages;
        self
    }

    pub fn max_db_size_pages(mut self, max_pages: u64) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn growth_step(mut self, growth_step: u64) -> Self {
        self.growth_step = growth_step;
        self
    }

    pub fn max_readers(mut self, max_readers: usize) -> Self {
        self.max_readers = max_readers;
        self
    }

    pub fn open(self, path: impl AsRef<Path>, flags: u32) -> Result<Environment> {
        Environment::open(path.as_ref(), flags, self)
    }
}

struct ReaderTable {
    slots: Vec<Option<u64>>,
}

impl ReaderTable {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    fn register(&mut self, txnid: u64) -> Result<usize> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(txnid);
                return Ok(i);
            }
        }
        Err(Error::ReadersFull {
            capacity: self.slots.len(),
        })
    }

    fn release(&mut self, idx: usize) {
        self.slots[idx] = None;
    }

    fn oldest(&self, default_txnid: u64) -> u64 {
        self.slots.iter().flatten().copied().min().unwrap_or(default_txnid)
    }
}

/// An open database environment: the file, its mapping, and the shared
/// bookkeeping every transaction needs.
pub struct Environment {
    mmap: RwLock<MmapManager>,
    writer_mutex: Mutex<()>,
    meta: RwLock<MetaPage>,
    active_slot: Mutex<u8>,
    readers: Mutex<ReaderTable>,
    flags: u32,
    path: PathBuf,
    _lock_file: Option<File>,
}

impl Environment {
    pub fn new() -> EnvBuilder {
        EnvBuilder::default()
    }

    fn open(path: &Path, flags: u32, opts: EnvBuilder) -> Result<Self> {
        use fs4::fs_std::FileExt;

        let mut open_opts = OpenOptions::new();
        open_opts.read(true).write(flags & eflags::READONLY == 0);
        if flags & eflags::CREATE != 0 {
            open_opts.create(true);
        }
        let file = open_opts.open(path).map_err(Error::Open)?;

        // Single-process advisory lock: writers take it exclusively for
        // the life of the environment; readers never contend for it. This
        // stands in for the full multi-process reader-table protocol.
        let lock_file = if flags & eflags::READONLY == 0 {
            file.try_lock_exclusive().map_err(Error::Lock)?;
            Some(file.try_clone().map_err(Error::Open)?)
        } else {
            None
        };

        let file_len = file.metadata().map_err(Error::Open)?.len();
        let page_size = opts.page_size;

        let existing = if file_len >= (META_PAGE_IDS.len() * page::MIN_PAGE_SIZE) as u64 {
            read_existing_meta(&file, page_size)?
        } else {
            None
        };

        let (meta, active_slot) = match existing {
            Some(found) => found,
            None => {
                let geometry = meta::Geometry {
                    min_pages: opts.min_pages,
                    current_pages: opts.min_pages,
                    max_pages: opts.max_pages,
                    growth_step: opts.growth_step,
                    shrink_threshold: opts.shrink_threshold,
                };
                let mut fresh = MetaPage::new(page_size as u32, geometry);
                fresh.last_pgno = META_PAGE_IDS.len() as u64;
                fresh.txnid = 0;
                (fresh, 1u8)
            }
        };

        let mmap_geometry = MmapGeometry {
            min_pages: meta.geometry.min_pages,
            current_pages: meta.geometry.current_pages.max(meta.last_pgno),
            max_pages: meta.geometry.max_pages,
            growth_step: meta.geometry.growth_step,
            shrink_threshold: meta.geometry.shrink_threshold,
            page_size,
        };
        let writemap = flags & eflags::WRITEMAP != 0;
        let mmap = MmapManager::open(file, mmap_geometry, writemap)?;

        let env = Self {
            mmap: RwLock::new(mmap),
            writer_mutex: Mutex::new(()),
            meta: RwLock::new(meta),
            active_slot: Mutex::new(active_slot),
            readers: Mutex::new(ReaderTable::new(opts.max_readers)),
            flags,
            path: path.to_path_buf(),
            _lock_file: lock_file,
        };

        if existing.is_none() {
            log::debug!("creating fresh environment at {:?} (page size {page_size})", path);
            env.bootstrap_fresh_meta(meta)?;
        } else {
            log::debug!("opened existing environment at {:?} (txnid {}, active slot {})", path, meta.txnid, active_slot);
        }

        Ok(env)
    }

    fn bootstrap_fresh_meta(&self, mut meta: MetaPage) -> Result<()> {
        let mmap = self.mmap.read().unwrap();
        for &pgno in &META_PAGE_IDS {
            let mut page = vec![0u8; meta.pagesize as usize];
            meta::write_meta(&mut page, pgno, &mut meta);
            mmap.write_at(pgno, &page)?;
        }
        mmap.flush()?;
        Ok(())
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.mmap.read().unwrap().geometry().page_size
    }

    pub(crate) fn current_meta(&self) -> MetaPage {
        *self.meta.read().unwrap()
    }

    pub(crate) fn meta_geometry(&self) -> meta::Geometry {
        let mmap_geom = self.mmap.read().unwrap().geometry();
        meta::Geometry {
            min_pages: mmap_geom.min_pages,
            current_pages: mmap_geom.current_pages,
            max_pages: mmap_geom.max_pages,
            growth_step: mmap_geom.growth_step,
            shrink_threshold: mmap_geom.shrink_threshold,
        }
    }

    pub(crate) fn mmap_raw_parts(&self) -> (*const u8, usize) {
        self.mmap.read().unwrap().raw_parts()
    }

    pub(crate) fn grow_mmap(&self, need_pages: u64) -> Result<(*const u8, usize)> {
        let mut mmap = self.mmap.write().unwrap();
        mmap.grow(need_pages)?;
        log::debug!("grew mmap to {need_pages} pages");
        Ok(mmap.raw_parts())
    }

    pub(crate) fn write_page(&self, pgno: u64, bytes: &[u8]) -> Result<()> {
        let mmap = self.mmap.read().unwrap();
        mmap.write_at(pgno, bytes)
    }

    pub(crate) fn flush_data(&self) -> Result<()> {
        self.mmap.read().unwrap().flush()
    }

    /// Write the meta slot that was *not* active before this commit and
    /// make it the new active slot. This is the atomic publication point:
    /// a crash before the checksummed write completes leaves the previous
    /// meta (and thus the previous, still-consistent database state) as
    /// the one future opens will see.
    pub(crate) fn publish_meta(&self, mut new_meta: MetaPage, sync: bool) -> Result<()> {
        let mut active = self.active_slot.lock().unwrap();
        let inactive_slot = 1 - *active;
        let mmap = self.mmap.read().unwrap();
        let mut page = vec![0u8; new_meta.pagesize as usize];
        meta::write_meta(&mut page, META_PAGE_IDS[inactive_slot as usize], &mut new_meta);
        mmap.write_at(META_PAGE_IDS[inactive_slot as usize], &page)?;
        if sync {
            mmap.flush()?;
        }
        *active = inactive_slot;
        drop(mmap);
        *self.meta.write().unwrap() = new_meta;
        log::trace!("published meta slot {inactive_slot} at txnid {}", new_meta.txnid);
        Ok(())
    }

    pub(crate) fn lock_writer(&self) {
        // Safety valve: `WriteTxn::begin` only ever runs on one thread at a
        // time per environment handle, and `std::sync::Mutex` does not
        // expose a borrow we can hold across `WriteTxn`'s lifetime without
        // self-referential storage, so we take and immediately release a
        // guard purely for its blocking-until-available side effect and
        // rely on `unlock_writer` (from `Drop`) to pair with it.
        std::mem::forget(self.writer_mutex.lock().unwrap());
    }

    pub(crate) fn unlock_writer(&self) {
        // Safety: pairs with the `forget`-based acquire in `lock_writer`;
        // there is exactly one outstanding "forgotten" guard per `WriteTxn`.
        unsafe {
            self.writer_mutex.force_unlock();
        }
    }

    pub(crate) fn register_reader(&self, txnid: u64) -> Result<usize> {
        self.readers.lock().unwrap().register(txnid).inspect_err(|e| {
            log::warn!("reader table full: {e}");
        })
    }

    pub(crate) fn release_reader(&self, idx: usize) {
        self.readers.lock().unwrap().release(idx);
    }

    pub(crate) fn oldest_reader_txnid(&self, default_txnid: u64) -> u64 {
        self.readers.lock().unwrap().oldest(default_txnid)
    }

    /// Begin a read-only snapshot transaction.
    pub fn begin_ro(&self) -> Result<ReadTxn<'_>> {
        ReadTxn::begin(self)
    }

    /// Begin the single write transaction. Blocks until any other writer
    /// (in this process) has committed or aborted.
    pub fn begin_rw(&self) -> Result<WriteTxn<'_>> {
        WriteTxn::begin(self)
    }
}

/// Read both meta-page slots and pick the one with the higher valid txnid.
/// If neither validates, the file is corrupt.
///
/// The real page size lives inside the meta payload, not in `EnvBuilder`,
/// so an existing file's own page size always wins on reopen: probe at the
/// smallest possible stride first (every meta page fits within
/// `MIN_PAGE_SIZE`), then re-probe at the real stride if it differs from
/// what was configured.
fn read_existing_meta(file: &File, configured_page_size: usize) -> Result<Option<(MetaPage, u8)>> {
    let probe = scan_meta_slots(file, page::MIN_PAGE_SIZE)?;
    let real_page_size = probe.iter().flatten().next().map(|m| m.pagesize as usize);
    let candidates = match real_page_size {
        Some(ps) if ps != configured_page_size => scan_meta_slots(file, ps)?,
        _ => probe,
    };
    pick_active(candidates)
}

fn scan_meta_slots(file: &File, page_size: usize) -> Result<[Option<MetaPage>; 2]> {
    let mut candidates = [None; 2];
    for (i, &pgno) in META_PAGE_IDS.iter().enumerate() {
        let mut buf = vec![0u8; page_size];
        read_page_at(file, pgno, page_size, &mut buf)?;
        candidates[i] = meta::read_meta(&buf);
    }
    Ok(candidates)
}

fn pick_active(candidates: [Option<MetaPage>; 2]) -> Result<Option<(MetaPage, u8)>> {
    match (candidates[0], candidates[1]) {
        (None, None) => Err(Error::Corrupted("neither meta page slot is valid")),
        (Some(a), None) => Ok(Some((a, 0))),
        (None, Some(b)) => Ok(Some((b, 1))),
        (Some(a), Some(b)) if a.txnid >= b.txnid => Ok(Some((a, 0))),
        (Some(_), Some(b)) => Ok(Some((b, 1))),
    }
}

#[cfg(unix)]
fn read_page_at(file: &File, pgno: u64, page_size: usize, buf: &mut [u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, pgno * page_size as u64).map_err(Error::Open)
}

#[cfg(windows)]
fn read_page_at(file: &File, pgno: u64, page_size: usize, buf: &mut [u8]) -> Result<()> {
    use std::os::windows::fs::FileExt;
    let off = pgno * page_size as u64;
    let mut read = 0;
    while read < buf.len() {
        let n = file.seek_read(&mut buf[read..], off + read as u64).map_err(Error::Open)?;
        if n == 0 {
            return Err(Error::Corrupted("short read on meta page"));
        }
        read += n;
    }
    Ok(())
}
