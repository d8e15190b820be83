//! Memory-mapped geometry: file growth, mmap/remap, WriteMap vs read-only
//! projection, and page-pointer resolution.

use std::fs::File;

use memmap2::{MmapMut, MmapOptions, MmapRaw, RemapOptions};

use crate::error::{Error, Result};

/// Mapped-size geometry, all fields expressed in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub min_pages: u64,
    pub current_pages: u64,
    pub max_pages: u64,
    pub growth_step: u64,
    pub shrink_threshold: u64,
    pub page_size: usize,
}

impl Geometry {
    pub fn validate(&self) -> Result<()> {
        if self.page_size < crate::page::MIN_PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(Error::Other("page size must be a power of two and at least MIN_PAGE_SIZE"));
        }
        let os_page = page_size::get();
        if self.page_size % os_page != 0 && os_page % self.page_size != 0 {
            return Err(Error::Other("page size must divide or be a multiple of the OS page size"));
        }
        if self.min_pages == 0 || self.min_pages > self.current_pages || self.current_pages > self.max_pages {
            return Err(Error::Other("geometry must satisfy min <= current <= max"));
        }
        if self.growth_step == 0 {
            return Err(Error::Other("growth_step must be nonzero"));
        }
        Ok(())
    }

    pub fn mapped_bytes(&self) -> usize {
        self.current_pages as usize * self.page_size
    }
}

/// Owns the file handle and the live memory map, and knows how to grow both
/// in lock-step.
pub struct MmapManager {
    map: MmapRaw,
    file: File,
    geometry: Geometry,
    writemap: bool,
}

impl MmapManager {
    /// Open (and, if `geometry.current_pages` exceeds the file's current
    /// size, grow) the backing file, then establish the initial mapping.
    pub fn open(file: File, geometry: Geometry, writemap: bool) -> Result<Self> {
        geometry.validate()?;

        let wanted_len = geometry.mapped_bytes() as u64;
        let current_len = file.metadata().map_err(Error::Open)?.len();
        if current_len < wanted_len {
            file.set_len(wanted_len).map_err(|e| Error::ResizeFailed {
                size: current_len as usize,
                requested: wanted_len as usize,
                source: e,
            })?;
            file.sync_all().map_err(Error::Sync)?;
        }

        let map = if writemap {
            MmapRaw::from(unsafe {
                MmapMut::map_mut(&file).map_err(|e| Error::MapFailed {
                    requested: wanted_len as usize,
                    source: e,
                })?
            })
        } else {
            unsafe {
                MmapOptions::new()
                    .len(wanted_len as usize)
                    .map_raw(&file)
                    .map_err(|e| Error::MapFailed {
                        requested: wanted_len as usize,
                        source: e,
                    })?
            }
        };

        Ok(Self {
            map,
            file,
            geometry,
            writemap,
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn is_writemap(&self) -> bool {
        self.writemap
    }

    /// Raw `(pointer, mapped length)` of the current mapping, valid until
    /// the next [`Self::grow`]. Transactions capture this once (rather than
    /// holding a lock guard for their whole lifetime) and build their own
    /// `&self`-scoped page slices from it via `unsafe`, the same technique
    /// [`Self::page_ptr_mut`] already uses to hand out a mutable view
    /// through a shared reference.
    pub fn raw_parts(&self) -> (*const u8, usize) {
        (self.map.as_ptr(), self.geometry.mapped_bytes())
    }

    /// A full-page slice for `pgno`, valid until the next [`Self::grow`].
    pub fn page_ptr(&self, pgno: u64) -> &[u8] {
        let ps = self.geometry.page_size;
        let off = pgno as usize * ps;
        unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(off), ps) }
    }

    /// A writable full-page slice. Only meaningful in WriteMap mode; callers
    /// outside WriteMap mode must instead route writes through the dirty
    /// arena and blit on commit.
    ///
    /// # Safety
    /// The caller must ensure no other live reference (mutable or shared)
    /// aliases this page for the duration of the borrow.
    pub unsafe fn page_ptr_mut(&self, pgno: u64) -> &mut [u8] {
        debug_assert!(self.writemap, "page_ptr_mut used outside WriteMap mode");
        let ps = self.geometry.page_size;
        let off = pgno as usize * ps;
        std::slice::from_raw_parts_mut(self.map.as_mut_ptr().add(off), ps)
    }

    /// Grow the file and the mapping so `current_pages` covers at least
    /// `need_pages`. Tries an in-place remap first (Linux fast path); falls
    /// back to dropping and re-establishing the mapping elsewhere.
    pub fn grow(&mut self, need_pages: u64) -> Result<()> {
        if need_pages <= self.geometry.current_pages {
            return Ok(());
        }
        if need_pages > self.geometry.max_pages {
            return Err(Error::MapFull {
                max: self.geometry.max_pages,
            });
        }

        let stepped = need_pages
            .max(self.geometry.current_pages + self.geometry.growth_step)
            .min(self.geometry.max_pages);
        let new_len = stepped as usize * self.geometry.page_size;
        let old_len = self.geometry.mapped_bytes();

        self.file.set_len(new_len as u64).map_err(|e| Error::ResizeFailed {
            size: old_len,
            requested: new_len,
            source: e,
        })?;
        self.file.sync_all().map_err(Error::Sync)?;

        #[cfg(target_os = "linux")]
        {
            if self
                .map
                .remap(new_len, RemapOptions::new().may_move(true))
                .is_ok()
            {
                self.geometry.current_pages = stepped;
                return Ok(());
            }
        }

        let map = if self.writemap {
            MmapRaw::from(unsafe {
                MmapMut::map_mut(&self.file).map_err(|e| Error::MapFailed {
                    requested: new_len,
                    source: e,
                })?
            })
        } else {
            unsafe {
                MmapOptions::new()
                    .len(new_len)
                    .map_raw(&self.file)
                    .map_err(|e| Error::MapFailed {
                        requested: new_len,
                        source: e,
                    })?
            }
        };
        self.map = map;
        self.geometry.current_pages = stepped;
        Ok(())
    }

    /// Reserve mapped address space up to `pages` without necessarily
    /// having written any data there yet.
    pub fn pre_extend(&mut self, pages: u64) -> Result<()> {
        self.grow(pages)
    }

    #[cfg(not(windows))]
    pub fn flush(&self) -> Result<()> {
        self.map.flush().map_err(Error::Sync)
    }

    #[cfg(windows)]
    pub fn flush(&self) -> Result<()> {
        self.map.flush().map_err(Error::Sync)
    }

    pub fn flush_range(&self, pgno: u64, page_count: u64) -> Result<()> {
        let ps = self.geometry.page_size;
        let off = pgno as usize * ps;
        let len = page_count as usize * ps;
        self.map.flush_range(off, len).map_err(Error::Sync)
    }

    /// Publish one page's bytes at commit time. In WriteMap mode this is a
    /// copy into the live mapping; otherwise the mapping is read-only and we
    /// fall back to a positioned file write.
    #[cfg(unix)]
    pub fn write_at(&self, pgno: u64, bytes: &[u8]) -> Result<()> {
        if self.writemap {
            let dst = unsafe { self.page_ptr_mut(pgno) };
            dst.copy_from_slice(bytes);
            return Ok(());
        }
        use std::os::unix::fs::FileExt;
        let off = pgno * self.geometry.page_size as u64;
        self.file.write_at(bytes, off).map_err(Error::Sync)
    }

    #[cfg(windows)]
    pub fn write_at(&self, pgno: u64, bytes: &[u8]) -> Result<()> {
        if self.writemap {
            let dst = unsafe { self.page_ptr_mut(pgno) };
            dst.copy_from_slice(bytes);
            return Ok(());
        }
        use std::os::windows::fs::FileExt;
        let off = pgno * self.geometry.page_size as u64;
        self.file.seek_write(bytes, off).map_err(Error::Sync)?;
        Ok(())
    }
}
