//! `SUBPAGE`: a miniature inline leaf holding the duplicate values for one
//! DUPSORT key, stored as that key's node value until it outgrows its
//! page-relative budget and gets promoted to a real sub-tree.
//!
//! Reduced-alignment header compared to a full page: 8 bytes of
//! `{flags, lower, upper}` instead of the 20-byte `PageHeader` a real page
//! carries, since a sub-page never needs its own `page_id`.

use bytemuck::{Pod, Zeroable};
use byteorder::{ByteOrder, LittleEndian};

use crate::error::PageFull;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct SubpageHeader {
    pub flags: u16,
    pub lower: u16,
    pub upper: u16,
    _pad: u16,
}

pub const SUBPAGE_HEADER_SIZE: usize = std::mem::size_of::<SubpageHeader>();
const _: () = assert!(SUBPAGE_HEADER_SIZE == 8);

const PTR_SIZE: usize = 2;
const LEN_PREFIX_SIZE: usize = 2;

fn header(buf: &[u8]) -> &SubpageHeader {
    bytemuck::from_bytes(&buf[..SUBPAGE_HEADER_SIZE])
}

fn header_mut(buf: &mut [u8]) -> &mut SubpageHeader {
    bytemuck::from_bytes_mut(&mut buf[..SUBPAGE_HEADER_SIZE])
}

/// Initialize a fresh sub-page occupying exactly `capacity` bytes (the
/// caller's chosen promotion budget, typically a quarter of the main page
/// size).
pub fn init(buf: &mut [u8], flags: u16, capacity: usize) {
    debug_assert_eq!(buf.len(), capacity);
    buf.fill(0);
    let h = SubpageHeader {
        flags,
        lower: SUBPAGE_HEADER_SIZE as u16,
        upper: capacity as u16,
        _pad: 0,
    };
    buf[..SUBPAGE_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&h));
}

pub fn flags(buf: &[u8]) -> u16 {
    header(buf).flags
}

pub fn count(buf: &[u8]) -> usize {
    (header(buf).lower as usize - SUBPAGE_HEADER_SIZE) / PTR_SIZE
}

fn ptr_offset(idx: usize) -> usize {
    SUBPAGE_HEADER_SIZE + idx * PTR_SIZE
}

fn read_ptr(buf: &[u8], idx: usize) -> u16 {
    let off = ptr_offset(idx);
    LittleEndian::read_u16(&buf[off..off + 2])
}

fn write_ptr(buf: &mut [u8], idx: usize, value: u16) {
    let off = ptr_offset(idx);
    LittleEndian::write_u16(&mut buf[off..off + 2], value);
}

pub fn get(buf: &[u8], idx: usize) -> &[u8] {
    let ptr = read_ptr(buf, idx) as usize;
    let len = LittleEndian::read_u16(&buf[ptr..ptr + 2]) as usize;
    &buf[ptr + 2..ptr + 2 + len]
}

pub fn free_space(buf: &[u8]) -> usize {
    let h = header(buf);
    (h.upper as usize).saturating_sub(h.lower as usize + PTR_SIZE)
}

/// Bytes currently occupied (header + pointers + packed values), used to
/// check the sub-page's promotion budget.
pub fn used_bytes(buf: &[u8], capacity: usize) -> usize {
    let h = header(buf);
    (h.lower as usize) + (capacity - h.upper as usize)
}

fn aligned_entry_size(val_len: usize) -> usize {
    let raw = LEN_PREFIX_SIZE + val_len;
    (raw + 1) & !1
}

/// Binary search for an exact duplicate value.
pub fn search(buf: &[u8], value: &[u8]) -> Result<usize, usize> {
    let n = count(buf);
    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match get(buf, mid).cmp(value) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

pub fn insert(buf: &mut [u8], idx: usize, value: &[u8]) -> Result<(), PageFull> {
    let size = aligned_entry_size(value.len());
    if free_space(buf) < size {
        return Err(PageFull { needed: size });
    }

    let h = header(buf);
    let count = (h.lower as usize - SUBPAGE_HEADER_SIZE) / PTR_SIZE;
    let new_upper = h.upper as usize - size;
    debug_assert!(idx <= count);

    for i in (idx..count).rev() {
        let v = read_ptr(buf, i);
        write_ptr(buf, i + 1, v);
    }

    LittleEndian::write_u16(&mut buf[new_upper..new_upper + 2], value.len() as u16);
    buf[new_upper + 2..new_upper + 2 + value.len()].copy_from_slice(value);
    write_ptr(buf, idx, new_upper as u16);

    let h = header_mut(buf);
    h.lower += PTR_SIZE as u16;
    h.upper = new_upper as u16;
    Ok(())
}

pub fn remove(buf: &mut [u8], idx: usize) {
    let h = header(buf);
    let count = (h.lower as usize - SUBPAGE_HEADER_SIZE) / PTR_SIZE;
    debug_assert!(idx < count);
    for i in idx..(count - 1) {
        let v = read_ptr(buf, i + 1);
        write_ptr(buf, i, v);
    }
    let h = header_mut(buf);
    h.lower -= PTR_SIZE as u16;
}

/// Repack the value area contiguously, reclaiming holes left by removals.
pub fn compact(buf: &mut [u8], capacity: usize) {
    let count = count(buf);
    if count == 0 {
        header_mut(buf).upper = capacity as u16;
        return;
    }
    let values: Vec<Vec<u8>> = (0..count).map(|i| get(buf, i).to_vec()).collect();
    let mut upper = capacity;
    for (i, v) in values.iter().enumerate() {
        let size = LEN_PREFIX_SIZE + v.len();
        upper -= size;
        LittleEndian::write_u16(&mut buf[upper..upper + 2], v.len() as u16);
        buf[upper + 2..upper + 2 + v.len()].copy_from_slice(v);
        write_ptr(buf, i, upper as u16);
    }
    header_mut(buf).upper = upper as u16;
}

/// Iterate all duplicate values in sorted order.
pub fn iter(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    (0..count(buf)).map(move |i| get(buf, i))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_insert_and_iterate() {
        let capacity = 256;
        let mut buf = vec![0u8; capacity];
        init(&mut buf, 0, capacity);
        for v in [b"delta".as_slice(), b"alpha", b"charlie", b"bravo"] {
            let pos = search(&buf, v).unwrap_err();
            insert(&mut buf, pos, v).unwrap();
        }
        let got: Vec<&[u8]> = iter(&buf).collect();
        assert_eq!(got, vec![b"alpha".as_slice(), b"bravo", b"charlie", b"delta"]);
    }

    #[test]
    fn budget_exceeded_reports_needed() {
        let capacity = 64;
        let mut buf = vec![0u8; capacity];
        init(&mut buf, 0, capacity);
        let mut i = 0;
        loop {
            let v = format!("value-{i:04}");
            match insert(&mut buf, i, v.as_bytes()) {
                Ok(()) => i += 1,
                Err(e) => {
                    assert!(e.needed > 0);
                    break;
                }
            }
        }
        assert!(i > 0);
    }
}
