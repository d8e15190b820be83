//! `LEAF2` pages: the fixed-size duplicate-record codec used by `DUPFIXED`
//! sub-trees. No node headers and no pointer array — just a packed,
//! sorted array of equal-size records starting right after the page
//! header. The record size is stashed in the page header's `extra` slot
//! (otherwise unused for this page kind).

use super::header::{header_of, header_of_mut, PAGE_HEADER_SIZE};
use crate::error::PageFull;

pub fn record_size(page: &[u8]) -> usize {
    header_of(page).extra as usize
}

pub fn set_record_size(page: &mut [u8], size: usize) {
    header_of_mut(page).extra = size as u32;
}

/// Number of records currently on the page, derived from `lower`.
pub fn count(page: &[u8]) -> usize {
    let rs = record_size(page);
    if rs == 0 {
        return 0;
    }
    (header_of(page).lower as usize - PAGE_HEADER_SIZE) / rs
}

/// How many records of `record_size` fit on a page of `page_size` bytes.
pub fn capacity(page_size: usize, record_size: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE) / record_size
}

pub fn get(page: &[u8], idx: usize) -> &[u8] {
    let rs = record_size(page);
    let off = PAGE_HEADER_SIZE + idx * rs;
    &page[off..off + rs]
}

/// Binary search for `key` among the packed records. `Ok(idx)` on an exact
/// match, `Err(idx)` with the insertion point otherwise.
pub fn search(page: &[u8], key: &[u8]) -> Result<usize, usize> {
    let n = count(page);
    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match get(page, mid).cmp(key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

/// Insert `record` (must be exactly `record_size(page)` bytes) at `idx`,
/// shifting later records right.
pub fn insert(page: &mut [u8], idx: usize, record: &[u8]) -> Result<(), PageFull> {
    let rs = record_size(page);
    debug_assert_eq!(record.len(), rs, "record size mismatch for this LEAF2 page");
    let cnt = count(page);
    let cap = capacity(page.len(), rs);
    if cnt >= cap {
        return Err(PageFull { needed: rs });
    }

    let base = PAGE_HEADER_SIZE;
    for i in (idx..cnt).rev() {
        let src = base + i * rs;
        let dst = base + (i + 1) * rs;
        page.copy_within(src..src + rs, dst);
    }
    let dst = base + idx * rs;
    page[dst..dst + rs].copy_from_slice(record);

    header_of_mut(page).lower += rs as u16;
    Ok(())
}

/// Remove the record at `idx`, shifting later records left.
pub fn remove(page: &mut [u8], idx: usize) {
    let rs = record_size(page);
    let cnt = count(page);
    debug_assert!(idx < cnt);
    let base = PAGE_HEADER_SIZE;
    for i in idx..(cnt - 1) {
        let src = base + (i + 1) * rs;
        let dst = base + i * rs;
        page.copy_within(src..src + rs, dst);
    }
    header_of_mut(page).lower -= rs as u16;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::page as pflags;
    use crate::page::header::PageHeader;

    fn fresh_page(size: usize, record_size: usize) -> Vec<u8> {
        let mut page = vec![0u8; size];
        let h = PageHeader::new(0, pflags::LEAF2);
        page[..PAGE_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&h));
        set_record_size(&mut page, record_size);
        page
    }

    #[test]
    fn sorted_insert_and_search() {
        let mut page = fresh_page(512, 8);
        let vals: [u64; 5] = [50, 10, 40, 20, 30];
        for v in vals {
            let rec = v.to_be_bytes();
            let pos = search(&page, &rec).unwrap_err();
            insert(&mut page, pos, &rec).unwrap();
        }
        assert_eq!(count(&page), 5);
        for (i, expected) in [10u64, 20, 30, 40, 50].into_iter().enumerate() {
            assert_eq!(get(&page, i), expected.to_be_bytes());
        }
        assert_eq!(search(&page, &30u64.to_be_bytes()), Ok(2));
    }

    #[test]
    fn remove_shifts_left() {
        let mut page = fresh_page(512, 8);
        for v in 0u64..5 {
            insert(&mut page, v as usize, &v.to_be_bytes()).unwrap();
        }
        remove(&mut page, 1);
        assert_eq!(count(&page), 4);
        assert_eq!(get(&page, 1), 2u64.to_be_bytes());
    }
}
