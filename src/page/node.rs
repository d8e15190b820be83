use bytemuck::{Pod, Zeroable};
use byteorder::{ByteOrder, LittleEndian};

use super::header::{header_of, header_of_mut, PAGE_HEADER_SIZE};
use crate::error::PageFull;
use crate::flags::node as nflags;

/// The 8-byte node header: `{flags: u16, key_size: u16, data_size: u32}`.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct NodeHeader {
    pub flags: u16,
    pub key_size: u16,
    pub data_size: u32,
}

pub const NODE_HEADER_SIZE: usize = std::mem::size_of::<NodeHeader>();
const _: () = assert!(NODE_HEADER_SIZE == 8);

const PTR_SIZE: usize = 2;

/// A decoded view of one node.
pub struct NodeView<'a> {
    pub flags: u16,
    pub key: &'a [u8],
    pub data: &'a [u8],
}

impl<'a> NodeView<'a> {
    pub fn is_bigdata(&self) -> bool {
        self.flags & nflags::BIGDATA != 0
    }
    pub fn is_subdata(&self) -> bool {
        self.flags & nflags::SUBDATA != 0
    }
    pub fn is_dupdata(&self) -> bool {
        self.flags & nflags::DUPDATA != 0
    }

    /// Interpret `data` as a little-endian child page number (branch nodes).
    pub fn child_pgno(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[..self.data.len().min(8)].copy_from_slice(&self.data[..self.data.len().min(8)]);
        LittleEndian::read_u64(&buf)
    }
}

/// Number of nodes currently on the page, derived from `lower`.
pub fn node_count(page: &[u8]) -> usize {
    let h = header_of(page);
    (h.lower as usize - PAGE_HEADER_SIZE) / PTR_SIZE
}

fn ptr_offset(idx: usize) -> usize {
    PAGE_HEADER_SIZE + idx * PTR_SIZE
}

fn read_ptr(page: &[u8], idx: usize) -> u16 {
    let off = ptr_offset(idx);
    LittleEndian::read_u16(&page[off..off + 2])
}

fn write_ptr(page: &mut [u8], idx: usize, value: u16) {
    let off = ptr_offset(idx);
    LittleEndian::write_u16(&mut page[off..off + 2], value);
}

/// Free space available for a new node insertion (accounting for the new
/// pointer-array slot it would also need).
pub fn free_space(page: &[u8]) -> usize {
    let h = header_of(page);
    (h.upper as usize).saturating_sub(h.lower as usize + PTR_SIZE)
}

/// Total space occupied by live data (nodes + their pointers), i.e. the
/// complement of [`free_space`] plus the header.
pub fn data_len(page: &[u8], page_size: usize) -> usize {
    let h = header_of(page);
    (h.lower as usize - PAGE_HEADER_SIZE) + (page_size - h.upper as usize)
}

fn aligned_node_size(key_len: usize, data_len: usize) -> usize {
    let raw = NODE_HEADER_SIZE + key_len + data_len;
    (raw + 1) & !1
}

/// Read node `idx` out of the page.
pub fn read_node(page: &[u8], idx: usize) -> NodeView<'_> {
    let ptr = read_ptr(page, idx) as usize;
    let node_hdr: &NodeHeader = bytemuck::from_bytes(&page[ptr..ptr + NODE_HEADER_SIZE]);
    let key_start = ptr + NODE_HEADER_SIZE;
    let key_end = key_start + node_hdr.key_size as usize;
    let data_end = key_end + node_hdr.data_size as usize;
    NodeView {
        flags: node_hdr.flags,
        key: &page[key_start..key_end],
        data: &page[key_end..data_end],
    }
}

/// Mutable view of node `idx`'s value bytes, for `RESERVE`-style in-place
/// fills after the node has already been inserted with placeholder bytes.
pub fn node_data_mut(page: &mut [u8], idx: usize) -> &mut [u8] {
    let ptr = read_ptr(page, idx) as usize;
    let node_hdr: &NodeHeader = bytemuck::from_bytes(&page[ptr..ptr + NODE_HEADER_SIZE]);
    let key_end = ptr + NODE_HEADER_SIZE + node_hdr.key_size as usize;
    let data_end = key_end + node_hdr.data_size as usize;
    &mut page[key_end..data_end]
}

/// Insert a new node at pointer-array position `idx`, shifting later
/// pointers right. Fails with [`PageFull`] if there isn't room.
pub fn insert_node(
    page: &mut [u8],
    idx: usize,
    key: &[u8],
    data: &[u8],
    flags: u16,
) -> Result<(), PageFull> {
    let node_size = aligned_node_size(key.len(), data.len());
    if free_space(page) < node_size {
        return Err(PageFull { needed: node_size });
    }

    let h = header_of(page);
    let count = (h.lower as usize - PAGE_HEADER_SIZE) / PTR_SIZE;
    let new_upper = h.upper as usize - node_size;
    debug_assert!(idx <= count);

    // Shift the pointer array right to make room for the new entry.
    for i in (idx..count).rev() {
        let v = read_ptr(page, i);
        write_ptr(page, i + 1, v);
    }

    // Write the node payload at the new high-water mark.
    {
        let node_hdr = NodeHeader {
            flags,
            key_size: key.len() as u16,
            data_size: data.len() as u32,
        };
        page[new_upper..new_upper + NODE_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&node_hdr));
        let key_start = new_upper + NODE_HEADER_SIZE;
        page[key_start..key_start + key.len()].copy_from_slice(key);
        let data_start = key_start + key.len();
        page[data_start..data_start + data.len()].copy_from_slice(data);
    }

    write_ptr(page, idx, new_upper as u16);

    let h = header_of_mut(page);
    h.lower += PTR_SIZE as u16;
    h.upper = new_upper as u16;
    Ok(())
}

/// Remove the node at `idx`. Leaves a hole in the packed node area; call
/// [`compact`] to reclaim it.
pub fn delete_node(page: &mut [u8], idx: usize) {
    let h = header_of(page);
    let count = (h.lower as usize - PAGE_HEADER_SIZE) / PTR_SIZE;
    debug_assert!(idx < count);
    for i in idx..(count - 1) {
        let v = read_ptr(page, i + 1);
        write_ptr(page, i, v);
    }
    let h = header_of_mut(page);
    h.lower -= PTR_SIZE as u16;
}

/// Reconstruct the packed node area contiguously, preserving logical
/// (pointer-array) order. Post-condition: `upper - lower == free_space`.
pub fn compact(page: &mut [u8], page_size: usize) {
    let count = node_count(page);
    if count == 0 {
        let h = header_of_mut(page);
        h.upper = page_size as u16;
        return;
    }

    // Snapshot the current nodes (order-preserving) before we start
    // overwriting the data region.
    let mut nodes: Vec<(u16, Vec<u8>)> = Vec::with_capacity(count);
    for i in 0..count {
        let flags;
        let bytes;
        {
            let view = read_node(page, i);
            flags = view.flags;
            let mut buf = Vec::with_capacity(NODE_HEADER_SIZE + view.key.len() + view.data.len());
            let hdr = NodeHeader {
                flags,
                key_size: view.key.len() as u16,
                data_size: view.data.len() as u32,
            };
            buf.extend_from_slice(bytemuck::bytes_of(&hdr));
            buf.extend_from_slice(view.key);
            buf.extend_from_slice(view.data);
            bytes = buf;
        }
        nodes.push((flags, bytes));
    }

    let mut upper = page_size;
    for (i, (_, bytes)) in nodes.iter().enumerate() {
        upper -= bytes.len();
        page[upper..upper + bytes.len()].copy_from_slice(bytes);
        write_ptr(page, i, upper as u16);
    }

    let h = header_of_mut(page);
    h.upper = upper as u16;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::page as pflags;
    use crate::page::header::PageHeader;

    fn fresh_page(size: usize, flags: u16) -> Vec<u8> {
        let mut page = vec![0u8; size];
        let h = PageHeader::new(0, flags);
        page[..PAGE_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&h));
        header_of_mut(&mut page).upper = size as u16;
        page
    }

    #[test]
    fn insert_and_read_roundtrip() {
        let mut page = fresh_page(4096, pflags::LEAF);
        insert_node(&mut page, 0, b"alpha", b"1", 0).unwrap();
        insert_node(&mut page, 1, b"beta", b"2", 0).unwrap();
        insert_node(&mut page, 0, b"aaa", b"0", 0).unwrap();

        assert_eq!(node_count(&page), 3);
        assert_eq!(read_node(&page, 0).key, b"aaa");
        assert_eq!(read_node(&page, 1).key, b"alpha");
        assert_eq!(read_node(&page, 2).key, b"beta");
        assert_eq!(read_node(&page, 1).data, b"1");
    }

    #[test]
    fn delete_then_compact_reclaims_space() {
        let mut page = fresh_page(4096, pflags::LEAF);
        for i in 0..20u32 {
            let k = format!("key{i:03}");
            insert_node(&mut page, i as usize, k.as_bytes(), b"0123456789", 0).unwrap();
        }
        let before_free = free_space(&page);
        for _ in 0..10 {
            delete_node(&mut page, 0);
        }
        assert_eq!(node_count(&page), 10);
        // Space isn't reclaimed until compaction.
        compact(&mut page, 4096);
        let h = header_of(&page);
        assert_eq!(h.upper as usize - h.lower as usize, free_space(&page) + 2);
        assert!(free_space(&page) > before_free);
        for i in 0..10 {
            let k = format!("key{:03}", i + 10);
            assert_eq!(read_node(&page, i).key, k.as_bytes());
        }
    }

    #[test]
    fn page_full_is_reported() {
        let mut page = fresh_page(4096, pflags::LEAF);
        let big = vec![0u8; 3000];
        insert_node(&mut page, 0, b"k", &big, 0).unwrap();
        let err = insert_node(&mut page, 1, b"k2", &big, 0).unwrap_err();
        assert!(err.needed > 0);
    }
}
