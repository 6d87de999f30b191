//! page — bit-exact codec for the on-disk page kinds.
//!
//! Layout (all integers LE):
//! - Header (16 B): [id u64][flags u16][count u16][overflow u32]
//! - Branch payload: count elements of [pos u32][ksize u32][pgid u64],
//!   then the key bytes in element order. `pos` is relative to the
//!   element's own start.
//! - Leaf payload: count elements of [flags u32][pos u32][ksize u32]
//!   [vsize u32], then key||value runs in element order.
//! - Freelist payload: sorted u64 page-ids; when count does not fit the
//!   u16 header field, the field holds 0xFFFF and the first u64 is the
//!   real count.
//! - Meta payload: see `meta.rs`.
//!
//! A logical page spans `(1 + overflow) * page_size` bytes; overflow
//! pages are raw continuations with no header of their own.

pub mod meta;

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{BRANCH_ELEM_SIZE, FREELIST_COUNT_OVERFLOW, LEAF_ELEM_SIZE, PAGE_HEADER_SIZE};

pub use meta::{BucketHeader, Meta};

/// Index of a page within the file.
pub type PgId = u64;

/// Monotonic transaction identifier.
pub type TxId = u64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        const BRANCH = 0x01;
        const LEAF = 0x02;
        const META = 0x04;
        const FREELIST = 0x10;
    }
}

/// Leaf element flag: the value bytes hold a bucket header
/// (plus an inline page image when the bucket has no external root).
pub const BUCKET_LEAF_FLAG: u32 = 0x01;

const OFF_ID: usize = 0;
const OFF_FLAGS: usize = 8;
const OFF_COUNT: usize = 10;
const OFF_OVERFLOW: usize = 12;

#[derive(Debug, Clone, Copy)]
pub struct BranchElem {
    pub pos: u32,
    pub ksize: u32,
    pub pgid: PgId,
}

#[derive(Debug, Clone, Copy)]
pub struct LeafElem {
    pub flags: u32,
    pub pos: u32,
    pub ksize: u32,
    pub vsize: u32,
}

impl LeafElem {
    #[inline]
    pub fn is_bucket(&self) -> bool {
        self.flags & BUCKET_LEAF_FLAG != 0
    }
}

/// Read-only view over a logical page image.
#[derive(Clone, Copy)]
pub struct PageRef<'a> {
    buf: &'a [u8],
}

impl<'a> PageRef<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    #[inline]
    pub fn id(&self) -> PgId {
        LittleEndian::read_u64(&self.buf[OFF_ID..OFF_ID + 8])
    }

    #[inline]
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_retain(LittleEndian::read_u16(&self.buf[OFF_FLAGS..OFF_FLAGS + 2]))
    }

    #[inline]
    pub fn count(&self) -> usize {
        LittleEndian::read_u16(&self.buf[OFF_COUNT..OFF_COUNT + 2]) as usize
    }

    #[inline]
    pub fn overflow(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[OFF_OVERFLOW..OFF_OVERFLOW + 4])
    }

    #[inline]
    pub fn is_branch(&self) -> bool {
        self.flags().contains(PageFlags::BRANCH)
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.flags().contains(PageFlags::LEAF)
    }

    // ---------- branch elements ----------

    pub fn branch_elem(&self, i: usize) -> BranchElem {
        let off = PAGE_HEADER_SIZE + i * BRANCH_ELEM_SIZE;
        BranchElem {
            pos: LittleEndian::read_u32(&self.buf[off..off + 4]),
            ksize: LittleEndian::read_u32(&self.buf[off + 4..off + 8]),
            pgid: LittleEndian::read_u64(&self.buf[off + 8..off + 16]),
        }
    }

    pub fn branch_key(&self, i: usize) -> &'a [u8] {
        let off = PAGE_HEADER_SIZE + i * BRANCH_ELEM_SIZE;
        let e = self.branch_elem(i);
        let start = off + e.pos as usize;
        &self.buf[start..start + e.ksize as usize]
    }

    // ---------- leaf elements ----------

    pub fn leaf_elem(&self, i: usize) -> LeafElem {
        let off = PAGE_HEADER_SIZE + i * LEAF_ELEM_SIZE;
        LeafElem {
            flags: LittleEndian::read_u32(&self.buf[off..off + 4]),
            pos: LittleEndian::read_u32(&self.buf[off + 4..off + 8]),
            ksize: LittleEndian::read_u32(&self.buf[off + 8..off + 12]),
            vsize: LittleEndian::read_u32(&self.buf[off + 12..off + 16]),
        }
    }

    pub fn leaf_key(&self, i: usize) -> &'a [u8] {
        let off = PAGE_HEADER_SIZE + i * LEAF_ELEM_SIZE;
        let e = self.leaf_elem(i);
        let start = off + e.pos as usize;
        &self.buf[start..start + e.ksize as usize]
    }

    pub fn leaf_value(&self, i: usize) -> &'a [u8] {
        let off = PAGE_HEADER_SIZE + i * LEAF_ELEM_SIZE;
        let e = self.leaf_elem(i);
        let start = off + e.pos as usize + e.ksize as usize;
        &self.buf[start..start + e.vsize as usize]
    }

    // ---------- freelist ----------

    /// Decode the freelist payload (handles the count-overflow convention).
    pub fn freelist_ids(&self) -> Vec<PgId> {
        let hdr_count = self.count();
        let (count, mut off) = if hdr_count >= FREELIST_COUNT_OVERFLOW {
            let real = LittleEndian::read_u64(
                &self.buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 8],
            ) as usize;
            (real, PAGE_HEADER_SIZE + 8)
        } else {
            (hdr_count, PAGE_HEADER_SIZE)
        };
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(LittleEndian::read_u64(&self.buf[off..off + 8]));
            off += 8;
        }
        ids
    }
}

// ---------- write helpers ----------

pub fn write_page_header(buf: &mut [u8], id: PgId, flags: PageFlags, count: usize, overflow: u32) {
    LittleEndian::write_u64(&mut buf[OFF_ID..OFF_ID + 8], id);
    LittleEndian::write_u16(&mut buf[OFF_FLAGS..OFF_FLAGS + 2], flags.bits());
    LittleEndian::write_u16(&mut buf[OFF_COUNT..OFF_COUNT + 2], count as u16);
    LittleEndian::write_u32(&mut buf[OFF_OVERFLOW..OFF_OVERFLOW + 4], overflow);
}

pub fn write_branch_elem(buf: &mut [u8], i: usize, pos: u32, ksize: u32, pgid: PgId) {
    let off = PAGE_HEADER_SIZE + i * BRANCH_ELEM_SIZE;
    LittleEndian::write_u32(&mut buf[off..off + 4], pos);
    LittleEndian::write_u32(&mut buf[off + 4..off + 8], ksize);
    LittleEndian::write_u64(&mut buf[off + 8..off + 16], pgid);
}

pub fn write_leaf_elem(buf: &mut [u8], i: usize, flags: u32, pos: u32, ksize: u32, vsize: u32) {
    let off = PAGE_HEADER_SIZE + i * LEAF_ELEM_SIZE;
    LittleEndian::write_u32(&mut buf[off..off + 4], flags);
    LittleEndian::write_u32(&mut buf[off + 4..off + 8], pos);
    LittleEndian::write_u32(&mut buf[off + 8..off + 12], ksize);
    LittleEndian::write_u32(&mut buf[off + 12..off + 16], vsize);
}
