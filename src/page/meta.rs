//! Meta page codec.
//!
//! Payload at page offset 16 (after the page header), LE:
//! [magic u32][version u32][page_size u32][flags u32]
//! [root.root u64][root.sequence u64][freelist u64][pgid u64][txid u64]
//! [checksum u64]
//!
//! The checksum is FNV-1a 64 over page bytes [16, 72). Two meta pages
//! live at page-ids 0 and 1; the valid one with the higher txid is
//! current, and commits write the slot `txid % 2` so the other slot
//! always holds the last known-good state.

use byteorder::{ByteOrder, LittleEndian};
use fnv_rs::{Fnv64, FnvHasher};

use crate::consts::{MAGIC, META_CHECKSUM_OFFSET, PAGE_HEADER_SIZE, VERSION};
use crate::errors::{Error, Result};
use crate::page::{write_page_header, PageFlags, PgId, TxId};

/// On-disk bucket record: subtree root page and sequence counter.
/// The root bucket's header is embedded in the meta page; child bucket
/// headers live in their parent's leaf element values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketHeader {
    pub root: PgId,
    pub sequence: u64,
}

impl BucketHeader {
    pub fn read(buf: &[u8]) -> Self {
        Self {
            root: LittleEndian::read_u64(&buf[0..8]),
            sequence: LittleEndian::read_u64(&buf[8..16]),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.root);
        LittleEndian::write_u64(&mut buf[8..16], self.sequence);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Meta {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub flags: u32,
    pub root: BucketHeader,
    pub freelist: PgId,
    /// Page-count high-water mark; pages at and above this id do not exist.
    pub pgid: PgId,
    pub txid: TxId,
    pub checksum: u64,
}

impl Meta {
    /// Decode and validate a meta page image. Validation order: magic,
    /// version, checksum.
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_CHECKSUM_OFFSET + 8 {
            return Err(Error::Invalid);
        }
        let o = PAGE_HEADER_SIZE;
        let m = Self {
            magic: LittleEndian::read_u32(&buf[o..o + 4]),
            version: LittleEndian::read_u32(&buf[o + 4..o + 8]),
            page_size: LittleEndian::read_u32(&buf[o + 8..o + 12]),
            flags: LittleEndian::read_u32(&buf[o + 12..o + 16]),
            root: BucketHeader::read(&buf[o + 16..o + 32]),
            freelist: LittleEndian::read_u64(&buf[o + 32..o + 40]),
            pgid: LittleEndian::read_u64(&buf[o + 40..o + 48]),
            txid: LittleEndian::read_u64(&buf[o + 48..o + 56]),
            checksum: LittleEndian::read_u64(
                &buf[META_CHECKSUM_OFFSET..META_CHECKSUM_OFFSET + 8],
            ),
        };
        if m.magic != MAGIC {
            return Err(Error::Invalid);
        }
        if m.version != VERSION {
            return Err(Error::VersionMismatch);
        }
        if m.checksum != sum64(&buf[PAGE_HEADER_SIZE..META_CHECKSUM_OFFSET]) {
            return Err(Error::Checksum);
        }
        Ok(m)
    }

    /// Serialize into a page image at the given meta slot, computing the
    /// checksum over the freshly written payload.
    pub fn write(&self, buf: &mut [u8], slot: PgId) {
        write_page_header(buf, slot, PageFlags::META, 0, 0);
        let o = PAGE_HEADER_SIZE;
        LittleEndian::write_u32(&mut buf[o..o + 4], self.magic);
        LittleEndian::write_u32(&mut buf[o + 4..o + 8], self.version);
        LittleEndian::write_u32(&mut buf[o + 8..o + 12], self.page_size);
        LittleEndian::write_u32(&mut buf[o + 12..o + 16], self.flags);
        self.root.write(&mut buf[o + 16..o + 32]);
        LittleEndian::write_u64(&mut buf[o + 32..o + 40], self.freelist);
        LittleEndian::write_u64(&mut buf[o + 40..o + 48], self.pgid);
        LittleEndian::write_u64(&mut buf[o + 48..o + 56], self.txid);
        let sum = sum64(&buf[PAGE_HEADER_SIZE..META_CHECKSUM_OFFSET]);
        LittleEndian::write_u64(&mut buf[META_CHECKSUM_OFFSET..META_CHECKSUM_OFFSET + 8], sum);
    }

    pub fn new(page_size: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            page_size,
            flags: 0,
            root: BucketHeader::default(),
            freelist: 0,
            pgid: 0,
            txid: 0,
            checksum: 0,
        }
    }
}

/// FNV-1a 64 over the meta payload; the digest bytes are interpreted
/// big-endian.
pub(crate) fn sum64(payload: &[u8]) -> u64 {
    u64::from_be_bytes(
        Fnv64::hash(payload)
            .as_bytes()
            .try_into()
            .expect("FNV-1a 64 digest is 8 bytes"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Meta {
        let mut m = Meta::new(4096);
        m.root = BucketHeader { root: 3, sequence: 7 };
        m.freelist = 2;
        m.pgid = 4;
        m.txid = 9;
        m
    }

    #[test]
    fn meta_roundtrip() {
        let mut buf = vec![0u8; 4096];
        sample().write(&mut buf, 1);

        let m = Meta::read(&buf).unwrap();
        assert_eq!(m.page_size, 4096);
        assert_eq!(m.root, BucketHeader { root: 3, sequence: 7 });
        assert_eq!(m.freelist, 2);
        assert_eq!(m.pgid, 4);
        assert_eq!(m.txid, 9);
    }

    #[test]
    fn meta_rejects_corruption() {
        let mut buf = vec![0u8; 4096];
        sample().write(&mut buf, 0);

        // Flip a payload byte: checksum must fail.
        let mut torn = buf.clone();
        torn[40] ^= 0xFF;
        assert!(matches!(Meta::read(&torn), Err(Error::Checksum)));

        // Wrong magic.
        let mut bad = buf.clone();
        LittleEndian::write_u32(&mut bad[16..20], 0xDEADBEEF);
        assert!(matches!(Meta::read(&bad), Err(Error::Invalid)));

        // Future version.
        let mut vers = buf.clone();
        LittleEndian::write_u32(&mut vers[20..24], VERSION + 1);
        // version change also breaks the checksum, so recompute it
        let sum = sum64(&vers[PAGE_HEADER_SIZE..META_CHECKSUM_OFFSET]);
        LittleEndian::write_u64(
            &mut vers[META_CHECKSUM_OFFSET..META_CHECKSUM_OFFSET + 8],
            sum,
        );
        assert!(matches!(Meta::read(&vers), Err(Error::VersionMismatch)));
    }

    #[test]
    fn bucket_header_roundtrip() {
        let mut buf = [0u8; 16];
        BucketHeader { root: 12, sequence: 99 }.write(&mut buf);
        assert_eq!(BucketHeader::read(&buf), BucketHeader { root: 12, sequence: 99 });
    }
}
