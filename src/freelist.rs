//! freelist — tracks reusable page-ids and pages pending release.
//!
//! Three populations:
//! - `ids`: sorted page-ids free for immediate reuse;
//! - `pending`: pages freed by a committed-or-in-flight writer, keyed by
//!   the txid that freed them; they become reusable only once no reader
//!   at or below that txid remains;
//! - `allocs`: contiguous runs handed out from `ids` by the current
//!   writer, so rollback can return them.
//!
//! The persisted image merges free and pending ids: after a crash the
//! new meta is current and every pending page really is free.

use std::collections::{BTreeMap, HashMap, HashSet};

use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{FREELIST_COUNT_OVERFLOW, PAGE_HEADER_SIZE};
use crate::errors::{Error, Result};
use crate::page::{write_page_header, PageFlags, PageRef, PgId, TxId};

#[derive(Debug, Default)]
pub(crate) struct Freelist {
    ids: Vec<PgId>,
    pending: BTreeMap<TxId, Vec<PgId>>,
    /// Every id in `ids` or `pending`, for O(1) double-free detection.
    cache: HashSet<PgId>,
    /// Runs allocated from `ids`, per transaction: (start, length).
    allocs: HashMap<TxId, Vec<(PgId, u64)>>,
}

impl Freelist {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Free ids plus pending ids.
    pub(crate) fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    pub(crate) fn free_count(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.values().map(|v| v.len()).sum()
    }

    /// Find a contiguous run of `n` free pages, preferring the
    /// lowest-addressed run. Returns the run's first page-id, or None if
    /// the caller must extend the file.
    pub(crate) fn allocate(&mut self, txid: TxId, n: u64) -> Option<PgId> {
        if n == 0 || self.ids.is_empty() {
            return None;
        }
        let mut initial: PgId = 0;
        let mut previd: PgId = 0;
        for (i, &id) in self.ids.iter().enumerate() {
            debug_assert!(id > 1, "page {} must never be freed", id);
            if previd == 0 || id - previd != 1 {
                initial = id;
            }
            if (id - initial) + 1 == n {
                let start_idx = i + 1 - n as usize;
                self.ids.drain(start_idx..=i);
                for j in 0..n {
                    self.cache.remove(&(initial + j));
                }
                self.allocs.entry(txid).or_default().push((initial, n));
                return Some(initial);
            }
            previd = id;
        }
        None
    }

    /// Move a page and its overflow tail into the pending set of the
    /// releasing transaction.
    pub(crate) fn free(&mut self, txid: TxId, pgid: PgId, overflow: u32) -> Result<()> {
        if pgid <= 1 {
            return Err(Error::Unexpected(format!("cannot free meta page {}", pgid)));
        }
        let list = self.pending.entry(txid).or_default();
        for id in pgid..=pgid + overflow as u64 {
            if !self.cache.insert(id) {
                return Err(Error::Unexpected(format!("page {} already freed", id)));
            }
            list.push(id);
        }
        Ok(())
    }

    /// Move every pending entry with txid <= `up_to` into the free set.
    pub(crate) fn release(&mut self, up_to: TxId) {
        let keep = self.pending.split_off(&(up_to + 1));
        for (_, mut list) in std::mem::replace(&mut self.pending, keep) {
            self.ids.append(&mut list);
        }
        self.ids.sort_unstable();
    }

    /// Undo the given transaction: drop its pending frees (those pages are
    /// still live under the previous meta) and return its allocations to
    /// the free set.
    pub(crate) fn rollback(&mut self, txid: TxId) {
        if let Some(list) = self.pending.remove(&txid) {
            for id in list {
                self.cache.remove(&id);
            }
        }
        if let Some(runs) = self.allocs.remove(&txid) {
            for (start, n) in runs {
                for id in start..start + n {
                    if self.cache.insert(id) {
                        self.ids.push(id);
                    }
                }
            }
            self.ids.sort_unstable();
        }
    }

    /// Forget allocation tracking for a committed transaction.
    pub(crate) fn commit(&mut self, txid: TxId) {
        self.allocs.remove(&txid);
    }

    /// Whether the page is currently free or pending.
    pub(crate) fn freed(&self, pgid: PgId) -> bool {
        self.cache.contains(&pgid)
    }

    /// All free and pending ids, sorted. This is the persisted image.
    pub(crate) fn all_ids(&self) -> Vec<PgId> {
        let mut out = self.ids.clone();
        for list in self.pending.values() {
            out.extend_from_slice(list);
        }
        out.sort_unstable();
        out
    }

    /// Serialized byte size, header included.
    pub(crate) fn size(&self) -> usize {
        let n = self.count();
        let extra = if n >= FREELIST_COUNT_OVERFLOW { 1 } else { 0 };
        PAGE_HEADER_SIZE + 8 * (n + extra)
    }

    /// Load state from a freelist page image, replacing current contents.
    pub(crate) fn read(&mut self, page: PageRef<'_>) {
        self.ids = page.freelist_ids();
        self.ids.sort_unstable();
        self.pending.clear();
        self.allocs.clear();
        self.cache = self.ids.iter().copied().collect();
    }

    /// Serialize into a logical page image sized by the caller from
    /// `size()`. Writes the count-overflow convention when needed.
    pub(crate) fn write(&self, buf: &mut [u8], pgid: PgId, overflow: u32) {
        let ids = self.all_ids();
        let n = ids.len();
        let mut off = PAGE_HEADER_SIZE;
        if n >= FREELIST_COUNT_OVERFLOW {
            write_page_header(buf, pgid, PageFlags::FREELIST, FREELIST_COUNT_OVERFLOW, overflow);
            LittleEndian::write_u64(&mut buf[off..off + 8], n as u64);
            off += 8;
        } else {
            write_page_header(buf, pgid, PageFlags::FREELIST, n, overflow);
        }
        for id in ids {
            LittleEndian::write_u64(&mut buf[off..off + 8], id);
            off += 8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_prefers_lowest_run() {
        let mut f = Freelist::new();
        f.ids = vec![3, 4, 5, 8, 9, 10, 11];
        f.cache = f.ids.iter().copied().collect();

        assert_eq!(f.allocate(10, 2), Some(3));
        assert_eq!(f.ids, vec![5, 8, 9, 10, 11]);
        // 3-run no longer available at the low end; next triple comes from 8.
        assert_eq!(f.allocate(10, 3), Some(8));
        assert_eq!(f.ids, vec![5, 11]);
        assert_eq!(f.allocate(10, 2), None);
        assert_eq!(f.allocate(10, 1), Some(5));
    }

    #[test]
    fn free_release_cycle() {
        let mut f = Freelist::new();
        f.free(5, 12, 1).unwrap();
        f.free(7, 9, 0).unwrap();
        assert_eq!(f.free_count(), 0);
        assert_eq!(f.pending_count(), 3);
        assert!(f.freed(12));
        assert!(f.freed(13));

        f.release(5);
        assert_eq!(f.ids, vec![12, 13]);
        assert_eq!(f.pending_count(), 1);

        f.release(100);
        assert_eq!(f.ids, vec![9, 12, 13]);
        assert_eq!(f.pending_count(), 0);
    }

    #[test]
    fn double_free_detected() {
        let mut f = Freelist::new();
        f.free(5, 12, 0).unwrap();
        assert!(matches!(f.free(6, 12, 0), Err(Error::Unexpected(_))));
    }

    #[test]
    fn rollback_restores_allocations_and_drops_pending() {
        let mut f = Freelist::new();
        f.ids = vec![3, 4, 5];
        f.cache = f.ids.iter().copied().collect();

        assert_eq!(f.allocate(9, 2), Some(3));
        f.free(9, 20, 0).unwrap();
        f.rollback(9);

        assert_eq!(f.ids, vec![3, 4, 5]);
        assert!(!f.freed(20));
        assert_eq!(f.pending_count(), 0);
    }

    #[test]
    fn page_roundtrip_small() {
        let mut f = Freelist::new();
        f.ids = vec![4, 7, 9];
        f.cache = f.ids.iter().copied().collect();
        f.free(3, 15, 1).unwrap();

        let mut buf = vec![0u8; f.size().next_multiple_of(4096)];
        f.write(&mut buf, 2, 0);

        let mut g = Freelist::new();
        g.read(PageRef::new(&buf));
        assert_eq!(g.ids, vec![4, 7, 9, 15, 16]);
        assert_eq!(g.pending_count(), 0);
    }

    #[test]
    fn page_roundtrip_overflowed_count() {
        let mut f = Freelist::new();
        f.ids = (2..70_002u64).collect();
        f.cache = f.ids.iter().copied().collect();
        assert!(f.count() >= FREELIST_COUNT_OVERFLOW);

        let page_size = 4096usize;
        let pages = f.size().div_ceil(page_size);
        let mut buf = vec![0u8; pages * page_size];
        f.write(&mut buf, 2, (pages - 1) as u32);

        let p = PageRef::new(&buf);
        assert_eq!(p.count(), FREELIST_COUNT_OVERFLOW);
        let mut g = Freelist::new();
        g.read(p);
        assert_eq!(g.free_count(), 70_000);
        assert_eq!(g.ids.first(), Some(&2));
        assert_eq!(g.ids.last(), Some(&70_001));
    }
}
