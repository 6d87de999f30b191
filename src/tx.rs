//! tx — transactions and the commit pipeline.
//!
//! One record serves both variants. A read-only transaction is a meta
//! snapshot plus a clone of the mapping Arc; it registers its txid so
//! the writer knows which pending pages must stay untouched. A writable
//! transaction additionally holds the database writer mutex for its
//! whole life and owns the node/bucket arenas that buffer mutations
//! until commit.
//!
//! Commit ordering (crash safety depends on it):
//! rebalance -> spill -> rewrite freelist -> grow file -> write dirty
//! pages -> fsync -> write meta slot txid%2 -> fsync -> swap mapping.
//! Failure before the meta fsync leaves the previous meta current and
//! rolls everything back.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::bucket::{Bucket, BucketData};
use crate::cursor::{Cursor, CursorCore};
use crate::db::{Db, Mapping};
use crate::errors::{Error, Result};
use crate::freelist::Freelist;
use crate::node::NodeData;
use crate::page::{Meta, PageRef, PgId, TxId};

pub(crate) type NodeId = usize;
pub(crate) type BucketId = usize;

/// Root bucket of every transaction.
pub(crate) const ROOT_BUCKET: BucketId = 0;

pub struct Tx<'db> {
    pub(crate) db: &'db Db,
    pub(crate) writable: bool,
    pub(crate) closed: Cell<bool>,
    pub(crate) inner: RefCell<TxInner>,
    /// Held for the life of a writable transaction.
    writer: Option<MutexGuard<'db, ()>>,
}

/// Mutable state shared by buckets, nodes and cursors of one transaction.
pub(crate) struct TxInner {
    pub(crate) meta: Meta,
    pub(crate) mmap: Arc<Mapping>,
    pub(crate) page_size: usize,
    pub(crate) fill_percent: f32,
    pub(crate) writable: bool,
    /// Node arena; parent/child links are indices into this vector.
    pub(crate) nodes: Vec<NodeData>,
    /// Bucket arena; index 0 is the root bucket.
    pub(crate) buckets: Vec<BucketData>,
    /// Dirty page images produced by spill, keyed by page-id.
    pub(crate) pages: BTreeMap<PgId, Vec<u8>>,
    /// Callbacks to run after a successful commit.
    pub(crate) hooks: Vec<Box<dyn FnOnce()>>,
}

impl TxInner {
    pub(crate) fn new(
        meta: Meta,
        mmap: Arc<Mapping>,
        page_size: usize,
        fill_percent: f32,
        writable: bool,
    ) -> Self {
        let root = BucketData::new(meta.root);
        Self {
            meta,
            mmap,
            page_size,
            fill_percent,
            writable,
            nodes: Vec::new(),
            buckets: vec![root],
            pages: BTreeMap::new(),
            hooks: Vec::new(),
        }
    }

    /// Resolve a logical page image: the transaction's own dirty pages
    /// shadow the mapping.
    pub(crate) fn page(&self, id: PgId) -> PageRef<'_> {
        if let Some(buf) = self.pages.get(&id) {
            return PageRef::new(buf);
        }
        let off = id as usize * self.page_size;
        let head = PageRef::new(&self.mmap[off..off + self.page_size]);
        let span = (1 + head.overflow() as usize) * self.page_size;
        PageRef::new(&self.mmap[off..off + span])
    }

    /// Allocate a contiguous run of `n` pages: from the freelist when a
    /// run exists, otherwise from the high-water mark (the file is grown
    /// before the write phase).
    pub(crate) fn allocate(&mut self, fl: &mut Freelist, n: u64) -> Result<PgId> {
        if let Some(id) = fl.allocate(self.meta.txid, n) {
            return Ok(id);
        }
        let id = self.meta.pgid;
        self.meta.pgid += n;
        Ok(id)
    }
}

impl<'db> Tx<'db> {
    pub(crate) fn new(db: &'db Db, inner: TxInner, writer: Option<MutexGuard<'db, ()>>) -> Self {
        Self {
            db,
            writable: inner.writable,
            closed: Cell::new(false),
            inner: RefCell::new(inner),
            writer,
        }
    }

    /// Snapshot txid of this transaction.
    pub fn id(&self) -> TxId {
        self.inner.borrow().meta.txid
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.get() {
            return Err(Error::TxClosed);
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        Ok(())
    }

    // ---------- root bucket surface ----------

    pub(crate) fn root_bucket(&self) -> Bucket<'_> {
        Bucket::handle(self, ROOT_BUCKET)
    }

    /// Open a top-level bucket by name.
    pub fn bucket(&self, name: &[u8]) -> Option<Bucket<'_>> {
        self.root_bucket().bucket(name)
    }

    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'_>> {
        self.root_bucket().create_bucket(name)
    }

    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'_>> {
        self.root_bucket().create_bucket_if_not_exists(name)
    }

    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.root_bucket().delete_bucket(name)
    }

    /// Cursor over the top-level bucket names.
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(self, CursorCore::new(ROOT_BUCKET))
    }

    /// Iterate the root bucket in key order; every element at this level
    /// is a bucket, so values are always `None`.
    pub fn for_each<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&[u8], Option<&[u8]>) -> Result<()>,
    {
        self.root_bucket().for_each(f)
    }

    /// Iterate top-level bucket names in key order.
    pub fn for_each_bucket<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        self.root_bucket().for_each_bucket(f)
    }

    /// Register a callback to run after this transaction commits.
    pub fn on_commit<F: FnOnce() + 'static>(&self, f: F) -> Result<()> {
        self.check_writable()?;
        self.inner.borrow_mut().hooks.push(Box::new(f));
        Ok(())
    }

    // ---------- lifecycle ----------

    /// Commit all mutations, making them visible to transactions that
    /// begin afterwards. Consumes the handle; on any error the
    /// transaction is rolled back.
    pub fn commit(mut self) -> Result<()> {
        self.check_open()?;
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        match self.commit_pipeline() {
            Ok(hooks) => {
                self.closed.set(true);
                // Release the writer mutex before running hooks.
                self.writer = None;
                for hook in hooks {
                    hook();
                }
                Ok(())
            }
            Err(e) => {
                self.rollback_impl();
                Err(e)
            }
        }
    }

    fn commit_pipeline(&mut self) -> Result<Vec<Box<dyn FnOnce()>>> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let mut fl = self.db.freelist.lock();

        // Merge under-filled nodes, then write the tree out bottom-up.
        inner.rebalance_all(&mut fl)?;
        inner.spill_bucket(&mut fl, ROOT_BUCKET)?;
        inner.meta.root = inner.buckets[ROOT_BUCKET].header;

        // The freelist is rewritten on every commit: release the old
        // page run as pending and persist the merged free+pending set.
        let old = inner.meta.freelist;
        let old_overflow = inner.page(old).overflow();
        fl.free(inner.meta.txid, old, old_overflow)?;
        let pages = inner.size_in_pages(fl.size());
        let pgid = inner.allocate(&mut fl, pages)?;
        let mut buf = vec![0u8; pages as usize * inner.page_size];
        fl.write(&mut buf, pgid, (pages - 1) as u32);
        inner.pages.insert(pgid, buf);
        inner.meta.freelist = pgid;

        // Everything below the high-water mark must fit in the file.
        self.db.grow(inner.meta.pgid)?;

        // Data phase, then the meta phase; each ends with its own fsync
        // so the meta never lands before its pages.
        self.db.write_pages(&inner.pages)?;
        self.db.sync_data()?;
        self.db.write_meta(&inner.meta)?;
        self.db.sync_data()?;

        fl.commit(inner.meta.txid);
        drop(fl);
        self.db.remap_if_grown()?;
        Ok(std::mem::take(&mut inner.hooks))
    }

    /// Abandon all mutations (writable) or deregister from the reader
    /// set (read-only). Safe to call once; later calls are no-ops, and
    /// every later operation on the handle reports `TxClosed`.
    pub fn rollback(&mut self) {
        self.rollback_impl();
        self.writer = None;
    }

    fn rollback_impl(&self) {
        if self.closed.replace(true) {
            return;
        }
        let inner = self.inner.borrow();
        if self.writable {
            self.db.freelist.lock().rollback(inner.meta.txid);
        } else {
            self.db.remove_reader(inner.meta.txid);
        }
    }
}

impl TxInner {
    fn size_in_pages(&self, bytes: usize) -> u64 {
        (bytes / self.page_size) as u64 + 1
    }

    /// Rebalance every node touched by a delete, bucket tree included.
    pub(crate) fn rebalance_all(&mut self, fl: &mut Freelist) -> Result<()> {
        let mut stack = vec![ROOT_BUCKET];
        let mut order = Vec::new();
        while let Some(b) = stack.pop() {
            order.push(b);
            stack.extend(self.buckets[b].children.values().copied());
        }
        for b in order {
            let ids: Vec<NodeId> = self.buckets[b].nodes.values().copied().collect();
            for id in ids {
                self.node_rebalance(fl, id)?;
            }
        }
        Ok(())
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        self.rollback_impl();
    }
}

/// Map the raw (key, value, flags) triple of a cursor position to the
/// public shape: bucket elements yield no value.
pub(crate) fn mask_bucket(
    (k, v, flags): (Vec<u8>, Vec<u8>, u32),
) -> (Vec<u8>, Option<Vec<u8>>) {
    if flags & crate::page::BUCKET_LEAF_FLAG != 0 {
        (k, None)
    } else {
        (k, Some(v))
    }
}
