//! bucket — a named B+tree inside the database.
//!
//! The database root is itself a bucket whose keys are top-level bucket
//! names. A bucket small enough to fit in a quarter page and holding no
//! sub-buckets is stored inline: its parent leaf element's value is
//! `bucket header || single-leaf page image`. Promotion to an external
//! root (and demotion back) is decided at spill time.

use std::collections::HashMap;

use crate::consts::{
    BRANCH_ELEM_SIZE, BUCKET_HEADER_SIZE, LEAF_ELEM_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE,
    PAGE_HEADER_SIZE,
};
use crate::cursor::{Cursor, CursorCore};
use crate::errors::{Error, Result};
use crate::freelist::Freelist;
use crate::page::{
    write_page_header, BucketHeader, PageFlags, PageRef, PgId, BUCKET_LEAF_FLAG,
};
use crate::tx::{BucketId, NodeId, Tx, TxInner};

/// Per-transaction state of one materialized bucket.
#[derive(Debug)]
pub(crate) struct BucketData {
    pub(crate) header: BucketHeader,
    /// Materialized child buckets by name.
    pub(crate) children: HashMap<Vec<u8>, BucketId>,
    /// Materialized nodes by the page-id they shadow.
    pub(crate) nodes: HashMap<PgId, NodeId>,
    pub(crate) root_node: Option<NodeId>,
    /// Copy of the inline page image while `header.root == 0`.
    pub(crate) inline_page: Option<Vec<u8>>,
}

impl BucketData {
    pub(crate) fn new(header: BucketHeader) -> Self {
        Self {
            header,
            children: HashMap::new(),
            nodes: HashMap::new(),
            root_node: None,
            inline_page: None,
        }
    }
}

/// Read-only walk totals for a bucket, nested buckets included.
/// `depth` covers this bucket's own tree only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BucketStats {
    pub branch_page_n: usize,
    pub branch_overflow_n: usize,
    pub leaf_page_n: usize,
    pub leaf_overflow_n: usize,
    /// Non-bucket elements, counted recursively through sub-buckets.
    pub key_n: usize,
    pub depth: usize,
    pub branch_alloc: usize,
    pub branch_inuse: usize,
    pub leaf_alloc: usize,
    pub leaf_inuse: usize,
    /// Buckets in the subtree, this one included.
    pub bucket_n: usize,
    pub inline_bucket_n: usize,
    pub inline_bucket_inuse: usize,
}

impl BucketStats {
    fn absorb(&mut self, other: &BucketStats) {
        self.branch_page_n += other.branch_page_n;
        self.branch_overflow_n += other.branch_overflow_n;
        self.leaf_page_n += other.leaf_page_n;
        self.leaf_overflow_n += other.leaf_overflow_n;
        self.key_n += other.key_n;
        self.branch_inuse += other.branch_inuse;
        self.leaf_inuse += other.leaf_inuse;
        self.bucket_n += other.bucket_n;
        self.inline_bucket_n += other.inline_bucket_n;
        self.inline_bucket_inuse += other.inline_bucket_inuse;
    }
}

/// Handle to a bucket within a transaction. Cheap to copy; all state
/// lives in the transaction.
#[derive(Clone, Copy)]
pub struct Bucket<'tx> {
    tx: &'tx Tx<'tx>,
    id: BucketId,
}

impl<'tx> Bucket<'tx> {
    pub(crate) fn handle(tx: &'tx Tx<'tx>, id: BucketId) -> Self {
        Self { tx, id }
    }

    /// Root page of the bucket; 0 while it is stored inline.
    pub fn root(&self) -> PgId {
        self.tx.inner.borrow().buckets[self.id].header.root
    }

    pub fn writable(&self) -> bool {
        self.tx.writable()
    }

    /// Fetch the value for a key. Sub-bucket elements yield `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tx.check_open()?;
        let inner = self.tx.inner.borrow();
        let mut c = CursorCore::new(self.id);
        match c.seek_raw(&inner, key) {
            Some((k, v, flags)) if k == key => {
                if flags & BUCKET_LEAF_FLAG != 0 {
                    Ok(None)
                } else {
                    Ok(Some(v))
                }
            }
            _ => Ok(None),
        }
    }

    /// Insert or overwrite a key. The change is visible to this
    /// transaction immediately and to others after commit.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.check_writable()?;
        if key.is_empty() {
            return Err(Error::KeyRequired);
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge);
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge);
        }
        let mut guard = self.tx.inner.borrow_mut();
        let inner = &mut *guard;
        let mut c = CursorCore::new(self.id);
        if let Some((k, _, flags)) = c.seek_raw(inner, key) {
            if k == key && flags & BUCKET_LEAF_FLAG != 0 {
                return Err(Error::IncompatibleValue);
            }
        }
        let n = c.cursor_node(inner)?;
        inner.node_put(n, key, key, value.to_vec(), 0, 0)
    }

    /// Remove a key; removing an absent key succeeds without effect.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.tx.check_writable()?;
        let mut guard = self.tx.inner.borrow_mut();
        let inner = &mut *guard;
        let mut c = CursorCore::new(self.id);
        match c.seek_raw(inner, key) {
            Some((k, _, flags)) if k == key => {
                if flags & BUCKET_LEAF_FLAG != 0 {
                    return Err(Error::IncompatibleValue);
                }
                let n = c.cursor_node(inner)?;
                inner.node_del(n, key);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Open a child bucket by name.
    pub fn bucket(&self, name: &[u8]) -> Option<Bucket<'tx>> {
        if self.tx.check_open().is_err() {
            return None;
        }
        {
            let inner = self.tx.inner.borrow();
            if let Some(&id) = inner.buckets[self.id].children.get(name) {
                return Some(Bucket::handle(self.tx, id));
            }
        }
        let mut guard = self.tx.inner.borrow_mut();
        let inner = &mut *guard;
        let mut c = CursorCore::new(self.id);
        match c.seek_raw(inner, name) {
            Some((k, v, flags)) if k == name && flags & BUCKET_LEAF_FLAG != 0 => {
                let id = inner.open_bucket(self.id, name.to_vec(), &v);
                Some(Bucket::handle(self.tx, id))
            }
            _ => None,
        }
    }

    /// Create a child bucket. New buckets start inline.
    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        self.tx.check_writable()?;
        if name.is_empty() {
            return Err(Error::BucketNameRequired);
        }
        if name.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge);
        }
        let mut guard = self.tx.inner.borrow_mut();
        let inner = &mut *guard;
        let mut c = CursorCore::new(self.id);
        if let Some((k, _, flags)) = c.seek_raw(inner, name) {
            if k == name {
                return Err(if flags & BUCKET_LEAF_FLAG != 0 {
                    Error::BucketExists
                } else {
                    Error::IncompatibleValue
                });
            }
        }
        let value = empty_inline_value();
        let n = c.cursor_node(inner)?;
        inner.node_put(n, name, name, value.clone(), 0, BUCKET_LEAF_FLAG)?;
        let id = inner.open_bucket(self.id, name.to_vec(), &value);
        Ok(Bucket::handle(self.tx, id))
    }

    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        match self.create_bucket(name) {
            Ok(b) => Ok(b),
            Err(Error::BucketExists) => self
                .bucket(name)
                .ok_or_else(|| Error::Unexpected("existing bucket failed to open".into())),
            Err(e) => Err(e),
        }
    }

    /// Delete a child bucket, recursively freeing every page reachable
    /// from its subtree.
    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.tx.check_writable()?;
        {
            let inner = self.tx.inner.borrow();
            let mut c = CursorCore::new(self.id);
            match c.seek_raw(&inner, name) {
                Some((k, _, flags)) if k == name => {
                    if flags & BUCKET_LEAF_FLAG == 0 {
                        return Err(Error::IncompatibleValue);
                    }
                }
                _ => return Err(Error::BucketNotFound),
            }
        }
        let child = self
            .bucket(name)
            .ok_or_else(|| Error::Unexpected("bucket element failed to open".into()))?;

        // Depth-first: empty the child of its own sub-buckets first.
        let mut subs = Vec::new();
        child.for_each_bucket(|sub| {
            subs.push(sub.to_vec());
            Ok(())
        })?;
        for sub in subs {
            child.delete_bucket(&sub)?;
        }

        let mut guard = self.tx.inner.borrow_mut();
        let inner = &mut *guard;
        inner.buckets[self.id].children.remove(name);
        {
            let mut fl = self.tx.db.freelist.lock();
            inner.bucket_free(&mut fl, child.id)?;
        }
        inner.buckets[child.id].root_node = None;
        inner.buckets[child.id].nodes.clear();

        let mut c = CursorCore::new(self.id);
        match c.seek_raw(inner, name) {
            Some((k, _, _)) if k == name => {
                let n = c.cursor_node(inner)?;
                inner.node_del(n, name);
                Ok(())
            }
            _ => Err(Error::Unexpected("bucket element vanished mid-delete".into())),
        }
    }

    // ---------- sequences ----------

    pub fn sequence(&self) -> u64 {
        self.tx.inner.borrow().buckets[self.id].header.sequence
    }

    pub fn set_sequence(&self, v: u64) -> Result<()> {
        self.tx.check_writable()?;
        let mut guard = self.tx.inner.borrow_mut();
        let inner = &mut *guard;
        inner.touch_bucket_root(self.id)?;
        inner.buckets[self.id].header.sequence = v;
        Ok(())
    }

    pub fn next_sequence(&self) -> Result<u64> {
        self.tx.check_writable()?;
        let mut guard = self.tx.inner.borrow_mut();
        let inner = &mut *guard;
        inner.touch_bucket_root(self.id)?;
        inner.buckets[self.id].header.sequence += 1;
        Ok(inner.buckets[self.id].header.sequence)
    }

    // ---------- iteration ----------

    pub fn cursor(&self) -> Cursor<'tx> {
        Cursor::new(self.tx, CursorCore::new(self.id))
    }

    /// Visit every element in key order. Sub-bucket elements yield a
    /// `None` value. The callback's error stops the walk and is
    /// returned verbatim.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], Option<&[u8]>) -> Result<()>,
    {
        self.tx.check_open()?;
        let mut c = CursorCore::new(self.id);
        let mut item = {
            let inner = self.tx.inner.borrow();
            c.first_raw(&inner)
        };
        while let Some((k, v, flags)) = item {
            if flags & BUCKET_LEAF_FLAG != 0 {
                f(&k, None)?;
            } else {
                f(&k, Some(&v))?;
            }
            item = {
                let inner = self.tx.inner.borrow();
                c.next_raw(&inner)
            };
        }
        Ok(())
    }

    /// Visit every sub-bucket name in key order.
    pub fn for_each_bucket<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        self.tx.check_open()?;
        let mut c = CursorCore::new(self.id);
        let mut item = {
            let inner = self.tx.inner.borrow();
            c.first_raw(&inner)
        };
        while let Some((k, _, flags)) = item {
            if flags & BUCKET_LEAF_FLAG != 0 {
                f(&k)?;
            }
            item = {
                let inner = self.tx.inner.borrow();
                c.next_raw(&inner)
            };
        }
        Ok(())
    }

    /// Walk this bucket and its descendants. The writer's own nodes
    /// shadow their backing pages, so the totals cover uncommitted
    /// mutations of this transaction too.
    pub fn stats(&self) -> BucketStats {
        let inner = self.tx.inner.borrow();
        inner.bucket_stats(self.id)
    }
}

/// Serialized form of a brand-new inline bucket: zeroed header plus an
/// empty leaf page image.
fn empty_inline_value() -> Vec<u8> {
    let mut v = vec![0u8; BUCKET_HEADER_SIZE + PAGE_HEADER_SIZE];
    BucketHeader::default().write(&mut v[..BUCKET_HEADER_SIZE]);
    write_page_header(&mut v[BUCKET_HEADER_SIZE..], 0, PageFlags::LEAF, 0, 0);
    v
}

/// (key count, used bytes) of a serialized inline page image. Inline
/// buckets hold no sub-buckets, so every element is a plain key.
fn inline_image_stats(p: PageRef<'_>) -> (usize, usize) {
    let mut used = PAGE_HEADER_SIZE + p.count() * LEAF_ELEM_SIZE;
    for i in 0..p.count() {
        let e = p.leaf_elem(i);
        used += (e.ksize + e.vsize) as usize;
    }
    (p.count(), used)
}

impl TxInner {
    /// Materialize a child bucket from its element value.
    pub(crate) fn open_bucket(
        &mut self,
        parent: BucketId,
        name: Vec<u8>,
        value: &[u8],
    ) -> BucketId {
        let header = BucketHeader::read(&value[..BUCKET_HEADER_SIZE]);
        let mut data = BucketData::new(header);
        if header.root == 0 {
            data.inline_page = Some(value[BUCKET_HEADER_SIZE..].to_vec());
        }
        self.buckets.push(data);
        let id = self.buckets.len() - 1;
        self.buckets[parent].children.insert(name, id);
        id
    }

    /// Materialize the bucket's root node so a header-only change (the
    /// sequence) still spills.
    pub(crate) fn touch_bucket_root(&mut self, b: BucketId) -> Result<()> {
        if self.buckets[b].root_node.is_none() {
            let root = self.buckets[b].header.root;
            self.bucket_node(b, root, None)?;
        }
        Ok(())
    }

    /// Release every page reachable from the bucket's subtree. Inline
    /// buckets own no pages; their bytes vanish with the parent element.
    pub(crate) fn bucket_free(&mut self, fl: &mut Freelist, b: BucketId) -> Result<()> {
        if self.buckets[b].header.root == 0 {
            return Ok(());
        }
        let root = self.buckets[b].header.root;
        self.free_tree(fl, b, root)?;
        self.buckets[b].header.root = 0;
        Ok(())
    }

    fn free_tree(&mut self, fl: &mut Freelist, b: BucketId, pgid: PgId) -> Result<()> {
        // The writer's node shadows the page; free whichever is current.
        if let Some(&nid) = self.buckets[b].nodes.get(&pgid) {
            if !self.nodes[nid].is_leaf {
                let pgids: Vec<PgId> = self.nodes[nid].inodes.iter().map(|i| i.pgid).collect();
                for child in pgids {
                    self.free_tree(fl, b, child)?;
                }
            }
            let backing = self.nodes[nid].pgid;
            if backing > 0 {
                let overflow = self.page(backing).overflow();
                fl.free(self.meta.txid, backing, overflow)?;
                self.nodes[nid].pgid = 0;
            }
            return Ok(());
        }
        let (overflow, children) = {
            let p = self.page(pgid);
            let children: Vec<PgId> = if p.is_leaf() {
                Vec::new()
            } else {
                (0..p.count()).map(|i| p.branch_elem(i).pgid).collect()
            };
            (p.overflow(), children)
        };
        for child in children {
            self.free_tree(fl, b, child)?;
        }
        fl.free(self.meta.txid, pgid, overflow)
    }

    // ---------- spill ----------

    /// Write the bucket and its descendants to freshly allocated pages.
    /// Children are handled first so the parent's element values carry
    /// their final headers (or inline images).
    pub(crate) fn spill_bucket(&mut self, fl: &mut Freelist, b: BucketId) -> Result<()> {
        let mut names: Vec<Vec<u8>> = self.buckets[b].children.keys().cloned().collect();
        names.sort();
        for name in names {
            let Some(&child) = self.buckets[b].children.get(&name) else {
                continue;
            };
            let value = if self.bucket_inlineable(child) {
                self.bucket_free(fl, child)?;
                self.bucket_write_inline(child)?
            } else {
                self.spill_bucket(fl, child)?;
                let mut v = vec![0u8; BUCKET_HEADER_SIZE];
                self.buckets[child].header.write(&mut v);
                v
            };
            // Untouched child: nothing to rewrite in the parent.
            if self.buckets[child].root_node.is_none() {
                continue;
            }
            let mut c = CursorCore::new(b);
            match c.seek_raw(self, &name) {
                Some((k, _, flags)) if k == name && flags & BUCKET_LEAF_FLAG != 0 => {}
                _ => {
                    return Err(Error::Unexpected(
                        "bucket element missing during spill".into(),
                    ))
                }
            }
            let n = c.cursor_node(self)?;
            self.node_put(n, &name, &name, value, 0, BUCKET_LEAF_FLAG)?;
        }

        let Some(root_node) = self.buckets[b].root_node else {
            return Ok(());
        };
        self.node_spill(fl, root_node)?;
        let new_root = self.node_root(root_node);
        let pgid = self.nodes[new_root].pgid;
        if pgid >= self.meta.pgid {
            return Err(Error::Unexpected(format!(
                "bucket root {} beyond high water {}",
                pgid, self.meta.pgid
            )));
        }
        self.buckets[b].root_node = Some(new_root);
        self.buckets[b].header.root = pgid;
        Ok(())
    }

    /// A bucket stays inline while its whole leaf fits in a quarter page
    /// and it holds no sub-buckets.
    fn bucket_inlineable(&self, b: BucketId) -> bool {
        let Some(rn) = self.buckets[b].root_node else {
            return false;
        };
        let n = &self.nodes[rn];
        if !n.is_leaf {
            return false;
        }
        let max = self.page_size / 4;
        let mut size = PAGE_HEADER_SIZE;
        for inode in &n.inodes {
            size += LEAF_ELEM_SIZE + inode.key.len() + inode.value.len();
            if inode.flags & BUCKET_LEAF_FLAG != 0 {
                return false;
            }
            if size > max {
                return false;
            }
        }
        true
    }

    /// Serialize an inline bucket into its parent element value.
    fn bucket_write_inline(&mut self, b: BucketId) -> Result<Vec<u8>> {
        let Some(rn) = self.buckets[b].root_node else {
            return Err(Error::Unexpected("inline write without a root node".into()));
        };
        self.buckets[b].header.root = 0;
        let size = self.node_size(rn);
        let mut v = vec![0u8; BUCKET_HEADER_SIZE + size];
        self.buckets[b].header.write(&mut v[..BUCKET_HEADER_SIZE]);
        self.node_write_into(rn, &mut v[BUCKET_HEADER_SIZE..], 0, 0)?;
        Ok(v)
    }

    // ---------- stats ----------

    /// Totals for a materialized bucket. Resolution order mirrors the
    /// cursor and `free_tree`: the writer's node shadows its page, a
    /// materialized child bucket shadows its serialized element value.
    pub(crate) fn bucket_stats(&self, b: BucketId) -> BucketStats {
        let mut s = self.stats_bucket(b);
        s.branch_alloc = (s.branch_page_n + s.branch_overflow_n) * self.page_size;
        s.leaf_alloc = (s.leaf_page_n + s.leaf_overflow_n) * self.page_size;
        s
    }

    fn stats_bucket(&self, b: BucketId) -> BucketStats {
        let mut s = BucketStats {
            bucket_n: 1,
            ..Default::default()
        };
        let header = self.buckets[b].header;
        if header.root == 0 {
            s.inline_bucket_n = 1;
            s.depth = 1;
            if let Some(rn) = self.buckets[b].root_node {
                self.stats_node(b, rn, 1, &mut s, true);
            } else if let Some(img) = &self.buckets[b].inline_page {
                let (keys, used) = inline_image_stats(PageRef::new(img));
                s.key_n += keys;
                s.inline_bucket_inuse += used;
            }
        } else {
            self.stats_tree(Some(b), header.root, 1, &mut s);
        }
        s
    }

    fn stats_tree(&self, b: Option<BucketId>, pgid: PgId, depth: usize, s: &mut BucketStats) {
        if let Some(bid) = b {
            if let Some(&nid) = self.buckets[bid].nodes.get(&pgid) {
                self.stats_node(bid, nid, depth, s, false);
                return;
            }
        }
        self.stats_page(b, pgid, depth, s);
    }

    /// Totals for a live node; sizes are what spill would serialize.
    fn stats_node(&self, b: BucketId, nid: NodeId, depth: usize, s: &mut BucketStats, inline: bool) {
        let size = self.node_size(nid);
        if self.nodes[nid].is_leaf {
            if inline {
                s.inline_bucket_inuse += size;
            } else {
                s.leaf_page_n += 1;
                s.leaf_overflow_n += size / self.page_size;
                s.leaf_inuse += size;
            }
            if depth > s.depth {
                s.depth = depth;
            }
            for inode in &self.nodes[nid].inodes {
                if inode.flags & BUCKET_LEAF_FLAG != 0 {
                    let sub = self.stats_sub(Some(b), &inode.key, &inode.value);
                    s.absorb(&sub);
                } else {
                    s.key_n += 1;
                }
            }
        } else {
            s.branch_page_n += 1;
            s.branch_overflow_n += size / self.page_size;
            s.branch_inuse += size;
            for inode in &self.nodes[nid].inodes {
                self.stats_tree(Some(b), inode.pgid, depth + 1, s);
            }
        }
    }

    fn stats_page(&self, b: Option<BucketId>, pgid: PgId, depth: usize, s: &mut BucketStats) {
        let p = self.page(pgid);
        if p.is_leaf() {
            s.leaf_page_n += 1;
            s.leaf_overflow_n += p.overflow() as usize;
            if depth > s.depth {
                s.depth = depth;
            }
            let mut used = PAGE_HEADER_SIZE + p.count() * LEAF_ELEM_SIZE;
            for i in 0..p.count() {
                let e = p.leaf_elem(i);
                used += (e.ksize + e.vsize) as usize;
                if e.is_bucket() {
                    let sub = self.stats_sub(b, p.leaf_key(i), p.leaf_value(i));
                    s.absorb(&sub);
                } else {
                    s.key_n += 1;
                }
            }
            s.leaf_inuse += used;
        } else {
            s.branch_page_n += 1;
            s.branch_overflow_n += p.overflow() as usize;
            let mut used = PAGE_HEADER_SIZE + p.count() * BRANCH_ELEM_SIZE;
            for i in 0..p.count() {
                let e = p.branch_elem(i);
                used += e.ksize as usize;
                self.stats_tree(b, e.pgid, depth + 1, s);
            }
            s.branch_inuse += used;
        }
    }

    /// Totals for a sub-bucket element. A materialized child carries the
    /// transaction's uncommitted state; otherwise the serialized value
    /// is the truth.
    fn stats_sub(&self, parent: Option<BucketId>, name: &[u8], value: &[u8]) -> BucketStats {
        if let Some(pid) = parent {
            if let Some(&child) = self.buckets[pid].children.get(name) {
                return self.stats_bucket(child);
            }
        }
        let header = BucketHeader::read(&value[..BUCKET_HEADER_SIZE]);
        let mut s = BucketStats {
            bucket_n: 1,
            ..Default::default()
        };
        if header.root == 0 {
            s.inline_bucket_n = 1;
            s.depth = 1;
            let (keys, used) = inline_image_stats(PageRef::new(&value[BUCKET_HEADER_SIZE..]));
            s.key_n += keys;
            s.inline_bucket_inuse += used;
        } else {
            // No node cache to consult below an unmaterialized root.
            self.stats_tree(None, header.root, 1, &mut s);
        }
        s
    }
}
