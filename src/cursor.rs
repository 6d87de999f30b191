//! cursor — stackful positional iterator over one bucket.
//!
//! Each stack frame addresses either an immutable mapped page or a
//! writer-side node, plus an element index; operations pattern-match on
//! the two. The writer's nodes shadow their backing pages so uncommitted
//! mutations are visible to the same transaction.
//!
//! Returned keys and values are owned copies, clipped to exactly the
//! element bounds.

use crate::errors::{Error, Result};
use crate::page::{PageRef, PgId, BUCKET_LEAF_FLAG};
use crate::tx::{mask_bucket, BucketId, NodeId, Tx, TxInner};

#[derive(Debug, Clone, Copy)]
pub(crate) enum PageNode {
    Page(PgId),
    Node(NodeId),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ElemRef {
    pn: PageNode,
    index: usize,
}

/// Resolve a page of `bucket`; page-id 0 addresses the inline image of
/// an inline bucket.
fn resolve_page<'a>(inner: &'a TxInner, bucket: BucketId, pgid: PgId) -> PageRef<'a> {
    if inner.buckets[bucket].header.root == 0 {
        match inner.buckets[bucket].inline_page.as_deref() {
            Some(img) => PageRef::new(img),
            None => unreachable!("inline bucket without a page image"),
        }
    } else {
        inner.page(pgid)
    }
}

/// Core cursor state, usable from inside the transaction internals
/// (spill re-serialization positions with it too).
pub(crate) struct CursorCore {
    bucket: BucketId,
    stack: Vec<ElemRef>,
}

impl CursorCore {
    pub(crate) fn new(bucket: BucketId) -> Self {
        Self {
            bucket,
            stack: Vec::new(),
        }
    }

    fn root_pgid(&self, inner: &TxInner) -> PgId {
        inner.buckets[self.bucket].header.root
    }

    /// Prefer the writer's node over the mapped page.
    fn page_node(&self, inner: &TxInner, pgid: PgId) -> PageNode {
        let b = &inner.buckets[self.bucket];
        if b.header.root == 0 {
            // Inline bucket: the only page is its root image.
            if let Some(n) = b.root_node {
                return PageNode::Node(n);
            }
            return PageNode::Page(0);
        }
        match b.nodes.get(&pgid) {
            Some(&n) => PageNode::Node(n),
            None => PageNode::Page(pgid),
        }
    }

    fn count(&self, inner: &TxInner, e: &ElemRef) -> usize {
        match e.pn {
            PageNode::Node(n) => inner.nodes[n].inodes.len(),
            PageNode::Page(p) => resolve_page(inner, self.bucket, p).count(),
        }
    }

    fn is_leaf(&self, inner: &TxInner, e: &ElemRef) -> bool {
        match e.pn {
            PageNode::Node(n) => inner.nodes[n].is_leaf,
            PageNode::Page(p) => resolve_page(inner, self.bucket, p).is_leaf(),
        }
    }

    fn child_pgid(&self, inner: &TxInner, e: &ElemRef) -> PgId {
        match e.pn {
            PageNode::Node(n) => inner.nodes[n].inodes[e.index].pgid,
            PageNode::Page(p) => resolve_page(inner, self.bucket, p).branch_elem(e.index).pgid,
        }
    }

    /// (key, value, flags) at the current position, or None when the
    /// position is past the end or on an empty page.
    pub(crate) fn key_value(&self, inner: &TxInner) -> Option<(Vec<u8>, Vec<u8>, u32)> {
        let top = self.stack.last()?;
        let count = self.count(inner, top);
        if count == 0 || top.index >= count {
            return None;
        }
        match top.pn {
            PageNode::Node(n) => {
                let inode = &inner.nodes[n].inodes[top.index];
                Some((inode.key.clone(), inode.value.clone(), inode.flags))
            }
            PageNode::Page(p) => {
                let page = resolve_page(inner, self.bucket, p);
                let e = page.leaf_elem(top.index);
                Some((
                    page.leaf_key(top.index).to_vec(),
                    page.leaf_value(top.index).to_vec(),
                    e.flags,
                ))
            }
        }
    }

    // ---------- descent ----------

    fn go_first(&mut self, inner: &TxInner) {
        loop {
            let top = match self.stack.last() {
                Some(e) => *e,
                None => return,
            };
            if self.is_leaf(inner, &top) {
                return;
            }
            let pgid = self.child_pgid(inner, &top);
            let pn = self.page_node(inner, pgid);
            self.stack.push(ElemRef { pn, index: 0 });
        }
    }

    fn go_last(&mut self, inner: &TxInner) {
        loop {
            let top = match self.stack.last() {
                Some(e) => *e,
                None => return,
            };
            if self.is_leaf(inner, &top) {
                return;
            }
            let pgid = self.child_pgid(inner, &top);
            let pn = self.page_node(inner, pgid);
            let count = self.count(inner, &ElemRef { pn, index: 0 });
            self.stack.push(ElemRef {
                pn,
                index: count.saturating_sub(1),
            });
        }
    }

    pub(crate) fn first_raw(&mut self, inner: &TxInner) -> Option<(Vec<u8>, Vec<u8>, u32)> {
        self.stack.clear();
        let pn = self.page_node(inner, self.root_pgid(inner));
        self.stack.push(ElemRef { pn, index: 0 });
        self.go_first(inner);
        match self.key_value(inner) {
            Some(kv) => Some(kv),
            None => self.next_raw(inner),
        }
    }

    pub(crate) fn last_raw(&mut self, inner: &TxInner) -> Option<(Vec<u8>, Vec<u8>, u32)> {
        self.stack.clear();
        let pn = self.page_node(inner, self.root_pgid(inner));
        let count = self.count(inner, &ElemRef { pn, index: 0 });
        self.stack.push(ElemRef {
            pn,
            index: count.saturating_sub(1),
        });
        self.go_last(inner);
        match self.key_value(inner) {
            Some(kv) => Some(kv),
            None => self.prev_raw(inner),
        }
    }

    pub(crate) fn next_raw(&mut self, inner: &TxInner) -> Option<(Vec<u8>, Vec<u8>, u32)> {
        loop {
            // Deepest frame that can still advance.
            let mut level = self.stack.len();
            while level > 0 {
                let e = &mut self.stack[level - 1];
                let count = match e.pn {
                    PageNode::Node(n) => inner.nodes[n].inodes.len(),
                    PageNode::Page(p) => resolve_page(inner, self.bucket, p).count(),
                };
                if e.index + 1 < count {
                    e.index += 1;
                    break;
                }
                level -= 1;
            }
            if level == 0 {
                return None;
            }
            self.stack.truncate(level);
            self.go_first(inner);
            // Skip empty leaves left behind by merges.
            if let Some(kv) = self.key_value(inner) {
                return Some(kv);
            }
        }
    }

    pub(crate) fn prev_raw(&mut self, inner: &TxInner) -> Option<(Vec<u8>, Vec<u8>, u32)> {
        loop {
            while let Some(last) = self.stack.len().checked_sub(1) {
                if self.stack[last].index > 0 {
                    self.stack[last].index -= 1;
                    break;
                }
                self.stack.pop();
            }
            if self.stack.is_empty() {
                return None;
            }
            self.go_last(inner);
            if let Some(kv) = self.key_value(inner) {
                return Some(kv);
            }
        }
    }

    /// Position at the first element >= `key` within the leaf reached by
    /// the branch descent; None when that lands past the leaf's end.
    pub(crate) fn seek_raw(
        &mut self,
        inner: &TxInner,
        key: &[u8],
    ) -> Option<(Vec<u8>, Vec<u8>, u32)> {
        self.stack.clear();
        self.search(inner, key, self.root_pgid(inner));
        self.key_value(inner)
    }

    fn search(&mut self, inner: &TxInner, key: &[u8], pgid: PgId) {
        let pn = self.page_node(inner, pgid);
        let leaf = match pn {
            PageNode::Node(n) => inner.nodes[n].is_leaf,
            PageNode::Page(p) => resolve_page(inner, self.bucket, p).is_leaf(),
        };
        if leaf {
            let index = match pn {
                PageNode::Node(n) => inner.nodes[n]
                    .inodes
                    .partition_point(|i| i.key.as_slice() < key),
                PageNode::Page(p) => {
                    let page = resolve_page(inner, self.bucket, p);
                    leaf_search(page, key)
                }
            };
            self.stack.push(ElemRef { pn, index });
            return;
        }
        let (index, child) = match pn {
            PageNode::Node(n) => {
                let inodes = &inner.nodes[n].inodes;
                let i = branch_index(inodes.len(), key, |j| inodes[j].key.as_slice());
                (i, inodes[i].pgid)
            }
            PageNode::Page(p) => {
                let page = resolve_page(inner, self.bucket, p);
                let i = branch_index(page.count(), key, |j| page.branch_key(j));
                (i, page.branch_elem(i).pgid)
            }
        };
        self.stack.push(ElemRef { pn, index });
        self.search(inner, key, child);
    }

    /// Materialize the leaf node at the current position for mutation.
    /// Requires a prior seek.
    pub(crate) fn cursor_node(&self, inner: &mut TxInner) -> Result<NodeId> {
        let top = self
            .stack
            .last()
            .ok_or_else(|| Error::Unexpected("cursor node before a seek".into()))?;
        if let PageNode::Node(n) = top.pn {
            if inner.nodes[n].is_leaf {
                return Ok(n);
            }
        }
        let mut n = match self.stack[0].pn {
            PageNode::Node(id) => id,
            PageNode::Page(pgid) => inner.bucket_node(self.bucket, pgid, None)?,
        };
        for e in &self.stack[..self.stack.len() - 1] {
            n = inner.node_child_at(n, e.index)?;
        }
        if !inner.nodes[n].is_leaf {
            return Err(Error::Unexpected("cursor descent ended on a branch".into()));
        }
        Ok(n)
    }
}

/// First leaf index with key >= target.
fn leaf_search(page: PageRef<'_>, key: &[u8]) -> usize {
    let mut lo = 0;
    let mut hi = page.count();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if page.leaf_key(mid) < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Branch descent index: the last child whose first key is <= target
/// (a strictly greater child is skipped); clamps to 0 below the tree's
/// smallest key.
fn branch_index<'a>(count: usize, key: &[u8], key_at: impl Fn(usize) -> &'a [u8]) -> usize {
    let mut lo = 0;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if key_at(mid) < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let exact = lo < count && key_at(lo) == key;
    if !exact && lo > 0 {
        lo - 1
    } else {
        lo
    }
}

/// Public cursor over a bucket.
pub struct Cursor<'tx> {
    tx: &'tx Tx<'tx>,
    core: CursorCore,
}

impl<'tx> Cursor<'tx> {
    pub(crate) fn new(tx: &'tx Tx<'tx>, core: CursorCore) -> Self {
        Self { tx, core }
    }

    /// Move to the first key. Sub-bucket elements yield `None` values.
    pub fn first(&mut self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        let inner = self.tx.inner.borrow();
        self.core.first_raw(&inner).map(mask_bucket)
    }

    pub fn last(&mut self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        let inner = self.tx.inner.borrow();
        self.core.last_raw(&inner).map(mask_bucket)
    }

    pub fn next(&mut self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        let inner = self.tx.inner.borrow();
        self.core.next_raw(&inner).map(mask_bucket)
    }

    pub fn prev(&mut self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        let inner = self.tx.inner.borrow();
        self.core.prev_raw(&inner).map(mask_bucket)
    }

    /// Position at the first key >= `key`, crossing leaf boundaries;
    /// None past the end of the bucket.
    pub fn seek(&mut self, key: &[u8]) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        let inner = self.tx.inner.borrow();
        match self.core.seek_raw(&inner, key) {
            Some(kv) => Some(mask_bucket(kv)),
            None => self.core.next_raw(&inner).map(mask_bucket),
        }
    }

    /// Remove the element at the current position.
    pub fn delete(&mut self) -> Result<()> {
        self.tx.check_writable()?;
        let kv = {
            let inner = self.tx.inner.borrow();
            self.core.key_value(&inner)
        };
        let Some((key, _, flags)) = kv else {
            return Ok(());
        };
        if flags & BUCKET_LEAF_FLAG != 0 {
            return Err(Error::IncompatibleValue);
        }
        let mut guard = self.tx.inner.borrow_mut();
        let inner = &mut *guard;
        let n = self.core.cursor_node(inner)?;
        inner.node_del(n, &key);
        Ok(())
    }
}
