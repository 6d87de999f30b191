//! node — writer-side mutable image of a page, plus the split /
//! spill / rebalance machinery.
//!
//! Nodes live in an arena inside the transaction (`TxInner::nodes`);
//! parent and child links are indices, never references, so the tree
//! can be edited freely and dies with the transaction. A node is
//! created lazily the first time a writer touches a page, shadows that
//! page for every lookup in the same transaction, and is serialized
//! back into freshly allocated pages during spill.

use crate::consts::{
    BRANCH_ELEM_SIZE, LEAF_ELEM_SIZE, MAX_FILL_PERCENT, MIN_FILL_PERCENT, MIN_KEYS_PER_BRANCH,
    MIN_KEYS_PER_LEAF, MIN_KEYS_PER_PAGE, PAGE_HEADER_SIZE,
};
use crate::errors::{Error, Result};
use crate::freelist::Freelist;
use crate::page::{
    write_branch_elem, write_leaf_elem, write_page_header, PageFlags, PageRef, PgId,
};
use crate::tx::{BucketId, NodeId, TxInner};

/// One in-memory element. Branch entries carry `pgid` and no value;
/// leaf entries carry `flags` and `value` and no pgid.
#[derive(Debug, Clone, Default)]
pub(crate) struct Inode {
    pub(crate) flags: u32,
    pub(crate) key: Vec<u8>,
    pub(crate) value: Vec<u8>,
    pub(crate) pgid: PgId,
}

#[derive(Debug)]
pub(crate) struct NodeData {
    pub(crate) bucket: BucketId,
    pub(crate) is_leaf: bool,
    /// Backing page, 0 while the node has not been spilled (or belongs
    /// to an inline bucket).
    pub(crate) pgid: PgId,
    pub(crate) parent: Option<NodeId>,
    /// Materialized child nodes, for spill ordering.
    pub(crate) children: Vec<NodeId>,
    /// First key at materialization time; the parent's separator for us.
    pub(crate) key: Vec<u8>,
    pub(crate) inodes: Vec<Inode>,
    pub(crate) unbalanced: bool,
    pub(crate) spilled: bool,
    /// Set once the node has been merged away; it must not be touched
    /// again even though its arena slot survives.
    pub(crate) dead: bool,
}

/// Decode a page image into in-memory entries.
pub(crate) fn read_inodes(page: PageRef<'_>) -> (bool, Vec<Inode>) {
    let count = page.count();
    let mut inodes = Vec::with_capacity(count);
    if page.is_leaf() {
        for i in 0..count {
            let e = page.leaf_elem(i);
            inodes.push(Inode {
                flags: e.flags,
                key: page.leaf_key(i).to_vec(),
                value: page.leaf_value(i).to_vec(),
                pgid: 0,
            });
        }
        (true, inodes)
    } else {
        for i in 0..count {
            let e = page.branch_elem(i);
            inodes.push(Inode {
                flags: 0,
                key: page.branch_key(i).to_vec(),
                value: Vec::new(),
                pgid: e.pgid,
            });
        }
        (false, inodes)
    }
}

impl TxInner {
    pub(crate) fn node_create(
        &mut self,
        bucket: BucketId,
        is_leaf: bool,
        parent: Option<NodeId>,
    ) -> NodeId {
        self.nodes.push(NodeData {
            bucket,
            is_leaf,
            pgid: 0,
            parent,
            children: Vec::new(),
            key: Vec::new(),
            inodes: Vec::new(),
            unbalanced: false,
            spilled: false,
            dead: false,
        });
        self.nodes.len() - 1
    }

    /// Materialize the node for a page of `bucket`, creating and caching
    /// it on first touch. `pgid` 0 addresses the root of an inline
    /// bucket, whose page image lives in the parent element's value.
    pub(crate) fn bucket_node(
        &mut self,
        bucket: BucketId,
        pgid: PgId,
        parent: Option<NodeId>,
    ) -> Result<NodeId> {
        if let Some(&nid) = self.buckets[bucket].nodes.get(&pgid) {
            return Ok(nid);
        }
        let nid = self.node_create(bucket, true, parent);
        match parent {
            Some(p) => self.nodes[p].children.push(nid),
            None => self.buckets[bucket].root_node = Some(nid),
        }
        let (is_leaf, inodes) = if self.buckets[bucket].header.root == 0 {
            if pgid != 0 {
                return Err(Error::Unexpected(format!(
                    "inline bucket cannot reference page {}",
                    pgid
                )));
            }
            let img = self.buckets[bucket].inline_page.as_ref().ok_or_else(|| {
                Error::Unexpected("inline bucket without a page image".into())
            })?;
            read_inodes(PageRef::new(img))
        } else {
            read_inodes(self.page(pgid))
        };
        let n = &mut self.nodes[nid];
        n.is_leaf = is_leaf;
        n.inodes = inodes;
        n.pgid = pgid;
        n.key = n.inodes.first().map(|i| i.key.clone()).unwrap_or_default();
        self.buckets[bucket].nodes.insert(pgid, nid);
        Ok(nid)
    }

    /// Materialize the child node at `index` of a branch node.
    pub(crate) fn node_child_at(&mut self, parent: NodeId, index: usize) -> Result<NodeId> {
        if self.nodes[parent].is_leaf {
            return Err(Error::Unexpected("child lookup on a leaf node".into()));
        }
        let bucket = self.nodes[parent].bucket;
        let pgid = self.nodes[parent].inodes[index].pgid;
        self.bucket_node(bucket, pgid, Some(parent))
    }

    /// Insert or replace an entry. `old_key` is the search position
    /// (equal to `new_key` except when a spill renames a separator).
    pub(crate) fn node_put(
        &mut self,
        id: NodeId,
        old_key: &[u8],
        new_key: &[u8],
        value: Vec<u8>,
        pgid: PgId,
        flags: u32,
    ) -> Result<()> {
        if pgid >= self.meta.pgid {
            return Err(Error::Unexpected(format!(
                "node put with pgid {} beyond high water {}",
                pgid, self.meta.pgid
            )));
        }
        if old_key.is_empty() || new_key.is_empty() {
            return Err(Error::Unexpected("node put with zero-length key".into()));
        }
        let n = &mut self.nodes[id];
        let idx = n.inodes.partition_point(|i| i.key.as_slice() < old_key);
        let exact = idx < n.inodes.len() && n.inodes[idx].key == old_key;
        if !exact {
            n.inodes.insert(idx, Inode::default());
        }
        let inode = &mut n.inodes[idx];
        inode.flags = flags;
        inode.key = new_key.to_vec();
        inode.value = value;
        inode.pgid = pgid;
        Ok(())
    }

    /// Remove an entry if present; absent keys are ignored.
    pub(crate) fn node_del(&mut self, id: NodeId, key: &[u8]) {
        let n = &mut self.nodes[id];
        let idx = n.inodes.partition_point(|i| i.key.as_slice() < key);
        if idx >= n.inodes.len() || n.inodes[idx].key != key {
            return;
        }
        n.inodes.remove(idx);
        n.unbalanced = true;
    }

    /// Serialized byte size of the node, header included.
    pub(crate) fn node_size(&self, id: NodeId) -> usize {
        let n = &self.nodes[id];
        let elem = if n.is_leaf { LEAF_ELEM_SIZE } else { BRANCH_ELEM_SIZE };
        PAGE_HEADER_SIZE
            + n.inodes
                .iter()
                .map(|i| elem + i.key.len() + i.value.len())
                .sum::<usize>()
    }

    fn node_min_keys(&self, id: NodeId) -> usize {
        if self.nodes[id].is_leaf {
            MIN_KEYS_PER_LEAF
        } else {
            MIN_KEYS_PER_BRANCH
        }
    }

    /// Climb to the topmost node of this subtree.
    pub(crate) fn node_root(&self, mut id: NodeId) -> NodeId {
        while let Some(p) = self.nodes[id].parent {
            id = p;
        }
        id
    }

    fn node_remove_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[parent].children.retain(|&c| c != child);
    }

    /// Index of `child` among the parent's entries, by separator key.
    fn node_child_index(&self, parent: NodeId, child: NodeId) -> usize {
        let key = self.nodes[child].key.clone();
        self.nodes[parent]
            .inodes
            .partition_point(|i| i.key.as_slice() < key.as_slice())
    }

    /// Release the node's backing page run to the freelist.
    fn node_free(&mut self, fl: &mut Freelist, id: NodeId) -> Result<()> {
        let pgid = self.nodes[id].pgid;
        if pgid > 0 {
            let overflow = self.page(pgid).overflow();
            fl.free(self.meta.txid, pgid, overflow)?;
            self.nodes[id].pgid = 0;
        }
        Ok(())
    }

    /// Serialize the node into a logical page image.
    pub(crate) fn node_write_into(
        &self,
        id: NodeId,
        buf: &mut [u8],
        pgid: PgId,
        overflow: u32,
    ) -> Result<()> {
        let n = &self.nodes[id];
        if n.inodes.len() >= 0xFFFF {
            return Err(Error::Unexpected(format!(
                "node element count {} overflows the page header",
                n.inodes.len()
            )));
        }
        let (flags, elem_size) = if n.is_leaf {
            (PageFlags::LEAF, LEAF_ELEM_SIZE)
        } else {
            (PageFlags::BRANCH, BRANCH_ELEM_SIZE)
        };
        write_page_header(buf, pgid, flags, n.inodes.len(), overflow);
        let mut data_off = PAGE_HEADER_SIZE + n.inodes.len() * elem_size;
        for (i, inode) in n.inodes.iter().enumerate() {
            let elem_off = PAGE_HEADER_SIZE + i * elem_size;
            let pos = (data_off - elem_off) as u32;
            if n.is_leaf {
                write_leaf_elem(
                    buf,
                    i,
                    inode.flags,
                    pos,
                    inode.key.len() as u32,
                    inode.value.len() as u32,
                );
                buf[data_off..data_off + inode.key.len()].copy_from_slice(&inode.key);
                data_off += inode.key.len();
                buf[data_off..data_off + inode.value.len()].copy_from_slice(&inode.value);
                data_off += inode.value.len();
            } else {
                write_branch_elem(buf, i, pos, inode.key.len() as u32, inode.pgid);
                buf[data_off..data_off + inode.key.len()].copy_from_slice(&inode.key);
                data_off += inode.key.len();
            }
        }
        Ok(())
    }

    // ---------- spill ----------

    /// Write the dirty subtree rooted here into freshly allocated pages,
    /// children first so their new page-ids are known when the parents
    /// are serialized. Splits oversized nodes on the way.
    pub(crate) fn node_spill(&mut self, fl: &mut Freelist, id: NodeId) -> Result<()> {
        if self.nodes[id].spilled {
            return Ok(());
        }
        // Child spills can materialize new siblings under this node, so
        // the list may grow while we walk it.
        let mut i = 0;
        while i < self.nodes[id].children.len() {
            let child = self.nodes[id].children[i];
            self.node_spill(fl, child)?;
            i += 1;
        }
        self.nodes[id].children.clear();

        for nid in self.node_split(id)? {
            if self.nodes[nid].pgid > 0 {
                let old = self.nodes[nid].pgid;
                let overflow = self.page(old).overflow();
                fl.free(self.meta.txid, old, overflow)?;
                self.nodes[nid].pgid = 0;
            }
            let pages = (self.node_size(nid) / self.page_size) as u64 + 1;
            let pgid = self.allocate(fl, pages)?;
            let mut buf = vec![0u8; pages as usize * self.page_size];
            self.node_write_into(nid, &mut buf, pgid, (pages - 1) as u32)?;
            self.pages.insert(pgid, buf);
            {
                let n = &mut self.nodes[nid];
                n.pgid = pgid;
                n.spilled = true;
            }
            // Propagate the separator into the parent.
            if let Some(parent) = self.nodes[nid].parent {
                let old_key = if self.nodes[nid].key.is_empty() {
                    self.nodes[nid].inodes[0].key.clone()
                } else {
                    self.nodes[nid].key.clone()
                };
                let first = self.nodes[nid].inodes[0].key.clone();
                self.node_put(parent, &old_key, &first, Vec::new(), pgid, 0)?;
                self.nodes[nid].key = first;
            }
        }

        // A root split created a fresh parent above us; spill it too.
        if let Some(parent) = self.nodes[id].parent {
            if self.nodes[parent].pgid == 0 {
                self.nodes[parent].children.clear();
                return self.node_spill(fl, parent);
            }
        }
        Ok(())
    }

    /// Break the node into the minimum chain of page-sized siblings.
    fn node_split(&mut self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut parts = Vec::new();
        let mut cur = id;
        loop {
            let next = self.node_split_two(cur)?;
            parts.push(cur);
            match next {
                Some(n) => cur = n,
                None => break,
            }
        }
        Ok(parts)
    }

    /// Split off a right sibling when the node exceeds one page, placing
    /// the split point at the fill threshold. Creates the new parent if
    /// the root is splitting.
    fn node_split_two(&mut self, id: NodeId) -> Result<Option<NodeId>> {
        if self.nodes[id].inodes.len() <= MIN_KEYS_PER_PAGE * 2
            || self.node_size(id) < self.page_size
        {
            return Ok(None);
        }
        let fill = self.fill_percent.clamp(MIN_FILL_PERCENT, MAX_FILL_PERCENT);
        let threshold = (self.page_size as f32 * fill) as usize;
        let split_index = self.node_split_index(id, threshold);

        let parent = match self.nodes[id].parent {
            Some(p) => p,
            None => {
                let bucket = self.nodes[id].bucket;
                let p = self.node_create(bucket, false, None);
                self.nodes[p].children.push(id);
                self.nodes[id].parent = Some(p);
                p
            }
        };
        let bucket = self.nodes[id].bucket;
        let is_leaf = self.nodes[id].is_leaf;
        let next = self.node_create(bucket, is_leaf, Some(parent));
        self.nodes[parent].children.push(next);
        let tail = self.nodes[id].inodes.split_off(split_index);
        self.nodes[next].inodes = tail;
        Ok(Some(next))
    }

    /// First index that belongs to the right half: the left half keeps
    /// at least the minimum keys and stays at or under the threshold.
    fn node_split_index(&self, id: NodeId, threshold: usize) -> usize {
        let n = &self.nodes[id];
        let elem = if n.is_leaf { LEAF_ELEM_SIZE } else { BRANCH_ELEM_SIZE };
        let mut sz = PAGE_HEADER_SIZE;
        let mut index = 0;
        for i in 0..n.inodes.len() - MIN_KEYS_PER_PAGE {
            index = i;
            let el = elem + n.inodes[i].key.len() + n.inodes[i].value.len();
            if i >= MIN_KEYS_PER_PAGE && sz + el > threshold {
                break;
            }
            sz += el;
        }
        index
    }

    // ---------- rebalance ----------

    /// Merge or collapse this node if a delete left it under-filled.
    /// Cascades towards the root through the parent's own delete marks.
    pub(crate) fn node_rebalance(&mut self, fl: &mut Freelist, id: NodeId) -> Result<()> {
        if self.nodes[id].dead || !self.nodes[id].unbalanced {
            return Ok(());
        }
        self.nodes[id].unbalanced = false;

        let threshold = self.page_size / 4;
        if self.node_size(id) > threshold && self.nodes[id].inodes.len() > self.node_min_keys(id)
        {
            return Ok(());
        }

        let Some(parent) = self.nodes[id].parent else {
            // A branch root with a single child collapses into it.
            if !self.nodes[id].is_leaf && self.nodes[id].inodes.len() == 1 {
                let bucket = self.nodes[id].bucket;
                let child_pgid = self.nodes[id].inodes[0].pgid;
                let child = self.bucket_node(bucket, child_pgid, Some(id))?;
                self.nodes[id].is_leaf = self.nodes[child].is_leaf;
                self.nodes[id].inodes = std::mem::take(&mut self.nodes[child].inodes);
                self.nodes[id].children = std::mem::take(&mut self.nodes[child].children);
                let pgids: Vec<PgId> =
                    self.nodes[id].inodes.iter().map(|i| i.pgid).collect();
                for pg in pgids {
                    if let Some(&g) = self.buckets[bucket].nodes.get(&pg) {
                        self.nodes[g].parent = Some(id);
                    }
                }
                self.nodes[child].parent = None;
                self.buckets[bucket].nodes.remove(&child_pgid);
                self.node_free(fl, child)?;
                self.nodes[child].dead = true;
            }
            return Ok(());
        };

        let bucket = self.nodes[id].bucket;

        // An emptied node vanishes from its parent.
        if self.nodes[id].inodes.is_empty() {
            let key = self.nodes[id].key.clone();
            self.node_del(parent, &key);
            self.node_remove_child(parent, id);
            let pgid = self.nodes[id].pgid;
            self.buckets[bucket].nodes.remove(&pgid);
            self.node_free(fl, id)?;
            self.nodes[id].dead = true;
            return self.node_rebalance(fl, parent);
        }

        if self.nodes[parent].inodes.len() < 2 {
            return Err(Error::Unexpected(
                "rebalance parent must have at least 2 children".into(),
            ));
        }

        if self.node_child_index(parent, id) == 0 {
            // Leftmost: pull the next sibling into this node.
            let sib_pgid = self.nodes[parent].inodes[1].pgid;
            let sib = self.bucket_node(bucket, sib_pgid, Some(parent))?;
            self.node_adopt_children(sib, id);
            let mut moved = std::mem::take(&mut self.nodes[sib].inodes);
            self.nodes[id].inodes.append(&mut moved);
            let sib_key = self.nodes[sib].key.clone();
            self.node_del(parent, &sib_key);
            self.node_remove_child(parent, sib);
            self.buckets[bucket].nodes.remove(&sib_pgid);
            self.node_free(fl, sib)?;
            self.nodes[sib].dead = true;
        } else {
            // Otherwise push this node into the previous sibling.
            let idx = self.node_child_index(parent, id);
            let sib_pgid = self.nodes[parent].inodes[idx - 1].pgid;
            let sib = self.bucket_node(bucket, sib_pgid, Some(parent))?;
            self.node_adopt_children(id, sib);
            let mut moved = std::mem::take(&mut self.nodes[id].inodes);
            self.nodes[sib].inodes.append(&mut moved);
            let key = self.nodes[id].key.clone();
            self.node_del(parent, &key);
            self.node_remove_child(parent, id);
            let pgid = self.nodes[id].pgid;
            self.buckets[bucket].nodes.remove(&pgid);
            self.node_free(fl, id)?;
            self.nodes[id].dead = true;
        }

        self.node_rebalance(fl, parent)
    }

    /// Reparent every materialized child referenced by `from`'s entries
    /// onto `to`, ahead of merging `from`'s entries into `to`.
    fn node_adopt_children(&mut self, from: NodeId, to: NodeId) {
        let bucket = self.nodes[from].bucket;
        let pgids: Vec<PgId> = self.nodes[from].inodes.iter().map(|i| i.pgid).collect();
        for pg in pgids {
            if let Some(&c) = self.buckets[bucket].nodes.get(&pg) {
                if let Some(cp) = self.nodes[c].parent {
                    self.node_remove_child(cp, c);
                }
                self.nodes[c].parent = Some(to);
                self.nodes[to].children.push(c);
            }
        }
    }
}
