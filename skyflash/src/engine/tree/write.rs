/*
 * Created on Mon Apr 29 2024
 *
 * This file is a part of Skyflash
 * Skyflash is a flash-optimized free and open-source embedded key/value
 * storage core written by Sayan Nandan ("the Author") with the vision
 * to provide durable, transactional containers of variable-sized records
 * without compromising on performance or concurrency
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

/*
    Write paths. Single-key insert/update/upsert all funnel into the atomic
    multi-put: descend with read coupling using the first (pivot) key, narrow the
    input window at every non-leaf, split full nodes after upgrading the parent
    (restarting from the root whenever the parent's modification sequence moved
    during the upgrade), then write as many window objects into the leaf as fit.
    Everything lands through the commit record.
*/

use {
    super::{keys::SepKey, Btree, OpCtx, WriteType, MWRITE_MAX_RESTARTS},
    crate::engine::{
        cache::MemNode,
        config::IndexMode,
        error::{EngineError, EngineResult},
        stats::Stat,
        storage::node::{KeyLayout, LeafEntry, NodeBuf, OVERFLOW_NODE},
    },
    core::cmp::Ordering,
    parking_lot::lock_api::RawRwLock,
    std::sync::{atomic::Ordering as MemOrd, Arc},
};

enum MwStep {
    Done(usize),
    Restart,
}

// record movers shared with the rebalance path

pub(super) fn copy_leaf_entry(src: &NodeBuf, i: u32, dst: &mut NodeBuf, at: u32) {
    let e = src.leaf_entry(i);
    let inline = (e.ptr == 0).then(|| src.leaf_inline_value(i));
    let pos = dst.alloc_var(src.leaf_key(i), inline);
    dst.open_record_slot(KeyLayout::VarLeaf, at);
    dst.set_leaf_entry(
        at,
        LeafEntry {
            keypos: pos as u16,
            ..e
        },
    );
}

/// Drop record `i` and its blob; overflow chains are untouched (the entry is
/// moving, not dying)
pub(super) fn remove_leaf_entry(nb: &mut NodeBuf, i: u32) {
    let e = nb.leaf_entry(i);
    nb.close_record_slot(KeyLayout::VarLeaf, i);
    nb.free_var(
        KeyLayout::VarLeaf,
        e.keypos as u32,
        e.keylen as u32 + e.inline_len() as u32,
    );
}

pub(super) fn copy_vkey(src: &NodeBuf, i: u32, dst: &mut NodeBuf, at: u32) {
    let k = src.vkey(i);
    let pos = dst.alloc_var(src.vkey_key(i), None);
    dst.open_record_slot(KeyLayout::VarNonleaf, at);
    dst.set_vkey(
        at,
        crate::engine::storage::node::VKey {
            keypos: pos,
            ..k
        },
    );
}

pub(super) fn remove_vkey(nb: &mut NodeBuf, i: u32) {
    let k = nb.vkey(i);
    nb.close_record_slot(KeyLayout::VarNonleaf, i);
    nb.free_var(KeyLayout::VarNonleaf, k.keypos, k.keylen);
}

impl Btree {
    /// Fail if the key exists
    pub fn insert(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.write_one(key, value, WriteType::Create)
    }
    /// Fail if the key is absent
    pub fn update(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.write_one(key, value, WriteType::Update)
    }
    /// Write either way
    pub fn upsert(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.write_one(key, value, WriteType::Set)
    }
    fn write_one(&self, key: &[u8], value: &[u8], wtype: WriteType) -> EngineResult<()> {
        let objs = [(key, value)];
        let n = self.mwrite(&objs, wtype)?;
        debug_assert_eq!(n, 1);
        self.stats.incr(Stat::Writes);
        Ok(())
    }
    /// The ordering keys must arrive in for a multi-put: tree order, which in
    /// syndrome mode is `(syndrome, key)`
    pub fn key_order(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.cfg.index_mode {
            IndexMode::Syndrome => self
                .syndrome_of(a)
                .cmp(&self.syndrome_of(b))
                .then_with(|| self.cmp.cmp(a, b)),
            IndexMode::Secondary => self.cmp.cmp(a, b),
        }
    }
    /// Atomic multi-put of a tree-order-sorted key set. Returns how many objects
    /// were written; the set written within one leaf becomes visible together.
    /// A write-type violation on the very first pending object surfaces as an
    /// error; after partial progress the count is returned and the remainder is
    /// the caller's to retry.
    pub fn mwrite(&self, objs: &[(&[u8], &[u8])], wtype: WriteType) -> EngineResult<usize> {
        if objs.is_empty() {
            return Ok(0);
        }
        debug_assert!(
            objs.windows(2)
                .all(|w| self.key_order(w[0].0, w[1].0) == Ordering::Less),
            "multi-put input must be sorted in tree order"
        );
        let mut written = 0usize;
        while written < objs.len() {
            match self.mwrite_descend(&objs[written..], wtype) {
                Ok(n) => {
                    debug_assert!(n > 0);
                    if n == 0 {
                        break;
                    }
                    written += n;
                    self.stats.add(Stat::MwriteObjs, n as u64);
                }
                Err(e) => {
                    if written == 0 {
                        return Err(e);
                    }
                    break;
                }
            }
        }
        Ok(written)
    }
    /// One descent: writes a non-empty prefix of `objs` into a single leaf, or
    /// restarts after making split progress
    fn mwrite_descend(&self, objs: &[(&[u8], &[u8])], wtype: WriteType) -> EngineResult<usize> {
        let mut restarts = 0usize;
        loop {
            let mut ctx = OpCtx::new(self.cfg.nodesize as usize);
            self.lock.lock_shared();
            let step = self.mwrite_attempt(&mut ctx, objs, wtype);
            let commit = self.commit(&mut ctx);
            unsafe {
                // UNSAFE(@ohsayan): paired with the shared acquisition above
                self.lock.unlock_shared()
            }
            match step {
                Ok(MwStep::Done(n)) => return commit.and(Ok(n)),
                Ok(MwStep::Restart) => {
                    commit?;
                    self.stats.incr(Stat::Restarts);
                    restarts += 1;
                    if restarts > MWRITE_MAX_RESTARTS {
                        log::error!("multi-put starved after {restarts} restarts");
                        return Err(EngineError::Failure);
                    }
                }
                Err(e) => {
                    // the commit step already ran: partial structural work lands
                    let _ = commit;
                    return Err(e);
                }
            }
        }
    }
    fn mwrite_attempt(
        &self,
        ctx: &mut OpCtx,
        mut objs: &[(&[u8], &[u8])],
        wtype: WriteType,
    ) -> EngineResult<MwStep> {
        let (pivot, pivot_val) = objs[0];
        let psyn = self.syndrome_of(pivot);
        let mut node = self.acquire_root(ctx, true)?;
        let root_full = unsafe {
            // UNSAFE(@ohsayan): lock held via ctx
            self.node_is_full_for(node.pnode(), pivot, pivot_val.len())
        };
        if root_full {
            if !ctx.is_write_locked(&node) {
                let seq = node.modified_seq();
                self.release_read(ctx, &node);
                node.write_lock();
                ctx.wreference(node.clone());
                if self.root_id() != node.id() || node.modified_seq() != seq {
                    return Ok(MwStep::Restart);
                }
            }
            self.split_root(ctx, &node)?;
            return Ok(MwStep::Restart);
        }
        loop {
            let is_leaf = unsafe {
                // UNSAFE(@ohsayan): lock held via ctx
                node.pnode().is_leaf()
            };
            if is_leaf {
                let n = self.leaf_write_window(ctx, &node, objs, wtype)?;
                return Ok(MwStep::Done(n));
            }
            let (idx, child_id, window, child_is_leaf) = {
                let nb = unsafe {
                    // UNSAFE(@ohsayan): lock held via ctx
                    node.pnode()
                };
                let (idx, child_id) = self.search_nonleaf(nb, pivot, psyn);
                let window = self.narrow_window(nb, idx, objs);
                (idx, child_id, window, nb.level() == 1)
            };
            let child = self.fetch_node(child_id)?;
            let already_ours = ctx.is_write_locked(&child);
            if !already_ours {
                if child_is_leaf {
                    child.write_lock();
                    ctx.wreference(child.clone());
                } else {
                    child.read_lock();
                    ctx.reference(child.clone());
                }
            }
            let child_full = unsafe {
                // UNSAFE(@ohsayan): we hold the child one way or another
                self.node_is_full_for(child.pnode(), pivot, pivot_val.len())
            };
            if child_full {
                if already_ours {
                    return Ok(MwStep::Restart);
                }
                // back off the child, take the parent exclusive, split the child
                if child_is_leaf {
                    ctx.unwreference(&child);
                    child.unlock_write();
                } else {
                    self.release_read(ctx, &child);
                }
                if !ctx.is_write_locked(&node) {
                    let seq = node.modified_seq();
                    self.release_read(ctx, &node);
                    node.write_lock();
                    ctx.wreference(node.clone());
                    if node.modified_seq() != seq {
                        return Ok(MwStep::Restart);
                    }
                }
                child.write_lock();
                ctx.wreference(child.clone());
                self.split_child(ctx, &node, idx, &child)?;
                // the anchors moved: re-search this node
                continue;
            }
            // parent released unless a split pinned it until commit
            if !ctx.is_write_locked(&node) {
                self.release_read(ctx, &node);
            }
            objs = &objs[..window];
            node = child;
        }
    }
    /// Write window objects into the (write-locked) leaf until one stops
    /// fitting or violates the write type
    fn leaf_write_window(
        &self,
        ctx: &mut OpCtx,
        leaf: &Arc<MemNode>,
        objs: &[(&[u8], &[u8])],
        wtype: WriteType,
    ) -> EngineResult<usize> {
        let mut count = 0usize;
        for &(key, value) in objs {
            let syn = self.syndrome_of(key);
            let (idx, found, required, free) = {
                let nb = unsafe {
                    // UNSAFE(@ohsayan): leaf write-locked via ctx
                    leaf.pnode()
                };
                let (idx, found) = self.search_leaf(nb, key, syn);
                (
                    idx,
                    found,
                    self.leaf_required(nb, key, value.len()),
                    nb.free_bytes(KeyLayout::VarLeaf) as u64,
                )
            };
            match wtype {
                WriteType::Create if found => {
                    if count == 0 {
                        return Err(EngineError::KeyExists);
                    }
                    break;
                }
                WriteType::Update if !found => {
                    if count == 0 {
                        return Err(EngineError::KeyNotFound);
                    }
                    break;
                }
                _ => {}
            }
            if required > free {
                break;
            }
            ctx.promote(leaf);
            if found {
                self.update_leaf_entry(ctx, leaf, idx, value)?;
            } else {
                self.insert_leaf_entry(ctx, leaf, idx, key, value, syn)?;
            }
            count += 1;
        }
        Ok(count)
    }
    pub(super) fn insert_leaf_entry(
        &self,
        ctx: &mut OpCtx,
        leaf: &Arc<MemNode>,
        idx: u32,
        key: &[u8],
        value: &[u8],
        syndrome: u64,
    ) -> EngineResult<()> {
        let overflow =
            (key.len() + value.len()) as u64 >= self.cfg.big_object_threshold();
        let ptr = if overflow {
            self.alloc_overflow(ctx, value)?
        } else {
            0
        };
        let seqno = self.seqno.next_seqno();
        unsafe {
            // UNSAFE(@ohsayan): leaf write-locked via ctx
            let nb = leaf.pnode_mut();
            let pos = nb.alloc_var(key, (!overflow).then_some(value));
            nb.open_record_slot(KeyLayout::VarLeaf, idx);
            nb.set_leaf_entry(
                idx,
                LeafEntry {
                    keylen: key.len() as u16,
                    keypos: pos as u16,
                    datalen: value.len() as u64,
                    ptr,
                    seqno,
                    syndrome,
                },
            );
        }
        Ok(())
    }
    pub(super) fn update_leaf_entry(
        &self,
        ctx: &mut OpCtx,
        leaf: &Arc<MemNode>,
        idx: u32,
        value: &[u8],
    ) -> EngineResult<()> {
        let old = unsafe {
            // UNSAFE(@ohsayan): leaf write-locked via ctx
            leaf.pnode().leaf_entry(idx)
        };
        if old.ptr != 0 {
            self.delete_overflow_chain(ctx, old.ptr)?;
        }
        let overflow =
            (old.keylen as usize + value.len()) as u64 >= self.cfg.big_object_threshold();
        let ptr = if overflow {
            self.alloc_overflow(ctx, value)?
        } else {
            0
        };
        let seqno = self.seqno.next_seqno();
        // the key bytes live in the blob about to be freed: stage them in the
        // operation's scratch buffer across the rewrite
        let mut kb = std::mem::take(&mut ctx.keybuf);
        unsafe {
            // UNSAFE(@ohsayan): leaf write-locked via ctx
            let nb = leaf.pnode_mut();
            kb.clear();
            kb.extend_from_slice(nb.leaf_key(idx));
            nb.free_var(
                KeyLayout::VarLeaf,
                old.keypos as u32,
                old.keylen as u32 + old.inline_len() as u32,
            );
            let pos = nb.alloc_var(&kb, (!overflow).then_some(value));
            nb.set_leaf_entry(
                idx,
                LeafEntry {
                    keylen: old.keylen,
                    keypos: pos as u16,
                    datalen: value.len() as u64,
                    ptr,
                    seqno,
                    syndrome: old.syndrome,
                },
            );
        }
        ctx.keybuf = kb;
        Ok(())
    }
    /// Remove a live entry: record, blob, and any overflow chain behind it
    pub(super) fn delete_leaf_entry(
        &self,
        ctx: &mut OpCtx,
        leaf: &Arc<MemNode>,
        idx: u32,
    ) -> EngineResult<()> {
        let e = unsafe {
            // UNSAFE(@ohsayan): leaf write-locked via ctx
            leaf.pnode().leaf_entry(idx)
        };
        if e.ptr != 0 {
            self.delete_overflow_chain(ctx, e.ptr)?;
        }
        unsafe {
            // UNSAFE(@ohsayan): as above
            let nb = leaf.pnode_mut();
            nb.close_record_slot(KeyLayout::VarLeaf, idx);
            nb.free_var(
                KeyLayout::VarLeaf,
                e.keypos as u32,
                e.keylen as u32 + e.inline_len() as u32,
            );
        }
        Ok(())
    }
    // overflow chains
    /// Build the chain for a big value. A failed allocation rolls the
    /// already-built prefix back (condemned, deleted at commit) before the error
    /// escapes.
    fn alloc_overflow(&self, ctx: &mut OpCtx, value: &[u8]) -> EngineResult<u64> {
        let chunk = self.cfg.nodesize_less_hdr() as usize;
        let mut created: Vec<Arc<MemNode>> = Vec::new();
        let mut head = 0u64;
        let mut failed = None;
        for part in value.chunks(chunk) {
            match self.new_node(ctx, OVERFLOW_NODE, 0) {
                Ok(n) => {
                    unsafe {
                        // UNSAFE(@ohsayan): new_node hands the node back
                        // write-locked
                        n.pnode_mut().body_mut(part.len()).copy_from_slice(part);
                    }
                    if let Some(prev) = created.last() {
                        unsafe {
                            // UNSAFE(@ohsayan): as above
                            prev.pnode_mut().set_next(n.id());
                        }
                    } else {
                        head = n.id();
                    }
                    created.push(n);
                }
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            for n in &created {
                ctx.condemn(n);
            }
            return Err(e);
        }
        Ok(head)
    }
    pub(super) fn delete_overflow_chain(&self, ctx: &mut OpCtx, head: u64) -> EngineResult<()> {
        let mut id = head;
        while id != 0 {
            let n = self.fetch_node(id)?;
            if !ctx.is_write_locked(&n) {
                n.write_lock();
                ctx.wreference(n.clone());
            }
            id = unsafe {
                // UNSAFE(@ohsayan): write lock taken right above
                n.pnode().next()
            };
            ctx.condemn(&n);
        }
        Ok(())
    }
    /// Copy an entry's value out: inline bytes, or the overflow chain walked
    /// `nodesize_less_hdr` bytes per hop
    pub(super) fn read_entry_value(
        &self,
        nb: &NodeBuf,
        idx: u32,
        out: &mut Vec<u8>,
    ) -> EngineResult<()> {
        let e = nb.leaf_entry(idx);
        out.clear();
        if e.ptr == 0 {
            out.extend_from_slice(nb.leaf_inline_value(idx));
            return Ok(());
        }
        out.reserve(e.datalen as usize);
        let chunk = self.cfg.nodesize_less_hdr() as usize;
        let mut remaining = e.datalen as usize;
        let mut id = e.ptr;
        while remaining > 0 {
            if id == 0 {
                log::error!("overflow chain shorter than datalen");
                return Err(EngineError::CorruptNode);
            }
            let n = self.fetch_node(id)?;
            n.read_lock();
            let take = remaining.min(chunk);
            unsafe {
                // UNSAFE(@ohsayan): read lock taken right above
                out.extend_from_slice(n.pnode().body(take));
                id = n.pnode().next();
            }
            n.unlock_read();
            remaining -= take;
        }
        Ok(())
    }
    // splits
    pub(super) fn split_root(&self, ctx: &mut OpCtx, root: &Arc<MemNode>) -> EngineResult<()> {
        ctx.promote(root);
        let level = unsafe {
            // UNSAFE(@ohsayan): root write-locked via ctx
            root.pnode().level()
        };
        let (sep, sibling) = self.split_into_new(ctx, root)?;
        let new_root = self.new_node(ctx, 0, level + 1)?;
        self.insert_anchor(ctx, &new_root, 0, &sep, sibling.id());
        unsafe {
            // UNSAFE(@ohsayan): new_node hands the node back write-locked
            new_root.pnode_mut().set_rightmost(root.id());
        }
        self.rootid.store(new_root.id(), MemOrd::Release);
        ctx.meta_dirty = true;
        log::debug!("root split: new root {} level {}", new_root.id(), level + 1);
        Ok(())
    }
    fn split_child(
        &self,
        ctx: &mut OpCtx,
        parent: &Arc<MemNode>,
        idx: u32,
        child: &Arc<MemNode>,
    ) -> EngineResult<()> {
        ctx.promote(parent);
        ctx.promote(child);
        let (sep, sibling) = self.split_into_new(ctx, child)?;
        self.insert_anchor(ctx, parent, idx, &sep, sibling.id());
        Ok(())
    }
    /// Split the write-locked, modified `node`: a fresh sibling takes the lower
    /// half (balanced by payload bytes for variable layouts, entry count for
    /// fixed) and the separator for the parent comes back. Non-leaf boundary
    /// records stop being records: the key moves up, the child pointer becomes
    /// the sibling's rightmost.
    fn split_into_new(
        &self,
        ctx: &mut OpCtx,
        node: &Arc<MemNode>,
    ) -> EngineResult<(SepKey, Arc<MemNode>)> {
        let (flags, level, layout, nkeys, total) = {
            let nb = unsafe {
                // UNSAFE(@ohsayan): node write-locked via ctx
                node.pnode()
            };
            let layout = self.layout_of(nb);
            (
                nb.flags(),
                nb.level(),
                layout,
                nb.nkeys(),
                nb.used_bytes(layout) as u64,
            )
        };
        debug_assert!(nkeys >= 2, "splitting a node with fewer than two keys");
        let sibling = self.new_node(ctx, flags, level)?;
        // pick the boundary: entries [0, k) leave
        let mut k = 0u32;
        {
            let nb = unsafe {
                // UNSAFE(@ohsayan): as above
                node.pnode()
            };
            let mut acc = 0u64;
            while k < nkeys - 1 {
                acc += match layout {
                    KeyLayout::VarLeaf => nb.leaf_entry(k).node_bytes(),
                    KeyLayout::VarNonleaf => {
                        KeyLayout::VarNonleaf.rec_size() as u64 + nb.vkey(k).keylen as u64
                    }
                    KeyLayout::Fixed => KeyLayout::Fixed.rec_size() as u64,
                };
                k += 1;
                if acc * 2 >= total {
                    break;
                }
            }
            if k == 0 {
                k = 1;
            }
            if layout == KeyLayout::VarLeaf && self.cfg.index_mode == IndexMode::Syndrome {
                // an equal-syndrome run must not straddle the boundary
                while k < nkeys - 1
                    && nb.leaf_entry(k).syndrome == nb.leaf_entry(k - 1).syndrome
                {
                    k += 1;
                }
            }
        }
        let sep = unsafe {
            // UNSAFE(@ohsayan): both nodes write-locked via ctx; distinct nodes
            let nb = node.pnode_mut();
            let sb = sibling.pnode_mut();
            match layout {
                KeyLayout::VarLeaf => {
                    for i in 0..k {
                        copy_leaf_entry(nb, i, sb, i);
                    }
                    for _ in 0..k {
                        remove_leaf_entry(nb, 0);
                    }
                    sb.set_rightmost(node.id());
                    let last = sb.nkeys() - 1;
                    let e = sb.leaf_entry(last);
                    SepKey {
                        bytes: sb.leaf_key(last).to_vec(),
                        syndrome: e.syndrome,
                        seqno: e.seqno,
                    }
                }
                KeyLayout::VarNonleaf => {
                    for i in 0..k - 1 {
                        copy_vkey(nb, i, sb, i);
                    }
                    let boundary = nb.vkey(k - 1);
                    let sep = SepKey {
                        bytes: nb.vkey_key(k - 1).to_vec(),
                        syndrome: 0,
                        seqno: boundary.seqno,
                    };
                    sb.set_rightmost(boundary.child);
                    for _ in 0..k {
                        remove_vkey(nb, 0);
                    }
                    sep
                }
                KeyLayout::Fixed => {
                    for i in 0..k - 1 {
                        sb.open_record_slot(KeyLayout::Fixed, i);
                        sb.set_fkey(i, nb.fkey(i));
                    }
                    let boundary = nb.fkey(k - 1);
                    sb.set_rightmost(boundary.child);
                    for _ in 0..k {
                        nb.close_record_slot(KeyLayout::Fixed, 0);
                    }
                    SepKey {
                        bytes: Vec::new(),
                        syndrome: boundary.syndrome,
                        seqno: boundary.seqno,
                    }
                }
            }
        };
        self.stats.incr(Stat::Splits);
        Ok((sep, sibling))
    }
}
