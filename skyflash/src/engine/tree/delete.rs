/*
 * Created on Tue May 07 2024
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
    Deletes. The optimistic path runs like any other single-key operation: tree
    lock shared, leaf taken exclusive, entry dropped in place, provided the leaf
    stays above the minimality line. When a delete *would* produce a minimal
    leaf, everything is abandoned and the operation re-runs under the tree's
    exclusive lock, rebalancing bottom-up: a rich true sibling donates entries
    across the anchor (shift), a poor one is merged with the anchor pulled down,
    and an emptied root hands the tree to its single remaining child.
*/

use {
    super::{
        keys::SepKey,
        write::{copy_leaf_entry, copy_vkey, remove_leaf_entry, remove_vkey},
        Btree, OpCtx,
    },
    crate::engine::{
        cache::MemNode,
        error::{EngineError, EngineResult},
        stats::Stat,
        storage::node::{FKey, KeyLayout, NODE_HEADER_SIZE, VKey},
    },
    parking_lot::lock_api::RawRwLock,
    std::sync::{atomic::Ordering as MemOrd, Arc},
};

enum BalanceOutcome {
    Balanced,
    NoPartner,
}

impl Btree {
    pub fn delete(&self, key: &[u8]) -> EngineResult<()> {
        let syn = self.syndrome_of(key);
        self.lock.lock_shared();
        let mut ctx = OpCtx::new(self.cfg.nodesize as usize);
        match self.delete_optimistic(&mut ctx, key, syn) {
            Ok(true) => {
                let c = self.commit(&mut ctx);
                unsafe {
                    // UNSAFE(@ohsayan): paired with the shared acquisition above
                    self.lock.unlock_shared()
                }
                self.stats.incr(Stat::Deletes);
                c
            }
            Ok(false) => {
                // would leave the leaf minimal: go around through the exclusive
                // rebalance path
                self.abandon(&mut ctx);
                unsafe {
                    // UNSAFE(@ohsayan): as above
                    self.lock.unlock_shared()
                }
                self.delete_pessimistic(key, syn)
            }
            Err(e) => {
                let _ = self.commit(&mut ctx);
                unsafe {
                    // UNSAFE(@ohsayan): as above
                    self.lock.unlock_shared()
                }
                Err(e)
            }
        }
    }
    fn delete_optimistic(&self, ctx: &mut OpCtx, key: &[u8], syn: u64) -> EngineResult<bool> {
        let leaf = self.find_leaf(ctx, key, syn, true)?;
        let (idx, found, minimal_after) = {
            let nb = unsafe {
                // UNSAFE(@ohsayan): leaf write-locked via ctx
                leaf.pnode()
            };
            let (idx, found) = self.search_leaf(nb, key, syn);
            let minimal_after = found && self.leaf_minimal_after_delete(nb, idx);
            (idx, found, minimal_after)
        };
        if !found {
            return Err(EngineError::KeyNotFound);
        }
        if leaf.id() != self.root_id() && minimal_after {
            return Ok(false);
        }
        ctx.promote(&leaf);
        self.delete_leaf_entry(ctx, &leaf, idx)?;
        Ok(true)
    }
    fn delete_pessimistic(&self, key: &[u8], syn: u64) -> EngineResult<()> {
        self.lock.lock_exclusive();
        let mut ctx = OpCtx::new(self.cfg.nodesize as usize);
        let r = self.rebalance_delete(&mut ctx, key, syn);
        let c = self.commit(&mut ctx);
        unsafe {
            // UNSAFE(@ohsayan): paired with the exclusive acquisition above
            self.lock.unlock_exclusive()
        }
        if r.is_ok() {
            self.stats.incr(Stat::Deletes);
        }
        r.and(c)
    }
    /// Fetch a node and take it exclusive exactly once per operation
    fn grab_excl(&self, ctx: &mut OpCtx, id: u64) -> EngineResult<Arc<MemNode>> {
        let n = self.fetch_node(id)?;
        if !ctx.holds(&n) {
            n.write_lock();
            ctx.wreference(n.clone());
        }
        Ok(n)
    }
    fn rebalance_delete(&self, ctx: &mut OpCtx, key: &[u8], syn: u64) -> EngineResult<()> {
        // descend, remembering which child position we took at each level
        let mut path: Vec<(Arc<MemNode>, u32)> = Vec::new();
        let mut node = self.grab_excl(ctx, self.root_id())?;
        loop {
            let step = {
                let nb = unsafe {
                    // UNSAFE(@ohsayan): exclusive tree lock; node grabbed above
                    node.pnode()
                };
                if nb.is_leaf() {
                    None
                } else {
                    Some(self.search_nonleaf(nb, key, syn))
                }
            };
            match step {
                None => break,
                Some((idx, child_id)) => {
                    let child = self.grab_excl(ctx, child_id)?;
                    path.push((node, idx));
                    node = child;
                }
            }
        }
        let (idx, found) = {
            let nb = unsafe {
                // UNSAFE(@ohsayan): as above
                node.pnode()
            };
            self.search_leaf(nb, key, syn)
        };
        if !found {
            // the key vanished between the optimistic attempt and here
            return Err(EngineError::KeyNotFound);
        }
        ctx.promote(&node);
        self.delete_leaf_entry(ctx, &node, idx)?;
        // walk back up; stop at the first level that ends non-minimal
        let mut child = node;
        for (parent, cidx) in path.into_iter().rev() {
            let minimal = unsafe {
                // UNSAFE(@ohsayan): as above
                self.is_minimal(child.pnode())
            };
            if !minimal {
                break;
            }
            match self.balance(ctx, &parent, cidx, &child)? {
                BalanceOutcome::Balanced => {}
                BalanceOutcome::NoPartner => break,
            }
            child = parent;
        }
        // an empty non-leaf root collapses onto its sole remaining child
        loop {
            let rid = self.root_id();
            let root = self.grab_excl(ctx, rid)?;
            let (is_leaf, nkeys, rm) = {
                let nb = unsafe {
                    // UNSAFE(@ohsayan): as above
                    root.pnode()
                };
                (nb.is_leaf(), nb.nkeys(), nb.rightmost())
            };
            if is_leaf || nkeys > 0 {
                break;
            }
            debug_assert_ne!(rm, 0);
            self.rootid.store(rm, MemOrd::Release);
            ctx.meta_dirty = true;
            ctx.condemn(&root);
            log::debug!("root collapse: {rid} -> {rm}");
        }
        Ok(())
    }
    /// Balance a minimal `child` (position `cidx` under `parent`) against a true
    /// sibling: shift from a rich one, merge with a poor one
    fn balance(
        &self,
        ctx: &mut OpCtx,
        parent: &Arc<MemNode>,
        cidx: u32,
        child: &Arc<MemNode>,
    ) -> EngineResult<BalanceOutcome> {
        let nkeys = unsafe {
            // UNSAFE(@ohsayan): exclusive tree lock; parent grabbed
            parent.pnode().nkeys()
        };
        let left_id = if cidx > 0 {
            Some(unsafe {
                // UNSAFE(@ohsayan): as above
                self.child_at(parent.pnode(), cidx - 1)
            })
        } else {
            None
        };
        let right_id = if cidx < nkeys {
            Some(unsafe {
                // UNSAFE(@ohsayan): as above
                self.child_at(parent.pnode(), cidx + 1)
            })
        } else {
            None
        };
        let lnode = match left_id {
            Some(id) => Some(self.grab_excl(ctx, id)?),
            None => None,
        };
        let rnode = match right_id {
            Some(id) => Some(self.grab_excl(ctx, id)?),
            None => None,
        };
        let rich = |n: &Arc<MemNode>| unsafe {
            // UNSAFE(@ohsayan): grabbed above
            !self.is_minimal(n.pnode())
        };
        if let Some(l) = lnode.as_ref().filter(|l| rich(*l)) {
            self.shift(ctx, parent, cidx - 1, l, child, true)?;
            self.stats.incr(Stat::Shifts);
            return Ok(BalanceOutcome::Balanced);
        }
        if let Some(r) = rnode.as_ref().filter(|r| rich(*r)) {
            self.shift(ctx, parent, cidx, child, r, false)?;
            self.stats.incr(Stat::Shifts);
            return Ok(BalanceOutcome::Balanced);
        }
        if let Some(l) = lnode.as_ref() {
            if self.merge(ctx, parent, cidx - 1, l, child)? {
                self.stats.incr(Stat::Merges);
                return Ok(BalanceOutcome::Balanced);
            }
        } else if let Some(r) = rnode.as_ref() {
            if self.merge(ctx, parent, cidx, child, r)? {
                self.stats.incr(Stat::Merges);
                return Ok(BalanceOutcome::Balanced);
            }
        }
        Ok(BalanceOutcome::NoPartner)
    }
    /// Redistribute one boundary record at a time across the anchor until the
    /// giver stops being strictly richer. `from_left` means `l` donates.
    fn shift(
        &self,
        ctx: &mut OpCtx,
        parent: &Arc<MemNode>,
        anchor_idx: u32,
        l: &Arc<MemNode>,
        r: &Arc<MemNode>,
        from_left: bool,
    ) -> EngineResult<()> {
        ctx.promote(parent);
        ctx.promote(l);
        ctx.promote(r);
        let layout = unsafe {
            // UNSAFE(@ohsayan): all three grabbed by the caller
            self.layout_of(l.pnode())
        };
        loop {
            let (giver_used, giver_keys, recv_used, moved) = unsafe {
                // UNSAFE(@ohsayan): as above
                let (gb, rb) = if from_left {
                    (l.pnode(), r.pnode())
                } else {
                    (r.pnode(), l.pnode())
                };
                let gk = gb.nkeys();
                let boundary = if from_left { gk.saturating_sub(1) } else { 0 };
                let moved = match layout {
                    KeyLayout::VarLeaf => gb.leaf_entry(boundary).node_bytes(),
                    KeyLayout::VarNonleaf => {
                        layout.rec_size() as u64 + gb.vkey(boundary).keylen as u64
                    }
                    KeyLayout::Fixed => layout.rec_size() as u64,
                };
                (
                    gb.used_bytes(layout) as u64,
                    gk,
                    rb.used_bytes(layout) as u64,
                    moved,
                )
            };
            if giver_keys <= 1 || giver_used <= recv_used + moved {
                break;
            }
            if from_left {
                self.rotate_right(parent, anchor_idx, l, r);
            } else {
                self.rotate_left(parent, anchor_idx, l, r);
            }
        }
        Ok(())
    }
    /// Move `l`'s last record over the anchor into `r`'s front
    fn rotate_right(
        &self,
        parent: &Arc<MemNode>,
        anchor_idx: u32,
        l: &Arc<MemNode>,
        r: &Arc<MemNode>,
    ) {
        unsafe {
            // UNSAFE(@ohsayan): caller holds all three exclusive
            let lb = l.pnode_mut();
            let rb = r.pnode_mut();
            match self.layout_of(lb) {
                KeyLayout::VarLeaf => {
                    let i = lb.nkeys() - 1;
                    copy_leaf_entry(lb, i, rb, 0);
                    remove_leaf_entry(lb, i);
                    let j = lb.nkeys() - 1;
                    let e = lb.leaf_entry(j);
                    let sep = SepKey {
                        bytes: lb.leaf_key(j).to_vec(),
                        syndrome: e.syndrome,
                        seqno: e.seqno,
                    };
                    self.replace_anchor(parent, anchor_idx, &sep);
                }
                KeyLayout::VarNonleaf => {
                    // the anchor key comes down in front of r, adopting l's
                    // rightmost child; l's last key goes up as the new anchor
                    let anchor = self.anchor_sep(parent.pnode(), anchor_idx);
                    let pos = rb.alloc_var(&anchor.bytes, None);
                    rb.open_record_slot(KeyLayout::VarNonleaf, 0);
                    rb.set_vkey(
                        0,
                        VKey {
                            keylen: anchor.bytes.len() as u32,
                            keypos: pos,
                            child: lb.rightmost(),
                            seqno: anchor.seqno,
                        },
                    );
                    let i = lb.nkeys() - 1;
                    let last = lb.vkey(i);
                    let sep = SepKey {
                        bytes: lb.vkey_key(i).to_vec(),
                        syndrome: 0,
                        seqno: last.seqno,
                    };
                    lb.set_rightmost(last.child);
                    remove_vkey(lb, i);
                    self.replace_anchor(parent, anchor_idx, &sep);
                }
                KeyLayout::Fixed => {
                    let anchor = self.anchor_sep(parent.pnode(), anchor_idx);
                    rb.open_record_slot(KeyLayout::Fixed, 0);
                    rb.set_fkey(
                        0,
                        FKey {
                            syndrome: anchor.syndrome,
                            child: lb.rightmost(),
                            seqno: anchor.seqno,
                        },
                    );
                    let i = lb.nkeys() - 1;
                    let last = lb.fkey(i);
                    lb.set_rightmost(last.child);
                    lb.close_record_slot(KeyLayout::Fixed, i);
                    self.replace_anchor(
                        parent,
                        anchor_idx,
                        &SepKey {
                            bytes: Vec::new(),
                            syndrome: last.syndrome,
                            seqno: last.seqno,
                        },
                    );
                }
            }
        }
    }
    /// Move `r`'s first record over the anchor onto `l`'s tail
    fn rotate_left(
        &self,
        parent: &Arc<MemNode>,
        anchor_idx: u32,
        l: &Arc<MemNode>,
        r: &Arc<MemNode>,
    ) {
        unsafe {
            // UNSAFE(@ohsayan): caller holds all three exclusive
            let lb = l.pnode_mut();
            let rb = r.pnode_mut();
            match self.layout_of(lb) {
                KeyLayout::VarLeaf => {
                    let at = lb.nkeys();
                    copy_leaf_entry(rb, 0, lb, at);
                    remove_leaf_entry(rb, 0);
                    let e = lb.leaf_entry(at);
                    let sep = SepKey {
                        bytes: lb.leaf_key(at).to_vec(),
                        syndrome: e.syndrome,
                        seqno: e.seqno,
                    };
                    self.replace_anchor(parent, anchor_idx, &sep);
                }
                KeyLayout::VarNonleaf => {
                    let anchor = self.anchor_sep(parent.pnode(), anchor_idx);
                    let at = lb.nkeys();
                    let lrm = lb.rightmost();
                    let pos = lb.alloc_var(&anchor.bytes, None);
                    lb.open_record_slot(KeyLayout::VarNonleaf, at);
                    lb.set_vkey(
                        at,
                        VKey {
                            keylen: anchor.bytes.len() as u32,
                            keypos: pos,
                            child: lrm,
                            seqno: anchor.seqno,
                        },
                    );
                    let first = rb.vkey(0);
                    let sep = SepKey {
                        bytes: rb.vkey_key(0).to_vec(),
                        syndrome: 0,
                        seqno: first.seqno,
                    };
                    lb.set_rightmost(first.child);
                    remove_vkey(rb, 0);
                    self.replace_anchor(parent, anchor_idx, &sep);
                }
                KeyLayout::Fixed => {
                    let anchor = self.anchor_sep(parent.pnode(), anchor_idx);
                    let at = lb.nkeys();
                    let lrm = lb.rightmost();
                    lb.open_record_slot(KeyLayout::Fixed, at);
                    lb.set_fkey(
                        at,
                        FKey {
                            syndrome: anchor.syndrome,
                            child: lrm,
                            seqno: anchor.seqno,
                        },
                    );
                    let first = rb.fkey(0);
                    lb.set_rightmost(first.child);
                    rb.close_record_slot(KeyLayout::Fixed, 0);
                    self.replace_anchor(
                        parent,
                        anchor_idx,
                        &SepKey {
                            bytes: Vec::new(),
                            syndrome: first.syndrome,
                            seqno: first.seqno,
                        },
                    );
                }
            }
        }
    }
    /// Concatenate `r` into `l` (the anchor reused as separator for non-leaves),
    /// drop the anchor from the parent and repoint the survivor. Skipped (false)
    /// when the combined payload wouldn't fit.
    fn merge(
        &self,
        ctx: &mut OpCtx,
        parent: &Arc<MemNode>,
        anchor_idx: u32,
        l: &Arc<MemNode>,
        r: &Arc<MemNode>,
    ) -> EngineResult<bool> {
        let layout = unsafe {
            // UNSAFE(@ohsayan): caller holds all three exclusive
            self.layout_of(l.pnode())
        };
        let fits = unsafe {
            // UNSAFE(@ohsayan): as above
            let lb = l.pnode();
            let rb = r.pnode();
            let anchor_extra = match layout {
                KeyLayout::VarLeaf => 0,
                KeyLayout::VarNonleaf => {
                    layout.rec_size() as u64
                        + self.anchor_sep(parent.pnode(), anchor_idx).bytes.len() as u64
                }
                KeyLayout::Fixed => layout.rec_size() as u64,
            };
            lb.used_bytes(layout) as u64 + rb.used_bytes(layout) as u64 + anchor_extra
                <= (self.cfg.nodesize as u64 - NODE_HEADER_SIZE as u64)
        };
        if !fits {
            return Ok(false);
        }
        ctx.promote(parent);
        ctx.promote(l);
        unsafe {
            // UNSAFE(@ohsayan): as above; l and r are distinct nodes
            let lb = l.pnode_mut();
            let rb = r.pnode();
            match layout {
                KeyLayout::VarLeaf => {
                    for i in 0..rb.nkeys() {
                        copy_leaf_entry(rb, i, lb, lb.nkeys());
                    }
                }
                KeyLayout::VarNonleaf => {
                    let anchor = self.anchor_sep(parent.pnode(), anchor_idx);
                    let at = lb.nkeys();
                    let lrm = lb.rightmost();
                    let pos = lb.alloc_var(&anchor.bytes, None);
                    lb.open_record_slot(KeyLayout::VarNonleaf, at);
                    lb.set_vkey(
                        at,
                        VKey {
                            keylen: anchor.bytes.len() as u32,
                            keypos: pos,
                            child: lrm,
                            seqno: anchor.seqno,
                        },
                    );
                    for i in 0..rb.nkeys() {
                        copy_vkey(rb, i, lb, lb.nkeys());
                    }
                }
                KeyLayout::Fixed => {
                    let anchor = self.anchor_sep(parent.pnode(), anchor_idx);
                    let at = lb.nkeys();
                    let lrm = lb.rightmost();
                    lb.open_record_slot(KeyLayout::Fixed, at);
                    lb.set_fkey(
                        at,
                        FKey {
                            syndrome: anchor.syndrome,
                            child: lrm,
                            seqno: anchor.seqno,
                        },
                    );
                    for i in 0..rb.nkeys() {
                        let at2 = lb.nkeys();
                        lb.open_record_slot(KeyLayout::Fixed, at2);
                        lb.set_fkey(at2, rb.fkey(i));
                    }
                }
            }
            lb.set_rightmost(rb.rightmost());
        }
        self.delete_anchor(parent, anchor_idx);
        unsafe {
            // UNSAFE(@ohsayan): parent exclusive per the contract
            let pb = parent.pnode_mut();
            // the record that pointed at r slid into the anchor's old slot
            if anchor_idx < pb.nkeys() {
                match self.nonleaf_layout() {
                    KeyLayout::Fixed => {
                        let mut k = pb.fkey(anchor_idx);
                        debug_assert_eq!(k.child, r.id());
                        k.child = l.id();
                        pb.set_fkey(anchor_idx, k);
                    }
                    _ => {
                        let mut k = pb.vkey(anchor_idx);
                        debug_assert_eq!(k.child, r.id());
                        k.child = l.id();
                        pb.set_vkey(anchor_idx, k);
                    }
                }
            } else {
                debug_assert_eq!(pb.rightmost(), r.id());
                pb.set_rightmost(l.id());
            }
        }
        ctx.condemn(r);
        Ok(true)
    }
}
