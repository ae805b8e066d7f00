/*
 * Created on Mon Apr 15 2024
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

//! Key order within nodes: comparisons, binary searches, fullness and
//! minimality accounting, and anchor (separator) record surgery in non-leaf
//! nodes. All mutators require the target node write-locked by the caller.

use {
    super::{Btree, OpCtx},
    crate::engine::{
        cache::MemNode,
        config::IndexMode,
        storage::node::{FKey, KeyLayout, NodeBuf, VKey, NODE_HEADER_SIZE, VLKEY_SIZE},
    },
    core::cmp::Ordering,
    std::sync::Arc,
};

/// An owned separator key travelling between nodes during splits, shifts and
/// merges. In syndrome mode only the syndrome is meaningful; in secondary mode
/// only the bytes are.
#[derive(Debug, Clone)]
pub(crate) struct SepKey {
    pub bytes: Vec<u8>,
    pub syndrome: u64,
    pub seqno: u64,
}

impl Btree {
    pub(crate) fn nonleaf_layout(&self) -> KeyLayout {
        match self.cfg.index_mode {
            IndexMode::Syndrome => KeyLayout::Fixed,
            IndexMode::Secondary => KeyLayout::VarNonleaf,
        }
    }
    pub(crate) fn layout_of(&self, nb: &NodeBuf) -> KeyLayout {
        if nb.is_leaf() {
            KeyLayout::VarLeaf
        } else {
            self.nonleaf_layout()
        }
    }
    /// Child pointer at position `idx`; `idx == nkeys` resolves to `rightmost`
    pub(crate) fn child_at(&self, nb: &NodeBuf, idx: u32) -> u64 {
        if idx == nb.nkeys() {
            nb.rightmost()
        } else {
            match self.nonleaf_layout() {
                KeyLayout::Fixed => nb.fkey(idx).child,
                _ => nb.vkey(idx).child,
            }
        }
    }
    /// anchor(i) vs probe
    fn anchor_cmp(&self, nb: &NodeBuf, i: u32, key: &[u8], syndrome: u64) -> Ordering {
        match self.nonleaf_layout() {
            KeyLayout::Fixed => nb.fkey(i).syndrome.cmp(&syndrome),
            _ => self.cmp.cmp(nb.vkey_key(i), key),
        }
    }
    /// leaf entry(i) vs probe. Syndrome-index leaves order by (syndrome, key);
    /// secondary-index leaves by the comparator alone.
    pub(crate) fn leaf_cmp(&self, nb: &NodeBuf, i: u32, key: &[u8], syndrome: u64) -> Ordering {
        match self.cfg.index_mode {
            IndexMode::Syndrome => nb
                .leaf_entry(i)
                .syndrome
                .cmp(&syndrome)
                .then_with(|| self.cmp.cmp(nb.leaf_key(i), key)),
            IndexMode::Secondary => self.cmp.cmp(nb.leaf_key(i), key),
        }
    }
    /// First anchor `>= key` and the child to descend into (the `<=` side)
    pub(crate) fn search_nonleaf(&self, nb: &NodeBuf, key: &[u8], syndrome: u64) -> (u32, u64) {
        let mut lo = 0u32;
        let mut hi = nb.nkeys();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.anchor_cmp(nb, mid, key, syndrome) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        (lo, self.child_at(nb, lo))
    }
    /// Lower bound in the leaf plus whether it is an exact hit
    pub(crate) fn search_leaf(&self, nb: &NodeBuf, key: &[u8], syndrome: u64) -> (u32, bool) {
        let mut lo = 0u32;
        let mut hi = nb.nkeys();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.leaf_cmp(nb, mid, key, syndrome) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let found = lo < nb.nkeys() && self.leaf_cmp(nb, lo, key, syndrome) == Ordering::Equal;
        (lo, found)
    }
    /// Trim a sorted multi-put window to the prefix that belongs in the subtree
    /// chosen at anchor `idx`: everything `<=` that anchor. The remainder gets
    /// re-dispatched from the outer multi-put loop.
    pub(crate) fn narrow_window(
        &self,
        nb: &NodeBuf,
        idx: u32,
        objs: &[(&[u8], &[u8])],
    ) -> usize {
        if idx == nb.nkeys() {
            // rightmost subtree: unbounded at this node
            return objs.len();
        }
        let mut n = 1;
        while n < objs.len() {
            let (key, _) = objs[n];
            let within = match self.nonleaf_layout() {
                KeyLayout::Fixed => self.syndrome_of(key) <= nb.fkey(idx).syndrome,
                _ => self.cmp.cmp(key, nb.vkey_key(idx)) != Ordering::Greater,
            };
            if !within {
                break;
            }
            n += 1;
        }
        n
    }
    // space accounting
    fn half_capacity(&self) -> u64 {
        (self.cfg.nodesize as u64 - NODE_HEADER_SIZE as u64) / 2
    }
    /// Bytes a write of `(key, vlen)` would consume in this leaf beyond what it
    /// can reclaim from an existing record of the same key
    pub(crate) fn leaf_required(&self, nb: &NodeBuf, key: &[u8], vlen: usize) -> u64 {
        let syndrome = self.syndrome_of(key);
        let overflow = (key.len() + vlen) as u64 >= self.cfg.big_object_threshold();
        let inline = if overflow { 0 } else { vlen as u64 };
        let (idx, found) = self.search_leaf(nb, key, syndrome);
        if found {
            let e = nb.leaf_entry(idx);
            let reclaimed = e.keylen as u64 + e.inline_len();
            (key.len() as u64 + inline).saturating_sub(reclaimed)
        } else {
            VLKEY_SIZE as u64 + key.len() as u64 + inline
        }
    }
    /// A non-leaf is full when it cannot take one more *maximum-sized* anchor:
    /// that slack is what guarantees a child split can always post its separator
    pub(crate) fn nonleaf_is_full(&self, nb: &NodeBuf) -> bool {
        match self.nonleaf_layout() {
            KeyLayout::Fixed => nb.nkeys() >= self.cfg.fkeys_per_node(),
            layout => {
                (nb.free_bytes(layout) as u64)
                    < layout.rec_size() as u64 + self.cfg.max_key_size as u64
            }
        }
    }
    pub(crate) fn node_is_full_for(&self, nb: &NodeBuf, key: &[u8], vlen: usize) -> bool {
        if nb.is_leaf() {
            self.leaf_required(nb, key, vlen) > nb.free_bytes(KeyLayout::VarLeaf) as u64
        } else {
            self.nonleaf_is_full(nb)
        }
    }
    /// Minimality drives rebalance consideration after deletes
    pub(crate) fn is_minimal(&self, nb: &NodeBuf) -> bool {
        if nb.is_overflow() {
            return false;
        }
        if nb.is_leaf() {
            return (nb.used_bytes(KeyLayout::VarLeaf) as u64) < self.half_capacity();
        }
        match self.nonleaf_layout() {
            KeyLayout::Fixed => nb.nkeys() < self.cfg.fkeys_per_node() / 2,
            layout => {
                nb.nkeys() == 0 || (nb.used_bytes(layout) as u64) < self.half_capacity()
            }
        }
    }
    pub(crate) fn leaf_minimal_after_delete(&self, nb: &NodeBuf, idx: u32) -> bool {
        let e = nb.leaf_entry(idx);
        let used = nb.used_bytes(KeyLayout::VarLeaf) as u64;
        used.saturating_sub(e.node_bytes()) < self.half_capacity()
    }
    // anchor surgery (parent must be write-locked and on the modified list)
    pub(crate) fn anchor_sep(&self, nb: &NodeBuf, idx: u32) -> SepKey {
        match self.nonleaf_layout() {
            KeyLayout::Fixed => {
                let k = nb.fkey(idx);
                SepKey {
                    bytes: Vec::new(),
                    syndrome: k.syndrome,
                    seqno: k.seqno,
                }
            }
            _ => {
                let k = nb.vkey(idx);
                SepKey {
                    bytes: nb.vkey_key(idx).to_vec(),
                    syndrome: 0,
                    seqno: k.seqno,
                }
            }
        }
    }
    pub(crate) fn insert_anchor(
        &self,
        _ctx: &mut OpCtx,
        parent: &Arc<MemNode>,
        idx: u32,
        sep: &SepKey,
        child: u64,
    ) {
        unsafe {
            // UNSAFE(@ohsayan): parent write-locked per the contract
            let nb = parent.pnode_mut();
            match self.nonleaf_layout() {
                KeyLayout::Fixed => {
                    nb.open_record_slot(KeyLayout::Fixed, idx);
                    nb.set_fkey(
                        idx,
                        FKey {
                            syndrome: sep.syndrome,
                            child,
                            seqno: sep.seqno,
                        },
                    );
                }
                _ => {
                    let pos = nb.alloc_var(&sep.bytes, None);
                    nb.open_record_slot(KeyLayout::VarNonleaf, idx);
                    nb.set_vkey(
                        idx,
                        VKey {
                            keylen: sep.bytes.len() as u32,
                            keypos: pos,
                            child,
                            seqno: sep.seqno,
                        },
                    );
                }
            }
        }
    }
    pub(crate) fn delete_anchor(&self, parent: &Arc<MemNode>, idx: u32) {
        unsafe {
            // UNSAFE(@ohsayan): parent write-locked per the contract
            let nb = parent.pnode_mut();
            match self.nonleaf_layout() {
                KeyLayout::Fixed => nb.close_record_slot(KeyLayout::Fixed, idx),
                _ => {
                    let rec = nb.vkey(idx);
                    nb.close_record_slot(KeyLayout::VarNonleaf, idx);
                    nb.free_var(KeyLayout::VarNonleaf, rec.keypos, rec.keylen);
                }
            }
        }
    }
    /// Swap the anchor key at `idx` for a new separator, preserving the child
    /// pointer (shift support)
    pub(crate) fn replace_anchor(&self, parent: &Arc<MemNode>, idx: u32, sep: &SepKey) {
        unsafe {
            // UNSAFE(@ohsayan): parent write-locked per the contract
            let nb = parent.pnode_mut();
            match self.nonleaf_layout() {
                KeyLayout::Fixed => {
                    let mut k = nb.fkey(idx);
                    k.syndrome = sep.syndrome;
                    k.seqno = sep.seqno;
                    nb.set_fkey(idx, k);
                }
                _ => {
                    let old = nb.vkey(idx);
                    nb.free_var(KeyLayout::VarNonleaf, old.keypos, old.keylen);
                    let pos = nb.alloc_var(&sep.bytes, None);
                    nb.set_vkey(
                        idx,
                        VKey {
                            keylen: sep.bytes.len() as u32,
                            keypos: pos,
                            child: old.child,
                            seqno: sep.seqno,
                        },
                    );
                }
            }
        }
    }
}
