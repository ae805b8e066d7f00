/*
 * Created on Thu May 16 2024
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
    Range operations. Neither is a snapshot: each call works leaf-at-a-time under
    the tree's shared lock and resumes by position, so writers outside the
    current leaf interleave freely. Resumption is anchored on the separator keys
    observed during the descent (strictly-greater re-descent), never on leaf
    chaining, so concurrent splits can't make a scan skip or loop.
*/

use {
    super::{Btree, OpCtx},
    crate::engine::{
        cache::MemNode,
        config::IndexMode,
        error::{EngineError, EngineResult},
        stats::Stat,
        storage::node::{KeyLayout, NodeBuf},
    },
    core::cmp::Ordering,
    parking_lot::lock_api::RawRwLock,
    std::sync::Arc,
};

/// A resumption/bounding position in tree order: "everything strictly after
/// this". Secondary mode anchors on key bytes, syndrome mode on the syndrome
/// (equal-syndrome runs never straddle leaves, so this loses nothing).
#[derive(Debug, Clone)]
pub(crate) enum ScanPos {
    AfterKey(Vec<u8>),
    AfterSyn(u64),
}

enum ScanStep {
    Continue(ScanPos),
    Done,
}

/// What a range-update callback wants done with the visited entry
pub enum RangeUpdateDecision {
    /// the entry is past the range: stop
    End,
    /// leave this one alone, keep going
    Skip,
    /// replace the value
    Update(Vec<u8>),
}

#[derive(Debug, Clone, Default)]
/// Caller-owned resumption state for [`Btree::range_update`]. After a
/// [`EngineError::RangeUpdateNeedsSpace`] failure the offending key and its
/// replacement are stashed here; push them through [`Btree::update`] (which may
/// split) and call range_update again.
pub struct RangeMarker {
    set: bool,
    last_key: Vec<u8>,
    /// separator-syndrome resume (syndrome-index trees)
    syn_resume: bool,
    last_syn: u64,
    /// cumulative updated count across calls
    index: u64,
    retry_key: Vec<u8>,
    retry_data: Vec<u8>,
    has_retry: bool,
}

impl RangeMarker {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn is_set(&self) -> bool {
        self.set
    }
    pub fn updated_total(&self) -> u64 {
        self.index
    }
    pub fn retry(&self) -> Option<(&[u8], &[u8])> {
        self.has_retry
            .then(|| (&self.retry_key[..], &self.retry_data[..]))
    }
    pub fn clear_retry(&mut self) {
        self.has_retry = false;
        self.retry_key.clear();
        self.retry_data.clear();
    }
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl Btree {
    // scanning
    /// Visit `(key, value)` pairs in tree order starting at `start` (inclusive),
    /// until the visitor returns false or keys run out. Returns the visit count.
    pub fn range_scan<F>(&self, start: Option<&[u8]>, mut visit: F) -> EngineResult<u64>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let mut visited = 0u64;
        let mut valbuf = Vec::new();
        let mut pos: Option<ScanPos> = None;
        let mut first = true;
        loop {
            self.lock.lock_shared();
            let mut ctx = OpCtx::new(self.cfg.nodesize as usize);
            let r = self.scan_leaf_once(
                &mut ctx,
                if first { start } else { None },
                pos.as_ref(),
                &mut visit,
                &mut visited,
                &mut valbuf,
            );
            let c = self.commit(&mut ctx);
            unsafe {
                // UNSAFE(@ohsayan): paired with the shared acquisition above
                self.lock.unlock_shared()
            }
            first = false;
            match r {
                Ok(ScanStep::Continue(next)) => {
                    c?;
                    pos = Some(next);
                }
                Ok(ScanStep::Done) => {
                    c?;
                    return Ok(visited);
                }
                Err(e) => return Err(e),
            }
        }
    }
    /// One leaf's worth of scanning. `start` (inclusive lower bound) applies on
    /// the first call only; `pos` is the strictly-after resumption anchor.
    fn scan_leaf_once(
        &self,
        ctx: &mut OpCtx,
        start: Option<&[u8]>,
        pos: Option<&ScanPos>,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
        visited: &mut u64,
        valbuf: &mut Vec<u8>,
    ) -> EngineResult<ScanStep> {
        let (leaf, bound) = self.find_leaf_scan(ctx, start, pos, false)?;
        let nb = unsafe {
            // UNSAFE(@ohsayan): leaf read-locked via ctx
            leaf.pnode()
        };
        let first = match (start, pos) {
            (_, Some(p)) => self.leaf_pos_after(nb, p),
            (Some(k), None) => self.search_leaf(nb, k, self.syndrome_of(k)).0,
            (None, None) => 0,
        };
        for i in first..nb.nkeys() {
            self.read_entry_value(nb, i, valbuf)?;
            *visited += 1;
            if !visit(nb.leaf_key(i), valbuf) {
                return Ok(ScanStep::Done);
            }
        }
        Ok(match bound {
            Some(b) => ScanStep::Continue(b),
            None => ScanStep::Done,
        })
    }
    /// Descend to the leaf for a scan position. Returns the leaf (read- or
    /// write-locked per `leaf_write`) and the tightest separator bound passed on
    /// the way down, which is where the scan resumes after this leaf.
    pub(crate) fn find_leaf_scan(
        &self,
        ctx: &mut OpCtx,
        start: Option<&[u8]>,
        pos: Option<&ScanPos>,
        leaf_write: bool,
    ) -> EngineResult<(Arc<MemNode>, Option<ScanPos>)> {
        let mut node = self.acquire_root(ctx, leaf_write)?;
        let mut bound: Option<ScanPos> = None;
        loop {
            let step = {
                let nb = unsafe {
                    // UNSAFE(@ohsayan): lock held via ctx
                    node.pnode()
                };
                if nb.is_leaf() {
                    None
                } else {
                    let idx = match (start, pos) {
                        (_, Some(p)) => self.upper_anchor(nb, p),
                        (Some(k), None) => self.search_nonleaf(nb, k, self.syndrome_of(k)).0,
                        (None, None) => 0,
                    };
                    if idx < nb.nkeys() {
                        bound = Some(self.anchor_pos(nb, idx));
                    }
                    Some((self.child_at(nb, idx), nb.level() == 1))
                }
            };
            let (child_id, child_is_leaf) = match step {
                None => return Ok((node, bound)),
                Some(s) => s,
            };
            let child = self.fetch_node(child_id)?;
            if leaf_write && child_is_leaf {
                child.write_lock();
                ctx.wreference(child.clone());
            } else {
                child.read_lock();
                ctx.reference(child.clone());
            }
            self.release_read(ctx, &node);
            node = child;
        }
    }
    /// First anchor strictly greater than the position
    fn upper_anchor(&self, nb: &NodeBuf, p: &ScanPos) -> u32 {
        let mut lo = 0u32;
        let mut hi = nb.nkeys();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let le = match (self.nonleaf_layout(), p) {
                (KeyLayout::Fixed, ScanPos::AfterSyn(s)) => nb.fkey(mid).syndrome <= *s,
                (KeyLayout::Fixed, ScanPos::AfterKey(k)) => {
                    nb.fkey(mid).syndrome <= self.syndrome_of(k)
                }
                (_, ScanPos::AfterKey(k)) => {
                    self.cmp.cmp(nb.vkey_key(mid), k) != Ordering::Greater
                }
                (_, ScanPos::AfterSyn(_)) => {
                    debug_assert!(false, "syndrome position in a secondary index");
                    false
                }
            };
            if le {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
    fn anchor_pos(&self, nb: &NodeBuf, idx: u32) -> ScanPos {
        match self.nonleaf_layout() {
            KeyLayout::Fixed => ScanPos::AfterSyn(nb.fkey(idx).syndrome),
            _ => ScanPos::AfterKey(nb.vkey_key(idx).to_vec()),
        }
    }
    /// First leaf entry strictly greater than the position
    fn leaf_pos_after(&self, nb: &NodeBuf, p: &ScanPos) -> u32 {
        match p {
            ScanPos::AfterKey(k) => {
                let syn = self.syndrome_of(k);
                let (i, found) = self.search_leaf(nb, k, syn);
                i + found as u32
            }
            ScanPos::AfterSyn(s) => {
                let mut lo = 0u32;
                let mut hi = nb.nkeys();
                while lo < hi {
                    let mid = (lo + hi) / 2;
                    if nb.leaf_entry(mid).syndrome <= *s {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                lo
            }
        }
    }
    fn resume_pos_for(&self, key: &[u8]) -> ScanPos {
        match self.cfg.index_mode {
            IndexMode::Syndrome => ScanPos::AfterSyn(self.syndrome_of(key)),
            IndexMode::Secondary => ScanPos::AfterKey(key.to_vec()),
        }
    }
    // range update
    /// Scan keys from `low_key` (or the marker's resume point) and let `cb`
    /// decide per entry. Replacements that fit the leaf's free space go in
    /// place; the first one that doesn't stops the call with
    /// [`EngineError::RangeUpdateNeedsSpace`], the key/replacement stashed in
    /// the marker for a single-key retry. One leaf per call.
    ///
    /// Returns this call's update count; the marker accumulates the total.
    pub fn range_update(
        &self,
        low_key: &[u8],
        cb: &mut dyn FnMut(&[u8], &[u8]) -> RangeUpdateDecision,
        marker: &mut RangeMarker,
    ) -> EngineResult<usize> {
        self.lock.lock_shared();
        let mut ctx = OpCtx::new(self.cfg.nodesize as usize);
        let r = self.range_update_inner(&mut ctx, low_key, cb, marker);
        let c = self.commit(&mut ctx);
        unsafe {
            // UNSAFE(@ohsayan): paired with the shared acquisition above
            self.lock.unlock_shared()
        }
        self.stats.incr(Stat::RangeUpdates);
        match r {
            Ok(n) => {
                c?;
                Ok(n)
            }
            Err(e) => Err(e),
        }
    }
    fn range_update_inner(
        &self,
        ctx: &mut OpCtx,
        low_key: &[u8],
        cb: &mut dyn FnMut(&[u8], &[u8]) -> RangeUpdateDecision,
        marker: &mut RangeMarker,
    ) -> EngineResult<usize> {
        let resume = marker.set.then(|| {
            if marker.syn_resume {
                ScanPos::AfterSyn(marker.last_syn)
            } else {
                self.resume_pos_for(&marker.last_key)
            }
        });
        let (leaf, bound) = if marker.set {
            self.find_leaf_scan(ctx, None, resume.as_ref(), true)?
        } else {
            self.find_leaf_scan(ctx, Some(low_key), None, true)?
        };
        let mut i = {
            let nb = unsafe {
                // UNSAFE(@ohsayan): leaf write-locked via ctx
                leaf.pnode()
            };
            match &resume {
                Some(p) => self.leaf_pos_after(nb, p),
                None => self.search_leaf(nb, low_key, self.syndrome_of(low_key)).0,
            }
        };
        let mut count = 0usize;
        let mut valbuf = Vec::new();
        loop {
            let (done, key_copy) = {
                let nb = unsafe {
                    // UNSAFE(@ohsayan): as above
                    leaf.pnode()
                };
                if i >= nb.nkeys() {
                    (true, Vec::new())
                } else {
                    (false, nb.leaf_key(i).to_vec())
                }
            };
            if done {
                break;
            }
            {
                let nb = unsafe {
                    // UNSAFE(@ohsayan): as above
                    leaf.pnode()
                };
                self.read_entry_value(nb, i, &mut valbuf)?;
            }
            match cb(&key_copy, &valbuf) {
                RangeUpdateDecision::End => {
                    marker.index += count as u64;
                    marker.set = false;
                    marker.has_retry = false;
                    return Ok(count);
                }
                RangeUpdateDecision::Skip => {}
                RangeUpdateDecision::Update(new) => {
                    let fits = {
                        let nb = unsafe {
                            // UNSAFE(@ohsayan): as above
                            leaf.pnode()
                        };
                        let e = nb.leaf_entry(i);
                        let stays_inline = ((key_copy.len() + new.len()) as u64)
                            < self.cfg.big_object_threshold();
                        stays_inline
                            && new.len() as u64
                                <= nb.free_bytes(KeyLayout::VarLeaf) as u64 + e.inline_len()
                    };
                    if !fits {
                        marker.set = true;
                        marker.syn_resume = false;
                        marker.last_key = key_copy.clone();
                        marker.retry_key = key_copy;
                        marker.retry_data = new;
                        marker.has_retry = true;
                        marker.index += count as u64;
                        return Err(EngineError::RangeUpdateNeedsSpace);
                    }
                    ctx.promote(&leaf);
                    self.update_leaf_entry(ctx, &leaf, i, &new)?;
                    count += 1;
                }
            }
            i += 1;
        }
        marker.index += count as u64;
        // resume strictly after the tightest separator seen on the way down; no
        // separator means this was the rightmost leaf and the walk is complete
        match bound {
            None => {
                marker.set = false;
                marker.has_retry = false;
            }
            Some(ScanPos::AfterKey(k)) => {
                marker.set = true;
                marker.syn_resume = false;
                marker.last_key = k;
            }
            Some(ScanPos::AfterSyn(s)) => {
                marker.set = true;
                marker.syn_resume = true;
                marker.last_syn = s;
            }
        }
        Ok(count)
    }
    // consistency check (test support)
    /// Validate per-node ordering and parent/child anchor bounds over the whole
    /// tree. Takes the tree exclusive; meant for tests and debug tooling.
    pub fn check(&self) -> EngineResult<u64> {
        self.lock.lock_exclusive();
        let r = self.check_subtree(self.root_id(), None, None);
        unsafe {
            // UNSAFE(@ohsayan): paired with the exclusive acquisition above
            self.lock.unlock_exclusive()
        }
        r
    }
    fn check_subtree(
        &self,
        id: u64,
        upper: Option<&ScanPos>,
        expect_level: Option<u16>,
    ) -> EngineResult<u64> {
        let node = self.fetch_node(id)?;
        let nb = unsafe {
            // UNSAFE(@ohsayan): tree exclusive in check()
            node.pnode()
        };
        if let Some(l) = expect_level {
            if nb.level() != l {
                log::error!("node {id}: level {} where {l} was expected", nb.level());
                return Err(EngineError::CorruptNode);
            }
        }
        let within = |key: &[u8], syn: u64| match upper {
            None => true,
            Some(ScanPos::AfterKey(u)) => self.cmp.cmp(key, u) != Ordering::Greater,
            Some(ScanPos::AfterSyn(s)) => syn <= *s,
        };
        if nb.is_leaf() {
            for i in 0..nb.nkeys() {
                if i > 0 {
                    let key = nb.leaf_key(i).to_vec();
                    let syn = nb.leaf_entry(i).syndrome;
                    if self.leaf_cmp(nb, i - 1, &key, syn) != Ordering::Less {
                        log::error!("node {id}: leaf keys out of order at {i}");
                        return Err(EngineError::CorruptNode);
                    }
                }
                if !within(nb.leaf_key(i), nb.leaf_entry(i).syndrome) {
                    log::error!("node {id}: leaf key {i} above its anchor bound");
                    return Err(EngineError::CorruptNode);
                }
            }
            return Ok(nb.nkeys() as u64);
        }
        let mut total = 0u64;
        let child_level = nb.level().checked_sub(1);
        for i in 0..nb.nkeys() {
            if i > 0 {
                let ordered = match self.nonleaf_layout() {
                    KeyLayout::Fixed => nb.fkey(i - 1).syndrome < nb.fkey(i).syndrome,
                    _ => self.cmp.cmp(nb.vkey_key(i - 1), nb.vkey_key(i)) == Ordering::Less,
                };
                if !ordered {
                    log::error!("node {id}: anchors out of order at {i}");
                    return Err(EngineError::CorruptNode);
                }
            }
            let (akey, asyn) = match self.nonleaf_layout() {
                KeyLayout::Fixed => (Vec::new(), nb.fkey(i).syndrome),
                _ => (nb.vkey_key(i).to_vec(), 0),
            };
            if !within(&akey, asyn) {
                log::error!("node {id}: anchor {i} above the inherited bound");
                return Err(EngineError::CorruptNode);
            }
            total += self.check_subtree(
                self.child_at(nb, i),
                Some(&self.anchor_pos(nb, i)),
                child_level,
            )?;
        }
        total += self.check_subtree(nb.rightmost(), upper, child_level)?;
        Ok(total)
    }
}
