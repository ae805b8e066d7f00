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

/*
    The variable-key B+-tree. Two flavors, mutually exclusive per tree:

    - syndrome index: non-leaf nodes carry 64-bit key syndromes only (fixed
      records); leaves carry the full key and verify matches with a full compare
    - secondary index: non-leaf nodes carry variable-length keys compared by the
      caller's comparator

    Locking is three level: the tree rwlock (writers of all kinds take it shared,
    only the pessimistic delete/rebalance path takes it exclusive), per-node
    rwlocks in the L1 wrappers (descents couple root to leaf), and nothing else.
    Every mutating operation accumulates its work in an OpCtx commit record and
    finishes through `commit`, which writes each distinct dirty node exactly once,
    deletes what must die, and only then releases locks in list order.
*/

mod delete;
mod keys;
mod scan;
#[cfg(test)]
mod tests;
mod write;

pub use scan::{RangeMarker, RangeUpdateDecision};

use {
    crate::{
        engine::{
            cache::{L1Cache, MemNode},
            config::{IndexMode, TreeConfig},
            error::{EngineError, EngineResult},
            hash::hash64,
            mem::{dec_u32, dec_u64, enc_u32, enc_u64},
            stats::{Stat, StatSet},
            storage::{
                checksum::node_checksum,
                node::{NodeBuf, LEAF_NODE, META_LOGICAL_ID, OVERFLOW_NODE},
                store::{IdAlloc, MemStore, NodeIo},
            },
            trx::{NoTrx, TrxHook},
        },
        util::compiler,
    },
    chrono::{DateTime, Utc},
    core::cmp::Ordering,
    parking_lot::{lock_api::RawRwLock as _, RawRwLock},
    std::sync::{
        atomic::{AtomicU64, Ordering as MemOrd},
        Arc,
    },
    uuid::Uuid,
};

consts! {
    META_VERSION: u32 = 0x8888_0001;
    SNAP_VERSION: u32 = 0x9876_0001;
    /// metadata node body: version u32 | rootid u64 | logical_id_counter u64 |
    /// snap {version u32, max u32, total u32, scavenging u32}
    META_BODY_SIZE: usize = 36;
    ROOT_ACQUIRE_RETRIES: usize = 16;
    pub(crate) MWRITE_MAX_RESTARTS: usize = 64;
}

/// Total key order at the seam. The historical default orders by length first,
/// then bytes.
pub trait KeyCmp: Send + Sync {
    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering;
}

pub struct DefaultCmp;

impl KeyCmp for DefaultCmp {
    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }
}

/// Monotonically increasing sequence numbers stamped onto every write
pub trait SeqnoSource: Send + Sync {
    fn next_seqno(&self) -> u64;
}

pub struct MonotonicSeqno {
    c: AtomicU64,
}

impl MonotonicSeqno {
    pub fn new() -> Self {
        Self {
            c: AtomicU64::new(0),
        }
    }
}

impl Default for MonotonicSeqno {
    fn default() -> Self {
        Self::new()
    }
}

impl SeqnoSource for MonotonicSeqno {
    fn next_seqno(&self) -> u64 {
        self.c.fetch_add(1, MemOrd::AcqRel) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    /// fail with [`EngineError::KeyExists`] if the key is live
    Create,
    /// fail with [`EngineError::KeyNotFound`] if the key is absent
    Update,
    /// write either way
    Set,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l1_evictions: u64,
    pub node_writes: u64,
    pub node_reads: u64,
    pub leaf_nodes: u64,
    pub nonleaf_nodes: u64,
    pub overflow_nodes: u64,
    pub splits: u64,
    pub merges: u64,
    pub shifts: u64,
    pub restarts: u64,
    pub gets: u64,
    pub writes: u64,
    pub deletes: u64,
    pub mwrite_objs: u64,
    pub range_updates: u64,
}

impl TreeStats {
    pub fn node_count(&self) -> u64 {
        self.leaf_nodes + self.nonleaf_nodes + self.overflow_nodes
    }
}

/// Per-operation commit record. Replaces the original design's thread-local
/// modified/referenced/deleted arrays: it travels down the descent instead, and
/// carries the scratch key buffer (grown to one node) that in-place leaf
/// rewrites stage the key through.
pub(crate) struct OpCtx {
    /// read-locked references
    referenced: Vec<Arc<MemNode>>,
    /// write-locked but still clean (leaves awaiting their first modification)
    wreferenced: Vec<Arc<MemNode>>,
    /// write-locked and dirty, written at commit in insertion order
    modified: Vec<Arc<MemNode>>,
    /// write-locked, durably deleted at commit
    deleted: Vec<Arc<MemNode>>,
    pub(crate) keybuf: Vec<u8>,
    pub(crate) meta_dirty: bool,
}

fn position_of(list: &[Arc<MemNode>], n: &Arc<MemNode>) -> Option<usize> {
    list.iter().position(|x| Arc::ptr_eq(x, n))
}

impl OpCtx {
    pub(crate) fn new(nodesize: usize) -> Self {
        Self {
            referenced: Vec::new(),
            wreferenced: Vec::new(),
            modified: Vec::new(),
            deleted: Vec::new(),
            keybuf: Vec::with_capacity(nodesize),
            meta_dirty: false,
        }
    }
    pub(crate) fn reference(&mut self, n: Arc<MemNode>) {
        self.referenced.push(n)
    }
    pub(crate) fn unreference(&mut self, n: &Arc<MemNode>) {
        if let Some(i) = position_of(&self.referenced, n) {
            self.referenced.remove(i);
        }
    }
    pub(crate) fn wreference(&mut self, n: Arc<MemNode>) {
        self.wreferenced.push(n)
    }
    pub(crate) fn unwreference(&mut self, n: &Arc<MemNode>) {
        if let Some(i) = position_of(&self.wreferenced, n) {
            self.wreferenced.remove(i);
        }
    }
    pub(crate) fn is_modified(&self, n: &Arc<MemNode>) -> bool {
        position_of(&self.modified, n).is_some()
    }
    pub(crate) fn is_write_locked(&self, n: &Arc<MemNode>) -> bool {
        position_of(&self.modified, n).is_some()
            || position_of(&self.wreferenced, n).is_some()
            || position_of(&self.deleted, n).is_some()
    }
    pub(crate) fn holds(&self, n: &Arc<MemNode>) -> bool {
        self.is_write_locked(n) || position_of(&self.referenced, n).is_some()
    }
    /// Mark a write-locked node dirty, moving it to the modified list
    pub(crate) fn promote(&mut self, n: &Arc<MemNode>) {
        if self.is_modified(n) {
            return;
        }
        debug_assert!(
            position_of(&self.wreferenced, n).is_some(),
            "promoting a node that is not write locked"
        );
        self.unwreference(n);
        n.set_dirty();
        n.bump_modified();
        self.modified.push(n.clone());
    }
    /// Register a freshly created, already write-locked node as modified
    pub(crate) fn push_new(&mut self, n: Arc<MemNode>) {
        n.set_dirty();
        n.bump_modified();
        self.modified.push(n);
    }
    /// Condemn a write-locked node: pulled from the live lists, deleted at commit
    pub(crate) fn condemn(&mut self, n: &Arc<MemNode>) {
        if let Some(i) = position_of(&self.modified, n) {
            self.modified.remove(i);
        }
        if let Some(i) = position_of(&self.wreferenced, n) {
            self.wreferenced.remove(i);
        }
        n.set_deleted();
        n.bump_modified();
        self.deleted.push(n.clone());
    }
}

/// One B+-tree instance over a node store
pub struct Btree {
    cfg: TreeConfig,
    uuid: Uuid,
    created: DateTime<Utc>,
    rootid: AtomicU64,
    ids: IdAlloc,
    /// the tree-level lock; held shared by every operation, exclusive only by the
    /// rebalancing delete path
    lock: RawRwLock,
    l1: L1Cache,
    io: Arc<dyn NodeIo>,
    cmp: Arc<dyn KeyCmp>,
    seqno: Arc<dyn SeqnoSource>,
    trx: Arc<dyn TrxHook>,
    stats: StatSet,
}

impl Btree {
    /// Open (create or reload, per `cfg.reload`) a tree with the default
    /// comparator, sequence source and transaction hook
    pub fn open(cfg: TreeConfig, io: Arc<dyn NodeIo>) -> EngineResult<Self> {
        Self::open_with(
            cfg,
            io,
            Arc::new(DefaultCmp),
            Arc::new(MonotonicSeqno::new()),
            Arc::new(NoTrx),
        )
    }
    /// A fresh tree over a private in-memory store
    pub fn in_memory(mut cfg: TreeConfig) -> EngineResult<Self> {
        cfg.in_memory = true;
        cfg.reload = false;
        Self::open(cfg, Arc::new(MemStore::new()))
    }
    pub fn open_with(
        cfg: TreeConfig,
        io: Arc<dyn NodeIo>,
        cmp: Arc<dyn KeyCmp>,
        seqno: Arc<dyn SeqnoSource>,
        trx: Arc<dyn TrxHook>,
    ) -> EngineResult<Self> {
        cfg.validate()?;
        let io: Arc<dyn NodeIo> = if cfg.in_memory {
            Arc::new(MemStore::new())
        } else {
            io
        };
        let l1 = L1Cache::new(cfg.n_l1cache_buckets, trx.clone());
        let this = if cfg.reload {
            let (rootid, ckpt) = Self::load_meta(&*io, &cfg)?;
            let ids = IdAlloc::reload(ckpt, cfg.n_partition, cfg.n_partitions);
            let this = Self {
                uuid: Uuid::new_v4(),
                created: Utc::now(),
                rootid: AtomicU64::new(rootid),
                ids,
                lock: RawRwLock::INIT,
                l1,
                io,
                cmp,
                seqno,
                trx,
                stats: StatSet::new(),
                cfg,
            };
            log::info!(
                "tree {} reloaded: root={rootid} id_ckpt={ckpt}",
                this.uuid
            );
            this
        } else {
            // logical id 0 is the BAD_CHILD sentinel, never allocated
            let ids = IdAlloc::new(1, cfg.n_partition, cfg.n_partitions);
            let this = Self {
                uuid: Uuid::new_v4(),
                created: Utc::now(),
                rootid: AtomicU64::new(0),
                ids,
                lock: RawRwLock::INIT,
                l1,
                io,
                cmp,
                seqno,
                trx,
                stats: StatSet::new(),
                cfg,
            };
            this.create_initial_root()?;
            log::info!(
                "tree {} created at {}: root={}",
                this.uuid,
                this.created.to_rfc3339(),
                this.root_id()
            );
            this
        };
        Ok(this)
    }
    pub fn config(&self) -> &TreeConfig {
        &self.cfg
    }
    pub fn root_id(&self) -> u64 {
        self.rootid.load(MemOrd::Acquire)
    }
    pub fn stats(&self) -> TreeStats {
        TreeStats {
            l1_hits: self.l1.hits(),
            l1_misses: self.l1.misses(),
            l1_evictions: self.l1.evictions(),
            node_writes: self.stats.get(Stat::NodeWrites),
            node_reads: self.stats.get(Stat::NodeReads),
            leaf_nodes: self.stats.get(Stat::LeafNodes),
            nonleaf_nodes: self.stats.get(Stat::NonleafNodes),
            overflow_nodes: self.stats.get(Stat::OverflowNodes),
            splits: self.stats.get(Stat::Splits),
            merges: self.stats.get(Stat::Merges),
            shifts: self.stats.get(Stat::Shifts),
            restarts: self.stats.get(Stat::Restarts),
            gets: self.stats.get(Stat::Gets),
            writes: self.stats.get(Stat::Writes),
            deletes: self.stats.get(Stat::Deletes),
            mwrite_objs: self.stats.get(Stat::MwriteObjs),
            range_updates: self.stats.get(Stat::RangeUpdates),
        }
    }
    // persistence
    fn meta_id(&self) -> u64 {
        META_LOGICAL_ID + self.cfg.n_partition as u64
    }
    /// Re-write the persistent metadata node. Called on create (unconditionally),
    /// on root changes and on id checkpoint crossings; never on the plain write
    /// path.
    pub(crate) fn write_meta(&self) -> EngineResult<()> {
        let rootid = self.root_id();
        let ckpt = self.ids.checkpoint();
        let mut buf = NodeBuf::new_zeroed(self.cfg.nodesize as usize);
        buf.init(self.meta_id(), 0, 0);
        {
            let body = buf.body_mut(META_BODY_SIZE);
            enc_u32(body, 0, META_VERSION);
            enc_u64(body, 4, rootid);
            enc_u64(body, 12, ckpt);
            // snapshot block preserved on disk for forward compatibility; the
            // snapshot operations themselves don't exist yet
            enc_u32(body, 20, SNAP_VERSION);
            enc_u32(body, 24, 0);
            enc_u32(body, 28, 0);
            enc_u32(body, 32, 0);
        }
        let sum = node_checksum(buf.as_bytes());
        buf.set_checksum(sum);
        self.io.write_node(self.meta_id(), buf.as_bytes())?;
        log::debug!("meta persisted: root={rootid} id_ckpt={ckpt}");
        Ok(())
    }
    fn load_meta(io: &dyn NodeIo, cfg: &TreeConfig) -> EngineResult<(u64, u64)> {
        let meta_id = META_LOGICAL_ID + cfg.n_partition as u64;
        let bytes = io.read_node(meta_id)?;
        let buf = NodeBuf::from_bytes(bytes);
        if node_checksum(buf.as_bytes()) != buf.checksum() {
            log::error!("metadata node failed checksum");
            return Err(EngineError::CorruptNode);
        }
        let body = buf.body(META_BODY_SIZE);
        if dec_u32(body, 0) != META_VERSION {
            log::error!("unsupported metadata version {:#x}", dec_u32(body, 0));
            return Err(EngineError::CorruptNode);
        }
        Ok((dec_u64(body, 4), dec_u64(body, 12)))
    }
    /// Durably flush the metadata node (shutdown/close path)
    pub fn flush(&self) -> EngineResult<()> {
        self.write_meta()?;
        self.io.flush_node(self.meta_id())
    }
    fn create_initial_root(&self) -> EngineResult<()> {
        let (id, _) = self.ids.next()?;
        self.io.create_node(id)?;
        let mut buf = NodeBuf::new_zeroed(self.cfg.nodesize as usize);
        buf.init(id, LEAF_NODE, 0);
        let sum = node_checksum(buf.as_bytes());
        buf.set_checksum(sum);
        self.io.write_node(id, buf.as_bytes())?;
        self.stats.incr(Stat::NodeWrites);
        self.stats.incr(Stat::LeafNodes);
        self.rootid.store(id, MemOrd::Release);
        self.write_meta()
    }
    // node plumbing
    pub(crate) fn syndrome_of(&self, key: &[u8]) -> u64 {
        match self.cfg.index_mode {
            IndexMode::Syndrome => hash64(key),
            IndexMode::Secondary => 0,
        }
    }
    /// L1 lookup with store fallback; the returned node is unlocked
    pub(crate) fn fetch_node(&self, id: u64) -> EngineResult<Arc<MemNode>> {
        debug_assert_ne!(id, 0, "BAD_CHILD dereference");
        if let Some(n) = self.l1.get(id) {
            return Ok(n);
        }
        let bytes = self.io.read_node(id)?;
        self.stats.incr(Stat::NodeReads);
        let buf = NodeBuf::from_bytes(bytes);
        if compiler::unlikely(node_checksum(buf.as_bytes()) != buf.checksum())
            || buf.logical_id() != id
        {
            log::error!("node {id} failed verification on read");
            return Err(EngineError::CorruptNode);
        }
        Ok(self.l1.add(MemNode::new(buf)))
    }
    /// Allocate, reserve and register a new node; returned write-locked and on
    /// the modified list
    pub(crate) fn new_node(
        &self,
        ctx: &mut OpCtx,
        flags: u32,
        level: u16,
    ) -> EngineResult<Arc<MemNode>> {
        let (id, crossed) = self.ids.next()?;
        if crossed {
            ctx.meta_dirty = true;
        }
        self.io.create_node(id)?;
        let mut buf = NodeBuf::new_zeroed(self.cfg.nodesize as usize);
        buf.init(id, flags, level);
        let node = self.l1.add(MemNode::new(buf));
        node.write_lock();
        ctx.push_new(node.clone());
        self.stats.incr(self.node_class(flags));
        Ok(node)
    }
    fn node_class(&self, flags: u32) -> Stat {
        if flags & OVERFLOW_NODE != 0 {
            Stat::OverflowNodes
        } else if flags & LEAF_NODE != 0 {
            Stat::LeafNodes
        } else {
            Stat::NonleafNodes
        }
    }
    /// The single cache-drain step ending every operation: write each distinct
    /// modified node exactly once (in insertion order), delete the condemned,
    /// then release every lock and reference. Runs even when the operation
    /// failed, so partial structural work (splits, overflow rollbacks) still
    /// lands.
    pub(crate) fn commit(&self, ctx: &mut OpCtx) -> EngineResult<()> {
        let mut status = Ok(());
        if ctx.meta_dirty {
            if let Err(e) = self.write_meta() {
                status = Err(e);
            }
            ctx.meta_dirty = false;
        }
        let mut written: Vec<u64> = Vec::with_capacity(ctx.modified.len());
        for node in &ctx.modified {
            if written.contains(&node.id()) {
                continue;
            }
            written.push(node.id());
            self.trx.cache_add(node.id());
            unsafe {
                // UNSAFE(@ohsayan): modified nodes are write-locked until the
                // release loop below
                let nb = node.pnode_mut();
                let sum = node_checksum(nb.as_bytes());
                nb.set_checksum(sum);
            }
            let image = unsafe {
                // UNSAFE(@ohsayan): as above
                node.pnode().as_bytes()
            };
            match self.io.write_node(node.id(), image) {
                Ok(()) => {
                    node.clear_dirty();
                    self.stats.incr(Stat::NodeWrites);
                }
                Err(e) => {
                    log::error!("write_node({}) failed", node.id());
                    status = Err(e);
                }
            }
        }
        for node in &ctx.deleted {
            let flags = unsafe {
                // UNSAFE(@ohsayan): condemned nodes are write-locked until below
                node.pnode().flags()
            };
            self.l1.delete(node.id());
            if let Err(e) = self.io.delete_node(node.id()) {
                log::error!("delete_node({}) failed", node.id());
                status = Err(e);
            }
            self.stats.decr(self.node_class(flags));
        }
        for node in ctx.modified.drain(..) {
            node.unlock_write();
        }
        for node in ctx.deleted.drain(..) {
            node.unlock_write();
        }
        for node in ctx.wreferenced.drain(..) {
            node.unlock_write();
        }
        for node in ctx.referenced.drain(..) {
            node.unlock_read();
        }
        status
    }
    /// Walk away from a descent that modified nothing
    pub(crate) fn abandon(&self, ctx: &mut OpCtx) {
        debug_assert!(ctx.modified.is_empty() && ctx.deleted.is_empty());
        for node in ctx.wreferenced.drain(..) {
            node.unlock_write();
        }
        for node in ctx.referenced.drain(..) {
            node.unlock_read();
        }
        ctx.meta_dirty = false;
    }
    pub(crate) fn release_read(&self, ctx: &mut OpCtx, node: &Arc<MemNode>) {
        ctx.unreference(node);
        node.unlock_read();
    }
    /// Take the root with the configured lock mode, retrying (bounded) when the
    /// root id moves underneath us
    pub(crate) fn acquire_root(
        &self,
        ctx: &mut OpCtx,
        leaf_write: bool,
    ) -> EngineResult<Arc<MemNode>> {
        for _ in 0..ROOT_ACQUIRE_RETRIES {
            let rid = self.root_id();
            let node = self.fetch_node(rid)?;
            node.read_lock();
            if self.root_id() != rid {
                node.unlock_read();
                self.stats.incr(Stat::Restarts);
                continue;
            }
            let is_leaf = unsafe {
                // UNSAFE(@ohsayan): read lock held
                node.pnode().is_leaf()
            };
            if leaf_write && is_leaf {
                let seq = node.modified_seq();
                node.unlock_read();
                node.write_lock();
                if self.root_id() != rid || node.modified_seq() != seq {
                    node.unlock_write();
                    self.stats.incr(Stat::Restarts);
                    continue;
                }
                ctx.wreference(node.clone());
            } else {
                ctx.reference(node.clone());
            }
            return Ok(node);
        }
        log::error!("root acquisition starved after {ROOT_ACQUIRE_RETRIES} retries");
        Err(EngineError::Failure)
    }
    /// Read-couple from the root down to the leaf owning `key`. With
    /// `leaf_write`, the leaf (and only the leaf) is taken exclusive.
    pub(crate) fn find_leaf(
        &self,
        ctx: &mut OpCtx,
        key: &[u8],
        syndrome: u64,
        leaf_write: bool,
    ) -> EngineResult<Arc<MemNode>> {
        let mut node = self.acquire_root(ctx, leaf_write)?;
        loop {
            let (is_leaf, child_id, child_is_leaf) = {
                let nb = unsafe {
                    // UNSAFE(@ohsayan): lock held via ctx
                    node.pnode()
                };
                if nb.is_leaf() {
                    (true, 0, false)
                } else {
                    let (_, child) = self.search_nonleaf(nb, key, syndrome);
                    (false, child, nb.level() == 1)
                }
            };
            if is_leaf {
                return Ok(node);
            }
            let child = self.fetch_node(child_id)?;
            if leaf_write && child_is_leaf {
                child.write_lock();
                ctx.wreference(child.clone());
            } else {
                child.read_lock();
                ctx.reference(child.clone());
            }
            // lock coupling: the parent goes only after the child is held
            self.release_read(ctx, &node);
            node = child;
        }
    }
    // point reads
    /// Read a value, allocating for it (`ALLOC_IF_TOO_SMALL` semantics)
    pub fn get(&self, key: &[u8]) -> EngineResult<Vec<u8>> {
        let mut out = Vec::new();
        self.get_common(key, None, &mut out)?;
        Ok(out)
    }
    /// Read a value into a caller buffer; fails with
    /// [`EngineError::BufferTooSmall`] (before any copying) when it cannot fit.
    /// Returns the value length.
    pub fn get_into(&self, key: &[u8], buf: &mut [u8]) -> EngineResult<usize> {
        let mut out = Vec::new();
        let n = self.get_common(key, Some(buf.len()), &mut out)?;
        buf[..n].copy_from_slice(&out);
        Ok(n)
    }
    fn get_common(
        &self,
        key: &[u8],
        cap: Option<usize>,
        out: &mut Vec<u8>,
    ) -> EngineResult<usize> {
        let syndrome = self.syndrome_of(key);
        self.lock.lock_shared();
        let mut ctx = OpCtx::new(self.cfg.nodesize as usize);
        let r = self.get_inner(&mut ctx, key, syndrome, cap, out);
        let c = self.commit(&mut ctx);
        unsafe {
            // UNSAFE(@ohsayan): paired with the shared acquisition above
            self.lock.unlock_shared()
        }
        self.stats.incr(Stat::Gets);
        r.and(c.map(|_| out.len()))
    }
    fn get_inner(
        &self,
        ctx: &mut OpCtx,
        key: &[u8],
        syndrome: u64,
        cap: Option<usize>,
        out: &mut Vec<u8>,
    ) -> EngineResult<()> {
        let leaf = self.find_leaf(ctx, key, syndrome, false)?;
        let nb = unsafe {
            // UNSAFE(@ohsayan): leaf read lock held via ctx
            leaf.pnode()
        };
        let (idx, found) = self.search_leaf(nb, key, syndrome);
        if !found {
            return Err(EngineError::KeyNotFound);
        }
        let entry = nb.leaf_entry(idx);
        if let Some(cap) = cap {
            if (entry.datalen as usize) > cap {
                return Err(EngineError::BufferTooSmall);
            }
        }
        self.read_entry_value(nb, idx, out)
    }
}
