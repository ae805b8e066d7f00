/*
 * Created on Mon Mar 11 2024
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
    The L1 node cache: logical node id -> in-memory node wrapper. The cache is
    striped to keep internal contention off the hot path; pinning is the Arc
    strong count (a caller holding a reference pins the wrapper and its bytes),
    and the rwlock inside the wrapper is *logical* synchronization, fully
    independent of pinning. Eviction is strictly opportunistic: a clean, unpinned
    wrapper may be dropped whenever a stripe overflows its share of the
    configured capacity; there is no residency guarantee.
*/

use {
    crate::engine::{storage::node::NodeBuf, trx::TrxHook},
    parking_lot::{lock_api::RawRwLock as _, RawRwLock, RwLock},
    std::{
        cell::UnsafeCell,
        collections::HashMap,
        sync::{
            atomic::{AtomicU64, AtomicU8, Ordering},
            Arc,
        },
    },
};

const DEFAULT_STRIPES: usize = 256;
const MIN_STRIPE_CAP: usize = 8;

const NF_DIRTY: u8 = 1 << 0;
const NF_DELETED: u8 = 1 << 1;

/// One cached node. The byte image lives in an [`UnsafeCell`]: access is
/// serialized by the embedded rwlock, which callers take and release manually
/// because lock lifetime follows the operation's commit record, not lexical
/// scope.
pub struct MemNode {
    id: u64,
    lock: RawRwLock,
    modified: AtomicU64,
    nflags: AtomicU8,
    buf: UnsafeCell<NodeBuf>,
}

unsafe impl Send for MemNode {}
unsafe impl Sync for MemNode {}

impl MemNode {
    pub fn new(buf: NodeBuf) -> Arc<Self> {
        Arc::new(Self {
            id: buf.logical_id(),
            lock: RawRwLock::INIT,
            modified: AtomicU64::new(0),
            nflags: AtomicU8::new(0),
            buf: UnsafeCell::new(buf),
        })
    }
    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }
    // lock surface
    pub fn read_lock(&self) {
        self.lock.lock_shared()
    }
    pub fn write_lock(&self) {
        self.lock.lock_exclusive()
    }
    pub fn unlock_read(&self) {
        unsafe {
            // UNSAFE(@ohsayan): paired with a read_lock on this node by the same op
            self.lock.unlock_shared()
        }
    }
    pub fn unlock_write(&self) {
        unsafe {
            // UNSAFE(@ohsayan): paired with a write_lock on this node by the same op
            self.lock.unlock_exclusive()
        }
    }
    /// The modification sequence; compared across a read->write upgrade to detect
    /// that somebody slipped in while we weren't holding the lock
    #[inline(always)]
    pub fn modified_seq(&self) -> u64 {
        self.modified.load(Ordering::Acquire)
    }
    pub fn bump_modified(&self) {
        self.modified.fetch_add(1, Ordering::AcqRel);
    }
    pub fn is_dirty(&self) -> bool {
        self.nflags.load(Ordering::Acquire) & NF_DIRTY != 0
    }
    pub fn set_dirty(&self) {
        self.nflags.fetch_or(NF_DIRTY, Ordering::AcqRel);
    }
    pub fn clear_dirty(&self) {
        self.nflags.fetch_and(!NF_DIRTY, Ordering::AcqRel);
    }
    pub fn is_deleted(&self) -> bool {
        self.nflags.load(Ordering::Acquire) & NF_DELETED != 0
    }
    pub fn set_deleted(&self) {
        self.nflags.fetch_or(NF_DELETED, Ordering::AcqRel);
    }
    /// Read the node image
    ///
    /// ## Safety
    /// The caller must hold this node's lock (any mode)
    #[inline(always)]
    pub unsafe fn pnode(&self) -> &NodeBuf {
        &*self.buf.get()
    }
    /// Mutate the node image
    ///
    /// ## Safety
    /// The caller must hold this node's lock in exclusive mode
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn pnode_mut(&self) -> &mut NodeBuf {
        &mut *self.buf.get()
    }
}

type Stripe = RwLock<HashMap<u64, Arc<MemNode>>>;

pub struct L1Cache {
    stripes: Box<[Stripe]>,
    per_stripe_cap: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    trx: Arc<dyn TrxHook>,
}

impl L1Cache {
    pub fn new(capacity_hint: usize, trx: Arc<dyn TrxHook>) -> Self {
        let stripes = (0..DEFAULT_STRIPES)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            stripes,
            per_stripe_cap: (capacity_hint / DEFAULT_STRIPES).max(MIN_STRIPE_CAP),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            trx,
        }
    }
    #[inline(always)]
    fn stripe(&self, id: u64) -> &Stripe {
        &self.stripes[(id % DEFAULT_STRIPES as u64) as usize]
    }
    /// Look up a node. A hit runs the transaction hook's `cache_query`; a veto
    /// drops the cached wrapper and reports a miss so the caller re-reads from
    /// the store.
    pub fn get(&self, id: u64) -> Option<Arc<MemNode>> {
        let hit = self.stripe(id).read().get(&id).cloned();
        match hit {
            Some(node) => {
                if self.trx.cache_query(id) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(node)
                } else {
                    // vetoed: the hit would observe uncommitted state from another
                    // live transaction
                    self.remove_silent(id);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
    /// Insert a freshly created or just-loaded node. On an id collision (a
    /// concurrent populate beat us) the existing wrapper wins and is returned.
    pub fn add(&self, node: Arc<MemNode>) -> Arc<MemNode> {
        let id = node.id();
        let mut inserted = false;
        let winner = {
            let mut stripe = self.stripe(id).write();
            match stripe.get(&id) {
                Some(existing) => existing.clone(),
                None => {
                    stripe.insert(id, node.clone());
                    inserted = true;
                    if stripe.len() > self.per_stripe_cap {
                        self.evict_one(&mut stripe, id);
                    }
                    node
                }
            }
        };
        if inserted {
            self.trx.cache_add(id);
        }
        winner
    }
    /// Drop a reference. Pinning is the Arc strong count, so this is mostly
    /// documentation; eviction happens opportunistically on stripe overflow.
    pub fn release(&self, node: Arc<MemNode>) {
        drop(node)
    }
    /// Remove a node whose durable deletion has already been recorded, notifying
    /// the transaction hook
    pub fn delete(&self, id: u64) {
        self.trx.cache_del(id);
        self.remove_silent(id);
    }
    fn remove_silent(&self, id: u64) {
        self.stripe(id).write().remove(&id);
    }
    fn evict_one(&self, stripe: &mut HashMap<u64, Arc<MemNode>>, skip: u64) {
        let victim = stripe
            .iter()
            .find(|(id, n)| {
                **id != skip && Arc::strong_count(n) == 1 && !n.is_dirty() && !n.is_deleted()
            })
            .map(|(id, _)| *id);
        if let Some(id) = victim {
            stripe.remove(&id);
            self.trx.cache_del(id);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.read().len()).sum()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::{L1Cache, MemNode},
        crate::engine::{
            storage::node::NodeBuf,
            trx::{NoTrx, TrxHook},
        },
        std::sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    fn node(id: u64) -> Arc<MemNode> {
        let mut buf = NodeBuf::new_zeroed(512);
        buf.init(id, 0, 0);
        MemNode::new(buf)
    }

    #[test]
    fn get_add_release() {
        let l1 = L1Cache::new(1024, Arc::new(NoTrx));
        assert!(l1.get(7).is_none());
        assert_eq!(l1.misses(), 1);
        let n = l1.add(node(7));
        assert_eq!(n.id(), 7);
        let again = l1.get(7).unwrap();
        assert_eq!(again.id(), 7);
        assert_eq!(l1.hits(), 1);
        l1.release(again);
        l1.release(n);
        assert_eq!(l1.len(), 1);
    }
    #[test]
    fn add_collision_returns_existing() {
        let l1 = L1Cache::new(1024, Arc::new(NoTrx));
        let first = l1.add(node(3));
        let second = l1.add(node(3));
        assert!(Arc::ptr_eq(&first, &second));
    }
    #[test]
    fn delete_removes() {
        let l1 = L1Cache::new(1024, Arc::new(NoTrx));
        let n = l1.add(node(5));
        drop(n);
        l1.delete(5);
        assert!(l1.get(5).is_none());
        assert_eq!(l1.len(), 0);
    }
    #[test]
    fn veto_is_a_miss() {
        struct VetoAll(AtomicBool);
        impl TrxHook for VetoAll {
            fn cache_add(&self, _: u64) {}
            fn cache_del(&self, _: u64) {}
            fn cache_query(&self, _: u64) -> bool {
                !self.0.load(Ordering::Relaxed)
            }
        }
        let hook = Arc::new(VetoAll(AtomicBool::new(false)));
        let l1 = L1Cache::new(1024, hook.clone());
        let n = l1.add(node(11));
        drop(n);
        assert!(l1.get(11).is_some());
        hook.0.store(true, Ordering::Relaxed);
        // vetoed hit must look like a miss and drop the entry
        assert!(l1.get(11).is_none());
        assert_eq!(l1.len(), 0);
    }
    #[test]
    fn opportunistic_eviction() {
        let l1 = L1Cache::new(0, Arc::new(NoTrx));
        // stripe cap floors at MIN_STRIPE_CAP; same-stripe ids are 256 apart
        let keep: Vec<_> = (0..8).map(|i| l1.add(node(i * 256))).collect();
        for i in 8..16 {
            drop(l1.add(node(i * 256)));
        }
        // all pinned nodes must have survived
        for n in &keep {
            assert!(l1.get(n.id()).is_some());
        }
        assert!(l1.evictions() > 0);
    }
}
