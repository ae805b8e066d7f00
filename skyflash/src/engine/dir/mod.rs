/*
 * Created on Tue Mar 19 2024
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
    The flash-resident hash directory: one per physical shard, answering "does
    (container, key) exist, and at which block address?". All state is arenas
    indexed by 1-based u32 handles (0 = empty): a bucket head table, a pool of
    fixed-width chain entries carrying four slots each, per-lock-bucket free
    lists with a bitmap, an optional reverse block->bucket map and an optional
    per-block key cache for 8-byte keys.

    Locking: every bucket belongs to a contiguous run covered by one rwlock
    (`lock_bktsize` hash slots per lock). Callers take the covering lock through
    `find_lock`/`lock_*` before calling the chain operations; `obj_valid` is the
    one self-locking entry point since the slab sweep has nothing else to hold.
*/

use {
    crate::{
        engine::{
            config::{DirConfig, DirMode},
            error::{EngineError, EngineResult},
            hash::hash64,
            mem::SharedSlice,
        },
        util::compiler,
    },
    parking_lot::{lock_api::RawRwLock as _, RawRwLock, RwLock},
    std::sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

consts! {
    /// hash slots per bucket
    pub BUCKET_SIZE: u64 = 16;
    /// slots carried by one chain entry
    pub SLOTS_PER_ENTRY: usize = 4;
    LOCKBKT_MINSIZE: u64 = 256;
    MAX_LOCK_BUCKETS: u64 = 32_768;
    /// the top 16 syndrome bits are the in-entry prefilter
    SYN_SHIFT: u32 = 48;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// One directory slot
pub struct HashEntry {
    pub used: bool,
    pub referenced: bool,
    pub deleted: bool,
    pub blocks: u32,
    /// top 16 bits of the syndrome
    pub syndrome: u16,
    pub address: u64,
    pub cntr_id: u16,
}

#[derive(Debug, Clone, Copy, Default)]
struct BucketEntry {
    slots: [HashEntry; SLOTS_PER_ENTRY],
    /// next chain entry (1-based; 0 terminates). Doubles as the free-list link
    /// while the entry is parked on one.
    next: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Stable handle to a directory slot: (1-based chain entry, slot)
pub struct EntryId {
    entry: u32,
    slot: u8,
}

#[derive(Debug, Clone, Copy)]
pub enum LockHint {
    Syn(u64),
    Addr(u64),
}

/// The slab layer's on-flash key compare: syndrome prefilters only narrow the
/// candidate set, the final word comes from the key header at the block address
pub trait KeyMatch {
    fn key_match(&self, addr: u64, key: &[u8]) -> bool;
}

/// Persisted object record replayed during shard recovery
#[derive(Debug, Clone, Copy)]
pub struct FlashObjRecord {
    pub obucket: u32,
    pub osyndrome: u16,
    pub deleted: bool,
    pub blocks: u32,
    pub cntr_id: u16,
}

enum KeyCache {
    Flat(Box<[AtomicU64]>),
    /// storm mode: segments materialize on first touch
    Segmented(RwLock<Vec<Option<Box<[AtomicU64]>>>>),
}

pub struct HashDirectory {
    hash_size: u64,
    num_buckets: u64,
    lock_bktsize: u64,
    num_lock_buckets: usize,
    locks: Box<[RawRwLock]>,
    /// bucket head table: 1-based indices into `table`
    buckets: SharedSlice<u32>,
    table: SharedSlice<BucketEntry>,
    table_idx: AtomicU32,
    max_table_idx: u32,
    alloc_count: AtomicU64,
    free_lists: SharedSlice<u32>,
    free_map: SharedSlice<u64>,
    addr_table: Option<SharedSlice<u32>>,
    key_cache: Option<KeyCache>,
    storm_mode: bool,
    segment_blks: u64,
    #[allow(unused)]
    mode: DirMode,
}

impl HashDirectory {
    pub fn init(cfg: &DirConfig) -> EngineResult<Self> {
        cfg.validate()?;
        let mut hash_size = cfg.total_blocks;
        if cfg.max_nobjs > 0 && cfg.max_nobjs < hash_size {
            hash_size =
                (cfg.max_nobjs + cfg.segment_blks - 1) / cfg.segment_blks * cfg.segment_blks;
        }
        // headroom so chains stay short near capacity
        hash_size += hash_size / 4;

        // lock sizing: grow the stride until the lock count fits, then shrink it
        // back while the stride stays at least one bucket wide
        let mut lock_bktsize = LOCKBKT_MINSIZE;
        let mut num_lock_buckets = (hash_size + lock_bktsize - 1) / lock_bktsize;
        while num_lock_buckets > MAX_LOCK_BUCKETS {
            lock_bktsize *= 2;
            num_lock_buckets /= 2;
        }
        while num_lock_buckets < MAX_LOCK_BUCKETS && lock_bktsize / 2 >= BUCKET_SIZE {
            lock_bktsize /= 2;
            num_lock_buckets *= 2;
        }
        if hash_size < lock_bktsize * num_lock_buckets {
            hash_size = lock_bktsize * num_lock_buckets;
        }
        let num_buckets = hash_size / BUCKET_SIZE;
        let max_table_idx =
            (hash_size / SLOTS_PER_ENTRY as u64 + hash_size / BUCKET_SIZE) as u32;

        let addr_table = if !cfg.storm_mode {
            Some(SharedSlice::zeroed(cfg.total_blocks as usize))
        } else {
            None
        };
        let key_cache = if cfg.key_cache {
            if cfg.storm_mode {
                let segs = (cfg.total_blocks / cfg.segment_blks + 1) as usize;
                Some(KeyCache::Segmented(RwLock::new(
                    (0..segs).map(|_| None).collect(),
                )))
            } else {
                Some(KeyCache::Flat(
                    (0..cfg.total_blocks).map(|_| AtomicU64::new(0)).collect(),
                ))
            }
        } else {
            None
        };
        log::debug!(
            "hash directory initialized: hash_size={hash_size} lock_buckets={num_lock_buckets} lock_bktsize={lock_bktsize}"
        );
        Ok(Self {
            hash_size,
            num_buckets,
            lock_bktsize,
            num_lock_buckets: num_lock_buckets as usize,
            locks: (0..num_lock_buckets)
                .map(|_| RawRwLock::INIT)
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            buckets: SharedSlice::zeroed(num_buckets as usize),
            table: SharedSlice::zeroed(max_table_idx as usize),
            table_idx: AtomicU32::new(0),
            max_table_idx,
            alloc_count: AtomicU64::new(0),
            free_lists: SharedSlice::zeroed(num_lock_buckets as usize),
            free_map: SharedSlice::zeroed(((num_lock_buckets + 63) / 64) as usize),
            addr_table,
            key_cache,
            storm_mode: cfg.storm_mode,
            segment_blks: cfg.segment_blks,
            mode: cfg.mode,
        })
    }
    /// Hash the key and the container id
    pub fn syndrome(key: &[u8], cntr_id: u16) -> u64 {
        hash64(key).wrapping_add(cntr_id as u64 * BUCKET_SIZE)
    }
    #[inline(always)]
    pub fn hash_index(&self, syndrome: u64) -> u64 {
        syndrome % self.hash_size
    }
    pub fn capacity(&self) -> u64 {
        self.max_table_idx as u64 * SLOTS_PER_ENTRY as u64
    }
    pub fn alloc_count(&self) -> u64 {
        self.alloc_count.load(Ordering::Relaxed)
    }
    pub fn num_buckets(&self) -> u64 {
        self.num_buckets
    }
    // lock plumbing
    /// Map a syndrome or block address to the covering lock bucket
    pub fn find_lock(&self, hint: LockHint) -> Option<usize> {
        match hint {
            LockHint::Syn(s) => Some(((s % self.hash_size) / self.lock_bktsize) as usize),
            LockHint::Addr(a) => {
                let at = self.addr_table.as_ref()?;
                let hi = unsafe {
                    // UNSAFE(@ohsayan): reverse map reads are lock discovery; the
                    // slot is a plain u32 the owner updates under its own lock
                    at.load(a as usize)
                };
                Some((hi as u64 / self.lock_bktsize) as usize)
            }
        }
    }
    pub fn lock_shared(&self, lock_idx: usize) {
        self.locks[lock_idx].lock_shared()
    }
    pub fn unlock_shared(&self, lock_idx: usize) {
        unsafe {
            // UNSAFE(@ohsayan): paired with lock_shared by the caller
            self.locks[lock_idx].unlock_shared()
        }
    }
    pub fn lock_exclusive(&self, lock_idx: usize) {
        self.locks[lock_idx].lock_exclusive()
    }
    pub fn unlock_exclusive(&self, lock_idx: usize) {
        unsafe {
            // UNSAFE(@ohsayan): paired with lock_exclusive by the caller
            self.locks[lock_idx].unlock_exclusive()
        }
    }
    // entry access (caller holds the covering lock)
    pub fn entry(&self, id: EntryId) -> HashEntry {
        unsafe {
            // UNSAFE(@ohsayan): covering lock held per the locking contract
            self.table.get((id.entry - 1) as usize).slots[id.slot as usize]
        }
    }
    pub fn put_entry(&self, id: EntryId, he: HashEntry) {
        unsafe {
            // UNSAFE(@ohsayan): covering exclusive lock held per the contract
            self.table.get_mut((id.entry - 1) as usize).slots[id.slot as usize] = he;
        }
    }
    /// Record the reverse block->hash-index mapping (non-storm shards). The slab
    /// layer calls this after it assigns an address to a fresh entry.
    pub fn addr_map_set(&self, addr: u64, hash_idx: u64) {
        if let Some(at) = &self.addr_table {
            unsafe {
                // UNSAFE(@ohsayan): covering exclusive lock held per the contract
                at.set(addr as usize, hash_idx as u32)
            }
        }
    }
    /// Search for `(cntr_id, key)` under the caller-held shared lock. Filter
    /// order: used -> container -> syndrome top bits -> key cache shortcut or the
    /// slab layer's on-flash compare.
    pub fn get(&self, key: &[u8], cntr_id: u16, km: &dyn KeyMatch) -> Option<EntryId> {
        if compiler::unlikely(key.is_empty() || cntr_id == 0) {
            log::error!("translation lookup failed, invalid parameter");
            return None;
        }
        let syndrome = Self::syndrome(key, cntr_id);
        let bucket = ((syndrome % self.hash_size) / BUCKET_SIZE) as usize;
        let mut bi = unsafe {
            // UNSAFE(@ohsayan): covering lock held per the contract
            self.buckets.load(bucket)
        };
        while bi != 0 {
            let be = unsafe {
                // UNSAFE(@ohsayan): covering lock held per the contract
                *self.table.get((bi - 1) as usize)
            };
            for slot in 0..SLOTS_PER_ENTRY {
                let he = be.slots[slot];
                if !he.used {
                    continue;
                }
                if he.cntr_id != cntr_id {
                    continue;
                }
                if (syndrome >> SYN_SHIFT) as u16 != he.syndrome {
                    continue;
                }
                let mut cached = 0;
                if key.len() == 8 && self.key_cache.is_some() {
                    cached = self.keycache_get(he.address);
                }
                if cached != 0 {
                    if u64::from_le_bytes(key.try_into().unwrap()) != cached {
                        continue;
                    }
                } else if !km.key_match(he.address, key) {
                    continue;
                }
                return Some(EntryId {
                    entry: bi,
                    slot: slot as u8,
                });
            }
            bi = be.next;
        }
        None
    }
    /// Hand out a free slot for a fresh `(syndrome)` insert. Priority order:
    /// a free slot in the head chain entry, the local lock-bucket free list, the
    /// global pool, any other lock bucket's free list. The caller fills the slot
    /// via [`Self::put_entry`]. Requires the covering exclusive lock.
    pub fn insert_by_key(&self, syndrome: u64) -> EngineResult<EntryId> {
        let hi = syndrome % self.hash_size;
        let bucket = (hi / BUCKET_SIZE) as usize;
        let lock_idx = (hi / self.lock_bktsize) as usize;
        // 1: head chain entry
        let head = unsafe {
            // UNSAFE(@ohsayan): covering exclusive lock held per the contract
            self.buckets.load(bucket)
        };
        if head != 0 {
            let be = unsafe {
                // UNSAFE(@ohsayan): as above
                self.table.get((head - 1) as usize)
            };
            for slot in 0..SLOTS_PER_ENTRY {
                if !be.slots[slot].used {
                    self.alloc_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(EntryId {
                        entry: head,
                        slot: slot as u8,
                    });
                }
            }
        }
        // 2: recently freed neighbor
        if self.map_bit_isset(lock_idx) {
            if let Some(id) = self.pop_free_into_bucket(lock_idx, bucket) {
                self.alloc_count.fetch_add(1, Ordering::Relaxed);
                return Ok(id);
            }
        }
        // 3: global pool
        let pop = self.table_idx.fetch_add(1, Ordering::AcqRel);
        if pop < self.max_table_idx {
            unsafe {
                // UNSAFE(@ohsayan): the popped entry is exclusively ours (fresh
                // from the pool) and the bucket head is covered by our lock
                let be = self.table.get_mut(pop as usize);
                be.next = self.buckets.load(bucket);
                self.buckets.set(bucket, pop + 1);
            }
            self.alloc_count.fetch_add(1, Ordering::Relaxed);
            return Ok(EntryId {
                entry: pop + 1,
                slot: 0,
            });
        }
        // 4: raid other lock buckets' free lists
        for i in 0..self.num_lock_buckets {
            if i == lock_idx || !self.map_bit_isset(i) {
                continue;
            }
            if !self.locks[i].try_lock_exclusive() {
                continue;
            }
            let res = self.pop_free_into_bucket(i, bucket);
            unsafe {
                // UNSAFE(@ohsayan): paired with the try_lock right above
                self.locks[i].unlock_exclusive()
            };
            if let Some(id) = res {
                self.alloc_count.fetch_add(1, Ordering::Relaxed);
                return Ok(id);
            }
        }
        // time to do some disk cleanup or add more space
        log::error!(
            "NO MORE HASH ENTRIES AVAILABLE ({}/{})",
            self.alloc_count.load(Ordering::Relaxed),
            self.hash_size
        );
        Err(EngineError::DirectoryFull)
    }
    /// Locate the live entry for a block address being reclaimed by the slab
    /// sweep. Requires the covering lock.
    pub fn insert_by_addr(&self, addr: u64, syndrome: u64) -> Option<EntryId> {
        let bucket = ((syndrome % self.hash_size) / BUCKET_SIZE) as usize;
        let mut bi = unsafe {
            // UNSAFE(@ohsayan): covering lock held per the contract
            self.buckets.load(bucket)
        };
        while bi != 0 {
            let be = unsafe {
                // UNSAFE(@ohsayan): as above
                *self.table.get((bi - 1) as usize)
            };
            for slot in 0..SLOTS_PER_ENTRY {
                let he = be.slots[slot];
                if he.used && he.address == addr {
                    log::debug!(
                        "reclaiming item: syndrome={syndrome:x} syn={} addr={addr} blocks={}",
                        he.syndrome,
                        he.blocks
                    );
                    return Some(EntryId {
                        entry: bi,
                        slot: slot as u8,
                    });
                }
            }
            bi = be.next;
        }
        None
    }
    /// Delete a slot, compacting its chain entry from the head entry and parking
    /// the head on the lock-bucket free list if it empties out. Requires the
    /// covering exclusive lock.
    pub fn delete(&self, id: EntryId, hash_idx: u64) {
        let bucket = (hash_idx / BUCKET_SIZE) as usize;
        let lock_idx = (hash_idx / self.lock_bktsize) as usize;
        let head = unsafe {
            // UNSAFE(@ohsayan): covering exclusive lock held per the contract
            self.buckets.load(bucket)
        };
        debug_assert!(head != 0, "delete from an empty bucket");
        self.alloc_count.fetch_sub(1, Ordering::Relaxed);
        let victim = self.entry(id);
        if let Some(at) = &self.addr_table {
            unsafe {
                // UNSAFE(@ohsayan): as above
                at.set(victim.address as usize, 0)
            }
        }
        self.put_entry(id, HashEntry::default());
        if head != id.entry {
            // refill the vacated slots of the chain entry from the head entry so
            // partially-used entries stay packed towards the head
            let mut j = 0;
            for i in 0..SLOTS_PER_ENTRY {
                if self.slot_at(id.entry, i).used {
                    continue;
                }
                while j < SLOTS_PER_ENTRY {
                    let moved = self.slot_at(head, j);
                    j += 1;
                    if moved.used {
                        self.put_slot(id.entry, i, moved);
                        self.put_slot(head, j - 1, HashEntry::default());
                        if let Some(at) = &self.addr_table {
                            unsafe {
                                // UNSAFE(@ohsayan): as above
                                at.set(moved.address as usize, hash_idx as u32)
                            }
                        }
                        break;
                    }
                }
            }
        }
        // an empty head entry goes back to the free list
        let empty = (0..SLOTS_PER_ENTRY).all(|i| !self.slot_at(head, i).used);
        if empty {
            unsafe {
                // UNSAFE(@ohsayan): as above
                let next = self.table.get((head - 1) as usize).next;
                self.buckets.set(bucket, next);
                let free_head = self.free_lists.load(lock_idx);
                self.table.get_mut((head - 1) as usize).next = free_head;
                self.free_lists.set(lock_idx, head);
            }
            self.map_bit_set(lock_idx);
        }
    }
    /// Recovery-time insertion: the bucket comes straight from the persisted
    /// object record, and the entry is seeded from it. Single threaded per shard
    /// during recovery; takes no lock.
    pub fn recovery_insert(
        &self,
        obj: &FlashObjRecord,
        blk_offset: u64,
    ) -> EngineResult<EntryId> {
        let bucket = if self.storm_mode {
            obj.obucket as usize
        } else {
            (obj.obucket as u64 / BUCKET_SIZE) as usize
        };
        let head = unsafe {
            // UNSAFE(@ohsayan): recovery is single threaded per shard
            self.buckets.load(bucket)
        };
        let mut free: Option<EntryId> = None;
        if head != 0 {
            for slot in 0..SLOTS_PER_ENTRY {
                if !self.slot_at(head, slot).used {
                    free = Some(EntryId {
                        entry: head,
                        slot: slot as u8,
                    });
                    break;
                }
            }
        }
        let id = match free {
            Some(id) => id,
            None => {
                let pop = self.table_idx.fetch_add(1, Ordering::AcqRel);
                if pop >= self.max_table_idx {
                    // hard overflow for a store mode shard
                    fatal!("recovery overflow for store mode shard!");
                }
                unsafe {
                    // UNSAFE(@ohsayan): as above
                    let be = self.table.get_mut(pop as usize);
                    be.next = head;
                    self.buckets.set(bucket, pop + 1);
                }
                EntryId {
                    entry: pop + 1,
                    slot: 0,
                }
            }
        };
        debug_assert!(!self.entry(id).used);
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        self.put_entry(
            id,
            HashEntry {
                used: true,
                referenced: true,
                deleted: obj.deleted,
                blocks: obj.blocks,
                syndrome: obj.osyndrome,
                address: blk_offset,
                cntr_id: obj.cntr_id,
            },
        );
        log::trace!(
            "<<<< upd_HT: syn={}, blocks={}, del={}, bucket={}, addr={blk_offset}",
            obj.osyndrome,
            obj.blocks,
            obj.deleted,
            obj.obucket
        );
        if let Some(at) = &self.addr_table {
            unsafe {
                // UNSAFE(@ohsayan): as above
                at.set(blk_offset as usize, obj.obucket)
            }
        }
        Ok(id)
    }
    /// Slab-sweep predicate: does a live entry bind this exact `(key, container)`
    /// to this block address? Takes its own shared bucket lock.
    pub fn obj_valid(&self, key: &[u8], cntr_id: u16, addr: u64) -> bool {
        let syndrome = Self::syndrome(key, cntr_id);
        let hi = syndrome % self.hash_size;
        let lock_idx = (hi / self.lock_bktsize) as usize;
        self.lock_shared(lock_idx);
        let mut bi = unsafe {
            // UNSAFE(@ohsayan): shared lock taken right above
            self.buckets.load((hi / BUCKET_SIZE) as usize)
        };
        let mut valid = false;
        'scan: while bi != 0 {
            let be = unsafe {
                // UNSAFE(@ohsayan): as above
                *self.table.get((bi - 1) as usize)
            };
            for slot in 0..SLOTS_PER_ENTRY {
                let he = be.slots[slot];
                if he.used && he.syndrome == (syndrome >> SYN_SHIFT) as u16 && he.address == addr
                {
                    valid = true;
                    break 'scan;
                }
            }
            bi = be.next;
        }
        self.unlock_shared(lock_idx);
        valid
    }
    // key cache
    pub fn keycache_set(&self, blkaddr: u64, key: u64) {
        match &self.key_cache {
            None => {}
            Some(KeyCache::Flat(cache)) => cache[blkaddr as usize].store(key, Ordering::Relaxed),
            Some(KeyCache::Segmented(segs)) => {
                let seg = (blkaddr / self.segment_blks) as usize;
                let off = (blkaddr % self.segment_blks) as usize;
                {
                    let r = segs.read();
                    if let Some(s) = &r[seg] {
                        s[off].store(key, Ordering::Relaxed);
                        return;
                    }
                }
                let mut w = segs.write();
                if w[seg].is_none() {
                    w[seg] = Some((0..self.segment_blks).map(|_| AtomicU64::new(0)).collect());
                }
                w[seg].as_ref().unwrap()[off].store(key, Ordering::Relaxed);
            }
        }
    }
    /// 0 means "nothing cached": fall back to the on-flash compare
    pub fn keycache_get(&self, blkaddr: u64) -> u64 {
        match &self.key_cache {
            None => 0,
            Some(KeyCache::Flat(cache)) => cache[blkaddr as usize].load(Ordering::Relaxed),
            Some(KeyCache::Segmented(segs)) => {
                let seg = (blkaddr / self.segment_blks) as usize;
                let off = (blkaddr % self.segment_blks) as usize;
                match &segs.read()[seg] {
                    Some(s) => s[off].load(Ordering::Relaxed),
                    None => 0,
                }
            }
        }
    }
    // internals
    #[inline(always)]
    fn slot_at(&self, entry: u32, slot: usize) -> HashEntry {
        unsafe {
            // UNSAFE(@ohsayan): covering lock held per the contract
            self.table.get((entry - 1) as usize).slots[slot]
        }
    }
    #[inline(always)]
    fn put_slot(&self, entry: u32, slot: usize, he: HashEntry) {
        unsafe {
            // UNSAFE(@ohsayan): covering exclusive lock held per the contract
            self.table.get_mut((entry - 1) as usize).slots[slot] = he;
        }
    }
    /// Pop the free list head of `flidx` (whose lock the caller holds) and link
    /// it in as the new chain head of `bucket` (whose lock the caller also holds)
    fn pop_free_into_bucket(&self, flidx: usize, bucket: usize) -> Option<EntryId> {
        unsafe {
            // UNSAFE(@ohsayan): both covering locks held, see the doc comment
            let pop = self.free_lists.load(flidx);
            if pop == 0 {
                return None;
            }
            let next_free = self.table.get((pop - 1) as usize).next;
            self.free_lists.set(flidx, next_free);
            if next_free == 0 {
                self.map_bit_unset(flidx);
            }
            let be = self.table.get_mut((pop - 1) as usize);
            be.next = self.buckets.load(bucket);
            self.buckets.set(bucket, pop);
            Some(EntryId {
                entry: pop,
                slot: 0,
            })
        }
    }
    fn map_bit_set(&self, pos: usize) {
        unsafe {
            // UNSAFE(@ohsayan): bit owned by the lock bucket whose lock is held
            *self.free_map.get_mut(pos / 64) |= 1u64 << (pos % 64);
        }
    }
    fn map_bit_unset(&self, pos: usize) {
        unsafe {
            // UNSAFE(@ohsayan): as above
            *self.free_map.get_mut(pos / 64) &= !(1u64 << (pos % 64));
        }
    }
    fn map_bit_isset(&self, pos: usize) -> bool {
        unsafe {
            // UNSAFE(@ohsayan): racy reads here only direct the search; the
            // authoritative check happens under the owning lock
            self.free_map.load(pos / 64) & (1u64 << (pos % 64)) != 0
        }
    }
}

#[cfg(test)]
mod tests;
