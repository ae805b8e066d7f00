/*
 * Created on Tue Apr 02 2024
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

use {
    super::{EntryId, FlashObjRecord, HashDirectory, HashEntry, KeyMatch, LockHint, SYN_SHIFT},
    crate::engine::{
        config::{DirConfig, DirMode},
        error::EngineError,
    },
    parking_lot::Mutex,
    std::collections::HashMap,
};

/// Simulated slab layer: block address -> stored key
#[derive(Default)]
struct FlashSim {
    keys: Mutex<HashMap<u64, Vec<u8>>>,
}

impl FlashSim {
    fn store(&self, addr: u64, key: &[u8]) {
        self.keys.lock().insert(addr, key.to_vec());
    }
}

impl KeyMatch for FlashSim {
    fn key_match(&self, addr: u64, key: &[u8]) -> bool {
        self.keys.lock().get(&addr).map(|k| k == key).unwrap_or(false)
    }
}

fn mkdir(blocks: u64) -> HashDirectory {
    HashDirectory::init(&DirConfig::new(blocks, DirMode::Slab)).unwrap()
}

fn insert(dir: &HashDirectory, sim: &FlashSim, key: &[u8], cntr: u16, addr: u64) -> EntryId {
    let syn = HashDirectory::syndrome(key, cntr);
    let li = dir.find_lock(LockHint::Syn(syn)).unwrap();
    dir.lock_exclusive(li);
    let id = dir.insert_by_key(syn).unwrap();
    dir.put_entry(
        id,
        HashEntry {
            used: true,
            referenced: true,
            deleted: false,
            blocks: 1,
            syndrome: (syn >> SYN_SHIFT) as u16,
            address: addr,
            cntr_id: cntr,
        },
    );
    dir.addr_map_set(addr, dir.hash_index(syn));
    dir.unlock_exclusive(li);
    sim.store(addr, key);
    id
}

fn lookup(dir: &HashDirectory, sim: &FlashSim, key: &[u8], cntr: u16) -> Option<EntryId> {
    let syn = HashDirectory::syndrome(key, cntr);
    let li = dir.find_lock(LockHint::Syn(syn)).unwrap();
    dir.lock_shared(li);
    let hit = dir.get(key, cntr, sim);
    dir.unlock_shared(li);
    hit
}

#[test]
fn insert_lookup_roundtrip() {
    let dir = mkdir(1024);
    let sim = FlashSim::default();
    for i in 0..64u64 {
        insert(&dir, &sim, format!("object-{i:03}").as_bytes(), 7, 100 + i);
    }
    for i in 0..64u64 {
        let id = lookup(&dir, &sim, format!("object-{i:03}").as_bytes(), 7).unwrap();
        assert_eq!(dir.entry(id).address, 100 + i);
    }
    assert!(lookup(&dir, &sim, b"object-999", 7).is_none());
    // same key, different container
    assert!(lookup(&dir, &sim, b"object-000", 8).is_none());
    assert_eq!(dir.alloc_count(), 64);
}

#[test]
fn delete_then_miss() {
    let dir = mkdir(1024);
    let sim = FlashSim::default();
    let id = insert(&dir, &sim, b"victim", 3, 555);
    let syn = HashDirectory::syndrome(b"victim", 3);
    let li = dir.find_lock(LockHint::Syn(syn)).unwrap();
    dir.lock_exclusive(li);
    dir.delete(id, dir.hash_index(syn));
    dir.unlock_exclusive(li);
    assert!(lookup(&dir, &sim, b"victim", 3).is_none());
    assert!(!dir.obj_valid(b"victim", 3, 555));
    assert_eq!(dir.alloc_count(), 0);
}

#[test]
fn same_syndrome_chain_to_capacity() {
    let dir = mkdir(64);
    let syn = 0xABCD_0000_0000_0020u64;
    let li = dir.find_lock(LockHint::Syn(syn)).unwrap();
    dir.lock_exclusive(li);
    let mut ok = 0u64;
    loop {
        match dir.insert_by_key(syn) {
            Ok(id) => {
                let mut he = HashEntry::default();
                he.used = true;
                he.syndrome = (syn >> SYN_SHIFT) as u16;
                he.address = ok;
                dir.put_entry(id, he);
                ok += 1;
            }
            Err(e) => {
                assert_eq!(e, EngineError::DirectoryFull);
                break;
            }
        }
    }
    dir.unlock_exclusive(li);
    // one bucket can chain through the entire pool, four slots per entry
    assert_eq!(ok, dir.capacity());
}

#[test]
fn empty_chain_entry_returns_to_free_list() {
    let dir = mkdir(64);
    // syndromes in the same bucket (same lock neighborhood)
    let syn_a = 32u64;
    let syn_b = 33u64;
    let li = dir.find_lock(LockHint::Syn(syn_a)).unwrap();
    assert_eq!(li, dir.find_lock(LockHint::Syn(syn_b)).unwrap());
    dir.lock_exclusive(li);
    let mut ids = vec![];
    for i in 0..4 {
        let id = dir.insert_by_key(syn_a).unwrap();
        let mut he = HashEntry::default();
        he.used = true;
        he.address = i;
        dir.put_entry(id, he);
        ids.push(id);
    }
    for id in ids {
        dir.delete(id, dir.hash_index(syn_a));
    }
    // the freed chain entry must be recycled before the pool grows
    let reused = dir.insert_by_key(syn_b).unwrap();
    assert_eq!(reused.entry, 1);
    dir.unlock_exclusive(li);
}

#[test]
fn insert_by_addr_finds_reclaim_target() {
    let dir = mkdir(1024);
    let sim = FlashSim::default();
    insert(&dir, &sim, b"reclaim-me", 2, 777);
    let syn = HashDirectory::syndrome(b"reclaim-me", 2);
    let li = dir.find_lock(LockHint::Syn(syn)).unwrap();
    dir.lock_shared(li);
    let id = dir.insert_by_addr(777, syn).unwrap();
    assert_eq!(dir.entry(id).address, 777);
    assert!(dir.insert_by_addr(778, syn).is_none());
    dir.unlock_shared(li);
}

#[test]
fn recovery_insert_is_visible() {
    let dir = mkdir(1024);
    let sim = FlashSim::default();
    let key = b"recovered-object";
    let cntr = 5u16;
    let syn = HashDirectory::syndrome(key, cntr);
    let obj = FlashObjRecord {
        obucket: dir.hash_index(syn) as u32,
        osyndrome: (syn >> SYN_SHIFT) as u16,
        deleted: false,
        blocks: 3,
        cntr_id: cntr,
    };
    let id = dir.recovery_insert(&obj, 901).unwrap();
    assert_eq!(dir.entry(id).blocks, 3);
    sim.store(901, key);
    assert_eq!(lookup(&dir, &sim, key, cntr).unwrap(), id);
    assert!(dir.obj_valid(key, cntr, 901));
    assert!(!dir.obj_valid(key, cntr, 902));
}

#[test]
fn keycache_short_circuits_flash_reads() {
    let mut cfg = DirConfig::new(1024, DirMode::Slab);
    cfg.key_cache = true;
    let dir = HashDirectory::init(&cfg).unwrap();
    let sim = FlashSim::default();
    let key = 0x1122_3344_5566_7788u64.to_le_bytes();
    let id = insert(&dir, &sim, &key, 9, 44);
    dir.keycache_set(44, u64::from_le_bytes(key));
    let syn = HashDirectory::syndrome(&key, 9);
    let li = dir.find_lock(LockHint::Syn(syn)).unwrap();
    dir.lock_shared(li);
    // the key cache must answer; flash reads are forbidden
    struct Never;
    impl KeyMatch for Never {
        fn key_match(&self, _: u64, _: &[u8]) -> bool {
            panic!("key cache should have answered")
        }
    }
    assert_eq!(dir.get(&key, 9, &Never), Some(id));
    dir.unlock_shared(li);
}

#[test]
fn storm_mode_lazy_keycache_and_no_addr_table() {
    let mut cfg = DirConfig::new(16384, DirMode::Slab);
    cfg.key_cache = true;
    cfg.storm_mode = true;
    let dir = HashDirectory::init(&cfg).unwrap();
    assert!(dir.find_lock(LockHint::Addr(5)).is_none());
    assert_eq!(dir.keycache_get(9000), 0);
    dir.keycache_set(9000, 42);
    dir.keycache_set(100, 43);
    assert_eq!(dir.keycache_get(9000), 42);
    assert_eq!(dir.keycache_get(100), 43);
    assert_eq!(dir.keycache_get(101), 0);
}

#[test]
fn addr_lock_discovery_matches_syndrome_lock() {
    let dir = mkdir(4096);
    let sim = FlashSim::default();
    insert(&dir, &sim, b"addressed", 4, 123);
    let syn = HashDirectory::syndrome(b"addressed", 4);
    assert_eq!(
        dir.find_lock(LockHint::Addr(123)),
        dir.find_lock(LockHint::Syn(syn))
    );
}
