/*
 * Created on Mon May 27 2024
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
    super::{Btree, RangeMarker, RangeUpdateDecision, WriteType},
    crate::engine::{
        config::{IndexMode, TreeConfig},
        error::EngineError,
        storage::MemStore,
    },
    std::sync::Arc,
};

fn tlog() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn cfg(nodesize: u32, max_key_size: u32) -> TreeConfig {
    TreeConfig::new(IndexMode::Secondary, nodesize, max_key_size)
}

fn small_tree() -> Btree {
    Btree::in_memory(cfg(512, 32)).unwrap()
}

fn medium_tree() -> Btree {
    Btree::in_memory(cfg(2048, 32)).unwrap()
}

#[test]
fn trivial_round_trip() {
    let t = small_tree();
    t.insert(b"apple", b"red").unwrap();
    t.insert(b"banana", b"yellow").unwrap();
    assert_eq!(t.get(b"apple").unwrap(), b"red");
    assert_eq!(t.get(b"banana").unwrap(), b"yellow");
    assert_eq!(t.get(b"cherry").unwrap_err(), EngineError::KeyNotFound);
}

#[test]
fn write_type_semantics() {
    let t = small_tree();
    t.insert(b"k", b"v1").unwrap();
    assert_eq!(t.insert(b"k", b"v2").unwrap_err(), EngineError::KeyExists);
    assert_eq!(
        t.update(b"missing", b"x").unwrap_err(),
        EngineError::KeyNotFound
    );
    t.update(b"k", b"v2").unwrap();
    assert_eq!(t.get(b"k").unwrap(), b"v2");
    t.upsert(b"k", b"v3").unwrap();
    t.upsert(b"fresh", b"v0").unwrap();
    assert_eq!(t.get(b"k").unwrap(), b"v3");
    assert_eq!(t.get(b"fresh").unwrap(), b"v0");
}

#[test]
fn buffer_provided_semantics() {
    let t = small_tree();
    t.insert(b"k", b"0123456789").unwrap();
    let mut tiny = [0u8; 4];
    assert_eq!(
        t.get_into(b"k", &mut tiny).unwrap_err(),
        EngineError::BufferTooSmall
    );
    let mut ok = [0u8; 16];
    let n = t.get_into(b"k", &mut ok).unwrap();
    assert_eq!(&ok[..n], b"0123456789");
}

#[test]
fn overflow_chain_round_trip() {
    // nodesize 512 -> big-object threshold 65, chain payload 406/hop
    let store = Arc::new(MemStore::new());
    let t = Btree::open(cfg(512, 32), store.clone()).unwrap();
    let baseline = store.node_count();
    let big = vec![0xAAu8; 500];
    t.insert(b"k", &big).unwrap();
    assert_eq!(t.stats().overflow_nodes, 2);
    assert_eq!(store.node_count(), baseline + 2);
    assert_eq!(t.get(b"k").unwrap(), big);
    t.delete(b"k").unwrap();
    assert_eq!(t.stats().overflow_nodes, 0);
    assert_eq!(store.node_count(), baseline);
    assert_eq!(t.get(b"k").unwrap_err(), EngineError::KeyNotFound);
}

#[test]
fn overflow_update_replaces_chain() {
    let t = small_tree();
    let big = vec![0xBBu8; 900];
    t.insert(b"k", &big).unwrap();
    assert_eq!(t.stats().overflow_nodes, 3);
    t.upsert(b"k", b"small now").unwrap();
    assert_eq!(t.stats().overflow_nodes, 0);
    assert_eq!(t.get(b"k").unwrap(), b"small now");
}

fn keyname(i: usize) -> Vec<u8> {
    format!("key{i:03}").into_bytes()
}

#[test]
fn split_thousand_sorted_inserts() {
    tlog();
    let t = medium_tree();
    let val = [7u8; 100];
    for i in 0..1000 {
        t.insert(&keyname(i), &val).unwrap();
    }
    assert!(t.stats().splits > 0);
    assert!(t.stats().nonleaf_nodes >= 1);
    assert_eq!(t.check().unwrap(), 1000);
    // ordered full scan sees every key, in order
    let mut seen = Vec::new();
    let n = t
        .range_scan(None, |k, v| {
            assert_eq!(v, &val[..]);
            seen.push(k.to_vec());
            true
        })
        .unwrap();
    assert_eq!(n, 1000);
    let expected: Vec<_> = (0..1000).map(keyname).collect();
    assert_eq!(seen, expected);
}

#[test]
fn scan_from_key_is_inclusive() {
    let t = medium_tree();
    for i in 0..100 {
        t.insert(&keyname(i), b"v").unwrap();
    }
    let mut seen = Vec::new();
    t.range_scan(Some(&keyname(90)), |k, _| {
        seen.push(k.to_vec());
        true
    })
    .unwrap();
    let expected: Vec<_> = (90..100).map(keyname).collect();
    assert_eq!(seen, expected);
    // early stop
    let n = t.range_scan(None, |_, _| false).unwrap();
    assert_eq!(n, 1);
}

#[test]
fn mwrite_single_leaf_atomicity() {
    let t = small_tree();
    let objs: [(&[u8], &[u8]); 3] = [(b"a", b"1"), (b"b", b"2"), (b"c", b"3")];
    let n = t.mwrite(&objs, WriteType::Set).unwrap();
    assert_eq!(n, 3);
    assert_eq!(t.get(b"a").unwrap(), b"1");
    assert_eq!(t.get(b"b").unwrap(), b"2");
    assert_eq!(t.get(b"c").unwrap(), b"3");
}

#[test]
fn mwrite_stops_at_first_violation() {
    let t = small_tree();
    t.insert(b"b", b"old").unwrap();
    let objs: [(&[u8], &[u8]); 3] = [(b"a", b"1"), (b"b", b"2"), (b"c", b"3")];
    // "a" lands, "b" violates create-only, "c" is the caller's to retry
    assert_eq!(t.mwrite(&objs, WriteType::Create).unwrap(), 1);
    assert_eq!(t.get(b"a").unwrap(), b"1");
    assert_eq!(t.get(b"b").unwrap(), b"old");
    assert_eq!(t.get(b"c").unwrap_err(), EngineError::KeyNotFound);
    // a violation on the very first object surfaces as the error itself
    let objs2: [(&[u8], &[u8]); 2] = [(b"a", b"x"), (b"z", b"y")];
    assert_eq!(
        t.mwrite(&objs2, WriteType::Create).unwrap_err(),
        EngineError::KeyExists
    );
}

#[test]
fn mwrite_bulk_across_leaves() {
    let t = medium_tree();
    let keys: Vec<_> = (0..500).map(keyname).collect();
    let objs: Vec<(&[u8], &[u8])> = keys.iter().map(|k| (&k[..], &b"val"[..])).collect();
    assert_eq!(t.mwrite(&objs, WriteType::Create).unwrap(), 500);
    assert_eq!(t.check().unwrap(), 500);
    for k in &keys {
        assert_eq!(t.get(k).unwrap(), b"val");
    }
}

#[test]
fn delete_with_rebalance_halves_the_tree() {
    let t = medium_tree();
    let val = [7u8; 100];
    for i in 0..1000 {
        t.insert(&keyname(i), &val).unwrap();
    }
    let nodes_before = t.stats().node_count();
    for i in 0..500 {
        t.delete(&keyname(i)).unwrap();
    }
    assert!(t.stats().merges + t.stats().shifts > 0);
    assert!(t.stats().node_count() < nodes_before);
    assert_eq!(t.check().unwrap(), 500);
    for i in 0..500 {
        assert_eq!(t.get(&keyname(i)).unwrap_err(), EngineError::KeyNotFound);
    }
    for i in 500..1000 {
        assert_eq!(t.get(&keyname(i)).unwrap(), val);
    }
}

#[test]
fn root_collapse_back_to_a_leaf() {
    let t = small_tree();
    let val = [9u8; 80];
    let keys: [&[u8]; 4] = [b"alpha", b"bravo", b"charlie", b"delta"];
    for k in keys {
        t.insert(k, &val).unwrap();
    }
    // the fourth insert must have split the root leaf
    assert!(t.stats().nonleaf_nodes >= 1);
    for k in keys {
        t.delete(k).unwrap();
    }
    assert_eq!(t.stats().nonleaf_nodes, 0);
    assert_eq!(t.stats().leaf_nodes, 1);
    // the root is the sole remaining (empty) leaf again
    assert_eq!(t.check().unwrap(), 0);
    t.insert(b"again", b"works").unwrap();
    assert_eq!(t.get(b"again").unwrap(), b"works");
}

#[test]
fn range_update_in_place_and_needs_space() {
    let t = small_tree();
    // eight 2-byte keys with 10-byte values pack the root leaf tightly
    let keys: Vec<Vec<u8>> = (b'a'..=b'h').map(|c| vec![b'r', c]).collect();
    for k in &keys {
        t.insert(k, &[1u8; 10]).unwrap();
    }
    // same-size replacements go in place, single call
    let mut marker = RangeMarker::new();
    let n = t
        .range_update(b"ra", &mut |_, _| RangeUpdateDecision::Update(vec![2u8; 10]), &mut marker)
        .unwrap();
    assert_eq!(n, 8);
    assert!(!marker.is_set());
    // growth past the leaf's free space must bounce to the single-key path
    let fat = vec![3u8; 58];
    let mut marker = RangeMarker::new();
    let mut in_place = 0usize;
    let mut retried = 0usize;
    loop {
        match t.range_update(
            b"ra",
            &mut |_, _| RangeUpdateDecision::Update(fat.clone()),
            &mut marker,
        ) {
            Ok(n) => {
                in_place += n;
                if !marker.is_set() {
                    break;
                }
            }
            Err(EngineError::RangeUpdateNeedsSpace) => {
                let (k, d) = {
                    let (k, d) = marker.retry().unwrap();
                    (k.to_vec(), d.to_vec())
                };
                t.update(&k, &d).unwrap();
                marker.clear_retry();
                retried += 1;
            }
            Err(e) => panic!("unexpected range update failure: {e}"),
        }
    }
    assert!(retried > 0);
    assert_eq!(in_place + retried, 8);
    for k in &keys {
        assert_eq!(t.get(k).unwrap(), fat);
    }
    t.check().unwrap();
}

#[test]
fn range_update_end_clears_marker() {
    let t = small_tree();
    for k in [&b"aa"[..], b"ab", b"zz"] {
        t.insert(k, b"v").unwrap();
    }
    let mut marker = RangeMarker::new();
    let n = t
        .range_update(
            b"aa",
            &mut |k, _| {
                if k.starts_with(b"a") {
                    RangeUpdateDecision::Update(b"w".to_vec())
                } else {
                    RangeUpdateDecision::End
                }
            },
            &mut marker,
        )
        .unwrap();
    assert_eq!(n, 2);
    assert!(!marker.is_set());
    assert_eq!(t.get(b"zz").unwrap(), b"v");
    assert_eq!(t.get(b"aa").unwrap(), b"w");
}

#[test]
fn persistence_restart_round_trip() {
    let store = Arc::new(MemStore::new());
    {
        let t = Btree::open(cfg(2048, 32), store.clone()).unwrap();
        for i in 0..300 {
            t.insert(&keyname(i), b"durable").unwrap();
        }
        t.flush().unwrap();
    }
    let mut reload = cfg(2048, 32);
    reload.reload = true;
    let t = Btree::open(reload, store).unwrap();
    assert_eq!(t.check().unwrap(), 300);
    for i in 0..300 {
        assert_eq!(t.get(&keyname(i)).unwrap(), b"durable");
    }
    // fresh allocations must not collide with pre-restart nodes
    for i in 300..400 {
        t.insert(&keyname(i), b"post-restart").unwrap();
    }
    assert_eq!(t.check().unwrap(), 400);
}

#[test]
fn syndrome_index_mode() {
    let mut c = TreeConfig::new(IndexMode::Syndrome, 2048, 32);
    c.in_memory = true;
    let t = Btree::open(c, Arc::new(MemStore::new())).unwrap();
    for i in 0..400 {
        t.insert(&keyname(i), format!("v{i}").as_bytes()).unwrap();
    }
    assert_eq!(t.check().unwrap(), 400);
    for i in 0..400 {
        assert_eq!(t.get(&keyname(i)).unwrap(), format!("v{i}").as_bytes());
    }
    for i in (0..400).step_by(2) {
        t.delete(&keyname(i)).unwrap();
    }
    assert_eq!(t.check().unwrap(), 200);
    for i in (1..400).step_by(2) {
        assert_eq!(t.get(&keyname(i)).unwrap(), format!("v{i}").as_bytes());
    }
    // hash-order scan still visits everything exactly once
    assert_eq!(t.range_scan(None, |_, _| true).unwrap(), 200);
}

#[test]
fn syndrome_mwrite_sorted_by_tree_order() {
    let mut c = TreeConfig::new(IndexMode::Syndrome, 2048, 32);
    c.in_memory = true;
    let t = Btree::open(c, Arc::new(MemStore::new())).unwrap();
    let keys: Vec<_> = (0..64).map(keyname).collect();
    let mut sorted: Vec<&[u8]> = keys.iter().map(|k| &k[..]).collect();
    sorted.sort_by(|a, b| t.key_order(a, b));
    let objs: Vec<(&[u8], &[u8])> = sorted.iter().map(|k| (*k, &b"x"[..])).collect();
    assert_eq!(t.mwrite(&objs, WriteType::Create).unwrap(), 64);
    for k in &keys {
        assert_eq!(t.get(k).unwrap(), b"x");
    }
}

#[test]
fn randomized_workload_stays_consistent() {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    tlog();
    let t = medium_tree();
    let mut rng = StdRng::seed_from_u64(0xF1A5);
    let mut live = std::collections::BTreeMap::new();
    for _ in 0..3000 {
        let k = keyname(rng.gen_range(0..400));
        match rng.gen_range(0..4u8) {
            0 | 1 => {
                let v = vec![rng.gen::<u8>(); rng.gen_range(1..60)];
                t.upsert(&k, &v).unwrap();
                live.insert(k, v);
            }
            2 => match t.delete(&k) {
                Ok(()) => {
                    assert!(live.remove(&k).is_some());
                }
                Err(EngineError::KeyNotFound) => assert!(!live.contains_key(&k)),
                Err(e) => panic!("delete failed: {e}"),
            },
            _ => match t.get(&k) {
                Ok(v) => assert_eq!(Some(&v), live.get(&k)),
                Err(EngineError::KeyNotFound) => assert!(!live.contains_key(&k)),
                Err(e) => panic!("get failed: {e}"),
            },
        }
    }
    assert_eq!(t.check().unwrap(), live.len() as u64);
    let mut seen = 0u64;
    t.range_scan(None, |k, v| {
        assert_eq!(live.get(k).map(|x| &x[..]), Some(v));
        seen += 1;
        true
    })
    .unwrap();
    assert_eq!(seen, live.len() as u64);
}

#[test]
fn concurrent_inserts_from_many_threads() {
    let t = Arc::new(Btree::in_memory(cfg(2048, 32)).unwrap());
    std::thread::scope(|s| {
        for part in 0..8usize {
            let t = Arc::clone(&t);
            s.spawn(move || {
                for i in 0..200usize {
                    let key = format!("t{part}-{i:04}");
                    t.insert(key.as_bytes(), key.as_bytes()).unwrap();
                }
            });
        }
    });
    assert_eq!(t.check().unwrap(), 1600);
    for part in 0..8usize {
        for i in 0..200usize {
            let key = format!("t{part}-{i:04}");
            assert_eq!(t.get(key.as_bytes()).unwrap(), key.as_bytes());
        }
    }
}

#[test]
fn concurrent_readers_and_writers() {
    let t = Arc::new(Btree::in_memory(cfg(2048, 32)).unwrap());
    for i in 0..200 {
        t.insert(&keyname(i), b"base").unwrap();
    }
    std::thread::scope(|s| {
        for w in 0..4usize {
            let t = Arc::clone(&t);
            s.spawn(move || {
                for i in 0..200 {
                    if i % 4 == w {
                        t.upsert(&keyname(i), b"new").unwrap();
                    }
                }
            });
        }
        for _ in 0..4 {
            let t = Arc::clone(&t);
            s.spawn(move || {
                for i in 0..200 {
                    let v = t.get(&keyname(i)).unwrap();
                    assert!(v == b"base" || v == b"new");
                }
            });
        }
    });
    assert_eq!(t.check().unwrap(), 200);
    for i in 0..200 {
        assert_eq!(t.get(&keyname(i)).unwrap(), b"new");
    }
}
