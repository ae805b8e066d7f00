/*
 * Created on Mon Jan 15 2024
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

//! # Skyflash
//!
//! Skyflash is the storage core of a flash-optimized key/value engine. It has two
//! tightly coupled subsystems: a copy-on-write friendly variable-key B+-tree over a
//! node store (with an L1 cache of in-memory nodes), and a flash-resident hash
//! directory that maps `(container, key syndrome)` pairs to physical block
//! addresses in a slab-allocated store. Everything else (network surfaces, CLI,
//! licensing) lives with the callers; the seams are traits: [`NodeIo`],
//! [`KeyCmp`], [`SeqnoSource`], [`TrxHook`] and [`KeyMatch`].

#![deny(unreachable_patterns)]

#[macro_use]
mod util;
mod engine;

pub use engine::{
    cache::L1Cache,
    config::{DirConfig, DirMode, IndexMode, TreeConfig},
    dir::{EntryId, FlashObjRecord, HashDirectory, HashEntry, KeyMatch, LockHint},
    error::{EngineError, EngineResult},
    storage::{MemStore, NodeIo},
    tree::{
        Btree, DefaultCmp, KeyCmp, MonotonicSeqno, RangeMarker, RangeUpdateDecision,
        SeqnoSource, TreeStats, WriteType,
    },
    trx::{NoTrx, TrxHook},
};
