/*
 * Created on Mon Feb 05 2024
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

/// The transparent per-operation notifications an external transaction manager
/// receives from the storage core. The core calls these at well-defined points:
/// `cache_add` when a node enters L1 and again right before its image is written
/// out, `cache_del` when a node is evicted or durably deleted, and `cache_query`
/// on every L1 hit.
///
/// `cache_query` returning `false` is a *veto*: the manager is hiding uncommitted
/// state leaked from another active transaction, and the core drops the cached
/// node and re-reads it from the store as if the lookup had missed.
pub trait TrxHook: Send + Sync {
    fn cache_add(&self, logical_id: u64);
    fn cache_del(&self, logical_id: u64);
    fn cache_query(&self, logical_id: u64) -> bool {
        let _ = logical_id;
        true
    }
}

/// The no-op hook: every query is accepted
pub struct NoTrx;

impl TrxHook for NoTrx {
    fn cache_add(&self, _: u64) {}
    fn cache_del(&self, _: u64) {}
}
