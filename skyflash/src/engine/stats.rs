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

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
/// Per-instance counters. Mutators bump these with relaxed ordering; they are
/// diagnostics, not synchronization
pub enum Stat {
    NodeWrites = 0,
    NodeReads,
    LeafNodes,
    NonleafNodes,
    OverflowNodes,
    Splits,
    Merges,
    Shifts,
    Restarts,
    Gets,
    Writes,
    Deletes,
    MwriteObjs,
    RangeUpdates,
}

const STAT_COUNT: usize = Stat::RangeUpdates as usize + 1;

#[derive(Debug)]
pub struct StatSet {
    stat: [AtomicU64; STAT_COUNT],
}

impl StatSet {
    pub fn new() -> Self {
        Self {
            stat: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
    #[inline(always)]
    pub fn incr(&self, s: Stat) {
        self.stat[s as usize].fetch_add(1, Ordering::Relaxed);
    }
    #[inline(always)]
    pub fn add(&self, s: Stat, n: u64) {
        self.stat[s as usize].fetch_add(n, Ordering::Relaxed);
    }
    #[inline(always)]
    pub fn decr(&self, s: Stat) {
        self.stat[s as usize].fetch_sub(1, Ordering::Relaxed);
    }
    #[inline(always)]
    pub fn get(&self, s: Stat) -> u64 {
        self.stat[s as usize].load(Ordering::Relaxed)
    }
    pub fn snapshot(&self) -> [u64; STAT_COUNT] {
        let mut out = [0u64; STAT_COUNT];
        for (i, c) in self.stat.iter().enumerate() {
            out[i] = c.load(Ordering::Relaxed);
        }
        out
    }
}

impl Default for StatSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Stat, StatSet};

    #[test]
    fn counters() {
        let s = StatSet::new();
        s.incr(Stat::NodeWrites);
        s.incr(Stat::NodeWrites);
        s.add(Stat::MwriteObjs, 10);
        s.decr(Stat::MwriteObjs);
        assert_eq!(s.get(Stat::NodeWrites), 2);
        assert_eq!(s.get(Stat::MwriteObjs), 9);
        assert_eq!(s.get(Stat::Splits), 0);
    }
}
