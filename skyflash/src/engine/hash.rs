/*
 * Created on Mon Jan 22 2024
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
    This module implements the Fowler-Noll-Vo hash function. The 64-bit flavor is
    what produces key syndromes: it is stable across restarts (unlike SipHash with
    a random key), which the hash directory depends on since syndromes are written
    to flash with the object records.
*/

use std::marker::PhantomData;

pub type Fnv1A64 = Fnv1A<Fnv1APolicy64A>;

pub struct Fnv1APolicy64A;
impl HashPolicy for Fnv1APolicy64A {
    const OFFSET: u64 = 0xCBF29CE484222325;
    const PRIME: u64 = 0x100000001B3;
}

pub trait HashPolicy {
    const PRIME: u64;
    const OFFSET: u64;
}

pub struct Fnv1A<P: HashPolicy> {
    hash: u64,
    _m: PhantomData<P>,
}

impl<P: HashPolicy> Fnv1A<P> {
    pub const fn new() -> Self {
        Self {
            hash: P::OFFSET,
            _m: PhantomData,
        }
    }
    #[inline(always)]
    pub fn update(&mut self, bytes: &[u8]) {
        let mut hash = self.hash;
        for byte in bytes {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(P::PRIME);
        }
        self.hash = hash;
    }
    #[inline(always)]
    pub const fn finish(&self) -> u64 {
        self.hash
    }
}

impl<P: HashPolicy> Default for Fnv1A<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot 64-bit key hash
#[inline(always)]
pub fn hash64(bytes: &[u8]) -> u64 {
    let mut state = Fnv1A64::new();
    state.update(bytes);
    state.finish()
}

#[cfg(test)]
mod tests {
    use super::hash64;

    #[test]
    fn stable_across_calls() {
        assert_eq!(hash64(b"skyflash"), hash64(b"skyflash"));
        assert_ne!(hash64(b"skyflash"), hash64(b"skyflasi"));
    }
    #[test]
    fn known_vector() {
        // FNV-1a of the empty input is the offset basis
        assert_eq!(hash64(b""), 0xCBF29CE484222325);
    }
}
