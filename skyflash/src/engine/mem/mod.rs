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

//! Low-level memory utilities shared by the node layout and the hash directory:
//! little-endian scalar codecs over byte images and lock-striped shared slices.

use std::cell::UnsafeCell;

/// Copy exactly `N` bytes from `src` to a new array of size `N`
#[inline(always)]
pub unsafe fn memcpy<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut dst = [0u8; N];
    src.as_ptr().copy_to_nonoverlapping(dst.as_mut_ptr(), N);
    dst
}

#[inline(always)]
pub fn dec_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(unsafe {
        // UNSAFE(@ohsayan): the range check on the slice below protects the raw copy
        memcpy(&b[off..off + 2])
    })
}

#[inline(always)]
pub fn dec_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(unsafe {
        // UNSAFE(@ohsayan): range checked by the subslice
        memcpy(&b[off..off + 4])
    })
}

#[inline(always)]
pub fn dec_u64(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(unsafe {
        // UNSAFE(@ohsayan): range checked by the subslice
        memcpy(&b[off..off + 8])
    })
}

#[inline(always)]
pub fn enc_u16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_le_bytes())
}

#[inline(always)]
pub fn enc_u32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_le_bytes())
}

#[inline(always)]
pub fn enc_u64(b: &mut [u8], off: usize, v: u64) {
    b[off..off + 8].copy_from_slice(&v.to_le_bytes())
}

/// A fixed-base array shared between threads whose synchronization lives *outside*
/// the array (the hash directory covers runs of indices with range locks; raw
/// pointer graphs are replaced by indices into these).
///
/// ## Safety contract
/// Callers must hold the lock covering index `i` (exclusive for `get_mut`/`set`,
/// at least shared for `get`) before touching it. The slice base never moves after
/// construction, so indices stay valid for the lifetime of the structure.
pub struct SharedSlice<T> {
    base: UnsafeCell<Box<[T]>>,
}

unsafe impl<T: Send> Send for SharedSlice<T> {}
unsafe impl<T: Send> Sync for SharedSlice<T> {}

impl<T: Default + Clone> SharedSlice<T> {
    pub fn zeroed(len: usize) -> Self {
        Self {
            base: UnsafeCell::new(vec![T::default(); len].into_boxed_slice()),
        }
    }
}

impl<T> SharedSlice<T> {
    pub fn len(&self) -> usize {
        unsafe {
            // UNSAFE(@ohsayan): the length is immutable after construction
            (&*self.base.get()).len()
        }
    }
    #[inline(always)]
    pub unsafe fn get(&self, i: usize) -> &T {
        &(*self.base.get())[i]
    }
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, i: usize) -> &mut T {
        &mut (*self.base.get())[i]
    }
    #[inline(always)]
    pub unsafe fn set(&self, i: usize, v: T) {
        (*self.base.get())[i] = v;
    }
}

impl<T: Copy> SharedSlice<T> {
    #[inline(always)]
    pub unsafe fn load(&self, i: usize) -> T {
        (*self.base.get())[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_codec_roundtrip() {
        let mut b = [0u8; 32];
        enc_u16(&mut b, 0, 0xBEEF);
        enc_u32(&mut b, 2, 0xCAFEBABE);
        enc_u64(&mut b, 6, 0x8000_0000_0000_0001);
        assert_eq!(dec_u16(&b, 0), 0xBEEF);
        assert_eq!(dec_u32(&b, 2), 0xCAFEBABE);
        assert_eq!(dec_u64(&b, 6), 0x8000_0000_0000_0001);
    }
    #[test]
    fn shared_slice_single_threaded() {
        let s: SharedSlice<u32> = SharedSlice::zeroed(8);
        unsafe {
            // UNSAFE(@ohsayan): single threaded, no lock needed
            s.set(3, 42);
            assert_eq!(s.load(3), 42);
            assert_eq!(*s.get(0), 0);
        }
        assert_eq!(s.len(), 8);
    }
}
