/*
 * Created on Fri Mar 01 2024
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
    On-flash node image. A node is one fixed-size byte container:

    - header (106B, little-endian, byte packed):
        pstats[64] | flags u32 | level u16 | checksum u32 | insert_ptr u32 |
        nkeys u32 | logical_id u64 | next u64 | rightmost u64
    - key records growing *up* from the header, one of three layouts
    - variable key/value bytes growing *down* from insert_ptr (init = nodesize)

    The `pstats` block is an opaque persistent-statistics delta preserved across
    load/store; the core never interprets it.
*/

use crate::engine::mem::{dec_u16, dec_u32, dec_u64, enc_u16, enc_u32, enc_u64};

consts! {
    pub NODE_PSTATS_SIZE: usize = 64;
    pub OFF_FLAGS: usize = 64;
    pub OFF_LEVEL: usize = 68;
    pub OFF_CHECKSUM: usize = 70;
    pub OFF_INSERT_PTR: usize = 74;
    pub OFF_NKEYS: usize = 78;
    pub OFF_LOGICAL_ID: usize = 82;
    pub OFF_NEXT: usize = 90;
    pub OFF_RIGHTMOST: usize = 98;
    pub NODE_HEADER_SIZE: usize = 106;
    /// leaf marker
    pub LEAF_NODE: u32 = 1 << 0;
    /// member of an overflow chain
    pub OVERFLOW_NODE: u32 = 1 << 1;
    /// fixed non-leaf record: syndrome + child + seqno
    pub FKEY_SIZE: usize = 24;
    /// variable non-leaf record: keylen + keypos + child + seqno
    pub VKEY_SIZE: usize = 24;
    /// variable leaf record: keylen + keypos + datalen + ptr + seqno + syndrome
    pub VLKEY_SIZE: usize = 36;
    /// metadata nodes live at META_LOGICAL_ID + partition id
    pub META_LOGICAL_ID: u64 = 0x8000_0000_0000_0000;
    pub BAD_CHILD: u64 = 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLayout {
    /// non-leaf in syndrome mode
    Fixed,
    /// non-leaf in secondary mode
    VarNonleaf,
    /// every leaf
    VarLeaf,
}

impl KeyLayout {
    #[inline(always)]
    pub const fn rec_size(self) -> usize {
        match self {
            Self::Fixed => FKEY_SIZE,
            Self::VarNonleaf => VKEY_SIZE,
            Self::VarLeaf => VLKEY_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FKey {
    pub syndrome: u64,
    pub child: u64,
    pub seqno: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VKey {
    pub keylen: u32,
    pub keypos: u32,
    pub child: u64,
    pub seqno: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeafEntry {
    pub keylen: u16,
    pub keypos: u16,
    pub datalen: u64,
    /// 0 = inline value right after the key bytes; else the head of an overflow
    /// chain holding the value
    pub ptr: u64,
    pub seqno: u64,
    pub syndrome: u64,
}

impl LeafEntry {
    /// Bytes this entry occupies in the node: record + key + inline value
    #[inline(always)]
    pub fn node_bytes(&self) -> u64 {
        VLKEY_SIZE as u64 + self.keylen as u64 + self.inline_len()
    }
    #[inline(always)]
    pub fn inline_len(&self) -> u64 {
        if self.ptr == 0 {
            self.datalen
        } else {
            0
        }
    }
}

/// The in-memory image of one node
pub struct NodeBuf {
    buf: Box<[u8]>,
}

impl NodeBuf {
    pub fn new_zeroed(nodesize: usize) -> Self {
        debug_assert!(nodesize > NODE_HEADER_SIZE);
        Self {
            buf: vec![0u8; nodesize].into_boxed_slice(),
        }
    }
    pub fn from_bytes(buf: Box<[u8]>) -> Self {
        Self { buf }
    }
    /// Initialize a freshly allocated node
    pub fn init(&mut self, logical_id: u64, flags: u32, level: u16) {
        self.buf.fill(0);
        self.set_flags(flags);
        self.set_level(level);
        self.set_insert_ptr(self.nodesize() as u32);
        self.set_logical_id(logical_id);
    }
    #[inline(always)]
    pub fn nodesize(&self) -> usize {
        self.buf.len()
    }
    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
    // header accessors
    pub fn pstats(&self) -> &[u8] {
        &self.buf[..NODE_PSTATS_SIZE]
    }
    pub fn set_pstats(&mut self, p: &[u8]) {
        self.buf[..NODE_PSTATS_SIZE].copy_from_slice(p)
    }
    #[inline(always)]
    pub fn flags(&self) -> u32 {
        dec_u32(&self.buf, OFF_FLAGS)
    }
    pub fn set_flags(&mut self, v: u32) {
        enc_u32(&mut self.buf, OFF_FLAGS, v)
    }
    #[inline(always)]
    pub fn level(&self) -> u16 {
        dec_u16(&self.buf, OFF_LEVEL)
    }
    pub fn set_level(&mut self, v: u16) {
        enc_u16(&mut self.buf, OFF_LEVEL, v)
    }
    #[inline(always)]
    pub fn checksum(&self) -> u32 {
        dec_u32(&self.buf, OFF_CHECKSUM)
    }
    pub fn set_checksum(&mut self, v: u32) {
        enc_u32(&mut self.buf, OFF_CHECKSUM, v)
    }
    #[inline(always)]
    pub fn insert_ptr(&self) -> u32 {
        dec_u32(&self.buf, OFF_INSERT_PTR)
    }
    pub fn set_insert_ptr(&mut self, v: u32) {
        enc_u32(&mut self.buf, OFF_INSERT_PTR, v)
    }
    #[inline(always)]
    pub fn nkeys(&self) -> u32 {
        dec_u32(&self.buf, OFF_NKEYS)
    }
    pub fn set_nkeys(&mut self, v: u32) {
        enc_u32(&mut self.buf, OFF_NKEYS, v)
    }
    #[inline(always)]
    pub fn logical_id(&self) -> u64 {
        dec_u64(&self.buf, OFF_LOGICAL_ID)
    }
    pub fn set_logical_id(&mut self, v: u64) {
        enc_u64(&mut self.buf, OFF_LOGICAL_ID, v)
    }
    #[inline(always)]
    pub fn next(&self) -> u64 {
        dec_u64(&self.buf, OFF_NEXT)
    }
    pub fn set_next(&mut self, v: u64) {
        enc_u64(&mut self.buf, OFF_NEXT, v)
    }
    #[inline(always)]
    pub fn rightmost(&self) -> u64 {
        dec_u64(&self.buf, OFF_RIGHTMOST)
    }
    pub fn set_rightmost(&mut self, v: u64) {
        enc_u64(&mut self.buf, OFF_RIGHTMOST, v)
    }
    #[inline(always)]
    pub fn is_leaf(&self) -> bool {
        self.flags() & LEAF_NODE != 0
    }
    #[inline(always)]
    pub fn is_overflow(&self) -> bool {
        self.flags() & OVERFLOW_NODE != 0
    }
    // generic payload access (metadata node, overflow chains)
    pub fn body(&self, len: usize) -> &[u8] {
        &self.buf[NODE_HEADER_SIZE..NODE_HEADER_SIZE + len]
    }
    pub fn body_mut(&mut self, len: usize) -> &mut [u8] {
        &mut self.buf[NODE_HEADER_SIZE..NODE_HEADER_SIZE + len]
    }
    // record access
    #[inline(always)]
    fn rec_off(layout: KeyLayout, i: u32) -> usize {
        NODE_HEADER_SIZE + layout.rec_size() * i as usize
    }
    pub fn fkey(&self, i: u32) -> FKey {
        let o = Self::rec_off(KeyLayout::Fixed, i);
        FKey {
            syndrome: dec_u64(&self.buf, o),
            child: dec_u64(&self.buf, o + 8),
            seqno: dec_u64(&self.buf, o + 16),
        }
    }
    pub fn set_fkey(&mut self, i: u32, k: FKey) {
        let o = Self::rec_off(KeyLayout::Fixed, i);
        enc_u64(&mut self.buf, o, k.syndrome);
        enc_u64(&mut self.buf, o + 8, k.child);
        enc_u64(&mut self.buf, o + 16, k.seqno);
    }
    pub fn vkey(&self, i: u32) -> VKey {
        let o = Self::rec_off(KeyLayout::VarNonleaf, i);
        VKey {
            keylen: dec_u32(&self.buf, o),
            keypos: dec_u32(&self.buf, o + 4),
            child: dec_u64(&self.buf, o + 8),
            seqno: dec_u64(&self.buf, o + 16),
        }
    }
    pub fn set_vkey(&mut self, i: u32, k: VKey) {
        let o = Self::rec_off(KeyLayout::VarNonleaf, i);
        enc_u32(&mut self.buf, o, k.keylen);
        enc_u32(&mut self.buf, o + 4, k.keypos);
        enc_u64(&mut self.buf, o + 8, k.child);
        enc_u64(&mut self.buf, o + 16, k.seqno);
    }
    pub fn leaf_entry(&self, i: u32) -> LeafEntry {
        let o = Self::rec_off(KeyLayout::VarLeaf, i);
        LeafEntry {
            keylen: dec_u16(&self.buf, o),
            keypos: dec_u16(&self.buf, o + 2),
            datalen: dec_u64(&self.buf, o + 4),
            ptr: dec_u64(&self.buf, o + 12),
            seqno: dec_u64(&self.buf, o + 20),
            syndrome: dec_u64(&self.buf, o + 28),
        }
    }
    pub fn set_leaf_entry(&mut self, i: u32, e: LeafEntry) {
        let o = Self::rec_off(KeyLayout::VarLeaf, i);
        enc_u16(&mut self.buf, o, e.keylen);
        enc_u16(&mut self.buf, o + 2, e.keypos);
        enc_u64(&mut self.buf, o + 4, e.datalen);
        enc_u64(&mut self.buf, o + 12, e.ptr);
        enc_u64(&mut self.buf, o + 20, e.seqno);
        enc_u64(&mut self.buf, o + 28, e.syndrome);
    }
    // key/value byte access
    pub fn key_bytes(&self, pos: u32, len: u32) -> &[u8] {
        &self.buf[pos as usize..(pos + len) as usize]
    }
    pub fn leaf_key(&self, i: u32) -> &[u8] {
        let e = self.leaf_entry(i);
        self.key_bytes(e.keypos as u32, e.keylen as u32)
    }
    /// Inline value bytes; only meaningful when `ptr == 0`
    pub fn leaf_inline_value(&self, i: u32) -> &[u8] {
        let e = self.leaf_entry(i);
        debug_assert_eq!(e.ptr, 0);
        let start = e.keypos as usize + e.keylen as usize;
        &self.buf[start..start + e.datalen as usize]
    }
    pub fn vkey_key(&self, i: u32) -> &[u8] {
        let k = self.vkey(i);
        self.key_bytes(k.keypos, k.keylen)
    }
    // space accounting (header excluded)
    #[inline(always)]
    pub fn free_bytes(&self, layout: KeyLayout) -> u32 {
        self.insert_ptr() - (NODE_HEADER_SIZE as u32 + self.nkeys() * layout.rec_size() as u32)
    }
    #[inline(always)]
    pub fn used_bytes(&self, layout: KeyLayout) -> u32 {
        (self.nodesize() as u32 - self.insert_ptr()) + self.nkeys() * layout.rec_size() as u32
    }
    // record array manipulation
    /// Shift records `[i, nkeys)` right by one slot and bump `nkeys`; slot `i` is
    /// left stale for the caller to fill
    pub fn open_record_slot(&mut self, layout: KeyLayout, i: u32) {
        let nkeys = self.nkeys();
        debug_assert!(i <= nkeys);
        let start = Self::rec_off(layout, i);
        let end = Self::rec_off(layout, nkeys);
        debug_assert!(end + layout.rec_size() <= self.insert_ptr() as usize);
        self.buf.copy_within(start..end, start + layout.rec_size());
        self.set_nkeys(nkeys + 1);
    }
    /// Shift records `[i+1, nkeys)` left over slot `i` and drop `nkeys`
    pub fn close_record_slot(&mut self, layout: KeyLayout, i: u32) {
        let nkeys = self.nkeys();
        debug_assert!(i < nkeys);
        let start = Self::rec_off(layout, i + 1);
        let end = Self::rec_off(layout, nkeys);
        self.buf.copy_within(start..end, start - layout.rec_size());
        self.set_nkeys(nkeys - 1);
    }
    // variable area management
    /// Carve `key` (plus an optional inline value) off the bottom of the free
    /// region; returns the new key position
    pub fn alloc_var(&mut self, key: &[u8], inline: Option<&[u8]>) -> u32 {
        let dlen = inline.map(<[u8]>::len).unwrap_or(0);
        let total = key.len() + dlen;
        let pos = self.insert_ptr() as usize - total;
        self.buf[pos..pos + key.len()].copy_from_slice(key);
        if let Some(d) = inline {
            self.buf[pos + key.len()..pos + total].copy_from_slice(d);
        }
        self.set_insert_ptr(pos as u32);
        pos as u32
    }
    /// Release the blob at `[pos, pos+len)`, compacting the variable area and
    /// recomputing every affected record's key position from the new `insert_ptr`
    pub fn free_var(&mut self, layout: KeyLayout, pos: u32, len: u32) {
        if len == 0 {
            return;
        }
        let ip = self.insert_ptr();
        debug_assert!(pos >= ip && pos + len <= self.nodesize() as u32);
        self.buf
            .copy_within(ip as usize..pos as usize, (ip + len) as usize);
        self.set_insert_ptr(ip + len);
        let nkeys = self.nkeys();
        match layout {
            KeyLayout::VarLeaf => {
                for i in 0..nkeys {
                    let mut e = self.leaf_entry(i);
                    if (e.keypos as u32) < pos {
                        e.keypos += len as u16;
                        self.set_leaf_entry(i, e);
                    }
                }
            }
            KeyLayout::VarNonleaf => {
                for i in 0..nkeys {
                    let mut k = self.vkey(i);
                    if k.keypos < pos {
                        k.keypos += len;
                        self.set_vkey(i, k);
                    }
                }
            }
            KeyLayout::Fixed => {
                debug_assert!(false, "fixed layout has no variable area")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mknode(sz: usize) -> NodeBuf {
        let mut n = NodeBuf::new_zeroed(sz);
        n.init(77, LEAF_NODE, 0);
        n
    }

    #[test]
    fn header_roundtrip() {
        let mut n = mknode(1024);
        n.set_next(11);
        n.set_rightmost(22);
        n.set_level(3);
        n.set_nkeys(9);
        assert_eq!(n.logical_id(), 77);
        assert_eq!(n.next(), 11);
        assert_eq!(n.rightmost(), 22);
        assert_eq!(n.level(), 3);
        assert_eq!(n.nkeys(), 9);
        assert_eq!(n.insert_ptr(), 1024);
        assert!(n.is_leaf());
        assert!(!n.is_overflow());
    }
    #[test]
    fn leaf_entry_roundtrip() {
        let mut n = mknode(1024);
        let pos = n.alloc_var(b"hello", Some(b"world"));
        n.open_record_slot(KeyLayout::VarLeaf, 0);
        n.set_leaf_entry(
            0,
            LeafEntry {
                keylen: 5,
                keypos: pos as u16,
                datalen: 5,
                ptr: 0,
                seqno: 42,
                syndrome: 0,
            },
        );
        assert_eq!(n.leaf_key(0), b"hello");
        assert_eq!(n.leaf_inline_value(0), b"world");
        assert_eq!(n.leaf_entry(0).seqno, 42);
        assert_eq!(
            n.used_bytes(KeyLayout::VarLeaf),
            (VLKEY_SIZE + 10) as u32
        );
    }
    #[test]
    fn free_var_recomputes_keypos() {
        let mut n = mknode(1024);
        // three entries; free the middle blob and check both survivors
        let mut entries = vec![];
        for (k, v) in [(&b"aa"[..], &b"11"[..]), (b"bb", b"22"), (b"cc", b"33")] {
            let pos = n.alloc_var(k, Some(v));
            let i = n.nkeys();
            n.open_record_slot(KeyLayout::VarLeaf, i);
            n.set_leaf_entry(
                i,
                LeafEntry {
                    keylen: 2,
                    keypos: pos as u16,
                    datalen: 2,
                    ptr: 0,
                    seqno: 0,
                    syndrome: 0,
                },
            );
            entries.push(pos);
        }
        let mid = n.leaf_entry(1);
        n.close_record_slot(KeyLayout::VarLeaf, 1);
        n.free_var(KeyLayout::VarLeaf, mid.keypos as u32, 4);
        assert_eq!(n.nkeys(), 2);
        assert_eq!(n.leaf_key(0), b"aa");
        assert_eq!(n.leaf_inline_value(0), b"11");
        assert_eq!(n.leaf_key(1), b"cc");
        assert_eq!(n.leaf_inline_value(1), b"33");
        assert_eq!(n.insert_ptr(), 1024 - 8);
    }
    #[test]
    fn vkey_roundtrip() {
        let mut n = NodeBuf::new_zeroed(1024);
        n.init(5, 0, 1);
        let pos = n.alloc_var(b"anchor", None);
        n.open_record_slot(KeyLayout::VarNonleaf, 0);
        n.set_vkey(
            0,
            VKey {
                keylen: 6,
                keypos: pos,
                child: 99,
                seqno: 1,
            },
        );
        assert_eq!(n.vkey_key(0), b"anchor");
        assert_eq!(n.vkey(0).child, 99);
    }
    #[test]
    fn fkey_roundtrip() {
        let mut n = NodeBuf::new_zeroed(1024);
        n.init(5, 0, 1);
        n.open_record_slot(KeyLayout::Fixed, 0);
        n.set_fkey(
            0,
            FKey {
                syndrome: u64::MAX - 3,
                child: 1234,
                seqno: 9,
            },
        );
        assert_eq!(n.fkey(0).syndrome, u64::MAX - 3);
        assert_eq!(n.fkey(0).child, 1234);
    }
}
