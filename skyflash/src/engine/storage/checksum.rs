/*
 * Created on Tue Feb 20 2024
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

//! # Checksum utils
//!
//! Node images carry a 32-bit checksum in their header; it is computed over the
//! whole image with the checksum field itself zeroed, so verification never needs
//! a scratch copy.

use {
    super::node::OFF_CHECKSUM,
    crc::{Crc, Digest, CRC_32_ISCSI},
    std::fmt,
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Clone)]
pub struct SCrc32 {
    digest: Digest<'static, u32>,
}

impl Default for SCrc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SCrc32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SCrc32")
            .field("digest", &self.digest.clone().finalize())
            .finish()
    }
}

impl SCrc32 {
    pub const fn new() -> Self {
        Self {
            digest: CRC32.digest(),
        }
    }
    pub fn update(&mut self, b: &[u8]) {
        self.digest.update(b)
    }
    pub fn finish(self) -> u32 {
        self.digest.finalize()
    }
}

/// Checksum a node image, skipping the in-header checksum field
pub fn node_checksum(image: &[u8]) -> u32 {
    let mut crc = SCrc32::new();
    crc.update(&image[..OFF_CHECKSUM]);
    crc.update(&[0u8; 4]);
    crc.update(&image[OFF_CHECKSUM + 4..]);
    crc.finish()
}

#[cfg(test)]
mod tests {
    use {
        super::node_checksum,
        crate::engine::storage::node::OFF_CHECKSUM,
    };

    #[test]
    fn ignores_embedded_checksum_field() {
        let mut image = vec![7u8; 512];
        let a = node_checksum(&image);
        image[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&a.to_le_bytes());
        assert_eq!(a, node_checksum(&image));
    }
    #[test]
    fn detects_payload_corruption() {
        let mut image = vec![7u8; 512];
        let a = node_checksum(&image);
        image[300] ^= 0xFF;
        assert_ne!(a, node_checksum(&image));
    }
}
