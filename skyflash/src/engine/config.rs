/*
 * Created on Tue Feb 13 2024
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
    crate::engine::{
        error::{EngineError, EngineResult},
        storage::node::{FKEY_SIZE, NODE_HEADER_SIZE, VLKEY_SIZE},
    },
    serde::Deserialize,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
/// How non-leaf nodes index their subtrees. The two modes are mutually exclusive
/// per tree
pub enum IndexMode {
    /// non-leaf nodes carry 64-bit key syndromes only; the full key compare happens
    /// at the leaf
    Syndrome,
    /// non-leaf nodes carry variable-length keys ordered by the caller's comparator
    Secondary,
}

fn one() -> u32 {
    1
}

fn default_l1_buckets() -> usize {
    TreeConfig::DEFAULT_L1_BUCKETS
}

fn default_min_keys() -> u32 {
    TreeConfig::MIN_KEYS_FLOOR
}

#[derive(Debug, Clone, Deserialize)]
/// Initialization options for one tree instance
pub struct TreeConfig {
    pub index_mode: IndexMode,
    #[serde(default)]
    pub in_memory: bool,
    #[serde(default)]
    pub reload: bool,
    #[serde(default)]
    pub verbose_debug: bool,
    /// this tree's slot in the logical-id stripe
    #[serde(default)]
    pub n_partition: u32,
    /// total partition count used for logical id striping
    #[serde(default = "one")]
    pub n_partitions: u32,
    pub max_key_size: u32,
    #[serde(default = "default_min_keys")]
    pub min_keys_per_node: u32,
    pub nodesize: u32,
    #[serde(default = "default_l1_buckets")]
    pub n_l1cache_buckets: usize,
}

impl TreeConfig {
    pub const DEFAULT_L1_BUCKETS: usize = 9_000;
    pub const MIN_KEYS_FLOOR: u32 = 4;

    pub fn new(index_mode: IndexMode, nodesize: u32, max_key_size: u32) -> Self {
        Self {
            index_mode,
            in_memory: false,
            reload: false,
            verbose_debug: false,
            n_partition: 0,
            n_partitions: 1,
            max_key_size,
            min_keys_per_node: Self::MIN_KEYS_FLOOR,
            nodesize,
            n_l1cache_buckets: Self::DEFAULT_L1_BUCKETS,
        }
    }
    /// Load a tree configuration from its YAML representation
    pub fn from_yaml(raw: &str) -> EngineResult<Self> {
        let this: Self = serde_yaml::from_str(raw).map_err(|e| {
            log::error!("failed to parse tree config: {e}");
            EngineError::InvalidConfig
        })?;
        this.validate()?;
        Ok(this)
    }
    pub fn validate(&self) -> EngineResult<()> {
        let leaf_entry = VLKEY_SIZE as u32;
        if self.min_keys_per_node < Self::MIN_KEYS_FLOOR {
            return Err(EngineError::InvalidConfig);
        }
        if self.n_partitions == 0 || self.n_partition >= self.n_partitions {
            return Err(EngineError::InvalidConfig);
        }
        if self.nodesize as usize <= NODE_HEADER_SIZE || self.nodesize % 512 != 0 {
            return Err(EngineError::InvalidConfig);
        }
        // every leaf must be able to hold min_keys_per_node maximum-sized keys
        let needed = (leaf_entry + self.max_key_size) * self.min_keys_per_node
            + NODE_HEADER_SIZE as u32;
        if self.nodesize < needed || self.max_key_size == 0 {
            return Err(EngineError::InvalidConfig);
        }
        Ok(())
    }
    /// Key+value sizes at or past this boundary move the value into an overflow
    /// chain, keeping only the key inline
    pub fn big_object_threshold(&self) -> u64 {
        ((self.nodesize as u64 - NODE_HEADER_SIZE as u64) / 4) - VLKEY_SIZE as u64
    }
    pub fn nodesize_less_hdr(&self) -> u32 {
        self.nodesize - NODE_HEADER_SIZE as u32
    }
    /// Fixed (syndrome) records a non-leaf node can hold
    pub fn fkeys_per_node(&self) -> u32 {
        (self.nodesize - NODE_HEADER_SIZE as u32) / FKEY_SIZE as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirMode {
    Fifo,
    Slab,
}

#[derive(Debug, Clone, Deserialize)]
/// Initialization options for one shard's hash directory
pub struct DirConfig {
    /// block capacity of the shard
    pub total_blocks: u64,
    /// cap on object count; 0 means "derive from the block count"
    #[serde(default)]
    pub max_nobjs: u64,
    pub mode: DirMode,
    /// keep a per-block 64-bit key shortcut for fixed-width keys
    #[serde(default)]
    pub key_cache: bool,
    /// storm mode trades the address table and eager key-cache backing for lazy
    /// per-segment allocation
    #[serde(default)]
    pub storm_mode: bool,
    #[serde(default = "default_segment_blks")]
    pub segment_blks: u64,
}

fn default_segment_blks() -> u64 {
    DirConfig::DEFAULT_SEGMENT_BLKS
}

impl DirConfig {
    pub const DEFAULT_SEGMENT_BLKS: u64 = 4096;

    pub fn new(total_blocks: u64, mode: DirMode) -> Self {
        Self {
            total_blocks,
            max_nobjs: 0,
            mode,
            key_cache: false,
            storm_mode: false,
            segment_blks: Self::DEFAULT_SEGMENT_BLKS,
        }
    }
    pub fn validate(&self) -> EngineResult<()> {
        if self.total_blocks == 0 && self.max_nobjs == 0 {
            log::error!("invalid shard size");
            return Err(EngineError::InvalidConfig);
        }
        if self.segment_blks == 0 || !self.segment_blks.is_power_of_two() {
            return Err(EngineError::InvalidConfig);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{DirConfig, DirMode, IndexMode, TreeConfig};

    #[test]
    fn tree_config_yaml() {
        let cfg = TreeConfig::from_yaml(
            r#"
index_mode: secondary
nodesize: 8192
max_key_size: 256
"#,
        )
        .unwrap();
        assert_eq!(cfg.index_mode, IndexMode::Secondary);
        assert_eq!(cfg.nodesize, 8192);
        assert_eq!(cfg.min_keys_per_node, 4);
        assert_eq!(cfg.n_partitions, 1);
    }
    #[test]
    fn tree_config_rejects_tiny_node() {
        // 4 * (entry + max key) doesn't fit in one node
        let cfg = TreeConfig::new(IndexMode::Secondary, 1024, 512);
        assert!(cfg.validate().is_err());
    }
    #[test]
    fn tree_config_rejects_unaligned_nodesize() {
        let cfg = TreeConfig::new(IndexMode::Secondary, 8000, 64);
        assert!(cfg.validate().is_err());
    }
    #[test]
    fn big_object_threshold_formula() {
        let cfg = TreeConfig::new(IndexMode::Secondary, 8192, 256);
        assert_eq!(
            cfg.big_object_threshold(),
            (8192 - super::NODE_HEADER_SIZE as u64) / 4 - super::VLKEY_SIZE as u64
        );
    }
    #[test]
    fn dir_config_rejects_empty_shard() {
        let cfg = DirConfig::new(0, DirMode::Slab);
        assert!(cfg.validate().is_err());
    }
}
