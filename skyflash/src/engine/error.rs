/*
 * Created on Thu Jan 18 2024
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

use core::fmt;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Storage core errors
pub enum EngineError {
    /// the key doesn't exist
    KeyNotFound,
    /// the key already exists (a create-only write hit a live key)
    KeyExists,
    /// the caller-supplied buffer can't hold the value
    BufferTooSmall,
    /// an in-place range update would grow past the leaf's free space; retry the
    /// offending key through the single-key write path which is allowed to split
    RangeUpdateNeedsSpace,
    /// the hash directory is out of entries for this shard
    DirectoryFull,
    /// the logical id space of this partition is exhausted
    IdSpaceExhausted,
    /// i/o or allocation failure in the backing store
    Failure,
    /// a node image failed its checksum on read
    CorruptNode,
    /// bad tree or directory configuration
    InvalidConfig,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::KeyNotFound => "key not found",
            Self::KeyExists => "key already exists",
            Self::BufferTooSmall => "buffer too small",
            Self::RangeUpdateNeedsSpace => "range update needs space",
            Self::DirectoryFull => "hash directory full",
            Self::IdSpaceExhausted => "logical id space exhausted",
            Self::Failure => "i/o or allocation failure",
            Self::CorruptNode => "node checksum mismatch",
            Self::InvalidConfig => "invalid configuration",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for EngineError {}
