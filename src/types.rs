//! # Core Value Types
//!
//! The identifiers and payload wrappers exchanged across the transaction
//! API: [`BlockHash`], [`Block`], and [`BlockRegion`].
//!
//! Payload bytes travel as [`bytes::Bytes`] so that fetches can hand out
//! reference-counted views that alias the staged or cached buffers instead
//! of copying. Those views remain valid only while the transaction that
//! produced them is open; this is part of the interface contract.

use std::fmt;

use bytes::Bytes;

/// Number of bytes in a block hash.
pub const HASH_SIZE: usize = 32;

/// Fixed-size opaque block identifier.
///
/// The store never interprets the hash; it is both the key of the block
/// index and the lookup key for staged blocks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockHash(pub [u8; HASH_SIZE]);

impl BlockHash {
    /// Builds a hash from a slice, returning `None` unless it is exactly
    /// [`HASH_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl From<[u8; HASH_SIZE]> for BlockHash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for BlockHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A serialized block ready to be stored.
///
/// The store performs no validation of the payload; the hash is supplied by
/// the caller and is trusted to identify the bytes.
#[derive(Debug, Clone)]
pub struct Block {
    hash: BlockHash,
    height: u32,
    bytes: Bytes,
}

impl Block {
    pub fn new(hash: BlockHash, height: u32, bytes: Bytes) -> Self {
        Self {
            hash,
            height,
            bytes,
        }
    }

    pub fn hash(&self) -> &BlockHash {
        &self.hash
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

/// Identifies a contiguous slice of a stored block's payload.
///
/// `offset` is zero-based from the start of the serialized block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRegion {
    pub hash: BlockHash,
    pub offset: u32,
    pub len: u32,
}
