//! # Layout and Tuning Constants
//!
//! Centralizes every constant that ties the on-disk layout together. Values
//! that depend on each other are co-located and cross-checked with
//! compile-time assertions so a change to one cannot silently invalidate
//! another.
//!
//! ## Key Space Layout
//!
//! All metadata lives in one lexicographically sorted key space:
//!
//! ```text
//! [0,0,0,0] || user_key          metadata bucket (root)
//! [0,0,0,1] || block_hash        block index bucket
//! [0,0,0,N] || user_key          user-created buckets (N >= 2)
//! "bidx" || parent_id || name    child-bucket registry
//! "curbucketid"                  4-byte big-endian allocation counter
//! ```
//!
//! Bucket ids are 4-byte big-endian values, so binary-prefixed bucket keys
//! sort before the ASCII registry keys and never interleave with them.

/// Bytes in a bucket id prefix.
pub const BUCKET_ID_SIZE: usize = 4;

/// Id of the root metadata bucket.
pub const METADATA_BUCKET_ID: [u8; BUCKET_ID_SIZE] = [0, 0, 0, 0];

/// Id of the block index bucket mapping block hash to location row.
pub const BLOCK_INDEX_BUCKET_ID: [u8; BUCKET_ID_SIZE] = [0, 0, 0, 1];

/// Reserved key holding the highest allocated bucket id (big-endian u32).
pub const CUR_BUCKET_ID_KEY: &[u8] = b"curbucketid";

/// Prefix of the child-bucket registry: `bidx || parent_id || child_name`.
pub const BUCKET_INDEX_PREFIX: &[u8] = b"bidx";

/// Key (within the metadata bucket) of the persisted write cursor row.
pub const WRITE_LOC_KEY: &[u8] = b"writeloc";

const _: () = assert!(
    METADATA_BUCKET_ID[3] < BLOCK_INDEX_BUCKET_ID[3],
    "the metadata bucket must sort before the block index bucket"
);

// ============================================================================
// BLOCK FILE LAYOUT
// ============================================================================

/// Directory (under the database path) holding the block files.
pub const BLOCKS_DIR_NAME: &str = "blocks";

/// Filename extension of block files (`NNNNNNNNN.blk`).
pub const BLOCK_FILE_EXTENSION: &str = "blk";

/// Digits in a block file name; supports dense numbering to 10^9 files.
pub const BLOCK_FILE_NUM_DIGITS: usize = 9;

/// Default maximum size of a single block file (512 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u32 = 512 * 1024 * 1024;

/// Bytes of envelope around each stored block: network magic (4), payload
/// length (4) before the payload, CRC-32 (4) after it.
pub const BLOCK_ENTRY_OVERHEAD: u32 = 12;

/// Offset of the payload within a block entry.
pub const BLOCK_ENTRY_HEADER_SIZE: u32 = 8;

const _: () = assert!(
    BLOCK_ENTRY_HEADER_SIZE + 4 == BLOCK_ENTRY_OVERHEAD,
    "entry overhead must be the header plus the trailing checksum"
);

/// Default network magic written into every block entry. Opened stores must
/// be configured with the magic their files were written with.
pub const DEFAULT_NETWORK_MAGIC: u32 = 0xd9b4_bef9;

/// Serialized size of a block header; `fetch_block_header` reads exactly
/// this many bytes from offset zero.
pub const BLOCK_HEADER_SIZE: u32 = 80;

// ============================================================================
// METADATA LOG
// ============================================================================

/// Directory (under the database path) holding the metadata log.
pub const META_DIR_NAME: &str = "metadata";

/// Filename of the metadata batch log.
pub const META_LOG_NAME: &str = "meta.log";

/// Magic word opening every metadata batch frame.
pub const META_FRAME_MAGIC: u32 = 0x4d4c_4f47; // "MLOG"

/// Frame header: magic (4), payload length (4), CRC-32 (4).
pub const META_FRAME_HEADER_SIZE: usize = 12;

// ============================================================================
// FILE HANDLE LIMITS
// ============================================================================

/// Default cap on concurrently mapped block files on the read path.
pub const DEFAULT_MAX_OPEN_FILES: usize = 64;

/// Floor for the configurable open-file cap.
pub const MIN_MAX_OPEN_FILES: usize = 2;

const _: () = assert!(
    MIN_MAX_OPEN_FILES >= 2,
    "the read cache must hold at least the current and one older file"
);
