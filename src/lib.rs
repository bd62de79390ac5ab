//! # chaindb - Transactional Block-and-Metadata Store
//!
//! chaindb is the storage core of a blockchain node: it unifies two very
//! different persistence layers behind one snapshot-isolated transaction
//! API.
//!
//! - **Block files**: large immutable block payloads live in append-only
//!   flat files, addressed by `(file, offset, length)` and checksummed per
//!   entry. Payloads are written once and only ever removed by pruning
//!   whole files.
//! - **Metadata**: a sorted key-value space organized into nested buckets,
//!   including the block index mapping block hashes to on-disk locations.
//!   Committed state is held in a persistent ordered map and made durable
//!   through a batch log.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │      Database (begin / view / update)         │
//! ├───────────────────────────────────────────────┤
//! │  Transaction (snapshot + pending overlays)    │
//! │     Buckets · Cursors · Block staging         │
//! ├───────────────────────┬───────────────────────┤
//! │  Cache / snapshots    │   Block file store    │
//! │  (persistent treap)   │   (flat .blk files)   │
//! ├───────────────────────┼───────────────────────┤
//! │  Metadata batch log   │   mmap read path      │
//! └───────────────────────┴───────────────────────┘
//! ```
//!
//! ## Transactions
//!
//! A read transaction sees the committed state as of `begin`, no matter
//! what commits while it runs. A write transaction stages every mutation
//! in memory — key-value deltas, block payloads, pruned file numbers — and
//! applies them all at commit: pruned files are deleted, staged blocks are
//! appended (with a truncation anchor for rollback on failure), and the
//! metadata deltas land as one durable batch before the new committed root
//! is published. At most one write transaction exists at a time.
//!
//! ## Quick Start
//!
//! ```ignore
//! use chaindb::{Block, BlockHash, Database};
//!
//! let db = Database::open("./chainstate")?;
//!
//! db.update(|tx| {
//!     tx.store_block(&block)?;
//!     tx.metadata().put(b"tip", block.hash().as_ref())
//! })?;
//!
//! db.view(|tx| {
//!     let bytes = tx.fetch_block(block.hash())?;
//!     let header = tx.fetch_block_header(block.hash())?;
//!     Ok(())
//! })?;
//! ```
//!
//! ## Module Overview
//!
//! - [`database`]: handle, transactions, buckets, cursors, cache
//! - [`storage`]: flat-file block store and metadata batch log
//! - [`treap`]: persistent and staging ordered maps
//! - [`config`]: layout constants and reserved names
//! - [`error`]: the typed error taxonomy of the transaction surface

pub mod config;
pub mod database;
pub mod error;
pub mod storage;
pub mod treap;
pub mod types;

pub use config::constants::{BLOCK_HEADER_SIZE, DEFAULT_MAX_FILE_SIZE, DEFAULT_NETWORK_MAGIC};
pub use database::bucket::Bucket;
pub use database::cursor::Cursor;
pub use database::transaction::Transaction;
pub use database::{Database, Options};
pub use error::{Error, ErrorKind, Result};
pub use types::{Block, BlockHash, BlockRegion, HASH_SIZE};
