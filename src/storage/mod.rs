//! # Storage Substrates
//!
//! The two persistence layers beneath the transaction:
//!
//! - [`block_files`] — the append-only flat-file store holding immutable
//!   block payloads across numbered files.
//! - [`meta_log`] — the durable batch log behind the metadata cache.
//!
//! Neither layer knows about transactions; each exposes a narrow contract
//! (append, positioned read, scan, truncate-to-anchor / batch append,
//! replay) that the database layer composes into atomic commits.

pub mod block_files;
pub mod meta_log;

pub use block_files::{BlockLocation, BlockStore, WriteCursor};
pub use meta_log::MetaLog;
