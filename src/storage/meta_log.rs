//! # Metadata Batch Log
//!
//! The durable backend behind the metadata cache: an append-only log of
//! atomic batches. One batch is one committed transaction's key-value
//! deltas; it either lands in full or is discarded on replay, which is what
//! makes the cache flush a single backend transaction.
//!
//! ## Frame Format
//!
//! ```text
//! +--------+-------------+---------+--------------------------+
//! | magic  | payload len | CRC-32  | payload (records)        |
//! | (4,LE) | (4, LE)     | (4, LE) |                          |
//! +--------+-------------+---------+--------------------------+
//! ```
//!
//! Each record in the payload is `op (1) | key len (4, LE) |
//! value len (4, LE) | key | value`, where op 1 is put and op 2 is delete
//! (deletes carry an empty value).
//!
//! ## Recovery
//!
//! Replay applies whole frames in order. The first frame with a bad magic,
//! short body, or failing checksum marks the end of the log — the torn
//! tail of a crashed append — and everything from there on is truncated.
//! This mirrors the usual write-ahead recovery rule: an invalid frame is
//! not corruption to report, it is where the log ends.
//!
//! ## Compaction
//!
//! The log only grows while the database is open. [`MetaLog::rewrite`]
//! collapses it to a single frame holding the current state, writing to a
//! temporary file and renaming over the log so a crash mid-compaction
//! leaves the old log intact.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};
use eyre::{bail, Result, WrapErr};
use parking_lot::Mutex;
use tracing::warn;

use crate::config::constants::{META_FRAME_HEADER_SIZE, META_FRAME_MAGIC, META_LOG_NAME};
use crate::treap::Immutable;

const FRAME_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// A put (`Some(value)`) or delete (`None`) applied to one key.
pub type BatchOp = (Bytes, Option<Bytes>);

/// Append-only log of metadata batches.
pub struct MetaLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl MetaLog {
    /// Opens (or creates) the log in `dir` and replays it, returning the
    /// reconstructed state. A torn tail is truncated away.
    pub fn open(dir: &Path) -> Result<(MetaLog, Immutable)> {
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create metadata directory '{}'", dir.display()))?;
        let path = dir.join(META_LOG_NAME);

        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("failed to read metadata log '{}'", path.display()))
            }
        };

        let (state, valid_len) = replay(&contents)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open metadata log '{}'", path.display()))?;
        if (valid_len as u64) < file.metadata()?.len() {
            warn!(
                valid = valid_len,
                total = contents.len(),
                "discarding torn tail of metadata log"
            );
            file.set_len(valid_len as u64)
                .wrap_err("failed to truncate torn metadata log tail")?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len as u64))?;

        Ok((
            MetaLog {
                path,
                file: Mutex::new(file),
            },
            state,
        ))
    }

    /// Appends one batch frame and syncs it to disk. The batch is durable
    /// when this returns; a crash mid-write leaves a torn tail that the
    /// next open discards.
    pub fn append_batch(&self, ops: &[BatchOp]) -> Result<()> {
        let payload = encode_ops(ops);
        let mut frame = Vec::with_capacity(META_FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&META_FRAME_MAGIC.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&FRAME_CRC.checksum(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        let mut file = self.file.lock();
        file.write_all(&frame)
            .wrap_err("failed to append metadata batch")?;
        file.sync_data().wrap_err("failed to sync metadata log")?;
        Ok(())
    }

    /// Compacts the log to a single frame holding `state`, via temp file
    /// and rename.
    pub fn rewrite(&self, state: &Immutable) -> Result<()> {
        let ops: Vec<BatchOp> = state.iter().map(|(k, v)| (k, Some(v))).collect();
        let payload = encode_ops(&ops);
        let mut frame = Vec::with_capacity(META_FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&META_FRAME_MAGIC.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&FRAME_CRC.checksum(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        let tmp_path = self.path.with_extension("log.tmp");
        let mut tmp = File::create(&tmp_path)
            .wrap_err_with(|| format!("failed to create '{}'", tmp_path.display()))?;
        tmp.write_all(&frame)
            .wrap_err("failed to write compacted metadata log")?;
        tmp.sync_all()?;

        let mut file = self.file.lock();
        fs::rename(&tmp_path, &self.path)
            .wrap_err("failed to replace metadata log with compacted copy")?;
        let mut replacement = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .wrap_err("failed to reopen compacted metadata log")?;
        replacement.seek(SeekFrom::End(0))?;
        *file = replacement;
        Ok(())
    }
}

fn encode_ops(ops: &[BatchOp]) -> Vec<u8> {
    let size: usize = ops
        .iter()
        .map(|(k, v)| 9 + k.len() + v.as_ref().map_or(0, Bytes::len))
        .sum();
    let mut payload = Vec::with_capacity(size);
    for (key, value) in ops {
        match value {
            Some(value) => {
                payload.push(OP_PUT);
                payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
                payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
                payload.extend_from_slice(key);
                payload.extend_from_slice(value);
            }
            None => {
                payload.push(OP_DELETE);
                payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
                payload.extend_from_slice(&0u32.to_le_bytes());
                payload.extend_from_slice(key);
            }
        }
    }
    payload
}

/// Applies whole valid frames, returning the state and the byte length of
/// the valid prefix.
fn replay(contents: &[u8]) -> Result<(Immutable, usize)> {
    let mut state = Immutable::default();
    let mut pos = 0usize;

    while contents.len() - pos >= META_FRAME_HEADER_SIZE {
        let header = &contents[pos..pos + META_FRAME_HEADER_SIZE];
        let magic = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
        if magic != META_FRAME_MAGIC {
            break;
        }
        let payload_len = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as usize;
        let checksum = u32::from_le_bytes(header[8..12].try_into().expect("4 bytes"));

        let body_start = pos + META_FRAME_HEADER_SIZE;
        let Some(body_end) = body_start.checked_add(payload_len).filter(|e| *e <= contents.len())
        else {
            break;
        };
        let payload = &contents[body_start..body_end];
        if FRAME_CRC.checksum(payload) != checksum {
            break;
        }

        state = apply_ops(payload, state)?;
        pos = body_end;
    }

    Ok((state, pos))
}

fn apply_ops(payload: &[u8], mut state: Immutable) -> Result<Immutable> {
    let mut pos = 0usize;
    while pos < payload.len() {
        if payload.len() - pos < 9 {
            bail!("malformed metadata record header inside a checksummed frame");
        }
        let op = payload[pos];
        let key_len =
            u32::from_le_bytes(payload[pos + 1..pos + 5].try_into().expect("4 bytes")) as usize;
        let value_len =
            u32::from_le_bytes(payload[pos + 5..pos + 9].try_into().expect("4 bytes")) as usize;
        pos += 9;
        if payload.len() - pos < key_len + value_len {
            bail!("metadata record overruns its frame");
        }
        let key = Bytes::copy_from_slice(&payload[pos..pos + key_len]);
        pos += key_len;
        let value = Bytes::copy_from_slice(&payload[pos..pos + value_len]);
        pos += value_len;

        state = match op {
            OP_PUT => state.insert(key, value),
            OP_DELETE => state.remove(&key),
            other => bail!("unknown metadata record op {other}"),
        };
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn fresh_log_is_empty() {
        let dir = tempdir().unwrap();
        let (_log, state) = MetaLog::open(dir.path()).unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn batches_replay_in_order() {
        let dir = tempdir().unwrap();
        {
            let (log, _) = MetaLog::open(dir.path()).unwrap();
            log.append_batch(&[(b("a"), Some(b("1"))), (b("b"), Some(b("2")))])
                .unwrap();
            log.append_batch(&[(b("a"), None), (b("c"), Some(b("3")))])
                .unwrap();
        }

        let (_log, state) = MetaLog::open(dir.path()).unwrap();
        assert_eq!(state.len(), 2);
        assert!(!state.contains(b"a"));
        assert_eq!(state.get(b"b"), Some(b("2")));
        assert_eq!(state.get(b"c"), Some(b("3")));
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempdir().unwrap();
        {
            let (log, _) = MetaLog::open(dir.path()).unwrap();
            log.append_batch(&[(b("a"), Some(b("1")))]).unwrap();
            log.append_batch(&[(b("b"), Some(b("2")))]).unwrap();
        }

        // Chop the second frame in half, simulating a crash mid-append.
        let path = dir.path().join(META_LOG_NAME);
        let contents = fs::read(&path).unwrap();
        fs::write(&path, &contents[..contents.len() - 5]).unwrap();

        let (_log, state) = MetaLog::open(dir.path()).unwrap();
        assert_eq!(state.get(b"a"), Some(b("1")));
        assert!(!state.contains(b"b"));

        // The truncated log ends cleanly after the first frame.
        let repaired = fs::metadata(&path).unwrap().len();
        assert!(repaired < contents.len() as u64);
    }

    #[test]
    fn corrupt_frame_ends_replay() {
        let dir = tempdir().unwrap();
        {
            let (log, _) = MetaLog::open(dir.path()).unwrap();
            log.append_batch(&[(b("a"), Some(b("1")))]).unwrap();
            log.append_batch(&[(b("b"), Some(b("2")))]).unwrap();
        }

        let path = dir.path().join(META_LOG_NAME);
        let mut contents = fs::read(&path).unwrap();
        // Flip a payload byte in the second frame.
        let second_payload = contents.len() - 1;
        contents[second_payload] ^= 0xff;
        fs::write(&path, &contents).unwrap();

        let (_log, state) = MetaLog::open(dir.path()).unwrap();
        assert_eq!(state.get(b"a"), Some(b("1")));
        assert!(!state.contains(b"b"));
    }

    #[test]
    fn rewrite_compacts_to_current_state() {
        let dir = tempdir().unwrap();
        let (log, mut state) = MetaLog::open(dir.path()).unwrap();
        for i in 0..32u32 {
            let key = Bytes::copy_from_slice(&i.to_be_bytes());
            log.append_batch(&[(key.clone(), Some(b("v")))]).unwrap();
            state = state.insert(key, b("v"));
        }
        let grown = fs::metadata(dir.path().join(META_LOG_NAME)).unwrap().len();

        state = state.remove(&0u32.to_be_bytes());
        log.rewrite(&state).unwrap();

        let compacted = fs::metadata(dir.path().join(META_LOG_NAME)).unwrap().len();
        assert!(compacted < grown);

        let (_log, replayed) = MetaLog::open(dir.path()).unwrap();
        assert_eq!(replayed.len(), 31);
        assert!(!replayed.contains(&0u32.to_be_bytes()));
        assert!(replayed.contains(&1u32.to_be_bytes()));
    }

    #[test]
    fn appends_continue_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let (log, _) = MetaLog::open(dir.path()).unwrap();
            log.append_batch(&[(b("a"), Some(b("1")))]).unwrap();
        }
        {
            let (log, state) = MetaLog::open(dir.path()).unwrap();
            assert_eq!(state.len(), 1);
            log.append_batch(&[(b("b"), Some(b("2")))]).unwrap();
        }
        let (_log, state) = MetaLog::open(dir.path()).unwrap();
        assert_eq!(state.len(), 2);
    }
}
