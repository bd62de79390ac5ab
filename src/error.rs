//! # Error Taxonomy
//!
//! Transaction-facing operations return a value-typed [`Error`] carrying an
//! [`ErrorKind`], a human-readable description, and an optional underlying
//! cause. Callers dispatch on the kind; the description is for logs and
//! messages only.
//!
//! The kinds are a closed set: conditions that fall outside it (for example
//! a bucket-name collision, or beginning a transaction against a closed
//! database) are reported as [`ErrorKind::DriverSpecific`] with a precise
//! description. Setup paths such as [`Database::open`](crate::Database::open)
//! report contextual `eyre` errors instead; the taxonomy only covers the
//! transaction surface.

use std::error::Error as StdError;
use std::fmt;

/// Classifies every error the transaction surface can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The transaction has already been closed by a commit or rollback.
    TxClosed,
    /// A mutating operation was invoked on a read-only transaction.
    TxNotWritable,
    /// The block being stored already exists, either on disk or staged in
    /// the same transaction.
    BlockExists,
    /// No block with the requested hash exists.
    BlockNotFound,
    /// A region's offset/length falls outside its block, including integer
    /// overflow of `offset + len`.
    BlockRegionInvalid,
    /// On-disk data failed validation: bad checksum, bad magic, or a
    /// malformed index row.
    Corruption,
    /// An underlying I/O or backend failure, wrapped as the cause.
    DriverSpecific,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::TxClosed => "transaction closed",
            ErrorKind::TxNotWritable => "transaction not writable",
            ErrorKind::BlockExists => "block exists",
            ErrorKind::BlockNotFound => "block not found",
            ErrorKind::BlockRegionInvalid => "block region invalid",
            ErrorKind::Corruption => "corruption",
            ErrorKind::DriverSpecific => "driver error",
        };
        f.write_str(name)
    }
}

/// Error type for all transaction operations.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {description}")]
pub struct Error {
    kind: ErrorKind,
    description: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            source: None,
        }
    }

    pub(crate) fn with_source(
        kind: ErrorKind,
        description: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            kind,
            description: description.into(),
            source: Some(source.into()),
        }
    }

    pub(crate) fn tx_closed() -> Self {
        Self::new(ErrorKind::TxClosed, "transaction is closed")
    }

    pub(crate) fn tx_not_writable(op: &str) -> Self {
        Self::new(
            ErrorKind::TxNotWritable,
            format!("{op} requires a writable database transaction"),
        )
    }

    pub(crate) fn corruption(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::Corruption, description)
    }

    pub(crate) fn driver(
        description: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self::with_source(ErrorKind::DriverSpecific, description, source)
    }

    /// Wraps an application-level failure so it can propagate out of a
    /// [`view`](crate::Database::view)/[`update`](crate::Database::update)
    /// closure. Reported as [`ErrorKind::DriverSpecific`].
    pub fn other(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::DriverSpecific, description)
    }

    /// The kind tag callers dispatch on.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable detail string.
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Result alias used across the transaction surface.
pub type Result<T> = std::result::Result<T, Error>;
