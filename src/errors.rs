//! Error taxonomy for metabase operations.
//!
//! Validation problems surface as [`MetabaseError::InvalidRequest`] before any
//! database access. A missing segment and a compare-and-swap conflict are kept
//! as separate variants so callers can tell a stale reference from a lost race.

use thiserror::Error;

use crate::services::batch_writer::StatementError;

/// Failures while decoding compact on-disk encodings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("varint truncated")]
    Truncated,
    #[error("varint overflows {0}")]
    Overflow(&'static str),
    #[error("node id must be 32 bytes, got {0}")]
    InvalidNodeId(usize),
    #[error("piece numbers ({numbers}) and node aliases ({aliases}) differ in length")]
    LengthMismatch { numbers: usize, aliases: usize },
}

#[derive(Debug, Error)]
pub enum MetabaseError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("segment missing")]
    SegmentNotFound,
    #[error("object missing")]
    ObjectNotFound,
    #[error("segment pieces field was changed")]
    ValueChanged,
    #[error("node alias {0} is not assigned")]
    UnknownNodeAlias(u32),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Statement(#[from] StatementError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl MetabaseError {
    /// Invalid request qualified by the offending field, e.g. `OldPieces: pieces missing`.
    pub fn invalid_field(field: &str, reason: impl std::fmt::Display) -> Self {
        Self::InvalidRequest(format!("{}: {}", field, reason))
    }
}

pub type MetabaseResult<T> = Result<T, MetabaseError>;
