//! Segments, their positions and the pieces placed on storage nodes.

use bytes::Buf;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use super::node_alias::{get_uvarint, put_uvarint};
use crate::errors::CodecError;

/// 32-byte identifier of a storage node. The all-zero value means "unset".
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let id: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CodecError::InvalidNodeId(bytes.len()))?;
        Ok(Self(id))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

/// One erasure-coded share of a segment and the node holding it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Piece {
    pub number: u16,
    pub storage_node: NodeId,
}

/// Pieces of a segment, ascending by piece number.
pub type Pieces = Vec<Piece>;

/// Structural problems in a piece list.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PiecesError {
    #[error("pieces missing")]
    Missing,
    #[error("duplicated piece number {0}")]
    DuplicatedNumber(u16),
    #[error("pieces should be ordered")]
    Unordered,
    #[error("piece number {0} is missing storage node id")]
    MissingStorageNode(u16),
}

/// Checks that `pieces` is non-empty, strictly ascending by number and that
/// every piece names a storage node. Order is validated, never fixed up.
pub fn validate_pieces(pieces: &[Piece]) -> Result<(), PiecesError> {
    if pieces.is_empty() {
        return Err(PiecesError::Missing);
    }

    for pair in pieces.windows(2) {
        let (prev, next) = (pair[0].number, pair[1].number);
        if next == prev {
            return Err(PiecesError::DuplicatedNumber(next));
        }
        if next < prev {
            return Err(PiecesError::Unordered);
        }
    }

    if let Some(piece) = pieces.iter().find(|p| p.storage_node.is_zero()) {
        return Err(PiecesError::MissingStorageNode(piece.number));
    }

    Ok(())
}

pub fn node_ids(pieces: &[Piece]) -> Vec<NodeId> {
    pieces.iter().map(|p| p.storage_node).collect()
}

/// Packs piece numbers the same way node aliases are packed.
pub fn encode_piece_numbers(pieces: &[Piece]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(pieces.len());
    for piece in pieces {
        put_uvarint(&mut buf, u64::from(piece.number));
    }
    buf
}

pub fn decode_piece_numbers(mut data: &[u8]) -> Result<Vec<u16>, CodecError> {
    let mut numbers = Vec::new();
    while data.has_remaining() {
        let value = get_uvarint(&mut data)?;
        numbers.push(u16::try_from(value).map_err(|_| CodecError::Overflow("piece number"))?);
    }
    Ok(numbers)
}

const DB_SIGN_BIT: u64 = 1 << 63;

/// Location of a segment inside its object: part number, then index within
/// the part. Field order gives the derived ordering.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SegmentPosition {
    pub part: u32,
    pub index: u32,
}

impl SegmentPosition {
    pub fn new(part: u32, index: u32) -> Self {
        Self { part, index }
    }

    /// Order-preserving packing: part in the high 32 bits, index in the low.
    pub fn encode(&self) -> u64 {
        (u64::from(self.part) << 32) | u64::from(self.index)
    }

    pub fn decode(value: u64) -> Self {
        Self {
            part: (value >> 32) as u32,
            index: value as u32,
        }
    }

    /// Stored form for SQLite's signed integers. The sign bit is flipped so
    /// that `ORDER BY position` follows `(part, index)` for every part.
    pub fn to_db(self) -> i64 {
        (self.encode() ^ DB_SIGN_BIT) as i64
    }

    pub fn from_db(value: i64) -> Self {
        Self::decode(value as u64 ^ DB_SIGN_BIT)
    }
}

impl fmt::Display for SegmentPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.part, self.index)
    }
}

/// A segment row with its placements resolved back to node ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub stream_id: Uuid,
    pub position: SegmentPosition,
    pub root_piece_id: Vec<u8>,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub encrypted_size: i64,
    pub inline_data: Option<Vec<u8>>,
    pub pieces: Pieces,
}

impl Segment {
    pub fn is_inline(&self) -> bool {
        self.pieces.is_empty()
    }
}
