//! Legacy pointer records and the flat key layout they are stored under.
//!
//! Keys look like `{project_id}/{segment}/{bucket}/{encrypted_path}` where
//! `segment` is `l` for an object's last segment and `s{index}` otherwise.
//! Only the last-segment record carries the stream metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::segment::NodeId;

/// Which segment of an object a legacy key addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LegacySegment {
    Last,
    Index(u32),
}

impl LegacySegment {
    fn path_component(&self) -> String {
        match self {
            LegacySegment::Last => "l".to_string(),
            LegacySegment::Index(index) => format!("s{}", index),
        }
    }
}

/// Prefix under which every last-segment record of a bucket lives. Ends in `/`.
pub fn bucket_prefix(project_id: Uuid, bucket: &str) -> Vec<u8> {
    format!("{}/{}/{}/", project_id, LegacySegment::Last.path_component(), bucket).into_bytes()
}

pub fn segment_key(
    project_id: Uuid,
    segment: LegacySegment,
    bucket: &str,
    encrypted_path: &[u8],
) -> Vec<u8> {
    let mut key = format!("{}/{}/{}/", project_id, segment.path_component(), bucket).into_bytes();
    key.extend_from_slice(encrypted_path);
    key
}

/// Serialized per-segment record of the legacy pointer store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyPointer {
    pub creation_date: DateTime<Utc>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub segment_size: i64,
    pub inline_segment: Vec<u8>,
    pub remote: Option<LegacyRemote>,
    /// Serialized [`StreamMeta`]; empty for non-last segments.
    pub metadata: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyRemote {
    pub root_piece_id: Vec<u8>,
    pub remote_pieces: Vec<LegacyRemotePiece>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyRemotePiece {
    pub piece_num: i32,
    pub node_id: NodeId,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMeta {
    pub number_of_segments: i64,
    pub encrypted_stream_info: Vec<u8>,
    pub encryption_type: i32,
    pub encryption_block_size: i32,
    pub last_segment_meta: Option<SegmentMeta>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub encrypted_key: Vec<u8>,
    pub key_nonce: Vec<u8>,
}

impl LegacyPointer {
    pub fn decode(data: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(data)
    }

    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }
}

impl StreamMeta {
    /// An empty blob decodes to the default meta, as non-last segments carry none.
    pub fn decode(data: &[u8]) -> bincode::Result<Self> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        bincode::deserialize(data)
    }

    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }
}
