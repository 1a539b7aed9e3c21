//! Represents an object version and its stream identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Version written for unversioned objects, read back as "latest".
pub const LATEST_VERSION: i64 = -1;

/// Identity of one object version.
///
/// `(project_id, bucket_name, encrypted_path, version)` is unique. `stream_id`
/// is generated once and never reassigned; segments hang off it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStream {
    pub project_id: Uuid,
    pub bucket_name: String,
    pub encrypted_path: Vec<u8>,
    pub version: i64,
    pub stream_id: Uuid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
pub enum ObjectStatus {
    Pending = 1,
    Deleting = 2,
    Committed = 3,
}

/// Cipher suite and block size of an object's segments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionParameters {
    pub cipher_suite: u8,
    pub block_size: u32,
}

impl EncryptionParameters {
    /// Cipher suite in the low byte, block size in the 32 bits above it.
    pub fn encode(&self) -> i64 {
        (i64::from(self.block_size) << 8) | i64::from(self.cipher_suite)
    }

    pub fn decode(value: i64) -> Self {
        Self {
            cipher_suite: (value & 0xFF) as u8,
            block_size: ((value >> 8) & 0xFFFF_FFFF) as u32,
        }
    }
}

/// A row of the `objects` relation.
#[derive(Clone, Debug, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Object {
    pub project_id: Uuid,
    pub bucket_name: String,
    pub encrypted_path: Vec<u8>,
    pub version: i64,
    pub stream_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ObjectStatus,
    pub segment_count: i32,
    pub encrypted_metadata: Option<Vec<u8>>,
    pub total_encrypted_size: i64,
    /// Size shared by every segment but the last, `-1` when not uniform.
    pub fixed_segment_size: i32,
    pub encryption: i64,
}

impl Object {
    pub fn stream(&self) -> ObjectStream {
        ObjectStream {
            project_id: self.project_id,
            bucket_name: self.bucket_name.clone(),
            encrypted_path: self.encrypted_path.clone(),
            version: self.version,
            stream_id: self.stream_id,
        }
    }

    pub fn encryption(&self) -> EncryptionParameters {
        EncryptionParameters::decode(self.encryption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_parameters_pack() {
        let params = EncryptionParameters {
            cipher_suite: 2,
            block_size: 29 * 256,
        };
        assert_eq!(EncryptionParameters::decode(params.encode()), params);
        assert_eq!(EncryptionParameters::default().encode(), 0);
    }
}
