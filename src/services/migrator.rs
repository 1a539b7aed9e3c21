//! src/services/migrator.rs
//!
//! Migrator — moves every object of one (project, bucket) scope from the
//! legacy pointer store into the `objects` and `segments` relations.
//!
//! Each object is rebuilt completely before any of its rows are buffered: the
//! listed last-segment record plus every `s{index}` record fetched by key. An
//! object with a missing segment ("zombie segment") or an unusable record is
//! reported and skipped as a whole; the run continues unless `fail_fast` is set.

use futures::{StreamExt, TryStreamExt, stream};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    errors::MetabaseError,
    models::{
        legacy::{self, LegacyPointer, LegacySegment, SegmentMeta, StreamMeta},
        object::{EncryptionParameters, LATEST_VERSION, ObjectStatus},
        segment::{
            Piece, PiecesError, SegmentPosition, encode_piece_numbers, node_ids, validate_pieces,
        },
    },
    services::{
        batch_writer::{BatchStats, BatchWriter, ObjectRow, SegmentRow},
        node_aliases::AliasResolver,
        pointerdb::{PointerDb, PointerReader},
    },
};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("object `{key}`: unsupported segment count {count}")]
    UnsupportedSegmentCount { key: String, count: i64 },
    #[error("object `{key}`: segment {index} is missing")]
    ZombieSegment { key: String, index: u32 },
    #[error("object `{key}`: cannot decode legacy record: {source}")]
    Decode {
        key: String,
        #[source]
        source: bincode::Error,
    },
    #[error("object `{key}`: segment {index} has invalid piece number {number}")]
    InvalidPieceNumber { key: String, index: u32, number: i32 },
    #[error("object `{key}`: {field} {value} is out of range")]
    InvalidEncryption {
        key: String,
        field: &'static str,
        value: i32,
    },
    #[error("object `{key}`: segment {index}: {source}")]
    InvalidPieces {
        key: String,
        index: u32,
        #[source]
        source: PiecesError,
    },
    #[error(transparent)]
    Storage(#[from] MetabaseError),
}

impl MigrationError {
    /// Errors confined to one object's data; everything else ends the run.
    pub fn is_object_error(&self) -> bool {
        !matches!(self, MigrationError::Storage(_))
    }
}

#[derive(Clone, Debug)]
pub struct MigratorConfig {
    /// Rows per multi-row insert, for both relations.
    pub batch_size: usize,
    /// Legacy keys listed per page.
    pub page_size: usize,
    /// Non-last segment records fetched concurrently per object.
    pub fetch_concurrency: usize,
    /// Abort the run on the first per-object error instead of reporting it.
    pub fail_fast: bool,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            page_size: 1000,
            fetch_concurrency: 8,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct MigrationReport {
    pub objects: u64,
    pub segments: u64,
    pub failures: Vec<MigrationError>,
    pub object_batches: BatchStats,
    pub segment_batches: BatchStats,
}

pub struct Migrator<P, A> {
    pointers: Arc<P>,
    aliases: A,
    writer: BatchWriter,
    project_id: Uuid,
    bucket: String,
    config: MigratorConfig,
}

impl<P: PointerDb, A: AliasResolver> Migrator<P, A> {
    pub fn new(
        pointers: Arc<P>,
        aliases: A,
        db: Arc<SqlitePool>,
        project_id: Uuid,
        bucket: impl Into<String>,
        config: MigratorConfig,
    ) -> Self {
        let writer = BatchWriter::new(db, config.batch_size, config.batch_size);
        Self {
            pointers,
            aliases,
            writer,
            project_id,
            bucket: bucket.into(),
            config,
        }
    }

    /// Migrate every object of the bucket and flush the remaining rows.
    pub async fn migrate_bucket(&mut self) -> Result<MigrationReport, MigrationError> {
        let prefix = legacy::bucket_prefix(self.project_id, &self.bucket);
        let pointers = Arc::clone(&self.pointers);
        let mut reader = PointerReader::new(pointers.as_ref(), prefix.clone(), self.config.page_size);
        let mut report = MigrationReport::default();

        info!(
            "migrating bucket {} of project {}",
            self.bucket, self.project_id
        );

        while let Some(page) = reader.next_page().await? {
            for item in page {
                let Some(encrypted_path) = item.key.strip_prefix(prefix.as_slice()) else {
                    continue;
                };

                match self.migrate_object(&item.key, encrypted_path, &item.value).await {
                    Ok(segments) => {
                        report.objects += 1;
                        report.segments += segments;
                    }
                    Err(err) if err.is_object_error() && !self.config.fail_fast => {
                        warn!("skipping object: {}", err);
                        report.failures.push(err);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        self.writer.finish().await?;
        report.object_batches = self.writer.object_stats();
        report.segment_batches = self.writer.segment_stats();

        info!(
            "migrated {} objects and {} segments, {} objects failed",
            report.objects,
            report.segments,
            report.failures.len()
        );
        Ok(report)
    }

    /// Errors carry `legacy_key`, the listed last-segment key of the object.
    async fn migrate_object(
        &mut self,
        legacy_key: &[u8],
        encrypted_path: &[u8],
        value: &[u8],
    ) -> Result<u64, MigrationError> {
        let key = String::from_utf8_lossy(legacy_key).into_owned();
        let decode_err = |source| MigrationError::Decode {
            key: key.clone(),
            source,
        };

        let pointer = LegacyPointer::decode(value).map_err(decode_err)?;
        let stream_meta = StreamMeta::decode(&pointer.metadata).map_err(decode_err)?;

        let encryption = encryption_parameters(&stream_meta, &key)?;

        let count = stream_meta.number_of_segments;
        let segment_count = match i32::try_from(count) {
            Ok(count) if count > 0 => count,
            _ => return Err(MigrationError::UnsupportedSegmentCount { key, count }),
        };
        let last_index = (segment_count - 1) as u32;

        let leading = self.fetch_leading_segments(encrypted_path, last_index, &key).await?;

        let stream_id = Uuid::new_v4();
        let mut rows = Vec::with_capacity(leading.len() + 1);
        for (index, segment) in (0..).zip(&leading) {
            rows.push(self.segment_row(stream_id, index, segment, None, &key).await?);
        }
        rows.push(
            self.segment_row(
                stream_id,
                last_index,
                &pointer,
                stream_meta.last_segment_meta.as_ref(),
                &key,
            )
            .await?,
        );

        let sizes: Vec<i64> = rows.iter().map(|row| row.encrypted_size).collect();
        let object = ObjectRow {
            project_id: self.project_id,
            bucket_name: self.bucket.clone(),
            encrypted_path: encrypted_path.to_vec(),
            version: LATEST_VERSION,
            stream_id,
            created_at: pointer.creation_date,
            expires_at: pointer.expiration_date,
            status: ObjectStatus::Committed,
            segment_count,
            encrypted_metadata: Some(stream_meta.encrypted_stream_info.clone())
                .filter(|info| !info.is_empty()),
            total_encrypted_size: sizes.iter().sum(),
            fixed_segment_size: fixed_segment_size(&sizes),
            encryption: encryption.encode(),
        };

        self.writer.push_object(object).await?;
        let segments = rows.len() as u64;
        for row in rows {
            self.writer.push_segment(row).await?;
        }

        debug!("buffered object {} with {} segments", key, segments);
        Ok(segments)
    }

    /// Fetch and decode segments `0..last_index` in index order.
    async fn fetch_leading_segments(
        &self,
        encrypted_path: &[u8],
        last_index: u32,
        key: &str,
    ) -> Result<Vec<LegacyPointer>, MigrationError> {
        let pointers = self.pointers.as_ref();
        let project_id = self.project_id;
        let bucket = self.bucket.as_str();

        stream::iter(0..last_index)
            .map(|index| async move {
                let path = legacy::segment_key(
                    project_id,
                    LegacySegment::Index(index),
                    bucket,
                    encrypted_path,
                );
                let value = pointers
                    .get(&path)
                    .await?
                    .ok_or_else(|| MigrationError::ZombieSegment {
                        key: key.to_string(),
                        index,
                    })?;
                LegacyPointer::decode(&value).map_err(|source| MigrationError::Decode {
                    key: key.to_string(),
                    source,
                })
            })
            .buffered(self.config.fetch_concurrency.max(1))
            .try_collect()
            .await
    }

    async fn segment_row(
        &self,
        stream_id: Uuid,
        index: u32,
        pointer: &LegacyPointer,
        key_meta: Option<&SegmentMeta>,
        key: &str,
    ) -> Result<SegmentRow, MigrationError> {
        let (root_piece_id, pieces) = match &pointer.remote {
            Some(remote) => {
                let mut pieces = Vec::with_capacity(remote.remote_pieces.len());
                for piece in &remote.remote_pieces {
                    let number = u16::try_from(piece.piece_num).map_err(|_| {
                        MigrationError::InvalidPieceNumber {
                            key: key.to_string(),
                            index,
                            number: piece.piece_num,
                        }
                    })?;
                    pieces.push(Piece {
                        number,
                        storage_node: piece.node_id,
                    });
                }
                pieces.sort_by_key(|piece| piece.number);
                validate_pieces(&pieces).map_err(|source| MigrationError::InvalidPieces {
                    key: key.to_string(),
                    index,
                    source,
                })?;
                (remote.root_piece_id.clone(), pieces)
            }
            None => (Vec::new(), Vec::new()),
        };

        let aliases = self.aliases.ensure_aliases(&node_ids(&pieces)).await?;
        let (encrypted_key, encrypted_key_nonce) = key_meta
            .map(|meta| (meta.encrypted_key.clone(), meta.key_nonce.clone()))
            .unwrap_or_default();

        Ok(SegmentRow {
            stream_id,
            position: SegmentPosition::new(0, index),
            root_piece_id,
            encrypted_key_nonce,
            encrypted_key,
            encrypted_size: pointer.segment_size,
            inline_data: Some(pointer.inline_segment.clone()).filter(|data| !data.is_empty()),
            piece_numbers: encode_piece_numbers(&pieces),
            node_aliases: aliases.encode(),
        })
    }
}

fn encryption_parameters(
    meta: &StreamMeta,
    key: &str,
) -> Result<EncryptionParameters, MigrationError> {
    let out_of_range = |field, value| MigrationError::InvalidEncryption {
        key: key.to_string(),
        field,
        value,
    };
    let cipher_suite = u8::try_from(meta.encryption_type)
        .map_err(|_| out_of_range("encryption type", meta.encryption_type))?;
    let block_size = u32::try_from(meta.encryption_block_size)
        .map_err(|_| out_of_range("encryption block size", meta.encryption_block_size))?;
    Ok(EncryptionParameters {
        cipher_suite,
        block_size,
    })
}

/// Size shared by all segments but the last (which may be shorter), else -1.
fn fixed_segment_size(sizes: &[i64]) -> i32 {
    let Some((last, leading)) = sizes.split_last() else {
        return -1;
    };
    let fixed = match leading.first() {
        Some(first) => *first,
        None => *last,
    };
    if leading.iter().any(|size| *size != fixed) || *last > fixed {
        return -1;
    }
    i32::try_from(fixed).unwrap_or(-1)
}
