//! src/services/metabase.rs
//!
//! Metabase — object and segment metadata backed by SQLite. Segment pieces
//! are the only field mutated after creation, and only through the
//! compare-and-swap in [`Metabase::update_segment_pieces`].

use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{str::FromStr, sync::Arc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    errors::{CodecError, MetabaseError, MetabaseResult},
    models::{
        node_alias::NodeAliases,
        object::Object,
        segment::{
            Piece, Pieces, Segment, SegmentPosition, decode_piece_numbers, encode_piece_numbers,
            node_ids, validate_pieces,
        },
    },
    services::node_aliases::NodeAliasTable,
};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const OBJECT_COLUMNS: &str = "project_id, bucket_name, encrypted_path, version, stream_id, \
     created_at, expires_at, status, segment_count, encrypted_metadata, \
     total_encrypted_size, fixed_segment_size, encryption";

const SEGMENT_COLUMNS: &str = "stream_id, position, root_piece_id, encrypted_key_nonce, \
     encrypted_key, encrypted_size, inline_data, piece_numbers, node_aliases";

/// Request to swap a segment's pieces from `old_pieces` to `new_pieces`.
#[derive(Clone, Debug, Default)]
pub struct UpdateSegmentPieces {
    pub stream_id: Uuid,
    pub position: SegmentPosition,
    pub old_pieces: Pieces,
    pub new_pieces: Pieces,
}

impl UpdateSegmentPieces {
    /// Request checks that run before touching the database.
    pub fn verify(&self) -> MetabaseResult<()> {
        if self.stream_id.is_nil() {
            return Err(MetabaseError::InvalidRequest("StreamID missing".into()));
        }
        validate_pieces(&self.old_pieces)
            .map_err(|err| MetabaseError::invalid_field("OldPieces", err))?;
        validate_pieces(&self.new_pieces)
            .map_err(|err| MetabaseError::invalid_field("NewPieces", err))?;
        Ok(())
    }
}

/// Raw `segments` row before placements are resolved.
#[derive(FromRow)]
struct SegmentRecord {
    stream_id: Uuid,
    position: i64,
    root_piece_id: Vec<u8>,
    encrypted_key_nonce: Vec<u8>,
    encrypted_key: Vec<u8>,
    encrypted_size: i64,
    inline_data: Option<Vec<u8>>,
    piece_numbers: Vec<u8>,
    node_aliases: Vec<u8>,
}

#[derive(Clone)]
pub struct Metabase {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    aliases: NodeAliasTable,
}

impl Metabase {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        let aliases = NodeAliasTable::new(db.clone());
        Self { db, aliases }
    }

    /// Open (creating if missing) the database at `url`.
    ///
    /// Connections are kept for the pool's lifetime so `sqlite::memory:`
    /// databases survive between calls.
    pub async fn connect(url: &str, max_connections: u32) -> MetabaseResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }

    pub fn aliases(&self) -> &NodeAliasTable {
        &self.aliases
    }

    /// Create the metabase relations if they do not exist yet.
    pub async fn migrate_schema(&self) -> MetabaseResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} schema statements...", statements.len());

        for stmt in statements {
            debug!("Executing schema SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }

        Ok(())
    }

    /// Replace a segment's pieces if they still equal `old_pieces`.
    ///
    /// Both lists are validated before any I/O. The swap is a single
    /// conditional `UPDATE` comparing the stored encodings, so among writers
    /// that observed the same pieces exactly one succeeds; the rest get
    /// [`MetabaseError::ValueChanged`] and must re-read before retrying.
    ///
    /// Aliases for the new pieces' nodes are assigned before the swap and
    /// stay assigned when it fails.
    pub async fn update_segment_pieces(&self, opts: UpdateSegmentPieces) -> MetabaseResult<()> {
        opts.verify()?;

        let new_aliases = self.aliases.ensure_nodes(&node_ids(&opts.new_pieces)).await?;
        let Some(old_aliases) = self
            .aliases
            .lookup_aliases(&node_ids(&opts.old_pieces))
            .await?
        else {
            // A node without an alias cannot be part of any stored segment.
            return Err(self.missing_or_changed(opts.stream_id, opts.position).await);
        };

        let result = sqlx::query(
            "UPDATE segments SET piece_numbers = ?, node_aliases = ?
             WHERE stream_id = ? AND position = ?
               AND piece_numbers = ? AND node_aliases = ?",
        )
        .bind(encode_piece_numbers(&opts.new_pieces))
        .bind(new_aliases.encode())
        .bind(opts.stream_id)
        .bind(opts.position.to_db())
        .bind(encode_piece_numbers(&opts.old_pieces))
        .bind(old_aliases.encode())
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.missing_or_changed(opts.stream_id, opts.position).await);
        }

        debug!(
            "updated pieces of segment {} {} ({} -> {} pieces)",
            opts.stream_id,
            opts.position,
            opts.old_pieces.len(),
            opts.new_pieces.len()
        );
        Ok(())
    }

    /// Tells a vanished segment apart from a lost compare-and-swap.
    async fn missing_or_changed(&self, stream_id: Uuid, position: SegmentPosition) -> MetabaseError {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM segments WHERE stream_id = ? AND position = ?",
        )
        .bind(stream_id)
        .bind(position.to_db())
        .fetch_optional(&*self.db)
        .await;

        match exists {
            Ok(Some(_)) => MetabaseError::ValueChanged,
            Ok(None) => MetabaseError::SegmentNotFound,
            Err(err) => MetabaseError::Sqlx(err),
        }
    }

    pub async fn get_segment_by_position(
        &self,
        stream_id: Uuid,
        position: SegmentPosition,
    ) -> MetabaseResult<Segment> {
        let record = sqlx::query_as::<_, SegmentRecord>(&format!(
            "SELECT {} FROM segments WHERE stream_id = ? AND position = ?",
            SEGMENT_COLUMNS
        ))
        .bind(stream_id)
        .bind(position.to_db())
        .fetch_optional(&*self.db)
        .await?
        .ok_or(MetabaseError::SegmentNotFound)?;

        self.resolve_segment(record).await
    }

    /// All segments of a stream in position order.
    pub async fn list_segments(&self, stream_id: Uuid) -> MetabaseResult<Vec<Segment>> {
        let records = sqlx::query_as::<_, SegmentRecord>(&format!(
            "SELECT {} FROM segments WHERE stream_id = ? ORDER BY position ASC",
            SEGMENT_COLUMNS
        ))
        .bind(stream_id)
        .fetch_all(&*self.db)
        .await?;

        let mut segments = Vec::with_capacity(records.len());
        for record in records {
            segments.push(self.resolve_segment(record).await?);
        }
        Ok(segments)
    }

    async fn resolve_segment(&self, record: SegmentRecord) -> MetabaseResult<Segment> {
        let numbers = decode_piece_numbers(&record.piece_numbers)?;
        let aliases = NodeAliases::decode(&record.node_aliases)?;
        if numbers.len() != aliases.len() {
            return Err(CodecError::LengthMismatch {
                numbers: numbers.len(),
                aliases: aliases.len(),
            }
            .into());
        }

        let nodes = self.aliases.lookup_nodes(&aliases).await?;
        let pieces = numbers
            .into_iter()
            .zip(nodes)
            .map(|(number, storage_node)| Piece {
                number,
                storage_node,
            })
            .collect();

        Ok(Segment {
            stream_id: record.stream_id,
            position: SegmentPosition::from_db(record.position),
            root_piece_id: record.root_piece_id,
            encrypted_key_nonce: record.encrypted_key_nonce,
            encrypted_key: record.encrypted_key,
            encrypted_size: record.encrypted_size,
            inline_data: record.inline_data,
            pieces,
        })
    }

    /// Highest version of the object at `encrypted_path`.
    pub async fn get_object_latest(
        &self,
        project_id: Uuid,
        bucket_name: &str,
        encrypted_path: &[u8],
    ) -> MetabaseResult<Object> {
        sqlx::query_as::<_, Object>(&format!(
            "SELECT {} FROM objects
             WHERE project_id = ? AND bucket_name = ? AND encrypted_path = ?
             ORDER BY version DESC LIMIT 1",
            OBJECT_COLUMNS
        ))
        .bind(project_id)
        .bind(bucket_name)
        .bind(encrypted_path)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(MetabaseError::ObjectNotFound)
    }

    /// Objects of a bucket ordered by encrypted path, then version.
    pub async fn list_objects(
        &self,
        project_id: Uuid,
        bucket_name: &str,
    ) -> MetabaseResult<Vec<Object>> {
        let objects = sqlx::query_as::<_, Object>(&format!(
            "SELECT {} FROM objects
             WHERE project_id = ? AND bucket_name = ?
             ORDER BY encrypted_path ASC, version ASC",
            OBJECT_COLUMNS
        ))
        .bind(project_id)
        .bind(bucket_name)
        .fetch_all(&*self.db)
        .await?;
        Ok(objects)
    }

    pub async fn object_count(&self) -> MetabaseResult<i64> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM objects")
            .fetch_one(&*self.db)
            .await?)
    }

    pub async fn segment_count(&self) -> MetabaseResult<i64> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM segments")
            .fetch_one(&*self.db)
            .await?)
    }
}
