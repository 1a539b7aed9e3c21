//! Buffered multi-row inserts into the `objects` and `segments` relations.
//!
//! Rows accumulate per relation. A batch flushes when it reaches its threshold
//! and once more on [`BatchWriter::finish`], each time as a single
//! `INSERT ... VALUES (...), (...)` statement sized to the buffered rows.

use chrono::{DateTime, Utc};
use sqlx::{SqlitePool, query::Query, sqlite::Sqlite, sqlite::SqliteArguments};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{
    errors::MetabaseResult,
    models::{object::ObjectStatus, segment::SegmentPosition},
};

/// Highest bind parameter number SQLite accepts in one statement.
pub const SQLITE_MAX_PARAMETERS: usize = 32_766;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatementError {
    #[error("insert into `{0}` needs at least one row")]
    NoRows(String),
    #[error("insert into `{0}` needs at least one column")]
    NoColumns(String),
    #[error("{rows} rows of {columns} columns exceed the {limit} parameter limit")]
    TooManyParameters {
        rows: usize,
        columns: usize,
        limit: usize,
    },
}

/// Builds the text of a parameterized multi-row insert.
///
/// Placeholders are numbered `$1..$n` row by row; values are always bound,
/// never spliced into the text.
#[derive(Clone, Debug)]
pub struct InsertStatement<'a> {
    relation: &'a str,
    columns: &'a [&'a str],
    rows: usize,
}

impl<'a> InsertStatement<'a> {
    pub fn new(relation: &'a str, columns: &'a [&'a str]) -> Self {
        Self {
            relation,
            columns,
            rows: 1,
        }
    }

    pub fn rows(mut self, rows: usize) -> Self {
        self.rows = rows;
        self
    }

    pub fn parameter_count(&self) -> usize {
        self.rows * self.columns.len()
    }

    pub fn build(&self) -> Result<String, StatementError> {
        if self.columns.is_empty() {
            return Err(StatementError::NoColumns(self.relation.to_string()));
        }
        if self.rows == 0 {
            return Err(StatementError::NoRows(self.relation.to_string()));
        }
        if self.parameter_count() > SQLITE_MAX_PARAMETERS {
            return Err(StatementError::TooManyParameters {
                rows: self.rows,
                columns: self.columns.len(),
                limit: SQLITE_MAX_PARAMETERS,
            });
        }

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ",
            self.relation,
            self.columns.join(", ")
        );
        let width = self.columns.len();
        for row in 0..self.rows {
            if row > 0 {
                sql.push_str(", ");
            }
            let placeholders = (1..=width)
                .map(|column| format!("${}", row * width + column))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push('(');
            sql.push_str(&placeholders);
            sql.push(')');
        }
        Ok(sql)
    }
}

/// A row that knows its relation, its column order and how to bind itself.
pub trait InsertRow: Send {
    const RELATION: &'static str;
    const COLUMNS: &'static [&'static str];

    /// Binds the row's values in `COLUMNS` order.
    fn bind_into<'q>(
        self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>>;
}

/// Row for the `objects` relation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRow {
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
    pub fixed_segment_size: i32,
    pub encryption: i64,
}

impl InsertRow for ObjectRow {
    const RELATION: &'static str = "objects";
    const COLUMNS: &'static [&'static str] = &[
        "project_id",
        "bucket_name",
        "encrypted_path",
        "version",
        "stream_id",
        "created_at",
        "expires_at",
        "status",
        "segment_count",
        "encrypted_metadata",
        "total_encrypted_size",
        "fixed_segment_size",
        "encryption",
    ];

    fn bind_into<'q>(
        self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        query
            .bind(self.project_id)
            .bind(self.bucket_name)
            .bind(self.encrypted_path)
            .bind(self.version)
            .bind(self.stream_id)
            .bind(self.created_at)
            .bind(self.expires_at)
            .bind(self.status)
            .bind(self.segment_count)
            .bind(self.encrypted_metadata)
            .bind(self.total_encrypted_size)
            .bind(self.fixed_segment_size)
            .bind(self.encryption)
    }
}

/// Row for the `segments` relation, pieces already in their stored encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentRow {
    pub stream_id: Uuid,
    pub position: SegmentPosition,
    pub root_piece_id: Vec<u8>,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub encrypted_size: i64,
    pub inline_data: Option<Vec<u8>>,
    pub piece_numbers: Vec<u8>,
    pub node_aliases: Vec<u8>,
}

impl InsertRow for SegmentRow {
    const RELATION: &'static str = "segments";
    const COLUMNS: &'static [&'static str] = &[
        "stream_id",
        "position",
        "root_piece_id",
        "encrypted_key_nonce",
        "encrypted_key",
        "encrypted_size",
        "inline_data",
        "piece_numbers",
        "node_aliases",
    ];

    fn bind_into<'q>(
        self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        query
            .bind(self.stream_id)
            .bind(self.position.to_db())
            .bind(self.root_piece_id)
            .bind(self.encrypted_key_nonce)
            .bind(self.encrypted_key)
            .bind(self.encrypted_size)
            .bind(self.inline_data)
            .bind(self.piece_numbers)
            .bind(self.node_aliases)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub flushes: u64,
    pub rows: u64,
    pub last_flush_rows: usize,
}

/// Rows of one relation waiting to be inserted.
pub struct Batch<R> {
    rows: Vec<R>,
    threshold: usize,
    stats: BatchStats,
}

impl<R: InsertRow> Batch<R> {
    /// `threshold` is clamped to what fits in one statement.
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.clamp(1, SQLITE_MAX_PARAMETERS / R::COLUMNS.len());
        Self {
            rows: Vec::with_capacity(threshold),
            threshold,
            stats: BatchStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.threshold
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    pub fn push(&mut self, row: R) {
        self.rows.push(row);
    }

    /// Inserts every buffered row in one statement.
    ///
    /// The buffer is cleared before executing, so a failed flush loses exactly
    /// the rows it carried.
    pub async fn flush(&mut self, db: &SqlitePool) -> MetabaseResult<()> {
        if self.rows.is_empty() {
            return Ok(());
        }

        let rows = std::mem::replace(&mut self.rows, Vec::with_capacity(self.threshold));
        let count = rows.len();
        let sql = InsertStatement::new(R::RELATION, R::COLUMNS)
            .rows(count)
            .build()?;

        let mut query = sqlx::query(&sql);
        for row in rows {
            query = row.bind_into(query);
        }
        query.execute(db).await?;

        self.stats.flushes += 1;
        self.stats.rows += count as u64;
        self.stats.last_flush_rows = count;
        debug!("flushed {} rows into {}", count, R::RELATION);
        Ok(())
    }
}

/// Independent object and segment batches over one pool.
///
/// Flushing one relation never flushes the other, so an object row can be
/// durable before its segments or the other way round.
pub struct BatchWriter {
    db: Arc<SqlitePool>,
    objects: Batch<ObjectRow>,
    segments: Batch<SegmentRow>,
}

impl BatchWriter {
    pub fn new(db: Arc<SqlitePool>, object_threshold: usize, segment_threshold: usize) -> Self {
        Self {
            db,
            objects: Batch::new(object_threshold),
            segments: Batch::new(segment_threshold),
        }
    }

    pub async fn push_object(&mut self, row: ObjectRow) -> MetabaseResult<()> {
        self.objects.push(row);
        if self.objects.is_full() {
            self.objects.flush(&self.db).await?;
        }
        Ok(())
    }

    pub async fn push_segment(&mut self, row: SegmentRow) -> MetabaseResult<()> {
        self.segments.push(row);
        if self.segments.is_full() {
            self.segments.flush(&self.db).await?;
        }
        Ok(())
    }

    /// Flushes whatever is left in either buffer.
    pub async fn finish(&mut self) -> MetabaseResult<()> {
        self.objects.flush(&self.db).await?;
        self.segments.flush(&self.db).await?;
        Ok(())
    }

    pub fn object_stats(&self) -> BatchStats {
        self.objects.stats()
    }

    pub fn segment_stats(&self) -> BatchStats {
        self.segments.stats()
    }

    pub fn pending_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn pending_segments(&self) -> usize {
        self.segments.len()
    }
}
