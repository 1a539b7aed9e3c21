//! Access to the legacy pointer store.
//!
//! [`PointerDb`] is the read surface migration needs: ordered prefix listing
//! and point lookups. [`SqlitePointerDb`] serves it from a `pathdata` table;
//! [`PointerReader`] walks a prefix page by page.

use sqlx::{
    QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions},
};
use std::{future::Future, str::FromStr, sync::Arc};
use tracing::debug;

use crate::errors::MetabaseResult;

#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct ListItem {
    #[sqlx(rename = "fullpath")]
    pub key: Vec<u8>,
    #[sqlx(rename = "metadata")]
    pub value: Vec<u8>,
}

pub trait PointerDb: Send + Sync {
    /// Up to `limit` items under `prefix`, ascending by key, strictly after
    /// `start_after` when given.
    fn list(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> impl Future<Output = MetabaseResult<Vec<ListItem>>> + Send;

    fn get(&self, key: &[u8]) -> impl Future<Output = MetabaseResult<Option<Vec<u8>>>> + Send;
}

/// Legacy records stored as `pathdata(fullpath, metadata)`.
#[derive(Clone)]
pub struct SqlitePointerDb {
    pub db: Arc<SqlitePool>,
}

impl SqlitePointerDb {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn connect(url: &str) -> MetabaseResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }

    pub async fn ensure_schema(&self) -> MetabaseResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pathdata (
                fullpath BLOB PRIMARY KEY,
                metadata BLOB NOT NULL
            )",
        )
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) -> MetabaseResult<()> {
        sqlx::query(
            "INSERT INTO pathdata (fullpath, metadata) VALUES (?, ?)
             ON CONFLICT (fullpath) DO UPDATE SET metadata = excluded.metadata",
        )
        .bind(key)
        .bind(value)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &[u8]) -> MetabaseResult<bool> {
        let result = sqlx::query("DELETE FROM pathdata WHERE fullpath = ?")
            .bind(key)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

impl PointerDb for SqlitePointerDb {
    async fn list(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> MetabaseResult<Vec<ListItem>> {
        // BLOBs compare bytewise, so a prefix is the range [prefix, prefix_limit).
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT fullpath, metadata FROM pathdata WHERE fullpath >= ",
        );
        builder.push_bind(prefix.to_vec());

        if let Some(upper) = prefix_limit(prefix) {
            builder.push(" AND fullpath < ");
            builder.push_bind(upper);
        }

        if let Some(after) = start_after {
            builder.push(" AND fullpath > ");
            builder.push_bind(after.to_vec());
        }

        builder.push(" ORDER BY fullpath ASC LIMIT ");
        builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let items: Vec<ListItem> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(items)
    }

    async fn get(&self, key: &[u8]) -> MetabaseResult<Option<Vec<u8>>> {
        let value = sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT metadata FROM pathdata WHERE fullpath = ?",
        )
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;
        Ok(value)
    }
}

/// Smallest key greater than every key starting with `prefix`, if any.
fn prefix_limit(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut limit = prefix.to_vec();
    while let Some(last) = limit.pop() {
        if last < u8::MAX {
            limit.push(last + 1);
            return Some(limit);
        }
    }
    None
}

/// Pages through every item under a prefix, resuming after the last key seen.
pub struct PointerReader<'a, P> {
    db: &'a P,
    prefix: Vec<u8>,
    page_size: usize,
    last_key: Option<Vec<u8>>,
    done: bool,
}

impl<'a, P: PointerDb> PointerReader<'a, P> {
    pub fn new(db: &'a P, prefix: Vec<u8>, page_size: usize) -> Self {
        Self {
            db,
            prefix,
            page_size: page_size.max(1),
            last_key: None,
            done: false,
        }
    }

    /// Resume strictly after `key`.
    pub fn start_after(mut self, key: Vec<u8>) -> Self {
        self.last_key = Some(key);
        self
    }

    pub fn last_key(&self) -> Option<&[u8]> {
        self.last_key.as_deref()
    }

    /// Next page of items, `None` once the prefix is exhausted.
    pub async fn next_page(&mut self) -> MetabaseResult<Option<Vec<ListItem>>> {
        if self.done {
            return Ok(None);
        }

        let items = self
            .db
            .list(&self.prefix, self.last_key.as_deref(), self.page_size)
            .await?;

        if items.len() < self.page_size {
            self.done = true;
        }
        match items.last() {
            Some(last) => self.last_key = Some(last.key.clone()),
            None => return Ok(None),
        }

        debug!("read page of {} legacy pointers", items.len());
        Ok(Some(items))
    }
}
