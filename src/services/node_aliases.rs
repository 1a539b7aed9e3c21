//! Durable assignment of node aliases.
//!
//! Every distinct [`NodeId`] gets one alias from the `node_aliases` table.
//! Aliases never change once assigned, so they are cached in-process after
//! the first lookup in either direction.

use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::debug;

use crate::{
    errors::{CodecError, MetabaseError, MetabaseResult},
    models::{
        node_alias::{NodeAlias, NodeAliases},
        segment::NodeId,
    },
};

/// Resolves storage node ids to aliases, assigning new ones as needed.
pub trait AliasResolver: Send + Sync {
    fn ensure_aliases(
        &self,
        nodes: &[NodeId],
    ) -> impl Future<Output = MetabaseResult<NodeAliases>> + Send;
}

#[derive(Default)]
struct AliasCache {
    by_node: HashMap<NodeId, NodeAlias>,
    by_alias: HashMap<NodeAlias, NodeId>,
}

impl AliasCache {
    fn insert(&mut self, node: NodeId, alias: NodeAlias) {
        self.by_node.insert(node, alias);
        self.by_alias.insert(alias, node);
    }
}

/// SQLite-backed alias table shared by the segment store and migration.
#[derive(Clone)]
pub struct NodeAliasTable {
    db: Arc<SqlitePool>,
    cache: Arc<RwLock<AliasCache>>,
}

impl NodeAliasTable {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self {
            db,
            cache: Arc::new(RwLock::new(AliasCache::default())),
        }
    }

    fn cached_alias(&self, node: &NodeId) -> Option<NodeAlias> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache.by_node.get(node).copied()
    }

    fn cached_node(&self, alias: NodeAlias) -> Option<NodeId> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache.by_alias.get(&alias).copied()
    }

    fn remember(&self, node: NodeId, alias: NodeAlias) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.insert(node, alias);
    }

    async fn fetch_alias(&self, node: &NodeId) -> MetabaseResult<Option<NodeAlias>> {
        let alias = sqlx::query_scalar::<_, i64>(
            "SELECT node_alias FROM node_aliases WHERE node_id = ?",
        )
        .bind(node.as_bytes())
        .fetch_optional(&*self.db)
        .await?;

        match alias {
            Some(value) => {
                let alias = to_alias(value)?;
                self.remember(*node, alias);
                Ok(Some(alias))
            }
            None => Ok(None),
        }
    }

    /// Returns the alias of every node, assigning aliases to unknown nodes.
    pub async fn ensure_nodes(&self, nodes: &[NodeId]) -> MetabaseResult<NodeAliases> {
        let mut aliases = Vec::with_capacity(nodes.len());
        for node in nodes {
            if let Some(alias) = self.cached_alias(node) {
                aliases.push(alias);
                continue;
            }

            sqlx::query("INSERT INTO node_aliases (node_id) VALUES (?) ON CONFLICT (node_id) DO NOTHING")
                .bind(node.as_bytes())
                .execute(&*self.db)
                .await?;

            let alias = self
                .fetch_alias(node)
                .await?
                .ok_or_else(|| MetabaseError::Sqlx(sqlx::Error::RowNotFound))?;
            debug!("node {} has alias {}", node, alias.0);
            aliases.push(alias);
        }
        Ok(NodeAliases(aliases))
    }

    /// Looks up aliases without assigning; `None` if any node has no alias yet.
    pub async fn lookup_aliases(&self, nodes: &[NodeId]) -> MetabaseResult<Option<NodeAliases>> {
        let mut aliases = Vec::with_capacity(nodes.len());
        for node in nodes {
            let alias = match self.cached_alias(node) {
                Some(alias) => alias,
                None => match self.fetch_alias(node).await? {
                    Some(alias) => alias,
                    None => return Ok(None),
                },
            };
            aliases.push(alias);
        }
        Ok(Some(NodeAliases(aliases)))
    }

    /// Maps aliases back to node ids; an unassigned alias is an error.
    pub async fn lookup_nodes(&self, aliases: &NodeAliases) -> MetabaseResult<Vec<NodeId>> {
        let mut nodes = Vec::with_capacity(aliases.len());
        for alias in &aliases.0 {
            if let Some(node) = self.cached_node(*alias) {
                nodes.push(node);
                continue;
            }

            let bytes = sqlx::query_scalar::<_, Vec<u8>>(
                "SELECT node_id FROM node_aliases WHERE node_alias = ?",
            )
            .bind(i64::from(alias.0))
            .fetch_optional(&*self.db)
            .await?
            .ok_or(MetabaseError::UnknownNodeAlias(alias.0))?;

            let node = NodeId::from_bytes(&bytes)?;
            self.remember(node, *alias);
            nodes.push(node);
        }
        Ok(nodes)
    }
}

impl AliasResolver for NodeAliasTable {
    async fn ensure_aliases(&self, nodes: &[NodeId]) -> MetabaseResult<NodeAliases> {
        self.ensure_nodes(nodes).await
    }
}

fn to_alias(value: i64) -> MetabaseResult<NodeAlias> {
    u32::try_from(value)
        .map(NodeAlias)
        .map_err(|_| MetabaseError::Codec(CodecError::Overflow("node alias")))
}
