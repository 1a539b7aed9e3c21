//! Metabase: per-object segment metadata for a distributed object store.
//!
//! Two concerns live here. Segment piece lists are updated with an optimistic
//! compare-and-swap so repair, audit and garbage collection can race safely.
//! Legacy pointer records are migrated into the object/segment relations with
//! batched multi-row inserts.

pub mod errors;
pub mod models;
pub mod services;

pub use errors::{CodecError, MetabaseError, MetabaseResult};
pub use models::{
    node_alias::{NodeAlias, NodeAliases},
    object::{Object, ObjectStatus, ObjectStream},
    segment::{NodeId, Piece, Pieces, Segment, SegmentPosition},
};
pub use services::{
    metabase::{Metabase, UpdateSegmentPieces},
    migrator::{MigrationError, MigrationReport, Migrator, MigratorConfig},
    node_aliases::{AliasResolver, NodeAliasTable},
    pointerdb::{PointerDb, PointerReader, SqlitePointerDb},
};
