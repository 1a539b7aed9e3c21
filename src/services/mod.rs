//! Services over the metabase relations and the legacy pointer store.
//!
//! - [`metabase`]: segment piece compare-and-swap and read-back
//! - [`node_aliases`]: durable node id ↔ alias table
//! - [`pointerdb`]: legacy pointer listing and lookups
//! - [`batch_writer`]: buffered multi-row inserts
//! - [`migrator`]: legacy pointer to object/segment migration

pub mod batch_writer;
pub mod metabase;
pub mod migrator;
pub mod node_aliases;
pub mod pointerdb;
