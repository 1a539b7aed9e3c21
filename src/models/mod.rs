//! Core data models of the metabase.
//!
//! Objects and segments map to the `objects` and `segments` relations. Piece
//! placements are stored through the compact encodings in [`node_alias`] and
//! [`segment`]. [`legacy`] models the pointer records being migrated away from.

pub mod legacy;
pub mod node_alias;
pub mod object;
pub mod segment;
