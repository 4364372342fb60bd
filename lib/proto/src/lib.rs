//! The coordinator ↔ worker wire protocol.
//!
//! Frames are a 4-byte big-endian length followed by a JSON payload; the
//! payload is a self-describing record tagged by its `type` field.

mod cluster;
mod frame;
mod messages;
mod notice;

pub use cluster::*;
pub use frame::*;
pub use messages::*;
pub use notice::*;
