//! Narrow interfaces to the distributed filesystem layer.
//!
//! The coordinator never talks to the DFS directly; it asks the
//! discovery service which byte streams are already persisted, and it
//! watches datanode liveness to learn about crashed hosts.

pub mod client;
pub mod liveness;
