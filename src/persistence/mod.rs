//! The `persistence` module stores activity state snapshots.
//!
//! A stopped activity can be captured with `Activity::get_state` and
//! recovered later, possibly in another process. The store keeps those
//! snapshots in `sled`, one tree per key, oldest first.

pub mod snapshot_store;

pub use snapshot_store::{SnapshotStore, StoredSnapshot};

#[cfg(test)]
mod tests;
