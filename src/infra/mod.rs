//! Infrastructure adapters: on-disk job snapshots.

pub mod snapshot;

pub use snapshot::{JobRecord, SnapshotStore};
