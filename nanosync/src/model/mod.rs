//! Reactive in-memory data model.
//!
//! An [`EventfulMap`] owns a set of keyed values and raises an event for
//! every insert, update, move and delete. An [`Index`] subscribes to those
//! events and maintains a secondary grouping of the map's keys, optionally
//! ordered within each group. After any map call returns, every index
//! attached to the map is consistent with it.

mod eventful_map;
mod index;

pub use eventful_map::{Entries, EventfulMap, MapKey, MapObserver};
pub use index::{Bucket, Index, IndexDefinition};
