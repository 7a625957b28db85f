//! Data-synchronization core for multi-context applications.
//!
//! Several execution contexts (a background service, UI views, sidebars)
//! share one persistent key-value store. This crate keeps them consistent
//! over message-passing ports. Each module focuses on a concrete
//! responsibility:
//!
//! - [`channel`] is an in-memory ordered duplex pipe of JSON values, the
//!   raw transport every port sits on.
//! - [`nanoservice`] turns a channel end into a [`NanoPort`] with
//!   request/response correlation, notifications, timeouts and remote
//!   error marshaling, and routes named connections to services through a
//!   [`Registry`].
//! - [`kvs`] defines the [`KeyValueStore`](kvs::KeyValueStore) contract,
//!   its wire protocol, the service that owns the persistent store and the
//!   reconnecting client that talks to it.
//! - [`model`] holds the reactive [`EventfulMap`](model::EventfulMap) and
//!   the incrementally maintained [`Index`](model::Index) built over it.
//! - [`cache`] is a read-through/write-behind cache in front of any
//!   key-value store.
//! - [`config`] collects the tunables of every layer.
//!
//! Layering, from the bottom: channel → nanoservice → kvs → cache/model.
//! Change notifications flow back up the same stack asynchronously.

pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod kvs;
pub mod model;
pub mod nanoservice;

pub use error::{Error, ErrorInfo, Result};
pub use nanoservice::{NanoPort, NanoService, PortHandler, Registry};
