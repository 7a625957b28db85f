//! Request/response and notification transport over channel ends.
//!
//! A [`NanoPort`] wraps one end of a [`ChannelEnd`](crate::channel::ChannelEnd)
//! and speaks a small envelope protocol:
//!
//! ```text
//! {notify: M}
//! {tag, request: M}
//! {tag, response: R} | {tag, error: ErrorInfo}
//! ```
//!
//! The [`Registry`] accepts named connections and hands each one to the
//! [`NanoService`] registered under that name.

mod envelope;
mod port;
mod registry;

pub use port::{NanoPort, NoHandler, Payload, PortHandler, PortId};
pub use registry::{NanoService, Registry};
