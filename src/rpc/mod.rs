//! RPC collaborator: proxy the key-value surface over a duplex byte stream
//!
//! - `host`: serves a `Backend` to one guest per stream
//! - `guest`: exposes the same surface locally and relays calls to a host,
//!   with `forward` to switch to an in-process backend
//! - `codec`/`protocol`: length-delimited bincode frames

pub mod codec;
pub mod guest;
pub mod host;
pub mod protocol;

pub use guest::{Guest, Session};
pub use protocol::{Request, Response, PROTOCOL_VERSION};
