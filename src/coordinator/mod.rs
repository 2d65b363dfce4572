//! Coordination between processes sharing one location
//!
//! - `rendezvous`: the socket address every participant derives
//! - `election`: follow the current leader or take the store lock
//! - `server`: host the store to followers once leading
//! - `flush`: drain pending calls before switching to direct dispatch
//! - `registry`: resources released in reverse order on close

pub mod election;
pub mod flush;
pub mod registry;
pub mod rendezvous;
pub mod server;

pub use election::Phase;
pub use registry::{Resource, ResourceRegistry};
pub use rendezvous::Rendezvous;
pub use server::LeaderServer;
