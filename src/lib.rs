//! # sharekv
//!
//! An embedded key-value store that several processes on one machine can
//! open at the same location at once.
//!
//! The storage engine takes an exclusive lock on its directory, so only one
//! process can hold it. The holder becomes the leader and serves the store
//! over a Unix socket next to the data; every other process connects to it
//! and proxies its calls. When the leader goes away the survivors race for
//! the lock, and the winner drains whatever calls were still in flight
//! before serving anything new.
//!
//! ## Architecture
//!
//! ```text
//!   process A (leader)            process B (follower)
//! ┌────────────────────┐        ┌────────────────────┐
//! │ SharedDb           │        │ SharedDb           │
//! │  guest ─direct─┐   │        │  guest ──proxy──┐  │
//! │                ▼   │  unix  │                 │  │
//! │  LeaderServer ◀────┼────────┼─────────────────┘  │
//! │     │              │ socket │                    │
//! │     ▼              │        │  election: follow  │
//! │  Store (RocksDB)   │        │  or promote        │
//! └────────────────────┘        └────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Run a long-lived leader
//! sharekv --location ./data serve
//!
//! # Any number of short-lived clients share it
//! sharekv --location ./data put greeting hello
//! sharekv --location ./data get greeting
//! sharekv --location ./data scan --prefix gr
//! ```

pub mod common;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod rpc;

// Re-export commonly used types
pub use common::{Error, Result, ShareConfig};
pub use coordinator::Phase;
pub use db::{Cursor, Event, Mode, SharedDb, Status};
pub use engine::{BatchOp, Entry, ScanRange};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
