//! Storage engine collaborator
//!
//! - `Backend`: the key-value operation surface every layer speaks
//! - `Store`: RocksDB handle holding the location's exclusive lock
//! - `MemStore`: in-memory backend for tests

pub mod backend;
pub mod store;

pub use backend::{Backend, BatchOp, Entry, MemStore, ScanRange};
pub use store::Store;
