//! Common utilities and types shared across sharekv

pub mod config;
pub mod error;
pub mod utils;

pub use config::{EngineConfig, ShareConfig};
pub use error::{Error, Result};
pub use utils::{jittered, Backoff};
