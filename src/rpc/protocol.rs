//! Wire messages exchanged between a guest and a host
//!
//! A host opens every stream with `HostFrame::Hello`, then answers each
//! `CallFrame` with a `HostFrame::Reply` carrying the same id. The protocol
//! version travels in every frame header, see `codec`.

use crate::common::{Error, Result};
use crate::engine::{Backend, BatchOp, Entry, ScanRange};
use serde::{Deserialize, Serialize};

/// Bumped whenever a frame layout changes.
pub const PROTOCOL_VERSION: u8 = 1;

/// One key-value operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Get { key: Vec<u8> },
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Batch { ops: Vec<BatchOp> },
    Scan { range: ScanRange },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Get { .. } => "get",
            Request::Put { .. } => "put",
            Request::Delete { .. } => "delete",
            Request::Batch { .. } => "batch",
            Request::Scan { .. } => "scan",
        }
    }
}

/// Outcome of one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Value(Option<Vec<u8>>),
    Ack,
    Entries(Vec<Entry>),
    Failed(String),
}

impl Response {
    /// Turn a remote failure back into an error.
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Failed(message) => Err(Error::Remote(message)),
            other => Ok(other),
        }
    }
}

/// Guest → host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallFrame {
    pub id: u64,
    pub request: Request,
}

/// Host → guest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HostFrame {
    Hello,
    Reply { id: u64, response: Response },
}

/// Run one request against a backend.
pub fn dispatch(backend: &dyn Backend, request: Request) -> Result<Response> {
    match request {
        Request::Get { key } => backend.get(&key).map(Response::Value),
        Request::Put { key, value } => backend.put(&key, &value).map(|_| Response::Ack),
        Request::Delete { key } => backend.delete(&key).map(|_| Response::Ack),
        Request::Batch { ops } => backend.batch(&ops).map(|_| Response::Ack),
        Request::Scan { range } => backend.scan(&range).map(Response::Entries),
    }
}
