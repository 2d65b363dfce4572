//! Host role: serve a backend over one duplex byte stream
//!
//! Requests on a stream are applied strictly in arrival order, one at a time,
//! so a guest observes its own writes in the order it issued them.

use crate::common::Result;
use crate::engine::Backend;
use crate::rpc::codec::FrameCodec;
use crate::rpc::protocol::{dispatch, CallFrame, HostFrame, Response};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Serve `backend` until the guest hangs up.
///
/// Returns `Ok(())` when the stream ends cleanly. Backend failures are sent
/// back to the guest and never end the stream.
pub async fn serve<S>(stream: S, backend: Arc<dyn Backend>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut calls = FramedRead::new(reader, FrameCodec::<CallFrame>::new());
    let mut replies = FramedWrite::new(writer, FrameCodec::<HostFrame>::new());

    replies.send(HostFrame::Hello).await?;

    while let Some(frame) = calls.next().await {
        let CallFrame { id, request } = frame?;
        let op = request.name();
        let response = match dispatch(backend.as_ref(), request) {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("{} #{} failed: {}", op, id, e);
                Response::Failed(e.to_string())
            }
        };
        replies.send(HostFrame::Reply { id, response }).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemStore;
    use crate::rpc::protocol::Request;

    #[tokio::test]
    async fn test_host_says_hello_then_answers_in_order() {
        let store = Arc::new(MemStore::new());
        let (client, server) = tokio::io::duplex(4096);
        let host = tokio::spawn(serve(server, store.clone()));

        let (reader, writer) = tokio::io::split(client);
        let mut frames = FramedRead::new(reader, FrameCodec::<HostFrame>::new());
        let mut calls = FramedWrite::new(writer, FrameCodec::<CallFrame>::new());

        match frames.next().await.unwrap().unwrap() {
            HostFrame::Hello => {}
            other => panic!("expected hello, got {:?}", other),
        }

        calls
            .send(CallFrame {
                id: 1,
                request: Request::Put {
                    key: b"k".to_vec(),
                    value: b"v".to_vec(),
                },
            })
            .await
            .unwrap();
        calls
            .send(CallFrame {
                id: 2,
                request: Request::Get { key: b"k".to_vec() },
            })
            .await
            .unwrap();

        let mut answered = Vec::new();
        for _ in 0..2 {
            match frames.next().await.unwrap().unwrap() {
                HostFrame::Reply { id, response } => answered.push((id, response)),
                other => panic!("expected reply, got {:?}", other),
            }
        }
        assert_eq!(
            answered,
            vec![(1, Response::Ack), (2, Response::Value(Some(b"v".to_vec())))]
        );

        drop(calls);
        drop(frames);
        host.await.unwrap().unwrap();
        assert_eq!(store.len(), 1);
    }
}
