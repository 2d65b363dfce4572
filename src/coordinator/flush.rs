//! Flush barrier
//!
//! A freshly promoted leader may still have calls pending from before it won:
//! queued while no leader answered, or sent to a leader that died before
//! acknowledging them. They are drained through a loopback connection to our
//! own leader server before the guest is switched to direct dispatch, so they
//! land in the store ahead of anything issued afterwards.

use crate::common::{Error, Result};
use crate::coordinator::rendezvous::Rendezvous;
use crate::engine::Backend;
use crate::rpc::Guest;
use std::sync::Arc;

/// Drain pending calls, then forward the guest to `backend`.
///
/// The guest is always forwarded on success. A loopback connection that ends
/// before the pending calls are acknowledged is an error.
pub async fn drain(guest: &Guest, rendezvous: &Rendezvous, backend: Arc<dyn Backend>) -> Result<()> {
    if guest.is_flushed() {
        guest.forward(backend);
        return Ok(());
    }

    tracing::info!(
        "Flushing {} pending calls through {}",
        guest.pending(),
        rendezvous
    );
    let stream = rendezvous.connect().await.map_err(|e| {
        Error::Drain(format!("loopback connect to {} failed: {}", rendezvous, e))
    })?;
    let mut session = guest
        .attach(stream)
        .await
        .map_err(|e| Error::Drain(format!("loopback handshake failed: {}", e)))?;

    let mut flushed = guest.flushed_signal();
    tokio::select! {
        _ = flushed.wait_for(|f| *f) => {}
        outcome = session.finished() => {
            let cause = match outcome {
                Ok(()) => "stream closed by server".to_string(),
                Err(e) => e.to_string(),
            };
            return Err(Error::Drain(format!(
                "loopback connection ended with {} calls unflushed: {}",
                guest.pending(),
                cause
            )));
        }
    }

    guest.forward(backend);
    session.finish().await;
    tracing::debug!("Flush barrier released");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::server::LeaderServer;
    use crate::engine::MemStore;
    use crate::rpc::{Request, Response};
    use std::time::Duration;
    use tempfile::TempDir;

    fn put(key: &str) -> Request {
        Request::Put {
            key: key.as_bytes().to_vec(),
            value: b"queued".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_noop_when_flushed() {
        let dir = TempDir::new().unwrap();
        let rendezvous = Rendezvous::for_location(dir.path(), "sharekv.sock");
        let guest = Guest::new(Duration::from_secs(1));
        let store = Arc::new(MemStore::new());

        // No server is listening: a no-op barrier never touches the socket
        drain(&guest, &rendezvous, store.clone()).await.unwrap();
        assert!(guest.is_forwarded());

        guest.call(put("after")).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_calls_land_before_new_ones() {
        let dir = TempDir::new().unwrap();
        let rendezvous = Rendezvous::for_location(dir.path(), "sharekv.sock");
        let guest = Guest::new(Duration::from_secs(1));
        let store = Arc::new(MemStore::new());

        let queued: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|key| {
                let guest = guest.clone();
                tokio::spawn(async move { guest.call(put(key)).await })
            })
            .collect();
        while guest.pending() < 3 {
            tokio::task::yield_now().await;
        }

        let server = LeaderServer::start(
            &rendezvous,
            store.clone(),
            Box::new(|e| panic!("unexpected fatal error: {}", e)),
        )
        .unwrap();
        drain(&guest, &rendezvous, store.clone()).await.unwrap();

        for call in queued {
            assert_eq!(call.await.unwrap().unwrap(), Response::Ack);
        }
        assert_eq!(store.len(), 3);
        assert!(guest.is_forwarded());
        assert!(guest.is_flushed());

        server.stop().await.unwrap();
        // Direct dispatch no longer needs the socket
        guest.call(put("d")).await.unwrap();
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_nobody_listening_is_a_drain_error() {
        let dir = TempDir::new().unwrap();
        let rendezvous = Rendezvous::for_location(dir.path(), "sharekv.sock");
        let guest = Guest::new(Duration::from_secs(1));

        let _queued = {
            let guest = guest.clone();
            tokio::spawn(async move { guest.call(put("x")).await })
        };
        while guest.pending() == 0 {
            tokio::task::yield_now().await;
        }

        let err = drain(&guest, &rendezvous, Arc::new(MemStore::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Drain(_)));
        assert!(!guest.is_forwarded());
    }
}
