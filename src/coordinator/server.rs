//! Leader server
//!
//! Once a process wins the store lock it listens on the rendezvous socket and
//! hosts its store over every follower connection. The connection set lives
//! inside the accept loop and only that loop touches it.

use crate::common::{Error, Result};
use crate::coordinator::registry::Resource;
use crate::coordinator::rendezvous::Rendezvous;
use crate::engine::Backend;
use crate::rpc::host;
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Called once if the listener fails after binding
pub type FatalHook = Box<dyn FnOnce(Error) + Send>;

pub struct LeaderServer {
    path: PathBuf,
    shutdown: CancellationToken,
    accept_loop: JoinHandle<()>,
    active: Arc<AtomicUsize>,
}

impl LeaderServer {
    /// Bind the rendezvous socket and start accepting followers.
    ///
    /// Bind errors are returned. Accept errors later on are handed to
    /// `on_fatal` and stop the server.
    pub fn start(
        rendezvous: &Rendezvous,
        backend: Arc<dyn Backend>,
        on_fatal: FatalHook,
    ) -> Result<Self> {
        let path = rendezvous.path().to_path_buf();
        let listener = UnixListener::bind(&path).map_err(|source| Error::Bind {
            path: path.clone(),
            source,
        })?;
        tracing::info!("Leader listening on {}", path.display());

        let shutdown = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            backend,
            shutdown.clone(),
            active.clone(),
            on_fatal,
        ));

        Ok(Self {
            path,
            shutdown,
            accept_loop,
            active,
        })
    }

    /// Number of followers currently connected.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Drop every connection, stop listening and remove the socket file.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.accept_loop.await?;

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!("Leader stopped listening on {}", self.path.display());
        Ok(())
    }
}

impl Resource for LeaderServer {
    fn name(&self) -> &'static str {
        "leader server"
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(self.stop())
    }
}

async fn accept_loop(
    listener: UnixListener,
    backend: Arc<dyn Backend>,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
    on_fatal: FatalHook,
) {
    let mut connections = JoinSet::new();

    let failure = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break None,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    active.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!("Follower connected ({} active)", active.load(Ordering::SeqCst));
                    connections.spawn(host::serve(stream, backend.clone()));
                }
                Err(e) => break Some(e),
            },
            Some(done) = connections.join_next(), if !connections.is_empty() => {
                active.fetch_sub(1, Ordering::SeqCst);
                match done {
                    Ok(Ok(())) => tracing::debug!("Follower disconnected"),
                    Ok(Err(e)) => tracing::debug!("Follower connection closed: {}", e),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => tracing::warn!("Follower connection task failed: {}", e),
                }
            }
        }
    };

    connections.abort_all();
    while connections.join_next().await.is_some() {}
    active.store(0, Ordering::SeqCst);
    drop(listener);

    if let Some(e) = failure {
        tracing::error!("Leader server stopped accepting: {}", e);
        on_fatal(e.into());
    }
}
