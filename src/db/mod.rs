//! Shared database facade
//!
//! [`SharedDb`] is what callers hold. Every process that opens the same
//! location gets one, and exactly one of them at a time owns the underlying
//! store. The rest proxy their calls to it over the rendezvous socket. Which
//! one leads changes over time without callers noticing: operations issued
//! across a failover are queued and replayed, and a new leader drains
//! everything still pending before it serves anything new.
//!
//! ```no_run
//! # async fn demo() -> sharekv::Result<()> {
//! let db = sharekv::SharedDb::open("/var/lib/app/db").await?;
//! db.put("greeting", "hello").await?;
//! assert_eq!(db.get("greeting").await?, Some(b"hello".to_vec()));
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

mod cursor;

pub use cursor::Cursor;

use crate::common::{Error, Result, ShareConfig};
use crate::coordinator::election::{self, Phase};
use crate::coordinator::registry::{self, Resource, ResourceRegistry};
use crate::coordinator::rendezvous::Rendezvous;
use crate::engine::{BatchOp, Entry, ScanRange};
use crate::rpc::{Guest, Request, Response};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 64;

/// Lifecycle of a facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Where calls currently go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Sent to the leader over the rendezvous socket, or queued until one answers
    Proxy,
    /// Run against the store this process holds
    Direct,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// This process took over the store and is serving followers
    Leader,
    /// No calls are pending acknowledgement
    Flushed,
    /// The facade failed and has closed itself
    Error(Arc<Error>),
}

/// State shared by a facade, its clones and its background tasks
pub(crate) struct Shared {
    pub(crate) location: PathBuf,
    pub(crate) rendezvous: Rendezvous,
    pub(crate) config: ShareConfig,
    pub(crate) guest: Guest,
    pub(crate) shutdown: CancellationToken,
    status: watch::Sender<Status>,
    phase: watch::Sender<Phase>,
    events: broadcast::Sender<Event>,
    registry: Mutex<ResourceRegistry>,
    failure: Mutex<Option<Arc<Error>>>,
    election: Mutex<Option<JoinHandle<()>>>,
    lock_attempts: AtomicU64,
}

impl Shared {
    fn new(location: PathBuf, config: ShareConfig) -> Self {
        let rendezvous = Rendezvous::for_location(&location, &config.socket_name);
        let guest = Guest::new(config.handshake_timeout());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            location,
            rendezvous,
            config,
            guest,
            shutdown: CancellationToken::new(),
            status: watch::Sender::new(Status::Opening),
            phase: watch::Sender::new(Phase::Connecting),
            events,
            registry: Mutex::new(ResourceRegistry::new()),
            failure: Mutex::new(None),
            election: Mutex::new(None),
            lock_attempts: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.status.borrow() == Status::Open
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        let changed = self.phase.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            *current = phase;
            true
        });
        if changed {
            tracing::debug!("{}: {}", self.location.display(), phase);
        }
    }

    pub(crate) fn record_lock_attempt(&self) {
        self.lock_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Hand a freshly acquired resource to the facade. Refused once teardown
    /// has started.
    pub(crate) fn attach(
        &self,
        resource: Box<dyn Resource>,
    ) -> std::result::Result<(), Box<dyn Resource>> {
        self.registry.lock().unwrap().attach(resource)
    }

    pub(crate) fn became_leader(&self) {
        tracing::info!("Leading {}", self.location.display());
        let _ = self.events.send(Event::Leader);
    }

    /// Close the facade because something it depends on broke.
    ///
    /// A no-op when close has already begun.
    pub(crate) async fn fail(&self, err: Error) {
        if !self.begin_closing() {
            tracing::debug!("Ignoring failure after close began: {}", err);
            return;
        }
        tracing::error!("Shared store at {} failed: {}", self.location.display(), err);

        let err = Arc::new(err);
        *self.failure.lock().unwrap() = Some(err.clone());
        self.shutdown.cancel();
        self.guest.close();
        if let Err(e) = self.teardown().await {
            tracing::warn!("Teardown after failure: {}", e);
        }
        self.finish_closed();
        let _ = self.events.send(Event::Error(err));
    }

    /// Move from open to closing. Only the first caller wins.
    fn begin_closing(&self) -> bool {
        self.status.send_if_modified(|status| match status {
            Status::Opening | Status::Open => {
                *status = Status::Closing;
                true
            }
            Status::Closing | Status::Closed => false,
        })
    }

    async fn teardown(&self) -> Result<()> {
        let resources = self.registry.lock().unwrap().drain();
        registry::close_all(resources).await
    }

    fn finish_closed(&self) {
        self.phase.send_replace(Phase::Closed);
        self.status.send_replace(Status::Closed);
        tracing::info!("Closed shared store at {}", self.location.display());
    }

    fn terminal_error(&self) -> Error {
        match self.failure.lock().unwrap().as_ref() {
            Some(cause) => Error::Failed(cause.clone()),
            None => Error::Closed,
        }
    }
}

/// Handle to a store shared by every process that opens the same location
///
/// Cheap to clone. Clones share one election and one connection.
#[derive(Clone)]
pub struct SharedDb {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SharedDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDb")
            .field("location", &self.shared.location)
            .field("status", &self.status())
            .field("phase", &self.phase())
            .finish()
    }
}

impl SharedDb {
    /// Open `location` with the default configuration.
    pub async fn open(location: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(location, ShareConfig::default()).await
    }

    /// Open `location`, creating the directory if needed.
    ///
    /// Returns as soon as the election has started. Calls made before a
    /// leader is found are queued.
    pub async fn open_with(location: impl AsRef<Path>, config: ShareConfig) -> Result<Self> {
        config.validate()?;
        let location = location.as_ref();
        tokio::fs::create_dir_all(location).await?;
        let location = tokio::fs::canonicalize(location).await?;

        let shared = Arc::new(Shared::new(location, config));
        shared.status.send_replace(Status::Open);
        tracing::info!(
            "Opened shared store at {} (rendezvous {})",
            shared.location.display(),
            shared.rendezvous
        );

        tokio::spawn(relay_flushed(shared.clone()));
        let election = tokio::spawn(election::run(shared.clone()));
        *shared.election.lock().unwrap() = Some(election);

        Ok(Self { shared })
    }

    pub fn location(&self) -> &Path {
        &self.shared.location
    }

    pub fn rendezvous(&self) -> &Rendezvous {
        &self.shared.rendezvous
    }

    pub fn status(&self) -> Status {
        *self.shared.status.borrow()
    }

    pub fn phase(&self) -> Phase {
        *self.shared.phase.borrow()
    }

    /// Follow election progress.
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.shared.phase.subscribe()
    }

    pub fn mode(&self) -> Mode {
        if self.shared.guest.is_forwarded() {
            Mode::Direct
        } else {
            Mode::Proxy
        }
    }

    pub fn is_leader(&self) -> bool {
        self.phase() == Phase::Leading
    }

    /// True when no call is waiting for acknowledgement.
    pub fn is_flushed(&self) -> bool {
        self.shared.guest.is_flushed()
    }

    /// How many times this facade has tried to open the store.
    pub fn lock_attempts(&self) -> u64 {
        self.shared.lock_attempts.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Wait until this process leads.
    ///
    /// Fails if the facade closes first.
    pub async fn wait_for_leader(&self) -> Result<()> {
        let mut phase = self.shared.phase.subscribe();
        let reached = *phase
            .wait_for(|p| matches!(p, Phase::Leading | Phase::Closed))
            .await
            .map_err(|_| Error::Closed)?;
        match reached {
            Phase::Leading => Ok(()),
            _ => Err(self.shared.terminal_error()),
        }
    }

    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let request = Request::Get {
            key: key.as_ref().to_vec(),
        };
        match self.call(request).await? {
            Response::Value(value) => Ok(value),
            other => Err(unexpected("get", &other)),
        }
    }

    pub async fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let request = Request::Put {
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
        };
        self.expect_ack("put", request).await
    }

    pub async fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        let request = Request::Delete {
            key: key.as_ref().to_vec(),
        };
        self.expect_ack("delete", request).await
    }

    /// Apply `ops` atomically.
    pub async fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        self.expect_ack("batch", Request::Batch { ops }).await
    }

    /// Read one range in a single call.
    pub async fn scan(&self, range: ScanRange) -> Result<Vec<Entry>> {
        match self.call(Request::Scan { range }).await? {
            Response::Entries(entries) => Ok(entries),
            other => Err(unexpected("scan", &other)),
        }
    }

    /// Walk `range` in pages of the configured size.
    pub fn iter(&self, range: ScanRange) -> Cursor {
        Cursor::new(self.clone(), range, self.shared.config.page_size)
    }

    /// Stop the election, release the store and the socket, and reject
    /// further calls.
    ///
    /// Safe to call more than once and from several clones; later callers
    /// wait for the first close to finish. The teardown result is reported
    /// only to the caller that started it.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.shared;
        if !shared.begin_closing() {
            let mut status = shared.status.subscribe();
            let _ = status.wait_for(|s| *s == Status::Closed).await;
            return Ok(());
        }
        tracing::info!("Closing shared store at {}", shared.location.display());

        shared.shutdown.cancel();
        let election = shared.election.lock().unwrap().take();
        if let Some(election) = election {
            if let Err(e) = election.await {
                tracing::warn!("Election task ended abnormally: {}", e);
            }
        }

        shared.guest.close();
        let result = shared.teardown().await;
        shared.finish_closed();
        result
    }

    async fn call(&self, request: Request) -> Result<Response> {
        if !self.shared.is_open() {
            return Err(self.shared.terminal_error());
        }
        match self.shared.guest.call(request).await {
            Err(Error::Closed) => Err(self.shared.terminal_error()),
            other => other,
        }
    }

    async fn expect_ack(&self, op: &str, request: Request) -> Result<()> {
        match self.call(request).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(op, &other)),
        }
    }
}

fn unexpected(op: &str, response: &Response) -> Error {
    Error::Protocol(format!("unexpected reply to {}: {:?}", op, response))
}

async fn relay_flushed(shared: Arc<Shared>) {
    let mut flushed = shared.guest.flushed_signal();
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            changed = flushed.changed() => {
                if changed.is_err() {
                    break;
                }
                if *flushed.borrow_and_update() {
                    let _ = shared.events.send(Event::Flushed);
                }
            }
        }
    }
}
