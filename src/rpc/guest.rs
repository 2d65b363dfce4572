//! Guest role: the key-value surface, proxied to a host
//!
//! Every call gets an id and stays pending until a host acknowledges it.
//! Attaching a new stream re-sends all pending calls in id order, so calls
//! issued while no host is reachable (or that a dead host never answered)
//! are delivered once a host appears.
//!
//! `forward` switches the route to a backend in this process:
//! - calls already in flight on a live stream finish there;
//! - calls accepted after the switch wait until nothing is pending, then run
//!   directly, so no call overtakes one accepted before it;
//! - if the stream ends while calls are still pending they run directly.

use crate::common::{Error, Result};
use crate::engine::Backend;
use crate::rpc::codec::FrameCodec;
use crate::rpc::protocol::{dispatch, CallFrame, HostFrame, Request, Response};
use futures::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Where new calls go
#[derive(Clone)]
enum Route {
    /// Across the attached stream
    Remote,
    /// Straight into a backend in this process
    Direct(Arc<dyn Backend>),
}

/// Proxying key-value client; cheap to clone
#[derive(Clone)]
pub struct Guest {
    shared: Arc<GuestShared>,
}

struct GuestShared {
    state: Mutex<GuestState>,
    flushed: watch::Sender<bool>,
    handshake_timeout: Duration,
}

struct GuestState {
    next_id: u64,
    pending: BTreeMap<u64, Pending>,
    route: Route,
    link: Option<Link>,
    generation: u64,
    closed: bool,
}

struct Pending {
    request: Request,
    reply: oneshot::Sender<Result<Response>>,
}

struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<CallFrame>,
}

/// An attached stream, alive until the host hangs up
pub struct Session {
    shared: Arc<GuestShared>,
    generation: u64,
    task: Option<JoinHandle<Result<()>>>,
}

type HostFrames<S> = FramedRead<ReadHalf<S>, FrameCodec<HostFrame>>;
type CallSink<S> = FramedWrite<WriteHalf<S>, FrameCodec<CallFrame>>;

impl Guest {
    pub fn new(handshake_timeout: Duration) -> Self {
        let (flushed, _) = watch::channel(true);
        Self {
            shared: Arc::new(GuestShared {
                state: Mutex::new(GuestState {
                    next_id: 0,
                    pending: BTreeMap::new(),
                    route: Route::Remote,
                    link: None,
                    generation: 0,
                    closed: false,
                }),
                flushed,
                handshake_timeout,
            }),
        }
    }

    /// Issue one call and wait for its response.
    pub async fn call(&self, request: Request) -> Result<Response> {
        let mut request = Some(request);
        loop {
            let reply = {
                let mut state = self.shared.state.lock().unwrap();
                if state.closed {
                    return Err(Error::Closed);
                }
                match state.route.clone() {
                    Route::Direct(backend) if state.pending.is_empty() => {
                        drop(state);
                        let request = request.take().ok_or(Error::Internal("call lost".into()))?;
                        return dispatch(backend.as_ref(), request);
                    }
                    // Calls accepted before the switch are still in flight
                    Route::Direct(_) => None,
                    Route::Remote => {
                        let request = request.take().ok_or(Error::Internal("call lost".into()))?;
                        Some(self.shared.enqueue(&mut state, request))
                    }
                }
            };

            match reply {
                Some(rx) => return rx.await.map_err(|_| Error::Closed)?,
                None => self.wait_flushed().await,
            }
        }
    }

    /// Attach a stream to a host and start relaying calls over it.
    ///
    /// Fails unless the host greets us with a compatible hello within the
    /// handshake timeout. On success every pending call is re-sent.
    pub async fn attach<S>(&self, stream: S) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut frames: HostFrames<S> = FramedRead::new(reader, FrameCodec::new());
        let sink: CallSink<S> = FramedWrite::new(writer, FrameCodec::new());

        let hello = tokio::time::timeout(self.shared.handshake_timeout, frames.next())
            .await
            .map_err(|_| Error::Timeout("waiting for host hello".into()))?;
        match hello {
            Some(Ok(HostFrame::Hello)) => {}
            Some(Ok(HostFrame::Reply { id, .. })) => {
                return Err(Error::Protocol(format!(
                    "expected hello, got reply #{}",
                    id
                )))
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(Error::ConnectionFailed(
                    "stream ended before hello".into(),
                ))
            }
        }

        let (outbound, rx) = mpsc::unbounded_channel();
        let generation = {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return Err(Error::Closed);
            }
            state.generation += 1;
            let generation = state.generation;
            for (&id, pending) in state.pending.iter() {
                let _ = outbound.send(CallFrame {
                    id,
                    request: pending.request.clone(),
                });
            }
            if !state.pending.is_empty() {
                tracing::debug!("Replaying {} pending calls", state.pending.len());
            }
            state.link = Some(Link {
                generation,
                outbound,
            });
            generation
        };

        let task = tokio::spawn(run_link(self.shared.clone(), generation, frames, sink, rx));
        Ok(Session {
            shared: self.shared.clone(),
            generation,
            task: Some(task),
        })
    }

    /// Send future calls straight to `backend` instead of across a stream.
    pub fn forward(&self, backend: Arc<dyn Backend>) {
        let mut state = self.shared.state.lock().unwrap();
        state.route = Route::Direct(backend);
        if state.link.is_none() {
            self.shared.run_pending_directly(&mut state);
        }
    }

    pub fn is_forwarded(&self) -> bool {
        matches!(self.shared.state.lock().unwrap().route, Route::Direct(_))
    }

    /// No call is waiting for an acknowledgement.
    pub fn is_flushed(&self) -> bool {
        self.shared.state.lock().unwrap().pending.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().unwrap().pending.len()
    }

    /// Flips to `true` whenever the last pending call is acknowledged.
    pub fn flushed_signal(&self) -> watch::Receiver<bool> {
        self.shared.flushed.subscribe()
    }

    pub async fn wait_flushed(&self) {
        let mut flushed = self.flushed_signal();
        let _ = flushed.wait_for(|f| *f).await;
    }

    /// Fail every pending call and refuse new ones.
    pub fn close(&self) {
        let (pending, link) = {
            let mut state = self.shared.state.lock().unwrap();
            state.closed = true;
            (std::mem::take(&mut state.pending), state.link.take())
        };
        drop(link);
        for (_, call) in pending {
            let _ = call.reply.send(Err(Error::Closed));
        }
        self.shared.flushed.send_replace(true);
    }
}

impl GuestShared {
    fn enqueue(
        &self,
        state: &mut GuestState,
        request: Request,
    ) -> oneshot::Receiver<Result<Response>> {
        let id = state.next_id;
        state.next_id += 1;

        if let Some(link) = &state.link {
            // A dead link is fine: the call is re-sent on the next attach
            let _ = link.outbound.send(CallFrame {
                id,
                request: request.clone(),
            });
        }

        let (reply, rx) = oneshot::channel();
        state.pending.insert(id, Pending { request, reply });
        self.flushed.send_if_modified(|flushed| std::mem::replace(flushed, false));
        rx
    }

    fn resolve(&self, id: u64, response: Response) {
        let call = {
            let mut state = self.state.lock().unwrap();
            let call = state.pending.remove(&id);
            if state.pending.is_empty() {
                self.flushed.send_if_modified(|flushed| !std::mem::replace(flushed, true));
            }
            call
        };
        // Unknown ids are replies to calls replayed on a newer link
        if let Some(call) = call {
            let _ = call.reply.send(response.into_result());
        }
    }

    fn link_ended(&self, generation: u64) {
        let mut state = self.state.lock().unwrap();
        if state.link.as_ref().map(|l| l.generation) == Some(generation) {
            state.link = None;
        }
        if state.link.is_none() && matches!(state.route, Route::Direct(_)) {
            self.run_pending_directly(&mut state);
        }
    }

    /// Apply whatever is still pending against the direct backend, in id
    /// order, while holding the lock so nothing overtakes them.
    fn run_pending_directly(&self, state: &mut GuestState) {
        let Route::Direct(backend) = state.route.clone() else {
            return;
        };
        let pending = std::mem::take(&mut state.pending);
        if pending.is_empty() {
            return;
        }
        tracing::debug!("Running {} pending calls directly", pending.len());
        for (_, call) in pending {
            let _ = call.reply.send(dispatch(backend.as_ref(), call.request));
        }
        self.flushed.send_if_modified(|flushed| !std::mem::replace(flushed, true));
    }
}

async fn run_link<S>(
    shared: Arc<GuestShared>,
    generation: u64,
    mut frames: HostFrames<S>,
    mut sink: CallSink<S>,
    mut outbound: mpsc::UnboundedReceiver<CallFrame>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut sending = true;
    let outcome = loop {
        tokio::select! {
            frame = outbound.recv(), if sending => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        break Err(e);
                    }
                }
                // Detached: keep reading so in-flight calls still get answers
                None => sending = false,
            },
            incoming = frames.next() => match incoming {
                Some(Ok(HostFrame::Reply { id, response })) => shared.resolve(id, response),
                Some(Ok(HostFrame::Hello)) => {
                    tracing::warn!("Ignoring repeated hello from host");
                }
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            },
        }
    };

    shared.link_ended(generation);
    outcome
}

impl Session {
    /// Wait for the stream to end. Returns why it ended.
    pub async fn finished(&mut self) -> Result<()> {
        match self.task.as_mut() {
            Some(task) => {
                let outcome = task.await;
                self.task = None;
                outcome?
            }
            None => Ok(()),
        }
    }

    /// Stop using this stream for new calls, wait for the calls already sent
    /// on it to be answered, then drop it.
    pub async fn finish(mut self) {
        self.shared.detach(self.generation);
        if let Some(task) = self.task.as_mut() {
            let mut flushed = self.shared.flushed.subscribe();
            let drained = tokio::select! {
                _ = flushed.wait_for(|f| *f) => true,
                _ = &mut *task => false,
            };
            if drained {
                task.abort();
            }
        }
        self.task = None;
        self.shared.link_ended(self.generation);
    }
}

impl GuestShared {
    fn detach(&self, generation: u64) {
        let mut state = self.state.lock().unwrap();
        if state.link.as_ref().map(|l| l.generation) == Some(generation) {
            state.link = None;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemStore;
    use crate::rpc::host;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn put(key: &str, value: &str) -> Request {
        Request::Put {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        }
    }

    fn get(key: &str) -> Request {
        Request::Get {
            key: key.as_bytes().to_vec(),
        }
    }

    /// Attach `guest` to a host serving `store` over an in-memory pipe.
    async fn connect(guest: &Guest, store: Arc<MemStore>) -> (Session, JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let host = tokio::spawn(host::serve(server, store));
        let session = guest.attach(client).await.unwrap();
        (session, host)
    }

    #[tokio::test]
    async fn test_calls_are_proxied() {
        let guest = Guest::new(TIMEOUT);
        let store = Arc::new(MemStore::new());
        let (_session, _host) = connect(&guest, store.clone()).await;

        assert_eq!(guest.call(put("k", "v")).await.unwrap(), Response::Ack);
        assert_eq!(
            guest.call(get("k")).await.unwrap(),
            Response::Value(Some(b"v".to_vec()))
        );
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(guest.is_flushed());
    }

    #[tokio::test]
    async fn test_calls_queue_until_attached() {
        let guest = Guest::new(TIMEOUT);
        let store = Arc::new(MemStore::new());

        let queued = {
            let guest = guest.clone();
            tokio::spawn(async move { guest.call(put("early", "1")).await })
        };
        while guest.pending() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!guest.is_flushed());
        assert!(!*guest.flushed_signal().borrow());

        let (_session, _host) = connect(&guest, store.clone()).await;
        assert_eq!(queued.await.unwrap().unwrap(), Response::Ack);
        assert_eq!(store.get(b"early").unwrap(), Some(b"1".to_vec()));
        assert!(guest.is_flushed());
    }

    #[tokio::test]
    async fn test_forward_runs_queued_calls_directly_once() {
        let guest = Guest::new(TIMEOUT);
        let store = Arc::new(MemStore::new());

        let first = {
            let guest = guest.clone();
            tokio::spawn(async move { guest.call(put("k", "proxy")).await })
        };
        while guest.pending() == 0 {
            tokio::task::yield_now().await;
        }

        guest.forward(store.clone());
        assert_eq!(first.await.unwrap().unwrap(), Response::Ack);
        assert!(guest.is_flushed());

        guest.call(put("k", "direct")).await.unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"direct".to_vec()));
        assert!(guest.is_forwarded());
    }

    #[tokio::test]
    async fn test_closed_guest_rejects_calls() {
        let guest = Guest::new(TIMEOUT);
        let store = Arc::new(MemStore::new());
        let (_session, _host) = connect(&guest, store).await;

        guest.close();
        assert!(matches!(guest.call(get("k")).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_attach_without_hello_fails() {
        let guest = Guest::new(Duration::from_millis(50));
        let (client, _server) = tokio::io::duplex(1024);
        let err = guest.attach(client).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let err = guest.attach(client).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_attach_rejects_other_protocol_version() {
        use tokio::io::AsyncWriteExt;
        use tokio_util::codec::Encoder;

        let mut hello = bytes::BytesMut::new();
        FrameCodec::<HostFrame>::new()
            .encode(HostFrame::Hello, &mut hello)
            .unwrap();
        hello[4] = hello[4].wrapping_add(1);

        let guest = Guest::new(TIMEOUT);
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(&hello).await.unwrap();

        let err = guest.attach(client).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_session_finish_keeps_direct_route() {
        let guest = Guest::new(TIMEOUT);
        let store = Arc::new(MemStore::new());
        let (session, _host) = connect(&guest, store.clone()).await;

        guest.call(put("a", "1")).await.unwrap();
        guest.forward(store.clone());
        session.finish().await;

        guest.call(put("b", "2")).await.unwrap();
        assert_eq!(store.len(), 2);
        assert!(guest.is_flushed());
    }

    #[tokio::test]
    async fn test_session_ends_when_host_goes_away() {
        let guest = Guest::new(TIMEOUT);
        let store = Arc::new(MemStore::new());
        let (mut session, host) = connect(&guest, store).await;

        host.abort();
        let _ = host.await;
        let _ = session.finished().await;

        let pending = {
            let guest = guest.clone();
            tokio::spawn(async move { guest.call(put("later", "x")).await })
        };
        while guest.pending() == 0 {
            tokio::task::yield_now().await;
        }

        // A new host picks up the call that had nowhere to go
        let replacement = Arc::new(MemStore::new());
        let (_session, _host) = connect(&guest, replacement.clone()).await;
        assert_eq!(pending.await.unwrap().unwrap(), Response::Ack);
        assert_eq!(replacement.get(b"later").unwrap(), Some(b"x".to_vec()));
    }
}
