//! Election engine
//!
//! Each facade runs one election task. It follows whichever process currently
//! leads the location and tries to take the store lock whenever no leader
//! answers. The winner cleans up the rendezvous socket, starts a leader server
//! and flushes its own pending calls before switching to direct dispatch.
//!
//! ```text
//! Connecting ──attached──▶ Following ──link ended──┐
//!     │                                            │
//!     └─no leader─▶ PromotingLock ◀────────────────┘
//!                     │      │
//!               locked│      │acquired
//!          (backoff)  ▼      ▼
//!               Connecting  CleaningArtifact ─▶ StartingServer ─▶ Flushing ─▶ Leading
//! ```
//!
//! The facade status is checked before every step and every await point is
//! raced against the facade's shutdown token, so a close at any moment stops
//! forward progress. Whatever was acquired by then is already in the
//! facade's resource registry.

use crate::common::{Backoff, Result};
use crate::coordinator::flush;
use crate::coordinator::registry;
use crate::coordinator::server::{FatalHook, LeaderServer};
use crate::db::Shared;
use crate::engine::Store;
use crate::rpc::Session;
use std::sync::Arc;

/// Externally visible election progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Connecting,
    Following,
    PromotingLock,
    CleaningArtifact,
    StartingServer,
    Flushing,
    Leading,
    Closed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Connecting => "connecting",
            Phase::Following => "following",
            Phase::PromotingLock => "promoting-lock",
            Phase::CleaningArtifact => "cleaning-artifact",
            Phase::StartingServer => "starting-server",
            Phase::Flushing => "flushing",
            Phase::Leading => "leading",
            Phase::Closed => "closed",
        };
        f.write_str(name)
    }
}

enum State {
    Connecting,
    Following(Session),
    PromotingLock { had_connection: bool },
    CleaningArtifact(Store),
    StartingServer(Store),
    Flushing(Store),
    Leading,
    Closed,
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            State::Connecting => Phase::Connecting,
            State::Following(_) => Phase::Following,
            State::PromotingLock { .. } => Phase::PromotingLock,
            State::CleaningArtifact(_) => Phase::CleaningArtifact,
            State::StartingServer(_) => Phase::StartingServer,
            State::Flushing(_) => Phase::Flushing,
            State::Leading => Phase::Leading,
            State::Closed => Phase::Closed,
        }
    }
}

/// Drive the election for `shared` until it leads, closes or fails.
pub(crate) async fn run(shared: Arc<Shared>) {
    let mut election = Election::new(shared.clone());
    let mut state = State::Connecting;

    loop {
        if !shared.is_open() {
            break;
        }
        shared.set_phase(state.phase());

        state = match state {
            State::Leading => {
                shared.became_leader();
                break;
            }
            State::Closed => break,
            state => {
                let step = tokio::select! {
                    biased;
                    _ = shared.shutdown.cancelled() => break,
                    step = election.step(state) => step,
                };
                match step {
                    Ok(next) => next,
                    Err(e) => {
                        shared.fail(e).await;
                        break;
                    }
                }
            }
        };
    }
    tracing::debug!("Election for {} finished", shared.location.display());
}

struct Election {
    shared: Arc<Shared>,
    backoff: Backoff,
}

impl Election {
    fn new(shared: Arc<Shared>) -> Self {
        let backoff = Backoff::new(
            shared.config.lock_retry_delay(),
            shared.config.contention_backoff_initial(),
        );
        Self { shared, backoff }
    }

    async fn step(&mut self, state: State) -> Result<State> {
        match state {
            State::Connecting => Ok(self.connect().await),
            State::Following(session) => Ok(Self::follow(session).await),
            State::PromotingLock { had_connection } => self.promote(had_connection).await,
            State::CleaningArtifact(store) => {
                self.shared.rendezvous.remove_stale().await?;
                Ok(State::StartingServer(store))
            }
            State::StartingServer(store) => self.start_server(store).await,
            State::Flushing(store) => {
                flush::drain(&self.shared.guest, &self.shared.rendezvous, Arc::new(store)).await?;
                Ok(State::Leading)
            }
            State::Leading | State::Closed => Ok(state),
        }
    }

    async fn connect(&mut self) -> State {
        let rendezvous = &self.shared.rendezvous;
        let stream = match rendezvous.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!("No leader at {}: {}", rendezvous, e);
                return State::PromotingLock {
                    had_connection: false,
                };
            }
        };

        match self.shared.guest.attach(stream).await {
            Ok(session) => {
                self.backoff.reset();
                tracing::info!("Following leader at {}", rendezvous);
                State::Following(session)
            }
            Err(e) => {
                tracing::debug!("Leader at {} did not complete handshake: {}", rendezvous, e);
                State::PromotingLock {
                    had_connection: false,
                }
            }
        }
    }

    async fn follow(mut session: Session) -> State {
        match session.finished().await {
            Ok(()) => tracing::info!("Leader went away"),
            Err(e) => tracing::info!("Lost connection to leader: {}", e),
        }
        State::PromotingLock {
            had_connection: true,
        }
    }

    async fn promote(&mut self, had_connection: bool) -> Result<State> {
        self.shared.record_lock_attempt();
        let store = match Store::open(&self.shared.location, &self.shared.config.engine).await {
            Ok(store) => store,
            Err(e) if e.is_lock_contention() => {
                let delay = self.backoff.next_delay(had_connection);
                tracing::debug!("Store is locked, retrying in {:?}", delay);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                return Ok(State::Connecting);
            }
            Err(e) => return Err(e),
        };

        tracing::info!("Acquired store lock for {}", self.shared.location.display());
        if let Err(refused) = self.shared.attach(Box::new(store.clone())) {
            registry::release(refused).await;
            return Ok(State::Closed);
        }
        Ok(State::CleaningArtifact(store))
    }

    async fn start_server(&mut self, store: Store) -> Result<State> {
        let weak = Arc::downgrade(&self.shared);
        let on_fatal: FatalHook = Box::new(move |e| {
            if let Some(shared) = weak.upgrade() {
                tokio::spawn(async move { shared.fail(e).await });
            }
        });

        let server = LeaderServer::start(&self.shared.rendezvous, Arc::new(store.clone()), on_fatal)?;
        if let Err(refused) = self.shared.attach(Box::new(server)) {
            registry::release(refused).await;
            return Ok(State::Closed);
        }
        Ok(State::Flushing(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_phases() {
        assert_eq!(State::Connecting.phase(), Phase::Connecting);
        assert_eq!(
            State::PromotingLock {
                had_connection: true
            }
            .phase(),
            Phase::PromotingLock
        );
        assert_eq!(State::Leading.phase(), Phase::Leading);
        assert_eq!(Phase::PromotingLock.to_string(), "promoting-lock");
    }
}
