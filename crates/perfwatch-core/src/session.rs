//! Connection manager: one authenticated session to a management endpoint.
//!
//! Calls read the current token under a short read lock and run without any
//! lock held. Reconnection takes the write lock for the login round trip, so
//! new calls wait until the fresh session is in place. Every session carries
//! a generation number; a call that finishes after its session was replaced
//! fails with `SessionExpired` so the caller retries against the new one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::Credentials;
use crate::error::PerfError;
use crate::transport::{PerfTransport, SessionToken};

struct Session {
    token: SessionToken,
    generation: u64,
    established_at: DateTime<Utc>,
}

enum SessionState {
    /// Never connected, or disconnected on purpose.
    Disconnected,
    Active(Session),
    /// Lost after an authentication failure or a failed reconnect.
    /// Calls fail with `SessionExpired` until a reconnect succeeds.
    Broken,
}

pub struct ConnectionManager<T: PerfTransport> {
    transport: T,
    credentials: Credentials,
    state: RwLock<SessionState>,
    generation: AtomicU64,
    reconnects: AtomicU64,
}

impl<T: PerfTransport> ConnectionManager<T> {
    pub fn new(transport: T, credentials: Credentials) -> Self {
        Self {
            transport,
            credentials,
            state: RwLock::new(SessionState::Disconnected),
            generation: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Opens a session. Does nothing if one is already active.
    pub fn connect(&self) -> Result<(), PerfError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, SessionState::Active(_)) {
            return Ok(());
        }
        let session = self.login()?;
        info!(
            user = %self.credentials.username,
            generation = session.generation,
            "session established"
        );
        *state = SessionState::Active(session);
        Ok(())
    }

    /// Releases the session. Idempotent, never fails.
    pub fn disconnect(&self) {
        let previous = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, SessionState::Disconnected)
        };
        if let SessionState::Active(session) = previous {
            self.transport.logout(&session.token);
            info!(generation = session.generation, "session closed");
        }
    }

    /// Replaces the session that failed at `stale_generation`.
    ///
    /// If another caller already replaced it, returns without logging in
    /// again. Fails with `NotConnected` after an explicit disconnect.
    pub fn reconnect(&self, stale_generation: u64) -> Result<(), PerfError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            SessionState::Disconnected => return Err(PerfError::NotConnected),
            SessionState::Active(session) if session.generation != stale_generation => {
                debug!(
                    stale_generation,
                    current = session.generation,
                    "session already replaced"
                );
                return Ok(());
            }
            _ => {}
        }

        if let SessionState::Active(old) = std::mem::replace(&mut *state, SessionState::Broken) {
            self.transport.logout(&old.token);
        }

        let session = self.login()?;
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        info!(
            stale_generation,
            generation = session.generation,
            "session re-established"
        );
        *state = SessionState::Active(session);
        Ok(())
    }

    /// Runs a remote call under the current session.
    pub fn execute<R, F>(&self, call: F) -> Result<R, PerfError>
    where
        F: FnOnce(&T, &SessionToken) -> Result<R, PerfError>,
    {
        self.execute_tracked(call).1
    }

    /// Like `execute`, also returning the generation the call ran under
    /// (0 if there was no session).
    pub(crate) fn execute_tracked<R, F>(&self, call: F) -> (u64, Result<R, PerfError>)
    where
        F: FnOnce(&T, &SessionToken) -> Result<R, PerfError>,
    {
        let (token, generation) = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            match &*state {
                SessionState::Active(session) => (session.token.clone(), session.generation),
                SessionState::Disconnected => return (0, Err(PerfError::NotConnected)),
                SessionState::Broken => {
                    return (
                        0,
                        Err(PerfError::SessionExpired("session lost".to_string())),
                    );
                }
            }
        };

        let result = call(&self.transport, &token);

        if let Err(PerfError::Authentication(msg)) = &result {
            warn!(generation, error = %msg, "authentication rejected, invalidating session");
            self.invalidate(generation);
            return (generation, result);
        }

        if self.generation() != generation {
            return (
                generation,
                Err(PerfError::SessionExpired(
                    "session replaced during call".to_string(),
                )),
            );
        }

        (generation, result)
    }

    /// Marks the session at `generation` as broken, if it is still current.
    fn invalidate(&self, generation: u64) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let SessionState::Active(session) = &*state
            && session.generation == generation
        {
            *state = SessionState::Broken;
        }
    }

    fn login(&self) -> Result<Session, PerfError> {
        let token = self.transport.login(&self.credentials)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Session {
            token,
            generation,
            established_at: Utc::now(),
        })
    }

    /// Generation of the active session, or 0 if there is none.
    pub fn generation(&self) -> u64 {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            SessionState::Active(session) => session.generation,
            _ => 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.generation() != 0
    }

    /// When the active session was established.
    pub fn established_at(&self) -> Option<DateTime<Utc>> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            SessionState::Active(session) => Some(session.established_at),
            _ => None,
        }
    }

    /// Number of successful reconnects since creation.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}
