use optbridge_core::{BridgeError, ConnectionState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::transport::{EventSink, Transport};

/// How `ensure_open` found the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// It was already open; nothing was sent on the caller's behalf.
    AlreadyOpen,
    /// It was opened (by this caller or a concurrent one) and the on-open
    /// hook has already sent the handshake.
    Opened,
}

struct ConnectionInner {
    transport: Arc<dyn Transport>,
    sink: EventSink,
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    handshake: RwLock<Option<serde_json::Value>>,
}

/// Owns the lifecycle of the single streaming connection.
///
/// At most one connect attempt is outstanding: callers arriving while a
/// connect is in flight wait on that attempt. A closed connection is
/// reopened lazily by the next `ensure_open`.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, sink: EventSink) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        Self {
            inner: Arc::new(ConnectionInner {
                transport,
                sink,
                state,
                generation: AtomicU64::new(0),
                handshake: RwLock::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Generation of the most recent connect attempt.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Set the message sent right after every open (and before dependent
    /// requests on an already-open connection).
    pub async fn set_handshake(&self, handshake: Option<serde_json::Value>) {
        *self.inner.handshake.write().await = handshake;
    }

    pub async fn handshake(&self) -> Option<serde_json::Value> {
        self.inner.handshake.read().await.clone()
    }

    /// Suspend until the connection is open, connecting if needed.
    pub async fn ensure_open(&self) -> Result<Readiness, BridgeError> {
        let mut rx = self.inner.state.subscribe();

        let mut initiate = false;
        let mut already_open = false;
        self.inner.state.send_if_modified(|state| match *state {
            ConnectionState::Closed => {
                *state = ConnectionState::Connecting;
                initiate = true;
                true
            }
            ConnectionState::Open => {
                already_open = true;
                false
            }
            ConnectionState::Connecting => false,
        });

        if already_open {
            return Ok(Readiness::AlreadyOpen);
        }

        if initiate {
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            info!(generation, "Connecting to venue stream");
            // Dropping this future mid-connect must not leave the state stuck
            // in `Connecting`.
            let mut attempt = ConnectAttempt {
                manager: self,
                generation,
                armed: true,
            };
            if let Err(e) = self
                .inner
                .transport
                .connect(generation, self.inner.sink.clone())
                .await
            {
                warn!(generation, error = %e, "Connect attempt failed");
                return Err(e);
            }
            attempt.armed = false;
        } else {
            debug!("Joining in-flight connect attempt");
        }

        let state = *rx
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map_err(|_| BridgeError::ConnectionLost("connection manager dropped".to_string()))?;

        match state {
            ConnectionState::Open => Ok(Readiness::Opened),
            _ => Err(BridgeError::ConnectionLost(
                "connection closed while opening".to_string(),
            )),
        }
    }

    /// Send one message over the open connection.
    pub async fn send(&self, message: &serde_json::Value) -> Result<(), BridgeError> {
        if !self.is_open() {
            return Err(BridgeError::ConnectionLost("not connected".to_string()));
        }
        self.inner.transport.send(message).await
    }

    /// On-open hook: send the handshake, then release every waiter.
    ///
    /// Returns `false` for a stale generation.
    pub(crate) async fn on_open(&self, generation: u64) -> bool {
        if generation != self.generation() {
            debug!(generation, "Ignoring open event from a replaced connection");
            return false;
        }
        if let Some(handshake) = self.handshake().await {
            if let Err(e) = self.inner.transport.send(&handshake).await {
                warn!(generation, error = %e, "Handshake send failed");
            }
        }
        self.inner.state.send_replace(ConnectionState::Open);
        info!(generation, "Venue stream open");
        true
    }

    /// Reset `Connecting` to `Closed` if `generation` is still current.
    fn abandon(&self, generation: u64) {
        if generation != self.generation() {
            return;
        }
        let reset = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Closed;
                true
            } else {
                false
            }
        });
        if reset {
            debug!(generation, "Connect attempt abandoned");
        }
    }

    /// Close hook. Returns `true` if the current connection closed, in which
    /// case pending exchanges must be failed.
    pub(crate) fn on_close(&self, generation: u64, reason: &str) -> bool {
        if generation != self.generation() {
            debug!(generation, "Ignoring close event from a replaced connection");
            return false;
        }
        self.inner.state.send_replace(ConnectionState::Closed);
        warn!(generation, %reason, "Venue stream closed");
        true
    }
}

/// The initiator's claim on an in-flight connect. Waiters joined on the
/// attempt see it close and fail with `ConnectionLost`.
struct ConnectAttempt<'a> {
    manager: &'a ConnectionManager,
    generation: u64,
    armed: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.abandon(self.generation);
        }
    }
}
