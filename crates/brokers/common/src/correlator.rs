use optbridge_core::InboundMessage;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers & outcomes
// ---------------------------------------------------------------------------

/// Opaque id generated at registration. The venue never sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeId(Uuid);

impl ExchangeId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Whether a match consumes the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The first exclusive match stops the fan-out for that message.
    Exclusive,
    /// The exchange resolves but later exchanges still see the message.
    /// Used for account-wide snapshots that answer every pending request.
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No matching message arrived before the deadline.
    Timeout,
    /// The connection closed, or could not be used, while pending.
    ConnectionLost,
    /// The venue answered with an explicit rejection.
    Rejected,
}

/// A failed exchange, with every message it observed while pending.
#[derive(Debug, Clone)]
pub struct ExchangeFailure {
    pub kind: FailureKind,
    pub transcript: Vec<InboundMessage>,
}

/// A resolved exchange.
#[derive(Debug, Clone)]
pub struct Matched<T> {
    pub value: T,
    /// The message that matched.
    pub raw: InboundMessage,
    pub transcript: Vec<InboundMessage>,
}

pub type Resolution<T> = Result<Matched<T>, ExchangeFailure>;

// ---------------------------------------------------------------------------
// Result slot
// ---------------------------------------------------------------------------

/// Single-assignment cell: the first `resolve` wins, later ones are no-ops.
pub struct ResultSlot<T> {
    sender: StdMutex<Option<oneshot::Sender<Resolution<T>>>>,
}

impl<T> ResultSlot<T> {
    fn new(sender: oneshot::Sender<Resolution<T>>) -> Self {
        Self {
            sender: StdMutex::new(Some(sender)),
        }
    }

    /// Assign the result. Returns `false` if the slot was already assigned.
    pub fn resolve(&self, resolution: Resolution<T>) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                // The caller may have stopped waiting; the slot is still spent.
                let _ = tx.send(resolution);
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

type Predicate = Box<dyn Fn(&InboundMessage) -> bool + Send + Sync>;
type Extractor<T> = Box<dyn Fn(&InboundMessage) -> T + Send + Sync>;

/// How an exchange recognises and reads its answer.
pub struct Matcher<T> {
    pub name: &'static str,
    predicate: Predicate,
    on_match: Extractor<T>,
    reject: Option<Predicate>,
    claim: Claim,
    prune_on_match: bool,
}

impl<T> Matcher<T> {
    pub fn new<P, E>(name: &'static str, predicate: P, on_match: E) -> Self
    where
        P: Fn(&InboundMessage) -> bool + Send + Sync + 'static,
        E: Fn(&InboundMessage) -> T + Send + Sync + 'static,
    {
        Self {
            name,
            predicate: Box::new(predicate),
            on_match: Box::new(on_match),
            reject: None,
            claim: Claim::Exclusive,
            prune_on_match: false,
        }
    }

    /// Let later exchanges see a message this one matched.
    pub fn shared(mut self) -> Self {
        self.claim = Claim::Shared;
        self
    }

    /// Fail the exchange early when the venue sends a rejection.
    pub fn rejecting<P>(mut self, reject: P) -> Self
    where
        P: Fn(&InboundMessage) -> bool + Send + Sync + 'static,
    {
        self.reject = Some(Box::new(reject));
        self
    }

    /// Hand the exchange's observed messages to the transport's prune hook
    /// once it resolves.
    pub fn pruning(mut self) -> Self {
        self.prune_on_match = true;
        self
    }
}

enum Verdict {
    Match,
    Reject,
    Pass,
}

/// Type-erased view of a pending exchange, so one registry holds them all.
trait PendingExchange: Send {
    fn name(&self) -> &'static str;
    fn claim(&self) -> Claim;
    fn prunes(&self) -> bool;
    fn verdict(&self, message: &InboundMessage) -> Verdict;
    fn complete(&self, message: &InboundMessage, transcript: Vec<InboundMessage>) -> bool;
    fn fail(&self, failure: ExchangeFailure) -> bool;
}

struct Pending<T> {
    matcher: Matcher<T>,
    slot: Arc<ResultSlot<T>>,
}

impl<T: Send + 'static> PendingExchange for Pending<T> {
    fn name(&self) -> &'static str {
        self.matcher.name
    }

    fn claim(&self) -> Claim {
        self.matcher.claim
    }

    fn prunes(&self) -> bool {
        self.matcher.prune_on_match
    }

    fn verdict(&self, message: &InboundMessage) -> Verdict {
        if (self.matcher.predicate)(message) {
            Verdict::Match
        } else if self.matcher.reject.as_ref().is_some_and(|r| r(message)) {
            Verdict::Reject
        } else {
            Verdict::Pass
        }
    }

    fn complete(&self, message: &InboundMessage, transcript: Vec<InboundMessage>) -> bool {
        let value = (self.matcher.on_match)(message);
        self.slot.resolve(Ok(Matched {
            value,
            raw: message.clone(),
            transcript,
        }))
    }

    fn fail(&self, failure: ExchangeFailure) -> bool {
        self.slot.resolve(Err(failure))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Entry {
    id: ExchangeId,
    exchange: Box<dyn PendingExchange>,
    transcript: Vec<InboundMessage>,
    timer: Option<AbortHandle>,
}

impl Entry {
    fn record(&mut self, message: &InboundMessage, cap: usize) {
        if cap == 0 {
            return;
        }
        if self.transcript.len() >= cap {
            self.transcript.remove(0);
        }
        self.transcript.push(message.clone());
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Registry {
    /// Pending exchanges in registration order.
    entries: Vec<Entry>,
    transcript_cap: usize,
}

impl Registry {
    fn take(&mut self, id: ExchangeId) -> Option<Entry> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(index))
    }
}

/// What one inbound message did to the registry.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Exchanges resolved (or rejected) by the message, in order.
    pub resolved: Vec<ExchangeId>,
    /// Messages to hand to the transport's prune hook.
    pub prune: Vec<InboundMessage>,
}

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

/// Registry of pending exchanges plus their deadlines.
///
/// Membership changes only under the registry lock; the dispatcher holds it
/// across one message's whole evaluation, so a match being dispatched always
/// lands before a timer can claim the same exchange.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Mutex<Registry>>,
}

impl Correlator {
    /// `transcript_cap` bounds how many observed messages each exchange keeps
    /// for diagnostics.
    pub fn new(transcript_cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                entries: Vec::new(),
                transcript_cap,
            })),
        }
    }

    /// Register an exchange and arm its deadline.
    pub async fn register<T: Send + 'static>(
        &self,
        matcher: Matcher<T>,
        timeout: Duration,
    ) -> ExchangeHandle<T> {
        let id = ExchangeId::new();
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(ResultSlot::new(tx));
        let name = matcher.name;

        let mut registry = self.inner.lock().await;
        let weak = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // Let a dispatcher that is already runnable go first.
            tokio::task::yield_now().await;
            expire(weak, id).await;
        });
        registry.entries.push(Entry {
            id,
            exchange: Box::new(Pending {
                matcher,
                slot: Arc::clone(&slot),
            }),
            transcript: Vec::new(),
            timer: Some(timer.abort_handle()),
        });
        debug!(exchange = name, exchange_id = %id, ?timeout, "Exchange registered");

        ExchangeHandle {
            id,
            deadline,
            slot,
            rx,
        }
    }

    /// Offer one inbound message to every pending exchange in registration
    /// order, stopping at the first exclusive match or rejection.
    pub async fn dispatch(&self, message: &InboundMessage) -> DispatchOutcome {
        let mut registry = self.inner.lock().await;
        let cap = registry.transcript_cap;
        for entry in registry.entries.iter_mut() {
            entry.record(message, cap);
        }

        let mut outcome = DispatchOutcome::default();
        let mut index = 0;
        while index < registry.entries.len() {
            match registry.entries[index].exchange.verdict(message) {
                Verdict::Pass => index += 1,
                Verdict::Match => {
                    let mut entry = registry.entries.remove(index);
                    entry.cancel_timer();
                    let claim = entry.exchange.claim();
                    if entry.exchange.prunes() {
                        outcome.prune.extend(entry.transcript.iter().cloned());
                    }
                    debug!(exchange = entry.exchange.name(), exchange_id = %entry.id, "Exchange matched");
                    entry.exchange.complete(message, entry.transcript);
                    outcome.resolved.push(entry.id);
                    if claim == Claim::Exclusive {
                        break;
                    }
                }
                Verdict::Reject => {
                    let mut entry = registry.entries.remove(index);
                    entry.cancel_timer();
                    warn!(exchange = entry.exchange.name(), exchange_id = %entry.id, "Exchange rejected by venue");
                    entry.exchange.fail(ExchangeFailure {
                        kind: FailureKind::Rejected,
                        transcript: entry.transcript,
                    });
                    outcome.resolved.push(entry.id);
                    break;
                }
            }
        }

        if outcome.resolved.is_empty() {
            debug!(pending = registry.entries.len(), "Inbound message matched no pending exchange");
        }
        outcome
    }

    /// Resolve an exchange directly. Only the first resolution counts.
    pub async fn resolve<T: Send + 'static>(
        &self,
        handle: &ExchangeHandle<T>,
        resolution: Resolution<T>,
    ) -> bool {
        if let Some(mut entry) = self.inner.lock().await.take(handle.id) {
            entry.cancel_timer();
        }
        handle.slot.resolve(resolution)
    }

    /// Fail one pending exchange. Returns `false` if it already resolved.
    pub async fn fail(&self, id: ExchangeId, kind: FailureKind) -> bool {
        let entry = self.inner.lock().await.take(id);
        match entry {
            Some(mut entry) => {
                entry.cancel_timer();
                entry.exchange.fail(ExchangeFailure {
                    kind,
                    transcript: entry.transcript,
                })
            }
            None => false,
        }
    }

    /// Fail every pending exchange, e.g. when the connection drops.
    pub async fn fail_all(&self, kind: FailureKind) -> usize {
        let drained: Vec<Entry> = self.inner.lock().await.entries.drain(..).collect();
        let count = drained.len();
        for mut entry in drained {
            entry.cancel_timer();
            entry.exchange.fail(ExchangeFailure {
                kind,
                transcript: entry.transcript,
            });
        }
        if count > 0 {
            warn!(count, ?kind, "Failed all pending exchanges");
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

async fn expire(registry: Weak<Mutex<Registry>>, id: ExchangeId) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let entry = registry.lock().await.take(id);
    if let Some(entry) = entry {
        warn!(exchange = entry.exchange.name(), exchange_id = %id, "Exchange timed out");
        entry.exchange.fail(ExchangeFailure {
            kind: FailureKind::Timeout,
            transcript: entry.transcript,
        });
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// The caller's side of a registered exchange.
pub struct ExchangeHandle<T> {
    id: ExchangeId,
    deadline: Instant,
    slot: Arc<ResultSlot<T>>,
    rx: oneshot::Receiver<Resolution<T>>,
}

impl<T> ExchangeHandle<T> {
    pub fn id(&self) -> ExchangeId {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.is_resolved()
    }

    /// Suspend until the exchange resolves.
    pub async fn wait(self) -> Resolution<T> {
        match self.rx.await {
            Ok(resolution) => resolution,
            // Only reachable if the registry itself was dropped.
            Err(_) => Err(ExchangeFailure {
                kind: FailureKind::ConnectionLost,
                transcript: Vec::new(),
            }),
        }
    }
}
