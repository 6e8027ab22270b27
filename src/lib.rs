//! Durable, replay-based orchestration engine.
//!
//! Orchestrations are written as straight-line `async` functions over an
//! [`OrchestrationContext`]. Every side effect (activity call, timer,
//! external event wait) goes through a suspension primitive that records
//! a decision event into an append-only per-instance history. On resume
//! the function is re-executed from the top and each primitive consults
//! history first: recorded decisions with recorded results return
//! immediately, recorded decisions without results suspend, and new
//! decisions are appended before suspending. In-memory state is never
//! persisted; it is always derived from history.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod client;
pub mod futures;
mod logging;
pub mod providers;
pub mod retry;
pub mod runtime;
pub mod samples;

pub use futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use retry::{BackoffStrategy, RetryPolicy};

/// One record in an instance's append-only history.
///
/// Correlation `id`s tie completions back to the decision that caused
/// them; ids are monotonic per instance and unique across event kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OrchestrationStarted {
        name: String,
        version: String,
        input: String,
    },
    ActivityScheduled {
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        id: u64,
        result: String,
    },
    ActivityFailed {
        id: u64,
        error: String,
    },
    TimerCreated {
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        id: u64,
        fire_at_ms: u64,
    },
    ExternalSubscribed {
        id: u64,
        name: String,
    },
    ExternalEvent {
        id: u64,
        name: String,
        data: String,
    },
    OrchestrationCompleted {
        output: String,
    },
    OrchestrationFailed {
        error: String,
    },
    OrchestrationCancelRequested {
        reason: String,
    },
    OrchestrationCancelled {
        reason: String,
    },
}

impl Event {
    /// Correlation id, for the kinds that carry one.
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { id, .. }
            | Event::ActivityCompleted { id, .. }
            | Event::ActivityFailed { id, .. }
            | Event::TimerCreated { id, .. }
            | Event::TimerFired { id, .. }
            | Event::ExternalSubscribed { id, .. }
            | Event::ExternalEvent { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Decision events are the ones recorded by suspension primitives,
    /// in program order. Replay re-claims them in the same order.
    pub fn is_decision(&self) -> bool {
        matches!(
            self,
            Event::ActivityScheduled { .. } | Event::TimerCreated { .. } | Event::ExternalSubscribed { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationCancelled { .. }
        )
    }
}

/// Highest correlation id present in `history`, or 0 when none.
pub(crate) fn max_correlation_id(history: &[Event]) -> u64 {
    history.iter().filter_map(Event::correlation_id).max().unwrap_or(0)
}

/// True when the history has reached a terminal event.
pub fn history_is_terminal(history: &[Event]) -> bool {
    history.iter().any(Event::is_terminal)
}

/// Declarative side effects a turn asks the runtime to carry out.
/// Emitted exactly once per new decision, never during replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity { id: u64, name: String, input: String },
    CreateTimer { id: u64, fire_at_ms: u64 },
    WaitExternal { id: u64, name: String },
}

/// Returned by [`OrchestrationContext::wait_external_with_timeout`]
/// when the deadline passes without a matching event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimedOut;

impl std::fmt::Display for WaitTimedOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("timed out waiting for external event")
    }
}

pub(crate) struct CtxInner {
    pub(crate) history: Vec<Event>,
    pub(crate) actions: Vec<Action>,
    /// Number of decision events claimed so far this turn.
    pub(crate) claims: usize,
    /// Decision events present when the turn started; claims below this
    /// count are replay, claims at or past it are live execution.
    pub(crate) initial_decisions: usize,
    pub(crate) start_len: usize,
    pub(crate) next_event_id: u64,
    pub(crate) nondeterminism: Option<String>,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        let initial_decisions = history.iter().filter(|e| e.is_decision()).count();
        let start_len = history.len();
        let next_event_id = max_correlation_id(&history) + 1;
        Self {
            history,
            actions: Vec::new(),
            claims: 0,
            initial_decisions,
            start_len,
            next_event_id,
            nondeterminism: None,
        }
    }

    pub(crate) fn allocate_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }
}

/// Handle an orchestration function uses to schedule durable work.
///
/// Cloning is shallow; all clones observe the same turn state.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub fn new(history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    /// Schedule an activity invocation. Resolves to
    /// [`DurableOutput::Activity`] once a completion for the same
    /// correlation id is in history.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::activity(self.clone(), name.into(), input.into())
    }

    /// Schedule a durable timer. The fire time is computed once, when
    /// the decision is first recorded, and is canonical thereafter.
    pub fn schedule_timer(&self, delay: Duration) -> DurableFuture {
        DurableFuture::timer(self.clone(), delay.as_millis() as u64)
    }

    /// Subscribe to a named external event. Only events raised after
    /// this subscription is recorded can resolve it.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture::external(self.clone(), name.into())
    }

    /// Race two durable futures; the winner is whichever completion
    /// appears first in history, not first in wall-clock time.
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture::new(a, b)
    }

    /// Fan-out: await all of the given futures, yielding outputs in
    /// program order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    /// Call an activity and unwrap its result.
    pub async fn call_activity(&self, name: impl Into<String>, input: impl Into<String>) -> Result<String, String> {
        match self.schedule_activity(name, input).await {
            DurableOutput::Activity(res) => res,
            other => Err(format!("unexpected completion kind: {other:?}")),
        }
    }

    /// Typed wrapper over [`Self::call_activity`] using the JSON codec.
    pub async fn call_activity_typed<In, Out>(&self, name: impl Into<String>, input: &In) -> Result<Out, String>
    where
        In: Serialize,
        Out: serde::de::DeserializeOwned,
    {
        let encoded = codec::encode(input)?;
        let raw = self.call_activity(name, encoded).await?;
        codec::decode(&raw)
    }

    /// Durable sleep.
    pub async fn sleep(&self, delay: Duration) {
        let _ = self.schedule_timer(delay).await;
    }

    /// Wait for a named external event without a deadline.
    pub async fn wait_external(&self, name: impl Into<String>) -> String {
        match self.schedule_wait(name).await {
            DurableOutput::External(data) => data,
            other => unreachable!("external wait resolved with {other:?}"),
        }
    }

    /// Wait for a named external event, giving up at the deadline.
    /// The losing timer stays pending in history; its fire after the
    /// instance is terminal is ignored by the runtime.
    pub async fn wait_external_with_timeout(
        &self,
        name: impl Into<String>,
        timeout: Duration,
    ) -> Result<String, WaitTimedOut> {
        let wait = self.schedule_wait(name);
        let deadline = self.schedule_timer(timeout);
        match self.select2(wait, deadline).await {
            (0, DurableOutput::External(data)) => Ok(data),
            _ => Err(WaitTimedOut),
        }
    }

    /// True while replay is still consuming recorded decisions.
    pub fn is_replaying(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.claims < inner.initial_decisions
    }

    /// True once replay has caught up with recorded history; used to
    /// suppress duplicate logs across replays.
    pub fn is_logging_enabled(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.claims >= inner.initial_decisions && inner.nondeterminism.is_none()
    }

    /// Monotonic per-turn marker for log correlation.
    pub fn turn_index(&self) -> u64 {
        self.inner.lock().unwrap().start_len as u64
    }
}

/// Everything a single replay turn produced.
#[derive(Debug)]
pub struct TurnResult {
    /// Decision events recorded this turn (history delta to persist).
    pub new_events: Vec<Event>,
    /// Side effects for the runtime to dispatch.
    pub actions: Vec<Action>,
    /// Present when the orchestration ran to completion this turn.
    pub output: Option<Result<String, String>>,
    /// Set when a schedule call did not match recorded history.
    pub nondeterminism: Option<String>,
}

/// Execute one replay turn: re-run the orchestration function from the
/// top against `history`, collecting new decisions and actions until the
/// function either suspends or returns.
pub fn run_turn<F, Fut>(history: Vec<Event>, orchestrator: F) -> TurnResult
where
    F: FnOnce(OrchestrationContext) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let ctx = OrchestrationContext::new(history);
    let fut = orchestrator(ctx.clone());
    let output = poll_once(fut);
    let inner = ctx.inner.lock().unwrap();
    let new_events = inner.history[inner.start_len..].to_vec();
    TurnResult {
        new_events,
        actions: inner.actions.clone(),
        output,
        nondeterminism: inner.nondeterminism.clone(),
    }
}

/// Poll a future exactly once with a no-op waker. Durable futures are
/// ready purely as a function of history, so a single poll drives the
/// orchestration through every already-resolved await.
pub(crate) fn poll_once<Fut: Future>(fut: Fut) -> Option<Fut::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut pinned = Box::pin(fut);
    match Pin::new(&mut pinned).poll(&mut cx) {
        Poll::Ready(v) => Some(v),
        Poll::Pending => None,
    }
}

fn noop_waker() -> Waker {
    fn raw() -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn clone(_: *const ()) -> RawWaker {
        raw()
    }
    unsafe fn wake(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake, wake);
    unsafe { Waker::from_raw(raw()) }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// String codec for typed activity and orchestration IO. JSON on the
/// wire, with a raw-string fallback so untyped callers can hand plain
/// strings to typed handlers.
pub(crate) mod codec {
    use serde::de::DeserializeOwned;
    use serde::Serialize;

    pub fn encode<T: Serialize>(value: &T) -> Result<String, String> {
        serde_json::to_string(value).map_err(|e| format!("encode: {e}"))
    }

    pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
        match serde_json::from_str(raw) {
            Ok(v) => Ok(v),
            Err(_) => serde_json::from_value(serde_json::Value::String(raw.to_string()))
                .map_err(|e| format!("decode: {e}")),
        }
    }
}
