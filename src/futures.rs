//! Replay-aware futures backing the suspension primitives.
//!
//! A [`DurableFuture`] is ready purely as a function of recorded
//! history: polling first claims the next decision event in program
//! order (recording a new one if replay has caught up), then looks for
//! a completion with the same correlation id. Wall-clock completion
//! order is irrelevant; history append order is the only order.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Action, Event, OrchestrationContext};

/// Resolved value of a durable future.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
}

#[derive(Debug, Clone)]
enum Kind {
    Activity { name: String, input: String },
    Timer { delay_ms: u64 },
    External { name: String },
}

impl Kind {
    fn describe(&self) -> String {
        match self {
            Kind::Activity { name, input } => format!("activity {name}({input})"),
            Kind::Timer { delay_ms } => format!("timer delay={delay_ms}ms"),
            Kind::External { name } => format!("external wait {name}"),
        }
    }
}

enum Probe {
    Ready { pos: usize, output: DurableOutput },
    Pending,
}

/// A single suspension point: activity call, timer, or external wait.
pub struct DurableFuture {
    ctx: OrchestrationContext,
    kind: Kind,
    claimed_id: Cell<Option<u64>>,
}

impl DurableFuture {
    pub(crate) fn activity(ctx: OrchestrationContext, name: String, input: String) -> Self {
        Self {
            ctx,
            kind: Kind::Activity { name, input },
            claimed_id: Cell::new(None),
        }
    }

    pub(crate) fn timer(ctx: OrchestrationContext, delay_ms: u64) -> Self {
        Self {
            ctx,
            kind: Kind::Timer { delay_ms },
            claimed_id: Cell::new(None),
        }
    }

    pub(crate) fn external(ctx: OrchestrationContext, name: String) -> Self {
        Self {
            ctx,
            kind: Kind::External { name },
            claimed_id: Cell::new(None),
        }
    }

    /// Claim the decision slot for this future. The nth schedule call of
    /// a turn must line up with the nth recorded decision event; past
    /// the recorded frontier a fresh decision is appended instead. A
    /// mismatch marks the whole turn nondeterministic.
    fn ensure_claimed(&self) -> Option<u64> {
        if let Some(id) = self.claimed_id.get() {
            return Some(id);
        }
        let mut inner = self.ctx.inner.lock().unwrap();
        if inner.nondeterminism.is_some() {
            return None;
        }
        let slot = inner.claims;
        let recorded = inner.history.iter().filter(|e| e.is_decision()).nth(slot).cloned();
        let id = match recorded {
            Some(event) => match (&self.kind, &event) {
                (
                    Kind::Activity { name, input },
                    Event::ActivityScheduled {
                        id,
                        name: recorded_name,
                        input: recorded_input,
                    },
                ) if name == recorded_name && input == recorded_input => *id,
                (Kind::Timer { .. }, Event::TimerCreated { id, .. }) => *id,
                (Kind::External { name }, Event::ExternalSubscribed { id, name: recorded_name })
                    if name == recorded_name =>
                {
                    *id
                }
                _ => {
                    inner.nondeterminism = Some(format!(
                        "decision {slot} diverged from history: program issued {}, history recorded {event:?}",
                        self.kind.describe()
                    ));
                    return None;
                }
            },
            None => {
                let id = inner.allocate_id();
                match &self.kind {
                    Kind::Activity { name, input } => {
                        inner.history.push(Event::ActivityScheduled {
                            id,
                            name: name.clone(),
                            input: input.clone(),
                        });
                        inner.actions.push(Action::CallActivity {
                            id,
                            name: name.clone(),
                            input: input.clone(),
                        });
                    }
                    Kind::Timer { delay_ms } => {
                        let fire_at_ms = crate::now_ms() + delay_ms;
                        inner.history.push(Event::TimerCreated { id, fire_at_ms });
                        inner.actions.push(Action::CreateTimer { id, fire_at_ms });
                    }
                    Kind::External { name } => {
                        inner.history.push(Event::ExternalSubscribed { id, name: name.clone() });
                        inner.actions.push(Action::WaitExternal { id, name: name.clone() });
                    }
                }
                id
            }
        };
        inner.claims += 1;
        self.claimed_id.set(Some(id));
        Some(id)
    }

    /// Claim if needed, then look for this future's completion in
    /// history, reporting its position for select tie-breaks.
    fn probe(&self) -> Probe {
        let Some(id) = self.ensure_claimed() else {
            return Probe::Pending;
        };
        let inner = self.ctx.inner.lock().unwrap();
        for (pos, event) in inner.history.iter().enumerate() {
            let output = match (&self.kind, event) {
                (Kind::Activity { .. }, Event::ActivityCompleted { id: completion, result }) if *completion == id => {
                    DurableOutput::Activity(Ok(result.clone()))
                }
                (Kind::Activity { .. }, Event::ActivityFailed { id: completion, error }) if *completion == id => {
                    DurableOutput::Activity(Err(error.clone()))
                }
                (Kind::Timer { .. }, Event::TimerFired { id: completion, .. }) if *completion == id => {
                    DurableOutput::Timer
                }
                (Kind::External { .. }, Event::ExternalEvent { id: completion, data, .. }) if *completion == id => {
                    DurableOutput::External(data.clone())
                }
                _ => continue,
            };
            return Probe::Ready { pos, output };
        }
        Probe::Pending
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.probe() {
            Probe::Ready { output, .. } => Poll::Ready(output),
            Probe::Pending => Poll::Pending,
        }
    }
}

/// Race of two durable futures. Resolves to `(0, output)` or
/// `(1, output)` for whichever completion sits earlier in history; the
/// loser's decision stays recorded and its completion, if it ever
/// arrives, is simply never consumed.
pub struct SelectFuture {
    a: DurableFuture,
    b: DurableFuture,
}

impl SelectFuture {
    pub(crate) fn new(a: DurableFuture, b: DurableFuture) -> Self {
        Self { a, b }
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Probe in program order so both decisions are claimed
        // deterministically even when neither has completed.
        let first = self.a.probe();
        let second = self.b.probe();
        match (first, second) {
            (Probe::Ready { pos: pa, output: oa }, Probe::Ready { pos: pb, output: ob }) => {
                if pa <= pb {
                    Poll::Ready((0, oa))
                } else {
                    Poll::Ready((1, ob))
                }
            }
            (Probe::Ready { output, .. }, Probe::Pending) => Poll::Ready((0, output)),
            (Probe::Pending, Probe::Ready { output, .. }) => Poll::Ready((1, output)),
            (Probe::Pending, Probe::Pending) => Poll::Pending,
        }
    }
}

/// Fan-in over a set of durable futures. Ready once every child has a
/// completion in history; outputs are returned in program order.
pub struct JoinFuture {
    children: Vec<DurableFuture>,
}

impl JoinFuture {
    pub(crate) fn new(children: Vec<DurableFuture>) -> Self {
        Self { children }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut outputs = Vec::with_capacity(self.children.len());
        for child in &self.children {
            match child.probe() {
                Probe::Ready { output, .. } => outputs.push(output),
                Probe::Pending => {
                    // Keep probing the rest so every decision is
                    // claimed in program order before suspending.
                    for rest in &self.children[outputs.len() + 1..] {
                        let _ = rest.probe();
                    }
                    return Poll::Pending;
                }
            }
        }
        Poll::Ready(outputs)
    }
}
