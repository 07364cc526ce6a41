//! Durable futures.
//!
//! Every awaitable operation is claim-then-probe: on first poll the future
//! claims the next correlation id in call order and either validates the
//! recorded scheduling event (replay) or records a new one (live execution).
//! Subsequent polls probe history for the matching completion. Futures never
//! wake; the runtime re-polls by re-running the whole turn when new
//! completions arrive.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{CtxInner, Decision, Either2, EventKind, OrchestrationContext, RetryPolicy};

/// What a durable operation resolved to; carried with the history seq of its
/// completion event. The seq decides select winners.
#[derive(Debug, Clone)]
enum DurableOutput {
    TaskOk(String),
    TaskErr(String),
    TimerFired,
    EventPayload(String),
    SubOrchOk(String),
    SubOrchErr(String),
}

enum Kind {
    Task {
        name: String,
        input: String,
        retry: Option<RetryPolicy>,
    },
    Timer {
        delay_ms: u64,
    },
    External {
        name: String,
    },
    SubOrchestration {
        name: String,
        version: Option<String>,
        input: String,
    },
}

struct DurableCore {
    ctx: OrchestrationContext,
    kind: Kind,
    /// Correlation id for scheduled operations; wait index for external events.
    claimed: Cell<Option<u64>>,
}

impl DurableCore {
    /// Assign this operation its position in the deterministic call order.
    /// Idempotent; combinators call it for every branch before probing any.
    fn claim(&self) {
        if self.claimed.get().is_some() {
            return;
        }
        let mut inner = self.ctx.inner.lock().expect("ctx lock");

        if let Kind::External { name } = &self.kind {
            let counter = inner.event_wait_counts.entry(name.clone()).or_insert(0);
            let index = *counter as u64;
            *counter += 1;
            self.claimed.set(Some(index));
            return;
        }

        let id = inner.next_correlation_id;
        inner.next_correlation_id += 1;
        self.claimed.set(Some(id));

        if inner.recorded_schedule(id).is_some() {
            self.validate_recorded(&mut inner, id);
        } else {
            self.record(&mut inner, id);
        }
    }

    fn validate_recorded(&self, inner: &mut CtxInner, id: u64) {
        let Some(recorded) = inner.recorded_schedule(id).map(|e| e.kind.clone()) else {
            return;
        };
        let ok = match (&self.kind, &recorded) {
            (Kind::Task { name, input, .. }, EventKind::TaskScheduled { name: rn, input: ri, .. }) => {
                name == rn && input == ri
            }
            (Kind::Timer { .. }, EventKind::TimerCreated { .. }) => true,
            (
                Kind::SubOrchestration { name, input, .. },
                EventKind::SubOrchestrationScheduled { name: rn, input: ri, .. },
            ) => name == rn && input == ri,
            _ => false,
        };
        if !ok {
            inner.flag_divergence(format!(
                "replay divergence at id={id}: recorded {recorded:?}, orchestrator issued {}",
                self.describe()
            ));
        }
    }

    fn record(&self, inner: &mut CtxInner, id: u64) {
        match &self.kind {
            Kind::Task { name, input, retry } => {
                inner.append(EventKind::TaskScheduled {
                    id,
                    name: name.clone(),
                    input: input.clone(),
                });
                inner.decisions.push(Decision::ScheduleTask {
                    id,
                    name: name.clone(),
                    input: input.clone(),
                    retry: retry.clone(),
                });
            }
            Kind::Timer { delay_ms } => {
                let fire_at_ms = inner.turn_now_ms.saturating_add(*delay_ms);
                inner.append(EventKind::TimerCreated { id, fire_at_ms });
                inner.decisions.push(Decision::CreateTimer { id, fire_at_ms });
            }
            Kind::SubOrchestration { name, version, input } => {
                // Execution id is part of the child name so continue-as-new
                // parents never collide with children of prior executions.
                let instance = format!("{}::{}::{id}", inner.instance, inner.execution_id);
                inner.append(EventKind::SubOrchestrationScheduled {
                    id,
                    name: name.clone(),
                    instance: instance.clone(),
                    input: input.clone(),
                });
                inner.decisions.push(Decision::StartSubOrchestration {
                    id,
                    name: name.clone(),
                    version: version.clone(),
                    instance,
                    input: input.clone(),
                });
            }
            Kind::External { .. } => {}
        }
    }

    /// Look for this operation's completion in history.
    fn probe(&self) -> Option<(u64, DurableOutput)> {
        let claimed = self.claimed.get()?;
        let inner = self.ctx.inner.lock().expect("ctx lock");

        if let Kind::External { name } = &self.kind {
            // FIFO per name: the k-th wait consumes the k-th raised event.
            let mut seen = 0u64;
            for event in &inner.history {
                if let EventKind::EventRaised { name: rn, payload } = &event.kind {
                    if rn == name {
                        if seen == claimed {
                            return Some((event.seq, DurableOutput::EventPayload(payload.clone())));
                        }
                        seen += 1;
                    }
                }
            }
            return None;
        }

        for event in &inner.history {
            let resolved = match (&self.kind, &event.kind) {
                (Kind::Task { .. }, EventKind::TaskCompleted { id, result }) if *id == claimed => {
                    Some(DurableOutput::TaskOk(result.clone()))
                }
                (Kind::Task { .. }, EventKind::TaskFailed { id, details }) if *id == claimed => {
                    Some(DurableOutput::TaskErr(details.display_message()))
                }
                (Kind::Timer { .. }, EventKind::TimerFired { id }) if *id == claimed => {
                    Some(DurableOutput::TimerFired)
                }
                (Kind::SubOrchestration { .. }, EventKind::SubOrchestrationCompleted { id, result })
                    if *id == claimed =>
                {
                    Some(DurableOutput::SubOrchOk(result.clone()))
                }
                (Kind::SubOrchestration { .. }, EventKind::SubOrchestrationFailed { id, details })
                    if *id == claimed =>
                {
                    Some(DurableOutput::SubOrchErr(details.display_message()))
                }
                _ => None,
            };
            if let Some(output) = resolved {
                return Some((event.seq, output));
            }
        }
        None
    }

    fn describe(&self) -> String {
        match &self.kind {
            Kind::Task { name, .. } => format!("ScheduleTask({name})"),
            Kind::Timer { delay_ms } => format!("CreateTimer({delay_ms}ms)"),
            Kind::External { name } => format!("WaitForEvent({name})"),
            Kind::SubOrchestration { name, .. } => format!("StartSubOrchestration({name})"),
        }
    }
}

/// A durable operation usable as a branch of a select or join.
/// `claim` fixes the branch's position in call order; `probe` reports its
/// completion (history seq, output) if one is recorded.
pub trait DurableBranch: Unpin {
    type Output;
    fn claim(&self);
    fn probe(&self) -> Option<(u64, Self::Output)>;
}

macro_rules! durable_future {
    ($(#[$doc:meta])* $name:ident, $output:ty, $extract:expr) => {
        $(#[$doc])*
        pub struct $name {
            core: DurableCore,
        }

        impl DurableBranch for $name {
            type Output = $output;

            fn claim(&self) {
                self.core.claim();
            }

            fn probe(&self) -> Option<(u64, Self::Output)> {
                let (seq, output) = self.core.probe()?;
                Some((seq, $extract(output)))
            }
        }

        impl Future for $name {
            type Output = $output;

            fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
                self.core.claim();
                match DurableBranch::probe(&*self) {
                    Some((_, output)) => Poll::Ready(output),
                    None => Poll::Pending,
                }
            }
        }
    };
}

durable_future!(
    /// Activity result: `Ok(output)` or `Err(message)` from the terminal
    /// attempt after executor-side retries.
    TaskFuture,
    Result<String, String>,
    |o| match o {
        DurableOutput::TaskOk(r) => Ok(r),
        DurableOutput::TaskErr(m) => Err(m),
        other => unreachable!("task probe returned {other:?}"),
    }
);

durable_future!(
    /// Durable timer; resolves when the fire event is recorded.
    TimerFuture,
    (),
    |o| match o {
        DurableOutput::TimerFired => (),
        other => unreachable!("timer probe returned {other:?}"),
    }
);

durable_future!(
    /// External event wait; resolves to the event payload.
    EventFuture,
    String,
    |o| match o {
        DurableOutput::EventPayload(p) => p,
        other => unreachable!("event probe returned {other:?}"),
    }
);

durable_future!(
    /// Child orchestration terminal result.
    SubOrchestrationFuture,
    Result<String, String>,
    |o| match o {
        DurableOutput::SubOrchOk(r) => Ok(r),
        DurableOutput::SubOrchErr(m) => Err(m),
        other => unreachable!("sub-orchestration probe returned {other:?}"),
    }
);

pub(crate) fn task_future(
    ctx: OrchestrationContext,
    name: String,
    input: String,
    retry: Option<RetryPolicy>,
) -> TaskFuture {
    TaskFuture {
        core: DurableCore {
            ctx,
            kind: Kind::Task { name, input, retry },
            claimed: Cell::new(None),
        },
    }
}

pub(crate) fn timer_future(ctx: OrchestrationContext, delay_ms: u64) -> TimerFuture {
    TimerFuture {
        core: DurableCore {
            ctx,
            kind: Kind::Timer { delay_ms },
            claimed: Cell::new(None),
        },
    }
}

pub(crate) fn event_future(ctx: OrchestrationContext, name: String) -> EventFuture {
    EventFuture {
        core: DurableCore {
            ctx,
            kind: Kind::External { name },
            claimed: Cell::new(None),
        },
    }
}

pub(crate) fn sub_orchestration_future(
    ctx: OrchestrationContext,
    name: String,
    version: Option<String>,
    input: String,
) -> SubOrchestrationFuture {
    SubOrchestrationFuture {
        core: DurableCore {
            ctx,
            kind: Kind::SubOrchestration { name, version, input },
            claimed: Cell::new(None),
        },
    }
}

/// Race two durable branches. Both are claimed in call order on the first
/// poll so the correlation sequence is identical whichever side wins; the
/// winner is the branch whose completion carries the lower history seq.
pub struct Select2<A, B> {
    a: A,
    b: B,
}

pub(crate) fn select2<A: DurableBranch, B: DurableBranch>(a: A, b: B) -> Select2<A, B> {
    Select2 { a, b }
}

impl<A: DurableBranch, B: DurableBranch> Future for Select2<A, B> {
    type Output = Either2<A::Output, B::Output>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.a.claim();
        this.b.claim();
        match (this.a.probe(), this.b.probe()) {
            (Some((seq_a, out_a)), Some((seq_b, _))) if seq_a <= seq_b => {
                Poll::Ready(Either2::First(out_a))
            }
            (_, Some((_, out_b))) => Poll::Ready(Either2::Second(out_b)),
            (Some((_, out_a)), None) => Poll::Ready(Either2::First(out_a)),
            (None, None) => Poll::Pending,
        }
    }
}

/// Wait for every branch; outputs come back in scheduling order, not arrival
/// order. All branches are claimed on the first poll.
pub struct JoinAll<B> {
    branches: Vec<B>,
}

pub(crate) fn join<B: DurableBranch>(branches: Vec<B>) -> JoinAll<B> {
    JoinAll { branches }
}

impl<B: DurableBranch> Future for JoinAll<B> {
    type Output = Vec<B::Output>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for branch in &this.branches {
            branch.claim();
        }
        let mut outputs = Vec::with_capacity(this.branches.len());
        for branch in &this.branches {
            match branch.probe() {
                Some((_, output)) => outputs.push(output),
                None => return Poll::Pending,
            }
        }
        Poll::Ready(outputs)
    }
}

/// Records the continue-as-new decision and parks forever; the runtime ends
/// the turn and starts the next execution.
pub struct ContinueAsNewFuture {
    ctx: OrchestrationContext,
    input: String,
    version: Option<String>,
    recorded: Cell<bool>,
}

pub(crate) fn continue_as_new(
    ctx: OrchestrationContext,
    input: String,
    version: Option<String>,
) -> ContinueAsNewFuture {
    ContinueAsNewFuture {
        ctx,
        input,
        version,
        recorded: Cell::new(false),
    }
}

impl Future for ContinueAsNewFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.recorded.get() {
            self.recorded.set(true);
            let mut inner = self.ctx.inner.lock().expect("ctx lock");
            inner.decisions.push(Decision::ContinueAsNew {
                input: self.input.clone(),
                version: self.version.clone(),
            });
        }
        Poll::Pending
    }
}
