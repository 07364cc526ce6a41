//! Durable orchestration core.
//!
//! An orchestration is an async function replayed deterministically against an
//! append-only history of [`Event`]s. Each replay pass (a "turn") re-executes
//! the function from the top: operations already recorded in history resolve
//! synchronously from their cached results, operations not yet recorded become
//! [`Decision`]s that the runtime persists and dispatches. The history store is
//! the only durable state; workers hold nothing between turns.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use serde::{Deserialize, Serialize};

pub mod client;
pub mod futures;
pub mod providers;
pub mod runtime;

pub use crate::client::{Client, ClientError, OrchestrationMetadata, WaitError};
pub use crate::futures::{EventFuture, JoinAll, Select2, SubOrchestrationFuture, TaskFuture, TimerFuture};
pub use crate::runtime::registry::{ActivityRegistry, OrchestrationRegistry};

/// Execution ids start at 1; continue-as-new increments.
pub const INITIAL_EXECUTION_ID: u64 = 1;
/// Sequence numbers within an execution start at 1.
pub const FIRST_SEQ: u64 = 1;

pub(crate) const SYSCALL_GUID: &str = "guid";
pub(crate) const SYSCALL_NOW_MS: &str = "now_ms";
pub(crate) const SYSCALL_TRACE_PREFIX: &str = "trace:";

/// One entry in an execution's append-only history.
///
/// `seq` is strictly increasing within an execution and is the sole
/// determinism anchor: replay is a pure function of the ordered event list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub kind: EventKind,
}

/// History event variants. Correlation `id`s are assigned by the
/// orchestrator's call order within an execution, never by clock or random
/// source; completion events reference the scheduling event's `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    ExecutionStarted {
        name: String,
        version: String,
        input: String,
        parent: Option<ParentLink>,
    },
    ExecutionCompleted {
        output: String,
    },
    ExecutionFailed {
        details: FailureDetails,
    },
    ExecutionTerminated {
        reason: String,
    },
    ContinuedAsNew {
        input: String,
    },
    TaskScheduled {
        id: u64,
        name: String,
        input: String,
    },
    TaskCompleted {
        id: u64,
        result: String,
    },
    TaskFailed {
        id: u64,
        details: FailureDetails,
    },
    TimerCreated {
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        id: u64,
    },
    EventRaised {
        name: String,
        payload: String,
    },
    SubOrchestrationScheduled {
        id: u64,
        name: String,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted {
        id: u64,
        result: String,
    },
    SubOrchestrationFailed {
        id: u64,
        details: FailureDetails,
    },
    /// Record/replay cache for deterministic primitives (clock, guid, trace).
    SystemCall {
        id: u64,
        op: String,
        value: String,
    },
}

/// Linkage from a child execution back to the scheduling event in its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentLink {
    pub instance: String,
    pub execution_id: u64,
    pub id: u64,
}

impl Event {
    /// Terminal events end an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::ExecutionCompleted { .. }
                | EventKind::ExecutionFailed { .. }
                | EventKind::ExecutionTerminated { .. }
                | EventKind::ContinuedAsNew { .. }
        )
    }
}

/// Machine-checkable failure classification, so callers can distinguish
/// "business logic failed" from "infrastructure failed" without parsing text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// User code raised an error (activity or orchestrator); catchable in
    /// orchestrator code.
    AppError,
    /// Replayed operation sequence diverged from recorded history. Fatal for
    /// the execution; requires operator intervention.
    Nondeterminism,
    /// No worker version satisfies the execution's pinned version.
    VersionMismatch,
    /// Orchestration or activity name not present in the registry.
    NotRegistered,
    /// Storage or dispatch fault.
    Infrastructure { retryable: bool },
    /// Administrative terminate.
    Terminated,
}

/// Structured, client-visible failure: kind plus human-readable message and
/// optional detail (stack summary, inner error text).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetails {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

impl FailureDetails {
    pub fn app(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::AppError,
            message: message.into(),
            detail: None,
        }
    }

    pub fn nondeterminism(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Nondeterminism,
            message: message.into(),
            detail: None,
        }
    }

    pub fn not_registered(name: &str) -> Self {
        Self {
            kind: ErrorKind::NotRegistered,
            message: format!("unregistered: {name}"),
            detail: None,
        }
    }

    pub fn terminated(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Terminated,
            message: reason.into(),
            detail: None,
        }
    }

    pub fn version_mismatch(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::VersionMismatch,
            message: message.into(),
            detail: None,
        }
    }

    /// Single-line rendering delivered to orchestrator code on failed awaits.
    pub fn display_message(&self) -> String {
        self.message.clone()
    }
}

impl std::fmt::Display for FailureDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Activity retry policy, executed inside the activity executor. Retries are
/// invisible to history; only the terminal outcome is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub first_retry_delay_ms: u64,
    pub backoff_coefficient: f64,
    pub max_retry_delay_ms: u64,
    pub retry_timeout_ms: Option<u64>,
}

impl RetryPolicy {
    /// Policy with `max_attempts` total attempts and default backoff.
    ///
    /// # Panics
    /// Panics if `max_attempts` is zero; at least one attempt is required.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            first_retry_delay_ms: 100,
            backoff_coefficient: 2.0,
            max_retry_delay_ms: 30_000,
            retry_timeout_ms: None,
        }
    }

    pub fn with_first_retry_delay_ms(mut self, ms: u64) -> Self {
        self.first_retry_delay_ms = ms;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_max_retry_delay_ms(mut self, ms: u64) -> Self {
        self.max_retry_delay_ms = ms;
        self
    }

    pub fn with_retry_timeout_ms(mut self, ms: u64) -> Self {
        self.retry_timeout_ms = Some(ms);
        self
    }

    /// Delay before retry attempt number `attempt` (1-based; attempt 1 is the
    /// first retry after the initial failure).
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1);
        let factor = self.backoff_coefficient.max(1.0).powi(exp as i32);
        let raw = (self.first_retry_delay_ms as f64 * factor) as u64;
        raw.min(self.max_retry_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Output of one replay pass: ordered actions the runtime translates 1:1 into
/// history events and dispatchable work items. Only newly issued operations
/// appear here; replayed operations resolve from history without a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    ScheduleTask {
        id: u64,
        name: String,
        input: String,
        retry: Option<RetryPolicy>,
    },
    CreateTimer {
        id: u64,
        fire_at_ms: u64,
    },
    StartSubOrchestration {
        id: u64,
        name: String,
        version: Option<String>,
        instance: String,
        input: String,
    },
    ContinueAsNew {
        input: String,
        version: Option<String>,
    },
    SystemCall {
        id: u64,
        op: String,
        value: String,
    },
    SetCustomStatus {
        value: Option<String>,
    },
}

/// Client-visible lifecycle status of an instance.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationStatus {
    NotFound,
    /// Start enqueued, first turn not yet executed.
    Pending,
    Running,
    Suspended,
    Completed { output: String },
    Failed { details: FailureDetails },
    Terminated { reason: String },
    /// Transient: current execution ended with continue-as-new and the next
    /// execution has not started its first turn yet.
    ContinuedAsNew,
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }
}

/// Two-way select result.
#[derive(Debug, Clone, PartialEq)]
pub enum Either2<A, B> {
    First(A),
    Second(B),
}

/// Context handed to activity handlers. Activities are free to perform I/O and
/// use real time; the fields exist for log correlation only.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub instance: String,
    pub execution_id: u64,
    pub task_id: u64,
    pub attempt: u32,
}

/// JSON envelope for typed orchestration and activity payloads.
pub mod codec {
    use serde::{de::DeserializeOwned, Serialize};

    pub fn encode<T: Serialize>(value: &T) -> Result<String, String> {
        serde_json::to_string(value).map_err(|e| format!("encode: {e}"))
    }

    pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        serde_json::from_str(s).map_err(|e| format!("decode: {e}"))
    }
}

pub(crate) struct CtxInner {
    pub(crate) instance: String,
    pub(crate) execution_id: u64,
    pub(crate) version: Option<String>,
    /// Current-execution history, extended in place as the turn schedules new
    /// operations.
    pub(crate) history: Vec<Event>,
    pub(crate) next_seq: u64,
    /// Call-order counter for correlation ids.
    pub(crate) next_correlation_id: u64,
    /// Highest correlation id recorded before this turn; ids at or below it
    /// are replayed, ids above it are live.
    pub(crate) replay_horizon: u64,
    pub(crate) decisions: Vec<Decision>,
    /// Per-name count of external-event waits issued so far this replay, for
    /// FIFO matching against buffered `EventRaised` events.
    pub(crate) event_wait_counts: HashMap<String, usize>,
    pub(crate) divergence: Option<String>,
    /// Wall clock frozen at the start of the turn; only consulted when a new
    /// SystemCall or timer is recorded, never during replay.
    pub(crate) turn_now_ms: u64,
    pub(crate) guid_counter: u32,
}

impl CtxInner {
    fn new(instance: String, execution_id: u64, version: Option<String>, history: Vec<Event>, now_ms: u64) -> Self {
        let next_seq = history.iter().map(|e| e.seq).max().unwrap_or(0) + 1;
        let replay_horizon = history
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::TaskScheduled { id, .. }
                | EventKind::TimerCreated { id, .. }
                | EventKind::SubOrchestrationScheduled { id, .. }
                | EventKind::SystemCall { id, .. } => Some(*id),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        Self {
            instance,
            execution_id,
            version,
            history,
            next_seq,
            next_correlation_id: 1,
            replay_horizon,
            decisions: Vec::new(),
            event_wait_counts: HashMap::new(),
            divergence: None,
            turn_now_ms: now_ms,
            guid_counter: 0,
        }
    }

    pub(crate) fn append(&mut self, kind: EventKind) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.history.push(Event { seq, kind });
        seq
    }

    /// Locate the recorded scheduling-class event for a correlation id.
    pub(crate) fn recorded_schedule(&self, id: u64) -> Option<&Event> {
        self.history.iter().find(|e| {
            matches!(
                &e.kind,
                EventKind::TaskScheduled { id: rid, .. }
                | EventKind::TimerCreated { id: rid, .. }
                | EventKind::SubOrchestrationScheduled { id: rid, .. }
                | EventKind::SystemCall { id: rid, .. } if *rid == id
            )
        })
    }

    pub(crate) fn flag_divergence(&mut self, msg: String) {
        if self.divergence.is_none() {
            self.divergence = Some(msg);
        }
    }
}

/// Replay-side handle exposed to orchestrator code. Cheap to clone; all
/// durable futures borrow it.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(
        instance: String,
        execution_id: u64,
        version: Option<String>,
        history: Vec<Event>,
        now_ms: u64,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance, execution_id, version, history, now_ms))),
        }
    }

    /// Instance id of the orchestration being replayed.
    pub fn instance(&self) -> String {
        self.inner.lock().expect("ctx lock").instance.clone()
    }

    pub fn execution_id(&self) -> u64 {
        self.inner.lock().expect("ctx lock").execution_id
    }

    /// Version pinned at execution start, for version-based branching during
    /// rolling deployments.
    pub fn version(&self) -> Option<semver::Version> {
        let v = self.inner.lock().expect("ctx lock").version.clone()?;
        semver::Version::parse(&v).ok()
    }

    /// True while the current position is still covered by recorded history.
    pub fn is_replaying(&self) -> bool {
        let inner = self.inner.lock().expect("ctx lock");
        inner.next_correlation_id <= inner.replay_horizon
    }

    /// Schedule an activity. Resolves to the activity's result or failure
    /// message once the completion appears in history.
    pub fn schedule_task(&self, name: impl Into<String>, input: impl Into<String>) -> TaskFuture {
        crate::futures::task_future(self.clone(), name.into(), input.into(), None)
    }

    /// Schedule an activity with an executor-side retry policy. Retries do not
    /// appear in history; only the final outcome does.
    pub fn schedule_task_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        retry: RetryPolicy,
    ) -> TaskFuture {
        crate::futures::task_future(self.clone(), name.into(), input.into(), Some(retry))
    }

    /// Schedule a typed activity (JSON-encoded input).
    pub fn schedule_task_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> TaskFuture {
        let payload = codec::encode(input).unwrap_or_default();
        self.schedule_task(name, payload)
    }

    /// Durable timer firing `delay` after the turn that created it.
    pub fn schedule_timer(&self, delay: std::time::Duration) -> TimerFuture {
        crate::futures::timer_future(self.clone(), delay.as_millis() as u64)
    }

    /// Wait for a named external event. Events raised before anyone waits are
    /// buffered in history and consumed FIFO per name.
    pub fn wait_for_event(&self, name: impl Into<String>) -> EventFuture {
        crate::futures::event_future(self.clone(), name.into())
    }

    /// Schedule a child orchestration and wait for its terminal result.
    pub fn schedule_sub_orchestration(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> SubOrchestrationFuture {
        crate::futures::sub_orchestration_future(self.clone(), name.into(), None, input.into())
    }

    pub fn schedule_sub_orchestration_versioned(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> SubOrchestrationFuture {
        crate::futures::sub_orchestration_future(self.clone(), name.into(), Some(version.into()), input.into())
    }

    /// Race two durable operations; the winner is the branch whose completion
    /// was recorded first (lowest history seq), independent of arrival timing.
    pub fn select2<A, B>(&self, a: A, b: B) -> Select2<A, B>
    where
        A: crate::futures::DurableBranch,
        B: crate::futures::DurableBranch,
    {
        crate::futures::select2(a, b)
    }

    /// Wait for all branches; outputs are returned in scheduling (call) order
    /// regardless of completion arrival order.
    pub fn join<B: crate::futures::DurableBranch>(&self, branches: Vec<B>) -> JoinAll<B> {
        crate::futures::join(branches)
    }

    /// Atomically end this execution and start a fresh one under the same
    /// instance id with `input` and truncated history. Never resolves.
    pub fn continue_as_new(&self, input: impl Into<String>) -> crate::futures::ContinueAsNewFuture {
        crate::futures::continue_as_new(self.clone(), input.into(), None)
    }

    pub fn continue_as_new_versioned(
        &self,
        input: impl Into<String>,
        version: impl Into<String>,
    ) -> crate::futures::ContinueAsNewFuture {
        crate::futures::continue_as_new(self.clone(), input.into(), Some(version.into()))
    }

    /// Replay-stable wall clock, frozen per tick via a recorded system call.
    pub fn current_time_ms(&self) -> u64 {
        let value = self.system_call(SYSCALL_NOW_MS.to_string(), |inner| inner.turn_now_ms.to_string());
        value.parse().unwrap_or(0)
    }

    /// Replay-stable GUID, recorded on first execution and replayed thereafter.
    pub fn new_guid(&self) -> String {
        self.system_call(SYSCALL_GUID.to_string(), |inner| {
            inner.guid_counter += 1;
            deterministic_guid(inner.turn_now_ms, inner.execution_id, inner.next_correlation_id, inner.guid_counter)
        })
    }

    /// Set the instance's opaque custom-status blob, visible through status
    /// queries. Last write in a turn wins; replaying the write is harmless.
    pub fn set_custom_status(&self, value: impl Into<String>) {
        let mut inner = self.inner.lock().expect("ctx lock");
        inner.decisions.push(Decision::SetCustomStatus {
            value: Some(value.into()),
        });
    }

    pub fn clear_custom_status(&self) {
        let mut inner = self.inner.lock().expect("ctx lock");
        inner.decisions.push(Decision::SetCustomStatus { value: None });
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace("INFO", message.into());
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace("WARN", message.into());
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace("ERROR", message.into());
    }

    /// Orchestrator-visible tracing: emitted once on first execution, then
    /// replayed silently from history.
    fn trace(&self, level: &str, message: String) {
        let op = format!("{SYSCALL_TRACE_PREFIX}{level}:{message}");
        self.system_call(op, |_| String::new());
    }

    /// Record/replay a deterministic primitive keyed by call order.
    fn system_call(&self, op: String, compute: impl FnOnce(&mut CtxInner) -> String) -> String {
        let mut inner = self.inner.lock().expect("ctx lock");
        let id = inner.next_correlation_id;
        inner.next_correlation_id += 1;

        if let Some(recorded) = inner.recorded_schedule(id).map(|e| e.kind.clone()) {
            match recorded {
                EventKind::SystemCall { op: rop, value, .. } if rop == op => return value,
                other => {
                    inner.flag_divergence(format!(
                        "replay divergence at id={id}: recorded {other:?}, orchestrator issued SystemCall({op})"
                    ));
                    return String::new();
                }
            }
        }

        let value = compute(&mut inner);
        if let Some(rest) = op.strip_prefix(SYSCALL_TRACE_PREFIX) {
            emit_trace(&inner, rest);
        }
        inner.append(EventKind::SystemCall {
            id,
            op: op.clone(),
            value: value.clone(),
        });
        inner.decisions.push(Decision::SystemCall { id, op, value: value.clone() });
        value
    }
}

fn emit_trace(inner: &CtxInner, level_and_message: &str) {
    let (level, message) = level_and_message.split_once(':').unwrap_or(("INFO", level_and_message));
    match level {
        "ERROR" => tracing::error!(
            target: "durakit::orchestration",
            instance = %inner.instance,
            execution_id = inner.execution_id,
            "{message}"
        ),
        "WARN" => tracing::warn!(
            target: "durakit::orchestration",
            instance = %inner.instance,
            execution_id = inner.execution_id,
            "{message}"
        ),
        _ => tracing::info!(
            target: "durakit::orchestration",
            instance = %inner.instance,
            execution_id = inner.execution_id,
            "{message}"
        ),
    }
}

/// Time-and-counter GUID in canonical form. Deterministic inputs only; safe
/// to record and replay.
pub(crate) fn deterministic_guid(now_ms: u64, execution_id: u64, call_index: u64, counter: u32) -> String {
    let hi = now_ms ^ execution_id.rotate_left(17);
    let lo = call_index.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ u64::from(counter);
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (hi >> 32) as u32,
        (hi >> 16) as u16,
        hi as u16,
        (lo >> 48) as u16,
        lo & 0xFFFF_FFFF_FFFF
    )
}

/// Wall-clock GUID for client-side instance id generation.
pub(crate) fn fresh_guid() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (now >> 96) as u32,
        (now >> 80) as u16,
        counter as u16,
        (now >> 64) as u16,
        (now & 0xFFFF_FFFF_FFFF) as u64
    )
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

/// Result of replaying orchestrator code once against a history prefix.
pub(crate) struct TurnOutcome {
    /// History after the turn: input history plus events recorded this pass.
    pub history: Vec<Event>,
    /// Newly issued operations, in call order.
    pub decisions: Vec<Decision>,
    /// Present when the orchestrator function returned.
    pub output: Option<Result<String, String>>,
    /// Set when the replayed operation sequence diverged from history.
    pub divergence: Option<String>,
}

/// Replay orchestrator code against `history`. Single synchronous poll of the
/// root future: every await either resolves from history or parks the turn.
pub(crate) fn run_turn<F, Fut>(
    instance: &str,
    execution_id: u64,
    version: Option<String>,
    history: Vec<Event>,
    now_ms: u64,
    orchestrator: F,
) -> TurnOutcome
where
    F: FnOnce(OrchestrationContext) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let ctx = OrchestrationContext::new(instance.to_string(), execution_id, version, history, now_ms);
    let mut fut = orchestrator(ctx.clone());
    let waker = noop_waker();
    let mut poll_cx = Context::from_waker(&waker);
    // The future never escapes this frame, so stack pinning is sound.
    let pinned = unsafe { std::pin::Pin::new_unchecked(&mut fut) };
    let polled = pinned.poll(&mut poll_cx);

    let inner = ctx.inner.lock().expect("ctx lock");
    TurnOutcome {
        history: inner.history.clone(),
        decisions: inner.decisions.clone(),
        output: match polled {
            Poll::Ready(out) => Some(out),
            Poll::Pending => None,
        },
        divergence: inner.divergence.clone(),
    }
}
