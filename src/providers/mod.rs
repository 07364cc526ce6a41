//! Storage providers: durable history plus three peek-lock queues
//! (orchestrator, worker, timer). All runtime state lives behind this trait;
//! workers are stateless between turns.

use serde::{Deserialize, Serialize};

use crate::{Event, FailureDetails, ParentLink, RetryPolicy};

mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::ProviderError;
pub use in_memory::InMemoryProvider;
pub use sqlite::SqliteProvider;

/// Messages carried on the provider queues. Orchestrator-queue items target an
/// instance; worker- and timer-queue items carry enough context to route their
/// completion back to the right execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkItem {
    // -- orchestrator queue --
    StartOrchestration {
        instance: String,
        name: String,
        version: Option<String>,
        input: String,
        parent: Option<ParentLink>,
    },
    EventRaised {
        instance: String,
        name: String,
        payload: String,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
    /// Rolls the instance over to a fresh execution with truncated history.
    ContinueAsNew {
        instance: String,
        name: String,
        version: Option<String>,
        input: String,
        parent: Option<ParentLink>,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        details: FailureDetails,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    SubOrchCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    SubOrchFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        details: FailureDetails,
    },

    // -- worker queue --
    /// Activity invocation; the retry policy travels with the item so retries
    /// run inside the executor without touching history.
    ActivityInvoke {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
        retry: Option<RetryPolicy>,
    },

    // -- timer queue --
    TimerSchedule {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
}

impl WorkItem {
    /// Instance the item routes to.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::EventRaised { instance, .. }
            | WorkItem::TerminateInstance { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::SubOrchCompleted { instance, .. }
            | WorkItem::SubOrchFailed { instance, .. }
            | WorkItem::ActivityInvoke { instance, .. }
            | WorkItem::TimerSchedule { instance, .. } => instance,
        }
    }

    /// Terminate items bypass the suspended-instance filter.
    pub fn is_terminate(&self) -> bool {
        matches!(self, WorkItem::TerminateInstance { .. })
    }
}

/// One locked batch handed to the orchestration dispatcher: the instance's
/// current-execution history plus every orchestrator message that was visible
/// at fetch time, all under a single lock token.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    pub execution_id: u64,
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub lock_token: String,
}

/// A locked worker- or timer-queue message.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub item: WorkItem,
    pub lock_token: String,
}

/// Denormalized per-instance record maintained by `ack_orchestration_item`.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub instance: String,
    pub current_execution_id: u64,
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub custom_status: Option<String>,
    pub suspended: bool,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Coarse execution state persisted alongside the instance record so status
/// queries do not have to replay history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    ContinuedAsNew,
}

/// Terminal metadata applied atomically with the history delta on ack.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetadata {
    /// New status, if the turn changed it.
    pub status: Option<ExecutionStatus>,
    pub output: Option<String>,
    /// `Some(new_value)` updates the custom status; inner `None` clears it.
    pub custom_status: Option<Option<String>>,
}

/// Storage contract. Implementations must make `ack_orchestration_item`
/// atomic: history delta, queue deletions, new enqueues, and metadata all
/// commit together or not at all.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// History of the latest execution, empty if unknown.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    /// History of a specific execution.
    async fn read_with_execution(&self, instance: &str, execution_id: u64)
        -> Result<Vec<Event>, ProviderError>;

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    /// Execution ids for an instance, ascending.
    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError>;

    /// Register an instance. Fails permanently if the instance already exists;
    /// callers rely on this for duplicate-start rejection.
    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError>;

    /// Purge an instance: record, all execution histories, and any queued
    /// messages addressed to it.
    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError>;

    async fn instance_record(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError>;

    /// Suspend or resume delivery of orchestrator work for an instance.
    /// While suspended, messages buffer; terminate still gets through.
    async fn set_suspended(&self, instance: &str, suspended: bool) -> Result<(), ProviderError>;

    /// Enqueue an orchestrator-queue item, optionally invisible for `delay_ms`.
    async fn enqueue_orchestrator_work(
        &self,
        item: WorkItem,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError>;

    /// Lock and return the next instance batch: all visible orchestrator
    /// messages for one eligible instance (not suspended unless terminating,
    /// no live lock held by another worker) plus its current history.
    async fn fetch_orchestration_item(
        &self,
        lock_timeout_ms: u64,
    ) -> Result<Option<OrchestrationItem>, ProviderError>;

    /// Atomically commit a turn: append `history_delta` to `execution_id`
    /// (creating the execution if new), delete the locked batch, enqueue the
    /// follow-on items, and apply `metadata`. Fails permanently on expired or
    /// unknown lock tokens and on non-increasing history seqs.
    #[allow(clippy::too_many_arguments)]
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<(WorkItem, Option<u64>)>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError>;

    /// Release a locked batch unchanged, optionally delaying redelivery.
    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError>;

    async fn dequeue_worker_peek_lock(
        &self,
        lock_timeout_ms: u64,
    ) -> Result<Option<QueuedItem>, ProviderError>;

    /// Atomically enqueue the completion and delete the worker message. A
    /// redelivered message whose completion already landed produces a
    /// duplicate completion; the dispatcher drops it during replay prep.
    async fn ack_worker_item(
        &self,
        lock_token: &str,
        completion: WorkItem,
    ) -> Result<(), ProviderError>;

    async fn abandon_worker_item(
        &self,
        lock_token: &str,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError>;

    async fn dequeue_timer_peek_lock(
        &self,
        lock_timeout_ms: u64,
    ) -> Result<Option<QueuedItem>, ProviderError>;

    /// Atomically enqueue the fired notification and delete the timer message.
    async fn ack_timer_item(&self, lock_token: &str, fired: WorkItem) -> Result<(), ProviderError>;

    async fn abandon_timer_item(
        &self,
        lock_token: &str,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError>;

    /// True when the provider honors `visible_at` natively, in which case
    /// timers are enqueued as delayed orchestrator messages and the timer
    /// queue goes unused.
    fn supports_delayed_visibility(&self) -> bool {
        false
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
