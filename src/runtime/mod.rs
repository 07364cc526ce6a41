//! In-process runtime: three dispatcher loops over the provider queues.
//!
//! The orchestration dispatcher fetches a locked instance batch, replays the
//! orchestrator function over history, and commits the turn atomically. The
//! worker dispatcher executes activities (running any retry policy invisibly,
//! without history events per attempt). The timer dispatcher only exists for
//! providers without native delayed visibility.

use std::sync::Arc;

use async_trait::async_trait;
use semver::Version;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::providers::{
    now_ms, ExecutionMetadata, ExecutionStatus, OrchestrationItem, Provider, WorkItem,
};
use crate::{
    ActivityContext, Decision, EventKind, FailureDetails, OrchestrationContext, ParentLink, RetryPolicy,
};

pub mod registry;
pub(crate) mod state;
mod timers;
mod turn;

use registry::{ActivityRegistry, OrchestrationRegistry};
use state::{BatchReader, HistorySnapshot, StartInfo};
use turn::{OrchestrationTurn, TurnResult};

pub use registry::VersionPolicy;

/// How a worker compares an execution's pinned version against its own
/// configured version before replaying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionMatchStrategy {
    /// No gate; any worker replays any execution.
    #[default]
    None,
    /// Pinned version must equal the worker version.
    Strict,
    /// Pinned version must not be newer than the worker version.
    CurrentOrOlder,
}

/// What to do when the version gate rejects an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionMismatchAction {
    /// Release the batch with a short delay so a matching worker can take it.
    #[default]
    RejectAndRequeue,
    /// Record a terminal version-mismatch failure.
    FailExecution,
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Polling interval when dispatcher queues are empty.
    pub dispatcher_idle_sleep_ms: u64,
    /// Peek-lock visibility timeout for fetched batches and work items.
    pub lock_timeout_ms: u64,
    /// Version this worker carries for gating, if any.
    pub worker_version: Option<Version>,
    pub version_match: VersionMatchStrategy,
    pub version_mismatch_action: VersionMismatchAction,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
            lock_timeout_ms: 30_000,
            worker_version: None,
            version_match: VersionMatchStrategy::None,
            version_mismatch_action: VersionMismatchAction::RejectAndRequeue,
        }
    }
}

/// Delay before a version-rejected batch becomes visible again.
const VERSION_REQUEUE_DELAY_MS: u64 = 200;

#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Executes orchestrations and activities against a `Provider`.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    provider: Arc<dyn Provider>,
    orchestrations: OrchestrationRegistry,
    options: RuntimeOptions,
}

impl Runtime {
    /// Start with the in-memory provider; test and demo convenience.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let provider: Arc<dyn Provider> = Arc::new(crate::providers::InMemoryProvider::new());
        Self::start_with_store(provider, activity_registry, orchestration_registry).await
    }

    pub async fn start_with_store(
        provider: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            provider,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    pub async fn start_with_options(
        provider: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none is set; harmless when repeated.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            provider,
            orchestrations: orchestration_registry,
            options,
        });

        let orchestration_handle = runtime.clone().start_orchestration_dispatcher();
        runtime.joins.lock().await.push(orchestration_handle);

        let worker_handle = runtime.clone().start_work_dispatcher(activity_registry);
        runtime.joins.lock().await.push(worker_handle);

        if !runtime.provider.supports_delayed_visibility() {
            let timer_handle = runtime.clone().start_timer_dispatcher();
            runtime.joins.lock().await.push(timer_handle);
        }

        runtime
    }

    /// Abort the dispatcher tasks.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for join in joins.drain(..) {
            join.abort();
        }
    }

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.provider.fetch_orchestration_item(self.options.lock_timeout_ms).await {
                    Ok(Some(item)) => self.process_orchestration_item(item).await,
                    Ok(None) => {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            self.options.dispatcher_idle_sleep_ms,
                        ))
                        .await;
                    }
                    Err(e) => {
                        warn!(error = %e, "fetch_orchestration_item failed");
                        tokio::time::sleep(std::time::Duration::from_millis(
                            self.options.dispatcher_idle_sleep_ms,
                        ))
                        .await;
                    }
                }
            }
        })
    }

    async fn process_orchestration_item(self: &Arc<Self>, item: OrchestrationItem) {
        let instance = item.instance.clone();
        let batch = BatchReader::from_messages(&item.messages);
        let snapshot = HistorySnapshot::from_history(&item.history);

        // A terminal execution consumes nothing further. The one exception is
        // the continue-as-new rollover message, which opens the next execution.
        if snapshot.is_terminal() && batch.continue_as_new.is_none() {
            debug!(instance = %instance, "instance is terminal; dropping batch");
            self.commit_turn(&item.lock_token, item.execution_id, vec![], vec![], vec![], vec![], ExecutionMetadata::default())
                .await;
            return;
        }

        let (execution_id, history) = if batch.continue_as_new.is_some() {
            (item.execution_id + 1, Vec::new())
        } else {
            (item.execution_id, item.history.clone())
        };

        // Terminate wins over everything else in the batch.
        if let Some(reason) = &batch.terminate_reason {
            let mut turn = OrchestrationTurn::new(&instance, execution_id, None, history);
            turn.append_event(EventKind::ExecutionTerminated { reason: reason.clone() });
            let parent_items = snapshot
                .started
                .as_ref()
                .and_then(|s| s.parent.clone())
                .map(|parent| {
                    (
                        WorkItem::SubOrchFailed {
                            instance: parent.instance,
                            execution_id: parent.execution_id,
                            id: parent.id,
                            details: FailureDetails::terminated(reason.clone()),
                        },
                        None,
                    )
                })
                .into_iter()
                .collect();
            let metadata = ExecutionMetadata {
                status: Some(ExecutionStatus::Terminated),
                output: Some(reason.clone()),
                custom_status: None,
            };
            self.commit_turn(
                &item.lock_token,
                execution_id,
                turn.history_delta(),
                vec![],
                vec![],
                parent_items,
                metadata,
            )
            .await;
            return;
        }

        let mut turn = OrchestrationTurn::new(&instance, execution_id, None, history);

        // A fresh execution needs its start record before anything replays.
        let start_info = if turn.full_history().is_empty() {
            let Some((name, requested_version, input, parent)) = batch
                .continue_as_new
                .as_ref()
                .or(batch.start.as_ref())
                .and_then(start_fields)
            else {
                warn!(instance = %instance, "messages for unknown instance with no start; dropping batch");
                self.commit_turn(&item.lock_token, execution_id, vec![], vec![], vec![], vec![], ExecutionMetadata::default())
                    .await;
                return;
            };
            let resolved = match &requested_version {
                Some(v) => Version::parse(v).ok().and_then(|v| {
                    self.orchestrations
                        .resolve_handler_exact(&name, &v)
                        .map(|h| (v, h))
                }),
                None => self.orchestrations.resolve_handler(&name),
            };
            let Some((version, handler)) = resolved else {
                // A known name with no handler for the requested version is a
                // version mismatch, not a missing registration.
                let details = if self.orchestrations.has(&name) {
                    FailureDetails::version_mismatch(format!(
                        "no handler for {name}@{}",
                        requested_version.as_deref().unwrap_or("latest"),
                    ))
                } else {
                    FailureDetails::not_registered(&name)
                };
                self.fail_at_start(
                    &item.lock_token,
                    execution_id,
                    turn,
                    &name,
                    requested_version.as_deref(),
                    input,
                    parent,
                    details,
                )
                .await;
                return;
            };
            // The gate applies to fresh executions too; a drifted worker must
            // not run even the first turn.
            if let Some(rejection) = self.version_gate(&version) {
                match self.options.version_mismatch_action {
                    VersionMismatchAction::RejectAndRequeue => {
                        debug!(instance = %instance, pinned = %version, "version gate rejected start; requeueing");
                        self.abandon_with_delay(&item.lock_token, Some(VERSION_REQUEUE_DELAY_MS)).await;
                    }
                    VersionMismatchAction::FailExecution => {
                        turn.append_event(EventKind::ExecutionStarted {
                            name: name.clone(),
                            version: version.to_string(),
                            input: input.clone(),
                            parent: parent.clone(),
                        });
                        self.fail_execution(
                            &item.lock_token,
                            execution_id,
                            turn,
                            FailureDetails::version_mismatch(rejection),
                            parent,
                        )
                        .await;
                    }
                }
                return;
            }
            turn.append_event(EventKind::ExecutionStarted {
                name: name.clone(),
                version: version.to_string(),
                input: input.clone(),
                parent: parent.clone(),
            });
            (name, version, input, parent, handler)
        } else {
            let Some(StartInfo { name, version, parent }) = snapshot.started.clone() else {
                warn!(instance = %instance, "non-empty history without a start event; dropping batch");
                self.abandon_with_delay(&item.lock_token, None).await;
                return;
            };
            let input = item
                .history
                .iter()
                .find_map(|e| match &e.kind {
                    EventKind::ExecutionStarted { input, .. } => Some(input.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            let Ok(pinned) = Version::parse(&version) else {
                self.fail_execution(
                    &item.lock_token,
                    execution_id,
                    turn,
                    FailureDetails::version_mismatch(format!("unparseable pinned version: {version}")),
                    parent,
                )
                .await;
                return;
            };
            if let Some(rejection) = self.version_gate(&pinned) {
                match self.options.version_mismatch_action {
                    VersionMismatchAction::RejectAndRequeue => {
                        debug!(instance = %instance, pinned = %pinned, "version gate rejected batch; requeueing");
                        self.abandon_with_delay(&item.lock_token, Some(VERSION_REQUEUE_DELAY_MS)).await;
                    }
                    VersionMismatchAction::FailExecution => {
                        self.fail_execution(
                            &item.lock_token,
                            execution_id,
                            turn,
                            FailureDetails::version_mismatch(rejection),
                            parent,
                        )
                        .await;
                    }
                }
                return;
            }
            let Some(handler) = self.orchestrations.resolve_handler_exact(&name, &pinned) else {
                let details = if self.orchestrations.has(&name) {
                    FailureDetails::version_mismatch(format!("no handler for pinned {name}@{pinned}"))
                } else {
                    FailureDetails::not_registered(&name)
                };
                self.fail_execution(&item.lock_token, execution_id, turn, details, parent).await;
                return;
            };
            (name, pinned, input, parent, handler)
        };
        let (name, version, input, parent, handler) = start_info;

        turn.set_version(version.to_string());
        turn.prep_completions(&batch);
        let result = turn.execute(handler, input, now_ms());

        let mut worker_items = Vec::new();
        let mut timer_items = Vec::new();
        let mut orchestrator_items: Vec<(WorkItem, Option<u64>)> = Vec::new();
        let mut metadata = ExecutionMetadata::default();

        for decision in &turn.decisions {
            match decision {
                Decision::ScheduleTask {
                    id,
                    name,
                    input,
                    retry,
                } => worker_items.push(WorkItem::ActivityInvoke {
                    instance: instance.clone(),
                    execution_id,
                    id: *id,
                    name: name.clone(),
                    input: input.clone(),
                    retry: retry.clone(),
                }),
                Decision::CreateTimer { id, fire_at_ms } => timer_items.push(WorkItem::TimerSchedule {
                    instance: instance.clone(),
                    execution_id,
                    id: *id,
                    fire_at_ms: *fire_at_ms,
                }),
                Decision::StartSubOrchestration {
                    id,
                    name,
                    version,
                    instance: child,
                    input,
                } => orchestrator_items.push((
                    WorkItem::StartOrchestration {
                        instance: child.clone(),
                        name: name.clone(),
                        version: version.clone(),
                        input: input.clone(),
                        parent: Some(ParentLink {
                            instance: instance.clone(),
                            execution_id,
                            id: *id,
                        }),
                    },
                    None,
                )),
                Decision::SetCustomStatus { value } => metadata.custom_status = Some(value.clone()),
                Decision::SystemCall { .. } | Decision::ContinueAsNew { .. } => {}
            }
        }

        match result {
            TurnResult::Continue => {
                metadata.status = Some(ExecutionStatus::Running);
            }
            TurnResult::Completed { output } => {
                turn.append_event(EventKind::ExecutionCompleted { output: output.clone() });
                metadata.status = Some(ExecutionStatus::Completed);
                metadata.output = Some(output.clone());
                if let Some(parent) = &parent {
                    orchestrator_items.push((
                        WorkItem::SubOrchCompleted {
                            instance: parent.instance.clone(),
                            execution_id: parent.execution_id,
                            id: parent.id,
                            result: output,
                        },
                        None,
                    ));
                }
            }
            TurnResult::Failed(details) => {
                turn.append_event(EventKind::ExecutionFailed { details: details.clone() });
                metadata.status = Some(ExecutionStatus::Failed);
                metadata.output = Some(details.display_message());
                if let Some(parent) = &parent {
                    orchestrator_items.push((
                        WorkItem::SubOrchFailed {
                            instance: parent.instance.clone(),
                            execution_id: parent.execution_id,
                            id: parent.id,
                            details,
                        },
                        None,
                    ));
                }
            }
            TurnResult::ContinueAsNew {
                input: next_input,
                version: next_version,
            } => {
                turn.append_event(EventKind::ContinuedAsNew { input: next_input.clone() });
                metadata.status = Some(ExecutionStatus::ContinuedAsNew);
                orchestrator_items.push((
                    WorkItem::ContinueAsNew {
                        instance: instance.clone(),
                        name,
                        version: next_version.or(Some(version.to_string())),
                        input: next_input,
                        parent,
                    },
                    None,
                ));
            }
        }

        self.commit_turn(
            &item.lock_token,
            execution_id,
            turn.history_delta(),
            worker_items,
            timer_items,
            orchestrator_items,
            metadata,
        )
        .await;
    }

    fn version_gate(&self, pinned: &Version) -> Option<String> {
        let worker = self.options.worker_version.as_ref()?;
        let pass = match self.options.version_match {
            VersionMatchStrategy::None => true,
            VersionMatchStrategy::Strict => pinned == worker,
            VersionMatchStrategy::CurrentOrOlder => pinned <= worker,
        };
        if pass {
            None
        } else {
            Some(format!("pinned {pinned} rejected by worker {worker}"))
        }
    }

    /// Record start-plus-immediate-failure for an unresolvable orchestration.
    #[allow(clippy::too_many_arguments)]
    async fn fail_at_start(
        self: &Arc<Self>,
        lock_token: &str,
        execution_id: u64,
        mut turn: OrchestrationTurn,
        name: &str,
        requested_version: Option<&str>,
        input: String,
        parent: Option<ParentLink>,
        details: FailureDetails,
    ) {
        turn.append_event(EventKind::ExecutionStarted {
            name: name.to_string(),
            version: requested_version.unwrap_or("0.0.0").to_string(),
            input,
            parent: parent.clone(),
        });
        turn.append_event(EventKind::ExecutionFailed { details: details.clone() });
        let parent_items = parent
            .map(|p| {
                (
                    WorkItem::SubOrchFailed {
                        instance: p.instance,
                        execution_id: p.execution_id,
                        id: p.id,
                        details: details.clone(),
                    },
                    None,
                )
            })
            .into_iter()
            .collect();
        let metadata = ExecutionMetadata {
            status: Some(ExecutionStatus::Failed),
            output: Some(details.display_message()),
            custom_status: None,
        };
        self.commit_turn(lock_token, execution_id, turn.history_delta(), vec![], vec![], parent_items, metadata)
            .await;
    }

    async fn fail_execution(
        self: &Arc<Self>,
        lock_token: &str,
        execution_id: u64,
        mut turn: OrchestrationTurn,
        details: FailureDetails,
        parent: Option<ParentLink>,
    ) {
        turn.append_event(EventKind::ExecutionFailed { details: details.clone() });
        let parent_items = parent
            .map(|p| {
                (
                    WorkItem::SubOrchFailed {
                        instance: p.instance,
                        execution_id: p.execution_id,
                        id: p.id,
                        details: details.clone(),
                    },
                    None,
                )
            })
            .into_iter()
            .collect();
        let metadata = ExecutionMetadata {
            status: Some(ExecutionStatus::Failed),
            output: Some(details.display_message()),
            custom_status: None,
        };
        self.commit_turn(lock_token, execution_id, turn.history_delta(), vec![], vec![], parent_items, metadata)
            .await;
    }

    /// Ack with retry; on persistent failure release the batch for redelivery
    /// so the turn re-runs (replay makes the retry safe).
    #[allow(clippy::too_many_arguments)]
    async fn commit_turn(
        self: &Arc<Self>,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<crate::Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<(WorkItem, Option<u64>)>,
        metadata: ExecutionMetadata,
    ) {
        let mut attempts: u32 = 0;
        let max_attempts: u32 = 5;
        loop {
            let result = self
                .provider
                .ack_orchestration_item(
                    lock_token,
                    execution_id,
                    history_delta.clone(),
                    worker_items.clone(),
                    timer_items.clone(),
                    orchestrator_items.clone(),
                    metadata.clone(),
                )
                .await;
            match result {
                Ok(()) => return,
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts);
                    warn!(attempts, backoff_ms, error = %e, "ack_orchestration_item failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(error = %e, "ack_orchestration_item failed; abandoning batch");
                    self.abandon_with_delay(lock_token, Some(50)).await;
                    return;
                }
            }
        }
    }

    async fn abandon_with_delay(&self, lock_token: &str, delay_ms: Option<u64>) {
        if let Err(e) = self.provider.abandon_orchestration_item(lock_token, delay_ms).await {
            warn!(error = %e, "abandon_orchestration_item failed");
        }
    }

    fn start_work_dispatcher(self: Arc<Self>, activities: Arc<ActivityRegistry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.provider.dequeue_worker_peek_lock(self.options.lock_timeout_ms).await {
                    Ok(Some(queued)) => {
                        let WorkItem::ActivityInvoke {
                            instance,
                            execution_id,
                            id,
                            name,
                            input,
                            retry,
                        } = queued.item
                        else {
                            warn!(item = ?queued.item, "non-activity item on worker queue; dropping");
                            let _ = self.provider.abandon_worker_item(&queued.lock_token, None).await;
                            continue;
                        };
                        let completion = self
                            .run_activity(&activities, &instance, execution_id, id, &name, input, retry)
                            .await;
                        // Ack only after the completion is durably enqueued;
                        // a crash in between redelivers the invoke and the
                        // duplicate completion is dropped during replay prep.
                        if let Err(e) = self.provider.ack_worker_item(&queued.lock_token, completion).await {
                            warn!(instance = %instance, id, error = %e, "worker ack failed; item will redeliver");
                        }
                    }
                    Ok(None) => {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            self.options.dispatcher_idle_sleep_ms,
                        ))
                        .await;
                    }
                    Err(e) => {
                        warn!(error = %e, "dequeue_worker_peek_lock failed");
                        tokio::time::sleep(std::time::Duration::from_millis(
                            self.options.dispatcher_idle_sleep_ms,
                        ))
                        .await;
                    }
                }
            }
        })
    }

    /// Run one activity to its terminal outcome, applying the retry policy
    /// in-process. Individual attempts leave no trace in history.
    #[allow(clippy::too_many_arguments)]
    async fn run_activity(
        &self,
        activities: &ActivityRegistry,
        instance: &str,
        execution_id: u64,
        id: u64,
        name: &str,
        input: String,
        retry: Option<RetryPolicy>,
    ) -> WorkItem {
        let Some((_, handler)) = activities.resolve_handler(name) else {
            return WorkItem::ActivityFailed {
                instance: instance.to_string(),
                execution_id,
                id,
                details: FailureDetails::not_registered(name),
            };
        };
        let policy = retry.unwrap_or_else(|| RetryPolicy::new(1));
        let started_at = now_ms();
        let mut attempt: u32 = 1;
        loop {
            let ctx = ActivityContext {
                instance: instance.to_string(),
                execution_id,
                task_id: id,
                attempt,
            };
            match handler.invoke(ctx, input.clone()).await {
                Ok(result) => {
                    return WorkItem::ActivityCompleted {
                        instance: instance.to_string(),
                        execution_id,
                        id,
                        result,
                    };
                }
                Err(message) => {
                    let timed_out = policy
                        .retry_timeout_ms
                        .map(|t| now_ms().saturating_sub(started_at) >= t)
                        .unwrap_or(false);
                    if attempt >= policy.max_attempts || timed_out {
                        return WorkItem::ActivityFailed {
                            instance: instance.to_string(),
                            execution_id,
                            id,
                            details: FailureDetails::app(message),
                        };
                    }
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        instance = %instance,
                        id,
                        attempt,
                        delay_ms = delay,
                        error = %message,
                        "activity attempt failed; retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }
    }

    fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let idle_sleep_ms = self.options.dispatcher_idle_sleep_ms;
        let lock_timeout_ms = self.options.lock_timeout_ms;
        tokio::spawn(async move {
            // When this task is aborted the sender drops, and the service
            // drains its pending timers and exits on channel close.
            let (_service_join, service_tx) = timers::TimerService::start(self.provider.clone());
            loop {
                match self.provider.dequeue_timer_peek_lock(lock_timeout_ms).await {
                    Ok(Some(queued)) => {
                        let WorkItem::TimerSchedule {
                            instance,
                            execution_id,
                            id,
                            fire_at_ms,
                        } = queued.item
                        else {
                            warn!(item = ?queued.item, "non-timer item on timer queue; dropping");
                            let _ = self.provider.abandon_timer_item(&queued.lock_token, None).await;
                            continue;
                        };
                        let now = now_ms();
                        if fire_at_ms > now.saturating_add(lock_timeout_ms) {
                            // Too far out to hold under one lock; park it
                            // near the deadline instead.
                            let requeue = fire_at_ms - now - lock_timeout_ms / 2;
                            let _ = self
                                .provider
                                .abandon_timer_item(&queued.lock_token, Some(requeue))
                                .await;
                            continue;
                        }
                        let entry = timers::TimerEntry {
                            fire_at_ms,
                            lock_token: queued.lock_token,
                            fired: WorkItem::TimerFired {
                                instance,
                                execution_id,
                                id,
                                fire_at_ms,
                            },
                        };
                        let _ = service_tx.send(entry);
                    }
                    Ok(None) => {
                        tokio::time::sleep(std::time::Duration::from_millis(idle_sleep_ms)).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "dequeue_timer_peek_lock failed");
                        tokio::time::sleep(std::time::Duration::from_millis(idle_sleep_ms)).await;
                    }
                }
            }
        })
    }
}

fn start_fields(item: &WorkItem) -> Option<(String, Option<String>, String, Option<ParentLink>)> {
    match item {
        WorkItem::StartOrchestration {
            name,
            version,
            input,
            parent,
            ..
        }
        | WorkItem::ContinueAsNew {
            name,
            version,
            input,
            parent,
            ..
        } => Some((name.clone(), version.clone(), input.clone(), parent.clone())),
        _ => None,
    }
}
