//! In-memory provider for tests and examples. Single mutex around the whole
//! store; peek-locks are modeled with per-message lock tokens and expiry so
//! lease-loss paths behave like a real store. Delayed visibility is not
//! supported, which forces the runtime's timer service into play.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::Mutex;

use super::{
    now_ms, ExecutionMetadata, ExecutionStatus, InstanceRecord, OrchestrationItem, Provider,
    ProviderError, QueuedItem, WorkItem,
};
use crate::{Event, INITIAL_EXECUTION_ID};

struct InstanceState {
    executions: BTreeMap<u64, Vec<Event>>,
    status: ExecutionStatus,
    output: Option<String>,
    custom_status: Option<String>,
    suspended: bool,
    created_at_ms: u64,
    updated_at_ms: u64,
}

struct QueueMsg {
    id: u64,
    item: WorkItem,
    visible_at_ms: u64,
    lock: Option<(String, u64)>,
}

impl QueueMsg {
    fn available(&self, now: u64) -> bool {
        self.visible_at_ms <= now && !self.locked(now)
    }

    fn locked(&self, now: u64) -> bool {
        matches!(&self.lock, Some((_, until)) if *until > now)
    }
}

#[derive(Default)]
struct State {
    instances: HashMap<String, InstanceState>,
    orchestrator_queue: Vec<QueueMsg>,
    worker_queue: Vec<QueueMsg>,
    timer_queue: Vec<QueueMsg>,
    next_msg_id: u64,
}

impl State {
    fn push(queue: &mut Vec<QueueMsg>, next_id: &mut u64, item: WorkItem, visible_at_ms: u64) {
        *next_id += 1;
        queue.push(QueueMsg {
            id: *next_id,
            item,
            visible_at_ms,
            lock: None,
        });
    }
}

/// Everything in one process; suitable for tests and single-node demos.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let state = self.state.lock().await;
        Ok(state
            .instances
            .get(instance)
            .and_then(|i| i.executions.values().next_back().cloned())
            .unwrap_or_default())
    }

    async fn read_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ProviderError> {
        let state = self.state.lock().await;
        Ok(state
            .instances
            .get(instance)
            .and_then(|i| i.executions.get(&execution_id).cloned())
            .unwrap_or_default())
    }

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        let state = self.state.lock().await;
        Ok(state
            .instances
            .get(instance)
            .and_then(|i| i.executions.keys().next_back().copied()))
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.instances.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        let state = self.state.lock().await;
        Ok(state
            .instances
            .get(instance)
            .map(|i| i.executions.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        if state.instances.contains_key(instance) {
            return Err(ProviderError::permanent(
                "create_instance",
                format!("instance already exists: {instance}"),
            ));
        }
        let now = now_ms();
        state.instances.insert(
            instance.to_string(),
            InstanceState {
                executions: BTreeMap::from([(INITIAL_EXECUTION_ID, Vec::new())]),
                status: ExecutionStatus::Pending,
                output: None,
                custom_status: None,
                suspended: false,
                created_at_ms: now,
                updated_at_ms: now,
            },
        );
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        if state.instances.remove(instance).is_none() {
            return Err(ProviderError::permanent(
                "remove_instance",
                format!("instance not found: {instance}"),
            ));
        }
        state.orchestrator_queue.retain(|m| m.item.instance() != instance);
        state.worker_queue.retain(|m| m.item.instance() != instance);
        state.timer_queue.retain(|m| m.item.instance() != instance);
        Ok(())
    }

    async fn instance_record(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        let state = self.state.lock().await;
        Ok(state.instances.get(instance).map(|i| InstanceRecord {
            instance: instance.to_string(),
            current_execution_id: i.executions.keys().next_back().copied().unwrap_or(INITIAL_EXECUTION_ID),
            status: i.status,
            output: i.output.clone(),
            custom_status: i.custom_status.clone(),
            suspended: i.suspended,
            created_at_ms: i.created_at_ms,
            updated_at_ms: i.updated_at_ms,
        }))
    }

    async fn set_suspended(&self, instance: &str, suspended: bool) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let record = state.instances.get_mut(instance).ok_or_else(|| {
            ProviderError::permanent("set_suspended", format!("instance not found: {instance}"))
        })?;
        record.suspended = suspended;
        record.updated_at_ms = now_ms();
        Ok(())
    }

    async fn enqueue_orchestrator_work(
        &self,
        item: WorkItem,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let visible_at = now_ms() + delay_ms.unwrap_or(0);
        let State {
            orchestrator_queue,
            next_msg_id,
            ..
        } = &mut *state;
        State::push(orchestrator_queue, next_msg_id, item, visible_at);
        Ok(())
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout_ms: u64,
    ) -> Result<Option<OrchestrationItem>, ProviderError> {
        let mut state = self.state.lock().await;
        let now = now_ms();

        // Pick the first visible message whose instance is deliverable: not
        // under a live lock (at most one active replay per instance) and not
        // suspended unless a terminate is pending for it.
        let candidate_instance = {
            let queue = &state.orchestrator_queue;
            queue
                .iter()
                .filter(|m| m.available(now))
                .find(|m| {
                    let instance = m.item.instance();
                    let lock_held = queue
                        .iter()
                        .any(|o| o.item.instance() == instance && o.locked(now));
                    if lock_held {
                        return false;
                    }
                    let suspended = state
                        .instances
                        .get(instance)
                        .map(|i| i.suspended)
                        .unwrap_or(false);
                    if suspended {
                        return queue.iter().any(|o| {
                            o.item.instance() == instance && o.available(now) && o.item.is_terminate()
                        });
                    }
                    true
                })
                .map(|m| m.item.instance().to_string())
        };
        let Some(instance) = candidate_instance else {
            return Ok(None);
        };

        let lock_token = crate::fresh_guid();
        let locked_until = now + lock_timeout_ms;
        let mut messages = Vec::new();
        for msg in state
            .orchestrator_queue
            .iter_mut()
            .filter(|m| m.item.instance() == instance && m.available(now))
        {
            msg.lock = Some((lock_token.clone(), locked_until));
            messages.push(msg.item.clone());
        }

        let (execution_id, history) = state
            .instances
            .get(&instance)
            .and_then(|i| i.executions.iter().next_back())
            .map(|(id, h)| (*id, h.clone()))
            .unwrap_or((INITIAL_EXECUTION_ID, Vec::new()));

        Ok(Some(OrchestrationItem {
            instance,
            execution_id,
            history,
            messages,
            lock_token,
        }))
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<(WorkItem, Option<u64>)>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let now = now_ms();

        let locked: Vec<u64> = state
            .orchestrator_queue
            .iter()
            .filter(|m| matches!(&m.lock, Some((t, until)) if t == lock_token && *until > now))
            .map(|m| m.id)
            .collect();
        if locked.is_empty() {
            return Err(ProviderError::permanent(
                "ack_orchestration_item",
                "lock token unknown or expired",
            ));
        }
        let instance = state
            .orchestrator_queue
            .iter()
            .find(|m| locked.contains(&m.id))
            .map(|m| m.item.instance().to_string())
            .unwrap_or_default();

        // History is append-only: every delta seq must land above the stored tail.
        {
            // Child instances are materialized on first ack rather than by an
            // explicit create call.
            let record = state.instances.entry(instance.clone()).or_insert_with(|| InstanceState {
                executions: BTreeMap::new(),
                status: ExecutionStatus::Pending,
                output: None,
                custom_status: None,
                suspended: false,
                created_at_ms: now,
                updated_at_ms: now,
            });
            let history = record.executions.entry(execution_id).or_default();
            let mut tail = history.last().map(|e| e.seq).unwrap_or(0);
            for event in history_delta {
                if event.seq <= tail {
                    return Err(ProviderError::permanent(
                        "ack_orchestration_item",
                        format!("non-increasing seq {} after {tail}", event.seq),
                    ));
                }
                tail = event.seq;
                history.push(event);
            }
            if let Some(status) = metadata.status {
                record.status = status;
            }
            if let Some(output) = metadata.output {
                record.output = Some(output);
            }
            if let Some(custom) = metadata.custom_status {
                record.custom_status = custom;
            }
            record.updated_at_ms = now;
        }

        state.orchestrator_queue.retain(|m| !locked.contains(&m.id));

        let State {
            orchestrator_queue,
            worker_queue,
            timer_queue,
            next_msg_id,
            ..
        } = &mut *state;
        for item in worker_items {
            State::push(worker_queue, next_msg_id, item, now);
        }
        for item in timer_items {
            State::push(timer_queue, next_msg_id, item, now);
        }
        for (item, delay) in orchestrator_items {
            State::push(orchestrator_queue, next_msg_id, item, now + delay.unwrap_or(0));
        }
        Ok(())
    }

    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let now = now_ms();
        let mut released = false;
        for msg in state
            .orchestrator_queue
            .iter_mut()
            .filter(|m| matches!(&m.lock, Some((t, _)) if t == lock_token))
        {
            msg.lock = None;
            msg.visible_at_ms = now + delay_ms.unwrap_or(0);
            released = true;
        }
        if !released {
            return Err(ProviderError::permanent(
                "abandon_orchestration_item",
                "lock token unknown",
            ));
        }
        Ok(())
    }

    async fn dequeue_worker_peek_lock(
        &self,
        lock_timeout_ms: u64,
    ) -> Result<Option<QueuedItem>, ProviderError> {
        let mut state = self.state.lock().await;
        let now = now_ms();
        let Some(msg) = state.worker_queue.iter_mut().find(|m| m.available(now)) else {
            return Ok(None);
        };
        let token = crate::fresh_guid();
        msg.lock = Some((token.clone(), now + lock_timeout_ms));
        Ok(Some(QueuedItem {
            item: msg.item.clone(),
            lock_token: token,
        }))
    }

    async fn ack_worker_item(
        &self,
        lock_token: &str,
        completion: WorkItem,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let now = now_ms();
        let valid = state
            .worker_queue
            .iter()
            .any(|m| matches!(&m.lock, Some((t, until)) if t == lock_token && *until > now));
        if !valid {
            return Err(ProviderError::permanent(
                "ack_worker_item",
                "lock token unknown or expired",
            ));
        }
        state
            .worker_queue
            .retain(|m| !matches!(&m.lock, Some((t, _)) if t == lock_token));
        let State {
            orchestrator_queue,
            next_msg_id,
            ..
        } = &mut *state;
        State::push(orchestrator_queue, next_msg_id, completion, now);
        Ok(())
    }

    async fn abandon_worker_item(
        &self,
        lock_token: &str,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let now = now_ms();
        let Some(msg) = state
            .worker_queue
            .iter_mut()
            .find(|m| matches!(&m.lock, Some((t, _)) if t == lock_token))
        else {
            return Err(ProviderError::permanent("abandon_worker_item", "lock token unknown"));
        };
        msg.lock = None;
        msg.visible_at_ms = now + delay_ms.unwrap_or(0);
        Ok(())
    }

    async fn dequeue_timer_peek_lock(
        &self,
        lock_timeout_ms: u64,
    ) -> Result<Option<QueuedItem>, ProviderError> {
        let mut state = self.state.lock().await;
        let now = now_ms();
        let Some(msg) = state.timer_queue.iter_mut().find(|m| m.available(now)) else {
            return Ok(None);
        };
        let token = crate::fresh_guid();
        msg.lock = Some((token.clone(), now + lock_timeout_ms));
        Ok(Some(QueuedItem {
            item: msg.item.clone(),
            lock_token: token,
        }))
    }

    async fn abandon_timer_item(
        &self,
        lock_token: &str,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let now = now_ms();
        let Some(msg) = state
            .timer_queue
            .iter_mut()
            .find(|m| matches!(&m.lock, Some((t, _)) if t == lock_token))
        else {
            return Err(ProviderError::permanent("abandon_timer_item", "lock token unknown"));
        };
        msg.lock = None;
        msg.visible_at_ms = now + delay_ms.unwrap_or(0);
        Ok(())
    }

    async fn ack_timer_item(&self, lock_token: &str, fired: WorkItem) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let now = now_ms();
        let valid = state
            .timer_queue
            .iter()
            .any(|m| matches!(&m.lock, Some((t, until)) if t == lock_token && *until > now));
        if !valid {
            return Err(ProviderError::permanent(
                "ack_timer_item",
                "lock token unknown or expired",
            ));
        }
        state
            .timer_queue
            .retain(|m| !matches!(&m.lock, Some((t, _)) if t == lock_token));
        let State {
            orchestrator_queue,
            next_msg_id,
            ..
        } = &mut *state;
        State::push(orchestrator_queue, next_msg_id, fired, now);
        Ok(())
    }
}
