//! Instance-management client. Talks to the system exclusively through the
//! shared provider: starts enqueue work, queries read history and the
//! instance record, and nothing here touches the dispatchers directly.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::providers::{ExecutionStatus, Provider, ProviderError, WorkItem};
use crate::{codec, Event, EventKind, FailureDetails, OrchestrationStatus};

/// Errors surfaced by client operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Duplicate start for an existing instance id.
    InstanceExists(String),
    InstanceNotFound(String),
    InvalidInput(String),
    Provider(ProviderError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::InstanceExists(id) => write!(f, "instance already exists: {id}"),
            ClientError::InstanceNotFound(id) => write!(f, "instance not found: {id}"),
            ClientError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            ClientError::Provider(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        ClientError::Provider(e)
    }
}

/// Error from `wait_for_orchestration`.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

/// Instance metadata returned by `get_orchestration_metadata`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestrationMetadata {
    pub instance: String,
    pub name: String,
    pub version: String,
    pub status: OrchestrationStatus,
    pub custom_status: Option<String>,
    pub current_execution_id: u64,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    /// Present only when requested with `include_io`.
    pub input: Option<String>,
    pub output: Option<String>,
}

pub struct Client {
    provider: Arc<dyn Provider>,
}

impl Client {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    /// Start an orchestration under a caller-chosen instance id. Registers
    /// the instance first so a duplicate id is rejected before any message
    /// is enqueued.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.start_inner(instance, orchestration, None, input.into()).await
    }

    /// Start pinned to a specific registered version.
    pub async fn start_orchestration_versioned(
        &self,
        instance: &str,
        orchestration: &str,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.start_inner(instance, orchestration, Some(version.into()), input.into())
            .await
    }

    /// Start with typed input (JSON-encoded).
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<(), ClientError> {
        let payload = codec::encode(input).map_err(ClientError::InvalidInput)?;
        self.start_inner(instance, orchestration, None, payload).await
    }

    /// Start under a generated instance id; returns the id.
    pub async fn start_new(
        &self,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<String, ClientError> {
        let instance = crate::fresh_guid();
        self.start_inner(&instance, orchestration, None, input.into()).await?;
        Ok(instance)
    }

    async fn start_inner(
        &self,
        instance: &str,
        orchestration: &str,
        version: Option<String>,
        input: String,
    ) -> Result<(), ClientError> {
        if instance.is_empty() {
            return Err(ClientError::InvalidInput("empty instance id".into()));
        }
        match self.provider.create_instance(instance).await {
            Ok(()) => {}
            Err(e) if !e.is_retryable() && e.message.contains("already exists") => {
                return Err(ClientError::InstanceExists(instance.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        self.provider
            .enqueue_orchestrator_work(
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    name: orchestration.to_string(),
                    version,
                    input,
                    parent: None,
                },
                None,
            )
            .await?;
        Ok(())
    }

    /// Deliver an external event. If no wait is outstanding the event buffers
    /// in history until one is declared.
    pub async fn raise_event(
        &self,
        instance: &str,
        event_name: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.ensure_exists(instance).await?;
        self.provider
            .enqueue_orchestrator_work(
                WorkItem::EventRaised {
                    instance: instance.to_string(),
                    name: event_name.into(),
                    payload: payload.into(),
                },
                None,
            )
            .await?;
        Ok(())
    }

    /// Request termination; the runtime records a terminal event on the next
    /// dispatch, bypassing orchestrator code.
    pub async fn terminate_instance(
        &self,
        instance: &str,
        reason: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.ensure_exists(instance).await?;
        self.provider
            .enqueue_orchestrator_work(
                WorkItem::TerminateInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
                None,
            )
            .await?;
        Ok(())
    }

    /// Pause delivery of orchestrator work; pending and future messages
    /// buffer until resume. Terminate still gets through.
    pub async fn suspend_instance(&self, instance: &str) -> Result<(), ClientError> {
        Ok(self.provider.set_suspended(instance, true).await?)
    }

    pub async fn resume_instance(&self, instance: &str) -> Result<(), ClientError> {
        Ok(self.provider.set_suspended(instance, false).await?)
    }

    /// Remove the instance entirely: record, all execution histories, queued
    /// messages.
    pub async fn purge_instance(&self, instance: &str) -> Result<(), ClientError> {
        Ok(self.provider.remove_instance(instance).await?)
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.provider.list_instances().await?)
    }

    pub async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ClientError> {
        Ok(self.provider.list_executions(instance).await?)
    }

    pub async fn get_execution_history(
        &self,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ClientError> {
        Ok(self.provider.read_with_execution(instance, execution_id).await?)
    }

    /// Current lifecycle status, derived from the instance record and the
    /// latest execution's history.
    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, ClientError> {
        let Some(record) = self.provider.instance_record(instance).await? else {
            return Ok(OrchestrationStatus::NotFound);
        };
        if record.suspended && !matches!(record.status, ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Terminated) {
            return Ok(OrchestrationStatus::Suspended);
        }
        let history = self.provider.read(instance).await?;
        Ok(derive_status(&record.status, &history))
    }

    /// Full metadata view. `include_io` additionally loads the execution's
    /// input and terminal output.
    pub async fn get_orchestration_metadata(
        &self,
        instance: &str,
        include_io: bool,
    ) -> Result<Option<OrchestrationMetadata>, ClientError> {
        let Some(record) = self.provider.instance_record(instance).await? else {
            return Ok(None);
        };
        let history = self.provider.read(instance).await?;
        let (name, version, input) = history
            .iter()
            .find_map(|e| match &e.kind {
                EventKind::ExecutionStarted {
                    name,
                    version,
                    input,
                    ..
                } => Some((name.clone(), version.clone(), input.clone())),
                _ => None,
            })
            .unwrap_or_default();
        let status = if record.suspended
            && !matches!(record.status, ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Terminated)
        {
            OrchestrationStatus::Suspended
        } else {
            derive_status(&record.status, &history)
        };
        Ok(Some(OrchestrationMetadata {
            instance: record.instance,
            name,
            version,
            status,
            custom_status: record.custom_status,
            current_execution_id: record.current_execution_id,
            created_at_ms: record.created_at_ms,
            updated_at_ms: record.updated_at_ms,
            input: include_io.then_some(input),
            output: if include_io { record.output } else { None },
        }))
    }

    /// Poll until the instance reaches a terminal status or `timeout` passes.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self
                .get_orchestration_status(instance)
                .await
                .map_err(|e| WaitError::Other(e.to_string()))?;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Like `wait_for_orchestration`, decoding a completed output as JSON.
    pub async fn wait_for_output_typed<Out: serde::de::DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Out, WaitError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => {
                codec::decode(&output).map_err(WaitError::Other)
            }
            other => Err(WaitError::Other(format!("not completed: {other:?}"))),
        }
    }

    async fn ensure_exists(&self, instance: &str) -> Result<(), ClientError> {
        if self.provider.instance_record(instance).await?.is_none() {
            return Err(ClientError::InstanceNotFound(instance.to_string()));
        }
        Ok(())
    }
}

/// Map the denormalized record status plus latest history onto the
/// client-facing status, pulling terminal payloads out of history.
fn derive_status(record_status: &ExecutionStatus, history: &[Event]) -> OrchestrationStatus {
    for event in history.iter().rev() {
        match &event.kind {
            EventKind::ExecutionCompleted { output } => {
                return OrchestrationStatus::Completed {
                    output: output.clone(),
                }
            }
            EventKind::ExecutionFailed { details } => {
                return OrchestrationStatus::Failed {
                    details: details.clone(),
                }
            }
            EventKind::ExecutionTerminated { reason } => {
                return OrchestrationStatus::Terminated {
                    reason: reason.clone(),
                }
            }
            EventKind::ContinuedAsNew { .. } => return OrchestrationStatus::ContinuedAsNew,
            _ => {}
        }
    }
    match record_status {
        ExecutionStatus::Pending => OrchestrationStatus::Pending,
        ExecutionStatus::Terminated => OrchestrationStatus::Terminated {
            reason: String::new(),
        },
        ExecutionStatus::Failed => OrchestrationStatus::Failed {
            details: FailureDetails::app("failed"),
        },
        _ if history.is_empty() => OrchestrationStatus::Pending,
        _ => OrchestrationStatus::Running,
    }
}
