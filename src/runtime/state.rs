//! History and work-item batch inspection helpers used by the orchestration
//! dispatcher before and after each replay turn.

use std::collections::HashSet;

use crate::providers::WorkItem;
use crate::{Event, EventKind, ParentLink};

/// What an execution's stored history says about it, computed in one scan.
pub(crate) struct HistorySnapshot {
    pub started: Option<StartInfo>,
    pub terminal: Option<EventKind>,
    /// Correlation ids of scheduling events present in history.
    pub scheduled_ids: HashSet<u64>,
    /// Correlation ids already resolved by a completion event.
    pub completed_ids: HashSet<u64>,
}

#[derive(Clone)]
pub(crate) struct StartInfo {
    pub name: String,
    pub version: String,
    pub parent: Option<ParentLink>,
}

impl HistorySnapshot {
    pub fn from_history(history: &[Event]) -> Self {
        let mut snapshot = Self {
            started: None,
            terminal: None,
            scheduled_ids: HashSet::new(),
            completed_ids: HashSet::new(),
        };
        for event in history {
            match &event.kind {
                EventKind::ExecutionStarted {
                    name,
                    version,
                    parent,
                    ..
                } => {
                    snapshot.started = Some(StartInfo {
                        name: name.clone(),
                        version: version.clone(),
                        parent: parent.clone(),
                    });
                }
                EventKind::ExecutionCompleted { .. }
                | EventKind::ExecutionFailed { .. }
                | EventKind::ExecutionTerminated { .. }
                | EventKind::ContinuedAsNew { .. } => {
                    snapshot.terminal = Some(event.kind.clone());
                }
                EventKind::TaskScheduled { id, .. }
                | EventKind::TimerCreated { id, .. }
                | EventKind::SubOrchestrationScheduled { id, .. } => {
                    snapshot.scheduled_ids.insert(*id);
                }
                EventKind::TaskCompleted { id, .. }
                | EventKind::TaskFailed { id, .. }
                | EventKind::TimerFired { id }
                | EventKind::SubOrchestrationCompleted { id, .. }
                | EventKind::SubOrchestrationFailed { id, .. } => {
                    snapshot.completed_ids.insert(*id);
                }
                EventKind::EventRaised { .. } | EventKind::SystemCall { .. } => {}
            }
        }
        snapshot
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }
}

/// A fetched orchestrator batch split by role, preserving arrival order for
/// completions and raised events.
pub(crate) struct BatchReader {
    pub start: Option<WorkItem>,
    pub continue_as_new: Option<WorkItem>,
    pub terminate_reason: Option<String>,
    pub completions: Vec<WorkItem>,
    pub raised_events: Vec<WorkItem>,
}

impl BatchReader {
    pub fn from_messages(messages: &[WorkItem]) -> Self {
        let mut reader = Self {
            start: None,
            continue_as_new: None,
            terminate_reason: None,
            completions: Vec::new(),
            raised_events: Vec::new(),
        };
        for item in messages {
            match item {
                WorkItem::StartOrchestration { .. } => {
                    if reader.start.is_none() {
                        reader.start = Some(item.clone());
                    }
                }
                WorkItem::ContinueAsNew { .. } => {
                    if reader.continue_as_new.is_none() {
                        reader.continue_as_new = Some(item.clone());
                    }
                }
                WorkItem::TerminateInstance { reason, .. } => {
                    if reader.terminate_reason.is_none() {
                        reader.terminate_reason = Some(reason.clone());
                    }
                }
                WorkItem::EventRaised { .. } => reader.raised_events.push(item.clone()),
                WorkItem::ActivityCompleted { .. }
                | WorkItem::ActivityFailed { .. }
                | WorkItem::TimerFired { .. }
                | WorkItem::SubOrchCompleted { .. }
                | WorkItem::SubOrchFailed { .. } => reader.completions.push(item.clone()),
                WorkItem::ActivityInvoke { .. } | WorkItem::TimerSchedule { .. } => {
                    tracing::warn!(
                        target: "durakit::runtime",
                        item = ?item,
                        "dispatch-queue item found on orchestrator queue; dropping"
                    );
                }
            }
        }
        reader
    }
}
