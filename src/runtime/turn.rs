//! One orchestration turn: materialize freshly arrived completions into
//! history, replay the orchestrator function over the combined log, and
//! classify the outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::state::{BatchReader, HistorySnapshot};
use super::OrchestrationHandler;
use crate::providers::WorkItem;
use crate::{run_turn, Decision, Event, EventKind, FailureDetails};

pub(crate) enum TurnResult {
    /// Waiting on more completions.
    Continue,
    Completed { output: String },
    Failed(FailureDetails),
    ContinueAsNew { input: String, version: Option<String> },
}

pub(crate) struct OrchestrationTurn {
    instance: String,
    execution_id: u64,
    version: Option<String>,
    history: Vec<Event>,
    baseline_len: usize,
    next_seq: u64,
    pub decisions: Vec<Decision>,
}

impl OrchestrationTurn {
    pub fn new(instance: &str, execution_id: u64, version: Option<String>, history: Vec<Event>) -> Self {
        let next_seq = history.last().map(|e| e.seq + 1).unwrap_or(crate::FIRST_SEQ);
        let baseline_len = history.len();
        Self {
            instance: instance.to_string(),
            execution_id,
            version,
            history,
            baseline_len,
            next_seq,
            decisions: Vec::new(),
        }
    }

    fn append(&mut self, kind: EventKind) {
        self.history.push(Event {
            seq: self.next_seq,
            kind,
        });
        self.next_seq += 1;
    }

    /// Fold the batch's completions and raised events into history ahead of
    /// the replay. Duplicates (at-least-once queue deliveries) and stale
    /// completions from earlier executions are dropped here; raised events
    /// are always persisted so waits declared later can still consume them.
    pub fn prep_completions(&mut self, batch: &BatchReader) {
        let snapshot = HistorySnapshot::from_history(&self.history);
        let mut completed = snapshot.completed_ids;
        let scheduled = snapshot.scheduled_ids;

        for item in &batch.completions {
            let (execution_id, id) = match item {
                WorkItem::ActivityCompleted { execution_id, id, .. }
                | WorkItem::ActivityFailed { execution_id, id, .. }
                | WorkItem::TimerFired { execution_id, id, .. }
                | WorkItem::SubOrchCompleted { execution_id, id, .. }
                | WorkItem::SubOrchFailed { execution_id, id, .. } => (*execution_id, *id),
                _ => continue,
            };
            if execution_id != self.execution_id {
                tracing::debug!(
                    target: "durakit::runtime",
                    instance = %self.instance,
                    completion_execution = execution_id,
                    current_execution = self.execution_id,
                    id,
                    "dropping completion from a prior execution"
                );
                continue;
            }
            if completed.contains(&id) {
                tracing::debug!(
                    target: "durakit::runtime",
                    instance = %self.instance,
                    id,
                    "dropping duplicate completion"
                );
                continue;
            }
            if !scheduled.contains(&id) {
                tracing::warn!(
                    target: "durakit::runtime",
                    instance = %self.instance,
                    id,
                    "dropping completion with no matching scheduling event"
                );
                continue;
            }
            completed.insert(id);
            let kind = match item {
                WorkItem::ActivityCompleted { id, result, .. } => EventKind::TaskCompleted {
                    id: *id,
                    result: result.clone(),
                },
                WorkItem::ActivityFailed { id, details, .. } => EventKind::TaskFailed {
                    id: *id,
                    details: details.clone(),
                },
                WorkItem::TimerFired { id, .. } => EventKind::TimerFired { id: *id },
                WorkItem::SubOrchCompleted { id, result, .. } => EventKind::SubOrchestrationCompleted {
                    id: *id,
                    result: result.clone(),
                },
                WorkItem::SubOrchFailed { id, details, .. } => EventKind::SubOrchestrationFailed {
                    id: *id,
                    details: details.clone(),
                },
                _ => continue,
            };
            self.append(kind);
        }

        for item in &batch.raised_events {
            if let WorkItem::EventRaised { name, payload, .. } = item {
                self.append(EventKind::EventRaised {
                    name: name.clone(),
                    payload: payload.clone(),
                });
            }
        }
    }

    /// Replay the handler over the prepared history and classify the result.
    pub fn execute(&mut self, handler: Arc<dyn OrchestrationHandler>, input: String, now_ms: u64) -> TurnResult {
        let history = self.history.clone();
        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            run_turn(
                &self.instance,
                self.execution_id,
                self.version.clone(),
                history,
                now_ms,
                |ctx| handler.invoke(ctx, input),
            )
        })) {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| (*s).to_string()))
                    .unwrap_or_else(|| "orchestration panicked".to_string());
                // Prepared history stays as-is; the caller appends the
                // terminal failure on top of it.
                return TurnResult::Failed(FailureDetails {
                    kind: crate::ErrorKind::AppError,
                    message: format!("orchestration panicked: {message}"),
                    detail: None,
                });
            }
        };

        self.history = outcome.history;
        self.next_seq = self.history.last().map(|e| e.seq + 1).unwrap_or(crate::FIRST_SEQ);
        self.decisions = outcome.decisions;

        if let Some(divergence) = outcome.divergence {
            return TurnResult::Failed(FailureDetails::nondeterminism(divergence));
        }
        if let Some(can) = self.decisions.iter().find_map(|d| match d {
            Decision::ContinueAsNew { input, version } => Some((input.clone(), version.clone())),
            _ => None,
        }) {
            return TurnResult::ContinueAsNew {
                input: can.0,
                version: can.1,
            };
        }
        match outcome.output {
            Some(Ok(output)) => TurnResult::Completed { output },
            Some(Err(message)) => TurnResult::Failed(FailureDetails::app(message)),
            None => TurnResult::Continue,
        }
    }

    /// Append a runtime-produced event (start record, terminal outcome).
    pub fn append_event(&mut self, kind: EventKind) {
        self.append(kind);
    }

    /// Pin the version used for the replay pass.
    pub fn set_version(&mut self, version: String) {
        self.version = Some(version);
    }

    /// Events added this turn, in order; what the ack persists.
    pub fn history_delta(&self) -> Vec<Event> {
        self.history[self.baseline_len..].to_vec()
    }

    pub fn full_history(&self) -> &[Event] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FnOrchestration;

    fn started_history() -> Vec<Event> {
        vec![Event {
            seq: 1,
            kind: EventKind::ExecutionStarted {
                name: "T".into(),
                version: "1.0.0".into(),
                input: "in".into(),
                parent: None,
            },
        }]
    }

    #[test]
    fn duplicate_completion_is_recorded_once() {
        let mut history = started_history();
        history.push(Event {
            seq: 2,
            kind: EventKind::TaskScheduled {
                id: 1,
                name: "A".into(),
                input: String::new(),
            },
        });
        let batch = BatchReader::from_messages(&[
            WorkItem::ActivityCompleted {
                instance: "i".into(),
                execution_id: 1,
                id: 1,
                result: "ok".into(),
            },
            WorkItem::ActivityCompleted {
                instance: "i".into(),
                execution_id: 1,
                id: 1,
                result: "ok".into(),
            },
        ]);
        let mut turn = OrchestrationTurn::new("i", 1, None, history);
        turn.prep_completions(&batch);
        let completions = turn
            .full_history()
            .iter()
            .filter(|e| matches!(e.kind, EventKind::TaskCompleted { .. }))
            .count();
        assert_eq!(completions, 1);
    }

    #[test]
    fn stale_execution_completion_is_dropped() {
        let mut history = started_history();
        history.push(Event {
            seq: 2,
            kind: EventKind::TaskScheduled {
                id: 1,
                name: "A".into(),
                input: String::new(),
            },
        });
        let batch = BatchReader::from_messages(&[WorkItem::ActivityCompleted {
            instance: "i".into(),
            execution_id: 7,
            id: 1,
            result: "late".into(),
        }]);
        let mut turn = OrchestrationTurn::new("i", 1, None, history);
        turn.prep_completions(&batch);
        assert!(turn.history_delta().is_empty());
    }

    #[test]
    fn panicking_orchestration_fails_the_turn() {
        let handler: Arc<dyn OrchestrationHandler> = Arc::new(FnOrchestration(
            |_ctx: crate::OrchestrationContext, _input: String| async move {
                panic!("boom");
                #[allow(unreachable_code)]
                Ok(String::new())
            },
        ));
        let mut turn = OrchestrationTurn::new("i", 1, None, started_history());
        let result = turn.execute(handler, "in".into(), 1_000);
        match result {
            TurnResult::Failed(details) => assert!(details.message.contains("boom")),
            _ => panic!("expected failure"),
        }
    }

    #[test]
    fn raised_events_always_persist() {
        let batch = BatchReader::from_messages(&[WorkItem::EventRaised {
            instance: "i".into(),
            name: "early".into(),
            payload: "p".into(),
        }]);
        let mut turn = OrchestrationTurn::new("i", 1, None, started_history());
        turn.prep_completions(&batch);
        assert!(matches!(
            turn.history_delta().as_slice(),
            [Event {
                kind: EventKind::EventRaised { .. },
                ..
            }]
        ));
    }
}
