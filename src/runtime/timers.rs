//! In-process timer service for providers without native delayed visibility.
//!
//! The timer dispatcher feeds locked timer-queue items in over an unbounded
//! channel; this service holds them in a min-heap and, when a deadline is
//! reached, acks the item with its fired notification. The lock token rides
//! along so the ack lands on the original peek-locked message.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::providers::{Provider, WorkItem};

pub(crate) struct TimerEntry {
    pub fire_at_ms: u64,
    pub lock_token: String,
    pub fired: WorkItem,
}

pub(crate) struct TimerService {
    provider: Arc<dyn Provider>,
    rx: mpsc::UnboundedReceiver<TimerEntry>,
    heap: BinaryHeap<Reverse<(u64, u64)>>,
    entries: HashMap<u64, TimerEntry>,
    next_key: u64,
}

impl TimerService {
    pub fn start(
        provider: Arc<dyn Provider>,
    ) -> (tokio::task::JoinHandle<()>, mpsc::UnboundedSender<TimerEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut service = TimerService {
            provider,
            rx,
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_key: 0,
        };
        let handle = tokio::spawn(async move { service.run().await });
        (handle, tx)
    }

    fn insert(&mut self, entry: TimerEntry) {
        self.next_key += 1;
        self.heap.push(Reverse((entry.fire_at_ms, self.next_key)));
        self.entries.insert(self.next_key, entry);
    }

    async fn run(&mut self) {
        loop {
            self.fire_due().await;

            let next_deadline = self.heap.peek().map(|Reverse((ts, _))| *ts);
            match next_deadline {
                None => match self.rx.recv().await {
                    Some(entry) => self.insert(entry),
                    // Channel closed and nothing pending: shut down.
                    None => return,
                },
                Some(deadline) => {
                    let now = crate::providers::now_ms();
                    let wait = std::time::Duration::from_millis(deadline.saturating_sub(now));
                    tokio::select! {
                        received = self.rx.recv() => match received {
                            Some(entry) => self.insert(entry),
                            None => {
                                // Drain remaining deadlines before exiting.
                                self.drain().await;
                                return;
                            }
                        },
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    async fn fire_due(&mut self) {
        let now = crate::providers::now_ms();
        while matches!(self.heap.peek(), Some(Reverse((ts, _))) if *ts <= now) {
            if let Some(Reverse((_, key))) = self.heap.pop() {
                if let Some(entry) = self.entries.remove(&key) {
                    self.ack(entry).await;
                }
            }
        }
    }

    async fn drain(&mut self) {
        while let Some(Reverse((ts, key))) = self.heap.pop() {
            let now = crate::providers::now_ms();
            if ts > now {
                tokio::time::sleep(std::time::Duration::from_millis(ts - now)).await;
            }
            if let Some(entry) = self.entries.remove(&key) {
                self.ack(entry).await;
            }
        }
    }

    async fn ack(&self, entry: TimerEntry) {
        if let Err(e) = self.provider.ack_timer_item(&entry.lock_token, entry.fired.clone()).await {
            // An expired lock means the item was redelivered elsewhere; the
            // duplicate fired-notification is dropped during replay prep.
            tracing::warn!(
                target: "durakit::runtime::timers",
                error = %e,
                item = ?entry.fired,
                "timer ack failed"
            );
        }
    }
}
