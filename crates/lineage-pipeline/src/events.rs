//! Event log: the append-only, per-run source of truth for what happened.
//!
//! Appends are serialized per store, so every subscriber observes a run's
//! events in append order. A live [`EventSubscription`] first replays the
//! existing log and then follows new appends until the run's terminal event,
//! at which point the subscription closes.

use std::collections::HashMap;

use async_trait::async_trait;
use lineage_types::{Result, RunId, StepEvent};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Append an event and return it with its assigned sequence number.
    async fn append_event(&self, event: StepEvent) -> Result<StepEvent>;

    /// Replay a run's log in append order.
    async fn get_events(&self, run_id: &str) -> Result<Vec<StepEvent>>;

    /// Follow a run's log live. Closes once the run's terminal event is seen.
    async fn subscribe(&self, run_id: &str) -> Result<EventSubscription>;
}

/// Cancellable handle delivering a run's events in order.
///
/// Dropping the handle (or calling [`close`](Self::close)) unsubscribes.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: mpsc::UnboundedReceiver<StepEvent>,
}

impl EventSubscription {
    /// Next event, or `None` once the run has finished and the backlog is drained.
    pub async fn next(&mut self) -> Option<StepEvent> {
        self.receiver.recv().await
    }

    /// Stop receiving new events. Already-buffered events can still be drained.
    pub fn close(&mut self) {
        self.receiver.close();
    }

    /// Wait for the run to finish and return everything delivered.
    pub async fn collect(mut self) -> Vec<StepEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<StepEvent> {
        UnboundedReceiverStream::new(self.receiver)
    }
}

/// One run's log plus its live subscribers. Shared by the in-memory and
/// filesystem event stores.
#[derive(Debug, Default)]
pub(crate) struct RunLog {
    events: Vec<StepEvent>,
    subscribers: Vec<mpsc::UnboundedSender<StepEvent>>,
    closed: bool,
}

impl RunLog {
    pub(crate) fn from_events(events: Vec<StepEvent>) -> Self {
        let closed = events
            .iter()
            .any(|e| e.kind.terminal_run_status().is_some());
        Self {
            events,
            subscribers: Vec::new(),
            closed,
        }
    }

    /// Assign the next sequence number and fan the event out.
    pub(crate) fn push(&mut self, mut event: StepEvent) -> StepEvent {
        event.sequence = self.events.len() as u64;
        self.events.push(event.clone());
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if event.kind.terminal_run_status().is_some() {
            self.closed = true;
            self.subscribers.clear();
        }
        event
    }

    pub(crate) fn subscribe(&mut self) -> EventSubscription {
        let (tx, receiver) = mpsc::unbounded_channel();
        for event in &self.events {
            let _ = tx.send(event.clone());
        }
        if !self.closed {
            self.subscribers.push(tx);
        }
        EventSubscription { receiver }
    }

    pub(crate) fn events(&self) -> &[StepEvent] {
        &self.events
    }

    /// A terminal run event has been recorded; nothing further is expected.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Reference event log kept entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    runs: Mutex<HashMap<RunId, RunLog>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLogStore for InMemoryEventLog {
    async fn append_event(&self, event: StepEvent) -> Result<StepEvent> {
        let mut runs = self.runs.lock().await;
        let log = runs.entry(event.run_id.clone()).or_default();
        let event = log.push(event);
        tracing::trace!(run_id = %event.run_id, sequence = event.sequence, kind = ?event.kind, "Event appended");
        Ok(event)
    }

    async fn get_events(&self, run_id: &str) -> Result<Vec<StepEvent>> {
        let runs = self.runs.lock().await;
        Ok(runs
            .get(run_id)
            .map(|log| log.events().to_vec())
            .unwrap_or_default())
    }

    async fn subscribe(&self, run_id: &str) -> Result<EventSubscription> {
        let mut runs = self.runs.lock().await;
        Ok(runs.entry(run_id.to_string()).or_default().subscribe())
    }
}
