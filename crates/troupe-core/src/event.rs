use std::sync::Arc;

use tracing::{info, warn};

use crate::traits::EventSink;
use crate::types::AgentEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: AgentEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: AgentEvent) {
        self.publish(event);
    }
}

/// Forwards lifecycle events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: AgentEvent) {
        match &event {
            AgentEvent::TaskFailed { task, error } => {
                warn!(event = %event.name(), task = %task, error = %error, "Task failed");
            }
            AgentEvent::HandoffRejected {
                source, target, ..
            } => {
                warn!(
                    event = %event.name(),
                    source = %source,
                    target = %target,
                    "Handoff rejected"
                );
            }
            _ => info!(event = %event.name(), detail = ?event, "Lifecycle event"),
        }
    }
}

/// Sends every event to each wrapped sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: AgentEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(AgentEvent::TaskStarted {
            task: "t".into(),
            agent: "a".into(),
        });
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.name(), "task_started");
    }

    #[tokio::test]
    async fn fanout_reaches_every_sink() {
        let a = Arc::new(EventBus::default());
        let b = Arc::new(EventBus::default());
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();

        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());
        fanout.emit(AgentEvent::RunStarted {
            mode: "parallel".into(),
            tasks: 2,
        });

        assert_eq!(rx_a.recv().await.unwrap().name(), "run_started");
        assert_eq!(rx_b.recv().await.unwrap().name(), "run_started");
    }
}
