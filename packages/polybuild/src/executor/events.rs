//! Build event stream: an MPMC broadcast of immutable, timestamped events
//! consumed by renderers and other subscribers.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;

use crate::graph::TargetId;

/// Default channel capacity; a slow subscriber that falls this far behind
/// starts missing events (reported to it as a lagged-receiver error) rather
/// than applying backpressure to the scheduler.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum MessageLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One immutable, timestamped build event.
#[derive(Clone, Debug)]
pub enum Event {
    BuildStarted {
        total_targets: usize,
        parallelism: usize,
        t: i64,
    },
    TargetStarted {
        id: TargetId,
        t: i64,
    },
    TargetCompleted {
        id: TargetId,
        duration_ms: u64,
        output_size: u64,
        t: i64,
    },
    TargetCached {
        id: TargetId,
        t: i64,
    },
    TargetFailed {
        id: TargetId,
        reason: String,
        t: i64,
    },
    TargetCancelled {
        id: TargetId,
        t: i64,
    },
    TargetProgress {
        id: TargetId,
        fraction: f32,
        t: i64,
    },
    BuildCompleted {
        built: usize,
        cached: usize,
        failed: usize,
        duration_ms: u64,
        t: i64,
    },
    Message {
        level: MessageLevel,
        text: String,
        t: i64,
    },
}

/// Single-producer-multiple-subscriber event bus for one build.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publication is a lock-free enqueue; a send with no subscribers is not
    /// an error (the build doesn't require anyone to be listening).
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::Message {
            level: MessageLevel::Info,
            text: "hello".to_string(),
            t: now_millis(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::Message { .. }));
    }
}
