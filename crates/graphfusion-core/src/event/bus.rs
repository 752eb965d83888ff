//! Run-progress fan-out over `tokio::sync::broadcast`.
//!
//! The coordinator and step runners publish; observers subscribe. A send with
//! nobody listening is dropped, and a subscriber that falls more than the
//! channel capacity behind loses the oldest events instead of stalling a run.

use graphfusion_types::event::WorkflowEvent;
use tokio::sync::broadcast;

/// Sender side of the workflow event channel. Clones publish into the same
/// channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// `capacity` is the number of events retained per lagging subscriber;
    /// zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: WorkflowEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("workflow event dropped, no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
