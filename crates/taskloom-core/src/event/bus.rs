//! In-process fan-out of [`EngineEvent`]s.
//!
//! Delivery is best effort: a subscriber that falls more than the channel
//! capacity behind skips ahead and is told how many events it lost. The
//! store, not the bus, is the record of what happened.

use taskloom_types::event::EngineEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Receive only the events that concern one workflow run.
    pub fn subscribe_run(&self, workflow_run_id: Uuid) -> RunSubscription {
        RunSubscription {
            workflow_run_id,
            receiver: self.sender.subscribe(),
        }
    }

    /// Returns how many subscribers the event reached.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// A subscription filtered to a single workflow run.
pub struct RunSubscription {
    workflow_run_id: Uuid,
    receiver: broadcast::Receiver<EngineEvent>,
}

impl RunSubscription {
    /// Next event for this run, or `None` once the bus is gone.
    ///
    /// Lag is logged and skipped over.
    pub async fn next(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.workflow_run_id() == Some(self.workflow_run_id) => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(workflow_run_id = %self.workflow_run_id, skipped, "run subscription lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use taskloom_types::run::{StepRunStatus, WorkflowRunStatus};

    use super::*;

    fn run_status(workflow_run_id: Uuid, status: WorkflowRunStatus) -> EngineEvent {
        EngineEvent::WorkflowRunStatusChanged {
            workflow_run_id,
            status,
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_each_event() {
        let bus = EventBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.clone().subscribe();

        assert_eq!(bus.publish(run_status(Uuid::now_v7(), WorkflowRunStatus::Queued)), 2);

        assert!(first.recv().await.is_ok());
        assert!(second.recv().await.is_ok());
    }

    #[test]
    fn test_publish_without_subscribers_reaches_nobody() {
        let bus = EventBus::new(16);
        assert_eq!(bus.publish(run_status(Uuid::now_v7(), WorkflowRunStatus::Running)), 0);
    }

    #[tokio::test]
    async fn test_run_subscription_skips_other_runs() {
        let bus = EventBus::new(16);
        let watched = Uuid::now_v7();
        let mut sub = bus.subscribe_run(watched);

        bus.publish(run_status(Uuid::now_v7(), WorkflowRunStatus::Running));
        bus.publish(EngineEvent::EventCreated {
            event_id: Uuid::now_v7(),
            key: "user:created".to_string(),
        });
        bus.publish(EngineEvent::StepRunStatusChanged {
            step_run_id: Uuid::now_v7(),
            workflow_run_id: watched,
            status: StepRunStatus::Assigned,
        });

        let event = sub.next().await.unwrap();
        assert!(matches!(
            event,
            EngineEvent::StepRunStatusChanged {
                status: StepRunStatus::Assigned,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_run_subscription_recovers_from_lag() {
        let bus = EventBus::new(2);
        let watched = Uuid::now_v7();
        let mut sub = bus.subscribe_run(watched);

        for _ in 0..5 {
            bus.publish(run_status(watched, WorkflowRunStatus::Running));
        }
        bus.publish(run_status(watched, WorkflowRunStatus::Succeeded));

        let mut last = None;
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.next()).await
        {
            last = Some(event);
        }
        assert!(matches!(
            last,
            Some(EngineEvent::WorkflowRunStatusChanged {
                status: WorkflowRunStatus::Succeeded,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_run_subscription_ends_with_the_bus() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe_run(Uuid::now_v7());
        drop(bus);
        assert!(sub.next().await.is_none());
    }
}
