// Contract with the collaborators that sit outside the engine: the client
// notification transport, the render queue, and presence tracking.
//
// Delivery is best-effort. Nothing here may assume the document lock is held.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::mpsc;
use workbench_common::protocol::update::ClientUpdate;
use workbench_common::types::{DeltaId, WorkflowId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("collaborator channel closed")]
    Closed,

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

pub type NotifyFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait Collaborators: Send + Sync {
    /// Fire-and-forget client update.
    fn notify(&self, workflow_id: WorkflowId, update: ClientUpdate) -> NotifyFuture<'_, Result<(), NotifyError>>;

    /// Idempotent. A render keyed by a superseded entry is a no-op downstream.
    fn request_render(&self, workflow_id: WorkflowId, delta_id: DeltaId) -> NotifyFuture<'_, Result<(), NotifyError>>;

    fn has_active_viewers(&self, workflow_id: WorkflowId) -> NotifyFuture<'_, bool>;

    fn has_notification_subscribers(&self, workflow_id: WorkflowId) -> NotifyFuture<'_, bool>;
}

/// One message handed to a collaborator, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Notify { workflow_id: WorkflowId, update: ClientUpdate },
    Render { workflow_id: WorkflowId, delta_id: DeltaId },
}

/// Forwards every message onto an unbounded channel. Presence is set by hand.
#[derive(Debug)]
pub struct ChannelCollaborators {
    tx: mpsc::UnboundedSender<Outbound>,
    viewers: Mutex<HashSet<WorkflowId>>,
    subscribers: Mutex<HashSet<WorkflowId>>,
}

impl ChannelCollaborators {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let collaborators =
            Self { tx, viewers: Mutex::new(HashSet::new()), subscribers: Mutex::new(HashSet::new()) };
        (collaborators, rx)
    }

    pub fn set_active_viewers(&self, workflow_id: WorkflowId, present: bool) {
        toggle(&self.viewers, workflow_id, present);
    }

    pub fn set_notification_subscribers(&self, workflow_id: WorkflowId, present: bool) {
        toggle(&self.subscribers, workflow_id, present);
    }

    fn send(&self, message: Outbound) -> Result<(), NotifyError> {
        self.tx.send(message).map_err(|_| NotifyError::Closed)
    }
}

fn toggle(set: &Mutex<HashSet<WorkflowId>>, workflow_id: WorkflowId, present: bool) {
    let mut set = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if present {
        set.insert(workflow_id);
    } else {
        set.remove(&workflow_id);
    }
}

fn contains(set: &Mutex<HashSet<WorkflowId>>, workflow_id: WorkflowId) -> bool {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).contains(&workflow_id)
}

impl Collaborators for ChannelCollaborators {
    fn notify(&self, workflow_id: WorkflowId, update: ClientUpdate) -> NotifyFuture<'_, Result<(), NotifyError>> {
        let result = self.send(Outbound::Notify { workflow_id, update });
        Box::pin(async move { result })
    }

    fn request_render(&self, workflow_id: WorkflowId, delta_id: DeltaId) -> NotifyFuture<'_, Result<(), NotifyError>> {
        let result = self.send(Outbound::Render { workflow_id, delta_id });
        Box::pin(async move { result })
    }

    fn has_active_viewers(&self, workflow_id: WorkflowId) -> NotifyFuture<'_, bool> {
        let present = contains(&self.viewers, workflow_id);
        Box::pin(async move { present })
    }

    fn has_notification_subscribers(&self, workflow_id: WorkflowId) -> NotifyFuture<'_, bool> {
        let present = contains(&self.subscribers, workflow_id);
        Box::pin(async move { present })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_arrive_in_send_order() {
        let (collaborators, mut rx) = ChannelCollaborators::new();

        collaborators.notify(1, ClientUpdate::default()).await.expect("notify should send");
        collaborators.request_render(1, 7).await.expect("render should send");

        assert!(matches!(rx.recv().await, Some(Outbound::Notify { workflow_id: 1, .. })));
        assert_eq!(rx.recv().await, Some(Outbound::Render { workflow_id: 1, delta_id: 7 }));
    }

    #[tokio::test]
    async fn closed_receiver_is_reported() {
        let (collaborators, rx) = ChannelCollaborators::new();
        drop(rx);

        assert_eq!(collaborators.request_render(1, 2).await, Err(NotifyError::Closed));
    }

    #[tokio::test]
    async fn presence_is_per_workflow() {
        let (collaborators, _rx) = ChannelCollaborators::new();
        collaborators.set_active_viewers(3, true);
        collaborators.set_notification_subscribers(4, true);

        assert!(collaborators.has_active_viewers(3).await);
        assert!(!collaborators.has_active_viewers(4).await);
        assert!(collaborators.has_notification_subscribers(4).await);

        collaborators.set_active_viewers(3, false);
        assert!(!collaborators.has_active_viewers(3).await);
    }
}
