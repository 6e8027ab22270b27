//! Thin control-plane client.
//!
//! The client talks to the runtime exclusively through the shared
//! [`HistoryStore`]: starting an instance creates its history and
//! enqueues a start item, raising an event or cancelling enqueues the
//! matching work item, and status is derived from a history read.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::runtime::{status_from_history, OrchestrationStatus, WaitError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The instance id is already taken.
    AlreadyExists(String),
    /// No instance with that id.
    NotFound(String),
    /// The provider rejected the operation.
    Provider(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::AlreadyExists(instance) => write!(f, "instance already exists: {instance}"),
            ClientError::NotFound(instance) => write!(f, "instance not found: {instance}"),
            ClientError::Provider(msg) => write!(f, "provider error: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

pub struct Client {
    store: Arc<dyn HistoryStore>,
}

impl Client {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Start an orchestration under a caller-supplied instance id.
    /// The id must be fresh; reusing one fails with `AlreadyExists`.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.store.create_instance(instance).await.map_err(|e| {
            if e.contains("already exists") {
                ClientError::AlreadyExists(instance.to_string())
            } else {
                ClientError::Provider(e)
            }
        })?;
        debug!(instance, orchestration, "enqueueing start");
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: orchestration.to_string(),
                    input: input.into(),
                },
            )
            .await
            .map_err(ClientError::Provider)
    }

    /// Typed wrapper over [`Self::start_orchestration`].
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<(), ClientError> {
        let encoded = crate::codec::encode(input).map_err(ClientError::Provider)?;
        self.start_orchestration(instance, orchestration, encoded).await
    }

    /// Raise a named external event against a running instance.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: &str,
        data: impl Into<String>,
    ) -> Result<(), ClientError> {
        if !self.store.exists(instance).await {
            return Err(ClientError::NotFound(instance.to_string()));
        }
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name: name.to_string(),
                    data: data.into(),
                },
            )
            .await
            .map_err(ClientError::Provider)
    }

    /// Typed wrapper over [`Self::raise_event`].
    pub async fn raise_event_typed<T: Serialize>(
        &self,
        instance: &str,
        name: &str,
        data: &T,
    ) -> Result<(), ClientError> {
        let encoded = crate::codec::encode(data).map_err(ClientError::Provider)?;
        self.raise_event(instance, name, encoded).await
    }

    /// Request cancellation. Best effort: a no-op once the instance is
    /// terminal.
    pub async fn cancel_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        if !self.store.exists(instance).await {
            return Err(ClientError::NotFound(instance.to_string()));
        }
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::CancelInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
            )
            .await
            .map_err(ClientError::Provider)
    }

    pub async fn get_status(&self, instance: &str) -> OrchestrationStatus {
        if !self.store.exists(instance).await {
            return OrchestrationStatus::NotFound;
        }
        status_from_history(&self.store.read(instance).await)
    }

    /// Poll until the instance reaches a terminal status or `timeout`
    /// passes. Polls with a small doubling backoff capped at 100ms.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = Duration::from_millis(5);
        loop {
            match self.get_status(instance).await {
                OrchestrationStatus::NotFound => {
                    return Err(WaitError::Other(format!("instance not found: {instance}")));
                }
                status if status.is_terminal() => return Ok(status),
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_millis(100));
        }
    }
}
