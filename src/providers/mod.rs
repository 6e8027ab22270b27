//! Durability providers: per-instance history logs plus the three work
//! queues the runtime dispatches from.

use serde::{Deserialize, Serialize};

use crate::Event;

/// In-memory provider for tests and embedded use.
pub mod in_memory;
/// Filesystem-backed provider writing JSONL files.
pub mod fs;

/// The three dispatch queues a provider hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Orchestrator,
    Worker,
    Timer,
}

/// Messages flowing through the work queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
    },
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
    },
    TimerSchedule {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    CancelInstance {
        instance: String,
        reason: String,
    },
}

impl WorkItem {
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::CancelInstance { instance, .. } => instance,
        }
    }
}

/// Dedup key for completion-like events. Appending the same completion
/// twice (redelivered queue item, late activity for a cancelled
/// instance) must be a no-op, so stores key them by correlation id and
/// kind; terminal events share a single synthetic slot.
pub(crate) fn completion_key(event: &Event) -> Option<(u64, &'static str)> {
    match event {
        Event::ActivityCompleted { id, .. } => Some((*id, "activity-ok")),
        Event::ActivityFailed { id, .. } => Some((*id, "activity-err")),
        Event::TimerFired { id, .. } => Some((*id, "timer")),
        Event::ExternalEvent { id, .. } => Some((*id, "external")),
        Event::OrchestrationCompleted { .. }
        | Event::OrchestrationFailed { .. }
        | Event::OrchestrationCancelled { .. } => Some((0, "terminal")),
        _ => None,
    }
}

/// Storage abstraction: append-only history per instance plus the work
/// queues. Appends to one instance are serialized by the store; reads
/// and appends to distinct instances are independent.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read the full ordered history for an instance (empty if none).
    async fn read(&self, instance: &str) -> Vec<Event>;

    /// Atomically append events, returning the history length after the
    /// append (the sequence number of the last event). Completion-like
    /// events already present are silently skipped.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, String>;

    async fn exists(&self, instance: &str) -> bool;

    /// Create a new, empty instance; errors if it already exists.
    async fn create_instance(&self, instance: &str) -> Result<(), String>;

    /// Remove an instance and its history.
    async fn remove_instance(&self, instance: &str) -> Result<(), String>;

    async fn list_instances(&self) -> Vec<String>;

    /// Clear all provider data (test utility).
    async fn reset(&self);

    /// Pretty-printed dump of every stored history (test utility).
    async fn dump_all_pretty(&self) -> String;

    /// Enqueue a work item; duplicate items are dropped.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String>;

    /// Pop the next item, keeping it invisible until `ack` or
    /// `abandon`. Returns the item plus a lock token.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;

    /// Permanently discard a peek-locked item.
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String>;

    /// Return a peek-locked item to the front of its queue.
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String>;
}
