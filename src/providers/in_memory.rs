use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use super::{completion_key, HistoryStore, QueueKind, WorkItem};
use crate::Event;

const HISTORY_CAP: usize = 4096;

#[derive(Default)]
struct Queue {
    ready: VecDeque<WorkItem>,
    // token -> item; invisible until ack/abandon
    locked: HashMap<String, WorkItem>,
}

/// In-memory history store. Histories and queues live behind async
/// mutexes; peek-locked items are parked in a side map so a crashed
/// consumer's items can be abandoned back into the queue.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    histories: Mutex<HashMap<String, Vec<Event>>>,
    orchestrator: Mutex<Queue>,
    worker: Mutex<Queue>,
    timer: Mutex<Queue>,
    token_seq: AtomicU64,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, kind: QueueKind) -> &Mutex<Queue> {
        match kind {
            QueueKind::Orchestrator => &self.orchestrator,
            QueueKind::Worker => &self.worker,
            QueueKind::Timer => &self.timer,
        }
    }

    fn next_token(&self, kind: QueueKind) -> String {
        let n = self.token_seq.fetch_add(1, Ordering::Relaxed);
        let tag = match kind {
            QueueKind::Orchestrator => "orch",
            QueueKind::Worker => "work",
            QueueKind::Timer => "timer",
        };
        format!("{tag}-{n}")
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.histories.lock().await.get(instance).cloned().unwrap_or_default()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, String> {
        let mut histories = self.histories.lock().await;
        let history = histories
            .get_mut(instance)
            .ok_or_else(|| format!("instance not found: {instance}"))?;
        if history.len() + new_events.len() > HISTORY_CAP {
            return Err(format!(
                "history cap exceeded (cap={HISTORY_CAP}, have={}, append={})",
                history.len(),
                new_events.len()
            ));
        }
        let mut seen: HashSet<(u64, &'static str)> = history.iter().filter_map(completion_key).collect();
        for event in new_events {
            match completion_key(&event) {
                Some(key) if seen.contains(&key) => continue,
                Some(key) => {
                    seen.insert(key);
                    history.push(event);
                }
                None => history.push(event),
            }
        }
        Ok(history.len() as u64)
    }

    async fn exists(&self, instance: &str) -> bool {
        self.histories.lock().await.contains_key(instance)
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        let mut histories = self.histories.lock().await;
        if histories.contains_key(instance) {
            return Err(format!("instance already exists: {instance}"));
        }
        histories.insert(instance.to_string(), Vec::new());
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        if self.histories.lock().await.remove(instance).is_none() {
            return Err(format!("instance not found: {instance}"));
        }
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        self.histories.lock().await.keys().cloned().collect()
    }

    async fn reset(&self) {
        self.histories.lock().await.clear();
        for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
            let mut q = self.queue(kind).lock().await;
            q.ready.clear();
            q.locked.clear();
        }
    }

    async fn dump_all_pretty(&self) -> String {
        let histories = self.histories.lock().await;
        let mut out = String::new();
        for (instance, events) in histories.iter() {
            out.push_str(&format!("instance={instance}\n"));
            for event in events {
                out.push_str(&format!("  {event:?}\n"));
            }
        }
        out
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let mut q = self.queue(kind).lock().await;
        if !q.ready.contains(&item) && !q.locked.values().any(|locked| locked == &item) {
            q.ready.push_back(item);
        }
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let mut q = self.queue(kind).lock().await;
        let item = q.ready.pop_front()?;
        let token = self.next_token(kind);
        q.locked.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        self.queue(kind).lock().await.locked.remove(token);
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let mut q = self.queue(kind).lock().await;
        if let Some(item) = q.locked.remove(token) {
            q.ready.push_front(item);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_requires_created_instance() {
        let store = InMemoryHistoryStore::new();
        let err = store
            .append("missing", vec![Event::OrchestrationCompleted { output: "x".into() }])
            .await
            .unwrap_err();
        assert!(err.contains("not found"));
    }

    #[tokio::test]
    async fn duplicate_completions_are_dropped() {
        let store = InMemoryHistoryStore::new();
        store.create_instance("i1").await.unwrap();
        let fired = Event::TimerFired { id: 7, fire_at_ms: 1 };
        store.append("i1", vec![fired.clone()]).await.unwrap();
        let len = store.append("i1", vec![fired]).await.unwrap();
        assert_eq!(len, 1);
        assert_eq!(store.read("i1").await.len(), 1);
    }

    #[tokio::test]
    async fn peek_lock_hides_items_until_ack_or_abandon() {
        let store = InMemoryHistoryStore::new();
        let item = WorkItem::TimerFired {
            instance: "i1".into(),
            id: 1,
            fire_at_ms: 1,
        };
        store.enqueue_work(QueueKind::Timer, item.clone()).await.unwrap();

        let (got, token) = store.dequeue_peek_lock(QueueKind::Timer).await.unwrap();
        assert_eq!(got, item);
        assert!(store.dequeue_peek_lock(QueueKind::Timer).await.is_none());

        store.abandon(QueueKind::Timer, &token).await.unwrap();
        let (again, token2) = store.dequeue_peek_lock(QueueKind::Timer).await.unwrap();
        assert_eq!(again, item);
        store.ack(QueueKind::Timer, &token2).await.unwrap();
        assert!(store.dequeue_peek_lock(QueueKind::Timer).await.is_none());
    }
}
