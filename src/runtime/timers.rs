use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use crate::providers::{HistoryStore, QueueKind, WorkItem};

/// In-process timer service. Maintains a min-ordered heap of
/// `TimerSchedule` items and enqueues `TimerFired` to the orchestrator
/// queue when due. Deduplicates on (instance, id, fire time) so a
/// redelivered schedule does not fire twice.
pub struct TimerService {
    store: Arc<dyn HistoryStore>,
    rx: tokio::sync::mpsc::UnboundedReceiver<WorkItem>,
    // key "inst|id|fire_at_ms" -> (instance, id)
    items: HashMap<String, (String, u64)>,
    keys: HashSet<String>,
    min_heap: BinaryHeap<Reverse<(u64, String)>>,
    poller_idle_ms: u64,
}

impl TimerService {
    pub fn start(
        store: Arc<dyn HistoryStore>,
        poller_idle_ms: u64,
    ) -> (
        tokio::task::JoinHandle<()>,
        tokio::sync::mpsc::UnboundedSender<WorkItem>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<WorkItem>();
        let mut svc = TimerService {
            store,
            rx,
            items: HashMap::new(),
            keys: HashSet::new(),
            min_heap: BinaryHeap::new(),
            poller_idle_ms,
        };
        let handle = tokio::spawn(async move { svc.run().await });
        (handle, tx)
    }

    async fn run(&mut self) {
        loop {
            // Drain any queued schedules
            while let Ok(item) = self.rx.try_recv() {
                self.insert_item(item);
            }

            // Fire due timers
            let now = crate::now_ms();
            let mut due: Vec<(String, u64, u64)> = Vec::new();
            while let Some(Reverse((ts, key))) = self.min_heap.peek().cloned() {
                if ts <= now {
                    let _ = self.min_heap.pop();
                    if let Some((instance, id)) = self.items.remove(&key) {
                        self.keys.remove(&key);
                        due.push((instance, id, ts));
                    }
                } else {
                    break;
                }
            }

            for (instance, id, fire_at_ms) in due.drain(..) {
                let _ = self
                    .store
                    .enqueue_work(
                        QueueKind::Orchestrator,
                        WorkItem::TimerFired {
                            instance,
                            id,
                            fire_at_ms,
                        },
                    )
                    .await;
            }

            // Wait for the next deadline or the next schedule
            if let Some(Reverse((next_ts, _))) = self.min_heap.peek().cloned() {
                let now = crate::now_ms();
                let dur_ms = next_ts.saturating_sub(now).max(1);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(dur_ms)) => {},
                    maybe = self.rx.recv() => {
                        match maybe {
                            Some(item) => self.insert_item(item),
                            _ => tokio::time::sleep(std::time::Duration::from_millis(self.poller_idle_ms)).await,
                        }
                    }
                }
            } else {
                // No timers; block on the next schedule
                match self.rx.recv().await {
                    Some(item) => self.insert_item(item),
                    _ => tokio::time::sleep(std::time::Duration::from_millis(self.poller_idle_ms)).await,
                }
            }
        }
    }

    fn insert_item(&mut self, item: WorkItem) {
        if let WorkItem::TimerSchedule {
            instance,
            id,
            fire_at_ms,
        } = item
        {
            let key = format!("{instance}|{id}|{fire_at_ms}");
            if self.keys.insert(key.clone()) {
                self.min_heap.push(Reverse((fire_at_ms, key.clone())));
                self.items.insert(key, (instance, id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::in_memory::InMemoryHistoryStore;

    #[tokio::test]
    async fn fires_due_timers_in_order() {
        let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
        let (_jh, tx) = TimerService::start(store.clone(), 5);
        // schedule three timers: immediate, +10ms, +5ms
        let now = crate::now_ms();
        let _ = tx.send(WorkItem::TimerSchedule {
            instance: "i".into(),
            id: 1,
            fire_at_ms: now,
        });
        let _ = tx.send(WorkItem::TimerSchedule {
            instance: "i".into(),
            id: 2,
            fire_at_ms: now + 10,
        });
        let _ = tx.send(WorkItem::TimerSchedule {
            instance: "i".into(),
            id: 3,
            fire_at_ms: now + 5,
        });

        // Drain the orchestrator queue for the three fires
        let mut fired: Vec<u64> = Vec::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(500);
        while fired.len() < 3 && std::time::Instant::now() < deadline {
            if let Some((item, token)) = store.dequeue_peek_lock(QueueKind::Orchestrator).await {
                if let WorkItem::TimerFired { id, .. } = item {
                    fired.push(id);
                }
                let _ = store.ack(QueueKind::Orchestrator, &token).await;
            } else {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        }
        assert_eq!(fired, vec![1, 3, 2]);
    }

    #[tokio::test]
    async fn duplicate_schedules_fire_once() {
        let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
        let (_jh, tx) = TimerService::start(store.clone(), 5);
        let schedule = WorkItem::TimerSchedule {
            instance: "i".into(),
            id: 1,
            fire_at_ms: crate::now_ms(),
        };
        let _ = tx.send(schedule.clone());
        let _ = tx.send(schedule);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let mut fired = 0;
        while let Some((_, token)) = store.dequeue_peek_lock(QueueKind::Orchestrator).await {
            fired += 1;
            let _ = store.ack(QueueKind::Orchestrator, &token).await;
        }
        assert_eq!(fired, 1);
    }
}
