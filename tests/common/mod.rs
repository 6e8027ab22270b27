#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use duraflow::providers::fs::FsHistoryStore;
use duraflow::providers::in_memory::InMemoryHistoryStore;
use duraflow::providers::HistoryStore;
use duraflow::Event;

pub fn in_memory_store() -> Arc<dyn HistoryStore> {
    Arc::new(InMemoryHistoryStore::new())
}

pub fn fs_store() -> (Arc<dyn HistoryStore>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn HistoryStore> = Arc::new(FsHistoryStore::new(dir.path(), true));
    (store, dir)
}

/// Poll the instance history until `predicate` holds or `timeout_ms`
/// passes.
pub async fn wait_for_history<F>(store: &Arc<dyn HistoryStore>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if predicate(&store.read(instance).await) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the instance has recorded a subscription for `name`.
/// Events raised before the subscription exists are never matched to
/// it, so tests must order raises after this returns.
pub async fn wait_for_subscription(store: &Arc<dyn HistoryStore>, instance: &str, name: &str, timeout_ms: u64) -> bool {
    wait_for_history(
        store,
        instance,
        |hist| {
            hist.iter()
                .any(|e| matches!(e, Event::ExternalSubscribed { name: n, .. } if n == name))
        },
        timeout_ms,
    )
    .await
}
