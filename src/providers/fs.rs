use std::path::{Path, PathBuf};

use tokio::{fs, io::AsyncWriteExt};

use super::{completion_key, HistoryStore, QueueKind, WorkItem};
use crate::Event;

/// Filesystem-backed history store: one JSONL file per instance under
/// `<root>/instances/`, one JSONL file per work queue, and lock sidecar
/// files for peek-locked items. Queue rewrites go through a temp file
/// and rename so a crash never leaves a half-written queue.
pub struct FsHistoryStore {
    root: PathBuf,
    instances_dir: PathBuf,
    cap: usize,
    io_lock: tokio::sync::Mutex<()>,
}

impl FsHistoryStore {
    /// Create a store rooted at `root`. With `reset_on_create`, any
    /// existing data under the root is deleted first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let root = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&root);
        }
        let instances_dir = root.join("instances");
        let _ = std::fs::create_dir_all(&instances_dir);
        Self {
            root,
            instances_dir,
            cap: 4096,
            io_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Same as [`Self::new`] with a custom history cap (tests).
    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        let mut store = Self::new(root, reset_on_create);
        store.cap = cap;
        store
    }

    fn instance_path(&self, instance: &str) -> PathBuf {
        self.instances_dir.join(format!("{instance}.jsonl"))
    }

    fn queue_path(&self, kind: QueueKind) -> PathBuf {
        let name = match kind {
            QueueKind::Orchestrator => "queue-orchestrator.jsonl",
            QueueKind::Worker => "queue-worker.jsonl",
            QueueKind::Timer => "queue-timer.jsonl",
        };
        self.root.join(name)
    }

    fn lock_dir(&self, kind: QueueKind) -> PathBuf {
        let name = match kind {
            QueueKind::Orchestrator => "orchestrator",
            QueueKind::Worker => "worker",
            QueueKind::Timer => "timer",
        };
        self.root.join(".locks").join(name)
    }

    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.lock_dir(kind).join(format!("{token}.lock"))
    }

    async fn read_queue(&self, kind: QueueKind) -> Vec<WorkItem> {
        let data = fs::read_to_string(self.queue_path(kind)).await.unwrap_or_default();
        data.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<WorkItem>(line).ok())
            .collect()
    }

    async fn write_queue(&self, kind: QueueKind, items: &[WorkItem]) -> Result<(), String> {
        let path = self.queue_path(kind);
        let tmp = path.with_extension("jsonl.tmp");
        let mut body = String::new();
        for item in items {
            body.push_str(&serde_json::to_string(item).map_err(|e| e.to_string())?);
            body.push('\n');
        }
        fs::write(&tmp, body).await.map_err(|e| e.to_string())?;
        fs::rename(&tmp, &path).await.map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn read_events(&self, path: &Path) -> Vec<Event> {
        let data = fs::read_to_string(path).await.unwrap_or_default();
        data.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<Event>(line).ok())
            .collect()
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.read_events(&self.instance_path(instance)).await
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, String> {
        let _guard = self.io_lock.lock().await;
        let path = self.instance_path(instance);
        if !fs::try_exists(&path).await.map_err(|e| e.to_string())? {
            return Err(format!("instance not found: {instance}"));
        }
        let existing = self.read_events(&path).await;
        if existing.len() + new_events.len() > self.cap {
            return Err(format!(
                "history cap exceeded (cap={}, have={}, append={})",
                self.cap,
                existing.len(),
                new_events.len()
            ));
        }
        let mut seen: std::collections::HashSet<(u64, &'static str)> =
            existing.iter().filter_map(completion_key).collect();
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| e.to_string())?;
        let mut len = existing.len() as u64;
        for event in new_events {
            if let Some(key) = completion_key(&event) {
                if !seen.insert(key) {
                    continue;
                }
            }
            let line = serde_json::to_string(&event).map_err(|e| e.to_string())?;
            file.write_all(line.as_bytes()).await.map_err(|e| e.to_string())?;
            file.write_all(b"\n").await.map_err(|e| e.to_string())?;
            len += 1;
        }
        file.flush().await.map_err(|e| e.to_string())?;
        Ok(len)
    }

    async fn exists(&self, instance: &str) -> bool {
        fs::try_exists(self.instance_path(instance)).await.unwrap_or(false)
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        fs::create_dir_all(&self.instances_dir).await.map_err(|e| e.to_string())?;
        fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.instance_path(instance))
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    format!("instance already exists: {instance}")
                } else {
                    e.to_string()
                }
            })?;
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        let path = self.instance_path(instance);
        if !fs::try_exists(&path).await.map_err(|e| e.to_string())? {
            return Err(format!("instance not found: {instance}"));
        }
        fs::remove_file(&path).await.map_err(|e| e.to_string())
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut entries) = fs::read_dir(&self.instances_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Some(name) = entry.file_name().to_str() {
                    if let Some(stem) = name.strip_suffix(".jsonl") {
                        out.push(stem.to_string());
                    }
                }
            }
        }
        out
    }

    async fn reset(&self) {
        let _ = fs::remove_dir_all(&self.root).await;
        let _ = fs::create_dir_all(&self.instances_dir).await;
    }

    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for instance in self.list_instances().await {
            out.push_str(&format!("instance={instance}\n"));
            for event in self.read(&instance).await {
                out.push_str(&format!("  {event:?}\n"));
            }
        }
        out
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let _guard = self.io_lock.lock().await;
        let mut items = self.read_queue(kind).await;
        if items.contains(&item) {
            return Ok(());
        }
        items.push(item);
        self.write_queue(kind, &items).await
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let _guard = self.io_lock.lock().await;
        let mut items = self.read_queue(kind).await;
        if items.is_empty() {
            return None;
        }
        let item = items.remove(0);
        self.write_queue(kind, &items).await.ok()?;
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .ok()?
            .as_nanos();
        let token = format!("{nanos:x}-{:x}", std::process::id());
        fs::create_dir_all(self.lock_dir(kind)).await.ok()?;
        let line = serde_json::to_string(&item).ok()?;
        fs::write(self.lock_path(kind, &token), line).await.ok()?;
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let path = self.lock_path(kind, token);
        if fs::try_exists(&path).await.map_err(|e| e.to_string())? {
            fs::remove_file(&path).await.map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let path = self.lock_path(kind, token);
        if !fs::try_exists(&path).await.map_err(|e| e.to_string())? {
            return Ok(());
        }
        let data = fs::read_to_string(&path).await.map_err(|e| e.to_string())?;
        let item: WorkItem = serde_json::from_str(&data).map_err(|e| e.to_string())?;
        {
            let _guard = self.io_lock.lock().await;
            let mut items = self.read_queue(kind).await;
            items.insert(0, item);
            self.write_queue(kind, &items).await?;
        }
        fs::remove_file(&path).await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_survives_a_fresh_store_handle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(dir.path(), true);
        store.create_instance("i1").await.unwrap();
        store
            .append(
                "i1",
                vec![Event::OrchestrationStarted {
                    name: "Demo".into(),
                    version: "1.0.0".into(),
                    input: "in".into(),
                }],
            )
            .await
            .unwrap();

        // Reopen without reset, as a restarted process would.
        let reopened = FsHistoryStore::new(dir.path(), false);
        let history = reopened.read("i1").await;
        assert_eq!(history.len(), 1);
        assert!(matches!(&history[0], Event::OrchestrationStarted { name, .. } if name == "Demo"));
    }

    #[tokio::test]
    async fn create_instance_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(dir.path(), true);
        store.create_instance("i1").await.unwrap();
        let err = store.create_instance("i1").await.unwrap_err();
        assert!(err.contains("already exists"));
    }

    #[tokio::test]
    async fn queue_round_trip_with_abandon() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(dir.path(), true);
        let item = WorkItem::ExternalRaised {
            instance: "i1".into(),
            name: "Go".into(),
            data: "d".into(),
        };
        store.enqueue_work(QueueKind::Orchestrator, item.clone()).await.unwrap();
        // Duplicate enqueue is a no-op.
        store.enqueue_work(QueueKind::Orchestrator, item.clone()).await.unwrap();

        let (got, token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
        assert_eq!(got, item);
        assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());

        store.abandon(QueueKind::Orchestrator, &token).await.unwrap();
        let (again, token2) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
        assert_eq!(again, item);
        store.ack(QueueKind::Orchestrator, &token2).await.unwrap();
        assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
    }

    #[tokio::test]
    async fn history_cap_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new_with_cap(dir.path(), true, 2);
        store.create_instance("i1").await.unwrap();
        let events = vec![
            Event::OrchestrationStarted {
                name: "Demo".into(),
                version: "1.0.0".into(),
                input: String::new(),
            },
            Event::ActivityScheduled {
                id: 1,
                name: "A".into(),
                input: String::new(),
            },
            Event::ActivityCompleted { id: 1, result: "r".into() },
        ];
        let err = store.append("i1", events).await.unwrap_err();
        assert!(err.contains("history cap exceeded"));
    }
}
