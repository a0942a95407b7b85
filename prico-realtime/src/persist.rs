//! Per-room serial persistence writer.
//!
//! Each persisting room owns one [`PersistQueue`]. Jobs run one at a time,
//! in enqueue order, on the blocking pool. Failures are logged and counted.
//! Nothing is reported back to the room or to clients, and nothing that was
//! already broadcast is undone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use crate::protocol::timestamp;
use crate::registry::HubCounters;
use crate::storage::{DocumentStore, StoreError, MESSAGES, PROJECTS};

/// One durable write.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PersistJob {
    SaveMessage(Value),
    UpdateMessage { id: String, partial: Value },
    DeleteMessage { id: String },
    /// Replace (or append) one entry of a project's `files` array.
    WriteFile {
        project_id: String,
        file_path: String,
        content: String,
    },
}

impl PersistJob {
    fn describe(&self) -> String {
        match self {
            PersistJob::SaveMessage(doc) => {
                format!("save message {}", doc.get("id").and_then(Value::as_str).unwrap_or("?"))
            }
            PersistJob::UpdateMessage { id, .. } => format!("update message {id}"),
            PersistJob::DeleteMessage { id } => format!("delete message {id}"),
            PersistJob::WriteFile {
                project_id,
                file_path,
                ..
            } => format!("write file {project_id}:{file_path}"),
        }
    }

    fn apply(self, ctx: &PersistContext) -> Result<(), StoreError> {
        let store = ctx.store.as_ref();
        match self {
            PersistJob::SaveMessage(doc) => store.save(MESSAGES, doc).map(|_| ()),
            PersistJob::UpdateMessage { id, partial } => store.update(MESSAGES, &id, partial),
            PersistJob::DeleteMessage { id } => store.delete(MESSAGES, &id).map(|_| ()),
            PersistJob::WriteFile {
                project_id,
                file_path,
                content,
            } => {
                // Rooms of different files in one project share the document.
                let _guard = ctx.files_lock.lock().unwrap_or_else(PoisonError::into_inner);
                write_file(store, &project_id, &file_path, content)
            }
        }
    }
}

fn write_file(
    store: &dyn DocumentStore,
    project_id: &str,
    file_path: &str,
    content: String,
) -> Result<(), StoreError> {
    let project = store
        .find(PROJECTS, project_id)?
        .ok_or_else(|| StoreError::not_found(PROJECTS, project_id))?;

    let mut files = project
        .get("files")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let existing = files
        .iter_mut()
        .filter_map(Value::as_object_mut)
        .find(|file| file.get("path").and_then(Value::as_str) == Some(file_path));
    match existing {
        Some(file) => {
            file.insert("content".into(), Value::String(content));
        }
        None => files.push(json!({"path": file_path, "content": content})),
    }

    store.update(
        PROJECTS,
        project_id,
        json!({"files": files, "updated_at": timestamp()}),
    )
}

/// What a writer task needs. Shared by every room of a hub.
#[derive(Clone)]
pub(crate) struct PersistContext {
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) files_lock: Arc<Mutex<()>>,
    pub(crate) counters: Arc<HubCounters>,
}

impl PersistContext {
    pub(crate) fn new(store: Arc<dyn DocumentStore>, counters: Arc<HubCounters>) -> Self {
        Self {
            store,
            files_lock: Arc::new(Mutex::new(())),
            counters,
        }
    }
}

/// Sending side of a room's writer. The writer exits once this is dropped
/// and the queue is drained.
#[derive(Debug)]
pub(crate) struct PersistQueue {
    tx: mpsc::UnboundedSender<PersistJob>,
    enqueued: AtomicU64,
    completed: watch::Receiver<u64>,
}

impl PersistQueue {
    pub(crate) fn spawn(ctx: PersistContext, label: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, completed) = watch::channel(0);
        tokio::spawn(run_writer(ctx, label, rx, done_tx));
        Self {
            tx,
            enqueued: AtomicU64::new(0),
            completed,
        }
    }

    pub(crate) fn enqueue(&self, job: PersistJob) {
        self.enqueued.fetch_add(1, Ordering::AcqRel);
        if let Err(rejected) = self.tx.send(job) {
            log::error!("Persistence writer gone, dropping {}", rejected.0.describe());
        }
    }

    /// Number of jobs handed to the writer so far.
    pub(crate) fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Acquire)
    }

    /// Waits until the first `upto` jobs have been attempted.
    pub(crate) async fn settled(&self, upto: u64) {
        let mut completed = self.completed.clone();
        // Err means the writer is gone and nothing more will land.
        let _ = completed.wait_for(|done| *done >= upto).await;
    }
}

async fn run_writer(
    ctx: PersistContext,
    label: String,
    mut rx: mpsc::UnboundedReceiver<PersistJob>,
    done: watch::Sender<u64>,
) {
    while let Some(job) = rx.recv().await {
        let what = job.describe();
        let job_ctx = ctx.clone();
        match tokio::task::spawn_blocking(move || job.apply(&job_ctx)).await {
            Ok(Ok(())) => {
                ctx.counters.persisted_writes.fetch_add(1, Ordering::Relaxed);
                log::debug!("Persisted {what} for {label}");
            }
            Ok(Err(e)) => {
                ctx.counters.persistence_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Persistence failed for {label} ({what}): {e}");
            }
            Err(e) => {
                ctx.counters.persistence_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Persistence task for {label} ({what}) panicked: {e}");
            }
        }
        done.send_modify(|count| *count += 1);
    }
    log::debug!("Persistence writer for {label} finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    fn context(store: Arc<MemoryStore>) -> PersistContext {
        PersistContext::new(store, Arc::new(HubCounters::default()))
    }

    #[test]
    fn test_write_file_replaces_entry() {
        let store = Arc::new(MemoryStore::new());
        store
            .save(
                PROJECTS,
                json!({"id": "p1", "files": [{"path": "main.py", "content": "old"}, {"path": "lib.py", "content": "x"}]}),
            )
            .unwrap();

        let job = PersistJob::WriteFile {
            project_id: "p1".into(),
            file_path: "main.py".into(),
            content: "new".into(),
        };
        job.apply(&context(store.clone())).unwrap();

        let project = store.find(PROJECTS, "p1").unwrap().unwrap();
        assert_eq!(project["files"][0], json!({"path": "main.py", "content": "new"}));
        assert_eq!(project["files"][1]["content"], "x");
        assert!(project["updated_at"].is_string());
    }

    #[test]
    fn test_write_file_appends_new_path() {
        let store = Arc::new(MemoryStore::new());
        store.save(PROJECTS, json!({"id": "p1"})).unwrap();

        let job = PersistJob::WriteFile {
            project_id: "p1".into(),
            file_path: "src/app.rs".into(),
            content: "fn main() {}".into(),
        };
        job.apply(&context(store.clone())).unwrap();

        let project = store.find(PROJECTS, "p1").unwrap().unwrap();
        assert_eq!(project["files"], json!([{"path": "src/app.rs", "content": "fn main() {}"}]));
    }

    #[test]
    fn test_write_file_missing_project() {
        let store = Arc::new(MemoryStore::new());
        let job = PersistJob::WriteFile {
            project_id: "ghost".into(),
            file_path: "a".into(),
            content: String::new(),
        };
        let err = job.apply(&context(store)).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_writer_applies_in_order_and_counts_failures() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone());
        let counters = ctx.counters.clone();
        let queue = PersistQueue::spawn(ctx, "chat/c1".into());

        queue.enqueue(PersistJob::SaveMessage(json!({"id": "m1", "content": "a"})));
        queue.enqueue(PersistJob::UpdateMessage {
            id: "m1".into(),
            partial: json!({"content": "b"}),
        });
        queue.enqueue(PersistJob::UpdateMessage {
            id: "missing".into(),
            partial: json!({}),
        });
        drop(queue);

        for _ in 0..100 {
            let done = counters.persisted_writes.load(Ordering::Relaxed)
                + counters.persistence_failures.load(Ordering::Relaxed);
            if done == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(counters.persisted_writes.load(Ordering::Relaxed), 2);
        assert_eq!(counters.persistence_failures.load(Ordering::Relaxed), 1);
        assert_eq!(store.find(MESSAGES, "m1").unwrap().unwrap()["content"], "b");
    }

    #[tokio::test]
    async fn test_settled_waits_for_enqueued_jobs() {
        let store = Arc::new(MemoryStore::new());
        let queue = PersistQueue::spawn(context(store.clone()), "chat/c1".into());
        queue.settled(0).await;

        for i in 0..5 {
            queue.enqueue(PersistJob::SaveMessage(json!({"id": format!("m{i}")})));
        }
        assert_eq!(queue.enqueued(), 5);

        tokio::time::timeout(Duration::from_secs(2), queue.settled(queue.enqueued()))
            .await
            .unwrap();
        assert_eq!(store.count(MESSAGES), 5);
    }
}
