//! Background task runtime with per-resource write reservations.
//!
//! Long-running registry operations (sync, signing, reclaim, blob-upload
//! commits) declare the resources they mutate before running. The runtime
//! guarantees at most one task holds the write reservation on a resource at
//! a time, which serializes repository-version creation per repository
//! without any global lock. Readers never take reservations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A required write reservation is already held.
    #[error("resource busy: {0}")]
    Busy(String),
    #[error("task cancelled")]
    Cancelled,
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task failed: {0}")]
    Failed(String),
    #[error("unknown task: {0}")]
    UnknownTask(Uuid),
}

/// Identifies a mutable resource a task reserves for writing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Repository,
    Namespace,
    /// The registry-wide content graph; reserved by the orphan reclaim pass.
    Content,
    Upload,
}

impl ResourceKey {
    pub fn repository(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Repository,
            id: name.into(),
        }
    }

    pub fn namespace(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Namespace,
            id: name.into(),
        }
    }

    pub fn content() -> Self {
        Self {
            kind: ResourceKind::Content,
            id: String::new(),
        }
    }

    pub fn upload(uuid: &Uuid) -> Self {
        Self {
            kind: ResourceKind::Upload,
            id: uuid.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Waiting,
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct TaskRecord {
    pub id: Uuid,
    pub name: String,
    pub state: TaskState,
    pub progress: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Handed to task bodies for cancellation checks and progress reporting.
#[derive(Clone)]
pub struct TaskContext {
    id: Uuid,
    cancel: watch::Receiver<bool>,
    runtime: TaskRuntime,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves when the task is asked to cancel.
    pub async fn cancelled(&mut self) {
        while !*self.cancel.borrow() {
            if self.cancel.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn report_progress(&self, message: impl Into<String>) {
        self.runtime
            .update_record(&self.id, |record| record.progress = Some(message.into()));
    }
}

/// Owned handle to a spawned background task.
pub struct TaskHandle {
    pub id: Uuid,
    cancel_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<Result<()>>,
}

impl TaskHandle {
    /// Request cooperative cancellation. The task observes it at its next
    /// suspension point and leaves its resources at the last committed
    /// state.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub async fn wait(self) -> Result<()> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(Error::Panicked(format!("{e}"))),
            Err(_) => Err(Error::Cancelled),
        }
    }
}

#[derive(Default)]
struct Inner {
    reservations: Mutex<HashMap<ResourceKey, Arc<tokio::sync::Mutex<()>>>>,
    tasks: Mutex<HashMap<Uuid, TaskRecord>>,
}

/// The shared task runtime. Cloning is cheap; all clones share reservation
/// and task state.
#[derive(Clone, Default)]
pub struct TaskRuntime {
    inner: Arc<Inner>,
}

impl TaskRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &ResourceKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut reservations = self
            .inner
            .reservations
            .lock()
            .expect("reservation table mutex poisoned");
        reservations.entry(key.clone()).or_default().clone()
    }

    /// Sorted acquisition keeps concurrent multi-resource tasks from
    /// deadlocking against each other.
    async fn acquire(&self, mut resources: Vec<ResourceKey>) -> Vec<OwnedMutexGuard<()>> {
        resources.sort();
        resources.dedup();
        let mut guards = Vec::with_capacity(resources.len());
        for key in resources {
            let lock = self.lock_for(&key);
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    fn try_acquire(&self, mut resources: Vec<ResourceKey>) -> Result<Vec<OwnedMutexGuard<()>>> {
        resources.sort();
        resources.dedup();
        let mut guards = Vec::with_capacity(resources.len());
        for key in resources {
            let lock = self.lock_for(&key);
            match lock.try_lock_owned() {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    return Err(Error::Busy(format!("{:?}:{}", key.kind, key.id)));
                }
            }
        }
        Ok(guards)
    }

    /// Run `fut` while holding write reservations on `resources`, waiting
    /// for them to free up first.
    pub async fn run_exclusive<T, Fut>(&self, resources: Vec<ResourceKey>, fut: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let _guards = self.acquire(resources).await;
        fut.await
    }

    /// Run `fut` only if all write reservations are immediately available;
    /// otherwise fail with [`Error::Busy`] so callers can surface `429 Too
    /// Many Requests`.
    pub async fn try_run_exclusive<T, Fut>(&self, resources: Vec<ResourceKey>, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = T>,
    {
        let _guards = self.try_acquire(resources)?;
        Ok(fut.await)
    }

    /// Spawn a named background task holding write reservations on
    /// `resources` for its whole run.
    pub fn spawn<F, Fut>(
        &self,
        name: impl Into<String>,
        resources: Vec<ResourceKey>,
        f: F,
    ) -> TaskHandle
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let name = name.into();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        self.insert_record(TaskRecord {
            id,
            name: name.clone(),
            state: TaskState::Waiting,
            progress: None,
            created_at: Utc::now(),
            finished_at: None,
        });

        let runtime = self.clone();
        let ctx = TaskContext {
            id,
            cancel: cancel_rx,
            runtime: runtime.clone(),
        };

        let join = tokio::spawn(async move {
            let _guards = runtime.acquire(resources).await;
            if ctx.is_cancelled() {
                runtime.finish_record(&id, TaskState::Cancelled);
                return Err(Error::Cancelled);
            }
            runtime.update_record(&id, |r| r.state = TaskState::Running);
            tracing::debug!(task = %name, %id, "task running");
            match f(ctx).await {
                Ok(()) => {
                    runtime.finish_record(&id, TaskState::Completed);
                    Ok(())
                }
                Err(msg) => {
                    tracing::warn!(task = %name, %id, "task failed: {msg}");
                    runtime.finish_record(&id, TaskState::Failed(msg.clone()));
                    Err(Error::Failed(msg))
                }
            }
        });

        TaskHandle {
            id,
            cancel_tx,
            join,
        }
    }

    pub fn get_record(&self, id: &Uuid) -> Option<TaskRecord> {
        self.inner
            .tasks
            .lock()
            .expect("task table mutex poisoned")
            .get(id)
            .cloned()
    }

    fn insert_record(&self, record: TaskRecord) {
        self.inner
            .tasks
            .lock()
            .expect("task table mutex poisoned")
            .insert(record.id, record);
    }

    fn update_record(&self, id: &Uuid, f: impl FnOnce(&mut TaskRecord)) {
        let mut tasks = self.inner.tasks.lock().expect("task table mutex poisoned");
        if let Some(record) = tasks.get_mut(id) {
            f(record);
        }
    }

    fn finish_record(&self, id: &Uuid, state: TaskState) {
        self.update_record(id, |record| {
            record.state = state;
            record.finished_at = Some(Utc::now());
        });
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn exclusive_runs_serialize_per_resource() {
        let runtime = TaskRuntime::new();
        let active = Arc::new(AtomicU32::new(0));
        let max_active = Arc::new(AtomicU32::new(0));

        let mut handles = vec![];
        for _ in 0..4 {
            let runtime = runtime.clone();
            let active = active.clone();
            let max_active = max_active.clone();
            handles.push(tokio::spawn(async move {
                runtime
                    .run_exclusive(vec![ResourceKey::repository("library/busybox")], async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn try_run_exclusive_reports_busy() {
        let runtime = TaskRuntime::new();
        let key = ResourceKey::repository("library/busybox");

        let blocker = runtime.lock_for(&key).lock_owned().await;

        let result = runtime
            .try_run_exclusive(vec![key.clone()], async { 42 })
            .await;
        assert!(matches!(result, Err(Error::Busy(_))));

        drop(blocker);
        let result = runtime.try_run_exclusive(vec![key], async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn distinct_resources_do_not_contend() {
        let runtime = TaskRuntime::new();
        let a = runtime
            .lock_for(&ResourceKey::repository("a"))
            .lock_owned()
            .await;
        let result = runtime
            .try_run_exclusive(vec![ResourceKey::repository("b")], async { "ok" })
            .await;
        assert_eq!(result.unwrap(), "ok");
        drop(a);
    }

    #[tokio::test]
    async fn spawned_task_lifecycle() {
        let runtime = TaskRuntime::new();
        let handle = runtime.spawn(
            "sync",
            vec![ResourceKey::repository("library/busybox")],
            |ctx| async move {
                ctx.report_progress("listing tags");
                Ok(())
            },
        );
        let id = handle.id;
        handle.wait().await.unwrap();
        let record = runtime.get_record(&id).unwrap();
        assert_eq!(record.state, TaskState::Completed);
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn cancelled_before_start_never_runs() {
        let runtime = TaskRuntime::new();
        let key = ResourceKey::repository("library/busybox");
        let blocker = runtime.lock_for(&key).lock_owned().await;

        let handle = runtime.spawn("sync", vec![key], |_ctx| async move {
            panic!("should not run");
        });
        handle.cancel();
        drop(blocker);
        assert!(matches!(handle.wait().await, Err(Error::Cancelled)));
    }
}
