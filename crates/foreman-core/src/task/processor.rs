use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use foreman_protocol::{Task, TaskStatus, UpdateTask, task_metadata};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::TaskQueue;
use crate::error::{ForemanError, Result};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Processes dequeued tasks.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        (self)(task.clone()).await
    }
}

/// Returned by a handler when the task was cancelled rather than failed.
#[derive(Debug, thiserror::Error)]
#[error("task cancelled: {0}")]
pub struct TaskCancelled(pub String);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Maximum tasks processed at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_concurrency() -> usize {
    5
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ProcessorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

struct PollLoop {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Task Processor
///
/// Polls the queue and runs every registered handler on each task, with at
/// most `concurrency` tasks in flight.
pub struct TaskProcessor {
    queue: Arc<TaskQueue>,
    config: ProcessorConfig,
    handlers: RwLock<Vec<Arc<dyn TaskHandler>>>,
    active: AtomicUsize,
    running: AtomicBool,
    poll_loop: Mutex<Option<PollLoop>>,
}

impl TaskProcessor {
    pub fn new(queue: Arc<TaskQueue>, config: ProcessorConfig) -> Self {
        Self {
            queue,
            config,
            handlers: RwLock::new(Vec::new()),
            active: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            poll_loop: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Handlers run in registration order.
    pub async fn register(&self, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().await.push(handler);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Start the poll loop. The first poll happens immediately.
    pub async fn start(self: &Arc<Self>) {
        let mut poll_loop = self.poll_loop.lock().await;
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Task processor already running");
            return;
        }

        let shutdown = CancellationToken::new();
        let this = Arc::clone(self);
        let stop = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.poll_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => this.poll().await,
                }
            }
            debug!("task poll loop exited");
        });

        *poll_loop = Some(PollLoop { shutdown, handle });
        info!(
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            "Task processor started"
        );
    }

    async fn poll(self: &Arc<Self>) {
        let slots = self.config.concurrency.saturating_sub(self.active_count());
        for _ in 0..slots {
            let Some(task) = self.queue.dequeue().await else {
                break;
            };
            self.active.fetch_add(1, Ordering::SeqCst);
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let task_id = task.id;
                if let Err(e) = this.process(task).await {
                    debug!(task_id = %task_id, error = %e, "task processing returned error");
                }
                this.active.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    /// Run every handler on `task` and record the outcome on the queue.
    pub async fn process(&self, task: Task) -> Result<()> {
        let handlers = self.handlers.read().await.clone();
        if handlers.is_empty() {
            let message = "no task handlers registered";
            self.finish(&task, TaskStatus::Failed, Some(message)).await;
            return Err(anyhow!(message).into());
        }

        let task = self
            .queue
            .update(task.id, UpdateTask::status(TaskStatus::InProgress))
            .await?;
        info!(task_id = %task.id, title = %task.title, "Processing task");

        let mut outcome = Ok(());
        for handler in &handlers {
            let result = match AssertUnwindSafe(handler.handle(&task)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("task handler panicked")),
            };
            if let Err(e) = result {
                outcome = Err(e);
                break;
            }
        }

        match outcome {
            Ok(()) => {
                self.finish(&task, TaskStatus::Completed, None).await;
                info!(task_id = %task.id, "Task completed");
                Ok(())
            }
            Err(e) if e.downcast_ref::<TaskCancelled>().is_some() => {
                let message = e.to_string();
                self.finish(&task, TaskStatus::Canceled, Some(&message)).await;
                info!(task_id = %task.id, "Task cancelled");
                Ok(())
            }
            Err(e) => {
                let message = format!("{:#}", e);
                self.finish(&task, TaskStatus::Failed, Some(&message)).await;
                error!(task_id = %task.id, error = %message, "Task failed");
                Err(ForemanError::Unknown(e))
            }
        }
    }

    async fn finish(&self, task: &Task, status: TaskStatus, error: Option<&str>) {
        let metadata = error.map(|message| {
            let mut map = serde_json::Map::new();
            map.insert(task_metadata::ERROR.to_string(), message.into());
            map
        });
        let update = UpdateTask {
            status: Some(status),
            metadata,
            ..Default::default()
        };
        if let Err(e) = self.queue.update(task.id, update).await {
            // Deleted while running
            warn!(task_id = %task.id, error = %e, "Failed to record task status");
        }
    }

    /// Stop scheduling polls. Once this returns no further task is
    /// dequeued; tasks already dequeued keep running.
    pub async fn stop_polling(&self) {
        let poll_loop = self.poll_loop.lock().await.take();
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(poll_loop) = poll_loop {
            poll_loop.shutdown.cancel();
            if let Err(e) = poll_loop.handle.await {
                error!("Task poll loop ended abnormally: {}", e);
            }
        }
    }

    /// Wait for every in-flight `process` call to finish.
    pub async fn drain(&self) {
        while self.active_count() > 0 {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Stop polling and wait for in-flight tasks to drain.
    pub async fn stop(&self) {
        let was_running = self.is_running();
        self.stop_polling().await;
        self.drain().await;
        if was_running {
            info!("Task processor stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_protocol::{CreateTask, TaskFilter};
    use std::sync::Mutex as StdMutex;

    fn processor(queue: &Arc<TaskQueue>, concurrency: usize) -> Arc<TaskProcessor> {
        Arc::new(TaskProcessor::new(
            queue.clone(),
            ProcessorConfig {
                concurrency,
                poll_interval_ms: 10,
            },
        ))
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_process_success_and_failure() {
        let queue = Arc::new(TaskQueue::new());
        let processor = processor(&queue, 1);
        processor
            .register(Arc::new(|task: Task| async move {
                if task.title == "bad" {
                    anyhow::bail!("boom");
                }
                Ok(())
            }))
            .await;

        let good = queue.create(CreateTask::new("p", "good")).await.unwrap();
        let bad = queue.create(CreateTask::new("p", "bad")).await.unwrap();

        processor.process(good.clone()).await.unwrap();
        assert_eq!(queue.get(good.id).await.unwrap().status, TaskStatus::Completed);

        let err = processor.process(bad.clone()).await.unwrap_err();
        assert!(matches!(err, ForemanError::Unknown(_)));
        let bad = queue.get(bad.id).await.unwrap();
        assert_eq!(bad.status, TaskStatus::Failed);
        assert_eq!(bad.metadata_str(task_metadata::ERROR), Some("boom"));
    }

    #[tokio::test]
    async fn test_first_handler_error_skips_rest() {
        let queue = Arc::new(TaskQueue::new());
        let processor = processor(&queue, 1);
        let calls = Arc::new(StdMutex::new(Vec::new()));

        let c = calls.clone();
        processor
            .register(Arc::new(move |_task: Task| {
                let c = c.clone();
                async move {
                    c.lock().unwrap().push("first");
                    Err::<(), _>(anyhow!("stop here"))
                }
            }))
            .await;
        let c = calls.clone();
        processor
            .register(Arc::new(move |_task: Task| {
                let c = c.clone();
                async move {
                    c.lock().unwrap().push("second");
                    Ok::<(), anyhow::Error>(())
                }
            }))
            .await;

        let task = queue.create(CreateTask::new("p", "t")).await.unwrap();
        assert!(processor.process(task).await.is_err());
        assert_eq!(*calls.lock().unwrap(), ["first"]);
    }

    #[tokio::test]
    async fn test_cancelled_handler_marks_canceled() {
        let queue = Arc::new(TaskQueue::new());
        let processor = processor(&queue, 1);
        processor
            .register(Arc::new(|_task: Task| async {
                Err::<(), anyhow::Error>(TaskCancelled("user".to_string()).into())
            }))
            .await;

        let task = queue.create(CreateTask::new("p", "t")).await.unwrap();
        processor.process(task.clone()).await.unwrap();
        assert_eq!(queue.get(task.id).await.unwrap().status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn test_no_handlers_is_error() {
        let queue = Arc::new(TaskQueue::new());
        let processor = processor(&queue, 1);
        let task = queue.create(CreateTask::new("p", "t")).await.unwrap();
        assert!(processor.process(task.clone()).await.is_err());
        assert_eq!(queue.get(task.id).await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_task() {
        let queue = Arc::new(TaskQueue::new());
        let processor = processor(&queue, 1);
        processor
            .register(Arc::new(|task: Task| async move {
                if !task.title.is_empty() {
                    panic!("handler bug");
                }
                Ok::<(), anyhow::Error>(())
            }))
            .await;
        let task = queue.create(CreateTask::new("p", "t")).await.unwrap();
        assert!(processor.process(task.clone()).await.is_err());
        assert_eq!(queue.get(task.id).await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let queue = Arc::new(TaskQueue::new());
        let processor = processor(&queue, 2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (f, p) = (in_flight.clone(), peak.clone());
        processor
            .register(Arc::new(move |_task: Task| {
                let (f, p) = (f.clone(), p.clone());
                async move {
                    let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    f.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            }))
            .await;

        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(queue.create(CreateTask::new("p", format!("t{}", i))).await.unwrap().id);
        }

        processor.start().await;
        assert!(processor.is_running());
        let q = queue.clone();
        let ids_check = ids.clone();
        wait_until(move || {
            let q = q.clone();
            let ids = ids_check.clone();
            async move {
                for id in ids {
                    if q.get(id).await.unwrap().status != TaskStatus::Completed {
                        return false;
                    }
                }
                true
            }
        })
        .await;
        processor.stop().await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert!(!processor.is_running());
        assert_eq!(processor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_at_most_concurrency_tasks_in_progress() {
        let queue = Arc::new(TaskQueue::new());
        let processor = processor(&queue, 2);
        let release = Arc::new(tokio::sync::Semaphore::new(0));

        let gate = release.clone();
        processor
            .register(Arc::new(move |_task: Task| {
                let gate = gate.clone();
                async move {
                    let _permit = gate.acquire().await?;
                    Ok::<(), anyhow::Error>(())
                }
            }))
            .await;

        for i in 0..5 {
            queue.create(CreateTask::new("p", format!("t{}", i))).await.unwrap();
        }
        processor.start().await;

        let p = processor.clone();
        wait_until(move || {
            let p = p.clone();
            async move { p.active_count() == 2 }
        })
        .await;
        // Several more polls while both handlers stay blocked
        tokio::time::sleep(Duration::from_millis(50)).await;

        let count = |status: TaskStatus| {
            let q = queue.clone();
            async move {
                q.list(&TaskFilter {
                    status: Some(status),
                    ..Default::default()
                })
                .await
                .len()
            }
        };
        assert_eq!(count(TaskStatus::InProgress).await, 2);
        assert_eq!(count(TaskStatus::Pending).await, 3);
        assert_eq!(processor.active_count(), 2);

        release.add_permits(5);
        let q = queue.clone();
        wait_until(move || {
            let q = q.clone();
            async move {
                q.list(&TaskFilter::default())
                    .await
                    .iter()
                    .all(|t| t.status == TaskStatus::Completed)
            }
        })
        .await;
        processor.stop().await;
        assert_eq!(count(TaskStatus::Completed).await, 5);
    }

    #[tokio::test]
    async fn test_stop_polling_leaves_queue_untouched() {
        let queue = Arc::new(TaskQueue::new());
        let processor = processor(&queue, 1);
        processor
            .register(Arc::new(|_task: Task| async { Ok::<(), anyhow::Error>(()) }))
            .await;

        processor.start().await;
        processor.stop_polling().await;
        assert!(!processor.is_running());

        let task = queue.create(CreateTask::new("p", "late")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        processor.drain().await;
        assert_eq!(queue.get(task.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_stop_waits_for_active_work() {
        let queue = Arc::new(TaskQueue::new());
        let processor = processor(&queue, 1);
        processor
            .register(Arc::new(|_task: Task| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<(), anyhow::Error>(())
            }))
            .await;
        let task = queue.create(CreateTask::new("p", "slow")).await.unwrap();

        processor.start().await;
        let p = processor.clone();
        wait_until(move || {
            let p = p.clone();
            async move { p.active_count() == 1 }
        })
        .await;

        processor.stop().await;
        assert_eq!(processor.active_count(), 0);
        assert_eq!(queue.get(task.id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_double_start_is_noop() {
        let queue = Arc::new(TaskQueue::new());
        let processor = processor(&queue, 1);
        processor.start().await;
        processor.start().await;
        assert!(processor.is_running());
        processor.stop().await;
        processor.stop().await;
        assert!(!processor.is_running());
    }
}
