// Process-local priority task queue with a fixed worker pool.
// Priority descending, FIFO within a priority. Workers block on dequeue
// and drain on shutdown.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lakeflow_core::TriggerType;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::executor::WorkflowExecutor;

#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub workflow_name: String,
    pub task_name: String,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    pub task_config: Value,
}

struct QueueEntry {
    task: QueuedTask,
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, lower sequence (earlier) first
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    notify: Notify,
    running: AtomicBool,
    seq: AtomicU64,
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
    workers: Arc<tokio::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                heap: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                running: AtomicBool::new(false),
                seq: AtomicU64::new(0),
            }),
            workers: Arc::new(tokio::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(AtomicOrdering::SeqCst)
    }

    pub fn enqueue(&self, task: QueuedTask) {
        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::SeqCst);
        info!(
            workflow = %task.workflow_name,
            task = %task.task_name,
            priority = task.priority,
            "Task queued"
        );
        self.inner
            .heap
            .lock()
            .expect("queue mutex poisoned")
            .push(QueueEntry { task, seq });
        self.inner.notify.notify_one();
    }

    fn pop(&self) -> Option<QueuedTask> {
        self.inner
            .heap
            .lock()
            .expect("queue mutex poisoned")
            .pop()
            .map(|e| e.task)
    }

    /// Blocks until an item arrives or the queue shuts down.
    /// None means shutdown with an empty queue.
    pub async fn dequeue(&self) -> Option<QueuedTask> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.pop() {
                return Some(task);
            }
            if !self.is_running() {
                return None;
            }
            notified.await;
        }
    }

    pub fn size(&self) -> usize {
        self.inner.heap.lock().expect("queue mutex poisoned").len()
    }

    pub fn clear(&self) {
        self.inner
            .heap
            .lock()
            .expect("queue mutex poisoned")
            .clear();
    }

    pub async fn start(&self, num_workers: usize, executor: WorkflowExecutor) {
        if self.inner.running.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock().await;
        for worker_id in 0..num_workers {
            let queue = self.clone();
            let executor = executor.clone();
            workers.push(tokio::spawn(async move {
                queue.worker_loop(worker_id, executor).await;
            }));
        }
        info!(workers = num_workers, "Task queue started");
    }

    /// Wake blocked workers, drain, and join them all
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, AtomicOrdering::SeqCst) {
            return;
        }
        self.inner.notify.notify_waiters();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
        info!("Task queue stopped");
    }

    pub async fn set_worker_pool_size(&self, num_workers: usize, executor: WorkflowExecutor) {
        self.stop().await;
        self.start(num_workers, executor).await;
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    async fn worker_loop(&self, worker_id: usize, executor: WorkflowExecutor) {
        while let Some(task) = self.dequeue().await {
            info!(
                worker = worker_id,
                workflow = %task.workflow_name,
                task = %task.task_name,
                "Processing queued task"
            );
            if let Err(e) = executor
                .execute_workflow(&task.workflow_name, TriggerType::Manual)
                .await
            {
                error!(
                    worker = worker_id,
                    workflow = %task.workflow_name,
                    error = %e,
                    "Queued workflow failed"
                );
            }
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(name: &str, priority: i32) -> QueuedTask {
        QueuedTask {
            workflow_name: name.into(),
            task_name: name.into(),
            priority,
            queued_at: Utc::now(),
            task_config: json!(null),
        }
    }

    #[tokio::test]
    async fn priority_order_with_fifo_ties() {
        let queue = TaskQueue::new();
        queue.inner.running.store(true, AtomicOrdering::SeqCst);
        queue.enqueue(task("low", 1));
        queue.enqueue(task("high", 10));
        queue.enqueue(task("mid-a", 5));
        queue.enqueue(task("mid-b", 5));

        assert_eq!(queue.dequeue().await.unwrap().workflow_name, "high");
        assert_eq!(queue.dequeue().await.unwrap().workflow_name, "mid-a");
        assert_eq!(queue.dequeue().await.unwrap().workflow_name, "mid-b");
        assert_eq!(queue.dequeue().await.unwrap().workflow_name, "low");
    }

    #[tokio::test]
    async fn size_and_clear() {
        let queue = TaskQueue::new();
        queue.enqueue(task("a", 0));
        queue.enqueue(task("b", 0));
        assert_eq!(queue.size(), 2);
        queue.clear();
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_dequeue() {
        let queue = TaskQueue::new();
        queue.inner.running.store(true, AtomicOrdering::SeqCst);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;

        queue.inner.running.store(false, AtomicOrdering::SeqCst);
        queue.inner.notify.notify_waiters();
        let result = waiter.await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn drains_before_shutdown_returns_none() {
        let queue = TaskQueue::new();
        queue.inner.running.store(true, AtomicOrdering::SeqCst);
        queue.enqueue(task("pending", 0));
        queue.inner.running.store(false, AtomicOrdering::SeqCst);

        // Item still present: dequeue drains it before reporting shutdown
        assert!(queue.dequeue().await.is_some());
        assert!(queue.dequeue().await.is_none());
    }
}
