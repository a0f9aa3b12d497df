//! In-process rendering of the distributed task queue the fetch
//! continuations ride on: unbounded hand-off, countdown re-enqueue, and a
//! worker pool that runs until every outstanding task (including delayed
//! ones) has been handled.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

struct QueueInner<T> {
    tx: StdMutex<Option<UnboundedSender<T>>>,
    pending: AtomicUsize,
    drained: Notify,
}

pub struct TaskQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        TaskQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> TaskQueue<T> {
    pub fn new() -> (TaskQueue<T>, UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = TaskQueue {
            inner: Arc::new(QueueInner {
                tx: StdMutex::new(Some(tx)),
                pending: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        };
        (queue, rx)
    }

    pub fn enqueue(&self, task: T) {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        self.send_counted(task);
    }

    /// Countdown re-enqueue: the task counts as outstanding for the whole
    /// delay, so the queue cannot drain out from under it.
    pub fn enqueue_after(&self, delay: Duration, task: T) {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.send_counted(task);
        });
    }

    fn send_counted(&self, task: T) {
        let tx = self.inner.tx.lock().expect("queue mutex poisoned").clone();
        let delivered = match tx {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        };
        if !delivered {
            warn!("task dropped: queue already closed");
            self.finish_one();
        }
    }

    /// Called by workers once a task (and everything it enqueued) is
    /// accounted for.
    pub fn finish_one(&self) {
        if self.inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }

    pub async fn drained(&self) {
        loop {
            let drained = self.inner.drained.notified();
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }

    pub fn close(&self) {
        self.inner.tx.lock().expect("queue mutex poisoned").take();
    }
}

/// Runs `worker_count` workers over the queue until it drains, then shuts
/// them down. The handler re-enqueues continuations through its own clone of
/// the queue.
pub async fn process<T, H, Fut>(
    queue: TaskQueue<T>,
    rx: UnboundedReceiver<T>,
    worker_count: usize,
    handler: H,
) where
    T: Send + 'static,
    H: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let workers: Vec<_> = (0..worker_count.max(1))
        .map(|id| {
            let rx = rx.clone();
            let queue = queue.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    let task = { rx.lock().await.recv().await };
                    match task {
                        Some(task) => {
                            handler(task).await;
                            queue.finish_one();
                        }
                        None => break,
                    }
                }
                debug!("queue worker {id} finished");
            })
        })
        .collect();

    queue.drained().await;
    queue.close();
    for worker in workers {
        if let Err(err) = worker.await {
            warn!("queue worker exited abnormally: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;

    #[tokio::test]
    async fn processes_everything_including_continuations() {
        let (queue, rx) = TaskQueue::new();
        let handled = Arc::new(AtomicU64::new(0));

        for _ in 0..4 {
            queue.enqueue(3u32);
        }

        let handler = {
            let queue = queue.clone();
            let handled = handled.clone();
            move |remaining: u32| {
                let queue = queue.clone();
                let handled = handled.clone();
                async move {
                    handled.fetch_add(1, Ordering::AcqRel);
                    if remaining > 0 {
                        queue.enqueue(remaining - 1);
                    }
                }
            }
        };

        process(queue, rx, 4, handler).await;
        assert_eq!(handled.load(Ordering::Acquire), 16);
    }

    #[tokio::test]
    async fn delayed_tasks_keep_the_queue_alive() {
        let (queue, rx) = TaskQueue::new();
        let handled = Arc::new(AtomicU64::new(0));

        queue.enqueue_after(Duration::from_millis(50), 0u32);

        let handler = {
            let handled = handled.clone();
            move |_task: u32| {
                let handled = handled.clone();
                async move {
                    handled.fetch_add(1, Ordering::AcqRel);
                }
            }
        };

        process(queue, rx, 2, handler).await;
        assert_eq!(handled.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn empty_queue_drains_immediately() {
        let (queue, rx) = TaskQueue::<u32>::new();
        let handler = |_task: u32| async {};
        tokio::time::timeout(Duration::from_secs(1), process(queue, rx, 2, handler))
            .await
            .expect("an empty queue must not block");
    }
}
