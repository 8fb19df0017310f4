use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::counters::Counters;

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Bounded pool of workers draining deferred cache-write tasks. Enqueueing
/// never blocks the response path: when the queue is full the task is
/// dropped and counted.
pub struct WorkerPool {
    queue: mpsc::Sender<Task>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_capacity: usize, counters: Arc<Counters>) -> Self {
        let (queue, receiver) = mpsc::channel::<Task>(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers)
            .map(|_| {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        let task = {
                            let mut guard = receiver.lock().await;
                            guard.recv().await
                        };
                        match task {
                            Some(task) => task.await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self {
            queue,
            workers,
            counters,
        }
    }

    pub fn add_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.queue.try_send(Box::pin(task)).is_err() {
            self.counters.record_dropped_task();
            warn!("cache write queue full; dropping task");
        }
    }

    /// Closes the queue, lets outstanding tasks drain, and joins the workers.
    pub async fn shutdown(self) {
        let Self { queue, workers, .. } = self;
        drop(queue);
        for worker in workers {
            let _ = worker.await;
        }
    }
}
