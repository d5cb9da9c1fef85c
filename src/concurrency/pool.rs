//! Bounded task queue plus a fixed set of worker threads
//!
//! `submit` blocks while the queue is full, which pushes back on the
//! producer (for example a parser reading an import stream) instead of
//! buffering without limit.

use crossbeam::channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool fed by a bounded queue
pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    completed: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Start `workers` threads sharing a queue of `queue_size` tasks
    pub fn new(name: &str, workers: usize, queue_size: usize) -> std::io::Result<Self> {
        let (sender, receiver): (Sender<Task>, Receiver<Task>) = bounded(queue_size.max(1));
        let completed = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let receiver = receiver.clone();
            let completed = completed.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        task();
                        completed.fetch_add(1, Ordering::Relaxed);
                    }
                })?;
            handles.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            workers: handles,
            completed,
        })
    }

    /// Queue a task, blocking while the queue is full.
    /// Returns false if the pool is shut down.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.sender {
            Some(s) => s.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Tasks finished so far
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Run queued tasks to completion and stop the workers
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.sender.take();
        for w in self.workers.drain(..) {
            if w.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_all_tasks_run() {
        let pool = WorkerPool::new("test", 3, 2).unwrap();
        let sum = Arc::new(AtomicU64::new(0));
        for i in 1..=100u64 {
            let sum = sum.clone();
            assert!(pool.submit(move || {
                sum.fetch_add(i, Ordering::Relaxed);
            }));
        }
        pool.join();
        assert_eq!(sum.load(Ordering::Relaxed), 5050);
    }

    #[test]
    fn test_submit_blocks_when_full() {
        let pool = WorkerPool::new("slow", 1, 1).unwrap();
        let (tx, rx) = crossbeam::channel::bounded::<()>(0);
        // occupies the only worker until released
        pool.submit(move || {
            let _ = rx.recv();
        });
        // fills the queue
        pool.submit(|| {});

        let started = std::time::Instant::now();
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(100));
                tx.send(()).unwrap();
            });
            pool.submit(|| {});
        });
        assert!(started.elapsed() >= Duration::from_millis(90));
        pool.join();
    }
}
