//! Thread pool used to deflate segments off the writer thread.
use crate::ext::mutex::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{
    Arc, Condvar, Mutex,
    mpsc::{Receiver, SyncSender, sync_channel},
};
use std::thread::{self, JoinHandle};

type Job<T> = Box<dyn FnOnce() -> T + Send + 'static>;

/// A simple generic thread pool.
///
/// Completed task results are collected in completion order; callers that
/// need submission order tag their results. Submission blocks while every
/// worker is busy and the bounded queue is full.
pub struct ThreadPool<T: Send + 'static> {
    sender: Option<SyncSender<Job<T>>>,
    workers: Vec<JoinHandle<()>>,
    results: Arc<Mutex<Vec<T>>>,
    /// Number of pending tasks (queued + running)
    pending: Arc<AtomicUsize>,
    pending_pair: Arc<(Mutex<()>, Condvar)>,
}

#[derive(Debug)]
/// Error type for [ThreadPool::execute]
pub enum ExecuteError {
    /// Pool is closed
    Closed,
}

impl std::error::Error for ExecuteError {}

impl std::fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecuteError::Closed => write!(f, "ThreadPool is closed"),
        }
    }
}

impl<T: Send + 'static> ThreadPool<T> {
    /// Create a new thread pool with `size` workers named `{name}{id}`.
    pub fn new(size: usize, name: &str) -> Result<Self, std::io::Error> {
        if size == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "worker size must be > 0",
            ));
        }

        let (tx, rx) = sync_channel::<Job<T>>(size);
        let receiver: Arc<Mutex<Receiver<Job<T>>>> = Arc::new(Mutex::new(rx));
        let results = Arc::new(Mutex::new(Vec::new()));
        let pending = Arc::new(AtomicUsize::new(0));
        let pending_pair = Arc::new((Mutex::new(()), Condvar::new()));

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let rx = Arc::clone(&receiver);
            let results = Arc::clone(&results);
            let pending = Arc::clone(&pending);
            let pending_pair = Arc::clone(&pending_pair);

            let handle = thread::Builder::new()
                .name(format!("{}{}", name, id))
                .spawn(move || {
                    loop {
                        let job = {
                            let guard = rx.lock_blocking();
                            guard.recv()
                        };
                        // Sender dropped
                        let Ok(job) = job else { break };
                        let res = job();
                        results.lock_blocking().push(res);
                        pending.fetch_sub(1, Ordering::SeqCst);
                        let (lock, cvar) = &*pending_pair;
                        let _g = lock.lock_blocking();
                        cvar.notify_all();
                    }
                })?;

            workers.push(handle);
        }

        Ok(ThreadPool {
            sender: Some(tx),
            workers,
            results,
            pending,
            pending_pair,
        })
    }

    /// Submit a task, blocking while the pool is saturated.
    pub fn execute<F>(&self, job: F) -> Result<(), ExecuteError>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(ExecuteError::Closed)?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(Box::new(job)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(ExecuteError::Closed);
        }
        Ok(())
    }

    /// Wait until all submitted tasks have completed. The pool stays usable.
    pub fn join(&self) {
        if self.pending.load(Ordering::SeqCst) == 0 {
            return;
        }

        let (lock, cvar) = &*self.pending_pair;
        let mut guard = lock.lock_blocking();
        while self.pending.load(Ordering::SeqCst) != 0 {
            guard = match cvar.wait(guard) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Wait for all submitted tasks, then drain their results.
    pub fn take_results(&self) -> Vec<T> {
        self.join();
        std::mem::take(&mut *self.results.lock_blocking())
    }
}

impl<T: Send + 'static> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        // Closing the channel ends the worker loops.
        self.sender.take();
        while let Some(handle) = self.workers.pop() {
            let _ = handle.join();
        }
    }
}

#[test]
fn test_threadpool_collects_all_results() {
    let pool = ThreadPool::new(3, "test-worker-").unwrap();
    for i in 0..20usize {
        pool.execute(move || i * 2).unwrap();
    }
    let mut results = pool.take_results();
    results.sort();
    assert_eq!(results, (0..20).map(|i| i * 2).collect::<Vec<_>>());
    assert!(pool.take_results().is_empty());
}

#[test]
fn test_threadpool_rejects_zero_workers() {
    assert!(ThreadPool::<()>::new(0, "none-").is_err());
}
