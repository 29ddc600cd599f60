//! Fixed-size worker thread pool for per-key tasks.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use tracing::{debug, error};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Bounded pool of named OS threads fed through a shared channel.
///
/// A panicking task is logged and the worker keeps serving the queue.
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize) -> io::Result<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size.max(1));
        for index in 0..size.max(1) {
            let receiver = receiver.clone();
            let thread_name = format!("{name}-{index}");
            let worker = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(&thread_name, &receiver))?;
            workers.push(worker);
        }

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue a task. Returns `false` when the pool has been closed.
    pub fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Ok(sender) = self.sender.lock() else {
            return false;
        };
        match sender.as_ref() {
            Some(sender) => sender.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Stop accepting tasks. Queued tasks still run.
    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }

    /// Close the pool and wait for every worker to finish the queue.
    pub fn join(&self) {
        self.close();
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        for worker in workers {
            if worker.join().is_err() {
                error!(pool = %self.name, "worker thread terminated abnormally");
            }
        }
        debug!(pool = %self.name, "worker pool joined");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(name: &str, receiver: &Mutex<mpsc::Receiver<Task>>) {
    loop {
        let task = match receiver.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => return,
        };
        let Ok(task) = task else {
            // channel closed and drained
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!(worker = name, "task panicked");
        }
    }
}
