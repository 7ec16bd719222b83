// SPDX-License-Identifier: GPL-3.0-only

//! Fixed-size worker pool with bounded submission.
//!
//! The extraction dispatcher reads operation data serially and hands the
//! CPU-heavy decompress-and-place work to this pool. Submission blocks once
//! every worker is busy and the queue is full, so the dispatcher cannot read
//! ahead of what the workers can absorb.

use std::{
    sync::{
        mpsc::{self, Receiver, SyncSender},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A pool of OS threads executing submitted jobs in arbitrary order.
/// Dropping the pool closes the queue and joins every worker, so all
/// submitted jobs run to completion before the drop returns.
pub struct WorkerPool {
    tx: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "Worker pool requires at least one thread");

        let (tx, rx) = mpsc::sync_channel::<Job>(size);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..size)
            .map(|i| {
                let rx = Arc::clone(&rx);

                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || worker_loop(&rx))
                    .expect("Failed to spawn worker thread")
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
        }
    }

    /// Submit a job. Blocks while the queue is full.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        self.tx
            .as_ref()
            .unwrap()
            .send(Box::new(job))
            .expect("Worker threads exited early");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.tx.take());

        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: &Mutex<Receiver<Job>>) {
    loop {
        // The receiver lock is held only while dequeuing, not while the job
        // runs.
        let job = match rx.lock().unwrap().recv() {
            Ok(job) => job,
            Err(_) => break,
        };

        job();
    }
}

/// Counts in-flight jobs so the dispatcher can wait for one partition's
/// batch to drain before starting the next.
#[derive(Clone, Default)]
pub struct CompletionTracker {
    inner: Arc<(Mutex<u64>, Condvar)>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one pending job. Must happen before the job is submitted.
    pub fn register(&self) {
        let (count, _) = &*self.inner;
        *count.lock().unwrap() += 1;
    }

    /// Mark one registered job as finished.
    pub fn complete(&self) {
        let (count, cvar) = &*self.inner;
        let mut count = count.lock().unwrap();

        *count = count
            .checked_sub(1)
            .expect("More completions than registrations");

        if *count == 0 {
            cvar.notify_all();
        }
    }

    /// Block until every registered job has completed.
    pub fn wait(&self) {
        let (count, cvar) = &*self.inner;
        let mut count = count.lock().unwrap();

        while *count > 0 {
            count = cvar.wait(count).unwrap();
        }
    }
}
