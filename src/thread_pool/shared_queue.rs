use super::ThreadPool;
use crate::Result;
use crossbeam::channel::{self, Receiver, Sender};
use std::thread;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A thread pool fed from a shared job queue.
///
/// The queue is a crossbeam MPMC [`channel`] used single-producer,
/// multiple-consumer: the pool sends, the worker threads receive. A worker
/// that panics while running a job is replaced, so a misbehaving connection
/// cannot shrink the pool.
///
/// [`channel`]: https://docs.rs/crossbeam/0.8/crossbeam/channel/index.html
pub struct SharedQueueThreadPool {
    /// the sending half of the job queue
    queue: Sender<Job>,
}

impl ThreadPool for SharedQueueThreadPool {
    fn new(threads: u32) -> Result<Self> {
        let (queue, jobs) = channel::unbounded::<Job>();
        for _ in 0..threads {
            let worker = Worker(jobs.clone());
            thread::Builder::new().spawn(move || drain_jobs(worker))?;
        }
        debug!("started shared-queue pool with {} workers", threads);
        Ok(SharedQueueThreadPool { queue })
    }

    /// # Panics
    /// Panics if every worker thread has died and could not be replaced.
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue
            .send(Box::new(job))
            .expect("there are no worker threads left in the pool");
    }
}

/// The receiving half of the job queue, owned by one worker thread.
/// Its `Drop` impl respawns the worker if the thread is unwinding from a
/// panicked job.
#[derive(Clone)]
struct Worker(Receiver<Job>);

impl Drop for Worker {
    fn drop(&mut self) {
        if thread::panicking() {
            debug!("worker panicked, replacing it");
            let worker = self.clone();
            if let Err(e) = thread::Builder::new().spawn(move || drain_jobs(worker)) {
                error!("failed to replace a panicked worker: {}", e);
            }
        }
    }
}

/// blocks on the job queue and runs whatever arrives, until the pool is
/// dropped and the channel disconnects
fn drain_jobs(worker: Worker) {
    loop {
        match worker.0.recv() {
            Ok(job) => job(),
            Err(_) => {
                debug!("job queue closed, worker exiting");
                break;
            }
        }
    }
}
