//! Worker pools that run connection-serving jobs for the server.
use crate::Result;

/// A pool of threads that jobs can be spawned onto.
///
/// The server spawns one job per accepted connection; the job runs that
/// connection's session loop to completion.
pub trait ThreadPool {
    /// creates a pool with the given number of `threads`
    ///
    /// # Errors
    /// returns an error when the underlying threads could not be created
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized;

    /// runs `job` on one of the pool's threads
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}

mod rayon_pool;
mod shared_queue;

pub use self::rayon_pool::RayonThreadPool;
pub use self::shared_queue::SharedQueueThreadPool;
