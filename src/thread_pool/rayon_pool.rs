use super::ThreadPool;
use crate::{KvdError, Result};
use tracing::debug;

/// A thread pool backed by [`rayon`]'s work-stealing scheduler.
///
/// [`rayon`]: https://docs.rs/rayon/latest/rayon/index.html
pub struct RayonThreadPool {
    pool: rayon::ThreadPool,
}

impl ThreadPool for RayonThreadPool {
    fn new(threads: u32) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads as usize)
            .build()
            .map_err(|e| KvdError::StringErr(format!("could not build thread pool: {}", e)))?;
        debug!("created rayon pool with {} threads", threads);
        Ok(RayonThreadPool { pool })
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(job);
    }
}
