use crate::engine::StorageEngine;
use crate::session::Session;
use crate::stats::{Stats, StatsPrinter, STATS_PRINT_PERIOD};
use crate::thread_pool::ThreadPool;
use crate::Result;
use std::net::{TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

/// A TCP socket server over the key value storage engine.
/// It listens for length-framed binary requests on a
/// [`SocketAddr`](https://doc.rust-lang.org/std/net/enum.SocketAddr.html)
/// and serves each accepted connection on a thread from a [`ThreadPool`].
///
/// Each connection gets a [`Session`] holding a clone of the engine and a
/// shared handle to the [`Stats`] counters; a dedicated timer thread reports
/// those counters to stderr once a minute.
///
/// # Example
/// Create a server on "127.0.0.1:4000" with a shared-queue worker pool and
/// the memory-mapped storage engine
/// ```no_run
/// use kvd::{KvdServer, MappedStore};
/// use kvd::thread_pool::{SharedQueueThreadPool, ThreadPool};
/// # use std::error::Error;
/// # fn main() -> Result<(), Box<dyn Error>> {
/// let engine = MappedStore::open("storage.bin")?;
/// let pool = SharedQueueThreadPool::new(kvd::default_pool_size())?;
/// let server = KvdServer::new(engine, pool)?;
/// server.run("127.0.0.1:4000")?;
/// #
/// # Ok(())
/// # }
/// ```
pub struct KvdServer<E: StorageEngine, P: ThreadPool> {
    /// the storage engine shared by every session
    engine: E,
    /// a pool of threads that drain accepted connections
    pool: P,
    /// the statistics counter bank
    stats: Arc<Stats>,
}

impl<E: StorageEngine, P: ThreadPool> KvdServer<E, P> {
    /// Create a new `KvdServer` over the given engine and thread pool.
    ///
    /// The statistics item total is seeded from the engine's current size.
    pub fn new(engine: E, pool: P) -> Result<Self> {
        let stats = Arc::new(Stats::new(engine.size()?));
        Ok(KvdServer {
            engine,
            pool,
            stats,
        })
    }

    /// a shared handle to the server's statistics counters
    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// binds the given address and serves connections until the listener
    /// fails
    ///
    /// # Errors
    /// returns an error if the address cannot be bound
    pub fn run<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        self.serve(listener)
    }

    /// serves connections from an already-bound listener.
    ///
    /// Accept errors are logged and accepting continues; they are never
    /// fatal.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("listening on {}", listener.local_addr()?);
        let _printer = StatsPrinter::spawn(Arc::clone(&self.stats), STATS_PRINT_PERIOD)?;

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let engine = self.engine.clone();
                    let stats = Arc::clone(&self.stats);
                    self.pool.spawn(move || match Session::new(stream, engine, stats) {
                        Ok(session) => {
                            if let Err(e) = session.run() {
                                error!("error serving client: {}", e);
                            }
                        }
                        Err(e) => error!("could not start session: {}", e),
                    });
                }
                Err(e) => error!("connection failed: {}", e),
            }
        }
        Ok(())
    }
}

/// the worker count used by the server binary: one thread per hardware
/// thread, less one reserved for the timer, floor one
pub fn default_pool_size() -> u32 {
    let cores = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.saturating_sub(1).max(1) as u32
}
