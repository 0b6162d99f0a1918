//! Aggregate operation counters and the timer thread that reports them.

use crate::protocol::{ErrorCode, Operation};
use crate::Result;
use crossbeam::channel::{self, Sender};
use crossbeam::select;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// how often the server reports statistics
pub const STATS_PRINT_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct OperationStats {
    successful: AtomicU64,
    failed: AtomicU64,
}

/// Counters for sent and received commands, updated from worker threads
/// without locking and reported periodically to stderr:
/// - number of items in the database
/// - number of successful/failed INSERTs, UPDATEs, DELETEs and GETs
#[derive(Debug)]
pub struct Stats {
    total_items: AtomicU64,
    // indexed by the operation's wire tag
    operations: [OperationStats; 4],
}

impl Stats {
    /// creates a counter bank seeded with the store's current item count
    pub fn new(initial_items: u64) -> Self {
        Stats {
            total_items: AtomicU64::new(initial_items),
            operations: Default::default(),
        }
    }

    /// records the outcome of one request.
    ///
    /// A successful INSERT increments the item total and a successful DELETE
    /// decrements it; UPDATE and GET never change it.
    pub fn update(&self, operation: Operation, error: ErrorCode) {
        let stats = &self.operations[operation as usize];
        if error.is_none() {
            stats.successful.fetch_add(1, Ordering::Relaxed);
            match operation {
                Operation::Insert => {
                    self.total_items.fetch_add(1, Ordering::Relaxed);
                }
                Operation::Delete => {
                    self.total_items.fetch_sub(1, Ordering::Relaxed);
                }
                Operation::Update | Operation::Get => {}
            }
        } else {
            stats.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// the current item total as tracked by this counter bank
    pub fn total_items(&self) -> u64 {
        self.total_items.load(Ordering::Relaxed)
    }

    /// the (successful, failed) counters for one operation
    pub fn operation_counts(&self, operation: Operation) -> (u64, u64) {
        let stats = &self.operations[operation as usize];
        (
            stats.successful.load(Ordering::Relaxed),
            stats.failed.load(Ordering::Relaxed),
        )
    }

    /// snapshots every counter and writes the summary block to stderr
    pub fn print(&self) {
        let mut report = format!(
            "Total items currently in Database: {}\n",
            self.total_items()
        );
        for operation in Operation::ALL {
            let (successful, failed) = self.operation_counts(operation);
            report.push_str(&format!(
                "Total {} attempts since server's start (successful/failed): {}/{}\n",
                operation, successful, failed
            ));
        }
        // the report goes to the diagnostic stream directly, it is not a log event
        let _ = writeln!(io::stderr(), "{}", report);
    }
}

/// Drives [`Stats::print`] from a dedicated timer thread.
///
/// The timer advances by absolute expiry (previous expiry + period), so a
/// slow print does not push later prints back; if one overruns the period the
/// following prints catch up back-to-back. Dropping the handle stops the
/// thread.
#[derive(Debug)]
pub struct StatsPrinter {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl StatsPrinter {
    /// spawns the timer thread printing `stats` every `period`
    pub fn spawn(stats: Arc<Stats>, period: Duration) -> Result<StatsPrinter> {
        let (shutdown, shutdown_rx) = channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("kvd-stats".to_string())
            .spawn(move || {
                let mut expiry = Instant::now() + period;
                loop {
                    select! {
                        recv(channel::at(expiry)) -> _ => {
                            stats.print();
                            expiry += period;
                        }
                        recv(shutdown_rx) -> _ => {
                            debug!("stats printer stopping");
                            break;
                        }
                    }
                }
            })?;
        Ok(StatsPrinter {
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Drop for StatsPrinter {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_insert_and_delete_move_the_item_total() {
        let stats = Stats::new(5);

        stats.update(Operation::Insert, ErrorCode::None);
        stats.update(Operation::Insert, ErrorCode::None);
        assert_eq!(stats.total_items(), 7);

        stats.update(Operation::Delete, ErrorCode::None);
        assert_eq!(stats.total_items(), 6);

        assert_eq!(stats.operation_counts(Operation::Insert), (2, 0));
        assert_eq!(stats.operation_counts(Operation::Delete), (1, 0));
    }

    #[test]
    fn failures_count_as_failed_and_leave_the_total_alone() {
        let stats = Stats::new(0);

        stats.update(Operation::Insert, ErrorCode::InsertKeyAlreadyExists);
        stats.update(Operation::Delete, ErrorCode::DeleteKeyNotFound);
        stats.update(Operation::Get, ErrorCode::GetKeyNotFound);

        assert_eq!(stats.total_items(), 0);
        assert_eq!(stats.operation_counts(Operation::Insert), (0, 1));
        assert_eq!(stats.operation_counts(Operation::Delete), (0, 1));
        assert_eq!(stats.operation_counts(Operation::Get), (0, 1));
    }

    #[test]
    fn update_and_get_never_move_the_item_total() {
        let stats = Stats::new(3);

        stats.update(Operation::Update, ErrorCode::None);
        stats.update(Operation::Update, ErrorCode::UpdateValueAlreadyExists);
        stats.update(Operation::Get, ErrorCode::None);

        assert_eq!(stats.total_items(), 3);
        assert_eq!(stats.operation_counts(Operation::Update), (1, 1));
        assert_eq!(stats.operation_counts(Operation::Get), (1, 0));
    }

    #[test]
    fn same_value_update_counts_as_failed() {
        let stats = Stats::new(0);
        stats.update(Operation::Update, ErrorCode::UpdateValueAlreadyExists);
        assert_eq!(stats.operation_counts(Operation::Update), (0, 1));
    }

    #[test]
    fn printer_fires_and_stops_cleanly() {
        let stats = Arc::new(Stats::new(0));
        let printer = StatsPrinter::spawn(Arc::clone(&stats), Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(30));
        drop(printer);
    }
}
