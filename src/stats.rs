//! Transmit statistics: counters per message type and per-worker gauges.
//!
//! Workers report into a [`Stats`] sink without blocking. [`WorkerStats`] is the
//! lock-free implementation used by the server; its gauges keep the maximum value
//! observed since the last report and are reset after each snapshot.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::protocol::MessageType;

/// Output format for statistics reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, clap::ValueEnum, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for machine consumption.
    Json,
}

/// Sink for the transmit path's counters.
///
/// Implementations must tolerate concurrent calls from every worker and must
/// never block or fail the caller.
pub trait Stats: Send + Sync {
    /// Counts one successfully sent message of the given type.
    fn inc_tx(&self, message_type: MessageType);
    /// Records the number of error queue reads the latest TX timestamp took.
    fn set_max_tx_ts_attempts(&self, worker_id: usize, attempts: i64);
    /// Records the number of subscriptions assigned to the worker.
    fn set_max_worker_load(&self, worker_id: usize, load: i64);
    /// Records the number of jobs waiting in the worker's queue.
    fn set_max_worker_queue(&self, worker_id: usize, depth: i64);
}

#[derive(Default)]
struct TxCounters {
    sync: AtomicU64,
    follow_up: AtomicU64,
    announce: AtomicU64,
    delay_resp: AtomicU64,
    other: AtomicU64,
}

#[derive(Default)]
struct WorkerGauges {
    max_tx_ts_attempts: AtomicI64,
    max_load: AtomicI64,
    max_queue: AtomicI64,
}

/// Lock-free statistics shared by all workers.
pub struct WorkerStats {
    tx: TxCounters,
    workers: Vec<WorkerGauges>,
    #[cfg(feature = "metrics")]
    metrics_enabled: bool,
}

impl WorkerStats {
    /// Creates statistics for `workers` send workers.
    pub fn new(workers: usize) -> Self {
        WorkerStats {
            tx: TxCounters::default(),
            workers: (0..workers).map(|_| WorkerGauges::default()).collect(),
            #[cfg(feature = "metrics")]
            metrics_enabled: false,
        }
    }

    /// Also forwards every update to the Prometheus recorder.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    fn gauges(&self, worker_id: usize) -> Option<&WorkerGauges> {
        let gauges = self.workers.get(worker_id);
        if gauges.is_none() {
            log::debug!("Stats update for unknown worker {}", worker_id);
        }
        gauges
    }

    /// Returns the number of sent messages of the given type.
    pub fn tx_count(&self, message_type: MessageType) -> u64 {
        self.counter(message_type).load(Ordering::Relaxed)
    }

    fn counter(&self, message_type: MessageType) -> &AtomicU64 {
        match message_type {
            MessageType::Sync => &self.tx.sync,
            MessageType::FollowUp => &self.tx.follow_up,
            MessageType::Announce => &self.tx.announce,
            MessageType::DelayResp => &self.tx.delay_resp,
            _ => &self.tx.other,
        }
    }

    /// Builds a snapshot of the current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_sync: self.tx.sync.load(Ordering::Relaxed),
            tx_follow_up: self.tx.follow_up.load(Ordering::Relaxed),
            tx_announce: self.tx.announce.load(Ordering::Relaxed),
            tx_delay_resp: self.tx.delay_resp.load(Ordering::Relaxed),
            workers: self
                .workers
                .iter()
                .enumerate()
                .map(|(id, g)| WorkerSnapshot {
                    id,
                    max_tx_ts_attempts: g.max_tx_ts_attempts.load(Ordering::Relaxed),
                    max_load: g.max_load.load(Ordering::Relaxed),
                    max_queue: g.max_queue.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }

    /// Clears the per-worker gauges. Counters keep running.
    pub fn reset_gauges(&self) {
        for g in &self.workers {
            g.max_tx_ts_attempts.store(0, Ordering::Relaxed);
            g.max_load.store(0, Ordering::Relaxed);
            g.max_queue.store(0, Ordering::Relaxed);
        }
    }

    /// Takes a snapshot and starts a new reporting period.
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let snapshot = self.snapshot();
        self.reset_gauges();
        snapshot
    }
}

impl Stats for WorkerStats {
    fn inc_tx(&self, message_type: MessageType) {
        self.counter(message_type).fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        if self.metrics_enabled {
            crate::metrics::worker_metrics::record_tx(message_type);
        }
    }

    fn set_max_tx_ts_attempts(&self, worker_id: usize, attempts: i64) {
        if let Some(g) = self.gauges(worker_id) {
            g.max_tx_ts_attempts.fetch_max(attempts, Ordering::Relaxed);
        }
        #[cfg(feature = "metrics")]
        if self.metrics_enabled {
            crate::metrics::worker_metrics::record_tx_ts_attempts(worker_id, attempts);
        }
    }

    fn set_max_worker_load(&self, worker_id: usize, load: i64) {
        if let Some(g) = self.gauges(worker_id) {
            g.max_load.fetch_max(load, Ordering::Relaxed);
        }
        #[cfg(feature = "metrics")]
        if self.metrics_enabled {
            crate::metrics::worker_metrics::set_worker_load(worker_id, load);
        }
    }

    fn set_max_worker_queue(&self, worker_id: usize, depth: i64) {
        if let Some(g) = self.gauges(worker_id) {
            g.max_queue.fetch_max(depth, Ordering::Relaxed);
        }
        #[cfg(feature = "metrics")]
        if self.metrics_enabled {
            crate::metrics::worker_metrics::set_worker_queue(worker_id, depth);
        }
    }
}

/// Per-worker part of a snapshot.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub max_tx_ts_attempts: i64,
    pub max_load: i64,
    pub max_queue: i64,
}

/// Serializable statistics snapshot.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StatsSnapshot {
    pub tx_sync: u64,
    pub tx_follow_up: u64,
    pub tx_announce: u64,
    pub tx_delay_resp: u64,
    pub workers: Vec<WorkerSnapshot>,
}

impl StatsSnapshot {
    /// Highest TX timestamp attempt count across all workers.
    pub fn max_tx_ts_attempts(&self) -> i64 {
        self.workers
            .iter()
            .map(|w| w.max_tx_ts_attempts)
            .max()
            .unwrap_or(0)
    }

    /// Prints the snapshot in the given format.
    pub fn print(&self, format: OutputFormat) {
        match format {
            OutputFormat::Text => self.print_text(),
            OutputFormat::Json => self.print_json(),
        }
    }

    fn print_text(&self) {
        println!("\n--- PTP TX Statistics ---");
        println!("Sync sent: {}", self.tx_sync);
        println!("Follow-Up sent: {}", self.tx_follow_up);
        println!("Announce sent: {}", self.tx_announce);
        println!("Delay-Response sent: {}", self.tx_delay_resp);
        println!("Max TX timestamp attempts: {}", self.max_tx_ts_attempts());
        for w in &self.workers {
            println!(
                "Worker {}: load={} queue={} txts_attempts={}",
                w.id, w.max_load, w.max_queue, w.max_tx_ts_attempts
            );
        }
    }

    fn print_json(&self) {
        match serde_json::to_string(self) {
            Ok(json) => println!("{}", json),
            Err(e) => log::error!("Failed to serialize statistics: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_counters_by_type() {
        let stats = WorkerStats::new(1);
        stats.inc_tx(MessageType::Sync);
        stats.inc_tx(MessageType::Sync);
        stats.inc_tx(MessageType::FollowUp);
        stats.inc_tx(MessageType::Announce);

        let snap = stats.snapshot();
        assert_eq!(snap.tx_sync, 2);
        assert_eq!(snap.tx_follow_up, 1);
        assert_eq!(snap.tx_announce, 1);
        assert_eq!(snap.tx_delay_resp, 0);
    }

    #[test]
    fn test_gauges_keep_maximum() {
        let stats = WorkerStats::new(2);
        stats.set_max_tx_ts_attempts(1, 3);
        stats.set_max_tx_ts_attempts(1, 7);
        stats.set_max_tx_ts_attempts(1, 2);
        stats.set_max_worker_queue(0, 5);
        stats.set_max_worker_queue(0, 1);

        let snap = stats.snapshot();
        assert_eq!(snap.workers[1].max_tx_ts_attempts, 7);
        assert_eq!(snap.workers[0].max_queue, 5);
        assert_eq!(snap.max_tx_ts_attempts(), 7);
    }

    #[test]
    fn test_snapshot_and_reset_clears_gauges_only() {
        let stats = WorkerStats::new(1);
        stats.inc_tx(MessageType::DelayResp);
        stats.set_max_worker_load(0, 12);

        let first = stats.snapshot_and_reset();
        assert_eq!(first.workers[0].max_load, 12);

        let second = stats.snapshot();
        assert_eq!(second.workers[0].max_load, 0);
        assert_eq!(second.tx_delay_resp, 1);
    }

    #[test]
    fn test_unknown_worker_is_ignored() {
        let stats = WorkerStats::new(1);
        stats.set_max_worker_load(5, 100);
        assert_eq!(stats.snapshot().workers.len(), 1);
        assert_eq!(stats.snapshot().workers[0].max_load, 0);
    }

    #[test]
    fn test_snapshot_json() {
        let stats = WorkerStats::new(1);
        stats.inc_tx(MessageType::Sync);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["tx_sync"], 1);
        assert_eq!(json["workers"][0]["id"], 0);
    }
}
