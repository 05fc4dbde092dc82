//! Metrics recorded by the send workers.

use metrics::{counter, gauge, histogram};

use crate::protocol::MessageType;

/// Counts a sent message by type.
pub fn record_tx(message_type: MessageType) {
    counter!("ptp_tx_messages_total", "type" => message_type.as_str()).increment(1);
}

/// Records the number of error queue reads a TX timestamp took.
pub fn record_tx_ts_attempts(worker_id: usize, attempts: i64) {
    histogram!("ptp_tx_timestamp_attempts", "worker" => worker_id.to_string())
        .record(attempts as f64);
}

pub fn set_worker_load(worker_id: usize, load: i64) {
    gauge!("ptp_worker_load", "worker" => worker_id.to_string()).set(load as f64);
}

pub fn set_worker_queue(worker_id: usize, depth: i64) {
    gauge!("ptp_worker_queue_depth", "worker" => worker_id.to_string()).set(depth as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_functions_callable() {
        // Without an installed recorder these are no-ops.
        record_tx(MessageType::Sync);
        record_tx(MessageType::FollowUp);
        record_tx_ts_attempts(0, 3);
        set_worker_load(1, 12);
        set_worker_queue(1, 4);
    }
}
