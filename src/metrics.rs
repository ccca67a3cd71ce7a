//! Fetch metrics
//!
//! Recorded through the `metrics` facade. Nothing is exported unless the
//! embedding application installs a recorder.

use metrics::{counter, describe_counter, describe_histogram, histogram};

const TRANSFERS_STARTED: &str = "hiperfetch_transfers_started_total";
const TRANSFERS_COMPLETED: &str = "hiperfetch_transfers_completed_total";
const TRANSFERS_FAILED: &str = "hiperfetch_transfers_failed_total";
const BYTES_RECEIVED: &str = "hiperfetch_bytes_received_total";
const BODY_BYTES: &str = "hiperfetch_body_bytes";
const RECORDS_EMITTED: &str = "hiperfetch_records_emitted_total";
const INGEST_PAUSES: &str = "hiperfetch_ingest_pauses_total";

pub struct FetchMetrics;

impl FetchMetrics {
    /// Register descriptions once at startup.
    pub fn register_metrics() {
        describe_counter!(TRANSFERS_STARTED, "Transfers handed to the engine");
        describe_counter!(
            TRANSFERS_COMPLETED,
            "Transfers reaped from the engine, successful or not"
        );
        describe_counter!(TRANSFERS_FAILED, "Transfers that completed with an error");
        describe_counter!(BYTES_RECEIVED, "Response body bytes received");
        describe_histogram!(BODY_BYTES, "Body size per completed transfer in bytes");
        describe_counter!(RECORDS_EMITTED, "Records written to the output sink");
        describe_counter!(
            INGEST_PAUSES,
            "Times ingestion paused at the concurrency ceiling"
        );
    }

    pub fn record_transfer_started() {
        counter!(TRANSFERS_STARTED).increment(1);
    }

    pub fn record_transfer_completed(body_bytes: usize, failed: bool) {
        counter!(TRANSFERS_COMPLETED).increment(1);
        histogram!(BODY_BYTES).record(body_bytes as f64);
        if failed {
            counter!(TRANSFERS_FAILED).increment(1);
        }
    }

    pub fn record_bytes_received(bytes: usize) {
        counter!(BYTES_RECEIVED).increment(bytes as u64);
    }

    pub fn record_records_emitted(records: usize) {
        counter!(RECORDS_EMITTED).increment(records as u64);
    }

    pub fn record_ingest_paused() {
        counter!(INGEST_PAUSES).increment(1);
    }
}
