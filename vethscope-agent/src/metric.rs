//! Outbound metric schema and the drop-on-full sink adapter

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// One fully-tagged metric record. Immutable once handed to the sink.
#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    pub name: String,
    pub measurement: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub org_name: String,
    pub tags: HashMap<String, String>,
    pub fields: HashMap<String, Value>,
}

impl Metric {
    /// New metric stamped with the current wall clock. Name and measurement
    /// are usually equal.
    pub fn new(measurement: &str) -> Self {
        Self {
            name: measurement.to_string(),
            measurement: measurement.to_string(),
            timestamp: now_ns(),
            org_name: String::new(),
            tags: HashMap::new(),
            fields: HashMap::new(),
        }
    }
}

pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Pushes finished metrics onto the outbound channel without ever blocking
/// the enricher. When the channel is full the metric is dropped and counted.
#[derive(Clone)]
pub struct MetricSink {
    tx: mpsc::Sender<Metric>,
    dropped: Arc<AtomicU64>,
}

impl MetricSink {
    pub fn new(tx: mpsc::Sender<Metric>) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn push(&self, metric: Metric) {
        match self.tx.try_send(metric) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total.is_power_of_two() {
                    warn!("outbound metric channel full, {} metrics dropped so far", total);
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!("outbound metric channel closed, dropping metric");
            }
        }
    }

    /// Total metrics dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
