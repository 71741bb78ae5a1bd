//! Event enrichment: join raw kernel events against the workload cache and
//! produce fully-tagged metrics
//!
//! The consumer loop is the single reader of the shared event channel. A raw
//! event either becomes one metric or is suppressed; nothing here can
//! terminate the loop besides the channel closing.

mod http;
mod oom;
mod rpc;

pub use http::{MEASUREMENT_HTTP, MEASUREMENT_HTTP_ERROR, MEASUREMENT_HTTP_SLOW};
pub use oom::MEASUREMENT_OOM;
pub use rpc::MEASUREMENT_RPC;

use crate::events::RawEvent;
use crate::metric::{Metric, MetricSink};
use crate::workload::{PodInfo, WorkloadCache};
use log::debug;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct Enricher {
    cache: WorkloadCache,
    /// Successful exchanges slower than this are classified into the slow
    /// bucket; `None` keeps the two-way success/error split.
    slow_threshold: Option<Duration>,
}

impl Enricher {
    pub fn new(cache: WorkloadCache) -> Self {
        Self {
            cache,
            slow_threshold: None,
        }
    }

    pub fn with_slow_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// Convert one raw event. `None` means the event is suppressed, an
    /// ordinary outcome for traffic without a resolvable workload.
    pub fn convert(&self, event: &RawEvent) -> Option<Metric> {
        match event {
            RawEvent::Http(exchange) => self.convert_http(exchange),
            RawEvent::Rpc(exchange) => self.convert_rpc(exchange),
            RawEvent::OomKill(event) => Some(oom::convert(event)),
        }
    }

    /// Consume the shared event channel until it closes.
    pub async fn run(self, mut events: mpsc::Receiver<RawEvent>, sink: MetricSink) {
        while let Some(event) = events.recv().await {
            if let Some(metric) = self.convert(&event) {
                sink.push(metric);
            }
        }
        debug!("event channel closed, enricher stopping");
    }

    pub(crate) fn cache(&self) -> &WorkloadCache {
        &self.cache
    }

    pub(crate) fn slow_threshold(&self) -> Option<Duration> {
        self.slow_threshold
    }
}

/// Tags every metric carries regardless of protocol.
pub(crate) fn base_tags() -> HashMap<String, String> {
    let mut tags = HashMap::new();
    tags.insert("metric_source".to_string(), "ebpf".to_string());
    tags.insert("_meta".to_string(), "true".to_string());
    tags.insert("_metric_scope".to_string(), "micro_service".to_string());
    tags.insert("span_kind".to_string(), "server".to_string());
    tags
}

/// The full platform-metadata block for one side of an exchange, read from
/// the DICE labels and msp.erda.cloud annotations.
pub(crate) fn platform_tags(tags: &mut HashMap<String, String>, prefix: &str, pod: &PodInfo) {
    let runtime_name = pod.annotation("msp.erda.cloud/runtime_name");
    let service_id = format!(
        "{}_{}_{}",
        pod.label("DICE_APPLICATION_ID"),
        runtime_name,
        pod.label("DICE_SERVICE_NAME")
    );

    tags.insert(
        format!("{}_application_id", prefix),
        pod.label("DICE_APPLICATION_ID"),
    );
    tags.insert(
        format!("{}_application_name", prefix),
        pod.label("DICE_APPLICATION_NAME"),
    );
    tags.insert(format!("{}_org_id", prefix), pod.label("DICE_ORG_ID"));
    tags.insert(format!("{}_project_id", prefix), pod.label("DICE_PROJECT_ID"));
    tags.insert(
        format!("{}_project_name", prefix),
        pod.label("DICE_PROJECT_NAME"),
    );
    tags.insert(format!("{}_runtime_id", prefix), pod.label("DICE_RUNTIME_ID"));
    tags.insert(format!("{}_runtime_name", prefix), runtime_name);
    tags.insert(format!("{}_service_id", prefix), service_id);
    tags.insert(
        format!("{}_service_instance_id", prefix),
        pod.uid.clone(),
    );
    tags.insert(
        format!("{}_service_name", prefix),
        pod.annotation("msp.erda.cloud/service_name"),
    );
    tags.insert(
        format!("{}_terminus_key", prefix),
        pod.annotation("msp.erda.cloud/terminus_key"),
    );
    tags.insert(
        format!("{}_workspace", prefix),
        pod.annotation("msp.erda.cloud/workspace"),
    );
}
