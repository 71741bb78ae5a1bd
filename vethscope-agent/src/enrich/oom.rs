//! OOM kill enrichment. No workload lookup; the event already names its
//! process and cgroup.

use super::base_tags;
use crate::events::OomKillEvent;
use crate::metric::Metric;
use serde_json::json;

pub const MEASUREMENT_OOM: &str = "oom_kill";

pub(crate) fn convert(event: &OomKillEvent) -> Metric {
    let mut metric = Metric::new(MEASUREMENT_OOM);
    metric.tags = base_tags();
    metric.tags.insert("comm".to_string(), event.comm.clone());
    metric.tags.insert(
        "user_stack".to_string(),
        event
            .user_stack
            .iter()
            .map(|addr| format!("{:#x}", addr))
            .collect::<Vec<_>>()
            .join(","),
    );

    metric.fields.insert("pid".to_string(), json!(event.pid));
    metric
        .fields
        .insert("cgroup_id".to_string(), json!(event.cgroup_id));
    metric.fields.insert(
        "user_stack_depth".to_string(),
        json!(event.user_stack.len()),
    );

    metric
}
