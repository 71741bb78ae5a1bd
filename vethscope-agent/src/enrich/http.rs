//! HTTP exchange enrichment

use super::{base_tags, platform_tags, Enricher};
use crate::events::HttpExchange;
use crate::metric::Metric;
use crate::workload::Workload;
use log::debug;
use std::time::Duration;

pub const MEASUREMENT_HTTP: &str = "application_http";
pub const MEASUREMENT_HTTP_ERROR: &str = "application_http_error";
pub const MEASUREMENT_HTTP_SLOW: &str = "application_http_slow";

impl Enricher {
    pub(crate) fn convert_http(&self, exchange: &HttpExchange) -> Option<Metric> {
        // Without a source pod there is no identity to attach to.
        let Some(source) = self.cache().lookup_pod(exchange.src_ip) else {
            debug!(
                "no pod for source {}, dropping http exchange",
                exchange.src_ip
            );
            return None;
        };
        // Targets outside the cluster are not reported.
        let Some(target) = self.cache().lookup_workload(exchange.dst_ip) else {
            debug!(
                "source: {}/{}, target(external): {}",
                source.namespace, source.name, exchange.dst_ip
            );
            return None;
        };

        let mut metric = Metric::new(self.classify_http(exchange));
        metric.tags = base_tags();
        metric
            .tags
            .insert("http_method".to_string(), exchange.method.clone());
        metric
            .tags
            .insert("http_path".to_string(), exchange.path.clone());
        metric.tags.insert(
            "http_status_code".to_string(),
            exchange.status_code.to_string(),
        );
        metric
            .tags
            .insert("http_target".to_string(), exchange.path.clone());
        metric
            .tags
            .insert("http_version".to_string(), exchange.version.clone());
        metric.tags.insert(
            "http_url".to_string(),
            format!(
                "http://{}:{}{}",
                exchange.dst_ip, exchange.dst_port, exchange.path
            ),
        );

        match target {
            Workload::Pod(pod) => {
                let peer_address = format!("{}:{}", exchange.dst_ip, exchange.dst_port);
                metric.org_name = pod.label("DICE_ORG_NAME");
                metric
                    .tags
                    .insert("cluster_name".to_string(), pod.label("DICE_CLUSTER_NAME"));
                metric
                    .tags
                    .insert("db_host".to_string(), peer_address.clone());
                metric
                    .tags
                    .insert("org_name".to_string(), pod.label("DICE_ORG_NAME"));
                metric
                    .tags
                    .insert("peer_address".to_string(), peer_address);
                metric
                    .tags
                    .insert("peer_hostname".to_string(), String::new());

                platform_tags(&mut metric.tags, "target", &pod);
                platform_tags(&mut metric.tags, "source", &source);
            }
            Workload::Service(svc) => {
                // TODO: bind target_* tags for service-backed destinations
                // once the service metadata schema settles
                debug!(
                    "source(pod): {}/{}, target(service): {}/{}",
                    source.namespace, source.name, svc.namespace, svc.name
                );
                platform_tags(&mut metric.tags, "source", &source);
            }
        }

        Some(metric)
    }

    fn classify_http(&self, exchange: &HttpExchange) -> &'static str {
        if exchange.status_code > 200 {
            return MEASUREMENT_HTTP_ERROR;
        }
        if let Some(threshold) = self.slow_threshold() {
            if Duration::from_nanos(exchange.duration_ns) >= threshold {
                return MEASUREMENT_HTTP_SLOW;
            }
        }
        MEASUREMENT_HTTP
    }
}
