//! RPC exchange enrichment
//!
//! The capture point sits on the server-response path, so the packet source
//! is the serving (target) side and the packet destination is the caller.
//! Lookups below are inverted relative to the HTTP path on purpose.

use super::{base_tags, platform_tags, Enricher};
use crate::events::{RpcExchange, RpcFraming};
use crate::metric::Metric;
use regex::Regex;
use serde_json::json;
use std::sync::LazyLock;

pub const MEASUREMENT_RPC: &str = "application_rpc";

/// `<rpc version>!<service><service version><method>`, e.g.
/// `2.0.0!com.acme.Svc1.0.0/hello`
static RPC_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(.*)!([a-zA-Z.]+)([0-9.]+)([a-zA-Z/;]+)").expect("rpc path pattern")
});

impl Enricher {
    pub(crate) fn convert_rpc(&self, exchange: &RpcExchange) -> Option<Metric> {
        if exchange.path.is_empty() || exchange.status.is_empty() {
            return None;
        }

        let parsed = ParsedRpcPath::parse(&exchange.path);

        let mut metric = Metric::new(MEASUREMENT_RPC);
        metric.tags = base_tags();
        for field in ["elapsed_sum", "elapsed_max", "elapsed_min", "elapsed_mean"] {
            metric
                .fields
                .insert(field.to_string(), json!(exchange.duration_ns));
        }
        metric.fields.insert("elapsed_count".to_string(), json!(1));

        metric
            .tags
            .insert("rpc_target".to_string(), parsed.target.clone());
        metric
            .tags
            .insert("rpc_service".to_string(), parsed.service.clone());
        metric
            .tags
            .insert("rpc_method".to_string(), parsed.method.clone());
        metric
            .tags
            .insert("rpc_version".to_string(), parsed.version.clone());
        metric
            .tags
            .insert("service_version".to_string(), parsed.service_version.clone());
        metric.tags.insert(
            "error".to_string(),
            if is_error(exchange.framing, &exchange.status) {
                "true".to_string()
            } else {
                "false".to_string()
            },
        );

        if let Some(target) = self.cache().lookup_pod(exchange.src_ip) {
            metric.org_name = target.label("DICE_ORG_NAME");
            metric
                .tags
                .insert("cluster_name".to_string(), target.label("DICE_CLUSTER_NAME"));
            metric
                .tags
                .insert("component".to_string(), exchange.framing.as_str().to_string());
            metric.tags.insert(
                "db_host".to_string(),
                format!("{}:{}", exchange.src_ip, exchange.src_port),
            );
            metric
                .tags
                .insert("method".to_string(), exchange.path.clone());
            metric.tags.insert(
                "_metric_scope_id".to_string(),
                target.annotation("msp.erda.cloud/terminus_key"),
            );
            metric
                .tags
                .insert("host_ip".to_string(), target.host_ip.clone());
            metric
                .tags
                .insert("org_name".to_string(), target.label("DICE_ORG_NAME"));
            metric.tags.insert(
                "peer_address".to_string(),
                format!("{}:{}", exchange.dst_ip, exchange.dst_port),
            );
            metric
                .tags
                .insert("peer_service".to_string(), exchange.path.clone());

            if exchange.framing == RpcFraming::Dubbo {
                metric
                    .tags
                    .insert("dubbo_service".to_string(), parsed.service.clone());
                metric
                    .tags
                    .insert("dubbo_version".to_string(), parsed.version.clone());
                metric
                    .tags
                    .insert("dubbo_method".to_string(), parsed.method.clone());
            }

            platform_tags(&mut metric.tags, "target", &target);
        }

        if let Some(source) = self.cache().lookup_pod(exchange.dst_ip) {
            let runtime_name = source.annotation("msp.erda.cloud/runtime_name");
            metric.tags.insert(
                "source_application_id".to_string(),
                source.label("DICE_APPLICATION_ID"),
            );
            metric.tags.insert(
                "source_application_name".to_string(),
                source.label("DICE_APPLICATION_NAME"),
            );
            metric
                .tags
                .insert("source_org_id".to_string(), source.label("DICE_ORG_ID"));
            metric.tags.insert(
                "source_project_id".to_string(),
                source.label("DICE_PROJECT_ID"),
            );
            metric.tags.insert(
                "source_project_name".to_string(),
                source.label("DICE_PROJECT_NAME"),
            );
            metric.tags.insert(
                "source_runtime_id".to_string(),
                source.label("DICE_RUNTIME_ID"),
            );
            metric
                .tags
                .insert("source_runtime_name".to_string(), runtime_name.clone());
            metric.tags.insert(
                "source_service_id".to_string(),
                format!(
                    "{}_{}_{}",
                    source.label("DICE_APPLICATION_ID"),
                    runtime_name,
                    source.label("DICE_SERVICE_NAME")
                ),
            );
            metric.tags.insert(
                "source_workspace".to_string(),
                source.annotation("msp.erda.cloud/workspace"),
            );
        }

        Some(metric)
    }
}

/// Status semantics depend on the framing: Dubbo encodes OK as "20", the
/// HTTP-like framing as "200".
fn is_error(framing: RpcFraming, status: &str) -> bool {
    let ok = match framing {
        RpcFraming::Dubbo => "20",
        RpcFraming::Http => "200",
    };
    status != ok
}

#[derive(Debug, Default, PartialEq)]
struct ParsedRpcPath {
    target: String,
    service: String,
    method: String,
    version: String,
    service_version: String,
}

impl ParsedRpcPath {
    /// Derive the rpc_* tags from the path. An unparseable path keeps the
    /// raw path as the target and leaves the derived tags empty.
    fn parse(path: &str) -> Self {
        let Some(captures) = RPC_PATH_RE.captures(path) else {
            return Self {
                target: path.to_string(),
                ..Default::default()
            };
        };

        let service = captures[2].to_string();
        let method = captures[4].trim_start_matches('/').to_string();
        Self {
            target: format!("{}.{}", service, method),
            service,
            method,
            version: captures[1].to_string(),
            service_version: captures[3].to_string(),
        }
    }
}
