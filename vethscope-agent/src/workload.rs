//! Workload identity cache for correlating packet addresses to cluster objects
//!
//! Maintains concurrent maps from pod IP and service cluster IP to metadata,
//! allowing the enricher to tag kernel events with Kubernetes context. Writers
//! are the cluster watcher tasks; readers are the enrichment path, which must
//! never block.

use dashmap::DashMap;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Metadata about a Kubernetes pod, keyed by pod IP
#[derive(Debug, Clone, Default)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub host_ip: String,
}

impl PodInfo {
    /// Label value, or empty string when the key is absent.
    pub fn label(&self, key: &str) -> String {
        self.labels.get(key).cloned().unwrap_or_default()
    }

    /// Annotation value, or empty string when the key is absent.
    pub fn annotation(&self, key: &str) -> String {
        self.annotations.get(key).cloned().unwrap_or_default()
    }
}

/// Metadata about a Kubernetes service, keyed by cluster IP
#[derive(Debug, Clone, Default)]
pub struct ServiceInfo {
    pub namespace: String,
    pub name: String,
}

/// A destination resolved from the cache: either a pod or a service.
#[derive(Debug, Clone)]
pub enum Workload {
    Pod(PodInfo),
    Service(ServiceInfo),
}

/// Thread-safe cache mapping IPv4 addresses to workload metadata
#[derive(Clone)]
pub struct WorkloadCache {
    pods: Arc<DashMap<Ipv4Addr, PodInfo>>,
    services: Arc<DashMap<Ipv4Addr, ServiceInfo>>,
}

impl WorkloadCache {
    pub fn new() -> Self {
        Self {
            pods: Arc::new(DashMap::new()),
            services: Arc::new(DashMap::new()),
        }
    }

    /// Look up the pod bound to an address. Absence is an ordinary outcome.
    pub fn lookup_pod(&self, ip: Ipv4Addr) -> Option<PodInfo> {
        self.pods.get(&ip).map(|r| r.clone())
    }

    /// Look up the service bound to an address.
    pub fn lookup_service(&self, ip: Ipv4Addr) -> Option<ServiceInfo> {
        self.services.get(&ip).map(|r| r.clone())
    }

    /// Resolve an address to whichever workload claims it, pods first.
    pub fn lookup_workload(&self, ip: Ipv4Addr) -> Option<Workload> {
        if let Some(pod) = self.lookup_pod(ip) {
            return Some(Workload::Pod(pod));
        }
        self.lookup_service(ip).map(Workload::Service)
    }

    pub fn insert_pod(&self, ip: Ipv4Addr, pod: PodInfo) {
        self.pods.insert(ip, pod);
    }

    pub fn insert_service(&self, ip: Ipv4Addr, service: ServiceInfo) {
        self.services.insert(ip, service);
    }

    /// Remove all pod entries belonging to a pod UID.
    pub fn remove_pod_by_uid(&self, uid: &str) {
        self.pods.retain(|_, p| p.uid != uid);
    }

    pub fn remove_service(&self, ip: Ipv4Addr) -> Option<ServiceInfo> {
        self.services.remove(&ip).map(|(_, s)| s)
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

impl Default for WorkloadCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(namespace: &str, name: &str, uid: &str) -> PodInfo {
        PodInfo {
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_lookup_pod() {
        let cache = WorkloadCache::new();
        let ip = Ipv4Addr::new(10, 0, 0, 5);

        cache.insert_pod(ip, pod("default", "nginx", "abc-123"));

        let found = cache.lookup_pod(ip).expect("should find entry");
        assert_eq!(found.namespace, "default");
        assert_eq!(found.name, "nginx");
        assert!(cache.lookup_pod(Ipv4Addr::new(10, 0, 0, 6)).is_none());
    }

    #[test]
    fn test_workload_prefers_pod_over_service() {
        let cache = WorkloadCache::new();
        let ip = Ipv4Addr::new(10, 96, 0, 1);

        cache.insert_service(
            ip,
            ServiceInfo {
                namespace: "default".to_string(),
                name: "api".to_string(),
            },
        );
        assert!(matches!(
            cache.lookup_workload(ip),
            Some(Workload::Service(_))
        ));

        cache.insert_pod(ip, pod("default", "api-0", "pod-1"));
        assert!(matches!(cache.lookup_workload(ip), Some(Workload::Pod(_))));

        assert!(cache.lookup_workload(Ipv4Addr::new(1, 2, 3, 4)).is_none());
    }

    #[test]
    fn test_remove_pod_by_uid() {
        let cache = WorkloadCache::new();

        cache.insert_pod(Ipv4Addr::new(10, 0, 0, 1), pod("default", "web-0", "pod-1"));
        cache.insert_pod(Ipv4Addr::new(10, 0, 0, 2), pod("default", "web-1", "pod-1"));
        cache.insert_pod(Ipv4Addr::new(10, 0, 0, 3), pod("other", "redis", "pod-2"));
        assert_eq!(cache.pod_count(), 3);

        cache.remove_pod_by_uid("pod-1");

        assert_eq!(cache.pod_count(), 1);
        assert!(cache.lookup_pod(Ipv4Addr::new(10, 0, 0, 1)).is_none());
        assert!(cache.lookup_pod(Ipv4Addr::new(10, 0, 0, 3)).is_some());
    }

    #[test]
    fn test_label_and_annotation_defaults() {
        let mut info = pod("default", "web", "u1");
        info.labels
            .insert("DICE_ORG_NAME".to_string(), "acme".to_string());

        assert_eq!(info.label("DICE_ORG_NAME"), "acme");
        assert_eq!(info.label("DICE_CLUSTER_NAME"), "");
        assert_eq!(info.annotation("msp.erda.cloud/workspace"), "");
    }
}
