//! Kubernetes watcher for tracking pod and service addresses
//!
//! Watches all pods and services in the cluster and keeps the workload cache
//! current. Lookups key on pod IP and service cluster IP.

use crate::workload::{PodInfo, ServiceInfo, WorkloadCache};
use anyhow::{Context, Result};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client,
};
use log::{debug, error, info, warn};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Watches cluster state and updates the workload cache
pub struct ClusterWatcher {
    client: Client,
    cache: WorkloadCache,
}

impl ClusterWatcher {
    pub async fn new(cache: WorkloadCache) -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;

        Ok(Self { client, cache })
    }

    /// Start watching pods and services. Runs indefinitely and should be
    /// spawned as a task.
    pub async fn run(self) {
        info!("Starting Kubernetes watcher...");
        tokio::join!(self.pod_loop(), self.service_loop());
    }

    async fn pod_loop(&self) {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(30);

        loop {
            match self.watch_pods(&pods).await {
                Ok(_) => {
                    warn!("pod watch stream ended, reconnecting...");
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    error!("pod watch failed: {}, reconnecting in {:?}", e, backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, max_backoff);
                }
            }
        }
    }

    async fn service_loop(&self) {
        let services: Api<Service> = Api::all(self.client.clone());
        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(30);

        loop {
            match self.watch_services(&services).await {
                Ok(_) => {
                    warn!("service watch stream ended, reconnecting...");
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    error!("service watch failed: {}, reconnecting in {:?}", e, backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, max_backoff);
                }
            }
        }
    }

    async fn watch_pods(&self, pods: &Api<Pod>) -> Result<()> {
        let config = watcher::Config::default();
        let mut stream = watcher::watcher(pods.clone(), config).boxed();

        while let Some(event) = stream.try_next().await? {
            match event {
                Event::Apply(pod) | Event::InitApply(pod) => {
                    apply_pod(&self.cache, &pod);
                }
                Event::Delete(pod) => {
                    delete_pod(&self.cache, &pod);
                }
                Event::Init => {
                    debug!("pod watcher initialized");
                }
                Event::InitDone => {
                    info!(
                        "pod watcher initial sync complete. Tracking {} pods (by IP)",
                        self.cache.pod_count()
                    );
                }
            }
        }

        Ok(())
    }

    async fn watch_services(&self, services: &Api<Service>) -> Result<()> {
        let config = watcher::Config::default();
        let mut stream = watcher::watcher(services.clone(), config).boxed();

        while let Some(event) = stream.try_next().await? {
            match event {
                Event::Apply(svc) | Event::InitApply(svc) => {
                    apply_service(&self.cache, &svc);
                }
                Event::Delete(svc) => {
                    if let Some(ip) = cluster_ipv4(&svc) {
                        self.cache.remove_service(ip);
                    }
                }
                Event::Init => {
                    debug!("service watcher initialized");
                }
                Event::InitDone => {
                    info!(
                        "service watcher initial sync complete. Tracking {} services (by cluster IP)",
                        self.cache.service_count()
                    );
                }
            }
        }

        Ok(())
    }
}

/// Handle a pod being created or updated
fn apply_pod(cache: &WorkloadCache, pod: &Pod) {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let name = pod.metadata.name.as_deref().unwrap_or("unknown");
    let uid = pod.metadata.uid.as_deref().unwrap_or("");

    if uid.is_empty() {
        return;
    }

    let status = match &pod.status {
        Some(s) => s,
        None => return,
    };

    let Some(ip) = status.pod_ip.as_deref().and_then(parse_ipv4) else {
        return;
    };

    let info = PodInfo {
        namespace: namespace.to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        labels: pod
            .metadata
            .labels
            .clone()
            .map(|m| m.into_iter().collect())
            .unwrap_or_default(),
        annotations: pod
            .metadata
            .annotations
            .clone()
            .map(|m| m.into_iter().collect())
            .unwrap_or_default(),
        host_ip: status.host_ip.clone().unwrap_or_default(),
    };

    debug!("pod {}/{} has IP {}", namespace, name, ip);
    cache.insert_pod(ip, info);
}

/// Handle a pod being deleted
fn delete_pod(cache: &WorkloadCache, pod: &Pod) {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let name = pod.metadata.name.as_deref().unwrap_or("unknown");
    let uid = pod.metadata.uid.as_deref().unwrap_or("");

    if !uid.is_empty() {
        cache.remove_pod_by_uid(uid);
        debug!("removed pod {}/{} from cache", namespace, name);
    }
}

/// Handle a service being created or updated
fn apply_service(cache: &WorkloadCache, svc: &Service) {
    let namespace = svc.metadata.namespace.as_deref().unwrap_or("default");
    let name = svc.metadata.name.as_deref().unwrap_or("unknown");

    // headless services ("None") have no address to key on
    let Some(ip) = cluster_ipv4(svc) else {
        return;
    };

    cache.insert_service(
        ip,
        ServiceInfo {
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
    );
    debug!("service {}/{} has cluster IP {}", namespace, name, ip);
}

fn cluster_ipv4(svc: &Service) -> Option<Ipv4Addr> {
    svc.spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        .filter(|ip| *ip != "None")
        .and_then(parse_ipv4)
}

fn parse_ipv4(ip: &str) -> Option<Ipv4Addr> {
    ip.parse().ok()
}
