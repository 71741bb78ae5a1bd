//! Discovery of veth interfaces in the host network namespace
//!
//! Workload traffic crosses the host through one veth per pod, so the set of
//! veth devices is the set of attach points. The scanner takes a snapshot
//! from sysfs, resolves each device's peer address hint from the neighbor
//! table, and then rescans on an interval, emitting Add/Remove events for the
//! difference. Consumers must tolerate duplicate Adds.

use crate::error::{AgentError, Result};
use log::{debug, warn};
use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

const LINK_CHANNEL_CAPACITY: usize = 64;

/// A veth interface visible from the host namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceDescriptor {
    /// Kernel interface index, stable for the interface's lifetime
    pub index: u32,
    /// Address of the other end of the virtual link, used as an identity
    /// hint when decoding events from this interface
    pub peer_ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Add(IfaceDescriptor),
    Remove(u32),
}

/// Periodic sysfs scanner producing the veth snapshot and change events
pub struct VethScanner {
    sysfs_root: PathBuf,
    arp_path: PathBuf,
    interval: Duration,
}

impl VethScanner {
    pub fn new(interval: Duration) -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys/class/net"),
            arp_path: PathBuf::from("/proc/net/arp"),
            interval,
        }
    }

    /// Current set of veth interfaces.
    pub fn snapshot(&self) -> Result<Vec<IfaceDescriptor>> {
        let entries = fs::read_dir(&self.sysfs_root)
            .map_err(|e| AgentError::InterfaceScan(format!("{}: {}", self.sysfs_root.display(), e)))?;
        let arp = fs::read_to_string(&self.arp_path).unwrap_or_default();

        let mut found = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("veth") {
                continue;
            }
            let Some(index) = self.read_ifindex(&name) else {
                continue;
            };
            let peer_ip = peer_from_arp(&arp, &name).unwrap_or(Ipv4Addr::UNSPECIFIED);
            found.push(IfaceDescriptor { index, peer_ip });
        }
        Ok(found)
    }

    /// Take the initial snapshot and start the rescan task. Returns the
    /// snapshot plus the live event stream; the task stops once the receiver
    /// is dropped.
    pub fn spawn(self) -> (Vec<IfaceDescriptor>, mpsc::Receiver<LinkEvent>) {
        let initial = self.snapshot().unwrap_or_else(|e| {
            warn!("initial veth scan failed: {}", e);
            Vec::new()
        });

        let mut known: HashMap<u32, IfaceDescriptor> =
            initial.iter().map(|d| (d.index, d.clone())).collect();
        let (tx, rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.interval).await;
                let next = match self.snapshot() {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("veth scan failed: {}", e);
                        continue;
                    }
                };
                for event in diff(&known, &next) {
                    match &event {
                        LinkEvent::Add(d) => {
                            known.insert(d.index, d.clone());
                        }
                        LinkEvent::Remove(index) => {
                            known.remove(index);
                        }
                    }
                    if tx.send(event).await.is_err() {
                        debug!("link event consumer gone, stopping veth scanner");
                        return;
                    }
                }
            }
        });

        (initial, rx)
    }

    fn read_ifindex(&self, name: &str) -> Option<u32> {
        let path = self.sysfs_root.join(name).join("ifindex");
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }
}

/// Membership changes between two scans. A peer-address change alone is not
/// an event; the probe is already bound to the interface.
fn diff(known: &HashMap<u32, IfaceDescriptor>, next: &[IfaceDescriptor]) -> Vec<LinkEvent> {
    let mut events = Vec::new();
    for desc in next {
        if !known.contains_key(&desc.index) {
            events.push(LinkEvent::Add(desc.clone()));
        }
    }
    for index in known.keys() {
        if !next.iter().any(|d| d.index == *index) {
            events.push(LinkEvent::Remove(*index));
        }
    }
    events
}

/// First IPv4 neighbor seen through the given device.
///
/// /proc/net/arp format:
/// `IP address  HW type  Flags  HW address  Mask  Device`
fn peer_from_arp(content: &str, iface: &str) -> Option<Ipv4Addr> {
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 6 && fields[5] == iface {
            if let Ok(ip) = fields[0].parse() {
                return Some(ip);
            }
        }
    }
    None
}
