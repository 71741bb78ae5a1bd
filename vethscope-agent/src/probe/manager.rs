//! Probe set management: one loaded probe per present veth interface
//!
//! The mapping is the only mutable state shared across tasks and sits behind
//! a single RwLock. The lock is held only across structural mutations; loads
//! and closes happen outside it, with a second occupancy check making the
//! insert atomic.

use crate::events::RawEvent;
use crate::interfaces::{IfaceDescriptor, LinkEvent};
use crate::probe::{ProbeHandle, ProbeLauncher};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;

pub struct ProbeManager<L: ProbeLauncher> {
    launcher: L,
    out: mpsc::Sender<RawEvent>,
    probes: RwLock<HashMap<u32, Box<dyn ProbeHandle>>>,
}

impl<L: ProbeLauncher> ProbeManager<L> {
    pub fn new(launcher: L, out: mpsc::Sender<RawEvent>) -> Self {
        Self {
            launcher,
            out,
            probes: RwLock::new(HashMap::new()),
        }
    }

    /// Attach probes to every interface in the snapshot, then keep the probe
    /// set in sync with the link event stream until it closes.
    pub async fn run(&self, snapshot: Vec<IfaceDescriptor>, mut events: mpsc::Receiver<LinkEvent>) {
        for desc in snapshot {
            if let Err(e) = self.attach(&desc).await {
                warn!("failed to attach probe to ifindex {}: {}", desc.index, e);
            }
        }

        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Add(desc) => {
                    info!("veth add, index: {}, peer: {}", desc.index, desc.peer_ip);
                    if let Err(e) = self.attach(&desc).await {
                        warn!("failed to attach probe to ifindex {}: {}", desc.index, e);
                    }
                }
                LinkEvent::Remove(index) => {
                    info!("veth delete, index: {}", index);
                    self.detach(index).await;
                }
            }
        }
    }

    /// Load and register a probe for the interface. Idempotent: an interface
    /// that already has a probe is left alone and `Ok(false)` is returned.
    pub async fn attach(&self, iface: &IfaceDescriptor) -> crate::Result<bool> {
        if self.contains(iface.index) {
            return Ok(false);
        }

        // Load outside the lock; only the insert needs exclusivity.
        let handle = self.launcher.launch(iface, self.out.clone())?;

        let staged = {
            let mut probes = self.probes.write().unwrap();
            if probes.contains_key(&iface.index) {
                Some(handle)
            } else {
                probes.insert(iface.index, handle);
                None
            }
        };

        // Lost the occupancy race; dispose of the duplicate load.
        if let Some(handle) = staged {
            handle.close().await;
            return Ok(false);
        }
        Ok(true)
    }

    /// Remove and close the probe for an interface. Close completes before
    /// this returns; removing an absent interface is a no-op.
    pub async fn detach(&self, index: u32) -> bool {
        let handle = self.probes.write().unwrap().remove(&index);
        match handle {
            Some(handle) => {
                handle.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every probe. Used on shutdown.
    pub async fn close_all(&self) {
        let handles: Vec<_> = {
            let mut probes = self.probes.write().unwrap();
            probes.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.close().await;
        }
    }

    pub fn contains(&self, index: u32) -> bool {
        self.probes.read().unwrap().contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.probes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.read().unwrap().is_empty()
    }

    /// Interface indexes currently holding a probe.
    pub fn indexes(&self) -> Vec<u32> {
        self.probes.read().unwrap().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::probe::ProbeHandle;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct FakeHandle {
        ifindex: u32,
        closed: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl ProbeHandle for FakeHandle {
        fn ifindex(&self) -> u32 {
            self.ifindex
        }

        async fn close(self: Box<Self>) {
            self.closed.lock().unwrap().push(self.ifindex);
        }
    }

    #[derive(Clone, Default)]
    struct FakeLauncher {
        launches: Arc<AtomicUsize>,
        closed: Arc<Mutex<Vec<u32>>>,
        fail_for: Option<u32>,
    }

    impl ProbeLauncher for FakeLauncher {
        fn launch(
            &self,
            iface: &IfaceDescriptor,
            _out: mpsc::Sender<RawEvent>,
        ) -> crate::Result<Box<dyn ProbeHandle>> {
            if self.fail_for == Some(iface.index) {
                return Err(AgentError::ProgramLoad {
                    target: format!("ifindex {}", iface.index),
                    reason: "injected failure".to_string(),
                });
            }
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeHandle {
                ifindex: iface.index,
                closed: self.closed.clone(),
            }))
        }
    }

    fn desc(index: u32) -> IfaceDescriptor {
        IfaceDescriptor {
            index,
            peer_ip: Ipv4Addr::new(10, 244, 0, index as u8),
        }
    }

    fn manager(launcher: FakeLauncher) -> ProbeManager<FakeLauncher> {
        let (out, _rx) = mpsc::channel(16);
        ProbeManager::new(launcher, out)
    }

    #[tokio::test]
    async fn test_snapshot_then_churn() {
        let launcher = FakeLauncher::default();
        let mgr = manager(launcher.clone());

        let (tx, rx) = mpsc::channel(16);
        tx.send(LinkEvent::Add(desc(1))).await.unwrap();
        tx.send(LinkEvent::Add(desc(2))).await.unwrap();
        tx.send(LinkEvent::Remove(1)).await.unwrap();
        tx.send(LinkEvent::Add(desc(3))).await.unwrap();
        drop(tx);

        mgr.run(Vec::new(), rx).await;

        let mut indexes = mgr.indexes();
        indexes.sort_unstable();
        assert_eq!(indexes, vec![2, 3]);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 3);
        // probe 1 closed exactly once
        assert_eq!(*launcher.closed.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_mapping_matches_last_event_per_interface() {
        let launcher = FakeLauncher::default();
        let mgr = manager(launcher.clone());

        let script = [
            LinkEvent::Add(desc(1)),
            LinkEvent::Add(desc(2)),
            LinkEvent::Remove(2),
            LinkEvent::Add(desc(2)),
            LinkEvent::Remove(1),
            LinkEvent::Add(desc(4)),
            LinkEvent::Remove(4),
            LinkEvent::Remove(4),
        ];
        let (tx, rx) = mpsc::channel(16);
        for ev in script {
            tx.send(ev).await.unwrap();
        }
        drop(tx);

        mgr.run(vec![desc(7)], rx).await;

        let mut indexes = mgr.indexes();
        indexes.sort_unstable();
        assert_eq!(indexes, vec![2, 7]);
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let launcher = FakeLauncher::default();
        let mgr = manager(launcher.clone());

        assert!(mgr.attach(&desc(5)).await.unwrap());
        assert!(!mgr.attach(&desc(5)).await.unwrap());
        assert!(!mgr.attach(&desc(5)).await.unwrap());

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test]
    async fn test_detach_absent_is_noop() {
        let launcher = FakeLauncher::default();
        let mgr = manager(launcher.clone());

        assert!(!mgr.detach(42).await);
        assert!(launcher.closed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_load_leaves_others_running() {
        let launcher = FakeLauncher {
            fail_for: Some(2),
            ..Default::default()
        };
        let mgr = manager(launcher.clone());

        let (tx, rx) = mpsc::channel(16);
        tx.send(LinkEvent::Add(desc(1))).await.unwrap();
        tx.send(LinkEvent::Add(desc(2))).await.unwrap();
        tx.send(LinkEvent::Add(desc(3))).await.unwrap();
        drop(tx);

        mgr.run(Vec::new(), rx).await;

        let mut indexes = mgr.indexes();
        indexes.sort_unstable();
        assert_eq!(indexes, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_close_all_drains_the_set() {
        let launcher = FakeLauncher::default();
        let mgr = manager(launcher.clone());

        mgr.attach(&desc(1)).await.unwrap();
        mgr.attach(&desc(2)).await.unwrap();
        assert_eq!(mgr.len(), 2);

        mgr.close_all().await;

        assert!(mgr.is_empty());
        let mut closed = launcher.closed.lock().unwrap().clone();
        closed.sort_unstable();
        assert_eq!(closed, vec![1, 2]);
    }
}
