//! eBPF probe lifecycle: per-interface attach/detach and event streaming

pub mod manager;
#[cfg(target_os = "linux")]
pub mod oom;
#[cfg(target_os = "linux")]
pub mod veth;

use crate::error::Result;
use crate::events::RawEvent;
use crate::interfaces::IfaceDescriptor;
use async_trait::async_trait;
use std::sync::atomic::AtomicU64;
use tokio::sync::mpsc;

/// Counters shared between a probe's streaming task and its owner.
#[derive(Debug, Default)]
pub struct ProbeCounters {
    /// Ring-buffer records that failed length validation
    pub decode_errors: AtomicU64,
    /// Decoded events dropped because the shared channel was full
    pub channel_drops: AtomicU64,
}

/// A loaded probe bound to one interface. Owns the kernel-side resources;
/// consuming `close` makes double-close unrepresentable.
#[async_trait]
pub trait ProbeHandle: Send + Sync {
    fn ifindex(&self) -> u32;

    /// Stop the streaming task and release all kernel resources. Complete
    /// when the method returns.
    async fn close(self: Box<Self>);
}

/// Builds a probe for an interface: load the program, attach it, start the
/// streaming task feeding `out`.
pub trait ProbeLauncher: Send + Sync {
    fn launch(
        &self,
        iface: &IfaceDescriptor,
        out: mpsc::Sender<RawEvent>,
    ) -> Result<Box<dyn ProbeHandle>>;
}
