//! Node agent for vethscope (DaemonSet)
//!
//! Responsibilities:
//! - Track veth interfaces on the node and keep one eBPF probe attached to each
//! - Poll ring buffers for HTTP/RPC exchanges and the OOM map for kill events
//! - Watch the Kubernetes API for pod and service addresses
//! - Enrich kernel events with workload identity tags
//! - Push finished metrics onto the outbound channel

pub mod enrich;
pub mod error;
pub mod events;
pub mod interfaces;
pub mod k8s;
pub mod metric;
pub mod probe;
pub mod workload;

pub use error::{AgentError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
