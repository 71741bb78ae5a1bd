//! Per-interface eBPF probe: load, attach at tc ingress, stream ring buffers
//!
//! Every veth gets its own `Ebpf` instance so that program globals can carry
//! the interface identity. The streaming task owns the instance, polls both
//! ring buffers, and feeds decoded events into the shared channel; close
//! stops the task, which detaches the programs and releases the maps.

use crate::error::{AgentError, Result};
use crate::events::{decode_http, decode_rpc, RawEvent};
use crate::interfaces::IfaceDescriptor;
use crate::probe::{ProbeCounters, ProbeHandle, ProbeLauncher};
use async_trait::async_trait;
use aya::maps::{MapData, RingBuf};
use aya::programs::{tc, SchedClassifier, TcAttachType};
use aya::{Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use std::ffi::CStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const HTTP_PROGRAM: &str = "http_trace";
const RPC_PROGRAM: &str = "rpc_trace";
const HTTP_MAP: &str = "HTTP_EVENTS";
const RPC_MAP: &str = "RPC_EVENTS";

/// Program globals rewritten per interface before the verifier sees the code
const IFINDEX_GLOBAL: &str = "CFG_IFINDEX";
const PEER_GLOBAL: &str = "CFG_PEER_ADDR";

const RING_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_BATCH_SIZE: usize = 1024;

/// Builds veth probes from one shared object image.
pub struct VethLauncher {
    image: Arc<Vec<u8>>,
}

impl VethLauncher {
    /// The image is read once at startup and shared; every launch only
    /// rewrites the per-interface globals.
    pub fn new(image: Arc<Vec<u8>>) -> Self {
        Self { image }
    }
}

impl ProbeLauncher for VethLauncher {
    fn launch(
        &self,
        iface: &IfaceDescriptor,
        out: mpsc::Sender<RawEvent>,
    ) -> Result<Box<dyn ProbeHandle>> {
        let name = ifname(iface.index).ok_or(AgentError::UnknownInterface(iface.index))?;
        let peer = u32::from(iface.peer_ip).to_be();

        let mut bpf = EbpfLoader::new()
            .set_global(IFINDEX_GLOBAL, &iface.index, true)
            .set_global(PEER_GLOBAL, &peer, true)
            .load(&self.image)
            .map_err(|e| AgentError::ProgramLoad {
                target: name.clone(),
                reason: e.to_string(),
            })?;

        if let Err(e) = EbpfLogger::init(&mut bpf) {
            debug!("no eBPF logger for {}: {}", name, e);
        }

        if let Err(e) = tc::qdisc_add_clsact(&name) {
            debug!("clsact qdisc on {}: {} (may already exist)", name, e);
        }
        attach_classifier(&mut bpf, HTTP_PROGRAM, &name)?;
        attach_classifier(&mut bpf, RPC_PROGRAM, &name)?;

        let http_ring = take_ring_buf(&mut bpf, HTTP_MAP)?;
        let rpc_ring = take_ring_buf(&mut bpf, RPC_MAP)?;

        let counters = Arc::new(ProbeCounters::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        // The task owns the instance: the programs stay attached for as long
        // as it runs, and stopping it releases every kernel object.
        let task = tokio::spawn(stream_events(
            bpf,
            iface.index,
            http_ring,
            rpc_ring,
            out,
            stop_rx,
            counters.clone(),
        ));

        info!("probe attached to {} (ifindex {})", name, iface.index);

        Ok(Box::new(VethProbe {
            ifindex: iface.index,
            name,
            stop_tx,
            task,
            counters,
        }))
    }
}

/// Userspace half of one attached probe
pub struct VethProbe {
    ifindex: u32,
    name: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    counters: Arc<ProbeCounters>,
}

#[async_trait]
impl ProbeHandle for VethProbe {
    fn ifindex(&self) -> u32 {
        self.ifindex
    }

    async fn close(mut self: Box<Self>) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = (&mut self.task).await {
            debug!("streaming task for {}: {}", self.name, e);
        }

        let decode_errors = self.counters.decode_errors.load(Ordering::Relaxed);
        let drops = self.counters.channel_drops.load(Ordering::Relaxed);
        if decode_errors > 0 || drops > 0 {
            warn!(
                "probe on {} closing: {} undecodable records, {} events dropped on full channel",
                self.name, decode_errors, drops
            );
        }
        info!("probe on {} detached", self.name);
    }
}

fn attach_classifier(bpf: &mut Ebpf, program: &str, iface: &str) -> Result<()> {
    let prog: &mut SchedClassifier = bpf
        .program_mut(program)
        .ok_or_else(|| AgentError::Attach {
            program: program.to_string(),
            target: iface.to_string(),
            reason: "program not found in eBPF object".to_string(),
        })?
        .try_into()
        .map_err(|e: aya::programs::ProgramError| AgentError::Attach {
            program: program.to_string(),
            target: iface.to_string(),
            reason: e.to_string(),
        })?;

    prog.load().map_err(|e| AgentError::Attach {
        program: program.to_string(),
        target: iface.to_string(),
        reason: e.to_string(),
    })?;
    prog.attach(iface, TcAttachType::Ingress)
        .map_err(|e| AgentError::Attach {
            program: program.to_string(),
            target: iface.to_string(),
            reason: e.to_string(),
        })?;

    Ok(())
}

fn take_ring_buf(bpf: &mut Ebpf, name: &str) -> Result<RingBuf<MapData>> {
    let map = bpf
        .take_map(name)
        .ok_or_else(|| AgentError::MapMissing(name.to_string()))?;
    RingBuf::try_from(map).map_err(|e| AgentError::MapMissing(format!("{}: {}", name, e)))
}

#[derive(Clone, Copy)]
enum RecordKind {
    Http,
    Rpc,
}

/// Poll loop. Dropping `_bpf` on exit detaches the classifiers and frees the
/// maps.
async fn stream_events(
    _bpf: Ebpf,
    ifindex: u32,
    mut http_ring: RingBuf<MapData>,
    mut rpc_ring: RingBuf<MapData>,
    out: mpsc::Sender<RawEvent>,
    mut stop: watch::Receiver<bool>,
    counters: Arc<ProbeCounters>,
) {
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(RING_POLL_INTERVAL) => {
                drain_ring(&mut http_ring, RecordKind::Http, &out, &counters);
                drain_ring(&mut rpc_ring, RecordKind::Rpc, &out, &counters);
            }
        }
    }
    debug!("event stream for ifindex {} stopped", ifindex);
}

fn drain_ring(
    ring: &mut RingBuf<MapData>,
    kind: RecordKind,
    out: &mpsc::Sender<RawEvent>,
    counters: &ProbeCounters,
) {
    let mut read = 0;
    while let Some(item) = ring.next() {
        read += 1;
        if read > MAX_BATCH_SIZE {
            warn!("hit maximum batch size ({}), stopping poll", MAX_BATCH_SIZE);
            break;
        }

        let decoded = match kind {
            RecordKind::Http => decode_http(&item),
            RecordKind::Rpc => decode_rpc(&item),
        };
        match decoded {
            Ok(event) => match out.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    counters.channel_drops.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => return,
            },
            Err(e) => {
                counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!("dropping record: {}", e);
            }
        }
    }
}

fn ifname(index: u32) -> Option<String> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    let ret = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if ret.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    name.to_str().ok().map(str::to_string)
}
