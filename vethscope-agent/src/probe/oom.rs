//! OOM-kill watcher: one global kprobe, independent of any interface
//!
//! The kernel side records a snapshot per killed pid in a hash map; the
//! watcher drains the map on an interval and forwards the entries as events.

use crate::error::{AgentError, Result};
use crate::events::{OomKillEvent, RawEvent};
use crate::probe::ProbeCounters;
use aya::maps::{HashMap as BpfHashMap, MapData};
use aya::programs::KProbe;
use aya::{Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use log::{debug, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use vethscope_common::OomRecord;

const OOM_PROGRAM: &str = "oom_kill_process";
const OOM_MAP: &str = "OOM_STATS";
const OOM_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct OomWatcher {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    counters: Arc<ProbeCounters>,
}

impl OomWatcher {
    /// Load the kprobe from the shared object image and start draining its
    /// stats map into `out`.
    pub fn start(image: &[u8], out: mpsc::Sender<RawEvent>) -> Result<Self> {
        let mut bpf = EbpfLoader::new()
            .load(image)
            .map_err(|e| AgentError::ProgramLoad {
                target: "oom watcher".to_string(),
                reason: e.to_string(),
            })?;

        if let Err(e) = EbpfLogger::init(&mut bpf) {
            debug!("no eBPF logger for oom watcher: {}", e);
        }

        let prog: &mut KProbe = bpf
            .program_mut(OOM_PROGRAM)
            .ok_or_else(|| AgentError::Attach {
                program: OOM_PROGRAM.to_string(),
                target: "kprobe".to_string(),
                reason: "program not found in eBPF object".to_string(),
            })?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| AgentError::Attach {
                program: OOM_PROGRAM.to_string(),
                target: "kprobe".to_string(),
                reason: e.to_string(),
            })?;
        prog.load().map_err(|e| AgentError::Attach {
            program: OOM_PROGRAM.to_string(),
            target: "kprobe".to_string(),
            reason: e.to_string(),
        })?;
        prog.attach(OOM_PROGRAM, 0)
            .map_err(|e| AgentError::Attach {
                program: OOM_PROGRAM.to_string(),
                target: "kprobe".to_string(),
                reason: e.to_string(),
            })?;

        let map = bpf
            .take_map(OOM_MAP)
            .ok_or_else(|| AgentError::MapMissing(OOM_MAP.to_string()))?;
        let stats: BpfHashMap<MapData, u32, OomRecord> = BpfHashMap::try_from(map)
            .map_err(|e| AgentError::MapMissing(format!("{}: {}", OOM_MAP, e)))?;

        let counters = Arc::new(ProbeCounters::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(drain_oom_stats(bpf, stats, out, stop_rx, counters.clone()));

        Ok(Self {
            stop_tx,
            task,
            counters,
        })
    }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;

        let drops = self.counters.channel_drops.load(Ordering::Relaxed);
        if drops > 0 {
            warn!("oom watcher closing: {} events dropped on full channel", drops);
        }
    }
}

/// Poll loop. Keeps the `Ebpf` instance alive so the kprobe stays attached;
/// dropping it on exit detaches the program.
async fn drain_oom_stats(
    _bpf: Ebpf,
    mut stats: BpfHashMap<MapData, u32, OomRecord>,
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
            _ = tokio::time::sleep(OOM_POLL_INTERVAL) => {
                let pids: Vec<u32> = stats.keys().filter_map(|k| k.ok()).collect();
                for pid in pids {
                    let Ok(record) = stats.get(&pid, 0) else {
                        continue;
                    };
                    let event = OomKillEvent::from_record(&record);
                    warn!("oom kill: pid {}, comm {}, cgroup {}", event.pid, event.comm, event.cgroup_id);

                    match out.try_send(RawEvent::OomKill(event)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            counters.channel_drops.fetch_add(1, Ordering::Relaxed);
                            debug!("event channel full, dropping oom kill for pid {}", pid);
                        }
                        Err(TrySendError::Closed(_)) => return,
                    }
                    if let Err(e) = stats.remove(&pid) {
                        debug!("failed to clear oom entry for pid {}: {}", pid, e);
                    }
                }
            }
        }
    }
    debug!("oom watcher stopped");
}
