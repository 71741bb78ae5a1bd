//! vethscope-agent - Node agent for eBPF application telemetry
//!
//! The agent runs on each Kubernetes node and:
//! - Keeps one eBPF probe attached per veth interface
//! - Watches the cluster API for pod and service addresses
//! - Enriches kernel events with workload identity tags
//! - Emits finished metrics as JSON lines on the outbound channel

use anyhow::Result;

#[cfg(not(target_os = "linux"))]
fn main() -> Result<()> {
    eprintln!("Error: vethscope-agent requires Linux to run eBPF programs");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> Result<()> {
    use clap::Parser;
    use log::{debug, info, warn};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::signal;
    use tokio::sync::mpsc;
    use vethscope_agent::enrich::Enricher;
    use vethscope_agent::error::AgentError;
    use vethscope_agent::events::EVENT_CHANNEL_CAPACITY;
    use vethscope_agent::interfaces::VethScanner;
    use vethscope_agent::k8s::ClusterWatcher;
    use vethscope_agent::metric::MetricSink;
    use vethscope_agent::probe::manager::ProbeManager;
    use vethscope_agent::probe::oom::OomWatcher;
    use vethscope_agent::probe::veth::VethLauncher;
    use vethscope_agent::workload::WorkloadCache;

    #[derive(Parser, Debug)]
    #[command(name = "vethscope-agent")]
    #[command(about = "eBPF application telemetry agent for Kubernetes nodes")]
    #[command(version)]
    struct Args {
        /// Compiled eBPF object file
        #[arg(long, default_value = "/usr/lib/vethscope/probes.o")]
        bpf_object: PathBuf,

        /// Veth rescan interval in seconds
        #[arg(long, default_value_t = 2)]
        scan_interval: u64,

        /// Classify successful requests slower than this many milliseconds as
        /// application_http_slow (off unless set)
        #[arg(long)]
        slow_threshold_ms: Option<u64>,

        /// Shared raw event channel capacity
        #[arg(long, default_value_t = EVENT_CHANNEL_CAPACITY)]
        event_capacity: usize,

        /// Outbound metric channel capacity
        #[arg(long, default_value_t = 1024)]
        metric_capacity: usize,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    info!("vethscope-agent starting...");

    // Bump the memlock rlimit. This is needed for older kernels that don't
    // use the new memcg based accounting.
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {}", ret);
    }

    // The only fatal error: without the object image there is nothing to run.
    let image = std::fs::read(&args.bpf_object).map_err(|e| AgentError::ImageRead {
        path: args.bpf_object.display().to_string(),
        source: e,
    })?;
    let image = Arc::new(image);

    // Workload cache, populated by the cluster watcher when the API is
    // reachable. The agent still runs without it; lookups just miss.
    let cache = WorkloadCache::new();
    match ClusterWatcher::new(cache.clone()).await {
        Ok(watcher) => {
            info!("Kubernetes API available - starting cluster watcher");
            tokio::spawn(watcher.run());
        }
        Err(e) => {
            warn!(
                "Kubernetes API not available: {}. Running without workload enrichment.",
                e
            );
        }
    }

    let (event_tx, event_rx) = mpsc::channel(args.event_capacity);
    let (metric_tx, mut metric_rx) = mpsc::channel(args.metric_capacity);
    let sink = MetricSink::new(metric_tx);

    // Outbound consumer: JSON lines on stdout
    tokio::spawn(async move {
        while let Some(metric) = metric_rx.recv().await {
            match serde_json::to_string(&metric) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("failed to serialize metric: {}", e),
            }
        }
    });

    let enricher = Enricher::new(cache.clone())
        .with_slow_threshold(args.slow_threshold_ms.map(Duration::from_millis));
    let enrich_task = tokio::spawn(enricher.run(event_rx, sink.clone()));

    let oom_watcher = match OomWatcher::start(&image, event_tx.clone()) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!("oom watcher not started: {}", e);
            None
        }
    };

    let scanner = VethScanner::new(Duration::from_secs(args.scan_interval));
    let (snapshot, link_events) = scanner.spawn();
    info!("tracking {} veth interfaces at startup", snapshot.len());

    let manager = Arc::new(ProbeManager::new(
        VethLauncher::new(image.clone()),
        event_tx.clone(),
    ));
    let run_manager = manager.clone();
    let mut manager_task = tokio::spawn(async move {
        run_manager.run(snapshot, link_events).await;
    });

    info!("vethscope-agent running. Press Ctrl+C to exit.");

    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Stop reacting to link changes, then tear down every probe. Closing the
    // probes stops their streaming tasks; once all event senders are gone the
    // enricher drains the channel and exits.
    manager_task.abort();
    let _ = (&mut manager_task).await;
    manager.close_all().await;
    if let Some(oom) = oom_watcher {
        oom.stop().await;
    }
    drop(manager);
    drop(event_tx);
    let _ = enrich_task.await;

    if sink.dropped() > 0 {
        info!("{} metrics dropped on full outbound channel", sink.dropped());
    }
    info!("vethscope-agent stopped");
    Ok(())
}
