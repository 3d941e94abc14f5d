//! Agent entrypoint: wiring, lifecycle and signal handling.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use wattscope_agent::accel::AcceleratorSource;
use wattscope_agent::collector::{Collector, CollectorOptions};
use wattscope_agent::config::Config;
use wattscope_agent::energy::{
    hwmon::HwmonPlatformSource, powercap::PowercapSource, ComponentEnergySource,
    PlatformEnergySource,
};
use wattscope_agent::exporter::{serve, Exporter, ExportOptions, ServerOptions};
use wattscope_agent::metrics::MetricRegistry;
use wattscope_agent::power::{cpuid, PowerModel, Regressor};
use wattscope_agent::probe::{DisabledProbe, ProbeExporter};
use wattscope_agent::resolver::{kubernetes::PodWatch, Resolver};
use wattscope_agent::store::{StatsStore, StoreData};

/// Pod metadata refresh cadence.
const POD_WATCH_REFRESH: Duration = Duration::from_secs(30);

#[derive(Parser, Debug, Clone)]
#[command(name = "wattscope-agent")]
#[command(about = "Per-node energy attribution agent")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scrape endpoint bind address
    #[arg(long, default_value = "0.0.0.0:8888")]
    listen_address: SocketAddr,

    /// Scrape endpoint path
    #[arg(long, default_value = "/metrics")]
    metrics_path: String,

    /// Node name for series labels (from the Kubernetes downward API)
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// CPU model to microarchitecture lookup file
    #[arg(long, default_value = cpuid::DEFAULT_CPUS_YAML)]
    cpus_yaml: PathBuf,

    /// Pre-fitted power model coefficients
    #[arg(long, default_value = "/var/lib/wattscope/data/power_model.yaml")]
    power_model: PathBuf,

    /// procfs root (overridable for testing)
    #[arg(long, default_value = "/proc")]
    proc_root: PathBuf,

    /// cgroup mount root
    #[arg(long, default_value = "/sys/fs/cgroup")]
    cgroup_root: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    tracing::info!(
        listen = %args.listen_address,
        interval_s = config.sample_interval_seconds,
        use_cgroup_id = config.use_cgroup_id,
        "starting wattscope-agent"
    );

    run(args, config).await
}

async fn run(args: Args, config: Config) -> anyhow::Result<()> {
    let node_name = args
        .node_name
        .clone()
        .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
        .unwrap_or_else(|| "unknown".to_string());

    let cpu_architecture = match &config.cpu_arch_override {
        Some(arch) => arch.clone(),
        None => detect_cpu_architecture(&args),
    };
    let sys_root = std::path::Path::new("/sys");
    tracing::info!(
        node = %node_name,
        cpu_architecture = %cpu_architecture,
        online_cpus = cpuid::online_cpus(sys_root).unwrap_or(0),
        pmu = cpuid::pmu_name(sys_root).as_deref().unwrap_or("none"),
        "node identity"
    );

    // Probe support is provided by an external exporter build; this build
    // runs the pipeline with an empty probe when none is wired in.
    let probe: Box<dyn ProbeExporter> = Box::new(DisabledProbe);
    let supported = probe.supported_metrics().all();
    let registry = MetricRegistry::new(&supported, config.enable_gpu, config.enable_irq);

    let component_source: Option<Box<dyn ComponentEnergySource>> = match PowercapSource::probe() {
        Ok(source) => Some(Box::new(source)),
        Err(e) => {
            tracing::warn!(error = %e, "component energy unavailable, attribution will rely on the model");
            None
        }
    };
    let platform_source: Option<Box<dyn PlatformEnergySource>> = match HwmonPlatformSource::probe()
    {
        Ok(source) => Some(Box::new(source)),
        Err(e) => {
            tracing::info!(error = %e, "platform energy unavailable");
            None
        }
    };
    let accelerator: Option<Box<dyn AcceleratorSource>> = None;
    if config.enable_gpu && accelerator.is_none() {
        tracing::info!("GPU accounting enabled but no accelerator backend is wired in");
    }
    if config.enable_qat {
        tracing::info!("QAT accounting enabled but no accelerator backend is wired in");
    }
    if config.redfish_cred_file_path.is_some() || config.hmc_endpoint.is_some() {
        tracing::info!("redfish/hmc options recognized but no backend is wired in");
    }

    let regressor = Regressor::load(&args.power_model, &cpu_architecture);
    if regressor.is_empty() {
        tracing::info!("no power model coefficients for this host, using ratio estimation");
    }
    let model = PowerModel::new(
        config.ratio_metrics()?,
        config.idle_window_ticks,
        regressor,
        config.enable_idle_attribution,
    );

    let store = Arc::new(StatsStore::new(StoreData::new(
        node_name.clone(),
        cpu_architecture,
    )));
    let resolver = Arc::new(Resolver::new(&args.proc_root, &args.cgroup_root));

    let exporter = Arc::new(Exporter::new(
        Arc::clone(&store),
        ExportOptions {
            process_metrics: config.enable_process_metrics,
            vm_metrics: config.enable_vm_metrics,
            resource_metrics: registry.metrics().to_vec(),
        },
    ));

    // Shutdown coordination: SIGINT/SIGTERM flip the watch channel; the
    // collector finishes its in-flight tick, the server drains.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
        let _ = signal_tx.send(true);
    });

    if let Some(pod_watch) = PodWatch::try_new(args.node_name.clone()).await {
        let watch_resolver = Arc::clone(&resolver);
        let watch_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            pod_watch
                .run(watch_resolver, POD_WATCH_REFRESH, watch_shutdown)
                .await;
        });
    }

    let collector = Collector::new(
        Arc::clone(&store),
        resolver,
        registry,
        model,
        CollectorOptions {
            sample_interval: config.sample_interval(),
            use_cgroup_id: config.use_cgroup_id,
            merge_system: config.merge_system,
            proc_idle_ticks: config.proc_idle_ticks,
            grace_ticks: config.grace_ticks,
            max_source_failures: config.max_source_failures,
        },
        probe,
        component_source,
        platform_source,
        accelerator,
    );
    let collector_shutdown = shutdown_rx.clone();
    let collector_task = tokio::spawn(async move {
        collector.run(collector_shutdown).await;
    });

    // The scrape endpoint failing to bind is fatal at startup.
    serve(
        exporter,
        ServerOptions {
            listen_address: args.listen_address,
            metrics_path: args.metrics_path.clone(),
        },
        shutdown_rx,
    )
    .await
    .context("scrape endpoint failed")?;

    collector_task.await.ok();
    tracing::info!("shutdown complete");
    Ok(())
}

fn detect_cpu_architecture(args: &Args) -> String {
    let id = match cpuid::read_cpuinfo(&args.proc_root) {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read cpuinfo");
            return cpuid::UNKNOWN_UARCH.to_string();
        }
    };
    let specs = cpuid::load_model_specs(&args.cpus_yaml);
    cpuid::resolve_uarch(&specs, &id)
}
