use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fcgate_core::config::{load_configs, load_configs_with_sources, Config, RuntimeConfig};
use fcgate_core::observability::{init_logging, start_metrics};
use fcgated::balancer::SELECTIONS_METRIC;
use fcgated::fastcgi::{ACQUIRE_TIMEOUTS_METRIC, LIVE_CONNECTIONS_METRIC};
use fcgated::listener;
use fcgated::runtime::{Runtime, RuntimeState};
use fcgated::transport::ClientCache;
use metrics::{describe_counter, describe_gauge};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

/// Editors emit several events per save; reload once they settle.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "fcgated", about = "FastCGI dispatch gateway daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve traffic and follow config changes.
    Run {
        #[arg(short, long, required = true, num_args = 1..)]
        config: Vec<PathBuf>,
    },
    /// Load the config, build the service graph and exit.
    Check {
        #[arg(short, long, required = true, num_args = 1..)]
        config: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Run { config } => serve(config),
        Command::Check { config } => check(config),
    }
}

fn worker_threads(cfg: &RuntimeConfig) -> usize {
    cfg.worker_threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

fn max_blocking_threads(cfg: &RuntimeConfig) -> usize {
    cfg.max_blocking_threads
        .unwrap_or_else(|| worker_threads(cfg).saturating_mul(32).max(128))
}

fn serve(paths: Vec<PathBuf>) -> Result<()> {
    let config = load_configs(&paths)?;
    let tokio_rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads(&config.runtime))
        .max_blocking_threads(max_blocking_threads(&config.runtime))
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    tokio_rt.block_on(run_gateway(paths, config))
}

fn check(paths: Vec<PathBuf>) -> Result<()> {
    let config = load_configs(&paths)?;
    let state = RuntimeState::build(config, Arc::new(ClientCache::new()))?;
    println!(
        "config ok: root service {} reaches {} FastCGI upstream(s)",
        state.services.root_name(),
        state.services.addresses().len()
    );
    Ok(())
}

async fn run_gateway(paths: Vec<PathBuf>, config: Config) -> Result<()> {
    init_logging(&config.logging)?;
    if let Some(metrics) = &config.metrics {
        start_metrics(metrics)?;
        describe_metrics();
    }

    let runtime = Runtime::new(config.clone())?;
    let tcp = listener::bind(config.server.listen.as_str()).await?;
    info!(
        listen = %config.server.listen,
        service = %config.server.service,
        worker_threads = worker_threads(&config.runtime),
        "fcgated started"
    );

    let watcher_rt = runtime.clone();
    tokio::spawn(async move {
        if let Err(err) = watch_config(paths, watcher_rt).await {
            warn!(error = ?err, "config watcher failed");
        }
    });

    tokio::select! {
        served = listener::run(tcp, runtime) => served.context("http listener failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
    }
}

fn describe_metrics() {
    describe_counter!(
        listener::REQUESTS_METRIC,
        "Downstream requests answered, by status code"
    );
    describe_counter!(
        SELECTIONS_METRIC,
        "Balancer picks, by service, handler and whether a sticky cookie decided"
    );
    describe_gauge!(
        LIVE_CONNECTIONS_METRIC,
        "Open FastCGI connections per upstream, idle or in use"
    );
    describe_counter!(
        ACQUIRE_TIMEOUTS_METRIC,
        "Requests that gave up waiting for a FastCGI connection slot"
    );
}

/// Rebuilds the runtime state whenever a config file (or one it includes)
/// changes. A config that fails to load or reload leaves the old state
/// serving.
async fn watch_config(paths: Vec<PathBuf>, runtime: Runtime) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<notify::Result<notify::Event>>(16);
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = tx.blocking_send(event);
    })?;
    let mut watched = HashSet::new();
    let (_, sources) = load_configs_with_sources(&paths)?;
    sync_watches(&mut watcher, &mut watched, sources)?;

    while let Some(event) = rx.recv().await {
        if let Err(err) = event {
            warn!(error = ?err, "config watch error");
            continue;
        }
        sleep(RELOAD_DEBOUNCE).await;
        while rx.try_recv().is_ok() {}

        let (next, sources) = match load_configs_with_sources(&paths) {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "config reload rejected");
                continue;
            }
        };
        if let Err(err) = runtime.reload(next) {
            warn!(error = %format!("{err:#}"), "config reload rejected");
            continue;
        }
        if let Err(err) = sync_watches(&mut watcher, &mut watched, sources) {
            warn!(error = ?err, "failed to update config watches");
        }
        info!(files = watched.len(), "config reloaded");
    }
    Ok(())
}

fn sync_watches(
    watcher: &mut dyn notify::Watcher,
    watched: &mut HashSet<PathBuf>,
    sources: Vec<PathBuf>,
) -> Result<()> {
    let wanted: HashSet<PathBuf> = sources.into_iter().collect();
    for gone in watched.difference(&wanted) {
        let _ = watcher.unwatch(gone);
    }
    for path in wanted.difference(watched) {
        watcher
            .watch(path, notify::RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", path.display()))?;
    }
    *watched = wanted;
    Ok(())
}
