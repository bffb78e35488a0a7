//! Singleton controller replica.
//!
//! Runs one or more replicas of a demo controller against an in-memory
//! deterministic store. Exactly one replica leads at a time; the leader waits
//! for its caches before starting workers, and hands over on SIGINT/SIGTERM.
//!
//! Configuration is loaded from environment variables, a TOML file, or CLI
//! arguments (precedence: env < TOML < CLI).
//!
//! # Usage
//!
//! ```bash
//! # Single replica with defaults
//! aspen-singleton --lease-namespace kube-bind --lease-name konnector
//!
//! # Three contending replicas, two caches each
//! aspen-singleton --replicas 3 --cache widgets --cache gadgets
//!
//! # Environment variables
//! export ASPEN_SINGLETON_LEASE_NAMESPACE=kube-bind
//! aspen-singleton --config /etc/aspen/singleton.toml
//! ```

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use aspen_singleton::DeterministicKeyValueStore;
use aspen_singleton::LeadershipObserver;
use aspen_singleton::ReconcileError;
use aspen_singleton::Reconciler;
use aspen_singleton::SingletonConfig;
use aspen_singleton::SingletonCoordinator;
use aspen_singleton::Term;
use aspen_singleton::WorkQueue;
use aspen_singleton::cache_source;
use async_trait::async_trait;
use clap::Parser;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "aspen-singleton", version)]
struct Args {
    /// Path to TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Unique replica identity. Defaults to `{hostname}_{uuid}`.
    #[arg(long)]
    identity: Option<String>,

    /// Name of the lease guarding the singleton.
    #[arg(long)]
    lease_name: Option<String>,

    /// Namespace of the lease.
    #[arg(long)]
    lease_namespace: Option<String>,

    /// Lease duration in milliseconds.
    #[arg(long)]
    lease_duration_ms: Option<u64>,

    /// Renewal interval in milliseconds.
    #[arg(long)]
    renew_interval_ms: Option<u64>,

    /// Acquisition retry period in milliseconds.
    #[arg(long)]
    retry_period_ms: Option<u64>,

    /// Reconciliation workers started while leading.
    #[arg(long)]
    worker_count: Option<u32>,

    /// Cache sync timeout in milliseconds.
    #[arg(long)]
    cache_sync_timeout_ms: Option<u64>,

    /// Replicas to run in this process, all contending for the same lease.
    #[arg(long, default_value_t = 1)]
    replicas: u32,

    /// Demo cache names each replica waits on before starting workers.
    #[arg(long = "cache", default_value = "primary")]
    caches: Vec<String>,

    /// How long the demo caches take to sync, in milliseconds.
    #[arg(long, default_value_t = 200)]
    cache_sync_delay_ms: u64,

    /// Interval between demo work items, in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    work_interval_ms: u64,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

/// Overrides given on the command line, as a config layer.
fn cli_config(args: &Args) -> SingletonConfig {
    let defaults = SingletonConfig::default();
    SingletonConfig {
        identity: args.identity.clone().unwrap_or(defaults.identity),
        lease_name: args.lease_name.clone().unwrap_or(defaults.lease_name),
        lease_namespace: args.lease_namespace.clone().unwrap_or(defaults.lease_namespace),
        lease_duration_ms: args.lease_duration_ms.unwrap_or(defaults.lease_duration_ms),
        renew_interval_ms: args.renew_interval_ms.unwrap_or(defaults.renew_interval_ms),
        retry_period_ms: args.retry_period_ms.unwrap_or(defaults.retry_period_ms),
        worker_count: args.worker_count.unwrap_or(defaults.worker_count),
        cache_sync_timeout_ms: args.cache_sync_timeout_ms.unwrap_or(defaults.cache_sync_timeout_ms),
        ..defaults
    }
}

/// Load configuration with precedence env < TOML < CLI.
fn load_config(path: Option<&Path>, cli: SingletonConfig) -> Result<SingletonConfig> {
    let mut config = SingletonConfig::from_env();
    if let Some(path) = path {
        let file = SingletonConfig::from_toml_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?;
        config.merge(file);
    }
    config.merge(cli);

    let config = config.with_default_identity();
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Logs each key it is asked to reconcile.
struct LoggingReconciler {
    replica: String,
}

#[async_trait]
impl Reconciler for LoggingReconciler {
    async fn reconcile(&self, key: &str, cancel: &CancellationToken) -> Result<(), ReconcileError> {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                info!(replica = %self.replica, key, "reconciled");
            }
        }
        Ok(())
    }
}

/// Logs leadership transitions.
struct LoggingObserver {
    replica: String,
}

#[async_trait]
impl LeadershipObserver for LoggingObserver {
    async fn on_became_leader(&self, term: Term) {
        info!(replica = %self.replica, term = term.value(), "became leader");
    }

    async fn on_lost_leadership(&self, term: Term) {
        info!(replica = %self.replica, term = term.value(), "lost leadership");
    }
}

/// Feed a demo cache: report synced after `delay`, then idle until shutdown.
fn spawn_cache_feed(name: String, delay: Duration, cancel: CancellationToken) -> aspen_singleton::CacheSource {
    let (notifier, source) = cache_source(name);
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => notifier.mark_synced(),
        }
        cancel.cancelled().await;
    });
    source
}

/// Produce demo work items on a fixed interval.
fn spawn_work_producer(queue: Arc<WorkQueue>, interval: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut sequence: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            sequence += 1;
            queue.add(format!("object-{}", sequence % 8)).await;
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = load_config(args.config.as_deref(), cli_config(&args))?;

    info!(
        replicas = args.replicas,
        lease_namespace = %config.lease_namespace,
        lease_name = %config.lease_name,
        "starting aspen-singleton v{}",
        env!("CARGO_PKG_VERSION")
    );

    let store = DeterministicKeyValueStore::new();
    let cancel = CancellationToken::new();
    let queue = Arc::new(WorkQueue::new());
    spawn_work_producer(queue.clone(), Duration::from_millis(args.work_interval_ms), cancel.clone());

    let mut replicas = JoinSet::new();
    for index in 0..args.replicas.max(1) {
        let mut replica_config = config.clone();
        if args.replicas > 1 {
            replica_config.identity = format!("{}-{index}", config.identity);
        }
        let replica = replica_config.identity.clone();
        info!(index, identity = %replica, "starting replica");

        let mut coordinator = SingletonCoordinator::new(store.clone(), replica_config)
            .with_work_queue(queue.clone())
            .with_reconciler(Arc::new(LoggingReconciler {
                replica: replica.clone(),
            }))
            .with_observer(Arc::new(LoggingObserver {
                replica: replica.clone(),
            }));
        for name in &args.caches {
            let source = spawn_cache_feed(
                name.clone(),
                Duration::from_millis(args.cache_sync_delay_ms),
                cancel.clone(),
            );
            coordinator = coordinator.with_cache_source(source);
        }

        let replica_cancel = cancel.clone();
        replicas.spawn(async move { (replica, coordinator.run(replica_cancel).await) });
    }

    let mut failed = false;
    tokio::select! {
        _ = shutdown_signal() => {}
        Some(joined) = replicas.join_next() => {
            // A replica only returns early on a fatal error.
            let (replica, result) = joined.context("replica task panicked")?;
            if let Err(e) = result {
                error!(replica = %replica, error = %e, "replica stopped");
                failed = true;
            }
        }
    }

    cancel.cancel();
    while let Some(joined) = replicas.join_next().await {
        let (replica, result) = joined.context("replica task panicked")?;
        if let Err(e) = result {
            error!(replica = %replica, error = %e, "replica stopped");
            failed = true;
        }
    }

    if failed {
        anyhow::bail!("one or more replicas failed");
    }
    info!("shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!("failed to install SIGTERM handler: {}", err),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("received SIGTERM, initiating graceful shutdown");
        }
    }
}
