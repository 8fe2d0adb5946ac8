//! Mailsync scheduler binary.
//!
//! Runs one sync process: claims accounts from the zone's assignment service
//! and supervises their monitors until SIGINT or SIGTERM.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use deadpool_redis::{Config, Pool, Runtime};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mailsync_scheduler::monitor::TaskMonitorFactory;
use mailsync_scheduler::{
    AdmissionController, HeartbeatStore, MonitorRegistry, ProcessIdentity, SyncBackends,
    SyncError, SyncService, SyncServiceConfig, ValkeyAccountStore, ValkeyAssignmentClient,
    ValkeyHeartbeatStore,
};

#[derive(Parser)]
#[command(name = "mailsync-scheduler")]
#[command(about = "Assign mail accounts to this process and supervise their sync")]
#[command(version)]
struct Cli {
    /// Core index of this process on the host (labels logs and metrics)
    #[arg(long, default_value_t = 0)]
    cpu_id: u32,

    /// Fleet-unique process identifier (defaults to <hostname>:<cpu-id>)
    #[arg(long)]
    process_id: Option<String>,

    /// Seconds between reconciliation ticks (overrides config)
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Configuration file (defaults to mailsync.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("mailsync_scheduler=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SyncServiceConfig::from_file(path)?,
        None => SyncServiceConfig::load()?,
    };
    if let Some(secs) = cli.poll_interval {
        config.poll_interval = Duration::from_secs(secs);
    }

    let identity = match cli.process_id {
        Some(process_id) => ProcessIdentity::new(process_id, cli.cpu_id),
        None => ProcessIdentity::for_cpu(cli.cpu_id),
    };

    info!(
        process = %identity,
        zone = config.zone(),
        valkey = %config.valkey.url,
        poll_interval_secs = config.poll_interval.as_secs(),
        "Configuration loaded"
    );

    let pool = connect_valkey(&config).await?;
    let prefix = config.valkey.key_prefix.as_str();

    let heartbeats: Arc<dyn HeartbeatStore> = Arc::new(ValkeyHeartbeatStore::new(pool.clone(), prefix));
    let monitors = MonitorRegistry::uniform(Arc::new(TaskMonitorFactory::heartbeat(
        config.monitor.sync_interval,
        heartbeats.clone(),
    )));
    info!(providers = ?monitors.providers(), "Monitor backends registered");

    let backends = SyncBackends {
        accounts: Arc::new(ValkeyAccountStore::new(pool.clone(), prefix)),
        heartbeats,
        assignment: Arc::new(ValkeyAssignmentClient::new(pool, prefix, config.zone())),
        monitors,
    };

    let admission = AdmissionController::system(&config.admission);
    let service = Arc::new(SyncService::new(identity, config, admission, backends));

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, stopping sync loop");
        cancel_on_signal.cancel();
    });

    Arc::clone(&service).run(cancel).await;
    service.shutdown().await;

    info!("Mailsync scheduler shutdown complete");
    Ok(())
}

async fn connect_valkey(config: &SyncServiceConfig) -> Result<Pool, SyncError> {
    let pool = Config::from_url(&config.valkey.url)
        .builder()
        .map_err(|e| SyncError::Config(e.to_string()))?
        .max_size(config.valkey.max_connections)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| SyncError::Config(e.to_string()))?;

    // Test connection
    let mut conn = pool.get().await?;
    let _: String = deadpool_redis::redis::cmd("PING")
        .query_async(&mut conn)
        .await?;

    Ok(pool)
}

async fn shutdown_signal() {
    let ctrl_c = signal_received("SIGINT", signal::ctrl_c());

    #[cfg(unix)]
    let terminate = signal_received("SIGTERM", async {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        sigterm.recv().await;
        Ok::<_, io::Error>(())
    });

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C");
        }
        () = terminate => {
            info!("Received SIGTERM");
        }
    }
}

/// Resolves once the signal arrives. If the handler cannot be installed it
/// never resolves, so a broken handler cannot trigger a shutdown.
async fn signal_received(name: &str, signal: impl Future<Output = io::Result<()>>) {
    if let Err(e) = signal.await {
        error!(signal = name, error = %e, "Failed to install signal handler");
        std::future::pending::<()>().await;
    }
}
