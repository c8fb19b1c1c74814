//! Conductor - the coordination kernel's `serve` entrypoint.
//!
//! Boots the Store, binds the command surface, and spawns the allocator,
//! watchdog and merger loops under a shared graceful-shutdown signal,
//! mirroring the teacher's `tracing_subscriber` initialization and
//! `anyhow` error boundary at `main`.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use fs2::FileExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conductor::broadcast::ChannelBroadcast;
use conductor::config::CliOverrides;
use conductor::context::AppContext;
use conductor::store::Store;
use conductor::supervisor::{ProcessSupervisor, TmuxSupervisor};

/// How often the merger checks the queue. Not part of the configurable
/// surface (§6 lists only the allocator/watchdog intervals as tunable); a
/// merge attempt shells out to `git`/`gh`, so this is deliberately a touch
/// slower than the allocator's in-process tick.
const MERGER_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "conductor", version, about = "Multi-agent orchestration coordination kernel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator: command surface, allocator, watchdog, merger.
    Serve {
        /// Project directory the coordinator manages. Defaults to the
        /// current directory.
        #[arg(long)]
        project_dir: Option<String>,
        #[arg(long)]
        max_workers: Option<u8>,
        #[arg(long)]
        heartbeat_timeout_s: Option<i64>,
        #[arg(long)]
        watchdog_interval_ms: Option<u64>,
        #[arg(long)]
        allocator_interval_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            project_dir,
            max_workers,
            heartbeat_timeout_s,
            watchdog_interval_ms,
            allocator_interval_ms,
        } => {
            let project_dir = project_dir.map_or_else(|| PathBuf::from("."), PathBuf::from);
            let project_dir = project_dir.canonicalize().unwrap_or(project_dir);
            let overrides = CliOverrides {
                max_workers,
                heartbeat_timeout_s,
                watchdog_interval_ms,
                allocator_interval_ms,
                project_dir: Some(project_dir.to_string_lossy().into_owned()),
            };
            serve(project_dir, overrides).await
        }
    }
}

async fn serve(project_dir: PathBuf, overrides: CliOverrides) -> anyhow::Result<()> {
    let config = conductor::config::load_config(&project_dir, overrides)?;
    info!(
        project_dir = %config.project_dir,
        max_workers = config.max_workers,
        heartbeat_timeout_s = config.heartbeat_timeout_s,
        "starting conductor"
    );

    preflight_check_binaries()?;

    let lock_path = conductor::config::lock_path(&project_dir);
    let _lock = acquire_single_instance_lock(&lock_path)?;

    let db_path = conductor::config::db_path(&project_dir);
    let store = Store::open(&db_path).await?;
    info!(db_path = %db_path.display(), "opened store");

    let socket_path = conductor::config::default_socket_path(&project_dir);
    let listener = conductor::command::server::bind(&socket_path)?;
    let hint_path = conductor::config::socket_path_hint_file(&project_dir);
    write_socket_hint(&hint_path, &socket_path)?;
    info!(socket_path = %socket_path.display(), "bound command surface");

    let supervisor: Arc<dyn ProcessSupervisor> =
        Arc::new(TmuxSupervisor::new(conductor::config::session_name(&project_dir)));
    let broadcast = Arc::new(ChannelBroadcast::default());
    let ctx = AppContext::new(store, config.clone(), supervisor, broadcast);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let server = tokio::spawn(conductor::command::server::run(listener, ctx.clone(), shutdown_rx.clone()));
    let allocator = tokio::spawn(conductor::allocator::run(
        ctx.clone(),
        Duration::from_millis(config.allocator_interval_ms),
        shutdown_rx.clone(),
    ));
    let watchdog = tokio::spawn(conductor::watchdog::run(
        ctx.clone(),
        Duration::from_millis(config.watchdog_interval_ms),
        shutdown_rx.clone(),
    ));
    let merger = tokio::spawn(conductor::merger::run(ctx.clone(), MERGER_INTERVAL, shutdown_rx.clone()));

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received, draining in-flight work");
    let _ = shutdown_tx.send(true);

    for handle in [server, allocator, watchdog, merger] {
        if let Err(e) = handle.await {
            warn!(error = %e, "a coordinator loop task panicked");
        }
    }

    let _ = std::fs::remove_file(&hint_path);
    info!("conductor shut down cleanly");
    Ok(())
}

/// `tmux` is load-bearing for the supervisor; its absence is a startup
/// error. `git`/`gh` are only needed once the merge queue has work, so their
/// absence is logged but not fatal.
fn preflight_check_binaries() -> anyhow::Result<()> {
    which::which("tmux").map_err(|_| anyhow::anyhow!("required binary not found on PATH: tmux"))?;
    for binary in ["git", "gh"] {
        if which::which(binary).is_err() {
            warn!(binary, "binary not found on PATH; merge queue resolution needing it will fail at the point of use");
        }
    }
    Ok(())
}

/// Exclusive `flock`-style lock held for the process lifetime, preventing
/// two `conductor serve` instances from racing on the same project's state
/// directory.
fn acquire_single_instance_lock(path: &Path) -> anyhow::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).write(true).truncate(false).open(path)?;
    file.try_lock_exclusive().map_err(|_| {
        anyhow::anyhow!(
            "another conductor instance already holds the lock at {} for this project",
            path.display()
        )
    })?;
    Ok(file)
}

fn write_socket_hint(hint_path: &Path, socket_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = hint_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(hint_path, socket_path.to_string_lossy().as_bytes())?;
    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
