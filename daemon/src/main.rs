use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;

use jobgate_daemon::config::{Config, ConfigOverlay};
use jobgate_daemon::db::SqlitePersist;
use jobgate_daemon::metrics::MetricsCollector;
use jobgate_daemon::{logging, server, JobApi, LocalCluster, ProcessLauncher};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (.yaml, .yml or .toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Extra config file merged over the first
    #[arg(long)]
    overlay: Option<PathBuf>,
    /// Unix socket to listen on
    #[arg(long)]
    socket: Option<PathBuf>,
    /// SQLite database path
    #[arg(long)]
    db: Option<PathBuf>,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match args.config {
        Some(ref path) => Config::from_file(path)?,
        None => {
            let default_path = Path::new(common::DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                Config::from_file(default_path)?
            } else {
                Config::default()
            }
        }
    };
    if let Some(ref path) = args.overlay {
        config.merge(ConfigOverlay::from_file(path)?);
    }
    if let Some(ref socket) = args.socket {
        config.server.socket_path = socket.clone();
    }
    if let Some(ref db) = args.db {
        config.server.db_path = db.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    logging::setup_logging(&config.logging)?;
    log::info!("Starting jobgate-daemon...");

    let db_path = &config.server.db_path;
    let persist = Arc::new(
        SqlitePersist::open(db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?,
    );

    let cluster = LocalCluster::new(&config.launcher, &config.pipelines);
    log::info!(
        "Local cluster ready: {} pipelines, {} concurrent jobs",
        config.pipelines.len(),
        config.launcher.max_concurrent_jobs
    );
    let launcher = Arc::new(ProcessLauncher::new(cluster, persist.clone()));
    let api = Arc::new(JobApi::new(
        persist,
        launcher,
        config.request_timeout(),
        Arc::new(MetricsCollector::new()),
    ));

    let socket_path = &config.server.socket_path;
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
    log::info!("Listening on {}", socket_path.display());

    // Set socket permissions to allow all users to connect
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(socket_path)?.permissions();
    perms.set_mode(0o666);
    std::fs::set_permissions(socket_path, perms)?;

    tokio::select! {
        result = server::serve(listener, api) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
            let _ = std::fs::remove_file(socket_path);
            Ok(())
        }
    }
}
