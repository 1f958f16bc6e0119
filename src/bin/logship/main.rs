// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

use logship::manager::{Manager, ManagerConfig};

#[derive(Debug, Parser)]
#[command(name = "logship", about = "Log ingestion agent")]
struct Args {
    /// Directories (glob patterns) holding runner .conf files
    #[arg(long = "confs", env = "LOGSHIP_CONF_DIRS", value_delimiter = ',')]
    confs: Vec<String>,

    /// Directory where API-created configurations persist
    #[arg(long, env = "LOGSHIP_REST_DIR")]
    rest_dir: Option<PathBuf>,

    /// Root directory for per-runner meta state
    #[arg(long, env = "LOGSHIP_META_ROOT", default_value = "meta")]
    meta_root: PathBuf,

    /// Log filter, e.g. "info" or "logship=debug"
    #[arg(long, env = "LOGSHIP_LOG_FILTER", default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_filter)?)
        .init();

    let manager = Manager::new(ManagerConfig {
        rest_dir: args.rest_dir.unwrap_or_default(),
        meta_root: args.meta_root,
        ..Default::default()
    })?;

    manager.watch(args.confs.clone());
    manager.restore_rest_dir();
    info!(confs = ?args.confs, "agent started");

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt"),
        _ = sigterm.recv() => info!("received terminate"),
    }

    manager.stop()?;
    Ok(())
}
