//! # Vitrine Server
//!
//! Media catalog daemon. Loads configuration, wires the pipeline core to
//! its backends (Postgres + Redis, or fully in-memory), seeds libraries
//! and cache folders, then runs the worker pools and the scheduler until
//! signalled.

mod config;
mod runtime;

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::runtime::Runtime;

#[derive(Debug, Parser)]
#[command(name = "vitrine-server", about = "Vitrine media catalog daemon")]
struct Args {
    /// Path to the configuration file (TOML); defaults to `vitrine.toml`
    /// in the working directory when present.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Run entirely in memory, ignoring database_url/redis_url. Useful for
    /// local smoke tests against a scratch library.
    #[arg(long)]
    ephemeral: bool,

    /// Kick off a scan of every configured library at startup.
    #[arg(long)]
    scan_on_start: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig::load(args.config.as_deref())?;
    let runtime = Runtime::start(&config, args.ephemeral).await?;

    if args.scan_on_start {
        for library in runtime
            .service
            .catalog()
            .libraries
            .list_libraries()
            .await?
        {
            let job_id = runtime
                .service
                .start_library_scan(library.id, false)
                .await?;
            info!(
                library = %library.display_name,
                job = %job_id,
                "startup scan queued"
            );
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    runtime.shutdown().await;
    Ok(())
}
