//! kioku server binary
//!
//! HTTP server for versioned memory blocks.
//!
//! ## Usage
//!
//! ```bash
//! # In-memory store on the default address
//! kioku-server
//!
//! # SQLite-backed, single-user
//! kioku-server --db ~/.local/share/kioku/kioku.db --default-owner amy
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use kioku_server::{AppState, ServerConfig, router};
use kioku_store::BlockRegistry;

#[derive(Parser, Debug)]
#[command(name = "kioku-server")]
#[command(about = "Versioned memory blocks with human-approved agent edits")]
struct Args {
    /// Config file (default: <config dir>/kioku/server.ron)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(long)]
    bind: Option<String>,

    /// SQLite database path; in-memory when unset
    #[arg(long)]
    db: Option<PathBuf>,

    /// Owner for requests without an x-kioku-owner header
    #[arg(long)]
    default_owner: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(db) = args.db {
        config.database = Some(db);
    }
    if let Some(owner) = args.default_owner {
        config.default_owner = Some(owner);
    }
    config.validate()?;

    let store_config = config.store_config();
    let registry = match &config.database {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            BlockRegistry::open(path, store_config)
                .with_context(|| format!("opening {}", path.display()))?
        }
        None => {
            tracing::warn!("no database configured, blocks live in memory only");
            BlockRegistry::in_memory(store_config)
        }
    };

    let finished = registry
        .workflow()
        .reconcile_all()
        .context("reconciling interrupted approvals")?;
    if !finished.is_empty() {
        tracing::info!(count = finished.len(), "finished interrupted approvals");
    }

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!("kioku listening on {}", listener.local_addr()?);

    let app = router(AppState::new(registry, config));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
    }
}
