//! dirindex daemon
//!
//! Rebuilds the snapshot of one directory tree on a fixed interval and serves
//! listing queries over a Unix socket.

use std::fs;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dirindex::{run_rebuild_loop, server, Config, Result, Store};

async fn run(config: Config) -> Result<()> {
    let store = Store::open(&config.db_path, &config.root)?.with_query_timeout(config.query_timeout);
    let store = Arc::new(store);
    info!(
        "Indexing {} into {}",
        store.root().display(),
        store.db_path().display()
    );

    let rebuild = tokio::spawn(run_rebuild_loop(Arc::clone(&store), config.refresh_interval));

    let listener = server::bind(&config.socket_path)?;
    info!(
        "Listening on {} ({} mode)",
        config.socket_path.display(),
        if config.cached_only { "cached" } else { "live" }
    );

    tokio::select! {
        _ = server::serve(listener, Arc::clone(&store), config.cached_only) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        }
    }

    rebuild.abort();
    match rebuild.await {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => warn!("Rebuild task failed: {}", e),
    }
    if let Err(e) = fs::remove_file(&config.socket_path) {
        warn!("Failed to remove socket {}: {}", config.socket_path.display(), e);
    }

    match Arc::try_unwrap(store) {
        Ok(store) => store.close()?,
        Err(_) => warn!("Snapshot store still in use, leaving it to process exit"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dirindex=info")),
        )
        .init();

    info!("dirindex starting...");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
