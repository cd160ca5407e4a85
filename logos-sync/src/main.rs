//! `logos-sync` server binary.
//!
//! Configuration comes from `LOGOS_SYNC_*` environment variables (see
//! [`ServerConfig::from_env`]); log filtering from `RUST_LOG`.
//!
//! The binary runs with an open directory: any non-empty token
//! authenticates as the user of the same name and may edit any document.

use log::info;

use logos_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    info!(
        "Starting logos-sync on {} ({:?}, storage: {})",
        config.bind_addr,
        config.delivery_order,
        config
            .storage_path
            .as_ref()
            .map_or_else(|| "memory".to_string(), |p| p.display().to_string())
    );

    let server = SyncServer::open(config)?;
    server.run().await
}
