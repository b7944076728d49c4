//! moto_api - read-only stats API for the dashboard
//!
//! Opens the result store and serves `/health`, `/stats` and `/runs/recent`
//! until Ctrl-C.

use anyhow::{anyhow, Result};
use std::sync::{mpsc, Arc};

use moto_counter::api::{ApiConfig, ApiServer};
use moto_counter::storage::SqliteResultStore;
use moto_counter::AppConfig;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::load()?;
    let store = SqliteResultStore::open(&config.db_path)
        .map_err(|e| anyhow!("store '{}': {:#}", config.db_path, e))?;

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, Arc::new(store)).spawn()?;
    log::info!("moto_api running. serving {}", config.db_path);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("moto_api waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
