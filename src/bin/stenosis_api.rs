//! stenosis_api - local screening service
//!
//! This daemon:
//! 1. Loads configuration (STENOSIS_CONFIG plus env overrides)
//! 2. Builds the detector, report generator and fallbacks
//! 3. Serves the screening API until Ctrl-C

use anyhow::Result;
use std::sync::mpsc;

use stenosis_screen::{
    api::{ApiConfig, ApiServer},
    Analyzer, ScreeningConfig,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ScreeningConfig::load()?;
    let analyzer = Analyzer::from_config(&config)?;
    log::info!(
        "detector backend '{}', report generator '{}'",
        analyzer.detectors().default_name().unwrap_or("none"),
        analyzer.reporter().generator_name()
    );

    let api_config = ApiConfig {
        addr: config.api.addr.clone(),
        session_ttl: config.api.session_ttl,
        max_upload_bytes: config.api.max_upload_bytes,
        ..ApiConfig::default()
    };
    let api_handle = ApiServer::new(api_config, analyzer).spawn()?;
    log::info!("screening api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("stenosis_api waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
