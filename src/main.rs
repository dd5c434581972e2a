use anyhow::Result;
use log::{error, info};
use scharge_bridge::config::BridgeConfig;
use scharge_bridge::options::Options;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::broadcast;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .init();

    let options = Options::new();
    let config = match BridgeConfig::from_options(options) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    info!("scharge-bridge {CARGO_PKG_VERSION} starting");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
        }
        let _ = shutdown_tx_clone.send(());
    });

    scharge_bridge::app(shutdown_rx, config).await
}
