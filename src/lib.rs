pub mod charger;
pub mod codec;
pub mod commands;
pub mod config;
pub mod error;
pub mod mqtt_bridge;
pub mod mqtt_entities;
pub mod options;
pub mod param;
pub mod session;

use crate::config::BridgeConfig;
use crate::mqtt_bridge::MqttBridge;
use crate::session::Session;
use anyhow::Result;
use log::{error, info};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wires together the session controller (C4) and the MQTT bridge (C7) and
/// runs both until `shutdown_rx` fires.
///
/// The session controller has no internal reconnect (spec's open question
/// on WebSocket-drop recovery resolves in favor of "the session controller
/// exits"); on a natural disconnect this function logs it and lets the
/// process exit rather than restarting the task itself.
pub async fn app(mut shutdown_rx: broadcast::Receiver<()>, config: Arc<BridgeConfig>) -> Result<()> {
    info!(
        "Starting scharge-bridge {} for charger {}",
        CARGO_PKG_VERSION, config.serial
    );

    let session = Arc::new(Session::new(config.serial.clone()));

    let session_task = {
        let session = session.clone();
        let bind_ip = config.bind_ip;
        let bind_port = config.bind_port;
        tokio::spawn(async move {
            // Local time with a trailing "Z", not a real UTC conversion:
            // matches the firmware's own handshake wire format.
            if let Err(e) = session.run(bind_ip, bind_port, false).await {
                error!("Session controller ended: {e}");
            }
        })
    };

    let (mqtt_stop_tx, mqtt_stop_rx) = oneshot::channel();
    let mqtt_task = {
        let session = session.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let bridge = Arc::new(MqttBridge::new(session));
            if let Err(e) = bridge
                .run(&config.mqtt_host, config.mqtt_port, &config.mqtt_user, &config.mqtt_password, mqtt_stop_rx)
                .await
            {
                error!("MQTT bridge ended: {e}");
            }
        })
    };

    let _ = shutdown_rx.recv().await;
    info!("Shutdown signal received, stopping.");
    let _ = mqtt_stop_tx.send(());
    session_task.abort();
    let _ = mqtt_task.await;

    info!("Shutdown complete.");
    Ok(())
}
