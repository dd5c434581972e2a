//! Session controller (C4): UDP broadcast discovery, WebSocket accept,
//! keep-alive loop, acknowledgement pump, and the request/response
//! correlator.

use crate::charger::{ChargerState, ParamChange};
use crate::codec::{self, Decoded};
use crate::file_error;
use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const T_UDP: Duration = Duration::from_millis(1900);
const T_HANDSHAKE: Duration = Duration::from_millis(7000);
const UDP_BROADCAST_PORT: u16 = 3050;

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = futures_util::stream::SplitStream<WebSocketStream<TcpStream>>;

/// A map from `uniqueId` to a completion channel with an implicit deadline
/// enforced by the caller via `tokio::time::timeout`. Owned entirely by the
/// session controller; on ack, look up and signal, removing the entry. On
/// timeout the caller is responsible for removing its own entry.
#[derive(Default)]
pub struct Correlator {
    pending: StdMutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl Correlator {
    pub fn register(&self, unique_id: String) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(unique_id, tx);
        rx
    }

    /// Resolves the pending entry for `unique_id`, if any. Ignores acks for
    /// unknown/already-resolved ids (duplicate acks are a no-op, per
    /// spec.md open question 3).
    pub fn resolve(&self, unique_id: &str, result: bool) {
        if let Some(tx) = self.pending.lock().unwrap().remove(unique_id) {
            let _ = tx.send(result);
        }
    }

    pub fn cancel(&self, unique_id: &str) {
        self.pending.lock().unwrap().remove(unique_id);
    }
}

/// Live session state for one charger connection. There is exactly one of
/// these per process (no multi-charger fleet support, per spec.md §1).
pub struct Session {
    pub charge_box_sn: String,
    pub user_id: u32,
    pub connection_key: String,
    pub correlator: Correlator,
    pub charger_state: StdMutex<ChargerState>,
    pub param_events: broadcast::Sender<ParamChange>,
    ws_sink: AsyncMutex<Option<WsSink>>,
    connected: AtomicBool,
}

impl Session {
    pub fn new(charge_box_sn: String) -> Self {
        let connection_key = charge_box_sn.clone();
        let (param_events, _) = broadcast::channel(256);
        Self {
            charger_state: StdMutex::new(ChargerState::new(charge_box_sn.clone())),
            charge_box_sn,
            user_id: 1,
            connection_key,
            correlator: Correlator::default(),
            param_events,
            ws_sink: AsyncMutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn initialized(&self) -> bool {
        self.charger_state.lock().unwrap().initialized()
    }

    async fn send_text(&self, text: String) -> Result<()> {
        debug!(">> {text}");
        let mut guard = self.ws_sink.lock().await;
        let sink = guard.as_mut().context("no active websocket")?;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Registers a pending confirmation, sends `text`, and awaits the
    /// charger's ack up to `deadline`. On timeout the pending entry is
    /// removed and an error is returned; the caller (C5) turns that into
    /// `(false, "response timed out")`.
    pub async fn correlated_send(&self, unique_id: String, text: String, deadline: Duration) -> Result<bool> {
        let rx = self.correlator.register(unique_id.clone());
        self.send_text(text).await?;

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => bail!("confirmation channel dropped"),
            Err(_) => {
                self.correlator.cancel(&unique_id);
                bail!("response timed out")
            }
        }
    }

    pub async fn send_ack(&self, unique_id: String) {
        let text = codec::encode_ack(&self.charge_box_sn, &unique_id);
        if let Err(e) = self.send_text(text).await {
            warn!("failed to send ack for {unique_id}: {e}");
        }
    }

    /// Runs the full discovery-then-session lifecycle until the WebSocket
    /// disconnects. Per spec.md open question 2, this does not retry
    /// internally; a disconnect ends the task and the process relies on an
    /// external supervisor to restart if desired.
    pub async fn run(
        self: std::sync::Arc<Self>,
        bind_ip: Ipv4Addr,
        bind_port: u16,
        use_utc_handshake: bool,
    ) -> Result<()> {
        let listener = TcpListener::bind((bind_ip, bind_port))
            .await
            .with_context(|| format!("binding websocket listener on {bind_ip}:{bind_port}"))?;
        let actual_port = listener.local_addr()?.port();
        info!("Started WebSocket listener on {bind_ip}:{actual_port}");

        let (stop_udp_tx, stop_udp_rx) = oneshot::channel();
        let udp_task = {
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(e) = session.udp_handshake_loop(bind_ip, actual_port, stop_udp_rx).await {
                    warn!("UDP handshake loop ended: {e}");
                }
            })
        };

        info!("Waiting for charger to connect to WebSocket.");
        let (stream, remote) = listener.accept().await.context("accepting websocket connection")?;
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .context("completing websocket handshake")?;
        info!("Connection established with {remote}!");
        let _ = stop_udp_tx.send(());
        let _ = udp_task.await;

        let (sink, stream) = ws.split();
        *self.ws_sink.lock().await = Some(sink);
        self.connected.store(true, Ordering::Release);

        let keepalive_task = {
            let session = self.clone();
            tokio::spawn(async move { session.handshake_loop(use_utc_handshake).await })
        };

        let result = self.clone().inbound_pump(stream).await;
        keepalive_task.abort();
        self.connected.store(false, Ordering::Release);
        *self.ws_sink.lock().await = None;
        result
    }

    async fn udp_handshake_loop(
        &self,
        recv_ip: Ipv4Addr,
        recv_port: u16,
        mut stop: oneshot::Receiver<()>,
    ) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", UDP_BROADCAST_PORT))
            .await
            .context("binding UDP discovery socket")?;
        socket.set_broadcast(true)?;
        let broadcast_ip = broadcast_address(recv_ip);

        loop {
            let timeout_unix_millis = codec::unix_millis(std::time::SystemTime::now() + T_UDP);
            let message = codec::encode_udp_handshake(timeout_unix_millis, &self.charge_box_sn, &recv_ip.to_string(), recv_port);
            debug!(">>UDP {message}");
            socket.send_to(message.as_bytes(), (broadcast_ip, UDP_BROADCAST_PORT)).await?;

            tokio::select! {
                _ = &mut stop => {
                    debug!("UDP handshake loop cancelled.");
                    return Ok(());
                }
                _ = tokio::time::sleep(T_UDP) => {}
            }
        }
    }

    async fn handshake_loop(&self, use_utc: bool) {
        loop {
            let now = chrono::Local::now();
            let current_time = if use_utc {
                now.with_timezone(&chrono::Utc).format("%Y-%m-%dT%H:%M:%SZ").to_string()
            } else {
                now.format("%Y-%m-%dT%H:%M:%SZ").to_string()
            };
            let unique_id = codec::unix_millis(std::time::SystemTime::now()).to_string();
            let text = codec::encode_handshake_raw(&unique_id, &current_time, self.user_id, &self.charge_box_sn, &self.connection_key);
            if let Err(e) = self.send_text(text).await {
                warn!("handshake send failed: {e}");
                return;
            }
            tokio::time::sleep(T_HANDSHAKE).await;
        }
    }

    async fn inbound_pump(self: std::sync::Arc<Self>, mut stream: WsStream) -> Result<()> {
        while let Some(frame) = stream.next().await {
            let frame = frame?;
            let text = match frame {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            debug!("<< {text}");

            let decoded = match codec::decode_inbound(&text) {
                Ok(d) => d,
                Err(e) => {
                    warn!("dropping malformed frame: {e}");
                    continue;
                }
            };

            match decoded {
                Decoded::Ack { unique_id, result } => {
                    self.correlator.resolve(&unique_id, result);
                }
                Decoded::Payload(payload) => {
                    if payload.charge_box_sn != self.charge_box_sn {
                        debug!(
                            "Ignoring message for a different charge box SN{} (expected SN{}).",
                            payload.charge_box_sn, self.charge_box_sn
                        );
                        continue;
                    }

                    let unique_id = extract_unique_id(&text);
                    if let Some(unique_id) = unique_id {
                        let session = self.clone();
                        tokio::spawn(async move { session.send_ack(unique_id).await });
                    }

                    let changes = self.charger_state.lock().unwrap().update(&payload);
                    for change in changes {
                        let _ = self.param_events.send(change);
                    }
                }
                Decoded::Unknown => {}
            }
        }
        bail!(file_error!("websocket stream ended"))
    }
}

fn extract_unique_id(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value.get("uniqueId").and_then(serde_json::Value::as_str).map(str::to_string)
}

/// Broadcast address of the /24 subnet containing `ip`.
fn broadcast_address(ip: Ipv4Addr) -> Ipv4Addr {
    let octets = ip.octets();
    Ipv4Addr::new(octets[0], octets[1], octets[2], 255)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_address_is_slash_24() {
        assert_eq!(broadcast_address(Ipv4Addr::new(192, 168, 1, 42)), Ipv4Addr::new(192, 168, 1, 255));
    }

    #[tokio::test]
    async fn correlator_ignores_duplicate_resolution() {
        let correlator = Correlator::default();
        let rx = correlator.register("42".to_string());
        correlator.resolve("42", true);
        correlator.resolve("42", false); // no pending entry left, no-op
        assert_eq!(rx.await.unwrap(), true);
    }

    #[tokio::test]
    async fn correlator_unknown_ack_is_ignored() {
        let correlator = Correlator::default();
        correlator.resolve("missing", true);
    }
}
