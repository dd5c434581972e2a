//! MQTT bridge (C7): Home Assistant discovery payload assembly, the two
//! always-created managers (charging switch, set-current number), the
//! per-parameter sensor/binary-sensor managers derived from charger state,
//! the availability loop, and inbound command dispatch.

use crate::charger::ParamValue;
use crate::commands::{start_charging, stop_charging};
use crate::mqtt_entities::{Manager, NumberCommand, NumberMgr, SensorMgr, SwitchMgr};
use crate::session::Session;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const AVAILABILITY_PERIOD: Duration = Duration::from_secs(3);
const DEFAULT_DESIRED_CURRENT: i64 = 6;

/// Everything needed to run the MQTT side: the managers, a handle to the
/// session they front, and the locally-owned "desired current" that the
/// set-current number manager reads and writes.
pub struct MqttBridge {
    session: Arc<Session>,
    managers: HashMap<&'static str, Manager>,
    desired_current: Arc<AtomicI64>,
}

impl MqttBridge {
    pub fn new(session: Arc<Session>) -> Self {
        let desired_current = Arc::new(AtomicI64::new(DEFAULT_DESIRED_CURRENT));
        let mut managers = HashMap::new();

        managers.insert("charging", charging_switch(session.clone(), desired_current.clone()));
        managers.insert("set_current", set_current_number(session.clone(), desired_current.clone()));

        for param in session.charger_state.lock().unwrap().sensor_eligible_params() {
            let name = param.spec.entity_name;
            let manager = Manager::Sensor(SensorMgr {
                name: name.to_string(),
                human_name: param.spec.human_name.to_string(),
                device_class: param.spec.device_class,
                unit: param.spec.unit,
            });
            managers.insert(name, manager);
        }

        Self {
            session,
            managers,
            desired_current,
        }
    }

    /// Waits for the charger state to be fully populated (every parameter
    /// has seen at least one update), polling once a second, mirroring the
    /// original's startup gate before publishing discovery.
    async fn wait_for_initialized(&self) {
        while !self.session.initialized() {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    fn discovery_topic(&self) -> String {
        format!("homeassistant/device/scharge{}/config", self.session.charge_box_sn)
    }

    fn discovery_payload(&self) -> String {
        let state = self.session.charger_state.lock().unwrap();
        let sw_version = state
            .device_param_value("sVersion")
            .map(|v| v.to_string())
            .unwrap_or_default();
        let hw_version = state
            .device_param_value("hVersion")
            .map(|v| v.to_string())
            .unwrap_or_default();
        drop(state);

        let mut cmps = serde_json::Map::new();
        for manager in self.managers.values() {
            let (id, fragment) = manager.get_description();
            cmps.insert(id, fragment);
        }

        let payload = json!({
            "dev": {
                "ids": format!("scharge{}", self.session.charge_box_sn),
                "name": "SCharge",
                "mf": "Joint Charging",
                "mdl": "EVCD2",
                "sw": sw_version,
                "sn": self.session.charge_box_sn,
                "hw": hw_version,
            },
            "o": {
                "name": "scharge-bridge",
                "sw": env!("CARGO_PKG_VERSION"),
            },
            "cmps": Value::Object(cmps),
            "state_topic": "scharge/state",
            "qos": 2,
        });
        serde_json::to_string(&payload).expect("discovery payload is valid JSON")
    }

    /// Runs the bridge against a connected MQTT client until the process is
    /// asked to shut down (`stop` fires) or the event loop errors out.
    ///
    /// The receiver task is spawned and polling the event loop *before* any
    /// discovery/subscribe/publish request is issued: `AsyncClient::new`'s
    /// bounded request channel is far smaller than the startup burst (one
    /// discovery publish plus a subscribe and two publishes per manager), so
    /// nothing may enqueue on it until something is already draining it.
    pub async fn run(
        self: Arc<Self>,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        mut stop: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let mut options = MqttOptions::new("scharge-bridge", host, port);
        options.set_credentials(username, password);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, eventloop) = AsyncClient::new(options, 16);

        let receiver_task = {
            let bridge = self.clone();
            let client = client.clone();
            tokio::spawn(async move { bridge.receiver_loop(client, eventloop).await })
        };

        info!("Waiting for charger state to initialize before publishing discovery.");
        self.wait_for_initialized().await;

        self.publish(&client, &self.discovery_topic(), &self.discovery_payload(), true)
            .await?;

        for manager in self.managers.values() {
            if let Some(topic) = manager.command_topic() {
                client
                    .subscribe(&topic, QoS::AtLeastOnce)
                    .await
                    .with_context(|| format!("subscribing to {topic}"))?;
            }
            self.publish_manager(&client, manager, false).await;
        }
        client.subscribe("homeassistant/status", QoS::AtMostOnce).await?;

        let availability_task = {
            let bridge = self.clone();
            let client = client.clone();
            tokio::spawn(async move { bridge.availability_loop(client).await })
        };

        let mut param_events = self.session.param_events.subscribe();

        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("MQTT bridge stopping.");
                    break;
                }
                change = param_events.recv() => {
                    match change {
                        Ok(change) => self.publish_param_change(&client, change).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("MQTT bridge missed {n} parameter change events.");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        availability_task.abort();
        receiver_task.abort();
        Ok(())
    }

    /// Continuously polls the event loop so its internal request channel
    /// keeps draining, and dispatches any incoming command publishes.
    async fn receiver_loop(&self, client: AsyncClient, mut eventloop: EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.dispatch_command(&client, &publish.topic, &publish.payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT event loop error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn availability_loop(&self, client: AsyncClient) {
        loop {
            for manager in self.managers.values() {
                let online = self.session.initialized();
                let payload = if online { "online" } else { "offline" };
                let _ = self
                    .publish(&client, &manager.availability_topic(), payload, false)
                    .await;
            }
            tokio::time::sleep(AVAILABILITY_PERIOD).await;
        }
    }

    async fn publish_manager(&self, client: &AsyncClient, manager: &Manager, retain: bool) {
        let online = self.session.initialized();
        let _ = self
            .publish(client, &manager.availability_topic(), if online { "online" } else { "offline" }, retain)
            .await;
        if let Some(state) = self.current_state_msg(manager) {
            let _ = self.publish(client, &manager.state_topic(), &state, retain).await;
        }
    }

    fn current_state_msg(&self, manager: &Manager) -> Option<String> {
        match manager {
            Manager::Switch(_) => Some(if self.session.charger_state.lock().unwrap().is_charging() {
                "ON".to_string()
            } else {
                "OFF".to_string()
            }),
            Manager::Number(_) => Some(self.desired_current.load(Ordering::Relaxed).to_string()),
            Manager::Sensor(m) => self.sensor_value(&m.name),
            _ => None,
        }
    }

    fn sensor_value(&self, entity_name: &str) -> Option<String> {
        let state = self.session.charger_state.lock().unwrap();
        state
            .sensor_eligible_params()
            .into_iter()
            .find(|p| p.spec.entity_name == entity_name)
            .and_then(|p| p.get())
            .map(ParamValue::to_string)
    }

    async fn publish_param_change(&self, client: &AsyncClient, change: crate::charger::ParamChange) {
        let Some(manager) = self.managers.get(change.entity_name) else {
            return;
        };
        let _ = self.publish(client, &manager.state_topic(), &change.value.to_string(), false).await;
    }

    async fn dispatch_command(&self, client: &AsyncClient, topic: &str, payload: &[u8]) {
        let raw = String::from_utf8_lossy(payload);
        let Some(manager) = self.managers.values().find(|m| m.command_topic().as_deref() == Some(topic)) else {
            return;
        };
        debug!("{topic} << {raw}");
        manager.process_msg(&raw).await;
        self.publish_manager(client, manager, false).await;
    }

    async fn publish(&self, client: &AsyncClient, topic: &str, payload: &str, retain: bool) -> Result<()> {
        debug!("{topic} >> {payload}");
        client
            .publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes())
            .await
            .with_context(|| format!("publishing to {topic}"))
    }
}

fn charging_switch(session: Arc<Session>, desired_current: Arc<AtomicI64>) -> Manager {
    Manager::Switch(SwitchMgr {
        name: "charging".to_string(),
        human_name: "Charging".to_string(),
        on_set: Arc::new(move |on| {
            let session = session.clone();
            let desired_current = desired_current.clone();
            Box::pin(async move {
                let connector_id = {
                    let state = session.charger_state.lock().unwrap();
                    if !state.connector_main.is_connected() && state.connector_vice.is_connected() {
                        2
                    } else {
                        1
                    }
                };

                if on {
                    let current = desired_current.load(Ordering::Relaxed);
                    info!("Starting charging from MQTT on connector {connector_id} with current {current}A.");
                    if !start_charging(&session, current, connector_id, 1.0).await {
                        error!("Failed to start charging.");
                    }
                } else {
                    info!("Stopping charging from MQTT on connector {connector_id}.");
                    if !stop_charging(&session, connector_id).await {
                        error!("Failed to stop charging.");
                    }
                }
            })
        }),
    })
}

fn set_current_number(session: Arc<Session>, desired_current: Arc<AtomicI64>) -> Manager {
    let (min, max) = {
        let state = session.charger_state.lock().unwrap();
        (
            state.connector_main.mini_current().unwrap_or(6) as f64,
            state.connector_main.max_current().unwrap_or(32) as f64,
        )
    };
    Manager::Number(NumberMgr {
        name: "set_current".to_string(),
        human_name: "Set Current".to_string(),
        min,
        max,
        step: 1.0,
        unit: "A",
        device_class: "current",
        on_set: Arc::new(move |command| {
            let desired_current = desired_current.clone();
            Box::pin(async move {
                match command {
                    NumberCommand::Set(v) => desired_current.store(v as i64, Ordering::Relaxed),
                    NumberCommand::Reset => desired_current.store(DEFAULT_DESIRED_CURRENT, Ordering::Relaxed),
                }
            })
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> Arc<Session> {
        Arc::new(Session::new("X".to_string()))
    }

    #[test]
    fn bridge_registers_switch_and_number_and_sensors() {
        let session = test_session();
        let bridge = MqttBridge::new(session);
        assert!(bridge.managers.contains_key("charging"));
        assert!(bridge.managers.contains_key("set_current"));
        assert!(bridge.managers.contains_key("connector_main/charge_current"));
    }

    #[test]
    fn discovery_topic_uses_serial() {
        let session = test_session();
        let bridge = MqttBridge::new(session);
        assert_eq!(bridge.discovery_topic(), "homeassistant/device/schargeX/config");
    }

    #[test]
    fn current_state_msg_for_switch_reflects_charging() {
        let session = test_session();
        let bridge = MqttBridge::new(session.clone());
        let manager = bridge.managers.get("charging").unwrap();
        assert_eq!(bridge.current_state_msg(manager), Some("OFF".to_string()));
    }
}
