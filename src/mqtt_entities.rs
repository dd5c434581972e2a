//! MQTT entity managers (C6): per-entity descriptor, topic triple, and
//! discovery-fragment encoding. Availability is a global predicate owned by
//! the bridge (C7), not stored here.

use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type Handler<T> = Arc<dyn Fn(T) -> BoxFuture + Send + Sync>;

pub fn state_topic(name: &str) -> String {
    format!("scharge/{name}/state")
}

pub fn command_topic(name: &str) -> String {
    format!("scharge/{name}/set")
}

pub fn availability_topic(name: &str) -> String {
    format!("scharge/{name}/available")
}

fn unique_id(name: &str) -> String {
    format!("scharge_{}", name.replace(['/', '.'], "_"))
}

pub struct SwitchMgr {
    pub name: String,
    pub human_name: String,
    pub on_set: Handler<bool>,
}

#[derive(Debug, Clone, Copy)]
pub enum NumberCommand {
    Set(f64),
    Reset,
}

pub struct NumberMgr {
    pub name: String,
    pub human_name: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub unit: &'static str,
    pub device_class: &'static str,
    pub on_set: Handler<NumberCommand>,
}

pub struct SensorMgr {
    pub name: String,
    pub human_name: String,
    pub device_class: &'static str,
    pub unit: &'static str,
}

pub struct BinarySensorMgr {
    pub name: String,
    pub human_name: String,
    pub device_class: &'static str,
}

pub struct EnumSensorMgr {
    pub name: String,
    pub human_name: String,
    pub options: Vec<String>,
}

pub struct NumberDiagnosticMgr {
    pub name: String,
    pub human_name: String,
    pub unit: &'static str,
}

pub enum Manager {
    Switch(SwitchMgr),
    Number(NumberMgr),
    Sensor(SensorMgr),
    BinarySensor(BinarySensorMgr),
    EnumSensor(EnumSensorMgr),
    NumberDiagnostic(NumberDiagnosticMgr),
}

impl Manager {
    pub fn name(&self) -> &str {
        match self {
            Manager::Switch(m) => &m.name,
            Manager::Number(m) => &m.name,
            Manager::Sensor(m) => &m.name,
            Manager::BinarySensor(m) => &m.name,
            Manager::EnumSensor(m) => &m.name,
            Manager::NumberDiagnostic(m) => &m.name,
        }
    }

    pub fn state_topic(&self) -> String {
        state_topic(self.name())
    }

    pub fn availability_topic(&self) -> String {
        availability_topic(self.name())
    }

    /// Writable managers (switch, number) accept commands; the rest are
    /// read-only and have no command topic.
    pub fn command_topic(&self) -> Option<String> {
        match self {
            Manager::Switch(m) => Some(command_topic(&m.name)),
            Manager::Number(m) => Some(command_topic(&m.name)),
            _ => None,
        }
    }

    /// (unique_id, discovery JSON fragment), matching the `cmps` entries
    /// Home Assistant's MQTT device-discovery schema expects. Absent
    /// optional fields (empty device-class/unit) are omitted rather than
    /// emitted empty.
    pub fn get_description(&self) -> (String, Value) {
        let id = unique_id(self.name());
        let fragment = match self {
            Manager::Switch(m) => json!({
                "p": "switch",
                "name": m.human_name,
                "unique_id": id,
                "device_class": "switch",
                "state_topic": state_topic(&m.name),
                "state_on": "ON",
                "state_off": "OFF",
                "command_topic": command_topic(&m.name),
                "payload_on": "ON",
                "payload_off": "OFF",
                "availability_topic": availability_topic(&m.name),
                "payload_available": "online",
                "payload_not_available": "offline",
                "availability_mode": "latest",
                "optimistic": true,
                "qos": 0,
                "retain": false,
            }),
            Manager::Number(m) => {
                let mut obj = json!({
                    "p": "number",
                    "name": m.human_name,
                    "unique_id": id,
                    "entity_category": "config",
                    "state_topic": state_topic(&m.name),
                    "min": m.min,
                    "max": m.max,
                    "step": m.step,
                    "command_topic": command_topic(&m.name),
                    "payload_reset": "reset",
                    "availability_topic": availability_topic(&m.name),
                    "payload_available": "online",
                    "payload_not_available": "offline",
                    "availability_mode": "latest",
                    "optimistic": true,
                    "qos": 0,
                    "retain": true,
                });
                insert_optional(&mut obj, "device_class", m.device_class);
                insert_optional(&mut obj, "unit_of_measurement", m.unit);
                obj
            }
            Manager::Sensor(m) => {
                let mut obj = json!({
                    "p": "sensor",
                    "name": m.human_name,
                    "unique_id": id,
                    "state_class": "measurement",
                    "state_topic": state_topic(&m.name),
                    "availability_topic": availability_topic(&m.name),
                    "payload_available": "online",
                    "payload_not_available": "offline",
                    "availability_mode": "latest",
                    "expire_after": 10,
                    "qos": 0,
                });
                insert_optional(&mut obj, "device_class", m.device_class);
                insert_optional(&mut obj, "unit_of_measurement", m.unit);
                obj
            }
            Manager::BinarySensor(m) => {
                let mut obj = json!({
                    "p": "binary_sensor",
                    "name": m.human_name,
                    "unique_id": id,
                    "state_topic": state_topic(&m.name),
                    "payload_on": "ON",
                    "payload_off": "OFF",
                    "availability_topic": availability_topic(&m.name),
                    "payload_available": "online",
                    "payload_not_available": "offline",
                    "availability_mode": "latest",
                    "expire_after": 10,
                    "qos": 0,
                });
                insert_optional(&mut obj, "device_class", m.device_class);
                obj
            }
            Manager::EnumSensor(m) => json!({
                "p": "sensor",
                "name": m.human_name,
                "unique_id": id,
                "state_topic": state_topic(&m.name),
                "options": m.options,
                "availability_topic": availability_topic(&m.name),
                "payload_available": "online",
                "payload_not_available": "offline",
                "availability_mode": "latest",
                "expire_after": 10,
                "qos": 0,
            }),
            Manager::NumberDiagnostic(m) => {
                let mut obj = json!({
                    "p": "sensor",
                    "name": m.human_name,
                    "unique_id": id,
                    "entity_category": "diagnostic",
                    "state_class": "measurement",
                    "state_topic": state_topic(&m.name),
                    "availability_topic": availability_topic(&m.name),
                    "payload_available": "online",
                    "payload_not_available": "offline",
                    "availability_mode": "latest",
                    "expire_after": 10,
                    "qos": 0,
                });
                insert_optional(&mut obj, "unit_of_measurement", m.unit);
                obj
            }
        };
        (id, fragment)
    }

    /// Translates a raw MQTT payload and dispatches to the bound handler.
    /// Only meaningful for writable managers.
    pub async fn process_msg(&self, raw: &str) {
        match self {
            Manager::Switch(m) => {
                let on = raw.eq_ignore_ascii_case("ON");
                (m.on_set)(on).await;
            }
            Manager::Number(m) => {
                let command = if raw.eq_ignore_ascii_case("reset") {
                    NumberCommand::Reset
                } else if let Ok(v) = raw.parse::<f64>() {
                    NumberCommand::Set(v)
                } else {
                    return;
                };
                (m.on_set)(command).await;
            }
            _ => {}
        }
    }
}

fn insert_optional(obj: &mut Value, key: &str, value: &str) {
    if !value.is_empty() {
        obj.as_object_mut().unwrap().insert(key.to_string(), json!(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_description_has_expected_shape() {
        let mgr = Manager::Switch(SwitchMgr {
            name: "charging".to_string(),
            human_name: "Charging".to_string(),
            on_set: Arc::new(|_| Box::pin(async {})),
        });
        let (id, fragment) = mgr.get_description();
        assert_eq!(id, "scharge_charging");
        assert_eq!(fragment["p"], "switch");
        assert_eq!(fragment["state_topic"], "scharge/charging/state");
    }

    #[test]
    fn sensor_omits_empty_device_class() {
        let mgr = Manager::Sensor(SensorMgr {
            name: "total_power".to_string(),
            human_name: "Total Power".to_string(),
            device_class: "",
            unit: "",
        });
        let (_, fragment) = mgr.get_description();
        assert!(fragment.get("device_class").is_none());
        assert!(fragment.get("unit_of_measurement").is_none());
    }

    #[tokio::test]
    async fn number_process_msg_parses_reset() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let reset_seen = Arc::new(AtomicBool::new(false));
        let flag = reset_seen.clone();
        let mgr = Manager::Number(NumberMgr {
            name: "set_current".to_string(),
            human_name: "Set Current".to_string(),
            min: 6.0,
            max: 32.0,
            step: 1.0,
            unit: "A",
            device_class: "current",
            on_set: Arc::new(move |cmd| {
                let flag = flag.clone();
                Box::pin(async move {
                    if matches!(cmd, NumberCommand::Reset) {
                        flag.store(true, Ordering::SeqCst);
                    }
                })
            }),
        });
        mgr.process_msg("reset").await;
        assert!(reset_seen.load(Ordering::SeqCst));
    }
}
