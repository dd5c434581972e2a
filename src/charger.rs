//! Charger state (C3): aggregates parameters into a device tree and derives
//! `initialized`/`is_charging`.

use crate::codec::ParsedPayload;
use crate::param::{ms_to_hours, ParamSpec, ParamValue, Parameter, ValueKind};
use anyhow::{bail, Result};

/// One change notification, forwarded to whoever owns the MQTT bridge (C7).
/// `entity_name` is the same stable fragment the parameter's MQTT manager
/// (if any) is registered under.
#[derive(Debug, Clone)]
pub struct ParamChange {
    pub entity_name: &'static str,
    pub value: ParamValue,
}

macro_rules! connector_specs {
    ($prefix:literal) => {
        &[
            ParamSpec {
                human_name: "Minimal Current",
                entity_name: concat!($prefix, "/minimal_current"),
                source_action: "DeviceData",
                json_key: "miniCurrent",
                unit: "A",
                device_class: "current",
                kind: ValueKind::Int,
                transform: None,
            },
            ParamSpec {
                human_name: "Maximal Current",
                entity_name: concat!($prefix, "/maximal_current"),
                source_action: "DeviceData",
                json_key: "maxCurrent",
                unit: "A",
                device_class: "current",
                kind: ValueKind::Int,
                transform: None,
            },
            ParamSpec {
                human_name: "Connector Status",
                entity_name: concat!($prefix, "/connector_status"),
                source_action: "DeviceData",
                json_key: "connectorStatus",
                unit: "",
                device_class: "",
                kind: ValueKind::Int,
                transform: None,
            },
            ParamSpec {
                human_name: "Lock Status",
                entity_name: concat!($prefix, "/lock_status"),
                source_action: "DeviceData",
                json_key: "lockStatus",
                unit: "",
                device_class: "",
                kind: ValueKind::Bool,
                transform: None,
            },
            ParamSpec {
                human_name: "Plug&Charge Status",
                entity_name: concat!($prefix, "/pnc_status"),
                source_action: "DeviceData",
                json_key: "PncStatus",
                unit: "",
                device_class: "",
                kind: ValueKind::Bool,
                transform: None,
            },
            ParamSpec {
                human_name: "Connection Status",
                entity_name: concat!($prefix, "/connection_status"),
                source_action: "SynchroStatus",
                json_key: "connectionStatus",
                unit: "",
                device_class: "",
                kind: ValueKind::Bool,
                transform: None,
            },
            ParamSpec {
                human_name: "Status Code",
                entity_name: concat!($prefix, "/status_code"),
                source_action: "SynchroStatus",
                json_key: "statusCode",
                unit: "",
                device_class: "",
                kind: ValueKind::Int,
                transform: None,
            },
            ParamSpec {
                human_name: "Charging Status",
                entity_name: concat!($prefix, "/charge_status"),
                source_action: "SynchroStatus",
                json_key: "chargeStatus",
                unit: "",
                device_class: "",
                kind: ValueKind::Str,
                transform: None,
            },
            ParamSpec {
                human_name: "Charging Start Time",
                entity_name: concat!($prefix, "/charge_start_time"),
                source_action: "SynchroStatus",
                json_key: "startTime",
                unit: "",
                device_class: "",
                kind: ValueKind::Str,
                transform: None,
            },
            ParamSpec {
                human_name: "Charging End Time",
                entity_name: concat!($prefix, "/charge_end_time"),
                source_action: "SynchroStatus",
                json_key: "endTime",
                unit: "",
                device_class: "",
                kind: ValueKind::Str,
                transform: None,
            },
            ParamSpec {
                human_name: "Reserved Current",
                entity_name: concat!($prefix, "/charge_reserved_current"),
                source_action: "SynchroStatus",
                json_key: "reserveCurrent",
                unit: "A",
                device_class: "current",
                kind: ValueKind::Int,
                transform: None,
            },
            ParamSpec {
                human_name: "Voltage",
                entity_name: concat!($prefix, "/charge_voltage"),
                source_action: "SynchroData",
                json_key: "voltage",
                unit: "V",
                device_class: "voltage",
                kind: ValueKind::Float,
                transform: None,
            },
            ParamSpec {
                human_name: "Current",
                entity_name: concat!($prefix, "/charge_current"),
                source_action: "SynchroData",
                json_key: "current",
                unit: "A",
                device_class: "current",
                kind: ValueKind::Float,
                transform: None,
            },
            ParamSpec {
                human_name: "Power",
                entity_name: concat!($prefix, "/charge_power"),
                source_action: "SynchroData",
                json_key: "power",
                unit: "kW",
                device_class: "power",
                kind: ValueKind::Float,
                transform: None,
            },
            ParamSpec {
                human_name: "Charged Energy",
                entity_name: concat!($prefix, "/charge_energy"),
                source_action: "SynchroData",
                json_key: "electricWork",
                unit: "kWh",
                device_class: "energy",
                kind: ValueKind::Float,
                transform: None,
            },
            ParamSpec {
                human_name: "Charging Duration",
                entity_name: concat!($prefix, "/charge_duration"),
                source_action: "SynchroData",
                json_key: "chargingTime",
                unit: "",
                device_class: "",
                kind: ValueKind::Str,
                transform: None,
            },
        ]
    };
}

static CONNECTOR_MAIN_SPECS: &[ParamSpec] = connector_specs!("connector_main");
static CONNECTOR_VICE_SPECS: &[ParamSpec] = connector_specs!("connector_vice");

static METER_INFO_SPECS: &[ParamSpec] = &[
    ParamSpec {
        human_name: "Voltage",
        entity_name: "meter/voltage",
        source_action: "SynchroData",
        json_key: "voltage",
        unit: "V",
        device_class: "voltage",
        kind: ValueKind::Float,
        transform: None,
    },
    ParamSpec {
        human_name: "Current",
        entity_name: "meter/current",
        source_action: "SynchroData",
        json_key: "current",
        unit: "A",
        device_class: "current",
        kind: ValueKind::Float,
        transform: None,
    },
    ParamSpec {
        human_name: "Power",
        entity_name: "meter/power",
        source_action: "SynchroData",
        json_key: "power",
        unit: "kW",
        device_class: "power",
        kind: ValueKind::Float,
        transform: None,
    },
];

static DEVICE_SPECS: &[ParamSpec] = &[
    ParamSpec {
        human_name: "Software Version",
        entity_name: "software_version",
        source_action: "DeviceData",
        json_key: "sVersion",
        unit: "",
        device_class: "",
        kind: ValueKind::Str,
        transform: None,
    },
    ParamSpec {
        human_name: "Hardware Version",
        entity_name: "hardware_version",
        source_action: "DeviceData",
        json_key: "hVersion",
        unit: "",
        device_class: "",
        kind: ValueKind::Str,
        transform: None,
    },
    ParamSpec {
        human_name: "Number of Charges",
        entity_name: "number_of_charges",
        source_action: "DeviceData",
        json_key: "chargeTimes",
        unit: "",
        device_class: "",
        kind: ValueKind::Int,
        transform: None,
    },
    ParamSpec {
        human_name: "Cumulative Charge Duration",
        entity_name: "cumulative_charge_duration",
        source_action: "DeviceData",
        json_key: "cumulativeTime",
        unit: "h",
        device_class: "",
        kind: ValueKind::Int,
        transform: Some(ms_to_hours),
    },
    ParamSpec {
        human_name: "Total Power",
        entity_name: "total_power",
        source_action: "DeviceData",
        json_key: "totalPower",
        // Unit is unknown in the original firmware's own annotation; left
        // unitless per spec.md open question 4.
        unit: "",
        device_class: "",
        kind: ValueKind::Int,
        transform: None,
    },
    ParamSpec {
        human_name: "Connection RSSI",
        entity_name: "connection_rssi",
        source_action: "DeviceData",
        json_key: "rssi",
        unit: "dB",
        device_class: "",
        kind: ValueKind::Int,
        transform: None,
    },
    ParamSpec {
        human_name: "EVSE Type",
        entity_name: "evse_type",
        source_action: "DeviceData",
        json_key: "evseType",
        unit: "",
        device_class: "",
        kind: ValueKind::Str,
        transform: None,
    },
    ParamSpec {
        human_name: "EVSE Number of Phases",
        entity_name: "evse_number_of_phases",
        source_action: "DeviceData",
        json_key: "evsePhase",
        unit: "",
        device_class: "",
        kind: ValueKind::Str,
        transform: None,
    },
    ParamSpec {
        human_name: "Load Balancing",
        entity_name: "load_balancing",
        source_action: "DeviceData",
        json_key: "loadbalance",
        unit: "",
        device_class: "",
        kind: ValueKind::Int,
        transform: None,
    },
    ParamSpec {
        human_name: "Has Locking",
        entity_name: "has_locking",
        source_action: "DeviceData",
        json_key: "isHasLock",
        unit: "",
        device_class: "",
        kind: ValueKind::Bool,
        transform: None,
    },
    ParamSpec {
        human_name: "Has Meter",
        entity_name: "has_meter",
        source_action: "DeviceData",
        json_key: "isHasMeter",
        unit: "",
        device_class: "",
        kind: ValueKind::Bool,
        transform: None,
    },
    ParamSpec {
        human_name: "Number of Connectors",
        entity_name: "number_of_connectors",
        source_action: "DeviceData",
        json_key: "connectorNumber",
        unit: "",
        device_class: "",
        kind: ValueKind::Int,
        transform: None,
    },
    ParamSpec {
        human_name: "NWire Exists",
        entity_name: "nwire_exists",
        source_action: "NWireToDics",
        json_key: "NWireExist",
        unit: "",
        device_class: "",
        kind: ValueKind::Bool,
        transform: None,
    },
    ParamSpec {
        human_name: "NWire Closed",
        entity_name: "nwire_closed",
        source_action: "NWireToDics",
        json_key: "NWireClosed",
        unit: "",
        device_class: "",
        kind: ValueKind::Bool,
        transform: None,
    },
];

pub struct Connector {
    pub name: &'static str,
    pub external_id: u8,
    pub params: Vec<Parameter>,
}

impl Connector {
    fn new(name: &'static str, external_id: u8, specs: &'static [ParamSpec]) -> Self {
        Self {
            name,
            external_id,
            params: specs.iter().map(|s| Parameter::new(s, Some(name))).collect(),
        }
    }

    /// Feeds a parsed payload to every owned parameter, collecting change
    /// notifications in traversal order.
    fn update(&mut self, payload: &ParsedPayload) -> Vec<ParamChange> {
        self.params
            .iter_mut()
            .filter_map(|p| {
                p.update(payload).map(|value| ParamChange {
                    entity_name: p.spec.entity_name,
                    value,
                })
            })
            .collect()
    }

    pub fn initialized(&self) -> bool {
        self.params.iter().all(Parameter::initialized)
    }

    fn find(&self, json_key: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.spec.json_key == json_key)
    }

    pub fn is_connected(&self) -> bool {
        self.find("connectionStatus")
            .and_then(Parameter::get)
            .and_then(ParamValue::as_bool)
            .unwrap_or(false)
    }

    pub fn is_charging(&self) -> bool {
        matches!(
            self.find("chargeStatus").and_then(Parameter::get).and_then(ParamValue::as_str),
            Some("charging") | Some("wait")
        )
    }

    pub fn current(&self) -> Option<f64> {
        self.find("current").and_then(Parameter::get).and_then(ParamValue::as_f64)
    }

    pub fn mini_current(&self) -> Option<i64> {
        match self.find("miniCurrent").and_then(Parameter::get) {
            Some(ParamValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn max_current(&self) -> Option<i64> {
        match self.find("maxCurrent").and_then(Parameter::get) {
            Some(ParamValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn charge_status(&self) -> Option<&str> {
        self.find("chargeStatus").and_then(Parameter::get).and_then(ParamValue::as_str)
    }
}

pub struct MeterInfo {
    pub params: Vec<Parameter>,
}

impl MeterInfo {
    fn new() -> Self {
        Self {
            params: METER_INFO_SPECS
                .iter()
                .map(|s| Parameter::new(s, Some("meterInfo")))
                .collect(),
        }
    }

    fn update(&mut self, payload: &ParsedPayload) -> Vec<ParamChange> {
        self.params
            .iter_mut()
            .filter_map(|p| {
                p.update(payload).map(|value| ParamChange {
                    entity_name: p.spec.entity_name,
                    value,
                })
            })
            .collect()
    }

    pub fn initialized(&self) -> bool {
        self.params.iter().all(Parameter::initialized)
    }
}

/// Full device state for one charger, identified by its serial. Owned by a
/// single task (the session controller's inbound pump); every mutation goes
/// through [`ChargerState::update`].
pub struct ChargerState {
    pub charge_box_sn: String,
    pub connector_main: Connector,
    pub connector_vice: Connector,
    pub meter_info: MeterInfo,
    device_params: Vec<Parameter>,
}

impl ChargerState {
    pub fn new(charge_box_sn: String) -> Self {
        Self {
            charge_box_sn,
            connector_main: Connector::new("connectorMain", 1, CONNECTOR_MAIN_SPECS),
            connector_vice: Connector::new("connectorVice", 2, CONNECTOR_VICE_SPECS),
            meter_info: MeterInfo::new(),
            device_params: DEVICE_SPECS.iter().map(|s| Parameter::new(s, None)).collect(),
        }
    }

    /// Applies one parsed payload to the whole state tree. Silently drops
    /// messages for a different charger. Returns change notifications in
    /// traversal order (device params, then connectorMain, connectorVice,
    /// meterInfo) for the caller to forward to MQTT.
    pub fn update(&mut self, payload: &ParsedPayload) -> Vec<ParamChange> {
        if payload.charge_box_sn != self.charge_box_sn {
            return Vec::new();
        }

        let mut changes = Vec::new();
        for p in &mut self.device_params {
            if let Some(value) = p.update(payload) {
                changes.push(ParamChange {
                    entity_name: p.spec.entity_name,
                    value,
                });
            }
        }
        changes.extend(self.connector_main.update(payload));
        changes.extend(self.connector_vice.update(payload));
        changes.extend(self.meter_info.update(payload));
        changes
    }

    pub fn initialized(&self) -> bool {
        self.device_params.iter().all(Parameter::initialized)
            && self.connector_main.initialized()
            && self.connector_vice.initialized()
            && self.meter_info.initialized()
    }

    pub fn is_charging(&self) -> bool {
        self.connector_main.is_charging() || self.connector_vice.is_charging()
    }

    pub fn connector(&self, external_id: u8) -> Result<&Connector> {
        match external_id {
            1 => Ok(&self.connector_main),
            2 => Ok(&self.connector_vice),
            other => bail!("invalid connector id {other} (expected 1 or 2)"),
        }
    }

    pub fn connector_mut(&mut self, external_id: u8) -> Result<&mut Connector> {
        match external_id {
            1 => Ok(&mut self.connector_main),
            2 => Ok(&mut self.connector_vice),
            other => bail!("invalid connector id {other} (expected 1 or 2)"),
        }
    }

    /// `get_current`: explicit connector id, or the first charging
    /// connector, or connector 1 if none are charging.
    pub fn get_current(&self, connector_id: Option<u8>) -> Result<Option<f64>> {
        let id = match connector_id {
            Some(id) => id,
            None => {
                if self.connector_main.is_charging() {
                    1
                } else if self.connector_vice.is_charging() {
                    2
                } else {
                    1
                }
            }
        };
        Ok(self.connector(id)?.current())
    }

    /// Looks up a device-level (non-connector, non-meter) parameter's
    /// current value by its wire JSON key, e.g. `"sVersion"`.
    pub fn device_param_value(&self, json_key: &str) -> Option<&ParamValue> {
        self.device_params
            .iter()
            .find(|p| p.spec.json_key == json_key)
            .and_then(Parameter::get)
    }

    /// Every parameter across the whole tree eligible for an automatic
    /// sensor manager, in traversal order.
    pub fn sensor_eligible_params(&self) -> Vec<&Parameter> {
        self.device_params
            .iter()
            .chain(self.connector_main.params.iter())
            .chain(self.connector_vice.params.iter())
            .chain(self.meter_info.params.iter())
            .filter(|p| p.wants_sensor_manager())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(action: &'static str, sn: &str, data: serde_json::Value) -> ParsedPayload {
        let mut data = data;
        data.as_object_mut()
            .unwrap()
            .insert("chargeBoxSN".to_string(), json!(sn));
        ParsedPayload {
            action,
            charge_box_sn: sn.to_string(),
            data,
        }
    }

    #[test]
    fn foreign_serial_is_dropped_silently() {
        let mut state = ChargerState::new("X".to_string());
        let msg = payload(
            "NWireToDics",
            "Y",
            json!({"NWireExist": true, "NWireClosed": false}),
        );
        let changes = state.update(&msg);
        assert!(changes.is_empty());
        assert!(!state.device_params[12].initialized());
    }

    #[test]
    fn matching_serial_updates_and_reports_changes() {
        let mut state = ChargerState::new("X".to_string());
        let msg = payload(
            "NWireToDics",
            "X",
            json!({"NWireExist": true, "NWireClosed": false}),
        );
        let changes = state.update(&msg);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].entity_name, "nwire_exists");
    }

    #[test]
    fn is_charging_true_when_either_connector_charging() {
        let mut state = ChargerState::new("X".to_string());
        let msg = payload(
            "SynchroStatus",
            "X",
            json!({
                "connectorMain": {"connectionStatus": true, "chargeStatus": "charging", "statusCode": 1, "startTime": "t", "endTime": "-", "reserveCurrent": 6},
                "connectorVice": {"connectionStatus": false, "chargeStatus": "idle", "statusCode": 0, "startTime": "-", "endTime": "-", "reserveCurrent": 0},
            }),
        );
        state.update(&msg);
        assert!(state.is_charging());
    }

    #[test]
    fn get_current_defaults_to_connector_one_when_idle() {
        let state = ChargerState::new("X".to_string());
        assert_eq!(state.get_current(None).unwrap(), None);
    }

    #[test]
    fn connector_range_check() {
        let state = ChargerState::new("X".to_string());
        assert!(state.connector(0).is_err());
        assert!(state.connector(3).is_err());
        assert!(state.connector(1).is_ok());
    }
}
