//! Typed, self-describing scalar parameters (C2).
//!
//! A [`Parameter`] is a value slot that knows which inbound action populates
//! it, where inside that action's payload to look, and how to coerce and
//! transform the raw JSON value. It never destroys its value once set; it
//! only reports whether an update actually changed it so the owner can
//! decide whether to fire a change notification.

use crate::codec::ParsedPayload;
use serde_json::Value;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Float,
    Bool,
    Str,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Str(v) => write!(f, "{v}"),
        }
    }
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// Static descriptor for one parameter. One of these exists per field per
/// connector/aggregate, shared by every charger instance (there is only one
/// per process, but keeping the descriptor `'static` means the runtime
/// `Parameter` only needs to own the current value).
pub struct ParamSpec {
    pub human_name: &'static str,
    /// MQTT entity name fragment, e.g. "connector_main/minimal_current".
    pub entity_name: &'static str,
    pub source_action: &'static str,
    pub json_key: &'static str,
    pub unit: &'static str,
    /// Home Assistant device_class, or "" if this parameter carries none.
    pub device_class: &'static str,
    pub kind: ValueKind,
    pub transform: Option<fn(ParamValue) -> ParamValue>,
}

/// A parameter bound to a live value. `scope` names the sub-object in the
/// parsed payload this parameter reads from (e.g. `Some("connectorMain")`),
/// or `None` for device-level fields that read the payload root directly.
pub struct Parameter {
    pub spec: &'static ParamSpec,
    pub scope: Option<&'static str>,
    value: Option<ParamValue>,
}

impl Parameter {
    pub fn new(spec: &'static ParamSpec, scope: Option<&'static str>) -> Self {
        Self {
            spec,
            scope,
            value: None,
        }
    }

    pub fn initialized(&self) -> bool {
        self.value.is_some()
    }

    pub fn get(&self) -> Option<&ParamValue> {
        self.value.as_ref()
    }

    /// Applies `payload` to this parameter if it matches the descriptor's
    /// source action and the payload carries this parameter's key. Returns
    /// `Some(new_value)` only when the stored value changed or was
    /// populated for the first time, signaling that a change notification
    /// should be emitted.
    pub fn update(&mut self, payload: &ParsedPayload) -> Option<ParamValue> {
        if payload.action != self.spec.source_action {
            return None;
        }

        let object = match self.scope {
            Some(key) => payload.data.get(key)?,
            None => &payload.data,
        };

        let raw = object.get(self.spec.json_key)?;
        let mut coerced = coerce(raw, self.spec.kind)?;
        if let Some(transform) = self.spec.transform {
            coerced = transform(coerced);
        }

        let changed = self.value.as_ref() != Some(&coerced);
        self.value = Some(coerced.clone());
        if changed {
            Some(coerced)
        } else {
            None
        }
    }

    /// `"{name}: {value}{unit}"` padded to `width`, mirroring the source's
    /// `__format__` convention used for debug dumps of charger state.
    pub fn format_padded(&self, width: usize) -> String {
        let value = self
            .value
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "None".to_string());
        let line = format!("{}: {}{}", self.spec.human_name, value, self.spec.unit);
        format!("{line:<width$}")
    }

    /// True if the value kind is numeric and a device-class tag is present;
    /// only such parameters are eligible for an automatic sensor manager
    /// (spec's `register_mqtt`). Non-numeric or untagged parameters are not
    /// wired up by default.
    pub fn wants_sensor_manager(&self) -> bool {
        matches!(self.spec.kind, ValueKind::Int | ValueKind::Float) && !self.spec.device_class.is_empty()
    }
}

fn coerce(raw: &Value, kind: ValueKind) -> Option<ParamValue> {
    match kind {
        ValueKind::Int => match raw {
            Value::Number(n) => n.as_i64().map(ParamValue::Int),
            Value::String(s) => s.parse::<i64>().ok().map(ParamValue::Int),
            _ => None,
        },
        ValueKind::Float => match raw {
            Value::Number(n) => n.as_f64().map(ParamValue::Float),
            Value::String(s) => s.parse::<f64>().ok().map(ParamValue::Float),
            _ => None,
        },
        ValueKind::Bool => raw.as_bool().map(ParamValue::Bool),
        ValueKind::Str => raw.as_str().map(|s| ParamValue::Str(s.to_string())),
    }
}

/// `cumulativeTime` arrives in milliseconds; the device reports hours.
pub fn ms_to_hours(v: ParamValue) -> ParamValue {
    match v {
        ParamValue::Int(ms) => ParamValue::Float(ms as f64 / (1000.0 * 3600.0)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ParsedPayload;
    use serde_json::json;

    const MINI_CURRENT: ParamSpec = ParamSpec {
        human_name: "Minimal Current",
        entity_name: "connector_main/minimal_current",
        source_action: "DeviceData",
        json_key: "miniCurrent",
        unit: "A",
        device_class: "current",
        kind: ValueKind::Int,
        transform: None,
    };

    fn payload(action: &'static str, data: Value) -> ParsedPayload {
        ParsedPayload {
            action,
            charge_box_sn: "X".to_string(),
            data,
        }
    }

    #[test]
    fn first_update_initializes_and_reports_change() {
        let mut p = Parameter::new(&MINI_CURRENT, Some("connectorMain"));
        assert!(!p.initialized());

        let msg = payload(
            "DeviceData",
            json!({"connectorMain": {"miniCurrent": 6}}),
        );
        let changed = p.update(&msg);
        assert_eq!(changed, Some(ParamValue::Int(6)));
        assert!(p.initialized());
    }

    #[test]
    fn repeat_update_with_same_value_reports_no_change() {
        let mut p = Parameter::new(&MINI_CURRENT, Some("connectorMain"));
        let msg = payload("DeviceData", json!({"connectorMain": {"miniCurrent": 6}}));
        p.update(&msg);
        let changed = p.update(&msg);
        assert_eq!(changed, None);
    }

    #[test]
    fn mismatched_action_is_ignored() {
        let mut p = Parameter::new(&MINI_CURRENT, Some("connectorMain"));
        let msg = payload("SynchroStatus", json!({"connectorMain": {"miniCurrent": 6}}));
        assert_eq!(p.update(&msg), None);
        assert!(!p.initialized());
    }

    #[test]
    fn ms_to_hours_transform() {
        assert_eq!(ms_to_hours(ParamValue::Int(3_600_000)), ParamValue::Float(1.0));
    }

    #[test]
    fn string_encoded_number_coerces_to_float() {
        const VOLTAGE: ParamSpec = ParamSpec {
            human_name: "Voltage",
            entity_name: "connector_main/charge_voltage",
            source_action: "SynchroData",
            json_key: "voltage",
            unit: "V",
            device_class: "voltage",
            kind: ValueKind::Float,
            transform: None,
        };
        let mut p = Parameter::new(&VOLTAGE, Some("connectorMain"));
        let msg = payload("SynchroData", json!({"connectorMain": {"voltage": "405.92"}}));
        assert_eq!(p.update(&msg), Some(ParamValue::Float(405.92)));
    }
}
