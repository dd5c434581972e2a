//! Wire codec (C1): compact JSON envelope encode/decode with per-action
//! schema validation.

use crate::file_error;
use anyhow::{anyhow, bail, Result};
use serde_json::{json, Map, Value};

/// A schema field type as declared by an action's payload template. The
/// wire-level type (what the charger actually sends) is not always the same
/// as the parameter's final value kind — `SynchroData`'s numeric fields are
/// sent as quoted strings, coerced to float later by the parameter model.
#[derive(Clone, Copy)]
pub enum SchemaType {
    Int,
    Bool,
    Str,
    Obj(&'static [(&'static str, SchemaType)]),
}

const DEVICE_DATA_CONNECTOR: &[(&str, SchemaType)] = &[
    ("miniCurrent", SchemaType::Int),
    ("maxCurrent", SchemaType::Int),
    ("connectorStatus", SchemaType::Int),
    ("lockStatus", SchemaType::Bool),
    ("PncStatus", SchemaType::Bool),
];

const DEVICE_DATA_SCHEMA: &[(&str, SchemaType)] = &[
    ("chargeBoxSN", SchemaType::Str),
    ("connectorMain", SchemaType::Obj(DEVICE_DATA_CONNECTOR)),
    ("connectorVice", SchemaType::Obj(DEVICE_DATA_CONNECTOR)),
    ("sVersion", SchemaType::Str),
    ("hVersion", SchemaType::Str),
    ("loadbalance", SchemaType::Int),
    ("chargeTimes", SchemaType::Int),
    ("cumulativeTime", SchemaType::Int),
    ("totalPower", SchemaType::Int),
    ("rssi", SchemaType::Int),
    ("evseType", SchemaType::Str),
    ("connectorNumber", SchemaType::Int),
    ("evsePhase", SchemaType::Str),
    ("isHasLock", SchemaType::Bool),
    ("isHasMeter", SchemaType::Bool),
];

const SYNCHRO_STATUS_CONNECTOR: &[(&str, SchemaType)] = &[
    ("connectionStatus", SchemaType::Bool),
    ("chargeStatus", SchemaType::Str),
    ("statusCode", SchemaType::Int),
    ("startTime", SchemaType::Str),
    ("endTime", SchemaType::Str),
    ("reserveCurrent", SchemaType::Int),
];

const SYNCHRO_STATUS_SCHEMA: &[(&str, SchemaType)] = &[
    ("chargeBoxSN", SchemaType::Str),
    ("connectorMain", SchemaType::Obj(SYNCHRO_STATUS_CONNECTOR)),
    ("connectorVice", SchemaType::Obj(SYNCHRO_STATUS_CONNECTOR)),
];

const SYNCHRO_DATA_CONNECTOR: &[(&str, SchemaType)] = &[
    ("voltage", SchemaType::Str),
    ("current", SchemaType::Str),
    ("power", SchemaType::Str),
    ("electricWork", SchemaType::Str),
    ("chargingTime", SchemaType::Str),
];

const SYNCHRO_DATA_METER: &[(&str, SchemaType)] = &[
    ("voltage", SchemaType::Str),
    ("current", SchemaType::Str),
    ("power", SchemaType::Str),
];

const SYNCHRO_DATA_SCHEMA: &[(&str, SchemaType)] = &[
    ("chargeBoxSN", SchemaType::Str),
    ("connectorMain", SchemaType::Obj(SYNCHRO_DATA_CONNECTOR)),
    ("connectorVice", SchemaType::Obj(SYNCHRO_DATA_CONNECTOR)),
    ("meterInfo", SchemaType::Obj(SYNCHRO_DATA_METER)),
];

const NWIRE_TO_DICS_SCHEMA: &[(&str, SchemaType)] = &[
    ("chargeBoxSN", SchemaType::Str),
    ("NWireExist", SchemaType::Bool),
    ("NWireClosed", SchemaType::Bool),
];

fn schema_for_action(action: &str) -> Option<&'static [(&'static str, SchemaType)]> {
    match action {
        "DeviceData" => Some(DEVICE_DATA_SCHEMA),
        "SynchroStatus" => Some(SYNCHRO_STATUS_SCHEMA),
        "SynchroData" => Some(SYNCHRO_DATA_SCHEMA),
        "NWireToDics" => Some(NWIRE_TO_DICS_SCHEMA),
        _ => None,
    }
}

/// Validates `payload` against `schema`, returning a copy of the object
/// containing only (and exactly) the declared keys. A schema violation is a
/// hard parse failure naming the offending key and observed type, matching
/// the source's `parse_template`.
fn validate(payload: &Value, schema: &[(&str, SchemaType)]) -> Result<Map<String, Value>> {
    let object = payload
        .as_object()
        .ok_or_else(|| file_error!("expected a JSON object, got {payload}"))?;

    let mut out = Map::new();
    for (key, expected) in schema {
        let value = object
            .get(*key)
            .ok_or_else(|| file_error!("missing key {key:?} in payload {payload}"))?;

        let validated = match expected {
            SchemaType::Int => {
                if !value.is_i64() && !value.is_u64() {
                    bail!(file_error!(
                        "key {key:?} has wrong type {value:?}, expected int"
                    ));
                }
                value.clone()
            }
            SchemaType::Bool => {
                if !value.is_boolean() {
                    bail!(file_error!(
                        "key {key:?} has wrong type {value:?}, expected bool"
                    ));
                }
                value.clone()
            }
            SchemaType::Str => {
                if !value.is_string() {
                    bail!(file_error!(
                        "key {key:?} has wrong type {value:?}, expected string"
                    ));
                }
                value.clone()
            }
            SchemaType::Obj(nested) => Value::Object(validate(value, nested)?),
        };
        out.insert((*key).to_string(), validated);
    }
    Ok(out)
}

/// A decoded, schema-validated action payload ready for the parameter model.
#[derive(Debug, Clone)]
pub struct ParsedPayload {
    pub action: &'static str,
    pub charge_box_sn: String,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub enum Decoded {
    /// An acknowledgement from the charger resolving a pending confirmation.
    Ack { unique_id: String, result: bool },
    /// A validated action payload.
    Payload(ParsedPayload),
    /// Recognized envelope but an action this bridge does not know; the
    /// source treats this as `None` and upper layers ignore it.
    Unknown,
}

/// Decodes one inbound WebSocket text frame.
pub fn decode_inbound(raw: &str) -> Result<Decoded> {
    let value: Value = serde_json::from_str(raw)?;

    let message_type_id = value
        .get("messageTypeId")
        .and_then(Value::as_str)
        .ok_or_else(|| file_error!("missing messageTypeId in {raw}"))?;

    match message_type_id {
        "6" => {
            let unique_id = value
                .get("uniqueId")
                .and_then(Value::as_str)
                .ok_or_else(|| file_error!("missing uniqueId in ack {raw}"))?
                .to_string();
            let result = value
                .get("payload")
                .and_then(|p| p.get("result"))
                .and_then(Value::as_bool)
                .ok_or_else(|| file_error!("missing payload.result in ack {raw}"))?;
            Ok(Decoded::Ack { unique_id, result })
        }
        "5" => {
            let action = value.get("action").and_then(Value::as_str).unwrap_or("");
            let Some(schema) = schema_for_action(action) else {
                return Ok(Decoded::Unknown);
            };
            let payload = value
                .get("payload")
                .ok_or_else(|| file_error!("missing payload in {raw}"))?;
            let data = validate(payload, schema)?;
            let charge_box_sn = data
                .get("chargeBoxSN")
                .and_then(Value::as_str)
                .ok_or_else(|| file_error!("validated payload missing chargeBoxSN"))?
                .to_string();

            // `action` strings above are 'static literals matched exactly;
            // re-resolve the canonical 'static form for ParsedPayload.
            let action: &'static str = match action {
                "DeviceData" => "DeviceData",
                "SynchroStatus" => "SynchroStatus",
                "SynchroData" => "SynchroData",
                "NWireToDics" => "NWireToDics",
                _ => unreachable!("schema_for_action already filtered unknown actions"),
            };

            Ok(Decoded::Payload(ParsedPayload {
                action,
                charge_box_sn,
                data: Value::Object(data),
            }))
        }
        other => Err(anyhow!(file_error!("unknown messageTypeId {other:?}"))),
    }
}

/// Milliseconds since epoch, used as the monotonic `uniqueId` source for
/// every outbound request-carrying envelope.
pub fn unix_millis(now: std::time::SystemTime) -> u128 {
    now.duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

pub fn encode_udp_handshake(timeout_unix_millis: u128, charge_box_sn: &str, ip: &str, port: u16) -> String {
    let raw = json!({
        "messageTypeId": "5",
        "uniqueId": timeout_unix_millis.to_string(),
        "action": "UDPHandShake",
        "payload": {
            "label": "APP",
            "chargeBoxSN": charge_box_sn,
            "iPAddress": format!("{ip}:{port}"),
        }
    });
    serde_json::to_string(&raw).expect("json serialization of a json! literal cannot fail")
}

/// Builds a `HandShake` envelope from an already-formatted `currentTime`
/// string, so the caller decides whether to honor the source's local-time
/// wire bug or emit true UTC (see spec.md open question 1 / DESIGN.md).
pub fn encode_handshake_raw(
    unique_id: &str,
    current_time: &str,
    user_id: u32,
    charge_box_sn: &str,
    connection_key: &str,
) -> String {
    let raw = json!({
        "messageTypeId": "5",
        "uniqueId": unique_id,
        "action": "HandShake",
        "payload": {
            "userId": user_id,
            "chargeBoxSN": charge_box_sn,
            "currentTime": current_time,
            "connectionKey": connection_key,
        }
    });
    serde_json::to_string(&raw).expect("json serialization of a json! literal cannot fail")
}

pub fn encode_ack(charge_box_sn: &str, unique_id: &str) -> String {
    let raw = json!({
        "messageTypeId": "6",
        "uniqueId": unique_id,
        "payload": {
            "chargeBoxSN": charge_box_sn,
        }
    });
    serde_json::to_string(&raw).expect("json serialization of a json! literal cannot fail")
}

pub fn encode_authorize(
    unique_id_millis: u128,
    user_id: u32,
    charge_box_sn: &str,
    purpose: &str,
    current: i64,
    connector_id: u8,
) -> (String, String) {
    let unique_id = unique_id_millis.to_string();
    let raw = json!({
        "messageTypeId": "5",
        "uniqueId": unique_id,
        "action": "Authorize",
        "payload": {
            "userId": user_id,
            "chargeBoxSN": charge_box_sn,
            "purpose": purpose,
            "current": current,
            "connectorId": connector_id,
        }
    });
    (
        serde_json::to_string(&raw).expect("json serialization of a json! literal cannot fail"),
        unique_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_valid_nwire_payload() {
        let raw = r#"{"messageTypeId":"5","uniqueId":"42","action":"NWireToDics","payload":{"chargeBoxSN":"X","NWireExist":true,"NWireClosed":false}}"#;
        match decode_inbound(raw).unwrap() {
            Decoded::Payload(p) => {
                assert_eq!(p.action, "NWireToDics");
                assert_eq!(p.charge_box_sn, "X");
                assert_eq!(p.data["NWireExist"], Value::Bool(true));
            }
            other => panic!("expected Payload, got {other:?}"),
        }
    }

    #[test]
    fn rejects_type_mismatch() {
        let raw = r#"{"messageTypeId":"5","uniqueId":"42","action":"NWireToDics","payload":{"chargeBoxSN":"X","NWireExist":"true","NWireClosed":false}}"#;
        assert!(decode_inbound(raw).is_err());
    }

    #[test]
    fn rejects_missing_key() {
        let raw = r#"{"messageTypeId":"5","uniqueId":"42","action":"NWireToDics","payload":{"chargeBoxSN":"X","NWireExist":true}}"#;
        assert!(decode_inbound(raw).is_err());
    }

    #[test]
    fn unknown_action_is_ignored_not_errored() {
        let raw = r#"{"messageTypeId":"5","uniqueId":"42","action":"SomethingElse","payload":{}}"#;
        matches!(decode_inbound(raw).unwrap(), Decoded::Unknown);
    }

    #[test]
    fn decodes_ack() {
        let raw = r#"{"messageTypeId":"6","uniqueId":"42","payload":{"chargeBoxSN":"X","result":true}}"#;
        match decode_inbound(raw).unwrap() {
            Decoded::Ack { unique_id, result } => {
                assert_eq!(unique_id, "42");
                assert!(result);
            }
            other => panic!("expected Ack, got {other:?}"),
        }
    }

    #[test]
    fn encode_ack_stringifies_charge_box_sn() {
        let encoded = encode_ack("X", "42");
        assert_eq!(
            encoded,
            r#"{"messageTypeId":"6","payload":{"chargeBoxSN":"X"},"uniqueId":"42"}"#
        );
    }
}
