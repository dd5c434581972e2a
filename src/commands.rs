//! Command API (C5): `send_authorize`, `start_charging`, `stop_charging`
//! with confirmation and convergence retry.
//!
//! The charger may ack a command without actually converging — it is an
//! embedded controller reacting to relays and contactors — so verifying
//! state after the ack is the only way to know the command took effect.

use crate::codec;
use crate::session::Session;
use log::debug;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const T_CONF: Duration = Duration::from_millis(5000);
const CONVERGENCE_RETRY_SPACING: Duration = Duration::from_secs(3);
const MAX_RETRIES: u32 = 5;
const INIT_WAIT_STEP: Duration = Duration::from_secs(1);
const INIT_WAIT_RETRIES: u32 = 5;

/// `send_authorize(current, purpose, connectorId)`: guard rails, then
/// correlate-and-await. Returns `(result, reason)`.
pub async fn send_authorize(
    session: &Arc<Session>,
    current: i64,
    purpose: &str,
    connector_id: u8,
) -> (bool, String) {
    if !session.is_connected() {
        return (false, "not connected".to_string());
    }
    if !session.initialized() {
        return (false, "charger state not initialized".to_string());
    }
    if !(1..=2).contains(&connector_id) {
        return (
            false,
            format!("invalid connector ID {connector_id} (expected within range of [1, 2])"),
        );
    }

    let unique_id_millis = codec::unix_millis(SystemTime::now());
    let (text, unique_id) = codec::encode_authorize(
        unique_id_millis,
        session.user_id,
        &session.charge_box_sn,
        purpose,
        current,
        connector_id,
    );

    match session.correlated_send(unique_id, text, T_CONF).await {
        Ok(result) => (result, "response received".to_string()),
        Err(_) => (false, "response timed out".to_string()),
    }
}

async fn wait_for_current_initialized(session: &Arc<Session>, connector_id: u8) -> bool {
    for _ in 0..INIT_WAIT_RETRIES {
        let has_current = session
            .charger_state
            .lock()
            .unwrap()
            .connector(connector_id)
            .ok()
            .and_then(|c| c.current())
            .is_some();
        if has_current {
            return true;
        }
        debug!("Waiting for charger state initialization.");
        tokio::time::sleep(INIT_WAIT_STEP).await;
    }
    false
}

/// `start_charging(current, connectorId, tolerance=1.0)`: up to 5 retries,
/// 3s apart.
pub async fn start_charging(session: &Arc<Session>, current: i64, connector_id: u8, tolerance: f64) -> bool {
    if !wait_for_current_initialized(session, connector_id).await {
        return false;
    }

    for attempt in 0..MAX_RETRIES {
        debug!("Sending start charging command at {current}A.");
        let (result, reason) = send_authorize(session, current, "Start", connector_id).await;
        debug!("{result} {reason}");

        let measured = session
            .charger_state
            .lock()
            .unwrap()
            .connector(connector_id)
            .ok()
            .and_then(|c| c.current());

        let converged = measured.map(|m| (m - current as f64).abs() <= tolerance).unwrap_or(false);
        if converged {
            return true;
        }

        debug!(
            "The charge current does not match the desired ({measured:?} != {current}A). Tries: {}/{MAX_RETRIES}.",
            attempt + 1
        );
        if attempt + 1 == MAX_RETRIES {
            return false;
        }
        tokio::time::sleep(CONVERGENCE_RETRY_SPACING).await;
    }
    false
}

/// `stop_charging(connectorId)`: identical retry skeleton. Uses the
/// connector's reported `miniCurrent` and `purpose = "Stop"`. Converges when
/// `chargeStatus == "finish"`.
pub async fn stop_charging(session: &Arc<Session>, connector_id: u8) -> bool {
    if !wait_for_current_initialized(session, connector_id).await {
        return false;
    }

    for attempt in 0..MAX_RETRIES {
        let mini_current = session
            .charger_state
            .lock()
            .unwrap()
            .connector(connector_id)
            .ok()
            .and_then(|c| c.mini_current())
            .unwrap_or(0);

        debug!("Sending stop charging command.");
        let (result, reason) = send_authorize(session, mini_current, "Stop", connector_id).await;
        debug!("{result} {reason}");

        let finished = session
            .charger_state
            .lock()
            .unwrap()
            .connector(connector_id)
            .ok()
            .and_then(|c| c.charge_status().map(str::to_string))
            .as_deref()
            == Some("finish");

        if finished {
            return true;
        }

        debug!(
            "The charge status does not match the desired (!= finish). Tries: {}/{MAX_RETRIES}.",
            attempt + 1
        );
        if attempt + 1 == MAX_RETRIES {
            return false;
        }
        tokio::time::sleep(CONVERGENCE_RETRY_SPACING).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_authorize_rejects_invalid_connector_before_touching_the_wire() {
        let session = Arc::new(Session::new("X".to_string()));
        let (result, reason) = send_authorize(&session, 8, "Start", 9).await;
        assert!(!result);
        assert!(reason.contains("invalid connector ID"));
    }

    #[tokio::test]
    async fn send_authorize_requires_connection() {
        let session = Arc::new(Session::new("X".to_string()));
        let (result, reason) = send_authorize(&session, 8, "Start", 1).await;
        assert!(!result);
        assert_eq!(reason, "not connected");
    }
}
