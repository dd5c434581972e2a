//! Runtime configuration (ambient stack): parses and validates the five
//! positional CLI arguments into typed, ready-to-use values. Unlike the
//! multi-inverter YAML config this is derived from, there is exactly one
//! charger and one MQTT broker per process, so there is no file to load.

use crate::options::Options;
use anyhow::{bail, Context, Result};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

pub struct BridgeConfig {
    pub serial: String,
    pub bind_ip: Ipv4Addr,
    /// 0 means let the OS choose an ephemeral port.
    pub bind_port: u16,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_password: String,
}

impl BridgeConfig {
    pub fn from_options(options: Options) -> Result<Self> {
        let bind_ip = if options.local_ip.eq_ignore_ascii_case("auto") {
            detect_local_ip()?
        } else {
            options
                .local_ip
                .parse()
                .with_context(|| format!("invalid local IP address {:?}", options.local_ip))?
        };

        let bind_port = if options.recv_port.eq_ignore_ascii_case("auto") {
            0
        } else {
            options
                .recv_port
                .parse()
                .with_context(|| format!("invalid receive port {:?}", options.recv_port))?
        };

        let (user, rest) = options
            .mqtt_server
            .split_once('@')
            .with_context(|| format!("MQTT server {:?} is not in user@host:port form", options.mqtt_server))?;
        let (host, port) = rest
            .split_once(':')
            .with_context(|| format!("MQTT server {:?} is missing a port", options.mqtt_server))?;
        let mqtt_port: u16 = port.parse().with_context(|| format!("invalid MQTT port {port:?}"))?;

        Ok(Self {
            serial: options.serial,
            bind_ip,
            bind_port,
            mqtt_host: host.to_string(),
            mqtt_port,
            mqtt_user: user.to_string(),
            mqtt_password: options.mqtt_password,
        })
    }
}

/// Resolves this machine's LAN-facing IPv4 address the same way the "auto"
/// mode of the original tooling did: connect a UDP socket toward an address
/// that needn't be reachable, then read back the local endpoint the kernel
/// routed through.
fn detect_local_ip() -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("binding ephemeral UDP socket for IP autodetection")?;
    socket
        .connect(("10.254.254.254", 1))
        .context("connecting autodetection probe socket")?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => bail!("local address autodetection resolved to an IPv6 address"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(local_ip: &str, recv_port: &str, mqtt_server: &str) -> Options {
        Options {
            serial: "SN123".to_string(),
            local_ip: local_ip.to_string(),
            recv_port: recv_port.to_string(),
            mqtt_server: mqtt_server.to_string(),
            mqtt_password: "hunter2".to_string(),
        }
    }

    #[test]
    fn parses_explicit_ip_and_port() {
        let config = BridgeConfig::from_options(options("192.168.1.5", "9000", "mqtt_user@broker.local:1883")).unwrap();
        assert_eq!(config.bind_ip, Ipv4Addr::new(192, 168, 1, 5));
        assert_eq!(config.bind_port, 9000);
        assert_eq!(config.mqtt_host, "broker.local");
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.mqtt_user, "mqtt_user");
    }

    #[test]
    fn auto_port_becomes_zero() {
        let config = BridgeConfig::from_options(options("192.168.1.5", "auto", "u@h:1")).unwrap();
        assert_eq!(config.bind_port, 0);
    }

    #[test]
    fn rejects_malformed_mqtt_server() {
        assert!(BridgeConfig::from_options(options("192.168.1.5", "1900", "no-at-sign")).is_err());
    }

    #[test]
    fn rejects_malformed_local_ip() {
        assert!(BridgeConfig::from_options(options("not-an-ip", "1900", "u@h:1")).is_err());
    }
}
