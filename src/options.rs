use clap::{error::ErrorKind, Parser};

/// S-Charge Bridge - bridges a single S-Charge EVCD2 wall box to MQTT/Home Assistant
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Charger serial number (chargeBoxSN)
    pub serial: String,

    /// This machine's IP address for the charger to connect back to, or "auto" to detect it
    pub local_ip: String,

    /// WebSocket listen port, or "auto" to let the OS choose one
    pub recv_port: String,

    /// MQTT broker, as user@host:port
    pub mqtt_server: String,

    /// MQTT broker password
    pub mqtt_password: String,
}

impl Options {
    /// Parses the five positional arguments. Fewer than five (or otherwise
    /// malformed) arguments print a usage line to stderr and exit with code
    /// 1, rather than clap's default exit code of 2 for this case.
    pub fn new() -> Self {
        match Self::try_parse() {
            Ok(options) => options,
            Err(e) => {
                let _ = e.print();
                match e.kind() {
                    ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => std::process::exit(0),
                    _ => std::process::exit(1),
                }
            }
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
