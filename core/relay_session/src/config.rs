//! Device configuration
//!
//! Loaded from a JSON file:
//!
//! ```json
//! {
//!   "upstream": { "host": "relay.example.net", "port": 17040 },
//!   "account": { "username": "alice", "password": "secret", "device": "pi" },
//!   "tunnels": [ { "cloud": "alice", "device": "nas", "port_local": 2222, "port_remote": 22 } ],
//!   "allowed": [ 22 ],
//!   "timers": { "connect_retry_ms": 2000, "pairing_poll_ms": 5000 }
//! }
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::codec::MAX_ID_LEN;
use crate::error::ConfigError;
use crate::scheduler::{CONNECT_RETRY_INTERVAL, PAIRING_POLL_INTERVAL};
use crate::session::{Credentials, SessionSettings};
use crate::tunnels::{Tunnel, TunnelTable};

/// Default relay port
pub const DEFAULT_RELAY_PORT: u16 = 17040;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub account: AccountConfig,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
    /// Local ports peers may open tunnels to
    #[serde(default)]
    pub allowed: Vec<u16>,
    #[serde(default)]
    pub timers: TimerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// SNI name when it differs from `host`
    #[serde(default)]
    pub server_name: Option<String>,
    /// Accept any server certificate
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Clone, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    pub password: String,
    pub device: String,
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("device", &self.device)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TunnelConfig {
    pub cloud: String,
    pub device: String,
    pub port_local: u16,
    pub port_remote: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub connect_retry_ms: u64,
    pub pairing_poll_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        TimerConfig {
            connect_retry_ms: CONNECT_RETRY_INTERVAL.as_millis() as u64,
            pairing_poll_ms: PAIRING_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_RELAY_PORT
}

/// Which side(s) of a tunnel this device plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Only dials out through configured tunnels
    Client,
    /// Only accepts peers on allowed ports
    Server,
    Hybrid,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Client => "client",
            Mode::Server => "server",
            Mode::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

impl Config {
    /// Read, parse and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&text)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.host.is_empty() {
            return Err(ConfigError::Missing("upstream.host"));
        }
        if self.upstream.port == 0 {
            return Err(ConfigError::ZeroPort("upstream.port"));
        }
        check_id("account.username", &self.account.username)?;
        check_id("account.password", &self.account.password)?;
        check_id("account.device", &self.account.device)?;

        if self.tunnels.is_empty() && self.allowed.is_empty() {
            return Err(ConfigError::NothingToDo);
        }
        for (index, t) in self.tunnels.iter().enumerate() {
            let reason = if t.cloud.is_empty() {
                Some("cloud is empty")
            } else if t.device.is_empty() {
                Some("device is empty")
            } else if t.cloud.len() > MAX_ID_LEN || t.device.len() > MAX_ID_LEN {
                Some("identifier too long")
            } else if t.port_local == 0 || t.port_remote == 0 {
                Some("ports must be non-zero")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(ConfigError::InvalidTunnel { index, reason });
            }
        }
        if self.allowed.contains(&0) {
            return Err(ConfigError::ZeroPort("allowed"));
        }

        if self.timers.connect_retry_ms == 0 {
            return Err(ConfigError::ZeroInterval("connect_retry_ms"));
        }
        if self.timers.pairing_poll_ms == 0 {
            return Err(ConfigError::ZeroInterval("pairing_poll_ms"));
        }
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        match (self.tunnels.is_empty(), self.allowed.is_empty()) {
            (false, true) => Mode::Client,
            (true, false) => Mode::Server,
            _ => Mode::Hybrid,
        }
    }

    /// TLS server name for the relay
    pub fn server_name(&self) -> &str {
        self.upstream
            .server_name
            .as_deref()
            .unwrap_or(&self.upstream.host)
    }

    pub fn session_settings(&self) -> SessionSettings {
        let credentials = Credentials {
            username: self.account.username.clone(),
            password: self.account.password.clone(),
            device: self.account.device.clone(),
        };
        let mut settings =
            SessionSettings::new(&self.upstream.host, self.upstream.port, credentials);
        settings.connect_retry = Duration::from_millis(self.timers.connect_retry_ms);
        settings.pairing_poll = Duration::from_millis(self.timers.pairing_poll_ms);
        settings
    }

    pub fn tunnel_table(&self) -> TunnelTable {
        let tunnels = self
            .tunnels
            .iter()
            .map(|t| Tunnel::new(&t.cloud, &t.device, t.port_local, t.port_remote))
            .collect();
        TunnelTable::new(tunnels, self.allowed.clone())
    }
}

fn check_id(name: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() || value.len() > MAX_ID_LEN {
        return Err(ConfigError::Missing(name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "upstream": { "host": "relay.test" },
        "account": { "username": "alice", "password": "pw", "device": "pi" },
        "tunnels": [ { "cloud": "alice", "device": "nas", "port_local": 2222, "port_remote": 22 } ]
    }"#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_json(SAMPLE).unwrap();
        assert_eq!(config.upstream.port, DEFAULT_RELAY_PORT);
        assert!(!config.upstream.insecure);
        assert_eq!(config.server_name(), "relay.test");
        assert_eq!(config.timers.connect_retry_ms, 2000);
        assert_eq!(config.timers.pairing_poll_ms, 5000);
        assert_eq!(config.mode(), Mode::Client);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        let table = config.tunnel_table();
        assert_eq!(table.tunnels().len(), 1);
        assert_eq!(table.tunnels()[0].local_port, 2222);
        assert_eq!(table.tunnels()[0].remote_port, 22);

        let settings = config.session_settings();
        assert_eq!(settings.credentials.device, "pi");
        assert_eq!(settings.pairing_poll, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_mode_from_lists() {
        let server = r#"{
            "upstream": { "host": "relay.test", "port": 9000 },
            "account": { "username": "alice", "password": "pw", "device": "pi" },
            "allowed": [ 22, 80 ]
        }"#;
        let config = Config::from_json(server).unwrap();
        assert_eq!(config.mode(), Mode::Server);
        assert_eq!(config.upstream.port, 9000);

        let mut hybrid = config.clone();
        hybrid.tunnels.push(TunnelConfig {
            cloud: "bob".into(),
            device: "laptop".into(),
            port_local: 8080,
            port_remote: 80,
        });
        assert_eq!(hybrid.mode(), Mode::Hybrid);
    }

    #[test]
    fn test_validation_failures() {
        let nothing = r#"{
            "upstream": { "host": "relay.test" },
            "account": { "username": "alice", "password": "pw", "device": "pi" }
        }"#;
        assert!(matches!(
            Config::from_json(nothing),
            Err(ConfigError::NothingToDo)
        ));

        let no_device = r#"{
            "upstream": { "host": "relay.test" },
            "account": { "username": "alice", "password": "pw", "device": "" },
            "allowed": [ 22 ]
        }"#;
        assert!(matches!(
            Config::from_json(no_device),
            Err(ConfigError::Missing("account.device"))
        ));

        let zero_port = r#"{
            "upstream": { "host": "relay.test" },
            "account": { "username": "alice", "password": "pw", "device": "pi" },
            "tunnels": [ { "cloud": "alice", "device": "nas", "port_local": 0, "port_remote": 22 } ]
        }"#;
        assert!(matches!(
            Config::from_json(zero_port),
            Err(ConfigError::InvalidTunnel { index: 0, .. })
        ));

        let zero_timer = r#"{
            "upstream": { "host": "relay.test" },
            "account": { "username": "alice", "password": "pw", "device": "pi" },
            "allowed": [ 22 ],
            "timers": { "pairing_poll_ms": 0 }
        }"#;
        assert!(matches!(
            Config::from_json(zero_timer),
            Err(ConfigError::ZeroInterval("pairing_poll_ms"))
        ));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            Config::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_password_not_in_debug() {
        let config = Config::from_json(SAMPLE).unwrap();
        let text = format!("{:?}", config);
        assert!(!text.contains("\"pw\""));
        assert!(text.contains("<redacted>"));
    }
}
