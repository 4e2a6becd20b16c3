//! Driver configuration snapshot (sni.toml plus SNI_* environment overrides).
//!
//! Read once when drivers are initialized; nothing reloads it afterwards.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SniError, SniResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub mock: MockConfig,
    #[serde(default)]
    pub retroarch: RetroArchConfig,
    #[serde(default)]
    pub luabridge: LuaBridgeConfig,
    #[serde(default)]
    pub connectorlib: ConnectorLibConfig,
    #[serde(default)]
    pub fxpakpro: FxPakProConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MockConfig {
    /// The mock driver is off unless explicitly enabled (default: false)
    #[serde(default)]
    pub enable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetroArchConfig {
    #[serde(default)]
    pub disable: bool,
    /// UDP `host:port` endpoints asked during detection
    #[serde(default = "default_retroarch_hosts")]
    pub hosts: Vec<String>,
    /// Log failed detection attempts at info instead of debug
    #[serde(default)]
    pub detect_log: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LuaBridgeConfig {
    #[serde(default)]
    pub disable: bool,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_luabridge_port")]
    pub listen_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorLibConfig {
    #[serde(default)]
    pub disable: bool,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_connectorlib_port")]
    pub listen_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FxPakProConfig {
    #[serde(default)]
    pub disable: bool,
    /// Serial ports to try; empty means the platform defaults
    #[serde(default)]
    pub ports: Vec<String>,
    /// Close the port after every operation so other tools can use the cart
    #[serde(default)]
    pub release_port: bool,
}

fn default_retroarch_hosts() -> Vec<String> {
    vec!["localhost:55355".to_string()]
}
fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}
fn default_luabridge_port() -> u16 {
    65398
}
fn default_connectorlib_port() -> u16 {
    43884
}

impl Default for RetroArchConfig {
    fn default() -> Self {
        Self {
            disable: false,
            hosts: default_retroarch_hosts(),
            detect_log: false,
        }
    }
}

impl Default for LuaBridgeConfig {
    fn default() -> Self {
        Self {
            disable: false,
            listen_host: default_listen_host(),
            listen_port: default_luabridge_port(),
        }
    }
}

impl Default for ConnectorLibConfig {
    fn default() -> Self {
        Self {
            disable: false,
            listen_host: default_listen_host(),
            listen_port: default_connectorlib_port(),
        }
    }
}

/// `host:port`, bracketing IPv6 literals so the port stays separable.
fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

impl LuaBridgeConfig {
    pub fn listen_addr(&self) -> String {
        join_host_port(&self.listen_host, self.listen_port)
    }
}

impl ConnectorLibConfig {
    pub fn listen_addr(&self) -> String {
        join_host_port(&self.listen_host, self.listen_port)
    }
}

impl Config {
    /// Parse a TOML document; absent sections and keys take their defaults.
    pub fn from_toml(content: &str) -> SniResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load `path` if given and present, otherwise defaults.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load(path: Option<&Path>) -> SniResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("config file {} not found; using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(SniError::Io(e)),
        }
    }

    /// Load `path`, then apply overrides from the process environment.
    pub fn load_with_env(path: Option<&Path>) -> SniResult<Self> {
        let mut config = Self::load(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `SNI_*` overrides looked up through `var`.
    ///
    /// Unparseable port values are logged and ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("SNI_MOCK_ENABLE") {
            self.mock.enable = is_truthy(&v);
        }

        if let Some(v) = var("SNI_RETROARCH_DISABLE") {
            self.retroarch.disable = is_truthy(&v);
        }
        if let Some(v) = var("SNI_RETROARCH_HOSTS") {
            self.retroarch.hosts = split_list(&v);
        }
        if let Some(v) = var("SNI_RETROARCH_DETECT_LOG") {
            self.retroarch.detect_log = is_truthy(&v);
        }

        if let Some(v) = var("SNI_LUABRIDGE_DISABLE") {
            self.luabridge.disable = is_truthy(&v);
        }
        if let Some(v) = var("SNI_LUABRIDGE_LISTEN_HOST") {
            self.luabridge.listen_host = v;
        }
        if let Some(port) = port_var(&var, "SNI_LUABRIDGE_LISTEN_PORT") {
            self.luabridge.listen_port = port;
        }

        if let Some(v) = var("SNI_CONNECTORLIB_DISABLE") {
            self.connectorlib.disable = is_truthy(&v);
        }
        if let Some(v) = var("SNI_CONNECTORLIB_LISTEN_HOST") {
            self.connectorlib.listen_host = v;
        }
        if let Some(port) = port_var(&var, "SNI_CONNECTORLIB_LISTEN_PORT") {
            self.connectorlib.listen_port = port;
        }

        if let Some(v) = var("SNI_FXPAKPRO_DISABLE") {
            self.fxpakpro.disable = is_truthy(&v);
        }
        if let Some(v) = var("SNI_FXPAKPRO_PORTS") {
            self.fxpakpro.ports = split_list(&v);
        }
    }
}

/// `1`, `true`, `yes` and `on` (any case) are true; everything else is false.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn port_var(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u16> {
    let value = var(key)?;
    match value.trim().parse() {
        Ok(port) => Some(port),
        Err(_) => {
            log::warn!("ignoring {}: '{}' is not a port number", key, value);
            None
        }
    }
}
