//! Configuration for regsyncd
//!
//! Loaded once at startup and immutable for the process lifetime.
//! Defaults can be overridden by an optional TOML file (`--config`) and
//! then by environment variables, which keep the variable names the
//! deployment has always used (ASTERISK_HOST, GENESYS_SIP_HOST,
//! DN_RANGE_START, ...).

use crate::driver::RemotePeer;
use crate::error::{RegsyncError, Result};
use crate::types::{Dn, MonitorScope};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Local switch management channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsteriskConfig {
    /// Management interface host.
    #[serde(default = "default_asterisk_host")]
    pub host: String,

    /// Management interface port.
    #[serde(default = "default_ami_port")]
    pub ami_port: u16,

    /// Management username.
    #[serde(default = "default_ami_user")]
    pub ami_user: String,

    /// Management secret.
    #[serde(default = "default_ami_secret")]
    pub ami_secret: String,
}

/// Remote call-routing peer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesysConfig {
    /// Remote SIP server host.
    #[serde(default = "default_genesys_host")]
    pub host: String,

    /// Remote SIP server port.
    #[serde(default = "default_genesys_port")]
    pub port: u16,

    /// PJSIP transport name used by synthesized registrations.
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Outbound auth password; when set, synthesized registrations carry
    /// an auth section.
    #[serde(default)]
    pub auth_password: Option<String>,
}

/// Monitored DN scope: an inclusive range, or an explicit list which takes
/// precedence when non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// First DN of the monitored range.
    #[serde(default = "default_dn_range_start")]
    pub dn_range_start: u32,

    /// Last DN of the monitored range (inclusive).
    #[serde(default = "default_dn_range_end")]
    pub dn_range_end: u32,

    /// Explicit DN allow-list; overrides the range when non-empty.
    #[serde(default)]
    pub dn_list: Vec<String>,
}

/// Status/metrics HTTP endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Whether to serve the status endpoint at all.
    #[serde(default = "default_status_enabled")]
    pub enabled: bool,

    /// Bind address for the status server.
    #[serde(default = "default_status_bind")]
    pub bind: String,
}

/// Engine timing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bound on any single management action, in seconds.
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
}

/// Complete regsyncd configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegsyncConfig {
    /// Local switch settings.
    #[serde(default)]
    pub asterisk: AsteriskConfig,

    /// Remote peer settings.
    #[serde(default)]
    pub genesys: GenesysConfig,

    /// Monitored DN scope.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Status endpoint settings.
    #[serde(default)]
    pub status: StatusConfig,

    /// Engine timing settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Log verbosity (tracing env-filter syntax or a plain level name).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_asterisk_host() -> String {
    "webrtc-asterisk".to_string()
}

fn default_ami_port() -> u16 {
    5038
}

fn default_ami_user() -> String {
    "admin".to_string()
}

fn default_ami_secret() -> String {
    "admin123".to_string()
}

fn default_genesys_host() -> String {
    "192.168.210.81".to_string()
}

fn default_genesys_port() -> u16 {
    5060
}

fn default_transport() -> String {
    "transport-udp".to_string()
}

fn default_dn_range_start() -> u32 {
    5001
}

fn default_dn_range_end() -> u32 {
    5020
}

fn default_status_enabled() -> bool {
    true
}

fn default_status_bind() -> String {
    "0.0.0.0:8088".to_string()
}

fn default_action_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AsteriskConfig {
    fn default() -> Self {
        Self {
            host: default_asterisk_host(),
            ami_port: default_ami_port(),
            ami_user: default_ami_user(),
            ami_secret: default_ami_secret(),
        }
    }
}

impl Default for GenesysConfig {
    fn default() -> Self {
        Self {
            host: default_genesys_host(),
            port: default_genesys_port(),
            transport: default_transport(),
            auth_password: None,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            dn_range_start: default_dn_range_start(),
            dn_range_end: default_dn_range_end(),
            dn_list: Vec::new(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: default_status_enabled(),
            bind: default_status_bind(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            action_timeout_secs: default_action_timeout(),
        }
    }
}

impl Default for RegsyncConfig {
    fn default() -> Self {
        Self {
            asterisk: AsteriskConfig::default(),
            genesys: GenesysConfig::default(),
            monitor: MonitorConfig::default(),
            status: StatusConfig::default(),
            engine: EngineConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl RegsyncConfig {
    /// Load configuration: defaults, then the optional TOML file, then
    /// environment variables. Validates before returning.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    RegsyncError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                toml::from_str(&text).map_err(|e| {
                    RegsyncError::Config(format!("cannot parse {}: {}", path.display(), e))
                })?
            }
            None => Self::default(),
        };
        config.apply_env_from(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document (defaults fill missing fields).
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| RegsyncError::Config(format!("cannot parse config: {}", e)))
    }

    /// Apply environment overrides from an arbitrary lookup.
    pub fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(name: &str, value: String) -> Result<T> {
            value
                .parse()
                .map_err(|_| RegsyncError::Config(format!("invalid {}: '{}'", name, value)))
        }

        if let Some(v) = get("ASTERISK_HOST") {
            self.asterisk.host = v;
        }
        if let Some(v) = get("ASTERISK_AMI_PORT") {
            self.asterisk.ami_port = parse("ASTERISK_AMI_PORT", v)?;
        }
        if let Some(v) = get("ASTERISK_AMI_USER") {
            self.asterisk.ami_user = v;
        }
        if let Some(v) = get("ASTERISK_AMI_SECRET") {
            self.asterisk.ami_secret = v;
        }
        if let Some(v) = get("GENESYS_SIP_HOST") {
            self.genesys.host = v;
        }
        if let Some(v) = get("GENESYS_SIP_PORT") {
            self.genesys.port = parse("GENESYS_SIP_PORT", v)?;
        }
        if let Some(v) = get("GENESYS_SIP_TRANSPORT") {
            self.genesys.transport = v;
        }
        if let Some(v) = get("GENESYS_AUTH_PASSWORD") {
            self.genesys.auth_password = Some(v);
        }
        if let Some(v) = get("DN_RANGE_START") {
            self.monitor.dn_range_start = parse("DN_RANGE_START", v)?;
        }
        if let Some(v) = get("DN_RANGE_END") {
            self.monitor.dn_range_end = parse("DN_RANGE_END", v)?;
        }
        if let Some(v) = get("DN_LIST") {
            self.monitor.dn_list = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = get("STATUS_BIND") {
            self.status.bind = v;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }

    /// Validate the loaded configuration.
    pub fn validate(&self) -> Result<()> {
        let scope = self.scope();
        if scope.is_empty() {
            return Err(RegsyncError::Config(
                "monitored DN scope is empty".to_string(),
            ));
        }
        if self.monitor.dn_list.is_empty() && self.monitor.dn_range_end < self.monitor.dn_range_start
        {
            return Err(RegsyncError::Config(format!(
                "inverted DN range {}-{}",
                self.monitor.dn_range_start, self.monitor.dn_range_end
            )));
        }
        if self.status.enabled {
            self.status_bind()?;
        }
        if self.engine.action_timeout_secs == 0 {
            return Err(RegsyncError::Config(
                "action_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The monitored DN scope. An explicit list takes precedence.
    pub fn scope(&self) -> MonitorScope {
        if self.monitor.dn_list.is_empty() {
            MonitorScope::Range {
                start: self.monitor.dn_range_start,
                end: self.monitor.dn_range_end,
            }
        } else {
            MonitorScope::List(self.monitor.dn_list.iter().map(Dn::new).collect())
        }
    }

    /// Remote peer parameters for the registration driver.
    pub fn remote_peer(&self) -> RemotePeer {
        RemotePeer {
            host: self.genesys.host.clone(),
            port: self.genesys.port,
            transport: self.genesys.transport.clone(),
            auth_password: self.genesys.auth_password.clone(),
        }
    }

    /// Bound on any single management action.
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.action_timeout_secs)
    }

    /// Parsed status server bind address.
    pub fn status_bind(&self) -> Result<SocketAddr> {
        self.status
            .bind
            .parse()
            .map_err(|_| RegsyncError::Config(format!("invalid status bind '{}'", self.status.bind)))
    }
}
