//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::net::IpAddr;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::alert::AlertDispatcher;
use crate::session::{LockRetry, SessionStore};
use crate::spot::{SpotInterruptMonitor, SpotMonitorConfig};
use crate::tunnel::TunnelEndpoint;
use crate::verify::VerifyRequest;

/// Tunnel and safety-net settings merged from defaults, `tether.toml`, and
/// `TETHER_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq)]
#[ortho_config(
    prefix = "TETHER",
    discovery(
        app_name = "tether",
        env_var = "TETHER_CONFIG_PATH",
        config_file_name = "tether.toml",
        dotfile_name = ".tether.toml",
        project_file_name = "tether.toml"
    )
)]
pub struct TetherConfig {
    /// Directory holding `session.json`, its lock, and runtime files.
    #[ortho_config(default = ".tether".to_owned())]
    pub state_dir: String,
    /// Local tunnel interface name.
    #[ortho_config(default = "wg-tether".to_owned())]
    pub interface_name: String,
    /// Local tunnel address in CIDR form.
    #[ortho_config(default = "10.66.0.1/24".to_owned())]
    pub tunnel_address: String,
    /// Address of the instance inside the tunnel.
    #[ortho_config(default = "10.66.0.2".to_owned())]
    pub peer_tunnel_address: String,
    /// Persistent keepalive interval in seconds.
    #[ortho_config(default = 25)]
    pub keepalive_seconds: u16,
    /// Handshakes older than this many seconds mark the tunnel degraded.
    #[ortho_config(default = 180)]
    pub max_handshake_age_secs: u64,
    /// Timeout of each reachability probe in milliseconds.
    #[ortho_config(default = 2000)]
    pub probe_timeout_ms: u64,
    /// Comma separated ports probed in order.
    #[ortho_config(default = "22,8000,8080,11434".to_owned())]
    pub probe_ports: String,
    /// Port serving `GET /health` on the instance.
    pub health_port: Option<u16>,
    /// Hours without a heartbeat before the deadman switch fires.
    #[ortho_config(default = 4)]
    pub deadman_timeout_hours: u32,
    /// Seconds between heartbeats.
    #[ortho_config(default = 60)]
    pub heartbeat_interval_secs: u64,
    /// Spend budget; `0` disables budget alerts.
    #[ortho_config(default = 0.0)]
    pub budget: f64,
    /// Webhook receiving alert JSON.
    pub webhook_url: Option<String>,
    /// Port of the spot interruption endpoint.
    #[ortho_config(default = 9876)]
    pub spot_port: u16,
    /// Seconds between spot interruption polls.
    #[ortho_config(default = 5)]
    pub spot_poll_interval_secs: u64,
    /// Consecutive failed polls treated as a lost instance.
    #[ortho_config(default = 3)]
    pub spot_failure_threshold: u32,
    /// Attempts to acquire the session lock.
    #[ortho_config(default = 20)]
    pub lock_retry_attempts: u32,
    /// Delay between lock attempts in milliseconds.
    #[ortho_config(default = 50)]
    pub lock_retry_delay_ms: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to tether.toml",
            self.description, self.env_var, self.toml_key
        ))
    }

    fn invalid(&self, detail: impl std::fmt::Display) -> ConfigError {
        ConfigError::Invalid(format!(
            "invalid {} ({detail}): fix {} or {} in tether.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

const INTERFACE_NAME: FieldMetadata =
    FieldMetadata::new("tunnel interface name", "TETHER_INTERFACE_NAME", "interface_name");
const STATE_DIR: FieldMetadata = FieldMetadata::new("state directory", "TETHER_STATE_DIR", "state_dir");
const TUNNEL_ADDRESS: FieldMetadata =
    FieldMetadata::new("tunnel address", "TETHER_TUNNEL_ADDRESS", "tunnel_address");
const PEER_ADDRESS: FieldMetadata = FieldMetadata::new(
    "peer tunnel address",
    "TETHER_PEER_TUNNEL_ADDRESS",
    "peer_tunnel_address",
);
const PROBE_PORTS: FieldMetadata = FieldMetadata::new("probe ports", "TETHER_PROBE_PORTS", "probe_ports");
const DEADMAN_TIMEOUT: FieldMetadata = FieldMetadata::new(
    "deadman timeout",
    "TETHER_DEADMAN_TIMEOUT_HOURS",
    "deadman_timeout_hours",
);
const HEARTBEAT_INTERVAL: FieldMetadata = FieldMetadata::new(
    "heartbeat interval",
    "TETHER_HEARTBEAT_INTERVAL_SECS",
    "heartbeat_interval_secs",
);
const BUDGET: FieldMetadata = FieldMetadata::new("budget", "TETHER_BUDGET", "budget");
const WEBHOOK_URL: FieldMetadata = FieldMetadata::new("webhook URL", "TETHER_WEBHOOK_URL", "webhook_url");
const SPOT_INTERVAL: FieldMetadata = FieldMetadata::new(
    "spot poll interval",
    "TETHER_SPOT_POLL_INTERVAL_SECS",
    "spot_poll_interval_secs",
);
const SPOT_THRESHOLD: FieldMetadata = FieldMetadata::new(
    "spot failure threshold",
    "TETHER_SPOT_FAILURE_THRESHOLD",
    "spot_failure_threshold",
);
const LOCK_ATTEMPTS: FieldMetadata = FieldMetadata::new(
    "lock retry attempts",
    "TETHER_LOCK_RETRY_ATTEMPTS",
    "lock_retry_attempts",
);

impl TetherConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("tether")]).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key to fix.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] or [`ConfigError::Invalid`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_dir.trim().is_empty() {
            return Err(STATE_DIR.missing());
        }
        if self.interface_name.trim().is_empty() {
            return Err(INTERFACE_NAME.missing());
        }
        if self.tunnel_address.trim().is_empty() {
            return Err(TUNNEL_ADDRESS.missing());
        }
        crate::tunnel::parse_cidr(&self.tunnel_address).map_err(|detail| TUNNEL_ADDRESS.invalid(detail))?;
        self.peer_address()?;
        self.parsed_probe_ports()?;
        if self.deadman_timeout_hours == 0 {
            return Err(DEADMAN_TIMEOUT.invalid("must be at least 1 hour"));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(HEARTBEAT_INTERVAL.invalid("must be at least 1 second"));
        }
        if !(self.budget.is_finite() && self.budget >= 0.0) {
            return Err(BUDGET.invalid("must be zero or a positive amount"));
        }
        if let Some(url) = &self.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(WEBHOOK_URL.invalid("must be an http or https URL"));
            }
        }
        if self.spot_poll_interval_secs == 0 {
            return Err(SPOT_INTERVAL.invalid("must be at least 1 second"));
        }
        if self.spot_failure_threshold == 0 {
            return Err(SPOT_THRESHOLD.invalid("must be at least 1"));
        }
        if self.lock_retry_attempts == 0 {
            return Err(LOCK_ATTEMPTS.invalid("must be at least 1"));
        }
        Ok(())
    }

    /// State directory as a path.
    #[must_use]
    pub fn state_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.state_dir)
    }

    /// Directory for key files and userspace helper state.
    #[must_use]
    pub fn run_dir(&self) -> Utf8PathBuf {
        self.state_path().join("run")
    }

    /// Lock retry policy for the session store.
    #[must_use]
    pub const fn lock_retry(&self) -> LockRetry {
        LockRetry {
            attempts: self.lock_retry_attempts,
            delay: Duration::from_millis(self.lock_retry_delay_ms),
        }
    }

    /// Session store rooted at the state directory.
    #[must_use]
    pub fn session_store(&self) -> SessionStore {
        SessionStore::with_lock_retry(self.state_path(), self.lock_retry())
    }

    /// Parsed peer tunnel address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the address does not parse.
    pub fn peer_address(&self) -> Result<IpAddr, ConfigError> {
        if self.peer_tunnel_address.trim().is_empty() {
            return Err(PEER_ADDRESS.missing());
        }
        self.peer_tunnel_address
            .trim()
            .parse()
            .map_err(|_| PEER_ADDRESS.invalid(&self.peer_tunnel_address))
    }

    /// Parsed probe port list.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when an entry is not a port number
    /// or the list is empty.
    pub fn parsed_probe_ports(&self) -> Result<Vec<u16>, ConfigError> {
        let ports = self
            .probe_ports
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.parse::<u16>() {
                Ok(port) if port > 0 => Ok(port),
                Ok(_) | Err(_) => Err(PROBE_PORTS.invalid(format!("{entry} is not a port"))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if ports.is_empty() {
            return Err(PROBE_PORTS.missing());
        }
        Ok(ports)
    }

    /// Builds a verification request for the configured tunnel.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn verify_request(&self) -> Result<VerifyRequest, ConfigError> {
        Ok(VerifyRequest {
            interface_name: self.interface_name.clone(),
            peer_address: self.peer_address()?,
            max_handshake_age: Duration::from_secs(self.max_handshake_age_secs),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            probe_ports: self.parsed_probe_ports()?,
            health_port: self.health_port,
        })
    }

    /// Spot monitor cadence. The per-request timeout is fixed at 3 s.
    #[must_use]
    pub fn spot_config(&self) -> SpotMonitorConfig {
        SpotMonitorConfig {
            interval: Duration::from_secs(self.spot_poll_interval_secs),
            failure_threshold: self.spot_failure_threshold,
            ..SpotMonitorConfig::default()
        }
    }

    /// Spot monitor polling the instance at `host` on the configured port.
    #[must_use]
    pub fn spot_monitor(&self, host: &str) -> SpotInterruptMonitor {
        SpotInterruptMonitor::http(host, self.spot_port, self.spot_config())
    }

    /// Heartbeat cadence.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Alert dispatcher with the configured webhook.
    #[must_use]
    pub fn alert_dispatcher(&self) -> AlertDispatcher {
        match &self.webhook_url {
            Some(url) => AlertDispatcher::new().with_webhook(url.clone()),
            None => AlertDispatcher::new(),
        }
    }

    /// Builds the local tunnel endpoint for an instance reachable at
    /// `peer_host`, using `listen_port` on the instance side.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the resulting endpoint is
    /// malformed.
    pub fn tunnel_endpoint(
        &self,
        private_key: &str,
        peer_public_key: &str,
        peer_host: &str,
        listen_port: u16,
    ) -> Result<TunnelEndpoint, ConfigError> {
        let host = if peer_host.contains(':') && !peer_host.starts_with('[') {
            format!("[{peer_host}]")
        } else {
            peer_host.to_owned()
        };
        TunnelEndpoint::builder()
            .interface_name(&self.interface_name)
            .local_address(&self.tunnel_address)
            .private_key(private_key)
            .peer_public_key(peer_public_key)
            .peer_endpoint(format!("{host}:{listen_port}"))
            .allowed_ip(format!("{}/32", self.peer_tunnel_address.trim()))
            .keepalive_seconds(self.keepalive_seconds)
            .build()
            .map_err(|err| ConfigError::Invalid(err.to_string()))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds an unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
