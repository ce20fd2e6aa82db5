//! Serialisable session record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version written by this build.
pub const CURRENT_VERSION: u32 = 1;

/// Durable record of the active rental in one working directory.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SessionState {
    /// Schema version; `0` means "unset" and is replaced on save.
    #[serde(default)]
    pub version: u32,
    /// Rented instance, once provisioning succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<Instance>,
    /// Model being served on the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<Model>,
    /// Tunnel peer identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<Tunnel>,
    /// Billing clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Cost>,
    /// Deadman switch configuration and last heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadman: Option<Deadman>,
}

/// Marketplace instance backing the session.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Instance {
    /// Provider specific instance identifier.
    pub id: String,
    /// Marketplace name (for example `vast` or `lambda`).
    pub provider: String,
    /// GPU model.
    pub gpu: String,
    /// Provider region.
    pub region: String,
    /// Provider instance type or offer name.
    #[serde(rename = "type")]
    pub instance_type: String,
    /// Public address used as the tunnel endpoint host.
    pub public_ip: String,
    /// Address of the instance inside the tunnel.
    pub tunnel_ip: String,
    /// When the instance was provisioned.
    pub created_at: DateTime<Utc>,
}

/// Model deployment state on the instance.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Model {
    /// Model name.
    pub name: String,
    /// Free-form status reported by the bootstrap script.
    pub status: String,
}

/// Peer identity of the tunnel to the instance.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Tunnel {
    /// Base64 public key of the instance.
    pub peer_public_key: String,
    /// Local interface name carrying the tunnel.
    pub interface_name: String,
}

/// Billing state.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Cost {
    /// Price per hour in `currency`.
    pub hourly_rate: f64,
    /// Cost accumulated so far in `currency`.
    pub accumulated: f64,
    /// ISO currency code.
    pub currency: String,
}

/// Deadman switch sub-record.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Deadman {
    /// Hours without a heartbeat before the instance is terminated.
    pub timeout_hours: u32,
    /// Last time the owning process proved it was alive.
    pub last_heartbeat: DateTime<Utc>,
}

impl SessionState {
    /// Builds a new session for a freshly provisioned instance.
    #[must_use]
    pub const fn for_instance(instance: Instance) -> Self {
        Self {
            version: CURRENT_VERSION,
            instance: Some(instance),
            model: None,
            tunnel: None,
            cost: None,
            deadman: None,
        }
    }

    /// Identifier of the rented instance, if any.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        self.instance.as_ref().map(|instance| instance.id.as_str())
    }
}
