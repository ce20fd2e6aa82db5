//! Tunnel configuration artefacts.
//!
//! Renders the INI-style configuration consumed by `wg-quick` on either side
//! of the tunnel and the cloud-init `write_files` entry that installs the
//! remote side during instance bootstrap.

use std::fmt::Write as _;

use crate::keys;

use super::TunnelError;
use super::endpoint::{TunnelEndpoint, parse_cidr};

/// Remote side of the tunnel, which listens and never dials out.
#[derive(Clone, Eq, PartialEq)]
pub struct ServerConfig {
    /// Interface name on the remote host; names the config file.
    pub interface_name: String,
    /// Remote tunnel address in CIDR form.
    pub address: String,
    /// Base64 private key of the remote side.
    pub private_key: String,
    /// UDP port the remote side listens on.
    pub listen_port: u16,
    /// Base64 public key of the local side.
    pub peer_public_key: String,
    /// Networks accepted from the local side.
    pub allowed_ips: Vec<String>,
    /// Keepalive interval; `0` omits the setting.
    pub keepalive_seconds: u16,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("interface_name", &self.interface_name)
            .field("address", &self.address)
            .field("private_key", &"[REDACTED]")
            .field("listen_port", &self.listen_port)
            .field("peer_public_key", &self.peer_public_key)
            .field("allowed_ips", &self.allowed_ips)
            .field("keepalive_seconds", &self.keepalive_seconds)
            .finish()
    }
}

impl ServerConfig {
    /// Validates keys and addresses.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::InvalidEndpoint`] naming the first bad field.
    pub fn validate(&self) -> Result<(), TunnelError> {
        let invalid = |field: &str, message: String| TunnelError::InvalidEndpoint {
            field: field.to_owned(),
            message,
        };
        if self.interface_name.trim().is_empty() {
            return Err(invalid("interface_name", String::from("must not be empty")));
        }
        parse_cidr(&self.address).map_err(|message| invalid("address", message))?;
        keys::validate(&self.private_key).map_err(|err| invalid("private_key", err.to_string()))?;
        keys::validate(&self.peer_public_key)
            .map_err(|err| invalid("peer_public_key", err.to_string()))?;
        if self.listen_port == 0 {
            return Err(invalid("listen_port", String::from("must be non-zero")));
        }
        for network in &self.allowed_ips {
            parse_cidr(network).map_err(|message| invalid("allowed_ips", message))?;
        }
        Ok(())
    }
}

/// Renders the local side's configuration.
#[must_use]
pub fn client_config(endpoint: &TunnelEndpoint) -> String {
    let mut out = interface_section(&endpoint.private_key, &endpoint.local_address, endpoint.listen_port);
    out.push_str("\n[Peer]\n");
    push_kv(&mut out, "PublicKey", &endpoint.peer_public_key);
    push_kv(&mut out, "Endpoint", &endpoint.peer_endpoint);
    push_peer_tail(&mut out, &endpoint.allowed_ips, endpoint.keepalive_seconds);
    out
}

/// Renders the remote side's configuration.
///
/// # Errors
///
/// Returns [`TunnelError::InvalidEndpoint`] when `config` does not validate.
pub fn server_config(config: &ServerConfig) -> Result<String, TunnelError> {
    config.validate()?;
    let mut out = interface_section(&config.private_key, &config.address, Some(config.listen_port));
    out.push_str("\n[Peer]\n");
    push_kv(&mut out, "PublicKey", &config.peer_public_key);
    push_peer_tail(&mut out, &config.allowed_ips, config.keepalive_seconds);
    Ok(out)
}

/// Renders the remote configuration as a cloud-init `write_files` entry.
///
/// # Errors
///
/// Returns [`TunnelError::InvalidEndpoint`] when `config` does not validate.
pub fn cloud_init_write_files(config: &ServerConfig) -> Result<String, TunnelError> {
    let rendered = server_config(config)?;
    let mut out = String::from("write_files:\n");
    push_line(&mut out, format_args!("  - path: /etc/wireguard/{}.conf", config.interface_name));
    out.push_str("    owner: root:root\n");
    out.push_str("    permissions: '0600'\n");
    out.push_str("    content: |\n");
    for line in rendered.lines() {
        if line.is_empty() {
            out.push('\n');
        } else {
            push_line(&mut out, format_args!("      {line}"));
        }
    }
    Ok(out)
}

fn interface_section(private_key: &str, address: &str, listen_port: Option<u16>) -> String {
    let mut out = String::from("[Interface]\n");
    push_kv(&mut out, "PrivateKey", private_key);
    push_kv(&mut out, "Address", address);
    if let Some(port) = listen_port {
        push_kv(&mut out, "ListenPort", &port.to_string());
    }
    out
}

fn push_peer_tail(out: &mut String, allowed_ips: &[String], keepalive_seconds: u16) {
    push_kv(out, "AllowedIPs", &allowed_ips.join(", "));
    if keepalive_seconds > 0 {
        push_kv(out, "PersistentKeepalive", &keepalive_seconds.to_string());
    }
}

fn push_kv(out: &mut String, key: &str, value: &str) {
    push_line(out, format_args!("{key} = {value}"));
}

fn push_line(out: &mut String, line: std::fmt::Arguments<'_>) {
    // Writing into a `String` cannot fail.
    writeln!(out, "{line}").ok();
}
