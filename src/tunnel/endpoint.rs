//! Tunnel endpoint description, runtime handle, and interface status.

use std::ffi::OsString;
use std::net::IpAddr;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};

use crate::command::{SpawnedProcess, args};
use crate::keys;

use super::TunnelError;

/// Linux limits interface names to 15 bytes.
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Parameters of one point-to-point tunnel.
#[derive(Clone, Eq, PartialEq)]
pub struct TunnelEndpoint {
    /// Local interface name (for example `wg-tether`).
    pub interface_name: String,
    /// Local tunnel address in CIDR form (for example `10.66.0.1/24`).
    pub local_address: String,
    /// Base64 private key of this side.
    pub private_key: String,
    /// Base64 public key of the peer.
    pub peer_public_key: String,
    /// Peer endpoint as `host:port`.
    pub peer_endpoint: String,
    /// Networks routed through the tunnel, in CIDR form.
    pub allowed_ips: Vec<String>,
    /// Persistent keepalive interval; `0` disables keepalives.
    pub keepalive_seconds: u16,
    /// Optional fixed UDP listen port.
    pub listen_port: Option<u16>,
}

impl std::fmt::Debug for TunnelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEndpoint")
            .field("interface_name", &self.interface_name)
            .field("local_address", &self.local_address)
            .field("private_key", &"[REDACTED]")
            .field("peer_public_key", &self.peer_public_key)
            .field("peer_endpoint", &self.peer_endpoint)
            .field("allowed_ips", &self.allowed_ips)
            .field("keepalive_seconds", &self.keepalive_seconds)
            .field("listen_port", &self.listen_port)
            .finish()
    }
}

impl TunnelEndpoint {
    /// Starts a builder for a [`TunnelEndpoint`].
    #[must_use]
    pub fn builder() -> TunnelEndpointBuilder {
        TunnelEndpointBuilder::default()
    }

    /// Validates every field.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::InvalidEndpoint`] naming the first bad field.
    pub fn validate(&self) -> Result<(), TunnelError> {
        validate_interface_name(&self.interface_name)?;
        parse_cidr(&self.local_address).map_err(|message| invalid("local_address", message))?;
        keys::validate(&self.private_key)
            .map_err(|err| invalid("private_key", err.to_string()))?;
        keys::validate(&self.peer_public_key)
            .map_err(|err| invalid("peer_public_key", err.to_string()))?;
        split_host_port(&self.peer_endpoint)
            .map_err(|message| invalid("peer_endpoint", message))?;
        if self.allowed_ips.is_empty() {
            return Err(invalid("allowed_ips", String::from("at least one network is required")));
        }
        for network in &self.allowed_ips {
            parse_cidr(network).map_err(|message| invalid("allowed_ips", message))?;
        }
        Ok(())
    }

    /// Local address without the prefix length.
    #[must_use]
    pub fn local_ip(&self) -> &str {
        self.local_address
            .split_once('/')
            .map_or(self.local_address.as_str(), |(ip, _)| ip)
    }

    /// Allowed networks joined the way `wg` expects them.
    #[must_use]
    pub fn allowed_ips_csv(&self) -> String {
        self.allowed_ips.join(",")
    }

    /// Arguments for `wg set` configuring `device` with this peer. The
    /// private key is passed by file path only.
    pub(crate) fn wg_set_args(&self, device: &str, key_path: &Utf8Path) -> Vec<OsString> {
        let mut out = args(["set", device, "private-key", key_path.as_str()]);
        if let Some(port) = self.listen_port {
            out.extend(args([String::from("listen-port"), port.to_string()]));
        }
        out.extend(args([
            "peer",
            self.peer_public_key.as_str(),
            "endpoint",
            self.peer_endpoint.as_str(),
        ]));
        out.extend(args([String::from("allowed-ips"), self.allowed_ips_csv()]));
        if self.keepalive_seconds > 0 {
            out.extend(args([
                String::from("persistent-keepalive"),
                self.keepalive_seconds.to_string(),
            ]));
        }
        out
    }
}

/// Builder for [`TunnelEndpoint`] that trims inputs and validates on build.
#[derive(Clone, Debug, Default)]
pub struct TunnelEndpointBuilder {
    interface_name: String,
    local_address: String,
    private_key: String,
    peer_public_key: String,
    peer_endpoint: String,
    allowed_ips: Vec<String>,
    keepalive_seconds: u16,
    listen_port: Option<u16>,
}

impl TunnelEndpointBuilder {
    /// Sets the interface name.
    #[must_use]
    pub fn interface_name(mut self, value: impl Into<String>) -> Self {
        self.interface_name = value.into();
        self
    }

    /// Sets the local CIDR address.
    #[must_use]
    pub fn local_address(mut self, value: impl Into<String>) -> Self {
        self.local_address = value.into();
        self
    }

    /// Sets the local private key.
    #[must_use]
    pub fn private_key(mut self, value: impl Into<String>) -> Self {
        self.private_key = value.into();
        self
    }

    /// Sets the peer public key.
    #[must_use]
    pub fn peer_public_key(mut self, value: impl Into<String>) -> Self {
        self.peer_public_key = value.into();
        self
    }

    /// Sets the peer `host:port`.
    #[must_use]
    pub fn peer_endpoint(mut self, value: impl Into<String>) -> Self {
        self.peer_endpoint = value.into();
        self
    }

    /// Adds a routed network.
    #[must_use]
    pub fn allowed_ip(mut self, value: impl Into<String>) -> Self {
        self.allowed_ips.push(value.into());
        self
    }

    /// Sets the keepalive interval in seconds.
    #[must_use]
    pub const fn keepalive_seconds(mut self, value: u16) -> Self {
        self.keepalive_seconds = value;
        self
    }

    /// Sets a fixed listen port.
    #[must_use]
    pub const fn listen_port(mut self, value: Option<u16>) -> Self {
        self.listen_port = value;
        self
    }

    /// Builds and validates the endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::InvalidEndpoint`] when a field is malformed.
    pub fn build(self) -> Result<TunnelEndpoint, TunnelError> {
        let endpoint = TunnelEndpoint {
            interface_name: self.interface_name.trim().to_owned(),
            local_address: self.local_address.trim().to_owned(),
            private_key: self.private_key.trim().to_owned(),
            peer_public_key: self.peer_public_key.trim().to_owned(),
            peer_endpoint: self.peer_endpoint.trim().to_owned(),
            allowed_ips: self
                .allowed_ips
                .iter()
                .map(|network| network.trim().to_owned())
                .collect(),
            keepalive_seconds: self.keepalive_seconds,
            listen_port: self.listen_port,
        };
        endpoint.validate()?;
        Ok(endpoint)
    }
}

/// Runtime handle of a configured interface.
///
/// Owned by the controller call that created it; only
/// [`super::TunnelController::teardown`] consumes it.
#[derive(Debug)]
pub struct TunnelHandle {
    /// Name requested by the caller.
    pub interface_name: String,
    /// Name the OS assigned (differs from `interface_name` for `utun`).
    pub system_name: String,
    pub(crate) helper: Option<SpawnedProcess>,
    pub(crate) routes: Vec<String>,
    pub(crate) socket_path: Option<Utf8PathBuf>,
    pub(crate) name_file: Option<Utf8PathBuf>,
}

impl TunnelHandle {
    pub(crate) fn kernel(interface_name: &str) -> Self {
        Self {
            interface_name: interface_name.to_owned(),
            system_name: interface_name.to_owned(),
            helper: None,
            routes: Vec::new(),
            socket_path: None,
            name_file: None,
        }
    }

    /// Returns `true` when a userspace helper keeps the interface alive.
    #[must_use]
    pub const fn has_helper(&self) -> bool {
        self.helper.is_some()
    }
}

/// Read-only snapshot of an interface and its single peer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TunnelStatus {
    /// Configured peer public key, if a peer exists.
    pub peer_public_key: Option<String>,
    /// Last known peer endpoint.
    pub peer_endpoint: Option<String>,
    /// Most recent handshake; `None` when no handshake has happened.
    pub last_handshake: Option<DateTime<Utc>>,
    /// Bytes received from the peer.
    pub rx_bytes: u64,
    /// Bytes sent to the peer.
    pub tx_bytes: u64,
}

/// Parses `wg show <iface> dump` output.
///
/// The first line describes the interface; the first peer line (if any)
/// provides the peer fields.
///
/// # Errors
///
/// Returns [`TunnelError::Parse`] when a peer line is truncated or numeric
/// fields are malformed.
pub fn parse_dump(output: &str) -> Result<TunnelStatus, TunnelError> {
    let mut lines = output.lines().filter(|line| !line.trim().is_empty());
    if lines.next().is_none() {
        return Err(TunnelError::Parse(String::from("empty wg dump")));
    }
    let Some(peer_line) = lines.next() else {
        return Ok(TunnelStatus::default());
    };

    let fields: Vec<&str> = peer_line.split('\t').collect();
    let [public_key, _psk, endpoint, _allowed, handshake, rx, tx, ..] = fields.as_slice() else {
        return Err(TunnelError::Parse(format!(
            "peer line has {} fields, expected at least 7",
            fields.len()
        )));
    };

    let handshake_secs: i64 = parse_number(handshake, "latest-handshake")?;
    let last_handshake = if handshake_secs == 0 {
        None
    } else {
        DateTime::<Utc>::from_timestamp(handshake_secs, 0)
    };

    Ok(TunnelStatus {
        peer_public_key: Some((*public_key).to_owned()),
        peer_endpoint: (*endpoint != "(none)").then(|| (*endpoint).to_owned()),
        last_handshake,
        rx_bytes: parse_number(rx, "transfer-rx")?,
        tx_bytes: parse_number(tx, "transfer-tx")?,
    })
}

fn parse_number<T: std::str::FromStr>(raw: &str, field: &str) -> Result<T, TunnelError> {
    raw.trim()
        .parse()
        .map_err(|_| TunnelError::Parse(format!("{field} is not a number: {raw}")))
}

fn invalid(field: &str, message: String) -> TunnelError {
    TunnelError::InvalidEndpoint {
        field: field.to_owned(),
        message,
    }
}

fn validate_interface_name(name: &str) -> Result<(), TunnelError> {
    if name.is_empty() {
        return Err(invalid("interface_name", String::from("must not be empty")));
    }
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(invalid(
            "interface_name",
            format!("must be at most {MAX_INTERFACE_NAME_LEN} bytes"),
        ));
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '=' | '+' | '.' | '-'))
    {
        return Err(invalid(
            "interface_name",
            String::from("may only contain letters, digits, and _=+.-"),
        ));
    }
    Ok(())
}

/// Parses `address/prefix`, checking the prefix against the address family.
pub(crate) fn parse_cidr(value: &str) -> Result<(IpAddr, u8), String> {
    let (address, prefix) = value
        .split_once('/')
        .ok_or_else(|| format!("{value} is missing a /prefix"))?;
    let ip: IpAddr = address
        .parse()
        .map_err(|_| format!("{address} is not an IP address"))?;
    let bits: u8 = prefix
        .parse()
        .map_err(|_| format!("{prefix} is not a prefix length"))?;
    let max = if ip.is_ipv4() { 32 } else { 128 };
    if bits > max {
        return Err(format!("prefix /{bits} exceeds /{max}"));
    }
    Ok((ip, bits))
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub(crate) fn split_host_port(value: &str) -> Result<(&str, u16), String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("{value} is missing a :port"))?;
    let trimmed_host = host.trim_start_matches('[').trim_end_matches(']');
    if trimmed_host.is_empty() {
        return Err(format!("{value} is missing a host"));
    }
    let parsed_port: u16 = port
        .parse()
        .map_err(|_| format!("{port} is not a valid port"))?;
    if parsed_port == 0 {
        return Err(String::from("port must be non-zero"));
    }
    Ok((trimmed_host, parsed_port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate;
    use rstest::rstest;

    fn builder() -> TunnelEndpointBuilder {
        let local = generate();
        let peer = generate();
        TunnelEndpoint::builder()
            .interface_name("wg-tether")
            .local_address("10.66.0.1/24")
            .private_key(local.private_key())
            .peer_public_key(peer.public_key())
            .peer_endpoint("203.0.113.7:51820")
            .allowed_ip("10.66.0.2/32")
            .keepalive_seconds(25)
    }

    #[test]
    fn builder_trims_and_validates() {
        let endpoint = builder()
            .interface_name("  wg-tether ")
            .build()
            .expect("endpoint should build");
        assert_eq!(endpoint.interface_name, "wg-tether");
        assert_eq!(endpoint.local_ip(), "10.66.0.1");
    }

    #[rstest]
    #[case::empty_name(builder().interface_name(""), "interface_name")]
    #[case::long_name(builder().interface_name("a-very-long-interface"), "interface_name")]
    #[case::bad_cidr(builder().local_address("10.66.0.1"), "local_address")]
    #[case::bad_prefix(builder().local_address("10.66.0.1/33"), "local_address")]
    #[case::bad_key(builder().peer_public_key("nope"), "peer_public_key")]
    #[case::no_port(builder().peer_endpoint("203.0.113.7"), "peer_endpoint")]
    #[case::bad_allowed(builder().allowed_ip("bogus"), "allowed_ips")]
    fn builder_rejects_invalid_fields(
        #[case] candidate: TunnelEndpointBuilder,
        #[case] expected_field: &str,
    ) {
        let err = candidate.build().expect_err("endpoint should be rejected");
        let TunnelError::InvalidEndpoint { field, .. } = err else {
            panic!("expected InvalidEndpoint, got {err:?}");
        };
        assert_eq!(field, expected_field);
    }

    #[test]
    fn split_host_port_accepts_bracketed_ipv6() {
        let (host, port) = split_host_port("[2001:db8::1]:51820").expect("split");
        assert_eq!(host, "2001:db8::1");
        assert_eq!(port, 51820);
    }

    #[test]
    fn debug_redacts_private_key() {
        let endpoint = builder().build().expect("endpoint");
        let rendered = format!("{endpoint:?}");
        assert!(!rendered.contains(&endpoint.private_key));
    }

    #[test]
    fn parse_dump_reads_peer_fields() {
        let dump = crate::test_support::wg_dump("cGVlcg==", "203.0.113.7:51820", 1_700_000_000, 10, 20);
        let status = parse_dump(&dump).expect("parse");
        assert_eq!(status.peer_public_key.as_deref(), Some("cGVlcg=="));
        assert_eq!(status.peer_endpoint.as_deref(), Some("203.0.113.7:51820"));
        assert_eq!(
            status.last_handshake.map(|ts| ts.timestamp()),
            Some(1_700_000_000)
        );
        assert_eq!((status.rx_bytes, status.tx_bytes), (10, 20));
    }

    #[test]
    fn parse_dump_maps_zero_handshake_to_none() {
        let dump = crate::test_support::wg_dump("cGVlcg==", "(none)", 0, 0, 0);
        let status = parse_dump(&dump).expect("parse");
        assert_eq!(status.last_handshake, None);
        assert_eq!(status.peer_endpoint, None);
    }

    #[test]
    fn parse_dump_without_peer_is_empty_status() {
        let status = parse_dump("cHJpdmF0ZQ==\tcHVibGlj\t51820\toff\n").expect("parse");
        assert_eq!(status, TunnelStatus::default());
    }

    #[test]
    fn parse_dump_rejects_truncated_peer_line() {
        let err = parse_dump("iface\nonly\ttwo\n").expect_err("truncated");
        assert!(matches!(err, TunnelError::Parse(_)));
    }
}
