//! Connection verification.
//!
//! A single pass inspects the tunnel's handshake state, checks that the peer
//! answers over TCP through a [`Reachability`] strategy, and optionally
//! checks an HTTP health endpoint. The outcome is one of
//! four [`ConnectionState`]s plus a human readable explanation.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::{JoinError, spawn_blocking};
use tokio::time::{Instant, sleep, sleep_until, timeout, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::tunnel::{TunnelController, TunnelError, TunnelStatus};

/// Ports probed when none are configured.
pub const DEFAULT_PROBE_PORTS: [u16; 4] = [22, 8000, 8080, 11434];

/// Lower bound applied to the polling interval of
/// [`ConnectionVerifier::wait_until_connected`].
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Health of the tunnel as observed by one verification pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// The interface does not exist.
    Disconnected,
    /// The interface exists but no handshake has completed.
    Connecting,
    /// A handshake happened but is stale or the peer is unreachable.
    Degraded,
    /// Recent handshake and the peer answers on at least one port.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Degraded => "degraded",
            Self::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// Inputs of a verification pass.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerifyRequest {
    /// Interface to inspect.
    pub interface_name: String,
    /// Peer address inside the tunnel.
    pub peer_address: IpAddr,
    /// Handshakes older than this mark the tunnel degraded.
    pub max_handshake_age: Duration,
    /// Timeout of each TCP or HTTP probe.
    pub probe_timeout: Duration,
    /// Ports tried in order; the first reachable one wins.
    pub probe_ports: Vec<u16>,
    /// Optional port serving `GET /health`.
    pub health_port: Option<u16>,
}

impl VerifyRequest {
    /// Creates a request with default probe ports, a 180 s handshake age,
    /// and a 2 s probe timeout.
    #[must_use]
    pub fn new(interface_name: impl Into<String>, peer_address: IpAddr) -> Self {
        Self {
            interface_name: interface_name.into(),
            peer_address,
            max_handshake_age: Duration::from_secs(180),
            probe_timeout: Duration::from_secs(2),
            probe_ports: DEFAULT_PROBE_PORTS.to_vec(),
            health_port: None,
        }
    }
}

/// Outcome of one verification pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationReport {
    /// Classified state.
    pub state: ConnectionState,
    /// Explanation suitable for operators.
    pub explanation: String,
    /// Raw interface status when the interface exists.
    pub status: Option<TunnelStatus>,
    /// First port that answered the TCP probe.
    pub reachable_port: Option<u16>,
    /// Result of the health probe, when one was configured and attempted.
    pub service_healthy: Option<bool>,
}

impl VerificationReport {
    fn new(state: ConnectionState, explanation: impl Into<String>) -> Self {
        Self {
            state,
            explanation: explanation.into(),
            status: None,
            reachable_port: None,
            service_healthy: None,
        }
    }
}

/// Errors raised by verification.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The deadline passed before the tunnel connected.
    #[error("tunnel did not connect in time: {}", .0.explanation)]
    Timeout(Box<VerificationReport>),
    /// Waiting was cancelled.
    #[error("verification cancelled: {}", .0.explanation)]
    Cancelled(Box<VerificationReport>),
    /// Reading the tunnel status failed.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    /// The blocking status read panicked or was aborted.
    #[error("tunnel status task failed: {0}")]
    StatusTask(#[from] JoinError),
}

impl VerifyError {
    /// Last report observed before a timeout or cancellation.
    #[must_use]
    pub fn last_report(&self) -> Option<&VerificationReport> {
        match self {
            Self::Timeout(report) | Self::Cancelled(report) => Some(report),
            Self::Tunnel(_) | Self::StatusTask(_) => None,
        }
    }
}

/// Boxed future returned by [`Reachability::is_reachable`].
pub type ReachabilityFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Decides whether the peer answers on one TCP port.
pub trait Reachability: Send + Sync {
    /// Resolves to `true` when something at `addr` answered within
    /// `timeout`.
    fn is_reachable(&self, addr: SocketAddr, timeout: Duration) -> ReachabilityFuture<'_>;
}

/// Opens a TCP connection to the peer.
///
/// A refused connection still counts: the reset came back through the
/// tunnel, so the peer is up even if nothing listens on that port.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpReachability;

impl Reachability for TcpReachability {
    fn is_reachable(&self, addr: SocketAddr, limit: Duration) -> ReachabilityFuture<'_> {
        Box::pin(async move {
            match timeout(limit, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => true,
                Ok(Err(err)) if err.kind() == io::ErrorKind::ConnectionRefused => true,
                Ok(Err(err)) => {
                    tracing::debug!(%addr, error = %err, "connection attempt failed");
                    false
                }
                Err(_) => {
                    tracing::debug!(%addr, "connection attempt timed out");
                    false
                }
            }
        })
    }
}

/// Classifies tunnel health using a [`TunnelController`].
#[derive(Debug)]
pub struct ConnectionVerifier<C, P = TcpReachability> {
    controller: Arc<C>,
    reachability: P,
    http: reqwest::Client,
}

impl<C> ConnectionVerifier<C, TcpReachability> {
    /// Creates a verifier reading status through `controller` and checking
    /// the peer over TCP.
    #[must_use]
    pub fn new(controller: C) -> Self {
        Self::with_reachability(controller, TcpReachability)
    }
}

impl<C, P> ConnectionVerifier<C, P> {
    /// Creates a verifier with a custom peer reachability strategy.
    #[must_use]
    pub fn with_reachability(controller: C, reachability: P) -> Self {
        Self {
            controller: Arc::new(controller),
            reachability,
            http: reqwest::Client::new(),
        }
    }
}

impl<C, P> ConnectionVerifier<C, P>
where
    C: TunnelController + 'static,
    P: Reachability,
{
    /// Runs a single verification pass.
    ///
    /// The status read shells out to OS tools, so it runs on the blocking
    /// pool.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Tunnel`] when the status read fails for a
    /// reason other than a missing interface.
    pub async fn verify_once(&self, request: &VerifyRequest) -> Result<VerificationReport, VerifyError> {
        let controller = Arc::clone(&self.controller);
        let interface_name = request.interface_name.clone();
        let read = spawn_blocking(move || controller.status(&interface_name)).await?;
        let status = match read {
            Ok(status) => status,
            Err(TunnelError::InterfaceNotFound { name }) => {
                return Ok(VerificationReport::new(
                    ConnectionState::Disconnected,
                    format!(
                        "interface {name} does not exist: no tunnel has been created yet, \
                         or it was torn down"
                    ),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        let Some(last_handshake) = status.last_handshake else {
            let mut report = VerificationReport::new(
                ConnectionState::Connecting,
                "no handshake yet: endpoint unreachable, peer not running, or key mismatch",
            );
            report.status = Some(status);
            return Ok(report);
        };

        let age = Utc::now().signed_duration_since(last_handshake);
        let max_age = TimeDelta::from_std(request.max_handshake_age).unwrap_or(TimeDelta::MAX);
        if age > max_age {
            let mut report = VerificationReport::new(
                ConnectionState::Degraded,
                format!(
                    "last handshake was {}s ago: network interruption or remote restart",
                    age.num_seconds()
                ),
            );
            report.status = Some(status);
            return Ok(report);
        }

        let Some(port) = self.first_reachable_port(request).await else {
            let mut report = VerificationReport::new(
                ConnectionState::Degraded,
                format!(
                    "handshake is recent but {} does not answer on ports {:?}: \
                     services on the peer are down or filtered",
                    request.peer_address, request.probe_ports
                ),
            );
            report.status = Some(status);
            return Ok(report);
        };

        let mut report = VerificationReport::new(
            ConnectionState::Connected,
            format!("peer {} reachable on port {port}", request.peer_address),
        );
        report.status = Some(status);
        report.reachable_port = Some(port);
        if let Some(health_port) = request.health_port {
            report.service_healthy = Some(self.check_health(request, health_port).await);
        }
        Ok(report)
    }

    /// Repeats verification passes until the tunnel is connected.
    ///
    /// `poll_interval` is raised to [`MIN_POLL_INTERVAL`] when smaller. The
    /// deadline also bounds a pass that is still running when it expires.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Timeout`] or [`VerifyError::Cancelled`] with
    /// the last report, or [`VerifyError::Tunnel`] when a pass fails.
    pub async fn wait_until_connected(
        &self,
        request: &VerifyRequest,
        poll_interval: Duration,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<VerificationReport, VerifyError> {
        let poll = poll_interval.max(MIN_POLL_INTERVAL);
        let deadline_at = Instant::now() + deadline;
        let mut previous: Option<VerificationReport> = None;

        loop {
            let Ok(outcome) = timeout_at(deadline_at, self.verify_once(request)).await else {
                let report = previous.unwrap_or_else(|| {
                    VerificationReport::new(
                        ConnectionState::Degraded,
                        "verification did not finish before the deadline",
                    )
                });
                return Err(VerifyError::Timeout(Box::new(report)));
            };
            let report = outcome?;
            if report.state == ConnectionState::Connected {
                tracing::info!(interface = %request.interface_name, "tunnel verified");
                return Ok(report);
            }
            tracing::debug!(
                interface = %request.interface_name,
                state = %report.state,
                explanation = %report.explanation,
                "tunnel not yet connected"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(VerifyError::Cancelled(Box::new(report))),
                () = sleep_until(deadline_at) => return Err(VerifyError::Timeout(Box::new(report))),
                () = sleep(poll) => {}
            }
            previous = Some(report);
        }
    }

    async fn first_reachable_port(&self, request: &VerifyRequest) -> Option<u16> {
        for &port in &request.probe_ports {
            let addr = SocketAddr::new(request.peer_address, port);
            if self.reachability.is_reachable(addr, request.probe_timeout).await {
                return Some(port);
            }
        }
        None
    }

    async fn check_health(&self, request: &VerifyRequest, port: u16) -> bool {
        let url = format!(
            "http://{}/health",
            SocketAddr::new(request.peer_address, port)
        );
        match self.http.get(&url).timeout(request.probe_timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::debug!(%url, error = %err, "health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};

    use chrono::TimeDelta;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::tunnel::{TunnelEndpoint, TunnelHandle};

    #[derive(Clone, Default)]
    struct FakeController {
        status: Arc<Mutex<Option<TunnelStatus>>>,
        calls: Arc<AtomicUsize>,
        read_delay: Duration,
    }

    impl FakeController {
        fn with_status(status: Option<TunnelStatus>) -> Self {
            Self {
                status: Arc::new(Mutex::new(status)),
                ..Self::default()
            }
        }

        /// Makes every status read block its thread, like a slow `wg` call.
        fn slow(mut self, read_delay: Duration) -> Self {
            self.read_delay = read_delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TunnelController for FakeController {
        fn setup(
            &self,
            _endpoint: &TunnelEndpoint,
            _cancel: &CancellationToken,
        ) -> Result<TunnelHandle, TunnelError> {
            Err(TunnelError::PrivilegeRequired)
        }

        fn teardown(&self, _handle: TunnelHandle) -> Result<(), TunnelError> {
            Ok(())
        }

        fn teardown_by_name(&self, _name: &str) -> Result<(), TunnelError> {
            Ok(())
        }

        fn status(&self, name: &str) -> Result<TunnelStatus, TunnelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.read_delay.is_zero() {
                std::thread::sleep(self.read_delay);
            }
            self.status
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .ok_or_else(|| TunnelError::InterfaceNotFound {
                    name: name.to_owned(),
                })
        }
    }

    /// Answers every reachability check with a fixed outcome after a delay.
    #[derive(Debug)]
    struct ScriptedReachability {
        reachable: bool,
        delay: Duration,
        checked: AtomicUsize,
    }

    impl ScriptedReachability {
        const fn answering(reachable: bool) -> Self {
            Self {
                reachable,
                delay: Duration::ZERO,
                checked: AtomicUsize::new(0),
            }
        }

        const fn stalling(delay: Duration) -> Self {
            Self {
                reachable: false,
                delay,
                checked: AtomicUsize::new(0),
            }
        }
    }

    impl Reachability for ScriptedReachability {
        fn is_reachable(&self, _addr: SocketAddr, _timeout: Duration) -> ReachabilityFuture<'_> {
            Box::pin(async move {
                self.checked.fetch_add(1, Ordering::SeqCst);
                sleep(self.delay).await;
                self.reachable
            })
        }
    }

    fn handshake_ago(seconds: i64) -> TunnelStatus {
        TunnelStatus {
            peer_public_key: Some(String::from("cGVlcg==")),
            peer_endpoint: Some(String::from("203.0.113.7:51820")),
            last_handshake: Some(Utc::now() - TimeDelta::seconds(seconds)),
            rx_bytes: 1,
            tx_bytes: 1,
        }
    }

    fn request(ports: Vec<u16>) -> VerifyRequest {
        VerifyRequest {
            probe_ports: ports,
            probe_timeout: Duration::from_millis(200),
            ..VerifyRequest::new("wg-tether", IpAddr::V4(Ipv4Addr::LOCALHOST))
        }
    }

    /// Serves `HTTP 200` to every connection until the test ends.
    async fn http_ok_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0_u8; 1024];
                    socket.read(&mut buf).await.ok();
                    socket
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                        .await
                        .ok();
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn missing_interface_is_disconnected() {
        let verifier = ConnectionVerifier::new(FakeController::with_status(None));
        let report = verifier.verify_once(&request(vec![22])).await.expect("verify");
        assert_eq!(report.state, ConnectionState::Disconnected);
        assert!(report.explanation.contains("wg-tether"));
        assert!(
            report.explanation.contains("no tunnel has been created yet, or it was torn down"),
            "explanation lacks a cause: {}",
            report.explanation
        );
    }

    #[tokio::test]
    async fn missing_handshake_is_connecting() {
        let verifier = ConnectionVerifier::new(FakeController::with_status(Some(TunnelStatus::default())));
        let report = verifier.verify_once(&request(vec![22])).await.expect("verify");
        assert_eq!(report.state, ConnectionState::Connecting);
        assert!(
            report
                .explanation
                .contains("endpoint unreachable, peer not running, or key mismatch"),
            "explanation lacks a cause: {}",
            report.explanation
        );
    }

    #[tokio::test]
    async fn stale_handshake_is_degraded() {
        let verifier = ConnectionVerifier::new(FakeController::with_status(Some(handshake_ago(600))));
        let report = verifier.verify_once(&request(vec![22])).await.expect("verify");
        assert_eq!(report.state, ConnectionState::Degraded);
        assert!(report.explanation.contains("handshake"));
        assert!(
            report.explanation.contains("network interruption or remote restart"),
            "explanation lacks a cause: {}",
            report.explanation
        );
    }

    #[tokio::test]
    async fn listening_port_is_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let verifier = ConnectionVerifier::new(FakeController::with_status(Some(handshake_ago(5))));

        let report = verifier.verify_once(&request(vec![port])).await.expect("verify");
        assert_eq!(report.state, ConnectionState::Connected);
        assert_eq!(report.reachable_port, Some(port));
        assert_eq!(report.service_healthy, None);
    }

    #[tokio::test]
    async fn refused_port_counts_as_reachable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let verifier = ConnectionVerifier::new(FakeController::with_status(Some(handshake_ago(5))));

        let report = verifier.verify_once(&request(vec![port])).await.expect("verify");
        assert_eq!(report.state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn unreachable_peer_is_degraded() {
        let verifier = ConnectionVerifier::with_reachability(
            FakeController::with_status(Some(handshake_ago(5))),
            ScriptedReachability::answering(false),
        );

        let report = verifier.verify_once(&request(vec![22, 8000])).await.expect("verify");
        assert_eq!(report.state, ConnectionState::Degraded);
        assert_eq!(report.reachable_port, None);
        assert_eq!(verifier.reachability.checked.load(Ordering::SeqCst), 2);
        assert!(report.explanation.contains("[22, 8000]"));
    }

    #[tokio::test]
    async fn first_answering_port_wins() {
        let verifier = ConnectionVerifier::with_reachability(
            FakeController::with_status(Some(handshake_ago(5))),
            ScriptedReachability::answering(true),
        );

        let report = verifier.verify_once(&request(vec![8080, 22])).await.expect("verify");
        assert_eq!(report.state, ConnectionState::Connected);
        assert_eq!(report.reachable_port, Some(8080));
        assert_eq!(verifier.reachability.checked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn health_check_reports_service_health() {
        let port = http_ok_server().await;
        let verifier = ConnectionVerifier::new(FakeController::with_status(Some(handshake_ago(5))));
        let with_health = VerifyRequest {
            health_port: Some(port),
            ..request(vec![port])
        };

        let report = verifier.verify_once(&with_health).await.expect("verify");
        assert_eq!(report.state, ConnectionState::Connected);
        assert_eq!(report.service_healthy, Some(true));
    }

    #[tokio::test]
    async fn slow_status_read_leaves_runtime_responsive() {
        let verifier = ConnectionVerifier::with_reachability(
            FakeController::with_status(Some(TunnelStatus::default())).slow(Duration::from_millis(400)),
            ScriptedReachability::answering(true),
        );
        let timer = async {
            let started = std::time::Instant::now();
            sleep(Duration::from_millis(10)).await;
            started.elapsed()
        };

        let req = request(vec![22]);
        let (report, waited) = tokio::join!(verifier.verify_once(&req), timer);

        assert_eq!(report.expect("verify").state, ConnectionState::Connecting);
        assert!(
            waited < Duration::from_millis(300),
            "runtime was blocked for {waited:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_with_last_report() {
        let controller = FakeController::with_status(Some(TunnelStatus::default()));
        let verifier = ConnectionVerifier::new(controller.clone());

        let err = verifier
            .wait_until_connected(
                &request(vec![22]),
                Duration::from_millis(10),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .expect_err("should time out");

        assert!(matches!(err, VerifyError::Timeout(_)));
        assert_eq!(
            err.last_report().map(|report| report.state),
            Some(ConnectionState::Connecting)
        );
        let calls = controller.calls();
        assert!((4..=5).contains(&calls), "poll interval not clamped: {calls} passes");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_deadline_bounds_a_running_pass() {
        let verifier = ConnectionVerifier::with_reachability(
            FakeController::with_status(Some(handshake_ago(5))),
            ScriptedReachability::stalling(Duration::from_secs(5)),
        );
        let started = Instant::now();

        let err = verifier
            .wait_until_connected(
                &request(vec![22, 8000, 8080, 11434]),
                Duration::from_millis(250),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .expect_err("should time out");

        assert!(matches!(err, VerifyError::Timeout(_)));
        assert_eq!(
            err.last_report().map(|report| report.state),
            Some(ConnectionState::Degraded)
        );
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "deadline overrun: {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn wait_honours_cancellation() {
        let verifier = ConnectionVerifier::new(FakeController::with_status(None));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = verifier
            .wait_until_connected(
                &request(vec![22]),
                Duration::from_millis(250),
                Duration::from_secs(30),
                &cancel,
            )
            .await
            .expect_err("should be cancelled");

        assert_eq!(
            err.last_report().map(|report| report.state),
            Some(ConnectionState::Disconnected)
        );
        assert!(matches!(err, VerifyError::Cancelled(_)));
    }
}
