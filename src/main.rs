//! Binary entry point for the Tether CLI.

mod cli;

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use tether::config::{ConfigError, TetherConfig};
use tether::deadman::{DeadmanMonitor, DeadmanStatus};
use tether::keys::{self, KeyPair};
use tether::session::{SessionError, SessionState};
use tether::telemetry;
use tether::tunnel::{TunnelController, TunnelError, TunnelStatus, default_controller};
use tether::verify::{ConnectionState, ConnectionVerifier, VerificationReport, VerifyError};

use cli::{Cli, Command, SessionCommand, TunnelCommand, VerifyCommand};

const VERIFY_POLL_INTERVAL: Duration = Duration::from_secs(1);
const EXIT_NOT_CONNECTED: i32 = 2;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
    #[error("verification failed: {0}")]
    Verify(#[from] VerifyError),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    telemetry::init_logging(cli.verbose);
    let exit_code = match dispatch(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(command: Command) -> Result<i32, CliError> {
    match command {
        Command::Keygen => {
            emit(&render_keygen(&keys::generate()))?;
            Ok(0)
        }
        Command::Session { action } => session_command(&load_config()?, &action),
        Command::Tunnel { action } => tunnel_command(&load_config()?, &action),
        Command::Verify(args) => verify_command(&load_config()?, &args).await,
    }
}

fn load_config() -> Result<TetherConfig, CliError> {
    let config = TetherConfig::load_without_cli_args()?;
    config.validate()?;
    Ok(config)
}

fn session_command(config: &TetherConfig, action: &SessionCommand) -> Result<i32, CliError> {
    let store = config.session_store();
    match action {
        SessionCommand::Show => {
            let Some(state) = store.load()? else {
                emit("no active session")?;
                return Ok(0);
            };
            let deadman = match DeadmanMonitor::new(store).check(Utc::now()) {
                Ok(status) => Some(status),
                Err(SessionError::NoActiveInstance(_) | SessionError::MissingState) => None,
                Err(err) => return Err(err.into()),
            };
            emit(&render_session(&state, deadman.as_ref())?)?;
        }
        SessionCommand::Clear => {
            store.clear()?;
            emit("session cleared")?;
        }
        SessionCommand::Heartbeat => {
            store.update_heartbeat()?;
            emit("heartbeat recorded")?;
        }
    }
    Ok(0)
}

fn tunnel_command(config: &TetherConfig, action: &TunnelCommand) -> Result<i32, CliError> {
    let controller = default_controller(config.run_dir());
    let name = config.interface_name.as_str();
    match action {
        TunnelCommand::Status => {
            let status = controller.status(name)?;
            emit(&render_status(name, &status))?;
        }
        TunnelCommand::Down => {
            controller.teardown_by_name(name)?;
            emit(&format!("interface {name} is down"))?;
        }
    }
    Ok(0)
}

async fn verify_command(config: &TetherConfig, args: &VerifyCommand) -> Result<i32, CliError> {
    let request = config.verify_request()?;
    let verifier = ConnectionVerifier::new(default_controller(config.run_dir()));
    let outcome = match args.wait {
        Some(secs) => {
            verifier
                .wait_until_connected(
                    &request,
                    VERIFY_POLL_INTERVAL,
                    Duration::from_secs(secs),
                    &CancellationToken::new(),
                )
                .await
        }
        None => verifier.verify_once(&request).await,
    };
    let report = match outcome {
        Ok(report) => report,
        Err(VerifyError::Timeout(report)) => *report,
        Err(err) => return Err(err.into()),
    };
    emit(&render_report(&report))?;
    Ok(exit_code_for(report.state))
}

const fn exit_code_for(state: ConnectionState) -> i32 {
    match state {
        ConnectionState::Connected => 0,
        ConnectionState::Disconnected | ConnectionState::Connecting | ConnectionState::Degraded => {
            EXIT_NOT_CONNECTED
        }
    }
}

fn render_keygen(pair: &KeyPair) -> String {
    format!(
        "private_key: {}\npublic_key: {}",
        pair.private_key(),
        pair.public_key()
    )
}

fn render_session(state: &SessionState, deadman: Option<&DeadmanStatus>) -> Result<String, CliError> {
    let countdown = deadman.map(|status| {
        json!({
            "instance_id": status.instance_id,
            "timeout_hours": status.timeout_hours,
            "remaining_secs": status.remaining.as_secs(),
            "expired": status.expired,
            "last_heartbeat": status.last_heartbeat.to_rfc3339(),
        })
    });
    serde_json::to_string_pretty(&json!({ "session": state, "deadman": countdown }))
        .map_err(|err| CliError::Output(err.to_string()))
}

fn render_status(name: &str, status: &TunnelStatus) -> String {
    let handshake = status
        .last_handshake
        .map_or_else(|| String::from("never"), |at| at.to_rfc3339());
    format!(
        "interface: {name}\npeer: {}\nendpoint: {}\nlatest handshake: {handshake}\ntransfer: {} B received, {} B sent",
        status.peer_public_key.as_deref().unwrap_or("none"),
        status.peer_endpoint.as_deref().unwrap_or("none"),
        status.rx_bytes,
        status.tx_bytes,
    )
}

fn render_report(report: &VerificationReport) -> String {
    let mut text = format!("state: {}\n{}", report.state, report.explanation);
    if let Some(port) = report.reachable_port {
        text.push_str(&format!("\nreachable port: {port}"));
    }
    if let Some(healthy) = report.service_healthy {
        let label = if healthy { "healthy" } else { "unhealthy" };
        text.push_str(&format!("\nservice: {label}"));
    }
    text
}

fn emit(text: &str) -> Result<(), CliError> {
    writeln!(io::stdout().lock(), "{text}").map_err(|err| CliError::Output(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
