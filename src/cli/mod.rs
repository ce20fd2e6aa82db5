//! Command-line interface definitions for the `tether` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{ArgAction, Args, Parser, Subcommand};

/// Top-level CLI for the `tether` binary.
#[derive(Debug, Parser)]
#[command(
    name = "tether",
    about = "Manage the tunnel and safety nets of a rented GPU instance",
    version,
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Increase log verbosity (`-v` info, `-vv` debug). `RUST_LOG` wins.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub(crate) verbose: u8,
    /// Operation to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of the `tether` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Generate a fresh tunnel key pair.
    #[command(name = "keygen", about = "Generate a fresh tunnel key pair")]
    Keygen,
    /// Inspect or reset the persisted session.
    #[command(name = "session", about = "Inspect or reset the persisted session")]
    Session {
        /// Session operation.
        #[command(subcommand)]
        action: SessionCommand,
    },
    /// Inspect or remove the local tunnel interface.
    #[command(name = "tunnel", about = "Inspect or remove the local tunnel interface")]
    Tunnel {
        /// Tunnel operation.
        #[command(subcommand)]
        action: TunnelCommand,
    },
    /// Classify tunnel health.
    #[command(name = "verify", about = "Classify tunnel health")]
    Verify(VerifyCommand),
}

/// Operations on the persisted session.
#[derive(Debug, Subcommand)]
pub(crate) enum SessionCommand {
    /// Print the session as JSON together with the deadman countdown.
    Show,
    /// Delete the persisted session.
    Clear,
    /// Record a heartbeat now.
    Heartbeat,
}

/// Operations on the local tunnel interface.
#[derive(Debug, Subcommand)]
pub(crate) enum TunnelCommand {
    /// Print peer statistics for the configured interface.
    Status,
    /// Remove the configured interface if it exists.
    Down,
}

/// Arguments for the `tether verify` subcommand.
#[derive(Debug, Args)]
pub(crate) struct VerifyCommand {
    /// Keep polling until connected or this many seconds elapse.
    #[arg(long, value_name = "SECS")]
    pub(crate) wait: Option<u64>,
}
