//! Core library for the Tether GPU session tool.
//!
//! The crate manages the encrypted tunnel between a workstation and a rented
//! GPU instance, verifies that the tunnel carries traffic, and runs the
//! safety nets that keep a forgotten instance from burning money: a deadman
//! switch, a spot interruption monitor, and budget alerts. All of them share
//! one persisted session record.

pub mod alert;
pub mod budget;
pub mod command;
pub mod config;
pub mod deadman;
pub mod keys;
pub mod provider;
pub mod session;
pub mod spot;
pub mod telemetry;
pub mod test_support;
mod ticker;
pub mod tunnel;
pub mod verify;

pub use alert::{AlertDispatcher, AlertEvent};
pub use budget::{BudgetThreshold, BudgetTracker};
pub use command::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, TetherConfig};
pub use deadman::{DeadmanMonitor, HeartbeatTask};
pub use keys::KeyPair;
pub use provider::{InstanceTerminator, ProviderError};
pub use session::{SessionError, SessionState, SessionStore};
pub use spot::{InterruptReason, SpotInterruptMonitor};
pub use ticker::MIN_TICK_INTERVAL;
pub use tunnel::{TunnelController, TunnelEndpoint, TunnelError, TunnelHandle, TunnelStatus};
pub use verify::{ConnectionState, ConnectionVerifier, Reachability, TcpReachability, VerifyRequest};
