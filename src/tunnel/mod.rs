//! Encrypted point-to-point tunnel lifecycle.
//!
//! One [`TunnelController`] capability set with a strategy per host family:
//! the Linux kernel module driven through `ip`/`wg`, a userspace helper
//! (`wireguard-go`) driven through `ifconfig`/`route` on macOS, and a stub
//! for every other host. [`default_controller`] picks the strategy at build
//! time so call sites never branch on the platform.

mod elevation;
mod endpoint;
mod keyfile;
mod linux;
pub mod render;
mod stub;
mod userspace;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandError, CommandOutput, render_command};

pub use elevation::Elevation;
pub use endpoint::{TunnelEndpoint, TunnelEndpointBuilder, TunnelHandle, TunnelStatus, parse_dump};
pub(crate) use endpoint::parse_cidr;
pub use linux::LinuxKernelController;
pub use stub::StubController;
pub use userspace::UserspaceController;

/// Errors raised while managing a tunnel interface.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Neither root nor a non-interactive elevation helper is available.
    #[error("tunnel management requires root or passwordless sudo")]
    PrivilegeRequired,
    /// An interface with the requested name already exists.
    #[error("interface {name} already exists")]
    InterfaceExists {
        /// Interface name.
        name: String,
    },
    /// The interface is not present on this host.
    #[error("interface {name} not found")]
    InterfaceNotFound {
        /// Interface name.
        name: String,
    },
    /// A field of the endpoint is malformed.
    #[error("invalid tunnel endpoint field {field}: {message}")]
    InvalidEndpoint {
        /// Offending field.
        field: String,
        /// Validation message.
        message: String,
    },
    /// The host platform has no tunnel strategy.
    #[error("tunnels are not supported on {platform}")]
    Unsupported {
        /// Target operating system.
        platform: String,
    },
    /// Setup was cancelled; anything created has been rolled back.
    #[error("setup of {name} was cancelled")]
    Cancelled {
        /// Interface name.
        name: String,
    },
    /// An OS command exited unsuccessfully.
    #[error("`{command}` failed with status {status}: {stderr}")]
    Command {
        /// Rendered command line.
        command: String,
        /// Exit status text.
        status: String,
        /// Trimmed standard error.
        stderr: String,
    },
    /// An OS command could not be started.
    #[error(transparent)]
    Runner(#[from] CommandError),
    /// Local file handling failed.
    #[error("I/O error at {path}: {message}")]
    Io {
        /// Path involved in the failure.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// `wg` output could not be parsed.
    #[error("failed to parse tunnel status: {0}")]
    Parse(String),
    /// The userspace helper did not report its interface in time.
    #[error("userspace helper for {name} did not start in time")]
    HelperTimeout {
        /// Interface name.
        name: String,
    },
}

impl TunnelError {
    pub(crate) fn command(program: &str, args: &[std::ffi::OsString], output: &CommandOutput) -> Self {
        Self::Command {
            command: render_command(program, args),
            status: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        }
    }

    pub(crate) fn io(path: &camino::Utf8Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Platform strategy for creating, removing, and inspecting a tunnel.
pub trait TunnelController: Send + Sync {
    /// Creates and configures the interface described by `endpoint`.
    ///
    /// `cancel` is checked between privileged steps. On any failure or
    /// cancellation every partially created resource is removed before the
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::PrivilegeRequired`],
    /// [`TunnelError::InterfaceExists`], [`TunnelError::Cancelled`], or the
    /// first failing command.
    fn setup(
        &self,
        endpoint: &TunnelEndpoint,
        cancel: &CancellationToken,
    ) -> Result<TunnelHandle, TunnelError>;

    /// Removes everything `setup` created. Every cleanup step runs even when
    /// an earlier one fails; the first failure is returned afterwards.
    ///
    /// # Errors
    ///
    /// Returns the first failing cleanup step.
    fn teardown(&self, handle: TunnelHandle) -> Result<(), TunnelError>;

    /// Removes an interface by name when no handle survives (for example
    /// after the process that created it exited). Absent interfaces succeed.
    ///
    /// # Errors
    ///
    /// Returns the first failing cleanup step.
    fn teardown_by_name(&self, name: &str) -> Result<(), TunnelError>;

    /// Reads peer statistics for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::InterfaceNotFound`] when the interface is
    /// absent.
    fn status(&self, name: &str) -> Result<TunnelStatus, TunnelError>;
}

impl<T: TunnelController + ?Sized> TunnelController for Box<T> {
    fn setup(
        &self,
        endpoint: &TunnelEndpoint,
        cancel: &CancellationToken,
    ) -> Result<TunnelHandle, TunnelError> {
        (**self).setup(endpoint, cancel)
    }

    fn teardown(&self, handle: TunnelHandle) -> Result<(), TunnelError> {
        (**self).teardown(handle)
    }

    fn teardown_by_name(&self, name: &str) -> Result<(), TunnelError> {
        (**self).teardown_by_name(name)
    }

    fn status(&self, name: &str) -> Result<TunnelStatus, TunnelError> {
        (**self).status(name)
    }
}

/// Returns the tunnel strategy for the build target, driven by real OS
/// commands. `run_dir` holds key files and helper state.
#[must_use]
pub fn default_controller(run_dir: impl Into<Utf8PathBuf>) -> Box<dyn TunnelController> {
    let runner = crate::command::ProcessCommandRunner;
    let run_dir = run_dir.into();

    #[cfg(target_os = "linux")]
    {
        Box::new(LinuxKernelController::new(runner, run_dir))
    }
    #[cfg(target_os = "macos")]
    {
        Box::new(UserspaceController::new(runner, run_dir))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = (runner, run_dir);
        Box::new(StubController::new())
    }
}
