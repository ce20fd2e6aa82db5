//! Command runner abstraction used by the tunnel strategies.
//!
//! Every privileged OS operation (`ip`, `wg`, `ifconfig`, `route`) goes
//! through [`CommandRunner`] so strategies can be driven by scripted fakes in
//! tests and so failures carry the rendered command line.

use std::ffi::OsString;
use std::process::{Child, Command, Stdio};

use shell_escape::unix::escape;
use thiserror::Error;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable exit status for error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised while starting external commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when the process could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying error message.
        message: String,
    },
}

/// A long-running helper process started through [`CommandRunner::spawn`].
#[derive(Debug)]
pub struct SpawnedProcess {
    child: Option<Child>,
    program: String,
}

impl SpawnedProcess {
    /// Wraps a real child process.
    #[must_use]
    pub fn from_child(program: impl Into<String>, child: Child) -> Self {
        Self {
            child: Some(child),
            program: program.into(),
        }
    }

    /// Placeholder used by scripted runners where no OS process exists.
    #[must_use]
    pub fn detached(program: impl Into<String>) -> Self {
        Self {
            child: None,
            program: program.into(),
        }
    }

    /// Program the process was started from.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// OS process identifier, when backed by a real process.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Returns `true` while the process has not exited.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Kills the process and reaps it. Already-exited processes are not an
    /// error.
    pub fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            if matches!(child.try_wait(), Ok(None)) {
                child.kill().ok();
            }
            child.wait().ok();
        }
    }
}

impl Drop for SpawnedProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError>;

    /// Starts `program` in the background without waiting for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn spawn(&self, program: &str, args: &[OsString]) -> Result<SpawnedProcess, CommandError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        tracing::debug!(command = %render_command(program, args), "running command");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| CommandError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(&self, program: &str, args: &[OsString]) -> Result<SpawnedProcess, CommandError> {
        tracing::debug!(command = %render_command(program, args), "spawning helper");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| CommandError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;
        Ok(SpawnedProcess::from_child(program, child))
    }
}

/// Renders a shell-escaped command line for logs and error messages.
#[must_use]
pub fn render_command(program: &str, args: &[OsString]) -> String {
    let mut rendered = escape(program.into()).into_owned();
    for arg in args {
        rendered.push(' ');
        let lossy = arg.to_string_lossy();
        rendered.push_str(escape(lossy).as_ref());
    }
    rendered
}

/// Builds an argument vector from string slices.
#[must_use]
pub fn args<I, S>(values: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    values.into_iter().map(Into::into).collect()
}
