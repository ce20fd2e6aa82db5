//! Privilege detection and elevated command execution.

use std::ffi::OsString;

use nix::unistd::geteuid;

use crate::command::{CommandOutput, CommandRunner, SpawnedProcess};

use super::TunnelError;

const SUDO: &str = "sudo";

/// How privileged commands are executed on this host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Elevation {
    /// The process already runs as root.
    Root,
    /// Commands are prefixed with `sudo -n`.
    Sudo,
    /// No way to obtain privileges without prompting.
    Unavailable,
}

impl Elevation {
    /// Detects the available elevation: root first, then passwordless sudo.
    pub fn detect<R: CommandRunner + ?Sized>(runner: &R) -> Self {
        if geteuid().is_root() {
            return Self::Root;
        }
        match runner.run(SUDO, &[OsString::from("-n"), OsString::from("true")]) {
            Ok(output) if output.is_success() => Self::Sudo,
            Ok(_) | Err(_) => Self::Unavailable,
        }
    }

    fn wrap(self, program: &str, args: &[OsString]) -> Result<(String, Vec<OsString>), TunnelError> {
        match self {
            Self::Root => Ok((program.to_owned(), args.to_vec())),
            Self::Sudo => {
                let mut wrapped = Vec::with_capacity(args.len() + 2);
                wrapped.push(OsString::from("-n"));
                wrapped.push(OsString::from(program));
                wrapped.extend_from_slice(args);
                Ok((SUDO.to_owned(), wrapped))
            }
            Self::Unavailable => Err(TunnelError::PrivilegeRequired),
        }
    }
}

/// Runs commands through a [`CommandRunner`] with the detected elevation.
///
/// Errors always render the unwrapped command so messages stay readable.
pub(crate) struct Privileged<'a, R: ?Sized> {
    runner: &'a R,
    elevation: Elevation,
}

impl<'a, R: CommandRunner + ?Sized> Privileged<'a, R> {
    pub(crate) fn new(runner: &'a R, elevation: Elevation) -> Result<Self, TunnelError> {
        if elevation == Elevation::Unavailable {
            return Err(TunnelError::PrivilegeRequired);
        }
        Ok(Self { runner, elevation })
    }

    /// Runs a command and returns its output whatever the exit status.
    pub(crate) fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, TunnelError> {
        let (wrapped_program, wrapped_args) = self.elevation.wrap(program, args)?;
        Ok(self.runner.run(&wrapped_program, &wrapped_args)?)
    }

    /// Runs a command and fails on a non-zero exit.
    pub(crate) fn run_checked(
        &self,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, TunnelError> {
        let output = self.run(program, args)?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(TunnelError::command(program, args, &output))
        }
    }

    /// Starts a long-running helper under elevation.
    pub(crate) fn spawn(&self, program: &str, args: &[OsString]) -> Result<SpawnedProcess, TunnelError> {
        let (wrapped_program, wrapped_args) = self.elevation.wrap(program, args)?;
        Ok(self.runner.spawn(&wrapped_program, &wrapped_args)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::args;
    use crate::test_support::ScriptedRunner;

    #[test]
    fn sudo_prefixes_non_interactive_flag() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let privileged = Privileged::new(&runner, Elevation::Sudo).expect("elevation");

        privileged
            .run_checked("ip", &args(["link", "show", "dev", "wg0"]))
            .expect("command should succeed");
        assert_eq!(runner.command_strings(), vec!["sudo -n ip link show dev wg0"]);
    }

    #[test]
    fn unavailable_elevation_is_rejected() {
        let runner = ScriptedRunner::new();
        let result = Privileged::new(&runner, Elevation::Unavailable);
        assert!(matches!(result, Err(TunnelError::PrivilegeRequired)));
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn failures_render_the_unwrapped_command() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(2), "", "RTNETLINK answers: Operation not permitted\n");
        let privileged = Privileged::new(&runner, Elevation::Sudo).expect("elevation");

        let err = privileged
            .run_checked("ip", &args(["link", "add", "dev", "wg0", "type", "wireguard"]))
            .expect_err("command should fail");
        let TunnelError::Command {
            command, stderr, ..
        } = err
        else {
            panic!("expected command failure, got {err:?}");
        };
        assert_eq!(command, "ip link add dev wg0 type wireguard");
        assert_eq!(stderr, "RTNETLINK answers: Operation not permitted");
    }
}
