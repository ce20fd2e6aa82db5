//! Userspace strategy: a `wireguard-go` helper plus `ifconfig` and `route`.
//!
//! The helper picks the next free `utun` device and writes its name to the
//! file named by `WG_TUN_NAME_FILE`. Removing the helper's UAPI socket makes
//! it exit and destroys the device.

use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;

use crate::command::{CommandRunner, args};

use super::elevation::{Elevation, Privileged};
use super::endpoint::{TunnelEndpoint, TunnelHandle, TunnelStatus, parse_dump};
use super::keyfile::{KeyFile, open_run_dir};
use super::linux::checkpoint;
use super::{TunnelController, TunnelError};

const HELPER_PROGRAM: &str = "wireguard-go";
const DEFAULT_SOCKET_DIR: &str = "/var/run/wireguard";
const DEFAULT_POLL_ATTEMPTS: u32 = 50;
const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(100);

/// Drives a userspace WireGuard helper on hosts without a kernel module.
#[derive(Debug)]
pub struct UserspaceController<R> {
    runner: R,
    run_dir: Utf8PathBuf,
    socket_dir: Utf8PathBuf,
    poll_attempts: u32,
    poll_delay: Duration,
    elevation: OnceLock<Elevation>,
}

impl<R: CommandRunner> UserspaceController<R> {
    /// Creates a controller that detects elevation on first use. Key files
    /// and interface name files are written under `run_dir`.
    pub fn new(runner: R, run_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            runner,
            run_dir: run_dir.into(),
            socket_dir: Utf8PathBuf::from(DEFAULT_SOCKET_DIR),
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            poll_delay: DEFAULT_POLL_DELAY,
            elevation: OnceLock::new(),
        }
    }

    /// Creates a controller with a fixed elevation.
    pub fn with_elevation(runner: R, run_dir: impl Into<Utf8PathBuf>, elevation: Elevation) -> Self {
        let controller = Self::new(runner, run_dir);
        controller.elevation.set(elevation).ok();
        controller
    }

    /// Overrides how long setup waits for the helper to come up.
    #[must_use]
    pub const fn with_helper_polling(mut self, attempts: u32, delay: Duration) -> Self {
        self.poll_attempts = attempts;
        self.poll_delay = delay;
        self
    }

    fn privileged(&self) -> Result<Privileged<'_, R>, TunnelError> {
        let elevation = *self
            .elevation
            .get_or_init(|| Elevation::detect(&self.runner));
        Privileged::new(&self.runner, elevation)
    }

    fn name_file(&self, name: &str) -> Utf8PathBuf {
        self.run_dir.join(format!("{name}.name"))
    }

    fn socket_path(&self, system_name: &str) -> Utf8PathBuf {
        self.socket_dir.join(format!("{system_name}.sock"))
    }

    /// Reads the `utun` device recorded for `name`, if any.
    fn resolve(
        &self,
        privileged: &Privileged<'_, R>,
        name: &str,
    ) -> Result<Option<String>, TunnelError> {
        let output = privileged.run("cat", &args([self.name_file(name).as_str()]))?;
        let system_name = output.stdout.trim();
        if !output.is_success() || system_name.is_empty() {
            return Ok(None);
        }
        Ok(Some(system_name.to_owned()))
    }

    /// The name file lives in the caller's own run directory, so its presence
    /// is checked without elevation.
    fn name_file_exists(&self, name: &str) -> Result<bool, TunnelError> {
        let output = self
            .runner
            .run("test", &args(["-e", self.name_file(name).as_str()]))?;
        Ok(output.is_success())
    }

    fn socket_exists(privileged: &Privileged<'_, R>, path: &Utf8Path) -> Result<bool, TunnelError> {
        Ok(privileged.run("test", &args(["-S", path.as_str()]))?.is_success())
    }

    fn wait_for_helper(
        &self,
        privileged: &Privileged<'_, R>,
        handle: &mut TunnelHandle,
        cancel: &CancellationToken,
    ) -> Result<(), TunnelError> {
        let name = handle.interface_name.clone();
        for _ in 0..self.poll_attempts {
            checkpoint(cancel, &name)?;
            // The helper may rewrite the file after the first read; follow it
            // until the socket it names appears.
            if let Some(system_name) = self.resolve(privileged, &name)? {
                if system_name != handle.system_name {
                    handle.socket_path = Some(self.socket_path(&system_name));
                    handle.system_name = system_name;
                }
            }
            if let Some(socket) = handle.socket_path.as_deref() {
                if Self::socket_exists(privileged, socket)? {
                    tracing::debug!(
                        interface = %name,
                        device = %handle.system_name,
                        "userspace helper is ready"
                    );
                    return Ok(());
                }
            }
            if let Some(helper) = handle.helper.as_mut() {
                if helper.id().is_some() && !helper.is_running() {
                    return Err(TunnelError::Command {
                        command: String::from(HELPER_PROGRAM),
                        status: String::from("exited"),
                        stderr: String::from("helper exited before creating its interface"),
                    });
                }
            }
            thread::sleep(self.poll_delay);
        }
        Err(TunnelError::HelperTimeout { name })
    }

    fn bring_up(
        &self,
        privileged: &Privileged<'_, R>,
        endpoint: &TunnelEndpoint,
        handle: &mut TunnelHandle,
        cancel: &CancellationToken,
    ) -> Result<(), TunnelError> {
        self.wait_for_helper(privileged, handle, cancel)?;
        let device = handle.system_name.clone();
        let name = endpoint.interface_name.as_str();

        checkpoint(cancel, name)?;
        {
            let key = KeyFile::write(&self.run_dir, &endpoint.private_key)?;
            privileged.run_checked("wg", &endpoint.wg_set_args(&device, key.path()))?;
        }

        checkpoint(cancel, name)?;
        privileged.run_checked(
            "ifconfig",
            &args([
                device.as_str(),
                "inet",
                endpoint.local_address.as_str(),
                endpoint.local_ip(),
                "alias",
            ]),
        )?;

        checkpoint(cancel, name)?;
        privileged.run_checked("ifconfig", &args([device.as_str(), "up"]))?;

        for network in &endpoint.allowed_ips {
            checkpoint(cancel, name)?;
            privileged.run_checked(
                "route",
                &args(["-q", "-n", "add", "-inet", network.as_str(), "-interface", device.as_str()]),
            )?;
            handle.routes.push(network.clone());
        }
        Ok(())
    }

    /// Runs every cleanup step for `handle`, returning the first failure.
    fn cleanup(&self, privileged: &Privileged<'_, R>, mut handle: TunnelHandle) -> Result<(), TunnelError> {
        let mut first_error: Option<TunnelError> = None;
        let mut record = |result: Result<(), TunnelError>| {
            if let Err(err) = result {
                tracing::warn!(
                    interface = %handle.interface_name,
                    error = %err,
                    "tunnel cleanup step failed"
                );
                first_error.get_or_insert(err);
            }
        };

        for network in &handle.routes {
            record(
                privileged
                    .run_checked(
                        "route",
                        &args([
                            "-q",
                            "-n",
                            "delete",
                            "-inet",
                            network.as_str(),
                            "-interface",
                            handle.system_name.as_str(),
                        ]),
                    )
                    .map(drop),
            );
        }
        if let Some(socket) = handle.socket_path.as_deref() {
            record(privileged.run_checked("rm", &args(["-f", socket.as_str()])).map(drop));
        }
        if let Some(name_file) = handle.name_file.as_deref() {
            record(privileged.run_checked("rm", &args(["-f", name_file.as_str()])).map(drop));
        }
        if let Some(helper) = handle.helper.as_mut() {
            helper.terminate();
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        tracing::info!(interface = %handle.interface_name, "removed tunnel interface");
        Ok(())
    }
}

impl<R: CommandRunner> TunnelController for UserspaceController<R> {
    fn setup(
        &self,
        endpoint: &TunnelEndpoint,
        cancel: &CancellationToken,
    ) -> Result<TunnelHandle, TunnelError> {
        endpoint.validate()?;
        let privileged = self.privileged()?;
        let name = endpoint.interface_name.as_str();

        let name_file = self.name_file(name);
        if let Some(existing) = self.resolve(&privileged, name)? {
            if Self::socket_exists(&privileged, &self.socket_path(&existing))? {
                return Err(TunnelError::InterfaceExists {
                    name: name.to_owned(),
                });
            }
            tracing::info!(interface = %name, device = %existing, "removing stale interface name file");
            privileged.run_checked("rm", &args(["-f", name_file.as_str()]))?;
        }
        checkpoint(cancel, name)?;
        open_run_dir(&self.run_dir)?;

        let helper = privileged.spawn(
            "env",
            &args([
                format!("WG_TUN_NAME_FILE={name_file}"),
                String::from(HELPER_PROGRAM),
                String::from("-f"),
                String::from("utun"),
            ]),
        )?;
        let mut handle = TunnelHandle {
            interface_name: name.to_owned(),
            system_name: String::new(),
            helper: Some(helper),
            routes: Vec::new(),
            socket_path: None,
            name_file: Some(name_file),
        };

        if let Err(err) = self.bring_up(&privileged, endpoint, &mut handle, cancel) {
            tracing::warn!(interface = %name, error = %err, "tunnel setup failed; rolling back");
            if let Err(rollback_err) = self.cleanup(&privileged, handle) {
                tracing::error!(interface = %name, error = %rollback_err, "rollback failed");
            }
            return Err(err);
        }

        tracing::info!(
            interface = %name,
            device = %handle.system_name,
            peer = %endpoint.peer_endpoint,
            "tunnel interface is up"
        );
        Ok(handle)
    }

    fn teardown(&self, handle: TunnelHandle) -> Result<(), TunnelError> {
        let privileged = self.privileged()?;
        self.cleanup(&privileged, handle)
    }

    fn teardown_by_name(&self, name: &str) -> Result<(), TunnelError> {
        if !self.name_file_exists(name)? {
            tracing::debug!(interface = %name, "interface already absent");
            return Ok(());
        }
        let privileged = self.privileged()?;
        let Some(system_name) = self.resolve(&privileged, name)? else {
            tracing::debug!(interface = %name, "interface already absent");
            return Ok(());
        };
        let handle = TunnelHandle {
            interface_name: name.to_owned(),
            socket_path: Some(self.socket_path(&system_name)),
            system_name,
            helper: None,
            routes: Vec::new(),
            name_file: Some(self.name_file(name)),
        };
        self.cleanup(&privileged, handle)
    }

    fn status(&self, name: &str) -> Result<TunnelStatus, TunnelError> {
        let not_found = || TunnelError::InterfaceNotFound {
            name: name.to_owned(),
        };
        if !self.name_file_exists(name)? {
            return Err(not_found());
        }
        let privileged = self.privileged()?;
        let system_name = self.resolve(&privileged, name)?.ok_or_else(not_found)?;
        if !Self::socket_exists(&privileged, &self.socket_path(&system_name))? {
            return Err(not_found());
        }
        let output = privileged.run_checked("wg", &args(["show", system_name.as_str(), "dump"]))?;
        parse_dump(&output.stdout)
    }
}
