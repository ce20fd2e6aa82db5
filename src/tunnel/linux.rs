//! Kernel WireGuard strategy driven through `ip` and `wg`.

use std::sync::OnceLock;

use camino::Utf8PathBuf;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandRunner, args};

use super::elevation::{Elevation, Privileged};
use super::endpoint::{TunnelEndpoint, TunnelHandle, TunnelStatus, parse_dump};
use super::keyfile::KeyFile;
use super::{TunnelController, TunnelError};

const TUNNEL_MTU: &str = "1420";

/// Creates kernel `wireguard` links on Linux hosts.
#[derive(Debug)]
pub struct LinuxKernelController<R> {
    runner: R,
    run_dir: Utf8PathBuf,
    elevation: OnceLock<Elevation>,
}

impl<R: CommandRunner> LinuxKernelController<R> {
    /// Creates a controller that detects elevation on first use. Key files
    /// are written under `run_dir`.
    pub fn new(runner: R, run_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            runner,
            run_dir: run_dir.into(),
            elevation: OnceLock::new(),
        }
    }

    /// Creates a controller with a fixed elevation.
    pub fn with_elevation(runner: R, run_dir: impl Into<Utf8PathBuf>, elevation: Elevation) -> Self {
        let controller = Self::new(runner, run_dir);
        controller.elevation.set(elevation).ok();
        controller
    }

    fn privileged(&self) -> Result<Privileged<'_, R>, TunnelError> {
        let elevation = *self
            .elevation
            .get_or_init(|| Elevation::detect(&self.runner));
        Privileged::new(&self.runner, elevation)
    }

    /// Link lookups need no privileges, so absent interfaces are answered
    /// before elevation is requested.
    fn interface_exists(&self, name: &str) -> Result<bool, TunnelError> {
        let output = self.runner.run("ip", &args(["link", "show", "dev", name]))?;
        Ok(output.is_success())
    }

    fn configure(
        &self,
        privileged: &Privileged<'_, R>,
        endpoint: &TunnelEndpoint,
        cancel: &CancellationToken,
    ) -> Result<(), TunnelError> {
        let name = endpoint.interface_name.as_str();

        checkpoint(cancel, name)?;
        {
            let key = KeyFile::write(&self.run_dir, &endpoint.private_key)?;
            privileged.run_checked("wg", &endpoint.wg_set_args(name, key.path()))?;
        }

        checkpoint(cancel, name)?;
        privileged.run_checked(
            "ip",
            &args(["address", "add", endpoint.local_address.as_str(), "dev", name]),
        )?;

        checkpoint(cancel, name)?;
        privileged.run_checked("ip", &args(["link", "set", "mtu", TUNNEL_MTU, "up", "dev", name]))?;

        for network in &endpoint.allowed_ips {
            checkpoint(cancel, name)?;
            privileged.run_checked("ip", &args(["route", "replace", network.as_str(), "dev", name]))?;
        }
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<(), TunnelError> {
        if !self.interface_exists(name)? {
            tracing::debug!(interface = %name, "interface already absent");
            return Ok(());
        }
        let privileged = self.privileged()?;
        privileged.run_checked("ip", &args(["link", "delete", "dev", name]))?;
        tracing::info!(interface = %name, "removed tunnel interface");
        Ok(())
    }
}

impl<R: CommandRunner> TunnelController for LinuxKernelController<R> {
    fn setup(
        &self,
        endpoint: &TunnelEndpoint,
        cancel: &CancellationToken,
    ) -> Result<TunnelHandle, TunnelError> {
        endpoint.validate()?;
        let privileged = self.privileged()?;
        let name = endpoint.interface_name.as_str();

        if self.interface_exists(name)? {
            return Err(TunnelError::InterfaceExists {
                name: name.to_owned(),
            });
        }
        checkpoint(cancel, name)?;

        privileged.run_checked("ip", &args(["link", "add", "dev", name, "type", "wireguard"]))?;

        if let Err(err) = self.configure(&privileged, endpoint, cancel) {
            tracing::warn!(interface = %name, error = %err, "tunnel setup failed; rolling back");
            if let Err(rollback_err) =
                privileged.run_checked("ip", &args(["link", "delete", "dev", name]))
            {
                tracing::error!(interface = %name, error = %rollback_err, "rollback failed");
            }
            return Err(err);
        }

        tracing::info!(
            interface = %name,
            peer = %endpoint.peer_endpoint,
            "tunnel interface is up"
        );
        Ok(TunnelHandle::kernel(name))
    }

    fn teardown(&self, handle: TunnelHandle) -> Result<(), TunnelError> {
        self.teardown_by_name(&handle.system_name)
    }

    fn teardown_by_name(&self, name: &str) -> Result<(), TunnelError> {
        self.delete_link(name)
    }

    fn status(&self, name: &str) -> Result<TunnelStatus, TunnelError> {
        if !self.interface_exists(name)? {
            return Err(TunnelError::InterfaceNotFound {
                name: name.to_owned(),
            });
        }
        let privileged = self.privileged()?;
        let output = privileged.run_checked("wg", &args(["show", name, "dump"]))?;
        parse_dump(&output.stdout)
    }
}

pub(super) fn checkpoint(cancel: &CancellationToken, name: &str) -> Result<(), TunnelError> {
    if cancel.is_cancelled() {
        return Err(TunnelError::Cancelled {
            name: name.to_owned(),
        });
    }
    Ok(())
}
