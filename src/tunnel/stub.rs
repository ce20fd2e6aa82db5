//! Placeholder strategy for hosts without tunnel support.

use tokio_util::sync::CancellationToken;

use super::endpoint::{TunnelEndpoint, TunnelHandle, TunnelStatus};
use super::{TunnelController, TunnelError};

/// Controller for hosts that are not a supported tunnel target.
#[derive(Clone, Debug, Default)]
pub struct StubController {
    platform: String,
}

impl StubController {
    /// Creates a stub that names the build target in its errors.
    #[must_use]
    pub fn new() -> Self {
        Self {
            platform: std::env::consts::OS.to_owned(),
        }
    }
}

impl TunnelController for StubController {
    fn setup(
        &self,
        _endpoint: &TunnelEndpoint,
        _cancel: &CancellationToken,
    ) -> Result<TunnelHandle, TunnelError> {
        Err(TunnelError::Unsupported {
            platform: self.platform.clone(),
        })
    }

    fn teardown(&self, _handle: TunnelHandle) -> Result<(), TunnelError> {
        Ok(())
    }

    fn teardown_by_name(&self, _name: &str) -> Result<(), TunnelError> {
        Ok(())
    }

    fn status(&self, name: &str) -> Result<TunnelStatus, TunnelError> {
        Err(TunnelError::InterfaceNotFound {
            name: name.to_owned(),
        })
    }
}
