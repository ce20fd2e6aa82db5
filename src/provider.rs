//! Termination collaborator.
//!
//! Marketplace clients live outside this crate; the safety nets only need a
//! way to stop billing for an instance when the deadman switch expires.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Boxed future returned by [`InstanceTerminator`] so the trait stays
/// object safe.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Errors reported by a termination collaborator.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// The provider rejected or failed the termination request.
    #[error("failed to terminate {instance_id} on {provider}: {message}")]
    Termination {
        /// Provider name recorded in the session.
        provider: String,
        /// Instance identifier.
        instance_id: String,
        /// Provider supplied message.
        message: String,
    },
}

/// Terminates rented instances on behalf of the safety nets.
pub trait InstanceTerminator: Send + Sync {
    /// Destroys `instance_id` at `provider`. Terminating an instance that is
    /// already gone must succeed.
    fn terminate<'a>(&'a self, provider: &'a str, instance_id: &'a str) -> ProviderFuture<'a, ()>;
}
