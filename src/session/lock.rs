//! Cross-process advisory lock on the sibling lock file.

use std::fs::File;
use std::thread::sleep;
use std::time::Duration;

use camino::Utf8Path;
use cap_std::fs::OpenOptions;
use cap_std::fs_utf8::Dir;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use super::SessionError;

/// Bounded retry policy for acquiring the lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LockRetry {
    /// Attempts before giving up with [`SessionError::StateLocked`].
    pub attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl Default for LockRetry {
    fn default() -> Self {
        Self {
            attempts: 20,
            delay: Duration::from_millis(50),
        }
    }
}

/// Exclusive lock held for the duration of one store operation. Released on
/// drop.
#[derive(Debug)]
pub(super) struct LockGuard {
    _flock: Flock<File>,
}

pub(super) fn acquire(
    dir: &Dir,
    lock_path: &Utf8Path,
    file_name: &str,
    retry: LockRetry,
) -> Result<LockGuard, SessionError> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    #[cfg(unix)]
    {
        use cap_std::fs::OpenOptionsExt as _;
        options.mode(0o600);
    }

    let mut file = dir
        .open_with(file_name, &options)
        .map_err(|err| SessionError::io(lock_path, &err))?
        .into_std();

    let attempts = retry.attempts.max(1);
    for attempt in 1..=attempts {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => return Ok(LockGuard { _flock: flock }),
            Err((returned, Errno::EWOULDBLOCK | Errno::EINTR)) => {
                file = returned;
                tracing::debug!(path = %lock_path, attempt, "session lock busy");
                if attempt < attempts {
                    sleep(retry.delay);
                }
            }
            Err((_, errno)) => {
                return Err(SessionError::Io {
                    path: lock_path.to_path_buf(),
                    message: errno.desc().to_owned(),
                });
            }
        }
    }

    Err(SessionError::StateLocked {
        path: lock_path.to_path_buf(),
    })
}
