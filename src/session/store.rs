//! File-backed implementation of the session store.

use std::io::{self, Write as _};
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::OpenOptions;
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::lock::{self, LockRetry};
use super::model::{CURRENT_VERSION, SessionState};
use super::SessionError;

/// File name of the session record inside the state directory.
pub const STATE_FILE_NAME: &str = "session.json";

/// File name of the coordination lock inside the state directory.
pub const LOCK_FILE_NAME: &str = "session.lock";

/// Durable, locked session record for one working directory.
///
/// Clones share the in-process mutex, so concurrent mutators issued through
/// clones of one store never interleave.
#[derive(Clone, Debug)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    dir: Utf8PathBuf,
    retry: LockRetry,
    mutex: Mutex<()>,
}

impl SessionStore {
    /// Creates a store rooted at `dir`. No file system access happens until
    /// the first operation.
    #[must_use]
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self::with_lock_retry(dir, LockRetry::default())
    }

    /// Creates a store with an explicit lock retry policy.
    #[must_use]
    pub fn with_lock_retry(dir: impl Into<Utf8PathBuf>, retry: LockRetry) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                dir: dir.into(),
                retry,
                mutex: Mutex::new(()),
            }),
        }
    }

    /// Directory holding the state and lock files.
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.inner.dir
    }

    /// Path of the session record.
    #[must_use]
    pub fn state_path(&self) -> Utf8PathBuf {
        self.inner.dir.join(STATE_FILE_NAME)
    }

    /// Path of the sibling lock file.
    #[must_use]
    pub fn lock_path(&self) -> Utf8PathBuf {
        self.inner.dir.join(LOCK_FILE_NAME)
    }

    /// Loads the current session. A missing or empty file means "no active
    /// session".
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::StateCorrupt`] when the file holds malformed
    /// JSON, [`SessionError::StateLocked`] when the lock stays busy, or
    /// [`SessionError::Io`] on file system failures.
    pub fn load(&self) -> Result<Option<SessionState>, SessionError> {
        if !self.inner.dir.is_dir() {
            return Ok(None);
        }
        self.locked(|dir| self.read_state(dir))
    }

    /// Atomically replaces the session record. A zero version is replaced by
    /// [`CURRENT_VERSION`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::MissingState`] when `state` is `None`, plus
    /// the lock and I/O errors of [`SessionStore::load`].
    pub fn save<'a>(
        &self,
        state: impl Into<Option<&'a SessionState>>,
    ) -> Result<(), SessionError> {
        let Some(state) = state.into() else {
            return Err(SessionError::MissingState);
        };
        let mut owned = state.clone();
        if owned.version == 0 {
            owned.version = CURRENT_VERSION;
        }
        self.locked(|dir| self.write_state(dir, &owned))
    }

    /// Removes the session record. Removing an absent record succeeds.
    ///
    /// # Errors
    ///
    /// Returns lock or I/O errors.
    pub fn clear(&self) -> Result<(), SessionError> {
        if !self.inner.dir.is_dir() {
            return Ok(());
        }
        self.locked(|dir| match dir.remove_file(STATE_FILE_NAME) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SessionError::io(&self.state_path(), &err)),
        })
    }

    /// Records the accumulated cost.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoActiveInstance`] when there is no session,
    /// instance, or cost record.
    pub fn update_cost(&self, accumulated: f64) -> Result<SessionState, SessionError> {
        self.mutate(|state| {
            let cost = state.cost.as_mut().ok_or_else(|| {
                SessionError::NoActiveInstance(String::from("session has no cost record"))
            })?;
            cost.accumulated = accumulated;
            Ok(())
        })
    }

    /// Records a heartbeat at the current time.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoActiveInstance`] when there is no session,
    /// instance, or deadman record.
    pub fn update_heartbeat(&self) -> Result<SessionState, SessionError> {
        self.update_heartbeat_at(Utc::now())
    }

    /// Records a heartbeat at `now`.
    ///
    /// # Errors
    ///
    /// See [`SessionStore::update_heartbeat`].
    pub fn update_heartbeat_at(&self, now: DateTime<Utc>) -> Result<SessionState, SessionError> {
        self.mutate(|state| {
            let deadman = state.deadman.as_mut().ok_or_else(|| {
                SessionError::NoActiveInstance(String::from("session has no deadman record"))
            })?;
            deadman.last_heartbeat = now;
            Ok(())
        })
    }

    /// Records the model deployment status.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoActiveInstance`] when there is no session,
    /// instance, or model record.
    pub fn update_model_status(
        &self,
        status: impl Into<String>,
    ) -> Result<SessionState, SessionError> {
        let status_value = status.into();
        self.mutate(|state| {
            let model = state.model.as_mut().ok_or_else(|| {
                SessionError::NoActiveInstance(String::from("session has no model record"))
            })?;
            model.status = status_value;
            Ok(())
        })
    }

    fn mutate<F>(&self, apply: F) -> Result<SessionState, SessionError>
    where
        F: FnOnce(&mut SessionState) -> Result<(), SessionError>,
    {
        if !self.inner.dir.is_dir() {
            return Err(SessionError::NoActiveInstance(String::from(
                "no session has been recorded",
            )));
        }

        self.locked(|dir| {
            let mut state = self.read_state(dir)?.ok_or_else(|| {
                SessionError::NoActiveInstance(String::from("no session has been recorded"))
            })?;
            if state.instance.is_none() {
                return Err(SessionError::NoActiveInstance(String::from(
                    "session has no instance",
                )));
            }
            apply(&mut state)?;
            if state.version == 0 {
                state.version = CURRENT_VERSION;
            }
            self.write_state(dir, &state)?;
            Ok(state)
        })
    }

    fn locked<T, F>(&self, op: F) -> Result<T, SessionError>
    where
        F: FnOnce(&Dir) -> Result<T, SessionError>,
    {
        let _guard = self
            .inner
            .mutex
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let dir = self.open_dir()?;
        let _lock = lock::acquire(&dir, &self.lock_path(), LOCK_FILE_NAME, self.inner.retry)?;
        op(&dir)
    }

    fn open_dir(&self) -> Result<Dir, SessionError> {
        Dir::create_ambient_dir_all(&self.inner.dir, ambient_authority())
            .map_err(|err| SessionError::io(&self.inner.dir, &err))?;
        Dir::open_ambient_dir(&self.inner.dir, ambient_authority())
            .map_err(|err| SessionError::io(&self.inner.dir, &err))
    }

    fn read_state(&self, dir: &Dir) -> Result<Option<SessionState>, SessionError> {
        let contents = match dir.read_to_string(STATE_FILE_NAME) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(SessionError::io(&self.state_path(), &err)),
        };

        if contents.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| SessionError::StateCorrupt {
                path: self.state_path(),
                message: err.to_string(),
            })
    }

    fn write_state(&self, dir: &Dir, state: &SessionState) -> Result<(), SessionError> {
        let rendered = serde_json::to_vec_pretty(state)
            .map_err(|err| SessionError::Serialize(err.to_string()))?;

        let tmp_name = format!(".{STATE_FILE_NAME}.{}.tmp", Uuid::new_v4().simple());
        let tmp_path = self.inner.dir.join(&tmp_name);

        let result = write_owner_only(dir, &tmp_name, &rendered)
            .map_err(|err| SessionError::io(&tmp_path, &err))
            .and_then(|()| {
                dir.rename(&tmp_name, dir, STATE_FILE_NAME)
                    .map_err(|err| SessionError::io(&self.state_path(), &err))
            });

        if result.is_err() {
            dir.remove_file(&tmp_name).ok();
        }
        result
    }
}

fn write_owner_only(dir: &Dir, name: &str, contents: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use cap_std::fs::OpenOptionsExt as _;
        options.mode(0o600);
    }

    let mut file = dir.open_with(name, &options)?;
    file.write_all(contents)?;
    file.sync_all()
}
