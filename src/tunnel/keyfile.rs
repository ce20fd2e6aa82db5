//! Owner-only temporary key files handed to `wg set ... private-key`.

use std::io::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::OpenOptions;
use cap_std::{ambient_authority, fs_utf8::Dir};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::TunnelError;

/// A private key written to disk for the lifetime of one `wg set` call.
/// The file is removed on drop.
#[derive(Debug)]
pub(crate) struct KeyFile {
    path: Utf8PathBuf,
}

impl KeyFile {
    pub(crate) fn write(run_dir: &Utf8Path, private_key: &str) -> Result<Self, TunnelError> {
        let dir = open_run_dir(run_dir)?;

        let name = format!("key-{}", Uuid::new_v4().simple());
        let path = run_dir.join(&name);

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use cap_std::fs::OpenOptionsExt as _;
            options.mode(0o600);
        }

        let contents = Zeroizing::new(format!("{private_key}\n"));
        let result = dir.open_with(&name, &options).and_then(|mut file| {
            file.write_all(contents.as_bytes())?;
            file.sync_all()
        });
        if let Err(err) = result {
            dir.remove_file(&name).ok();
            return Err(TunnelError::io(&path, &err));
        }
        Ok(Self { path })
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }
}

/// Creates (if needed) and opens the directory holding tunnel runtime files.
pub(crate) fn open_run_dir(run_dir: &Utf8Path) -> Result<Dir, TunnelError> {
    Dir::create_ambient_dir_all(run_dir, ambient_authority())
        .map_err(|err| TunnelError::io(run_dir, &err))?;
    Dir::open_ambient_dir(run_dir, ambient_authority()).map_err(|err| TunnelError::io(run_dir, &err))
}

impl Drop for KeyFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path, error = %err, "failed to remove key file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn key_file_is_owner_only_and_removed_on_drop() {
        use std::os::unix::fs::PermissionsExt as _;

        let tmp = TempDir::new().expect("tempdir");
        let run_dir = Utf8Path::from_path(tmp.path()).expect("utf8 path");

        let key = KeyFile::write(run_dir, "c2VjcmV0").expect("write key file");
        let path = key.path().to_path_buf();
        let metadata = std::fs::metadata(&path).expect("metadata");
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "c2VjcmV0\n");

        drop(key);
        assert!(!path.exists());
    }
}
