//! Per-phone session persistence.
//!
//! The session blob is owned by the protocol library; we only pick the
//! file location, test validity (exists and non-empty), and delete it on
//! an explicit clear. The transport writes updates autonomously through
//! the storage handle as auth progresses.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use grammers_session::storages::SqliteSession;

use crate::error::{Error, Result};

pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn session_path(&self, phone: &str) -> PathBuf {
        self.dir.join(format!("session_{phone}.json"))
    }

    /// A session is considered valid when its file exists and is
    /// non-empty; the content itself is opaque.
    pub fn has_valid_session(&self, phone: &str) -> bool {
        std::fs::metadata(self.session_path(phone))
            .map(|meta| meta.len() > 0)
            .unwrap_or(false)
    }

    /// Open (or create) the storage handle handed to the transport.
    pub fn open(&self, phone: &str) -> Result<Arc<SqliteSession>> {
        ensure_dir_sync(&self.dir)?;
        let path = self.session_path(phone);
        let session = SqliteSession::open(&path)
            .map_err(|e| Error::Config(format!("open session {}: {e}", path.display())))?;
        log::debug!("using session file: {}", path.display());
        Ok(Arc::new(session))
    }

    /// Delete the session file. A missing file is not an error.
    pub fn clear(&self, phone: &str) -> Result<()> {
        let path = self.session_path(phone);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                log::info!("cleared session file: {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::fs("remove", path, e)),
        }
    }
}

fn ensure_dir_sync(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| Error::fs("mkdir", dir, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_requires_existing_non_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        assert!(!store.has_valid_session("+1000"));

        std::fs::write(store.session_path("+1000"), b"").unwrap();
        assert!(!store.has_valid_session("+1000"));

        std::fs::write(store.session_path("+1000"), b"blob").unwrap();
        assert!(store.has_valid_session("+1000"));
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        std::fs::write(store.session_path("+1000"), b"blob").unwrap();
        store.clear("+1000").unwrap();
        assert!(!store.has_valid_session("+1000"));
        // Absent file is not an error.
        store.clear("+1000").unwrap();
    }

    #[test]
    fn session_file_is_keyed_by_phone() {
        let store = SessionStore::new("/tmp/sessions");
        assert_eq!(
            store.session_path("+15550001111"),
            Path::new("/tmp/sessions/session_+15550001111.json"),
        );
    }
}
