//! Transient credential file for `--auth-user-pass`.
//!
//! The tunnel client reads a two-line file (username, password). The file
//! lives in the OS temp directory for the lifetime of one session and is
//! removed on stop, on drop, or before the next session starts.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const FILE_PREFIX: &str = "ovpn-split-auth-";

const MAX_NAME_ATTEMPTS: u128 = 1000;

/// Owned credential file; deleted when dropped
#[derive(Debug)]
pub struct CredentialFile {
    path: PathBuf,
    removed: bool,
}

impl CredentialFile {
    /// Write credentials into the system temp directory
    pub fn create(username: &str, password: &str) -> std::io::Result<Self> {
        Self::create_in(&std::env::temp_dir(), username, password)
    }

    /// Write credentials into `dir`
    pub fn create_in(dir: &Path, username: &str, password: &str) -> std::io::Result<Self> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        // names are millisecond stamps; step forward past any taken slot
        let mut attempt = 0;
        let (path, mut file) = loop {
            let path = dir.join(format!("{FILE_PREFIX}{}.txt", millis + attempt));
            match options.open(&path) {
                Ok(file) => break (path, file),
                Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };
        write!(file, "{}\n{}", username.trim(), password)?;
        file.flush()?;

        debug!(path = %path.display(), "Wrote credential file");
        Ok(Self {
            path,
            removed: false,
        })
    }

    /// Credentials are only written when a username is given with a password
    pub fn wanted(username: Option<&str>, password: Option<&str>) -> bool {
        matches!((username, password), (Some(u), Some(_)) if !u.trim().is_empty())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file now; missing files are not an error
    pub fn remove(&mut self) -> std::io::Result<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for CredentialFile {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(path = %self.path.display(), "Failed to remove credential file: {}", e);
        }
    }
}
