//! Exclusive advisory lock serializing remediation runs within a town.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::config::CONFIG_DIR;

pub const LOCK_FILE: &str = "doctor.lock";

/// Held for the lifetime of one `doctor --fix` pass. Released on drop.
#[derive(Debug)]
pub struct RemediationLock {
    file: File,
    path: PathBuf,
}

impl RemediationLock {
    /// `<town>/.warden/doctor.lock`.
    pub fn path_for(town_root: &Path) -> PathBuf {
        town_root.join(CONFIG_DIR).join(LOCK_FILE)
    }

    /// Take the town's lock without waiting. Fails if another process
    /// holds it.
    pub fn acquire(town_root: &Path) -> Result<Self> {
        let path = Self::path_for(town_root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    let holder = std::fs::read_to_string(&path).unwrap_or_default();
                    let holder = holder.trim();
                    if holder.is_empty() {
                        bail!("another remediation pass is running ({})", path.display());
                    }
                    bail!(
                        "another remediation pass is running (pid {holder}, {})",
                        path.display()
                    );
                }
                return Err(err).with_context(|| format!("failed to lock {}", path.display()));
            }
        }

        file.set_len(0)
            .with_context(|| format!("failed to truncate {}", path.display()))?;
        record_holder(&file, &path);

        debug!(path = %path.display(), "remediation lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write our pid for the benefit of a refused contender. The lock is held
/// either way, so a failed write only costs that diagnostic.
fn record_holder<W: Write>(mut writer: W, path: &Path) -> bool {
    let written = writer
        .write_all(std::process::id().to_string().as_bytes())
        .and_then(|()| writer.flush());
    match written {
        Ok(()) => true,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "failed to record lock holder");
            false
        }
    }
}

impl Drop for RemediationLock {
    fn drop(&mut self) {
        // The file stays; removing it would let a waiter lock a dead inode.
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_lives_under_town_config_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = RemediationLock::acquire(tmp.path()).unwrap();
        assert_eq!(lock.path(), tmp.path().join(".warden").join("doctor.lock"));
        let contents = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }

    #[cfg(unix)]
    #[test]
    fn second_holder_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let _held = RemediationLock::acquire(tmp.path()).unwrap();
        let err = RemediationLock::acquire(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("another remediation pass is running"));
    }

    struct Unwritable;

    impl Write for Unwritable {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn holder_write_failure_is_reported() {
        let path = Path::new("/town/.warden/doctor.lock");
        assert!(!record_holder(Unwritable, path));

        let mut buf = Vec::new();
        assert!(record_holder(&mut buf, path));
        assert_eq!(buf, std::process::id().to_string().into_bytes());
    }

    #[test]
    fn released_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        drop(RemediationLock::acquire(tmp.path()).unwrap());
        let again = RemediationLock::acquire(tmp.path()).unwrap();
        assert!(again.path().exists());
    }
}
