//! Working directories and socket paths.
//!
//! Each envelope owns one temporary directory holding its two Unix-domain
//! sockets. The directory is owner-only (`0o700`) and is removed when
//! `serve` returns; a process-wide exit hook also removes any registered
//! directories if the process is torn down by SIGINT/SIGTERM first.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tokio::signal::unix::{SignalKind, signal};
use tracing::warn;
use uuid::Uuid;

use crate::error::EnvelopeError;

/// Create a fresh owner-only temporary directory for envelope sockets.
///
/// The caller is responsible for removing the directory when done.
///
/// # Errors
///
/// Returns [`EnvelopeError::StartFailed`] if the directory cannot be
/// created or restricted to `0o700`.
pub fn new_tmp_dir() -> Result<PathBuf, EnvelopeError> {
    use std::os::unix::fs::PermissionsExt;

    let dir = std::env::temp_dir().join(format!("warden-{}", Uuid::new_v4()));
    std::fs::create_dir(&dir)
        .map_err(|e| EnvelopeError::StartFailed(format!("create tmp dir: {e}")))?;
    if let Err(e) = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)) {
        let _ = std::fs::remove_dir(&dir);
        return Err(EnvelopeError::StartFailed(format!(
            "restrict tmp dir permissions: {e}"
        )));
    }
    Ok(dir)
}

/// Allocate a unique socket path inside `dir`.
///
/// The path stays short: Unix socket paths are limited to roughly 100
/// bytes on common platforms.
#[must_use]
pub fn socket_path(dir: &Path) -> PathBuf {
    let id = Uuid::new_v4().simple().to_string();
    dir.join(format!("{}.sock", &id[..12]))
}

/// Default directory for deployer log storage:
/// `$TMPDIR/warden/logs`.
#[must_use]
pub fn default_logs_dir() -> PathBuf {
    std::env::temp_dir().join("warden").join("logs")
}

/// Default directory for deployer data: `$XDG_DATA_HOME/warden`, falling
/// back to `~/.local/share/warden`.
///
/// The directory is created (owner-only) if missing.
///
/// # Errors
///
/// Returns [`EnvelopeError::StartFailed`] if no home directory can be
/// determined or the directory cannot be created.
pub fn default_data_dir() -> Result<PathBuf, EnvelopeError> {
    use std::os::unix::fs::PermissionsExt;

    let base = match std::env::var_os("XDG_DATA_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var_os("HOME").ok_or_else(|| {
                EnvelopeError::StartFailed("cannot determine home directory".to_string())
            })?;
            PathBuf::from(home).join(".local").join("share")
        }
    };
    let dir = base.join("warden");
    std::fs::create_dir_all(&dir)
        .map_err(|e| EnvelopeError::StartFailed(format!("create data dir: {e}")))?;
    let _ = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700));
    Ok(dir)
}

static EXIT_CLEANUP: OnceLock<Mutex<Vec<PathBuf>>> = OnceLock::new();

/// Register a directory for removal if the process receives SIGINT or
/// SIGTERM before its envelopes shut down normally.
///
/// The first call installs a signal watcher; it runs the registered
/// removals and then re-exits with the conventional signal exit code. Must
/// be called from within a tokio runtime.
pub fn remove_on_exit_signal(dir: &Path) {
    let registry = EXIT_CLEANUP.get_or_init(|| {
        tokio::spawn(async {
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to register SIGTERM");
            let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

            let signo = tokio::select! {
                _ = sigterm.recv() => SignalKind::terminate().as_raw_value(),
                _ = sigint.recv() => SignalKind::interrupt().as_raw_value(),
            };

            if let Some(registry) = EXIT_CLEANUP.get() {
                let dirs = std::mem::take(&mut *registry.lock().expect("cleanup registry poisoned"));
                for dir in dirs {
                    if let Err(e) = std::fs::remove_dir_all(&dir) {
                        warn!(dir = %dir.display(), error = %e, "exit cleanup failed");
                    }
                }
            }
            std::process::exit(128 + signo);
        });
        Mutex::new(Vec::new())
    });
    registry
        .lock()
        .expect("cleanup registry poisoned")
        .push(dir.to_path_buf());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tmp_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = new_tmp_dir().unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_socket_paths_are_unique() {
        let dir = PathBuf::from("/tmp/x");
        let a = socket_path(&dir);
        let b = socket_path(&dir);
        assert_ne!(a, b);
        assert!(a.extension().is_some_and(|e| e == "sock"));
        assert!(a.to_string_lossy().len() < 100);
    }

    #[test]
    fn test_default_logs_dir_under_tmp() {
        let dir = default_logs_dir();
        assert!(dir.ends_with("warden/logs"));
    }
}
