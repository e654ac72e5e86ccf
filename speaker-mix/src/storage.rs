//! Storage peripheral
//!
//! Source URIs address files under a mount point (e.g. `/spiffs/song.mp3`).
//! A [`Storage`] implementation maps those URIs onto something the reader
//! element can open. [`FsStorage`] backs the mount point with a local
//! directory.

use crate::error::{Error, Result};
use speaker_common::config::StorageConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Storage peripheral consumed by the reader elements
pub trait Storage: Send + Sync + 'static {
    /// Begin mounting; readiness is observed through [`Storage::is_mounted`]
    fn start(&self) -> Result<()>;

    fn is_mounted(&self) -> bool;

    /// Map a source URI onto a local path
    fn resolve(&self, uri: &str) -> Result<PathBuf>;

    /// Unmount; called once at terminate
    fn stop(&self);
}

/// Mount point backed by a local directory
#[derive(Debug)]
pub struct FsStorage {
    mount_point: String,
    root: PathBuf,
    started: AtomicBool,
}

impl FsStorage {
    pub fn new(mount_point: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let mount_point = mount_point.into().trim_end_matches('/').to_string();
        Self {
            mount_point,
            root: root.into(),
            started: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.mount_point.clone(), config.root.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }
}

impl Storage for FsStorage {
    fn start(&self) -> Result<()> {
        info!(
            "Mounting {} from {}",
            self.mount_point,
            self.root.display()
        );
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_mounted(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.root.is_dir()
    }

    fn resolve(&self, uri: &str) -> Result<PathBuf> {
        let relative = uri
            .strip_prefix(&self.mount_point)
            .filter(|rest| rest.starts_with('/'))
            .map(|rest| rest.trim_start_matches('/'))
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} is not under mount point {}", uri, self.mount_point),
                ))
            })?;

        if relative.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} names the mount point, not a file", uri),
            )));
        }

        Ok(self.root.join(relative))
    }

    fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            info!("Unmounted {}", self.mount_point);
        }
    }
}

/// Wait for `storage` to report mounted
///
/// Checks immediately, then backs off exponentially from `retry_interval_ms`
/// up to `max_retry_interval_ms` between checks. Gives up with
/// [`Error::Init`] after `max_mount_attempts` checks.
pub async fn wait_until_mounted(storage: &dyn Storage, config: &StorageConfig) -> Result<()> {
    let mut delay = Duration::from_millis(config.retry_interval_ms.max(1));
    let max_delay = Duration::from_millis(config.max_retry_interval_ms.max(config.retry_interval_ms));

    for attempt in 1..=config.max_mount_attempts {
        if storage.is_mounted() {
            debug!("Storage mounted after {} check(s)", attempt);
            return Ok(());
        }

        if attempt < config.max_mount_attempts {
            warn!(
                "Storage not mounted yet (attempt {}/{}), retrying in {:?}",
                attempt, config.max_mount_attempts, delay
            );
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(max_delay);
        }
    }

    Err(Error::Init(format!(
        "storage not mounted after {} attempts",
        config.max_mount_attempts
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn quick_config() -> StorageConfig {
        StorageConfig {
            retry_interval_ms: 1,
            max_retry_interval_ms: 4,
            max_mount_attempts: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_strips_mount_point() {
        let storage = FsStorage::new("/spiffs/", "/data/audio");
        assert_eq!(
            storage.resolve("/spiffs/adf_music.mp3").unwrap(),
            PathBuf::from("/data/audio/adf_music.mp3")
        );
        assert_eq!(
            storage.resolve("/spiffs/sub/dir/a.wav").unwrap(),
            PathBuf::from("/data/audio/sub/dir/a.wav")
        );
    }

    #[test]
    fn test_resolve_rejects_foreign_uris() {
        let storage = FsStorage::new("/spiffs", "/data");
        assert!(storage.resolve("/sdcard/a.mp3").is_err());
        assert!(storage.resolve("/spiffsx/a.mp3").is_err());
        assert!(storage.resolve("/spiffs/").is_err());
    }

    #[test]
    fn test_mounted_requires_start_and_directory() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new("/spiffs", dir.path());
        assert!(!storage.is_mounted());

        storage.start().unwrap();
        assert!(storage.is_mounted());

        storage.stop();
        assert!(!storage.is_mounted());
    }

    #[tokio::test]
    async fn test_wait_until_mounted_succeeds() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new("/spiffs", dir.path());
        storage.start().unwrap();

        wait_until_mounted(&storage, &quick_config()).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_until_mounted_gives_up() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new("/spiffs", dir.path().join("missing"));
        storage.start().unwrap();

        let result = wait_until_mounted(&storage, &quick_config()).await;
        assert!(matches!(result, Err(Error::Init(_))));
    }
}
