//! File change watcher.
//!
//! Tracks a fingerprint per watched path. Size and modification time are
//! compared first; the file is only re-hashed when they differ, so an idle
//! check costs one `stat`.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::events::FileChange;
use crate::database::time::datetime_to_ms;
use crate::{Error, Result};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// File watcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub paths: Vec<PathBuf>,
    pub check_interval_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            check_interval_secs: 60,
        }
    }
}

impl WatcherConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Last observed state of a watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
    pub size: u64,
    pub modified: Option<SystemTime>,
    /// Hex SHA-256 of the content.
    pub content_hash: String,
    /// Modification time when `content_hash` was first observed. A touch that
    /// keeps the content leaves it unchanged.
    pub changed_at: Option<SystemTime>,
    /// Whether the current content has been broadcast.
    pub notified: bool,
}

/// Watches a fixed set of files for content changes.
pub struct FileChangeWatcher {
    paths: Vec<PathBuf>,
    fingerprints: DashMap<PathBuf, FileFingerprint>,
}

impl FileChangeWatcher {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            fingerprints: DashMap::new(),
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Whether the content of `path` changed since the previous call.
    ///
    /// The first observation records a baseline and returns `false`. A content
    /// change returns `true` exactly once and marks the file pending. An
    /// unreadable file logs a warning and counts as unchanged.
    pub async fn check_changed(&self, path: &Path) -> bool {
        match self.observe(path).await {
            Ok(changed) => changed,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Watched file unreadable");
                false
            }
        }
    }

    async fn observe(&self, path: &Path) -> Result<bool> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::io_path("reading metadata", path, e))?;
        let size = metadata.len();
        let modified = metadata.modified().ok();

        let previous = self.fingerprints.get(path).map(|f| f.clone());
        let Some(previous) = previous else {
            let content_hash = hash_file(path).await?;
            debug!(path = %path.display(), hash = %content_hash, "Recorded file baseline");
            self.fingerprints.insert(
                path.to_path_buf(),
                FileFingerprint {
                    size,
                    modified,
                    content_hash,
                    changed_at: modified,
                    notified: true,
                },
            );
            return Ok(false);
        };

        if previous.size == size && previous.modified == modified {
            return Ok(false);
        }

        let content_hash = hash_file(path).await?;
        let changed = content_hash != previous.content_hash;
        if changed {
            info!(path = %path.display(), hash = %content_hash, "Watched file content changed");
        }
        self.fingerprints.insert(
            path.to_path_buf(),
            FileFingerprint {
                size,
                modified,
                notified: previous.notified && !changed,
                changed_at: if changed { modified } else { previous.changed_at },
                content_hash,
            },
        );
        Ok(changed)
    }

    /// Whether the current content of `path` still awaits a broadcast.
    pub fn is_pending(&self, path: &Path) -> bool {
        self.fingerprints
            .get(path)
            .is_some_and(|f| !f.notified)
    }

    /// The change event for the current content of `path`, if it is pending.
    pub fn pending_change(&self, path: &Path) -> Option<FileChange> {
        self.fingerprints
            .get(path)
            .filter(|f| !f.notified)
            .map(|f| FileChange {
                path: path.to_path_buf(),
                content_hash: f.content_hash.clone(),
                changed_at_ms: f.changed_at.map(system_time_to_ms),
            })
    }

    /// Mark the broadcast of `change` as done. Ignored when the file changed
    /// again in the meantime.
    pub fn mark_notified(&self, path: &Path, change: &FileChange) {
        if let Some(mut fingerprint) = self.fingerprints.get_mut(path)
            && fingerprint.content_hash == change.content_hash
            && fingerprint.changed_at.map(system_time_to_ms) == change.changed_at_ms
        {
            fingerprint.notified = true;
        }
    }

    pub fn fingerprint(&self, path: &Path) -> Option<FileFingerprint> {
        self.fingerprints.get(path).map(|f| f.clone())
    }
}

fn system_time_to_ms(time: SystemTime) -> i64 {
    datetime_to_ms(DateTime::<Utc>::from(time))
}

/// Hex SHA-256 of a file, streamed.
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::io_path("opening", path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| Error::io_path("reading", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn write(path: &Path, content: &[u8], mtime_offset_secs: u64) {
        let mut file = File::create(path).unwrap();
        file.write_all(content).unwrap();
        // Coarse filesystem timestamps: force a distinct mtime per write
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + mtime_offset_secs))
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_observation_is_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.xlsx");
        write(&path, b"v1", 0);

        let watcher = FileChangeWatcher::new(vec![path.clone()]);
        assert!(!watcher.check_changed(&path).await);
        assert!(!watcher.is_pending(&path));
        assert!(!watcher.check_changed(&path).await);
    }

    #[tokio::test]
    async fn test_change_reported_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.xlsx");
        write(&path, b"v1", 0);

        let watcher = FileChangeWatcher::new(vec![path.clone()]);
        watcher.check_changed(&path).await;

        write(&path, b"version 2", 10);
        assert!(watcher.check_changed(&path).await);
        assert!(!watcher.check_changed(&path).await);
        assert!(watcher.is_pending(&path));

        let change = watcher.pending_change(&path).unwrap();
        assert_eq!(change.content_hash.len(), 64);
        assert_eq!(change.changed_at_ms, Some(1_700_000_010_000));
        watcher.mark_notified(&path, &change);
        assert!(!watcher.is_pending(&path));
        assert!(watcher.pending_change(&path).is_none());
    }

    #[tokio::test]
    async fn test_touch_without_content_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.xlsx");
        write(&path, b"same", 0);

        let watcher = FileChangeWatcher::new(vec![path.clone()]);
        watcher.check_changed(&path).await;
        write(&path, b"same", 20);

        assert!(!watcher.check_changed(&path).await);
        assert_eq!(
            watcher.fingerprint(&path).unwrap().modified,
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_020))
        );
    }

    #[tokio::test]
    async fn test_stale_mark_notified_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.xlsx");
        write(&path, b"v1", 0);

        let watcher = FileChangeWatcher::new(vec![path.clone()]);
        watcher.check_changed(&path).await;
        write(&path, b"v2", 10);
        watcher.check_changed(&path).await;
        let stale = watcher.pending_change(&path).unwrap();

        write(&path, b"v3 longer", 20);
        assert!(watcher.check_changed(&path).await);
        watcher.mark_notified(&path, &stale);
        assert!(watcher.is_pending(&path));
    }

    #[tokio::test]
    async fn test_reverted_content_is_a_new_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.xlsx");
        write(&path, b"v1", 0);

        let watcher = FileChangeWatcher::new(vec![path.clone()]);
        watcher.check_changed(&path).await;

        write(&path, b"v2 longer", 10);
        assert!(watcher.check_changed(&path).await);
        let to_v2 = watcher.pending_change(&path).unwrap();
        watcher.mark_notified(&path, &to_v2);

        write(&path, b"v1", 20);
        assert!(watcher.check_changed(&path).await);
        let back_to_v1 = watcher.pending_change(&path).unwrap();
        watcher.mark_notified(&path, &back_to_v1);

        write(&path, b"v2 longer", 30);
        assert!(watcher.check_changed(&path).await);
        let to_v2_again = watcher.pending_change(&path).unwrap();

        assert_eq!(to_v2.content_hash, to_v2_again.content_hash);
        assert_ne!(to_v2.ledger_entity_key(), to_v2_again.ledger_entity_key());
    }

    #[tokio::test]
    async fn test_touch_while_pending_keeps_change_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.xlsx");
        write(&path, b"v1", 0);

        let watcher = FileChangeWatcher::new(vec![path.clone()]);
        watcher.check_changed(&path).await;
        write(&path, b"v2 longer", 10);
        watcher.check_changed(&path).await;
        let before = watcher.pending_change(&path).unwrap();

        write(&path, b"v2 longer", 40);
        assert!(!watcher.check_changed(&path).await);
        let after = watcher.pending_change(&path).unwrap();
        assert_eq!(before, after);

        watcher.mark_notified(&path, &before);
        assert!(!watcher.is_pending(&path));
    }

    #[tokio::test]
    async fn test_missing_file_counts_as_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.pdf");
        let watcher = FileChangeWatcher::new(vec![path.clone()]);
        assert!(!watcher.check_changed(&path).await);
        assert!(watcher.fingerprint(&path).is_none());
    }
}
