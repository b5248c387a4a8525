// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable read cursors.
//!
//! Each source records how far it has read under a `(path, labels)` key. The
//! file-backed store keeps the cursors in memory and periodically writes them to
//! a YAML file so that a restarted agent resumes where it left off.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const CURSOR_KEY_PREFIX: &str = "cursor-";

/// Key under which a source identified by `id` (container ID, zone ID) stores
/// its cursor.
pub fn cursor_key(id: &str) -> String {
    format!("{CURSOR_KEY_PREFIX}{id}")
}

#[derive(Debug, thiserror::Error)]
pub enum PositionsError {
    #[error("failed to read positions file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid positions file {path}: {source}")]
    InvalidYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("failed to write positions file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("position {value:?} for {path} is not an integer")]
    InvalidPosition { path: String, value: String },
    #[error("positions sync period must be positive")]
    ZeroSyncPeriod,
}

/// Store of read cursors shared by the sources of a component.
pub trait Positions: Send + Sync + Debug {
    /// Numeric cursor, 0 when nothing was stored.
    fn get(&self, path: &str, labels: &str) -> Result<i64, PositionsError>;
    /// Raw cursor, empty when nothing was stored.
    fn get_string(&self, path: &str, labels: &str) -> String;
    fn put(&self, path: &str, labels: &str, position: i64);
    fn put_string(&self, path: &str, labels: &str, position: &str);
    fn remove(&self, path: &str, labels: &str);
    /// Stops background syncing and persists the current cursors.
    fn stop(&self);
}

#[derive(Debug, Clone)]
pub struct PositionsConfig {
    pub sync_period: Duration,
    pub positions_file: PathBuf,
    /// Start with an empty store instead of failing on a corrupt file.
    pub ignore_invalid_yaml: bool,
    /// Never write the file.
    pub read_only: bool,
}

impl Default for PositionsConfig {
    fn default() -> Self {
        Self {
            sync_period: Duration::from_secs(10),
            positions_file: PathBuf::from("positions.yml"),
            ignore_invalid_yaml: false,
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PositionKey {
    path: String,
    labels: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PositionsFile {
    #[serde(default)]
    positions: Vec<PositionRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PositionRecord {
    path: String,
    labels: String,
    position: String,
}

#[derive(Debug)]
struct Inner {
    config: PositionsConfig,
    positions: Mutex<HashMap<PositionKey, String>>,
    // Serializes writers so the periodic sync and `stop` never race on the temp file.
    write_lock: Mutex<()>,
}

impl Inner {
    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, HashMap<PositionKey, String>> {
        self.positions.lock().expect("lock poisoned")
    }

    fn save(&self) -> Result<(), PositionsError> {
        if self.config.read_only {
            return Ok(());
        }

        let mut records: Vec<PositionRecord> = self
            .lock()
            .iter()
            .map(|(key, position)| PositionRecord {
                path: key.path.clone(),
                labels: key.labels.clone(),
                position: position.clone(),
            })
            .collect();
        records.sort_by(|a, b| (&a.path, &a.labels).cmp(&(&b.path, &b.labels)));

        #[allow(clippy::expect_used)]
        let _guard = self.write_lock.lock().expect("lock poisoned");
        write_positions_file(
            &self.config.positions_file,
            &PositionsFile { positions: records },
        )
    }
}

/// [`Positions`] backed by a YAML file.
#[derive(Debug)]
pub struct FilePositions {
    inner: Arc<Inner>,
    cancel: CancellationToken,
}

impl FilePositions {
    /// Loads the positions file and starts syncing it every `sync_period`.
    ///
    /// Syncing only happens when called from within a tokio runtime; otherwise
    /// cursors are persisted on [`Positions::stop`] only.
    pub fn new(config: PositionsConfig) -> Result<Self, PositionsError> {
        if config.sync_period.is_zero() {
            return Err(PositionsError::ZeroSyncPeriod);
        }
        let positions = match read_positions_file(&config.positions_file) {
            Ok(positions) => positions,
            Err(e @ PositionsError::InvalidYaml { .. }) if config.ignore_invalid_yaml => {
                warn!("POSITIONS | Ignoring corrupt positions file: {e}");
                HashMap::new()
            }
            Err(e) => return Err(e),
        };
        debug!(
            "POSITIONS | Loaded {} positions from {}",
            positions.len(),
            config.positions_file.display()
        );

        let inner = Arc::new(Inner {
            config,
            positions: Mutex::new(positions),
            write_lock: Mutex::new(()),
        });
        let cancel = CancellationToken::new();

        if !inner.config.read_only {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(sync_loop(Arc::clone(&inner), cancel.clone()));
                }
                Err(_) => {
                    warn!("POSITIONS | No async runtime available, positions will only be saved on stop");
                }
            }
        }

        Ok(Self { inner, cancel })
    }
}

async fn sync_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.sync_period);
    ticker.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = inner.save() {
                    error!("POSITIONS | Error writing positions file: {e}");
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

impl Positions for FilePositions {
    fn get(&self, path: &str, labels: &str) -> Result<i64, PositionsError> {
        let value = self.get_string(path, labels);
        if value.is_empty() {
            return Ok(0);
        }
        value
            .parse::<i64>()
            .map_err(|_| PositionsError::InvalidPosition {
                path: path.to_string(),
                value,
            })
    }

    fn get_string(&self, path: &str, labels: &str) -> String {
        self.inner
            .lock()
            .get(&PositionKey {
                path: path.to_string(),
                labels: labels.to_string(),
            })
            .cloned()
            .unwrap_or_default()
    }

    fn put(&self, path: &str, labels: &str, position: i64) {
        self.put_string(path, labels, &position.to_string());
    }

    fn put_string(&self, path: &str, labels: &str, position: &str) {
        self.inner.lock().insert(
            PositionKey {
                path: path.to_string(),
                labels: labels.to_string(),
            },
            position.to_string(),
        );
    }

    fn remove(&self, path: &str, labels: &str) {
        self.inner.lock().remove(&PositionKey {
            path: path.to_string(),
            labels: labels.to_string(),
        });
    }

    fn stop(&self) {
        self.cancel.cancel();
        if let Err(e) = self.inner.save() {
            error!("POSITIONS | Error writing positions file on stop: {e}");
        }
    }
}

impl Drop for FilePositions {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// [`Positions`] that forgets everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopPositions;

impl Positions for NopPositions {
    fn get(&self, _path: &str, _labels: &str) -> Result<i64, PositionsError> {
        Ok(0)
    }

    fn get_string(&self, _path: &str, _labels: &str) -> String {
        String::new()
    }

    fn put(&self, _path: &str, _labels: &str, _position: i64) {}

    fn put_string(&self, _path: &str, _labels: &str, _position: &str) {}

    fn remove(&self, _path: &str, _labels: &str) {}

    fn stop(&self) {}
}

fn read_positions_file(path: &Path) -> Result<HashMap<PositionKey, String>, PositionsError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(source) => {
            return Err(PositionsError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if contents.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let file: PositionsFile =
        serde_yaml::from_str(&contents).map_err(|source| PositionsError::InvalidYaml {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(file
        .positions
        .into_iter()
        .map(|record| {
            (
                PositionKey {
                    path: record.path,
                    labels: record.labels,
                },
                record.position,
            )
        })
        .collect())
}

fn write_positions_file(path: &Path, file: &PositionsFile) -> Result<(), PositionsError> {
    let write_err = |source| PositionsError::Write {
        path: path.to_path_buf(),
        source,
    };

    let contents = serde_yaml::to_string(file)
        .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents).map_err(write_err)?;
    std::fs::rename(&tmp, path).map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> PositionsConfig {
        PositionsConfig {
            sync_period: Duration::from_secs(10),
            positions_file: dir.join("positions.yml"),
            ignore_invalid_yaml: false,
            read_only: false,
        }
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let positions = FilePositions::new(config(dir.path())).unwrap();
        let key = cursor_key("abc");

        assert_eq!(positions.get(&key, "{}").unwrap(), 0);
        assert_eq!(positions.get_string(&key, "{}"), "");

        positions.put(&key, "{}", 42);
        assert_eq!(positions.get(&key, "{}").unwrap(), 42);
        assert_eq!(positions.get_string(&key, "{}"), "42");
        assert_eq!(positions.get(&key, r#"{job="x"}"#).unwrap(), 0);

        positions.remove(&key, "{}");
        assert_eq!(positions.get(&key, "{}").unwrap(), 0);
        positions.stop();
    }

    #[tokio::test]
    async fn test_stop_persists_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let positions = FilePositions::new(config(dir.path())).unwrap();
        positions.put(&cursor_key("zone"), r#"{job="cloudflare"}"#, 1_000_000_000);
        positions.put_string(&cursor_key("file"), "{}", "opaque");
        positions.stop();

        let reloaded = FilePositions::new(config(dir.path())).unwrap();
        assert_eq!(
            reloaded
                .get(&cursor_key("zone"), r#"{job="cloudflare"}"#)
                .unwrap(),
            1_000_000_000
        );
        assert_eq!(reloaded.get_string(&cursor_key("file"), "{}"), "opaque");
        assert!(matches!(
            reloaded.get(&cursor_key("file"), "{}"),
            Err(PositionsError::InvalidPosition { .. })
        ));
        reloaded.stop();
    }

    #[tokio::test]
    async fn test_periodic_sync() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.sync_period = Duration::from_millis(20);
        let positions = FilePositions::new(cfg.clone()).unwrap();
        positions.put(&cursor_key("abc"), "{}", 7);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let contents = std::fs::read_to_string(&cfg.positions_file).unwrap();
        assert!(contents.contains("cursor-abc"));
        positions.stop();
    }

    #[test]
    fn test_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        std::fs::write(&cfg.positions_file, "positions: [not, {valid").unwrap();

        assert!(matches!(
            FilePositions::new(cfg.clone()),
            Err(PositionsError::InvalidYaml { .. })
        ));

        cfg.ignore_invalid_yaml = true;
        let positions = FilePositions::new(cfg).unwrap();
        assert_eq!(positions.get("anything", "{}").unwrap(), 0);
    }

    #[test]
    fn test_zero_sync_period_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.sync_period = Duration::ZERO;
        assert!(matches!(
            FilePositions::new(cfg),
            Err(PositionsError::ZeroSyncPeriod)
        ));
    }

    #[test]
    fn test_read_only_never_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.read_only = true;
        let positions = FilePositions::new(cfg.clone()).unwrap();
        positions.put("a", "{}", 1);
        positions.stop();
        assert!(!cfg.positions_file.exists());
    }

    #[test]
    fn test_nop_positions() {
        let positions = NopPositions;
        positions.put("a", "{}", 1);
        assert_eq!(positions.get("a", "{}").unwrap(), 0);
    }
}
