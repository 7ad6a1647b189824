//! Rule file hot reload.
//!
//! Polls the rule file's modification time and length. A change triggers a
//! reload into the shared [`RuleStore`]; a file that fails to parse or compile
//! leaves the previous rules active.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use mocker_proxy::RuleStore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::rules_file::{load_rules, RulesFileError};

/// Default polling interval.
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

/// Reloads a rule file into a [`RuleStore`] when it changes.
#[derive(Debug)]
pub struct RuleFileWatcher {
    path: PathBuf,
    store: Arc<RuleStore>,
    interval: Duration,
    last_seen: Option<Fingerprint>,
}

impl RuleFileWatcher {
    /// Creates a watcher for `path`.
    pub fn new(path: impl AsRef<Path>, store: Arc<RuleStore>, interval: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            store,
            interval,
            last_seen: None,
        }
    }

    /// The watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the file now, returning the number of compiled entries.
    pub fn load_now(&mut self) -> Result<usize, RulesFileError> {
        self.last_seen = self.fingerprint();
        let root = load_rules(&self.path)?;
        Ok(self.store.reload(root)?)
    }

    /// Reloads if the file changed since the last look. Returns whether new
    /// rules were installed.
    pub fn poll(&mut self) -> bool {
        let current = self.fingerprint();
        if current == self.last_seen {
            return false;
        }
        self.last_seen = current;

        if current.is_none() {
            debug!("Rule file {} is gone, keeping rules", self.path.display());
            return false;
        }

        info!("Reloading rules from {}", self.path.display());
        match load_rules(&self.path) {
            Ok(root) => self.store.reload(root).is_ok(),
            Err(e) => {
                error!("Failed to reload {}: {}", self.path.display(), e);
                false
            }
        }
    }

    /// Polls in the background until the task is aborted.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.poll();
            }
        })
    }

    fn fingerprint(&self) -> Option<Fingerprint> {
        let metadata = std::fs::metadata(&self.path).ok()?;
        Some(Fingerprint {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn watcher(dir: &TempDir) -> (RuleFileWatcher, Arc<RuleStore>) {
        let store = Arc::new(RuleStore::default());
        let watcher = RuleFileWatcher::new(
            dir.path().join("rules.json"),
            store.clone(),
            Duration::from_millis(10),
        );
        (watcher, store)
    }

    #[test]
    fn initial_load() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("rules.json"),
            r#"["/a", {"respond": {"body": "a"}}]"#,
        )
        .unwrap();

        let (mut watcher, store) = watcher(&temp_dir);
        assert_eq!(watcher.load_now().unwrap(), 1);
        assert_eq!(store.snapshot().len(), 1);

        // Nothing changed since the load
        assert!(!watcher.poll());
    }

    #[test]
    fn initial_load_errors_are_returned() {
        let temp_dir = TempDir::new().unwrap();
        let (mut watcher, _) = watcher(&temp_dir);
        assert!(matches!(
            watcher.load_now(),
            Err(RulesFileError::Read { .. })
        ));

        std::fs::write(temp_dir.path().join("rules.json"), r#"{"respond": {}}"#).unwrap();
        assert!(matches!(watcher.load_now(), Err(RulesFileError::Rule(_))));
    }

    #[test]
    fn reloads_on_change_and_keeps_rules_on_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("rules.json");
        std::fs::write(&path, r#"["/a", {"respond": {"body": "a"}}]"#).unwrap();

        let (mut watcher, store) = watcher(&temp_dir);
        watcher.load_now().unwrap();

        std::fs::write(
            &path,
            r#"["/a", {"respond": {"body": "a"}}, "/b", {"respond": {"body": "b"}}]"#,
        )
        .unwrap();
        assert!(watcher.poll());
        assert_eq!(store.snapshot().len(), 2);

        std::fs::write(&path, "[ not json").unwrap();
        assert!(!watcher.poll());
        assert_eq!(store.snapshot().len(), 2);

        std::fs::remove_file(&path).unwrap();
        assert!(!watcher.poll());
        assert_eq!(store.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn background_task_picks_up_changes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("rules.json");
        std::fs::write(&path, "[]").unwrap();

        let (mut watcher, store) = watcher(&temp_dir);
        watcher.load_now().unwrap();
        let handle = watcher.spawn();

        std::fs::write(&path, r#"["/a", {"passthrough": true}]"#).unwrap();

        let mut reloaded = false;
        for _ in 0..100 {
            if store.snapshot().len() == 1 {
                reloaded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();
        assert!(reloaded);
    }
}
