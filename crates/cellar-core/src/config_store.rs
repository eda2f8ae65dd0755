//! Node-local configuration store.
//!
//! Holds flat string properties per PID, optionally persisted as one JSON file
//! per PID, and notifies watchers when a PID changes so that runtime edits take
//! effect without a restart.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;

/// Flat properties of one PID.
pub type Properties = BTreeMap<String, String>;

/// Kind of change applied to a PID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigChangeKind {
    /// Properties were created or replaced.
    Updated,
    /// The PID was removed.
    Deleted,
}

/// Notification sent to watchers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigChange {
    /// PID that changed.
    pub pid: String,
    /// What happened to it.
    pub kind: ConfigChangeKind,
    /// Store version after the change.
    pub version: u64,
}

struct ConfigWatcher {
    pids: Option<Vec<String>>,
    sender: mpsc::UnboundedSender<ConfigChange>,
}

impl ConfigWatcher {
    fn matches(&self, pid: &str) -> bool {
        match &self.pids {
            Some(pids) => pids.iter().any(|p| p == pid),
            None => true,
        }
    }
}

/// Thread-safe PID store shared by every component of a node.
pub struct ConfigStore {
    pids: RwLock<HashMap<String, Properties>>,
    dir: Option<PathBuf>,
    watchers: Mutex<Vec<ConfigWatcher>>,
    version: AtomicU64,
}

impl ConfigStore {
    /// Creates a store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            pids: RwLock::new(HashMap::new()),
            dir: None,
            watchers: Mutex::new(Vec::new()),
            version: AtomicU64::new(0),
        }
    }

    /// Opens a store persisted under `dir`, loading every `<pid>.json` found.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut pids = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(pid) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Properties>(&contents) {
                Ok(props) => {
                    pids.insert(pid.to_string(), props);
                }
                Err(e) => {
                    warn!(pid, error = %e, "skipping unreadable configuration file");
                }
            }
        }
        debug!(dir = %dir.display(), count = pids.len(), "configuration store loaded");
        Ok(Self {
            pids: RwLock::new(pids),
            dir: Some(dir.to_path_buf()),
            watchers: Mutex::new(Vec::new()),
            version: AtomicU64::new(0),
        })
    }

    /// Returns a copy of the properties of a PID.
    pub fn get(&self, pid: &str) -> Option<Properties> {
        self.pids.read().get(pid).cloned()
    }

    /// Returns one property of a PID.
    pub fn get_property(&self, pid: &str, key: &str) -> Option<String> {
        self.pids.read().get(pid).and_then(|p| p.get(key).cloned())
    }

    /// Replaces the properties of a PID. Returns false if nothing changed.
    pub fn update(&self, pid: &str, props: Properties) -> Result<bool> {
        {
            let mut pids = self.pids.write();
            if pids.get(pid) == Some(&props) {
                return Ok(false);
            }
            self.persist(pid, &props)?;
            pids.insert(pid.to_string(), props);
        }
        self.notify(pid, ConfigChangeKind::Updated);
        Ok(true)
    }

    /// Sets a single property, creating the PID if needed.
    pub fn set_property(&self, pid: &str, key: &str, value: &str) -> Result<bool> {
        self.modify(pid, |props| {
            props.insert(key.to_string(), value.to_string());
        })
    }

    /// Merges properties into a PID, leaving other keys alone.
    pub fn merge(&self, pid: &str, values: Properties) -> Result<bool> {
        self.modify(pid, |props| props.extend(values))
    }

    /// Edits a PID in place under the write lock. Returns false if nothing
    /// changed.
    pub fn modify<F>(&self, pid: &str, edit: F) -> Result<bool>
    where
        F: FnOnce(&mut Properties),
    {
        {
            let mut pids = self.pids.write();
            let current = pids.get(pid);
            let mut props = current.cloned().unwrap_or_default();
            edit(&mut props);
            if current == Some(&props) {
                return Ok(false);
            }
            self.persist(pid, &props)?;
            pids.insert(pid.to_string(), props);
        }
        self.notify(pid, ConfigChangeKind::Updated);
        Ok(true)
    }

    /// Removes a PID. Returns true if it existed.
    pub fn delete(&self, pid: &str) -> Result<bool> {
        let removed = {
            let mut pids = self.pids.write();
            let removed = pids.remove(pid).is_some();
            if removed {
                if let Some(dir) = &self.dir {
                    let path = dir.join(format!("{}.json", pid));
                    if path.exists() {
                        std::fs::remove_file(path)?;
                    }
                }
            }
            removed
        };
        if removed {
            self.notify(pid, ConfigChangeKind::Deleted);
        }
        Ok(removed)
    }

    /// Every PID currently stored, sorted.
    pub fn pids(&self) -> Vec<String> {
        let mut pids: Vec<String> = self.pids.read().keys().cloned().collect();
        pids.sort();
        pids
    }

    /// Subscribes to changes of the given PIDs, or of every PID when `None`.
    pub fn watch(&self, pids: Option<Vec<String>>) -> mpsc::UnboundedReceiver<ConfigChange> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.watchers.lock().push(ConfigWatcher { pids, sender });
        receiver
    }

    /// Number of changes applied since the store was created.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn persist(&self, pid: &str, props: &Properties) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = dir.join(format!("{}.json", pid));
        let tmp = dir.join(format!("{}.json.tmp", pid));
        std::fs::write(&tmp, serde_json::to_vec_pretty(props)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn notify(&self, pid: &str, kind: ConfigChangeKind) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let change = ConfigChange {
            pid: pid.to_string(),
            kind,
            version,
        };
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| !w.matches(pid) || w.sender.send(change.clone()).is_ok());
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
