// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File-backed shared store: one file per key under a shared directory.
//!
//! Writes are atomic (unique tmp file, then rename) so a concurrent reader
//! never observes a torn value. Cross-process change notification comes from
//! a `notify` watcher on the directory; same-process writes additionally
//! push the key directly so notification works even where fs events don't.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use super::{ChangeNotifier, KeyValueStore};

pub struct FileStore {
    dir: PathBuf,
    change_tx: broadcast::Sender<String>,
    /// Watcher handle, kept alive for the store's lifetime.
    _watcher: Option<notify::RecommendedWatcher>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Arc<Self>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (change_tx, _) = broadcast::channel(64);
        let watcher = setup_watcher(&dir, change_tx.clone());
        if watcher.is_none() {
            tracing::warn!(dir = %dir.display(), "file watcher unavailable, cross-process updates will not be observed");
        }
        Ok(Arc::new(Self { dir, change_tx, _watcher: watcher }))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(s) => Some(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(key, err = %e, "failed to read store file");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        // Unique temp filename (PID + counter): concurrent saves racing on
        // one `.tmp` file can leave trailing bytes from a longer write.
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        let path = self.path_for(key);
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_file_name(format!("{key}.{}.{seq}.tmp", std::process::id()));
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        let _ = self.change_tx.send(key.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => {
                let _ = self.change_tx.send(key.to_owned());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl ChangeNotifier for FileStore {
    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.change_tx.subscribe()
    }
}

/// Watch `dir` and forward changed keys. Returns the watcher handle (must be
/// kept alive) or `None` when watching isn't available on this platform.
fn setup_watcher(
    dir: &Path,
    change_tx: broadcast::Sender<String>,
) -> Option<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let Ok(event) = res else { return };
        for path in event.paths {
            if let Some(key) = key_from_path(&path) {
                let _ = change_tx.send(key);
            }
        }
    })
    .ok()?;

    watcher.watch(dir, RecursiveMode::NonRecursive).ok()?;
    Some(watcher)
}

/// Map a store file path back to its key. Temp files don't name keys.
fn key_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.ends_with(".tmp") {
        return None;
    }
    name.strip_suffix(".json").map(str::to_owned)
}
