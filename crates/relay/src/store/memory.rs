// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process shared store.
//!
//! Share one instance via `Arc` between relay handles to simulate multiple
//! clients of a session inside a single process; also the test vehicle for
//! every cross-client scenario.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use super::{ChangeNotifier, KeyValueStore};

pub struct MemoryStore {
    map: parking_lot::Mutex<HashMap<String, String>>,
    change_tx: broadcast::Sender<String>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        let (change_tx, _) = broadcast::channel(64);
        Arc::new(Self { map: parking_lot::Mutex::new(HashMap::new()), change_tx })
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.map.lock().insert(key.to_owned(), value.to_owned());
        let _ = self.change_tx.send(key.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        if self.map.lock().remove(key).is_some() {
            let _ = self.change_tx.send(key.to_owned());
        }
        Ok(())
    }
}

impl ChangeNotifier for MemoryStore {
    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.change_tx.subscribe()
    }
}
