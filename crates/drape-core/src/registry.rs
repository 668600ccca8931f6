//! Model Resource Manager — lazy load, cache, evict, memoized failure.
//!
//! Heavy backend artifacts are cached behind `(name, device)` keys.  At most
//! one load is in flight per key: concurrent callers await the same cell and
//! observe the single outcome.  A failed load is memoized in the cell and
//! never retried until the key is explicitly evicted — load failures are
//! permanent for the process lifetime, by policy.
//!
//! The registry is injected wherever models are needed (never referenced as
//! a module-level singleton), which keeps backend substitution and mocking
//! tractable in tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::backend::LoadState;
use crate::device::{DeviceClass, DeviceInventory};
use crate::error::{Result, TryOnError};

/// Opaque handle to a loaded model artifact.  The registry owns lifetime
/// and identity; consumers downcast as needed.
pub type ModelHandle = Arc<dyn std::any::Any + Send + Sync>;

/// Performs the actual (expensive) load of a named artifact onto a device.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, name: &str, device: DeviceClass) -> Result<ModelHandle>;
}

/// Cache key: artifact name plus the device it is resident on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub name: String,
    pub device: DeviceClass,
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.device)
    }
}

/// One row of a [`ModelRegistry::status`] snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct ModelStatus {
    pub name: String,
    pub device: DeviceClass,
    pub state: LoadState,
}

type LoadOutcome = std::result::Result<ModelHandle, String>;

struct Entry {
    cell: Arc<OnceCell<LoadOutcome>>,
    state: LoadState,
}

impl Entry {
    fn fresh() -> Entry {
        Entry {
            cell: Arc::new(OnceCell::new()),
            state: LoadState::Unloaded,
        }
    }
}

/// Process-wide cache of loaded model artifacts.
pub struct ModelRegistry {
    loader: Arc<dyn ModelLoader>,
    inventory: DeviceInventory,
    entries: Mutex<HashMap<ModelKey, Entry>>,
}

impl ModelRegistry {
    pub fn new(loader: Arc<dyn ModelLoader>, inventory: DeviceInventory) -> ModelRegistry {
        ModelRegistry {
            loader,
            inventory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a backend's device preference against the probed inventory.
    pub fn pin(&self, preferred: DeviceClass) -> DeviceClass {
        self.inventory.pin(preferred)
    }

    /// Pre-create an `Unloaded` entry so `status()` reports the key before
    /// the first load attempt.
    pub fn register(&self, name: &str, device: DeviceClass) {
        let key = ModelKey { name: name.to_string(), device };
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .entry(key)
            .or_insert_with(Entry::fresh);
    }

    /// Return the cached handle, or perform the load.
    ///
    /// Exactly one load runs per key regardless of caller concurrency; all
    /// callers observe the single outcome.  A memoized failure is returned
    /// as [`TryOnError::ModelLoad`] without retrying.
    pub async fn get_or_load(&self, name: &str, device: DeviceClass) -> Result<ModelHandle> {
        let key = ModelKey { name: name.to_string(), device };
        let cell = {
            let mut entries = self.entries.lock().expect("registry lock poisoned");
            let entry = entries.entry(key.clone()).or_insert_with(Entry::fresh);
            if entry.cell.get().is_none() {
                entry.state = LoadState::Loading;
            }
            Arc::clone(&entry.cell)
        };

        let outcome = cell
            .get_or_init(|| async {
                debug!(model = %key, "loading model");
                match self.loader.load(&key.name, key.device).await {
                    Ok(handle) => {
                        info!(model = %key, "model loaded");
                        Ok(handle)
                    }
                    Err(err) => {
                        warn!(model = %key, error = %err, "model load failed, memoizing");
                        Err(err.to_string())
                    }
                }
            })
            .await;

        {
            let mut entries = self.entries.lock().expect("registry lock poisoned");
            // An eviction may have replaced the entry while the load was in
            // flight; only record the outcome on the cell it belongs to.
            if let Some(entry) = entries.get_mut(&key)
                && Arc::ptr_eq(&entry.cell, &cell)
            {
                entry.state = if outcome.is_ok() {
                    LoadState::Loaded
                } else {
                    LoadState::Failed
                };
            }
        }

        match outcome {
            Ok(handle) => Ok(Arc::clone(handle)),
            Err(reason) => Err(TryOnError::ModelLoad {
                model: key.name,
                device,
                reason: reason.clone(),
            }),
        }
    }

    /// Release every cached handle for `name` (any device) and reset the
    /// entries to `Unloaded`.  This is the only sanctioned way to clear a
    /// memoized failure.
    pub fn evict(&self, name: &str) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        for (key, entry) in entries.iter_mut() {
            if key.name == name {
                info!(model = %key, "evicting model");
                *entry = Entry::fresh();
            }
        }
    }

    /// Release every cached handle (used under memory pressure).
    pub fn evict_all(&self) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        info!(count = entries.len(), "evicting all models");
        for entry in entries.values_mut() {
            *entry = Entry::fresh();
        }
    }

    /// Consistent snapshot of all known keys, sorted by name then device.
    pub fn status(&self) -> Vec<ModelStatus> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        let mut rows: Vec<ModelStatus> = entries
            .iter()
            .map(|(key, entry)| ModelStatus {
                name: key.name.clone(),
                device: key.device,
                state: entry.state,
            })
            .collect();
        rows.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.device.to_string().cmp(&b.device.to_string()))
        });
        rows
    }
}
