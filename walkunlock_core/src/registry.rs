//! Durable list of locked apps.
//!
//! The registry is the only writer of the locked-app list. Storage problems
//! never reach callers: reads fall back to an empty list, and a failed edit
//! is reported through the [`Notifier`] while the previous list stays in
//! place both on disk and in memory.

use crate::notify::Notifier;
use crate::store::KeyValueStore;
use crate::{LockedApp, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio::task::JoinHandle;

/// Store key holding the JSON list
pub const REGISTRY_KEY: &str = "locked_apps.json";

pub struct LockedAppRegistry {
    store: Arc<dyn KeyValueStore>,
    notifier: Arc<dyn Notifier>,
    // Serializes read-modify-write cycles against the store
    edit_lock: Mutex<()>,
    apps_tx: watch::Sender<Vec<LockedApp>>,
}

impl LockedAppRegistry {
    pub fn open(store: Arc<dyn KeyValueStore>, notifier: Arc<dyn Notifier>) -> Self {
        let apps = list_or_empty(store.as_ref());
        tracing::info!("Loaded {} locked apps", apps.len());
        let (apps_tx, _) = watch::channel(apps);

        Self {
            store,
            notifier,
            edit_lock: Mutex::new(()),
            apps_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.edit_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read the list from durable storage
    pub fn list(&self) -> Vec<LockedApp> {
        list_or_empty(self.store.as_ref())
    }

    /// Look up one app in the last published list
    pub fn get(&self, app_id: &str) -> Option<LockedApp> {
        self.apps_tx
            .borrow()
            .iter()
            .find(|app| app.app_id == app_id)
            .cloned()
    }

    /// Live view of the full list, updated on every successful edit
    pub fn changes(&self) -> watch::Receiver<Vec<LockedApp>> {
        self.apps_tx.subscribe()
    }

    /// Insert `app`, replacing any entry with the same id
    ///
    /// Returns false if the edit could not be stored.
    pub fn add(&self, app: LockedApp) -> bool {
        let app_id = app.app_id.clone();
        let applied = self.edit(|apps| {
            apps.retain(|existing| existing.app_id != app.app_id);
            apps.push(app.clone());
            true
        });

        match applied {
            Ok(()) => {
                tracing::info!(app = %app_id, "Locked app added");
                true
            }
            Err(e) => {
                tracing::error!(app = %app_id, "Failed to add locked app: {}", e);
                self.notifier
                    .on_notice(&format!("Error adding locked app: {}", app_id));
                false
            }
        }
    }

    /// Remove the entry for `app_id`; absent ids are a no-op
    pub fn remove(&self, app_id: &str) -> bool {
        let applied = self.edit(|apps| {
            let before = apps.len();
            apps.retain(|existing| existing.app_id != app_id);
            apps.len() != before
        });

        match applied {
            Ok(()) => {
                tracing::info!(app = %app_id, "Locked app removed");
                true
            }
            Err(e) => {
                tracing::error!(app = %app_id, "Failed to remove locked app: {}", e);
                self.notifier
                    .on_notice(&format!("Error removing locked app: {}", app_id));
                false
            }
        }
    }

    /// Drop every entry
    pub fn clear(&self) -> bool {
        let _guard = self.lock();
        match self.store.remove(REGISTRY_KEY) {
            Ok(()) => {
                self.publish(Vec::new());
                tracing::info!("Locked apps cleared");
                true
            }
            Err(e) => {
                tracing::error!("Failed to clear locked apps: {}", e);
                self.notifier.on_notice("Error clearing locked apps");
                false
            }
        }
    }

    /// Re-read storage and publish the list if it changed
    pub fn refresh(&self) {
        let _guard = self.lock();
        self.publish(self.list());
    }

    /// Keep this registry in sync with edits made through other handles on the same store
    pub fn follow_store(self: &Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.store.subscribe();
        let registry = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(key) if key != REGISTRY_KEY => continue,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Store change feed lagged; refreshing");
                    }
                    Err(RecvError::Closed) => break,
                }

                match registry.upgrade() {
                    Some(registry) => registry.refresh(),
                    None => break,
                }
            }
            tracing::debug!("Registry store follower stopped");
        })
    }

    /// Apply `f` to the freshly stored list and write it back if `f` reports
    /// a change; runs under the store's key lock so other handles' edits survive
    fn edit<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Vec<LockedApp>) -> bool,
    {
        let _guard = self.lock();
        let mut fresh = None;

        self.store
            .update(REGISTRY_KEY, &mut |bytes: Option<&[u8]>| {
                let mut apps = decode_apps(bytes);
                let changed = f(&mut apps);
                let encoded = if changed {
                    Some(serde_json::to_vec(&apps)?)
                } else {
                    None
                };
                fresh = Some(apps);
                Ok(encoded)
            })?;

        if let Some(apps) = fresh {
            self.publish(apps);
        }
        Ok(())
    }

    fn publish(&self, apps: Vec<LockedApp>) {
        self.apps_tx.send_if_modified(|current| {
            if *current == apps {
                false
            } else {
                *current = apps;
                true
            }
        });
    }
}

/// Read the stored list. Unparseable contents count as an empty list;
/// only store I/O failures are errors.
fn read_apps(store: &dyn KeyValueStore) -> Result<Vec<LockedApp>> {
    Ok(decode_apps(store.get(REGISTRY_KEY)?.as_deref()))
}

fn decode_apps(bytes: Option<&[u8]>) -> Vec<LockedApp> {
    let Some(bytes) = bytes else {
        return Vec::new();
    };

    match serde_json::from_slice::<Vec<LockedApp>>(bytes) {
        Ok(apps) => apps,
        Err(e) => {
            tracing::warn!("Failed to parse locked apps: {}. Treating as empty.", e);
            Vec::new()
        }
    }
}

fn list_or_empty(store: &dyn KeyValueStore) -> Vec<LockedApp> {
    read_apps(store).unwrap_or_else(|e| {
        tracing::warn!("Failed to read locked apps: {}. Treating as empty.", e);
        Vec::new()
    })
}
