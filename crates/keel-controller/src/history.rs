//! Append-only sync history per application, durable across restarts, and
//! the rollback lookups built on it.

use std::collections::HashMap;

use keel_core::models::{Application, HistoryEntry, Initiator, SyncResult, SyncSummary};
use keel_storage::FileStore;
use keel_storage::state::{load_state_opt, save_state};
use tokio::sync::Mutex;

use crate::error::ControllerError;

pub struct HistoryStore {
    store: FileStore,
    limit: usize,
    /// Loaded lazily per application; the lock also serializes appends.
    entries: Mutex<HashMap<String, Vec<HistoryEntry>>>,
}

fn history_key(app: &str) -> String {
    format!("history/{app}.json")
}

impl HistoryStore {
    pub fn new(store: FileStore, limit: usize) -> Self {
        Self {
            store,
            limit: limit.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn load<'a>(
        &self,
        cache: &'a mut HashMap<String, Vec<HistoryEntry>>,
        app: &str,
    ) -> Result<&'a mut Vec<HistoryEntry>, ControllerError> {
        if !cache.contains_key(app) {
            let loaded: Vec<HistoryEntry> = load_state_opt(&self.store, &history_key(app))
                .await?
                .unwrap_or_default();
            cache.insert(app.to_string(), loaded);
        }
        Ok(cache.entry(app.to_string()).or_default())
    }

    /// Record a completed sync. Entries beyond the retention limit are
    /// dropped oldest-first.
    pub async fn append(
        &self,
        app: &Application,
        result: &SyncResult,
        initiated_by: Initiator,
    ) -> Result<HistoryEntry, ControllerError> {
        let mut cache = self.entries.lock().await;
        let entries = self.load(&mut cache, &app.name).await?;

        let entry = HistoryEntry {
            id: entries.last().map_or(1, |e| e.id + 1),
            revision: result.revision.clone(),
            source: app.source.clone(),
            deployed_at: result.finished_at,
            initiated_by,
            summary: SyncSummary::from(result),
        };
        entries.push(entry.clone());
        if entries.len() > self.limit {
            let excess = entries.len() - self.limit;
            entries.drain(..excess);
        }

        save_state(&self.store, &history_key(&app.name), &*entries).await?;
        tracing::debug!(app = %app.name, id = entry.id, revision = %entry.revision, "history appended");
        Ok(entry)
    }

    /// Retained entries, oldest first.
    pub async fn list(&self, app: &str) -> Result<Vec<HistoryEntry>, ControllerError> {
        let mut cache = self.entries.lock().await;
        Ok(self.load(&mut cache, app).await?.clone())
    }

    /// Most recent retained entry that deployed `revision`.
    pub async fn find_revision(
        &self,
        app: &str,
        revision: &str,
    ) -> Result<HistoryEntry, ControllerError> {
        let mut cache = self.entries.lock().await;
        self.load(&mut cache, app)
            .await?
            .iter()
            .rev()
            .find(|e| e.revision == revision)
            .cloned()
            .ok_or_else(|| ControllerError::RevisionNotFound {
                revision: revision.to_string(),
            })
    }

    pub async fn remove(&self, app: &str) -> Result<(), ControllerError> {
        let mut cache = self.entries.lock().await;
        cache.remove(app);
        self.store.delete_object(&history_key(app)).await?;
        Ok(())
    }
}
