//! The application registry: specs plus reconciliation state, persisted under
//! the controller's state directory.
//!
//! Passed explicitly to every loop; nothing here is process-global.

use std::collections::BTreeMap;

use keel_core::models::{Application, ApplicationState, ApplicationStatus};
use keel_storage::FileStore;
use keel_storage::state::{load_state, load_state_opt, save_state};
use tokio::sync::RwLock;

use crate::error::ControllerError;

const APPS_PREFIX: &str = "apps";
const STATE_PREFIX: &str = "state";

fn app_key(name: &str) -> String {
    format!("{APPS_PREFIX}/{name}.json")
}

fn state_key(name: &str) -> String {
    format!("{STATE_PREFIX}/{name}.json")
}

struct Record {
    app: Application,
    state: ApplicationState,
}

pub struct ApplicationStore {
    store: FileStore,
    records: RwLock<BTreeMap<String, Record>>,
}

impl ApplicationStore {
    pub fn new(store: FileStore) -> Self {
        Self {
            store,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    /// Load every persisted application and its last known state.
    pub async fn load(&self) -> Result<Vec<Application>, ControllerError> {
        let mut loaded = BTreeMap::new();
        for key in self.store.list_objects(APPS_PREFIX).await? {
            let app: Application = load_state(&self.store, &key).await?;
            let state: ApplicationState = load_state_opt(&self.store, &state_key(&app.name))
                .await?
                .unwrap_or_default();
            loaded.insert(app.name.clone(), Record { app, state });
        }

        let apps: Vec<Application> = loaded.values().map(|r| r.app.clone()).collect();
        *self.records.write().await = loaded;
        tracing::info!(applications = apps.len(), "application store loaded");
        Ok(apps)
    }

    pub async fn insert(&self, app: Application) -> Result<(), ControllerError> {
        let mut records = self.records.write().await;
        if records.contains_key(&app.name) {
            return Err(ControllerError::ApplicationExists(app.name));
        }
        save_state(&self.store, &app_key(&app.name), &app).await?;
        records.insert(
            app.name.clone(),
            Record {
                app,
                state: ApplicationState::default(),
            },
        );
        Ok(())
    }

    /// Replace an application's spec. Its reconciliation state is kept.
    pub async fn update(&self, app: Application) -> Result<(), ControllerError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&app.name)
            .ok_or_else(|| ControllerError::ApplicationNotFound(app.name.clone()))?;
        save_state(&self.store, &app_key(&app.name), &app).await?;
        record.app = app;
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<Application, ControllerError> {
        let mut records = self.records.write().await;
        let record = records
            .remove(name)
            .ok_or_else(|| ControllerError::ApplicationNotFound(name.to_string()))?;
        self.store.delete_object(&app_key(name)).await?;
        self.store.delete_object(&state_key(name)).await?;
        Ok(record.app)
    }

    pub async fn get(&self, name: &str) -> Result<Application, ControllerError> {
        self.records
            .read()
            .await
            .get(name)
            .map(|r| r.app.clone())
            .ok_or_else(|| ControllerError::ApplicationNotFound(name.to_string()))
    }

    pub async fn list(&self) -> Vec<Application> {
        self.records
            .read()
            .await
            .values()
            .map(|r| r.app.clone())
            .collect()
    }

    pub async fn state(&self, name: &str) -> Result<ApplicationState, ControllerError> {
        self.records
            .read()
            .await
            .get(name)
            .map(|r| r.state.clone())
            .ok_or_else(|| ControllerError::ApplicationNotFound(name.to_string()))
    }

    pub async fn status(&self, name: &str) -> Result<ApplicationStatus, ControllerError> {
        Ok(self.state(name).await?.status())
    }

    /// Mutate an application's state and persist it. Logs status transitions.
    pub async fn update_state<R>(
        &self,
        name: &str,
        mutate: impl FnOnce(&mut ApplicationState) -> R,
    ) -> Result<R, ControllerError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(name)
            .ok_or_else(|| ControllerError::ApplicationNotFound(name.to_string()))?;

        let before = record.state.status();
        let out = mutate(&mut record.state);
        let after = record.state.status();
        if before != after {
            tracing::info!(app = %name, from = %before, to = %after, "status changed");
        }

        save_state(&self.store, &state_key(name), &record.state).await?;
        Ok(out)
    }
}
