//! Application state and initialization
//!
//! This module wires the store, the services and the sync coordinator
//! together for a data directory.

use crate::database::Repository;
use crate::error::Result;
use crate::services::{AnnotationsService, NotebooksService, SettingsService, SyncSettings};
use crate::sync::{
    DocVersionProvider, HttpTransport, NoDocVersions, SyncCoordinator, SyncTransport,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name of the store inside the data directory
const DATABASE_FILE: &str = "annotations.db";

/// Central application state holding all services
#[derive(Clone)]
pub struct AppState {
    pub app_data_dir: PathBuf,
    pub repo: Repository,
    pub settings: SyncSettings,
    pub settings_service: SettingsService,
    pub annotations: AnnotationsService,
    pub notebooks: NotebooksService,
}

impl AppState {
    /// Build a coordinator that talks to the configured server.
    pub fn http_coordinator(
        &self,
        doc_versions: Arc<dyn DocVersionProvider>,
    ) -> Result<SyncCoordinator> {
        let transport = HttpTransport::from_settings(&self.settings)?;
        Ok(self.coordinator(Arc::new(transport), doc_versions))
    }

    /// Build a coordinator over any transport.
    pub fn coordinator(
        &self,
        transport: Arc<dyn SyncTransport>,
        doc_versions: Arc<dyn DocVersionProvider>,
    ) -> SyncCoordinator {
        SyncCoordinator::new(
            self.repo.clone(),
            transport,
            doc_versions,
            self.settings.grace_period(),
        )
    }

    /// Coordinator for hosts without document versions.
    pub fn default_coordinator(&self) -> Result<SyncCoordinator> {
        self.http_coordinator(Arc::new(NoDocVersions))
    }
}

/// Application setup - called once on startup
pub async fn setup(app_data_dir: &Path) -> Result<AppState> {
    tracing::info!("Initializing annotation store");
    tracing::info!("App data directory: {:?}", app_data_dir);

    std::fs::create_dir_all(app_data_dir)?;

    let settings_service = SettingsService::new(app_data_dir.to_path_buf());
    let settings = settings_service.load().await?;

    let repo = Repository::open(&app_data_dir.join(DATABASE_FILE)).await?;

    let state = AppState {
        app_data_dir: app_data_dir.to_path_buf(),
        annotations: AnnotationsService::new(repo.clone())
            .with_device(settings.device_name.clone()),
        notebooks: NotebooksService::new(repo.clone()),
        repo,
        settings,
        settings_service,
    };

    tracing::info!("Annotation store initialized successfully");

    Ok(state)
}
