//! Services module
//!
//! Business logic services that sit between the host application and
//! the repository.

pub mod annotations;
pub mod lifecycle;
pub mod notebooks;
pub mod settings;

pub use annotations::AnnotationsService;
pub use notebooks::NotebooksService;
pub use settings::{RetrySettings, SettingsService, SyncSettings};
